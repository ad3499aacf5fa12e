//! Client subcommands: send one request to the daemon and print the reply.

use miette::{IntoDiagnostic, Result, miette};
use nix::unistd::getuid;
use nonstop_cli::{Args, Commands};
use nonstop_config::{Config, SystemUsers};
use nonstop_server::{Client, HmacSealer, Reply, receive_event};
use nonstop_slurm::JobId;
use std::sync::Arc;
use tokio::net::TcpListener;

pub async fn run(args: &Args) -> Result<()> {
    let config = Config::load(&args.config, &SystemUsers).into_diagnostic()?;
    let sealer = Arc::new(HmacSealer::from_key_file(&args.auth_key).into_diagnostic()?);
    let client = Client::new(&config, sealer, getuid().as_raw());

    let reply = match &args.command {
        Commands::Serve { .. } => return Err(miette!("serve is not a client command")),
        Commands::ShowConfig => client.show_config().await,
        Commands::ShowJob { job_id } => client.show_job(*job_id).await,
        Commands::FailNodes {
            job_id,
            state_flags,
        } => client.fail_nodes(*job_id, *state_flags).await,
        Commands::DropNode { job_id, node } => client.drop_node(*job_id, node).await,
        Commands::ReplaceNode { job_id, node } => client.replace_node(*job_id, node).await,
        Commands::TimeIncr { job_id, minutes } => client.time_incr(*job_id, *minutes).await,
        Commands::Drain { nodes, reason } => client.drain(nodes, reason).await,
        Commands::Callback { job_id, port } => {
            return subscribe(&client, *job_id, *port, args.json).await;
        }
    }
    .into_diagnostic()?;

    print_reply(&reply, args.json)?;
    if reply.is_ok() {
        Ok(())
    } else {
        Err(miette!("Request failed: {}", reply.code))
    }
}

fn print_reply(reply: &Reply, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reply).into_diagnostic()?);
    } else {
        println!("{}", reply.code);
        // Replies are either `key value` pairs or `Key=Value` settings
        if reply.tokens.iter().all(|t| t.contains('=')) {
            for token in &reply.tokens {
                println!("  {}", token);
            }
        } else {
            for pair in reply.tokens.chunks(2) {
                println!("  {}", pair.join(" "));
            }
        }
    }
    Ok(())
}

/// Subscribe a local listener to the job's events and print each one until
/// interrupted.
async fn subscribe(client: &Client, job_id: JobId, port: u16, json: bool) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .into_diagnostic()?;
    let port = listener.local_addr().into_diagnostic()?.port();

    let reply = client.callback(job_id, port).await.into_diagnostic()?;
    if !reply.is_ok() {
        print_reply(&reply, json)?;
        return Err(miette!("Request failed: {}", reply.code));
    }
    eprintln!("Listening for events of job {} on port {}", job_id, port);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = receive_event(&listener) => match event {
                Ok((from, flags)) => println!("{} {}", from.ip(), flags),
                Err(e) => tracing::warn!("Failed to read event: {}", e),
            },
        }
    }
}
