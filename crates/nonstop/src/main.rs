//! Nonstop - fault-tolerant job manipulation service for SLURM.

mod client;
mod polling;
mod watcher;

use camino::Utf8Path;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use nix::unistd::geteuid;
use nonstop_cli::{Args, Commands};
use nonstop_config::{Config, SystemUsers, UserLookup};
use nonstop_server::{
    HmacSealer, Nonstop, Saver, Sealer, Server, StateTask, StateTaskConfig, restore,
};
use nonstop_slurm::{Scheduler, SchedulerEvents, ScontrolScheduler};
use nonstop_state::StateStore;
use polling::{EventPoller, PollingConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use watcher::ConfigWatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Commands::Serve {
            state_dir,
            ignore_state_errors,
            poll_interval,
        } => serve(&args, state_dir, *ignore_state_errors, *poll_interval).await,
        _ => client::run(&args).await,
    }
}

/// `Debug` in the config sets the default level; `RUST_LOG` overrides it.
fn init_tracing(config: &Config) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .init();
}

async fn serve(
    args: &Args,
    state_dir: &Utf8Path,
    ignore_state_errors: bool,
    poll_interval: u64,
) -> Result<()> {
    let users: Arc<dyn UserLookup> = Arc::new(SystemUsers);
    let config = Config::load(&args.config, users.as_ref()).into_diagnostic()?;
    init_tracing(&config);
    tracing::info!("Nonstop starting");

    let scheduler: Arc<dyn Scheduler> = Arc::new(ScontrolScheduler::new());
    let config = watcher::known_partitions_only(config, scheduler.as_ref()).await;
    let sealer: Arc<dyn Sealer> =
        Arc::new(HmacSealer::from_key_file(&args.auth_key).into_diagnostic()?);

    let store = StateStore::new(state_dir);
    let records = restore(&store, scheduler.as_ref(), ignore_state_errors)
        .await
        .into_diagnostic()?;
    let port = config.port;
    let svc = Arc::new(
        Nonstop::new(config, scheduler.clone(), geteuid().as_raw()).with_records(records),
    );

    let server = Server::bind(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        svc.clone(),
        sealer,
    )
    .await
    .into_diagnostic()?;

    let cancel = CancellationToken::new();
    let state_task = StateTask::new(
        svc.clone(),
        Saver::new(store),
        StateTaskConfig::default(),
    )
    .start(cancel.clone());

    let events: Arc<dyn SchedulerEvents> = svc.clone();
    let poller = EventPoller::new(
        scheduler,
        events,
        PollingConfig {
            poll_interval: Duration::from_secs(poll_interval),
        },
    )
    .start(cancel.clone());

    let config_watcher = ConfigWatcher::new(&args.config)?;
    let watch_task = tokio::spawn(config_watcher.run(svc.clone(), users, cancel.clone()));

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        cancel_on_signal.cancel();
    });

    server.run(cancel).await;
    for (name, task) in [
        ("poller", poller),
        ("config watcher", watch_task),
        ("state task", state_task),
    ] {
        if let Err(e) = task.await {
            tracing::error!("The {} ended abnormally: {}", name, e);
        }
    }
    tracing::info!("Nonstop stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
