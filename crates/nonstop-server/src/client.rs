//! Client side of the request protocol.

use crate::auth::{AuthError, Sealer};
use crate::protocol::{Command, ProtocolError, Reply};
use crate::wire::{WireError, read_frame, write_frame};
use nonstop_config::Config;
use nonstop_slurm::JobId;
use nonstop_state::EventFlags;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("Failed to seal request: {0}")]
    Auth(#[from] AuthError),
    #[error("Transport error: {0}")]
    Wire(#[from] WireError),
    #[error("Reply is not UTF-8")]
    Utf8,
    #[error("Bad reply: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Sends sealed commands to the daemon, trying `ControlAddr` first and
/// `BackupAddr` if the control host cannot be reached.
pub struct Client {
    hosts: Vec<String>,
    port: u16,
    read_timeout: Duration,
    write_timeout: Duration,
    sealer: Arc<dyn Sealer>,
    uid: u32,
}

impl Client {
    pub fn new(config: &Config, sealer: Arc<dyn Sealer>, uid: u32) -> Self {
        let mut hosts = vec![config.control_addr.clone()];
        hosts.extend(config.backup_addr.clone());
        Self {
            hosts,
            port: config.port,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            sealer,
            uid,
        }
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        let mut last = None;
        for host in &self.hosts {
            let addr = format!("{}:{}", host, self.port);
            match timeout(self.write_timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(source)) => {
                    tracing::debug!("Failed to connect to {}: {}", addr, source);
                    last = Some(ClientError::Connect { addr, source });
                }
                Err(_) => {
                    tracing::debug!("Timed out connecting to {}", addr);
                    last = Some(ClientError::ConnectTimeout(addr));
                }
            }
        }
        Err(last.unwrap_or_else(|| ClientError::ConnectTimeout(String::new())))
    }

    /// Send one command and return the daemon's reply. Error replies are
    /// returned as `Ok`; inspect [`Reply::code`].
    pub async fn send(&self, command: &Command) -> Result<Reply, ClientError> {
        let blob = self.sealer.seal(self.uid, &command.to_wire())?;
        let mut stream = self.connect().await?;
        write_frame(&mut stream, blob.as_bytes(), self.write_timeout).await?;
        let payload = read_frame(&mut stream, self.read_timeout).await?;
        let text = String::from_utf8(payload).map_err(|_| ClientError::Utf8)?;
        Ok(Reply::parse(&text)?)
    }

    pub async fn show_config(&self) -> Result<Reply, ClientError> {
        self.send(&Command::ShowConfig).await
    }

    pub async fn show_job(&self, job_id: JobId) -> Result<Reply, ClientError> {
        self.send(&Command::ShowJob { job_id }).await
    }

    pub async fn fail_nodes(&self, job_id: JobId, state_flags: u32) -> Result<Reply, ClientError> {
        self.send(&Command::GetFailNodes {
            job_id,
            state_flags,
        })
        .await
    }

    pub async fn drop_node(&self, job_id: JobId, node: &str) -> Result<Reply, ClientError> {
        self.send(&Command::DropNode {
            job_id,
            node: node.to_string(),
        })
        .await
    }

    pub async fn replace_node(&self, job_id: JobId, node: &str) -> Result<Reply, ClientError> {
        self.send(&Command::ReplaceNode {
            job_id,
            node: node.to_string(),
        })
        .await
    }

    pub async fn time_incr(&self, job_id: JobId, minutes: u32) -> Result<Reply, ClientError> {
        self.send(&Command::TimeIncr { job_id, minutes }).await
    }

    pub async fn drain(&self, nodes: &str, reason: &str) -> Result<Reply, ClientError> {
        self.send(&Command::Drain {
            nodes: nodes.to_string(),
            reason: reason.to_string(),
        })
        .await
    }

    /// Subscribe `port` on this host to the job's events.
    pub async fn callback(&self, job_id: JobId, port: u16) -> Result<Reply, ClientError> {
        self.send(&Command::Callback {
            job_id,
            port: u32::from(port),
        })
        .await
    }
}

/// Wait for one event notification on a subscribed listener.
pub async fn receive_event(listener: &TcpListener) -> std::io::Result<(SocketAddr, EventFlags)> {
    let (mut stream, from) = listener.accept().await?;
    let bits = stream.read_u32().await?;
    Ok((from, EventFlags::from_bits(bits)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HmacSealer;
    use crate::notifier::send_callbacks;
    use crate::protocol::ErrorCode;
    use crate::server::Server;
    use crate::service::test_support::*;
    use tokio_util::sync::CancellationToken;

    const KEY: &[u8] = b"client-key";

    async fn start_server(svc: Arc<crate::service::Nonstop>) -> (u16, CancellationToken) {
        let sealer: Arc<dyn Sealer> = Arc::new(HmacSealer::new(KEY).unwrap());
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), svc, sealer)
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (port, cancel)
    }

    fn client(port: u16, backup: Option<&str>, uid: u32) -> Client {
        let config = nonstop_config::Config {
            port,
            backup_addr: backup.map(str::to_string),
            ..config()
        };
        Client::new(&config, Arc::new(HmacSealer::new(KEY).unwrap()), uid)
    }

    #[tokio::test]
    async fn test_drop_and_time_incr() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;
        let (port, cancel) = start_server(svc).await;
        let client = client(port, None, OWNER);

        let reply = client.drop_node(job, "nid10").await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.value("NewNodeList"), Some("nid11"));
        assert_eq!(reply.value("NewNodeCount"), Some("1"));

        let reply = client.time_incr(job, 0).await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(sim.job(job).unwrap().time_limit, Some(67));

        let reply = client.time_incr(job, 0).await.unwrap();
        assert_eq!(reply.code, ErrorCode::NoIncreaseTimeLimit);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_other_user_rejected() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10"], Some(60), None);
        let (port, cancel) = start_server(svc).await;

        let reply = client(port, None, OTHER).show_job(job).await.unwrap();
        assert_eq!(reply.code, ErrorCode::Perm);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_backup_used_when_control_unreachable() {
        let sim = cluster();
        let svc = service(&sim, config());
        let (port, cancel) = start_server(svc).await;
        let mut client = client(port, Some("127.0.0.1"), OWNER);
        // The server only listens on 127.0.0.1
        client.hosts[0] = "127.0.0.2".to_string();

        let reply = client.show_config().await.unwrap();
        assert!(reply.is_ok());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        let (port, cancel) = start_server(svc.clone()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let events_port = listener.local_addr().unwrap().port();

        let reply = client(port, None, OWNER)
            .callback(job, events_port)
            .await
            .unwrap();
        assert!(reply.is_ok());

        sim.set_node_down("nid11").await;
        let receiver = tokio::spawn(async move { receive_event(&listener).await.unwrap() });
        assert_eq!(send_callbacks(&svc).await, 1);
        let (_, flags) = receiver.await.unwrap();
        assert_eq!(flags, EventFlags::NODE_FAILED);
        cancel.cancel();
    }
}
