//! TCP request server: one task per connection, one request per connection.

use crate::auth::Sealer;
use crate::protocol::{ErrorCode, Reply};
use crate::service::Nonstop;
use crate::wire::{IO_TIMEOUT, WireError, read_frame, write_frame};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct Server {
    listener: TcpListener,
    svc: Arc<Nonstop>,
    sealer: Arc<dyn Sealer>,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        svc: Arc<Nonstop>,
        sealer: Arc<dyn Sealer>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            svc,
            sealer,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled. Connections already accepted
    /// finish on their own.
    pub async fn run(self, cancel: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => tracing::info!("Listening on {}", addr),
            Err(e) => tracing::warn!("Listening on unknown address: {}", e),
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let svc = self.svc.clone();
                        let sealer = self.sealer.clone();
                        tokio::spawn(async move {
                            let handled =
                                handle_connection(stream, peer.ip(), &svc, sealer.as_ref()).await;
                            if let Err(e) = handled {
                                tracing::debug!("Connection from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Error accepting connection: {}", e),
                },
            }
        }
        tracing::info!("Request server stopped");
    }
}

/// Serve a single request on `stream`.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: IpAddr,
    svc: &Nonstop,
    sealer: &dyn Sealer,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = read_frame(&mut stream, IO_TIMEOUT).await?;
    let reply = match String::from_utf8(payload) {
        Ok(blob) => match sealer.unseal(&blob) {
            Ok(cred) => svc.handle_request(&cred.plaintext, cred.uid, peer).await,
            Err(e) => {
                tracing::warn!("Rejected request from {}: {}", peer, e);
                Reply::error(ErrorCode::Uid)
            }
        },
        Err(_) => {
            tracing::warn!("Request from {} is not UTF-8", peer);
            Reply::error(ErrorCode::Uid)
        }
    };
    write_frame(&mut stream, reply.to_wire().as_bytes(), IO_TIMEOUT).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HmacSealer;
    use crate::protocol::VERSION;
    use crate::service::test_support::*;
    use tokio::net::TcpStream;

    const KEY: &[u8] = b"test-key";

    async fn exchange<S>(stream: &mut S, blob: &str) -> Reply
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_frame(stream, blob.as_bytes(), IO_TIMEOUT).await.unwrap();
        let payload = read_frame(stream, IO_TIMEOUT).await.unwrap();
        Reply::parse(std::str::from_utf8(&payload).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_connection_over_duplex() {
        let sim = cluster();
        let svc = service(&sim, config());
        let sealer = HmacSealer::new(KEY).unwrap();
        let (mut client, server) = tokio::io::duplex(4096);

        let blob = sealer
            .seal(OWNER, &format!("{}:SHOW_CONFIG", VERSION))
            .unwrap();
        let handler = tokio::spawn({
            let svc = svc.clone();
            async move {
                let sealer = HmacSealer::new(KEY).unwrap();
                handle_connection(server, "127.0.0.1".parse().unwrap(), &svc, &sealer).await
            }
        });
        let reply = exchange(&mut client, &blob).await;
        handler.await.unwrap().unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.setting("ControlAddr"), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_bad_seal_is_euid() {
        let sim = cluster();
        let svc = service(&sim, config());
        let forged = HmacSealer::new(b"other-key")
            .unwrap()
            .seal(0, &format!("{}:SHOW_CONFIG", VERSION))
            .unwrap();
        let (mut client, server) = tokio::io::duplex(4096);
        let handler = tokio::spawn({
            let svc = svc.clone();
            async move {
                let sealer = HmacSealer::new(KEY).unwrap();
                handle_connection(server, "127.0.0.1".parse().unwrap(), &svc, &sealer).await
            }
        });
        let reply = exchange(&mut client, &forged).await;
        handler.await.unwrap().unwrap();
        assert_eq!(reply.code, ErrorCode::Uid);
    }

    #[tokio::test]
    async fn test_replace_over_tcp() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;

        let sealer: Arc<dyn Sealer> = Arc::new(HmacSealer::new(KEY).unwrap());
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), svc.clone(), sealer.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let running = tokio::spawn(server.run(cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let blob = sealer
            .seal(
                OWNER,
                &format!("{}:REPLACE_NODE:JOBID:{}:NODE:nid10", VERSION, job),
            )
            .unwrap();
        let reply = exchange(&mut stream, &blob).await;
        assert!(reply.is_ok());
        assert_eq!(reply.value("ReplacementNode"), Some("nid99"));
        assert_eq!(reply.value("NewNodeList"), Some("nid[11,99]"));

        cancel.cancel();
        running.await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
