//! Background state task: subscriber notifications, pending stand-in
//! validation and periodic registry saves.

use crate::persist::{Saver, standin_valid};
use crate::service::Nonstop;
use nonstop_state::{EventFlags, FailureRecord};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;

/// Limit on each of connect and write when notifying a subscriber.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Send event flags to a subscriber as a 32-bit big-endian word.
pub async fn deliver(addr: SocketAddr, flags: EventFlags) -> std::io::Result<()> {
    let timed_out = || std::io::Error::from(std::io::ErrorKind::TimedOut);
    let mut stream = timeout(CALLBACK_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| timed_out())??;
    timeout(CALLBACK_TIMEOUT, stream.write_all(&flags.bits().to_be_bytes()))
        .await
        .map_err(|_| timed_out())??;
    Ok(())
}

/// Notify every subscriber with undelivered events. Flags of failed
/// deliveries go back into their records. Returns the number delivered.
pub async fn send_callbacks(svc: &Nonstop) -> usize {
    let pending = svc.registry().lock().take_callbacks();
    let mut sent = 0;
    for callback in pending {
        match deliver(callback.addr, callback.flags).await {
            Ok(()) => {
                tracing::debug!(
                    "Job {}: sent {} to {}",
                    callback.job_id,
                    callback.flags,
                    callback.addr
                );
                sent += 1;
            }
            Err(e) => {
                tracing::warn!(
                    "Job {}: callback to {} failed: {}",
                    callback.job_id,
                    callback.addr,
                    e
                );
                svc.registry().lock().rearm(callback.job_id, callback.flags);
            }
        }
    }
    sent
}

/// Abandon pending replacements whose stand-in has finished or changed
/// owner, returning the delay credit.
pub async fn validate_pending(svc: &Nonstop) {
    let pending: Vec<FailureRecord> = svc
        .registry()
        .lock()
        .iter()
        .filter(|rec| rec.has_pending())
        .cloned()
        .collect();

    for rec in pending {
        if standin_valid(svc.scheduler(), &rec).await {
            continue;
        }
        let mut records = svc.registry().lock();
        if let Some(current) = records.get_mut(rec.job_id) {
            // The record may have moved on while the lookup ran
            if current.pending_job_id == rec.pending_job_id {
                tracing::info!("Job {}: stand-in {} is gone", rec.job_id, rec.pending_job_id);
                current.cancel_pending();
            }
        }
    }
}

/// Intervals of the state task.
#[derive(Debug, Clone)]
pub struct StateTaskConfig {
    pub callback_interval: Duration,
    pub save_interval: Duration,
}

impl Default for StateTaskConfig {
    fn default() -> Self {
        Self {
            callback_interval: Duration::from_secs(10),
            save_interval: Duration::from_secs(60),
        }
    }
}

/// Owns the saver and drives notifications and saves until cancelled.
pub struct StateTask {
    svc: Arc<Nonstop>,
    saver: Saver,
    config: StateTaskConfig,
}

impl StateTask {
    pub fn new(svc: Arc<Nonstop>, saver: Saver, config: StateTaskConfig) -> Self {
        Self { svc, saver, config }
    }

    /// Start the task in the background.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut callback_ticker = interval(self.config.callback_interval);
        let mut save_ticker = interval(self.config.save_interval);

        // Skip the first tick (fires immediately)
        callback_ticker.tick().await;
        save_ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = callback_ticker.tick() => {
                    validate_pending(&self.svc).await;
                    if send_callbacks(&self.svc).await > 0 {
                        self.save();
                    }
                }
                _ = save_ticker.tick() => {
                    if let Err(e) = self.saver.save_if_changed(&self.svc) {
                        tracing::error!("Error saving state: {}", e);
                    }
                }
            }
        }

        // Flush outstanding notifications before the final save.
        send_callbacks(&self.svc).await;
        self.save();
        tracing::info!("State task stopped");
    }

    fn save(&mut self) {
        if let Err(e) = self.saver.save(&self.svc) {
            tracing::error!("Error saving state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::*;
    use camino::Utf8Path;
    use nonstop_slurm::JobId;
    use nonstop_state::StateStore;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn subscribe(svc: &Nonstop, job_id: JobId, addr: SocketAddr) {
        let mut records = svc.registry().lock();
        let rec = records.find_or_create(job_id, OWNER).unwrap();
        rec.callback_addr = Some(addr.ip());
        rec.callback_port = addr.port();
    }

    #[tokio::test]
    async fn test_callback_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        subscribe(&svc, job, addr);
        sim.set_node_down("nid10").await;

        let receiver = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.read_u32().await.unwrap()
        });
        assert_eq!(send_callbacks(&svc).await, 1);
        assert_eq!(receiver.await.unwrap(), EventFlags::NODE_FAILED.bits());
        assert!(
            svc.registry()
                .lock()
                .get(job)
                .unwrap()
                .callback_flags
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_failed_callback_rearms() {
        // Reserve a port, then close it so the connect is refused
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        subscribe(&svc, job, addr);
        sim.set_node_down("nid10").await;

        assert_eq!(send_callbacks(&svc).await, 0);
        assert_eq!(
            svc.registry().lock().get(job).unwrap().callback_flags,
            EventFlags::NODE_FAILED
        );
    }

    #[tokio::test]
    async fn test_unsubscribed_flags_kept() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;
        assert_eq!(send_callbacks(&svc).await, 0);
        assert_eq!(
            svc.registry().lock().get(job).unwrap().callback_flags,
            EventFlags::NODE_FAILED
        );
    }

    #[tokio::test]
    async fn test_validate_pending_cancels_finished_standin() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10"], Some(60), None);
        let standin = sim.submit_running(OWNER, "batch", &["nid11"], Some(60), None);
        {
            let mut records = svc.registry().lock();
            let rec = records.find_or_create(job, OWNER).unwrap();
            rec.time_extend_avail = 12;
            rec.set_pending(standin, "nid10", 10);
        }

        validate_pending(&svc).await;
        assert!(svc.registry().lock().get(job).unwrap().has_pending());

        sim.complete_job(standin).await;
        validate_pending(&svc).await;
        let records = svc.registry().lock();
        let rec = records.get(job).unwrap();
        assert!(!rec.has_pending());
        assert_eq!(rec.time_extend_avail, 12);
    }

    #[tokio::test]
    async fn test_state_task_saves_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let dir = Utf8Path::from_path(temp.path()).unwrap();
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;

        let cancel = CancellationToken::new();
        let task = StateTask::new(
            svc.clone(),
            Saver::new(StateStore::new(dir)),
            StateTaskConfig::default(),
        )
        .start(cancel.clone());
        cancel.cancel();
        task.await.unwrap();

        let saved = StateStore::new(dir).load().unwrap().unwrap();
        assert_eq!(saved.records.len(), 1);
        assert_eq!(saved.records[0].job_id, job);
    }
}
