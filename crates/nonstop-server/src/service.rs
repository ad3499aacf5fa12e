//! The nonstop service: failure registry, configuration snapshot and the
//! scheduler it drives.

use crate::commands;
use crate::protocol::{Command, ErrorCode, Reply};
use arc_swap::ArcSwap;
use nix::sys::signal::Signal;
use nonstop_config::Config;
use nonstop_slurm::{JobId, JobInfo, Scheduler};
use nonstop_state::{FailureRecord, Registry};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared service state. One instance is shared by the request server, the
/// scheduler event path and the background state task.
pub struct Nonstop {
    registry: Registry,
    config: ArcSwap<Config>,
    scheduler: Arc<dyn Scheduler>,
    /// UID the service runs as; always authorized on job commands.
    self_uid: u32,
    /// Commands that change records or the cluster hold the write side.
    /// Scheduler events never take it.
    commands: RwLock<()>,
}

impl Nonstop {
    pub fn new(config: Config, scheduler: Arc<dyn Scheduler>, self_uid: u32) -> Self {
        Self {
            registry: Registry::new(),
            config: ArcSwap::from_pointee(config),
            scheduler,
            self_uid,
            commands: RwLock::new(()),
        }
    }

    /// Start from restored records instead of an empty registry.
    pub fn with_records(mut self, records: Vec<FailureRecord>) -> Self {
        self.registry = Registry::from_records(records);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn self_uid(&self) -> u32 {
        self.self_uid
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Replace the configuration snapshot. Requests already running keep
    /// the snapshot they started with.
    pub fn set_config(&self, config: Config) {
        self.config.store(Arc::new(config));
    }

    /// Handle one unsealed request from `uid`, sent from `peer`.
    pub async fn handle_request(&self, text: &str, uid: u32, peer: IpAddr) -> Reply {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!("Bad request from uid {}: {}", uid, e);
                return Reply::error(ErrorCode::Cmd);
            }
        };
        tracing::debug!("uid {} from {}: {:?}", uid, peer, command);

        let result = if modifies_state(&command) {
            let _exclusive = self.commands.write().await;
            self.dispatch(command, uid, peer).await
        } else {
            let _shared = self.commands.read().await;
            self.dispatch(command, uid, peer).await
        };
        let reply = result.unwrap_or_else(|reply| reply);
        if !reply.is_ok() {
            tracing::debug!("uid {}: {}", uid, reply);
        }
        reply
    }

    async fn dispatch(&self, command: Command, uid: u32, peer: IpAddr) -> commands::CommandResult {
        match command {
            Command::Callback { job_id, port } => {
                commands::callback(self, uid, peer, job_id, port).await
            }
            Command::Drain { nodes, reason } => commands::drain(self, uid, &nodes, &reason).await,
            Command::GetFailNodes {
                job_id,
                state_flags,
            } => commands::fail_nodes(self, uid, job_id, state_flags).await,
            Command::DropNode { job_id, node } => {
                commands::drop_node(self, uid, job_id, &node).await
            }
            Command::ReplaceNode { job_id, node } => {
                commands::replace_node(self, uid, job_id, &node).await
            }
            Command::ShowConfig => Ok(commands::show_config(self)),
            Command::ShowJob { job_id } => commands::show_job(self, uid, job_id).await,
            Command::TimeIncr { job_id, minutes } => {
                commands::time_incr(self, uid, job_id, minutes).await
            }
        }
    }

    /// Run `f` on the job's record, creating it if needed. A record left
    /// behind by a different owner of the same job id is discarded first.
    pub(crate) async fn update_record<T>(
        &self,
        job: &JobInfo,
        f: impl FnOnce(&mut FailureRecord) -> T,
    ) -> T {
        let (out, stale) = {
            let mut records = self.registry.lock();
            let (rec, stale) = records.find_or_replace(job.job_id, job.user_id);
            (f(rec), stale)
        };
        if let Some(stale) = stale {
            self.discard_record(stale).await;
        }
        out
    }

    /// Remove a job's record, killing its pending stand-in.
    pub async fn delete_record(&self, job_id: JobId) {
        let removed = self.registry.lock().remove(job_id);
        if let Some(rec) = removed {
            tracing::debug!("Removed failure record for job {}", job_id);
            self.discard_record(rec).await;
        }
    }

    /// Clean up after a record that is no longer tracked.
    pub(crate) async fn discard_record(&self, rec: FailureRecord) {
        if rec.has_pending() {
            self.kill_job(rec.pending_job_id, rec.owner_uid).await;
        }
    }

    /// SIGKILL a job as `uid`; failures are only logged.
    pub(crate) async fn kill_job(&self, job_id: JobId, uid: u32) {
        match self.scheduler.signal_job(job_id, Signal::SIGKILL, uid).await {
            Ok(()) => tracing::info!("Killed job {}", job_id),
            Err(e) => tracing::warn!("Failed to kill job {}: {}", job_id, e),
        }
    }
}

/// Read-only commands may run side by side; the rest run one at a time.
fn modifies_state(command: &Command) -> bool {
    !matches!(
        command,
        Command::ShowConfig | Command::ShowJob { .. } | Command::GetFailNodes { .. }
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_bad_requests() {
        let sim = cluster();
        let svc = service(&sim, config());
        assert_eq!(
            request(&svc, OWNER, "NONSTOP_2:SHOW_CONFIG").await.code,
            ErrorCode::Cmd
        );
        assert_eq!(
            request(&svc, OWNER, "NONSTOP_1:BOGUS").await.code,
            ErrorCode::Cmd
        );
        assert_eq!(
            request(&svc, OWNER, "NONSTOP_1:SHOW_JOB:JOBID:x").await.code,
            ErrorCode::Cmd
        );
    }

    #[tokio::test]
    async fn test_set_config_swaps_snapshot() {
        let sim = cluster();
        let svc = service(&sim, config());
        let before = svc.config();
        svc.set_config(Config {
            max_spare_node_count: 3,
            ..config()
        });
        assert_eq!(before.max_spare_node_count, 0);
        assert_eq!(svc.config().max_spare_node_count, 3);
    }

    #[tokio::test]
    async fn test_delete_record_kills_pending_standin() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10"], Some(60), None);
        let standin = sim.submit_running(OWNER, "batch", &["nid11"], Some(60), None);
        svc.registry()
            .lock()
            .find_or_create(job, OWNER)
            .unwrap()
            .set_pending(standin, "nid10", 5);

        svc.delete_record(job).await;
        assert!(svc.registry().lock().get(job).is_none());
        assert!(sim.job(standin).unwrap().state.is_finished());
    }
}
