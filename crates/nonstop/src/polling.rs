//! Background poller turning SLURM queue and node state changes into
//! scheduler events.

use nonstop_slurm::{
    JobId, NodeInfo, QueueEntry, Scheduler, SchedulerEvents, query_nodes, query_squeue,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Jobs in the queue and nodes that are down or failing, at one point in
/// time.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    jobs: BTreeMap<JobId, QueueEntry>,
    bad_nodes: BTreeMap<String, NodeInfo>,
}

impl Snapshot {
    pub fn new(jobs: Vec<QueueEntry>, nodes: Vec<NodeInfo>) -> Self {
        Self {
            jobs: jobs.into_iter().map(|j| (j.job_id, j)).collect(),
            bad_nodes: nodes
                .into_iter()
                .filter(|n| n.state.is_down() || n.state.is_failing())
                .map(|n| (n.name.clone(), n))
                .collect(),
        }
    }

    /// Query squeue and scontrol.
    pub async fn capture() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let jobs = query_squeue().await?;
        let nodes = query_nodes().await?;
        Ok(Self::new(jobs, nodes))
    }

    /// Running jobs holding `node`.
    fn holders(&self, node: &str) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.state.is_running() && j.nodes.iter().any(|n| n == node))
            .map(|j| j.job_id)
            .collect()
    }

    fn is_live(&self, job_id: JobId) -> bool {
        self.jobs
            .get(&job_id)
            .is_some_and(|j| !j.state.is_finished())
    }
}

/// A change between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Node became down or failing, or changed between the two.
    NodeFail(String),
    JobBegin(JobId),
    JobFini(JobId),
}

/// Changes from `prev` to `next`. Without a previous snapshot only nodes
/// are reported, so failures that happened while nothing was watching
/// still reach their jobs.
pub fn transitions(prev: Option<&Snapshot>, next: &Snapshot) -> Vec<Transition> {
    let empty = Snapshot::default();
    let base = prev.unwrap_or(&empty);
    let mut out = Vec::new();

    for (name, node) in &next.bad_nodes {
        let changed = base
            .bad_nodes
            .get(name)
            .is_none_or(|old| old.state != node.state);
        if changed {
            out.push(Transition::NodeFail(name.clone()));
        }
    }

    let Some(prev) = prev else {
        return out;
    };
    for job in next.jobs.values() {
        let was_running = prev
            .jobs
            .get(&job.job_id)
            .is_some_and(|j| j.state.is_running());
        if job.state.is_running() && !was_running {
            out.push(Transition::JobBegin(job.job_id));
        }
    }
    let ended: BTreeSet<JobId> = prev
        .jobs
        .keys()
        .copied()
        .filter(|id| prev.is_live(*id) && !next.is_live(*id))
        .collect();
    out.extend(ended.into_iter().map(Transition::JobFini));
    out
}

/// Configuration for the event poller.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub poll_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Polls the controller and reports what changed.
pub struct EventPoller {
    scheduler: Arc<dyn Scheduler>,
    events: Arc<dyn SchedulerEvents>,
    config: PollingConfig,
    last: Option<Snapshot>,
}

impl EventPoller {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        events: Arc<dyn SchedulerEvents>,
        config: PollingConfig,
    ) -> Self {
        Self {
            scheduler,
            events,
            config,
            last: None,
        }
    }

    /// Start the poller in the background.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match Snapshot::capture().await {
                    Ok(next) => self.apply(next).await,
                    Err(e) => tracing::error!("Error polling scheduler: {}", e),
                },
            }
        }
    }

    /// Report the changes since the last snapshot and keep `next`.
    pub async fn apply(&mut self, next: Snapshot) {
        for transition in transitions(self.last.as_ref(), &next) {
            self.dispatch(&next, transition).await;
        }
        self.last = Some(next);
    }

    async fn dispatch(&self, snapshot: &Snapshot, transition: Transition) {
        tracing::debug!("{:?}", transition);
        match transition {
            Transition::NodeFail(name) => {
                let Some(node) = snapshot.bad_nodes.get(&name) else {
                    return;
                };
                let holders = snapshot.holders(&name);
                if holders.is_empty() {
                    self.events.on_node_fail(None, node).await;
                }
                for job_id in holders {
                    match self.scheduler.find_job(job_id).await {
                        Ok(Some(job)) => self.events.on_node_fail(Some(&job), node).await,
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Failed to look up job {}: {}", job_id, e),
                    }
                }
            }
            Transition::JobBegin(job_id) => match self.scheduler.find_job(job_id).await {
                Ok(Some(job)) => self.events.on_job_begin(&job).await,
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to look up job {}: {}", job_id, e),
            },
            Transition::JobFini(job_id) => self.events.on_job_fini(job_id).await,
        }
    }
}
