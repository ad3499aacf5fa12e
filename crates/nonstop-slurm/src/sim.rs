//! In-memory cluster implementing [`Scheduler`].
//!
//! Used by the service tests. Nodes, partitions, jobs and reservations live
//! behind one lock; lifecycle events are collected while the lock is held
//! and delivered to the registered [`SchedulerEvents`] receiver after it is
//! released, so the receiver may call straight back into the cluster.

use crate::scheduler::{Scheduler, SchedulerError, SchedulerEvents};
use crate::types::{
    AllocMode, Allocation, Dependency, JobDescriptor, JobId, JobInfo, JobState, JobUpdate,
    NodeBaseState, NodeCount, NodeInfo, NodeState, ReservationInfo, ReservationUpdate,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

/// First id handed out to submitted jobs.
const FIRST_JOB_ID: JobId = 1000;

enum SimEvent {
    NodeFail(JobInfo, NodeInfo),
    JobBegin(JobInfo),
    JobFini(JobId),
}

#[derive(Default)]
struct SimState {
    nodes: BTreeMap<String, NodeInfo>,
    partitions: BTreeMap<String, Vec<String>>,
    jobs: BTreeMap<JobId, JobInfo>,
    /// Submission requests of queued jobs, used when they start.
    pending: HashMap<JobId, JobDescriptor>,
    reservations: BTreeMap<String, ReservationInfo>,
    /// Resources released by `expand` dependents, waiting to be absorbed
    /// by their parent.
    expansion: HashMap<JobId, Vec<(String, u32)>>,
    next_job_id: JobId,
    /// Expected wait for a queued job; None means it could never start.
    will_run_delay: Option<Duration>,
    update_error: Option<SchedulerError>,
    admin_uid: u32,
}

impl SimState {
    fn is_admin(&self, uid: u32) -> bool {
        uid == 0 || uid == self.admin_uid
    }

    fn busy_nodes(&self) -> HashSet<&str> {
        let running = self
            .jobs
            .values()
            .filter(|j| j.state.is_running())
            .flat_map(|j| j.nodes.iter().map(String::as_str));
        let pooled = self
            .expansion
            .values()
            .flat_map(|pool| pool.iter().map(|(n, _)| n.as_str()));
        running.chain(pooled).collect()
    }

    /// Nodes that could run `desc` right now.
    fn candidates(&self, desc: &JobDescriptor) -> Result<Vec<String>, SchedulerError> {
        let members = match &desc.partition {
            Some(p) => Some(
                self.partitions
                    .get(p)
                    .ok_or_else(|| SchedulerError::InvalidPartition(p.clone()))?,
            ),
            None => None,
        };
        let reservation = match &desc.reservation {
            Some(r) => {
                let resv = self
                    .reservations
                    .get(r)
                    .ok_or_else(|| SchedulerError::InvalidReservation(r.clone()))?;
                if !resv.user_ids.contains(&desc.user_id) {
                    return Err(SchedulerError::AccessDenied);
                }
                Some(resv)
            }
            None => None,
        };
        let wanted: Vec<&str> = desc
            .features
            .as_deref()
            .map(|f| f.split('&').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let busy = self.busy_nodes();

        Ok(self
            .nodes
            .values()
            .filter(|n| !busy.contains(n.name.as_str()))
            .filter(|n| !n.state.is_down() && !n.state.is_failing())
            .filter(|n| members.is_none_or(|m| m.contains(&n.name)))
            .filter(|n| wanted.iter().all(|f| n.features.iter().any(|nf| nf == f)))
            .filter(|n| match reservation {
                Some(resv) => resv.nodes.contains(&n.name),
                None => !self.reservations.values().any(|r| r.nodes.contains(&n.name)),
            })
            .map(|n| n.name.clone())
            .collect())
    }

    fn cpus_of(&self, nodes: &[String]) -> Vec<u32> {
        nodes
            .iter()
            .map(|n| self.nodes.get(n).map(|i| i.cpus).unwrap_or(0))
            .collect()
    }

    fn next_id(&mut self) -> JobId {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    fn create_job(&mut self, desc: &JobDescriptor, nodes: Vec<String>, state: JobState) -> JobInfo {
        let job = JobInfo {
            job_id: self.next_id(),
            name: desc.name.clone(),
            user_id: desc.user_id,
            state,
            partition: desc.partition.clone(),
            account: desc.account.clone(),
            qos: desc.qos.clone(),
            cpus_per_node: self.cpus_of(&nodes),
            nodes,
            features: desc.features.clone(),
            time_limit: desc.time_limit,
            start_time: None,
            dependency: desc.dependency.clone(),
        };
        self.jobs.insert(job.job_id, job.clone());
        job
    }

    fn end_job(&mut self, job_id: JobId, state: JobState) -> Result<(), SchedulerError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::InvalidJobId(job_id))?;
        if job.state.is_finished() {
            return Err(SchedulerError::NotSupported(format!(
                "job {} already completed",
                job_id
            )));
        }
        job.state = state;
        self.pending.remove(&job_id);
        self.expansion.remove(&job_id);
        Ok(())
    }

    fn node_fail_events(&self, node: &NodeInfo) -> Vec<SimEvent> {
        self.jobs
            .values()
            .filter(|j| j.state.is_running() && j.contains_node(&node.name))
            .map(|j| SimEvent::NodeFail(j.clone(), node.clone()))
            .collect()
    }
}

/// A simulated SLURM cluster.
pub struct SimCluster {
    state: Mutex<SimState>,
    events: Mutex<Option<Weak<dyn SchedulerEvents>>>,
}

impl SimCluster {
    /// Create an empty cluster. `admin_uid` (and root) may change time
    /// limits, drain nodes and act on any job.
    pub fn new(admin_uid: u32) -> Self {
        Self {
            state: Mutex::new(SimState {
                next_job_id: FIRST_JOB_ID,
                admin_uid,
                ..Default::default()
            }),
            events: Mutex::new(None),
        }
    }

    /// Register the receiver of lifecycle events.
    pub fn set_events(&self, events: Weak<dyn SchedulerEvents>) {
        *self.events.lock() = Some(events);
    }

    fn listener(&self) -> Option<Arc<dyn SchedulerEvents>> {
        self.events.lock().as_ref().and_then(Weak::upgrade)
    }

    async fn dispatch(&self, events: Vec<SimEvent>) {
        let Some(listener) = self.listener() else {
            return;
        };
        for event in events {
            match event {
                SimEvent::NodeFail(job, node) => listener.on_node_fail(Some(&job), &node).await,
                SimEvent::JobBegin(job) => listener.on_job_begin(&job).await,
                SimEvent::JobFini(job_id) => listener.on_job_fini(job_id).await,
            }
        }
    }

    pub fn add_node(&self, partition: &str, name: &str, cpus: u32, features: &[&str]) {
        let mut state = self.state.lock();
        state.nodes.insert(
            name.to_string(),
            NodeInfo {
                name: name.to_string(),
                state: NodeState::IDLE,
                cpus,
                features: features.iter().map(|f| f.to_string()).collect(),
                reason: None,
            },
        );
        state
            .partitions
            .entry(partition.to_string())
            .or_default()
            .push(name.to_string());
    }

    pub fn add_reservation(&self, name: &str, nodes: &[&str], user_ids: &[u32]) {
        self.state.lock().reservations.insert(
            name.to_string(),
            ReservationInfo {
                name: name.to_string(),
                nodes: nodes.iter().map(|n| n.to_string()).collect(),
                user_ids: user_ids.to_vec(),
            },
        );
    }

    /// Expected wait reported for jobs that cannot start now.
    pub fn set_will_run_delay(&self, delay: Option<Duration>) {
        self.state.lock().will_run_delay = delay;
    }

    /// Make every job update fail with `err` until cleared.
    pub fn set_update_error(&self, err: Option<SchedulerError>) {
        self.state.lock().update_error = err;
    }

    /// Start a job on exactly `nodes`, bypassing allocation checks.
    pub fn submit_running(
        &self,
        user_id: u32,
        partition: &str,
        nodes: &[&str],
        time_limit: Option<u32>,
        features: Option<&str>,
    ) -> JobId {
        let desc = JobDescriptor {
            name: "sim".to_string(),
            user_id,
            partition: Some(partition.to_string()),
            min_nodes: nodes.len() as u32,
            features: features.map(str::to_string),
            time_limit,
            ..Default::default()
        };
        let nodes = nodes.iter().map(|n| n.to_string()).collect();
        let mut state = self.state.lock();
        let job = state.create_job(&desc, nodes, JobState::Running);
        if let Some(j) = state.jobs.get_mut(&job.job_id) {
            j.start_time = Some(Utc::now());
        }
        job.job_id
    }

    /// Start a queued job on whatever nodes are free now.
    pub async fn start_job(&self, job_id: JobId) -> Result<(), SchedulerError> {
        let job = {
            let mut state = self.state.lock();
            let desc = state
                .pending
                .get(&job_id)
                .cloned()
                .ok_or(SchedulerError::InvalidJobId(job_id))?;
            let mut nodes = state.candidates(&desc)?;
            let wanted = desc.min_nodes.max(1) as usize;
            if nodes.len() < wanted {
                return Err(SchedulerError::NodesBusy);
            }
            nodes.truncate(wanted);
            let cpus = state.cpus_of(&nodes);
            state.pending.remove(&job_id);
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(SchedulerError::InvalidJobId(job_id))?;
            job.state = JobState::Running;
            job.nodes = nodes;
            job.cpus_per_node = cpus;
            job.start_time = Some(Utc::now());
            job.clone()
        };
        self.dispatch(vec![SimEvent::JobBegin(job)]).await;
        Ok(())
    }

    /// Mark a node DOWN and notify every running job holding it.
    pub async fn set_node_down(&self, name: &str) {
        let events = {
            let mut state = self.state.lock();
            let Some(node) = state.nodes.get_mut(name) else {
                return;
            };
            node.state.base = NodeBaseState::Down;
            let node = node.clone();
            state.node_fail_events(&node)
        };
        self.dispatch(events).await;
    }

    /// Finish a job normally.
    pub async fn complete_job(&self, job_id: JobId) {
        let ended = self.state.lock().end_job(job_id, JobState::Completed);
        if ended.is_ok() {
            self.dispatch(vec![SimEvent::JobFini(job_id)]).await;
        }
    }

    /// Forget a job entirely, as the controller does once it ages out.
    pub fn purge_job(&self, job_id: JobId) {
        let mut state = self.state.lock();
        state.jobs.remove(&job_id);
        state.pending.remove(&job_id);
    }

    pub fn job(&self, job_id: JobId) -> Option<JobInfo> {
        self.state.lock().jobs.get(&job_id).cloned()
    }

    pub fn node(&self, name: &str) -> Option<NodeInfo> {
        self.state.lock().nodes.get(name).cloned()
    }

    pub fn reservation(&self, name: &str) -> Option<ReservationInfo> {
        self.state.lock().reservations.get(name).cloned()
    }
}

#[async_trait]
impl Scheduler for SimCluster {
    async fn find_job(&self, job_id: JobId) -> Result<Option<JobInfo>, SchedulerError> {
        Ok(self.job(job_id))
    }

    async fn find_node(&self, name: &str) -> Result<Option<NodeInfo>, SchedulerError> {
        Ok(self.node(name))
    }

    async fn failing_nodes(&self) -> Result<Vec<NodeInfo>, SchedulerError> {
        Ok(self
            .state
            .lock()
            .nodes
            .values()
            .filter(|n| n.state.is_failing())
            .cloned()
            .collect())
    }

    async fn partitions(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.state.lock().partitions.keys().cloned().collect())
    }

    async fn find_reservation(
        &self,
        name: &str,
    ) -> Result<Option<ReservationInfo>, SchedulerError> {
        Ok(self.reservation(name))
    }

    async fn signal_job(
        &self,
        job_id: JobId,
        signal: Signal,
        as_uid: u32,
    ) -> Result<(), SchedulerError> {
        {
            let mut state = self.state.lock();
            let job = state
                .jobs
                .get(&job_id)
                .ok_or(SchedulerError::InvalidJobId(job_id))?;
            if job.user_id != as_uid && !state.is_admin(as_uid) {
                return Err(SchedulerError::AccessDenied);
            }
            if signal != Signal::SIGKILL {
                return Ok(());
            }
            state.end_job(job_id, JobState::Cancelled)?;
        }
        self.dispatch(vec![SimEvent::JobFini(job_id)]).await;
        Ok(())
    }

    async fn update_job(&self, update: &JobUpdate, as_uid: u32) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.update_error {
            return Err(err.clone());
        }
        let mut job = state
            .jobs
            .get(&update.job_id)
            .cloned()
            .ok_or(SchedulerError::InvalidJobId(update.job_id))?;
        if job.user_id != as_uid && !state.is_admin(as_uid) {
            return Err(SchedulerError::AccessDenied);
        }

        if let Some(minutes) = update.time_limit_incr {
            if !state.is_admin(as_uid) {
                return Err(SchedulerError::AccessDenied);
            }
            job.time_limit = job.time_limit.map(|t| t.saturating_add(minutes));
        }

        if (update.min_nodes.is_some() || update.req_nodes.is_some()) && !job.state.is_running() {
            return Err(SchedulerError::NotSupported(format!(
                "job {} is not running",
                job.job_id
            )));
        }

        match update.min_nodes {
            Some(NodeCount::Count(0)) => {
                let Some(Dependency::Expand(parent)) = job.dependency else {
                    return Err(SchedulerError::NotSupported(format!(
                        "job {} has no expand dependency",
                        job.job_id
                    )));
                };
                let released: Vec<(String, u32)> = job
                    .nodes
                    .drain(..)
                    .zip(job.cpus_per_node.drain(..))
                    .collect();
                state.expansion.entry(parent).or_default().extend(released);
            }
            Some(NodeCount::Count(n)) => {
                job.nodes.truncate(n as usize);
                job.cpus_per_node.truncate(n as usize);
            }
            Some(NodeCount::Infinite) => {
                if let Some(pool) = state.expansion.remove(&job.job_id) {
                    for (node, cpus) in pool {
                        job.nodes.push(node);
                        job.cpus_per_node.push(cpus);
                    }
                }
            }
            None => {}
        }

        if let Some(req) = &update.req_nodes {
            if req.is_empty() || req.iter().any(|n| !job.contains_node(n)) {
                return Err(SchedulerError::InvalidNodeName(req.join(",")));
            }
            let (nodes, cpus): (Vec<String>, Vec<u32>) = job
                .nodes
                .iter()
                .cloned()
                .zip(job.cpus_per_node.iter().copied())
                .filter(|(n, _)| req.contains(n))
                .unzip();
            job.nodes = nodes;
            job.cpus_per_node = cpus;
        }

        state.jobs.insert(job.job_id, job);
        Ok(())
    }

    async fn allocate_job(
        &self,
        desc: &JobDescriptor,
        mode: AllocMode,
        _as_uid: u32,
    ) -> Result<Allocation, SchedulerError> {
        let now = Utc::now();
        let (allocation, events) = {
            let mut state = self.state.lock();
            let mut free = state.candidates(desc)?;
            let wanted = desc.min_nodes.max(1) as usize;
            let available = free.len() >= wanted;
            free.truncate(wanted);

            match (mode, available) {
                (AllocMode::WillRun, true) => (
                    Allocation {
                        job_id: 0,
                        nodes: free,
                        start_time: Some(now),
                        started: false,
                    },
                    Vec::new(),
                ),
                (AllocMode::WillRun, false) => {
                    let delay = state.will_run_delay.ok_or(SchedulerError::NodesBusy)?;
                    (
                        Allocation {
                            job_id: 0,
                            nodes: Vec::new(),
                            start_time: Some(now + delay),
                            started: false,
                        },
                        Vec::new(),
                    )
                }
                (AllocMode::Immediate, false) => return Err(SchedulerError::NodesBusy),
                (AllocMode::Immediate | AllocMode::Deferred, true) => {
                    let mut job = state.create_job(desc, free, JobState::Running);
                    job.start_time = Some(now);
                    state.jobs.insert(job.job_id, job.clone());
                    (
                        Allocation {
                            job_id: job.job_id,
                            nodes: job.nodes.clone(),
                            start_time: job.start_time,
                            started: true,
                        },
                        vec![SimEvent::JobBegin(job)],
                    )
                }
                (AllocMode::Deferred, false) => {
                    let mut job = state.create_job(desc, Vec::new(), JobState::Pending);
                    job.start_time = state.will_run_delay.map(|d| now + d);
                    state.jobs.insert(job.job_id, job.clone());
                    state.pending.insert(job.job_id, desc.clone());
                    (
                        Allocation {
                            job_id: job.job_id,
                            nodes: Vec::new(),
                            start_time: job.start_time,
                            started: false,
                        },
                        Vec::new(),
                    )
                }
            }
        };
        self.dispatch(events).await;
        Ok(allocation)
    }

    async fn update_reservation(&self, update: &ReservationUpdate) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        let resv = state
            .reservations
            .get_mut(update.name())
            .ok_or_else(|| SchedulerError::InvalidReservation(update.name().to_string()))?;
        match update {
            ReservationUpdate::AddUser { uid, .. } => {
                if !resv.user_ids.contains(uid) {
                    resv.user_ids.push(*uid);
                }
            }
            ReservationUpdate::RemoveUser { uid, .. } => resv.user_ids.retain(|u| u != uid),
        }
        Ok(())
    }

    async fn drain_nodes(
        &self,
        nodes: &[String],
        reason: &str,
        as_uid: u32,
    ) -> Result<(), SchedulerError> {
        let events = {
            let mut state = self.state.lock();
            if !state.is_admin(as_uid) {
                return Err(SchedulerError::AccessDenied);
            }
            if let Some(missing) = nodes.iter().find(|n| !state.nodes.contains_key(*n)) {
                return Err(SchedulerError::InvalidNodeName(missing.clone()));
            }
            let mut events = Vec::new();
            for name in nodes {
                if let Some(node) = state.nodes.get_mut(name) {
                    node.state.fail = true;
                    node.reason = Some(reason.to_string());
                    let node = node.clone();
                    events.extend(state.node_fail_events(&node));
                }
            }
            events
        };
        self.dispatch(events).await;
        Ok(())
    }
}
