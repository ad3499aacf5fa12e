//! The scheduler interface consumed by the nonstop service, and the event
//! interface the scheduler drives.

use crate::types::{
    AllocMode, Allocation, JobDescriptor, JobId, JobInfo, JobUpdate, NodeInfo, ReservationInfo,
    ReservationUpdate,
};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Invalid job id specified: {0}")]
    InvalidJobId(JobId),
    #[error("Invalid node name specified: {0}")]
    InvalidNodeName(String),
    #[error("Invalid partition name specified: {0}")]
    InvalidPartition(String),
    #[error("Requested reservation is invalid: {0}")]
    InvalidReservation(String),
    #[error("Requested nodes are busy")]
    NodesBusy,
    #[error("Access/permission denied")]
    AccessDenied,
    #[error("Requested operation not supported on this job: {0}")]
    NotSupported(String),
    #[error("Failed to execute {0}")]
    Command(String),
    #[error("Failed to parse scheduler output: {0}")]
    Parse(String),
}

impl SchedulerError {
    /// Numeric code reported to clients, following SLURM's error numbering.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidPartition(_) => 2000,
            Self::AccessDenied => 2002,
            Self::NodesBusy => 2016,
            Self::InvalidJobId(_) => 2017,
            Self::InvalidNodeName(_) => 2018,
            Self::NotSupported(_) => 2049,
            Self::InvalidReservation(_) => 2050,
            Self::Command(_) | Self::Parse(_) => -1,
        }
    }
}

/// Operations the nonstop service needs from the workload manager.
///
/// Implementations take whatever internal locks they need; callers never
/// hold the failure registry lock across these calls, since several of
/// them (allocate, signal, update) re-enter [`SchedulerEvents`].
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn find_job(&self, job_id: JobId) -> Result<Option<JobInfo>, SchedulerError>;

    async fn find_node(&self, name: &str) -> Result<Option<NodeInfo>, SchedulerError>;

    /// All nodes currently flagged FAIL/FAILING.
    async fn failing_nodes(&self) -> Result<Vec<NodeInfo>, SchedulerError>;

    /// Names of all configured partitions.
    async fn partitions(&self) -> Result<Vec<String>, SchedulerError>;

    async fn find_reservation(
        &self,
        name: &str,
    ) -> Result<Option<ReservationInfo>, SchedulerError>;

    async fn signal_job(
        &self,
        job_id: JobId,
        signal: Signal,
        as_uid: u32,
    ) -> Result<(), SchedulerError>;

    async fn update_job(&self, update: &JobUpdate, as_uid: u32) -> Result<(), SchedulerError>;

    async fn allocate_job(
        &self,
        desc: &JobDescriptor,
        mode: AllocMode,
        as_uid: u32,
    ) -> Result<Allocation, SchedulerError>;

    async fn update_reservation(&self, update: &ReservationUpdate) -> Result<(), SchedulerError>;

    /// Mark nodes as failing with the given reason.
    async fn drain_nodes(
        &self,
        nodes: &[String],
        reason: &str,
        as_uid: u32,
    ) -> Result<(), SchedulerError>;
}

/// Lifecycle events the scheduler reports to the nonstop service.
#[async_trait]
pub trait SchedulerEvents: Send + Sync {
    /// A node went down or was flagged failing. Called once per
    /// (node, job holding it), or once with `None` to let the receiver
    /// find the affected jobs itself.
    async fn on_node_fail(&self, job: Option<&JobInfo>, node: &NodeInfo);

    /// A job moved from pending to running.
    async fn on_job_begin(&self, job: &JobInfo);

    /// A job reached a terminal state.
    async fn on_job_fini(&self, job_id: JobId);
}
