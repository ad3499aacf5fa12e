//! SLURM integration for nonstop.
//!
//! The [`Scheduler`] trait is what the service consumes; [`ScontrolScheduler`]
//! drives a live controller and [`SimCluster`] is an in-memory stand-in.

pub mod scheduler;
pub mod scontrol;
pub mod sim;
pub mod squeue;
pub mod types;

pub use scheduler::{Scheduler, SchedulerError, SchedulerEvents};
pub use scontrol::{ScontrolScheduler, query_nodes};
pub use sim::SimCluster;
pub use squeue::{QueueEntry, SqueueError, query_squeue};
pub use types::{
    AllocMode, Allocation, Dependency, JobDescriptor, JobId, JobInfo, JobState, JobUpdate,
    NodeBaseState, NodeCount, NodeInfo, NodeState, ReservationInfo, ReservationUpdate,
    hot_spare_reservation,
};
