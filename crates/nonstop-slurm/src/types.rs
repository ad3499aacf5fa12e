//! SLURM job, node and reservation types as seen by the nonstop service.

use chrono::{DateTime, Utc};
use nonstop_parsers::compress_hostlist;

/// SLURM job identifier.
pub type JobId = u32;

/// SLURM job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completing,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    Unknown,
}

impl JobState {
    /// Parse a SLURM job state string (long or short form).
    pub fn parse(s: &str) -> Self {
        // scontrol may append flags, e.g. "CANCELLED by 1000"
        let base = s.split_whitespace().next().unwrap_or(s);
        match base.to_uppercase().as_str() {
            "PENDING" | "PD" => Self::Pending,
            "RUNNING" | "R" => Self::Running,
            "SUSPENDED" | "S" => Self::Suspended,
            "COMPLETING" | "CG" => Self::Completing,
            "COMPLETED" | "CD" => Self::Completed,
            "CANCELLED" | "CA" => Self::Cancelled,
            "FAILED" | "F" => Self::Failed,
            "TIMEOUT" | "TO" => Self::Timeout,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            _ => Self::Unknown,
        }
    }

    pub fn is_pending(&self) -> bool {
        *self == Self::Pending
    }

    pub fn is_running(&self) -> bool {
        *self == Self::Running
    }

    /// Terminal states: the job will never run again.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Failed | Self::Timeout | Self::NodeFail
        )
    }
}

/// Base state of a node, without flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBaseState {
    Idle,
    Allocated,
    Mixed,
    Down,
    Future,
    Unknown,
}

/// Node state: a base state plus the flags this service cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeState {
    pub base: NodeBaseState,
    /// Node is marked FAIL/FAILING: expected to fail soon.
    pub fail: bool,
    pub drain: bool,
}

impl NodeState {
    pub const IDLE: NodeState = NodeState {
        base: NodeBaseState::Idle,
        fail: false,
        drain: false,
    };

    /// Parse a state like `IDLE`, `ALLOCATED+FAIL`, `DOWN*+DRAIN` or `MIXED+FAILING`.
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split('+');
        let base_str = parts
            .next()
            .unwrap_or_default()
            .trim_end_matches(['*', '~', '#', '!', '%', '$', '@', '^', '-'])
            .to_uppercase();
        let base = match base_str.as_str() {
            "IDLE" => NodeBaseState::Idle,
            "ALLOCATED" | "ALLOC" | "COMPLETING" => NodeBaseState::Allocated,
            "MIXED" | "MIX" => NodeBaseState::Mixed,
            "DOWN" => NodeBaseState::Down,
            "FUTURE" => NodeBaseState::Future,
            // sinfo-style composite states
            "FAIL" | "FAILING" => {
                return Self {
                    base: NodeBaseState::Allocated,
                    fail: true,
                    drain: true,
                };
            }
            "DRAIN" | "DRAINED" | "DRAINING" => {
                return Self {
                    base: NodeBaseState::Idle,
                    fail: false,
                    drain: true,
                };
            }
            _ => NodeBaseState::Unknown,
        };

        let mut state = Self {
            base,
            fail: false,
            drain: false,
        };
        for flag in parts {
            match flag.to_uppercase().as_str() {
                "FAIL" | "FAILING" => state.fail = true,
                "DRAIN" | "DRAINED" | "DRAINING" => state.drain = true,
                _ => {}
            }
        }
        state
    }

    pub fn is_down(&self) -> bool {
        self.base == NodeBaseState::Down
    }

    pub fn is_failing(&self) -> bool {
        self.fail
    }
}

/// Node information from the scheduler.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub state: NodeState,
    pub cpus: u32,
    /// Available features (constraints) of the node.
    pub features: Vec<String>,
    pub reason: Option<String>,
}

/// Job dependency relevant to node replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// `expand:<job_id>`: resources of this job may be merged into the parent.
    Expand(JobId),
    /// Any other dependency specification, kept verbatim.
    Other(String),
}

impl Dependency {
    /// Parse a dependency string like `expand:42` or `expand:42(unfulfilled)`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s == "(null)" {
            return None;
        }
        if let Some(rest) = s.strip_prefix("expand:") {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(id) = digits.parse() {
                return Some(Self::Expand(id));
            }
        }
        Some(Self::Other(s.to_string()))
    }

    /// Format for a job submission.
    pub fn to_arg(&self) -> String {
        match self {
            Self::Expand(id) => format!("expand:{}", id),
            Self::Other(s) => s.clone(),
        }
    }
}

/// Job information from the scheduler.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: JobId,
    pub name: String,
    pub user_id: u32,
    pub state: JobState,
    pub partition: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    /// Allocated nodes, in allocation order.
    pub nodes: Vec<String>,
    /// CPUs allocated on each node, parallel to `nodes`.
    pub cpus_per_node: Vec<u32>,
    /// Feature (constraint) expression the job was submitted with.
    pub features: Option<String>,
    /// Time limit in minutes; None means unlimited.
    pub time_limit: Option<u32>,
    /// Actual or expected start time.
    pub start_time: Option<DateTime<Utc>>,
    pub dependency: Option<Dependency>,
}

impl JobInfo {
    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n == name)
    }

    /// CPUs this job holds on `name`, if the node is in its allocation.
    pub fn cpus_on(&self, name: &str) -> Option<u32> {
        self.nodes
            .iter()
            .position(|n| n == name)
            .map(|i| self.cpus_per_node.get(i).copied().unwrap_or(0))
    }

    /// Compressed hostlist of the allocation.
    pub fn node_list(&self) -> String {
        compress_hostlist(&self.nodes)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Requested node count for a job update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCount {
    Count(u32),
    /// As large as the current allocation permits; used to absorb resources
    /// released by an `expand` dependent job.
    Infinite,
}

/// A job modification request.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub job_id: JobId,
    /// Minutes to add to the time limit.
    pub time_limit_incr: Option<u32>,
    pub min_nodes: Option<NodeCount>,
    /// Explicit replacement node set (must be a subset of the allocation).
    pub req_nodes: Option<Vec<String>>,
}

impl JobUpdate {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            ..Default::default()
        }
    }
}

/// A job submission request.
#[derive(Debug, Clone, Default)]
pub struct JobDescriptor {
    pub name: String,
    pub user_id: u32,
    pub partition: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    pub min_nodes: u32,
    /// Feature (constraint) expression.
    pub features: Option<String>,
    pub reservation: Option<String>,
    pub dependency: Option<Dependency>,
    pub time_limit: Option<u32>,
}

/// How an allocation request should be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Allocate now or fail.
    Immediate,
    /// Queue the job if it cannot start now.
    Deferred,
    /// Do not submit; only report when the job could start.
    WillRun,
}

/// Result of an allocation request.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// New job id (0 for a will-run probe).
    pub job_id: JobId,
    /// Nodes allocated (or expected for a will-run probe); empty if queued.
    pub nodes: Vec<String>,
    /// Start time; for queued jobs and probes the expected start.
    pub start_time: Option<DateTime<Utc>>,
    /// Whether the job is running now.
    pub started: bool,
}

/// Reservation information from the scheduler.
#[derive(Debug, Clone)]
pub struct ReservationInfo {
    pub name: String,
    pub nodes: Vec<String>,
    pub user_ids: Vec<u32>,
}

/// A reservation user-set modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationUpdate {
    AddUser { name: String, uid: u32 },
    RemoveUser { name: String, uid: u32 },
}

impl ReservationUpdate {
    pub fn name(&self) -> &str {
        match self {
            Self::AddUser { name, .. } | Self::RemoveUser { name, .. } => name,
        }
    }
}

/// Name of the hot-spare reservation for a partition.
pub fn hot_spare_reservation(partition: &str) -> String {
    format!("HOT_SPARE_{}", partition)
}
