use nonstop_slurm::JobId;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::{BitOr, BitOrAssign};

/// Event bits delivered to a job's callback subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const NONE: EventFlags = EventFlags(0);
    pub const NODE_FAILED: EventFlags = EventFlags(0x01);
    pub const NODE_FAILING: EventFlags = EventFlags(0x02);
    pub const NODE_REPLACED: EventFlags = EventFlags(0x04);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A node that failed (or is failing) under a job, with the CPUs the job
/// held on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedNode {
    pub name: String,
    pub cpus: u32,
}

/// Per-job failure bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub job_id: JobId,
    /// Owner at creation time; never changes for the life of the record.
    pub owner_uid: u32,
    /// Failed nodes, unique by name.
    pub fail_nodes: Vec<FailedNode>,
    pub callback_addr: Option<IpAddr>,
    /// Zero means no subscription.
    pub callback_port: u16,
    /// Events not yet delivered to the subscriber.
    pub callback_flags: EventFlags,
    /// Queued stand-in job for a deferred replacement; 0 when none.
    pub pending_job_id: JobId,
    /// Node the stand-in will replace; empty when none.
    pub pending_node_name: String,
    /// Minutes of credit granted for the deferred replacement.
    pub pending_job_delay: u16,
    pub replace_count: u32,
    /// Minutes the owner may still add to the time limit.
    pub time_extend_avail: u32,
}

impl FailureRecord {
    pub fn new(job_id: JobId, owner_uid: u32) -> Self {
        Self {
            job_id,
            owner_uid,
            fail_nodes: Vec::new(),
            callback_addr: None,
            callback_port: 0,
            callback_flags: EventFlags::NONE,
            pending_job_id: 0,
            pending_node_name: String::new(),
            pending_job_delay: 0,
            replace_count: 0,
            time_extend_avail: 0,
        }
    }

    pub fn failed_node(&self, name: &str) -> Option<&FailedNode> {
        self.fail_nodes.iter().find(|n| n.name == name)
    }

    pub fn has_failed_node(&self, name: &str) -> bool {
        self.failed_node(name).is_some()
    }

    /// Append a failed node unless already present. Returns whether it was added.
    pub fn add_failed_node(&mut self, name: &str, cpus: u32) -> bool {
        if self.has_failed_node(name) {
            return false;
        }
        self.fail_nodes.push(FailedNode {
            name: name.to_string(),
            cpus,
        });
        true
    }

    pub fn remove_failed_node(&mut self, name: &str) -> bool {
        let before = self.fail_nodes.len();
        self.fail_nodes.retain(|n| n.name != name);
        self.fail_nodes.len() != before
    }

    pub fn has_pending(&self) -> bool {
        self.pending_job_id != 0
    }

    /// Record a deferred replacement and grant its delay as credit.
    pub fn set_pending(&mut self, job_id: JobId, node: &str, delay: u16) {
        self.pending_job_id = job_id;
        self.pending_node_name = node.to_string();
        self.pending_job_delay = delay;
        self.time_extend_avail = self.time_extend_avail.saturating_add(u32::from(delay));
    }

    /// Forget the pending replacement, keeping any credit it granted.
    /// Used once the stand-in has been merged.
    pub fn clear_pending(&mut self) {
        self.pending_job_id = 0;
        self.pending_node_name.clear();
        self.pending_job_delay = 0;
    }

    /// Abandon the pending replacement, taking back the credit it granted.
    /// Returns the stand-in job id, if there was one.
    pub fn cancel_pending(&mut self) -> Option<JobId> {
        if !self.has_pending() {
            return None;
        }
        let job_id = self.pending_job_id;
        self.time_extend_avail = self
            .time_extend_avail
            .saturating_sub(u32::from(self.pending_job_delay));
        self.clear_pending();
        Some(job_id)
    }

    /// Subscriber endpoint, if one is set.
    pub fn subscription(&self) -> Option<SocketAddr> {
        match (self.callback_addr, self.callback_port) {
            (Some(ip), port) if port != 0 => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    /// True when the record carries nothing worth keeping.
    pub fn is_idle(&self) -> bool {
        self.fail_nodes.is_empty()
            && !self.has_pending()
            && self.subscription().is_none()
            && self.callback_flags.is_empty()
            && self.replace_count == 0
            && self.time_extend_avail == 0
    }
}
