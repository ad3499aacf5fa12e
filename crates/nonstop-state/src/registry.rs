//! The set of failure records, keyed by job id, behind one mutex.
//!
//! The guard returned by [`Registry::lock`] must never be held across an
//! `.await`: scheduler calls re-enter the registry through event callbacks.

use crate::record::{EventFlags, FailureRecord};
use nonstop_slurm::JobId;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Record for job {job_id} belongs to uid {recorded}, scheduler reports uid {actual}")]
    OwnerMismatch {
        job_id: JobId,
        recorded: u32,
        actual: u32,
    },
}

/// A subscriber notification taken out of the registry for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCallback {
    pub job_id: JobId,
    pub addr: SocketAddr,
    pub flags: EventFlags,
}

/// Failure records plus a change stamp advanced on every mutation.
#[derive(Debug, Default)]
pub struct Records {
    records: BTreeMap<JobId, FailureRecord>,
    stamp: u64,
}

impl Records {
    fn bump(&mut self) {
        self.stamp = self.stamp.wrapping_add(1);
    }

    /// Change stamp; compare against a saved value to detect modifications.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, job_id: JobId) -> Option<&FailureRecord> {
        self.records.get(&job_id)
    }

    /// Mutable access; counts as a modification.
    pub fn get_mut(&mut self, job_id: JobId) -> Option<&mut FailureRecord> {
        if self.records.contains_key(&job_id) {
            self.bump();
        }
        self.records.get_mut(&job_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailureRecord> {
        self.records.values()
    }

    /// Find the record for a job, creating it if absent.
    ///
    /// Fails if an existing record was created for a different owner; the
    /// caller decides whether to discard it.
    pub fn find_or_create(
        &mut self,
        job_id: JobId,
        owner_uid: u32,
    ) -> Result<&mut FailureRecord, RegistryError> {
        if let Some(recorded) = self.records.get(&job_id).map(|r| r.owner_uid) {
            if recorded != owner_uid {
                return Err(RegistryError::OwnerMismatch {
                    job_id,
                    recorded,
                    actual: owner_uid,
                });
            }
        }
        self.bump();
        Ok(self
            .records
            .entry(job_id)
            .or_insert_with(|| FailureRecord::new(job_id, owner_uid)))
    }

    /// Find or create the record for a job, discarding one that was created
    /// for a different owner. Returns the discarded record so the caller can
    /// clean up its pending stand-in.
    pub fn find_or_replace(
        &mut self,
        job_id: JobId,
        owner_uid: u32,
    ) -> (&mut FailureRecord, Option<FailureRecord>) {
        let mut stale = None;
        let mismatch = self.find_or_create(job_id, owner_uid).err();
        if let Some(e) = mismatch {
            tracing::warn!("{}; discarding record", e);
            stale = self.records.remove(&job_id);
        }
        self.bump();
        let rec = self
            .records
            .entry(job_id)
            .or_insert_with(|| FailureRecord::new(job_id, owner_uid));
        (rec, stale)
    }

    /// Insert a record as-is, replacing any existing one for the job.
    pub fn insert(&mut self, record: FailureRecord) {
        self.bump();
        self.records.insert(record.job_id, record);
    }

    /// Add a failed node to a job's record, granting `extend` minutes of
    /// credit when the node is new. Returns whether the node was added.
    pub fn add_failed_node(&mut self, job_id: JobId, node: &str, cpus: u32, extend: u32) -> bool {
        let Some(rec) = self.get_mut(job_id) else {
            return false;
        };
        if !rec.add_failed_node(node, cpus) {
            return false;
        }
        rec.time_extend_avail = rec.time_extend_avail.saturating_add(extend);
        true
    }

    /// OR event bits into a job's pending callback flags.
    pub fn mark_event(&mut self, job_id: JobId, flags: EventFlags) {
        if let Some(rec) = self.get_mut(job_id) {
            rec.callback_flags |= flags;
        }
    }

    pub fn remove(&mut self, job_id: JobId) -> Option<FailureRecord> {
        let removed = self.records.remove(&job_id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Drop records that no longer carry any state. Returns how many.
    pub fn sweep_idle(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, rec| !rec.is_idle());
        let swept = before - self.records.len();
        if swept > 0 {
            self.bump();
        }
        swept
    }

    pub fn snapshot(&self) -> Vec<FailureRecord> {
        self.records.values().cloned().collect()
    }

    /// Take every undelivered notification that has a subscriber, clearing
    /// the flags. Failed deliveries must be handed back to [`Self::rearm`].
    pub fn take_callbacks(&mut self) -> Vec<PendingCallback> {
        let mut taken = Vec::new();
        for rec in self.records.values_mut() {
            if rec.callback_flags.is_empty() {
                continue;
            }
            if let Some(addr) = rec.subscription() {
                taken.push(PendingCallback {
                    job_id: rec.job_id,
                    addr,
                    flags: rec.callback_flags,
                });
                rec.callback_flags = EventFlags::NONE;
            }
        }
        if !taken.is_empty() {
            self.bump();
        }
        taken
    }

    /// Restore flags of a notification that could not be delivered.
    pub fn rearm(&mut self, job_id: JobId, flags: EventFlags) {
        self.mark_event(job_id, flags);
    }
}

/// Registry of failure records shared by the request server, the event
/// engine and the state/callback task.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Records>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from restored records.
    pub fn from_records(records: Vec<FailureRecord>) -> Self {
        let records = records.into_iter().map(|r| (r.job_id, r)).collect();
        Self {
            inner: Mutex::new(Records { records, stamp: 0 }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Records> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_or_create_owner_mismatch() {
        let registry = Registry::new();
        let mut records = registry.lock();
        records.find_or_create(42, 1000).unwrap();
        let err = records.find_or_create(42, 1001).unwrap_err();
        assert_eq!(
            err,
            RegistryError::OwnerMismatch {
                job_id: 42,
                recorded: 1000,
                actual: 1001
            }
        );
        assert_eq!(records.get(42).map(|r| r.owner_uid), Some(1000));
    }

    #[test]
    fn test_find_or_replace_discards_mismatch() {
        let registry = Registry::new();
        let mut records = registry.lock();
        records.find_or_create(42, 1000).unwrap().set_pending(1001, "nid11", 5);

        let (rec, stale) = records.find_or_replace(42, 1000);
        assert!(rec.has_pending());
        assert!(stale.is_none());

        let (rec, stale) = records.find_or_replace(42, 2000);
        assert_eq!(rec.owner_uid, 2000);
        assert!(!rec.has_pending());
        assert_eq!(stale.map(|s| s.pending_job_id), Some(1001));
    }

    #[test]
    fn test_add_failed_node_credits_once() {
        let registry = Registry::new();
        let mut records = registry.lock();
        records.find_or_create(42, 1000).unwrap();
        assert!(records.add_failed_node(42, "nid11", 32, 5));
        assert!(!records.add_failed_node(42, "nid11", 32, 5));
        assert!(!records.add_failed_node(43, "nid11", 32, 5));
        assert_eq!(records.get(42).map(|r| r.time_extend_avail), Some(5));
    }

    #[test]
    fn test_stamp_advances_on_mutation() {
        let registry = Registry::new();
        let mut records = registry.lock();
        let start = records.stamp();
        records.find_or_create(42, 1000).unwrap();
        let after_create = records.stamp();
        assert_ne!(start, after_create);

        let _ = records.get(42);
        assert_eq!(records.stamp(), after_create);

        records.mark_event(42, EventFlags::NODE_FAILED);
        assert_ne!(records.stamp(), after_create);
    }

    #[test]
    fn test_take_callbacks_and_rearm() {
        let registry = Registry::new();
        let mut records = registry.lock();
        let rec = records.find_or_create(42, 1000).unwrap();
        rec.callback_addr = Some("127.0.0.1".parse().unwrap());
        rec.callback_port = 7000;
        records.mark_event(42, EventFlags::NODE_FAILED);

        // No subscriber: flags stay put
        records.find_or_create(43, 1000).unwrap();
        records.mark_event(43, EventFlags::NODE_FAILING);

        let taken = records.take_callbacks();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].job_id, 42);
        assert_eq!(taken[0].flags, EventFlags::NODE_FAILED);
        assert!(records.get(42).unwrap().callback_flags.is_empty());
        assert_eq!(
            records.get(43).unwrap().callback_flags,
            EventFlags::NODE_FAILING
        );

        records.mark_event(42, EventFlags::NODE_REPLACED);
        records.rearm(42, taken[0].flags);
        assert_eq!(
            records.get(42).unwrap().callback_flags,
            EventFlags::NODE_FAILED | EventFlags::NODE_REPLACED
        );
    }

    #[test]
    fn test_sweep_idle() {
        let registry = Registry::new();
        let mut records = registry.lock();
        records.find_or_create(42, 1000).unwrap();
        records.find_or_create(43, 1000).unwrap();
        records.add_failed_node(43, "nid11", 32, 0);
        assert_eq!(records.sweep_idle(), 1);
        assert!(records.get(42).is_none());
        assert!(records.get(43).is_some());
    }
}
