//! Restoring the registry at startup and saving it while running.

use crate::service::Nonstop;
use chrono::Utc;
use nonstop_slurm::Scheduler;
use nonstop_state::{FailureRecord, StateError, StateStore};

/// Load saved records, dropping those whose job is gone or changed owner
/// and abandoning pending stand-ins that are no longer valid.
///
/// Unreadable state is fatal unless `ignore_errors` is set, in which case
/// the registry starts empty.
pub async fn restore(
    store: &StateStore,
    scheduler: &dyn Scheduler,
    ignore_errors: bool,
) -> Result<Vec<FailureRecord>, StateError> {
    let saved = match store.load() {
        Ok(Some(saved)) => saved,
        Ok(None) => {
            tracing::info!("No saved state at {}", store.path());
            return Ok(Vec::new());
        }
        Err(e) if ignore_errors => {
            tracing::warn!("Ignoring unreadable state: {}", e);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let total = saved.records.len();
    let mut kept = Vec::with_capacity(total);
    for mut rec in saved.records {
        match scheduler.find_job(rec.job_id).await {
            Ok(Some(job)) if job.user_id == rec.owner_uid => {}
            Ok(Some(job)) => {
                tracing::warn!(
                    "Job {} now belongs to uid {}, not {}; dropping its record",
                    rec.job_id,
                    job.user_id,
                    rec.owner_uid
                );
                continue;
            }
            Ok(None) => {
                tracing::info!("Job {} is gone; dropping its record", rec.job_id);
                continue;
            }
            Err(e) => tracing::warn!("Failed to look up job {}, keeping record: {}", rec.job_id, e),
        }
        if rec.has_pending() && !standin_valid(scheduler, &rec).await {
            tracing::info!(
                "Job {}: stand-in {} is no longer valid",
                rec.job_id,
                rec.pending_job_id
            );
            rec.cancel_pending();
        }
        kept.push(rec);
    }
    tracing::info!(
        "Restored {} of {} failure records saved at {}",
        kept.len(),
        total,
        saved.timestamp
    );
    Ok(kept)
}

/// Whether a record's pending stand-in still exists, is unfinished and
/// belongs to the record's owner. Lookup errors count as valid.
pub(crate) async fn standin_valid(scheduler: &dyn Scheduler, rec: &FailureRecord) -> bool {
    match scheduler.find_job(rec.pending_job_id).await {
        Ok(Some(job)) => !job.state.is_finished() && job.user_id == rec.owner_uid,
        Ok(None) => false,
        Err(e) => {
            tracing::warn!("Failed to look up stand-in {}: {}", rec.pending_job_id, e);
            true
        }
    }
}

/// Writes the registry to its store, skipping unchanged registries.
pub struct Saver {
    store: StateStore,
    saved_stamp: Option<u64>,
}

impl Saver {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            saved_stamp: None,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Save if anything changed since the last successful save.
    pub fn save_if_changed(&mut self, svc: &Nonstop) -> Result<bool, StateError> {
        if self.saved_stamp == Some(svc.registry().lock().stamp()) {
            return Ok(false);
        }
        self.save(svc)?;
        Ok(true)
    }

    /// Sweep records that carry nothing, then save the rest.
    pub fn save(&mut self, svc: &Nonstop) -> Result<(), StateError> {
        let (records, stamp) = {
            let mut records = svc.registry().lock();
            let swept = records.sweep_idle();
            if swept > 0 {
                tracing::debug!("Swept {} empty failure records", swept);
            }
            (records.snapshot(), records.stamp())
        };
        self.store.save(&records, Utc::now().timestamp())?;
        self.saved_stamp = Some(stamp);
        tracing::debug!("Saved {} failure records", records.len());
        Ok(())
    }
}
