//! Scheduler events applied to the failure registry.

use crate::service::Nonstop;
use async_trait::async_trait;
use nonstop_slurm::{Dependency, JobId, JobInfo, NodeInfo, SchedulerEvents};
use nonstop_state::EventFlags;

fn failure_kind(node: &NodeInfo) -> EventFlags {
    if node.state.is_down() {
        EventFlags::NODE_FAILED
    } else if node.state.is_failing() {
        EventFlags::NODE_FAILING
    } else {
        EventFlags::NONE
    }
}

#[async_trait]
impl SchedulerEvents for Nonstop {
    async fn on_node_fail(&self, job: Option<&JobInfo>, node: &NodeInfo) {
        let kind = failure_kind(node);
        if kind.is_empty() {
            tracing::debug!("Node {} reported but neither down nor failing", node.name);
            return;
        }

        let Some(job) = job else {
            // Only jobs with a record are of interest; mark them without
            // touching their node lists.
            let ids: Vec<JobId> = self.registry().lock().iter().map(|r| r.job_id).collect();
            for job_id in ids {
                match self.scheduler().find_job(job_id).await {
                    Ok(Some(job)) if job.state.is_running() && job.contains_node(&node.name) => {
                        tracing::info!("Job {}: node {} {}", job_id, node.name, kind);
                        self.registry().lock().mark_event(job_id, kind);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Failed to look up job {}: {}", job_id, e),
                }
            }
            return;
        };

        let extend = self.config().time_limit_extend;
        let cpus = job.cpus_on(&node.name).unwrap_or(node.cpus);
        let (added, stale) = {
            let mut records = self.registry().lock();
            let (_, stale) = records.find_or_replace(job.job_id, job.user_id);
            let added = records.add_failed_node(job.job_id, &node.name, cpus, extend);
            records.mark_event(job.job_id, kind);
            (added, stale)
        };
        if let Some(stale) = stale {
            self.discard_record(stale).await;
        }
        if added {
            tracing::info!(
                "Job {}: node {} failed ({} cpus, {})",
                job.job_id,
                node.name,
                cpus,
                kind
            );
        }
    }

    async fn on_job_begin(&self, job: &JobInfo) {
        let Some(Dependency::Expand(parent)) = job.dependency else {
            return;
        };
        let mut records = self.registry().lock();
        if records.get(parent).is_some() {
            tracing::info!("Job {}: stand-in {} started", parent, job.job_id);
            records.mark_event(parent, EventFlags::NODE_REPLACED);
        }
    }

    async fn on_job_fini(&self, job_id: JobId) {
        self.delete_record(job_id).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::service::test_support::*;
    use nonstop_slurm::{NodeState, SchedulerEvents};
    use nonstop_state::EventFlags;

    #[tokio::test]
    async fn test_node_down_records_failure() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;
        // Repeated reports add nothing
        let node = sim.node("nid10").unwrap();
        let info = sim.job(job).unwrap();
        svc.on_node_fail(Some(&info), &node).await;

        let records = svc.registry().lock();
        let rec = records.get(job).unwrap();
        assert_eq!(rec.owner_uid, OWNER);
        assert_eq!(rec.fail_nodes.len(), 1);
        assert_eq!(rec.fail_nodes[0].cpus, 32);
        assert_eq!(rec.time_extend_avail, 5);
        assert_eq!(rec.callback_flags, EventFlags::NODE_FAILED);
    }

    #[tokio::test]
    async fn test_owner_change_replaces_record() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10"], Some(60), None);
        {
            let mut records = svc.registry().lock();
            let rec = records.find_or_create(job, OTHER).unwrap();
            rec.time_extend_avail = 99;
        }
        sim.set_node_down("nid10").await;
        let records = svc.registry().lock();
        let rec = records.get(job).unwrap();
        assert_eq!(rec.owner_uid, OWNER);
        assert_eq!(rec.time_extend_avail, 5);
    }

    #[tokio::test]
    async fn test_node_fail_without_job_marks_recorded_jobs() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        let untracked = sim.submit_running(OTHER, "batch", &["nid99"], Some(60), None);
        svc.registry().lock().find_or_create(job, OWNER).unwrap();

        let mut node = sim.node("nid11").unwrap();
        node.state = NodeState {
            fail: true,
            ..node.state
        };
        svc.on_node_fail(None, &node).await;

        let records = svc.registry().lock();
        let rec = records.get(job).unwrap();
        assert_eq!(rec.callback_flags, EventFlags::NODE_FAILING);
        assert!(rec.fail_nodes.is_empty());
        assert_eq!(rec.time_extend_avail, 0);
        assert!(records.get(untracked).is_none());
    }

    #[tokio::test]
    async fn test_job_fini_removes_record() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;
        assert!(svc.registry().lock().get(job).is_some());
        sim.complete_job(job).await;
        assert!(svc.registry().lock().get(job).is_none());
    }
}
