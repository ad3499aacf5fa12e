use super::{
    CommandResult, authorized_job, failed_node, refresh_job, require_running, with_allocation,
};
use crate::protocol::{ErrorCode, Reply};
use crate::service::Nonstop;
use nonstop_slurm::{JobId, JobInfo, JobUpdate};

/// Remove a failed node from a running job's allocation.
pub(crate) async fn drop_node(svc: &Nonstop, uid: u32, job_id: JobId, node: &str) -> CommandResult {
    let job = authorized_job(svc, uid, job_id).await?;
    require_running(&job)?;
    failed_node(svc, &job, node).await?;
    let config = svc.config();

    let (nodes, cpus_per_node): (Vec<String>, Vec<u32>) = job
        .nodes
        .iter()
        .cloned()
        .zip(job.cpus_per_node.iter().copied())
        .filter(|(n, _)| n != node)
        .unzip();
    let shrunk = JobInfo {
        nodes,
        cpus_per_node,
        ..job.clone()
    };

    let mut update = JobUpdate::new(job_id);
    update.req_nodes = Some(shrunk.nodes.clone());
    if let Err(e) = svc.scheduler().update_job(&update, job.user_id).await {
        tracing::error!("Job {}: failed to drop {}: {}", job_id, node, e);
        return Err(Reply::with_detail(ErrorCode::JobUpdate, e.code()));
    }

    let cancelled = svc
        .update_record(&job, |rec| {
            let cancelled = if rec.pending_node_name == node {
                rec.cancel_pending()
            } else {
                None
            };
            rec.remove_failed_node(node);
            rec.time_extend_avail = rec.time_extend_avail.saturating_add(config.time_limit_drop);
            cancelled
        })
        .await;
    if let Some(standin) = cancelled {
        tracing::info!("Job {}: cancelling stand-in {} for {}", job_id, standin, node);
        svc.kill_job(standin, job.user_id).await;
    }
    tracing::info!("Job {}: dropped node {}", job_id, node);

    let job = refresh_job(svc, shrunk).await;
    Ok(with_allocation(Reply::ok(), &job))
}

#[cfg(test)]
mod tests {
    use crate::protocol::ErrorCode;
    use crate::service::test_support::*;
    use nonstop_slurm::SchedulerError;

    #[tokio::test]
    async fn test_drop_failed_node() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;

        let text = format!("NONSTOP_1:DROP_NODE:JOBID:{}:NODE:nid10", job);
        let reply = request(&svc, OWNER, &text).await;
        assert_eq!(
            reply.to_wire(),
            "NONSTOP_1 ENOERROR NewNodeList nid11 NewNodeCount 1 NewCpusPerNode 32"
        );
        assert_eq!(sim.job(job).unwrap().nodes, vec!["nid11"]);

        let records = svc.registry().lock();
        let rec = records.get(job).unwrap();
        assert!(rec.fail_nodes.is_empty());
        // 5 for the failure, 2 for the drop
        assert_eq!(rec.time_extend_avail, 7);
    }

    #[tokio::test]
    async fn test_drop_cancels_pending_replacement() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;
        let standin = sim.submit_running(OWNER, "batch", &["nid99"], Some(60), None);
        svc.registry()
            .lock()
            .get_mut(job)
            .unwrap()
            .set_pending(standin, "nid10", 20);

        let text = format!("NONSTOP_1:DROP_NODE:JOBID:{}:NODE:nid10", job);
        assert!(request(&svc, OWNER, &text).await.is_ok());

        let records = svc.registry().lock();
        let rec = records.get(job).unwrap();
        assert!(!rec.has_pending());
        // Delay credit returned: 5 + 20 - 20 + 2
        assert_eq!(rec.time_extend_avail, 7);
        assert!(sim.job(standin).unwrap().state.is_finished());
    }

    #[tokio::test]
    async fn test_drop_update_failure() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;
        sim.set_update_error(Some(SchedulerError::NotSupported("frozen".into())));

        let text = format!("NONSTOP_1:DROP_NODE:JOBID:{}:NODE:nid10", job);
        let reply = request(&svc, OWNER, &text).await;
        assert_eq!(reply.code, ErrorCode::JobUpdate);
        assert_eq!(reply.detail(), Some("2049"));
        assert_eq!(svc.registry().lock().get(job).unwrap().fail_nodes.len(), 1);
    }
}
