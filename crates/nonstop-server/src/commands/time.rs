use super::{CommandResult, authorized_job, require_running};
use crate::protocol::{ErrorCode, Reply};
use crate::service::Nonstop;
use nonstop_slurm::{JobId, JobUpdate};

/// Spend extension credit on the job's time limit. Zero minutes spends all
/// of it.
pub(crate) async fn time_incr(
    svc: &Nonstop,
    uid: u32,
    job_id: JobId,
    minutes: u32,
) -> CommandResult {
    let job = authorized_job(svc, uid, job_id).await?;
    require_running(&job)?;

    let granted = svc
        .update_record(&job, |rec| {
            let avail = rec.time_extend_avail;
            let granted = match minutes {
                0 if avail == 0 => return Err(ErrorCode::NoIncreaseTimeLimit),
                0 => avail,
                n if n > avail => return Err(ErrorCode::TimeOverLimit),
                n => n,
            };
            rec.time_extend_avail -= granted;
            Ok(granted)
        })
        .await
        .map_err(Reply::error)?;

    let mut update = JobUpdate::new(job_id);
    update.time_limit_incr = Some(granted);
    if let Err(e) = svc.scheduler().update_job(&update, svc.self_uid()).await {
        tracing::error!("Job {}: failed to extend time limit: {}", job_id, e);
        if let Some(rec) = svc.registry().lock().get_mut(job_id) {
            rec.time_extend_avail = rec.time_extend_avail.saturating_add(granted);
        }
        return Err(Reply::with_detail(ErrorCode::JobUpdate, e.code()));
    }
    tracing::info!("Job {}: time limit extended by {} minutes", job_id, granted);
    Ok(Reply::ok())
}

#[cfg(test)]
mod tests {
    use crate::protocol::ErrorCode;
    use crate::service::test_support::*;
    use nonstop_slurm::SchedulerError;

    #[tokio::test]
    async fn test_spend_all_credit() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;
        sim.set_node_down("nid11").await;

        let text = format!("NONSTOP_1:TIME_INCR:JOBID:{}:MINUTES:0", job);
        assert_eq!(request(&svc, OWNER, &text).await.to_wire(), "NONSTOP_1 ENOERROR");
        assert_eq!(sim.job(job).unwrap().time_limit, Some(70));
        assert_eq!(svc.registry().lock().get(job).unwrap().time_extend_avail, 0);

        let text = format!("NONSTOP_1:TIME_INCR:JOBID:{}:MINUTES:1", job);
        assert_eq!(
            request(&svc, OWNER, &text).await.to_wire(),
            "NONSTOP_1 ETIMEOVERLIMIT"
        );
        let text = format!("NONSTOP_1:TIME_INCR:JOBID:{}:MINUTES:0", job);
        assert_eq!(
            request(&svc, OWNER, &text).await.to_wire(),
            "NONSTOP_1 ENOINCREASETIMELIMIT"
        );
    }

    #[tokio::test]
    async fn test_partial_spend() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;

        let text = format!("NONSTOP_1:TIME_INCR:JOBID:{}:MINUTES:3", job);
        assert!(request(&svc, OWNER, &text).await.is_ok());
        assert_eq!(sim.job(job).unwrap().time_limit, Some(63));
        assert_eq!(svc.registry().lock().get(job).unwrap().time_extend_avail, 2);
    }

    #[tokio::test]
    async fn test_credit_restored_on_failure() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;
        sim.set_update_error(Some(SchedulerError::AccessDenied));

        let text = format!("NONSTOP_1:TIME_INCR:JOBID:{}:MINUTES:0", job);
        let reply = request(&svc, OWNER, &text).await;
        assert_eq!(reply.to_wire(), "NONSTOP_1 EJOBUPDATE 2002");
        assert_eq!(svc.registry().lock().get(job).unwrap().time_extend_avail, 5);
        assert_eq!(sim.job(job).unwrap().time_limit, Some(60));
    }

    #[tokio::test]
    async fn test_job_not_running() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10"], Some(60), None);
        sim.complete_job(job).await;
        let text = format!("NONSTOP_1:TIME_INCR:JOBID:{}:MINUTES:0", job);
        assert_eq!(request(&svc, OWNER, &text).await.code, ErrorCode::JobNotRun);
    }
}
