use super::CommandResult;
use crate::protocol::{ErrorCode, Reply};
use crate::service::Nonstop;
use nonstop_slurm::JobId;
use std::net::IpAddr;

/// Subscribe `peer:port` to the job's events. Port 0 removes the
/// subscription. Only the job owner may subscribe.
pub(crate) async fn callback(
    svc: &Nonstop,
    uid: u32,
    peer: IpAddr,
    job_id: JobId,
    port: u32,
) -> CommandResult {
    let job = match svc.scheduler().find_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return Err(Reply::error(ErrorCode::JobId)),
        Err(e) => {
            tracing::warn!("Failed to look up job {}: {}", job_id, e);
            return Err(Reply::error(ErrorCode::JobId));
        }
    };
    if uid != job.user_id {
        return Err(Reply::error(ErrorCode::Perm));
    }
    let port = u16::try_from(port).map_err(|_| Reply::error(ErrorCode::Port))?;

    svc.update_record(&job, |rec| {
        if port == 0 {
            rec.callback_addr = None;
            rec.callback_port = 0;
        } else {
            rec.callback_addr = Some(peer);
            rec.callback_port = port;
        }
    })
    .await;
    if port == 0 {
        tracing::info!("Job {}: callbacks cancelled", job_id);
    } else {
        tracing::info!("Job {}: callbacks to {}:{}", job_id, peer, port);
    }
    Ok(Reply::ok())
}
