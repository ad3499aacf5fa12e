//! REPLACE_NODE: swap a failed node for a fresh one.
//!
//! A one-node stand-in job depending on `expand:<job>` is allocated as the
//! job owner, first from idle nodes, then from the partition's hot-spare
//! reservation, and finally queued to start later. Once the stand-in runs
//! it is shrunk to zero nodes, the job grows onto the released node, the
//! failed node is removed and the stand-in is killed.

use super::{
    CommandResult, authorized_job, failed_node, refresh_job, require_running, with_allocation,
};
use crate::protocol::{ErrorCode, Reply};
use crate::service::Nonstop;
use chrono::Utc;
use nonstop_config::Config;
use nonstop_parsers::minutes_until;
use nonstop_slurm::{
    AllocMode, Allocation, Dependency, JobDescriptor, JobId, JobInfo, JobUpdate, NodeCount,
    NodeInfo, ReservationInfo, ReservationUpdate, SchedulerError, hot_spare_reservation,
};
use std::collections::HashSet;

pub(crate) async fn replace_node(
    svc: &Nonstop,
    uid: u32,
    job_id: JobId,
    node: &str,
) -> CommandResult {
    let job = authorized_job(svc, uid, job_id).await?;
    require_running(&job)?;
    let failed = failed_node(svc, &job, node).await?;
    let config = svc.config();

    if let Some(standin) = check_pending(svc, &job, node).await? {
        return Ok(merge_standin(svc, &job, node, standin, &config).await);
    }

    let replaced = svc
        .registry()
        .lock()
        .get(job_id)
        .map(|rec| rec.replace_count)
        .unwrap_or(0);
    if config.max_spare_node_count != 0 && replaced >= config.max_spare_node_count {
        return Err(Reply::with_detail(
            ErrorCode::MaxSpareCount,
            config.max_spare_node_count,
        ));
    }

    let desc = standin_descriptor(&job, &failed);
    let alloc = match allocate_standin(svc, &job, &desc).await {
        Ok(alloc) => alloc,
        Err(e) => {
            tracing::error!("Job {}: no replacement for {}: {}", job_id, node, e);
            return Err(Reply::with_detail(ErrorCode::NodeReplaceFail, e.code()));
        }
    };
    if alloc.started {
        return Ok(merge_standin(svc, &job, node, alloc.job_id, &config).await);
    }

    let now = Utc::now();
    let start = alloc.start_time.unwrap_or(now);
    let delay = minutes_until(start, now)
        .min(config.time_limit_delay)
        .max(config.time_limit_extend);
    let delay = u16::try_from(delay).unwrap_or(u16::MAX);
    svc.update_record(&job, |rec| rec.set_pending(alloc.job_id, node, delay))
        .await;
    tracing::info!(
        "Job {}: stand-in {} for {} expected at {}, {} minutes credited",
        job_id,
        alloc.job_id,
        node,
        start,
        delay
    );
    Ok(Reply::with_detail(ErrorCode::ReplaceLater, start.timestamp()))
}

/// Resolve an outstanding replacement. Returns a stand-in that is running
/// and ready to merge for this node, an error reply when the replacement
/// must wait, or `None` when there is nothing outstanding.
async fn check_pending(
    svc: &Nonstop,
    job: &JobInfo,
    node: &str,
) -> Result<Option<JobId>, Reply> {
    let pending = svc
        .registry()
        .lock()
        .get(job.job_id)
        .filter(|rec| rec.owner_uid == job.user_id && rec.has_pending())
        .map(|rec| (rec.pending_job_id, rec.pending_node_name.clone()));
    let Some((pending_id, pending_node)) = pending else {
        return Ok(None);
    };

    let standin = match svc.scheduler().find_job(pending_id).await {
        Ok(found) => found.filter(|s| !s.state.is_finished() && s.user_id == job.user_id),
        Err(e) => {
            tracing::warn!("Failed to look up stand-in {}: {}", pending_id, e);
            None
        }
    };
    match standin {
        Some(s) if !s.state.is_running() => Err(Reply::with_detail(
            ErrorCode::ReplaceLater,
            s.start_time.map(|t| t.timestamp()).unwrap_or(0),
        )),
        Some(_) if pending_node != node => {
            Err(Reply::with_detail(ErrorCode::ReplacePending, pending_node))
        }
        Some(s) => Ok(Some(s.job_id)),
        None => {
            tracing::info!("Job {}: stand-in {} is gone", job.job_id, pending_id);
            if let Some(rec) = svc.registry().lock().get_mut(job.job_id) {
                if rec.pending_job_id == pending_id {
                    rec.cancel_pending();
                }
            }
            Ok(None)
        }
    }
}

/// One node like the failed one, for the job's owner, that may be merged
/// into the job.
fn standin_descriptor(job: &JobInfo, failed: &NodeInfo) -> JobDescriptor {
    let features = job.features.as_deref().and_then(|expr| {
        let referenced: HashSet<&str> = expr
            .split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
            .filter(|s| !s.is_empty())
            .collect();
        let wanted: Vec<&str> = failed
            .features
            .iter()
            .map(String::as_str)
            .filter(|f| referenced.contains(f))
            .collect();
        (!wanted.is_empty()).then(|| wanted.join("&"))
    });
    JobDescriptor {
        name: job.name.clone(),
        user_id: job.user_id,
        partition: job.partition.clone(),
        account: job.account.clone(),
        qos: job.qos.clone(),
        min_nodes: 1,
        features,
        reservation: None,
        dependency: Some(Dependency::Expand(job.job_id)),
        time_limit: job.time_limit,
    }
}

async fn allocate_standin(
    svc: &Nonstop,
    job: &JobInfo,
    desc: &JobDescriptor,
) -> Result<Allocation, SchedulerError> {
    let scheduler = svc.scheduler();
    match scheduler
        .allocate_job(desc, AllocMode::Immediate, job.user_id)
        .await
    {
        Ok(alloc) => return Ok(alloc),
        Err(e) => tracing::debug!("Job {}: no idle node: {}", job.job_id, e),
    }

    if let Some(partition) = &job.partition {
        let name = hot_spare_reservation(partition);
        match scheduler.find_reservation(&name).await {
            Ok(Some(resv)) => match allocate_hot_spare(svc, desc, &resv).await {
                Ok(alloc) => return Ok(alloc),
                Err(e) => tracing::debug!("Job {}: no hot spare in {}: {}", job.job_id, name, e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to look up reservation {}: {}", name, e),
        }
    }

    let probe = scheduler
        .allocate_job(desc, AllocMode::WillRun, job.user_id)
        .await?;
    let mut alloc = scheduler
        .allocate_job(desc, AllocMode::Deferred, job.user_id)
        .await?;
    if !alloc.started {
        alloc.start_time = probe.start_time.or(alloc.start_time);
    }
    Ok(alloc)
}

/// Allocate from a hot-spare reservation, adding the owner to its users
/// for the duration of the call if needed.
async fn allocate_hot_spare(
    svc: &Nonstop,
    desc: &JobDescriptor,
    resv: &ReservationInfo,
) -> Result<Allocation, SchedulerError> {
    let scheduler = svc.scheduler();
    let uid = desc.user_id;
    let added = !resv.user_ids.contains(&uid);
    if added {
        scheduler
            .update_reservation(&ReservationUpdate::AddUser {
                name: resv.name.clone(),
                uid,
            })
            .await?;
    }

    let desc = JobDescriptor {
        reservation: Some(resv.name.clone()),
        ..desc.clone()
    };
    let result = scheduler.allocate_job(&desc, AllocMode::Immediate, uid).await;

    if added {
        let revert = ReservationUpdate::RemoveUser {
            name: resv.name.clone(),
            uid,
        };
        if let Err(e) = scheduler.update_reservation(&revert).await {
            tracing::error!("Failed to remove uid {} from {}: {}", uid, resv.name, e);
        }
    }
    result
}

/// Merge a running stand-in into the job in place of `node`.
async fn merge_standin(
    svc: &Nonstop,
    job: &JobInfo,
    node: &str,
    standin: JobId,
    config: &Config,
) -> Reply {
    let merged = grow_into(svc, job, node, standin).await;
    svc.kill_job(standin, job.user_id).await;
    let merged = match merged {
        Ok(merged) => merged,
        Err(e) => {
            tracing::error!(
                "Job {}: failed to merge stand-in {}: {}",
                job.job_id,
                standin,
                e
            );
            return Reply::with_detail(ErrorCode::NodeReplaceFail, e.code());
        }
    };

    svc.update_record(job, |rec| {
        rec.remove_failed_node(node);
        rec.replace_count = rec.replace_count.saturating_add(1);
        rec.time_extend_avail = rec
            .time_extend_avail
            .saturating_add(config.time_limit_extend);
        if rec.pending_job_id == standin {
            rec.clear_pending();
        }
    })
    .await;

    let replacement = merged
        .nodes
        .iter()
        .find(|n| !job.contains_node(n))
        .cloned()
        .unwrap_or_default();
    tracing::info!("Job {}: replaced {} with {}", job.job_id, node, replacement);
    with_allocation(Reply::ok().pair("ReplacementNode", replacement), &merged)
}

async fn grow_into(
    svc: &Nonstop,
    job: &JobInfo,
    node: &str,
    standin: JobId,
) -> Result<JobInfo, SchedulerError> {
    let scheduler = svc.scheduler();
    let owner = job.user_id;

    let mut shrink = JobUpdate::new(standin);
    shrink.min_nodes = Some(NodeCount::Count(0));
    scheduler.update_job(&shrink, owner).await?;

    let mut grow = JobUpdate::new(job.job_id);
    grow.min_nodes = Some(NodeCount::Infinite);
    scheduler.update_job(&grow, owner).await?;

    let grown = scheduler
        .find_job(job.job_id)
        .await?
        .ok_or(SchedulerError::InvalidJobId(job.job_id))?;
    let (nodes, cpus_per_node): (Vec<String>, Vec<u32>) = grown
        .nodes
        .iter()
        .cloned()
        .zip(grown.cpus_per_node.iter().copied())
        .filter(|(n, _)| n != node)
        .unzip();
    let mut trim = JobUpdate::new(job.job_id);
    trim.req_nodes = Some(nodes.clone());
    if let Err(e) = scheduler.update_job(&trim, owner).await {
        // Hand the grown node back so the job keeps its original allocation
        let mut restore = JobUpdate::new(job.job_id);
        restore.req_nodes = Some(job.nodes.clone());
        if let Err(undo) = scheduler.update_job(&restore, owner).await {
            tracing::error!("Job {}: failed to restore allocation: {}", job.job_id, undo);
        }
        return Err(e);
    }

    Ok(refresh_job(
        svc,
        JobInfo {
            nodes,
            cpus_per_node,
            ..grown
        },
    )
    .await)
}
