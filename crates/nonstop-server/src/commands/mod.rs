//! Command handlers.
//!
//! Each handler validates in a fixed order (job, authorization, running
//! state, node) and returns the first failing check as an error reply. The
//! registry lock is only taken between scheduler calls, and every record is
//! looked up again after a call returns.
//!
//! Handlers that change state run one at a time under the service's
//! command lock; see [`Nonstop::handle_request`].

mod callback;
mod drain;
mod drop_node;
mod fail_nodes;
mod replace;
mod show;
mod time;

pub(crate) use callback::callback;
pub(crate) use drain::drain;
pub(crate) use drop_node::drop_node;
pub(crate) use fail_nodes::fail_nodes;
pub(crate) use replace::replace_node;
pub(crate) use show::{show_config, show_job};
pub(crate) use time::time_incr;

use crate::protocol::{ErrorCode, Reply};
use crate::service::Nonstop;
use nonstop_parsers::format_cpu_pattern;
use nonstop_slurm::{JobId, JobInfo, NodeInfo};

/// `Err` carries an error reply; both sides are sent to the client.
pub(crate) type CommandResult = Result<Reply, Reply>;

/// Look up a job and check that `uid` may act on it: the owner, root, or
/// the service itself.
pub(crate) async fn authorized_job(
    svc: &Nonstop,
    uid: u32,
    job_id: JobId,
) -> Result<JobInfo, Reply> {
    let job = match svc.scheduler().find_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return Err(Reply::error(ErrorCode::JobId)),
        Err(e) => {
            tracing::warn!("Failed to look up job {}: {}", job_id, e);
            return Err(Reply::error(ErrorCode::JobId));
        }
    };
    if uid != job.user_id && uid != 0 && uid != svc.self_uid() {
        tracing::info!("uid {} may not act on job {} of uid {}", uid, job_id, job.user_id);
        return Err(Reply::error(ErrorCode::Perm));
    }
    Ok(job)
}

pub(crate) fn require_running(job: &JobInfo) -> Result<(), Reply> {
    if job.state.is_running() {
        Ok(())
    } else {
        Err(Reply::error(ErrorCode::JobNotRun))
    }
}

/// Check that `name` is a node of `job` that has failed or is failing.
pub(crate) async fn failed_node(
    svc: &Nonstop,
    job: &JobInfo,
    name: &str,
) -> Result<NodeInfo, Reply> {
    let node = match svc.scheduler().find_node(name).await {
        Ok(Some(node)) => node,
        Ok(None) => return Err(Reply::error(ErrorCode::NoHost)),
        Err(e) => {
            tracing::warn!("Failed to look up node {}: {}", name, e);
            return Err(Reply::error(ErrorCode::NoHost));
        }
    };
    let Some(cpus) = job.cpus_on(name) else {
        return Err(Reply::error(ErrorCode::NodeNotInJob));
    };
    if cpus == 0 {
        return Err(Reply::error(ErrorCode::NodeNoCpu));
    }
    let recorded = svc
        .registry()
        .lock()
        .get(job.job_id)
        .is_some_and(|rec| rec.owner_uid == job.user_id && rec.has_failed_node(name));
    if !recorded && !node.state.is_failing() && !node.state.is_down() {
        return Err(Reply::error(ErrorCode::NodeNotFail));
    }
    Ok(node)
}

/// Re-read a job after modifying it, falling back to `expected`.
pub(crate) async fn refresh_job(svc: &Nonstop, expected: JobInfo) -> JobInfo {
    match svc.scheduler().find_job(expected.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => expected,
        Err(e) => {
            tracing::warn!("Failed to re-read job {}: {}", expected.job_id, e);
            expected
        }
    }
}

/// Append the `NewNodeList`, `NewNodeCount` and `NewCpusPerNode` pairs.
pub(crate) fn with_allocation(reply: Reply, job: &JobInfo) -> Reply {
    reply
        .pair("NewNodeList", job.node_list())
        .pair("NewNodeCount", job.node_count())
        .pair("NewCpusPerNode", format_cpu_pattern(&job.cpus_per_node))
}
