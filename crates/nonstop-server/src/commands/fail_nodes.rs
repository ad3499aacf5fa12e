use super::{CommandResult, authorized_job};
use crate::protocol::Reply;
use crate::service::Nonstop;
use nonstop_slurm::JobId;

/// Selects nodes flagged to fail soon; also their reported state.
const FAIL_STATE_FAILING: u32 = 0x01;
/// Selects nodes that already failed; also their reported state.
const FAIL_STATE_FAILED: u32 = 0x02;

/// List the job's failed and failing nodes as `node cpus state` triples.
pub(crate) async fn fail_nodes(
    svc: &Nonstop,
    uid: u32,
    job_id: JobId,
    state_flags: u32,
) -> CommandResult {
    let job = authorized_job(svc, uid, job_id).await?;

    let recorded = svc
        .registry()
        .lock()
        .get(job_id)
        .filter(|rec| rec.owner_uid == job.user_id)
        .map(|rec| rec.fail_nodes.clone())
        .unwrap_or_default();

    let mut listed: Vec<(String, u32, u32)> = Vec::new();
    for failed in recorded {
        let state = match svc.scheduler().find_node(&failed.name).await {
            Ok(Some(node)) if !node.state.is_down() && node.state.is_failing() => {
                FAIL_STATE_FAILING
            }
            _ => FAIL_STATE_FAILED,
        };
        listed.push((failed.name, failed.cpus, state));
    }

    match svc.scheduler().failing_nodes().await {
        Ok(failing) => {
            for node in failing {
                if listed.iter().any(|(name, _, _)| *name == node.name) {
                    continue;
                }
                if let Some(cpus) = job.cpus_on(&node.name) {
                    listed.push((node.name, cpus, FAIL_STATE_FAILING));
                }
            }
        }
        Err(e) => tracing::warn!("Failed to list failing nodes: {}", e),
    }

    let selected: Vec<_> = listed
        .into_iter()
        .filter(|(_, _, state)| state_flags & state != 0)
        .collect();
    let mut reply = Reply::ok().pair("FAIL_NODE_CNT", selected.len());
    for (name, cpus, state) in selected {
        reply = reply.push(name).push(cpus).push(state);
    }
    Ok(reply)
}
