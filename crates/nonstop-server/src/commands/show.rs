use super::{CommandResult, authorized_job};
use crate::protocol::Reply;
use crate::service::Nonstop;
use nonstop_parsers::compress_hostlist;
use nonstop_slurm::JobId;
use nonstop_state::FailureRecord;

/// Placeholder for empty values, which would otherwise vanish from the
/// whitespace separated reply.
const NONE: &str = "(null)";

/// Echo the active configuration as `Key=Value` tokens.
pub(crate) fn show_config(svc: &Nonstop) -> Reply {
    svc.config()
        .entries()
        .into_iter()
        .fold(Reply::ok(), |reply, (key, value)| {
            reply.push(format!("{}={}", key, value))
        })
}

/// Echo a job's failure record and the scheduler's failing nodes within
/// its allocation.
pub(crate) async fn show_job(svc: &Nonstop, uid: u32, job_id: JobId) -> CommandResult {
    let job = authorized_job(svc, uid, job_id).await?;
    let rec = svc
        .registry()
        .lock()
        .get(job_id)
        .filter(|rec| rec.owner_uid == job.user_id)
        .cloned()
        .unwrap_or_else(|| FailureRecord::new(job_id, job.user_id));

    let failing: Vec<String> = match svc.scheduler().failing_nodes().await {
        Ok(nodes) => nodes
            .into_iter()
            .filter(|n| job.contains_node(&n.name))
            .map(|n| n.name)
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to list failing nodes: {}", e);
            Vec::new()
        }
    };

    let fail_nodes = if rec.fail_nodes.is_empty() {
        NONE.to_string()
    } else {
        rec.fail_nodes
            .iter()
            .map(|n| format!("{}:{}", n.name, n.cpus))
            .collect::<Vec<_>>()
            .join(",")
    };
    let or_none = |s: String| if s.is_empty() { NONE.to_string() } else { s };

    Ok(Reply::ok()
        .pair("JobId", rec.job_id)
        .pair("UserId", rec.owner_uid)
        .pair(
            "CallbackAddr",
            rec.callback_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| NONE.to_string()),
        )
        .pair("CallbackPort", rec.callback_port)
        .pair("CallbackFlags", rec.callback_flags)
        .pair("FailNodeCount", rec.fail_nodes.len())
        .pair("FailNodes", fail_nodes)
        .pair("PendingJobId", rec.pending_job_id)
        .pair("PendingNodeName", or_none(rec.pending_node_name.clone()))
        .pair("PendingJobDelay", rec.pending_job_delay)
        .pair("ReplaceCount", rec.replace_count)
        .pair("TimeExtendAvail", rec.time_extend_avail)
        .pair("FailingNodeCount", failing.len())
        .pair("FailingNodes", or_none(compress_hostlist(&failing))))
}

#[cfg(test)]
mod tests {
    use crate::service::test_support::*;
    use nonstop_config::Config;
    use nonstop_slurm::Scheduler;

    #[tokio::test]
    async fn test_show_config_is_stable() {
        let sim = cluster();
        let svc = service(
            &sim,
            Config {
                hot_spare_count: vec![("batch".to_string(), 2)],
                max_spare_node_count: 1,
                ..config()
            },
        );
        let first = request(&svc, OTHER, "NONSTOP_1:SHOW_CONFIG").await;
        let second = request(&svc, OTHER, "NONSTOP_1:SHOW_CONFIG").await;
        assert_eq!(first, second);
        assert!(first.is_ok());
        assert_eq!(first.setting("ControlAddr"), Some("127.0.0.1"));
        assert_eq!(first.setting("Port"), Some("6820"));
        assert_eq!(first.setting("HotSpareCount"), Some("batch:2"));
        assert_eq!(first.setting("MaxSpareNodeCount"), Some("1"));
        assert_eq!(first.setting("TimeLimitExtend"), Some("5"));
        assert_eq!(first.setting("ReadTimeout"), Some("2000"));
    }

    #[tokio::test]
    async fn test_show_job() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10", "nid11"], Some(60), None);
        sim.set_node_down("nid10").await;
        sim.drain_nodes(&["nid11".to_string()], "ecc", SELF_UID)
            .await
            .unwrap();

        let reply = request(&svc, OWNER, &format!("NONSTOP_1:SHOW_JOB:JOBID:{}", job)).await;
        assert!(reply.is_ok());
        assert_eq!(reply.value("JobId"), Some(job.to_string().as_str()));
        assert_eq!(reply.value("UserId"), Some("1000"));
        assert_eq!(reply.value("FailNodeCount"), Some("2"));
        assert_eq!(reply.value("FailNodes"), Some("nid10:32,nid11:32"));
        assert_eq!(reply.value("CallbackFlags"), Some("0x3"));
        assert_eq!(reply.value("PendingNodeName"), Some("(null)"));
        assert_eq!(reply.value("TimeExtendAvail"), Some("10"));
        assert_eq!(reply.value("FailingNodes"), Some("nid11"));
    }

    #[tokio::test]
    async fn test_show_job_without_record() {
        let sim = cluster();
        let svc = service(&sim, config());
        let job = sim.submit_running(OWNER, "batch", &["nid10"], Some(60), None);
        let reply = request(&svc, OWNER, &format!("NONSTOP_1:SHOW_JOB:JOBID:{}", job)).await;
        assert_eq!(reply.value("FailNodeCount"), Some("0"));
        assert_eq!(reply.value("FailingNodes"), Some("(null)"));
        assert!(svc.registry().lock().get(job).is_none());
    }
}
