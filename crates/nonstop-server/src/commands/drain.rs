use super::CommandResult;
use crate::protocol::{ErrorCode, Reply};
use crate::service::Nonstop;
use nonstop_parsers::expand_hostlist;

/// Mark every node of a hostlist as failing.
pub(crate) async fn drain(svc: &Nonstop, uid: u32, nodes: &str, reason: &str) -> CommandResult {
    if !svc.config().drain_permitted(uid) {
        tracing::info!("uid {} may not drain nodes", uid);
        return Err(Reply::error(ErrorCode::Perm));
    }
    let names = expand_hostlist(nodes).map_err(|e| {
        tracing::debug!("Bad hostlist {:?}: {}", nodes, e);
        Reply::error(ErrorCode::Cmd)
    })?;
    if names.is_empty() {
        return Err(Reply::error(ErrorCode::Cmd));
    }
    for name in &names {
        match svc.scheduler().find_node(name).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(Reply::error(ErrorCode::NoHost)),
            Err(e) => {
                tracing::warn!("Failed to look up node {}: {}", name, e);
                return Err(Reply::error(ErrorCode::NoHost));
            }
        }
    }

    if let Err(e) = svc
        .scheduler()
        .drain_nodes(&names, reason, svc.self_uid())
        .await
    {
        tracing::error!("Failed to drain {}: {}", nodes, e);
        return Err(Reply::error(ErrorCode::UpdNode));
    }
    tracing::info!("uid {} drained {}: {}", uid, nodes, reason);
    Ok(Reply::ok())
}

#[cfg(test)]
mod tests {
    use crate::protocol::ErrorCode;
    use crate::service::test_support::*;
    use crate::service::Nonstop;
    use nonstop_config::{Config, StaticUsers, UidList};
    use nonstop_slurm::Scheduler;
    use std::sync::Arc;

    fn drain_config(allow: &[u32], allow_all: bool, deny: &[u32]) -> Config {
        let users = StaticUsers::new(&[]);
        let list = |uids: &[u32], all: bool| {
            let mut text: Vec<String> = uids.iter().map(u32::to_string).collect();
            if all {
                text.push("ALL".to_string());
            }
            UidList::parse(&text.join(","), &users)
        };
        Config {
            user_drain_allow: list(allow, allow_all),
            user_drain_deny: list(deny, false),
            ..config()
        }
    }

    #[tokio::test]
    async fn test_drain_marks_nodes() {
        let sim = cluster();
        sim.add_node("batch", "nid3", 16, &[]);
        sim.add_node("batch", "nid4", 16, &[]);
        let svc = service(&sim, drain_config(&[OWNER], false, &[]));

        let reply = request(
            &svc,
            OWNER,
            "NONSTOP_1:DRAIN:NODES:nid[3-4]:REASON:\"bad dimm\"",
        )
        .await;
        assert_eq!(reply.to_wire(), "NONSTOP_1 ENOERROR");
        for name in ["nid3", "nid4"] {
            let node = sim.node(name).unwrap();
            assert!(node.state.is_failing());
            assert_eq!(node.reason.as_deref(), Some("bad dimm"));
        }
        assert!(!sim.node("nid10").unwrap().state.is_failing());
    }

    #[tokio::test]
    async fn test_drain_rule() {
        let sim = cluster();
        let text = "NONSTOP_1:DRAIN:NODES:nid10:REASON:x";

        // allow=[u1, ALL], deny=[]: anyone
        let svc = service(&sim, drain_config(&[OWNER], true, &[]));
        assert!(request(&svc, OTHER, text).await.is_ok());

        // deny=[u2] rejects u2 whatever allow says
        let svc = service(&sim, drain_config(&[], true, &[OTHER]));
        assert_eq!(request(&svc, OTHER, text).await.code, ErrorCode::Perm);
        assert!(request(&svc, OWNER, text).await.is_ok());

        // Nobody allowed by default
        let svc = service(&sim, config());
        assert_eq!(request(&svc, OWNER, text).await.code, ErrorCode::Perm);
    }

    #[tokio::test]
    async fn test_drain_unknown_node() {
        let sim = cluster();
        let svc = service(&sim, drain_config(&[], true, &[]));
        let reply = request(&svc, OWNER, "NONSTOP_1:DRAIN:NODES:nid[10,77]:REASON:x").await;
        assert_eq!(reply.code, ErrorCode::NoHost);
        assert!(!sim.node("nid10").unwrap().state.is_failing());
    }

    #[tokio::test]
    async fn test_drain_scheduler_failure() {
        let sim = cluster();
        // The cluster only lets its admin drain nodes
        let scheduler: Arc<dyn Scheduler> = sim.clone();
        let svc = Nonstop::new(drain_config(&[], true, &[]), scheduler, 4242);
        let reply = request(&svc, OWNER, "NONSTOP_1:DRAIN:NODES:nid10:REASON:x").await;
        assert_eq!(reply.code, ErrorCode::UpdNode);
        assert!(!sim.node("nid10").unwrap().state.is_failing());
    }
}
