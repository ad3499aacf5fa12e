//! Scheduler backend driving a live SLURM controller through its command
//! line tools (`scontrol`, `scancel`, `sbatch`).
//!
//! Every query uses `scontrol -o` one-line output so records can be parsed
//! with [`nonstop_parsers::parse_record`].

use crate::scheduler::{Scheduler, SchedulerError};
use crate::types::{
    AllocMode, Allocation, Dependency, JobDescriptor, JobId, JobInfo, JobState, JobUpdate,
    NodeCount, NodeInfo, NodeState, ReservationInfo, ReservationUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use nix::unistd::{Uid, User, geteuid};
use nonstop_parsers::{
    CommandError, compress_hostlist, count_cpu_ids, expand_hostlist, non_empty_string,
    parse_record, parse_record_pairs, parse_slurm_timestamp, parse_time_limit_minutes,
    run_command, run_command_capture,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tokio::process::Command;

/// `alice(1000)` -> 1000
static UID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((\d+)\)").expect("valid uid regex"));

/// `sbatch: Job 1234 to start at 2024-01-15T10:30:00 using 32 processors on nodes nid99 in partition batch`
static WILL_RUN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"to start at (\S+) using \d+ processors on nodes (\S+)").expect("valid regex")
});

/// Command used as the body of stand-in jobs; the job is never meant to run it
/// to completion since it is merged into its parent and then killed.
const STANDIN_WRAP: &str = "sleep infinity";

/// Scheduler backed by the SLURM command line tools.
#[derive(Debug, Default, Clone)]
pub struct ScontrolScheduler;

impl ScontrolScheduler {
    pub fn new() -> Self {
        Self
    }
}

/// Map a failed command to the closest scheduler error.
fn map_command_error(err: CommandError) -> SchedulerError {
    let Some(stderr) = err.stderr() else {
        return SchedulerError::Command(err.to_string());
    };
    let lower = stderr.to_lowercase();
    if lower.contains("requested nodes are busy") || lower.contains("immediate") {
        SchedulerError::NodesBusy
    } else if lower.contains("access") && lower.contains("denied") {
        SchedulerError::AccessDenied
    } else if lower.contains("invalid partition") {
        SchedulerError::InvalidPartition(stderr.to_string())
    } else if lower.contains("reservation") && lower.contains("invalid") {
        SchedulerError::InvalidReservation(stderr.to_string())
    } else {
        SchedulerError::Command(err.to_string())
    }
}

fn is_not_found(err: &CommandError) -> bool {
    err.stderr()
        .map(|s| {
            let s = s.to_lowercase();
            s.contains("invalid job id") || s.contains("not found")
        })
        .unwrap_or(false)
}

async fn scontrol_show(entity: &str, name: Option<&str>) -> Result<Option<String>, SchedulerError> {
    let mut cmd = Command::new("scontrol");
    cmd.args(["-o", "-d", "show", entity]);
    if let Some(name) = name {
        cmd.arg(name);
    }
    match run_command(&mut cmd, "scontrol").await {
        Ok(out) => Ok(Some(out)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(map_command_error(e)),
    }
}

/// Every node known to the controller.
pub async fn query_nodes() -> Result<Vec<NodeInfo>, SchedulerError> {
    let out = scontrol_show("node", None).await?.unwrap_or_default();
    out.lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_node_line)
        .collect()
}

fn parse_uid(s: &str) -> Option<u32> {
    UID_RE
        .captures(s)
        .and_then(|c| c[1].parse().ok())
        .or_else(|| s.trim().parse().ok())
}

fn uid_to_name(uid: u32) -> Result<String, SchedulerError> {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => Ok(user.name),
        _ => Err(SchedulerError::Command(format!("Unknown uid {}", uid))),
    }
}

fn name_to_uid(name: &str) -> Option<u32> {
    User::from_name(name)
        .ok()
        .flatten()
        .map(|u| u.uid.as_raw())
        .or_else(|| name.parse().ok())
}

/// Parse a `scontrol -o -d show job` line.
fn parse_job_line(line: &str) -> Result<JobInfo, SchedulerError> {
    let pairs = parse_record_pairs(line);
    let rec = parse_record(line);
    let field = |key: &str| rec.get(key).map(String::as_str).unwrap_or("");

    let job_id = field("JobId")
        .parse()
        .map_err(|_| SchedulerError::Parse(format!("Missing JobId: {}", line)))?;
    let user_id = parse_uid(field("UserId"))
        .ok_or_else(|| SchedulerError::Parse(format!("Missing UserId: {}", line)))?;

    let nodes = match non_empty_string(field("NodeList")) {
        Some(list) => expand_hostlist(&list).map_err(|e| SchedulerError::Parse(e.to_string()))?,
        None => Vec::new(),
    };

    // Detail output lists "Nodes=<hostlist> CPU_IDs=<ids>" per node group
    let mut detail: HashMap<String, u32> = HashMap::new();
    let mut group: Vec<String> = Vec::new();
    for (key, value) in &pairs {
        match key.as_str() {
            "Nodes" => group = expand_hostlist(value).unwrap_or_default(),
            "CPU_IDs" => {
                let count = count_cpu_ids(value);
                for node in group.drain(..) {
                    detail.insert(node, count);
                }
            }
            _ => {}
        }
    }
    let fallback = field("NumCPUs")
        .parse::<u32>()
        .ok()
        .filter(|_| !nodes.is_empty())
        .map(|total| total / nodes.len() as u32)
        .unwrap_or(0);
    let cpus_per_node = nodes
        .iter()
        .map(|n| detail.get(n).copied().unwrap_or(fallback))
        .collect();

    Ok(JobInfo {
        job_id,
        name: field("JobName").to_string(),
        user_id,
        state: JobState::parse(field("JobState")),
        partition: non_empty_string(field("Partition")),
        account: non_empty_string(field("Account")),
        qos: non_empty_string(field("QOS")),
        nodes,
        cpus_per_node,
        features: non_empty_string(field("Features")),
        time_limit: parse_time_limit_minutes(field("TimeLimit")),
        start_time: parse_slurm_timestamp(field("StartTime")),
        dependency: Dependency::parse(field("Dependency")),
    })
}

/// Parse a `scontrol -o show node` line.
fn parse_node_line(line: &str) -> Result<NodeInfo, SchedulerError> {
    let rec = parse_record(line);
    let name = rec
        .get("NodeName")
        .cloned()
        .ok_or_else(|| SchedulerError::Parse(format!("Missing NodeName: {}", line)))?;
    let features = rec
        .get("AvailableFeatures")
        .or_else(|| rec.get("Features"))
        .and_then(|f| non_empty_string(f))
        .map(|f| f.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    Ok(NodeInfo {
        name,
        state: NodeState::parse(rec.get("State").map(String::as_str).unwrap_or("UNKNOWN")),
        cpus: rec.get("CPUTot").and_then(|c| c.parse().ok()).unwrap_or(0),
        features,
        reason: rec.get("Reason").and_then(|r| non_empty_string(r)),
    })
}

/// Parse a `scontrol -o show reservation` line.
fn parse_reservation_line(line: &str) -> Result<ReservationInfo, SchedulerError> {
    let rec = parse_record(line);
    let name = rec
        .get("ReservationName")
        .cloned()
        .ok_or_else(|| SchedulerError::Parse(format!("Missing ReservationName: {}", line)))?;
    let nodes = rec
        .get("Nodes")
        .and_then(|n| non_empty_string(n))
        .map(|n| expand_hostlist(&n).unwrap_or_default())
        .unwrap_or_default();
    let user_ids = rec
        .get("Users")
        .and_then(|u| non_empty_string(u))
        .map(|u| u.split(',').filter_map(name_to_uid).collect())
        .unwrap_or_default();

    Ok(ReservationInfo {
        name,
        nodes,
        user_ids,
    })
}

/// Parse the stderr of `sbatch --test-only`.
fn parse_will_run(stderr: &str) -> Option<(DateTime<Utc>, Vec<String>)> {
    let caps = WILL_RUN_RE.captures(stderr)?;
    let start = parse_slurm_timestamp(&caps[1])?;
    let nodes = expand_hostlist(&caps[2]).unwrap_or_default();
    Some((start, nodes))
}

/// Build the sbatch arguments common to every submission mode.
fn sbatch_args(desc: &JobDescriptor, as_uid: u32) -> Vec<String> {
    let mut args = vec![
        "--parsable".to_string(),
        format!("--job-name={}", desc.name),
        format!("--nodes={}", desc.min_nodes.max(1)),
    ];
    if as_uid != geteuid().as_raw() {
        args.push(format!("--uid={}", as_uid));
    }
    if let Some(p) = &desc.partition {
        args.push(format!("--partition={}", p));
    }
    if let Some(a) = &desc.account {
        args.push(format!("--account={}", a));
    }
    if let Some(q) = &desc.qos {
        args.push(format!("--qos={}", q));
    }
    if let Some(f) = &desc.features {
        args.push(format!("--constraint={}", f));
    }
    if let Some(r) = &desc.reservation {
        args.push(format!("--reservation={}", r));
    }
    if let Some(d) = &desc.dependency {
        args.push(format!("--dependency={}", d.to_arg()));
    }
    if let Some(t) = desc.time_limit {
        args.push(format!("--time={}", t));
    }
    args
}

#[async_trait]
impl Scheduler for ScontrolScheduler {
    async fn find_job(&self, job_id: JobId) -> Result<Option<JobInfo>, SchedulerError> {
        let Some(out) = scontrol_show("job", Some(&job_id.to_string())).await? else {
            return Ok(None);
        };
        match out.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => parse_job_line(line).map(Some),
            None => Ok(None),
        }
    }

    async fn find_node(&self, name: &str) -> Result<Option<NodeInfo>, SchedulerError> {
        let Some(out) = scontrol_show("node", Some(name)).await? else {
            return Ok(None);
        };
        match out.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => parse_node_line(line).map(Some),
            None => Ok(None),
        }
    }

    async fn failing_nodes(&self) -> Result<Vec<NodeInfo>, SchedulerError> {
        Ok(query_nodes()
            .await?
            .into_iter()
            .filter(|n| n.state.is_failing())
            .collect())
    }

    async fn partitions(&self) -> Result<Vec<String>, SchedulerError> {
        let out = scontrol_show("partition", None).await?.unwrap_or_default();
        Ok(out
            .lines()
            .filter_map(|l| parse_record(l).remove("PartitionName"))
            .collect())
    }

    async fn find_reservation(
        &self,
        name: &str,
    ) -> Result<Option<ReservationInfo>, SchedulerError> {
        let Some(out) = scontrol_show("reservation", Some(name)).await? else {
            return Ok(None);
        };
        match out.lines().find(|l| l.contains("ReservationName=")) {
            Some(line) => parse_reservation_line(line).map(Some),
            None => Ok(None),
        }
    }

    async fn signal_job(
        &self,
        job_id: JobId,
        signal: Signal,
        as_uid: u32,
    ) -> Result<(), SchedulerError> {
        tracing::debug!("Signalling job {} with {} on behalf of uid {}", job_id, signal, as_uid);
        let mut cmd = Command::new("scancel");
        cmd.arg(format!("--signal={}", signal as i32))
            .arg("--full")
            .arg(job_id.to_string());
        run_command(&mut cmd, "scancel")
            .await
            .map(|_| ())
            .map_err(map_command_error)
    }

    async fn update_job(&self, update: &JobUpdate, as_uid: u32) -> Result<(), SchedulerError> {
        let mut cmd = Command::new("scontrol");
        cmd.arg("update").arg(format!("JobId={}", update.job_id));
        if let Some(minutes) = update.time_limit_incr {
            cmd.arg(format!("TimeLimit=+{}", minutes));
        }
        match update.min_nodes {
            Some(NodeCount::Count(n)) => {
                cmd.arg(format!("NumNodes={}", n));
            }
            Some(NodeCount::Infinite) => {
                cmd.arg("NumNodes=ALL");
            }
            None => {}
        }
        if let Some(nodes) = &update.req_nodes {
            cmd.arg(format!("NodeList={}", compress_hostlist(nodes)));
        }
        tracing::debug!("Updating job {} on behalf of uid {}", update.job_id, as_uid);
        run_command(&mut cmd, "scontrol")
            .await
            .map(|_| ())
            .map_err(map_command_error)
    }

    async fn allocate_job(
        &self,
        desc: &JobDescriptor,
        mode: AllocMode,
        as_uid: u32,
    ) -> Result<Allocation, SchedulerError> {
        let mut cmd = Command::new("sbatch");
        cmd.args(sbatch_args(desc, as_uid));
        match mode {
            AllocMode::Immediate => {
                cmd.arg("--immediate");
            }
            AllocMode::WillRun => {
                cmd.arg("--test-only");
            }
            AllocMode::Deferred => {}
        }
        cmd.args(["--wrap", STANDIN_WRAP]);

        let out = run_command_capture(&mut cmd, "sbatch")
            .await
            .map_err(map_command_error)?;

        if mode == AllocMode::WillRun {
            let (start, nodes) = parse_will_run(&out.stderr).ok_or_else(|| {
                SchedulerError::Parse(format!("Unexpected will-run reply: {}", out.stderr.trim()))
            })?;
            return Ok(Allocation {
                job_id: 0,
                nodes,
                start_time: Some(start),
                started: false,
            });
        }

        // --parsable prints "<job_id>[;<cluster>]"
        let job_id: JobId = out
            .stdout
            .trim()
            .split(';')
            .next()
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| {
                SchedulerError::Parse(format!("Unexpected sbatch reply: {}", out.stdout))
            })?;

        let job = self
            .find_job(job_id)
            .await?
            .ok_or(SchedulerError::InvalidJobId(job_id))?;
        Ok(Allocation {
            job_id,
            started: job.state.is_running(),
            nodes: job.nodes,
            start_time: job.start_time,
        })
    }

    async fn update_reservation(&self, update: &ReservationUpdate) -> Result<(), SchedulerError> {
        let users = match update {
            ReservationUpdate::AddUser { uid, .. } => format!("Users+={}", uid_to_name(*uid)?),
            ReservationUpdate::RemoveUser { uid, .. } => format!("Users-={}", uid_to_name(*uid)?),
        };
        let mut cmd = Command::new("scontrol");
        cmd.arg("update")
            .arg(format!("ReservationName={}", update.name()))
            .arg(users);
        run_command(&mut cmd, "scontrol")
            .await
            .map(|_| ())
            .map_err(map_command_error)
    }

    async fn drain_nodes(
        &self,
        nodes: &[String],
        reason: &str,
        as_uid: u32,
    ) -> Result<(), SchedulerError> {
        tracing::info!(
            "Marking {} failing on behalf of uid {}: {}",
            compress_hostlist(nodes),
            as_uid,
            reason
        );
        let mut cmd = Command::new("scontrol");
        cmd.arg("update")
            .arg(format!("NodeName={}", compress_hostlist(nodes)))
            .arg("State=FAIL")
            .arg(format!("Reason={}", reason));
        run_command(&mut cmd, "scontrol")
            .await
            .map(|_| ())
            .map_err(map_command_error)
    }
}
