//! Query the active job queue via squeue.

use crate::types::{Dependency, JobId, JobState};
use nonstop_parsers::{expand_hostlist, non_empty_string, run_command, split_delimited};
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum SqueueError {
    #[error("Failed to execute squeue: {0}")]
    ExecutionError(String),
    #[error("Failed to parse squeue output: {0}")]
    ParseError(String),
}

/// squeue output format:
/// %i - Job ID
/// %T - State (extended)
/// %U - User ID
/// %N - Nodelist
/// %E - Dependency
const SQUEUE_FORMAT: &str = "%i|%T|%U|%N|%E";

/// One job in the active queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub state: JobState,
    pub user_id: u32,
    pub nodes: Vec<String>,
    pub dependency: Option<Dependency>,
}

/// Parse a single line of squeue output.
fn parse_squeue_line(line: &str) -> Result<QueueEntry, SqueueError> {
    let fields = split_delimited(line, 5).map_err(SqueueError::ParseError)?;

    let job_id = fields[0]
        .trim()
        .parse()
        .map_err(|_| SqueueError::ParseError(format!("Bad job id: {}", line)))?;
    let user_id = fields[2]
        .trim()
        .parse()
        .map_err(|_| SqueueError::ParseError(format!("Bad user id: {}", line)))?;
    let nodes = match non_empty_string(fields[3]) {
        Some(list) => {
            expand_hostlist(&list).map_err(|e| SqueueError::ParseError(e.to_string()))?
        }
        None => Vec::new(),
    };

    Ok(QueueEntry {
        job_id,
        state: JobState::parse(fields[1]),
        user_id,
        nodes,
        dependency: Dependency::parse(fields[4]),
    })
}

/// Query all active jobs (pending, running, completing) with squeue.
pub async fn query_squeue() -> Result<Vec<QueueEntry>, SqueueError> {
    let mut cmd = Command::new("squeue");
    cmd.args(["-a", "-h", "-o", SQUEUE_FORMAT]);

    let stdout = run_command(&mut cmd, "squeue")
        .await
        .map_err(|e| SqueueError::ExecutionError(e.to_string()))?;

    let mut jobs = Vec::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_squeue_line(line) {
            Ok(job) => jobs.push(job),
            Err(e) => tracing::warn!("Skipping squeue line: {}", e),
        }
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_squeue_line() {
        let entry = parse_squeue_line("42|RUNNING|1000|nid[10-11]|(null)").unwrap();
        assert_eq!(entry.job_id, 42);
        assert_eq!(entry.state, JobState::Running);
        assert_eq!(entry.user_id, 1000);
        assert_eq!(entry.nodes, vec!["nid10", "nid11"]);
        assert_eq!(entry.dependency, None);
    }

    #[test]
    fn test_parse_squeue_line_pending_expand() {
        let entry = parse_squeue_line("43|PENDING|1000||expand:42(unfulfilled)").unwrap();
        assert_eq!(entry.state, JobState::Pending);
        assert!(entry.nodes.is_empty());
        assert_eq!(entry.dependency, Some(Dependency::Expand(42)));
    }

    #[test]
    fn test_parse_squeue_line_errors() {
        assert!(parse_squeue_line("x|RUNNING|1000|nid1|").is_err());
        assert!(parse_squeue_line("1|RUNNING").is_err());
    }
}
