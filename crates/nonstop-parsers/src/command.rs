//! Command execution utilities for scheduler queries and updates.

use thiserror::Error;
use tokio::process::Command;

/// Error type for command execution.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to execute {command}: {error}")]
    Execution { command: String, error: String },
    #[error("Command {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

impl CommandError {
    /// Diagnostic text the command printed, if it ran at all.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr),
            Self::Execution { .. } => None,
        }
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Execute a command and return stdout as a string.
///
/// This is a convenience wrapper that handles common error cases
/// and UTF-8 conversion for scheduler command output.
pub async fn run_command(cmd: &mut Command, name: &str) -> Result<String, CommandError> {
    run_command_capture(cmd, name).await.map(|out| out.stdout)
}

/// Execute a command and return both output streams.
///
/// Several SLURM tools (`salloc`, `sbatch --test-only`) report their result
/// on stderr, so callers that parse those need both.
pub async fn run_command_capture(
    cmd: &mut Command,
    name: &str,
) -> Result<CommandOutput, CommandError> {
    let output = cmd.output().await.map_err(|e| CommandError::Execution {
        command: name.to_string(),
        error: e.to_string(),
    })?;

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(CommandError::Failed {
            command: name.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_success() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let result = run_command(&mut cmd, "echo").await.unwrap();
        assert_eq!(result.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_not_found() {
        let mut cmd = Command::new("nonexistent_command_12345");
        let result = run_command(&mut cmd, "nonexistent").await;
        assert!(matches!(result, Err(CommandError::Execution { .. })));
    }

    #[tokio::test]
    async fn test_run_command_capture_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let out = run_command_capture(&mut cmd, "sh").await.unwrap();
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_command_failure_keeps_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo nope >&2; exit 3"]);
        let err = run_command(&mut cmd, "sh").await.unwrap_err();
        assert_eq!(err.stderr(), Some("nope"));
    }
}
