//! Textual commands and replies.
//!
//! A request is `NONSTOP_1:<COMMAND>[:<KEY>:<value>...]`; a reply is
//! `NONSTOP_1 <CODE> [token ...]`.

use nonstop_slurm::JobId;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol version token leading every request and reply.
pub const VERSION: &str = "NONSTOP_1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing or unsupported protocol version in {0:?}")]
    Version(String),
    #[error("Unknown command {0:?}")]
    UnknownCommand(String),
    #[error("Malformed arguments for {command}: {text:?}")]
    Arguments { command: String, text: String },
    #[error("Unknown reply code {0:?}")]
    UnknownCode(String),
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Subscribe to event notifications on `port` of the sender's address.
    Callback { job_id: JobId, port: u32 },
    /// Mark nodes failing.
    Drain { nodes: String, reason: String },
    /// List failed/failing nodes of a job; `state_flags` selects which.
    GetFailNodes { job_id: JobId, state_flags: u32 },
    DropNode { job_id: JobId, node: String },
    ReplaceNode { job_id: JobId, node: String },
    ShowConfig,
    ShowJob { job_id: JobId },
    /// Spend extension credit; 0 means all of it.
    TimeIncr { job_id: JobId, minutes: u32 },
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Split `KEY:value[:KEY:value...]`, checking key names. The last value
/// keeps any further colons.
fn arguments<'a>(
    command: &str,
    rest: &'a str,
    keys: &[&str],
) -> Result<Vec<&'a str>, ProtocolError> {
    let malformed = || ProtocolError::Arguments {
        command: command.to_string(),
        text: rest.to_string(),
    };
    let parts: Vec<&str> = rest.splitn(keys.len() * 2, ':').collect();
    if parts.len() != keys.len() * 2 {
        return Err(malformed());
    }
    let mut values = Vec::with_capacity(keys.len());
    for (pair, key) in parts.chunks(2).zip(keys) {
        if !pair[0].eq_ignore_ascii_case(key) {
            return Err(malformed());
        }
        values.push(pair[1]);
    }
    Ok(values)
}

fn number<T: FromStr>(command: &str, value: &str) -> Result<T, ProtocolError> {
    unquote(value)
        .parse()
        .map_err(|_| ProtocolError::Arguments {
            command: command.to_string(),
            text: value.to_string(),
        })
}

impl Command {
    /// Parse a request plaintext, including the version prefix.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim_end_matches(['\0', '\n', '\r']);
        let body = text
            .strip_prefix(VERSION)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| ProtocolError::Version(text.to_string()))?;
        let (name, rest) = body.split_once(':').unwrap_or((body, ""));
        let name = name.to_ascii_uppercase();
        let cmd = name.as_str();

        Ok(match cmd {
            "CALLBACK" => {
                let v = arguments(cmd, rest, &["JOBID", "PORT"])?;
                Self::Callback {
                    job_id: number(cmd, v[0])?,
                    port: number(cmd, v[1])?,
                }
            }
            "DRAIN" => {
                let v = arguments(cmd, rest, &["NODES", "REASON"])?;
                Self::Drain {
                    nodes: unquote(v[0]).to_string(),
                    reason: unquote(v[1]).to_string(),
                }
            }
            "GET_FAIL_NODES" => {
                let v = arguments(cmd, rest, &["JOBID", "STATE_FLAGS"])?;
                Self::GetFailNodes {
                    job_id: number(cmd, v[0])?,
                    state_flags: number(cmd, v[1])?,
                }
            }
            "DROP_NODE" => {
                let v = arguments(cmd, rest, &["JOBID", "NODE"])?;
                Self::DropNode {
                    job_id: number(cmd, v[0])?,
                    node: unquote(v[1]).to_string(),
                }
            }
            "REPLACE_NODE" => {
                let v = arguments(cmd, rest, &["JOBID", "NODE"])?;
                Self::ReplaceNode {
                    job_id: number(cmd, v[0])?,
                    node: unquote(v[1]).to_string(),
                }
            }
            "SHOW_CONFIG" => Self::ShowConfig,
            "SHOW_JOB" => {
                let v = arguments(cmd, rest, &["JOBID"])?;
                Self::ShowJob {
                    job_id: number(cmd, v[0])?,
                }
            }
            "TIME_INCR" => {
                let v = arguments(cmd, rest, &["JOBID", "MINUTES"])?;
                Self::TimeIncr {
                    job_id: number(cmd, v[0])?,
                    minutes: number(cmd, v[1])?,
                }
            }
            _ => return Err(ProtocolError::UnknownCommand(name)),
        })
    }

    /// Request plaintext for this command.
    pub fn to_wire(&self) -> String {
        let body = match self {
            Self::Callback { job_id, port } => format!("CALLBACK:JOBID:{}:PORT:{}", job_id, port),
            Self::Drain { nodes, reason } => {
                format!("DRAIN:NODES:{}:REASON:\"{}\"", nodes, reason)
            }
            Self::GetFailNodes {
                job_id,
                state_flags,
            } => format!("GET_FAIL_NODES:JOBID:{}:STATE_FLAGS:{}", job_id, state_flags),
            Self::DropNode { job_id, node } => format!("DROP_NODE:JOBID:{}:NODE:{}", job_id, node),
            Self::ReplaceNode { job_id, node } => {
                format!("REPLACE_NODE:JOBID:{}:NODE:{}", job_id, node)
            }
            Self::ShowConfig => "SHOW_CONFIG".to_string(),
            Self::ShowJob { job_id } => format!("SHOW_JOB:JOBID:{}", job_id),
            Self::TimeIncr { job_id, minutes } => {
                format!("TIME_INCR:JOBID:{}:MINUTES:{}", job_id, minutes)
            }
        };
        format!("{}:{}", VERSION, body)
    }
}

/// Result code leading every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    NoError,
    Perm,
    JobId,
    JobNotRun,
    NoHost,
    NodeNotFail,
    NodeNoCpu,
    NodeNotInJob,
    MaxSpareCount,
    ReplacePending,
    ReplaceLater,
    NodeReplaceFail,
    NoIncreaseTimeLimit,
    TimeOverLimit,
    JobUpdate,
    UpdNode,
    Cmd,
    Port,
    Uid,
}

impl ErrorCode {
    const ALL: [ErrorCode; 19] = [
        Self::NoError,
        Self::Perm,
        Self::JobId,
        Self::JobNotRun,
        Self::NoHost,
        Self::NodeNotFail,
        Self::NodeNoCpu,
        Self::NodeNotInJob,
        Self::MaxSpareCount,
        Self::ReplacePending,
        Self::ReplaceLater,
        Self::NodeReplaceFail,
        Self::NoIncreaseTimeLimit,
        Self::TimeOverLimit,
        Self::JobUpdate,
        Self::UpdNode,
        Self::Cmd,
        Self::Port,
        Self::Uid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoError => "ENOERROR",
            Self::Perm => "EPERM",
            Self::JobId => "EJOBID",
            Self::JobNotRun => "EJOBNOTRUN",
            Self::NoHost => "ENOHOST",
            Self::NodeNotFail => "ENODENOTFAIL",
            Self::NodeNoCpu => "ENODENOCPU",
            Self::NodeNotInJob => "NODENOTINJOB",
            Self::MaxSpareCount => "EMAXSPARECOUNT",
            Self::ReplacePending => "EREPLACEPENDING",
            Self::ReplaceLater => "EREPLACELATER",
            Self::NodeReplaceFail => "ENODEREPLACEFAIL",
            Self::NoIncreaseTimeLimit => "ENOINCREASETIMELIMIT",
            Self::TimeOverLimit => "ETIMEOVERLIMIT",
            Self::JobUpdate => "EJOBUPDATE",
            Self::UpdNode => "EUPDNODE",
            Self::Cmd => "ECMD",
            Self::Port => "EPORT",
            Self::Uid => "EUID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reply: a result code followed by whitespace-separated tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub code: ErrorCode,
    pub tokens: Vec<String>,
}

impl Reply {
    pub fn ok() -> Self {
        Self::error(ErrorCode::NoError)
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            code,
            tokens: Vec::new(),
        }
    }

    /// A code with one detail token, e.g. `EMAXSPARECOUNT 1`.
    pub fn with_detail(code: ErrorCode, detail: impl ToString) -> Self {
        Self::error(code).push(detail)
    }

    pub fn push(mut self, token: impl ToString) -> Self {
        self.tokens.push(token.to_string());
        self
    }

    /// Append a `key value` token pair.
    pub fn pair(self, key: &str, value: impl ToString) -> Self {
        self.push(key).push(value)
    }

    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::NoError
    }

    /// First token after the code.
    pub fn detail(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }

    /// Value following the `key` token.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.tokens
            .iter()
            .position(|t| t == key)
            .and_then(|i| self.tokens.get(i + 1))
            .map(String::as_str)
    }

    /// Value of a `Key=Value` token.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.tokens.iter().find_map(|t| {
            t.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    pub fn to_wire(&self) -> String {
        let mut out = format!("{} {}", VERSION, self.code);
        for token in &self.tokens {
            out.push(' ');
            out.push_str(token);
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim_end_matches(['\0', '\n', '\r']);
        let mut words = text.split_whitespace();
        if words.next() != Some(VERSION) {
            return Err(ProtocolError::Version(text.to_string()));
        }
        let code = words
            .next()
            .ok_or_else(|| ProtocolError::UnknownCode(String::new()))?;
        let code =
            ErrorCode::parse(code).ok_or_else(|| ProtocolError::UnknownCode(code.to_string()))?;
        Ok(Self {
            code,
            tokens: words.map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("NONSTOP_1:CALLBACK:JOBID:17:PORT:9001").unwrap(),
            Command::Callback {
                job_id: 17,
                port: 9001
            }
        );
        assert_eq!(
            Command::parse("NONSTOP_1:DRAIN:NODES:nid[3-4]:REASON:\"bad dimm\"").unwrap(),
            Command::Drain {
                nodes: "nid[3-4]".to_string(),
                reason: "bad dimm".to_string()
            }
        );
        assert_eq!(
            Command::parse("NONSTOP_1:DRAIN:NODES:nid3:REASON:psu: smoke").unwrap(),
            Command::Drain {
                nodes: "nid3".to_string(),
                reason: "psu: smoke".to_string()
            }
        );
        assert_eq!(
            Command::parse("NONSTOP_1:get_fail_nodes:jobid:42:state_flags:3").unwrap(),
            Command::GetFailNodes {
                job_id: 42,
                state_flags: 3
            }
        );
        assert_eq!(
            Command::parse("NONSTOP_1:SHOW_CONFIG").unwrap(),
            Command::ShowConfig
        );
        assert_eq!(
            Command::parse("NONSTOP_1:TIME_INCR:JOBID:42:MINUTES:0\0").unwrap(),
            Command::TimeIncr {
                job_id: 42,
                minutes: 0
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Command::parse("NONSTOP_2:SHOW_CONFIG"),
            Err(ProtocolError::Version(_))
        ));
        assert!(matches!(
            Command::parse("SHOW_CONFIG"),
            Err(ProtocolError::Version(_))
        ));
        assert!(matches!(
            Command::parse("NONSTOP_1:FROB"),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert!(matches!(
            Command::parse("NONSTOP_1:SHOW_JOB:JOBID:abc"),
            Err(ProtocolError::Arguments { .. })
        ));
        assert!(matches!(
            Command::parse("NONSTOP_1:DROP_NODE:JOBID:42"),
            Err(ProtocolError::Arguments { .. })
        ));
        assert!(matches!(
            Command::parse("NONSTOP_1:DROP_NODE:JOB:42:NODE:nid1"),
            Err(ProtocolError::Arguments { .. })
        ));
    }

    #[test]
    fn test_command_wire_text() {
        let cmd = Command::Drain {
            nodes: "nid[3-4]".to_string(),
            reason: "bad dimm".to_string(),
        };
        assert_eq!(cmd.to_wire(), "NONSTOP_1:DRAIN:NODES:nid[3-4]:REASON:\"bad dimm\"");
        assert_eq!(Command::parse(&cmd.to_wire()).unwrap(), cmd);
        assert_eq!(
            Command::ReplaceNode {
                job_id: 42,
                node: "nid10".to_string()
            }
            .to_wire(),
            "NONSTOP_1:REPLACE_NODE:JOBID:42:NODE:nid10"
        );
    }

    #[test]
    fn test_reply_text() {
        let reply = Reply::ok()
            .pair("ReplacementNode", "nid99")
            .pair("NewNodeList", "nid[11,99]")
            .pair("NewNodeCount", 2);
        assert_eq!(
            reply.to_wire(),
            "NONSTOP_1 ENOERROR ReplacementNode nid99 NewNodeList nid[11,99] NewNodeCount 2"
        );
        let parsed = Reply::parse(&reply.to_wire()).unwrap();
        assert!(parsed.is_ok());
        assert_eq!(parsed.value("NewNodeList"), Some("nid[11,99]"));

        let err = Reply::with_detail(ErrorCode::MaxSpareCount, 1);
        assert_eq!(err.to_wire(), "NONSTOP_1 EMAXSPARECOUNT 1");
        assert_eq!(Reply::parse("NONSTOP_1 EMAXSPARECOUNT 1").unwrap(), err);
        assert_eq!(err.detail(), Some("1"));
    }

    #[test]
    fn test_reply_setting_and_errors() {
        let reply = Reply::parse("NONSTOP_1 ENOERROR Port=6820 BackupAddr=").unwrap();
        assert_eq!(reply.setting("Port"), Some("6820"));
        assert_eq!(reply.setting("BackupAddr"), Some(""));
        assert!(matches!(
            Reply::parse("NONSTOP_1 EWHAT"),
            Err(ProtocolError::UnknownCode(_))
        ));
        assert!(matches!(
            Reply::parse("HELLO ENOERROR"),
            Err(ProtocolError::Version(_))
        ));
    }

    #[test]
    fn test_error_code_names() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::NodeNotInJob.as_str(), "NODENOTINJOB");
    }
}
