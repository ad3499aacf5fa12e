//! Shared parsing utilities for SLURM command output.
//!
//! Hostlist handling, `scontrol -o` record parsing and the small helpers the
//! scheduler backend and the protocol layer both rely on.

pub mod command;
pub mod hostlist;
pub mod record;
pub mod time;

pub use command::{CommandError, CommandOutput, run_command, run_command_capture};
pub use hostlist::{HostlistError, compress_hostlist, expand_hostlist};
pub use record::{count_cpu_ids, format_cpu_pattern, parse_record, parse_record_pairs};
pub use time::{minutes_until, parse_duration, parse_slurm_timestamp, parse_time_limit_minutes};

/// Filter helper for optional string fields.
/// Returns None if the string is empty or a placeholder value.
pub fn non_empty_string(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty()
        || trimmed == "-"
        || trimmed == "N/A"
        || trimmed == "Unknown"
        || trimmed == "(null)"
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Split a pipe-delimited line and validate field count.
pub fn split_delimited(line: &str, min_fields: usize) -> Result<Vec<&str>, String> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < min_fields {
        return Err(format!(
            "Expected {} fields, got {}: {}",
            min_fields,
            fields.len(),
            line
        ));
    }
    Ok(fields)
}
