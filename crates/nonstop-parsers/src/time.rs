//! Time parsing utilities for scheduler output.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::time::Duration;

/// Parse a SLURM timestamp (YYYY-MM-DDTHH:MM:SS or placeholder values).
///
/// Returns None for empty strings or placeholder values like "N/A", "Unknown", "None".
pub fn parse_slurm_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() || s == "N/A" || s == "Unknown" || s == "None" || s == "(null)" {
        return None;
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .and_then(|dt| Utc.from_local_datetime(&dt).single())
}

/// Parse a duration in various formats.
///
/// Supports:
/// - D-HH:MM:SS (SLURM time limit with days)
/// - HH:MM:SS
/// - MM:SS
/// - Seconds as integer
///
/// Returns None for "UNLIMITED" or empty strings.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() || s == "UNLIMITED" || s == "INFINITE" || s == "-" {
        return None;
    }

    // Check for day separator (D-HH:MM:SS)
    let parts: Vec<&str> = s.split('-').collect();
    let (days, time_part) = if parts.len() == 2 {
        (parts[0].parse::<u64>().unwrap_or(0), parts[1])
    } else {
        (0, parts[0])
    };

    let time_parts: Vec<u64> = time_part
        .split(':')
        .filter_map(|p| p.parse().ok())
        .collect();

    let seconds = match time_parts.len() {
        3 => time_parts[0] * 3600 + time_parts[1] * 60 + time_parts[2],
        2 => time_parts[0] * 60 + time_parts[1],
        1 => time_parts[0],
        _ => return None,
    };

    Some(Duration::from_secs(days * 86400 + seconds))
}

/// Parse a SLURM time limit into whole minutes, rounding partial minutes up.
pub fn parse_time_limit_minutes(s: &str) -> Option<u32> {
    parse_duration(s).map(|d| d.as_secs().div_ceil(60) as u32)
}

/// Whole minutes from `now` until `start`, rounded up and never negative.
pub fn minutes_until(start: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let secs = (start - now).num_seconds();
    if secs <= 0 {
        0
    } else {
        u32::try_from((secs as u64).div_ceil(60)).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slurm_timestamp() {
        let dt = parse_slurm_timestamp("2024-01-15T10:30:00").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-01-15");

        assert!(parse_slurm_timestamp("N/A").is_none());
        assert!(parse_slurm_timestamp("Unknown").is_none());
        assert!(parse_slurm_timestamp("(null)").is_none());
        assert!(parse_slurm_timestamp("").is_none());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1:00:00"), Some(Duration::from_secs(3600)));
        assert_eq!(
            parse_duration("1-00:00:00"),
            Some(Duration::from_secs(86400))
        );
        assert_eq!(parse_duration("30:00"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration("3600"), Some(Duration::from_secs(3600)));
        assert!(parse_duration("UNLIMITED").is_none());
        assert!(parse_duration("-").is_none());
    }

    #[test]
    fn test_parse_time_limit_minutes() {
        assert_eq!(parse_time_limit_minutes("01:00:00"), Some(60));
        assert_eq!(parse_time_limit_minutes("00:00:30"), Some(1));
        assert_eq!(parse_time_limit_minutes("2-00:00:00"), Some(2880));
        assert_eq!(parse_time_limit_minutes("UNLIMITED"), None);
    }

    #[test]
    fn test_minutes_until() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 30).unwrap();
        assert_eq!(minutes_until(later, now), 8);
        assert_eq!(minutes_until(now, later), 0);
    }
}
