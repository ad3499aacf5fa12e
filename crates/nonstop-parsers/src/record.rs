//! Parsing of `scontrol -o` one-line records and per-node CPU layouts.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// A key in `scontrol -o` output: starts with a letter, may contain `:` or `/`
/// (e.g. `CPUs/Task`, `Socks/Node`).
static KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_:/.]*$").expect("valid key regex"));

/// Parse one `scontrol -o` line into an ordered list of key/value pairs.
///
/// Values may contain spaces (`Reason=bad dimm [root@2024-01-01]`); a
/// whitespace-separated token that does not look like `Key=...` is appended
/// to the previous value. Keys may repeat (`-d` detail output repeats
/// `Nodes=`/`CPU_IDs=` per node group), so duplicates are preserved.
pub fn parse_record_pairs(line: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();

    for token in line.split_whitespace() {
        if let Some((key, value)) = token.split_once('=')
            && KEY_RE.is_match(key)
        {
            pairs.push((key.to_string(), value.to_string()));
            continue;
        }
        if let Some((_, value)) = pairs.last_mut() {
            value.push(' ');
            value.push_str(token);
        }
    }

    pairs
}

/// Parse one `scontrol -o` line into a map; for repeated keys the first
/// occurrence wins.
pub fn parse_record(line: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, value) in parse_record_pairs(line) {
        map.entry(key).or_insert(value);
    }
    map
}

/// Count the CPUs in a `CPU_IDs=` list such as `0-15,32-47`.
pub fn count_cpu_ids(s: &str) -> u32 {
    s.split(',')
        .filter_map(|part| {
            let part = part.trim();
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo.parse().ok()?;
                    let hi: u32 = hi.parse().ok()?;
                    hi.checked_sub(lo).map(|d| d + 1)
                }
                None => part.parse::<u32>().ok().map(|_| 1),
            }
        })
        .sum()
}

/// Format per-node CPU counts in SLURM's compressed form, e.g. `32(x2),16`.
pub fn format_cpu_pattern(cpus: &[u32]) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut iter = cpus.iter().copied().peekable();
    while let Some(count) = iter.next() {
        let mut reps = 1;
        while iter.peek() == Some(&count) {
            reps += 1;
            iter.next();
        }
        if reps == 1 {
            out.push(count.to_string());
        } else {
            out.push(format!("{}(x{})", count, reps));
        }
    }
    out.join(",")
}
