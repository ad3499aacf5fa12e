//! SLURM hostlist expressions.
//!
//! A hostlist is a comma separated list of host names where runs of
//! numbered hosts can be written with a bracketed range, e.g.
//! `nid[01-04,07],login1`.

use std::collections::HashMap;
use thiserror::Error;

/// Upper bound on the number of names a single expression may expand to.
pub const MAX_HOSTS: usize = 65536;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HostlistError {
    #[error("Unbalanced brackets in hostlist: {0}")]
    Unbalanced(String),
    #[error("Invalid range in hostlist: {0}")]
    InvalidRange(String),
    #[error("Hostlist expands to more than {MAX_HOSTS} hosts")]
    TooLarge,
}

/// Split on commas that are not inside brackets.
fn split_top_level(s: &str) -> Result<Vec<&str>, HostlistError> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| HostlistError::Unbalanced(s.to_string()))?;
            }
            ',' if depth == 0 => {
                items.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(HostlistError::Unbalanced(s.to_string()));
    }
    items.push(&s[start..]);

    Ok(items
        .into_iter()
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect())
}

/// Expand the numbers in a bracket body like `01-04,07`.
fn expand_ranges(body: &str) -> Result<Vec<String>, HostlistError> {
    let mut out = Vec::new();
    for part in body.split(',') {
        let part = part.trim();
        let (lo, hi) = part.split_once('-').unwrap_or((part, part));
        let width = lo.len();
        let lo_n: u64 = lo
            .parse()
            .map_err(|_| HostlistError::InvalidRange(part.to_string()))?;
        let hi_n: u64 = hi
            .parse()
            .map_err(|_| HostlistError::InvalidRange(part.to_string()))?;
        if hi_n < lo_n {
            return Err(HostlistError::InvalidRange(part.to_string()));
        }
        if (hi_n - lo_n) as usize >= MAX_HOSTS {
            return Err(HostlistError::TooLarge);
        }
        for n in lo_n..=hi_n {
            out.push(format!("{:0width$}", n, width = width));
        }
    }
    Ok(out)
}

fn expand_item(item: &str, out: &mut Vec<String>) -> Result<(), HostlistError> {
    let Some(open) = item.find('[') else {
        out.push(item.to_string());
        return Ok(());
    };
    let close = item[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| HostlistError::Unbalanced(item.to_string()))?;

    let prefix = &item[..open];
    let suffix = &item[close + 1..];

    // Suffixes may carry their own brackets (e.g. rack[1-2]n[1-4]).
    let mut tails = Vec::new();
    if suffix.is_empty() {
        tails.push(String::new());
    } else {
        expand_item(suffix, &mut tails)?;
    }

    for number in expand_ranges(&item[open + 1..close])? {
        for tail in &tails {
            out.push(format!("{prefix}{number}{tail}"));
            if out.len() > MAX_HOSTS {
                return Err(HostlistError::TooLarge);
            }
        }
    }
    Ok(())
}

/// Expand a hostlist expression into individual host names.
pub fn expand_hostlist(s: &str) -> Result<Vec<String>, HostlistError> {
    let mut hosts = Vec::new();
    for item in split_top_level(s)? {
        expand_item(item, &mut hosts)?;
    }
    Ok(hosts)
}

/// Split a host name into (prefix, numeric suffix).
fn split_numeric_suffix(name: &str) -> Option<(&str, &str)> {
    let digits = name
        .bytes()
        .rev()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    let (prefix, number) = name.split_at(name.len() - digits);
    Some((prefix, number))
}

/// Compress host names into a hostlist expression.
///
/// Names are grouped by prefix (and zero-padding width); groups keep the
/// order in which they first appear and numbers inside a group are sorted.
pub fn compress_hostlist<S: AsRef<str>>(names: &[S]) -> String {
    let mut order: Vec<(String, usize)> = Vec::new();
    let mut groups: HashMap<(String, usize), Vec<u64>> = HashMap::new();
    let mut parts: Vec<Option<String>> = Vec::new();

    for name in names {
        let name = name.as_ref();
        let parsed = split_numeric_suffix(name).and_then(|(prefix, number)| {
            let width = if number.len() > 1 && number.starts_with('0') {
                number.len()
            } else {
                0
            };
            number.parse::<u64>().ok().map(|n| (prefix, width, n))
        });

        match parsed {
            Some((prefix, width, n)) => {
                let key = (prefix.to_string(), width);
                let numbers = groups.entry(key.clone()).or_insert_with(|| {
                    order.push(key.clone());
                    parts.push(None);
                    Vec::new()
                });
                numbers.push(n);
            }
            None => {
                order.push((name.to_string(), usize::MAX));
                parts.push(Some(name.to_string()));
            }
        }
    }

    order
        .iter()
        .zip(parts)
        .map(|(key, literal)| match literal {
            Some(name) => name,
            None => {
                let mut numbers = groups.get(key).cloned().unwrap_or_default();
                numbers.sort_unstable();
                numbers.dedup();
                format_group(&key.0, key.1, &numbers)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn format_group(prefix: &str, width: usize, numbers: &[u64]) -> String {
    if let [single] = numbers {
        return format!("{prefix}{:0width$}", single, width = width);
    }

    let mut ranges = Vec::new();
    let mut iter = numbers.iter().copied().peekable();
    while let Some(lo) = iter.next() {
        let mut hi = lo;
        while iter.peek() == Some(&(hi + 1)) {
            hi += 1;
            iter.next();
        }
        if lo == hi {
            ranges.push(format!("{:0width$}", lo, width = width));
        } else {
            ranges.push(format!(
                "{:0width$}-{:0width$}",
                lo,
                hi,
                width = width
            ));
        }
    }
    format!("{prefix}[{}]", ranges.join(","))
}
