use crate::users::UserLookup;
use std::fmt;

/// A list of users given by name or numeric UID, or the wildcard `ALL`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidList {
    all: bool,
    /// (name as configured, resolved uid)
    entries: Vec<(String, u32)>,
}

impl UidList {
    pub fn all() -> Self {
        Self {
            all: true,
            entries: Vec::new(),
        }
    }

    /// Parse a comma separated list. Names that do not resolve are logged
    /// and skipped.
    pub fn parse(s: &str, users: &dyn UserLookup) -> Self {
        let mut list = Self::default();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token.eq_ignore_ascii_case("ALL") {
                list.all = true;
                continue;
            }
            let uid = match token.parse::<u32>() {
                Ok(uid) => Some(uid),
                Err(_) => users.uid_of(token),
            };
            match uid {
                Some(uid) if !list.entries.iter().any(|(_, u)| *u == uid) => {
                    list.entries.push((token.to_string(), uid))
                }
                Some(_) => {}
                None => tracing::warn!("Ignoring unknown user {:?}", token),
            }
        }
        list
    }

    pub fn is_all(&self) -> bool {
        self.all
    }

    /// True when the list names nobody and is not `ALL`.
    pub fn is_empty(&self) -> bool {
        !self.all && self.entries.is_empty()
    }

    /// Exactly `ALL`, with no individual users.
    pub fn is_exactly_all(&self) -> bool {
        self.all && self.entries.is_empty()
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.entries.iter().any(|(_, u)| *u == uid)
    }

    pub fn uids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|(_, u)| *u)
    }
}

impl fmt::Display for UidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.entries.iter().map(|(n, _)| n.as_str()).collect();
        if self.all {
            names.insert(0, "ALL");
        }
        write!(f, "{}", names.join(","))
    }
}
