//! User name resolution.

use nix::unistd::{Uid, User};
use std::collections::HashMap;

/// Maps user names to UIDs and back.
pub trait UserLookup: Send + Sync {
    fn uid_of(&self, name: &str) -> Option<u32>;
    fn name_of(&self, uid: u32) -> Option<String>;
}

/// Resolves users through the system password database.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUsers;

impl UserLookup for SystemUsers {
    fn uid_of(&self, name: &str) -> Option<u32> {
        User::from_name(name).ok().flatten().map(|u| u.uid.as_raw())
    }

    fn name_of(&self, uid: u32) -> Option<String> {
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
    }
}

/// A fixed user table.
#[derive(Debug, Default, Clone)]
pub struct StaticUsers {
    by_name: HashMap<String, u32>,
}

impl StaticUsers {
    pub fn new(users: &[(&str, u32)]) -> Self {
        Self {
            by_name: users.iter().map(|(n, u)| (n.to_string(), *u)).collect(),
        }
    }
}

impl UserLookup for StaticUsers {
    fn uid_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    fn name_of(&self, uid: u32) -> Option<String> {
        self.by_name
            .iter()
            .find(|(_, u)| **u == uid)
            .map(|(n, _)| n.clone())
    }
}
