//! The `nonstop.conf` configuration file.
//!
//! A line-oriented `Key=Value` format. `#` starts a comment, keys match
//! case-insensitively and unknown keys are an error.

pub mod uid_list;
pub mod users;

pub use uid_list::UidList;
pub use users::{StaticUsers, SystemUsers, UserLookup};

use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default port the service listens on.
pub const DEFAULT_PORT: u16 = 6820;

/// Default client read/write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("Line {line}: expected Key=Value, got {text:?}")]
    Syntax { line: usize, text: String },
    #[error("Line {line}: unknown key {key:?}")]
    UnknownKey { line: usize, key: String },
    #[error("Line {line}: invalid value {value:?} for {key}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("ControlAddr is not set")]
    MissingControlAddr,
    #[error("UserDrainDeny is set, so UserDrainAllow must be ALL")]
    DrainAllowNotAll,
}

/// Parsed configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub control_addr: String,
    pub backup_addr: Option<String>,
    pub port: u16,
    pub debug: u32,
    /// Hot-spare nodes to keep per partition.
    pub hot_spare_count: Vec<(String, u32)>,
    /// Replacements allowed per job; 0 means unlimited.
    pub max_spare_node_count: u32,
    /// Upper bound on credit granted for a deferred replacement (minutes).
    pub time_limit_delay: u32,
    /// Credit granted for dropping a failed node (minutes).
    pub time_limit_drop: u32,
    /// Credit granted for each failed or replaced node (minutes).
    pub time_limit_extend: u32,
    pub user_drain_allow: UidList,
    pub user_drain_deny: UidList,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_addr: String::new(),
            backup_addr: None,
            port: DEFAULT_PORT,
            debug: 0,
            hot_spare_count: Vec::new(),
            max_spare_node_count: 0,
            time_limit_delay: 0,
            time_limit_drop: 0,
            time_limit_extend: 0,
            user_drain_allow: UidList::default(),
            user_drain_deny: UidList::default(),
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
        }
    }
}

fn parse_hot_spares(value: &str) -> Vec<(String, u32)> {
    let mut spares: Vec<(String, u32)> = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((partition, count)) = entry.split_once(':') else {
            tracing::warn!("HotSpareCount: ignoring malformed entry {:?}", entry);
            continue;
        };
        let partition = partition.trim();
        let count = match count.trim().parse::<i64>() {
            Ok(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => {
                tracing::warn!("HotSpareCount: ignoring invalid count in {:?}", entry);
                continue;
            }
        };
        if spares.iter().any(|(p, _)| p == partition) {
            tracing::warn!("HotSpareCount: ignoring duplicate partition {}", partition);
            continue;
        }
        spares.push((partition.to_string(), count));
    }
    spares
}

impl Config {
    /// Parse configuration text.
    pub fn parse(text: &str, users: &dyn UserLookup) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let Some((key, value)) = content.split_once('=') else {
                return Err(ConfigError::Syntax {
                    line,
                    text: content.to_string(),
                });
            };
            let key = key.trim();
            let value = value.trim();
            let invalid = || ConfigError::InvalidValue {
                line,
                key: key.to_string(),
                value: value.to_string(),
            };
            let number = || value.parse::<u32>().map_err(|_| invalid());

            match key.to_ascii_lowercase().as_str() {
                "backupaddr" => {
                    config.backup_addr = (!value.is_empty()).then(|| value.to_string())
                }
                "controladdr" => config.control_addr = value.to_string(),
                "debug" => config.debug = number()?,
                "hotsparecount" => config.hot_spare_count = parse_hot_spares(value),
                "maxsparenodecount" => config.max_spare_node_count = number()?,
                "port" => config.port = value.parse().map_err(|_| invalid())?,
                "timelimitdelay" => config.time_limit_delay = number()?,
                "timelimitdrop" => config.time_limit_drop = number()?,
                "timelimitextend" => config.time_limit_extend = number()?,
                "userdrainallow" => config.user_drain_allow = UidList::parse(value, users),
                "userdraindeny" => config.user_drain_deny = UidList::parse(value, users),
                "readtimeout" => {
                    config.read_timeout = Duration::from_millis(u64::from(number()?))
                }
                "writetimeout" => {
                    config.write_timeout = Duration::from_millis(u64::from(number()?))
                }
                _ => {
                    return Err(ConfigError::UnknownKey {
                        line,
                        key: key.to_string(),
                    });
                }
            }
        }

        if config.control_addr.is_empty() {
            return Err(ConfigError::MissingControlAddr);
        }
        if !config.user_drain_deny.is_empty() && !config.user_drain_allow.is_exactly_all() {
            return Err(ConfigError::DrainAllowNotAll);
        }
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Utf8Path, users: &dyn UserLookup) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, users)
    }

    /// Drop hot-spare entries for partitions the scheduler does not know.
    pub fn retain_known_partitions(&mut self, known: &[String]) {
        self.hot_spare_count.retain(|(p, _)| {
            let ok = known.iter().any(|k| k == p);
            if !ok {
                tracing::warn!("HotSpareCount: ignoring unknown partition {}", p);
            }
            ok
        });
    }

    /// Whether `uid` may drain nodes.
    pub fn drain_permitted(&self, uid: u32) -> bool {
        let denied = self.user_drain_deny.is_all() || self.user_drain_deny.contains(uid);
        let allowed = self.user_drain_allow.is_all() || self.user_drain_allow.contains(uid);
        !denied && allowed
    }

    /// Tracing filter matching the configured debug level.
    pub fn log_filter(&self) -> &'static str {
        match self.debug {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Settings as `(Key, value)` pairs, in file key order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let hot_spares = self
            .hot_spare_count
            .iter()
            .map(|(p, n)| format!("{}:{}", p, n))
            .collect::<Vec<_>>()
            .join(",");
        vec![
            ("BackupAddr", self.backup_addr.clone().unwrap_or_default()),
            ("ControlAddr", self.control_addr.clone()),
            ("Debug", self.debug.to_string()),
            ("HotSpareCount", hot_spares),
            ("MaxSpareNodeCount", self.max_spare_node_count.to_string()),
            ("Port", self.port.to_string()),
            ("TimeLimitDelay", self.time_limit_delay.to_string()),
            ("TimeLimitDrop", self.time_limit_drop.to_string()),
            ("TimeLimitExtend", self.time_limit_extend.to_string()),
            ("UserDrainAllow", self.user_drain_allow.to_string()),
            ("UserDrainDeny", self.user_drain_deny.to_string()),
            ("ReadTimeout", self.read_timeout.as_millis().to_string()),
            ("WriteTimeout", self.write_timeout.as_millis().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn users() -> StaticUsers {
        StaticUsers::new(&[("alice", 1000), ("bob", 1001), ("mallory", 1666)])
    }

    #[test]
    fn test_parse_full() {
        let text = "\
# nonstop.conf
ControlAddr=ctl1
backupaddr = ctl2   # fallback
Port=7001
Debug=1
HotSpareCount=batch:2,debug:1,batch:3,gpu:0,bad
MaxSpareNodeCount=4
TimeLimitDelay=30
TimeLimitDrop=5
TimeLimitExtend=10
UserDrainAllow=alice,1001
ReadTimeout=500
";
        let config = Config::parse(text, &users()).unwrap();
        assert_eq!(config.control_addr, "ctl1");
        assert_eq!(config.backup_addr.as_deref(), Some("ctl2"));
        assert_eq!(config.port, 7001);
        assert_eq!(config.log_filter(), "debug");
        assert_eq!(
            config.hot_spare_count,
            vec![("batch".to_string(), 2), ("debug".to_string(), 1)]
        );
        assert_eq!(config.max_spare_node_count, 4);
        assert_eq!(config.time_limit_extend, 10);
        assert_eq!(config.read_timeout, Duration::from_millis(500));
        assert_eq!(config.write_timeout, DEFAULT_TIMEOUT);
        assert!(config.drain_permitted(1000));
        assert!(config.drain_permitted(1001));
        assert!(!config.drain_permitted(1666));
    }

    #[test]
    fn test_parse_errors() {
        let u = users();
        assert!(matches!(
            Config::parse("Port=1", &u),
            Err(ConfigError::MissingControlAddr)
        ));
        assert!(matches!(
            Config::parse("ControlAddr=c\nFrobnicate=1", &u),
            Err(ConfigError::UnknownKey { line: 2, .. })
        ));
        assert!(matches!(
            Config::parse("ControlAddr=c\nPort=99999", &u),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            Config::parse("ControlAddr=c\njunk", &u),
            Err(ConfigError::Syntax { line: 2, .. })
        ));
    }

    #[test]
    fn test_drain_deny_requires_allow_all() {
        let u = users();
        assert!(matches!(
            Config::parse("ControlAddr=c\nUserDrainDeny=mallory", &u),
            Err(ConfigError::DrainAllowNotAll)
        ));
        assert!(matches!(
            Config::parse("ControlAddr=c\nUserDrainDeny=mallory\nUserDrainAllow=ALL,alice", &u),
            Err(ConfigError::DrainAllowNotAll)
        ));

        let config =
            Config::parse("ControlAddr=c\nUserDrainDeny=mallory\nUserDrainAllow=ALL", &u).unwrap();
        assert!(config.drain_permitted(1000));
        assert!(config.drain_permitted(4242));
        assert!(!config.drain_permitted(1666));
    }

    #[test]
    fn test_drain_defaults_and_deny_all() {
        let u = users();
        let config = Config::parse("ControlAddr=c", &u).unwrap();
        assert!(!config.drain_permitted(1000));

        let config =
            Config::parse("ControlAddr=c\nUserDrainDeny=ALL\nUserDrainAllow=ALL", &u).unwrap();
        assert!(!config.drain_permitted(1000));
    }

    #[test]
    fn test_retain_known_partitions() {
        let mut config =
            Config::parse("ControlAddr=c\nHotSpareCount=batch:2,ghost:1", &users()).unwrap();
        config.retain_known_partitions(&["batch".to_string()]);
        assert_eq!(config.hot_spare_count, vec![("batch".to_string(), 2)]);
    }

    #[test]
    fn test_entries() {
        let config = Config::parse("ControlAddr=c\nHotSpareCount=batch:2", &users()).unwrap();
        let entries = config.entries();
        assert_eq!(entries[1], ("ControlAddr", "c".to_string()));
        assert!(entries.contains(&("HotSpareCount", "batch:2".to_string())));
        assert!(entries.contains(&("Port", "6820".to_string())));
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let path = Utf8Path::from_path(temp.path()).unwrap().join("nonstop.conf");
        assert!(matches!(
            Config::load(&path, &users()),
            Err(ConfigError::Io { .. })
        ));
        std::fs::write(&path, "ControlAddr=ctl1\n").unwrap();
        assert_eq!(Config::load(&path, &users()).unwrap().control_addr, "ctl1");
    }
}
