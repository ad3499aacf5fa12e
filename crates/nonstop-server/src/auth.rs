//! Message sealing: binds a plaintext command to the sender's UID.
//!
//! [`HmacSealer`] signs `<uid>:<unix time>:<plaintext>` with HMAC-SHA256 under
//! a key shared between the daemon and its clients, producing
//! `<uid>:<unix time>:<base64 mac>:<plaintext>`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock difference between sealing and unsealing.
pub const MAX_CLOCK_SKEW_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Failed to read key file {path}: {source}")]
    KeyFile {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("Key file {0} is empty")]
    EmptyKey(Utf8PathBuf),
    #[error("Invalid key")]
    InvalidKey,
    #[error("Malformed credential")]
    Malformed,
    #[error("Credential signature mismatch")]
    BadSignature,
    #[error("Credential timestamp {0} outside the accepted window")]
    Expired(i64),
}

/// A verified sender and the command it sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub plaintext: String,
}

/// Seals outgoing commands and verifies incoming ones.
pub trait Sealer: Send + Sync {
    fn seal(&self, uid: u32, plaintext: &str) -> Result<String, AuthError>;
    fn unseal(&self, blob: &str) -> Result<Credential, AuthError>;
}

/// Shared-key HMAC-SHA256 sealer.
pub struct HmacSealer {
    mac: HmacSha256,
}

impl HmacSealer {
    pub fn new(key: &[u8]) -> Result<Self, AuthError> {
        HmacSha256::new_from_slice(key)
            .map(|mac| Self { mac })
            .map_err(|_| AuthError::InvalidKey)
    }

    /// Load the shared key. Trailing whitespace is ignored.
    pub fn from_key_file(path: &Utf8Path) -> Result<Self, AuthError> {
        let bytes = std::fs::read(path).map_err(|source| AuthError::KeyFile {
            path: path.to_path_buf(),
            source,
        })?;
        let key = bytes.trim_ascii_end();
        if key.is_empty() {
            return Err(AuthError::EmptyKey(path.to_path_buf()));
        }
        Self::new(key)
    }

    fn mac(&self, uid: u32, timestamp: i64, plaintext: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(format!("{}:{}:{}", uid, timestamp, plaintext).as_bytes());
        mac
    }

    fn seal_at(&self, uid: u32, plaintext: &str, now: i64) -> String {
        let tag = self.mac(uid, now, plaintext).finalize().into_bytes();
        format!("{}:{}:{}:{}", uid, now, STANDARD.encode(tag), plaintext)
    }

    fn unseal_at(&self, blob: &str, now: i64) -> Result<Credential, AuthError> {
        let mut parts = blob.splitn(4, ':');
        let (Some(uid), Some(timestamp), Some(tag), Some(plaintext)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };
        let uid: u32 = uid.parse().map_err(|_| AuthError::Malformed)?;
        let timestamp: i64 = timestamp.parse().map_err(|_| AuthError::Malformed)?;
        let tag = STANDARD.decode(tag).map_err(|_| AuthError::Malformed)?;

        self.mac(uid, timestamp, plaintext)
            .verify_slice(&tag)
            .map_err(|_| AuthError::BadSignature)?;
        if now.abs_diff(timestamp) > MAX_CLOCK_SKEW_SECS {
            return Err(AuthError::Expired(timestamp));
        }
        Ok(Credential {
            uid,
            plaintext: plaintext.to_string(),
        })
    }
}

impl Sealer for HmacSealer {
    fn seal(&self, uid: u32, plaintext: &str) -> Result<String, AuthError> {
        Ok(self.seal_at(uid, plaintext, Utc::now().timestamp()))
    }

    fn unseal(&self, blob: &str) -> Result<Credential, AuthError> {
        self.unseal_at(blob, Utc::now().timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seal_unseal() {
        let sealer = HmacSealer::new(b"secret").unwrap();
        let blob = sealer.seal(1000, "NONSTOP_1:SHOW_JOB:JOBID:42").unwrap();
        assert!(blob.starts_with("1000:"));
        let cred = sealer.unseal(&blob).unwrap();
        assert_eq!(cred.uid, 1000);
        assert_eq!(cred.plaintext, "NONSTOP_1:SHOW_JOB:JOBID:42");
    }

    #[test]
    fn test_forged_uid_rejected() {
        let sealer = HmacSealer::new(b"secret").unwrap();
        let blob = sealer.seal(1000, "NONSTOP_1:SHOW_CONFIG").unwrap();
        let forged = blob.replacen("1000", "0", 1);
        assert!(matches!(
            sealer.unseal(&forged),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealer = HmacSealer::new(b"secret").unwrap();
        let blob = sealer.seal(1000, "NONSTOP_1:SHOW_CONFIG").unwrap();
        assert!(matches!(
            HmacSealer::new(b"other").unwrap().unseal(&blob),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_clock_skew() {
        let sealer = HmacSealer::new(b"secret").unwrap();
        let blob = sealer.seal_at(1000, "NONSTOP_1:SHOW_CONFIG", 1_000);
        assert!(sealer.unseal_at(&blob, 1_200).is_ok());
        assert!(matches!(
            sealer.unseal_at(&blob, 1_400),
            Err(AuthError::Expired(1_000))
        ));

        // Extreme timestamps with a valid tag are rejected, not overflowed
        let blob = sealer.seal_at(1000, "NONSTOP_1:SHOW_CONFIG", i64::MIN);
        assert!(matches!(
            sealer.unseal_at(&blob, i64::MAX),
            Err(AuthError::Expired(i64::MIN))
        ));
    }

    #[test]
    fn test_malformed() {
        let sealer = HmacSealer::new(b"secret").unwrap();
        assert!(matches!(sealer.unseal("garbage"), Err(AuthError::Malformed)));
        assert!(matches!(
            sealer.unseal("x:1:AAAA:NONSTOP_1:SHOW_CONFIG"),
            Err(AuthError::Malformed)
        ));
    }

    #[test]
    fn test_key_file() {
        let temp = TempDir::new().unwrap();
        let dir = Utf8Path::from_path(temp.path()).unwrap();
        let path = dir.join("nonstop.key");
        std::fs::write(&path, "secret\n").unwrap();
        let from_file = HmacSealer::from_key_file(&path).unwrap();
        let blob = HmacSealer::new(b"secret").unwrap().seal(7, "x").unwrap();
        assert_eq!(from_file.unseal(&blob).unwrap().uid, 7);

        std::fs::write(&path, "\n").unwrap();
        assert!(matches!(
            HmacSealer::from_key_file(&path),
            Err(AuthError::EmptyKey(_))
        ));
    }
}
