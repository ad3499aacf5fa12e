use crate::codec;
use crate::record::FailureRecord;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io::Write;
use thiserror::Error;

/// File name of the registry state inside the state directory.
pub const STATE_FILE: &str = "nonstop_state";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("State file truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("Corrupt state file at byte {offset}: {reason}")]
    Corrupt { offset: usize, reason: String },
    #[error("State file version {found} not supported (expected {expected})")]
    Version { found: u16, expected: u16 },
}

fn io_err(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Contents of a restored state file.
#[derive(Debug, Clone, Default)]
pub struct SavedState {
    /// Unix time of the save.
    pub timestamp: i64,
    pub records: Vec<FailureRecord>,
}

/// Persistent storage for the failure registry.
///
/// A save writes `nonstop_state.new`, syncs it, moves the current file to
/// `nonstop_state.old` and then moves the new file into place, so a crash
/// at any point leaves at least one complete image behind.
pub struct StateStore {
    path: Utf8PathBuf,
}

impl StateStore {
    /// Create a store for the given state directory.
    pub fn new(state_dir: &Utf8Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
        }
    }

    /// Get the path to the state file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.{}", self.path, suffix))
    }

    /// Load the saved state.
    ///
    /// Returns `None` if no state file exists.
    pub fn load(&self) -> Result<Option<SavedState>, StateError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(io_err(&self.path))?;
        let (timestamp, records) = codec::decode(&bytes)?;
        Ok(Some(SavedState { timestamp, records }))
    }

    /// Save records, rotating the previous image to `.old`.
    ///
    /// Creates the state directory if needed.
    pub fn save(&self, records: &[FailureRecord], timestamp: i64) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let image = codec::encode(records, timestamp);
        let new_path = self.sibling("new");
        let old_path = self.sibling("old");

        let mut file = fs::File::create(&new_path).map_err(io_err(&new_path))?;
        file.write_all(&image).map_err(io_err(&new_path))?;
        file.sync_all().map_err(io_err(&new_path))?;
        drop(file);

        if self.path.exists() {
            fs::rename(&self.path, &old_path).map_err(io_err(&self.path))?;
        }
        fs::rename(&new_path, &self.path).map_err(io_err(&new_path))?;
        Ok(())
    }
}
