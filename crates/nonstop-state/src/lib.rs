//! Failure records, the in-memory registry and its on-disk image.

pub mod codec;
pub mod record;
pub mod registry;
pub mod store;

pub use record::{EventFlags, FailedNode, FailureRecord};
pub use registry::{PendingCallback, Records, Registry, RegistryError};
pub use store::{STATE_FILE, SavedState, StateError, StateStore};
