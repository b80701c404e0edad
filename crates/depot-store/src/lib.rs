//! Local collaborators of the promotion engine and proxy.
//!
//! `FileContentManager` reads and writes artifact bytes under a `StoreLayout`,
//! resolving remote stores through a `RemoteFetcher` and groups through their
//! constituents. `FileStoreRegistry` holds store definitions in a JSON
//! document. `StandardPathClassifier` recognises metadata and checksum paths,
//! and `MemoryNotFoundCache` remembers recent misses.

pub mod content;
pub mod fetch;
pub mod layout;
pub mod nfc;
pub mod registry;
pub mod special;

pub use content::{ContentAccess, FileContentManager, Retrieved, TransferFlags};
pub use fetch::RemoteFetcher;
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use nfc::{MemoryNotFoundCache, NotFoundCache};
pub use registry::{FileStoreRegistry, RegistryLock, StoreRegistry};
pub use special::{SpecialPathClassifier, SpecialPathInfo, StandardPathClassifier};

use depot_model::StoreKey;
use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no such store: {0}")]
    StoreNotFound(StoreKey),
    #[error("store {0} is read-only")]
    ReadOnly(StoreKey),
    #[error("cannot write into group store {0}")]
    GroupWrite(StoreKey),
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    #[error("remote fetch failed: {0}")]
    Remote(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_read_only() {
        let e = StoreError::ReadOnly(StoreKey::hosted("maven", "releases"));
        assert!(e.to_string().contains("maven:hosted:releases"));
    }

    #[test]
    fn store_error_display_invalid_path() {
        let e = StoreError::InvalidPath("../etc/passwd".to_owned());
        assert!(e.to_string().contains("../etc/passwd"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn store_error_display_lock_failed() {
        let e = StoreError::LockFailed("registry lock poisoned".to_owned());
        assert!(e.to_string().contains("poisoned"));
    }
}
