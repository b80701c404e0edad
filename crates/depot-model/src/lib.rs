//! Value types shared by the promotion engine and the proxy.
//!
//! `StoreKey` and `ArtifactStore` describe content stores (hosted, remote,
//! group). `PathsPromoteRequest`/`PathsPromoteResult` and their group
//! counterparts carry a promotion from the API layer through the engine and
//! out to callbacks. `StoreKeyPaths` is the admission-control claim.

pub mod promote;
pub mod store;
pub mod types;

pub use promote::{
    CallbackMethod, CallbackTarget, GroupPromoteRequest, GroupPromoteResult, GroupPromotionSummary,
    PathTransferResult, PathsPromoteRequest, PathsPromoteResult, PromotionSummary, StoreKeyPaths,
    ValidationResult,
};
pub use store::{
    ArtifactStore, ChangeSummary, StoreKey, StoreKind, StoreType, METADATA_ORIGIN,
    METADATA_TRACKING_ID, SYSTEM_USER,
};
pub use types::{PackageType, PromotionId, StoreName, GENERIC_PKG_KEY, MAVEN_PKG_KEY, NPM_PKG_KEY};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid store type: '{0}' (expected hosted, remote or group)")]
    InvalidStoreType(String),
    #[error("invalid store key: '{0}' (expected <package>:<type>:<name>)")]
    InvalidStoreKey(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_display_invalid_key() {
        let e = ModelError::InvalidStoreKey("bad".to_owned());
        assert!(e.to_string().contains("bad"));
    }

    #[test]
    fn model_error_display_invalid_type() {
        let e = ModelError::InvalidStoreType("virtual".to_owned());
        assert!(e.to_string().contains("virtual"));
    }
}
