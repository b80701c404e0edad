//! Promotion engine for depot.
//!
//! [`PromotionManager`] copies sets of paths between stores with
//! all-or-nothing semantics and adds stores to groups. Overlapping concurrent
//! promotions into the same target are refused by the [`PathConflictGuard`];
//! per-path work runs through the [`TransferExecutor`] on a bounded
//! [`TransferPool`]. Finished promotions are published on the [`EventBus`] and
//! reported to callback URLs by the [`CallbackNotifier`].

pub mod callback;
pub mod concurrency;
pub mod config;
pub mod events;
pub mod manager;
pub mod pool;
pub mod transfer;
pub mod validate;

pub use callback::CallbackNotifier;
pub use concurrency::{ClaimGuard, GroupLocks, PathConflictGuard};
pub use config::{PromoteConfig, RuleSet};
pub use events::{EventBus, EventEnvelope, EventStream, PromoteEvent};
pub use manager::{PromotionManager, PromotionManagerBuilder};
pub use pool::{Completion, TransferPool};
pub use transfer::{TransferExecutor, SOURCE_MISSING, TARGET_EXISTS};
pub use validate::{NoopValidator, PromotionValidator, RuleSetValidator};

use depot_model::StoreKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromoteError {
    #[error("store error: {0}")]
    Store(#[from] depot_store::StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] depot_remote::RemoteError),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("transfer pool saturated ({capacity} batches in flight)")]
    PoolOverloaded { capacity: usize },
    #[error("Failed to acquire group promotion lock on target: {target} in {seconds} seconds.")]
    LockTimeout { target: StoreKey, seconds: u64 },
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_message() {
        let e = PromoteError::LockTimeout {
            target: StoreKey::group("maven", "public"),
            seconds: 30,
        };
        assert_eq!(
            e.to_string(),
            "Failed to acquire group promotion lock on target: maven:group:public in 30 seconds."
        );
    }
}
