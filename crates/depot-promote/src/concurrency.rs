use crate::PromoteError;
use depot_model::{StoreKey, StoreKeyPaths};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

type InUse = HashMap<StoreKey, HashSet<StoreKeyPaths>>;

/// Admission control for paths promotion.
///
/// Tracks in-flight claims per target store. A claim is admitted only if its
/// paths are disjoint from every claim already registered for the same
/// target; the registry mutex is held for the intersection test only.
#[derive(Debug, Clone, Default)]
pub struct PathConflictGuard {
    in_use: Arc<Mutex<InUse>>,
}

/// An admitted claim. Dropping it releases the claim.
#[derive(Debug)]
pub struct ClaimGuard {
    in_use: Arc<Mutex<InUse>>,
    claim: StoreKeyPaths,
}

fn lock(in_use: &Mutex<InUse>) -> MutexGuard<'_, InUse> {
    // The map stays consistent across a panic: every mutation is a single
    // insert or remove.
    in_use.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PathConflictGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `claim` unless it overlaps an in-flight claim on the same
    /// target. `None` means conflicted.
    pub fn try_claim(&self, claim: StoreKeyPaths) -> Option<ClaimGuard> {
        let mut in_use = lock(&self.in_use);
        let claims = in_use.entry(claim.target.clone()).or_default();
        if claims.iter().any(|existing| existing.intersects(&claim)) {
            debug!("claim on {} conflicts with an in-flight promotion", claim.target);
            return None;
        }
        claims.insert(claim.clone());
        Some(ClaimGuard {
            in_use: Arc::clone(&self.in_use),
            claim,
        })
    }

    /// Run `on_admit` while holding `claim`, or `on_conflict` if it overlaps
    /// an in-flight claim. The claim is released when `on_admit` finishes,
    /// fails, panics, or is cancelled.
    pub async fn run_guarded<T, A, F, C>(&self, claim: StoreKeyPaths, on_admit: A, on_conflict: C) -> T
    where
        A: FnOnce(StoreKeyPaths) -> F,
        F: Future<Output = T>,
        C: FnOnce(StoreKeyPaths) -> T,
    {
        match self.try_claim(claim.clone()) {
            Some(guard) => {
                let out = on_admit(claim).await;
                drop(guard);
                out
            }
            None => on_conflict(claim),
        }
    }

    /// Number of claims currently registered against `target`.
    pub fn in_flight(&self, target: &StoreKey) -> usize {
        lock(&self.in_use).get(target).map_or(0, HashSet::len)
    }
}

impl ClaimGuard {
    pub fn claim(&self) -> &StoreKeyPaths {
        &self.claim
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut in_use = lock(&self.in_use);
        if let Some(claims) = in_use.get_mut(&self.claim.target) {
            claims.remove(&self.claim);
            if claims.is_empty() {
                in_use.remove(&self.claim.target);
            }
        }
    }
}

/// Per-group locks serializing membership edits.
#[derive(Debug, Default)]
pub struct GroupLocks {
    locks: Mutex<HashMap<StoreKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `group`, giving up after `timeout`.
    pub async fn acquire(
        &self,
        group: &StoreKey,
        timeout: Duration,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, PromoteError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(group.clone()).or_default())
        };
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| PromoteError::LockTimeout {
                target: group.clone(),
                seconds: timeout.as_secs(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn claim(target: &str, paths: &[&str]) -> StoreKeyPaths {
        StoreKeyPaths::new(
            StoreKey::hosted("maven", target),
            paths.iter().map(|p| (*p).to_owned()).collect::<BTreeSet<_>>(),
        )
    }

    #[test]
    fn overlapping_claim_is_rejected() {
        let guard = PathConflictGuard::new();
        let held = guard.try_claim(claim("staging", &["x"])).unwrap();
        assert!(guard.try_claim(claim("staging", &["x", "y"])).is_none());
        drop(held);
        assert!(guard.try_claim(claim("staging", &["x", "y"])).is_some());
    }

    #[test]
    fn disjoint_claims_coexist() {
        let guard = PathConflictGuard::new();
        let _a = guard.try_claim(claim("staging", &["x"])).unwrap();
        let _b = guard.try_claim(claim("staging", &["y"])).unwrap();
        let _c = guard.try_claim(claim("other", &["x"])).unwrap();
        assert_eq!(guard.in_flight(&StoreKey::hosted("maven", "staging")), 2);
    }

    #[test]
    fn rejected_duplicate_does_not_release_the_holder() {
        let guard = PathConflictGuard::new();
        let staging = StoreKey::hosted("maven", "staging");
        let _held = guard.try_claim(claim("staging", &["x"])).unwrap();
        assert!(guard.try_claim(claim("staging", &["x"])).is_none());
        assert_eq!(guard.in_flight(&staging), 1);
        assert!(guard.try_claim(claim("staging", &["x"])).is_none());
    }

    #[test]
    fn registry_entry_removed_when_empty() {
        let guard = PathConflictGuard::new();
        let staging = StoreKey::hosted("maven", "staging");
        drop(guard.try_claim(claim("staging", &["x"])).unwrap());
        assert_eq!(guard.in_flight(&staging), 0);
        assert!(lock(&guard.in_use).is_empty());
    }

    #[tokio::test]
    async fn run_guarded_releases_after_admit() {
        let guard = PathConflictGuard::new();
        let staging = StoreKey::hosted("maven", "staging");
        let inner = guard.clone();
        let out = guard
            .run_guarded(
                claim("staging", &["x"]),
                |c| async move {
                    assert_eq!(inner.in_flight(&c.target), 1);
                    let nested = inner
                        .run_guarded(claim("staging", &["x"]), |_| async { "admitted" }, |_| "conflict")
                        .await;
                    assert_eq!(nested, "conflict");
                    "done"
                },
                |_| "conflict",
            )
            .await;
        assert_eq!(out, "done");
        assert_eq!(guard.in_flight(&staging), 0);
    }

    #[tokio::test]
    async fn group_lock_times_out() {
        let locks = GroupLocks::new();
        let group = StoreKey::group("maven", "public");
        let _held = locks.acquire(&group, Duration::from_secs(1)).await.unwrap();
        let err = locks
            .acquire(&group, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, PromoteError::LockTimeout { .. }));
        let other = StoreKey::group("maven", "other");
        locks.acquire(&other, Duration::from_millis(50)).await.unwrap();
    }
}
