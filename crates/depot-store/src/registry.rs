use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use depot_model::{ArtifactStore, ChangeSummary, StoreKey, StoreType};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// CRUD access to store definitions.
pub trait StoreRegistry: Send + Sync {
    fn get(&self, key: &StoreKey) -> Result<Option<ArtifactStore>, StoreError>;

    fn exists(&self, key: &StoreKey) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn save(&self, store: ArtifactStore, summary: &ChangeSummary) -> Result<(), StoreError>;

    fn delete(&self, key: &StoreKey, summary: &ChangeSummary) -> Result<bool, StoreError>;

    fn list(&self) -> Result<Vec<ArtifactStore>, StoreError>;

    /// Every group that contains `key`, directly or through nested groups.
    fn groups_affected_by(&self, key: &StoreKey) -> Result<Vec<ArtifactStore>, StoreError> {
        let groups: Vec<ArtifactStore> = self
            .list()?
            .into_iter()
            .filter(|s| s.key.store_type == StoreType::Group)
            .collect();

        let mut affected: BTreeMap<StoreKey, ArtifactStore> = BTreeMap::new();
        let mut frontier = vec![key.clone()];
        while let Some(member) = frontier.pop() {
            for group in &groups {
                if affected.contains_key(&group.key) {
                    continue;
                }
                if group.constituents().contains(&member) {
                    affected.insert(group.key.clone(), group.clone());
                    frontier.push(group.key.clone());
                }
            }
        }
        Ok(affected.into_values().collect())
    }
}

/// Exclusive advisory lock on the data root, held while the registry
/// document is rewritten.
pub struct RegistryLock {
    lock_file: File,
}

impl RegistryLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        file.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", lock_path.display())))?;

        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, StoreError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    stores: Vec<ArtifactStore>,
}

/// Store definitions kept in memory and mirrored to `registry.json`.
///
/// Every mutation builds a new map, writes it to disk with
/// write-to-temp-then-rename, and only then swaps it in.
pub struct FileStoreRegistry {
    layout: StoreLayout,
    stores: RwLock<BTreeMap<StoreKey, ArtifactStore>>,
}

impl FileStoreRegistry {
    pub fn open(layout: StoreLayout) -> Result<Self, StoreError> {
        fs::create_dir_all(layout.root())?;
        let path = layout.registry_file();
        let mut stores = BTreeMap::new();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let doc: RegistryDocument = serde_json::from_str(&content)?;
            for store in doc.stores {
                stores.insert(store.key.clone(), store);
            }
            debug!("loaded {} store definitions from {}", stores.len(), path.display());
        }
        Ok(Self {
            layout,
            stores: RwLock::new(stores),
        })
    }

    fn persist(&self, stores: &BTreeMap<StoreKey, ArtifactStore>) -> Result<(), StoreError> {
        let _lock = RegistryLock::acquire(&self.layout.lock_file())?;
        let doc = RegistryDocument {
            updated_at: Some(chrono::Utc::now().to_rfc3339()),
            stores: stores.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&doc)?;

        let dir = self.layout.root();
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.registry_file())
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(dir)?;
        Ok(())
    }

    fn poisoned() -> StoreError {
        StoreError::LockFailed("registry lock poisoned".to_owned())
    }

    /// Keys of every registered store, sorted.
    pub fn keys(&self) -> Result<BTreeSet<StoreKey>, StoreError> {
        let stores = self.stores.read().map_err(|_| Self::poisoned())?;
        Ok(stores.keys().cloned().collect())
    }
}

impl StoreRegistry for FileStoreRegistry {
    fn get(&self, key: &StoreKey) -> Result<Option<ArtifactStore>, StoreError> {
        let stores = self.stores.read().map_err(|_| Self::poisoned())?;
        Ok(stores.get(key).cloned())
    }

    fn save(&self, store: ArtifactStore, summary: &ChangeSummary) -> Result<(), StoreError> {
        let mut stores = self.stores.write().map_err(|_| Self::poisoned())?;
        let key = store.key.clone();
        let mut next = stores.clone();
        next.insert(key.clone(), store);
        self.persist(&next)?;
        *stores = next;
        info!("saved store {key} ({}: {})", summary.user, summary.summary);
        Ok(())
    }

    fn delete(&self, key: &StoreKey, summary: &ChangeSummary) -> Result<bool, StoreError> {
        let mut stores = self.stores.write().map_err(|_| Self::poisoned())?;
        if !stores.contains_key(key) {
            return Ok(false);
        }
        let mut next = stores.clone();
        next.remove(key);
        self.persist(&next)?;
        *stores = next;
        info!("deleted store {key} ({}: {})", summary.user, summary.summary);
        Ok(true)
    }

    fn list(&self) -> Result<Vec<ArtifactStore>, StoreError> {
        let stores = self.stores.read().map_err(|_| Self::poisoned())?;
        Ok(stores.values().cloned().collect())
    }
}
