use crate::fetch::RemoteFetcher;
use crate::layout::StoreLayout;
use crate::nfc::NotFoundCache;
use crate::registry::StoreRegistry;
use crate::StoreError;
use depot_model::{ArtifactStore, StoreKey, StoreKind};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Options attached to a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferFlags {
    /// Write even if the target hosted store is read-only.
    pub ignore_read_only: bool,
}

impl TransferFlags {
    pub const PROMOTION: Self = Self {
        ignore_read_only: true,
    };
}

/// Content located by [`ContentAccess::retrieve`], materialized on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    /// The store that actually held the bytes (a constituent, for groups).
    pub store: StoreKey,
    pub file: PathBuf,
    pub len: u64,
}

/// Byte-level access to artifacts at a `(store, path)` coordinate.
pub trait ContentAccess: Send + Sync {
    /// Whether `path` is present locally. Groups check their constituents.
    fn exists(&self, store: &ArtifactStore, path: &str) -> Result<bool, StoreError>;

    fn open_read(&self, store: &ArtifactStore, path: &str)
        -> Result<Box<dyn Read + Send>, StoreError>;

    /// Write `data` to `path`, replacing any existing content. Returns the
    /// number of bytes written.
    fn store(
        &self,
        store: &ArtifactStore,
        path: &str,
        data: &mut dyn Read,
        flags: TransferFlags,
    ) -> Result<u64, StoreError>;

    /// Remove `path`. Not subject to read-only enforcement.
    fn delete(&self, store: &ArtifactStore, path: &str) -> Result<bool, StoreError>;

    /// Every file path under `root` (empty or `/` for the whole store),
    /// relative to the store and `/`-separated.
    fn list_recursive(&self, store: &ArtifactStore, root: &str) -> Result<Vec<String>, StoreError>;

    /// Fetch `path` from a remote store's upstream into its local cache.
    /// Returns `false` for non-remote stores or when upstream lacks it.
    fn redownload(&self, store: &ArtifactStore, path: &str) -> Result<bool, StoreError>;

    /// Resolve `path` for serving: local content, remote fetch-and-cache, or
    /// the first group constituent that has it.
    fn retrieve(&self, store: &ArtifactStore, path: &str) -> Result<Option<Retrieved>, StoreError>;
}

/// [`ContentAccess`] over a directory tree laid out by [`StoreLayout`].
pub struct FileContentManager {
    layout: StoreLayout,
    registry: Arc<dyn StoreRegistry>,
    nfc: Arc<dyn NotFoundCache>,
    fetcher: Option<Arc<dyn RemoteFetcher>>,
}

impl FileContentManager {
    pub fn new(
        layout: StoreLayout,
        registry: Arc<dyn StoreRegistry>,
        nfc: Arc<dyn NotFoundCache>,
    ) -> Self {
        Self {
            layout,
            registry,
            nfc,
            fetcher: None,
        }
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn local_file(&self, key: &StoreKey, path: &str) -> Result<Option<PathBuf>, StoreError> {
        let file = self.layout.path_for(key, path)?;
        Ok(file.is_file().then_some(file))
    }

    fn exists_inner(
        &self,
        store: &ArtifactStore,
        path: &str,
        visited: &mut BTreeSet<StoreKey>,
    ) -> Result<bool, StoreError> {
        if !visited.insert(store.key.clone()) {
            return Ok(false);
        }
        match &store.kind {
            StoreKind::Hosted { .. } | StoreKind::Remote { .. } => {
                Ok(self.local_file(&store.key, path)?.is_some())
            }
            StoreKind::Group { constituents } => {
                for member in constituents {
                    if let Some(member) = self.registry.get(member)? {
                        if self.exists_inner(&member, path, visited)? {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
        }
    }

    fn retrieve_inner(
        &self,
        store: &ArtifactStore,
        path: &str,
        visited: &mut BTreeSet<StoreKey>,
    ) -> Result<Option<Retrieved>, StoreError> {
        if !visited.insert(store.key.clone()) {
            return Ok(None);
        }
        let found = match &store.kind {
            StoreKind::Hosted { .. } => self.local_file(&store.key, path)?,
            StoreKind::Remote { .. } => {
                let mut local = self.local_file(&store.key, path)?;
                if local.is_none()
                    && !self.nfc.is_missing(&store.key, path)
                    && self.redownload(store, path)?
                {
                    local = self.local_file(&store.key, path)?;
                }
                local
            }
            StoreKind::Group { constituents } => {
                for member in constituents {
                    let Some(member) = self.registry.get(member)? else {
                        warn!("group {} lists missing member {member}", store.key);
                        continue;
                    };
                    if let Some(hit) = self.retrieve_inner(&member, path, visited)? {
                        return Ok(Some(hit));
                    }
                }
                None
            }
        };
        match found {
            Some(file) => {
                let len = fs::metadata(&file)?.len();
                Ok(Some(Retrieved {
                    store: store.key.clone(),
                    file,
                    len,
                }))
            }
            None => Ok(None),
        }
    }

    fn list_inner(
        &self,
        store: &ArtifactStore,
        root: &str,
        visited: &mut BTreeSet<StoreKey>,
        out: &mut BTreeSet<String>,
    ) -> Result<(), StoreError> {
        if !visited.insert(store.key.clone()) {
            return Ok(());
        }
        if let StoreKind::Group { constituents } = &store.kind {
            for member in constituents {
                if let Some(member) = self.registry.get(member)? {
                    self.list_inner(&member, root, visited, out)?;
                }
            }
            return Ok(());
        }

        let store_dir = self.layout.store_dir(&store.key);
        let base = if root.trim_matches('/').is_empty() {
            store_dir.clone()
        } else {
            self.layout.path_for(&store.key, root)?
        };
        if !base.exists() {
            return Ok(());
        }
        for entry in walkdir::WalkDir::new(&base) {
            let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e)))?;
            if !entry.file_type().is_file() || is_temp_file(entry.path()) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&store_dir) else {
                continue;
            };
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.insert(parts.join("/"));
        }
        Ok(())
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(".tmp"))
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn write_atomic(dest: &Path, data: &mut dyn Read) -> Result<u64, StoreError> {
    let parent = dest
        .parent()
        .ok_or_else(|| StoreError::InvalidPath(dest.display().to_string()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    let written = io::copy(data, &mut tmp)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    Ok(written)
}

impl ContentAccess for FileContentManager {
    fn exists(&self, store: &ArtifactStore, path: &str) -> Result<bool, StoreError> {
        self.exists_inner(store, path, &mut BTreeSet::new())
    }

    fn open_read(
        &self,
        store: &ArtifactStore,
        path: &str,
    ) -> Result<Box<dyn Read + Send>, StoreError> {
        let file = match &store.kind {
            StoreKind::Group { .. } => self
                .retrieve(store, path)?
                .map(|r| r.file)
                .ok_or_else(|| {
                    StoreError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{path} not found in {}", store.key),
                    ))
                })?,
            _ => self.layout.path_for(&store.key, path)?,
        };
        Ok(Box::new(fs::File::open(file)?))
    }

    fn store(
        &self,
        store: &ArtifactStore,
        path: &str,
        data: &mut dyn Read,
        flags: TransferFlags,
    ) -> Result<u64, StoreError> {
        if matches!(store.kind, StoreKind::Group { .. }) {
            return Err(StoreError::GroupWrite(store.key.clone()));
        }
        if store.is_read_only() && !flags.ignore_read_only {
            return Err(StoreError::ReadOnly(store.key.clone()));
        }
        let dest = self.layout.path_for(&store.key, path)?;
        let written = write_atomic(&dest, data)?;
        self.nfc.clear_missing(&store.key, path);
        debug!("stored {path} in {} ({written} bytes)", store.key);
        Ok(written)
    }

    fn delete(&self, store: &ArtifactStore, path: &str) -> Result<bool, StoreError> {
        if matches!(store.kind, StoreKind::Group { .. }) {
            return Err(StoreError::GroupWrite(store.key.clone()));
        }
        let file = self.layout.path_for(&store.key, path)?;
        match fs::remove_file(&file) {
            Ok(()) => {
                debug!("deleted {path} from {}", store.key);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_recursive(&self, store: &ArtifactStore, root: &str) -> Result<Vec<String>, StoreError> {
        let mut out = BTreeSet::new();
        self.list_inner(store, root, &mut BTreeSet::new(), &mut out)?;
        Ok(out.into_iter().collect())
    }

    fn redownload(&self, store: &ArtifactStore, path: &str) -> Result<bool, StoreError> {
        let Some(base) = store.remote_url() else {
            return Ok(false);
        };
        let Some(fetcher) = &self.fetcher else {
            debug!("no fetcher configured, cannot download {path} for {}", store.key);
            return Ok(false);
        };
        let dest = self.layout.path_for(&store.key, path)?;
        let parent = dest
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.to_owned()))?;
        fs::create_dir_all(parent)?;

        let url = join_url(base, path);
        debug!("downloading {url} into {}", store.key);
        let mut tmp = NamedTempFile::new_in(parent)?;
        if !fetcher.fetch(&url, &mut tmp)? {
            self.nfc.record_missing(&store.key, path);
            return Ok(false);
        }
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        self.nfc.clear_missing(&store.key, path);
        Ok(true)
    }

    fn retrieve(&self, store: &ArtifactStore, path: &str) -> Result<Option<Retrieved>, StoreError> {
        let hit = self.retrieve_inner(store, path, &mut BTreeSet::new())?;
        if hit.is_none() {
            self.nfc.record_missing(&store.key, path);
        }
        Ok(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfc::MemoryNotFoundCache;
    use crate::registry::FileStoreRegistry;
    use depot_model::ChangeSummary;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned bodies keyed by URL and counts calls.
    #[derive(Default)]
    struct MockFetcher {
        bodies: HashMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl RemoteFetcher for MockFetcher {
        fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<bool, StoreError> {
            self.calls.lock().unwrap().push(url.to_owned());
            match self.bodies.get(url) {
                Some(body) => {
                    dest.write_all(body)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<FileStoreRegistry>,
        content: FileContentManager,
    }

    fn fixture(fetcher: Option<Arc<MockFetcher>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let registry = Arc::new(FileStoreRegistry::open(layout.clone()).unwrap());
        let mut content = FileContentManager::new(
            layout,
            registry.clone(),
            Arc::new(MemoryNotFoundCache::new()),
        );
        if let Some(f) = fetcher {
            content = content.with_fetcher(f);
        }
        Fixture {
            _dir: dir,
            registry,
            content,
        }
    }

    fn put(fx: &Fixture, store: &ArtifactStore, path: &str, body: &[u8]) {
        fx.content
            .store(store, path, &mut &body[..], TransferFlags::default())
            .unwrap();
    }

    fn read_all(fx: &Fixture, store: &ArtifactStore, path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        fx.content
            .open_read(store, path)
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn store_read_delete_cycle() {
        let fx = fixture(None);
        let hosted = ArtifactStore::hosted(StoreKey::hosted("maven", "staging"));
        put(&fx, &hosted, "a/1.0/a.jar", b"jar");
        assert!(fx.content.exists(&hosted, "a/1.0/a.jar").unwrap());
        assert_eq!(read_all(&fx, &hosted, "/a/1.0/a.jar"), b"jar");
        assert!(fx.content.delete(&hosted, "a/1.0/a.jar").unwrap());
        assert!(!fx.content.delete(&hosted, "a/1.0/a.jar").unwrap());
        assert!(!fx.content.exists(&hosted, "a/1.0/a.jar").unwrap());
    }

    #[test]
    fn read_only_store_requires_override() {
        let fx = fixture(None);
        let ro = ArtifactStore::hosted(StoreKey::hosted("maven", "releases")).with_read_only(true);
        let err = fx
            .content
            .store(&ro, "x", &mut &b"x"[..], TransferFlags::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly(_)));
        fx.content
            .store(&ro, "x", &mut &b"x"[..], TransferFlags::PROMOTION)
            .unwrap();
        assert!(fx.content.exists(&ro, "x").unwrap());
    }

    #[test]
    fn group_rejects_writes() {
        let fx = fixture(None);
        let group = ArtifactStore::group(StoreKey::group("maven", "public"), vec![]);
        let err = fx
            .content
            .store(&group, "x", &mut &b"x"[..], TransferFlags::PROMOTION)
            .unwrap_err();
        assert!(matches!(err, StoreError::GroupWrite(_)));
    }

    #[test]
    fn list_recursive_returns_relative_paths() {
        let fx = fixture(None);
        let hosted = ArtifactStore::hosted(StoreKey::hosted("maven", "staging"));
        put(&fx, &hosted, "a/1.0/a.jar", b"1");
        put(&fx, &hosted, "a/1.0/a.pom", b"2");
        put(&fx, &hosted, "b/b.txt", b"3");
        assert_eq!(
            fx.content.list_recursive(&hosted, "").unwrap(),
            vec!["a/1.0/a.jar", "a/1.0/a.pom", "b/b.txt"]
        );
        assert_eq!(
            fx.content.list_recursive(&hosted, "/a").unwrap(),
            vec!["a/1.0/a.jar", "a/1.0/a.pom"]
        );
        let empty = ArtifactStore::hosted(StoreKey::hosted("maven", "empty"));
        assert!(fx.content.list_recursive(&empty, "/").unwrap().is_empty());
    }

    #[test]
    fn remote_retrieve_fetches_and_caches() {
        let mut fetcher = MockFetcher::default();
        fetcher
            .bodies
            .insert("http://up/repo/a/a.jar".to_owned(), b"remote".to_vec());
        let fetcher = Arc::new(fetcher);
        let fx = fixture(Some(fetcher.clone()));
        let remote = ArtifactStore::remote(StoreKey::remote("maven", "central"), "http://up/repo/");

        let hit = fx.content.retrieve(&remote, "a/a.jar").unwrap().unwrap();
        assert_eq!(hit.len, 6);
        assert!(fx.content.exists(&remote, "a/a.jar").unwrap());
        fx.content.retrieve(&remote, "a/a.jar").unwrap().unwrap();
        assert_eq!(fetcher.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn remote_miss_is_remembered() {
        let fetcher = Arc::new(MockFetcher::default());
        let fx = fixture(Some(fetcher.clone()));
        let remote = ArtifactStore::remote(StoreKey::remote("maven", "central"), "http://up");
        assert!(fx.content.retrieve(&remote, "nope.jar").unwrap().is_none());
        assert!(fx.content.retrieve(&remote, "nope.jar").unwrap().is_none());
        assert_eq!(fetcher.calls.lock().unwrap().len(), 1);
        // An explicit redownload bypasses the miss cache.
        assert!(!fx.content.redownload(&remote, "nope.jar").unwrap());
        assert_eq!(fetcher.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn group_resolves_constituents_in_order() {
        let fx = fixture(None);
        let first = ArtifactStore::hosted(StoreKey::hosted("maven", "first"));
        let second = ArtifactStore::hosted(StoreKey::hosted("maven", "second"));
        let summary = ChangeSummary::system("test");
        fx.registry.save(first.clone(), &summary).unwrap();
        fx.registry.save(second.clone(), &summary).unwrap();
        put(&fx, &first, "x", b"first");
        put(&fx, &second, "x", b"second");
        put(&fx, &second, "y", b"only-second");

        let group = ArtifactStore::group(
            StoreKey::group("maven", "public"),
            vec![first.key.clone(), second.key.clone()],
        );
        assert_eq!(read_all(&fx, &group, "x"), b"first");
        let hit = fx.content.retrieve(&group, "y").unwrap().unwrap();
        assert_eq!(hit.store, second.key);
        assert!(fx.content.exists(&group, "y").unwrap());
        assert_eq!(fx.content.list_recursive(&group, "").unwrap(), vec!["x", "y"]);
    }

    #[test]
    fn group_cycles_terminate() {
        let fx = fixture(None);
        let a = StoreKey::group("maven", "a");
        let b = StoreKey::group("maven", "b");
        let summary = ChangeSummary::system("test");
        fx.registry
            .save(ArtifactStore::group(a.clone(), vec![b.clone()]), &summary)
            .unwrap();
        fx.registry
            .save(ArtifactStore::group(b.clone(), vec![a.clone()]), &summary)
            .unwrap();
        let group_a = fx.registry.get(&a).unwrap().unwrap();
        assert!(fx.content.retrieve(&group_a, "x").unwrap().is_none());
        assert!(!fx.content.exists(&group_a, "x").unwrap());
    }
}
