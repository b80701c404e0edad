use crate::StoreError;
use depot_model::StoreKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

/// Current on-disk format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for the depot data root.
///
/// ```text
/// <root>/version
/// <root>/registry.json
/// <root>/.lock
/// <root>/content/<package>/<type>/<name>/<path>
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct FormatVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    #[inline]
    pub fn store_dir(&self, key: &StoreKey) -> PathBuf {
        self.content_dir()
            .join(key.package_type.as_str())
            .join(key.store_type.as_str())
            .join(key.name.as_str())
    }

    #[inline]
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Filesystem location of `path` inside `key`'s directory.
    ///
    /// Leading slashes are ignored; `..`, `.` and empty segments are rejected
    /// so a path can never escape its store.
    pub fn path_for(&self, key: &StoreKey, path: &str) -> Result<PathBuf, StoreError> {
        let rel = normalize_path(path)?;
        Ok(self.store_dir(key).join(rel))
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.content_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = FormatVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: FormatVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

/// Strip leading slashes and validate every segment of an artifact path.
pub fn normalize_path(path: &str) -> Result<PathBuf, StoreError> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    let mut out = PathBuf::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
            return Err(StoreError::InvalidPath(path.to_owned()));
        }
        out.push(segment);
    }
    if out.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = StoreLayout::new("/tmp/depot-test");
        let key = StoreKey::hosted("maven", "staging");
        assert_eq!(
            layout.store_dir(&key),
            PathBuf::from("/tmp/depot-test/content/maven/hosted/staging")
        );
        assert_eq!(
            layout.path_for(&key, "/a/1.0/a.jar").unwrap(),
            PathBuf::from("/tmp/depot-test/content/maven/hosted/staging/a/1.0/a.jar")
        );
        assert_eq!(
            layout.registry_file(),
            PathBuf::from("/tmp/depot-test/registry.json")
        );
    }

    #[test]
    fn path_for_rejects_escapes() {
        let layout = StoreLayout::new("/tmp/depot-test");
        let key = StoreKey::hosted("maven", "staging");
        for bad in ["", "/", "../x", "a/../../x", "a//b", "./a", "a\\b"] {
            assert!(layout.path_for(&key, bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        assert!(layout.content_dir().is_dir());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn version_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        fs::write(dir.path().join(VERSION_FILE), r#"{"format_version": 99}"#).unwrap();
        assert!(matches!(
            layout.verify_version(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
