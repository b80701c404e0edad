use depot_model::NPM_PKG_KEY;

/// How a recognised path must be treated during promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialPathInfo {
    /// Regenerated on demand; never copied byte-for-byte.
    pub metadata: bool,
    /// May be produced from the artifact it decorates. Checksums and
    /// signatures are not, so a missing one is skipped rather than failed.
    pub decoratable: bool,
    pub mergeable: bool,
}

pub trait SpecialPathClassifier: Send + Sync {
    fn classify(&self, path: &str, package_type: &str) -> Option<SpecialPathInfo>;
}

const CHECKSUM_SUFFIXES: &[&str] = &[".md5", ".sha1", ".sha256", ".sha512", ".asc"];

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPathClassifier;

impl StandardPathClassifier {
    fn is_metadata(path: &str, package_type: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        if name == "maven-metadata.xml" {
            return true;
        }
        // npm package documents live at `<pkg>/package.json` or
        // `@scope/<pkg>/package.json`.
        if package_type == NPM_PKG_KEY && name == "package.json" {
            let depth = path.trim_matches('/').split('/').count();
            let scoped = path.trim_start_matches('/').starts_with('@');
            return depth == 2 || (scoped && depth == 3);
        }
        false
    }
}

impl SpecialPathClassifier for StandardPathClassifier {
    fn classify(&self, path: &str, package_type: &str) -> Option<SpecialPathInfo> {
        if let Some(suffix) = CHECKSUM_SUFFIXES.iter().find(|s| path.ends_with(**s)) {
            let base = &path[..path.len() - suffix.len()];
            return Some(SpecialPathInfo {
                metadata: Self::is_metadata(base, package_type),
                decoratable: false,
                mergeable: false,
            });
        }
        if Self::is_metadata(path, package_type) {
            return Some(SpecialPathInfo {
                metadata: true,
                decoratable: true,
                mergeable: true,
            });
        }
        None
    }
}
