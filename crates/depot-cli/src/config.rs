use depot_httprox::HttproxConfig;
use depot_promote::PromoteConfig;
use depot_remote::SiteConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "depot.toml";
const DEFAULT_STORE_ROOT: &str = "~/.local/share/depot";

/// Contents of `depot.toml`. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    pub storage: StorageConfig,
    pub promote: PromoteConfig,
    pub httprox: HttproxConfig,
    pub remote: SiteConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: DEFAULT_STORE_ROOT.to_owned(),
        }
    }
}

impl DepotConfig {
    /// Load `path`. A missing file is only an error when `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| format!("config error: {}: {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!("no {} found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(format!("config error: cannot read {}: {e}", path.display())),
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn store_root(&self) -> PathBuf {
        expand_tilde(&self.storage.root)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
