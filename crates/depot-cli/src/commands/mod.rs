pub mod promote;
pub mod proxy;
pub mod rollback;

use crate::config::DepotConfig;
use depot_model::{CallbackMethod, CallbackTarget, StoreKey};
use depot_promote::PromotionManager;
use depot_remote::{HttpCallbackTransport, HttpFetcher};
use depot_store::{FileContentManager, FileStoreRegistry, MemoryNotFoundCache, StoreLayout};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn parse_store_key(input: &str) -> Result<StoreKey, String> {
    input.parse().map_err(|e| format!("{e}"))
}

pub fn callback_target(url: Option<&str>, put: bool) -> Option<CallbackTarget> {
    let method = if put {
        CallbackMethod::Put
    } else {
        CallbackMethod::Post
    };
    url.map(|u| CallbackTarget::new(u, method))
}

/// Write `value` as pretty JSON to `path`, for a later rollback or resume.
pub fn save_result(path: &Path, value: &impl serde::Serialize) -> Result<(), String> {
    let json = json_pretty(value)?;
    std::fs::write(path, json).map_err(|e| format!("cannot write {}: {e}", path.display()))
}

pub fn load_result<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("invalid promotion result in {}: {e}", path.display()))
}

/// The local store plus everything layered on top of it.
pub struct Depot {
    pub registry: Arc<FileStoreRegistry>,
    pub content: Arc<FileContentManager>,
    pub nfc: Arc<MemoryNotFoundCache>,
}

impl Depot {
    pub fn open(root: &Path, config: &DepotConfig) -> Result<Self, String> {
        let layout = StoreLayout::new(root);
        layout
            .initialize()
            .map_err(|e| format!("store error: {e}"))?;
        let registry = Arc::new(
            FileStoreRegistry::open(layout.clone()).map_err(|e| format!("store error: {e}"))?,
        );
        let nfc = Arc::new(MemoryNotFoundCache::new());
        let content = Arc::new(
            FileContentManager::new(layout, registry.clone(), nfc.clone())
                .with_fetcher(Arc::new(HttpFetcher::new(config.remote.clone()))),
        );
        Ok(Self {
            registry,
            content,
            nfc,
        })
    }

    pub fn promotion_manager(&self, config: &DepotConfig) -> Result<PromotionManager, String> {
        PromotionManager::builder(
            config.promote.clone(),
            self.registry.clone(),
            self.content.clone(),
            self.nfc.clone(),
        )
        .callback_transport(Arc::new(HttpCallbackTransport::new(&config.remote)))
        .build()
        .map_err(|e| format!("config error: {e}"))
    }
}
