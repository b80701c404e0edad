//! Mapping proxied hosts onto depot stores.
//!
//! Every upstream `scheme://host:port/` is served through a generic-http
//! remote store, created on first use. Tracked users get a private
//! hosted + remote pair behind a group instead.

use crate::auth::UserPass;
use crate::ProxyError;
use depot_model::{
    ArtifactStore, ChangeSummary, PackageType, StoreKey, StoreType, GENERIC_PKG_KEY,
    METADATA_ORIGIN, METADATA_TRACKING_ID, SYSTEM_USER,
};
use depot_store::StoreRegistry;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

/// Value of the `origin` metadata on stores created by the proxy.
pub const HTTPROX_ORIGIN: &str = "httprox";
pub const PROXY_REPO_PREFIX: &str = "httprox_";

/// Where a proxied request is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Absolute path, always starting with `/`.
    pub path: String,
}

impl ProxyTarget {
    /// From an absolute-form request target, e.g. `http://host:8080/a/b.jar`.
    pub fn from_absolute(uri: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(uri).map_err(|e| bad_request(format!("invalid proxy URI {uri}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| bad_request(format!("proxy URI has no host: {uri}")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| bad_request(format!("proxy URI has no port: {uri}")))?;
        Ok(Self {
            scheme: url.scheme().to_owned(),
            host: host.to_owned(),
            port,
            path: url.path().to_owned(),
        })
    }

    /// From a `CONNECT` target (`host:port`). Tunnels are assumed to carry TLS.
    pub fn from_authority(authority: &str) -> Result<Self, ProxyError> {
        if authority.contains('/') {
            return Err(bad_request(format!("invalid CONNECT target: {authority}")));
        }
        Self::from_absolute(&format!("https://{authority}/"))
    }

    #[must_use]
    pub fn with_path(&self, path: &str) -> Self {
        let mut target = self.clone();
        target.path = format!("/{}", path.trim_start_matches('/'));
        target
    }

    /// `scheme://host:port/`, the URL of the remote store for this target.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}/", self.scheme, self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }

    /// `path` relative to the store root.
    pub fn store_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    fn dashed_host(&self) -> String {
        self.host.replace(['.', ':', '[', ']'], "-")
    }

    pub fn remote_name(&self) -> String {
        format!("{PROXY_REPO_PREFIX}{}_{}", self.dashed_host(), self.port)
    }

    pub fn tracked_remote_name(&self, tracking_id: &str) -> String {
        format!("r-{}-{}-{tracking_id}", self.dashed_host(), self.port)
    }

    pub fn hosted_name(&self, tracking_id: &str) -> String {
        format!("h-{}-{}-{tracking_id}", self.dashed_host(), self.port)
    }

    pub fn group_name(&self, tracking_id: &str) -> String {
        format!("g-{}-{}-{tracking_id}", self.dashed_host(), self.port)
    }
}

fn bad_request(message: String) -> ProxyError {
    ProxyError::Workflow {
        status: 400,
        message,
    }
}

/// Input to [`ProxyRepositoryCreator::create`].
#[derive(Debug, Clone, Copy)]
pub struct CreationRequest<'a> {
    /// Name for the remote store.
    pub name: &'a str,
    pub base_url: &'a str,
    pub target: &'a ProxyTarget,
    pub tracking_id: Option<&'a str>,
    pub credentials: Option<&'a UserPass>,
}

/// Stores to register for a newly seen upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCreation {
    pub remote: ArtifactStore,
    pub hosted: Option<ArtifactStore>,
    pub group: Option<ArtifactStore>,
}

/// Builds store definitions for upstreams the proxy has not seen before.
pub trait ProxyRepositoryCreator: Send + Sync {
    fn create(&self, request: &CreationRequest<'_>) -> Result<ProxyCreation, ProxyError>;
}

/// Remote store only, or a hosted/remote/group triple for tracked users.
pub struct DefaultRepositoryCreator;

impl ProxyRepositoryCreator for DefaultRepositoryCreator {
    fn create(&self, request: &CreationRequest<'_>) -> Result<ProxyCreation, ProxyError> {
        let generic = PackageType::generic_http();
        let mut remote = ArtifactStore::remote(
            StoreKey::remote(generic.clone(), request.name),
            request.base_url,
        )
        .with_metadata(METADATA_ORIGIN, HTTPROX_ORIGIN)
        .with_description(format!("HTTProx proxy based on {}", request.target.url()));

        let Some(id) = request.tracking_id else {
            return Ok(ProxyCreation {
                remote,
                hosted: None,
                group: None,
            });
        };

        remote = remote.with_metadata(METADATA_TRACKING_ID, id);
        let hosted = ArtifactStore::hosted(StoreKey::hosted(
            generic.clone(),
            request.target.hosted_name(id),
        ))
        .with_metadata(METADATA_ORIGIN, HTTPROX_ORIGIN)
        .with_metadata(METADATA_TRACKING_ID, id);
        let group = ArtifactStore::group(
            StoreKey::group(generic, request.target.group_name(id)),
            vec![hosted.key.clone(), remote.key.clone()],
        )
        .with_metadata(METADATA_ORIGIN, HTTPROX_ORIGIN)
        .with_metadata(METADATA_TRACKING_ID, id);
        Ok(ProxyCreation {
            remote,
            hosted: Some(hosted),
            group: Some(group),
        })
    }
}

/// Resolves (and on first use creates) the store serving a proxy target.
#[derive(Clone)]
pub struct ProxyRepositories {
    registry: Arc<dyn StoreRegistry>,
    creator: Option<Arc<dyn ProxyRepositoryCreator>>,
    create_lock: Arc<Mutex<()>>,
}

impl ProxyRepositories {
    pub fn new(
        registry: Arc<dyn StoreRegistry>,
        creator: Option<Arc<dyn ProxyRepositoryCreator>>,
    ) -> Self {
        Self {
            registry,
            creator,
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store to read `target` through. Blocking: call from a blocking task.
    pub fn resolve(
        &self,
        target: &ProxyTarget,
        tracking_id: Option<&str>,
        credentials: Option<&UserPass>,
    ) -> Result<ArtifactStore, ProxyError> {
        let _creating = self
            .create_lock
            .lock()
            .map_err(|_| ProxyError::Data("repository creation lock poisoned".to_owned()))?;
        match tracking_id {
            Some(id) => self.resolve_tracked(target, id, credentials),
            None => self.resolve_remote(target, credentials),
        }
    }

    fn resolve_tracked(
        &self,
        target: &ProxyTarget,
        id: &str,
        credentials: Option<&UserPass>,
    ) -> Result<ArtifactStore, ProxyError> {
        let group_key = StoreKey::group(GENERIC_PKG_KEY, target.group_name(id));
        if let Some(group) = self.registry.get(&group_key)? {
            debug!("using httprox group {group_key} for {}", target.url());
            return Ok(group);
        }
        debug!("creating tracked repositories for {}, tracking id {id}", target.url());
        let name = target.tracked_remote_name(id);
        let created = self.create(&CreationRequest {
            name: &name,
            base_url: &target.base_url(),
            target,
            tracking_id: Some(id),
            credentials,
        })?;
        created
            .group
            .ok_or_else(|| ProxyError::Data(format!("repository creator returned no group for {id}")))
    }

    fn resolve_remote(
        &self,
        target: &ProxyTarget,
        credentials: Option<&UserPass>,
    ) -> Result<ArtifactStore, ProxyError> {
        let base_url = target.base_url();
        let existing = self.registry.list()?.into_iter().find(|store| {
            store.key.package_type.as_str() == GENERIC_PKG_KEY
                && store.key.store_type == StoreType::Remote
                && store.remote_url() == Some(base_url.as_str())
                && store.metadata(METADATA_TRACKING_ID).is_none()
        });
        if let Some(remote) = existing {
            debug!("using httprox remote {} for {}", remote.key, target.url());
            return Ok(remote);
        }

        let mut name = target.remote_name();
        let mut n = 1;
        while self
            .registry
            .exists(&StoreKey::remote(GENERIC_PKG_KEY, name.as_str()))?
        {
            // taken by a remote with a different URL
            name = format!("{PROXY_REPO_PREFIX}{}_{n}", target.dashed_host());
            n += 1;
        }
        let created = self.create(&CreationRequest {
            name: &name,
            base_url: &base_url,
            target,
            tracking_id: None,
            credentials,
        })?;
        Ok(created.remote)
    }

    fn create(&self, request: &CreationRequest<'_>) -> Result<ProxyCreation, ProxyError> {
        let Some(creator) = &self.creator else {
            return Err(ProxyError::Data(format!(
                "No valid instance of ProxyRepositoryCreator. Cannot auto-create remote proxy to: '{}'",
                request.base_url
            )));
        };
        let created = creator.create(request)?;
        let summary = ChangeSummary::new(
            SYSTEM_USER,
            format!("Creating HTTProx proxy for: {}", request.target.url()),
        );
        for store in [Some(&created.remote), created.hosted.as_ref(), created.group.as_ref()]
            .into_iter()
            .flatten()
        {
            info!("creating httprox store {}", store.key);
            self.registry.save(store.clone(), &summary)?;
        }
        Ok(created)
    }
}
