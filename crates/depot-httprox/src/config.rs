use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::ProxyError;

/// When proxied content is routed through per-user tracking stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingType {
    #[default]
    None,
    /// Users named `<id>+tracking` are tracked under `<id>`.
    Suffix,
    /// Every request must carry credentials; the user name is the tracking id.
    Always,
}

/// `[httprox]` section of `depot.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttproxConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Require `Proxy-Authorization` on every request.
    pub secured: bool,
    pub realm: String,
    pub tracking: TrackingType,
    pub auth_cache_ttl_seconds: u64,
    pub auth_cache_salt: String,
    pub tunnel_idle_timeout_seconds: u64,
    /// Credentials accepted by the built-in authenticator.
    pub users: BTreeMap<String, String>,
    /// CONNECT interception. Absent means CONNECT is refused.
    pub mitm: Option<MitmConfig>,
}

impl Default for HttproxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0".to_owned(),
            port: 8081,
            secured: false,
            realm: "httprox".to_owned(),
            tracking: TrackingType::None,
            auth_cache_ttl_seconds: 300,
            auth_cache_salt: String::new(),
            tunnel_idle_timeout_seconds: 60,
            users: BTreeMap::new(),
            mitm: None,
        }
    }
}

impl HttproxConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ProxyError> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| ProxyError::Config(format!("bad listen address {}:{}: {e}", self.bind, self.port)))
    }

    pub fn auth_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_cache_ttl_seconds)
    }

    pub fn tunnel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_idle_timeout_seconds)
    }

    pub fn mitm_enabled(&self) -> bool {
        self.mitm.is_some()
    }
}

/// `[httprox.mitm]`: the CA used to sign per-host certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MitmConfig {
    /// PEM certificate of the signing CA.
    pub ca_cert: PathBuf,
    /// PEM (PKCS#8) private key of the signing CA.
    pub ca_key: PathBuf,
    /// Subject template; `<host>` is replaced by the CONNECT host.
    #[serde(default = "default_dn_template")]
    pub dn_template: String,
    #[serde(default = "default_so_timeout")]
    pub so_timeout_minutes: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff")]
    pub connect_backoff_ms: u64,
}

fn default_dn_template() -> String {
    "CN=<host>, O=depot".to_owned()
}

fn default_so_timeout() -> u64 {
    30
}

fn default_connect_attempts() -> u32 {
    16
}

fn default_connect_backoff() -> u64 {
    1000
}

impl MitmConfig {
    pub fn new(ca_cert: impl Into<PathBuf>, ca_key: impl Into<PathBuf>) -> Self {
        Self {
            ca_cert: ca_cert.into(),
            ca_key: ca_key.into(),
            dn_template: default_dn_template(),
            so_timeout_minutes: default_so_timeout(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff(),
        }
    }

    pub fn so_timeout(&self) -> Duration {
        Duration::from_secs(self.so_timeout_minutes * 60)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Subject attributes for `host`, as `(attribute, value)` pairs.
    ///
    /// `CN=<host>, O=Test Org` yields `[("CN", host), ("O", "Test Org")]`.
    /// Unknown attributes are passed through; entries without `=` are dropped.
    pub fn subject_for(&self, host: &str) -> Vec<(String, String)> {
        self.dn_template
            .replace("<host>", host)
            .split(',')
            .filter_map(|part| {
                let (attr, value) = part.split_once('=')?;
                Some((attr.trim().to_ascii_uppercase(), value.trim().to_owned()))
            })
            .collect()
    }
}
