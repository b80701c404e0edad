//! Proxy credentials: `Proxy-Authorization: Basic` parsing, the pluggable
//! authenticator, and a short-lived cache of successful logins.

use crate::config::TrackingType;
use crate::ProxyError;
use base64::{engine::general_purpose, Engine as _};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const TRACKED_USER_SUFFIX: &str = "+tracking";

/// Credentials presented to the proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct UserPass {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl UserPass {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Decode a `Basic <base64(user:password)>` header value. Other schemes
    /// and malformed values yield `None`.
    pub fn from_basic(header: &str) -> Option<Self> {
        let (scheme, encoded) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some(Self::new(user, password))
    }

    /// `Basic ...` header value for these credentials.
    pub fn to_basic(&self) -> String {
        let encoded = general_purpose::STANDARD.encode(format!("{}:{}", self.user, self.password));
        format!("Basic {encoded}")
    }

    /// Tracking id under `tracking`, if this user is tracked.
    pub fn tracking_id(&self, tracking: TrackingType) -> Option<String> {
        match tracking {
            TrackingType::None => None,
            TrackingType::Always => Some(self.user.clone()),
            TrackingType::Suffix => self
                .user
                .strip_suffix(TRACKED_USER_SUFFIX)
                .filter(|id| !id.is_empty())
                .map(str::to_owned),
        }
    }
}

/// Decides whether proxy credentials are valid.
pub trait ProxyAuthenticator: Send + Sync {
    fn authenticate(&self, credentials: &UserPass) -> Result<bool, ProxyError>;
}

/// Checks credentials against a fixed user table.
pub struct StaticAuthenticator {
    users: BTreeMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: BTreeMap<String, String>) -> Self {
        Self { users }
    }
}

impl ProxyAuthenticator for StaticAuthenticator {
    fn authenticate(&self, credentials: &UserPass) -> Result<bool, ProxyError> {
        Ok(self
            .users
            .get(&credentials.user)
            .is_some_and(|password| *password == credentials.password))
    }
}

/// Remembers successful authentications for a TTL.
///
/// Entries are keyed by a salted BLAKE3 digest of `user:password`, so the
/// cache never holds a password.
pub struct AuthCache {
    salt: String,
    ttl: Duration,
    entries: Mutex<HashMap<[u8; 32], Instant>>,
}

impl AuthCache {
    pub fn new(salt: impl Into<String>, ttl: Duration) -> Self {
        Self {
            salt: salt.into(),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, credentials: &UserPass) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(credentials.user.as_bytes());
        hasher.update(b":");
        hasher.update(credentials.password.as_bytes());
        *hasher.finalize().as_bytes()
    }

    pub fn contains(&self, credentials: &UserPass) -> bool {
        let key = self.key(credentials);
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        match entries.get(&key) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                entries.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn remember(&self, credentials: &UserPass) {
        let key = self.key(credentials);
        if let Ok(mut entries) = self.entries.lock() {
            let now = Instant::now();
            entries.retain(|_, expires| *expires > now);
            entries.insert(key, now + self.ttl);
        }
    }
}

/// Authenticator fronted by an [`AuthCache`].
pub struct ProxyAuth {
    cache: AuthCache,
    authenticator: Arc<dyn ProxyAuthenticator>,
}

impl ProxyAuth {
    pub fn new(cache: AuthCache, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
        Self {
            cache,
            authenticator,
        }
    }

    pub fn check(&self, credentials: &UserPass) -> Result<bool, ProxyError> {
        if self.cache.contains(credentials) {
            debug!("proxy credentials for {} found in auth cache", credentials.user);
            return Ok(true);
        }
        let ok = self.authenticator.authenticate(credentials)?;
        if ok {
            self.cache.remember(credentials);
        } else {
            debug!("proxy credentials for {} rejected", credentials.user);
        }
        Ok(ok)
    }
}
