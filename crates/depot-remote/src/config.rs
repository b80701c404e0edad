use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client-side settings shared by every outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_timeout")]
    pub request_timeout_seconds: u64,
    /// Sent as `Authorization: Bearer <token>` to remote-store upstreams.
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_timeout() -> u64 {
    30
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_timeout(),
            auth_token: None,
        }
    }
}

impl SiteConfig {
    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.request_timeout_seconds = seconds;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub(crate) fn agent(&self) -> ureq::Agent {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout()))
            .build();
        config.into()
    }
}
