use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `[promote]` section of `depot.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoteConfig {
    /// Paths per transfer job.
    pub batch_size: usize,
    /// Concurrent top-level promotions.
    pub promote_workers: usize,
    /// Concurrent transfer jobs.
    pub transfer_workers: usize,
    /// Jobs allowed to wait for a transfer worker before submissions are
    /// rejected as overload.
    pub transfer_queue: usize,
    pub lock_timeout_seconds: u64,
    /// Mark a hosted store read-only once it has been promoted into a group.
    pub auto_lock_hosted_repos: bool,
    /// Public URL of this depot, handed to validation rules.
    pub base_url: Option<String>,
    pub callback_retry_limit: u32,
    pub callback_backoff_seconds: u64,
    pub rule_sets: Vec<RuleSet>,
}

impl Default for PromoteConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            promote_workers: 8,
            transfer_workers: 40,
            transfer_queue: 1000,
            lock_timeout_seconds: 30,
            auto_lock_hosted_repos: false,
            base_url: None,
            callback_retry_limit: 8,
            callback_backoff_seconds: 60,
            rule_sets: Vec::new(),
        }
    }
}

impl PromoteConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn callback_backoff(&self) -> Duration {
        Duration::from_secs(self.callback_backoff_seconds)
    }
}

/// Named validation rules applied to promotions whose target matches
/// `store_key_pattern` (an exact `pkg:type:name` key or `*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: String,
    pub store_key_pattern: String,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_uses_defaults() {
        let config: PromoteConfig = toml::from_str("").unwrap();
        assert_eq!(config, PromoteConfig::default());
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.transfer_workers, 40);
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rule_sets_parse() {
        let config: PromoteConfig = toml::from_str(
            r#"
            batch_size = 10
            [[rule_sets]]
            name = "releases"
            store_key_pattern = "maven:hosted:releases"
            rules = ["no-snapshots", "parsable-pom"]
            "#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.rule_sets[0].rules.len(), 2);
        assert_eq!(config.promote_workers, 8);
    }
}
