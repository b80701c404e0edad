use crate::store::StoreKey;
use crate::types::PromotionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// HTTP method used to deliver a completion callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallbackMethod {
    #[default]
    Post,
    Put,
}

impl std::fmt::Display for CallbackMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackMethod::Post => write!(f, "POST"),
            CallbackMethod::Put => write!(f, "PUT"),
        }
    }
}

/// Where to report the final outcome of a promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackTarget {
    pub url: String,
    #[serde(default)]
    pub method: CallbackMethod,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl CallbackTarget {
    pub fn new(url: impl Into<String>, method: CallbackMethod) -> Self {
        Self {
            url: url.into(),
            method,
            headers: BTreeMap::new(),
            auth_token: None,
        }
    }
}

/// Copies a set of paths from one store into another.
///
/// An empty `paths` set means "everything under the source store".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsPromoteRequest {
    pub promotion_id: PromotionId,
    pub source: StoreKey,
    pub target: StoreKey,
    #[serde(default)]
    pub paths: BTreeSet<String>,
    #[serde(default)]
    pub purge_source: bool,
    #[serde(default)]
    pub fail_when_exists: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default = "default_true")]
    pub fire_events: bool,
    #[serde(default)]
    pub skip_validation: bool,
    /// Replace target content that already exists instead of skipping it.
    /// Only set on the reversed request synthesized by a rollback.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub overwrite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackTarget>,
}

fn default_true() -> bool {
    true
}

impl PathsPromoteRequest {
    pub fn new(source: StoreKey, target: StoreKey) -> Self {
        Self {
            promotion_id: PromotionId::generate(),
            source,
            target,
            paths: BTreeSet::new(),
            purge_source: false,
            fail_when_exists: false,
            dry_run: false,
            is_async: false,
            fire_events: true,
            skip_validation: false,
            overwrite: false,
            callback: None,
        }
    }

    #[must_use]
    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_fail_when_exists(mut self, fail: bool) -> Self {
        self.fail_when_exists = fail;
        self
    }

    #[must_use]
    pub fn with_purge_source(mut self, purge: bool) -> Self {
        self.purge_source = purge;
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    #[must_use]
    pub fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    #[must_use]
    pub fn with_fire_events(mut self, fire: bool) -> Self {
        self.fire_events = fire;
        self
    }

    #[must_use]
    pub fn with_callback(mut self, callback: CallbackTarget) -> Self {
        self.callback = Some(callback);
        self
    }

    /// The reversed request used to undo `completed`: source and target
    /// swapped, source purged afterwards, existing content overwritten.
    #[must_use]
    pub fn reversed(&self, completed: &BTreeSet<String>) -> Self {
        Self {
            promotion_id: self.promotion_id.clone(),
            source: self.target.clone(),
            target: self.source.clone(),
            paths: completed.clone(),
            purge_source: true,
            fail_when_exists: false,
            dry_run: false,
            is_async: false,
            fire_events: self.fire_events,
            skip_validation: true,
            overwrite: true,
            callback: None,
        }
    }
}

/// Outcome of a paths promotion. The three path sets are pairwise disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsPromoteResult {
    pub request: PathsPromoteRequest,
    #[serde(default)]
    pub pending_paths: BTreeSet<String>,
    #[serde(default)]
    pub completed_paths: BTreeSet<String>,
    #[serde(default)]
    pub skipped_paths: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl PathsPromoteResult {
    pub fn new(request: PathsPromoteRequest) -> Self {
        Self {
            request,
            pending_paths: BTreeSet::new(),
            completed_paths: BTreeSet::new(),
            skipped_paths: BTreeSet::new(),
            error: None,
            validation: None,
        }
    }

    pub fn failed(request: PathsPromoteRequest, error: impl Into<String>) -> Self {
        let mut result = Self::new(request);
        result.error = Some(error.into());
        result
    }

    /// Placeholder handed back for an async request before any work is done.
    pub fn accepted(request: PathsPromoteRequest) -> Self {
        let pending = request.paths.clone();
        let mut result = Self::new(request);
        result.pending_paths = pending;
        result
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn promotion_id(&self) -> &PromotionId {
        &self.request.promotion_id
    }

    /// The JSON shape delivered to callback receivers.
    pub fn summary(&self) -> PromotionSummary {
        PromotionSummary {
            promotion_id: self.request.promotion_id.clone(),
            pending_paths: self.pending_paths.clone(),
            completed_paths: self.completed_paths.clone(),
            skipped_paths: self.skipped_paths.clone(),
            error: self.error.clone(),
            success: self.succeeded(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionSummary {
    pub promotion_id: PromotionId,
    pub pending_paths: BTreeSet<String>,
    pub completed_paths: BTreeSet<String>,
    pub skipped_paths: BTreeSet<String>,
    pub error: Option<String>,
    pub success: bool,
}

/// Adds a store to a group's membership list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPromoteRequest {
    pub promotion_id: PromotionId,
    pub source: StoreKey,
    pub target_group: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default = "default_true")]
    pub fire_events: bool,
    #[serde(default)]
    pub skip_validation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackTarget>,
}

impl GroupPromoteRequest {
    pub fn new(source: StoreKey, target_group: impl Into<String>) -> Self {
        Self {
            promotion_id: PromotionId::generate(),
            source,
            target_group: target_group.into(),
            dry_run: false,
            is_async: false,
            fire_events: true,
            skip_validation: false,
            callback: None,
        }
    }

    /// Key of the target group. Also the token serializing membership edits.
    pub fn target_key(&self) -> StoreKey {
        StoreKey::group(
            self.source.package_type.clone(),
            self.target_group.as_str(),
        )
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    #[must_use]
    pub fn with_callback(mut self, callback: CallbackTarget) -> Self {
        self.callback = Some(callback);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPromoteResult {
    pub request: GroupPromoteRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

impl GroupPromoteResult {
    pub fn new(request: GroupPromoteRequest) -> Self {
        Self {
            request,
            error: None,
            validation: None,
        }
    }

    pub fn failed(request: GroupPromoteRequest, error: impl Into<String>) -> Self {
        Self {
            request,
            error: Some(error.into()),
            validation: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn summary(&self) -> GroupPromotionSummary {
        GroupPromotionSummary {
            promotion_id: self.request.promotion_id.clone(),
            source: self.request.source.clone(),
            target_group: self.request.target_group.clone(),
            error: self.error.clone(),
            success: self.succeeded(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPromotionSummary {
    pub promotion_id: PromotionId,
    pub source: StoreKey,
    pub target_group: String,
    pub error: Option<String>,
    pub success: bool,
}

/// Admission-control claim: a target store plus the paths being written to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKeyPaths {
    pub target: StoreKey,
    pub paths: BTreeSet<String>,
}

impl StoreKeyPaths {
    pub fn new(target: StoreKey, paths: BTreeSet<String>) -> Self {
        Self { target, paths }
    }

    pub fn intersects(&self, other: &StoreKeyPaths) -> bool {
        self.target == other.target && !self.paths.is_disjoint(&other.paths)
    }
}

/// Per-file outcome. Neither skipped nor failed means completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTransferResult {
    pub path: String,
    pub error: Option<String>,
    pub skipped: bool,
    /// Completed over content the target already held.
    pub replaced: bool,
}

impl PathTransferResult {
    pub fn completed(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error: None,
            skipped: false,
            replaced: false,
        }
    }

    pub fn replaced(path: impl Into<String>) -> Self {
        Self {
            replaced: true,
            ..Self::completed(path)
        }
    }

    pub fn skipped(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error: None,
            skipped: true,
            replaced: false,
        }
    }

    pub fn failed(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error: Some(error.into()),
            skipped: false,
            replaced: false,
        }
    }
}

/// Accumulated rule-set verdict for a promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_set: Option<String>,
    #[serde(default)]
    pub validator_errors: BTreeMap<String, String>,
}

impl ValidationResult {
    pub fn passed(rule_set: Option<String>) -> Self {
        Self {
            valid: true,
            rule_set,
            validator_errors: BTreeMap::new(),
        }
    }

    pub fn add_error(&mut self, rule: impl Into<String>, message: impl Into<String>) {
        self.valid = false;
        self.validator_errors.insert(rule.into(), message.into());
    }
}

impl std::fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.valid {
            return write!(f, "valid");
        }
        write!(f, "validation failed")?;
        if let Some(rs) = &self.rule_set {
            write!(f, " (rule set {rs})")?;
        }
        for (rule, msg) in &self.validator_errors {
            write!(f, "\n{rule}: {msg}")?;
        }
        Ok(())
    }
}
