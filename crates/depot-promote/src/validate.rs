use crate::config::RuleSet;
use crate::PromoteError;
use depot_model::{
    ArtifactStore, GroupPromoteRequest, PathsPromoteRequest, StoreKey, ValidationResult,
};
use depot_store::{ContentAccess, StoreRegistry};
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

pub const NO_SNAPSHOTS: &str = "no-snapshots";
pub const NO_PRE_EXISTING_PATHS: &str = "no-pre-existing-paths";
pub const PARSABLE_POM: &str = "parsable-pom";

/// Business-rule check run before any promotion side effect.
///
/// A returned [`ValidationResult`] with `valid == false` rejects the
/// promotion; an `Err` is a hard failure (bad rule set, unreadable content).
pub trait PromotionValidator: Send + Sync {
    fn validate_paths(
        &self,
        request: &PathsPromoteRequest,
        candidates: &[String],
    ) -> Result<ValidationResult, PromoteError>;

    fn validate_group(&self, request: &GroupPromoteRequest) -> Result<ValidationResult, PromoteError>;
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

impl PromotionValidator for NoopValidator {
    fn validate_paths(
        &self,
        _request: &PathsPromoteRequest,
        _candidates: &[String],
    ) -> Result<ValidationResult, PromoteError> {
        Ok(ValidationResult::passed(None))
    }

    fn validate_group(&self, _request: &GroupPromoteRequest) -> Result<ValidationResult, PromoteError> {
        Ok(ValidationResult::passed(None))
    }
}

/// Applies the first configured [`RuleSet`] whose pattern matches the
/// promotion target.
pub struct RuleSetValidator {
    rule_sets: Vec<RuleSet>,
    registry: Arc<dyn StoreRegistry>,
    content: Arc<dyn ContentAccess>,
    base_url: Option<String>,
}

struct Subject<'a> {
    source: &'a ArtifactStore,
    target: &'a ArtifactStore,
    paths: &'a [String],
}

impl RuleSetValidator {
    pub fn new(
        rule_sets: Vec<RuleSet>,
        registry: Arc<dyn StoreRegistry>,
        content: Arc<dyn ContentAccess>,
    ) -> Self {
        Self {
            rule_sets,
            registry,
            content,
            base_url: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    fn rule_set_for(&self, target: &StoreKey) -> Option<&RuleSet> {
        let key = target.to_string();
        self.rule_sets
            .iter()
            .find(|rs| rs.store_key_pattern == "*" || rs.store_key_pattern == key)
    }

    fn store(&self, key: &StoreKey) -> Result<ArtifactStore, PromoteError> {
        self.registry
            .get(key)?
            .ok_or_else(|| PromoteError::Validation(format!("no such store: {key}")))
    }

    fn run(&self, rule_set: &RuleSet, subject: &Subject<'_>) -> Result<ValidationResult, PromoteError> {
        let mut result = ValidationResult::passed(Some(rule_set.name.clone()));
        for rule in &rule_set.rules {
            let offending = match rule.as_str() {
                NO_SNAPSHOTS => subject
                    .paths
                    .iter()
                    .filter(|p| p.contains("-SNAPSHOT"))
                    .cloned()
                    .collect::<Vec<_>>(),
                NO_PRE_EXISTING_PATHS => {
                    let mut found = Vec::new();
                    for path in subject.paths {
                        if self.content.exists(subject.target, path)? {
                            found.push(path.clone());
                        }
                    }
                    found
                }
                PARSABLE_POM => {
                    let mut bad = Vec::new();
                    for path in subject.paths.iter().filter(|p| p.ends_with(".pom")) {
                        if !self.looks_like_pom(subject.source, path)? {
                            bad.push(path.clone());
                        }
                    }
                    bad
                }
                other => {
                    return Err(PromoteError::Validation(format!(
                        "rule set '{}' names unknown rule '{other}'",
                        rule_set.name
                    )));
                }
            };
            if !offending.is_empty() {
                debug!("rule {rule} rejected {} path(s)", offending.len());
                result.add_error(rule.as_str(), offending.join(", "));
            }
        }
        if let Some(base) = &self.base_url {
            debug!("validated against {base} with rule set {}", rule_set.name);
        }
        Ok(result)
    }

    fn looks_like_pom(&self, store: &ArtifactStore, path: &str) -> Result<bool, PromoteError> {
        if !self.content.exists(store, path)? {
            return Ok(true);
        }
        let mut body = String::new();
        self.content
            .open_read(store, path)?
            .read_to_string(&mut body)
            .map_err(|e| PromoteError::Validation(format!("cannot read {path}: {e}")))?;
        Ok(body.contains("<project"))
    }
}

impl PromotionValidator for RuleSetValidator {
    fn validate_paths(
        &self,
        request: &PathsPromoteRequest,
        candidates: &[String],
    ) -> Result<ValidationResult, PromoteError> {
        let Some(rule_set) = self.rule_set_for(&request.target) else {
            return Ok(ValidationResult::passed(None));
        };
        let source = self.store(&request.source)?;
        let target = self.store(&request.target)?;
        self.run(
            rule_set,
            &Subject {
                source: &source,
                target: &target,
                paths: candidates,
            },
        )
    }

    fn validate_group(&self, request: &GroupPromoteRequest) -> Result<ValidationResult, PromoteError> {
        let target_key = request.target_key();
        let Some(rule_set) = self.rule_set_for(&target_key) else {
            return Ok(ValidationResult::passed(None));
        };
        let source = self.store(&request.source)?;
        let target = self.store(&target_key)?;
        let paths = self.content.list_recursive(&source, "")?;
        self.run(
            rule_set,
            &Subject {
                source: &source,
                target: &target,
                paths: &paths,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_model::ChangeSummary;
    use depot_store::{FileContentManager, FileStoreRegistry, MemoryNotFoundCache, StoreLayout, TransferFlags};

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<FileStoreRegistry>,
        content: Arc<FileContentManager>,
        source: ArtifactStore,
        target: ArtifactStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let registry = Arc::new(FileStoreRegistry::open(layout.clone()).unwrap());
        let content = Arc::new(FileContentManager::new(
            layout,
            registry.clone(),
            Arc::new(MemoryNotFoundCache::new()),
        ));
        let source = ArtifactStore::hosted(StoreKey::hosted("maven", "build"));
        let target = ArtifactStore::hosted(StoreKey::hosted("maven", "releases"));
        let summary = ChangeSummary::system("test");
        registry.save(source.clone(), &summary).unwrap();
        registry.save(target.clone(), &summary).unwrap();
        Fixture {
            _dir: dir,
            registry,
            content,
            source,
            target,
        }
    }

    fn validator(fx: &Fixture, pattern: &str, rules: &[&str]) -> RuleSetValidator {
        RuleSetValidator::new(
            vec![RuleSet {
                name: "releases".to_owned(),
                store_key_pattern: pattern.to_owned(),
                rules: rules.iter().map(|r| (*r).to_owned()).collect(),
            }],
            fx.registry.clone(),
            fx.content.clone(),
        )
    }

    fn put(fx: &Fixture, store: &ArtifactStore, path: &str, body: &[u8]) {
        fx.content
            .store(store, path, &mut &body[..], TransferFlags::default())
            .unwrap();
    }

    fn request(fx: &Fixture) -> PathsPromoteRequest {
        PathsPromoteRequest::new(fx.source.key.clone(), fx.target.key.clone())
    }

    #[test]
    fn unmatched_target_passes() {
        let fx = fixture();
        let v = validator(&fx, "maven:hosted:other", &[NO_SNAPSHOTS]);
        let result = v
            .validate_paths(&request(&fx), &["a-SNAPSHOT.jar".to_owned()])
            .unwrap();
        assert!(result.valid);
        assert!(result.rule_set.is_none());
    }

    #[test]
    fn snapshots_rejected() {
        let fx = fixture();
        let v = validator(&fx, "maven:hosted:releases", &[NO_SNAPSHOTS]);
        let result = v
            .validate_paths(
                &request(&fx),
                &["a/1.0/a.jar".to_owned(), "a/1.1-SNAPSHOT/a-1.1-SNAPSHOT.jar".to_owned()],
            )
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.rule_set.as_deref(), Some("releases"));
        assert!(result.validator_errors[NO_SNAPSHOTS].contains("1.1-SNAPSHOT"));
    }

    #[test]
    fn pre_existing_paths_rejected() {
        let fx = fixture();
        put(&fx, &fx.target, "a/1.0/a.jar", b"old");
        let v = validator(&fx, "*", &[NO_PRE_EXISTING_PATHS]);
        let result = v
            .validate_paths(&request(&fx), &["a/1.0/a.jar".to_owned(), "b.jar".to_owned()])
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.validator_errors[NO_PRE_EXISTING_PATHS], "a/1.0/a.jar");
    }

    #[test]
    fn unparsable_pom_rejected() {
        let fx = fixture();
        put(&fx, &fx.source, "a/1.0/a.pom", b"<project><modelVersion/></project>");
        put(&fx, &fx.source, "b/1.0/b.pom", b"garbage");
        let v = validator(&fx, "*", &[PARSABLE_POM]);
        let result = v
            .validate_paths(
                &request(&fx),
                &["a/1.0/a.pom".to_owned(), "b/1.0/b.pom".to_owned()],
            )
            .unwrap();
        assert_eq!(result.validator_errors[PARSABLE_POM], "b/1.0/b.pom");
    }

    #[test]
    fn unknown_rule_is_a_hard_failure() {
        let fx = fixture();
        let v = validator(&fx, "*", &["no-such-rule"]);
        assert!(matches!(
            v.validate_paths(&request(&fx), &["x".to_owned()]),
            Err(PromoteError::Validation(_))
        ));
    }

    #[test]
    fn group_validation_lists_source_contents() {
        let fx = fixture();
        let group = ArtifactStore::group(StoreKey::group("maven", "public"), vec![]);
        fx.registry
            .save(group, &ChangeSummary::system("test"))
            .unwrap();
        put(&fx, &fx.source, "a/1.0-SNAPSHOT/a.jar", b"x");
        let v = validator(&fx, "maven:group:public", &[NO_SNAPSHOTS]);
        let req = GroupPromoteRequest::new(fx.source.key.clone(), "public");
        assert!(!v.validate_group(&req).unwrap().valid);
    }
}
