use crate::callback::CallbackNotifier;
use crate::concurrency::{GroupLocks, PathConflictGuard};
use crate::config::PromoteConfig;
use crate::events::{EventBus, PromoteEvent};
use crate::pool::TransferPool;
use crate::transfer::TransferExecutor;
use crate::validate::{PromotionValidator, RuleSetValidator};
use crate::PromoteError;
use depot_model::{
    ArtifactStore, CallbackTarget, ChangeSummary, GroupPromoteRequest, GroupPromoteResult, PathTransferResult,
    PathsPromoteRequest, PathsPromoteResult, StoreKey, StoreKeyPaths, StoreKind, ValidationResult,
    SYSTEM_USER,
};
use depot_remote::CallbackTransport;
use depot_store::{ContentAccess, NotFoundCache, SpecialPathClassifier, StandardPathClassifier, StoreRegistry};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Entry point for paths and group promotion.
///
/// Cheap to clone; clones share the conflict guard, pools, group locks and
/// event bus. Every operation returns a result object; failures end up in its
/// `error` field rather than as an `Err`.
#[derive(Clone)]
pub struct PromotionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: PromoteConfig,
    registry: Arc<dyn StoreRegistry>,
    content: Arc<dyn ContentAccess>,
    nfc: Arc<dyn NotFoundCache>,
    executor: Arc<TransferExecutor>,
    validator: Arc<dyn PromotionValidator>,
    guard: PathConflictGuard,
    transfers: TransferPool,
    orchestration: Arc<Semaphore>,
    group_locks: GroupLocks,
    events: EventBus,
    notifier: Option<CallbackNotifier>,
}

pub struct PromotionManagerBuilder {
    config: PromoteConfig,
    registry: Arc<dyn StoreRegistry>,
    content: Arc<dyn ContentAccess>,
    nfc: Arc<dyn NotFoundCache>,
    classifier: Option<Arc<dyn SpecialPathClassifier>>,
    validator: Option<Arc<dyn PromotionValidator>>,
    transport: Option<Arc<dyn CallbackTransport>>,
    events: Option<EventBus>,
}

impl PromotionManagerBuilder {
    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn SpecialPathClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn PromotionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Without a transport, callback targets on requests are ignored.
    #[must_use]
    pub fn callback_transport(mut self, transport: Arc<dyn CallbackTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<PromotionManager, PromoteError> {
        let config = self.config;
        if config.batch_size == 0 {
            return Err(PromoteError::Config("promote.batch_size must be positive".to_owned()));
        }
        if config.promote_workers == 0 {
            return Err(PromoteError::Config(
                "promote.promote_workers must be positive".to_owned(),
            ));
        }
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(StandardPathClassifier));
        let validator = self.validator.unwrap_or_else(|| {
            Arc::new(
                RuleSetValidator::new(
                    config.rule_sets.clone(),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.content),
                )
                .with_base_url(config.base_url.clone()),
            )
        });
        let notifier = self.transport.map(|transport| {
            CallbackNotifier::new(
                transport,
                config.callback_retry_limit,
                config.callback_backoff(),
            )
        });
        let inner = Inner {
            executor: Arc::new(TransferExecutor::new(Arc::clone(&self.content), classifier)),
            transfers: TransferPool::new(config.transfer_workers, config.transfer_queue),
            orchestration: Arc::new(Semaphore::new(config.promote_workers)),
            guard: PathConflictGuard::new(),
            group_locks: GroupLocks::new(),
            events: self.events.unwrap_or_default(),
            registry: self.registry,
            content: self.content,
            nfc: self.nfc,
            validator,
            notifier,
            config,
        };
        Ok(PromotionManager {
            inner: Arc::new(inner),
        })
    }
}

/// Run blocking collaborator calls off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, PromoteError>
where
    F: FnOnce() -> Result<T, PromoteError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PromoteError::TaskFailed(e.to_string()))?
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_owned()
}

impl PromotionManager {
    pub fn builder(
        config: PromoteConfig,
        registry: Arc<dyn StoreRegistry>,
        content: Arc<dyn ContentAccess>,
        nfc: Arc<dyn NotFoundCache>,
    ) -> PromotionManagerBuilder {
        PromotionManagerBuilder {
            config,
            registry,
            content,
            nfc,
            classifier: None,
            validator: None,
            transport: None,
            events: None,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &PromoteConfig {
        &self.inner.config
    }

    /// Callbacks still waiting for a retry.
    pub fn pending_callbacks(&self) -> usize {
        self.inner
            .notifier
            .as_ref()
            .map_or(0, CallbackNotifier::pending_retries)
    }

    /// Promote `request.paths` (or everything in the source when empty) into
    /// the target. With `is_async` the returned result is only an accepted
    /// placeholder; the real outcome goes to the callback and the event bus.
    pub async fn promote_paths(&self, request: PathsPromoteRequest) -> PathsPromoteResult {
        if request.is_async {
            let accepted = PathsPromoteResult::accepted(request.clone());
            let this = self.clone();
            tokio::spawn(async move {
                this.promote_paths_now(request).await;
            });
            return accepted;
        }
        self.promote_paths_now(request).await
    }

    async fn promote_paths_now(&self, request: PathsPromoteRequest) -> PathsPromoteResult {
        let span = info_span!(
            "promote_paths",
            id = %request.promotion_id,
            source = %request.source,
            target = %request.target
        );
        async {
            match self.inner.orchestration.acquire().await {
                Ok(_permit) => self.run_paths(request).await,
                Err(e) => self.finish(PathsPromoteResult::failed(request, e.to_string())).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Log the outcome and deliver the callback, if any.
    async fn finish(&self, result: PathsPromoteResult) -> PathsPromoteResult {
        match &result.error {
            None => info!(
                "promotion finished: {} completed, {} skipped",
                result.completed_paths.len(),
                result.skipped_paths.len()
            ),
            Some(e) => warn!("promotion failed: {e}"),
        }
        if let Some(target) = &result.request.callback {
            self.notify(target, &result.summary()).await;
        }
        result
    }

    /// Re-run the pending paths of an earlier result, keeping what it had
    /// already completed or skipped.
    pub async fn resume_paths_promote(&self, result: PathsPromoteResult) -> PathsPromoteResult {
        if result.pending_paths.is_empty() {
            let mut result = result;
            result.error = None;
            return result;
        }
        let request = result.request.clone().with_paths(result.pending_paths.clone());
        let mut resumed = self.promote_paths_now(request).await;
        resumed.request = result.request;
        resumed.completed_paths.extend(result.completed_paths);
        resumed.skipped_paths.extend(result.skipped_paths);
        resumed
    }

    /// Undo a paths promotion: copy its completed paths back into the source
    /// (overwriting) and remove them from the target.
    pub async fn rollback_paths_promote(&self, result: PathsPromoteResult) -> PathsPromoteResult {
        let mut result = result;
        if result.completed_paths.is_empty() {
            result.error = None;
            return result;
        }
        let reversed = result.request.reversed(&result.completed_paths);
        let span = info_span!(
            "rollback_paths",
            id = %reversed.promotion_id,
            source = %reversed.source,
            target = %reversed.target
        );
        let outcome = async {
            match self.stores(&reversed).await {
                Ok((source, target)) => {
                    let candidates = reversed.paths.clone();
                    self.admitted(reversed, source, target, candidates).await
                }
                Err(message) => PathsPromoteResult::failed(reversed, message),
            }
        }
        .instrument(span)
        .await;

        match outcome.error {
            None => {
                info!(
                    "rolled back {} path(s) of promotion {}",
                    result.completed_paths.len(),
                    result.request.promotion_id
                );
                let completed = std::mem::take(&mut result.completed_paths);
                result.pending_paths.extend(completed);
                result.error = None;
            }
            Some(e) => {
                error!("rollback of promotion {} failed: {e}", result.request.promotion_id);
                result.error = Some(e);
            }
        }
        result
    }

    async fn stores(
        &self,
        request: &PathsPromoteRequest,
    ) -> Result<(ArtifactStore, ArtifactStore), String> {
        let registry = Arc::clone(&self.inner.registry);
        let (source_key, target_key) = (request.source.clone(), request.target.clone());
        let found = blocking(move || {
            Ok((registry.get(&source_key)?, registry.get(&target_key)?))
        })
        .await
        .map_err(|e| e.to_string())?;
        match found {
            (Some(source), Some(target)) => Ok((source, target)),
            _ => Err(format!(
                "Failed to retrieve stores, source: {}, target: {}",
                request.source, request.target
            )),
        }
    }

    async fn candidates(
        &self,
        request: &PathsPromoteRequest,
        source: &ArtifactStore,
    ) -> Result<BTreeSet<String>, PromoteError> {
        if !request.paths.is_empty() {
            return Ok(request.paths.iter().map(|p| normalize(p)).collect());
        }
        let content = Arc::clone(&self.inner.content);
        let source = source.clone();
        let listed = blocking(move || Ok(content.list_recursive(&source, "")?)).await?;
        Ok(listed.into_iter().collect())
    }

    async fn run_paths(&self, request: PathsPromoteRequest) -> PathsPromoteResult {
        let (source, target) = match self.stores(&request).await {
            Ok(pair) => pair,
            Err(message) => return self.finish(PathsPromoteResult::failed(request, message)).await,
        };
        let candidates = match self.candidates(&request, &source).await {
            Ok(c) => c,
            Err(e) => return self.finish(PathsPromoteResult::failed(request, e.to_string())).await,
        };
        if candidates.is_empty() {
            debug!("nothing to promote");
            return self.finish(PathsPromoteResult::new(request)).await;
        }

        let claim = StoreKeyPaths::new(target.key.clone(), candidates.clone());
        if !request.fail_when_exists {
            debug!("claim on {} with {} path(s) not guarded", claim.target, claim.paths.len());
            let result = self.admitted(request, source, target, candidates).await;
            return self.finish(result).await;
        }
        let rejected = request.clone();
        // The claim is held until the callback has been attempted.
        let guarded: Result<PathsPromoteResult, PathsPromoteResult> = self
            .inner
            .guard
            .run_guarded(
                claim,
                |_| async move {
                    let result = self.admitted(request, source, target, candidates).await;
                    Ok(self.finish(result).await)
                },
                |claim| {
                    let message = format!(
                        "Conflict detected, store: {}, paths: {:?}",
                        claim.target, claim.paths
                    );
                    warn!("{message}");
                    Err(PathsPromoteResult::failed(rejected, message))
                },
            )
            .await;
        match guarded {
            Ok(result) => result,
            Err(result) => self.finish(result).await,
        }
    }

    /// Validation, dry run, transfer and aggregation for an admitted request.
    async fn admitted(
        &self,
        request: PathsPromoteRequest,
        source: ArtifactStore,
        target: ArtifactStore,
        candidates: BTreeSet<String>,
    ) -> PathsPromoteResult {
        let ordered: Vec<String> = candidates.iter().cloned().collect();

        let mut validation = None;
        if !request.skip_validation {
            let validator = Arc::clone(&self.inner.validator);
            let (req, paths) = (request.clone(), ordered.clone());
            match blocking(move || validator.validate_paths(&req, &paths)).await {
                Ok(v) if !v.valid => {
                    info!("promotion rejected by validation: {v}");
                    let mut result = PathsPromoteResult::failed(request, v.to_string());
                    result.pending_paths = candidates;
                    result.validation = Some(v);
                    return result;
                }
                Ok(v) => validation = Some(v),
                Err(e) => return PathsPromoteResult::failed(request, e.to_string()),
            }
        }

        if request.dry_run {
            let mut result = PathsPromoteResult::new(request);
            result.pending_paths = candidates;
            result.validation = validation;
            return result;
        }

        let request = Arc::new(request);
        let source = Arc::new(source);
        let target = Arc::new(target);
        let mut errors = Vec::new();
        let mut jobs = self.inner.transfers.completion::<Vec<PathTransferResult>>();
        for batch in ordered.chunks(self.inner.config.batch_size) {
            let batch = batch.to_vec();
            let executor = Arc::clone(&self.inner.executor);
            let (req, src, dst) = (Arc::clone(&request), Arc::clone(&source), Arc::clone(&target));
            let submitted = jobs.submit(move || {
                batch
                    .iter()
                    .map(|path| executor.transfer_one(&src, &dst, path, &req))
                    .collect()
            });
            if let Err(e) = submitted {
                warn!("batch submission failed: {e}");
                errors.push(e.to_string());
                break;
            }
        }
        debug!("draining {} transfer batch(es)", jobs.len());

        let mut completed = BTreeSet::new();
        let mut created = BTreeSet::new();
        let mut skipped = BTreeSet::new();
        for drained in jobs.drain().await {
            match drained {
                Ok(batch) => {
                    for r in batch {
                        if let Some(e) = r.error {
                            errors.push(format!("{}: {e}", r.path));
                        } else if r.skipped {
                            skipped.insert(r.path);
                        } else {
                            if !r.replaced {
                                created.insert(r.path.clone());
                            }
                            completed.insert(r.path);
                        }
                    }
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        let request = Arc::unwrap_or_clone(request);
        let source = Arc::unwrap_or_clone(source);
        let target = Arc::unwrap_or_clone(target);

        if !errors.is_empty() {
            // Content the target held before this run stays in place.
            errors.extend(self.delete_all(&target, &created, "rollback").await);
            let mut result = PathsPromoteResult::failed(request, errors.join("\n"));
            result.pending_paths = candidates;
            result.validation = validation;
            return result;
        }

        self.clear_not_found(&source, &target, &completed).await;
        if request.purge_source {
            for e in self.delete_all(&source, &completed, "purge").await {
                warn!("{e}");
            }
        }

        let mut result = PathsPromoteResult::new(request);
        result.completed_paths = completed;
        result.skipped_paths = skipped;
        result.validation = validation;
        if result.request.fire_events {
            self.inner.events.publish(PromoteEvent::PathsPromoted {
                source: source.key,
                target: target.key,
                summary: result.summary(),
            });
        }
        result
    }

    /// Best-effort delete of `paths` from `store`; returns one message per
    /// failure.
    async fn delete_all(&self, store: &ArtifactStore, paths: &BTreeSet<String>, what: &'static str) -> Vec<String> {
        if paths.is_empty() {
            return Vec::new();
        }
        let content = Arc::clone(&self.inner.content);
        let store = store.clone();
        let paths = paths.clone();
        let outcome = blocking(move || {
            let mut failures = Vec::new();
            for path in &paths {
                if let Err(e) = content.delete(&store, path) {
                    failures.push(format!("{what} of {path} from {} failed: {e}", store.key));
                }
            }
            debug!("{what} removed {} path(s) from {}", paths.len() - failures.len(), store.key);
            Ok(failures)
        })
        .await;
        outcome.unwrap_or_else(|e| vec![format!("{what} failed: {e}")])
    }

    async fn clear_not_found(&self, source: &ArtifactStore, target: &ArtifactStore, paths: &BTreeSet<String>) {
        let registry = Arc::clone(&self.inner.registry);
        let nfc = Arc::clone(&self.inner.nfc);
        let keys = [source.key.clone(), target.key.clone()];
        let paths = paths.clone();
        let cleared = blocking(move || {
            let mut affected: Vec<StoreKey> = keys.to_vec();
            affected.extend(registry.groups_affected_by(&keys[1])?.into_iter().map(|g| g.key));
            for key in &affected {
                for path in &paths {
                    nfc.clear_missing(key, path);
                }
            }
            Ok(())
        })
        .await;
        if let Err(e) = cleared {
            warn!("cannot clear not-found entries after promotion: {e}");
        }
    }

    /// Add `request.source` to the target group's constituents.
    pub async fn promote_to_group(&self, request: GroupPromoteRequest) -> GroupPromoteResult {
        if request.is_async {
            let accepted = GroupPromoteResult::new(request.clone());
            let this = self.clone();
            tokio::spawn(async move {
                this.group_now(request, false).await;
            });
            return accepted;
        }
        self.group_now(request, false).await
    }

    /// Remove `result.request.source` from the target group again.
    pub async fn rollback_group_promote(&self, result: GroupPromoteResult) -> GroupPromoteResult {
        self.group_now(result.request, true).await
    }

    async fn group_now(&self, request: GroupPromoteRequest, rollback: bool) -> GroupPromoteResult {
        let span = info_span!(
            "promote_group",
            id = %request.promotion_id,
            source = %request.source,
            group = %request.target_group,
            rollback
        );
        async {
            let result = match self.inner.orchestration.acquire().await {
                Ok(_permit) if rollback => self.run_group_rollback(request).await,
                Ok(_permit) => self.run_group(request).await,
                Err(e) => GroupPromoteResult::failed(request, e.to_string()),
            };
            match &result.error {
                None => info!("group membership updated"),
                Some(e) => warn!("group promotion failed: {e}"),
            }
            if result.succeeded() && result.request.fire_events && !result.request.dry_run {
                self.inner.events.publish(PromoteEvent::GroupPromoted {
                    summary: result.summary(),
                    rolled_back: rollback,
                });
            }
            if let Some(target) = &result.request.callback {
                self.notify(target, &result.summary()).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn lookup(&self, key: &StoreKey) -> Result<Option<ArtifactStore>, PromoteError> {
        let registry = Arc::clone(&self.inner.registry);
        let key = key.clone();
        blocking(move || Ok(registry.get(&key)?)).await
    }

    async fn lookup_group(&self, request: &GroupPromoteRequest) -> Result<ArtifactStore, String> {
        match self.lookup(&request.target_key()).await {
            Ok(Some(group)) if matches!(group.kind, StoreKind::Group { .. }) => Ok(group),
            Ok(_) => Err(format!("No such target group: {}.", request.target_group)),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn run_group(&self, request: GroupPromoteRequest) -> GroupPromoteResult {
        let source = match self.lookup(&request.source).await {
            Ok(Some(source)) => source,
            Ok(None) => {
                let message = format!("Cannot promote from missing source: {}", request.source);
                return GroupPromoteResult::failed(request, message);
            }
            Err(e) => return GroupPromoteResult::failed(request, e.to_string()),
        };

        let target_key = request.target_key();
        let _lock = match self
            .inner
            .group_locks
            .acquire(&target_key, self.inner.config.lock_timeout())
            .await
        {
            Ok(lock) => lock,
            Err(e) => return GroupPromoteResult::failed(request, e.to_string()),
        };
        let group = match self.lookup_group(&request).await {
            Ok(group) => group,
            Err(message) => return GroupPromoteResult::failed(request, message),
        };

        let validation = if request.skip_validation {
            None
        } else {
            let validator = Arc::clone(&self.inner.validator);
            let req = request.clone();
            match blocking(move || validator.validate_group(&req)).await {
                Ok(v) if !v.valid => return Self::group_invalid(request, v),
                Ok(v) => Some(v),
                Err(e) => return GroupPromoteResult::failed(request, e.to_string()),
            }
        };

        let mut result = GroupPromoteResult::new(request);
        result.validation = validation;
        if result.request.dry_run {
            return result;
        }
        if group.constituents().contains(&source.key) {
            debug!("{} is already a member of {}", source.key, group.key);
            return result;
        }

        let summary = ChangeSummary::new(
            SYSTEM_USER,
            format!("Promoting {} into membership of group: {}", source.key, group.key),
        );
        let updated = group.with_constituent(&source.key);
        let lock_source = self.inner.config.auto_lock_hosted_repos
            && matches!(source.kind, StoreKind::Hosted { read_only: false });
        if let Err(e) = self.save_group(updated, summary.clone()).await {
            result.error = Some(e.to_string());
            return result;
        }
        if lock_source {
            let registry = Arc::clone(&self.inner.registry);
            let locked = source.with_read_only(true);
            let saved = blocking(move || {
                let summary = ChangeSummary::new(summary.user, format!("Locking promoted store {}", locked.key));
                Ok(registry.save(locked, &summary)?)
            })
            .await;
            if let Err(e) = saved {
                warn!("cannot mark {} read-only: {e}", source.key);
            }
        }
        result
    }

    async fn run_group_rollback(&self, request: GroupPromoteRequest) -> GroupPromoteResult {
        let target_key = request.target_key();
        let _lock = match self
            .inner
            .group_locks
            .acquire(&target_key, self.inner.config.lock_timeout())
            .await
        {
            Ok(lock) => lock,
            Err(e) => return GroupPromoteResult::failed(request, e.to_string()),
        };
        let group = match self.lookup_group(&request).await {
            Ok(group) => group,
            Err(message) => return GroupPromoteResult::failed(request, message),
        };
        if !group.constituents().contains(&request.source) {
            let message = format!(
                "Group: {} does not contain member: {}",
                request.target_group, request.source
            );
            return GroupPromoteResult::failed(request, message);
        }
        let summary = ChangeSummary::new(
            SYSTEM_USER,
            format!("Removing {} from membership of group: {}", request.source, group.key),
        );
        let updated = group.without_constituent(&request.source);
        match self.save_group(updated, summary).await {
            Ok(()) => GroupPromoteResult::new(request),
            Err(e) => GroupPromoteResult::failed(request, e.to_string()),
        }
    }

    fn group_invalid(request: GroupPromoteRequest, validation: ValidationResult) -> GroupPromoteResult {
        info!("group promotion rejected by validation: {validation}");
        let mut result = GroupPromoteResult::failed(request, validation.to_string());
        result.validation = Some(validation);
        result
    }

    /// Persist the new group value and drop cached misses for it and every
    /// group containing it.
    async fn save_group(&self, group: ArtifactStore, summary: ChangeSummary) -> Result<(), PromoteError> {
        let registry = Arc::clone(&self.inner.registry);
        let nfc = Arc::clone(&self.inner.nfc);
        blocking(move || {
            let key = group.key.clone();
            registry.save(group, &summary)?;
            nfc.clear_store(&key);
            for affected in registry.groups_affected_by(&key)? {
                nfc.clear_store(&affected.key);
            }
            Ok(())
        })
        .await
    }

    async fn notify<T: serde::Serialize>(&self, target: &CallbackTarget, body: &T) {
        match &self.inner.notifier {
            Some(notifier) => {
                if !notifier.notify(target, body).await {
                    debug!("callback to {} stashed for retry", target.url);
                }
            }
            None => debug!("no callback transport configured, not calling {}", target.url),
        }
    }
}
