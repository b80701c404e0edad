use depot_model::{ArtifactStore, PathTransferResult, PathsPromoteRequest, StoreKind};
use depot_store::{ContentAccess, SpecialPathClassifier, StoreError, TransferFlags};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SOURCE_MISSING: &str = "source file not exists";
pub const TARGET_EXISTS: &str = "target file already exists";

/// Moves one path from a source store into a target store.
///
/// Blocking; callers run it on a blocking worker.
pub struct TransferExecutor {
    content: Arc<dyn ContentAccess>,
    classifier: Arc<dyn SpecialPathClassifier>,
}

impl TransferExecutor {
    pub fn new(content: Arc<dyn ContentAccess>, classifier: Arc<dyn SpecialPathClassifier>) -> Self {
        Self {
            content,
            classifier,
        }
    }

    pub fn transfer_one(
        &self,
        source: &ArtifactStore,
        target: &ArtifactStore,
        path: &str,
        request: &PathsPromoteRequest,
    ) -> PathTransferResult {
        match self.try_transfer(source, target, path, request) {
            Ok(result) => result,
            Err(e) => {
                warn!("promotion of {path} from {} to {} failed: {e}", source.key, target.key);
                PathTransferResult::failed(path, e.to_string())
            }
        }
    }

    fn try_transfer(
        &self,
        source: &ArtifactStore,
        target: &ArtifactStore,
        path: &str,
        request: &PathsPromoteRequest,
    ) -> Result<PathTransferResult, StoreError> {
        let special = self
            .classifier
            .classify(path, source.key.package_type.as_str());
        let is_metadata = special.is_some_and(|s| s.metadata);

        if !self.content.exists(source, path)? {
            if special.is_some_and(|s| !s.decoratable || s.metadata) {
                // Never manufactured by promotion; a stale target copy of
                // metadata still has to go.
                if is_metadata {
                    self.content.delete(target, path)?;
                }
                debug!("{path} missing from {} and not promotable, skipping", source.key);
                return Ok(PathTransferResult::skipped(path));
            }
            let refetched = matches!(source.kind, StoreKind::Remote { .. })
                && self.content.redownload(source, path)?;
            if !refetched {
                return Ok(PathTransferResult::failed(path, SOURCE_MISSING));
            }
        }

        if is_metadata {
            if self.content.delete(target, path)? {
                debug!("removed {path} from {}; it is regenerated on demand", target.key);
            }
            return Ok(PathTransferResult::skipped(path));
        }

        let existed = self.content.exists(target, path)?;
        if existed {
            if request.fail_when_exists {
                return Ok(PathTransferResult::failed(path, TARGET_EXISTS));
            }
            if !request.overwrite {
                return Ok(PathTransferResult::skipped(path));
            }
        }

        let mut reader = self.content.open_read(source, path)?;
        let written = self
            .content
            .store(target, path, &mut reader, TransferFlags::PROMOTION)?;
        debug!("promoted {path} ({written} bytes) from {} to {}", source.key, target.key);
        if existed {
            return Ok(PathTransferResult::replaced(path));
        }
        Ok(PathTransferResult::completed(path))
    }
}
