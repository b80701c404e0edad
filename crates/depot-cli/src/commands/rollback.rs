use super::load_result;
use super::promote::{report_group, report_paths};
use depot_model::{GroupPromoteResult, PathsPromoteResult};
use depot_promote::PromotionManager;
use std::path::Path;

/// Undo the paths promotion recorded in `result_file`.
pub async fn paths(
    manager: &PromotionManager,
    result_file: &Path,
    output: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let result: PathsPromoteResult = load_result(result_file)?;
    tracing::info!(
        "rolling back {} ({} completed paths)",
        result.promotion_id(),
        result.completed_paths.len()
    );
    let rolled_back = manager.rollback_paths_promote(result).await;
    report_paths(&rolled_back, output, json)
}

pub async fn group(
    manager: &PromotionManager,
    result_file: &Path,
    output: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let result: GroupPromoteResult = load_result(result_file)?;
    tracing::info!(
        "removing {} from group {}",
        result.request.source,
        result.request.target_group
    );
    let rolled_back = manager.rollback_group_promote(result).await;
    report_group(&rolled_back, output, json)
}
