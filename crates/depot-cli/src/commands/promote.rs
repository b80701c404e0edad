use super::{json_pretty, load_result, save_result, EXIT_FAILURE, EXIT_SUCCESS};
use depot_model::{
    CallbackTarget, GroupPromoteRequest, GroupPromoteResult, PathsPromoteRequest,
    PathsPromoteResult, StoreKey,
};
use depot_promote::PromotionManager;
use std::path::Path;

pub struct PathsArgs {
    pub source: StoreKey,
    pub target: StoreKey,
    pub paths: Vec<String>,
    pub purge_source: bool,
    pub fail_when_exists: bool,
    pub dry_run: bool,
    pub skip_validation: bool,
    pub callback: Option<CallbackTarget>,
}

pub async fn paths(
    manager: &PromotionManager,
    args: PathsArgs,
    output: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let mut request = PathsPromoteRequest::new(args.source, args.target)
        .with_paths(args.paths)
        .with_purge_source(args.purge_source)
        .with_fail_when_exists(args.fail_when_exists)
        .with_dry_run(args.dry_run)
        .with_skip_validation(args.skip_validation);
    if let Some(callback) = args.callback {
        request = request.with_callback(callback);
    }
    let result = manager.promote_paths(request).await;
    report_paths(&result, output, json)
}

pub async fn resume_paths(
    manager: &PromotionManager,
    result_file: &Path,
    output: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let previous: PathsPromoteResult = load_result(result_file)?;
    let result = manager.resume_paths_promote(previous).await;
    report_paths(&result, output, json)
}

pub struct GroupArgs {
    pub source: StoreKey,
    pub target_group: String,
    pub dry_run: bool,
    pub skip_validation: bool,
    pub callback: Option<CallbackTarget>,
}

pub async fn group(
    manager: &PromotionManager,
    args: GroupArgs,
    output: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let mut request = GroupPromoteRequest::new(args.source, args.target_group)
        .with_dry_run(args.dry_run)
        .with_skip_validation(args.skip_validation);
    if let Some(callback) = args.callback {
        request = request.with_callback(callback);
    }
    let result = manager.promote_to_group(request).await;
    report_group(&result, output, json)
}

pub(super) fn report_paths(
    result: &PathsPromoteResult,
    output: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    if let Some(path) = output {
        save_result(path, result)?;
    }
    if json {
        println!("{}", json_pretty(&result.summary())?);
    } else {
        let request = &result.request;
        println!(
            "{} {} -> {}: {} completed, {} skipped, {} pending",
            result.promotion_id(),
            request.source,
            request.target,
            result.completed_paths.len(),
            result.skipped_paths.len(),
            result.pending_paths.len(),
        );
        if let Some(validation) = &result.validation {
            for (rule, message) in &validation.validator_errors {
                println!("  {rule}: {message}");
            }
        }
        if let Some(error) = &result.error {
            eprintln!("promotion failed: {error}");
        }
    }
    Ok(if result.succeeded() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

pub(super) fn report_group(
    result: &GroupPromoteResult,
    output: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    if let Some(path) = output {
        save_result(path, result)?;
    }
    if json {
        println!("{}", json_pretty(&result.summary())?);
    } else {
        let request = &result.request;
        match &result.error {
            None => println!("{} {} -> group {}: ok", request.promotion_id, request.source, request.target_group),
            Some(error) => eprintln!(
                "{} {} -> group {}: {error}",
                request.promotion_id, request.source, request.target_group
            ),
        }
    }
    Ok(if result.succeeded() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
