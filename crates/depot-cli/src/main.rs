mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::promote::{GroupArgs, PathsArgs};
use commands::{
    callback_target, parse_store_key, Depot, EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR,
};
use config::{expand_tilde, DepotConfig, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "depot",
    version,
    about = "Artifact store promotion and the HTTProx caching proxy"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Store root directory (overrides [storage] root).
    #[arg(long, global = true)]
    store: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Copy paths from one store into another, all or nothing.
    PromotePaths {
        /// Source store key, e.g. maven:hosted:build.
        source: String,
        /// Target store key.
        target: String,
        /// Path to promote (repeatable). Omit to promote the whole source.
        #[arg(long = "path")]
        paths: Vec<String>,
        /// Delete promoted paths from the source afterwards.
        #[arg(long, default_value_t = false)]
        purge_source: bool,
        /// Fail instead of skipping paths the target already holds.
        #[arg(long, default_value_t = false)]
        fail_when_exists: bool,
        /// Validate and report without copying anything.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        skip_validation: bool,
        /// URL notified with the promotion summary.
        #[arg(long)]
        callback: Option<String>,
        /// Deliver the callback with PUT instead of POST.
        #[arg(long, default_value_t = false)]
        callback_put: bool,
        /// Write the full result here, for rollback-paths or resume-paths.
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Retry the pending paths of a saved paths-promotion result.
    ResumePaths {
        result: PathBuf,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Add a store to a group.
    PromoteGroup {
        /// Source store key.
        source: String,
        /// Name of the target group (same package type as the source).
        group: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        skip_validation: bool,
        #[arg(long)]
        callback: Option<String>,
        #[arg(long, default_value_t = false)]
        callback_put: bool,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Undo a saved paths-promotion result.
    RollbackPaths {
        result: PathBuf,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Undo a saved group-promotion result.
    RollbackGroup {
        result: PathBuf,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Run the HTTProx proxy until interrupted.
    Proxy {
        /// Listen port (overrides [httprox] port).
        #[arg(long)]
        port: Option<u16>,
        /// Listen address (overrides [httprox] bind).
        #[arg(long)]
        bind: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DEPOT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: cannot start async runtime: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("store error:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<u8, String> {
    let mut config = match &cli.config {
        Some(path) => DepotConfig::load(path, true)?,
        None => DepotConfig::load(&PathBuf::from(DEFAULT_CONFIG_FILE), false)?,
    };
    let root = cli
        .store
        .as_deref()
        .map_or_else(|| config.store_root(), expand_tilde);
    let depot = Depot::open(&root, &config)?;
    let json = cli.json;

    match cli.command {
        Commands::PromotePaths {
            source,
            target,
            paths,
            purge_source,
            fail_when_exists,
            dry_run,
            skip_validation,
            callback,
            callback_put,
            output,
        } => {
            let args = PathsArgs {
                source: parse_store_key(&source)?,
                target: parse_store_key(&target)?,
                paths,
                purge_source,
                fail_when_exists,
                dry_run,
                skip_validation,
                callback: callback_target(callback.as_deref(), callback_put),
            };
            let manager = depot.promotion_manager(&config)?;
            commands::promote::paths(&manager, args, output.as_deref(), json).await
        }
        Commands::ResumePaths { result, output } => {
            let manager = depot.promotion_manager(&config)?;
            commands::promote::resume_paths(&manager, &result, output.as_deref(), json).await
        }
        Commands::PromoteGroup {
            source,
            group,
            dry_run,
            skip_validation,
            callback,
            callback_put,
            output,
        } => {
            let args = GroupArgs {
                source: parse_store_key(&source)?,
                target_group: group,
                dry_run,
                skip_validation,
                callback: callback_target(callback.as_deref(), callback_put),
            };
            let manager = depot.promotion_manager(&config)?;
            commands::promote::group(&manager, args, output.as_deref(), json).await
        }
        Commands::RollbackPaths { result, output } => {
            let manager = depot.promotion_manager(&config)?;
            commands::rollback::paths(&manager, &result, output.as_deref(), json).await
        }
        Commands::RollbackGroup { result, output } => {
            let manager = depot.promotion_manager(&config)?;
            commands::rollback::group(&manager, &result, output.as_deref(), json).await
        }
        Commands::Proxy { port, bind } => {
            if let Some(port) = port {
                config.httprox.port = port;
            }
            if let Some(bind) = bind {
                config.httprox.bind = bind;
            }
            commands::proxy::run(&depot, &config).await
        }
    }
}
