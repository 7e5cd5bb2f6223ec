//! Storage Cleaner
//!
//! Maintenance commands for directories of training runs on local disk or in
//! S3, R2 and GCS buckets.
//!
//! # Usage
//!
//! ```bash
//! # Show which runs without progress would be deleted
//! storage-cleaner --dry-run clean s3://ai2-llm/checkpoints/
//!
//! # Unshard the latest checkpoint of every run
//! storage-cleaner unshard --latest-checkpoint-only /data/runs/ s3://ai2-llm/unsharded/
//!
//! # Use a configuration file
//! storage-cleaner --config cleaner.toml clean --require-config-yaml r2://olmo/runs/
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cleaner_core::{
    CleanOptions, CleanerConfig, Confirmation, Deny, ExternalUnsharder, RenameOptions,
    RunCleaner, RunRenamer, StdinPrompt, StorageRegistry, UnshardOptions, Unsharder,
    WandbTracker,
};

/// Storage Cleaner
#[derive(Parser, Debug)]
#[command(name = "storage-cleaner")]
#[command(about = "Maintenance of training run directories across storage backends")]
struct Args {
    /// Log what would happen without changing any storage
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    /// Answer yes to every confirmation prompt
    #[arg(short = 'y', long = "yes", global = true)]
    ignore_prompts: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Cloudflare account id used for r2:// paths
    #[arg(long, global = true)]
    r2_account_id: Option<String>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Delete runs that hold no checkpoint past step 0
    Clean {
        /// Directory holding the runs, with a trailing '/'
        runs_path: String,

        /// Fail on entries without a checkpoint directory or config.yaml
        #[arg(long)]
        require_config_yaml: bool,

        /// Archive run files larger than this many bytes are ignored
        #[arg(long)]
        max_archive_size: Option<u64>,
    },

    /// Plan renaming runs to their Weights & Biases run ids
    RenameToWandb {
        /// Directory holding the runs, with a trailing '/'
        runs_path: String,

        /// Tracking entity for runs whose config names none
        #[arg(long)]
        entity: Option<String>,

        /// Tracking project for runs whose config names none
        #[arg(long)]
        project: Option<String>,
    },

    /// Unshard sharded checkpoints into a destination directory
    Unshard {
        /// Directory holding the runs, with a trailing '/'
        runs_src_path: String,

        /// Directory receiving the unsharded runs, with a trailing '/'
        runs_dest_path: String,

        /// Only unshard the latest checkpoint of each run
        #[arg(long)]
        latest_checkpoint_only: bool,

        /// Archive run files larger than this many bytes are ignored
        #[arg(long)]
        max_archive_size: Option<u64>,
    },
}

fn load_config(args: &Args) -> cleaner_core::Result<CleanerConfig> {
    let mut config = match &args.config {
        Some(path) => CleanerConfig::from_file(path)?,
        None => CleanerConfig::default(),
    }
    .with_env_overrides();

    if let Some(account_id) = &args.r2_account_id {
        config.r2.account_id = Some(account_id.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> cleaner_core::Result<()> {
    let config = load_config(&args)?;
    let max_archive_size = config.max_archive_size;
    let registry = Arc::new(StorageRegistry::new(config.clone()));

    match args.command {
        Command::Clean {
            runs_path,
            require_config_yaml,
            max_archive_size: size_override,
        } => {
            let confirmation: Arc<dyn Confirmation> = if args.ignore_prompts {
                Arc::new(Deny)
            } else {
                Arc::new(StdinPrompt)
            };
            let options = CleanOptions {
                dry_run: args.dry_run,
                ignore_prompts: args.ignore_prompts,
                require_config_yaml,
                max_archive_size: Some(size_override.unwrap_or(max_archive_size)),
            };
            let deleted = RunCleaner::new(registry, options, confirmation)
                .delete_bad_runs(&runs_path)
                .await?;
            tracing::info!("{} run(s) deleted", deleted.len());
        }
        Command::RenameToWandb {
            runs_path,
            entity,
            project,
        } => {
            let tracker = Arc::new(WandbTracker::from_config(&config.tracking)?);
            let mut options = RenameOptions::from_config(&config.tracking, args.dry_run);
            if entity.is_some() {
                options.default_entity = entity;
            }
            if project.is_some() {
                options.default_project = project;
            }
            let plan = RunRenamer::new(registry, options, tracker)
                .rename_runs_to_tracking_ids(&runs_path)
                .await?;
            tracing::info!("{} run(s) would be renamed", plan.len());
        }
        Command::Unshard {
            runs_src_path,
            runs_dest_path,
            latest_checkpoint_only,
            max_archive_size: size_override,
        } => {
            let unsharder = Arc::new(ExternalUnsharder::from_config(&config.unshard)?);
            let options = UnshardOptions {
                dry_run: args.dry_run,
                max_archive_size: Some(size_override.unwrap_or(max_archive_size)),
            };
            let report = Unsharder::new(registry, options, unsharder)
                .unshard_runs_checkpoints(&runs_src_path, &runs_dest_path, latest_checkpoint_only)
                .await?;
            tracing::info!(
                "{} checkpoint(s) unsharded, {} skipped",
                report.unsharded.len(),
                report.skipped.len()
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
