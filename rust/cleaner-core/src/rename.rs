// rust/cleaner-core/src/rename.rs

//! Renaming run directories to their experiment tracking ids.
//!
//! Only planning is supported: each run's `config.yaml` is read, the run is
//! looked up in the tracking service and the resulting rename is logged.

use std::sync::Arc;

use crate::cleaner::CONFIG_YAML;
use crate::config::TrackingConfig;
use crate::error::{CleanerError, Result};
use crate::storage::{join_path, StagingArea, StorageAdapter, StorageRegistry};
use crate::tracking::{resolve_run_id, RunTracker, TrainConfig};

/// Options for a rename pass.
#[derive(Debug, Clone, Default)]
pub struct RenameOptions {
    pub dry_run: bool,
    /// Entity used when a run's config does not name one.
    pub default_entity: Option<String>,
    /// Project used when a run's config does not name one.
    pub default_project: Option<String>,
}

impl RenameOptions {
    pub fn from_config(config: &TrackingConfig, dry_run: bool) -> Self {
        Self {
            dry_run,
            default_entity: config.default_entity.clone(),
            default_project: config.default_project.clone(),
        }
    }
}

/// A planned rename of one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRename {
    pub run: String,
    pub tracking_id: String,
    pub target: String,
}

pub struct RunRenamer {
    registry: Arc<StorageRegistry>,
    options: RenameOptions,
    tracker: Arc<dyn RunTracker>,
}

impl RunRenamer {
    pub fn new(
        registry: Arc<StorageRegistry>,
        options: RenameOptions,
        tracker: Arc<dyn RunTracker>,
    ) -> Self {
        Self {
            registry,
            options,
            tracker,
        }
    }

    /// Plans renaming every run directory under `runs_root` to its tracking
    /// id.
    ///
    /// # Errors
    ///
    /// Returns `UserInput` for a root without a trailing `/`, `NotFound`
    /// when a run has no `config.yaml`, `TrackingLookup` when a run cannot
    /// be resolved, and `Unsupported` outside dry-run mode once the plan is
    /// complete.
    pub async fn rename_runs_to_tracking_ids(&self, runs_root: &str) -> Result<Vec<RunRename>> {
        tracing::info!(runs_root, "Starting renaming of runs to tracking ids");

        if !runs_root.ends_with('/') {
            return Err(CleanerError::user_input(
                "Runs path does not end with '/'. Please verify that path is a directory and re-run with trailing '/'.",
            ));
        }

        let storage = self.registry.adapter_for_path(runs_root)?;
        let run_dirs = storage.list_dirs(runs_root).await?;

        let mut plan = Vec::with_capacity(run_dirs.len());
        for dir in run_dirs {
            let run = join_path(runs_root, &dir);
            let tracking_id = self.tracking_id(storage.as_ref(), &run).await?;
            let target = join_path(runs_root, &tracking_id);
            tracing::info!(run = %run, target = %target, "Would rename run");
            plan.push(RunRename {
                run,
                tracking_id,
                target,
            });
        }

        if !self.options.dry_run {
            return Err(CleanerError::unsupported("renaming runs to tracking ids"));
        }
        Ok(plan)
    }

    async fn tracking_id(&self, storage: &dyn StorageAdapter, run: &str) -> Result<String> {
        let entries = storage.list_entries(run, None).await?;
        let config_path = join_path(run, CONFIG_YAML);
        if !entries.iter().any(|entry| entry == CONFIG_YAML) {
            return Err(CleanerError::not_found(config_path));
        }

        let staging = StagingArea::new("config")?;
        storage
            .download_to_folder(&config_path, staging.path())
            .await?;
        let config = TrainConfig::load(staging.join(CONFIG_YAML))?;

        let wandb = config.wandb.ok_or_else(|| {
            CleanerError::tracking_lookup(format!("no wandb settings in {config_path}"))
        })?;
        let entity = wandb
            .entity
            .or_else(|| self.options.default_entity.clone())
            .ok_or_else(|| {
                CleanerError::tracking_lookup(format!("no tracking entity set for {run}"))
            })?;
        let project = wandb
            .project
            .or_else(|| self.options.default_project.clone())
            .ok_or_else(|| {
                CleanerError::tracking_lookup(format!("no tracking project set for {run}"))
            })?;
        let name = wandb.name.ok_or_else(|| {
            CleanerError::tracking_lookup(format!("no tracking run name set in {config_path}"))
        })?;

        resolve_run_id(self.tracker.as_ref(), &entity, &project, &name).await
    }
}
