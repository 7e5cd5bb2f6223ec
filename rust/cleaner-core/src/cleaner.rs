// rust/cleaner-core/src/cleaner.rs

//! Deletion of runs that never produced a useful checkpoint.
//!
//! A pass first plans every run under the runs root, then deletes. Any run
//! failing validation aborts the pass before anything is deleted.

use std::sync::Arc;

use crate::checkpoint::{contains_checkpoint_dir, contains_nontrivial_checkpoint_dir};
use crate::config::DEFAULT_MAX_ARCHIVE_SIZE;
use crate::error::{CleanerError, Result};
use crate::prompt::Confirmation;
use crate::storage::{join_path, StorageAdapter, StorageRegistry};

/// Name of the training config every run directory is expected to hold.
pub const CONFIG_YAML: &str = "config.yaml";

/// Options for a cleaning pass.
#[derive(Debug, Clone)]
pub struct CleanOptions {
    /// Log what would be deleted without deleting.
    pub dry_run: bool,
    /// Proceed without asking when a run has no checkpoint directory.
    pub ignore_prompts: bool,
    /// Treat entries without a checkpoint directory or `config.yaml` as
    /// errors instead of asking.
    pub require_config_yaml: bool,
    /// Archive run files larger than this are left alone.
    pub max_archive_size: Option<u64>,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            ignore_prompts: false,
            require_config_yaml: false,
            max_archive_size: Some(DEFAULT_MAX_ARCHIVE_SIZE),
        }
    }
}

/// What a cleaning pass does with one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    Keep,
    Delete,
}

/// Deletes runs holding no checkpoint past step 0.
pub struct RunCleaner {
    registry: Arc<StorageRegistry>,
    options: CleanOptions,
    confirmation: Arc<dyn Confirmation>,
}

impl RunCleaner {
    pub fn new(
        registry: Arc<StorageRegistry>,
        options: CleanOptions,
        confirmation: Arc<dyn Confirmation>,
    ) -> Self {
        Self {
            registry,
            options,
            confirmation,
        }
    }

    /// Deletes every bad run directly under `runs_root`, which must end in
    /// `/`.
    ///
    /// Returns the runs deleted, or in dry-run mode the runs that would have
    /// been deleted.
    ///
    /// # Errors
    ///
    /// Returns `UserInput` if the root is malformed or a run fails
    /// validation. Nothing is deleted in that case. Returns `Unsupported`
    /// when a run would be deleted from a backend that cannot delete, in
    /// dry-run mode too.
    pub async fn delete_bad_runs(&self, runs_root: &str) -> Result<Vec<String>> {
        tracing::info!(runs_root, "Starting deletion of bad runs");

        if !runs_root.ends_with('/') {
            return Err(CleanerError::user_input(
                "Runs path does not end with '/'. Please verify that path is a directory and re-run with trailing '/'.",
            ));
        }

        let storage = self.registry.adapter_for_path(runs_root)?;
        let entries = storage
            .list_entries(runs_root, self.options.max_archive_size)
            .await?;

        let mut plan = Vec::with_capacity(entries.len());
        for entry in &entries {
            let run = join_path(runs_root, entry);
            let verdict = self.plan_run(storage.as_ref(), &run).await?;
            tracing::debug!(run = %run, ?verdict, "planned run");
            plan.push((run, verdict));
        }

        let mut deleted = Vec::new();
        for (run, verdict) in plan {
            if verdict != RunVerdict::Delete {
                continue;
            }
            storage.ensure_delete_supported()?;
            if self.options.dry_run {
                tracing::info!(run = %run, "Would delete run");
            } else {
                tracing::info!(run = %run, "Deleting run");
                storage.delete_path(&run).await?;
            }
            deleted.push(run);
        }

        tracing::info!(
            runs = entries.len(),
            deleted = deleted.len(),
            dry_run = self.options.dry_run,
            "Finished deletion of bad runs"
        );
        Ok(deleted)
    }

    /// Decides whether one run should be kept, listing it exactly once.
    pub async fn plan_run(&self, storage: &dyn StorageAdapter, run: &str) -> Result<RunVerdict> {
        let entries = storage.list_entries(run, None).await?;

        if !contains_checkpoint_dir(&entries) {
            self.verify_deletion_without_checkpoint_dir(run)?;
        }

        if self.options.require_config_yaml && !entries.iter().any(|entry| entry == CONFIG_YAML) {
            return Err(CleanerError::user_input(format!(
                "No {CONFIG_YAML} found in run directory entry {run}. This entry might not correspond to a run."
            )));
        }

        if contains_nontrivial_checkpoint_dir(&entries) {
            Ok(RunVerdict::Keep)
        } else {
            Ok(RunVerdict::Delete)
        }
    }

    fn verify_deletion_without_checkpoint_dir(&self, run: &str) -> Result<()> {
        let message = format!(
            "No checkpoint dir found in run directory entry {run}. This entry might not correspond to a run."
        );
        if self.options.require_config_yaml {
            return Err(CleanerError::user_input(message));
        }

        tracing::warn!("{message}");

        if !self.options.ignore_prompts
            && !self
                .confirmation
                .confirm(&format!("{message} Would you still like to delete {run}?"))
        {
            return Err(CleanerError::user_input(message));
        }
        Ok(())
    }
}
