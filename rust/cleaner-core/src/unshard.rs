// rust/cleaner-core/src/unshard.rs

//! Conversion of sharded checkpoints into unsharded ones.
//!
//! For every run under a source root, the sharded checkpoint directories are
//! staged locally, handed to an unsharding tool, and the result is uploaded
//! to `<dest run>/<name>-unsharded`. Checkpoints that already have an
//! unsharded counterpart, next to the source or at the destination, are
//! skipped, so a pass can be repeated safely.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::checkpoint::{is_sharded_checkpoint_dir, select_latest, unsharded_name};
use crate::config::{UnshardConfig, DEFAULT_MAX_ARCHIVE_SIZE};
use crate::error::{CleanerError, Result};
use crate::storage::address::base_name;
use crate::storage::archive::{self, has_supported_archive_extension, strip_archive_extension};
use crate::storage::local::run_blocking;
use crate::storage::{join_path, StagingArea, StorageAdapter, StorageRegistry, StorageType};

/// Turns a local sharded checkpoint directory into an unsharded one.
#[async_trait]
pub trait CheckpointUnsharder: Send + Sync {
    /// Reads `sharded_dir` and writes the unsharded checkpoint into the
    /// existing, empty directory `unsharded_dir`.
    async fn unshard(&self, sharded_dir: &Path, unsharded_dir: &Path) -> Result<()>;
}

/// Runs an external program as `<program> <args>... <sharded> <unsharded>`.
#[derive(Debug, Clone)]
pub struct ExternalUnsharder {
    program: String,
    args: Vec<String>,
}

impl ExternalUnsharder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds the unsharder from a configured command line.
    pub fn from_config(config: &UnshardConfig) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| CleanerError::config("unshard.command must not be empty"))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl CheckpointUnsharder for ExternalUnsharder {
    async fn unshard(&self, sharded_dir: &Path, unsharded_dir: &Path) -> Result<()> {
        let command = self.command_line();
        tracing::debug!(
            command = %command,
            sharded = %sharded_dir.display(),
            unsharded = %unsharded_dir.display(),
            "running unsharder"
        );

        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(sharded_dir)
            .arg(unsharded_dir)
            .status()
            .await
            .map_err(|e| CleanerError::external_tool(&command, format!("failed to start: {e}")))?;

        if !status.success() {
            return Err(CleanerError::external_tool(command, status.to_string()));
        }
        Ok(())
    }
}

/// Options for an unsharding pass.
#[derive(Debug, Clone)]
pub struct UnshardOptions {
    /// Log what would be unsharded without doing it.
    pub dry_run: bool,
    /// Archive run files larger than this are left alone.
    pub max_archive_size: Option<u64>,
}

impl Default for UnshardOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_archive_size: Some(DEFAULT_MAX_ARCHIVE_SIZE),
        }
    }
}

/// Outcome of an unsharding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnshardReport {
    /// Destination directories written, or in dry-run mode the ones that
    /// would have been written.
    pub unsharded: Vec<String>,
    /// Sharded checkpoints that already had an unsharded counterpart.
    pub skipped: Vec<String>,
    /// Sharded checkpoints the unsharding tool failed on.
    pub failed: Vec<String>,
}

/// The run directory a pass works on, possibly unpacked from an archive.
struct RunSource {
    storage: Arc<dyn StorageAdapter>,
    path: String,
    dest: String,
    /// Keeps an unpacked archive alive while the run is processed.
    _staging: Option<StagingArea>,
}

/// Unshards the checkpoints of every run under a source root.
pub struct Unsharder {
    registry: Arc<StorageRegistry>,
    options: UnshardOptions,
    unsharder: Arc<dyn CheckpointUnsharder>,
}

impl Unsharder {
    pub fn new(
        registry: Arc<StorageRegistry>,
        options: UnshardOptions,
        unsharder: Arc<dyn CheckpointUnsharder>,
    ) -> Self {
        Self {
            registry,
            options,
            unsharder,
        }
    }

    /// Unshards the sharded checkpoints of every run under `source_root` into
    /// the same run name under `dest_root`. Both roots must end in `/`.
    ///
    /// With `latest_only`, only the highest step of each run is considered.
    ///
    /// # Errors
    ///
    /// Failures of the unsharding tool are recorded and the pass continues;
    /// if any occurred, `UnshardFailed` is returned at the end. Every other
    /// error aborts the pass immediately, including `Unsupported` for a
    /// destination that cannot be written, in dry-run mode too.
    pub async fn unshard_runs_checkpoints(
        &self,
        source_root: &str,
        dest_root: &str,
        latest_only: bool,
    ) -> Result<UnshardReport> {
        tracing::info!(source_root, dest_root, latest_only, "Starting unsharding checkpoints");

        if !source_root.ends_with('/') {
            return Err(CleanerError::user_input(
                "Runs path does not end with '/'. Please verify that path is a directory and re-run with trailing '/'.",
            ));
        }
        if !dest_root.ends_with('/') {
            return Err(CleanerError::user_input(
                "Checkpoints destination directory does not end with '/'. Please verify that path is a directory and re-run with trailing '/'.",
            ));
        }

        let storage = self.registry.adapter_for_path(source_root)?;
        let entries = storage
            .list_entries(source_root, self.options.max_archive_size)
            .await?;

        let mut report = UnshardReport::default();
        for entry in &entries {
            let run = join_path(source_root, entry);
            let Some(source) = self.open_run(&storage, &run, dest_root, entry).await? else {
                continue;
            };
            self.unshard_run(&run, &source, latest_only, &mut report)
                .await?;
        }

        tracing::info!(
            unsharded = report.unsharded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            dry_run = self.options.dry_run,
            "Finished unsharding checkpoints"
        );

        if !report.failed.is_empty() {
            return Err(CleanerError::UnshardFailed {
                failed: report.failed,
            });
        }
        Ok(report)
    }

    /// Resolves where the run's checkpoints can be listed. Archive runs are
    /// downloaded and unpacked; other plain files are skipped.
    async fn open_run(
        &self,
        storage: &Arc<dyn StorageAdapter>,
        run: &str,
        dest_root: &str,
        entry: &str,
    ) -> Result<Option<RunSource>> {
        if !storage.is_file(run).await? {
            return Ok(Some(RunSource {
                storage: Arc::clone(storage),
                path: run.to_string(),
                dest: join_path(dest_root, entry),
                _staging: None,
            }));
        }

        if !has_supported_archive_extension(run) {
            tracing::info!(run, "Trying to get sharded checkpoints from non-archive file, skipping");
            return Ok(None);
        }

        let staging = StagingArea::new("run")?;
        storage.download_to_folder(run, staging.path()).await?;

        let archive_path = staging.join(base_name(run));
        let unpack_dir = staging.join("unpacked");
        let probe_path = archive_path.clone();
        let root = run_blocking(&archive_path, move || archive::unpack(&probe_path, &unpack_dir))
            .await?;
        tracing::debug!(run, root = %root.display(), "unpacked archive run");

        Ok(Some(RunSource {
            storage: self.registry.adapter(StorageType::LocalFs)?,
            path: root.to_string_lossy().into_owned(),
            dest: join_path(dest_root, strip_archive_extension(entry)),
            _staging: Some(staging),
        }))
    }

    async fn sharded_checkpoints(&self, source: &RunSource, latest_only: bool) -> Result<Vec<String>> {
        let mut candidates = Vec::new();
        for name in source.storage.list_dirs(&source.path).await? {
            let path = join_path(&source.path, &name);
            if is_sharded_checkpoint_dir(source.storage.as_ref(), &path).await? {
                candidates.push(name);
            }
        }

        if latest_only {
            candidates = select_latest(candidates).into_iter().collect();
        }
        Ok(candidates)
    }

    async fn unshard_run(
        &self,
        run: &str,
        source: &RunSource,
        latest_only: bool,
        report: &mut UnshardReport,
    ) -> Result<()> {
        let candidates = self.sharded_checkpoints(source, latest_only).await?;
        if candidates.is_empty() {
            tracing::debug!(run, "no sharded checkpoints");
            return Ok(());
        }

        let dest_storage = self.registry.adapter_for_path(&source.dest)?;

        for name in candidates {
            let sharded = join_path(&source.path, &name);
            let display_name = join_path(run, &name);
            let unsharded = unsharded_name(&name);

            let existing_in_source = join_path(&source.path, &unsharded);
            if source.storage.is_dir(&existing_in_source).await? {
                tracing::info!(
                    checkpoint = %display_name,
                    existing = %existing_in_source,
                    "Unsharded directory already exists at source, skipping"
                );
                report.skipped.push(display_name);
                continue;
            }

            let dest_dir = join_path(&source.dest, &unsharded);
            if dest_storage.is_dir(&dest_dir).await? {
                tracing::info!(
                    checkpoint = %display_name,
                    existing = %dest_dir,
                    "Unsharded directory already exists at destination, skipping"
                );
                report.skipped.push(display_name);
                continue;
            }

            dest_storage.ensure_upload_supported()?;
            if self.options.dry_run {
                tracing::info!(checkpoint = %display_name, dest = %dest_dir, "Would unshard sharded checkpoint");
                report.unsharded.push(dest_dir);
                continue;
            }

            tracing::info!(checkpoint = %display_name, dest = %dest_dir, "Unsharding sharded checkpoint");
            match self
                .unshard_checkpoint(source.storage.as_ref(), &sharded, dest_storage.as_ref(), &dest_dir)
                .await
            {
                Ok(()) => report.unsharded.push(dest_dir),
                Err(e) if e.is_per_checkpoint() => {
                    tracing::error!(checkpoint = %display_name, error = %e, "Failed to unshard checkpoint");
                    report.failed.push(display_name);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn unshard_checkpoint(
        &self,
        source: &dyn StorageAdapter,
        sharded: &str,
        dest: &dyn StorageAdapter,
        dest_dir: &str,
    ) -> Result<()> {
        let sharded_staging = StagingArea::new("sharded")?;
        source.download_to_folder(sharded, sharded_staging.path()).await?;

        let unsharded_staging = StagingArea::new("unsharded")?;
        self.unsharder
            .unshard(sharded_staging.path(), unsharded_staging.path())
            .await?;

        dest.upload(dest_dir, unsharded_staging.path()).await
    }
}
