// rust/cleaner-core/src/storage/local.rs

//! Local filesystem storage adapter.
//!
//! Directories are listed directly. Archive files are listed through the
//! archive probe so that a tarball of a run looks like the run directory.
//! Filesystem work runs on the blocking thread pool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use super::address::{local_path, StorageType};
use super::archive;
use super::traits::StorageAdapter;
use crate::error::{CleanerError, Result};

/// Runs blocking filesystem work off the async executor.
pub(crate) async fn run_blocking<T, F>(path: &Path, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        CleanerError::storage(path, format!("blocking filesystem task failed: {e}"))
    })?
}

/// Copies every file and directory below `src` into `dest`, preserving
/// relative paths. `src` itself is not recreated.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| CleanerError::storage_with_source(dest, "failed to create directory", e))?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| {
            CleanerError::storage_with_source(src, "failed to walk directory", io::Error::from(e))
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| CleanerError::storage(entry.path(), "entry escapes source directory"))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| {
                CleanerError::storage_with_source(&target, "failed to create directory", e)
            })?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copies one file, creating the destination's parent directories.
pub(crate) fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                CleanerError::storage_with_source(parent, "failed to create parent directories", e)
            })?;
        }
    }
    fs::copy(src, dest).map_err(|e| {
        CleanerError::storage_with_source(src, format!("failed to copy to {}", dest.display()), e)
    })?;
    Ok(())
}

fn list_dir_entries(dir: &Path, max_file_size: Option<u64>, dirs_only: bool) -> Result<Vec<String>> {
    let mut names = Vec::new();

    for entry in fs::read_dir(dir)
        .map_err(|e| CleanerError::storage_with_source(dir, "failed to read directory", e))?
    {
        let entry = entry.map_err(|e| {
            CleanerError::storage_with_source(dir, "failed to read directory entry", e)
        })?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::warn!(path = %entry.path().display(), "skipping entry with non-UTF-8 name");
            continue;
        };

        // Follows symlinks, like the rest of the adapter
        let is_dir = entry.path().is_dir();
        if dirs_only && !is_dir {
            continue;
        }

        if !is_dir {
            if let Some(max_size) = max_file_size {
                let size = entry
                    .metadata()
                    .map_err(|e| {
                        CleanerError::storage_with_source(entry.path(), "failed to read metadata", e)
                    })?
                    .len();
                if size > max_size {
                    tracing::info!(
                        path = %entry.path().display(),
                        size,
                        max_size,
                        "skipping file larger than the size limit"
                    );
                    continue;
                }
            }
        }

        names.push(name);
    }

    names.sort();
    names.dedup();
    Ok(names)
}

fn list_local(path: PathBuf, max_file_size: Option<u64>, dirs_only: bool) -> Result<Vec<String>> {
    if path.is_dir() {
        return list_dir_entries(&path, max_file_size, dirs_only);
    }

    if !path.is_file() {
        return Err(CleanerError::storage(&path, "no such file or directory"));
    }

    if !archive::has_supported_archive_extension(&path.to_string_lossy()) {
        return Err(CleanerError::storage(
            &path,
            "path is a file, not a directory or archive",
        ));
    }

    if max_file_size.is_some() {
        return Err(CleanerError::unsupported(format!(
            "size-filtered listing of archive {}",
            path.display()
        )));
    }

    archive::list_top_level_entries(&path, dirs_only)
}

/// Storage adapter for the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystemAdapter;

impl LocalFileSystemAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageAdapter for LocalFileSystemAdapter {
    async fn list_entries(&self, path: &str, max_file_size: Option<u64>) -> Result<Vec<String>> {
        let path = local_path(path);
        run_blocking(&path.clone(), move || list_local(path, max_file_size, false)).await
    }

    async fn list_dirs(&self, path: &str) -> Result<Vec<String>> {
        let path = local_path(path);
        run_blocking(&path.clone(), move || list_local(path, None, true)).await
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        Ok(local_path(path).is_file())
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(local_path(path).is_dir())
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        let path = local_path(path);
        let target = path.clone();

        run_blocking(&path, move || {
            if target.is_dir() {
                fs::remove_dir_all(&target).map_err(|e| {
                    CleanerError::storage_with_source(&target, "failed to delete directory", e)
                })
            } else if target.exists() {
                fs::remove_file(&target).map_err(|e| {
                    CleanerError::storage_with_source(&target, "failed to delete file", e)
                })
            } else {
                tracing::debug!(path = %target.display(), "nothing to delete");
                Ok(())
            }
        })
        .await
    }

    async fn download_to_folder(&self, path: &str, local_dest: &Path) -> Result<()> {
        let source = local_path(path);
        let dest = local_dest.to_path_buf();
        tracing::debug!(source = %source.display(), dest = %dest.display(), "copying to staging");

        run_blocking(&source.clone(), move || {
            if source.is_dir() {
                copy_tree(&source, &dest)
            } else if source.is_file() {
                let file_name = source
                    .file_name()
                    .ok_or_else(|| CleanerError::storage(&source, "path has no file name"))?;
                copy_file(&source, &dest.join(file_name))
            } else {
                Err(CleanerError::not_found(source.to_string_lossy()))
            }
        })
        .await
    }

    async fn upload(&self, path: &str, local_src: &Path) -> Result<()> {
        let dest = local_path(path);
        let source = local_src.to_path_buf();
        tracing::debug!(source = %source.display(), dest = %dest.display(), "copying from staging");

        run_blocking(&dest.clone(), move || {
            if source.is_dir() {
                copy_tree(&source, &dest)
            } else if source.is_file() {
                copy_file(&source, &dest)
            } else {
                Err(CleanerError::not_found(source.to_string_lossy()))
            }
        })
        .await
    }

    fn storage_type(&self) -> StorageType {
        StorageType::LocalFs
    }
}
