// rust/cleaner-core/src/storage/traits.rs

//! The storage adapter contract shared by every backend.
//!
//! Paths are plain strings: local paths (optionally `file://`) or object
//! store URLs such as `s3://bucket/key`. Listings only ever cover the
//! immediate children of a location.

use std::path::Path;

use async_trait::async_trait;

use super::address::StorageType;
use crate::error::{CleanerError, Result};

/// One backend able to list, inspect, delete and transfer run data.
///
/// # Object Safety
///
/// This trait is object-safe and is used as `Arc<dyn StorageAdapter>`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Lists the names of the immediate children of `path`.
    ///
    /// Names are sorted, unique and carry no trailing separator. When
    /// `max_file_size` is set, files larger than it are left out while
    /// directories are always included. Archive files are listed as if they
    /// were directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is missing, is a plain file, or is an
    /// archive combined with a size filter (`Unsupported`).
    async fn list_entries(&self, path: &str, max_file_size: Option<u64>) -> Result<Vec<String>>;

    /// Lists the names of the immediate child directories of `path`.
    async fn list_dirs(&self, path: &str) -> Result<Vec<String>>;

    async fn is_file(&self, path: &str) -> Result<bool>;

    async fn is_dir(&self, path: &str) -> Result<bool>;

    /// Recursively deletes everything at `path`. Deleting a missing path is
    /// not an error.
    async fn delete_path(&self, path: &str) -> Result<()>;

    /// Copies the file or the tree at `path` into the local folder
    /// `local_dest`, preserving relative structure.
    async fn download_to_folder(&self, path: &str, local_dest: &Path) -> Result<()>;

    /// Copies the local file or the contents of the local directory
    /// `local_src` to `path`.
    async fn upload(&self, path: &str, local_src: &Path) -> Result<()>;

    fn storage_type(&self) -> StorageType;

    fn supports_delete(&self) -> bool {
        true
    }

    fn supports_upload(&self) -> bool {
        true
    }

    /// Fails with `Unsupported` unless this backend can delete.
    fn ensure_delete_supported(&self) -> Result<()> {
        if self.supports_delete() {
            Ok(())
        } else {
            Err(CleanerError::unsupported(format!(
                "deleting from {} storage",
                self.storage_type()
            )))
        }
    }

    /// Fails with `Unsupported` unless this backend can upload.
    fn ensure_upload_supported(&self) -> Result<()> {
        if self.supports_upload() {
            Ok(())
        } else {
            Err(CleanerError::unsupported(format!(
                "uploading to {} storage",
                self.storage_type()
            )))
        }
    }
}
