// rust/cleaner-core/src/storage/staging.rs

//! Scoped local directories used to move data between backends.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{CleanerError, Result};

/// A local temporary directory removed when dropped.
///
/// Orchestration steps create one per transfer and keep it alive for as long
/// as the staged data is needed, so every exit path cleans up.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    /// Creates a fresh staging directory under the system temp dir. The
    /// label shows up in the directory name to ease debugging.
    pub fn new(label: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("storage-cleaner-{label}-"))
            .tempdir()
            .map_err(|e| {
                CleanerError::storage_with_source(
                    std::env::temp_dir(),
                    "failed to create staging directory",
                    e,
                )
            })?;
        tracing::debug!(path = %dir.path().display(), "created staging area");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_on_drop() {
        let staging = StagingArea::new("test").unwrap();
        let path = staging.path().to_path_buf();
        std::fs::write(staging.join("model.pt"), b"weights").unwrap();
        assert!(path.is_dir());

        drop(staging);
        assert!(!path.exists());
    }

    #[test]
    fn test_label_in_name() {
        let staging = StagingArea::new("unshard").unwrap();
        let name = staging.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("storage-cleaner-unshard-"));
    }
}
