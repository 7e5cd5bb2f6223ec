// rust/cleaner-core/src/lib.rs

//! Storage Cleaner - Core Library
//!
//! This crate maintains training run directories kept on local disk or in
//! object stores (S3, R2, GCS): it deletes runs that never got past step 0,
//! unshards sharded checkpoints through an external tool and plans renames of
//! runs to their experiment tracking ids.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::CleanerConfig;
pub use error::{CleanerError, Result};
pub use storage::{LocalFileSystemAdapter, ObjectStoreAdapter, StorageAdapter, StorageRegistry};

pub mod checkpoint;
pub use checkpoint::{checkpoint_ordinal, CheckpointDir};

pub mod prompt;
pub use prompt::{Confirmation, Deny, StdinPrompt};

pub mod cleaner;
pub use cleaner::{CleanOptions, RunCleaner};

pub mod unshard;
pub use unshard::{CheckpointUnsharder, ExternalUnsharder, UnshardOptions, UnshardReport, Unsharder};

pub mod tracking;
pub use tracking::{RunTracker, TrainConfig, WandbTracker};

pub mod rename;
pub use rename::{RenameOptions, RunRename, RunRenamer};
