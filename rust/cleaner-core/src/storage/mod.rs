// rust/cleaner-core/src/storage/mod.rs

//! Storage abstraction over the backends holding training runs.
//!
//! Every backend implements [`StorageAdapter`], which lists, inspects,
//! deletes and transfers run data addressed by plain path strings:
//!
//! - local paths and `file://` URLs use [`LocalFileSystemAdapter`];
//! - `s3://`, `r2://` and `gs://` URLs use [`ObjectStoreAdapter`], which
//!   emulates directories with key prefixes.
//!
//! Archive files (`.tar`, `.tar.gz`, `.tgz`, `.tar.zst`, `.tzst`) are listed
//! as if they were the run directory they contain.
//!
//! # Example
//!
//! ```no_run
//! use cleaner_core::storage::StorageRegistry;
//!
//! # async fn example() -> cleaner_core::Result<()> {
//! let registry = StorageRegistry::default();
//! let adapter = registry.adapter_for_path("s3://ai2-llm/checkpoints/")?;
//! for run in adapter.list_entries("s3://ai2-llm/checkpoints/", None).await? {
//!     println!("{run}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod archive;
pub(crate) mod local;
mod object;
mod registry;
mod retry;
mod staging;
mod traits;

pub use address::{join_path, ObjectAddress, StorageType};
pub use local::LocalFileSystemAdapter;
pub use object::{check_delete_batch, DeleteReport, ObjectStoreAdapter, ObjectStoreKind, DELETE_BATCH_SIZE};
pub use registry::StorageRegistry;
pub use retry::RetryConfig;
pub use staging::StagingArea;
pub use traits::StorageAdapter;

#[cfg(test)]
pub(crate) use object::tests::{keys as memory_keys, memory_adapter, put as memory_put};
