// rust/cleaner-core/src/storage/registry.rs

//! Resolves the adapter owning a path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::address::StorageType;
use super::local::LocalFileSystemAdapter;
use super::object::{ObjectStoreAdapter, ObjectStoreKind};
use super::traits::StorageAdapter;
use crate::config::CleanerConfig;
use crate::error::Result;

/// Owns one adapter per storage type, each built at most once.
pub struct StorageRegistry {
    config: CleanerConfig,
    adapters: Mutex<HashMap<StorageType, Arc<dyn StorageAdapter>>>,
}

impl StorageRegistry {
    pub fn new(config: CleanerConfig) -> Self {
        Self {
            config,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a pre-built adapter for `storage_type`.
    #[must_use]
    pub fn with_adapter(self, storage_type: StorageType, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.adapters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(storage_type, adapter);
        self
    }

    /// Returns the adapter for `storage_type`, constructing it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter cannot be configured, e.g. R2 without
    /// an account id.
    pub fn adapter(&self, storage_type: StorageType) -> Result<Arc<dyn StorageAdapter>> {
        let mut adapters = self
            .adapters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(adapter) = adapters.get(&storage_type) {
            return Ok(Arc::clone(adapter));
        }

        let adapter: Arc<dyn StorageAdapter> = match storage_type {
            StorageType::LocalFs => Arc::new(LocalFileSystemAdapter::new()),
            StorageType::S3 => Arc::new(ObjectStoreAdapter::new(ObjectStoreKind::S3, &self.config)?),
            StorageType::R2 => Arc::new(ObjectStoreAdapter::new(ObjectStoreKind::R2, &self.config)?),
            StorageType::Gcs => {
                Arc::new(ObjectStoreAdapter::new(ObjectStoreKind::Gcs, &self.config)?)
            }
        };
        tracing::debug!(%storage_type, "created storage adapter");
        adapters.insert(storage_type, Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Returns the adapter owning `path`.
    pub fn adapter_for_path(&self, path: &str) -> Result<Arc<dyn StorageAdapter>> {
        self.adapter(StorageType::for_path(path)?)
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new(CleanerConfig::default())
    }
}
