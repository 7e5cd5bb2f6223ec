// rust/cleaner-core/src/storage/object.rs

//! Object store adapter for `s3://`, `r2://` and `gs://` paths.
//!
//! Directories are emulated with `/`-delimited key prefixes. Every transport
//! call goes through the retry policy, and `NotFound` answers existence
//! checks instead of failing them. Clients are built lazily, once per bucket.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ListResult, ObjectMeta, ObjectStore, PutPayload};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use walkdir::WalkDir;

use super::address::{base_name, ObjectAddress, StorageType};
use super::archive;
use super::local::run_blocking;
use super::retry::{classify, retry_async, RetryConfig, RetryResult};
use super::staging::StagingArea;
use super::traits::StorageAdapter;
use crate::config::{CleanerConfig, GcsConfig, R2Config, S3Config};
use crate::error::{CleanerError, Result};

/// Maximum number of keys sent in one bulk delete request.
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Which object store service an adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectStoreKind {
    S3,
    /// Cloudflare R2, spoken to over the S3 protocol.
    R2,
    Gcs,
}

impl ObjectStoreKind {
    pub fn storage_type(self) -> StorageType {
        match self {
            Self::S3 => StorageType::S3,
            Self::R2 => StorageType::R2,
            Self::Gcs => StorageType::Gcs,
        }
    }
}

/// Outcome of one bulk delete request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Keys the store reports as deleted.
    pub deleted: Vec<String>,
    /// Keys the store reported an error for, with the error message.
    pub errors: Vec<(String, String)>,
}

impl DeleteReport {
    /// Pairs per-key results with the keys requested, in request order.
    fn from_results(requested: &[ObjectPath], results: Vec<object_store::Result<ObjectPath>>) -> Self {
        let mut report = Self::default();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(path) => report.deleted.push(path.to_string()),
                Err(e) => {
                    let key = requested
                        .get(index)
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("<result {index}>"));
                    report.errors.push((key, e.to_string()));
                }
            }
        }
        report
    }
}

/// Verifies a bulk delete did exactly what was asked.
///
/// Fails with `Consistency` if the store reported errors, deleted a key that
/// was not requested, or left a requested key undeleted.
pub fn check_delete_batch(path: &str, requested: &[String], report: &DeleteReport) -> Result<()> {
    if !report.errors.is_empty() {
        for (key, message) in &report.errors {
            tracing::error!(key = %key, error = %message, "failed to delete object");
        }
        return Err(CleanerError::consistency(
            path,
            "errors were reported while deleting keys:",
            report.errors.iter().map(|(key, _)| key.clone()),
        ));
    }

    let requested_keys: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
    let deleted_keys: BTreeSet<&str> = report.deleted.iter().map(String::as_str).collect();

    let unexpected: Vec<String> = deleted_keys
        .difference(&requested_keys)
        .map(|key| key.to_string())
        .collect();
    if !unexpected.is_empty() {
        return Err(CleanerError::consistency(
            path,
            "keys were unexpectedly deleted:",
            unexpected,
        ));
    }

    let missing: Vec<String> = requested_keys
        .difference(&deleted_keys)
        .map(|key| key.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CleanerError::consistency(path, "keys were not deleted:", missing));
    }

    Ok(())
}

/// Storage adapter over an object store service.
pub struct ObjectStoreAdapter {
    kind: ObjectStoreKind,
    s3: S3Config,
    r2: R2Config,
    gcs: GcsConfig,
    retry_config: RetryConfig,
    multipart_threshold: u64,
    multipart_chunk_size: usize,
    /// Clients by bucket name.
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl std::fmt::Debug for ObjectStoreAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreAdapter")
            .field("kind", &self.kind)
            .field("multipart_threshold", &self.multipart_threshold)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreAdapter {
    /// Creates an adapter for the given service. No client is built until a
    /// bucket is first used.
    ///
    /// # Errors
    ///
    /// Returns an error for R2 when no account id is configured.
    pub fn new(kind: ObjectStoreKind, config: &CleanerConfig) -> Result<Self> {
        if kind == ObjectStoreKind::R2 && config.r2.endpoint().is_none() {
            return Err(CleanerError::config(
                "an R2 account id is required to access r2:// paths",
            ));
        }

        Ok(Self {
            kind,
            s3: config.s3.clone(),
            r2: config.r2.clone(),
            gcs: config.gcs.clone(),
            retry_config: RetryConfig::from_s3(&config.s3),
            multipart_threshold: config.s3.multipart_threshold,
            multipart_chunk_size: config.s3.multipart_chunk_size.max(1),
            stores: Mutex::new(HashMap::new()),
        })
    }

    /// Uses `store` for every path in `bucket` instead of building a client.
    pub fn register_bucket(&self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(bucket.into(), store);
    }

    #[must_use]
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    #[must_use]
    pub fn with_multipart(mut self, threshold: u64, chunk_size: usize) -> Self {
        self.multipart_threshold = threshold;
        self.multipart_chunk_size = chunk_size.max(1);
        self
    }

    /// Returns the client for `bucket`, building it on first use.
    fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self
            .stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(store) = stores.get(bucket) {
            return Ok(Arc::clone(store));
        }

        let store = self.build_store(bucket)?;
        tracing::debug!(bucket, kind = ?self.kind, "built object store client");
        stores.insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }

    fn build_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        match self.kind {
            ObjectStoreKind::S3 => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(&self.s3.region);

                if let Some(endpoint) = &self.s3.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(access_key) = &self.s3.access_key_id {
                    builder = builder.with_access_key_id(access_key);
                }
                if let Some(secret_key) = &self.s3.secret_access_key {
                    builder = builder.with_secret_access_key(secret_key);
                }
                if let Some(token) = &self.s3.session_token {
                    builder = builder.with_token(token);
                }
                if self.s3.force_path_style {
                    builder = builder.with_virtual_hosted_style_request(false);
                }
                if self.s3.allow_http {
                    builder = builder.with_allow_http(true);
                }

                let store = builder.build().map_err(|e| {
                    CleanerError::config_with_source("failed to build S3 client", e)
                })?;
                Ok(Arc::new(store))
            }
            ObjectStoreKind::R2 => {
                let endpoint = self.r2.endpoint().ok_or_else(|| {
                    CleanerError::config("an R2 account id is required to access r2:// paths")
                })?;
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region("auto")
                    .with_endpoint(endpoint);

                if let Some(access_key) = &self.r2.access_key_id {
                    builder = builder.with_access_key_id(access_key);
                }
                if let Some(secret_key) = &self.r2.secret_access_key {
                    builder = builder.with_secret_access_key(secret_key);
                }

                let store = builder.build().map_err(|e| {
                    CleanerError::config_with_source("failed to build R2 client", e)
                })?;
                Ok(Arc::new(store))
            }
            ObjectStoreKind::Gcs => {
                let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
                if let Some(path) = &self.gcs.service_account_path {
                    builder = builder.with_service_account_path(path.to_string_lossy());
                }

                let store = builder.build().map_err(|e| {
                    CleanerError::config_with_source("failed to build GCS client", e)
                })?;
                Ok(Arc::new(store))
            }
        }
    }

    fn resolve(&self, path: &str) -> Result<(Arc<dyn ObjectStore>, ObjectAddress)> {
        let address = ObjectAddress::parse(path)?;
        let store = self.store_for(&address.bucket)?;
        Ok((store, address))
    }

    /// Metadata of the object at exactly `location`, `None` if absent.
    async fn head(
        &self,
        store: &Arc<dyn ObjectStore>,
        location: &ObjectPath,
        path: &str,
    ) -> Result<Option<ObjectMeta>> {
        retry_async(&self.retry_config, || {
            let store = Arc::clone(store);
            let location = location.clone();
            async move {
                match store.head(&location).await {
                    Ok(meta) => RetryResult::Ok(Some(meta)),
                    Err(object_store::Error::NotFound { .. }) => RetryResult::Ok(None),
                    Err(e) => classify(Err(e)),
                }
            }
        })
        .await
        .map_err(|e| CleanerError::object_store(path, "failed to inspect object", e))
    }

    /// One delimiter listing of the immediate children of `prefix`.
    async fn list_delimited(
        &self,
        store: &Arc<dyn ObjectStore>,
        prefix: Option<&ObjectPath>,
        path: &str,
    ) -> Result<ListResult> {
        retry_async(&self.retry_config, || {
            let store = Arc::clone(store);
            let prefix = prefix.cloned();
            async move { classify(store.list_with_delimiter(prefix.as_ref()).await) }
        })
        .await
        .map_err(|e| CleanerError::object_store(path, "failed to list objects", e))
    }

    /// Every object below `prefix`, at any depth.
    async fn list_recursive(
        &self,
        store: &Arc<dyn ObjectStore>,
        prefix: Option<&ObjectPath>,
        path: &str,
    ) -> Result<Vec<ObjectMeta>> {
        retry_async(&self.retry_config, || {
            let store = Arc::clone(store);
            let prefix = prefix.cloned();
            async move { classify(store.list(prefix.as_ref()).try_collect::<Vec<_>>().await) }
        })
        .await
        .map_err(|e| CleanerError::object_store(path, "failed to list objects", e))
    }

    /// Streams one object into a local file.
    async fn download_object(
        &self,
        store: &Arc<dyn ObjectStore>,
        location: &ObjectPath,
        dest: &Path,
    ) -> Result<()> {
        let path = location.to_string();
        let result = retry_async(&self.retry_config, || {
            let store = Arc::clone(store);
            let location = location.clone();
            async move { classify(store.get(&location).await) }
        })
        .await
        .map_err(|e| CleanerError::object_store(&path, "failed to read object", e))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CleanerError::storage_with_source(parent, "failed to create parent directories", e)
            })?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| CleanerError::storage_with_source(dest, "failed to create file", e))?;

        let mut stream = result.into_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| CleanerError::object_store(&path, "failed to read object", e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| CleanerError::storage_with_source(dest, "failed to write file", e))?;
        }
        file.flush()
            .await
            .map_err(|e| CleanerError::storage_with_source(dest, "failed to flush file", e))?;

        tracing::debug!(key = %location, dest = %dest.display(), "downloaded object");
        Ok(())
    }

    /// Uploads one local file, switching to multipart above the threshold.
    async fn upload_file(
        &self,
        store: &Arc<dyn ObjectStore>,
        location: &ObjectPath,
        src: &Path,
    ) -> Result<()> {
        let path = location.to_string();
        let size = tokio::fs::metadata(src)
            .await
            .map_err(|e| CleanerError::storage_with_source(src, "failed to read metadata", e))?
            .len();

        if size >= self.multipart_threshold {
            return self.upload_multipart(store, location, src, size).await;
        }

        let data = Bytes::from(
            tokio::fs::read(src)
                .await
                .map_err(|e| CleanerError::storage_with_source(src, "failed to read file", e))?,
        );
        retry_async(&self.retry_config, || {
            let store = Arc::clone(store);
            let location = location.clone();
            let payload = PutPayload::from_bytes(data.clone());
            async move { classify(store.put(&location, payload).await) }
        })
        .await
        .map_err(|e| CleanerError::object_store(&path, "failed to put object", e))?;

        tracing::debug!(key = %location, size, "uploaded object");
        Ok(())
    }

    async fn upload_multipart(
        &self,
        store: &Arc<dyn ObjectStore>,
        location: &ObjectPath,
        src: &Path,
        size: u64,
    ) -> Result<()> {
        let path = location.to_string();
        let mut upload = retry_async(&self.retry_config, || {
            let store = Arc::clone(store);
            let location = location.clone();
            async move { classify(store.put_multipart(&location).await) }
        })
        .await
        .map_err(|e| CleanerError::object_store(&path, "failed to initiate multipart upload", e))?;

        let mut file = tokio::fs::File::open(src)
            .await
            .map_err(|e| CleanerError::storage_with_source(src, "failed to open file", e))?;

        let mut parts = 0usize;
        loop {
            let mut chunk = Vec::with_capacity(self.multipart_chunk_size);
            let read = (&mut file)
                .take(self.multipart_chunk_size as u64)
                .read_to_end(&mut chunk)
                .await
                .map_err(|e| CleanerError::storage_with_source(src, "failed to read file", e))?;
            if read == 0 {
                break;
            }

            if let Err(e) = upload.put_part(PutPayload::from(chunk)).await {
                if let Err(abort_err) = upload.abort().await {
                    tracing::warn!(key = %location, error = %abort_err, "failed to abort multipart upload");
                }
                return Err(CleanerError::object_store(&path, "failed to upload part", e));
            }
            parts += 1;
        }

        upload
            .complete()
            .await
            .map_err(|e| CleanerError::object_store(&path, "failed to complete multipart upload", e))?;

        tracing::debug!(key = %location, size, parts, "uploaded object in parts");
        Ok(())
    }

    /// Lists an archive object by staging it locally.
    async fn list_archive(
        &self,
        store: &Arc<dyn ObjectStore>,
        address: &ObjectAddress,
        path: &str,
        dirs_only: bool,
    ) -> Result<Vec<String>> {
        let location = address
            .location()
            .ok_or_else(|| CleanerError::user_input(format!("{path} does not name an archive")))?;

        let staging = StagingArea::new("archive")?;
        let local_archive = staging.join(base_name(path));
        self.download_object(store, &location, &local_archive).await?;

        let probe_path = local_archive.clone();
        let entries = run_blocking(&local_archive, move || {
            archive::list_top_level_entries(&probe_path, dirs_only)
        })
        .await?;
        drop(staging);
        Ok(entries)
    }

    /// Rejects listing a plain object as if it were a directory.
    async fn ensure_not_plain_object(
        &self,
        store: &Arc<dyn ObjectStore>,
        address: &ObjectAddress,
        path: &str,
    ) -> Result<()> {
        if let Some(location) = address.location() {
            if self.head(store, &location, path).await?.is_some() {
                return Err(CleanerError::storage(
                    PathBuf::from(path),
                    "path is a file, not a directory or archive",
                ));
            }
        }
        Ok(())
    }

    async fn delete_batch(
        &self,
        store: &Arc<dyn ObjectStore>,
        batch: &[ObjectPath],
    ) -> DeleteReport {
        let locations: BoxStream<'_, object_store::Result<ObjectPath>> =
            futures::stream::iter(batch.to_vec().into_iter().map(Ok)).boxed();
        let results: Vec<object_store::Result<ObjectPath>> =
            store.delete_stream(locations).collect().await;
        DeleteReport::from_results(batch, results)
    }
}

fn child_location(prefix: Option<&ObjectPath>, relative: &str) -> ObjectPath {
    match prefix {
        Some(prefix) => ObjectPath::from(format!("{prefix}/{relative}")),
        None => ObjectPath::from(relative),
    }
}

#[async_trait]
impl StorageAdapter for ObjectStoreAdapter {
    async fn list_entries(&self, path: &str, max_file_size: Option<u64>) -> Result<Vec<String>> {
        let (store, address) = self.resolve(path)?;

        if archive::has_supported_archive_extension(path) {
            if max_file_size.is_some() {
                return Err(CleanerError::unsupported(format!(
                    "size-filtered listing of archive {path}"
                )));
            }
            return self.list_archive(&store, &address, path, false).await;
        }

        self.ensure_not_plain_object(&store, &address, path).await?;

        let prefix = address.location();
        let listing = self.list_delimited(&store, prefix.as_ref(), path).await?;

        let mut names = BTreeSet::new();
        for common_prefix in &listing.common_prefixes {
            if let Some(name) = common_prefix.filename() {
                names.insert(name.to_string());
            }
        }
        for object in &listing.objects {
            let size = object.size as u64;
            if let Some(max_size) = max_file_size {
                if size > max_size {
                    tracing::info!(
                        key = %object.location,
                        size,
                        max_size,
                        "skipping object larger than the size limit"
                    );
                    continue;
                }
            }
            if let Some(name) = object.location.filename() {
                names.insert(name.to_string());
            }
        }

        Ok(names.into_iter().collect())
    }

    async fn list_dirs(&self, path: &str) -> Result<Vec<String>> {
        let (store, address) = self.resolve(path)?;

        if archive::has_supported_archive_extension(path) {
            return self.list_archive(&store, &address, path, true).await;
        }

        self.ensure_not_plain_object(&store, &address, path).await?;

        let prefix = address.location();
        let listing = self.list_delimited(&store, prefix.as_ref(), path).await?;
        let names: BTreeSet<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|common_prefix| common_prefix.filename().map(str::to_string))
            .collect();

        Ok(names.into_iter().collect())
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        let (store, address) = self.resolve(path)?;
        match address.location() {
            Some(location) => Ok(self.head(&store, &location, path).await?.is_some()),
            None => Ok(false),
        }
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        if self.is_file(path).await? {
            return Ok(false);
        }

        let (store, address) = self.resolve(path)?;
        let prefix = address.location();
        retry_async(&self.retry_config, || {
            let store = Arc::clone(&store);
            let prefix = prefix.clone();
            async move {
                match store.list(prefix.as_ref()).next().await {
                    None => RetryResult::Ok(false),
                    Some(Ok(_)) => RetryResult::Ok(true),
                    Some(Err(e)) => classify(Err(e)),
                }
            }
        })
        .await
        .map_err(|e| CleanerError::object_store(path, "failed to list objects", e))
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        self.ensure_delete_supported()?;
        let (store, address) = self.resolve(path)?;
        let prefix = address.location();

        let mut keys: Vec<ObjectPath> = self
            .list_recursive(&store, prefix.as_ref(), path)
            .await?
            .into_iter()
            .map(|meta| meta.location)
            .collect();
        if let Some(location) = &prefix {
            if self.head(&store, location, path).await?.is_some() {
                keys.push(location.clone());
            }
        }
        keys.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
        keys.dedup();

        tracing::info!(path, count = keys.len(), "deleting objects");

        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let report = self.delete_batch(&store, batch).await;
            let requested: Vec<String> = batch.iter().map(ToString::to_string).collect();
            check_delete_batch(path, &requested, &report)?;
        }

        Ok(())
    }

    async fn download_to_folder(&self, path: &str, local_dest: &Path) -> Result<()> {
        let (store, address) = self.resolve(path)?;
        let prefix = address.location();
        let objects = self.list_recursive(&store, prefix.as_ref(), path).await?;

        if objects.is_empty() {
            let single = match &prefix {
                Some(location) => self.head(&store, location, path).await?.map(|_| location),
                None => None,
            };
            let Some(location) = single else {
                return Err(CleanerError::not_found(path));
            };
            let file_name = location.filename().unwrap_or_else(|| base_name(path));
            return self
                .download_object(&store, location, &local_dest.join(file_name))
                .await;
        }

        let strip = prefix
            .as_ref()
            .map(|prefix| format!("{prefix}/"))
            .unwrap_or_default();
        tracing::debug!(path, count = objects.len(), dest = %local_dest.display(), "downloading objects");

        for object in &objects {
            let key = object.location.as_ref();
            let Some(relative) = key.strip_prefix(strip.as_str()) else {
                tracing::warn!(key, prefix = %strip, "skipping object outside the prefix");
                continue;
            };
            self.download_object(&store, &object.location, &local_dest.join(relative))
                .await?;
        }

        Ok(())
    }

    async fn upload(&self, path: &str, local_src: &Path) -> Result<()> {
        self.ensure_upload_supported()?;
        let (store, address) = self.resolve(path)?;
        let prefix = address.location();

        let metadata = match tokio::fs::metadata(local_src).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CleanerError::not_found(local_src.to_string_lossy()));
            }
            Err(e) => {
                return Err(CleanerError::storage_with_source(
                    local_src,
                    "failed to read metadata",
                    e,
                ));
            }
        };

        if metadata.is_file() {
            let location = prefix.ok_or_else(|| {
                CleanerError::user_input(format!("{path} does not name an object key"))
            })?;
            return self.upload_file(&store, &location, local_src).await;
        }

        if !metadata.is_dir() {
            return Err(CleanerError::not_found(local_src.to_string_lossy()));
        }

        let root = local_src.to_path_buf();
        let files = run_blocking(local_src, move || {
            let mut files = Vec::new();
            for entry in WalkDir::new(&root).min_depth(1) {
                let entry = entry.map_err(|e| {
                    CleanerError::storage_with_source(&root, "failed to walk directory", e.into())
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|_| CleanerError::storage(entry.path(), "entry escapes source"))?
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((entry.path().to_path_buf(), relative));
            }
            Ok(files)
        })
        .await?;

        tracing::debug!(path, count = files.len(), "uploading files");
        for (file, relative) in &files {
            let location = child_location(prefix.as_ref(), relative);
            self.upload_file(&store, &location, file).await?;
        }

        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        self.kind.storage_type()
    }

    fn supports_delete(&self) -> bool {
        self.kind != ObjectStoreKind::Gcs
    }

    fn supports_upload(&self) -> bool {
        self.kind != ObjectStoreKind::Gcs
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::archive::tests::write_run_archive;
    use object_store::memory::InMemory;
    use object_store::{
        GetOptions, GetResult, MultipartUpload, PutMultipartOpts, PutOptions, PutResult,
    };
    use std::fs;
    use tempfile::TempDir;

    pub(crate) async fn put(store: &InMemory, key: &str, data: &[u8]) {
        store
            .put(&ObjectPath::from(key), PutPayload::from(data.to_vec()))
            .await
            .unwrap();
    }

    pub(crate) async fn keys(store: &InMemory) -> Vec<String> {
        let mut keys: Vec<String> = store
            .list(None)
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        keys
    }

    /// S3 adapter serving `bucket` from memory.
    pub(crate) fn memory_adapter(bucket: &str) -> (ObjectStoreAdapter, Arc<InMemory>) {
        let store = Arc::new(InMemory::new());
        let adapter = ObjectStoreAdapter::new(ObjectStoreKind::S3, &CleanerConfig::default())
            .unwrap()
            .with_retry_config(RetryConfig::no_retry());
        adapter.register_bucket(bucket, store.clone());
        (adapter, store)
    }

    /// How a [`MisreportingStore`] bends the results of a bulk delete.
    #[derive(Debug, Clone, Copy)]
    enum Misreport {
        /// Reports a key that was never requested.
        Unrequested,
        /// Leaves the last requested key out of the results.
        Dropped,
        /// Turns the result for the last requested key into an error.
        Failed,
    }

    /// In-memory store whose bulk deletes report something other than what
    /// happened.
    #[derive(Debug)]
    struct MisreportingStore {
        inner: InMemory,
        misreport: Misreport,
    }

    impl std::fmt::Display for MisreportingStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "MisreportingStore({:?})", self.misreport)
        }
    }

    #[async_trait]
    impl ObjectStore for MisreportingStore {
        async fn put_opts(
            &self,
            location: &ObjectPath,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &ObjectPath,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &ObjectPath,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn delete_stream<'a>(
            &'a self,
            locations: BoxStream<'a, object_store::Result<ObjectPath>>,
        ) -> BoxStream<'a, object_store::Result<ObjectPath>> {
            let misreport = self.misreport;
            let results = self.inner.delete_stream(locations);
            futures::stream::once(async move {
                let mut results: Vec<_> = results.collect().await;
                match misreport {
                    Misreport::Unrequested => {
                        results.push(Ok(ObjectPath::from("runs/run10/config.yaml")));
                    }
                    Misreport::Dropped => {
                        results.pop();
                    }
                    Misreport::Failed => {
                        if let Some(last) = results.last_mut() {
                            *last = Err(object_store::Error::Generic {
                                store: "MisreportingStore",
                                source: "AccessDenied".into(),
                            });
                        }
                    }
                }
                futures::stream::iter(results)
            })
            .flatten()
            .boxed()
        }

        fn list(
            &self,
            prefix: Option<&ObjectPath>,
        ) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&ObjectPath>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(
            &self,
            from: &ObjectPath,
            to: &ObjectPath,
        ) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    fn misreporting_adapter(misreport: Misreport) -> (ObjectStoreAdapter, Arc<MisreportingStore>) {
        let store = Arc::new(MisreportingStore {
            inner: InMemory::new(),
            misreport,
        });
        let adapter = ObjectStoreAdapter::new(ObjectStoreKind::S3, &CleanerConfig::default())
            .unwrap()
            .with_retry_config(RetryConfig::no_retry());
        adapter.register_bucket("ai2-llm", store.clone());
        (adapter, store)
    }

    async fn seed_run(store: &InMemory) {
        put(store, "runs/run1/config.yaml", b"run_name: run1\n").await;
        put(store, "runs/run1/step0/model.pt", b"0").await;
        put(store, "runs/run1/step1000/model.pt", b"1000").await;
        put(store, "runs/run1/step1000/optim.pt", b"optim").await;
        put(store, "runs/run1/big.bin", &[0u8; 64]).await;
        put(store, "runs/run10/config.yaml", b"run_name: run10\n").await;
    }

    #[tokio::test]
    async fn test_list_entries() {
        let (adapter, store) = memory_adapter("ai2-llm");
        seed_run(&store).await;

        let entries = adapter.list_entries("s3://ai2-llm/runs/run1/", None).await.unwrap();
        assert_eq!(entries, vec!["big.bin", "config.yaml", "step0", "step1000"]);

        let runs = adapter.list_entries("s3://ai2-llm/runs/", None).await.unwrap();
        assert_eq!(runs, vec!["run1", "run10"]);
    }

    #[tokio::test]
    async fn test_list_entries_size_filter_keeps_prefixes() {
        let (adapter, store) = memory_adapter("ai2-llm");
        seed_run(&store).await;

        let entries = adapter
            .list_entries("s3://ai2-llm/runs/run1/", Some(32))
            .await
            .unwrap();
        assert_eq!(entries, vec!["config.yaml", "step0", "step1000"]);
    }

    #[tokio::test]
    async fn test_list_dirs_subset_of_entries() {
        let (adapter, store) = memory_adapter("ai2-llm");
        seed_run(&store).await;

        let entries = adapter.list_entries("s3://ai2-llm/runs/run1/", None).await.unwrap();
        let dirs = adapter.list_dirs("s3://ai2-llm/runs/run1/").await.unwrap();
        assert_eq!(dirs, vec!["step0", "step1000"]);
        assert!(dirs.iter().all(|dir| entries.contains(dir)));
    }

    #[tokio::test]
    async fn test_list_plain_object_fails() {
        let (adapter, store) = memory_adapter("ai2-llm");
        seed_run(&store).await;

        let err = adapter
            .list_entries("s3://ai2-llm/runs/run1/config.yaml", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a directory or archive"));
    }

    #[tokio::test]
    async fn test_list_archive_object() {
        let (adapter, store) = memory_adapter("ai2-llm");
        let temp = TempDir::new().unwrap();
        let archive = write_run_archive(temp.path(), "run2.tar.gz", "run2", &["step0", "step40"]);
        put(&store, "runs/run2.tar.gz", &fs::read(&archive).unwrap()).await;

        let entries = adapter
            .list_entries("s3://ai2-llm/runs/run2.tar.gz", None)
            .await
            .unwrap();
        assert_eq!(entries, vec!["config.yaml", "step0", "step40"]);

        let dirs = adapter.list_dirs("s3://ai2-llm/runs/run2.tar.gz").await.unwrap();
        assert_eq!(dirs, vec!["step0", "step40"]);

        let err = adapter
            .list_entries("s3://ai2-llm/runs/run2.tar.gz", Some(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CleanerError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_is_file_and_is_dir() {
        let (adapter, store) = memory_adapter("ai2-llm");
        seed_run(&store).await;

        assert!(adapter.is_file("s3://ai2-llm/runs/run1/config.yaml").await.unwrap());
        assert!(!adapter.is_dir("s3://ai2-llm/runs/run1/config.yaml").await.unwrap());
        assert!(adapter.is_dir("s3://ai2-llm/runs/run1/step0").await.unwrap());
        assert!(adapter.is_dir("s3://ai2-llm/runs/run1/step0/").await.unwrap());
        assert!(!adapter.is_file("s3://ai2-llm/runs/run1/step0").await.unwrap());
        assert!(!adapter.is_dir("s3://ai2-llm/runs/run1/step5").await.unwrap());
        assert!(!adapter.is_file("s3://ai2-llm/").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_path_stays_within_prefix() {
        let (adapter, store) = memory_adapter("ai2-llm");
        seed_run(&store).await;

        adapter.delete_path("s3://ai2-llm/runs/run1/").await.unwrap();
        assert_eq!(keys(&store).await, vec!["runs/run10/config.yaml"]);
    }

    #[tokio::test]
    async fn test_delete_path_in_batches() {
        let (adapter, store) = memory_adapter("ai2-llm");
        for i in 0..(DELETE_BATCH_SIZE + 5) {
            put(&store, &format!("runs/run3/step{i}/model.pt"), b"x").await;
        }

        adapter.delete_path("s3://ai2-llm/runs/run3").await.unwrap();
        assert!(keys(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_single_object() {
        let (adapter, store) = memory_adapter("ai2-llm");
        put(&store, "runs/run4.tar.gz", b"archive").await;

        adapter.delete_path("s3://ai2-llm/runs/run4.tar.gz").await.unwrap();
        assert!(keys(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_gcs_does_not_support_delete_or_upload() {
        let adapter =
            ObjectStoreAdapter::new(ObjectStoreKind::Gcs, &CleanerConfig::default()).unwrap();
        adapter.register_bucket("ai2-olmo", Arc::new(InMemory::new()));

        let err = adapter.delete_path("gs://ai2-olmo/runs/run1/").await.unwrap_err();
        assert!(matches!(err, CleanerError::Unsupported { .. }));

        let temp = TempDir::new().unwrap();
        let err = adapter
            .upload("gs://ai2-olmo/runs/run1/", temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CleanerError::Unsupported { .. }));
    }

    #[test]
    fn test_r2_requires_account_id() {
        let err = ObjectStoreAdapter::new(ObjectStoreKind::R2, &CleanerConfig::default())
            .unwrap_err();
        assert!(matches!(err, CleanerError::Config { .. }));

        let mut config = CleanerConfig::default();
        config.r2.account_id = Some("abc123".to_string());
        let adapter = ObjectStoreAdapter::new(ObjectStoreKind::R2, &config).unwrap();
        assert_eq!(adapter.storage_type(), StorageType::R2);
    }

    #[tokio::test]
    async fn test_delete_path_rejects_misreported_batches() {
        let cases = [
            (Misreport::Unrequested, "unexpectedly deleted", "runs/run10/config.yaml"),
            (Misreport::Dropped, "not deleted", "runs/run1/step1000/optim.pt"),
            (Misreport::Failed, "errors were reported", "runs/run1/step1000/optim.pt"),
        ];

        for (misreport, expected_message, expected_key) in cases {
            let (adapter, store) = misreporting_adapter(misreport);
            seed_run(&store.inner).await;

            match adapter.delete_path("s3://ai2-llm/runs/run1/").await.unwrap_err() {
                CleanerError::Consistency { keys, message, .. } => {
                    assert!(message.contains(expected_message), "{misreport:?}: {message}");
                    assert_eq!(keys, vec![expected_key], "{misreport:?}");
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_delete_path_stops_after_bad_batch() {
        let (adapter, store) = misreporting_adapter(Misreport::Failed);
        for i in 0..(DELETE_BATCH_SIZE + 5) {
            put(&store.inner, &format!("runs/run3/step{i}/model.pt"), b"x").await;
        }

        let err = adapter.delete_path("s3://ai2-llm/runs/run3").await.unwrap_err();
        assert!(matches!(err, CleanerError::Consistency { .. }));
        assert_eq!(keys(&store.inner).await.len(), 5);
    }

    #[test]
    fn test_check_delete_batch_ok() {
        let requested = vec!["a".to_string(), "b".to_string()];
        let report = DeleteReport {
            deleted: vec!["b".to_string(), "a".to_string()],
            errors: Vec::new(),
        };
        assert!(check_delete_batch("s3://bucket/run", &requested, &report).is_ok());
    }

    #[test]
    fn test_check_delete_batch_unrequested_key() {
        let requested = vec!["a".to_string()];
        let report = DeleteReport {
            deleted: vec!["a".to_string(), "z".to_string()],
            errors: Vec::new(),
        };
        match check_delete_batch("s3://bucket/run", &requested, &report).unwrap_err() {
            CleanerError::Consistency { keys, message, .. } => {
                assert_eq!(keys, vec!["z"]);
                assert!(message.contains("unexpectedly deleted"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_check_delete_batch_missing_key() {
        let requested = vec!["a".to_string(), "b".to_string()];
        let report = DeleteReport {
            deleted: vec!["a".to_string()],
            errors: Vec::new(),
        };
        match check_delete_batch("s3://bucket/run", &requested, &report).unwrap_err() {
            CleanerError::Consistency { keys, .. } => assert_eq!(keys, vec!["b"]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_check_delete_batch_reported_errors() {
        let requested = vec!["a".to_string(), "b".to_string()];
        let report = DeleteReport {
            deleted: vec!["a".to_string()],
            errors: vec![("b".to_string(), "AccessDenied".to_string())],
        };
        match check_delete_batch("s3://bucket/run", &requested, &report).unwrap_err() {
            CleanerError::Consistency { keys, .. } => assert_eq!(keys, vec!["b"]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_download_strips_exact_prefix() {
        let (adapter, store) = memory_adapter("ai2-llm");
        put(&store, "ckpt/step10/ckpt/model.pt", b"weights").await;
        put(&store, "ckpt/step10/rank0.pt", b"rank0").await;

        let dest = TempDir::new().unwrap();
        adapter
            .download_to_folder("s3://ai2-llm/ckpt/step10/", dest.path())
            .await
            .unwrap();

        assert_eq!(fs::read(dest.path().join("ckpt").join("model.pt")).unwrap(), b"weights");
        assert_eq!(fs::read(dest.path().join("rank0.pt")).unwrap(), b"rank0");
    }

    #[tokio::test]
    async fn test_download_single_object() {
        let (adapter, store) = memory_adapter("ai2-llm");
        put(&store, "runs/run1/config.yaml", b"run_name: run1\n").await;

        let dest = TempDir::new().unwrap();
        adapter
            .download_to_folder("s3://ai2-llm/runs/run1/config.yaml", dest.path())
            .await
            .unwrap();
        assert!(dest.path().join("config.yaml").is_file());
    }

    #[tokio::test]
    async fn test_download_nothing_found() {
        let (adapter, _store) = memory_adapter("ai2-llm");
        let dest = TempDir::new().unwrap();
        let err = adapter
            .download_to_folder("s3://ai2-llm/runs/missing/", dest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CleanerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_upload_directory() {
        let (adapter, store) = memory_adapter("ai2-llm");
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("nested")).unwrap();
        fs::write(src.path().join("model.pt"), b"weights").unwrap();
        fs::write(src.path().join("nested").join("optim.pt"), b"optim").unwrap();

        adapter
            .upload("s3://ai2-llm/runs/run1/step5-unsharded/", src.path())
            .await
            .unwrap();

        assert_eq!(
            keys(&store).await,
            vec![
                "runs/run1/step5-unsharded/model.pt",
                "runs/run1/step5-unsharded/nested/optim.pt",
            ]
        );
    }

    #[tokio::test]
    async fn test_upload_missing_source() {
        let (adapter, _store) = memory_adapter("ai2-llm");
        let src = TempDir::new().unwrap();
        let err = adapter
            .upload("s3://ai2-llm/runs/run1/step5-unsharded/", &src.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, CleanerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_upload_multipart() {
        let (adapter, store) = memory_adapter("ai2-llm");
        let adapter = adapter.with_multipart(4, 4);
        let src = TempDir::new().unwrap();
        let file = src.path().join("model.pt");
        fs::write(&file, b"0123456789").unwrap();

        adapter
            .upload("s3://ai2-llm/runs/run1/model.pt", &file)
            .await
            .unwrap();

        let data = store
            .get(&ObjectPath::from("runs/run1/model.pt"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"0123456789");
    }
}
