// rust/cleaner-core/src/storage/address.rs

//! Path addressing: which backend owns a path, and where inside it.

use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::{CleanerError, Result};

static URL_SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-z0-9]+)://").expect("valid scheme regex"));

/// Storage backend owning a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    LocalFs,
    Gcs,
    S3,
    R2,
}

impl StorageType {
    /// Classifies a path by its URL scheme.
    ///
    /// Paths without a scheme and `file://` URLs are local. Unknown schemes
    /// are rejected rather than treated as local paths.
    pub fn for_path(path: &str) -> Result<Self> {
        let Some(captures) = URL_SCHEME.captures(path) else {
            return Ok(Self::LocalFs);
        };

        match &captures[1] {
            "gs" => Ok(Self::Gcs),
            "s3" => Ok(Self::S3),
            "r2" => Ok(Self::R2),
            "file" => Ok(Self::LocalFs),
            scheme => Err(CleanerError::user_input(format!(
                "Unsupported storage scheme '{scheme}://' in path {path}"
            ))),
        }
    }

    pub fn is_object_store(self) -> bool {
        !matches!(self, Self::LocalFs)
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Self::LocalFs => "file",
            Self::Gcs => "gs",
            Self::S3 => "s3",
            Self::R2 => "r2",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Bucket and key of an object-store URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAddress {
    pub bucket: String,
    pub key: String,
}

impl ObjectAddress {
    /// Splits `scheme://bucket/some/key` into `bucket` and `some/key`.
    pub fn parse(path: &str) -> Result<Self> {
        let url = Url::parse(path).map_err(|e| {
            CleanerError::user_input(format!("Invalid object store URL {path}: {e}"))
        })?;

        let bucket = url.host_str().unwrap_or_default().to_string();
        if bucket.is_empty() {
            return Err(CleanerError::user_input(format!(
                "Object store URL {path} does not name a bucket"
            )));
        }

        Ok(Self {
            bucket,
            key: url.path().trim_start_matches('/').to_string(),
        })
    }

    /// The key as an `object_store` location, `None` for the bucket root.
    pub fn location(&self) -> Option<object_store::path::Path> {
        let trimmed = self.key.trim_end_matches('/');
        if trimmed.is_empty() {
            None
        } else {
            Some(object_store::path::Path::from(trimmed))
        }
    }
}

/// Local filesystem path for a bare path or a `file://` URL.
pub fn local_path(path: &str) -> PathBuf {
    PathBuf::from(path.strip_prefix("file://").unwrap_or(path))
}

/// Joins `name` onto `base` with exactly one separator.
pub fn join_path(base: &str, name: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

/// Last path segment, ignoring a trailing separator.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_for_path() {
        assert_eq!(StorageType::for_path("/data/runs/").unwrap(), StorageType::LocalFs);
        assert_eq!(StorageType::for_path("runs/").unwrap(), StorageType::LocalFs);
        assert_eq!(StorageType::for_path("file:///data/runs/").unwrap(), StorageType::LocalFs);
        assert_eq!(StorageType::for_path("gs://ai2-olmo/runs/").unwrap(), StorageType::Gcs);
        assert_eq!(StorageType::for_path("s3://ai2-llm/checkpoints/").unwrap(), StorageType::S3);
        assert_eq!(StorageType::for_path("r2://olmo-checkpoints/").unwrap(), StorageType::R2);
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let err = StorageType::for_path("az://container/runs/").unwrap_err();
        assert!(matches!(err, CleanerError::UserInput { .. }));
        assert!(err.to_string().contains("az://"));
    }

    #[test]
    fn test_object_address_parse() {
        let address = ObjectAddress::parse("s3://ai2-llm/checkpoints/1b/").unwrap();
        assert_eq!(address.bucket, "ai2-llm");
        assert_eq!(address.key, "checkpoints/1b/");
        assert_eq!(address.location().unwrap().as_ref(), "checkpoints/1b");

        let root = ObjectAddress::parse("gs://ai2-olmo/").unwrap();
        assert_eq!(root.key, "");
        assert!(root.location().is_none());
    }

    #[test]
    fn test_object_address_requires_bucket() {
        assert!(ObjectAddress::parse("s3:///key").is_err());
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("file:///tmp/runs"), PathBuf::from("/tmp/runs"));
        assert_eq!(local_path("/tmp/runs"), PathBuf::from("/tmp/runs"));
    }

    #[test]
    fn test_join_and_base_name() {
        assert_eq!(join_path("s3://b/runs/", "run1"), "s3://b/runs/run1");
        assert_eq!(join_path("/runs", "run1"), "/runs/run1");
        assert_eq!(base_name("s3://b/runs/run1/step10/"), "step10");
        assert_eq!(base_name("step10"), "step10");
    }
}
