// rust/cleaner-core/src/config.rs

//! Cleaner configuration.
//!
//! Settings come from an optional TOML file, then `CLEANER_*` environment
//! variables, then command-line flags. Every section has usable defaults, so
//! an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CleanerError, Result};

/// Archives larger than this are ignored by cleaning and unsharding passes.
pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 5_000_000_000;

/// Tracking entity used for runs whose config does not name one.
pub const DEFAULT_TRACKING_ENTITY: &str = "ai2-llm";

// Top-level cleaner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Maximum size (bytes) of archive run files considered by a pass.
    pub max_archive_size: u64,
    pub s3: S3Config,
    pub r2: R2Config,
    pub gcs: GcsConfig,
    pub unshard: UnshardConfig,
    pub tracking: TrackingConfig,
}

/// Smallest multipart part S3 accepts.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
/// Largest multipart part S3 accepts.
const MAX_PART_SIZE: usize = 5 * 1024 * 1024 * 1024;

/// Settings for `s3://` buckets. Transfer and retry settings also apply to
/// `r2://` and `gs://`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub region: String,
    /// Overrides the AWS endpoint, e.g. for a local MinIO.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Static credentials. The AWS environment is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Checkpoint files at least this large (bytes) go up in parts.
    pub multipart_threshold: u64,
    /// Part size (bytes) for multipart uploads.
    pub multipart_chunk_size: usize,
    /// Retries of a transport call after its first attempt.
    pub max_retries: u32,
    /// First backoff delay (ms); doubles on every retry.
    pub retry_delay_ms: u64,
    /// Backoff ceiling (ms).
    pub max_retry_delay_ms: u64,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`.
    pub force_path_style: bool,
    /// Permit plain HTTP endpoints.
    pub allow_http: bool,
}

/// Cloudflare R2 configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct R2Config {
    /// Account id, used to derive the R2 endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

/// Google Cloud Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    /// Service account key file; application default credentials otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_path: Option<PathBuf>,
}

// External unsharding tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnshardConfig {
    // Program followed by its leading arguments. The sharded and unsharded
    // directories are appended on each invocation.
    pub command: Vec<String>,
}

// Experiment tracking service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_project: Option<String>,
    pub api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl R2Config {
    /// Endpoint of the account's R2 object store.
    pub fn endpoint(&self) -> Option<String> {
        self.account_id
            .as_ref()
            .map(|id| format!("https://{id}.r2.cloudflarestorage.com"))
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,
            s3: S3Config::default(),
            r2: R2Config::default(),
            gcs: GcsConfig::default(),
            unshard: UnshardConfig::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            multipart_threshold: 64 * 1024 * 1024,
            multipart_chunk_size: 16 * 1024 * 1024,
            max_retries: 10,
            retry_delay_ms: 100,
            max_retry_delay_ms: 20_000,
            force_path_style: false,
            allow_http: false,
        }
    }
}

impl Default for UnshardConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".to_string(), "scripts/unshard.py".to_string()],
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            default_entity: Some(DEFAULT_TRACKING_ENTITY.to_string()),
            default_project: None,
            api_url: "https://api.wandb.ai".to_string(),
            api_key: None,
        }
    }
}

impl S3Config {
    /// Checks the transport settings against S3 limits.
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(CleanerError::config("s3.region must not be empty"));
        }
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&self.multipart_chunk_size) {
            return Err(CleanerError::config(format!(
                "s3.multipart_chunk_size must be between {MIN_PART_SIZE} and {MAX_PART_SIZE} bytes"
            )));
        }
        if self.multipart_threshold < self.multipart_chunk_size as u64 {
            return Err(CleanerError::config(
                "s3.multipart_threshold must not be smaller than s3.multipart_chunk_size",
            ));
        }
        Ok(())
    }
}

impl FromStr for CleanerConfig {
    type Err = CleanerError;

    /// Parses TOML. Missing sections and keys take their defaults.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| CleanerError::config_with_source("failed to parse TOML config", e))
    }
}

impl CleanerConfig {
    // Reads and validates a TOML file.
    //
    // # Errors
    //
    // Fails when the file is unreadable, malformed or invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CleanerError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Overlays values from the environment.
    //
    // Variables are prefixed with `CLEANER_` and use underscores to separate
    // nested fields, e.g. `CLEANER_S3_ENDPOINT` overrides `s3.endpoint`.
    // `WANDB_API_KEY` and `OLMO_NO_SSL` are honoured as well.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("CLEANER_MAX_ARCHIVE_SIZE") {
            if let Ok(v) = val.parse() {
                self.max_archive_size = v;
            }
        }

        // S3 overrides
        if let Ok(val) = std::env::var("CLEANER_S3_REGION") {
            self.s3.region = val;
        }
        if let Ok(val) = std::env::var("CLEANER_S3_ENDPOINT") {
            self.s3.endpoint = Some(val);
        }
        if let Ok(val) = std::env::var("CLEANER_S3_MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                self.s3.max_retries = v;
            }
        }
        if let Ok(val) = std::env::var("CLEANER_S3_MULTIPART_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.s3.multipart_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("CLEANER_S3_FORCE_PATH_STYLE") {
            if let Ok(v) = val.parse() {
                self.s3.force_path_style = v;
            }
        }
        if let Ok(val) = std::env::var("OLMO_NO_SSL") {
            if let Ok(v) = val.parse::<u8>() {
                self.s3.allow_http = v != 0;
            }
        }

        // R2 and GCS overrides
        if let Ok(val) = std::env::var("CLEANER_R2_ACCOUNT_ID") {
            self.r2.account_id = Some(val);
        }
        if let Ok(val) = std::env::var("CLEANER_GCS_SERVICE_ACCOUNT_PATH") {
            self.gcs.service_account_path = Some(PathBuf::from(val));
        }

        // Unshard overrides
        if let Ok(val) = std::env::var("CLEANER_UNSHARD_COMMAND") {
            let command: Vec<String> = val.split_whitespace().map(str::to_string).collect();
            if !command.is_empty() {
                self.unshard.command = command;
            }
        }

        // Tracking overrides
        if let Ok(val) = std::env::var("CLEANER_TRACKING_ENTITY") {
            self.tracking.default_entity = Some(val);
        }
        if let Ok(val) = std::env::var("CLEANER_TRACKING_PROJECT") {
            self.tracking.default_project = Some(val);
        }
        if let Ok(val) = std::env::var("WANDB_API_KEY") {
            self.tracking.api_key = Some(val);
        }

        self
    }

    // Checks every section.
    //
    // # Errors
    //
    // Returns a `Config` error naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.max_archive_size == 0 {
            return Err(CleanerError::config(
                "max_archive_size must be greater than 0",
            ));
        }

        self.s3.validate()?;

        if let Some(account_id) = &self.r2.account_id {
            if account_id.is_empty() {
                return Err(CleanerError::config("r2.account_id must not be empty"));
            }
        }

        if self.unshard.command.is_empty() || self.unshard.command[0].is_empty() {
            return Err(CleanerError::config("unshard.command must name a program"));
        }

        url::Url::parse(&self.tracking.api_url).map_err(|e| {
            CleanerError::config_with_source("tracking.api_url is not a valid URL", e)
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CleanerConfig::default();

        assert_eq!(config.max_archive_size, 5_000_000_000);
        assert_eq!(config.s3.region, "us-east-1");
        assert!(config.s3.endpoint.is_none());
        assert_eq!(config.s3.max_retries, 10);
        assert!(!config.s3.allow_http);
        assert!(config.r2.account_id.is_none());
        assert!(config.r2.endpoint().is_none());
        assert!(config.gcs.service_account_path.is_none());
        assert_eq!(config.unshard.command, vec!["python", "scripts/unshard.py"]);
        assert_eq!(config.tracking.default_entity.as_deref(), Some("ai2-llm"));
        assert!(config.tracking.default_project.is_none());
    }

    #[test]
    fn test_default_validates() {
        let config = CleanerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: CleanerConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            max_archive_size = 1000

            [s3]
            region = "us-west-2"
            endpoint = "http://localhost:9000"
            max_retries = 3
            force_path_style = true
            allow_http = true

            [r2]
            account_id = "abc123"

            [gcs]
            service_account_path = "/secrets/gcs.json"

            [unshard]
            command = ["/usr/bin/unshard", "--safe"]

            [tracking]
            default_entity = "team"
            default_project = "olmo"
        "#;

        let config: CleanerConfig = toml.parse().unwrap();

        assert_eq!(config.max_archive_size, 1000);
        assert_eq!(config.s3.region, "us-west-2");
        assert_eq!(config.s3.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.s3.max_retries, 3);
        assert!(config.s3.force_path_style);
        assert!(config.s3.allow_http);
        assert_eq!(
            config.r2.endpoint().as_deref(),
            Some("https://abc123.r2.cloudflarestorage.com")
        );
        assert_eq!(
            config.gcs.service_account_path,
            Some(PathBuf::from("/secrets/gcs.json"))
        );
        assert_eq!(config.unshard.command, vec!["/usr/bin/unshard", "--safe"]);
        assert_eq!(config.tracking.default_entity.as_deref(), Some("team"));
        assert_eq!(config.tracking.default_project.as_deref(), Some("olmo"));
        // Untouched fields keep their defaults
        assert_eq!(config.tracking.api_url, "https://api.wandb.ai");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<CleanerConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [r2]
            account_id = "from-file"
            "#
        )
        .unwrap();

        let config = CleanerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.r2.account_id.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = CleanerConfig::from_file("/nonexistent/cleaner.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_invalid_max_archive_size() {
        let mut config = CleanerConfig::default();
        config.max_archive_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_unshard_command() {
        let mut config = CleanerConfig::default();
        config.unshard.command.clear();
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("unshard.command"));
    }

    #[test]
    fn test_validate_invalid_api_url() {
        let mut config = CleanerConfig::default();
        config.tracking.api_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_s3_config_validate_chunk_size_too_small() {
        let mut config = S3Config::default();
        config.multipart_chunk_size = 1024;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("multipart_chunk_size"));
    }

    #[test]
    fn test_s3_config_validate_empty_region() {
        let mut config = S3Config::default();
        config.region = String::new();
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("region"));
    }

    // Helper to clear the variables read by `with_env_overrides`
    fn clear_cleaner_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("CLEANER_") {
                std::env::remove_var(&key);
            }
        }
        std::env::remove_var("OLMO_NO_SSL");
        std::env::remove_var("WANDB_API_KEY");
    }

    // All environment cases live in one test: variables are process-wide and
    // parallel tests would see each other's values.
    #[test]
    fn test_env_overrides() {
        clear_cleaner_env_vars();

        std::env::set_var("CLEANER_MAX_ARCHIVE_SIZE", "42");
        std::env::set_var("CLEANER_S3_ENDPOINT", "http://minio:9000");
        std::env::set_var("CLEANER_R2_ACCOUNT_ID", "acct");
        std::env::set_var("CLEANER_UNSHARD_COMMAND", "unshard --fast");
        std::env::set_var("CLEANER_TRACKING_PROJECT", "olmo-small");
        std::env::set_var("OLMO_NO_SSL", "1");
        std::env::set_var("WANDB_API_KEY", "secret");

        let config = CleanerConfig::default().with_env_overrides();

        assert_eq!(config.max_archive_size, 42);
        assert_eq!(config.s3.endpoint.as_deref(), Some("http://minio:9000"));
        assert!(config.s3.allow_http);
        assert_eq!(config.r2.account_id.as_deref(), Some("acct"));
        assert_eq!(config.unshard.command, vec!["unshard", "--fast"]);
        assert_eq!(config.tracking.default_project.as_deref(), Some("olmo-small"));
        assert_eq!(config.tracking.api_key.as_deref(), Some("secret"));

        clear_cleaner_env_vars();

        // Invalid values are ignored
        std::env::set_var("CLEANER_MAX_ARCHIVE_SIZE", "lots");
        let config = CleanerConfig::default().with_env_overrides();
        assert_eq!(config.max_archive_size, DEFAULT_MAX_ARCHIVE_SIZE);

        clear_cleaner_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = CleanerConfig::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: CleanerConfig = toml_str.parse().unwrap();

        assert_eq!(original.max_archive_size, parsed.max_archive_size);
        assert_eq!(original.s3.region, parsed.s3.region);
        assert_eq!(original.unshard.command, parsed.unshard.command);
    }
}
