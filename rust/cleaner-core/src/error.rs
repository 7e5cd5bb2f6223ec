// rust/cleaner-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CleanerError {

    #[error("{message}")]
    UserInput {
        message: String,
    },

    #[error("No entry exists at '{path}'")]
    NotFound {
        path: String,
    },

    #[error("Consistency violation at '{path}': {message} {keys:?}")]
    Consistency {
        path: String,
        message: String,
        keys: Vec<String>,
    },

    #[error("Unsupported operation: {operation}")]
    Unsupported {
        operation: String,
    },

    #[error("External tool '{command}' failed with {status}")]
    ExternalTool {
        command: String,
        status: String,
    },

    #[error("Tracking lookup failed: {message}")]
    TrackingLookup {
        message: String,
    },

    #[error("'{name}' is not a checkpoint directory")]
    NotACheckpoint {
        name: String,
    },

    #[error("Unsharding failed for {} checkpoint(s): {failed:?}", failed.len())]
    UnshardFailed {
        failed: Vec<String>,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Object store error at '{path}': {message}")]
    ObjectStore {
        path: String,
        message: String,
        #[source]
        source: object_store::Error,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, CleanerError>;

// Convenience constructors
impl CleanerError {

    pub fn user_input(message: impl Into<String>) -> Self {
        Self::UserInput {
            message: message.into(),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn consistency(
        path: impl Into<String>,
        message: impl Into<String>,
        keys: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        Self::Consistency {
            path: path.into(),
            message: message.into(),
            keys,
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn external_tool(command: impl Into<String>, status: impl Into<String>) -> Self {
        Self::ExternalTool {
            command: command.into(),
            status: status.into(),
        }
    }

    pub fn tracking_lookup(message: impl Into<String>) -> Self {
        Self::TrackingLookup {
            message: message.into(),
        }
    }

    pub fn not_a_checkpoint(name: impl Into<String>) -> Self {
        Self::NotACheckpoint { name: name.into() }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn object_store(
        path: impl Into<String>,
        message: impl Into<String>,
        source: object_store::Error,
    ) -> Self {
        Self::ObjectStore {
            path: path.into(),
            message: message.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true for errors that abort only the current checkpoint
    /// rather than the whole pass.
    pub fn is_per_checkpoint(&self) -> bool {
        matches!(self, Self::ExternalTool { .. })
    }
}
