//! Error types for the deployment worker

use thiserror::Error;

/// Main error type for the deployment worker
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("Publish error on {key}: {message}")]
    PublishError { key: String, message: String },

    #[error("Scan error at {path}: {message}")]
    ScanError { path: String, message: String },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error(transparent)]
    UploadError(#[from] UploadError),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure to upload one artifact
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Network or storage hiccup; the same upload may succeed later
    #[error("transient upload failure for {key}: {message}")]
    Transient { key: String, message: String },

    /// Auth, missing bucket, bad key or unreadable file
    #[error("permanent upload failure for {key}: {message}")]
    Permanent { key: String, message: String },
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Transient { .. })
    }

    pub fn key(&self) -> &str {
        match self {
            UploadError::Transient { key, .. } | UploadError::Permanent { key, .. } => key,
        }
    }

    /// Classify an object store failure
    pub fn from_store(key: &str, err: object_store::Error) -> Self {
        use object_store::Error as E;

        let message = err.to_string();
        let key = key.to_string();
        match err {
            E::NotFound { .. }
            | E::PermissionDenied { .. }
            | E::Unauthenticated { .. }
            | E::InvalidPath { .. }
            | E::NotSupported { .. }
            | E::NotImplemented
            | E::UnknownConfigurationKey { .. }
            | E::AlreadyExists { .. }
            | E::Precondition { .. } => UploadError::Permanent { key, message },
            _ => UploadError::Transient { key, message },
        }
    }
}
