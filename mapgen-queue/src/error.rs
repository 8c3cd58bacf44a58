//! Application-wide error types.

use std::path::Path;

use thiserror::Error;

use crate::session::SessionId;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service was already started")]
    AlreadyStarted,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Reasons a submission is refused before it reaches the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("session {0} is already in progress")]
    AlreadyInProgress(SessionId),

    #[error("too many active sessions ({active}/{limit})")]
    CapacityExceeded { active: usize, limit: usize },

    #[error(
        "the server is currently experiencing high demand ({depth} queued), please try again later"
    )]
    QueueFull { depth: usize },

    #[error("the service is shutting down")]
    ShuttingDown,
}

/// Failures raised while executing a generation job.
///
/// These never escape the worker: they are converted into a failed
/// [`StorageEntry`](crate::storage::StorageEntry).
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("DTM provider with code {0} not found.")]
    UnknownProvider(String),

    #[error("Specified DTM Provider requires additional settings, but none were provided.")]
    MissingProviderSettings,

    #[error("Invalid DTM provider settings: {0}")]
    InvalidProviderSettings(String),

    #[error("Invalid custom {kind}: {source}")]
    InvalidCustomAsset {
        kind: &'static str,
        #[source]
        source: ValidationError,
    },

    #[error("Invalid custom {kind} schema: {reason}")]
    InvalidSchema { kind: &'static str, reason: String },

    #[error("Map size exceeds the maximum allowed size for public access {limit}.")]
    SizeLimitExceeded { size: u32, limit: u32 },

    #[error("Output size exceeds the maximum allowed size for public access {limit}.")]
    OutputSizeLimitExceeded { size: u32, limit: u32 },

    #[error("No outputs generated. Check the provided settings and components.")]
    NoOutputs,

    #[error("{0}")]
    Generator(String),

    #[error("failed to build archive {path}: {reason}")]
    Archive { path: String, reason: String },

    #[error("generation task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl GenerationError {
    pub fn generator(msg: impl Into<String>) -> Self {
        Self::Generator(msg.into())
    }

    pub fn custom_asset(kind: &'static str, source: ValidationError) -> Self {
        Self::InvalidCustomAsset { kind, source }
    }
}

/// Path and value checks applied to user-supplied references.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Filename cannot be empty")]
    EmptyFilename,

    #[error("Filename is too long (max {max} characters)")]
    FilenameTooLong { max: usize },

    #[error("Filename contains null bytes")]
    NullByte,

    #[error("Filename contains path traversal pattern '..'")]
    PathTraversal,

    #[error("Filename cannot be an absolute path")]
    AbsolutePath,

    #[error("Filename cannot contain directory separators")]
    DirectorySeparator,

    #[error("Filename contains dangerous character: '{0}'")]
    DangerousCharacter(char),

    #[error("Filename cannot start with a dash")]
    LeadingDash,

    #[error("Path traversal detected: '{0}' escapes base directory")]
    EscapesBase(String),

    #[error("Path does not exist: {0}")]
    Missing(String),

    #[error("Path is not a file: {0}")]
    NotAFile(String),

    #[error("Value for key '{key}' is too long (max {max} characters)")]
    ValueTooLong { key: String, max: usize },

    #[error("Suspicious pattern detected in value for key '{0}'")]
    SuspiciousValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_names_code() {
        let err = GenerationError::UnknownProvider("nope42".to_string());
        assert!(err.to_string().contains("nope42"));
    }

    #[test]
    fn test_admission_error_converts() {
        let err: Error = AdmissionError::QueueFull { depth: 5 }.into();
        assert!(matches!(err, Error::Admission(AdmissionError::QueueFull { .. })));
    }

    #[test]
    fn test_custom_asset_message() {
        let err = GenerationError::custom_asset("OSM path", ValidationError::PathTraversal);
        assert_eq!(
            err.to_string(),
            "Invalid custom OSM path: Filename contains path traversal pattern '..'"
        );
    }
}
