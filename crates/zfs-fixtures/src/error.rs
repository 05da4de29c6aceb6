//! Error types for fixture provisioning.

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StorageError;

/// Error type for every stage of a fixture build, teardown and audit.
///
/// None of these are retried: storage operations are not idempotent
/// mid-sequence, so the first failure aborts the build and the caller is
/// expected to unwind whatever was registered for teardown.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed fixture: {message}")]
    MalformedFixture { message: String },

    #[error("Device creation failed for {}: {message}", .path.display())]
    DeviceCreation { path: PathBuf, message: String },

    #[error("Provisioning failed at step '{step}': {message}")]
    Provisioning { step: String, message: String },

    #[error("Snapshot {snapshot} failed: {message}")]
    Snapshot { snapshot: String, message: String },

    #[error("Content copy into {} failed: {message}", .destination.display())]
    ContentCopy { destination: PathBuf, message: String },

    #[error("Invalid fstab filesystem type: {0}")]
    InvalidFstabType(String),

    #[error("Pool audit failed: {}", .mismatches.join("; "))]
    AuditMismatch { mismatches: Vec<String> },

    #[error("Teardown left residual state: {}", .failures.join("; "))]
    Teardown { failures: Vec<String> },

    #[error("Formatting {} did not finish within {timeout:?}", .path.display())]
    FormatTimeout { path: PathBuf, timeout: Duration },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new malformed fixture error.
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedFixture {
            message: message.into(),
        }
    }

    /// Create a new device creation error.
    pub fn device<P: Into<PathBuf>, S: Into<String>>(path: P, message: S) -> Self {
        Self::DeviceCreation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new provisioning error for the named step.
    pub fn provisioning<T: Into<String>, S: ToString>(step: T, message: S) -> Self {
        Self::Provisioning {
            step: step.into(),
            message: message.to_string(),
        }
    }

    /// Create a new snapshot error.
    pub fn snapshot<T: Into<String>, S: ToString>(snapshot: T, message: S) -> Self {
        Self::Snapshot {
            snapshot: snapshot.into(),
            message: message.to_string(),
        }
    }

    /// Create a new content copy error.
    pub fn content<P: Into<PathBuf>, S: ToString>(destination: P, message: S) -> Self {
        Self::ContentCopy {
            destination: destination.into(),
            message: message.to_string(),
        }
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wrap a storage subsystem failure with the step that triggered it.
    pub(crate) fn storage<T: Into<String>>(step: T, source: StorageError) -> Self {
        Self::provisioning(step, source)
    }
}
