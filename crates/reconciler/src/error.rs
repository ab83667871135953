//! Error types for the reconciler crate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The resource does not exist (deleted between delivery and lookup).
    #[error("{kind} '{key}' not found")]
    NotFound { kind: String, key: String },

    /// A version-conditional write lost against a newer version.
    #[error("conflict writing {kind} '{key}': expected version {expected}, found {actual}")]
    Conflict {
        kind: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Create collided with an existing resource.
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: String, key: String },

    /// The per-invocation deadline elapsed before the call finished.
    #[error("deadline of {}s exceeded during {operation}", .budget.as_secs())]
    DeadlineExceeded { operation: String, budget: Duration },

    /// Any other store failure (transport, server error).
    #[error("store operation '{operation}' failed: {reason}")]
    Store { operation: String, reason: String },

    /// The user supplied an image reference that cannot be scanned.
    #[error("invalid image name {image}")]
    InvalidImage { image: String },

    /// A logical image name could not be resolved to a reference.
    #[error("unable to resolve image '{name}': set {env} or configure a default")]
    ImageNotResolved { name: String, env: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create a version conflict error.
    pub fn conflict(kind: impl Into<String>, key: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            kind: kind.into(),
            key: key.into(),
            expected,
            actual,
        }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create a deadline exceeded error.
    pub fn deadline_exceeded(operation: impl Into<String>, budget: Duration) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
            budget,
        }
    }

    /// Create a store failure.
    pub fn store(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid image error.
    pub fn invalid_image(image: impl Into<String>) -> Self {
        Self::InvalidImage {
            image: image.into(),
        }
    }

    /// Create an unresolved image error.
    pub fn image_not_resolved(name: impl Into<String>, env: impl Into<String>) -> Self {
        Self::ImageNotResolved {
            name: name.into(),
            env: env.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether redelivering the same key can succeed where this attempt failed.
    ///
    /// Validation and build failures are terminal and get recorded on the
    /// request instead of being retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Conflict { .. }
                | Self::DeadlineExceeded { .. }
                | Self::Store { .. }
        )
    }
}
