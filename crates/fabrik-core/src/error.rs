//! Error types and result aliases for Fabrik.
//!
//! This module defines the shared error types used by the resource store,
//! the annotation lock and the operation token helpers. Errors are
//! structured so callers can branch on the kind (`NotFound` vs `Conflict`)
//! without string matching.

use std::fmt;

/// The result type used throughout Fabrik.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Fabrik core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested resource was not found.
    #[error("not found: {resource_type} '{name}'")]
    NotFound {
        /// The type of resource that was looked up.
        resource_type: String,
        /// The name (guid) that was looked up.
        name: String,
    },

    /// A concurrent modification or an already-running operation blocked the request.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The caller is not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The request was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request was well-formed but cannot be processed.
    #[error("unprocessable entity: {0}")]
    UnprocessableEntity(String),

    /// An operation token failed signature or claim validation.
    #[error("invalid operation token: {0}")]
    InvalidToken(String),

    /// An operation token was valid but has expired.
    #[error("operation token expired")]
    TokenExpired,

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(resource_type: impl fmt::Display, name: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a serialization error from any displayable cause.
    #[must_use]
    pub fn serialization(message: impl fmt::Display) -> Self {
        Self::Serialization {
            message: message.to_string(),
        }
    }

    /// Returns true for `NotFound`.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for `Conflict`.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true for errors caused by the caller's input.
    ///
    /// These are surfaced as-is and never retried.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Forbidden(_)
                | Self::BadRequest(_)
                | Self::UnprocessableEntity(_)
                | Self::InvalidToken(_)
                | Self::TokenExpired
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
