//! Error types for the broker controller.

use fabrik_core::retry::Retryable;
use serde_json::{Value, json};

/// The result type used throughout the broker.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by controllers, the instance lifecycle and capability implementations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A core primitive failed (store, lock, token).
    #[error(transparent)]
    Core(#[from] fabrik_core::Error),

    /// The plan id is not in the catalog.
    #[error("plan '{0}' not found in catalog")]
    PlanNotFound(String),

    /// The request's service id does not match the plan's service.
    #[error("service id '{actual}' does not match plan service '{expected}'")]
    ServiceMismatch {
        /// Service id of the plan.
        expected: String,
        /// Service id carried by the request.
        actual: String,
    },

    /// The backend already has a deployment for this instance.
    #[error("service instance '{0}' already exists")]
    ServiceInstanceAlreadyExists(String),

    /// The backend has no task or deployment for this instance.
    #[error("service instance '{0}' not found")]
    ServiceInstanceNotFound(String),

    /// The deployment is locked by another operation.
    #[error("deployment '{deployment}' is locked: {message}")]
    DeploymentLocked {
        /// Deployment name.
        deployment: String,
        /// Lock holder description.
        message: String,
    },

    /// The owning platform reported an operation already in progress.
    #[error("operation in progress: {0}")]
    OperationInProgress(String),

    /// The deployment backend failed.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A capability required by the plan is not available.
    #[error("feature '{feature}' not supported by plan '{plan_id}'")]
    FeatureNotSupported {
        /// Feature name.
        feature: String,
        /// Plan id.
        plan_id: String,
    },

    /// Configuration was invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Creates a backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Core(fabrik_core::Error::conflict(message))
    }

    /// Creates a bad-request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Core(fabrik_core::Error::BadRequest(message.into()))
    }

    /// Returns true for not-found conditions.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::Core(e) => e.is_not_found(),
            Self::PlanNotFound(_) | Self::ServiceInstanceNotFound(_) => true,
            _ => false,
        }
    }

    /// Returns true for conflicts.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        match self {
            Self::Core(e) => e.is_conflict(),
            _ => false,
        }
    }

    /// Returns a short machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Core(e) => match e {
                fabrik_core::Error::NotFound { .. } => "NotFound",
                fabrik_core::Error::Conflict { .. } => "Conflict",
                fabrik_core::Error::Forbidden(_) => "Forbidden",
                fabrik_core::Error::BadRequest(_) => "BadRequest",
                fabrik_core::Error::UnprocessableEntity(_) => "UnprocessableEntity",
                fabrik_core::Error::InvalidToken(_) => "InvalidToken",
                fabrik_core::Error::TokenExpired => "TokenExpired",
                _ => "InternalServerError",
            },
            Self::PlanNotFound(_) => "PlanNotFound",
            Self::ServiceMismatch { .. } => "BadRequest",
            Self::ServiceInstanceAlreadyExists(_) => "ServiceInstanceAlreadyExists",
            Self::ServiceInstanceNotFound(_) => "ServiceInstanceNotFound",
            Self::DeploymentLocked { .. } => "DeploymentAlreadyLocked",
            Self::OperationInProgress(_) => "Conflict",
            Self::Backend { .. } => "BackendError",
            Self::FeatureNotSupported { .. } => "FeatureNotSupportedByAnyAgent",
            Self::Config(_) => "InternalServerError",
        }
    }

    /// Renders the error as a status payload.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Core(e) => e.is_retryable(),
            Self::Backend { .. } | Self::OperationInProgress(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_sees_through_core() {
        let err = Error::from(fabrik_core::Error::not_found("director", "g-1"));
        assert!(err.is_not_found());
        assert!(Error::conflict("busy").is_conflict());
        assert!(!Error::backend("boom").is_conflict());
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(Error::backend("timeout").is_retryable());
        assert!(Error::from(fabrik_core::Error::storage("io")).is_retryable());
        assert!(!Error::PlanNotFound("p".into()).is_retryable());
        assert!(!Error::bad_request("x").is_retryable());
    }

    #[test]
    fn payload_carries_code_and_message() {
        let payload = Error::ServiceInstanceAlreadyExists("g-1".into()).to_payload();
        assert_eq!(payload["code"], "ServiceInstanceAlreadyExists");
        assert_eq!(payload["message"], "service instance 'g-1' already exists");
    }
}
