//! Operation tokens: signed descriptors for re-entrant sub-operations.
//!
//! A token carries `{name, guid, username, useremail, arguments}` through an
//! external synchronous update call. The receiving `update` verifies it and
//! runs the named sub-operation. Tokens are compact HS256 JWTs.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Default operation-token TTL in seconds.
pub const DEFAULT_OPERATION_TOKEN_TTL_SECONDS: u64 = 900;

/// Maximum supported operation-token TTL in seconds.
pub const MAX_OPERATION_TOKEN_TTL_SECONDS: u64 = 86_400;

/// Configuration for operation-token signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTokenConfig {
    /// HS256 secret for signing and validating tokens.
    #[serde(default)]
    pub hs256_secret: String,
    /// Token time-to-live in seconds.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for OperationTokenConfig {
    fn default() -> Self {
        Self {
            hs256_secret: String::new(),
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

const fn default_ttl_seconds() -> u64 {
    DEFAULT_OPERATION_TOKEN_TTL_SECONDS
}

impl OperationTokenConfig {
    /// Creates a config with the given secret and the default TTL.
    #[must_use]
    pub fn new(hs256_secret: impl Into<String>) -> Self {
        Self {
            hs256_secret: hs256_secret.into(),
            ..Self::default()
        }
    }

    /// Returns the configured TTL as a duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX))
    }

    /// Validates configuration sanity.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` when the secret is missing or the TTL is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.hs256_secret.trim().is_empty() {
            return Err(Error::BadRequest(
                "operation_token.hs256_secret is required".to_string(),
            ));
        }
        if self.ttl_seconds == 0 {
            return Err(Error::BadRequest(
                "operation_token.ttl_seconds must be greater than zero".to_string(),
            ));
        }
        if self.ttl_seconds > MAX_OPERATION_TOKEN_TTL_SECONDS {
            return Err(Error::BadRequest(format!(
                "operation_token.ttl_seconds must be at most {MAX_OPERATION_TOKEN_TTL_SECONDS}"
            )));
        }
        Ok(())
    }
}

/// Sub-operation identity carried by a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Sub-operation name, e.g. `backup` or `unlock`.
    pub name: String,
    /// Fresh guid for this invocation.
    pub guid: String,
    /// Initiating user name.
    #[serde(default)]
    pub username: Option<String>,
    /// Initiating user email.
    #[serde(default)]
    pub useremail: Option<String>,
    /// Sub-operation arguments.
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OperationClaims {
    #[serde(flatten)]
    descriptor: OperationDescriptor,
    exp: usize,
    iat: usize,
}

fn timestamp_to_usize(value: i64, field: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::BadRequest(format!("{field} timestamp out of range")))
}

/// Signs an operation descriptor into a token.
///
/// # Errors
///
/// Returns an error when configuration is invalid or signing fails.
pub fn sign_operation_token(
    config: &OperationTokenConfig,
    descriptor: &OperationDescriptor,
    now: DateTime<Utc>,
) -> Result<String> {
    config.validate()?;

    let claims = OperationClaims {
        descriptor: descriptor.clone(),
        exp: timestamp_to_usize((now + config.ttl()).timestamp(), "exp")?,
        iat: timestamp_to_usize(now.timestamp(), "iat")?,
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.hs256_secret.as_bytes()),
    )
    .map_err(|e| Error::Internal {
        message: format!("operation token signing failed: {e}"),
    })
}

/// Verifies and decodes an operation token.
///
/// # Errors
///
/// Returns `TokenExpired` for an expired token and `InvalidToken` for any
/// other verification failure.
pub fn verify_operation_token(
    config: &OperationTokenConfig,
    token: &str,
) -> Result<OperationDescriptor> {
    config.validate()?;

    let validation = Validation::new(Algorithm::HS256);
    let data = jsonwebtoken::decode::<OperationClaims>(
        token,
        &DecodingKey::from_secret(config.hs256_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => Error::TokenExpired,
        _ => Error::InvalidToken(e.to_string()),
    })?;

    Ok(data.claims.descriptor)
}
