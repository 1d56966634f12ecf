//! Token-carried sub-operations.
//!
//! A sub-operation (backup, unlock, ...) is started by asking the owning
//! platform to update the instance with a signed token in its parameters.
//! The platform's update request then reaches the instance lifecycle, which
//! verifies the token and runs the named sub-operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fabrik_core::token::{OperationDescriptor, OperationTokenConfig, sign_operation_token};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::backend::parse_deployment_name;
use crate::error::{Error, Result};

/// Parameter name carrying the operation token.
pub const SERVICE_FABRIK_OPERATION_PARAM: &str = "service-fabrik-operation";

/// Platform error code for an instance with an operation already running.
pub const OPERATION_IN_PROGRESS_CODE: i64 = 60016;

/// Platform error name for an instance with an operation already running.
pub const OPERATION_IN_PROGRESS_ERROR_CODE: &str = "CF-AsyncServiceInstanceOperationInProgress";

/// Returns true if a platform error reports an operation already in progress.
#[must_use]
pub fn is_operation_in_progress(code: Option<i64>, error_code: Option<&str>) -> bool {
    code == Some(OPERATION_IN_PROGRESS_CODE) || error_code == Some(OPERATION_IN_PROGRESS_ERROR_CODE)
}

/// Maps a rejected platform call to a broker error.
#[must_use]
pub fn platform_error(code: Option<i64>, error_code: Option<&str>, description: Option<&str>) -> Error {
    if is_operation_in_progress(code, error_code) {
        Error::OperationInProgress(
            description
                .unwrap_or("Async service instance operation in progress")
                .to_string(),
        )
    } else {
        Error::backend(format!(
            "platform rejected instance update: {}",
            description.unwrap_or("no description")
        ))
    }
}

/// Instance update sent to the owning platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    /// Update parameters.
    pub parameters: Value,
    /// Whether the platform should wait for the update to finish.
    pub synchronous: bool,
}

/// Client for the platform owning the instances.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Requests an instance update, optionally on behalf of a user.
    ///
    /// Rejections should be reported through [`platform_error`].
    async fn update_service_instance(
        &self,
        instance_id: &str,
        update: &InstanceUpdate,
        bearer: Option<&str>,
    ) -> Result<()>;
}

/// A sub-operation request waiting to be handed to the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct FabrikOperation {
    name: String,
    guid: Option<String>,
    instance_id: String,
    username: Option<String>,
    useremail: Option<String>,
    arguments: Value,
    bearer: Option<String>,
    synchronous: bool,
}

impl FabrikOperation {
    /// Creates a sub-operation for an instance.
    #[must_use]
    pub fn new(name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guid: None,
            instance_id: instance_id.into(),
            username: None,
            useremail: None,
            arguments: json!({}),
            bearer: None,
            synchronous: false,
        }
    }

    /// Creates a sub-operation for the instance behind a deployment name.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for a name that is not a deployment name.
    pub fn for_deployment(name: impl Into<String>, deployment: &str) -> Result<Self> {
        let (_, guid) = parse_deployment_name(deployment)
            .ok_or_else(|| Error::bad_request(format!("'{deployment}' is not a deployment name")))?;
        Ok(Self::new(name, guid))
    }

    /// Records the initiating user.
    #[must_use]
    pub fn with_user(mut self, username: impl Into<String>, useremail: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.useremail = Some(useremail.into());
        self
    }

    /// Sets the sub-operation arguments.
    #[must_use]
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    /// Calls the platform with the user's bearer token.
    #[must_use]
    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.bearer = Some(bearer.into());
        self
    }

    /// Asks the platform to complete the update before returning.
    #[must_use]
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Instance the sub-operation runs on.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Guid of the last issued token.
    #[must_use]
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// Assigns a fresh guid and signs the descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the signing configuration is invalid.
    pub fn token(&mut self, config: &OperationTokenConfig, now: DateTime<Utc>) -> Result<String> {
        let guid = Uuid::new_v4().to_string();
        self.guid = Some(guid.clone());
        let descriptor = OperationDescriptor {
            name: self.name.clone(),
            guid,
            username: self.username.clone(),
            useremail: self.useremail.clone(),
            arguments: self.arguments.clone(),
        };
        Ok(sign_operation_token(config, &descriptor, now)?)
    }

    /// Issues a token and hands it to the platform as an instance update.
    ///
    /// Returns `{name, guid}` of the started sub-operation.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the platform already runs an operation on the
    /// instance, or the platform's error otherwise.
    pub async fn invoke(
        &mut self,
        client: &dyn PlatformClient,
        config: &OperationTokenConfig,
    ) -> Result<Value> {
        let token = self.token(config, Utc::now())?;
        let update = InstanceUpdate {
            parameters: json!({ SERVICE_FABRIK_OPERATION_PARAM: token }),
            synchronous: self.synchronous,
        };
        match client
            .update_service_instance(&self.instance_id, &update, self.bearer.as_deref())
            .await
        {
            Ok(()) => {
                tracing::info!(
                    instance_id = %self.instance_id,
                    name = %self.name,
                    guid = self.guid.as_deref().unwrap_or_default(),
                    "sub-operation requested"
                );
                Ok(json!({ "name": self.name, "guid": self.guid }))
            }
            Err(Error::OperationInProgress(message)) => Err(Error::conflict(message)),
            Err(e) => Err(e),
        }
    }
}
