//! Platform-specific hooks run around instance provisioning.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::Result;

/// Platform name used when a request carries no context.
pub const DEFAULT_PLATFORM: &str = "cloudfoundry";

/// Returns the platform context assumed for deployments that never stored one.
#[must_use]
pub fn default_platform_context() -> Value {
    json!({ "platform": DEFAULT_PLATFORM })
}

/// Arguments passed to platform hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformHookContext {
    /// Instance guid.
    pub instance_guid: String,
    /// Deployment name, once known.
    pub deployment: Option<String>,
    /// Platform context of the request.
    pub context: Value,
}

/// Hooks for the platform that owns an instance.
#[async_trait]
pub trait PlatformManager: Send + Sync {
    /// Platform name, e.g. `cloudfoundry` or `kubernetes`.
    fn platform(&self) -> &str;

    /// Runs after a successful create.
    async fn post_instance_provision_operations(&self, hook: &PlatformHookContext) -> Result<()>;

    /// Runs before a delete is dispatched.
    async fn pre_instance_delete_operations(&self, hook: &PlatformHookContext) -> Result<()>;

    /// Runs after an update completes.
    async fn post_instance_update_operations(&self, hook: &PlatformHookContext) -> Result<()>;

    /// Resolves the tenant id owning the instance, if the platform has one.
    async fn ensure_tenant_id(&self, hook: &PlatformHookContext) -> Result<Option<String>>;
}

/// A platform with no hooks.
#[derive(Debug, Clone)]
pub struct NoopPlatformManager {
    platform: String,
}

impl NoopPlatformManager {
    /// Creates a no-op manager for the named platform.
    #[must_use]
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }
}

impl Default for NoopPlatformManager {
    fn default() -> Self {
        Self::new(DEFAULT_PLATFORM)
    }
}

#[async_trait]
impl PlatformManager for NoopPlatformManager {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn post_instance_provision_operations(&self, _hook: &PlatformHookContext) -> Result<()> {
        Ok(())
    }

    async fn pre_instance_delete_operations(&self, _hook: &PlatformHookContext) -> Result<()> {
        Ok(())
    }

    async fn post_instance_update_operations(&self, _hook: &PlatformHookContext) -> Result<()> {
        Ok(())
    }

    async fn ensure_tenant_id(&self, hook: &PlatformHookContext) -> Result<Option<String>> {
        Ok(hook
            .context
            .get("space_guid")
            .or_else(|| hook.context.get("namespace"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}
