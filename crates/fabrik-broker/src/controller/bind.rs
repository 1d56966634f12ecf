//! Binding resources: create and delete bindings of director instances.

use std::sync::Arc;

use async_trait::async_trait;
use fabrik_core::resource::{Resource, ResourceState, ResourceType};
use fabrik_core::store::ResourceStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{HandlerOutcome, ResourceHandler};
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleContext;
use crate::lifecycle::instance::DirectorInstance;
use crate::watcher::StatePredicate;

/// Options of a `directorbind` resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindOptions {
    /// Instance guid.
    pub instance_id: String,
    /// Plan id.
    pub plan_id: String,
    /// Service id.
    pub service_id: String,
    /// Binding id.
    pub binding_id: String,
    /// Binding parameters.
    #[serde(default)]
    pub parameters: Value,
    /// Platform context.
    #[serde(default)]
    pub context: Value,
}

impl BindOptions {
    fn platform(&self) -> Option<&str> {
        self.context.get("platform").and_then(Value::as_str)
    }
}

/// Handles `directorbind` resources in `in_queue` (bind) and `delete` (unbind).
pub struct BindHandler {
    store: Arc<dyn ResourceStore>,
    ctx: Arc<LifecycleContext>,
}

impl BindHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self {
            store: Arc::clone(&ctx.store),
            ctx,
        }
    }

    fn instance(&self, options: &BindOptions) -> Result<DirectorInstance> {
        self.ctx.instance(
            &options.instance_id,
            &options.plan_id,
            Some(&options.service_id),
            options.platform(),
        )
    }
}

#[async_trait]
impl ResourceHandler for BindHandler {
    fn name(&self) -> &'static str {
        "bind"
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::director_bind()
    }

    fn predicate(&self) -> StatePredicate {
        StatePredicate::any_of([ResourceState::InQueue, ResourceState::Delete])
    }

    async fn process(&self, resource: &Resource) -> Result<HandlerOutcome> {
        let options: BindOptions = resource.options()?;
        let mut instance = self.instance(&options)?;
        match resource.state() {
            ResourceState::InQueue => {
                let credentials = instance
                    .bind(&options.binding_id, options.parameters.clone())
                    .await?;
                Ok(HandlerOutcome::transition(ResourceState::Succeeded).with_response(credentials))
            }
            ResourceState::Delete => {
                instance.unbind(&options.binding_id).await?;
                match self.store.delete(&resource.reference()).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(HandlerOutcome::deleted())
            }
            other => Err(Error::bad_request(format!("bind handler cannot act on state {other}"))),
        }
    }
}
