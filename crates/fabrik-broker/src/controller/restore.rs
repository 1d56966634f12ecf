//! Restore resources: start and abort restores.

use std::sync::Arc;

use async_trait::async_trait;
use fabrik_core::resource::{Resource, ResourceState, ResourceType};
use fabrik_core::store::ResourceStore;

use super::backup::service_for;
use super::{HandlerOutcome, OPTIONS_STATUS_KEY, ResourceHandler, operation_options};
use crate::error::{Error, Result};
use crate::registry::ServiceRegistry;
use crate::watcher::StatePredicate;

/// Handles `defaultrestore` resources in `in_queue` and `abort`.
pub struct RestoreHandler {
    store: Arc<dyn ResourceStore>,
    registry: Arc<ServiceRegistry>,
}

impl RestoreHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, registry: Arc<ServiceRegistry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl ResourceHandler for RestoreHandler {
    fn name(&self) -> &'static str {
        "restore"
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::default_restore()
    }

    fn predicate(&self) -> StatePredicate {
        StatePredicate::any_of([ResourceState::InQueue, ResourceState::Abort])
    }

    async fn process(&self, resource: &Resource) -> Result<HandlerOutcome> {
        match resource.state() {
            ResourceState::InQueue => {
                let options = resource.options_value()?;
                let response = service_for(&self.registry, &options)?
                    .start_restore(&options)
                    .await?;
                tracing::info!(restore = %resource.name(), "restore started");
                Ok(HandlerOutcome::transition(ResourceState::InProgress)
                    .with_response(response)
                    .with_status_key(OPTIONS_STATUS_KEY, options))
            }
            ResourceState::Abort => {
                let options = operation_options(self.store.as_ref(), resource).await?;
                let response = service_for(&self.registry, &options)?
                    .abort_last_restore(&options)
                    .await?;
                tracing::info!(restore = %resource.name(), "restore abort requested");
                Ok(HandlerOutcome::transition(ResourceState::Aborting).with_response(response))
            }
            other => Err(Error::bad_request(format!("restore handler cannot act on state {other}"))),
        }
    }
}
