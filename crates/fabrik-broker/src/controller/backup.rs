//! Backup resources: start, abort and delete backups.

use std::sync::Arc;

use async_trait::async_trait;
use fabrik_core::resource::{Resource, ResourceState, ResourceType};
use fabrik_core::store::ResourceStore;
use serde_json::Value;

use super::{HandlerOutcome, OPTIONS_STATUS_KEY, ResourceHandler, operation_options};
use crate::backend::BackupService;
use crate::error::{Error, Result};
use crate::registry::ServiceRegistry;
use crate::watcher::StatePredicate;

/// Reads `plan_id` from operation options.
pub(crate) fn plan_id(options: &Value) -> Result<&str> {
    options
        .get("plan_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::bad_request("plan_id is required in operation options"))
}

/// Resolves the backup service for the plan named in `options`.
pub(crate) fn service_for(registry: &ServiceRegistry, options: &Value) -> Result<Arc<dyn BackupService>> {
    let plan = registry.get_plan(plan_id(options)?)?;
    registry.backup_service(plan)
}

/// Handles `defaultbackup` resources in `in_queue`, `abort` and `delete`.
pub struct BackupHandler {
    store: Arc<dyn ResourceStore>,
    registry: Arc<ServiceRegistry>,
}

impl BackupHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, registry: Arc<ServiceRegistry>) -> Self {
        Self { store, registry }
    }

    async fn start(&self, resource: &Resource) -> Result<HandlerOutcome> {
        let options = resource.options_value()?;
        let response = service_for(&self.registry, &options)?
            .start_backup(&options)
            .await?;
        tracing::info!(backup = %resource.name(), "backup started");
        Ok(HandlerOutcome::transition(ResourceState::InProgress)
            .with_response(response)
            .with_status_key(OPTIONS_STATUS_KEY, options))
    }

    async fn abort(&self, resource: &Resource) -> Result<HandlerOutcome> {
        let options = operation_options(self.store.as_ref(), resource).await?;
        let response = service_for(&self.registry, &options)?
            .abort_last_backup(&options)
            .await?;
        tracing::info!(backup = %resource.name(), "backup abort requested");
        Ok(HandlerOutcome::transition(ResourceState::Aborting).with_response(response))
    }

    async fn delete(&self, resource: &Resource) -> Result<HandlerOutcome> {
        let options = operation_options(self.store.as_ref(), resource).await?;
        service_for(&self.registry, &options)?
            .delete_backup(&options)
            .await?;
        match self.store.delete(&resource.reference()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(backup = %resource.name(), "backup deleted");
        Ok(HandlerOutcome::deleted())
    }
}

#[async_trait]
impl ResourceHandler for BackupHandler {
    fn name(&self) -> &'static str {
        "backup"
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::default_backup()
    }

    fn predicate(&self) -> StatePredicate {
        StatePredicate::any_of([
            ResourceState::InQueue,
            ResourceState::Abort,
            ResourceState::Delete,
        ])
    }

    async fn process(&self, resource: &Resource) -> Result<HandlerOutcome> {
        match resource.state() {
            ResourceState::InQueue => self.start(resource).await,
            ResourceState::Abort => self.abort(resource).await,
            ResourceState::Delete => self.delete(resource).await,
            other => Err(Error::bad_request(format!("backup handler cannot act on state {other}"))),
        }
    }
}
