//! Director instance resources: create, update and delete deployments.
//!
//! Dispatch happens under the resource lock; the operation is then recorded
//! on the resource and a background poll task carries it to a terminal
//! state after the lock is released.

use std::sync::Arc;

use async_trait::async_trait;
use fabrik_core::resource::{Resource, ResourceState, ResourceType};

use super::{HandlerOutcome, ResourceHandler, error_envelope};
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleContext;
use crate::lifecycle::instance::{DirectorInstance, InstanceRequest};
use crate::lifecycle::operation::{Operation, OperationType};
use crate::watcher::StatePredicate;

/// Handles `director` resources in `in_queue` and `delete`.
pub struct DeploymentHandler {
    ctx: Arc<LifecycleContext>,
}

impl DeploymentHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self { ctx }
    }

    async fn dispatch(
        &self,
        instance: &mut DirectorInstance,
        request: &InstanceRequest,
        kind: OperationType,
    ) -> Result<Operation> {
        match kind {
            OperationType::Create => instance.create(request).await,
            OperationType::Update => instance.update(request).await,
            OperationType::Delete => instance.delete().await,
            other => Err(Error::bad_request(format!(
                "deployment handler does not run {other} operations"
            ))),
        }
    }
}

// The operation is live on the director but nothing points at it; keep the
// task id and deployment in the failure so both can be tracked down.
fn unrecorded_dispatch(instance: &DirectorInstance, operation: &Operation, cause: Error) -> Error {
    let task = operation.task_id.as_deref().unwrap_or("unknown");
    let deployment = instance.deployment_name().unwrap_or_else(|_| "unknown".to_string());
    tracing::error!(
        instance_guid = %instance.guid(),
        operation = %operation.kind,
        task_id = task,
        deployment = %deployment,
        error = %cause,
        "dispatched operation could not be recorded"
    );
    Error::Backend {
        message: format!(
            "{} of instance '{}' was dispatched as task '{task}' on deployment '{deployment}' \
             but could not be recorded: {cause}",
            operation.kind.action(),
            instance.guid(),
        ),
        source: Some(Box::new(cause)),
    }
}

#[async_trait]
impl ResourceHandler for DeploymentHandler {
    fn name(&self) -> &'static str {
        "deployment"
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::director()
    }

    fn predicate(&self) -> StatePredicate {
        StatePredicate::any_of([ResourceState::InQueue, ResourceState::Delete])
    }

    async fn process(&self, resource: &Resource) -> Result<HandlerOutcome> {
        let request: InstanceRequest = resource.options()?;
        let kind = match resource.state() {
            ResourceState::Delete => OperationType::Delete,
            _ => request.operation.unwrap_or(OperationType::Create),
        };
        let service_id = (kind != OperationType::Delete).then_some(request.service_id.as_str());
        let mut instance = self.ctx.instance(
            resource.name(),
            &request.plan_id,
            service_id,
            request.platform(),
        )?;

        match self.dispatch(&mut instance, &request, kind).await {
            Ok(operation) => match instance.record_dispatch(&operation).await {
                Ok(claim) => {
                    instance.start_polling(operation, claim);
                    // The poll task owns the resource status from here on.
                    Ok(HandlerOutcome::default())
                }
                Err(e) => Err(unrecorded_dispatch(&instance, &operation, e)),
            },
            Err(e @ Error::ServiceInstanceAlreadyExists(_)) => {
                tracing::warn!(instance_guid = %resource.name(), error = %e, "instance already exists");
                Ok(HandlerOutcome::transition(ResourceState::Failed).with_result(error_envelope(&e)))
            }
            Err(e) => Err(e),
        }
    }
}
