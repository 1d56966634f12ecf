//! Per-instance lifecycle for director-backed plans.

use std::fmt;
use std::sync::Arc;

use fabrik_core::lock::LockInfo;
use fabrik_core::resource::{ResourceRef, ResourceState, ResourceType};
use fabrik_core::store::{PatchPrecondition, ResourcePatch};
use fabrik_core::token::verify_operation_token;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::backend::{
    BindingRequest, DeploymentRequest, PLATFORM_CONTEXT_KEY, SubOperationRequest, deployment_name,
    parse_deployment_name,
};
use crate::catalog::Plan;
use crate::controller::result_envelope;
use crate::error::{Error, Result};
use crate::platform::{PlatformHookContext, PlatformManager, default_platform_context};
use crate::scheduler::{JobSchedule, JobType, RepeatInterval};
use crate::sub_operation::SERVICE_FABRIK_OPERATION_PARAM;

use super::LifecycleContext;
use super::operation::{Operation, OperationState, OperationType};

/// Sub-operation name that may run on a locked deployment.
pub const UNLOCK_OPERATION: &str = "unlock";

/// Token name for a plain update carrying arguments.
pub const UPDATE_OPERATION: &str = "update";

/// Plan feature gating backups and restore-file cleanup.
pub const BACKUP_FEATURE: &str = "backup";

const SYSTEM_USER: &str = "system";

/// Plan and service ids before an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousValues {
    /// Previous plan id.
    #[serde(default)]
    pub plan_id: Option<String>,
    /// Previous service id.
    #[serde(default)]
    pub service_id: Option<String>,
}

/// Options of a director instance resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRequest {
    /// Target plan id.
    pub plan_id: String,
    /// Service id.
    pub service_id: String,
    /// User parameters.
    #[serde(default)]
    pub parameters: Value,
    /// Platform context.
    #[serde(default)]
    pub context: Value,
    /// Values before an update.
    #[serde(default)]
    pub previous_values: Option<PreviousValues>,
    /// Requested action for an `in_queue` resource; defaults to create.
    #[serde(default)]
    pub operation: Option<OperationType>,
}

impl InstanceRequest {
    /// Platform named by the request context.
    #[must_use]
    pub fn platform(&self) -> Option<&str> {
        self.context.get("platform").and_then(Value::as_str)
    }
}

/// The lifecycle of one director-backed instance.
///
/// Created per operation through [`LifecycleContext::instance`]. Every action
/// starts with `initialize`, which resolves the network segment index and with
/// it the deployment name.
#[derive(Clone)]
pub struct DirectorInstance {
    guid: String,
    plan: Plan,
    ctx: Arc<LifecycleContext>,
    platform: Arc<dyn PlatformManager>,
    network_segment_index: Option<u32>,
}

impl fmt::Debug for DirectorInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectorInstance")
            .field("guid", &self.guid)
            .field("plan", &self.plan.id)
            .field("platform", &self.platform.platform())
            .field("network_segment_index", &self.network_segment_index)
            .finish_non_exhaustive()
    }
}

impl DirectorInstance {
    pub(crate) fn new(
        guid: &str,
        plan: Plan,
        ctx: Arc<LifecycleContext>,
        platform: Arc<dyn PlatformManager>,
    ) -> Self {
        Self {
            guid: guid.to_string(),
            plan,
            ctx,
            platform,
            network_segment_index: None,
        }
    }

    /// Instance guid.
    #[must_use]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Plan of the instance.
    #[must_use]
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Network segment index, once initialized.
    #[must_use]
    pub fn network_segment_index(&self) -> Option<u32> {
        self.network_segment_index
    }

    pub(crate) fn context(&self) -> &Arc<LifecycleContext> {
        &self.ctx
    }

    /// Reference of the instance's director resource.
    #[must_use]
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(
            ResourceType::director(),
            self.ctx.config.namespace.clone(),
            self.guid.clone(),
        )
    }

    /// Deployment name derived from the network segment index.
    ///
    /// # Errors
    ///
    /// Returns `Internal` before `initialize`.
    pub fn deployment_name(&self) -> Result<String> {
        self.network_segment_index
            .map(|index| deployment_name(index, &self.guid))
            .ok_or_else(|| {
                fabrik_core::Error::Internal {
                    message: format!("instance '{}' is not initialized", self.guid),
                }
                .into()
            })
    }

    fn hook(&self, context: Value) -> PlatformHookContext {
        PlatformHookContext {
            instance_guid: self.guid.clone(),
            deployment: self.deployment_name().ok(),
            context,
        }
    }

    /// Resolves the network segment index.
    ///
    /// A create allocates a fresh index; every other action finds the one the
    /// instance was created with. A delete also runs the platform's pre-delete
    /// hooks and, for backup-capable plans, removes the stored restore file.
    ///
    /// # Errors
    ///
    /// Returns `ServiceInstanceNotFound` if the instance holds no index.
    pub async fn initialize(&mut self, kind: OperationType) -> Result<()> {
        let segments = self.ctx.registry.network_segments();
        let index = if kind == OperationType::Create {
            segments.acquire(&self.guid).await?
        } else {
            segments.find(&self.guid).await.map_err(|e| {
                if e.is_not_found() {
                    Error::ServiceInstanceNotFound(self.guid.clone())
                } else {
                    e
                }
            })?
        };
        self.network_segment_index = Some(index);
        tracing::debug!(instance_guid = %self.guid, index, operation = %kind, "instance initialized");

        if kind == OperationType::Delete {
            let hook = self.hook(Value::Null);
            tokio::try_join!(
                self.platform.pre_instance_delete_operations(&hook),
                self.delete_restore_file(),
            )?;
        }
        Ok(())
    }

    async fn delete_restore_file(&self) -> Result<()> {
        if !self.plan.supports(BACKUP_FEATURE) {
            return Ok(());
        }
        let result: Result<()> = async {
            let context = self.platform_context().await?;
            match self.platform.ensure_tenant_id(&self.hook(context)).await? {
                Some(tenant_id) => {
                    self.ctx
                        .registry
                        .director()
                        .delete_restore_file(&tenant_id, &self.guid)
                        .await
                }
                None => Ok(()),
            }
        }
        .await;
        if let Err(e) = &result {
            tracing::error!(instance_guid = %self.guid, error = %e, "failed to delete restore file");
        }
        result
    }

    /// Platform context stored with the deployment.
    ///
    /// Deployments created before the context was recorded report the
    /// default platform.
    ///
    /// # Errors
    ///
    /// Returns backend errors, or a serialization error for a malformed property.
    pub async fn platform_context(&self) -> Result<Value> {
        let deployment = match self.network_segment_index {
            Some(index) => deployment_name(index, &self.guid),
            None => {
                let index = self.ctx.registry.network_segments().find(&self.guid).await?;
                deployment_name(index, &self.guid)
            }
        };
        let property = self
            .ctx
            .registry
            .director()
            .get_deployment_property(&deployment, PLATFORM_CONTEXT_KEY)
            .await?;
        match property {
            Some(raw) => Ok(serde_json::from_str(&raw).map_err(fabrik_core::Error::from)?),
            None => {
                tracing::warn!(
                    deployment = %deployment,
                    "no platform context stored; assuming default platform"
                );
                Ok(default_platform_context())
            }
        }
    }

    fn deployment_request(&self, request: &InstanceRequest, arguments: Option<Value>) -> DeploymentRequest {
        DeploymentRequest {
            instance_guid: self.guid.clone(),
            plan_id: request.plan_id.clone(),
            service_id: request.service_id.clone(),
            parameters: request.parameters.clone(),
            context: request.context.clone(),
            previous_plan_id: request
                .previous_values
                .as_ref()
                .and_then(|p| p.plan_id.clone()),
            arguments,
        }
    }

    /// Dispatches a create.
    ///
    /// # Errors
    ///
    /// Returns allocation or backend errors, including
    /// `ServiceInstanceAlreadyExists`.
    pub async fn create(&mut self, request: &InstanceRequest) -> Result<Operation> {
        self.initialize(OperationType::Create).await?;
        let deployment = self.deployment_name()?;
        let task_id = self
            .ctx
            .registry
            .director()
            .create_or_update_deployment(&deployment, &self.deployment_request(request, None))
            .await?;
        tracing::info!(instance_guid = %self.guid, deployment = %deployment, task_id = %task_id, "create dispatched");

        let mut operation = Operation::new(OperationType::Create);
        operation.task_id = Some(task_id);
        operation.parameters = request.parameters.clone();
        operation.context = request.context.clone();
        Ok(operation)
    }

    /// Dispatches an update.
    ///
    /// Parameters may carry a signed operation token under
    /// `service-fabrik-operation`. Without one, or with one naming `update`,
    /// the deployment is updated in place. Any other name runs that
    /// sub-operation. Every path except `unlock` first checks that the
    /// deployment is not locked.
    ///
    /// # Errors
    ///
    /// Returns token errors, `DeploymentLocked`, or backend errors.
    pub async fn update(&mut self, request: &InstanceRequest) -> Result<Operation> {
        let mut request = request.clone();
        let token = take_operation_token(&mut request.parameters);
        self.initialize(OperationType::Update).await?;

        let descriptor = token
            .map(|t| verify_operation_token(&self.ctx.config.operation_token, &t))
            .transpose()?;
        let name = descriptor
            .as_ref()
            .map_or(UPDATE_OPERATION, |d| d.name.as_str());
        let deployment = self.deployment_name()?;
        let director = self.ctx.registry.director();
        if name != UNLOCK_OPERATION {
            director.verify_deployment_lock_status(&deployment).await?;
        }

        match descriptor {
            Some(descriptor) if descriptor.name != UPDATE_OPERATION => {
                let previous = request.previous_values.clone().unwrap_or_default();
                let sub = SubOperationRequest {
                    name: descriptor.name.clone(),
                    guid: descriptor.guid.clone(),
                    instance_guid: self.guid.clone(),
                    deployment: deployment.clone(),
                    plan_id: previous.plan_id,
                    service_id: previous.service_id,
                    context: request.context.clone(),
                    arguments: descriptor.arguments.clone(),
                    username: descriptor.username.clone(),
                    useremail: descriptor.useremail.clone(),
                };
                let response = director.invoke_sub_operation(&sub).await?;
                tracing::info!(
                    instance_guid = %self.guid,
                    deployment = %deployment,
                    sub_operation = %descriptor.name,
                    "sub-operation dispatched"
                );

                let mut operation = Operation::new(OperationType::Update);
                operation.subtype = Some(descriptor.name);
                operation.context = request.context;
                operation.username = descriptor.username;
                operation.useremail = descriptor.useremail;
                operation.details = response_details(response);
                Ok(operation)
            }
            descriptor => {
                let arguments = descriptor.map(|d| d.arguments);
                let task_id = director
                    .create_or_update_deployment(
                        &deployment,
                        &self.deployment_request(&request, arguments),
                    )
                    .await?;
                tracing::info!(instance_guid = %self.guid, deployment = %deployment, task_id = %task_id, "update dispatched");

                let mut operation = Operation::new(OperationType::Update);
                operation.task_id = Some(task_id);
                operation.parameters = request.parameters;
                operation.context = request.context;
                Ok(operation)
            }
        }
    }

    /// Dispatches a delete.
    ///
    /// # Errors
    ///
    /// Returns hook failures, `DeploymentLocked`, or backend errors.
    pub async fn delete(&mut self) -> Result<Operation> {
        self.initialize(OperationType::Delete).await?;
        let deployment = self.deployment_name()?;
        let director = self.ctx.registry.director();
        director.verify_deployment_lock_status(&deployment).await?;
        let task_id = director.delete_deployment(&deployment).await?;
        tracing::info!(instance_guid = %self.guid, deployment = %deployment, task_id = %task_id, "delete dispatched");

        let mut operation = Operation::new(OperationType::Delete);
        operation.task_id = Some(task_id);
        operation.context = json!({ "platform": self.platform.platform() });
        Ok(operation)
    }

    /// Refreshes the state of `operation`.
    ///
    /// Sub-operations ask the backend for their own state. Task-backed
    /// operations read the backend task and run [`finalize`](Self::finalize)
    /// once the task is terminal.
    ///
    /// # Errors
    ///
    /// Returns `ServiceInstanceNotFound` for an unknown task, or backend errors.
    pub async fn last_operation(&mut self, operation: &mut Operation) -> Result<()> {
        let director = self.ctx.registry.director();
        if operation.kind == OperationType::Update {
            if let Some(subtype) = operation.subtype.clone() {
                let mut view = serde_json::to_value(&*operation).map_err(fabrik_core::Error::from)?;
                if let Some(map) = view.as_object_mut() {
                    map.remove("subtype");
                }
                let status = director
                    .sub_operation_state(&subtype, &self.guid, &view)
                    .await?;
                operation.apply_status(status);
                return Ok(());
            }
        }

        let task_id = operation.task_id.clone().ok_or_else(|| {
            Error::from(fabrik_core::Error::Internal {
                message: format!("{} operation on '{}' has no task id", operation.kind, self.guid),
            })
        })?;
        let task = director.get_task(&task_id).await.map_err(|e| {
            if e.is_not_found() {
                Error::ServiceInstanceNotFound(self.guid.clone())
            } else {
                e
            }
        })?;
        if !task.deployment.ends_with(&self.guid) {
            return Err(Error::backend(format!(
                "task '{task_id}' belongs to deployment '{}', not instance '{}'",
                task.deployment, self.guid
            )));
        }
        if let Some((index, _)) = parse_deployment_name(&task.deployment) {
            self.network_segment_index = Some(index);
        }

        operation.set_state_from_task(&task);
        if operation.state.is_terminal() {
            self.finalize(operation).await;
        }
        Ok(())
    }

    /// Post-processing once an operation is terminal.
    ///
    /// - create: store the platform context (retried), run post-provision
    ///   hooks, then on success register the recurring backup and update jobs
    /// - update: run post-update hooks
    /// - delete: release the network segment once the deployment is gone
    ///
    /// Any failure demotes the operation to failed.
    pub async fn finalize(&self, operation: &mut Operation) {
        let result = match operation.kind {
            OperationType::Create => self.finalize_create(operation).await,
            OperationType::Update => {
                self.platform
                    .post_instance_update_operations(&self.hook(operation.context.clone()))
                    .await
            }
            OperationType::Delete if operation.state == OperationState::Succeeded => {
                self.ctx.registry.network_segments().release(&self.guid).await
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            let deployment = self
                .deployment_name()
                .unwrap_or_else(|_| self.guid.clone());
            self.ctx.metrics.record_finalize_failure(operation.kind.as_str());
            tracing::error!(
                instance_guid = %self.guid,
                deployment = %deployment,
                operation = %operation.kind,
                error = %e,
                "finalize failed"
            );
            operation.fail(format!(
                "{} deployment '{deployment}' not yet completely succeeded because \"{e}\"",
                operation.kind.action()
            ));
        }
    }

    async fn finalize_create(&self, operation: &Operation) -> Result<()> {
        let deployment = self.deployment_name()?;
        let context = serde_json::to_string(&operation.context).map_err(fabrik_core::Error::from)?;
        let director = self.ctx.registry.director();
        let mut attempt = 0_u32;
        self.ctx
            .config
            .finalize_retry()
            .run("store platform context", || {
                attempt += 1;
                tracing::info!(deployment = %deployment, attempt, "storing platform context");
                director.create_deployment_property(&deployment, PLATFORM_CONTEXT_KEY, &context)
            })
            .await?;

        self.platform
            .post_instance_provision_operations(&self.hook(operation.context.clone()))
            .await?;

        if operation.state == OperationState::Succeeded {
            self.schedule_backup().await;
            self.schedule_auto_update().await;
        }
        Ok(())
    }

    /// Creates a binding and returns its credentials.
    ///
    /// A recurring backup is registered afterwards on a best-effort basis.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the binding call.
    pub async fn bind(&mut self, binding_id: &str, parameters: Value) -> Result<Value> {
        self.initialize(OperationType::Bind).await?;
        let deployment = self.deployment_name()?;
        let binding = BindingRequest {
            id: binding_id.to_string(),
            parameters: if parameters.is_null() { json!({}) } else { parameters },
        };
        let credentials = self
            .ctx
            .registry
            .director()
            .create_binding(&deployment, &binding)
            .await?;
        tracing::info!(instance_guid = %self.guid, binding_id, "binding created");
        self.schedule_backup().await;
        Ok(credentials)
    }

    /// Deletes a binding.
    ///
    /// # Errors
    ///
    /// Returns backend errors.
    pub async fn unbind(&mut self, binding_id: &str) -> Result<()> {
        self.initialize(OperationType::Unbind).await?;
        let deployment = self.deployment_name()?;
        self.ctx
            .registry
            .director()
            .delete_binding(&deployment, binding_id)
            .await?;
        tracing::info!(instance_guid = %self.guid, binding_id, "binding deleted");
        Ok(())
    }

    /// Registers the recurring backup job unless one exists.
    ///
    /// Skipped when the feature flag is off or the plan cannot back up.
    /// Failures are logged, never returned.
    pub async fn schedule_backup(&self) -> Option<JobSchedule> {
        if !self.ctx.config.features.scheduled_backup || !self.plan.supports(BACKUP_FEATURE) {
            return None;
        }
        let job_type = JobType::ScheduledBackup;
        let result: Result<Option<JobSchedule>> = async {
            if self
                .ctx
                .scheduler
                .get_schedule(&self.guid, job_type)
                .await?
                .is_some()
            {
                tracing::debug!(instance_guid = %self.guid, "backup already scheduled");
                return Ok(None);
            }
            let interval = match &self.plan.service.backup_interval {
                Some(raw) => raw.parse::<RepeatInterval>()?,
                None => self.ctx.config.default_backup_interval()?,
            };
            let data = json!({ "instance_id": self.guid, "type": "online" });
            self.ctx
                .scheduler
                .schedule(&self.guid, job_type, &interval, data, SYSTEM_USER)
                .await
                .map(Some)
        }
        .await;
        self.record_schedule(job_type, result)
    }

    /// Registers the recurring update-check job at a random time of day.
    ///
    /// Failures are logged, never returned.
    pub async fn schedule_auto_update(&self) -> Option<JobSchedule> {
        if !self.ctx.config.features.scheduled_update {
            return None;
        }
        let job_type = JobType::ServiceInstanceUpdate;
        let interval = RepeatInterval::RandomWithinDay;
        let result: Result<Option<JobSchedule>> = async {
            let time_zone = self.ctx.config.update_time_zone()?;
            let data = json!({ "instance_id": self.guid, "timeZone": time_zone.name() });
            self.ctx
                .config
                .finalize_retry()
                .run("schedule auto update", || {
                    self.ctx.scheduler.schedule(
                        &self.guid,
                        job_type,
                        &interval,
                        data.clone(),
                        SYSTEM_USER,
                    )
                })
                .await
                .map(Some)
        }
        .await;
        self.record_schedule(job_type, result)
    }

    fn record_schedule(&self, job_type: JobType, result: Result<Option<JobSchedule>>) -> Option<JobSchedule> {
        match result {
            Ok(Some(job)) => {
                self.ctx.metrics.record_schedule(job_type.as_str(), "scheduled");
                tracing::info!(
                    instance_guid = %self.guid,
                    job_type = job_type.as_str(),
                    cron = %job.cron_expression,
                    "job scheduled"
                );
                Some(job)
            }
            Ok(None) => {
                self.ctx.metrics.record_schedule(job_type.as_str(), "exists");
                None
            }
            Err(e) => {
                self.ctx.metrics.record_schedule(job_type.as_str(), "error");
                tracing::error!(
                    instance_guid = %self.guid,
                    job_type = job_type.as_str(),
                    error = %e,
                    "failed to schedule job"
                );
                None
            }
        }
    }

    /// Records a dispatched operation on the director resource.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn save_result(&self, operation: &Operation) -> Result<()> {
        let response = serde_json::to_value(operation).map_err(fabrik_core::Error::from)?;
        let patch = ResourcePatch::new()
            .state(ResourceState::InProgress)
            .result(result_envelope(response));
        self.ctx
            .store
            .patch(&self.resource_ref(), patch, PatchPrecondition::None)
            .await?;
        Ok(())
    }

    /// Records a polled operation state on the director resource.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn save_progress(&self, operation: &Operation) -> Result<()> {
        let response = serde_json::to_value(operation).map_err(fabrik_core::Error::from)?;
        let mut patch = ResourcePatch::new()
            .state(operation.state.resource_state())
            .result(result_envelope(response));
        if let Some(description) = &operation.description {
            patch = patch.last_operation(description.clone());
        }
        self.ctx
            .store
            .patch(&self.resource_ref(), patch, PatchPrecondition::None)
            .await?;
        Ok(())
    }

    /// Records a freshly dispatched operation and claims its poll.
    ///
    /// The claim is taken over from any other holder: a poll still running
    /// elsewhere belongs to an operation this one supersedes.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn record_dispatch(&self, operation: &Operation) -> Result<LockInfo> {
        let claim = self
            .ctx
            .poll_lock
            .take_over(&self.resource_ref(), Some(operation.kind.to_string()))
            .await?;
        if let Err(e) = self.save_result(operation).await {
            let released = self
                .ctx
                .poll_lock
                .release_held(&self.resource_ref(), &claim)
                .await;
            if let Err(release) = released {
                tracing::warn!(instance_guid = %self.guid, error = %release, "failed to release poll claim");
            }
            return Err(e);
        }
        Ok(claim)
    }

    /// Starts polling `operation` in the background under `claim`.
    ///
    /// A poll already running for this instance in this process is replaced.
    pub fn start_polling(&self, operation: Operation, claim: LockInfo) {
        self.ctx.pollers.start(self.clone(), operation, claim);
    }

    /// Resumes polling an operation left in progress.
    ///
    /// Returns false without polling while another live broker holds the
    /// poll claim.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn resume_polling(&self, operation: Operation) -> Result<bool> {
        let claim = self
            .ctx
            .poll_lock
            .claim(&self.resource_ref(), Some(operation.kind.to_string()))
            .await?;
        match claim {
            Some(claim) => {
                self.start_polling(operation, claim);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn take_operation_token(parameters: &mut Value) -> Option<String> {
    match parameters.as_object_mut()?.remove(SERVICE_FABRIK_OPERATION_PARAM)? {
        Value::String(token) => Some(token),
        _ => None,
    }
}

// Keys owned by `Operation` itself never come from a backend response.
const RESERVED_KEYS: &[&str] = &[
    "type",
    "task_id",
    "subtype",
    "parameters",
    "context",
    "username",
    "useremail",
    "state",
    "description",
];

fn response_details(response: Value) -> Map<String, Value> {
    match response {
        Value::Object(map) => map
            .into_iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .collect(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("response".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_removed_from_parameters() {
        let mut parameters = json!({ "size": 3, "service-fabrik-operation": "t0k" });
        assert_eq!(take_operation_token(&mut parameters).as_deref(), Some("t0k"));
        assert_eq!(parameters, json!({ "size": 3 }));
        assert_eq!(take_operation_token(&mut parameters), None);
        assert_eq!(take_operation_token(&mut Value::Null), None);
    }

    #[test]
    fn response_details_drop_reserved_keys() {
        let details = response_details(json!({ "state": "x", "backup_guid": "b-1" }));
        assert_eq!(details.len(), 1);
        assert_eq!(details["backup_guid"], "b-1");
        assert!(response_details(Value::Null).is_empty());
        assert_eq!(response_details(json!("ok"))["response"], "ok");
    }

    #[test]
    fn request_platform_comes_from_context() {
        let request: InstanceRequest = serde_json::from_value(json!({
            "plan_id": "p", "service_id": "s", "context": { "platform": "kubernetes" }
        }))
        .expect("request");
        assert_eq!(request.platform(), Some("kubernetes"));
        assert_eq!(request.operation, None);
    }
}
