//! Recording fakes for the broker's capability traits.
//!
//! Every fake records the calls it receives so tests can assert on backend
//! side effects, and exposes knobs to inject failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use fabrik_broker::backend::{
    BackendTask, BackupService, BindingRequest, DeploymentRequest, DirectorManager,
    SubOperationRequest, TaskState,
};
use fabrik_broker::error::{Error, Result};
use fabrik_broker::lifecycle::operation::{OperationState, OperationStatus};
use fabrik_broker::platform::{PlatformHookContext, PlatformManager};
use fabrik_broker::sub_operation::{InstanceUpdate, PlatformClient, platform_error};
use fabrik_core::resource::{Resource, ResourceRef, ResourceType};
use fabrik_core::store::{
    MemoryResourceStore, PatchPrecondition, ResourcePatch, ResourceStore, ResourceWatch,
};
use serde_json::{Value, json};

/// Record of a director call.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectorCall {
    /// Create-or-update submitted.
    CreateOrUpdate {
        /// Deployment name.
        deployment: String,
        /// Request.
        request: DeploymentRequest,
    },
    /// Delete submitted.
    Delete {
        /// Deployment name.
        deployment: String,
    },
    /// Task status read.
    GetTask {
        /// Task id.
        task_id: String,
    },
    /// Binding created.
    CreateBinding {
        /// Deployment name.
        deployment: String,
        /// Binding id.
        binding_id: String,
    },
    /// Binding deleted.
    DeleteBinding {
        /// Deployment name.
        deployment: String,
        /// Binding id.
        binding_id: String,
    },
    /// Property write attempted.
    CreateProperty {
        /// Deployment name.
        deployment: String,
        /// Property key.
        key: String,
        /// Property value.
        value: String,
    },
    /// Property read.
    GetProperty {
        /// Deployment name.
        deployment: String,
        /// Property key.
        key: String,
    },
    /// Lock status checked.
    VerifyLock {
        /// Deployment name.
        deployment: String,
    },
    /// Sub-operation invoked.
    InvokeSubOperation(SubOperationRequest),
    /// Sub-operation state read.
    SubOperationState {
        /// Sub-operation name.
        name: String,
        /// Instance guid.
        instance_guid: String,
    },
    /// Restore file deleted.
    DeleteRestoreFile {
        /// Tenant id.
        tenant_id: String,
        /// Instance guid.
        instance_guid: String,
    },
}

impl DirectorCall {
    /// Short name of the call.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateOrUpdate { .. } => "create_or_update_deployment",
            Self::Delete { .. } => "delete_deployment",
            Self::GetTask { .. } => "get_task",
            Self::CreateBinding { .. } => "create_binding",
            Self::DeleteBinding { .. } => "delete_binding",
            Self::CreateProperty { .. } => "create_deployment_property",
            Self::GetProperty { .. } => "get_deployment_property",
            Self::VerifyLock { .. } => "verify_deployment_lock_status",
            Self::InvokeSubOperation(_) => "invoke_sub_operation",
            Self::SubOperationState { .. } => "sub_operation_state",
            Self::DeleteRestoreFile { .. } => "delete_restore_file",
        }
    }
}

#[derive(Debug)]
struct DirectorState {
    calls: Vec<DirectorCall>,
    tasks: HashMap<String, String>,
    next_task: u64,
    task_state: TaskState,
    properties: HashMap<(String, String), String>,
    property_failures: u32,
    locked_by: Option<String>,
    existing: bool,
    credentials: Value,
    sub_operation_response: Value,
    sub_operation_status: OperationStatus,
}

impl Default for DirectorState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            tasks: HashMap::new(),
            next_task: 0,
            task_state: TaskState::Done,
            properties: HashMap::new(),
            property_failures: 0,
            locked_by: None,
            existing: false,
            credentials: json!({ "username": "admin", "password": "secret" }),
            sub_operation_response: json!({}),
            sub_operation_status: OperationStatus {
                state: OperationState::Succeeded,
                description: "sub-operation succeeded".to_string(),
            },
        }
    }
}

/// In-memory director backend.
///
/// Tasks report the configured [`TaskState`] (default `done`) for the
/// deployment they were submitted for.
#[derive(Debug, Clone, Default)]
pub struct FakeDirector {
    state: Arc<Mutex<DirectorState>>,
}

impl FakeDirector {
    /// Creates a director whose tasks complete immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded calls.
    pub fn calls(&self) -> Vec<DirectorCall> {
        self.state.lock().expect("lock").calls.clone()
    }

    /// Returns the names of all recorded calls.
    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls().iter().map(DirectorCall::name).collect()
    }

    /// Counts recorded calls with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.name() == name).count()
    }

    /// Sets the state reported by every task.
    pub fn set_task_state(&self, state: TaskState) {
        self.state.lock().expect("lock").task_state = state;
    }

    /// Fails the next `attempts` property writes with a transient error.
    pub fn fail_property_writes(&self, attempts: u32) {
        self.state.lock().expect("lock").property_failures = attempts;
    }

    /// Reports every deployment as locked by `holder`.
    pub fn lock_deployments(&self, holder: impl Into<String>) {
        self.state.lock().expect("lock").locked_by = Some(holder.into());
    }

    /// Rejects creates as already existing.
    pub fn reject_creates_as_existing(&self) {
        self.state.lock().expect("lock").existing = true;
    }

    /// Sets the response of sub-operation invocations.
    pub fn set_sub_operation_response(&self, response: Value) {
        self.state.lock().expect("lock").sub_operation_response = response;
    }

    /// Sets the reported sub-operation status.
    pub fn set_sub_operation_status(&self, status: OperationStatus) {
        self.state.lock().expect("lock").sub_operation_status = status;
    }

    /// Returns a stored property.
    pub fn property(&self, deployment: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .expect("lock")
            .properties
            .get(&(deployment.to_string(), key.to_string()))
            .cloned()
    }

    /// Stores a property directly.
    pub fn put_property(&self, deployment: &str, key: &str, value: &str) {
        self.state
            .lock()
            .expect("lock")
            .properties
            .insert((deployment.to_string(), key.to_string()), value.to_string());
    }

    fn record(&self, call: DirectorCall) {
        self.state.lock().expect("lock").calls.push(call);
    }

    fn submit(&self, deployment: &str) -> String {
        let mut state = self.state.lock().expect("lock");
        state.next_task += 1;
        let task_id = format!("task-{}", state.next_task);
        state.tasks.insert(task_id.clone(), deployment.to_string());
        task_id
    }
}

#[async_trait]
impl DirectorManager for FakeDirector {
    async fn create_or_update_deployment(
        &self,
        deployment: &str,
        request: &DeploymentRequest,
    ) -> Result<String> {
        self.record(DirectorCall::CreateOrUpdate {
            deployment: deployment.to_string(),
            request: request.clone(),
        });
        if self.state.lock().expect("lock").existing {
            return Err(Error::ServiceInstanceAlreadyExists(request.instance_guid.clone()));
        }
        Ok(self.submit(deployment))
    }

    async fn delete_deployment(&self, deployment: &str) -> Result<String> {
        self.record(DirectorCall::Delete {
            deployment: deployment.to_string(),
        });
        Ok(self.submit(deployment))
    }

    async fn get_task(&self, task_id: &str) -> Result<BackendTask> {
        self.record(DirectorCall::GetTask {
            task_id: task_id.to_string(),
        });
        let state = self.state.lock().expect("lock");
        let deployment = state.tasks.get(task_id).cloned().ok_or_else(|| {
            Error::Core(fabrik_core::Error::not_found("task", task_id))
        })?;
        Ok(BackendTask {
            state: state.task_state,
            timestamp: Utc::now(),
            result: Some(Value::String(format!("task {task_id} {}", state.task_state.as_str()))),
            deployment,
        })
    }

    async fn create_binding(&self, deployment: &str, binding: &BindingRequest) -> Result<Value> {
        self.record(DirectorCall::CreateBinding {
            deployment: deployment.to_string(),
            binding_id: binding.id.clone(),
        });
        Ok(self.state.lock().expect("lock").credentials.clone())
    }

    async fn delete_binding(&self, deployment: &str, binding_id: &str) -> Result<()> {
        self.record(DirectorCall::DeleteBinding {
            deployment: deployment.to_string(),
            binding_id: binding_id.to_string(),
        });
        Ok(())
    }

    async fn create_deployment_property(
        &self,
        deployment: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.record(DirectorCall::CreateProperty {
            deployment: deployment.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        });
        let mut state = self.state.lock().expect("lock");
        if state.property_failures > 0 {
            state.property_failures -= 1;
            return Err(Error::backend("director unavailable"));
        }
        state
            .properties
            .insert((deployment.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn get_deployment_property(&self, deployment: &str, key: &str) -> Result<Option<String>> {
        self.record(DirectorCall::GetProperty {
            deployment: deployment.to_string(),
            key: key.to_string(),
        });
        Ok(self.property(deployment, key))
    }

    async fn verify_deployment_lock_status(&self, deployment: &str) -> Result<()> {
        self.record(DirectorCall::VerifyLock {
            deployment: deployment.to_string(),
        });
        match self.state.lock().expect("lock").locked_by.clone() {
            Some(holder) => Err(Error::DeploymentLocked {
                deployment: deployment.to_string(),
                message: format!("locked by {holder}"),
            }),
            None => Ok(()),
        }
    }

    async fn invoke_sub_operation(&self, request: &SubOperationRequest) -> Result<Value> {
        self.record(DirectorCall::InvokeSubOperation(request.clone()));
        Ok(self.state.lock().expect("lock").sub_operation_response.clone())
    }

    async fn sub_operation_state(
        &self,
        name: &str,
        instance_guid: &str,
        _operation: &Value,
    ) -> Result<OperationStatus> {
        self.record(DirectorCall::SubOperationState {
            name: name.to_string(),
            instance_guid: instance_guid.to_string(),
        });
        Ok(self.state.lock().expect("lock").sub_operation_status.clone())
    }

    async fn delete_restore_file(&self, tenant_id: &str, instance_guid: &str) -> Result<()> {
        self.record(DirectorCall::DeleteRestoreFile {
            tenant_id: tenant_id.to_string(),
            instance_guid: instance_guid.to_string(),
        });
        Ok(())
    }
}

/// Backup service recording `(operation, options)` pairs.
#[derive(Debug, Default)]
pub struct RecordingBackupService {
    calls: Mutex<Vec<(&'static str, Value)>>,
    failure: Mutex<Option<String>>,
}

impl RecordingBackupService {
    /// Creates a service that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded calls.
    pub fn calls(&self) -> Vec<(&'static str, Value)> {
        self.calls.lock().expect("lock").clone()
    }

    /// Fails every later call with a backend error.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().expect("lock") = Some(message.into());
    }

    fn record(&self, operation: &'static str, options: &Value) -> Result<Value> {
        self.calls.lock().expect("lock").push((operation, options.clone()));
        if let Some(message) = self.failure.lock().expect("lock").clone() {
            return Err(Error::backend(message));
        }
        Ok(json!({
            "operation": operation,
            "guid": options.get("guid").cloned().unwrap_or(Value::Null),
        }))
    }
}

#[async_trait]
impl BackupService for RecordingBackupService {
    async fn start_backup(&self, options: &Value) -> Result<Value> {
        self.record("start_backup", options)
    }

    async fn abort_last_backup(&self, options: &Value) -> Result<Value> {
        self.record("abort_last_backup", options)
    }

    async fn delete_backup(&self, options: &Value) -> Result<()> {
        self.record("delete_backup", options).map(|_| ())
    }

    async fn start_restore(&self, options: &Value) -> Result<Value> {
        self.record("start_restore", options)
    }

    async fn abort_last_restore(&self, options: &Value) -> Result<Value> {
        self.record("abort_last_restore", options)
    }
}

/// Platform manager recording hook invocations.
#[derive(Debug)]
pub struct RecordingPlatformManager {
    platform: String,
    calls: Mutex<Vec<&'static str>>,
    tenant_id: Option<String>,
    fail_post_provision: Mutex<bool>,
}

impl RecordingPlatformManager {
    /// Creates a manager for the named platform with the given tenant id.
    pub fn new(platform: impl Into<String>, tenant_id: Option<&str>) -> Self {
        Self {
            platform: platform.into(),
            calls: Mutex::new(Vec::new()),
            tenant_id: tenant_id.map(str::to_string),
            fail_post_provision: Mutex::new(false),
        }
    }

    /// Returns the recorded hook names.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("lock").clone()
    }

    /// Fails post-provision hooks.
    pub fn fail_post_provision(&self) {
        *self.fail_post_provision.lock().expect("lock") = true;
    }

    fn record(&self, hook: &'static str) {
        self.calls.lock().expect("lock").push(hook);
    }
}

#[async_trait]
impl PlatformManager for RecordingPlatformManager {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn post_instance_provision_operations(&self, _hook: &PlatformHookContext) -> Result<()> {
        self.record("post_instance_provision_operations");
        if *self.fail_post_provision.lock().expect("lock") {
            return Err(Error::backend("security group creation failed"));
        }
        Ok(())
    }

    async fn pre_instance_delete_operations(&self, _hook: &PlatformHookContext) -> Result<()> {
        self.record("pre_instance_delete_operations");
        Ok(())
    }

    async fn post_instance_update_operations(&self, _hook: &PlatformHookContext) -> Result<()> {
        self.record("post_instance_update_operations");
        Ok(())
    }

    async fn ensure_tenant_id(&self, _hook: &PlatformHookContext) -> Result<Option<String>> {
        self.record("ensure_tenant_id");
        Ok(self.tenant_id.clone())
    }
}

/// Platform client recording instance updates.
#[derive(Debug, Default)]
pub struct RecordingPlatformClient {
    updates: Mutex<Vec<(String, InstanceUpdate, Option<String>)>>,
    in_progress: Mutex<bool>,
}

impl RecordingPlatformClient {
    /// Creates a client that accepts every update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects later updates with "operation in progress".
    pub fn reject_as_in_progress(&self) {
        *self.in_progress.lock().expect("lock") = true;
    }

    /// Returns `(instance_id, update, bearer)` for every accepted or rejected call.
    pub fn updates(&self) -> Vec<(String, InstanceUpdate, Option<String>)> {
        self.updates.lock().expect("lock").clone()
    }
}

#[async_trait]
impl PlatformClient for RecordingPlatformClient {
    async fn update_service_instance(
        &self,
        instance_id: &str,
        update: &InstanceUpdate,
        bearer: Option<&str>,
    ) -> Result<()> {
        self.updates.lock().expect("lock").push((
            instance_id.to_string(),
            update.clone(),
            bearer.map(str::to_string),
        ));
        if *self.in_progress.lock().expect("lock") {
            return Err(platform_error(
                Some(60016),
                Some("CF-AsyncServiceInstanceOperationInProgress"),
                Some("Another operation for this service instance is in progress."),
            ));
        }
        Ok(())
    }
}

/// In-memory store that can be told to fail writes.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryResourceStore,
    failing_result_writes: Mutex<u32>,
}

impl FaultyStore {
    /// Creates an empty store with no faults armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `writes` patches that set a status result.
    pub fn fail_result_writes(&self, writes: u32) {
        *self.failing_result_writes.lock().unwrap() = writes;
    }
}

#[async_trait]
impl ResourceStore for FaultyStore {
    async fn create(&self, resource: Resource) -> fabrik_core::Result<Resource> {
        self.inner.create(resource).await
    }

    async fn get(&self, reference: &ResourceRef) -> fabrik_core::Result<Resource> {
        self.inner.get(reference).await
    }

    async fn list(
        &self,
        resource_type: &ResourceType,
        namespace: &str,
    ) -> fabrik_core::Result<Vec<Resource>> {
        self.inner.list(resource_type, namespace).await
    }

    async fn patch(
        &self,
        reference: &ResourceRef,
        patch: ResourcePatch,
        precondition: PatchPrecondition,
    ) -> fabrik_core::Result<Resource> {
        if patch.result.is_some() {
            let mut failing = self.failing_result_writes.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(fabrik_core::Error::storage("injected write failure"));
            }
        }
        self.inner.patch(reference, patch, precondition).await
    }

    async fn delete(&self, reference: &ResourceRef) -> fabrik_core::Result<()> {
        self.inner.delete(reference).await
    }

    async fn watch(
        &self,
        resource_type: &ResourceType,
        namespace: &str,
    ) -> fabrik_core::Result<ResourceWatch> {
        self.inner.watch(resource_type, namespace).await
    }
}
