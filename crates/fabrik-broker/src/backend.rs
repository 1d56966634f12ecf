//! Capability interfaces of the deployment backend.
//!
//! These are the seams where the controller meets external systems: the
//! director that executes deployment tasks, the backup service of a plan,
//! and the network segment pool. Implementations are supplied through the
//! [`ServiceRegistry`](crate::registry::ServiceRegistry).

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::lifecycle::operation::OperationStatus;

/// Prefix of every director deployment name.
pub const DEPLOYMENT_NAME_PREFIX: &str = "service-fabrik";

/// Deployment property holding the platform context.
pub const PLATFORM_CONTEXT_KEY: &str = "platform-context";

/// Builds the deployment name for an instance.
///
/// ```rust
/// use fabrik_broker::backend::deployment_name;
///
/// assert_eq!(deployment_name(7, "abc"), "service-fabrik-0007-abc");
/// ```
#[must_use]
pub fn deployment_name(network_segment_index: u32, instance_guid: &str) -> String {
    format!("{DEPLOYMENT_NAME_PREFIX}-{network_segment_index:04}-{instance_guid}")
}

/// Splits a deployment name into its network segment index and instance guid.
#[must_use]
pub fn parse_deployment_name(name: &str) -> Option<(u32, &str)> {
    let rest = name.strip_prefix(DEPLOYMENT_NAME_PREFIX)?.strip_prefix('-')?;
    let (index, guid) = rest.split_once('-')?;
    let index = index.parse().ok()?;
    (!guid.is_empty()).then_some((index, guid))
}

/// State of a backend task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for a worker.
    Queued,
    /// Running.
    Processing,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Error,
    /// Cancelled.
    Cancelled,
    /// Timed out.
    Timeout,
}

impl TaskState {
    /// Returns the wire label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

/// Status of a backend task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendTask {
    /// Task state.
    pub state: TaskState,
    /// Time of the last state change.
    pub timestamp: DateTime<Utc>,
    /// Result or error text reported by the backend.
    #[serde(default)]
    pub result: Option<Value>,
    /// Deployment the task belongs to.
    pub deployment: String,
}

/// Request to create or update a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Instance guid.
    pub instance_guid: String,
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
    /// Plan id before an update.
    #[serde(default)]
    pub previous_plan_id: Option<String>,
    /// Arguments carried by an operation token for a plain update.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Request to create a binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRequest {
    /// Binding id.
    pub id: String,
    /// Binding parameters.
    #[serde(default)]
    pub parameters: Value,
}

/// Request to run a named sub-operation on a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubOperationRequest {
    /// Sub-operation name.
    pub name: String,
    /// Invocation guid from the operation token.
    pub guid: String,
    /// Instance guid.
    pub instance_guid: String,
    /// Deployment name.
    pub deployment: String,
    /// Plan id before the update.
    #[serde(default)]
    pub plan_id: Option<String>,
    /// Service id before the update.
    #[serde(default)]
    pub service_id: Option<String>,
    /// Platform context.
    #[serde(default)]
    pub context: Value,
    /// Sub-operation arguments.
    #[serde(default)]
    pub arguments: Value,
    /// Initiating user.
    #[serde(default)]
    pub username: Option<String>,
    /// Initiating user email.
    #[serde(default)]
    pub useremail: Option<String>,
}

/// The deployment backend for director-managed plans.
#[async_trait]
pub trait DirectorManager: Send + Sync {
    /// Submits a create-or-update task and returns its id.
    async fn create_or_update_deployment(
        &self,
        deployment: &str,
        request: &DeploymentRequest,
    ) -> Result<String>;

    /// Submits a delete task and returns its id.
    async fn delete_deployment(&self, deployment: &str) -> Result<String>;

    /// Fetches task status. Unknown tasks are `NotFound`.
    async fn get_task(&self, task_id: &str) -> Result<BackendTask>;

    /// Creates a binding and returns its credentials.
    async fn create_binding(&self, deployment: &str, binding: &BindingRequest) -> Result<Value>;

    /// Deletes a binding.
    async fn delete_binding(&self, deployment: &str, binding_id: &str) -> Result<()>;

    /// Stores a deployment property.
    async fn create_deployment_property(&self, deployment: &str, key: &str, value: &str)
    -> Result<()>;

    /// Reads a deployment property; `None` if it was never written.
    async fn get_deployment_property(&self, deployment: &str, key: &str) -> Result<Option<String>>;

    /// Fails with `DeploymentLocked` if another operation holds the deployment.
    async fn verify_deployment_lock_status(&self, deployment: &str) -> Result<()>;

    /// Runs a named sub-operation; the returned object is merged into the operation.
    async fn invoke_sub_operation(&self, request: &SubOperationRequest) -> Result<Value>;

    /// Reports the state of a previously invoked sub-operation.
    async fn sub_operation_state(
        &self,
        name: &str,
        instance_guid: &str,
        operation: &Value,
    ) -> Result<OperationStatus>;

    /// Deletes the restore file kept for an instance.
    async fn delete_restore_file(&self, tenant_id: &str, instance_guid: &str) -> Result<()>;
}

/// Backup and restore service of a plan.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Starts a backup; returns the backend's response.
    async fn start_backup(&self, options: &Value) -> Result<Value>;

    /// Aborts the last backup of the instance named in the options.
    async fn abort_last_backup(&self, options: &Value) -> Result<Value>;

    /// Deletes a backup.
    async fn delete_backup(&self, options: &Value) -> Result<()>;

    /// Starts a restore; returns the backend's response.
    async fn start_restore(&self, options: &Value) -> Result<Value>;

    /// Aborts the last restore of the instance named in the options.
    async fn abort_last_restore(&self, options: &Value) -> Result<Value>;
}

/// Assigns network segment indexes to instance guids.
#[async_trait]
pub trait NetworkSegmentAllocator: Send + Sync {
    /// Assigns a fresh index to the guid, or returns the one it already has.
    async fn acquire(&self, instance_guid: &str) -> Result<u32>;

    /// Looks up the guid's index. Unknown guids are `NotFound`.
    async fn find(&self, instance_guid: &str) -> Result<u32>;

    /// Returns the guid's index to the pool.
    async fn release(&self, instance_guid: &str) -> Result<()>;
}

/// In-memory segment pool handing out the lowest free index in a range.
#[derive(Debug)]
pub struct InMemoryNetworkSegments {
    range: Range<u32>,
    assigned: Mutex<BTreeMap<String, u32>>,
}

impl InMemoryNetworkSegments {
    /// Creates a pool over `range`.
    #[must_use]
    pub fn new(range: Range<u32>) -> Self {
        Self {
            range,
            assigned: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, u32>>> {
        self.assigned
            .lock()
            .map_err(|_| Error::backend("network segment pool poisoned"))
    }
}

impl Default for InMemoryNetworkSegments {
    fn default() -> Self {
        Self::new(1..1024)
    }
}

#[async_trait]
impl NetworkSegmentAllocator for InMemoryNetworkSegments {
    async fn acquire(&self, instance_guid: &str) -> Result<u32> {
        let mut assigned = self.lock()?;
        if let Some(index) = assigned.get(instance_guid) {
            return Ok(*index);
        }
        let index = self
            .range
            .clone()
            .find(|candidate| !assigned.values().any(|used| used == candidate))
            .ok_or_else(|| Error::backend("no free network segment"))?;
        assigned.insert(instance_guid.to_string(), index);
        drop(assigned);
        tracing::debug!(instance = instance_guid, index, "network segment acquired");
        Ok(index)
    }

    async fn find(&self, instance_guid: &str) -> Result<u32> {
        self.lock()?.get(instance_guid).copied().ok_or_else(|| {
            Error::Core(fabrik_core::Error::not_found(
                "network segment",
                instance_guid,
            ))
        })
    }

    async fn release(&self, instance_guid: &str) -> Result<()> {
        self.lock()?.remove(instance_guid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_names_parse_back() {
        let name = deployment_name(12, "b4719e7c-e8d3-4f7f-c515-769ad1c3ebfa");
        assert_eq!(name, "service-fabrik-0012-b4719e7c-e8d3-4f7f-c515-769ad1c3ebfa");
        assert_eq!(
            parse_deployment_name(&name),
            Some((12, "b4719e7c-e8d3-4f7f-c515-769ad1c3ebfa"))
        );
        assert_eq!(parse_deployment_name("other-0012-x"), None);
        assert_eq!(parse_deployment_name("service-fabrik-abcd-x"), None);
    }

    #[tokio::test]
    async fn segments_are_lowest_free_and_stable() -> Result<()> {
        let pool = InMemoryNetworkSegments::new(1..4);
        assert_eq!(pool.acquire("a").await?, 1);
        assert_eq!(pool.acquire("b").await?, 2);
        assert_eq!(pool.acquire("a").await?, 1);
        assert_eq!(pool.find("b").await?, 2);

        pool.release("a").await?;
        assert_eq!(pool.acquire("c").await?, 1);
        assert_eq!(pool.acquire("d").await?, 3);
        assert!(pool.acquire("e").await.is_err());
        assert!(pool.find("a").await.unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn task_state_labels() {
        let state: TaskState = serde_json::from_str("\"cancelled\"").expect("parse");
        assert_eq!(state, TaskState::Cancelled);
        assert_eq!(TaskState::Processing.as_str(), "processing");
    }
}
