//! In-memory description of one lifecycle action and its progress.

use std::fmt;

use chrono::SecondsFormat;
use fabrik_core::resource::ResourceState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::{BackendTask, TaskState};

/// Lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Provision an instance.
    Create,
    /// Update an instance or run a sub-operation.
    Update,
    /// Deprovision an instance.
    Delete,
    /// Create a binding.
    Bind,
    /// Delete a binding.
    Unbind,
    /// Back up an instance.
    Backup,
    /// Restore an instance.
    Restore,
}

impl OperationType {
    /// Returns the lowercase label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }

    /// Returns the capitalised label used in descriptions.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Bind => "Bind",
            Self::Unbind => "Unbind",
            Self::Backup => "Backup",
            Self::Restore => "Restore",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OperationState {
    /// Still running.
    #[default]
    #[serde(rename = "in progress")]
    InProgress,
    /// Completed successfully.
    #[serde(rename = "succeeded")]
    Succeeded,
    /// Completed with an error.
    #[serde(rename = "failed")]
    Failed,
}

impl OperationState {
    /// Maps a backend task state.
    ///
    /// `done` succeeds; `error`, `cancelled` and `timeout` fail; everything
    /// else is still in progress.
    #[must_use]
    pub const fn from_task_state(state: TaskState) -> Self {
        match state {
            TaskState::Done => Self::Succeeded,
            TaskState::Error | TaskState::Cancelled | TaskState::Timeout => Self::Failed,
            TaskState::Queued | TaskState::Processing => Self::InProgress,
        }
    }

    /// Returns true once the operation will not change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Returns the resource state reflecting this operation state.
    #[must_use]
    pub const fn resource_state(&self) -> ResourceState {
        match self {
            Self::InProgress => ResourceState::InProgress,
            Self::Succeeded => ResourceState::Succeeded,
            Self::Failed => ResourceState::Failed,
        }
    }

    /// Returns the wire label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State and description reported for an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Observed state.
    pub state: OperationState,
    /// Human-readable description.
    pub description: String,
}

/// An operation driven by the instance lifecycle.
///
/// Persisted as `status.result.response` of the instance resource so the
/// poller can resume from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Action.
    #[serde(rename = "type")]
    pub kind: OperationType,
    /// Backend task id, for task-backed actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Sub-operation name, for token-carried updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Request parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    /// Platform context.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
    /// Initiating user of a sub-operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Initiating user email of a sub-operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub useremail: Option<String>,
    /// Observed state.
    #[serde(default)]
    pub state: OperationState,
    /// Description of the observed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Fields returned by a sub-operation invocation.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl Operation {
    /// Creates a fresh operation of the given kind.
    #[must_use]
    pub fn new(kind: OperationType) -> Self {
        Self {
            kind,
            task_id: None,
            subtype: None,
            parameters: Value::Null,
            context: Value::Null,
            username: None,
            useremail: None,
            state: OperationState::InProgress,
            description: None,
            details: Map::new(),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        OperationStatus {
            state: self.state,
            description: self.description.clone().unwrap_or_default(),
        }
    }

    /// Updates state and description from a backend task.
    pub fn set_state_from_task(&mut self, task: &BackendTask) {
        let action = self.kind.action();
        let timestamp = task.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        self.state = OperationState::from_task_state(task.state);
        self.description = Some(match self.state {
            OperationState::Succeeded => {
                format!("{action} deployment {} succeeded at {timestamp}", task.deployment)
            }
            OperationState::Failed => {
                let reason = match &task.result {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                format!(
                    "{action} deployment {} failed at {timestamp} with Error \"{reason}\"",
                    task.deployment
                )
            }
            OperationState::InProgress => {
                format!("{action} deployment {} is still in progress", task.deployment)
            }
        });
    }

    /// Demotes the operation to failed with a description.
    pub fn fail(&mut self, description: impl Into<String>) {
        self.state = OperationState::Failed;
        self.description = Some(description.into());
    }

    /// Applies a status reported by the backend.
    pub fn apply_status(&mut self, status: OperationStatus) {
        self.state = status.state;
        self.description = Some(status.description);
    }
}
