//! Resource documents held in the shared store.
//!
//! A [`Resource`] is addressed by `(type, namespace, name)` where the name is
//! a stable instance or operation guid. The document layout follows the
//! watchable API-server contract:
//!
//! ```json
//! {
//!   "metadata": { "name": "...", "selfLink": "...", "annotations": { ... } },
//!   "spec": { "options": "{\"guid\":\"...\",\"plan_id\":\"...\"}" },
//!   "status": { "state": "in_queue", "lastOperation": null, "result": null }
//! }
//! ```
//!
//! `spec.options` is a JSON-encoded string and is never mutated after creation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Namespace used when a request does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A resource group and kind, e.g. `backup.servicefabrik.io/defaultbackup`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceType {
    /// API group.
    pub group: String,
    /// Kind within the group (lowercase, singular).
    pub kind: String,
}

impl ResourceType {
    /// Creates a resource type from a group and kind.
    #[must_use]
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// Backup operations.
    #[must_use]
    pub fn default_backup() -> Self {
        Self::new("backup.servicefabrik.io", "defaultbackup")
    }

    /// Restore operations.
    #[must_use]
    pub fn default_restore() -> Self {
        Self::new("backup.servicefabrik.io", "defaultrestore")
    }

    /// Director-backed service instances.
    #[must_use]
    pub fn director() -> Self {
        Self::new("deployment.servicefabrik.io", "director")
    }

    /// Bindings on director-backed service instances.
    #[must_use]
    pub fn director_bind() -> Self {
        Self::new("bind.servicefabrik.io", "directorbind")
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.kind)
    }
}

/// Fully-qualified address of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    /// Resource type.
    pub resource_type: ResourceType,
    /// Namespace.
    pub namespace: String,
    /// Resource name (instance or operation guid).
    pub name: String,
}

impl ResourceRef {
    /// Creates a new resource reference.
    #[must_use]
    pub fn new(
        resource_type: ResourceType,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns the API self-link for this resource.
    #[must_use]
    pub fn self_link(&self) -> String {
        format!(
            "/apis/{}/v1alpha1/namespaces/{}/{}s/{}",
            self.resource_type.group, self.namespace, self.resource_type.kind, self.name
        )
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource_type, self.namespace, self.name)
    }
}

/// Processing state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Accepted and waiting for a controller.
    InQueue,
    /// Dispatched to the backend; not yet terminal.
    InProgress,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed,
    /// User requested an abort.
    Abort,
    /// Abort was forwarded to the backend.
    Aborting,
    /// Backend confirmed the abort.
    Aborted,
    /// User requested deletion.
    Delete,
}

impl ResourceState {
    /// Returns true if no controller will act on this state again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Returns the wire label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InQueue => "in_queue",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Abort => "abort",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    /// Resource name (guid).
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// API self-link.
    pub self_link: String,
    /// Free-form annotations, including coordination keys such as the lock.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Monotonic version, bumped on every mutation.
    #[serde(default)]
    pub resource_version: u64,
    /// Creation timestamp.
    pub creation_timestamp: DateTime<Utc>,
    /// Last mutation timestamp.
    pub update_timestamp: DateTime<Utc>,
}

/// Immutable request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// JSON-encoded request options.
    pub options: String,
}

/// Mutable processing status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Current state.
    pub state: ResourceState,
    /// Human-readable description of the last observed operation state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,
    /// Terminal or intermediate result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Additional status keys written through `update_key`.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ResourceStatus {
    /// Creates a status in the given state with no payloads.
    #[must_use]
    pub fn new(state: ResourceState) -> Self {
        Self {
            state,
            last_operation: None,
            result: None,
            error: None,
            extra: BTreeMap::new(),
        }
    }
}

/// A resource document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Metadata.
    pub metadata: ResourceMetadata,
    /// Request payload.
    pub spec: ResourceSpec,
    /// Processing status.
    pub status: ResourceStatus,
    /// Resource type, carried alongside the document for routing.
    #[serde(rename = "resourceType")]
    pub resource_type: ResourceType,
}

impl Resource {
    /// Builds a new resource in `in_queue` state from serializable options.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the options cannot be encoded.
    pub fn new<T: Serialize>(reference: &ResourceRef, options: &T) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            metadata: ResourceMetadata {
                name: reference.name.clone(),
                namespace: reference.namespace.clone(),
                self_link: reference.self_link(),
                annotations: BTreeMap::new(),
                resource_version: 0,
                creation_timestamp: now,
                update_timestamp: now,
            },
            spec: ResourceSpec {
                options: serde_json::to_string(options)?,
            },
            status: ResourceStatus::new(ResourceState::InQueue),
            resource_type: reference.resource_type.clone(),
        })
    }

    /// Sets the initial state (builder style).
    #[must_use]
    pub fn with_state(mut self, state: ResourceState) -> Self {
        self.status.state = state;
        self
    }

    /// Sets an annotation (builder style).
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    /// Returns the address of this resource.
    #[must_use]
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(
            self.resource_type.clone(),
            self.metadata.namespace.clone(),
            self.metadata.name.clone(),
        )
    }

    /// Returns the resource name (guid).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ResourceState {
        self.status.state
    }

    /// Returns an annotation value.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    /// Decodes `spec.options` into a typed value.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadRequest` if the options are not valid for `T`.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.spec.options).map_err(|e| {
            Error::BadRequest(format!(
                "invalid options on {}: {e}",
                self.metadata.self_link
            ))
        })
    }

    /// Decodes `spec.options` as an untyped JSON value.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadRequest` if the options are not JSON.
    pub fn options_value(&self) -> Result<Value> {
        self.options()
    }
}

/// Kind of change delivered by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Resource was created.
    Added,
    /// Resource was mutated.
    Modified,
    /// Resource was deleted.
    Deleted,
}

/// A change event carrying the full resource as of the committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Resource snapshot.
    pub object: Resource,
}
