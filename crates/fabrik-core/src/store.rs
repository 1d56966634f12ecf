//! Resource store abstraction and the in-memory implementation.
//!
//! The store contract matches a watchable API server:
//! - CRUD by `(type, namespace, name)`
//! - Conditional patches that compare an annotation's previous value (CAS)
//! - A change stream per `(type, namespace)` carrying full resource snapshots
//!
//! ## Ordering
//!
//! For a single resource, change events are delivered in commit order.
//! Across resources there is no ordering guarantee.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{Error, Result};
use crate::resource::{ChangeEvent, ChangeKind, Resource, ResourceRef, ResourceState, ResourceType};

/// Default per-subscriber buffer for change events.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Section of a resource addressed by `get_key`/`update_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySection {
    /// `status.<key>`.
    Status,
    /// `metadata.annotations.<key>`.
    Annotations,
}

/// Precondition for a conditional patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PatchPrecondition {
    /// Apply unconditionally.
    #[default]
    None,
    /// Apply only if the annotation currently has exactly this value
    /// (`None` meaning the annotation is absent).
    AnnotationEquals {
        /// Annotation key.
        key: String,
        /// Expected current value.
        expected: Option<String>,
    },
}

/// A partial update to a resource.
///
/// Unset fields are left untouched. A `Value::Null` result or error clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePatch {
    /// Annotations to set (`Some`) or remove (`None`).
    pub annotations: BTreeMap<String, Option<String>>,
    /// New state.
    pub state: Option<ResourceState>,
    /// New last-operation description.
    pub last_operation: Option<String>,
    /// New result payload.
    pub result: Option<Value>,
    /// New error payload.
    pub error: Option<Value>,
    /// Additional status keys.
    pub status_keys: BTreeMap<String, Value>,
}

impl ResourcePatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state.
    #[must_use]
    pub fn state(mut self, state: ResourceState) -> Self {
        self.state = Some(state);
        self
    }

    /// Sets the last-operation description.
    #[must_use]
    pub fn last_operation(mut self, description: impl Into<String>) -> Self {
        self.last_operation = Some(description.into());
        self
    }

    /// Sets the result payload.
    #[must_use]
    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Sets the error payload.
    #[must_use]
    pub fn error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }

    /// Sets an annotation.
    #[must_use]
    pub fn set_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), Some(value.into()));
        self
    }

    /// Removes an annotation.
    #[must_use]
    pub fn remove_annotation(mut self, key: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), None);
        self
    }

    /// Sets an arbitrary status key.
    #[must_use]
    pub fn status_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.status_keys.insert(key.into(), value);
        self
    }

    /// Applies this patch to a resource in place.
    pub fn apply_to(self, resource: &mut Resource) {
        for (key, value) in self.annotations {
            match value {
                Some(value) => {
                    resource.metadata.annotations.insert(key, value);
                }
                None => {
                    resource.metadata.annotations.remove(&key);
                }
            }
        }
        if let Some(state) = self.state {
            resource.status.state = state;
        }
        if let Some(description) = self.last_operation {
            resource.status.last_operation = Some(description);
        }
        if let Some(result) = self.result {
            resource.status.result = (!result.is_null()).then_some(result);
        }
        if let Some(error) = self.error {
            resource.status.error = (!error.is_null()).then_some(error);
        }
        for (key, value) in self.status_keys {
            set_status_key(resource, &key, value);
        }
    }
}

fn set_status_key(resource: &mut Resource, key: &str, value: Value) {
    let status = &mut resource.status;
    match key {
        "state" => {
            if let Ok(state) = serde_json::from_value::<ResourceState>(value) {
                status.state = state;
            }
        }
        "lastOperation" | "lastoperation" => {
            status.last_operation = match value {
                Value::Null => None,
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            };
        }
        "result" => status.result = (!value.is_null()).then_some(value),
        "error" => status.error = (!value.is_null()).then_some(value),
        _ => {
            status.extra.insert(key.to_string(), value);
        }
    }
}

fn status_key(resource: &Resource, key: &str) -> Option<Value> {
    let status = &resource.status;
    match key {
        "state" => Some(Value::String(status.state.as_str().to_string())),
        "lastOperation" | "lastoperation" => status.last_operation.clone().map(Value::String),
        "result" => status.result.clone(),
        "error" => status.error.clone(),
        _ => status.extra.get(key).cloned(),
    }
}

/// An item delivered by a [`ResourceWatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A committed change.
    Change(ChangeEvent),
    /// The subscriber fell behind and `skipped` events were dropped.
    ///
    /// The watcher must re-list to recover the changes it missed.
    Resync {
        /// Number of dropped events, across all types and namespaces.
        skipped: u64,
    },
}

/// A subscription to changes of one `(type, namespace)`.
///
/// Wraps a broadcast receiver so any store implementation that fans out
/// events through a channel can hand out watches.
#[derive(Debug)]
pub struct ResourceWatch {
    receiver: broadcast::Receiver<ChangeEvent>,
    resource_type: ResourceType,
    namespace: String,
}

impl ResourceWatch {
    /// Creates a watch over a broadcast receiver, filtering by type and namespace.
    #[must_use]
    pub fn new(
        receiver: broadcast::Receiver<ChangeEvent>,
        resource_type: ResourceType,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            receiver,
            resource_type,
            namespace: namespace.into(),
        }
    }

    /// Waits for the next matching change, or a resync signal after lag.
    ///
    /// Returns `None` once the store has shut down.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.object.resource_type == self.resource_type
                        && event.object.metadata.namespace == self.namespace
                    {
                        return Some(WatchEvent::Change(event));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        resource_type = %self.resource_type,
                        namespace = %self.namespace,
                        skipped,
                        "watch lagged; resync required"
                    );
                    return Some(WatchEvent::Resync { skipped });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Typed access to the shared, watchable resource store.
///
/// Implementations must provide:
/// - `NotFound` for missing resources and `Conflict` on precondition failure
/// - Visibility of every committed mutation to all current watchers
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Creates a resource.
    ///
    /// Returns `Conflict` if a resource with the same address exists.
    async fn create(&self, resource: Resource) -> Result<Resource>;

    /// Reads a resource.
    async fn get(&self, reference: &ResourceRef) -> Result<Resource>;

    /// Lists all resources of a type in a namespace.
    async fn list(&self, resource_type: &ResourceType, namespace: &str) -> Result<Vec<Resource>>;

    /// Applies a patch, optionally guarded by a precondition.
    ///
    /// Returns `Conflict` if the precondition does not hold.
    async fn patch(
        &self,
        reference: &ResourceRef,
        patch: ResourcePatch,
        precondition: PatchPrecondition,
    ) -> Result<Resource>;

    /// Deletes a resource.
    async fn delete(&self, reference: &ResourceRef) -> Result<()>;

    /// Subscribes to changes of a resource type within a namespace.
    async fn watch(&self, resource_type: &ResourceType, namespace: &str) -> Result<ResourceWatch>;

    /// Reads one key of a resource section.
    async fn get_key(
        &self,
        reference: &ResourceRef,
        section: KeySection,
        key: &str,
    ) -> Result<Option<Value>> {
        let resource = self.get(reference).await?;
        Ok(match section {
            KeySection::Status => status_key(&resource, key),
            KeySection::Annotations => resource
                .annotation(key)
                .map(|v| Value::String(v.to_string())),
        })
    }

    /// Writes one key of a resource section unconditionally.
    async fn update_key(
        &self,
        reference: &ResourceRef,
        section: KeySection,
        key: &str,
        value: Value,
    ) -> Result<Resource> {
        let patch = match section {
            KeySection::Status => ResourcePatch::new().status_key(key, value),
            KeySection::Annotations => match value {
                Value::Null => ResourcePatch::new().remove_annotation(key),
                Value::String(s) => ResourcePatch::new().set_annotation(key, s),
                other => ResourcePatch::new().set_annotation(key, other.to_string()),
            },
        };
        self.patch(reference, patch, PatchPrecondition::None).await
    }

    /// Sets the state of a resource.
    async fn update_state(&self, reference: &ResourceRef, state: ResourceState) -> Result<Resource> {
        self.patch(
            reference,
            ResourcePatch::new().state(state),
            PatchPrecondition::None,
        )
        .await
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory resource store.
///
/// Thread-safe via `RwLock`; change events are broadcast while the write
/// lock is held so per-resource commit order is preserved for watchers.
/// Not durable. Used by tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryResourceStore {
    resources: RwLock<HashMap<ResourceRef, Resource>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_WATCH_CAPACITY)
    }
}

impl MemoryResourceStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new store with the given per-watcher buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            resources: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn publish(&self, kind: ChangeKind, object: &Resource) {
        // No receivers is not an error.
        let _ = self.events.send(ChangeEvent {
            kind,
            object: object.clone(),
        });
    }
}

fn check_precondition(resource: &Resource, precondition: &PatchPrecondition) -> Result<()> {
    match precondition {
        PatchPrecondition::None => Ok(()),
        PatchPrecondition::AnnotationEquals { key, expected } => {
            let current = resource.annotation(key);
            if current == expected.as_deref() {
                Ok(())
            } else {
                Err(Error::conflict(format!(
                    "annotation '{key}' on {} changed concurrently",
                    resource.metadata.self_link
                )))
            }
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn create(&self, mut resource: Resource) -> Result<Resource> {
        let reference = resource.reference();
        let mut resources = self.resources.write().map_err(poison_err)?;
        if resources.contains_key(&reference) {
            return Err(Error::conflict(format!("{reference} already exists")));
        }
        let now = Utc::now();
        resource.metadata.resource_version = 1;
        resource.metadata.creation_timestamp = now;
        resource.metadata.update_timestamp = now;
        resources.insert(reference, resource.clone());
        self.publish(ChangeKind::Added, &resource);
        drop(resources);
        Ok(resource)
    }

    async fn get(&self, reference: &ResourceRef) -> Result<Resource> {
        let resources = self.resources.read().map_err(poison_err)?;
        resources
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::not_found(&reference.resource_type.kind, &reference.name))
    }

    async fn list(&self, resource_type: &ResourceType, namespace: &str) -> Result<Vec<Resource>> {
        let resources = self.resources.read().map_err(poison_err)?;
        let mut matching: Vec<Resource> = resources
            .values()
            .filter(|r| &r.resource_type == resource_type && r.metadata.namespace == namespace)
            .cloned()
            .collect();
        drop(resources);
        matching.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(matching)
    }

    async fn patch(
        &self,
        reference: &ResourceRef,
        patch: ResourcePatch,
        precondition: PatchPrecondition,
    ) -> Result<Resource> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        let Some(resource) = resources.get_mut(reference) else {
            return Err(Error::not_found(&reference.resource_type.kind, &reference.name));
        };
        check_precondition(resource, &precondition)?;

        patch.apply_to(resource);
        resource.metadata.resource_version += 1;
        resource.metadata.update_timestamp = Utc::now();
        let updated = resource.clone();
        self.publish(ChangeKind::Modified, &updated);
        drop(resources);
        Ok(updated)
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<()> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        let Some(removed) = resources.remove(reference) else {
            return Err(Error::not_found(&reference.resource_type.kind, &reference.name));
        };
        self.publish(ChangeKind::Deleted, &removed);
        drop(resources);
        Ok(())
    }

    async fn watch(&self, resource_type: &ResourceType, namespace: &str) -> Result<ResourceWatch> {
        Ok(ResourceWatch::new(
            self.events.subscribe(),
            resource_type.clone(),
            namespace,
        ))
    }
}
