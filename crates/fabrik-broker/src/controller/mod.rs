//! Per resource-type reconciliation.
//!
//! For every matching change event the [`OperationController`]:
//!
//! 1. acquires the resource lock (a live holder means another broker is on it)
//! 2. re-reads the resource and re-checks its state against the predicate
//! 3. dispatches to the type's [`ResourceHandler`]
//! 4. records the outcome in `status` (result, error, next state)
//! 5. releases the lock, whatever happened in 3 and 4
//!
//! Handler failures, including panics, are recorded as `failed` with the
//! error payload. Conflicts leave the resource untouched and park it: events
//! for a parked resource are skipped without taking the lock until its state
//! or options change, or until [`CONFLICT_RETRY_AFTER`] has passed. Lock
//! traffic alone therefore never re-drives a conflicting handler.

pub mod backup;
pub mod bind;
pub mod deployment;
pub mod restore;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fabrik_core::lock::ResourceLock;
use fabrik_core::observability::resource_span;
use fabrik_core::resource::{Resource, ResourceState, ResourceType};
use fabrik_core::store::{KeySection, PatchPrecondition, ResourcePatch, ResourceStore};
use serde_json::{Value, json};
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::metrics::BrokerMetrics;
use crate::watcher::{ChangeHandler, StatePredicate, Watcher};

/// How long a resource stays parked after a conflict.
pub const CONFLICT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Status key under which handlers remember the options an operation ran with.
pub const OPTIONS_STATUS_KEY: &str = "options";

/// Wraps a response in the `{response, error}` result envelope.
#[must_use]
pub fn result_envelope(response: Value) -> Value {
    json!({ "response": response, "error": Value::Null })
}

/// Wraps an error in the `{response, error}` result envelope.
#[must_use]
pub fn error_envelope(error: &Error) -> Value {
    json!({ "response": Value::Null, "error": error.to_payload() })
}

/// Returns the options an operation was started with.
///
/// Prefers the `options` status key written when the operation started and
/// falls back to `spec.options`.
///
/// # Errors
///
/// Returns an error if neither source holds JSON options.
pub async fn operation_options<S>(store: &S, resource: &Resource) -> Result<Value>
where
    S: ResourceStore + ?Sized,
{
    let reference = resource.reference();
    match store
        .get_key(&reference, KeySection::Status, OPTIONS_STATUS_KEY)
        .await?
    {
        Some(Value::String(raw)) => Ok(serde_json::from_str(&raw).map_err(fabrik_core::Error::from)?),
        Some(value) if !value.is_null() => Ok(value),
        _ => Ok(resource.options_value()?),
    }
}

/// Reconciliation logic for one resource type.
#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    /// Short handler name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Resource type handled.
    fn resource_type(&self) -> ResourceType;

    /// States that warrant action.
    fn predicate(&self) -> StatePredicate;

    /// Performs the backend action for the resource's current state.
    async fn process(&self, resource: &Resource) -> Result<HandlerOutcome>;
}

/// What a handler wants recorded on the resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    /// Next state.
    pub state: Option<ResourceState>,
    /// Result envelope.
    pub result: Option<Value>,
    /// Additional status keys.
    pub status: BTreeMap<String, Value>,
    /// The handler deleted the resource; nothing is written.
    pub resource_deleted: bool,
}

impl HandlerOutcome {
    /// Moves the resource to `state`.
    #[must_use]
    pub fn transition(state: ResourceState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// The resource no longer exists.
    #[must_use]
    pub fn deleted() -> Self {
        Self {
            resource_deleted: true,
            ..Self::default()
        }
    }

    /// Records `response` in the result envelope.
    #[must_use]
    pub fn with_response(mut self, response: Value) -> Self {
        self.result = Some(result_envelope(response));
        self
    }

    /// Records a raw result value.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Records an additional status key.
    #[must_use]
    pub fn with_status_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.status.insert(key.into(), value);
        self
    }

    /// Returns true if there is nothing to record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.result.is_none() && self.status.is_empty()
    }

    fn into_patch(self) -> ResourcePatch {
        let mut patch = ResourcePatch::new();
        patch.state = self.state;
        patch.result = self.result;
        patch.status_keys = self.status;
        patch
    }
}

/// Why an event was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The snapshot's state is not watched.
    StateNotWatched,
    /// A live owner holds the lock.
    Locked,
    /// The resource no longer exists.
    Gone,
    /// The state changed between event and lock acquisition.
    StateChanged,
    /// A concurrent external operation blocked the action.
    Conflict,
    /// The resource is parked after a conflict and has not changed since.
    Unchanged,
}

impl SkipReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::StateNotWatched => "state_not_watched",
            Self::Locked => "locked",
            Self::Gone => "gone",
            Self::StateChanged => "state_changed",
            Self::Conflict => "conflict",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Result of handling one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The handler ran and its outcome was recorded.
    Processed,
    /// The handler failed; the failure was recorded.
    Failed,
    /// Nothing was done.
    Skipped(SkipReason),
}

/// Drives one [`ResourceHandler`] under the resource lock.
pub struct OperationController<S: ResourceStore + ?Sized> {
    store: Arc<S>,
    lock: ResourceLock<S>,
    handler: Arc<dyn ResourceHandler>,
    metrics: BrokerMetrics,
    // Resources parked after a conflict, keyed by reference, with the
    // fingerprint and time they were parked at.
    parked: Mutex<HashMap<String, (String, Instant)>>,
    retry_after: Duration,
}

// State and options; lock annotations and status writes leave it unchanged.
fn fingerprint(resource: &Resource) -> String {
    format!("{}:{}", resource.state(), resource.spec.options)
}

impl<S: ResourceStore + ?Sized> fmt::Debug for OperationController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationController")
            .field("handler", &self.handler.name())
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl<S: ResourceStore + ?Sized> OperationController<S> {
    /// Creates a controller.
    #[must_use]
    pub fn new(store: Arc<S>, lock: ResourceLock<S>, handler: Arc<dyn ResourceHandler>) -> Self {
        Self {
            store,
            lock,
            handler,
            metrics: BrokerMetrics::new(),
            parked: Mutex::new(HashMap::new()),
            retry_after: CONFLICT_RETRY_AFTER,
        }
    }

    /// Overrides how long a conflicting resource stays parked.
    #[must_use]
    pub fn with_conflict_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Returns a watcher feeding this controller.
    #[must_use]
    pub fn watcher(&self, namespace: &str) -> Watcher<S> {
        Watcher::new(
            Arc::clone(&self.store),
            self.handler.resource_type(),
            namespace,
            self.handler.predicate(),
        )
    }

    /// Handles one change event.
    ///
    /// # Errors
    ///
    /// Returns an error only when the lock itself cannot be evaluated; every
    /// failure after acquisition is recorded on the resource instead.
    pub async fn handle_event(&self, snapshot: &Resource) -> Result<EventOutcome> {
        let handler_name = self.handler.name();
        let predicate = self.handler.predicate();
        if !predicate.matches(snapshot.state()) {
            return Ok(self.skipped(SkipReason::StateNotWatched));
        }

        let reference = snapshot.reference();
        if self.is_parked(&reference.to_string(), snapshot) {
            tracing::debug!(resource = %reference, "unchanged since conflict; skipping");
            return Ok(self.skipped(SkipReason::Unchanged));
        }

        let acquired = match self
            .lock
            .acquire_with_operation(&reference, Some(snapshot.state().to_string()))
            .await
        {
            Ok(acquired) => acquired,
            Err(e) if e.is_not_found() => {
                self.metrics.record_lock(handler_name, "gone");
                return Ok(self.skipped(SkipReason::Gone));
            }
            Err(e) => {
                self.metrics.record_lock(handler_name, "error");
                return Err(e.into());
            }
        };
        if !acquired {
            self.metrics.record_lock(handler_name, "held");
            tracing::debug!(resource = %reference, "already being processed");
            return Ok(self.skipped(SkipReason::Locked));
        }
        self.metrics.record_lock(handler_name, "acquired");

        let outcome = self.process_locked(snapshot).await;
        self.lock.release(&reference).await;

        let outcome = outcome?;
        if !matches!(outcome, EventOutcome::Skipped(SkipReason::Conflict)) {
            self.parked_map().remove(&reference.to_string());
        }
        let label = match outcome {
            EventOutcome::Processed => "processed",
            EventOutcome::Failed => "failed",
            EventOutcome::Skipped(reason) => reason.as_str(),
        };
        self.metrics.record_event(handler_name, label);
        Ok(outcome)
    }

    async fn process_locked(&self, snapshot: &Resource) -> Result<EventOutcome> {
        let reference = snapshot.reference();
        let current = match self.store.get(&reference).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => return Ok(EventOutcome::Skipped(SkipReason::Gone)),
            Err(e) => return Err(e.into()),
        };
        if !self.handler.predicate().matches(current.state()) {
            tracing::debug!(
                resource = %reference,
                event_state = %snapshot.state(),
                current_state = %current.state(),
                "state changed since event; skipping"
            );
            return Ok(EventOutcome::Skipped(SkipReason::StateChanged));
        }

        let current_fingerprint = fingerprint(&current);
        let span = resource_span(
            current.state().as_str(),
            &reference.resource_type.kind,
            &reference.name,
        );
        let handler = Arc::clone(&self.handler);
        let started = Instant::now();
        let dispatched = tokio::spawn(
            async move { handler.process(&current).await }.instrument(span),
        )
        .await
        .unwrap_or_else(|e| Err(Error::backend(format!("handler task failed: {e}"))));
        self.metrics
            .observe_dispatch(self.handler.name(), started.elapsed());

        match dispatched {
            Ok(outcome) if outcome.resource_deleted => {
                tracing::info!(resource = %reference, "resource deleted by handler");
                Ok(EventOutcome::Processed)
            }
            Ok(outcome) if outcome.is_empty() => {
                tracing::info!(resource = %reference, "resource dispatched");
                Ok(EventOutcome::Processed)
            }
            Ok(outcome) => {
                let next_state = outcome.state;
                self.record(&reference, outcome.into_patch()).await;
                tracing::info!(resource = %reference, next_state = ?next_state, "resource processed");
                Ok(EventOutcome::Processed)
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!(resource = %reference, error = %e, "conflict; parked until the resource changes");
                // Parked before the lock release so its event finds the entry.
                self.parked_map()
                    .insert(reference.to_string(), (current_fingerprint, Instant::now()));
                Ok(EventOutcome::Skipped(SkipReason::Conflict))
            }
            Err(e) => {
                tracing::error!(resource = %reference, error = %e, "handler failed");
                let patch = ResourcePatch::new()
                    .state(ResourceState::Failed)
                    .error(e.to_payload());
                self.record(&reference, patch).await;
                Ok(EventOutcome::Failed)
            }
        }
    }

    async fn record(&self, reference: &fabrik_core::resource::ResourceRef, patch: ResourcePatch) {
        if let Err(e) = self
            .store
            .patch(reference, patch, PatchPrecondition::None)
            .await
        {
            tracing::error!(resource = %reference, error = %e, "failed to record outcome");
        }
    }

    fn parked_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_parked(&self, key: &str, snapshot: &Resource) -> bool {
        let mut parked = self.parked_map();
        let still_parked = match parked.get(key) {
            Some((at, since)) => *at == fingerprint(snapshot) && since.elapsed() < self.retry_after,
            None => return false,
        };
        if !still_parked {
            parked.remove(key);
        }
        still_parked
    }

    fn skipped(&self, reason: SkipReason) -> EventOutcome {
        self.metrics.record_event(self.handler.name(), reason.as_str());
        EventOutcome::Skipped(reason)
    }
}

#[async_trait]
impl<S: ResourceStore + ?Sized> ChangeHandler for OperationController<S> {
    async fn on_change(&self, resource: Resource) -> Result<()> {
        self.handle_event(&resource).await.map(|_| ())
    }
}
