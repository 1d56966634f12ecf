//! Change-stream watcher with a state predicate.
//!
//! A [`Watcher`] subscribes to one `(type, namespace)` stream and hands every
//! event whose new state matches its predicate to a [`ChangeHandler`]. Each
//! matching event is handled on its own task, so distinct resources are
//! processed concurrently. On start the watcher also replays the matching
//! resources that already exist, which covers changes committed while no
//! broker was watching. The same replay runs whenever the subscription
//! lags and drops events.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use fabrik_core::resource::{ChangeKind, Resource, ResourceState, ResourceType};
use fabrik_core::store::{ResourceStore, WatchEvent};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::error::Result;

/// Set of states a watcher reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePredicate {
    states: Vec<ResourceState>,
}

impl StatePredicate {
    /// Matches any of the given states.
    #[must_use]
    pub fn any_of(states: impl IntoIterator<Item = ResourceState>) -> Self {
        Self {
            states: states.into_iter().collect(),
        }
    }

    /// Returns true if the state matches.
    #[must_use]
    pub fn matches(&self, state: ResourceState) -> bool {
        self.states.contains(&state)
    }
}

impl fmt::Display for StatePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.states.iter().map(ResourceState::as_str).collect();
        write!(f, "state in ({})", labels.join(","))
    }
}

/// Receives matching resource snapshots.
#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    /// Handles one matching snapshot. Errors are logged by the watcher.
    async fn on_change(&self, resource: Resource) -> Result<()>;
}

/// Subscribes to a resource type's change stream.
pub struct Watcher<S: ResourceStore + ?Sized> {
    store: Arc<S>,
    resource_type: ResourceType,
    namespace: String,
    predicate: StatePredicate,
}

impl<S: ResourceStore + ?Sized> fmt::Debug for Watcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("resource_type", &self.resource_type)
            .field("namespace", &self.namespace)
            .field("predicate", &self.predicate)
            .finish_non_exhaustive()
    }
}

impl<S: ResourceStore + ?Sized> Watcher<S> {
    /// Creates a watcher.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        resource_type: ResourceType,
        namespace: impl Into<String>,
        predicate: StatePredicate,
    ) -> Self {
        Self {
            store,
            resource_type,
            namespace: namespace.into(),
            predicate,
        }
    }

    /// Returns the predicate.
    #[must_use]
    pub fn predicate(&self) -> &StatePredicate {
        &self.predicate
    }

    /// Runs until `shutdown` flips to true or the stream ends.
    ///
    /// In-flight handlers are awaited before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial subscription or listing fails.
    pub async fn run(
        self,
        handler: Arc<dyn ChangeHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        // Subscribe before listing so nothing committed in between is missed.
        let mut stream = self.store.watch(&self.resource_type, &self.namespace).await?;
        let existing = self.store.list(&self.resource_type, &self.namespace).await?;

        tracing::info!(
            resource_type = %self.resource_type,
            namespace = %self.namespace,
            predicate = %self.predicate,
            existing = existing.len(),
            "watcher started"
        );

        let mut tasks = JoinSet::new();
        let mut resync_pending = false;
        for resource in existing {
            self.dispatch(&mut tasks, &handler, resource);
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = stream.next() => {
                    match event {
                        Some(WatchEvent::Change(event)) => {
                            if event.kind != ChangeKind::Deleted {
                                self.dispatch(&mut tasks, &handler, event.object);
                            }
                            if resync_pending && self.resync(&mut tasks, &handler, 0).await {
                                resync_pending = false;
                            }
                        }
                        Some(WatchEvent::Resync { skipped }) => {
                            resync_pending = !self.resync(&mut tasks, &handler, skipped).await;
                        }
                        None => {
                            tracing::warn!(resource_type = %self.resource_type, "change stream closed");
                            break;
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        tracing::info!(resource_type = %self.resource_type, "watcher stopped");
        Ok(())
    }

    // Dropped events are recovered from the current listing; replaying a
    // resource that was already handled is a no-op for the controller.
    // Returns false if the listing failed and must be retried.
    async fn resync(
        &self,
        tasks: &mut JoinSet<()>,
        handler: &Arc<dyn ChangeHandler>,
        skipped: u64,
    ) -> bool {
        match self.store.list(&self.resource_type, &self.namespace).await {
            Ok(resources) => {
                tracing::info!(
                    resource_type = %self.resource_type,
                    skipped,
                    listed = resources.len(),
                    "resyncing after lag"
                );
                for resource in resources {
                    self.dispatch(tasks, handler, resource);
                }
                true
            }
            Err(e) => {
                tracing::error!(
                    resource_type = %self.resource_type,
                    error = %e,
                    "resync listing failed; retrying on next change"
                );
                false
            }
        }
    }

    fn dispatch(
        &self,
        tasks: &mut JoinSet<()>,
        handler: &Arc<dyn ChangeHandler>,
        resource: Resource,
    ) {
        if !self.predicate.matches(resource.state()) {
            return;
        }
        let handler = Arc::clone(handler);
        tasks.spawn(async move {
            let name = resource.name().to_string();
            if let Err(e) = handler.on_change(resource).await {
                tracing::error!(resource = %name, error = %e, "change handler failed");
            }
        });
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "change handler task aborted");
    }
}
