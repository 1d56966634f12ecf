//! Background polling of dispatched instance operations.
//!
//! One poll task runs per instance guid. Each step waits the poll interval,
//! checks that the director resource still wants the operation, refreshes
//! the operation through [`DirectorInstance::last_operation`] and persists
//! the result. Polling stops at a terminal state, when the resource is
//! deleted or moved to `abort`/`delete`, or after the configured maximum
//! duration (the operation is then recorded as failed).
//!
//! Each task polls under a claim in the resource's poll annotation so that
//! exactly one broker process polls an operation. The claim is renewed well
//! within its lease, and a task whose claim was taken over stops without
//! touching the resource. Every other ending releases the claim.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use fabrik_core::lock::LockInfo;
use fabrik_core::observability::operation_span;
use fabrik_core::resource::ResourceState;
use fabrik_core::retry::Retryable;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::instance::DirectorInstance;
use super::operation::{Operation, OperationState, OperationType};

/// How a poll task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The operation reached a terminal state.
    Completed(OperationState),
    /// The resource was deleted or its desired state changed.
    Cancelled,
    /// The operation did not finish within the maximum poll duration.
    TimedOut,
    /// A non-retryable error ended polling; the operation was recorded as failed.
    Failed,
}

/// Running poll tasks keyed by instance guid.
#[derive(Clone, Default)]
pub struct PollerRegistry {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<PollOutcome>>>>,
}

impl fmt::Debug for PollerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerRegistry")
            .field("active", &self.active())
            .finish()
    }
}

impl PollerRegistry {
    /// Spawns a poll task for the instance, aborting any previous one.
    pub fn start(&self, instance: DirectorInstance, operation: Operation, claim: LockInfo) {
        let key = instance.guid().to_string();
        let span = operation_span(operation.kind.as_str(), &key);
        let handle =
            tokio::spawn(poll_until_terminal(instance, operation, claim).instrument(span));

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|_, task| !task.is_finished());
        if let Some(previous) = tasks.insert(key, handle) {
            previous.abort();
        }
    }

    /// Aborts the poll task of an instance. Returns true if one was running.
    pub fn cancel(&self, instance_guid: &str) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_guid);
        match removed {
            Some(task) => {
                let running = !task.is_finished();
                task.abort();
                running
            }
            None => false,
        }
    }

    /// Returns true while a poll task for the instance is running.
    #[must_use]
    pub fn is_polling(&self, instance_guid: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_guid)
            .is_some_and(|task| !task.is_finished())
    }

    /// Number of running poll tasks.
    #[must_use]
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Waits for the poll task of an instance and returns how it ended.
    ///
    /// Returns `None` if no task was registered; an aborted task reports
    /// `Cancelled`.
    pub async fn wait(&self, instance_guid: &str) -> Option<PollOutcome> {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_guid)?;
        Some(task.await.unwrap_or(PollOutcome::Cancelled))
    }
}

async fn poll_until_terminal(
    mut instance: DirectorInstance,
    mut operation: Operation,
    claim: LockInfo,
) -> PollOutcome {
    let ctx = Arc::clone(instance.context());
    let reference = instance.resource_ref();
    let mut claim = Some(claim);
    let outcome = poll_steps(&mut instance, &mut operation, &mut claim).await;
    if let Some(held) = claim {
        match ctx.poll_lock.release_held(&reference, &held).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(error = %e, "failed to release poll claim"),
        }
    }
    outcome
}

// Leaves `claim` empty when it no longer needs releasing.
async fn poll_steps(
    instance: &mut DirectorInstance,
    operation: &mut Operation,
    claim: &mut Option<LockInfo>,
) -> PollOutcome {
    let ctx = Arc::clone(instance.context());
    let reference = instance.resource_ref();
    let interval = ctx.config.poll_interval();
    let max_duration = ctx.config.max_poll_duration();
    let renew_every = ctx.poll_lock.lease_timeout() / 3;
    let started = Instant::now();
    let mut renewed = Instant::now();

    loop {
        tokio::time::sleep(interval).await;

        match ctx.store.get(&reference).await {
            Ok(resource) => {
                let current = ctx.poll_lock.holder(&resource);
                let still_ours = match (current.as_ref(), claim.as_ref()) {
                    (Some(current), Some(held)) => current.same_claim(held),
                    _ => false,
                };
                if !still_ours {
                    tracing::info!(
                        holder = current.as_ref().map_or("none", |c| c.holder_id.as_str()),
                        "poll claim taken over; polling stopped"
                    );
                    *claim = None;
                    return PollOutcome::Cancelled;
                }
                let superseded = matches!(resource.state(), ResourceState::Abort)
                    || (resource.state() == ResourceState::Delete
                        && operation.kind != OperationType::Delete);
                if superseded {
                    tracing::info!(state = %resource.state(), "desired state changed; polling stopped");
                    return PollOutcome::Cancelled;
                }
            }
            Err(e) if e.is_not_found() => {
                tracing::info!("resource removed; polling stopped");
                *claim = None;
                return PollOutcome::Cancelled;
            }
            Err(e) => tracing::warn!(error = %e, "failed to read resource; polling anyway"),
        }

        if renewed.elapsed() >= renew_every {
            if let Some(held) = claim.as_ref() {
                match ctx.poll_lock.renew(&reference, held).await {
                    Ok(Some(fresh)) => {
                        *claim = Some(fresh);
                        renewed = Instant::now();
                    }
                    Ok(None) => {
                        tracing::info!("poll claim lost; polling stopped");
                        *claim = None;
                        return PollOutcome::Cancelled;
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to renew poll claim"),
                }
            }
        }

        if started.elapsed() >= max_duration {
            operation.fail(format!(
                "{} of instance '{}' did not complete within {}s",
                operation.kind.action(),
                instance.guid(),
                max_duration.as_secs()
            ));
            persist(instance, operation).await;
            ctx.metrics
                .record_poll(operation.kind.as_str(), "timed_out");
            tracing::error!("operation timed out");
            return PollOutcome::TimedOut;
        }

        match instance.last_operation(operation).await {
            Ok(()) => {
                ctx.metrics
                    .record_poll(operation.kind.as_str(), operation.state.as_str());
                persist(instance, operation).await;
                if operation.state.is_terminal() {
                    tracing::info!(
                        state = %operation.state,
                        description = operation.description.as_deref().unwrap_or_default(),
                        "operation finished"
                    );
                    return PollOutcome::Completed(operation.state);
                }
                tracing::debug!(
                    description = operation.description.as_deref().unwrap_or_default(),
                    "operation still in progress"
                );
            }
            Err(e) if e.is_retryable() => {
                ctx.metrics.record_poll(operation.kind.as_str(), "error");
                tracing::warn!(error = %e, "poll step failed; retrying");
            }
            Err(e) => {
                ctx.metrics.record_poll(operation.kind.as_str(), "error");
                tracing::error!(error = %e, "poll step failed permanently");
                operation.fail(e.to_string());
                persist(instance, operation).await;
                return PollOutcome::Failed;
            }
        }
    }
}

async fn persist(instance: &DirectorInstance, operation: &Operation) {
    if let Err(e) = instance.save_progress(operation).await {
        tracing::warn!(error = %e, "failed to record poll result");
    }
}
