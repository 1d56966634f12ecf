//! Controller metrics.
//!
//! Recorded through the `metrics` crate facade; installing an exporter is
//! left to the embedding binary.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `fabrik_lock_acquisitions_total` | Counter | `handler`, `outcome` |
//! | `fabrik_controller_events_total` | Counter | `handler`, `outcome` |
//! | `fabrik_dispatch_duration_seconds` | Histogram | `handler` |
//! | `fabrik_poll_steps_total` | Counter | `operation`, `state` |
//! | `fabrik_finalize_failures_total` | Counter | `operation` |
//! | `fabrik_schedule_attempts_total` | Counter | `job_type`, `outcome` |

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names.
pub mod names {
    /// Counter: lock acquisition attempts by outcome.
    pub const LOCK_ACQUISITIONS_TOTAL: &str = "fabrik_lock_acquisitions_total";
    /// Counter: change events handled by a controller, by outcome.
    pub const CONTROLLER_EVENTS_TOTAL: &str = "fabrik_controller_events_total";
    /// Histogram: handler dispatch time in seconds.
    pub const DISPATCH_DURATION_SECONDS: &str = "fabrik_dispatch_duration_seconds";
    /// Counter: poll steps by observed state.
    pub const POLL_STEPS_TOTAL: &str = "fabrik_poll_steps_total";
    /// Counter: finalize steps that demoted an operation to failed.
    pub const FINALIZE_FAILURES_TOTAL: &str = "fabrik_finalize_failures_total";
    /// Counter: recurring job registrations by outcome.
    pub const SCHEDULE_ATTEMPTS_TOTAL: &str = "fabrik_schedule_attempts_total";
}

/// Label keys.
pub mod labels {
    /// Handler name (backup, restore, bind, deployment).
    pub const HANDLER: &str = "handler";
    /// Outcome (acquired, held, processed, skipped, failed, ...).
    pub const OUTCOME: &str = "outcome";
    /// Operation type (create, update, delete, ...).
    pub const OPERATION: &str = "operation";
    /// Observed operation state.
    pub const STATE: &str = "state";
    /// Job type.
    pub const JOB_TYPE: &str = "job_type";
}

/// Records controller metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerMetrics;

impl BrokerMetrics {
    /// Creates a recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a lock acquisition attempt.
    pub fn record_lock(&self, handler: &'static str, outcome: &'static str) {
        counter!(
            names::LOCK_ACQUISITIONS_TOTAL,
            labels::HANDLER => handler,
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records a handled change event.
    pub fn record_event(&self, handler: &'static str, outcome: &'static str) {
        counter!(
            names::CONTROLLER_EVENTS_TOTAL,
            labels::HANDLER => handler,
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records how long a handler took.
    pub fn observe_dispatch(&self, handler: &'static str, duration: Duration) {
        histogram!(names::DISPATCH_DURATION_SECONDS, labels::HANDLER => handler)
            .record(duration.as_secs_f64());
    }

    /// Records one poll step.
    pub fn record_poll(&self, operation: &'static str, state: &'static str) {
        counter!(
            names::POLL_STEPS_TOTAL,
            labels::OPERATION => operation,
            labels::STATE => state,
        )
        .increment(1);
    }

    /// Records a finalize failure.
    pub fn record_finalize_failure(&self, operation: &'static str) {
        counter!(names::FINALIZE_FAILURES_TOTAL, labels::OPERATION => operation).increment(1);
    }

    /// Records a schedule registration attempt.
    pub fn record_schedule(&self, job_type: &'static str, outcome: &'static str) {
        counter!(
            names::SCHEDULE_ATTEMPTS_TOTAL,
            labels::JOB_TYPE => job_type,
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_exporter_is_a_no_op() {
        let metrics = BrokerMetrics::new();
        metrics.record_lock("backup", "acquired");
        metrics.record_event("backup", "processed");
        metrics.observe_dispatch("backup", Duration::from_millis(5));
        metrics.record_poll("create", "in progress");
        metrics.record_finalize_failure("create");
        metrics.record_schedule("ScheduledBackup", "scheduled");
    }
}
