//! Recurring follow-up jobs (scheduled backups, auto-updates).
//!
//! The instance lifecycle registers jobs here; executing them is the
//! scheduler implementation's concern. Repeat intervals are either a cron
//! expression, `daily`, or `random` (a random time within the day, resolved
//! once at registration).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Kind of recurring job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    /// Periodic backup of an instance.
    ScheduledBackup,
    /// Periodic check for instance updates.
    ServiceInstanceUpdate,
}

impl JobType {
    /// Returns the job type label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduledBackup => "ScheduledBackup",
            Self::ServiceInstanceUpdate => "ServiceInstanceAutoUpdate",
        }
    }
}

/// How often a job repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepeatInterval {
    /// Once a day at midnight.
    Daily,
    /// A six-field cron expression (`sec min hour day month dow`).
    Cron(String),
    /// Once a day at a random time, picked at registration.
    RandomWithinDay,
}

impl RepeatInterval {
    /// Resolves the interval to a concrete cron expression.
    #[must_use]
    pub fn to_cron(&self) -> String {
        match self {
            Self::Daily => "0 0 0 * * *".to_string(),
            Self::Cron(expr) => expr.clone(),
            Self::RandomWithinDay => {
                let mut rng = rand::rng();
                let hour: u32 = rng.random_range(0..24);
                let minute: u32 = rng.random_range(0..60);
                format!("0 {minute} {hour} * * *")
            }
        }
    }
}

impl FromStr for RepeatInterval {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "daily" => return Ok(Self::Daily),
            "random" => return Ok(Self::RandomWithinDay),
            _ => {}
        }
        // Accept classic five-field cron by pinning seconds to zero.
        let expr = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        Schedule::from_str(&expr)
            .map_err(|e| Error::bad_request(format!("invalid repeat interval '{value}': {e}")))?;
        Ok(Self::Cron(expr))
    }
}

impl fmt::Display for RepeatInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => f.write_str("daily"),
            Self::Cron(expr) => f.write_str(expr),
            Self::RandomWithinDay => f.write_str("random"),
        }
    }
}

/// A registered recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    /// Owning instance guid.
    pub owner_id: String,
    /// Job type.
    pub job_type: JobType,
    /// Interval as requested (`daily`, `random`, or cron).
    pub repeat_interval: String,
    /// Resolved cron expression.
    pub cron_expression: String,
    /// Time zone the cron expression is evaluated in.
    pub time_zone: String,
    /// Job payload.
    pub data: Value,
    /// Who registered the job.
    pub requested_by: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Next run, if the expression ever fires again.
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Computes the next firing of a cron expression after `after`, evaluated in `tz`.
///
/// # Errors
///
/// Returns `BadRequest` for an invalid expression.
pub fn next_run(cron_expression: &str, tz: Tz, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = Schedule::from_str(cron_expression)
        .map_err(|e| Error::bad_request(format!("invalid cron expression '{cron_expression}': {e}")))?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc)))
}

/// Recurring-job registration.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Registers (or replaces) the job of `job_type` for `owner_id`.
    async fn schedule(
        &self,
        owner_id: &str,
        job_type: JobType,
        interval: &RepeatInterval,
        data: Value,
        requested_by: &str,
    ) -> Result<JobSchedule>;

    /// Returns the registered job, if any.
    async fn get_schedule(&self, owner_id: &str, job_type: JobType) -> Result<Option<JobSchedule>>;

    /// Removes the registered job. Missing jobs are ignored.
    async fn cancel_schedule(&self, owner_id: &str, job_type: JobType) -> Result<()>;
}

/// In-process scheduler keeping registrations in memory.
#[derive(Debug)]
pub struct InMemoryScheduler {
    time_zone: Tz,
    jobs: RwLock<HashMap<(String, JobType), JobSchedule>>,
}

impl Default for InMemoryScheduler {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl InMemoryScheduler {
    /// Creates a scheduler evaluating cron expressions in `time_zone`.
    #[must_use]
    pub fn new(time_zone: Tz) -> Self {
        Self {
            time_zone,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Returns all registered jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn jobs(&self) -> Result<Vec<JobSchedule>> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.values().cloned().collect())
    }
}

fn poisoned() -> Error {
    Error::Core(fabrik_core::Error::storage("scheduler registry poisoned"))
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    async fn schedule(
        &self,
        owner_id: &str,
        job_type: JobType,
        interval: &RepeatInterval,
        data: Value,
        requested_by: &str,
    ) -> Result<JobSchedule> {
        let now = Utc::now();
        let cron_expression = interval.to_cron();
        let next_run_at = next_run(&cron_expression, self.time_zone, now)?;
        let job = JobSchedule {
            owner_id: owner_id.to_string(),
            job_type,
            repeat_interval: interval.to_string(),
            cron_expression,
            time_zone: self.time_zone.name().to_string(),
            data,
            requested_by: requested_by.to_string(),
            created_at: now,
            next_run_at,
        };
        self.jobs
            .write()
            .map_err(|_| poisoned())?
            .insert((owner_id.to_string(), job_type), job.clone());
        tracing::info!(
            owner = owner_id,
            job_type = job_type.as_str(),
            cron = %job.cron_expression,
            "job scheduled"
        );
        Ok(job)
    }

    async fn get_schedule(&self, owner_id: &str, job_type: JobType) -> Result<Option<JobSchedule>> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&(owner_id.to_string(), job_type)).cloned())
    }

    async fn cancel_schedule(&self, owner_id: &str, job_type: JobType) -> Result<()> {
        self.jobs
            .write()
            .map_err(|_| poisoned())?
            .remove(&(owner_id.to_string(), job_type));
        Ok(())
    }
}
