//! Broker configuration.
//!
//! Loaded from environment variables with sensible defaults:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `FABRIK_BROKER_ID` | generated `fabrik-<ulid>` |
//! | `FABRIK_NAMESPACE` | `default` |
//! | `FABRIK_LOCK_TIMEOUT_SECS` | 120 |
//! | `FABRIK_POLL_INTERVAL_MS` | 2000 |
//! | `FABRIK_MAX_POLL_DURATION_SECS` | 86400 |
//! | `FABRIK_OPERATION_TOKEN_SECRET` | (none) |
//! | `FABRIK_OPERATION_TOKEN_TTL_SECS` | 900 |
//! | `FABRIK_FEATURE_SCHEDULED_BACKUP` | false |
//! | `FABRIK_FEATURE_SCHEDULED_UPDATE` | false |
//! | `FABRIK_BACKUP_INTERVAL` | `daily` |
//! | `FABRIK_UPDATE_TIME_ZONE` | `UTC` |
//! | `FABRIK_FINALIZE_MAX_ATTEMPTS` | 3 |
//! | `FABRIK_FINALIZE_MIN_DELAY_MS` | 1000 |

use std::time::Duration;

use chrono_tz::Tz;
use fabrik_core::lock::generate_owner_id;
use fabrik_core::resource::DEFAULT_NAMESPACE;
use fabrik_core::retry::RetryPolicy;
use fabrik_core::token::OperationTokenConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scheduler::RepeatInterval;

/// Feature toggles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Register a recurring backup after bind/provision.
    #[serde(default)]
    pub scheduled_backup: bool,
    /// Register a recurring auto-update check after provision.
    #[serde(default)]
    pub scheduled_update: bool,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Identity written into lock annotations.
    pub broker_id: String,
    /// Namespace watched by the controllers.
    pub namespace: String,
    /// Lease after which a lock is considered stale, in seconds.
    pub lock_timeout_secs: u64,
    /// Delay between poll steps, in milliseconds.
    pub poll_interval_ms: u64,
    /// Upper bound on polling a single operation, in seconds.
    pub max_poll_duration_secs: u64,
    /// Operation token signing.
    pub operation_token: OperationTokenConfig,
    /// Feature toggles.
    pub features: FeatureFlags,
    /// Default interval for scheduled backups.
    pub backup_interval: String,
    /// Time zone for randomized update schedules.
    pub update_time_zone: String,
    /// Attempts for finalize bookkeeping steps.
    pub finalize_max_attempts: u32,
    /// Delay between finalize attempts, in milliseconds.
    pub finalize_min_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: generate_owner_id(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            lock_timeout_secs: 120,
            poll_interval_ms: 2_000,
            max_poll_duration_secs: 86_400,
            operation_token: OperationTokenConfig::default(),
            features: FeatureFlags::default(),
            backup_interval: "daily".to_string(),
            update_time_zone: "UTC".to_string(),
            finalize_max_attempts: 3,
            finalize_min_delay_ms: 1_000,
        }
    }
}

impl BrokerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is malformed or the result is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through a variable lookup function.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is malformed or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(id) = env.string("FABRIK_BROKER_ID") {
            config.broker_id = id;
        }
        if let Some(namespace) = env.string("FABRIK_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(v) = env.u64("FABRIK_LOCK_TIMEOUT_SECS")? {
            config.lock_timeout_secs = v;
        }
        if let Some(v) = env.u64("FABRIK_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = v;
        }
        if let Some(v) = env.u64("FABRIK_MAX_POLL_DURATION_SECS")? {
            config.max_poll_duration_secs = v;
        }
        if let Some(secret) = env.string("FABRIK_OPERATION_TOKEN_SECRET") {
            config.operation_token.hs256_secret = secret;
        }
        if let Some(v) = env.u64("FABRIK_OPERATION_TOKEN_TTL_SECS")? {
            config.operation_token.ttl_seconds = v;
        }
        if let Some(v) = env.bool("FABRIK_FEATURE_SCHEDULED_BACKUP")? {
            config.features.scheduled_backup = v;
        }
        if let Some(v) = env.bool("FABRIK_FEATURE_SCHEDULED_UPDATE")? {
            config.features.scheduled_update = v;
        }
        if let Some(interval) = env.string("FABRIK_BACKUP_INTERVAL") {
            config.backup_interval = interval;
        }
        if let Some(tz) = env.string("FABRIK_UPDATE_TIME_ZONE") {
            config.update_time_zone = tz;
        }
        if let Some(v) = env.u64("FABRIK_FINALIZE_MAX_ATTEMPTS")? {
            config.finalize_max_attempts = u32::try_from(v).map_err(|_| {
                Error::Config("FABRIK_FINALIZE_MAX_ATTEMPTS is out of range".to_string())
            })?;
        }
        if let Some(v) = env.u64("FABRIK_FINALIZE_MIN_DELAY_MS")? {
            config.finalize_min_delay_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration sanity.
    ///
    /// # Errors
    ///
    /// Returns `Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.broker_id.trim().is_empty() {
            return Err(Error::Config("broker_id must not be empty".to_string()));
        }
        if self.lock_timeout_secs == 0 {
            return Err(Error::Config(
                "lock_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        // Poll claims are renewed at poll steps, three times per lease.
        if self.poll_interval_ms.saturating_mul(3) > self.lock_timeout_secs.saturating_mul(1_000) {
            return Err(Error::Config(
                "poll_interval_ms must be at most a third of lock_timeout_secs".to_string(),
            ));
        }
        if self.max_poll_duration_secs.saturating_mul(1_000) < self.poll_interval_ms {
            return Err(Error::Config(
                "max_poll_duration_secs must cover at least one poll interval".to_string(),
            ));
        }
        if self.finalize_max_attempts == 0 {
            return Err(Error::Config(
                "finalize_max_attempts must be greater than zero".to_string(),
            ));
        }
        if !self.operation_token.hs256_secret.trim().is_empty() {
            self.operation_token
                .validate()
                .map_err(|e| Error::Config(e.to_string()))?;
        }
        self.update_time_zone()?;
        self.default_backup_interval()?;
        Ok(())
    }

    /// Returns the lock lease timeout.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Returns the delay between poll steps.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the maximum time an operation is polled.
    #[must_use]
    pub fn max_poll_duration(&self) -> Duration {
        Duration::from_secs(self.max_poll_duration_secs)
    }

    /// Returns the retry policy for finalize bookkeeping.
    #[must_use]
    pub fn finalize_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.finalize_max_attempts,
            Duration::from_millis(self.finalize_min_delay_ms),
        )
    }

    /// Parses the update time zone.
    ///
    /// # Errors
    ///
    /// Returns `Config` for unknown zone names.
    pub fn update_time_zone(&self) -> Result<Tz> {
        self.update_time_zone.parse::<Tz>().map_err(|_| {
            Error::Config(format!("unknown time zone '{}'", self.update_time_zone))
        })
    }

    /// Parses the default backup interval.
    ///
    /// # Errors
    ///
    /// Returns `Config` for malformed intervals.
    pub fn default_backup_interval(&self) -> Result<RepeatInterval> {
        self.backup_interval
            .parse()
            .map_err(|e: Error| Error::Config(e.to_string()))
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name} must be a u64: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
