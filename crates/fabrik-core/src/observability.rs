//! Observability infrastructure for Fabrik.
//!
//! Structured logging with consistent spans for resource processing and
//! instance operations.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name (`json` or `pretty`), defaulting to pretty.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at startup. Subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `fabrik_broker=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for processing one resource change.
///
/// ```rust
/// use fabrik_core::observability::resource_span;
///
/// let span = resource_span("start_backup", "defaultbackup", "g-1");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn resource_span(operation: &str, resource_type: &str, name: &str) -> Span {
    tracing::info_span!(
        "resource",
        op = operation,
        resource_type = resource_type,
        name = name,
    )
}

/// Creates a span for an instance lifecycle operation.
#[must_use]
pub fn operation_span(operation: &str, instance_guid: &str) -> Span {
    tracing::info_span!("operation", op = operation, instance = instance_guid)
}
