//! Shared test utilities for Fabrik broker integration tests.
//!
//! This crate provides:
//! - [`FakeDirector`] and the other recording fakes for capability traits
//! - [`FaultyStore`]: an in-memory store with injectable write failures
//! - [`TestBroker`]: a broker wired to the fakes over an in-memory store
//! - Catalog, configuration and resource fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use fabrik_test_utils::{TestBroker, create_resource};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let env = TestBroker::new("broker-a");
//!     let controller = env.backup_controller();
//!     // ... create a resource and hand it to the controller ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fakes;
pub mod fixtures;

pub use fakes::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fabrik=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
