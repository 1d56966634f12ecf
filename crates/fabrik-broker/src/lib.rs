//! # fabrik-broker
//!
//! Resource-driven operation controller for the Fabrik service broker.
//!
//! Requests arrive as resources in a shared store. Every broker process
//! watches each resource type, takes the resource lock, performs the backend
//! action the resource's state asks for, and records the outcome back on the
//! resource.
//!
//! - **Watcher**: state-filtered change streams with startup replay
//! - **Operation Controller**: lock, re-check, dispatch, record, release
//! - **Handlers**: backups, restores, director deployments and bindings
//! - **Instance Lifecycle**: initialize, dispatch, poll and finalize
//! - **Sub-operations**: token-carried operations routed through updates
//! - **Scheduler**: recurring backup and update-check jobs
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fabrik_broker::backend::DirectorManager;
//! use fabrik_broker::catalog::Catalog;
//! use fabrik_broker::config::BrokerConfig;
//! use fabrik_broker::error::Result;
//! use fabrik_broker::registry::ServiceRegistry;
//! use fabrik_broker::runtime::Broker;
//! use fabrik_broker::scheduler::InMemoryScheduler;
//! use fabrik_core::store::MemoryResourceStore;
//!
//! # async fn demo(director: Arc<dyn DirectorManager>) -> Result<()> {
//! let registry = Arc::new(ServiceRegistry::new(Catalog::new(), director));
//! let broker = Broker::new(
//!     Arc::new(MemoryResourceStore::new()),
//!     registry,
//!     Arc::new(InMemoryScheduler::default()),
//!     BrokerConfig::from_env()?,
//! )?;
//!
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! broker.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod platform;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod sub_operation;
pub mod watcher;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backend::{BackupService, DirectorManager, NetworkSegmentAllocator};
    pub use crate::catalog::{Catalog, Plan, Service};
    pub use crate::config::BrokerConfig;
    pub use crate::controller::{EventOutcome, HandlerOutcome, OperationController, ResourceHandler};
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::LifecycleContext;
    pub use crate::lifecycle::instance::{DirectorInstance, InstanceRequest};
    pub use crate::lifecycle::operation::{Operation, OperationState, OperationType};
    pub use crate::platform::PlatformManager;
    pub use crate::registry::ServiceRegistry;
    pub use crate::runtime::Broker;
    pub use crate::scheduler::{JobType, RepeatInterval, Scheduler};
    pub use crate::watcher::{StatePredicate, Watcher};
}

pub use error::{Error, Result};
