//! # fabrik-core
//!
//! Shared primitives for the Fabrik service broker's operation controller.
//!
//! - **Resources**: the document model held in the shared, watchable store
//! - **Resource Store**: typed CRUD, conditional patches and change streams
//! - **Lock**: annotation-based mutual exclusion with lease staleness
//! - **Operation Tokens**: signed sub-operation descriptors
//! - **Retry**: bounded fixed-delay retry for idempotent bookkeeping
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fabrik_core::prelude::*;
//!
//! # async fn demo() -> Result<()> {
//! let store = Arc::new(MemoryResourceStore::new());
//! let reference = ResourceRef::new(ResourceType::default_backup(), "default", "g-1");
//! store.create(Resource::new(&reference, &serde_json::json!({"guid": "g-1"}))?).await?;
//!
//! let lock = ResourceLock::new(Arc::clone(&store), "broker-a", DEFAULT_LEASE_TIMEOUT);
//! if lock.acquire(&reference).await? {
//!     // ... process the resource ...
//!     lock.release(&reference).await;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod lock;
pub mod observability;
pub mod resource;
pub mod retry;
pub mod store;
pub mod token;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::lock::{
        DEFAULT_LEASE_TIMEOUT, LOCK_ANNOTATION, LockInfo, POLL_ANNOTATION, ResourceLock,
    };
    pub use crate::resource::{
        ChangeEvent, ChangeKind, DEFAULT_NAMESPACE, Resource, ResourceRef, ResourceState,
        ResourceType,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{
        KeySection, MemoryResourceStore, PatchPrecondition, ResourcePatch, ResourceStore,
        ResourceWatch, WatchEvent,
    };
    pub use crate::token::{OperationDescriptor, OperationTokenConfig};
}

pub use error::{Error, Result};
