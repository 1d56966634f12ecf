//! Instance lifecycle: the per-guid state machine for director-backed instances.
//!
//! `initialize → dispatch → poll → finalize`, covering create, update,
//! delete, bind and unbind. See [`instance::DirectorInstance`].

pub mod instance;
pub mod operation;
pub mod poller;

use std::sync::Arc;

use fabrik_core::lock::{POLL_ANNOTATION, ResourceLock};
use fabrik_core::store::ResourceStore;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::metrics::BrokerMetrics;
use crate::registry::ServiceRegistry;
use crate::scheduler::Scheduler;

use self::instance::DirectorInstance;
use self::poller::PollerRegistry;

/// Collaborators shared by every instance lifecycle.
pub struct LifecycleContext {
    /// Resource store.
    pub store: Arc<dyn ResourceStore>,
    /// Catalog and capability implementations.
    pub registry: Arc<ServiceRegistry>,
    /// Recurring-job registration.
    pub scheduler: Arc<dyn Scheduler>,
    /// Broker configuration.
    pub config: BrokerConfig,
    /// Running poll tasks.
    pub pollers: PollerRegistry,
    /// Claim on the background poll of an instance operation, shared by
    /// every broker process so that only one of them polls.
    pub poll_lock: ResourceLock<dyn ResourceStore>,
    /// Metrics recorder.
    pub metrics: BrokerMetrics,
}

impl std::fmt::Debug for LifecycleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleContext")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("pollers", &self.pollers)
            .finish_non_exhaustive()
    }
}

impl LifecycleContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<ServiceRegistry>,
        scheduler: Arc<dyn Scheduler>,
        config: BrokerConfig,
    ) -> Self {
        let poll_lock = ResourceLock::new(
            Arc::clone(&store),
            config.broker_id.clone(),
            config.lock_timeout(),
        )
        .with_annotation(POLL_ANNOTATION);
        Self {
            poll_lock,
            store,
            registry,
            scheduler,
            config,
            pollers: PollerRegistry::default(),
            metrics: BrokerMetrics::new(),
        }
    }

    /// Builds the lifecycle for an instance of a plan.
    ///
    /// `service_id`, when given, must match the plan's service. The platform
    /// manager is picked by name, falling back to the default platform.
    ///
    /// # Errors
    ///
    /// Returns `PlanNotFound` or `ServiceMismatch`.
    pub fn instance(
        self: &Arc<Self>,
        guid: &str,
        plan_id: &str,
        service_id: Option<&str>,
        platform: Option<&str>,
    ) -> Result<DirectorInstance> {
        let plan = self.registry.get_plan(plan_id)?;
        if let Some(service_id) = service_id {
            if service_id != plan.service.id {
                return Err(Error::ServiceMismatch {
                    expected: plan.service.id.clone(),
                    actual: service_id.to_string(),
                });
            }
        }
        let platform_manager = self.registry.platform_manager(platform);
        Ok(DirectorInstance::new(
            guid,
            plan.clone(),
            Arc::clone(self),
            platform_manager,
        ))
    }
}
