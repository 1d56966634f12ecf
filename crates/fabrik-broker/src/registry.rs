//! Explicit registry of catalog metadata and capability implementations.
//!
//! Controllers resolve a plan, then ask the registry for the capability
//! handle serving it. Nothing here is a process-wide singleton; the registry
//! is built once and shared by `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BackupService, DirectorManager, InMemoryNetworkSegments, NetworkSegmentAllocator};
use crate::catalog::{Catalog, Plan};
use crate::error::{Error, Result};
use crate::platform::{NoopPlatformManager, PlatformManager};

/// Builds the backup service serving a plan.
pub trait BackupServiceFactory: Send + Sync {
    /// Creates (or returns a cached) service handle for the plan.
    ///
    /// # Errors
    ///
    /// Returns an error if no service can serve the plan.
    fn create(&self, plan: &Plan) -> Result<Arc<dyn BackupService>>;
}

impl<F> BackupServiceFactory for F
where
    F: Fn(&Plan) -> Result<Arc<dyn BackupService>> + Send + Sync,
{
    fn create(&self, plan: &Plan) -> Result<Arc<dyn BackupService>> {
        self(plan)
    }
}

/// Catalog plus the capability implementations behind each plan.
pub struct ServiceRegistry {
    catalog: Catalog,
    director: Arc<dyn DirectorManager>,
    network_segments: Arc<dyn NetworkSegmentAllocator>,
    backup_factory: Option<Arc<dyn BackupServiceFactory>>,
    platforms: HashMap<String, Arc<dyn PlatformManager>>,
    default_platform: Arc<dyn PlatformManager>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("catalog", &self.catalog)
            .field("platforms", &self.platforms.keys().collect::<Vec<_>>())
            .field("default_platform", &self.default_platform.platform())
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// Creates a registry with in-memory network segments and no platform hooks.
    #[must_use]
    pub fn new(catalog: Catalog, director: Arc<dyn DirectorManager>) -> Self {
        Self {
            catalog,
            director,
            network_segments: Arc::new(InMemoryNetworkSegments::default()),
            backup_factory: None,
            platforms: HashMap::new(),
            default_platform: Arc::new(NoopPlatformManager::default()),
        }
    }

    /// Uses the given network segment allocator.
    #[must_use]
    pub fn with_network_segments(mut self, segments: Arc<dyn NetworkSegmentAllocator>) -> Self {
        self.network_segments = segments;
        self
    }

    /// Uses the given backup service factory.
    #[must_use]
    pub fn with_backup_factory(mut self, factory: Arc<dyn BackupServiceFactory>) -> Self {
        self.backup_factory = Some(factory);
        self
    }

    /// Registers a platform manager under its platform name.
    #[must_use]
    pub fn with_platform(mut self, manager: Arc<dyn PlatformManager>) -> Self {
        self.platforms.insert(manager.platform().to_string(), manager);
        self
    }

    /// Returns the catalog.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Looks up a plan.
    ///
    /// # Errors
    ///
    /// Returns `PlanNotFound` for unknown ids.
    pub fn get_plan(&self, plan_id: &str) -> Result<&Plan> {
        self.catalog.get_plan(plan_id)
    }

    /// Returns the director backend.
    #[must_use]
    pub fn director(&self) -> Arc<dyn DirectorManager> {
        Arc::clone(&self.director)
    }

    /// Returns the network segment allocator.
    #[must_use]
    pub fn network_segments(&self) -> Arc<dyn NetworkSegmentAllocator> {
        Arc::clone(&self.network_segments)
    }

    /// Builds the backup service for a plan.
    ///
    /// # Errors
    ///
    /// Returns `FeatureNotSupported` when the plan has no backup capability.
    pub fn backup_service(&self, plan: &Plan) -> Result<Arc<dyn BackupService>> {
        plan.verify_feature_support("backup")?;
        let factory = self.backup_factory.as_ref().ok_or_else(|| Error::FeatureNotSupported {
            feature: "backup".to_string(),
            plan_id: plan.id.clone(),
        })?;
        factory.create(plan)
    }

    /// Returns the platform manager for a platform name, falling back to the default.
    #[must_use]
    pub fn platform_manager(&self, platform: Option<&str>) -> Arc<dyn PlatformManager> {
        platform
            .and_then(|name| self.platforms.get(name))
            .map_or_else(|| Arc::clone(&self.default_platform), Arc::clone)
    }
}
