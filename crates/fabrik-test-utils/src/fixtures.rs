//! Pre-wired broker fixtures.

use std::sync::Arc;

use fabrik_broker::backend::{BackupService, InMemoryNetworkSegments, NetworkSegmentAllocator};
use fabrik_broker::catalog::{Catalog, Plan, Service};
use fabrik_broker::config::{BrokerConfig, FeatureFlags};
use fabrik_broker::controller::OperationController;
use fabrik_broker::controller::backup::BackupHandler;
use fabrik_broker::controller::bind::BindHandler;
use fabrik_broker::controller::deployment::DeploymentHandler;
use fabrik_broker::controller::restore::RestoreHandler;
use fabrik_broker::error::Result;
use fabrik_broker::lifecycle::LifecycleContext;
use fabrik_broker::platform::DEFAULT_PLATFORM;
use fabrik_broker::registry::ServiceRegistry;
use fabrik_broker::runtime::Broker;
use fabrik_broker::scheduler::InMemoryScheduler;
use fabrik_core::lock::ResourceLock;
use fabrik_core::resource::{DEFAULT_NAMESPACE, Resource, ResourceRef, ResourceState, ResourceType};
use fabrik_core::store::ResourceStore;
use fabrik_core::token::OperationTokenConfig;
use serde_json::{Value, json};

use crate::fakes::{FakeDirector, FaultyStore, RecordingBackupService, RecordingPlatformManager};

/// Plan with backup support.
pub const PLAN_ID: &str = "bc158c9a-7934-401e-94ab-057082a5073f";

/// Plan without backup support.
pub const PLAIN_PLAN_ID: &str = "d616b00a-5949-4b1c-bc73-0d3c59f3954a";

/// Service of both plans.
pub const SERVICE_ID: &str = "24731fb8-7b84-4f57-914f-c3d55d793dd4";

/// Tenant id reported by the recording platform.
pub const TENANT_ID: &str = "space-1";

/// Secret used to sign operation tokens in tests.
pub const TOKEN_SECRET: &str = "test-operation-token-secret-0123456789";

/// Returns the test catalog.
pub fn catalog() -> Catalog {
    let service = Service {
        id: SERVICE_ID.to_string(),
        name: "blueprint".to_string(),
        backup_interval: None,
    };
    Catalog::new()
        .with_plan(Plan {
            id: PLAN_ID.to_string(),
            name: "v1.0-xsmall".to_string(),
            service: service.clone(),
            features: vec!["backup".to_string()],
        })
        .with_plan(Plan {
            id: PLAIN_PLAN_ID.to_string(),
            name: "v1.0-plain".to_string(),
            service,
            features: Vec::new(),
        })
}

/// Returns a configuration with short delays and every feature enabled.
pub fn test_config(broker_id: &str) -> BrokerConfig {
    BrokerConfig {
        broker_id: broker_id.to_string(),
        namespace: DEFAULT_NAMESPACE.to_string(),
        poll_interval_ms: 10,
        operation_token: OperationTokenConfig::new(TOKEN_SECRET),
        features: FeatureFlags {
            scheduled_backup: true,
            scheduled_update: true,
        },
        finalize_min_delay_ms: 5,
        ..BrokerConfig::default()
    }
}

/// Request options for a director instance.
pub fn instance_options(operation: &str, parameters: Value) -> Value {
    json!({
        "plan_id": PLAN_ID,
        "service_id": SERVICE_ID,
        "parameters": parameters,
        "context": { "platform": DEFAULT_PLATFORM, "space_guid": TENANT_ID },
        "operation": operation,
    })
}

/// Creates a resource in the default namespace.
pub async fn create_resource(
    store: &dyn ResourceStore,
    resource_type: ResourceType,
    name: &str,
    options: &Value,
    state: ResourceState,
) -> fabrik_core::Result<ResourceRef> {
    let reference = ResourceRef::new(resource_type, DEFAULT_NAMESPACE, name);
    store
        .create(Resource::new(&reference, options)?.with_state(state))
        .await?;
    Ok(reference)
}

/// A broker wired to recording fakes.
pub struct TestBroker {
    /// Shared resource store.
    pub store: Arc<FaultyStore>,
    /// Director backend.
    pub director: FakeDirector,
    /// Backup service behind every backup-capable plan.
    pub backups: Arc<RecordingBackupService>,
    /// Platform hooks for the default platform.
    pub platform: Arc<RecordingPlatformManager>,
    /// Recurring jobs.
    pub scheduler: Arc<InMemoryScheduler>,
    /// Network segment pool.
    pub segments: Arc<InMemoryNetworkSegments>,
    /// Broker under test.
    pub broker: Broker,
}

impl TestBroker {
    /// Creates a broker with [`test_config`].
    pub fn new(broker_id: &str) -> Self {
        Self::with_config(test_config(broker_id))
    }

    /// Creates a broker with the given configuration.
    pub fn with_config(config: BrokerConfig) -> Self {
        Self::sharing(Arc::new(FaultyStore::new()), FakeDirector::new(), config)
    }

    /// Creates a broker on an existing store and director, as a second
    /// process of the same deployment would be.
    pub fn sharing(store: Arc<FaultyStore>, director: FakeDirector, config: BrokerConfig) -> Self {
        let backups = Arc::new(RecordingBackupService::new());
        let platform = Arc::new(RecordingPlatformManager::new(DEFAULT_PLATFORM, Some(TENANT_ID)));
        let scheduler = Arc::new(InMemoryScheduler::default());
        let segments = Arc::new(InMemoryNetworkSegments::default());

        let factory_backups = Arc::clone(&backups);
        let registry = ServiceRegistry::new(catalog(), Arc::new(director.clone()))
            .with_network_segments(segments.clone())
            .with_platform(platform.clone())
            .with_backup_factory(Arc::new(move |_plan: &Plan| -> Result<Arc<dyn BackupService>> {
                Ok(factory_backups.clone())
            }));

        let broker = Broker::new(store.clone(), Arc::new(registry), scheduler.clone(), config)
            .expect("valid test configuration");
        Self {
            store,
            director,
            backups,
            platform,
            scheduler,
            segments,
            broker,
        }
    }

    /// Assigns a network segment to an instance, as a completed create would.
    pub async fn provision_segment(&self, instance_guid: &str) -> u32 {
        self.segments
            .acquire(instance_guid)
            .await
            .expect("free network segment")
    }

    /// Shared lifecycle context.
    pub fn context(&self) -> Arc<LifecycleContext> {
        Arc::clone(self.broker.context())
    }

    fn controller(
        &self,
        handler: Arc<dyn fabrik_broker::controller::ResourceHandler>,
    ) -> OperationController<dyn ResourceStore> {
        let ctx = self.context();
        let store: Arc<dyn ResourceStore> = self.store.clone();
        let lock = ResourceLock::new(
            Arc::clone(&store),
            ctx.config.broker_id.clone(),
            ctx.config.lock_timeout(),
        );
        OperationController::new(store, lock, handler)
    }

    /// Controller for backup resources.
    pub fn backup_controller(&self) -> OperationController<dyn ResourceStore> {
        let ctx = self.context();
        self.controller(Arc::new(BackupHandler::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.registry),
        )))
    }

    /// Controller for restore resources.
    pub fn restore_controller(&self) -> OperationController<dyn ResourceStore> {
        let ctx = self.context();
        self.controller(Arc::new(RestoreHandler::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.registry),
        )))
    }

    /// Controller for director resources.
    pub fn deployment_controller(&self) -> OperationController<dyn ResourceStore> {
        self.controller(Arc::new(DeploymentHandler::new(self.context())))
    }

    /// Controller for binding resources.
    pub fn bind_controller(&self) -> OperationController<dyn ResourceStore> {
        self.controller(Arc::new(BindHandler::new(self.context())))
    }
}
