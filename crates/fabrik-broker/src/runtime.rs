//! Wires the controllers of one broker process.
//!
//! A [`Broker`] owns one [`OperationController`] per resource type, each fed
//! by its own [`Watcher`](crate::watcher::Watcher). Every broker process
//! runs the full set; the resource lock keeps them from acting on the same
//! resource at once.

use std::sync::Arc;

use fabrik_core::lock::ResourceLock;
use fabrik_core::resource::{ResourceState, ResourceType};
use fabrik_core::store::ResourceStore;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::BrokerConfig;
use crate::controller::backup::BackupHandler;
use crate::controller::bind::BindHandler;
use crate::controller::deployment::DeploymentHandler;
use crate::controller::restore::RestoreHandler;
use crate::controller::{OperationController, ResourceHandler};
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleContext;
use crate::lifecycle::instance::InstanceRequest;
use crate::lifecycle::operation::Operation;
use crate::registry::ServiceRegistry;
use crate::scheduler::Scheduler;

/// One broker process.
pub struct Broker {
    ctx: Arc<LifecycleContext>,
    lock: ResourceLock<dyn ResourceStore>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("ctx", &self.ctx)
            .field("lock", &self.lock)
            .finish()
    }
}

impl Broker {
    /// Creates a broker from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<ServiceRegistry>,
        scheduler: Arc<dyn Scheduler>,
        config: BrokerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let lock = ResourceLock::new(
            Arc::clone(&store),
            config.broker_id.clone(),
            config.lock_timeout(),
        );
        let ctx = Arc::new(LifecycleContext::new(store, registry, scheduler, config));
        Ok(Self { ctx, lock })
    }

    /// Shared lifecycle context.
    #[must_use]
    pub fn context(&self) -> &Arc<LifecycleContext> {
        &self.ctx
    }

    /// Builds the controller for each handled resource type.
    #[must_use]
    pub fn controllers(&self) -> Vec<OperationController<dyn ResourceStore>> {
        let handlers: Vec<Arc<dyn ResourceHandler>> = vec![
            Arc::new(BackupHandler::new(
                Arc::clone(&self.ctx.store),
                Arc::clone(&self.ctx.registry),
            )),
            Arc::new(RestoreHandler::new(
                Arc::clone(&self.ctx.store),
                Arc::clone(&self.ctx.registry),
            )),
            Arc::new(DeploymentHandler::new(Arc::clone(&self.ctx))),
            Arc::new(BindHandler::new(Arc::clone(&self.ctx))),
        ];
        handlers
            .into_iter()
            .map(|handler| {
                OperationController::new(Arc::clone(&self.ctx.store), self.lock.clone(), handler)
            })
            .collect()
    }

    /// Restarts polling for director operations left in progress.
    ///
    /// An operation is resumed only when its poll claim is free or its
    /// holder's lease has lapsed; a live poll on another broker is left
    /// alone. Returns the number of polls started.
    ///
    /// # Errors
    ///
    /// Returns an error if the director resources cannot be listed.
    pub async fn resume_polling(&self) -> Result<usize> {
        let resources = self
            .ctx
            .store
            .list(&ResourceType::director(), &self.ctx.config.namespace)
            .await?;
        let mut started = 0;
        for resource in resources {
            if resource.state() != ResourceState::InProgress
                || self.ctx.pollers.is_polling(resource.name())
            {
                continue;
            }
            let Some(response) = resource
                .status
                .result
                .as_ref()
                .and_then(|result| result.get("response"))
                .filter(|response| !response.is_null())
            else {
                continue;
            };
            let resumed = serde_json::from_value::<Operation>(response.clone())
                .map_err(|e| Error::from(fabrik_core::Error::from(e)))
                .and_then(|operation| {
                    let request: InstanceRequest = resource.options()?;
                    let instance = self.ctx.instance(
                        resource.name(),
                        &request.plan_id,
                        None,
                        request.platform(),
                    )?;
                    Ok((instance, operation))
                });
            let claimed = match resumed {
                Ok((instance, operation)) => {
                    let kind = operation.kind;
                    instance.resume_polling(operation).await.map(|claimed| (claimed, kind))
                }
                Err(e) => Err(e),
            };
            match claimed {
                Ok((true, kind)) => {
                    tracing::info!(instance_guid = %resource.name(), operation = %kind, "resuming poll");
                    started += 1;
                }
                Ok((false, kind)) => {
                    tracing::debug!(instance_guid = %resource.name(), operation = %kind, "poll held elsewhere");
                }
                Err(e) => {
                    tracing::warn!(instance_guid = %resource.name(), error = %e, "cannot resume poll");
                }
            }
        }
        Ok(started)
    }

    /// Runs every controller until `shutdown` flips to true.
    ///
    /// # Errors
    ///
    /// Returns the first watcher error; the other watchers keep running
    /// until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.resume_polling().await?;

        let namespace = self.ctx.config.namespace.clone();
        let mut watchers = JoinSet::new();
        for controller in self.controllers() {
            let watcher = controller.watcher(&namespace);
            watchers.spawn(watcher.run(Arc::new(controller), shutdown.clone()));
        }
        tracing::info!(
            broker_id = %self.ctx.config.broker_id,
            namespace = %namespace,
            watchers = watchers.len(),
            "broker started"
        );

        let mut first_error = None;
        while let Some(joined) = watchers.join_next().await {
            let result = joined.map_err(|e| Error::backend(format!("watcher task failed: {e}")));
            if let Err(e) = result.and_then(|r| r) {
                tracing::error!(error = %e, "watcher stopped with error");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(broker_id = %self.ctx.config.broker_id, "broker stopped");
        first_error.map_or(Ok(()), Err)
    }
}
