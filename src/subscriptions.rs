//! The subscriptions coordinator: owns every pooler's runner, cleans up
//! stale checkpoints at startup, and exposes bulk start/stop.

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::contracts::{ContractType, ContractsRegistry};
use crate::error::SubscriptionError;
use crate::pooler::SubscriptionPooler;
use crate::runner::{ResolvedPooler, Runner, RunnerConfig};

/// Collects the configuration for [`EventStoreSubscriptions`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use ses::{InMemoryCheckpointStore, StaticContractsRegistry, SubscriptionsBuilder};
///
/// # async fn run(pooler: Arc<dyn ses::SubscriptionPooler>, registry: StaticContractsRegistry) -> Result<(), ses::SubscriptionError> {
/// let subscriptions = SubscriptionsBuilder::new(InMemoryCheckpointStore::new())
///     .with_contracts_registry(registry)
///     .add(pooler)
///     .start()
///     .await?;
///
/// subscriptions.dispose().await;
/// # Ok(())
/// # }
/// ```
pub struct SubscriptionsBuilder {
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Option<Arc<dyn ContractsRegistry>>,
    poolers: Vec<Arc<dyn SubscriptionPooler>>,
    config: RunnerConfig,
}

impl SubscriptionsBuilder {
    /// Start a configuration backed by `checkpoints`.
    ///
    /// # Arguments
    ///
    /// * `checkpoints` - Store holding the progress of every pooler.
    ///
    /// # Returns
    ///
    /// A builder with no poolers, no registry, and the default
    /// [`RunnerConfig`].
    pub fn new(checkpoints: impl CheckpointStore) -> Self {
        Self::with_shared_checkpoints(Arc::new(checkpoints))
    }

    /// Like [`new`](Self::new), for a checkpoint store that is shared elsewhere.
    ///
    /// # Arguments
    ///
    /// * `checkpoints` - Shared store holding the progress of every pooler.
    ///
    /// # Returns
    ///
    /// A builder with no poolers, no registry, and the default
    /// [`RunnerConfig`].
    pub fn with_shared_checkpoints(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            checkpoints,
            registry: None,
            poolers: Vec::new(),
            config: RunnerConfig::default(),
        }
    }

    /// Set the contracts registry. Required before [`start`](Self::start).
    ///
    /// # Arguments
    ///
    /// * `registry` - Maps pooler, source, and handler types to the contract
    ///   names used in checkpoint keys.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn with_contracts_registry(mut self, registry: impl ContractsRegistry + 'static) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Set the runner configuration applied to every pooler.
    ///
    /// # Arguments
    ///
    /// * `config` - Polling interval, batch size, and retry policy.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn with_runner_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a pooler. Adding the same instance twice is a no-op.
    ///
    /// # Arguments
    ///
    /// * `pooler` - The pooler to run once the coordinator starts.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn add(mut self, pooler: Arc<dyn SubscriptionPooler>) -> Self {
        let already_added = self
            .poolers
            .iter()
            .any(|p| std::ptr::addr_eq(Arc::as_ptr(p), Arc::as_ptr(&pooler)));
        if !already_added {
            self.poolers.push(pooler);
        }
        self
    }

    /// Resolve contract names, clean up stale checkpoints, run each pooler's
    /// startup hook, and start one runner per pooler.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::RegistryNotConfigured`] if no registry was set.
    /// - [`SubscriptionError::Contract`] if a pooler, source, or handler type
    ///   is not registered.
    /// - [`SubscriptionError::DuplicatePooler`] if two instances share a type.
    /// - [`SubscriptionError::Checkpoint`] or [`SubscriptionError::Startup`]
    ///   if cleanup or a startup hook fails; runners already started are
    ///   stopped again.
    pub async fn start(self) -> Result<EventStoreSubscriptions, SubscriptionError> {
        let registry = self
            .registry
            .ok_or(SubscriptionError::RegistryNotConfigured)?;

        // Resolve everything up front so a misconfiguration has no side effects.
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.poolers.len());
        for pooler in self.poolers {
            let resolved_pooler = resolve(registry.as_ref(), pooler)?;
            if !seen.insert(resolved_pooler.pooler.contract_type().id()) {
                return Err(SubscriptionError::DuplicatePooler(resolved_pooler.name));
            }
            resolved.push(resolved_pooler);
        }

        let mut subscriptions = EventStoreSubscriptions {
            runners: Vec::with_capacity(resolved.len()),
            registry,
        };
        for pooler in resolved {
            if let Err(e) =
                prepare(&pooler, self.checkpoints.as_ref(), subscriptions.registry.as_ref()).await
            {
                subscriptions.stop_all().await;
                return Err(e);
            }
            let runner = Runner::new(pooler, Arc::clone(&self.checkpoints), self.config.clone());
            runner.start();
            subscriptions.runners.push(runner);
        }

        tracing::info!(poolers = subscriptions.runners.len(), "subscriptions started");
        Ok(subscriptions)
    }
}

fn resolve(
    registry: &dyn ContractsRegistry,
    pooler: Arc<dyn SubscriptionPooler>,
) -> Result<ResolvedPooler, SubscriptionError> {
    let name = registry.contract_name(pooler.contract_type())?.to_owned();
    let sources = pooler
        .sources()
        .into_iter()
        .map(|s| -> Result<_, SubscriptionError> {
            Ok((registry.contract_name(s.contract_type())?.to_owned(), s))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let handlers = pooler
        .handlers()
        .into_iter()
        .map(|h| -> Result<_, SubscriptionError> {
            Ok((registry.contract_name(h.contract_type())?.to_owned(), h))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ResolvedPooler {
        name,
        pooler,
        sources,
        handlers,
    })
}

async fn prepare(
    pooler: &ResolvedPooler,
    checkpoints: &dyn CheckpointStore,
    registry: &dyn ContractsRegistry,
) -> Result<(), SubscriptionError> {
    let handler_names: Vec<&str> = pooler.handlers.iter().map(|(n, _)| n.as_str()).collect();
    let source_names: Vec<&str> = pooler.sources.iter().map(|(n, _)| n.as_str()).collect();
    let removed = checkpoints
        .remove_not_used_states(&pooler.name, &handler_names, &source_names)
        .await
        .map_err(SubscriptionError::Checkpoint)?;
    if removed > 0 {
        tracing::info!(pooler = %pooler.name, removed, "removed unused checkpoints");
    }

    pooler
        .pooler
        .on_start(registry)
        .await
        .map_err(|source| SubscriptionError::Startup {
            pooler: pooler.name.clone(),
            source,
        })
}

/// Running subscriptions: one [`Runner`] per registered pooler.
///
/// Dropping the coordinator signals every runner to stop without waiting;
/// use [`dispose`](Self::dispose) to wait for in-flight handlers.
pub struct EventStoreSubscriptions {
    runners: Vec<Runner>,
    registry: Arc<dyn ContractsRegistry>,
}

impl EventStoreSubscriptions {
    /// The registry the poolers were resolved against.
    pub fn contracts_registry(&self) -> &dyn ContractsRegistry {
        self.registry.as_ref()
    }

    /// Every runner, in registration order.
    pub fn runners(&self) -> &[Runner] {
        &self.runners
    }

    fn runner(&self, type_id: TypeId) -> Option<&Runner> {
        self.runners
            .iter()
            .find(|r| r.pooler().contract_type().id() == type_id)
    }

    /// Restart the runner for pooler type `P` if it is stopped.
    ///
    /// # Errors
    ///
    /// [`SubscriptionError::UnknownPooler`] if `P` was never registered.
    pub fn run_pooler<P: SubscriptionPooler>(&self) -> Result<(), SubscriptionError> {
        self.run_pooler_by_type(ContractType::of::<P>())
    }

    /// Restart the runner for the pooler with runtime type `ty`.
    ///
    /// # Errors
    ///
    /// [`SubscriptionError::UnknownPooler`] if no pooler has that type.
    pub fn run_pooler_by_type(&self, ty: ContractType) -> Result<(), SubscriptionError> {
        let runner = self
            .runner(ty.id())
            .ok_or_else(|| SubscriptionError::UnknownPooler(ty.type_name().to_owned()))?;
        runner.start();
        Ok(())
    }

    /// Start every runner that is not running, including halted ones.
    pub fn run_stopped_poolers(&self) {
        for runner in &self.runners {
            runner.start();
        }
    }

    /// Returns `true` if the runner for `P` is alive.
    pub fn is_running<P: SubscriptionPooler>(&self) -> bool {
        self.runner(TypeId::of::<P>())
            .is_some_and(Runner::is_running)
    }

    /// Cut every runner's idle sleep short.
    pub fn wake_all(&self) {
        for runner in &self.runners {
            runner.wake();
        }
    }

    /// Stop every runner and wait for in-flight handlers to finish.
    pub async fn stop_all(&self) {
        for runner in &self.runners {
            runner.stop().await;
        }
    }

    /// Stop every runner and release them.
    pub async fn dispose(self) {
        self.stop_all().await;
        tracing::info!(poolers = self.runners.len(), "subscriptions disposed");
    }
}
