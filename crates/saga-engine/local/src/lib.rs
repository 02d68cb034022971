//! # Local Saga Runtime
//!
//! This crate wires the saga-engine core onto tokio: a [`TokioTaskScheduler`]
//! drives deadline firing and retry redelivery, an optional
//! [`InMemoryDeadlineStore`] mirrors deadline state, and a
//! [`RetryingCommandGateway`] sends commands through the configured retry
//! policy.

pub mod config;
pub mod deadline_store;
pub mod task_scheduler;

pub use self::config::{ConfigLoadError, ConfigLoader, LocalRuntimeConfig};
pub use self::deadline_store::InMemoryDeadlineStore;
pub use self::task_scheduler::TokioTaskScheduler;

use saga_engine_core::error::classification::FailureClassifier;
use saga_engine_core::port::command_bus::CommandDispatcher;
use saga_engine_core::retry::{DelayedRetryScheduler, RetryingCommandGateway};
use saga_engine_core::saga::{SagaManager, SagaModel};
use saga_engine_core::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use saga_engine_core::{ConfigError, DeadlineManager, SagaEngineConfig};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Saga runtime for a single process.
///
/// # Examples
///
/// ```ignore
/// use saga_engine_local::LocalSagaRuntime;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let runtime = LocalSagaRuntime::testing()?;
///     let sagas = runtime.saga_manager(order_saga_model());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct LocalSagaRuntime {
    config: SagaEngineConfig,
    scheduler: TokioTaskScheduler,
    deadlines: Arc<DeadlineManager>,
    deadline_store: Option<InMemoryDeadlineStore>,
    retry_scheduler: Option<Arc<DelayedRetryScheduler>>,
    gateway: Option<RetryingCommandGateway>,
    telemetry: Option<TelemetryGuard>,
}

impl LocalSagaRuntime {
    /// Preset for tests and local development.
    ///
    /// - Default engine configuration
    /// - In-memory deadline store keeping terminal records
    /// - No command dispatcher
    pub fn testing() -> Result<Self, LocalRuntimeError> {
        Self::builder().with_in_memory_deadline_store().build()
    }

    /// Preset for small embedded deployments.
    ///
    /// - Default engine configuration
    /// - No deadline store
    pub fn embedded(dispatcher: Arc<dyn CommandDispatcher>) -> Result<Self, LocalRuntimeError> {
        Self::builder().with_dispatcher(dispatcher).build()
    }

    /// Preset reading configuration from the environment.
    ///
    /// - `env_file` loaded first when given
    /// - Telemetry initialized from `SAGA_LOG_LEVEL`
    pub fn from_env(
        env_file: Option<PathBuf>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Result<Self, LocalRuntimeError> {
        let loaded = ConfigLoader::new(env_file).load()?;
        Self::builder()
            .with_config(loaded.engine)
            .with_telemetry(loaded.telemetry)
            .with_dispatcher(dispatcher)
            .build()
    }

    pub fn builder() -> LocalSagaRuntimeBuilder {
        LocalSagaRuntimeBuilder::new()
    }

    pub fn config(&self) -> &SagaEngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &TokioTaskScheduler {
        &self.scheduler
    }

    pub fn deadline_manager(&self) -> &Arc<DeadlineManager> {
        &self.deadlines
    }

    /// The store deadline state is mirrored to, if configured.
    pub fn deadline_store(&self) -> Option<&InMemoryDeadlineStore> {
        self.deadline_store.as_ref()
    }

    pub fn retry_scheduler(&self) -> Option<&Arc<DelayedRetryScheduler>> {
        self.retry_scheduler.as_ref()
    }

    /// Gateway sending commands with retries. `None` without a dispatcher.
    pub fn command_gateway(&self) -> Option<&RetryingCommandGateway> {
        self.gateway.as_ref()
    }

    /// Saga manager for `model`, registered with this runtime's deadlines.
    pub fn saga_manager<S: Send + 'static>(&self, model: SagaModel<S>) -> Arc<SagaManager<S>> {
        SagaManager::new(model, Arc::clone(&self.deadlines))
    }

    /// Stop accepting new deadlines and retries, and wait for pending store
    /// updates to be applied.
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        self.deadlines.sync_store().await;
        info!(
            pending_deadlines = self.deadlines.pending_count(),
            "Local saga runtime shut down"
        );
        if let Some(guard) = self.telemetry {
            guard.shutdown();
        }
    }
}

/// Builder for custom local runtime configuration.
#[derive(Debug, Default)]
pub struct LocalSagaRuntimeBuilder {
    config: SagaEngineConfig,
    runtime: Option<Handle>,
    dispatcher: Option<Arc<dyn CommandDispatcher>>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    deadline_store: Option<InMemoryDeadlineStore>,
    telemetry: Option<TelemetryConfig>,
}

impl LocalSagaRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: SagaEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn scheduled work on `handle` instead of the current runtime.
    pub fn with_runtime_handle(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Enables the retry scheduler and the command gateway.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Replace the classifier built from `retry.retryable_kinds`.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_deadline_store(mut self, store: InMemoryDeadlineStore) -> Self {
        self.deadline_store = Some(store);
        self
    }

    pub fn with_in_memory_deadline_store(self) -> Self {
        self.with_deadline_store(InMemoryDeadlineStore::new())
    }

    /// Install the global tracing subscriber when building.
    pub fn with_telemetry(mut self, config: TelemetryConfig) -> Self {
        self.telemetry = Some(config);
        self
    }

    /// Build the runtime. Must be called within a tokio runtime unless a
    /// handle was given.
    pub fn build(self) -> Result<LocalSagaRuntime, LocalRuntimeError> {
        self.config.validate()?;

        let telemetry = match &self.telemetry {
            Some(config) => match init_telemetry(config) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    debug!(error = %e, "Tracing subscriber already installed");
                    None
                }
            },
            None => None,
        };

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| LocalRuntimeError::NoRuntime)?,
        };
        let _entered = runtime.enter();
        let scheduler = TokioTaskScheduler::with_handle(runtime.clone());

        let mut deadlines = DeadlineManager::builder()
            .scheduler(Arc::new(scheduler.clone()))
            .config(self.config.deadlines.clone());
        if let Some(store) = &self.deadline_store {
            deadlines = deadlines.store(Arc::new(store.clone()));
        }
        let deadlines = deadlines.build()?;

        let (retry_scheduler, gateway) = match self.dispatcher {
            Some(dispatcher) => {
                let mut builder = DelayedRetryScheduler::builder()
                    .retry_executor(Arc::new(scheduler.clone()))
                    .dispatcher(Arc::clone(&dispatcher))
                    .from_config(&self.config.retry)?;
                if let Some(classifier) = self.classifier {
                    builder = builder.classifier(classifier);
                }
                let retry_scheduler = Arc::new(builder.build()?);
                let gateway = RetryingCommandGateway::new(dispatcher)
                    .with_retry_scheduler(retry_scheduler.clone());
                (Some(retry_scheduler), Some(gateway))
            }
            None => (None, None),
        };

        info!(
            retry_interval_ms = self.config.retry.retry_interval_ms,
            max_retry_count = self.config.retry.max_retry_count,
            deadline_store = self.deadline_store.is_some(),
            command_gateway = gateway.is_some(),
            "Local saga runtime built"
        );

        Ok(LocalSagaRuntime {
            config: self.config,
            scheduler,
            deadlines,
            deadline_store: self.deadline_store,
            retry_scheduler,
            gateway,
            telemetry,
        })
    }
}

/// Errors from local runtime building.
#[derive(Debug, Error)]
pub enum LocalRuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ConfigLoad(#[from] ConfigLoadError),

    #[error("No tokio runtime available to run scheduled work")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_engine_core::event::Payload;
    use saga_engine_core::port::command_bus::{CommandMessage, DispatchError};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct EchoDispatcher;

    #[async_trait]
    impl CommandDispatcher for EchoDispatcher {
        async fn dispatch(&self, command: CommandMessage) -> Result<Payload, DispatchError> {
            Ok(command.payload)
        }
    }

    #[tokio::test]
    async fn test_testing_preset() {
        let runtime = LocalSagaRuntime::testing().unwrap();
        assert!(runtime.deadline_store().is_some());
        assert!(runtime.command_gateway().is_none());
        assert_eq!(runtime.config(), &SagaEngineConfig::default());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_embedded_preset_sends_commands() {
        let runtime = LocalSagaRuntime::embedded(Arc::new(EchoDispatcher)).unwrap();
        assert!(runtime.deadline_store().is_none());

        let reply = runtime
            .command_gateway()
            .unwrap()
            .send(CommandMessage::new(7u32))
            .await
            .unwrap();
        assert_eq!(reply.downcast_ref::<u32>(), Some(&7));
    }

    #[test]
    fn test_build_without_runtime_fails() {
        let result = LocalSagaRuntime::builder().build();
        assert!(matches!(result, Err(LocalRuntimeError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = SagaEngineConfig::default();
        config.retry.retry_interval_ms = 0;
        let result = LocalSagaRuntime::builder().with_config(config).build();
        assert!(matches!(result, Err(LocalRuntimeError::Config(_))));
    }
}
