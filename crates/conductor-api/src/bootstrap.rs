// Dependency container
//
// Constructs the adapters (bus, KV, store), builds the schema registry,
// wires the services, and starts the background loops. Shutdown tears
// everything down in reverse construction order.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use conductor_bus::{
    InMemoryBus, InMemoryKvStore, KvStore, MessageBus, RedisBus, RedisKvStore,
    SubscriptionHandle,
};
use conductor_contracts::SchemaRegistry;
use conductor_core::{
    EventBus, OrchestratorConfig, StateMachineService, TaskSweeper, WorkflowService,
};
use conductor_storage::{InMemoryWorkflowStore, PostgresWorkflowStore, WorkflowStore};

/// The running orchestrator: adapters, services, background loops.
pub struct Orchestrator {
    pub config: Arc<OrchestratorConfig>,
    pub store: Arc<dyn WorkflowStore>,
    pub bus: Arc<dyn MessageBus>,
    pub kv: Arc<dyn KvStore>,
    pub registry: Arc<SchemaRegistry>,
    pub workflow_service: Arc<WorkflowService>,

    state_machine_task: tokio::task::JoinHandle<()>,
    sweeper_task: tokio::task::JoinHandle<()>,
    sweeper_token: CancellationToken,
    result_subscription: Option<SubscriptionHandle>,
}

impl Orchestrator {
    /// Build and start everything.
    ///
    /// The state machine subscribes to the internal event bus before the
    /// result subscription attaches, and the result subscription's consumer
    /// group drains unacknowledged stream entries as part of coming up, so
    /// a restart resumes in-flight workflows without operator action.
    pub async fn start(config: OrchestratorConfig) -> Result<Self> {
        let config = Arc::new(config);

        let (bus, kv): (Arc<dyn MessageBus>, Arc<dyn KvStore>) = if config.in_memory {
            tracing::info!("using in-memory bus and KV adapters");
            (Arc::new(InMemoryBus::new()), Arc::new(InMemoryKvStore::new()))
        } else {
            let bus = RedisBus::connect(&config.bus_url)
                .await
                .context("failed to connect message bus")?;
            let kv = RedisKvStore::connect(&config.bus_url)
                .await
                .context("failed to connect KV store")?;
            tracing::info!(url = %config.bus_url, "connected to redis");
            (Arc::new(bus), Arc::new(kv))
        };

        let store: Arc<dyn WorkflowStore> = match (&config.database_url, config.in_memory) {
            (Some(url), false) => {
                let store = PostgresWorkflowStore::connect(url, 16)
                    .await
                    .context("failed to connect database")?;
                tracing::info!("connected to database");
                Arc::new(store)
            }
            _ => {
                tracing::info!("using in-memory workflow store");
                Arc::new(InMemoryWorkflowStore::new())
            }
        };

        let registry = Arc::new(SchemaRegistry::with_builtins());
        let events = EventBus::new();

        let workflow_service = Arc::new(WorkflowService::new(
            store.clone(),
            bus.clone(),
            kv.clone(),
            registry.clone(),
            events.clone(),
            config.clone(),
        ));

        // State machine first: it must be listening before anything can
        // emit WORKFLOW_CREATED or STAGE_COMPLETE.
        let state_machine = Arc::new(StateMachineService::new(
            store.clone(),
            kv.clone(),
            workflow_service.clone(),
            events.clone(),
            config.clone(),
        ));
        let state_machine_task = state_machine.start();

        // Result ingestion: attaching the consumer group replays pending
        // entries left over from a previous run.
        let result_subscription = workflow_service
            .start_result_ingestion()
            .await
            .context("failed to subscribe to agent results")?;

        let sweeper = Arc::new(TaskSweeper::new(
            store.clone(),
            workflow_service.clone(),
            events,
            &config,
        ));
        let sweeper_token = CancellationToken::new();
        let sweeper_task = sweeper.start(sweeper_token.clone());

        tracing::info!(worker_id = %config.worker_id, "orchestrator started");

        Ok(Self {
            config,
            store,
            bus,
            kv,
            registry,
            workflow_service,
            state_machine_task,
            sweeper_task,
            sweeper_token,
            result_subscription: Some(result_subscription),
        })
    }

    /// Tear down in reverse construction order: sweeper, result
    /// subscription, state machine, then the broker connections.
    pub async fn shutdown(mut self) {
        tracing::info!("orchestrator shutting down");

        self.sweeper_token.cancel();
        if let Err(e) = self.sweeper_task.await {
            tracing::warn!(error = %e, "sweeper task did not stop cleanly");
        }

        if let Some(subscription) = self.result_subscription.take() {
            if let Err(e) = self.bus.unsubscribe(subscription).await {
                tracing::warn!(error = %e, "result subscription did not detach cleanly");
            }
        }

        self.state_machine_task.abort();

        if let Err(e) = self.bus.disconnect().await {
            tracing::warn!(error = %e, "bus disconnect failed");
        }

        tracing::info!("orchestrator stopped");
    }
}
