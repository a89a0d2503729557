// End-to-end orchestration scenarios over the in-memory adapters

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use conductor_bus::{
    Ack, InMemoryBus, InMemoryKvStore, KvStore, MessageBus, MessageHandler, PublishOptions,
    SubscribeOptions,
};
use conductor_contracts::{
    AgentEnvelope, AgentResult, AgentType, ResultBody, ResultMetrics, ResultStatus,
    SchemaRegistry, Stage, TaskStatus, Workflow, WorkflowStatus, WorkflowType, RESULT_VERSION,
};
use conductor_core::{
    CreateWorkflowRequest, EventBus, OrchestratorConfig, OrchestratorEvent, StateMachineService,
    TaskSweeper, WorkflowService, RESULTS_GROUP, RESULTS_TOPIC,
};
use conductor_storage::{InMemoryWorkflowStore, WorkflowStore};
use tokio_util::sync::CancellationToken;

const RESULTS_STREAM: &str = "stream:agent:results";

/// Everything one orchestrator instance needs, over shared adapters.
struct Orchestrator {
    service: Arc<WorkflowService>,
    events: EventBus,
    sweeper_token: CancellationToken,
    subscription: Option<conductor_bus::SubscriptionHandle>,
    state_machine_task: tokio::task::JoinHandle<()>,
    bus: Arc<dyn MessageBus>,
}

impl Orchestrator {
    async fn start(
        bus: Arc<dyn MessageBus>,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn WorkflowStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(SchemaRegistry::with_builtins());
        let events = EventBus::new();

        let service = Arc::new(WorkflowService::new(
            store.clone(),
            bus.clone(),
            kv.clone(),
            registry,
            events.clone(),
            config.clone(),
        ));

        let state_machine = Arc::new(StateMachineService::new(
            store.clone(),
            kv,
            service.clone(),
            events.clone(),
            config.clone(),
        ));
        let state_machine_task = state_machine.start();

        let subscription = service.start_result_ingestion().await.unwrap();

        let sweeper = Arc::new(TaskSweeper::new(
            store,
            service.clone(),
            events.clone(),
            &config,
        ));
        let sweeper_token = CancellationToken::new();
        sweeper.start(sweeper_token.clone());

        Self {
            service,
            events,
            sweeper_token,
            subscription: Some(subscription),
            state_machine_task,
            bus,
        }
    }

    /// Simulate a crash: all background work stops, nothing is flushed.
    async fn crash(mut self) {
        self.sweeper_token.cancel();
        if let Some(subscription) = self.subscription.take() {
            self.bus.unsubscribe(subscription).await.unwrap();
        }
        self.state_machine_task.abort();
    }
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        sweep_interval: Duration::from_millis(25),
        default_timeout: Duration::from_secs(30),
        park_after_attempts: 3,
        ..Default::default()
    }
}

fn create_request(name: &str) -> CreateWorkflowRequest {
    CreateWorkflowRequest {
        workflow_type: WorkflowType::Feature,
        name: name.to_string(),
        description: None,
        requirements: serde_json::json!({"summary": "add a widget"}),
        priority: None,
        trace_id: None,
    }
}

fn success_result(envelope: &AgentEnvelope, output: serde_json::Value) -> AgentResult {
    AgentResult {
        message_id: Uuid::now_v7(),
        task_id: envelope.task_id,
        workflow_id: envelope.workflow_id,
        agent_id: format!("{}-sim", envelope.agent_type),
        agent_type: envelope.agent_type,
        stage: envelope.workflow_context.current_stage,
        success: true,
        status: ResultStatus::Success,
        version: RESULT_VERSION.to_string(),
        result: ResultBody {
            output: output.as_object().cloned().unwrap_or_default(),
        },
        errors: vec![],
        metrics: ResultMetrics {
            duration_ms: 5,
            extra: serde_json::Map::new(),
        },
        timestamp: Utc::now(),
        trace: envelope.trace.child(),
    }
}

async fn publish_result(bus: &dyn MessageBus, result: &AgentResult) {
    bus.publish(
        RESULTS_TOPIC,
        &result.to_wire(),
        PublishOptions::mirrored(RESULTS_STREAM, result.workflow_id.to_string()),
    )
    .await
    .unwrap();
}

/// Attach a simulated agent that answers every task on its topic.
async fn spawn_agent(
    bus: Arc<dyn MessageBus>,
    agent_type: AgentType,
    respond: impl Fn(&AgentEnvelope) -> Option<AgentResult> + Send + Sync + 'static,
) {
    let respond = Arc::new(respond);
    let publish_bus = bus.clone();
    let handler: MessageHandler = Arc::new(move |delivery| {
        let bus = publish_bus.clone();
        let respond = respond.clone();
        async move {
            let envelope: AgentEnvelope =
                serde_json::from_value(delivery.payload).expect("task envelope decodes");
            if let Some(result) = respond(&envelope) {
                publish_result(bus.as_ref(), &result).await;
            }
            Ack::Ack
        }
        .boxed()
    });
    bus.subscribe(&agent_type.task_topic(), handler, SubscribeOptions::default())
        .await
        .unwrap();
}

/// Capture task envelopes published to one agent topic without replying.
async fn capture_tasks(
    bus: Arc<dyn MessageBus>,
    agent_type: AgentType,
) -> mpsc::UnboundedReceiver<AgentEnvelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |delivery| {
        let tx = tx.clone();
        async move {
            let envelope: AgentEnvelope =
                serde_json::from_value(delivery.payload).expect("task envelope decodes");
            let _ = tx.send(envelope);
            Ack::Ack
        }
        .boxed()
    });
    bus.subscribe(&agent_type.task_topic(), handler, SubscribeOptions::default())
        .await
        .unwrap();
    rx
}

async fn wait_for_workflow(
    store: &dyn WorkflowStore,
    workflow_id: Uuid,
    timeout: Duration,
    predicate: impl Fn(&Workflow) -> bool,
) -> Workflow {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let workflow = store.find_by_id(workflow_id).await.unwrap();
        if predicate(&workflow) {
            return workflow;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "workflow {workflow_id} did not reach expected state; stuck at stage {} status {}",
                workflow.current_stage, workflow.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain_stage_completes(
    rx: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
    stage: Stage,
) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if let OrchestratorEvent::StageComplete {
            stage: event_stage,
            success: true,
            ..
        } = event
        {
            if event_stage == stage {
                count += 1;
            }
        }
    }
    count
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_happy_path_runs_the_full_pipeline() {
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let kv = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryWorkflowStore::new());
    let orchestrator =
        Orchestrator::start(bus.clone(), kv.clone(), store.clone(), test_config()).await;

    for agent_type in [
        AgentType::Scaffold,
        AgentType::Validate,
        AgentType::E2e,
        AgentType::Integrate,
        AgentType::Deploy,
    ] {
        spawn_agent(bus.clone(), agent_type, move |envelope| {
            Some(success_result(
                envelope,
                serde_json::json!({"files": [{"path": "src/a.ts"}]}),
            ))
        })
        .await;
    }

    let mut event_rx = orchestrator.events.subscribe();
    let created = orchestrator
        .service
        .create_workflow(create_request("happy-path"))
        .await
        .unwrap();
    assert_eq!(created.current_stage, Stage::Initialization);
    assert_eq!(created.status, WorkflowStatus::Initiated);

    let done = wait_for_workflow(store.as_ref(), created.id, Duration::from_secs(5), |w| {
        w.status == WorkflowStatus::Completed
    })
    .await;

    assert_eq!(done.current_stage, Stage::Completed);
    assert_eq!(done.progress_percentage, 100);
    assert_eq!(
        done.stage_outputs["scaffolding"],
        serde_json::json!({"files": [{"path": "src/a.ts"}]})
    );
    for stage in conductor_contracts::stage_sequence(WorkflowType::Feature) {
        assert!(
            done.stage_outputs.contains_key(stage.as_str()),
            "missing output for {stage}"
        );
    }
    // Requirements recorded at creation ride along as the initialization output
    assert_eq!(
        done.stage_outputs["initialization"]["requirements"]["summary"],
        "add a widget"
    );

    let tasks = store.list_tasks_for_workflow(created.id).await.unwrap();
    assert_eq!(tasks.len(), 5);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Succeeded));
    assert!(tasks.iter().all(|t| t.trace_id == done.trace_id));

    assert_eq!(drain_stage_completes(&mut event_rx, Stage::Scaffolding), 1);
}

#[tokio::test]
async fn test_duplicate_result_is_processed_once() {
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let kv = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryWorkflowStore::new());
    let orchestrator =
        Orchestrator::start(bus.clone(), kv.clone(), store.clone(), test_config()).await;

    let mut tasks = capture_tasks(bus.clone(), AgentType::Scaffold).await;
    let mut event_rx = orchestrator.events.subscribe();

    let created = orchestrator
        .service
        .create_workflow(create_request("duplicate-result"))
        .await
        .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(2), tasks.recv())
        .await
        .expect("scaffold task dispatched")
        .unwrap();

    // The agent's reply is delivered twice with the same message_id
    let result = success_result(&envelope, serde_json::json!({"files": []}));
    publish_result(bus.as_ref(), &result).await;
    publish_result(bus.as_ref(), &result).await;

    let advanced = wait_for_workflow(store.as_ref(), created.id, Duration::from_secs(5), |w| {
        w.current_stage == Stage::Validation
    })
    .await;

    assert_eq!(
        advanced.stage_outputs["scaffolding"],
        serde_json::json!({"files": []})
    );
    assert!(kv
        .get(&format!("seen:{}", result.message_id))
        .await
        .unwrap()
        .is_some());

    // Both copies settle; the second is acked as a replay
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(drain_stage_completes(&mut event_rx, Stage::Scaffolding), 1);
    assert_eq!(
        bus.pending_count(RESULTS_STREAM, RESULTS_GROUP),
        0,
        "duplicate delivery left unacked entries"
    );
}

#[tokio::test]
async fn test_malformed_result_is_parked_not_applied() {
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let kv = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryWorkflowStore::new());
    let orchestrator =
        Orchestrator::start(bus.clone(), kv.clone(), store.clone(), test_config()).await;

    let mut tasks = capture_tasks(bus.clone(), AgentType::Scaffold).await;
    let created = orchestrator
        .service
        .create_workflow(create_request("bad-result"))
        .await
        .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(2), tasks.recv())
        .await
        .expect("scaffold task dispatched")
        .unwrap();

    // Top-level `output` instead of the required result.output wrapper
    let mut wire = success_result(&envelope, serde_json::json!({"files": []})).to_wire();
    let body = wire["result"]
        .as_object_mut()
        .unwrap()
        .remove("output")
        .unwrap();
    wire.as_object_mut().unwrap().insert("output".into(), body);
    wire["result"] = serde_json::json!({});
    bus.publish(
        RESULTS_TOPIC,
        &wire,
        PublishOptions::mirrored(RESULTS_STREAM, envelope.workflow_id.to_string()),
    )
    .await
    .unwrap();

    // Redelivered until the validation retry budget is spent, then parked
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.parked_count() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "invalid result never parked"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let workflow = store.find_by_id(created.id).await.unwrap();
    assert_eq!(workflow.current_stage, Stage::Scaffolding);
    assert!(!workflow.stage_outputs.contains_key("scaffolding"));

    let parked = store
        .list_parked(conductor_storage::Page::default())
        .await
        .unwrap();
    assert_eq!(parked.len(), 1);
    assert!(parked[0].reason.contains("result.output"));
}

#[tokio::test]
async fn test_agent_timeout_retries_then_fails_workflow() {
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let kv = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryWorkflowStore::new());

    let mut config = test_config();
    config.default_timeout = Duration::from_millis(120);
    config.task_max_retries = 3;
    let orchestrator = Orchestrator::start(bus.clone(), kv, store.clone(), config).await;

    // No agent ever replies
    let created = orchestrator
        .service
        .create_workflow(create_request("timeout"))
        .await
        .unwrap();

    let failed = wait_for_workflow(store.as_ref(), created.id, Duration::from_secs(10), |w| {
        w.status == WorkflowStatus::Failed
    })
    .await;

    assert_eq!(failed.current_stage, Stage::Failed);
    assert_eq!(failed.errors.len(), 1);
    assert_eq!(failed.errors[0].code, "AGENT_TIMEOUT");

    // Initial dispatch plus three reissues, every one a fresh row and id
    let tasks = store.list_tasks_for_workflow(created.id).await.unwrap();
    assert_eq!(tasks.len(), 4);
    assert!(tasks.iter().all(|t| t.stage == Stage::Scaffolding));
    assert!(tasks.iter().all(|t| t.status == TaskStatus::TimedOut));
    let retry_counts: Vec<u32> = tasks.iter().map(|t| t.retry_count).collect();
    assert_eq!(retry_counts, vec![0, 1, 2, 3]);

    let mut task_ids: Vec<Uuid> = tasks.iter().map(|t| t.task_id).collect();
    task_ids.dedup();
    assert_eq!(task_ids.len(), 4);
}

#[tokio::test]
async fn test_concurrent_ingestion_applies_once() {
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let kv = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryWorkflowStore::new());

    // Primary orchestrator plus an independent subscriber in a second
    // consumer group: both see every result entry.
    let orchestrator =
        Orchestrator::start(bus.clone(), kv.clone(), store.clone(), test_config()).await;

    let registry = Arc::new(SchemaRegistry::with_builtins());
    let mut second_config = test_config();
    second_config.worker_id = "orchestrator-second".to_string();
    let second_service = Arc::new(WorkflowService::new(
        store.clone(),
        bus.clone(),
        kv.clone(),
        registry,
        orchestrator.events.clone(),
        Arc::new(second_config),
    ));
    let second_handler: MessageHandler = {
        let service = second_service.clone();
        Arc::new(move |delivery| {
            let service = service.clone();
            async move { service.ingest_result(delivery).await }.boxed()
        })
    };
    bus.subscribe(
        RESULTS_TOPIC,
        second_handler,
        SubscribeOptions {
            consumer_group: Some("orchestrator-second".to_string()),
            consumer_name: None,
            stream: Some(RESULTS_STREAM.to_string()),
        },
    )
    .await
    .unwrap();

    let mut tasks = capture_tasks(bus.clone(), AgentType::Scaffold).await;
    let mut event_rx = orchestrator.events.subscribe();
    let created = orchestrator
        .service
        .create_workflow(create_request("concurrent"))
        .await
        .unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(2), tasks.recv())
        .await
        .expect("scaffold task dispatched")
        .unwrap();
    let result = success_result(&envelope, serde_json::json!({"files": []}));
    publish_result(bus.as_ref(), &result).await;

    wait_for_workflow(store.as_ref(), created.id, Duration::from_secs(5), |w| {
        w.current_stage == Stage::Validation
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(drain_stage_completes(&mut event_rx, Stage::Scaffolding), 1);
}

#[tokio::test]
async fn test_restart_resumes_in_flight_workflow() {
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let kv: Arc<InMemoryKvStore> = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryWorkflowStore::new());

    let first = Orchestrator::start(bus.clone(), kv.clone(), store.clone(), test_config()).await;
    let mut tasks = capture_tasks(bus.clone(), AgentType::Scaffold).await;

    let created = first
        .service
        .create_workflow(create_request("restart"))
        .await
        .unwrap();
    let envelope = tokio::time::timeout(Duration::from_secs(2), tasks.recv())
        .await
        .expect("scaffold task dispatched")
        .unwrap();

    // Orchestrator dies before the agent answers
    first.crash().await;

    // The result lands while nobody is listening; the stream holds it
    let result = success_result(&envelope, serde_json::json!({"files": []}));
    publish_result(bus.as_ref(), &result).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let workflow = store.find_by_id(created.id).await.unwrap();
        assert_eq!(workflow.current_stage, Stage::Scaffolding);
    }

    // Restart: the consumer group drains the pending entry
    let _second = Orchestrator::start(bus.clone(), kv, store.clone(), test_config()).await;

    let resumed = wait_for_workflow(store.as_ref(), created.id, Duration::from_secs(5), |w| {
        w.current_stage == Stage::Validation
    })
    .await;
    assert_eq!(
        resumed.stage_outputs["scaffolding"],
        serde_json::json!({"files": []})
    );
}

#[tokio::test]
async fn test_stale_stage_result_is_rejected() {
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let kv = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryWorkflowStore::new());
    let orchestrator =
        Orchestrator::start(bus.clone(), kv, store.clone(), test_config()).await;

    let mut tasks = capture_tasks(bus.clone(), AgentType::Scaffold).await;
    let created = orchestrator
        .service
        .create_workflow(create_request("stale"))
        .await
        .unwrap();
    let envelope = tokio::time::timeout(Duration::from_secs(2), tasks.recv())
        .await
        .expect("scaffold task dispatched")
        .unwrap();

    // First copy advances the workflow to validation
    let result = success_result(&envelope, serde_json::json!({"files": []}));
    publish_result(bus.as_ref(), &result).await;
    wait_for_workflow(store.as_ref(), created.id, Duration::from_secs(5), |w| {
        w.current_stage == Stage::Validation
    })
    .await;

    // A different (new message_id) scaffolding result is now obsolete
    let stale = success_result(&envelope, serde_json::json!({"files": ["late"]}));
    publish_result(bus.as_ref(), &stale).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let workflow = store.find_by_id(created.id).await.unwrap();
    assert_eq!(workflow.current_stage, Stage::Validation);
    assert_eq!(
        workflow.stage_outputs["scaffolding"],
        serde_json::json!({"files": []})
    );
    assert_eq!(
        bus.pending_count(RESULTS_STREAM, RESULTS_GROUP),
        0,
        "stale result must be acked, not retried"
    );
}

#[tokio::test]
async fn test_decision_gate_parks_and_resumes() {
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let kv = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryWorkflowStore::new());

    let mut config = test_config();
    config.decision_stages = vec![Stage::Integration];
    let orchestrator = Orchestrator::start(bus.clone(), kv, store.clone(), config).await;

    for agent_type in [
        AgentType::Scaffold,
        AgentType::Validate,
        AgentType::E2e,
        AgentType::Integrate,
        AgentType::Deploy,
    ] {
        spawn_agent(bus.clone(), agent_type, move |envelope| {
            Some(success_result(envelope, serde_json::json!({"ok": true})))
        })
        .await;
    }

    let created = orchestrator
        .service
        .create_workflow(create_request("gated"))
        .await
        .unwrap();

    let parked = wait_for_workflow(store.as_ref(), created.id, Duration::from_secs(5), |w| {
        w.status == WorkflowStatus::AwaitingDecision
    })
    .await;
    assert_eq!(parked.current_stage, Stage::Integration);
    assert_eq!(
        parked.pending_decision.as_ref().unwrap().stage,
        Stage::Integration
    );

    orchestrator
        .service
        .resolve_decision(created.id, true, "release-manager")
        .await
        .unwrap();

    let done = wait_for_workflow(store.as_ref(), created.id, Duration::from_secs(5), |w| {
        w.status == WorkflowStatus::Completed
    })
    .await;
    assert!(done.pending_decision.is_none());
    assert!(done.stage_outputs.contains_key("deployment"));
}

#[tokio::test]
async fn test_cancel_stops_progression_and_ignores_late_results() {
    let bus: Arc<InMemoryBus> = Arc::new(InMemoryBus::new());
    let kv = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InMemoryWorkflowStore::new());
    let orchestrator =
        Orchestrator::start(bus.clone(), kv, store.clone(), test_config()).await;

    let mut tasks = capture_tasks(bus.clone(), AgentType::Scaffold).await;
    let created = orchestrator
        .service
        .create_workflow(create_request("cancel"))
        .await
        .unwrap();
    let envelope = tokio::time::timeout(Duration::from_secs(2), tasks.recv())
        .await
        .expect("scaffold task dispatched")
        .unwrap();

    let cancelled = orchestrator
        .service
        .cancel_workflow(created.id, "operator abort")
        .await
        .unwrap();
    assert_eq!(cancelled.status, WorkflowStatus::Failed);
    assert_eq!(cancelled.errors[0].code, "CANCELLED");

    // Cancelling twice is a conflict
    let err = orchestrator
        .service
        .cancel_workflow(created.id, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, conductor_core::ServiceError::Conflict(_)));

    // The in-flight agent answers after cancellation; nothing moves
    let late = success_result(&envelope, serde_json::json!({"files": []}));
    publish_result(bus.as_ref(), &late).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let workflow = store.find_by_id(created.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(!workflow.stage_outputs.contains_key("scaffolding"));
}
