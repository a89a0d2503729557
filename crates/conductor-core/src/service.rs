//! Workflow service
//!
//! The only writer of task rows and `stage_outputs`, and the only component
//! that dispatches tasks to agents and ingests their results. Stage
//! transitions belong to the state machine service; this service reports
//! stage completions to it over the internal event bus and executes the
//! dispatches it requests.

use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use conductor_bus::{
    stream_for_topic, Ack, Delivery, KvStore, MessageBus, MessageHandler, PublishOptions,
    SubscribeOptions, SubscriptionHandle,
};
use conductor_contracts::{
    is_valid_trace_id, new_span_id, AgentEnvelope, AgentResult, AgentType, EnvelopeMetadata,
    EnvelopeStatus, Priority, SchemaRegistry, Stage, TaskConstraints, TaskStatus, TraceContext,
    ValidationError, Workflow, WorkflowContext, WorkflowStatus, WorkflowType, ENVELOPE_SCHEMA,
    ENVELOPE_VERSION, RESULT_SCHEMA, RESULT_VERSION,
};
use conductor_storage::{
    NewParkedResult, NewTask, NewWorkflow, Page, ParkedResult, StoreError, TaskRecord,
    WorkflowFilter, WorkflowPatch, WorkflowStore,
};

use crate::config::OrchestratorConfig;
use crate::error::ServiceError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::idempotency::DedupGuard;
use crate::lock::{LockError, LockManager};

/// Topic agents publish results to.
pub const RESULTS_TOPIC: &str = "agent:results";

/// Consumer group the orchestrator's result subscription competes in.
pub const RESULTS_GROUP: &str = "orchestrator-workflow-service";

/// Bound on the load/apply loop when a CAS write keeps losing.
const CAS_APPLY_ATTEMPTS: u32 = 5;

/// Input for creating a workflow.
#[derive(Debug, Clone)]
pub struct CreateWorkflowRequest {
    pub workflow_type: WorkflowType,
    pub name: String,
    pub description: Option<String>,
    /// Client-supplied requirements; recorded as the initialization stage
    /// output so every later stage sees them in its workflow context
    pub requirements: serde_json::Value,
    pub priority: Option<Priority>,
    /// Externally supplied trace id (honored when well-formed)
    pub trace_id: Option<String>,
}

/// Workflow service.
pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<SchemaRegistry>,
    events: EventBus,
    locks: LockManager,
    dedup: DedupGuard,
    config: Arc<OrchestratorConfig>,
}

impl WorkflowService {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn MessageBus>,
        kv: Arc<dyn KvStore>,
        registry: Arc<SchemaRegistry>,
        events: EventBus,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let locks = LockManager::new(kv.clone(), config.worker_id.clone(), config.lock_ttl);
        let dedup = DedupGuard::new(kv, config.dedup_ttl);
        Self {
            store,
            bus,
            registry,
            events,
            locks,
            dedup,
            config,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Create and persist a workflow, record its requirements as the
    /// initialization output, and announce it to the state machine.
    #[instrument(skip(self, request), fields(name = %request.name, workflow_type = %request.workflow_type))]
    pub async fn create_workflow(
        &self,
        request: CreateWorkflowRequest,
    ) -> Result<Workflow, ServiceError> {
        if request.name.trim().is_empty() {
            return Err(ValidationError::new(
                "workflow_request",
                "1.0.0",
                "name",
                "must not be empty",
            )
            .into());
        }

        let trace_id = match request.trace_id {
            Some(supplied) if is_valid_trace_id(&supplied) => supplied,
            Some(supplied) => {
                debug!(%supplied, "ignoring malformed external trace id");
                conductor_contracts::trace::new_trace_id()
            }
            None => conductor_contracts::trace::new_trace_id(),
        };

        let created = self
            .store
            .create_workflow(NewWorkflow {
                id: Uuid::now_v7(),
                workflow_type: request.workflow_type,
                name: request.name,
                description: request.description,
                trace_id,
            })
            .await?;

        let workflow = self
            .store
            .record_stage_output(
                created.id,
                Stage::Initialization,
                serde_json::json!({
                    "requirements": request.requirements,
                    "priority": request.priority.unwrap_or_default(),
                }),
                created.version,
            )
            .await?;

        info!(workflow_id = %workflow.id, trace_id = %workflow.trace_id, "workflow created");
        self.events.publish(OrchestratorEvent::WorkflowCreated {
            workflow_id: workflow.id,
        });

        Ok(workflow)
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, ServiceError> {
        Ok(self.store.find_by_id(workflow_id).await?)
    }

    pub async fn list_workflows(
        &self,
        filter: WorkflowFilter,
        page: Page,
    ) -> Result<Vec<Workflow>, ServiceError> {
        Ok(self.store.list_with_filters(filter, page).await?)
    }

    pub async fn list_parked(&self, page: Page) -> Result<Vec<ParkedResult>, ServiceError> {
        Ok(self.store.list_parked(page).await?)
    }

    /// Cancel a workflow. No attempt is made to abort in-flight agent work;
    /// the terminal status makes late results fall out at the ingestion gate.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(
        &self,
        workflow_id: Uuid,
        reason: &str,
    ) -> Result<Workflow, ServiceError> {
        for _ in 0..CAS_APPLY_ATTEMPTS {
            let workflow = self.store.find_by_id(workflow_id).await?;
            if workflow.status.is_terminal() {
                return Err(ServiceError::Conflict(format!(
                    "workflow {workflow_id} is already {}",
                    workflow.status
                )));
            }

            let patch = WorkflowPatch {
                current_stage: Some(Stage::Failed),
                status: Some(WorkflowStatus::Failed),
                pending_decision: Some(None),
                errors: Some(vec![conductor_contracts::AgentFailure {
                    code: "CANCELLED".to_string(),
                    message: reason.to_string(),
                    recoverable: false,
                }]),
                ..Default::default()
            };

            match self.store.update(workflow_id, patch, workflow.version).await {
                Ok(updated) => {
                    info!(%workflow_id, %reason, "workflow cancelled");
                    return Ok(updated);
                }
                Err(e) if e.is_contention() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Fatal(format!(
            "cancel of workflow {workflow_id} lost the version race {CAS_APPLY_ATTEMPTS} times"
        )))
    }

    /// Hand a pending human decision to the state machine.
    pub async fn resolve_decision(
        &self,
        workflow_id: Uuid,
        approved: bool,
        decided_by: &str,
    ) -> Result<(), ServiceError> {
        let workflow = self.store.find_by_id(workflow_id).await?;
        if workflow.status != WorkflowStatus::AwaitingDecision {
            return Err(ServiceError::Conflict(format!(
                "workflow {workflow_id} is not awaiting a decision (status {})",
                workflow.status
            )));
        }

        info!(%workflow_id, approved, %decided_by, "decision resolved");
        self.events.publish(OrchestratorEvent::DecisionResolved {
            workflow_id,
            approved,
            decided_by: decided_by.to_string(),
        });
        Ok(())
    }

    // =========================================================================
    // Task dispatch
    // =========================================================================

    /// Build, validate, persist, and publish the task for one stage.
    ///
    /// A schema failure here is a producer bug, not runtime data, and
    /// surfaces as an error instead of being parked.
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id, %stage))]
    pub async fn dispatch_stage_task(
        &self,
        workflow: &Workflow,
        stage: Stage,
        retry_count: u32,
    ) -> Result<TaskRecord, ServiceError> {
        let agent_type = AgentType::for_stage(stage).ok_or_else(|| {
            ServiceError::Fatal(format!("stage {stage} has no agent to dispatch to"))
        })?;

        let timeout = self.config.timeout_for(stage);

        // The envelope's parent span is the workflow's current span: the
        // span of the most recent dispatch, or none for the first one.
        let parent_span_id = self
            .store
            .list_tasks_for_workflow(workflow.id)
            .await?
            .last()
            .map(|task| task.span_id.clone());
        let trace = TraceContext {
            trace_id: workflow.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id,
        };

        let mut payload = serde_json::Map::new();
        payload.insert(
            "stage".to_string(),
            serde_json::Value::String(stage.as_str().to_string()),
        );

        // Priority rides on the initialization output from creation time
        let priority = workflow
            .stage_outputs
            .get(Stage::Initialization.as_str())
            .and_then(|init| init.get("priority"))
            .and_then(|value| serde_json::from_value::<Priority>(value.clone()).ok())
            .unwrap_or_default();

        let envelope = AgentEnvelope {
            message_id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            workflow_id: workflow.id,
            agent_type,
            payload,
            constraints: TaskConstraints {
                timeout_ms: timeout.as_millis() as u64,
                max_retries: self.config.task_max_retries,
                required_confidence: TaskConstraints::default().required_confidence,
            },
            retry_count,
            priority,
            status: EnvelopeStatus::Pending,
            metadata: EnvelopeMetadata {
                envelope_version: ENVELOPE_VERSION.to_string(),
                created_at: Utc::now(),
                created_by: self.config.worker_id.clone(),
            },
            trace: trace.clone(),
            workflow_context: WorkflowContext {
                workflow_type: workflow.workflow_type,
                workflow_name: workflow.name.clone(),
                current_stage: stage,
                stage_outputs: workflow.stage_outputs.clone(),
            },
        };

        let wire = envelope.to_wire();
        self.registry
            .validate(ENVELOPE_SCHEMA, ENVELOPE_VERSION, &wire)?;

        let task = self
            .store
            .create_task(NewTask {
                task_id: envelope.task_id,
                workflow_id: workflow.id,
                agent_type,
                stage,
                retry_count,
                max_retries: self.config.task_max_retries,
                timeout_ms: timeout.as_millis() as u64,
                envelope: wire.clone(),
                trace_id: trace.trace_id.clone(),
                span_id: trace.span_id.clone(),
                parent_span_id: trace.parent_span_id.clone(),
                deadline_at: Utc::now() + chrono::Duration::milliseconds(timeout.as_millis() as i64),
            })
            .await?;

        let topic = agent_type.task_topic();
        let options = PublishOptions {
            key: Some(workflow.id.to_string()),
            mirror_to_stream: Some(agent_type.task_stream()),
            ttl: None,
        };
        self.config
            .retry
            .run(
                || self.bus.publish(&topic, &wire, options.clone()),
                |e| e.is_transient(),
            )
            .await?;

        self.store
            .update_task_status(task.task_id, TaskStatus::Dispatched)
            .await?;

        info!(
            task_id = %task.task_id,
            message_id = %envelope.message_id,
            trace_id = %trace.trace_id,
            %topic,
            retry_count,
            "task dispatched"
        );

        Ok(task)
    }

    // =========================================================================
    // Result ingestion
    // =========================================================================

    /// Attach the single service-lifetime subscription to `agent:results`.
    ///
    /// All correlation back to workflows happens through the `workflow_id`
    /// carried by the result and the distributed lock; there are no
    /// per-workflow handlers to leak.
    pub async fn start_result_ingestion(
        self: &Arc<Self>,
    ) -> Result<SubscriptionHandle, ServiceError> {
        let service = self.clone();
        let handler: MessageHandler = Arc::new(move |delivery| {
            let service = service.clone();
            async move { service.ingest_result(delivery).await }.boxed()
        });

        let options = SubscribeOptions {
            consumer_group: Some(RESULTS_GROUP.to_string()),
            consumer_name: Some(self.config.worker_id.clone()),
            stream: Some(stream_for_topic(RESULTS_TOPIC)),
        };

        Ok(self.bus.subscribe(RESULTS_TOPIC, handler, options).await?)
    }

    /// Process one result delivery through the full ingestion pipeline:
    /// validate, dedup, lock, gate, write, emit, ack. Normally invoked by
    /// the bus subscription; public so alternate transports can drive it.
    pub async fn ingest_result(&self, delivery: Delivery) -> Ack {
        // Consumer-side validation: defense in depth behind the producer
        // check agents run before publishing.
        if let Err(e) = self
            .registry
            .validate(RESULT_SCHEMA, RESULT_VERSION, &delivery.payload)
        {
            return self.reject_invalid(&delivery, e.to_string()).await;
        }

        let result: AgentResult = match serde_json::from_value(delivery.payload.clone()) {
            Ok(result) => result,
            Err(e) => {
                return self
                    .reject_invalid(&delivery, format!("decode failure: {e}"))
                    .await;
            }
        };

        let message_id = result.message_id.to_string();

        // At-most-once: claim the message id before touching the workflow.
        match self.dedup.claim(&message_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(%message_id, workflow_id = %result.workflow_id, "replayed result; acking");
                return Ack::Ack;
            }
            Err(e) => {
                warn!(%message_id, error = %e, "dedup claim failed; leaving for redelivery");
                return Ack::Retry;
            }
        }

        // One workflow, one worker at a time.
        let guard = match self.locks.acquire(result.workflow_id).await {
            Ok(guard) => guard,
            Err(LockError::Busy(workflow_id)) => {
                debug!(%workflow_id, %message_id, "workflow locked; releasing entry");
                let _ = self.dedup.unclaim(&message_id).await;
                return Ack::Retry;
            }
            Err(LockError::Kv(e)) => {
                warn!(%message_id, error = %e, "lock acquisition failed");
                let _ = self.dedup.unclaim(&message_id).await;
                return Ack::Retry;
            }
        };

        let outcome = self.apply_result(&result).await;
        guard.release().await;

        match outcome {
            Ok(ack) => ack,
            Err(e) if e.is_transient() => {
                warn!(
                    %message_id,
                    workflow_id = %result.workflow_id,
                    trace_id = %result.trace.trace_id,
                    error = %e,
                    "transient failure applying result; releasing entry"
                );
                let _ = self.dedup.unclaim(&message_id).await;
                Ack::Retry
            }
            Err(e) => {
                warn!(
                    %message_id,
                    workflow_id = %result.workflow_id,
                    trace_id = %result.trace.trace_id,
                    error = %e,
                    "failed to apply result; acking to avoid wedging the group"
                );
                Ack::Ack
            }
        }
    }

    /// Schema-invalid results stay unacked until the retry budget is spent,
    /// then they are parked for the DLQ.
    async fn reject_invalid(&self, delivery: &Delivery, reason: String) -> Ack {
        warn!(
            message_id = delivery.message_id.as_deref().unwrap_or("-"),
            attempt = delivery.attempt,
            %reason,
            payload = %delivery.payload,
            "result failed validation"
        );

        if delivery.attempt < self.config.park_after_attempts {
            return Ack::Retry;
        }

        match self
            .store
            .park_result(NewParkedResult {
                payload: delivery.payload.clone(),
                reason: reason.clone(),
                error_history: vec![reason],
            })
            .await
        {
            Ok(parked) => {
                warn!(parked_id = %parked.id, "invalid result parked for operator attention");
                Ack::Ack
            }
            Err(e) => {
                warn!(error = %e, "failed to park invalid result; leaving on stream");
                Ack::Retry
            }
        }
    }

    /// Steps 4-6 of the ingestion pipeline, executed under the workflow lock.
    async fn apply_result(&self, result: &AgentResult) -> Result<Ack, ServiceError> {
        let mut workflow = match self.store.find_by_id(result.workflow_id).await {
            Ok(workflow) => workflow,
            Err(StoreError::WorkflowNotFound(id)) => {
                warn!(workflow_id = %id, "result for unknown workflow; acking");
                return Ok(Ack::Ack);
            }
            Err(e) => return Err(e.into()),
        };

        if workflow.status.is_terminal() {
            info!(
                workflow_id = %workflow.id,
                status = %workflow.status,
                stage = %result.stage,
                "late result for terminal workflow; ignoring"
            );
            return Ok(Ack::Ack);
        }

        // Defensive gate: a stale result must not overwrite a more advanced
        // workflow. The entry is obsolete, not invalid, so it is acked.
        if workflow.current_stage != result.stage {
            warn!(
                workflow_id = %workflow.id,
                current_stage = %workflow.current_stage,
                result_stage = %result.stage,
                message_id = %result.message_id,
                "stage mismatch; dropping obsolete result"
            );
            return Ok(Ack::Ack);
        }

        // Task bookkeeping is best-effort: the row may belong to a retry
        // that another sweep already closed.
        let task_status = if result.success {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        if let Err(e) = self.store.update_task_status(result.task_id, task_status).await {
            debug!(task_id = %result.task_id, error = %e, "task status update skipped");
        }

        if result.success {
            let output = serde_json::Value::Object(result.result.output.clone());
            let mut recorded = false;
            for _ in 0..CAS_APPLY_ATTEMPTS {
                match self
                    .store
                    .record_stage_output(
                        workflow.id,
                        result.stage,
                        output.clone(),
                        workflow.version,
                    )
                    .await
                {
                    Ok(_) => {
                        recorded = true;
                        break;
                    }
                    Err(e) if e.is_contention() => {
                        workflow = self.store.find_by_id(workflow.id).await?;
                        if workflow.current_stage != result.stage || workflow.status.is_terminal() {
                            // The world moved on while we were retrying
                            return Ok(Ack::Ack);
                        }
                    }
                    Err(StoreError::StageOutputExists { .. }) => {
                        info!(
                            workflow_id = %workflow.id,
                            stage = %result.stage,
                            "stage output already recorded; treating as replay"
                        );
                        return Ok(Ack::Ack);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if !recorded {
                return Err(ServiceError::Fatal(format!(
                    "stage output write for workflow {} lost the version race {CAS_APPLY_ATTEMPTS} times",
                    workflow.id
                )));
            }
        }

        info!(
            workflow_id = %workflow.id,
            stage = %result.stage,
            success = result.success,
            message_id = %result.message_id,
            trace_id = %result.trace.trace_id,
            "stage complete"
        );
        self.events.publish(OrchestratorEvent::StageComplete {
            workflow_id: workflow.id,
            stage: result.stage,
            success: result.success,
            output: serde_json::Value::Object(result.result.output.clone()),
            errors: result.errors.clone(),
        });

        Ok(Ack::Ack)
    }
}
