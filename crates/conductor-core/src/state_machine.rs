//! Workflow state machine service
//!
//! The sole writer of `current_stage` and `status`. Driven exclusively by
//! internal events: `WorkflowCreated` bootstraps a workflow into its first
//! pipeline stage, `StageComplete` advances (or fails) it, and
//! `DecisionResolved` releases a parked decision gate.
//!
//! Transitions are planned as a pure function of (workflow, event) and
//! persisted with compare-and-swap; on a version conflict the event is
//! replanned against a fresh load, which is safe precisely because the
//! planner is pure.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use conductor_bus::KvStore;
use conductor_contracts::{
    next_stage, progress_for, AgentFailure, PendingDecision, Stage, Workflow, WorkflowStatus,
};
use conductor_storage::{StoreError, WorkflowPatch, WorkflowStore};

use crate::config::OrchestratorConfig;
use crate::error::ServiceError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::service::WorkflowService;

/// Bound on the load/plan/apply loop when CAS keeps losing.
const CAS_APPLY_ATTEMPTS: u32 = 5;

/// Planned outcome of one event against one workflow snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Move to a pipeline stage and dispatch its task
    Advance { next: Stage },
    /// Sequence exhausted; the workflow is done
    Complete,
    /// Park the workflow until a human decides
    AwaitDecision { stage: Stage },
    /// Re-dispatch the same stage after a recoverable failure
    RetryStage { stage: Stage, retry_count: u32 },
    /// Terminal failure
    Fail { errors: Vec<AgentFailure> },
    /// Event does not apply to this snapshot
    Ignore { reason: &'static str },
}

/// Plan the transition for an event against a workflow snapshot.
///
/// Pure: no I/O, no clock reads beyond what the caller supplies.
/// `dispatch_count` is the number of task rows already created for the
/// event's stage (used to budget business-failure retries).
pub fn plan_transition(
    workflow: &Workflow,
    event: &OrchestratorEvent,
    config: &OrchestratorConfig,
    dispatch_count: u32,
) -> Transition {
    match event {
        OrchestratorEvent::WorkflowCreated { .. } => {
            if workflow.status != WorkflowStatus::Initiated {
                return Transition::Ignore {
                    reason: "workflow already started",
                };
            }
            match next_stage(workflow.workflow_type, Stage::Initialization) {
                Some(first) => Transition::Advance { next: first },
                None => Transition::Fail {
                    errors: vec![unknown_stage_error(Stage::Initialization)],
                },
            }
        }

        OrchestratorEvent::StageComplete {
            stage,
            success,
            errors,
            ..
        } => {
            if workflow.status.is_terminal() {
                return Transition::Ignore {
                    reason: "workflow is terminal",
                };
            }
            if workflow.current_stage != *stage {
                return Transition::Ignore {
                    reason: "event stage does not match current stage",
                };
            }

            if !success {
                let recoverable = errors.iter().any(|e| e.recoverable);
                if recoverable && dispatch_count <= config.task_max_retries {
                    return Transition::RetryStage {
                        stage: *stage,
                        retry_count: dispatch_count,
                    };
                }
                return Transition::Fail {
                    errors: errors.clone(),
                };
            }

            if config.requires_decision(*stage) {
                return Transition::AwaitDecision { stage: *stage };
            }

            match next_stage(workflow.workflow_type, *stage) {
                Some(next) => Transition::Advance { next },
                None => Transition::Complete,
            }
        }

        OrchestratorEvent::DecisionResolved { approved, .. } => {
            if workflow.status != WorkflowStatus::AwaitingDecision {
                return Transition::Ignore {
                    reason: "workflow is not awaiting a decision",
                };
            }
            let Some(pending) = &workflow.pending_decision else {
                return Transition::Ignore {
                    reason: "no pending decision recorded",
                };
            };

            if !approved {
                return Transition::Fail {
                    errors: vec![AgentFailure {
                        code: "DECISION_REJECTED".to_string(),
                        message: format!("decision gate after {} was rejected", pending.stage),
                        recoverable: false,
                    }],
                };
            }

            match next_stage(workflow.workflow_type, pending.stage) {
                Some(next) => Transition::Advance { next },
                None => Transition::Complete,
            }
        }
    }
}

fn unknown_stage_error(stage: Stage) -> AgentFailure {
    AgentFailure {
        code: "UNKNOWN_NEXT_STAGE".to_string(),
        message: format!("no next stage defined after {stage}"),
        recoverable: false,
    }
}

/// State machine service.
pub struct StateMachineService {
    store: Arc<dyn WorkflowStore>,
    kv: Arc<dyn KvStore>,
    service: Arc<WorkflowService>,
    config: Arc<OrchestratorConfig>,
    /// Subscribed at construction so no event published after `new` is lost;
    /// consumed by `start`
    receiver: std::sync::Mutex<Option<broadcast::Receiver<OrchestratorEvent>>>,
}

impl StateMachineService {
    /// Build the service and subscribe to the event bus immediately.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        kv: Arc<dyn KvStore>,
        service: Arc<WorkflowService>,
        events: EventBus,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let receiver = std::sync::Mutex::new(Some(events.subscribe()));
        Self {
            store,
            kv,
            service,
            config,
            receiver,
        }
    }

    /// Run the event loop until the event bus closes.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut receiver = self
            .receiver
            .lock()
            .expect("receiver slot poisoned")
            .take()
            .expect("state machine service started twice");
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropped events are recovered by stream redelivery
                        // upstream; log loudly, they should be rare.
                        error!(skipped, "state machine lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("state machine event loop stopped");
        })
    }

    #[instrument(skip(self, event), fields(workflow_id = %event.workflow_id()))]
    async fn handle_event(&self, event: OrchestratorEvent) {
        let workflow_id = event.workflow_id();
        if let Err(e) = self.apply_event(&event).await {
            error!(%workflow_id, error = %e, "transition failed; failing workflow");
            self.fail_workflow_fatally(workflow_id, &e).await;
        }
    }

    async fn apply_event(&self, event: &OrchestratorEvent) -> Result<(), ServiceError> {
        let workflow_id = event.workflow_id();

        for _ in 0..CAS_APPLY_ATTEMPTS {
            let workflow = match self.store.find_by_id(workflow_id).await {
                Ok(workflow) => workflow,
                Err(StoreError::WorkflowNotFound(_)) => {
                    warn!(%workflow_id, "event for unknown workflow; dropping");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let dispatch_count = match event {
                OrchestratorEvent::StageComplete { stage, success, .. } if !success => {
                    self.count_dispatches(workflow_id, *stage).await?
                }
                _ => 0,
            };

            let transition = plan_transition(&workflow, event, &self.config, dispatch_count);
            debug!(%workflow_id, ?transition, version = workflow.version, "planned transition");

            match transition {
                Transition::Ignore { reason } => {
                    debug!(%workflow_id, reason, "event ignored");
                    return Ok(());
                }

                Transition::RetryStage { stage, retry_count } => {
                    info!(%workflow_id, %stage, retry_count, "retrying stage after recoverable failure");
                    self.service
                        .dispatch_stage_task(&workflow, stage, retry_count)
                        .await?;
                    return Ok(());
                }

                Transition::Advance { next } => {
                    let patch = WorkflowPatch {
                        current_stage: Some(next),
                        status: Some(WorkflowStatus::Running),
                        progress_percentage: Some(progress_for(workflow.workflow_type, next)),
                        pending_decision: Some(None),
                        ..Default::default()
                    };
                    match self.store.update(workflow_id, patch, workflow.version).await {
                        Ok(updated) => {
                            info!(
                                %workflow_id,
                                stage = %next,
                                progress = updated.progress_percentage,
                                trace_id = %updated.trace_id,
                                "workflow advanced"
                            );
                            self.snapshot(&updated).await;
                            self.service.dispatch_stage_task(&updated, next, 0).await?;
                            return Ok(());
                        }
                        Err(e) if e.is_contention() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }

                Transition::Complete => {
                    let patch = WorkflowPatch {
                        current_stage: Some(Stage::Completed),
                        status: Some(WorkflowStatus::Completed),
                        progress_percentage: Some(100),
                        pending_decision: Some(None),
                        ..Default::default()
                    };
                    match self.store.update(workflow_id, patch, workflow.version).await {
                        Ok(updated) => {
                            info!(%workflow_id, trace_id = %updated.trace_id, "workflow completed");
                            self.snapshot(&updated).await;
                            return Ok(());
                        }
                        Err(e) if e.is_contention() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }

                Transition::AwaitDecision { stage } => {
                    let patch = WorkflowPatch {
                        status: Some(WorkflowStatus::AwaitingDecision),
                        pending_decision: Some(Some(PendingDecision {
                            stage,
                            requested_at: Utc::now(),
                        })),
                        ..Default::default()
                    };
                    match self.store.update(workflow_id, patch, workflow.version).await {
                        Ok(updated) => {
                            info!(%workflow_id, %stage, "workflow awaiting decision");
                            self.snapshot(&updated).await;
                            return Ok(());
                        }
                        Err(e) if e.is_contention() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }

                Transition::Fail { errors } => {
                    let patch = WorkflowPatch {
                        current_stage: Some(Stage::Failed),
                        status: Some(WorkflowStatus::Failed),
                        pending_decision: Some(None),
                        errors: Some(errors),
                        ..Default::default()
                    };
                    match self.store.update(workflow_id, patch, workflow.version).await {
                        Ok(updated) => {
                            warn!(%workflow_id, trace_id = %updated.trace_id, "workflow failed");
                            self.snapshot(&updated).await;
                            return Ok(());
                        }
                        Err(e) if e.is_contention() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Err(ServiceError::Fatal(format!(
            "transition for workflow {workflow_id} lost the version race {CAS_APPLY_ATTEMPTS} times"
        )))
    }

    async fn count_dispatches(&self, workflow_id: Uuid, stage: Stage) -> Result<u32, ServiceError> {
        let tasks = self.store.list_tasks_for_workflow(workflow_id).await?;
        Ok(tasks.iter().filter(|t| t.stage == stage).count() as u32)
    }

    /// Best-effort KV snapshot for fast recovery inspection. The relational
    /// store stays authoritative; failures here are logged and swallowed.
    async fn snapshot(&self, workflow: &Workflow) {
        let key = format!("workflow:{}:state", workflow.id);
        match serde_json::to_string(workflow) {
            Ok(json) => {
                if let Err(e) = self
                    .kv
                    .set(&key, &json, Some(self.config.snapshot_ttl))
                    .await
                {
                    debug!(workflow_id = %workflow.id, error = %e, "snapshot write failed");
                }
            }
            Err(e) => debug!(workflow_id = %workflow.id, error = %e, "snapshot encode failed"),
        }
    }

    /// Last-resort path for impossible states: mark the workflow failed so
    /// it cannot wedge, and leave a loud log line for the operator.
    async fn fail_workflow_fatally(&self, workflow_id: Uuid, cause: &ServiceError) {
        for _ in 0..CAS_APPLY_ATTEMPTS {
            let Ok(workflow) = self.store.find_by_id(workflow_id).await else {
                return;
            };
            if workflow.status.is_terminal() {
                return;
            }
            let patch = WorkflowPatch {
                current_stage: Some(Stage::Failed),
                status: Some(WorkflowStatus::Failed),
                pending_decision: Some(None),
                errors: Some(vec![AgentFailure {
                    code: "ORCHESTRATOR_FATAL".to_string(),
                    message: cause.to_string(),
                    recoverable: false,
                }]),
                ..Default::default()
            };
            match self.store.update(workflow_id, patch, workflow.version).await {
                Ok(_) => return,
                Err(e) if e.is_contention() => continue,
                Err(e) => {
                    error!(%workflow_id, error = %e, "failed to mark workflow failed");
                    return;
                }
            }
        }
    }
}
