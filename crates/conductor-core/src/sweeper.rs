//! Timeout sweeper
//!
//! Scans dispatched tasks past their deadline. While the retry budget
//! lasts, each expired task is reissued as a fresh dispatch (new task id,
//! new message id, incremented retry count); once exhausted, a failing
//! `StageComplete` is emitted so the state machine can take the failure
//! edge.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_contracts::{AgentFailure, TaskStatus};
use conductor_storage::{TaskRecord, WorkflowStore};

use crate::config::OrchestratorConfig;
use crate::error::ServiceError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::service::WorkflowService;

/// Background sweeper for timed-out tasks.
pub struct TaskSweeper {
    store: Arc<dyn WorkflowStore>,
    service: Arc<WorkflowService>,
    events: EventBus,
    interval: Duration,
}

impl TaskSweeper {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        service: Arc<WorkflowService>,
        events: EventBus,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            service,
            events,
            interval: config.sweep_interval,
        }
    }

    /// Run until cancelled.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "task sweeper started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                if let Err(e) = self.sweep().await {
                    warn!(error = %e, "sweep pass failed");
                }
            }
            debug!("task sweeper stopped");
        })
    }

    /// One pass: every expired task is closed out, and either reissued or
    /// reported as a stage failure. Errors on one task do not stop the pass.
    pub async fn sweep(&self) -> Result<usize, ServiceError> {
        let expired = self.store.find_tasks_past_deadline(Utc::now()).await?;
        let count = expired.len();

        for task in expired {
            if let Err(e) = self.expire_task(&task).await {
                warn!(
                    task_id = %task.task_id,
                    workflow_id = %task.workflow_id,
                    error = %e,
                    "failed to expire task"
                );
            }
        }

        Ok(count)
    }

    async fn expire_task(&self, task: &TaskRecord) -> Result<(), ServiceError> {
        self.store
            .update_task_status(task.task_id, TaskStatus::TimedOut)
            .await?;

        let workflow = self.store.find_by_id(task.workflow_id).await?;
        if workflow.status.is_terminal() || workflow.current_stage != task.stage {
            // The workflow moved on (or died) while the task was in flight
            debug!(
                task_id = %task.task_id,
                workflow_id = %workflow.id,
                "expired task is obsolete; not reissuing"
            );
            return Ok(());
        }

        if task.retry_count < task.max_retries {
            info!(
                task_id = %task.task_id,
                workflow_id = %workflow.id,
                stage = %task.stage,
                trace_id = %task.trace_id,
                retry_count = task.retry_count + 1,
                "task timed out; reissuing"
            );
            self.service
                .dispatch_stage_task(&workflow, task.stage, task.retry_count + 1)
                .await?;
        } else {
            warn!(
                task_id = %task.task_id,
                workflow_id = %workflow.id,
                stage = %task.stage,
                trace_id = %task.trace_id,
                attempts = task.retry_count + 1,
                "task timed out with retry budget exhausted"
            );
            self.events.publish(OrchestratorEvent::StageComplete {
                workflow_id: workflow.id,
                stage: task.stage,
                success: false,
                output: serde_json::Value::Null,
                errors: vec![AgentFailure {
                    code: "AGENT_TIMEOUT".to_string(),
                    message: format!(
                        "stage {} produced no result in {} attempts of {} ms",
                        task.stage,
                        task.retry_count + 1,
                        task.timeout_ms
                    ),
                    recoverable: false,
                }],
            });
        }

        Ok(())
    }
}
