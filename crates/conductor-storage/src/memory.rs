//! In-memory implementation of WorkflowStore for tests and local development
//!
//! Same semantics as the PostgreSQL implementation, including version CAS
//! and the exactly-once rule for stage outputs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use conductor_contracts::{Stage, TaskStatus, Workflow, WorkflowStatus};

use crate::store::*;

/// In-memory workflow store.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
    parked: RwLock<Vec<ParkedResult>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.tasks.write().clear();
        self.parked.write().clear();
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(&self, input: NewWorkflow) -> Result<Workflow, StoreError> {
        let now = Utc::now();
        let workflow = Workflow {
            id: input.id,
            workflow_type: input.workflow_type,
            name: input.name,
            description: input.description,
            current_stage: Stage::Initialization,
            status: WorkflowStatus::Initiated,
            version: 1,
            progress_percentage: 0,
            stage_outputs: serde_json::Map::new(),
            errors: vec![],
            pending_decision: None,
            trace_id: input.trace_id,
            created_at: now,
            updated_at: now,
        };
        self.workflows.write().insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn find_by_id(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn update(
        &self,
        workflow_id: Uuid,
        patch: WorkflowPatch,
        expected_version: i32,
    ) -> Result<Workflow, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        if workflow.version != expected_version {
            return Err(StoreError::VersionConflict {
                workflow_id,
                expected: expected_version,
                actual: workflow.version,
            });
        }

        if let Some(stage) = patch.current_stage {
            workflow.current_stage = stage;
        }
        if let Some(status) = patch.status {
            workflow.status = status;
        }
        if let Some(progress) = patch.progress_percentage {
            workflow.progress_percentage = progress;
        }
        if let Some(decision) = patch.pending_decision {
            workflow.pending_decision = decision;
        }
        if let Some(errors) = patch.errors {
            workflow.errors = errors;
        }
        workflow.version += 1;
        workflow.updated_at = Utc::now();
        Ok(workflow.clone())
    }

    async fn record_stage_output(
        &self,
        workflow_id: Uuid,
        stage: Stage,
        output: serde_json::Value,
        expected_version: i32,
    ) -> Result<Workflow, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        if workflow.stage_outputs.contains_key(stage.as_str()) {
            return Err(StoreError::StageOutputExists { workflow_id, stage });
        }
        if workflow.version != expected_version {
            return Err(StoreError::VersionConflict {
                workflow_id,
                expected: expected_version,
                actual: workflow.version,
            });
        }

        workflow
            .stage_outputs
            .insert(stage.as_str().to_string(), output);
        workflow.version += 1;
        workflow.updated_at = Utc::now();
        Ok(workflow.clone())
    }

    async fn list_with_filters(
        &self,
        filter: WorkflowFilter,
        page: Page,
    ) -> Result<Vec<Workflow>, StoreError> {
        let workflows = self.workflows.read();
        let mut matching: Vec<Workflow> = workflows
            .values()
            .filter(|w| filter.status.map(|s| w.status == s).unwrap_or(true))
            .filter(|w| {
                filter
                    .workflow_type
                    .map(|t| w.workflow_type == t)
                    .unwrap_or(true)
            })
            .filter(|w| {
                filter
                    .created_after
                    .map(|at| w.created_at > at)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.clamp(1, 200) as usize)
            .collect())
    }

    async fn create_task(&self, input: NewTask) -> Result<TaskRecord, StoreError> {
        let now = Utc::now();
        let record = TaskRecord {
            task_id: input.task_id,
            workflow_id: input.workflow_id,
            agent_type: input.agent_type,
            stage: input.stage,
            status: TaskStatus::Pending,
            retry_count: input.retry_count,
            max_retries: input.max_retries,
            timeout_ms: input.timeout_ms,
            envelope: input.envelope,
            trace_id: input.trace_id,
            span_id: input.span_id,
            parent_span_id: input.parent_span_id,
            deadline_at: input.deadline_at,
            created_at: now,
            updated_at: now,
        };
        self.tasks.write().insert(record.task_id, record.clone());
        Ok(record)
    }

    async fn find_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn find_tasks_past_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read();
        let mut expired: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Dispatched && t.deadline_at < now)
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.deadline_at.cmp(&b.deadline_at));
        Ok(expired)
    }

    async fn list_tasks_for_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read();
        let mut matching: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    async fn park_result(&self, input: NewParkedResult) -> Result<ParkedResult, StoreError> {
        let parked = ParkedResult {
            id: Uuid::now_v7(),
            payload: input.payload,
            reason: input.reason,
            error_history: input.error_history,
            parked_at: Utc::now(),
        };
        self.parked.write().push(parked.clone());
        Ok(parked)
    }

    async fn list_parked(&self, page: Page) -> Result<Vec<ParkedResult>, StoreError> {
        let parked = self.parked.read();
        let mut all: Vec<ParkedResult> = parked.clone();
        all.sort_by(|a, b| b.parked_at.cmp(&a.parked_at));
        Ok(all
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.clamp(1, 200) as usize)
            .collect())
    }

    async fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_contracts::WorkflowType;

    fn new_workflow() -> NewWorkflow {
        NewWorkflow {
            id: Uuid::now_v7(),
            workflow_type: WorkflowType::Feature,
            name: "demo".to_string(),
            description: None,
            trace_id: "0123456789abcdef0123456789abcdef".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_then_find_round_trips() {
        let store = InMemoryWorkflowStore::new();
        let created = store.create_workflow(new_workflow()).await.unwrap();
        let found = store.find_by_id(created.id).await.unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.version, 1);
        assert_eq!(found.current_stage, Stage::Initialization);
        assert_eq!(found.status, WorkflowStatus::Initiated);
    }

    #[tokio::test]
    async fn test_update_cas_rejects_stale_version() {
        let store = InMemoryWorkflowStore::new();
        let created = store.create_workflow(new_workflow()).await.unwrap();

        let patch = WorkflowPatch {
            status: Some(WorkflowStatus::Running),
            ..Default::default()
        };
        let updated = store.update(created.id, patch.clone(), 1).await.unwrap();
        assert_eq!(updated.version, 2);

        // A second writer still holding version 1 loses
        let err = store.update(created.id, patch, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stage_output_written_exactly_once() {
        let store = InMemoryWorkflowStore::new();
        let created = store.create_workflow(new_workflow()).await.unwrap();

        let output = serde_json::json!({"files": []});
        let updated = store
            .record_stage_output(created.id, Stage::Scaffolding, output.clone(), 1)
            .await
            .unwrap();
        assert_eq!(updated.stage_outputs["scaffolding"], output);

        let err = store
            .record_stage_output(created.id, Stage::Scaffolding, output, updated.version)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StageOutputExists { .. }));
    }

    #[tokio::test]
    async fn test_deadline_scan_only_sees_dispatched() {
        let store = InMemoryWorkflowStore::new();
        let workflow = store.create_workflow(new_workflow()).await.unwrap();

        let past = Utc::now() - chrono::Duration::seconds(10);
        for (status, task_id) in [
            (TaskStatus::Dispatched, Uuid::now_v7()),
            (TaskStatus::Succeeded, Uuid::now_v7()),
        ] {
            store
                .create_task(NewTask {
                    task_id,
                    workflow_id: workflow.id,
                    agent_type: conductor_contracts::AgentType::Scaffold,
                    stage: Stage::Scaffolding,
                    retry_count: 0,
                    max_retries: 3,
                    timeout_ms: 500,
                    envelope: serde_json::json!({}),
                    trace_id: workflow.trace_id.clone(),
                    span_id: "span".to_string(),
                    parent_span_id: None,
                    deadline_at: past,
                })
                .await
                .unwrap();
            store.update_task_status(task_id, status).await.unwrap();
        }

        let expired = store.find_tasks_past_deadline(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, TaskStatus::Dispatched);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = InMemoryWorkflowStore::new();
        let a = store.create_workflow(new_workflow()).await.unwrap();
        let _b = store.create_workflow(new_workflow()).await.unwrap();
        store
            .update(
                a.id,
                WorkflowPatch {
                    status: Some(WorkflowStatus::Failed),
                    ..Default::default()
                },
                1,
            )
            .await
            .unwrap();

        let failed = store
            .list_with_filters(
                WorkflowFilter {
                    status: Some(WorkflowStatus::Failed),
                    ..Default::default()
                },
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a.id);
    }
}
