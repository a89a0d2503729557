//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use conductor_contracts::{
    AgentFailure, AgentType, PendingDecision, Stage, TaskStatus, Workflow, WorkflowStatus,
    WorkflowType,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Optimistic concurrency failure on the workflow version column
    #[error("version conflict on workflow {workflow_id}: expected {expected}, found {actual}")]
    VersionConflict {
        workflow_id: Uuid,
        expected: i32,
        actual: i32,
    },

    /// A stage output may be written exactly once per workflow
    #[error("stage output already recorded for workflow {workflow_id} stage {stage}")]
    StageOutputExists { workflow_id: Uuid, stage: Stage },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Contention errors are worth a short jittered retry; the rest are not.
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Input for creating a workflow row.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub id: Uuid,
    pub workflow_type: WorkflowType,
    pub name: String,
    pub description: Option<String>,
    pub trace_id: String,
}

/// Patch applied by a CAS update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct WorkflowPatch {
    pub current_stage: Option<Stage>,
    pub status: Option<WorkflowStatus>,
    pub progress_percentage: Option<u8>,
    /// `Some(None)` clears a pending decision; `Some(Some(..))` sets one
    pub pending_decision: Option<Option<PendingDecision>>,
    pub errors: Option<Vec<AgentFailure>>,
}

/// Filter for listing workflows.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub workflow_type: Option<WorkflowType>,
    pub created_after: Option<DateTime<Utc>>,
}

/// Pagination parameters.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
        }
    }
}

/// Input for persisting one dispatch attempt. Retries produce new rows.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub agent_type: AgentType,
    pub stage: Stage,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    /// Serialized envelope as published
    pub envelope: serde_json::Value,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub deadline_at: DateTime<Utc>,
}

/// One persisted dispatch attempt.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub agent_type: AgentType,
    pub stage: Stage,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub envelope: serde_json::Value,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub deadline_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for parking an unprocessable result.
#[derive(Debug, Clone)]
pub struct NewParkedResult {
    pub payload: serde_json::Value,
    pub reason: String,
    pub error_history: Vec<String>,
}

/// A result message parked for operator attention.
#[derive(Debug, Clone)]
pub struct ParkedResult {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub reason: String,
    pub error_history: Vec<String>,
    pub parked_at: DateTime<Utc>,
}

/// Store for workflow rows, task rows, and parked results.
///
/// Implementations must be thread-safe and support concurrent access; the
/// CAS operations are the serialization point for workflow writes.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow operations
    // =========================================================================

    /// Persist a new workflow in `initialization`/`initiated` at version 1.
    async fn create_workflow(&self, input: NewWorkflow) -> Result<Workflow, StoreError>;

    async fn find_by_id(&self, workflow_id: Uuid) -> Result<Workflow, StoreError>;

    /// Apply a patch iff the stored version equals `expected_version`;
    /// bumps the version on success.
    async fn update(
        &self,
        workflow_id: Uuid,
        patch: WorkflowPatch,
        expected_version: i32,
    ) -> Result<Workflow, StoreError>;

    /// Write `stage_outputs[stage]` exactly once, bumping the version.
    /// A second write for the same stage fails with `StageOutputExists`.
    async fn record_stage_output(
        &self,
        workflow_id: Uuid,
        stage: Stage,
        output: serde_json::Value,
        expected_version: i32,
    ) -> Result<Workflow, StoreError>;

    async fn list_with_filters(
        &self,
        filter: WorkflowFilter,
        page: Page,
    ) -> Result<Vec<Workflow>, StoreError>;

    // =========================================================================
    // Task operations
    // =========================================================================

    async fn create_task(&self, input: NewTask) -> Result<TaskRecord, StoreError>;

    async fn find_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError>;

    /// Forward-only status transition for one dispatch attempt.
    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
    ) -> Result<(), StoreError>;

    /// Dispatched tasks whose deadline has passed, oldest first.
    async fn find_tasks_past_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn list_tasks_for_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    // =========================================================================
    // Parked results (dead letter)
    // =========================================================================

    async fn park_result(&self, input: NewParkedResult) -> Result<ParkedResult, StoreError>;

    async fn list_parked(&self, page: Page) -> Result<Vec<ParkedResult>, StoreError>;

    /// Liveness probe against the backing store.
    async fn health(&self) -> Result<(), StoreError>;
}
