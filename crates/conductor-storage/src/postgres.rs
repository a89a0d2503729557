//! PostgreSQL implementation of WorkflowStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, QueryBuilder, Row};
use uuid::Uuid;

use conductor_contracts::{Stage, TaskStatus, Workflow};

use crate::store::*;

const WORKFLOW_COLUMNS: &str = "id, workflow_type, name, description, current_stage, status, \
     version, progress_percentage, stage_outputs, errors, pending_decision, trace_id, \
     created_at, updated_at";

const TASK_COLUMNS: &str = "task_id, workflow_id, agent_type, stage, status, retry_count, \
     max_retries, timeout_ms, envelope, trace_id, span_id, parent_span_id, deadline_at, \
     created_at, updated_at";

/// Workflow row as stored (string-typed enums, JSONB payloads).
#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: Uuid,
    workflow_type: String,
    name: String,
    description: Option<String>,
    current_stage: String,
    status: String,
    version: i32,
    progress_percentage: i32,
    stage_outputs: serde_json::Value,
    errors: serde_json::Value,
    pending_decision: Option<serde_json::Value>,
    trace_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<Workflow, StoreError> {
        let bad = |what: &str| StoreError::Serialization(format!("workflow row: bad {what}"));
        Ok(Workflow {
            id: self.id,
            workflow_type: self
                .workflow_type
                .parse()
                .map_err(|_| bad("workflow_type"))?,
            name: self.name,
            description: self.description,
            current_stage: self.current_stage.parse().map_err(|_| bad("current_stage"))?,
            status: self.status.parse().map_err(|_| bad("status"))?,
            version: self.version,
            progress_percentage: self.progress_percentage.clamp(0, 100) as u8,
            stage_outputs: self
                .stage_outputs
                .as_object()
                .cloned()
                .ok_or_else(|| bad("stage_outputs"))?,
            errors: serde_json::from_value(self.errors).map_err(|_| bad("errors"))?,
            pending_decision: self
                .pending_decision
                .map(serde_json::from_value)
                .transpose()
                .map_err(|_| bad("pending_decision"))?,
            trace_id: self.trace_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    task_id: Uuid,
    workflow_id: Uuid,
    agent_type: String,
    stage: String,
    status: String,
    retry_count: i32,
    max_retries: i32,
    timeout_ms: i64,
    envelope: serde_json::Value,
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    deadline_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_record(self) -> Result<TaskRecord, StoreError> {
        let bad = |what: &str| StoreError::Serialization(format!("task row: bad {what}"));
        Ok(TaskRecord {
            task_id: self.task_id,
            workflow_id: self.workflow_id,
            agent_type: self.agent_type.parse().map_err(|_| bad("agent_type"))?,
            stage: self.stage.parse().map_err(|_| bad("stage"))?,
            status: self.status.parse().map_err(|_| bad("status"))?,
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            timeout_ms: self.timeout_ms.max(0) as u64,
            envelope: self.envelope,
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            deadline_at: self.deadline_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ParkedRow {
    id: Uuid,
    payload: serde_json::Value,
    reason: String,
    error_history: serde_json::Value,
    parked_at: DateTime<Utc>,
}

/// PostgreSQL-backed workflow store.
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a bounded pool and run pending migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_row(&self, workflow_id: Uuid) -> Result<Option<WorkflowRow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Explain why a guarded UPDATE matched no row.
    async fn diagnose_conflict(
        &self,
        workflow_id: Uuid,
        expected_version: i32,
        stage: Option<Stage>,
    ) -> StoreError {
        match self.load_row(workflow_id).await {
            Ok(Some(row)) => {
                if let Some(stage) = stage {
                    if row
                        .stage_outputs
                        .as_object()
                        .map(|o| o.contains_key(stage.as_str()))
                        .unwrap_or(false)
                    {
                        return StoreError::StageOutputExists { workflow_id, stage };
                    }
                }
                StoreError::VersionConflict {
                    workflow_id,
                    expected: expected_version,
                    actual: row.version,
                }
            }
            Ok(None) => StoreError::WorkflowNotFound(workflow_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    async fn create_workflow(&self, input: NewWorkflow) -> Result<Workflow, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            INSERT INTO workflows
                (id, workflow_type, name, description, current_stage, status,
                 version, progress_percentage, stage_outputs, errors, trace_id)
            VALUES ($1, $2, $3, $4, 'initialization', 'initiated', 1, 0, '{{}}', '[]', $5)
            RETURNING {WORKFLOW_COLUMNS}
            "#
        ))
        .bind(input.id)
        .bind(input.workflow_type.to_string())
        .bind(&input.name)
        .bind(&input.description)
        .bind(&input.trace_id)
        .fetch_one(&self.pool)
        .await?;

        row.into_workflow()
    }

    async fn find_by_id(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        self.load_row(workflow_id)
            .await?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?
            .into_workflow()
    }

    async fn update(
        &self,
        workflow_id: Uuid,
        patch: WorkflowPatch,
        expected_version: i32,
    ) -> Result<Workflow, StoreError> {
        let errors_json = patch
            .errors
            .map(|e| serde_json::to_value(e))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let (set_decision, decision_json) = match patch.pending_decision {
            None => (false, None),
            Some(decision) => (
                true,
                decision
                    .map(|d| serde_json::to_value(d))
                    .transpose()
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
        };

        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            UPDATE workflows SET
                current_stage = COALESCE($3, current_stage),
                status = COALESCE($4, status),
                progress_percentage = COALESCE($5, progress_percentage),
                pending_decision = CASE WHEN $6 THEN $7 ELSE pending_decision END,
                errors = COALESCE($8, errors),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {WORKFLOW_COLUMNS}
            "#
        ))
        .bind(workflow_id)
        .bind(expected_version)
        .bind(patch.current_stage.map(|s| s.to_string()))
        .bind(patch.status.map(|s| s.to_string()))
        .bind(patch.progress_percentage.map(|p| p as i32))
        .bind(set_decision)
        .bind(decision_json)
        .bind(errors_json)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_workflow(),
            None => Err(self.diagnose_conflict(workflow_id, expected_version, None).await),
        }
    }

    async fn record_stage_output(
        &self,
        workflow_id: Uuid,
        stage: Stage,
        output: serde_json::Value,
        expected_version: i32,
    ) -> Result<Workflow, StoreError> {
        let addition = serde_json::json!({ stage.as_str(): output });

        // The `?` guard makes the exactly-once rule atomic with the write
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            UPDATE workflows SET
                stage_outputs = stage_outputs || $3,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2 AND NOT (stage_outputs ? $4)
            RETURNING {WORKFLOW_COLUMNS}
            "#
        ))
        .bind(workflow_id)
        .bind(expected_version)
        .bind(addition)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_workflow(),
            None => Err(self
                .diagnose_conflict(workflow_id, expected_version, Some(stage))
                .await),
        }
    }

    async fn list_with_filters(
        &self,
        filter: WorkflowFilter,
        page: Page,
    ) -> Result<Vec<Workflow>, StoreError> {
        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE 1=1"));

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.to_string());
        }
        if let Some(workflow_type) = filter.workflow_type {
            builder
                .push(" AND workflow_type = ")
                .push_bind(workflow_type.to_string());
        }
        if let Some(created_after) = filter.created_after {
            builder.push(" AND created_at > ").push_bind(created_after);
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit.clamp(1, 200))
            .push(" OFFSET ")
            .push_bind(page.offset.max(0));

        let rows: Vec<WorkflowRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }

    async fn create_task(&self, input: NewTask) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            INSERT INTO agent_tasks
                (task_id, workflow_id, agent_type, stage, status, retry_count, max_retries,
                 timeout_ms, envelope, trace_id, span_id, parent_span_id, deadline_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(input.task_id)
        .bind(input.workflow_id)
        .bind(input.agent_type.to_string())
        .bind(input.stage.to_string())
        .bind(input.retry_count as i32)
        .bind(input.max_retries as i32)
        .bind(input.timeout_ms as i64)
        .bind(&input.envelope)
        .bind(&input.trace_id)
        .bind(&input.span_id)
        .bind(&input.parent_span_id)
        .bind(input.deadline_at)
        .fetch_one(&self.pool)
        .await?;

        row.into_record()
    }

    async fn find_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::TaskNotFound(task_id))?
        .into_record()
    }

    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE agent_tasks SET status = $2, updated_at = NOW() WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn find_tasks_past_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM agent_tasks
            WHERE status = 'dispatched' AND deadline_at < $1
            ORDER BY deadline_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn list_tasks_for_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM agent_tasks
            WHERE workflow_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn park_result(&self, input: NewParkedResult) -> Result<ParkedResult, StoreError> {
        let history = serde_json::to_value(&input.error_history)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let row = sqlx::query_as::<_, ParkedRow>(
            r#"
            INSERT INTO parked_results (id, payload, reason, error_history)
            VALUES ($1, $2, $3, $4)
            RETURNING id, payload, reason, error_history, parked_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.payload)
        .bind(&input.reason)
        .bind(history)
        .fetch_one(&self.pool)
        .await?;

        Ok(ParkedResult {
            id: row.id,
            payload: row.payload,
            reason: row.reason,
            error_history: serde_json::from_value(row.error_history).unwrap_or_default(),
            parked_at: row.parked_at,
        })
    }

    async fn list_parked(&self, page: Page) -> Result<Vec<ParkedResult>, StoreError> {
        let rows = sqlx::query_as::<_, ParkedRow>(
            r#"
            SELECT id, payload, reason, error_history, parked_at
            FROM parked_results
            ORDER BY parked_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(page.limit.clamp(1, 200))
        .bind(page.offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ParkedResult {
                id: row.id,
                payload: row.payload,
                reason: row.reason,
                error_history: serde_json::from_value(row.error_history).unwrap_or_default(),
                parked_at: row.parked_at,
            })
            .collect())
    }

    async fn health(&self) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT 1 AS one").fetch_one(&self.pool).await?;
        let _: i32 = row.try_get("one")?;
        Ok(())
    }
}
