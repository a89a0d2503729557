// AgentResult v1.0.0 — the wire format for an agent's reply

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::envelope::AgentType;
use crate::trace::TraceContext;
use crate::workflow::Stage;

/// Result schema version accepted by this orchestrator.
pub const RESULT_VERSION: &str = "1.0.0";

/// Outcome category reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    Partial,
    Blocked,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::Success => write!(f, "success"),
            ResultStatus::Failure => write!(f, "failure"),
            ResultStatus::Partial => write!(f, "partial"),
            ResultStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// One error reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AgentFailure {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

/// Execution metrics attached to a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResultMetrics {
    pub duration_ms: u64,
    /// Additional agent-specific gauges
    #[serde(default, flatten)]
    #[schema(value_type = Object)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The stage-specific output wrapper.
///
/// Agents always nest their custom fields under `output`; consumers never
/// read top-level custom fields off the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResultBody {
    #[schema(value_type = Object)]
    pub output: serde_json::Map<String, serde_json::Value>,
}

/// The wire message an agent returns after executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AgentResult {
    /// Unique per publish; the dedup key for at-most-once handling
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    /// Identifies the agent instance that did the work
    pub agent_id: String,
    pub agent_type: AgentType,
    pub stage: Stage,
    pub success: bool,
    pub status: ResultStatus,
    /// Result schema version; must equal [`RESULT_VERSION`]
    pub version: String,
    pub result: ResultBody,
    #[serde(default)]
    pub errors: Vec<AgentFailure>,
    #[serde(default)]
    pub metrics: ResultMetrics,
    pub timestamp: DateTime<Utc>,
    pub trace: TraceContext,
}

impl AgentResult {
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("result serialization cannot fail")
    }
}
