// Workflow entity and the stage catalog

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::result::AgentFailure;

/// Kind of delivery run. Each type owns an ordered stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    App,
    Feature,
    Bugfix,
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowType::App => write!(f, "app"),
            WorkflowType::Feature => write!(f, "feature"),
            WorkflowType::Bugfix => write!(f, "bugfix"),
        }
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(WorkflowType::App),
            "feature" => Ok(WorkflowType::Feature),
            "bugfix" => Ok(WorkflowType::Bugfix),
            _ => Err(format!("Unknown workflow type: {}", s)),
        }
    }
}

/// One step of a delivery run.
///
/// `Initialization` is the stage every workflow is created in; `Completed`
/// and `Failed` are terminal. The pipeline stages in between are drawn from
/// the owning type's sequence (see [`stage_sequence`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialization,
    Scaffolding,
    Validation,
    E2e,
    Integration,
    Deployment,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initialization => "initialization",
            Stage::Scaffolding => "scaffolding",
            Stage::Validation => "validation",
            Stage::E2e => "e2e",
            Stage::Integration => "integration",
            Stage::Deployment => "deployment",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    /// Whether this stage is a terminal marker rather than pipeline work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialization" => Ok(Stage::Initialization),
            "scaffolding" => Ok(Stage::Scaffolding),
            "validation" => Ok(Stage::Validation),
            "e2e" => Ok(Stage::E2e),
            "integration" => Ok(Stage::Integration),
            "deployment" => Ok(Stage::Deployment),
            "completed" => Ok(Stage::Completed),
            "failed" => Ok(Stage::Failed),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Ordered pipeline stages for a workflow type.
///
/// Terminal markers (`completed`, `failed`) and `initialization` are not part
/// of the sequence; a workflow leaves `initialization` into the first entry
/// and becomes `completed` after the last.
pub fn stage_sequence(workflow_type: WorkflowType) -> &'static [Stage] {
    match workflow_type {
        WorkflowType::App | WorkflowType::Feature => &[
            Stage::Scaffolding,
            Stage::Validation,
            Stage::E2e,
            Stage::Integration,
            Stage::Deployment,
        ],
        // Bugfixes patch an existing tree, nothing to scaffold
        WorkflowType::Bugfix => &[
            Stage::Validation,
            Stage::E2e,
            Stage::Integration,
            Stage::Deployment,
        ],
    }
}

/// The pipeline stage that follows `current` for the given type.
///
/// `None` means the sequence is exhausted and the workflow is complete.
/// Returns the first stage when `current` is `Initialization`.
pub fn next_stage(workflow_type: WorkflowType, current: Stage) -> Option<Stage> {
    let sequence = stage_sequence(workflow_type);
    if current == Stage::Initialization {
        return sequence.first().copied();
    }
    let position = sequence.iter().position(|s| *s == current)?;
    sequence.get(position + 1).copied()
}

/// Progress derived from the stage index in the owning type's sequence.
///
/// Entering stage `i` of `n` means `i` stages are behind us. Terminal
/// `Completed` is 100; callers keep the prior value for `Failed` so the
/// percentage stays monotonic.
pub fn progress_for(workflow_type: WorkflowType, stage: Stage) -> u8 {
    let sequence = stage_sequence(workflow_type);
    match stage {
        Stage::Initialization => 0,
        Stage::Completed => 100,
        Stage::Failed => 0,
        _ => match sequence.iter().position(|s| *s == stage) {
            Some(position) => ((position * 100) / sequence.len()) as u8,
            None => 0,
        },
    }
}

/// Overall workflow status, distinct from the stage pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initiated,
    Running,
    AwaitingDecision,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Initiated => write!(f, "initiated"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::AwaitingDecision => write!(f, "awaiting_decision"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(WorkflowStatus::Initiated),
            "running" => Ok(WorkflowStatus::Running),
            "awaiting_decision" => Ok(WorkflowStatus::AwaitingDecision),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            _ => Err(format!("Unknown workflow status: {}", s)),
        }
    }
}

/// Status of one dispatched agent task. Transitions only move forward;
/// a retry produces a new task row rather than resetting this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Dispatched => write!(f, "dispatched"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "dispatched" => Ok(TaskStatus::Dispatched),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "timed_out" => Ok(TaskStatus::TimedOut),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// A decision gate waiting on a human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PendingDecision {
    /// Stage whose completion raised the gate
    pub stage: Stage,
    pub requested_at: DateTime<Utc>,
}

/// One software-delivery run.
///
/// Mutated only by state-machine transitions and result-persistence writes;
/// `version` increments on every write and guards concurrent updates.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Workflow {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub name: String,
    pub description: Option<String>,
    pub current_stage: Stage,
    pub status: WorkflowStatus,
    pub version: i32,
    pub progress_percentage: u8,
    /// Validated result payload of each completed stage, keyed by stage name.
    /// Written exactly once per stage.
    #[schema(value_type = Object)]
    pub stage_outputs: serde_json::Map<String, serde_json::Value>,
    /// Terminal error detail; empty unless status is `failed`.
    #[serde(default)]
    pub errors: Vec<AgentFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_decision: Option<PendingDecision>,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_stage_from_initialization() {
        assert_eq!(
            next_stage(WorkflowType::Feature, Stage::Initialization),
            Some(Stage::Scaffolding)
        );
        assert_eq!(
            next_stage(WorkflowType::Bugfix, Stage::Initialization),
            Some(Stage::Validation)
        );
    }

    #[test]
    fn test_next_stage_walks_sequence() {
        assert_eq!(
            next_stage(WorkflowType::Feature, Stage::Scaffolding),
            Some(Stage::Validation)
        );
        assert_eq!(
            next_stage(WorkflowType::Feature, Stage::Integration),
            Some(Stage::Deployment)
        );
        assert_eq!(next_stage(WorkflowType::Feature, Stage::Deployment), None);
    }

    #[test]
    fn test_bugfix_skips_scaffolding() {
        assert!(!stage_sequence(WorkflowType::Bugfix).contains(&Stage::Scaffolding));
    }

    #[test]
    fn test_progress_is_monotonic_over_sequence() {
        let mut last = progress_for(WorkflowType::App, Stage::Initialization);
        for stage in stage_sequence(WorkflowType::App) {
            let progress = progress_for(WorkflowType::App, *stage);
            assert!(progress >= last, "{stage} regressed: {progress} < {last}");
            last = progress;
        }
        assert_eq!(progress_for(WorkflowType::App, Stage::Completed), 100);
    }

    #[test]
    fn test_stage_round_trips_through_str() {
        for stage in [
            Stage::Initialization,
            Stage::Scaffolding,
            Stage::E2e,
            Stage::Deployment,
            Stage::Completed,
        ] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::AwaitingDecision.is_terminal());
    }
}
