// AgentEnvelope v2.0.0 — the wire format for a task

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::trace::TraceContext;
use crate::workflow::{Stage, WorkflowType};

/// Envelope schema version emitted by this orchestrator. v1.x ingress is a
/// validation failure; the registry holds v2.0.0 only.
pub const ENVELOPE_VERSION: &str = "2.0.0";

/// The specialized worker kind a task is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Scaffold,
    Validate,
    E2e,
    Integrate,
    Deploy,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Scaffold => "scaffold",
            AgentType::Validate => "validate",
            AgentType::E2e => "e2e",
            AgentType::Integrate => "integrate",
            AgentType::Deploy => "deploy",
        }
    }

    /// The agent kind that executes a given pipeline stage.
    ///
    /// Terminal markers and `initialization` have no agent.
    pub fn for_stage(stage: Stage) -> Option<AgentType> {
        match stage {
            Stage::Scaffolding => Some(AgentType::Scaffold),
            Stage::Validation => Some(AgentType::Validate),
            Stage::E2e => Some(AgentType::E2e),
            Stage::Integration => Some(AgentType::Integrate),
            Stage::Deployment => Some(AgentType::Deploy),
            Stage::Initialization | Stage::Completed | Stage::Failed => None,
        }
    }

    /// Bus topic this agent kind consumes tasks from.
    pub fn task_topic(&self) -> String {
        format!("agent:{}:tasks", self.as_str())
    }

    /// Durable stream mirroring the task topic.
    pub fn task_stream(&self) -> String {
        format!("stream:agent:{}:tasks", self.as_str())
    }

    /// Consumer group the agent instances compete in.
    pub fn consumer_group(&self) -> String {
        format!("agent-{}-group", self.as_str())
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scaffold" => Ok(AgentType::Scaffold),
            "validate" => Ok(AgentType::Validate),
            "e2e" => Ok(AgentType::E2e),
            "integrate" => Ok(AgentType::Integrate),
            "deploy" => Ok(AgentType::Deploy),
            _ => Err(format!("Unknown agent type: {}", s)),
        }
    }
}

/// Dispatch priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Lifecycle marker stamped on the envelope itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Pending,
    Dispatched,
}

/// Execution constraints the agent must honor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaskConstraints {
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Minimum self-reported confidence for the result to count as success
    pub required_confidence: f64,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_retries: 3,
            required_confidence: 0.8,
        }
    }
}

/// Envelope provenance metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EnvelopeMetadata {
    /// Schema version of the envelope; must equal [`ENVELOPE_VERSION`]
    pub envelope_version: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Cumulative workflow context handed to the agent so it can see the
/// outputs of every prior stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkflowContext {
    pub workflow_type: WorkflowType,
    pub workflow_name: String,
    pub current_stage: Stage,
    #[schema(value_type = Object)]
    pub stage_outputs: serde_json::Map<String, serde_json::Value>,
}

/// The wire message carrying one task to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AgentEnvelope {
    /// Unique per publish; the dedup key for at-most-once handling
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub agent_type: AgentType,
    /// Agent-specific instruction payload
    #[schema(value_type = Object)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub constraints: TaskConstraints,
    pub retry_count: u32,
    pub priority: Priority,
    pub status: EnvelopeStatus,
    pub metadata: EnvelopeMetadata,
    pub trace: TraceContext,
    pub workflow_context: WorkflowContext,
}

impl AgentEnvelope {
    /// Serialize for the bus. Infallible for this type in practice; the
    /// producer-side schema check runs before this is called.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("envelope serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_follow_agent_type() {
        assert_eq!(AgentType::Scaffold.task_topic(), "agent:scaffold:tasks");
        assert_eq!(AgentType::Deploy.task_stream(), "stream:agent:deploy:tasks");
        assert_eq!(AgentType::E2e.consumer_group(), "agent-e2e-group");
    }

    #[test]
    fn test_every_pipeline_stage_has_an_agent() {
        for workflow_type in [WorkflowType::App, WorkflowType::Feature, WorkflowType::Bugfix] {
            for stage in crate::workflow::stage_sequence(workflow_type) {
                assert!(
                    AgentType::for_stage(*stage).is_some(),
                    "no agent for {stage}"
                );
            }
        }
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = AgentEnvelope {
            message_id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            agent_type: AgentType::Scaffold,
            payload: serde_json::Map::new(),
            constraints: TaskConstraints::default(),
            retry_count: 0,
            priority: Priority::default(),
            status: EnvelopeStatus::Pending,
            metadata: EnvelopeMetadata {
                envelope_version: ENVELOPE_VERSION.to_string(),
                created_at: Utc::now(),
                created_by: "test".to_string(),
            },
            trace: TraceContext::new_root(),
            workflow_context: WorkflowContext {
                workflow_type: WorkflowType::Feature,
                workflow_name: "demo".to_string(),
                current_stage: Stage::Scaffolding,
                stage_outputs: serde_json::Map::new(),
            },
        };

        let wire = envelope.to_wire();
        assert_eq!(wire["agent_type"], "scaffold");
        assert_eq!(wire["metadata"]["envelope_version"], "2.0.0");
        assert_eq!(wire["priority"], "medium");
        assert!(wire["trace"]["trace_id"].is_string());

        let parsed: AgentEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, envelope);
    }
}
