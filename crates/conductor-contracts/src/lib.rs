// Wire contracts for the conductor orchestrator
//
// Everything exchanged between the orchestrator and agents is defined here:
// envelope and result shapes, the enumerations they draw from, trace context,
// and the schema registry that enforces the contracts at both ends of the bus.

pub mod envelope;
pub mod registry;
pub mod result;
pub mod trace;
pub mod validation;
pub mod workflow;

pub use envelope::{
    AgentEnvelope, AgentType, EnvelopeMetadata, EnvelopeStatus, Priority, TaskConstraints,
    WorkflowContext, ENVELOPE_VERSION,
};
pub use registry::{SchemaKey, SchemaRegistry, RESULT_SCHEMA, ENVELOPE_SCHEMA};
pub use result::{AgentFailure, AgentResult, ResultBody, ResultMetrics, ResultStatus, RESULT_VERSION};
pub use trace::{is_valid_trace_id, new_span_id, new_trace_id, TraceContext};
pub use validation::ValidationError;
pub use workflow::{
    next_stage, progress_for, stage_sequence, PendingDecision, Stage, TaskStatus, Workflow,
    WorkflowStatus, WorkflowType,
};
