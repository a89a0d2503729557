// Distributed trace context propagated through every message

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Trace context carried by every envelope and result.
///
/// `trace_id` is fixed at workflow creation and immutable for the lifetime of
/// the workflow; every task and result spawned by it inherits the same id.
/// Each dispatch gets a fresh `span_id` whose parent is the span that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Start a new trace with a root span.
    pub fn new_root() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// Start a trace from an externally supplied trace id (e.g. `x-trace-id`).
    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// Derive a child span within the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// Generate a 32-char lowercase hex trace id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a 16-char lowercase hex span id.
pub fn new_span_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..16].to_string()
}

/// Check whether an externally supplied trace id is acceptable to honor.
///
/// Anything that is not 32 lowercase hex chars is replaced with a generated id.
pub fn is_valid_trace_id(candidate: &str) -> bool {
    candidate.len() == 32 && candidate.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
