// Wire-level validators for the builtin schemas
//
// Validation runs twice for every message: at the producer before publish
// (fail fast, reject locally) and at the consumer after receipt (defense in
// depth). Both points call into these functions; the bus itself never does.

use std::str::FromStr;

use uuid::Uuid;

use crate::envelope::{AgentType, ENVELOPE_VERSION};
use crate::result::RESULT_VERSION;
use crate::workflow::Stage;

/// Schema or invariant violation, carrying the offending field path.
/// Never retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("schema {schema}@{version} invalid at `{path}`: {message}")]
pub struct ValidationError {
    pub schema: String,
    pub version: String,
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(
        schema: impl Into<String>,
        version: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            version: version.into(),
            path: path.into(),
            message: message.into(),
        }
    }
}

struct Checker<'a> {
    schema: &'a str,
    version: &'a str,
}

impl<'a> Checker<'a> {
    fn fail(&self, path: &str, message: impl Into<String>) -> ValidationError {
        ValidationError::new(self.schema, self.version, path, message)
    }

    fn object<'v>(
        &self,
        value: &'v serde_json::Value,
        path: &str,
    ) -> Result<&'v serde_json::Map<String, serde_json::Value>, ValidationError> {
        value
            .as_object()
            .ok_or_else(|| self.fail(path, "expected an object"))
    }

    fn field<'v>(
        &self,
        object: &'v serde_json::Map<String, serde_json::Value>,
        path: &str,
        name: &str,
    ) -> Result<&'v serde_json::Value, ValidationError> {
        object
            .get(name)
            .ok_or_else(|| self.fail(&join(path, name), "missing required field"))
    }

    fn string<'v>(
        &self,
        object: &'v serde_json::Map<String, serde_json::Value>,
        path: &str,
        name: &str,
    ) -> Result<&'v str, ValidationError> {
        self.field(object, path, name)?
            .as_str()
            .ok_or_else(|| self.fail(&join(path, name), "expected a string"))
    }

    fn uuid(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
        path: &str,
        name: &str,
    ) -> Result<Uuid, ValidationError> {
        let raw = self.string(object, path, name)?;
        Uuid::parse_str(raw).map_err(|_| self.fail(&join(path, name), "expected a UUID"))
    }

    fn u64(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
        path: &str,
        name: &str,
    ) -> Result<u64, ValidationError> {
        self.field(object, path, name)?
            .as_u64()
            .ok_or_else(|| self.fail(&join(path, name), "expected a non-negative integer"))
    }

    fn bool(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
        path: &str,
        name: &str,
    ) -> Result<bool, ValidationError> {
        self.field(object, path, name)?
            .as_bool()
            .ok_or_else(|| self.fail(&join(path, name), "expected a boolean"))
    }

    fn one_of(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
        path: &str,
        name: &str,
        allowed: &[&str],
    ) -> Result<(), ValidationError> {
        let raw = self.string(object, path, name)?;
        if allowed.contains(&raw) {
            Ok(())
        } else {
            Err(self.fail(
                &join(path, name),
                format!("`{}` is not one of {:?}", raw, allowed),
            ))
        }
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn check_trace(
    checker: &Checker<'_>,
    root: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), ValidationError> {
    let trace = checker.object(checker.field(root, "", "trace")?, "trace")?;
    let trace_id = checker.string(trace, "trace", "trace_id")?;
    if trace_id.is_empty() {
        return Err(checker.fail("trace.trace_id", "must not be empty"));
    }
    let span_id = checker.string(trace, "trace", "span_id")?;
    if span_id.is_empty() {
        return Err(checker.fail("trace.span_id", "must not be empty"));
    }
    Ok(())
}

/// Validate a raw wire value against the AgentEnvelope v2.0.0 schema.
pub fn validate_envelope_value(value: &serde_json::Value) -> Result<(), ValidationError> {
    let checker = Checker {
        schema: "agent_envelope",
        version: ENVELOPE_VERSION,
    };
    let root = checker.object(value, "")?;

    checker.uuid(root, "", "message_id")?;
    checker.uuid(root, "", "task_id")?;
    checker.uuid(root, "", "workflow_id")?;

    let agent_type = checker.string(root, "", "agent_type")?;
    AgentType::from_str(agent_type)
        .map_err(|e| checker.fail("agent_type", e))?;

    checker
        .field(root, "", "payload")?
        .as_object()
        .ok_or_else(|| checker.fail("payload", "expected an object"))?;

    let constraints = checker.object(checker.field(root, "", "constraints")?, "constraints")?;
    let timeout_ms = checker.u64(constraints, "constraints", "timeout_ms")?;
    if timeout_ms == 0 {
        return Err(checker.fail("constraints.timeout_ms", "must be positive"));
    }
    checker.u64(constraints, "constraints", "max_retries")?;
    let confidence = checker
        .field(constraints, "constraints", "required_confidence")?
        .as_f64()
        .ok_or_else(|| checker.fail("constraints.required_confidence", "expected a number"))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(checker.fail("constraints.required_confidence", "must be within [0, 1]"));
    }

    checker.u64(root, "", "retry_count")?;
    checker.one_of(root, "", "priority", &["critical", "high", "medium", "low"])?;
    checker.one_of(root, "", "status", &["pending", "dispatched"])?;

    let metadata = checker.object(checker.field(root, "", "metadata")?, "metadata")?;
    let version = checker.string(metadata, "metadata", "envelope_version")?;
    if version != ENVELOPE_VERSION {
        return Err(checker.fail(
            "metadata.envelope_version",
            format!("expected {ENVELOPE_VERSION}, got {version}"),
        ));
    }
    checker.string(metadata, "metadata", "created_at")?;
    checker.string(metadata, "metadata", "created_by")?;

    check_trace(&checker, root)?;

    let context = checker.object(checker.field(root, "", "workflow_context")?, "workflow_context")?;
    checker.one_of(
        context,
        "workflow_context",
        "workflow_type",
        &["app", "feature", "bugfix"],
    )?;
    checker.string(context, "workflow_context", "workflow_name")?;
    let stage = checker.string(context, "workflow_context", "current_stage")?;
    Stage::from_str(stage).map_err(|e| checker.fail("workflow_context.current_stage", e))?;
    checker
        .field(context, "workflow_context", "stage_outputs")?
        .as_object()
        .ok_or_else(|| checker.fail("workflow_context.stage_outputs", "expected an object"))?;

    Ok(())
}

/// Validate a raw wire value against the AgentResult v1.0.0 schema.
pub fn validate_result_value(value: &serde_json::Value) -> Result<(), ValidationError> {
    let checker = Checker {
        schema: "agent_result",
        version: RESULT_VERSION,
    };
    let root = checker.object(value, "")?;

    checker.uuid(root, "", "message_id")?;
    checker.uuid(root, "", "task_id")?;
    checker.uuid(root, "", "workflow_id")?;

    let agent_id = checker.string(root, "", "agent_id")?;
    if agent_id.is_empty() {
        return Err(checker.fail("agent_id", "must not be empty"));
    }

    let agent_type = checker.string(root, "", "agent_type")?;
    AgentType::from_str(agent_type).map_err(|e| checker.fail("agent_type", e))?;

    let stage = checker.string(root, "", "stage")?;
    let stage = Stage::from_str(stage).map_err(|e| checker.fail("stage", e))?;
    if stage.is_terminal() || stage == Stage::Initialization {
        return Err(checker.fail("stage", "must name a pipeline stage"));
    }

    checker.bool(root, "", "success")?;
    checker.one_of(root, "", "status", &["success", "failure", "partial", "blocked"])?;

    let version = checker.string(root, "", "version")?;
    if version != RESULT_VERSION {
        return Err(checker.fail(
            "version",
            format!("expected {RESULT_VERSION}, got {version}"),
        ));
    }

    // Agent output is always nested under result.output; a top-level custom
    // field does not satisfy the contract.
    let result = checker.object(checker.field(root, "", "result")?, "result")?;
    checker
        .field(result, "result", "output")?
        .as_object()
        .ok_or_else(|| checker.fail("result.output", "expected an object"))?;

    let errors = checker
        .field(root, "", "errors")?
        .as_array()
        .ok_or_else(|| checker.fail("errors", "expected an array"))?;
    for (index, entry) in errors.iter().enumerate() {
        let path = format!("errors[{index}]");
        let entry = checker.object(entry, &path)?;
        checker.string(entry, &path, "code")?;
        checker.string(entry, &path, "message")?;
        checker.bool(entry, &path, "recoverable")?;
    }

    let metrics = checker.object(checker.field(root, "", "metrics")?, "metrics")?;
    checker.u64(metrics, "metrics", "duration_ms")?;

    checker.string(root, "", "timestamp")?;
    check_trace(&checker, root)?;

    Ok(())
}
