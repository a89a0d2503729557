// Process-wide schema registry
//
// Maps (name, version) to a validator function. Populated once at startup
// with every known schema; lookups support an explicit version or "latest".

use std::collections::HashMap;
use std::sync::Arc;

use crate::validation::{validate_envelope_value, validate_result_value, ValidationError};

/// Registry name of the task envelope schema.
pub const ENVELOPE_SCHEMA: &str = "agent_envelope";

/// Registry name of the agent result schema.
pub const RESULT_SCHEMA: &str = "agent_result";

/// Identifies one registered schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey {
    pub name: String,
    pub version: String,
}

impl SchemaKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

type Validator = Arc<dyn Fn(&serde_json::Value) -> Result<(), ValidationError> + Send + Sync>;

/// Mapping from `(name, version)` to a validator.
///
/// Breaking schema changes bump the major version; the registry may hold
/// several versions of one schema at the same time. The bus stays
/// schema-agnostic; producers and consumers call into this instead.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    validators: HashMap<SchemaKey, Validator>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every schema this orchestrator speaks:
    /// envelope v2.0.0 and result v1.0.0. Envelope v1 is deliberately
    /// absent; v1 ingress fails validation.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            ENVELOPE_SCHEMA,
            crate::envelope::ENVELOPE_VERSION,
            validate_envelope_value,
        );
        registry.register(
            RESULT_SCHEMA,
            crate::result::RESULT_VERSION,
            validate_result_value,
        );
        registry
    }

    /// Register a validator for one schema version.
    pub fn register<F>(&mut self, name: &str, version: &str, validator: F)
    where
        F: Fn(&serde_json::Value) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        self.validators
            .insert(SchemaKey::new(name, version), Arc::new(validator));
    }

    /// Validate a value against an explicit schema version.
    pub fn validate(
        &self,
        name: &str,
        version: &str,
        value: &serde_json::Value,
    ) -> Result<(), ValidationError> {
        let validator = self
            .validators
            .get(&SchemaKey::new(name, version))
            .ok_or_else(|| {
                ValidationError::new(name, version, "", "schema version not registered")
            })?;
        validator(value)
    }

    /// Validate against the highest registered version of a schema.
    pub fn validate_latest(
        &self,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), ValidationError> {
        let version = self
            .latest_version(name)
            .ok_or_else(|| ValidationError::new(name, "latest", "", "schema not registered"))?;
        self.validate(name, &version, value)
    }

    /// Highest registered version of a schema, by semantic-version order.
    pub fn latest_version(&self, name: &str) -> Option<String> {
        self.versions(name).into_iter().next_back()
    }

    /// All registered versions of a schema, ascending.
    pub fn versions(&self, name: &str) -> Vec<String> {
        let mut versions: Vec<String> = self
            .validators
            .keys()
            .filter(|key| key.name == name)
            .map(|key| key.version.clone())
            .collect();
        versions.sort_by_key(|v| semver_key(v));
        versions
    }

    /// Highest version both registered here and accepted by the consumer.
    ///
    /// Used when dispatching: consumers declare the versions they accept and
    /// the orchestrator picks the highest common one.
    pub fn select_version(&self, name: &str, accepted: &[&str]) -> Option<String> {
        self.versions(name)
            .into_iter()
            .rev()
            .find(|version| accepted.contains(&version.as_str()))
    }
}

fn semver_key(version: &str) -> (u64, u64, u64) {
    let mut parts = version.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        let registry = SchemaRegistry::with_builtins();
        assert_eq!(
            registry.latest_version(ENVELOPE_SCHEMA).as_deref(),
            Some("2.0.0")
        );
        assert_eq!(
            registry.latest_version(RESULT_SCHEMA).as_deref(),
            Some("1.0.0")
        );
    }

    #[test]
    fn test_unregistered_version_fails() {
        let registry = SchemaRegistry::with_builtins();
        let err = registry
            .validate(ENVELOPE_SCHEMA, "1.0.0", &serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.message, "schema version not registered");
    }

    #[test]
    fn test_latest_prefers_highest_semver() {
        let mut registry = SchemaRegistry::new();
        registry.register("demo", "1.9.0", |_| Ok(()));
        registry.register("demo", "1.10.0", |_| Ok(()));
        registry.register("demo", "0.2.0", |_| Ok(()));
        assert_eq!(registry.latest_version("demo").as_deref(), Some("1.10.0"));
    }

    #[test]
    fn test_select_version_highest_common() {
        let mut registry = SchemaRegistry::new();
        registry.register("demo", "1.0.0", |_| Ok(()));
        registry.register("demo", "2.0.0", |_| Ok(()));
        registry.register("demo", "3.0.0", |_| Ok(()));
        assert_eq!(
            registry.select_version("demo", &["1.0.0", "2.0.0"]).as_deref(),
            Some("2.0.0")
        );
        assert_eq!(registry.select_version("demo", &["4.0.0"]), None);
    }
}
