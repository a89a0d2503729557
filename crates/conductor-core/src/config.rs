//! Orchestrator configuration
//!
//! Loaded once at startup from the environment and validated; invalid
//! configuration aborts startup.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

use conductor_contracts::Stage;

use crate::retry::RetryPolicy;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Stable JSON for production
    Json,
    /// Pretty-printed for development
    Pretty,
}

/// Immutable runtime configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Run on the in-memory bus/KV/store adapters (no broker, no database)
    pub in_memory: bool,
    /// Redis connection URL for the bus and KV adapters
    pub bus_url: String,
    /// Postgres connection string; absent means the in-memory store
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub log_format: LogFormat,

    /// Per-stage task timeout overrides; `default_timeout` covers the rest
    pub stage_timeouts: HashMap<Stage, Duration>,
    pub default_timeout: Duration,
    /// Dispatch attempts per stage before the failure edge is taken
    pub task_max_retries: u32,

    /// Backoff for transient transport/contention failures
    pub retry: RetryPolicy,

    pub lock_ttl: Duration,
    pub dedup_ttl: Duration,
    pub snapshot_ttl: Duration,
    pub sweep_interval: Duration,
    /// Deliveries of an invalid result before it is parked for the DLQ
    pub park_after_attempts: u32,

    /// Stages whose completion requires a human decision before advancing
    pub decision_stages: Vec<Stage>,

    /// Identity used as the lock fencing token prefix
    pub worker_id: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            in_memory: false,
            bus_url: "redis://127.0.0.1:6379".to_string(),
            database_url: None,
            bind_addr: "0.0.0.0:9000".to_string(),
            log_format: LogFormat::Pretty,
            stage_timeouts: HashMap::new(),
            default_timeout: Duration::from_secs(120),
            task_max_retries: 3,
            retry: RetryPolicy::exponential(),
            lock_ttl: Duration::from_secs(30),
            dedup_ttl: Duration::from_secs(24 * 60 * 60),
            snapshot_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(1),
            park_after_attempts: 3,
            decision_stages: vec![],
            worker_id: format!("orchestrator-{}", Uuid::now_v7()),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("CONDUCTOR_IN_MEMORY") {
            config.in_memory = matches!(raw.as_str(), "1" | "true" | "yes");
        }

        if let Ok(url) = std::env::var("CONDUCTOR_BUS_URL") {
            config.bus_url = url;
        }
        if !config.bus_url.starts_with("redis://") && !config.bus_url.starts_with("rediss://") {
            return Err(invalid("CONDUCTOR_BUS_URL", "must be a redis:// URL"));
        }

        config.database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());

        if let Ok(addr) = std::env::var("CONDUCTOR_BIND_ADDR") {
            addr.parse::<std::net::SocketAddr>()
                .map_err(|e| invalid("CONDUCTOR_BIND_ADDR", e.to_string()))?;
            config.bind_addr = addr;
        }

        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.log_format = match format.as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => return Err(invalid("LOG_FORMAT", format!("unknown format `{other}`"))),
            };
        }

        if let Some(ms) = env_u64("CONDUCTOR_DEFAULT_TIMEOUT_MS")? {
            if ms == 0 {
                return Err(invalid("CONDUCTOR_DEFAULT_TIMEOUT_MS", "must be positive"));
            }
            config.default_timeout = Duration::from_millis(ms);
        }

        for stage in [
            Stage::Scaffolding,
            Stage::Validation,
            Stage::E2e,
            Stage::Integration,
            Stage::Deployment,
        ] {
            let name: &'static str = match stage {
                Stage::Scaffolding => "CONDUCTOR_TIMEOUT_SCAFFOLDING_MS",
                Stage::Validation => "CONDUCTOR_TIMEOUT_VALIDATION_MS",
                Stage::E2e => "CONDUCTOR_TIMEOUT_E2E_MS",
                Stage::Integration => "CONDUCTOR_TIMEOUT_INTEGRATION_MS",
                Stage::Deployment => "CONDUCTOR_TIMEOUT_DEPLOYMENT_MS",
                _ => unreachable!(),
            };
            if let Some(ms) = env_u64(name)? {
                if ms == 0 {
                    return Err(invalid(name, "must be positive"));
                }
                config.stage_timeouts.insert(stage, Duration::from_millis(ms));
            }
        }

        if let Some(n) = env_u64("CONDUCTOR_TASK_MAX_RETRIES")? {
            config.task_max_retries = n as u32;
        }
        if let Some(secs) = env_u64("CONDUCTOR_LOCK_TTL_SECS")? {
            if secs == 0 {
                return Err(invalid("CONDUCTOR_LOCK_TTL_SECS", "must be positive"));
            }
            config.lock_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("CONDUCTOR_SWEEP_INTERVAL_MS")? {
            if ms == 0 {
                return Err(invalid("CONDUCTOR_SWEEP_INTERVAL_MS", "must be positive"));
            }
            config.sweep_interval = Duration::from_millis(ms);
        }

        if let Ok(stages) = std::env::var("CONDUCTOR_DECISION_STAGES") {
            config.decision_stages = stages
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<Stage>()
                        .map_err(|e| invalid("CONDUCTOR_DECISION_STAGES", e))
                })
                .collect::<Result<Vec<_>, _>>()?;
        }

        if let Ok(worker_id) = std::env::var("CONDUCTOR_WORKER_ID") {
            if worker_id.is_empty() {
                return Err(invalid("CONDUCTOR_WORKER_ID", "must not be empty"));
            }
            config.worker_id = worker_id;
        }

        Ok(config)
    }

    /// Task timeout for a stage.
    pub fn timeout_for(&self, stage: Stage) -> Duration {
        self.stage_timeouts
            .get(&stage)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Whether a stage's completion is gated on a human decision.
    pub fn requires_decision(&self, stage: Stage) -> bool {
        self.decision_stages.contains(&stage)
    }
}

fn env_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| invalid(name, e.to_string())),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.dedup_ttl, Duration::from_secs(86_400));
        assert_eq!(config.timeout_for(Stage::E2e), config.default_timeout);
        assert!(!config.requires_decision(Stage::Integration));
    }

    #[test]
    fn test_stage_timeout_override() {
        let mut config = OrchestratorConfig::default();
        config
            .stage_timeouts
            .insert(Stage::Deployment, Duration::from_secs(600));
        assert_eq!(config.timeout_for(Stage::Deployment), Duration::from_secs(600));
        assert_eq!(config.timeout_for(Stage::E2e), config.default_timeout);
    }
}
