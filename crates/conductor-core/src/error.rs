//! Service-level error type
//!
//! Maps the error taxonomy onto one enum: validation (never retried),
//! transport and contention (retried locally), conflicts (surfaced as 409),
//! and fatal invariant breaks (workflow is failed and the error logged).

use uuid::Uuid;

use conductor_bus::{BusError, KvError};
use conductor_contracts::ValidationError;
use conductor_storage::StoreError;

/// Error type for orchestration operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Schema or invariant violation; never retryable
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Bus transport failure
    #[error(transparent)]
    Bus(#[from] BusError),

    /// KV transport failure
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Request conflicts with current state (e.g. cancelling a terminal
    /// workflow, resolving a decision that is not pending)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Lock could not be acquired within the contention budget
    #[error("workflow {0} is locked by another worker")]
    Locked(Uuid),

    /// Impossible state; the workflow is marked failed and an alert logged
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ServiceError {
    /// Whether a backoff retry can help.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Bus(e) => e.is_transient(),
            ServiceError::Kv(e) => e.is_transient(),
            ServiceError::Store(e) => e.is_contention(),
            ServiceError::Locked(_) => true,
            ServiceError::Validation(_)
            | ServiceError::Conflict(_)
            | ServiceError::Fatal(_) => false,
        }
    }
}
