//! KvStore port definition
//!
//! Used for idempotency markers (`seen:{message_id}`), distributed locks
//! (`lock:{workflow_id}`), and non-authoritative workflow snapshots.

use std::time::Duration;

use async_trait::async_trait;

/// Error type for KV operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// Broker connectivity failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Value is not usable for the requested operation (e.g. INCR on a
    /// non-integer)
    #[error("value error at {key}: {reason}")]
    Value { key: String, reason: String },
}

impl KvError {
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Transport(_))
    }
}

/// Round-trip health probe result
#[derive(Debug, Clone)]
pub struct KvHealth {
    pub ok: bool,
    pub latency_ms: u64,
}

/// Key-value service with atomic compare-and-swap.
///
/// All operations carry the caller's deadline via the surrounding task;
/// implementations keep individual round-trips short.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Delete a key; true when it existed.
    async fn del(&self, key: &str) -> Result<bool, KvError>;

    /// Atomic increment; initializes absent keys to 0 first.
    async fn incr(&self, key: &str) -> Result<i64, KvError>;

    /// Atomic compare-and-swap.
    ///
    /// `expected = None` means the key must be absent (set-if-absent, the
    /// NX idiom used by locks and dedup markers). Returns whether the swap
    /// happened.
    async fn cas(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Atomic delete-if-equals; releases a lock only for its owner.
    async fn cas_delete(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    async fn health(&self) -> Result<KvHealth, KvError>;
}
