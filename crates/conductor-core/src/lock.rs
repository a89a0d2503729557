//! Distributed workflow lock
//!
//! One lock per workflow serializes result ingestion and state transitions
//! across orchestrator workers. Implemented as KV set-if-absent with a TTL
//! and a fencing token, so a worker can only release its own lock and a
//! crashed holder expires instead of wedging the workflow.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use conductor_bus::{KvError, KvStore};

/// Attempts made before conceding the lock to the current holder.
const ACQUIRE_ATTEMPTS: u32 = 5;

/// Base wait between acquisition attempts; each wait is jittered.
const ACQUIRE_BASE_DELAY: Duration = Duration::from_millis(25);

/// Error type for lock operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Held by another worker for the whole contention budget
    #[error("lock for workflow {0} is busy")]
    Busy(Uuid),

    /// KV transport failure
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Factory for per-workflow locks.
#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    worker_id: String,
    ttl: Duration,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, worker_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            worker_id: worker_id.into(),
            ttl,
        }
    }

    fn key(workflow_id: Uuid) -> String {
        format!("lock:{workflow_id}")
    }

    /// Acquire the lock for a workflow, retrying briefly with jitter.
    ///
    /// The stored value is `{worker_id}:{nonce}` so concurrent tasks inside
    /// one worker cannot release each other's locks either.
    pub async fn acquire(&self, workflow_id: Uuid) -> Result<LockGuard, LockError> {
        let key = Self::key(workflow_id);
        let token = format!("{}:{}", self.worker_id, Uuid::now_v7());

        for attempt in 1..=ACQUIRE_ATTEMPTS {
            if self.kv.cas(&key, None, &token, Some(self.ttl)).await? {
                debug!(%workflow_id, attempt, "acquired workflow lock");
                return Ok(LockGuard {
                    kv: self.kv.clone(),
                    key,
                    token,
                    released: false,
                });
            }

            if attempt < ACQUIRE_ATTEMPTS {
                let jitter = rand::thread_rng().gen_range(0..ACQUIRE_BASE_DELAY.as_millis() as u64);
                let delay = ACQUIRE_BASE_DELAY * attempt + Duration::from_millis(jitter);
                tokio::time::sleep(delay).await;
            }
        }

        Err(LockError::Busy(workflow_id))
    }
}

/// Held lock. Release is explicit; a dropped guard that was never released
/// is left to expire via its TTL (and logged).
pub struct LockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    /// Release the lock if this guard still owns it.
    pub async fn release(mut self) {
        self.released = true;
        match self.kv.cas_delete(&self.key, &self.token).await {
            Ok(true) => {}
            Ok(false) => {
                // TTL expired and someone else holds it now; nothing to do
                debug!(key = %self.key, "lock already rotated at release");
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "lock release failed; TTL will expire it");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(key = %self.key, "lock guard dropped without release; relying on TTL");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_bus::InMemoryKvStore;

    fn manager(worker: &str) -> LockManager {
        LockManager::new(
            Arc::new(InMemoryKvStore::new()),
            worker,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = manager("worker-a");
        let workflow_id = Uuid::now_v7();

        let guard = locks.acquire(workflow_id).await.unwrap();
        guard.release().await;

        // Released lock is acquirable again
        let guard = locks.acquire(workflow_id).await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let a = LockManager::new(kv.clone(), "worker-a", Duration::from_secs(30));
        let b = LockManager::new(kv, "worker-b", Duration::from_secs(30));
        let workflow_id = Uuid::now_v7();

        let guard = a.acquire(workflow_id).await.unwrap();
        let err = b.acquire(workflow_id).await.unwrap_err();
        assert!(matches!(err, LockError::Busy(id) if id == workflow_id));
        guard.release().await;

        let guard = b.acquire(workflow_id).await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn test_expired_lock_is_reacquirable() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let locks = LockManager::new(kv, "worker-a", Duration::from_millis(20));
        let workflow_id = Uuid::now_v7();

        let _abandoned = locks.acquire(workflow_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let guard = locks.acquire(workflow_id).await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn test_locks_are_independent_per_workflow() {
        let locks = manager("worker-a");
        let first = locks.acquire(Uuid::now_v7()).await.unwrap();
        let second = locks.acquire(Uuid::now_v7()).await.unwrap();
        first.release().await;
        second.release().await;
    }
}
