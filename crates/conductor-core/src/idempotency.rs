//! Idempotency markers
//!
//! `seen:{message_id}` keys with a 24 h TTL guarantee at-most-once
//! processing per consumer group across redeliveries and competing workers.

use std::sync::Arc;
use std::time::Duration;

use conductor_bus::{KvError, KvStore};

/// Deduplication guard over the KV store.
#[derive(Clone)]
pub struct DedupGuard {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl DedupGuard {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn key(message_id: &str) -> String {
        format!("seen:{message_id}")
    }

    /// Claim a message id. Returns true exactly once per id within the TTL;
    /// false means this delivery is a replay.
    pub async fn claim(&self, message_id: &str) -> Result<bool, KvError> {
        self.kv
            .cas(&Self::key(message_id), None, "1", Some(self.ttl))
            .await
    }

    /// Drop a claim so another worker can process the message (used when
    /// processing is abandoned after the claim, e.g. lock contention).
    pub async fn unclaim(&self, message_id: &str) -> Result<(), KvError> {
        self.kv.del(&Self::key(message_id)).await?;
        Ok(())
    }

    /// Whether a message id has been claimed.
    pub async fn is_claimed(&self, message_id: &str) -> Result<bool, KvError> {
        Ok(self.kv.get(&Self::key(message_id)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_bus::InMemoryKvStore;

    #[tokio::test]
    async fn test_claim_is_exactly_once() {
        let guard = DedupGuard::new(
            Arc::new(InMemoryKvStore::new()),
            Duration::from_secs(60),
        );
        assert!(guard.claim("m-1").await.unwrap());
        assert!(!guard.claim("m-1").await.unwrap());
        assert!(guard.claim("m-2").await.unwrap());
        assert!(guard.is_claimed("m-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unclaim_reopens_the_id() {
        let guard = DedupGuard::new(
            Arc::new(InMemoryKvStore::new()),
            Duration::from_secs(60),
        );
        assert!(guard.claim("m-1").await.unwrap());
        guard.unclaim("m-1").await.unwrap();
        assert!(guard.claim("m-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_reopens_after_ttl() {
        let guard = DedupGuard::new(
            Arc::new(InMemoryKvStore::new()),
            Duration::from_millis(20),
        );
        assert!(guard.claim("m-1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(guard.claim("m-1").await.unwrap());
    }
}
