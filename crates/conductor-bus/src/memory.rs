//! In-memory bus and KV adapters
//!
//! Same observable semantics as the Redis adapters, no broker: broadcast
//! fan-out per topic, durable stream mirror per stream name, competing
//! consumers with explicit ack and pending redelivery per group. Used by
//! tests and the default dev profile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::bus::{
    message_id_of, Ack, BusError, BusHealth, Delivery, MessageBus, MessageHandler,
    PublishOptions, SubscribeOptions, SubscriptionHandle,
};
use crate::kv::{KvError, KvHealth, KvStore};
use crate::stream_for_topic;

/// Delay before an unacked entry is offered again.
const REDELIVERY_DELAY: Duration = Duration::from_millis(100);

/// Idle poll interval for group workers.
const WORKER_IDLE_POLL: Duration = Duration::from_millis(25);

struct StreamEntry {
    id: u64,
    payload: serde_json::Value,
}

struct PendingEntry {
    attempts: u32,
    not_before: Instant,
}

struct GroupMember {
    id: Uuid,
    handler: MessageHandler,
}

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered entry
    cursor: usize,
    /// Delivered-but-unacked entries, keyed by entry id
    pending: HashMap<u64, PendingEntry>,
    members: Vec<GroupMember>,
    round_robin: usize,
    worker: Option<CancellationToken>,
}

#[derive(Default)]
struct StreamState {
    next_id: u64,
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct BusState {
    streams: HashMap<String, StreamState>,
}

/// In-memory message bus.
pub struct InMemoryBus {
    broadcast: DashMap<String, Vec<(Uuid, MessageHandler)>>,
    state: Arc<Mutex<BusState>>,
    wakeups: Arc<DashMap<(String, String), Arc<Notify>>>,
    /// Map from subscription id to (stream, group, member id) for grouped subs
    grouped: DashMap<Uuid, (String, String, Uuid)>,
    disconnected: std::sync::atomic::AtomicBool,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            broadcast: DashMap::new(),
            state: Arc::new(Mutex::new(BusState::default())),
            wakeups: Arc::new(DashMap::new()),
            grouped: DashMap::new(),
            disconnected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Entries sitting unacknowledged for a group (visible to tests and the
    /// detailed health probe).
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        let state = self.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() + (s_len(state.streams.get(stream)) - g.cursor))
            .unwrap_or(0)
    }

    fn wakeup(&self, stream: &str, group: &str) -> Arc<Notify> {
        self.wakeups
            .entry((stream.to_string(), group.to_string()))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

fn s_len(stream: Option<&StreamState>) -> usize {
    stream.map(|s| s.entries.len()).unwrap_or(0)
}

/// Work item selected for one delivery attempt.
struct WorkItem {
    entry_id: u64,
    payload: serde_json::Value,
    attempt: u32,
    handler: MessageHandler,
}

fn pick_work(state: &mut BusState, stream_name: &str, group_name: &str) -> Option<WorkItem> {
    let StreamState { entries, groups, .. } = state.streams.get_mut(stream_name)?;
    let group = groups.get_mut(group_name)?;
    if group.members.is_empty() {
        return None;
    }

    let now = Instant::now();

    // Redeliveries first, oldest entry id wins
    let due = group
        .pending
        .iter()
        .filter(|(_, p)| p.not_before <= now)
        .map(|(id, p)| (*id, p.attempts))
        .min_by_key(|(id, _)| *id);

    let (entry_id, attempt) = if let Some((id, attempts)) = due {
        let pending = group.pending.get_mut(&id).unwrap();
        pending.attempts += 1;
        // Hold off further redelivery until this attempt resolves
        pending.not_before = now + REDELIVERY_DELAY;
        (id, attempts + 1)
    } else if group.cursor < entries.len() {
        let entry = &entries[group.cursor];
        group.cursor += 1;
        group.pending.insert(
            entry.id,
            PendingEntry {
                attempts: 1,
                not_before: now + REDELIVERY_DELAY,
            },
        );
        (entry.id, 1)
    } else {
        return None;
    };

    let payload = entries.iter().find(|e| e.id == entry_id)?.payload.clone();

    let member = &group.members[group.round_robin % group.members.len()];
    group.round_robin = group.round_robin.wrapping_add(1);

    Some(WorkItem {
        entry_id,
        payload,
        attempt,
        handler: member.handler.clone(),
    })
}

async fn group_worker(
    state: Arc<Mutex<BusState>>,
    wakeup: Arc<Notify>,
    topic: String,
    stream_name: String,
    group_name: String,
    token: CancellationToken,
) {
    debug!(%topic, stream = %stream_name, group = %group_name, "group worker started");
    loop {
        if token.is_cancelled() {
            break;
        }

        let work = {
            let mut state = state.lock();
            pick_work(&mut state, &stream_name, &group_name)
        };

        match work {
            Some(work) => {
                let delivery = Delivery {
                    topic: topic.clone(),
                    payload: work.payload.clone(),
                    message_id: message_id_of(&work.payload),
                    stream_id: Some(work.entry_id.to_string()),
                    attempt: work.attempt,
                };
                let ack = (work.handler)(delivery).await;
                let mut state = state.lock();
                if let Some(group) = state
                    .streams
                    .get_mut(&stream_name)
                    .and_then(|s| s.groups.get_mut(&group_name))
                {
                    match ack {
                        Ack::Ack => {
                            group.pending.remove(&work.entry_id);
                        }
                        Ack::Retry => {
                            if let Some(pending) = group.pending.get_mut(&work.entry_id) {
                                pending.not_before = Instant::now() + REDELIVERY_DELAY;
                            }
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = wakeup.notified() => {}
                    _ = tokio::time::sleep(WORKER_IDLE_POLL) => {}
                }
            }
        }
    }
    debug!(%topic, group = %group_name, "group worker stopped");
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        options: PublishOptions,
    ) -> Result<(), BusError> {
        if self.disconnected.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }

        // Durable mirror first, matching the Redis adapter
        if let Some(stream_name) = &options.mirror_to_stream {
            let groups: Vec<String> = {
                let mut state = self.state.lock();
                let stream = state.streams.entry(stream_name.clone()).or_default();
                let id = stream.next_id;
                stream.next_id += 1;
                stream.entries.push(StreamEntry {
                    id,
                    payload: payload.clone(),
                });
                stream.groups.keys().cloned().collect()
            };
            for group in groups {
                self.wakeup(stream_name, &group).notify_one();
            }
        }

        // Broadcast fan-out: all handlers concurrently, failures isolated
        let handlers: Vec<MessageHandler> = self
            .broadcast
            .get(topic)
            .map(|entry| entry.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        let message_id = message_id_of(payload);
        for handler in handlers {
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.clone(),
                message_id: message_id.clone(),
                stream_id: None,
                attempt: 1,
            };
            let topic = topic.to_string();
            tokio::spawn(async move {
                let guard = tokio::spawn(async move { handler(delivery).await });
                if let Err(e) = guard.await {
                    error!(%topic, error = %e, "subscriber handler panicked");
                }
            });
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BusError> {
        if self.disconnected.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }

        let handle = SubscriptionHandle::new(topic);

        let Some(group_name) = options.consumer_group.clone() else {
            self.broadcast
                .entry(topic.to_string())
                .or_default()
                .push((handle.id, handler));
            return Ok(handle);
        };

        let stream_name = options
            .stream
            .clone()
            .unwrap_or_else(|| stream_for_topic(topic));
        let member_id = Uuid::now_v7();

        let start_worker = {
            let mut state = self.state.lock();
            let stream = state.streams.entry(stream_name.clone()).or_default();
            let group = stream.groups.entry(group_name.clone()).or_default();
            group.members.push(GroupMember {
                id: member_id,
                handler,
            });
            if group.worker.is_none() {
                group.worker = Some(handle.token.clone());
                true
            } else {
                false
            }
        };

        self.grouped
            .insert(handle.id, (stream_name.clone(), group_name.clone(), member_id));

        if start_worker {
            tokio::spawn(group_worker(
                self.state.clone(),
                self.wakeup(&stream_name, &group_name),
                topic.to_string(),
                stream_name.clone(),
                group_name.clone(),
                handle.token.clone(),
            ));
        }
        self.wakeup(&stream_name, &group_name).notify_one();

        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        if let Some((_, (stream_name, group_name, member_id))) = self.grouped.remove(&handle.id) {
            let mut state = self.state.lock();
            if let Some(group) = state
                .streams
                .get_mut(&stream_name)
                .and_then(|s| s.groups.get_mut(&group_name))
            {
                group.members.retain(|m| m.id != member_id);
                if group.members.is_empty() {
                    if let Some(worker) = group.worker.take() {
                        worker.cancel();
                    }
                }
            }
            return Ok(());
        }

        if let Some(mut entry) = self.broadcast.get_mut(&handle.topic) {
            entry.retain(|(id, _)| *id != handle.id);
        }
        Ok(())
    }

    async fn health(&self) -> Result<BusHealth, BusError> {
        if self.disconnected.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        Ok(BusHealth {
            ok: true,
            latency_ms: 0,
        })
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.disconnected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.broadcast.clear();
        let mut state = self.state.lock();
        for stream in state.streams.values_mut() {
            for group in stream.groups.values_mut() {
                if let Some(worker) = group.worker.take() {
                    worker.cancel();
                }
                group.members.clear();
            }
        }
        Ok(())
    }
}

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// In-memory KV store with TTL support.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, KvEntry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge(entries: &mut HashMap<String, KvEntry>, key: &str) {
        if let Some(entry) = entries.get(key) {
            if !entry.live() {
                entries.remove(key);
            }
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key);
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key);
        Ok(entries.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key);
        let current = match entries.get(key) {
            Some(entry) => entry.value.parse::<i64>().map_err(|_| KvError::Value {
                key: key.to_string(),
                reason: "not an integer".to_string(),
            })?,
            None => 0,
        };
        let next = current + 1;
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            KvEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key);
        let current = entries.get(key).map(|e| e.value.as_str());
        let matches = match expected {
            None => current.is_none(),
            Some(expected) => current == Some(expected),
        };
        if !matches {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value: new.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn cas_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, key);
        if entries.get(key).map(|e| e.value.as_str()) == Some(expected) {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn health(&self) -> Result<KvHealth, KvError> {
        Ok(KvHealth {
            ok: true,
            latency_ms: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        Arc::new(move |_delivery| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ack::Ack
            }
            .boxed()
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_publish_after_subscribe_is_delivered() {
        let bus = InMemoryBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "demo",
            counting_handler(count.clone()),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

        bus.publish("demo", &serde_json::json!({"n": 1}), PublishOptions::default())
            .await
            .unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let bus = InMemoryBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        bus.subscribe("demo", counting_handler(a.clone()), SubscribeOptions::default())
            .await
            .unwrap();
        bus.subscribe("demo", counting_handler(b.clone()), SubscribeOptions::default())
            .await
            .unwrap();

        bus.publish("demo", &serde_json::json!({}), PublishOptions::default())
            .await
            .unwrap();
        settle().await;
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_group_delivers_once_across_members() {
        let bus = InMemoryBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "jobs",
            counting_handler(a.clone()),
            SubscribeOptions::group("workers"),
        )
        .await
        .unwrap();
        bus.subscribe(
            "jobs",
            counting_handler(b.clone()),
            SubscribeOptions::group("workers"),
        )
        .await
        .unwrap();

        for n in 0..4 {
            bus.publish(
                "jobs",
                &serde_json::json!({"n": n}),
                PublishOptions::mirrored(stream_for_topic("jobs"), "k"),
            )
            .await
            .unwrap();
        }
        settle().await;
        assert_eq!(a.load(Ordering::SeqCst) + b.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unacked_entry_is_redelivered() {
        let bus = InMemoryBus::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_inner = attempts.clone();
        let handler: MessageHandler = Arc::new(move |_delivery| {
            let attempts = attempts_inner.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ack::Retry
                } else {
                    Ack::Ack
                }
            }
            .boxed()
        });
        bus.subscribe("jobs", handler, SubscribeOptions::group("workers"))
            .await
            .unwrap();
        bus.publish(
            "jobs",
            &serde_json::json!({"n": 1}),
            PublishOptions::mirrored(stream_for_topic("jobs"), "k"),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(bus.pending_count(&stream_for_topic("jobs"), "workers"), 0);
    }

    #[tokio::test]
    async fn test_group_drains_entries_published_while_absent() {
        let bus = InMemoryBus::new();
        let stream = stream_for_topic("jobs");

        // Group exists, then loses its only member
        let count = Arc::new(AtomicUsize::new(0));
        let handle = bus
            .subscribe("jobs", counting_handler(count.clone()), SubscribeOptions::group("workers"))
            .await
            .unwrap();
        bus.unsubscribe(handle).await.unwrap();

        bus.publish(
            "jobs",
            &serde_json::json!({"n": 1}),
            PublishOptions::mirrored(stream.clone(), "k"),
        )
        .await
        .unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // A member returns and drains the backlog
        bus.subscribe("jobs", counting_handler(count.clone()), SubscribeOptions::group("workers"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kv_cas_nx_and_eq() {
        let kv = InMemoryKvStore::new();
        assert!(kv.cas("k", None, "a", None).await.unwrap());
        assert!(!kv.cas("k", None, "b", None).await.unwrap());
        assert!(kv.cas("k", Some("a"), "b", None).await.unwrap());
        assert!(!kv.cas("k", Some("a"), "c", None).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_kv_ttl_expires() {
        let kv = InMemoryKvStore::new();
        kv.set("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kv_cas_delete_checks_owner() {
        let kv = InMemoryKvStore::new();
        kv.set("lock", "worker-a", None).await.unwrap();
        assert!(!kv.cas_delete("lock", "worker-b").await.unwrap());
        assert!(kv.cas_delete("lock", "worker-a").await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_is_sequential() {
        let kv = InMemoryKvStore::new();
        assert_eq!(kv.incr("n").await.unwrap(), 1);
        assert_eq!(kv.incr("n").await.unwrap(), 2);
        kv.set("n", "oops", None).await.unwrap();
        assert!(kv.incr("n").await.is_err());
    }
}
