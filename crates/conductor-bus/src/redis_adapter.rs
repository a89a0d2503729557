//! Redis-backed bus and KV adapters
//!
//! Pub/sub carries low-latency fan-out; streams carry the durable mirror.
//! Three separate connections are held, one per role: command/KV traffic,
//! publishing, and subscribing. A connection in subscribe mode cannot issue
//! commands, so the roles never share.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::{
    message_id_of, Ack, BusError, BusHealth, Delivery, MessageBus, MessageHandler,
    PublishOptions, SubscribeOptions, SubscriptionHandle,
};
use crate::kv::{KvError, KvHealth, KvStore};
use crate::stream_for_topic;

/// How often a grouped consumer polls the stream when idle.
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How many entries a grouped consumer reads per poll.
const GROUP_READ_COUNT: usize = 16;

/// Unacked entries idle longer than this are claimed from dead consumers.
const STALE_CLAIM_IDLE: Duration = Duration::from_secs(30);

/// How often the stale-claim / own-pending sweep runs.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(5);

fn transport(e: redis::RedisError) -> BusError {
    BusError::Transport(e.to_string())
}

fn kv_transport(e: redis::RedisError) -> KvError {
    KvError::Transport(e.to_string())
}

/// Redis message bus.
///
/// `publish` appends to the mirror stream first (durability), then fans out
/// over pub/sub. `subscribe` resolves only after the broker confirmed the
/// channel subscription (or the consumer group exists), so a publish issued
/// immediately after `subscribe` returns is observed.
pub struct RedisBus {
    command: ConnectionManager,
    publisher: ConnectionManager,
    pubsub_sink: Mutex<redis::aio::PubSubSink>,
    handlers: std::sync::Arc<DashMap<String, Vec<(Uuid, MessageHandler)>>>,
    consumers: DashMap<Uuid, CancellationToken>,
    reader_token: CancellationToken,
}

impl RedisBus {
    /// Connect, establishing the three role connections.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(transport)?;
        let command = client.get_connection_manager().await.map_err(transport)?;
        let publisher = client.get_connection_manager().await.map_err(transport)?;
        let pubsub = client.get_async_pubsub().await.map_err(transport)?;
        let (sink, mut stream) = pubsub.split();

        let handlers: std::sync::Arc<DashMap<String, Vec<(Uuid, MessageHandler)>>> =
            std::sync::Arc::new(DashMap::new());
        let reader_token = CancellationToken::new();

        // Single reader over the subscriber connection, dispatching to the
        // per-topic handler sets.
        let reader_handlers = handlers.clone();
        let token = reader_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = stream.next() => {
                        let Some(message) = message else { break };
                        let topic = message.get_channel_name().to_string();
                        let payload: String = match message.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(%topic, error = %e, "dropping undecodable pubsub payload");
                                continue;
                            }
                        };
                        let value: serde_json::Value = match serde_json::from_str(&payload) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(%topic, error = %e, "dropping non-JSON pubsub payload");
                                continue;
                            }
                        };
                        dispatch_broadcast(&reader_handlers, &topic, value).await;
                    }
                }
            }
            debug!("pubsub reader stopped");
        });

        Ok(Self {
            command,
            publisher,
            pubsub_sink: Mutex::new(sink),
            handlers,
            consumers: DashMap::new(),
            reader_token,
        })
    }

    async fn subscribe_broadcast(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, BusError> {
        let handle = SubscriptionHandle::new(topic);
        let first_for_topic = {
            let mut entry = self.handlers.entry(topic.to_string()).or_default();
            entry.push((handle.id, handler));
            entry.len() == 1
        };

        if first_for_topic {
            // Listener-ready synchronization: resolve only once the broker
            // acknowledged the SUBSCRIBE.
            let mut sink = self.pubsub_sink.lock().await;
            if let Err(e) = sink.subscribe(topic).await {
                self.remove_handler(topic, handle.id);
                return Err(BusError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(handle)
    }

    async fn subscribe_group(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionHandle, BusError> {
        let group = options
            .consumer_group
            .clone()
            .expect("subscribe_group requires a consumer group");
        let stream = options
            .stream
            .clone()
            .unwrap_or_else(|| stream_for_topic(topic));
        let consumer = options
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::now_v7()));

        // Create the group before returning so entries published right after
        // subscribe() resolves are inside the group's view. Starting at 0
        // makes history mirrored before the group existed visible too.
        let mut conn = self.command.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&stream, &group, "0")
            .await;
        if let Err(e) = created {
            // BUSYGROUP means the group already exists; that is fine.
            if e.code() != Some("BUSYGROUP") {
                return Err(BusError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let handle = SubscriptionHandle::new(topic);
        let token = handle.token.clone();
        self.consumers.insert(handle.id, token.clone());

        let loop_topic = topic.to_string();
        let loop_conn = self.command.clone();
        tokio::spawn(group_consumer_loop(
            loop_conn, loop_topic, stream, group, consumer, handler, token,
        ));

        Ok(handle)
    }

    fn remove_handler(&self, topic: &str, id: Uuid) {
        if let Some(mut entry) = self.handlers.get_mut(topic) {
            entry.retain(|(handler_id, _)| *handler_id != id);
        }
    }
}

async fn dispatch_broadcast(
    handlers: &DashMap<String, Vec<(Uuid, MessageHandler)>>,
    topic: &str,
    payload: serde_json::Value,
) {
    let snapshot: Vec<MessageHandler> = handlers
        .get(topic)
        .map(|entry| entry.iter().map(|(_, h)| h.clone()).collect())
        .unwrap_or_default();
    if snapshot.is_empty() {
        return;
    }

    let message_id = message_id_of(&payload);
    // All handlers run concurrently; one failing or panicking must not
    // cancel its siblings or the reader.
    let joins = snapshot.into_iter().map(|handler| {
        let delivery = Delivery {
            topic: topic.to_string(),
            payload: payload.clone(),
            message_id: message_id.clone(),
            stream_id: None,
            attempt: 1,
        };
        tokio::spawn(async move {
            let _ = handler(delivery).await;
        })
    });
    for join in futures::future::join_all(joins).await {
        if let Err(e) = join {
            error!(%topic, error = %e, "subscriber handler panicked");
        }
    }
}

async fn group_consumer_loop(
    mut conn: ConnectionManager,
    topic: String,
    stream: String,
    group: String,
    consumer: String,
    handler: MessageHandler,
    token: CancellationToken,
) {
    debug!(%topic, %stream, %group, %consumer, "group consumer started");

    // Recovery pass: drain entries delivered to this consumer but never
    // acknowledged before the last shutdown.
    drain_own_pending(&mut conn, &topic, &stream, &group, &consumer, &handler).await;

    let mut last_reclaim = Instant::now();
    loop {
        if token.is_cancelled() {
            break;
        }

        if last_reclaim.elapsed() >= RECLAIM_INTERVAL {
            last_reclaim = Instant::now();
            claim_stale(&mut conn, &topic, &stream, &group, &consumer, &handler).await;
            drain_own_pending(&mut conn, &topic, &stream, &group, &consumer, &handler).await;
        }

        let read = StreamReadOptions::default()
            .group(&group, &consumer)
            .count(GROUP_READ_COUNT);
        let reply: Result<StreamReadReply, redis::RedisError> = conn
            .xread_options(&[stream.as_str()], &[">"], &read)
            .await;

        match reply {
            Ok(reply) => {
                let mut delivered = false;
                for key in reply.keys {
                    for entry in key.ids {
                        delivered = true;
                        handle_stream_entry(
                            &mut conn, &topic, &stream, &group, &consumer, &handler, entry, 1,
                        )
                        .await;
                    }
                }
                if !delivered {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(GROUP_POLL_INTERVAL) => {}
                    }
                }
            }
            Err(e) => {
                warn!(%topic, %stream, error = %e, "group read failed; backing off");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }

    debug!(%topic, %group, %consumer, "group consumer stopped");
}

/// Re-deliver this consumer's pending entries, carrying the server-side
/// delivery count so downstream parking budgets are honest.
async fn drain_own_pending(
    conn: &mut ConnectionManager,
    topic: &str,
    stream: &str,
    group: &str,
    consumer: &str,
    handler: &MessageHandler,
) {
    let pending: StreamPendingCountReply = match conn
        .xpending_consumer_count(stream, group, "-", "+", GROUP_READ_COUNT, consumer)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            debug!(%stream, %group, error = %e, "pending lookup failed");
            return;
        }
    };

    for pending_id in pending.ids {
        let range: Result<StreamRangeReply, redis::RedisError> =
            conn.xrange(stream, &pending_id.id, &pending_id.id).await;
        let entry = match range {
            Ok(reply) => reply.ids.into_iter().next(),
            Err(e) => {
                debug!(%stream, id = %pending_id.id, error = %e, "pending fetch failed");
                continue;
            }
        };
        let Some(entry) = entry else {
            // Entry was trimmed out from under the group; nothing to retry
            let _: Result<i64, _> = conn.xack(stream, group, &[&pending_id.id]).await;
            continue;
        };

        let attempt = pending_id.times_delivered.max(1) as u32 + 1;
        handle_stream_entry(conn, topic, stream, group, consumer, handler, entry, attempt).await;
    }
}

/// Claim entries stuck pending on dead consumers past the idle threshold.
async fn claim_stale(
    conn: &mut ConnectionManager,
    topic: &str,
    stream: &str,
    group: &str,
    consumer: &str,
    handler: &MessageHandler,
) {
    let reply: Result<StreamAutoClaimReply, redis::RedisError> = redis::cmd("XAUTOCLAIM")
        .arg(stream)
        .arg(group)
        .arg(consumer)
        .arg(STALE_CLAIM_IDLE.as_millis() as u64)
        .arg("0-0")
        .query_async(conn)
        .await;

    match reply {
        Ok(reply) => {
            for entry in reply.claimed {
                handle_stream_entry(conn, topic, stream, group, consumer, handler, entry, 2).await;
            }
        }
        Err(e) => {
            debug!(%stream, %group, error = %e, "stale-claim pass failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_stream_entry(
    conn: &mut ConnectionManager,
    topic: &str,
    stream: &str,
    group: &str,
    consumer: &str,
    handler: &MessageHandler,
    entry: StreamId,
    attempt: u32,
) {
    let stream_id = entry.id.clone();
    let Some(raw) = entry.get::<String>("data") else {
        // Malformed producer entry; ack so it cannot wedge the group.
        warn!(%topic, %stream_id, "stream entry missing data field; acking");
        let _: Result<i64, _> = conn.xack(stream, group, &[&stream_id]).await;
        return;
    };

    let payload: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(%topic, %stream_id, error = %e, "stream entry is not JSON; acking");
            let _: Result<i64, _> = conn.xack(stream, group, &[&stream_id]).await;
            return;
        }
    };

    let delivery = Delivery {
        topic: topic.to_string(),
        payload: payload.clone(),
        message_id: message_id_of(&payload),
        stream_id: Some(stream_id.clone()),
        attempt,
    };

    match handler(delivery).await {
        Ack::Ack => {
            if let Err(e) = conn.xack::<_, _, _, i64>(stream, group, &[&stream_id]).await {
                warn!(%stream, %stream_id, error = %e, "XACK failed; entry will re-deliver");
            }
        }
        Ack::Retry => {
            // Entry stays pending for the next drain pass; claiming it back
            // to ourselves bumps the server-side delivery counter so the
            // attempt number keeps growing across retries.
            debug!(%topic, %stream_id, attempt, "handler requested retry; leaving unacked");
            let reclaim: Result<redis::streams::StreamClaimReply, redis::RedisError> =
                conn.xclaim(stream, group, consumer, 0, &[&stream_id]).await;
            if let Err(e) = reclaim {
                debug!(%stream, %stream_id, error = %e, "retry reclaim failed");
            }
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        options: PublishOptions,
    ) -> Result<(), BusError> {
        let serialized =
            serde_json::to_string(payload).map_err(|e| BusError::Serialization(e.to_string()))?;

        // Durable mirror first: a message is never observable on the
        // channel without its stream copy.
        if let Some(stream) = &options.mirror_to_stream {
            let mut conn = self.command.clone();
            let mut fields: Vec<(&str, String)> = vec![("data", serialized.clone())];
            if let Some(message_id) = message_id_of(payload) {
                fields.push(("message_id", message_id));
            }
            if let Some(key) = &options.key {
                fields.push(("key", key.clone()));
            }
            conn.xadd::<_, _, _, _, String>(stream, "*", &fields)
                .await
                .map_err(transport)?;
            if let Some(ttl) = options.ttl {
                conn.expire::<_, i64>(stream, ttl.as_secs() as i64)
                    .await
                    .map_err(transport)?;
            }
        }

        let mut publisher = self.publisher.clone();
        publisher
            .publish::<_, _, i64>(topic, serialized)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BusError> {
        if options.consumer_group.is_some() {
            self.subscribe_group(topic, handler, &options).await
        } else {
            self.subscribe_broadcast(topic, handler).await
        }
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        if let Some((_, token)) = self.consumers.remove(&handle.id) {
            token.cancel();
            return Ok(());
        }

        self.remove_handler(&handle.topic, handle.id);
        let topic_empty = self
            .handlers
            .get(&handle.topic)
            .map(|entry| entry.is_empty())
            .unwrap_or(true);
        if topic_empty {
            let mut sink = self.pubsub_sink.lock().await;
            sink.unsubscribe(&handle.topic).await.map_err(transport)?;
        }
        Ok(())
    }

    async fn health(&self) -> Result<BusHealth, BusError> {
        let started = Instant::now();
        let mut conn = self.command.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(BusHealth {
            ok: pong == "PONG",
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        for entry in self.consumers.iter() {
            entry.value().cancel();
        }
        self.consumers.clear();
        self.handlers.clear();
        self.reader_token.cancel();
        Ok(())
    }
}

/// CAS script: mode `nx` requires the key absent, mode `eq` requires the
/// current value to equal ARGV[2]. Sets ARGV[3], optionally with EX ARGV[4].
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == 'nx' then
  if current then return 0 end
else
  if current ~= ARGV[2] then return 0 end
end
if ARGV[4] ~= '' then
  redis.call('SET', KEYS[1], ARGV[3], 'EX', tonumber(ARGV[4]))
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// Delete-if-equals script used for fenced lock release.
const CAS_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis KV adapter over the command connection.
pub struct RedisKvStore {
    conn: ConnectionManager,
    cas: redis::Script,
    cas_delete: redis::Script,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(kv_transport)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(kv_transport)?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            cas: redis::Script::new(CAS_SCRIPT),
            cas_delete: redis::Script::new(CAS_DELETE_SCRIPT),
        }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(kv_transport)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs())
                .await
                .map_err(kv_transport),
            None => conn.set::<_, _, ()>(key, value).await.map_err(kv_transport),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(kv_transport)?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.map_err(|e| {
            if e.kind() == redis::ErrorKind::TypeError {
                KvError::Value {
                    key: key.to_string(),
                    reason: "not an integer".to_string(),
                }
            } else {
                kv_transport(e)
            }
        })
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let (mode, expected) = match expected {
            Some(value) => ("eq", value),
            None => ("nx", ""),
        };
        let ttl_arg = ttl.map(|t| t.as_secs().to_string()).unwrap_or_default();
        let swapped: i64 = self
            .cas
            .key(key)
            .arg(mode)
            .arg(expected)
            .arg(new)
            .arg(ttl_arg)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_transport)?;
        Ok(swapped == 1)
    }

    async fn cas_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .cas_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_transport)?;
        Ok(removed == 1)
    }

    async fn health(&self) -> Result<KvHealth, KvError> {
        let started = Instant::now();
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(kv_transport)?;
        Ok(KvHealth {
            ok: pong == "PONG",
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}
