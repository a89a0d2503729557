//! # Message bus and KV store ports
//!
//! Transport layer for the orchestrator: an asynchronous, topic-based
//! pub/sub with optional durable stream mirroring and consumer groups, plus
//! a small key-value port used for idempotency markers, distributed locks,
//! and state snapshots.
//!
//! The bus is schema-agnostic: it moves JSON values and never validates
//! them. Contract enforcement lives in `conductor-contracts` and runs at
//! the producer and consumer boundaries.
//!
//! Two adapters ship with the crate:
//!
//! - [`RedisBus`] / [`RedisKvStore`]: pub/sub for fan-out, streams for
//!   durability, consumer groups for competing consumers, Lua for CAS.
//! - [`InMemoryBus`] / [`InMemoryKvStore`]: same observable semantics,
//!   no broker, used by tests and the default dev profile.

pub mod bus;
pub mod kv;
pub mod memory;
pub mod redis_adapter;

pub use bus::{
    Ack, BusError, BusHealth, Delivery, MessageBus, MessageHandler, PublishOptions,
    SubscribeOptions, SubscriptionHandle,
};
pub use kv::{KvError, KvHealth, KvStore};
pub use memory::{InMemoryBus, InMemoryKvStore};
pub use redis_adapter::{RedisBus, RedisKvStore};

/// Durable stream conventionally mirroring a topic.
pub fn stream_for_topic(topic: &str) -> String {
    format!("stream:{topic}")
}
