//! Thin abstraction over a key/value + pub/sub broker (spec.md §4.1).
//!
//! No business logic lives here: each method is a single broker
//! round-trip. `Queue` (in `crate::queue`) is the only caller and owns
//! all key naming.

mod memory;
mod redis_broker;

pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::BrokerError;

/// A stream of raw pub/sub payloads. Ends (rather than erroring) on a
/// transient disconnect, per spec.md §4.1 — callers reopen.
pub type BrokerStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Append a value to the tail of a FIFO list.
    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), BrokerError>;

    /// Block until a value is available at the head of a FIFO list, or
    /// `timeout` elapses (returning `None`).
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError>;

    /// Write multiple hash fields in one round-trip.
    async fn hset_many(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), BrokerError>;

    /// Read all fields of a hash. Empty map if the key does not exist.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;

    /// Refresh a key's TTL.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Add/update a member's score in a sorted set.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), BrokerError>;

    /// Remove a member from a sorted set.
    async fn zrem(&self, key: &str, member: &str) -> Result<(), BrokerError>;

    /// Members with score `<= max`.
    async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<String>, BrokerError>;

    /// Publish a message to a channel.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Subscribe to a channel. Subscribers only receive messages
    /// published while subscribed (no replay) — the broker contract of
    /// spec.md §6.
    async fn subscribe(&self, channel: &str) -> Result<BrokerStream, BrokerError>;

    /// Delete a key outright.
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;
}
