//! In-process `BrokerClient` test double.
//!
//! Exercises every ordering/TTL invariant in spec.md §8 without a live
//! Redis instance. Not cfg(test)-gated so integration tests under
//! `tests/` can use it too (mirrors the base crate's pattern of shipping
//! a `test-support` feature / fake adapter alongside the real one, e.g.
//! `oj-adapters`'s `FakeAdapter`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use super::{BrokerClient, BrokerStream};
use crate::error::BrokerError;

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    channels: HashMap<String, broadcast::Sender<Vec<u8>>>,
    expirations: HashMap<String, (Instant, Duration)>,
}

/// An in-memory broker, sufficient for unit and integration tests.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    push_notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            push_notify: Arc::new(Notify::new()),
        }
    }

    /// Time remaining on a key's TTL, for assertions in tests (spec.md
    /// §8 property 6). `None` if the key has no recorded TTL.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.lock();
        let (set_at, ttl) = inner.expirations.get(key)?;
        Some(ttl.saturating_sub(set_at.elapsed()))
    }

    fn channel_sender(inner: &mut Inner, channel: &str) -> broadcast::Sender<Vec<u8>> {
        inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), BrokerError> {
        self.inner
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        self.push_notify.notify_waiters();
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self
                .inner
                .lock()
                .lists
                .get_mut(key)
                .and_then(|list| list.pop_front())
            {
                return Ok(Some(value));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let notified = self.push_notify.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn hset_many(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        let entry = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field, value);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.inner
            .lock()
            .expirations
            .insert(key.to_string(), (Instant::now(), ttl));
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), BrokerError> {
        self.inner
            .lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        if let Some(set) = self.inner.lock().zsets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<String>, BrokerError> {
        let inner = self.inner.lock();
        let mut members: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).expect("score is never NaN"));
        Ok(members.into_iter().map(|(member, _)| member).collect())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let sender = Self::channel_sender(&mut self.inner.lock(), channel);
        // No receivers is fine — matches real pub/sub semantics.
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerStream, BrokerError> {
        let sender = Self::channel_sender(&mut self.inner.lock(), channel);
        let rx = sender.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| item.ok());
        Ok(Box::pin(stream) as BrokerStream)
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        inner.lists.remove(key);
        inner.hashes.remove(key);
        inner.zsets.remove(key);
        inner.expirations.remove(key);
        Ok(())
    }
}
