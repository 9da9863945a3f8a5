//! Redis-backed `BrokerClient` — the reference broker implementation of
//! spec.md §6 ("single-node in-memory broker with disk snapshots").
//!
//! Grounded on the connection-manager pattern used for redis-backed job
//! queues in the wider ecosystem (a shared `ConnectionManager` rather
//! than a pool of bare connections, since `ConnectionManager` already
//! multiplexes and reconnects transparently).

use std::collections::HashMap;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt as _;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::{BrokerClient, BrokerStream};
use crate::error::BrokerError;

/// A `BrokerClient` backed by a real Redis (or Redis-compatible) server.
#[derive(Clone)]
pub struct RedisBroker {
    manager: ConnectionManager,
    client: Client,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|e| BrokerError::Transient(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        Ok(Self { manager, client })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn map_err(e: redis::RedisError) -> BrokerError {
    BrokerError::Transient(e.to_string())
}

#[async_trait]
impl BrokerClient for RedisBroker {
    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = conn.rpush(key, value).await.map_err(map_err)?;
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut conn = self.conn();
        // BLPOP returns (key, value); we only care about the value.
        let result: Option<(String, Vec<u8>)> = conn
            .blpop(key, timeout.as_secs_f64())
            .await
            .map_err(map_err)?;
        Ok(result.map(|(_, value)| value))
    }

    async fn hset_many(&self, key: &str, fields: Vec<(String, String)>) -> Result<(), BrokerError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, &fields).await.map_err(map_err)?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn.hgetall(key).await.map_err(map_err)?;
        Ok(map)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = conn
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = conn.zadd(key, member, score).await.map_err(map_err)?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = conn.zrem(key, member).await.map_err(map_err)?;
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn();
        let members: Vec<String> = conn
            .zrangebyscore(key, f64::NEG_INFINITY, max)
            .await
            .map_err(map_err)?;
        Ok(members)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = conn.publish(channel, payload).await.map_err(map_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerStream, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_err)?;
        pubsub.subscribe(channel).await.map_err(map_err)?;

        let stream = stream! {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                yield payload;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await.map_err(map_err)?;
        Ok(())
    }
}
