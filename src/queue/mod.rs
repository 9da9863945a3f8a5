//! Typed operations on jobs and events (spec.md §4.2). Owns all key
//! naming — `BrokerClient` implementations never see anything but plain
//! keys and bytes.

mod types;

pub use types::{EnqueuePayload, JobId, JobState, JobStatus, QueueEvent, Usage};

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_stream::stream;
use futures::{Stream, StreamExt};

use crate::broker::BrokerClient;
use crate::config::Config;
use crate::error::QueueError;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Typed job-queue API, backed by a `BrokerClient`.
#[derive(Clone)]
pub struct Queue {
    broker: Arc<dyn BrokerClient>,
    config: Arc<Config>,
}

impl Queue {
    pub fn new(broker: Arc<dyn BrokerClient>, config: Arc<Config>) -> Self {
        Self { broker, config }
    }

    /// Exposes the underlying broker and config for tests (in sibling
    /// modules and in `tests/`) that need to fabricate staleness directly
    /// rather than waiting out a real TTL. Not `cfg(test)`-gated — an
    /// integration test in `tests/` links against the non-test rlib, same
    /// as `broker::InMemoryBroker`.
    pub fn broker_for_test(&self) -> Arc<dyn BrokerClient> {
        self.broker.clone()
    }

    pub fn config_for_test(&self) -> Arc<Config> {
        self.config.clone()
    }

    fn status_key(&self, job_id: &JobId) -> String {
        self.config.status_key(job_id.as_str())
    }

    fn channel_key(&self, job_id: &JobId) -> String {
        self.config.channel_key(job_id.as_str())
    }

    async fn refresh_ttl(&self, job_id: &JobId) -> Result<(), QueueError> {
        self.broker
            .expire(&self.status_key(job_id), self.config.job_ttl())
            .await?;
        Ok(())
    }

    /// Writes the status hash, appends to the FIFO list, then publishes
    /// `queued` last — spec.md §4.2: "the publish must happen last so
    /// that subscribers who attach after enqueue either see the status
    /// snapshot or the `queued` event."
    pub async fn enqueue(&self, payload: EnqueuePayload) -> Result<(), QueueError> {
        let now = now_secs();
        let status = JobStatus {
            status: JobState::Queued,
            created_at: now,
            updated_at: now,
            last_heartbeat: now,
            conversation_id: payload.conversation_id.clone(),
            model: payload.model.clone(),
            user_id: payload.user_id.clone(),
            result: None,
            error: None,
            metadata: payload.metadata.clone(),
        };

        self.broker
            .hset_many(&self.status_key(&payload.job_id), status.to_fields())
            .await?;
        self.refresh_ttl(&payload.job_id).await?;

        let bytes = serde_json::to_vec(&payload)?;
        self.broker.rpush(&self.config.queue_key, bytes).await?;

        self.publish_event(&QueueEvent::Status {
            job_id: payload.job_id.clone(),
            status: JobState::Queued,
            result: None,
            error: None,
        })
        .await?;

        Ok(())
    }

    /// Blocking list-pop; deserializes the payload. `None` on timeout.
    pub async fn pop_job(&self, timeout: Duration) -> Result<Option<EnqueuePayload>, QueueError> {
        let bytes = self.broker.blpop(&self.config.queue_key, timeout).await?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes `status`, `updated_at`, `last_heartbeat=now`, plus caller
    /// fields; refreshes TTL.
    pub async fn mark_status(
        &self,
        job_id: &JobId,
        status: JobState,
        conversation_id: &str,
        model: &str,
        user_id: &str,
        result: Option<serde_json::Value>,
        error: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        let now = now_secs();
        let current = self.get_status(job_id).await?;
        let created_at = current.as_ref().map(|s| s.created_at).unwrap_or(now);

        let new_status = JobStatus {
            status,
            created_at,
            updated_at: now,
            last_heartbeat: now,
            conversation_id: conversation_id.to_string(),
            model: model.to_string(),
            user_id: user_id.to_string(),
            result,
            error,
            metadata,
        };

        self.broker
            .hset_many(&self.status_key(job_id), new_status.to_fields())
            .await?;
        self.refresh_ttl(job_id).await?;
        Ok(())
    }

    /// Terminal write: `completed`. Removes the job from the active set.
    /// Must be followed by the caller publishing a terminal event.
    pub async fn store_result(
        &self,
        job_id: &JobId,
        conversation_id: &str,
        model: &str,
        user_id: &str,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        // Compare-read guard: a terminal write never reverts an
        // already-terminal status (spec.md §8 property 4).
        if let Some(current) = self.get_status(job_id).await? {
            if current.status.is_terminal() {
                return Ok(());
            }
        }
        self.mark_status(
            job_id,
            JobState::Completed,
            conversation_id,
            model,
            user_id,
            Some(result),
            None,
            None,
        )
        .await?;
        self.clear_active_job(job_id).await?;
        Ok(())
    }

    /// Terminal write: `failed`. Removes the job from the active set.
    /// Must be followed by the caller publishing a `failed` event.
    pub async fn store_failure(
        &self,
        job_id: &JobId,
        conversation_id: &str,
        model: &str,
        user_id: &str,
        error: String,
    ) -> Result<(), QueueError> {
        if let Some(current) = self.get_status(job_id).await? {
            if current.status.is_terminal() {
                return Ok(());
            }
        }
        self.mark_status(
            job_id,
            JobState::Failed,
            conversation_id,
            model,
            user_id,
            None,
            Some(error),
            None,
        )
        .await?;
        self.clear_active_job(job_id).await?;
        Ok(())
    }

    pub async fn register_active_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        self.broker
            .zadd(&self.config.active_set_key(), now_secs(), job_id.as_str())
            .await?;
        Ok(())
    }

    pub async fn clear_active_job(&self, job_id: &JobId) -> Result<(), QueueError> {
        self.broker
            .zrem(&self.config.active_set_key(), job_id.as_str())
            .await?;
        Ok(())
    }

    /// Refreshes `last_heartbeat` in both the status hash and the
    /// active-set score.
    pub async fn update_heartbeat(&self, job_id: &JobId) -> Result<(), QueueError> {
        let now = now_secs();
        if let Some(mut status) = self.get_status(job_id).await? {
            status.last_heartbeat = now;
            status.updated_at = now;
            self.broker
                .hset_many(&self.status_key(job_id), status.to_fields())
                .await?;
            self.refresh_ttl(job_id).await?;
        }
        self.broker
            .zadd(&self.config.active_set_key(), now, job_id.as_str())
            .await?;
        Ok(())
    }

    pub async fn publish_event(&self, event: &QueueEvent) -> Result<(), QueueError> {
        let channel = self.channel_key(event.job_id());
        let bytes = serde_json::to_vec(event)?;
        self.broker.publish(&channel, bytes).await?;
        Ok(())
    }

    pub async fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>, QueueError> {
        let fields = self.broker.hgetall(&self.status_key(job_id)).await?;
        Ok(JobStatus::from_fields(&fields))
    }

    /// Scans the active set for members whose heartbeat is at least
    /// `stale_after` old; fails each one whose current status is still
    /// non-terminal. Idempotent (spec.md §4.2).
    pub async fn fail_stale_jobs(&self) -> Result<Vec<JobId>, QueueError> {
        let threshold = now_secs() - self.config.heartbeat_stale_after().as_secs_f64();
        let stale_members = self
            .broker
            .zrange_by_score(&self.config.active_set_key(), threshold)
            .await?;

        let mut failed = Vec::new();
        for member in stale_members {
            let job_id = JobId::from(member);
            if self
                .fail_job_if_active(&job_id, "worker heartbeat stale")
                .await?
            {
                failed.push(job_id);
            }
        }
        Ok(failed)
    }

    /// Compare-read, write-failed-if-non-terminal. Returns whether this
    /// call performed the transition (used by the watchdog and by any
    /// future abandonment path).
    pub async fn fail_job_if_active(&self, job_id: &JobId, reason: &str) -> Result<bool, QueueError> {
        let current = match self.get_status(job_id).await? {
            Some(status) => status,
            None => return Ok(false),
        };
        if current.status.is_terminal() {
            return Ok(false);
        }

        self.mark_status(
            job_id,
            JobState::Failed,
            &current.conversation_id,
            &current.model,
            &current.user_id,
            None,
            Some(reason.to_string()),
            None,
        )
        .await?;
        self.clear_active_job(job_id).await?;
        self.publish_event(&QueueEvent::Failed {
            job_id: job_id.clone(),
            error: reason.to_string(),
        })
        .await?;
        Ok(true)
    }

    /// Subscribes before reading the snapshot, closing the race between
    /// enqueue and subscribe (spec.md §4.2, §9). The subscription is
    /// established eagerly, before this function returns — `async_stream`
    /// generators are lazy and don't run a single line until first polled,
    /// so deferring the `subscribe` call into the stream body would reopen
    /// exactly the race this method exists to close. If `include_snapshot`
    /// is true and a status hash exists, emits one synthetic `status`
    /// event first. Then yields published events until a terminal one is
    /// observed.
    pub async fn iter_events(
        &self,
        job_id: JobId,
        include_snapshot: bool,
    ) -> Result<Pin<Box<dyn Stream<Item = QueueEvent> + Send>>, QueueError> {
        let queue = self.clone();
        let channel = self.channel_key(&job_id);
        let mut subscription = self.broker.subscribe(&channel).await?;

        let s = stream! {
            if include_snapshot {
                if let Ok(Some(status)) = queue.get_status(&job_id).await {
                    yield QueueEvent::Status {
                        job_id: job_id.clone(),
                        status: status.status,
                        result: status.result.clone(),
                        error: status.error.clone(),
                    };
                    if status.status.is_terminal() {
                        yield terminal_event_from_status(&job_id, &status);
                        return;
                    }
                }
            }

            while let Some(bytes) = subscription.next().await {
                let event: QueueEvent = match serde_json::from_slice(&bytes) {
                    Ok(event) => event,
                    Err(_) => continue,
                };
                let is_terminal = event.is_terminal();
                yield event;
                if is_terminal {
                    return;
                }
            }
        };

        Ok(Box::pin(s))
    }

    /// Consumes `iter_events(include_snapshot=true)` until the first
    /// terminal event. Fails with `terminal_wait_timeout` if none arrives
    /// within `timeout`; fails with `unknown_job` if the job has no
    /// status hash at all.
    pub async fn wait_for_completion(
        &self,
        job_id: &JobId,
        timeout: Duration,
    ) -> Result<QueueEvent, QueueError> {
        if self.get_status(job_id).await?.is_none() {
            return Err(QueueError::UnknownJob {
                job_id: job_id.to_string(),
            });
        }

        let mut events = self.iter_events(job_id.clone(), true).await?;
        let wait = async {
            while let Some(event) = events.next().await {
                if event.is_terminal() {
                    return Some(event);
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) | Err(_) => Err(QueueError::TerminalWaitTimeout {
                job_id: job_id.to_string(),
            }),
        }
    }
}

fn terminal_event_from_status(job_id: &JobId, status: &JobStatus) -> QueueEvent {
    match status.status {
        JobState::Failed => QueueEvent::Failed {
            job_id: job_id.clone(),
            error: status.error.clone().unwrap_or_default(),
        },
        JobState::Interrupted => QueueEvent::Interrupt {
            job_id: job_id.clone(),
            content: status
                .result
                .as_ref()
                .and_then(|r| r.get("question"))
                .and_then(|q| q.as_str())
                .unwrap_or_default()
                .to_string(),
            metadata: status.result.clone(),
        },
        _ => QueueEvent::Completed {
            job_id: job_id.clone(),
            content: status
                .result
                .as_ref()
                .and_then(|r| r.get("content"))
                .and_then(|c| c.as_str())
                .map(|s| s.to_string()),
            metadata: status.result.clone(),
            usage: None,
        },
    }
}
