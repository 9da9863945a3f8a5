//! The consumer loop (spec.md §4.4): pop a job, run it against the
//! backend, drive it through its state machine to a terminal status.

mod backend;

pub use backend::{
    AgentMessage, AgentMessageMetadata, AgentStatus, BackendClient, BackendReply, BackendRequest,
    HttpBackendClient, InterruptPayload,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::WorkerError;
use crate::queue::{EnqueuePayload, JobId, JobState, Queue, QueueEvent};

/// Clears a job's active-set entry exactly once, on whichever exit path
/// reaches it first — an explicit call on the happy path, or `Drop` as a
/// backstop against a future early return that forgets to.
struct ActiveJobGuard {
    queue: Queue,
    job_id: JobId,
    cleared: Arc<AtomicBool>,
}

impl ActiveJobGuard {
    fn new(queue: Queue, job_id: JobId) -> Self {
        Self {
            queue,
            job_id,
            cleared: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn clear(&self) {
        if !self.cleared.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.queue.clear_active_job(&self.job_id).await {
                warn!(job_id = %self.job_id, error = %e, "failed to clear active job entry");
            }
        }
    }
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        if self.cleared.load(Ordering::SeqCst) {
            return;
        }
        let queue = self.queue.clone();
        let job_id = self.job_id.clone();
        let cleared = self.cleared.clone();
        tokio::spawn(async move {
            if !cleared.swap(true, Ordering::SeqCst) {
                let _ = queue.clear_active_job(&job_id).await;
            }
        });
    }
}

/// Splits `text` into chunks of at most `limit` characters, preserving
/// order (spec.md §4.4: "split by character count, not word boundary").
fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(limit)
        .map(|slice| slice.iter().collect())
        .collect()
}

/// Runs `worker_count` sibling consumer loops until `shutdown` is
/// cancelled. Each loop finishes its current job before exiting (spec.md
/// §5: "do not abandon it mid-flight").
pub struct Worker {
    queue: Queue,
    backend: Arc<dyn BackendClient>,
    config: Arc<Config>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        queue: Queue,
        backend: Arc<dyn BackendClient>,
        config: Arc<Config>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            backend,
            config,
            shutdown,
        }
    }

    /// Spawns `worker_count` loops, returning their join handles.
    pub fn spawn_all(self) -> Vec<tokio::task::JoinHandle<()>> {
        let count = self.config.worker_count.max(1);
        (0..count)
            .map(|index| {
                let queue = self.queue.clone();
                let backend = self.backend.clone();
                let config = self.config.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    run_loop(index, queue, backend, config, shutdown).await;
                })
            })
            .collect()
    }
}

async fn run_loop(
    loop_index: usize,
    queue: Queue,
    backend: Arc<dyn BackendClient>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            info!(loop_index, "worker loop shutting down");
            return;
        }

        let popped = tokio::select! {
            result = queue.pop_job(Duration::from_secs(5)) => result,
            _ = shutdown.cancelled() => {
                info!(loop_index, "worker loop shutting down");
                return;
            }
        };

        let payload = match popped {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                warn!(loop_index, error = %e, "pop_job failed, retrying");
                continue;
            }
        };

        run_job(&queue, backend.as_ref(), &config, payload).await;
    }
}

async fn run_job(queue: &Queue, backend: &dyn BackendClient, config: &Config, payload: EnqueuePayload) {
    let job_id = payload.job_id.clone();
    let guard = ActiveJobGuard::new(queue.clone(), job_id.clone());

    if let Err(e) = step_mark_running(queue, &payload).await {
        error!(job_id = %job_id, error = %e, "failed to mark job running");
        guard.clear().await;
        return;
    }

    let status = Arc::new(tokio::sync::watch::channel(JobState::Running).0);
    let heartbeat_stop = CancellationToken::new();
    let heartbeat_handle = spawn_heartbeat_ticker(
        queue.clone(),
        job_id.clone(),
        status.clone(),
        config.worker_heartbeat_interval(),
        heartbeat_stop.clone(),
    );

    let request = BackendRequest {
        text: payload.text.clone(),
        raw_user_text: payload.raw_user_text.clone(),
        attachments: payload.attachments.clone(),
        metadata: payload.metadata.clone(),
        conversation_id: payload.conversation_id.clone(),
        user_id: payload.user_id.clone(),
        user_role: payload.user_role.clone(),
    };

    let outcome = backend.invoke(request).await;

    heartbeat_stop.cancel();
    let _ = heartbeat_handle.await;

    match outcome {
        Ok(reply) => {
            if let Err(e) = handle_reply(queue, config, &payload, reply, &status).await {
                fail_job(queue, &payload, e).await;
            }
        }
        Err(e) => fail_job(queue, &payload, e).await,
    }

    guard.clear().await;
}

async fn step_mark_running(queue: &Queue, payload: &EnqueuePayload) -> Result<(), WorkerError> {
    queue
        .mark_status(
            &payload.job_id,
            JobState::Running,
            &payload.conversation_id,
            &payload.model,
            &payload.user_id,
            None,
            None,
            None,
        )
        .await?;
    queue
        .publish_event(&QueueEvent::Status {
            job_id: payload.job_id.clone(),
            status: JobState::Running,
            result: None,
            error: None,
        })
        .await?;
    queue.register_active_job(&payload.job_id).await?;
    queue.update_heartbeat(&payload.job_id).await?;
    Ok(())
}

fn spawn_heartbeat_ticker(
    queue: Queue,
    job_id: JobId,
    status: Arc<tokio::sync::watch::Sender<JobState>>,
    interval: Duration,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it.
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {
                    let current = *status.borrow();
                    if let Err(e) = queue.publish_event(&QueueEvent::Heartbeat {
                        job_id: job_id.clone(),
                        status: current,
                    }).await {
                        debug!(job_id = %job_id, error = %e, "heartbeat publish failed");
                    }
                    if let Err(e) = queue.update_heartbeat(&job_id).await {
                        debug!(job_id = %job_id, error = %e, "heartbeat refresh failed");
                    }
                }
            }
        }
    })
}

async fn handle_reply(
    queue: &Queue,
    config: &Config,
    payload: &EnqueuePayload,
    reply: BackendReply,
    status: &tokio::sync::watch::Sender<JobState>,
) -> Result<(), WorkerError> {
    let agent_message = reply.agent_message;

    if agent_message.metadata.agent_status == AgentStatus::Interrupted {
        let interrupt = agent_message.metadata.interrupt_payload.clone();
        let question = interrupt
            .as_ref()
            .map(|p| p.question.clone())
            .unwrap_or_default();
        let result = serde_json::json!({
            "question": question,
            "interrupt_id": interrupt.as_ref().map(|p| p.interrupt_id.clone()),
            "content": interrupt.as_ref().and_then(|p| p.content.clone()),
            "artifact_id": interrupt.as_ref().and_then(|p| p.artifact_id.clone()),
            "artifact_type": interrupt.as_ref().and_then(|p| p.artifact_type.clone()),
        });

        queue
            .mark_status(
                &payload.job_id,
                JobState::Interrupted,
                &payload.conversation_id,
                &payload.model,
                &payload.user_id,
                Some(result.clone()),
                None,
                None,
            )
            .await?;
        queue
            .publish_event(&QueueEvent::Interrupt {
                job_id: payload.job_id.clone(),
                content: question,
                metadata: Some(result),
            })
            .await?;
        queue.clear_active_job(&payload.job_id).await?;
        return Ok(());
    }

    if !agent_message.raw_text.is_empty() {
        let _ = status.send(JobState::Streaming);
        queue
            .mark_status(
                &payload.job_id,
                JobState::Streaming,
                &payload.conversation_id,
                &payload.model,
                &payload.user_id,
                None,
                None,
                None,
            )
            .await?;
        queue
            .publish_event(&QueueEvent::Status {
                job_id: payload.job_id.clone(),
                status: JobState::Streaming,
                result: None,
                error: None,
            })
            .await?;

        for chunk in chunk_text(&agent_message.raw_text, config.chunk_char_limit) {
            queue
                .publish_event(&QueueEvent::Chunk {
                    job_id: payload.job_id.clone(),
                    content: chunk,
                })
                .await?;
            queue.update_heartbeat(&payload.job_id).await?;
        }
    }

    let result = serde_json::json!({
        "conversation_id": payload.conversation_id,
        "content": agent_message.raw_text,
        "response": agent_message.content,
        "attachments": agent_message.metadata.attachments,
    });

    queue
        .store_result(
            &payload.job_id,
            &payload.conversation_id,
            &payload.model,
            &payload.user_id,
            result,
        )
        .await?;
    queue
        .publish_event(&QueueEvent::Completed {
            job_id: payload.job_id.clone(),
            content: Some(agent_message.raw_text.clone()),
            metadata: agent_message
                .metadata
                .attachments
                .clone()
                .map(|a| serde_json::json!({ "attachments": a })),
            usage: None,
        })
        .await?;
    queue.update_heartbeat(&payload.job_id).await?;

    Ok(())
}

async fn fail_job(queue: &Queue, payload: &EnqueuePayload, err: WorkerError) {
    let message = err.terminal_message();
    error!(job_id = %payload.job_id, error = %message, "job failed");

    if let Err(e) = queue
        .store_failure(
            &payload.job_id,
            &payload.conversation_id,
            &payload.model,
            &payload.user_id,
            message.clone(),
        )
        .await
    {
        error!(job_id = %payload.job_id, error = %e, "failed to store job failure");
    }
    if let Err(e) = queue
        .publish_event(&QueueEvent::Failed {
            job_id: payload.job_id.clone(),
            error: message,
        })
        .await
    {
        error!(job_id = %payload.job_id, error = %e, "failed to publish failed event");
    }
    let _ = queue.update_heartbeat(&payload.job_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex as StdMutex;

    fn test_queue() -> Queue {
        Queue::new(Arc::new(InMemoryBroker::new()), Arc::new(Config::default()))
    }

    fn sample_payload(job_id: &str) -> EnqueuePayload {
        EnqueuePayload {
            job_id: JobId::from(job_id),
            model: "agent-a".to_string(),
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            user_role: None,
            text: "hi".to_string(),
            raw_user_text: None,
            attachments: None,
            metadata: None,
        }
    }

    struct ScriptedBackend {
        replies: StdMutex<Vec<Result<BackendReply, WorkerError>>>,
    }

    impl ScriptedBackend {
        fn once(reply: Result<BackendReply, WorkerError>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(vec![reply]),
            })
        }
    }

    #[async_trait]
    impl BackendClient for ScriptedBackend {
        async fn invoke(&self, _req: BackendRequest) -> Result<BackendReply, WorkerError> {
            self.replies
                .lock()
                .unwrap()
                .pop()
                .expect("no scripted reply left")
        }
    }

    fn active_reply(raw_text: &str) -> BackendReply {
        serde_json::from_value(serde_json::json!({
            "conversation": {},
            "user_message": {},
            "agent_message": {
                "raw_text": raw_text,
                "content": raw_text,
                "metadata": { "agent_status": "active" }
            }
        }))
        .unwrap()
    }

    fn interrupted_reply(question: &str) -> BackendReply {
        serde_json::from_value(serde_json::json!({
            "agent_message": {
                "raw_text": "",
                "metadata": {
                    "agent_status": "interrupted",
                    "interrupt_payload": { "interrupt_id": "i1", "question": question }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn chunk_text_splits_by_character_count_preserving_order() {
        let chunks = chunk_text("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn chunk_text_on_empty_string_yields_no_chunks() {
        assert!(chunk_text("", 100).is_empty());
    }

    #[tokio::test]
    async fn happy_path_completes_with_store_result_and_completed_event() {
        let queue = test_queue();
        let config = Config::default();
        let payload = sample_payload("j1");
        queue.enqueue(payload.clone()).await.unwrap();

        let backend = ScriptedBackend::once(Ok(active_reply("hello world")));
        run_job(&queue, backend.as_ref(), &config, payload.clone()).await;

        let status = queue.get_status(&payload.job_id).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert_eq!(
            status.result.unwrap().get("content").unwrap().as_str().unwrap(),
            "hello world"
        );
    }

    #[tokio::test]
    async fn reply_with_empty_text_skips_streaming_but_still_completes() {
        let queue = test_queue();
        let config = Config::default();
        let payload = sample_payload("j1");
        queue.enqueue(payload.clone()).await.unwrap();

        let backend = ScriptedBackend::once(Ok(active_reply("")));
        run_job(&queue, backend.as_ref(), &config, payload.clone()).await;

        let status = queue.get_status(&payload.job_id).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
    }

    #[tokio::test]
    async fn long_reply_is_chunked_at_the_configured_limit() {
        let queue = test_queue();
        let mut config = Config::default();
        config.chunk_char_limit = 4;
        let payload = sample_payload("j1");
        queue.enqueue(payload.clone()).await.unwrap();

        let mut events = queue.iter_events(payload.job_id.clone(), false).await.unwrap();
        let backend = ScriptedBackend::once(Ok(active_reply("abcdefghij")));
        run_job(&queue, backend.as_ref(), &config, payload.clone()).await;

        let mut chunks = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(50), events.next()).await {
                Ok(Some(QueueEvent::Chunk { content, .. })) => chunks.push(content),
                Ok(Some(event)) if event.is_terminal() => break,
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[tokio::test]
    async fn interrupted_reply_marks_job_interrupted_and_clears_active_set() {
        let queue = test_queue();
        let config = Config::default();
        let payload = sample_payload("j1");
        queue.enqueue(payload.clone()).await.unwrap();

        let backend = ScriptedBackend::once(Ok(interrupted_reply("continue?")));
        run_job(&queue, backend.as_ref(), &config, payload.clone()).await;

        let status = queue.get_status(&payload.job_id).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Interrupted);

        let active = queue
            .broker_for_test()
            .zrange_by_score(&queue.config_for_test().active_set_key(), f64::MAX)
            .await
            .unwrap();
        assert!(!active.contains(&payload.job_id.to_string()));
    }

    #[tokio::test]
    async fn backend_failure_stores_failure_with_prefixed_message() {
        let queue = test_queue();
        let config = Config::default();
        let payload = sample_payload("j1");
        queue.enqueue(payload.clone()).await.unwrap();

        let backend = ScriptedBackend::once(Err(WorkerError::BackendInvocationFailed {
            message: "connection refused".to_string(),
        }));
        run_job(&queue, backend.as_ref(), &config, payload.clone()).await;

        let status = queue.get_status(&payload.job_id).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(
            status.error.unwrap(),
            "Agent invocation failed: connection refused"
        );
    }

    #[tokio::test]
    async fn every_exit_path_clears_the_active_job_entry() {
        let queue = test_queue();
        let config = Config::default();
        let payload = sample_payload("j1");
        queue.enqueue(payload.clone()).await.unwrap();

        let backend = ScriptedBackend::once(Err(WorkerError::BackendInvocationFailed {
            message: "boom".to_string(),
        }));
        run_job(&queue, backend.as_ref(), &config, payload.clone()).await;

        let active = queue
            .broker_for_test()
            .zrange_by_score(&queue.config_for_test().active_set_key(), f64::MAX)
            .await
            .unwrap();
        assert!(!active.contains(&payload.job_id.to_string()));
    }
}
