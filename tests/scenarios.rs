//! End-to-end scenarios S1-S6, run against `InMemoryBroker` and a
//! scripted `BackendClient` — no live Redis or backend required.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use taskbridge::broker::InMemoryBroker;
use taskbridge::config::Config;
use taskbridge::queue::{EnqueuePayload, JobId, JobState, Queue, QueueEvent};
use taskbridge::worker::{BackendClient, BackendReply, BackendRequest, Worker};
use tokio_util::sync::CancellationToken;

fn test_queue() -> Queue {
    Queue::new(Arc::new(InMemoryBroker::new()), Arc::new(Config::default()))
}

fn payload(job_id: &str, text: &str) -> EnqueuePayload {
    EnqueuePayload {
        job_id: JobId::from(job_id),
        model: "agent-a".to_string(),
        conversation_id: "c1".to_string(),
        user_id: "u1".to_string(),
        user_role: None,
        text: text.to_string(),
        raw_user_text: Some(text.to_string()),
        attachments: None,
        metadata: None,
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
                "interrupt_payload": { "interrupt_id": "i1", "question": question, "content": "..." }
            }
        }
    }))
    .unwrap()
}

/// A `BackendClient` whose reply (or failure) is scripted per call,
/// keyed by call order. Counts invocations so S3's "at-most-one
/// consumption" property can be asserted.
struct ScriptedBackend {
    replies: Mutex<Vec<Result<BackendReply, taskbridge::error::WorkerError>>>,
    invocation_count: AtomicUsize,
}

impl ScriptedBackend {
    fn single(reply: Result<BackendReply, taskbridge::error::WorkerError>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(vec![reply]),
            invocation_count: AtomicUsize::new(0),
        })
    }

    fn counting_success(text: &str, n: usize) -> Arc<Self> {
        let reply = active_reply(text);
        Arc::new(Self {
            replies: Mutex::new((0..n).map(|_| Ok(reply.clone())).collect()),
            invocation_count: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    async fn invoke(&self, _req: BackendRequest) -> Result<BackendReply, taskbridge::error::WorkerError> {
        self.invocation_count.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop()
            .expect("scripted backend called more times than scripted")
    }
}

async fn run_worker_to_completion(queue: Queue, backend: Arc<dyn BackendClient>, config: Arc<Config>) {
    let shutdown = CancellationToken::new();
    let handles = Worker::new(queue.clone(), backend, config, shutdown.clone()).spawn_all();
    // Give the single-shot loop time to pop and fully process the job,
    // then ask it to stop before the next blocking pop.
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
}

/// S1 — happy path, blocking.
#[tokio::test]
async fn s1_happy_path_blocking() {
    let queue = test_queue();
    let config = Arc::new(Config::default());
    let job = payload("j1", "hi");
    queue.enqueue(job.clone()).await.unwrap();

    let backend = ScriptedBackend::single(Ok(active_reply("hello world")));
    run_worker_to_completion(queue.clone(), backend, config).await;

    let event = queue
        .wait_for_completion(&job.job_id, Duration::from_secs(5))
        .await
        .unwrap();
    match event {
        QueueEvent::Completed { content, .. } => assert_eq!(content, Some("hello world".to_string())),
        other => panic!("expected Completed, got {other:?}"),
    }
}

/// S2 — chunking: a 1,450 char reply at `chunk_char_limit=600` yields
/// exactly 3 chunks of lengths 600, 600, 250, all before `completed`.
#[tokio::test]
async fn s2_long_reply_is_chunked_in_order() {
    let queue = test_queue();
    let mut cfg = Config::default();
    cfg.chunk_char_limit = 600;
    let config = Arc::new(cfg);

    let job = payload("j2", "hi");
    queue.enqueue(job.clone()).await.unwrap();
    let mut events = queue.iter_events(job.job_id.clone(), false).await.unwrap();

    let long_text: String = "a".repeat(1450);
    let backend = ScriptedBackend::single(Ok(active_reply(&long_text)));
    run_worker_to_completion(queue.clone(), backend, config).await;

    let mut chunk_lens = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(200), events.next()).await {
            Ok(Some(QueueEvent::Chunk { content, .. })) => chunk_lens.push(content.chars().count()),
            Ok(Some(event)) if event.is_terminal() => break,
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert_eq!(chunk_lens, vec![600, 600, 250]);
}

/// S3 — interrupt: no chunk events, terminal `interrupt` carries the
/// clarifying question, status hash terminal is `interrupted`.
#[tokio::test]
async fn s3_interrupt_produces_no_chunks_and_terminal_interrupt() {
    let queue = test_queue();
    let config = Arc::new(Config::default());
    let job = payload("j3", "hi");
    queue.enqueue(job.clone()).await.unwrap();
    let mut events = queue.iter_events(job.job_id.clone(), false).await.unwrap();

    let backend = ScriptedBackend::single(Ok(interrupted_reply("Which city?")));
    run_worker_to_completion(queue.clone(), backend, config).await;

    let mut saw_chunk = false;
    let mut terminal = None;
    loop {
        match tokio::time::timeout(Duration::from_millis(200), events.next()).await {
            Ok(Some(QueueEvent::Chunk { .. })) => saw_chunk = true,
            Ok(Some(event)) if event.is_terminal() => {
                terminal = Some(event);
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(!saw_chunk, "interrupt path must not emit chunk events");
    match terminal.expect("a terminal event") {
        QueueEvent::Interrupt { content, .. } => assert_eq!(content, "Which city?"),
        other => panic!("expected Interrupt, got {other:?}"),
    }

    let status = queue.get_status(&job.job_id).await.unwrap().unwrap();
    assert_eq!(status.status, JobState::Interrupted);
}

/// S4 — backend failure: terminal `failed` with the prefixed message, no
/// `chunk`/`completed` events, status hash terminal is `failed`.
#[tokio::test]
async fn s4_backend_failure_produces_prefixed_error() {
    let queue = test_queue();
    let config = Arc::new(Config::default());
    let job = payload("j4", "hi");
    queue.enqueue(job.clone()).await.unwrap();

    let backend = ScriptedBackend::single(Err(taskbridge::error::WorkerError::BackendInvocationFailed {
        message: "boom".to_string(),
    }));
    run_worker_to_completion(queue.clone(), backend, config).await;

    let status = queue.get_status(&job.job_id).await.unwrap().unwrap();
    assert_eq!(status.status, JobState::Failed);
    assert_eq!(status.error.unwrap(), "Agent invocation failed: boom");
}

/// S5 — watchdog stale: a job stuck in `running` with a backdated
/// heartbeat is failed by the watchdog within one sweep interval, and
/// removed from the active set.
#[tokio::test]
async fn s5_watchdog_fails_jobs_with_stale_heartbeat() {
    let queue = test_queue();
    let job_id = JobId::from("j5");
    queue.enqueue(payload("j5", "hi")).await.unwrap();
    queue
        .mark_status(&job_id, JobState::Running, "c1", "agent-a", "u1", None, None, None)
        .await
        .unwrap();
    queue.register_active_job(&job_id).await.unwrap();

    let past = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
        - 10_000.0;
    queue
        .broker_for_test()
        .zadd(&queue.config_for_test().active_set_key(), past, job_id.as_str())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handle = taskbridge::watchdog::spawn(queue.clone(), Duration::from_millis(10), shutdown.clone());
    tokio::time::sleep(Duration::from_millis(60)).await;
    shutdown.cancel();
    handle.await.unwrap();

    let status = queue.get_status(&job_id).await.unwrap().unwrap();
    assert_eq!(status.status, JobState::Failed);
    assert_eq!(status.error.as_deref(), Some("worker heartbeat stale"));

    let active = queue
        .broker_for_test()
        .zrange_by_score(&queue.config_for_test().active_set_key(), f64::MAX)
        .await
        .unwrap();
    assert!(!active.contains(&job_id.to_string()));
}

/// S6 — subscribe-after-terminal: a job fully completes before any
/// subscriber attaches; a later `iter_events(include_snapshot=true)`
/// yields exactly one synthesized `completed` and closes.
#[tokio::test]
async fn s6_subscribe_after_terminal_yields_one_synthesized_completed() {
    let queue = test_queue();
    let job_id = JobId::from("j6");
    queue.enqueue(payload("j6", "hi")).await.unwrap();
    queue
        .store_result(&job_id, "c1", "agent-a", "u1", serde_json::json!({"content": "done"}))
        .await
        .unwrap();

    let mut events = queue.iter_events(job_id.clone(), true).await.unwrap();
    let first = events.next().await.unwrap();
    assert!(matches!(first, QueueEvent::Status { .. }));
    let second = events.next().await.unwrap();
    assert!(second.is_terminal());
    assert!(events.next().await.is_none());

    let event = queue
        .wait_for_completion(&job_id, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(event.is_terminal());
}

/// Property 3: concurrent workers competing for the same queue — every
/// enqueued payload is dequeued by exactly one worker.
#[tokio::test]
async fn concurrent_workers_each_job_consumed_exactly_once() {
    let queue = test_queue();
    let mut cfg = Config::default();
    cfg.worker_count = 4;
    let config = Arc::new(cfg);

    const N: usize = 20;
    for i in 0..N {
        queue.enqueue(payload(&format!("job-{i}"), "hi")).await.unwrap();
    }

    let backend = ScriptedBackend::counting_success("ok", N);
    let shutdown = CancellationToken::new();
    let handles = Worker::new(queue.clone(), backend.clone(), config, shutdown.clone()).spawn_all();

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    assert_eq!(backend.invocation_count.load(Ordering::SeqCst), N);
    for i in 0..N {
        let status = queue
            .get_status(&JobId::from(format!("job-{i}")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, JobState::Completed);
    }
}
