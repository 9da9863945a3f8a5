//! OpenAI-compatible HTTP facade over the job queue (spec.md §4.5).
//!
//! Only as much of the OpenAI chat-completions surface is implemented as
//! is needed to build an `EnqueuePayload` and translate `QueueEvent`s —
//! full request/response fidelity (multiple choices, logprobs, etc.) is
//! out of scope per spec.md §1.

mod sse;
mod types;

pub use types::{ChatCompletionRequest, ChatMessage};

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ProxyError;
use crate::queue::{EnqueuePayload, JobId, Queue, QueueEvent};

/// Shared state for the proxy's axum handlers.
#[derive(Clone)]
pub struct ProxyState {
    pub queue: Queue,
    pub config: Arc<Config>,
}

/// Builds the axum router exposing the two entry paths of spec.md §4.5.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn chat_completions(
    State(state): State<ProxyState>,
    Json(request): Json<ChatCompletionRequest>,
) -> axum::response::Response {
    let payload = match request.into_enqueue_payload() {
        Ok(payload) => payload,
        Err(reason) => {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": { "message": reason, "type": "invalid_request" } })),
            )
                .into_response();
        }
    };

    if let Err(e) = state.queue.enqueue(payload.clone()).await {
        return ProxyError::from(e).into_response();
    }

    if request.stream.unwrap_or(false) {
        stream_job(state, payload).await
    } else {
        match wait_for_job(&state.queue, &payload, state.config.completion_wait_timeout()).await {
            Ok(body) => (axum::http::StatusCode::OK, Json(body)).into_response(),
            Err(e) => e.into_response(),
        }
    }
}

async fn stream_job(state: ProxyState, payload: EnqueuePayload) -> axum::response::Response {
    let events = match state.queue.iter_events(payload.job_id.clone(), true).await {
        Ok(events) => events,
        Err(e) => return ProxyError::from(e).into_response(),
    };

    let frames = sse::translate(payload, events);
    Sse::new(frames)
        .keep_alive(
            axum::response::sse::KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text(""),
        )
        .into_response()
}

/// Blocking path: waits for a terminal event and synthesizes a single
/// response body, per spec.md §4.5 and the status-code policy of §7.
async fn wait_for_job(
    queue: &Queue,
    payload: &EnqueuePayload,
    timeout: Duration,
) -> Result<serde_json::Value, ProxyError> {
    let event = queue.wait_for_completion(&payload.job_id, timeout).await?;
    match event {
        QueueEvent::Completed { content, metadata, usage, .. } => {
            Ok(sse::completion_body(&payload.job_id, content, metadata, usage, "stop"))
        }
        QueueEvent::Interrupt { content, metadata, .. } => Ok(sse::completion_body(
            &payload.job_id,
            Some(content),
            metadata,
            None,
            "interrupted",
        )),
        QueueEvent::Failed { error, .. } => Err(ProxyError::BadGateway {
            reason: error,
            job_id: payload.job_id.to_string(),
            conversation_id: payload.conversation_id.clone(),
        }),
        _ => Err(ProxyError::ServiceUnavailable {
            job_id: payload.job_id.to_string(),
            conversation_id: payload.conversation_id.clone(),
        }),
    }
}

/// Synthesizes the `EnqueuePayload.job_id` — a UUID v4 per request,
/// matching the base crate's convention of minting a fresh job
/// identifier at the HTTP boundary rather than trusting a client-supplied
/// one.
pub fn new_job_id() -> JobId {
    JobId::from(Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    fn test_state() -> ProxyState {
        ProxyState {
            queue: Queue::new(Arc::new(InMemoryBroker::new()), Arc::new(Config::default())),
            config: Arc::new(Config::default()),
        }
    }

    #[tokio::test]
    async fn wait_for_job_times_out_as_service_unavailable() {
        let state = test_state();
        let payload = EnqueuePayload {
            job_id: JobId::from("j1"),
            model: "agent-a".to_string(),
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            user_role: None,
            text: "hi".to_string(),
            raw_user_text: None,
            attachments: None,
            metadata: None,
        };
        state.queue.enqueue(payload.clone()).await.unwrap();

        let result = wait_for_job(&state.queue, &payload, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ProxyError::Queue(crate::error::QueueError::TerminalWaitTimeout { .. }))));
    }

    #[tokio::test]
    async fn wait_for_job_maps_failed_event_to_bad_gateway() {
        let state = test_state();
        let payload = EnqueuePayload {
            job_id: JobId::from("j1"),
            model: "agent-a".to_string(),
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            user_role: None,
            text: "hi".to_string(),
            raw_user_text: None,
            attachments: None,
            metadata: None,
        };
        state.queue.enqueue(payload.clone()).await.unwrap();
        state
            .queue
            .store_failure(&payload.job_id, "c1", "agent-a", "u1", "boom".to_string())
            .await
            .unwrap();

        let result = wait_for_job(&state.queue, &payload, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProxyError::BadGateway { .. })));
    }
}
