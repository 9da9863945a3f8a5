//! Translates `QueueEvent`s to the SSE frames of spec.md §4.5, and the
//! single-shot body returned by the blocking path.

use std::convert::Infallible;
use std::pin::Pin;

use async_stream::stream;
use axum::response::sse::Event;
use futures::{Stream, StreamExt};

use crate::queue::{EnqueuePayload, JobId, QueueEvent, Usage};

fn data_event(value: &serde_json::Value) -> Result<Event, Infallible> {
    Ok(Event::default().data(value.to_string()))
}

fn done_event() -> Result<Event, Infallible> {
    Ok(Event::default().data("[DONE]"))
}

fn heartbeat_comment(status: &str) -> Result<Event, Infallible> {
    Ok(Event::default().comment(format!("heartbeat {status}")))
}

fn status_frame(job_id: &JobId, stage: &str) -> serde_json::Value {
    serde_json::json!({
        "id": job_id.as_str(),
        "choices": [{ "delta": {}, "finish_reason": null }],
        "agent_status": stage,
    })
}

fn role_frame(job_id: &JobId) -> serde_json::Value {
    serde_json::json!({
        "id": job_id.as_str(),
        "choices": [{ "delta": { "role": "assistant" } }],
    })
}

fn chunk_frame(job_id: &JobId, content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": job_id.as_str(),
        "choices": [{ "delta": { "content": content } }],
    })
}

fn terminal_frame(
    job_id: &JobId,
    content: Option<&str>,
    finish_reason: &str,
    agent_status: &str,
    usage: Option<&Usage>,
    message_metadata: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut value = serde_json::json!({
        "id": job_id.as_str(),
        "choices": [{
            "delta": { "content": content },
            "finish_reason": finish_reason,
        }],
        "agent_status": agent_status,
    });
    if let Some(usage) = usage {
        value["usage"] = serde_json::to_value(usage).unwrap_or(serde_json::Value::Null);
    }
    if let Some(metadata) = message_metadata {
        value["message_metadata"] = metadata.clone();
    }
    value
}

fn failed_frame(job_id: &JobId, conversation_id: &str, error: &str) -> serde_json::Value {
    serde_json::json!({
        "error": { "message": error, "type": "agent_failure" },
        "conversation_id": conversation_id,
        "job_id": job_id.as_str(),
    })
}

/// Builds the single-shot response body for the blocking path
/// (`wait_for_completion`).
pub fn completion_body(
    job_id: &JobId,
    content: Option<String>,
    metadata: Option<serde_json::Value>,
    usage: Option<Usage>,
    finish_reason: &str,
) -> serde_json::Value {
    terminal_frame(
        job_id,
        content.as_deref(),
        finish_reason,
        if finish_reason == "stop" { "completed" } else { "interrupted" },
        usage.as_ref(),
        metadata.as_ref(),
    )
}

/// Translates a job's event stream into the SSE frame sequence of
/// spec.md §4.5, tracking whether the opening `delta: { role: "assistant" }`
/// frame has already been emitted for this job's first chunk.
pub fn translate(
    payload: EnqueuePayload,
    mut events: Pin<Box<dyn Stream<Item = QueueEvent> + Send>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        let mut role_frame_sent = false;

        while let Some(event) = events.next().await {
            match event {
                QueueEvent::Status { job_id, status, .. } => {
                    yield data_event(&status_frame(&job_id, status.as_str()));
                }
                QueueEvent::Heartbeat { status, .. } => {
                    yield heartbeat_comment(status.as_str());
                }
                QueueEvent::Chunk { job_id, content } => {
                    if !role_frame_sent {
                        yield data_event(&role_frame(&job_id));
                        role_frame_sent = true;
                    }
                    yield data_event(&chunk_frame(&job_id, &content));
                }
                QueueEvent::Completed { job_id, content, metadata, usage } => {
                    yield data_event(&terminal_frame(
                        &job_id,
                        content.as_deref(),
                        "stop",
                        "completed",
                        usage.as_ref(),
                        metadata.as_ref(),
                    ));
                    yield done_event();
                    return;
                }
                QueueEvent::Interrupt { job_id, content, metadata } => {
                    yield data_event(&terminal_frame(
                        &job_id,
                        Some(&content),
                        "stop",
                        "interrupted",
                        None,
                        metadata.as_ref(),
                    ));
                    yield done_event();
                    return;
                }
                QueueEvent::Failed { job_id, error } => {
                    yield data_event(&failed_frame(&job_id, &payload.conversation_id, &error));
                    yield done_event();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobState;

    fn sample_payload() -> EnqueuePayload {
        EnqueuePayload {
            job_id: JobId::from("j1"),
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

    #[tokio::test]
    async fn first_chunk_emits_a_role_frame_before_content() {
        let events: Vec<QueueEvent> = vec![
            QueueEvent::Chunk { job_id: JobId::from("j1"), content: "hel".to_string() },
            QueueEvent::Chunk { job_id: JobId::from("j1"), content: "lo".to_string() },
            QueueEvent::Completed {
                job_id: JobId::from("j1"),
                content: Some("hello".to_string()),
                metadata: None,
                usage: None,
            },
        ];
        let source: Pin<Box<dyn Stream<Item = QueueEvent> + Send>> =
            Box::pin(futures::stream::iter(events));

        let mut frames = Box::pin(translate(sample_payload(), source));
        let mut collected = Vec::new();
        while let Some(frame) = frames.next().await {
            collected.push(frame.unwrap());
        }

        // role frame, then 2 content chunks, then terminal + [DONE].
        assert_eq!(collected.len(), 5);
    }

    #[tokio::test]
    async fn failed_event_is_translated_and_terminates_the_stream() {
        let events: Vec<QueueEvent> = vec![QueueEvent::Failed {
            job_id: JobId::from("j1"),
            error: "boom".to_string(),
        }];
        let source: Pin<Box<dyn Stream<Item = QueueEvent> + Send>> =
            Box::pin(futures::stream::iter(events));

        let mut frames = Box::pin(translate(sample_payload(), source));
        let mut count = 0;
        while frames.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2); // failed frame + [DONE]
    }

    #[test]
    fn completion_body_maps_interrupt_status_for_non_stop_finish_reason() {
        let body = completion_body(&JobId::from("j1"), Some("q?".to_string()), None, None, "interrupted");
        assert_eq!(body["agent_status"], "interrupted");
    }

    #[test]
    fn status_frame_carries_job_id_and_stage() {
        let frame = status_frame(&JobId::from("j1"), JobState::Running.as_str());
        assert_eq!(frame["id"], "j1");
        assert_eq!(frame["agent_status"], "running");
    }
}
