//! Error taxonomy for the queue/worker/proxy pipeline.
//!
//! One `thiserror` enum per subsystem, matching the base crate's
//! convention (`SandboxError`, `LlmError`, `DatabaseError`): typed errors
//! inside library code, `anyhow` reserved for the CLI binary's `main`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors from the broker client (redis round-trips).
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Transient I/O failure; callers retry at their own layer (spec's
    /// `broker_transient` error kind).
    #[error("broker I/O error: {0}")]
    Transient(String),

    #[error("failed to encode/decode broker payload: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors from the `Queue` API.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("unknown job: {job_id}")]
    UnknownJob { job_id: String },

    #[error("terminal wait for job {job_id} timed out")]
    TerminalWaitTimeout { job_id: String },

    #[error("failed to encode/decode queue payload: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors surfaced by the worker runtime.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Agent invocation failed: {message}")]
    BackendInvocationFailed { message: String },

    /// Malformed backend reply; treated as `BackendInvocationFailed` by
    /// the caller per spec.md §7 (`contract_violation`).
    #[error("backend contract violation: {reason}")]
    ContractViolation { reason: String },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl WorkerError {
    /// The error string stored on the job's terminal status, per
    /// spec.md §4.4 step 7: `"Agent invocation failed: " + message`.
    pub fn terminal_message(&self) -> String {
        match self {
            WorkerError::BackendInvocationFailed { message } => {
                format!("Agent invocation failed: {message}")
            }
            WorkerError::ContractViolation { reason } => {
                format!("Agent invocation failed: {reason}")
            }
            WorkerError::Queue(e) => format!("Agent invocation failed: {e}"),
        }
    }
}

/// Errors surfaced to the HTTP-facing proxy.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("backend job failed: {reason}")]
    BadGateway {
        reason: String,
        job_id: String,
        conversation_id: String,
    },

    #[error("job not ready yet")]
    ServiceUnavailable { job_id: String, conversation_id: String },

    #[error("timed out waiting for job completion")]
    Timeout { job_id: String, conversation_id: String },
}

#[derive(Debug, Serialize)]
struct ProxyErrorBody {
    error: ProxyErrorDetail,
    conversation_id: Option<String>,
    job_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProxyErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Maps terminal outcomes / wait failures to user-visible status codes,
/// per spec.md §7: success for completed/interrupt, 502 for failed, 503
/// with `Retry-After: 1` for initialization races, 504 for wait timeout.
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, kind, message, conversation_id, job_id) = match &self {
            ProxyError::Queue(QueueError::UnknownJob { job_id }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unknown_job",
                format!("job {job_id} not found yet"),
                None,
                Some(job_id.clone()),
            ),
            ProxyError::Queue(QueueError::TerminalWaitTimeout { job_id }) => (
                StatusCode::GATEWAY_TIMEOUT,
                "terminal_wait_timeout",
                self.to_string(),
                None,
                Some(job_id.clone()),
            ),
            ProxyError::Queue(e) => (StatusCode::BAD_GATEWAY, "queue_error", e.to_string(), None, None),
            ProxyError::BadGateway { reason, job_id, conversation_id } => (
                StatusCode::BAD_GATEWAY,
                "backend_invocation_failed",
                reason.clone(),
                Some(conversation_id.clone()),
                Some(job_id.clone()),
            ),
            ProxyError::ServiceUnavailable { job_id, conversation_id } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                self.to_string(),
                Some(conversation_id.clone()),
                Some(job_id.clone()),
            ),
            ProxyError::Timeout { job_id, conversation_id } => (
                StatusCode::GATEWAY_TIMEOUT,
                "terminal_wait_timeout",
                self.to_string(),
                Some(conversation_id.clone()),
                Some(job_id.clone()),
            ),
        };

        let body = ProxyErrorBody {
            error: ProxyErrorDetail { message, kind },
            conversation_id,
            job_id,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert("Retry-After", "1".parse().expect("valid header value"));
        }
        response
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_error_terminal_message_matches_spec_prefix() {
        let err = WorkerError::BackendInvocationFailed {
            message: "boom".to_string(),
        };
        assert_eq!(err.terminal_message(), "Agent invocation failed: boom");
    }
}
