//! The backend contract (spec.md §6): the message-create call a worker
//! makes to the synchronous agent-execution backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::WorkerError;

/// What the worker sends to the backend for one job.
#[derive(Debug, Clone, Serialize)]
pub struct BackendRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_user_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip)]
    pub conversation_id: String,
    #[serde(skip)]
    pub user_id: String,
    #[serde(skip)]
    pub user_role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendReply {
    #[serde(default)]
    pub conversation: serde_json::Value,
    #[serde(default)]
    pub user_message: serde_json::Value,
    pub agent_message: AgentMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentMessage {
    pub raw_text: String,
    #[serde(default)]
    pub content: serde_json::Value,
    pub metadata: AgentMessageMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentMessageMetadata {
    pub agent_status: AgentStatus,
    #[serde(default)]
    pub attachments: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub interrupt_payload: Option<InterruptPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Interrupted,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterruptPayload {
    pub interrupt_id: String,
    pub question: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub artifact_type: Option<String>,
}

/// The message-create call, abstracted so the worker loop can be tested
/// against a scripted double instead of a live backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn invoke(&self, req: BackendRequest) -> Result<BackendReply, WorkerError>;
}

/// Reference `BackendClient`: a `reqwest::Client` POSTing JSON to the
/// backend's message-create endpoint, modeled on the base crate's
/// `NearAiChatProvider::send_request`.
pub struct HttpBackendClient {
    client: Client,
    endpoint: String,
    soft_timeout: Duration,
}

impl HttpBackendClient {
    pub fn new(base_url: &str, soft_timeout: Duration) -> Self {
        let client = Client::builder()
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            endpoint: format!("{}/messages", base_url.trim_end_matches('/')),
            soft_timeout,
        }
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn invoke(&self, req: BackendRequest) -> Result<BackendReply, WorkerError> {
        debug!(endpoint = %self.endpoint, conversation_id = %req.conversation_id, "invoking backend");

        let request = self
            .client
            .post(&self.endpoint)
            .header("X-Conversation-Id", req.conversation_id.clone())
            .header("X-User-Id", req.user_id.clone());
        let request = match &req.user_role {
            Some(role) => request.header("X-User-Role", role.clone()),
            None => request,
        };

        let started = tokio::time::Instant::now();
        let send = request.json(&req).send();
        tokio::pin!(send);

        let response = loop {
            tokio::select! {
                result = &mut send => break result,
                _ = tokio::time::sleep(self.soft_timeout) => {
                    warn!(
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        "backend call exceeded soft timeout, still waiting"
                    );
                    // Advisory only (spec.md §4.4 step 5): keep waiting on the
                    // same future, the backend owns its own hard timeout.
                    continue;
                }
            }
        }
        .map_err(|e| {
            error!(error = %e, "backend request failed");
            WorkerError::BackendInvocationFailed {
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        let body_text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(WorkerError::BackendInvocationFailed {
                message: format!("HTTP {status}: {body_text}"),
            });
        }

        serde_json::from_str(&body_text).map_err(|e| WorkerError::ContractViolation {
            reason: format!("malformed backend reply: {e}. raw: {body_text}"),
        })
    }
}
