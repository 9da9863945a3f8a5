//! The minimal OpenAI-compatible request shape spec.md §4.5 calls for:
//! only enough to build an `EnqueuePayload`, not full request fidelity.

use serde::Deserialize;
use uuid::Uuid;

use crate::queue::EnqueuePayload;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_role: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub attachments: Option<Vec<serde_json::Value>>,
}

impl ChatCompletionRequest {
    /// Builds the job payload from the last user message. Returns an
    /// error message (surfaced as `400 invalid_request`) if no message is
    /// present to derive `text` from.
    pub fn into_enqueue_payload(&self) -> Result<EnqueuePayload, String> {
        let text = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .or_else(|| self.messages.last())
            .map(|m| m.content.clone())
            .ok_or_else(|| "messages must contain at least one entry".to_string())?;

        Ok(EnqueuePayload {
            job_id: super::new_job_id(),
            model: self.model.clone(),
            conversation_id: self
                .conversation_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: self.user_id.clone().unwrap_or_else(|| "anonymous".to_string()),
            user_role: self.user_role.clone(),
            text: text.clone(),
            raw_user_text: Some(text),
            attachments: self.attachments.clone(),
            metadata: self.metadata.clone(),
        })
    }
}
