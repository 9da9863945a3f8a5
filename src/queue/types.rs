//! Data model of spec.md §3: `EnqueuePayload`, `JobStatus`, `QueueEvent`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A process-unique opaque job identifier.
///
/// Wraps a plain `String` rather than a `uuid::Uuid` — spec.md leaves the
/// identifier's shape unspecified ("process-unique opaque string"), so
/// callers may populate it with a UUID, a ULID, or any unique token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        JobId(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

/// The job request, immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueuePayload {
    pub job_id: JobId,
    pub model: String,
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_user_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The job's lifecycle state. Transitions only ever move forward through
/// this list (spec.md §3 invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Streaming,
    Completed,
    Failed,
    Interrupted,
}

impl JobState {
    /// Terminal states: `completed`, `failed`, `interrupted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Interrupted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Streaming => "streaming",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Interrupted => "interrupted",
        }
    }

    pub fn parse(value: &str) -> Option<JobState> {
        Some(match value {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "streaming" => JobState::Streaming,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "interrupted" => JobState::Interrupted,
            _ => return None,
        })
    }
}

/// The mutable record keyed by `job_id`, stored as a broker hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: JobState,
    pub created_at: f64,
    pub updated_at: f64,
    pub last_heartbeat: f64,
    pub conversation_id: String,
    pub model: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl JobStatus {
    /// Flatten into broker hash fields (spec.md §4.2: every status write
    /// is a single `hset_many` call).
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("status".to_string(), self.status.as_str().to_string()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("updated_at".to_string(), self.updated_at.to_string()),
            ("last_heartbeat".to_string(), self.last_heartbeat.to_string()),
            ("conversation_id".to_string(), self.conversation_id.clone()),
            ("model".to_string(), self.model.clone()),
            ("user_id".to_string(), self.user_id.clone()),
        ];
        if let Some(result) = &self.result {
            fields.push(("result".to_string(), result.to_string()));
        }
        if let Some(error) = &self.error {
            fields.push(("error".to_string(), error.clone()));
        }
        if let Some(metadata) = &self.metadata {
            fields.push(("metadata".to_string(), metadata.to_string()));
        }
        fields
    }

    /// Reconstruct from broker hash fields. `None` if the hash is empty
    /// (absent key), matching spec.md §4.2's `get_status` contract.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<JobStatus> {
        if fields.is_empty() {
            return None;
        }
        let status = JobState::parse(fields.get("status")?)?;
        Some(JobStatus {
            status,
            created_at: fields.get("created_at")?.parse().ok()?,
            updated_at: fields.get("updated_at")?.parse().ok()?,
            last_heartbeat: fields.get("last_heartbeat")?.parse().ok()?,
            conversation_id: fields.get("conversation_id").cloned().unwrap_or_default(),
            model: fields.get("model").cloned().unwrap_or_default(),
            user_id: fields.get("user_id").cloned().unwrap_or_default(),
            result: fields.get("result").and_then(|v| serde_json::from_str(v).ok()),
            error: fields.get("error").cloned(),
            metadata: fields.get("metadata").and_then(|v| serde_json::from_str(v).ok()),
        })
    }
}

/// Token usage, mirroring the base crate's `ProxyCompletionResponse`
/// token-count fields, reported on `completed` events when the backend
/// supplies them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

/// The pub/sub message, a closed tagged variant over the six event
/// types (REDESIGN FLAG: dynamic duck-typed payloads → closed enum).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Status {
        job_id: JobId,
        status: JobState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Chunk {
        job_id: JobId,
        content: String,
    },
    Completed {
        job_id: JobId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Failed {
        job_id: JobId,
        error: String,
    },
    Heartbeat {
        job_id: JobId,
        status: JobState,
    },
    Interrupt {
        job_id: JobId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            QueueEvent::Status { job_id, .. }
            | QueueEvent::Chunk { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Heartbeat { job_id, .. }
            | QueueEvent::Interrupt { job_id, .. } => job_id,
        }
    }

    /// One of `completed | failed | interrupt` — exactly one per job,
    /// per spec.md §3 invariant 4.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueEvent::Completed { .. } | QueueEvent::Failed { .. } | QueueEvent::Interrupt { .. }
        )
    }
}
