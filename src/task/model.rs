//! Task ledger entries and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task. Moves only forward:
/// `Queued → Running → {Completed, Failed, Canceled}`, with
/// `Queued → Canceled` when a job is dropped before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Chat,
    Voice,
    Image,
    Command,
}

/// One durable ledger entry per logical user request. A task may fan out
/// into several jobs across several lanes; jobs are ephemeral, the task is
/// what survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub status: TaskStatus,
    /// Chat that owns this task (retention is counted per owner).
    pub chat_id: String,
    pub worker_id: Option<Uuid>,
    pub source: TaskSource,
    /// Leading slice of the prompt, for listings.
    pub prompt_snippet: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    /// CLI session this task ran under, if any.
    pub session_id: Option<String>,
    /// Leading slice of the produced output.
    pub output_snippet: Option<String>,
    /// Platform message ids produced for this task.
    pub output_message_ids: Vec<String>,
    /// Message that triggered the request.
    pub origin_message_id: Option<String>,
    /// Message the result should reply to.
    pub reply_to_message_id: Option<String>,
    /// Set when one logical reply was split into several tasks.
    pub split_group_id: Option<Uuid>,
}

/// Fields supplied by the caller at enqueue time.
#[derive(Debug, Clone)]
pub struct TaskSeed {
    pub chat_id: String,
    pub worker_id: Option<Uuid>,
    pub source: TaskSource,
    pub prompt_snippet: String,
    pub session_id: Option<String>,
    pub origin_message_id: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub split_group_id: Option<Uuid>,
}

impl Task {
    pub fn new(seed: TaskSeed) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Queued,
            chat_id: seed.chat_id,
            worker_id: seed.worker_id,
            source: seed.source,
            prompt_snippet: seed.prompt_snippet,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            success: None,
            session_id: seed.session_id,
            output_snippet: None,
            output_message_ids: Vec::new(),
            origin_message_id: seed.origin_message_id,
            reply_to_message_id: seed.reply_to_message_id,
            split_group_id: seed.split_group_id,
        }
    }
}

/// Partial update applied through the ledger. Unset fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub success: Option<bool>,
    pub session_id: Option<String>,
    pub output_snippet: Option<String>,
    /// Appended to the task's message id list.
    pub output_message_ids: Vec<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn with_output_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.output_snippet = Some(snippet.into());
        self
    }

    pub fn with_message_ids(mut self, ids: Vec<String>) -> Self {
        self.output_message_ids = ids;
        self
    }
}
