//! Error types for ai-dispatch.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Keepalive error: {0}")]
    Keepalive(#[from] KeepaliveError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Worker registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker limit reached ({max}); retire a worker first")]
    CapacityExceeded { max: usize },

    #[error("Working directory does not exist: {path}")]
    WorkdirNotFound { path: String },

    #[error("No worker matches '{token}'")]
    NotFound { token: String },

    #[error("The general worker cannot be retired")]
    GeneralWorkerProtected,
}

/// Lane/queue admission errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job queue is full ({cap} queued jobs)")]
    QueueFull { cap: usize },

    #[error("Lane {lane} is closed")]
    LaneClosed { lane: String },

    #[error("Job {id} not found")]
    NotFound { id: Uuid },
}

/// Execution stage a job failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Exec,
    Transcribe,
    Synthesize,
    Encode,
    Upload,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Exec => "exec",
            Self::Transcribe => "transcribe",
            Self::Synthesize => "synthesize",
            Self::Encode => "encode",
            Self::Upload => "upload",
        };
        write!(f, "{s}")
    }
}

/// Job execution errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Stage {stage} timed out after {timeout:?}")]
    Timeout { stage: Stage, timeout: Duration },

    #[error("Hard deadline exceeded in stage {stage}")]
    DeadlineExceeded { stage: Stage },

    #[error("Job was canceled")]
    Canceled,

    #[error("Process failed to run: {0}")]
    Process(String),

    #[error("Command failed with exit code {exit_code}: {detail}")]
    UpstreamFailure { exit_code: i32, detail: String },
}

impl JobError {
    /// Whether this failure may be retried within the stage retry budget.
    ///
    /// `Canceled` and `DeadlineExceeded` are always terminal for the
    /// current job. `UpstreamFailure` is a deterministic rejection of the
    /// input, not a transient fault.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Process(_))
    }
}

/// Task ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },
}

/// Keepalive process errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeepaliveError {
    #[error("Keepalive backend is busy with another request")]
    Busy,

    #[error("Keepalive backend is not ready")]
    NotReady,

    #[error("Keepalive backend did not complete its ready handshake within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    #[error("Keepalive backend hit a fatal error: {pattern}")]
    BackendFatal { pattern: String },

    #[error("Keepalive request failed: {0}")]
    RequestFailed(String),

    #[error("Keepalive protocol error: {0}")]
    Protocol(String),

    #[error("Keepalive I/O error: {0}")]
    Io(String),

    #[error("Keepalive backend exited: {0}")]
    Exited(String),

    #[error("Keepalive request was canceled")]
    Canceled,

    #[error("Keepalive request timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl KeepaliveError {
    /// Failures that make falling back to the one-shot path worthwhile.
    pub fn is_fallback_worthy(&self) -> bool {
        matches!(
            self,
            Self::Busy
                | Self::NotReady
                | Self::StartupTimeout { .. }
                | Self::Exited(_)
                | Self::Io(_)
        )
    }
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Transport delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to deliver to chat {chat_id}: {reason}")]
    SendFailed { chat_id: String, reason: String },
}

/// Result type alias for the dispatcher.
pub type Result<T> = std::result::Result<T, Error>;
