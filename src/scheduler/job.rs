//! Jobs — ephemeral units of execution.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::cancel::{CancelHandle, CancelToken, cancel_pair};
use crate::error::Stage;
use crate::process::PidSlot;

/// What a job does. Kind-specific data lives only in its variant.
#[derive(Debug, Clone)]
pub enum JobKind {
    /// Assistant CLI invocation against a worker.
    Exec { prompt: String },
    /// Raw command line run in the worker's directory.
    RawCommand { command: String },
    /// Synthesize one voice reply.
    Synthesize { text: String },
    /// Synthesize several chunks for one logical reply.
    SynthesizeBatch { chunks: Vec<String> },
    /// Transcribe a local audio file.
    Transcribe { audio: PathBuf },
}

impl JobKind {
    /// Interactive voice replies jump ahead of queued batch work.
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Synthesize { .. } | Self::SynthesizeBatch { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::RawCommand { .. } => "raw_command",
            Self::Synthesize { .. } => "synthesize",
            Self::SynthesizeBatch { .. } => "synthesize_batch",
            Self::Transcribe { .. } => "transcribe",
        }
    }

    /// Leading slice of the request, for the task ledger.
    pub fn prompt_snippet(&self) -> String {
        let text = match self {
            Self::Exec { prompt } => prompt.as_str(),
            Self::RawCommand { command } => command.as_str(),
            Self::Synthesize { text } => text.as_str(),
            Self::SynthesizeBatch { chunks } => {
                chunks.first().map(String::as_str).unwrap_or_default()
            }
            Self::Transcribe { audio } => {
                let name = audio
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return format!("voice: {name}");
            }
        };
        crate::transport::snippet(text, 120)
    }
}

/// One scheduled unit of execution. Created at enqueue, destroyed once its
/// lane finishes with it — never persisted.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub chat_id: String,
    pub kind: JobKind,
    pub worker_id: Option<Uuid>,
    pub task_id: Uuid,
    pub deadline: Deadline,
    pub enqueued_at: DateTime<Utc>,
    pub handle: Arc<JobHandle>,
}

impl Job {
    pub fn new(
        chat_id: impl Into<String>,
        kind: JobKind,
        worker_id: Option<Uuid>,
        task_id: Uuid,
        deadline: Deadline,
    ) -> Self {
        let id = Uuid::new_v4();
        let chat_id = chat_id.into();
        Self {
            id,
            chat_id: chat_id.clone(),
            kind,
            worker_id,
            task_id,
            deadline,
            enqueued_at: Utc::now(),
            handle: Arc::new(JobHandle::new(id, task_id, chat_id)),
        }
    }
}

/// Shared, cancellation-safe view of a job. The lane keeps a clone while
/// the job runs; callers use it to cancel and to inspect timeout state.
#[derive(Debug)]
pub struct JobHandle {
    pub id: Uuid,
    pub task_id: Uuid,
    pub chat_id: String,
    cancel: CancelHandle,
    token: CancelToken,
    cancel_requested: AtomicBool,
    timed_out: AtomicBool,
    timed_out_stage: Mutex<Option<Stage>>,
    /// Pid of the attached child process while one is running.
    pub pid_slot: PidSlot,
}

impl JobHandle {
    fn new(id: Uuid, task_id: Uuid, chat_id: String) -> Self {
        let (cancel, token) = cancel_pair();
        Self {
            id,
            task_id,
            chat_id,
            cancel,
            token,
            cancel_requested: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            timed_out_stage: Mutex::new(None),
            pid_slot: PidSlot::default(),
        }
    }

    /// Request cooperative cancellation: flags the job and fires its cancel
    /// token, which aborts any in-flight RPC and kills any attached child.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn mark_timed_out(&self, stage: Stage) {
        self.timed_out.store(true, Ordering::SeqCst);
        *self.timed_out_stage.lock().expect("stage lock poisoned") = Some(stage);
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn timed_out_stage(&self) -> Option<Stage> {
        *self.timed_out_stage.lock().expect("stage lock poisoned")
    }
}

/// Absolute per-task wall-clock limit, computed once at enqueue and passed
/// down. Every stage timeout is clamped to what remains, so retries and
/// batch sub-units can never collectively exceed it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No limit at this layer.
    pub fn unlimited() -> Self {
        Self { at: None }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            at: Some(Instant::now() + budget),
        }
    }

    /// Zero or unset means "no limit", not "immediate timeout".
    pub fn within(budget: Option<Duration>) -> Self {
        match budget {
            Some(d) if !d.is_zero() => Self::after(d),
            _ => Self::unlimited(),
        }
    }

    /// Time left, `None` when unlimited, `Some(ZERO)` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Effective timeout for one stage: the smaller of the stage's own
    /// limit and the remaining deadline slice. Zero stage timeouts count
    /// as unset.
    pub fn effective_timeout(&self, stage: Option<Duration>) -> Option<Duration> {
        let stage = stage.filter(|d| !d.is_zero());
        match (stage, self.remaining()) {
            (Some(s), Some(r)) => Some(s.min(r)),
            (Some(s), None) => Some(s),
            (None, rem) => rem,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_kinds() {
        assert!(JobKind::Synthesize { text: "hi".into() }.is_interactive());
        assert!(
            JobKind::SynthesizeBatch { chunks: vec![] }.is_interactive()
        );
        assert!(!JobKind::Exec { prompt: "x".into() }.is_interactive());
        assert!(
            !JobKind::RawCommand {
                command: "ls".into()
            }
            .is_interactive()
        );
        assert!(
            !JobKind::Transcribe {
                audio: PathBuf::from("a.ogg")
            }
            .is_interactive()
        );
    }

    #[test]
    fn unlimited_deadline_never_expires() {
        let d = Deadline::unlimited();
        assert!(d.remaining().is_none());
        assert!(!d.is_expired());
        assert_eq!(d.effective_timeout(None), None);
    }

    #[test]
    fn zero_budget_means_unlimited() {
        let d = Deadline::within(Some(Duration::ZERO));
        assert!(!d.is_expired());
        assert!(d.remaining().is_none());
    }

    #[test]
    fn effective_timeout_takes_the_minimum() {
        let d = Deadline::after(Duration::from_secs(10));
        let eff = d.effective_timeout(Some(Duration::from_secs(60))).unwrap();
        assert!(eff <= Duration::from_secs(10));

        let eff = d.effective_timeout(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(eff, Duration::from_secs(2));
    }

    #[test]
    fn zero_stage_timeout_is_unset() {
        let d = Deadline::after(Duration::from_secs(10));
        let eff = d.effective_timeout(Some(Duration::ZERO)).unwrap();
        assert!(eff > Duration::from_secs(9), "zero stage limit must fall back to deadline");

        let unlimited = Deadline::unlimited();
        assert_eq!(unlimited.effective_timeout(Some(Duration::ZERO)), None);
    }

    #[test]
    fn deadline_shrinks_monotonically() {
        let d = Deadline::after(Duration::from_millis(100));
        let first = d.remaining().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let second = d.remaining().unwrap();
        assert!(second < first);
        std::thread::sleep(Duration::from_millis(100));
        assert!(d.is_expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn cancel_request_fires_the_token() {
        let job = Job::new(
            "chat-1",
            JobKind::Exec { prompt: "hi".into() },
            None,
            Uuid::new_v4(),
            Deadline::unlimited(),
        );
        assert!(!job.handle.is_cancel_requested());
        job.handle.request_cancel();
        assert!(job.handle.is_cancel_requested());
        tokio::time::timeout(Duration::from_secs(1), job.handle.token().cancelled())
            .await
            .expect("token should fire");
    }

    #[test]
    fn timeout_marking() {
        let job = Job::new(
            "chat-1",
            JobKind::Synthesize { text: "hi".into() },
            None,
            Uuid::new_v4(),
            Deadline::unlimited(),
        );
        assert!(!job.handle.timed_out());
        job.handle.mark_timed_out(Stage::Synthesize);
        assert!(job.handle.timed_out());
        assert_eq!(job.handle.timed_out_stage(), Some(Stage::Synthesize));
    }
}
