//! Job runner — executes one job to completion against its lane's worker.
//!
//! Dispatches by job kind: one-shot child processes for CLI and raw
//! commands, keepalive RPC (with optional one-shot fallback) for speech
//! kinds, and the sequential chunk pipeline for batch voice replies. Every
//! stage respects the job's cancel token and the remaining slice of its
//! hard deadline.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::command::{CommandBuilder, CommandSpec};
use crate::config::DispatchConfig;
use crate::error::{JobError, KeepaliveError, Stage};
use crate::keepalive::KeepaliveClient;
use crate::process::{self, ExecOptions, ExecOutcome};
use crate::retry::RetryPolicy;
use crate::scheduler::job::{Deadline, Job, JobKind};
use crate::task::{TaskLedger, TaskPatch, TaskStatus};
use crate::transport::{EmitMeta, Transport, snippet};
use crate::worker::{Worker, WorkerRegistry};

/// Collaborators the runner needs.
pub struct RunnerDeps {
    pub registry: Arc<WorkerRegistry>,
    pub ledger: Arc<TaskLedger>,
    pub commands: Arc<dyn CommandBuilder>,
    pub transport: Arc<dyn Transport>,
    pub tts: Option<Arc<KeepaliveClient>>,
    pub stt: Option<Arc<KeepaliveClient>>,
}

/// What a successful run produced.
struct RunOutput {
    /// Text to deliver (voice replies deliver per chunk instead).
    text: Option<String>,
    /// Ledger snippet describing the output.
    summary: String,
}

/// Executes jobs. One instance shared by all lane drain loops.
pub struct JobRunner {
    config: DispatchConfig,
    deps: RunnerDeps,
}

impl JobRunner {
    pub fn new(config: DispatchConfig, deps: RunnerDeps) -> Arc<Self> {
        Arc::new(Self { config, deps })
    }

    /// Run one job to completion and settle its task.
    pub async fn run(&self, job: Job) {
        let started = Instant::now();
        tracing::info!(
            job = %job.id,
            task = %job.task_id,
            kind = job.kind.label(),
            chat = %job.chat_id,
            "job started"
        );

        if let Err(e) = self
            .deps
            .ledger
            .update(job.task_id, TaskPatch::status(TaskStatus::Running))
            .await
        {
            tracing::error!(task = %job.task_id, "failed to mark task running: {e}");
        }

        let outcome = self.execute(&job).await;
        self.finalize(&job, outcome, started).await;
    }

    async fn execute(&self, job: &Job) -> Result<RunOutput, JobError> {
        match &job.kind {
            JobKind::Exec { prompt } => self.run_cli(job, prompt).await,
            JobKind::RawCommand { command } => self.run_raw(job, command).await,
            JobKind::Transcribe { audio } => self.run_transcribe(job, audio).await,
            JobKind::Synthesize { text } => {
                self.run_voice_reply(job, std::slice::from_ref(text)).await
            }
            JobKind::SynthesizeBatch { chunks } => self.run_voice_reply(job, chunks).await,
        }
    }

    // ── CLI / raw command ──────────────────────────────────────────

    async fn run_cli(&self, job: &Job, prompt: &str) -> Result<RunOutput, JobError> {
        let worker = self.worker_for(job).await?;
        let session = self
            .deps
            .registry
            .session_for(&job.chat_id, worker.id)
            .await;
        let spec = self
            .deps
            .commands
            .exec(&worker, prompt, session.as_deref());
        let spec = &spec;

        let policy = self.policy(self.config.retries.exec);
        let out = run_stage(
            &policy,
            job.deadline,
            &job.handle.token(),
            Stage::Exec,
            self.config.stage_timeouts.exec,
            move |timeout| self.exec_with(job, spec, Stage::Exec, true, timeout),
        )
        .await?;

        if !out.success {
            return Err(upstream(&out));
        }
        let text = out.stdout.trim().to_string();
        Ok(RunOutput {
            summary: snippet(&text, 200),
            text: Some(text),
        })
    }

    async fn run_raw(&self, job: &Job, command: &str) -> Result<RunOutput, JobError> {
        let worker = self.worker_for(job).await?;
        let spec = self.deps.commands.raw(&worker, command);

        let timeout = job
            .deadline
            .effective_timeout(self.config.stage_timeouts.exec);
        let out = self.exec_with(job, &spec, Stage::Exec, true, timeout).await?;

        // Raw commands report their outcome either way; a non-zero exit is
        // information, not a scheduler failure.
        let mut text = out.stdout.trim().to_string();
        if !out.success {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("[exit code {}]", out.exit_code));
            if !out.stderr.trim().is_empty() {
                text.push('\n');
                text.push_str(out.stderr.trim());
            }
        }
        if text.is_empty() {
            text = "[no output]".to_string();
        }
        Ok(RunOutput {
            summary: snippet(&text, 200),
            text: Some(text),
        })
    }

    // ── Transcription ──────────────────────────────────────────────

    async fn run_transcribe(&self, job: &Job, audio: &Path) -> Result<RunOutput, JobError> {
        let policy = self.policy(self.config.retries.transcribe);
        let text = run_stage(
            &policy,
            job.deadline,
            &job.handle.token(),
            Stage::Transcribe,
            self.config.stage_timeouts.transcribe,
            move |timeout| self.transcribe_once(job, audio, timeout),
        )
        .await?;

        Ok(RunOutput {
            summary: snippet(&text, 200),
            text: Some(text),
        })
    }

    async fn transcribe_once(
        &self,
        job: &Job,
        audio: &Path,
        timeout: Option<Duration>,
    ) -> Result<String, JobError> {
        if let Some(stt) = &self.deps.stt {
            match self.keepalive_transcribe(stt, job, audio, timeout).await {
                Ok(text) => return Ok(text),
                Err(err) if self.config.legacy_fallback && err.is_fallback_worthy() => {
                    tracing::warn!(
                        backend = stt.label(),
                        "keepalive transcription unavailable ({err}); using one-shot fallback"
                    );
                }
                Err(err) => return Err(map_keepalive(Stage::Transcribe, err)),
            }
        }

        let spec = self.deps.commands.transcribe(audio);
        let out = self
            .exec_with(job, &spec, Stage::Transcribe, false, timeout)
            .await?;
        if !out.success {
            return Err(upstream(&out));
        }
        Ok(out.stdout.trim().to_string())
    }

    async fn keepalive_transcribe(
        &self,
        client: &KeepaliveClient,
        job: &Job,
        audio: &Path,
        timeout: Option<Duration>,
    ) -> Result<String, KeepaliveError> {
        client.start().await?;
        let body = serde_json::json!({
            "op": "transcribe",
            "audio": audio.to_string_lossy(),
        });
        let data = client.request(body, &job.handle.token(), timeout).await?;
        data.get("text")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| KeepaliveError::Protocol("transcription result missing text".into()))
    }

    // ── Voice replies (single and batch) ───────────────────────────

    /// Synthesize, encode, and upload each chunk sequentially. The job's
    /// transient accounting resets per chunk; the hard deadline shrinks
    /// monotonically across all of them.
    async fn run_voice_reply(&self, job: &Job, chunks: &[String]) -> Result<RunOutput, JobError> {
        if chunks.is_empty() {
            return Err(JobError::UpstreamFailure {
                exit_code: -1,
                detail: "nothing to synthesize".into(),
            });
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.config.media_dir).await {
            return Err(JobError::Process(format!(
                "cannot create media dir {}: {e}",
                self.config.media_dir.display()
            )));
        }

        let token = job.handle.token();
        let mut uploaded = 0usize;
        for (index, chunk) in chunks.iter().enumerate() {
            if token.is_cancelled() {
                return Err(JobError::Canceled);
            }
            if job.deadline.is_expired() {
                return Err(JobError::DeadlineExceeded {
                    stage: Stage::Synthesize,
                });
            }

            let wav = self
                .config
                .media_dir
                .join(format!("job-{}-{index:03}.wav", job.id));
            let voice = wav.with_extension("ogg");
            let (wav_ref, voice_ref) = (wav.as_path(), voice.as_path());

            run_stage(
                &self.policy(self.config.retries.synthesize),
                job.deadline,
                &token,
                Stage::Synthesize,
                self.config.stage_timeouts.synthesize,
                move |timeout| self.synthesize_once(job, chunk, wav_ref, timeout),
            )
            .await?;

            run_stage(
                &self.policy(self.config.retries.encode),
                job.deadline,
                &token,
                Stage::Encode,
                self.config.stage_timeouts.encode,
                move |timeout| self.encode_once(job, wav_ref, voice_ref, timeout),
            )
            .await?;

            let ids = run_stage(
                &self.policy(self.config.retries.upload),
                job.deadline,
                &token,
                Stage::Upload,
                self.config.stage_timeouts.upload,
                move |timeout| self.upload_once(job, voice_ref, timeout),
            )
            .await?;

            // Record delivery as it happens so a later failure does not
            // lose track of already-sent chunks.
            if let Err(e) = self
                .deps
                .ledger
                .update(job.task_id, TaskPatch::default().with_message_ids(ids))
                .await
            {
                tracing::warn!(task = %job.task_id, "failed to record voice message ids: {e}");
            }
            uploaded += 1;

            let _ = tokio::fs::remove_file(&wav).await;
            let _ = tokio::fs::remove_file(&voice).await;
        }

        Ok(RunOutput {
            text: None,
            summary: format!("voice reply ({uploaded} part(s))"),
        })
    }

    async fn synthesize_once(
        &self,
        job: &Job,
        text: &str,
        wav: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), JobError> {
        if let Some(tts) = &self.deps.tts {
            match self.keepalive_synthesize(tts, job, text, wav, timeout).await {
                Ok(()) => return Ok(()),
                Err(err) if self.config.legacy_fallback && err.is_fallback_worthy() => {
                    tracing::warn!(
                        backend = tts.label(),
                        "keepalive synthesis unavailable ({err}); using one-shot fallback"
                    );
                }
                Err(err) => return Err(map_keepalive(Stage::Synthesize, err)),
            }
        }

        let spec = self.deps.commands.synthesize(text, wav);
        let out = self
            .exec_with(job, &spec, Stage::Synthesize, false, timeout)
            .await?;
        if !out.success {
            return Err(upstream(&out));
        }
        self.require_file(wav).await
    }

    async fn keepalive_synthesize(
        &self,
        client: &KeepaliveClient,
        job: &Job,
        text: &str,
        wav: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), KeepaliveError> {
        client.start().await?;
        let body = serde_json::json!({
            "op": "synthesize",
            "text": text,
            "out_wav": wav.to_string_lossy(),
        });
        client.request(body, &job.handle.token(), timeout).await?;
        match tokio::fs::metadata(wav).await {
            Ok(_) => Ok(()),
            Err(_) => Err(KeepaliveError::Protocol(format!(
                "backend reported success but {} is missing",
                wav.display()
            ))),
        }
    }

    async fn encode_once(
        &self,
        job: &Job,
        wav: &Path,
        out: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), JobError> {
        let spec = self.deps.commands.encode(wav, out);
        let outcome = self
            .exec_with(job, &spec, Stage::Encode, false, timeout)
            .await?;
        if !outcome.success {
            return Err(upstream(&outcome));
        }
        self.require_file(out).await
    }

    async fn upload_once(
        &self,
        job: &Job,
        voice: &Path,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>, JobError> {
        let meta = self.meta_for(job).await;
        let token = job.handle.token();
        let send = self.deps.transport.emit_voice(&job.chat_id, voice, &meta);
        tokio::select! {
            res = send => res.map_err(|e| JobError::Process(e.to_string())),
            _ = token.cancelled() => Err(JobError::Canceled),
            _ = sleep_opt(timeout) => Err(JobError::Timeout {
                stage: Stage::Upload,
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    // ── Shared plumbing ────────────────────────────────────────────

    /// Run one external process for this job, wiring cancellation, the pid
    /// slot, and (optionally) live progress streaming.
    async fn exec_with(
        &self,
        job: &Job,
        spec: &CommandSpec,
        stage: Stage,
        stream_progress: bool,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, JobError> {
        let progress = if stream_progress {
            let (tx, mut rx) = mpsc::channel::<String>(64);
            let transport = self.deps.transport.clone();
            let chat_id = job.chat_id.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    transport.emit_progress(&chat_id, &line).await;
                }
            });
            Some(tx)
        } else {
            None
        };

        let opts = ExecOptions {
            timeout,
            cancel: job.handle.token(),
            progress,
            kill_grace: self.config.kill_grace,
            max_capture_bytes: self.config.max_capture_bytes,
            pid_slot: Some(job.handle.pid_slot.clone()),
        };
        process::run(spec, stage, opts).await
    }

    async fn worker_for(&self, job: &Job) -> Result<Worker, JobError> {
        let id = job
            .worker_id
            .ok_or_else(|| JobError::Process("job has no worker attached".into()))?;
        self.deps
            .registry
            .get(id)
            .await
            .map_err(|e| JobError::Process(e.to_string()))
    }

    async fn require_file(&self, path: &Path) -> Result<(), JobError> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(()),
            Err(_) => Err(JobError::UpstreamFailure {
                exit_code: -1,
                detail: format!("expected output {} is missing", path.display()),
            }),
        }
    }

    async fn meta_for(&self, job: &Job) -> EmitMeta {
        let task = self.deps.ledger.get(job.task_id).await.ok();
        EmitMeta {
            reply_to_message_id: task.as_ref().and_then(|t| t.reply_to_message_id.clone()),
            worker_id: job.worker_id,
            task_id: Some(job.task_id),
            session_id: task.and_then(|t| t.session_id),
        }
    }

    fn policy(&self, retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            retries,
            self.config.retry_base_delay,
            self.config.retry_max_delay,
        )
    }

    async fn finalize(&self, job: &Job, outcome: Result<RunOutput, JobError>, started: Instant) {
        let elapsed = started.elapsed();
        match outcome {
            Ok(out) => {
                let mut ids = Vec::new();
                if let Some(text) = &out.text {
                    let meta = self.meta_for(job).await;
                    match self.deps.transport.emit(&job.chat_id, text, &meta).await {
                        Ok(delivered) => ids = delivered,
                        Err(e) => {
                            tracing::error!(job = %job.id, "result delivery failed: {e}");
                            self.settle(
                                job,
                                TaskPatch::status(TaskStatus::Failed)
                                    .with_success(false)
                                    .with_output_snippet(format!("delivery failed: {e}")),
                            )
                            .await;
                            return;
                        }
                    }
                }
                tracing::info!(job = %job.id, ?elapsed, "job completed");
                self.settle(
                    job,
                    TaskPatch::status(TaskStatus::Completed)
                        .with_success(true)
                        .with_output_snippet(out.summary)
                        .with_message_ids(ids),
                )
                .await;
            }
            Err(JobError::Canceled) => {
                tracing::info!(job = %job.id, ?elapsed, "job canceled");
                self.settle(job, TaskPatch::status(TaskStatus::Canceled)).await;
            }
            Err(err) => {
                if let JobError::Timeout { stage, .. } | JobError::DeadlineExceeded { stage } = &err
                {
                    job.handle.mark_timed_out(*stage);
                }
                tracing::warn!(job = %job.id, ?elapsed, "job failed: {err}");
                let meta = self.meta_for(job).await;
                let _ = self
                    .deps
                    .transport
                    .emit(&job.chat_id, &format!("Request failed: {err}"), &meta)
                    .await;
                self.settle(
                    job,
                    TaskPatch::status(TaskStatus::Failed)
                        .with_success(false)
                        .with_output_snippet(err.to_string()),
                )
                .await;
            }
        }
    }

    async fn settle(&self, job: &Job, patch: TaskPatch) {
        if let Err(e) = self.deps.ledger.update(job.task_id, patch).await {
            tracing::error!(task = %job.task_id, "failed to settle task: {e}");
        }
    }
}

/// Map a keepalive failure onto the job error taxonomy.
fn map_keepalive(stage: Stage, err: KeepaliveError) -> JobError {
    match err {
        KeepaliveError::Canceled => JobError::Canceled,
        KeepaliveError::Timeout { timeout } => JobError::Timeout { stage, timeout },
        KeepaliveError::RequestFailed(detail) => JobError::UpstreamFailure {
            exit_code: -1,
            detail,
        },
        other => JobError::Process(other.to_string()),
    }
}

fn upstream(out: &ExecOutcome) -> JobError {
    let detail = if !out.stderr.trim().is_empty() {
        snippet(out.stderr.trim(), 400)
    } else {
        snippet(out.stdout.trim(), 400)
    };
    JobError::UpstreamFailure {
        exit_code: out.exit_code,
        detail,
    }
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

/// Run one stage with its retry budget. Retries happen only for transient
/// failures, only while deadline budget remains, and back off with
/// jittered exponential delays.
async fn run_stage<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Deadline,
    cancel: &CancelToken,
    stage: Stage,
    stage_timeout: Option<Duration>,
    mut attempt: F,
) -> Result<T, JobError>
where
    F: FnMut(Option<Duration>) -> Fut,
    Fut: std::future::Future<Output = Result<T, JobError>>,
{
    let mut tries = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(JobError::Canceled);
        }
        if deadline.is_expired() {
            return Err(JobError::DeadlineExceeded { stage });
        }
        let timeout = deadline.effective_timeout(stage_timeout);
        match attempt(timeout).await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.is_transient() && tries < policy.max_retries && !deadline.is_expired() =>
            {
                let delay = policy.delay_for(tries);
                tries += 1;
                tracing::warn!(%stage, attempt = tries, ?delay, "stage failed ({err}); retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(JobError::Canceled),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::from_millis(10), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn run_stage_retries_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let out = run_stage(
            &policy(3),
            Deadline::unlimited(),
            &CancelToken::never(),
            Stage::Synthesize,
            None,
            move |_timeout| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(JobError::Process("transient".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_stage_never_retries_terminal_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let err = run_stage::<(), _, _>(
            &policy(3),
            Deadline::unlimited(),
            &CancelToken::never(),
            Stage::Upload,
            None,
            move |_timeout| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::UpstreamFailure {
                        exit_code: 2,
                        detail: "deterministic".into(),
                    })
                }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::UpstreamFailure { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_stage_zero_budget_fails_on_first_transient() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let err = run_stage::<(), _, _>(
            &policy(0),
            Deadline::unlimited(),
            &CancelToken::never(),
            Stage::Upload,
            None,
            move |_timeout| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::Process("flaky upload".into()))
                }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::Process(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "upload must not retry");
    }

    #[tokio::test]
    async fn run_stage_stops_at_expired_deadline() {
        let deadline = Deadline::after(Duration::from_millis(30));
        let err = run_stage::<(), _, _>(
            &policy(10),
            deadline,
            &CancelToken::never(),
            Stage::Synthesize,
            None,
            move |_timeout| async {
                tokio::time::sleep(Duration::from_millis(25)).await;
                Err(JobError::Process("slow".into()))
            },
        )
        .await
        .unwrap_err();
        assert!(
            matches!(
                err,
                JobError::DeadlineExceeded { .. } | JobError::Process(_)
            ),
            "retries must not continue past the deadline: {err}"
        );
    }

    #[tokio::test]
    async fn run_stage_effective_timeout_is_clamped() {
        let deadline = Deadline::after(Duration::from_secs(1));
        run_stage(
            &policy(0),
            deadline,
            &CancelToken::never(),
            Stage::Exec,
            Some(Duration::from_secs(300)),
            move |timeout| async move {
                let t = timeout.expect("timeout must be set");
                assert!(t <= Duration::from_secs(1), "stage timeout must be clamped to the deadline");
                Ok(())
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn run_stage_cancel_wins_over_retry_sleep() {
        let (handle, token) = cancel_pair();
        let slow_policy = RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(10));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });
        let started = Instant::now();
        let err = run_stage::<(), _, _>(
            &slow_policy,
            Deadline::unlimited(),
            &token,
            Stage::Synthesize,
            None,
            move |_timeout| async { Err(JobError::Process("transient".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn keepalive_error_mapping() {
        assert!(matches!(
            map_keepalive(Stage::Synthesize, KeepaliveError::Canceled),
            JobError::Canceled
        ));
        assert!(matches!(
            map_keepalive(
                Stage::Synthesize,
                KeepaliveError::Timeout {
                    timeout: Duration::from_secs(1)
                }
            ),
            JobError::Timeout {
                stage: Stage::Synthesize,
                ..
            }
        ));
        assert!(matches!(
            map_keepalive(Stage::Transcribe, KeepaliveError::RequestFailed("bad".into())),
            JobError::UpstreamFailure { .. }
        ));
        assert!(matches!(
            map_keepalive(Stage::Transcribe, KeepaliveError::Busy),
            JobError::Process(_)
        ));
    }
}
