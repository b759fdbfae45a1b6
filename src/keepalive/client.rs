//! Keepalive process manager.
//!
//! Owns one long-lived child process behind an actor task. The child speaks
//! the line-delimited JSON protocol in [`super::protocol`]; the actor
//! enforces the one-pending-request contract (a second concurrent request
//! fails fast with `Busy` — queueing is the lane's job), scans stderr for
//! fatal patterns, and restarts the child with jittered exponential backoff
//! when it dies outside an explicit shutdown.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::command::CommandSpec;
use crate::error::KeepaliveError;
use crate::keepalive::protocol::{self, ServerMessage};
use crate::retry;

/// Bytes of recent stderr kept for fatal-pattern scanning. Patterns that
/// span chunk boundaries still match inside this window.
const STDERR_WINDOW_BYTES: usize = 8 * 1024;

/// Configuration for one keepalive instance.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Short name for logs ("tts", "stt").
    pub label: String,
    /// Fixed startup invocation.
    pub command: CommandSpec,
    /// How long the ready handshake may take.
    pub startup_timeout: Duration,
    /// Restart automatically when the process dies outside shutdown.
    pub auto_restart: bool,
    pub restart_base_delay: Duration,
    pub restart_max_delay: Duration,
    /// Case-insensitive stderr substrings that mean the backend is wedged
    /// beyond saving even if the process has not exited.
    pub fatal_patterns: Vec<String>,
}

impl KeepaliveConfig {
    pub fn new(label: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            label: label.into(),
            command,
            startup_timeout: Duration::from_secs(60),
            auto_restart: true,
            restart_base_delay: Duration::from_secs(1),
            restart_max_delay: Duration::from_secs(60),
            fatal_patterns: vec![
                "cuda out of memory".into(),
                "traceback (most recent call last)".into(),
                "segmentation fault".into(),
                "memoryerror".into(),
            ],
        }
    }
}

/// Lifecycle state of the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    Stopped,
    Starting,
    Ready,
}

impl std::fmt::Display for KeepaliveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of the actor's state, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct KeepaliveStatus {
    pub state: KeepaliveState,
    pub busy: bool,
    pub restart_attempts: u32,
}

/// Handle to a keepalive actor. Cheap to clone via `Arc`.
pub struct KeepaliveClient {
    label: String,
    cmd_tx: mpsc::Sender<ActorCommand>,
}

impl KeepaliveClient {
    /// Spawn the actor. The child process is not started until `start` is
    /// called (or the first auto-restart fires).
    pub fn spawn(config: KeepaliveConfig) -> Arc<Self> {
        let label = config.label.clone();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        tokio::spawn(Actor::new(config, cmd_rx).run());
        Arc::new(Self { label, cmd_tx })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Start the child and wait for the ready handshake. Idempotent: a
    /// ready backend returns immediately, a starting one is awaited.
    pub async fn start(&self) -> Result<(), KeepaliveError> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorCommand::Start(tx)).await?;
        rx.await.unwrap_or(Err(actor_gone()))
    }

    /// Send one request and wait for its result.
    ///
    /// Fails fast with `Busy` while another request is pending and with
    /// `NotReady` when the backend is not up. `cancel` stops the wait (the
    /// backend's in-flight work is abandoned, not interrupted); `timeout`
    /// bounds the wait at this layer only.
    pub async fn request(
        &self,
        body: Value,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<Value, KeepaliveError> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorCommand::Request { body, resp: tx }).await?;
        tokio::select! {
            res = rx => res.unwrap_or(Err(actor_gone())),
            _ = cancel.cancelled() => Err(KeepaliveError::Canceled),
            _ = sleep_opt(timeout) => Err(KeepaliveError::Timeout {
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    /// Stop the child for good. No auto-restart follows.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(ActorCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn status(&self) -> Result<KeepaliveStatus, KeepaliveError> {
        let (tx, rx) = oneshot::channel();
        self.send(ActorCommand::Status(tx)).await?;
        rx.await.map_err(|_| actor_gone())
    }

    async fn send(&self, cmd: ActorCommand) -> Result<(), KeepaliveError> {
        self.cmd_tx.send(cmd).await.map_err(|_| actor_gone())
    }
}

fn actor_gone() -> KeepaliveError {
    KeepaliveError::Io("keepalive actor is gone".into())
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

enum ActorCommand {
    Start(oneshot::Sender<Result<(), KeepaliveError>>),
    Request {
        body: Value,
        resp: oneshot::Sender<Result<Value, KeepaliveError>>,
    },
    Shutdown(oneshot::Sender<()>),
    Status(oneshot::Sender<KeepaliveStatus>),
}

enum ChildEvent {
    Message(ServerMessage),
    Diagnostic(String),
    Fatal(String),
}

struct Actor {
    cfg: KeepaliveConfig,
    cmd_rx: mpsc::Receiver<ActorCommand>,
    state: KeepaliveState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    events: Option<mpsc::Receiver<ChildEvent>>,
    pending: Option<(u64, oneshot::Sender<Result<Value, KeepaliveError>>)>,
    start_waiters: Vec<oneshot::Sender<Result<(), KeepaliveError>>>,
    seq: u64,
    restart_attempts: u32,
    startup_deadline: Option<Instant>,
    restart_at: Option<Instant>,
}

impl Actor {
    fn new(cfg: KeepaliveConfig, cmd_rx: mpsc::Receiver<ActorCommand>) -> Self {
        Self {
            cfg,
            cmd_rx,
            state: KeepaliveState::Stopped,
            child: None,
            stdin: None,
            events: None,
            pending: None,
            start_waiters: Vec::new(),
            seq: 0,
            restart_attempts: 0,
            startup_deadline: None,
            restart_at: None,
        }
    }

    async fn run(mut self) {
        enum Step {
            Cmd(Option<ActorCommand>),
            Event(Option<ChildEvent>),
            Exited(std::io::Result<std::process::ExitStatus>),
            StartupTimedOut,
            RestartDue,
        }

        loop {
            // Select produces a marker only; state is touched afterwards so
            // no branch future is still borrowing it. `biased` keeps
            // protocol frames ahead of the exit notification when a backend
            // answers and dies in the same instant.
            let step = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                ev = next_event(&mut self.events) => Step::Event(ev),
                status = wait_child(&mut self.child) => Step::Exited(status),
                _ = sleep_until_opt(self.startup_deadline), if self.startup_deadline.is_some() => {
                    Step::StartupTimedOut
                }
                _ = sleep_until_opt(self.restart_at), if self.restart_at.is_some() => {
                    Step::RestartDue
                }
            };

            match step {
                Step::Cmd(Some(ActorCommand::Shutdown(resp))) => {
                    self.shutdown().await;
                    let _ = resp.send(());
                    return;
                }
                Step::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                // Every handle dropped: stop the child and end.
                Step::Cmd(None) => {
                    self.shutdown().await;
                    return;
                }
                Step::Event(Some(ev)) => self.handle_event(ev).await,
                // Reader tasks are gone; exit (or teardown) follows via
                // the child handle.
                Step::Event(None) => self.events = None,
                Step::Exited(status) => {
                    // Lines written just before death are still in flight
                    // from the reader tasks; settle them first.
                    self.drain_events_until_closed(Duration::from_millis(250)).await;
                    self.handle_exit(status).await;
                }
                Step::StartupTimedOut => {
                    let timeout = self.cfg.startup_timeout;
                    tracing::warn!(backend = %self.cfg.label, "ready handshake timed out");
                    self.teardown(KeepaliveError::StartupTimeout { timeout }).await;
                }
                Step::RestartDue => {
                    self.restart_at = None;
                    self.start_child();
                }
            }
        }
    }

    /// Process remaining child events until the readers close their
    /// channel or the grace window runs out.
    async fn drain_events_until_closed(&mut self, grace: Duration) {
        let Some(mut rx) = self.events.take() else {
            return;
        };
        let deadline = Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(ev)) => self.handle_event(ev).await,
                Ok(None) | Err(_) => break,
            }
        }
    }

    async fn handle_command(&mut self, cmd: ActorCommand) {
        match cmd {
            ActorCommand::Start(resp) => match self.state {
                KeepaliveState::Ready => {
                    let _ = resp.send(Ok(()));
                }
                KeepaliveState::Starting => self.start_waiters.push(resp),
                KeepaliveState::Stopped => {
                    // An explicit start overrides a scheduled restart delay.
                    self.restart_at = None;
                    self.start_waiters.push(resp);
                    self.start_child();
                }
            },
            ActorCommand::Request { body, resp } => {
                if self.state != KeepaliveState::Ready {
                    let _ = resp.send(Err(KeepaliveError::NotReady));
                    return;
                }
                if self.pending.is_some() {
                    let _ = resp.send(Err(KeepaliveError::Busy));
                    return;
                }
                self.seq += 1;
                let id = self.seq;
                let line = match protocol::encode_request(id, &body) {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = resp.send(Err(e));
                        return;
                    }
                };
                let write = match self.stdin.as_mut() {
                    Some(stdin) => stdin.write_all(line.as_bytes()).await,
                    None => Err(std::io::Error::other("stdin closed")),
                };
                match write {
                    Ok(()) => self.pending = Some((id, resp)),
                    Err(e) => {
                        let _ = resp.send(Err(KeepaliveError::Io(e.to_string())));
                        tracing::warn!(backend = %self.cfg.label, "stdin write failed: {e}");
                        self.teardown(KeepaliveError::Io(e.to_string())).await;
                    }
                }
            }
            ActorCommand::Status(resp) => {
                let _ = resp.send(KeepaliveStatus {
                    state: self.state,
                    busy: self.pending.is_some(),
                    restart_attempts: self.restart_attempts,
                });
            }
            // Normally intercepted in run(); honoring it here keeps the
            // match total without panicking.
            ActorCommand::Shutdown(resp) => {
                self.shutdown().await;
                let _ = resp.send(());
            }
        }
    }

    async fn handle_event(&mut self, ev: ChildEvent) {
        match ev {
            ChildEvent::Message(ServerMessage::Ready) => {
                if self.state == KeepaliveState::Starting {
                    self.state = KeepaliveState::Ready;
                    self.startup_deadline = None;
                    // Only a completed handshake proves the backend is
                    // healthy again.
                    self.restart_attempts = 0;
                    tracing::info!(backend = %self.cfg.label, "keepalive backend ready");
                    for waiter in self.start_waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                } else {
                    tracing::debug!(backend = %self.cfg.label, "unexpected ready frame ignored");
                }
            }
            ChildEvent::Message(ServerMessage::Result(frame)) => {
                match self.pending.take() {
                    Some((id, resp)) if id == frame.id => {
                        let result = if frame.ok {
                            Ok(Value::Object(frame.data))
                        } else {
                            Err(KeepaliveError::RequestFailed(
                                frame.error.unwrap_or_else(|| "unspecified error".into()),
                            ))
                        };
                        let _ = resp.send(result);
                    }
                    Some((id, resp)) => {
                        tracing::warn!(
                            backend = %self.cfg.label,
                            expected = id,
                            got = frame.id,
                            "result id mismatch"
                        );
                        self.pending = Some((id, resp));
                    }
                    None => {
                        tracing::debug!(backend = %self.cfg.label, id = frame.id, "stray result frame");
                    }
                }
            }
            ChildEvent::Diagnostic(line) => {
                tracing::debug!(backend = %self.cfg.label, "{line}");
            }
            ChildEvent::Fatal(pattern) => {
                tracing::error!(backend = %self.cfg.label, pattern, "fatal backend error detected");
                self.teardown(KeepaliveError::BackendFatal { pattern }).await;
            }
        }
    }

    async fn handle_exit(&mut self, status: std::io::Result<std::process::ExitStatus>) {
        let detail = match status {
            Ok(s) => format!("exit code {}", s.code().unwrap_or(-1)),
            Err(e) => format!("wait failed: {e}"),
        };
        tracing::warn!(backend = %self.cfg.label, "keepalive backend exited ({detail})");
        self.child = None;
        // A fatal-pattern teardown may already have run while the events
        // were draining; don't schedule a second restart for the same death.
        if self.state == KeepaliveState::Stopped {
            return;
        }
        self.teardown(KeepaliveError::Exited(detail)).await;
    }

    /// Stop the child and fail everything waiting on it, then schedule a
    /// restart unless auto-restart is off.
    async fn teardown(&mut self, error: KeepaliveError) {
        self.kill_child().await;
        self.reject_all(error);
        self.state = KeepaliveState::Stopped;
        self.startup_deadline = None;

        if self.cfg.auto_restart {
            self.restart_attempts += 1;
            let delay = retry::jittered(retry::exponential(
                self.cfg.restart_base_delay,
                self.cfg.restart_max_delay,
                self.restart_attempts - 1,
            ));
            tracing::info!(
                backend = %self.cfg.label,
                attempt = self.restart_attempts,
                ?delay,
                "scheduling keepalive restart"
            );
            self.restart_at = Some(Instant::now() + delay);
        }
    }

    /// Explicit shutdown: no restart follows.
    async fn shutdown(&mut self) {
        self.restart_at = None;
        self.kill_child().await;
        self.reject_all(KeepaliveError::Canceled);
        self.state = KeepaliveState::Stopped;
        self.startup_deadline = None;
        tracing::info!(backend = %self.cfg.label, "keepalive backend shut down");
    }

    fn reject_all(&mut self, error: KeepaliveError) {
        if let Some((_, resp)) = self.pending.take() {
            let _ = resp.send(Err(error.clone()));
        }
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    async fn kill_child(&mut self) {
        self.stdin = None;
        self.events = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    fn start_child(&mut self) {
        let spec = &self.cfg.command;
        let mut cmd = Command::new(&spec.bin);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(backend = %self.cfg.label, "failed to spawn keepalive backend: {e}");
                let err = KeepaliveError::Io(format!("spawn failed: {e}"));
                self.reject_all(err);
                self.state = KeepaliveState::Stopped;
                if self.cfg.auto_restart {
                    self.restart_attempts += 1;
                    let delay = retry::jittered(retry::exponential(
                        self.cfg.restart_base_delay,
                        self.cfg.restart_max_delay,
                        self.restart_attempts - 1,
                    ));
                    self.restart_at = Some(Instant::now() + delay);
                }
                return;
            }
        };

        let (event_tx, event_rx) = mpsc::channel(64);

        if let Some(stdout) = child.stdout.take() {
            let tx = event_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let ev = match protocol::parse_line(&line) {
                        Some(msg) => ChildEvent::Message(msg),
                        None => ChildEvent::Diagnostic(line),
                    };
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let patterns: Vec<String> = self
                .cfg
                .fatal_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect();
            let tx = event_tx;
            tokio::spawn(async move {
                let mut stderr = stderr;
                let mut window = String::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    tracing::debug!("keepalive stderr: {}", chunk.trim_end());
                    window.push_str(&chunk.to_lowercase());
                    if let Some(pattern) = patterns.iter().find(|p| window.contains(p.as_str())) {
                        let _ = tx.send(ChildEvent::Fatal(pattern.clone())).await;
                        break;
                    }
                    // Keep a bounded tail; matches across chunk boundaries
                    // stay inside the window.
                    if window.len() > STDERR_WINDOW_BYTES {
                        let cut = window.len() - STDERR_WINDOW_BYTES;
                        let cut = (cut..window.len())
                            .find(|i| window.is_char_boundary(*i))
                            .unwrap_or(0);
                        window.drain(..cut);
                    }
                }
            });
        }

        self.stdin = child.stdin.take();
        self.events = Some(event_rx);
        self.child = Some(child);
        self.state = KeepaliveState::Starting;
        self.startup_deadline = Some(Instant::now() + self.cfg.startup_timeout);
        tracing::info!(backend = %self.cfg.label, "keepalive backend starting");
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ChildEvent>>) -> Option<ChildEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<std::process::ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
