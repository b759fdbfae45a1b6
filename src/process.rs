//! One-shot child process execution.
//!
//! Spawns a [`CommandSpec`], pipes optional stdin, captures stdout/stderr
//! into bounded tail buffers, forwards stdout lines to an optional progress
//! channel, and enforces timeout and cancellation by terminating the whole
//! process tree (terminate first, kill after a grace period).

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::command::CommandSpec;
use crate::error::{JobError, Stage};

/// Shared slot holding the pid of the currently attached child, if any.
pub type PidSlot = Arc<Mutex<Option<u32>>>;

/// Options for a single run.
pub struct ExecOptions {
    /// Effective timeout for this run (None = no limit at this layer).
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
    /// Receives stdout lines as they arrive. Best-effort: a full channel
    /// drops lines rather than stalling the child.
    pub progress: Option<mpsc::Sender<String>>,
    /// Grace period between terminate and kill.
    pub kill_grace: Duration,
    /// Maximum bytes of stdout (and separately stderr) retained.
    pub max_capture_bytes: usize,
    /// Exposes the child's pid while it runs.
    pub pid_slot: Option<PidSlot>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: CancelToken::never(),
            progress: None,
            kill_grace: Duration::from_secs(5),
            max_capture_bytes: 64 * 1024,
            pid_slot: None,
        }
    }
}

/// Result of a run that ended with the child exiting on its own.
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Run a command to completion.
///
/// Timeout and cancellation terminate the process tree and surface as
/// `JobError::Timeout` / `JobError::Canceled`; a child that exits on its
/// own always produces an `ExecOutcome`, even on non-zero exit.
pub async fn run(spec: &CommandSpec, stage: Stage, opts: ExecOptions) -> Result<ExecOutcome, JobError> {
    let mut cmd = build_command(spec);
    cmd.stdin(if spec.stdin_text.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| JobError::Process(format!("failed to spawn {}: {e}", spec.bin)))?;

    let pid = child.id();
    if let (Some(slot), Some(pid)) = (&opts.pid_slot, pid) {
        *slot.lock().expect("pid slot poisoned") = Some(pid);
    }

    if let Some(text) = spec.stdin_text.clone() {
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    tracing::debug!("stdin write failed: {e}");
                }
                // Dropping stdin closes the pipe so the child sees EOF.
            });
        }
    }

    let stdout_task = capture_task(child.stdout.take(), opts.max_capture_bytes, opts.progress.clone());
    let stderr_task = capture_task(child.stderr.take(), opts.max_capture_bytes, None);

    enum Waited {
        Exited(std::io::Result<std::process::ExitStatus>),
        Canceled,
        TimedOut,
    }

    let started = Instant::now();
    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = opts.cancel.cancelled() => Waited::Canceled,
        _ = sleep_opt(opts.timeout) => Waited::TimedOut,
    };

    let status = match waited {
        Waited::Exited(status) => {
            status.map_err(|e| JobError::Process(format!("wait failed: {e}")))?
        }
        Waited::Canceled => {
            terminate_tree(&mut child, pid, opts.kill_grace).await;
            clear_slot(&opts.pid_slot);
            drain(stdout_task).await;
            drain(stderr_task).await;
            return Err(JobError::Canceled);
        }
        Waited::TimedOut => {
            terminate_tree(&mut child, pid, opts.kill_grace).await;
            clear_slot(&opts.pid_slot);
            drain(stdout_task).await;
            drain(stderr_task).await;
            return Err(JobError::Timeout {
                stage,
                timeout: opts.timeout.unwrap_or_default(),
            });
        }
    };

    clear_slot(&opts.pid_slot);
    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;
    let exit_code = status.code().unwrap_or(-1);

    Ok(ExecOutcome {
        exit_code,
        success: status.success(),
        stdout,
        stderr,
        duration: started.elapsed(),
    })
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = if spec.shell {
        if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &spec.bin]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &spec.bin]);
            c
        }
    } else {
        let mut c = Command::new(&spec.bin);
        c.args(&spec.args);
        c
    };

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    // Own process group so terminate/kill reaches the whole tree.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

fn capture_task(
    reader: Option<impl AsyncRead + Unpin + Send + 'static>,
    cap: usize,
    progress: Option<mpsc::Sender<String>>,
) -> Option<JoinHandle<TailBuffer>> {
    let reader = reader?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut tail = TailBuffer::new(cap);
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(tx) = &progress {
                let _ = tx.try_send(line.clone());
            }
            tail.push_line(line);
        }
        tail
    }))
}

async fn drain(task: Option<JoinHandle<TailBuffer>>) -> String {
    match task {
        Some(handle) => handle.await.map(|t| t.render()).unwrap_or_default(),
        None => String::new(),
    }
}

fn clear_slot(slot: &Option<PidSlot>) {
    if let Some(slot) = slot {
        *slot.lock().expect("pid slot poisoned") = None;
    }
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

/// Terminate the child's process group, escalating to a kill if it has not
/// exited within `grace`.
pub(crate) async fn terminate_tree(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, "-TERM").await;
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(?pid, "process ignored terminate; killing");
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_group(pid, "-KILL").await;
        }
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) {
    let _ = Command::new("kill")
        .args([signal, "--", &format!("-{pid}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

/// Bounded tail-of-stream line buffer. Oldest lines fall off once the byte
/// budget is exceeded; the rendered output notes how much was dropped.
#[derive(Debug)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    cap: usize,
    dropped_bytes: usize,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            cap,
            dropped_bytes: 0,
        }
    }

    pub fn push_line(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.cap && self.lines.len() > 1 {
            if let Some(front) = self.lines.pop_front() {
                self.bytes -= front.len() + 1;
                self.dropped_bytes += front.len() + 1;
            }
        }
    }

    pub fn render(&self) -> String {
        let body = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if self.dropped_bytes > 0 {
            format!("[... {} bytes dropped]\n{body}", self.dropped_bytes)
        } else {
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;

    fn sh(line: &str) -> CommandSpec {
        CommandSpec::shell_line(line)
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run(&sh("echo hello; exit 0"), Stage::Exec, ExecOptions::default())
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let out = run(
            &sh("echo oops >&2; exit 3"),
            Stage::Exec,
            ExecOptions::default(),
        )
        .await
        .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, 3);
        assert!(out.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn stdin_text_is_piped() {
        let spec = sh("cat").stdin_text("piped in");
        let out = run(&spec, Stage::Exec, ExecOptions::default()).await.unwrap();
        assert_eq!(out.stdout.trim(), "piped in");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let opts = ExecOptions {
            timeout: Some(Duration::from_millis(200)),
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        };
        let started = Instant::now();
        let err = run(&sh("sleep 10"), Stage::Exec, opts).await.unwrap_err();
        assert!(matches!(err, JobError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancel_kills_the_child() {
        let (handle, token) = cancel_pair();
        let opts = ExecOptions {
            cancel: token,
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });
        let err = run(&sh("sleep 10"), Stage::Exec, opts).await.unwrap_err();
        assert!(matches!(err, JobError::Canceled));
    }

    #[tokio::test]
    async fn progress_lines_are_forwarded() {
        let (tx, mut rx) = mpsc::channel(16);
        let opts = ExecOptions {
            progress: Some(tx),
            ..Default::default()
        };
        let out = run(&sh("echo one; echo two"), Stage::Exec, opts)
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn pid_slot_is_cleared_after_exit() {
        let slot: PidSlot = Arc::default();
        let opts = ExecOptions {
            pid_slot: Some(slot.clone()),
            ..Default::default()
        };
        run(&sh("true"), Stage::Exec, opts).await.unwrap();
        assert!(slot.lock().unwrap().is_none());
    }

    #[test]
    fn tail_buffer_drops_oldest() {
        let mut tail = TailBuffer::new(16);
        tail.push_line("aaaaaaa".into());
        tail.push_line("bbbbbbb".into());
        tail.push_line("ccccccc".into());
        let rendered = tail.render();
        assert!(rendered.contains("ccccccc"));
        assert!(!rendered.contains("aaaaaaa"));
        assert!(rendered.contains("bytes dropped"));
    }

    #[test]
    fn tail_buffer_keeps_everything_under_cap() {
        let mut tail = TailBuffer::new(1024);
        tail.push_line("one".into());
        tail.push_line("two".into());
        assert_eq!(tail.render(), "one\ntwo");
    }
}
