//! Opaque process specifications supplied by the command-builder collaborator.
//!
//! The scheduler core never knows how to talk to a particular CLI or helper
//! script; it hands a job to a [`CommandBuilder`] and gets back a
//! [`CommandSpec`] it can spawn, stream, and kill.

use std::path::{Path, PathBuf};

use crate::worker::Worker;

/// Everything needed to spawn one external process.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to run (ignored when `shell` is set and the command is the
    /// first arg).
    pub bin: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Run through `sh -c` (or `cmd /C` on Windows) instead of directly.
    pub shell: bool,
    /// Text piped to the child's stdin, if any.
    pub stdin_text: Option<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            args: Vec::new(),
            cwd: None,
            shell: false,
            stdin_text: None,
            env: Vec::new(),
        }
    }

    /// A `sh -c` style command line.
    pub fn shell_line(command: impl Into<String>) -> Self {
        let mut spec = Self::new(command);
        spec.shell = true;
        spec
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin_text(mut self, text: impl Into<String>) -> Self {
        self.stdin_text = Some(text.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Builds the concrete process invocation for each job kind.
///
/// Implementations are deterministic formatting only — no I/O, no state.
pub trait CommandBuilder: Send + Sync {
    /// CLI invocation of the assistant for a prompt, resuming `session` if
    /// one exists for this chat+worker.
    fn exec(&self, worker: &Worker, prompt: &str, session: Option<&str>) -> CommandSpec;

    /// A raw user-supplied command line run in the worker's directory.
    fn raw(&self, worker: &Worker, command: &str) -> CommandSpec;

    /// One-shot speech synthesis of `text` into `out_wav`.
    fn synthesize(&self, text: &str, out_wav: &Path) -> CommandSpec;

    /// One-shot batch synthesis. Chunks are piped as JSONL on stdin and
    /// written to `<out_base>-000.wav`, `<out_base>-001.wav`, ...
    fn synthesize_batch(&self, chunks: &[String], out_base: &Path) -> CommandSpec;

    /// One-shot transcription of a local audio file; the transcript is the
    /// process's stdout.
    fn transcribe(&self, audio: &Path) -> CommandSpec;

    /// Encode a WAV into the voice-message container expected by the chat
    /// platform.
    fn encode(&self, wav: &Path, out: &Path) -> CommandSpec;
}

/// Default builder wired to the bundled helper scripts.
#[derive(Debug, Clone)]
pub struct HelperScripts {
    /// Assistant CLI binary.
    pub assistant_bin: String,
    /// Synthesis helper script path.
    pub synthesize_script: PathBuf,
    /// Transcription helper script path.
    pub transcribe_script: PathBuf,
    /// Python interpreter for the helper scripts.
    pub python_bin: String,
    /// Optional `.env` file handed to the synthesis helper.
    pub env_file: Option<PathBuf>,
    /// Whisper model name for one-shot transcription.
    pub whisper_model: String,
}

impl HelperScripts {
    pub fn from_env() -> Self {
        Self {
            assistant_bin: std::env::var("AI_DISPATCH_ASSISTANT_BIN")
                .unwrap_or_else(|_| "claude".to_string()),
            synthesize_script: std::env::var("AI_DISPATCH_TTS_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("scripts/tts_synthesize.py")),
            transcribe_script: std::env::var("AI_DISPATCH_STT_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("scripts/whisper_transcribe.py")),
            python_bin: std::env::var("AI_DISPATCH_PYTHON").unwrap_or_else(|_| "python3".into()),
            env_file: std::env::var("AI_DISPATCH_ENV_FILE").ok().map(PathBuf::from),
            whisper_model: std::env::var("AI_DISPATCH_WHISPER_MODEL")
                .unwrap_or_else(|_| "base".into()),
        }
    }
}

impl CommandBuilder for HelperScripts {
    fn exec(&self, worker: &Worker, prompt: &str, session: Option<&str>) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.assistant_bin)
            .arg("-p")
            .cwd(&worker.workdir)
            .stdin_text(prompt);
        if let Some(id) = session {
            spec = spec.args(["--resume", id]);
        }
        spec
    }

    fn raw(&self, worker: &Worker, command: &str) -> CommandSpec {
        CommandSpec::shell_line(command).cwd(&worker.workdir)
    }

    fn synthesize(&self, text: &str, out_wav: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.python_bin)
            .arg(self.synthesize_script.to_string_lossy())
            .args(["--out-wav".into(), out_wav.to_string_lossy().into_owned()])
            .stdin_text(text);
        if let Some(env_file) = &self.env_file {
            spec = spec.args(["--env-file".into(), env_file.to_string_lossy().into_owned()]);
        }
        spec
    }

    fn synthesize_batch(&self, chunks: &[String], out_base: &Path) -> CommandSpec {
        let jsonl: String = chunks
            .iter()
            .map(|text| format!("{}\n", serde_json::json!({ "text": text })))
            .collect();
        let mut spec = CommandSpec::new(&self.python_bin)
            .arg(self.synthesize_script.to_string_lossy())
            .arg("--batch-jsonl")
            .args([
                "--out-wav-base".into(),
                out_base.to_string_lossy().into_owned(),
            ])
            .stdin_text(jsonl);
        if let Some(env_file) = &self.env_file {
            spec = spec.args(["--env-file".into(), env_file.to_string_lossy().into_owned()]);
        }
        spec
    }

    fn transcribe(&self, audio: &Path) -> CommandSpec {
        CommandSpec::new(&self.python_bin)
            .arg(self.transcribe_script.to_string_lossy())
            .args(["--audio".into(), audio.to_string_lossy().into_owned()])
            .args(["--model".into(), self.whisper_model.clone()])
    }

    fn encode(&self, wav: &Path, out: &Path) -> CommandSpec {
        CommandSpec::new("ffmpeg")
            .args(["-y", "-i"])
            .arg(wav.to_string_lossy())
            .args(["-c:a", "libopus", "-b:a", "32k", "-application", "voip"])
            .arg(out.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerKind;

    fn worker() -> Worker {
        Worker::new(
            WorkerKind::Repo,
            "amber".into(),
            "Amber".into(),
            PathBuf::from("/srv/repo"),
        )
    }

    fn builder() -> HelperScripts {
        HelperScripts {
            assistant_bin: "claude".into(),
            synthesize_script: PathBuf::from("/opt/tts.py"),
            transcribe_script: PathBuf::from("/opt/stt.py"),
            python_bin: "python3".into(),
            env_file: None,
            whisper_model: "base".into(),
        }
    }

    #[test]
    fn exec_resumes_session() {
        let spec = builder().exec(&worker(), "hello", Some("sess-1"));
        assert_eq!(spec.bin, "claude");
        assert!(spec.args.contains(&"--resume".to_string()));
        assert!(spec.args.contains(&"sess-1".to_string()));
        assert_eq!(spec.stdin_text.as_deref(), Some("hello"));
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/srv/repo")));
    }

    #[test]
    fn raw_runs_in_worker_dir_via_shell() {
        let spec = builder().raw(&worker(), "git status");
        assert!(spec.shell);
        assert_eq!(spec.bin, "git status");
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/srv/repo")));
    }

    #[test]
    fn batch_synthesis_pipes_jsonl() {
        let chunks = vec!["one".to_string(), "two".to_string()];
        let spec = builder().synthesize_batch(&chunks, Path::new("/tmp/reply"));
        let stdin = spec.stdin_text.unwrap();
        let lines: Vec<&str> = stdin.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["text"], "one");
        assert!(spec.args.contains(&"--batch-jsonl".to_string()));
    }

    #[test]
    fn transcribe_points_at_audio() {
        let spec = builder().transcribe(Path::new("/tmp/voice.ogg"));
        assert!(spec.args.contains(&"/tmp/voice.ogg".to_string()));
        assert!(spec.args.contains(&"base".to_string()));
    }
}
