//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of workers (the general worker counts toward this).
    pub max_workers: usize,
    /// Global soft cap on queued jobs across all lanes.
    pub max_queued_jobs: usize,
    /// Default hard deadline applied to each task (None = unlimited).
    pub task_deadline: Option<Duration>,
    /// Grace period between terminate and kill when stopping a process tree.
    pub kill_grace: Duration,
    /// Maximum bytes of stdout/stderr retained per process run.
    pub max_capture_bytes: usize,
    /// Per-stage execution timeouts (None = no stage-level limit).
    pub stage_timeouts: StageTimeouts,
    /// Per-stage retry budgets.
    pub retries: RetryBudgets,
    /// Base delay for stage retry backoff.
    pub retry_base_delay: Duration,
    /// Cap for stage retry backoff.
    pub retry_max_delay: Duration,
    /// Task ledger retention.
    pub retention: RetentionConfig,
    /// Scratch directory for synthesized audio files.
    pub media_dir: PathBuf,
    /// Fall back to the one-shot helper when a keepalive backend is busy
    /// or unavailable.
    pub legacy_fallback: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 6,
            max_queued_jobs: 32,
            task_deadline: Some(Duration::from_secs(600)),
            kill_grace: Duration::from_secs(5),
            max_capture_bytes: 64 * 1024,
            stage_timeouts: StageTimeouts::default(),
            retries: RetryBudgets::default(),
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(15),
            retention: RetentionConfig::default(),
            media_dir: std::env::temp_dir().join("ai-dispatch"),
            legacy_fallback: true,
        }
    }
}

impl DispatchConfig {
    /// Build a config from `AI_DISPATCH_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_usize("AI_DISPATCH_MAX_WORKERS") {
            cfg.max_workers = v;
        }
        if let Some(v) = env_usize("AI_DISPATCH_MAX_QUEUED") {
            cfg.max_queued_jobs = v;
        }
        if let Some(v) = env_secs("AI_DISPATCH_TASK_DEADLINE_SECS") {
            // 0 means "no deadline at this layer".
            cfg.task_deadline = (!v.is_zero()).then_some(v);
        }
        if let Some(v) = env_secs("AI_DISPATCH_KILL_GRACE_SECS") {
            cfg.kill_grace = v;
        }
        if let Some(v) = env_usize("AI_DISPATCH_TASK_RETENTION_COUNT") {
            cfg.retention.max_per_chat = v;
        }
        if let Some(v) = env_secs("AI_DISPATCH_TASK_RETENTION_TTL_SECS") {
            cfg.retention.ttl = v;
        }
        if let Ok(dir) = std::env::var("AI_DISPATCH_MEDIA_DIR") {
            cfg.media_dir = PathBuf::from(dir);
        }
        cfg
    }
}

/// Stage-level timeouts. `None` means no limit at that layer; the job's
/// hard deadline still applies.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    pub exec: Option<Duration>,
    pub transcribe: Option<Duration>,
    pub synthesize: Option<Duration>,
    pub encode: Option<Duration>,
    pub upload: Option<Duration>,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            exec: Some(Duration::from_secs(300)),
            transcribe: Some(Duration::from_secs(120)),
            synthesize: Some(Duration::from_secs(120)),
            encode: Some(Duration::from_secs(60)),
            upload: Some(Duration::from_secs(60)),
        }
    }
}

/// Per-stage retry budgets.
///
/// Upload defaults to zero: re-sending a voice message is user-visible, so
/// duplicates are worse than a clean failure.
#[derive(Debug, Clone)]
pub struct RetryBudgets {
    pub exec: u32,
    pub transcribe: u32,
    pub synthesize: u32,
    pub encode: u32,
    pub upload: u32,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            exec: 0,
            transcribe: 1,
            synthesize: 2,
            encode: 1,
            upload: 0,
        }
    }
}

/// Task ledger retention bounds. Oldest entries are evicted first once
/// either bound is exceeded.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Maximum retained tasks per chat.
    pub max_per_chat: usize,
    /// Maximum task age.
    pub ttl: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_per_chat: 200,
            ttl: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_secs(key: &str) -> Option<Duration> {
    let secs: u64 = std::env::var(key).ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DispatchConfig::default();
        assert!(cfg.max_workers >= 2);
        assert!(cfg.max_queued_jobs > 0);
        assert_eq!(cfg.retries.upload, 0);
        assert!(cfg.retention.max_per_chat > 0);
    }
}
