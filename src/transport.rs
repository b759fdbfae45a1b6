//! Transport seam — how results leave the scheduler.
//!
//! The chat platform (message delivery, file upload) lives behind this
//! trait. The core only knows how to hand it text, voice files, and
//! best-effort progress lines.

use std::path::Path;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TransportError;

/// Metadata threaded through every outbound delivery so the owning task can
/// be located later from message metadata alone.
#[derive(Debug, Clone, Default)]
pub struct EmitMeta {
    pub reply_to_message_id: Option<String>,
    pub worker_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub session_id: Option<String>,
}

/// Outbound delivery interface implemented by the chat-platform layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a finished result. Returns the platform message ids created.
    async fn emit(
        &self,
        chat_id: &str,
        text: &str,
        meta: &EmitMeta,
    ) -> Result<Vec<String>, TransportError>;

    /// Deliver a voice message from a local file.
    async fn emit_voice(
        &self,
        chat_id: &str,
        voice: &Path,
        meta: &EmitMeta,
    ) -> Result<Vec<String>, TransportError>;

    /// Best-effort streaming status line. Failures are swallowed by the
    /// implementation; the scheduler never retries progress.
    async fn emit_progress(&self, chat_id: &str, line: &str);
}

/// Transport that logs deliveries instead of sending them. Used by the
/// binary when no platform layer is wired in, and handy in tests.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn emit(
        &self,
        chat_id: &str,
        text: &str,
        _meta: &EmitMeta,
    ) -> Result<Vec<String>, TransportError> {
        tracing::info!(chat_id, len = text.len(), "emit: {}", snippet(text, 200));
        Ok(vec![Uuid::new_v4().to_string()])
    }

    async fn emit_voice(
        &self,
        chat_id: &str,
        voice: &Path,
        _meta: &EmitMeta,
    ) -> Result<Vec<String>, TransportError> {
        tracing::info!(chat_id, voice = %voice.display(), "emit voice");
        Ok(vec![Uuid::new_v4().to_string()])
    }

    async fn emit_progress(&self, chat_id: &str, line: &str) {
        tracing::debug!(chat_id, "progress: {line}");
    }
}

/// First `max` characters of `s`, on a char boundary.
pub fn snippet(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}…")
    }
}
