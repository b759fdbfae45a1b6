//! Worker model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of execution context a worker represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// The singleton default worker. Never removed.
    General,
    /// A repository-bound worker created by the user.
    Repo,
}

/// A named execution context: an identity plus a working directory that
/// jobs run against. Owned by the registry; lanes reference it by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub kind: WorkerKind,
    /// Unique, case-insensitive display name.
    pub display_name: String,
    /// Free-form title shown to the user.
    pub title: String,
    /// Directory jobs execute in.
    pub workdir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(kind: WorkerKind, display_name: String, title: String, workdir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            display_name,
            title,
            workdir,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Record that a job was enqueued against this worker.
    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }

    pub fn is_general(&self) -> bool {
        self.kind == WorkerKind::General
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_bumps_last_used() {
        let mut w = Worker::new(
            WorkerKind::Repo,
            "amber".into(),
            "Amber".into(),
            PathBuf::from("/tmp"),
        );
        let before = w.last_used_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        w.touch();
        assert!(w.last_used_at > before);
    }

    #[test]
    fn serde_roundtrip() {
        let w = Worker::new(
            WorkerKind::General,
            "basil".into(),
            "Basil".into(),
            PathBuf::from("/srv/repo"),
        );
        let json = serde_json::to_string(&w).unwrap();
        let parsed: Worker = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, w.id);
        assert_eq!(parsed.kind, WorkerKind::General);
        assert_eq!(parsed.workdir, PathBuf::from("/srv/repo"));
    }
}
