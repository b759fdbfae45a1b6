//! Task ledger operations: create, patch, retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::error::{Error, TaskError};
use crate::persist::StateHandle;
use crate::task::model::{Task, TaskPatch, TaskSeed, TaskStatus};

/// Ledger over the durable task map. Status moves only forward; retention
/// evicts the oldest finished entries per chat once either bound (count or
/// TTL) is exceeded.
pub struct TaskLedger {
    state: Arc<StateHandle>,
    retention: RetentionConfig,
}

impl TaskLedger {
    pub fn new(state: Arc<StateHandle>, retention: RetentionConfig) -> Self {
        Self { state, retention }
    }

    /// Create a task at enqueue time, before any job is scheduled. The
    /// returned id is threaded through the job and outbound metadata so the
    /// task can be found even after the job is gone.
    pub async fn create(&self, seed: TaskSeed) -> Result<Task, Error> {
        let task = Task::new(seed);
        let created = task.clone();
        let retention = self.retention.clone();
        self.state
            .mutate(|s| {
                let chat_id = task.chat_id.clone();
                s.tasks.insert(task.id, task);
                evict_chat(&mut s.tasks, &chat_id, &retention);
            })
            .await
            .map_err(Error::Persist)?;
        Ok(created)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task, Error> {
        self.state
            .read(|s| s.tasks.get(&id).cloned())
            .await
            .ok_or_else(|| TaskError::NotFound { id }.into())
    }

    /// Apply a partial update. A backward status move is a programming
    /// error and is rejected, never applied.
    pub async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<Task, Error> {
        let updated = self
            .state
            .mutate(|s| {
                let Some(task) = s.tasks.get_mut(&id) else {
                    return Err(TaskError::NotFound { id });
                };

                if let Some(target) = patch.status {
                    if !task.status.can_transition_to(target) {
                        return Err(TaskError::InvalidTransition {
                            id,
                            from: task.status.to_string(),
                            to: target.to_string(),
                        });
                    }
                    task.status = target;
                    let now = Utc::now();
                    match target {
                        TaskStatus::Running if task.started_at.is_none() => {
                            task.started_at = Some(now);
                        }
                        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled => {
                            task.completed_at = Some(now);
                        }
                        _ => {}
                    }
                }
                if let Some(success) = patch.success {
                    task.success = Some(success);
                }
                if let Some(session) = patch.session_id.clone() {
                    task.session_id = Some(session);
                }
                if let Some(snippet) = patch.output_snippet.clone() {
                    task.output_snippet = Some(snippet);
                }
                task.output_message_ids
                    .extend(patch.output_message_ids.iter().cloned());
                task.updated_at = Utc::now();
                Ok(task.clone())
            })
            .await
            .map_err(Error::Persist)??;
        Ok(updated)
    }

    /// Tasks for a chat, newest first.
    pub async fn list_for_chat(&self, chat_id: &str) -> Vec<Task> {
        let mut tasks = self
            .state
            .read(|s| {
                s.tasks
                    .values()
                    .filter(|t| t.chat_id == chat_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await;
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub async fn count(&self) -> usize {
        self.state.read(|s| s.tasks.len()).await
    }

    /// Drop entries past the TTL across all chats. Returns how many were
    /// evicted.
    pub async fn sweep(&self) -> Result<usize, Error> {
        let retention = self.retention.clone();
        self.state
            .mutate(|s| {
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(retention.ttl)
                        .unwrap_or_else(|_| chrono::Duration::days(3650));
                let stale: Vec<Uuid> = s
                    .tasks
                    .values()
                    .filter(|t| t.status.is_terminal() && t.created_at < cutoff)
                    .map(|t| t.id)
                    .collect();
                let evicted = stale.len();
                for id in stale {
                    s.tasks.remove(&id);
                }
                evicted
            })
            .await
            .map_err(Error::Persist)
    }
}

/// Enforce per-chat retention: oldest finished entries go first once the
/// count bound or the TTL is exceeded. Queued/running tasks are never
/// evicted — they still have a job attached.
fn evict_chat(
    tasks: &mut std::collections::HashMap<Uuid, Task>,
    chat_id: &str,
    retention: &RetentionConfig,
) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(retention.ttl).unwrap_or_else(|_| chrono::Duration::days(3650));

    let mut finished: Vec<(Uuid, chrono::DateTime<Utc>)> = tasks
        .values()
        .filter(|t| t.chat_id == chat_id && t.status.is_terminal())
        .map(|t| (t.id, t.created_at))
        .collect();
    finished.sort_by_key(|(_, created)| *created);

    let total = tasks.values().filter(|t| t.chat_id == chat_id).count();
    let mut over_count = total.saturating_sub(retention.max_per_chat);

    for (id, created) in finished {
        let expired = created < cutoff;
        if over_count == 0 && !expired {
            break;
        }
        tasks.remove(&id);
        over_count = over_count.saturating_sub(1);
    }
}

/// Periodic TTL sweep, mirroring the ledger's inline eviction for chats
/// that have gone quiet.
pub fn spawn_retention_sweep(
    ledger: Arc<TaskLedger>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match ledger.sweep().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(evicted = n, "task retention sweep"),
                Err(e) => tracing::warn!("task retention sweep failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::task::model::TaskSource;

    fn seed(chat: &str) -> TaskSeed {
        TaskSeed {
            chat_id: chat.into(),
            worker_id: None,
            source: TaskSource::Chat,
            prompt_snippet: "hello".into(),
            session_id: None,
            origin_message_id: None,
            reply_to_message_id: None,
            split_group_id: None,
        }
    }

    async fn ledger(retention: RetentionConfig) -> TaskLedger {
        let state = StateHandle::load(Box::new(MemoryStore::default()))
            .await
            .unwrap();
        TaskLedger::new(Arc::new(state), retention)
    }

    #[tokio::test]
    async fn create_then_get_roundtrips_seed_fields() {
        let ledger = ledger(RetentionConfig::default()).await;
        let mut s = seed("chat-1");
        s.origin_message_id = Some("m-77".into());
        s.reply_to_message_id = Some("m-77".into());
        let created = ledger.create(s).await.unwrap();

        let read = ledger.get(created.id).await.unwrap();
        assert_eq!(read.chat_id, "chat-1");
        assert_eq!(read.prompt_snippet, "hello");
        assert_eq!(read.origin_message_id.as_deref(), Some("m-77"));
        assert_eq!(read.status, TaskStatus::Queued);
        assert_eq!(read.created_at, created.created_at);
    }

    #[tokio::test]
    async fn status_moves_forward_only() {
        let ledger = ledger(RetentionConfig::default()).await;
        let task = ledger.create(seed("chat-1")).await.unwrap();

        ledger
            .update(task.id, TaskPatch::status(TaskStatus::Running))
            .await
            .unwrap();
        let done = ledger
            .update(
                task.id,
                TaskPatch::status(TaskStatus::Completed).with_success(true),
            )
            .await
            .unwrap();
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert_eq!(done.success, Some(true));

        let err = ledger
            .update(task.id, TaskPatch::status(TaskStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Task(TaskError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn queued_can_cancel_directly() {
        let ledger = ledger(RetentionConfig::default()).await;
        let task = ledger.create(seed("chat-1")).await.unwrap();
        let canceled = ledger
            .update(task.id, TaskPatch::status(TaskStatus::Canceled))
            .await
            .unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert!(canceled.started_at.is_none());
    }

    #[tokio::test]
    async fn message_ids_append() {
        let ledger = ledger(RetentionConfig::default()).await;
        let task = ledger.create(seed("chat-1")).await.unwrap();
        ledger
            .update(
                task.id,
                TaskPatch::default().with_message_ids(vec!["a".into()]),
            )
            .await
            .unwrap();
        let updated = ledger
            .update(
                task.id,
                TaskPatch::default().with_message_ids(vec!["b".into()]),
            )
            .await
            .unwrap();
        assert_eq!(updated.output_message_ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn count_bound_evicts_oldest_finished_first() {
        let retention = RetentionConfig {
            max_per_chat: 3,
            ttl: Duration::from_secs(3600),
        };
        let ledger = ledger(retention).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            let t = ledger.create(seed("chat-1")).await.unwrap();
            ledger
                .update(t.id, TaskPatch::status(TaskStatus::Canceled))
                .await
                .unwrap();
            ids.push(t.id);
            // Distinct created_at ordering.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // A fourth task pushes the chat over the bound; the oldest goes.
        ledger.create(seed("chat-1")).await.unwrap();
        assert_eq!(ledger.count().await, 3);
        assert!(ledger.get(ids[0]).await.is_err(), "oldest should be gone");
        assert!(ledger.get(ids[1]).await.is_ok());
    }

    #[tokio::test]
    async fn active_tasks_survive_count_pressure() {
        let retention = RetentionConfig {
            max_per_chat: 1,
            ttl: Duration::from_secs(3600),
        };
        let ledger = ledger(retention).await;

        let active = ledger.create(seed("chat-1")).await.unwrap();
        ledger
            .update(active.id, TaskPatch::status(TaskStatus::Running))
            .await
            .unwrap();
        ledger.create(seed("chat-1")).await.unwrap();

        // Over the bound, but the running task must not be evicted.
        assert!(ledger.get(active.id).await.is_ok());
    }

    #[tokio::test]
    async fn ttl_sweep_evicts_only_expired() {
        let retention = RetentionConfig {
            max_per_chat: 100,
            ttl: Duration::from_millis(50),
        };
        let ledger = ledger(retention).await;
        let t = ledger.create(seed("chat-1")).await.unwrap();
        ledger
            .update(t.id, TaskPatch::status(TaskStatus::Canceled))
            .await
            .unwrap();

        assert_eq!(ledger.sweep().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(ledger.sweep().await.unwrap(), 1);
        assert_eq!(ledger.count().await, 0);
    }

    #[tokio::test]
    async fn retention_is_per_chat() {
        let retention = RetentionConfig {
            max_per_chat: 1,
            ttl: Duration::from_secs(3600),
        };
        let ledger = ledger(retention).await;
        for chat in ["a", "b", "c"] {
            let t = ledger.create(seed(chat)).await.unwrap();
            ledger
                .update(t.id, TaskPatch::status(TaskStatus::Canceled))
                .await
                .unwrap();
        }
        assert_eq!(ledger.count().await, 3, "bounds apply per chat, not globally");
    }
}
