//! Worker registry — the named, capacity-bounded set of execution contexts.
//!
//! Owns the worker map plus the chat→worker and chat+worker→session maps,
//! all durable through the shared [`StateHandle`].

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, RegistryError};
use crate::persist::StateHandle;
use crate::worker::{Worker, WorkerKind};

/// Curated pool of worker display names. Numbered variants (`amber-2`) are
/// used once the pool is taken, then a timestamp fallback.
const NAME_POOL: &[&str] = &[
    "amber", "basil", "cedar", "delta", "ember", "fable", "garnet", "hazel", "indigo", "juniper",
    "kepler", "lumen", "maple", "nova", "onyx", "pepper", "quartz", "rowan", "sable", "tango",
    "umber", "vesper", "willow", "xenon", "yarrow", "zephyr",
];

/// Registry over the durable worker set.
pub struct WorkerRegistry {
    state: Arc<StateHandle>,
    max_workers: usize,
}

impl WorkerRegistry {
    pub fn new(state: Arc<StateHandle>, max_workers: usize) -> Self {
        Self { state, max_workers }
    }

    /// Make sure the singleton general worker exists, creating it on first
    /// startup. Returns it either way.
    pub async fn ensure_general(&self, workdir: &Path, title: &str) -> Result<Worker, Error> {
        if let Some(existing) = self
            .state
            .read(|s| s.workers.values().find(|w| w.is_general()).cloned())
            .await
        {
            return Ok(existing);
        }

        let name = self.free_name().await;
        let workdir = tokio::fs::canonicalize(workdir)
            .await
            .unwrap_or_else(|_| workdir.to_path_buf());
        let worker = Worker::new(WorkerKind::General, name, title.to_string(), workdir);
        let created = worker.clone();
        self.state
            .mutate(|s| {
                s.workers.insert(worker.id, worker);
            })
            .await
            .map_err(Error::Persist)?;
        tracing::info!(worker = %created.display_name, "created general worker");
        Ok(created)
    }

    /// Create a repo worker for `workdir`, or return the existing worker
    /// already bound to the same (canonicalized) path.
    pub async fn create_worker(&self, workdir: &Path, title: &str) -> Result<Worker, Error> {
        let canonical = tokio::fs::canonicalize(workdir)
            .await
            .map_err(|_| RegistryError::WorkdirNotFound {
                path: workdir.display().to_string(),
            })?;
        let key = path_key(&canonical);

        if let Some(existing) = self
            .state
            .read(|s| {
                s.workers
                    .values()
                    .find(|w| path_key(&w.workdir) == key)
                    .cloned()
            })
            .await
        {
            return Ok(existing);
        }

        let count = self.state.read(|s| s.workers.len()).await;
        if count >= self.max_workers {
            return Err(RegistryError::CapacityExceeded {
                max: self.max_workers,
            }
            .into());
        }

        let name = self.free_name().await;
        let worker = Worker::new(WorkerKind::Repo, name, title.to_string(), canonical);
        let created = worker.clone();
        self.state
            .mutate(|s| {
                s.workers.insert(worker.id, worker);
            })
            .await
            .map_err(Error::Persist)?;
        tracing::info!(
            worker = %created.display_name,
            workdir = %created.workdir.display(),
            "created worker"
        );
        Ok(created)
    }

    /// Remove a worker. The general worker is protected; an unknown id is a
    /// no-op error, never a crash. Chats pointing at the retired worker are
    /// re-pointed to the general worker and its CLI sessions are dropped.
    ///
    /// The caller (scheduler) is responsible for closing the worker's lane.
    pub async fn retire_worker(&self, id: Uuid) -> Result<Worker, Error> {
        let general = self.general().await?;
        let removed = self
            .state
            .mutate(|s| {
                let worker = s.workers.get(&id).cloned();
                let Some(worker) = worker else {
                    return Err(RegistryError::NotFound {
                        token: id.to_string(),
                    });
                };
                if worker.is_general() {
                    return Err(RegistryError::GeneralWorkerProtected);
                }
                s.workers.remove(&id);
                for target in s.chat_workers.values_mut() {
                    if *target == id {
                        *target = general.id;
                    }
                }
                for sessions in s.sessions.values_mut() {
                    sessions.remove(&id);
                }
                Ok(worker)
            })
            .await
            .map_err(Error::Persist)??;
        tracing::info!(worker = %removed.display_name, "retired worker");
        Ok(removed)
    }

    /// Resolve user input to a worker: exact id, exact title, exact display
    /// name, workdir basename, then a unique substring match over
    /// name/title/workdir. Ambiguous matches are a miss, not a guess.
    pub async fn resolve(&self, token: &str) -> Result<Worker, Error> {
        let token = token.trim();
        let not_found = || RegistryError::NotFound {
            token: token.to_string(),
        };
        if token.is_empty() {
            return Err(not_found().into());
        }
        let needle = token.to_lowercase();

        self.state
            .read(|s| {
                let workers: Vec<&Worker> = s.workers.values().collect();

                if let Ok(id) = token.parse::<Uuid>() {
                    if let Some(w) = workers.iter().find(|w| w.id == id) {
                        return Ok((*w).clone());
                    }
                }
                if let Some(w) = workers.iter().find(|w| w.title == token) {
                    return Ok((*w).clone());
                }
                if let Some(w) = workers
                    .iter()
                    .find(|w| w.display_name.eq_ignore_ascii_case(token))
                {
                    return Ok((*w).clone());
                }
                if let Some(w) = workers.iter().find(|w| {
                    w.workdir
                        .file_name()
                        .map(|n| n.to_string_lossy().eq_ignore_ascii_case(token))
                        .unwrap_or(false)
                }) {
                    return Ok((*w).clone());
                }

                let matches: Vec<&&Worker> = workers
                    .iter()
                    .filter(|w| {
                        w.display_name.to_lowercase().contains(&needle)
                            || w.title.to_lowercase().contains(&needle)
                            || w.workdir.to_string_lossy().to_lowercase().contains(&needle)
                    })
                    .collect();
                match matches.as_slice() {
                    [only] => Ok((**only).clone()),
                    _ => Err(not_found()),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get(&self, id: Uuid) -> Result<Worker, Error> {
        self.state
            .read(|s| s.workers.get(&id).cloned())
            .await
            .ok_or_else(|| {
                RegistryError::NotFound {
                    token: id.to_string(),
                }
                .into()
            })
    }

    /// The singleton general worker. Missing only before `ensure_general`.
    pub async fn general(&self) -> Result<Worker, Error> {
        self.state
            .read(|s| s.workers.values().find(|w| w.is_general()).cloned())
            .await
            .ok_or_else(|| {
                RegistryError::NotFound {
                    token: "general".to_string(),
                }
                .into()
            })
    }

    /// All workers, oldest first.
    pub async fn list(&self) -> Vec<Worker> {
        let mut workers = self.state.read(|s| s.workers.values().cloned().collect::<Vec<_>>()).await;
        workers.sort_by_key(|w| w.created_at);
        workers
    }

    pub async fn count(&self) -> usize {
        self.state.read(|s| s.workers.len()).await
    }

    /// Record job activity against a worker.
    pub async fn touch(&self, id: Uuid) -> Result<(), Error> {
        self.state
            .mutate(|s| {
                if let Some(w) = s.workers.get_mut(&id) {
                    w.touch();
                }
            })
            .await
            .map_err(Error::Persist)
    }

    // ── Chat ↔ worker / session maps ───────────────────────────────

    /// Worker a chat is currently talking to (general if unset).
    pub async fn active_worker_for(&self, chat_id: &str) -> Result<Worker, Error> {
        let id = self
            .state
            .read(|s| s.chat_workers.get(chat_id).copied())
            .await;
        match id {
            Some(id) => match self.get(id).await {
                Ok(w) => Ok(w),
                // Stale pointer: fall back to general.
                Err(_) => self.general().await,
            },
            None => self.general().await,
        }
    }

    pub async fn set_active_worker(&self, chat_id: &str, worker_id: Uuid) -> Result<(), Error> {
        self.state
            .mutate(|s| {
                s.chat_workers.insert(chat_id.to_string(), worker_id);
            })
            .await
            .map_err(Error::Persist)
    }

    pub async fn session_for(&self, chat_id: &str, worker_id: Uuid) -> Option<String> {
        self.state
            .read(|s| {
                s.sessions
                    .get(chat_id)
                    .and_then(|m| m.get(&worker_id))
                    .cloned()
            })
            .await
    }

    pub async fn set_session(
        &self,
        chat_id: &str,
        worker_id: Uuid,
        session: String,
    ) -> Result<(), Error> {
        self.state
            .mutate(|s| {
                s.sessions
                    .entry(chat_id.to_string())
                    .or_default()
                    .insert(worker_id, session);
            })
            .await
            .map_err(Error::Persist)
    }

    async fn free_name(&self) -> String {
        let taken: Vec<String> = self
            .state
            .read(|s| {
                s.workers
                    .values()
                    .map(|w| w.display_name.to_lowercase())
                    .collect()
            })
            .await;
        let is_free = |name: &str| !taken.iter().any(|t| t == &name.to_lowercase());

        for name in NAME_POOL {
            if is_free(name) {
                return (*name).to_string();
            }
        }
        for n in 2..=9 {
            for name in NAME_POOL {
                let candidate = format!("{name}-{n}");
                if is_free(&candidate) {
                    return candidate;
                }
            }
        }
        format!("worker-{}", Utc::now().timestamp())
    }
}

/// Canonical comparison key for a workdir: lossy string, lowercased,
/// separators normalized.
fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase().replace('\\', "/")
}
