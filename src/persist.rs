//! Persistence seam — atomic load/save of the durable subset of state.
//!
//! In-flight jobs and lane queues are never persisted; what survives a
//! restart is the worker set, the task ledger, and the chat↔worker/session
//! maps. The core saves after every mutation that must survive.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::PersistError;
use crate::task::Task;
use crate::worker::Worker;

/// The durable subset of scheduler state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub workers: HashMap<Uuid, Worker>,
    #[serde(default)]
    pub tasks: HashMap<Uuid, Task>,
    /// Chat → worker the chat is currently talking to.
    #[serde(default)]
    pub chat_workers: HashMap<String, Uuid>,
    /// Chat → worker → CLI session id.
    #[serde(default)]
    pub sessions: HashMap<String, HashMap<Uuid, String>>,
}

/// Storage backend. `load` runs once at startup; `save` must be atomic —
/// a crash mid-save leaves the previous state intact.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load(&self) -> Result<PersistedState, PersistError>;
    async fn save(&self, state: &PersistedState) -> Result<(), PersistError>;
}

/// JSON file backend. Saves write a sibling temp file and rename over the
/// target, so readers never observe a torn document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Persistence for JsonFileStore {
    async fn load(&self) -> Result<PersistedState, PersistError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-memory backend for tests and embedding without a state file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: std::sync::Mutex<PersistedState>,
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load(&self) -> Result<PersistedState, PersistError> {
        Ok(self.state.lock().expect("memory store poisoned").clone())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        *self.state.lock().expect("memory store poisoned") = state.clone();
        Ok(())
    }
}

/// Shared handle over the durable state: one in-memory copy guarded by a
/// lock, written through to the backend after every mutation.
pub struct StateHandle {
    state: RwLock<PersistedState>,
    backend: Box<dyn Persistence>,
}

impl StateHandle {
    /// Load once at startup.
    pub async fn load(backend: Box<dyn Persistence>) -> Result<Self, PersistError> {
        let state = backend.load().await?;
        Ok(Self {
            state: RwLock::new(state),
            backend,
        })
    }

    /// Read a view of the state.
    pub async fn read<R>(&self, f: impl FnOnce(&PersistedState) -> R) -> R {
        let state = self.state.read().await;
        f(&state)
    }

    /// Mutate the state and save it. The write lock is held across the
    /// save so concurrent mutations serialize and never lose updates.
    pub async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut PersistedState) -> R,
    ) -> Result<R, PersistError> {
        let mut state = self.state.write().await;
        let out = f(&mut state);
        self.backend.save(&state).await?;
        Ok(out)
    }
}
