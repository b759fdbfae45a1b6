//! Lanes — single-concurrency FIFO job queues.
//!
//! One lane per worker plus two fixed singleton lanes for the keepalive
//! backed kinds. A lane holds at most one running job; lanes never block
//! each other.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use crate::error::QueueError;
use crate::scheduler::job::{Job, JobHandle};

/// Identity of a lane.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LaneId {
    Worker(Uuid),
    Synthesis,
    Transcription,
}

impl std::fmt::Display for LaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker(id) => write!(f, "worker:{id}"),
            Self::Synthesis => write!(f, "synthesis"),
            Self::Transcription => write!(f, "transcription"),
        }
    }
}

#[derive(Debug, Default)]
struct LaneInner {
    queue: VecDeque<Job>,
    current: Option<Arc<JobHandle>>,
    closed: bool,
}

/// What happened to a cancel request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The job was still queued; it has been removed. The caller settles
    /// its task.
    Dequeued(Job),
    /// The job is running; it has been signalled.
    Signaled,
    NotFound,
}

/// A FIFO queue plus the current-job slot.
pub struct Lane {
    pub id: LaneId,
    inner: Mutex<LaneInner>,
    notify: Notify,
}

impl Lane {
    pub fn new(id: LaneId) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(LaneInner::default()),
            notify: Notify::new(),
        })
    }

    /// Queue a job. Strict FIFO except that interactive (voice-reply) jobs
    /// are inserted ahead of queued non-interactive work, behind jobs that
    /// are already interactive. Returns the queue position.
    pub async fn enqueue(&self, job: Job) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(QueueError::LaneClosed {
                lane: self.id.to_string(),
            });
        }
        let position = if job.kind.is_interactive() {
            let at = inner
                .queue
                .iter()
                .position(|queued| !queued.kind.is_interactive())
                .unwrap_or(inner.queue.len());
            inner.queue.insert(at, job);
            at
        } else {
            inner.queue.push_back(job);
            inner.queue.len() - 1
        };
        drop(inner);
        self.notify.notify_one();
        Ok(position)
    }

    /// Pop the next job and mark it current. `None` when the queue is
    /// empty or the lane is closed.
    pub async fn take_next(&self) -> Option<Job> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return None;
        }
        let job = inner.queue.pop_front()?;
        inner.current = Some(job.handle.clone());
        Some(job)
    }

    /// Clear the current-job slot once the runner is done with it.
    pub async fn finish_current(&self) {
        self.inner.lock().await.current = None;
    }

    /// Cancel one job by id, queued or running.
    pub async fn cancel(&self, job_id: Uuid) -> CancelOutcome {
        let mut inner = self.inner.lock().await;
        if let Some(at) = inner.queue.iter().position(|j| j.id == job_id) {
            if let Some(job) = inner.queue.remove(at) {
                job.handle.request_cancel();
                return CancelOutcome::Dequeued(job);
            }
        }
        if let Some(current) = &inner.current {
            if current.id == job_id {
                current.request_cancel();
                return CancelOutcome::Signaled;
            }
        }
        CancelOutcome::NotFound
    }

    /// Cancel everything belonging to a chat. Returns the dequeued jobs;
    /// a matching running job is signalled in place.
    pub async fn cancel_chat(&self, chat_id: &str) -> Vec<Job> {
        let mut inner = self.inner.lock().await;
        let mut dequeued = Vec::new();
        let mut keep = VecDeque::with_capacity(inner.queue.len());
        while let Some(job) = inner.queue.pop_front() {
            if job.chat_id == chat_id {
                job.handle.request_cancel();
                dequeued.push(job);
            } else {
                keep.push_back(job);
            }
        }
        inner.queue = keep;
        if let Some(current) = &inner.current {
            if current.chat_id == chat_id {
                current.request_cancel();
            }
        }
        dequeued
    }

    /// Close the lane: reject future enqueues, drain the queue, signal the
    /// running job. Returns the dequeued jobs for task settlement.
    pub async fn close(&self) -> Vec<Job> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        let dequeued: Vec<Job> = inner.queue.drain(..).collect();
        for job in &dequeued {
            job.handle.request_cancel();
        }
        if let Some(current) = &inner.current {
            current.request_cancel();
        }
        drop(inner);
        self.notify.notify_one();
        dequeued
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn is_idle(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.queue.is_empty() && inner.current.is_none()
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn current(&self) -> Option<Arc<JobHandle>> {
        self.inner.lock().await.current.clone()
    }

    /// Queued job ids, head first. For listings and tests.
    pub async fn queued_ids(&self) -> Vec<Uuid> {
        self.inner.lock().await.queue.iter().map(|j| j.id).collect()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// The live set of lanes.
#[derive(Default)]
pub struct Lanes {
    map: RwLock<HashMap<LaneId, Arc<Lane>>>,
}

impl Lanes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fetch a lane, creating it on first use. Returns `true` when the
    /// lane was just created and needs a drain loop.
    pub async fn get_or_create(&self, id: LaneId) -> (Arc<Lane>, bool) {
        let mut map = self.map.write().await;
        if let Some(lane) = map.get(&id) {
            return (lane.clone(), false);
        }
        let lane = Lane::new(id.clone());
        map.insert(id, lane.clone());
        (lane, true)
    }

    pub async fn get(&self, id: &LaneId) -> Option<Arc<Lane>> {
        self.map.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &LaneId) -> Option<Arc<Lane>> {
        self.map.write().await.remove(id)
    }

    pub async fn list(&self) -> Vec<Arc<Lane>> {
        self.map.read().await.values().cloned().collect()
    }

    /// Total queued jobs across all lanes (running jobs not counted).
    pub async fn total_queued(&self) -> usize {
        let lanes = self.list().await;
        join_all(lanes.iter().map(|lane| lane.queued_len()))
            .await
            .into_iter()
            .sum()
    }

    /// True only when every lane is simultaneously idle.
    pub async fn all_idle(&self) -> bool {
        let lanes = self.list().await;
        join_all(lanes.iter().map(|lane| lane.is_idle()))
            .await
            .into_iter()
            .all(|idle| idle)
    }
}
