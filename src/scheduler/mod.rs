//! The scheduler — lanes, job admission, cancellation, restart.
//!
//! One `Scheduler` instance owns all mutable scheduling state and is
//! constructed once at process start; every collaborator is passed in
//! explicitly through [`SchedulerDeps`].

pub mod job;
pub mod lane;
pub mod restart;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

pub use job::{Deadline, Job, JobHandle, JobKind};
pub use lane::{CancelOutcome, Lane, LaneId, Lanes};
pub use restart::{RESTART_EXIT_CODE, RestartAck, RestartCoordinator};
pub use runner::{JobRunner, RunnerDeps};

use crate::command::CommandBuilder;
use crate::config::DispatchConfig;
use crate::error::{Error, QueueError};
use crate::keepalive::KeepaliveClient;
use crate::task::{TaskLedger, TaskPatch, TaskSeed, TaskSource, TaskStatus};
use crate::transport::Transport;
use crate::worker::{Worker, WorkerRegistry};

/// Collaborators handed to the scheduler at construction.
pub struct SchedulerDeps {
    pub registry: Arc<WorkerRegistry>,
    pub ledger: Arc<TaskLedger>,
    pub commands: Arc<dyn CommandBuilder>,
    pub transport: Arc<dyn Transport>,
    pub tts: Option<Arc<KeepaliveClient>>,
    pub stt: Option<Arc<KeepaliveClient>>,
}

/// An inbound request resolved to a job kind, ready to schedule.
#[derive(Debug)]
pub struct EnqueueRequest {
    pub chat_id: String,
    pub kind: JobKind,
    /// Explicit worker override; defaults to the chat's active worker.
    pub worker: Option<Uuid>,
    pub source: TaskSource,
    pub origin_message_id: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub split_group_id: Option<Uuid>,
    /// Hard deadline override. `None` uses the configured default; zero
    /// means no deadline.
    pub deadline: Option<Duration>,
}

impl EnqueueRequest {
    pub fn new(chat_id: impl Into<String>, kind: JobKind, source: TaskSource) -> Self {
        Self {
            chat_id: chat_id.into(),
            kind,
            worker: None,
            source,
            origin_message_id: None,
            reply_to_message_id: None,
            split_group_id: None,
            deadline: None,
        }
    }
}

/// What the caller gets back from a successful enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    pub job_id: Uuid,
    pub task_id: Uuid,
    /// Position in the lane queue at enqueue time (0 = next up).
    pub position: usize,
}

/// Owns scheduling state: the lane set, the runner, and the restart
/// coordinator.
pub struct Scheduler {
    config: DispatchConfig,
    registry: Arc<WorkerRegistry>,
    ledger: Arc<TaskLedger>,
    lanes: Arc<Lanes>,
    runner: Arc<JobRunner>,
    coordinator: Arc<RestartCoordinator>,
    tts: Option<Arc<KeepaliveClient>>,
    stt: Option<Arc<KeepaliveClient>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Build the scheduler. The returned receiver resolves with the
    /// process exit code once a restart fires.
    pub fn new(
        config: DispatchConfig,
        deps: SchedulerDeps,
    ) -> (Arc<Self>, watch::Receiver<Option<i32>>) {
        let lanes = Lanes::new();
        let (coordinator, exit_rx) =
            RestartCoordinator::new(lanes.clone(), deps.transport.clone());
        let runner = JobRunner::new(
            config.clone(),
            RunnerDeps {
                registry: deps.registry.clone(),
                ledger: deps.ledger.clone(),
                commands: deps.commands,
                transport: deps.transport,
                tts: deps.tts.clone(),
                stt: deps.stt.clone(),
            },
        );
        let (shutdown_tx, _) = watch::channel(false);
        (
            Arc::new(Self {
                config,
                registry: deps.registry,
                ledger: deps.ledger,
                lanes,
                runner,
                coordinator,
                tts: deps.tts,
                stt: deps.stt,
                shutdown_tx,
            }),
            exit_rx,
        )
    }

    /// Admit a request: resolve its lane, create its task, queue its job.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<EnqueueReceipt, Error> {
        if self.lanes.total_queued().await >= self.config.max_queued_jobs {
            return Err(QueueError::QueueFull {
                cap: self.config.max_queued_jobs,
            }
            .into());
        }

        let (lane_id, worker) = match &req.kind {
            JobKind::Exec { .. } | JobKind::RawCommand { .. } => {
                let worker = match req.worker {
                    Some(id) => self.registry.get(id).await?,
                    None => self.registry.active_worker_for(&req.chat_id).await?,
                };
                (LaneId::Worker(worker.id), Some(worker))
            }
            JobKind::Synthesize { .. } | JobKind::SynthesizeBatch { .. } => {
                (LaneId::Synthesis, None)
            }
            JobKind::Transcribe { .. } => (LaneId::Transcription, None),
        };

        let worker_id = worker.as_ref().map(|w| w.id);
        if let Some(id) = worker_id {
            if let Err(e) = self.registry.touch(id).await {
                tracing::warn!(worker = %id, "failed to bump last_used: {e}");
            }
        }

        let session_id = match worker_id {
            Some(id) => self.registry.session_for(&req.chat_id, id).await,
            None => None,
        };

        let task = self
            .ledger
            .create(TaskSeed {
                chat_id: req.chat_id.clone(),
                worker_id,
                source: req.source,
                prompt_snippet: req.kind.prompt_snippet(),
                session_id,
                origin_message_id: req.origin_message_id,
                reply_to_message_id: req.reply_to_message_id,
                split_group_id: req.split_group_id,
            })
            .await?;

        let deadline = Deadline::within(req.deadline.or(self.config.task_deadline));
        let job = Job::new(req.chat_id, req.kind, worker_id, task.id, deadline);
        let job_id = job.id;

        let (lane, created) = self.lanes.get_or_create(lane_id).await;
        if created {
            self.spawn_drain(lane.clone());
        }
        let position = match lane.enqueue(job).await {
            Ok(position) => position,
            Err(e) => {
                // The lane closed under us (worker retired mid-flight):
                // settle the task we just created.
                let _ = self
                    .ledger
                    .update(task.id, TaskPatch::status(TaskStatus::Canceled))
                    .await;
                return Err(e.into());
            }
        };

        tracing::debug!(
            job = %job_id,
            task = %task.id,
            position,
            "job enqueued"
        );
        Ok(EnqueueReceipt {
            job_id,
            task_id: task.id,
            position,
        })
    }

    /// Cancel one job wherever it is. Queued jobs are removed and their
    /// task goes straight to canceled; running jobs are signalled and
    /// settle through the runner.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), Error> {
        for lane in self.lanes.list().await {
            match lane.cancel(job_id).await {
                CancelOutcome::Dequeued(job) => {
                    self.settle_canceled(vec![job]).await;
                    return Ok(());
                }
                CancelOutcome::Signaled => return Ok(()),
                CancelOutcome::NotFound => {}
            }
        }
        Err(QueueError::NotFound { id: job_id }.into())
    }

    /// Cancel everything a chat has in flight. Returns the number of jobs
    /// touched (queued removals plus signalled running jobs).
    pub async fn cancel_chat(&self, chat_id: &str) -> usize {
        let mut touched = 0;
        for lane in self.lanes.list().await {
            if let Some(current) = lane.current().await {
                if current.chat_id == chat_id {
                    touched += 1;
                }
            }
            let dequeued = lane.cancel_chat(chat_id).await;
            touched += dequeued.len();
            self.settle_canceled(dequeued).await;
        }
        touched
    }

    /// Retire a worker by user token: cancels its current job, drains its
    /// queue, removes its lane, and re-points chats to the general worker.
    pub async fn retire_worker(&self, token: &str) -> Result<Worker, Error> {
        let worker = self.registry.resolve(token).await?;
        let retired = self.registry.retire_worker(worker.id).await?;
        if let Some(lane) = self.lanes.remove(&LaneId::Worker(worker.id)).await {
            let dequeued = lane.close().await;
            self.settle_canceled(dequeued).await;
        }
        Ok(retired)
    }

    pub async fn request_restart(&self, chat_id: &str) -> RestartAck {
        self.coordinator.request_restart(chat_id).await
    }

    pub async fn request_restart_forced(&self, chat_id: &str) {
        self.coordinator.request_restart_forced(chat_id).await
    }

    /// Stop accepting and running work: close every lane (queued tasks are
    /// canceled, running jobs signalled) and shut the keepalive backends
    /// down.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for lane in self.lanes.list().await {
            let dequeued = lane.close().await;
            self.settle_canceled(dequeued).await;
        }
        if let Some(tts) = &self.tts {
            tts.shutdown().await;
        }
        if let Some(stt) = &self.stt {
            stt.shutdown().await;
        }
        tracing::info!("scheduler shut down");
    }

    pub async fn queued_total(&self) -> usize {
        self.lanes.total_queued().await
    }

    pub async fn lane(&self, id: &LaneId) -> Option<Arc<Lane>> {
        self.lanes.get(id).await
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    pub fn coordinator(&self) -> &Arc<RestartCoordinator> {
        &self.coordinator
    }

    async fn settle_canceled(&self, jobs: Vec<Job>) {
        for job in jobs {
            if let Err(e) = self
                .ledger
                .update(job.task_id, TaskPatch::status(TaskStatus::Canceled))
                .await
            {
                tracing::warn!(task = %job.task_id, "failed to cancel queued task: {e}");
            }
        }
    }

    /// One cooperative drain loop per lane: pop the head, run it to
    /// completion, re-check the restart coordinator, sleep until woken.
    fn spawn_drain(&self, lane: Arc<Lane>) {
        let runner = self.runner.clone();
        let coordinator = self.coordinator.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tracing::debug!(lane = %lane.id, "lane drain loop started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match lane.take_next().await {
                    Some(job) => {
                        runner.run(job).await;
                        lane.finish_current().await;
                        if lane.is_idle().await {
                            coordinator.on_lane_idle().await;
                        }
                    }
                    None => {
                        if lane.is_closed().await {
                            break;
                        }
                        coordinator.on_lane_idle().await;
                        tokio::select! {
                            _ = lane.notified() => {}
                            _ = shutdown_rx.changed() => {}
                        }
                    }
                }
            }
            tracing::debug!(lane = %lane.id, "lane drain loop ended");
        });
    }
}
