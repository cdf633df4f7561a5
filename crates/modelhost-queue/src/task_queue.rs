//! Job queue with credit checks and cancellation.
//!
//! `submit` holds the job's cost and pushes its id onto an unbounded MPSC
//! channel. A single worker task pulls ids in submission order, so at most
//! one job is ever `Processing`. Jobs cancelled while pending are dropped
//! from the job table; the worker skips their ids when it reaches them.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use modelhost_config::QueueConfig;
use modelhost_db::SharedDatabase;
use modelhost_engine::ModelCache;
use modelhost_types::{
    log_debug, log_error, log_info, log_warn, HostError, HostResult, JobEvent, JobId,
    JobRequest, JobStatus, ProcessingJob,
};

use crate::ledger::SharedLedger;
use crate::operation::OperationRunner;

/// Terminal jobs kept in memory for status lookups.
const FINISHED_RETENTION: usize = 1024;

struct QueuedJob {
    seq: u64,
    job: ProcessingJob,
}

#[derive(Default)]
struct QueueState {
    /// Pending and processing jobs.
    active: HashMap<JobId, QueuedJob>,
    next_seq: u64,
    finished: HashMap<JobId, ProcessingJob>,
    finished_order: VecDeque<JobId>,
}

impl QueueState {
    fn retire(&mut self, job: ProcessingJob) {
        self.finished_order.push_back(job.id.clone());
        self.finished.insert(job.id.clone(), job);
        while self.finished_order.len() > FINISHED_RETENTION {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }
}

struct QueueShared {
    state: Mutex<QueueState>,
    ledger: SharedLedger,
    events: broadcast::Sender<JobEvent>,
    db: Option<SharedDatabase>,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, job: &ProcessingJob) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            message: job.error_message.clone(),
        });
    }

    fn persist(&self, job: &ProcessingJob) {
        if let Some(db) = &self.db {
            if let Err(e) = db.record_job(job) {
                log_warn!("queue", "Failed to record job {}: {}", job.id, e);
            }
        }
    }

    /// Pending -> Processing and debit, or `None` if the job was cancelled.
    fn begin(&self, id: &str) -> Option<ProcessingJob> {
        let job = {
            let mut state = self.lock();
            let queued = state.active.get_mut(id)?;
            if queued.job.status != JobStatus::Pending {
                return None;
            }
            if !self.ledger.debit(id) {
                log_error!("queue", "No credit hold for job {}", id);
            }
            queued.job.status = JobStatus::Processing;
            queued.job.started_at = Some(Utc::now());
            queued.job.clone()
        };
        self.emit(&job);
        Some(job)
    }

    fn finish(&self, id: &str, outcome: HostResult<serde_json::Value>) {
        let job = {
            let mut state = self.lock();
            let Some(QueuedJob { mut job, .. }) = state.active.remove(id) else {
                return;
            };
            job.ended_at = Some(Utc::now());
            match outcome {
                Ok(output) => {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.output = Some(output);
                    self.ledger.settle(id);
                }
                Err(e) => {
                    job.status = JobStatus::Error;
                    job.error_message = Some(e.to_string());
                    self.ledger.refund(id);
                }
            }
            state.retire(job.clone());
            job
        };

        match job.status {
            JobStatus::Completed => log_info!("queue", "Job {} ({}) completed", job.id, job.kind),
            _ => log_warn!(
                "queue",
                "Job {} ({}) failed: {}",
                job.id,
                job.kind,
                job.error_message.as_deref().unwrap_or("unknown error")
            ),
        }
        self.persist(&job);
        self.emit(&job);
    }

    fn report_progress(&self, id: &str, percent: u8) {
        let job = {
            let mut state = self.lock();
            let Some(queued) = state.active.get_mut(id) else {
                return;
            };
            let percent = percent.min(100);
            if queued.job.status != JobStatus::Processing || queued.job.progress == percent {
                return;
            }
            queued.job.progress = percent;
            queued.job.clone()
        };
        self.emit(&job);
    }
}

/// Handed to the operation so it can publish progress for its job.
#[derive(Clone)]
pub struct JobProgress {
    job_id: JobId,
    shared: Arc<QueueShared>,
}

impl JobProgress {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Percent complete, clamped to 100. Ignored once the job has ended.
    pub fn report(&self, percent: u8) {
        self.shared.report_progress(&self.job_id, percent);
    }
}

/// Cloneable handle for submitting, cancelling and inspecting jobs.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<JobId>,
    shared: Arc<QueueShared>,
}

impl TaskQueue {
    /// Create the queue and spawn its worker. The worker exits once every
    /// handle has been dropped.
    pub fn spawn(
        cache: ModelCache,
        runner: Arc<dyn OperationRunner>,
        ledger: SharedLedger,
        config: &QueueConfig,
        db: Option<SharedDatabase>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            ledger,
            events,
            db,
        });

        tokio::spawn(job_worker(
            rx,
            shared.clone(),
            cache,
            runner,
            config.operation_timeout(),
        ));

        Self { tx, shared }
    }

    /// Enqueue a job. Fails with `InsufficientCredits` when the cost exceeds
    /// the spendable balance; nothing is enqueued in that case.
    pub fn submit(&self, request: JobRequest) -> HostResult<JobId> {
        let id = Uuid::new_v4().to_string();
        self.shared.ledger.hold(&id, request.cost)?;

        let job = ProcessingJob::new(id.clone(), request);
        {
            let mut state = self.shared.lock();
            // Send under the lock so channel order matches `seq`.
            if self.tx.send(id.clone()).is_err() {
                drop(state);
                self.shared.ledger.release(&id);
                return Err(HostError::QueueClosed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.active.insert(
                id.clone(),
                QueuedJob {
                    seq,
                    job: job.clone(),
                },
            );
            // Before the worker can announce Processing.
            self.shared.emit(&job);
        }

        log_info!(
            "queue",
            "Job {} ({}) queued, cost {}",
            id,
            job.kind,
            job.cost
        );
        Ok(id)
    }

    /// Cancel a pending job. Returns false for any other state.
    pub fn cancel(&self, id: &str) -> bool {
        self.try_cancel(id).is_ok()
    }

    /// Like `cancel`, but says why a job could not be cancelled.
    pub fn try_cancel(&self, id: &str) -> HostResult<()> {
        let job = {
            let mut state = self.shared.lock();
            let status = match state.active.get(id) {
                Some(queued) => queued.job.status,
                None => {
                    return match state.finished.get(id) {
                        Some(job) => Err(HostError::NotCancellable {
                            id: id.to_string(),
                            status: job.status,
                        }),
                        None => Err(HostError::UnknownJob(id.to_string())),
                    };
                }
            };
            if status != JobStatus::Pending {
                return Err(HostError::NotCancellable {
                    id: id.to_string(),
                    status,
                });
            }
            let Some(QueuedJob { mut job, .. }) = state.active.remove(id) else {
                return Err(HostError::UnknownJob(id.to_string()));
            };
            job.status = JobStatus::Cancelled;
            job.ended_at = Some(Utc::now());
            job.error_message = Some("cancelled before start".to_string());
            self.shared.ledger.release(id);
            state.retire(job.clone());
            job
        };

        log_info!("queue", "Job {} cancelled", id);
        self.shared.persist(&job);
        self.shared.emit(&job);
        Ok(())
    }

    /// Current record of a job, falling back to the history database for
    /// jobs no longer held in memory.
    pub fn job_status(&self, id: &str) -> Option<ProcessingJob> {
        {
            let state = self.shared.lock();
            if let Some(queued) = state.active.get(id) {
                return Some(queued.job.clone());
            }
            if let Some(job) = state.finished.get(id) {
                return Some(job.clone());
            }
        }
        let db = self.shared.db.as_ref()?;
        match db.load_job(id) {
            Ok(job) => job,
            Err(e) => {
                log_warn!("queue", "History lookup for {} failed: {}", id, e);
                None
            }
        }
    }

    /// Pending jobs in the order they will run.
    pub fn pending_jobs(&self) -> Vec<ProcessingJob> {
        let state = self.shared.lock();
        let mut pending: Vec<&QueuedJob> = state
            .active
            .values()
            .filter(|q| q.job.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|q| q.seq);
        pending.into_iter().map(|q| q.job.clone()).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.shared
            .lock()
            .active
            .values()
            .filter(|q| q.job.status == JobStatus::Pending)
            .count()
    }

    pub fn processing_job(&self) -> Option<ProcessingJob> {
        self.shared
            .lock()
            .active
            .values()
            .find(|q| q.job.status == JobStatus::Processing)
            .map(|q| q.job.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.shared.ledger
    }
}

/// Long-lived task that runs jobs one at a time.
async fn job_worker(
    mut rx: mpsc::UnboundedReceiver<JobId>,
    shared: Arc<QueueShared>,
    cache: ModelCache,
    runner: Arc<dyn OperationRunner>,
    timeout: Option<Duration>,
) {
    while let Some(id) = rx.recv().await {
        // Skip jobs that were cancelled before we got to them.
        let Some(job) = shared.begin(&id) else {
            log_debug!("queue", "Skipping job {} (no longer pending)", id);
            continue;
        };

        log_info!("queue", "Job {} ({}) started", job.id, job.kind);
        let progress = JobProgress {
            job_id: id.clone(),
            shared: shared.clone(),
        };
        let outcome = run_job(&job, &cache, runner.as_ref(), progress, timeout).await;
        shared.finish(&id, outcome);
    }
    log_debug!("queue", "Job worker stopped");
}

async fn run_job(
    job: &ProcessingJob,
    cache: &ModelCache,
    runner: &dyn OperationRunner,
    progress: JobProgress,
    timeout: Option<Duration>,
) -> HostResult<serde_json::Value> {
    let lease = cache.ensure_loaded(&job.kind.model).await.map_err(|e| match e {
        HostError::ModelUnavailable { .. } => e,
        other => HostError::model_unavailable(&job.kind.model, other.to_string()),
    })?;
    if lease.is_fallback() {
        log_warn!(
            "queue",
            "Job {} running on fallback for {}",
            job.id,
            lease.name()
        );
    }

    let run = AssertUnwindSafe(runner.run(&job.kind, &lease, job.input.clone(), progress))
        .catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                return Err(HostError::OperationFailed(format!(
                    "operation timed out after {}s",
                    limit.as_secs()
                )))
            }
        },
        None => run.await,
    };

    match result {
        Ok(inner) => inner.map_err(HostError::OperationFailed),
        Err(_) => Err(HostError::OperationFailed(format!(
            "operation {} panicked",
            job.kind.operation
        ))),
    }
}
