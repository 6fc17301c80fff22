//! Durable single-flight job queue.
//!
//! One [`JobQueue`] exists per [`JobKind`] and owns exactly one worker, so
//! at most one analyzer call of a kind is ever in flight. Jobs are persisted
//! before they are queued; on startup the worker re-queues anything left
//! `pending` or `processing` by a previous process (at-least-once delivery).
//!
//! Wake-ups go through a [`Notify`]: any number of enqueues between two
//! worker iterations collapse into a single stored permit, and enqueues for
//! a subject that is already waiting merge into the waiting job.

pub mod job;

use crate::activity::{NotificationKind, SharedSink};
use crate::clock::SharedClock;
use crate::core::types::EnrichmentReason;
use crate::error::{EngineError, Result};
use crate::store::{JobRepository, SharedStore};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use job::{truncate_error, Job, JobKind, JobStatus, MAX_ERROR_CHARS};

/// Minimum gap between two consecutive jobs of one worker, to respect
/// third-party rate limits.
pub const ANALYZER_PACING: Duration = Duration::from_secs(2);

/// The per-kind processing function.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    async fn process(&self, job: &Job) -> Result<()>;
}

/// What callers hand to [`QueueHandle::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub subject_id: Uuid,
    pub reason: EnrichmentReason,
    pub model_override: Option<String>,
}

impl EnqueueRequest {
    pub fn new(subject_id: Uuid, reason: EnrichmentReason) -> Self {
        Self {
            subject_id,
            reason,
            model_override: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct ReadyEntry {
    job_id: Uuid,
    subject_id: Uuid,
}

struct Shared {
    kind: JobKind,
    store: SharedStore,
    clock: SharedClock,
    ready: Mutex<VecDeque<ReadyEntry>>,
    wake: Notify,
}

/// Cloneable producer side of a queue.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
}

impl QueueHandle {
    pub fn kind(&self) -> JobKind {
        self.shared.kind
    }

    /// Persist a pending job and wake the worker.
    ///
    /// If a job for the same subject is still waiting, the request is merged
    /// into it instead and its id is returned.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid> {
        let shared = &self.shared;
        let mut ready = shared.ready.lock().await;

        if let Some(entry) = ready.iter().find(|e| e.subject_id == request.subject_id) {
            let job_id = entry.job_id;
            if let Some(mut job) = shared.store.get_job(job_id).await? {
                let reason = job.reason.strongest(request.reason);
                let model = request.model_override.or_else(|| job.model_override.clone());
                if reason != job.reason || model != job.model_override {
                    job.reason = reason;
                    job.model_override = model;
                    shared.store.update_job(job).await?;
                }
            }
            tracing::debug!(kind = %shared.kind, %job_id, "coalesced enqueue into waiting job");
            return Ok(job_id);
        }

        let job = Job::new(
            shared.kind,
            request.subject_id,
            request.reason,
            request.model_override,
            shared.clock.now(),
        );
        let job_id = job.id;
        shared.store.create_job(job).await?;
        ready.push_back(ReadyEntry {
            job_id,
            subject_id: request.subject_id,
        });
        drop(ready);

        tracing::debug!(kind = %shared.kind, %job_id, subject = %request.subject_id, "job enqueued");
        shared.wake.notify_one();
        Ok(job_id)
    }

    /// Number of jobs waiting for the worker.
    pub async fn waiting(&self) -> usize {
        self.shared.ready.lock().await.len()
    }

    async fn pop(&self) -> Option<ReadyEntry> {
        self.shared.ready.lock().await.pop_front()
    }
}

/// How one dequeued job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// Already terminal or missing; nothing was called
    Skipped,
}

/// A queue together with its single worker.
pub struct JobQueue<P: JobProcessor> {
    handle: QueueHandle,
    processor: Arc<P>,
    sink: SharedSink,
}

impl<P: JobProcessor> JobQueue<P> {
    pub fn new(processor: P, store: SharedStore, clock: SharedClock, sink: SharedSink) -> Self {
        let shared = Shared {
            kind: processor.kind(),
            store,
            clock,
            ready: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
        };
        Self {
            handle: QueueHandle {
                shared: Arc::new(shared),
            },
            processor: Arc::new(processor),
            sink,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn kind(&self) -> JobKind {
        self.handle.kind()
    }

    /// Re-queue jobs a previous process left pending or in flight.
    pub async fn recover(&self) -> Result<usize> {
        let shared = &self.handle.shared;
        let stale = shared
            .store
            .list_jobs(shared.kind, &[JobStatus::Pending, JobStatus::Processing])
            .await?;

        let mut ready = shared.ready.lock().await;
        let mut recovered = 0;
        for mut job in stale {
            if ready.iter().any(|e| e.job_id == job.id) {
                continue;
            }
            if job.status == JobStatus::Processing {
                tracing::warn!(kind = %shared.kind, job_id = %job.id, "re-queueing job interrupted mid-flight");
                job.requeue();
                shared.store.update_job(job.clone()).await?;
            }
            ready.push_back(ReadyEntry {
                job_id: job.id,
                subject_id: job.subject_id,
            });
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Run the worker until `cancel` fires.
    ///
    /// Returns an error only for fatal (invariant) failures; everything else
    /// is confined to the job it happened in.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let kind = self.kind();
        let recovered = self.recover().await?;
        tracing::info!(%kind, recovered, "queue worker started");

        let mut last_call: Option<Instant> = None;
        loop {
            while !cancel.is_cancelled() {
                let Some(entry) = self.handle.pop().await else {
                    break;
                };

                if let Some(last) = last_call {
                    tokio::select! {
                        _ = tokio::time::sleep_until(last + ANALYZER_PACING) => {}
                        _ = cancel.cancelled() => break,
                    }
                }

                match self.process_one(entry.job_id, &cancel).await {
                    Ok(JobOutcome::Skipped) => {}
                    Ok(_) => last_call = Some(Instant::now()),
                    Err(EngineError::Cancelled) => break,
                    Err(e) if e.is_fatal() => {
                        tracing::error!(%kind, "queue worker stopping: {e}");
                        return Err(e);
                    }
                    Err(e) => {
                        last_call = Some(Instant::now());
                        tracing::warn!(%kind, job_id = %entry.job_id, "job bookkeeping failed: {e}");
                    }
                }
            }

            tokio::select! {
                _ = self.handle.shared.wake.notified() => {
                    tracing::trace!(%kind, "queue worker woken");
                }
                _ = cancel.cancelled() => {
                    tracing::info!(%kind, "queue worker shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Take one job through `processing` to a terminal status.
    pub async fn process_one(&self, job_id: Uuid, cancel: &CancellationToken) -> Result<JobOutcome> {
        let shared = &self.handle.shared;
        let Some(mut job) = shared.store.get_job(job_id).await? else {
            tracing::warn!(kind = %shared.kind, %job_id, "queued job vanished from the store");
            return Ok(JobOutcome::Skipped);
        };
        if job.status.is_terminal() {
            return Ok(JobOutcome::Skipped);
        }

        job.start(shared.clock.now());
        shared.store.update_job(job.clone()).await?;
        tracing::debug!(kind = %shared.kind, %job_id, attempt = job.attempts, "processing job");

        let result = tokio::select! {
            r = self.processor.process(&job) => r,
            // The job stays `processing`; recovery picks it up next start.
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        match result {
            Ok(()) => {
                job.complete(shared.clock.now());
                shared.store.update_job(job).await?;
                self.sink
                    .publish(NotificationKind::JobCompleted(shared.kind), 1);
                tracing::info!(kind = %shared.kind, %job_id, "job completed");
                Ok(JobOutcome::Completed)
            }
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => {
                job.fail(&e.to_string(), shared.clock.now());
                shared.store.update_job(job).await?;
                self.sink.publish(NotificationKind::JobFailed(shared.kind), 1);
                tracing::warn!(kind = %shared.kind, %job_id, "job failed: {e}");
                if e.is_fatal() {
                    return Err(e);
                }
                Ok(JobOutcome::Failed)
            }
        }
    }
}
