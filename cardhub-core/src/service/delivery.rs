//! Reliable delivery queue with retry and dead-lettering
//!
//! Jobs run at-least-once: `queued -> processing -> completed`, or on a
//! transient failure `processing -> retrying -> queued` with exponential
//! backoff (base 2s, doubling per attempt) until `max_attempts`, after
//! which the job is dead-lettered and retained for inspection, never
//! silently dropped.
//!
//! Ordering: cross-job ordering is not guaranteed, and per-recipient FIFO
//! is not guaranteed either (retries resequence). This is an intentional
//! limitation of the queue contract, not a defect.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DeliveryConfig;
use crate::metrics;
use crate::models::{DeliveryJob, JobKind, JobStatus};

/// Failure classification for a job attempt
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Retried per the backoff policy
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// Dead-lettered immediately, no retry
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

/// Executes one job attempt for a given kind
#[async_trait::async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn run(&self, job: &DeliveryJob) -> Result<(), DeliveryError>;
}

/// Queue tunables
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub workers_per_kind: usize,
    pub queue_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            workers_per_kind: 4,
            queue_capacity: 10_000,
        }
    }
}

impl From<&DeliveryConfig> for QueueConfig {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_secs(config.backoff_base_seconds),
            workers_per_kind: config.workers_per_kind,
            queue_capacity: config.queue_capacity,
        }
    }
}

struct Inner {
    jobs: DashMap<String, DeliveryJob>,
    senders: HashMap<JobKind, mpsc::Sender<String>>,
    receivers: Mutex<HashMap<JobKind, mpsc::Receiver<String>>>,
    config: QueueConfig,
    cancel: CancellationToken,
    attempts_total: AtomicU64,
    attempts_failed: AtomicU64,
}

/// Durable job queue with per-kind worker pools
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for kind in JobKind::ALL {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            senders.insert(kind, tx);
            receivers.insert(kind, rx);
        }

        Self {
            inner: Arc::new(Inner {
                jobs: DashMap::new(),
                senders,
                receivers: Mutex::new(receivers),
                config,
                cancel: CancellationToken::new(),
                attempts_total: AtomicU64::new(0),
                attempts_failed: AtomicU64::new(0),
            }),
        }
    }

    /// Start one dispatcher per kind with bounded concurrency.
    ///
    /// Kinds without a registered handler dead-letter their jobs on the
    /// first attempt.
    pub async fn start(&self, handlers: HashMap<JobKind, Arc<dyn DeliveryHandler>>) {
        let mut receivers = self.inner.receivers.lock().await;

        for kind in JobKind::ALL {
            let Some(mut rx) = receivers.remove(&kind) else {
                // start() was called twice; dispatchers are already running
                warn!(kind = %kind, "Delivery queue already started for kind");
                continue;
            };
            let handler = handlers.get(&kind).cloned();
            let queue = self.clone();
            let cancel = self.inner.cancel.clone();
            let semaphore = Arc::new(Semaphore::new(self.inner.config.workers_per_kind));

            tokio::spawn(async move {
                info!(kind = %kind, "Delivery dispatcher started");
                loop {
                    let job_id = tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(kind = %kind, "Delivery dispatcher cancelled");
                            return;
                        }
                        job_id = rx.recv() => job_id,
                    };
                    let Some(job_id) = job_id else {
                        warn!(kind = %kind, "Delivery channel closed, dispatcher exiting");
                        return;
                    };

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let queue = queue.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        queue.process_job(&job_id, handler.as_deref()).await;
                        drop(permit);
                    });
                }
            });
        }
    }

    /// Enqueue a job, returning its ID
    pub fn enqueue(&self, kind: JobKind, payload: serde_json::Value) -> crate::Result<String> {
        let job = DeliveryJob::new(kind, payload);
        let job_id = job.id.clone();
        self.inner.jobs.insert(job_id.clone(), job);

        let sender = self
            .inner
            .senders
            .get(&kind)
            .ok_or_else(|| crate::Error::Internal(format!("No queue for kind {kind}")))?;

        if let Err(e) = sender.try_send(job_id.clone()) {
            self.inner.jobs.remove(&job_id);
            return Err(crate::Error::Internal(format!(
                "Delivery queue for {kind} is full: {e}"
            )));
        }

        metrics::QUEUE_DEPTH
            .with_label_values(&[kind.as_str()])
            .set(self.depth_of(kind) as i64);

        debug!(job_id = %job_id, kind = %kind, "Job enqueued");
        Ok(job_id)
    }

    async fn process_job(&self, job_id: &str, handler: Option<&dyn DeliveryHandler>) {
        // Take a working copy; the job may have been cleared meanwhile
        let Some(mut job) = self.inner.jobs.get(job_id).map(|j| j.clone()) else {
            return;
        };

        job.attempt += 1;
        job.status = JobStatus::Processing;
        job.next_run_at = None;
        self.inner.jobs.insert(job_id.to_string(), job.clone());
        self.inner.attempts_total.fetch_add(1, Ordering::Relaxed);

        let result = match handler {
            Some(handler) => handler.run(&job).await,
            None => Err(DeliveryError::Permanent(format!(
                "No handler registered for kind {}",
                job.kind
            ))),
        };

        match result {
            Ok(()) => {
                metrics::JOB_ATTEMPTS
                    .with_label_values(&[job.kind.as_str(), "ok"])
                    .inc();
                self.inner.jobs.remove(job_id);
                debug!(job_id = %job_id, kind = %job.kind, attempt = job.attempt, "Job completed");
            }
            Err(DeliveryError::Transient(reason)) if job.attempt < self.inner.config.max_attempts => {
                self.inner.attempts_failed.fetch_add(1, Ordering::Relaxed);
                metrics::JOB_ATTEMPTS
                    .with_label_values(&[job.kind.as_str(), "transient"])
                    .inc();

                let backoff = self.backoff_for(job.attempt);
                job.status = JobStatus::Retrying;
                job.last_error = Some(reason.clone());
                job.next_run_at = Some(
                    chrono::Utc::now()
                        + chrono::Duration::from_std(backoff)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                );
                self.inner.jobs.insert(job_id.to_string(), job.clone());

                warn!(
                    job_id = %job_id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    backoff = ?backoff,
                    error = %reason,
                    "Job failed transiently, scheduling retry"
                );

                let queue = self.clone();
                let job_id = job_id.to_string();
                let kind = job.kind;
                let cancel = self.inner.cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {
                            queue.requeue(&job_id, kind);
                        }
                    }
                });
            }
            Err(err) => {
                let reason = err.to_string();
                self.inner.attempts_failed.fetch_add(1, Ordering::Relaxed);
                let outcome = match err {
                    DeliveryError::Transient(_) => "transient",
                    DeliveryError::Permanent(_) => "permanent",
                };
                metrics::JOB_ATTEMPTS
                    .with_label_values(&[job.kind.as_str(), outcome])
                    .inc();
                metrics::JOBS_DEAD
                    .with_label_values(&[job.kind.as_str()])
                    .inc();

                job.status = JobStatus::Dead;
                job.last_error = Some(reason.clone());
                self.inner.jobs.insert(job_id.to_string(), job.clone());

                error!(
                    job_id = %job_id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    error = %reason,
                    "Job dead-lettered"
                );
            }
        }

        metrics::QUEUE_DEPTH
            .with_label_values(&[job.kind.as_str()])
            .set(self.depth_of(job.kind) as i64);
    }

    fn requeue(&self, job_id: &str, kind: JobKind) {
        let requeued = {
            let Some(mut entry) = self.inner.jobs.get_mut(job_id) else {
                // Cleared from the dead-letter view or completed elsewhere
                return;
            };
            if entry.status != JobStatus::Retrying {
                return;
            }
            entry.status = JobStatus::Queued;
            true
        };

        if requeued {
            if let Some(sender) = self.inner.senders.get(&kind) {
                if let Err(e) = sender.try_send(job_id.to_string()) {
                    error!(job_id = %job_id, kind = %kind, error = %e, "Failed to requeue job");
                }
            }
        }
    }

    /// Exponential backoff: base * 2^(attempt-1), i.e. 2s, 4s, 8s...
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.inner.config.backoff_base.saturating_mul(factor)
    }

    fn depth_of(&self, kind: JobKind) -> usize {
        self.inner
            .jobs
            .iter()
            .filter(|entry| {
                entry.kind == kind
                    && matches!(
                        entry.status,
                        JobStatus::Queued | JobStatus::Retrying | JobStatus::Processing
                    )
            })
            .count()
    }

    /// Current queue depth per kind (queued, retrying or processing jobs)
    #[must_use]
    pub fn queue_depth(&self) -> HashMap<JobKind, usize> {
        JobKind::ALL
            .into_iter()
            .map(|kind| (kind, self.depth_of(kind)))
            .collect()
    }

    /// Fraction of attempts that failed, over the queue's lifetime
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.inner.attempts_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.inner.attempts_failed.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Dead-lettered jobs retained for inspection
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeliveryJob> {
        self.inner
            .jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Dead)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Clear dead-lettered jobs; returns how many were removed
    pub fn clear_dead_letters(&self) -> usize {
        let dead_ids: Vec<String> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Dead)
            .map(|entry| entry.id.clone())
            .collect();
        let count = dead_ids.len();
        for id in dead_ids {
            self.inner.jobs.remove(&id);
        }
        if count > 0 {
            info!(count = count, "Dead-lettered jobs cleared");
        }
        count
    }

    /// Look up a job by ID (None once completed or cleared)
    #[must_use]
    pub fn get_job(&self, job_id: &str) -> Option<DeliveryJob> {
        self.inner.jobs.get(job_id).map(|j| j.clone())
    }

    /// Cancel dispatchers, workers and pending retry timers
    pub fn shutdown(&self) {
        info!("Shutting down delivery queue");
        self.inner.cancel.cancel();
    }
}
