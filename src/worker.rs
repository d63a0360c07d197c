//! Worker execution unit.
//!
//! A worker registers itself, polls the queue for jobs, and executes each
//! claimed job end-to-end: dependency waiting, simulated bounded work,
//! progress reporting, and the terminal status write. Status writes that
//! mark a job processing go through a circuit breaker so a store outage
//! fails fast; completion writes go through a bounded retry policy so a
//! transient write failure does not fail the whole job.
//!
//! Lifecycle notifications are emitted on an `mpsc` channel handed in at
//! construction; there is no global event registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::job::{Job, JobStatus};
use crate::queue::{JobQueue, QueueError};
use crate::reliability::{BreakerError, CircuitBreaker, CircuitBreakerConfig, RetryPolicy};

/// Smallest accepted simulated work duration, in seconds.
const MIN_PROCESSING_SECS: u64 = 1;

/// Largest accepted simulated work duration, in seconds.
const MAX_PROCESSING_SECS: u64 = 30;

/// Simulated work duration when the payload does not request one.
const DEFAULT_PROCESSING_SECS: u64 = 5;

/// Progress ceiling while work is still in flight; 100 is only written once
/// success is confirmed.
const PROGRESS_CEILING: u8 = 90;

/// Errors that can occur while a worker processes a job.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The job record is unusable.
    #[error("invalid job format: {0}")]
    InvalidJob(String),

    /// A prerequisite job reached `failed`; the dependent cannot succeed.
    #[error("dependency {0} failed")]
    DependencyFailed(String),

    /// Prerequisites did not resolve within the wait budget.
    #[error("timed out waiting for dependencies")]
    DependencyTimeout,

    /// The job's own execution failed.
    #[error("{0}")]
    ExecutionFailed(String),

    /// The status-write circuit breaker is open.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Lifecycle notification emitted by workers.
#[derive(Debug, Clone)]
pub enum JobEvent {
    WorkerStarted { worker_id: String },
    WorkerStopped { worker_id: String },
    Started { worker_id: String, job_id: String },
    Completed { worker_id: String, job_id: String },
    Failed {
        worker_id: String,
        job_id: String,
        error: String,
    },
}

/// Configuration for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle backoff between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Backoff after an unexpected error in the poll loop.
    pub error_backoff: Duration,
    /// Interval between liveness refreshes.
    pub heartbeat_interval: Duration,
    /// Overall budget for dependency waiting.
    pub dependency_timeout: Duration,
    /// Sleep between dependency status polls.
    pub dependency_poll_interval: Duration,
    /// Interval between simulated progress increments.
    pub progress_interval: Duration,
    /// Retry policy for the completion status write.
    pub status_retry: RetryPolicy,
    /// Breaker guarding the processing status write.
    pub breaker: CircuitBreakerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            dependency_timeout: Duration::from_secs(30),
            dependency_poll_interval: Duration::from_secs(1),
            progress_interval: Duration::from_secs(1),
            status_retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Parses the simulated work duration from a job payload, clamped to the
/// accepted range.
pub(crate) fn processing_duration(payload: &serde_json::Value) -> Duration {
    let secs = payload
        .get("processing_time")
        .and_then(|v| v.as_u64())
        .map(|s| s.clamp(MIN_PROCESSING_SECS, MAX_PROCESSING_SECS))
        .unwrap_or(DEFAULT_PROCESSING_SECS);
    Duration::from_secs(secs)
}

/// Returns whether the payload requests a simulated failure.
pub(crate) fn should_fail(payload: &serde_json::Value) -> bool {
    payload
        .get("should_fail")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// A single worker processing jobs from the queue.
pub struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    config: WorkerConfig,
    breaker: CircuitBreaker,
    events: mpsc::UnboundedSender<JobEvent>,
    running: Arc<AtomicBool>,
    current_job: Arc<Mutex<Option<String>>>,
}

impl Worker {
    /// Creates a worker with a fresh id. The worker does nothing until
    /// [`run`](Self::run) is driven.
    pub fn new(
        queue: Arc<JobQueue>,
        config: WorkerConfig,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            queue,
            config,
            breaker,
            events,
            running: Arc::new(AtomicBool::new(true)),
            current_job: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the worker's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Flag the pool uses to signal this worker to stop polling.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Slot the pool observes to find idle workers and in-flight jobs.
    pub fn current_job_slot(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.current_job)
    }

    /// Main worker loop: register, heartbeat, poll, execute, deregister.
    ///
    /// Runs until the running flag is cleared. An in-flight job always
    /// finishes (or fails) before the loop exits; cancellation mid-job only
    /// happens when the owning task is aborted, in which case the pool
    /// resubmits the job.
    pub async fn run(self) {
        if let Err(e) = self.queue.register_worker(&self.id).await {
            error!(worker_id = %self.id, error = %e, "worker registration failed");
            self.running.store(false, Ordering::SeqCst);
            return;
        }
        let _ = self.events.send(JobEvent::WorkerStarted {
            worker_id: self.id.clone(),
        });
        let heartbeat = self.spawn_heartbeat();
        info!(worker_id = %self.id, "worker started");

        while self.running.load(Ordering::SeqCst) {
            match self.queue.dequeue(&self.id).await {
                Ok(Some(job)) => {
                    self.set_current_job(Some(job.id.clone()));
                    let _ = self.events.send(JobEvent::Started {
                        worker_id: self.id.clone(),
                        job_id: job.id.clone(),
                    });

                    if let Err(e) = self.process_job(&job).await {
                        error!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            error = %e,
                            "processing error"
                        );
                        self.fail_job_best_effort(&job, &e.to_string()).await;
                        tokio::time::sleep(self.config.error_backoff).await;
                    }
                    self.set_current_job(None);
                }
                Ok(None) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "dequeue failed");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        heartbeat.abort();
        if let Err(e) = self.queue.deregister_worker(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "worker deregistration failed");
        }
        let _ = self.events.send(JobEvent::WorkerStopped {
            worker_id: self.id.clone(),
        });
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Executes a claimed job end-to-end.
    ///
    /// Returns `Err` only when the failure handling itself failed; ordinary
    /// job failures are absorbed into retry or dead-letter transitions.
    async fn process_job(&self, job: &Job) -> Result<(), WorkerError> {
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            attempt = job.attempts + 1,
            "processing job"
        );

        // Validation failures are terminal, never retried.
        if job.id.is_empty() || job.job_type.is_empty() {
            warn!(worker_id = %self.id, "rejecting malformed job");
            if !job.id.is_empty() {
                self.dead_letter(job, "invalid job format: missing id or type")
                    .await?;
            }
            return Ok(());
        }

        // Re-assert the processing status through the breaker so repeated
        // store failures short-circuit instead of stalling every poll.
        let marked = self
            .breaker
            .execute(|| {
                self.queue
                    .update_job_status(&job.id, JobStatus::Processing, None, None)
            })
            .await;
        match marked {
            Ok(()) => {}
            Err(BreakerError::Open) => return self.handle_failure(job, WorkerError::CircuitOpen).await,
            Err(BreakerError::Inner(e)) => {
                return self.handle_failure(job, WorkerError::Queue(e)).await
            }
        }

        let progress_task = self.spawn_progress(job.id.clone());
        let outcome = self.execute_job(job).await;
        progress_task.abort();

        match outcome {
            Ok(result) => {
                let finished = self
                    .config
                    .status_retry
                    .run(|| {
                        let result = result.clone();
                        async move {
                            self.queue.update_job_progress(&job.id, 100).await?;
                            self.queue
                                .update_job_status(&job.id, JobStatus::Completed, Some(result), None)
                                .await
                        }
                    })
                    .await;

                match finished {
                    Ok(()) => {
                        info!(worker_id = %self.id, job_id = %job.id, "job completed");
                        let _ = self.events.send(JobEvent::Completed {
                            worker_id: self.id.clone(),
                            job_id: job.id.clone(),
                        });
                        Ok(())
                    }
                    Err(e) => self.handle_failure(job, WorkerError::Queue(e)).await,
                }
            }
            Err(cause) => self.handle_failure(job, cause).await,
        }
    }

    /// Dependency wait plus the simulated bounded work.
    async fn execute_job(&self, job: &Job) -> Result<serde_json::Value, WorkerError> {
        if !job.dependencies.is_empty() {
            match tokio::time::timeout(
                self.config.dependency_timeout,
                self.wait_for_dependencies(&job.dependencies),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(WorkerError::DependencyTimeout),
            }
        }

        tokio::time::sleep(processing_duration(&job.payload)).await;

        if should_fail(&job.payload) {
            return Err(WorkerError::ExecutionFailed(
                "Job configured to fail".to_string(),
            ));
        }

        Ok(serde_json::json!({
            "completed_at": Utc::now().to_rfc3339(),
            "worker_id": self.id,
        }))
    }

    /// Concurrently polls every dependency until all complete or one fails.
    async fn wait_for_dependencies(&self, dependencies: &[String]) -> Result<(), WorkerError> {
        let waits = dependencies
            .iter()
            .map(|dep_id| self.wait_for_dependency(dep_id));
        futures::future::try_join_all(waits).await?;
        Ok(())
    }

    async fn wait_for_dependency(&self, dep_id: &str) -> Result<(), WorkerError> {
        loop {
            match self.queue.get_job_status(dep_id).await? {
                Some(JobStatus::Completed) => return Ok(()),
                Some(JobStatus::Failed) => {
                    return Err(WorkerError::DependencyFailed(dep_id.to_string()))
                }
                // A prerequisite that does not exist can never complete.
                None => return Err(WorkerError::DependencyFailed(dep_id.to_string())),
                Some(_) => {
                    tokio::time::sleep(self.config.dependency_poll_interval).await;
                }
            }
        }
    }

    /// Routes a failed attempt to retry or dead-letter.
    ///
    /// A failed dependency dead-letters the dependent immediately: the
    /// prerequisite is terminal, so retrying cannot succeed. Everything
    /// else consumes an attempt and requeues with backoff until the budget
    /// is spent.
    async fn handle_failure(&self, job: &Job, cause: WorkerError) -> Result<(), WorkerError> {
        warn!(
            worker_id = %self.id,
            job_id = %job.id,
            error = %cause,
            remaining_attempts = job.remaining_attempts(),
            "job attempt failed"
        );

        match cause {
            WorkerError::DependencyFailed(_) => {
                self.dead_letter(job, &cause.to_string()).await?;
            }
            _ if job.should_retry() => {
                self.queue.retry_job(&job.id).await?;
            }
            _ => {
                self.dead_letter(job, &cause.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Terminal failure write plus the failure notification.
    async fn dead_letter(&self, job: &Job, error: &str) -> Result<(), WorkerError> {
        self.queue
            .update_job_status(&job.id, JobStatus::Failed, None, Some(error.to_string()))
            .await?;
        let _ = self.events.send(JobEvent::Failed {
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
            error: error.to_string(),
        });
        Ok(())
    }

    async fn fail_job_best_effort(&self, job: &Job, error: &str) {
        if let Err(e) = self.dead_letter(job, error).await {
            error!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %e,
                "failed to record job failure"
            );
        }
    }

    /// Spawns the progress-simulation timer for one attempt.
    ///
    /// Reported progress climbs by 10 up to the ceiling while work runs;
    /// the task is aborted before the final status write so it can never
    /// overwrite the confirmed 100.
    fn spawn_progress(&self, job_id: String) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let interval = self.config.progress_interval;
        tokio::spawn(async move {
            let mut progress = 0_u8;
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the first
            // increment lands one interval in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if progress < PROGRESS_CEILING {
                    progress += 10;
                    if let Err(e) = queue.update_job_progress(&job_id, progress).await {
                        warn!(job_id = %job_id, error = %e, "progress update failed");
                    }
                }
            }
        })
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let worker_id = self.id.clone();
        let running = Arc::clone(&self.running);
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = queue.worker_heartbeat(&worker_id).await {
                    warn!(worker_id = %worker_id, error = %e, "heartbeat failed");
                } else {
                    debug!(worker_id = %worker_id, "heartbeat");
                }
            }
        })
    }

    fn set_current_job(&self, value: Option<String>) {
        let mut slot = match self.current_job.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = value;
    }
}
