//! Worker pool supervisor with load-based autoscaling.
//!
//! The pool owns its worker handles explicitly; there is no process-wide
//! registry. A single supervisor task records metrics snapshots, reaps
//! stale workers, and evaluates scaling on a fixed interval:
//!
//! - scale up when jobs-per-worker exceeds the up threshold (or the ready
//!   queue alone exceeds the burst threshold) and the pool is below max
//! - scale down when jobs-per-worker falls below the down threshold, the
//!   ready queue is empty, and the pool is above min; only an idle worker
//!   is stopped
//!
//! A process-local `try_lock` keeps scaling evaluations mutually exclusive
//! within this instance. Separate pool processes evaluate independently, so
//! transient over/under-shoot across instances is possible and accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::queue::{JobQueue, QueueError};
use crate::worker::{JobEvent, Worker, WorkerConfig};

/// Stale-worker reaping runs on every Nth supervisor tick.
const REAP_EVERY_TICKS: u64 = 6;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// The pool already holds the maximum number of workers.
    #[error("Worker pool is at maximum capacity ({0})")]
    AtCapacity(usize),

    /// Shutdown timed out; stragglers were aborted and their jobs resubmitted.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Lower bound on pool size.
    pub min_workers: usize,
    /// Upper bound on pool size.
    pub max_workers: usize,
    /// Jobs-per-worker above which the pool scales up.
    pub scale_up_threshold: f64,
    /// Jobs-per-worker below which the pool scales down.
    pub scale_down_threshold: f64,
    /// Ready-queue length that forces a scale-up regardless of ratio.
    pub burst_threshold: usize,
    /// Interval between supervisor ticks.
    pub scale_check_interval: Duration,
    /// Heartbeat age beyond which a worker is considered crashed.
    pub heartbeat_staleness: Duration,
    /// Budget for graceful shutdown before stragglers are aborted.
    pub shutdown_timeout: Duration,
    /// Configuration applied to every spawned worker.
    pub worker: WorkerConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 1.0,
            scale_down_threshold: 0.3,
            burst_threshold: 10,
            scale_check_interval: Duration::from_secs(5),
            heartbeat_staleness: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            worker: WorkerConfig::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the given pool bounds.
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        Self {
            min_workers: min_workers.max(1),
            max_workers: max_workers.max(min_workers.max(1)),
            ..Default::default()
        }
    }

    /// Sets the scale-up threshold.
    pub fn with_scale_up_threshold(mut self, threshold: f64) -> Self {
        self.scale_up_threshold = threshold;
        self
    }

    /// Sets the scale-down threshold.
    pub fn with_scale_down_threshold(mut self, threshold: f64) -> Self {
        self.scale_down_threshold = threshold;
        self
    }

    /// Sets the supervisor tick interval.
    pub fn with_scale_check_interval(mut self, interval: Duration) -> Self {
        self.scale_check_interval = interval;
        self
    }

    /// Sets the shutdown budget.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the per-worker configuration.
    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

/// Outcome of one scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Pure scaling rule: pool size never leaves `[min_workers, max_workers]`.
pub fn evaluate_scaling(
    ready: usize,
    processing: usize,
    worker_count: usize,
    config: &WorkerPoolConfig,
) -> ScalingDecision {
    if worker_count == 0 {
        return if config.max_workers > 0 {
            ScalingDecision::ScaleUp
        } else {
            ScalingDecision::Hold
        };
    }

    let jobs_per_worker = (ready + processing) as f64 / worker_count as f64;

    if (jobs_per_worker > config.scale_up_threshold || ready > config.burst_threshold)
        && worker_count < config.max_workers
    {
        return ScalingDecision::ScaleUp;
    }

    if jobs_per_worker < config.scale_down_threshold
        && ready == 0
        && worker_count > config.min_workers
    {
        return ScalingDecision::ScaleDown;
    }

    ScalingDecision::Hold
}

/// Handle to a spawned worker task.
struct WorkerHandle {
    id: String,
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
    current_job: Arc<std::sync::Mutex<Option<String>>>,
}

impl WorkerHandle {
    fn is_idle(&self) -> bool {
        let slot = match self.current_job.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.is_none()
    }

    fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn take_current_job(&self) -> Option<String> {
        let mut slot = match self.current_job.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
    }
}

fn spawn_worker_task(
    queue: &Arc<JobQueue>,
    config: &WorkerPoolConfig,
    events: &mpsc::UnboundedSender<JobEvent>,
) -> WorkerHandle {
    let worker = Worker::new(Arc::clone(queue), config.worker.clone(), events.clone());
    let id = worker.id().to_string();
    let running = worker.running_flag();
    let current_job = worker.current_job_slot();
    let handle = tokio::spawn(worker.run());
    WorkerHandle {
        id,
        handle,
        running,
        current_job,
    }
}

/// Supervisor owning a set of workers against one queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    events: mpsc::UnboundedSender<JobEvent>,
    workers: Arc<Mutex<Vec<WorkerHandle>>>,
    scaling_lock: Arc<Mutex<()>>,
    supervisor: Option<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool. Lifecycle events from every worker are forwarded on
    /// the given channel.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<JobQueue>,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            config,
            queue,
            events,
            workers: Arc::new(Mutex::new(Vec::new())),
            scaling_lock: Arc::new(Mutex::new(())),
            supervisor: None,
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts the minimum number of workers plus the supervisor task.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for _ in 0..self.config.min_workers {
            self.spawn_worker().await?;
        }
        self.supervisor = Some(self.spawn_supervisor());
        self.is_running.store(true, Ordering::SeqCst);

        info!(num_workers = self.config.min_workers, "worker pool started");
        Ok(())
    }

    /// Adds one worker, rejecting when the pool is at capacity.
    pub async fn spawn_worker(&self) -> Result<String, PoolError> {
        let mut workers = self.workers.lock().await;
        if workers.len() >= self.config.max_workers {
            return Err(PoolError::AtCapacity(self.config.max_workers));
        }
        let handle = spawn_worker_task(&self.queue, &self.config, &self.events);
        let id = handle.id.clone();
        workers.push(handle);
        Ok(id)
    }

    /// Returns the current number of workers in the pool.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn spawn_supervisor(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let workers = Arc::clone(&self.workers);
        let events = self.events.clone();
        let config = self.config.clone();
        let scaling_lock = Arc::clone(&self.scaling_lock);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.scale_check_interval);
            let mut tick: u64 = 0;

            loop {
                ticker.tick().await;
                tick += 1;

                let snapshot = match queue.record_metrics().await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        error!(error = %e, "metrics recording failed");
                        continue;
                    }
                };

                if tick % REAP_EVERY_TICKS == 0 {
                    if let Err(e) = queue.reap_stale_workers(config.heartbeat_staleness).await {
                        warn!(error = %e, "stale worker sweep failed");
                    }
                }

                // Keep scaling evaluations mutually exclusive within this
                // process; skip the tick if one is still in flight.
                let Ok(_guard) = scaling_lock.try_lock() else {
                    continue;
                };

                let mut workers_guard = workers.lock().await;
                workers_guard.retain(|worker| !worker.handle.is_finished());
                let count = workers_guard.len();

                match evaluate_scaling(
                    snapshot.queue_length,
                    snapshot.processing_jobs,
                    count,
                    &config,
                ) {
                    ScalingDecision::ScaleUp => {
                        if count < config.max_workers {
                            let handle = spawn_worker_task(&queue, &config, &events);
                            info!(
                                worker_id = %handle.id,
                                total = count + 1,
                                queue_length = snapshot.queue_length,
                                "scaled up worker pool"
                            );
                            workers_guard.push(handle);
                        }
                    }
                    ScalingDecision::ScaleDown => {
                        if let Some(pos) = workers_guard.iter().position(|w| w.is_idle()) {
                            let handle = workers_guard.remove(pos);
                            handle.signal_stop();
                            info!(
                                worker_id = %handle.id,
                                total = count - 1,
                                "scaled down worker pool"
                            );
                            // Dropping the join handle detaches the task; it
                            // exits at its next poll and deregisters itself.
                        }
                    }
                    ScalingDecision::Hold => {}
                }
            }
        })
    }

    /// Gracefully shuts down the supervisor and every worker.
    ///
    /// Workers get `shutdown_timeout` to finish their current jobs. Any
    /// straggler is aborted and its in-flight job resubmitted via
    /// `retry_job`, so no job is silently dropped.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }
        info!("initiating worker pool shutdown");

        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }

        let mut workers: Vec<WorkerHandle> = {
            let mut guard = self.workers.lock().await;
            guard.drain(..).collect()
        };
        for worker in &workers {
            worker.signal_stop();
        }

        let graceful = tokio::time::timeout(self.config.shutdown_timeout, async {
            for worker in &mut workers {
                if let Err(e) = (&mut worker.handle).await {
                    if !e.is_cancelled() {
                        error!(worker_id = %worker.id, error = %e, "worker task panicked");
                    }
                }
            }
        })
        .await;

        self.is_running.store(false, Ordering::SeqCst);

        if graceful.is_ok() {
            info!("worker pool shutdown complete");
            return Ok(());
        }

        // Stragglers: abort, resubmit in-flight work, clean up the registry.
        for worker in &workers {
            if worker.handle.is_finished() {
                continue;
            }
            worker.handle.abort();

            if let Some(job_id) = worker.take_current_job() {
                match self.queue.retry_job(&job_id).await {
                    Ok(true) => info!(job_id = %job_id, "resubmitted in-flight job on shutdown"),
                    Ok(false) => warn!(job_id = %job_id, "in-flight job dead-lettered on shutdown"),
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "failed to resubmit in-flight job")
                    }
                }
            }
            if let Err(e) = self.queue.deregister_worker(&worker.id).await {
                warn!(worker_id = %worker.id, error = %e, "worker deregistration failed");
            }
        }

        Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
    }
}
