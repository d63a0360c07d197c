//! Redis-backed priority job queue with dependency-gated scheduling.
//!
//! This module owns all job records and queue memberships. Workers never
//! write state directly; every mutation goes through the operations here.
//!
//! # Key structure
//!
//! All keys share the queue-name prefix:
//!
//! - `{q}:ready`: sorted set of dependency-satisfied pending jobs, scored by
//!   a priority/time composite so `ZPOPMIN` yields the next job to run
//! - `{q}:processing`: sorted set of in-flight jobs, scored by dequeue time
//! - `{q}:completed`: sorted set of completed jobs, scored by completion time
//! - `{q}:dead_letter`: sorted set of terminally failed jobs
//! - `{q}:job:{id}`: hash holding the full job record
//! - `{q}:dependents:{id}`: reverse index of jobs depending on `{id}`
//! - `{q}:workers` / `{q}:heartbeats`: worker registry and liveness stamps
//! - `{q}:metrics`: rolling history of metrics snapshots
//!
//! # Atomicity
//!
//! Every multi-step transition (record write + membership change) is issued
//! as a single MULTI/EXEC pipeline. The atomic `ZPOPMIN` on the ready set is
//! what guarantees at-most-one-worker-per-job: concurrent dequeues race on
//! the pop and each successful pop removes the entry for all others. A
//! dequeue that fails after the pop re-inserts the entry best-effort so the
//! job is not lost.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::job::{apply_query, Job, JobDecodeError, JobFilter, JobPriority, JobQuery, JobStatus};
use crate::metrics::{
    HealthDetails, HealthReport, HealthStatus, MetricsSnapshot, QueueMetrics, WindowStats,
};

/// Number of snapshots retained in the rolling metrics history.
pub const METRICS_HISTORY_LIMIT: usize = 288;

/// Trailing window over which health figures are computed.
const HEALTH_WINDOW: Duration = Duration::from_secs(300);

/// How many recent completions are sampled for the latency average.
const LATENCY_SAMPLE: usize = 50;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize queue data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job not found in the store.
    #[error("Job {0} not found")]
    JobNotFound(String),

    /// A stored job record could not be decoded.
    #[error("Malformed job record {id}: {source}")]
    MalformedJob {
        id: String,
        #[source]
        source: JobDecodeError,
    },
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Redis-backed job queue engine.
pub struct JobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Queue name, used as the key prefix.
    name: String,
    ready_key: String,
    processing_key: String,
    completed_key: String,
    dead_letter_key: String,
    workers_key: String,
    heartbeats_key: String,
    metrics_key: String,
}

impl JobQueue {
    /// Connects to Redis and creates a new queue engine.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a queue engine from an existing connection manager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            name: queue_name.to_string(),
            ready_key: format!("{}:ready", queue_name),
            processing_key: format!("{}:processing", queue_name),
            completed_key: format!("{}:completed", queue_name),
            dead_letter_key: format!("{}:dead_letter", queue_name),
            workers_key: format!("{}:workers", queue_name),
            heartbeats_key: format!("{}:heartbeats", queue_name),
            metrics_key: format!("{}:metrics", queue_name),
        }
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.name, job_id)
    }

    fn dependents_key(&self, job_id: &str) -> String {
        format!("{}:dependents:{}", self.name, job_id)
    }

    /// Enqueues a new job and returns its id.
    ///
    /// The record write, the reverse-index updates, and the ready-queue
    /// insert happen in one transaction. The job only enters the ready set
    /// when it has no pending dependencies; otherwise it is withheld until
    /// dependency propagation promotes it.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        priority: JobPriority,
        dependencies: Vec<String>,
    ) -> Result<String, QueueError> {
        let job = Job::new(job_type, payload, priority, dependencies);

        let mut pending_dependencies = false;
        for dep_id in &job.dependencies {
            match self.get_job_status(dep_id).await? {
                Some(JobStatus::Completed) => {}
                _ => {
                    pending_dependencies = true;
                    break;
                }
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(self.job_key(&job.id), &job.to_field_map())
            .ignore();
        for dep_id in &job.dependencies {
            pipe.sadd(self.dependents_key(dep_id), &job.id).ignore();
        }
        if !pending_dependencies {
            pipe.zadd(&self.ready_key, &job.id, job.score_at(now_ms()))
                .ignore();
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            withheld = pending_dependencies,
            "job enqueued"
        );
        Ok(job.id)
    }

    /// Atomically claims the next ready job for the given worker.
    ///
    /// Pops the minimum-score entry, loads the record, and moves the job
    /// into the processing set with `status=processing`. If anything fails
    /// after the pop, the entry is re-inserted so the job is not lost.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();

        let popped: Vec<(String, f64)> = conn.zpopmin(&self.ready_key, 1).await?;
        let Some((job_id, score)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let map: HashMap<String, String> = conn.hgetall(self.job_key(&job_id)).await?;
        if map.is_empty() {
            warn!(job_id = %job_id, "dequeued id with no job record, dropping entry");
            return Ok(None);
        }
        let mut job = match Job::from_field_map(&map) {
            Ok(job) => job,
            Err(e) => {
                self.reinsert_ready(&job_id, score).await;
                return Err(QueueError::MalformedJob {
                    id: job_id,
                    source: e,
                });
            }
        };

        let now = Utc::now();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            self.job_key(&job_id),
            &[
                ("status", JobStatus::Processing.to_string()),
                ("worker_id", worker_id.to_string()),
                ("started_at", now.to_rfc3339()),
                ("updated_at", now.to_rfc3339()),
            ],
        )
        .ignore();
        pipe.zadd(&self.processing_key, &job_id, now.timestamp_millis() as f64)
            .ignore();

        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            self.reinsert_ready(&job_id, score).await;
            return Err(e.into());
        }

        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.updated_at = now;

        debug!(job_id = %job.id, worker_id, "job dequeued");
        Ok(Some(job))
    }

    /// Best-effort compensation for a dequeue that failed after the pop.
    async fn reinsert_ready(&self, job_id: &str, score: f64) {
        let mut conn = self.redis.clone();
        if let Err(e) = conn
            .zadd::<_, _, _, ()>(&self.ready_key, job_id, score)
            .await
        {
            error!(job_id, error = %e, "failed to re-insert job into ready queue");
        }
    }

    /// Writes a new status (and optional result/error) with the matching
    /// queue-membership transition.
    ///
    /// `Failed` here is terminal dead-letter marking; a caller that intends
    /// a retry must use [`retry_job`](Self::retry_job) instead. `Completed`
    /// triggers dependency propagation: every dependent whose dependency set
    /// is now fully completed is promoted into the ready queue.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(self.job_key(job_id)).await?;
        if !exists {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }

        let now = Utc::now();
        let mut fields = vec![
            ("status", status.to_string()),
            ("updated_at", now.to_rfc3339()),
        ];
        if let Some(ref result) = result {
            fields.push(("result", result.to_string()));
        }
        if let Some(ref error) = error {
            fields.push(("error", error.clone()));
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(self.job_key(job_id), &fields).ignore();

        let score = now.timestamp_millis() as f64;
        match status {
            // Membership for a plain pending reset is handled by retry_job.
            JobStatus::Pending => {}
            JobStatus::Processing => {
                pipe.zrem(&self.ready_key, job_id).ignore();
                pipe.zadd(&self.processing_key, job_id, score).ignore();
            }
            JobStatus::Completed => {
                pipe.zrem(&self.processing_key, job_id).ignore();
                pipe.zadd(&self.completed_key, job_id, score).ignore();
                self.queue_satisfied_dependents(&mut pipe, job_id).await?;
            }
            JobStatus::Failed => {
                pipe.zrem(&self.ready_key, job_id).ignore();
                pipe.zrem(&self.processing_key, job_id).ignore();
                pipe.zadd(&self.dead_letter_key, job_id, score).ignore();
            }
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        debug!(job_id, status = %status, "job status updated");
        Ok(())
    }

    /// Queues ready-set inserts for every dependent of `completed_id` whose
    /// dependencies are now all completed.
    ///
    /// Reads happen before the transaction; the inserts ride in the caller's
    /// pipeline. Re-checking an already-queued dependent is harmless, the
    /// insert is idempotent.
    async fn queue_satisfied_dependents(
        &self,
        pipe: &mut redis::Pipeline,
        completed_id: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let dependents: Vec<String> = conn.smembers(self.dependents_key(completed_id)).await?;
        if dependents.is_empty() {
            return Ok(());
        }

        let now = now_ms();
        for dependent_id in dependents {
            // A missing or undecodable dependent must not block the
            // completion transition of the job that finished.
            let dependent = match self.get_job(&dependent_id).await {
                Ok(Some(dependent)) => dependent,
                Ok(None) => continue,
                Err(e) => {
                    warn!(job_id = %dependent_id, error = %e, "skipping unreadable dependent");
                    continue;
                }
            };
            if dependent.status != JobStatus::Pending {
                continue;
            }

            let mut satisfied = true;
            for dep_id in &dependent.dependencies {
                // The completing job is still mid-transition in the store;
                // it counts as satisfied.
                if dep_id == completed_id {
                    continue;
                }
                match self.get_job_status(dep_id).await? {
                    Some(JobStatus::Completed) => {}
                    _ => {
                        satisfied = false;
                        break;
                    }
                }
            }

            if satisfied {
                pipe.zadd(
                    &self.ready_key,
                    dependent_id.as_str(),
                    dependent.score_at(now),
                )
                .ignore();
                debug!(
                    job_id = %dependent_id,
                    completed_dependency = completed_id,
                    "dependent promoted to ready queue"
                );
            }
        }
        Ok(())
    }

    /// Writes the progress of the current attempt, clamped to 0-100.
    pub async fn update_job_progress(&self, job_id: &str, progress: u8) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.hset_multiple::<_, _, _, ()>(
            self.job_key(job_id),
            &[
                ("progress", progress.min(100).to_string()),
                ("updated_at", Utc::now().to_rfc3339()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Requeues a failed job with exponential backoff, or dead-letters it
    /// when its attempt budget is spent.
    ///
    /// Returns `true` when the job was requeued, `false` when it was
    /// dead-lettered.
    pub async fn retry_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        if job.attempts >= job.max_attempts {
            self.update_job_status(
                job_id,
                JobStatus::Failed,
                None,
                Some(format!("max attempts exceeded ({})", job.max_attempts)),
            )
            .await?;
            info!(job_id, attempts = job.attempts, "job dead-lettered");
            return Ok(false);
        }

        let attempts = job.attempts + 1;
        let delay_ms = (1_i64 << attempts) * 1000;
        let score = job.priority.score_at(now_ms() + delay_ms);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            self.job_key(job_id),
            &[
                ("status", JobStatus::Pending.to_string()),
                ("attempts", attempts.to_string()),
                ("progress", "0".to_string()),
                ("updated_at", Utc::now().to_rfc3339()),
            ],
        )
        .ignore();
        pipe.zrem(&self.processing_key, job_id).ignore();
        pipe.zadd(&self.ready_key, job_id, score).ignore();

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        info!(job_id, attempts, delay_ms, "job requeued with backoff");
        Ok(true)
    }

    /// Cancels a job that has not completed.
    ///
    /// Returns `false` when the job is absent or already completed. A
    /// cancelled job is marked failed and dead-lettered directly, bypassing
    /// retry accounting.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(false);
        };
        if job.status == JobStatus::Completed {
            return Ok(false);
        }

        let now = Utc::now();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zrem(&self.ready_key, job_id).ignore();
        pipe.zrem(&self.processing_key, job_id).ignore();
        pipe.hset_multiple(
            self.job_key(job_id),
            &[
                ("status", JobStatus::Failed.to_string()),
                ("error", "cancelled by user".to_string()),
                ("updated_at", now.to_rfc3339()),
            ],
        )
        .ignore();
        pipe.zadd(
            &self.dead_letter_key,
            job_id,
            now.timestamp_millis() as f64,
        )
        .ignore();

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        info!(job_id, "job cancelled");
        Ok(true)
    }

    /// Loads a job record by id.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let map: HashMap<String, String> = conn.hgetall(self.job_key(job_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Job::from_field_map(&map)
            .map(Some)
            .map_err(|e| QueueError::MalformedJob {
                id: job_id.to_string(),
                source: e,
            })
    }

    /// Loads only the status field of a job.
    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<JobStatus>, QueueError> {
        let mut conn = self.redis.clone();
        let status: Option<String> = conn.hget(self.job_key(job_id), "status").await?;
        Ok(status.map(|s| JobStatus::parse_or_default(&s)))
    }

    /// Lists jobs matching the filter, sorted and paginated per the query.
    pub async fn get_jobs(
        &self,
        filter: &JobFilter,
        query: &JobQuery,
    ) -> Result<Vec<Job>, QueueError> {
        let jobs = self.load_all_jobs(filter).await?;
        Ok(apply_query(jobs, query))
    }

    /// Counts jobs matching the filter, for pagination totals.
    ///
    /// The unfiltered count sums the four membership-set cardinalities
    /// directly; jobs withheld on unmet dependencies are not members of any
    /// set and are not included.
    pub async fn get_jobs_count(&self, filter: &JobFilter) -> Result<usize, QueueError> {
        if filter.is_empty() {
            let mut conn = self.redis.clone();
            let (ready, processing, completed, failed): (usize, usize, usize, usize) =
                redis::pipe()
                    .zcard(&self.ready_key)
                    .zcard(&self.processing_key)
                    .zcard(&self.completed_key)
                    .zcard(&self.dead_letter_key)
                    .query_async(&mut conn)
                    .await?;
            return Ok(ready + processing + completed + failed);
        }
        Ok(self.load_all_jobs(filter).await?.len())
    }

    /// Scans all job records, skipping any that fail to decode.
    async fn load_all_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let mut scan_conn = self.redis.clone();
        let pattern = format!("{}:job:*", self.name);
        let mut keys = Vec::new();
        {
            let mut iter: redis::AsyncIter<String> = scan_conn.scan_match(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let mut conn = self.redis.clone();
        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            let map: HashMap<String, String> = conn.hgetall(&key).await?;
            if map.is_empty() {
                continue;
            }
            match Job::from_field_map(&map) {
                Ok(job) => {
                    if filter.matches(&job) {
                        jobs.push(job);
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "skipping malformed job record"),
            }
        }
        Ok(jobs)
    }

    /// Adds a worker to the registry with a fresh heartbeat.
    pub async fn register_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(&self.workers_key, worker_id).ignore();
        pipe.hset(&self.heartbeats_key, worker_id, now_ms()).ignore();

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        info!(worker_id, "worker registered");
        Ok(())
    }

    /// Removes a worker and its heartbeat record.
    pub async fn deregister_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(&self.workers_key, worker_id).ignore();
        pipe.hdel(&self.heartbeats_key, worker_id).ignore();

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        info!(worker_id, "worker deregistered");
        Ok(())
    }

    /// Refreshes a worker's liveness timestamp.
    pub async fn worker_heartbeat(&self, worker_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(&self.heartbeats_key, worker_id, now_ms())
            .await?;
        Ok(())
    }

    /// Returns the ids of currently registered workers.
    pub async fn active_workers(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.smembers(&self.workers_key).await?)
    }

    /// Removes workers whose last heartbeat is older than `staleness`,
    /// treating them as crashed. Returns the reaped ids.
    pub async fn reap_stale_workers(
        &self,
        staleness: Duration,
    ) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let heartbeats: HashMap<String, i64> = conn.hgetall(&self.heartbeats_key).await?;
        let cutoff = now_ms() - staleness.as_millis() as i64;

        let mut reaped = Vec::new();
        for (worker_id, last_beat) in heartbeats {
            if last_beat < cutoff {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.srem(&self.workers_key, &worker_id).ignore();
                pipe.hdel(&self.heartbeats_key, &worker_id).ignore();
                pipe.query_async::<_, ()>(&mut conn).await?;

                warn!(worker_id = %worker_id, last_beat, "reaped stale worker");
                reaped.push(worker_id);
            }
        }
        Ok(reaped)
    }

    /// Records a metrics snapshot into the rolling history and trims the
    /// history to the most recent [`METRICS_HISTORY_LIMIT`] entries.
    ///
    /// The four cardinalities and the worker set are read in one atomic
    /// transaction so the snapshot is internally consistent.
    pub async fn record_metrics(&self) -> Result<MetricsSnapshot, QueueError> {
        let mut conn = self.redis.clone();
        let (queue_length, processing_jobs, completed_jobs, failed_jobs, workers): (
            usize,
            usize,
            usize,
            usize,
            Vec<String>,
        ) = redis::pipe()
            .atomic()
            .zcard(&self.ready_key)
            .zcard(&self.processing_key)
            .zcard(&self.completed_key)
            .zcard(&self.dead_letter_key)
            .smembers(&self.workers_key)
            .query_async(&mut conn)
            .await?;

        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            queue_length,
            processing_jobs,
            completed_jobs,
            failed_jobs,
            workers,
        };

        let encoded = serde_json::to_string(&snapshot)?;
        redis::pipe()
            .atomic()
            .zadd(
                &self.metrics_key,
                encoded,
                snapshot.timestamp.timestamp_millis() as f64,
            )
            .ignore()
            .zremrangebyrank(&self.metrics_key, 0, -(METRICS_HISTORY_LIMIT as isize + 1))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(snapshot)
    }

    /// Returns current queue state plus the snapshot history.
    pub async fn get_metrics(&self) -> Result<QueueMetrics, QueueError> {
        let mut conn = self.redis.clone();
        let (queue_length, processing_jobs, completed_jobs, failed_jobs, workers, history): (
            usize,
            usize,
            usize,
            usize,
            Vec<String>,
            Vec<String>,
        ) = redis::pipe()
            .zcard(&self.ready_key)
            .zcard(&self.processing_key)
            .zcard(&self.completed_key)
            .zcard(&self.dead_letter_key)
            .smembers(&self.workers_key)
            .zrange(&self.metrics_key, 0, -1)
            .query_async(&mut conn)
            .await?;

        let history = history
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect();

        Ok(QueueMetrics {
            queue_length,
            processing_jobs,
            completed_jobs,
            failed_jobs,
            workers,
            history,
        })
    }

    /// Combines store reachability, queue depths, worker count, and a
    /// trailing performance window into a health classification.
    pub async fn check_health(&self) -> Result<HealthReport, QueueError> {
        let mut conn = self.redis.clone();
        if let Err(e) = redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            return Ok(HealthReport::unreachable(e.to_string()));
        }

        let (queue_length, processing_jobs, workers): (usize, usize, Vec<String>) = redis::pipe()
            .zcard(&self.ready_key)
            .zcard(&self.processing_key)
            .smembers(&self.workers_key)
            .query_async(&mut conn)
            .await?;

        let since = (now_ms() - HEALTH_WINDOW.as_millis() as i64) as f64;
        let completed_recent: usize = conn.zcount(&self.completed_key, since, "+inf").await?;
        let failed_recent: usize = conn.zcount(&self.dead_letter_key, since, "+inf").await?;

        let terminal = completed_recent + failed_recent;
        let error_rate = if terminal == 0 {
            0.0
        } else {
            failed_recent as f64 / terminal as f64
        };
        let throughput_per_min = completed_recent as f64 / (HEALTH_WINDOW.as_secs_f64() / 60.0);
        let avg_processing_ms = self.average_processing_ms().await?;

        let status = HealthStatus::evaluate(
            true,
            workers.len(),
            queue_length,
            processing_jobs,
            error_rate,
        );

        Ok(HealthReport {
            status,
            details: HealthDetails {
                store_connected: true,
                active_workers: workers.len(),
                queue_length,
                processing_jobs,
                last_error: None,
                window: Some(WindowStats {
                    error_rate,
                    throughput_per_min,
                    avg_processing_ms,
                }),
            },
        })
    }

    /// Mean dequeue-to-completion latency over a sample of recent
    /// completions. Records that fail to load are skipped.
    async fn average_processing_ms(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let recent: Vec<String> = conn
            .zrevrange(&self.completed_key, 0, LATENCY_SAMPLE as isize - 1)
            .await?;

        let mut total_ms = 0_i64;
        let mut counted = 0_u64;
        for job_id in recent {
            if let Ok(Some(job)) = self.get_job(&job_id).await {
                if let Some(started_at) = job.started_at {
                    let elapsed = (job.updated_at - started_at).num_milliseconds();
                    if elapsed >= 0 {
                        total_ms += elapsed;
                        counted += 1;
                    }
                }
            }
        }
        Ok(if counted == 0 {
            0
        } else {
            total_ms as u64 / counted
        })
    }

    /// Returns the number of jobs in the ready queue.
    pub async fn ready_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.zcard(&self.ready_key).await?)
    }

    /// Returns the number of in-flight jobs.
    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.zcard(&self.processing_key).await?)
    }

    /// Returns the number of dead-lettered jobs.
    pub async fn dead_letter_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.zcard(&self.dead_letter_key).await?)
    }

    /// Deletes all queue state: memberships, records, indexes, registry and
    /// metrics history.
    ///
    /// **Warning**: this permanently deletes all jobs. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut scan_conn = self.redis.clone();
        let mut keys: Vec<String> = vec![
            self.ready_key.clone(),
            self.processing_key.clone(),
            self.completed_key.clone(),
            self.dead_letter_key.clone(),
            self.workers_key.clone(),
            self.heartbeats_key.clone(),
            self.metrics_key.clone(),
        ];
        for pattern in [
            format!("{}:job:*", self.name),
            format!("{}:dependents:*", self.name),
        ] {
            let mut iter: redis::AsyncIter<String> = scan_conn.scan_match(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.del(key).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
