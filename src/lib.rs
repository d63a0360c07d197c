//! jobforge: distributed priority job queue with dependency-gated execution
//! and autoscaling workers.
//!
//! Producers submit typed units of work with a priority tier and optional
//! prerequisite jobs. Each eligible job is claimed by exactly one worker,
//! executed with bounded time, and moved through a well-defined lifecycle
//! with bounded retries before permanent failure.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │    Redis     │
//!                      │ ready/proc/  │
//!                      │ done/dead    │
//!                      └──────┬───────┘
//!                             │ ZPOPMIN
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│   ...   │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//!         ▲                                       ▲
//!         └───────── WorkerPool supervisor ───────┘
//!                    (autoscaling, metrics, reaping)
//! ```
//!
//! # Reliability features
//!
//! - **Atomic dequeue**: concurrent workers race on `ZPOPMIN`; each pop
//!   removes the entry for all others, so a job is held by one worker
//! - **Dependency gating**: jobs with prerequisites are withheld from the
//!   ready queue until every prerequisite completes
//! - **Bounded retries**: failed jobs requeue with exponential backoff and
//!   dead-letter once their attempt budget is spent
//! - **Fault isolation**: status writes are wrapped in a circuit breaker
//!   and a bounded retry policy
//! - **Autoscaling**: the pool grows and shrinks with load per worker,
//!   always staying within its configured bounds

pub mod cli;
pub mod job;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod reliability;
pub mod worker;

// Re-export main types for convenience
pub use job::{Job, JobFilter, JobPriority, JobQuery, JobStatus, SortField, SortOrder};
pub use metrics::{HealthReport, HealthStatus, MetricsSnapshot, QueueMetrics};
pub use pool::{PoolError, ScalingDecision, WorkerPool, WorkerPoolConfig};
pub use queue::{JobQueue, QueueError};
pub use reliability::{BreakerError, CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
pub use worker::{JobEvent, Worker, WorkerConfig, WorkerError};
