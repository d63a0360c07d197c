//! Job definitions for the queue engine.
//!
//! This module defines the core types used by the queue and workers:
//!
//! - `Job`: a unit of submitted work with priority, dependencies and a
//!   retryable lifecycle
//! - `JobPriority` / `JobStatus`: the priority tiers and state machine states
//! - `JobFilter` / `JobQuery`: filtering, sorting and pagination for listings
//!
//! Jobs are stored in Redis as flat field maps. Encoding and decoding live
//! here so the wire layout is versioned and validated in one place.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default maximum number of attempts before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Version of the stored field-map layout. Bumped on incompatible changes
/// so readers can detect records written by older releases.
pub const SCHEMA_VERSION: u32 = 1;

/// Score distance between adjacent priority tiers, in milliseconds.
///
/// A higher tier is scheduled ahead of a lower tier as long as the age gap
/// between the jobs stays under this step. Jobs older than the step can
/// overtake a higher tier; that bias toward very old work is intentional.
const PRIORITY_WEIGHT_STEP: i64 = 1_000_000;

/// Errors raised while decoding a stored job record.
#[derive(Debug, Error)]
pub enum JobDecodeError {
    /// A field without which the record is unusable is absent or empty.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
}

/// Priority tier of a job. Biases dequeue order, higher tiers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Medium,
    High,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Medium
    }
}

impl JobPriority {
    /// Weight used by the ready-queue score formula.
    pub fn weight(self) -> i64 {
        match self {
            JobPriority::Low => 1,
            JobPriority::Medium => 2,
            JobPriority::High => 3,
        }
    }

    /// Ready-queue score for a job of this priority at the given time.
    ///
    /// `score = now_ms - weight * 1_000_000`, so a min-extraction yields
    /// higher tiers first and, within one tier, older jobs first.
    pub fn score_at(self, now_ms: i64) -> f64 {
        (now_ms - self.weight() * PRIORITY_WEIGHT_STEP) as f64
    }

    /// Parses a stored priority name, defaulting to `Medium` when unknown.
    pub fn parse_or_default(value: &str) -> Self {
        match value {
            "low" => JobPriority::Low,
            "high" => JobPriority::High,
            _ => JobPriority::Medium,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Medium => write!(f, "medium"),
            JobPriority::High => write!(f, "high"),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to run, either ready or withheld on unmet dependencies.
    Pending,
    /// Held by exactly one worker.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Dead-lettered or cancelled. Terminal.
    Failed,
}

impl JobStatus {
    /// Returns whether this state has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Parses a stored status name, defaulting to `Pending` when unknown.
    pub fn parse_or_default(value: &str) -> Self {
        match value {
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of submitted work.
///
/// Jobs are created by `JobQueue::enqueue`, stored in Redis, and mutated
/// only through the queue engine's operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at creation, immutable.
    pub id: String,
    /// Free-form tag describing the kind of work.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque structured data interpreted by executors, not by the engine.
    pub payload: serde_json::Value,
    /// Priority tier, fixed at creation.
    pub priority: JobPriority,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Number of attempts consumed so far.
    pub attempts: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_attempts: u32,
    /// Ids of jobs that must complete before this one may run.
    pub dependencies: Vec<String>,
    /// Progress within the current attempt, 0-100.
    pub progress: u8,
    /// Outcome payload, set on successful completion.
    pub result: Option<serde_json::Value>,
    /// Error message, set on terminal failure.
    pub error: Option<String>,
    /// Worker currently (or last) holding the job.
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the job last entered `Processing`.
    pub started_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new pending job with a fresh id and default retry budget.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        priority: JobPriority,
        dependencies: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            payload,
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dependencies,
            progress: 0,
            result: None,
            error: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns whether a failure of this job should be retried rather than
    /// dead-lettered.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of attempts left before dead-lettering.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Ready-queue score for this job at the given time.
    pub fn score_at(&self, now_ms: i64) -> f64 {
        self.priority.score_at(now_ms)
    }

    /// Encodes the job as the flat field map stored in Redis.
    ///
    /// Nested values (payload, dependencies, result) are JSON-encoded.
    pub fn to_field_map(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("schema_version", SCHEMA_VERSION.to_string()),
            ("id", self.id.clone()),
            ("type", self.job_type.clone()),
            ("payload", self.payload.to_string()),
            ("priority", self.priority.to_string()),
            ("status", self.status.to_string()),
            ("attempts", self.attempts.to_string()),
            ("max_attempts", self.max_attempts.to_string()),
            (
                "dependencies",
                serde_json::Value::from(self.dependencies.clone()).to_string(),
            ),
            ("progress", self.progress.to_string()),
            ("created_at", self.created_at.to_rfc3339()),
            ("updated_at", self.updated_at.to_rfc3339()),
        ];
        if let Some(ref result) = self.result {
            fields.push(("result", result.to_string()));
        }
        if let Some(ref error) = self.error {
            fields.push(("error", error.clone()));
        }
        if let Some(ref worker_id) = self.worker_id {
            fields.push(("worker_id", worker_id.clone()));
        }
        if let Some(started_at) = self.started_at {
            fields.push(("started_at", started_at.to_rfc3339()));
        }
        fields
    }

    /// Decodes a job from a stored field map.
    ///
    /// `id` and `type` are required; every other field is defaulted when
    /// absent or unparseable, so partially written or older records still
    /// load.
    pub fn from_field_map(map: &HashMap<String, String>) -> Result<Self, JobDecodeError> {
        let id = map
            .get("id")
            .filter(|v| !v.is_empty())
            .ok_or(JobDecodeError::MissingField("id"))?
            .clone();
        let job_type = map
            .get("type")
            .filter(|v| !v.is_empty())
            .ok_or(JobDecodeError::MissingField("type"))?
            .clone();

        let now = Utc::now();
        let parse_time = |field: &str| -> Option<DateTime<Utc>> {
            map.get(field)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        Ok(Self {
            id,
            job_type,
            payload: map
                .get("payload")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or(serde_json::Value::Null),
            priority: map
                .get("priority")
                .map(|v| JobPriority::parse_or_default(v))
                .unwrap_or_default(),
            status: map
                .get("status")
                .map(|v| JobStatus::parse_or_default(v))
                .unwrap_or(JobStatus::Pending),
            attempts: map
                .get("attempts")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            max_attempts: map
                .get("max_attempts")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            dependencies: map
                .get("dependencies")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            progress: map
                .get("progress")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            result: map.get("result").and_then(|v| serde_json::from_str(v).ok()),
            error: map.get("error").cloned(),
            worker_id: map.get("worker_id").cloned(),
            created_at: parse_time("created_at").unwrap_or(now),
            updated_at: parse_time("updated_at").unwrap_or(now),
            started_at: parse_time("started_at"),
        })
    }
}

/// Equality filters for job listings. `None` means no constraint, which is
/// how the API layer's "all" sentinel maps in.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
}

impl JobFilter {
    /// Returns whether no constraint is set.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.job_type.is_none()
    }

    /// Returns whether the given job passes the filter.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(ref job_type) = self.job_type {
            if &job.job_type != job_type {
                return false;
            }
        }
        true
    }
}

/// Sortable fields for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    Priority,
    Status,
    Attempts,
    Progress,
}

impl Default for SortField {
    fn default() -> Self {
        SortField::CreatedAt
    }
}

/// Sort direction for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Desc
    }
}

/// Pagination and ordering for job listings.
#[derive(Debug, Clone)]
pub struct JobQuery {
    /// Number of jobs to skip.
    pub skip: usize,
    /// Maximum number of jobs to return.
    pub limit: usize,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: 10,
            sort_by: SortField::default(),
            sort_order: SortOrder::default(),
        }
    }
}

/// Sorts and paginates a loaded job list according to the query.
pub fn apply_query(mut jobs: Vec<Job>, query: &JobQuery) -> Vec<Job> {
    jobs.sort_by(|a, b| {
        let ordering = match query.sort_by {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::Priority => a.priority.weight().cmp(&b.priority.weight()),
            SortField::Status => a.status.to_string().cmp(&b.status.to_string()),
            SortField::Attempts => a.attempts.cmp(&b.attempts),
            SortField::Progress => a.progress.cmp(&b.progress),
        };
        match query.sort_order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
    jobs.into_iter().skip(query.skip).take(query.limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job(job_type: &str, priority: JobPriority) -> Job {
        Job::new(job_type, serde_json::json!({}), priority, Vec::new())
    }

    #[test]
    fn test_job_new_defaults() {
        let job = test_job("email", JobPriority::High);

        assert!(!job.id.is_empty());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.progress, 0);
        assert!(job.dependencies.is_empty());
        assert!(job.should_retry());
    }

    #[test]
    fn test_priority_dominates_recency_within_step() {
        // A high-priority job enqueued after a medium-priority one still
        // scores lower (is extracted first) while the age gap stays under
        // the weight step.
        let now = 1_700_000_000_000_i64;
        let medium = JobPriority::Medium.score_at(now);
        let high = JobPriority::High.score_at(now + 60_000);

        assert!(high < medium);
    }

    #[test]
    fn test_same_tier_favors_older_jobs() {
        let now = 1_700_000_000_000_i64;
        let older = JobPriority::Low.score_at(now);
        let newer = JobPriority::Low.score_at(now + 1);

        assert!(older < newer);
    }

    #[test]
    fn test_scores_can_invert_across_tiers_beyond_step() {
        // Known tradeoff: a job aged past the weight step overtakes a
        // fresher job one tier above it.
        let now = 1_700_000_000_000_i64;
        let stale_low = JobPriority::Low.score_at(now - 2_000_001);
        let fresh_medium = JobPriority::Medium.score_at(now);

        assert!(stale_low < fresh_medium);
    }

    #[test]
    fn test_retry_accounting() {
        let mut job = test_job("report", JobPriority::Low).with_max_attempts(2);

        assert_eq!(job.remaining_attempts(), 2);
        job.attempts = 1;
        assert!(job.should_retry());
        job.attempts = 2;
        assert!(!job.should_retry());
        assert_eq!(job.remaining_attempts(), 0);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_field_map_round_trip() {
        let mut job = test_job("email", JobPriority::High);
        job.dependencies = vec!["a".to_string(), "b".to_string()];
        job.payload = serde_json::json!({"processing_time": 3});
        job.result = Some(serde_json::json!({"ok": true}));
        job.error = Some("boom".to_string());
        job.worker_id = Some("worker-1".to_string());
        job.started_at = Some(job.created_at);

        let map: HashMap<String, String> = job
            .to_field_map()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = Job::from_field_map(&map).expect("decode should work");

        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.job_type, job.job_type);
        assert_eq!(decoded.priority, job.priority);
        assert_eq!(decoded.status, job.status);
        assert_eq!(decoded.dependencies, job.dependencies);
        assert_eq!(decoded.payload, job.payload);
        assert_eq!(decoded.result, job.result);
        assert_eq!(decoded.error, job.error);
        assert_eq!(decoded.worker_id, job.worker_id);
        assert_eq!(decoded.created_at.timestamp(), job.created_at.timestamp());
    }

    #[test]
    fn test_field_map_defaults_partial_record() {
        let mut map = HashMap::new();
        map.insert("id".to_string(), "job-1".to_string());
        map.insert("type".to_string(), "email".to_string());
        map.insert("attempts".to_string(), "not-a-number".to_string());

        let decoded = Job::from_field_map(&map).expect("partial record should load");

        assert_eq!(decoded.status, JobStatus::Pending);
        assert_eq!(decoded.priority, JobPriority::Medium);
        assert_eq!(decoded.attempts, 0);
        assert_eq!(decoded.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(decoded.dependencies.is_empty());
        assert_eq!(decoded.payload, serde_json::Value::Null);
    }

    #[test]
    fn test_field_map_requires_id_and_type() {
        let mut map = HashMap::new();
        map.insert("type".to_string(), "email".to_string());
        assert!(Job::from_field_map(&map).is_err());

        let mut map = HashMap::new();
        map.insert("id".to_string(), "job-1".to_string());
        map.insert("type".to_string(), String::new());
        assert!(Job::from_field_map(&map).is_err());
    }

    #[test]
    fn test_filter_matches() {
        let job = test_job("email", JobPriority::Medium);

        let empty = JobFilter::default();
        assert!(empty.is_empty());
        assert!(empty.matches(&job));

        let by_type = JobFilter {
            job_type: Some("email".to_string()),
            ..Default::default()
        };
        assert!(by_type.matches(&job));

        let by_status = JobFilter {
            status: Some(JobStatus::Completed),
            ..Default::default()
        };
        assert!(!by_status.matches(&job));
    }

    #[test]
    fn test_apply_query_sorts_and_paginates() {
        let mut jobs = Vec::new();
        for i in 0..5u32 {
            let mut job = test_job("batch", JobPriority::Low);
            job.attempts = i;
            jobs.push(job);
        }

        let query = JobQuery {
            skip: 1,
            limit: 2,
            sort_by: SortField::Attempts,
            sort_order: SortOrder::Desc,
        };
        let page = apply_query(jobs, &query);

        assert_eq!(page.len(), 2);
        assert_eq!(page[0].attempts, 3);
        assert_eq!(page[1].attempts, 2);
    }

    #[test]
    fn test_apply_query_priority_sort() {
        let jobs = vec![
            test_job("a", JobPriority::Medium),
            test_job("b", JobPriority::High),
            test_job("c", JobPriority::Low),
        ];

        let query = JobQuery {
            skip: 0,
            limit: 10,
            sort_by: SortField::Priority,
            sort_order: SortOrder::Desc,
        };
        let sorted = apply_query(jobs, &query);

        assert_eq!(sorted[0].priority, JobPriority::High);
        assert_eq!(sorted[2].priority, JobPriority::Low);
    }

    #[test]
    fn test_priority_serde_names() {
        assert_eq!(
            serde_json::to_string(&JobPriority::High).expect("serialize"),
            "\"high\""
        );
        assert_eq!(JobPriority::parse_or_default("garbage"), JobPriority::Medium);
        assert_eq!(JobStatus::parse_or_default("failed"), JobStatus::Failed);
    }
}
