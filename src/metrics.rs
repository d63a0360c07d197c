//! Metrics snapshots and health reporting types.
//!
//! The queue engine records a `MetricsSnapshot` on a fixed interval into a
//! bounded rolling history; `check_health` combines current depths with a
//! trailing performance window into a `HealthReport`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue depth beyond which health is reported as degraded.
pub const HEALTH_QUEUE_DEPTH_THRESHOLD: usize = 100;

/// Trailing-window error rate beyond which health is reported as degraded.
pub const HEALTH_ERROR_RATE_THRESHOLD: f64 = 0.25;

/// Point-in-time aggregate of queue depths and worker membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Ready-queue length.
    pub queue_length: usize,
    pub processing_jobs: usize,
    pub completed_jobs: usize,
    /// Dead-lettered job count.
    pub failed_jobs: usize,
    /// Ids of currently registered workers.
    pub workers: Vec<String>,
}

/// Current queue state plus the rolling snapshot history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_length: usize,
    pub processing_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub workers: Vec<String>,
    pub history: Vec<MetricsSnapshot>,
}

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl HealthStatus {
    /// Classifies health from current state and the trailing error rate.
    ///
    /// Unhealthy: store unreachable or no workers registered. Degraded:
    /// backlog over the depth threshold, a non-empty queue with workers but
    /// nothing processing, or error rate over the threshold.
    pub fn evaluate(
        store_connected: bool,
        active_workers: usize,
        queue_length: usize,
        processing_jobs: usize,
        error_rate: f64,
    ) -> Self {
        if !store_connected || active_workers == 0 {
            return HealthStatus::Unhealthy;
        }
        let stalled = queue_length > 0 && processing_jobs == 0;
        if queue_length > HEALTH_QUEUE_DEPTH_THRESHOLD
            || stalled
            || error_rate > HEALTH_ERROR_RATE_THRESHOLD
        {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }
}

/// Trailing-window performance figures backing a health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowStats {
    /// Dead-lettered fraction of terminal outcomes in the window, 0.0-1.0.
    pub error_rate: f64,
    /// Completions per minute over the window.
    pub throughput_per_min: f64,
    /// Mean `started_at` to completion latency, in milliseconds.
    pub avg_processing_ms: u64,
}

/// Detail block of a health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDetails {
    pub store_connected: bool,
    pub active_workers: usize,
    pub queue_length: usize,
    pub processing_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowStats>,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub details: HealthDetails,
}

impl HealthReport {
    /// Report for a store that could not be reached at all.
    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            details: HealthDetails {
                store_connected: false,
                active_workers: 0,
                queue_length: 0,
                processing_jobs: 0,
                last_error: Some(error.into()),
                window: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhealthy_when_store_unreachable() {
        assert_eq!(
            HealthStatus::evaluate(false, 4, 0, 0, 0.0),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_unhealthy_when_no_workers() {
        assert_eq!(
            HealthStatus::evaluate(true, 0, 0, 0, 0.0),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_degraded_on_deep_backlog() {
        assert_eq!(
            HealthStatus::evaluate(true, 2, HEALTH_QUEUE_DEPTH_THRESHOLD + 1, 1, 0.0),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_degraded_when_backlog_but_nothing_processing() {
        assert_eq!(
            HealthStatus::evaluate(true, 2, 5, 0, 0.0),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_degraded_on_error_rate() {
        assert_eq!(
            HealthStatus::evaluate(true, 2, 0, 1, 0.5),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_healthy_otherwise() {
        assert_eq!(
            HealthStatus::evaluate(true, 2, 3, 2, 0.1),
            HealthStatus::Healthy
        );
        // Idle system: empty queue, nothing processing.
        assert_eq!(
            HealthStatus::evaluate(true, 1, 0, 0, 0.0),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_snapshot_serialization_round_trip() {
        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            queue_length: 3,
            processing_jobs: 2,
            completed_jobs: 10,
            failed_jobs: 1,
            workers: vec!["worker-1".to_string()],
        };

        let json = serde_json::to_string(&snapshot).expect("serialize");
        let parsed: MetricsSnapshot = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(parsed.queue_length, 3);
        assert_eq!(parsed.workers, snapshot.workers);
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(HealthStatus::Degraded.to_string(), "degraded");
        assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
    }
}
