//! Integration tests for the queue engine and workers.
//!
//! These tests run against a real Redis instance.
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test queue_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use jobforge::{JobFilter, JobPriority, JobQueue, JobStatus, Worker, WorkerConfig};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

async fn test_queue(label: &str) -> JobQueue {
    let name = format!("jobforge-test-{}-{}", label, uuid::Uuid::new_v4());
    JobQueue::connect(&redis_url(), &name)
        .await
        .expect("Redis must be reachable for integration tests")
}

async fn wait_for_status(
    queue: &JobQueue,
    job_id: &str,
    expected: JobStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(status)) = queue.get_job_status(job_id).await {
            if status == expected {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

#[tokio::test]
#[ignore] // Run with: cargo test --test queue_integration -- --ignored
async fn test_enqueue_then_dequeue_returns_same_job() {
    let queue = test_queue("roundtrip").await;

    let job_id = queue
        .enqueue(
            "email",
            serde_json::json!({"to": "ops@example.com"}),
            JobPriority::High,
            Vec::new(),
        )
        .await
        .expect("enqueue should work");

    let job = queue
        .dequeue("worker-test")
        .await
        .expect("dequeue should work")
        .expect("job should be returned");

    assert_eq!(job.id, job_id);
    assert_eq!(job.job_type, "email");
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("worker-test"));
    assert!(job.started_at.is_some());

    // Queue is drained.
    let empty = queue.dequeue("worker-test").await.expect("dequeue");
    assert!(empty.is_none());

    queue.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_high_priority_beats_earlier_medium() {
    let queue = test_queue("priority").await;

    let medium_id = queue
        .enqueue("report", serde_json::json!({}), JobPriority::Medium, Vec::new())
        .await
        .expect("enqueue medium");
    // Distinct enqueue timestamps keep the intra-tier ordering deterministic.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let high_id = queue
        .enqueue("report", serde_json::json!({}), JobPriority::High, Vec::new())
        .await
        .expect("enqueue high");

    let first = queue
        .dequeue("worker-test")
        .await
        .expect("dequeue")
        .expect("first job");
    let second = queue
        .dequeue("worker-test")
        .await
        .expect("dequeue")
        .expect("second job");

    assert_eq!(first.id, high_id, "high priority should dequeue first");
    assert_eq!(second.id, medium_id);

    queue.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_dependency_gating_and_propagation() {
    let queue = test_queue("deps").await;

    let a = queue
        .enqueue("extract", serde_json::json!({}), JobPriority::High, Vec::new())
        .await
        .expect("enqueue a");
    let b = queue
        .enqueue(
            "transform",
            serde_json::json!({}),
            JobPriority::High,
            vec![a.clone()],
        )
        .await
        .expect("enqueue b");

    // Only A is ready; B is withheld.
    let first = queue
        .dequeue("worker-test")
        .await
        .expect("dequeue")
        .expect("a should be ready");
    assert_eq!(first.id, a);
    assert!(
        queue.dequeue("worker-test").await.expect("dequeue").is_none(),
        "b must not be dequeued while a is in flight"
    );

    // Completing A promotes B.
    queue
        .update_job_status(&a, JobStatus::Completed, None, None)
        .await
        .expect("complete a");

    let promoted = queue
        .dequeue("worker-test")
        .await
        .expect("dequeue")
        .expect("b should now be ready");
    assert_eq!(promoted.id, b);

    queue.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_concurrent_dequeues_yield_distinct_jobs() {
    let queue = Arc::new(test_queue("concurrent").await);

    const N: usize = 8;
    for i in 0..N {
        queue
            .enqueue(
                "batch",
                serde_json::json!({"index": i}),
                JobPriority::Medium,
                Vec::new(),
            )
            .await
            .expect("enqueue");
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            queue.dequeue(&format!("worker-{}", i)).await
        }));
    }

    let mut seen = std::collections::HashSet::new();
    for handle in handles {
        let job = handle
            .await
            .expect("task should not panic")
            .expect("dequeue should work")
            .expect("each worker should claim exactly one job");
        assert!(seen.insert(job.id.clone()), "job {} claimed twice", job.id);
    }
    assert_eq!(seen.len(), N);
    assert_eq!(queue.ready_len().await.expect("len"), 0);

    queue.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_cancel_semantics() {
    let queue = test_queue("cancel").await;

    let pending = queue
        .enqueue("email", serde_json::json!({}), JobPriority::Low, Vec::new())
        .await
        .expect("enqueue");
    assert!(queue.cancel_job(&pending).await.expect("cancel"));

    let job = queue
        .get_job(&pending)
        .await
        .expect("get")
        .expect("record should remain");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("cancelled by user"));
    assert!(
        queue.dequeue("worker-test").await.expect("dequeue").is_none(),
        "cancelled job must not be dequeued"
    );

    // A completed job cannot be cancelled.
    let done = queue
        .enqueue("email", serde_json::json!({}), JobPriority::Low, Vec::new())
        .await
        .expect("enqueue");
    queue
        .update_job_status(&done, JobStatus::Completed, None, None)
        .await
        .expect("complete");
    assert!(!queue.cancel_job(&done).await.expect("cancel"));
    let job = queue.get_job(&done).await.expect("get").expect("record");
    assert_eq!(job.status, JobStatus::Completed);

    // Unknown id.
    assert!(!queue.cancel_job("no-such-job").await.expect("cancel"));

    queue.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_retry_until_dead_letter() {
    let queue = test_queue("retry").await;

    let job_id = queue
        .enqueue("flaky", serde_json::json!({}), JobPriority::Medium, Vec::new())
        .await
        .expect("enqueue");

    // Three failures requeue with incremented attempts.
    for expected_attempts in 1..=3u32 {
        assert!(queue.retry_job(&job_id).await.expect("retry"));
        let job = queue.get_job(&job_id).await.expect("get").expect("record");
        assert_eq!(job.attempts, expected_attempts);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.attempts <= job.max_attempts);
    }

    // The fourth failure dead-letters.
    assert!(!queue.retry_job(&job_id).await.expect("retry"));
    let job = queue.get_job(&job_id).await.expect("get").expect("record");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, job.max_attempts);
    assert!(job
        .error
        .as_deref()
        .is_some_and(|e| e.contains("max attempts exceeded")));
    assert_eq!(queue.dead_letter_len().await.expect("len"), 1);

    queue.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_filtered_listing_and_counts() {
    let queue = test_queue("listing").await;

    for _ in 0..3 {
        queue
            .enqueue("email", serde_json::json!({}), JobPriority::Medium, Vec::new())
            .await
            .expect("enqueue");
    }
    queue
        .enqueue("report", serde_json::json!({}), JobPriority::Low, Vec::new())
        .await
        .expect("enqueue");

    let filter = JobFilter {
        job_type: Some("email".to_string()),
        ..Default::default()
    };
    let count = queue.get_jobs_count(&filter).await.expect("count");
    assert_eq!(count, 3);

    let total = queue
        .get_jobs_count(&JobFilter::default())
        .await
        .expect("count");
    assert_eq!(total, 4);

    queue.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_stale_worker_reaping() {
    let queue = test_queue("reaping").await;

    queue.register_worker("worker-a").await.expect("register");
    queue.register_worker("worker-b").await.expect("register");
    assert_eq!(queue.active_workers().await.expect("workers").len(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.worker_heartbeat("worker-b").await.expect("heartbeat");

    // Anything not refreshed in the last 20ms is stale.
    let reaped = queue
        .reap_stale_workers(Duration::from_millis(20))
        .await
        .expect("reap");
    assert_eq!(reaped, vec!["worker-a".to_string()]);
    assert_eq!(
        queue.active_workers().await.expect("workers"),
        vec!["worker-b".to_string()]
    );

    queue.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_worker_processes_job_end_to_end() {
    let queue = Arc::new(test_queue("worker-e2e").await);

    let job_id = queue
        .enqueue(
            "simulate",
            serde_json::json!({"processing_time": 1}),
            JobPriority::High,
            Vec::new(),
        )
        .await
        .expect("enqueue");

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let worker = Worker::new(Arc::clone(&queue), WorkerConfig::default(), events_tx);
    let running = worker.running_flag();
    let handle = tokio::spawn(worker.run());

    assert!(
        wait_for_status(&queue, &job_id, JobStatus::Completed, Duration::from_secs(15)).await,
        "job should complete"
    );
    let job = queue.get_job(&job_id).await.expect("get").expect("record");
    assert_eq!(job.progress, 100);
    assert!(job.result.is_some());

    // Give the worker a moment to flush its completion notification.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut saw_completion = false;
    while let Ok(event) = events_rx.try_recv() {
        if matches!(&event, jobforge::JobEvent::Completed { job_id: id, .. } if id == &job_id) {
            saw_completion = true;
        }
    }
    assert!(saw_completion, "completion event should be emitted");

    running.store(false, std::sync::atomic::Ordering::SeqCst);
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    queue.clear().await.expect("cleanup");
}

#[tokio::test]
#[ignore]
async fn test_configured_failure_retries_then_dead_letters() {
    let queue = Arc::new(test_queue("worker-fail").await);

    let job_id = queue
        .enqueue(
            "simulate",
            serde_json::json!({"processing_time": 1, "should_fail": true}),
            JobPriority::High,
            Vec::new(),
        )
        .await
        .expect("enqueue");

    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
    let worker = Worker::new(Arc::clone(&queue), WorkerConfig::default(), events_tx);
    let running = worker.running_flag();
    let handle = tokio::spawn(worker.run());

    assert!(
        wait_for_status(&queue, &job_id, JobStatus::Failed, Duration::from_secs(30)).await,
        "job should be dead-lettered after exhausting retries"
    );
    let job = queue.get_job(&job_id).await.expect("get").expect("record");
    assert_eq!(job.attempts, job.max_attempts);
    assert_eq!(job.error.as_deref(), Some("Job configured to fail"));
    assert_eq!(queue.dead_letter_len().await.expect("len"), 1);

    running.store(false, std::sync::atomic::Ordering::SeqCst);
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    queue.clear().await.expect("cleanup");
}
