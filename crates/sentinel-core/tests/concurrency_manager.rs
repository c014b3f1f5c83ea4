use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sentinel_core::models::{CoreError, CoreErrorKind, JobOptions, JobPriority, JobStatus};
use sentinel_core::orchestration::{
    ConcurrencyConfig, ConcurrencyManager, FixedMemoryProbe, JobCancellationToken, JobEvent,
    ResourceLimits,
};
use serde_json::{Value, json};
use tokio::sync::Notify;

fn config(max_concurrent_jobs: usize, max_jobs_per_domain: usize) -> ConcurrencyConfig {
    ConcurrencyConfig {
        max_concurrent_jobs,
        max_jobs_per_domain,
        ..ConcurrencyConfig::default()
    }
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[tokio::test(start_paused = true)]
async fn global_cap_bounds_running_jobs() {
    let manager = ConcurrencyManager::new(config(2, 10)).unwrap();
    let gauge = Arc::new(Gauge::default());

    let mut ids = Vec::new();
    for index in 0..6 {
        let gauge = gauge.clone();
        let id = manager
            .add_job(
                format!("crawl-{index}"),
                move |_token: JobCancellationToken| {
                    let gauge = gauge.clone();
                    async move {
                        gauge.enter();
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        gauge.exit();
                        Ok(json!(index))
                    }
                },
                JobOptions::default(),
            )
            .unwrap();
        ids.push(id);
    }

    for (index, id) in ids.into_iter().enumerate() {
        let value = manager.get_job_result(id, None).await.unwrap();
        assert_eq!(value, json!(index));
    }

    assert_eq!(gauge.peak(), 2);
    let stats = manager.get_stats();
    assert_eq!(stats.completed, 6);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn domain_cap_defers_jobs_without_blocking_other_domains() {
    let manager = ConcurrencyManager::new(config(4, 1)).unwrap();
    let busy_domain = Arc::new(Gauge::default());
    let other_started = Arc::new(AtomicU32::new(0));
    let deferred = Arc::new(AtomicUsize::new(0));

    manager.add_observer(Arc::new({
        let deferred = deferred.clone();
        move |event: &JobEvent| {
            if matches!(event, JobEvent::Deferred { .. }) {
                deferred.fetch_add(1, Ordering::SeqCst);
            }
        }
    }));

    let mut ids = Vec::new();
    for index in 0..3 {
        let gauge = busy_domain.clone();
        ids.push(
            manager
                .add_job(
                    format!("grants-{index}"),
                    move |_token: JobCancellationToken| {
                        let gauge = gauge.clone();
                        async move {
                            gauge.enter();
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            gauge.exit();
                            Ok(Value::Null)
                        }
                    },
                    JobOptions::default().domain("grants.example.org"),
                )
                .unwrap(),
        );
    }
    let other = manager
        .add_job(
            "jobs-board",
            {
                let other_started = other_started.clone();
                move |_token: JobCancellationToken| {
                    let other_started = other_started.clone();
                    async move {
                        other_started.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }
            },
            JobOptions::default().domain("jobs.example.org"),
        )
        .unwrap();

    manager.get_job_result(other, None).await.unwrap();
    assert_eq!(other_started.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.get_job_status(ids[2]).unwrap().status,
        JobStatus::Pending
    );

    for id in ids {
        manager.get_job_result(id, None).await.unwrap();
    }
    assert_eq!(busy_domain.peak(), 1);
    assert!(deferred.load(Ordering::SeqCst) >= 2);

    let usage = manager.get_stats().domains;
    assert_eq!(usage.len(), 2);
    assert!(usage.iter().all(|domain| domain.running == 0 && domain.limit == 1));
}

#[tokio::test(start_paused = true)]
async fn domain_limit_override_raises_cap() {
    let manager = ConcurrencyManager::new(config(4, 1)).unwrap();
    manager.set_domain_limit("api.example.org", 3).unwrap();
    let gauge = Arc::new(Gauge::default());

    let mut ids = Vec::new();
    for index in 0..3 {
        let gauge = gauge.clone();
        ids.push(
            manager
                .add_job(
                    format!("api-{index}"),
                    move |_token: JobCancellationToken| {
                        let gauge = gauge.clone();
                        async move {
                            gauge.enter();
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            gauge.exit();
                            Ok(Value::Null)
                        }
                    },
                    JobOptions::default().domain("api.example.org"),
                )
                .unwrap(),
        );
    }
    for id in ids {
        manager.get_job_result(id, None).await.unwrap();
    }

    assert_eq!(gauge.peak(), 3);
    assert_eq!(
        manager.set_domain_limit("api.example.org", 0).unwrap_err().kind,
        CoreErrorKind::InvalidInput
    );
}

#[tokio::test(start_paused = true)]
async fn higher_priority_jobs_run_first() {
    let manager = ConcurrencyManager::new(config(1, 1)).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for (label, priority) in [
        ("low", JobPriority::Low),
        ("high", JobPriority::High),
        ("normal", JobPriority::Normal),
    ] {
        let order = order.clone();
        ids.push(
            manager
                .add_job(
                    label,
                    move |_token: JobCancellationToken| {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(label);
                            Ok(Value::Null)
                        }
                    },
                    JobOptions::default().priority(priority),
                )
                .unwrap(),
        );
    }

    for id in ids {
        manager.get_job_result(id, None).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["high", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn slow_job_ends_in_timeout_state() {
    let manager = ConcurrencyManager::new(config(2, 2)).unwrap();
    let id = manager
        .add_job(
            "hanging-scraper",
            |_token: JobCancellationToken| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            },
            JobOptions::default().timeout(Duration::from_millis(200)),
        )
        .unwrap();

    let error = manager.get_job_result(id, None).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Timeout);
    assert_eq!(error.message, "job 'hanging-scraper' timed out after 200ms");

    let snapshot = manager.get_job_status(id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Timeout);
    assert!(snapshot.completed_at.is_some());
    assert_eq!(manager.get_stats().timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_are_retried_inside_the_slot() {
    let manager = ConcurrencyManager::new(config(1, 1)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let id = manager
        .add_job(
            "flaky",
            {
                let calls = calls.clone();
                move |_token: JobCancellationToken| {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(CoreError::new(CoreErrorKind::OperationFailed, "HTTP 502"))
                        } else {
                            Ok(json!("done"))
                        }
                    }
                }
            },
            JobOptions::default().retries(2),
        )
        .unwrap();

    assert_eq!(manager.get_job_result(id, None).await.unwrap(), json!("done"));
    let snapshot = manager.get_job_status(id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn failing_job_reports_its_error() {
    let manager = ConcurrencyManager::new(config(1, 1)).unwrap();
    let id = manager
        .add_job(
            "broken",
            |_token: JobCancellationToken| async {
                Err(CoreError::new(CoreErrorKind::OperationFailed, "selector not found"))
            },
            JobOptions::default(),
        )
        .unwrap();

    let error = manager.get_job_result(id, None).await.unwrap_err();
    assert_eq!(error.message, "selector not found");
    assert_eq!(manager.get_job_status(id).unwrap().status, JobStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn panicking_job_is_marked_failed() {
    let manager = ConcurrencyManager::new(config(1, 1)).unwrap();
    let explode = true;
    let id = manager
        .add_job(
            "exploding",
            move |_token: JobCancellationToken| async move {
                if explode {
                    panic!("scraper exploded");
                }
                Ok(Value::Null)
            },
            JobOptions::default(),
        )
        .unwrap();

    let error = manager.get_job_result(id, None).await.unwrap_err();
    assert_eq!(error.message, "job 'exploding' panicked");
    assert_eq!(manager.get_job_status(id).unwrap().status, JobStatus::Failed);

    let follow_up = manager
        .add_job(
            "after-panic",
            |_token: JobCancellationToken| async { Ok(json!(1)) },
            JobOptions::default(),
        )
        .unwrap();
    assert_eq!(manager.get_job_result(follow_up, None).await.unwrap(), json!(1));
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_running_job_releases_its_slot() {
    let manager = ConcurrencyManager::new(config(1, 1)).unwrap();
    let started = Arc::new(Notify::new());
    let saw_cancel = Arc::new(AtomicU32::new(0));

    let long = manager
        .add_job(
            "long",
            {
                let started = started.clone();
                let saw_cancel = saw_cancel.clone();
                move |token: JobCancellationToken| {
                    let started = started.clone();
                    let saw_cancel = saw_cancel.clone();
                    async move {
                        started.notify_one();
                        while !token.is_cancelled() {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                        saw_cancel.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("late"))
                    }
                }
            },
            JobOptions::default(),
        )
        .unwrap();
    let next = manager
        .add_job(
            "next",
            |_token: JobCancellationToken| async { Ok(json!("next")) },
            JobOptions::default(),
        )
        .unwrap();

    started.notified().await;
    assert_eq!(manager.get_job_status(long).unwrap().status, JobStatus::Running);
    assert!(manager.cancel_job(long).unwrap());

    assert_eq!(manager.get_job_result(next, None).await.unwrap(), json!("next"));
    let error = manager.get_job_result(long, None).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Cancelled);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(saw_cancel.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_job_status(long).unwrap().status, JobStatus::Cancelled);
    assert!(!manager.cancel_job(long).unwrap());
}

#[tokio::test(start_paused = true)]
async fn cancelling_pending_job_removes_it_from_queue() {
    let manager = ConcurrencyManager::new(config(1, 1)).unwrap();
    manager.pause();

    let runs = Arc::new(AtomicU32::new(0));
    let id = manager
        .add_job(
            "queued",
            {
                let runs = runs.clone();
                move |_token: JobCancellationToken| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }
            },
            JobOptions::default(),
        )
        .unwrap();
    assert_eq!(manager.get_stats().pending, 1);

    assert!(manager.cancel_job(id).unwrap());
    manager.resume();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(manager.get_stats().pending, 0);
    assert_eq!(manager.get_job_status(id).unwrap().status, JobStatus::Cancelled);

    let unknown = manager.cancel_job(sentinel_core::models::JobId(999)).unwrap_err();
    assert_eq!(unknown.kind, CoreErrorKind::NotFound);
}

#[tokio::test(start_paused = true)]
async fn result_wait_timeout_leaves_job_running() {
    let manager = ConcurrencyManager::new(config(1, 1)).unwrap();
    let id = manager
        .add_job(
            "slow",
            |_token: JobCancellationToken| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("finished"))
            },
            JobOptions::default(),
        )
        .unwrap();

    let error = manager
        .get_job_result(id, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Timeout);
    assert_eq!(manager.get_job_status(id).unwrap().status, JobStatus::Running);

    assert_eq!(manager.get_job_result(id, None).await.unwrap(), json!("finished"));
}

#[tokio::test(start_paused = true)]
async fn admission_rejects_when_memory_ceiling_exceeded() {
    let config = ConcurrencyConfig {
        resource_limits: ResourceLimits {
            max_total_jobs: None,
            max_memory_bytes: Some(1_000),
        },
        ..ConcurrencyConfig::default()
    };
    let manager =
        ConcurrencyManager::with_memory_probe(config, Arc::new(FixedMemoryProbe(4_096))).unwrap();

    let error = manager
        .add_job(
            "heavy",
            |_token: JobCancellationToken| async { Ok(Value::Null) },
            JobOptions::default(),
        )
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ResourceExhausted);
    assert!(manager.get_all_jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn admission_rejects_when_job_ceiling_reached() {
    let config = ConcurrencyConfig {
        resource_limits: ResourceLimits {
            max_total_jobs: Some(1),
            max_memory_bytes: None,
        },
        ..ConcurrencyConfig::default()
    };
    let manager = ConcurrencyManager::new(config).unwrap();
    manager.pause();

    manager
        .add_job(
            "first",
            |_token: JobCancellationToken| async { Ok(Value::Null) },
            JobOptions::default(),
        )
        .unwrap();
    let error = manager
        .add_job(
            "second",
            |_token: JobCancellationToken| async { Ok(Value::Null) },
            JobOptions::default(),
        )
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ResourceExhausted);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_and_aborts_stragglers() {
    let manager = ConcurrencyManager::new(config(1, 1)).unwrap();
    let started = Arc::new(Notify::new());

    let stuck = manager
        .add_job(
            "stuck",
            {
                let started = started.clone();
                move |_token: JobCancellationToken| {
                    let started = started.clone();
                    async move {
                        started.notify_one();
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(Value::Null)
                    }
                }
            },
            JobOptions::default(),
        )
        .unwrap();
    let queued = manager
        .add_job(
            "queued",
            |_token: JobCancellationToken| async { Ok(Value::Null) },
            JobOptions::default(),
        )
        .unwrap();

    started.notified().await;
    let report = manager.shutdown(Duration::from_millis(100)).await;

    assert_eq!(report.cancelled_pending, 1);
    assert_eq!(report.aborted, 1);
    assert_eq!(report.drained, 0);
    assert_eq!(manager.get_job_status(stuck).unwrap().status, JobStatus::Cancelled);
    assert_eq!(manager.get_job_status(queued).unwrap().status, JobStatus::Cancelled);

    let error = manager
        .add_job(
            "late",
            |_token: JobCancellationToken| async { Ok(Value::Null) },
            JobOptions::default(),
        )
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ShuttingDown);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_running_jobs_within_grace() {
    let manager = ConcurrencyManager::new(config(2, 2)).unwrap();
    let started = Arc::new(Notify::new());

    let id = manager
        .add_job(
            "short",
            {
                let started = started.clone();
                move |_token: JobCancellationToken| {
                    let started = started.clone();
                    async move {
                        started.notify_one();
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("ok"))
                    }
                }
            },
            JobOptions::default(),
        )
        .unwrap();

    started.notified().await;
    let report = manager.shutdown(Duration::from_secs(5)).await;

    assert_eq!(report.drained, 1);
    assert_eq!(report.aborted, 0);
    assert_eq!(manager.get_job_status(id).unwrap().status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn paused_manager_holds_jobs_until_resumed() {
    let manager = ConcurrencyManager::new(config(2, 2)).unwrap();
    let events = Arc::new(Mutex::new(Vec::<JobEvent>::new()));
    manager.add_observer(Arc::new({
        let events = events.clone();
        move |event: &JobEvent| events.lock().unwrap().push(event.clone())
    }));

    let finished = manager
        .add_job(
            "warmup",
            |_token: JobCancellationToken| async { Ok(json!("warm")) },
            JobOptions::default(),
        )
        .unwrap();
    manager.get_job_result(finished, None).await.unwrap();

    manager.pause();
    assert!(manager.get_stats().paused);
    let held = manager
        .add_job(
            "held-crawl",
            |_token: JobCancellationToken| async { Ok(json!("done")) },
            JobOptions::default(),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.get_job_status(held).unwrap().status, JobStatus::Pending);
    assert!(!events.lock().unwrap().iter().any(
        |event| matches!(event, JobEvent::Started { job_id, .. } if *job_id == held)
    ));

    let listed: Vec<_> = manager
        .get_all_jobs()
        .into_iter()
        .map(|job| (job.id, job.status))
        .collect();
    assert_eq!(
        listed,
        vec![(held, JobStatus::Pending), (finished, JobStatus::Completed)]
    );

    manager.resume();
    assert_eq!(manager.get_job_result(held, None).await.unwrap(), json!("done"));
    assert!(!manager.get_stats().paused);

    let events = events.lock().unwrap();
    let paused_at = events.iter().position(|event| *event == JobEvent::Paused).unwrap();
    let resumed_at = events.iter().position(|event| *event == JobEvent::Resumed).unwrap();
    let started_at = events
        .iter()
        .position(|event| matches!(event, JobEvent::Started { job_id, .. } if *job_id == held))
        .unwrap();
    assert!(paused_at < resumed_at && resumed_at < started_at);
}
