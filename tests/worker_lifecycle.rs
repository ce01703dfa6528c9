//! End-to-end worker behaviour against the in-memory broker.

use chrono::Utc;
use queuectl::{
    async_trait, ExecutionOutcome, JobExecutor, JobPayload, JobStatus, Queue, RetryPolicyPatch,
    RetryPromoter, ShellExecutor, StepOutcome, Worker, WorkerBuilder, WorkerConfig, WorkerPool,
    WorkerStatus,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

fn shell_worker(queue: &Queue, name: &str) -> Worker {
    WorkerBuilder::new(queue.clone(), Arc::new(ShellExecutor::new()))
        .with_name(name)
        .with_poll_timeout(Duration::from_millis(50))
        .with_promote_interval(Duration::ZERO)
        .build()
}

/// Records every command it is asked to run.
#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl JobExecutor for Recording {
    async fn run(&self, command: &str, _timeout: Option<Duration>) -> ExecutionOutcome {
        self.seen.lock().unwrap().push(command.to_string());
        tokio::task::yield_now().await;
        ExecutionOutcome::Success {
            output: "ok".to_string(),
        }
    }
}

/// Blocks inside `run` until released.
#[derive(Default)]
struct Gated {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl JobExecutor for Gated {
    async fn run(&self, _command: &str, _timeout: Option<Duration>) -> ExecutionOutcome {
        self.started.notify_one();
        self.release.notified().await;
        ExecutionOutcome::Success {
            output: "released".to_string(),
        }
    }
}

#[tokio::test]
async fn echo_job_completes_with_its_output() {
    let queue = Queue::in_memory();
    let id = queue.enqueue(JobPayload::new("echo hi")).await.unwrap();

    let outcome = shell_worker(&queue, "w1").step().await.unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Processed {
            id,
            status: JobStatus::Completed
        }
    );

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.result.unwrap().contains("hi"));
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn always_failing_job_is_dead_after_two_attempts() {
    let queue = Queue::in_memory();
    let id = queue
        .enqueue_with_options(
            JobPayload::new("exit 1"),
            RetryPolicyPatch {
                max_retries: Some(1),
                backoff_base: Some(1),
                backoff_factor: Some(2),
            },
        )
        .await
        .unwrap();
    let mut worker = shell_worker(&queue, "w1");

    let first = worker.step().await.unwrap();
    assert_eq!(
        first,
        StepOutcome::Processed {
            id,
            status: JobStatus::Failed
        }
    );
    let failed = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.last_error.as_deref(), Some("Command failed with exit code 1"));

    // Not due yet: nothing to claim.
    assert_eq!(worker.step().await.unwrap(), StepOutcome::Idle);

    let promoted = RetryPromoter::new(queue.clone())
        .promote_due(Utc::now() + chrono::Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(promoted, 1);

    let second = worker.step().await.unwrap();
    assert_eq!(
        second,
        StepOutcome::Processed {
            id,
            status: JobStatus::Dead
        }
    );

    let dead = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert_eq!(dead.attempts, 2);
    let letters = queue.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].id, id);
    assert!(!letters[0].reason.as_deref().unwrap_or_default().is_empty());
}

#[tokio::test]
async fn worker_promotes_due_retries_itself() {
    let queue = Queue::in_memory();
    let id = queue
        .enqueue_with_options(
            JobPayload::new("exit 2"),
            RetryPolicyPatch {
                backoff_base: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut worker = shell_worker(&queue, "w1");
    worker.step().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let outcome = worker.step().await.unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Processed {
            id,
            status: JobStatus::Failed
        }
    );
    assert_eq!(queue.get_job(&id).await.unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn timeout_counts_as_a_failed_attempt() {
    let queue = Queue::in_memory();
    let id = queue
        .enqueue(JobPayload::new("sleep 5").with_timeout(1))
        .await
        .unwrap();

    shell_worker(&queue, "w1").step().await.unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("Command timed out after 1s"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_job_runs_exactly_once_across_workers() {
    let queue = Queue::in_memory();
    let mut expected = Vec::new();
    for i in 0..60 {
        let command = format!("job-{}", i);
        queue.enqueue(JobPayload::new(command.clone())).await.unwrap();
        expected.push(command);
    }

    let executor = Arc::new(Recording::default());
    let pool = WorkerPool::new(queue.clone(), executor.clone(), 4).with_config(WorkerConfig {
        poll_timeout: Duration::from_millis(20),
        ..WorkerConfig::default()
    });
    let shutdown = pool.shutdown_flag();
    let running = tokio::spawn(pool.run());

    for _ in 0..500 {
        if queue.get_stats().await.unwrap().completed == expected.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.store(true, Ordering::SeqCst);
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.processed, expected.len());

    let mut counts: HashMap<String, usize> = HashMap::new();
    for command in executor.seen.lock().unwrap().iter() {
        *counts.entry(command.clone()).or_default() += 1;
    }
    assert_eq!(counts.len(), expected.len());
    assert!(counts.values().all(|&n| n == 1), "a job ran twice: {:?}", counts);
}

#[tokio::test]
async fn stop_during_execution_finishes_the_current_job() {
    let queue = Queue::in_memory();
    let id = queue.enqueue(JobPayload::new("long")).await.unwrap();
    queue.enqueue(JobPayload::new("never")).await.unwrap();

    let gate = Arc::new(Gated::default());
    let mut worker = WorkerBuilder::new(queue.clone(), gate.clone())
        .with_name("drainer")
        .with_poll_timeout(Duration::from_millis(20))
        .build();
    let running = tokio::spawn(async move { worker.run().await });

    gate.started.notified().await;
    let workers = queue.workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status, WorkerStatus::Active);
    assert_eq!(workers[0].current_job, Some(id));

    queue.request_stop().await.unwrap();
    gate.release.notify_one();

    assert_eq!(running.await.unwrap(), 1);
    assert_eq!(queue.get_job(&id).await.unwrap().unwrap().status, JobStatus::Completed);
    assert_eq!(queue.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(), 1);
    assert!(queue.workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn resume_lets_workers_claim_again() {
    let queue = Queue::in_memory();
    queue.enqueue(JobPayload::new("true")).await.unwrap();
    queue.request_stop().await.unwrap();

    let mut worker = shell_worker(&queue, "w1");
    assert_eq!(worker.step().await.unwrap(), StepOutcome::Stopped);

    queue.resume().await.unwrap();
    assert!(matches!(
        worker.step().await.unwrap(),
        StepOutcome::Processed {
            status: JobStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn dead_job_can_be_requeued_and_run_again() {
    let queue = Queue::in_memory();
    let id = queue
        .enqueue_with_options(
            JobPayload::new("exit 1"),
            RetryPolicyPatch {
                max_retries: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut worker = shell_worker(&queue, "w1");
    worker.step().await.unwrap();
    assert_eq!(queue.get_job(&id).await.unwrap().unwrap().status, JobStatus::Dead);

    queue.retry_dead(&id).await.unwrap();
    assert!(queue.dead_letters().await.unwrap().is_empty());

    let outcome = worker.step().await.unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Processed {
            id,
            status: JobStatus::Dead
        }
    );
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
}

#[tokio::test]
async fn pool_reclaims_jobs_orphaned_by_a_dead_worker() {
    let queue = Queue::in_memory();
    let id = queue.enqueue(JobPayload::new("echo again")).await.unwrap();

    // A worker that claims and then vanishes.
    match queue.claim_job(Duration::from_millis(20), "crashed").await.unwrap() {
        queuectl::ClaimOutcome::Claimed(job) => assert_eq!(job.id, id),
        other => panic!("unexpected {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let pool = WorkerPool::new(queue.clone(), Arc::new(ShellExecutor::new()), 1)
        .with_config(WorkerConfig {
            poll_timeout: Duration::from_millis(20),
            reclaim_after: Some(Duration::from_millis(250)),
            ..WorkerConfig::default()
        })
        .with_maintenance_interval(Duration::from_millis(20));
    let shutdown = pool.shutdown_flag();
    let running = tokio::spawn(pool.run());

    for _ in 0..300 {
        let job = queue.get_job(&id).await.unwrap().unwrap();
        if job.status == JobStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.store(true, Ordering::SeqCst);
    running.await.unwrap().unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_deref(), Some("again"));
}
