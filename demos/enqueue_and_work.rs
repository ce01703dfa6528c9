use queuectl::{JobPayload, JobStatus, Queue, RetryPolicyPatch, ShellExecutor, WorkerPool};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Runs a small workload on the in-memory broker: two commands that succeed
/// and one that keeps failing until it is dead-lettered.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue = Queue::in_memory();
    queue.enqueue(JobPayload::new("echo hello")).await?;
    queue
        .enqueue(JobPayload::new("date -u").with_data("owner", "demo"))
        .await?;
    let doomed = queue
        .enqueue_with_options(
            JobPayload::new("exit 7"),
            RetryPolicyPatch {
                max_retries: Some(1),
                backoff_base: Some(1),
                ..Default::default()
            },
        )
        .await?;

    let pool = WorkerPool::new(queue.clone(), Arc::new(ShellExecutor::new()), 2);
    let shutdown = pool.shutdown_flag();
    let running = tokio::spawn(pool.run());

    loop {
        let stats = queue.get_stats().await?;
        if stats.completed + stats.dead == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    shutdown.store(true, Ordering::SeqCst);
    let summary = running.await??;
    println!("[demo] workers processed {} job runs", summary.processed);

    for job in queue.list_jobs(None).await? {
        println!(
            "[demo] {} {:<9} attempts={} result={:?} error={:?}",
            job.id,
            job.status,
            job.attempts,
            job.result,
            job.last_error
        );
    }

    let dead = queue.get_job(&doomed).await?;
    assert_eq!(dead.map(|job| job.status), Some(JobStatus::Dead));
    Ok(())
}
