// src/worker.rs
use crate::executor::{ExecutionOutcome, JobExecutor};
use crate::queue::{ClaimOutcome, FailureOutcome};
use crate::{registry, Job, JobId, JobStatus, Queue, Result, RetryPromoter};
use chrono::Utc;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    /// How long one claim blocks on the ready queue. Bounds shutdown latency.
    pub poll_timeout: Duration,
    /// Pause after a store failure before the loop tries again.
    pub error_backoff: Duration,
    /// Minimum spacing between retry promotions by this worker.
    pub promote_interval: Duration,
    /// Processing jobs claimed longer ago than this are presumed orphaned.
    pub reclaim_after: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: format!("worker-{}", uuid::Uuid::new_v4()),
            poll_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            promote_interval: Duration::from_secs(1),
            reclaim_after: None,
        }
    }
}

/// Where a worker is in its claim/execute/report cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Reporting,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Claiming => "claiming",
            WorkerState::Executing => "executing",
            WorkerState::Reporting => "reporting",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of one pass through the worker loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A stop was requested; the worker will not claim again.
    Stopped,
    /// Nothing to claim within the poll timeout.
    Idle,
    /// The delivered job had already been claimed or resolved elsewhere.
    Lost(JobId),
    /// The job ran and its result was recorded.
    Processed { id: JobId, status: JobStatus },
    /// The job ran but another party resolved it before the report landed.
    Dropped(JobId),
}

/// Worker builder for fluent configuration
pub struct WorkerBuilder {
    config: WorkerConfig,
    queue: Queue,
    executor: Arc<dyn JobExecutor>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl WorkerBuilder {
    pub fn new(queue: Queue, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            config: WorkerConfig::default(),
            queue,
            executor,
            shutdown: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    pub fn with_promote_interval(mut self, interval: Duration) -> Self {
        self.config.promote_interval = interval;
        self
    }

    /// Process-local stop flag, honoured alongside the shared stop signal.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn build(self) -> Worker {
        Worker {
            promoter: RetryPromoter::new(self.queue.clone()),
            config: self.config,
            queue: self.queue,
            executor: self.executor,
            shutdown: self
                .shutdown
                .unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
            state: WorkerState::Idle,
            last_promotion: None,
        }
    }
}

/// One peer in the worker fleet. Shares nothing with other workers except
/// the queue's store.
pub struct Worker {
    config: WorkerConfig,
    queue: Queue,
    executor: Arc<dyn JobExecutor>,
    promoter: RetryPromoter,
    shutdown: Arc<AtomicBool>,
    state: WorkerState,
    last_promotion: Option<Instant>,
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Flag that stops this worker only, after its current job.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run until stopped. Store failures never end the loop; they are
    /// logged and retried after `error_backoff`. Returns how many jobs
    /// this worker ran.
    pub async fn run(&mut self) -> usize {
        info!(worker = %self.config.name, "Worker started");
        registry::register(self.queue.broker(), &self.config.name).await;

        let mut processed = 0;
        loop {
            match self.step().await {
                Ok(StepOutcome::Stopped) => break,
                Ok(StepOutcome::Processed { .. }) | Ok(StepOutcome::Dropped(_)) => processed += 1,
                Ok(StepOutcome::Idle) | Ok(StepOutcome::Lost(_)) => {}
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "Worker iteration failed");
                    self.state = WorkerState::Idle;
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        self.finish().await;
        info!(worker = %self.config.name, processed, "Worker stopped");
        processed
    }

    /// Register, take a single step, and leave.
    pub async fn run_once(&mut self) -> Result<StepOutcome> {
        registry::register(self.queue.broker(), &self.config.name).await;
        let outcome = self.step().await;
        self.finish().await;
        outcome
    }

    /// One pass: stop check, promotion, claim, execute, report.
    ///
    /// An `Err` means nothing was claimed; once a job is claimed the step
    /// waits out store failures until its result is recorded.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        self.state = WorkerState::Idle;
        if self.stop_requested().await? {
            self.state = WorkerState::Stopped;
            return Ok(StepOutcome::Stopped);
        }

        self.promote_if_due().await?;

        self.state = WorkerState::Claiming;
        let job = match self
            .queue
            .claim_job(self.config.poll_timeout, &self.config.name)
            .await?
        {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::Empty => {
                self.state = WorkerState::Idle;
                return Ok(StepOutcome::Idle);
            }
            ClaimOutcome::Lost(id) => {
                debug!(worker = %self.config.name, job_id = %id, "Dropped re-delivered job");
                self.state = WorkerState::Idle;
                return Ok(StepOutcome::Lost(id));
            }
        };

        registry::set_current_job(self.queue.broker(), &self.config.name, Some(job.id)).await;

        self.state = WorkerState::Executing;
        let outcome = self.execute(&job).await;

        self.state = WorkerState::Reporting;
        let reported = self.report(&job, &outcome).await;

        registry::set_current_job(self.queue.broker(), &self.config.name, None).await;
        self.state = WorkerState::Idle;

        Ok(match reported {
            Some(status) => StepOutcome::Processed { id: job.id, status },
            None => StepOutcome::Dropped(job.id),
        })
    }

    async fn stop_requested(&self) -> Result<bool> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(true);
        }
        self.queue.stop_requested().await
    }

    async fn promote_if_due(&mut self) -> Result<()> {
        let due = self
            .last_promotion
            .map_or(true, |at| at.elapsed() >= self.config.promote_interval);
        if !due {
            return Ok(());
        }
        self.promoter.promote_due(Utc::now()).await?;
        self.last_promotion = Some(Instant::now());
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job.id, worker = %self.config.name))]
    async fn execute(&self, job: &Job) -> ExecutionOutcome {
        info!(command = %job.command(), attempt = job.attempts + 1, "Executing job");
        let started = Instant::now();
        let outcome = self
            .executor
            .run(job.command(), job.payload.timeout_duration())
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(elapsed_ms, success = outcome.is_success(), "Command finished");
        outcome
    }

    /// Record the outcome, retrying through store failures. `None` when the
    /// job was resolved by someone else first.
    async fn report(&self, job: &Job, outcome: &ExecutionOutcome) -> Option<JobStatus> {
        loop {
            let result = match outcome {
                ExecutionOutcome::Success { output } => self
                    .queue
                    .complete_job(job, output)
                    .await
                    .map(|()| JobStatus::Completed),
                ExecutionOutcome::Failure { error } => {
                    self.queue.fail_job(job, error).await.map(|failure| match failure {
                        FailureOutcome::Retrying { .. } => JobStatus::Failed,
                        FailureOutcome::Dead { .. } => JobStatus::Dead,
                    })
                }
            };

            match result {
                Ok(status) => {
                    info!(worker = %self.config.name, job_id = %job.id, status = %status, "Job reported");
                    return Some(status);
                }
                Err(e) if e.is_infrastructure() => {
                    error!(
                        worker = %self.config.name,
                        job_id = %job.id,
                        error = %e,
                        "Failed to record job result, will retry"
                    );
                    tokio::time::sleep(self.config.error_backoff).await;
                }
                Err(e) => {
                    warn!(worker = %self.config.name, job_id = %job.id, error = %e, "Job result discarded");
                    return None;
                }
            }
        }
    }

    async fn finish(&mut self) {
        self.state = WorkerState::Stopped;
        registry::mark_stopped(self.queue.broker(), &self.config.name).await;
        registry::unregister(self.queue.broker(), &self.config.name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_trait;
    use crate::JobPayload;

    struct Scripted {
        succeed: bool,
    }

    #[async_trait]
    impl JobExecutor for Scripted {
        async fn run(&self, command: &str, _timeout: Option<Duration>) -> ExecutionOutcome {
            if self.succeed {
                ExecutionOutcome::Success {
                    output: format!("ran {}", command),
                }
            } else {
                ExecutionOutcome::Failure {
                    error: "exit code 1".to_string(),
                }
            }
        }
    }

    fn worker(queue: &Queue, succeed: bool) -> Worker {
        let executor = Arc::new(Scripted { succeed });
        WorkerBuilder::new(queue.clone(), executor)
            .with_name("test-worker")
            .with_poll_timeout(Duration::from_millis(20))
            .build()
    }

    #[tokio::test]
    async fn step_completes_a_job() {
        let queue = Queue::in_memory();
        let id = queue.enqueue(JobPayload::new("echo hi")).await.unwrap();
        let mut worker = worker(&queue, true);

        let outcome = worker.step().await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Processed {
                id,
                status: JobStatus::Completed
            }
        );
        assert_eq!(worker.state(), WorkerState::Idle);

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.result.as_deref(), Some("ran echo hi"));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn step_on_empty_queue_is_idle() {
        let queue = Queue::in_memory();
        let mut worker = worker(&queue, true);
        assert_eq!(worker.step().await.unwrap(), StepOutcome::Idle);
    }

    #[tokio::test]
    async fn failure_schedules_a_retry() {
        let queue = Queue::in_memory();
        let id = queue.enqueue(JobPayload::new("false")).await.unwrap();
        let mut worker = worker(&queue, false);

        let outcome = worker.step().await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Processed {
                id,
                status: JobStatus::Failed
            }
        );
        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("exit code 1"));
    }

    #[tokio::test]
    async fn shared_stop_signal_stops_before_claiming() {
        let queue = Queue::in_memory();
        queue.enqueue(JobPayload::new("true")).await.unwrap();
        queue.request_stop().await.unwrap();
        let mut worker = worker(&queue, true);

        assert_eq!(worker.step().await.unwrap(), StepOutcome::Stopped);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(queue.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_flag_stops_only_this_worker() {
        let queue = Queue::in_memory();
        let mut worker = worker(&queue, true);
        worker.shutdown_flag().store(true, Ordering::SeqCst);

        assert_eq!(worker.run().await, 0);
        assert!(!queue.stop_requested().await.unwrap());
        assert!(queue.workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_once_unregisters_afterwards() {
        let queue = Queue::in_memory();
        queue.enqueue(JobPayload::new("true")).await.unwrap();
        let mut worker = worker(&queue, true);

        let outcome = worker.run_once().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Processed { .. }));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(queue.workers().await.unwrap().is_empty());
    }
}
