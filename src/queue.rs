// src/queue.rs
use crate::backoff::{RetryDecision, RetryPolicyPatch};
use crate::broker::{Broker, MemoryBroker, RedisBroker};
use crate::registry::WorkerRecord;
use crate::{config, Job, JobId, JobPayload, JobStatus, JobUpdate, QueueError, QueueOptions, Result, RetryPolicy};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of one claim attempt
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The job is now `Processing` and owned by the caller.
    Claimed(Box<Job>),
    /// Nothing arrived within the poll timeout.
    Empty,
    /// An id was delivered but the job was no longer `Pending`.
    Lost(JobId),
}

/// Where a failed job went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying {
        attempts: u32,
        delay: Duration,
        retry_at: DateTime<Utc>,
    },
    Dead {
        attempts: u32,
    },
}

/// Job queue over a shared [`Broker`].
///
/// Cheap to clone; every clone talks to the same store.
#[derive(Clone)]
pub struct Queue {
    broker: Arc<dyn Broker>,
}

impl Queue {
    /// Connect to the Redis store described by `options`.
    pub async fn connect(options: &QueueOptions) -> Result<Self> {
        let broker = RedisBroker::connect(options).await?;
        Ok(Self::with_broker(Arc::new(broker)))
    }

    /// A queue whose state lives in this process only.
    pub fn in_memory() -> Self {
        Self::with_broker(Arc::new(MemoryBroker::new()))
    }

    pub fn with_broker(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &dyn Broker {
        self.broker.as_ref()
    }

    /// Enqueue a job with the configured retry defaults
    pub async fn enqueue(&self, payload: JobPayload) -> Result<JobId> {
        self.enqueue_with_options(payload, RetryPolicyPatch::default())
            .await
    }

    /// Enqueue a job, overriding some of the retry defaults
    pub async fn enqueue_with_options(
        &self,
        payload: JobPayload,
        overrides: RetryPolicyPatch,
    ) -> Result<JobId> {
        payload.validate()?;
        let policy = overrides.apply_to(self.retry_defaults().await?);
        config::validate_policy(&policy)?;

        let job = Job::new(payload, policy, Utc::now());
        self.broker.create_job(&job).await?;
        info!(job_id = %job.id, command = %job.command(), "Job enqueued");

        Ok(job.id)
    }

    /// Get job by ID
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.broker.get_job(id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.broker.list_jobs(status).await
    }

    /// Claim the next ready job, waiting at most `timeout`.
    pub async fn claim_job(&self, timeout: Duration, worker: &str) -> Result<ClaimOutcome> {
        let Some(id) = self.broker.pop_ready(timeout).await? else {
            return Ok(ClaimOutcome::Empty);
        };

        match self.claim_popped(id, worker).await {
            Err(e) if e.is_infrastructure() => {
                // The id is off the ready queue but the job is still pending.
                if let Err(push_err) = self.broker.push_ready(&id).await {
                    error!(job_id = %id, error = %push_err, "Failed to return unclaimed job to the ready queue");
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn claim_popped(&self, id: JobId, worker: &str) -> Result<ClaimOutcome> {
        let Some(mut job) = self.broker.get_job(&id).await? else {
            warn!(job_id = %id, "Ready id has no job record");
            return Ok(ClaimOutcome::Lost(id));
        };

        let update = JobUpdate::to(JobStatus::Processing)
            .started_at(Utc::now())
            .worker(worker);
        match self.broker.transition(&id, JobStatus::Pending, &update).await {
            Ok(()) => {
                update.apply(&mut job);
                Ok(ClaimOutcome::Claimed(Box::new(job)))
            }
            Err(e) if e.is_conflict() => {
                debug!(job_id = %id, error = %e, "Job already claimed or resolved");
                Ok(ClaimOutcome::Lost(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Complete a job successfully
    pub async fn complete_job(&self, job: &Job, output: &str) -> Result<()> {
        let update = JobUpdate::to(JobStatus::Completed)
            .result(output)
            .completed_at(Utc::now());
        match self.broker.transition(&job.id, JobStatus::Processing, &update).await {
            Err(QueueError::Conflict {
                actual: JobStatus::Completed,
                ..
            }) => Ok(()),
            other => other,
        }
    }

    /// Record a failed attempt: schedule a retry with backoff, or dead-letter
    /// the job once its retries are exhausted.
    ///
    /// Safe to call again with the same `job` after an infrastructure error;
    /// a status change that already landed is not applied twice.
    pub async fn fail_job(&self, job: &Job, error: &str) -> Result<FailureOutcome> {
        let now = Utc::now();
        let attempts = job.attempts + 1;

        match job.policy.decide(attempts) {
            RetryDecision::Exhausted => {
                let update = JobUpdate::to(JobStatus::Dead)
                    .attempts(attempts)
                    .last_error(error)
                    .reason(error)
                    .failed_at(now)
                    .clear_next_retry();
                self.apply_report(job, &update).await?;
                self.broker.append_dead(&job.id, error, now).await?;
                warn!(job_id = %job.id, attempts, reason = %error, "Job moved to dead-letter log");
                Ok(FailureOutcome::Dead { attempts })
            }
            RetryDecision::Retry { delay } => {
                let retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let update = JobUpdate::to(JobStatus::Failed)
                    .attempts(attempts)
                    .last_error(error)
                    .next_retry_at(retry_at);
                // Status first: a promoter only moves jobs that are already `Failed`.
                self.apply_report(job, &update).await?;
                self.broker.schedule(&job.id, retry_at).await?;
                info!(
                    job_id = %job.id,
                    attempts,
                    delay_secs = delay.as_secs(),
                    "Job failed, retry scheduled"
                );
                Ok(FailureOutcome::Retrying {
                    attempts,
                    delay,
                    retry_at,
                })
            }
        }
    }

    /// Apply a report transition out of `Processing`. A conflict whose actual
    /// status is already the target counts as applied by an earlier attempt
    /// of the same report.
    async fn apply_report(&self, job: &Job, update: &JobUpdate) -> Result<()> {
        match self.broker.transition(&job.id, JobStatus::Processing, update).await {
            Err(QueueError::Conflict { actual, .. }) if actual == update.status => Ok(()),
            other => other,
        }
    }

    /// Dead-lettered jobs, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for id in self.broker.dead_ids().await? {
            match self.broker.get_job(&id).await? {
                Some(job) if job.status == JobStatus::Dead => jobs.push(job),
                Some(job) => debug!(job_id = %id, status = %job.status, "Skipping requeued dead-letter entry"),
                None => warn!(job_id = %id, "Dead-letter entry without a job record"),
            }
        }
        Ok(jobs)
    }

    /// Operator requeue out of the dead-letter log: fresh attempts, back on the ready queue.
    pub async fn retry_dead(&self, id: &JobId) -> Result<()> {
        let update = JobUpdate::to(JobStatus::Pending)
            .attempts(0)
            .clear_failures()
            .clear_claim()
            .requeue();
        self.broker.transition(id, JobStatus::Dead, &update).await?;
        info!(job_id = %id, "Dead job requeued");
        // A leftover entry is harmless: listings skip ids that are no longer dead.
        if let Err(e) = self.broker.remove_dead(id).await {
            warn!(job_id = %id, error = %e, "Failed to drop requeued job from the dead-letter log");
        }
        Ok(())
    }

    /// Return `Processing` jobs claimed longer than `older_than` ago to the
    /// ready queue. Their worker is presumed dead.
    pub async fn reclaim_stale(&self, older_than: Duration) -> Result<usize> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut reclaimed = 0;
        for job in self.broker.list_jobs(Some(JobStatus::Processing)).await? {
            let stale = job.started_at.map_or(true, |started| started < cutoff);
            if stale && self.reclaim_job(&job).await? {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Move a listed `Processing` job back to the ready queue, but only while
    /// it still carries the claim seen in `snapshot`. Returns false when the
    /// job has moved on, including a fresh claim by another worker.
    async fn reclaim_job(&self, snapshot: &Job) -> Result<bool> {
        let update = JobUpdate::to(JobStatus::Pending)
            .last_error(format!(
                "reclaimed after stale claim by {}",
                snapshot.worker.as_deref().unwrap_or("unknown worker")
            ))
            .clear_claim()
            .if_claimed_as(snapshot)
            .requeue();
        match self
            .broker
            .transition(&snapshot.id, JobStatus::Processing, &update)
            .await
        {
            Ok(()) => {
                warn!(job_id = %snapshot.id, worker = ?snapshot.worker, "Reclaimed stale job");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ask every worker to stop after its current job.
    pub async fn request_stop(&self) -> Result<()> {
        self.broker.set_stop().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.broker.clear_stop().await
    }

    pub async fn stop_requested(&self) -> Result<bool> {
        self.broker.stop_requested().await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerRecord>> {
        self.broker.list_workers().await
    }

    /// Effective retry defaults for new jobs.
    pub async fn retry_defaults(&self) -> Result<RetryPolicy> {
        let values = self.broker.config_values().await?;
        config::policy_from_values(&values)
    }

    pub async fn update_config(&self, patch: RetryPolicyPatch) -> Result<RetryPolicy> {
        if patch.is_empty() {
            return Err(QueueError::Config("no configuration values given".to_string()));
        }
        let merged = patch.apply_to(self.retry_defaults().await?);
        config::validate_policy(&merged)?;
        self.broker
            .set_config_values(&config::patch_values(&patch))
            .await?;
        Ok(merged)
    }

    pub async fn reset_config(&self) -> Result<RetryPolicy> {
        let defaults = RetryPolicy::default();
        self.broker
            .set_config_values(&config::policy_values(&defaults))
            .await?;
        Ok(defaults)
    }

    /// Get queue statistics
    pub async fn get_stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats {
            ready: self.broker.ready_len().await?,
            delayed: self.broker.delayed_len().await?,
            dead_letters: self.broker.dead_ids().await?.len(),
            ..QueueStats::default()
        };
        for job in self.broker.list_jobs(None).await? {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    /// Ids waiting on the ready queue
    pub ready: usize,
    /// Ids waiting on the retry index
    pub delayed: usize,
    pub dead_letters: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }

    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Dead => self.dead,
        }
    }
}
