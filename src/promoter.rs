// src/promoter.rs
use crate::broker::Broker;
use crate::{JobId, JobStatus, JobUpdate, Queue, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Moves due retries from the delay index back onto the ready queue.
///
/// Any number of workers may run this at once; `pop_due` hands each due
/// id to exactly one caller.
#[derive(Clone)]
pub struct RetryPromoter {
    queue: Queue,
}

impl RetryPromoter {
    pub fn new(queue: Queue) -> Self {
        Self { queue }
    }

    /// Promote every retry due at `now`. Returns how many jobs were requeued.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let broker = self.queue.broker();
        let due = broker.pop_due(now).await?;
        if due.is_empty() {
            return Ok(0);
        }

        // The status change and the ready push land together or not at all.
        let update = JobUpdate::to(JobStatus::Pending).clear_next_retry().requeue();
        let mut promoted = 0;
        for (index, id) in due.iter().enumerate() {
            match broker.transition(id, JobStatus::Failed, &update).await {
                Ok(()) => promoted += 1,
                Err(e) if e.is_conflict() => {
                    warn!(job_id = %id, error = %e, "Skipping retry entry for job that is no longer failed");
                }
                Err(e) => {
                    // Popped ids are gone from the index; put back what is left.
                    restore(broker, &due[index..], now).await;
                    return Err(e);
                }
            }
        }

        if promoted > 0 {
            info!(count = promoted, "Promoted delayed jobs to ready");
        }
        Ok(promoted)
    }
}

async fn restore(broker: &dyn Broker, ids: &[JobId], at: DateTime<Utc>) {
    for id in ids {
        if let Err(e) = broker.schedule(id, at).await {
            warn!(job_id = %id, error = %e, "Failed to restore retry entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ClaimOutcome;
    use crate::{JobPayload, RetryPolicyPatch};
    use std::time::Duration;

    #[tokio::test]
    async fn promotes_only_due_failed_jobs() {
        let queue = Queue::in_memory();
        let id = queue
            .enqueue_with_options(
                JobPayload::new("false"),
                RetryPolicyPatch {
                    backoff_base: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let job = match queue.claim_job(Duration::from_millis(50), "w").await.unwrap() {
            ClaimOutcome::Claimed(job) => job,
            other => panic!("unexpected {:?}", other),
        };
        queue.fail_job(&job, "boom").await.unwrap();

        let promoter = RetryPromoter::new(queue.clone());
        assert_eq!(promoter.promote_due(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(2);
        assert_eq!(promoter.promote_due(later).await.unwrap(), 1);

        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.next_retry_at, None);
        assert_eq!(queue.broker().ready_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stray_entry_for_non_failed_job_is_dropped() {
        let queue = Queue::in_memory();
        let id = queue.enqueue(JobPayload::new("true")).await.unwrap();
        queue.broker().schedule(&id, Utc::now()).await.unwrap();

        let promoter = RetryPromoter::new(queue.clone());
        assert_eq!(promoter.promote_due(Utc::now()).await.unwrap(), 0);
        assert_eq!(queue.broker().delayed_len().await.unwrap(), 0);
        assert_eq!(queue.broker().ready_len().await.unwrap(), 1);
    }
}
