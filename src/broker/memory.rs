// src/broker/memory.rs
use super::{ConfigStore, ControlSignal, DeadLetterLog, DelayIndex, JobStore, ReadyQueue, WorkerRegistry};
use crate::job::ensure_transition;
use crate::registry::WorkerRecord;
use crate::{Job, JobId, JobStatus, JobUpdate, QueueError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
    ready: VecDeque<JobId>,
    delayed: BTreeSet<(i64, JobId)>,
    delayed_at: HashMap<JobId, i64>,
    dead: Vec<JobId>,
    stop: bool,
    workers: BTreeMap<String, WorkerRecord>,
    config: HashMap<String, String>,
}

/// Single-process broker: all state behind one mutex, ready-queue wakeups
/// through a [`Notify`]. Every worker holding a clone of the same `Arc`
/// observes the same stop flag.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    ready_signal: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryBroker {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(QueueError::Validation(format!("job {} already exists", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        state.order.push(job.id);
        state.ready.push_back(job.id);
        drop(state);

        self.ready_signal.notify_one();
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(id).cloned())
    }

    async fn transition(&self, id: &JobId, expected: JobStatus, update: &JobUpdate) -> Result<()> {
        ensure_transition(id, expected, update.status)?;

        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(id).ok_or(QueueError::JobNotFound(*id))?;
        if job.status != expected || !update.guard_holds(job) {
            return Err(QueueError::Conflict {
                id: *id,
                expected,
                actual: job.status,
            });
        }
        update.apply(job);
        if update.requeues() {
            state.ready.push_back(*id);
            drop(state);
            self.ready_signal.notify_one();
        }
        Ok(())
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReadyQueue for MemoryBroker {
    async fn push_ready(&self, id: &JobId) -> Result<()> {
        self.state.lock().await.ready.push_back(*id);
        self.ready_signal.notify_one();
        Ok(())
    }

    async fn pop_ready(&self, timeout: Duration) -> Result<Option<JobId>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before checking so a push in between is not missed.
            let notified = self.ready_signal.notified();

            if let Some(id) = self.state.lock().await.ready.pop_front() {
                return Ok(Some(id));
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(self.state.lock().await.ready.pop_front());
            }
        }
    }

    async fn ready_len(&self) -> Result<usize> {
        Ok(self.state.lock().await.ready.len())
    }
}

#[async_trait]
impl DelayIndex for MemoryBroker {
    async fn schedule(&self, id: &JobId, ready_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let score = ready_at.timestamp_millis();
        if let Some(previous) = state.delayed_at.insert(*id, score) {
            state.delayed.remove(&(previous, *id));
        }
        state.delayed.insert((score, *id));
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut state = self.state.lock().await;
        let cutoff = now.timestamp_millis();
        let mut due = Vec::new();
        while let Some(&(score, id)) = state.delayed.first() {
            if score > cutoff {
                break;
            }
            state.delayed.pop_first();
            state.delayed_at.remove(&id);
            due.push(id);
        }
        Ok(due)
    }

    async fn delayed_len(&self) -> Result<usize> {
        Ok(self.state.lock().await.delayed.len())
    }
}

#[async_trait]
impl DeadLetterLog for MemoryBroker {
    async fn append_dead(&self, id: &JobId, reason: &str, failed_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(id) {
            job.reason = Some(reason.to_string());
            job.failed_at = Some(failed_at);
        }
        state.dead.push(*id);
        Ok(())
    }

    async fn dead_ids(&self) -> Result<Vec<JobId>> {
        Ok(self.state.lock().await.dead.clone())
    }

    async fn remove_dead(&self, id: &JobId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.dead.len();
        state.dead.retain(|dead| dead != id);
        Ok(state.dead.len() != before)
    }
}

#[async_trait]
impl ControlSignal for MemoryBroker {
    async fn set_stop(&self) -> Result<()> {
        self.state.lock().await.stop = true;
        Ok(())
    }

    async fn clear_stop(&self) -> Result<()> {
        self.state.lock().await.stop = false;
        Ok(())
    }

    async fn stop_requested(&self) -> Result<bool> {
        Ok(self.state.lock().await.stop)
    }
}

#[async_trait]
impl WorkerRegistry for MemoryBroker {
    async fn put_worker(&self, record: &WorkerRecord) -> Result<()> {
        self.state
            .lock()
            .await
            .workers
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn remove_worker(&self, name: &str) -> Result<()> {
        self.state.lock().await.workers.remove(name);
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        Ok(self.state.lock().await.workers.values().cloned().collect())
    }
}

#[async_trait]
impl ConfigStore for MemoryBroker {
    async fn config_values(&self) -> Result<HashMap<String, String>> {
        Ok(self.state.lock().await.config.clone())
    }

    async fn set_config_values(&self, values: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock().await;
        for (key, value) in values {
            state.config.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}
