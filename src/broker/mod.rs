// src/broker/mod.rs
//! Storage primitives shared by every worker.
//!
//! Each trait is one atomic building block; workers coordinate only through
//! these, never through in-process state. [`RedisBroker`] is the durable,
//! multi-process backend and [`MemoryBroker`] the single-process one.

mod memory;
mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

use crate::registry::WorkerRecord;
use crate::{Job, JobId, JobStatus, JobUpdate, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Durable job records with compare-and-set status transitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Write a fresh `Pending` record and make its id claimable, atomically.
    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Apply `update` only if the job is currently `expected` and any claim
    /// guard on the update still holds. An update built with
    /// [`JobUpdate::requeue`] also pushes the id onto the ready queue in the
    /// same atomic step.
    ///
    /// Fails with `Conflict` (record untouched) on a status or guard mismatch
    /// and with `JobNotFound` when there is no such job.
    async fn transition(&self, id: &JobId, expected: JobStatus, update: &JobUpdate) -> Result<()>;

    /// Snapshot in creation order; no isolation against concurrent writers.
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;
}

/// FIFO of claimable job ids.
#[async_trait]
pub trait ReadyQueue: Send + Sync {
    async fn push_ready(&self, id: &JobId) -> Result<()>;

    /// Wait up to `timeout` for an id. Each id goes to exactly one caller.
    async fn pop_ready(&self, timeout: Duration) -> Result<Option<JobId>>;

    async fn ready_len(&self) -> Result<usize>;
}

/// Time-ordered ids waiting for their retry.
#[async_trait]
pub trait DelayIndex: Send + Sync {
    async fn schedule(&self, id: &JobId, ready_at: DateTime<Utc>) -> Result<()>;

    /// Remove and return every id with `ready_at <= now`. Concurrent callers
    /// never receive the same id.
    async fn pop_due(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    async fn delayed_len(&self) -> Result<usize>;
}

/// Permanent record of jobs that exhausted their retries.
#[async_trait]
pub trait DeadLetterLog: Send + Sync {
    async fn append_dead(&self, id: &JobId, reason: &str, failed_at: DateTime<Utc>) -> Result<()>;

    /// Oldest first.
    async fn dead_ids(&self) -> Result<Vec<JobId>>;

    /// Operator requeue only. Returns whether the id was present.
    async fn remove_dead(&self, id: &JobId) -> Result<bool>;
}

/// Cooperative stop flag observed by every worker.
#[async_trait]
pub trait ControlSignal: Send + Sync {
    async fn set_stop(&self) -> Result<()>;
    async fn clear_stop(&self) -> Result<()>;
    async fn stop_requested(&self) -> Result<bool>;
}

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn put_worker(&self, record: &WorkerRecord) -> Result<()>;
    async fn remove_worker(&self, name: &str) -> Result<()>;
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>>;
}

/// Persisted `key = value` settings (retry defaults).
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn config_values(&self) -> Result<HashMap<String, String>>;
    async fn set_config_values(&self, values: &[(String, String)]) -> Result<()>;
}

/// Everything a queue needs from its backing store.
pub trait Broker:
    JobStore + ReadyQueue + DelayIndex + DeadLetterLog + ControlSignal + WorkerRegistry + ConfigStore
{
}

impl<T> Broker for T where
    T: JobStore
        + ReadyQueue
        + DelayIndex
        + DeadLetterLog
        + ControlSignal
        + WorkerRegistry
        + ConfigStore
{
}
