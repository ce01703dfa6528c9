// src/lib.rs
//! queuectl: a durable job queue for shell commands.
//!
//! Jobs are shell commands persisted in a shared store (Redis, or memory for
//! a single process). Any number of workers claim them from a FIFO ready
//! queue, run them, and record the result. Failed jobs are retried with
//! exponential backoff and land in a dead-letter log once their retries
//! are spent.

pub mod backoff;
pub mod broker;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod lua;
pub mod pool;
pub mod promoter;
pub mod queue;
pub mod registry;
pub mod worker;

pub use backoff::{RetryDecision, RetryPolicy, RetryPolicyPatch};
pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use config::QueueOptions;
pub use error::{QueueError, Result};
pub use executor::{ExecutionOutcome, JobExecutor, ShellExecutor};
pub use job::{Job, JobId, JobPayload, JobStatus, JobUpdate};
pub use pool::{PoolSummary, WorkerPool};
pub use promoter::RetryPromoter;
pub use queue::{ClaimOutcome, FailureOutcome, Queue, QueueStats};
pub use registry::{WorkerRecord, WorkerStatus};
pub use worker::{StepOutcome, Worker, WorkerBuilder, WorkerConfig, WorkerState};

// Re-export commonly used types
pub use async_trait::async_trait;
