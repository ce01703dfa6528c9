// src/error.rs
use crate::{JobId, JobStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Store or transport failures that a worker should wait out and retry.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, QueueError::Redis(_) | QueueError::Io(_))
    }

    /// Compare-and-set mismatch or vanished record: someone else resolved the job.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            QueueError::Conflict { .. } | QueueError::JobNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
