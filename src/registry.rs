// src/registry.rs
//! Ephemeral worker records, kept for observability only.
//!
//! Every write here is best-effort: failures are logged and swallowed, since
//! losing a record never affects job correctness.

use crate::broker::WorkerRegistry;
use crate::{JobId, QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Idle,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "idle" => Ok(WorkerStatus::Idle),
            "stopped" => Ok(WorkerStatus::Stopped),
            other => Err(QueueError::Corrupt(format!("unknown worker status '{}'", other))),
        }
    }
}

const IDLE_JOB: &str = "idle";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    pub status: WorkerStatus,
    pub current_job: Option<JobId>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(name: impl Into<String>, status: WorkerStatus, current_job: Option<JobId>) -> Self {
        Self {
            name: name.into(),
            status,
            current_job,
            updated_at: Utc::now(),
        }
    }

    /// `current_job` as shown to operators.
    pub fn current_job_label(&self) -> String {
        self.current_job
            .map(|id| id.to_string())
            .unwrap_or_else(|| IDLE_JOB.to_string())
    }

    pub(crate) fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("status", self.status.to_string()),
            ("current_job", self.current_job_label()),
            ("updated_at", self.updated_at.to_rfc3339()),
        ]
    }

    pub(crate) fn from_fields(name: &str, map: &HashMap<String, String>) -> Result<Self> {
        let status = map
            .get("status")
            .ok_or_else(|| QueueError::Corrupt(format!("worker {} has no status", name)))?
            .parse()?;
        let current_job = match map.get("current_job").map(String::as_str) {
            None | Some(IDLE_JOB) | Some("-") | Some("") => None,
            Some(raw) => Some(raw.parse()?),
        };
        let updated_at = map
            .get("updated_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            name: name.to_string(),
            status,
            current_job,
            updated_at,
        })
    }
}

pub async fn register<R: WorkerRegistry + ?Sized>(registry: &R, name: &str) {
    let record = WorkerRecord::new(name, WorkerStatus::Active, None);
    if let Err(e) = registry.put_worker(&record).await {
        warn!(worker = %name, error = %e, "Failed to register worker");
    }
}

pub async fn set_current_job<R: WorkerRegistry + ?Sized>(registry: &R, name: &str, job: Option<JobId>) {
    let status = if job.is_some() {
        WorkerStatus::Active
    } else {
        WorkerStatus::Idle
    };
    let record = WorkerRecord::new(name, status, job);
    if let Err(e) = registry.put_worker(&record).await {
        warn!(worker = %name, error = %e, "Failed to update worker record");
    }
}

pub async fn mark_stopped<R: WorkerRegistry + ?Sized>(registry: &R, name: &str) {
    let record = WorkerRecord::new(name, WorkerStatus::Stopped, None);
    if let Err(e) = registry.put_worker(&record).await {
        warn!(worker = %name, error = %e, "Failed to mark worker stopped");
    }
}

pub async fn unregister<R: WorkerRegistry + ?Sized>(registry: &R, name: &str) {
    if let Err(e) = registry.remove_worker(name).await {
        warn!(worker = %name, error = %e, "Failed to unregister worker");
    }
}
