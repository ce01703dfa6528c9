// src/job.rs
use crate::{QueueError, Result, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|_| QueueError::Validation(format!("'{}' is not a job id", s)))
    }
}

/// Current state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }

    /// Edges of the job state machine.
    ///
    /// `Processing -> Pending` is the stale-claim reclaim and `Dead -> Pending`
    /// the operator requeue; everything else is driven by the worker loop.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
                | (Processing, Pending)
                | (Failed, Pending)
                | (Dead, Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| QueueError::Validation(format!("unknown job status '{}'", s)))
    }
}

pub(crate) fn ensure_transition(id: &JobId, from: JobStatus, to: JobStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition { id: *id, from, to })
    }
}

/// What a job runs: a shell command plus opaque key/value data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub command: String,
    /// Execution timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl JobPayload {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Parse an arbitrary JSON document into a payload, rejecting documents without a command.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let has_command = value
            .get("command")
            .map(|c| c.is_string())
            .unwrap_or(false);
        if !has_command {
            return Err(QueueError::Validation(
                "payload has no command".to_string(),
            ));
        }
        let payload: JobPayload = serde_json::from_value(value)?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(QueueError::Validation(
                "payload has no runnable command".to_string(),
            ));
        }
        if self.timeout == Some(0) {
            return Err(QueueError::Validation(
                "timeout must be at least one second".to_string(),
            ));
        }
        // data is flattened beside these keys in the stored record
        for reserved in ["command", "timeout"] {
            if self.data.contains_key(reserved) {
                return Err(QueueError::Validation(format!(
                    "'{}' is reserved and cannot be used as a data key",
                    reserved
                )));
            }
        }
        Ok(())
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Field names of the persisted job record.
pub(crate) mod fields {
    pub const STATUS: &str = "status";
    pub const ATTEMPTS: &str = "attempts";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const BACKOFF_BASE: &str = "backoff_base";
    pub const BACKOFF_FACTOR: &str = "backoff_factor";
    pub const DATA: &str = "data";
    pub const CREATED_AT: &str = "created_at";
    pub const STARTED_AT: &str = "started_at";
    pub const COMPLETED_AT: &str = "completed_at";
    pub const RESULT: &str = "result";
    pub const LAST_ERROR: &str = "last_error";
    pub const NEXT_RETRY_AT: &str = "next_retry_at";
    pub const REASON: &str = "reason";
    pub const FAILED_AT: &str = "failed_at";
    pub const WORKER: &str = "worker";
}

/// A job record as owned by the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(flatten)]
    pub policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub worker: Option<String>,
}

impl Job {
    /// A fresh `Pending` record with no attempts.
    pub fn new(payload: JobPayload, policy: RetryPolicy, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            policy,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
            next_retry_at: None,
            reason: None,
            failed_at: None,
            worker: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.payload.command
    }

    pub(crate) fn to_fields(&self) -> Result<Vec<(&'static str, String)>> {
        let mut out = vec![
            (fields::STATUS, self.status.to_string()),
            (fields::ATTEMPTS, self.attempts.to_string()),
            (fields::MAX_RETRIES, self.policy.max_retries.to_string()),
            (fields::BACKOFF_BASE, self.policy.backoff_base.to_string()),
            (fields::BACKOFF_FACTOR, self.policy.backoff_factor.to_string()),
            (fields::DATA, serde_json::to_string(&self.payload)?),
            (fields::CREATED_AT, self.created_at.to_rfc3339()),
        ];
        let timestamps = [
            (fields::STARTED_AT, self.started_at),
            (fields::COMPLETED_AT, self.completed_at),
            (fields::NEXT_RETRY_AT, self.next_retry_at),
            (fields::FAILED_AT, self.failed_at),
        ];
        for (name, value) in timestamps {
            if let Some(ts) = value {
                out.push((name, ts.to_rfc3339()));
            }
        }
        let texts = [
            (fields::RESULT, &self.result),
            (fields::LAST_ERROR, &self.last_error),
            (fields::REASON, &self.reason),
            (fields::WORKER, &self.worker),
        ];
        for (name, value) in texts {
            if let Some(text) = value {
                out.push((name, text.clone()));
            }
        }
        Ok(out)
    }

    pub(crate) fn from_fields(id: JobId, map: &HashMap<String, String>) -> Result<Self> {
        let status = required(map, id, fields::STATUS)?.parse::<JobStatus>()?;
        let data: serde_json::Value = serde_json::from_str(required(map, id, fields::DATA)?)?;
        let defaults = RetryPolicy::default();

        Ok(Self {
            id,
            payload: JobPayload::from_value(data)?,
            status,
            attempts: number(map, id, fields::ATTEMPTS)?.unwrap_or(0),
            policy: RetryPolicy {
                max_retries: number(map, id, fields::MAX_RETRIES)?.unwrap_or(defaults.max_retries),
                backoff_base: number(map, id, fields::BACKOFF_BASE)?.unwrap_or(defaults.backoff_base),
                backoff_factor: number(map, id, fields::BACKOFF_FACTOR)?
                    .unwrap_or(defaults.backoff_factor),
            },
            created_at: timestamp(map, id, fields::CREATED_AT)?
                .ok_or_else(|| corrupt(id, fields::CREATED_AT))?,
            started_at: timestamp(map, id, fields::STARTED_AT)?,
            completed_at: timestamp(map, id, fields::COMPLETED_AT)?,
            result: text(map, fields::RESULT),
            last_error: text(map, fields::LAST_ERROR),
            next_retry_at: timestamp(map, id, fields::NEXT_RETRY_AT)?,
            reason: text(map, fields::REASON),
            failed_at: timestamp(map, id, fields::FAILED_AT)?,
            worker: text(map, fields::WORKER),
        })
    }
}

fn corrupt(id: JobId, field: &str) -> QueueError {
    QueueError::Corrupt(format!("job {} has a missing or invalid '{}'", id, field))
}

fn required<'a>(map: &'a HashMap<String, String>, id: JobId, field: &str) -> Result<&'a str> {
    map.get(field)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| corrupt(id, field))
}

// Cleared fields are stored as empty strings by older writers.
fn text(map: &HashMap<String, String>, field: &str) -> Option<String> {
    map.get(field).filter(|v| !v.is_empty()).cloned()
}

fn number<T: FromStr>(map: &HashMap<String, String>, id: JobId, field: &str) -> Result<Option<T>> {
    match text(map, field) {
        Some(raw) => raw.parse().map(Some).map_err(|_| corrupt(id, field)),
        None => Ok(None),
    }
}

fn timestamp(map: &HashMap<String, String>, id: JobId, field: &str) -> Result<Option<DateTime<Utc>>> {
    match text(map, field) {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| corrupt(id, field)),
        None => Ok(None),
    }
}

/// Field updates applied together with a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub attempts: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub worker: Option<String>,
    cleared: Vec<&'static str>,
    guard: Vec<(&'static str, Option<String>)>,
    requeue: bool,
}

impl JobUpdate {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            attempts: None,
            started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
            next_retry_at: None,
            reason: None,
            failed_at: None,
            worker: None,
            cleared: Vec::new(),
            guard: Vec::new(),
            requeue: false,
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn result(mut self, output: impl Into<String>) -> Self {
        self.result = Some(output.into());
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.failed_at = Some(at);
        self
    }

    pub fn worker(mut self, name: impl Into<String>) -> Self {
        self.worker = Some(name.into());
        self
    }

    /// Drop the claim bookkeeping (`started_at`, `worker`).
    pub fn clear_claim(mut self) -> Self {
        self.cleared.extend([fields::STARTED_AT, fields::WORKER]);
        self
    }

    /// Drop every trace of earlier failures, for a fresh start out of the dead-letter log.
    pub fn clear_failures(mut self) -> Self {
        self.cleared.extend([
            fields::LAST_ERROR,
            fields::NEXT_RETRY_AT,
            fields::REASON,
            fields::FAILED_AT,
        ]);
        self
    }

    pub fn clear_next_retry(mut self) -> Self {
        self.cleared.push(fields::NEXT_RETRY_AT);
        self
    }

    /// Push the id onto the ready queue in the same atomic step as the status change.
    pub fn requeue(mut self) -> Self {
        self.requeue = true;
        self
    }

    /// Only apply while the record still carries the claim (`worker`, `started_at`) seen in `snapshot`.
    pub fn if_claimed_as(mut self, snapshot: &Job) -> Self {
        self.guard = vec![
            (fields::WORKER, snapshot.worker.clone()),
            (fields::STARTED_AT, snapshot.started_at.map(|ts| ts.to_rfc3339())),
        ];
        self
    }

    pub(crate) fn requeues(&self) -> bool {
        self.requeue
    }

    /// Fields that must still hold these values; `None` means absent.
    pub(crate) fn guard(&self) -> &[(&'static str, Option<String>)] {
        &self.guard
    }

    pub(crate) fn guard_holds(&self, job: &Job) -> bool {
        self.guard.iter().all(|(name, expected)| {
            let current = match *name {
                fields::WORKER => job.worker.clone(),
                fields::STARTED_AT => job.started_at.map(|ts| ts.to_rfc3339()),
                _ => None,
            };
            current == *expected
        })
    }

    pub(crate) fn cleared_fields(&self) -> &[&'static str] {
        &self.cleared
    }

    /// Values to write, status first.
    pub(crate) fn field_values(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![(fields::STATUS, self.status.to_string())];
        if let Some(attempts) = self.attempts {
            out.push((fields::ATTEMPTS, attempts.to_string()));
        }
        let timestamps = [
            (fields::STARTED_AT, self.started_at),
            (fields::COMPLETED_AT, self.completed_at),
            (fields::NEXT_RETRY_AT, self.next_retry_at),
            (fields::FAILED_AT, self.failed_at),
        ];
        for (name, value) in timestamps {
            if let Some(ts) = value {
                out.push((name, ts.to_rfc3339()));
            }
        }
        let texts = [
            (fields::RESULT, &self.result),
            (fields::LAST_ERROR, &self.last_error),
            (fields::REASON, &self.reason),
            (fields::WORKER, &self.worker),
        ];
        for (name, value) in texts {
            if let Some(text) = value {
                out.push((name, text.clone()));
            }
        }
        out
    }

    /// Apply to an in-memory record. Clears run first so explicit values win.
    pub(crate) fn apply(&self, job: &mut Job) {
        for field in &self.cleared {
            match *field {
                fields::STARTED_AT => job.started_at = None,
                fields::WORKER => job.worker = None,
                fields::LAST_ERROR => job.last_error = None,
                fields::NEXT_RETRY_AT => job.next_retry_at = None,
                fields::REASON => job.reason = None,
                fields::FAILED_AT => job.failed_at = None,
                _ => {}
            }
        }
        job.status = self.status;
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(ts) = self.started_at {
            job.started_at = Some(ts);
        }
        if let Some(ts) = self.completed_at {
            job.completed_at = Some(ts);
        }
        if let Some(ts) = self.next_retry_at {
            job.next_retry_at = Some(ts);
        }
        if let Some(ts) = self.failed_at {
            job.failed_at = Some(ts);
        }
        if let Some(text) = &self.result {
            job.result = Some(text.clone());
        }
        if let Some(text) = &self.last_error {
            job.last_error = Some(text.clone());
        }
        if let Some(text) = &self.reason {
            job.reason = Some(text.clone());
        }
        if let Some(text) = &self.worker {
            job.worker = Some(text.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_state_machine_edges_are_valid() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Dead));
        assert!(Failed.can_transition_to(Pending));
        assert!(Dead.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Dead));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Dead.can_transition_to(Processing));

        let id = JobId::new();
        assert!(matches!(
            ensure_transition(&id, Completed, Processing),
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("DEAD".parse::<JobStatus>().unwrap(), JobStatus::Dead);
        assert_eq!(" pending ".parse::<JobStatus>().unwrap(), JobStatus::Pending);
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn payload_without_command_is_rejected() {
        assert!(matches!(
            JobPayload::from_value(json!({ "timeout": 3 })),
            Err(QueueError::Validation(_))
        ));
        assert!(matches!(
            JobPayload::new("   ").validate(),
            Err(QueueError::Validation(_))
        ));
        assert!(JobPayload::new("echo hi").with_timeout(0).validate().is_err());
    }

    #[test]
    fn data_cannot_shadow_command_or_timeout() {
        let shadowed = JobPayload::new("echo hi").with_data("command", "rm -rf /tmp/x");
        assert!(matches!(shadowed.validate(), Err(QueueError::Validation(_))));

        let bad_timeout = JobPayload::new("echo hi").with_data("timeout", "abc");
        assert!(matches!(bad_timeout.validate(), Err(QueueError::Validation(_))));

        assert!(JobPayload::new("echo hi").with_data("owner", "ops").validate().is_ok());
    }

    #[test]
    fn claim_guard_matches_only_the_same_claim() {
        let now = Utc::now();
        let mut job = Job::new(JobPayload::new("true"), RetryPolicy::default(), now);
        job.status = JobStatus::Processing;
        job.worker = Some("w1".into());
        job.started_at = Some(now);
        let snapshot = job.clone();

        let reclaim = JobUpdate::to(JobStatus::Pending).if_claimed_as(&snapshot);
        assert!(reclaim.guard_holds(&job));

        job.started_at = Some(now + chrono::Duration::seconds(5));
        assert!(!reclaim.guard_holds(&job));

        job.started_at = snapshot.started_at;
        job.worker = Some("w2".into());
        assert!(!reclaim.guard_holds(&job));
    }

    #[test]
    fn payload_keeps_extra_data_beside_the_command() {
        let payload = JobPayload::from_value(json!({
            "command": "echo hi",
            "timeout": null,
            "owner": "ops",
        }))
        .unwrap();
        assert_eq!(payload.command, "echo hi");
        assert_eq!(payload.timeout, None);
        assert_eq!(payload.data.get("owner"), Some(&json!("ops")));
    }

    #[test]
    fn record_survives_the_hash_layout() {
        let now = Utc::now();
        let mut job = Job::new(
            JobPayload::new("echo hi").with_timeout(5).with_data("team", "infra"),
            RetryPolicy::default(),
            now,
        );
        job.attempts = 2;
        job.status = JobStatus::Failed;
        job.last_error = Some("exit code 1".into());
        job.next_retry_at = Some(now);

        let map: HashMap<String, String> = job
            .to_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = Job::from_fields(job.id, &map).unwrap();

        assert_eq!(parsed.payload, job.payload);
        assert_eq!(parsed.attempts, 2);
        assert_eq!(parsed.status, JobStatus::Failed);
        assert_eq!(parsed.last_error.as_deref(), Some("exit code 1"));
        assert_eq!(
            parsed.next_retry_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
        assert_eq!(parsed.result, None);
    }

    #[test]
    fn empty_strings_read_as_cleared_fields() {
        let job = Job::new(JobPayload::new("true"), RetryPolicy::default(), Utc::now());
        let mut map: HashMap<String, String> = job
            .to_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        map.insert("reason".into(), String::new());
        map.insert("failed_at".into(), String::new());

        let parsed = Job::from_fields(job.id, &map).unwrap();
        assert_eq!(parsed.reason, None);
        assert_eq!(parsed.failed_at, None);
    }

    #[test]
    fn missing_status_is_reported_as_corrupt() {
        let id = JobId::new();
        let map = HashMap::from([("data".to_string(), r#"{"command":"true"}"#.to_string())]);
        assert!(matches!(Job::from_fields(id, &map), Err(QueueError::Corrupt(_))));
    }

    #[test]
    fn update_clears_before_setting() {
        let now = Utc::now();
        let mut job = Job::new(JobPayload::new("true"), RetryPolicy::default(), now);
        job.status = JobStatus::Dead;
        job.attempts = 4;
        job.reason = Some("exit code 1".into());
        job.failed_at = Some(now);
        job.last_error = Some("exit code 1".into());

        JobUpdate::to(JobStatus::Pending)
            .attempts(0)
            .clear_failures()
            .last_error("requeued")
            .apply(&mut job);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.reason, None);
        assert_eq!(job.failed_at, None);
        assert_eq!(job.last_error.as_deref(), Some("requeued"));
    }
}
