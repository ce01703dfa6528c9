// src/broker/redis.rs
use super::{ConfigStore, ControlSignal, DeadLetterLog, DelayIndex, JobStore, ReadyQueue, WorkerRegistry};
use crate::job::{ensure_transition, fields};
use crate::lua::LuaScripts;
use crate::registry::WorkerRecord;
use crate::{Job, JobId, JobStatus, JobUpdate, QueueError, QueueOptions, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const POP_DUE_BATCH: usize = 500;
const STOP_FLAG: &str = "true";

/// Redis-backed broker.
///
/// Layout under the key prefix (`queuectl` by default):
///
/// | key                | type   | contents                              |
/// |--------------------|--------|---------------------------------------|
/// | `job:{id}`         | hash   | job record fields                     |
/// | `job_index`        | zset   | every job id, scored by creation time |
/// | `jobs`             | list   | ready ids (LPUSH / BRPOP)             |
/// | `retry`            | zset   | delayed ids, scored by ready-at ms    |
/// | `dead_letter`      | list   | dead-lettered ids (LPUSH)             |
/// | `stop_signal`      | string | `"true"` while a stop is requested    |
/// | `worker:{name}`    | hash   | worker record                         |
/// | `workers`          | set    | registered worker names               |
/// | `config`           | hash   | persisted retry defaults              |
pub struct RedisBroker {
    client: RedisClient,
    con: MultiplexedConnection,
    // BRPOP holds its connection for the whole wait, so blocking pops get
    // their own connections instead of stalling the shared one.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    scripts: LuaScripts,
    prefix: String,
}

impl RedisBroker {
    pub async fn connect(options: &QueueOptions) -> Result<Self> {
        let client = RedisClient::open(options.redis_url.as_str())?;
        let con = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            client,
            con,
            blocking: Mutex::new(Vec::new()),
            scripts: LuaScripts::new(),
            prefix: options.key_prefix.clone(),
        })
    }

    pub fn key_prefix(&self) -> &str {
        &self.prefix
    }

    // Redis key helpers
    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn job_index_key(&self) -> String {
        format!("{}:job_index", self.prefix)
    }

    fn ready_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn retry_key(&self) -> String {
        format!("{}:retry", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead_letter", self.prefix)
    }

    fn stop_key(&self) -> String {
        format!("{}:stop_signal", self.prefix)
    }

    fn worker_key(&self, name: &str) -> String {
        format!("{}:worker:{}", self.prefix, name)
    }

    fn workers_key(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    fn config_key(&self) -> String {
        format!("{}:config", self.prefix)
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection> {
        if let Some(con) = self.blocking.lock().await.pop() {
            return Ok(con);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn parse_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .map_err(|_| QueueError::Corrupt(format!("invalid job id '{}' in queue", raw)))
}

/// Decode listed hashes, skipping records that are gone or unreadable so one
/// bad entry cannot hide every other job.
fn decode_jobs(
    ids: &[String],
    maps: Vec<HashMap<String, String>>,
    status: Option<JobStatus>,
) -> Vec<Job> {
    let mut jobs = Vec::with_capacity(ids.len());
    for (raw, map) in ids.iter().zip(maps) {
        if map.is_empty() {
            continue;
        }
        let job = match parse_id(raw).and_then(|id| Job::from_fields(id, &map)) {
            Ok(job) => job,
            Err(error) => {
                warn!(job_id = %raw, %error, "Skipping unreadable job record");
                continue;
            }
        };
        if status.map_or(true, |s| job.status == s) {
            jobs.push(job);
        }
    }
    jobs
}

#[async_trait]
impl JobStore for RedisBroker {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut con = self.con.clone();
        let id = job.id.to_string();
        let record = job.to_fields()?;

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.job_key(&job.id), record.as_slice())
            .ignore()
            .zadd(self.job_index_key(), &id, job.created_at.timestamp_millis())
            .ignore()
            .lpush(self.ready_key(), &id)
            .ignore()
            .query_async(&mut con)
            .await?;

        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let mut con = self.con.clone();
        let map: HashMap<String, String> = con.hgetall(self.job_key(id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Job::from_fields(*id, &map).map(Some)
    }

    async fn transition(&self, id: &JobId, expected: JobStatus, update: &JobUpdate) -> Result<()> {
        ensure_transition(id, expected, update.status)?;

        let values = update.field_values();
        let deletes: Vec<&str> = update
            .cleared_fields()
            .iter()
            .copied()
            .filter(|field| !values.iter().any(|(name, _)| name == field))
            .collect();

        let push_id = if update.requeues() {
            id.to_string()
        } else {
            String::new()
        };

        let mut invocation = self.scripts.transition.prepare_invoke();
        invocation
            .key(self.job_key(id))
            .key(self.ready_key())
            .arg(expected.as_str())
            .arg(push_id)
            .arg(update.guard().len());
        for (name, value) in update.guard() {
            invocation.arg(*name).arg(value.as_deref().unwrap_or(""));
        }
        invocation.arg(values.len());
        for (name, value) in &values {
            invocation.arg(*name).arg(value);
        }
        for name in &deletes {
            invocation.arg(*name);
        }

        let mut con = self.con.clone();
        let (code, current): (i64, String) = invocation.invoke_async(&mut con).await?;
        match code {
            1 => Ok(()),
            0 => Err(QueueError::Conflict {
                id: *id,
                expected,
                actual: current.parse()?,
            }),
            _ => Err(QueueError::JobNotFound(*id)),
        }
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut con = self.con.clone();
        let ids: Vec<String> = con.zrange(self.job_index_key(), 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for raw in &ids {
            pipe.hgetall(format!("{}:job:{}", self.prefix, raw));
        }
        let maps: Vec<HashMap<String, String>> = pipe.query_async(&mut con).await?;

        Ok(decode_jobs(&ids, maps, status))
    }
}

#[async_trait]
impl ReadyQueue for RedisBroker {
    async fn push_ready(&self, id: &JobId) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.lpush(self.ready_key(), id.to_string()).await?;
        Ok(())
    }

    async fn pop_ready(&self, timeout: Duration) -> Result<Option<JobId>> {
        let mut con = self.blocking_connection().await?;
        // A zero timeout would make BRPOP block forever.
        let seconds = timeout.as_secs_f64().max(0.01);

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(self.ready_key())
            .arg(seconds)
            .query_async(&mut con)
            .await?;

        self.blocking.lock().await.push(con);
        popped.map(|(_, raw)| parse_id(&raw)).transpose()
    }

    async fn ready_len(&self) -> Result<usize> {
        let mut con = self.con.clone();
        Ok(con.llen(self.ready_key()).await?)
    }
}

#[async_trait]
impl DelayIndex for RedisBroker {
    async fn schedule(&self, id: &JobId, ready_at: DateTime<Utc>) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con
            .zadd(self.retry_key(), id.to_string(), ready_at.timestamp_millis())
            .await?;
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut con = self.con.clone();
        let mut due = Vec::new();
        loop {
            let batch: Vec<String> = self
                .scripts
                .pop_due
                .key(self.retry_key())
                .arg(now.timestamp_millis())
                .arg(POP_DUE_BATCH)
                .invoke_async(&mut con)
                .await?;
            let exhausted = batch.len() < POP_DUE_BATCH;
            for raw in &batch {
                due.push(parse_id(raw)?);
            }
            if exhausted {
                break;
            }
        }
        if !due.is_empty() {
            debug!(count = due.len(), "Took due entries off the retry index");
        }
        Ok(due)
    }

    async fn delayed_len(&self) -> Result<usize> {
        let mut con = self.con.clone();
        Ok(con.zcard(self.retry_key()).await?)
    }
}

#[async_trait]
impl DeadLetterLog for RedisBroker {
    async fn append_dead(&self, id: &JobId, reason: &str, failed_at: DateTime<Utc>) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(
                self.job_key(id),
                &[
                    (fields::REASON, reason.to_string()),
                    (fields::FAILED_AT, failed_at.to_rfc3339()),
                ],
            )
            .ignore()
            .lpush(self.dead_key(), id.to_string())
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn dead_ids(&self) -> Result<Vec<JobId>> {
        let mut con = self.con.clone();
        let raw: Vec<String> = con.lrange(self.dead_key(), 0, -1).await?;
        // LPUSH keeps the newest at the head.
        raw.iter().rev().map(|id| parse_id(id)).collect()
    }

    async fn remove_dead(&self, id: &JobId) -> Result<bool> {
        let mut con = self.con.clone();
        let removed: i64 = con.lrem(self.dead_key(), 0, id.to_string()).await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl ControlSignal for RedisBroker {
    async fn set_stop(&self) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.set(self.stop_key(), STOP_FLAG).await?;
        Ok(())
    }

    async fn clear_stop(&self) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.del(self.stop_key()).await?;
        Ok(())
    }

    async fn stop_requested(&self) -> Result<bool> {
        let mut con = self.con.clone();
        let flag: Option<String> = con.get(self.stop_key()).await?;
        Ok(flag.as_deref() == Some(STOP_FLAG))
    }
}

#[async_trait]
impl WorkerRegistry for RedisBroker {
    async fn put_worker(&self, record: &WorkerRecord) -> Result<()> {
        let mut con = self.con.clone();
        let fields = record.to_fields();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.worker_key(&record.name), fields.as_slice())
            .ignore()
            .sadd(self.workers_key(), &record.name)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn remove_worker(&self, name: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(self.worker_key(name))
            .ignore()
            .srem(self.workers_key(), name)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let mut con = self.con.clone();
        let mut names: Vec<String> = con.smembers(self.workers_key()).await?;
        if names.is_empty() {
            return Ok(Vec::new());
        }
        names.sort();

        let mut pipe = redis::pipe();
        for name in &names {
            pipe.hgetall(self.worker_key(name));
        }
        let maps: Vec<HashMap<String, String>> = pipe.query_async(&mut con).await?;

        let mut workers = Vec::with_capacity(names.len());
        for (name, map) in names.iter().zip(maps) {
            if map.is_empty() {
                continue;
            }
            match WorkerRecord::from_fields(name, &map) {
                Ok(record) => workers.push(record),
                Err(error) => warn!(worker = %name, %error, "Skipping unreadable worker record"),
            }
        }
        Ok(workers)
    }
}

#[async_trait]
impl ConfigStore for RedisBroker {
    async fn config_values(&self) -> Result<HashMap<String, String>> {
        let mut con = self.con.clone();
        Ok(con.hgetall(self.config_key()).await?)
    }

    async fn set_config_values(&self, values: &[(String, String)]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut con = self.con.clone();
        let _: () = con.hset_multiple(self.config_key(), values).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobPayload, RetryPolicy};

    fn hash_of(job: &Job) -> HashMap<String, String> {
        job.to_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn unreadable_records_are_skipped_when_listing() {
        let good = Job::new(JobPayload::new("echo ok"), RetryPolicy::default(), Utc::now());
        let mut bad_data = hash_of(&good);
        bad_data.insert(fields::DATA.to_string(), r#"{"command":"true","timeout":"abc"}"#.into());
        let mut bad_status = hash_of(&good);
        bad_status.insert(fields::STATUS.to_string(), "queued".into());

        let ids = vec![
            JobId::new().to_string(),
            "not-a-uuid".to_string(),
            good.id.to_string(),
            JobId::new().to_string(),
            JobId::new().to_string(),
        ];
        let maps = vec![
            bad_data,
            hash_of(&good),
            hash_of(&good),
            HashMap::new(),
            bad_status,
        ];

        let jobs = decode_jobs(&ids, maps, None);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, good.id);
        assert_eq!(jobs[0].payload.command, "echo ok");

        let none = decode_jobs(&ids[2..3], vec![hash_of(&good)], Some(JobStatus::Dead));
        assert!(none.is_empty());
    }
}
