//! Redis-backed broker for conversion jobs.
//!
//! Layout:
//! - `dwg-converter:queue` sorted set of pending job ids, scored by
//!   priority (descending) then enqueue time (ascending)
//! - `dwg-converter:job:{id}` the queued descriptor as JSON
//! - `dwg-converter:state:{id}` the current [`TaskRecord`] as JSON
//! - `dwg-converter:revoked:{id}` revocation marker
//! - `dwg-converter:workers` set of worker names, each with a
//!   `dwg-converter:worker:{name}` snapshot that expires with its heartbeat

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::job::{JobDescriptor, JobId, QueuedJob, TaskRecord, WorkerSnapshot};

/// Sorted set of pending job ids.
const QUEUE_KEY: &str = "dwg-converter:queue";

const JOB_KEY_PREFIX: &str = "dwg-converter:job";

/// State key prefix for client polling.
const STATE_KEY_PREFIX: &str = "dwg-converter:state";

const REVOKED_KEY_PREFIX: &str = "dwg-converter:revoked";

const WORKERS_KEY: &str = "dwg-converter:workers";

const WORKER_KEY_PREFIX: &str = "dwg-converter:worker";

/// Priorities are clamped into this range for scoring.
const PRIORITY_LIMIT: i64 = 255;

/// Weight of one priority step; larger than any millisecond timestamp.
const PRIORITY_WEIGHT: f64 = 1e13;

/// Interval between ZPOPMIN attempts while waiting for work.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Sets `KEYS[1]` to `ARGV[1]` with TTL `ARGV[2]` unless the stored record
/// is already terminal. Returns 1 when written.
const WRITE_UNLESS_TERMINAL: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    local state = cjson.decode(current)['state']
    if state == 'SUCCESS' or state == 'FAILURE' or state == 'REVOKED' then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return 1
"#;

/// Sets `KEYS[1]` to `ARGV[1]` with TTL `ARGV[2]` only while the stored
/// record is `PENDING`. Returns 1 when written.
const WRITE_IF_PENDING: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current or cjson.decode(current)['state'] ~= 'PENDING' then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return 1
"#;

/// Redis broker.
///
/// Claims use non-blocking `ZPOPMIN` polling so the shared multiplexed
/// connection is never parked on a blocking command.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    result_ttl_secs: u64,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, result_ttl: Duration) -> Self {
        Self {
            conn,
            result_ttl_secs: result_ttl.as_secs().max(1),
        }
    }

    pub async fn connect(url: &str, result_ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis broker");
        Ok(Self::new(conn, result_ttl))
    }

    /// Lower scores are claimed first.
    pub fn queue_score(priority: i64, enqueued_at: DateTime<Utc>) -> f64 {
        let priority = priority.clamp(-PRIORITY_LIMIT, PRIORITY_LIMIT);
        -(priority as f64) * PRIORITY_WEIGHT + enqueued_at.timestamp_millis() as f64
    }

    fn job_key(id: &JobId) -> String {
        format!("{}:{}", JOB_KEY_PREFIX, id)
    }

    fn state_key(id: &JobId) -> String {
        format!("{}:{}", STATE_KEY_PREFIX, id)
    }

    fn revoked_key(id: &JobId) -> String {
        format!("{}:{}", REVOKED_KEY_PREFIX, id)
    }

    fn worker_key(name: &str) -> String {
        format!("{}:{}", WORKER_KEY_PREFIX, name)
    }

    async fn read_state(&self, id: &JobId) -> Result<Option<TaskRecord>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(Self::state_key(id))
            .await
            .context("Failed to get job state")?;

        json.map(|json| serde_json::from_str(&json).context("Failed to deserialize job state"))
            .transpose()
    }

    async fn write_state(&self, id: &JobId, record: &TaskRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize job state")?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::state_key(id), json, self.result_ttl_secs)
            .await
            .context("Failed to update job state")?;
        debug!(job_id = %id, state = %record.state, "Updated job state");
        Ok(())
    }

    /// Runs one of the conditional write scripts against the state key.
    async fn write_state_if(&self, script: &str, id: &JobId, record: &TaskRecord) -> Result<bool> {
        let json = serde_json::to_string(record).context("Failed to serialize job state")?;
        let mut conn = self.conn.clone();
        let written: i32 = redis::Script::new(script)
            .key(Self::state_key(id))
            .arg(json)
            .arg(self.result_ttl_secs)
            .invoke_async(&mut conn)
            .await
            .context("Failed to update job state")?;
        Ok(written == 1)
    }

    async fn pop_next(&self) -> Result<Option<QueuedJob>> {
        let mut conn = self.conn.clone();
        loop {
            let popped: Vec<String> = redis::cmd("ZPOPMIN")
                .arg(QUEUE_KEY)
                .arg(1)
                .query_async(&mut conn)
                .await
                .context("Failed to pop job from queue")?;

            let Some(id) = popped.into_iter().next().map(JobId::from) else {
                return Ok(None);
            };

            let revoked: bool = conn
                .exists(Self::revoked_key(&id))
                .await
                .context("Failed to check revocation")?;
            if revoked {
                debug!(job_id = %id, "Skipping revoked job");
                continue;
            }

            let json: Option<String> = conn
                .get(Self::job_key(&id))
                .await
                .context("Failed to load queued job")?;
            match json {
                Some(json) => {
                    let job: QueuedJob =
                        serde_json::from_str(&json).context("Failed to deserialize job")?;
                    debug!(job_id = %job.id, "Dequeued job");
                    return Ok(Some(job));
                }
                None => {
                    warn!(job_id = %id, "Queued job expired before delivery");
                }
            }
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, descriptor: JobDescriptor) -> Result<JobId> {
        let job = QueuedJob::new(JobId::generate(), descriptor);
        let job_json = serde_json::to_string(&job).context("Failed to serialize job")?;
        let score = Self::queue_score(job.descriptor.priority, job.enqueued_at);

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::job_key(&job.id), &job_json, self.result_ttl_secs)
            .await
            .context("Failed to store job")?;
        self.write_state(&job.id, &TaskRecord::pending()).await?;
        conn.zadd::<_, _, _, ()>(QUEUE_KEY, job.id.as_str(), score)
            .await
            .context("Failed to push job to queue")?;

        info!(
            job_id = %job.id,
            priority = job.descriptor.priority,
            "Enqueued job"
        );
        Ok(job.id)
    }

    async fn fetch_state(&self, id: &JobId) -> Result<TaskRecord> {
        Ok(self.read_state(id).await?.unwrap_or_else(TaskRecord::pending))
    }

    async fn revoke(&self, id: &JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::revoked_key(id), "1", self.result_ttl_secs)
            .await
            .context("Failed to mark job revoked")?;
        conn.zrem::<_, _, ()>(QUEUE_KEY, id.as_str())
            .await
            .context("Failed to remove job from queue")?;

        // Running jobs keep their record until the worker stores the result.
        if self
            .write_state_if(WRITE_IF_PENDING, id, &TaskRecord::revoked())
            .await?
        {
            debug!(job_id = %id, "Revoked pending job");
        } else {
            debug!(job_id = %id, "Revoke marker set, record left to the worker");
        }
        Ok(())
    }

    async fn inspect_workers(&self) -> Result<Vec<WorkerSnapshot>> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = conn
            .smembers(WORKERS_KEY)
            .await
            .context("Failed to list workers")?;

        let mut snapshots = Vec::with_capacity(names.len());
        for name in names {
            let json: Option<String> = conn
                .get(Self::worker_key(&name))
                .await
                .context("Failed to read worker snapshot")?;
            match json.map(|json| serde_json::from_str::<WorkerSnapshot>(&json)) {
                Some(Ok(snapshot)) => snapshots.push(snapshot),
                Some(Err(e)) => warn!(worker = %name, error = %e, "Ignoring malformed worker snapshot"),
                None => {
                    // Heartbeat expired.
                    conn.srem::<_, _, ()>(WORKERS_KEY, &name)
                        .await
                        .context("Failed to drop stale worker")?;
                }
            }
        }
        Ok(snapshots)
    }

    async fn claim(&self, wait: Duration) -> Result<Option<QueuedJob>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(job) = self.pop_next().await? {
                return Ok(Some(job));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn requeue(&self, job: &QueuedJob) -> Result<()> {
        let score = Self::queue_score(job.descriptor.priority, job.enqueued_at);
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(QUEUE_KEY, job.id.as_str(), score)
            .await
            .context("Failed to requeue job")?;
        info!(job_id = %job.id, "Requeued job");
        Ok(())
    }

    async fn update_state(&self, id: &JobId, record: TaskRecord) -> Result<()> {
        if !self.write_state_if(WRITE_UNLESS_TERMINAL, id, &record).await? {
            debug!(job_id = %id, "Progress after terminal state ignored");
        }
        Ok(())
    }

    async fn store_result(&self, id: &JobId, record: TaskRecord) -> Result<()> {
        if self.write_state_if(WRITE_UNLESS_TERMINAL, id, &record).await? {
            debug!(job_id = %id, state = %record.state, "Stored job result");
        } else {
            debug!(job_id = %id, state = %record.state, "Result after terminal state ignored");
        }
        Ok(())
    }

    async fn is_revoked(&self, id: &JobId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let revoked: bool = conn
            .exists(Self::revoked_key(id))
            .await
            .context("Failed to check revocation")?;
        Ok(revoked)
    }

    async fn publish_worker(&self, snapshot: &WorkerSnapshot, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("Failed to serialize worker snapshot")?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::worker_key(&snapshot.worker), json, ttl.as_secs().max(1))
            .await
            .context("Failed to publish worker snapshot")?;
        conn.sadd::<_, _, ()>(WORKERS_KEY, &snapshot.worker)
            .await
            .context("Failed to register worker")?;
        Ok(())
    }
}
