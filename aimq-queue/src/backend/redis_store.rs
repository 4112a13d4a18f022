//! Redis-backed queue store.
//!
//! Key layout per queue (`{prefix}:{name}:...`):
//!
//! | key          | type   | contents                                  |
//! |--------------|--------|-------------------------------------------|
//! | `id`         | string | id counter                                |
//! | `{id}`       | hash   | job fields                                |
//! | `wait`       | list   | waiting ids, pushed left, popped right    |
//! | `active`     | list   | ids currently processed                   |
//! | `delayed`    | zset   | ids scored by due timestamp (ms)          |
//! | `completed`  | zset   | retained completed ids scored by finish   |
//! | `failed`     | zset   | retained failed ids scored by finish      |
//! | `{id}:lock`  | string | claim on an active job, expires unless renewed |
//! | `events`     | pubsub | JSON [`JobEvent`]s for every transition   |
//!
//! Active jobs whose lock expired (the worker died or could not record the
//! outcome) are moved back to `wait` by the next fetch that runs the
//! stalled check. Events are pub/sub: subscribers only see what is published
//! while they are connected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::Script;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{QueueBackend, QueueKey};
use crate::connection::{ConnectionSettings, ConnectionState, RedisConnection};
use crate::error::QueueError;
use crate::events::{JobEvent, EVENT_CHANNEL_CAPACITY};
use crate::types::{FailureOutcome, Job, JobCounts, JobState, NewJob};

/// Interval between polls of the wait list. Blocking pops would stall the shared multiplexed link.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long a claim survives without renewal.
const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
/// Minimum time between stalled checks of one queue.
const DEFAULT_STALLED_INTERVAL: Duration = Duration::from_secs(15);
/// Upper bound of delayed jobs promoted per fetch.
const PROMOTE_BATCH: isize = 100;

/// Move the next waiting id to `active`, lock it and mark it active, atomically.
///
/// KEYS: wait, active. ARGV: job key prefix, lock token, lock ms, now ms.
static CLAIM_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not id then
  return false
end
redis.call('SET', ARGV[1] .. id .. ':lock', ARGV[2], 'PX', ARGV[3])
redis.call('HSET', ARGV[1] .. id, 'state', 'active', 'processedOn', ARGV[4])
return id
"#,
    )
});

/// Requeue active ids whose lock expired. Returns the requeued ids.
///
/// KEYS: active, wait. ARGV: job key prefix.
static STALLED_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local recovered = {}
for _, id in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  if redis.call('EXISTS', ARGV[1] .. id .. ':lock') == 0 then
    redis.call('LREM', KEYS[1], 1, id)
    if redis.call('EXISTS', ARGV[1] .. id) == 1 then
      redis.call('HSET', ARGV[1] .. id, 'state', 'waiting')
      redis.call('RPUSH', KEYS[2], id)
      table.insert(recovered, id)
    end
  end
end
return recovered
"#,
    )
});

/// Epoch milliseconds `delay` after `now_ms`, saturating instead of wrapping.
fn due_at(now_ms: i64, delay: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

#[inline]
fn lock_key(queue: &QueueKey, id: &str) -> String {
    queue.key(&format!("{id}:lock"))
}

#[derive(Debug, Clone)]
pub struct RedisBackend {
    connection: RedisConnection,
    poll_interval: Duration,
    lock_duration: Duration,
    stalled_interval: Duration,
    /// Value stored in the locks this backend takes.
    token: String,
    feeds: Arc<DashMap<QueueKey, broadcast::Sender<JobEvent>>>,
    stalled_checks: Arc<DashMap<QueueKey, Instant>>,
}

impl RedisBackend {
    /// Start connecting in the background and return immediately.
    pub fn connect(settings: ConnectionSettings) -> Self {
        Self::from_connection(RedisConnection::connect(settings))
    }

    pub fn from_connection(connection: RedisConnection) -> Self {
        Self {
            connection,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_duration: DEFAULT_LOCK_DURATION,
            stalled_interval: DEFAULT_STALLED_INTERVAL,
            token: Uuid::new_v4().to_string(),
            feeds: Arc::new(DashMap::new()),
            stalled_checks: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Lock lifetime of claimed jobs. Workers renew at half this interval.
    #[must_use]
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration.max(Duration::from_millis(2));
        self
    }

    #[must_use]
    pub fn with_stalled_interval(mut self, stalled_interval: Duration) -> Self {
        self.stalled_interval = stalled_interval;
        self
    }

    fn lock_ms(&self) -> u64 {
        u64::try_from(self.lock_duration.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn connection(&self) -> &RedisConnection {
        &self.connection
    }

    /// Route command errors through the connection so dropped links trigger a reconnect.
    fn track<T>(&self, res: redis::RedisResult<T>) -> Result<T, QueueError> {
        res.map_err(|e| {
            self.connection.report_error(&e);
            QueueError::Redis(e)
        })
    }

    async fn promote_due(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &QueueKey,
    ) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let delayed = queue.key("delayed");
        let due: Vec<String> = self.track(
            redis::cmd("ZRANGEBYSCORE")
                .arg(&delayed)
                .arg("-inf")
                .arg(now)
                .arg("LIMIT")
                .arg(0)
                .arg(PROMOTE_BATCH)
                .query_async(conn)
                .await,
        )?;

        for id in due {
            // ZREM decides which consumer wins the promotion.
            let removed: i64 =
                self.track(redis::cmd("ZREM").arg(&delayed).arg(&id).query_async(conn).await)?;
            if removed == 1 {
                self.track(
                    redis::pipe()
                        .atomic()
                        .cmd("HSET")
                        .arg(queue.key(&id))
                        .arg("state")
                        .arg(JobState::Waiting.as_str())
                        .ignore()
                        .cmd("LPUSH")
                        .arg(queue.key("wait"))
                        .arg(&id)
                        .ignore()
                        .query_async::<()>(conn)
                        .await,
                )?;
            }
        }
        Ok(())
    }

    /// Requeue stalled jobs, at most once per stalled interval and queue.
    async fn recover_stalled(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &QueueKey,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        let due = match self.stalled_checks.get(queue) {
            Some(last) => now.duration_since(*last) >= self.stalled_interval,
            None => true,
        };
        if !due {
            return Ok(());
        }
        self.stalled_checks.insert(queue.clone(), now);

        let recovered: Vec<String> = self.track(
            STALLED_SCRIPT
                .key(queue.key("active"))
                .key(queue.key("wait"))
                .arg(queue.key(""))
                .invoke_async(conn)
                .await,
        )?;
        if !recovered.is_empty() {
            warn!(queue = %queue, job_ids = ?recovered, "requeued stalled jobs whose lock expired");
        }
        Ok(())
    }

    async fn load_job(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &QueueKey,
        id: &str,
    ) -> Result<Option<Job>, QueueError> {
        let fields: HashMap<String, String> = self.track(
            redis::cmd("HGETALL")
                .arg(queue.key(id))
                .query_async(conn)
                .await,
        )?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_hash(queue, id, &fields).map(Some)
    }
}

fn job_from_hash(
    queue: &QueueKey,
    id: &str,
    fields: &HashMap<String, String>,
) -> Result<Job, QueueError> {
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| QueueError::Backend(format!("job {id} is missing field `{name}`")))
    };
    let timestamp = |name: &str| -> Option<DateTime<Utc>> {
        fields
            .get(name)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    };

    Ok(Job {
        id: id.to_string(),
        queue: queue.name().to_string(),
        name: field("name")?.clone(),
        data: serde_json::from_str(field("data")?)?,
        opts: serde_json::from_str(field("opts")?)?,
        attempts_made: fields
            .get("attemptsMade")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        state: field("state")?.parse()?,
        created_at: timestamp("timestamp").unwrap_or_else(Utc::now),
        processed_at: timestamp("processedOn"),
        finished_at: timestamp("finishedOn"),
        failed_reason: fields.get("failedReason").cloned(),
        return_value: fields
            .get("returnvalue")
            .map(|v| serde_json::from_str(v))
            .transpose()?,
    })
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    async fn add(&self, queue: &QueueKey, new: NewJob) -> Result<Job, QueueError> {
        let mut conn = self.connection.get()?;
        let id: u64 = self.track(
            redis::cmd("INCR")
                .arg(queue.key("id"))
                .query_async(&mut conn)
                .await,
        )?;
        let job = Job::stored(id.to_string(), queue.name(), new);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(queue.key(&job.id))
            .arg("name")
            .arg(&job.name)
            .arg("data")
            .arg(serde_json::to_string(&job.data)?)
            .arg("opts")
            .arg(serde_json::to_string(&job.opts)?)
            .arg("attemptsMade")
            .arg(0)
            .arg("state")
            .arg(job.state.as_str())
            .arg("timestamp")
            .arg(job.created_at.timestamp_millis())
            .ignore();
        match job.opts.initial_delay() {
            Some(delay) => {
                let due = due_at(job.created_at.timestamp_millis(), delay);
                pipe.cmd("ZADD")
                    .arg(queue.key("delayed"))
                    .arg(due)
                    .arg(&job.id)
                    .ignore();
            }
            None => {
                pipe.cmd("LPUSH").arg(queue.key("wait")).arg(&job.id).ignore();
            }
        }
        self.track(pipe.query_async::<()>(&mut conn).await)?;
        Ok(job)
    }

    async fn fetch_next(
        &self,
        queue: &QueueKey,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut conn = self.connection.get()?;
            self.recover_stalled(&mut conn, queue).await?;
            self.promote_due(&mut conn, queue).await?;

            let claimed: Option<String> = self.track(
                CLAIM_SCRIPT
                    .key(queue.key("wait"))
                    .key(queue.key("active"))
                    .arg(queue.key(""))
                    .arg(&self.token)
                    .arg(self.lock_ms())
                    .arg(Utc::now().timestamp_millis())
                    .invoke_async(&mut conn)
                    .await,
            )?;

            if let Some(id) = claimed {
                match self.load_job(&mut conn, queue, &id).await? {
                    Some(job) => return Ok(Some(job)),
                    None => {
                        // Hash vanished underneath us; drop the dangling id.
                        self.track(
                            redis::pipe()
                                .cmd("LREM")
                                .arg(queue.key("active"))
                                .arg(0)
                                .arg(&id)
                                .ignore()
                                .cmd("DEL")
                                .arg(lock_key(queue, &id))
                                .ignore()
                                .query_async::<()>(&mut conn)
                                .await,
                        )?;
                        continue;
                    }
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn complete(&self, queue: &QueueKey, job: &Job, result: Value) -> Result<(), QueueError> {
        let mut conn = self.connection.get()?;
        let finished_on = Utc::now().timestamp_millis();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(queue.key("active"))
            .arg(0)
            .arg(&job.id)
            .ignore()
            .cmd("DEL")
            .arg(lock_key(queue, &job.id))
            .ignore();
        if job.opts.remove_on_complete {
            pipe.cmd("DEL").arg(queue.key(&job.id)).ignore();
        } else {
            pipe.cmd("HSET")
                .arg(queue.key(&job.id))
                .arg("state")
                .arg(JobState::Completed.as_str())
                .arg("finishedOn")
                .arg(finished_on)
                .arg("returnvalue")
                .arg(serde_json::to_string(&result)?)
                .ignore()
                .cmd("ZADD")
                .arg(queue.key("completed"))
                .arg(finished_on)
                .arg(&job.id)
                .ignore();
        }
        self.track(pipe.query_async::<()>(&mut conn).await)
    }

    async fn fail(
        &self,
        queue: &QueueKey,
        job: &Job,
        reason: &str,
    ) -> Result<FailureOutcome, QueueError> {
        let mut conn = self.connection.get()?;
        let mut failed = job.clone();
        failed.attempts_made += 1;
        let attempts_made = failed.attempts_made;
        let now = Utc::now().timestamp_millis();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(queue.key("active"))
            .arg(0)
            .arg(&job.id)
            .ignore()
            .cmd("DEL")
            .arg(lock_key(queue, &job.id))
            .ignore();

        let outcome = match failed.retry_delay() {
            Some(delay) => {
                pipe.cmd("HSET")
                    .arg(queue.key(&job.id))
                    .arg("state")
                    .arg(JobState::Delayed.as_str())
                    .arg("attemptsMade")
                    .arg(attempts_made)
                    .arg("failedReason")
                    .arg(reason)
                    .ignore()
                    .cmd("ZADD")
                    .arg(queue.key("delayed"))
                    .arg(due_at(now, delay))
                    .arg(&job.id)
                    .ignore();
                FailureOutcome::Retrying {
                    delay,
                    attempts_made,
                }
            }
            None if job.opts.remove_on_fail => {
                pipe.cmd("DEL").arg(queue.key(&job.id)).ignore();
                FailureOutcome::Failed { attempts_made }
            }
            None => {
                pipe.cmd("HSET")
                    .arg(queue.key(&job.id))
                    .arg("state")
                    .arg(JobState::Failed.as_str())
                    .arg("attemptsMade")
                    .arg(attempts_made)
                    .arg("failedReason")
                    .arg(reason)
                    .arg("finishedOn")
                    .arg(now)
                    .ignore()
                    .cmd("ZADD")
                    .arg(queue.key("failed"))
                    .arg(now)
                    .arg(&job.id)
                    .ignore();
                FailureOutcome::Failed { attempts_made }
            }
        };

        self.track(pipe.query_async::<()>(&mut conn).await)?;
        Ok(outcome)
    }

    async fn job_counts(&self, queue: &QueueKey) -> Result<JobCounts, QueueError> {
        let mut conn = self.connection.get()?;
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = self
            .track(
                redis::pipe()
                    .cmd("LLEN")
                    .arg(queue.key("wait"))
                    .cmd("ZCARD")
                    .arg(queue.key("delayed"))
                    .cmd("LLEN")
                    .arg(queue.key("active"))
                    .cmd("ZCARD")
                    .arg(queue.key("completed"))
                    .cmd("ZCARD")
                    .arg(queue.key("failed"))
                    .query_async(&mut conn)
                    .await,
            )?;
        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn get_job(&self, queue: &QueueKey, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.connection.get()?;
        self.load_job(&mut conn, queue, id).await
    }

    async fn close(&self) -> Result<bool, QueueError> {
        self.connection.close().await
    }

    fn event_feed(&self, queue: &QueueKey) -> broadcast::Receiver<JobEvent> {
        self.feeds
            .entry(queue.clone())
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
                tokio::spawn(forward_events(
                    self.connection.clone(),
                    queue.key("events"),
                    sender.clone(),
                ));
                sender
            })
            .subscribe()
    }

    async fn publish(&self, queue: &QueueKey, event: JobEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.connection.get()?;
        self.track(
            redis::cmd("PUBLISH")
                .arg(queue.key("events"))
                .arg(payload)
                .query_async::<()>(&mut conn)
                .await,
        )
    }

    fn lock_renewal(&self) -> Option<Duration> {
        Some(self.lock_duration / 2)
    }

    async fn extend_lock(&self, queue: &QueueKey, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.connection.get()?;
        let renewed: i64 = self.track(
            redis::cmd("PEXPIRE")
                .arg(lock_key(queue, &job.id))
                .arg(self.lock_ms())
                .query_async(&mut conn)
                .await,
        )?;
        if renewed == 0 {
            warn!(queue = %queue, job_id = %job.id, "job lock expired before renewal; the job may run twice");
        }
        Ok(())
    }
}

/// Relay the queue's pub/sub channel into `sender` until the connection closes.
async fn forward_events(
    connection: RedisConnection,
    channel: String,
    sender: broadcast::Sender<JobEvent>,
) {
    let cancel = connection.cancellation();
    let mut state = connection.state_changes();
    let mut failures = 0u32;

    loop {
        let ready = tokio::select! {
            _ = cancel.cancelled() => return,
            ready = state.wait_for(|s| *s == ConnectionState::Connected) => ready.is_ok(),
        };
        if !ready {
            return;
        }

        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return,
            subscribed = connection.subscribe(&channel) => subscribed,
        };
        let mut pubsub = match subscribed {
            Ok(pubsub) => {
                failures = 0;
                debug!(channel = %channel, "subscribed to queue events");
                pubsub
            }
            Err(err) => {
                failures += 1;
                let Some(delay) = connection.retry_policy().delay_for(failures) else {
                    warn!(channel = %channel, attempts = failures, error = %err, "giving up on queue event subscription");
                    return;
                };
                warn!(channel = %channel, attempt = failures, error = %err, "queue event subscription failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        let messages = pubsub.on_message();
        tokio::pin!(messages);
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = messages.next() => message,
            };
            let Some(message) = message else {
                break;
            };
            let decoded = message
                .get_payload::<String>()
                .map_err(QueueError::from)
                .and_then(|payload| serde_json::from_str::<JobEvent>(&payload).map_err(QueueError::from));
            match decoded {
                Ok(event) => {
                    let _ = sender.send(event);
                }
                Err(err) => warn!(channel = %channel, error = %err, "dropping malformed queue event"),
            }
        }
        warn!(channel = %channel, "queue event subscription ended, resubscribing");
    }
}
