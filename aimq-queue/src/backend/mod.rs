//! Storage backends for queued jobs.
//!
//! - [`RedisBackend`]: production store over the shared [`RedisConnection`](crate::RedisConnection)
//! - [`MemoryBackend`]: in-process store with the same semantics, for tests and local runs

mod memory;
mod redis_store;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::connection::ConnectionState;
use crate::error::QueueError;
use crate::events::JobEvent;
use crate::types::{FailureOutcome, Job, JobCounts, NewJob};

pub use self::memory::MemoryBackend;
pub use self::redis_store::RedisBackend;

/// Namespaced queue identity (`{prefix}:{name}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    prefix: String,
    name: String,
}

impl QueueKey {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
        }
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage key for one of the queue's structures, e.g. `ai-marketing:reports:wait`.
    #[inline]
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.name, suffix)
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.name)
    }
}

/// The store that owns job state transitions.
#[async_trait]
pub trait QueueBackend: Send + Sync + fmt::Debug {
    fn state(&self) -> ConnectionState;

    fn state_changes(&self) -> watch::Receiver<ConnectionState>;

    /// Persist a job and assign its id.
    async fn add(&self, queue: &QueueKey, job: NewJob) -> Result<Job, QueueError>;

    /// Persist several jobs, preserving submission order.
    async fn add_bulk(&self, queue: &QueueKey, jobs: Vec<NewJob>) -> Result<Vec<Job>, QueueError> {
        let mut added = Vec::with_capacity(jobs.len());
        for job in jobs {
            added.push(self.add(queue, job).await?);
        }
        Ok(added)
    }

    /// Claim the next eligible job, waiting up to `timeout`. Due delayed jobs are promoted first.
    async fn fetch_next(&self, queue: &QueueKey, timeout: Duration)
        -> Result<Option<Job>, QueueError>;

    async fn complete(&self, queue: &QueueKey, job: &Job, result: Value) -> Result<(), QueueError>;

    /// Record a failed attempt and either reschedule the job or mark it failed.
    async fn fail(
        &self,
        queue: &QueueKey,
        job: &Job,
        reason: &str,
    ) -> Result<FailureOutcome, QueueError>;

    async fn job_counts(&self, queue: &QueueKey) -> Result<JobCounts, QueueError>;

    async fn get_job(&self, queue: &QueueKey, id: &str) -> Result<Option<Job>, QueueError>;

    /// Release the underlying connection. Returns `false` when already closed.
    async fn close(&self) -> Result<bool, QueueError>;

    /// Lifecycle feed of `queue`, fed by every producer and worker sharing this store.
    fn event_feed(&self, queue: &QueueKey) -> broadcast::Receiver<JobEvent>;

    async fn publish(&self, queue: &QueueKey, event: JobEvent) -> Result<(), QueueError>;

    /// How often workers must renew their claim on a running job.
    /// `None` when claims never expire.
    fn lock_renewal(&self) -> Option<Duration> {
        None
    }

    /// Keep the claim on an active job alive.
    async fn extend_lock(&self, _queue: &QueueKey, _job: &Job) -> Result<(), QueueError> {
        Ok(())
    }
}
