//! Named queue handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::backend::{QueueBackend, QueueKey};
use crate::error::QueueError;
use crate::types::{BulkJob, Job, JobCounts, JobOptions, JobOptionsOverride, NewJob};

/// Handle to one queue, bound to the service's shared backend.
pub struct Queue {
    key: QueueKey,
    defaults: JobOptions,
    backend: Arc<dyn QueueBackend>,
    closed: AtomicBool,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("key", &self.key)
            .field("defaults", &self.defaults)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Queue {
    pub(crate) fn new(key: QueueKey, defaults: JobOptions, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            key,
            defaults,
            backend,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.key.name()
    }

    #[inline]
    pub fn prefix(&self) -> &str {
        self.key.prefix()
    }

    #[inline]
    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    #[inline]
    pub fn default_options(&self) -> &JobOptions {
        &self.defaults
    }

    /// Options a job submitted with `overrides` would carry.
    pub fn effective_options(&self, overrides: Option<&JobOptionsOverride>) -> JobOptions {
        match overrides {
            Some(o) => self.defaults.merged(o),
            None => self.defaults.clone(),
        }
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            Err(QueueError::QueueClosed(self.key.name().to_string()))
        } else {
            Ok(())
        }
    }

    /// Enqueue one job. The payload is stored as given.
    pub async fn add(
        &self,
        name: impl Into<String>,
        data: Value,
        overrides: Option<JobOptionsOverride>,
    ) -> Result<Job, QueueError> {
        self.ensure_open()?;
        let new = NewJob {
            name: name.into(),
            data,
            opts: self.effective_options(overrides.as_ref()),
        };
        let job = self.backend.add(&self.key, new).await?;
        debug!(queue = %self.key, job_id = %job.id, job_name = %job.name, "job added");
        Ok(job)
    }

    /// Enqueue several jobs in order.
    pub async fn add_bulk(&self, jobs: Vec<BulkJob>) -> Result<Vec<Job>, QueueError> {
        self.ensure_open()?;
        let new_jobs = jobs
            .into_iter()
            .map(|j| NewJob {
                opts: self.effective_options(j.opts.as_ref()),
                name: j.name,
                data: j.data,
            })
            .collect();
        let added = self.backend.add_bulk(&self.key, new_jobs).await?;
        debug!(queue = %self.key, count = added.len(), "jobs added in bulk");
        Ok(added)
    }

    pub async fn job_counts(&self) -> Result<JobCounts, QueueError> {
        self.backend.job_counts(&self.key).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.backend.get_job(&self.key, id).await
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting submissions. Returns `false` when already closed.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::types::Backoff;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn queue() -> Queue {
        Queue::new(
            QueueKey::new("ai-marketing", "notifications"),
            JobOptions::with_defaults(5, 5000),
            Arc::new(MemoryBackend::new()),
        )
    }

    #[tokio::test]
    async fn add_applies_defaults() {
        let q = queue();
        let job = q
            .add("send-email", json!({ "to": "a@b.com" }), None)
            .await
            .unwrap();
        assert_eq!(job.opts, JobOptions::with_defaults(5, 5000));
        assert_eq!(job.data, json!({ "to": "a@b.com" }));
    }

    #[tokio::test]
    async fn bulk_merges_each_override() {
        let q = queue();
        let jobs = q
            .add_bulk(vec![
                BulkJob::new("a", json!(1)),
                BulkJob::new("b", json!(2))
                    .with_options(JobOptionsOverride::default().backoff(Backoff::fixed(1))),
            ])
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].opts.backoff, Backoff::exponential(5000));
        assert_eq!(jobs[1].opts.backoff, Backoff::fixed(1));
        assert_eq!(jobs[1].opts.attempts, 5);
        assert_ne!(jobs[0].id, jobs[1].id);
    }

    #[tokio::test]
    async fn closed_queue_rejects_submissions() {
        let q = queue();
        assert!(q.close());
        assert!(!q.close());
        let err = assert_err!(q.add("x", Value::Null, None).await);
        assert!(matches!(err, QueueError::QueueClosed(name) if name == "notifications"));
        assert_ok!(q.job_counts().await);
    }
}
