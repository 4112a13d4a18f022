//! The queue service: one shared backend, cached queue and event handles,
//! worker construction and ordered shutdown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::backend::{MemoryBackend, QueueBackend, QueueKey, RedisBackend};
use crate::connection::{ConnectionSettings, ConnectionState};
use crate::error::QueueError;
use crate::events::{JobEvent, QueueEvents};
use crate::processor::JobProcessor;
use crate::queue::Queue;
use crate::types::{BulkJob, Job, JobCounts, JobOptions, JobOptionsOverride, JobState};
use crate::worker::{Worker, WorkerOptions};

pub const DEFAULT_PREFIX: &str = "ai-marketing";
pub const DEFAULT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 5000;

/// Service-wide queue defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Key namespace shared by every queue of the service.
    pub prefix: String,
    pub default_attempts: u32,
    pub default_concurrency: usize,
    pub backoff_delay_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            default_attempts: DEFAULT_ATTEMPTS,
            default_concurrency: DEFAULT_CONCURRENCY,
            backoff_delay_ms: DEFAULT_BACKOFF_DELAY_MS,
        }
    }
}

impl QueueSettings {
    /// Options applied to every job that carries no override.
    pub fn default_job_options(&self) -> JobOptions {
        JobOptions::with_defaults(self.default_attempts, self.backoff_delay_ms)
    }
}

/// A resource released by [`QueueService::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedResource {
    Worker(String),
    Queue(String),
    Events(String),
    Connection,
}

impl fmt::Display for ClosedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker(q) => write!(f, "worker({q})"),
            Self::Queue(q) => write!(f, "queue({q})"),
            Self::Events(q) => write!(f, "events({q})"),
            Self::Connection => f.write_str("connection"),
        }
    }
}

/// What a shutdown closed, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub closed: Vec<ClosedResource>,
}

impl ShutdownReport {
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty()
    }
}

/// Owns the backend and every queue, event stream and worker created through it.
pub struct QueueService {
    settings: QueueSettings,
    defaults: JobOptions,
    backend: Arc<dyn QueueBackend>,
    queues: DashMap<String, Arc<Queue>>,
    events: DashMap<String, Arc<QueueEvents>>,
    workers: Mutex<Vec<Worker>>,
    closed: AtomicBool,
}

impl fmt::Debug for QueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueService")
            .field("settings", &self.settings)
            .field("backend", &self.backend)
            .field("queues", &self.queues.len())
            .field("events", &self.events.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl QueueService {
    pub fn new(settings: QueueSettings, backend: Arc<dyn QueueBackend>) -> Self {
        let defaults = settings.default_job_options();
        Self {
            settings,
            defaults,
            backend,
            queues: DashMap::new(),
            events: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Build a service over Redis. Returns immediately; the connection is
    /// established in the background and failures are only logged.
    pub fn connect(settings: QueueSettings, connection: ConnectionSettings) -> Self {
        info!(prefix = %settings.prefix, "starting queue service on redis");
        Self::new(settings, Arc::new(RedisBackend::connect(connection)))
    }

    pub fn in_memory(settings: QueueSettings) -> Self {
        info!(prefix = %settings.prefix, "starting queue service in memory");
        Self::new(settings, Arc::new(MemoryBackend::new()))
    }

    #[inline]
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    #[inline]
    pub fn default_job_options(&self) -> &JobOptions {
        &self.defaults
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    #[inline]
    pub fn connection_state(&self) -> ConnectionState {
        self.backend.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.backend.state_changes()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, queue: &str) -> Result<(), QueueError> {
        if self.is_closed() {
            Err(QueueError::QueueClosed(queue.to_string()))
        } else {
            Ok(())
        }
    }

    /// Get the queue handle for `name`, creating it on first use.
    pub fn queue(&self, name: &str) -> Result<Arc<Queue>, QueueError> {
        self.ensure_open(name)?;
        let queue = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = name, prefix = %self.settings.prefix, "creating queue");
                Arc::new(Queue::new(
                    QueueKey::new(&self.settings.prefix, name),
                    self.defaults.clone(),
                    Arc::clone(&self.backend),
                ))
            })
            .clone();
        // Lost a race with shutdown: the handle may have missed the drain.
        if self.is_closed() {
            queue.close();
            return Err(QueueError::QueueClosed(name.to_string()));
        }
        Ok(queue)
    }

    /// Get the event stream for `name`, creating it on first use.
    pub fn get_queue_events(&self, name: &str) -> Result<Arc<QueueEvents>, QueueError> {
        self.ensure_open(name)?;
        let events = self
            .events
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = name, "creating queue events");
                let feed = self
                    .backend
                    .event_feed(&QueueKey::new(&self.settings.prefix, name));
                Arc::new(QueueEvents::new(name, feed))
            })
            .clone();
        if self.is_closed() {
            events.close();
            return Err(QueueError::QueueClosed(name.to_string()));
        }
        Ok(events)
    }

    pub async fn add_job(
        &self,
        queue: &str,
        name: impl Into<String>,
        data: Value,
        overrides: Option<JobOptionsOverride>,
    ) -> Result<Job, QueueError> {
        let handle = self.queue(queue)?;
        let job = handle.add(name, data, overrides).await?;
        self.announce(handle.key(), &job).await;
        Ok(job)
    }

    pub async fn add_bulk(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<Job>, QueueError> {
        let handle = self.queue(queue)?;
        let added = handle.add_bulk(jobs).await?;
        for job in &added {
            self.announce(handle.key(), job).await;
        }
        Ok(added)
    }

    async fn announce(&self, queue: &QueueKey, job: &Job) {
        let event = match job.state {
            JobState::Delayed => JobEvent::Delayed {
                job_id: job.id.clone(),
                name: job.name.clone(),
                delay_ms: job.opts.delay.unwrap_or_default(),
                timestamp: job.created_at,
            },
            _ => JobEvent::Waiting {
                job_id: job.id.clone(),
                name: job.name.clone(),
                timestamp: job.created_at,
            },
        };
        if let Err(err) = self.backend.publish(queue, event).await {
            warn!(queue = %queue, job_id = %job.id, error = %err, "failed to publish job event");
        }
    }

    /// Start a worker on `queue`. The service keeps track of it and closes it on shutdown.
    pub async fn create_worker<P>(
        &self,
        queue: &str,
        processor: P,
        options: Option<WorkerOptions>,
    ) -> Result<Worker, QueueError>
    where
        P: JobProcessor + 'static,
    {
        let options = options.unwrap_or_default();
        let concurrency = options
            .concurrency
            .unwrap_or(self.settings.default_concurrency);
        let key = self.queue(queue)?.key().clone();

        // Checked under the lock so shutdown cannot miss a worker started concurrently.
        let mut workers = self.workers.lock().await;
        self.ensure_open(queue)?;
        let worker = Worker::spawn(
            key,
            Arc::clone(&self.backend),
            Arc::new(processor),
            concurrency,
            options,
        );
        workers.push(worker.clone());
        Ok(worker)
    }

    pub async fn get_job_counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.queue(queue)?.job_counts().await
    }

    pub async fn get_job(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        self.queue(queue)?.get_job(id).await
    }

    /// Close workers, then queues, then event streams, then the connection.
    ///
    /// Every resource is attempted even when an earlier close fails; the first
    /// failure is returned once all closes ran. A second call closes nothing.
    pub async fn shutdown(&self) -> Result<ShutdownReport, QueueError> {
        info!("shutting down queue service");
        self.closed.store(true, Ordering::SeqCst);
        let mut report = ShutdownReport::default();
        let mut first_error: Option<QueueError> = None;

        let workers: Vec<Worker> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            match worker.close().await {
                Ok(true) => report
                    .closed
                    .push(ClosedResource::Worker(worker.queue_name().to_string())),
                Ok(false) => {}
                Err(err) => {
                    warn!(queue = worker.queue_name(), error = %err, "failed to close worker");
                    first_error.get_or_insert(err);
                }
            }
        }

        for (name, queue) in drain_sorted(&self.queues) {
            if queue.close() {
                report.closed.push(ClosedResource::Queue(name));
            }
        }

        for (name, events) in drain_sorted(&self.events) {
            if events.close() {
                report.closed.push(ClosedResource::Events(name));
            }
        }

        match self.backend.close().await {
            Ok(true) => report.closed.push(ClosedResource::Connection),
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "failed to close queue connection");
                first_error.get_or_insert(err);
            }
        }

        info!(closed = report.closed.len(), "queue service shut down");
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

/// Empty a cache, returning its entries ordered by name.
fn drain_sorted<V>(map: &DashMap<String, Arc<V>>) -> Vec<(String, Arc<V>)> {
    let mut names: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
        .into_iter()
        .filter_map(|name| map.remove(&name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Backoff;
    use serde_json::json;

    #[test]
    fn defaults_match_service_policy() {
        let opts = QueueSettings::default().default_job_options();
        assert_eq!(opts.attempts, 5);
        assert_eq!(opts.backoff, Backoff::exponential(5000));
        assert!(opts.remove_on_complete);
        assert!(!opts.remove_on_fail);
    }

    #[tokio::test]
    async fn queues_share_the_service_prefix() {
        let service = QueueService::in_memory(QueueSettings {
            prefix: "tenant-a".into(),
            ..QueueSettings::default()
        });
        let queue = service.queue("reports").unwrap();
        assert_eq!(queue.prefix(), "tenant-a");
        assert_eq!(queue.key().key("wait"), "tenant-a:reports:wait");
    }

    #[tokio::test]
    async fn submissions_announce_on_existing_streams() {
        let service = QueueService::in_memory(QueueSettings::default());
        let events = service.get_queue_events("notifications").unwrap();
        let mut rx = events.subscribe();

        service
            .add_job("notifications", "send-email", json!({}), None)
            .await
            .unwrap();
        service
            .add_job(
                "notifications",
                "send-email",
                json!({}),
                Some(JobOptionsOverride::default().delay_ms(1000)),
            )
            .await
            .unwrap();

        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Waiting { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            JobEvent::Delayed { delay_ms: 1000, .. }
        ));
    }

    #[tokio::test]
    async fn closed_service_refuses_new_work() {
        let service = QueueService::in_memory(QueueSettings::default());
        service.shutdown().await.unwrap();
        assert!(service.is_closed());

        assert!(matches!(
            service.queue("late"),
            Err(QueueError::QueueClosed(name)) if name == "late"
        ));
        assert!(service.get_queue_events("late").is_err());
        assert!(matches!(
            service.add_job("late", "x", json!({}), None).await,
            Err(QueueError::QueueClosed(_))
        ));
        assert!(matches!(
            service.add_bulk("late", vec![BulkJob::new("x", json!({}))]).await,
            Err(QueueError::QueueClosed(_))
        ));
        let worker = service
            .create_worker("late", crate::processor::NoOpProcessor, None)
            .await;
        assert!(matches!(worker, Err(QueueError::QueueClosed(_))));
        assert!(service.shutdown().await.unwrap().is_empty());
    }

    #[test]
    fn closed_resources_display() {
        assert_eq!(ClosedResource::Queue("reports".into()).to_string(), "queue(reports)");
        assert_eq!(ClosedResource::Connection.to_string(), "connection");
    }
}
