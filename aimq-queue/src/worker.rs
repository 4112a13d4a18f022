//! Queue consumers.
//!
//! A [`Worker`] polls its queue, runs up to `concurrency` jobs at a time
//! through a [`JobProcessor`] and reports the outcome back to the backend.
//! Retry scheduling is the backend's call, based on the job's attempts and
//! backoff options.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{QueueBackend, QueueKey};
use crate::error::QueueError;
use crate::events::JobEvent;
use crate::processor::JobProcessor;
use crate::types::{FailureOutcome, Job};

/// How long a single fetch waits for a job before re-checking for cancellation.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause after a failed fetch, and between attempts to record a job outcome.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Attempts to record a job outcome before leaving the job to the store's claim expiry.
const RECORD_ATTEMPTS: u32 = 3;

/// Per-worker tuning. Unset concurrency falls back to the service default.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: Option<usize>,
    pub poll_timeout: Duration,
    pub error_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

impl WorkerOptions {
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Everything a running worker needs, shared with its job tasks.
struct WorkerContext {
    key: QueueKey,
    backend: Arc<dyn QueueBackend>,
    processor: Arc<dyn JobProcessor>,
    error_backoff: Duration,
}

impl WorkerContext {
    async fn emit(&self, event: JobEvent) {
        if let Err(err) = self.backend.publish(&self.key, event).await {
            warn!(queue = %self.key, error = %err, "failed to publish job event");
        }
    }

    /// Run a backend update, retrying transient failures a few times.
    async fn record<T, F, Fut>(&self, job: &Job, what: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        for attempt in 1..=RECORD_ATTEMPTS {
            match op().await {
                Ok(value) => return Some(value),
                Err(err) => {
                    error!(
                        job_name = %job.name,
                        job_id = %job.id,
                        attempt,
                        error = %err,
                        "failed to record job {what}"
                    );
                    if attempt < RECORD_ATTEMPTS {
                        tokio::time::sleep(self.error_backoff).await;
                    }
                }
            }
        }
        None
    }

    /// Run the processor, renewing the job's claim while it works. Panics become failures.
    async fn execute(&self, job: &Job) -> Result<Value, QueueError> {
        let processing = AssertUnwindSafe(self.processor.process(job)).catch_unwind();
        tokio::pin!(processing);

        let Some(every) = self.backend.lock_renewal() else {
            return flatten_panic(processing.await);
        };
        let mut renewal = tokio::time::interval(every);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renewal.tick().await;
        loop {
            tokio::select! {
                outcome = &mut processing => return flatten_panic(outcome),
                _ = renewal.tick() => {
                    if let Err(err) = self.backend.extend_lock(&self.key, job).await {
                        warn!(job_name = %job.name, job_id = %job.id, error = %err, "failed to renew job lock");
                    }
                }
            }
        }
    }
}

fn flatten_panic(
    outcome: Result<Result<Value, QueueError>, Box<dyn Any + Send>>,
) -> Result<Value, QueueError> {
    outcome.unwrap_or_else(|panic| Err(QueueError::execution(panic_message(panic.as_ref()))))
}

struct WorkerInner {
    id: String,
    queue: String,
    concurrency: usize,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Handle to a running consumer. Clones refer to the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("queue", &self.inner.queue)
            .field("concurrency", &self.inner.concurrency)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Worker {
    pub(crate) fn spawn(
        key: QueueKey,
        backend: Arc<dyn QueueBackend>,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
        options: WorkerOptions,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let id = Uuid::new_v4().to_string();
        let queue = key.name().to_string();
        let cancel = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            key,
            backend,
            processor,
            error_backoff: options.error_backoff,
        });

        info!(worker_id = %id, queue = %queue, concurrency, "worker started");
        let handle = tokio::spawn(run(ctx, concurrency, options, cancel.clone()));

        Self {
            inner: Arc::new(WorkerInner {
                id,
                queue,
                concurrency,
                cancel,
                handle: Mutex::new(Some(handle)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[inline]
    pub fn queue_name(&self) -> &str {
        &self.inner.queue
    }

    #[inline]
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop fetching new jobs and wait for in-flight ones to finish.
    ///
    /// Returns `Ok(false)` when the worker was already closed.
    pub async fn close(&self) -> Result<bool, QueueError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.cancel.cancel();
        let handle = self.inner.handle.lock().await.take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| QueueError::Backend(format!("worker task failed: {e}")))?;
        }
        info!(worker_id = %self.inner.id, queue = %self.inner.queue, "worker closed");
        Ok(true)
    }
}

async fn run(
    ctx: Arc<WorkerContext>,
    concurrency: usize,
    options: WorkerOptions,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut in_flight = JoinSet::new();

    loop {
        while let Some(done) = in_flight.try_join_next() {
            log_join_error(&ctx.key, done);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if cancel.is_cancelled() {
            break;
        }

        // A fetch is never abandoned halfway: the backend may already have claimed the job.
        match ctx.backend.fetch_next(&ctx.key, options.poll_timeout).await {
            Ok(Some(job)) => {
                in_flight.spawn(process_job(ctx.clone(), job, permit));
            }
            Ok(None) => {}
            Err(err) => {
                drop(permit);
                warn!(queue = %ctx.key, error = %err, "failed to fetch next job");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.error_backoff) => {}
                }
            }
        }
    }

    while let Some(done) = in_flight.join_next().await {
        log_join_error(&ctx.key, done);
    }
}

fn log_join_error(queue: &QueueKey, done: Result<(), tokio::task::JoinError>) {
    if let Err(err) = done {
        error!(queue = %queue, error = %err, "job task aborted");
    }
}

async fn process_job(ctx: Arc<WorkerContext>, job: Job, _permit: OwnedSemaphorePermit) {
    ctx.emit(JobEvent::Active {
        job_id: job.id.clone(),
        name: job.name.clone(),
        timestamp: Utc::now(),
    })
    .await;

    match ctx.execute(&job).await {
        Ok(value) => {
            let recorded = ctx
                .record(&job, "completion", || {
                    ctx.backend.complete(&ctx.key, &job, value.clone())
                })
                .await;
            if recorded.is_some() {
                debug!(job_name = %job.name, job_id = %job.id, "job completed");
                ctx.emit(JobEvent::Completed {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                    return_value: value,
                    timestamp: Utc::now(),
                })
                .await;
            }
        }
        Err(err) => {
            let reason = err.to_string();
            error!(
                job_name = %job.name,
                job_id = %job.id,
                error = %reason,
                details = ?err,
                "job failed"
            );
            let outcome = ctx
                .record(&job, "failure", || ctx.backend.fail(&ctx.key, &job, &reason))
                .await;
            let event = match outcome {
                Some(FailureOutcome::Retrying {
                    delay,
                    attempts_made,
                }) => JobEvent::Retrying {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                    attempts_made,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason,
                    timestamp: Utc::now(),
                },
                Some(FailureOutcome::Failed { attempts_made }) => JobEvent::Failed {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                    attempts_made,
                    reason,
                    timestamp: Utc::now(),
                },
                None => return,
            };
            ctx.emit(event).await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("processor panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("processor panicked: {msg}")
    } else {
        "processor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::connection::ConnectionState;
    use crate::processor::processor_fn;
    use crate::types::{JobCounts, JobOptions, JobState, NewJob};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::{broadcast, watch};

    fn key() -> QueueKey {
        QueueKey::new("test", "jobs")
    }

    fn fast() -> WorkerOptions {
        WorkerOptions::default()
            .poll_timeout(Duration::from_millis(20))
            .error_backoff(Duration::from_millis(5))
    }

    fn kept_job(name: &str) -> NewJob {
        let mut opts = JobOptions::with_defaults(1, 10);
        opts.remove_on_complete = false;
        NewJob {
            name: name.into(),
            data: Value::Null,
            opts,
        }
    }

    /// Memory store whose first `complete` calls fail.
    #[derive(Debug)]
    struct FlakyComplete {
        inner: MemoryBackend,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl QueueBackend for FlakyComplete {
        fn state(&self) -> ConnectionState {
            self.inner.state()
        }
        fn state_changes(&self) -> watch::Receiver<ConnectionState> {
            self.inner.state_changes()
        }
        async fn add(&self, queue: &QueueKey, job: NewJob) -> Result<Job, QueueError> {
            self.inner.add(queue, job).await
        }
        async fn fetch_next(
            &self,
            queue: &QueueKey,
            timeout: Duration,
        ) -> Result<Option<Job>, QueueError> {
            self.inner.fetch_next(queue, timeout).await
        }
        async fn complete(&self, queue: &QueueKey, job: &Job, result: Value) -> Result<(), QueueError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(QueueError::Unavailable);
            }
            self.inner.complete(queue, job, result).await
        }
        async fn fail(
            &self,
            queue: &QueueKey,
            job: &Job,
            reason: &str,
        ) -> Result<FailureOutcome, QueueError> {
            self.inner.fail(queue, job, reason).await
        }
        async fn job_counts(&self, queue: &QueueKey) -> Result<JobCounts, QueueError> {
            self.inner.job_counts(queue).await
        }
        async fn get_job(&self, queue: &QueueKey, id: &str) -> Result<Option<Job>, QueueError> {
            self.inner.get_job(queue, id).await
        }
        async fn close(&self) -> Result<bool, QueueError> {
            self.inner.close().await
        }
        fn event_feed(&self, queue: &QueueKey) -> broadcast::Receiver<JobEvent> {
            self.inner.event_feed(queue)
        }
        async fn publish(&self, queue: &QueueKey, event: JobEvent) -> Result<(), QueueError> {
            self.inner.publish(queue, event).await
        }
    }

    #[test]
    fn panic_messages_are_readable() {
        assert_eq!(panic_message(&"boom"), "processor panicked: boom");
        assert_eq!(
            panic_message(&String::from("bad")),
            "processor panicked: bad"
        );
        assert_eq!(panic_message(&42u8), "processor panicked");
    }

    #[tokio::test]
    async fn panicking_processor_fails_the_job() {
        let backend = Arc::new(MemoryBackend::new());
        let mut rx = backend.event_feed(&key());
        let job = backend.add(&key(), kept_job("explode")).await.unwrap();

        let processor = processor_fn(|_job: Job| async move {
            if true {
                panic!("boom");
            }
            Ok(json!(null))
        });
        let worker = Worker::spawn(key(), backend.clone(), Arc::new(processor), 1, fast());

        loop {
            if let JobEvent::Failed { reason, .. } = rx.recv().await.unwrap() {
                assert!(reason.contains("boom"));
                break;
            }
        }
        assert!(worker.close().await.unwrap());
        assert!(!worker.close().await.unwrap());

        let stored = backend.get_job(&key(), &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts_made, 1);
    }

    #[tokio::test]
    async fn transient_store_errors_do_not_strand_active_jobs() {
        let backend = Arc::new(FlakyComplete {
            inner: MemoryBackend::new(),
            failures_left: AtomicU32::new(1),
        });
        let mut rx = backend.event_feed(&key());
        let job = backend.add(&key(), kept_job("report")).await.unwrap();

        let worker = Worker::spawn(
            key(),
            backend.clone(),
            Arc::new(processor_fn(|_job: Job| async move { Ok(json!("ok")) })),
            1,
            fast(),
        );
        loop {
            if let JobEvent::Completed { job_id, .. } = rx.recv().await.unwrap() {
                assert_eq!(job_id, job.id);
                break;
            }
        }
        worker.close().await.unwrap();

        let counts = backend.job_counts(&key()).await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 1);
        let stored = backend.get_job(&key(), &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_jobs() {
        let backend = Arc::new(MemoryBackend::new());
        let job = backend.add(&key(), kept_job("slow")).await.unwrap();

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let started_tx = std::sync::Mutex::new(Some(started_tx));
        let processor = processor_fn(move |_job: Job| {
            if let Some(tx) = started_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("done"))
            }
        });
        let worker = Worker::spawn(key(), backend.clone(), Arc::new(processor), 2, fast());
        assert_eq!(worker.concurrency(), 2);

        started_rx.await.unwrap();
        worker.close().await.unwrap();

        let stored = backend.get_job(&key(), &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.return_value, Some(json!("done")));
    }
}
