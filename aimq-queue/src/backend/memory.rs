//! In-process queue store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;

use super::{QueueBackend, QueueKey};
use crate::connection::ConnectionState;
use crate::error::QueueError;
use crate::events::{JobEvent, EVENT_CHANNEL_CAPACITY};
use crate::types::{FailureOutcome, Job, JobCounts, JobState, NewJob};

/// Maximum number of finished jobs kept per queue and terminal state.
const MAX_RETAINED_JOBS: usize = 1000;
/// Stand-in deadline for delays that overflow the monotonic clock.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or(now + FAR_FUTURE)
}

/// Per-queue storage, indexed both by order and by id.
#[derive(Debug, Default)]
struct MemoryQueueState {
    next_id: u64,
    jobs: HashMap<String, Job>,
    waiting: VecDeque<String>,
    delayed: Vec<(Instant, String)>,
    active: HashSet<String>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

impl MemoryQueueState {
    fn insert(&mut self, queue: &QueueKey, new: NewJob) -> Job {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let job = Job::stored(id.clone(), queue.name(), new);
        match job.opts.initial_delay() {
            Some(delay) => self.delayed.push((deadline_after(delay), id.clone())),
            None => self.waiting.push_back(id.clone()),
        }
        self.jobs.insert(id, job.clone());
        job
    }

    /// Move due delayed jobs to the back of the waiting list, earliest first.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(due, _)| *due);
        let due_count = self.delayed.iter().take_while(|(due, _)| *due <= now).count();
        for (_, id) in self.delayed.drain(..due_count) {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                self.waiting.push_back(id);
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }

    fn take_next(&mut self) -> Option<Job> {
        let id = self.waiting.pop_front()?;
        let job = self.jobs.get_mut(&id)?;
        job.state = JobState::Active;
        job.processed_at = Some(Utc::now());
        self.active.insert(id);
        Some(job.clone())
    }

    fn retain_finished(list: &mut VecDeque<String>, jobs: &mut HashMap<String, Job>, id: String) {
        list.push_back(id);
        while list.len() > MAX_RETAINED_JOBS {
            if let Some(old) = list.pop_front() {
                jobs.remove(&old);
            }
        }
    }

    fn counts(&self) -> JobCounts {
        JobCounts {
            waiting: self.waiting.len() as u64,
            delayed: self.delayed.len() as u64,
            active: self.active.len() as u64,
            completed: self.completed.len() as u64,
            failed: self.failed.len() as u64,
        }
    }
}

/// Queue store living in process memory. Semantics match [`RedisBackend`](super::RedisBackend).
#[derive(Debug)]
pub struct MemoryBackend {
    queues: Mutex<HashMap<QueueKey, MemoryQueueState>>,
    events: Mutex<HashMap<QueueKey, broadcast::Sender<JobEvent>>>,
    notify: Notify,
    state: watch::Sender<ConnectionState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self {
            queues: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            state,
        }
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if *self.state.borrow() == ConnectionState::Closed {
            Err(QueueError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn with_queue<T>(&self, queue: &QueueKey, f: impl FnOnce(&mut MemoryQueueState) -> T) -> T {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        f(queues.entry(queue.clone()).or_default())
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn add(&self, queue: &QueueKey, job: NewJob) -> Result<Job, QueueError> {
        self.ensure_open()?;
        let job = self.with_queue(queue, |q| q.insert(queue, job));
        self.notify.notify_waiters();
        Ok(job)
    }

    async fn add_bulk(&self, queue: &QueueKey, jobs: Vec<NewJob>) -> Result<Vec<Job>, QueueError> {
        self.ensure_open()?;
        let added: Vec<Job> = self.with_queue(queue, |q| {
            jobs.into_iter().map(|job| q.insert(queue, job)).collect()
        });
        self.notify.notify_waiters();
        Ok(added)
    }

    async fn fetch_next(
        &self,
        queue: &QueueKey,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let deadline = deadline_after(timeout);
        loop {
            self.ensure_open()?;

            // Register interest before inspecting state so an add in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (job, next_due) = self.with_queue(queue, |q| {
                q.promote_due(now);
                (q.take_next(), q.next_due())
            });
            if job.is_some() {
                return Ok(job);
            }
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, queue: &QueueKey, job: &Job, result: Value) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.with_queue(queue, |q| -> Result<(), QueueError> {
            q.active.remove(&job.id);
            if job.opts.remove_on_complete {
                q.jobs.remove(&job.id);
                return Ok(());
            }
            let stored = q
                .jobs
                .get_mut(&job.id)
                .ok_or_else(|| QueueError::NotFound(job.id.clone()))?;
            stored.state = JobState::Completed;
            stored.finished_at = Some(Utc::now());
            stored.return_value = Some(result);
            MemoryQueueState::retain_finished(&mut q.completed, &mut q.jobs, job.id.clone());
            Ok(())
        })
    }

    async fn fail(
        &self,
        queue: &QueueKey,
        job: &Job,
        reason: &str,
    ) -> Result<FailureOutcome, QueueError> {
        self.ensure_open()?;
        let outcome = self.with_queue(queue, |q| -> Result<FailureOutcome, QueueError> {
            q.active.remove(&job.id);
            let stored = q
                .jobs
                .get_mut(&job.id)
                .ok_or_else(|| QueueError::NotFound(job.id.clone()))?;
            stored.attempts_made += 1;
            stored.failed_reason = Some(reason.to_string());
            let attempts_made = stored.attempts_made;

            if let Some(delay) = stored.retry_delay() {
                stored.state = JobState::Delayed;
                q.delayed.push((deadline_after(delay), job.id.clone()));
                return Ok(FailureOutcome::Retrying {
                    delay,
                    attempts_made,
                });
            }

            if job.opts.remove_on_fail {
                q.jobs.remove(&job.id);
            } else {
                stored.state = JobState::Failed;
                stored.finished_at = Some(Utc::now());
                MemoryQueueState::retain_finished(&mut q.failed, &mut q.jobs, job.id.clone());
            }
            Ok(FailureOutcome::Failed { attempts_made })
        })?;
        if matches!(outcome, FailureOutcome::Retrying { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn job_counts(&self, queue: &QueueKey) -> Result<JobCounts, QueueError> {
        self.ensure_open()?;
        Ok(self.with_queue(queue, |q| q.counts()))
    }

    async fn get_job(&self, queue: &QueueKey, id: &str) -> Result<Option<Job>, QueueError> {
        self.ensure_open()?;
        Ok(self.with_queue(queue, |q| q.jobs.get(id).cloned()))
    }

    async fn close(&self) -> Result<bool, QueueError> {
        let prev = self.state.send_replace(ConnectionState::Closed);
        self.notify.notify_waiters();
        Ok(prev != ConnectionState::Closed)
    }

    fn event_feed(&self, queue: &QueueKey) -> broadcast::Receiver<JobEvent> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events
            .entry(queue.clone())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    async fn publish(&self, queue: &QueueKey, event: JobEvent) -> Result<(), QueueError> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = events.get(queue) {
            // No subscribers is fine.
            let _ = sender.send(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Backoff, JobOptions};
    use serde_json::json;

    fn new_job(name: &str, opts: JobOptions) -> NewJob {
        NewJob {
            name: name.into(),
            data: json!({ "n": name }),
            opts,
        }
    }

    fn key() -> QueueKey {
        QueueKey::new("test", "jobs")
    }

    #[tokio::test]
    async fn ids_are_sequential_and_fifo() {
        let backend = MemoryBackend::new();
        let opts = JobOptions::with_defaults(1, 10);
        let a = backend.add(&key(), new_job("a", opts.clone())).await.unwrap();
        let b = backend.add(&key(), new_job("b", opts)).await.unwrap();
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");

        let first = backend
            .fetch_next(&key(), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(first.state, JobState::Active);
        let counts = backend.job_counts(&key()).await.unwrap();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let backend = MemoryBackend::new();
        let opts = JobOptions::with_defaults(1, 10);
        backend
            .add(&QueueKey::new("a", "jobs"), new_job("x", opts))
            .await
            .unwrap();
        let other = backend
            .job_counts(&QueueKey::new("b", "jobs"))
            .await
            .unwrap();
        assert_eq!(other.total(), 0);
    }

    #[tokio::test]
    async fn completion_honours_remove_on_complete() {
        let backend = MemoryBackend::new();
        let mut keep = JobOptions::with_defaults(1, 10);
        keep.remove_on_complete = false;
        let kept = backend.add(&key(), new_job("keep", keep)).await.unwrap();
        let dropped = backend
            .add(&key(), new_job("drop", JobOptions::with_defaults(1, 10)))
            .await
            .unwrap();

        for _ in 0..2 {
            let job = backend
                .fetch_next(&key(), Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
            backend.complete(&key(), &job, json!("ok")).await.unwrap();
        }

        let stored = backend.get_job(&key(), &kept.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.return_value, Some(json!("ok")));
        assert!(backend.get_job(&key(), &dropped.id).await.unwrap().is_none());
        assert_eq!(backend.job_counts(&key()).await.unwrap().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_retries_with_backoff_then_fails() {
        let backend = MemoryBackend::new();
        let mut opts = JobOptions::with_defaults(2, 1000);
        opts.backoff = Backoff::fixed(1000);
        backend.add(&key(), new_job("flaky", opts)).await.unwrap();

        let job = backend
            .fetch_next(&key(), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let outcome = backend.fail(&key(), &job, "boom").await.unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                delay: Duration::from_millis(1000),
                attempts_made: 1
            }
        );
        assert_eq!(backend.job_counts(&key()).await.unwrap().delayed, 1);

        // Not due yet.
        assert!(backend
            .fetch_next(&key(), Duration::ZERO)
            .await
            .unwrap()
            .is_none());

        // Waiting past the backoff promotes the job.
        let retried = backend
            .fetch_next(&key(), Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.attempts_made, 1);

        let outcome = backend.fail(&key(), &retried, "boom again").await.unwrap();
        assert_eq!(outcome, FailureOutcome::Failed { attempts_made: 2 });
        let stored = backend.get_job(&key(), &retried.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.failed_reason.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn huge_delays_stay_delayed() {
        let backend = MemoryBackend::new();
        let mut opts = JobOptions::with_defaults(2, u64::MAX);
        opts.backoff = Backoff::fixed(u64::MAX);
        opts.delay = Some(u64::MAX);
        backend.add(&key(), new_job("later", opts.clone())).await.unwrap();
        assert_eq!(backend.job_counts(&key()).await.unwrap().delayed, 1);

        opts.delay = None;
        backend.add(&key(), new_job("now", opts)).await.unwrap();
        let job = backend
            .fetch_next(&key(), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.name, "now");
        let outcome = backend.fail(&key(), &job, "boom").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Retrying { .. }));
        assert_eq!(backend.job_counts(&key()).await.unwrap().delayed, 2);
    }

    #[tokio::test]
    async fn fetch_wakes_on_add() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.fetch_next(&key(), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend
            .add(&key(), new_job("late", JobOptions::with_defaults(1, 1)))
            .await
            .unwrap();
        let job = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(job.name, "late");
    }

    #[tokio::test]
    async fn feeds_are_shared_per_queue() {
        let backend = MemoryBackend::new();
        let mut first = backend.event_feed(&key());
        let mut second = backend.event_feed(&key());
        let mut other = backend.event_feed(&QueueKey::new("test", "other"));

        let event = JobEvent::Active {
            job_id: "1".into(),
            name: "n".into(),
            timestamp: Utc::now(),
        };
        backend.publish(&key(), event.clone()).await.unwrap();
        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_backend_rejects_work() {
        let backend = MemoryBackend::new();
        assert!(backend.close().await.unwrap());
        assert!(!backend.close().await.unwrap());
        let err = backend
            .add(&key(), new_job("x", JobOptions::with_defaults(1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable));
    }
}
