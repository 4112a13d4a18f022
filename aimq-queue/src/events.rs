//! Per-queue job lifecycle notifications.
//!
//! Events travel through the queue backend, so a handle sees transitions
//! made by any service sharing the same store, including workers running in
//! other processes when the store is Redis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Buffered events per subscriber before lagging receivers start missing some.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A lifecycle notification for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum JobEvent {
    Waiting {
        job_id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },
    Delayed {
        job_id: String,
        name: String,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Active {
        job_id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },
    Completed {
        job_id: String,
        name: String,
        return_value: Value,
        timestamp: DateTime<Utc>,
    },
    Retrying {
        job_id: String,
        name: String,
        attempts_made: u32,
        delay_ms: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Failed {
        job_id: String,
        name: String,
        attempts_made: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Waiting { job_id, .. }
            | Self::Delayed { job_id, .. }
            | Self::Active { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. } => job_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Waiting { name, .. }
            | Self::Delayed { name, .. }
            | Self::Active { name, .. }
            | Self::Completed { name, .. }
            | Self::Retrying { name, .. }
            | Self::Failed { name, .. } => name,
        }
    }
}

/// Event-stream handle for a single queue.
///
/// Relays the backend's feed for the queue into a local channel so that
/// closing the handle ends its subscribers without touching other handles.
#[derive(Debug)]
pub struct QueueEvents {
    queue: String,
    sender: RwLock<Option<broadcast::Sender<JobEvent>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl QueueEvents {
    /// Start relaying `feed`. Must be called inside a tokio runtime.
    pub(crate) fn new(queue: impl Into<String>, feed: broadcast::Receiver<JobEvent>) -> Self {
        let queue = queue.into();
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(relay(queue.clone(), feed, sender.clone(), cancel.clone()));
        Self {
            queue,
            sender: RwLock::new(Some(sender)),
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Subscribe to future events. After close the receiver reports `Closed` straight away.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the stream. Returns `false` when it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }
}

async fn relay(
    queue: String,
    mut feed: broadcast::Receiver<JobEvent>,
    sender: broadcast::Sender<JobEvent>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            received = feed.recv() => received,
        };
        match received {
            Ok(event) => {
                // No subscribers is fine.
                let _ = sender.send(event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(queue = %queue, skipped, "queue events lagged behind the backend feed");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting(id: &str) -> JobEvent {
        JobEvent::Waiting {
            job_id: id.into(),
            name: "send-email".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_relayed_events() {
        let (feed, _) = broadcast::channel(8);
        let events = QueueEvents::new("notifications", feed.subscribe());
        let mut rx = events.subscribe();
        feed.send(waiting("1")).unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.job_id(), "1");
        assert_eq!(ev.name(), "send-email");
    }

    #[tokio::test]
    async fn handles_on_one_feed_are_independent() {
        let (feed, _) = broadcast::channel(8);
        let first = QueueEvents::new("reports", feed.subscribe());
        let second = QueueEvents::new("reports", feed.subscribe());
        let mut closed_rx = first.subscribe();
        let mut open_rx = second.subscribe();

        assert!(first.close());
        feed.send(waiting("2")).unwrap();
        assert_eq!(open_rx.recv().await.unwrap().job_id(), "2");
        assert!(matches!(closed_rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn close_ends_streams_once() {
        let (feed, _) = broadcast::channel(8);
        let events = QueueEvents::new("reports", feed.subscribe());
        let mut rx = events.subscribe();
        assert!(events.close());
        assert!(!events.close());
        assert!(events.is_closed());
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        let mut late = events.subscribe();
        assert!(matches!(late.recv().await, Err(RecvError::Closed)));
    }

    #[test]
    fn events_round_trip_as_tagged_json() {
        let value = serde_json::to_value(waiting("9")).unwrap();
        assert_eq!(value["event"], "waiting");
        assert_eq!(value["job_id"], "9");
        let back: JobEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.job_id(), "9");
    }
}
