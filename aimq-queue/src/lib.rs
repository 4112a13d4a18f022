//! Background job queues for the ai-marketing backend.
//!
//! A [`QueueService`] owns one shared backend connection and hands out
//! cached, name-keyed [`Queue`] and [`QueueEvents`] handles. Jobs carry the
//! service's default retry policy unless a call overrides it. Workers pull
//! jobs, run them through a [`JobProcessor`] and let the backend decide
//! between retrying and failing.
//!
//! # Architecture
//!
//! - [`QueueService`] - Entry point: job submission, workers, event streams, shutdown
//! - [`QueueBackend`] - Storage trait, implemented by [`RedisBackend`] and [`MemoryBackend`]
//! - [`RedisConnection`] - Resilient shared Redis connection with retry and state tracking
//! - [`Worker`] - Consumer bound to a queue with a concurrency ceiling
//! - [`JobProcessor`] - Trait for implementing job handlers
//!
//! # Example
//!
//! ```rust,no_run
//! use aimq_queue::{processor_fn, Job, QueueService, QueueSettings};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), aimq_queue::QueueError> {
//!     let service = QueueService::in_memory(QueueSettings::default());
//!
//!     service
//!         .create_worker(
//!             "notifications",
//!             processor_fn(|job: Job| async move { Ok(json!({ "sent": job.data["to"] })) }),
//!             None,
//!         )
//!         .await?;
//!
//!     let job = service
//!         .add_job("notifications", "send-email", json!({ "to": "a@example.com" }), None)
//!         .await?;
//!     println!("Enqueued job: {}", job.id);
//!
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod backend;
mod connection;
mod error;
mod events;
mod processor;
mod queue;
mod service;
mod types;
mod worker;

pub use backend::{MemoryBackend, QueueBackend, QueueKey, RedisBackend};
pub use connection::{
    redact_url, ConnectionSettings, ConnectionState, RedisConnection, RetryPolicy,
};
pub use error::QueueError;
pub use events::{JobEvent, QueueEvents};
pub use processor::{processor_fn, FnProcessor, JobProcessor, NoOpProcessor, ProcessorRegistry};
pub use queue::Queue;
pub use service::{
    ClosedResource, QueueService, QueueSettings, ShutdownReport, DEFAULT_ATTEMPTS,
    DEFAULT_BACKOFF_DELAY_MS, DEFAULT_CONCURRENCY, DEFAULT_PREFIX,
};
pub use types::{
    Backoff, BackoffKind, BulkJob, FailureOutcome, Job, JobCounts, JobOptions,
    JobOptionsOverride, JobState, NewJob,
};
pub use worker::{Worker, WorkerOptions, DEFAULT_ERROR_BACKOFF, DEFAULT_POLL_TIMEOUT};

// Re-export async_trait for convenience when implementing JobProcessor
pub use async_trait::async_trait;
