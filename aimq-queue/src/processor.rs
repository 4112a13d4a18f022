//! Job processor trait for implementing job handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::QueueError;
use crate::types::Job;

/// Trait for implementing job processors.
///
/// A worker hands every claimed job to its processor. The returned value is
/// stored as the job's result; an error counts as a failed attempt.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<Value, QueueError>;
}

#[async_trait]
impl<P: JobProcessor + ?Sized> JobProcessor for Arc<P> {
    async fn process(&self, job: &Job) -> Result<Value, QueueError> {
        (**self).process(job).await
    }
}

/// Processor backed by an async closure. See [`processor_fn`].
pub struct FnProcessor<F> {
    f: F,
}

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor").finish_non_exhaustive()
    }
}

/// Wrap an async closure taking an owned [`Job`] as a processor.
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, QueueError>> + Send + 'static,
{
    FnProcessor { f }
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, QueueError>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> Result<Value, QueueError> {
        (self.f)(job.clone()).await
    }
}

/// Dispatches jobs to processors by job name.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn JobProcessor>>,
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.processors.keys().collect();
        names.sort();
        f.debug_struct("ProcessorRegistry")
            .field("job_names", &names)
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for `job_name`, replacing any previous one.
    pub fn register<P>(&mut self, job_name: impl Into<String>, processor: P)
    where
        P: JobProcessor + 'static,
    {
        self.processors
            .insert(job_name.into(), Arc::new(processor));
    }

    #[must_use]
    pub fn with<P>(mut self, job_name: impl Into<String>, processor: P) -> Self
    where
        P: JobProcessor + 'static,
    {
        self.register(job_name, processor);
        self
    }

    pub fn contains(&self, job_name: &str) -> bool {
        self.processors.contains_key(job_name)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[async_trait]
impl JobProcessor for ProcessorRegistry {
    async fn process(&self, job: &Job) -> Result<Value, QueueError> {
        match self.processors.get(&job.name) {
            Some(processor) => processor.process(job).await,
            None => Err(QueueError::execution(format!(
                "no processor registered for job `{}`",
                job.name
            ))),
        }
    }
}

/// A no-op processor that immediately completes jobs with a null result.
///
/// Useful in tests or as a placeholder for job names without a real handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProcessor;

#[async_trait]
impl JobProcessor for NoOpProcessor {
    async fn process(&self, _job: &Job) -> Result<Value, QueueError> {
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobOptions, NewJob};
    use serde_json::json;

    fn job(name: &str) -> Job {
        Job::stored(
            "1",
            "reports",
            NewJob {
                name: name.into(),
                data: json!({ "n": 2 }),
                opts: JobOptions::with_defaults(1, 10),
            },
        )
    }

    #[tokio::test]
    async fn closures_receive_the_job() {
        let p = processor_fn(|job: Job| async move {
            let n = job.data["n"].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        });
        assert_eq!(p.process(&job("double")).await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let registry = ProcessorRegistry::new()
            .with("noop", NoOpProcessor)
            .with(
                "echo",
                processor_fn(|job: Job| async move { Ok(job.data) }),
            );
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("echo"));
        assert_eq!(registry.process(&job("noop")).await.unwrap(), Value::Null);
        assert_eq!(
            registry.process(&job("echo")).await.unwrap(),
            json!({ "n": 2 })
        );
        let err = registry.process(&job("unknown")).await.unwrap_err();
        assert!(matches!(err, QueueError::ExecutionFailed(msg) if msg.contains("unknown")));
    }
}
