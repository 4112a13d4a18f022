//! Core types for the queue service.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueueError;

/// Shape of the delay between retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry backoff policy. `delay` is in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay: u64,
}

impl Backoff {
    #[inline]
    pub const fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
        }
    }

    #[inline]
    pub const fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
        }
    }

    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exp = attempts_made.saturating_sub(1).min(63);
                self.delay.saturating_mul(1u64 << exp)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Effective options attached to every stored job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    /// Initial delay in milliseconds before the job becomes eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl JobOptions {
    /// Service-wide defaults: completed jobs are dropped, failed jobs kept for inspection.
    pub const fn with_defaults(attempts: u32, backoff_delay_ms: u64) -> Self {
        Self {
            attempts,
            backoff: Backoff::exponential(backoff_delay_ms),
            remove_on_complete: true,
            remove_on_fail: false,
            delay: None,
        }
    }

    /// Apply a per-call override. Each set field replaces the default as a whole.
    pub fn merged(&self, overrides: &JobOptionsOverride) -> Self {
        Self {
            attempts: overrides.attempts.unwrap_or(self.attempts),
            backoff: overrides.backoff.unwrap_or(self.backoff),
            remove_on_complete: overrides
                .remove_on_complete
                .unwrap_or(self.remove_on_complete),
            remove_on_fail: overrides.remove_on_fail.unwrap_or(self.remove_on_fail),
            delay: overrides.delay.or(self.delay),
        }
    }

    #[inline]
    pub fn initial_delay(&self) -> Option<Duration> {
        self.delay.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// Per-call option overrides. Unset fields fall back to the queue defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobOptionsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl JobOptionsOverride {
    #[inline]
    #[must_use]
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    #[inline]
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    #[inline]
    #[must_use]
    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    #[inline]
    #[must_use]
    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = Some(remove);
        self
    }

    #[inline]
    #[must_use]
    pub fn delay_ms(mut self, delay: u64) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Lifecycle state of a stored job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::Backend(format!("unknown job state `{other}`"))),
        }
    }
}

/// A job as handed to the backend for storage.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub data: Value,
    pub opts: JobOptions,
}

/// One entry of a bulk submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJob {
    pub name: String,
    pub data: Value,
    #[serde(default)]
    pub opts: Option<JobOptionsOverride>,
}

impl BulkJob {
    #[inline]
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            opts: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_options(mut self, opts: JobOptionsOverride) -> Self {
        self.opts = Some(opts);
        self
    }
}

/// A stored job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: Value,
    pub opts: JobOptions,
    pub attempts_made: u32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub return_value: Option<Value>,
}

impl Job {
    /// Build a freshly stored job. Delayed when the options carry an initial delay.
    pub fn stored(id: impl Into<String>, queue: impl Into<String>, new: NewJob) -> Self {
        let state = if new.opts.initial_delay().is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        Self {
            id: id.into(),
            queue: queue.into(),
            name: new.name,
            data: new.data,
            opts: new.opts,
            attempts_made: 0,
            state,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            return_value: None,
        }
    }

    /// Delay before the next attempt once `attempts_made` failures were recorded,
    /// or `None` when the attempt budget is spent.
    pub fn retry_delay(&self) -> Option<Duration> {
        if self.attempts_made < self.opts.attempts {
            Some(self.opts.backoff.delay_for(self.attempts_made))
        } else {
            None
        }
    }
}

/// What the backend did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { delay: Duration, attempts_made: u32 },
    Failed { attempts_made: u32 },
}

/// Per-state job counts of a queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    #[inline]
    pub const fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}
