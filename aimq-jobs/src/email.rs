//! Email delivery job implementation.

use aimq_queue::{Job, JobProcessor, QueueError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::JobError;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

const DEFAULT_TEMPLATE: &str = "default";

/// Payload for the send-email job.
#[derive(Debug, Clone, Deserialize)]
pub struct SendEmailPayload {
    pub to: String,
    pub subject: Option<String>,
    pub template: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// A validated message ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: Option<String>,
    pub template: String,
    pub variables: Map<String, Value>,
}

impl TryFrom<SendEmailPayload> for EmailMessage {
    type Error = JobError;

    fn try_from(payload: SendEmailPayload) -> Result<Self, Self::Error> {
        let to = payload.to.trim();
        if !EMAIL_RE.is_match(to) {
            return Err(JobError::InvalidPayload(format!(
                "`to` is not a valid email address: {to:?}"
            )));
        }
        Ok(Self {
            to: to.to_string(),
            subject: payload.subject.filter(|s| !s.trim().is_empty()),
            template: payload
                .template
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
            variables: payload.variables,
        })
    }
}

/// Outbound email transport. Provider SDKs plug in here.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver the message and return the provider's message id.
    async fn send(&self, message: &EmailMessage) -> Result<String, JobError>;
}

/// Mailer that only logs deliveries. Used when no provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<String, JobError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        info!(
            message_id = %message_id,
            template = %message.template,
            subject = ?message.subject,
            variables = message.variables.len(),
            "email handed to log mailer"
        );
        Ok(message_id)
    }
}

/// Processor for send-email jobs on the notifications queue.
#[derive(Debug, Default)]
pub struct SendEmailProcessor<M = LogMailer> {
    mailer: M,
}

impl SendEmailProcessor<LogMailer> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: Mailer> SendEmailProcessor<M> {
    pub fn with_mailer(mailer: M) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl<M: Mailer> JobProcessor for SendEmailProcessor<M> {
    async fn process(&self, job: &Job) -> Result<Value, QueueError> {
        let payload: SendEmailPayload = serde_json::from_value(job.data.clone())
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
        let message = EmailMessage::try_from(payload)?;

        debug!(job_id = %job.id, template = %message.template, "sending email");
        let message_id = self.mailer.send(&message).await?;

        info!(job_id = %job.id, message_id = %message_id, "send-email job completed");
        Ok(json!({ "messageId": message_id, "to": message.to }))
    }
}
