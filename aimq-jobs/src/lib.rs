//! Concrete job processors for the ai-marketing background queues.
//!
//! This crate provides implementations of the [`JobProcessor`](aimq_queue::JobProcessor)
//! trait for the jobs the backend offloads.
//!
//! # Jobs
//!
//! - `send-email` on `notifications` - Deliver a transactional email
//! - `campaign-report` on `reports` - Aggregate campaign metrics
//!
//! # Usage
//!
//! ```rust,no_run
//! use aimq_jobs::{queues, registry_for_queue};
//! use aimq_queue::{QueueService, QueueSettings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = QueueService::in_memory(QueueSettings::default());
//!     service
//!         .create_worker(queues::NOTIFICATIONS, registry_for_queue(queues::NOTIFICATIONS), None)
//!         .await
//!         .expect("service is open");
//! }
//! ```

mod email;
mod error;
mod report;

pub use email::{EmailMessage, LogMailer, Mailer, SendEmailPayload, SendEmailProcessor};
pub use error::JobError;
pub use report::{
    build_report, CampaignReport, CampaignReportPayload, CampaignReportProcessor, DailyMetric,
};

use aimq_queue::ProcessorRegistry;

/// Queue name constants.
pub mod queues {
    pub const NOTIFICATIONS: &str = "notifications";
    pub const REPORTS: &str = "reports";
}

/// Job name constants for type-safe job references.
pub mod job_names {
    pub const SEND_EMAIL: &str = "send-email";
    pub const CAMPAIGN_REPORT: &str = "campaign-report";
}

/// Queue each built-in job is submitted to.
pub const JOB_QUEUES: &[(&str, &str)] = &[
    (job_names::SEND_EMAIL, queues::NOTIFICATIONS),
    (job_names::CAMPAIGN_REPORT, queues::REPORTS),
];

/// Register all built-in processors.
pub fn register_all_processors(registry: &mut ProcessorRegistry) {
    registry.register(job_names::SEND_EMAIL, SendEmailProcessor::new());
    registry.register(job_names::CAMPAIGN_REPORT, CampaignReportProcessor::new());
}

/// Registry holding only the processors for jobs submitted to `queue`.
pub fn registry_for_queue(queue: &str) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    match queue {
        queues::NOTIFICATIONS => {
            registry.register(job_names::SEND_EMAIL, SendEmailProcessor::new())
        }
        queues::REPORTS => {
            registry.register(job_names::CAMPAIGN_REPORT, CampaignReportProcessor::new())
        }
        _ => {}
    }
    registry
}

/// Default queue for a built-in job name.
pub fn queue_for_job(job_name: &str) -> Option<&'static str> {
    JOB_QUEUES
        .iter()
        .find(|(job, _)| *job == job_name)
        .map(|(_, queue)| *queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_job() {
        let mut registry = ProcessorRegistry::new();
        register_all_processors(&mut registry);
        assert_eq!(registry.len(), JOB_QUEUES.len());
        for (job, _) in JOB_QUEUES {
            assert!(registry.contains(job));
        }
    }

    #[test]
    fn queue_registries_are_scoped() {
        let notifications = registry_for_queue(queues::NOTIFICATIONS);
        assert!(notifications.contains(job_names::SEND_EMAIL));
        assert!(!notifications.contains(job_names::CAMPAIGN_REPORT));
        assert!(registry_for_queue("unknown").is_empty());
    }

    #[test]
    fn jobs_map_to_their_queue() {
        assert_eq!(queue_for_job(job_names::CAMPAIGN_REPORT), Some(queues::REPORTS));
        assert_eq!(queue_for_job("nope"), None);
    }
}
