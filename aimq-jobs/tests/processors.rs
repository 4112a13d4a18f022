use std::time::Duration;

use aimq_jobs::{job_names, queue_for_job, queues, registry_for_queue};
use aimq_queue::{
    JobEvent, JobOptionsOverride, QueueService, QueueSettings, WorkerOptions,
};
use serde_json::json;

#[tokio::test]
async fn built_in_jobs_run_on_their_queues() {
    let service = QueueService::in_memory(QueueSettings::default());
    let options = WorkerOptions::default().poll_timeout(Duration::from_millis(20));

    for queue in [queues::NOTIFICATIONS, queues::REPORTS] {
        service
            .create_worker(queue, registry_for_queue(queue), Some(options.clone()))
            .await
            .unwrap();
    }

    let reports = service.get_queue_events(queues::REPORTS).unwrap();
    let mut rx = reports.subscribe();

    let queue = queue_for_job(job_names::CAMPAIGN_REPORT).unwrap();
    let job = service
        .add_job(
            queue,
            job_names::CAMPAIGN_REPORT,
            json!({
                "campaign_id": "cmp_7",
                "metrics": [{ "date": "2024-06-01", "impressions": 200, "clicks": 20, "spend_cents": 400, "conversions": 2 }]
            }),
            None,
        )
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await.unwrap() {
                e @ JobEvent::Completed { .. } => return e,
                _ => continue,
            }
        }
    })
    .await
    .unwrap();

    match event {
        JobEvent::Completed {
            job_id,
            return_value,
            ..
        } => {
            assert_eq!(job_id, job.id);
            assert_eq!(return_value["campaignId"], "cmp_7");
            assert_eq!(return_value["ctr"], 0.1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_email_fails_after_its_attempts() {
    let service = QueueService::in_memory(QueueSettings::default());
    service
        .create_worker(
            queues::NOTIFICATIONS,
            registry_for_queue(queues::NOTIFICATIONS),
            Some(WorkerOptions::default().poll_timeout(Duration::from_millis(20))),
        )
        .await
        .unwrap();
    let events = service.get_queue_events(queues::NOTIFICATIONS).unwrap();
    let mut rx = events.subscribe();

    service
        .add_job(
            queues::NOTIFICATIONS,
            job_names::SEND_EMAIL,
            json!({ "to": "nobody" }),
            Some(JobOptionsOverride::default().attempts(1)),
        )
        .await
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let JobEvent::Failed { reason, .. } = rx.recv().await.unwrap() {
                return reason;
            }
        }
    })
    .await
    .unwrap();
    assert!(reason.contains("invalid payload"));

    let counts = service
        .get_job_counts(queues::NOTIFICATIONS)
        .await
        .unwrap();
    assert_eq!(counts.failed, 1);
    service.shutdown().await.unwrap();
}
