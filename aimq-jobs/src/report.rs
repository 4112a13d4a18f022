//! Campaign report job implementation.

use aimq_queue::{Job, JobProcessor, QueueError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::JobError;

/// One day of campaign delivery metrics.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DailyMetric {
    pub date: NaiveDate,
    #[serde(default)]
    pub impressions: u64,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub spend_cents: u64,
    #[serde(default)]
    pub conversions: u64,
}

/// Payload for the campaign-report job.
#[derive(Debug, Clone, Deserialize)]
pub struct CampaignReportPayload {
    pub campaign_id: String,
    #[serde(default)]
    pub metrics: Vec<DailyMetric>,
}

/// Aggregated campaign performance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignReport {
    pub campaign_id: String,
    pub days: usize,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub impressions: u64,
    pub clicks: u64,
    pub spend_cents: u64,
    pub conversions: u64,
    /// Clicks per impression.
    pub ctr: f64,
    /// Spend per click, absent without clicks.
    pub cpc_cents: Option<f64>,
    /// Conversions per click.
    pub conversion_rate: f64,
    pub generated_at: DateTime<Utc>,
}

fn ratio(num: u64, den: u64) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

/// Sum the daily metrics and derive the rate figures.
pub fn build_report(payload: CampaignReportPayload) -> Result<CampaignReport, JobError> {
    let campaign_id = payload.campaign_id.trim().to_string();
    if campaign_id.is_empty() {
        return Err(JobError::InvalidPayload("campaign_id is empty".into()));
    }
    if let Some(bad) = payload.metrics.iter().find(|m| m.clicks > m.impressions) {
        return Err(JobError::ReportFailed(format!(
            "{}: clicks ({}) exceed impressions ({})",
            bad.date, bad.clicks, bad.impressions
        )));
    }

    let (mut impressions, mut clicks, mut spend_cents, mut conversions) = (0u64, 0u64, 0u64, 0u64);
    for m in &payload.metrics {
        impressions = impressions.saturating_add(m.impressions);
        clicks = clicks.saturating_add(m.clicks);
        spend_cents = spend_cents.saturating_add(m.spend_cents);
        conversions = conversions.saturating_add(m.conversions);
    }

    Ok(CampaignReport {
        campaign_id,
        days: payload.metrics.len(),
        from: payload.metrics.iter().map(|m| m.date).min(),
        to: payload.metrics.iter().map(|m| m.date).max(),
        impressions,
        clicks,
        spend_cents,
        conversions,
        ctr: ratio(clicks, impressions).unwrap_or(0.0),
        cpc_cents: ratio(spend_cents, clicks),
        conversion_rate: ratio(conversions, clicks).unwrap_or(0.0),
        generated_at: Utc::now(),
    })
}

/// Processor for campaign-report jobs on the reports queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct CampaignReportProcessor;

impl CampaignReportProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobProcessor for CampaignReportProcessor {
    async fn process(&self, job: &Job) -> Result<Value, QueueError> {
        let payload: CampaignReportPayload = serde_json::from_value(job.data.clone())
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
        let report = build_report(payload)?;

        info!(
            job_id = %job.id,
            campaign_id = %report.campaign_id,
            days = report.days,
            ctr = report.ctr,
            "campaign-report job completed"
        );
        Ok(serde_json::to_value(report)?)
    }
}
