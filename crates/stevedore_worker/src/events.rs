//! Structured lifecycle events.
//!
//! One JSON object per event. `job.completed` carries derived metrics when
//! the start timestamp is known. Terminal status escalates the channel:
//! `failed` logs at error, `partial` and `cancelled` at warn.

use serde::Serialize;
use tracing::{error, info, warn};

use stevedore_db::JobRow;
use stevedore_protocol::{metrics, JobKind, JobMetrics, JobStatus, ResourceKind};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub event: &'static str,
    pub job_id: String,
    pub kind: JobKind,
    pub resource: ResourceKind,
    pub status: JobStatus,
    pub processed_records: i64,
    pub success_count: i64,
    pub error_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(flatten)]
    pub metrics: Option<JobMetrics>,
}

fn event_for(job: &JobRow, name: &'static str, with_metrics: bool) -> JobEvent {
    let metrics = if with_metrics {
        match (job.started_at, job.finished_at) {
            (Some(started), Some(finished)) => Some(metrics::compute(
                started,
                finished,
                job.processed_records,
                job.error_count,
            )),
            _ => None,
        }
    } else {
        None
    };
    JobEvent {
        event: name,
        job_id: job.id.clone(),
        kind: job.kind,
        resource: job.resource,
        status: job.status,
        processed_records: job.processed_records,
        success_count: job.success_count,
        error_count: job.error_count,
        total_records: job.total_records,
        file_size: job.file_size,
        metrics,
    }
}

fn emit(event: &JobEvent) {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| event.event.to_string());
    match event.status {
        JobStatus::Failed => error!(target: "stevedore::events", %payload, "{}", event.event),
        JobStatus::Partial | JobStatus::Cancelled => {
            warn!(target: "stevedore::events", %payload, "{}", event.event)
        }
        _ => info!(target: "stevedore::events", %payload, "{}", event.event),
    }
}

/// Emit `job.started` with initial counters; returns the payload.
pub fn job_started(job: &JobRow) -> JobEvent {
    let event = event_for(job, "job.started", false);
    emit(&event);
    event
}

/// Emit `job.completed` with terminal counters and derived metrics;
/// returns the payload.
pub fn job_completed(job: &JobRow) -> JobEvent {
    let event = event_for(job, "job.completed", true);
    emit(&event);
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use stevedore_protocol::ExportFormat;

    fn job(status: JobStatus) -> JobRow {
        JobRow {
            id: "j1".into(),
            owner_id: "o1".into(),
            kind: JobKind::Import,
            resource: ResourceKind::Users,
            format: ExportFormat::Ndjson,
            status,
            created_at: Utc.timestamp_millis_opt(0).unwrap(),
            started_at: Some(Utc.timestamp_millis_opt(1_000).unwrap()),
            finished_at: Some(Utc.timestamp_millis_opt(3_000).unwrap()),
            total_records: Some(10),
            processed_records: 10,
            success_count: 8,
            error_count: 2,
            idempotency_key: None,
            request_hash: None,
            filters: None,
            fields: None,
            output_location: None,
            download_url: None,
            file_size: None,
            expires_at: None,
            source_type: None,
            source_location: None,
            file_name: None,
            error_summary: None,
        }
    }

    #[test]
    fn completed_event_computes_metrics() {
        let event = job_completed(&job(JobStatus::Partial));
        let metrics = event.metrics.unwrap();
        assert_eq!(metrics.duration_ms, 2000);
        assert_eq!(metrics.rows_per_second, 5.0);
        assert_eq!(metrics.error_rate, 0.2);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "job.completed");
        assert_eq!(json["durationMs"], 2000);
        assert_eq!(json["errorCount"], 2);
    }

    #[test]
    fn started_event_has_no_metrics() {
        let event = job_started(&job(JobStatus::Running));
        assert!(event.metrics.is_none());
    }

    #[test]
    fn completed_without_start_time_skips_metrics() {
        let mut row = job(JobStatus::Succeeded);
        row.started_at = None;
        let event = job_completed(&row);
        assert!(event.metrics.is_none());
    }
}
