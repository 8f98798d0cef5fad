//! Deterministic keys and paths derived from job identity.

use crate::types::{ExportFormat, JobKind};

/// Storage key for an async export artifact.
pub fn artifact_key(job_id: &str, format: ExportFormat) -> String {
    format!("{}.{}", job_id, format.extension())
}

/// Storage key for an import error report.
pub fn error_report_key(job_id: &str, format: ExportFormat) -> String {
    format!("import-errors/{}.{}", job_id, format.extension())
}

/// Broker-side queue entry id; deterministic so an enqueue retry cannot
/// duplicate a pending entry for the same job.
pub fn broker_key(kind: JobKind, job_id: &str) -> String {
    format!("{}-{}", kind.as_str(), job_id)
}

/// Public download path for a finished export artifact.
pub fn export_download_path(job_id: &str) -> String {
    format!("/api/v1/exports/{job_id}/download")
}

/// Public download path for an import error report.
pub fn error_report_download_path(job_id: &str) -> String {
    format!("/api/v1/imports/{job_id}/errors/download")
}
