//! Claim, cancellation polling and terminal-status derivation.

use tracing::info;

use crate::events;
use stevedore_db::{ClaimOutcome, JobRow, JobStore};
use stevedore_protocol::defaults::{
    DEFAULT_BATCH_SIZE, DEFAULT_CANCEL_CHECK_INTERVAL, DEFAULT_FILE_RETENTION_HOURS,
    DEFAULT_MAX_RECORDS, DEFAULT_STREAM_MAX_LIMIT,
};
use stevedore_protocol::{JobStatus, TransferResult};

/// Per-process runtime knobs for job runs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub max_records: usize,
    pub stream_max_limit: usize,
    /// Records between cancellation polls; 0 disables polling.
    pub cancel_check_interval: usize,
    pub file_retention_hours: i64,
    /// Prefix for synthesized download URLs.
    pub download_base_url: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_records: DEFAULT_MAX_RECORDS,
            stream_max_limit: DEFAULT_STREAM_MAX_LIMIT,
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
            file_retention_hours: DEFAULT_FILE_RETENTION_HOURS,
            download_base_url: None,
        }
    }
}

impl WorkerSettings {
    pub fn download_url(&self, path: &str) -> String {
        match &self.download_base_url {
            Some(base) => format!("{}{}", base.trim_end_matches('/'), path),
            None => path.to_string(),
        }
    }
}

/// Outcome of the start sequence (claim plus pre-run cancellation check).
#[derive(Debug)]
pub enum StartOutcome {
    /// This worker holds the claim and must run the pipeline.
    Started(JobRow),
    /// Another worker holds it, or the job was cancelled before starting;
    /// the observed row is returned and no records were touched.
    Observed(JobRow),
}

/// Claim a job and handle pre-run cancellation.
///
/// A cancellation that landed between creation and the claim is finalized
/// here: terminal timestamps are written and the lifecycle event fires
/// without the pipeline ever running.
pub async fn start_job(jobs: &JobStore, job_id: &str) -> TransferResult<StartOutcome> {
    match jobs.claim(job_id).await? {
        ClaimOutcome::NotClaimed(row) => {
            info!(job_id, status = %row.status, "claim lost, returning observed state");
            Ok(StartOutcome::Observed(row))
        }
        ClaimOutcome::Claimed(_) => {
            // Re-read: a cancel may have raced the claim.
            let fresh = jobs.require(job_id).await?;
            if fresh.status == JobStatus::Cancelled {
                jobs.finalize_cancelled(job_id, 0, 0, 0).await?;
                let finalized = jobs.require(job_id).await?;
                events::job_completed(&finalized);
                return Ok(StartOutcome::Observed(finalized));
            }
            events::job_started(&fresh);
            Ok(StartOutcome::Started(fresh))
        }
    }
}

/// Poll-based cancellation watch.
///
/// `tick` is called once per record; every `interval` ticks it issues a
/// narrow status read. Once cancelled, stays cancelled.
pub struct CancelWatch<'a> {
    jobs: &'a JobStore,
    job_id: &'a str,
    interval: usize,
    since_check: usize,
    cancelled: bool,
}

impl<'a> CancelWatch<'a> {
    pub fn new(jobs: &'a JobStore, job_id: &'a str, interval: usize) -> Self {
        Self {
            jobs,
            job_id,
            interval,
            since_check: 0,
            cancelled: false,
        }
    }

    pub async fn tick(&mut self) -> TransferResult<bool> {
        if self.cancelled {
            return Ok(true);
        }
        if self.interval == 0 {
            return Ok(false);
        }
        self.since_check += 1;
        if self.since_check >= self.interval {
            self.since_check = 0;
            if self.jobs.status_of(self.job_id).await? == JobStatus::Cancelled {
                self.cancelled = true;
            }
        }
        Ok(self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Terminal status for an import run.
pub fn derive_import_status(success_count: i64, error_count: i64, fatal: bool) -> JobStatus {
    if fatal {
        return JobStatus::Failed;
    }
    match (success_count, error_count) {
        (_, 0) => JobStatus::Succeeded,
        (0, _) => JobStatus::Failed,
        _ => JobStatus::Partial,
    }
}
