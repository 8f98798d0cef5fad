//! Job rows and the single-writer claim.
//!
//! Jobs are created by the request path, mutated exclusively by the worker
//! holding the claim, and never deleted here. The claim is a conditional
//! UPDATE gated on `status = 'queued'`; `rows_affected` decides the winner.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use tracing::info;
use uuid::Uuid;

use crate::{fmt_ts, DbPool};
use stevedore_protocol::{
    ErrorCode, ErrorSummary, ExportFormat, JobKind, JobStatus, ResourceKind, SourceType,
    TransferError, TransferResult,
};

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub owner_id: String,
    pub kind: JobKind,
    pub resource: ResourceKind,
    pub format: ExportFormat,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_records: Option<i64>,
    pub processed_records: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub idempotency_key: Option<String>,
    pub request_hash: Option<String>,
    /// Canonical filters JSON, persisted as validated.
    pub filters: Option<String>,
    /// Canonical field-list JSON array.
    pub fields: Option<String>,
    pub output_location: Option<String>,
    pub download_url: Option<String>,
    pub file_size: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub source_type: Option<SourceType>,
    pub source_location: Option<String>,
    pub file_name: Option<String>,
    pub error_summary: Option<String>,
}

impl JobRow {
    /// Parsed error summary, if one was persisted.
    pub fn error_summary(&self) -> Option<ErrorSummary> {
        self.error_summary
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Fields supplied by the request path at creation time.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub owner_id: String,
    pub kind: Option<JobKind>,
    pub resource: Option<ResourceKind>,
    pub format: ExportFormat,
    pub idempotency_key: Option<String>,
    pub request_hash: Option<String>,
    pub filters: Option<String>,
    pub fields: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_location: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub job: JobRow,
    /// False when an idempotency hit returned an existing row.
    pub created: bool,
}

/// Result of a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This caller won the `queued -> running` transition.
    Claimed(JobRow),
    /// Another worker already drove the job past `queued` (or it was
    /// cancelled before starting); the observed row is returned untouched.
    NotClaimed(JobRow),
}

pub struct JobStore {
    pool: DbPool,
}

impl JobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Create a job row, honoring `(owner, idempotency_key, resource)`
    /// deduplication. A losing race on the unique index re-reads and
    /// returns the winner's row.
    pub async fn create(&self, new: NewJob) -> TransferResult<CreateOutcome> {
        let kind = new.kind.ok_or_else(|| {
            TransferError::new(ErrorCode::InternalError, "job kind missing at creation")
        })?;
        let resource = new.resource.ok_or_else(|| {
            TransferError::new(ErrorCode::InternalError, "job resource missing at creation")
        })?;

        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = self
                .find_by_idempotency(&new.owner_id, key, resource)
                .await?
            {
                return Ok(CreateOutcome {
                    job: existing,
                    created: false,
                });
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = fmt_ts(Utc::now());
        let inserted = sqlx::query(
            r#"
            INSERT INTO transfer_jobs (
                id, owner_id, kind, resource, format, status, created_at,
                idempotency_key, request_hash, filters, fields,
                source_type, source_location, file_name, file_size
            )
            VALUES (?, ?, ?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.owner_id)
        .bind(kind)
        .bind(resource)
        .bind(new.format)
        .bind(&now)
        .bind(&new.idempotency_key)
        .bind(&new.request_hash)
        .bind(&new.filters)
        .bind(&new.fields)
        .bind(new.source_type)
        .bind(&new.source_location)
        .bind(&new.file_name)
        .bind(new.file_size)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                let job = self.require(&id).await?;
                info!(job_id = %id, kind = %kind, resource = %resource, "created job");
                Ok(CreateOutcome { job, created: true })
            }
            Err(err) if is_unique_violation(&err) && new.idempotency_key.is_some() => {
                let key = new.idempotency_key.as_deref().unwrap_or_default();
                match self
                    .find_by_idempotency(&new.owner_id, key, resource)
                    .await?
                {
                    Some(existing) => Ok(CreateOutcome {
                        job: existing,
                        created: false,
                    }),
                    None => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find(&self, job_id: &str) -> TransferResult<Option<JobRow>> {
        let job = sqlx::query_as::<_, JobRow>("SELECT * FROM transfer_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn find_for_owner(
        &self,
        owner_id: &str,
        job_id: &str,
    ) -> TransferResult<Option<JobRow>> {
        let job = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM transfer_jobs WHERE id = ? AND owner_id = ?",
        )
        .bind(job_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Fetch a row that must exist.
    pub async fn require(&self, job_id: &str) -> TransferResult<JobRow> {
        self.find(job_id).await?.ok_or_else(|| {
            TransferError::new(ErrorCode::JobNotFound, format!("job {job_id} not found"))
        })
    }

    async fn find_by_idempotency(
        &self,
        owner_id: &str,
        key: &str,
        resource: ResourceKind,
    ) -> TransferResult<Option<JobRow>> {
        let job = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM transfer_jobs
            WHERE owner_id = ? AND idempotency_key = ? AND resource = ?
            "#,
        )
        .bind(owner_id)
        .bind(key)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Atomically transition `queued -> running`. Exactly one caller can
    /// win; everyone else gets the observed row back.
    pub async fn claim(&self, job_id: &str) -> TransferResult<ClaimOutcome> {
        let now = fmt_ts(Utc::now());
        let affected = sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = 'running', started_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let job = self.require(job_id).await?;
        if affected == 0 {
            Ok(ClaimOutcome::NotClaimed(job))
        } else {
            info!(job_id, "claimed job");
            Ok(ClaimOutcome::Claimed(job))
        }
    }

    /// Narrow status read used by the cancellation poll.
    pub async fn status_of(&self, job_id: &str) -> TransferResult<JobStatus> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            "SELECT status FROM transfer_jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            TransferError::new(ErrorCode::JobNotFound, format!("job {job_id} not found"))
        })?;
        Ok(status)
    }

    /// Request cancellation of a non-terminal job. Any actor may call this;
    /// the claim holder observes it at the next poll boundary.
    pub async fn request_cancel(&self, job_id: &str) -> TransferResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = 'cancelled'
            WHERE id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Terminal write for an import run.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_import(
        &self,
        job_id: &str,
        status: JobStatus,
        processed_records: i64,
        success_count: i64,
        error_count: i64,
        total_records: Option<i64>,
        error_summary: Option<&ErrorSummary>,
    ) -> TransferResult<()> {
        let summary_json = match error_summary {
            Some(summary) => Some(serde_json::to_string(summary).map_err(|e| {
                TransferError::new(ErrorCode::EncodingError, e.to_string())
            })?),
            None => None,
        };
        sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = ?, processed_records = ?, success_count = ?,
                error_count = ?, total_records = ?, error_summary = ?,
                finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(processed_records)
        .bind(success_count)
        .bind(error_count)
        .bind(total_records)
        .bind(summary_json)
        .bind(fmt_ts(Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal write for an async export run, including output metadata.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_export(
        &self,
        job_id: &str,
        status: JobStatus,
        processed_records: i64,
        total_records: Option<i64>,
        output_location: &str,
        file_size: i64,
        download_url: &str,
        retention_hours: i64,
    ) -> TransferResult<DateTime<Utc>> {
        let finished_at = Utc::now();
        let expires_at = finished_at + Duration::hours(retention_hours);
        sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = ?, processed_records = ?, total_records = ?,
                output_location = ?, file_size = ?, download_url = ?,
                finished_at = ?, expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(processed_records)
        .bind(total_records)
        .bind(output_location)
        .bind(file_size)
        .bind(download_url)
        .bind(fmt_ts(finished_at))
        .bind(fmt_ts(expires_at))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(expires_at)
    }

    /// Terminal write after an observed cancellation: keep the `cancelled`
    /// status, record the counters reached at the batch boundary.
    pub async fn finalize_cancelled(
        &self,
        job_id: &str,
        processed_records: i64,
        success_count: i64,
        error_count: i64,
    ) -> TransferResult<()> {
        sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET processed_records = ?, success_count = ?, error_count = ?,
                finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(processed_records)
        .bind(success_count)
        .bind(error_count)
        .bind(fmt_ts(Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Best-effort failure write, used when enqueue fails after creation
    /// and on fatal pipeline errors.
    pub async fn mark_failed(&self, job_id: &str) -> TransferResult<()> {
        sqlx::query(
            r#"
            UPDATE transfer_jobs
            SET status = 'failed', finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(fmt_ts(Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().map(|d| d.kind()),
        Some(sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};
    use crate::schema::bootstrap;

    async fn store() -> JobStore {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        JobStore::new(pool)
    }

    fn export_job(owner: &str, key: Option<&str>) -> NewJob {
        NewJob {
            owner_id: owner.to_string(),
            kind: Some(JobKind::Export),
            resource: Some(ResourceKind::Users),
            format: ExportFormat::Json,
            idempotency_key: key.map(str::to_string),
            ..NewJob::default()
        }
    }

    #[tokio::test]
    async fn create_then_idempotent_hit() {
        let store = store().await;
        let first = store.create(export_job("o1", Some("k1"))).await.unwrap();
        assert!(first.created);

        let second = store.create(export_job("o1", Some("k1"))).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.job.id, first.job.id);

        // Same key, different owner: independent job.
        let other = store.create(export_job("o2", Some("k1"))).await.unwrap();
        assert!(other.created);
        assert_ne!(other.job.id, first.job.id);
    }

    #[tokio::test]
    async fn claim_is_single_winner() {
        let store = store().await;
        let created = store.create(export_job("o1", None)).await.unwrap();
        let id = created.job.id;

        let first = store.claim(&id).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(_)));

        let second = store.claim(&id).await.unwrap();
        match second {
            ClaimOutcome::NotClaimed(job) => assert_eq!(job.status, JobStatus::Running),
            ClaimOutcome::Claimed(_) => panic!("second claim must lose"),
        }
    }

    #[tokio::test]
    async fn cancel_from_queued_and_running_only() {
        let store = store().await;
        let id = store.create(export_job("o1", None)).await.unwrap().job.id;

        assert!(store.request_cancel(&id).await.unwrap());
        assert_eq!(store.status_of(&id).await.unwrap(), JobStatus::Cancelled);

        // Terminal rows cannot be re-cancelled.
        assert!(!store.request_cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn finalize_import_writes_summary() {
        let store = store().await;
        let mut new = export_job("o1", None);
        new.kind = Some(JobKind::Import);
        let id = store.create(new).await.unwrap().job.id;
        store.claim(&id).await.unwrap();

        let summary = ErrorSummary {
            report_status: stevedore_protocol::ReportStatus::Complete,
            persisted_error_count: 2,
            persistence_failures: 0,
            report_location: Some("import-errors/x.ndjson".into()),
            report_format: ExportFormat::Ndjson,
            report_generation_failed: false,
        };
        store
            .finalize_import(&id, JobStatus::Partial, 5, 3, 2, Some(5), Some(&summary))
            .await
            .unwrap();

        let job = store.require(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(job.processed_records, 5);
        assert_eq!(job.error_summary().unwrap().persisted_error_count, 2);
        assert!(job.finished_at.is_some());
    }
}
