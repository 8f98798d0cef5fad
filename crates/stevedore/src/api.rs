//! Service operations behind the HTTP surface.
//!
//! The transport (routing, auth, multipart parsing, response encoding) is
//! external; these functions own everything from validated inputs to job
//! rows, queue entries and artifact streams. Error-to-status mapping lives
//! in [`http_status_hint`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWrite;
use tracing::warn;

use crate::config::Config;
use crate::intake::{self, IntakeConfig, StoredSource};
use stevedore_db::{DbPool, ImportErrorRow, JobRow, NewJob};
use stevedore_protocol::defaults::QUEUE_TOPIC;
use stevedore_protocol::naming::{error_report_download_path, export_download_path};
use stevedore_protocol::{
    request_hash, ErrorCode, ErrorSummary, ExportFormat, JobKind, JobStatus, ResourceKind,
    SourceType, TransferError, TransferResult,
};
use stevedore_storage::LocalStorage;
use stevedore_validate::{parse_filters_json, validate_fields, validate_filters};
use stevedore_worker::{
    stream_export, AbortSignal, StreamExportParams, StreamSummary, WorkerContext,
};

/// Shared service state: the worker context plus intake limits.
pub struct ServiceContext {
    pub worker: WorkerContext,
    pub intake: IntakeConfig,
}

impl ServiceContext {
    pub fn new(pool: DbPool, config: &Config) -> Self {
        let storage = LocalStorage::new(config.storage_path.clone());
        Self {
            worker: WorkerContext::new(pool, storage, config.worker_settings()),
            intake: IntakeConfig {
                max_file_size: config.max_file_size,
                allowed_hosts: config.allowed_hosts.clone(),
            },
        }
    }
}

// ======================================================================
// Response shapes
// ======================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncationInfo {
    pub truncated: bool,
    pub reason: &'static str,
    pub record_limit: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPreviewRow {
    pub record_index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub error_code: i64,
    pub error_name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl From<&ImportErrorRow> for ErrorPreviewRow {
    fn from(row: &ImportErrorRow) -> Self {
        Self {
            record_index: row.record_index,
            record_id: row.record_id.clone(),
            error_code: row.error_code,
            error_name: row.error_name.clone(),
            message: row.message.clone(),
            field: row.field.clone(),
        }
    }
}

/// Public job representation. `error_summary` is sanitized: the internal
/// report location never leaves the service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: String,
    pub kind: JobKind,
    pub resource: ResourceKind,
    pub format: ExportFormat,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<i64>,
    pub processed_records: i64,
    pub success_count: i64,
    pub error_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_report_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_preview: Option<Vec<ErrorPreviewRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<TruncationInfo>,
}

impl JobResponse {
    fn from_row(ctx: &ServiceContext, row: &JobRow) -> Self {
        let summary = row.error_summary().map(|s| s.sanitized());
        let error_report_url = summary
            .as_ref()
            .filter(|s| s.persisted_error_count > 0)
            .map(|_| {
                ctx.worker
                    .settings
                    .download_url(&error_report_download_path(&row.id))
            });
        let truncation = match (row.kind, row.total_records) {
            (JobKind::Export, Some(total)) if total > row.processed_records => {
                Some(TruncationInfo {
                    truncated: true,
                    reason: "max_records_reached",
                    record_limit: ctx.worker.settings.max_records as i64,
                })
            }
            _ => None,
        };
        Self {
            id: row.id.clone(),
            kind: row.kind,
            resource: row.resource,
            format: row.format,
            status: row.status,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            total_records: row.total_records,
            processed_records: row.processed_records,
            success_count: row.success_count,
            error_count: row.error_count,
            file_name: row.file_name.clone(),
            file_size: row.file_size,
            download_url: row.download_url.clone(),
            expires_at: row.expires_at,
            error_summary: summary,
            error_report_url,
            error_preview: None,
            truncation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStatus {
    /// New job row; respond 202.
    Created,
    /// Idempotency hit; respond 200 with the existing job.
    Existing,
}

#[derive(Debug)]
pub struct CreateJobResult {
    pub job: JobResponse,
    pub status: CreateStatus,
}

// ======================================================================
// Export operations
// ======================================================================

#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub resource: Option<ResourceKind>,
    pub format: ExportFormat,
    pub filters: Option<Value>,
    pub fields: Option<Value>,
    pub idempotency_key: Option<String>,
}

/// Create an async export job: validate, persist, enqueue.
pub async fn create_export_job(
    ctx: &ServiceContext,
    owner_id: &str,
    request: ExportRequest,
) -> TransferResult<CreateJobResult> {
    let resource = request.resource.ok_or_else(|| {
        TransferError::new(ErrorCode::UnsupportedResource, "resource is required")
    })?;
    check_idempotency_key(request.idempotency_key.as_deref())?;

    let filters = match &request.filters {
        Some(raw) => validate_filters(resource, raw)?,
        None => None,
    };
    let fields = match &request.fields {
        Some(raw) => validate_fields(resource, raw)?,
        None => None,
    };
    let filters_json = encode_json(&filters)?;
    let fields_json = encode_json(&fields)?;

    let payload = format!(
        "{}|{}",
        filters_json.as_deref().unwrap_or("null"),
        fields_json.as_deref().unwrap_or("null")
    );
    let hash = request_hash(
        owner_id,
        JobKind::Export.as_str(),
        resource.as_str(),
        request.format.as_str(),
        &payload,
    );

    let outcome = ctx
        .worker
        .jobs
        .create(NewJob {
            owner_id: owner_id.to_string(),
            kind: Some(JobKind::Export),
            resource: Some(resource),
            format: request.format,
            idempotency_key: request.idempotency_key,
            request_hash: Some(hash),
            filters: filters_json,
            fields: fields_json,
            ..NewJob::default()
        })
        .await?;

    if outcome.created {
        enqueue_or_fail(ctx, JobKind::Export, &outcome.job.id).await?;
    }
    Ok(CreateJobResult {
        job: JobResponse::from_row(ctx, &outcome.job),
        status: if outcome.created {
            CreateStatus::Created
        } else {
            CreateStatus::Existing
        },
    })
}

pub async fn get_export_job(
    ctx: &ServiceContext,
    owner_id: &str,
    job_id: &str,
) -> TransferResult<JobResponse> {
    let row = find_owned(ctx, owner_id, job_id, JobKind::Export).await?;
    Ok(JobResponse::from_row(ctx, &row))
}

/// Stream a finished artifact. 404 unknown, 409 not ready, 410 expired.
pub async fn download_export(
    ctx: &ServiceContext,
    owner_id: &str,
    job_id: &str,
) -> TransferResult<(JobResponse, File)> {
    let row = find_owned(ctx, owner_id, job_id, JobKind::Export).await?;
    match row.status {
        JobStatus::Succeeded => {}
        JobStatus::Queued | JobStatus::Running => {
            return Err(TransferError::new(
                ErrorCode::ConcurrentLimit,
                "export artifact is not ready yet",
            ))
        }
        _ => {
            return Err(TransferError::new(
                ErrorCode::JobNotFound,
                "export produced no artifact",
            ))
        }
    }
    if let Some(expires_at) = row.expires_at {
        if expires_at < Utc::now() {
            return Err(TransferError::new(
                ErrorCode::DownloadExpired,
                "export artifact has expired",
            ));
        }
    }
    let location = row.output_location.clone().ok_or_else(|| {
        TransferError::new(ErrorCode::JobNotFound, "export produced no artifact")
    })?;
    let file = ctx.worker.storage.create_read_stream(&location).await?;
    Ok((JobResponse::from_row(ctx, &row), file))
}

/// Raw query-string inputs for the synchronous streaming export.
#[derive(Debug, Clone, Default)]
pub struct StreamQuery {
    pub resource: String,
    pub format: Option<String>,
    pub limit: Option<String>,
    pub cursor: Option<String>,
    /// Raw JSON filter text.
    pub filters: Option<String>,
    /// Comma-separated field list.
    pub fields: Option<String>,
}

/// Validate a streaming-export query and run it against the sink.
pub async fn stream_export_query<W: AsyncWrite + Unpin>(
    ctx: &ServiceContext,
    query: StreamQuery,
    sink: &mut W,
    abort: &AbortSignal,
) -> TransferResult<StreamSummary> {
    let resource: ResourceKind = query.resource.parse().map_err(|message: String| {
        TransferError::new(ErrorCode::UnsupportedResource, message)
    })?;
    let format: ExportFormat = match &query.format {
        Some(raw) => raw
            .parse()
            .map_err(|message: String| TransferError::new(ErrorCode::InvalidFormat, message))?,
        None => ExportFormat::default(),
    };

    let max_limit = ctx.worker.settings.stream_max_limit;
    let limit = match &query.limit {
        Some(raw) => raw.trim().parse::<usize>().ok().ok_or_else(|| {
            TransferError::new(ErrorCode::InvalidType, "limit must be a positive integer")
                .with_field("limit")
        })?,
        None => max_limit,
    };
    if limit == 0 || limit > max_limit {
        return Err(TransferError::new(
            ErrorCode::InvalidFormat,
            format!("limit must be between 1 and {max_limit}"),
        )
        .with_field("limit"));
    }

    let cursor = match &query.cursor {
        Some(raw) => {
            let value = raw.trim().parse::<i64>().ok().filter(|v| *v > 0).ok_or_else(|| {
                TransferError::new(ErrorCode::InvalidType, "cursor must be a positive integer")
                    .with_field("cursor")
            })?;
            Some(value)
        }
        None => None,
    };

    let filters = match &query.filters {
        Some(raw) => parse_filters_json(resource, raw)?,
        None => None,
    };
    let fields = match &query.fields {
        Some(raw) => validate_fields(resource, &Value::String(raw.clone()))?,
        None => None,
    };

    let params = StreamExportParams {
        resource,
        format,
        limit,
        cursor,
        filters,
        fields,
    };
    stream_export(
        &ctx.worker.reader,
        &params,
        ctx.worker.settings.batch_size,
        sink,
        abort,
    )
    .await
}

// ======================================================================
// Import operations
// ======================================================================

#[derive(Debug)]
pub enum ImportSource {
    Upload {
        file_name: String,
        content_type: String,
        bytes: Vec<u8>,
    },
    Url {
        url: String,
    },
}

#[derive(Debug)]
pub struct ImportRequest {
    pub resource: Option<ResourceKind>,
    pub source: Option<ImportSource>,
    /// Mandatory for imports.
    pub idempotency_key: Option<String>,
}

/// Create an import job: intake the source, persist, enqueue.
pub async fn create_import_job(
    ctx: &ServiceContext,
    owner_id: &str,
    request: ImportRequest,
) -> TransferResult<CreateJobResult> {
    let resource = request.resource.ok_or_else(|| {
        TransferError::new(ErrorCode::UnsupportedResource, "resource is required")
    })?;
    let key = request.idempotency_key.as_deref().ok_or_else(|| {
        TransferError::new(
            ErrorCode::MissingRequiredField,
            "Idempotency-Key is required for imports",
        )
        .with_field("idempotency_key")
    })?;
    check_idempotency_key(Some(key))?;

    let source = request.source.ok_or_else(|| {
        TransferError::new(ErrorCode::MissingRequiredField, "import source is missing")
            .with_field("source")
    })?;

    let (stored, source_type) = match &source {
        ImportSource::Upload {
            file_name,
            content_type,
            bytes,
        } => (
            intake::store_upload(&ctx.worker.storage, &ctx.intake, file_name, content_type, bytes)
                .await?,
            SourceType::Upload,
        ),
        ImportSource::Url { url } => {
            if url.trim().is_empty() {
                return Err(TransferError::new(
                    ErrorCode::MissingRequiredField,
                    "import source is missing",
                )
                .with_field("source"));
            }
            (
                intake::fetch_remote(&ctx.worker.storage, &ctx.intake, url).await?,
                SourceType::Url,
            )
        }
    };

    let hash = request_hash(
        owner_id,
        JobKind::Import.as_str(),
        resource.as_str(),
        stored.format.as_str(),
        &format!("{}|{}", stored.file_name.as_deref().unwrap_or(""), stored.size),
    );

    let outcome = ctx
        .worker
        .jobs
        .create(NewJob {
            owner_id: owner_id.to_string(),
            kind: Some(JobKind::Import),
            resource: Some(resource),
            format: stored.format,
            idempotency_key: Some(key.to_string()),
            request_hash: Some(hash),
            source_type: Some(source_type),
            source_location: Some(stored.key.clone()),
            file_name: stored.file_name.clone(),
            file_size: Some(stored.size),
            ..NewJob::default()
        })
        .await?;

    if outcome.created {
        enqueue_or_fail(ctx, JobKind::Import, &outcome.job.id).await?;
    } else {
        // Idempotency hit: the just-persisted source is orphaned.
        discard_source(ctx, &stored).await;
    }
    Ok(CreateJobResult {
        job: JobResponse::from_row(ctx, &outcome.job),
        status: if outcome.created {
            CreateStatus::Created
        } else {
            CreateStatus::Existing
        },
    })
}

/// Import status with an error preview of at most ten journal rows.
pub async fn get_import_job(
    ctx: &ServiceContext,
    owner_id: &str,
    job_id: &str,
) -> TransferResult<JobResponse> {
    let row = find_owned(ctx, owner_id, job_id, JobKind::Import).await?;
    let mut response = JobResponse::from_row(ctx, &row);
    if row.error_count > 0 {
        let preview = ctx.worker.journal.preview(&row.id, 10).await?;
        response.error_preview = Some(preview.iter().map(ErrorPreviewRow::from).collect());
    }
    Ok(response)
}

/// Stream the error-report artifact. 404 when absent, 409 while running.
pub async fn download_error_report(
    ctx: &ServiceContext,
    owner_id: &str,
    job_id: &str,
) -> TransferResult<(JobResponse, File)> {
    let row = find_owned(ctx, owner_id, job_id, JobKind::Import).await?;
    if matches!(row.status, JobStatus::Queued | JobStatus::Running) {
        return Err(TransferError::new(
            ErrorCode::ConcurrentLimit,
            "import is still running; no error report yet",
        ));
    }
    let location = row
        .error_summary()
        .and_then(|summary| summary.report_location)
        .ok_or_else(|| {
            TransferError::new(ErrorCode::JobNotFound, "no error report for this job")
        })?;
    let file = ctx.worker.storage.create_read_stream(&location).await?;
    Ok((JobResponse::from_row(ctx, &row), file))
}

/// Request cancellation of a non-terminal job owned by the caller.
pub async fn cancel_job(
    ctx: &ServiceContext,
    owner_id: &str,
    job_id: &str,
) -> TransferResult<bool> {
    let row = ctx
        .worker
        .jobs
        .find_for_owner(owner_id, job_id)
        .await?
        .ok_or_else(|| {
            TransferError::new(ErrorCode::JobNotFound, format!("job {job_id} not found"))
        })?;
    ctx.worker.jobs.request_cancel(&row.id).await
}

// ======================================================================
// Shared helpers
// ======================================================================

async fn find_owned(
    ctx: &ServiceContext,
    owner_id: &str,
    job_id: &str,
    kind: JobKind,
) -> TransferResult<JobRow> {
    let row = ctx
        .worker
        .jobs
        .find_for_owner(owner_id, job_id)
        .await?
        .filter(|row| row.kind == kind)
        .ok_or_else(|| {
            TransferError::new(ErrorCode::JobNotFound, format!("job {job_id} not found"))
        })?;
    Ok(row)
}

fn check_idempotency_key(key: Option<&str>) -> TransferResult<()> {
    if let Some(key) = key {
        if key.trim().is_empty() {
            return Err(TransferError::new(
                ErrorCode::InvalidFormat,
                "Idempotency-Key must be a non-empty string",
            )
            .with_field("idempotency_key"));
        }
    }
    Ok(())
}

fn encode_json<T: Serialize>(value: &Option<T>) -> TransferResult<Option<String>> {
    value
        .as_ref()
        .map(|v| {
            serde_json::to_string(v)
                .map_err(|e| TransferError::new(ErrorCode::EncodingError, e.to_string()))
        })
        .transpose()
}

/// Enqueue a created job; on failure mark it failed (best effort) and
/// surface a retriable error to the caller.
async fn enqueue_or_fail(ctx: &ServiceContext, kind: JobKind, job_id: &str) -> TransferResult<()> {
    if let Err(err) = ctx.worker.queue.enqueue(QUEUE_TOPIC, kind, job_id).await {
        warn!(job_id, %err, "enqueue failed after job creation");
        if let Err(mark_err) = ctx.worker.jobs.mark_failed(job_id).await {
            warn!(job_id, %mark_err, "failed to mark unenqueued job as failed");
        }
        return Err(TransferError::new(
            ErrorCode::QueueError,
            "job could not be queued; retry the request",
        ));
    }
    Ok(())
}

async fn discard_source(ctx: &ServiceContext, stored: &StoredSource) {
    if let Err(err) = ctx.worker.storage.delete(&stored.key).await {
        warn!(key = %stored.key, %err, "failed to discard orphaned import source");
    }
}

/// HTTP status the transport should use for a service error.
pub fn http_status_hint(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::JobNotFound | ErrorCode::UnsupportedResource => 404,
        ErrorCode::Unauthorized => 401,
        ErrorCode::Forbidden => 403,
        ErrorCode::RateLimited => 429,
        ErrorCode::ConcurrentLimit => 409,
        ErrorCode::DownloadExpired => 410,
        ErrorCode::FileTooLarge => 413,
        ErrorCode::QueueError => 503,
        ErrorCode::DatabaseError
        | ErrorCode::StorageError
        | ErrorCode::InternalError
        | ErrorCode::Timeout => 500,
        ErrorCode::UrlFetchFailed => 502,
        _ => 422,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stevedore_db::pool::{create_pool, DbConfig};
    use stevedore_db::schema::bootstrap;

    async fn service(dir: &tempfile::TempDir) -> ServiceContext {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        let config = Config {
            storage_path: dir.path().to_path_buf(),
            ..Config::default()
        };
        ServiceContext::new(pool, &config)
    }

    fn export_request(key: Option<&str>) -> ExportRequest {
        ExportRequest {
            resource: Some(ResourceKind::Users),
            format: ExportFormat::Json,
            filters: Some(json!({"role": "admin", "createdAt": {"gte": "2024-01-01T00:00:00Z"}})),
            fields: Some(json!("id,email,createdAt")),
            idempotency_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn idempotent_export_creation_enqueues_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = service(&dir).await;

        let first = create_export_job(&ctx, "o1", export_request(Some("k1"))).await.unwrap();
        assert_eq!(first.status, CreateStatus::Created);

        let second = create_export_job(&ctx, "o1", export_request(Some("k1"))).await.unwrap();
        assert_eq!(second.status, CreateStatus::Existing);
        assert_eq!(second.job.id, first.job.id);

        let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
            .fetch_one(ctx.worker.jobs.pool())
            .await
            .unwrap();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn invalid_filters_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = service(&dir).await;
        let mut request = export_request(None);
        request.filters = Some(json!({"favourite": "blue"}));
        let err = create_export_job(&ctx, "o1", request).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFormat);
        assert_eq!(http_status_hint(err.code), 422);
    }

    #[tokio::test]
    async fn import_requires_idempotency_key_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = service(&dir).await;

        let err = create_import_job(
            &ctx,
            "o1",
            ImportRequest {
                resource: Some(ResourceKind::Users),
                source: None,
                idempotency_key: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingRequiredField);

        let err = create_import_job(
            &ctx,
            "o1",
            ImportRequest {
                resource: Some(ResourceKind::Users),
                source: None,
                idempotency_key: Some("k".into()),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingRequiredField);
        assert_eq!(err.field.as_deref(), Some("source"));
    }

    #[tokio::test]
    async fn import_upload_creates_job_with_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = service(&dir).await;
        let result = create_import_job(
            &ctx,
            "o1",
            ImportRequest {
                resource: Some(ResourceKind::Users),
                source: Some(ImportSource::Upload {
                    file_name: "users.ndjson".into(),
                    content_type: "application/x-ndjson".into(),
                    bytes: b"{\"email\":\"a@example.com\"}\n".to_vec(),
                }),
                idempotency_key: Some("k1".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(result.status, CreateStatus::Created);
        assert_eq!(result.job.format, ExportFormat::Ndjson);
        assert_eq!(result.job.status, JobStatus::Queued);

        let row = ctx.worker.jobs.require(&result.job.id).await.unwrap();
        assert!(row.source_location.is_some());
        assert_eq!(row.source_type, Some(SourceType::Upload));
    }

    #[tokio::test]
    async fn downloads_enforce_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = service(&dir).await;
        let created = create_export_job(&ctx, "o1", export_request(None)).await.unwrap();

        // Still queued: not ready.
        let err = download_export(&ctx, "o1", &created.job.id).await.unwrap_err();
        assert_eq!(http_status_hint(err.code), 409);

        // Unknown job / wrong owner: 404.
        let err = download_export(&ctx, "o2", &created.job.id).await.unwrap_err();
        assert_eq!(http_status_hint(err.code), 404);
    }

    #[tokio::test]
    async fn stream_query_validates_limit_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = service(&dir).await;
        let abort = AbortSignal::new();

        let mut sink = Vec::new();
        let err = stream_export_query(
            &ctx,
            StreamQuery {
                resource: "users".into(),
                limit: Some("0".into()),
                ..StreamQuery::default()
            },
            &mut sink,
            &abort,
        )
        .await
        .unwrap_err();
        assert_eq!(http_status_hint(err.code), 422);

        let mut sink = Vec::new();
        let err = stream_export_query(
            &ctx,
            StreamQuery {
                resource: "gadgets".into(),
                ..StreamQuery::default()
            },
            &mut sink,
            &abort,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedResource);

        // A valid empty-store query still frames correctly.
        let mut sink = Vec::new();
        let summary = stream_export_query(
            &ctx,
            StreamQuery {
                resource: "users".into(),
                format: Some("json".into()),
                ..StreamQuery::default()
            },
            &mut sink,
            &abort,
        )
        .await
        .unwrap();
        assert_eq!(summary.count, 0);
        let body: Value = serde_json::from_slice(&sink).unwrap();
        assert_eq!(body["data"], json!([]));
        assert_eq!(body["nextCursor"], Value::Null);
    }

    #[tokio::test]
    async fn cancel_only_touches_owned_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = service(&dir).await;
        let created = create_export_job(&ctx, "o1", export_request(None)).await.unwrap();

        let err = cancel_job(&ctx, "o2", &created.job.id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::JobNotFound);

        assert!(cancel_job(&ctx, "o1", &created.job.id).await.unwrap());
        let row = ctx.worker.jobs.require(&created.job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Cancelled);
    }
}
