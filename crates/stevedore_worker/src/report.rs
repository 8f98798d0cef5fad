//! Error-report artifact generation.
//!
//! Pages through a job's journal rows in ascending internal order and
//! writes them to storage, with job-internal identifiers stripped.

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::info;

use stevedore_db::{ErrorJournal, ImportErrorRow};
use stevedore_protocol::defaults::REPORT_PAGE_SIZE;
use stevedore_protocol::{error_report_key, ErrorCode, ExportFormat, TransferError, TransferResult};
use stevedore_storage::LocalStorage;

#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub location: String,
    pub format: ExportFormat,
    pub error_count: i64,
}

/// Report row shape: the journal row minus its internal ids.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportRow<'a> {
    record_index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    record_id: Option<&'a str>,
    error_code: i64,
    error_name: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
    occurred_at: String,
}

impl<'a> ReportRow<'a> {
    fn from_row(row: &'a ImportErrorRow) -> Self {
        Self {
            record_index: row.record_index,
            record_id: row.record_id.as_deref(),
            error_code: row.error_code,
            error_name: &row.error_name,
            message: &row.message,
            field: row.field.as_deref(),
            value: row.value.as_deref().and_then(|raw| serde_json::from_str(raw).ok()),
            details: row.details.as_deref().and_then(|raw| serde_json::from_str(raw).ok()),
            occurred_at: row.created_at.to_rfc3339(),
        }
    }
}

/// Write the full journal for a job to `import-errors/<job_id>.<ext>`.
pub async fn generate_error_report(
    journal: &ErrorJournal,
    storage: &LocalStorage,
    job_id: &str,
    format: ExportFormat,
) -> TransferResult<ReportOutcome> {
    let key = error_report_key(job_id, format);
    let mut sink = storage.create_write_stream(&key).await?;

    if format == ExportFormat::Json {
        sink.write_all(b"[").await?;
    }

    let mut after_id = 0i64;
    let mut written = 0i64;
    loop {
        let page = journal.fetch_page(job_id, after_id, REPORT_PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }
        for row in &page {
            let payload = serde_json::to_vec(&ReportRow::from_row(row))
                .map_err(|e| TransferError::new(ErrorCode::EncodingError, e.to_string()))?;
            match format {
                ExportFormat::Json => {
                    if written > 0 {
                        sink.write_all(b",").await?;
                    }
                    sink.write_all(&payload).await?;
                }
                ExportFormat::Ndjson => {
                    sink.write_all(&payload).await?;
                    sink.write_all(b"\n").await?;
                }
            }
            written += 1;
        }
        after_id = page.last().map(|row| row.id).unwrap_or(after_id);
    }

    if format == ExportFormat::Json {
        sink.write_all(b"]").await?;
    }
    sink.flush().await?;
    info!(job_id, errors = written, key, "wrote error report");

    Ok(ReportOutcome {
        location: key,
        format,
        error_count: written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stevedore_db::pool::{create_pool, DbConfig};
    use stevedore_db::schema::bootstrap;
    use stevedore_db::{JobStore, NewImportError, NewJob};
    use stevedore_protocol::{JobKind, ResourceKind};
    use tokio::io::AsyncReadExt;

    async fn seeded(errors: usize) -> (ErrorJournal, LocalStorage, tempfile::TempDir, String) {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        let jobs = JobStore::new(pool.clone());
        let job_id = jobs
            .create(NewJob {
                owner_id: "o1".into(),
                kind: Some(JobKind::Import),
                resource: Some(ResourceKind::Users),
                format: ExportFormat::Ndjson,
                ..NewJob::default()
            })
            .await
            .unwrap()
            .job
            .id;

        let journal = ErrorJournal::new(pool);
        let batch: Vec<NewImportError> = (0..errors)
            .map(|i| NewImportError {
                record_index: i as i64,
                record_id: Some(format!("r{i}")),
                error: TransferError::new(ErrorCode::InvalidFormat, "bad email")
                    .with_field("email")
                    .with_value(json!("nope")),
            })
            .collect();
        journal.insert_many(&job_id, &batch).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        (journal, storage, dir, job_id)
    }

    #[tokio::test]
    async fn ndjson_report_strips_internal_ids() {
        let (journal, storage, _dir, job_id) = seeded(3).await;
        let outcome =
            generate_error_report(&journal, &storage, &job_id, ExportFormat::Ndjson)
                .await
                .unwrap();
        assert_eq!(outcome.error_count, 3);
        assert_eq!(outcome.location, format!("import-errors/{job_id}.ndjson"));

        let mut body = String::new();
        storage
            .create_read_stream(&outcome.location)
            .await
            .unwrap()
            .read_to_string(&mut body)
            .await
            .unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["recordIndex"], 0);
        assert_eq!(first["errorName"], "INVALID_FORMAT");
        assert_eq!(first["errorCode"], 1003);
        assert!(first.get("id").is_none());
        assert!(first.get("jobId").is_none());
    }

    #[tokio::test]
    async fn json_report_is_one_array() {
        let (journal, storage, _dir, job_id) = seeded(2).await;
        let outcome = generate_error_report(&journal, &storage, &job_id, ExportFormat::Json)
            .await
            .unwrap();

        let mut body = String::new();
        storage
            .create_read_stream(&outcome.location)
            .await
            .unwrap()
            .read_to_string(&mut body)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_journal_yields_empty_report() {
        let (journal, storage, _dir, job_id) = seeded(0).await;
        let outcome = generate_error_report(&journal, &storage, &job_id, ExportFormat::Json)
            .await
            .unwrap();
        assert_eq!(outcome.error_count, 0);
    }
}
