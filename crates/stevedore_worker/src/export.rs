//! Export pipelines.
//!
//! Streaming export writes directly to a caller-supplied sink with cursor
//! framing; the async export pipeline writes the same record shape (minus
//! the cursor) to a storage key and finalizes the job row. Both iterate in
//! strict ascending id order, pulling pages of `min(batch_size, remaining)`.

use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::abort::AbortSignal;
use crate::engine::CancelWatch;
use crate::events;
use crate::WorkerContext;
use stevedore_db::{EntityReader, JobRow};
use stevedore_protocol::naming::export_download_path;
use stevedore_protocol::{
    artifact_key, ErrorCode, ExportFormat, Filters, JobStatus, ResourceKind, TransferError,
    TransferResult,
};

/// Validated inputs for a streaming export.
#[derive(Debug, Clone)]
pub struct StreamExportParams {
    pub resource: ResourceKind,
    pub format: ExportFormat,
    pub limit: usize,
    /// Exclusive lower bound on id.
    pub cursor: Option<i64>,
    pub filters: Option<Filters>,
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub count: i64,
    pub last_id: Option<i64>,
    pub next_cursor: Option<i64>,
}

/// Keep only the selected fields of a record.
fn project(value: &mut Value, fields: Option<&Vec<String>>) {
    if let (Some(fields), Some(map)) = (fields, value.as_object_mut()) {
        map.retain(|key, _| fields.iter().any(|f| f == key));
    }
}

/// Stream records to `sink` with cursor framing.
///
/// Backpressure is inherent: every `write_all` suspends until the sink has
/// drained; that is the only cooperative suspension point in the hot path
/// besides the page fetch. The abort signal is honored between records;
/// after a mid-stream failure with JSON framing open, a synthesized close
/// is emitted so the payload stays parseable.
pub async fn stream_export<W: AsyncWrite + Unpin>(
    reader: &EntityReader,
    params: &StreamExportParams,
    batch_size: usize,
    sink: &mut W,
    abort: &AbortSignal,
) -> TransferResult<StreamSummary> {
    let mut json_open = false;
    let result =
        stream_records(reader, params, batch_size, sink, abort, &mut json_open).await;
    match result {
        Ok(summary) => Ok(summary),
        Err(err) => {
            if json_open {
                // Close the envelope so what was sent remains parseable.
                let _ = sink.write_all(b"],\"nextCursor\":null}").await;
                let _ = sink.flush().await;
            }
            Err(err)
        }
    }
}

async fn stream_records<W: AsyncWrite + Unpin>(
    reader: &EntityReader,
    params: &StreamExportParams,
    batch_size: usize,
    sink: &mut W,
    abort: &AbortSignal,
    json_open: &mut bool,
) -> TransferResult<StreamSummary> {
    if params.format == ExportFormat::Json {
        sink.write_all(b"{\"data\":[").await?;
        *json_open = true;
    }

    let mut count: i64 = 0;
    let mut last_id: Option<i64> = None;
    let mut cursor = params.cursor;
    let limit = params.limit as i64;

    'pages: while count < limit {
        let want = batch_size.min((limit - count) as usize) as i64;
        let page = reader
            .fetch_page(params.resource, cursor, params.filters.as_ref(), want)
            .await?;
        let short = (page.len() as i64) < want;

        for row in page {
            if abort.is_aborted() {
                debug!("export stream aborted by client");
                break 'pages;
            }
            let mut value = row.value;
            project(&mut value, params.fields.as_ref());
            let payload = serde_json::to_vec(&value)
                .map_err(|e| TransferError::new(ErrorCode::EncodingError, e.to_string()))?;

            match params.format {
                ExportFormat::Json => {
                    if count > 0 {
                        sink.write_all(b",").await?;
                    }
                    sink.write_all(&payload).await?;
                }
                ExportFormat::Ndjson => {
                    sink.write_all(&payload).await?;
                    sink.write_all(b"\n").await?;
                }
            }
            count += 1;
            last_id = Some(row.id);
            cursor = Some(row.id);
        }
        if short {
            break;
        }
    }

    let next_cursor = if count == limit { last_id } else { None };
    match params.format {
        ExportFormat::Json => {
            let closing = format!(
                "],\"nextCursor\":{}}}",
                next_cursor.map_or("null".to_string(), |id| id.to_string())
            );
            sink.write_all(closing.as_bytes()).await?;
            *json_open = false;
        }
        ExportFormat::Ndjson => {
            let trailer = json!({ "_type": "cursor", "nextCursor": next_cursor });
            sink.write_all(trailer.to_string().as_bytes()).await?;
            sink.write_all(b"\n").await?;
        }
    }
    sink.flush().await?;

    Ok(StreamSummary {
        count,
        last_id,
        next_cursor,
    })
}

struct ArtifactRun {
    count: i64,
    truncated: bool,
    cancelled: bool,
}

/// Async export: §streaming generation into a storage artifact, then
/// terminal finalization with output metadata.
pub async fn run_export_job(ctx: &WorkerContext, job: &JobRow) -> TransferResult<JobRow> {
    let key = artifact_key(&job.id, job.format);

    match write_artifact(ctx, job, &key).await {
        Ok(run) if run.cancelled => {
            // Partial artifacts of cancelled jobs are not kept.
            if let Err(err) = ctx.storage.delete(&key).await {
                warn!(job_id = %job.id, %err, "failed to delete cancelled artifact");
            }
            ctx.jobs
                .finalize_cancelled(&job.id, run.count, 0, 0)
                .await?;
            let row = ctx.jobs.require(&job.id).await?;
            events::job_completed(&row);
            Ok(row)
        }
        Ok(run) => {
            let file_size = ctx.storage.size_of(&key).await? as i64;
            let download_url = ctx.settings.download_url(&export_download_path(&job.id));
            let total_records = if run.truncated {
                Some(run.count + 1)
            } else {
                Some(run.count)
            };
            ctx.jobs
                .finalize_export(
                    &job.id,
                    JobStatus::Succeeded,
                    run.count,
                    total_records,
                    &key,
                    file_size,
                    &download_url,
                    ctx.settings.file_retention_hours,
                )
                .await?;
            let row = ctx.jobs.require(&job.id).await?;
            events::job_completed(&row);
            Ok(row)
        }
        Err(err) => {
            if let Err(delete_err) = ctx.storage.delete(&key).await {
                warn!(job_id = %job.id, %delete_err, "failed to delete partial artifact");
            }
            if let Err(mark_err) = ctx.jobs.mark_failed(&job.id).await {
                warn!(job_id = %job.id, %mark_err, "failed to persist failed status");
            }
            if let Ok(row) = ctx.jobs.require(&job.id).await {
                events::job_completed(&row);
            }
            Err(err)
        }
    }
}

async fn write_artifact(
    ctx: &WorkerContext,
    job: &JobRow,
    key: &str,
) -> TransferResult<ArtifactRun> {
    let filters: Option<Filters> = match &job.filters {
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            TransferError::new(ErrorCode::InternalError, format!("persisted filters unreadable: {e}"))
        })?,
        None => None,
    };
    let fields: Option<Vec<String>> = match &job.fields {
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            TransferError::new(ErrorCode::InternalError, format!("persisted fields unreadable: {e}"))
        })?,
        None => None,
    };

    let mut sink = ctx.storage.create_write_stream(key).await?;
    let mut watch = CancelWatch::new(&ctx.jobs, &job.id, ctx.settings.cancel_check_interval);
    let max_records = ctx.settings.max_records as i64;

    if job.format == ExportFormat::Json {
        sink.write_all(b"{\"data\":[").await?;
    }

    let mut run = ArtifactRun {
        count: 0,
        truncated: false,
        cancelled: false,
    };
    let batch_size = ctx.settings.batch_size;
    let mut cursor: Option<i64> = None;

    // Ask for one record past the cap: producing it proves truncation.
    let probe = max_records + 1;
    'pages: while run.count < probe {
        let want = batch_size.min((probe - run.count) as usize) as i64;
        let page = ctx
            .reader
            .fetch_page(job.resource, cursor, filters.as_ref(), want)
            .await?;
        let short = (page.len() as i64) < want;

        for row in page {
            if watch.tick().await? {
                run.cancelled = true;
                break 'pages;
            }
            if run.count == max_records {
                // The probe record exists; discard it and stop.
                run.truncated = true;
                break 'pages;
            }
            let mut value = row.value;
            project(&mut value, fields.as_ref());
            let payload = serde_json::to_vec(&value)
                .map_err(|e| TransferError::new(ErrorCode::EncodingError, e.to_string()))?;
            match job.format {
                ExportFormat::Json => {
                    if run.count > 0 {
                        sink.write_all(b",").await?;
                    }
                    sink.write_all(&payload).await?;
                }
                ExportFormat::Ndjson => {
                    sink.write_all(&payload).await?;
                    sink.write_all(b"\n").await?;
                }
            }
            run.count += 1;
            cursor = Some(row.id);
        }
        if short {
            break;
        }
    }

    if !run.cancelled {
        if job.format == ExportFormat::Json {
            sink.write_all(b"]}").await?;
        }
        sink.flush().await?;
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_db::pool::{create_pool, DbConfig};
    use stevedore_db::schema::bootstrap;
    use stevedore_db::DbPool;

    async fn seeded_pool(users: i64) -> DbPool {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        for i in 1..=users {
            sqlx::query(
                r#"
                INSERT INTO users (id, email, name, username, password_hash, role, active, created_at, updated_at)
                VALUES (?, ?, 'U', ?, 'x', 'user', 1, '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')
                "#,
            )
            .bind(i)
            .bind(format!("u{i}@example.com"))
            .bind(format!("u{i}"))
            .execute(&pool)
            .await
            .unwrap();
        }
        pool
    }

    fn params(format: ExportFormat, limit: usize) -> StreamExportParams {
        StreamExportParams {
            resource: ResourceKind::Users,
            format,
            limit,
            cursor: None,
            filters: None,
            fields: None,
        }
    }

    #[tokio::test]
    async fn json_export_with_more_records_emits_cursor() {
        let reader = EntityReader::new(seeded_pool(3).await);
        let mut sink = Vec::new();
        let summary = stream_export(
            &reader,
            &params(ExportFormat::Json, 2),
            1000,
            &mut sink,
            &AbortSignal::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.count, 2);
        assert_eq!(summary.next_cursor, Some(2));

        let body: Value = serde_json::from_slice(&sink).unwrap();
        assert_eq!(body["nextCursor"], 2);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"][0]["id"], 1);
        assert_eq!(body["data"][1]["id"], 2);
    }

    #[tokio::test]
    async fn exhausted_ndjson_export_has_null_cursor() {
        let reader = EntityReader::new(seeded_pool(1).await);
        let mut sink = Vec::new();
        let summary = stream_export(
            &reader,
            &params(ExportFormat::Ndjson, 5),
            1000,
            &mut sink,
            &AbortSignal::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.count, 1);
        assert_eq!(summary.next_cursor, None);

        let text = String::from_utf8(sink).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let record: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["id"], 1);
        let trailer: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(trailer["_type"], "cursor");
        assert_eq!(trailer["nextCursor"], Value::Null);
    }

    #[tokio::test]
    async fn cursor_is_an_exclusive_lower_bound() {
        let reader = EntityReader::new(seeded_pool(5).await);
        let mut sink = Vec::new();
        let mut p = params(ExportFormat::Json, 10);
        p.cursor = Some(3);
        let summary = stream_export(&reader, &p, 2, &mut sink, &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(summary.count, 2);
        let body: Value = serde_json::from_slice(&sink).unwrap();
        assert_eq!(body["data"][0]["id"], 4);
    }

    #[tokio::test]
    async fn projection_limits_fields() {
        let reader = EntityReader::new(seeded_pool(1).await);
        let mut sink = Vec::new();
        let mut p = params(ExportFormat::Json, 10);
        p.fields = Some(vec!["id".to_string(), "email".to_string()]);
        stream_export(&reader, &p, 1000, &mut sink, &AbortSignal::new())
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&sink).unwrap();
        let record = body["data"][0].as_object().unwrap();
        assert_eq!(record.len(), 2);
        assert!(record.contains_key("id"));
        assert!(record.contains_key("email"));
    }

    #[tokio::test]
    async fn aborted_stream_stops_cleanly() {
        let reader = EntityReader::new(seeded_pool(5).await);
        let mut sink = Vec::new();
        let abort = AbortSignal::new();
        abort.trigger();
        let summary = stream_export(
            &reader,
            &params(ExportFormat::Json, 5),
            2,
            &mut sink,
            &abort,
        )
        .await
        .unwrap();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.next_cursor, None);
        // Envelope is still well-formed.
        let body: Value = serde_json::from_slice(&sink).unwrap();
        assert_eq!(body["nextCursor"], Value::Null);
    }
}
