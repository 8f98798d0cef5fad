//! Import pipeline.
//!
//! parse -> validate -> batch -> upsert -> journal errors -> finalize ->
//! error-report artifact. Per-record errors are journaled and never abort
//! the run; fatal errors finalize the job as failed with one reserved
//! `record_index = -1` journal row.

use serde_json::Value;
use tokio::io::BufReader;
use tracing::{debug, warn};

use crate::engine::{derive_import_status, CancelWatch};
use crate::events;
use crate::report;
use crate::WorkerContext;
use stevedore_db::{EntityReader, JobRow, NewImportError, RecordOp};
use stevedore_parsers::RecordStream;
use stevedore_protocol::defaults::{ERROR_FLUSH_THRESHOLD, FATAL_RECORD_INDEX};
use stevedore_protocol::{
    ErrorCode, ErrorSummary, JobStatus, NormalizedRecord, ReportStatus, ResourceKind,
    TransferError, TransferResult,
};
use stevedore_validate::{validate_record, ReferenceCache};

#[derive(Debug, Default)]
struct Totals {
    processed: i64,
    success: i64,
    errors: i64,
    persisted_errors: i64,
    persistence_failures: i64,
    cancelled: bool,
}

/// Drive a claimed import job to its terminal state.
pub async fn run_import_job(ctx: &WorkerContext, job: &JobRow) -> TransferResult<JobRow> {
    let mut run = ImportRun::new(ctx, job);
    let fatal = match run.execute().await {
        Ok(()) => None,
        Err(err) => Some(err),
    };
    run.finish(fatal).await
}

struct ImportRun<'a> {
    ctx: &'a WorkerContext,
    job: &'a JobRow,
    totals: Totals,
    pending_ops: Vec<RecordOp>,
    pending_errors: Vec<NewImportError>,
}

impl<'a> ImportRun<'a> {
    fn new(ctx: &'a WorkerContext, job: &'a JobRow) -> Self {
        Self {
            ctx,
            job,
            totals: Totals::default(),
            pending_ops: Vec::new(),
            pending_errors: Vec::new(),
        }
    }

    async fn execute(&mut self) -> TransferResult<()> {
        let source = self.open_source().await?;
        // The format was pinned at creation (explicit, or derived from the
        // file name by intake).
        let mut parser = RecordStream::new(
            self.job.format,
            BufReader::new(source),
            self.ctx.settings.max_records,
        );

        let mut cache = ReferenceCache::new(EntityReader::new(self.ctx.jobs.pool().clone()));
        let mut watch = CancelWatch::new(
            &self.ctx.jobs,
            &self.job.id,
            self.ctx.settings.cancel_check_interval,
        );

        loop {
            let record = match parser.next().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => return self.abort_with(err).await,
            };
            let cancelled = match watch.tick().await {
                Ok(flag) => flag,
                Err(err) => return self.abort_with(err).await,
            };
            if cancelled {
                self.totals.cancelled = true;
                break;
            }

            let outcome = match validate_record(
                self.job.resource,
                &record.value,
                record.index,
                &mut cache,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(err) => return self.abort_with(err).await,
            };
            if outcome.skip {
                continue;
            }
            self.totals.processed += 1;

            if outcome.errors.is_empty() {
                if let Some(normalized) = outcome.normalized {
                    self.pending_ops.push(to_op(record.index, normalized));
                }
            } else {
                let record_id = business_key(self.job.resource, &record.value);
                self.totals.errors += 1;
                for error in outcome.errors {
                    self.pending_errors.push(NewImportError {
                        record_index: record.index as i64,
                        record_id: record_id.clone(),
                        error,
                    });
                }
            }

            if self.pending_ops.len() >= self.ctx.settings.batch_size {
                self.flush_ops().await?;
            }
            if self.pending_errors.len() >= ERROR_FLUSH_THRESHOLD {
                self.flush_errors().await;
            }
        }

        // End of input or cancellation: remaining records, then errors.
        self.flush_ops().await?;
        self.flush_errors().await;

        if self.totals.processed == 0 && !self.totals.cancelled {
            return Err(TransferError::new(
                ErrorCode::EmptyFile,
                "source contained no records",
            ));
        }
        Ok(())
    }

    /// Fatal error mid-stream. Buffered records and errors are flushed
    /// first, mirroring the end-of-input path, so upserts and counts for
    /// records processed before the failure survive it.
    async fn abort_with(&mut self, fatal: TransferError) -> TransferResult<()> {
        if let Err(flush_err) = self.flush_ops().await {
            warn!(job_id = %self.job.id, %flush_err, "record flush failed during abort");
        }
        self.flush_errors().await;
        Err(fatal)
    }

    /// Flush the pending-records buffer through the upsert engine.
    async fn flush_ops(&mut self) -> TransferResult<()> {
        if self.pending_ops.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending_ops);
        let outcome = stevedore_db::apply_batch(self.ctx.jobs.pool(), &ops).await?;
        self.totals.success += outcome.succeeded as i64;
        self.totals.errors += outcome.failures.len() as i64;
        for failure in outcome.failures {
            self.pending_errors.push(NewImportError {
                record_index: failure.index as i64,
                record_id: failure.record_id,
                error: failure.error,
            });
        }
        debug!(
            job_id = %self.job.id,
            succeeded = outcome.succeeded,
            "flushed upsert batch"
        );
        Ok(())
    }

    /// Flush buffered errors into the journal; persistence failures are
    /// counted, never raised.
    async fn flush_errors(&mut self) {
        if self.pending_errors.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending_errors);
        match self.ctx.journal.insert_many(&self.job.id, &batch).await {
            Ok(written) => self.totals.persisted_errors += written as i64,
            Err(err) => {
                self.totals.persistence_failures += batch.len() as i64;
                warn!(job_id = %self.job.id, %err, "error journal flush failed");
            }
        }
    }

    /// Terminal handling for both the normal and the fatal path.
    async fn finish(mut self, fatal: Option<TransferError>) -> TransferResult<JobRow> {
        if let Some(fatal_error) = &fatal {
            warn!(job_id = %self.job.id, error = %fatal_error, "import failed");
            self.pending_errors.push(NewImportError {
                record_index: FATAL_RECORD_INDEX,
                record_id: None,
                error: fatal_error.clone(),
            });
            self.flush_errors().await;
        }

        let report = if self.totals.persisted_errors > 0 {
            Some(
                report::generate_error_report(
                    &self.ctx.journal,
                    &self.ctx.storage,
                    &self.job.id,
                    self.job.format,
                )
                .await,
            )
        } else {
            None
        };

        let summary = self.build_summary(report);
        let totals = &self.totals;

        if totals.cancelled {
            self.ctx
                .jobs
                .finalize_cancelled(&self.job.id, totals.processed, totals.success, totals.errors)
                .await?;
        } else {
            let status = derive_import_status(totals.success, totals.errors, fatal.is_some());
            self.ctx
                .jobs
                .finalize_import(
                    &self.job.id,
                    status,
                    totals.processed,
                    totals.success,
                    totals.errors,
                    Some(totals.processed),
                    summary.as_ref(),
                )
                .await?;
        }

        let row = self.ctx.jobs.require(&self.job.id).await?;
        events::job_completed(&row);
        Ok(row)
    }

    fn build_summary(
        &self,
        report: Option<TransferResult<report::ReportOutcome>>,
    ) -> Option<ErrorSummary> {
        let totals = &self.totals;
        if totals.persisted_errors == 0 && totals.persistence_failures == 0 {
            return None;
        }
        let (report_location, report_generation_failed) = match report {
            Some(Ok(outcome)) => (Some(outcome.location), false),
            Some(Err(err)) => {
                warn!(job_id = %self.job.id, %err, "error report generation failed");
                (None, true)
            }
            None => (None, false),
        };
        let report_status = if report_generation_failed {
            ReportStatus::Failed
        } else if totals.persistence_failures > 0 {
            ReportStatus::Partial
        } else {
            ReportStatus::Complete
        };
        Some(ErrorSummary {
            report_status,
            persisted_error_count: totals.persisted_errors,
            persistence_failures: totals.persistence_failures,
            report_location,
            report_format: self.job.format,
            report_generation_failed,
        })
    }

    /// Source stream: a storage key resolved to a local path, or a raw
    /// filesystem location.
    async fn open_source(&self) -> TransferResult<tokio::fs::File> {
        let location = self.job.source_location.as_deref().ok_or_else(|| {
            TransferError::new(ErrorCode::InternalError, "import job has no source location")
        })?;

        if let Ok(path) = self.ctx.storage.local_path(location) {
            if path.exists() {
                return Ok(tokio::fs::File::open(path).await?);
            }
        }
        match tokio::fs::File::open(location).await {
            Ok(file) => Ok(file),
            Err(err) => Err(TransferError::new(
                ErrorCode::FileIoError,
                format!("cannot open import source {location}: {err}"),
            )),
        }
    }

}

fn to_op(index: usize, normalized: NormalizedRecord) -> RecordOp {
    match normalized {
        NormalizedRecord::User(record) => RecordOp::User { index, record },
        NormalizedRecord::Article(record) => RecordOp::Article { index, record },
        NormalizedRecord::Comment(record) => RecordOp::Comment { index, record },
    }
}

/// Business key from the raw record, for error journaling.
fn business_key(resource: ResourceKind, value: &Value) -> Option<String> {
    let map = value.as_object()?;
    let id = map.get("id").map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    if let Some(id) = id {
        return Some(id);
    }
    let secondary = match resource {
        ResourceKind::Users => "email",
        ResourceKind::Articles => "slug",
        ResourceKind::Comments => return None,
    };
    map.get(secondary).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WorkerSettings;
    use stevedore_db::pool::{create_pool, DbConfig};
    use stevedore_db::schema::bootstrap;
    use stevedore_protocol::ExportFormat;
    use stevedore_storage::LocalStorage;

    async fn context(dir: &tempfile::TempDir) -> WorkerContext {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        WorkerContext::new(
            pool,
            LocalStorage::new(dir.path()),
            WorkerSettings {
                batch_size: 2,
                ..WorkerSettings::default()
            },
        )
    }

    async fn import_job(ctx: &WorkerContext, body: &str, file: &str) -> JobRow {
        ctx.storage.save_buffer(file, body.as_bytes()).await.unwrap();
        let created = ctx
            .jobs
            .create(stevedore_db::NewJob {
                owner_id: "o1".into(),
                kind: Some(stevedore_protocol::JobKind::Import),
                resource: Some(ResourceKind::Users),
                format: ExportFormat::from_file_name(file).unwrap_or_default(),
                source_type: Some(stevedore_protocol::SourceType::Upload),
                source_location: Some(file.to_string()),
                file_name: Some(file.to_string()),
                ..stevedore_db::NewJob::default()
            })
            .await
            .unwrap();
        created.job
    }

    #[tokio::test]
    async fn clean_import_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let body = "{\"email\":\"a@example.com\"}\n{\"email\":\"b@example.com\"}\n{\"email\":\"c@example.com\"}\n";
        let job = import_job(&ctx, body, "src.ndjson").await;

        let row = ctx.run_job(&job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);
        assert_eq!(row.processed_records, 3);
        assert_eq!(row.success_count, 3);
        assert_eq!(row.error_count, 0);
        assert!(row.error_summary.is_none());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(ctx.jobs.pool())
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn partial_import_journals_errors_and_generates_report() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let body = "{\"email\":\"bad\"}\n{\"email\":\"ok@example.com\"}\n";
        let job = import_job(&ctx, body, "src.ndjson").await;

        let row = ctx.run_job(&job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Partial);
        assert_eq!(row.processed_records, 2);
        assert_eq!(row.success_count, 1);
        assert_eq!(row.error_count, 1);

        let summary = row.error_summary().unwrap();
        assert_eq!(summary.report_status, ReportStatus::Complete);
        assert_eq!(summary.persisted_error_count, 1);
        assert!(summary.report_location.is_some());
        assert!(ctx
            .storage
            .local_path(summary.report_location.as_deref().unwrap())
            .unwrap()
            .exists());
    }

    #[tokio::test]
    async fn empty_file_fails_with_fatal_row() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let job = import_job(&ctx, "\n\n", "src.ndjson").await;

        let row = ctx.run_job(&job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.processed_records, 0);

        let errors = ctx.journal.preview(&job.id, 10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].record_index, -1);
        assert_eq!(errors[0].error_name, "EMPTY_FILE");
    }

    #[tokio::test]
    async fn parse_error_is_fatal_but_keeps_prior_counts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        // One valid record sits in the pending buffer (batch_size is 2)
        // when the bad line aborts the parse.
        let body = "{\"email\":\"a@example.com\"}\nnot json\n";
        let job = import_job(&ctx, body, "src.ndjson").await;

        let row = ctx.run_job(&job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);

        // The buffered record was flushed before the abort: it is upserted
        // and counted, and processed = success + errors holds.
        assert_eq!(row.processed_records, 1);
        assert_eq!(row.success_count, 1);
        assert_eq!(row.error_count, 0);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = 'a@example.com'")
            .fetch_one(ctx.jobs.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let errors = ctx.journal.preview(&job.id, 10).await.unwrap();
        assert!(errors.iter().any(|e| e.record_index == -1 && e.error_name == "PARSE_ERROR"));
    }

    #[tokio::test]
    async fn buffered_validation_errors_survive_a_fatal_tail() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let body = "{\"email\":\"bad\"}\nnot json\n";
        let job = import_job(&ctx, body, "src.ndjson").await;

        let row = ctx.run_job(&job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.processed_records, 1);
        assert_eq!(row.success_count, 0);
        assert_eq!(row.error_count, 1);

        // Both the buffered record error and the fatal row are journaled.
        let errors = ctx.journal.preview(&job.id, 10).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].record_index, 0);
        assert_eq!(errors[0].error_name, "INVALID_FORMAT");
        assert_eq!(errors[1].record_index, -1);
        assert_eq!(errors[1].error_name, "PARSE_ERROR");
    }

    #[tokio::test]
    async fn json_array_source_is_supported() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let body = r#"[{"email":"a@example.com"},{"email":"b@example.com"}]"#;
        let job = import_job(&ctx, body, "src.json").await;

        let row = ctx.run_job(&job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);
        assert_eq!(row.success_count, 2);
    }

    #[tokio::test]
    async fn duplicate_emails_within_file_count_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let body = "{\"email\":\"dup@example.com\"}\n{\"email\":\"dup@example.com\"}\n";
        let job = import_job(&ctx, body, "src.ndjson").await;

        let row = ctx.run_job(&job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Partial);
        assert_eq!(row.success_count, 1);
        assert_eq!(row.error_count, 1);
        let errors = ctx.journal.preview(&job.id, 10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_name, "DUPLICATE_VALUE");
        assert_eq!(errors[0].record_index, 1);
    }
}
