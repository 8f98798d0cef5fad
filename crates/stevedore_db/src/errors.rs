//! Import error journal.
//!
//! Per-record errors are journaled, never raised. Inserts are batched in
//! one transaction; reads are paged by row id for the report generator.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::{fmt_ts, DbPool};
use stevedore_protocol::{TransferError, TransferResult};

/// Journal row as stored.
#[derive(Debug, Clone, FromRow)]
pub struct ImportErrorRow {
    pub id: i64,
    pub job_id: String,
    pub record_index: i64,
    pub record_id: Option<String>,
    pub error_code: i64,
    pub error_name: String,
    pub message: String,
    pub field: Option<String>,
    pub value: Option<String>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A buffered error waiting to be journaled.
#[derive(Debug, Clone)]
pub struct NewImportError {
    /// Source record ordinal; -1 for whole-job failures.
    pub record_index: i64,
    /// Business key extracted from the offending record, when present.
    pub record_id: Option<String>,
    pub error: TransferError,
}

pub struct ErrorJournal {
    pool: DbPool,
}

impl ErrorJournal {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append a batch of errors in one transaction. Returns the number of
    /// rows written.
    pub async fn insert_many(
        &self,
        job_id: &str,
        errors: &[NewImportError],
    ) -> TransferResult<usize> {
        if errors.is_empty() {
            return Ok(0);
        }
        let now = fmt_ts(Utc::now());
        let mut tx = self.pool.begin().await?;
        for entry in errors {
            let value_json = entry
                .error
                .value
                .as_ref()
                .map(|v| v.to_string());
            let details_json = entry
                .error
                .details
                .as_ref()
                .map(|v| v.to_string());
            sqlx::query(
                r#"
                INSERT INTO import_errors (
                    job_id, record_index, record_id, error_code, error_name,
                    message, field, value, details, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job_id)
            .bind(entry.record_index)
            .bind(&entry.record_id)
            .bind(entry.error.code.code() as i64)
            .bind(entry.error.code.name())
            .bind(&entry.error.message)
            .bind(&entry.error.field)
            .bind(value_json)
            .bind(details_json)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(errors.len())
    }

    /// Page of journal rows in ascending internal order, starting after
    /// `after_id` (exclusive).
    pub async fn fetch_page(
        &self,
        job_id: &str,
        after_id: i64,
        limit: i64,
    ) -> TransferResult<Vec<ImportErrorRow>> {
        let rows = sqlx::query_as::<_, ImportErrorRow>(
            r#"
            SELECT * FROM import_errors
            WHERE job_id = ? AND id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(job_id)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// First rows of the journal, for status previews.
    pub async fn preview(&self, job_id: &str, limit: i64) -> TransferResult<Vec<ImportErrorRow>> {
        self.fetch_page(job_id, 0, limit).await
    }

    pub async fn count(&self, job_id: &str) -> TransferResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM import_errors WHERE job_id = ?")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobStore, NewJob};
    use crate::pool::{create_pool, DbConfig};
    use crate::schema::bootstrap;
    use serde_json::json;
    use stevedore_protocol::{ErrorCode, ExportFormat, JobKind, ResourceKind};

    async fn setup() -> (DbPool, String) {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        let store = JobStore::new(pool.clone());
        let job = store
            .create(NewJob {
                owner_id: "o1".into(),
                kind: Some(JobKind::Import),
                resource: Some(ResourceKind::Users),
                format: ExportFormat::Ndjson,
                ..NewJob::default()
            })
            .await
            .unwrap()
            .job;
        (pool, job.id)
    }

    fn entry(index: i64, code: ErrorCode) -> NewImportError {
        NewImportError {
            record_index: index,
            record_id: Some(format!("r{index}")),
            error: TransferError::new(code, "bad").with_field("email").with_value(json!("x")),
        }
    }

    #[tokio::test]
    async fn insert_and_page() {
        let (pool, job_id) = setup().await;
        let journal = ErrorJournal::new(pool);

        let batch: Vec<NewImportError> =
            (0..5).map(|i| entry(i, ErrorCode::InvalidFormat)).collect();
        assert_eq!(journal.insert_many(&job_id, &batch).await.unwrap(), 5);
        assert_eq!(journal.count(&job_id).await.unwrap(), 5);

        let first = journal.fetch_page(&job_id, 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].record_index, 0);
        assert_eq!(first[0].error_code, 1003);
        assert_eq!(first[0].error_name, "INVALID_FORMAT");

        let rest = journal
            .fetch_page(&job_id, first.last().unwrap().id, 100)
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn empty_batch_is_noop() {
        let (pool, job_id) = setup().await;
        let journal = ErrorJournal::new(pool);
        assert_eq!(journal.insert_many(&job_id, &[]).await.unwrap(), 0);
    }
}
