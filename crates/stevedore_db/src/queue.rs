//! Job queue.
//!
//! Named-topic, at-least-once delivery over the relational store. Atomic
//! pops via `UPDATE ... WHERE status = 'queued'`. The broker-side key
//! `<kind>-<job_id>` is unique, so an enqueue retry cannot duplicate a
//! pending entry. Completed entries are removed.

use chrono::{Duration, Utc};
use sqlx::FromRow;
use tracing::{info, warn};

use crate::{fmt_ts, DbPool};
use stevedore_protocol::defaults::{QUEUE_MAX_RETRIES, QUEUE_RETRY_BACKOFF_SECS};
use stevedore_protocol::{broker_key, JobKind, TransferResult};

#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    pub id: i64,
    pub topic: String,
    pub broker_key: String,
    pub job_id: String,
    pub kind: JobKind,
    pub status: String,
    pub retry_count: i32,
}

pub struct JobQueue {
    pool: DbPool,
}

impl JobQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Enqueue a job under its deterministic broker key. Re-enqueueing an
    /// already-pending job is a no-op.
    pub async fn enqueue(&self, topic: &str, kind: JobKind, job_id: &str) -> TransferResult<()> {
        let key = broker_key(kind, job_id);
        let now = fmt_ts(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO job_queue (topic, broker_key, job_id, kind, status, available_at)
            VALUES (?, ?, ?, ?, 'queued', ?)
            ON CONFLICT (broker_key) DO NOTHING
            "#,
        )
        .bind(topic)
        .bind(&key)
        .bind(job_id)
        .bind(kind)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        info!(job_id, topic, "enqueued job");
        Ok(())
    }

    /// Atomically pop the next available entry for a topic.
    ///
    /// Entries are claimed oldest-first; entries whose retry backoff has not
    /// elapsed are skipped.
    pub async fn pop(&self, topic: &str) -> TransferResult<Option<QueueEntry>> {
        let mut tx = self.pool.begin().await?;
        let now = fmt_ts(Utc::now());

        let entry_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM job_queue
            WHERE topic = ? AND status = 'queued' AND available_at <= ?
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(topic)
        .bind(&now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(entry_id) = entry_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let rows_affected = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'running', claim_time = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(&now)
        .bind(entry_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Claimed by another worker between the select and the update.
            tx.commit().await?;
            return Ok(None);
        }

        let entry: QueueEntry = sqlx::query_as("SELECT * FROM job_queue WHERE id = ?")
            .bind(entry_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(entry))
    }

    /// Remove a delivered entry.
    pub async fn complete(&self, entry_id: i64) -> TransferResult<()> {
        sqlx::query("DELETE FROM job_queue WHERE id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a delivery failure. Retriable entries go back to `queued`
    /// with a fixed backoff; exhausted entries are parked as `failed`.
    pub async fn fail(&self, entry_id: i64, error: &str) -> TransferResult<()> {
        let retry_count: i32 =
            sqlx::query_scalar("SELECT retry_count FROM job_queue WHERE id = ?")
                .bind(entry_id)
                .fetch_one(&self.pool)
                .await?;

        if retry_count + 1 < QUEUE_MAX_RETRIES {
            let next = fmt_ts(Utc::now() + Duration::seconds(QUEUE_RETRY_BACKOFF_SECS));
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'queued', retry_count = retry_count + 1,
                    claim_time = NULL, available_at = ?, last_error = ?
                WHERE id = ?
                "#,
            )
            .bind(&next)
            .bind(error)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
            warn!(entry_id, retry = retry_count + 1, error, "queue entry requeued");
        } else {
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'failed', end_time = ?, last_error = ?
                WHERE id = ?
                "#,
            )
            .bind(fmt_ts(Utc::now()))
            .bind(error)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
            warn!(entry_id, error, "queue entry exhausted retries");
        }
        Ok(())
    }
}
