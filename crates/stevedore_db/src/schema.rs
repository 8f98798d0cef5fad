//! Schema bootstrap.
//!
//! Idempotent `CREATE TABLE IF NOT EXISTS` statements; no migration
//! machinery. Timestamps are stored as fixed-width RFC 3339 TEXT (see
//! [`crate::fmt_ts`]) so range predicates compare correctly.

use crate::DbPool;
use stevedore_protocol::TransferResult;

const SCHEMA: &[&str] = &[
    // Entity families
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        email TEXT NOT NULL COLLATE NOCASE UNIQUE,
        name TEXT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'user',
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        id INTEGER PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        description TEXT,
        body TEXT,
        author_id INTEGER NOT NULL REFERENCES users(id),
        status TEXT NOT NULL DEFAULT 'draft',
        published_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS article_tags (
        article_id INTEGER NOT NULL REFERENCES articles(id),
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        PRIMARY KEY (article_id, tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS comments (
        id INTEGER PRIMARY KEY,
        article_id INTEGER NOT NULL REFERENCES articles(id),
        user_id INTEGER NOT NULL REFERENCES users(id),
        body TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    // Job rows; mutated only by the claim holder after creation.
    r#"
    CREATE TABLE IF NOT EXISTS transfer_jobs (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        resource TEXT NOT NULL,
        format TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        total_records INTEGER,
        processed_records INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        idempotency_key TEXT,
        request_hash TEXT,
        filters TEXT,
        fields TEXT,
        output_location TEXT,
        download_url TEXT,
        file_size INTEGER,
        expires_at TEXT,
        source_type TEXT,
        source_location TEXT,
        file_name TEXT,
        error_summary TEXT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_idempotency
        ON transfer_jobs (owner_id, idempotency_key, resource)
        WHERE idempotency_key IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_jobs_owner_created
        ON transfer_jobs (owner_id, created_at)
    "#,
    // Import error journal; record_index -1 is reserved for whole-job failures.
    r#"
    CREATE TABLE IF NOT EXISTS import_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL REFERENCES transfer_jobs(id),
        record_index INTEGER NOT NULL,
        record_id TEXT,
        error_code INTEGER NOT NULL,
        error_name TEXT NOT NULL,
        message TEXT NOT NULL,
        field TEXT,
        value TEXT,
        details TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_import_errors_job
        ON import_errors (job_id, id)
    "#,
    // Queue: named topic, deterministic broker key, fixed-backoff retries.
    r#"
    CREATE TABLE IF NOT EXISTS job_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        broker_key TEXT NOT NULL UNIQUE,
        job_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        retry_count INTEGER NOT NULL DEFAULT 0,
        available_at TEXT NOT NULL,
        claim_time TEXT,
        end_time TEXT,
        last_error TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_queue_topic_status
        ON job_queue (topic, status, available_at)
    "#,
];

/// Create all tables and indices. Safe to call on every startup.
pub async fn bootstrap(pool: &DbPool) -> TransferResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        bootstrap(&pool).await.unwrap();

        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(n >= 7);
    }
}
