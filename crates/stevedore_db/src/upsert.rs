//! Upsert engine.
//!
//! A batch of validated records becomes an ordered list of per-record
//! operations. One transaction executes the whole batch first; on any
//! failure every operation is re-executed independently and failures are
//! classified per record. Re-execution against the same store state must
//! produce identical outcomes.

use rand::Rng;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::{fmt_ts, DbPool};
use stevedore_protocol::{
    ArticleRecord, CommentRecord, ErrorCode, TransferError, TransferResult, UserRecord,
};

/// One record's store operation, tagged by entity family.
#[derive(Debug, Clone)]
pub enum RecordOp {
    User { index: usize, record: UserRecord },
    Article { index: usize, record: ArticleRecord },
    Comment { index: usize, record: CommentRecord },
}

impl RecordOp {
    pub fn index(&self) -> usize {
        match self {
            RecordOp::User { index, .. }
            | RecordOp::Article { index, .. }
            | RecordOp::Comment { index, .. } => *index,
        }
    }

    /// Business key for error journaling.
    pub fn record_id(&self) -> Option<String> {
        match self {
            RecordOp::User { record, .. } => record
                .id
                .map(|id| id.to_string())
                .or_else(|| record.email.clone()),
            RecordOp::Article { record, .. } => record
                .id
                .map(|id| id.to_string())
                .or_else(|| record.slug.clone()),
            RecordOp::Comment { record, .. } => record.id.map(|id| id.to_string()),
        }
    }

    fn fk_hint(&self) -> Option<&'static str> {
        match self {
            RecordOp::User { .. } => None,
            RecordOp::Article { .. } => Some("author_id"),
            RecordOp::Comment { .. } => Some("article_id"),
        }
    }

    async fn execute(&self, conn: &mut SqliteConnection) -> Result<(), TransferError> {
        match self {
            RecordOp::User { record, .. } => upsert_user(conn, record).await,
            RecordOp::Article { record, .. } => upsert_article(conn, record).await,
            RecordOp::Comment { record, .. } => upsert_comment(conn, record).await,
        }
        .map_err(|err| match err {
            OpError::Transfer(e) => e,
            OpError::Db(e) => classify_db_error(e, self.fk_hint()),
        })
    }
}

/// A classified per-record failure from the fallback pass.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub index: usize,
    pub record_id: Option<String>,
    pub error: TransferError,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failures: Vec<RecordFailure>,
}

/// Apply a batch of operations: transaction first, per-record fallback on
/// any transactional failure.
pub async fn apply_batch(pool: &DbPool, ops: &[RecordOp]) -> TransferResult<BatchOutcome> {
    if ops.is_empty() {
        return Ok(BatchOutcome::default());
    }

    precreate_tags(pool, ops).await?;

    let batch_result = async {
        let mut tx = pool.begin().await.map_err(TransferError::from)?;
        for op in ops {
            op.execute(&mut tx).await?;
        }
        tx.commit().await.map_err(TransferError::from)?;
        Ok::<_, TransferError>(())
    }
    .await;

    if batch_result.is_ok() {
        return Ok(BatchOutcome {
            succeeded: ops.len(),
            failures: Vec::new(),
        });
    }
    debug!(batch = ops.len(), "batch transaction failed, re-executing per record");

    let mut outcome = BatchOutcome::default();
    for op in ops {
        let single = async {
            let mut tx = pool.begin().await.map_err(TransferError::from)?;
            op.execute(&mut tx).await?;
            tx.commit().await.map_err(TransferError::from)?;
            Ok::<_, TransferError>(())
        }
        .await;
        match single {
            Ok(()) => outcome.succeeded += 1,
            Err(error) => outcome.failures.push(RecordFailure {
                index: op.index(),
                record_id: op.record_id(),
                error,
            }),
        }
    }
    Ok(outcome)
}

/// Bulk insert-or-skip for every tag name referenced by the batch.
async fn precreate_tags(pool: &DbPool, ops: &[RecordOp]) -> TransferResult<()> {
    let mut names: Vec<&str> = Vec::new();
    for op in ops {
        if let RecordOp::Article { record, .. } = op {
            if let Some(tags) = &record.tags {
                names.extend(tags.iter().map(String::as_str));
            }
        }
    }
    names.sort_unstable();
    names.dedup();
    if names.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for name in names {
        sqlx::query("INSERT INTO tags (name) VALUES (?) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

// ----------------------------------------------------------------------
// Per-entity operations
// ----------------------------------------------------------------------

enum OpError {
    Transfer(TransferError),
    Db(sqlx::Error),
}

impl From<sqlx::Error> for OpError {
    fn from(err: sqlx::Error) -> Self {
        OpError::Db(err)
    }
}

impl From<TransferError> for OpError {
    fn from(err: TransferError) -> Self {
        OpError::Transfer(err)
    }
}

async fn upsert_user(conn: &mut SqliteConnection, record: &UserRecord) -> Result<(), OpError> {
    if let Some(id) = record.id {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_some() {
            update_user(conn, id, record, "id").await
        } else {
            insert_user(conn, Some(id), record).await
        }
    } else if let Some(email) = &record.email {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM users WHERE email = ? COLLATE NOCASE")
                .bind(email)
                .fetch_optional(&mut *conn)
                .await?;
        match existing {
            Some(id) => update_user(conn, id, record, "email").await,
            None => insert_user(conn, None, record).await,
        }
    } else {
        Err(TransferError::new(
            ErrorCode::MissingRequiredField,
            "user record needs an id or an email to be addressed",
        )
        .with_field("id")
        .into())
    }
}

async fn update_user(
    conn: &mut SqliteConnection,
    id: i64,
    record: &UserRecord,
    lookup_field: &str,
) -> Result<(), OpError> {
    let affected = sqlx::query(
        r#"
        UPDATE users
        SET email = COALESCE(?, email),
            name = COALESCE(?, name),
            role = COALESCE(?, role),
            active = COALESCE(?, active),
            updated_at = COALESCE(?, ?)
        WHERE id = ?
        "#,
    )
    .bind(&record.email)
    .bind(&record.name)
    .bind(&record.role)
    .bind(record.active.map(i64::from))
    .bind(record.updated_at.map(fmt_ts))
    .bind(fmt_ts(chrono::Utc::now()))
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected == 0 {
        return Err(TransferError::new(
            ErrorCode::InvalidReference,
            format!("user {id} disappeared during update"),
        )
        .with_field(lookup_field)
        .into());
    }
    Ok(())
}

async fn insert_user(
    conn: &mut SqliteConnection,
    id: Option<i64>,
    record: &UserRecord,
) -> Result<(), OpError> {
    let email = record.email.as_deref().ok_or_else(|| {
        TransferError::new(ErrorCode::MissingRequiredField, "email is required to create a user")
            .with_field("email")
    })?;
    let now = fmt_ts(chrono::Utc::now());
    let created_at = record.created_at.map(fmt_ts).unwrap_or_else(|| now.clone());
    let updated_at = record.updated_at.map(fmt_ts).unwrap_or_else(|| now.clone());

    // Derived username with bounded collision retries.
    let base = derive_username(email, record.name.as_deref());
    let mut candidate = base.clone();
    let mut last_err = None;
    for attempt in 0..3 {
        let result = sqlx::query(
            r#"
            INSERT INTO users (id, email, name, username, password_hash, role, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(email)
        .bind(&record.name)
        .bind(&candidate)
        .bind(placeholder_credential())
        .bind(record.role.as_deref().unwrap_or("user"))
        .bind(record.active.map(i64::from).unwrap_or(1))
        .bind(&created_at)
        .bind(&updated_at)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => return Ok(()),
            Err(err) if attempt < 2 && is_username_collision(&err) => {
                candidate = format!("{base}-{}", random_suffix());
                last_err = Some(err);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(last_err
        .map(OpError::Db)
        .unwrap_or_else(|| {
            TransferError::new(ErrorCode::InternalError, "username retry loop exhausted").into()
        }))
}

async fn upsert_article(
    conn: &mut SqliteConnection,
    record: &ArticleRecord,
) -> Result<(), OpError> {
    // Status inferred from published_at when absent; drafts never keep a
    // publication timestamp.
    let effective_status = record
        .status
        .clone()
        .or_else(|| record.published_at.map(|_| "published".to_string()));

    if let Some(id) = record.id {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM articles WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_some() {
            update_article(conn, id, record, effective_status.as_deref(), "id").await?;
        } else {
            insert_article(conn, Some(id), record, effective_status.as_deref()).await?;
        }
        replace_tags(conn, Some(id), record).await
    } else if let Some(slug) = &record.slug {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM articles WHERE slug = ?")
                .bind(slug)
                .fetch_optional(&mut *conn)
                .await?;
        match existing {
            Some(id) => {
                update_article(conn, id, record, effective_status.as_deref(), "slug").await?;
                replace_tags(conn, Some(id), record).await
            }
            None => {
                insert_article(conn, None, record, effective_status.as_deref()).await?;
                let id: i64 = sqlx::query_scalar("SELECT id FROM articles WHERE slug = ?")
                    .bind(slug)
                    .fetch_one(&mut *conn)
                    .await?;
                replace_tags(conn, Some(id), record).await
            }
        }
    } else {
        Err(TransferError::new(
            ErrorCode::MissingRequiredField,
            "article record needs an id or a slug to be addressed",
        )
        .with_field("id")
        .into())
    }
}

async fn update_article(
    conn: &mut SqliteConnection,
    id: i64,
    record: &ArticleRecord,
    effective_status: Option<&str>,
    lookup_field: &str,
) -> Result<(), OpError> {
    let description = record.body.as_deref().or(record.title.as_deref()).map(derive_description);
    let clears_published = effective_status == Some("draft");
    let affected = sqlx::query(
        r#"
        UPDATE articles
        SET slug = COALESCE(?, slug),
            title = COALESCE(?, title),
            description = COALESCE(?, description),
            body = COALESCE(?, body),
            author_id = COALESCE(?, author_id),
            status = COALESCE(?, status),
            published_at = CASE WHEN ? THEN NULL ELSE COALESCE(?, published_at) END,
            updated_at = COALESCE(?, ?)
        WHERE id = ?
        "#,
    )
    .bind(&record.slug)
    .bind(&record.title)
    .bind(description)
    .bind(&record.body)
    .bind(record.author_id)
    .bind(effective_status)
    .bind(clears_published)
    .bind(record.published_at.map(fmt_ts))
    .bind(record.updated_at.map(fmt_ts))
    .bind(fmt_ts(chrono::Utc::now()))
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected == 0 {
        return Err(TransferError::new(
            ErrorCode::InvalidReference,
            format!("article {id} disappeared during update"),
        )
        .with_field(lookup_field)
        .into());
    }
    Ok(())
}

async fn insert_article(
    conn: &mut SqliteConnection,
    id: Option<i64>,
    record: &ArticleRecord,
    effective_status: Option<&str>,
) -> Result<(), OpError> {
    let slug = record.slug.as_deref().ok_or_else(|| {
        TransferError::new(ErrorCode::MissingRequiredField, "slug is required to create an article")
            .with_field("slug")
    })?;
    let title = record.title.as_deref().ok_or_else(|| {
        TransferError::new(ErrorCode::MissingRequiredField, "title is required to create an article")
            .with_field("title")
    })?;
    let author_id = record.author_id.ok_or_else(|| {
        TransferError::new(
            ErrorCode::MissingRequiredField,
            "author_id is required to create an article",
        )
        .with_field("author_id")
    })?;

    let status = effective_status.unwrap_or("draft");
    let published_at = if status == "draft" {
        None
    } else {
        record.published_at.map(fmt_ts)
    };
    let description = derive_description(record.body.as_deref().unwrap_or(title));
    let now = fmt_ts(chrono::Utc::now());

    sqlx::query(
        r#"
        INSERT INTO articles (id, slug, title, description, body, author_id, status, published_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(slug)
    .bind(title)
    .bind(description)
    .bind(&record.body)
    .bind(author_id)
    .bind(status)
    .bind(published_at)
    .bind(record.created_at.map(fmt_ts).unwrap_or_else(|| now.clone()))
    .bind(record.updated_at.map(fmt_ts).unwrap_or_else(|| now.clone()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Replace the stored tag set when the incoming record supplied one.
async fn replace_tags(
    conn: &mut SqliteConnection,
    article_id: Option<i64>,
    record: &ArticleRecord,
) -> Result<(), OpError> {
    let (Some(article_id), Some(tags)) = (article_id, &record.tags) else {
        return Ok(());
    };
    sqlx::query("DELETE FROM article_tags WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;
    for name in tags {
        sqlx::query(
            r#"
            INSERT INTO article_tags (article_id, tag_id)
            SELECT ?, id FROM tags WHERE name = ?
            "#,
        )
        .bind(article_id)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn upsert_comment(
    conn: &mut SqliteConnection,
    record: &CommentRecord,
) -> Result<(), OpError> {
    let id = record.id.ok_or_else(|| {
        TransferError::new(ErrorCode::MissingRequiredField, "comment record needs an id")
            .with_field("id")
    })?;

    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM comments WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    if exists.is_some() {
        sqlx::query(
            r#"
            UPDATE comments
            SET article_id = COALESCE(?, article_id),
                user_id = COALESCE(?, user_id),
                body = COALESCE(?, body),
                updated_at = COALESCE(?, ?)
            WHERE id = ?
            "#,
        )
        .bind(record.article_id)
        .bind(record.user_id)
        .bind(&record.body)
        .bind(record.updated_at.map(fmt_ts))
        .bind(fmt_ts(chrono::Utc::now()))
        .bind(id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    } else {
        let article_id = record.article_id.ok_or_else(|| {
            TransferError::new(
                ErrorCode::MissingRequiredField,
                "article_id is required to create a comment",
            )
            .with_field("article_id")
        })?;
        let user_id = record.user_id.ok_or_else(|| {
            TransferError::new(
                ErrorCode::MissingRequiredField,
                "user_id is required to create a comment",
            )
            .with_field("user_id")
        })?;
        let body = record.body.as_deref().ok_or_else(|| {
            TransferError::new(ErrorCode::MissingRequiredField, "body is required to create a comment")
                .with_field("body")
        })?;
        let now = fmt_ts(chrono::Utc::now());
        sqlx::query(
            r#"
            INSERT INTO comments (id, article_id, user_id, body, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(article_id)
        .bind(user_id)
        .bind(body)
        .bind(record.created_at.map(fmt_ts).unwrap_or_else(|| now.clone()))
        .bind(record.updated_at.map(fmt_ts).unwrap_or_else(|| now.clone()))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Error classification & derivations
// ----------------------------------------------------------------------

/// Classify a store error into the taxonomy.
pub fn classify_db_error(err: sqlx::Error, fk_hint: Option<&str>) -> TransferError {
    if let Some(db) = err.as_database_error() {
        match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation => {
                let field = unique_violation_field(db.message());
                TransferError::new(
                    ErrorCode::DuplicateValue,
                    format!("value already exists for {field}"),
                )
                .with_field(field)
            }
            sqlx::error::ErrorKind::ForeignKeyViolation => TransferError::new(
                ErrorCode::InvalidReference,
                "referenced row does not exist",
            )
            .with_field(fk_hint.unwrap_or("record")),
            _ => TransferError::new(ErrorCode::BatchFailed, db.message().to_string())
                .with_field("record"),
        }
    } else {
        TransferError::new(ErrorCode::DatabaseError, err.to_string())
    }
}

/// Extract and canonicalize the column behind a unique violation.
///
/// SQLite reports `UNIQUE constraint failed: users.email`.
fn unique_violation_field(message: &str) -> String {
    let column = message
        .rsplit(':')
        .next()
        .and_then(|tail| tail.trim().split(',').next())
        .and_then(|qualified| qualified.trim().rsplit('.').next())
        .unwrap_or("record");
    match column {
        "tag_list" => "tags".to_string(),
        other => other.to_string(),
    }
}

fn is_username_collision(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| {
            db.kind() == sqlx::error::ErrorKind::UniqueViolation
                && db.message().contains("users.username")
        })
        .unwrap_or(false)
}

/// Deterministic username base: email local part, else kebab-case name.
fn derive_username(email: &str, name: Option<&str>) -> String {
    let local = email.split('@').next().unwrap_or_default();
    if !local.is_empty() {
        return local.to_ascii_lowercase();
    }
    name.map(kebab_case)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "user".to_string())
}

fn kebab_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

fn random_suffix() -> String {
    format!("{:06x}", rand::thread_rng().gen_range(0..0x0100_0000u32))
}

/// Placeholder credential for imported users; never a usable password.
fn placeholder_credential() -> String {
    let nonce: [u8; 16] = rand::thread_rng().gen();
    blake3::hash(&nonce).to_hex().to_string()
}

/// First 160 characters of the source text.
fn derive_description(text: &str) -> String {
    text.chars().take(160).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};
    use crate::schema::bootstrap;

    async fn pool() -> DbPool {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        pool
    }

    fn user(email: &str) -> UserRecord {
        UserRecord {
            email: Some(email.to_string()),
            name: Some("Test User".to_string()),
            ..UserRecord::default()
        }
    }

    #[tokio::test]
    async fn batch_of_new_users_succeeds_in_one_transaction() {
        let pool = pool().await;
        let ops = vec![
            RecordOp::User { index: 0, record: user("a@example.com") },
            RecordOp::User { index: 1, record: user("b@example.com") },
        ];
        let outcome = apply_batch(&pool, &ops).await.unwrap();
        assert_eq!(outcome.succeeded, 2);
        assert!(outcome.failures.is_empty());

        let usernames: Vec<String> = sqlx::query_scalar("SELECT username FROM users ORDER BY email")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(usernames, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn fallback_classifies_duplicate_email() {
        let pool = pool().await;
        apply_batch(&pool, &[RecordOp::User { index: 0, record: user("a@example.com") }])
            .await
            .unwrap();

        // Same email again, no id: resolves to an update of the existing
        // row, so it succeeds. A conflicting explicit id forces the insert
        // path and the duplicate surfaces.
        let mut dup = user("a@example.com");
        dup.id = Some(42);
        let outcome = apply_batch(&pool, &[RecordOp::Article { index: 0, record: ArticleRecord { slug: Some("x".into()), ..ArticleRecord::default() } }, RecordOp::User { index: 1, record: dup }])
            .await
            .unwrap();

        // The article is missing its author, so the transaction fails and
        // the fallback classifies both records independently.
        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.failures.len(), 2);
        let user_failure = outcome.failures.iter().find(|f| f.index == 1).unwrap();
        assert_eq!(user_failure.error.code, ErrorCode::DuplicateValue);
        assert_eq!(user_failure.error.field.as_deref(), Some("email"));
    }

    #[tokio::test]
    async fn article_upsert_replaces_tags_and_derives_description() {
        let pool = pool().await;
        apply_batch(&pool, &[RecordOp::User { index: 0, record: user("a@example.com") }])
            .await
            .unwrap();

        let record = ArticleRecord {
            slug: Some("hello-world".to_string()),
            title: Some("Hello".to_string()),
            body: Some("B".repeat(400)),
            author_id: Some(1),
            tags: Some(vec!["rust".to_string(), "async".to_string()]),
            published_at: Some(chrono::Utc::now()),
            ..ArticleRecord::default()
        };
        let outcome = apply_batch(&pool, &[RecordOp::Article { index: 0, record: record.clone() }])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 1);

        let (status, description): (String, String) =
            sqlx::query_as("SELECT status, description FROM articles WHERE slug = 'hello-world'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "published");
        assert_eq!(description.len(), 160);

        // Replacing with a smaller tag set drops the old junction rows.
        let mut update = record;
        update.tags = Some(vec!["rust".to_string()]);
        apply_batch(&pool, &[RecordOp::Article { index: 0, record: update }])
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM article_tags")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn draft_clears_published_at() {
        let pool = pool().await;
        apply_batch(&pool, &[RecordOp::User { index: 0, record: user("a@example.com") }])
            .await
            .unwrap();
        let published = ArticleRecord {
            slug: Some("s".to_string()),
            title: Some("T".to_string()),
            author_id: Some(1),
            published_at: Some(chrono::Utc::now()),
            ..ArticleRecord::default()
        };
        apply_batch(&pool, &[RecordOp::Article { index: 0, record: published }])
            .await
            .unwrap();

        let demote = ArticleRecord {
            slug: Some("s".to_string()),
            status: Some("draft".to_string()),
            ..ArticleRecord::default()
        };
        apply_batch(&pool, &[RecordOp::Article { index: 0, record: demote }])
            .await
            .unwrap();

        let published_at: Option<String> =
            sqlx::query_scalar("SELECT published_at FROM articles WHERE slug = 's'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(published_at.is_none());
    }

    #[tokio::test]
    async fn comment_requires_id_and_references() {
        let pool = pool().await;
        let outcome = apply_batch(
            &pool,
            &[RecordOp::Comment { index: 0, record: CommentRecord::default() }],
        )
        .await
        .unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].error.code, ErrorCode::MissingRequiredField);
        assert_eq!(outcome.failures[0].error.field.as_deref(), Some("id"));
    }

    #[tokio::test]
    async fn comment_fk_violation_classified_as_invalid_reference() {
        let pool = pool().await;
        let record = CommentRecord {
            id: Some(1),
            article_id: Some(999),
            user_id: Some(999),
            body: Some("hi".to_string()),
            ..CommentRecord::default()
        };
        let outcome = apply_batch(&pool, &[RecordOp::Comment { index: 0, record }])
            .await
            .unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].error.code, ErrorCode::InvalidReference);
    }

    #[test]
    fn unique_violation_field_extraction() {
        assert_eq!(unique_violation_field("UNIQUE constraint failed: users.email"), "email");
        assert_eq!(
            unique_violation_field("UNIQUE constraint failed: articles.slug"),
            "slug"
        );
        assert_eq!(unique_violation_field("garbage"), "garbage");
    }

    #[test]
    fn username_derivation() {
        assert_eq!(derive_username("Ada.Lovelace@example.com", None), "ada.lovelace");
        assert_eq!(derive_username("@example.com", Some("Grace Hopper")), "grace-hopper");
    }
}
