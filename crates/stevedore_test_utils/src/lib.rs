//! Test fixtures shared across the workspace.
//!
//! In-memory pools with the full schema, seeded entity rows, and temp
//! storage roots wired into a worker context.

use stevedore_db::pool::{create_pool, DbConfig};
use stevedore_db::{schema, DbPool};
use stevedore_storage::LocalStorage;
use stevedore_worker::{WorkerContext, WorkerSettings};

/// In-memory pool with the schema bootstrapped.
pub async fn memory_pool() -> DbPool {
    let pool = create_pool(DbConfig::sqlite_memory())
        .await
        .expect("in-memory pool");
    schema::bootstrap(&pool).await.expect("schema bootstrap");
    pool
}

/// Seed `n` users with ids `1..=n` and predictable emails.
pub async fn seed_users(pool: &DbPool, n: i64) {
    for i in 1..=n {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, name, username, password_hash, role, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'seed', 'user', 1, ?, ?)
            "#,
        )
        .bind(i)
        .bind(format!("user{i}@example.com"))
        .bind(format!("User {i}"))
        .bind(format!("user{i}"))
        .bind(ts(i))
        .bind(ts(i))
        .execute(pool)
        .await
        .expect("seed user");
    }
}

/// Seed one published article per author id given.
pub async fn seed_articles(pool: &DbPool, author_ids: &[i64]) {
    for (n, author_id) in author_ids.iter().enumerate() {
        let id = (n + 1) as i64;
        sqlx::query(
            r#"
            INSERT INTO articles (id, slug, title, description, body, author_id, status, published_at, created_at, updated_at)
            VALUES (?, ?, ?, 'd', 'body', ?, 'published', ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(format!("article-{id}"))
        .bind(format!("Article {id}"))
        .bind(author_id)
        .bind(ts(id))
        .bind(ts(id))
        .bind(ts(id))
        .execute(pool)
        .await
        .expect("seed article");
    }
}

fn ts(day: i64) -> String {
    format!("2024-01-{:02}T00:00:00.000Z", day.clamp(1, 28))
}

/// Worker context over a fresh pool and a temp storage root.
///
/// Keep the returned `TempDir` alive for the duration of the test.
pub async fn worker_context(settings: WorkerSettings) -> (tempfile::TempDir, WorkerContext) {
    let pool = memory_pool().await;
    let dir = tempfile::tempdir().expect("temp storage root");
    let context = WorkerContext::new(pool, LocalStorage::new(dir.path()), settings);
    (dir, context)
}
