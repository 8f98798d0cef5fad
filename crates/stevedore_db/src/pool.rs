//! Database pool creation.
//!
//! Concrete `SqlitePool` rather than `sqlx::AnyPool`, which allows full
//! support for `#[derive(FromRow)]` with custom types like enums and
//! DateTime. Any ordered, indexed store with unique constraints would do;
//! SQLite is the shipped backend.

use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use stevedore_protocol::TransferResult;

/// Database pool type alias.
pub type DbPool = sqlx::SqlitePool;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
}

impl DbConfig {
    /// File-backed SQLite configuration.
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            max_connections: 5,
        }
    }

    /// In-memory SQLite configuration (for testing). A single connection,
    /// since each in-memory connection is its own database.
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Create a database pool and apply connection pragmas.
pub async fn create_pool(config: DbConfig) -> TransferResult<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // FK violations must surface for upsert classification.
                sqlx::query("PRAGMA foreign_keys=ON").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await?;

    // WAL mode for better concurrent access, NORMAL sync for throughput.
    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=NORMAL").execute(&pool).await?;

    info!(url = %config.url, "connected to store");
    Ok(pool)
}
