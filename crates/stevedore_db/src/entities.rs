//! Entity reads: cursor-paged export pages and reference lookups.
//!
//! Export pages are strictly ordered by ascending id with an exclusive
//! `id > cursor` bound. Filter keys arrive canonicalized and whitelisted by
//! the filter validator, so they map 1:1 onto column names.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::{Row, sqlite::SqliteRow};
use std::collections::HashMap;

use crate::{fmt_ts, DbPool};
use stevedore_protocol::{FilterValue, Filters, ResourceKind, TransferResult};

/// One exportable record: primary id plus the canonical JSON shape.
#[derive(Debug, Clone)]
pub struct ExportRow {
    pub id: i64,
    pub value: Value,
}

enum Bind {
    I(i64),
    S(String),
}

fn push_filter_predicates(filters: &Filters, sql: &mut String, binds: &mut Vec<Bind>) {
    for (key, value) in filters {
        match value {
            FilterValue::Int(v) => {
                sql.push_str(&format!(" AND {key} = ?"));
                binds.push(Bind::I(*v));
            }
            FilterValue::Bool(v) => {
                sql.push_str(&format!(" AND {key} = ?"));
                binds.push(Bind::I(i64::from(*v)));
            }
            FilterValue::Str(v) => {
                sql.push_str(&format!(" AND {key} = ?"));
                binds.push(Bind::S(v.clone()));
            }
            FilterValue::Date(v) => {
                sql.push_str(&format!(" AND {key} = ?"));
                binds.push(Bind::S(fmt_ts(*v)));
            }
            FilterValue::Range(range) => {
                for (op, bound) in [
                    (">", range.gt),
                    (">=", range.gte),
                    ("<", range.lt),
                    ("<=", range.lte),
                ] {
                    if let Some(ts) = bound {
                        sql.push_str(&format!(" AND {key} {op} ?"));
                        binds.push(Bind::S(fmt_ts(ts)));
                    }
                }
            }
        }
    }
}

fn opt_ts(row: &SqliteRow, column: &str) -> Value {
    match row.try_get::<Option<DateTime<Utc>>, _>(column) {
        Ok(Some(ts)) => json!(fmt_ts(ts)),
        _ => Value::Null,
    }
}

pub struct EntityReader {
    pool: DbPool,
}

impl EntityReader {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Fetch the next export page in strict ascending id order.
    pub async fn fetch_page(
        &self,
        resource: ResourceKind,
        cursor: Option<i64>,
        filters: Option<&Filters>,
        limit: i64,
    ) -> TransferResult<Vec<ExportRow>> {
        let columns = match resource {
            ResourceKind::Users => {
                "id, email, name, role, active, created_at, updated_at"
            }
            ResourceKind::Articles => {
                "id, slug, title, body, author_id, status, published_at"
            }
            ResourceKind::Comments => "id, article_id, user_id, body, created_at",
        };
        let mut sql = format!(
            "SELECT {columns} FROM {} WHERE 1 = 1",
            resource.as_str()
        );
        let mut binds = Vec::new();
        if let Some(cursor) = cursor {
            sql.push_str(" AND id > ?");
            binds.push(Bind::I(cursor));
        }
        if let Some(filters) = filters {
            push_filter_predicates(filters, &mut sql, &mut binds);
        }
        sql.push_str(" ORDER BY id ASC LIMIT ?");
        binds.push(Bind::I(limit));

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = match bind {
                Bind::I(v) => query.bind(v),
                Bind::S(v) => query.bind(v),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;

        match resource {
            ResourceKind::Users => rows.iter().map(|row| Self::user_row(row)).collect(),
            ResourceKind::Comments => rows.iter().map(|row| Self::comment_row(row)).collect(),
            ResourceKind::Articles => {
                let mut out = Vec::with_capacity(rows.len());
                let ids: Vec<i64> = rows
                    .iter()
                    .map(|row| row.try_get::<i64, _>("id"))
                    .collect::<Result<_, _>>()?;
                let tag_map = self.tags_for_articles(&ids).await?;
                for row in &rows {
                    out.push(Self::article_row(row, &tag_map)?);
                }
                Ok(out)
            }
        }
    }

    fn user_row(row: &SqliteRow) -> TransferResult<ExportRow> {
        let id: i64 = row.try_get("id")?;
        let mut value = Map::new();
        value.insert("id".into(), json!(id));
        value.insert("email".into(), json!(row.try_get::<String, _>("email")?));
        value.insert("name".into(), json!(row.try_get::<Option<String>, _>("name")?));
        value.insert("role".into(), json!(row.try_get::<String, _>("role")?));
        value.insert("active".into(), json!(row.try_get::<i64, _>("active")? != 0));
        value.insert("created_at".into(), opt_ts(row, "created_at"));
        value.insert("updated_at".into(), opt_ts(row, "updated_at"));
        Ok(ExportRow {
            id,
            value: Value::Object(value),
        })
    }

    fn article_row(
        row: &SqliteRow,
        tag_map: &HashMap<i64, Vec<String>>,
    ) -> TransferResult<ExportRow> {
        let id: i64 = row.try_get("id")?;
        let mut value = Map::new();
        value.insert("id".into(), json!(id));
        value.insert("slug".into(), json!(row.try_get::<String, _>("slug")?));
        value.insert("title".into(), json!(row.try_get::<String, _>("title")?));
        value.insert("body".into(), json!(row.try_get::<Option<String>, _>("body")?));
        value.insert("author_id".into(), json!(row.try_get::<i64, _>("author_id")?));
        value.insert(
            "tags".into(),
            json!(tag_map.get(&id).cloned().unwrap_or_default()),
        );
        value.insert("published_at".into(), opt_ts(row, "published_at"));
        value.insert("status".into(), json!(row.try_get::<String, _>("status")?));
        Ok(ExportRow {
            id,
            value: Value::Object(value),
        })
    }

    fn comment_row(row: &SqliteRow) -> TransferResult<ExportRow> {
        let id: i64 = row.try_get("id")?;
        let mut value = Map::new();
        value.insert("id".into(), json!(id));
        value.insert("article_id".into(), json!(row.try_get::<i64, _>("article_id")?));
        value.insert("user_id".into(), json!(row.try_get::<i64, _>("user_id")?));
        value.insert("body".into(), json!(row.try_get::<String, _>("body")?));
        value.insert("created_at".into(), opt_ts(row, "created_at"));
        Ok(ExportRow {
            id,
            value: Value::Object(value),
        })
    }

    /// Tag names per article for one export page, sorted for determinism.
    async fn tags_for_articles(
        &self,
        article_ids: &[i64],
    ) -> TransferResult<HashMap<i64, Vec<String>>> {
        let mut map: HashMap<i64, Vec<String>> = HashMap::new();
        if article_ids.is_empty() {
            return Ok(map);
        }
        let placeholders = vec!["?"; article_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT at.article_id AS article_id, t.name AS name
            FROM article_tags at
            JOIN tags t ON t.id = at.tag_id
            WHERE at.article_id IN ({placeholders})
            ORDER BY at.article_id, t.name
            "#
        );
        let mut query = sqlx::query(&sql);
        for id in article_ids {
            query = query.bind(id);
        }
        for row in query.fetch_all(&self.pool).await? {
            let article_id: i64 = row.try_get("article_id")?;
            let name: String = row.try_get("name")?;
            map.entry(article_id).or_default().push(name);
        }
        Ok(map)
    }

    // ------------------------------------------------------------------
    // Reference lookups (memoized upstream by the per-job cache)
    // ------------------------------------------------------------------

    pub async fn user_exists(&self, id: i64) -> TransferResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn article_exists(&self, id: i64) -> TransferResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM articles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Case-insensitive owner lookup for an email.
    pub async fn user_id_by_email(&self, email: &str) -> TransferResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM users WHERE email = ? COLLATE NOCASE")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn article_id_by_slug(&self, slug: &str) -> TransferResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM articles WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};
    use crate::schema::bootstrap;
    use stevedore_protocol::DateRange;

    async fn pool() -> DbPool {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        pool
    }

    async fn seed_users(pool: &DbPool, n: i64) {
        for i in 1..=n {
            sqlx::query(
                r#"
                INSERT INTO users (id, email, name, username, password_hash, role, active, created_at, updated_at)
                VALUES (?, ?, ?, ?, 'x', 'user', 1, ?, ?)
                "#,
            )
            .bind(i)
            .bind(format!("user{i}@example.com"))
            .bind(format!("User {i}"))
            .bind(format!("user{i}"))
            .bind(format!("2024-01-0{i}T00:00:00.000Z"))
            .bind(format!("2024-01-0{i}T00:00:00.000Z"))
            .execute(pool)
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn pages_are_ascending_and_cursor_exclusive() {
        let pool = pool().await;
        seed_users(&pool, 5).await;
        let reader = EntityReader::new(pool);

        let page = reader
            .fetch_page(ResourceKind::Users, Some(2), None, 2)
            .await
            .unwrap();
        let ids: Vec<i64> = page.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(page[0].value["email"], "user3@example.com");
        assert_eq!(page[0].value["active"], true);
    }

    #[tokio::test]
    async fn date_range_filters_apply() {
        let pool = pool().await;
        seed_users(&pool, 5).await;
        let reader = EntityReader::new(pool);

        let mut filters = Filters::new();
        filters.insert(
            "created_at".to_string(),
            FilterValue::Range(DateRange {
                gte: Some("2024-01-03T00:00:00Z".parse().unwrap()),
                lt: Some("2024-01-05T00:00:00Z".parse().unwrap()),
                ..DateRange::default()
            }),
        );
        let page = reader
            .fetch_page(ResourceKind::Users, None, Some(&filters), 10)
            .await
            .unwrap();
        let ids: Vec<i64> = page.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn article_pages_carry_sorted_tags() {
        let pool = pool().await;
        seed_users(&pool, 1).await;
        sqlx::query(
            r#"
            INSERT INTO articles (id, slug, title, body, author_id, status, created_at, updated_at)
            VALUES (1, 'hello-world', 'Hello', 'Body', 1, 'published', '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO tags (id, name) VALUES (1, 'rust'), (2, 'async')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO article_tags (article_id, tag_id) VALUES (1, 1), (1, 2)")
            .execute(&pool)
            .await
            .unwrap();

        let reader = EntityReader::new(pool);
        let page = reader
            .fetch_page(ResourceKind::Articles, None, None, 10)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].value["tags"], json!(["async", "rust"]));
    }

    #[tokio::test]
    async fn email_lookup_is_case_insensitive() {
        let pool = pool().await;
        seed_users(&pool, 1).await;
        let reader = EntityReader::new(pool);
        assert_eq!(
            reader.user_id_by_email("USER1@EXAMPLE.COM").await.unwrap(),
            Some(1)
        );
        assert_eq!(reader.user_id_by_email("nobody@example.com").await.unwrap(), None);
    }
}
