//! Normalized record forms.
//!
//! Produced by the record validator after coercion and canonicalization,
//! consumed by the upsert engine. `None` fields were absent from the source
//! record and must not overwrite stored values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Option<i64>,
    /// Lower-cased.
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
    pub active: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub id: Option<i64>,
    /// Lower-cased kebab-case.
    pub slug: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub author_id: Option<i64>,
    /// `Some` means the incoming record supplied a tags array and the stored
    /// tag set is replaced; `None` leaves tags untouched.
    pub tags: Option<Vec<String>>,
    pub status: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: Option<i64>,
    pub article_id: Option<i64>,
    pub user_id: Option<i64>,
    pub body: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Tagged union over the three entity families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "lowercase")]
pub enum NormalizedRecord {
    User(UserRecord),
    Article(ArticleRecord),
    Comment(CommentRecord),
}

impl NormalizedRecord {
    /// Business key extracted for error journaling, when one exists.
    pub fn record_id(&self) -> Option<String> {
        match self {
            NormalizedRecord::User(u) => u
                .id
                .map(|id| id.to_string())
                .or_else(|| u.email.clone()),
            NormalizedRecord::Article(a) => a
                .id
                .map(|id| id.to_string())
                .or_else(|| a.slug.clone()),
            NormalizedRecord::Comment(c) => c.id.map(|id| id.to_string()),
        }
    }
}
