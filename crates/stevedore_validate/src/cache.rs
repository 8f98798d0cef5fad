//! Per-job reference and uniqueness cache.
//!
//! Confined to one job run, never shared. Existence and owner lookups are
//! memoized (positive and negative results alike) so repeated references
//! cost one store round trip each. Email/slug claims provide first-claimant
//! deduplication across the records of the run.

use std::collections::HashMap;

use stevedore_db::EntityReader;
use stevedore_protocol::TransferResult;

pub struct ReferenceCache {
    reader: EntityReader,
    user_ids: HashMap<i64, bool>,
    article_ids: HashMap<i64, bool>,
    email_owners: HashMap<String, Option<i64>>,
    slug_owners: HashMap<String, Option<i64>>,
    claimed_emails: HashMap<String, usize>,
    claimed_slugs: HashMap<String, usize>,
}

impl ReferenceCache {
    pub fn new(reader: EntityReader) -> Self {
        Self {
            reader,
            user_ids: HashMap::new(),
            article_ids: HashMap::new(),
            email_owners: HashMap::new(),
            slug_owners: HashMap::new(),
            claimed_emails: HashMap::new(),
            claimed_slugs: HashMap::new(),
        }
    }

    pub async fn user_exists(&mut self, id: i64) -> TransferResult<bool> {
        if let Some(&known) = self.user_ids.get(&id) {
            return Ok(known);
        }
        let exists = self.reader.user_exists(id).await?;
        self.user_ids.insert(id, exists);
        Ok(exists)
    }

    pub async fn article_exists(&mut self, id: i64) -> TransferResult<bool> {
        if let Some(&known) = self.article_ids.get(&id) {
            return Ok(known);
        }
        let exists = self.reader.article_exists(id).await?;
        self.article_ids.insert(id, exists);
        Ok(exists)
    }

    /// Owning user id for a (lower-cased) email, memoized.
    pub async fn email_owner(&mut self, email: &str) -> TransferResult<Option<i64>> {
        if let Some(known) = self.email_owners.get(email) {
            return Ok(*known);
        }
        let owner = self.reader.user_id_by_email(email).await?;
        self.email_owners.insert(email.to_string(), owner);
        Ok(owner)
    }

    /// Owning article id for a slug, memoized.
    pub async fn slug_owner(&mut self, slug: &str) -> TransferResult<Option<i64>> {
        if let Some(known) = self.slug_owners.get(slug) {
            return Ok(*known);
        }
        let owner = self.reader.article_id_by_slug(slug).await?;
        self.slug_owners.insert(slug.to_string(), owner);
        Ok(owner)
    }

    /// Claim an email for a record. Returns the prior claimant's index if
    /// the email was already taken within this run.
    pub fn claim_email(&mut self, email: &str, index: usize) -> Option<usize> {
        match self.claimed_emails.get(email) {
            Some(&prior) => Some(prior),
            None => {
                self.claimed_emails.insert(email.to_string(), index);
                None
            }
        }
    }

    /// Claim a slug for a record; mirrors [`Self::claim_email`].
    pub fn claim_slug(&mut self, slug: &str, index: usize) -> Option<usize> {
        match self.claimed_slugs.get(slug) {
            Some(&prior) => Some(prior),
            None => {
                self.claimed_slugs.insert(slug.to_string(), index);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_db::pool::{create_pool, DbConfig};
    use stevedore_db::schema::bootstrap;

    async fn cache() -> ReferenceCache {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        bootstrap(&pool).await.unwrap();
        sqlx::query(
            r#"
            INSERT INTO users (id, email, name, username, password_hash, role, active, created_at, updated_at)
            VALUES (7, 'a@example.com', 'A', 'a', 'x', 'user', 1, '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        ReferenceCache::new(EntityReader::new(pool))
    }

    #[tokio::test]
    async fn lookups_memoize_both_polarities() {
        let mut cache = cache().await;
        assert!(cache.user_exists(7).await.unwrap());
        assert!(!cache.user_exists(8).await.unwrap());
        // Served from the memo on repeat.
        assert!(cache.user_exists(7).await.unwrap());
        assert!(!cache.user_exists(8).await.unwrap());
        assert_eq!(cache.email_owner("a@example.com").await.unwrap(), Some(7));
        assert_eq!(cache.email_owner("b@example.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let mut cache = cache().await;
        assert_eq!(cache.claim_email("x@example.com", 0), None);
        assert_eq!(cache.claim_email("x@example.com", 5), Some(0));
        assert_eq!(cache.claim_slug("hello", 1), None);
        assert_eq!(cache.claim_slug("hello", 2), Some(1));
    }
}
