//! Contact repository and recipient resolution

use async_trait::async_trait;
use whatsend_common::Result;

use crate::db::{db_err, DatabasePool};
use crate::models::{Recipient, RecipientFilter};

/// Resolves a campaign's recipient filter into target contacts
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Ordered target contacts for the given filter
    async fn resolve(&self, filter: &serde_json::Value) -> Result<Vec<Recipient>>;
}

/// Database contact repository
#[derive(Clone)]
pub struct DbContactRepository {
    pool: DatabasePool,
}

impl DbContactRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientResolver for DbContactRepository {
    async fn resolve(&self, filter: &serde_json::Value) -> Result<Vec<Recipient>> {
        let filter = RecipientFilter::from_value(filter)?;

        sqlx::query_as::<_, Recipient>(
            r#"
            SELECT id, phone, name, last_name, email
            FROM contacts
            WHERE opted_out = FALSE
              AND ($1::uuid[] IS NULL OR id = ANY($1))
              AND ($2::text[] IS NULL OR tags && $2)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(filter.contact_ids)
        .bind(filter.tags)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
