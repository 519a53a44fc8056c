//! Campaign repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use whatsend_common::types::CampaignId;
use whatsend_common::Result;

use crate::db::{db_err, DatabasePool};
use crate::models::{Campaign, CampaignStatus};

/// Campaign repository trait.
///
/// Status transitions are conditional: each method names the states it may
/// leave, and returns `None` when the row was not in one of them.
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Enter `sending` and stamp `started_at` (from draft, scheduled or failed)
    async fn begin_sending(&self, id: CampaignId) -> Result<Option<Campaign>>;

    async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()>;

    /// Recompute aggregate counts from the message table
    async fn refresh_counts(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// `sending` -> `sent`, with counts refreshed and `completed_at` stamped
    async fn complete(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Any non-terminal state -> `failed`, recording the reason
    async fn fail(&self, id: CampaignId, reason: &str) -> Result<Option<Campaign>>;

    /// `sending` -> `stopped`
    async fn stop(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Scheduled campaigns whose start time has passed
    async fn list_due_scheduled(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Campaign>>;

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;
}

/// Counts recomputed in the same statement that writes them
const REFRESH_COUNTS: &str = r#"
    sent_count = (SELECT COUNT(*) FROM campaign_messages m
                  WHERE m.campaign_id = campaigns.id AND m.status IN ('sent', 'delivered', 'read')),
    delivered_count = (SELECT COUNT(*) FROM campaign_messages m
                       WHERE m.campaign_id = campaigns.id AND m.status IN ('delivered', 'read')),
    read_count = (SELECT COUNT(*) FROM campaign_messages m
                  WHERE m.campaign_id = campaigns.id AND m.status = 'read'),
    failed_count = (SELECT COUNT(*) FROM campaign_messages m
                    WHERE m.campaign_id = campaigns.id AND m.status = 'failed'),
    cancelled_count = (SELECT COUNT(*) FROM campaign_messages m
                       WHERE m.campaign_id = campaigns.id AND m.status = 'cancelled')
"#;

/// Database campaign repository
#[derive(Clone)]
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn begin_sending(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = 'sending',
                started_at = NOW(),
                completed_at = NULL,
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('draft', 'scheduled', 'failed')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                total_recipients = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn refresh_counts(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let sql = format!(
            "UPDATE campaigns SET {}, updated_at = NOW() WHERE id = $1 RETURNING *",
            REFRESH_COUNTS
        );
        sqlx::query_as::<_, Campaign>(&sql)
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn complete(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let sql = format!(
            r#"
            UPDATE campaigns SET
                status = 'sent',
                completed_at = NOW(),
                updated_at = NOW(),
                {}
            WHERE id = $1 AND status = 'sending'
            RETURNING *
            "#,
            REFRESH_COUNTS
        );
        sqlx::query_as::<_, Campaign>(&sql)
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn fail(&self, id: CampaignId, reason: &str) -> Result<Option<Campaign>> {
        let sql = format!(
            r#"
            UPDATE campaigns SET
                status = 'failed',
                last_error = $2,
                completed_at = NOW(),
                updated_at = NOW(),
                {}
            WHERE id = $1 AND status NOT IN ('sent', 'stopped')
            RETURNING *
            "#,
            REFRESH_COUNTS
        );
        sqlx::query_as::<_, Campaign>(&sql)
            .bind(id)
            .bind(reason)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn stop(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = 'stopped',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_due_scheduled(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'scheduled'
              AND scheduled_at IS NOT NULL
              AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
