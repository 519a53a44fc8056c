//! Campaign message repository

use async_trait::async_trait;
use uuid::Uuid;
use whatsend_common::types::{CampaignId, CampaignMessageId};
use whatsend_common::Result;

use crate::db::{db_err, DatabasePool};
use crate::models::{
    CampaignMessage, MessageCounts, MessageSelector, PendingMessage, Recipient, StatusUpdate,
};

/// Campaign message repository trait
#[async_trait]
pub trait CampaignMessageRepository: Send + Sync {
    /// Insert one pending row per recipient, in the given order, keeping the
    /// recipient's display fields on the row.
    /// Recipients already present for the campaign are skipped.
    async fn create_pending_batch(
        &self,
        campaign_id: CampaignId,
        recipients: &[Recipient],
    ) -> Result<u64>;

    /// Pending rows with their seeded recipient fields, in seeded order
    async fn list_pending(&self, campaign_id: CampaignId) -> Result<Vec<PendingMessage>>;

    /// Conditional status write; `None` when no row matched in an accepted state
    async fn update_status(
        &self,
        selector: &MessageSelector,
        update: &StatusUpdate,
    ) -> Result<Option<CampaignMessage>>;

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<CampaignMessage>>;

    /// pending -> cancelled for every row not listed in `exclude`
    async fn cancel_pending(
        &self,
        campaign_id: CampaignId,
        exclude: &[CampaignMessageId],
    ) -> Result<u64>;

    async fn aggregate_counts(&self, campaign_id: CampaignId) -> Result<MessageCounts>;
}

/// Database campaign message repository
#[derive(Clone)]
pub struct DbCampaignMessageRepository {
    pool: DatabasePool,
}

impl DbCampaignMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignMessageRepository for DbCampaignMessageRepository {
    async fn create_pending_batch(
        &self,
        campaign_id: CampaignId,
        recipients: &[Recipient],
    ) -> Result<u64> {
        if recipients.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = recipients.iter().map(|_| Uuid::now_v7()).collect();
        let contact_ids: Vec<Uuid> = recipients.iter().map(|r| r.id).collect();
        let positions: Vec<i32> = (0..recipients.len() as i32).collect();
        let phones: Vec<String> = recipients.iter().map(|r| r.phone.clone()).collect();
        let names: Vec<Option<String>> = recipients.iter().map(|r| r.name.clone()).collect();
        let last_names: Vec<Option<String>> =
            recipients.iter().map(|r| r.last_name.clone()).collect();
        let emails: Vec<Option<String>> = recipients.iter().map(|r| r.email.clone()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO campaign_messages (
                id, campaign_id, contact_id, position, phone,
                recipient_name, recipient_last_name, recipient_email, status
            )
            SELECT u.id, $1, u.contact_id, u.position, u.phone,
                   u.name, u.last_name, u.email, 'pending'
            FROM UNNEST(
                $2::uuid[], $3::uuid[], $4::int4[], $5::text[],
                $6::text[], $7::text[], $8::text[]
            ) AS u(id, contact_id, position, phone, name, last_name, email)
            ON CONFLICT (campaign_id, phone) DO NOTHING
            "#,
        )
        .bind(campaign_id)
        .bind(&ids)
        .bind(&contact_ids)
        .bind(&positions)
        .bind(&phones)
        .bind(&names)
        .bind(&last_names)
        .bind(&emails)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn list_pending(&self, campaign_id: CampaignId) -> Result<Vec<PendingMessage>> {
        let rows = sqlx::query_as::<_, CampaignMessage>(
            r#"
            SELECT * FROM campaign_messages
            WHERE campaign_id = $1 AND status = 'pending'
            ORDER BY position ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(PendingMessage::from).collect())
    }

    async fn update_status(
        &self,
        selector: &MessageSelector,
        update: &StatusUpdate,
    ) -> Result<Option<CampaignMessage>> {
        let target = match selector {
            MessageSelector::Id(_) => "id = $7",
            MessageSelector::ProviderMessageId(_) => "provider_message_id = $7",
        };
        // A read receipt that overtakes its delivered receipt still stamps delivered_at
        let sql = format!(
            r#"
            UPDATE campaign_messages SET
                status = $1,
                provider_message_id = COALESCE($2, provider_message_id),
                error_message = COALESCE($3, error_message),
                attempts = COALESCE($4, attempts),
                sent_at = CASE WHEN $1 = 'sent' THEN $5 ELSE sent_at END,
                delivered_at = CASE
                    WHEN $1 = 'delivered' THEN $5
                    WHEN $1 = 'read' THEN COALESCE(delivered_at, $5)
                    ELSE delivered_at END,
                read_at = CASE WHEN $1 = 'read' THEN $5 ELSE read_at END,
                failed_at = CASE WHEN $1 = 'failed' THEN $5 ELSE failed_at END,
                updated_at = NOW()
            WHERE {} AND status = ANY($6)
            RETURNING *
            "#,
            target
        );

        let query = sqlx::query_as::<_, CampaignMessage>(&sql)
            .bind(update.status.as_str())
            .bind(&update.provider_message_id)
            .bind(&update.error_message)
            .bind(update.attempts)
            .bind(update.at)
            .bind(update.from_names());

        let query = match selector {
            MessageSelector::Id(id) => query.bind(*id),
            MessageSelector::ProviderMessageId(pid) => query.bind(pid.clone()),
        };

        query.fetch_optional(self.pool.pool()).await.map_err(db_err)
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<CampaignMessage>> {
        sqlx::query_as::<_, CampaignMessage>(
            "SELECT * FROM campaign_messages WHERE provider_message_id = $1",
        )
        .bind(provider_message_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn cancel_pending(
        &self,
        campaign_id: CampaignId,
        exclude: &[CampaignMessageId],
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages SET
                status = 'cancelled',
                updated_at = NOW()
            WHERE campaign_id = $1
              AND status = 'pending'
              AND NOT (id = ANY($2))
            "#,
        )
        .bind(campaign_id)
        .bind(exclude.to_vec())
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn aggregate_counts(&self, campaign_id: CampaignId) -> Result<MessageCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM campaign_messages
            WHERE campaign_id = $1
            GROUP BY status
            "#,
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        let mut counts = MessageCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "sent" => counts.sent = count,
                "delivered" => counts.delivered = count,
                "read" => counts.read = count,
                "failed" => counts.failed = count,
                "cancelled" => counts.cancelled = count,
                _ => {}
            }
        }
        Ok(counts)
    }
}
