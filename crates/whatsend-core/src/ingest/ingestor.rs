//! Status Ingestor - Applies delivery receipts to message state

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use whatsend_common::types::CampaignId;
use whatsend_storage::models::{MessageSelector, MessageStatus, StatusUpdate};
use whatsend_storage::repository::{CampaignMessageRepository, CampaignRepository};

use super::webhook::{verify_signature, WebhookPayload};

/// Errors rejecting a whole webhook delivery
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("missing webhook signature")]
    MissingSignature,

    #[error("webhook signature does not match")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] whatsend_common::Error),
}

/// What happened to one receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// The message moved forward
    Applied {
        campaign_id: CampaignId,
        status: MessageStatus,
    },
    /// The message is already at or past this status
    Ignored { current: String },
    /// No message carries this provider id (yet)
    Unmatched,
    /// A status this system does not track
    Unsupported { status: String },
}

/// Applies provider delivery receipts.
///
/// Receipts may arrive in any order and interleave with the dispatcher's own
/// writes; every write only moves a message forward.
pub struct StatusIngestor {
    campaigns: Arc<dyn CampaignRepository>,
    messages: Arc<dyn CampaignMessageRepository>,
    app_secret: Option<String>,
}

impl StatusIngestor {
    /// Create a new ingestor. Without an app secret signatures are not checked.
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        messages: Arc<dyn CampaignMessageRepository>,
        app_secret: Option<String>,
    ) -> Self {
        Self {
            campaigns,
            messages,
            app_secret: app_secret.filter(|s| !s.is_empty()),
        }
    }

    /// Verify and apply one raw webhook body
    pub async fn handle_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Vec<ReceiptOutcome>, IngestError> {
        if let Some(secret) = &self.app_secret {
            let signature = signature.ok_or(IngestError::MissingSignature)?;
            if !verify_signature(secret, body, signature) {
                warn!("Rejected webhook with a bad signature");
                return Err(IngestError::InvalidSignature);
            }
        }

        let payload: WebhookPayload = serde_json::from_slice(body)?;
        self.ingest(&payload).await
    }

    /// Apply every status notification in a parsed payload
    pub async fn ingest(&self, payload: &WebhookPayload) -> Result<Vec<ReceiptOutcome>, IngestError> {
        let mut outcomes = Vec::new();
        for notification in payload.statuses() {
            let outcome = match notification.message_status() {
                Some(status) => {
                    self.apply_receipt(
                        &notification.id,
                        status,
                        notification.occurred_at().unwrap_or_else(Utc::now),
                        notification.error_summary(),
                    )
                    .await?
                }
                None => ReceiptOutcome::Unsupported {
                    status: notification.status.clone(),
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Move the message with `provider_message_id` to `status` if that is a
    /// forward transition, then refresh its campaign's counts
    pub async fn apply_receipt(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<ReceiptOutcome, IngestError> {
        let selector = MessageSelector::ProviderMessageId(provider_message_id.to_string());
        let update = StatusUpdate::receipt(status, at, error);

        if let Some(message) = self.messages.update_status(&selector, &update).await? {
            self.campaigns.refresh_counts(message.campaign_id).await?;
            debug!(
                provider_message_id,
                campaign_id = %message.campaign_id,
                status = %status,
                "Receipt applied"
            );
            return Ok(ReceiptOutcome::Applied {
                campaign_id: message.campaign_id,
                status,
            });
        }

        match self
            .messages
            .find_by_provider_message_id(provider_message_id)
            .await?
        {
            Some(message) => {
                debug!(
                    provider_message_id,
                    current = %message.status,
                    receipt = %status,
                    "Receipt ignored"
                );
                Ok(ReceiptOutcome::Ignored {
                    current: message.status,
                })
            }
            None => {
                info!(provider_message_id, "Receipt for unknown message");
                Ok(ReceiptOutcome::Unmatched)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::webhook::sign;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;
    use whatsend_storage::models::{CreateCampaign, Recipient};
    use whatsend_storage::MemoryStore;

    async fn sent_message(store: &MemoryStore) -> (CampaignId, String) {
        let campaign = store
            .create_campaign(CreateCampaign {
                name: "receipts".to_string(),
                message_body: Some("hi".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let recipient = Recipient {
            id: Uuid::new_v4(),
            phone: "5511999990000".to_string(),
            name: None,
            last_name: None,
            email: None,
        };
        store
            .create_pending_batch(campaign.id, &[recipient])
            .await
            .unwrap();
        store.set_total_recipients(campaign.id, 1).await.unwrap();
        let id = store.messages(campaign.id).await[0].id;
        store
            .update_status(&MessageSelector::Id(id), &StatusUpdate::sent("wamid.1", 1))
            .await
            .unwrap();
        (campaign.id, "wamid.1".to_string())
    }

    fn ingestor(store: &MemoryStore, secret: Option<&str>) -> StatusIngestor {
        StatusIngestor::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            secret.map(str::to_string),
        )
    }

    fn webhook(statuses: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "2002", "changes": [{"field": "messages", "value": {"statuses": statuses}}]}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_receipts_advance_and_refresh_counts() {
        let store = MemoryStore::new();
        let (campaign_id, pid) = sent_message(&store).await;
        let ingestor = ingestor(&store, None);

        let body = webhook(serde_json::json!([
            {"id": pid, "status": "delivered", "timestamp": "1717243200"},
            {"id": pid, "status": "read", "timestamp": "1717243260"},
            {"id": pid, "status": "delivered", "timestamp": "1717243200"},
            {"id": "wamid.unknown", "status": "read"},
            {"id": pid, "status": "deleted"}
        ]));
        let outcomes = ingestor.handle_webhook(&body, None).await.unwrap();

        assert_eq!(
            outcomes,
            vec![
                ReceiptOutcome::Applied {
                    campaign_id,
                    status: MessageStatus::Delivered
                },
                ReceiptOutcome::Applied {
                    campaign_id,
                    status: MessageStatus::Read
                },
                ReceiptOutcome::Ignored {
                    current: "read".to_string()
                },
                ReceiptOutcome::Unmatched,
                ReceiptOutcome::Unsupported {
                    status: "deleted".to_string()
                },
            ]
        );

        let campaign = store.campaign(campaign_id).await.unwrap();
        assert_eq!(campaign.sent_count, 1);
        assert_eq!(campaign.delivered_count, 1);
        assert_eq!(campaign.read_count, 1);

        let row = &store.messages(campaign_id).await[0];
        assert_eq!(row.delivered_at.map(|t| t.timestamp()), Some(1_717_243_200));
        assert_eq!(row.read_at.map(|t| t.timestamp()), Some(1_717_243_260));
    }

    #[tokio::test]
    async fn test_failed_receipt_after_sent() {
        let store = MemoryStore::new();
        let (campaign_id, pid) = sent_message(&store).await;

        let outcome = ingestor(&store, None)
            .apply_receipt(
                &pid,
                MessageStatus::Failed,
                Utc::now(),
                Some("131049: Message not delivered".to_string()),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ReceiptOutcome::Applied { .. }));
        let row = &store.messages(campaign_id).await[0];
        assert_eq!(row.status, "failed");
        assert_eq!(
            row.error_message.as_deref(),
            Some("131049: Message not delivered")
        );
        assert_eq!(store.campaign(campaign_id).await.unwrap().failed_count, 1);
    }

    #[tokio::test]
    async fn test_signature_is_enforced_when_configured() {
        let store = MemoryStore::new();
        let (_, pid) = sent_message(&store).await;
        let ingestor = ingestor(&store, Some("app-secret"));
        let body = webhook(serde_json::json!([{"id": pid, "status": "delivered"}]));

        assert!(matches!(
            ingestor.handle_webhook(&body, None).await,
            Err(IngestError::MissingSignature)
        ));
        assert!(matches!(
            ingestor.handle_webhook(&body, Some("sha256=00")).await,
            Err(IngestError::InvalidSignature)
        ));

        let signature = sign("app-secret", &body).unwrap();
        let outcomes = ingestor
            .handle_webhook(&body, Some(&signature))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
    }
}
