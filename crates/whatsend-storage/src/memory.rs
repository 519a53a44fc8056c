//! In-memory store
//!
//! Implements every repository trait over a single lock so the dispatcher can
//! run without a database. Status writes follow the same conditional rules as
//! the PostgreSQL repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use whatsend_common::types::{CampaignId, CampaignMessageId};
use whatsend_common::{Error, Result};

use crate::models::{
    Campaign, CampaignMessage, CampaignStatus, CreateCampaign, MessageCounts, MessageSelector,
    MessageStatus, PendingMessage, Recipient, RecipientFilter, StatusUpdate,
};
use crate::repository::{CampaignMessageRepository, CampaignRepository, RecipientResolver};

struct StoredContact {
    recipient: Recipient,
    tags: Vec<String>,
    opted_out: bool,
}

#[derive(Default)]
struct State {
    campaigns: HashMap<CampaignId, Campaign>,
    messages: Vec<CampaignMessage>,
    contacts: Vec<StoredContact>,
}

impl State {
    fn counts(&self, campaign_id: CampaignId) -> MessageCounts {
        MessageCounts::tally(self.messages.iter().filter(|m| m.campaign_id == campaign_id))
    }

    /// Apply a status change to a campaign currently in one of `from`
    fn transition(
        &mut self,
        id: CampaignId,
        from: &[CampaignStatus],
        apply: impl FnOnce(&mut Campaign),
    ) -> Option<Campaign> {
        let counts = self.counts(id);
        let campaign = self.campaigns.get_mut(&id)?;
        let current = campaign.status_enum()?;
        if !from.contains(&current) {
            return None;
        }
        apply(campaign);
        campaign.apply_counts(&counts);
        campaign.updated_at = Utc::now();
        Some(campaign.clone())
    }
}

/// Shared in-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a campaign in `draft` (or `scheduled` when a start time is given)
    pub async fn create_campaign(&self, input: CreateCampaign) -> Result<Campaign> {
        let variable_mapping = match input.variable_mapping {
            Some(mapping) => serde_json::to_value(mapping)
                .map_err(|e| Error::Validation(format!("Invalid variable mapping: {}", e)))?,
            None => serde_json::json!({}),
        };
        let status = if input.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        let now = Utc::now();

        let campaign = Campaign {
            id: Uuid::now_v7(),
            name: input.name,
            template_name: input.template_name,
            template_language: input.template_language,
            message_body: input.message_body,
            recipient_filter: input.recipient_filter.unwrap_or_else(|| serde_json::json!({})),
            variable_mapping,
            scheduled_at: input.scheduled_at,
            status: status.to_string(),
            total_recipients: 0,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            failed_count: 0,
            cancelled_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        self.state
            .write()
            .await
            .campaigns
            .insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    pub async fn add_contact(&self, recipient: Recipient, tags: &[&str]) {
        self.state.write().await.contacts.push(StoredContact {
            recipient,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            opted_out: false,
        });
    }

    pub async fn opt_out(&self, phone: &str) {
        let mut state = self.state.write().await;
        for contact in state.contacts.iter_mut() {
            if contact.recipient.phone == phone {
                contact.opted_out = true;
            }
        }
    }

    /// Force a campaign's status, bypassing transition rules
    pub async fn set_campaign_status(&self, id: CampaignId, status: CampaignStatus) {
        if let Some(campaign) = self.state.write().await.campaigns.get_mut(&id) {
            campaign.status = status.to_string();
        }
    }

    pub async fn campaign(&self, id: CampaignId) -> Option<Campaign> {
        self.state.read().await.campaigns.get(&id).cloned()
    }

    /// Messages of a campaign in seeded order
    pub async fn messages(&self, campaign_id: CampaignId) -> Vec<CampaignMessage> {
        let state = self.state.read().await;
        let mut messages: Vec<_> = state
            .messages
            .iter()
            .filter(|m| m.campaign_id == campaign_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.position);
        messages
    }
}

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.campaign(id).await)
    }

    async fn begin_sending(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let mut state = self.state.write().await;
        Ok(state.transition(
            id,
            &[
                CampaignStatus::Draft,
                CampaignStatus::Scheduled,
                CampaignStatus::Failed,
            ],
            |c| {
                c.status = CampaignStatus::Sending.to_string();
                c.started_at = Some(Utc::now());
                c.completed_at = None;
                c.last_error = None;
            },
        ))
    }

    async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()> {
        if let Some(campaign) = self.state.write().await.campaigns.get_mut(&id) {
            campaign.total_recipients = total;
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn refresh_counts(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let mut state = self.state.write().await;
        let counts = state.counts(id);
        Ok(state.campaigns.get_mut(&id).map(|campaign| {
            campaign.apply_counts(&counts);
            campaign.updated_at = Utc::now();
            campaign.clone()
        }))
    }

    async fn complete(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let mut state = self.state.write().await;
        Ok(state.transition(id, &[CampaignStatus::Sending], |c| {
            c.status = CampaignStatus::Sent.to_string();
            c.completed_at = Some(Utc::now());
        }))
    }

    async fn fail(&self, id: CampaignId, reason: &str) -> Result<Option<Campaign>> {
        let mut state = self.state.write().await;
        Ok(state.transition(
            id,
            &[
                CampaignStatus::Draft,
                CampaignStatus::Scheduled,
                CampaignStatus::Sending,
                CampaignStatus::Failed,
            ],
            |c| {
                c.status = CampaignStatus::Failed.to_string();
                c.last_error = Some(reason.to_string());
                c.completed_at = Some(Utc::now());
            },
        ))
    }

    async fn stop(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let mut state = self.state.write().await;
        Ok(state.transition(id, &[CampaignStatus::Sending], |c| {
            c.status = CampaignStatus::Stopped.to_string();
            c.completed_at = Some(Utc::now());
        }))
    }

    async fn list_due_scheduled(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Campaign>> {
        let state = self.state.read().await;
        let mut due: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.status_enum() == Some(CampaignStatus::Scheduled))
            .filter(|c| c.scheduled_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        let state = self.state.read().await;
        let mut campaigns: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.status_enum() == Some(status))
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }
}

#[async_trait]
impl CampaignMessageRepository for MemoryStore {
    async fn create_pending_batch(
        &self,
        campaign_id: CampaignId,
        recipients: &[Recipient],
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut seen: HashSet<String> = state
            .messages
            .iter()
            .filter(|m| m.campaign_id == campaign_id)
            .map(|m| m.phone.clone())
            .collect();

        let now = Utc::now();
        let mut inserted = 0;
        for (position, recipient) in recipients.iter().enumerate() {
            if !seen.insert(recipient.phone.clone()) {
                continue;
            }
            state.messages.push(CampaignMessage {
                id: Uuid::now_v7(),
                campaign_id,
                contact_id: recipient.id,
                position: position as i32,
                phone: recipient.phone.clone(),
                recipient_name: recipient.name.clone(),
                recipient_last_name: recipient.last_name.clone(),
                recipient_email: recipient.email.clone(),
                provider_message_id: None,
                status: MessageStatus::Pending.to_string(),
                error_message: None,
                attempts: 0,
                sent_at: None,
                failed_at: None,
                delivered_at: None,
                read_at: None,
                created_at: now,
                updated_at: now,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn list_pending(&self, campaign_id: CampaignId) -> Result<Vec<PendingMessage>> {
        let state = self.state.read().await;
        let mut pending: Vec<PendingMessage> = state
            .messages
            .iter()
            .filter(|m| m.campaign_id == campaign_id)
            .filter(|m| m.status_enum() == Some(MessageStatus::Pending))
            .cloned()
            .map(PendingMessage::from)
            .collect();
        pending.sort_by_key(|p| p.message.position);
        Ok(pending)
    }

    async fn update_status(
        &self,
        selector: &MessageSelector,
        update: &StatusUpdate,
    ) -> Result<Option<CampaignMessage>> {
        let mut state = self.state.write().await;
        let row = state.messages.iter_mut().find(|m| match selector {
            MessageSelector::Id(id) => m.id == *id,
            MessageSelector::ProviderMessageId(pid) => {
                m.provider_message_id.as_deref() == Some(pid.as_str())
            }
        });

        let Some(message) = row else {
            return Ok(None);
        };
        Ok(update.apply_to(message).then(|| message.clone()))
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<CampaignMessage>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .find(|m| m.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn cancel_pending(
        &self,
        campaign_id: CampaignId,
        exclude: &[CampaignMessageId],
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut cancelled = 0;
        for message in state.messages.iter_mut() {
            if message.campaign_id == campaign_id
                && message.status_enum() == Some(MessageStatus::Pending)
                && !exclude.contains(&message.id)
            {
                message.status = MessageStatus::Cancelled.to_string();
                message.updated_at = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn aggregate_counts(&self, campaign_id: CampaignId) -> Result<MessageCounts> {
        Ok(self.state.read().await.counts(campaign_id))
    }
}

#[async_trait]
impl RecipientResolver for MemoryStore {
    async fn resolve(&self, filter: &serde_json::Value) -> Result<Vec<Recipient>> {
        let filter = RecipientFilter::from_value(filter)?;
        let state = self.state.read().await;

        Ok(state
            .contacts
            .iter()
            .filter(|c| !c.opted_out)
            .filter(|c| {
                filter
                    .contact_ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&c.recipient.id))
            })
            .filter(|c| {
                filter
                    .tags
                    .as_ref()
                    .map_or(true, |tags| tags.iter().any(|t| c.tags.contains(t)))
            })
            .map(|c| c.recipient.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn recipient(phone: &str, name: &str) -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            name: Some(name.to_string()),
            last_name: None,
            email: None,
        }
    }

    async fn seeded(store: &MemoryStore, count: usize) -> Campaign {
        let campaign = store
            .create_campaign(CreateCampaign {
                name: "promo".to_string(),
                message_body: Some("hello".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let recipients: Vec<_> = (0..count)
            .map(|i| recipient(&format!("55119999{:04}", i), "Ana"))
            .collect();
        for r in &recipients {
            store.add_contact(r.clone(), &[]).await;
        }
        store
            .create_pending_batch(campaign.id, &recipients)
            .await
            .unwrap();
        campaign
    }

    #[tokio::test]
    async fn test_seeding_skips_duplicate_phones() {
        let store = MemoryStore::new();
        let campaign = seeded(&store, 2).await;

        let again = vec![recipient("551199990000", "Dup"), recipient("5511000", "New")];
        let inserted = store.create_pending_batch(campaign.id, &again).await.unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(store.messages(campaign.id).await.len(), 3);
    }

    #[tokio::test]
    async fn test_list_pending_carries_seeded_recipient_fields() {
        let store = MemoryStore::new();
        let campaign = seeded(&store, 3).await;

        let pending = store.list_pending(campaign.id).await.unwrap();
        let positions: Vec<i32> = pending.iter().map(|p| p.message.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(pending[0].recipient.name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn test_recipient_fields_do_not_need_a_stored_contact() {
        let store = MemoryStore::new();
        let campaign = seeded(&store, 0).await;
        let outside = Recipient {
            last_name: Some("Souza".to_string()),
            email: Some("bia@example.com".to_string()),
            ..recipient("5521988887777", "Bia")
        };
        store
            .create_pending_batch(campaign.id, &[outside.clone()])
            .await
            .unwrap();

        let pending = store.list_pending(campaign.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].recipient, outside);
    }

    #[tokio::test]
    async fn test_conditional_writes_by_provider_id() {
        let store = MemoryStore::new();
        let campaign = seeded(&store, 1).await;
        let id = store.messages(campaign.id).await[0].id;

        let delivered = StatusUpdate::receipt(MessageStatus::Delivered, Utc::now(), None);
        assert!(store
            .update_status(&MessageSelector::Id(id), &delivered)
            .await
            .unwrap()
            .is_none());

        store
            .update_status(&MessageSelector::Id(id), &StatusUpdate::sent("wamid.1", 1))
            .await
            .unwrap()
            .unwrap();
        let by_pid = MessageSelector::ProviderMessageId("wamid.1".to_string());
        let row = store.update_status(&by_pid, &delivered).await.unwrap().unwrap();
        assert_eq!(row.status, "delivered");

        // Duplicate sent write after the receipt is rejected
        assert!(store
            .update_status(&MessageSelector::Id(id), &StatusUpdate::sent("wamid.2", 2))
            .await
            .unwrap()
            .is_none());
        let row = store.find_by_provider_message_id("wamid.1").await.unwrap().unwrap();
        assert_eq!(row.status, "delivered");
    }

    #[tokio::test]
    async fn test_cancel_pending_respects_exclusions() {
        let store = MemoryStore::new();
        let campaign = seeded(&store, 3).await;
        let messages = store.messages(campaign.id).await;

        let cancelled = store
            .cancel_pending(campaign.id, &[messages[0].id])
            .await
            .unwrap();
        assert_eq!(cancelled, 2);

        let counts = store.aggregate_counts(campaign.id).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.cancelled, 2);
    }

    #[tokio::test]
    async fn test_campaign_transitions() {
        let store = MemoryStore::new();
        let campaign = seeded(&store, 1).await;

        assert!(store.complete(campaign.id).await.unwrap().is_none());
        let sending = store.begin_sending(campaign.id).await.unwrap().unwrap();
        assert_eq!(sending.status, "sending");
        assert!(sending.started_at.is_some());
        assert!(store.begin_sending(campaign.id).await.unwrap().is_none());

        let stopped = store.stop(campaign.id).await.unwrap().unwrap();
        assert_eq!(stopped.status, "stopped");
        assert!(store.fail(campaign.id, "late").await.unwrap().is_none());
        assert!(store.begin_sending(campaign.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_filters_tags_and_opt_outs() {
        let store = MemoryStore::new();
        store.add_contact(recipient("1", "A"), &["vip"]).await;
        store.add_contact(recipient("2", "B"), &["vip", "es"]).await;
        store.add_contact(recipient("3", "C"), &["es"]).await;
        store.opt_out("2").await;

        let vip = store
            .resolve(&serde_json::json!({"tags": ["vip"]}))
            .await
            .unwrap();
        let phones: Vec<&str> = vip.iter().map(|r| r.phone.as_str()).collect();
        assert_eq!(phones, vec!["1"]);

        let all = store.resolve(&serde_json::Value::Null).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
