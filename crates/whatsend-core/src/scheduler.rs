//! Scheduled Campaign Worker - Starts due campaigns and resumes interrupted ones

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use whatsend_common::config::SchedulerConfig;
use whatsend_common::types::CampaignId;
use whatsend_storage::models::CampaignStatus;
use whatsend_storage::repository::CampaignRepository;

use crate::dispatch::{CampaignDispatcher, DispatchError};

/// Scheduled campaign worker
pub struct ScheduledCampaignWorker {
    campaigns: Arc<dyn CampaignRepository>,
    dispatcher: CampaignDispatcher,
    /// Interval between polls (seconds)
    poll_interval_secs: u64,
    /// Resume campaigns left in `sending` on start
    resume_interrupted: bool,
    /// Due campaigns started per poll
    batch_limit: i64,
}

impl ScheduledCampaignWorker {
    /// Create a new scheduled campaign worker
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        dispatcher: CampaignDispatcher,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            campaigns,
            dispatcher,
            poll_interval_secs: config.poll_interval_secs.max(1),
            resume_interrupted: config.resume_interrupted,
            batch_limit: 50,
        }
    }

    /// Set how many due campaigns are started per poll
    pub fn with_batch_limit(mut self, limit: i64) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Run until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Scheduled campaign worker started (interval: {}s, resume: {})",
            self.poll_interval_secs, self.resume_interrupted
        );

        if self.resume_interrupted {
            if let Err(e) = self.resume_interrupted_campaigns().await {
                error!("Error resuming interrupted campaigns: {}", e);
            }
        }

        let mut ticker = interval(Duration::from_secs(self.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.start_due_campaigns().await {
                error!("Error starting scheduled campaigns: {}", e);
            }
        }

        info!("Scheduled campaign worker stopped");
    }

    /// Spawn a dispatch for every scheduled campaign whose time has come
    pub async fn start_due_campaigns(&self) -> anyhow::Result<usize> {
        let due = self
            .campaigns
            .list_due_scheduled(Utc::now(), self.batch_limit)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        debug!("Starting {} scheduled campaigns", due.len());
        for campaign in &due {
            self.spawn_dispatch(campaign.id);
        }
        Ok(due.len())
    }

    /// Spawn a dispatch for every campaign a previous process left in `sending`
    pub async fn resume_interrupted_campaigns(&self) -> anyhow::Result<usize> {
        let interrupted = self.campaigns.list_by_status(CampaignStatus::Sending).await?;

        for campaign in &interrupted {
            info!(campaign_id = %campaign.id, name = %campaign.name, "Resuming interrupted campaign");
            self.spawn_dispatch(campaign.id);
        }
        Ok(interrupted.len())
    }

    fn spawn_dispatch(&self, campaign_id: CampaignId) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            match dispatcher.send(campaign_id).await {
                Ok(stats) => {
                    debug!(campaign_id = %campaign_id, status = %stats.status, "Dispatch finished");
                }
                Err(DispatchError::AlreadyDispatching(_)) => {
                    debug!(campaign_id = %campaign_id, "Campaign already dispatching");
                }
                Err(e) => {
                    warn!(campaign_id = %campaign_id, code = e.code(), "Scheduled dispatch failed: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        MessagingProvider, ProviderError, SendReceipt, TemplatePayload, TemplateSource,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;
    use whatsend_common::config::DispatchConfig;
    use whatsend_common::types::TemplateDefinition;
    use whatsend_storage::models::{CreateCampaign, Recipient};
    use whatsend_storage::repository::{CampaignMessageRepository, RecipientResolver};
    use whatsend_storage::MemoryStore;

    #[derive(Default)]
    struct CountingProvider {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl MessagingProvider for CountingProvider {
        async fn send_template_message(
            &self,
            _phone: &str,
            _template: &TemplatePayload,
        ) -> Result<SendReceipt, ProviderError> {
            Err(ProviderError::InvalidResponse("unused".to_string()))
        }

        async fn send_text_message(
            &self,
            _phone: &str,
            _body: &str,
        ) -> Result<SendReceipt, ProviderError> {
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(SendReceipt {
                message_id: format!("wamid.{}", n),
            })
        }
    }

    struct NoTemplates;

    #[async_trait]
    impl TemplateSource for NoTemplates {
        async fn fetch_template(
            &self,
            _name: &str,
            _language: Option<&str>,
        ) -> Result<Option<TemplateDefinition>, ProviderError> {
            Ok(None)
        }
    }

    async fn setup() -> (MemoryStore, Arc<CountingProvider>, ScheduledCampaignWorker) {
        let store = MemoryStore::new();
        store
            .add_contact(
                Recipient {
                    id: Uuid::new_v4(),
                    phone: "5511999990000".to_string(),
                    name: Some("Ana".to_string()),
                    last_name: None,
                    email: None,
                },
                &[],
            )
            .await;

        let provider = Arc::new(CountingProvider::default());
        let dispatcher = CampaignDispatcher::new(
            DispatchConfig::default(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            provider.clone(),
            Arc::new(NoTemplates),
        );
        let worker = ScheduledCampaignWorker::new(
            Arc::new(store.clone()),
            dispatcher,
            &SchedulerConfig::default(),
        );
        (store, provider, worker)
    }

    async fn campaign(store: &MemoryStore, scheduled_in: chrono::Duration) -> CampaignId {
        store
            .create_campaign(CreateCampaign {
                name: "scheduled".to_string(),
                message_body: Some("hello".to_string()),
                scheduled_at: Some(Utc::now() + scheduled_in),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_only_due_campaigns() {
        let (store, provider, worker) = setup().await;
        let due = campaign(&store, chrono::Duration::minutes(-5)).await;
        let later = campaign(&store, chrono::Duration::hours(1)).await;

        assert_eq!(worker.start_due_campaigns().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(store.campaign(due).await.unwrap().status, "sent");
        assert_eq!(store.campaign(later).await.unwrap().status, "scheduled");
        assert_eq!(provider.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_sending_campaigns() {
        let (store, provider, worker) = setup().await;
        let id = campaign(&store, chrono::Duration::minutes(-1)).await;
        let recipients = store.resolve(&serde_json::json!({})).await.unwrap();
        store.create_pending_batch(id, &recipients).await.unwrap();
        store.begin_sending(id).await.unwrap();

        assert_eq!(worker.resume_interrupted_campaigns().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(store.campaign(id).await.unwrap().status, "sent");
        assert_eq!(provider.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (store, provider, worker) = setup().await;
        let due = campaign(&store, chrono::Duration::seconds(-1)).await;
        let shutdown = CancellationToken::new();

        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            stop.cancel();
        });
        worker.run(shutdown).await;

        assert_eq!(store.campaign(due).await.unwrap().status, "sent");
        assert_eq!(provider.sent.load(Ordering::SeqCst), 1);
    }
}
