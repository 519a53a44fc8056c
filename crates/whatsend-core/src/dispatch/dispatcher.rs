//! Campaign Dispatcher - Drives a campaign's messages through the provider

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use whatsend_common::config::DispatchConfig;
use whatsend_common::types::{CampaignId, VariableMapping};
use whatsend_common::Error;
use whatsend_storage::models::{Campaign, CampaignStats, CampaignStatus, PendingMessage, Recipient};
use whatsend_storage::repository::{
    CampaignMessageRepository, CampaignRepository, RecipientResolver,
};

use super::delivery::{Delivery, DeliveryOutcome, MessageContent, RetryPolicy};
use super::error::{DeliveryFailure, DispatchError};
use super::events::{DispatchEvent, DispatchProgress};
use super::registry::{DispatchGuard, DispatchRegistry};
use super::throttle::BatchThrottle;
use crate::provider::{MessagingProvider, TemplateSource};
use crate::template::{extract_variables, validate_mapping};

struct Inner {
    config: DispatchConfig,
    campaigns: Arc<dyn CampaignRepository>,
    messages: Arc<dyn CampaignMessageRepository>,
    recipients: Arc<dyn RecipientResolver>,
    provider: Arc<dyn MessagingProvider>,
    templates: Arc<dyn TemplateSource>,
    registry: Arc<DispatchRegistry>,
    events: broadcast::Sender<DispatchEvent>,
}

/// Campaign batch dispatcher.
///
/// Cheap to clone; clones share the registry of running dispatches, so a
/// campaign started through one clone can be stopped through another.
#[derive(Clone)]
pub struct CampaignDispatcher {
    inner: Arc<Inner>,
}

impl CampaignDispatcher {
    /// Create a new dispatcher
    pub fn new(
        config: DispatchConfig,
        campaigns: Arc<dyn CampaignRepository>,
        messages: Arc<dyn CampaignMessageRepository>,
        recipients: Arc<dyn RecipientResolver>,
        provider: Arc<dyn MessagingProvider>,
        templates: Arc<dyn TemplateSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                campaigns,
                messages,
                recipients,
                provider,
                templates,
                registry: Arc::new(DispatchRegistry::new()),
                events,
            }),
        }
    }

    /// Receive progress and completion events for every campaign
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.inner.events.subscribe()
    }

    /// Progress of a running dispatch, `None` when the campaign is idle
    pub fn status(&self, campaign_id: CampaignId) -> Option<DispatchProgress> {
        self.inner.registry.progress(campaign_id)
    }

    /// Dispatch every pending message of a campaign and return the final counts.
    ///
    /// Runs until the campaign is sent or stopped; callers usually spawn it.
    pub async fn send(&self, campaign_id: CampaignId) -> Result<CampaignStats, DispatchError> {
        let guard = self
            .inner
            .registry
            .try_acquire(campaign_id)
            .ok_or(DispatchError::AlreadyDispatching(campaign_id))?;

        let campaign = self
            .inner
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or(DispatchError::CampaignNotFound(campaign_id))?;

        match campaign.status_enum() {
            Some(CampaignStatus::Sent) => {
                return Err(DispatchError::CampaignAlreadySent(campaign_id))
            }
            Some(CampaignStatus::Stopped) => return Err(DispatchError::CampaignStopped(campaign_id)),
            _ => {}
        }

        info!(
            campaign_id = %campaign_id,
            name = %campaign.name,
            status = %campaign.status,
            "Starting campaign dispatch"
        );

        match self.run(&guard, campaign).await {
            Ok(stats) => Ok(stats),
            Err(e) => Err(self.abort(campaign_id, e).await),
        }
    }

    /// Stop a running dispatch.
    ///
    /// Pending messages are cancelled except those of the batch in flight,
    /// whose outcomes are still recorded. No further batch starts.
    pub async fn stop(&self, campaign_id: CampaignId) -> Result<(), DispatchError> {
        let in_flight = self
            .inner
            .registry
            .stop(campaign_id)
            .ok_or(DispatchError::AlreadyInactive(campaign_id))?;

        self.inner.campaigns.stop(campaign_id).await?;
        let cancelled = self
            .inner
            .messages
            .cancel_pending(campaign_id, &in_flight)
            .await?;
        self.inner.campaigns.refresh_counts(campaign_id).await?;

        info!(
            campaign_id = %campaign_id,
            cancelled,
            in_flight = in_flight.len(),
            "Campaign stopped"
        );
        Ok(())
    }

    async fn run(
        &self,
        guard: &DispatchGuard,
        campaign: Campaign,
    ) -> Result<CampaignStats, DispatchError> {
        let inner = &self.inner;
        let campaign_id = campaign.id;

        // The persisted mapping is the only one a dispatch uses
        let mapping = campaign
            .variable_mapping()
            .map_err(|e| DispatchError::InvalidMapping {
                errors: vec![e.to_string()],
            })?;

        let campaign = if campaign.status_enum() == Some(CampaignStatus::Sending) {
            info!(campaign_id = %campaign_id, "Resuming interrupted dispatch");
            campaign
        } else {
            inner
                .campaigns
                .begin_sending(campaign_id)
                .await?
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "Campaign {} could not enter the sending state",
                        campaign_id
                    ))
                })?
        };

        let content = self.prepare_content(&campaign, mapping).await?;
        self.seed_recipients(&campaign).await?;

        let pending = inner.messages.list_pending(campaign_id).await?;
        let throttle = BatchThrottle::new(inner.config.batch_size, inner.config.messages_per_second);
        let total_batches = pending.len().div_ceil(throttle.batch_size());

        guard.update_progress(|p| {
            p.total_batches = total_batches;
            p.total_messages = pending.len();
        });
        self.emit(DispatchEvent::Started {
            campaign_id,
            total_messages: pending.len(),
            total_batches,
        });

        let delivery = Delivery::new(
            Arc::clone(&inner.provider),
            Arc::clone(&inner.messages),
            content,
            RetryPolicy {
                max_retries: inner.config.max_retries,
                backoff: inner.config.retry_backoff(),
                send_timeout: inner.config.send_timeout(),
            },
            guard.token().clone(),
        );

        for (index, batch) in pending.chunks(throttle.batch_size()).enumerate() {
            if !guard.begin_batch(batch.iter().map(|p| p.message.id)) {
                break;
            }

            let started = Instant::now();
            let result = self.send_batch(&delivery, batch).await;
            guard.end_batch();
            let (sent, failed) = result?;

            guard.update_progress(|p| {
                p.batch_index = index + 1;
                p.sent += sent;
                p.failed += failed;
            });
            if let Some(progress) = guard.progress() {
                debug!(
                    campaign_id = %campaign_id,
                    batch = progress.batch_index,
                    total_batches = progress.total_batches,
                    sent = progress.sent,
                    failed = progress.failed,
                    "Batch finished"
                );
                self.emit(DispatchEvent::Progress(progress));
            }

            if !throttle.wait(started, guard.token()).await {
                break;
            }
        }

        if guard.is_cancelled() {
            return self.finish_stopped(campaign_id).await;
        }

        match inner.campaigns.complete(campaign_id).await? {
            Some(campaign) => {
                let stats = campaign.stats();
                info!(
                    campaign_id = %campaign_id,
                    sent = stats.sent,
                    failed = stats.failed,
                    "Campaign sent"
                );
                self.emit(DispatchEvent::Completed {
                    campaign_id,
                    stats: stats.clone(),
                });
                Ok(stats)
            }
            // Stopped between the last batch and completion
            None => self.finish_stopped(campaign_id).await,
        }
    }

    /// Resolve what every message is sent with, fetching the template once
    async fn prepare_content(
        &self,
        campaign: &Campaign,
        mapping: VariableMapping,
    ) -> Result<MessageContent, DispatchError> {
        let template_name = campaign
            .template_name
            .as_deref()
            .filter(|name| !name.trim().is_empty());

        let Some(name) = template_name else {
            return Ok(
                match campaign
                    .message_body
                    .as_deref()
                    .filter(|body| !body.trim().is_empty())
                {
                    Some(body) => MessageContent::Text(body.to_string()),
                    None => MessageContent::Unavailable(DeliveryFailure::NoContentOrTemplate),
                },
            );
        };

        let template = match self
            .inner
            .templates
            .fetch_template(name, campaign.template_language.as_deref())
            .await?
        {
            Some(template) => template,
            None => {
                warn!(campaign_id = %campaign.id, template = name, "Template not found");
                return Ok(MessageContent::Unavailable(
                    DeliveryFailure::TemplateNotFound(name.to_string()),
                ));
            }
        };

        let required = extract_variables(&template.components);
        if !required.is_empty() {
            if mapping.is_empty() {
                warn!(
                    campaign_id = %campaign.id,
                    template = name,
                    variables = required.len(),
                    "Template has variables but the campaign has no mapping"
                );
                return Ok(MessageContent::Unavailable(
                    DeliveryFailure::TemplateRequiresVariables(name.to_string()),
                ));
            }

            let validation = validate_mapping(&required, Some(&mapping));
            if !validation.valid {
                return Err(DispatchError::InvalidMapping {
                    errors: validation.errors,
                });
            }
        }

        Ok(MessageContent::Template { template, mapping })
    }

    /// Create pending rows on the first dispatch of a campaign
    async fn seed_recipients(&self, campaign: &Campaign) -> Result<(), DispatchError> {
        let inner = &self.inner;
        let existing = inner.messages.aggregate_counts(campaign.id).await?;
        if existing.total() > 0 {
            debug!(
                campaign_id = %campaign.id,
                pending = existing.pending,
                "Campaign already seeded"
            );
            return Ok(());
        }

        let resolved = inner
            .recipients
            .resolve(&campaign.recipient_filter)
            .await
            .map_err(|e| DispatchError::RecipientResolution(e.to_string()))?;

        let mut seen = HashSet::new();
        let recipients: Vec<Recipient> = resolved
            .into_iter()
            .filter(|r| !r.phone.trim().is_empty() && seen.insert(r.phone.clone()))
            .collect();

        let inserted = inner
            .messages
            .create_pending_batch(campaign.id, &recipients)
            .await?;
        let total = recipient_total(campaign.id, inserted)?;
        inner
            .campaigns
            .set_total_recipients(campaign.id, total)
            .await?;

        info!(campaign_id = %campaign.id, recipients = inserted, "Seeded campaign messages");
        Ok(())
    }

    /// Send one batch concurrently and wait for every outcome
    async fn send_batch(
        &self,
        delivery: &Delivery,
        batch: &[PendingMessage],
    ) -> Result<(usize, usize), DispatchError> {
        let mut tasks = JoinSet::new();
        for pending in batch {
            let delivery = delivery.clone();
            let pending = pending.clone();
            tasks.spawn(async move { delivery.deliver(pending).await });
        }

        let (mut sent, mut failed) = (0, 0);
        let mut fault = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(DeliveryOutcome::Sent { .. })) => sent += 1,
                Ok(Ok(DeliveryOutcome::Failed { .. })) => failed += 1,
                Ok(Ok(DeliveryOutcome::Abandoned)) => {}
                Ok(Err(e)) => {
                    fault.get_or_insert(DispatchError::Storage(e));
                }
                Err(e) => {
                    fault.get_or_insert(DispatchError::Storage(Error::Internal(format!(
                        "Delivery task failed: {}",
                        e
                    ))));
                }
            }
        }

        match fault {
            Some(e) => Err(e),
            None => Ok((sent, failed)),
        }
    }

    /// Settle a stopped dispatch: no row stays pending
    async fn finish_stopped(&self, campaign_id: CampaignId) -> Result<CampaignStats, DispatchError> {
        let inner = &self.inner;
        inner.campaigns.stop(campaign_id).await?;
        let cancelled = inner.messages.cancel_pending(campaign_id, &[]).await?;
        let campaign = inner
            .campaigns
            .refresh_counts(campaign_id)
            .await?
            .ok_or(DispatchError::CampaignNotFound(campaign_id))?;

        let stats = campaign.stats();
        info!(
            campaign_id = %campaign_id,
            sent = stats.sent,
            failed = stats.failed,
            cancelled = stats.cancelled,
            swept = cancelled,
            "Campaign dispatch ended by stop"
        );
        self.emit(DispatchEvent::Stopped {
            campaign_id,
            stats: stats.clone(),
        });
        Ok(stats)
    }

    /// Mark the campaign failed and wrap the error with committed counts
    async fn abort(&self, campaign_id: CampaignId, cause: DispatchError) -> DispatchError {
        let reason = cause.to_string();
        error!(
            campaign_id = %campaign_id,
            code = cause.code(),
            "Campaign dispatch failed: {}",
            reason
        );

        let stats = match self.inner.campaigns.fail(campaign_id, &reason).await {
            Ok(Some(campaign)) => Some(campaign.stats()),
            Ok(None) => self
                .inner
                .campaigns
                .get(campaign_id)
                .await
                .ok()
                .flatten()
                .map(|c| c.stats()),
            Err(e) => {
                warn!(campaign_id = %campaign_id, "Failed to mark campaign failed: {}", e);
                None
            }
        };

        self.emit(DispatchEvent::Failed {
            campaign_id,
            error: reason,
            stats: stats.clone(),
        });

        DispatchError::Aborted {
            source: Box::new(cause),
            stats,
        }
    }

    fn emit(&self, event: DispatchEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

/// Seeded row count as stored in `campaigns.total_recipients`
fn recipient_total(campaign_id: CampaignId, inserted: u64) -> Result<i32, Error> {
    i32::try_from(inserted).map_err(|_| {
        Error::Internal(format!(
            "Campaign {} seeded {} recipients, more than can be counted",
            campaign_id, inserted
        ))
    })
}
