//! Single-message delivery with retries

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use whatsend_common::types::{TemplateDefinition, VariableMapping};
use whatsend_common::Result;
use whatsend_storage::models::{MessageSelector, PendingMessage, StatusUpdate};
use whatsend_storage::repository::CampaignMessageRepository;

use super::error::DeliveryFailure;
use crate::provider::{MessagingProvider, ProviderError, SendReceipt, TemplatePayload};
use crate::template::build_components;

/// What every message of one dispatch is sent with
#[derive(Debug, Clone)]
pub enum MessageContent {
    Template {
        template: TemplateDefinition,
        mapping: VariableMapping,
    },
    Text(String),
    /// Every message fails with this configuration error
    Unavailable(DeliveryFailure),
}

/// Retry settings for one message
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Retry `n` (0-based) waits `backoff * (n + 1)`
    pub backoff: Duration,
    pub send_timeout: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff * (retry + 1)
    }
}

/// Final state of one message in a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { provider_message_id: String, attempts: u32 },
    Failed { error: String, attempts: u32 },
    /// Stopped while waiting to retry; the row is still pending
    Abandoned,
}

/// Sends messages for one dispatch
#[derive(Clone)]
pub struct Delivery {
    provider: Arc<dyn MessagingProvider>,
    messages: Arc<dyn CampaignMessageRepository>,
    content: Arc<MessageContent>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Delivery {
    pub fn new(
        provider: Arc<dyn MessagingProvider>,
        messages: Arc<dyn CampaignMessageRepository>,
        content: MessageContent,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            messages,
            content: Arc::new(content),
            policy,
            cancel,
        }
    }

    /// Deliver one pending message and write its terminal status.
    ///
    /// Errors are storage faults only; send failures are recorded on the row.
    pub async fn deliver(&self, pending: PendingMessage) -> Result<DeliveryOutcome> {
        let message_id = pending.message.id;
        let mut attempts = 0u32;

        loop {
            let failure = match self.attempt(&pending).await {
                Ok(receipt) => {
                    attempts += 1;
                    let written = self
                        .messages
                        .update_status(
                            &MessageSelector::Id(message_id),
                            &StatusUpdate::sent(receipt.message_id.clone(), attempts as i32),
                        )
                        .await?;
                    if written.is_none() {
                        debug!(message_id = %message_id, "Message left pending before sent write");
                    }
                    return Ok(DeliveryOutcome::Sent {
                        provider_message_id: receipt.message_id,
                        attempts,
                    });
                }
                Err(failure) => failure,
            };

            if !failure.is_configuration() {
                attempts += 1;
            }

            let retry = attempts.saturating_sub(1);
            if failure.is_transient() && retry < self.policy.max_retries {
                let delay = self.policy.delay_for(retry);
                warn!(
                    message_id = %message_id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Send failed, retrying: {}",
                    failure
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(DeliveryOutcome::Abandoned),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            let error = failure.to_string();
            warn!(message_id = %message_id, attempts, "Message failed: {}", error);
            self.messages
                .update_status(
                    &MessageSelector::Id(message_id),
                    &StatusUpdate::failed(error.clone(), attempts as i32),
                )
                .await?;
            return Ok(DeliveryOutcome::Failed { error, attempts });
        }
    }

    /// One provider call, bounded by the send timeout
    async fn attempt(
        &self,
        pending: &PendingMessage,
    ) -> std::result::Result<SendReceipt, DeliveryFailure> {
        let phone = pending.message.phone.as_str();
        let timeout = self.policy.send_timeout;

        let call = match self.content.as_ref() {
            MessageContent::Unavailable(failure) => return Err(failure.clone()),
            MessageContent::Text(body) => {
                tokio::time::timeout(timeout, self.provider.send_text_message(phone, body)).await
            }
            MessageContent::Template { template, mapping } => {
                let payload = TemplatePayload {
                    name: template.name.clone(),
                    language: template.language.clone(),
                    components: build_components(&template.components, mapping, &pending.recipient)
                        .unwrap_or_default(),
                };
                tokio::time::timeout(
                    timeout,
                    self.provider.send_template_message(phone, &payload),
                )
                .await
            }
        };

        match call {
            Ok(result) => result.map_err(DeliveryFailure::from),
            Err(_) => Err(ProviderError::Timeout(timeout).into()),
        }
    }
}
