//! Messaging provider abstraction

pub mod cloud_api;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use whatsend_common::types::TemplateDefinition;

use crate::template::ComponentParameters;

pub use cloud_api::CloudApiClient;

/// Errors returned by a messaging provider call
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned HTTP {status}: {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether a retry of the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Network(_) => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::InvalidResponse(_) => false,
        }
    }
}

/// Template send request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplatePayload {
    pub name: String,
    pub language: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentParameters>,
}

/// Accepted send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Outbound message transport
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    async fn send_template_message(
        &self,
        phone: &str,
        template: &TemplatePayload,
    ) -> Result<SendReceipt, ProviderError>;

    async fn send_text_message(&self, phone: &str, body: &str)
        -> Result<SendReceipt, ProviderError>;
}

/// Registry of provider-approved templates
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Look up a template by name, preferring the given language.
    /// `Ok(None)` when the provider has no such template.
    async fn fetch_template(
        &self,
        name: &str,
        language: Option<&str>,
    ) -> Result<Option<TemplateDefinition>, ProviderError>;
}
