//! Dispatch error types

use thiserror::Error;
use whatsend_common::types::CampaignId;
use whatsend_storage::models::CampaignStats;

use crate::provider::ProviderError;

/// Errors returned by the campaign dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("campaign {0} is already dispatching")]
    AlreadyDispatching(CampaignId),

    #[error("campaign {0} not found")]
    CampaignNotFound(CampaignId),

    #[error("campaign {0} has already been sent")]
    CampaignAlreadySent(CampaignId),

    #[error("campaign {0} was stopped")]
    CampaignStopped(CampaignId),

    #[error("campaign {0} is not dispatching")]
    AlreadyInactive(CampaignId),

    #[error("invalid variable mapping: {}", .errors.join("; "))]
    InvalidMapping { errors: Vec<String> },

    #[error("recipient resolution failed: {0}")]
    RecipientResolution(String),

    #[error("template lookup failed: {0}")]
    Template(#[from] ProviderError),

    #[error("storage error: {0}")]
    Storage(#[from] whatsend_common::Error),

    /// A fault after the dispatch started; the campaign was marked failed
    #[error("dispatch aborted: {source}")]
    Aborted {
        source: Box<DispatchError>,
        stats: Option<CampaignStats>,
    },
}

impl DispatchError {
    /// Statistics committed before an aborted dispatch gave up
    pub fn partial_stats(&self) -> Option<&CampaignStats> {
        match self {
            DispatchError::Aborted { stats, .. } => stats.as_ref(),
            _ => None,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::AlreadyDispatching(_) => "ALREADY_DISPATCHING",
            DispatchError::CampaignNotFound(_) => "CAMPAIGN_NOT_FOUND",
            DispatchError::CampaignAlreadySent(_) => "CAMPAIGN_ALREADY_SENT",
            DispatchError::CampaignStopped(_) => "CAMPAIGN_STOPPED",
            DispatchError::AlreadyInactive(_) => "ALREADY_INACTIVE",
            DispatchError::InvalidMapping { .. } => "INVALID_MAPPING",
            DispatchError::RecipientResolution(_) => "RECIPIENT_RESOLUTION_FAILED",
            DispatchError::Template(_) => "TEMPLATE_LOOKUP_FAILED",
            DispatchError::Storage(e) => e.code(),
            DispatchError::Aborted { source, .. } => source.code(),
        }
    }

    /// The underlying error, looking through `Aborted`
    pub fn cause(&self) -> &DispatchError {
        match self {
            DispatchError::Aborted { source, .. } => source.cause(),
            other => other,
        }
    }
}

/// Why a single message ended as failed
#[derive(Debug, Clone, Error)]
pub enum DeliveryFailure {
    #[error("template {0} requires variables but the campaign has no variable mapping")]
    TemplateRequiresVariables(String),

    #[error("template {0} was not found")]
    TemplateNotFound(String),

    #[error("campaign has neither a template nor a message body")]
    NoContentOrTemplate,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl DeliveryFailure {
    /// Configuration problems fail the message without a remote call
    pub fn is_configuration(&self) -> bool {
        !matches!(self, DeliveryFailure::Provider(_))
    }

    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryFailure::Provider(e) => e.is_transient(),
            _ => false,
        }
    }
}
