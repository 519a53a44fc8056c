//! Whatsend Core - WhatsApp campaign dispatch engine
//!
//! This crate provides throttled batch dispatch of campaign messages,
//! template component building, delivery receipt ingestion, and the
//! scheduled campaign worker.

pub mod dispatch;
pub mod ingest;
pub mod provider;
pub mod scheduler;
pub mod template;

pub use dispatch::{
    BatchThrottle, CampaignDispatcher, DeliveryFailure, DispatchError, DispatchEvent,
    DispatchProgress, DispatchRegistry, RetryPolicy,
};
pub use ingest::{IngestError, ReceiptOutcome, StatusIngestor, WebhookPayload};
pub use provider::{
    CloudApiClient, MessagingProvider, ProviderError, SendReceipt, TemplatePayload, TemplateSource,
};
pub use scheduler::ScheduledCampaignWorker;
pub use template::{
    build_components, extract_variables, validate_mapping, MappingValidation, TemplateVariable,
};
