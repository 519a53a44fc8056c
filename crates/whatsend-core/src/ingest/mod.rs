//! Delivery receipt ingestion

pub mod ingestor;
pub mod webhook;

pub use ingestor::{IngestError, ReceiptOutcome, StatusIngestor};
pub use webhook::{verify_signature, StatusNotification, WebhookPayload, SIGNATURE_HEADER};
