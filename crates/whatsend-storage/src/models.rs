//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use whatsend_common::types::{CampaignId, CampaignMessageId, ContactId, VariableMapping};
use whatsend_common::{Error, Result};

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
    Stopped,
}

impl CampaignStatus {
    /// Status names as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            "failed" => Ok(CampaignStatus::Failed),
            "stopped" => Ok(CampaignStatus::Stopped),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    /// Provider template name; takes precedence over `message_body`
    pub template_name: Option<String>,
    pub template_language: Option<String>,
    /// Free-text body for non-template sends
    pub message_body: Option<String>,
    /// Opaque filter handed to the recipient resolver
    pub recipient_filter: serde_json::Value,
    /// Persisted `VariableMapping` (placeholder number -> binding)
    pub variable_mapping: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: String,
    pub total_recipients: i32,
    /// Messages that reached sent or later
    pub sent_count: i32,
    /// Messages that reached delivered or later
    pub delivered_count: i32,
    pub read_count: i32,
    pub failed_count: i32,
    pub cancelled_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Get status enum
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    /// Decode the persisted variable mapping. `null` and `{}` both mean "no mapping".
    pub fn variable_mapping(&self) -> Result<VariableMapping> {
        if self.variable_mapping.is_null() {
            return Ok(VariableMapping::new());
        }
        serde_json::from_value(self.variable_mapping.clone()).map_err(|e| {
            Error::Validation(format!(
                "Campaign {} has a malformed variable mapping: {}",
                self.id, e
            ))
        })
    }

    /// Copy aggregate counts onto the row
    pub fn apply_counts(&mut self, counts: &MessageCounts) {
        self.sent_count = counts.reached_sent() as i32;
        self.delivered_count = counts.reached_delivered() as i32;
        self.read_count = counts.read as i32;
        self.failed_count = counts.failed as i32;
        self.cancelled_count = counts.cancelled as i32;
    }

    /// Aggregate statistics as last persisted
    pub fn stats(&self) -> CampaignStats {
        let settled = self.sent_count + self.failed_count + self.cancelled_count;
        CampaignStats {
            campaign_id: self.id,
            status: self.status.clone(),
            total_recipients: self.total_recipients,
            pending: (self.total_recipients - settled).max(0),
            sent: self.sent_count,
            delivered: self.delivered_count,
            read: self.read_count,
            failed: self.failed_count,
            cancelled: self.cancelled_count,
        }
    }
}

/// Create campaign input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub name: String,
    pub template_name: Option<String>,
    pub template_language: Option<String>,
    pub message_body: Option<String>,
    pub recipient_filter: Option<serde_json::Value>,
    pub variable_mapping: Option<VariableMapping>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Campaign message status.
///
/// Forward order is `pending -> sent -> delivered -> read`; `failed` is
/// reachable from `pending` or `sent`, `cancelled` only from `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
            MessageStatus::Cancelled => "cancelled",
        }
    }

    /// States from which a transition into `self` is allowed
    pub fn allowed_predecessors(&self) -> &'static [MessageStatus] {
        match self {
            MessageStatus::Pending => &[],
            MessageStatus::Sent => &[MessageStatus::Pending],
            MessageStatus::Delivered => &[MessageStatus::Sent],
            MessageStatus::Read => &[MessageStatus::Sent, MessageStatus::Delivered],
            MessageStatus::Failed => &[MessageStatus::Pending, MessageStatus::Sent],
            MessageStatus::Cancelled => &[MessageStatus::Pending],
        }
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            "cancelled" => Ok(MessageStatus::Cancelled),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

/// One (campaign, recipient) delivery row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignMessage {
    pub id: CampaignMessageId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    /// Seeded order within the campaign
    pub position: i32,
    pub phone: String,
    /// Display fields captured from the resolver when the row was seeded
    pub recipient_name: Option<String>,
    pub recipient_last_name: Option<String>,
    pub recipient_email: Option<String>,
    pub provider_message_id: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignMessage {
    /// Get status enum
    pub fn status_enum(&self) -> Option<MessageStatus> {
        self.status.parse().ok()
    }

    /// The recipient as it was resolved for this campaign
    pub fn recipient(&self) -> Recipient {
        Recipient {
            id: self.contact_id,
            phone: self.phone.clone(),
            name: self.recipient_name.clone(),
            last_name: self.recipient_last_name.clone(),
            email: self.recipient_email.clone(),
        }
    }
}

/// Resolved target contact
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Recipient {
    pub id: ContactId,
    pub phone: String,
    pub name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

/// Filter understood by the bundled recipient resolvers.
///
/// Both fields absent selects every contact that has not opted out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientFilter {
    #[serde(default)]
    pub contact_ids: Option<Vec<ContactId>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl RecipientFilter {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("Invalid recipient filter: {}", e)))
    }
}

/// A pending message with the recipient fields needed for substitution
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: CampaignMessage,
    pub recipient: Recipient,
}

impl From<CampaignMessage> for PendingMessage {
    fn from(message: CampaignMessage) -> Self {
        PendingMessage {
            recipient: message.recipient(),
            message,
        }
    }
}

/// How a status write locates its row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSelector {
    Id(CampaignMessageId),
    ProviderMessageId(String),
}

/// A conditional status transition.
///
/// The write only applies while the row's current status is one of `from`,
/// so late or duplicate writers can never move a message backwards.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: MessageStatus,
    pub from: Vec<MessageStatus>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub attempts: Option<i32>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Dispatcher write: pending -> sent
    pub fn sent(provider_message_id: impl Into<String>, attempts: i32) -> Self {
        Self {
            status: MessageStatus::Sent,
            from: vec![MessageStatus::Pending],
            provider_message_id: Some(provider_message_id.into()),
            error_message: None,
            attempts: Some(attempts),
            at: Utc::now(),
        }
    }

    /// Dispatcher write: pending -> failed
    pub fn failed(error: impl Into<String>, attempts: i32) -> Self {
        Self {
            status: MessageStatus::Failed,
            from: vec![MessageStatus::Pending],
            provider_message_id: None,
            error_message: Some(error.into()),
            attempts: Some(attempts),
            at: Utc::now(),
        }
    }

    /// Delivery receipt write: any forward transition into `status`
    pub fn receipt(status: MessageStatus, at: DateTime<Utc>, error: Option<String>) -> Self {
        Self {
            status,
            from: status.allowed_predecessors().to_vec(),
            provider_message_id: None,
            error_message: error,
            attempts: None,
            at,
        }
    }

    /// Apply to an in-memory row. Returns false when the row's status is not
    /// an accepted starting point.
    pub fn apply_to(&self, message: &mut CampaignMessage) -> bool {
        let Some(current) = message.status_enum() else {
            return false;
        };
        if !self.from.contains(&current) {
            return false;
        }

        message.status = self.status.to_string();
        if let Some(id) = &self.provider_message_id {
            message.provider_message_id = Some(id.clone());
        }
        if let Some(error) = &self.error_message {
            message.error_message = Some(error.clone());
        }
        if let Some(attempts) = self.attempts {
            message.attempts = attempts;
        }
        match self.status {
            MessageStatus::Sent => message.sent_at = Some(self.at),
            MessageStatus::Delivered => message.delivered_at = Some(self.at),
            MessageStatus::Read => {
                message.delivered_at.get_or_insert(self.at);
                message.read_at = Some(self.at);
            }
            MessageStatus::Failed => message.failed_at = Some(self.at),
            MessageStatus::Pending | MessageStatus::Cancelled => {}
        }
        message.updated_at = Utc::now();
        true
    }

    /// Status names accepted as the starting point
    pub fn from_names(&self) -> Vec<String> {
        self.from.iter().map(|s| s.to_string()).collect()
    }
}

/// Per-status message counts for a campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub pending: i64,
    pub sent: i64,
    pub delivered: i64,
    pub read: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl MessageCounts {
    pub fn tally<'a>(messages: impl IntoIterator<Item = &'a CampaignMessage>) -> Self {
        let mut counts = Self::default();
        for message in messages {
            match message.status_enum() {
                Some(MessageStatus::Pending) => counts.pending += 1,
                Some(MessageStatus::Sent) => counts.sent += 1,
                Some(MessageStatus::Delivered) => counts.delivered += 1,
                Some(MessageStatus::Read) => counts.read += 1,
                Some(MessageStatus::Failed) => counts.failed += 1,
                Some(MessageStatus::Cancelled) => counts.cancelled += 1,
                None => {}
            }
        }
        counts
    }

    pub fn total(&self) -> i64 {
        self.pending + self.sent + self.delivered + self.read + self.failed + self.cancelled
    }

    /// Messages at sent or any later delivery state
    pub fn reached_sent(&self) -> i64 {
        self.sent + self.delivered + self.read
    }

    /// Messages at delivered or read
    pub fn reached_delivered(&self) -> i64 {
        self.delivered + self.read
    }
}

/// Campaign statistics reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub campaign_id: CampaignId,
    pub status: String,
    pub total_recipients: i32,
    pub pending: i32,
    pub sent: i32,
    pub delivered: i32,
    pub read: i32,
    pub failed: i32,
    pub cancelled: i32,
}
