//! Dispatch notifications

use chrono::{DateTime, Utc};
use serde::Serialize;
use whatsend_common::types::CampaignId;
use whatsend_storage::models::CampaignStats;

/// Live progress of one dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchProgress {
    pub campaign_id: CampaignId,
    /// Batches finished so far
    pub batch_index: usize,
    pub total_batches: usize,
    pub total_messages: usize,
    pub sent: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
}

impl DispatchProgress {
    pub fn new(campaign_id: CampaignId) -> Self {
        Self {
            campaign_id,
            batch_index: 0,
            total_batches: 0,
            total_messages: 0,
            sent: 0,
            failed: 0,
            started_at: Utc::now(),
        }
    }
}

/// Events published while campaigns dispatch
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    Started {
        campaign_id: CampaignId,
        total_messages: usize,
        total_batches: usize,
    },
    Progress(DispatchProgress),
    Completed {
        campaign_id: CampaignId,
        stats: CampaignStats,
    },
    Failed {
        campaign_id: CampaignId,
        error: String,
        stats: Option<CampaignStats>,
    },
    Stopped {
        campaign_id: CampaignId,
        stats: CampaignStats,
    },
}

impl DispatchEvent {
    pub fn campaign_id(&self) -> CampaignId {
        match self {
            DispatchEvent::Started { campaign_id, .. }
            | DispatchEvent::Completed { campaign_id, .. }
            | DispatchEvent::Failed { campaign_id, .. }
            | DispatchEvent::Stopped { campaign_id, .. } => *campaign_id,
            DispatchEvent::Progress(progress) => progress.campaign_id,
        }
    }
}
