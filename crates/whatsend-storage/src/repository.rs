//! Repository layer for data access

pub mod campaign_messages;
pub mod campaigns;
pub mod contacts;

// Re-export concrete repository implementations
pub use campaign_messages::DbCampaignMessageRepository;
pub use campaigns::DbCampaignRepository;
pub use contacts::DbContactRepository;

// Re-export repository traits
pub use campaign_messages::CampaignMessageRepository;
pub use campaigns::CampaignRepository;
pub use contacts::RecipientResolver;
