//! Campaign Batching Service - Turns a campaign into a stream of email jobs

mod service;

pub use service::{
    estimate_completion, CampaignError, CampaignQueueStatus, CampaignService,
    QueueCampaignOptions,
};
