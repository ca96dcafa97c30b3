//! Repository layer for data access

pub mod ab_tests;
pub mod campaigns;
pub mod jobs;
pub mod recipients;
pub mod smtp_configs;
pub mod webhook_deliveries;
pub mod webhooks;

pub use ab_tests::{AbTestRepository, VariantCounter};
pub use campaigns::CampaignRepository;
pub use jobs::{JobCounts, JobRepository, JobState};
pub use recipients::{RecipientCounts, RecipientRepository};
pub use smtp_configs::SmtpConfigRepository;
pub use webhook_deliveries::{DeliveryRepository, DeliveryStats};
pub use webhooks::WebhookRepository;
