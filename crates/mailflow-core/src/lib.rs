//! Mailflow Core - Campaign delivery pipeline
//!
//! This crate provides the delivery pipeline: the durable job queues and
//! their workers, the campaign batching service, the A/B test executor, and
//! the webhook delivery subsystem.

pub mod abtest;
pub mod campaign;
pub mod delivery;
pub mod queue;
pub mod ratelimit;
pub mod render;
pub mod smtp;
pub mod webhook;

pub use abtest::{AbTestExecutor, AbTestError, split_recipients, SplitPlan};
pub use campaign::{CampaignError, CampaignQueueStatus, CampaignService, QueueCampaignOptions};
pub use delivery::{EmailJob, EmailWorker, SendEmailJob, WorkerStatus};
pub use queue::{EnqueueOptions, ExponentialBackoff, FixedDelayTable, JobQueue, QueueStats, RetryDelay};
pub use ratelimit::{Admission, AdmissionController, FallbackAdmission, LocalAdmissionController, PgAdmissionController, SlidingWindow};
pub use render::ContentRenderer;
pub use smtp::{
    MailTransport, OutboundEmail, RelayTransportFactory, SendOutcome, SmtpRelayTransport,
    TransportError, TransportFactory,
};
pub use webhook::{EventDispatcher, EventScope, WebhookAuth, WebhookError, WebhookSender, WebhookService, WebhookWorker};
