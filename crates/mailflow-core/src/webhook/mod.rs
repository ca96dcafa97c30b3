//! Webhook Delivery - Event fan-out, signed delivery, bounded retry

mod auth;
mod dispatcher;
mod manager;
mod sender;
mod worker;

pub use auth::{sign_payload, WebhookAuth};
pub use dispatcher::{EventDispatcher, EventScope, WebhookJob};
pub use manager::{CreateWebhookRequest, UpdateWebhookRequest, WebhookError, WebhookService};
pub use sender::{WebhookResponse, WebhookSender};
pub use worker::WebhookWorker;
