//! Event Dispatcher - Maps lifecycle events to webhook delivery jobs
//!
//! `fire_event` finds the active webhooks subscribed to an event, snapshots
//! the payload onto a delivery row, and queues one delivery job per match.
//! Dispatch is best-effort from the caller's point of view: an email job
//! never fails because its notification could not be queued.

use chrono::Utc;
use mailflow_common::types::Event;
use mailflow_common::Result;
use mailflow_storage::repository::{DeliveryRepository, WebhookRepository};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::queue::{EnqueueOptions, JobQueue};

/// Scoping for an event: restrict fan-out to one owner's webhooks and let
/// campaign filters apply
#[derive(Debug, Clone, Copy, Default)]
pub struct EventScope {
    pub user_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
}

/// Queue payload for one webhook delivery.
///
/// Carries references only; the payload snapshot lives on the delivery row
/// and the credential stays encrypted until the worker needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub delivery_id: Uuid,
    pub webhook_id: Uuid,
    pub campaign_id: Option<Uuid>,
}

/// Event Dispatcher
pub struct EventDispatcher {
    webhooks: WebhookRepository,
    deliveries: DeliveryRepository,
    queue: Arc<JobQueue>,
}

impl EventDispatcher {
    /// Create a new dispatcher over the webhook queue
    pub fn new(pool: PgPool, queue: Arc<JobQueue>) -> Self {
        Self {
            webhooks: WebhookRepository::new(pool.clone()),
            deliveries: DeliveryRepository::new(pool),
            queue,
        }
    }

    /// Fan an event out to its subscribers. Returns how many deliveries
    /// were queued.
    pub async fn fire_event(
        &self,
        event: Event,
        data: serde_json::Value,
        scope: EventScope,
    ) -> Result<u32> {
        let subscribers = self
            .webhooks
            .list_active_for_event(event, scope.user_id)
            .await
            .map_err(|e| mailflow_common::Error::Database(e.to_string()))?;

        let mut queued = 0u32;

        for webhook in subscribers {
            // An empty campaign filter matches everything
            if !webhook.matches_campaign(scope.campaign_id) {
                continue;
            }

            let payload = serde_json::json!({
                "event": event.to_string(),
                "timestamp": Utc::now().to_rfc3339(),
                "data": data,
            });

            let delivery = self
                .deliveries
                .create(webhook.id, &event.to_string(), &payload)
                .await
                .map_err(|e| mailflow_common::Error::Database(e.to_string()))?;

            let job = WebhookJob {
                delivery_id: delivery.id,
                webhook_id: webhook.id,
                campaign_id: scope.campaign_id,
            };

            self.queue
                .enqueue(
                    &job,
                    EnqueueOptions {
                        // Attempt budget covers the first try plus retries
                        max_attempts: Some(webhook.max_retries + 1),
                        idempotency_key: Some(format!("webhook:{}", delivery.id)),
                        ..Default::default()
                    },
                )
                .await?;

            debug!(
                webhook = %webhook.id,
                delivery = %delivery.id,
                event = %event,
                "Webhook delivery queued"
            );
            queued += 1;
        }

        if queued > 0 {
            info!(event = %event, count = queued, "Event fanned out");
        }

        Ok(queued)
    }
}
