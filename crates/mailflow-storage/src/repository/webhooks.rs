//! Webhook repository

use mailflow_common::types::{Event, UserId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CreateWebhook, UpdateWebhook, Webhook};

/// Webhook repository
#[derive(Clone)]
pub struct WebhookRepository {
    pool: PgPool,
}

impl WebhookRepository {
    /// Create a new webhook repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a webhook
    pub async fn create(&self, input: CreateWebhook) -> Result<Webhook, sqlx::Error> {
        let id = Uuid::new_v4();
        let events = serde_json::to_value(
            input.events.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        )
        .unwrap_or_default();
        let campaign_filter = serde_json::to_value(&input.campaign_filter).unwrap_or_default();

        sqlx::query_as::<_, Webhook>(
            r#"
            INSERT INTO webhooks (
                id, user_id, name, url, events, auth_type, auth_header,
                auth_value, timeout_secs, max_retries, campaign_filter
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.user_id)
        .bind(&input.name)
        .bind(&input.url)
        .bind(&events)
        .bind(&input.auth_type)
        .bind(&input.auth_header)
        .bind(&input.auth_value)
        .bind(input.timeout_secs)
        .bind(input.max_retries)
        .bind(&campaign_filter)
        .fetch_one(&self.pool)
        .await
    }

    /// Get a webhook by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<Webhook>, sqlx::Error> {
        sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Update a webhook; None fields keep their current value
    pub async fn update(
        &self,
        id: Uuid,
        input: UpdateWebhook,
    ) -> Result<Option<Webhook>, sqlx::Error> {
        let events = input.events.map(|evs| {
            serde_json::to_value(evs.iter().map(|e| e.to_string()).collect::<Vec<_>>())
                .unwrap_or_default()
        });
        let campaign_filter = input
            .campaign_filter
            .map(|f| serde_json::to_value(f).unwrap_or_default());

        sqlx::query_as::<_, Webhook>(
            r#"
            UPDATE webhooks SET
                name = COALESCE($2, name),
                url = COALESCE($3, url),
                events = COALESCE($4, events),
                auth_type = COALESCE($5, auth_type),
                auth_header = COALESCE($6, auth_header),
                auth_value = COALESCE($7, auth_value),
                timeout_secs = COALESCE($8, timeout_secs),
                max_retries = COALESCE($9, max_retries),
                campaign_filter = COALESCE($10, campaign_filter),
                is_active = COALESCE($11, is_active),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.url)
        .bind(&events)
        .bind(&input.auth_type)
        .bind(&input.auth_header)
        .bind(&input.auth_value)
        .bind(input.timeout_secs)
        .bind(input.max_retries)
        .bind(&campaign_filter)
        .bind(input.is_active)
        .fetch_optional(&self.pool)
        .await
    }

    /// Delete a webhook (and, via cascade, its deliveries)
    pub async fn delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Active webhooks subscribed to an event, optionally scoped to an owner.
    /// Campaign filtering happens in the caller via `Webhook::matches_campaign`.
    pub async fn list_active_for_event(
        &self,
        event: Event,
        user_id: Option<UserId>,
    ) -> Result<Vec<Webhook>, sqlx::Error> {
        let event_json = serde_json::json!([event.to_string()]);

        match user_id {
            Some(uid) => {
                sqlx::query_as::<_, Webhook>(
                    r#"
                    SELECT * FROM webhooks
                    WHERE is_active = TRUE
                      AND events @> $1
                      AND user_id = $2
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(&event_json)
                .bind(uid)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Webhook>(
                    r#"
                    SELECT * FROM webhooks
                    WHERE is_active = TRUE
                      AND events @> $1
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(&event_json)
                .fetch_all(&self.pool)
                .await
            }
        }
    }
}
