//! Webhook delivery repository

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::WebhookDelivery;

/// Delivery status counts over a trailing window
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    pub pending: i64,
    pub processing: i64,
    pub delivered: i64,
    pub failed: i64,
    pub retrying: i64,
}

impl DeliveryStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.delivered + self.failed + self.retrying
    }
}

/// Webhook delivery repository
#[derive(Clone)]
pub struct DeliveryRepository {
    pool: PgPool,
}

impl DeliveryRepository {
    /// Create a new delivery repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pending delivery with its payload snapshot
    pub async fn create(
        &self,
        webhook_id: Uuid,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<WebhookDelivery, sqlx::Error> {
        let id = Uuid::now_v7();

        sqlx::query_as::<_, WebhookDelivery>(
            r#"
            INSERT INTO webhook_deliveries (id, webhook_id, event, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(webhook_id)
        .bind(event)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
    }

    /// Get a delivery by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<WebhookDelivery>, sqlx::Error> {
        sqlx::query_as::<_, WebhookDelivery>("SELECT * FROM webhook_deliveries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// pending/retrying -> processing, consuming an attempt.
    /// Returns the updated row, or None if another worker got there first.
    pub async fn mark_processing(&self, id: Uuid) -> Result<Option<WebhookDelivery>, sqlx::Error> {
        sqlx::query_as::<_, WebhookDelivery>(
            r#"
            UPDATE webhook_deliveries SET
                status = 'processing',
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'retrying')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// processing -> delivered
    pub async fn mark_delivered(
        &self,
        id: Uuid,
        status_code: i32,
        response_body: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries SET
                status = 'delivered',
                status_code = $2,
                response_body = $3,
                error = NULL,
                delivered_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(status_code)
        .bind(response_body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// processing -> retrying with the next attempt time
    pub async fn mark_retrying(
        &self,
        id: Uuid,
        error: &str,
        status_code: Option<i32>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries SET
                status = 'retrying',
                error = $2,
                status_code = $3,
                next_attempt_at = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(status_code)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// processing -> failed, terminal
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        status_code: Option<i32>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries SET
                status = 'failed',
                error = $2,
                status_code = $3,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('processing', 'pending', 'retrying')
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(status_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The manual retry operation: failed -> pending with a fresh budget
    pub async fn reset_for_retry(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries SET
                status = 'pending',
                attempts = 0,
                error = NULL,
                status_code = NULL,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Status counts for a webhook over a trailing window
    pub async fn stats(
        &self,
        webhook_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<DeliveryStats, sqlx::Error> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'processing'),
                COUNT(*) FILTER (WHERE status = 'delivered'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COUNT(*) FILTER (WHERE status = 'retrying')
            FROM webhook_deliveries
            WHERE webhook_id = $1 AND created_at >= $2
            "#,
        )
        .bind(webhook_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(DeliveryStats {
            pending: row.0,
            processing: row.1,
            delivered: row.2,
            failed: row.3,
            retrying: row.4,
        })
    }

    /// Recent deliveries for a webhook
    pub async fn list_recent(
        &self,
        webhook_id: Uuid,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, sqlx::Error> {
        sqlx::query_as::<_, WebhookDelivery>(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE webhook_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(webhook_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}
