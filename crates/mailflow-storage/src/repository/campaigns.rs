//! Campaign repository
//!
//! Lifecycle transitions are expressed as guarded updates so concurrent
//! callers cannot double-start or resurrect a settled campaign.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Campaign, CreateCampaign};

/// Campaign repository
#[derive(Clone)]
pub struct CampaignRepository {
    pool: PgPool,
}

impl CampaignRepository {
    /// Create a new campaign repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new campaign in draft
    pub async fn create(&self, input: CreateCampaign) -> Result<Campaign, sqlx::Error> {
        let id = Uuid::new_v4();
        let metadata = input.metadata.unwrap_or_else(|| serde_json::json!({}));

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, name, subject, from_address, from_name, reply_to,
                html_body, text_body, smtp_config_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.subject)
        .bind(&input.from_address)
        .bind(&input.from_name)
        .bind(&input.reply_to)
        .bind(&input.html_body)
        .bind(&input.text_body)
        .bind(input.smtp_config_id)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await
    }

    /// Get a campaign by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// The single valid start transition: draft/scheduled -> sending.
    /// Returns None when the campaign was already started (or is missing).
    pub async fn start(&self, id: Uuid, total_recipients: i32) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = 'sending',
                total_recipients = $2,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('draft', 'scheduled')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(total_recipients)
        .fetch_optional(&self.pool)
        .await
    }

    /// sending -> paused
    pub async fn pause(&self, id: Uuid) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET status = 'paused', updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// paused -> sending
    pub async fn resume(&self, id: Uuid) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET status = 'sending', updated_at = NOW()
            WHERE id = $1 AND status = 'paused'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// sending/paused/scheduled -> cancelled
    pub async fn cancel(&self, id: Uuid) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = 'cancelled',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'sending', 'paused')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// sending -> completed, only once every recipient is settled
    pub async fn complete(&self, id: Uuid) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = 'completed',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'sending'
              AND sent_count + bounced_count >= total_recipients
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Roll a failed start back to draft before any job was queued
    pub async fn revert_to_draft(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                status = 'draft',
                started_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump the retry epoch, returning the new value
    pub async fn bump_retry_epoch(&self, id: Uuid) -> Result<i32, sqlx::Error> {
        let row: (i32,) = sqlx::query_as(
            r#"
            UPDATE campaigns SET retry_epoch = retry_epoch + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING retry_epoch
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Count one more delivered recipient
    pub async fn increment_sent(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE campaigns SET sent_count = sent_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count one more terminally failed recipient
    pub async fn increment_bounced(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE campaigns SET bounced_count = bounced_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Campaigns currently marked sending
    pub async fn list_sending(&self) -> Result<Vec<Campaign>, sqlx::Error> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE status = 'sending'")
            .fetch_all(&self.pool)
            .await
    }
}
