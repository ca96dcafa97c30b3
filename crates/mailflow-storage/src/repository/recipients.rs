//! Recipient repository
//!
//! Recipient status only walks forward (pending -> queued -> sent | failed);
//! every transition here is guarded on the allowed predecessor states so a
//! late-arriving worker write cannot regress a settled recipient.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CreateRecipient, Recipient};

/// Per-status recipient counts for a campaign
#[derive(Debug, Clone, Default)]
pub struct RecipientCounts {
    pub pending: i64,
    pub queued: i64,
    pub sent: i64,
    pub failed: i64,
}

impl RecipientCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.queued + self.sent + self.failed
    }
}

/// Recipient repository
#[derive(Clone)]
pub struct RecipientRepository {
    pool: PgPool,
}

impl RecipientRepository {
    /// Create a new recipient repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a single recipient
    pub async fn create(&self, input: CreateRecipient) -> Result<Recipient, sqlx::Error> {
        let id = Uuid::now_v7();
        let merge_fields = input.merge_fields.unwrap_or_else(|| serde_json::json!({}));

        sqlx::query_as::<_, Recipient>(
            r#"
            INSERT INTO recipients (id, campaign_id, email, name, tracking_id, merge_fields)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.campaign_id)
        .bind(&input.email)
        .bind(&input.name)
        .bind(Uuid::new_v4())
        .bind(&merge_fields)
        .fetch_one(&self.pool)
        .await
    }

    /// Create recipients in batch, skipping duplicate emails per campaign
    pub async fn create_batch(&self, recipients: Vec<CreateRecipient>) -> Result<u64, sqlx::Error> {
        let mut count = 0u64;
        let mut tx = self.pool.begin().await?;

        for input in recipients {
            let id = Uuid::now_v7();
            let merge_fields = input.merge_fields.unwrap_or_else(|| serde_json::json!({}));

            let result = sqlx::query(
                r#"
                INSERT INTO recipients (id, campaign_id, email, name, tracking_id, merge_fields)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (campaign_id, email) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(input.campaign_id)
            .bind(&input.email)
            .bind(&input.name)
            .bind(Uuid::new_v4())
            .bind(&merge_fields)
            .execute(&mut *tx)
            .await?;

            count += result.rows_affected();
        }

        tx.commit().await?;
        Ok(count)
    }

    /// Get a recipient by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<Recipient>, sqlx::Error> {
        sqlx::query_as::<_, Recipient>("SELECT * FROM recipients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Cursor-paged read of pending recipients ordered by id. Pass the last
    /// seen id to get the next page; correct under concurrent mutation,
    /// unlike OFFSET pagination.
    pub async fn page_pending(
        &self,
        campaign_id: Uuid,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Recipient>, sqlx::Error> {
        sqlx::query_as::<_, Recipient>(
            r#"
            SELECT * FROM recipients
            WHERE campaign_id = $1
              AND status = 'pending'
              AND ($2::uuid IS NULL OR id > $2)
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(campaign_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// All pending recipient ids for a campaign, in id order
    pub async fn pending_ids(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, sqlx::Error> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM recipients WHERE campaign_id = $1 AND status = 'pending' ORDER BY id ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// pending/queued -> queued
    pub async fn mark_queued(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET status = 'queued', updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'queued')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// queued/pending -> sent. Returns false when the recipient was already
    /// settled (e.g. the campaign was cancelled while the send was in flight).
    pub async fn mark_sent(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET
                status = 'sent',
                sent_at = NOW(),
                error_message = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'queued')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// queued/pending -> failed with a reason
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET
                status = 'failed',
                error_message = $2,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'queued')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Assign a variant and mark the test group queued in one sweep
    pub async fn assign_variant(
        &self,
        ids: &[Uuid],
        variant_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET
                variant_id = $2,
                status = 'queued',
                updated_at = NOW()
            WHERE id = ANY($1) AND status = 'pending'
            "#,
        )
        .bind(ids)
        .bind(variant_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// The explicit retry operation: failed -> pending, clearing the error
    pub async fn reset_failed(&self, campaign_id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET
                status = 'pending',
                error_message = NULL,
                updated_at = NOW()
            WHERE campaign_id = $1 AND status = 'failed'
            "#,
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fail every not-yet-sent recipient of a cancelled campaign
    pub async fn fail_unsent(&self, campaign_id: Uuid, reason: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET
                status = 'failed',
                error_message = $2,
                updated_at = NOW()
            WHERE campaign_id = $1 AND status IN ('pending', 'queued')
            "#,
        )
        .bind(campaign_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Per-status counts for a campaign
    pub async fn counts(&self, campaign_id: Uuid) -> Result<RecipientCounts, sqlx::Error> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'queued'),
                COUNT(*) FILTER (WHERE status = 'sent'),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM recipients
            WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(RecipientCounts {
            pending: row.0,
            queued: row.1,
            sent: row.2,
            failed: row.3,
        })
    }

    /// Count pending recipients for a campaign
    pub async fn count_pending(&self, campaign_id: Uuid) -> Result<i64, sqlx::Error> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM recipients WHERE campaign_id = $1 AND status = 'pending'",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }
}
