//! A/B test repository
//!
//! The winner transition happens at most once: `complete_with_winner` is
//! guarded on `status = 'running' AND winner_id IS NULL`, so a second caller
//! observes zero affected rows instead of overwriting the winner.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AbTest, AbTestVariant, CreateAbTest, CreateVariant};

/// Which variant counter to bump for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantCounter {
    Sent,
    Opened,
    Clicked,
    Converted,
    Bounced,
}

/// A/B test repository
#[derive(Clone)]
pub struct AbTestRepository {
    pool: PgPool,
}

impl AbTestRepository {
    /// Create a new A/B test repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a test in draft
    pub async fn create(&self, input: CreateAbTest) -> Result<AbTest, sqlx::Error> {
        let id = Uuid::new_v4();

        sqlx::query_as::<_, AbTest>(
            r#"
            INSERT INTO ab_tests (
                id, campaign_id, sample_size_percent, winner_criteria,
                test_duration_hours, auto_select_winner
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.campaign_id)
        .bind(input.sample_size_percent)
        .bind(input.winner_criteria.to_string())
        .bind(input.test_duration_hours)
        .bind(input.auto_select_winner)
        .fetch_one(&self.pool)
        .await
    }

    /// Add a variant. Only drafts can gain variants.
    pub async fn add_variant(&self, input: CreateVariant) -> Result<AbTestVariant, sqlx::Error> {
        let id = Uuid::new_v4();

        sqlx::query_as::<_, AbTestVariant>(
            r#"
            INSERT INTO ab_test_variants (
                id, test_id, name, subject, from_name, html_body, text_body, sort_order
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8
            WHERE EXISTS (SELECT 1 FROM ab_tests WHERE id = $2 AND status = 'draft')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.test_id)
        .bind(&input.name)
        .bind(&input.subject)
        .bind(&input.from_name)
        .bind(&input.html_body)
        .bind(&input.text_body)
        .bind(input.sort_order)
        .fetch_one(&self.pool)
        .await
    }

    /// Get a test by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<AbTest>, sqlx::Error> {
        sqlx::query_as::<_, AbTest>("SELECT * FROM ab_tests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Get the test attached to a campaign
    pub async fn get_by_campaign(&self, campaign_id: Uuid) -> Result<Option<AbTest>, sqlx::Error> {
        sqlx::query_as::<_, AbTest>("SELECT * FROM ab_tests WHERE campaign_id = $1")
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Variants in encounter (sort) order
    pub async fn variants(&self, test_id: Uuid) -> Result<Vec<AbTestVariant>, sqlx::Error> {
        sqlx::query_as::<_, AbTestVariant>(
            "SELECT * FROM ab_test_variants WHERE test_id = $1 ORDER BY sort_order ASC, created_at ASC",
        )
        .bind(test_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Get a single variant
    pub async fn variant(&self, variant_id: Uuid) -> Result<Option<AbTestVariant>, sqlx::Error> {
        sqlx::query_as::<_, AbTestVariant>("SELECT * FROM ab_test_variants WHERE id = $1")
            .bind(variant_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// draft -> running, once
    pub async fn start(&self, id: Uuid) -> Result<Option<AbTest>, sqlx::Error> {
        sqlx::query_as::<_, AbTest>(
            r#"
            UPDATE ab_tests SET
                status = 'running',
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'draft'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// running -> completed with a winner, exactly once
    pub async fn complete_with_winner(
        &self,
        id: Uuid,
        winner_id: Uuid,
    ) -> Result<Option<AbTest>, sqlx::Error> {
        sqlx::query_as::<_, AbTest>(
            r#"
            UPDATE ab_tests SET
                status = 'completed',
                winner_id = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND winner_id IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(winner_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Bump a monotonic variant counter
    pub async fn increment_counter(
        &self,
        variant_id: Uuid,
        counter: VariantCounter,
    ) -> Result<(), sqlx::Error> {
        let sql = match counter {
            VariantCounter::Sent => {
                "UPDATE ab_test_variants SET sent_count = sent_count + 1, updated_at = NOW() WHERE id = $1"
            }
            VariantCounter::Opened => {
                "UPDATE ab_test_variants SET opened_count = opened_count + 1, updated_at = NOW() WHERE id = $1"
            }
            VariantCounter::Clicked => {
                "UPDATE ab_test_variants SET clicked_count = clicked_count + 1, updated_at = NOW() WHERE id = $1"
            }
            VariantCounter::Converted => {
                "UPDATE ab_test_variants SET converted_count = converted_count + 1, updated_at = NOW() WHERE id = $1"
            }
            VariantCounter::Bounced => {
                "UPDATE ab_test_variants SET bounced_count = bounced_count + 1, updated_at = NOW() WHERE id = $1"
            }
        };

        sqlx::query(sql).bind(variant_id).execute(&self.pool).await?;
        Ok(())
    }
}
