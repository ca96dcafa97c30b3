//! A/B test executor
//!
//! Splits a campaign's recipients into variant test groups, queues the test
//! sends, tracks per-variant engagement, and promotes the winner. Winner
//! selection is scheduled as a delayed job on the email queue so the
//! schedule survives process restarts.

use chrono::Duration;
use mailflow_common::types::{Event, WinnerCriteria};
use mailflow_storage::models::{AbTest, AbTestVariant, Campaign, Recipient};
use mailflow_storage::repository::{
    AbTestRepository, CampaignRepository, RecipientRepository, VariantCounter,
};
use rand::thread_rng;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::split::split_recipients;
use crate::delivery::{EmailJob, SendEmailJob};
use crate::queue::{EnqueueOptions, JobQueue};
use crate::webhook::{EventDispatcher, EventScope};

/// Page size for bulk enqueues
const ENQUEUE_PAGE: usize = 500;

/// Minimum and maximum variant counts for a runnable test
const MIN_VARIANTS: usize = 2;
const MAX_VARIANTS: usize = 5;

/// A/B executor errors
#[derive(Error, Debug)]
pub enum AbTestError {
    #[error("A/B test not found")]
    TestNotFound,

    #[error("Campaign not found")]
    CampaignNotFound,

    #[error("Variant not found")]
    VariantNotFound,

    #[error("A/B test is not in draft status")]
    NotDraft,

    #[error("A/B test is not running")]
    NotRunning,

    #[error("A/B test is not completed or has no winner")]
    NoWinner,

    #[error("A/B test requires between {MIN_VARIANTS} and {MAX_VARIANTS} variants, got {0}")]
    InvalidVariantCount(usize),

    #[error("Sample size percent must be between 1 and 100, got {0}")]
    InvalidSamplePercent(i32),

    #[error("Campaign is not in a startable status")]
    CampaignNotStartable,

    #[error("Campaign has no pending recipients")]
    NoPendingRecipients,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] mailflow_common::Error),
}

/// Options for launching an A/B test campaign
#[derive(Debug, Clone, Default)]
pub struct QueueAbTestOptions {
    pub priority: i32,
    pub smtp_config_id: Option<Uuid>,
}

/// Variant performance snapshot
#[derive(Debug, Clone)]
pub struct VariantResult {
    pub variant: AbTestVariant,
    pub open_rate: f64,
    pub click_rate: f64,
    pub conversion_rate: f64,
}

/// Full test results
#[derive(Debug, Clone)]
pub struct AbTestResults {
    pub test: AbTest,
    pub variants: Vec<VariantResult>,
}

/// A/B Test Executor
pub struct AbTestExecutor {
    campaigns: CampaignRepository,
    recipients: RecipientRepository,
    tests: AbTestRepository,
    queue: Arc<JobQueue>,
    dispatcher: Arc<EventDispatcher>,
}

impl AbTestExecutor {
    /// Create a new executor over the email queue
    pub fn new(pool: PgPool, queue: Arc<JobQueue>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            campaigns: CampaignRepository::new(pool.clone()),
            recipients: RecipientRepository::new(pool.clone()),
            tests: AbTestRepository::new(pool),
            queue,
            dispatcher,
        }
    }

    /// Launch an A/B test: split pending recipients, queue the test-group
    /// sends with each variant's content, and schedule winner selection.
    pub async fn queue_ab_test_campaign(
        &self,
        campaign_id: Uuid,
        opts: QueueAbTestOptions,
    ) -> Result<AbTest, AbTestError> {
        let campaign = self
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or(AbTestError::CampaignNotFound)?;

        if campaign.status != "draft" && campaign.status != "scheduled" {
            return Err(AbTestError::CampaignNotStartable);
        }

        let test = self
            .tests
            .get_by_campaign(campaign_id)
            .await?
            .ok_or(AbTestError::TestNotFound)?;

        if test.status != "draft" {
            return Err(AbTestError::NotDraft);
        }
        if !(1..=100).contains(&test.sample_size_percent) {
            return Err(AbTestError::InvalidSamplePercent(test.sample_size_percent));
        }

        let variants = self.tests.variants(test.id).await?;
        if !(MIN_VARIANTS..=MAX_VARIANTS).contains(&variants.len()) {
            return Err(AbTestError::InvalidVariantCount(variants.len()));
        }

        let pending = self.load_pending(campaign_id).await?;
        if pending.is_empty() {
            return Err(AbTestError::NoPendingRecipients);
        }

        // Single valid start transition; a second launch loses the race here
        let campaign = self
            .campaigns
            .start(campaign_id, pending.len() as i32)
            .await?
            .ok_or(AbTestError::CampaignNotStartable)?;

        let test = self
            .tests
            .start(test.id)
            .await?
            .ok_or(AbTestError::NotDraft)?;

        let variant_ids: Vec<Uuid> = variants.iter().map(|v| v.id).collect();
        let plan = split_recipients(
            pending.iter().map(|r| r.id).collect(),
            test.sample_size_percent,
            &variant_ids,
            &mut thread_rng(),
        );

        info!(
            campaign = %campaign_id,
            test = %test.id,
            total = pending.len(),
            test_group = plan.test_group_size(),
            remainder = plan.remainder.len(),
            "A/B split computed"
        );

        // Index for id -> row lookups when building jobs
        let by_id: std::collections::HashMap<Uuid, &Recipient> =
            pending.iter().map(|r| (r.id, r)).collect();

        for (variant_id, group) in &plan.assignments {
            let variant = variants
                .iter()
                .find(|v| v.id == *variant_id)
                .ok_or(AbTestError::VariantNotFound)?;

            self.recipients.assign_variant(group, *variant_id).await?;

            let jobs: Vec<(EmailJob, EnqueueOptions)> = group
                .iter()
                .filter_map(|id| by_id.get(id))
                .map(|recipient| {
                    let job =
                        SendEmailJob::for_recipient(&campaign, recipient, Some(variant), &opts);
                    let key = job.idempotency_key(campaign.retry_epoch);
                    (
                        EmailJob::Send(job),
                        EnqueueOptions {
                            priority: opts.priority,
                            idempotency_key: Some(key),
                            ..Default::default()
                        },
                    )
                })
                .collect();

            for page in jobs.chunks(ENQUEUE_PAGE) {
                self.queue.enqueue_bulk(page.to_vec()).await?;
            }
        }

        if test.auto_select_winner {
            self.queue
                .enqueue(
                    &EmailJob::SelectAbWinner { test_id: test.id },
                    EnqueueOptions {
                        delay: Some(Duration::hours(test.test_duration_hours as i64)),
                        idempotency_key: Some(format!("abwinner:{}", test.id)),
                        ..Default::default()
                    },
                )
                .await?;

            info!(
                test = %test.id,
                hours = test.test_duration_hours,
                "Winner selection scheduled"
            );
        }

        Ok(test)
    }

    /// Record an engagement event against a variant counter
    pub async fn record_event(
        &self,
        variant_id: Uuid,
        counter: VariantCounter,
    ) -> Result<(), AbTestError> {
        self.tests.increment_counter(variant_id, counter).await?;
        Ok(())
    }

    /// Current per-variant rates
    pub async fn get_results(&self, test_id: Uuid) -> Result<AbTestResults, AbTestError> {
        let test = self.tests.get(test_id).await?.ok_or(AbTestError::TestNotFound)?;
        let variants = self.tests.variants(test_id).await?;

        let variants = variants
            .into_iter()
            .map(|variant| VariantResult {
                open_rate: variant.rate_for(WinnerCriteria::OpenRate),
                click_rate: variant.rate_for(WinnerCriteria::ClickRate),
                conversion_rate: variant.rate_for(WinnerCriteria::ConversionRate),
                variant,
            })
            .collect();

        Ok(AbTestResults { test, variants })
    }

    /// Pick the winner by the configured criterion and complete the test.
    /// Refuses unless the test is still running, which makes a second call
    /// a no-op instead of a winner change.
    pub async fn select_winner(&self, test_id: Uuid) -> Result<(AbTest, Uuid), AbTestError> {
        let test = self.tests.get(test_id).await?.ok_or(AbTestError::TestNotFound)?;

        if test.status != "running" {
            return Err(AbTestError::NotRunning);
        }

        let criteria = test.criteria_enum().unwrap_or(WinnerCriteria::OpenRate);
        let variants = self.tests.variants(test_id).await?;

        // Highest rate wins; ties keep the earlier variant in encounter order
        let mut winner = variants
            .first()
            .ok_or(AbTestError::InvalidVariantCount(0))?;
        for candidate in &variants[1..] {
            if candidate.rate_for(criteria) > winner.rate_for(criteria) {
                winner = candidate;
            }
        }

        let test = self
            .tests
            .complete_with_winner(test_id, winner.id)
            .await?
            .ok_or(AbTestError::NotRunning)?;

        info!(
            test = %test_id,
            winner = %winner.id,
            criteria = %criteria,
            "A/B winner selected"
        );

        let fired = self
            .dispatcher
            .fire_event(
                Event::AbWinnerSelected,
                serde_json::json!({
                    "test_id": test_id,
                    "campaign_id": test.campaign_id,
                    "winner_id": winner.id,
                    "criteria": criteria.to_string(),
                }),
                EventScope {
                    campaign_id: Some(test.campaign_id),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = fired {
            warn!(test = %test_id, "Winner event dispatch failed: {}", e);
        }

        Ok((test, winner.id))
    }

    /// The scheduled winner-selection path: pick the winner, then release
    /// the held-back remainder with the winning content.
    pub async fn auto_select_winner(&self, test_id: Uuid) -> Result<(), AbTestError> {
        let (_, winner_id) = self.select_winner(test_id).await?;
        let released = self.send_to_remaining_recipients(test_id).await?;

        info!(
            test = %test_id,
            winner = %winner_id,
            released,
            "Remainder released to winner content"
        );
        Ok(())
    }

    /// Queue the held-back remainder with the winner's content. Remainder
    /// recipients stay untagged so variant counters keep measuring only the
    /// test group.
    pub async fn send_to_remaining_recipients(&self, test_id: Uuid) -> Result<u64, AbTestError> {
        let test = self.tests.get(test_id).await?.ok_or(AbTestError::TestNotFound)?;

        if test.status != "completed" {
            return Err(AbTestError::NoWinner);
        }
        let winner_id = test.winner_id.ok_or(AbTestError::NoWinner)?;
        let winner = self
            .tests
            .variant(winner_id)
            .await?
            .ok_or(AbTestError::VariantNotFound)?;

        let campaign = self
            .campaigns
            .get(test.campaign_id)
            .await?
            .ok_or(AbTestError::CampaignNotFound)?;

        let opts = QueueAbTestOptions {
            smtp_config_id: campaign.smtp_config_id,
            ..Default::default()
        };

        let mut released = 0u64;
        let mut cursor: Option<Uuid> = None;

        loop {
            let page = self
                .recipients
                .page_pending(campaign.id, cursor, ENQUEUE_PAGE as i64)
                .await?;

            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|r| r.id);

            let jobs: Vec<(EmailJob, EnqueueOptions)> = page
                .iter()
                .map(|recipient| {
                    let job =
                        SendEmailJob::for_recipient(&campaign, recipient, Some(&winner), &opts);
                    let key = job.idempotency_key(campaign.retry_epoch);
                    (
                        EmailJob::Send(job),
                        EnqueueOptions {
                            idempotency_key: Some(key),
                            ..Default::default()
                        },
                    )
                })
                .collect();

            released += self.queue.enqueue_bulk(jobs).await?.len() as u64;
        }

        Ok(released)
    }

    async fn load_pending(&self, campaign_id: Uuid) -> Result<Vec<Recipient>, AbTestError> {
        let mut all = Vec::new();
        let mut cursor: Option<Uuid> = None;

        loop {
            let page = self
                .recipients
                .page_pending(campaign_id, cursor, 1000)
                .await?;

            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|r| r.id);
            all.extend(page);
        }

        Ok(all)
    }
}

impl SendEmailJob {
    /// Build a send job for one recipient, applying variant content
    /// overrides with per-field fallback to the campaign defaults.
    pub fn for_recipient(
        campaign: &Campaign,
        recipient: &Recipient,
        variant: Option<&AbTestVariant>,
        opts: &QueueAbTestOptions,
    ) -> Self {
        let subject = variant
            .and_then(|v| v.subject.clone())
            .unwrap_or_else(|| campaign.subject.clone());
        let from_name = variant
            .and_then(|v| v.from_name.clone())
            .or_else(|| campaign.from_name.clone());
        let html_body = variant
            .and_then(|v| v.html_body.clone())
            .or_else(|| campaign.html_body.clone());
        let text_body = variant
            .and_then(|v| v.text_body.clone())
            .or_else(|| campaign.text_body.clone());

        SendEmailJob {
            campaign_id: campaign.id,
            recipient_id: recipient.id,
            email: recipient.email.clone(),
            subject,
            from_address: campaign.from_address.clone(),
            from_name,
            reply_to: campaign.reply_to.clone(),
            html_body,
            text_body,
            merge_fields: recipient.merge_fields.clone(),
            tracking_id: recipient.tracking_id,
            smtp_config_id: opts.smtp_config_id.or(campaign.smtp_config_id),
            variant_id: variant.map(|v| v.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn campaign() -> Campaign {
        Campaign {
            id: Uuid::new_v4(),
            name: "launch".to_string(),
            subject: "Default subject".to_string(),
            from_address: "news@example.com".to_string(),
            from_name: Some("News".to_string()),
            reply_to: None,
            html_body: Some("<p>default</p>".to_string()),
            text_body: Some("default".to_string()),
            status: "draft".to_string(),
            total_recipients: 0,
            sent_count: 0,
            bounced_count: 0,
            retry_epoch: 0,
            smtp_config_id: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn recipient(campaign_id: Uuid) -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            campaign_id,
            email: "ada@example.com".to_string(),
            name: None,
            status: "pending".to_string(),
            variant_id: None,
            tracking_id: Uuid::new_v4(),
            merge_fields: serde_json::json!({}),
            error_message: None,
            sent_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn variant(test_id: Uuid, subject: Option<&str>) -> AbTestVariant {
        AbTestVariant {
            id: Uuid::new_v4(),
            test_id,
            name: "B".to_string(),
            subject: subject.map(|s| s.to_string()),
            from_name: None,
            html_body: None,
            text_body: None,
            sent_count: 0,
            opened_count: 0,
            clicked_count: 0,
            converted_count: 0,
            bounced_count: 0,
            sort_order: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_variant_override_wins() {
        let campaign = campaign();
        let recipient = recipient(campaign.id);
        let variant = variant(Uuid::new_v4(), Some("Variant subject"));

        let job = SendEmailJob::for_recipient(
            &campaign,
            &recipient,
            Some(&variant),
            &QueueAbTestOptions::default(),
        );

        assert_eq!(job.subject, "Variant subject");
        // Unset variant fields fall back to the campaign
        assert_eq!(job.html_body.as_deref(), Some("<p>default</p>"));
        assert_eq!(job.from_name.as_deref(), Some("News"));
        assert_eq!(job.variant_id, Some(variant.id));
    }

    #[test]
    fn test_no_variant_uses_campaign_content() {
        let campaign = campaign();
        let recipient = recipient(campaign.id);

        let job = SendEmailJob::for_recipient(
            &campaign,
            &recipient,
            None,
            &QueueAbTestOptions::default(),
        );

        assert_eq!(job.subject, "Default subject");
        assert_eq!(job.variant_id, None);
        assert_eq!(job.tracking_id, recipient.tracking_id);
    }
}
