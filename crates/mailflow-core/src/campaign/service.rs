//! Campaign batching service
//!
//! Orchestrates "send this campaign" into bulk-enqueued email jobs using
//! cursor pagination over pending recipients, and exposes the campaign's
//! operational surface: pause/resume/cancel, retry of failed recipients,
//! progress with an ETA, and completion detection.

use chrono::{DateTime, Duration, Utc};
use mailflow_common::types::Event;
use mailflow_storage::models::Campaign;
use mailflow_storage::repository::{CampaignRepository, RecipientCounts, RecipientRepository};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::abtest::QueueAbTestOptions;
use crate::delivery::{EmailJob, SendEmailJob};
use crate::queue::{EnqueueOptions, JobQueue, QueueStats};
use crate::webhook::{EventDispatcher, EventScope};

/// Campaign service errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign not found")]
    NotFound,

    #[error("Campaign is not in a startable status")]
    NotStartable,

    #[error("Campaign is not sending")]
    NotSending,

    #[error("Campaign is not paused")]
    NotPaused,

    #[error("Campaign cannot be cancelled in its current status")]
    NotCancellable,

    #[error("Campaign has no pending recipients")]
    NoPendingRecipients,

    #[error("Batch size must be positive")]
    InvalidBatchSize,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] mailflow_common::Error),
}

/// Options for queueing a campaign
#[derive(Debug, Clone)]
pub struct QueueCampaignOptions {
    /// Recipients per enqueue page
    pub batch_size: i64,
    /// Stagger: page N is held back N x this long
    pub delay_between_batches: Option<Duration>,
    /// Job-level SMTP config override
    pub smtp_config_id: Option<Uuid>,
    pub priority: i32,
}

impl Default for QueueCampaignOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delay_between_batches: None,
            smtp_config_id: None,
            priority: 0,
        }
    }
}

/// Live progress report for a campaign
#[derive(Debug, Clone)]
pub struct CampaignQueueStatus {
    pub campaign_id: Uuid,
    pub status: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub bounced_count: i32,
    pub recipients: RecipientCounts,
    pub queue: QueueStats,
    pub jobs_in_flight: i64,
    pub progress_percent: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Campaign Batching Service
pub struct CampaignService {
    campaigns: CampaignRepository,
    recipients: RecipientRepository,
    queue: Arc<JobQueue>,
    dispatcher: Arc<EventDispatcher>,
}

impl CampaignService {
    /// Create a new campaign service over the email queue
    pub fn new(pool: PgPool, queue: Arc<JobQueue>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            campaigns: CampaignRepository::new(pool.clone()),
            recipients: RecipientRepository::new(pool),
            queue,
            dispatcher,
        }
    }

    /// Queue a campaign: validate, take the single start transition, then
    /// enqueue one job per pending recipient in cursor-paged batches.
    ///
    /// A failure before the first page was enqueued rolls the campaign back
    /// to draft; later failures leave the already-enqueued pages in place.
    pub async fn queue_campaign(
        &self,
        campaign_id: Uuid,
        opts: QueueCampaignOptions,
    ) -> Result<u64, CampaignError> {
        if opts.batch_size <= 0 {
            return Err(CampaignError::InvalidBatchSize);
        }

        let campaign = self
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or(CampaignError::NotFound)?;

        if campaign.status != "draft" && campaign.status != "scheduled" {
            return Err(CampaignError::NotStartable);
        }

        let pending = self.recipients.count_pending(campaign_id).await?;
        if pending == 0 {
            return Err(CampaignError::NoPendingRecipients);
        }

        // Guarded draft/scheduled -> sending; losing the race means someone
        // else started this campaign
        let campaign = self
            .campaigns
            .start(campaign_id, pending as i32)
            .await?
            .ok_or(CampaignError::NotStartable)?;

        info!(
            campaign = %campaign_id,
            recipients = pending,
            "Campaign started"
        );

        match self.enqueue_pending(&campaign, &opts, campaign.retry_epoch).await {
            Ok(enqueued) => {
                self.fire(
                    Event::CampaignStarted,
                    serde_json::json!({
                        "campaign_id": campaign_id,
                        "total_recipients": pending,
                    }),
                    campaign_id,
                )
                .await;
                Ok(enqueued)
            }
            Err((enqueued, e)) => {
                if enqueued == 0 {
                    // Nothing was queued; undo the start transition
                    warn!(campaign = %campaign_id, "Start failed before first batch, rolling back: {}", e);
                    self.campaigns.revert_to_draft(campaign_id).await?;
                } else {
                    warn!(
                        campaign = %campaign_id,
                        enqueued,
                        "Batch enqueue failed partway, earlier batches stay queued: {}", e
                    );
                }
                Err(e)
            }
        }
    }

    /// Cursor-paged enqueue of every pending recipient. Returns the total
    /// enqueued, or the pair (enqueued-so-far, error) on failure.
    async fn enqueue_pending(
        &self,
        campaign: &Campaign,
        opts: &QueueCampaignOptions,
        retry_epoch: i32,
    ) -> Result<u64, (u64, CampaignError)> {
        let job_opts = QueueAbTestOptions {
            priority: opts.priority,
            smtp_config_id: opts.smtp_config_id,
        };

        let mut enqueued = 0u64;
        let mut batch_number = 0i64;
        let mut cursor: Option<Uuid> = None;

        loop {
            let page = self
                .recipients
                .page_pending(campaign.id, cursor, opts.batch_size)
                .await
                .map_err(|e| (enqueued, CampaignError::Database(e)))?;

            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|r| r.id);

            let delay = opts
                .delay_between_batches
                .map(|per_batch| per_batch * batch_number as i32)
                .filter(|d| !d.is_zero());

            let jobs: Vec<(EmailJob, EnqueueOptions)> = page
                .iter()
                .map(|recipient| {
                    let job = SendEmailJob::for_recipient(campaign, recipient, None, &job_opts);
                    let key = job.idempotency_key(retry_epoch);
                    (
                        EmailJob::Send(job),
                        EnqueueOptions {
                            priority: opts.priority,
                            delay,
                            idempotency_key: Some(key),
                            ..Default::default()
                        },
                    )
                })
                .collect();

            let created = self
                .queue
                .enqueue_bulk(jobs)
                .await
                .map_err(|e| (enqueued, CampaignError::Internal(e)))?;

            enqueued += created.len() as u64;
            batch_number += 1;

            info!(
                campaign = %campaign.id,
                batch = batch_number,
                size = created.len(),
                "Batch enqueued"
            );
        }

        Ok(enqueued)
    }

    /// Pause a sending campaign. Workers re-delay its jobs until resumed.
    pub async fn pause_campaign(&self, campaign_id: Uuid) -> Result<Campaign, CampaignError> {
        let campaign = self
            .campaigns
            .pause(campaign_id)
            .await?
            .ok_or(CampaignError::NotSending)?;

        info!(campaign = %campaign_id, "Campaign paused");
        Ok(campaign)
    }

    /// Resume a paused campaign
    pub async fn resume_campaign(&self, campaign_id: Uuid) -> Result<Campaign, CampaignError> {
        let campaign = self
            .campaigns
            .resume(campaign_id)
            .await?
            .ok_or(CampaignError::NotPaused)?;

        info!(campaign = %campaign_id, "Campaign resumed");
        Ok(campaign)
    }

    /// Cancel a campaign: drop its not-yet-started jobs, fail its unsent
    /// recipients with reason "cancelled". In-flight sends finish and
    /// reconcile as late writes.
    pub async fn cancel_campaign(&self, campaign_id: Uuid) -> Result<Campaign, CampaignError> {
        let campaign = self
            .campaigns
            .cancel(campaign_id)
            .await?
            .ok_or(CampaignError::NotCancellable)?;

        let removed = self
            .queue
            .remove_pending_for_campaign(campaign_id)
            .await?;
        let failed = self
            .recipients
            .fail_unsent(campaign_id, "cancelled")
            .await?;

        info!(
            campaign = %campaign_id,
            jobs_removed = removed,
            recipients_failed = failed,
            "Campaign cancelled"
        );

        self.fire(
            Event::CampaignCancelled,
            serde_json::json!({
                "campaign_id": campaign_id,
                "recipients_cancelled": failed,
            }),
            campaign_id,
        )
        .await;

        Ok(campaign)
    }

    /// Reset failed recipients to pending and re-enqueue them under a fresh
    /// retry epoch (so the re-enqueue is not deduplicated away).
    pub async fn retry_failed_recipients(&self, campaign_id: Uuid) -> Result<u64, CampaignError> {
        let campaign = self
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or(CampaignError::NotFound)?;

        if campaign.status != "sending" && campaign.status != "paused" {
            return Err(CampaignError::NotSending);
        }

        let reset = self.recipients.reset_failed(campaign_id).await?;
        if reset == 0 {
            return Ok(0);
        }

        let epoch = self.campaigns.bump_retry_epoch(campaign_id).await?;

        info!(
            campaign = %campaign_id,
            recipients = reset,
            epoch,
            "Retrying failed recipients"
        );

        self.enqueue_pending(&campaign, &QueueCampaignOptions::default(), epoch)
            .await
            .map_err(|(_, e)| e)
    }

    /// Aggregate live queue counts with persisted progress and extrapolate
    /// an ETA from elapsed time per sent email.
    pub async fn get_campaign_queue_status(
        &self,
        campaign_id: Uuid,
    ) -> Result<CampaignQueueStatus, CampaignError> {
        let campaign = self
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or(CampaignError::NotFound)?;

        let recipients = self.recipients.counts(campaign_id).await?;
        let queue = self.queue.stats().await?;
        let jobs_in_flight = self.queue.count_pending_for_campaign(campaign_id).await?;

        let settled = campaign.sent_count + campaign.bounced_count;
        let progress_percent = if campaign.total_recipients > 0 {
            (settled as f64 / campaign.total_recipients as f64) * 100.0
        } else {
            0.0
        };

        let remaining = (campaign.total_recipients - settled).max(0);
        let estimated_completion = if campaign.status == "sending" {
            estimate_completion(
                campaign.started_at,
                Utc::now(),
                campaign.sent_count as i64,
                remaining as i64,
            )
        } else {
            None
        };

        Ok(CampaignQueueStatus {
            campaign_id,
            status: campaign.status,
            total_recipients: campaign.total_recipients,
            sent_count: campaign.sent_count,
            bounced_count: campaign.bounced_count,
            recipients,
            queue,
            jobs_in_flight,
            progress_percent,
            estimated_completion,
        })
    }

    /// Transition sending -> completed once sent + bounced covers every
    /// recipient. Returns true when the transition happened.
    pub async fn check_and_complete_campaign(
        &self,
        campaign_id: Uuid,
    ) -> Result<bool, CampaignError> {
        match self.campaigns.complete(campaign_id).await? {
            Some(campaign) => {
                info!(campaign = %campaign_id, "Campaign completed");
                self.fire(
                    Event::CampaignCompleted,
                    serde_json::json!({
                        "campaign_id": campaign_id,
                        "sent_count": campaign.sent_count,
                        "bounced_count": campaign.bounced_count,
                        "total_recipients": campaign.total_recipients,
                    }),
                    campaign_id,
                )
                .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Best-effort event dispatch
    async fn fire(&self, event: Event, data: serde_json::Value, campaign_id: Uuid) {
        let scope = EventScope {
            campaign_id: Some(campaign_id),
            ..Default::default()
        };
        if let Err(e) = self.dispatcher.fire_event(event, data, scope).await {
            warn!(campaign = %campaign_id, event = %event, "Event dispatch failed: {}", e);
        }
    }
}

/// Extrapolate completion from elapsed time per sent email
pub fn estimate_completion(
    started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    sent: i64,
    remaining: i64,
) -> Option<DateTime<Utc>> {
    let started_at = started_at?;

    if sent <= 0 || remaining <= 0 {
        return None;
    }

    let elapsed = now - started_at;
    if elapsed <= Duration::zero() {
        return None;
    }

    let per_email_ms = elapsed.num_milliseconds() as f64 / sent as f64;
    let remaining_ms = (per_email_ms * remaining as f64).round() as i64;

    Some(now + Duration::milliseconds(remaining_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_extrapolates_elapsed_per_send() {
        let started = Utc::now() - Duration::minutes(10);
        let now = Utc::now();

        // 100 sent in 10 minutes, 50 remaining -> about 5 more minutes
        let eta = estimate_completion(Some(started), now, 100, 50).unwrap();
        let expected = now + Duration::minutes(5);

        assert!((eta - expected).num_seconds().abs() <= 1);
    }

    #[test]
    fn test_estimate_needs_history_and_work() {
        let now = Utc::now();
        let started = now - Duration::minutes(10);

        assert!(estimate_completion(None, now, 100, 50).is_none());
        assert!(estimate_completion(Some(started), now, 0, 50).is_none());
        assert!(estimate_completion(Some(started), now, 100, 0).is_none());
    }
}
