//! Email worker pool
//!
//! Each claimed job walks the state machine: received -> rendering ->
//! sending -> sent | retry-scheduled | failed. The worker consults campaign
//! status before acting, resolves the SMTP configuration, renders content
//! with tracking, gates on the rate limiter, and records the outcome with
//! guarded recipient transitions. Webhook dispatch is fire-and-forget: a
//! notification failure never fails the email job.

use mailflow_common::types::Event;
use mailflow_storage::models::Job;
use mailflow_storage::repository::{
    AbTestRepository, CampaignRepository, RecipientRepository, SmtpConfigRepository,
    VariantCounter,
};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};

use super::{EmailJob, SendEmailJob, WorkerState, WorkerStatus};
use crate::abtest::{AbTestError, AbTestExecutor};
use crate::queue::{ExponentialBackoff, JobQueue, RetryDelay};
use crate::ratelimit::{Admission, AdmissionController};
use crate::render::ContentRenderer;
use crate::smtp::{OutboundEmail, TransportError, TransportFactory};
use crate::webhook::{EventDispatcher, EventScope};

/// Delay in seconds before re-checking a job whose campaign is paused
const PAUSED_RECHECK_SECS: i64 = 60;

/// Email Worker
pub struct EmailWorker {
    queue: Arc<JobQueue>,
    campaigns: CampaignRepository,
    recipients: RecipientRepository,
    smtp_configs: SmtpConfigRepository,
    ab_tests: AbTestRepository,
    executor: Arc<AbTestExecutor>,
    dispatcher: Arc<EventDispatcher>,
    renderer: Arc<ContentRenderer>,
    admission: Arc<dyn AdmissionController>,
    transports: Arc<dyn TransportFactory>,
    backoff: Arc<ExponentialBackoff>,
    state: Arc<WorkerState>,
    concurrency: usize,
    batch_size: i64,
    poll_interval_secs: u64,
    stalled_after_secs: i64,
    completed_retention: chrono::Duration,
    failed_retention: chrono::Duration,
}

impl EmailWorker {
    /// Create a new email worker
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        queue: Arc<JobQueue>,
        executor: Arc<AbTestExecutor>,
        dispatcher: Arc<EventDispatcher>,
        admission: Arc<dyn AdmissionController>,
        transports: Arc<dyn TransportFactory>,
        tracking_base_url: &str,
    ) -> Self {
        Self {
            queue,
            campaigns: CampaignRepository::new(pool.clone()),
            recipients: RecipientRepository::new(pool.clone()),
            smtp_configs: SmtpConfigRepository::new(pool.clone()),
            ab_tests: AbTestRepository::new(pool),
            executor,
            dispatcher,
            renderer: Arc::new(ContentRenderer::new(tracking_base_url)),
            admission,
            transports,
            backoff: Arc::new(ExponentialBackoff::default()),
            state: Arc::new(WorkerState::new()),
            concurrency: 10,
            batch_size: 100,
            poll_interval_secs: 5,
            stalled_after_secs: 120,
            completed_retention: chrono::Duration::hours(24),
            failed_retention: chrono::Duration::days(14),
        }
    }

    /// Set concurrency limit
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit;
        self
    }

    /// Set claim batch size
    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size;
        self
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Set the stalled-job cutoff
    pub fn with_stalled_after(mut self, secs: i64) -> Self {
        self.stalled_after_secs = secs;
        self
    }

    /// Set retention windows for settled job records
    pub fn with_retention(
        mut self,
        completed: chrono::Duration,
        failed: chrono::Duration,
    ) -> Self {
        self.completed_retention = completed;
        self.failed_retention = failed;
        self
    }

    /// Worker control handle
    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.state)
    }

    /// Worker status snapshot
    pub fn status(&self) -> WorkerStatus {
        self.state.status()
    }

    /// Run the consume loop
    pub async fn run(&self) {
        let mut ticker = interval(TokioDuration::from_secs(self.poll_interval_secs));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        info!(
            concurrency = self.concurrency,
            batch = self.batch_size,
            interval = self.poll_interval_secs,
            "Email worker started"
        );

        while self.state.is_running() {
            ticker.tick().await;

            if self.state.is_paused() {
                continue;
            }

            if let Err(e) = self.maintenance().await {
                warn!("Email queue maintenance error: {}", e);
            }

            if let Err(e) = self.process_batch(&semaphore).await {
                error!("Error processing email jobs: {}", e);
            }
        }

        info!("Email worker stopped");
    }

    async fn maintenance(&self) -> anyhow::Result<()> {
        // A worker that stops heartbeating counts as a failed attempt
        self.queue
            .requeue_stalled(chrono::Duration::seconds(self.stalled_after_secs))
            .await?;
        self.queue
            .cleanup(self.completed_retention, self.failed_retention)
            .await?;
        Ok(())
    }

    async fn process_batch(&self, semaphore: &Arc<Semaphore>) -> anyhow::Result<()> {
        let jobs = self.queue.claim_due(self.batch_size).await?;

        if jobs.is_empty() {
            return Ok(());
        }

        debug!(count = jobs.len(), "Processing email jobs");

        let mut handles = Vec::new();

        for job in jobs {
            let permit = semaphore.clone().acquire_owned().await?;
            let task = self.task_refs();
            let state = Arc::clone(&self.state);

            let handle = tokio::spawn(async move {
                state.job_started();
                task.process_job(job).await;
                state.job_finished();
                drop(permit);
            });

            handles.push(handle);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Email task panicked: {}", e);
            }
        }

        Ok(())
    }

    fn task_refs(&self) -> TaskRefs {
        TaskRefs {
            queue: Arc::clone(&self.queue),
            campaigns: self.campaigns.clone(),
            recipients: self.recipients.clone(),
            smtp_configs: self.smtp_configs.clone(),
            ab_tests: self.ab_tests.clone(),
            executor: Arc::clone(&self.executor),
            dispatcher: Arc::clone(&self.dispatcher),
            renderer: Arc::clone(&self.renderer),
            admission: Arc::clone(&self.admission),
            transports: Arc::clone(&self.transports),
            backoff: Arc::clone(&self.backoff),
        }
    }
}

/// The per-task slice of the worker
struct TaskRefs {
    queue: Arc<JobQueue>,
    campaigns: CampaignRepository,
    recipients: RecipientRepository,
    smtp_configs: SmtpConfigRepository,
    ab_tests: AbTestRepository,
    executor: Arc<AbTestExecutor>,
    dispatcher: Arc<EventDispatcher>,
    renderer: Arc<ContentRenderer>,
    admission: Arc<dyn AdmissionController>,
    transports: Arc<dyn TransportFactory>,
    backoff: Arc<ExponentialBackoff>,
}

impl TaskRefs {
    async fn process_job(&self, job: Job) {
        let payload: EmailJob = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                error!(job = %job.id, "Unparseable email job payload: {}", e);
                let _ = self.queue.fail(job.id, &format!("bad payload: {}", e)).await;
                return;
            }
        };

        let _ = self.queue.heartbeat(job.id).await;

        match payload {
            EmailJob::Send(send) => {
                if let Err(e) = self.process_send(&job, &send).await {
                    error!(job = %job.id, recipient = %send.recipient_id, "Send job error: {}", e);
                    let _ = self
                        .queue
                        .fail_attempt(&job, &e.to_string(), self.backoff.as_ref())
                        .await;
                }
            }
            EmailJob::SelectAbWinner { test_id } => {
                match self.executor.auto_select_winner(test_id).await {
                    Ok(()) => {
                        let _ = self.queue.complete(job.id).await;
                    }
                    // Already selected (or cancelled): the schedule fired
                    // twice, which is a no-op by design
                    Err(AbTestError::NotRunning) => {
                        debug!(test = %test_id, "Winner already selected, dropping job");
                        let _ = self.queue.complete(job.id).await;
                    }
                    Err(e) => {
                        error!(test = %test_id, "Winner selection failed: {}", e);
                        let _ = self
                            .queue
                            .fail_attempt(&job, &e.to_string(), self.backoff.as_ref())
                            .await;
                    }
                }
            }
        }
    }

    async fn process_send(&self, job: &Job, send: &SendEmailJob) -> anyhow::Result<()> {
        let Some(campaign) = self.campaigns.get(send.campaign_id).await? else {
            self.queue.fail(job.id, "campaign missing").await?;
            return Ok(());
        };

        // Only jobs of a sending campaign may act
        match campaign.status.as_str() {
            "sending" => {}
            "paused" => {
                self.queue
                    .push_back(job.id, chrono::Duration::seconds(PAUSED_RECHECK_SECS))
                    .await?;
                return Ok(());
            }
            _ => {
                // Cancelled or otherwise settled while queued; the cancel
                // path already settled the recipient
                debug!(
                    job = %job.id,
                    campaign = %campaign.id,
                    status = %campaign.status,
                    "Dropping job for non-sending campaign"
                );
                self.queue.complete(job.id).await?;
                return Ok(());
            }
        }

        if !self.recipients.mark_queued(send.recipient_id).await? {
            // Recipient already settled; treat as a legitimate late pass
            self.queue.complete(job.id).await?;
            return Ok(());
        }

        // Configuration errors are fatal, never retried
        let Some(smtp_config) = self.smtp_configs.resolve(send.smtp_config_id).await? else {
            self.finalize_failure(job, send, "no active SMTP configuration")
                .await?;
            return Ok(());
        };

        // Admission gate before the send; a rejection re-delays the job
        // without consuming an attempt
        match self
            .admission
            .try_admit(&format!("smtp:{}", smtp_config.id))
            .await
        {
            Ok(Admission::Admitted) => {}
            Ok(Admission::Limited { retry_after }) => {
                let delay = chrono::Duration::from_std(retry_after)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1))
                    .max(chrono::Duration::seconds(1));
                self.queue.push_back(job.id, delay).await?;
                return Ok(());
            }
            Err(e) => {
                warn!(job = %job.id, "Admission check failed, proceeding: {}", e);
            }
        }

        // Render: merge fields, click rewriting, tracking pixel
        let subject = self
            .renderer
            .render_subject(&send.subject, &send.email, &send.merge_fields);
        let html = send.html_body.as_ref().map(|body| {
            self.renderer
                .render_html(body, &send.email, &send.merge_fields, send.tracking_id)
        });
        let text = send
            .text_body
            .as_ref()
            .map(|body| self.renderer.render_text(body, &send.email, &send.merge_fields));

        let email = OutboundEmail {
            from: send.sender(),
            to: send.email.clone(),
            reply_to: send.reply_to.clone(),
            subject,
            html,
            text,
        };

        let transport = match self.transports.transport_for(&smtp_config) {
            Ok(t) => t,
            Err(TransportError::Permanent(e)) => {
                self.finalize_failure(job, send, &e).await?;
                return Ok(());
            }
            Err(TransportError::Transient(e)) => {
                self.retry_or_fail(job, send, &e).await?;
                return Ok(());
            }
        };

        match transport.send(&email).await {
            Ok(outcome) => {
                self.finalize_success(job, send, &outcome.message_id).await?;
            }
            Err(TransportError::Transient(e)) => {
                self.retry_or_fail(job, send, &e).await?;
            }
            Err(TransportError::Permanent(e)) => {
                self.finalize_failure(job, send, &e).await?;
            }
        }

        Ok(())
    }

    async fn finalize_success(
        &self,
        job: &Job,
        send: &SendEmailJob,
        message_id: &str,
    ) -> anyhow::Result<()> {
        let recorded = self.recipients.mark_sent(send.recipient_id).await?;

        if recorded {
            self.campaigns.increment_sent(send.campaign_id).await?;

            if let Some(variant_id) = send.variant_id {
                self.ab_tests
                    .increment_counter(variant_id, VariantCounter::Sent)
                    .await?;
            }

            self.fire_event(
                Event::EmailSent,
                serde_json::json!({
                    "campaign_id": send.campaign_id,
                    "recipient_id": send.recipient_id,
                    "email": send.email,
                    "tracking_id": send.tracking_id,
                    "variant_id": send.variant_id,
                    "message_id": message_id,
                }),
                send,
            )
            .await;

            self.try_complete_campaign(send).await;
        } else {
            // The campaign was cancelled while this send was in flight; the
            // SMTP side went through, the recipient record stays as the
            // cancel path left it
            debug!(
                recipient = %send.recipient_id,
                "Late send completion after recipient settled"
            );
        }

        self.queue.complete(job.id).await?;
        info!(
            campaign = %send.campaign_id,
            recipient = %send.recipient_id,
            "Email sent"
        );
        Ok(())
    }

    /// Transient failure: reschedule while the budget lasts, settle the
    /// recipient on the final attempt
    async fn retry_or_fail(
        &self,
        job: &Job,
        send: &SendEmailJob,
        error: &str,
    ) -> anyhow::Result<()> {
        let will_retry = self
            .queue
            .fail_attempt(job, error, self.backoff.as_ref())
            .await?;

        if will_retry {
            debug!(
                recipient = %send.recipient_id,
                attempt = job.attempts + 1,
                "Send failed, retry scheduled: {}", error
            );
            return Ok(());
        }

        // Budget exhausted: the job is already failed, settle the recipient
        self.settle_recipient_failed(send, error).await
    }

    /// Fatal failure: fail the job immediately and settle the recipient
    async fn finalize_failure(
        &self,
        job: &Job,
        send: &SendEmailJob,
        error: &str,
    ) -> anyhow::Result<()> {
        self.queue.fail(job.id, error).await?;
        self.settle_recipient_failed(send, error).await
    }

    async fn settle_recipient_failed(
        &self,
        send: &SendEmailJob,
        error: &str,
    ) -> anyhow::Result<()> {
        let recorded = self.recipients.mark_failed(send.recipient_id, error).await?;

        if recorded {
            self.campaigns.increment_bounced(send.campaign_id).await?;

            if let Some(variant_id) = send.variant_id {
                self.ab_tests
                    .increment_counter(variant_id, VariantCounter::Bounced)
                    .await?;
            }

            self.fire_event(
                Event::EmailBounced,
                serde_json::json!({
                    "campaign_id": send.campaign_id,
                    "recipient_id": send.recipient_id,
                    "email": send.email,
                    "variant_id": send.variant_id,
                    "error": error,
                }),
                send,
            )
            .await;

            self.try_complete_campaign(send).await;
        }

        warn!(
            campaign = %send.campaign_id,
            recipient = %send.recipient_id,
            "Email terminally failed: {}", error
        );
        Ok(())
    }

    /// Fire-and-forget webhook dispatch; failures log and move on
    async fn fire_event(&self, event: Event, data: serde_json::Value, send: &SendEmailJob) {
        let scope = EventScope {
            campaign_id: Some(send.campaign_id),
            ..Default::default()
        };

        if let Err(e) = self.dispatcher.fire_event(event, data, scope).await {
            warn!(
                campaign = %send.campaign_id,
                event = %event,
                "Webhook dispatch failed (ignored): {}", e
            );
        }
    }

    /// Settle the campaign once every recipient has a terminal outcome
    async fn try_complete_campaign(&self, send: &SendEmailJob) {
        match self.campaigns.complete(send.campaign_id).await {
            Ok(Some(campaign)) => {
                info!(campaign = %campaign.id, "Campaign completed");
                let scope = EventScope {
                    campaign_id: Some(campaign.id),
                    ..Default::default()
                };
                let data = serde_json::json!({
                    "campaign_id": campaign.id,
                    "sent_count": campaign.sent_count,
                    "bounced_count": campaign.bounced_count,
                    "total_recipients": campaign.total_recipients,
                });
                if let Err(e) = self
                    .dispatcher
                    .fire_event(Event::CampaignCompleted, data, scope)
                    .await
                {
                    warn!(campaign = %campaign.id, "Completion event dispatch failed: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(campaign = %send.campaign_id, "Completion check failed: {}", e);
            }
        }
    }
}
