//! Webhook Worker - Consumes delivery jobs and performs the HTTP calls

use chrono::Utc;
use mailflow_storage::repository::{DeliveryRepository, WebhookRepository};
use mailflow_storage::SecretCipher;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{debug, error, info, warn};

use super::auth::WebhookAuth;
use super::dispatcher::WebhookJob;
use super::sender::WebhookSender;
use crate::delivery::{WorkerState, WorkerStatus};
use crate::queue::{FixedDelayTable, JobQueue, RetryDelay};
use crate::ratelimit::{Admission, AdmissionController};

/// Webhook Worker
pub struct WebhookWorker {
    queue: Arc<JobQueue>,
    webhooks: WebhookRepository,
    deliveries: DeliveryRepository,
    sender: Arc<WebhookSender>,
    cipher: SecretCipher,
    admission: Arc<dyn AdmissionController>,
    delays: Arc<FixedDelayTable>,
    state: Arc<WorkerState>,
    concurrency: usize,
    batch_size: i64,
    poll_interval_secs: u64,
    stalled_after_secs: i64,
    completed_retention: chrono::Duration,
    failed_retention: chrono::Duration,
}

impl WebhookWorker {
    /// Create a new webhook worker
    pub fn new(
        pool: PgPool,
        queue: Arc<JobQueue>,
        sender: Arc<WebhookSender>,
        cipher: SecretCipher,
        admission: Arc<dyn AdmissionController>,
    ) -> Self {
        Self {
            queue,
            webhooks: WebhookRepository::new(pool.clone()),
            deliveries: DeliveryRepository::new(pool),
            sender,
            cipher,
            admission,
            delays: Arc::new(FixedDelayTable::default()),
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

    /// Swap the retry delay table
    pub fn with_delays(mut self, delays: FixedDelayTable) -> Self {
        self.delays = Arc::new(delays);
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

    /// Run the delivery loop
    pub async fn run(&self) {
        let mut ticker = interval(TokioDuration::from_secs(self.poll_interval_secs));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        info!(
            concurrency = self.concurrency,
            batch = self.batch_size,
            interval = self.poll_interval_secs,
            "Webhook worker started"
        );

        while self.state.is_running() {
            ticker.tick().await;

            if self.state.is_paused() {
                continue;
            }

            if let Err(e) = self.maintenance().await {
                warn!("Webhook queue maintenance error: {}", e);
            }

            if let Err(e) = self.process_batch(&semaphore).await {
                error!("Error processing webhook jobs: {}", e);
            }
        }

        info!("Webhook worker stopped");
    }

    async fn maintenance(&self) -> anyhow::Result<()> {
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

        debug!(count = jobs.len(), "Processing webhook jobs");

        let mut handles = Vec::new();

        for job in jobs {
            let permit = semaphore.clone().acquire_owned().await?;
            let worker = self.clone_refs();
            let state = Arc::clone(&self.state);

            let handle = tokio::spawn(async move {
                state.job_started();
                worker.process_job(job).await;
                state.job_finished();
                drop(permit);
            });

            handles.push(handle);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Webhook task panicked: {}", e);
            }
        }

        Ok(())
    }

    fn clone_refs(&self) -> WorkerRefs {
        WorkerRefs {
            queue: Arc::clone(&self.queue),
            webhooks: self.webhooks.clone(),
            deliveries: self.deliveries.clone(),
            sender: Arc::clone(&self.sender),
            cipher: self.cipher.clone(),
            admission: Arc::clone(&self.admission),
            delays: Arc::clone(&self.delays),
        }
    }
}

/// The per-task slice of the worker
struct WorkerRefs {
    queue: Arc<JobQueue>,
    webhooks: WebhookRepository,
    deliveries: DeliveryRepository,
    sender: Arc<WebhookSender>,
    cipher: SecretCipher,
    admission: Arc<dyn AdmissionController>,
    delays: Arc<FixedDelayTable>,
}

impl WorkerRefs {
    async fn process_job(&self, job: mailflow_storage::models::Job) {
        let payload: WebhookJob = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                error!(job = %job.id, "Unparseable webhook job payload: {}", e);
                let _ = self.queue.fail(job.id, &format!("bad payload: {}", e)).await;
                return;
            }
        };

        if let Err(e) = self.deliver(&job, &payload).await {
            error!(job = %job.id, delivery = %payload.delivery_id, "Webhook job error: {}", e);
            let _ = self
                .queue
                .fail_attempt(&job, &e.to_string(), self.delays.as_ref())
                .await;
        }
    }

    async fn deliver(
        &self,
        job: &mailflow_storage::models::Job,
        payload: &WebhookJob,
    ) -> anyhow::Result<()> {
        let Some(delivery) = self.deliveries.get(payload.delivery_id).await? else {
            warn!(delivery = %payload.delivery_id, "Delivery row missing, dropping job");
            self.queue.fail(job.id, "delivery row missing").await?;
            return Ok(());
        };

        // Already settled: a duplicate or manually retried job raced us
        if delivery
            .status_enum()
            .map(|s| s.is_terminal())
            .unwrap_or(false)
        {
            self.queue.complete(job.id).await?;
            return Ok(());
        }

        let Some(webhook) = self.webhooks.get(payload.webhook_id).await? else {
            self.deliveries
                .mark_failed(delivery.id, "webhook deleted", None)
                .await?;
            self.queue.complete(job.id).await?;
            return Ok(());
        };

        if !webhook.is_active {
            self.deliveries
                .mark_failed(delivery.id, "webhook disabled", None)
                .await?;
            self.queue.complete(job.id).await?;
            return Ok(());
        }

        // Admission gate; a rejection re-delays without consuming an attempt
        match self
            .admission
            .try_admit(&format!("webhook:{}", webhook.id))
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
                warn!(webhook = %webhook.id, "Admission check failed, proceeding: {}", e);
            }
        }

        // Decrypt the credential just-in-time for the call
        let credential = match &webhook.auth_value {
            Some(encrypted) => match self.cipher.decrypt(encrypted) {
                Ok(plain) => Some(plain),
                Err(e) => {
                    self.deliveries
                        .mark_failed(delivery.id, &format!("credential decryption failed: {}", e), None)
                        .await?;
                    self.queue
                        .fail(job.id, "credential decryption failed")
                        .await?;
                    return Ok(());
                }
            },
            None => None,
        };

        let auth = match WebhookAuth::from_parts(
            &webhook.auth_type,
            webhook.auth_header.as_deref(),
            credential.as_deref(),
        ) {
            Ok(auth) => auth,
            Err(e) => {
                // Configuration error: terminal, never retried
                self.deliveries
                    .mark_failed(delivery.id, &e.to_string(), None)
                    .await?;
                self.queue.fail(job.id, &e.to_string()).await?;
                return Ok(());
            }
        };

        let Some(delivery) = self.deliveries.mark_processing(delivery.id).await? else {
            // Another worker claimed it
            self.queue.complete(job.id).await?;
            return Ok(());
        };

        let timeout = StdDuration::from_secs(webhook.timeout_secs.max(1) as u64);
        let response = self
            .sender
            .deliver(&webhook.url, &delivery.payload, &auth, timeout)
            .await;

        let status_code = response.status.map(|s| s as i32);

        if response.is_success() {
            self.deliveries
                .mark_delivered(
                    delivery.id,
                    status_code.unwrap_or(200),
                    response.body.as_deref(),
                )
                .await?;
            self.queue.complete(job.id).await?;

            info!(
                delivery = %delivery.id,
                webhook = %webhook.id,
                attempts = delivery.attempts,
                "Webhook delivered"
            );
            return Ok(());
        }

        let reason = response.failure_reason();

        // attempts was just incremented by mark_processing; the budget is
        // the first try plus max_retries
        if delivery.attempts > webhook.max_retries {
            self.deliveries
                .mark_failed(delivery.id, &reason, status_code)
                .await?;
            self.queue.fail(job.id, &reason).await?;

            warn!(
                delivery = %delivery.id,
                webhook = %webhook.id,
                attempts = delivery.attempts,
                "Webhook delivery exhausted retries: {}", reason
            );
        } else {
            let delay = self.delays.delay_for(delivery.attempts);
            self.deliveries
                .mark_retrying(delivery.id, &reason, status_code, Utc::now() + delay)
                .await?;
            self.queue.fail_attempt(job, &reason, self.delays.as_ref()).await?;

            debug!(
                delivery = %delivery.id,
                attempt = delivery.attempts,
                delay_secs = delay.num_seconds(),
                "Webhook delivery rescheduled: {}", reason
            );
        }

        Ok(())
    }
}
