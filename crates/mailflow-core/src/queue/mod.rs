//! Durable Job Queue - Persistent, priority-ordered, at-least-once job store

mod retry;

pub use retry::{ExponentialBackoff, FixedDelayTable, RetryDelay};

use chrono::{Duration, Utc};
use mailflow_common::{Error, Result};
use mailflow_storage::models::{Job, NewJob};
use mailflow_storage::repository::{JobRepository, JobState};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

/// Default attempt budget per job
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Options for enqueueing a job
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs first within the due set
    pub priority: i32,
    /// Hold the job back this long before it becomes claimable
    pub delay: Option<Duration>,
    /// Stable business key; a duplicate key is a no-op, not a second job
    pub idempotency_key: Option<String>,
    /// Override of the default attempt budget
    pub max_attempts: Option<i32>,
}

/// Per-state counts for a queue
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// A named handle over the shared durable job store.
///
/// The email and webhook pipelines each hold their own `JobQueue`; both
/// share the same table and primitives, isolated by queue name. Jobs survive
/// worker crashes, and re-enqueueing under an existing idempotency key never
/// creates a duplicate logical job.
#[derive(Clone)]
pub struct JobQueue {
    name: String,
    repo: JobRepository,
}

impl JobQueue {
    /// Create a handle for the named queue
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repo: JobRepository::new(pool),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job. Returns the job id, or None when the idempotency key
    /// already exists.
    pub async fn enqueue<T: Serialize>(
        &self,
        payload: &T,
        opts: EnqueueOptions,
    ) -> Result<Option<Uuid>> {
        let job = self.build_job(payload, &opts)?;
        let id = self
            .repo
            .insert(&self.name, job)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;

        if id.is_none() {
            debug!(queue = %self.name, key = ?opts.idempotency_key, "Skipped duplicate job");
        }

        Ok(id)
    }

    /// Enqueue a page of jobs in one transaction. Duplicates by idempotency
    /// key are skipped silently; returns the ids actually created.
    pub async fn enqueue_bulk<T: Serialize>(
        &self,
        payloads: Vec<(T, EnqueueOptions)>,
    ) -> Result<Vec<Uuid>> {
        let mut jobs = Vec::with_capacity(payloads.len());
        for (payload, opts) in &payloads {
            jobs.push(self.build_job(payload, opts)?);
        }

        let created = self
            .repo
            .insert_batch(&self.name, jobs)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;

        debug!(
            queue = %self.name,
            requested = payloads.len(),
            created = created.len(),
            "Bulk enqueue"
        );

        Ok(created)
    }

    fn build_job<T: Serialize>(&self, payload: &T, opts: &EnqueueOptions) -> Result<NewJob> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| Error::Queue(format!("Unserializable job payload: {}", e)))?;

        let scheduled_at = match opts.delay {
            Some(delay) => Utc::now() + delay,
            None => Utc::now(),
        };

        Ok(NewJob {
            payload,
            priority: opts.priority,
            max_attempts: opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            idempotency_key: opts.idempotency_key.clone(),
            scheduled_at,
        })
    }

    /// Atomically claim up to `limit` due jobs, marking them active.
    /// Returns nothing while the queue is paused.
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<Job>> {
        if self
            .repo
            .is_paused(&self.name)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?
        {
            return Ok(Vec::new());
        }

        self.repo
            .claim_due(&self.name, limit)
            .await
            .map_err(|e| Error::Queue(e.to_string()))
    }

    /// Get a job by id
    pub async fn job(&self, id: Uuid) -> Result<Option<Job>> {
        self.repo.get(id).await.map_err(|e| Error::Queue(e.to_string()))
    }

    /// Per-state counts
    pub async fn stats(&self) -> Result<QueueStats> {
        let counts = self
            .repo
            .counts(&self.name)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;

        Ok(QueueStats {
            waiting: counts.waiting,
            delayed: counts.delayed,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
        })
    }

    /// Mark a claimed job completed
    pub async fn complete(&self, id: Uuid) -> Result<()> {
        self.repo
            .mark_completed(id)
            .await
            .map_err(|e| Error::Queue(e.to_string()))
    }

    /// Settle a failed attempt: reschedule via the retry strategy while the
    /// attempt budget lasts, otherwise mark the job terminally failed.
    /// Returns true when the job will run again.
    pub async fn fail_attempt(
        &self,
        job: &Job,
        error: &str,
        delays: &dyn RetryDelay,
    ) -> Result<bool> {
        if job.attempts + 1 < job.max_attempts {
            let delay = delays.delay_for(job.attempts + 1);
            let at = Utc::now() + delay;
            self.repo
                .reschedule(job.id, error, at)
                .await
                .map_err(|e| Error::Queue(e.to_string()))?;
            debug!(queue = %self.name, job = %job.id, attempt = job.attempts + 1, "Retry scheduled");
            Ok(true)
        } else {
            self.repo
                .mark_failed(job.id, error)
                .await
                .map_err(|e| Error::Queue(e.to_string()))?;
            Ok(false)
        }
    }

    /// Mark a claimed job terminally failed regardless of remaining budget.
    /// For configuration-class errors a retry cannot fix.
    pub async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        self.repo
            .mark_failed(id, error)
            .await
            .map_err(|e| Error::Queue(e.to_string()))
    }

    /// Push a claimed job back out without consuming an attempt
    pub async fn push_back(&self, id: Uuid, delay: Duration) -> Result<()> {
        self.repo
            .push_back(id, Utc::now() + delay)
            .await
            .map_err(|e| Error::Queue(e.to_string()))
    }

    /// Refresh the heartbeat on a claimed job
    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        self.repo
            .heartbeat(id)
            .await
            .map_err(|e| Error::Queue(e.to_string()))
    }

    /// Requeue jobs whose worker stopped heartbeating; each stall consumes
    /// an attempt so silent loss shows up as a failed job, not nothing.
    pub async fn requeue_stalled(&self, stalled_after: Duration) -> Result<u64> {
        let n = self
            .repo
            .requeue_stalled(&self.name, stalled_after)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;

        if n > 0 {
            info!(queue = %self.name, count = n, "Requeued stalled jobs");
        }

        Ok(n)
    }

    /// Remove a job that has not started
    pub async fn remove_job(&self, id: Uuid) -> Result<bool> {
        self.repo.remove(id).await.map_err(|e| Error::Queue(e.to_string()))
    }

    /// Reset a failed job for a fresh run
    pub async fn retry_job(&self, id: Uuid) -> Result<bool> {
        self.repo.retry(id).await.map_err(|e| Error::Queue(e.to_string()))
    }

    /// Stop handing out jobs
    pub async fn pause(&self) -> Result<()> {
        info!(queue = %self.name, "Queue paused");
        self.repo
            .set_paused(&self.name, true)
            .await
            .map_err(|e| Error::Queue(e.to_string()))
    }

    /// Resume handing out jobs
    pub async fn resume(&self) -> Result<()> {
        info!(queue = %self.name, "Queue resumed");
        self.repo
            .set_paused(&self.name, false)
            .await
            .map_err(|e| Error::Queue(e.to_string()))
    }

    /// Drop every waiting and delayed job
    pub async fn drain(&self) -> Result<u64> {
        let n = self
            .repo
            .drain(&self.name)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;
        info!(queue = %self.name, count = n, "Queue drained");
        Ok(n)
    }

    /// Delete settled job records to bound storage: completed jobs after a
    /// short retention, failed jobs after a long one.
    pub async fn cleanup(
        &self,
        completed_retention: Duration,
        failed_retention: Duration,
    ) -> Result<u64> {
        let now = Utc::now();
        let completed = self
            .repo
            .cleanup(&self.name, JobState::Completed, now - completed_retention)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;
        let failed = self
            .repo
            .cleanup(&self.name, JobState::Failed, now - failed_retention)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;

        Ok(completed + failed)
    }

    /// Not-yet-settled job count for a campaign
    pub async fn count_pending_for_campaign(&self, campaign_id: Uuid) -> Result<i64> {
        self.repo
            .count_pending_for_campaign(&self.name, campaign_id)
            .await
            .map_err(|e| Error::Queue(e.to_string()))
    }

    /// Remove every not-yet-started job for a campaign; in-flight jobs run
    /// to completion and reconcile against recipient state afterwards.
    pub async fn remove_pending_for_campaign(&self, campaign_id: Uuid) -> Result<u64> {
        self.repo
            .remove_pending_for_campaign(&self.name, campaign_id)
            .await
            .map_err(|e| Error::Queue(e.to_string()))
    }
}
