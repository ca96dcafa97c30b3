//! Job repository
//!
//! Backing store for the durable queues. All transitions are single guarded
//! statements so that concurrent workers never double-claim or resurrect a
//! job another worker already settled.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Job, NewJob};

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-state job counts for a queue
#[derive(Debug, Clone, Default)]
pub struct JobCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Job repository
#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    /// Create a new job repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a job. Returns None when the idempotency key already exists.
    pub async fn insert(&self, queue: &str, job: NewJob) -> Result<Option<Uuid>, sqlx::Error> {
        let id = Uuid::now_v7();
        let status = if job.scheduled_at > Utc::now() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO jobs (
                id, queue, payload, status, priority, attempts, max_attempts,
                idempotency_key, scheduled_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, NOW())
            ON CONFLICT (queue, idempotency_key) WHERE idempotency_key IS NOT NULL
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(&job.payload)
        .bind(status.as_str())
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(&job.idempotency_key)
        .bind(job.scheduled_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Insert a page of jobs in one transaction. Returns ids of the jobs
    /// actually created (idempotency-key duplicates are skipped, not errors).
    pub async fn insert_batch(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        let mut created = Vec::with_capacity(jobs.len());
        let mut tx = self.pool.begin().await?;

        for job in jobs {
            let id = Uuid::now_v7();
            let status = if job.scheduled_at > Utc::now() {
                JobState::Delayed
            } else {
                JobState::Waiting
            };

            let row: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO jobs (
                    id, queue, payload, status, priority, attempts, max_attempts,
                    idempotency_key, scheduled_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, NOW())
                ON CONFLICT (queue, idempotency_key) WHERE idempotency_key IS NOT NULL
                DO NOTHING
                RETURNING id
                "#,
            )
            .bind(id)
            .bind(queue)
            .bind(&job.payload)
            .bind(status.as_str())
            .bind(job.priority)
            .bind(job.max_attempts)
            .bind(&job.idempotency_key)
            .bind(job.scheduled_at)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((id,)) = row {
                created.push(id);
            }
        }

        tx.commit().await?;
        Ok(created)
    }

    /// Atomically claim due jobs: select under SKIP LOCKED and flip them to
    /// active in the same statement, so no two workers get the same job.
    pub async fn claim_due(&self, queue: &str, limit: i64) -> Result<Vec<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = 'active',
                started_at = NOW(),
                heartbeat_at = NOW()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue = $1
                  AND status IN ('waiting', 'delayed')
                  AND scheduled_at <= NOW()
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Get a job by id
    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Mark a job completed
    pub async fn mark_completed(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'completed', completed_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a job terminally failed
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'failed',
                attempts = attempts + 1,
                last_error = $2,
                completed_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Consume an attempt and push the job back out for a later retry
    pub async fn reschedule(
        &self,
        id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'delayed',
                attempts = attempts + 1,
                last_error = $2,
                scheduled_at = $3,
                heartbeat_at = NULL
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Push an active job back out without consuming an attempt (rate-limit
    /// rejection, paused campaign)
    pub async fn push_back(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'delayed',
                scheduled_at = $2,
                heartbeat_at = NULL
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh the heartbeat on an active job
    pub async fn heartbeat(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET heartbeat_at = NOW() WHERE id = $1 AND status = 'active'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Requeue active jobs whose worker stopped heartbeating. Each stall
    /// consumes an attempt; jobs out of budget are failed instead of lost.
    pub async fn requeue_stalled(
        &self,
        queue: &str,
        stalled_after: Duration,
    ) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - stalled_after;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = CASE
                    WHEN attempts + 1 < max_attempts THEN 'waiting'
                    ELSE 'failed'
                END,
                attempts = attempts + 1,
                last_error = 'worker stalled',
                heartbeat_at = NULL,
                completed_at = CASE
                    WHEN attempts + 1 < max_attempts THEN NULL
                    ELSE NOW()
                END
            WHERE queue = $1
              AND status = 'active'
              AND heartbeat_at < $2
            "#,
        )
        .bind(queue)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Remove a job that has not started yet
    pub async fn remove(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE id = $1 AND status IN ('waiting', 'delayed', 'failed')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reset a failed job back to waiting with a fresh attempt budget
    pub async fn retry(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'waiting',
                attempts = 0,
                last_error = NULL,
                scheduled_at = NOW(),
                started_at = NULL,
                heartbeat_at = NULL,
                completed_at = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Per-state counts for a queue
    pub async fn counts(&self, queue: &str) -> Result<JobCounts, sqlx::Error> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'waiting'),
                COUNT(*) FILTER (WHERE status = 'delayed'),
                COUNT(*) FILTER (WHERE status = 'active'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM jobs
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobCounts {
            waiting: row.0,
            delayed: row.1,
            active: row.2,
            completed: row.3,
            failed: row.4,
        })
    }

    /// Pending (not yet started) job count for a campaign on a queue
    pub async fn count_pending_for_campaign(
        &self,
        queue: &str,
        campaign_id: Uuid,
    ) -> Result<i64, sqlx::Error> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE queue = $1
              AND status IN ('waiting', 'delayed', 'active')
              AND payload ->> 'campaign_id' = $2
            "#,
        )
        .bind(queue)
        .bind(campaign_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    /// Delete all not-yet-started jobs for a campaign. In-flight (active)
    /// jobs are left to finish and reconcile against recipient state.
    pub async fn remove_pending_for_campaign(
        &self,
        queue: &str,
        campaign_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = $1
              AND status IN ('waiting', 'delayed')
              AND payload ->> 'campaign_id' = $2
            "#,
        )
        .bind(queue)
        .bind(campaign_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete settled job records older than the cutoff
    pub async fn cleanup(
        &self,
        queue: &str,
        state: JobState,
        older_than: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = $1 AND status = $2 AND completed_at < $3
            "#,
        )
        .bind(queue)
        .bind(state.as_str())
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete all waiting and delayed jobs on a queue
    pub async fn drain(&self, queue: &str) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE queue = $1 AND status IN ('waiting', 'delayed')")
                .bind(queue)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    /// Set the paused flag for a queue
    pub async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO queue_control (queue, paused, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (queue)
            DO UPDATE SET paused = $2, updated_at = NOW()
            "#,
        )
        .bind(queue)
        .bind(paused)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether a queue is paused
    pub async fn is_paused(&self, queue: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT paused FROM queue_control WHERE queue = $1")
                .bind(queue)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(p,)| p).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_strings() {
        assert_eq!(JobState::Waiting.to_string(), "waiting");
        assert_eq!(JobState::Delayed.as_str(), "delayed");
        assert_eq!(JobState::Failed.as_str(), "failed");
    }
}
