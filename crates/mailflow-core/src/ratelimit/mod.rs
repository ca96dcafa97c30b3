//! Rate Limiter - Sliding-window admission control
//!
//! Admission is checked before every SMTP send and webhook call. The shared
//! controller keeps a time-ordered set of recent request timestamps per key
//! in Postgres; prune-count-admit runs as one atomic operation under a
//! per-key advisory lock so concurrent workers cannot race past the limit.
//! When the shared store is unreachable, a bounded in-process window takes
//! over and limits per process instead of failing closed.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Limit over a moving window
#[derive(Debug, Clone, Copy)]
pub struct SlidingWindow {
    pub limit: u32,
    pub window: Duration,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Over the limit; retry after roughly this long
    Limited { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Admission control capability
#[async_trait]
pub trait AdmissionController: Send + Sync {
    /// Check-and-admit as a single operation: prune timestamps older than
    /// the window, count the remainder, and record this request only if it
    /// fits under the limit.
    async fn try_admit(&self, key: &str) -> anyhow::Result<Admission>;
}

/// Shared-store controller backed by Postgres
pub struct PgAdmissionController {
    pool: PgPool,
    window: SlidingWindow,
}

impl PgAdmissionController {
    pub fn new(pool: PgPool, window: SlidingWindow) -> Self {
        Self { pool, window }
    }

    /// Drop event rows older than any plausible window; run periodically
    pub async fn sweep(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.window.window * 2)?;
        let result = sqlx::query("DELETE FROM rate_limit_events WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AdmissionController for PgAdmissionController {
    async fn try_admit(&self, key: &str) -> anyhow::Result<Admission> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(self.window.window)?;

        let mut tx = self.pool.begin().await?;

        // Serialize admissions per key; the lock releases at commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM rate_limit_events WHERE bucket = $1 AND recorded_at < $2")
            .bind(key)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM rate_limit_events WHERE bucket = $1")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;

        if count.0 >= self.window.limit as i64 {
            // Oldest surviving event decides when a slot frees up
            let oldest: (Option<chrono::DateTime<Utc>>,) = sqlx::query_as(
                "SELECT MIN(recorded_at) FROM rate_limit_events WHERE bucket = $1",
            )
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;

            let retry_after = oldest
                .0
                .map(|at| {
                    let free_at = at
                        + chrono::Duration::from_std(self.window.window)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    (free_at - now).to_std().unwrap_or(Duration::from_secs(1))
                })
                .unwrap_or(self.window.window);

            debug!(key, count = count.0, "Rate limit hit");
            return Ok(Admission::Limited { retry_after });
        }

        sqlx::query("INSERT INTO rate_limit_events (bucket, recorded_at) VALUES ($1, $2)")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Admission::Admitted)
    }
}

/// Per-key recent timestamps, bounded overall
struct LocalState {
    windows: HashMap<String, VecDeque<Instant>>,
}

/// In-process fallback controller. Limits per process only.
pub struct LocalAdmissionController {
    window: SlidingWindow,
    state: Mutex<LocalState>,
    /// Keys beyond this bound trigger a sweep of expired windows
    max_keys: usize,
}

impl LocalAdmissionController {
    pub fn new(window: SlidingWindow) -> Self {
        Self {
            window,
            state: Mutex::new(LocalState {
                windows: HashMap::new(),
            }),
            max_keys: 10_000,
        }
    }

    fn try_admit_at(&self, key: &str, now: Instant) -> Admission {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");

        if state.windows.len() >= self.max_keys {
            let window = self.window.window;
            state
                .windows
                .retain(|_, times| times.back().is_some_and(|t| now.duration_since(*t) < window));
        }

        let times = state.windows.entry(key.to_string()).or_default();

        while let Some(front) = times.front() {
            if now.duration_since(*front) >= self.window.window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() >= self.window.limit as usize {
            let retry_after = times
                .front()
                .map(|t| self.window.window - now.duration_since(*t))
                .unwrap_or(self.window.window);
            return Admission::Limited { retry_after };
        }

        times.push_back(now);
        Admission::Admitted
    }
}

#[async_trait]
impl AdmissionController for LocalAdmissionController {
    async fn try_admit(&self, key: &str) -> anyhow::Result<Admission> {
        Ok(self.try_admit_at(key, Instant::now()))
    }
}

/// Shared controller with in-process degradation.
///
/// A store error switches this request to the local window instead of
/// failing closed; the pipeline keeps moving with per-process limiting.
pub struct FallbackAdmission {
    shared: PgAdmissionController,
    local: LocalAdmissionController,
}

impl FallbackAdmission {
    pub fn new(pool: PgPool, window: SlidingWindow) -> Self {
        Self {
            shared: PgAdmissionController::new(pool, window),
            local: LocalAdmissionController::new(window),
        }
    }

    /// Periodic maintenance of the shared store
    pub async fn sweep(&self) -> anyhow::Result<u64> {
        self.shared.sweep().await
    }
}

#[async_trait]
impl AdmissionController for FallbackAdmission {
    async fn try_admit(&self, key: &str) -> anyhow::Result<Admission> {
        match self.shared.try_admit(key).await {
            Ok(admission) => Ok(admission),
            Err(e) => {
                warn!(key, error = %e, "Shared rate-limit store unreachable, using local window");
                self.local.try_admit(key).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_window_admits_up_to_limit() {
        let controller = LocalAdmissionController::new(SlidingWindow::new(3, Duration::from_secs(60)));
        let now = Instant::now();

        assert!(controller.try_admit_at("smtp:a", now).is_admitted());
        assert!(controller.try_admit_at("smtp:a", now).is_admitted());
        assert!(controller.try_admit_at("smtp:a", now).is_admitted());

        // N+1 requests inside the window yield exactly one rejection
        let fourth = controller.try_admit_at("smtp:a", now);
        assert!(matches!(fourth, Admission::Limited { .. }));
    }

    #[test]
    fn test_local_window_resets_after_window() {
        let window = Duration::from_secs(60);
        let controller = LocalAdmissionController::new(SlidingWindow::new(2, window));
        let start = Instant::now();

        assert!(controller.try_admit_at("k", start).is_admitted());
        assert!(controller.try_admit_at("k", start).is_admitted());
        assert!(!controller.try_admit_at("k", start).is_admitted());

        // After the window passes, the full budget is back
        let later = start + window;
        assert!(controller.try_admit_at("k", later).is_admitted());
        assert!(controller.try_admit_at("k", later).is_admitted());
    }

    #[test]
    fn test_local_window_keys_are_independent() {
        let controller = LocalAdmissionController::new(SlidingWindow::new(1, Duration::from_secs(60)));
        let now = Instant::now();

        assert!(controller.try_admit_at("a", now).is_admitted());
        assert!(!controller.try_admit_at("a", now).is_admitted());
        assert!(controller.try_admit_at("b", now).is_admitted());
    }

    #[test]
    fn test_limited_reports_retry_after() {
        let window = Duration::from_secs(60);
        let controller = LocalAdmissionController::new(SlidingWindow::new(1, window));
        let start = Instant::now();

        assert!(controller.try_admit_at("k", start).is_admitted());
        match controller.try_admit_at("k", start + Duration::from_secs(10)) {
            Admission::Limited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(50));
            }
            Admission::Admitted => panic!("expected limited"),
        }
    }
}
