//! Retry delay strategies
//!
//! A strategy maps the attempt number (1-based, the attempt that just
//! failed) to the delay before the next try, so queues can swap curves
//! without touching worker call sites.

use chrono::Duration;

/// Attempt -> delay strategy
pub trait RetryDelay: Send + Sync {
    fn delay_for(&self, attempt: i32) -> Duration;
}

/// Doubling backoff with a cap. Used by the email queue.
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        // Base 1 minute, capped at 4 hours
        Self::new(Duration::minutes(1), Duration::hours(4))
    }
}

impl RetryDelay for ExponentialBackoff {
    fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
        let delay = self.base * 2_i32.pow(exponent);
        delay.min(self.max)
    }
}

/// Literal per-attempt delay table. Attempts beyond the table length reuse
/// the last entry. Used by the webhook queue.
pub struct FixedDelayTable {
    delays: Vec<Duration>,
}

impl FixedDelayTable {
    pub fn new(delays: Vec<Duration>) -> Self {
        assert!(!delays.is_empty(), "delay table must not be empty");
        Self { delays }
    }
}

impl Default for FixedDelayTable {
    fn default() -> Self {
        Self::new(vec![
            Duration::minutes(1),
            Duration::minutes(5),
            Duration::minutes(30),
        ])
    }
}

impl RetryDelay for FixedDelayTable {
    fn delay_for(&self, attempt: i32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.delay_for(1), Duration::minutes(1));
        assert_eq!(backoff.delay_for(2), Duration::minutes(2));
        assert_eq!(backoff.delay_for(3), Duration::minutes(4));
        assert_eq!(backoff.delay_for(4), Duration::minutes(8));
        // Capped at 4 hours
        assert_eq!(backoff.delay_for(12), Duration::hours(4));
    }

    #[test]
    fn test_exponential_backoff_zero_attempt() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.delay_for(0), Duration::minutes(1));
    }

    #[test]
    fn test_fixed_table() {
        let table = FixedDelayTable::default();
        assert_eq!(table.delay_for(1), Duration::minutes(1));
        assert_eq!(table.delay_for(2), Duration::minutes(5));
        assert_eq!(table.delay_for(3), Duration::minutes(30));
    }

    #[test]
    fn test_fixed_table_reuses_last_entry() {
        let table = FixedDelayTable::default();
        assert_eq!(table.delay_for(4), Duration::minutes(30));
        assert_eq!(table.delay_for(99), Duration::minutes(30));
    }
}
