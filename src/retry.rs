//! Retry Policy
//!
//! A precomputed table of increasing waits. The first attempt is always
//! immediate; wait `n` is slept before attempt `n + 1`.

use std::time::Duration;

pub const DEFAULT_RETRIES: usize = 3;
pub const DEFAULT_FIRST_WAIT: Duration = Duration::from_secs(1);
pub const DEFAULT_WAIT_STEP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
}

impl RetryPolicy {
    /// Build the table `first, first + step, first + 2 * step, ...`
    pub fn linear(retries: usize, first: Duration, step: Duration) -> Self {
        let mut intervals = Vec::with_capacity(retries);
        let mut wait = first;
        for _ in 0..retries {
            intervals.push(wait);
            wait += step;
        }

        Self { intervals }
    }

    /// Use an explicit table
    pub fn from_intervals(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    /// Never retry
    pub fn none() -> Self {
        Self::from_intervals(Vec::new())
    }

    /// Wait before retry number `retry` (0-based), `None` once the budget is spent
    pub fn wait_before(&self, retry: usize) -> Option<Duration> {
        self.intervals.get(retry).copied()
    }

    /// Total attempts including the immediate first one
    pub fn max_attempts(&self) -> usize {
        self.intervals.len() + 1
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }
}

impl Default for RetryPolicy {
    /// 1s, 3s, 5s
    fn default() -> Self {
        Self::linear(DEFAULT_RETRIES, DEFAULT_FIRST_WAIT, DEFAULT_WAIT_STEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.intervals(),
            &[
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5)
            ]
        );
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.intervals().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = RetryPolicy::from_intervals(vec![Duration::from_millis(5)]);
        assert_eq!(policy.wait_before(0), Some(Duration::from_millis(5)));
        assert_eq!(policy.wait_before(1), None);
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
    }
}
