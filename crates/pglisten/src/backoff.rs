//! Reconnection backoff
//!
//! Exponential growth from a base delay, capped at a ceiling, with symmetric
//! jitter so many listeners do not hammer a recovering database in lockstep.
//! There is no retry-count ceiling; the controller retries until shut down.

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Mutable backoff bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    /// Failed attempts since the last stable connection
    pub consecutive_failures: u32,
    /// Delay chosen for the most recent failure (zero after a reset)
    pub current_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
}

/// Backoff policy plus its state
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    state: BackoffState,
}

impl Backoff {
    /// Create a backoff in the reset state
    pub fn new(config: BackoffConfig) -> Self {
        let state = BackoffState {
            consecutive_failures: 0,
            current_delay: Duration::ZERO,
            max_delay: config.max_delay(),
        };
        Self { config, state }
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let capped = self.delay_for_attempt(self.state.consecutive_failures);
        let delay = apply_jitter(capped, self.config.jitter).min(self.state.max_delay);

        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.state.current_delay = delay;
        delay
    }

    /// Un-jittered delay for the given zero-based attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let grown = base_ms * self.config.multiplier.powi(exponent);
        let capped = grown.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Forget past failures
    pub fn reset(&mut self) {
        self.state.consecutive_failures = 0;
        self.state.current_delay = Duration::ZERO;
    }

    /// Current bookkeeping
    pub fn state(&self) -> &BackoffState {
        &self.state
    }
}

/// Spread `delay` by up to ±`jitter` of its length
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(-jitter..=jitter);
    let millis = delay.as_millis() as f64 * (1.0 + factor);
    Duration::from_millis(millis.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter,
            stability_window_ms: 1_000,
        }
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let mut backoff = Backoff::new(config(0.0));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.state().consecutive_failures, 3);
        assert_eq!(backoff.state().current_delay, Duration::from_millis(400));
    }

    #[test]
    fn test_capped_at_max() {
        let mut backoff = Backoff::new(config(0.0));
        for _ in 0..50 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let mut backoff = Backoff::new(config(0.25));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));

        for _ in 0..40 {
            assert!(backoff.next_delay() <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(config(0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.state().consecutive_failures, 0);
        assert_eq!(backoff.state().current_delay, Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
