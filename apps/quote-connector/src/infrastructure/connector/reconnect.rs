//! Reconnect Backoff
//!
//! Exponential backoff with jitter between reconnect attempts. The policy is
//! pure bookkeeping; the supervisor in `infrastructure::feed` decides when
//! to ask for a delay and when to reset.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay (before jitter).
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Relative jitter, e.g. `0.1` spreads delays by ±10%.
    pub jitter_factor: f64,
    /// Attempts allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Disable jitter, for deterministic delays.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before attempt `attempt` (zero based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.initial_delay.as_millis() as f64 * factor).round();
        #[allow(clippy::cast_precision_loss)]
        let cap = self.max_delay.as_millis() as f64;

        if !scaled.is_finite() || scaled >= cap {
            return self.max_delay;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = scaled.max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

/// Tracks reconnect attempts for one supervised feed.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use quote_connector::infrastructure::connector::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default().without_jitter());
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(500)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
///
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy with no attempts made.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the attempt budget is
    /// spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let base = self.config.base_delay(self.attempts);
        self.attempts += 1;
        Some(self.jittered(base))
    }

    /// Forget past attempts after a connection opened.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempts < self.config.max_attempts
    }

    /// Backoff parameters.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn jittered(&self, base: Duration) -> Duration {
        let factor = self.config.jitter_factor.clamp(0.0, 1.0);
        if factor <= 0.0 || base.is_zero() {
            return base;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = base.as_millis() as f64;
        let spread = base_millis * factor;
        let offset = rand::rng().random_range(-spread..=spread);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (base_millis + offset).round().max(1.0) as u64;
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn config(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test_case(0 => 100 ; "first attempt")]
    #[test_case(1 => 200 ; "second attempt")]
    #[test_case(3 => 800 ; "fourth attempt")]
    #[test_case(5 => 2000 ; "capped")]
    #[test_case(400 => 2000 ; "huge exponent is capped")]
    fn base_delay_grows_and_caps(attempt: u32) -> u128 {
        config(100, 2000, 2.0, 0).base_delay(attempt).as_millis()
    }

    #[test]
    fn multiplier_below_one_keeps_delay_constant() {
        let config = config(300, 2000, 0.5, 0);
        assert_eq!(config.base_delay(4), Duration::from_millis(300));
    }

    #[test]
    fn policy_walks_the_schedule() {
        let mut policy = ReconnectPolicy::new(config(100, 1000, 3.0, 0));
        let delays: Vec<_> = (0..4)
            .map(|_| policy.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 300, 900, 1000]);
        assert_eq!(policy.attempt_count(), 4);
    }

    #[test]
    fn policy_gives_up_after_max_attempts() {
        let mut policy = ReconnectPolicy::new(config(10, 100, 2.0, 2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(!policy.should_retry());
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt_count(), 2);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::new(config(50, 1000, 2.0, 2));
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();

        assert!(policy.should_retry());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let mut config = config(1000, 10_000, 2.0, 0);
        config.jitter_factor = 0.2;

        for _ in 0..200 {
            let mut policy = ReconnectPolicy::new(config.clone());
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((800..=1200).contains(&millis), "delay {millis}ms out of bounds");
        }
    }

    #[test]
    fn default_matches_connector_defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 0);
    }
}
