//! Reconnection Policy
//!
//! Decides whether and when to retry after a connection loss. The decision
//! itself is a pure function of [`RetryState`] and [`ReconnectConfig`]; the
//! only state is the retry counter the manager carries between closes.
//!
//! The default is a fixed 3 s interval with unlimited attempts. Setting a
//! multiplier above `1.0` turns it into capped exponential backoff, and a
//! non-zero jitter factor spreads reconnects from many clients apart.

use std::time::Duration;

use rand::Rng;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt (`1.0` keeps the delay fixed).
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (e.g. `0.1` = ±10%).
    pub jitter_factor: f64,
    /// Maximum reconnect attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_DELAY,
            max_delay: DEFAULT_RECONNECT_DELAY,
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_attempts: 0, // Unlimited
        }
    }
}

impl ReconnectConfig {
    /// Fixed-interval policy with unlimited attempts.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }

    /// Limit the number of attempts before giving up.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Whether the retry budget is unbounded.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }
}

/// Retry bookkeeping carried across connection losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    /// Consecutive closes since the last successful open.
    pub attempt: u32,
    /// Delay chosen for the pending (or most recent) attempt.
    pub next_delay: Duration,
}

impl RetryState {
    /// Count another connection loss.
    pub const fn record_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Reset after a successful open.
    pub const fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = Duration::ZERO;
    }
}

/// Outcome of a reconnect decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after the given delay.
    Retry(Duration),
    /// Retry budget exhausted.
    GiveUp,
}

/// Reconnection policy.
///
/// # Example
///
/// ```rust
/// use feed_connection::domain::reconnect::{
///     ReconnectConfig, ReconnectPolicy, RetryDecision, RetryState,
/// };
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::new(ReconnectConfig::default());
/// let mut retry = RetryState::default();
///
/// // Every loss waits the same 3 s by default
/// assert_eq!(
///     policy.next(&mut retry),
///     RetryDecision::Retry(Duration::from_millis(3000))
/// );
/// assert_eq!(retry.attempt, 1);
///
/// // A successful open starts over
/// retry.reset();
/// assert_eq!(retry.attempt, 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// The policy configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Decide what to do for the attempt recorded in `state`.
    ///
    /// Pure: the same state always yields the same decision. Jitter is
    /// applied separately by [`Self::jittered`].
    #[must_use]
    pub fn decide(&self, state: &RetryState) -> RetryDecision {
        if !self.config.is_unlimited() && state.attempt > self.config.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(state.attempt))
    }

    /// Record a loss in `state` and decide on the next step.
    pub fn next(&self, state: &mut RetryState) -> RetryDecision {
        state.record_failure();
        let decision = self.decide(state);
        if let RetryDecision::Retry(delay) = decision {
            state.next_delay = delay;
        }
        decision
    }

    /// Base delay for a 1-based attempt number, before jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);

        #[allow(clippy::cast_precision_loss)]
        let base_millis = self.config.base_delay.as_millis() as f64;
        let scaled = (base_millis * self.config.multiplier.powi(exponent)).round();

        let cap = self.config.max_delay.max(self.config.base_delay);
        if !scaled.is_finite() || scaled <= 0.0 {
            return self.config.base_delay.min(cap);
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = scaled.min(u64::MAX as f64) as u64;
        Duration::from_millis(millis).min(cap)
    }

    /// Apply the configured jitter to a delay.
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = delay.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn default_is_fixed_three_seconds_unlimited() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(3000));
        assert_eq!(config.max_delay, Duration::from_millis(3000));
        assert!((config.multiplier - 1.0).abs() < f64::EPSILON);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
        assert!(config.is_unlimited());
    }

    #[test_case(1 ; "first attempt")]
    #[test_case(2 ; "second attempt")]
    #[test_case(50 ; "fiftieth attempt")]
    fn fixed_policy_never_grows(attempt: u32) {
        let policy = ReconnectPolicy::new(ReconnectConfig::default());
        let state = RetryState {
            attempt,
            next_delay: Duration::ZERO,
        };
        assert_eq!(
            policy.decide(&state),
            RetryDecision::Retry(Duration::from_millis(3000))
        );
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        });

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(30), Duration::from_millis(500));
    }

    #[test]
    fn gives_up_after_budget() {
        let policy = ReconnectPolicy::new(ReconnectConfig::default().with_max_attempts(3));
        let mut retry = RetryState::default();

        for expected in 1..=3 {
            assert!(matches!(policy.next(&mut retry), RetryDecision::Retry(_)));
            assert_eq!(retry.attempt, expected);
        }

        assert_eq!(policy.next(&mut retry), RetryDecision::GiveUp);
        assert_eq!(retry.attempt, 4);
    }

    #[test]
    fn decide_is_pure() {
        let policy = ReconnectPolicy::new(ReconnectConfig::default().with_max_attempts(2));
        let state = RetryState {
            attempt: 2,
            next_delay: Duration::ZERO,
        };
        assert_eq!(policy.decide(&state), policy.decide(&state));
        assert_eq!(state.attempt, 2);
    }

    #[test]
    fn reset_clears_attempts() {
        let policy = ReconnectPolicy::default();
        let mut retry = RetryState::default();
        let _ = policy.next(&mut retry);
        let _ = policy.next(&mut retry);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.next_delay, Duration::from_millis(3000));

        retry.reset();
        assert_eq!(retry, RetryState::default());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ReconnectPolicy::new(ReconnectConfig {
            jitter_factor: 0.1,
            ..ReconnectConfig::fixed(Duration::from_millis(1000))
        });

        for _ in 0..100 {
            let millis = policy.jittered(Duration::from_millis(1000)).as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn zero_jitter_is_identity() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.jittered(Duration::from_millis(3000)),
            Duration::from_millis(3000)
        );
    }
}
