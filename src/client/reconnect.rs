//! Backoff calculation and reconnection decisions
//!
//! Everything in here is pure apart from the random source, which is
//! injectable so delays are reproducible in tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{
    ConnectionOptions, DEFAULT_BACKOFF_TIME_MS, DEFAULT_JITTER_MS, DEFAULT_MAX_BACKOFF_TIME_SECS,
};

/// `min(base_ms * 2^attempt + ceil(random * jitter), max_secs * 1000)`
///
/// `random` is drawn from `[0, 1)`. Overflow saturates, so very large
/// attempts simply land on the clamp.
pub fn compute_backoff<R: Rng + ?Sized>(
    base_ms: u64,
    attempt: u32,
    max_secs: u64,
    jitter: u64,
    rng: &mut R,
) -> u64 {
    let exponential = 2u64
        .checked_pow(attempt)
        .map(|factor| base_ms.saturating_mul(factor))
        .unwrap_or(u64::MAX);
    let jitter_ms = (rng.gen::<f64>() * jitter as f64).ceil() as u64;
    let cap = max_secs.saturating_mul(1000);

    exponential.saturating_add(jitter_ms).min(cap)
}

/// Seedable random source for [`compute_backoff`]
pub struct BackoffCalculator {
    rng: StdRng,
}

impl BackoffCalculator {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn delay_ms(&mut self, policy: &ReconnectPolicy, attempt: u32) -> u64 {
        compute_backoff(
            policy.backoff_time_ms,
            attempt,
            policy.max_backoff_time_secs,
            policy.jitter_ms,
            &mut self.rng,
        )
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::from_entropy()
    }
}

/// Reconnection parameters resolved from [`ConnectionOptions`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Maximum attempts per cycle (None = unlimited)
    pub max_attempts: Option<u32>,
    pub backoff_time_ms: u64,
    pub max_backoff_time_secs: u64,
    pub jitter_ms: u64,
}

impl ReconnectPolicy {
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            enabled: options.auto_reconnect_enabled(),
            max_attempts: options.retry_count,
            backoff_time_ms: options.backoff_time.unwrap_or(DEFAULT_BACKOFF_TIME_MS),
            max_backoff_time_secs: options
                .max_backoff_time
                .unwrap_or(DEFAULT_MAX_BACKOFF_TIME_SECS),
            jitter_ms: options.jitter.unwrap_or(DEFAULT_JITTER_MS),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_options(&ConnectionOptions::default())
    }
}

/// Outcome of [`decide_reconnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Schedule attempt number `attempt` (1-based)
    Proceed { attempt: u32 },
    /// Auto reconnect is off
    Disabled,
    /// The cycle already used its whole budget
    AbortMaxAttemptsExceeded,
}

/// Attempt while `current_attempts < max_attempts`
pub fn decide_reconnection(current_attempts: u32, policy: &ReconnectPolicy) -> ReconnectionDecision {
    if !policy.enabled {
        return ReconnectionDecision::Disabled;
    }

    if let Some(max_attempts) = policy.max_attempts {
        if current_attempts >= max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }
    }

    ReconnectionDecision::Proceed {
        attempt: current_attempts.saturating_add(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_clamp_reached() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(compute_backoff(1000, 50, 2000, 10, &mut rng), 2_000_000);
    }

    #[test]
    fn test_default_parameters() {
        // StepRng(0, 0) always yields 0.0, so jitter contributes nothing
        let mut zero = StepRng::new(0, 0);
        assert_eq!(compute_backoff(2000, 0, 60, 1, &mut zero), 2000);
        assert_eq!(compute_backoff(2000, 1, 60, 1, &mut zero), 4000);
        assert_eq!(compute_backoff(2000, 5, 60, 1, &mut zero), 60_000);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let mut calculator = BackoffCalculator::seeded(42);
        let policy = ReconnectPolicy {
            jitter_ms: 250,
            ..ReconnectPolicy::default()
        };

        for _ in 0..100 {
            let delay = calculator.delay_ms(&policy, 1);
            assert!((4000..=4250).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_seeded_calculators_agree() {
        let policy = ReconnectPolicy {
            jitter_ms: 1000,
            ..ReconnectPolicy::default()
        };
        let mut a = BackoffCalculator::seeded(9);
        let mut b = BackoffCalculator::seeded(9);
        for attempt in 0..4 {
            assert_eq!(a.delay_ms(&policy, attempt), b.delay_ms(&policy, attempt));
        }
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(compute_backoff(2000, 200, 60, 1, &mut rng), 60_000);
        assert_eq!(compute_backoff(u64::MAX, 3, u64::MAX, 5, &mut rng), u64::MAX);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.enabled);
        assert_eq!(policy.max_attempts, None);
        assert_eq!(policy.backoff_time_ms, 2000);
        assert_eq!(policy.max_backoff_time_secs, 60);
        assert_eq!(policy.jitter_ms, 1);
    }

    #[test]
    fn test_retry_boundary_is_exclusive() {
        let options = ConnectionOptions::default().with_auto_reconnect(Some(3));
        let policy = ReconnectPolicy::from_options(&options);

        assert_eq!(
            decide_reconnection(0, &policy),
            ReconnectionDecision::Proceed { attempt: 1 }
        );
        assert_eq!(
            decide_reconnection(2, &policy),
            ReconnectionDecision::Proceed { attempt: 3 }
        );
        assert_eq!(
            decide_reconnection(3, &policy),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_unlimited_and_disabled() {
        let unlimited =
            ReconnectPolicy::from_options(&ConnectionOptions::default().with_auto_reconnect(None));
        assert_eq!(
            decide_reconnection(10_000, &unlimited),
            ReconnectionDecision::Proceed { attempt: 10_001 }
        );

        let zero_budget = ReconnectPolicy::from_options(
            &ConnectionOptions::default().with_auto_reconnect(Some(0)),
        );
        assert_eq!(
            decide_reconnection(0, &zero_budget),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );

        assert_eq!(
            decide_reconnection(0, &ReconnectPolicy::default()),
            ReconnectionDecision::Disabled
        );
    }

    proptest! {
        #[test]
        fn prop_backoff_monotonic_until_clamp(attempt in 0u32..64, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let current = compute_backoff(2000, attempt, 60, 1, &mut rng);
            let next = compute_backoff(2000, attempt + 1, 60, 1, &mut rng);

            prop_assert!(current <= 60_000);
            prop_assert!(next <= 60_000);
            prop_assert!(next >= current);
        }
    }
}
