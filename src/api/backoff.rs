// src/api/backoff.rs
//! Exponential backoff with optional jitter for rate-limited retries.

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Jitter spread around the computed delay (±25%)
const JITTER_FRACTION: f64 = 0.25;

/// Stateless delay calculator.
///
/// `compute_delay(n) = min(base * multiplier^(n-1), max)`, optionally
/// perturbed by uniform jitter and floored at zero. Without jitter the result
/// is a pure function of `(attempt, config)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffController {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_attempts: u32,
    jitter_enabled: bool,
}

impl BackoffController {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
            jitter_enabled: config.jitter_enabled,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to sleep after the `attempt`-th failed call (1-based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.jitter_enabled {
            Self::add_jitter(capped_ms)
        } else {
            capped_ms
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    fn add_jitter(delay_ms: f64) -> f64 {
        let spread = delay_ms * JITTER_FRACTION;
        if spread <= 0.0 {
            return delay_ms;
        }
        delay_ms + rand::thread_rng().gen_range(-spread..=spread)
    }
}

impl Default for BackoffController {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic(base_ms: u64, max_ms: u64, multiplier: f64) -> BackoffController {
        BackoffController::new(&BackoffConfig {
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            multiplier,
            max_attempts: 5,
            jitter_enabled: false,
        })
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let backoff = deterministic(10, 10_000, 2.0);
        assert_eq!(backoff.compute_delay(1), Duration::from_millis(10));
        assert_eq!(backoff.compute_delay(2), Duration::from_millis(20));
        assert_eq!(backoff.compute_delay(3), Duration::from_millis(40));
        assert_eq!(backoff.compute_delay(4), Duration::from_millis(80));
    }

    #[test]
    fn test_monotonic_until_cap_then_constant() {
        let backoff = deterministic(100, 1_000, 2.0);
        let delays: Vec<Duration> = (1..=10).map(|n| backoff.compute_delay(n)).collect();

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        // 100, 200, 400, 800, then capped
        assert!(delays[4..].iter().all(|d| *d == Duration::from_millis(1_000)));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = deterministic(1_000, 30_000, 3.0);
        assert_eq!(backoff.compute_delay(u32::MAX), Duration::from_millis(30_000));
        assert_eq!(backoff.compute_delay(0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = BackoffController::new(&BackoffConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: 3,
            jitter_enabled: true,
        });

        for attempt in 1..=4 {
            let nominal = 1_000.0 * 2f64.powi(attempt as i32 - 1);
            for _ in 0..200 {
                let delay = backoff.compute_delay(attempt).as_millis() as f64;
                assert!(delay >= (nominal * 0.75).floor());
                assert!(delay <= nominal * 1.25);
            }
        }
    }

    #[test]
    fn test_zero_base_delay_is_zero() {
        let backoff = BackoffController::new(&BackoffConfig {
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 2.0,
            max_attempts: 3,
            jitter_enabled: true,
        });
        assert_eq!(backoff.compute_delay(3), Duration::ZERO);
    }
}
