//! Exponential backoff with jitter for reconnect scheduling.
//!
//! When a session loses its connection, retrying immediately would hammer a
//! broker that is probably already struggling, and all clients dropped by the
//! same outage would retry in lockstep. The delay therefore doubles with each
//! consecutive failure and is stretched by a random factor.
//!
//! # Algorithm
//!
//! ```text
//! capped[n] = min(max_delay, base * 2^n)
//! delay[n]  = min(max_delay, capped[n] * (1 + U[0, jitter]))
//! ```
//!
//! With `jitter <= 1` the stretch is at most 2x, so
//! `delay[n] <= min(max_delay, 2 * base * 2^n) = capped[n+1] <= delay[n+1]`
//! and delays never shrink across consecutive failures.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use mqttlink_session::backoff::Backoff;
//!
//! let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
//! assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(1));
//! assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(2));
//!
//! // Connection succeeded
//! backoff.reset();
//! assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(1));
//! ```

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;

use crate::config::ReconnectConfig;

/// Error type for backoff exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// Maximum retry attempts exceeded with the given limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Exponential backoff controller.
///
/// Each call to [`next_delay`](Backoff::next_delay) consumes one attempt from
/// the retry budget and returns how long to wait before that attempt. A
/// successful connection calls [`reset`](Backoff::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    base_delay: Duration,

    /// Upper bound for any delay.
    max_delay: Duration,

    /// Upper bound of the random stretch, in `[0, 1]`.
    jitter: f64,

    /// Attempts handed out since the last reset.
    attempt: u32,

    /// Hard limit on attempts; `None` retries forever.
    max_attempts: Option<u32>,

    /// Delay returned by the most recent call to `next_delay`.
    last_delay: Option<Duration>,

    rng: StdRng,
}

impl Backoff {
    /// Creates a backoff with an unlimited retry budget.
    ///
    /// # Arguments
    /// - `base`: delay before the first retry
    /// - `max`: delay cap; raised to `base` if lower
    /// - `jitter`: random stretch bound, clamped into `[0, 1]`
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base_delay: base,
            max_delay: max.max(base),
            jitter: if jitter.is_finite() {
                jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
            attempt: 0,
            max_attempts: None,
            last_delay: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Builds a backoff from the reconnect section of a client config.
    pub fn from_config(config: &ReconnectConfig) -> Self {
        let mut backoff = Self::new(config.base_delay(), config.max_delay(), config.jitter);
        backoff.max_attempts = config.retry_limit();
        backoff
    }

    /// Replaces the random source, e.g. with a seeded one for reproducible
    /// schedules.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Sets an explicit maximum number of attempts.
    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Resets the attempt counter so the next failure starts from the base
    /// delay again.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = None;
    }

    /// Returns the delay to wait before the next attempt and consumes one
    /// attempt.
    ///
    /// # Errors
    /// [`BackoffError::MaxAttemptLimitError`] once the retry budget is spent.
    /// The counter is left untouched in that case.
    pub fn next_delay(&mut self) -> Result<Duration, BackoffError> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
        }

        let max_secs = self.max_delay.as_secs_f64();
        let capped = (self.base_delay.as_secs_f64() * 2f64.powi(self.attempt.min(1024) as i32))
            .min(max_secs);
        let factor = if self.jitter > 0.0 {
            1.0 + self.rng.gen_range(0.0..=self.jitter)
        } else {
            1.0
        };
        let delay = Duration::from_secs_f64((capped * factor).min(max_secs));

        self.attempt += 1;
        self.last_delay = Some(delay);
        Ok(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether another call to `next_delay` would fail.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

impl Default for Backoff {
    /// 1 second base, 60 second cap, jitter 0.5, unlimited attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(base_ms: u64, max_ms: u64, jitter: f64) -> Backoff {
        Backoff::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            jitter,
        )
        .with_rng(StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_doubling_without_jitter() {
        let mut backoff = seeded(100, 10_000, 0.0);
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
        assert_eq!(backoff.attempt(), 5);
        assert_eq!(backoff.last_delay(), Some(Duration::from_millis(1600)));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let mut backoff = seeded(1_000, 5_000, 1.0);
        for _ in 0..20 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_millis(5_000));
        }
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_delays_non_decreasing_with_jitter() {
        for seed in 0..50 {
            let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(30), 1.0)
                .with_rng(StdRng::seed_from_u64(seed));
            let mut previous = Duration::ZERO;
            for _ in 0..16 {
                let delay = backoff.next_delay().unwrap();
                assert!(delay >= previous, "seed {seed}: {delay:?} < {previous:?}");
                previous = delay;
            }
        }
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = seeded(1_000, 60_000, 0.5);
        let first = backoff.next_delay().unwrap();
        assert!(first >= Duration::from_millis(1_000));
        assert!(first <= Duration::from_millis(1_500));
    }

    #[test]
    fn test_max_attempts_exhaustion() {
        let mut backoff = seeded(10, 100, 0.0);
        backoff.set_max_attempts(3);
        for _ in 0..3 {
            assert!(backoff.next_delay().is_ok());
        }
        assert!(backoff.is_exhausted());
        assert_eq!(
            backoff.next_delay(),
            Err(BackoffError::MaxAttemptLimitError(3))
        );
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_reset_restores_base_delay() {
        let mut backoff = seeded(100, 10_000, 0.0);
        backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.last_delay(), None);
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn test_from_config() {
        let config = ReconnectConfig {
            retry_count: 4,
            backoff_time: 250,
            max_backoff_time: 2_000,
            jitter: 0.2,
            ..Default::default()
        };
        let backoff = Backoff::from_config(&config);
        assert_eq!(backoff.max_attempts(), Some(4));
        assert_eq!(backoff.base_delay(), Duration::from_millis(250));
        assert_eq!(backoff.max_delay(), Duration::from_millis(2_000));
    }

    #[test]
    fn test_many_attempts_do_not_overflow() {
        let mut backoff = seeded(1_000, 60_000, 0.3);
        for _ in 0..2_000 {
            backoff.next_delay().unwrap();
        }
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(60));
    }
}
