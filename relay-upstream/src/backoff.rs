//! Reconnect delay policy
//!
//! `delay = min(base * 2^attempt, max) * (1 ± jitter)`, where the attempt
//! counter stops growing at `max_exponent` and resets after a successful
//! connect. A fixed delay is `base == max` with no jitter.

use std::time::Duration;

use rand::Rng;

/// Configuration for [`Backoff`]
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Relative jitter in `[0, 1]`
    pub jitter: f64,
    pub max_exponent: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
            max_exponent: 10,
        }
    }
}

impl BackoffConfig {
    /// Same delay on every attempt
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            jitter: 0.0,
            max_exponent: 0,
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(mut config: BackoffConfig) -> Self {
        config.jitter = if config.jitter.is_finite() {
            config.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if config.max < config.base {
            config.max = config.base;
        }

        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(self.config.max_exponent);
        self.attempt = self.attempt.saturating_add(1);

        let delay = self
            .config
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.config.max);

        self.with_jitter(delay)
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        let jitter = self.config.jitter;
        if jitter == 0.0 {
            return delay;
        }

        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, max_ms: u64, max_exponent: u32) -> Backoff {
        Backoff::new(BackoffConfig {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            jitter: 0.0,
            max_exponent,
        })
    }

    #[test]
    fn test_delays_double_until_capped() {
        let mut backoff = no_jitter(100, 1000, 10);
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_exponent_cap() {
        let mut backoff = no_jitter(10, 60_000, 2);
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 40, 40]);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = no_jitter(100, 1000, 10);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_fixed_delay() {
        let mut backoff = Backoff::new(BackoffConfig::fixed(Duration::from_secs(3)));
        for _ in 0..4 {
            assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        }
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(1000),
            jitter: 0.5,
            max_exponent: 0,
        });

        for _ in 0..100 {
            let delay = backoff.next_delay().as_millis();
            assert!((500..=1500).contains(&delay), "delay out of bounds: {}", delay);
        }
    }

    #[test]
    fn test_invalid_jitter_is_sanitized() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_millis(50),
            jitter: f64::NAN,
            max_exponent: 3,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
