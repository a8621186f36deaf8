//! Exponential reconnect backoff for the client channel

use rand::Rng;
use std::time::Duration;

/// Backoff parameters (gRPC connection-backoff algorithm)
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Relative randomization, `0.2` spreads delays over +/-20%
    pub jitter: f64,
    /// Upper bound before jitter
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 1.5,
            jitter: 0.2,
            max_delay: Duration::from_secs(19),
        }
    }
}

impl BackoffConfig {
    /// Delay before the next attempt after `retries` consecutive failures
    pub fn delay(&self, retries: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let mut backoff = self.base_delay.as_secs_f64();
        let mut remaining = retries;
        while backoff < max && remaining > 0 {
            backoff *= self.multiplier;
            remaining -= 1;
        }
        backoff = backoff.min(max);

        if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-1.0..=1.0);
            backoff *= 1.0 + self.jitter * spread;
        }

        Duration::from_secs_f64(backoff.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_delay_grows_by_multiplier() {
        let config = without_jitter();
        assert_eq!(config.delay(0), Duration::from_millis(500));
        assert_eq!(config.delay(1), Duration::from_millis(750));
        assert_eq!(config.delay(2), Duration::from_millis(1125));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = without_jitter();
        assert_eq!(config.delay(50), Duration::from_secs(19));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = BackoffConfig::default();
        for _ in 0..200 {
            let delay = config.delay(0).as_secs_f64();
            assert!((0.399..=0.601).contains(&delay), "delay {} out of band", delay);
        }
    }
}
