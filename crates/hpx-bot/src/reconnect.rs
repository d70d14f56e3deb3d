use std::time::Duration;

use rand::Rng;

/// Reconnect/backoff configuration derived from [`crate::ConnectionConfig`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct BackoffConfig {
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) factor: f64,
    pub(crate) jitter: f64,
}

impl BackoffConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("Reconnect base delay must be > 0".to_string());
        }
        if self.max_delay.is_zero() {
            return Err("Max reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("Max reconnect delay must be >= reconnect base delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

/// Delay before reconnect attempt number `attempt` (1-based).
///
/// Attempt 1 waits `base_delay`, every further attempt multiplies by
/// `factor`, capped at `max_delay`. Without jitter the sequence is
/// non-decreasing.
pub(crate) fn calculate_backoff(config: BackoffConfig, attempt: u32) -> Duration {
    let base = config.base_delay.as_secs_f64();
    let max = config.max_delay.as_secs_f64();
    let exponent = config
        .factor
        .powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX));
    let capped = (base * exponent).min(max);

    if config.jitter == 0.0 {
        return Duration::from_secs_f64(capped);
    }

    let mut rng = rand::rng();
    let randomized = rng.random_range(0.0..=capped);
    let blended = capped * (1.0 - config.jitter) + randomized * config.jitter;
    Duration::from_secs_f64(blended)
}
