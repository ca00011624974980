use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_GROWTH_FACTOR: f64 = 2.0;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential reconnect schedule.
///
/// `max_attempts` bounds the number of consecutive connection attempts
/// (the first one included) before the controller gives up; `None` retries
/// forever.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl BackoffPolicy {
    /// `min(base * growth^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.growth_factor.max(1.0);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// Whether another attempt may follow `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => failures < max,
            None => true,
        }
    }
}
