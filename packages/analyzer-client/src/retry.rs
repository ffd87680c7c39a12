use std::time::Duration;

/// Exponential backoff schedule with jitter.
///
/// Delays grow geometrically from `initial_delay` up to `max_delay`, then a
/// random jitter of up to `jitter_fraction` in either direction is applied so
/// that concurrent callers do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep before retry number `attempt` (0-based: the delay
    /// after the first failure is `delay_for(0)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        // Spread retries by +/- jitter_fraction, floored at 100ms.
        let jitter = capped * self.jitter_fraction * (fastrand::f64() * 2.0 - 1.0);
        let jittered = (capped + jitter).max(100.0);

        Duration::from_millis(jittered as u64)
    }
}
