use std::time::Duration;

use rand::Rng;

/// Randomized exponential backoff.
///
/// The nominal delay for attempt `n` is `base * 2^n`, capped at `max`. With a
/// non-zero `jitter` the actual delay is drawn uniformly from
/// `[nominal * (1 - jitter), nominal]`, and never drops below `base`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base: Duration,

    /// Upper bound for any single delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(20),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Constant delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            jitter: 0.0,
        }
    }

    /// Calculate the delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2_f64.powi(attempt.min(30) as i32);
        let nominal = (self.base.as_secs_f64() * exp).min(self.max.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let factor: f64 = rand::rng().random_range(0.0..=self.jitter);
            nominal * (1.0 - factor)
        } else {
            nominal
        };

        Duration::from_secs_f64(jittered.max(self.base.as_secs_f64()))
    }
}
