use rand::Rng;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Exponential Backoff with jitter (±20%)
// ---------------------------------------------------------------------------

pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_bounds(Duration::from_secs(1), Duration::from_secs(60))
    }

    pub fn with_bounds(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 1.5,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
        let delay = Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0));

        let next = (base * self.multiplier).min(self.max.as_secs_f64());
        self.current = Duration::from_secs_f64(next);
        delay.min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
