use std::time::{Duration, Instant};

/// Monotonic clock measuring seconds since its creation
///
/// Protocol code works with `f64` seconds relative to a [Timebase]
/// so that time-based decisions can be tested with made up values.
#[derive(Clone, Debug)]
pub struct Timebase(Instant);

impl Default for Timebase {
    fn default() -> Self {
        Self(Instant::now())
    }
}

impl Timebase {
    pub fn now(&self) -> f64 {
        self.0.elapsed().as_secs_f64()
    }

    /// Convert seconds into a [Duration]; negative values become zero
    pub fn dur(&self, t: f64) -> Duration {
        Duration::from_secs_f64(t.max(0.0))
    }
}
