//! Small shared helpers: wall-clock access and randomized scheduling.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// All engine timers and deadlines are expressed in this unit.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Engine time source. The manual variant lets tests drive deadlines
/// deterministically.
pub enum Clock {
    System,
    Manual(std::sync::atomic::AtomicU64),
}

impl Clock {
    pub fn manual(start_ms: u64) -> Self {
        Clock::Manual(std::sync::atomic::AtomicU64::new(start_ms))
    }

    pub fn now_ms(&self) -> u64 {
        match self {
            Clock::System => current_timestamp_ms(),
            Clock::Manual(t) => t.load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    /// Advance a manual clock. No effect on the system clock.
    pub fn set_ms(&self, now_ms: u64) {
        if let Clock::Manual(t) = self {
            t.store(now_ms, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

/// Pick the next send time for an event that should happen on average every
/// `average_interval_ms`, following an exponential distribution.
///
/// Poisson-spaced sends make traffic timing unpredictable to observers while
/// keeping the configured average rate.
pub fn poisson_next_send(now_ms: u64, average_interval_ms: u64, rng: &mut impl Rng) -> u64 {
    if average_interval_ms == 0 {
        return now_ms;
    }
    // Sample from (0, 1]; -ln(u) has mean 1.
    let u: f64 = 1.0 - rng.gen::<f64>();
    let delay = -(u.ln()) * average_interval_ms as f64;
    now_ms + delay as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_poisson_next_send_is_in_the_future() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let next = poisson_next_send(1_000, 5_000, &mut rng);
            assert!(next >= 1_000);
        }
    }

    #[test]
    fn test_poisson_next_send_averages_near_interval() {
        let mut rng = StdRng::seed_from_u64(42);
        let samples = 2_000u64;
        let total: u64 = (0..samples)
            .map(|_| poisson_next_send(0, 10_000, &mut rng))
            .sum();
        let mean = total / samples;
        assert!(mean > 7_000 && mean < 13_000, "mean delay {} out of range", mean);
    }

    #[test]
    fn test_zero_interval_sends_immediately() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(poisson_next_send(123, 0, &mut rng), 123);
    }
}
