//! Idle poll backoff for worker loops.

use std::time::Duration;

/// Doubles the idle sleep from `min` up to `max`. Each delay carries ±25%
/// jitter so a pool of workers does not poll the store in lockstep.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The next sleep, then doubles the base for the call after.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        jitter(base)
    }

    /// Called after a successful claim.
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    #[cfg(test)]
    fn current(&self) -> Duration {
        self.current
    }
}

fn jitter(base: Duration) -> Duration {
    base.mul_f64(rand::random::<f64>() * 0.5 + 0.75)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_max_and_resets() {
        let mut poll = PollBackoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let bases: Vec<Duration> = (0..5)
            .map(|_| {
                let base = poll.current();
                poll.next_delay();
                base
            })
            .collect();
        assert_eq!(
            bases,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(3000),
                Duration::from_millis(3000),
            ]
        );

        poll.reset();
        assert_eq!(poll.current(), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let delay = jitter(base);
            assert!(delay >= Duration::from_millis(750), "{delay:?}");
            assert!(delay <= Duration::from_millis(1250), "{delay:?}");
        }
    }

    #[test]
    fn max_below_min_is_clamped() {
        let mut poll = PollBackoff::new(Duration::from_secs(2), Duration::from_secs(1));
        poll.next_delay();
        assert_eq!(poll.current(), Duration::from_secs(2));
    }
}
