//! Exponential backoff with jitter

use std::time::Duration;

/// Backoff series: initial delay doubling per attempt, plus 0-100ms of
/// jitter so parallel retries spread out.
pub(crate) struct Backoff {
    next: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration) -> Self {
        Self { next: initial }
    }

    /// The delay to sleep before the next attempt.
    pub(crate) fn delay(&mut self) -> Duration {
        let delay = self.next + Duration::from_millis(jitter_ms());
        self.next *= 2;
        delay
    }
}

/// Generate a random jitter value (0-100ms)
fn jitter_ms() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = Backoff::new(Duration::from_millis(1000));
        let first = backoff.delay();
        let second = backoff.delay();
        let third = backoff.delay();

        assert!(first >= Duration::from_millis(1000) && first < Duration::from_millis(1100));
        assert!(second >= Duration::from_millis(2000) && second < Duration::from_millis(2100));
        assert!(third >= Duration::from_millis(4000) && third < Duration::from_millis(4100));
    }

    #[test]
    fn test_jitter_bounded() {
        for _ in 0..50 {
            assert!(jitter_ms() < 100);
        }
    }
}
