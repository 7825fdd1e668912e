//! Shared pipeline time origin.
//!
//! Tuple timestamps and result latencies are microsecond offsets from the
//! moment the routing stage saw the feed's sync sentinel. The origin is set
//! once by the routing stage and read by everyone else.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct PipelineClock {
    origin: Arc<OnceLock<Instant>>,
}

impl PipelineClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the origin; later calls are ignored.
    pub fn synchronize(&self) {
        let _ = self.origin.set(Instant::now());
    }

    /// Microseconds since the origin; zero before synchronization.
    pub fn now_us(&self) -> i64 {
        self.origin
            .get()
            .map(|o| o.elapsed().as_micros() as i64)
            .unwrap_or(0)
    }

    pub fn is_synchronized(&self) -> bool {
        self.origin.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotone_after_sync() {
        let clock = PipelineClock::new();
        assert_eq!(clock.now_us(), 0);
        clock.synchronize();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
        // Second synchronize keeps the first origin.
        clock.synchronize();
        assert!(clock.now_us() >= b);
    }
}
