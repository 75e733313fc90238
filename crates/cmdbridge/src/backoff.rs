use std::hint;
use std::thread;
use std::time::Duration;

/// Escalating wait for a peer that lives in another process.
///
/// Phases: spin with PAUSE hints, then yield to the OS, then sleep. Sleeps
/// start short and double on every call, capped by the caller's `max_sleep`.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_STEPS: u32 = 6; // up to 2^6 PAUSEs per step
    const YIELD_STEPS: u32 = 10;
    const FIRST_SLEEP: Duration = Duration::from_micros(20);

    /// Creates a backoff at its first spin step.
    #[inline]
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Waits one step. Never sleeps longer than `max_sleep`.
    pub fn wait(&mut self, max_sleep: Duration) {
        if self.step <= Self::SPIN_STEPS {
            for _ in 0..1u32 << self.step {
                hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_STEPS {
            thread::yield_now();
        } else {
            let doublings = (self.step - Self::YIELD_STEPS - 1).min(16);
            thread::sleep((Self::FIRST_SLEEP * (1 << doublings)).min(max_sleep));
        }
        self.step = self.step.saturating_add(1);
    }

    /// Returns `true` once waits have escalated to sleeping.
    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.step > Self::YIELD_STEPS
    }

    /// Back to spinning, e.g. after the peer made progress.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_escalates_to_sleeping() {
        let mut b = Backoff::new();
        assert!(!b.is_sleeping());

        for _ in 0..=Backoff::YIELD_STEPS {
            b.wait(Duration::from_millis(1));
        }
        assert!(b.is_sleeping());

        b.reset();
        assert!(!b.is_sleeping());
    }

    #[test]
    fn test_sleep_capped_by_max() {
        let mut b = Backoff::new();
        while !b.is_sleeping() {
            b.wait(Duration::from_millis(5));
        }
        // Far enough along that the doubled sleep exceeds the cap.
        for _ in 0..16 {
            b.wait(Duration::ZERO);
        }

        let start = Instant::now();
        b.wait(Duration::from_millis(2));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2));
        assert!(elapsed < Duration::from_millis(200));
    }
}
