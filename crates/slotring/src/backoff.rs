use std::hint;
use std::thread;

/// Exponential backoff for CAS retry loops and full/empty polling.
///
/// `spin` only issues PAUSE hints and never leaves the CPU; it is what the
/// lock-free loops use between failed compare-and-swaps. `snooze` escalates to
/// `yield_now` once spinning stops paying off, and `is_completed` tells a
/// polling caller to give up.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    attempts: u64,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6; // at most 2^6 PAUSEs per spin
    const YIELD_LIMIT: u32 = 10;

    /// Creates a new backoff instance.
    #[inline]
    pub fn new() -> Self {
        Self {
            step: 0,
            attempts: 0,
        }
    }

    /// Spin with PAUSE hints, doubling the count up to the limit.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..1u32 << self.step.min(Self::SPIN_LIMIT) {
            hint::spin_loop();
        }
        if self.step <= Self::SPIN_LIMIT {
            self.step += 1;
        }
        self.attempts += 1;
    }

    /// Spin while cheap, then yield the thread.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            self.spin();
        } else {
            thread::yield_now();
            if self.step <= Self::YIELD_LIMIT {
                self.step += 1;
            }
            self.attempts += 1;
        }
    }

    /// Whether a polling caller should stop waiting.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }

    /// Number of `spin`/`snooze` calls since creation or the last reset.
    #[inline]
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Reset for the next wait cycle.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
