//! Audio clock abstraction
//!
//! Every scheduled parameter ramp and every deferred action in the engine is
//! anchored to `Clock::now()`. Hosts drive playback with [`SystemClock`];
//! tests and offline tools use [`ManualClock`] and move time explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of the audio timeline, in seconds
pub trait Clock: Send + Sync {
    /// Current time in seconds
    fn now(&self) -> f64;
}

/// Monotonic wall clock measured from construction
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can keep one handle and
/// give another to the engine.
#[derive(Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock starting at `t = 0`
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock starting at the given time
    pub fn starting_at(seconds: f64) -> Self {
        let clock = Self::new();
        clock.set(seconds);
        clock
    }

    /// Jump to an absolute time
    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::Relaxed);
    }

    /// Move forward by `seconds`
    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}
