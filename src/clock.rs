// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! A tiny monotonic clock abstraction.
//!
//! The engine and recovery monitor compare elapsed time against
//! sub-millisecond deadlines on every tick, so they take a `&dyn Clock`
//! instead of calling `Instant::now()` directly — tests can then advance
//! time deterministically instead of sleeping real wall-clock time.

use std::time::Duration;

pub trait Clock: Send + Sync {
    /// Milliseconds since some arbitrary but fixed epoch. Only differences
    /// between two calls are meaningful.
    fn now_ms(&self) -> f64;

    /// Microseconds since the same epoch as [`Clock::now_ms`].
    fn now_us(&self) -> i64 {
        (self.now_ms() * 1000.0) as i64
    }
}

#[derive(Default)]
pub struct MonotonicClock {
    start: once_cell_instant::OnceInstant,
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.start.get().elapsed().as_secs_f64() * 1000.0
    }
}

/// A fake clock for tests: time only advances when [`FakeClock::advance`] is called.
pub struct FakeClock {
    now_ms: std::sync::atomic::AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock { now_ms: std::sync::atomic::AtomicU64::new(0) }
    }

    pub fn advance(&self, delta: Duration) {
        self.now_ms.fetch_add(delta.as_millis() as u64, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_ms.store(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        FakeClock::new()
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> f64 {
        self.now_ms.load(std::sync::atomic::Ordering::SeqCst) as f64
    }
}

/// Lazily-initialized process start instant, used as the monotonic epoch.
mod once_cell_instant {
    use std::sync::OnceLock;
    use std::time::Instant;

    #[derive(Default)]
    pub struct OnceInstant(OnceLock<Instant>);

    impl OnceInstant {
        pub fn get(&self) -> Instant {
            *self.0.get_or_init(Instant::now)
        }
    }
}
