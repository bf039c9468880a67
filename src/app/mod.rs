// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! The two per-role application loops that drive everything else in this
//! crate on a cooperative tick: [`primary::PrimaryApp`] owns the pattern
//! engine, the session manager, and the outbound SYNC stream; `secondary`
//! owns the receive framer, the SYNC command dispatcher, and the heartbeat
//! recovery monitor.
//!
//! Neither loop spawns worker threads that mutate the state machine or
//! engine concurrently — both are driven exclusively from their own single
//! tick task.

pub mod primary;
pub mod secondary;

use std::time::Duration;

/// Nominal tick rate for both application loops (20 Hz nominal).
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Per-connection receive timeout used while draining the inbound queue.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(10);

/// How often housekeeping (memory report on both roles, stats report on
/// SECONDARY) runs. Both roles share the same cadence.
pub const HOUSEKEEPING_INTERVAL_S: f64 = 60.0;

/// Emits a free-memory-style heartbeat line. The source firmware runs on a
/// constrained embedded runtime where a single authoritative free-memory
/// figure exists; on a general-purpose host there is none, so this logs a
/// heartbeat line instead of fabricating a number.
pub fn log_memory_housekeeping() {
    tracing::debug!("memory housekeeping tick");
}
