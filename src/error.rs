// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! The error taxonomy shared by every core subsystem.
//!
//! The propagation policy for each kind (recovered locally, recovered by
//! retry, surfaced as a state transition, or fatal to the run) is
//! implemented by the callers in `session`, `recovery`, and `boot`, not by
//! this enum itself.

use thiserror::Error;

use crate::state_machine::TherapyState;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("required configuration is missing: {0}")]
    ConfigurationMissing(String),

    #[error("wireless link unavailable: {0}")]
    LinkUnavailable(String),

    #[error("actuator fault on finger {finger}: {source}")]
    ActuatorFault { finger: u8, source: String },

    #[error("pattern invariant violated: {0}")]
    PatternInvariantViolation(String),

    #[error("receive framing buffer overflowed (cap {cap_bytes} bytes)")]
    FramingOverflow { cap_bytes: usize },

    #[error("malformed SYNC message: {0}")]
    ProtocolMalformed(String),

    #[error("session precondition failed: state is {state:?}, required {required}")]
    SessionPreconditionFailed { state: TherapyState, required: &'static str },

    #[error("battery critical: {voltage} V")]
    BatteryCritical { voltage: f32 },

    #[error("heartbeat timeout: no heartbeat received in {elapsed_s:.1}s")]
    HeartbeatTimeout { elapsed_s: f64 },

    #[error("reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

pub type CoreResult<T> = Result<T, CoreError>;
