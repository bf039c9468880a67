// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! Typed SYNC message variants.
//!
//! The source protocol carries an untyped key→(int|string) map per command.
//! This crate defines one tagged variant per command type instead: the codec
//! parses the generic key-list first, then validates it into one of these
//! variants, rejecting unknown or missing keys.

use std::collections::HashMap;
use std::fmt;

/// A decoded-but-not-yet-validated value: integers are coerced, everything
/// else is left as a string.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Int(i64),
    Str(String),
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Int(i) => write!(f, "{i}"),
            RawValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        match value.parse::<i64>() {
            Ok(i) => RawValue::Int(i),
            Err(_) => RawValue::Str(value.to_string()),
        }
    }
}

pub type RawData = HashMap<String, RawValue>;

/// One fully-decoded and validated SYNC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StartSession(StartSessionCommand),
    PauseSession,
    ResumeSession,
    StopSession { reason: String },
    ExecuteBuzz(ExecuteBuzzCommand),
    Deactivate { left_finger: u8, right_finger: u8 },
    Heartbeat { ts_us: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartSessionCommand {
    pub duration_sec: u32,
    pub pattern_type: String,
    pub jitter_percent_x10: u32,
    pub time_on_ms: u32,
    pub time_off_ms: u32,
    pub num_fingers: u8,
    pub mirror_pattern: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteBuzzCommand {
    pub left_finger: u8,
    pub right_finger: u8,
    pub amplitude: u8,
    pub seq: u64,
    pub timestamp_us: i64,
}

impl Message {
    pub fn cmd_name(&self) -> &'static str {
        match self {
            Message::StartSession(_) => "START_SESSION",
            Message::PauseSession => "PAUSE_SESSION",
            Message::ResumeSession => "RESUME_SESSION",
            Message::StopSession { .. } => "STOP_SESSION",
            Message::ExecuteBuzz(_) => "EXECUTE_BUZZ",
            Message::Deactivate { .. } => "DEACTIVATE",
            Message::Heartbeat { .. } => "HEARTBEAT",
        }
    }
}
