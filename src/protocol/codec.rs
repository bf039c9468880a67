// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! The sync wire codec: framing (EOT-terminated, capped accumulator) plus
//! encode/decode of typed [`Message`] values.

use std::collections::VecDeque;

use tracing::warn;

use crate::error::CoreError;
use crate::protocol::message::{ExecuteBuzzCommand, Message, RawData, RawValue, StartSessionCommand};

/// Frame terminator byte.
pub const EOT: u8 = 0x04;

/// Default per-message receive buffer cap.
pub const DEFAULT_FRAME_CAP_BYTES: usize = 512;

/// Buffers incoming bytes for a single connection until complete,
/// EOT-terminated frames can be split off. Multiple frames arriving in one
/// transport read are queued and delivered one at a time, in arrival order,
/// by [`FrameAccumulator::receive_one`].
///
/// The accumulator owns one pre-allocated buffer for the lifetime of the
/// connection; `feed` never allocates a new buffer per packet.
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    cap: usize,
    completed: VecDeque<String>,
}

impl FrameAccumulator {
    pub fn new(cap: usize) -> Self {
        FrameAccumulator {
            buffer: Vec::with_capacity(cap),
            cap,
            completed: VecDeque::new(),
        }
    }

    /// Feed raw transport bytes into the accumulator. Any complete,
    /// EOT-terminated frames are appended to the internal FIFO in arrival
    /// order. A message that would overflow the cap before its terminator
    /// is dropped and the accumulator resets to empty; this never aborts
    /// the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == EOT {
                if !self.buffer.is_empty() {
                    match String::from_utf8(std::mem::take(&mut self.buffer)) {
                        Ok(frame) => self.completed.push_back(frame),
                        Err(e) => warn!("dropping non-UTF8 frame: {e}"),
                    }
                    self.buffer = Vec::with_capacity(self.cap);
                }
                // an EOT with an empty accumulator is simply ignored
            } else if self.buffer.len() >= self.cap {
                warn!("receive buffer overflow (cap {} bytes), resetting accumulator", self.cap);
                self.buffer.clear();
            } else {
                self.buffer.push(byte);
            }
        }
    }

    /// Pop one complete frame, if any are queued.
    pub fn receive_one(&mut self) -> Option<String> {
        self.completed.pop_front()
    }

    pub fn pending_count(&self) -> usize {
        self.completed.len()
    }
}

/// Encode a [`Message`] into a complete, EOT-terminated wire frame.
pub fn encode(message: &Message) -> Vec<u8> {
    let data = encode_data(message);
    let mut frame = format!("SYNC:{}:{}", message.cmd_name(), data).into_bytes();
    frame.push(EOT);
    frame
}

fn encode_data(message: &Message) -> String {
    let pairs: Vec<(String, String)> = match message {
        Message::StartSession(cmd) => vec![
            ("duration_sec".to_string(), cmd.duration_sec.to_string()),
            ("pattern_type".to_string(), cmd.pattern_type.clone()),
            ("jitter_percent".to_string(), cmd.jitter_percent_x10.to_string()),
            ("time_on_ms".to_string(), cmd.time_on_ms.to_string()),
            ("time_off_ms".to_string(), cmd.time_off_ms.to_string()),
            ("num_fingers".to_string(), cmd.num_fingers.to_string()),
            ("mirror_pattern".to_string(), (cmd.mirror_pattern as u8).to_string()),
        ],
        Message::PauseSession | Message::ResumeSession => vec![],
        Message::StopSession { reason } => vec![("reason".to_string(), reason.clone())],
        Message::ExecuteBuzz(cmd) => vec![
            ("left_finger".to_string(), cmd.left_finger.to_string()),
            ("right_finger".to_string(), cmd.right_finger.to_string()),
            ("amplitude".to_string(), cmd.amplitude.to_string()),
            ("seq".to_string(), cmd.seq.to_string()),
            ("timestamp".to_string(), cmd.timestamp_us.to_string()),
        ],
        Message::Deactivate { left_finger, right_finger } => vec![
            ("left_finger".to_string(), left_finger.to_string()),
            ("right_finger".to_string(), right_finger.to_string()),
        ],
        Message::Heartbeat { ts_us } => vec![("ts".to_string(), ts_us.to_string())],
    };

    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}|{v}"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Parse `SYNC:<CMD>:<DATA>` (without the trailing EOT, already stripped by
/// [`FrameAccumulator`]) into a raw key→value map, then validate it into a
/// typed [`Message`]. An unknown command, a missing required key, or an
/// unparseable value is a [`CoreError::ProtocolMalformed`] — the caller
/// logs and drops it, it never aborts the receive loop.
pub fn decode(frame: &str) -> Result<Message, CoreError> {
    let mut parts = frame.splitn(3, ':');
    let prefix = parts.next().unwrap_or_default();
    let cmd = parts.next().ok_or_else(|| CoreError::ProtocolMalformed(format!("missing CMD in {frame:?}")))?;
    let data_str = parts.next().unwrap_or("");

    if prefix != "SYNC" {
        return Err(CoreError::ProtocolMalformed(format!("missing SYNC prefix in {frame:?}")));
    }

    let data = parse_data(data_str)?;

    match cmd {
        "START_SESSION" => Ok(Message::StartSession(StartSessionCommand {
            duration_sec: require_int(&data, "duration_sec")? as u32,
            pattern_type: require_str(&data, "pattern_type")?,
            jitter_percent_x10: require_int(&data, "jitter_percent")? as u32,
            time_on_ms: require_int(&data, "time_on_ms")? as u32,
            time_off_ms: require_int(&data, "time_off_ms")? as u32,
            num_fingers: require_int(&data, "num_fingers")? as u8,
            mirror_pattern: require_int(&data, "mirror_pattern")? != 0,
        })),
        "PAUSE_SESSION" => Ok(Message::PauseSession),
        "RESUME_SESSION" => Ok(Message::ResumeSession),
        "STOP_SESSION" => Ok(Message::StopSession { reason: require_str(&data, "reason")? }),
        "EXECUTE_BUZZ" => Ok(Message::ExecuteBuzz(ExecuteBuzzCommand {
            left_finger: require_int(&data, "left_finger")? as u8,
            right_finger: require_int(&data, "right_finger")? as u8,
            amplitude: require_int(&data, "amplitude")? as u8,
            seq: require_int(&data, "seq")? as u64,
            timestamp_us: require_int(&data, "timestamp")?,
        })),
        "DEACTIVATE" => Ok(Message::Deactivate {
            left_finger: require_int(&data, "left_finger")? as u8,
            right_finger: require_int(&data, "right_finger")? as u8,
        }),
        "HEARTBEAT" => Ok(Message::Heartbeat { ts_us: require_int(&data, "ts")? }),
        other => Err(CoreError::ProtocolMalformed(format!("unknown CMD {other:?}"))),
    }
}

fn parse_data(data_str: &str) -> Result<RawData, CoreError> {
    if data_str.is_empty() {
        return Ok(RawData::new());
    }

    let tokens: Vec<&str> = data_str.split('|').collect();
    if tokens.len() % 2 != 0 {
        return Err(CoreError::ProtocolMalformed(format!("odd number of key|value tokens in {data_str:?}")));
    }

    let mut data = RawData::new();
    for pair in tokens.chunks_exact(2) {
        data.insert(pair[0].to_string(), RawValue::from(pair[1]));
    }
    Ok(data)
}

fn require_int(data: &RawData, key: &str) -> Result<i64, CoreError> {
    match data.get(key) {
        Some(RawValue::Int(i)) => Ok(*i),
        Some(RawValue::Str(s)) => Err(CoreError::ProtocolMalformed(format!("expected integer for key {key:?}, got {s:?}"))),
        None => Err(CoreError::ProtocolMalformed(format!("missing required key {key:?}"))),
    }
}

fn require_str(data: &RawData, key: &str) -> Result<String, CoreError> {
    match data.get(key) {
        Some(value) => Ok(value.to_string()),
        None => Err(CoreError::ProtocolMalformed(format!("missing required key {key:?}"))),
    }
}
