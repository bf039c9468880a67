// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! Abstract ports for the external collaborators this crate does not
//! implement: the actuator driver, the paired wireless transport, and the
//! battery monitor. Concrete hardware drivers live outside this crate and
//! implement these traits.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreError;

/// One logical connection slot. A device may hold at most one handle per
/// slot kind at any given time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionSlot {
    Primary,
    Secondary,
    Phone,
}

/// Opaque handle to an established link connection.
pub type ConnectionHandle = u64;

/// The multiplexed actuator driver: one vibration motor per finger.
#[async_trait]
pub trait ActuatorPort: Send + Sync {
    async fn activate(&self, finger_idx: u8, amplitude_pct: u8) -> Result<(), CoreError>;
    async fn deactivate(&self, finger_idx: u8) -> Result<(), CoreError>;
    async fn stop_all(&self, force: bool) -> Result<(), CoreError>;
    async fn emergency_stop(&self) -> Result<(), CoreError>;
}

/// The paired serial-over-radio link.
#[async_trait]
pub trait LinkPort: Send + Sync {
    async fn advertise(&self, name: &str) -> Result<(), CoreError>;
    async fn scan_and_connect(&self, name: &str, timeout: Duration) -> Result<ConnectionHandle, CoreError>;
    async fn set_identity(&self, name: &str) -> Result<(), CoreError>;
    async fn wait_for_connection(&self, slot: ConnectionSlot, timeout: Duration) -> Result<ConnectionHandle, CoreError>;
    async fn send(&self, conn: ConnectionHandle, bytes: &[u8]) -> Result<(), CoreError>;
    /// Returns `None` on timeout, never on a merely-empty read.
    async fn receive(&self, conn: ConnectionHandle, timeout: Duration) -> Result<Option<Vec<u8>>, CoreError>;
    async fn is_connected(&self, conn: ConnectionHandle) -> bool;
    async fn disconnect(&self, conn: ConnectionHandle);
}

/// Polled battery status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    pub voltage: f32,
    pub is_low: bool,
    pub is_critical: bool,
}

#[async_trait]
pub trait BatteryMonitorPort: Send + Sync {
    async fn poll(&self) -> BatteryStatus;
}

/// The LED indicator. Mapping from therapy state to a concrete blink/color
/// pattern is the presentation layer's responsibility; the core only pushes
/// the current state across.
#[async_trait]
pub trait LedPort: Send + Sync {
    async fn set_state(&self, state: crate::state_machine::TherapyState);
}

/// The external menu/command surface. Command grammar and semantics are out
/// of scope for this crate; the core only routes non-`SYNC:` frames to it
/// and enqueues whatever string response it returns for the same connection.
#[async_trait]
pub trait MenuPort: Send + Sync {
    async fn handle_command(&self, command: &str) -> String;
}
