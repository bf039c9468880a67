// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! Heartbeat timeout detection and reconnection, run on SECONDARY only.
//! PRIMARY has no equivalent watchdog: it is the side that sends heartbeats,
//! not the side that waits for them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::ports::{ActuatorPort, ConnectionSlot, LinkPort};
use crate::state_machine::{StateMachine, TherapyState};

pub const HEARTBEAT_INTERVAL_S: f64 = 2.0;
pub const HEARTBEAT_TIMEOUT_S: f64 = 6.0;
pub const STALE_SESSION_WARNING_S: f64 = 10.0;
pub const RECONNECT_ATTEMPTS: u32 = 3;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const RECONNECT_SCAN_WINDOW: Duration = Duration::from_secs(10);

/// Tracks the last heartbeat received from PRIMARY and drives the
/// emergency-stop-then-reconnect sequence when it goes stale.
pub struct HeartbeatMonitor {
    clock: Arc<dyn Clock>,
    actuator: Arc<dyn ActuatorPort>,
    link: Arc<dyn LinkPort>,
    state: Arc<StateMachine>,
    ble_name: String,
    last_heartbeat_received_s: std::sync::Mutex<Option<f64>>,
}

impl HeartbeatMonitor {
    pub fn new(clock: Arc<dyn Clock>, actuator: Arc<dyn ActuatorPort>, link: Arc<dyn LinkPort>, state: Arc<StateMachine>, ble_name: String) -> Self {
        HeartbeatMonitor { clock, actuator, link, state, ble_name, last_heartbeat_received_s: std::sync::Mutex::new(None) }
    }

    pub fn record_heartbeat(&self) {
        let now_s = self.clock.now_ms() / 1000.0;
        *self.last_heartbeat_received_s.lock().expect("heartbeat monitor mutex poisoned") = Some(now_s);
    }

    fn clear(&self) {
        *self.last_heartbeat_received_s.lock().expect("heartbeat monitor mutex poisoned") = None;
    }

    /// `true` when the watchdog has tripped: a heartbeat was seen at least
    /// once and more than [`HEARTBEAT_TIMEOUT_S`] has elapsed since.
    pub fn is_timed_out(&self) -> bool {
        let now_s = self.clock.now_ms() / 1000.0;
        match *self.last_heartbeat_received_s.lock().expect("heartbeat monitor mutex poisoned") {
            Some(last) => now_s - last > HEARTBEAT_TIMEOUT_S,
            None => false,
        }
    }

    /// Runs the full recovery sequence: silence the actuator, force
    /// `CONNECTION_LOST`, clear the watchdog, then attempt reconnection.
    /// Safety ordering is load-bearing: the actuator is always silenced
    /// before any state transition fires.
    pub async fn recover(&self) {
        if let Err(err) = self.actuator.emergency_stop().await {
            warn!("actuator emergency_stop reported a fault during heartbeat recovery: {err}");
        }
        self.state.force(TherapyState::ConnectionLost, "heartbeat_timeout");
        self.clear();

        for attempt in 1..=RECONNECT_ATTEMPTS {
            info!("reconnect attempt {attempt}/{RECONNECT_ATTEMPTS}");
            match self.link.scan_and_connect(&self.ble_name, RECONNECT_SCAN_WINDOW).await {
                Ok(_handle) => {
                    self.state.force(TherapyState::Ready, "reconnected");
                    return;
                }
                Err(err) => {
                    warn!("reconnect attempt {attempt} failed: {err}");
                    if attempt < RECONNECT_ATTEMPTS {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }

        warn!("reconnection exhausted after {RECONNECT_ATTEMPTS} attempts");
        self.state.force(TherapyState::Idle, "reconnect_exhausted");
    }
}

/// Guards against stale-session log flooding: if RUNNING and more than
/// [`STALE_SESSION_WARNING_S`] has elapsed since the last SYNC command, log
/// once and reset the timestamp.
pub struct StaleSessionGuard {
    clock: Arc<dyn Clock>,
    last_sync_command_received_s: std::sync::Mutex<Option<f64>>,
}

impl StaleSessionGuard {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        StaleSessionGuard { clock, last_sync_command_received_s: std::sync::Mutex::new(None) }
    }

    pub fn record_sync_command(&self) {
        let now_s = self.clock.now_ms() / 1000.0;
        *self.last_sync_command_received_s.lock().expect("stale session guard mutex poisoned") = Some(now_s);
    }

    /// Returns `true` exactly once per stale interval: checking resets the
    /// timer so repeated calls while still stale don't re-fire.
    pub fn check_and_reset(&self, state_is_running: bool) -> bool {
        if !state_is_running {
            return false;
        }
        let now_s = self.clock.now_ms() / 1000.0;
        let mut guard = self.last_sync_command_received_s.lock().expect("stale session guard mutex poisoned");
        match *guard {
            Some(last) if now_s - last > STALE_SESSION_WARNING_S => {
                *guard = Some(now_s);
                true
            }
            _ => false,
        }
    }
}

pub fn connection_slot_for_role(role: crate::state_machine::DeviceRole) -> ConnectionSlot {
    match role {
        crate::state_machine::DeviceRole::Primary => ConnectionSlot::Secondary,
        crate::state_machine::DeviceRole::Secondary => ConnectionSlot::Primary,
    }
}
