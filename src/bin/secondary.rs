// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! SECONDARY entry point: parses CLI args, loads device configuration,
//! brings up the paired link, and runs
//! [`bilateral_haptic_core::app::secondary::SecondaryApp`] forever.
//!
//! The actuator/link/battery/LED implementations below are logging
//! stand-ins for the real hardware drivers, which live outside this crate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info, warn};

use bilateral_haptic_core::app::secondary::SecondaryApp;
use bilateral_haptic_core::boot::{boot_secondary, BootResult};
use bilateral_haptic_core::clock::MonotonicClock;
use bilateral_haptic_core::config::DeviceConfig;
use bilateral_haptic_core::error::CoreError;
use bilateral_haptic_core::ports::{
    ActuatorPort, BatteryMonitorPort, BatteryStatus, ConnectionHandle, ConnectionSlot, LedPort, LinkPort,
};
use bilateral_haptic_core::state_machine::TherapyState;
use bilateral_haptic_core::util;

#[derive(Parser, Debug)]
#[command(name = "haptic-secondary", about = "Runs the SECONDARY side of a bilateral haptic therapy pair", long_version = env!("CLAP_VERSION"))]
struct CliArgs {
    /// Increase log verbosity (-v, -vv, -vvv, ...)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log to stdout instead of a rotating log file
    #[arg(long)]
    stdout: bool,

    /// Override the verbosity-derived log filter (tracing-subscriber EnvFilter syntax)
    #[arg(long)]
    log_filter: Option<String>,

    /// Path to the device identity/role TOML document
    #[arg(long, default_value = "device.toml")]
    device_config: PathBuf,
}

fn main() {
    let args = CliArgs::parse();
    let _guard = util::logging::init(args.verbose, args.log_filter.clone(), args.stdout);
    util::panic::set_hook();

    util::GLOBAL_TOKIO_RUNTIME.block_on(run(args));
}

async fn run(args: CliArgs) {
    let device_config = match load_device_config(&args.device_config) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load device config {:?}: {err}", args.device_config);
            return;
        }
    };

    info!("booting as SECONDARY, pairing with ble_name={}", device_config.ble_name);

    let link: Arc<dyn LinkPort> = Arc::new(LoggingLink);
    let (result, primary_handle) =
        boot_secondary(&*link, &device_config.ble_name, Duration::from_secs(device_config.startup_window_sec as u64)).await;

    let primary_conn = match result {
        BootResult::Failed => {
            error!("boot failed: no PRIMARY found within the startup window");
            return;
        }
        _ => primary_handle.expect("boot succeeded implies a PRIMARY handle"),
    };
    info!("boot complete: {result:?}");

    let clock = Arc::new(MonotonicClock::default());
    let state = Arc::new(bilateral_haptic_core::state_machine::StateMachine::new(TherapyState::Idle));
    state.transition(bilateral_haptic_core::state_machine::StateTrigger::Connected);

    let app = SecondaryApp::new(
        clock,
        state,
        Arc::new(LoggingActuator),
        link,
        Arc::new(LoggingBattery),
        Arc::new(LoggingLed),
        primary_conn,
        device_config.ble_name,
    );

    app.run().await;
}

fn load_device_config(path: &PathBuf) -> Result<DeviceConfig, CoreError> {
    let text = std::fs::read_to_string(path).map_err(|e| CoreError::ConfigurationMissing(e.to_string()))?;
    toml::from_str(&text).map_err(|e| CoreError::ConfigurationMissing(e.to_string()))
}

struct LoggingActuator;

#[async_trait]
impl ActuatorPort for LoggingActuator {
    async fn activate(&self, finger_idx: u8, amplitude_pct: u8) -> Result<(), CoreError> {
        info!("actuator: activate finger {finger_idx} at {amplitude_pct}%");
        Ok(())
    }
    async fn deactivate(&self, finger_idx: u8) -> Result<(), CoreError> {
        info!("actuator: deactivate finger {finger_idx}");
        Ok(())
    }
    async fn stop_all(&self, force: bool) -> Result<(), CoreError> {
        info!("actuator: stop_all(force={force})");
        Ok(())
    }
    async fn emergency_stop(&self) -> Result<(), CoreError> {
        warn!("actuator: EMERGENCY STOP");
        Ok(())
    }
}

struct LoggingLink;

#[async_trait]
impl LinkPort for LoggingLink {
    async fn advertise(&self, name: &str) -> Result<(), CoreError> {
        info!("link: advertising as {name}");
        Ok(())
    }
    async fn scan_and_connect(&self, name: &str, _timeout: Duration) -> Result<ConnectionHandle, CoreError> {
        Err(CoreError::LinkUnavailable(format!("no scan/connect backend wired up for {name}")))
    }
    async fn set_identity(&self, name: &str) -> Result<(), CoreError> {
        info!("link: identity set to {name}");
        Ok(())
    }
    async fn wait_for_connection(&self, slot: ConnectionSlot, _timeout: Duration) -> Result<ConnectionHandle, CoreError> {
        Err(CoreError::LinkUnavailable(format!("no transport backend wired up for slot {slot:?}")))
    }
    async fn send(&self, conn: ConnectionHandle, bytes: &[u8]) -> Result<(), CoreError> {
        info!("link: send {} bytes to connection {conn}", bytes.len());
        Ok(())
    }
    async fn receive(&self, _conn: ConnectionHandle, _timeout: Duration) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(None)
    }
    async fn is_connected(&self, _conn: ConnectionHandle) -> bool {
        true
    }
    async fn disconnect(&self, conn: ConnectionHandle) {
        info!("link: disconnect {conn}");
    }
}

struct LoggingBattery;

#[async_trait]
impl BatteryMonitorPort for LoggingBattery {
    async fn poll(&self) -> BatteryStatus {
        BatteryStatus { voltage: 4.0, is_low: false, is_critical: false }
    }
}

struct LoggingLed;

#[async_trait]
impl LedPort for LoggingLed {
    async fn set_state(&self, state: TherapyState) {
        tracing::trace!("led: {state:?}");
    }
}
