// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! The SECONDARY application loop: drains the paired link into a
//! [`FrameAccumulator`], dispatches each decoded SYNC command, watches the
//! heartbeat monitor for a stale PRIMARY, and reports sync latency.
//!
//! SECONDARY never ticks a pattern engine and never owns a
//! [`crate::session::SessionManager`] — its view of the session lifecycle is
//! whatever the state machine reflects after each dispatched command.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::app::{log_memory_housekeeping, HOUSEKEEPING_INTERVAL_S, RECEIVE_TIMEOUT};
use crate::clock::Clock;
use crate::protocol::{decode, FrameAccumulator, Message, DEFAULT_FRAME_CAP_BYTES};
use crate::ports::{ActuatorPort, BatteryMonitorPort, ConnectionHandle, LedPort, LinkPort};
use crate::recovery::HeartbeatMonitor;
use crate::stats::SyncStats;
use crate::state_machine::{StateMachine, StateTrigger, TherapyState};

/// Owns every collaborator the SECONDARY role needs and drives one tick at a
/// time. `run()` loops `tick()` at the nominal cadence; tests call `tick()`
/// directly against a [`crate::clock::FakeClock`] and stub ports.
pub struct SecondaryApp {
    clock: Arc<dyn Clock>,
    state: Arc<StateMachine>,
    actuator: Arc<dyn ActuatorPort>,
    link: Arc<dyn LinkPort>,
    battery: Arc<dyn BatteryMonitorPort>,
    led: Arc<dyn LedPort>,
    heartbeat: HeartbeatMonitor,
    stale_session: crate::recovery::StaleSessionGuard,
    stats: SyncStats,
    primary_conn: ConnectionHandle,
    accumulator: Mutex<FrameAccumulator>,
    last_seq: Mutex<Option<u64>>,
    missed_commands: AtomicU64,
    last_housekeeping_ms: Mutex<Option<f64>>,
    battery_was_critical: AtomicBool,
}

impl SecondaryApp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        state: Arc<StateMachine>,
        actuator: Arc<dyn ActuatorPort>,
        link: Arc<dyn LinkPort>,
        battery: Arc<dyn BatteryMonitorPort>,
        led: Arc<dyn LedPort>,
        primary_conn: ConnectionHandle,
        ble_name: String,
    ) -> Arc<Self> {
        let heartbeat = HeartbeatMonitor::new(clock.clone(), actuator.clone(), link.clone(), state.clone(), ble_name);
        let stale_session = crate::recovery::StaleSessionGuard::new(clock.clone());

        Arc::new(SecondaryApp {
            clock,
            state,
            actuator,
            link,
            battery,
            led,
            heartbeat,
            stale_session,
            stats: SyncStats::new(crate::stats::DEFAULT_MAX_SAMPLES),
            primary_conn,
            accumulator: Mutex::new(FrameAccumulator::new(DEFAULT_FRAME_CAP_BYTES)),
            last_seq: Mutex::new(None),
            missed_commands: AtomicU64::new(0),
            last_housekeeping_ms: Mutex::new(None),
            battery_was_critical: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Cumulative count of gapped `EXECUTE_BUZZ` sequence numbers since boot.
    /// Telemetry only: gaps are never recovered, only reported (§5).
    pub fn missed_commands(&self) -> u64 {
        self.missed_commands.load(Ordering::SeqCst)
    }

    /// Runs `tick()` forever at the nominal cadence. Never returns under
    /// normal operation; the device requires a restart to exit this loop.
    pub async fn run(self: &Arc<Self>) -> ! {
        loop {
            self.tick().await;
            tokio::time::sleep(crate::app::TICK_INTERVAL).await;
        }
    }

    /// One iteration of the SECONDARY loop body: drain and dispatch inbound
    /// frames, check the heartbeat watchdog, check for a stale session, push
    /// the LED state, poll the battery, and run housekeeping if due.
    pub async fn tick(&self) {
        self.drain_inbound().await;

        if self.heartbeat.is_timed_out() {
            warn!("heartbeat timed out, starting recovery");
            self.heartbeat.recover().await;
        }

        if self.stale_session.check_and_reset(self.state.current() == TherapyState::Running) {
            warn!("no SYNC command received in over the stale-session window while RUNNING");
        }

        self.led.set_state(self.state.current()).await;
        self.poll_battery().await;
        self.maybe_run_housekeeping();
    }

    async fn drain_inbound(&self) {
        match self.link.receive(self.primary_conn, RECEIVE_TIMEOUT).await {
            Ok(Some(bytes)) => self.accumulator.lock().expect("frame accumulator mutex poisoned").feed(&bytes),
            Ok(None) => {}
            Err(err) => warn!("link receive error on connection {}: {err}", self.primary_conn),
        }

        let mut frames = Vec::new();
        {
            let mut acc = self.accumulator.lock().expect("frame accumulator mutex poisoned");
            while let Some(frame) = acc.receive_one() {
                frames.push(frame);
            }
        }

        for frame in frames {
            let t_receive_us = self.clock.now_us();
            match decode(&frame) {
                Ok(message) => self.dispatch_message(message, t_receive_us).await,
                Err(err) => warn!("dropping malformed SYNC frame: {err}"),
            }
        }
    }

    /// Handles one decoded SYNC command. `t_receive_us` is captured by the
    /// caller at the moment the frame was pulled off the wire, before any of
    /// this function's allocation-heavy work, so network latency reflects
    /// only actual transit time.
    async fn dispatch_message(&self, message: Message, t_receive_us: i64) {
        self.stale_session.record_sync_command();

        match message {
            Message::StartSession(_cmd) => {
                // pattern_type/jitter_percent are decoded for wire fidelity but
                // unused here: SECONDARY never runs a pattern engine, it only
                // tracks session lifecycle through state-machine transitions.
                self.state.transition(StateTrigger::StartSession);
            }
            Message::PauseSession => {
                self.state.transition(StateTrigger::PauseSession);
            }
            Message::ResumeSession => {
                self.state.transition(StateTrigger::ResumeSession);
            }
            Message::StopSession { reason } => {
                info!("received STOP_SESSION ({reason})");
                *self.last_seq.lock().expect("secondary app mutex poisoned") = None;
                self.state.transition(StateTrigger::StopSession);
                self.state.transition(StateTrigger::Stopped);
            }
            Message::ExecuteBuzz(cmd) => {
                self.check_seq_gap(cmd.seq);

                // May be negative if the two clocks are unsynchronised; recorded as-is.
                let network_latency_us = (t_receive_us - cmd.timestamp_us) as f64;
                let exec_start_us = self.clock.now_us();
                if let Err(err) = self.actuator.activate(cmd.left_finger, cmd.amplitude).await {
                    warn!("actuator activate fault on finger {}: {err}", cmd.left_finger);
                }
                if let Err(err) = self.actuator.activate(cmd.right_finger, cmd.amplitude).await {
                    warn!("actuator activate fault on finger {}: {err}", cmd.right_finger);
                }
                let execution_time_us = (self.clock.now_us() - exec_start_us).max(0) as f64;
                let total_latency_us = network_latency_us + execution_time_us;

                self.stats.add_sample(network_latency_us, execution_time_us, total_latency_us);
            }
            Message::Deactivate { left_finger, right_finger } => {
                if let Err(err) = self.actuator.deactivate(left_finger).await {
                    warn!("actuator deactivate fault on finger {left_finger}: {err}");
                }
                if let Err(err) = self.actuator.deactivate(right_finger).await {
                    warn!("actuator deactivate fault on finger {right_finger}: {err}");
                }
            }
            Message::Heartbeat { .. } => {
                self.heartbeat.record_heartbeat();
            }
        }
    }

    /// A gap is only ever logged, never treated as a fault: the sequence
    /// counter exists for telemetry, not flow control. Only a forward gap
    /// (`seq > last_seen_seq + 1`) counts as missed commands; a repeated or
    /// reordered lower `seq` is not double-counted.
    fn check_seq_gap(&self, seq: u64) {
        let mut last = self.last_seq.lock().expect("secondary app mutex poisoned");
        if let Some(prev) = *last {
            if seq > prev + 1 {
                let gap = seq - prev - 1;
                self.missed_commands.fetch_add(gap, Ordering::SeqCst);
                warn!("EXECUTE_BUZZ sequence gap: expected {}, got {seq} ({gap} missed)", prev + 1);
            }
        }
        *last = Some(seq);
    }

    async fn poll_battery(&self) {
        let status = self.battery.poll().await;
        let was_critical = self.battery_was_critical.swap(status.is_critical, Ordering::SeqCst);
        if status.is_critical && !was_critical && !self.state.current().is_error() {
            warn!("battery critical: {:.2} V, silencing actuator", status.voltage);
            if let Err(err) = self.actuator.emergency_stop().await {
                warn!("actuator emergency_stop reported a fault: {err}");
            }
            self.state.force(TherapyState::CriticalBattery, "battery_critical");
        }
    }

    fn maybe_run_housekeeping(&self) {
        let now = self.clock.now_ms();
        let mut last = self.last_housekeeping_ms.lock().expect("secondary app mutex poisoned");
        let due = last.map(|l| now - l >= HOUSEKEEPING_INTERVAL_S * 1000.0).unwrap_or(true);
        if due {
            *last = Some(now);
            log_memory_housekeeping();
            if let Some(report) = self.stats.report() {
                info!(
                    "sync stats: n={} mean={:.0}us p95={:.0}us p99={:.0}us within_target(mean/p95/p99)={}/{}/{}",
                    report.sample_count,
                    report.total_latency.mean,
                    report.total_latency.p95,
                    report.total_latency.p99,
                    report.mean_within_target,
                    report.p95_within_target,
                    report.p99_within_target,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::error::CoreError;
    use crate::ports::{BatteryStatus, ConnectionSlot};
    use crate::protocol::{encode, ExecuteBuzzCommand};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct RecordingActuator {
        activations: Mutex<Vec<(u8, u8)>>,
        deactivations: Mutex<Vec<u8>>,
        emergency_stops: AtomicUsize,
    }

    impl RecordingActuator {
        fn new() -> Self {
            RecordingActuator { activations: Mutex::new(Vec::new()), deactivations: Mutex::new(Vec::new()), emergency_stops: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ActuatorPort for RecordingActuator {
        async fn activate(&self, finger_idx: u8, amplitude_pct: u8) -> Result<(), CoreError> {
            self.activations.lock().unwrap().push((finger_idx, amplitude_pct));
            Ok(())
        }
        async fn deactivate(&self, finger_idx: u8) -> Result<(), CoreError> {
            self.deactivations.lock().unwrap().push(finger_idx);
            Ok(())
        }
        async fn stop_all(&self, _force: bool) -> Result<(), CoreError> {
            Ok(())
        }
        async fn emergency_stop(&self) -> Result<(), CoreError> {
            self.emergency_stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullLink;

    #[async_trait]
    impl LinkPort for NullLink {
        async fn advertise(&self, _name: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn scan_and_connect(&self, _name: &str, _timeout: Duration) -> Result<ConnectionHandle, CoreError> {
            Ok(1)
        }
        async fn set_identity(&self, _name: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn wait_for_connection(&self, _slot: ConnectionSlot, _timeout: Duration) -> Result<ConnectionHandle, CoreError> {
            Ok(1)
        }
        async fn send(&self, _conn: ConnectionHandle, _bytes: &[u8]) -> Result<(), CoreError> {
            Ok(())
        }
        async fn receive(&self, _conn: ConnectionHandle, _timeout: Duration) -> Result<Option<Vec<u8>>, CoreError> {
            Ok(None)
        }
        async fn is_connected(&self, _conn: ConnectionHandle) -> bool {
            true
        }
        async fn disconnect(&self, _conn: ConnectionHandle) {}
    }

    struct StubBattery {
        status: Mutex<BatteryStatus>,
    }

    #[async_trait]
    impl BatteryMonitorPort for StubBattery {
        async fn poll(&self) -> BatteryStatus {
            *self.status.lock().unwrap()
        }
    }

    struct NullLed;

    #[async_trait]
    impl LedPort for NullLed {
        async fn set_state(&self, _state: TherapyState) {}
    }

    fn make_app(actuator: Arc<RecordingActuator>) -> Arc<SecondaryApp> {
        let clock = Arc::new(FakeClock::new());
        let state = Arc::new(StateMachine::new(TherapyState::Ready));
        let link = Arc::new(NullLink);
        let battery = Arc::new(StubBattery { status: Mutex::new(BatteryStatus { voltage: 4.0, is_low: false, is_critical: false }) });
        let led = Arc::new(NullLed);
        SecondaryApp::new(clock, state, actuator, link, battery, led, 1, "glove".to_string())
    }

    #[tokio::test]
    async fn start_session_transitions_state_without_touching_actuator() {
        let actuator = Arc::new(RecordingActuator::new());
        let app = make_app(actuator.clone());
        app.dispatch_message(Message::StartSession(crate::protocol::StartSessionCommand {
            duration_sec: 60,
            pattern_type: "rndp".to_string(),
            jitter_percent_x10: 0,
            time_on_ms: 100,
            time_off_ms: 50,
            num_fingers: 5,
            mirror_pattern: false,
        }), 0).await;
        assert_eq!(app.state.current(), TherapyState::Running);
        assert!(actuator.activations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_session_lands_back_on_idle() {
        let actuator = Arc::new(RecordingActuator::new());
        let app = make_app(actuator);
        app.state.transition(StateTrigger::StartSession);
        app.dispatch_message(Message::StopSession { reason: "USER".to_string() }, 0).await;
        assert_eq!(app.state.current(), TherapyState::Idle);
    }

    #[tokio::test]
    async fn execute_buzz_activates_both_fingers_and_records_a_sample() {
        let actuator = Arc::new(RecordingActuator::new());
        let app = make_app(actuator.clone());
        app.dispatch_message(
            Message::ExecuteBuzz(ExecuteBuzzCommand { left_finger: 1, right_finger: 3, amplitude: 80, seq: 0, timestamp_us: 0 }),
            500,
        )
        .await;

        assert_eq!(actuator.activations.lock().unwrap().as_slice(), [(1, 80), (3, 80)]);
        assert_eq!(app.stats.len(), 1);
    }

    #[tokio::test]
    async fn seq_gap_is_logged_but_does_not_stop_processing() {
        let actuator = Arc::new(RecordingActuator::new());
        let app = make_app(actuator.clone());
        app.dispatch_message(Message::ExecuteBuzz(ExecuteBuzzCommand { left_finger: 0, right_finger: 0, amplitude: 50, seq: 0, timestamp_us: 0 }), 0).await;
        app.dispatch_message(Message::ExecuteBuzz(ExecuteBuzzCommand { left_finger: 0, right_finger: 0, amplitude: 50, seq: 5, timestamp_us: 0 }), 0).await;
        assert_eq!(app.stats.len(), 2);
    }

    #[tokio::test]
    async fn seq_gap_increments_missed_commands_by_the_gap_size() {
        let actuator = Arc::new(RecordingActuator::new());
        let app = make_app(actuator.clone());
        app.dispatch_message(Message::ExecuteBuzz(ExecuteBuzzCommand { left_finger: 0, right_finger: 0, amplitude: 50, seq: 0, timestamp_us: 0 }), 0).await;
        app.dispatch_message(Message::ExecuteBuzz(ExecuteBuzzCommand { left_finger: 0, right_finger: 0, amplitude: 50, seq: 3, timestamp_us: 0 }), 0).await;
        assert_eq!(app.missed_commands(), 2);
    }

    #[tokio::test]
    async fn repeated_or_reordered_seq_does_not_inflate_missed_commands() {
        let actuator = Arc::new(RecordingActuator::new());
        let app = make_app(actuator.clone());
        app.dispatch_message(Message::ExecuteBuzz(ExecuteBuzzCommand { left_finger: 0, right_finger: 0, amplitude: 50, seq: 5, timestamp_us: 0 }), 0).await;
        app.dispatch_message(Message::ExecuteBuzz(ExecuteBuzzCommand { left_finger: 0, right_finger: 0, amplitude: 50, seq: 3, timestamp_us: 0 }), 0).await;
        assert_eq!(app.missed_commands(), 0);
    }

    #[tokio::test]
    async fn heartbeat_is_recorded_and_clears_timeout() {
        let actuator = Arc::new(RecordingActuator::new());
        let app = make_app(actuator);
        app.dispatch_message(Message::Heartbeat { ts_us: 0 }, 0).await;
        assert!(!app.heartbeat.is_timed_out());
    }

    #[tokio::test]
    async fn inbound_frame_is_decoded_from_accumulated_bytes() {
        let actuator = Arc::new(RecordingActuator::new());
        let app = make_app(actuator.clone());
        let frame = encode(&Message::Deactivate { left_finger: 2, right_finger: 4 });
        app.accumulator.lock().unwrap().feed(&frame);
        app.drain_inbound().await;
        assert_eq!(actuator.deactivations.lock().unwrap().as_slice(), [2, 4]);
    }
}
