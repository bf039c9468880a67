// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! The PRIMARY application loop: ticks the pattern engine, sends heartbeats,
//! drains inbound menu traffic, flushes the outbound SYNC queue, and watches
//! the battery monitor for threshold crossings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, warn};

use crate::app::{log_memory_housekeeping, HOUSEKEEPING_INTERVAL_S, RECEIVE_TIMEOUT};
use crate::clock::Clock;
use crate::config::TherapyProfile;
use crate::engine::Engine;
use crate::error::CoreError;
use crate::ports::{ActuatorPort, BatteryMonitorPort, ConnectionHandle, LedPort, LinkPort, MenuPort};
use crate::protocol::{encode, Message};
use crate::recovery::HEARTBEAT_INTERVAL_S;
use crate::session::{SessionManager, StopReason};
use crate::state_machine::{StateMachine, TherapyState};

/// Drains up to this many queued outbound frames per tick.
const MAX_OUTBOUND_DRAIN_PER_TICK: usize = 5;

type OutboundQueue = Mutex<VecDeque<(ConnectionHandle, Vec<u8>)>>;

fn push_outbound(outbound: &OutboundQueue, conn: ConnectionHandle, message: &Message) {
    outbound.lock().expect("outbound queue mutex poisoned").push_back((conn, encode(message)));
}

/// Owns every collaborator the PRIMARY role needs and drives one tick at a
/// time. `run()` loops `tick()` at the nominal cadence; tests call `tick()`
/// directly against a [`crate::clock::FakeClock`] and stub ports.
pub struct PrimaryApp {
    clock: Arc<dyn Clock>,
    state: Arc<StateMachine>,
    engine: Arc<Engine>,
    session: Arc<SessionManager>,
    link: Arc<dyn LinkPort>,
    battery: Arc<dyn BatteryMonitorPort>,
    led: Arc<dyn LedPort>,
    menu: Arc<dyn MenuPort>,
    secondary_conn: ConnectionHandle,
    phone_conn: Mutex<Option<ConnectionHandle>>,
    outbound: Arc<OutboundQueue>,
    last_heartbeat_sent_ms: Mutex<Option<f64>>,
    last_housekeeping_ms: Mutex<Option<f64>>,
    battery_was_low: AtomicBool,
    battery_was_critical: AtomicBool,
}

impl PrimaryApp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        state: Arc<StateMachine>,
        actuator: Arc<dyn ActuatorPort>,
        link: Arc<dyn LinkPort>,
        battery: Arc<dyn BatteryMonitorPort>,
        led: Arc<dyn LedPort>,
        menu: Arc<dyn MenuPort>,
        secondary_conn: ConnectionHandle,
        phone_conn: Option<ConnectionHandle>,
    ) -> Arc<Self> {
        let outbound: Arc<OutboundQueue> = Arc::new(Mutex::new(VecDeque::new()));
        let engine = Arc::new(Engine::new(clock.clone(), actuator.clone()));

        let session_send = {
            let outbound = outbound.clone();
            Arc::new(move |message: Message| push_outbound(&outbound, secondary_conn, &message)) as Arc<dyn Fn(Message) + Send + Sync>
        };
        let session = Arc::new(SessionManager::new(clock.clone(), state.clone(), engine.clone(), actuator, session_send));

        {
            let session = session.clone();
            engine.on_cycle_complete(Arc::new(move |_cycles| session.on_cycle_complete()));
        }
        {
            let outbound = outbound.clone();
            engine.on_send_command(Arc::new(move |message| push_outbound(&outbound, secondary_conn, &message)));
        }

        Arc::new(PrimaryApp {
            clock,
            state,
            engine,
            session,
            link,
            battery,
            led,
            menu,
            secondary_conn,
            phone_conn: Mutex::new(phone_conn),
            outbound,
            last_heartbeat_sent_ms: Mutex::new(None),
            last_housekeeping_ms: Mutex::new(None),
            battery_was_low: AtomicBool::new(false),
            battery_was_critical: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    /// Runs `tick()` forever at the nominal cadence. Never returns under
    /// normal operation; the device requires a restart to exit this loop.
    pub async fn run(self: &Arc<Self>, amplitude_pct: u8) -> ! {
        loop {
            self.tick(amplitude_pct).await;
            tokio::time::sleep(crate::app::TICK_INTERVAL).await;
        }
    }

    /// One iteration of the PRIMARY loop body: tick the engine, maybe send a
    /// heartbeat, drain inbound menu traffic, flush queued outbound frames,
    /// push the LED state, poll the battery, and run housekeeping if due.
    pub async fn tick(&self, amplitude_pct: u8) {
        self.engine.tick(amplitude_pct).await;
        self.maybe_send_heartbeat();
        self.drain_inbound().await;
        self.drain_outbound().await;
        self.led.set_state(self.state.current()).await;
        self.poll_battery().await;
        self.maybe_run_housekeeping();
    }

    fn maybe_send_heartbeat(&self) {
        if !self.engine.is_running() {
            return;
        }
        let now = self.clock.now_ms();
        let due = {
            let mut last = self.last_heartbeat_sent_ms.lock().expect("primary app mutex poisoned");
            let due = last.map(|l| now - l >= HEARTBEAT_INTERVAL_S * 1000.0).unwrap_or(true);
            if due {
                *last = Some(now);
            }
            due
        };
        if due {
            let ts_us = self.clock.now_us();
            push_outbound(&self.outbound, self.secondary_conn, &Message::Heartbeat { ts_us });
        }
    }

    /// Polls every active connection slot for one inbound message. A `SYNC:`
    /// frame arriving on PRIMARY is unexpected (PRIMARY only ever sends SYNC
    /// commands) and is logged, not dispatched. Everything else is routed to
    /// the menu handler and its response is queued back to the same slot.
    async fn drain_inbound(&self) {
        let mut slots = vec![self.secondary_conn];
        if let Some(phone) = *self.phone_conn.lock().expect("primary app mutex poisoned") {
            slots.push(phone);
        }

        for conn in slots {
            match self.link.receive(conn, RECEIVE_TIMEOUT).await {
                Ok(Some(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if text.starts_with("SYNC:") {
                            warn!("unexpected SYNC traffic received on PRIMARY: {text:?}");
                        } else {
                            let response = self.menu.handle_command(&text).await;
                            self.outbound.lock().expect("outbound queue mutex poisoned").push_back((conn, response.into_bytes()));
                        }
                    }
                    Err(err) => warn!("dropped non-UTF8 inbound message: {err}"),
                },
                Ok(None) => {}
                Err(err) => warn!("link receive error on connection {conn}: {err}"),
            }
        }
    }

    async fn drain_outbound(&self) {
        for _ in 0..MAX_OUTBOUND_DRAIN_PER_TICK {
            let item = self.outbound.lock().expect("outbound queue mutex poisoned").pop_front();
            match item {
                Some((conn, bytes)) => {
                    if let Err(err) = self.link.send(conn, &bytes).await {
                        warn!("failed to send outbound frame to connection {conn}: {err}");
                    }
                }
                None => break,
            }
        }
    }

    async fn poll_battery(&self) {
        let status = self.battery.poll().await;

        let was_low = self.battery_was_low.swap(status.is_low, Ordering::SeqCst);
        if status.is_low && !was_low && self.engine.is_running() {
            warn!("battery low: {:.2} V", status.voltage);
            self.state.force(TherapyState::LowBattery, "battery_low");
        } else if !status.is_low && was_low && self.state.current() == TherapyState::LowBattery {
            self.state.force(TherapyState::Running, "battery_recovered");
        }

        let was_critical = self.battery_was_critical.swap(status.is_critical, Ordering::SeqCst);
        if status.is_critical && !was_critical && !self.state.current().is_error() {
            error!("battery critical: {:.2} V, initiating emergency shutdown", status.voltage);
            self.emergency_shutdown().await;
        }
    }

    /// Critical battery forces `CRITICAL_BATTERY` first so observers see the
    /// specific cause, then runs the same emergency stop path the session
    /// manager uses for a user-triggered emergency.
    async fn emergency_shutdown(&self) {
        self.state.force(TherapyState::CriticalBattery, "battery_critical");
        self.session.emergency_stop().await;
    }

    fn maybe_run_housekeeping(&self) {
        let now = self.clock.now_ms();
        let mut last = self.last_housekeeping_ms.lock().expect("primary app mutex poisoned");
        let due = last.map(|l| now - l >= HOUSEKEEPING_INTERVAL_S * 1000.0).unwrap_or(true);
        if due {
            *last = Some(now);
            log_memory_housekeeping();
        }
    }

    pub fn start_session(&self, profile: &TherapyProfile, random_seed: Option<u64>) -> Result<bool, CoreError> {
        self.session.start(profile, random_seed)
    }

    pub async fn stop_session(&self, reason: StopReason) -> bool {
        self.session.stop(reason).await
    }
}
