// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! The bilateral session lifecycle manager: binds the state machine, the
//! pattern engine, and a send callback for lifecycle commands, and keeps a
//! bounded history of past sessions.
//!
//! This is PRIMARY-only; SECONDARY tracks session lifecycle purely through
//! state-machine transitions driven by received SYNC commands (see
//! `app::secondary`), never through a `SessionManager` of its own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::warn;

use crate::clock::Clock;
use crate::config::TherapyProfile;
use crate::engine::{Engine, PatternType};
use crate::error::CoreError;
use crate::ports::ActuatorPort;
use crate::protocol::message::Message;
use crate::state_machine::{StateMachine, StateTrigger};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    User,
    Completed,
    Emergency,
    Fault,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::User => "USER",
            StopReason::Completed => "COMPLETED",
            StopReason::Emergency => "EMERGENCY",
            StopReason::Fault => "FAULT",
        }
    }
}

/// Live state for the session currently in progress. Dropped on stop.
#[derive(Debug, Clone)]
struct SessionContext {
    session_id: String,
    profile_name: String,
    start_ts: f64,
    pause_ts: Option<f64>,
    total_pause_s: f64,
    session_duration_s: f64,
    cycles_completed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub profile_name: String,
    pub start_ts: f64,
    pub end_ts: f64,
    pub duration_s: f64,
    pub elapsed_s: f64,
    pub pause_duration_s: f64,
    pub cycles_completed: u64,
    pub completion_pct: f64,
    pub stop_reason: StopReason,
}

pub type LifecycleObserver = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type StoppedObserver = Arc<dyn Fn(&str, StopReason) + Send + Sync>;

/// Binds the state machine, pattern engine, and a send callback for SYNC
/// lifecycle commands; owns the bounded session history ring buffer.
pub struct SessionManager {
    clock: Arc<dyn Clock>,
    state: Arc<StateMachine>,
    engine: Arc<Engine>,
    actuator: Arc<dyn ActuatorPort>,
    send: Arc<dyn Fn(Message) + Send + Sync>,
    context: Mutex<Option<SessionContext>>,
    history: Mutex<VecDeque<SessionRecord>>,
    history_capacity: usize,
    next_session_id: AtomicU64,
    on_started: Mutex<Vec<LifecycleObserver>>,
    on_paused: Mutex<Vec<LifecycleObserver>>,
    on_resumed: Mutex<Vec<LifecycleObserver>>,
    on_stopped: Mutex<Vec<StoppedObserver>>,
}

impl SessionManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        state: Arc<StateMachine>,
        engine: Arc<Engine>,
        actuator: Arc<dyn ActuatorPort>,
        send: Arc<dyn Fn(Message) + Send + Sync>,
    ) -> Self {
        SessionManager {
            clock,
            state,
            engine,
            actuator,
            send,
            context: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            next_session_id: AtomicU64::new(1),
            on_started: Mutex::new(Vec::new()),
            on_paused: Mutex::new(Vec::new()),
            on_resumed: Mutex::new(Vec::new()),
            on_stopped: Mutex::new(Vec::new()),
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn on_started(&self, observer: LifecycleObserver) {
        self.on_started.lock().expect("session manager mutex poisoned").push(observer);
    }

    pub fn on_paused(&self, observer: LifecycleObserver) {
        self.on_paused.lock().expect("session manager mutex poisoned").push(observer);
    }

    pub fn on_resumed(&self, observer: LifecycleObserver) {
        self.on_resumed.lock().expect("session manager mutex poisoned").push(observer);
    }

    pub fn on_stopped(&self, observer: StoppedObserver) {
        self.on_stopped.lock().expect("session manager mutex poisoned").push(observer);
    }

    pub fn is_active(&self) -> bool {
        self.context.lock().expect("session manager mutex poisoned").is_some()
    }

    pub fn history(&self) -> Vec<SessionRecord> {
        self.history.lock().expect("session manager mutex poisoned").iter().cloned().collect()
    }

    /// A serializable snapshot of the session history ring buffer, for the
    /// menu/command surface's history export. The source returns a
    /// list-of-maps; `SessionRecord` is already a typed, `serde`-serializable
    /// struct, so the snapshot is just a clone of the current buffer.
    pub fn export_history(&self) -> Vec<SessionRecord> {
        self.history()
    }

    fn allocate_session_id(&self) -> String {
        let n = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        format!("session_{n:04}")
    }

    /// Fails (returns `false`) if a session is already active or the state
    /// machine rejects `START_SESSION` from the current state. On success:
    /// transitions state, fires `on_started`, emits `START_SESSION` over the
    /// link, and starts the engine.
    pub fn start(&self, profile: &TherapyProfile, random_seed: Option<u64>) -> Result<bool, CoreError> {
        if self.is_active() {
            return Ok(false);
        }
        if !self.state.current().can_start_therapy() {
            return Ok(false);
        }

        let session_id = self.allocate_session_id();
        self.state.transition(StateTrigger::StartSession);

        if self.state.current() != crate::state_machine::TherapyState::Running {
            // the state machine rejected the transition; no context was ever installed
            return Ok(false);
        }

        let now = self.clock.now_ms();
        *self.context.lock().expect("session manager mutex poisoned") = Some(SessionContext {
            session_id: session_id.clone(),
            profile_name: profile.name.clone(),
            start_ts: now,
            pause_ts: None,
            total_pause_s: 0.0,
            session_duration_s: profile.session_duration_sec() as f64,
            cycles_completed: 0,
        });

        self.notify_lifecycle(&self.on_started, &session_id, &profile.name);

        let pattern_type = PatternType::parse(&profile.pattern_type)?;
        let params = profile.to_pattern_params(random_seed);
        let burst_duration_ms = profile.time_on_ms as f64;
        if let Err(err) = self.engine.start_session(profile.session_duration_sec(), pattern_type, params, burst_duration_ms) {
            warn!("engine failed to start session {session_id}: {err}");
            *self.context.lock().expect("session manager mutex poisoned") = None;
            return Err(err);
        }

        (self.send)(Message::StartSession(crate::protocol::message::StartSessionCommand {
            duration_sec: profile.session_duration_sec(),
            pattern_type: profile.pattern_type.clone(),
            jitter_percent_x10: profile.jitter_percent_x10(),
            time_on_ms: profile.time_on_ms,
            time_off_ms: profile.time_off_ms,
            num_fingers: profile.num_fingers,
            mirror_pattern: profile.mirror_pattern,
        }));

        Ok(true)
    }

    pub fn pause(&self) -> bool {
        if !self.state.current().can_pause() {
            return false;
        }
        let session_id = match self.context.lock().expect("session manager mutex poisoned").as_mut() {
            Some(ctx) => {
                ctx.pause_ts = Some(self.clock.now_ms());
                ctx.session_id.clone()
            }
            None => return false,
        };

        self.state.transition(StateTrigger::PauseSession);
        self.engine.pause();
        (self.send)(Message::PauseSession);
        self.notify_lifecycle(&self.on_paused, &session_id, "");
        true
    }

    pub fn resume(&self) -> bool {
        if !self.state.current().can_resume() {
            return false;
        }
        let session_id = {
            let mut guard = self.context.lock().expect("session manager mutex poisoned");
            match guard.as_mut() {
                Some(ctx) => {
                    if let Some(pause_ts) = ctx.pause_ts.take() {
                        let now = self.clock.now_ms();
                        ctx.total_pause_s += ((now - pause_ts) / 1000.0).max(0.0);
                    }
                    ctx.session_id.clone()
                }
                None => return false,
            }
        };

        self.state.transition(StateTrigger::ResumeSession);
        self.engine.resume();
        (self.send)(Message::ResumeSession);
        self.notify_lifecycle(&self.on_resumed, &session_id, "");
        true
    }

    /// Records a [`SessionRecord`], emits `STOP_SESSION`, stops the engine,
    /// and double-transitions the state machine `STOP_SESSION` then
    /// `STOPPED`, landing back on `IDLE`.
    pub async fn stop(&self, reason: StopReason) -> bool {
        let ctx = match self.context.lock().expect("session manager mutex poisoned").take() {
            Some(ctx) => ctx,
            None => return false,
        };

        let cycles_completed = ctx.cycles_completed;
        (self.send)(Message::StopSession { reason: reason.as_str().to_string() });
        self.engine.stop().await;
        self.state.transition(StateTrigger::StopSession);
        self.state.transition(StateTrigger::Stopped);

        let end_ts = self.clock.now_ms();
        let elapsed_s = self.elapsed_from(&ctx, end_ts);
        let completion_pct = if ctx.session_duration_s > 0.0 { (elapsed_s / ctx.session_duration_s * 100.0).min(100.0) } else { 0.0 };

        let record = SessionRecord {
            session_id: ctx.session_id.clone(),
            profile_name: ctx.profile_name.clone(),
            start_ts: ctx.start_ts,
            end_ts,
            duration_s: ctx.session_duration_s,
            elapsed_s,
            pause_duration_s: ctx.total_pause_s,
            cycles_completed,
            completion_pct,
            stop_reason: reason,
        };
        self.push_history(record);
        self.notify_stopped(&ctx.session_id, reason);
        true
    }

    /// Safety-first shutdown: `STOP_SESSION` is sent before the actuator is
    /// silenced, so the follower stops as early as possible; the actuator is
    /// forced off before the state machine moves to `ERROR`; no history
    /// entry is written.
    pub async fn emergency_stop(&self) {
        let had_session = self.context.lock().expect("session manager mutex poisoned").take().is_some();
        if !had_session {
            return;
        }

        (self.send)(Message::StopSession { reason: StopReason::Emergency.as_str().to_string() });
        if let Err(err) = self.actuator.emergency_stop().await {
            warn!("actuator emergency_stop reported a fault: {err}");
        }
        self.engine.stop().await;
        self.state.force(crate::state_machine::TherapyState::Error, "emergency_stop");
    }

    /// Consumes one `cycle_complete` event from the engine. No-op if no
    /// session is active, so a cycle completing after a stop race is silently
    /// dropped rather than attributed to the next session.
    pub fn on_cycle_complete(&self) {
        let mut guard = self.context.lock().expect("session manager mutex poisoned");
        if let Some(ctx) = guard.as_mut() {
            ctx.cycles_completed += 1;
        }
    }

    /// `now − start_ts − total_pause_s`, never negative. Monotonic
    /// non-decreasing while the session is active: `total_pause_s` only
    /// grows on resume, never shrinks.
    pub fn elapsed(&self) -> f64 {
        let guard = self.context.lock().expect("session manager mutex poisoned");
        match guard.as_ref() {
            Some(ctx) => self.elapsed_from(ctx, self.clock.now_ms()),
            None => 0.0,
        }
    }

    fn elapsed_from(&self, ctx: &SessionContext, now: f64) -> f64 {
        let pause_in_progress = ctx.pause_ts.map(|p| ((now - p) / 1000.0).max(0.0)).unwrap_or(0.0);
        (((now - ctx.start_ts) / 1000.0) - ctx.total_pause_s - pause_in_progress).max(0.0)
    }

    fn push_history(&self, record: SessionRecord) {
        let mut history = self.history.lock().expect("session manager mutex poisoned");
        if history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    fn notify_lifecycle(&self, observers: &Mutex<Vec<LifecycleObserver>>, session_id: &str, extra: &str) {
        for observer in observers.lock().expect("session manager mutex poisoned").iter() {
            observer(session_id, extra);
        }
    }

    fn notify_stopped(&self, session_id: &str, reason: StopReason) {
        for observer in self.on_stopped.lock().expect("session manager mutex poisoned").iter() {
            observer(session_id, reason);
        }
    }
}
