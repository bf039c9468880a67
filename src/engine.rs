// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! The pattern/scheduler engine: generates per-cycle finger sequences and
//! drives burst-on/burst-off transitions against a monotonic clock.
//!
//! Ticked only on PRIMARY; SECONDARY executes bursts exclusively from
//! received `EXECUTE_BUZZ` commands and never ticks its own engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{error, warn};

use crate::clock::Clock;
use crate::error::CoreError;
use crate::ports::ActuatorPort;
use crate::protocol::message::{ExecuteBuzzCommand, Message};

/// Which of the three generator families produced a [`Pattern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    Rndp,
    Sequential,
    Mirrored,
}

impl PatternType {
    pub fn parse(tag: &str) -> Result<Self, CoreError> {
        match tag {
            "rndp" => Ok(PatternType::Rndp),
            "sequential" => Ok(PatternType::Sequential),
            "mirrored" => Ok(PatternType::Mirrored),
            other => Err(CoreError::PatternInvariantViolation(format!("unknown pattern_type {other:?}"))),
        }
    }
}

/// One generated cycle: finger sequences for both hands plus per-step timing.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub left_sequence: Vec<u8>,
    pub right_sequence: Vec<u8>,
    pub timing_ms: Vec<f64>,
    pub burst_duration_ms: f64,
}

impl Pattern {
    /// Fails if the three sequences are not all the same length. This is a
    /// construction-time invariant, never relaxed after the fact.
    pub fn new(left_sequence: Vec<u8>, right_sequence: Vec<u8>, timing_ms: Vec<f64>, burst_duration_ms: f64) -> Result<Self, CoreError> {
        if left_sequence.len() != right_sequence.len() || left_sequence.len() != timing_ms.len() {
            return Err(CoreError::PatternInvariantViolation(format!(
                "sequence length mismatch: left={} right={} timing={}",
                left_sequence.len(),
                right_sequence.len(),
                timing_ms.len()
            )));
        }
        Ok(Pattern { left_sequence, right_sequence, timing_ms, burst_duration_ms })
    }

    pub fn len(&self) -> usize {
        self.left_sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left_sequence.is_empty()
    }
}

/// Parameters controlling pattern generation, derived from a therapy profile.
#[derive(Debug, Clone)]
pub struct PatternGeneratorParams {
    pub num_fingers: u8,
    pub mirror_pattern: bool,
    /// `randomize` for the `mirrored` family: toggles shuffle vs identity order.
    pub randomize: bool,
    /// `reversed` for the `sequential` family.
    pub reversed: bool,
    pub random_seed: Option<u64>,
    pub jitter_percent: f64,
    pub time_on_ms: f64,
    pub time_off_ms: f64,
}

impl PatternGeneratorParams {
    pub fn inter_burst_interval_ms(&self) -> f64 {
        4.0 * (self.time_on_ms + self.time_off_ms)
    }
}

fn make_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}

fn identity_sequence(n: u8) -> Vec<u8> {
    (0..n).collect()
}

fn shuffled_sequence(n: u8, rng: &mut ChaCha8Rng) -> Vec<u8> {
    let mut seq = identity_sequence(n);
    seq.shuffle(rng);
    seq
}

fn jittered_timing(n: usize, interval_ms: f64, jitter_percent: f64, rng: &mut ChaCha8Rng) -> Vec<f64> {
    let j = jitter_percent / 100.0;
    (0..n)
        .map(|_| {
            if j == 0.0 {
                interval_ms
            } else {
                let factor = 1.0 + rng.gen_range(-j..=j);
                interval_ms * factor
            }
        })
        .collect()
}

/// Generate one cycle's [`Pattern`] from `params`, per the three generator
/// families described for the engine.
pub fn generate_pattern(pattern_type: PatternType, params: &PatternGeneratorParams, burst_duration_ms: f64) -> Result<Pattern, CoreError> {
    let n = params.num_fingers;
    let mut rng = make_rng(params.random_seed);
    let interval = params.inter_burst_interval_ms();

    let (left, right) = match pattern_type {
        PatternType::Rndp => {
            let left = shuffled_sequence(n, &mut rng);
            let right = if params.mirror_pattern { left.clone() } else { shuffled_sequence(n, &mut rng) };
            (left, right)
        }
        PatternType::Sequential => {
            let mut left = identity_sequence(n);
            if params.reversed {
                left.reverse();
            }
            let right = if params.mirror_pattern {
                left.clone()
            } else {
                let mut r = left.clone();
                r.reverse();
                r
            };
            (left, right)
        }
        PatternType::Mirrored => {
            let left = if params.randomize { shuffled_sequence(n, &mut rng) } else { identity_sequence(n) };
            let right = left.clone();
            (left, right)
        }
    };

    let timing = jittered_timing(left.len(), interval, params.jitter_percent, &mut rng);
    Pattern::new(left, right, timing, burst_duration_ms)
}

/// Fired once per completed cycle, after the next pattern has been generated.
pub type CycleCompleteObserver = Arc<dyn Fn(u64) + Send + Sync>;

/// Fired on every EXECUTE_BUZZ activation, so the session layer can send it
/// over the link. Not invoked on SECONDARY, which never ticks an engine.
pub type SendCommandObserver = Arc<dyn Fn(Message) + Send + Sync>;

struct EngineState {
    running: bool,
    paused: bool,
    current_pattern: Option<Pattern>,
    pattern_type: Option<PatternType>,
    params: Option<PatternGeneratorParams>,
    step_idx: usize,
    step_start_ts: f64,
    burst_on: bool,
    session_deadline_ts: f64,
    cycles_completed: u64,
    total_activations: u64,
}

/// The pattern/scheduler engine. PRIMARY owns exactly one instance and ticks
/// it from the application loop; SECONDARY never constructs one for live use.
pub struct Engine {
    clock: Arc<dyn Clock>,
    actuator: Arc<dyn ActuatorPort>,
    state: Mutex<EngineState>,
    sequence_counter: AtomicU64,
    cycle_observers: Mutex<Vec<CycleCompleteObserver>>,
    send_observers: Mutex<Vec<SendCommandObserver>>,
}

impl Engine {
    pub fn new(clock: Arc<dyn Clock>, actuator: Arc<dyn ActuatorPort>) -> Self {
        Engine {
            clock,
            actuator,
            state: Mutex::new(EngineState {
                running: false,
                paused: false,
                current_pattern: None,
                pattern_type: None,
                params: None,
                step_idx: 0,
                step_start_ts: 0.0,
                burst_on: false,
                session_deadline_ts: 0.0,
                cycles_completed: 0,
                total_activations: 0,
            }),
            sequence_counter: AtomicU64::new(0),
            cycle_observers: Mutex::new(Vec::new()),
            send_observers: Mutex::new(Vec::new()),
        }
    }

    pub fn on_cycle_complete(&self, observer: CycleCompleteObserver) {
        self.cycle_observers.lock().expect("engine mutex poisoned").push(observer);
    }

    pub fn on_send_command(&self, observer: SendCommandObserver) {
        self.send_observers.lock().expect("engine mutex poisoned").push(observer);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("engine mutex poisoned").running
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().expect("engine mutex poisoned").paused
    }

    pub fn cycles_completed(&self) -> u64 {
        self.state.lock().expect("engine mutex poisoned").cycles_completed
    }

    /// Transitions the engine to running, resets stats, computes the session
    /// deadline, and generates the first pattern. Explicitly clears `paused`
    /// even though nothing else in the engine's observable surface does —
    /// a stale pause flag from a prior session must never leak into a new one.
    pub fn start_session(
        &self,
        duration_sec: u32,
        pattern_type: PatternType,
        params: PatternGeneratorParams,
        burst_duration_ms: f64,
    ) -> Result<(), CoreError> {
        let pattern = generate_pattern(pattern_type, &params, burst_duration_ms)?;
        let now = self.clock.now_ms();

        let mut state = self.state.lock().expect("engine mutex poisoned");
        state.running = true;
        state.paused = false;
        state.current_pattern = Some(pattern);
        state.pattern_type = Some(pattern_type);
        state.params = Some(params);
        state.step_idx = 0;
        state.step_start_ts = now;
        state.burst_on = false;
        state.session_deadline_ts = now + (duration_sec as f64) * 1000.0;
        state.cycles_completed = 0;
        state.total_activations = 0;
        self.sequence_counter.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// While paused, `tick()` is a no-op; on resume the step clock is
    /// re-anchored so elapsed pause time never counts against burst timing.
    pub fn pause(&self) {
        self.state.lock().expect("engine mutex poisoned").paused = true;
    }

    pub fn resume(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().expect("engine mutex poisoned");
        state.paused = false;
        state.step_start_ts = now;
    }

    /// Clears `running` and deactivates any currently-on finger pair.
    pub async fn stop(&self) {
        let current_step = {
            let mut state = self.state.lock().expect("engine mutex poisoned");
            state.running = false;
            state.paused = false;
            if state.burst_on {
                state.burst_on = false;
                state.current_pattern.as_ref().map(|p| (p.left_sequence[state.step_idx], p.right_sequence[state.step_idx]))
            } else {
                None
            }
        };

        if let Some((left, right)) = current_step {
            self.deactivate_pair(left, right).await;
        }
    }

    async fn deactivate_pair(&self, left: u8, right: u8) {
        for finger in [left, right] {
            if let Err(err) = self.actuator.deactivate(finger).await {
                warn!("actuator deactivate fault on finger {finger}: {err}");
            }
        }
    }

    async fn activate_pair(&self, left: u8, right: u8, amplitude_pct: u8) {
        for finger in [left, right] {
            if let Err(err) = self.actuator.activate(finger, amplitude_pct).await {
                warn!("actuator activate fault on finger {finger}: {err}");
            }
        }
    }

    /// The hot path. Called at ≥20 Hz by the outer application loop.
    pub async fn tick(&self, amplitude_pct: u8) {
        let now = self.clock.now_ms();

        enum Action {
            None,
            Deactivate { left: u8, right: u8, cycle_wrapped: bool, new_cycle_count: u64 },
            Activate { left: u8, right: u8 },
            StopSelf,
        }

        let action = {
            let mut state = self.state.lock().expect("engine mutex poisoned");
            if !state.running || state.paused {
                Action::None
            } else if now >= state.session_deadline_ts {
                Action::StopSelf
            } else if state.burst_on {
                let burst_duration = state.current_pattern.as_ref().map(|p| p.burst_duration_ms).unwrap_or(0.0);
                if now - state.step_start_ts >= burst_duration {
                    let (left, right) = {
                        let pattern = state.current_pattern.as_ref().expect("running engine always has a pattern");
                        (pattern.left_sequence[state.step_idx], pattern.right_sequence[state.step_idx])
                    };
                    state.burst_on = false;
                    let pattern_len = state.current_pattern.as_ref().map(Pattern::len).unwrap_or(1);
                    state.step_idx += 1;
                    state.step_start_ts = now;
                    let wrapped = state.step_idx >= pattern_len;
                    if wrapped {
                        state.step_idx = 0;
                        state.cycles_completed += 1;
                    }
                    Action::Deactivate { left, right, cycle_wrapped: wrapped, new_cycle_count: state.cycles_completed }
                } else {
                    Action::None
                }
            } else {
                let due = state
                    .current_pattern
                    .as_ref()
                    .map(|p| now - state.step_start_ts >= p.timing_ms[state.step_idx])
                    .unwrap_or(false);
                if due {
                    let (left, right) = {
                        let pattern = state.current_pattern.as_ref().expect("running engine always has a pattern");
                        (pattern.left_sequence[state.step_idx], pattern.right_sequence[state.step_idx])
                    };
                    state.burst_on = true;
                    state.step_start_ts = now;
                    state.total_activations += 1;
                    Action::Activate { left, right }
                } else {
                    Action::None
                }
            }
        };

        match action {
            Action::None => {}
            Action::StopSelf => self.stop().await,
            Action::Deactivate { left, right, cycle_wrapped, new_cycle_count } => {
                self.deactivate_pair(left, right).await;
                if cycle_wrapped {
                    self.notify_cycle_complete(new_cycle_count);
                    if let Err(err) = self.regenerate_next_pattern() {
                        error!("pattern regeneration failed, stopping session: {err}");
                        self.stop().await;
                    }
                }
            }
            Action::Activate { left, right } => {
                self.activate_pair(left, right, amplitude_pct).await;
                let seq = self.sequence_counter.fetch_add(1, Ordering::SeqCst);
                let now_us = self.clock.now_us();
                self.notify_send_command(Message::ExecuteBuzz(ExecuteBuzzCommand {
                    left_finger: left,
                    right_finger: right,
                    amplitude: amplitude_pct,
                    seq,
                    timestamp_us: now_us,
                }));
            }
        }
    }

    /// A generation failure here is fatal to the session, unlike the
    /// per-actuator faults tolerated elsewhere in the tick.
    fn regenerate_next_pattern(&self) -> Result<(), CoreError> {
        let (pattern_type, params, burst_duration_ms) = {
            let state = self.state.lock().expect("engine mutex poisoned");
            let pattern_type = state.pattern_type.expect("running engine always has a pattern_type");
            let params = state.params.clone().expect("running engine always has params");
            let burst_duration_ms = state.current_pattern.as_ref().map(|p| p.burst_duration_ms).unwrap_or(0.0);
            (pattern_type, params, burst_duration_ms)
        };

        let next = generate_pattern(pattern_type, &params, burst_duration_ms)?;
        self.state.lock().expect("engine mutex poisoned").current_pattern = Some(next);
        Ok(())
    }

    fn notify_cycle_complete(&self, cycles: u64) {
        for observer in self.cycle_observers.lock().expect("engine mutex poisoned").iter() {
            observer(cycles);
        }
    }

    fn notify_send_command(&self, message: Message) {
        for observer in self.send_observers.lock().expect("engine mutex poisoned").iter() {
            observer(message.clone());
        }
    }
}
