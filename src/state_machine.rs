// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! The role state machine: a pure `(current, trigger) -> next` table plus an
//! observer list. This module depends on nothing else in the crate.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::error;

/// Which half of the bilateral pair this device is. Set at boot from
/// persisted configuration and immutable for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TherapyState {
    Idle,
    Ready,
    Running,
    Paused,
    Stopping,
    ConnectionLost,
    LowBattery,
    CriticalBattery,
    Error,
}

impl TherapyState {
    pub fn is_active(self) -> bool {
        matches!(self, TherapyState::Running | TherapyState::Paused | TherapyState::Stopping)
    }

    pub fn is_error(self) -> bool {
        matches!(self, TherapyState::Error | TherapyState::CriticalBattery | TherapyState::ConnectionLost)
    }

    pub fn can_start_therapy(self) -> bool {
        matches!(self, TherapyState::Idle | TherapyState::Ready)
    }

    pub fn can_pause(self) -> bool {
        self == TherapyState::Running
    }

    pub fn can_resume(self) -> bool {
        self == TherapyState::Paused
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateTrigger {
    Connected,
    Disconnected,
    StartSession,
    PauseSession,
    ResumeSession,
    StopSession,
    Stopped,
    Error,
    EmergencyStop,
    /// Unconditional jump. Carries the target state, matching the source's
    /// `FORCE(target)` trigger.
    Force(TherapyState),
}

/// Look up `(current, trigger) -> next` against the fixed transition table.
/// Triggers with no table entry leave the state unchanged. This
/// function never fails and `Force` is handled by the caller, not here,
/// since it always notifies even when the target equals the current state.
fn next_state(current: TherapyState, trigger: StateTrigger) -> TherapyState {
    use StateTrigger::*;
    use TherapyState::*;

    match (current, trigger) {
        (_, Force(target)) => target,
        (_, Disconnected) => ConnectionLost,
        (_, Error) => self::TherapyState::Error,
        (_, EmergencyStop) => self::TherapyState::Error,
        (Idle, Connected) => Ready,
        (Ready, StartSession) | (Idle, StartSession) => Running,
        (Running, PauseSession) => Paused,
        (Paused, ResumeSession) => Running,
        (Running, StopSession) | (Paused, StopSession) => Stopping,
        (Stopping, Stopped) => Idle,
        (same, _) => same,
    }
}

pub type ObserverMetadata = HashMap<String, String>;
pub type Observer = Arc<dyn Fn(TherapyState, TherapyState, StateTrigger, &ObserverMetadata) + Send + Sync>;

/// Owns the single [`TherapyState`] value and notifies observers on
/// transitions. Pure data structure: no I/O, no async.
pub struct StateMachine {
    current: Mutex<TherapyState>,
    observers: Mutex<Vec<Observer>>,
}

impl StateMachine {
    pub fn new(initial: TherapyState) -> Self {
        StateMachine {
            current: Mutex::new(initial),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> TherapyState {
        *self.current.lock().expect("state machine mutex poisoned")
    }

    /// Subscribing the same observer (by `Arc` identity) twice registers it
    /// only once.
    pub fn subscribe(&self, observer: Observer) {
        let mut observers = self.observers.lock().expect("state machine mutex poisoned");
        if !observers.iter().any(|existing| Arc::ptr_eq(existing, &observer)) {
            observers.push(observer);
        }
    }

    /// Applies `trigger` to the current state. Always returns `true`;
    /// triggers with no table entry leave the state unchanged and fire no
    /// notification.
    pub fn transition(&self, trigger: StateTrigger) -> bool {
        let from = self.current();
        let to = next_state(from, trigger);
        if to != from {
            self.set_and_notify(from, to, trigger, ObserverMetadata::new());
        }
        true
    }

    /// Unconditional jump. Always notifies, even if `target` equals the
    /// current state.
    pub fn force(&self, target: TherapyState, reason: &str) {
        let from = self.current();
        let mut metadata = ObserverMetadata::new();
        metadata.insert("reason".to_string(), reason.to_string());
        self.set_and_notify(from, target, StateTrigger::Force(target), metadata);
    }

    fn set_and_notify(&self, from: TherapyState, to: TherapyState, trigger: StateTrigger, metadata: ObserverMetadata) {
        *self.current.lock().expect("state machine mutex poisoned") = to;

        let observers = self.observers.lock().expect("state machine mutex poisoned").clone();
        for observer in observers {
            // An observer must not be able to prevent the others from running,
            // whether it errors logically or panics outright.
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| observer(from, to, trigger, &metadata)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<unknown panic>".to_string());
                error!("state machine observer panicked: {message}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn idle_connected_goes_ready() {
        let sm = StateMachine::new(TherapyState::Idle);
        assert!(sm.transition(StateTrigger::Connected));
        assert_eq!(sm.current(), TherapyState::Ready);
    }

    #[test]
    fn unmapped_trigger_leaves_state_unchanged() {
        let sm = StateMachine::new(TherapyState::Idle);
        assert!(sm.transition(StateTrigger::PauseSession));
        assert_eq!(sm.current(), TherapyState::Idle);
    }

    #[test]
    fn full_lifecycle() {
        let sm = StateMachine::new(TherapyState::Idle);
        sm.transition(StateTrigger::Connected);
        sm.transition(StateTrigger::StartSession);
        assert_eq!(sm.current(), TherapyState::Running);
        sm.transition(StateTrigger::PauseSession);
        assert_eq!(sm.current(), TherapyState::Paused);
        sm.transition(StateTrigger::ResumeSession);
        assert_eq!(sm.current(), TherapyState::Running);
        sm.transition(StateTrigger::StopSession);
        assert_eq!(sm.current(), TherapyState::Stopping);
        sm.transition(StateTrigger::Stopped);
        assert_eq!(sm.current(), TherapyState::Idle);
    }

    #[test]
    fn disconnected_from_any_state_goes_connection_lost() {
        let sm = StateMachine::new(TherapyState::Running);
        sm.transition(StateTrigger::Disconnected);
        assert_eq!(sm.current(), TherapyState::ConnectionLost);
    }

    #[test]
    fn force_always_notifies_even_to_same_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let sm = StateMachine::new(TherapyState::Idle);
        sm.subscribe(Arc::new(move |_from, _to, _trigger, _meta| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        sm.force(TherapyState::Idle, "test");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_is_idempotent_by_identity() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let observer: Observer = Arc::new(move |_from, _to, _trigger, _meta| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        let sm = StateMachine::new(TherapyState::Idle);
        sm.subscribe(observer.clone());
        sm.subscribe(observer);
        sm.transition(StateTrigger::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let sm = StateMachine::new(TherapyState::Idle);
        sm.subscribe(Arc::new(|_from, _to, _trigger, _meta| {
            panic!("boom");
        }));
        sm.subscribe(Arc::new(move |_from, _to, _trigger, _meta| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        sm.transition(StateTrigger::Connected);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(sm.current(), TherapyState::Ready);
    }

    #[test]
    fn any_state_error_or_emergency_stop_goes_to_error() {
        let sm = StateMachine::new(TherapyState::Paused);
        sm.transition(StateTrigger::EmergencyStop);
        assert_eq!(sm.current(), TherapyState::Error);
    }
}
