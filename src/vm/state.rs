//! Lifecycle bookkeeping for VM instances and in-process worker threads.
use crate::config::types::VmState;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Apply a VM state transition if it is allowed. Returns the previous state
/// on success.
pub fn transition(state: &Mutex<VmState>, vm_name: &str, next: VmState) -> Option<VmState> {
    let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
    let previous = *current;
    if previous == next {
        return None;
    }
    if !previous.can_transition_to(next) {
        log::debug!("VM {}: ignoring transition {} -> {}", vm_name, previous, next);
        return None;
    }
    *current = next;
    log::debug!("VM {}: {} -> {}", vm_name, previous, next);
    Some(previous)
}

/// Phase of a worker thread. Phases only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadPhase {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

pub struct ThreadLifecycle {
    phase: Mutex<ThreadPhase>,
    changed: Condvar,
}

impl Default for ThreadLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadLifecycle {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(ThreadPhase::NotStarted),
            changed: Condvar::new(),
        }
    }

    pub fn phase(&self) -> ThreadPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` if it is later than the current phase.
    pub fn advance(&self, next: ThreadPhase) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if next <= *phase {
            return false;
        }
        *phase = next;
        self.changed.notify_all();
        true
    }

    /// Block until the phase reaches `target` or `timeout` elapses.
    /// Returns the phase observed last.
    pub fn wait_until(&self, target: ThreadPhase, timeout: Option<Duration>) -> ThreadPhase {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        while *phase < target {
            match deadline {
                None => {
                    phase = self.changed.wait(phase).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    phase = self
                        .changed
                        .wait_timeout(phase, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
        *phase
    }
}
