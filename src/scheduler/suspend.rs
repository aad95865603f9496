//! Double-buffered suspend state
//!
//! Requests only touch the pending half. The scheduler copies pending into
//! current exactly once per timeslice, so a CPU that suspends itself (or is
//! suspended by a handler it calls) keeps running under the state it started
//! the slice with.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Why a CPU is not running. A CPU runs only when no reason is set.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SuspendReason: u8 {
        /// Reset line held.
        const RESET = 1 << 0;
        /// Halt line held.
        const HALT = 1 << 1;
        /// Disabled by configuration or driver.
        const DISABLE = 1 << 2;
        /// Waiting for a trigger.
        const TRIGGER = 1 << 3;
    }
}

impl SuspendReason {
    /// Reasons that also block interrupt callbacks.
    pub const NO_INTERRUPTS: SuspendReason = SuspendReason::RESET
        .union(SuspendReason::HALT)
        .union(SuspendReason::DISABLE);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendState {
    current: SuspendReason,
    pending: SuspendReason,
    eat: bool,
    pending_eat: bool,
}

impl Default for SuspendReason {
    fn default() -> Self {
        SuspendReason::empty()
    }
}

impl SuspendState {
    pub fn suspend(&mut self, reason: SuspendReason, eat: bool) {
        self.pending |= reason;
        self.pending_eat = eat;
    }

    pub fn resume(&mut self, reason: SuspendReason) {
        self.pending.remove(reason);
    }

    /// Apply pending changes. Returns true if the mask changed.
    pub fn commit(&mut self) -> bool {
        let changed = self.current != self.pending;
        self.current = self.pending;
        self.eat = self.pending_eat;
        changed
    }

    /// Replace both halves, bypassing double buffering.
    pub fn force(&mut self, reason: SuspendReason, eat: bool) {
        self.current = reason;
        self.pending = reason;
        self.eat = eat;
        self.pending_eat = eat;
    }

    /// Mask the scheduler is using this timeslice.
    pub fn current(&self) -> SuspendReason {
        self.current
    }

    /// Mask that will apply from the next timeslice.
    pub fn pending(&self) -> SuspendReason {
        self.pending
    }

    pub fn is_running(&self) -> bool {
        self.current.is_empty()
    }

    pub fn eats_cycles(&self) -> bool {
        self.eat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspend_is_idempotent() {
        let mut state = SuspendState::default();
        state.suspend(SuspendReason::HALT, true);
        state.suspend(SuspendReason::HALT, true);
        state.resume(SuspendReason::HALT);
        state.commit();
        assert!(state.is_running());
    }

    #[test]
    fn test_changes_wait_for_commit() {
        let mut state = SuspendState::default();
        state.suspend(SuspendReason::TRIGGER, false);
        assert!(state.is_running());
        assert_eq!(state.pending(), SuspendReason::TRIGGER);
        assert!(state.commit());
        assert_eq!(state.current(), SuspendReason::TRIGGER);
        assert!(!state.eats_cycles());
        assert!(!state.commit());
    }

    #[test]
    fn test_all_reasons_must_clear() {
        let mut state = SuspendState::default();
        state.suspend(SuspendReason::HALT | SuspendReason::DISABLE, true);
        state.resume(SuspendReason::HALT);
        state.commit();
        assert_eq!(state.current(), SuspendReason::DISABLE);
        state.resume(SuspendReason::all());
        state.commit();
        assert!(state.is_running());
    }
}
