//! Trigger ids
//!
//! Triggers are plain integers. Drivers use non-negative ids; the negative
//! ranges below are reserved for the scheduler itself.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of distinct ids in each timed-wait range.
pub const TIMED_TRIGGER_SLOTS: u32 = 256;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerId(pub i32);

impl TriggerId {
    /// Fired at every interleave timeslice boundary.
    pub const TIMESLICE: TriggerId = TriggerId(-1000);

    const INTERRUPT_BASE: i32 = -2000;
    const YIELD_TIME_BASE: i32 = -3000;
    const SUSPEND_TIME_BASE: i32 = -4000;

    /// Fired when an input line of `cpu` is asserted.
    pub fn interrupt(cpu: usize) -> TriggerId {
        TriggerId(Self::INTERRUPT_BASE - cpu as i32)
    }

    /// Wake-up for the `n`th pending yield-until-time.
    pub fn yield_time(n: u32) -> TriggerId {
        TriggerId(Self::YIELD_TIME_BASE - (n % TIMED_TRIGGER_SLOTS) as i32)
    }

    /// Wake-up for the `n`th pending spin-until-time.
    pub fn suspend_time(n: u32) -> TriggerId {
        TriggerId(Self::SUSPEND_TIME_BASE - (n % TIMED_TRIGGER_SLOTS) as i32)
    }

    pub fn is_reserved(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Debug for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.0;
        let slots = TIMED_TRIGGER_SLOTS as i32;
        if *self == TriggerId::TIMESLICE {
            write!(f, "Trigger(timeslice)")
        } else if (Self::INTERRUPT_BASE - 1000 + 1..=Self::INTERRUPT_BASE).contains(&id) {
            write!(f, "Trigger(interrupt cpu{})", Self::INTERRUPT_BASE - id)
        } else if (Self::YIELD_TIME_BASE - slots + 1..=Self::YIELD_TIME_BASE).contains(&id) {
            write!(f, "Trigger(yield time #{})", Self::YIELD_TIME_BASE - id)
        } else if (Self::SUSPEND_TIME_BASE - slots + 1..=Self::SUSPEND_TIME_BASE).contains(&id) {
            write!(f, "Trigger(suspend time #{})", Self::SUSPEND_TIME_BASE - id)
        } else {
            write!(f, "Trigger({})", id)
        }
    }
}
