//! CPU core interface
//!
//! Instruction cores live outside this crate. The scheduler only needs to
//! run one for a cycle budget, reset it, read its program counter and feed it
//! input-line changes. Everything a core touches while running (memory,
//! remaining cycles, suspension, triggers) goes through the [`MachineBus`].

use serde::{Deserialize, Serialize};

use crate::machine::MachineBus;

/// State change applied to an input line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineState {
    Clear,
    Assert,
    /// Asserted until the core acknowledges the interrupt.
    Hold,
    /// Asserted and immediately cleared.
    Pulse,
}

impl LineState {
    pub fn is_active(self) -> bool {
        !matches!(self, LineState::Clear)
    }
}

/// An input line of a CPU.
///
/// `Reset` and `Halt` are handled by the scheduler; the rest are passed to
/// the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputLine {
    Irq(u8),
    Nmi,
    Reset,
    Halt,
}

/// An emulated instruction core.
pub trait CpuCore {
    /// Run for about `cycles` cycles and return how many were executed.
    ///
    /// A core counts down `bus.remaining_cycles()` (through
    /// `consume_cycles`) and stops once it reaches zero; an aborted timeslice
    /// zeroes it from underneath. The usual return value is
    /// `cycles - bus.remaining_cycles()`.
    fn execute(&mut self, cycles: i32, bus: &mut MachineBus<'_>) -> i32;

    fn reset(&mut self, param: i32);

    /// Current program counter, in the core's native address units.
    fn pc(&self) -> u32;

    fn set_input_line(&mut self, line: InputLine, state: LineState);

    /// Serialized core state for snapshots.
    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn load_state(&mut self, _data: &[u8]) {}
}
