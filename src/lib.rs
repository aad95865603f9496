//! Lockstep
//!
//! Deterministic multi-CPU scheduling core for arcade-style emulators: runs
//! several emulated CPUs in interleaved timeslices against a shared timer
//! queue, generates VBLANK and timed interrupts, and resolves every memory
//! access through two-level dispatch tables with banked memory.
//!
//! Instruction cores plug in through [`CpuCore`] and reach the rest of the
//! machine through [`MachineBus`].

pub mod config;
pub mod cpu;
#[cfg(feature = "debugger")]
pub mod debug;
pub mod error;
pub mod interrupts;
pub mod machine;
pub mod memory;
pub mod scheduler;
pub mod snapshot;
pub mod time;
pub mod timer;
pub mod watchdog;

pub use config::{AddressSpaceConfig, CpuConfig, MachineConfig, TimedInterruptRate, WatchdogConfig};
pub use cpu::{CpuCore, InputLine, LineState};
pub use error::{ConfigError, StateError, TimerError};
pub use machine::{Machine, MachineBus};
pub use memory::{Mapping, Memory, SpaceKind};
pub use scheduler::{Scheduler, SuspendReason, TriggerId};
pub use snapshot::{Snapshot, StateRegistry};
pub use time::VirtualTime;
pub use timer::{TimerAction, TimerId, TimerQueue};
