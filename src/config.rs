//! Machine configuration
//!
//! Everything here is read once by `Machine::new` and validated up front, so
//! a machine either starts fully configured or not at all.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::interrupts::InterruptCallback;
use crate::memory::{Endianness, SpaceKind};
use crate::time::VirtualTime;

/// Maximum number of CPUs in one machine.
pub const MAX_CPUS: usize = 8;

/// Raw timed-interrupt values up to this are interrupts per frame.
pub const PER_FRAME_RATE_LIMIT: u64 = 1000;

/// One address space of one CPU.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpaceConfig {
    pub kind: SpaceKind,
    /// Width of the CPU's native address bus.
    pub addr_bits: u8,
    /// Native data bus width: 8, 16, 32 or 64.
    pub data_bits: u8,
    /// Native address to byte address shift. Negative values shift left
    /// (word-addressed CPUs), positive values shift right (bit-addressed).
    pub addr_shift: i8,
    pub endianness: Endianness,
    /// Value returned by unmapped reads; `None` means all ones.
    pub unmap_value: Option<u64>,
    /// Log unmapped accesses at `warn` level.
    pub log_unmapped: bool,
}

impl AddressSpaceConfig {
    pub fn new(kind: SpaceKind, addr_bits: u8, data_bits: u8) -> Self {
        AddressSpaceConfig {
            kind,
            addr_bits,
            data_bits,
            addr_shift: 0,
            endianness: Endianness::Little,
            unmap_value: None,
            log_unmapped: false,
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.endianness = Endianness::Big;
        self
    }

    pub fn with_shift(mut self, addr_shift: i8) -> Self {
        self.addr_shift = addr_shift;
        self
    }

    pub fn with_unmap_value(mut self, value: u64) -> Self {
        self.unmap_value = Some(value);
        self
    }

    pub fn log_unmapped(mut self, enable: bool) -> Self {
        self.log_unmapped = enable;
        self
    }

    /// Width of a byte address in this space.
    pub fn byte_addr_bits(&self) -> i32 {
        self.addr_bits as i32 - self.addr_shift as i32
    }

    fn validate(&self, cpu: usize) -> Result<()> {
        if !matches!(self.data_bits, 8 | 16 | 32 | 64) {
            return Err(ConfigError::UnsupportedDataWidth {
                cpu,
                space: self.kind,
                bits: self.data_bits,
            });
        }
        let bits = self.byte_addr_bits();
        if self.addr_bits == 0 || !(1..=32).contains(&bits) {
            return Err(ConfigError::AddressWidthOutOfRange {
                cpu,
                space: self.kind,
                bits: self.addr_bits,
                shift: self.addr_shift,
            });
        }
        Ok(())
    }
}

/// How a free-running CPU interrupt is paced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimedInterruptRate {
    /// N interrupts per video frame.
    PerFrame(u32),
    /// Fixed period in nanoseconds.
    PeriodNanos(u64),
}

impl TimedInterruptRate {
    /// Decode the legacy single-number form: small values count interrupts
    /// per frame, larger ones are a period in nanoseconds.
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            0 => None,
            v if v <= PER_FRAME_RATE_LIMIT => Some(TimedInterruptRate::PerFrame(v as u32)),
            v => Some(TimedInterruptRate::PeriodNanos(v)),
        }
    }

    pub fn period(self, frame_period: VirtualTime) -> VirtualTime {
        match self {
            TimedInterruptRate::PerFrame(0) => VirtualTime::NEVER,
            TimedInterruptRate::PerFrame(n) => frame_period.div(n),
            TimedInterruptRate::PeriodNanos(ns) => VirtualTime::from_nanos(ns),
        }
    }
}

/// Watchdog mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogConfig {
    Disabled,
    /// Reset after this many VBLANKs without a kick.
    Vblank(u32),
    /// Reset when this much time passes without a kick.
    Time(VirtualTime),
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig::Disabled
    }
}

/// Per-CPU configuration.
#[derive(Clone)]
pub struct CpuConfig {
    pub name: String,
    /// Clock in Hz.
    pub clock: u64,
    /// Runtime multiplier on the clock.
    pub clock_scale: f64,
    pub spaces: Vec<AddressSpaceConfig>,
    /// Frame-locked interrupts per frame; 0 disables.
    pub vblank_interrupts_per_frame: u32,
    pub vblank_interrupt: Option<InterruptCallback>,
    pub timed_interrupt_rate: Option<TimedInterruptRate>,
    pub timed_interrupt: Option<InterruptCallback>,
    /// Hold the CPU disabled from reset (e.g. sound CPUs with sound off).
    pub start_disabled: bool,
    /// Passed to `CpuCore::reset`.
    pub reset_param: i32,
}

impl CpuConfig {
    /// A CPU with an 8-bit, 16-bit address program space.
    pub fn new(name: &str, clock: u64) -> Self {
        CpuConfig {
            name: name.to_string(),
            clock,
            clock_scale: 1.0,
            spaces: vec![AddressSpaceConfig::new(SpaceKind::Program, 16, 8)],
            vblank_interrupts_per_frame: 0,
            vblank_interrupt: None,
            timed_interrupt_rate: None,
            timed_interrupt: None,
            start_disabled: false,
            reset_param: 0,
        }
    }

    /// Replace any existing space of the same kind.
    pub fn with_space(mut self, space: AddressSpaceConfig) -> Self {
        self.spaces.retain(|s| s.kind != space.kind);
        self.spaces.push(space);
        self
    }

    pub fn with_vblank_interrupt(mut self, per_frame: u32, callback: InterruptCallback) -> Self {
        self.vblank_interrupts_per_frame = per_frame;
        self.vblank_interrupt = Some(callback);
        self
    }

    pub fn with_timed_interrupt(mut self, rate: TimedInterruptRate, callback: InterruptCallback) -> Self {
        self.timed_interrupt_rate = Some(rate);
        self.timed_interrupt = Some(callback);
        self
    }

    pub fn space(&self, kind: SpaceKind) -> Option<&AddressSpaceConfig> {
        self.spaces.iter().find(|s| s.kind == kind)
    }

    fn validate(&self, cpu: usize) -> Result<()> {
        if self.clock == 0 {
            return Err(ConfigError::InvalidClock { cpu });
        }
        if !self.clock_scale.is_finite() || self.clock_scale <= 0.0 {
            return Err(ConfigError::InvalidClockScale {
                cpu,
                scale: self.clock_scale.to_string(),
            });
        }
        for (i, space) in self.spaces.iter().enumerate() {
            if self.spaces[..i].iter().any(|s| s.kind == space.kind) {
                return Err(ConfigError::DuplicateSpace { cpu, space: space.kind });
            }
            space.validate(cpu)?;
        }
        if self.space(SpaceKind::Program).is_none() {
            return Err(ConfigError::MissingSpace { cpu, space: SpaceKind::Program });
        }
        Ok(())
    }
}

impl std::fmt::Debug for CpuConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuConfig")
            .field("name", &self.name)
            .field("clock", &self.clock)
            .field("clock_scale", &self.clock_scale)
            .field("spaces", &self.spaces)
            .field("vblank_interrupts_per_frame", &self.vblank_interrupts_per_frame)
            .field("timed_interrupt_rate", &self.timed_interrupt_rate)
            .field("start_disabled", &self.start_disabled)
            .finish()
    }
}

/// Whole-machine configuration.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    pub cpus: Vec<CpuConfig>,
    pub frames_per_second: u32,
    /// Interleave granularity: forced resynchronizations per frame.
    pub slices_per_frame: u32,
    /// Length of the blanking period after each real VBLANK.
    pub vblank_duration: VirtualTime,
    /// Update the screen at the end of the blanking period instead of at
    /// its start.
    pub update_after_vblank: bool,
    pub watchdog: WatchdogConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            cpus: Vec::new(),
            frames_per_second: 60,
            slices_per_frame: 1,
            vblank_duration: VirtualTime::ZERO,
            update_after_vblank: false,
            watchdog: WatchdogConfig::Disabled,
        }
    }
}

impl MachineConfig {
    pub fn frame_period(&self) -> VirtualTime {
        VirtualTime::from_hz(self.frames_per_second as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpus.is_empty() {
            return Err(ConfigError::NoCpus);
        }
        if self.cpus.len() > MAX_CPUS {
            return Err(ConfigError::TooManyCpus {
                count: self.cpus.len(),
                max: MAX_CPUS,
            });
        }
        if self.frames_per_second == 0 {
            return Err(ConfigError::InvalidFrameRate);
        }
        if self.slices_per_frame == 0 {
            return Err(ConfigError::InvalidInterleave);
        }
        for (cpu, config) in self.cpus.iter().enumerate() {
            config.validate(cpu)?;
        }
        Ok(())
    }

    /// Identity of the configuration, embedded in snapshots.
    pub fn fingerprint(&self) -> ConfigFingerprint {
        ConfigFingerprint {
            cpus: self
                .cpus
                .iter()
                .map(|cpu| (cpu.name.clone(), cpu.clock, cpu.spaces.clone()))
                .collect(),
            frames_per_second: self.frames_per_second,
            slices_per_frame: self.slices_per_frame,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFingerprint {
    pub cpus: Vec<(String, u64, Vec<AddressSpaceConfig>)>,
    pub frames_per_second: u32,
    pub slices_per_frame: u32,
}
