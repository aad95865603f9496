//! Virtual time
//!
//! Emulated time is a fixed-point value: whole seconds plus a 64-bit binary
//! fraction (2^64 ticks per second). Cycle/time conversions use 128-bit
//! intermediates so that hours of emulated time at MHz clocks accumulate no
//! rounding drift beyond one tick per conversion.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

const FRAC_ONE: u128 = 1u128 << 64;

/// A point in (or span of) emulated time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct VirtualTime {
    seconds: u32,
    frac: u64,
}

impl VirtualTime {
    pub const ZERO: VirtualTime = VirtualTime { seconds: 0, frac: 0 };
    /// Sentinel for "never fires"; compares greater than every real time.
    pub const NEVER: VirtualTime = VirtualTime { seconds: u32::MAX, frac: u64::MAX };

    pub const fn new(seconds: u32, frac: u64) -> Self {
        VirtualTime { seconds, frac }
    }

    #[inline]
    fn ticks(self) -> u128 {
        ((self.seconds as u128) << 64) | self.frac as u128
    }

    #[inline]
    fn from_ticks(ticks: u128) -> Self {
        if ticks >= VirtualTime::NEVER.ticks() {
            return VirtualTime::NEVER;
        }
        VirtualTime {
            seconds: (ticks >> 64) as u32,
            frac: ticks as u64,
        }
    }

    pub fn seconds(self) -> u32 {
        self.seconds
    }

    pub fn frac(self) -> u64 {
        self.frac
    }

    pub fn is_never(self) -> bool {
        self == VirtualTime::NEVER
    }

    pub fn is_zero(self) -> bool {
        self == VirtualTime::ZERO
    }

    pub fn from_secs(seconds: u32) -> Self {
        VirtualTime { seconds, frac: 0 }
    }

    /// Period of one cycle of a `hz` clock. Zero frequency never ticks.
    pub fn from_hz(hz: u64) -> Self {
        if hz == 0 {
            return VirtualTime::NEVER;
        }
        VirtualTime::from_ticks(FRAC_ONE / hz as u128)
    }

    pub fn from_nanos(nanos: u64) -> Self {
        VirtualTime::from_ticks((nanos as u128 * FRAC_ONE) / 1_000_000_000)
    }

    pub fn from_micros(micros: u64) -> Self {
        VirtualTime::from_ticks((micros as u128 * FRAC_ONE) / 1_000_000)
    }

    /// Duration of `cycles` cycles at `hz`, rounded up to the next tick so
    /// that `to_cycles` gives back exactly `cycles`.
    pub fn from_cycles(cycles: u64, hz: u64) -> Self {
        if hz == 0 {
            return VirtualTime::NEVER;
        }
        let hz = hz as u128;
        let cycles = cycles as u128;
        let whole = cycles / hz;
        let rem = cycles % hz;
        if whole >= u32::MAX as u128 {
            return VirtualTime::NEVER;
        }
        VirtualTime::from_ticks((whole << 64) + ((rem << 64) + hz - 1) / hz)
    }

    /// Number of whole `hz` cycles that fit in this span.
    pub fn to_cycles(self, hz: u64) -> u64 {
        if self.is_never() {
            return u64::MAX;
        }
        let hz = hz as u128;
        let whole = self.seconds as u128 * hz;
        let part = (self.frac as u128 * hz) >> 64;
        (whole + part).min(u64::MAX as u128) as u64
    }

    pub fn to_nanos(self) -> u64 {
        if self.is_never() {
            return u64::MAX;
        }
        let whole = self.seconds as u128 * 1_000_000_000;
        let part = (self.frac as u128 * 1_000_000_000) >> 64;
        (whole + part).min(u64::MAX as u128) as u64
    }

    /// Lossy conversion for diagnostics only.
    pub fn as_secs_f64(self) -> f64 {
        self.seconds as f64 + self.frac as f64 / FRAC_ONE as f64
    }

    pub fn saturating_sub(self, rhs: VirtualTime) -> VirtualTime {
        if self.is_never() {
            return VirtualTime::NEVER;
        }
        VirtualTime::from_ticks(self.ticks().saturating_sub(rhs.ticks()))
    }

    pub fn mul(self, factor: u32) -> VirtualTime {
        if self.is_never() {
            return VirtualTime::NEVER;
        }
        VirtualTime::from_ticks(self.ticks().saturating_mul(factor as u128))
    }

    pub fn div(self, divisor: u32) -> VirtualTime {
        if self.is_never() || divisor == 0 {
            return VirtualTime::NEVER;
        }
        VirtualTime::from_ticks(self.ticks() / divisor as u128)
    }
}

impl Add for VirtualTime {
    type Output = VirtualTime;

    fn add(self, rhs: VirtualTime) -> VirtualTime {
        if self.is_never() || rhs.is_never() {
            return VirtualTime::NEVER;
        }
        VirtualTime::from_ticks(self.ticks() + rhs.ticks())
    }
}

impl AddAssign for VirtualTime {
    fn add_assign(&mut self, rhs: VirtualTime) {
        *self = *self + rhs;
    }
}

/// Saturates at zero; spans are never negative.
impl Sub for VirtualTime {
    type Output = VirtualTime;

    fn sub(self, rhs: VirtualTime) -> VirtualTime {
        self.saturating_sub(rhs)
    }
}

impl fmt::Debug for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            write!(f, "VirtualTime(never)")
        } else {
            write!(f, "VirtualTime({}.{:018})", self.seconds, (self.frac as u128 * 1_000_000_000_000_000_000 >> 64))
        }
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            write!(f, "never")
        } else {
            write!(f, "{:.9}s", self.as_secs_f64())
        }
    }
}
