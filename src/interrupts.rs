//! VBLANK and timed interrupt generation
//!
//! All frame-locked interrupts share one pulse timer. Its rate is the least
//! common multiple of every CPU's interrupts-per-frame count, so each CPU
//! sees evenly spaced interrupts; every `vblank_multiplier`-th pulse is the
//! real VBLANK that ends a frame.
//!
//! This module only keeps the books. It reports which callbacks are due and
//! the machine runs them with a bus.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::config::MachineConfig;
use crate::cpu::{InputLine, LineState};
use crate::error::{Result, StateError};
use crate::machine::MachineBus;
use crate::scheduler::{Scheduler, SuspendReason};
use crate::snapshot::StateRegistry;
use crate::time::VirtualTime;
use crate::timer::{TimerAction, TimerId, TimerQueue};

const STATE_TAG: &str = "interrupts";

/// Interrupt generator invoked with the CPU index.
pub type InterruptCallback = Rc<dyn Fn(&mut MachineBus<'_>, usize)>;

/// Assert IRQ `line` until the core acknowledges it.
pub fn irq_line_hold(line: u8) -> InterruptCallback {
    Rc::new(move |bus: &mut MachineBus<'_>, cpu: usize| bus.set_input_line(cpu, InputLine::Irq(line), LineState::Hold))
}

pub fn irq_line_pulse(line: u8) -> InterruptCallback {
    Rc::new(move |bus: &mut MachineBus<'_>, cpu: usize| bus.set_input_line(cpu, InputLine::Irq(line), LineState::Pulse))
}

pub fn irq_line_assert(line: u8) -> InterruptCallback {
    Rc::new(move |bus: &mut MachineBus<'_>, cpu: usize| bus.set_input_line(cpu, InputLine::Irq(line), LineState::Assert))
}

pub fn nmi_line_pulse() -> InterruptCallback {
    Rc::new(|bus: &mut MachineBus<'_>, cpu: usize| bus.set_input_line(cpu, InputLine::Nmi, LineState::Pulse))
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Pulses per frame: the smallest count every non-zero per-frame count
/// divides. At least 1, so a frame always ends.
pub fn vblank_multiplier(counts: &[u32]) -> u32 {
    counts
        .iter()
        .filter(|&&count| count > 0)
        .fold(1, |lcm, &count| lcm / gcd(lcm, count) * count)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CpuInterrupts {
    /// Interrupts left in the current frame.
    iloops: i32,
    per_frame: u32,
    /// Pulses between this CPU's interrupts; 0 if it takes none.
    multiplier: u32,
    countdown: u32,
}

/// What one pulse of the VBLANK timer asks the machine to do.
#[derive(Default)]
pub struct PulseOutcome {
    pub callbacks: Vec<(usize, InterruptCallback)>,
    /// CPUs whose interrupt came due, taken or not.
    pub due: Vec<usize>,
    /// This pulse is the real VBLANK.
    pub vblank: bool,
    pub update_screen: bool,
}

pub struct Interrupts {
    cpus: Vec<CpuInterrupts>,
    vblank_callbacks: Vec<Option<InterruptCallback>>,
    timed_callbacks: Vec<Option<InterruptCallback>>,
    timed_periods: Vec<VirtualTime>,
    timed_timers: Vec<Option<TimerId>>,
    frame_period: VirtualTime,
    pulse_period: VirtualTime,
    multiplier: u32,
    countdown: u32,
    vblank_duration: VirtualTime,
    update_after_vblank: bool,
    in_vblank: bool,
    current_frame: u64,
    pulse_timer: TimerId,
    blank_end_timer: TimerId,
}

impl Interrupts {
    pub fn new(config: &MachineConfig, timers: &mut TimerQueue) -> Result<Self> {
        let counts: Vec<u32> = config.cpus.iter().map(|cpu| cpu.vblank_interrupts_per_frame).collect();
        let multiplier = vblank_multiplier(&counts);
        let frame_period = config.frame_period();

        let cpus = counts
            .iter()
            .map(|&per_frame| CpuInterrupts {
                iloops: 0,
                per_frame,
                multiplier: if per_frame > 0 { multiplier / per_frame } else { 0 },
                countdown: 0,
            })
            .collect();

        let mut timed_timers = Vec::with_capacity(config.cpus.len());
        let mut timed_periods = Vec::with_capacity(config.cpus.len());
        for (cpu, cfg) in config.cpus.iter().enumerate() {
            let period = match (cfg.timed_interrupt_rate, &cfg.timed_interrupt) {
                (Some(rate), Some(_)) => rate.period(frame_period),
                _ => VirtualTime::NEVER,
            };
            let timer = if period.is_never() || period.is_zero() {
                None
            } else {
                Some(timers.allocate(TimerAction::TimedInterrupt(cpu))?)
            };
            timed_timers.push(timer);
            timed_periods.push(period);
        }

        tracing::debug!(multiplier, frame = %frame_period, "vblank timing computed");
        Ok(Interrupts {
            cpus,
            vblank_callbacks: config.cpus.iter().map(|cpu| cpu.vblank_interrupt.clone()).collect(),
            timed_callbacks: config.cpus.iter().map(|cpu| cpu.timed_interrupt.clone()).collect(),
            timed_periods,
            timed_timers,
            frame_period,
            pulse_period: frame_period.div(multiplier),
            multiplier,
            countdown: multiplier,
            vblank_duration: config.vblank_duration,
            update_after_vblank: config.update_after_vblank,
            in_vblank: false,
            current_frame: 0,
            pulse_timer: timers.allocate(TimerAction::VblankPulse)?,
            blank_end_timer: timers.allocate(TimerAction::ScreenUpdate)?,
        })
    }

    /// Restart pulse timing at `now`. The pulse phase is backed up by one
    /// blanking duration so the first real VBLANK ends its blanking period
    /// exactly one frame after reset.
    pub fn reset(&mut self, timers: &mut TimerQueue, scheduler: &Scheduler) {
        let now = timers.current_time();
        for cpu in &mut self.cpus {
            cpu.iloops = cpu.per_frame as i32 - 1;
            cpu.countdown = cpu.multiplier;
        }
        self.countdown = self.multiplier;
        self.in_vblank = false;

        let mut first = self.pulse_period;
        while first < self.vblank_duration {
            let outcome = self.pulse(scheduler, false);
            self.finish_pulse(timers, &outcome);
            first += self.pulse_period;
        }
        first = first - self.vblank_duration;
        timers.adjust(self.pulse_timer, now + first, 0, self.pulse_period);

        for (timer, &period) in self.timed_timers.iter().zip(&self.timed_periods) {
            if let Some(timer) = *timer {
                timers.adjust(timer, now + period, 0, period);
            }
        }
    }

    /// One tick of the pulse timer: run the countdowns and report what is
    /// due. Counters visible to callbacks (`iloops`, the frame number) only
    /// move in [`Interrupts::finish_pulse`], after the callbacks ran.
    pub fn pulse(&mut self, scheduler: &Scheduler, run_callbacks: bool) -> PulseOutcome {
        let mut outcome = PulseOutcome::default();
        for (index, cpu) in self.cpus.iter_mut().enumerate() {
            if cpu.multiplier == 0 {
                continue;
            }
            cpu.countdown = cpu.countdown.saturating_sub(1);
            if cpu.countdown > 0 {
                continue;
            }
            if run_callbacks {
                if !scheduler.is_suspended(index, SuspendReason::NO_INTERRUPTS) {
                    if let Some(callback) = &self.vblank_callbacks[index] {
                        outcome.callbacks.push((index, Rc::clone(callback)));
                    }
                }
                outcome.due.push(index);
            }
            cpu.countdown = cpu.multiplier;
        }

        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown == 0 {
            outcome.vblank = true;
            outcome.update_screen = !self.update_after_vblank;
            self.countdown = self.multiplier;
        }
        outcome
    }

    /// Second half of a pulse: count the interrupts just taken and, on the
    /// real VBLANK, start the blanking period and the next frame.
    pub fn finish_pulse(&mut self, timers: &mut TimerQueue, outcome: &PulseOutcome) {
        for &cpu in &outcome.due {
            if let Some(state) = self.cpus.get_mut(cpu) {
                state.iloops -= 1;
            }
        }
        if outcome.vblank {
            self.in_vblank = true;
            timers.adjust_after(self.blank_end_timer, self.vblank_duration, 0, VirtualTime::ZERO);
            for cpu in &mut self.cpus {
                cpu.iloops = cpu.per_frame as i32 - 1;
            }
            self.current_frame += 1;
            tracing::trace!(frame = self.current_frame, "vblank");
        }
    }

    /// End of the blanking period. Returns true if the screen should be
    /// updated now.
    pub fn end_of_blanking(&mut self) -> bool {
        self.in_vblank = false;
        self.update_after_vblank
    }

    /// Callback for a timed interrupt, unless the CPU cannot take one.
    pub fn timed_interrupt(&self, cpu: usize, scheduler: &Scheduler) -> Option<InterruptCallback> {
        if scheduler.is_suspended(cpu, SuspendReason::NO_INTERRUPTS) {
            return None;
        }
        self.timed_callbacks.get(cpu)?.clone()
    }

    pub fn iloops(&self, cpu: usize) -> i32 {
        match self.cpus.get(cpu) {
            Some(state) => state.iloops,
            None => {
                tracing::error!(cpu, "iloops: cpu index out of range");
                0
            }
        }
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn in_vblank(&self) -> bool {
        self.in_vblank
    }

    pub fn frame_period(&self) -> VirtualTime {
        self.frame_period
    }

    pub fn pulses_per_frame(&self) -> u32 {
        self.multiplier
    }

    /// Time until the next real VBLANK begins.
    pub fn time_until_vblank_start(&self, timers: &TimerQueue) -> VirtualTime {
        let next_pulse = timers.remaining(self.pulse_timer);
        if next_pulse.is_never() {
            return VirtualTime::NEVER;
        }
        next_pulse + self.pulse_period.mul(self.countdown.saturating_sub(1))
    }

    pub fn save_state(&self, registry: &mut StateRegistry) -> Result<(), StateError> {
        for (cpu, state) in self.cpus.iter().enumerate() {
            registry.save_item(STATE_TAG, cpu as u32, "iloops", &state.iloops)?;
            registry.save_item(STATE_TAG, cpu as u32, "countdown", &state.countdown)?;
        }
        registry.save_item(STATE_TAG, 0, "vblank_countdown", &self.countdown)?;
        registry.save_item(STATE_TAG, 0, "in_vblank", &self.in_vblank)?;
        registry.save_item(STATE_TAG, 0, "current_frame", &self.current_frame)?;
        Ok(())
    }

    pub fn load_state(&mut self, registry: &StateRegistry) -> Result<(), StateError> {
        for (cpu, state) in self.cpus.iter_mut().enumerate() {
            state.iloops = registry.load_item(STATE_TAG, cpu as u32, "iloops")?;
            state.countdown = registry.load_item(STATE_TAG, cpu as u32, "countdown")?;
        }
        self.countdown = registry.load_item(STATE_TAG, 0, "vblank_countdown")?;
        self.in_vblank = registry.load_item(STATE_TAG, 0, "in_vblank")?;
        self.current_frame = registry.load_item(STATE_TAG, 0, "current_frame")?;
        Ok(())
    }
}
