//! CPU execution scheduler
//!
//! Runs every CPU in ascending order up to the next timer event, keeping
//! their local clocks in lockstep. The scheduler owns the per-CPU execution
//! descriptors and the context of the CPU currently inside `execute`:
//! its remaining-cycle countdown and the cycles stolen from it by aborts.
//!
//! One timeslice:
//! 1. target = next timer fire time, base = global time
//! 2. commit pending suspend state
//! 3. run each running CPU for `target - local` worth of cycles; a CPU that
//!    ran short of its budget pulls the target down to its own local time
//! 4. carry suspended CPUs to the target (counting cycles if they eat them)
//! 5. commit the target as the new global time
//!
//! The caller fires due timers afterwards.

pub mod suspend;
pub mod trigger;

pub use suspend::{SuspendReason, SuspendState};
pub use trigger::TriggerId;

use serde::{Deserialize, Serialize};

use crate::config::CpuConfig;
use crate::cpu::LineState;
use crate::error::StateError;
use crate::snapshot::StateRegistry;
use crate::time::VirtualTime;
use crate::timer::{TimerAction, TimerQueue};

const STATE_TAG: &str = "cpuexec";

/// Execution descriptor of one CPU.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CpuExec {
    suspend: SuspendState,
    trigger: Option<TriggerId>,
    total_cycles: u64,
    local_time: VirtualTime,
    clock: u64,
    clock_scale: f64,
    effective_clock: u64,
}

impl CpuExec {
    fn new(config: &CpuConfig) -> Self {
        let mut exec = CpuExec {
            suspend: SuspendState::default(),
            trigger: None,
            total_cycles: 0,
            local_time: VirtualTime::ZERO,
            clock: config.clock,
            clock_scale: config.clock_scale,
            effective_clock: config.clock,
        };
        exec.recompute_clock();
        exec
    }

    fn recompute_clock(&mut self) {
        self.effective_clock = ((self.clock as f64 * self.clock_scale).round() as u64).max(1);
    }

    pub fn suspend_state(&self) -> &SuspendState {
        &self.suspend
    }

    pub fn trigger(&self) -> Option<TriggerId> {
        self.trigger
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn local_time(&self) -> VirtualTime {
        self.local_time
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn clock_scale(&self) -> f64 {
        self.clock_scale
    }

    pub fn effective_clock(&self) -> u64 {
        self.effective_clock
    }

    fn cycles_to_time(&self, cycles: u64) -> VirtualTime {
        VirtualTime::from_cycles(cycles, self.effective_clock)
    }

    fn time_to_cycles(&self, time: VirtualTime) -> u64 {
        time.to_cycles(self.effective_clock)
    }
}

/// Scheduler state shared by every CPU.
#[derive(Serialize, Deserialize)]
pub struct Scheduler {
    cpus: Vec<CpuExec>,
    yield_counter: u32,
    suspend_counter: u32,
    #[serde(skip)]
    active: Option<usize>,
    #[serde(skip)]
    icount: i32,
    #[serde(skip)]
    slice_cycles: i32,
    #[serde(skip)]
    cycles_stolen: i32,
    #[serde(skip)]
    slice_target: VirtualTime,
}

impl Scheduler {
    pub fn new(configs: &[CpuConfig]) -> Self {
        Scheduler {
            cpus: configs.iter().map(CpuExec::new).collect(),
            yield_counter: 0,
            suspend_counter: 0,
            active: None,
            icount: 0,
            slice_cycles: 0,
            cycles_stolen: 0,
            slice_target: VirtualTime::ZERO,
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, cpu: usize) -> Option<&CpuExec> {
        self.cpus.get(cpu)
    }

    fn cpu_mut(&mut self, cpu: usize, op: &str) -> Option<&mut CpuExec> {
        let count = self.cpus.len();
        let exec = self.cpus.get_mut(cpu);
        if exec.is_none() {
            tracing::error!(cpu, count, "{op}: cpu index out of range");
        }
        exec
    }

    fn active_for(&self, op: &str) -> Option<usize> {
        if self.active.is_none() {
            tracing::error!("{op}: called with no cpu executing");
        }
        self.active
    }

    /// Reinitialize every descriptor for a machine reset. Cycle totals keep
    /// counting; a held reset line stays held.
    pub fn reset(&mut self, now: VirtualTime, start_disabled: &[bool]) {
        for (cpu, exec) in self.cpus.iter_mut().enumerate() {
            let mut reason = exec.suspend.pending() & SuspendReason::RESET;
            if start_disabled.get(cpu).copied().unwrap_or(false) {
                reason |= SuspendReason::DISABLE;
            }
            exec.suspend.force(reason, true);
            exec.trigger = None;
            exec.local_time = now;
        }
        self.active = None;
        self.icount = 0;
        self.slice_cycles = 0;
        self.cycles_stolen = 0;
        self.slice_target = now;
        self.yield_counter = 0;
        self.suspend_counter = 0;
    }

    /// CPU currently inside `execute`.
    pub fn active_cpu(&self) -> Option<usize> {
        self.active
    }

    /// Target time of the timeslice in progress.
    pub fn slice_target(&self) -> VirtualTime {
        self.slice_target
    }

    /// Current time as seen by the executing CPU, or global time otherwise.
    pub fn current_time(&self, timers: &TimerQueue) -> VirtualTime {
        match self.active {
            Some(cpu) => {
                let exec = &self.cpus[cpu];
                let done = (self.slice_cycles - self.icount - self.cycles_stolen).max(0);
                exec.local_time + exec.cycles_to_time(done as u64)
            }
            None => timers.current_time(),
        }
    }

    pub fn suspend(&mut self, cpu: usize, reason: SuspendReason, eat: bool) {
        let Some(exec) = self.cpu_mut(cpu, "suspend") else {
            return;
        };
        exec.suspend.suspend(reason, eat);
        tracing::debug!(cpu, ?reason, eat, pending = ?exec.suspend.pending(), "suspend");
        if self.active.is_some() {
            self.abort_timeslice();
        }
    }

    pub fn resume(&mut self, cpu: usize, reason: SuspendReason) {
        let Some(exec) = self.cpu_mut(cpu, "resume") else {
            return;
        };
        exec.suspend.resume(reason);
        tracing::debug!(cpu, ?reason, pending = ?exec.suspend.pending(), "resume");
        if self.active.is_some() {
            self.abort_timeslice();
        }
    }

    /// True if any of `reason` is set in the pending mask.
    pub fn is_suspended(&self, cpu: usize, reason: SuspendReason) -> bool {
        match self.cpus.get(cpu) {
            Some(exec) => exec.suspend.pending().intersects(reason),
            None => {
                tracing::error!(cpu, "is_suspended: cpu index out of range");
                false
            }
        }
    }

    /// Stop the executing CPU now; its unused cycles are not counted.
    pub fn abort_timeslice(&mut self) {
        let Some(cpu) = self.active_for("abort_timeslice") else {
            return;
        };
        let left = self.icount;
        self.cycles_stolen += left;
        self.icount = 0;
        tracing::trace!(cpu, left, "timeslice aborted");
    }

    pub fn remaining_cycles(&self) -> i32 {
        match self.active_for("remaining_cycles") {
            Some(_) => self.icount,
            None => 0,
        }
    }

    /// Add `delta` cycles to the executing CPU's countdown. Negative values
    /// burn cycles.
    pub fn adjust_remaining_cycles(&mut self, delta: i32) {
        if self.active_for("adjust_remaining_cycles").is_some() {
            self.icount = self.icount.saturating_add(delta);
        }
    }

    /// Cycles executed so far in the current `execute` call.
    pub fn cycles_executed(&self) -> i32 {
        match self.active {
            Some(_) => (self.slice_cycles - self.icount - self.cycles_stolen).max(0),
            None => 0,
        }
    }

    pub fn spin_until_trigger(&mut self, cpu: usize, trigger: TriggerId) {
        self.wait_for_trigger(cpu, trigger, true);
    }

    pub fn yield_until_trigger(&mut self, cpu: usize, trigger: TriggerId) {
        self.wait_for_trigger(cpu, trigger, false);
    }

    fn wait_for_trigger(&mut self, cpu: usize, trigger: TriggerId, eat: bool) {
        if self.cpu_mut(cpu, "wait_for_trigger").is_none() {
            return;
        }
        self.suspend(cpu, SuspendReason::TRIGGER, eat);
        self.cpus[cpu].trigger = Some(trigger);
    }

    /// Resume every CPU waiting on `trigger`. Returns how many woke.
    pub fn trigger(&mut self, trigger: TriggerId) -> usize {
        if self.active.is_some() {
            self.abort_timeslice();
        }
        let mut woken = 0;
        for (cpu, exec) in self.cpus.iter_mut().enumerate() {
            if exec.trigger == Some(trigger) {
                exec.suspend.resume(SuspendReason::TRIGGER);
                exec.trigger = None;
                woken += 1;
                tracing::debug!(cpu, ?trigger, "resumed by trigger");
            }
        }
        woken
    }

    /// Fire `trigger` after `delay`.
    pub fn trigger_after(&mut self, timers: &mut TimerQueue, delay: VirtualTime, trigger: TriggerId) -> bool {
        let fire_at = self.current_time(timers) + delay;
        match timers.set_temporary(fire_at, TimerAction::Trigger(trigger), 0) {
            Ok(_) => {
                if self.active.is_some() && fire_at < self.slice_target {
                    self.abort_timeslice();
                }
                true
            }
            Err(err) => {
                tracing::error!(?trigger, %err, "trigger_after: cannot schedule trigger");
                false
            }
        }
    }

    /// Burn the rest of the timeslice.
    pub fn spin(&mut self) {
        if let Some(cpu) = self.active_for("spin") {
            self.spin_until_trigger(cpu, TriggerId::TIMESLICE);
        }
    }

    /// Give up the rest of the timeslice without burning cycles.
    pub fn yield_cpu(&mut self) {
        if let Some(cpu) = self.active_for("yield_cpu") {
            self.yield_until_trigger(cpu, TriggerId::TIMESLICE);
        }
    }

    pub fn spin_until_interrupt(&mut self) {
        if let Some(cpu) = self.active_for("spin_until_interrupt") {
            self.spin_until_trigger(cpu, TriggerId::interrupt(cpu));
        }
    }

    pub fn spin_until_time(&mut self, timers: &mut TimerQueue, duration: VirtualTime) {
        let Some(cpu) = self.active_for("spin_until_time") else {
            return;
        };
        let trigger = TriggerId::suspend_time(self.suspend_counter);
        self.suspend_counter = (self.suspend_counter + 1) % trigger::TIMED_TRIGGER_SLOTS;
        self.spin_until_trigger(cpu, trigger);
        self.trigger_after(timers, duration, trigger);
    }

    pub fn yield_until_time(&mut self, timers: &mut TimerQueue, duration: VirtualTime) {
        let Some(cpu) = self.active_for("yield_until_time") else {
            return;
        };
        let trigger = TriggerId::yield_time(self.yield_counter);
        self.yield_counter = (self.yield_counter + 1) % trigger::TIMED_TRIGGER_SLOTS;
        self.yield_until_trigger(cpu, trigger);
        self.trigger_after(timers, duration, trigger);
    }

    pub fn set_halt_line(&mut self, cpu: usize, state: LineState) {
        match state {
            LineState::Clear => self.resume(cpu, SuspendReason::HALT),
            LineState::Assert | LineState::Hold => self.suspend(cpu, SuspendReason::HALT, true),
            LineState::Pulse => {}
        }
    }

    pub fn set_reset_line(&mut self, cpu: usize, state: LineState) {
        match state {
            LineState::Clear => self.resume(cpu, SuspendReason::RESET),
            LineState::Assert | LineState::Hold => self.suspend(cpu, SuspendReason::RESET, true),
            LineState::Pulse => {}
        }
    }

    pub fn set_clock(&mut self, cpu: usize, hz: u64) {
        if hz == 0 {
            tracing::error!(cpu, "set_clock: clock must be non-zero");
            return;
        }
        if let Some(exec) = self.cpu_mut(cpu, "set_clock") {
            exec.clock = hz;
            exec.recompute_clock();
        }
    }

    pub fn set_clock_scale(&mut self, cpu: usize, scale: f64) {
        if !scale.is_finite() || scale <= 0.0 {
            tracing::error!(cpu, scale, "set_clock_scale: scale must be finite and positive");
            return;
        }
        if let Some(exec) = self.cpu_mut(cpu, "set_clock_scale") {
            exec.clock_scale = scale;
            exec.recompute_clock();
        }
    }

    pub fn cycles_to_time(&self, cpu: usize, cycles: u64) -> VirtualTime {
        match self.cpus.get(cpu) {
            Some(exec) => exec.cycles_to_time(cycles),
            None => {
                tracing::error!(cpu, "cycles_to_time: cpu index out of range");
                VirtualTime::ZERO
            }
        }
    }

    pub fn time_to_cycles(&self, cpu: usize, time: VirtualTime) -> u64 {
        match self.cpus.get(cpu) {
            Some(exec) => exec.time_to_cycles(time),
            None => {
                tracing::error!(cpu, "time_to_cycles: cpu index out of range");
                0
            }
        }
    }

    /// Total cycles of `cpu`, including the executing CPU's progress.
    pub fn total_cycles(&self, cpu: usize) -> u64 {
        match self.cpus.get(cpu) {
            Some(exec) if self.active == Some(cpu) => exec.total_cycles + self.cycles_executed() as u64,
            Some(exec) => exec.total_cycles,
            None => {
                tracing::error!(cpu, "total_cycles: cpu index out of range");
                0
            }
        }
    }

    pub fn local_time(&self, cpu: usize) -> VirtualTime {
        match self.cpus.get(cpu) {
            Some(exec) => exec.local_time,
            None => {
                tracing::error!(cpu, "local_time: cpu index out of range");
                VirtualTime::NEVER
            }
        }
    }

    /// Run one timeslice. `exec` runs one CPU core for the given cycle
    /// budget and returns the cycles it ran.
    pub fn timeslice<F>(&mut self, timers: &mut TimerQueue, mut exec: F)
    where
        F: FnMut(&mut Scheduler, &mut TimerQueue, usize, i32) -> i32,
    {
        let base = timers.current_time();
        let mut target = timers.next_fire_time();
        if target.is_never() {
            tracing::error!("timeslice: no timer scheduled, nothing to run to");
            return;
        }

        for (cpu, state) in self.cpus.iter_mut().enumerate() {
            if state.suspend.commit() {
                tracing::debug!(cpu, suspend = ?state.suspend.current(), "suspend state committed");
            }
        }
        self.slice_target = target;

        for cpu in 0..self.cpus.len() {
            if !self.cpus[cpu].suspend.is_running() || target <= self.cpus[cpu].local_time {
                continue;
            }
            let budget = self.cpus[cpu].time_to_cycles(target - self.cpus[cpu].local_time);
            let cycles = budget.min(i32::MAX as u64) as i32;
            if cycles <= 0 {
                continue;
            }

            self.active = Some(cpu);
            self.icount = cycles;
            self.slice_cycles = cycles;
            self.cycles_stolen = 0;
            let ran = exec(self, timers, cpu, cycles);
            let net = (ran - self.cycles_stolen).max(0) as u64;
            self.active = None;
            self.icount = 0;
            self.slice_cycles = 0;
            self.cycles_stolen = 0;

            let state = &mut self.cpus[cpu];
            state.total_cycles += net;
            state.local_time += state.cycles_to_time(net);
            tracing::trace!(cpu, cycles, ran = net, local = %state.local_time, "cpu executed");

            // a full budget leaves at most a sub-cycle rounding gap
            if net < cycles as u64 && state.local_time < target {
                target = state.local_time.max(base);
                self.slice_target = target;
            }
        }

        for state in self.cpus.iter_mut() {
            if state.suspend.is_running() || state.local_time >= target {
                continue;
            }
            if state.suspend.eats_cycles() {
                let cycles = state.time_to_cycles(target - state.local_time);
                state.total_cycles += cycles;
                state.local_time += state.cycles_to_time(cycles);
            } else {
                state.local_time = target;
            }
        }

        timers.set_global_time(target);
    }

    pub fn save_state(&self, registry: &mut StateRegistry) -> Result<(), StateError> {
        for (cpu, exec) in self.cpus.iter().enumerate() {
            let instance = cpu as u32;
            registry.save_item(STATE_TAG, instance, "suspend", &exec.suspend)?;
            registry.save_item(STATE_TAG, instance, "trigger", &exec.trigger)?;
            registry.save_item(STATE_TAG, instance, "total_cycles", &exec.total_cycles)?;
            registry.save_item(STATE_TAG, instance, "local_time", &exec.local_time)?;
            registry.save_item(STATE_TAG, instance, "clock", &exec.clock)?;
            registry.save_item(STATE_TAG, instance, "clock_scale", &exec.clock_scale)?;
        }
        registry.save_item(STATE_TAG, 0, "yield_counter", &self.yield_counter)?;
        registry.save_item(STATE_TAG, 0, "suspend_counter", &self.suspend_counter)?;
        Ok(())
    }

    pub fn load_state(&mut self, registry: &StateRegistry) -> Result<(), StateError> {
        for (cpu, exec) in self.cpus.iter_mut().enumerate() {
            let instance = cpu as u32;
            exec.suspend = registry.load_item(STATE_TAG, instance, "suspend")?;
            exec.trigger = registry.load_item(STATE_TAG, instance, "trigger")?;
            exec.total_cycles = registry.load_item(STATE_TAG, instance, "total_cycles")?;
            exec.local_time = registry.load_item(STATE_TAG, instance, "local_time")?;
            exec.clock = registry.load_item(STATE_TAG, instance, "clock")?;
            exec.clock_scale = registry.load_item(STATE_TAG, instance, "clock_scale")?;
            exec.recompute_clock();
        }
        self.yield_counter = registry.load_item(STATE_TAG, 0, "yield_counter")?;
        self.suspend_counter = registry.load_item(STATE_TAG, 0, "suspend_counter")?;
        self.active = None;
        self.icount = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(clocks: &[u64]) -> (Scheduler, TimerQueue) {
        let configs: Vec<_> = clocks.iter().map(|&hz| CpuConfig::new("cpu", hz)).collect();
        let mut timers = TimerQueue::new();
        let frame = timers.allocate(TimerAction::VblankPulse).unwrap();
        timers.adjust(frame, VirtualTime::from_hz(60), 0, VirtualTime::from_hz(60));
        (Scheduler::new(&configs), timers)
    }

    /// Run one slice with cores that consume their whole budget.
    fn run_exact(sched: &mut Scheduler, timers: &mut TimerQueue) -> Vec<(usize, i32)> {
        let mut calls = Vec::new();
        sched.timeslice(timers, |s, _, cpu, cycles| {
            calls.push((cpu, cycles));
            let left = s.remaining_cycles();
            s.adjust_remaining_cycles(-left);
            cycles
        });
        calls
    }

    #[test]
    fn test_two_cpu_slice_budgets() {
        let (mut sched, mut timers) = scheduler(&[4_000_000, 2_000_000]);
        let calls = run_exact(&mut sched, &mut timers);
        assert_eq!(calls, vec![(0, 66_666), (1, 33_333)]);
        assert_eq!(sched.total_cycles(0), 66_666);
        assert_eq!(sched.total_cycles(1), 33_333);
        assert!(timers.current_time() <= VirtualTime::from_hz(60));
    }

    #[test]
    fn test_local_time_never_passes_global() {
        let (mut sched, mut timers) = scheduler(&[3_579_545, 1_789_772, 6_000_000]);
        for _ in 0..20 {
            run_exact(&mut sched, &mut timers);
            while timers.pop_due().is_some() {}
            let now = timers.current_time();
            for cpu in 0..3 {
                assert!(sched.local_time(cpu) <= now);
            }
        }
    }

    #[test]
    fn test_short_run_pulls_target_back() {
        let (mut sched, mut timers) = scheduler(&[1_000_000, 1_000_000]);
        let mut calls = Vec::new();
        sched.timeslice(&mut timers, |s, _, cpu, cycles| {
            calls.push((cpu, cycles));
            if cpu == 0 {
                // run 100 cycles then give up the rest
                s.adjust_remaining_cycles(-100);
                s.abort_timeslice();
            }
            cycles
        });
        assert_eq!(calls, vec![(0, 16_666), (1, 100)]);
        assert_eq!(sched.total_cycles(0), 100);
        assert_eq!(timers.current_time(), VirtualTime::from_cycles(100, 1_000_000));
    }

    #[test]
    fn test_self_suspend_aborts_but_waits_for_boundary() {
        let (mut sched, mut timers) = scheduler(&[1_000_000]);
        sched.timeslice(&mut timers, |s, _, cpu, cycles| {
            s.adjust_remaining_cycles(-10);
            s.suspend(cpu, SuspendReason::HALT, false);
            // current mask unchanged until the next slice
            assert!(s.cpu(cpu).unwrap().suspend_state().is_running());
            assert_eq!(s.remaining_cycles(), 0);
            cycles
        });
        assert_eq!(sched.total_cycles(0), 10);
        assert!(sched.is_suspended(0, SuspendReason::HALT));

        let calls = run_exact(&mut sched, &mut timers);
        assert!(calls.is_empty());
        assert!(!sched.cpu(0).unwrap().suspend_state().is_running());
    }

    #[test]
    fn test_eating_cpu_counts_cycles() {
        let (mut sched, mut timers) = scheduler(&[1_000_000, 1_000_000]);
        sched.suspend(1, SuspendReason::HALT, true);
        run_exact(&mut sched, &mut timers);
        assert_eq!(sched.total_cycles(1), 16_666);

        sched.resume(1, SuspendReason::HALT);
        sched.suspend(1, SuspendReason::DISABLE, false);
        while timers.pop_due().is_some() {}
        run_exact(&mut sched, &mut timers);
        // frozen: no cycles, but the clock is carried along
        assert_eq!(sched.total_cycles(1), 16_666);
        assert_eq!(sched.local_time(1), timers.current_time());
    }

    #[test]
    fn test_trigger_resumes_only_waiters() {
        let (mut sched, _) = scheduler(&[1_000_000, 1_000_000, 1_000_000]);
        sched.spin_until_trigger(0, TriggerId(5));
        sched.yield_until_trigger(1, TriggerId(6));
        sched.spin_until_trigger(2, TriggerId(5));
        assert_eq!(sched.trigger(TriggerId(5)), 2);
        assert!(!sched.is_suspended(0, SuspendReason::TRIGGER));
        assert!(sched.is_suspended(1, SuspendReason::TRIGGER));
        assert!(!sched.is_suspended(2, SuspendReason::TRIGGER));
        assert_eq!(sched.cpu(0).unwrap().trigger(), None);
        assert_eq!(sched.cpu(1).unwrap().trigger(), Some(TriggerId(6)));
    }

    #[test]
    fn test_misuse_is_a_logged_no_op() {
        let (mut sched, _) = scheduler(&[1_000_000]);
        sched.abort_timeslice();
        sched.suspend(7, SuspendReason::HALT, true);
        sched.spin();
        assert_eq!(sched.remaining_cycles(), 0);
        assert_eq!(sched.total_cycles(9), 0);
        assert_eq!(sched.local_time(9), VirtualTime::NEVER);
        assert!(!sched.is_suspended(9, SuspendReason::all()));
    }

    #[test]
    fn test_spin_until_time_wakes_after_delay() {
        let (mut sched, mut timers) = scheduler(&[1_000_000]);
        sched.timeslice(&mut timers, |s, t, _, cycles| {
            s.spin_until_time(t, VirtualTime::from_micros(20_000));
            cycles - s.remaining_cycles()
        });
        let wake = TriggerId::suspend_time(0);
        assert_eq!(sched.cpu(0).unwrap().trigger(), Some(wake));

        // the wake-up timer lands after the first frame timer
        let mut fired = Vec::new();
        for _ in 0..4 {
            run_exact(&mut sched, &mut timers);
            while let Some(timer) = timers.pop_due() {
                if let TimerAction::Trigger(id) = timer.action {
                    sched.trigger(id);
                }
                fired.push(timer.action);
            }
        }
        assert!(fired.contains(&TimerAction::Trigger(wake)));
        assert!(!sched.is_suspended(0, SuspendReason::TRIGGER));
    }

    #[test]
    fn test_clock_scale_changes_budget() {
        let (mut sched, mut timers) = scheduler(&[1_000_000]);
        sched.set_clock_scale(0, 2.0);
        assert_eq!(sched.cpu(0).unwrap().effective_clock(), 2_000_000);
        let calls = run_exact(&mut sched, &mut timers);
        assert_eq!(calls, vec![(0, 33_333)]);
        sched.set_clock_scale(0, f64::NAN);
        assert_eq!(sched.cpu(0).unwrap().effective_clock(), 2_000_000);
    }

    #[test]
    fn test_reset_keeps_reset_line_and_disables() {
        let (mut sched, _) = scheduler(&[1_000_000, 1_000_000]);
        sched.set_reset_line(0, LineState::Assert);
        sched.spin_until_trigger(1, TriggerId(1));
        sched.reset(VirtualTime::from_secs(1), &[false, true]);
        assert!(sched.is_suspended(0, SuspendReason::RESET));
        assert!(sched.is_suspended(1, SuspendReason::DISABLE));
        assert!(!sched.is_suspended(1, SuspendReason::TRIGGER));
        assert_eq!(sched.local_time(1), VirtualTime::from_secs(1));
    }
}
