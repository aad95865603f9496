//! Machine orchestrator
//!
//! Owns every subsystem and the CPU cores, runs timeslices and fires due
//! timers between them. Cores and driver callbacks reach the machine
//! through a [`MachineBus`], a bundle of borrows of the subsystems with the
//! index of the CPU the access is made for.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::config::MachineConfig;
use crate::cpu::{CpuCore, InputLine, LineState};
#[cfg(feature = "debugger")]
use crate::debug::Debugger;
use crate::error::{ConfigError, Result, StateError, TimerError};
use crate::interrupts::Interrupts;
use crate::memory::Memory;
use crate::scheduler::{Scheduler, SuspendReason, TriggerId};
use crate::snapshot::{Snapshot, StateRegistry};
use crate::time::VirtualTime;
use crate::timer::{FiredTimer, TimerAction, TimerId, TimerQueue};
use crate::watchdog::{Watchdog, WatchdogState};

const STATE_TAG: &str = "machine";

/// Driver timer callback; receives the timer's parameter.
pub type DriverCallback = Rc<dyn Fn(&mut MachineBus<'_>, i32)>;

/// Screen update hook; receives the frame number.
pub type ScreenUpdate = Rc<dyn Fn(&mut MachineBus<'_>, u64)>;

/// Driver hook run after every machine reset.
pub type ResetHook = Rc<dyn Fn(&mut MachineBus<'_>)>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Requests {
    soft_reset: bool,
    exit: bool,
}

/// Input-line changes waiting for delivery, per CPU.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct LineQueue {
    pending: Vec<Vec<(InputLine, LineState)>>,
}

impl LineQueue {
    fn new(cpus: usize) -> Self {
        LineQueue {
            pending: vec![Vec::new(); cpus],
        }
    }

    fn clear(&mut self) {
        self.pending.iter_mut().for_each(Vec::clear);
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct BoostTimers {
    boost: TimerId,
    end: TimerId,
}

/// Execution context handed to cores and callbacks.
pub struct MachineBus<'a> {
    pub(crate) cpu: usize,
    pub(crate) scheduler: &'a mut Scheduler,
    pub(crate) timers: &'a mut TimerQueue,
    pub(crate) memory: &'a mut Memory,
    pub(crate) interrupts: &'a mut Interrupts,
    pub(crate) watchdog: &'a mut Watchdog,
    pub(crate) lines: &'a mut LineQueue,
    pub(crate) requests: &'a mut Requests,
    pub(crate) boost: BoostTimers,
    #[cfg(feature = "debugger")]
    pub(crate) debugger: &'a mut Debugger,
}

impl MachineBus<'_> {
    /// CPU this bus acts for.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Current time: the executing CPU's local time, or global time between
    /// timeslices.
    pub fn now(&self) -> VirtualTime {
        self.scheduler.current_time(self.timers)
    }

    pub fn memory(&mut self) -> &mut Memory {
        &mut *self.memory
    }

    /// Burn `cycles` of the executing CPU's budget.
    pub fn consume_cycles(&mut self, cycles: i32) {
        self.scheduler.adjust_remaining_cycles(-cycles);
    }

    pub fn remaining_cycles(&self) -> i32 {
        self.scheduler.remaining_cycles()
    }

    pub fn adjust_remaining_cycles(&mut self, delta: i32) {
        self.scheduler.adjust_remaining_cycles(delta);
    }

    pub fn cycles_executed(&self) -> i32 {
        self.scheduler.cycles_executed()
    }

    pub fn total_cycles(&self, cpu: usize) -> u64 {
        self.scheduler.total_cycles(cpu)
    }

    pub fn local_time(&self, cpu: usize) -> VirtualTime {
        self.scheduler.local_time(cpu)
    }

    pub fn cycles_to_time(&self, cpu: usize, cycles: u64) -> VirtualTime {
        self.scheduler.cycles_to_time(cpu, cycles)
    }

    pub fn time_to_cycles(&self, cpu: usize, time: VirtualTime) -> u64 {
        self.scheduler.time_to_cycles(cpu, time)
    }

    pub fn set_clock(&mut self, cpu: usize, hz: u64) {
        self.scheduler.set_clock(cpu, hz);
    }

    pub fn set_clock_scale(&mut self, cpu: usize, scale: f64) {
        self.scheduler.set_clock_scale(cpu, scale);
    }

    pub fn suspend(&mut self, cpu: usize, reason: SuspendReason, eat: bool) {
        self.scheduler.suspend(cpu, reason, eat);
    }

    pub fn resume(&mut self, cpu: usize, reason: SuspendReason) {
        self.scheduler.resume(cpu, reason);
    }

    pub fn is_suspended(&self, cpu: usize, reason: SuspendReason) -> bool {
        self.scheduler.is_suspended(cpu, reason)
    }

    pub fn abort_timeslice(&mut self) {
        self.scheduler.abort_timeslice();
    }

    pub fn spin(&mut self) {
        self.scheduler.spin();
    }

    pub fn yield_cpu(&mut self) {
        self.scheduler.yield_cpu();
    }

    pub fn spin_until_interrupt(&mut self) {
        self.scheduler.spin_until_interrupt();
    }

    pub fn spin_until_trigger(&mut self, cpu: usize, trigger: TriggerId) {
        self.scheduler.spin_until_trigger(cpu, trigger);
    }

    pub fn yield_until_trigger(&mut self, cpu: usize, trigger: TriggerId) {
        self.scheduler.yield_until_trigger(cpu, trigger);
    }

    pub fn spin_until_time(&mut self, duration: VirtualTime) {
        self.scheduler.spin_until_time(self.timers, duration);
    }

    pub fn yield_until_time(&mut self, duration: VirtualTime) {
        self.scheduler.yield_until_time(self.timers, duration);
    }

    pub fn trigger(&mut self, trigger: TriggerId) -> usize {
        self.scheduler.trigger(trigger)
    }

    pub fn trigger_after(&mut self, delay: VirtualTime, trigger: TriggerId) -> bool {
        self.scheduler.trigger_after(self.timers, delay, trigger)
    }

    /// Stop the executing CPU if `fire_at` falls inside its timeslice.
    fn abort_if_before_target(&mut self, fire_at: VirtualTime) {
        if self.scheduler.active_cpu().is_some() && fire_at < self.scheduler.slice_target() {
            self.scheduler.abort_timeslice();
        }
    }

    fn schedule(&mut self, delay: VirtualTime, action: TimerAction, param: i32) -> Result<TimerId, TimerError> {
        let fire_at = self.now() + delay;
        let id = self.timers.set_temporary(fire_at, action, param)?;
        self.abort_if_before_target(fire_at);
        Ok(id)
    }

    /// Queue an input-line change. It reaches the CPU at the next timer
    /// boundary, which comes right away if a CPU is executing.
    pub fn set_input_line(&mut self, cpu: usize, line: InputLine, state: LineState) {
        let Some(queue) = self.lines.pending.get_mut(cpu) else {
            tracing::error!(cpu, ?line, "set_input_line: cpu index out of range");
            return;
        };
        let first = queue.is_empty();
        queue.push((line, state));
        if first {
            if let Err(err) = self.schedule(VirtualTime::ZERO, TimerAction::InputLines(cpu), 0) {
                tracing::error!(cpu, %err, "set_input_line: cannot schedule delivery");
            }
        }
    }

    /// Run with `slice` interleave for `duration`. A zero `slice` means one
    /// cycle of the fastest CPU.
    pub fn boost_interleave(&mut self, slice: VirtualTime, duration: VirtualTime) {
        if duration.is_zero() {
            return;
        }
        let slice = if slice.is_zero() {
            (0..self.scheduler.cpu_count())
                .map(|cpu| self.scheduler.cycles_to_time(cpu, 1))
                .min()
                .unwrap_or(VirtualTime::ZERO)
        } else {
            slice
        };
        if slice.is_zero() {
            return;
        }
        let now = self.now();
        self.timers.adjust(self.boost.boost, now + slice, 0, slice);
        self.timers.adjust(self.boost.end, now + duration, 0, VirtualTime::ZERO);
        tracing::debug!(slice = %slice, duration = %duration, "interleave boosted");
        self.abort_if_before_target(now + slice);
    }

    /// Interrupts left in the current frame for this CPU.
    pub fn iloops(&self) -> i32 {
        self.interrupts.iloops(self.cpu)
    }

    pub fn current_frame(&self) -> u64 {
        self.interrupts.current_frame()
    }

    pub fn in_vblank(&self) -> bool {
        self.interrupts.in_vblank()
    }

    pub fn time_until_vblank_start(&self) -> VirtualTime {
        self.interrupts.time_until_vblank_start(self.timers)
    }

    pub fn frame_period(&self) -> VirtualTime {
        self.interrupts.frame_period()
    }

    pub fn watchdog_kick(&mut self) {
        let now = self.now();
        self.watchdog.kick(self.timers, now);
    }

    pub fn watchdog_enable(&mut self, enable: bool) {
        let now = self.now();
        self.watchdog.enable(self.timers, now, enable);
    }

    /// Reset the machine once the current timeslice ends.
    pub fn schedule_soft_reset(&mut self) {
        tracing::info!(cpu = self.cpu, "soft reset requested");
        self.requests.soft_reset = true;
    }

    pub fn schedule_exit(&mut self) {
        tracing::info!(cpu = self.cpu, "exit requested");
        self.requests.exit = true;
    }

    /// (Re)schedule a driver timer `delay` from now.
    pub fn adjust_timer(&mut self, timer: TimerId, delay: VirtualTime, param: i32, period: VirtualTime) {
        let fire_at = self.now() + delay;
        self.timers.adjust(timer, fire_at, param, period);
        self.abort_if_before_target(fire_at);
    }

    pub fn remove_timer(&mut self, timer: TimerId) {
        self.timers.remove(timer);
    }

    pub fn timer_elapsed(&self, timer: TimerId) -> VirtualTime {
        self.timers.elapsed(timer)
    }

    pub fn timer_remaining(&self, timer: TimerId) -> VirtualTime {
        self.timers.fire_time(timer) - self.now()
    }

    /// Run registered driver callback `callback` once, `delay` from now.
    pub fn set_timer(&mut self, delay: VirtualTime, callback: u32, param: i32) -> bool {
        match self.schedule(delay, TimerAction::Driver(callback), param) {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(callback, %err, "set_timer: cannot schedule callback");
                false
            }
        }
    }

    #[cfg(not(feature = "debugger"))]
    pub fn debug_hook(&mut self, _pc: u32) {}
}

/// A complete emulated machine.
pub struct Machine {
    config: MachineConfig,
    scheduler: Scheduler,
    timers: TimerQueue,
    memory: Memory,
    interrupts: Interrupts,
    watchdog: Watchdog,
    lines: LineQueue,
    requests: Requests,
    #[cfg(feature = "debugger")]
    debugger: Debugger,
    cores: Vec<Box<dyn CpuCore>>,
    driver_callbacks: Vec<DriverCallback>,
    screen_update: Option<ScreenUpdate>,
    reset_hook: Option<ResetHook>,
    timeslice_timer: TimerId,
    boost: BoostTimers,
    limit_timer: TimerId,
}

macro_rules! bus {
    ($machine:expr, $cpu:expr) => {
        MachineBus {
            cpu: $cpu,
            scheduler: &mut $machine.scheduler,
            timers: &mut $machine.timers,
            memory: &mut $machine.memory,
            interrupts: &mut $machine.interrupts,
            watchdog: &mut $machine.watchdog,
            lines: &mut $machine.lines,
            requests: &mut $machine.requests,
            boost: $machine.boost,
            #[cfg(feature = "debugger")]
            debugger: &mut $machine.debugger,
        }
    };
}

impl Machine {
    /// Build and reset a machine. `cores` are indexed like `config.cpus`.
    pub fn new(config: MachineConfig, cores: Vec<Box<dyn CpuCore>>) -> Result<Self> {
        if let Err(err) = config.validate() {
            tracing::error!(%err, "invalid machine configuration");
            return Err(err);
        }
        if cores.len() != config.cpus.len() {
            return Err(ConfigError::CoreCountMismatch {
                expected: config.cpus.len(),
                got: cores.len(),
            });
        }

        let mut timers = TimerQueue::new();
        let timeslice_timer = timers.allocate(TimerAction::Timeslice)?;
        let boost = BoostTimers {
            boost: timers.allocate(TimerAction::InterleaveBoost)?,
            end: timers.allocate(TimerAction::BoostEnd)?,
        };
        let limit_timer = timers.allocate(TimerAction::RunLimit)?;
        let interrupts = Interrupts::new(&config, &mut timers)?;
        let watchdog = Watchdog::new(config.watchdog, &mut timers)?;

        let mut machine = Machine {
            scheduler: Scheduler::new(&config.cpus),
            memory: Memory::new(&config.cpus),
            lines: LineQueue::new(config.cpus.len()),
            requests: Requests::default(),
            #[cfg(feature = "debugger")]
            debugger: Debugger::new(config.cpus.len()),
            cores,
            driver_callbacks: Vec::new(),
            screen_update: None,
            reset_hook: None,
            timeslice_timer,
            boost,
            limit_timer,
            timers,
            interrupts,
            watchdog,
            config,
        };
        machine.reset();
        tracing::info!(cpus = machine.config.cpus.len(), "machine created");
        Ok(machine)
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn cpu_count(&self) -> usize {
        self.cores.len()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn interrupts(&self) -> &Interrupts {
        &self.interrupts
    }

    pub fn watchdog_state(&self) -> WatchdogState {
        self.watchdog.state()
    }

    #[cfg(feature = "debugger")]
    pub fn debugger(&mut self) -> &mut Debugger {
        &mut self.debugger
    }

    pub fn core(&self, cpu: usize) -> Option<&dyn CpuCore> {
        self.cores.get(cpu).map(|core| core.as_ref())
    }

    /// Global time.
    pub fn now(&self) -> VirtualTime {
        self.timers.current_time()
    }

    /// Bus for host-side access on behalf of `cpu`, outside any timeslice.
    pub fn bus(&mut self, cpu: usize) -> MachineBus<'_> {
        bus!(self, cpu)
    }

    pub fn exit_requested(&self) -> bool {
        self.requests.exit
    }

    pub fn set_screen_update(&mut self, callback: ScreenUpdate) {
        self.screen_update = Some(callback);
    }

    pub fn set_reset_hook(&mut self, hook: ResetHook) {
        self.reset_hook = Some(hook);
    }

    /// Register a driver timer callback; the returned id names it in
    /// [`Machine::allocate_timer`] and [`MachineBus::set_timer`].
    pub fn register_timer_callback(&mut self, callback: DriverCallback) -> u32 {
        self.driver_callbacks.push(callback);
        (self.driver_callbacks.len() - 1) as u32
    }

    /// Allocate a persistent timer that runs driver callback `callback`.
    pub fn allocate_timer(&mut self, callback: u32) -> Result<TimerId, TimerError> {
        if callback as usize >= self.driver_callbacks.len() {
            tracing::error!(callback, "allocate_timer: callback was never registered");
        }
        self.timers.allocate(TimerAction::Driver(callback))
    }

    fn is_paused(&self) -> bool {
        #[cfg(feature = "debugger")]
        {
            self.debugger.is_paused()
        }
        #[cfg(not(feature = "debugger"))]
        {
            false
        }
    }

    /// Reset every subsystem and core. Driver timers are disabled; CPUs
    /// held in reset stay held.
    pub fn reset(&mut self) {
        self.timers.reset();
        let now = self.timers.current_time();
        tracing::info!(now = %now, "machine reset");

        let slices = self.config.frames_per_second as u64 * self.config.slices_per_frame as u64;
        let slice = VirtualTime::from_hz(slices);
        self.timers.adjust(self.timeslice_timer, now + slice, 0, slice);

        let start_disabled: Vec<bool> = self.config.cpus.iter().map(|cpu| cpu.start_disabled).collect();
        self.memory.reset();
        self.scheduler.reset(now, &start_disabled);
        self.interrupts.reset(&mut self.timers, &self.scheduler);
        self.watchdog.reset(&mut self.timers, now);
        self.lines.clear();
        self.requests.soft_reset = false;

        for (core, cpu) in self.cores.iter_mut().zip(&self.config.cpus) {
            core.reset(cpu.reset_param);
        }
        if let Some(hook) = self.reset_hook.clone() {
            hook(&mut bus!(self, 0));
        }
    }

    /// Run every CPU up to the next timer event, then fire due timers.
    pub fn timeslice(&mut self) {
        if self.is_paused() {
            return;
        }
        {
            let Machine {
                scheduler,
                timers,
                memory,
                interrupts,
                watchdog,
                lines,
                requests,
                cores,
                boost,
                #[cfg(feature = "debugger")]
                debugger,
                ..
            } = self;
            scheduler.timeslice(timers, |scheduler, timers, cpu, cycles| {
                let mut bus = MachineBus {
                    cpu,
                    scheduler,
                    timers,
                    memory: &mut *memory,
                    interrupts: &mut *interrupts,
                    watchdog: &mut *watchdog,
                    lines: &mut *lines,
                    requests: &mut *requests,
                    boost: *boost,
                    #[cfg(feature = "debugger")]
                    debugger: &mut *debugger,
                };
                cores[cpu].execute(cycles, &mut bus)
            });
        }

        while let Some(fired) = self.timers.pop_due() {
            self.fire(fired);
        }

        if self.requests.soft_reset {
            self.reset();
        }
    }

    fn fire(&mut self, fired: FiredTimer) {
        match fired.action {
            TimerAction::Timeslice | TimerAction::InterleaveBoost => {
                self.scheduler.trigger(TriggerId::TIMESLICE);
            }
            TimerAction::BoostEnd => {
                self.timers.remove(self.boost.boost);
                tracing::debug!("interleave boost ended");
            }
            TimerAction::RunLimit => {}
            TimerAction::VblankPulse => {
                let outcome = self.interrupts.pulse(&self.scheduler, true);
                for (cpu, callback) in &outcome.callbacks {
                    callback(&mut bus!(self, *cpu), *cpu);
                }
                self.interrupts.finish_pulse(&mut self.timers, &outcome);
                if outcome.vblank {
                    if self.watchdog.on_vblank() {
                        self.requests.soft_reset = true;
                    }
                    if outcome.update_screen {
                        self.update_screen();
                    }
                }
            }
            TimerAction::ScreenUpdate => {
                if self.interrupts.end_of_blanking() {
                    self.update_screen();
                }
            }
            TimerAction::TimedInterrupt(cpu) => {
                if let Some(callback) = self.interrupts.timed_interrupt(cpu, &self.scheduler) {
                    callback(&mut bus!(self, cpu), cpu);
                }
            }
            TimerAction::Trigger(trigger) => {
                self.scheduler.trigger(trigger);
            }
            TimerAction::InputLines(cpu) => self.deliver_input_lines(cpu),
            TimerAction::Watchdog => {
                if self.watchdog.on_timer() {
                    self.requests.soft_reset = true;
                }
            }
            TimerAction::Driver(id) => match self.driver_callbacks.get(id as usize).cloned() {
                Some(callback) => callback(&mut bus!(self, 0), fired.param),
                None => tracing::error!(callback = id, "timer fired for an unregistered callback"),
            },
        }
    }

    fn update_screen(&mut self) {
        if let Some(callback) = self.screen_update.clone() {
            let frame = self.interrupts.current_frame();
            callback(&mut bus!(self, 0), frame);
        }
    }

    fn deliver_input_lines(&mut self, cpu: usize) {
        let Some(queue) = self.lines.pending.get_mut(cpu) else {
            return;
        };
        let changes = std::mem::take(queue);
        let reset_param = self.config.cpus[cpu].reset_param;
        for (line, state) in changes {
            tracing::trace!(cpu, ?line, ?state, "input line");
            match line {
                InputLine::Reset => match state {
                    LineState::Assert | LineState::Hold => self.scheduler.set_reset_line(cpu, state),
                    LineState::Clear => {
                        if self.scheduler.is_suspended(cpu, SuspendReason::RESET) {
                            self.cores[cpu].reset(reset_param);
                            self.scheduler.set_reset_line(cpu, state);
                        }
                    }
                    LineState::Pulse => self.cores[cpu].reset(reset_param),
                },
                InputLine::Halt => self.scheduler.set_halt_line(cpu, state),
                InputLine::Irq(_) | InputLine::Nmi => self.cores[cpu].set_input_line(line, state),
            }
            if state.is_active() {
                self.scheduler.trigger(TriggerId::interrupt(cpu));
            }
        }
    }

    /// Run until global time reaches `target`, an exit is requested or the
    /// debugger pauses the machine.
    pub fn run_until(&mut self, target: VirtualTime) {
        while self.timers.current_time() < target && !self.requests.exit && !self.is_paused() {
            if !self.timers.is_enabled(self.limit_timer) {
                self.timers.adjust(self.limit_timer, target, 0, VirtualTime::ZERO);
            }
            self.timeslice();
        }
        self.timers.remove(self.limit_timer);
    }

    pub fn run_for(&mut self, duration: VirtualTime) {
        let target = self.now() + duration;
        self.run_until(target);
    }

    /// Run until the next real VBLANK.
    pub fn run_frame(&mut self) {
        let frame = self.interrupts.current_frame();
        while self.interrupts.current_frame() == frame && !self.requests.exit && !self.is_paused() {
            self.timeslice();
        }
    }

    pub fn save_state(&self, registry: &mut StateRegistry) -> Result<(), StateError> {
        self.scheduler.save_state(registry)?;
        registry.save_item("timers", 0, "queue", &self.timers)?;
        self.memory.save_state(registry)?;
        self.interrupts.save_state(registry)?;
        self.watchdog.save_state(registry)?;
        registry.save_item(STATE_TAG, 0, "lines", &self.lines)?;
        registry.save_item(STATE_TAG, 0, "requests", &self.requests)?;
        for (cpu, core) in self.cores.iter().enumerate() {
            registry.save_item("core", cpu as u32, "state", &core.save_state())?;
        }
        Ok(())
    }

    pub fn load_state(&mut self, registry: &StateRegistry) -> Result<(), StateError> {
        self.scheduler.load_state(registry)?;
        self.timers = registry.load_item("timers", 0, "queue")?;
        self.timers.rebuild();
        self.memory.load_state(registry)?;
        self.interrupts.load_state(registry)?;
        self.watchdog.load_state(registry)?;
        self.lines = registry.load_item(STATE_TAG, 0, "lines")?;
        self.requests = registry.load_item(STATE_TAG, 0, "requests")?;
        for (cpu, core) in self.cores.iter_mut().enumerate() {
            let state: Vec<u8> = registry.load_item("core", cpu as u32, "state")?;
            core.load_state(&state);
        }
        Ok(())
    }

    /// Compressed snapshot of the whole machine.
    pub fn snapshot(&self) -> Result<Vec<u8>, StateError> {
        let mut registry = StateRegistry::new();
        self.save_state(&mut registry)?;
        let bytes = Snapshot::new(self.config.fingerprint(), registry).to_bytes()?;
        tracing::info!(bytes = bytes.len(), now = %self.now(), "snapshot saved");
        Ok(bytes)
    }

    /// Restore a snapshot taken from an identically configured machine.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let snapshot = Snapshot::from_bytes(bytes)?;
        snapshot.check_config(&self.config.fingerprint())?;
        self.load_state(&snapshot.state)?;
        tracing::info!(now = %self.now(), "snapshot restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use std::cell::Cell;

    /// Core that burns its whole budget and counts resets.
    struct Burner {
        resets: Rc<Cell<u32>>,
    }

    impl CpuCore for Burner {
        fn execute(&mut self, cycles: i32, bus: &mut MachineBus<'_>) -> i32 {
            let left = bus.remaining_cycles();
            bus.consume_cycles(left);
            cycles - bus.remaining_cycles()
        }

        fn reset(&mut self, _param: i32) {
            self.resets.set(self.resets.get() + 1);
        }

        fn pc(&self) -> u32 {
            0
        }

        fn set_input_line(&mut self, _line: InputLine, _state: LineState) {}
    }

    fn machine(config: MachineConfig) -> (Machine, Rc<Cell<u32>>) {
        let resets = Rc::new(Cell::new(0));
        let cores: Vec<Box<dyn CpuCore>> = config
            .cpus
            .iter()
            .map(|_| Box::new(Burner { resets: resets.clone() }) as Box<dyn CpuCore>)
            .collect();
        (Machine::new(config, cores).unwrap(), resets)
    }

    fn single(clock: u64) -> MachineConfig {
        MachineConfig {
            cpus: vec![CpuConfig::new("main", clock)],
            ..Default::default()
        }
    }

    #[test]
    fn test_core_count_must_match() {
        let err = Machine::new(single(1_000_000), Vec::new()).err();
        assert_eq!(err, Some(ConfigError::CoreCountMismatch { expected: 1, got: 0 }));
    }

    #[test]
    fn test_run_frame_advances_one_frame() {
        let (mut machine, resets) = machine(single(1_000_000));
        assert_eq!(resets.get(), 1);
        machine.run_frame();
        assert_eq!(machine.interrupts().current_frame(), 1);
        assert_eq!(machine.now(), VirtualTime::from_hz(60));
        assert_eq!(machine.scheduler().total_cycles(0), 16_666);
    }

    #[test]
    fn test_run_until_stops_at_limit() {
        let (mut machine, _) = machine(single(1_000_000));
        let target = VirtualTime::from_micros(1000);
        machine.run_until(target);
        assert_eq!(machine.now(), target);
        assert_eq!(machine.scheduler().total_cycles(0), machine.scheduler().time_to_cycles(0, target));
        assert!(!machine.timers().is_enabled(machine.limit_timer));
    }

    #[test]
    fn test_soft_reset_runs_at_end_of_slice() {
        let (mut machine, resets) = machine(single(1_000_000));
        let callback = machine.register_timer_callback(Rc::new(|bus: &mut MachineBus<'_>, _: i32| bus.schedule_soft_reset()));
        assert!(machine.bus(0).set_timer(VirtualTime::from_micros(10), callback, 0));
        machine.timeslice();
        assert_eq!(resets.get(), 2);
    }

    #[test]
    fn test_watchdog_resets_after_missed_kicks() {
        let mut config = single(1_000_000);
        config.watchdog = crate::config::WatchdogConfig::Vblank(3);
        let (mut machine, resets) = machine(config);
        for _ in 0..3 {
            machine.run_frame();
        }
        assert_eq!(resets.get(), 2);
        assert_eq!(machine.watchdog_state(), WatchdogState::Counting(3));
    }

    #[test]
    fn test_driver_timer_param_and_exit() {
        let (mut machine, _) = machine(single(1_000_000));
        let seen = Rc::new(Cell::new(0));
        let sink = seen.clone();
        let callback = machine.register_timer_callback(Rc::new(move |bus: &mut MachineBus<'_>, param: i32| {
            sink.set(param);
            bus.schedule_exit();
        }));
        let timer = machine.allocate_timer(callback).unwrap();
        machine.bus(0).adjust_timer(timer, VirtualTime::from_micros(250), 77, VirtualTime::ZERO);
        machine.run_for(VirtualTime::from_secs(1));
        assert_eq!(seen.get(), 77);
        assert!(machine.exit_requested());
        assert_eq!(machine.now(), VirtualTime::from_micros(250));
    }
}
