//! Debug hook layer
//!
//! Breakpoints, watchpoints, single-stepping and instruction tracing. The
//! per-CPU [`DebugFlags`] word is all a hot path looks at; the lists are
//! only walked when a flag says something could match.
//!
//! A hit records a [`DebugEvent`], pauses the machine and aborts the running
//! timeslice. The machine stays paused until [`Debugger::resume`].

use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::machine::MachineBus;
use crate::memory::SpaceKind;

bitflags! {
    /// What the debugger watches on one CPU.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DebugFlags: u8 {
        const BREAKPOINTS = 1 << 0;
        const WATCH_READ = 1 << 1;
        const WATCH_WRITE = 1 << 2;
        const STEP = 1 << 3;
        const TRACE = 1 << 4;
    }
}

impl Default for DebugFlags {
    fn default() -> Self {
        DebugFlags::empty()
    }
}

/// Extra test applied to a would-be hit.
pub type Condition = Rc<dyn Fn(&DebugEvent) -> bool>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchKind {
    Read,
    Write,
    ReadWrite,
}

impl WatchKind {
    fn reads(self) -> bool {
        matches!(self, WatchKind::Read | WatchKind::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, WatchKind::Write | WatchKind::ReadWrite)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebugEvent {
    Breakpoint {
        index: usize,
        cpu: usize,
        pc: u32,
        action: Option<String>,
    },
    Watchpoint {
        index: usize,
        cpu: usize,
        space: SpaceKind,
        addr: u32,
        /// `None` for reads.
        data: Option<u64>,
        action: Option<String>,
    },
    Step {
        cpu: usize,
        pc: u32,
    },
}

#[derive(Clone)]
pub struct Breakpoint {
    pub index: usize,
    pub cpu: usize,
    pub address: u32,
    pub enabled: bool,
    pub hits: u64,
    pub action: Option<String>,
    condition: Option<Condition>,
}

#[derive(Clone)]
pub struct Watchpoint {
    pub index: usize,
    pub cpu: usize,
    pub space: SpaceKind,
    pub kind: WatchKind,
    /// Inclusive byte address range.
    pub start: u32,
    pub end: u32,
    pub enabled: bool,
    pub hits: u64,
    pub action: Option<String>,
    condition: Option<Condition>,
}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("index", &self.index)
            .field("cpu", &self.cpu)
            .field("address", &format_args!("{:#x}", self.address))
            .field("enabled", &self.enabled)
            .field("hits", &self.hits)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

impl fmt::Debug for Watchpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchpoint")
            .field("index", &self.index)
            .field("cpu", &self.cpu)
            .field("space", &self.space)
            .field("kind", &self.kind)
            .field("range", &format_args!("{:#x}..={:#x}", self.start, self.end))
            .field("enabled", &self.enabled)
            .field("hits", &self.hits)
            .finish()
    }
}

fn passes(condition: &Option<Condition>, event: &DebugEvent) -> bool {
    condition.as_ref().map_or(true, |test| test(event))
}

/// Bytes covered by an access mask.
fn mask_bytes(mask: u64) -> u32 {
    ((64 - mask.leading_zeros()) + 7) / 8
}

pub struct Debugger {
    flags: Vec<DebugFlags>,
    /// Instructions left before a step stops.
    steps: Vec<Option<u32>>,
    breakpoints: Vec<Breakpoint>,
    watchpoints: Vec<Watchpoint>,
    next_index: usize,
    paused: bool,
    events: Vec<DebugEvent>,
}

impl Debugger {
    pub fn new(cpu_count: usize) -> Self {
        Debugger {
            flags: vec![DebugFlags::empty(); cpu_count],
            steps: vec![None; cpu_count],
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            next_index: 1,
            paused: false,
            events: Vec::new(),
        }
    }

    pub fn flags(&self, cpu: usize) -> DebugFlags {
        self.flags.get(cpu).copied().unwrap_or_default()
    }

    fn check_cpu(&self, cpu: usize, op: &str) -> bool {
        let ok = cpu < self.flags.len();
        if !ok {
            tracing::error!(cpu, "{op}: cpu index out of range");
        }
        ok
    }

    fn refresh(&mut self, cpu: usize) {
        let Some(flags) = self.flags.get_mut(cpu) else {
            return;
        };
        let keep = *flags & DebugFlags::TRACE;
        let mut next = keep;
        if self.breakpoints.iter().any(|bp| bp.cpu == cpu && bp.enabled) {
            next |= DebugFlags::BREAKPOINTS;
        }
        for wp in self.watchpoints.iter().filter(|wp| wp.cpu == cpu && wp.enabled) {
            if wp.kind.reads() {
                next |= DebugFlags::WATCH_READ;
            }
            if wp.kind.writes() {
                next |= DebugFlags::WATCH_WRITE;
            }
        }
        if self.steps[cpu].is_some() {
            next |= DebugFlags::STEP;
        }
        *flags = next;
    }

    fn take_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Add a breakpoint. Returns its index, or 0 if `cpu` does not exist.
    pub fn set_breakpoint(&mut self, cpu: usize, address: u32, condition: Option<Condition>, action: Option<&str>) -> usize {
        if !self.check_cpu(cpu, "set_breakpoint") {
            return 0;
        }
        let index = self.take_index();
        self.breakpoints.insert(
            0,
            Breakpoint {
                index,
                cpu,
                address,
                enabled: true,
                hits: 0,
                action: action.map(str::to_string),
                condition,
            },
        );
        self.refresh(cpu);
        index
    }

    pub fn clear_breakpoint(&mut self, index: usize) -> bool {
        let Some(pos) = self.breakpoints.iter().position(|bp| bp.index == index) else {
            tracing::error!(index, "clear_breakpoint: no such breakpoint");
            return false;
        };
        let bp = self.breakpoints.remove(pos);
        self.refresh(bp.cpu);
        true
    }

    pub fn enable_breakpoint(&mut self, index: usize, enable: bool) -> bool {
        let Some(bp) = self.breakpoints.iter_mut().find(|bp| bp.index == index) else {
            tracing::error!(index, "enable_breakpoint: no such breakpoint");
            return false;
        };
        bp.enabled = enable;
        let cpu = bp.cpu;
        self.refresh(cpu);
        true
    }

    /// Breakpoints, newest first.
    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    /// Watch an inclusive byte address range. Returns the index, or 0 if
    /// `cpu` does not exist.
    #[allow(clippy::too_many_arguments)]
    pub fn set_watchpoint(
        &mut self,
        cpu: usize,
        space: SpaceKind,
        kind: WatchKind,
        start: u32,
        end: u32,
        condition: Option<Condition>,
        action: Option<&str>,
    ) -> usize {
        if !self.check_cpu(cpu, "set_watchpoint") {
            return 0;
        }
        let index = self.take_index();
        self.watchpoints.insert(
            0,
            Watchpoint {
                index,
                cpu,
                space,
                kind,
                start: start.min(end),
                end: start.max(end),
                enabled: true,
                hits: 0,
                action: action.map(str::to_string),
                condition,
            },
        );
        self.refresh(cpu);
        index
    }

    pub fn clear_watchpoint(&mut self, index: usize) -> bool {
        let Some(pos) = self.watchpoints.iter().position(|wp| wp.index == index) else {
            tracing::error!(index, "clear_watchpoint: no such watchpoint");
            return false;
        };
        let wp = self.watchpoints.remove(pos);
        self.refresh(wp.cpu);
        true
    }

    pub fn enable_watchpoint(&mut self, index: usize, enable: bool) -> bool {
        let Some(wp) = self.watchpoints.iter_mut().find(|wp| wp.index == index) else {
            tracing::error!(index, "enable_watchpoint: no such watchpoint");
            return false;
        };
        wp.enabled = enable;
        let cpu = wp.cpu;
        self.refresh(cpu);
        true
    }

    /// Watchpoints, newest first.
    pub fn watchpoints(&self) -> impl Iterator<Item = &Watchpoint> {
        self.watchpoints.iter()
    }

    /// Let `cpu` run `count` instructions, then stop. Resumes the machine.
    pub fn step(&mut self, cpu: usize, count: u32) {
        if !self.check_cpu(cpu, "step") {
            return;
        }
        self.steps[cpu] = Some(count);
        self.refresh(cpu);
        self.paused = false;
    }

    pub fn set_trace(&mut self, cpu: usize, enable: bool) {
        if !self.check_cpu(cpu, "set_trace") {
            return;
        }
        self.flags[cpu].set(DebugFlags::TRACE, enable);
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Hits recorded since the last call.
    pub fn take_events(&mut self) -> Vec<DebugEvent> {
        std::mem::take(&mut self.events)
    }

    fn hit(&mut self, event: DebugEvent) {
        tracing::debug!(?event, "debugger stop");
        self.events.push(event);
        self.paused = true;
    }

    /// Instruction hook, called before `cpu` executes the instruction at
    /// `pc`. Returns true if execution should stop.
    pub fn on_instruction(&mut self, cpu: usize, pc: u32) -> bool {
        let flags = self.flags(cpu);
        if flags.is_empty() {
            return false;
        }
        if flags.contains(DebugFlags::TRACE) {
            tracing::trace!(cpu, pc = format_args!("{pc:#x}"), "instruction");
        }
        if flags.contains(DebugFlags::STEP) {
            match self.steps[cpu] {
                Some(0) => {
                    self.steps[cpu] = None;
                    self.refresh(cpu);
                    self.hit(DebugEvent::Step { cpu, pc });
                    return true;
                }
                Some(left) => self.steps[cpu] = Some(left - 1),
                None => {}
            }
        }
        if !flags.contains(DebugFlags::BREAKPOINTS) {
            return false;
        }
        let mut event = None;
        for bp in self.breakpoints.iter_mut() {
            if bp.cpu != cpu || !bp.enabled || bp.address != pc {
                continue;
            }
            let candidate = DebugEvent::Breakpoint {
                index: bp.index,
                cpu,
                pc,
                action: bp.action.clone(),
            };
            if passes(&bp.condition, &candidate) {
                bp.hits += 1;
                event = Some(candidate);
                break;
            }
        }
        match event {
            Some(event) => {
                self.hit(event);
                true
            }
            None => false,
        }
    }

    fn on_access(&mut self, cpu: usize, space: SpaceKind, addr: u32, data: Option<u64>, mask: u64) -> bool {
        let last = addr.wrapping_add(mask_bytes(mask).max(1) - 1);
        let mut event = None;
        for wp in self.watchpoints.iter_mut() {
            let kind_matches = if data.is_some() { wp.kind.writes() } else { wp.kind.reads() };
            if wp.cpu != cpu || wp.space != space || !wp.enabled || !kind_matches {
                continue;
            }
            if last < wp.start || addr > wp.end {
                continue;
            }
            let candidate = DebugEvent::Watchpoint {
                index: wp.index,
                cpu,
                space,
                addr,
                data,
                action: wp.action.clone(),
            };
            if passes(&wp.condition, &candidate) {
                wp.hits += 1;
                event = Some(candidate);
                break;
            }
        }
        match event {
            Some(event) => {
                self.hit(event);
                true
            }
            None => false,
        }
    }

    pub fn on_read(&mut self, cpu: usize, space: SpaceKind, addr: u32, mask: u64) -> bool {
        self.flags(cpu).contains(DebugFlags::WATCH_READ) && self.on_access(cpu, space, addr, None, mask)
    }

    pub fn on_write(&mut self, cpu: usize, space: SpaceKind, addr: u32, data: u64, mask: u64) -> bool {
        self.flags(cpu).contains(DebugFlags::WATCH_WRITE) && self.on_access(cpu, space, addr, Some(data), mask)
    }
}

impl MachineBus<'_> {
    fn debug_stop(&mut self) {
        if self.scheduler.active_cpu().is_some() {
            self.scheduler.abort_timeslice();
        }
    }

    pub(crate) fn debug_read(&mut self, kind: SpaceKind, addr: u32, mask: u64) {
        if self.debugger.on_read(self.cpu, kind, addr, mask) {
            self.debug_stop();
        }
    }

    pub(crate) fn debug_write(&mut self, kind: SpaceKind, addr: u32, data: u64, mask: u64) {
        if self.debugger.on_write(self.cpu, kind, addr, data, mask) {
            self.debug_stop();
        }
    }

    /// Instruction hook for cores; call before executing the instruction at
    /// `pc`.
    pub fn debug_hook(&mut self, pc: u32) {
        if self.debugger.on_instruction(self.cpu, pc) {
            self.debug_stop();
        }
    }

    pub fn debugger(&mut self) -> &mut Debugger {
        &mut *self.debugger
    }
}
