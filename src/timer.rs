//! Timer queue
//!
//! Holds every scheduled callback of the machine and answers "when is the
//! next event". The queue never runs on its own: the scheduler runs CPUs up to
//! the next fire time, commits it with [`TimerQueue::set_global_time`], and
//! the machine then drains due timers with [`TimerQueue::pop_due`].
//!
//! Timers are ordered by absolute fire time; equal fire times fire in the
//! order they were scheduled. Popping one timer at a time lets a callback
//! re-schedule itself or any other timer between pops.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::error::TimerError;
use crate::scheduler::TriggerId;
use crate::time::VirtualTime;

/// Maximum number of simultaneously allocated timers.
pub const MAX_TIMERS: usize = 256;

/// What a timer does when it fires.
///
/// The set is closed so timer state stays serializable; drivers hook in
/// through [`TimerAction::Driver`] callbacks registered on the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerAction {
    /// Interleave boundary; fires the timeslice trigger.
    Timeslice,
    /// Interleave boost tick; only forces the scheduler to resynchronize.
    InterleaveBoost,
    /// One tick of the shared VBLANK pulse.
    VblankPulse,
    /// Stop point of a bounded run; nothing happens when it fires.
    RunLimit,
    /// End of the blanking period: screen update / vblank flag clear.
    ScreenUpdate,
    /// Free-running periodic interrupt of one CPU.
    TimedInterrupt(usize),
    /// Fire a scheduler trigger.
    Trigger(TriggerId),
    /// Deliver queued input-line changes to one CPU.
    InputLines(usize),
    /// Time-based watchdog expiry.
    Watchdog,
    /// End of an interleave boost period.
    BoostEnd,
    /// Driver callback registered with `Machine::register_timer_callback`.
    Driver(u32),
}

/// Handle to an allocated timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(u16);

impl TimerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A timer popped from the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiredTimer {
    pub id: TimerId,
    pub action: TimerAction,
    pub param: i32,
    pub fire_time: VirtualTime,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TimerSlot {
    allocated: bool,
    temporary: bool,
    enabled: bool,
    action: TimerAction,
    param: i32,
    period: VirtualTime,
    start: VirtualTime,
    expire: VirtualTime,
    seq: u64,
}

impl TimerSlot {
    fn free() -> Self {
        TimerSlot {
            allocated: false,
            temporary: false,
            enabled: false,
            action: TimerAction::Timeslice,
            param: 0,
            period: VirtualTime::ZERO,
            start: VirtualTime::ZERO,
            expire: VirtualTime::NEVER,
            seq: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    expire: VirtualTime,
    seq: u64,
    index: u16,
}

/// Sorted set of scheduled callbacks plus the global clock.
#[derive(Serialize, Deserialize)]
pub struct TimerQueue {
    slots: Vec<TimerSlot>,
    now: VirtualTime,
    next_seq: u64,
    #[serde(skip)]
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        TimerQueue::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            slots: Vec::with_capacity(MAX_TIMERS),
            now: VirtualTime::ZERO,
            next_seq: 0,
            heap: BinaryHeap::with_capacity(MAX_TIMERS),
        }
    }

    /// Allocate a disabled timer.
    pub fn allocate(&mut self, action: TimerAction) -> Result<TimerId, TimerError> {
        self.allocate_slot(action, false)
    }

    fn allocate_slot(&mut self, action: TimerAction, temporary: bool) -> Result<TimerId, TimerError> {
        let index = match self.slots.iter().position(|slot| !slot.allocated) {
            Some(index) => index,
            None if self.slots.len() < MAX_TIMERS => {
                self.slots.push(TimerSlot::free());
                self.slots.len() - 1
            }
            None => return Err(TimerError::PoolExhausted { capacity: MAX_TIMERS }),
        };
        let slot = &mut self.slots[index];
        *slot = TimerSlot::free();
        slot.allocated = true;
        slot.temporary = temporary;
        slot.action = action;
        Ok(TimerId(index as u16))
    }

    /// Release a timer back to the pool.
    pub fn free(&mut self, id: TimerId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            *slot = TimerSlot::free();
        }
    }

    /// (Re)schedule a timer to fire at `fire_at`. A zero `period` makes it
    /// one-shot; otherwise it re-arms at `fire_time + period` after firing.
    pub fn adjust(&mut self, id: TimerId, fire_at: VirtualTime, param: i32, period: VirtualTime) {
        let seq = self.next_seq;
        let now = self.now;
        let Some(slot) = self.slots.get_mut(id.index()).filter(|slot| slot.allocated) else {
            tracing::error!(timer = id.index(), "adjust on unallocated timer");
            return;
        };
        slot.param = param;
        slot.period = period;
        slot.start = now;
        slot.expire = fire_at;
        slot.seq = seq;
        slot.enabled = !fire_at.is_never();
        self.next_seq += 1;
        if slot.enabled {
            self.heap.push(Reverse(HeapEntry { expire: fire_at, seq, index: id.0 }));
            self.compact_heap();
        }
    }

    /// Schedule a timer `delay` after the current global time.
    pub fn adjust_after(&mut self, id: TimerId, delay: VirtualTime, param: i32, period: VirtualTime) {
        let fire_at = self.now + delay;
        self.adjust(id, fire_at, param, period);
    }

    /// Schedule an auto-freed one-shot timer.
    pub fn set_temporary(&mut self, fire_at: VirtualTime, action: TimerAction, param: i32) -> Result<TimerId, TimerError> {
        let id = self.allocate_slot(action, true)?;
        self.adjust(id, fire_at, param, VirtualTime::ZERO);
        Ok(id)
    }

    /// Disable a timer without freeing it.
    pub fn remove(&mut self, id: TimerId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            slot.enabled = false;
            slot.expire = VirtualTime::NEVER;
            if slot.temporary {
                *slot = TimerSlot::free();
            }
        }
    }

    pub fn is_enabled(&self, id: TimerId) -> bool {
        self.slots.get(id.index()).map_or(false, |slot| slot.enabled)
    }

    pub fn param(&self, id: TimerId) -> i32 {
        self.slots.get(id.index()).map_or(0, |slot| slot.param)
    }

    pub fn fire_time(&self, id: TimerId) -> VirtualTime {
        match self.slots.get(id.index()) {
            Some(slot) if slot.enabled => slot.expire,
            _ => VirtualTime::NEVER,
        }
    }

    /// Time since the timer was last scheduled (or last fired, if periodic).
    pub fn elapsed(&self, id: TimerId) -> VirtualTime {
        match self.slots.get(id.index()) {
            Some(slot) if slot.allocated => self.now - slot.start,
            _ => VirtualTime::ZERO,
        }
    }

    pub fn remaining(&self, id: TimerId) -> VirtualTime {
        self.fire_time(id) - self.now
    }

    pub fn current_time(&self) -> VirtualTime {
        self.now
    }

    /// Commit a new global time. The global clock never moves backwards.
    pub fn set_global_time(&mut self, time: VirtualTime) {
        if time < self.now {
            tracing::error!(now = %self.now, requested = %time, "global time may not move backwards");
            return;
        }
        self.now = time;
    }

    /// Earliest fire time among all enabled timers, or `NEVER`.
    pub fn next_fire_time(&mut self) -> VirtualTime {
        while let Some(&Reverse(entry)) = self.heap.peek() {
            if self.is_live(&entry) {
                return entry.expire;
            }
            self.heap.pop();
        }
        VirtualTime::NEVER
    }

    pub fn time_until_next_fire(&mut self) -> VirtualTime {
        self.next_fire_time() - self.now
    }

    /// Pop the earliest timer whose fire time has arrived, re-arming it if
    /// periodic. Returns `None` once nothing is due.
    pub fn pop_due(&mut self) -> Option<FiredTimer> {
        loop {
            let Reverse(entry) = *self.heap.peek()?;
            if !self.is_live(&entry) {
                self.heap.pop();
                continue;
            }
            if entry.expire > self.now {
                return None;
            }
            self.heap.pop();

            let seq = self.next_seq;
            let slot = &mut self.slots[entry.index as usize];
            let fired = FiredTimer {
                id: TimerId(entry.index),
                action: slot.action,
                param: slot.param,
                fire_time: entry.expire,
            };
            if slot.period.is_zero() || slot.period.is_never() {
                slot.enabled = false;
                slot.expire = VirtualTime::NEVER;
                if slot.temporary {
                    *slot = TimerSlot::free();
                }
            } else {
                // re-arm from the scheduled fire time so periods never drift
                slot.start = entry.expire;
                slot.expire = entry.expire + slot.period;
                slot.seq = seq;
                self.next_seq += 1;
                let next = HeapEntry { expire: slot.expire, seq, index: entry.index };
                self.heap.push(Reverse(next));
            }
            tracing::trace!(timer = entry.index, action = ?fired.action, time = %fired.fire_time, "timer fired");
            return Some(fired);
        }
    }

    /// Disable every timer and drop temporaries; allocations survive.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            if slot.temporary {
                *slot = TimerSlot::free();
            } else {
                slot.enabled = false;
                slot.expire = VirtualTime::NEVER;
            }
        }
        self.heap.clear();
    }

    pub fn allocated_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.allocated).count()
    }

    /// Rebuild the ordering heap after deserialization.
    pub fn rebuild(&mut self) {
        self.heap = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.enabled)
            .map(|(index, slot)| Reverse(HeapEntry { expire: slot.expire, seq: slot.seq, index: index as u16 }))
            .collect();
    }

    fn is_live(&self, entry: &HeapEntry) -> bool {
        let slot = &self.slots[entry.index as usize];
        slot.enabled && slot.seq == entry.seq
    }

    fn compact_heap(&mut self) {
        if self.heap.len() > MAX_TIMERS * 4 {
            self.rebuild();
        }
    }
}
