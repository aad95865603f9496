//! Dispatch handlers
//!
//! Every dispatch-table entry is an index into a per-space handler table.
//! The low indices have fixed meanings (banks, ROM, RAM, NOP, unmapped);
//! the rest are allocated to driver callbacks as they are installed.

use std::fmt;
use std::rc::Rc;

use crate::machine::MachineBus;
use crate::memory::bank::MAX_BANKS;
use crate::memory::table::SUBTABLE_BASE;

pub const STATIC_INVALID: u8 = 0;
pub const STATIC_BANK_FIRST: u8 = 1;
pub const STATIC_BANK_LAST: u8 = MAX_BANKS as u8;
pub const STATIC_ROM: u8 = STATIC_BANK_LAST + 1;
pub const STATIC_RAM: u8 = STATIC_ROM + 1;
pub const STATIC_NOP: u8 = STATIC_RAM + 1;
pub const STATIC_UNMAP: u8 = STATIC_NOP + 1;
pub const DYNAMIC_FIRST: u8 = STATIC_UNMAP + 1;
/// Dynamic handlers share the index space with subtable references.
pub const DYNAMIC_LAST: u8 = SUBTABLE_BASE - 1;

/// A read callback. `offset` is the byte offset into the handler's range
/// with mirror bits removed; `mem_mask` has ones on the active data lanes.
pub trait ReadHandler {
    fn read(&self, bus: &mut MachineBus<'_>, offset: u32, mem_mask: u64) -> u64;
}

pub trait WriteHandler {
    fn write(&self, bus: &mut MachineBus<'_>, offset: u32, data: u64, mem_mask: u64);
}

impl<F> ReadHandler for F
where
    F: Fn(&mut MachineBus<'_>, u32, u64) -> u64,
{
    fn read(&self, bus: &mut MachineBus<'_>, offset: u32, mem_mask: u64) -> u64 {
        self(bus, offset, mem_mask)
    }
}

impl<F> WriteHandler for F
where
    F: Fn(&mut MachineBus<'_>, u32, u64, u64),
{
    fn write(&self, bus: &mut MachineBus<'_>, offset: u32, data: u64, mem_mask: u64) {
        self(bus, offset, data, mem_mask)
    }
}

/// Wrap a closure as a shareable read handler. Installing the same `Rc`
/// twice over the same range reuses one handler slot.
pub fn read_handler<F>(f: F) -> Rc<dyn ReadHandler>
where
    F: Fn(&mut MachineBus<'_>, u32, u64) -> u64 + 'static,
{
    Rc::new(f)
}

pub fn write_handler<F>(f: F) -> Rc<dyn WriteHandler>
where
    F: Fn(&mut MachineBus<'_>, u32, u64, u64) + 'static,
{
    Rc::new(f)
}

/// What a handler index means.
pub enum HandlerKind<H: ?Sized> {
    Invalid,
    Bank(usize),
    Rom,
    Ram,
    Nop,
    Unmap,
    Dynamic(Rc<H>),
}

impl<H: ?Sized> Clone for HandlerKind<H> {
    fn clone(&self) -> Self {
        match self {
            HandlerKind::Invalid => HandlerKind::Invalid,
            HandlerKind::Bank(bank) => HandlerKind::Bank(*bank),
            HandlerKind::Rom => HandlerKind::Rom,
            HandlerKind::Ram => HandlerKind::Ram,
            HandlerKind::Nop => HandlerKind::Nop,
            HandlerKind::Unmap => HandlerKind::Unmap,
            HandlerKind::Dynamic(handler) => HandlerKind::Dynamic(Rc::clone(handler)),
        }
    }
}

impl<H: ?Sized> fmt::Debug for HandlerKind<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Invalid => write!(f, "Invalid"),
            HandlerKind::Bank(bank) => write!(f, "Bank({bank})"),
            HandlerKind::Rom => write!(f, "Rom"),
            HandlerKind::Ram => write!(f, "Ram"),
            HandlerKind::Nop => write!(f, "Nop"),
            HandlerKind::Unmap => write!(f, "Unmap"),
            HandlerKind::Dynamic(_) => write!(f, "Dynamic"),
        }
    }
}

/// Byte range a handler was installed for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandlerRange {
    pub start: u32,
    pub end: u32,
    pub mask: u32,
    pub mirror: u32,
}

impl HandlerRange {
    /// Offset of `addr` within the range, mirror images folded.
    #[inline]
    pub fn offset(&self, addr: u32) -> u32 {
        (addr & !self.mirror).wrapping_sub(self.start) & self.mask
    }
}

pub struct HandlerEntry<H: ?Sized> {
    pub kind: HandlerKind<H>,
    pub name: String,
    pub range: HandlerRange,
}

impl<H: ?Sized> HandlerEntry<H> {
    fn new(kind: HandlerKind<H>, name: String) -> Self {
        HandlerEntry {
            kind,
            name,
            range: HandlerRange {
                start: 0,
                end: u32::MAX,
                mask: u32::MAX,
                mirror: 0,
            },
        }
    }
}

/// The 256-entry handler table of one space and direction.
pub struct HandlerTable<H: ?Sized> {
    entries: Vec<HandlerEntry<H>>,
}

impl<H: ?Sized> Default for HandlerTable<H> {
    fn default() -> Self {
        HandlerTable::new()
    }
}

impl<H: ?Sized> HandlerTable<H> {
    pub fn new() -> Self {
        let entries = (0..=255u8)
            .map(|index| match index {
                STATIC_BANK_FIRST..=STATIC_BANK_LAST => {
                    HandlerEntry::new(HandlerKind::Bank(index as usize), format!("bank{index}"))
                }
                STATIC_ROM => HandlerEntry::new(HandlerKind::Rom, "rom".to_string()),
                STATIC_RAM => HandlerEntry::new(HandlerKind::Ram, "ram".to_string()),
                STATIC_NOP => HandlerEntry::new(HandlerKind::Nop, "nop".to_string()),
                STATIC_UNMAP => HandlerEntry::new(HandlerKind::Unmap, "unmap".to_string()),
                _ => HandlerEntry::new(HandlerKind::Invalid, "invalid".to_string()),
            })
            .collect();
        HandlerTable { entries }
    }

    #[inline]
    pub fn get(&self, index: u8) -> &HandlerEntry<H> {
        &self.entries[index as usize]
    }

    /// Record the range a bank is mapped over, for offset computation.
    pub fn set_bank_range(&mut self, bank: usize, range: HandlerRange) {
        if let Some(entry) = self.entries.get_mut(bank) {
            entry.range = range;
        }
    }

    /// Slot for a dynamic handler, reusing an existing slot with the same
    /// handler and range. `referenced` is consulted only when the pool is
    /// full, to reclaim slots no table entry points at any more.
    pub fn find_or_insert(
        &mut self,
        handler: &Rc<H>,
        name: &str,
        range: HandlerRange,
        referenced: impl FnOnce() -> [bool; 256],
    ) -> Option<u8> {
        for index in DYNAMIC_FIRST..=DYNAMIC_LAST {
            let entry = &self.entries[index as usize];
            if let HandlerKind::Dynamic(existing) = &entry.kind {
                if Rc::ptr_eq(existing, handler) && entry.range == range {
                    return Some(index);
                }
            }
        }

        let index = match self.free_slot() {
            Some(index) => index,
            None => {
                let used = referenced();
                let mut reclaimed = 0;
                for index in DYNAMIC_FIRST..=DYNAMIC_LAST {
                    if !used[index as usize] {
                        self.entries[index as usize] = HandlerEntry::new(HandlerKind::Invalid, "invalid".to_string());
                        reclaimed += 1;
                    }
                }
                tracing::debug!(reclaimed, "unreferenced handler slots reclaimed");
                self.free_slot()?
            }
        };
        self.entries[index as usize] = HandlerEntry {
            kind: HandlerKind::Dynamic(Rc::clone(handler)),
            name: name.to_string(),
            range,
        };
        Some(index)
    }

    fn free_slot(&self) -> Option<u8> {
        (DYNAMIC_FIRST..=DYNAMIC_LAST).find(|&index| matches!(self.entries[index as usize].kind, HandlerKind::Invalid))
    }

    pub fn dynamic_count(&self) -> usize {
        (DYNAMIC_FIRST..=DYNAMIC_LAST)
            .filter(|&index| matches!(self.entries[index as usize].kind, HandlerKind::Dynamic(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u32, end: u32) -> HandlerRange {
        HandlerRange {
            start,
            end,
            mask: u32::MAX,
            mirror: 0,
        }
    }

    #[test]
    fn test_static_layout() {
        let table: HandlerTable<dyn ReadHandler> = HandlerTable::new();
        assert!(matches!(table.get(0).kind, HandlerKind::Invalid));
        assert!(matches!(table.get(1).kind, HandlerKind::Bank(1)));
        assert!(matches!(table.get(32).kind, HandlerKind::Bank(32)));
        assert!(matches!(table.get(STATIC_ROM).kind, HandlerKind::Rom));
        assert!(matches!(table.get(STATIC_RAM).kind, HandlerKind::Ram));
        assert!(matches!(table.get(STATIC_NOP).kind, HandlerKind::Nop));
        assert!(matches!(table.get(STATIC_UNMAP).kind, HandlerKind::Unmap));
        assert_eq!((STATIC_ROM, STATIC_UNMAP, DYNAMIC_FIRST, DYNAMIC_LAST), (33, 36, 37, 191));
    }

    #[test]
    fn test_offset_folds_mirrors() {
        let r = HandlerRange {
            start: 0x4000,
            end: 0x4fff,
            mask: 0xffff,
            mirror: 0x1000,
        };
        assert_eq!(r.offset(0x4123), 0x123);
        assert_eq!(r.offset(0x5123), 0x123);
    }

    #[test]
    fn test_same_handler_same_range_is_deduplicated() {
        let mut table: HandlerTable<dyn ReadHandler> = HandlerTable::new();
        let handler = read_handler(|_, _, _| 0);
        let other = read_handler(|_, _, _| 1);
        let a = table.find_or_insert(&handler, "a", range(0, 0xff), || [true; 256]).unwrap();
        let b = table.find_or_insert(&handler, "a", range(0, 0xff), || [true; 256]).unwrap();
        let c = table.find_or_insert(&handler, "a", range(0x100, 0x1ff), || [true; 256]).unwrap();
        let d = table.find_or_insert(&other, "b", range(0, 0xff), || [true; 256]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(table.dynamic_count(), 3);
    }

    #[test]
    fn test_full_pool_reclaims_unreferenced_slots() {
        let mut table: HandlerTable<dyn ReadHandler> = HandlerTable::new();
        let pool = (DYNAMIC_LAST - DYNAMIC_FIRST) as u32 + 1;
        let handler = read_handler(|_, _, _| 0);
        for n in 0..pool {
            table.find_or_insert(&handler, "h", range(n, n), || [true; 256]).unwrap();
        }
        assert_eq!(table.find_or_insert(&handler, "h", range(pool, pool), || [true; 256]), None);

        // only the first dynamic slot is still mapped somewhere
        let mut used = [false; 256];
        used[DYNAMIC_FIRST as usize] = true;
        let index = table.find_or_insert(&handler, "h", range(pool, pool), || used).unwrap();
        assert_eq!(index, DYNAMIC_FIRST + 1);
        assert_eq!(table.dynamic_count(), 2);
    }
}
