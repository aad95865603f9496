//! Two-level address lookup table
//!
//! A byte address splits into a level-1 index (high bits) and a level-2
//! index (low bits). Level-1 entries below [`SUBTABLE_BASE`] are handler
//! indices that cover their whole slot; larger values select a level-2
//! subtable holding one handler index per byte.
//!
//! Subtables are reference counted: several level-1 slots may share one, and
//! a shared subtable is copied before it is modified. When the subtable pool
//! runs dry, uniform subtables are folded back into their level-1 entries and
//! subtables with identical contents are merged.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// First level-1 value that refers to a subtable.
pub const SUBTABLE_BASE: u8 = 192;

/// Number of level-2 subtables per table.
pub const SUBTABLE_COUNT: usize = 256 - SUBTABLE_BASE as usize;

/// Upper bound on the level-1 index width.
pub const MAX_LEVEL1_BITS: u8 = 18;

const MIN_LEVEL2_BITS: u8 = 4;

/// Raised when no subtable can be freed for a modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

#[derive(Clone)]
struct Subtable {
    entries: Vec<u8>,
    usecount: u32,
}

#[derive(Clone)]
pub struct AddressTable {
    level1_bits: u8,
    level2_bits: u8,
    level1: Vec<u8>,
    subtables: Vec<Subtable>,
}

/// Iterate every subset of the bits in `mask`, starting with 0.
fn bit_subsets(mask: u32) -> impl Iterator<Item = u32> {
    let mut next = Some(0u32);
    std::iter::from_fn(move || {
        let current = next?;
        let following = current.wrapping_sub(mask) & mask;
        next = if following == 0 { None } else { Some(following) };
        Some(current)
    })
}

impl AddressTable {
    /// A table covering `addr_bits` bits of byte address, filled with
    /// `fill`.
    pub fn new(addr_bits: u8, fill: u8) -> Self {
        let level1_bits = addr_bits.saturating_sub(MIN_LEVEL2_BITS).min(MAX_LEVEL1_BITS);
        let level2_bits = addr_bits - level1_bits;
        let subtable = Subtable {
            entries: vec![fill; 1 << level2_bits],
            usecount: 0,
        };
        AddressTable {
            level1_bits,
            level2_bits,
            level1: vec![fill; 1 << level1_bits],
            subtables: vec![subtable; SUBTABLE_COUNT],
        }
    }

    pub fn level1_bits(&self) -> u8 {
        self.level1_bits
    }

    pub fn level2_bits(&self) -> u8 {
        self.level2_bits
    }

    #[inline]
    fn level2_mask(&self) -> u32 {
        (1u32 << self.level2_bits) - 1
    }

    /// Handler index of a (masked) byte address.
    #[inline]
    pub fn resolve(&self, addr: u32) -> u8 {
        let entry = self.level1[(addr >> self.level2_bits) as usize];
        if entry < SUBTABLE_BASE {
            entry
        } else {
            let sub = &self.subtables[(entry - SUBTABLE_BASE) as usize];
            sub.entries[(addr & self.level2_mask()) as usize]
        }
    }

    /// Raw level-1 entry covering `addr`.
    pub fn level1_entry(&self, addr: u32) -> u8 {
        self.level1[(addr >> self.level2_bits) as usize]
    }

    pub fn subtables_in_use(&self) -> usize {
        self.subtables.iter().filter(|sub| sub.usecount > 0).count()
    }

    /// Map `entry` over `start..=end` and every mirror image of it.
    /// `start` and `end` must not contain mirror bits.
    pub fn populate(&mut self, start: u32, end: u32, mirror: u32, entry: u8) -> Result<(), TableFull> {
        let l2mask = self.level2_mask();
        let low_mirror = mirror & l2mask;
        let high_mirror = mirror & !l2mask;
        let single_slot = (start >> self.level2_bits) == ((end | low_mirror) >> self.level2_bits);

        // (level-1 value before, after) of the last populated slot
        let mut previous: Option<(u8, u8)> = None;
        for high in bit_subsets(high_mirror) {
            let index = ((start | high) >> self.level2_bits) as usize;
            if let Some((before, after)) = previous {
                if single_slot && self.level1[index] == before {
                    self.set_level1(index, after);
                    continue;
                }
            }
            let before = self.level1[index];
            for low in bit_subsets(low_mirror) {
                self.populate_range(start | high | low, end | high | low, entry)?;
            }
            if single_slot {
                previous = Some((before, self.level1[index]));
            }
        }
        Ok(())
    }

    fn populate_range(&mut self, start: u32, end: u32, entry: u8) -> Result<(), TableFull> {
        let l2mask = self.level2_mask();
        let l1start = (start >> self.level2_bits) as usize;
        let l1stop = (end >> self.level2_bits) as usize;
        let l2start = (start & l2mask) as usize;
        let l2stop = (end & l2mask) as usize;

        if l1start == l1stop {
            if l2start == 0 && l2stop == l2mask as usize {
                self.set_level1(l1start, entry);
            } else {
                self.fill_subtable(l1start, l2start, l2stop, entry)?;
            }
            return Ok(());
        }

        let mut first = l1start;
        let mut last = l1stop;
        if l2start != 0 {
            self.fill_subtable(l1start, l2start, l2mask as usize, entry)?;
            first += 1;
        }
        if l2stop != l2mask as usize {
            self.fill_subtable(l1stop, 0, l2stop, entry)?;
            last -= 1;
        }
        for index in first..=last {
            self.set_level1(index, entry);
        }
        Ok(())
    }

    fn fill_subtable(&mut self, index: usize, from: usize, to: usize, entry: u8) -> Result<(), TableFull> {
        let sub = self.subtable_open(index)?;
        self.subtables[sub].entries[from..=to].fill(entry);
        Ok(())
    }

    fn set_level1(&mut self, index: usize, value: u8) {
        let old = self.level1[index];
        if value >= SUBTABLE_BASE {
            self.subtables[(value - SUBTABLE_BASE) as usize].usecount += 1;
        }
        if old >= SUBTABLE_BASE {
            self.release((old - SUBTABLE_BASE) as usize);
        }
        self.level1[index] = value;
    }

    fn release(&mut self, sub: usize) {
        let subtable = &mut self.subtables[sub];
        subtable.usecount = subtable.usecount.saturating_sub(1);
    }

    fn free_subtable(&self) -> Option<usize> {
        self.subtables.iter().position(|sub| sub.usecount == 0)
    }

    /// Make the slot at `index` point at a subtable it owns exclusively.
    fn subtable_open(&mut self, index: usize) -> Result<usize, TableFull> {
        loop {
            let value = self.level1[index];
            if value >= SUBTABLE_BASE {
                let sub = (value - SUBTABLE_BASE) as usize;
                if self.subtables[sub].usecount == 1 {
                    return Ok(sub);
                }
            }
            if let Some(fresh) = self.free_subtable() {
                if value >= SUBTABLE_BASE {
                    let shared = (value - SUBTABLE_BASE) as usize;
                    let entries = self.subtables[shared].entries.clone();
                    self.subtables[fresh].entries = entries;
                } else {
                    self.subtables[fresh].entries.fill(value);
                }
                self.set_level1(index, SUBTABLE_BASE + fresh as u8);
                return Ok(fresh);
            }
            if !self.merge() {
                return Err(TableFull);
            }
        }
    }

    /// Fold uniform subtables and merge identical ones. Returns true if at
    /// least one subtable was freed.
    pub fn merge(&mut self) -> bool {
        let in_use = self.subtables_in_use();

        for index in 0..self.level1.len() {
            let value = self.level1[index];
            if value < SUBTABLE_BASE {
                continue;
            }
            let entries = &self.subtables[(value - SUBTABLE_BASE) as usize].entries;
            let first = entries[0];
            if entries.iter().all(|&e| e == first) {
                self.set_level1(index, first);
            }
        }

        let mut by_hash: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut remap = [None; SUBTABLE_COUNT];
        for sub in 0..SUBTABLE_COUNT {
            if self.subtables[sub].usecount == 0 {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            self.subtables[sub].entries.hash(&mut hasher);
            let candidates = by_hash.entry(hasher.finish()).or_default();
            let original = candidates
                .iter()
                .copied()
                .find(|&c| self.subtables[c].entries == self.subtables[sub].entries);
            match original {
                Some(original) => remap[sub] = Some(original),
                None => candidates.push(sub),
            }
        }
        for index in 0..self.level1.len() {
            let value = self.level1[index];
            if value < SUBTABLE_BASE {
                continue;
            }
            if let Some(original) = remap[(value - SUBTABLE_BASE) as usize] {
                self.set_level1(index, SUBTABLE_BASE + original as u8);
            }
        }

        let after = self.subtables_in_use();
        tracing::debug!(before = in_use, after, "subtables merged");
        after < in_use
    }

    /// Largest range around `addr` that resolves to the same entry, limited
    /// to one level-1 slot when `addr` lies in a subtable.
    pub fn entry_run(&self, addr: u32) -> (u32, u32) {
        let l2mask = self.level2_mask();
        let index = (addr >> self.level2_bits) as usize;
        let value = self.level1[index];
        if value < SUBTABLE_BASE {
            let mut lo = index;
            while lo > 0 && self.level1[lo - 1] == value {
                lo -= 1;
            }
            let mut hi = index;
            while hi + 1 < self.level1.len() && self.level1[hi + 1] == value {
                hi += 1;
            }
            return ((lo as u32) << self.level2_bits, ((hi as u32) << self.level2_bits) | l2mask);
        }
        let entries = &self.subtables[(value - SUBTABLE_BASE) as usize].entries;
        let offset = (addr & l2mask) as usize;
        let entry = entries[offset];
        let mut lo = offset;
        while lo > 0 && entries[lo - 1] == entry {
            lo -= 1;
        }
        let mut hi = offset;
        while hi + 1 < entries.len() && entries[hi + 1] == entry {
            hi += 1;
        }
        let base = (index as u32) << self.level2_bits;
        (base | lo as u32, base | hi as u32)
    }

    /// Mark every handler index reachable from this table.
    pub fn mark_referenced(&self, used: &mut [bool; 256]) {
        for &value in &self.level1 {
            if value < SUBTABLE_BASE {
                used[value as usize] = true;
            }
        }
        for sub in self.subtables.iter().filter(|sub| sub.usecount > 0) {
            for &entry in &sub.entries {
                used[entry as usize] = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNMAP: u8 = 36;

    #[test]
    fn test_bit_subsets() {
        let subsets: Vec<u32> = bit_subsets(0b1010).collect();
        assert_eq!(subsets, vec![0b0000, 0b0010, 0b1000, 0b1010]);
        assert_eq!(bit_subsets(0).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_table_geometry() {
        let small = AddressTable::new(16, UNMAP);
        assert_eq!((small.level1_bits(), small.level2_bits()), (12, 4));
        let wide = AddressTable::new(32, UNMAP);
        assert_eq!((wide.level1_bits(), wide.level2_bits()), (18, 14));
        let tiny = AddressTable::new(3, UNMAP);
        assert_eq!((tiny.level1_bits(), tiny.level2_bits()), (0, 3));
        assert_eq!(tiny.resolve(7), UNMAP);
    }

    #[test]
    fn test_whole_slots_stay_direct() {
        let mut table = AddressTable::new(16, UNMAP);
        table.populate(0x4000, 0x4fff, 0, 40).unwrap();
        assert_eq!(table.subtables_in_use(), 0);
        assert_eq!(table.resolve(0x3fff), UNMAP);
        assert_eq!(table.resolve(0x4000), 40);
        assert_eq!(table.resolve(0x4fff), 40);
        assert_eq!(table.resolve(0x5000), UNMAP);
    }

    #[test]
    fn test_partial_slots_use_subtables() {
        let mut table = AddressTable::new(16, UNMAP);
        table.populate(0x1003, 0x1024, 0, 41).unwrap();
        assert_eq!(table.subtables_in_use(), 2);
        assert_eq!(table.resolve(0x1002), UNMAP);
        assert_eq!(table.resolve(0x1003), 41);
        assert_eq!(table.resolve(0x1010), 41);
        assert_eq!(table.resolve(0x1024), 41);
        assert_eq!(table.resolve(0x1025), UNMAP);
    }

    #[test]
    fn test_high_mirror_shares_subtable() {
        let mut table = AddressTable::new(16, UNMAP);
        table.populate(0x0002, 0x0005, 0xf000, 42).unwrap();
        // sixteen mirrored slots, one shared subtable
        assert_eq!(table.subtables_in_use(), 1);
        for high in 0..16u32 {
            let base = high << 12;
            assert_eq!(table.resolve(base | 0x0001), UNMAP);
            assert_eq!(table.resolve(base | 0x0002), 42);
            assert_eq!(table.resolve(base | 0x0005), 42);
        }
    }

    #[test]
    fn test_low_mirror() {
        let mut table = AddressTable::new(16, UNMAP);
        table.populate(0x0100, 0x0101, 0x0004, 43).unwrap();
        assert_eq!(table.resolve(0x0100), 43);
        assert_eq!(table.resolve(0x0104), 43);
        assert_eq!(table.resolve(0x0102), UNMAP);
    }

    #[test]
    fn test_shared_subtable_is_copied_on_write() {
        let mut table = AddressTable::new(16, UNMAP);
        table.populate(0x0000, 0x0003, 0x1000, 44).unwrap();
        assert_eq!(table.level1_entry(0x0000), table.level1_entry(0x1000));
        table.populate(0x1008, 0x1008, 0, 45).unwrap();
        assert_ne!(table.level1_entry(0x0000), table.level1_entry(0x1000));
        assert_eq!(table.resolve(0x0008), UNMAP);
        assert_eq!(table.resolve(0x1008), 45);
        assert_eq!(table.resolve(0x1003), 44);
    }

    #[test]
    fn test_merge_under_pressure() {
        let mut table = AddressTable::new(16, UNMAP);
        // more identical partial slots than there are subtables
        for slot in 0..200u32 {
            let base = slot << 4;
            table.populate(base, base + 7, 0, 46).unwrap();
        }
        assert!(table.subtables_in_use() <= SUBTABLE_COUNT);
        for slot in 0..200u32 {
            let base = slot << 4;
            assert_eq!(table.resolve(base), 46);
            assert_eq!(table.resolve(base + 7), 46);
            assert_eq!(table.resolve(base + 8), UNMAP);
        }
    }

    #[test]
    fn test_uniform_subtables_fold_back() {
        let mut table = AddressTable::new(16, UNMAP);
        table.populate(0x0000, 0x0007, 0, 47).unwrap();
        table.populate(0x0008, 0x000f, 0, 47).unwrap();
        assert_eq!(table.subtables_in_use(), 1);
        assert!(table.merge());
        assert_eq!(table.subtables_in_use(), 0);
        assert_eq!(table.level1_entry(0x0000), 47);
    }

    #[test]
    fn test_distinct_subtables_exhaust() {
        let mut table = AddressTable::new(16, UNMAP);
        for n in 0..SUBTABLE_COUNT as u32 {
            let base = n << 4;
            table.populate(base, base + 3, 0, 37 + n as u8).unwrap();
        }
        let base = (SUBTABLE_COUNT as u32) << 4;
        assert_eq!(table.populate(base, base + 3, 0, 150), Err(TableFull));
    }

    #[test]
    fn test_entry_run() {
        let mut table = AddressTable::new(16, UNMAP);
        table.populate(0x2000, 0x3fff, 0, 48).unwrap();
        table.populate(0x4002, 0x4005, 0, 49).unwrap();
        assert_eq!(table.entry_run(0x2345), (0x2000, 0x3fff));
        assert_eq!(table.entry_run(0x4003), (0x4002, 0x4005));
    }

    #[test]
    fn test_referenced_entries() {
        let mut table = AddressTable::new(16, UNMAP);
        table.populate(0x0001, 0x0001, 0, 50).unwrap();
        let mut used = [false; 256];
        table.mark_referenced(&mut used);
        assert!(used[UNMAP as usize]);
        assert!(used[50]);
        assert!(!used[51]);
    }
}
