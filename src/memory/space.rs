//! Address spaces
//!
//! Every CPU owns up to three spaces. A space keeps one dispatch table and
//! one handler table per direction, all indexed by byte address.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::config::AddressSpaceConfig;
use crate::error::{ConfigError, Result};
use crate::memory::handler::{HandlerEntry, HandlerRange, HandlerTable, ReadHandler, WriteHandler, STATIC_UNMAP};
use crate::memory::region::RegionId;
use crate::memory::table::AddressTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpaceKind {
    Program,
    Data,
    Io,
}

impl SpaceKind {
    pub const ALL: [SpaceKind; 3] = [SpaceKind::Program, SpaceKind::Data, SpaceKind::Io];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

/// Direction of an access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// An address range to install, in native addresses of the space.
///
/// `mask` folds addresses before they reach the handler (0 keeps the full
/// space). Every combination of the `mirror` bits maps to the same handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: u32,
    pub end: u32,
    pub mask: u32,
    pub mirror: u32,
}

impl Mapping {
    pub fn new(start: u32, end: u32) -> Self {
        Mapping {
            start,
            end,
            mask: 0,
            mirror: 0,
        }
    }

    pub fn mirror(mut self, mirror: u32) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }
}

/// The per-access parameters of a space.
#[derive(Clone, Copy, Debug)]
pub struct SpaceInfo {
    pub cpu: usize,
    pub kind: SpaceKind,
    /// Native data width in bytes.
    pub width: u32,
    pub endianness: Endianness,
    pub byte_mask: u32,
    pub unmap: u64,
    pub log_unmapped: bool,
}

pub struct AddressSpace {
    info: SpaceInfo,
    config: AddressSpaceConfig,
    base_region: Option<RegionId>,
    pub(crate) read_table: AddressTable,
    pub(crate) write_table: AddressTable,
    pub(crate) read_handlers: HandlerTable<dyn ReadHandler>,
    pub(crate) write_handlers: HandlerTable<dyn WriteHandler>,
}

#[inline]
pub(crate) fn size_mask(size: u32) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * size)) - 1
    }
}

impl AddressSpace {
    pub fn new(cpu: usize, config: &AddressSpaceConfig) -> Self {
        let bits = config.byte_addr_bits().clamp(1, 32) as u8;
        let byte_mask = if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 };
        let width = config.data_bits as u32 / 8;
        let info = SpaceInfo {
            cpu,
            kind: config.kind,
            width,
            endianness: config.endianness,
            byte_mask,
            unmap: config.unmap_value.unwrap_or(u64::MAX) & size_mask(width),
            log_unmapped: config.log_unmapped,
        };
        AddressSpace {
            info,
            config: config.clone(),
            base_region: None,
            read_table: AddressTable::new(bits, STATIC_UNMAP),
            write_table: AddressTable::new(bits, STATIC_UNMAP),
            read_handlers: HandlerTable::new(),
            write_handlers: HandlerTable::new(),
        }
    }

    #[inline]
    pub fn info(&self) -> SpaceInfo {
        self.info
    }

    pub fn config(&self) -> &AddressSpaceConfig {
        &self.config
    }

    pub fn kind(&self) -> SpaceKind {
        self.info.kind
    }

    pub fn base_region(&self) -> Option<RegionId> {
        self.base_region
    }

    pub(crate) fn set_base_region(&mut self, region: RegionId) {
        self.base_region = Some(region);
    }

    pub fn set_log_unmapped(&mut self, enable: bool) {
        self.info.log_unmapped = enable;
        self.config.log_unmapped = enable;
    }

    /// First byte of a native address.
    fn byte_start(&self, addr: u32) -> u32 {
        let shift = self.config.addr_shift;
        let byte = if shift < 0 {
            (addr as u64) << (-shift) as u32
        } else {
            (addr as u64) >> shift as u32
        };
        byte as u32 & self.info.byte_mask
    }

    /// Last byte of a native address.
    fn byte_end(&self, addr: u32) -> u32 {
        let shift = self.config.addr_shift;
        let byte = if shift < 0 {
            ((addr as u64 + 1) << (-shift) as u32) - 1
        } else {
            (addr as u64) >> shift as u32
        };
        byte as u32 & self.info.byte_mask
    }

    /// Convert a native mapping to the byte range stored in the handler
    /// table. Mirror bits are stripped from both ends.
    pub fn normalize(&self, mapping: Mapping) -> Result<HandlerRange> {
        let invalid = ConfigError::InvalidRange {
            cpu: self.info.cpu,
            space: self.info.kind,
            start: mapping.start,
            end: mapping.end,
        };
        if mapping.start > mapping.end {
            return Err(invalid);
        }
        let mirror = self.byte_start(mapping.mirror);
        let start = self.byte_start(mapping.start) & !mirror;
        let end = self.byte_end(mapping.end) & !mirror;
        if start > end {
            return Err(invalid);
        }
        let mask = if mapping.mask == 0 {
            self.info.byte_mask
        } else {
            self.byte_end(mapping.mask)
        };
        Ok(HandlerRange { start, end, mask, mirror })
    }

    pub(crate) fn table_mut(&mut self, access: Access) -> &mut AddressTable {
        match access {
            Access::Read => &mut self.read_table,
            Access::Write => &mut self.write_table,
        }
    }

    pub fn table(&self, access: Access) -> &AddressTable {
        match access {
            Access::Read => &self.read_table,
            Access::Write => &self.write_table,
        }
    }

    /// Handler index an access at `addr` dispatches to.
    #[inline]
    pub fn resolve(&self, access: Access, addr: u32) -> u8 {
        self.table(access).resolve(addr & self.info.byte_mask)
    }

    /// Slot for a dynamic read handler; slots the read table no longer
    /// references are reclaimed when the pool is full.
    pub(crate) fn add_read_handler(&mut self, handler: &Rc<dyn ReadHandler>, name: &str, range: HandlerRange) -> Option<u8> {
        let table = &self.read_table;
        self.read_handlers.find_or_insert(handler, name, range, || {
            let mut used = [false; 256];
            table.mark_referenced(&mut used);
            used
        })
    }

    pub(crate) fn add_write_handler(&mut self, handler: &Rc<dyn WriteHandler>, name: &str, range: HandlerRange) -> Option<u8> {
        let table = &self.write_table;
        self.write_handlers.find_or_insert(handler, name, range, || {
            let mut used = [false; 256];
            table.mark_referenced(&mut used);
            used
        })
    }

    pub(crate) fn set_bank_range(&mut self, bank: usize, range: HandlerRange) {
        self.read_handlers.set_bank_range(bank, range);
        self.write_handlers.set_bank_range(bank, range);
    }

    #[inline]
    pub fn read_handler_at(&self, addr: u32) -> &HandlerEntry<dyn ReadHandler> {
        self.read_handlers.get(self.resolve(Access::Read, addr))
    }

    #[inline]
    pub fn write_handler_at(&self, addr: u32) -> &HandlerEntry<dyn WriteHandler> {
        self.write_handlers.get(self.resolve(Access::Write, addr))
    }
}

/// Native-word access of one space, used by the sized accessors.
pub(crate) trait NativeBus {
    fn read_native(&mut self, addr: u32, mem_mask: u64) -> u64;
    fn write_native(&mut self, addr: u32, data: u64, mem_mask: u64);
}

/// Bit position of a `size`-byte value at `offset` within a native word.
#[inline]
fn lane_shift(offset: u32, size: u32, width: u32, endianness: Endianness) -> u32 {
    match endianness {
        Endianness::Little => 8 * offset,
        Endianness::Big => 8 * (width - size - offset),
    }
}

/// Bit position of byte `index` of a `size`-byte value.
#[inline]
pub(crate) fn byte_shift(index: u32, size: u32, endianness: Endianness) -> u32 {
    match endianness {
        Endianness::Little => 8 * index,
        Endianness::Big => 8 * (size - 1 - index),
    }
}

/// Read `size` bytes at byte address `addr`. Values that fit in one native
/// word become a single lane-masked access; anything straddling a word is
/// assembled from byte accesses.
pub(crate) fn read_sized(bus: &mut impl NativeBus, width: u32, endianness: Endianness, addr: u32, size: u32) -> u64 {
    let offset = addr & (width - 1);
    if offset + size <= width {
        let shift = lane_shift(offset, size, width, endianness);
        let mem_mask = size_mask(size) << shift;
        return (bus.read_native(addr - offset, mem_mask) & mem_mask) >> shift;
    }
    (0..size).fold(0, |value, i| {
        let byte = read_sized(bus, width, endianness, addr.wrapping_add(i), 1);
        value | byte << byte_shift(i, size, endianness)
    })
}

pub(crate) fn write_sized(bus: &mut impl NativeBus, width: u32, endianness: Endianness, addr: u32, size: u32, data: u64) {
    let offset = addr & (width - 1);
    if offset + size <= width {
        let shift = lane_shift(offset, size, width, endianness);
        let mem_mask = size_mask(size) << shift;
        bus.write_native(addr - offset, (data << shift) & mem_mask, mem_mask);
        return;
    }
    for i in 0..size {
        let byte = (data >> byte_shift(i, size, endianness)) & 0xff;
        write_sized(bus, width, endianness, addr.wrapping_add(i), 1, byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte-addressed backing store that records every native access.
    struct Words {
        width: u32,
        endianness: Endianness,
        bytes: Vec<u8>,
        log: Vec<(u32, u64)>,
    }

    impl Words {
        fn new(width: u32, endianness: Endianness) -> Self {
            Words {
                width,
                endianness,
                bytes: (0..32).collect(),
                log: Vec::new(),
            }
        }
    }

    impl NativeBus for Words {
        fn read_native(&mut self, addr: u32, mem_mask: u64) -> u64 {
            assert_eq!(addr % self.width, 0);
            self.log.push((addr, mem_mask));
            (0..self.width).fold(0, |value, k| {
                value | (self.bytes[(addr + k) as usize] as u64) << byte_shift(k, self.width, self.endianness)
            })
        }

        fn write_native(&mut self, addr: u32, data: u64, mem_mask: u64) {
            self.log.push((addr, mem_mask));
            for k in 0..self.width {
                let shift = byte_shift(k, self.width, self.endianness);
                if (mem_mask >> shift) & 0xff != 0 {
                    self.bytes[(addr + k) as usize] = (data >> shift) as u8;
                }
            }
        }
    }

    #[test]
    fn test_little_endian_lanes() {
        let mut bus = Words::new(4, Endianness::Little);
        assert_eq!(read_sized(&mut bus, 4, Endianness::Little, 5, 1), 5);
        assert_eq!(bus.log, vec![(4, 0x0000_ff00)]);
        assert_eq!(read_sized(&mut bus, 4, Endianness::Little, 6, 2), 0x0706);
        assert_eq!(read_sized(&mut bus, 4, Endianness::Little, 8, 4), 0x0b0a_0908);
    }

    #[test]
    fn test_big_endian_lanes() {
        let mut bus = Words::new(2, Endianness::Big);
        assert_eq!(read_sized(&mut bus, 2, Endianness::Big, 4, 1), 4);
        assert_eq!(bus.log, vec![(4, 0xff00)]);
        assert_eq!(read_sized(&mut bus, 2, Endianness::Big, 4, 2), 0x0405);
        // wider than the bus: two native words, most significant first
        assert_eq!(read_sized(&mut bus, 2, Endianness::Big, 4, 4), 0x0405_0607);
    }

    #[test]
    fn test_straddling_access_splits_into_bytes() {
        let mut bus = Words::new(4, Endianness::Little);
        assert_eq!(read_sized(&mut bus, 4, Endianness::Little, 3, 2), 0x0403);
        assert_eq!(bus.log, vec![(0, 0xff00_0000), (4, 0x0000_00ff)]);

        bus.log.clear();
        write_sized(&mut bus, 4, Endianness::Little, 3, 2, 0xbbaa);
        assert_eq!(bus.bytes[3..5], [0xaa, 0xbb]);
        assert_eq!(bus.log.len(), 2);
    }

    #[test]
    fn test_sub_word_write_touches_only_its_lanes() {
        let mut bus = Words::new(4, Endianness::Big);
        write_sized(&mut bus, 4, Endianness::Big, 9, 1, 0xee);
        assert_eq!(bus.log, vec![(8, 0x00ff_0000)]);
        assert_eq!(bus.bytes[8..12], [8, 0xee, 10, 11]);
    }

    #[test]
    fn test_normalize_strips_mirror_and_shifts() {
        let config = AddressSpaceConfig::new(SpaceKind::Program, 16, 8);
        let space = AddressSpace::new(0, &config);
        let range = space.normalize(Mapping::new(0x4000, 0x4fff).mirror(0x1000)).unwrap();
        assert_eq!((range.start, range.end, range.mask, range.mirror), (0x4000, 0x4fff, 0xffff, 0x1000));
        assert!(space.normalize(Mapping::new(0x10, 0x0f)).is_err());

        // word-addressed bus: native address n covers bytes 2n and 2n+1
        let config = AddressSpaceConfig::new(SpaceKind::Program, 16, 16).with_shift(-1);
        let space = AddressSpace::new(0, &config);
        let range = space.normalize(Mapping::new(0x100, 0x1ff).mask(0xff)).unwrap();
        assert_eq!((range.start, range.end, range.mask), (0x200, 0x3ff, 0x1ff));
        assert_eq!(space.info().byte_mask, 0x1ffff);
    }

    #[test]
    fn test_unmap_value_defaults_to_all_ones() {
        let space = AddressSpace::new(0, &AddressSpaceConfig::new(SpaceKind::Io, 8, 16));
        assert_eq!(space.info().unmap, 0xffff);
        let space = AddressSpace::new(0, &AddressSpaceConfig::new(SpaceKind::Io, 8, 8).with_unmap_value(0));
        assert_eq!(space.info().unmap, 0);
        assert_eq!(space.resolve(Access::Read, 0x12), STATIC_UNMAP);
    }
}
