//! Memory dispatch engine
//!
//! Every CPU address space resolves a byte address to a handler index in
//! two table lookups. Handler indices either name storage directly (banks,
//! the space's base region) or a driver callback installed at configuration
//! time or live from a handler.
//!
//! Accessors take byte addresses; installation takes native addresses and
//! converts them with the space's address shift.

pub mod bank;
pub mod handler;
pub mod region;
pub mod space;
pub mod table;

use std::rc::Rc;

pub use bank::{BankBase, MAX_BANKS, MAX_BANK_ENTRIES, MAX_EXPLICIT_BANKS};
pub use handler::{read_handler, write_handler, HandlerEntry, HandlerKind, HandlerRange, ReadHandler, WriteHandler};
pub use region::{RegionId, Regions};
pub use space::{Access, AddressSpace, Endianness, Mapping, SpaceInfo, SpaceKind};

use crate::config::CpuConfig;
use crate::error::{ConfigError, Result, StateError};
use crate::machine::MachineBus;
use crate::snapshot::StateRegistry;
use bank::BankTable;
use space::{byte_shift, read_sized, size_mask, write_sized, NativeBus};

/// Decision of an opcode-base override.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpbaseDecision {
    /// Look the PC up as usual.
    Default,
    /// Fetch from this address instead of the PC.
    Redirect(u32),
    /// The override serves this fetch itself; fetches go through the normal
    /// read path and the override runs again on the next one.
    Handled,
}

/// Called when the PC leaves the cached opcode window.
pub type OpbaseOverride = Rc<dyn Fn(&mut MachineBus<'_>, u32) -> OpbaseDecision>;

#[derive(Clone, Copy, Debug)]
enum OpSource {
    Region { region: RegionId, base: usize, range: HandlerRange },
    ReadPath,
}

/// Cached translation of the PC window a CPU is executing from.
#[derive(Clone, Copy, Debug)]
pub struct OpcodeBase {
    valid: bool,
    min: u32,
    max: u32,
    /// Added to the PC before translation (redirected fetches).
    delta: u32,
    entry: u8,
    bank: Option<usize>,
    source: OpSource,
}

impl OpcodeBase {
    const INVALID: OpcodeBase = OpcodeBase {
        valid: false,
        min: 1,
        max: 0,
        delta: 0,
        entry: 0,
        bank: None,
        source: OpSource::ReadPath,
    };

    #[inline]
    pub fn contains(&self, pc: u32) -> bool {
        self.valid && pc >= self.min && pc <= self.max
    }

    pub fn window(&self) -> Option<(u32, u32)> {
        self.valid.then_some((self.min, self.max))
    }

    pub fn entry(&self) -> u8 {
        self.entry
    }
}

/// Where one native access goes.
pub(crate) enum Target<H: ?Sized> {
    Region { region: RegionId, offset: usize },
    Handler { handler: Rc<H>, offset: u32 },
    Nop,
    Unmapped,
}

pub struct Memory {
    spaces: Vec<[Option<AddressSpace>; 3]>,
    regions: Regions,
    banks: BankTable,
    opbase: Vec<OpcodeBase>,
    opbase_override: Vec<Option<OpbaseOverride>>,
    decrypted: Vec<Option<RegionId>>,
    /// Banks mapped for writes somewhere.
    writable_banks: Vec<bool>,
}

const STATE_TAG: &str = "memory";

impl Memory {
    pub fn new(cpus: &[CpuConfig]) -> Self {
        let spaces = cpus
            .iter()
            .enumerate()
            .map(|(cpu, config)| SpaceKind::ALL.map(|kind| config.space(kind).map(|space| AddressSpace::new(cpu, space))))
            .collect();
        Memory {
            spaces,
            regions: Regions::new(),
            banks: BankTable::new(),
            opbase: vec![OpcodeBase::INVALID; cpus.len()],
            opbase_override: vec![None; cpus.len()],
            decrypted: vec![None; cpus.len()],
            writable_banks: vec![false; MAX_BANKS + 1],
        }
    }

    pub fn space(&self, cpu: usize, kind: SpaceKind) -> Option<&AddressSpace> {
        self.spaces.get(cpu)?[kind.index()].as_ref()
    }

    #[inline]
    pub fn space_info(&self, cpu: usize, kind: SpaceKind) -> Option<SpaceInfo> {
        self.space(cpu, kind).map(AddressSpace::info)
    }

    fn space_mut(&mut self, cpu: usize, kind: SpaceKind) -> Result<&mut AddressSpace> {
        self.spaces
            .get_mut(cpu)
            .and_then(|spaces| spaces[kind.index()].as_mut())
            .ok_or(ConfigError::MissingSpace { cpu, space: kind })
    }

    pub fn regions(&self) -> &Regions {
        &self.regions
    }

    pub fn regions_mut(&mut self) -> &mut Regions {
        &mut self.regions
    }

    pub fn add_rom(&mut self, name: &str, data: Vec<u8>) -> Result<RegionId> {
        self.regions.add_rom(name, data)
    }

    pub fn add_ram(&mut self, name: &str, size: usize) -> Result<RegionId> {
        self.regions.add_ram(name, size)
    }

    /// Region addressed by the static ROM and RAM handlers of a space, at
    /// the byte address itself.
    pub fn set_base_region(&mut self, cpu: usize, kind: SpaceKind, name: &str) -> Result<()> {
        let region = self.regions.lookup(name)?;
        self.space_mut(cpu, kind)?.set_base_region(region);
        self.invalidate_opbase(cpu);
        Ok(())
    }

    pub fn set_log_unmapped(&mut self, cpu: usize, kind: SpaceKind, enable: bool) {
        match self.space_mut(cpu, kind) {
            Ok(space) => space.set_log_unmapped(enable),
            Err(err) => tracing::error!(%err, "set_log_unmapped"),
        }
    }

    fn populate(&mut self, cpu: usize, kind: SpaceKind, access: Access, range: HandlerRange, entry: u8) -> Result<()> {
        let space = self.space_mut(cpu, kind)?;
        space
            .table_mut(access)
            .populate(range.start, range.end, range.mirror, entry)
            .map_err(|_| ConfigError::SubtablesExhausted { cpu, space: kind })?;
        tracing::trace!(cpu, space = ?kind, ?access, start = range.start, end = range.end, entry, "installed");
        if kind == SpaceKind::Program {
            self.invalidate_opbase(cpu);
        }
        Ok(())
    }

    fn install_static(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping, read: u8, write: u8) -> Result<()> {
        let range = self.space_mut(cpu, kind)?.normalize(mapping)?;
        self.populate(cpu, kind, Access::Read, range, read)?;
        self.populate(cpu, kind, Access::Write, range, write)
    }

    fn require_base_region(&mut self, cpu: usize, kind: SpaceKind) -> Result<()> {
        match self.space_mut(cpu, kind)?.base_region() {
            Some(_) => Ok(()),
            None => Err(ConfigError::NoBaseRegion { cpu, space: kind }),
        }
    }

    /// Read-only storage from the base region; writes are dropped.
    pub fn install_rom(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping) -> Result<()> {
        self.require_base_region(cpu, kind)?;
        self.install_static(cpu, kind, mapping, handler::STATIC_ROM, handler::STATIC_ROM)
    }

    /// Read/write storage from the base region.
    pub fn install_static_ram(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping) -> Result<()> {
        self.require_base_region(cpu, kind)?;
        self.install_static(cpu, kind, mapping, handler::STATIC_RAM, handler::STATIC_RAM)?;
        if let Some(region) = self.space(cpu, kind).and_then(AddressSpace::base_region) {
            self.regions.mark_saved(region);
        }
        Ok(())
    }

    /// Silently ignored range: reads return the unmapped value.
    pub fn install_nop(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping) -> Result<()> {
        self.install_static(cpu, kind, mapping, handler::STATIC_NOP, handler::STATIC_NOP)
    }

    pub fn install_unmap(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping) -> Result<()> {
        self.install_static(cpu, kind, mapping, handler::STATIC_UNMAP, handler::STATIC_UNMAP)
    }

    fn check_width(space: &AddressSpace, name: &str, bits: u8) -> Result<()> {
        let info = space.info();
        let space_bits = (info.width * 8) as u8;
        if bits != space_bits {
            return Err(ConfigError::HandlerWidthMismatch {
                cpu: info.cpu,
                space: info.kind,
                name: name.to_string(),
                handler_bits: bits,
                space_bits,
            });
        }
        Ok(())
    }

    /// Route reads of a range to a callback declared `bits` wide.
    pub fn install_read_handler(
        &mut self,
        cpu: usize,
        kind: SpaceKind,
        mapping: Mapping,
        name: &str,
        bits: u8,
        handler: Rc<dyn ReadHandler>,
    ) -> Result<()> {
        let space = self.space_mut(cpu, kind)?;
        Self::check_width(space, name, bits)?;
        let range = space.normalize(mapping)?;
        let index = space
            .add_read_handler(&handler, name, range)
            .ok_or_else(|| ConfigError::HandlerPoolExhausted {
                cpu,
                space: kind,
                name: name.to_string(),
            })?;
        self.populate(cpu, kind, Access::Read, range, index)
    }

    pub fn install_write_handler(
        &mut self,
        cpu: usize,
        kind: SpaceKind,
        mapping: Mapping,
        name: &str,
        bits: u8,
        handler: Rc<dyn WriteHandler>,
    ) -> Result<()> {
        let space = self.space_mut(cpu, kind)?;
        Self::check_width(space, name, bits)?;
        let range = space.normalize(mapping)?;
        let index = space
            .add_write_handler(&handler, name, range)
            .ok_or_else(|| ConfigError::HandlerPoolExhausted {
                cpu,
                space: kind,
                name: name.to_string(),
            })?;
        self.populate(cpu, kind, Access::Write, range, index)
    }

    fn install_bank_entry(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping, bank: usize, access: &[Access]) -> Result<()> {
        let space = self.space_mut(cpu, kind)?;
        let range = space.normalize(mapping)?;
        self.banks.claim(bank, cpu, kind, range.start, range.end)?;
        self.space_mut(cpu, kind)?.set_bank_range(bank, range);
        for &access in access {
            self.populate(cpu, kind, access, range, bank as u8)?;
        }
        if access.contains(&Access::Write) {
            self.writable_banks[bank] = true;
            self.save_bank_regions(bank);
        }
        Ok(())
    }

    /// Writes through a bank must survive a snapshot even when the bank
    /// points into a ROM region.
    fn save_bank_regions(&mut self, bank: usize) {
        if !self.writable_banks.get(bank).copied().unwrap_or(false) {
            return;
        }
        for region in self.banks.regions(bank) {
            self.regions.mark_saved(region);
        }
    }

    /// Map explicit bank `bank` (1..=24) for reads and writes.
    pub fn install_bank(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping, bank: usize) -> Result<()> {
        self.install_bank_entry(cpu, kind, mapping, bank, &[Access::Read, Access::Write])
    }

    pub fn install_read_bank(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping, bank: usize) -> Result<()> {
        self.install_bank_entry(cpu, kind, mapping, bank, &[Access::Read])
    }

    pub fn install_write_bank(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping, bank: usize) -> Result<()> {
        self.install_bank_entry(cpu, kind, mapping, bank, &[Access::Write])
    }

    /// Back a range with fresh zeroed RAM through an implicit bank. Returns
    /// the bank number.
    pub fn install_ram(&mut self, cpu: usize, kind: SpaceKind, mapping: Mapping) -> Result<usize> {
        let range = self.space_mut(cpu, kind)?.normalize(mapping)?;
        let size = (range.end - range.start).min(range.mask) as usize + 1;
        let bank = self.banks.allocate_dynamic(cpu, kind, range.start, range.end)?;
        let name = format!("cpu{cpu}:{kind:?}:{:x}:bank{bank}", range.start);
        let region = self.regions.add_ram(&name, size)?;
        self.banks.configure_bank(bank, 0, 1, region, 0, 0)?;
        self.banks.set_bank(bank, 0);
        self.space_mut(cpu, kind)?.set_bank_range(bank, range);
        self.populate(cpu, kind, Access::Read, range, bank as u8)?;
        self.populate(cpu, kind, Access::Write, range, bank as u8)?;
        Ok(bank)
    }

    pub fn configure_bank(&mut self, bank: usize, first: usize, count: usize, region: &str, offset: usize, stride: usize) -> Result<()> {
        let region = self.regions.lookup(region)?;
        self.banks.configure_bank(bank, first, count, region, offset, stride)?;
        self.save_bank_regions(bank);
        Ok(())
    }

    /// Select a bank entry. Dispatch tables are untouched; only opcode
    /// windows translated through this bank are dropped.
    pub fn set_bank(&mut self, bank: usize, entry: usize) {
        self.banks.set_bank(bank, entry);
        self.invalidate_bank_opbase(bank);
    }

    pub fn set_bank_ptr(&mut self, bank: usize, region: RegionId, offset: usize) {
        self.banks.set_bank_ptr(bank, region, offset);
        self.save_bank_regions(bank);
        self.invalidate_bank_opbase(bank);
    }

    pub fn bank_entry(&self, bank: usize) -> usize {
        self.banks.bank_entry(bank)
    }

    pub fn bank_base(&self, bank: usize) -> Option<BankBase> {
        self.banks.base(bank)
    }

    /// Handler index of an access; `None` for an unconfigured space.
    pub fn resolve(&self, cpu: usize, kind: SpaceKind, access: Access, addr: u32) -> Option<u8> {
        self.space(cpu, kind).map(|space| space.resolve(access, addr))
    }

    fn target<H: ?Sized>(&self, space: &AddressSpace, entry: &HandlerEntry<H>, addr: u32, access: Access) -> Target<H> {
        match &entry.kind {
            HandlerKind::Dynamic(handler) => Target::Handler {
                handler: Rc::clone(handler),
                offset: entry.range.offset(addr),
            },
            HandlerKind::Bank(bank) => match self.banks.base(*bank) {
                Some(base) => Target::Region {
                    region: base.region,
                    offset: base.offset + entry.range.offset(addr) as usize,
                },
                None => Target::Unmapped,
            },
            HandlerKind::Rom if access == Access::Write => Target::Unmapped,
            HandlerKind::Rom | HandlerKind::Ram => match space.base_region() {
                Some(region) => Target::Region {
                    region,
                    offset: addr as usize,
                },
                None => Target::Unmapped,
            },
            HandlerKind::Nop => Target::Nop,
            HandlerKind::Unmap | HandlerKind::Invalid => Target::Unmapped,
        }
    }

    pub(crate) fn read_target(&self, cpu: usize, kind: SpaceKind, addr: u32) -> Target<dyn ReadHandler> {
        match self.space(cpu, kind) {
            Some(space) => {
                let addr = addr & space.info().byte_mask;
                self.target(space, space.read_handler_at(addr), addr, Access::Read)
            }
            None => Target::Unmapped,
        }
    }

    pub(crate) fn write_target(&self, cpu: usize, kind: SpaceKind, addr: u32) -> Target<dyn WriteHandler> {
        match self.space(cpu, kind) {
            Some(space) => {
                let addr = addr & space.info().byte_mask;
                self.target(space, space.write_handler_at(addr), addr, Access::Write)
            }
            None => Target::Unmapped,
        }
    }

    /// Lanes of `mem_mask` read from region storage in address order.
    /// Bytes past the end of the region read as the unmapped value.
    fn read_region_word(&self, region: RegionId, offset: usize, info: &SpaceInfo, mem_mask: u64) -> u64 {
        (0..info.width).fold(0, |value, k| {
            let shift = byte_shift(k, info.width, info.endianness);
            if (mem_mask >> shift) & 0xff == 0 {
                return value;
            }
            let byte = self
                .regions
                .read_byte(region, offset + k as usize)
                .map_or((info.unmap >> shift) & 0xff, u64::from);
            value | byte << shift
        })
    }

    fn write_region_word(&mut self, region: RegionId, offset: usize, info: &SpaceInfo, data: u64, mem_mask: u64) {
        for k in 0..info.width {
            let shift = byte_shift(k, info.width, info.endianness);
            if (mem_mask >> shift) & 0xff != 0 {
                self.regions.write_byte(region, offset + k as usize, (data >> shift) as u8);
            }
        }
    }

    /// Storage behind a readable address, from that byte onwards. `None`
    /// when the address dispatches to a callback or nothing.
    pub fn read_ptr(&self, cpu: usize, kind: SpaceKind, addr: u32) -> Option<&[u8]> {
        match self.read_target(cpu, kind, addr) {
            Target::Region { region, offset } => self.regions.data(region).get(offset..),
            _ => None,
        }
    }

    pub fn write_ptr(&mut self, cpu: usize, kind: SpaceKind, addr: u32) -> Option<&mut [u8]> {
        match self.write_target(cpu, kind, addr) {
            Target::Region { region, offset } => self.regions.data_mut(region).get_mut(offset..),
            _ => None,
        }
    }

    pub fn opbase(&self, cpu: usize) -> Option<&OpcodeBase> {
        self.opbase.get(cpu)
    }

    pub fn set_opbase_override(&mut self, cpu: usize, callback: Option<OpbaseOverride>) {
        match self.opbase_override.get_mut(cpu) {
            Some(slot) => {
                *slot = callback;
                self.invalidate_opbase(cpu);
            }
            None => tracing::error!(cpu, "set_opbase_override: cpu out of range"),
        }
    }

    fn opbase_override(&self, cpu: usize) -> Option<OpbaseOverride> {
        self.opbase_override.get(cpu).cloned().flatten()
    }

    /// Fetch opcodes (not operands) from `region` instead of the region the
    /// program space maps, at the same offsets.
    pub fn set_decrypted_region(&mut self, cpu: usize, region: Option<&str>) -> Result<()> {
        let region = region.map(|name| self.regions.lookup(name)).transpose()?;
        match self.decrypted.get_mut(cpu) {
            Some(slot) => *slot = region,
            None => return Err(ConfigError::MissingSpace { cpu, space: SpaceKind::Program }),
        }
        self.invalidate_opbase(cpu);
        Ok(())
    }

    pub fn invalidate_opbase(&mut self, cpu: usize) {
        if let Some(base) = self.opbase.get_mut(cpu) {
            *base = OpcodeBase::INVALID;
        }
    }

    fn invalidate_bank_opbase(&mut self, bank: usize) {
        for base in self.opbase.iter_mut().filter(|base| base.bank == Some(bank)) {
            *base = OpcodeBase::INVALID;
        }
    }

    /// Cache the window around `lookup`, reached while executing at `pc`.
    fn compute_opbase(&mut self, cpu: usize, pc: u32, lookup: u32) {
        let Some(space) = self.space(cpu, SpaceKind::Program) else {
            tracing::error!(cpu, "set_opbase: cpu has no program space");
            return;
        };
        let info = space.info();
        let pc = pc & info.byte_mask;
        let lookup = lookup & info.byte_mask;
        let delta = lookup.wrapping_sub(pc);
        let entry = space.resolve(Access::Read, lookup);
        let (lo, hi) = space.table(Access::Read).entry_run(lookup);
        let (mut min, mut max) = (lo.wrapping_sub(delta), hi.wrapping_sub(delta));
        if min > max || pc < min || pc > max {
            min = pc;
            max = pc;
        }

        let handler = space.read_handlers.get(entry);
        let full = HandlerRange {
            start: 0,
            end: info.byte_mask,
            mask: info.byte_mask,
            mirror: 0,
        };
        let (source, bank) = match &handler.kind {
            HandlerKind::Bank(bank) => match self.banks.base(*bank) {
                Some(base) => (
                    OpSource::Region {
                        region: base.region,
                        base: base.offset,
                        range: handler.range,
                    },
                    Some(*bank),
                ),
                None => (OpSource::ReadPath, Some(*bank)),
            },
            HandlerKind::Rom | HandlerKind::Ram => match space.base_region() {
                Some(region) => (
                    OpSource::Region {
                        region,
                        base: 0,
                        range: full,
                    },
                    None,
                ),
                None => (OpSource::ReadPath, None),
            },
            _ => (OpSource::ReadPath, None),
        };
        tracing::trace!(cpu, pc, min, max, entry, "opcode base");
        self.opbase[cpu] = OpcodeBase {
            valid: true,
            min,
            max,
            delta,
            entry,
            bank,
            source,
        };
    }

    /// Reselect entry 0 of every bank and drop cached opcode windows.
    pub fn reset(&mut self) {
        self.banks.reset();
        for cpu in 0..self.opbase.len() {
            self.invalidate_opbase(cpu);
        }
    }

    pub fn save_state(&self, registry: &mut StateRegistry) -> Result<(), StateError> {
        self.regions.save_state(registry)?;
        self.banks.save_state(registry)?;
        registry.save_item(STATE_TAG, 0, "decrypted", &self.decrypted)?;
        Ok(())
    }

    pub fn load_state(&mut self, registry: &StateRegistry) -> Result<(), StateError> {
        self.regions.load_state(registry)?;
        self.banks.load_state(registry)?;
        self.decrypted = registry.load_item(STATE_TAG, 0, "decrypted")?;
        for cpu in 0..self.opbase.len() {
            self.invalidate_opbase(cpu);
        }
        Ok(())
    }
}

/// Native accesses of one space, dispatched through the bus so callbacks
/// can reach the rest of the machine.
struct NativePort<'b, 'a> {
    bus: &'b mut MachineBus<'a>,
    info: SpaceInfo,
}

impl NativeBus for NativePort<'_, '_> {
    fn read_native(&mut self, addr: u32, mem_mask: u64) -> u64 {
        let info = self.info;
        let addr = addr & info.byte_mask;
        match self.bus.memory.read_target(info.cpu, info.kind, addr) {
            Target::Region { region, offset } => self.bus.memory.read_region_word(region, offset, &info, mem_mask),
            Target::Handler { handler, offset } => handler.read(self.bus, offset, mem_mask) & mem_mask,
            Target::Nop => info.unmap & mem_mask,
            Target::Unmapped => {
                if info.log_unmapped {
                    tracing::warn!(
                        cpu = info.cpu,
                        space = ?info.kind,
                        addr = format_args!("{addr:#x}"),
                        mem_mask = format_args!("{mem_mask:#x}"),
                        "unmapped read"
                    );
                }
                info.unmap & mem_mask
            }
        }
    }

    fn write_native(&mut self, addr: u32, data: u64, mem_mask: u64) {
        let info = self.info;
        let addr = addr & info.byte_mask;
        match self.bus.memory.write_target(info.cpu, info.kind, addr) {
            Target::Region { region, offset } => self.bus.memory.write_region_word(region, offset, &info, data, mem_mask),
            Target::Handler { handler, offset } => handler.write(self.bus, offset, data & mem_mask, mem_mask),
            Target::Nop => {}
            Target::Unmapped => {
                if info.log_unmapped {
                    tracing::warn!(
                        cpu = info.cpu,
                        space = ?info.kind,
                        addr = format_args!("{addr:#x}"),
                        data = format_args!("{data:#x}"),
                        "unmapped write"
                    );
                }
            }
        }
    }
}

impl MachineBus<'_> {
    fn space_or_log(&self, kind: SpaceKind) -> Option<SpaceInfo> {
        let info = self.memory.space_info(self.cpu, kind);
        if info.is_none() {
            tracing::error!(cpu = self.cpu, space = ?kind, "access to an unconfigured address space");
        }
        info
    }

    /// Read `size` (1, 2, 4 or 8) bytes at a byte address.
    pub fn read(&mut self, kind: SpaceKind, addr: u32, size: u32) -> u64 {
        let Some(info) = self.space_or_log(kind) else {
            return 0;
        };
        let addr = addr & info.byte_mask;
        #[cfg(feature = "debugger")]
        self.debug_read(kind, addr, size_mask(size));
        let mut port = NativePort { bus: self, info };
        read_sized(&mut port, info.width, info.endianness, addr, size)
    }

    pub fn write(&mut self, kind: SpaceKind, addr: u32, size: u32, data: u64) {
        let Some(info) = self.space_or_log(kind) else {
            return;
        };
        let addr = addr & info.byte_mask;
        let data = data & size_mask(size);
        #[cfg(feature = "debugger")]
        self.debug_write(kind, addr, data, size_mask(size));
        let mut port = NativePort { bus: self, info };
        write_sized(&mut port, info.width, info.endianness, addr, size, data);
    }

    pub fn read_byte(&mut self, kind: SpaceKind, addr: u32) -> u8 {
        self.read(kind, addr, 1) as u8
    }

    pub fn read_word(&mut self, kind: SpaceKind, addr: u32) -> u16 {
        self.read(kind, addr, 2) as u16
    }

    pub fn read_dword(&mut self, kind: SpaceKind, addr: u32) -> u32 {
        self.read(kind, addr, 4) as u32
    }

    pub fn read_qword(&mut self, kind: SpaceKind, addr: u32) -> u64 {
        self.read(kind, addr, 8)
    }

    pub fn write_byte(&mut self, kind: SpaceKind, addr: u32, data: u8) {
        self.write(kind, addr, 1, data as u64)
    }

    pub fn write_word(&mut self, kind: SpaceKind, addr: u32, data: u16) {
        self.write(kind, addr, 2, data as u64)
    }

    pub fn write_dword(&mut self, kind: SpaceKind, addr: u32, data: u32) {
        self.write(kind, addr, 4, data as u64)
    }

    pub fn write_qword(&mut self, kind: SpaceKind, addr: u32, data: u64) {
        self.write(kind, addr, 8, data)
    }

    /// Recompute the opcode window for `pc`, consulting the override first.
    pub fn set_opbase(&mut self, pc: u32) {
        let cpu = self.cpu;
        let decision = match self.memory.opbase_override(cpu) {
            Some(callback) => callback(self, pc),
            None => OpbaseDecision::Default,
        };
        match decision {
            OpbaseDecision::Default => self.memory.compute_opbase(cpu, pc, pc),
            OpbaseDecision::Redirect(addr) => self.memory.compute_opbase(cpu, pc, addr),
            OpbaseDecision::Handled => self.memory.invalidate_opbase(cpu),
        }
    }

    fn fetch(&mut self, pc: u32, size: u32, opcode: bool) -> u64 {
        let Some(info) = self.space_or_log(SpaceKind::Program) else {
            return 0;
        };
        let cpu = self.cpu;
        let pc = pc & info.byte_mask;
        if !self.memory.opbase[cpu].contains(pc) {
            self.set_opbase(pc);
        }
        let base = self.memory.opbase[cpu];
        if !base.valid {
            return self.read(SpaceKind::Program, pc, size);
        }
        let last = pc.wrapping_add(size - 1) & info.byte_mask;
        if size > 1 && (last < pc || !base.contains(last)) {
            return (0..size).fold(0, |value, i| {
                value | self.fetch(pc.wrapping_add(i), 1, opcode) << byte_shift(i, size, info.endianness)
            });
        }
        match base.source {
            OpSource::Region { region, base: offset, range } => {
                let region = match self.memory.decrypted[cpu] {
                    Some(decrypted) if opcode => decrypted,
                    _ => region,
                };
                (0..size).fold(0, |value, i| {
                    let at = offset + range.offset(pc.wrapping_add(base.delta).wrapping_add(i)) as usize;
                    let byte = self.memory.regions.read_byte(region, at).map_or(info.unmap & 0xff, u64::from);
                    value | byte << byte_shift(i, size, info.endianness)
                })
            }
            OpSource::ReadPath => self.read(SpaceKind::Program, pc.wrapping_add(base.delta), size),
        }
    }

    pub fn read_opcode_byte(&mut self, pc: u32) -> u8 {
        self.fetch(pc, 1, true) as u8
    }

    pub fn read_opcode_word(&mut self, pc: u32) -> u16 {
        self.fetch(pc, 2, true) as u16
    }

    pub fn read_opcode_dword(&mut self, pc: u32) -> u32 {
        self.fetch(pc, 4, true) as u32
    }

    pub fn read_arg_byte(&mut self, pc: u32) -> u8 {
        self.fetch(pc, 1, false) as u8
    }

    pub fn read_arg_word(&mut self, pc: u32) -> u16 {
        self.fetch(pc, 2, false) as u16
    }

    pub fn read_arg_dword(&mut self, pc: u32) -> u32 {
        self.fetch(pc, 4, false) as u32
    }

    pub fn set_bank(&mut self, bank: usize, entry: usize) {
        self.memory.set_bank(bank, entry);
    }

    pub fn set_bank_ptr(&mut self, bank: usize, region: RegionId, offset: usize) {
        self.memory.set_bank_ptr(bank, region, offset);
    }

    pub fn bank_entry(&self, bank: usize) -> usize {
        self.memory.bank_entry(bank)
    }

    /// Live installation from a callback; takes effect on the next access.
    pub fn install_read_handler(&mut self, kind: SpaceKind, mapping: Mapping, name: &str, bits: u8, handler: Rc<dyn ReadHandler>) -> Result<()> {
        self.memory.install_read_handler(self.cpu, kind, mapping, name, bits, handler)
    }

    pub fn install_write_handler(&mut self, kind: SpaceKind, mapping: Mapping, name: &str, bits: u8, handler: Rc<dyn WriteHandler>) -> Result<()> {
        self.memory.install_write_handler(self.cpu, kind, mapping, name, bits, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressSpaceConfig;

    fn memory() -> Memory {
        let cpus = vec![
            CpuConfig::new("main", 4_000_000),
            CpuConfig::new("sub", 2_000_000).with_space(AddressSpaceConfig::new(SpaceKind::Program, 16, 16).big_endian()),
        ];
        let mut memory = Memory::new(&cpus);
        memory.add_rom("main", (0..=255u8).cycle().take(0x10000).collect()).unwrap();
        memory.set_base_region(0, SpaceKind::Program, "main").unwrap();
        memory
    }

    #[test]
    fn test_unconfigured_space_is_an_error() {
        let mut memory = memory();
        assert_eq!(
            memory.install_nop(0, SpaceKind::Io, Mapping::new(0, 0xff)),
            Err(ConfigError::MissingSpace { cpu: 0, space: SpaceKind::Io })
        );
        assert_eq!(
            memory.install_rom(1, SpaceKind::Program, Mapping::new(0, 0xff)),
            Err(ConfigError::NoBaseRegion { cpu: 1, space: SpaceKind::Program })
        );
        assert_eq!(memory.resolve(0, SpaceKind::Data, Access::Read, 0), None);
    }

    #[test]
    fn test_rom_reads_base_region_and_drops_writes() {
        let mut memory = memory();
        memory.install_rom(0, SpaceKind::Program, Mapping::new(0x0000, 0x7fff)).unwrap();
        assert_eq!(memory.resolve(0, SpaceKind::Program, Access::Read, 0x1234), Some(handler::STATIC_ROM));
        assert_eq!(memory.read_ptr(0, SpaceKind::Program, 0x0102).map(|p| p[0]), Some(0x02));
        assert!(memory.write_ptr(0, SpaceKind::Program, 0x0102).is_none());
        assert!(memory.read_ptr(0, SpaceKind::Program, 0x8000).is_none());
    }

    #[test]
    fn test_handler_width_must_match_bus() {
        let mut memory = memory();
        let handler = read_handler(|_, _, _| 0);
        let err = memory
            .install_read_handler(1, SpaceKind::Program, Mapping::new(0, 0xff), "status", 8, handler)
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::HandlerWidthMismatch {
                cpu: 1,
                space: SpaceKind::Program,
                name: "status".into(),
                handler_bits: 8,
                space_bits: 16,
            }
        );
    }

    #[test]
    fn test_bank_switch_leaves_tables_alone() {
        let mut memory = memory();
        memory.add_rom("banks", (0..4u8).flat_map(|n| vec![n * 0x10; 0x2000]).collect()).unwrap();
        memory.install_read_bank(0, SpaceKind::Program, Mapping::new(0x8000, 0x9fff), 1).unwrap();
        memory.configure_bank(1, 0, 4, "banks", 0, 0x2000).unwrap();
        memory.set_bank(1, 0);

        let entry = memory.resolve(0, SpaceKind::Program, Access::Read, 0x8123);
        assert_eq!(memory.read_ptr(0, SpaceKind::Program, 0x8123).map(|p| p[0]), Some(0x00));
        memory.set_bank(1, 3);
        assert_eq!(memory.resolve(0, SpaceKind::Program, Access::Read, 0x8123), entry);
        assert_eq!(memory.read_ptr(0, SpaceKind::Program, 0x8123).map(|p| p[0]), Some(0x30));
        assert_eq!(memory.bank_entry(1), 3);
    }

    #[test]
    fn test_implicit_ram_gets_its_own_bank() {
        let mut memory = memory();
        let bank = memory.install_ram(0, SpaceKind::Program, Mapping::new(0xc000, 0xc7ff).mirror(0x0800)).unwrap();
        assert_eq!(bank, MAX_BANKS);
        memory.write_ptr(0, SpaceKind::Program, 0xc010).unwrap()[0] = 0x5a;
        // mirror image reaches the same byte
        assert_eq!(memory.read_ptr(0, SpaceKind::Program, 0xc810).map(|p| p[0]), Some(0x5a));
        assert_eq!(memory.read_ptr(0, SpaceKind::Program, 0xc7ff).map(|p| p.len()), Some(1));
    }

    #[test]
    fn test_opbase_window_follows_table_entry() {
        let mut memory = memory();
        memory.install_rom(0, SpaceKind::Program, Mapping::new(0x0000, 0x3fff)).unwrap();
        memory.install_nop(0, SpaceKind::Program, Mapping::new(0x4000, 0x4fff)).unwrap();
        memory.compute_opbase(0, 0x0100, 0x0100);
        let base = memory.opbase(0).unwrap();
        assert_eq!(base.window(), Some((0x0000, 0x3fff)));
        assert_eq!(base.entry(), handler::STATIC_ROM);
        assert!(!base.contains(0x4000));

        // reinstalling anything drops the cached window
        memory.install_unmap(0, SpaceKind::Program, Mapping::new(0x4000, 0x4fff)).unwrap();
        assert_eq!(memory.opbase(0).unwrap().window(), None);
    }
}
