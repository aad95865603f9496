//! Memory banks
//!
//! A bank is an indirection between a dispatch-table entry and the bytes it
//! reaches. Switching a bank only rewrites its slot in the base array; the
//! dispatch tables never change.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result, StateError};
use crate::memory::region::RegionId;
use crate::memory::SpaceKind;
use crate::snapshot::StateRegistry;

/// Banks a driver may number explicitly (1..=24).
pub const MAX_EXPLICIT_BANKS: usize = 24;
/// Highest bank index; indices above the explicit ones are handed out
/// downward for implicit RAM.
pub const MAX_BANKS: usize = 32;
/// Entries each bank can switch between.
pub const MAX_BANK_ENTRIES: usize = 256;

const STATE_TAG: &str = "bank";

/// Where a bank currently points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankBase {
    pub region: RegionId,
    pub offset: usize,
}

#[derive(Clone)]
struct Bank {
    used: bool,
    dynamic: bool,
    owner: Option<(usize, SpaceKind)>,
    start: u32,
    end: u32,
    current: Option<usize>,
    entries: Vec<Option<BankBase>>,
}

impl Bank {
    fn unused() -> Self {
        Bank {
            used: false,
            dynamic: false,
            owner: None,
            start: 0,
            end: 0,
            current: None,
            entries: vec![None; MAX_BANK_ENTRIES],
        }
    }
}

pub struct BankTable {
    banks: Vec<Bank>,
    base: Vec<Option<BankBase>>,
}

impl Default for BankTable {
    fn default() -> Self {
        BankTable::new()
    }
}

impl BankTable {
    pub fn new() -> Self {
        BankTable {
            banks: vec![Bank::unused(); MAX_BANKS + 1],
            base: vec![None; MAX_BANKS + 1],
        }
    }

    fn check_index(bank: usize, max: usize) -> Result<()> {
        if bank == 0 || bank > max {
            return Err(ConfigError::BankOutOfRange { bank, max });
        }
        Ok(())
    }

    /// Bind explicit bank `bank` to a byte range of one address space.
    pub fn claim(&mut self, bank: usize, cpu: usize, space: SpaceKind, start: u32, end: u32) -> Result<()> {
        Self::check_index(bank, MAX_EXPLICIT_BANKS)?;
        let slot = &mut self.banks[bank];
        if let Some((owner_cpu, owner_space)) = slot.owner {
            if (owner_cpu, owner_space) != (cpu, space) {
                return Err(ConfigError::BankConflict {
                    bank,
                    owner_cpu,
                    owner_space,
                });
            }
        }
        slot.used = true;
        slot.owner = Some((cpu, space));
        slot.start = start;
        slot.end = end;
        Ok(())
    }

    /// Hand out the next free implicit bank, counting down from the top.
    pub fn allocate_dynamic(&mut self, cpu: usize, space: SpaceKind, start: u32, end: u32) -> Result<usize> {
        let bank = (MAX_EXPLICIT_BANKS + 1..=MAX_BANKS)
            .rev()
            .find(|&bank| !self.banks[bank].used)
            .ok_or(ConfigError::BanksExhausted)?;
        let slot = &mut self.banks[bank];
        slot.used = true;
        slot.dynamic = true;
        slot.owner = Some((cpu, space));
        slot.start = start;
        slot.end = end;
        tracing::debug!(bank, cpu, ?space, start, end, "implicit bank allocated");
        Ok(bank)
    }

    /// Register `count` consecutive entries starting at `first`, each
    /// `stride` bytes further into `region`.
    pub fn configure_bank(
        &mut self,
        bank: usize,
        first: usize,
        count: usize,
        region: RegionId,
        offset: usize,
        stride: usize,
    ) -> Result<()> {
        Self::check_index(bank, MAX_BANKS)?;
        if first + count > MAX_BANK_ENTRIES {
            return Err(ConfigError::BankEntryOutOfRange {
                bank,
                entry: first + count - 1,
            });
        }
        for i in 0..count {
            self.banks[bank].entries[first + i] = Some(BankBase {
                region,
                offset: offset + i * stride,
            });
        }
        Ok(())
    }

    /// Select a registered entry.
    pub fn set_bank(&mut self, bank: usize, entry: usize) {
        if bank == 0 || bank > MAX_BANKS {
            tracing::error!(bank, "set_bank: bank out of range");
            return;
        }
        match self.banks[bank].entries.get(entry).copied().flatten() {
            Some(base) => {
                self.banks[bank].current = Some(entry);
                self.base[bank] = Some(base);
                tracing::debug!(bank, entry, "bank switched");
            }
            None => tracing::error!(bank, entry, "set_bank: entry not configured"),
        }
    }

    /// Point a bank at arbitrary storage, bypassing the entry list.
    pub fn set_bank_ptr(&mut self, bank: usize, region: RegionId, offset: usize) {
        if bank == 0 || bank > MAX_BANKS {
            tracing::error!(bank, "set_bank_ptr: bank out of range");
            return;
        }
        self.banks[bank].current = None;
        self.base[bank] = Some(BankBase { region, offset });
    }

    /// Currently selected entry; 0 if none was selected.
    pub fn bank_entry(&self, bank: usize) -> usize {
        match self.banks.get(bank) {
            Some(slot) if bank != 0 => slot.current.unwrap_or(0),
            _ => {
                tracing::error!(bank, "bank_entry: bank out of range");
                0
            }
        }
    }

    #[inline]
    pub fn base(&self, bank: usize) -> Option<BankBase> {
        self.base.get(bank).copied().flatten()
    }

    /// Every region a bank can currently reach, through its entries or its
    /// current base.
    pub fn regions(&self, bank: usize) -> Vec<RegionId> {
        let Some(slot) = self.banks.get(bank) else {
            return Vec::new();
        };
        let mut regions: Vec<RegionId> = slot.entries.iter().flatten().map(|base| base.region).collect();
        regions.extend(self.base(bank).map(|base| base.region));
        regions.sort_by_key(|id| id.index());
        regions.dedup();
        regions
    }

    pub fn range(&self, bank: usize) -> Option<(u32, u32)> {
        self.banks.get(bank).filter(|slot| slot.used).map(|slot| (slot.start, slot.end))
    }

    pub fn is_dynamic(&self, bank: usize) -> bool {
        self.banks.get(bank).map_or(false, |slot| slot.dynamic)
    }

    /// Reselect entry 0 of every bank that has one.
    pub fn reset(&mut self) {
        for bank in 1..=MAX_BANKS {
            if self.banks[bank].used && self.banks[bank].entries[0].is_some() {
                self.set_bank(bank, 0);
            }
        }
    }

    pub fn save_state(&self, registry: &mut StateRegistry) -> Result<(), StateError> {
        let current: Vec<Option<usize>> = self.banks.iter().map(|slot| slot.current).collect();
        registry.save_item(STATE_TAG, 0, "current", &current)?;
        registry.save_item(STATE_TAG, 0, "base", &self.base)?;
        Ok(())
    }

    pub fn load_state(&mut self, registry: &StateRegistry) -> Result<(), StateError> {
        let current: Vec<Option<usize>> = registry.load_item(STATE_TAG, 0, "current")?;
        let base: Vec<Option<BankBase>> = registry.load_item(STATE_TAG, 0, "base")?;
        if current.len() != self.banks.len() || base.len() != self.base.len() {
            return Err(StateError::ConfigMismatch("bank table size differs".to_string()));
        }
        for (slot, entry) in self.banks.iter_mut().zip(current) {
            slot.current = entry;
        }
        self.base = base;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::region::Regions;

    #[test]
    fn test_explicit_bank_range_is_checked() {
        let mut banks = BankTable::new();
        assert_eq!(
            banks.claim(0, 0, SpaceKind::Program, 0, 0xff),
            Err(ConfigError::BankOutOfRange { bank: 0, max: MAX_EXPLICIT_BANKS })
        );
        assert_eq!(
            banks.claim(25, 0, SpaceKind::Program, 0, 0xff),
            Err(ConfigError::BankOutOfRange { bank: 25, max: MAX_EXPLICIT_BANKS })
        );
        assert!(banks.claim(1, 0, SpaceKind::Program, 0, 0xff).is_ok());
        assert_eq!(
            banks.claim(1, 1, SpaceKind::Program, 0, 0xff),
            Err(ConfigError::BankConflict { bank: 1, owner_cpu: 0, owner_space: SpaceKind::Program })
        );
    }

    #[test]
    fn test_dynamic_banks_count_down() {
        let mut banks = BankTable::new();
        assert_eq!(banks.allocate_dynamic(0, SpaceKind::Program, 0, 0xff), Ok(32));
        assert_eq!(banks.allocate_dynamic(0, SpaceKind::Program, 0x100, 0x1ff), Ok(31));
        for _ in 0..6 {
            banks.allocate_dynamic(1, SpaceKind::Data, 0, 0).unwrap();
        }
        assert_eq!(banks.allocate_dynamic(1, SpaceKind::Data, 0, 0), Err(ConfigError::BanksExhausted));
        assert!(banks.is_dynamic(25));
        assert!(!banks.is_dynamic(24));
    }

    #[test]
    fn test_switching_entries() {
        let mut regions = Regions::new();
        let rom = regions.add_rom("banks", vec![0; 0x4000]).unwrap();
        let mut banks = BankTable::new();
        banks.claim(3, 0, SpaceKind::Program, 0x8000, 0xbfff).unwrap();
        banks.configure_bank(3, 0, 4, rom, 0, 0x1000).unwrap();
        assert_eq!(banks.base(3), None);

        banks.set_bank(3, 2);
        assert_eq!(banks.bank_entry(3), 2);
        assert_eq!(banks.base(3), Some(BankBase { region: rom, offset: 0x2000 }));

        // unconfigured entry leaves the bank alone
        banks.set_bank(3, 9);
        assert_eq!(banks.bank_entry(3), 2);

        banks.set_bank_ptr(3, rom, 0x123);
        assert_eq!(banks.base(3), Some(BankBase { region: rom, offset: 0x123 }));

        banks.reset();
        assert_eq!(banks.bank_entry(3), 0);
        assert_eq!(banks.base(3), Some(BankBase { region: rom, offset: 0 }));
    }

    #[test]
    fn test_entry_range_is_checked() {
        let mut regions = Regions::new();
        let rom = regions.add_rom("banks", vec![0; 16]).unwrap();
        let mut banks = BankTable::new();
        assert_eq!(
            banks.configure_bank(1, 250, 10, rom, 0, 1),
            Err(ConfigError::BankEntryOutOfRange { bank: 1, entry: 259 })
        );
    }
}
