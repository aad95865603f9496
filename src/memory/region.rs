//! Memory regions
//!
//! Named byte buffers backing ROM, RAM and banks. Regions are created while
//! the machine is configured and never resized afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result, StateError};
use crate::snapshot::StateRegistry;

const STATE_TAG: &str = "region";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionId(u16);

impl RegionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct Region {
    name: String,
    data: Vec<u8>,
    /// Contents are part of the machine state: RAM, and any ROM a writable
    /// mapping reaches.
    saved: bool,
}

#[derive(Default)]
pub struct Regions {
    regions: Vec<Region>,
}

impl Regions {
    pub fn new() -> Self {
        Regions::default()
    }

    fn add(&mut self, name: &str, data: Vec<u8>, saved: bool) -> Result<RegionId> {
        if self.find(name).is_some() {
            return Err(ConfigError::DuplicateRegion(name.to_string()));
        }
        let id = RegionId(self.regions.len() as u16);
        self.regions.push(Region {
            name: name.to_string(),
            data,
            saved,
        });
        Ok(id)
    }

    /// Register read-only contents.
    pub fn add_rom(&mut self, name: &str, data: Vec<u8>) -> Result<RegionId> {
        self.add(name, data, false)
    }

    /// Register zero-filled RAM that is saved with the machine state.
    pub fn add_ram(&mut self, name: &str, size: usize) -> Result<RegionId> {
        self.add(name, vec![0; size], true)
    }

    /// Save a region with the machine state from now on. Used when a
    /// writable mapping lands on a region registered as ROM.
    pub fn mark_saved(&mut self, id: RegionId) {
        if let Some(region) = self.regions.get_mut(id.index()) {
            if !region.saved {
                tracing::debug!(region = %region.name, "region contents saved with machine state");
                region.saved = true;
            }
        }
    }

    pub fn is_saved(&self, id: RegionId) -> bool {
        self.regions.get(id.index()).map_or(false, |region| region.saved)
    }

    pub fn find(&self, name: &str) -> Option<RegionId> {
        self.regions
            .iter()
            .position(|region| region.name == name)
            .map(|index| RegionId(index as u16))
    }

    pub fn lookup(&self, name: &str) -> Result<RegionId> {
        self.find(name).ok_or_else(|| ConfigError::UnknownRegion(name.to_string()))
    }

    pub fn name(&self, id: RegionId) -> &str {
        self.regions.get(id.index()).map_or("?", |region| region.name.as_str())
    }

    pub fn data(&self, id: RegionId) -> &[u8] {
        self.regions.get(id.index()).map_or(&[][..], |region| region.data.as_slice())
    }

    pub fn data_mut(&mut self, id: RegionId) -> &mut [u8] {
        match self.regions.get_mut(id.index()) {
            Some(region) => region.data.as_mut_slice(),
            None => &mut [],
        }
    }

    #[inline]
    pub fn read_byte(&self, id: RegionId, offset: usize) -> Option<u8> {
        self.regions.get(id.index())?.data.get(offset).copied()
    }

    #[inline]
    pub fn write_byte(&mut self, id: RegionId, offset: usize, value: u8) -> bool {
        match self.regions.get_mut(id.index()).and_then(|region| region.data.get_mut(offset)) {
            Some(byte) => {
                *byte = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn save_state(&self, registry: &mut StateRegistry) -> Result<(), StateError> {
        for (index, region) in self.regions.iter().enumerate().filter(|(_, r)| r.saved) {
            registry.save_item(STATE_TAG, index as u32, &region.name, &region.data)?;
        }
        Ok(())
    }

    pub fn load_state(&mut self, registry: &StateRegistry) -> Result<(), StateError> {
        for (index, region) in self.regions.iter_mut().enumerate().filter(|(_, r)| r.saved) {
            let data: Vec<u8> = registry.load_item(STATE_TAG, index as u32, &region.name)?;
            if data.len() != region.data.len() {
                return Err(StateError::ConfigMismatch(format!(
                    "region '{}' is {} bytes, snapshot has {}",
                    region.name,
                    region.data.len(),
                    data.len()
                )));
            }
            region.data = data;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions_are_named_and_unique() {
        let mut regions = Regions::new();
        let rom = regions.add_rom("maincpu", vec![1, 2, 3]).unwrap();
        let ram = regions.add_ram("work", 16).unwrap();
        assert_ne!(rom, ram);
        assert_eq!(regions.find("work"), Some(ram));
        assert_eq!(regions.name(rom), "maincpu");
        assert_eq!(regions.add_ram("work", 4), Err(ConfigError::DuplicateRegion("work".into())));
        assert_eq!(regions.lookup("gfx"), Err(ConfigError::UnknownRegion("gfx".into())));
    }

    #[test]
    fn test_out_of_bounds_access_is_refused() {
        let mut regions = Regions::new();
        let ram = regions.add_ram("work", 2).unwrap();
        assert!(regions.write_byte(ram, 1, 0xaa));
        assert!(!regions.write_byte(ram, 2, 0xbb));
        assert_eq!(regions.read_byte(ram, 1), Some(0xaa));
        assert_eq!(regions.read_byte(ram, 2), None);
    }

    #[test]
    fn test_marked_rom_is_saved() {
        let mut regions = Regions::new();
        let rom = regions.add_rom("main", vec![0; 4]).unwrap();
        let mut registry = StateRegistry::new();
        regions.save_state(&mut registry).unwrap();
        assert!(registry.is_empty());

        regions.mark_saved(rom);
        assert!(regions.is_saved(rom));
        regions.write_byte(rom, 2, 0x11);
        regions.save_state(&mut registry).unwrap();
        regions.write_byte(rom, 2, 0x99);
        regions.load_state(&registry).unwrap();
        assert_eq!(regions.read_byte(rom, 2), Some(0x11));
    }
}
