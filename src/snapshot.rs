//! Machine state snapshots
//!
//! Every subsystem registers its persistent fields in a [`StateRegistry`]
//! under `(tag, instance, name)`. A [`Snapshot`] wraps the registry with a
//! version and the identity of the machine configuration, and is stored
//! bincode-encoded and zstd-compressed.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ConfigFingerprint;
use crate::error::StateError;

type ItemKey = (String, u32, String);

/// Registered state items, each stored as its own bincode blob.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRegistry {
    items: BTreeMap<ItemKey, Vec<u8>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        StateRegistry::default()
    }

    /// Store `value` under `tag/instance/name`, replacing any earlier value.
    pub fn save_item<T: Serialize + ?Sized>(&mut self, tag: &str, instance: u32, name: &str, value: &T) -> Result<(), StateError> {
        let bytes = bincode::serialize(value).map_err(StateError::Encode)?;
        self.items.insert((tag.to_string(), instance, name.to_string()), bytes);
        Ok(())
    }

    pub fn load_item<T: DeserializeOwned>(&self, tag: &str, instance: u32, name: &str) -> Result<T, StateError> {
        let key = (tag.to_string(), instance, name.to_string());
        let bytes = self.items.get(&key).ok_or_else(|| StateError::MissingItem {
            tag: tag.to_string(),
            instance,
            name: name.to_string(),
        })?;
        bincode::deserialize(bytes).map_err(|source| StateError::Decode {
            tag: tag.to_string(),
            instance,
            name: name.to_string(),
            source,
        })
    }

    pub fn contains(&self, tag: &str, instance: u32, name: &str) -> bool {
        self.items.contains_key(&(tag.to_string(), instance, name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = (&str, u32, &str)> {
        self.items.keys().map(|(tag, instance, name)| (tag.as_str(), *instance, name.as_str()))
    }
}

/// A saved machine.
#[derive(Serialize, Deserialize)]
pub struct Snapshot {
    /// Version for compatibility checking
    pub version: u32,
    /// Configuration the state was taken from (validated on restore)
    pub config: ConfigFingerprint,
    pub state: StateRegistry,
}

impl Snapshot {
    /// Current snapshot version
    pub const VERSION: u32 = 1;

    pub fn new(config: ConfigFingerprint, state: StateRegistry) -> Self {
        Snapshot {
            version: Self::VERSION,
            config,
            state,
        }
    }

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        let serialized = bincode::serialize(self).map_err(StateError::Encode)?;
        Ok(zstd::stream::encode_all(&serialized[..], 3)?)
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, StateError> {
        let decompressed = zstd::stream::decode_all(data)?;
        let snapshot: Snapshot = bincode::deserialize(&decompressed).map_err(|source| StateError::Decode {
            tag: "snapshot".to_string(),
            instance: 0,
            name: "header".to_string(),
            source,
        })?;
        if snapshot.version != Self::VERSION {
            return Err(StateError::Version {
                found: snapshot.version,
                expected: Self::VERSION,
            });
        }
        Ok(snapshot)
    }

    /// Refuse state taken from a differently configured machine.
    pub fn check_config(&self, config: &ConfigFingerprint) -> Result<(), StateError> {
        if &self.config != config {
            return Err(StateError::ConfigMismatch(format!(
                "snapshot has {} cpus at {:?}, machine has {} cpus at {:?}",
                self.config.cpus.len(),
                self.config.cpus.iter().map(|cpu| cpu.1).collect::<Vec<_>>(),
                config.cpus.len(),
                config.cpus.iter().map(|cpu| cpu.1).collect::<Vec<_>>(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(clock: u64) -> ConfigFingerprint {
        ConfigFingerprint {
            cpus: vec![("main".to_string(), clock, Vec::new())],
            frames_per_second: 60,
            slices_per_frame: 1,
        }
    }

    #[test]
    fn test_items_are_keyed_by_tag_instance_and_name() {
        let mut registry = StateRegistry::new();
        registry.save_item("cpuexec", 0, "total_cycles", &1234u64).unwrap();
        registry.save_item("cpuexec", 1, "total_cycles", &99u64).unwrap();
        assert_eq!(registry.load_item::<u64>("cpuexec", 0, "total_cycles").unwrap(), 1234);
        assert_eq!(registry.load_item::<u64>("cpuexec", 1, "total_cycles").unwrap(), 99);
        assert!(matches!(
            registry.load_item::<u64>("cpuexec", 2, "total_cycles"),
            Err(StateError::MissingItem { instance: 2, .. })
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_decode_error_names_the_item() {
        let mut registry = StateRegistry::new();
        registry.save_item("bank", 0, "current", &1u8).unwrap();
        let err = registry.load_item::<u64>("bank", 0, "current").unwrap_err();
        assert!(err.to_string().contains("bank/0/current"));
    }

    #[test]
    fn test_snapshot_bytes_round_trip_and_validation() {
        let mut registry = StateRegistry::new();
        registry.save_item("region", 0, "work", &vec![1u8, 2, 3]).unwrap();
        let bytes = Snapshot::new(fingerprint(4_000_000), registry.clone()).to_bytes().unwrap();

        let restored = Snapshot::from_bytes(&bytes).unwrap();
        assert_eq!(restored.state, registry);
        assert!(restored.check_config(&fingerprint(4_000_000)).is_ok());
        assert!(matches!(
            restored.check_config(&fingerprint(3_579_545)),
            Err(StateError::ConfigMismatch(_))
        ));
        assert!(Snapshot::from_bytes(b"not a snapshot").is_err());
    }
}
