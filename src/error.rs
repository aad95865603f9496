//! Error types
//!
//! Configuration errors are fatal: the machine either initializes completely
//! or not at all. Misuse of runtime operations is never reported here; those
//! calls log and degrade to a default value instead.

use thiserror::Error;

use crate::memory::SpaceKind;

/// Fatal machine configuration errors.
///
/// Every variant names the CPU, address space or subsystem that failed so the
/// front end can print a single diagnostic and exit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("machine has no CPUs configured")]
    NoCpus,

    #[error("{count} CPUs configured, at most {max} are supported")]
    TooManyCpus { count: usize, max: usize },

    #[error("expected {expected} CPU cores for the configuration, got {got}")]
    CoreCountMismatch { expected: usize, got: usize },

    #[error("cpu #{cpu}: clock must be non-zero")]
    InvalidClock { cpu: usize },

    #[error("cpu #{cpu}: clock scale {scale} must be finite and positive")]
    InvalidClockScale { cpu: usize, scale: String },

    #[error("frame rate must be non-zero")]
    InvalidFrameRate,

    #[error("slices per frame must be non-zero")]
    InvalidInterleave,

    #[error("cpu #{cpu} {space:?}: unsupported data width of {bits} bits")]
    UnsupportedDataWidth { cpu: usize, space: SpaceKind, bits: u8 },

    #[error("cpu #{cpu} {space:?}: {bits}-bit address bus with shift {shift} does not fit a 32-bit byte address")]
    AddressWidthOutOfRange { cpu: usize, space: SpaceKind, bits: u8, shift: i8 },

    #[error("cpu #{cpu}: address space {space:?} configured twice")]
    DuplicateSpace { cpu: usize, space: SpaceKind },

    #[error("cpu #{cpu}: address space {space:?} is not configured")]
    MissingSpace { cpu: usize, space: SpaceKind },

    #[error("cpu #{cpu} {space:?}: handler '{name}' is {handler_bits}-bit on a {space_bits}-bit bus")]
    HandlerWidthMismatch {
        cpu: usize,
        space: SpaceKind,
        name: String,
        handler_bits: u8,
        space_bits: u8,
    },

    #[error("cpu #{cpu} {space:?}: invalid range {start:#x}-{end:#x}")]
    InvalidRange { cpu: usize, space: SpaceKind, start: u32, end: u32 },

    #[error("cpu #{cpu} {space:?}: out of dynamic handler slots installing '{name}'")]
    HandlerPoolExhausted { cpu: usize, space: SpaceKind, name: String },

    #[error("cpu #{cpu} {space:?}: out of level-2 subtables even after merging")]
    SubtablesExhausted { cpu: usize, space: SpaceKind },

    #[error("cpu #{cpu} {space:?}: static ROM/RAM installed before a base region was set")]
    NoBaseRegion { cpu: usize, space: SpaceKind },

    #[error("bank {bank} is out of range (1..={max})")]
    BankOutOfRange { bank: usize, max: usize },

    #[error("bank {bank} is already owned by cpu #{owner_cpu} {owner_space:?}")]
    BankConflict { bank: usize, owner_cpu: usize, owner_space: SpaceKind },

    #[error("bank {bank}: entry {entry} out of range")]
    BankEntryOutOfRange { bank: usize, entry: usize },

    #[error("no free bank left for implicit memory")]
    BanksExhausted,

    #[error("memory region '{0}' does not exist")]
    UnknownRegion(String),

    #[error("memory region '{0}' is defined twice")]
    DuplicateRegion(String),

    #[error(transparent)]
    Timer(#[from] TimerError),
}

/// Timer pool errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer pool exhausted ({capacity} timers)")]
    PoolExhausted { capacity: usize },
}

/// Errors saving or restoring machine state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("serialization error: {0}")]
    Encode(#[source] bincode::Error),

    #[error("deserialization error for {tag}/{instance}/{name}: {source}")]
    Decode {
        tag: String,
        instance: u32,
        name: String,
        #[source]
        source: bincode::Error,
    },

    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("snapshot has no entry {tag}/{instance}/{name}")]
    MissingItem { tag: String, instance: u32, name: String },

    #[error("snapshot version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("snapshot was taken from a different machine: {0}")]
    ConfigMismatch(String),
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
