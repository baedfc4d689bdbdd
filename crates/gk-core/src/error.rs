//! Error types for oxidized-gekko
//!
//! Guest-visible faults (page faults, alignment, illegal instructions) are not
//! represented here: they become guest exceptions. These types cover host-side
//! failures only.

use thiserror::Error;

/// Main emulator error type
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("CPU error: {0}")]
    Cpu(#[from] CpuError),

    #[error("JIT error: {0}")]
    Jit(#[from] JitError),

    #[error("Savestate error: {0}")]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host-side memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Physical range 0x{addr:08x}+0x{len:x} is not backed by RAM")]
    OutOfRange { addr: u32, len: u32 },

    #[error("MMIO range 0x{base:08x}+0x{size:x} overlaps an existing registration")]
    MmioOverlap { base: u32, size: u32 },

    #[error("Invalid MMIO range 0x{base:08x}+0x{size:x}")]
    InvalidMmioRange { base: u32, size: u32 },

    #[error("Failed to reserve guest memory arena: {0}")]
    ArenaAllocation(String),
}

/// Run-loop and control errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CpuError {
    #[error("Operation requires a stopped CPU (current state: {0})")]
    NotStopped(&'static str),

    #[error("CPU thread is no longer running")]
    ThreadGone,

    #[error("Register index {0} out of range")]
    InvalidRegister(usize),
}

/// JIT errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("Executable memory allocation failed: {0}")]
    ExecutableMemory(String),

    #[error("Native backend is not available on this host")]
    BackendUnavailable,

    #[error("JIT/interpreter divergence at 0x{pc:08x}: {detail}")]
    Divergence { pc: u32, detail: String },
}

/// Savestate errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Invalid savestate magic")]
    InvalidMagic,

    #[error("Unsupported savestate version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Unsupported {section} section version {found}")]
    UnsupportedSectionVersion { section: &'static str, found: u16 },

    #[error("Savestate truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Checksum mismatch in section {0}")]
    ChecksumMismatch(String),

    #[error("Missing savestate section {0}")]
    MissingSection(&'static str),

    #[error("Duplicate savestate section {0}")]
    DuplicateSection(String),

    #[error("Corrupt savestate: {0}")]
    Corrupt(String),

    #[error("Savestate references unknown event type '{0}'")]
    UnknownEvent(String),

    #[error("Savestate I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No configuration directory available on this host")]
    NoConfigDir,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Result type alias for emulator operations
pub type Result<T> = std::result::Result<T, EmulatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: EmulatorError = StateError::InvalidMagic.into();
        assert!(matches!(err, EmulatorError::State(StateError::InvalidMagic)));
        assert_eq!(err.to_string(), "Savestate error: Invalid savestate magic");
    }

    #[test]
    fn test_memory_error_display() {
        let err = MemoryError::MmioOverlap { base: 0x0C00_3000, size: 0x100 };
        assert!(err.to_string().contains("0x0c003000"));
    }
}
