//! Emulator configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// CPU and run-loop settings
    pub cpu: CpuConfig,
    /// Guest memory settings
    pub memory: MemoryConfig,
    /// JIT compiler settings
    pub jit: JitConfig,
    /// Debug and logging settings
    pub debug: DebugConfig,
    /// Savestate settings
    pub savestate: SavestateConfig,
}

impl Config {
    /// Directory holding the configuration file
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("oxidized-gekko"))
    }

    /// Path of the configuration file
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load the configuration from the default location
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load the configuration from a specific file
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Save the configuration to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let dir = Self::config_dir().ok_or(ConfigError::NoConfigDir)?;
        std::fs::create_dir_all(&dir)?;
        let text = toml::to_string_pretty(self)?;
        std::fs::write(dir.join("config.toml"), text)?;
        tracing::info!("Configuration saved to {}", dir.display());
        Ok(())
    }
}

/// Execution engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuCore {
    /// Reference interpreter
    Interpreter,
    /// JIT with the portable threaded backend
    #[default]
    Jit,
    /// JIT emitting host machine code (x86-64 only, falls back to `Jit`)
    JitNative,
}

/// CPU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Active execution engine
    pub core: CpuCore,
    /// Fast-forward the scheduler when the JIT detects a busy-wait loop
    pub skip_idle_loops: bool,
    /// Upper bound of cycles executed between scheduler checkpoints
    pub slice_cycles: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            core: CpuCore::Jit,
            skip_idle_loops: true,
            slice_cycles: 20_000,
        }
    }
}

/// Guest memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size of main RAM in bytes
    pub ram_size: u32,
    /// Serve JIT loads/stores straight from the host arena when possible
    pub fastmem: bool,
    /// Raise alignment exceptions for every misaligned access
    pub strict_alignment: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ram_size: 0x0180_0000,
            fastmem: true,
            strict_alignment: false,
        }
    }
}

/// JIT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Maximum guest instructions per translated block
    pub max_block_instructions: u32,
    /// Number of block slots before eviction kicks in
    pub max_blocks: u32,
    /// Follow direct links between blocks without a dispatcher lookup
    pub link_blocks: bool,
    /// Run the local optimization pass
    pub optimize: bool,
    /// Replay every block in the interpreter and abort on divergence
    pub consistency_check: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_block_instructions: 64,
            max_blocks: 16384,
            link_blocks: true,
            optimize: true,
            consistency_check: false,
        }
    }
}

/// Log level setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Debug configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Log verbosity
    pub log_level: LogLevel,
    /// Mirror the log into a file
    pub log_to_file: bool,
    /// Log file path
    pub log_path: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_file: false,
            log_path: PathBuf::from("oxidized-gekko.log"),
        }
    }
}

/// Savestate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SavestateConfig {
    /// Deflate the RAM section
    pub compress: bool,
}

impl Default for SavestateConfig {
    fn default() -> Self {
        Self { compress: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cpu.core, CpuCore::Jit);
        assert_eq!(config.memory.ram_size, 0x0180_0000);
        assert!(config.memory.fastmem);
        assert!(!config.jit.consistency_check);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [cpu]
            core = "interpreter"

            [memory]
            strict_alignment = true
            "#,
        )
        .unwrap();
        assert_eq!(config.cpu.core, CpuCore::Interpreter);
        assert!(config.memory.strict_alignment);
        assert_eq!(config.jit.max_block_instructions, 64);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.cpu.core = CpuCore::JitNative;
        config.debug.log_level = LogLevel::Trace;
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.cpu.core, CpuCore::JitNative);
        assert_eq!(parsed.debug.log_level, LogLevel::Trace);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Config::from_toml("[cpu]\ncore = \"quantum\"").is_err());
    }
}
