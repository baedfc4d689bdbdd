//! Core infrastructure for oxidized-gekko
//!
//! Shared by every crate of the workspace:
//! - configuration loading and persistence
//! - the error taxonomy
//! - logging setup and component log macros
//! - savestate stream primitives
//! - interrupt lines shared between devices and the CPU

pub mod config;
pub mod error;
pub mod interrupt;
pub mod logging;
pub mod savestate;

pub use config::Config;
pub use error::{EmulatorError, Result};
pub use interrupt::{InterruptKind, InterruptLines};
