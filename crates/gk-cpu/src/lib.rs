//! Gekko CPU run-loop for oxidized-gekko
//!
//! Ties the pieces together:
//! - [`Machine`]: architectural state, guest memory and interrupt lines
//! - [`ExecutionEngine`]: interpreter or JIT, swappable at any checkpoint
//! - [`Cpu`]: slices execution against the event scheduler, delivers
//!   exceptions and owns breakpoints and savestates
//! - [`CpuHandle`] / [`Debugger`]: control from other threads

pub mod control;
pub mod cpu;
pub mod debugger;
pub mod engine;
pub mod machine;
pub mod pi;
pub mod savestate;
pub mod timers;

pub use control::{CpuHandle, CpuRequest, RegisterSnapshot};
pub use cpu::{Cpu, RunState, StopReason};
pub use debugger::Debugger;
pub use engine::ExecutionEngine;
pub use machine::Machine;
