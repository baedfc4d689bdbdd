//! Gekko (PowerPC 750CL derivative) CPU model for oxidized-gekko
//!
//! This crate holds everything both execution engines share:
//! - the architectural machine state
//! - the static decode tables
//! - the reference interpreter
//! - exception delivery
//! - a small assembler for tests and demos

pub mod asm;
pub mod decoder;
pub mod exception;
pub mod instructions;
pub mod interpreter;
pub mod state;

pub use decoder::{decode, Instruction, Op, OpFlags, OpInfo, Unit};
pub use exception::{check_exceptions, check_external_exceptions, ExceptionKind};
pub use instructions::{ExecResult, Trap};
pub use interpreter::{execute_word, Interpreter, StepOutcome};
pub use state::{ExceptionFlags, MachineState, Msr, PairedSingle};
