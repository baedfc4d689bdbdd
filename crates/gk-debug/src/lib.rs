//! Debugging tools for the Gekko core
//!
//! - Execution breakpoints with hit counts
//! - Gekko disassembler with simplified mnemonics
//! - Stack back-chain walker

pub mod breakpoint;
pub mod callstack;
pub mod disassembler;

pub use breakpoint::{Breakpoint, BreakpointManager};
pub use callstack::{format_callstack, walk_callstack, StackFrame, MAX_CALLSTACK_DEPTH};
pub use disassembler::{DisassembledInstruction, GekkoDisassembler};
