//! Block translator for oxidized-gekko
//!
//! Guest code is translated one basic block at a time:
//! - [`analyzer`] finds the block boundaries, exits and idle loops
//! - [`ir`] lowers guest instructions into a small register IR
//! - [`optimizer`] folds constants, rewrites idioms and drops dead CR writes
//! - [`regcache`] maps guest registers onto a handful of host slots
//! - [`threaded`] emits and runs portable threaded code
//! - `x64` emits native x86-64 code where the host supports it
//!
//! [`Jit`] owns the block cache and the dispatcher that chains blocks
//! together. Anything the translator does not handle natively runs through
//! the interpreter, so a block always produces the interpreter's result.

pub mod analyzer;
pub mod cache;
pub mod ir;
pub mod jit;
pub mod optimizer;
pub mod regcache;
pub mod threaded;
pub mod trap;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod x64;

pub use analyzer::{AnalyzedBlock, CompileFault, GuestInst};
pub use cache::{Block, BlockCache, BlockCode, BlockHandle, BlockKey};
pub use jit::{Backend, BlockExit, Jit, JitStats, RunOutcome};
pub use trap::TrapTable;
