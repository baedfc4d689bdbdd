//! Guest memory for oxidized-gekko
//!
//! This crate provides:
//! - a guard-paged RAM arena with big-endian typed access
//! - MMIO dispatch for device registers
//! - BAT, TLB and hashed page table translation
//! - code tracking for self-modifying code
//! - the `lwarx`/`stwcx.` reservation

pub mod access;
pub mod arena;
pub mod bat;
pub mod codemap;
pub mod constants;
pub mod memory;
pub mod mmio;
pub mod mmu;
pub mod pages;
pub mod physical;
pub mod reservation;

pub use access::{AccessKind, AccessWidth, DsiReason, MemoryFault, Primitive, TranslationMode};
pub use arena::FastmemArena;
pub use bat::BatTable;
pub use codemap::{CodeMap, WriteJournal};
pub use memory::GuestMemory;
pub use mmio::{MmioBus, MmioRead, MmioWrite};
pub use mmu::{Mmu, MmuSnapshot, Translation};
pub use pages::PageFlags;
pub use physical::PhysicalMemory;
pub use reservation::Reservation;
