//! Interrupt lines shared between device emulation and the CPU
//!
//! Devices raise and clear causes; the CPU samples `cause & mask` at each
//! checkpoint and mirrors it into its external-interrupt exception bit.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Processor-interface interrupt causes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterruptKind: u32 {
        /// GP runtime error
        const ERROR     = 0x0000_0001;
        /// Reset switch
        const RSW       = 0x0000_0002;
        /// DVD interface
        const DI        = 0x0000_0004;
        /// Serial interface
        const SI        = 0x0000_0008;
        /// External interface
        const EXI       = 0x0000_0010;
        /// Audio interface streaming
        const AI        = 0x0000_0020;
        /// DSP
        const DSP       = 0x0000_0040;
        /// Memory interface
        const MEM       = 0x0000_0080;
        /// Video interface
        const VI        = 0x0000_0100;
        /// Pixel engine token
        const PE_TOKEN  = 0x0000_0200;
        /// Pixel engine finish
        const PE_FINISH = 0x0000_0400;
        /// Command processor FIFO
        const CP        = 0x0000_0800;
        /// Debugger
        const DEBUG     = 0x0000_1000;
        /// High speed port
        const HSP       = 0x0000_2000;
    }
}

/// Interrupt cause and mask registers
#[derive(Debug)]
pub struct InterruptLines {
    cause: AtomicU32,
    mask: AtomicU32,
}

impl InterruptLines {
    /// Create lines with no pending cause and every source enabled
    pub const fn new() -> Self {
        Self {
            cause: AtomicU32::new(0),
            mask: AtomicU32::new(u32::MAX),
        }
    }

    /// Assert an interrupt cause
    pub fn raise(&self, kind: InterruptKind) {
        self.cause.fetch_or(kind.bits(), Ordering::AcqRel);
    }

    /// Deassert an interrupt cause
    pub fn clear(&self, kind: InterruptKind) {
        self.cause.fetch_and(!kind.bits(), Ordering::AcqRel);
    }

    /// Raw cause register
    pub fn cause(&self) -> u32 {
        self.cause.load(Ordering::Acquire)
    }

    /// Raw mask register
    pub fn mask(&self) -> u32 {
        self.mask.load(Ordering::Acquire)
    }

    /// Overwrite the cause register (savestate restore)
    pub fn set_cause(&self, value: u32) {
        self.cause.store(value, Ordering::Release);
    }

    /// Overwrite the mask register
    pub fn set_mask(&self, value: u32) {
        self.mask.store(value, Ordering::Release);
    }

    /// True when an enabled cause is pending
    pub fn is_asserted(&self) -> bool {
        self.cause() & self.mask() != 0
    }
}

impl Default for InterruptLines {
    fn default() -> Self {
        Self::new()
    }
}
