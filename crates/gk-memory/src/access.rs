//! Access widths, guest faults and translation modes

/// Width of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    Byte,
    Half,
    Word,
    Double,
}

impl AccessWidth {
    /// Size in bytes
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Half => 2,
            Self::Word => 4,
            Self::Double => 8,
        }
    }
}

/// Kind of access being translated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

/// Address translation mode, taken from MSR.IR / MSR.DR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranslationMode {
    /// Effective address is the physical address
    Real,
    /// Effective address goes through BATs and the page table
    Virtual,
}

impl TranslationMode {
    /// Mode for a translation-enable bit
    #[inline]
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Virtual
        } else {
            Self::Real
        }
    }
}

/// DSISR: no translation was found
pub const DSISR_PAGE: u32 = 1 << 30;
/// DSISR: access to a direct-store segment
pub const DSISR_DIRECT_STORE: u32 = 1 << 26;
/// DSISR: the faulting access was a store
pub const DSISR_STORE: u32 = 1 << 25;

/// Why a data access failed to translate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsiReason {
    /// No BAT, TLB entry or page table entry matched
    PageFault,
    /// Segment register has T set
    DirectStore,
}

/// A guest-visible memory fault
///
/// These are never host errors: the CPU turns them into DSI, ISI or alignment
/// exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    /// Data access with no valid translation
    Dsi {
        address: u32,
        write: bool,
        reason: DsiReason,
    },
    /// Instruction fetch with no valid translation
    Isi { address: u32 },
    /// Misaligned access where alignment is enforced
    Alignment { address: u32 },
}

impl MemoryFault {
    /// Faulting effective address
    pub fn address(&self) -> u32 {
        match *self {
            Self::Dsi { address, .. } | Self::Isi { address } | Self::Alignment { address } => {
                address
            }
        }
    }

    /// DSISR value reported for a data storage fault
    pub fn dsisr(&self) -> u32 {
        match *self {
            Self::Dsi { write, reason, .. } => {
                let cause = match reason {
                    DsiReason::PageFault => DSISR_PAGE,
                    DsiReason::DirectStore => DSISR_DIRECT_STORE,
                };
                cause | if write { DSISR_STORE } else { 0 }
            }
            _ => 0,
        }
    }
}

/// Scalar types that can be loaded and stored big-endian
pub trait Primitive: Copy + Default + PartialEq + std::fmt::Debug + Send + 'static {
    /// Size in bytes
    const SIZE: usize;
    /// Matching access width
    const WIDTH: AccessWidth;

    /// Decode from big-endian bytes (`bytes.len() == SIZE`)
    fn from_be_slice(bytes: &[u8]) -> Self;
    /// Encode as big-endian bytes into `out` (`out.len() == SIZE`)
    fn write_be(self, out: &mut [u8]);
    /// Zero-extend to 64 bits
    fn to_u64(self) -> u64;
    /// Truncate from 64 bits
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_primitive {
    ($ty:ty, $width:expr) => {
        impl Primitive for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            const WIDTH: AccessWidth = $width;

            #[inline]
            fn from_be_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_be_bytes(buf)
            }

            #[inline]
            fn write_be(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_be_bytes());
            }

            #[inline]
            fn to_u64(self) -> u64 {
                self as u64
            }

            #[inline]
            fn from_u64(value: u64) -> Self {
                value as $ty
            }
        }
    };
}

impl_primitive!(u8, AccessWidth::Byte);
impl_primitive!(u16, AccessWidth::Half);
impl_primitive!(u32, AccessWidth::Word);
impl_primitive!(u64, AccessWidth::Double);
