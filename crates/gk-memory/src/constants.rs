//! GameCube memory map constants

/// Main memory base address (physical)
pub const RAM_BASE: u32 = 0x0000_0000;
/// Default main memory size (24 MB)
pub const DEFAULT_RAM_SIZE: u32 = 0x0180_0000;
/// Physical addresses with any of these bits set are never RAM
pub const RAM_REGION_MASK: u32 = 0xF800_0000;

/// Hardware register window (physical)
pub const MMIO_BASE: u32 = 0x0C00_0000;
/// Processor interface registers
pub const PI_BASE: u32 = 0x0C00_3000;

/// Cached effective mirror of physical memory set up by the IPL
pub const CACHED_MIRROR_BASE: u32 = 0x8000_0000;
/// Uncached effective mirror of physical memory set up by the IPL
pub const UNCACHED_MIRROR_BASE: u32 = 0xC000_0000;

/// Standard page size (4 KB)
pub const PAGE_SIZE: u32 = 0x1000;
/// Page shift
pub const PAGE_SHIFT: u32 = 12;

/// Granularity of the BAT lookup tables (128 KB)
pub const BAT_PAGE_SHIFT: u32 = 17;
/// BAT page size
pub const BAT_PAGE_SIZE: u32 = 1 << BAT_PAGE_SHIFT;
/// Entries per BAT lookup table (covers 4 GB)
pub const BAT_TABLE_ENTRIES: usize = 1 << (32 - BAT_PAGE_SHIFT);

/// L1 cache line size
pub const CACHE_LINE_SIZE: u32 = 32;

/// TLB sets per TLB
pub const TLB_SETS: usize = 64;
/// TLB associativity
pub const TLB_WAYS: usize = 2;

/// Inaccessible region reserved after RAM in the fastmem arena
pub const GUARD_SIZE: usize = 0x1_0000;
