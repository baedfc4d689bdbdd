//! Block address translation lookup tables
//!
//! Each table has one entry per 128 KB of effective address space, rebuilt
//! from the four upper/lower BAT register pairs whenever one of them changes.

use crate::constants::{BAT_PAGE_SHIFT, BAT_PAGE_SIZE, BAT_TABLE_ENTRIES, RAM_REGION_MASK};
use crate::pages::PageFlags;

const FLAG_MASK: u32 = 0x1F;

/// Effective-to-physical BAT lookup table
#[derive(Clone)]
pub struct BatTable {
    entries: Box<[u32]>,
}

impl BatTable {
    /// Create an empty table (nothing mapped)
    pub fn new() -> Self {
        Self {
            entries: vec![0; BAT_TABLE_ENTRIES].into_boxed_slice(),
        }
    }

    /// Translate through the table
    #[inline]
    pub fn lookup(&self, ea: u32) -> Option<(u32, PageFlags)> {
        let entry = self.entries[(ea >> BAT_PAGE_SHIFT) as usize];
        let flags = PageFlags::from_bits_truncate(entry & FLAG_MASK);
        if !flags.contains(PageFlags::MAPPED) {
            return None;
        }
        Some(((entry & !FLAG_MASK) | (ea & (BAT_PAGE_SIZE - 1)), flags))
    }

    /// Rebuild from `regs` laid out as `[BAT0U, BAT0L, ..., BAT3U, BAT3L]`
    pub fn rebuild(&mut self, regs: &[u32], ram_size: u32) {
        self.entries.fill(0);

        for (index, pair) in regs.chunks_exact(2).enumerate() {
            let (batu, batl) = (pair[0], pair[1]);
            // Vs | Vp
            if batu & 0b11 == 0 {
                continue;
            }

            let block_mask = (batu >> 2) & 0x7FF;
            let bepi = batu >> BAT_PAGE_SHIFT;
            let brpn = batl >> BAT_PAGE_SHIFT;
            if bepi & block_mask != 0 {
                tracing::warn!("Bad BAT{} setup: BEPI 0x{:08x} overlaps BL 0x{:x}", index, batu, block_mask);
                continue;
            }
            if brpn & block_mask != 0 {
                tracing::warn!("Bad BAT{} setup: BRPN 0x{:08x} overlaps BL 0x{:x}", index, batl, block_mask);
                continue;
            }

            let caching = PageFlags::from_wimg((batl >> 3) & 0xF);
            for j in 0..=block_mask {
                if j & !block_mask != 0 {
                    continue;
                }
                let physical = (brpn | j) << BAT_PAGE_SHIFT;
                let mut flags = PageFlags::MAPPED | caching;
                if physical & RAM_REGION_MASK == 0
                    && physical as u64 + BAT_PAGE_SIZE as u64 <= ram_size as u64
                {
                    flags |= PageFlags::RAM;
                }
                self.entries[(bepi | j) as usize] = physical | flags.bits();
            }
        }
    }
}

impl Default for BatTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a BAT upper word
pub fn batu(effective: u32, block_len: u32, supervisor: bool, user: bool) -> u32 {
    let bl = (block_len / BAT_PAGE_SIZE).saturating_sub(1) & 0x7FF;
    (effective & 0xFFFE_0000) | (bl << 2) | ((supervisor as u32) << 1) | user as u32
}

/// Build a BAT lower word
pub fn batl(physical: u32, wimg: u32, pp: u32) -> u32 {
    (physical & 0xFFFE_0000) | ((wimg & 0xF) << 3) | (pp & 0b11)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table() {
        let table = BatTable::new();
        assert_eq!(table.lookup(0x8000_0000), None);
    }

    #[test]
    fn test_cached_mirror() {
        let mut table = BatTable::new();
        let regs = [batu(0x8000_0000, 0x1000_0000, true, false), batl(0, 0b0010, 2), 0, 0, 0, 0, 0, 0];
        table.rebuild(&regs, 0x0180_0000);

        let (physical, flags) = table.lookup(0x8012_3456).unwrap();
        assert_eq!(physical, 0x0012_3456);
        assert!(flags.is_fastmem());

        // Beyond RAM but still inside the 256 MB block
        let (physical, flags) = table.lookup(0x8C00_3000).unwrap();
        assert_eq!(physical, 0x0C00_3000);
        assert!(!flags.contains(PageFlags::RAM));

        assert_eq!(table.lookup(0x9000_0000), None);
    }

    #[test]
    fn test_uncached_mirror_not_fastmem() {
        let mut table = BatTable::new();
        let regs = [batu(0xC000_0000, 0x1000_0000, true, false), batl(0, 0b0101, 2), 0, 0, 0, 0, 0, 0];
        table.rebuild(&regs, 0x0180_0000);
        let (physical, flags) = table.lookup(0xC000_0040).unwrap();
        assert_eq!(physical, 0x40);
        assert!(flags.contains(PageFlags::WRITE_THROUGH));
        assert!(!flags.is_fastmem());
    }

    #[test]
    fn test_invalid_bat_ignored() {
        let mut table = BatTable::new();
        // BEPI overlapping the block-length mask is rejected
        let regs = [batu(0x8002_0000, 0x0004_0000, true, false), batl(0, 0, 2), 0, 0, 0, 0, 0, 0];
        table.rebuild(&regs, 0x0180_0000);
        assert_eq!(table.lookup(0x8002_0000), None);
    }
}
