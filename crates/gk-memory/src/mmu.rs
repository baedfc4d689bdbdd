//! Effective-to-physical translation
//!
//! Translation order is BAT, then TLB, then the hashed page table located by
//! SDR1. A page table hit updates the referenced/changed bits in guest memory
//! and refills the TLB.

use gk_core::error::StateError;
use gk_core::savestate::{ReadLeExt, WriteLeExt};

use crate::access::{AccessKind, DsiReason, MemoryFault};
use crate::bat::BatTable;
use crate::constants::{PAGE_SHIFT, PAGE_SIZE, TLB_SETS, TLB_WAYS};
use crate::pages::PageFlags;
use crate::physical::PhysicalMemory;

/// Number of BAT registers (IBAT0U..IBAT3L then DBAT0U..DBAT3L)
pub const BAT_REGISTER_COUNT: usize = 16;
/// Number of segment registers
pub const SEGMENT_COUNT: usize = 16;

const TLB_INVALID: u32 = u32::MAX;

const SR_T: u32 = 0x8000_0000;
const PTE_VALID: u32 = 0x8000_0000;
const PTE_HASH: u32 = 0x40;
const PTE_REFERENCED: u32 = 0x100;
const PTE_CHANGED: u32 = 0x80;
const PTE_RPN_MASK: u32 = 0xFFFF_F000;

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    tag: u32,
    paddr: u32,
    pte2: u32,
}

impl TlbEntry {
    const EMPTY: Self = Self {
        tag: TLB_INVALID,
        paddr: 0,
        pte2: 0,
    };
}

#[derive(Clone)]
struct Tlb {
    sets: [[TlbEntry; TLB_WAYS]; TLB_SETS],
    recent: [u8; TLB_SETS],
}

impl Tlb {
    fn new() -> Self {
        Self {
            sets: [[TlbEntry::EMPTY; TLB_WAYS]; TLB_SETS],
            recent: [0; TLB_SETS],
        }
    }

    #[inline]
    fn set_index(ea: u32) -> usize {
        ((ea >> PAGE_SHIFT) as usize) & (TLB_SETS - 1)
    }

    /// Look up a page; a store to a page whose C bit is clear misses so the
    /// walk can set it
    fn lookup(&mut self, ea: u32, write: bool, touch: bool) -> Option<(u32, u32)> {
        let set = Self::set_index(ea);
        let tag = ea >> PAGE_SHIFT;
        for way in 0..TLB_WAYS {
            let entry = self.sets[set][way];
            if entry.tag != tag {
                continue;
            }
            if write && entry.pte2 & PTE_CHANGED == 0 {
                return None;
            }
            if touch {
                self.recent[set] = way as u8;
            }
            return Some((entry.paddr | (ea & (PAGE_SIZE - 1)), entry.pte2));
        }
        None
    }

    fn insert(&mut self, ea: u32, paddr: u32, pte2: u32) {
        let set = Self::set_index(ea);
        let tag = ea >> PAGE_SHIFT;
        let way = match self.sets[set].iter().position(|e| e.tag == tag) {
            Some(way) => way,
            None if self.recent[set] == 0 && self.sets[set][0].tag != TLB_INVALID => 1,
            None => 0,
        };
        self.sets[set][way] = TlbEntry { tag, paddr, pte2 };
        self.recent[set] = way as u8;
    }

    fn invalidate_set(&mut self, ea: u32) {
        let set = Self::set_index(ea);
        self.sets[set] = [TlbEntry::EMPTY; TLB_WAYS];
    }

    fn flush(&mut self) {
        self.sets = [[TlbEntry::EMPTY; TLB_WAYS]; TLB_SETS];
        self.recent = [0; TLB_SETS];
    }
}

/// A successful translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub physical: u32,
    pub flags: PageFlags,
    /// Came from a BAT (eligible for fastmem)
    pub block: bool,
}

/// Translation registers restored from a savestate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuSnapshot {
    pub bat_regs: [u32; BAT_REGISTER_COUNT],
    pub sr: [u32; SEGMENT_COUNT],
    pub sdr1: u32,
}

impl MmuSnapshot {
    /// Serialize to a savestate payload
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), StateError> {
        for &reg in self.bat_regs.iter().chain(self.sr.iter()) {
            out.write_u32_le(reg)?;
        }
        out.write_u32_le(self.sdr1)
    }

    /// Parse from a savestate payload
    pub fn decode(mut payload: &[u8]) -> Result<Self, StateError> {
        let mut bat_regs = [0u32; BAT_REGISTER_COUNT];
        for reg in bat_regs.iter_mut() {
            *reg = payload.read_u32_le()?;
        }
        let mut sr = [0u32; SEGMENT_COUNT];
        for reg in sr.iter_mut() {
            *reg = payload.read_u32_le()?;
        }
        let sdr1 = payload.read_u32_le()?;
        gk_core::savestate::expect_consumed(payload, "MMU")?;
        Ok(Self { bat_regs, sr, sdr1 })
    }
}

/// Memory management unit: BATs, segment registers, TLBs and page table
pub struct Mmu {
    bat_regs: [u32; BAT_REGISTER_COUNT],
    sr: [u32; SEGMENT_COUNT],
    sdr1: u32,
    ibat: BatTable,
    dbat: BatTable,
    itlb: Tlb,
    dtlb: Tlb,
    ram_size: u32,
}

impl Mmu {
    /// Create an MMU with every translation register cleared
    pub fn new(ram_size: u32) -> Self {
        Self {
            bat_regs: [0; BAT_REGISTER_COUNT],
            sr: [0; SEGMENT_COUNT],
            sdr1: 0,
            ibat: BatTable::new(),
            dbat: BatTable::new(),
            itlb: Tlb::new(),
            dtlb: Tlb::new(),
            ram_size,
        }
    }

    /// BAT register by index (0..8 instruction, 8..16 data)
    pub fn bat(&self, index: usize) -> u32 {
        self.bat_regs[index % BAT_REGISTER_COUNT]
    }

    /// Write a BAT register and rebuild the affected table
    pub fn set_bat(&mut self, index: usize, value: u32) {
        let index = index % BAT_REGISTER_COUNT;
        if self.bat_regs[index] == value {
            return;
        }
        self.bat_regs[index] = value;
        if index < 8 {
            self.ibat.rebuild(&self.bat_regs[..8], self.ram_size);
        } else {
            self.dbat.rebuild(&self.bat_regs[8..], self.ram_size);
        }
        gk_core::mmu_debug!("BAT{} <- 0x{:08x}", index, value);
    }

    /// Segment register
    pub fn sr(&self, index: usize) -> u32 {
        self.sr[index % SEGMENT_COUNT]
    }

    /// Write a segment register; flushes both TLBs
    pub fn set_sr(&mut self, index: usize, value: u32) {
        self.sr[index % SEGMENT_COUNT] = value;
        self.itlb.flush();
        self.dtlb.flush();
    }

    /// SDR1
    pub fn sdr1(&self) -> u32 {
        self.sdr1
    }

    /// Write SDR1; flushes both TLBs
    pub fn set_sdr1(&mut self, value: u32) {
        self.sdr1 = value;
        self.itlb.flush();
        self.dtlb.flush();
        gk_core::mmu_debug!(
            "SDR1 <- 0x{:08x} (htab 0x{:08x}, mask 0x{:x})",
            value,
            self.pagetable_base(),
            self.pagetable_hashmask()
        );
    }

    /// Invalidate the TLB set that `ea` maps to (`tlbie`)
    pub fn tlbie(&mut self, ea: u32) {
        self.itlb.invalidate_set(ea);
        self.dtlb.invalidate_set(ea);
    }

    /// Drop every cached translation
    pub fn flush_tlb(&mut self) {
        self.itlb.flush();
        self.dtlb.flush();
    }

    #[inline]
    fn pagetable_base(&self) -> u32 {
        self.sdr1 & 0xFFFF_0000
    }

    #[inline]
    fn pagetable_hashmask(&self) -> u32 {
        ((self.sdr1 & 0x1FF) << 10) | 0x3FF
    }

    /// BAT lookup for an access kind
    #[inline]
    pub fn block_lookup(&self, ea: u32, kind: AccessKind) -> Option<(u32, PageFlags)> {
        match kind {
            AccessKind::Fetch => self.ibat.lookup(ea),
            AccessKind::Read | AccessKind::Write => self.dbat.lookup(ea),
        }
    }

    /// Translate with side effects (TLB refill, R/C bit updates)
    pub fn translate(
        &mut self,
        ea: u32,
        kind: AccessKind,
        phys: &mut PhysicalMemory,
    ) -> Result<Translation, MemoryFault> {
        self.translate_inner(ea, kind, phys, true)
    }

    /// Translate without touching the TLB or the page table
    pub fn peek_translate(
        &mut self,
        ea: u32,
        kind: AccessKind,
        phys: &mut PhysicalMemory,
    ) -> Result<Translation, MemoryFault> {
        self.translate_inner(ea, kind, phys, false)
    }

    fn translate_inner(
        &mut self,
        ea: u32,
        kind: AccessKind,
        phys: &mut PhysicalMemory,
        update: bool,
    ) -> Result<Translation, MemoryFault> {
        if let Some((physical, flags)) = self.block_lookup(ea, kind) {
            return Ok(Translation {
                physical,
                flags,
                block: true,
            });
        }

        let write = kind == AccessKind::Write;
        let tlb = match kind {
            AccessKind::Fetch => &mut self.itlb,
            _ => &mut self.dtlb,
        };
        if let Some((physical, pte2)) = tlb.lookup(ea, write, update) {
            return Ok(self.page_translation(physical, pte2));
        }

        let sr = self.sr[(ea >> 28) as usize];
        if sr & SR_T != 0 {
            gk_core::mmu_trace!("Direct-store segment access at 0x{:08x}", ea);
            return Err(Self::fault(ea, kind, DsiReason::DirectStore));
        }

        match self.walk_page_table(ea, sr, write, phys, update) {
            Some((paddr, pte2)) => {
                if update {
                    let tlb = match kind {
                        AccessKind::Fetch => &mut self.itlb,
                        _ => &mut self.dtlb,
                    };
                    tlb.insert(ea, paddr, pte2);
                }
                Ok(self.page_translation(paddr | (ea & (PAGE_SIZE - 1)), pte2))
            }
            None => {
                gk_core::mmu_trace!("Page fault at 0x{:08x} ({:?})", ea, kind);
                Err(Self::fault(ea, kind, DsiReason::PageFault))
            }
        }
    }

    fn fault(ea: u32, kind: AccessKind, reason: DsiReason) -> MemoryFault {
        match kind {
            AccessKind::Fetch => MemoryFault::Isi { address: ea },
            AccessKind::Read => MemoryFault::Dsi {
                address: ea,
                write: false,
                reason,
            },
            AccessKind::Write => MemoryFault::Dsi {
                address: ea,
                write: true,
                reason,
            },
        }
    }

    fn page_translation(&self, physical: u32, pte2: u32) -> Translation {
        let mut flags = PageFlags::MAPPED | PageFlags::from_wimg((pte2 >> 3) & 0xF);
        if physical as u64 + PAGE_SIZE as u64 <= self.ram_size as u64 {
            flags |= PageFlags::RAM;
        }
        Translation {
            physical,
            flags,
            block: false,
        }
    }

    /// Hashed page table search; returns the page base and second PTE word
    fn walk_page_table(
        &self,
        ea: u32,
        sr: u32,
        write: bool,
        phys: &mut PhysicalMemory,
        update: bool,
    ) -> Option<(u32, u32)> {
        let vsid = sr & 0x00FF_FFFF;
        let page_index = (ea >> PAGE_SHIFT) & 0xFFFF;
        let api = (ea >> 22) & 0x3F;
        let mut hash = (vsid & 0x7_FFFF) ^ page_index;

        for secondary in [false, true] {
            if secondary {
                hash = !hash;
            }
            let pte1 = PTE_VALID | (vsid << 7) | (if secondary { PTE_HASH } else { 0 }) | api;
            let mut pteg = ((hash & self.pagetable_hashmask()) << 6) | self.pagetable_base();

            for _ in 0..8 {
                let Some(offset) = phys.ram_offset(pteg, 8) else {
                    break;
                };
                if phys.read_ram::<u32>(offset) == pte1 {
                    let mut pte2 = phys.read_ram::<u32>(offset + 4);
                    if update {
                        let mut updated = pte2 | PTE_REFERENCED;
                        if write {
                            updated |= PTE_CHANGED;
                        }
                        if updated != pte2 {
                            phys.write_ram::<u32>(offset + 4, updated);
                            pte2 = updated;
                        }
                    }
                    return Some((pte2 & PTE_RPN_MASK, pte2));
                }
                pteg = pteg.wrapping_add(8);
            }
        }
        None
    }

    /// Capture the translation registers
    pub fn snapshot(&self) -> MmuSnapshot {
        MmuSnapshot {
            bat_regs: self.bat_regs,
            sr: self.sr,
            sdr1: self.sdr1,
        }
    }

    /// Replace the translation registers and rebuild every derived table
    pub fn restore(&mut self, snapshot: &MmuSnapshot) {
        self.bat_regs = snapshot.bat_regs;
        self.sr = snapshot.sr;
        self.sdr1 = snapshot.sdr1;
        self.ibat.rebuild(&self.bat_regs[..8], self.ram_size);
        self.dbat.rebuild(&self.bat_regs[8..], self.ram_size);
        self.flush_tlb();
    }
}
