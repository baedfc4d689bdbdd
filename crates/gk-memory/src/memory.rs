//! Guest memory facade
//!
//! `GuestMemory` is what the interpreter and the JIT see: typed big-endian
//! accesses by effective address, with translation, alignment checks,
//! fastmem shortcuts and self-modifying-code tracking.

use gk_core::config::MemoryConfig;
use gk_core::error::MemoryError;

use crate::access::{AccessKind, MemoryFault, Primitive, TranslationMode};
use crate::codemap::WriteJournal;
use crate::constants::{BAT_PAGE_SIZE, CACHE_LINE_SIZE, PAGE_SIZE};
use crate::mmio::{MmioRead, MmioWrite};
use crate::mmu::{Mmu, MmuSnapshot};
use crate::pages::PageFlags;
use crate::physical::PhysicalMemory;
use crate::reservation::Reservation;

/// Guest memory: physical memory plus the MMU in front of it
pub struct GuestMemory {
    phys: PhysicalMemory,
    mmu: Mmu,
    strict_alignment: bool,
    fastmem_enabled: bool,
    translation_changed: bool,
    reservation: Reservation,
}

impl GuestMemory {
    /// Create guest memory with `ram_size` bytes of RAM
    pub fn new(ram_size: u32) -> Result<Self, MemoryError> {
        Ok(Self {
            phys: PhysicalMemory::new(ram_size)?,
            mmu: Mmu::new(ram_size),
            strict_alignment: false,
            fastmem_enabled: true,
            translation_changed: false,
            reservation: Reservation::new(),
        })
    }

    /// Create guest memory from the `[memory]` configuration section
    pub fn from_config(config: &MemoryConfig) -> Result<Self, MemoryError> {
        let mut memory = Self::new(config.ram_size)?;
        memory.fastmem_enabled = config.fastmem;
        memory.strict_alignment = config.strict_alignment;
        tracing::info!(
            "Guest memory: {} MB RAM, fastmem {} ({}), strict alignment {}",
            config.ram_size >> 20,
            config.fastmem,
            if memory.phys.arena().is_guarded() { "guarded" } else { "heap" },
            config.strict_alignment
        );
        Ok(memory)
    }

    /// Size of RAM in bytes
    pub fn ram_size(&self) -> u32 {
        self.phys.ram_size()
    }

    pub fn strict_alignment(&self) -> bool {
        self.strict_alignment
    }

    pub fn set_strict_alignment(&mut self, strict: bool) {
        self.strict_alignment = strict;
    }

    pub fn fastmem_enabled(&self) -> bool {
        self.fastmem_enabled
    }

    pub fn set_fastmem_enabled(&mut self, enabled: bool) {
        self.fastmem_enabled = enabled;
    }

    /// Translate an effective address to a physical one
    #[inline]
    pub fn translate(
        &mut self,
        ea: u32,
        kind: AccessKind,
        mode: TranslationMode,
    ) -> Result<u32, MemoryFault> {
        match mode {
            TranslationMode::Real => Ok(ea),
            TranslationMode::Virtual => self
                .mmu
                .translate(ea, kind, &mut self.phys)
                .map(|t| t.physical),
        }
    }

    #[inline]
    fn check_alignment(&self, ea: u32, size: usize) -> Result<(), MemoryFault> {
        if self.strict_alignment && ea as usize % size != 0 {
            gk_core::mmu_trace!("Misaligned {}-byte access at 0x{:08x}", size, ea);
            return Err(MemoryFault::Alignment { address: ea });
        }
        Ok(())
    }

    #[inline]
    fn crosses_page(ea: u32, size: usize) -> bool {
        (ea & (PAGE_SIZE - 1)) as usize + size > PAGE_SIZE as usize
    }

    /// Physical address of every byte of an access that straddles two pages
    fn split_translate(
        &mut self,
        ea: u32,
        size: usize,
        kind: AccessKind,
    ) -> Result<[u32; 8], MemoryFault> {
        let first = self.translate(ea, kind, TranslationMode::Virtual)?;
        let second_ea = ea.wrapping_add(size as u32 - 1) & !(PAGE_SIZE - 1);
        let second = self.translate(second_ea, kind, TranslationMode::Virtual)?;

        let mut addrs = [0u32; 8];
        for (i, slot) in addrs.iter_mut().take(size).enumerate() {
            let byte_ea = ea.wrapping_add(i as u32);
            *slot = if byte_ea & !(PAGE_SIZE - 1) == second_ea {
                second + (byte_ea - second_ea)
            } else {
                first + i as u32
            };
        }
        Ok(addrs)
    }

    /// Load a value
    pub fn read<T: Primitive>(&mut self, ea: u32, mode: TranslationMode) -> Result<T, MemoryFault> {
        self.check_alignment(ea, T::SIZE)?;
        if mode == TranslationMode::Virtual && Self::crosses_page(ea, T::SIZE) {
            let addrs = self.split_translate(ea, T::SIZE, AccessKind::Read)?;
            let mut bytes = [0u8; 8];
            for (byte, &addr) in bytes.iter_mut().zip(addrs.iter()).take(T::SIZE) {
                *byte = self.phys.read::<u8>(addr);
            }
            return Ok(T::from_be_slice(&bytes[..T::SIZE]));
        }
        let physical = self.translate(ea, AccessKind::Read, mode)?;
        Ok(self.phys.read::<T>(physical))
    }

    /// Store a value
    pub fn write<T: Primitive>(
        &mut self,
        ea: u32,
        value: T,
        mode: TranslationMode,
    ) -> Result<(), MemoryFault> {
        self.check_alignment(ea, T::SIZE)?;
        if mode == TranslationMode::Virtual && Self::crosses_page(ea, T::SIZE) {
            // Both pages must translate before any byte is written
            let addrs = self.split_translate(ea, T::SIZE, AccessKind::Write)?;
            let mut bytes = [0u8; 8];
            value.write_be(&mut bytes[..T::SIZE]);
            for (&byte, &addr) in bytes.iter().zip(addrs.iter()).take(T::SIZE) {
                self.phys.write::<u8>(addr, byte);
            }
            return Ok(());
        }
        let physical = self.translate(ea, AccessKind::Write, mode)?;
        self.phys.write::<T>(physical, value);
        Ok(())
    }

    /// Fetch an instruction word
    #[inline]
    pub fn fetch(&mut self, ea: u32, mode: TranslationMode) -> Result<u32, MemoryFault> {
        self.fetch_with_physical(ea, mode).map(|(inst, _)| inst)
    }

    /// Fetch an instruction word and report the RAM offset it came from
    pub fn fetch_with_physical(
        &mut self,
        ea: u32,
        mode: TranslationMode,
    ) -> Result<(u32, u32), MemoryFault> {
        if ea & 3 != 0 {
            return Err(MemoryFault::Isi { address: ea });
        }
        let physical = self.translate(ea, AccessKind::Fetch, mode)?;
        match self.phys.ram_offset(physical, 4) {
            Some(offset) => Ok((self.phys.read_ram::<u32>(offset), offset)),
            None => {
                gk_core::mmu_trace!("Fetch outside RAM at 0x{:08x} (phys 0x{:08x})", ea, physical);
                Err(MemoryFault::Isi { address: ea })
            }
        }
    }

    /// RAM offset for a fastmem-eligible access, `None` otherwise
    #[inline]
    fn fastmem_target(&self, ea: u32, size: usize, mode: TranslationMode) -> Option<u32> {
        if !self.fastmem_enabled || (self.strict_alignment && ea as usize % size != 0) {
            return None;
        }
        let physical = match mode {
            TranslationMode::Real => ea,
            TranslationMode::Virtual => {
                if (ea & (BAT_PAGE_SIZE - 1)) as usize + size > BAT_PAGE_SIZE as usize {
                    return None;
                }
                let (physical, flags) = self.mmu.block_lookup(ea, AccessKind::Read)?;
                if !flags.is_fastmem() {
                    return None;
                }
                physical
            }
        };
        self.phys.fastmem_offset(physical, size as u32)
    }

    /// Fastmem load; `None` when the access needs the slow path
    #[inline]
    pub fn fast_read<T: Primitive>(&self, ea: u32, mode: TranslationMode) -> Option<T> {
        let offset = self.fastmem_target(ea, T::SIZE, mode)?;
        Some(self.phys.read_ram::<T>(offset))
    }

    /// Fastmem store; `None` when the access needs the slow path
    #[inline]
    pub fn fast_write<T: Primitive>(&mut self, ea: u32, value: T, mode: TranslationMode) -> Option<()> {
        let offset = self.fastmem_target(ea, T::SIZE, mode)?;
        self.phys.write_ram::<T>(offset, value);
        Some(())
    }

    /// Side-effect-free load for debuggers (never touches MMIO)
    pub fn peek<T: Primitive>(&mut self, ea: u32, mode: TranslationMode) -> Option<T> {
        let physical = match mode {
            TranslationMode::Real => ea,
            TranslationMode::Virtual => {
                self.mmu
                    .peek_translate(ea, AccessKind::Read, &mut self.phys)
                    .ok()?
                    .physical
            }
        };
        if self.phys.is_mmio(physical, T::SIZE as u32) {
            return None;
        }
        let offset = self.phys.ram_offset(physical, T::SIZE as u32)?;
        Some(self.phys.read_ram::<T>(offset))
    }

    /// Zero the cache line containing `ea` (`dcbz`)
    ///
    /// Cache-inhibited targets raise an alignment fault.
    pub fn zero_line(&mut self, ea: u32, mode: TranslationMode) -> Result<(), MemoryFault> {
        let line = ea & !(CACHE_LINE_SIZE - 1);
        let physical = match mode {
            TranslationMode::Real => line,
            TranslationMode::Virtual => {
                let t = self.mmu.translate(line, AccessKind::Write, &mut self.phys)?;
                if t.flags.contains(PageFlags::CACHE_INHIBITED) {
                    return Err(MemoryFault::Alignment { address: ea });
                }
                t.physical
            }
        };
        for i in (0..CACHE_LINE_SIZE).step_by(8) {
            self.phys.write::<u64>(physical + i, 0);
        }
        Ok(())
    }

    /// Bulk copy out of physical RAM
    pub fn read_physical(&self, addr: u32, out: &mut [u8]) -> Result<(), MemoryError> {
        self.phys.read_bytes(addr, out)
    }

    /// Bulk copy into physical RAM (loaders, DMA)
    pub fn write_physical(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.phys.write_bytes(addr, data)
    }

    /// Register a device range on the MMIO bus
    pub fn register_mmio(
        &mut self,
        name: &str,
        base: u32,
        size: u32,
        read: MmioRead,
        write: MmioWrite,
    ) -> Result<(), MemoryError> {
        self.phys.register_mmio(name, base, size, read, write)
    }

    /// Mark a RAM range as backing translated code
    pub fn mark_code(&mut self, ram_offset: u32, len: u32) {
        self.phys.code_map_mut().mark(ram_offset, len);
    }

    /// Unmark all code (after the block cache was flushed)
    pub fn clear_code_marks(&mut self) {
        self.phys.code_map_mut().clear();
    }

    /// True when a write hit translated code since the last drain
    #[inline]
    pub fn code_written(&self) -> bool {
        self.phys.code_map().has_pending()
    }

    /// Drain pending code invalidations as `(ram_offset, len)` ranges
    pub fn take_invalidations(&mut self) -> Vec<(u32, u32)> {
        self.phys.code_map_mut().take_log()
    }

    /// Invalidate every translation (HID0 instruction cache flash invalidate)
    pub fn invalidate_all_code(&mut self) {
        let ram_size = self.phys.ram_size();
        self.phys.code_map_mut().push_invalidation(0, ram_size);
    }

    /// Invalidate the instruction cache block containing `ea` (`icbi`)
    pub fn invalidate_icache(&mut self, ea: u32, mode: TranslationMode) {
        let physical = match mode {
            TranslationMode::Real => Some(ea),
            TranslationMode::Virtual => self
                .mmu
                .peek_translate(ea, AccessKind::Fetch, &mut self.phys)
                .ok()
                .map(|t| t.physical),
        };
        if let Some(offset) = physical.and_then(|p| self.phys.ram_offset(p, 1)) {
            let line = offset & !(CACHE_LINE_SIZE - 1);
            self.phys.code_map_mut().push_invalidation(line, CACHE_LINE_SIZE);
        }
    }

    /// BAT register by index (0..8 instruction, 8..16 data)
    pub fn bat(&self, index: usize) -> u32 {
        self.mmu.bat(index)
    }

    /// Write a BAT register
    pub fn set_bat(&mut self, index: usize, value: u32) {
        if self.mmu.bat(index) != value {
            self.mmu.set_bat(index, value);
            self.translation_changed = true;
        }
    }

    /// Segment register
    pub fn sr(&self, index: usize) -> u32 {
        self.mmu.sr(index)
    }

    /// Write a segment register
    pub fn set_sr(&mut self, index: usize, value: u32) {
        self.mmu.set_sr(index, value);
        self.translation_changed = true;
    }

    pub fn sdr1(&self) -> u32 {
        self.mmu.sdr1()
    }

    /// Write SDR1
    pub fn set_sdr1(&mut self, value: u32) {
        self.mmu.set_sdr1(value);
        self.translation_changed = true;
    }

    /// Invalidate one TLB set (`tlbie`)
    pub fn tlbie(&mut self, ea: u32) {
        self.mmu.tlbie(ea);
        self.translation_changed = true;
    }

    /// Consume the "translation changed" flag
    pub fn take_translation_changed(&mut self) -> bool {
        std::mem::take(&mut self.translation_changed)
    }

    /// Start journaling RAM writes
    pub fn begin_journal(&mut self) {
        self.phys.begin_journal();
    }

    /// Stop journaling and return the journal
    pub fn end_journal(&mut self) -> Option<WriteJournal> {
        self.phys.end_journal()
    }

    /// Undo journaled writes
    pub fn rollback(&mut self, journal: &WriteJournal) {
        self.phys.rollback(journal);
    }

    /// Take a reservation for `lwarx`
    pub fn reserve(&mut self, ea: u32) {
        self.reservation.reserve(ea);
    }

    /// Check and drop the reservation for `stwcx.`
    pub fn check_and_clear_reservation(&mut self, ea: u32) -> bool {
        self.reservation.check_and_clear(ea)
    }

    /// Current reservation
    pub fn reservation(&self) -> Reservation {
        self.reservation
    }

    /// Replace the reservation (savestate restore, exception delivery)
    pub fn set_reservation(&mut self, reservation: Reservation) {
        self.reservation = reservation;
    }

    /// Whole RAM contents
    pub fn ram(&self) -> &[u8] {
        self.phys.ram()
    }

    /// Replace the whole RAM contents
    pub fn restore_ram(&mut self, data: &[u8]) -> Result<(), MemoryError> {
        self.phys.restore_ram(data)
    }

    /// Capture the MMU registers
    pub fn mmu_snapshot(&self) -> MmuSnapshot {
        self.mmu.snapshot()
    }

    /// Restore the MMU registers
    pub fn restore_mmu(&mut self, snapshot: &MmuSnapshot) {
        self.mmu.restore(snapshot);
        self.translation_changed = true;
    }

    /// Physical memory
    pub fn physical(&self) -> &PhysicalMemory {
        &self.phys
    }

    /// Mutable physical memory
    pub fn physical_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.phys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bat::{batl, batu};
    use TranslationMode::{Real, Virtual};

    fn create_test_env() -> GuestMemory {
        let mut mem = GuestMemory::new(0x0180_0000).unwrap();
        mem.set_bat(0, batu(0x8000_0000, 0x1000_0000, true, false));
        mem.set_bat(1, batl(0, 0, 2));
        mem.set_bat(8, batu(0x8000_0000, 0x1000_0000, true, false));
        mem.set_bat(9, batl(0, 0, 2));
        mem.set_bat(10, batu(0xC000_0000, 0x1000_0000, true, false));
        mem.set_bat(11, batl(0, 0b0101, 2));
        mem.take_translation_changed();
        mem
    }

    #[test]
    fn test_real_and_mirrored_access() {
        let mut mem = create_test_env();
        mem.write::<u32>(0x100, 0x1234_5678, Real).unwrap();
        assert_eq!(mem.read::<u32>(0x8000_0100, Virtual).unwrap(), 0x1234_5678);
        assert_eq!(mem.read::<u32>(0xC000_0100, Virtual).unwrap(), 0x1234_5678);
        assert_eq!(mem.read::<u16>(0x8000_0102, Virtual).unwrap(), 0x5678);
    }

    #[test]
    fn test_unmapped_virtual_faults() {
        let mut mem = create_test_env();
        assert!(matches!(
            mem.read::<u32>(0x4000_0000, Virtual),
            Err(MemoryFault::Dsi { address: 0x4000_0000, write: false, .. })
        ));
        assert!(matches!(
            mem.write::<u8>(0x4000_0000, 1, Virtual),
            Err(MemoryFault::Dsi { write: true, .. })
        ));
        assert_eq!(
            mem.fetch(0x4000_0000, Virtual),
            Err(MemoryFault::Isi { address: 0x4000_0000 })
        );
        // Instruction BATs map the cached mirror only
        assert!(mem.fetch(0x8000_0000, Virtual).is_ok());
        assert!(mem.fetch(0xC000_0000, Virtual).is_err());
    }

    #[test]
    fn test_strict_alignment() {
        let mut mem = create_test_env();
        mem.write::<u32>(0x200, 0xAABB_CCDD, Real).unwrap();
        assert_eq!(mem.read::<u32>(0x201, Real).unwrap(), 0xBBCC_DD00);

        mem.set_strict_alignment(true);
        assert_eq!(
            mem.read::<u32>(0x8000_0201, Virtual),
            Err(MemoryFault::Alignment { address: 0x8000_0201 })
        );
        assert_eq!(mem.fast_read::<u32>(0x201, Real), None);
        assert_eq!(mem.read::<u8>(0x201, Real).unwrap(), 0xBB);
    }

    #[test]
    fn test_page_crossing_store_is_all_or_nothing() {
        let mut mem = create_test_env();
        // 0x8001_FFFE is the last halfword of the first 128 KB BAT page and
        // still inside the BAT block, so both halves translate
        mem.write::<u32>(0x8001_FFFE, 0x0102_0304, Virtual).unwrap();
        assert_eq!(mem.read::<u32>(0x8001_FFFE, Virtual).unwrap(), 0x0102_0304);

        // 0x8FFF_FFFE crosses out of the BAT block into unmapped space
        let err = mem.write::<u32>(0x8FFF_FFFE, 0xFFFF_FFFF, Virtual).unwrap_err();
        assert!(matches!(err, MemoryFault::Dsi { address: 0x9000_0000, write: true, .. }));
    }

    #[test]
    fn test_fastmem_paths() {
        let mut mem = create_test_env();
        mem.write::<u32>(0x300, 7, Real).unwrap();
        assert_eq!(mem.fast_read::<u32>(0x300, Real), Some(7));
        assert_eq!(mem.fast_read::<u32>(0x8000_0300, Virtual), Some(7));
        // Cache-inhibited mirror goes through the slow path
        assert_eq!(mem.fast_read::<u32>(0xC000_0300, Virtual), None);
        // Hardware registers are never fastmem
        assert_eq!(mem.fast_read::<u32>(0x0C00_3000, Real), None);

        mem.fast_write::<u32>(0x8000_0304, 9, Virtual).unwrap();
        assert_eq!(mem.read::<u32>(0x304, Real).unwrap(), 9);

        mem.set_fastmem_enabled(false);
        assert_eq!(mem.fast_read::<u32>(0x300, Real), None);
    }

    #[test]
    fn test_code_tracking_through_every_path() {
        let mut mem = create_test_env();
        mem.mark_code(0x1000, 0x20);

        mem.fast_write::<u32>(0x8000_1000, 1, Virtual).unwrap();
        assert!(mem.code_written());
        assert_eq!(mem.take_invalidations(), vec![(0x1000, 0x20)]);
        assert!(!mem.code_written());

        mem.write::<u8>(0xC000_1004, 1, Virtual).unwrap();
        assert_eq!(mem.take_invalidations(), vec![(0x1000, 0x20)]);

        mem.write_physical(0x1010, &[0; 4]).unwrap();
        assert_eq!(mem.take_invalidations(), vec![(0x1000, 0x20)]);

        mem.invalidate_icache(0x8000_5004, Virtual);
        assert_eq!(mem.take_invalidations(), vec![(0x5000, 0x20)]);
    }

    #[test]
    fn test_translation_changed_flag() {
        let mut mem = create_test_env();
        assert!(!mem.take_translation_changed());
        mem.set_bat(9, batl(0, 0, 2));
        assert!(!mem.take_translation_changed());
        mem.set_bat(2, batu(0x9000_0000, 0x0002_0000, true, false));
        assert!(mem.take_translation_changed());
        mem.set_sdr1(0x0010_0000);
        assert!(mem.take_translation_changed());
        assert!(!mem.take_translation_changed());
    }

    #[test]
    fn test_peek_skips_mmio() {
        let mut mem = create_test_env();
        mem.register_mmio("pi", 0x0C00_3000, 0x100, Box::new(|_, _| 5), Box::new(|_, _, _| {}))
            .unwrap();
        assert_eq!(mem.read::<u32>(0x0C00_3000, Real).unwrap(), 5);
        assert_eq!(mem.peek::<u32>(0x0C00_3000, Real), None);
        mem.write::<u32>(0x20, 3, Real).unwrap();
        assert_eq!(mem.peek::<u32>(0x8000_0020, Virtual), Some(3));
    }

    #[test]
    fn test_zero_line() {
        let mut mem = create_test_env();
        mem.write_physical(0x400, &[0xFF; 0x40]).unwrap();
        mem.zero_line(0x8000_0424, Virtual).unwrap();
        assert_eq!(mem.read::<u32>(0x400, Real).unwrap(), 0xFFFF_FFFF);
        assert_eq!(mem.read::<u64>(0x420, Real).unwrap(), 0);
        assert_eq!(mem.read::<u64>(0x438, Real).unwrap(), 0);
        assert_eq!(mem.read::<u32>(0x440, Real).unwrap(), 0);

        assert_eq!(
            mem.zero_line(0xC000_0400, Virtual),
            Err(MemoryFault::Alignment { address: 0xC000_0400 })
        );
    }

    #[test]
    fn test_reservation() {
        let mut mem = create_test_env();
        mem.reserve(0x8000_0100);
        assert!(mem.check_and_clear_reservation(0x8000_0104));
        assert!(!mem.check_and_clear_reservation(0x8000_0104));
    }
}
