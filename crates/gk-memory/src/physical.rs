//! Physical address space: RAM arena, MMIO bus, code map and write journal

use gk_core::error::MemoryError;

use crate::access::Primitive;
use crate::arena::FastmemArena;
use crate::codemap::{CodeMap, WriteJournal};
use crate::constants::{PAGE_SIZE, RAM_REGION_MASK};
use crate::mmio::{MmioBus, MmioRead, MmioWrite};

/// Physical memory of the emulated machine
pub struct PhysicalMemory {
    ram: FastmemArena,
    ram_size: u32,
    ram_mask: u32,
    mmio: MmioBus,
    code: CodeMap,
    journal: Option<WriteJournal>,
    /// RAM pages claimed by MMIO registrations; never served by fastmem
    fastmem_holes: Vec<(u32, u32)>,
}

impl PhysicalMemory {
    /// Create physical memory with `ram_size` bytes of RAM
    pub fn new(ram_size: u32) -> Result<Self, MemoryError> {
        let ram = FastmemArena::new(ram_size as usize)?;
        Ok(Self {
            ram,
            ram_size,
            ram_mask: ram_size.next_power_of_two().wrapping_sub(1),
            mmio: MmioBus::new(),
            code: CodeMap::new(ram_size),
            journal: None,
            fastmem_holes: Vec::new(),
        })
    }

    /// Size of RAM in bytes
    pub fn ram_size(&self) -> u32 {
        self.ram_size
    }

    /// RAM offset for a physical access, honoring mirrors
    #[inline]
    pub fn ram_offset(&self, addr: u32, len: u32) -> Option<u32> {
        if addr & RAM_REGION_MASK != 0 {
            return None;
        }
        let offset = addr & self.ram_mask;
        (offset as u64 + len as u64 <= self.ram_size as u64).then_some(offset)
    }

    /// RAM offset for a fastmem access; `None` for anything the slow path
    /// must handle
    #[inline]
    pub fn fastmem_offset(&self, addr: u32, len: u32) -> Option<u32> {
        let offset = self.ram_offset(addr, len)?;
        if !self.fastmem_holes.is_empty()
            && self
                .fastmem_holes
                .iter()
                .any(|&(start, size)| offset < start + size && start < offset + len)
        {
            return None;
        }
        Some(offset)
    }

    /// Device address serving `addr`, looking through RAM mirrors
    #[inline]
    fn mmio_target(&self, addr: u32, len: u32) -> Option<u32> {
        if self.mmio.contains(addr) {
            return Some(addr);
        }
        self.ram_offset(addr, len).filter(|&offset| self.mmio.contains(offset))
    }

    /// True when a device claims `addr` directly or through a RAM mirror
    #[inline]
    pub fn is_mmio(&self, addr: u32, len: u32) -> bool {
        self.mmio_target(addr, len).is_some()
    }

    /// Read a value (MMIO first, then RAM)
    pub fn read<T: Primitive>(&mut self, addr: u32) -> T {
        if let Some(addr) = self.mmio_target(addr, T::SIZE as u32) {
            if let Some(journal) = self.journal.as_mut() {
                journal.note_mmio();
            }
            let value = self.mmio.read(addr, T::WIDTH).unwrap_or(0);
            return T::from_u64(value);
        }
        match self.ram_offset(addr, T::SIZE as u32) {
            Some(offset) => self.read_ram(offset),
            None => {
                tracing::warn!("Unmapped physical read{} at 0x{:08x}", T::SIZE * 8, addr);
                T::default()
            }
        }
    }

    /// Write a value (MMIO first, then RAM)
    pub fn write<T: Primitive>(&mut self, addr: u32, value: T) {
        if let Some(addr) = self.mmio_target(addr, T::SIZE as u32) {
            if let Some(journal) = self.journal.as_mut() {
                journal.note_mmio();
            }
            self.mmio.write(addr, T::WIDTH, value.to_u64());
            return;
        }
        match self.ram_offset(addr, T::SIZE as u32) {
            Some(offset) => self.write_ram(offset, value),
            None => {
                tracing::warn!(
                    "Unmapped physical write{} at 0x{:08x} (value 0x{:x})",
                    T::SIZE * 8,
                    addr,
                    value.to_u64()
                );
            }
        }
    }

    /// Read RAM at an offset already validated by `ram_offset`
    #[inline]
    pub fn read_ram<T: Primitive>(&self, offset: u32) -> T {
        let start = offset as usize;
        T::from_be_slice(&self.ram.as_slice()[start..start + T::SIZE])
    }

    /// Write RAM at an offset already validated by `ram_offset`
    #[inline]
    pub fn write_ram<T: Primitive>(&mut self, offset: u32, value: T) {
        let start = offset as usize;
        if let Some(journal) = self.journal.as_mut() {
            let old = &self.ram.as_slice()[start..start + T::SIZE];
            for (i, &byte) in old.iter().enumerate() {
                journal.record(offset + i as u32, byte);
            }
        }
        value.write_be(&mut self.ram.as_mut_slice()[start..start + T::SIZE]);
        self.code.on_write(offset, T::SIZE as u32);
    }

    /// Copy bytes out of RAM
    pub fn read_bytes(&self, addr: u32, out: &mut [u8]) -> Result<(), MemoryError> {
        let offset = self
            .ram_offset(addr, out.len() as u32)
            .ok_or(MemoryError::OutOfRange { addr, len: out.len() as u32 })?;
        let start = offset as usize;
        out.copy_from_slice(&self.ram.as_slice()[start..start + out.len()]);
        Ok(())
    }

    /// Copy bytes into RAM (loaders, DMA); invalidates overlapping code
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let len = u32::try_from(data.len())
            .map_err(|_| MemoryError::OutOfRange { addr, len: u32::MAX })?;
        let offset = self
            .ram_offset(addr, len)
            .ok_or(MemoryError::OutOfRange { addr, len })?;
        let start = offset as usize;
        self.ram.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
        self.code.on_write(offset, len);
        Ok(())
    }

    /// Register a device range
    pub fn register_mmio(
        &mut self,
        name: &str,
        base: u32,
        size: u32,
        read: MmioRead,
        write: MmioWrite,
    ) -> Result<(), MemoryError> {
        // Ranges inside RAM are keyed by their canonical address
        let base = self.ram_offset(base, 1).unwrap_or(base);
        self.mmio.register(name, base, size, read, write)?;
        if let Some(offset) = self.ram_offset(base, 1) {
            let start = offset & !(PAGE_SIZE - 1);
            let end = (offset + size).next_multiple_of(PAGE_SIZE);
            self.fastmem_holes.push((start, end - start));
        }
        Ok(())
    }

    /// MMIO bus
    pub fn mmio(&self) -> &MmioBus {
        &self.mmio
    }

    /// Whole RAM contents
    pub fn ram(&self) -> &[u8] {
        self.ram.as_slice()
    }

    /// Replace the whole RAM contents (savestate restore)
    pub fn restore_ram(&mut self, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() != self.ram_size as usize {
            return Err(MemoryError::OutOfRange {
                addr: 0,
                len: data.len() as u32,
            });
        }
        self.ram.as_mut_slice().copy_from_slice(data);
        Ok(())
    }

    /// Host arena (for fastmem bookkeeping)
    pub fn arena(&self) -> &FastmemArena {
        &self.ram
    }

    /// Code map
    pub fn code_map(&self) -> &CodeMap {
        &self.code
    }

    /// Mutable code map
    pub fn code_map_mut(&mut self) -> &mut CodeMap {
        &mut self.code
    }

    /// Start recording old bytes of every RAM write
    pub fn begin_journal(&mut self) {
        self.journal = Some(WriteJournal::default());
    }

    /// Stop recording and return the journal
    pub fn end_journal(&mut self) -> Option<WriteJournal> {
        self.journal.take()
    }

    /// Undo every write recorded in `journal`
    pub fn rollback(&mut self, journal: &WriteJournal) {
        let ram = self.ram.as_mut_slice();
        for &(offset, old) in journal.entries().iter().rev() {
            ram[offset as usize] = old;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn create_test_env() -> PhysicalMemory {
        PhysicalMemory::new(0x0180_0000).unwrap()
    }

    #[test]
    fn test_ram_read_write() {
        let mut mem = create_test_env();
        mem.write::<u32>(0x100, 0xDEAD_BEEF);
        assert_eq!(mem.read::<u32>(0x100), 0xDEAD_BEEF);
        assert_eq!(mem.read::<u8>(0x100), 0xDE);
        assert_eq!(mem.read::<u16>(0x102), 0xBEEF);
        mem.write::<u64>(0x200, 0x0102_0304_0506_0708);
        assert_eq!(mem.read::<u32>(0x204), 0x0506_0708);
    }

    #[test]
    fn test_ram_mirror_and_unmapped() {
        let mut mem = create_test_env();
        assert_eq!(mem.ram_offset(0x0000_1000, 4), Some(0x1000));
        assert_eq!(mem.ram_offset(0x0200_1000, 4), Some(0x1000));
        assert_eq!(mem.ram_offset(0x017F_FFFE, 4), None);
        assert_eq!(mem.ram_offset(0x0C00_0000, 4), None);
        // Unmapped reads return zero and writes are dropped
        mem.write::<u32>(0x0E00_0000, 5);
        assert_eq!(mem.read::<u32>(0x0E00_0000), 0);
    }

    #[test]
    fn test_mmio_precedes_ram() {
        let mut mem = create_test_env();
        let reg = Arc::new(AtomicU32::new(0));
        let r = reg.clone();
        let w = reg.clone();
        mem.register_mmio(
            "shadow",
            0x0000_2000,
            0x10,
            Box::new(move |_, _| r.load(Ordering::SeqCst) as u64),
            Box::new(move |_, _, v| w.store(v as u32, Ordering::SeqCst)),
        )
        .unwrap();

        mem.write::<u32>(0x2000, 77);
        assert_eq!(reg.load(Ordering::SeqCst), 77);
        assert_eq!(mem.read::<u32>(0x2000), 77);
        // RAM underneath is untouched and the page left the fastmem path
        assert_eq!(mem.read_ram::<u32>(0x2000), 0);
        assert_eq!(mem.fastmem_offset(0x2004, 4), None);
        assert_eq!(mem.fastmem_offset(0x3000, 4), Some(0x3000));
    }

    #[test]
    fn test_mmio_reached_through_ram_mirror() {
        let mut mem = create_test_env();
        let reg = Arc::new(AtomicU32::new(0));
        let r = reg.clone();
        let w = reg.clone();
        mem.register_mmio(
            "shadow",
            0x0000_2000,
            0x10,
            Box::new(move |_, _| r.load(Ordering::SeqCst) as u64),
            Box::new(move |_, _, v| w.store(v as u32, Ordering::SeqCst)),
        )
        .unwrap();

        mem.write::<u32>(0x0200_2004, 9);
        assert_eq!(reg.load(Ordering::SeqCst), 9);
        assert_eq!(mem.read::<u32>(0x0200_2004), 9);
        assert_eq!(mem.read_ram::<u32>(0x2004), 0);
        assert_eq!(mem.fastmem_offset(0x0200_2004, 4), None);
    }

    #[test]
    fn test_code_write_logged() {
        let mut mem = create_test_env();
        mem.code_map_mut().mark(0x8000, 0x40);
        mem.write::<u32>(0x9000, 1);
        assert!(!mem.code_map().has_pending());
        mem.write::<u32>(0x8010, 1);
        assert!(mem.code_map().has_pending());
        assert_eq!(mem.code_map_mut().take_log(), vec![(0x8000, 0x20)]);

        mem.write_bytes(0x8020, &[0; 8]).unwrap();
        assert_eq!(mem.code_map_mut().take_log(), vec![(0x8020, 0x20)]);
    }

    #[test]
    fn test_journal_rollback() {
        let mut mem = create_test_env();
        mem.write::<u32>(0x40, 0x1111_1111);
        mem.begin_journal();
        mem.write::<u32>(0x40, 0x2222_2222);
        mem.write::<u16>(0x42, 0x3333);
        let journal = mem.end_journal().unwrap();
        assert_eq!(mem.read::<u32>(0x40), 0x2222_3333);
        mem.rollback(&journal);
        assert_eq!(mem.read::<u32>(0x40), 0x1111_1111);
        assert_eq!(journal.written_offsets(), vec![0x40, 0x41, 0x42, 0x43]);
    }

    #[test]
    fn test_bulk_copy_bounds() {
        let mut mem = create_test_env();
        mem.write_bytes(0x10, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        mem.read_bytes(0x10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(mem.write_bytes(0x017F_FFFF, &[0, 0]).is_err());
    }
}
