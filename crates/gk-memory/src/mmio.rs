//! Memory-mapped I/O dispatch
//!
//! Device emulation registers a physical range with a read/write callback
//! pair. Callbacks run synchronously on the CPU thread and receive the offset
//! into their range.

use gk_core::error::MemoryError;

use crate::access::AccessWidth;

/// MMIO read callback: `(offset, width) -> value`
pub type MmioRead = Box<dyn FnMut(u32, AccessWidth) -> u64 + Send>;
/// MMIO write callback: `(offset, width, value)`
pub type MmioWrite = Box<dyn FnMut(u32, AccessWidth, u64) + Send>;

struct MmioRegion {
    name: String,
    base: u32,
    size: u32,
    read: MmioRead,
    write: MmioWrite,
}

impl MmioRegion {
    fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }
}

/// Registered device ranges, sorted by base address
#[derive(Default)]
pub struct MmioBus {
    regions: Vec<MmioRegion>,
}

impl MmioBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device range
    pub fn register(
        &mut self,
        name: &str,
        base: u32,
        size: u32,
        read: MmioRead,
        write: MmioWrite,
    ) -> Result<(), MemoryError> {
        if size == 0 || base as u64 + size as u64 > 1 << 32 {
            return Err(MemoryError::InvalidMmioRange { base, size });
        }
        if self.overlaps(base, size) {
            return Err(MemoryError::MmioOverlap { base, size });
        }

        let index = self.regions.partition_point(|r| r.base < base);
        self.regions.insert(
            index,
            MmioRegion {
                name: name.to_string(),
                base,
                size,
                read,
                write,
            },
        );
        tracing::debug!("Registered MMIO '{}' at 0x{:08x}+0x{:x}", name, base, size);
        Ok(())
    }

    fn find(&self, addr: u32) -> Option<usize> {
        let index = self.regions.partition_point(|r| r.base <= addr);
        if index == 0 {
            return None;
        }
        let region = &self.regions[index - 1];
        ((addr as u64) < region.end()).then_some(index - 1)
    }

    /// True when `addr` falls inside a registered range
    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        !self.regions.is_empty() && self.find(addr).is_some()
    }

    /// True when any registered range intersects `[start, start + len)`
    pub fn overlaps(&self, start: u32, len: u32) -> bool {
        let end = start as u64 + len as u64;
        self.regions
            .iter()
            .any(|r| (r.base as u64) < end && (start as u64) < r.end())
    }

    /// Dispatch a read; `None` when no device claims the address
    pub fn read(&mut self, addr: u32, width: AccessWidth) -> Option<u64> {
        let index = self.find(addr)?;
        let region = &mut self.regions[index];
        Some((region.read)(addr - region.base, width))
    }

    /// Dispatch a write; false when no device claims the address
    pub fn write(&mut self, addr: u32, width: AccessWidth, value: u64) -> bool {
        match self.find(addr) {
            Some(index) => {
                let region = &mut self.regions[index];
                (region.write)(addr - region.base, width, value);
                true
            }
            None => false,
        }
    }

    /// Registered ranges as `(name, base, size)`
    pub fn ranges(&self) -> impl Iterator<Item = (&str, u32, u32)> {
        self.regions.iter().map(|r| (r.name.as_str(), r.base, r.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn scratch_device(bus: &mut MmioBus, base: u32, size: u32) -> Arc<AtomicU64> {
        let cell = Arc::new(AtomicU64::new(0));
        let read_cell = cell.clone();
        let write_cell = cell.clone();
        bus.register(
            "scratch",
            base,
            size,
            Box::new(move |offset, _| read_cell.load(Ordering::SeqCst) + offset as u64),
            Box::new(move |_, _, value| write_cell.store(value, Ordering::SeqCst)),
        )
        .unwrap();
        cell
    }

    #[test]
    fn test_dispatch_with_offset() {
        let mut bus = MmioBus::new();
        let cell = scratch_device(&mut bus, 0x0C00_2000, 0x100);

        assert!(bus.write(0x0C00_2004, AccessWidth::Word, 0x1000));
        assert_eq!(cell.load(Ordering::SeqCst), 0x1000);
        assert_eq!(bus.read(0x0C00_2008, AccessWidth::Word), Some(0x1008));
        assert_eq!(bus.read(0x0C00_2100, AccessWidth::Word), None);
        assert!(!bus.contains(0x0C00_1FFF));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut bus = MmioBus::new();
        scratch_device(&mut bus, 0x0C00_3000, 0x100);
        let err = bus
            .register(
                "clash",
                0x0C00_30F0,
                0x20,
                Box::new(|_, _| 0),
                Box::new(|_, _, _| {}),
            )
            .unwrap_err();
        assert!(matches!(err, MemoryError::MmioOverlap { .. }));
    }

    #[test]
    fn test_sorted_lookup() {
        let mut bus = MmioBus::new();
        scratch_device(&mut bus, 0x0C00_6000, 0x40);
        scratch_device(&mut bus, 0x0C00_2000, 0x40);
        scratch_device(&mut bus, 0x0C00_4000, 0x40);
        assert!(bus.contains(0x0C00_4010));
        assert!(!bus.contains(0x0C00_5000));
        let bases: Vec<u32> = bus.ranges().map(|(_, base, _)| base).collect();
        assert_eq!(bases, vec![0x0C00_2000, 0x0C00_4000, 0x0C00_6000]);
    }
}
