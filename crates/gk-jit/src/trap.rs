//! Fastmem fault-site table
//!
//! Maps host code ranges of translated memory accesses back to the guest
//! access they implement. When a fast access cannot be served the fault
//! path looks the host address up here, patches the site over to the slow
//! path and retries. Lookups never lock or allocate: the table is a fixed
//! array of atomics sized at construction.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Entries available before new sites go straight to the slow path
pub const TRAP_TABLE_CAPACITY: usize = 1 << 14;

/// A registered access site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapSite {
    /// Guest address of the load or store
    pub guest_pc: u32,
    /// Site index inside the owning block
    pub site: u32,
}

#[derive(Debug, Default)]
struct Entry {
    /// Zero marks a free entry
    start: AtomicUsize,
    end: AtomicUsize,
    guest_pc: AtomicU32,
    site: AtomicU32,
}

pub struct TrapTable {
    entries: Box<[Entry]>,
    /// Where the next insertion starts probing
    cursor: AtomicUsize,
    used: AtomicUsize,
}

impl TrapTable {
    pub fn new() -> Self {
        Self::with_capacity(TRAP_TABLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let entries: Vec<Entry> = (0..capacity.max(1)).map(|_| Entry::default()).collect();
        Self {
            entries: entries.into_boxed_slice(),
            cursor: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `[start, end)`; false when the table is full
    pub fn insert(&self, start: usize, end: usize, site: TrapSite) -> bool {
        if start == 0 || end <= start {
            return false;
        }
        let capacity = self.entries.len();
        let first = self.cursor.load(Ordering::Relaxed);
        for probe in 0..capacity {
            let index = (first + probe) % capacity;
            let entry = &self.entries[index];
            if entry.start.load(Ordering::Acquire) != 0 {
                continue;
            }
            entry.end.store(end, Ordering::Relaxed);
            entry.guest_pc.store(site.guest_pc, Ordering::Relaxed);
            entry.site.store(site.site, Ordering::Relaxed);
            // Publishing the start makes the entry visible
            entry.start.store(start, Ordering::Release);
            self.cursor.store((index + 1) % capacity, Ordering::Relaxed);
            self.used.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        gk_core::jit_debug!("Trap table full, site at 0x{:08x} uses the slow path", site.guest_pc);
        false
    }

    /// Site whose host range contains `host`
    pub fn lookup(&self, host: usize) -> Option<TrapSite> {
        self.entries.iter().find_map(|entry| {
            let start = entry.start.load(Ordering::Acquire);
            if start == 0 || host < start || host >= entry.end.load(Ordering::Relaxed) {
                return None;
            }
            Some(TrapSite {
                guest_pc: entry.guest_pc.load(Ordering::Relaxed),
                site: entry.site.load(Ordering::Relaxed),
            })
        })
    }

    /// Drop every entry whose range starts inside `[start, end)`
    pub fn remove_range(&self, start: usize, end: usize) -> usize {
        let mut removed = 0;
        for entry in self.entries.iter() {
            let entry_start = entry.start.load(Ordering::Acquire);
            if entry_start != 0 && entry_start >= start && entry_start < end {
                entry.start.store(0, Ordering::Release);
                removed += 1;
            }
        }
        self.used.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    pub fn clear(&self) {
        for entry in self.entries.iter() {
            entry.start.store(0, Ordering::Release);
        }
        self.used.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Relaxed);
    }
}

impl Default for TrapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrapTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrapTable")
            .field("capacity", &self.capacity())
            .field("used", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(pc: u32) -> TrapSite {
        TrapSite { guest_pc: pc, site: pc & 0xF }
    }

    #[test]
    fn test_lookup_inside_range() {
        let table = TrapTable::with_capacity(8);
        assert!(table.insert(0x1000, 0x1020, site(0x8000_0004)));
        assert_eq!(table.lookup(0x1000), Some(site(0x8000_0004)));
        assert_eq!(table.lookup(0x101F), Some(site(0x8000_0004)));
        assert_eq!(table.lookup(0x1020), None);
        assert_eq!(table.lookup(0x0FFF), None);
    }

    #[test]
    fn test_full_table_rejects() {
        let table = TrapTable::with_capacity(2);
        assert!(table.insert(0x100, 0x110, site(1)));
        assert!(table.insert(0x200, 0x210, site(2)));
        assert!(!table.insert(0x300, 0x310, site(3)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_range_frees_entries() {
        let table = TrapTable::with_capacity(2);
        table.insert(0x100, 0x110, site(1));
        table.insert(0x200, 0x210, site(2));
        assert_eq!(table.remove_range(0x100, 0x200), 1);
        assert_eq!(table.lookup(0x104), None);
        assert!(table.insert(0x300, 0x310, site(3)));
        assert_eq!(table.lookup(0x304), Some(site(3)));
        assert_eq!(table.lookup(0x204), Some(site(2)));
    }
}
