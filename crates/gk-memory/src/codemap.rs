//! Tracking of RAM that backs translated code
//!
//! One bit per 32-byte line of RAM. Writes that hit a marked line are logged
//! so the block cache can drop every overlapping translation before the next
//! block lookup.

use crate::constants::CACHE_LINE_SIZE;

const LINE_SHIFT: u32 = CACHE_LINE_SIZE.trailing_zeros();

/// Code line bitmap plus pending invalidation log
#[derive(Debug, Clone)]
pub struct CodeMap {
    lines: Vec<u64>,
    log: Vec<(u32, u32)>,
    written: bool,
}

impl CodeMap {
    /// Create a map covering `ram_size` bytes
    pub fn new(ram_size: u32) -> Self {
        let lines = (ram_size >> LINE_SHIFT) as usize;
        Self {
            lines: vec![0; lines.div_ceil(64)],
            log: Vec::new(),
            written: false,
        }
    }

    #[inline]
    fn line_range(offset: u32, len: u32) -> std::ops::RangeInclusive<usize> {
        let first = (offset >> LINE_SHIFT) as usize;
        let last = ((offset + len.max(1) - 1) >> LINE_SHIFT) as usize;
        first..=last
    }

    #[inline]
    fn test_line(&self, line: usize) -> bool {
        self.lines
            .get(line / 64)
            .is_some_and(|word| word & (1 << (line % 64)) != 0)
    }

    /// Mark `[offset, offset + len)` as backing translated code
    pub fn mark(&mut self, offset: u32, len: u32) {
        for line in Self::line_range(offset, len) {
            if let Some(word) = self.lines.get_mut(line / 64) {
                *word |= 1 << (line % 64);
            }
        }
    }

    /// True when any line in the range is marked
    pub fn is_code(&self, offset: u32, len: u32) -> bool {
        Self::line_range(offset, len).any(|line| self.test_line(line))
    }

    /// Record a write; returns true when it hit translated code
    #[inline]
    pub fn on_write(&mut self, offset: u32, len: u32) -> bool {
        if !self.is_code(offset, len) {
            return false;
        }
        self.push(offset, len);
        true
    }

    /// Log an explicit invalidation (instruction cache block flush)
    pub fn push_invalidation(&mut self, offset: u32, len: u32) {
        self.push(offset, len);
    }

    fn push(&mut self, offset: u32, len: u32) {
        let start = offset & !(CACHE_LINE_SIZE - 1);
        let end = (offset + len.max(1)).next_multiple_of(CACHE_LINE_SIZE);
        self.written = true;
        if let Some(last) = self.log.last_mut() {
            if last.0 <= start && start <= last.0 + last.1 {
                last.1 = last.1.max(end - last.0);
                return;
            }
        }
        self.log.push((start, end - start));
    }

    /// True when a logged write is waiting to be drained
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.written
    }

    /// Drain the invalidation log as `(offset, len)` ranges
    pub fn take_log(&mut self) -> Vec<(u32, u32)> {
        self.written = false;
        std::mem::take(&mut self.log)
    }

    /// Unmark everything (after a full cache flush)
    pub fn clear(&mut self) {
        self.lines.fill(0);
    }
}

/// Old contents of every byte written while journaling
#[derive(Debug, Clone, Default)]
pub struct WriteJournal {
    entries: Vec<(u32, u8)>,
    touched_mmio: bool,
}

impl WriteJournal {
    /// Record the previous value of a RAM byte
    pub fn record(&mut self, offset: u32, old: u8) {
        self.entries.push((offset, old));
    }

    /// Note that a device callback ran
    pub fn note_mmio(&mut self) {
        self.touched_mmio = true;
    }

    /// True when the journaled span had device side effects
    pub fn touched_mmio(&self) -> bool {
        self.touched_mmio
    }

    /// Journaled bytes in write order
    pub fn entries(&self) -> &[(u32, u8)] {
        &self.entries
    }

    /// Written RAM offsets, sorted and deduplicated
    pub fn written_offsets(&self) -> Vec<u32> {
        let mut offsets: Vec<u32> = self.entries.iter().map(|&(offset, _)| offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets
    }
}
