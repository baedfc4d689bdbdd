//! Guest register cache
//!
//! Tracks which guest GPR lives in which host slot while a block is being
//! emitted. Slots are reused least-recently-used first; dirty slots are
//! spilled before reuse.

/// Host slots available to translated code
pub const HOST_SLOTS: usize = 8;

/// Data movement the emitter has to materialize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Load guest register `gpr` into `slot`
    Fill { slot: u8, gpr: u8 },
    /// Write `slot` back to guest register `gpr`
    Spill { slot: u8, gpr: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    gpr: u8,
    dirty: bool,
    last_use: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterCache {
    slots: [Option<Binding>; HOST_SLOTS],
    clock: u32,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot currently holding `gpr`
    pub fn slot_of(&self, gpr: u8) -> Option<u8> {
        self.slots
            .iter()
            .position(|binding| binding.is_some_and(|b| b.gpr == gpr))
            .map(|slot| slot as u8)
    }

    fn tick(&mut self) -> u32 {
        self.clock += 1;
        self.clock
    }

    /// Pick a slot for a new binding, never one in `pinned`
    fn allocate(&mut self, pinned: &[u8], out: &mut Vec<CacheOp>) -> u8 {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            return free as u8;
        }
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(slot, _)| !pinned.contains(&(*slot as u8)))
            .filter_map(|(slot, binding)| binding.map(|b| (slot, b)))
            .min_by_key(|(_, b)| b.last_use);
        // At most three operands are pinned, so a victim always exists
        let (slot, binding) = match victim {
            Some(found) => found,
            None => (0, self.slots[0].unwrap_or(Binding { gpr: 0, dirty: false, last_use: 0 })),
        };
        if binding.dirty {
            out.push(CacheOp::Spill { slot: slot as u8, gpr: binding.gpr });
        }
        self.slots[slot] = None;
        slot as u8
    }

    /// Slot holding the current value of `gpr`, filling it if needed
    pub fn read(&mut self, gpr: u8, pinned: &[u8], out: &mut Vec<CacheOp>) -> u8 {
        let now = self.tick();
        if let Some(slot) = self.slot_of(gpr) {
            if let Some(binding) = self.slots[slot as usize].as_mut() {
                binding.last_use = now;
            }
            return slot;
        }
        let slot = self.allocate(pinned, out);
        out.push(CacheOp::Fill { slot, gpr });
        self.slots[slot as usize] = Some(Binding { gpr, dirty: false, last_use: now });
        slot
    }

    /// Slot that will receive a new value of `gpr`
    pub fn write(&mut self, gpr: u8, pinned: &[u8], out: &mut Vec<CacheOp>) -> u8 {
        let now = self.tick();
        if let Some(slot) = self.slot_of(gpr) {
            if let Some(binding) = self.slots[slot as usize].as_mut() {
                binding.dirty = true;
                binding.last_use = now;
            }
            return slot;
        }
        let slot = self.allocate(pinned, out);
        self.slots[slot as usize] = Some(Binding { gpr, dirty: true, last_use: now });
        slot
    }

    /// Dirty bindings as `(slot, gpr)`; what a fault path must write back
    pub fn dirty(&self) -> Vec<(u8, u8)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, binding)| match binding {
                Some(b) if b.dirty => Some((slot as u8, b.gpr)),
                _ => None,
            })
            .collect()
    }

    /// Write back every dirty slot; bindings stay valid and become clean
    pub fn flush(&mut self, out: &mut Vec<CacheOp>) {
        for (slot, binding) in self.slots.iter_mut().enumerate() {
            if let Some(b) = binding.as_mut() {
                if b.dirty {
                    out.push(CacheOp::Spill { slot: slot as u8, gpr: b.gpr });
                    b.dirty = false;
                }
            }
        }
    }

    /// Forget all bindings; the caller flushed first
    pub fn invalidate(&mut self) {
        self.slots = [None; HOST_SLOTS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_fills_once() {
        let mut cache = RegisterCache::new();
        let mut out = Vec::new();
        let a = cache.read(3, &[], &mut out);
        let b = cache.read(3, &[], &mut out);
        assert_eq!(a, b);
        assert_eq!(out, vec![CacheOp::Fill { slot: a, gpr: 3 }]);
    }

    #[test]
    fn test_write_does_not_fill() {
        let mut cache = RegisterCache::new();
        let mut out = Vec::new();
        let slot = cache.write(5, &[], &mut out);
        assert!(out.is_empty());
        assert_eq!(cache.dirty(), vec![(slot, 5)]);
    }

    #[test]
    fn test_lru_eviction_spills_dirty() {
        let mut cache = RegisterCache::new();
        let mut out = Vec::new();
        for gpr in 0..HOST_SLOTS as u8 {
            cache.write(gpr, &[], &mut out);
        }
        // Touch r0 so r1 becomes the oldest binding
        cache.read(0, &[], &mut out);
        let slot = cache.read(20, &[], &mut out);
        assert_eq!(
            out,
            vec![CacheOp::Spill { slot, gpr: 1 }, CacheOp::Fill { slot, gpr: 20 }]
        );
        assert_eq!(cache.slot_of(1), None);
    }

    #[test]
    fn test_pinned_slots_survive() {
        let mut cache = RegisterCache::new();
        let mut out = Vec::new();
        for gpr in 0..HOST_SLOTS as u8 {
            cache.read(gpr, &[], &mut out);
        }
        let oldest = cache.slot_of(0).unwrap();
        let slot = cache.write(30, &[oldest], &mut out);
        assert_ne!(slot, oldest);
        assert_eq!(cache.slot_of(0), Some(oldest));
    }

    #[test]
    fn test_flush_keeps_bindings_clean() {
        let mut cache = RegisterCache::new();
        let mut out = Vec::new();
        let slot = cache.write(7, &[], &mut out);
        cache.flush(&mut out);
        assert_eq!(out, vec![CacheOp::Spill { slot, gpr: 7 }]);
        assert!(cache.dirty().is_empty());
        assert_eq!(cache.slot_of(7), Some(slot));

        cache.invalidate();
        assert_eq!(cache.slot_of(7), None);
    }
}
