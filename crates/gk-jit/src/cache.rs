//! Translated block cache
//!
//! Blocks live in a slot arena. A [`BlockHandle`] carries the slot's
//! generation, so handles held in link slots or by the dispatcher go stale
//! the moment their block is invalidated or evicted. A page index over the
//! RAM ranges each block was fetched from drives invalidation.

use std::collections::HashMap;

use gk_memory::TranslationMode;
use gk_ppc::state::Msr;

use crate::threaded::ThreadedBlock;
#[cfg(all(target_arch = "x86_64", unix))]
use crate::x64::NativeBlock;

/// Granule of the invalidation index
pub const INDEX_PAGE_SHIFT: u32 = 12;

/// Blocks are keyed by start address and the MSR translation bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub pc: u32,
    pub msr_bits: u32,
}

impl BlockKey {
    /// MSR bits that change how a block has to be translated
    pub const MSR_MASK: u32 = Msr::IR.bits() | Msr::DR.bits();

    pub fn new(pc: u32, msr: u32) -> Self {
        Self { pc, msr_bits: msr & Self::MSR_MASK }
    }

    #[inline]
    pub fn instruction_mode(&self) -> TranslationMode {
        TranslationMode::from_enabled(self.msr_bits & Msr::IR.bits() != 0)
    }

    #[inline]
    pub fn data_mode(&self) -> TranslationMode {
        TranslationMode::from_enabled(self.msr_bits & Msr::DR.bits() != 0)
    }
}

/// Generation-checked reference to a cached block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    slot: u32,
    generation: u32,
}

/// Backend code of a block
pub enum BlockCode {
    Threaded(ThreadedBlock),
    #[cfg(all(target_arch = "x86_64", unix))]
    Native(NativeBlock),
}

impl BlockCode {
    pub fn is_native(&self) -> bool {
        !matches!(self, BlockCode::Threaded(_))
    }
}

/// A translated block
pub struct Block {
    pub key: BlockKey,
    /// RAM offset of the first instruction
    pub physical: u32,
    /// Original instruction words
    pub words: Box<[u32]>,
    /// `cycle_prefix[i]` is the cost of the first `i` instructions
    pub cycle_prefix: Box<[u32]>,
    /// Static successors: taken branch target, then fall-through
    pub exits: [Option<u32>; 2],
    /// Direct links to the successor blocks, validated on use
    pub links: [Option<BlockHandle>; 2],
    pub code_ranges: Vec<(u32, u32)>,
    pub idle_loop: bool,
    pub last_used: u64,
    pub code: BlockCode,
}

impl Block {
    #[inline]
    pub fn start(&self) -> u32 {
        self.key.pc
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Address following the last instruction
    #[inline]
    pub fn end(&self) -> u32 {
        self.key.pc.wrapping_add(4 * self.words.len() as u32)
    }

    /// True when the block was fetched from any byte of `[offset, offset + len)`
    pub fn overlaps(&self, offset: u32, len: u32) -> bool {
        let end = offset as u64 + len as u64;
        self.code_ranges
            .iter()
            .any(|&(start, size)| (start as u64) < end && offset as u64 <= start as u64 + size as u64 - 1)
    }

    /// Exit slot for a successor address
    pub fn exit_index(&self, pc: u32) -> Option<usize> {
        self.exits.iter().position(|exit| *exit == Some(pc))
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("start", &format_args!("0x{:08x}", self.key.pc))
            .field("msr_bits", &format_args!("0x{:x}", self.key.msr_bits))
            .field("len", &self.words.len())
            .field("native", &self.code.is_native())
            .field("idle_loop", &self.idle_loop)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    block: Option<Block>,
}

#[derive(Debug)]
pub struct BlockCache {
    slots: Vec<Slot>,
    free: Vec<u32>,
    map: HashMap<BlockKey, BlockHandle>,
    pages: HashMap<u32, Vec<BlockHandle>>,
    capacity: usize,
    clock: u64,
}

fn pages_of(offset: u32, len: u32) -> impl Iterator<Item = u32> {
    let first = offset >> INDEX_PAGE_SHIFT;
    let last = (offset as u64 + len.max(1) as u64 - 1) >> INDEX_PAGE_SHIFT;
    first..=last as u32
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            pages: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lookup(&self, key: BlockKey) -> Option<BlockHandle> {
        self.map.get(&key).copied()
    }

    pub fn get(&self, handle: BlockHandle) -> Option<&Block> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.block.as_ref()
    }

    pub fn get_mut(&mut self, handle: BlockHandle) -> Option<&mut Block> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.block.as_mut()
    }

    pub fn is_valid(&self, handle: BlockHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Mark a block as just used
    pub fn touch(&mut self, handle: BlockHandle) {
        self.clock += 1;
        let now = self.clock;
        if let Some(block) = self.get_mut(handle) {
            block.last_used = now;
        }
    }

    /// Insert a block, replacing one with the same key
    ///
    /// Returns the new handle and whatever had to be removed to make room.
    pub fn insert(&mut self, mut block: Block) -> (BlockHandle, Vec<Block>) {
        let mut removed = Vec::new();
        if let Some(old) = self.map.get(&block.key).copied() {
            removed.extend(self.remove(old));
        }
        if self.map.len() >= self.capacity {
            if let Some(victim) = self.least_recently_used() {
                gk_core::jit_trace!("Evicting block 0x{:08x}", self.get(victim).map_or(0, Block::start));
                removed.extend(self.remove(victim));
            }
        }

        self.clock += 1;
        block.last_used = self.clock;
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let handle = BlockHandle { slot, generation: self.slots[slot as usize].generation };
        for &(offset, len) in &block.code_ranges {
            for page in pages_of(offset, len) {
                self.pages.entry(page).or_default().push(handle);
            }
        }
        self.map.insert(block.key, handle);
        self.slots[slot as usize].block = Some(block);
        (handle, removed)
    }

    fn least_recently_used(&self) -> Option<BlockHandle> {
        self.map
            .values()
            .filter_map(|&handle| self.get(handle).map(|block| (handle, block.last_used)))
            .min_by_key(|&(_, last_used)| last_used)
            .map(|(handle, _)| handle)
    }

    /// Remove one block; its handle and every link to it go stale
    pub fn remove(&mut self, handle: BlockHandle) -> Option<Block> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let block = slot.block.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot);

        if self.map.get(&block.key) == Some(&handle) {
            self.map.remove(&block.key);
        }
        for &(offset, len) in &block.code_ranges {
            for page in pages_of(offset, len) {
                if let Some(handles) = self.pages.get_mut(&page) {
                    handles.retain(|h| *h != handle);
                    if handles.is_empty() {
                        self.pages.remove(&page);
                    }
                }
            }
        }
        Some(block)
    }

    /// Remove every block fetched from any byte of the RAM range
    pub fn invalidate_range(&mut self, offset: u32, len: u32) -> Vec<Block> {
        let mut candidates: Vec<BlockHandle> = pages_of(offset, len)
            .filter_map(|page| self.pages.get(&page))
            .flatten()
            .copied()
            .collect();
        candidates.sort_unstable_by_key(|h| h.slot);
        candidates.dedup();
        candidates.retain(|&handle| self.get(handle).is_some_and(|block| block.overlaps(offset, len)));

        candidates.into_iter().filter_map(|handle| self.remove(handle)).collect()
    }

    /// Remove everything
    pub fn clear(&mut self) -> Vec<Block> {
        let handles: Vec<BlockHandle> = self.map.values().copied().collect();
        handles.into_iter().filter_map(|handle| self.remove(handle)).collect()
    }

    /// Record a direct link from exit `exit` of `from` to `to`
    pub fn set_link(&mut self, from: BlockHandle, exit: usize, to: BlockHandle) {
        if let Some(block) = self.get_mut(from) {
            if let Some(link) = block.links.get_mut(exit) {
                *link = Some(to);
            }
        }
    }

    /// Linked successor of `from` through exit `exit`, when still valid
    pub fn linked(&self, from: BlockHandle, exit: usize) -> Option<BlockHandle> {
        let target = (*self.get(from)?.links.get(exit)?)?;
        self.is_valid(target).then_some(target)
    }

    /// Keys of every cached block, sorted
    pub fn keys(&self) -> Vec<BlockKey> {
        let mut keys: Vec<BlockKey> = self.map.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.slots.iter().filter_map(|slot| slot.block.as_ref())
    }
}
