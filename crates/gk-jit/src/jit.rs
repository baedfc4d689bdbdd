//! Dispatcher and block management

use gk_core::config::JitConfig;
use gk_core::error::{JitError, StateError};
use gk_core::savestate::{expect_consumed, ReadLeExt, WriteLeExt};
use gk_memory::GuestMemory;
use gk_ppc::interpreter::Interpreter;
use gk_ppc::state::{ExceptionFlags, MachineState};

use crate::analyzer::{analyze, AnalyzedBlock, CompileFault};
use crate::cache::{Block, BlockCache, BlockCode, BlockHandle, BlockKey};
use crate::ir::{lower, IrOp};
use crate::optimizer::optimize;
use crate::threaded;
use crate::trap::TrapTable;
#[cfg(all(target_arch = "x86_64", unix))]
use crate::x64::{self, ExitFlags};

/// Code generator used for new blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Portable threaded code
    Threaded,
    /// Host machine code (x86-64 only)
    Native,
}

impl Backend {
    pub fn is_supported(self) -> bool {
        match self {
            Backend::Threaded => true,
            Backend::Native => cfg!(all(target_arch = "x86_64", unix)),
        }
    }
}

/// How a block left
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockExit {
    /// Guest address execution continues at
    pub next_pc: u32,
    /// Cycles charged by this block
    pub cycles: u64,
    /// Guest instructions retired, including a faulting one
    pub instructions: u32,
    /// An exception became pending or the MSR changed
    pub exception_check: bool,
}

/// Result of [`Jit::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub cycles: u64,
    pub instructions: u64,
    /// Stopped for the exception controller
    pub exception_check: bool,
    /// Stopped in a detected idle loop
    pub idle: bool,
    /// Stopped on a breakpoint address
    pub breakpoint: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStats {
    pub blocks_compiled: u64,
    pub blocks_executed: u64,
    pub links_followed: u64,
    pub blocks_invalidated: u64,
    pub cache_flushes: u64,
    pub compile_faults: u64,
    pub native_fallbacks: u64,
    pub consistency_checks: u64,
}

pub struct Jit {
    config: JitConfig,
    backend: Backend,
    cache: BlockCache,
    traps: TrapTable,
    stats: JitStats,
}

fn run_block(block: &Block, traps: &TrapTable, state: &mut MachineState, mem: &mut GuestMemory) -> BlockExit {
    match &block.code {
        BlockCode::Threaded(code) => {
            code.execute(block.start(), &block.words, &block.cycle_prefix, state, mem, traps)
        }
        #[cfg(all(target_arch = "x86_64", unix))]
        BlockCode::Native(code) => {
            let entry_cycles = state.cycles;
            let (instructions, flags) = code.execute(state, mem);
            BlockExit {
                next_pc: state.pc,
                cycles: state.cycles - entry_cycles,
                instructions,
                exception_check: flags.contains(ExitFlags::EXCEPTION_CHECK),
            }
        }
    }
}

/// First difference between two states, for divergence reports
fn describe_difference(jit: &MachineState, reference: &MachineState) -> String {
    if let Some(reg) = (0..32).find(|&r| jit.gpr[r] != reference.gpr[r]) {
        return format!("r{reg}: jit 0x{:08x}, interpreter 0x{:08x}", jit.gpr[reg], reference.gpr[reg]);
    }
    let scalars = [
        ("pc", jit.pc, reference.pc),
        ("npc", jit.npc, reference.npc),
        ("cr", jit.cr, reference.cr),
        ("xer", jit.xer, reference.xer),
        ("msr", jit.msr, reference.msr),
        ("fpscr", jit.fpscr, reference.fpscr),
        ("exceptions", jit.exceptions.bits(), reference.exceptions.bits()),
    ];
    if let Some((name, a, b)) = scalars.iter().find(|(_, a, b)| a != b) {
        return format!("{name}: jit 0x{a:08x}, interpreter 0x{b:08x}");
    }
    if jit.cycles != reference.cycles {
        return format!("cycles: jit {}, interpreter {}", jit.cycles, reference.cycles);
    }
    if let Some(n) = (0..jit.spr.len()).find(|&n| jit.spr[n] != reference.spr[n]) {
        return format!("spr{n}: jit 0x{:08x}, interpreter 0x{:08x}", jit.spr[n], reference.spr[n]);
    }
    "floating point or timer state".to_string()
}

impl Jit {
    pub fn new(config: &JitConfig, backend: Backend) -> Self {
        let backend = if backend.is_supported() {
            backend
        } else {
            tracing::warn!("{}; using threaded code", JitError::BackendUnavailable);
            Backend::Threaded
        };
        tracing::info!(
            "JIT: {:?} backend, {} instructions/block, {} blocks, linking {}, optimizer {}",
            backend,
            config.max_block_instructions,
            config.max_blocks,
            config.link_blocks,
            config.optimize
        );
        Self {
            config: config.clone(),
            backend,
            cache: BlockCache::new(config.max_blocks as usize),
            traps: TrapTable::new(),
            stats: JitStats::default(),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn traps(&self) -> &TrapTable {
        &self.traps
    }

    pub fn set_consistency_check(&mut self, enabled: bool) {
        self.config.consistency_check = enabled;
    }

    pub fn lookup(&self, pc: u32, msr: u32) -> Option<BlockHandle> {
        self.cache.lookup(BlockKey::new(pc, msr))
    }

    pub fn block(&self, handle: BlockHandle) -> Option<&Block> {
        self.cache.get(handle)
    }

    /// Translate the block at the current PC, replacing any cached copy
    pub fn compile(
        &mut self,
        state: &MachineState,
        mem: &mut GuestMemory,
        breakpoints: &[u32],
    ) -> Result<BlockHandle, CompileFault> {
        self.compile_key(BlockKey::new(state.pc, state.msr), mem, breakpoints)
    }

    fn compile_key(
        &mut self,
        key: BlockKey,
        mem: &mut GuestMemory,
        breakpoints: &[u32],
    ) -> Result<BlockHandle, CompileFault> {
        let analyzed = analyze(key, mem, self.config.max_block_instructions as usize, breakpoints)?;
        let mut ir: Vec<IrOp> = analyzed.insts.iter().map(lower).collect();
        if self.config.optimize {
            let report = optimize(&mut ir);
            gk_core::jit_trace!(
                "Optimized 0x{:08x}: {} idioms, {} folded, {} dead CR",
                key.pc,
                report.idioms,
                report.folded,
                report.dead_cr
            );
        }
        let code = self.emit(&analyzed, &ir);
        for &(offset, len) in &analyzed.code_ranges {
            mem.mark_code(offset, len);
        }

        let block = Block {
            key,
            physical: analyzed.physical(),
            words: analyzed.insts.iter().map(|inst| inst.word).collect(),
            cycle_prefix: analyzed.cycle_prefix().into_boxed_slice(),
            exits: analyzed.exits,
            links: [None; 2],
            code_ranges: analyzed.code_ranges,
            idle_loop: analyzed.idle_loop,
            last_used: 0,
            code,
        };
        gk_core::jit_debug!(
            "Compiled 0x{:08x} ({} instructions{})",
            key.pc,
            block.len(),
            if block.idle_loop { ", idle loop" } else { "" }
        );

        let (handle, evicted) = self.cache.insert(block);
        for old in &evicted {
            self.release(old);
        }
        if let Some(Block { code: BlockCode::Threaded(code), .. }) = self.cache.get(handle) {
            code.register_sites(&self.traps);
        }
        self.stats.blocks_compiled += 1;
        Ok(handle)
    }

    fn emit(&mut self, analyzed: &AnalyzedBlock, ir: &[IrOp]) -> BlockCode {
        #[cfg(all(target_arch = "x86_64", unix))]
        if self.backend == Backend::Native {
            match x64::compile(analyzed, ir) {
                Ok(native) => return BlockCode::Native(native),
                Err(e) => {
                    tracing::warn!("{}; block 0x{:08x} uses threaded code", e, analyzed.start());
                    self.stats.native_fallbacks += 1;
                }
            }
        }
        BlockCode::Threaded(threaded::compile(analyzed, ir))
    }

    /// Drop trap sites owned by a block that left the cache
    fn release(&self, block: &Block) {
        if let BlockCode::Threaded(code) = &block.code {
            let (start, end) = code.host_range();
            self.traps.remove_range(start, end);
        }
    }

    /// Run one block
    ///
    /// With the consistency check enabled the block is replayed in the
    /// interpreter and any difference aborts the process.
    pub fn execute(
        &mut self,
        handle: BlockHandle,
        state: &mut MachineState,
        mem: &mut GuestMemory,
    ) -> Option<BlockExit> {
        if self.config.consistency_check {
            return self.execute_checked(handle, state, mem);
        }
        let exit = run_block(self.cache.get(handle)?, &self.traps, state, mem);
        self.cache.touch(handle);
        self.stats.blocks_executed += 1;
        Some(exit)
    }

    fn execute_checked(
        &mut self,
        handle: BlockHandle,
        state: &mut MachineState,
        mem: &mut GuestMemory,
    ) -> Option<BlockExit> {
        let block = self.cache.get(handle)?;
        let block_pc = block.start();
        let before = state.clone();
        let reservation = mem.reservation();

        mem.begin_journal();
        let exit = run_block(block, &self.traps, state, mem);
        let journal = mem.end_journal().unwrap_or_default();
        self.cache.touch(handle);
        self.stats.blocks_executed += 1;
        if journal.touched_mmio() {
            // Device side effects cannot be replayed
            return Some(exit);
        }
        self.stats.consistency_checks += 1;

        let jit_state = state.clone();
        let jit_reservation = mem.reservation();
        let jit_writes: Vec<(u32, u8)> = journal
            .written_offsets()
            .into_iter()
            .map(|offset| (offset, mem.ram()[offset as usize]))
            .collect();

        mem.rollback(&journal);
        mem.set_reservation(reservation);
        *state = before;
        mem.begin_journal();
        let mut interpreter = Interpreter::new();
        for _ in 0..exit.instructions {
            interpreter.step(state, mem);
        }
        let replay = mem.end_journal().unwrap_or_default();

        let ram = mem.ram();
        let replay_writes: Vec<(u32, u8)> = replay
            .written_offsets()
            .into_iter()
            .map(|offset| (offset, ram[offset as usize]))
            .collect();

        let detail = if jit_state != *state {
            Some(describe_difference(&jit_state, state))
        } else if jit_writes != replay_writes {
            let first = jit_writes
                .iter()
                .zip(&replay_writes)
                .find(|(a, b)| a != b)
                .map_or(jit_writes.len().min(replay_writes.len()), |(a, _)| a.0 as usize);
            Some(format!(
                "memory writes differ near RAM offset 0x{first:x} ({} bytes jit, {} bytes interpreter)",
                jit_writes.len(),
                replay_writes.len()
            ))
        } else if jit_reservation != mem.reservation() {
            Some("reservation".to_string())
        } else {
            None
        };

        if let Some(detail) = detail {
            let error = JitError::Divergence { pc: block_pc, detail };
            tracing::error!("{}", error);
            panic!("{error}");
        }
        Some(exit)
    }

    /// Run blocks until the cycle budget is spent or something needs the
    /// caller's attention
    pub fn run(
        &mut self,
        state: &mut MachineState,
        mem: &mut GuestMemory,
        budget: u64,
        breakpoints: &[u32],
    ) -> RunOutcome {
        let mut outcome = RunOutcome::default();
        let mut previous: Option<(BlockHandle, u32)> = None;

        while outcome.cycles < budget {
            if self.sync_memory(mem) {
                previous = None;
            }
            if outcome.instructions > 0 && breakpoints.contains(&state.pc) {
                outcome.breakpoint = true;
                break;
            }

            let key = BlockKey::new(state.pc, state.msr);
            let handle = match previous.and_then(|(from, next_pc)| self.follow_link(from, next_pc, key)) {
                Some(handle) => handle,
                None => {
                    let handle = match self.cache.lookup(key) {
                        Some(handle) => handle,
                        None => match self.compile_key(key, mem, breakpoints) {
                            Ok(handle) => handle,
                            Err(fault) => {
                                gk_core::jit_debug!("Instruction fetch fault at 0x{:08x}", fault.address);
                                self.stats.compile_faults += 1;
                                state.exceptions |= ExceptionFlags::ISI;
                                state.cycles += 1;
                                outcome.cycles += 1;
                                outcome.instructions += 1;
                                outcome.exception_check = true;
                                break;
                            }
                        },
                    };
                    if let Some((from, next_pc)) = previous {
                        self.link(from, next_pc, handle);
                    }
                    handle
                }
            };

            let Some(exit) = self.execute(handle, state, mem) else {
                break;
            };
            outcome.cycles += exit.cycles;
            outcome.instructions += exit.instructions as u64;
            if exit.exception_check {
                outcome.exception_check = true;
                break;
            }
            let idle = self
                .cache
                .get(handle)
                .is_some_and(|block| block.idle_loop && exit.next_pc == block.start());
            if idle {
                outcome.idle = true;
                break;
            }
            previous = Some((handle, exit.next_pc));
        }
        outcome
    }

    fn follow_link(&mut self, from: BlockHandle, next_pc: u32, key: BlockKey) -> Option<BlockHandle> {
        if !self.config.link_blocks {
            return None;
        }
        let exit = self.cache.get(from)?.exit_index(next_pc)?;
        let target = self.cache.linked(from, exit)?;
        if self.cache.get(target)?.key != key {
            return None;
        }
        self.stats.links_followed += 1;
        Some(target)
    }

    fn link(&mut self, from: BlockHandle, next_pc: u32, to: BlockHandle) {
        if !self.config.link_blocks {
            return;
        }
        if let Some(exit) = self.cache.get(from).and_then(|block| block.exit_index(next_pc)) {
            self.cache.set_link(from, exit, to);
        }
    }

    /// Apply code writes and translation changes reported by memory
    ///
    /// Returns true when any cached block went away.
    pub fn sync_memory(&mut self, mem: &mut GuestMemory) -> bool {
        if mem.take_translation_changed() {
            mem.take_invalidations();
            let flushed = !self.cache.is_empty();
            self.clear_cache(mem);
            return flushed;
        }
        if !mem.code_written() {
            return false;
        }
        let mut removed = 0;
        for (offset, len) in mem.take_invalidations() {
            removed += self.invalidate_range(offset, len);
        }
        removed > 0
    }

    /// Drop every block fetched from the RAM range
    pub fn invalidate_range(&mut self, offset: u32, len: u32) -> usize {
        let removed = self.cache.invalidate_range(offset, len);
        for block in &removed {
            gk_core::jit_trace!("Invalidated block 0x{:08x}", block.start());
            self.release(block);
        }
        self.stats.blocks_invalidated += removed.len() as u64;
        removed.len()
    }

    /// Drop every block
    pub fn clear_cache(&mut self, mem: &mut GuestMemory) {
        let removed = self.cache.clear();
        self.traps.clear();
        mem.clear_code_marks();
        self.stats.cache_flushes += 1;
        gk_core::jit_debug!("Block cache flushed ({} blocks)", removed.len());
    }

    /// Keys of the blocks currently cached
    pub fn valid_blocks(&self) -> Vec<BlockKey> {
        self.cache.keys()
    }

    /// Serialize the valid-block list
    pub fn encode_validity(&self, out: &mut Vec<u8>) -> Result<(), StateError> {
        let keys = self.valid_blocks();
        out.write_u32_le(keys.len() as u32)?;
        for key in keys {
            out.write_u32_le(key.pc)?;
            out.write_u32_le(key.msr_bits)?;
        }
        Ok(())
    }

    /// Parse a list written by [`Jit::encode_validity`]
    pub fn decode_validity(payload: &[u8]) -> Result<Vec<BlockKey>, StateError> {
        let mut rest = payload;
        let count = rest.read_u32_le()? as usize;
        if count.saturating_mul(8) > rest.len() {
            return Err(StateError::Truncated("JITV"));
        }
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            let pc = rest.read_u32_le()?;
            let msr_bits = rest.read_u32_le()?;
            keys.push(BlockKey::new(pc, msr_bits));
        }
        expect_consumed(rest, "JITV")?;
        Ok(keys)
    }

    /// Rebuild the cache from a valid-block list
    ///
    /// Blocks that no longer translate are skipped. Returns how many were
    /// compiled.
    pub fn restore_validity(&mut self, keys: &[BlockKey], mem: &mut GuestMemory, breakpoints: &[u32]) -> usize {
        self.clear_cache(mem);
        keys.iter()
            .filter(|&&key| match self.compile_key(key, mem, breakpoints) {
                Ok(_) => true,
                Err(fault) => {
                    gk_core::jit_debug!("Skipping saved block 0x{:08x}: fetch fault", fault.address);
                    false
                }
            })
            .count()
    }
}

impl std::fmt::Debug for Jit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jit")
            .field("backend", &self.backend)
            .field("blocks", &self.cache.len())
            .field("stats", &self.stats)
            .finish()
    }
}
