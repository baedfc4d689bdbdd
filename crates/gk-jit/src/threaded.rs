//! Threaded-code backend
//!
//! A block compiles to a flat list of [`MicroOp`]s over the host slots of
//! [`crate::regcache`]. The executor walks the list with a `match`, keeps
//! guest registers in slots between fills and spills, and runs everything
//! the IR left as [`IrOp::Interpret`] through the interpreter.
//!
//! Integer loads and stores try fastmem first. A miss looks the micro-op
//! up in the [`TrapTable`], switches the site to the slow path for good and
//! retries through the full memory layer.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};

use gk_memory::{GuestMemory, MemoryFault, Primitive, TranslationMode};
use gk_ppc::instructions::branch::branch_taken;
use gk_ppc::instructions::Trap;
use gk_ppc::interpreter::{execute_word, raise_trap};
use gk_ppc::state::{MachineState, CR_EQ, CR_GT, CR_LT, CR_SO};

use crate::analyzer::AnalyzedBlock;
use crate::ir::{Address, AluOp, Extend, IrOp, Operand, UnaryOp, Width};
use crate::jit::BlockExit;
use crate::regcache::{CacheOp, RegisterCache, HOST_SLOTS};
use crate::trap::{TrapSite, TrapTable};

type Slots = [u32; HOST_SLOTS];

/// Slot or immediate input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src {
    Slot(u8),
    Imm(u32),
}

impl Src {
    #[inline(always)]
    fn value(self, slots: &Slots) -> u32 {
        match self {
            Src::Slot(slot) => slots[slot as usize],
            Src::Imm(value) => value,
        }
    }

    fn slot(self) -> Option<u8> {
        match self {
            Src::Slot(slot) => Some(slot),
            Src::Imm(_) => None,
        }
    }
}

/// Effective address computation over slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ea {
    Const(u32),
    Offset { base: u8, offset: u32 },
    Indexed { base: u8, index: u8 },
}

impl Ea {
    #[inline(always)]
    fn value(self, slots: &Slots) -> u32 {
        match self {
            Ea::Const(ea) => ea,
            Ea::Offset { base, offset } => slots[base as usize].wrapping_add(offset),
            Ea::Indexed { base, index } => slots[base as usize].wrapping_add(slots[index as usize]),
        }
    }

    fn slots(self) -> Vec<u8> {
        match self {
            Ea::Const(_) => Vec::new(),
            Ea::Offset { base, .. } => vec![base],
            Ea::Indexed { base, index } => vec![base, index],
        }
    }
}

/// Threaded-code operation
///
/// `inst` fields are guest instruction indices inside the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroOp {
    Fill { slot: u8, gpr: u8 },
    Spill { slot: u8, gpr: u8 },
    Set { dst: u8, src: Src },
    Alu { op: AluOp, dst: u8, a: Src, b: Src },
    Unary { op: UnaryOp, dst: u8, src: u8 },
    Rotate { dst: u8, src: u8, sh: u8, mask: u32 },
    /// `rlwimi`: `dst` is both input and output
    Insert { dst: u8, src: u8, sh: u8, mask: u32 },
    ShiftLeft { dst: u8, src: u8, amount: u8 },
    ShiftRight { dst: u8, src: u8, amount: u8 },
    RecordCr0 { src: u8 },
    Compare { crf: u8, a: u8, b: Src, signed: bool },
    Load { inst: u16, site: u16, width: Width, extend: Extend, dst: u8, ea: Ea, update: Option<u8> },
    Store { inst: u16, site: u16, width: Width, reverse: bool, src: Src, ea: Ea, update: Option<u8> },
    /// Leave after instruction `inst` when a store hit translated code
    ExitIfCodeWritten { inst: u16, flush: u16 },
    Interpret { inst: u16 },
    Branch { inst: u16, target: u32, link: bool },
    BranchCond { inst: u16, bo: u8, bi: u8, target: u32, link: bool },
    /// Fall through past instruction `inst`
    Exit { inst: u16 },
    /// The interpreter already moved the PC
    ExitDynamic { inst: u16 },
}

/// A load or store that may fault
#[derive(Debug)]
struct AccessSite {
    pc: u32,
    /// Registers to write back when the access faults
    flush: u16,
    /// Fastmem missed here once; always take the slow path
    patched: AtomicBool,
}

/// Compiled threaded code
#[derive(Debug)]
pub struct ThreadedBlock {
    ops: Box<[MicroOp]>,
    sites: Box<[AccessSite]>,
    flush_sets: Box<[Box<[(u8, u8)]>]>,
}

/// Per-execution context used to build exits
struct Frame<'a> {
    start: u32,
    words: &'a [u32],
    prefix: &'a [u32],
    entry_cycles: u64,
}

impl Frame<'_> {
    #[inline(always)]
    fn pc(&self, inst: u16) -> u32 {
        self.start.wrapping_add(inst as u32 * 4)
    }

    /// Normal exit after instruction `inst`
    fn finish(&self, state: &mut MachineState, next_pc: u32, inst: u16) -> BlockExit {
        let done = inst as usize + 1;
        state.pc = next_pc;
        state.npc = next_pc;
        state.cycles = self.entry_cycles + self.prefix[done] as u64;
        BlockExit {
            next_pc,
            cycles: self.prefix[done] as u64,
            instructions: done as u32,
            exception_check: false,
        }
    }

    /// Exit after the interpreter ran instruction `inst`
    fn stopped(&self, state: &MachineState, inst: u16, exception_check: bool) -> BlockExit {
        BlockExit {
            next_pc: state.pc,
            cycles: state.cycles - self.entry_cycles,
            instructions: inst as u32 + 1,
            exception_check,
        }
    }

    /// Exit through a data fault at instruction `inst`
    fn fault(
        &self,
        state: &mut MachineState,
        inst: u16,
        flush: &[(u8, u8)],
        slots: &Slots,
        fault: MemoryFault,
    ) -> BlockExit {
        for &(slot, gpr) in flush {
            state.gpr[gpr as usize] = slots[slot as usize];
        }
        let index = inst as usize;
        state.pc = self.pc(inst);
        state.npc = state.pc.wrapping_add(4);
        state.cycles = self.entry_cycles + self.prefix[index + 1] as u64;
        gk_core::jit_trace!("{:?} at 0x{:08x}", fault, state.pc);
        raise_trap(state, Trap::Memory(fault), self.words[index]);
        BlockExit {
            next_pc: state.pc,
            cycles: self.prefix[index + 1] as u64,
            instructions: index as u32 + 1,
            exception_check: true,
        }
    }
}

#[inline]
fn compare_field(ordering: CmpOrdering, so: bool) -> u32 {
    let field = match ordering {
        CmpOrdering::Less => CR_LT,
        CmpOrdering::Greater => CR_GT,
        CmpOrdering::Equal => CR_EQ,
    };
    if so {
        field | CR_SO
    } else {
        field
    }
}

impl ThreadedBlock {
    /// A block with no code
    pub fn empty() -> Self {
        Self { ops: Box::new([]), sites: Box::new([]), flush_sets: Box::new([]) }
    }

    pub fn ops(&self) -> &[MicroOp] {
        &self.ops
    }

    /// Host address range of the micro-op array
    pub fn host_range(&self) -> (usize, usize) {
        let start = self.ops.as_ptr() as usize;
        (start, start + std::mem::size_of_val(&*self.ops))
    }

    /// Register every access site with the trap table
    ///
    /// Sites that do not fit go straight to the slow path.
    pub fn register_sites(&self, traps: &TrapTable) -> usize {
        let mut registered = 0;
        for op in self.ops.iter() {
            let site = match *op {
                MicroOp::Load { site, .. } | MicroOp::Store { site, .. } => site,
                _ => continue,
            };
            let Some(access) = self.sites.get(site as usize) else {
                continue;
            };
            let host = op as *const MicroOp as usize;
            let entry = TrapSite { guest_pc: access.pc, site: site as u32 };
            if traps.insert(host, host + std::mem::size_of::<MicroOp>(), entry) {
                registered += 1;
            } else {
                access.patched.store(true, Ordering::Relaxed);
            }
        }
        registered
    }

    /// Number of access sites already switched to the slow path
    pub fn patched_sites(&self) -> usize {
        self.sites.iter().filter(|site| site.patched.load(Ordering::Relaxed)).count()
    }

    #[cold]
    fn backpatch(&self, op_index: usize, traps: &TrapTable) {
        let host = &self.ops[op_index] as *const MicroOp as usize;
        match traps.lookup(host) {
            Some(TrapSite { guest_pc, site }) => {
                if let Some(access) = self.sites.get(site as usize) {
                    access.patched.store(true, Ordering::Relaxed);
                }
                gk_core::jit_debug!("Fastmem miss at 0x{:08x}, site {} now takes the slow path", guest_pc, site);
            }
            None => {
                tracing::error!(
                    "Fastmem fault at host 0x{:x} is not inside translated code (ops {:?})",
                    host,
                    self.host_range()
                );
                panic!("unhandled fastmem fault at host address 0x{host:x}");
            }
        }
    }

    #[inline]
    fn load<T: Primitive>(
        &self,
        op_index: usize,
        site: u16,
        ea: u32,
        mode: TranslationMode,
        mem: &mut GuestMemory,
        traps: &TrapTable,
    ) -> Result<T, MemoryFault> {
        if !self.sites[site as usize].patched.load(Ordering::Relaxed) {
            if let Some(value) = mem.fast_read::<T>(ea, mode) {
                return Ok(value);
            }
            self.backpatch(op_index, traps);
        }
        mem.read::<T>(ea, mode)
    }

    #[inline]
    #[allow(clippy::too_many_arguments)]
    fn store<T: Primitive>(
        &self,
        op_index: usize,
        site: u16,
        ea: u32,
        value: T,
        mode: TranslationMode,
        mem: &mut GuestMemory,
        traps: &TrapTable,
    ) -> Result<(), MemoryFault> {
        if !self.sites[site as usize].patched.load(Ordering::Relaxed) {
            if mem.fast_write::<T>(ea, value, mode).is_some() {
                return Ok(());
            }
            self.backpatch(op_index, traps);
        }
        mem.write::<T>(ea, value, mode)
    }

    /// Run the block
    ///
    /// `start`, `words` and `prefix` describe the guest instructions the
    /// block was compiled from.
    pub fn execute(
        &self,
        start: u32,
        words: &[u32],
        prefix: &[u32],
        state: &mut MachineState,
        mem: &mut GuestMemory,
        traps: &TrapTable,
    ) -> BlockExit {
        let frame = Frame { start, words, prefix, entry_cycles: state.cycles };
        let mode = state.data_mode();
        let mut slots: Slots = [0; HOST_SLOTS];

        for (index, op) in self.ops.iter().enumerate() {
            match *op {
                MicroOp::Fill { slot, gpr } => slots[slot as usize] = state.gpr[gpr as usize],
                MicroOp::Spill { slot, gpr } => state.gpr[gpr as usize] = slots[slot as usize],
                MicroOp::Set { dst, src } => slots[dst as usize] = src.value(&slots),
                MicroOp::Alu { op, dst, a, b } => {
                    slots[dst as usize] = op.eval(a.value(&slots), b.value(&slots))
                }
                MicroOp::Unary { op, dst, src } => slots[dst as usize] = op.eval(slots[src as usize]),
                MicroOp::Rotate { dst, src, sh, mask } => {
                    slots[dst as usize] = slots[src as usize].rotate_left(sh as u32) & mask
                }
                MicroOp::Insert { dst, src, sh, mask } => {
                    let rotated = slots[src as usize].rotate_left(sh as u32);
                    slots[dst as usize] = (rotated & mask) | (slots[dst as usize] & !mask);
                }
                MicroOp::ShiftLeft { dst, src, amount } => {
                    slots[dst as usize] = slots[src as usize] << amount
                }
                MicroOp::ShiftRight { dst, src, amount } => {
                    slots[dst as usize] = slots[src as usize] >> amount
                }
                MicroOp::RecordCr0 { src } => state.update_cr0(slots[src as usize]),
                MicroOp::Compare { crf, a, b, signed } => {
                    let (a, b) = (slots[a as usize], b.value(&slots));
                    let ordering = if signed { (a as i32).cmp(&(b as i32)) } else { a.cmp(&b) };
                    let field = compare_field(ordering, state.xer_so());
                    state.set_cr_field(crf as usize, field);
                }
                MicroOp::Load { inst, site, width, extend, dst, ea, update } => {
                    let addr = ea.value(&slots);
                    let loaded = match width {
                        Width::Byte => self.load::<u8>(index, site, addr, mode, mem, traps).map(u32::from),
                        Width::Half => self.load::<u16>(index, site, addr, mode, mem, traps).map(|v| match extend {
                            Extend::Zero => v as u32,
                            Extend::Sign => v as i16 as i32 as u32,
                            Extend::Reverse => v.swap_bytes() as u32,
                        }),
                        Width::Word => self.load::<u32>(index, site, addr, mode, mem, traps).map(|v| match extend {
                            Extend::Reverse => v.swap_bytes(),
                            _ => v,
                        }),
                    };
                    match loaded {
                        Ok(value) => {
                            slots[dst as usize] = value;
                            if let Some(update) = update {
                                slots[update as usize] = addr;
                            }
                        }
                        Err(fault) => {
                            let flush = &self.flush_sets[self.sites[site as usize].flush as usize];
                            return frame.fault(state, inst, flush, &slots, fault);
                        }
                    }
                }
                MicroOp::Store { inst, site, width, reverse, src, ea, update } => {
                    let addr = ea.value(&slots);
                    let value = src.value(&slots);
                    let stored = match width {
                        Width::Byte => self.store::<u8>(index, site, addr, value as u8, mode, mem, traps),
                        Width::Half => {
                            let half = if reverse { (value as u16).swap_bytes() } else { value as u16 };
                            self.store::<u16>(index, site, addr, half, mode, mem, traps)
                        }
                        Width::Word => {
                            let word = if reverse { value.swap_bytes() } else { value };
                            self.store::<u32>(index, site, addr, word, mode, mem, traps)
                        }
                    };
                    match stored {
                        Ok(()) => {
                            if let Some(update) = update {
                                slots[update as usize] = addr;
                            }
                        }
                        Err(fault) => {
                            let flush = &self.flush_sets[self.sites[site as usize].flush as usize];
                            return frame.fault(state, inst, flush, &slots, fault);
                        }
                    }
                }
                MicroOp::ExitIfCodeWritten { inst, flush } => {
                    if mem.code_written() {
                        for &(slot, gpr) in self.flush_sets[flush as usize].iter() {
                            state.gpr[gpr as usize] = slots[slot as usize];
                        }
                        return frame.finish(state, frame.pc(inst).wrapping_add(4), inst);
                    }
                }
                MicroOp::Interpret { inst } => {
                    let i = inst as usize;
                    state.pc = frame.pc(inst);
                    state.cycles = frame.entry_cycles + frame.prefix[i] as u64;
                    let outcome = execute_word(state, mem, frame.words[i]);
                    if outcome.exception_check || mem.code_written() {
                        return frame.stopped(state, inst, outcome.exception_check);
                    }
                }
                MicroOp::Branch { inst, target, link } => {
                    if link {
                        state.set_lr(frame.pc(inst).wrapping_add(4));
                    }
                    return frame.finish(state, target, inst);
                }
                MicroOp::BranchCond { inst, bo, bi, target, link } => {
                    let taken = branch_taken(state, bo as u32, bi as u32);
                    let fall_through = frame.pc(inst).wrapping_add(4);
                    if link {
                        state.set_lr(fall_through);
                    }
                    return frame.finish(state, if taken { target } else { fall_through }, inst);
                }
                MicroOp::Exit { inst } => return frame.finish(state, frame.pc(inst).wrapping_add(4), inst),
                MicroOp::ExitDynamic { inst } => return frame.stopped(state, inst, false),
            }
        }

        // Compiled blocks always end in an exit op; only an empty block gets here
        BlockExit { next_pc: state.pc, ..BlockExit::default() }
    }
}

/// Block emitter state
#[derive(Default)]
struct Emitter {
    cache: RegisterCache,
    ops: Vec<MicroOp>,
    sites: Vec<AccessSite>,
    flush_sets: Vec<Box<[(u8, u8)]>>,
    moves: Vec<CacheOp>,
    ended: bool,
}

fn pins(srcs: &[Src]) -> Vec<u8> {
    srcs.iter().filter_map(|src| src.slot()).collect()
}

/// `rlwinm` special cases
fn rotate_op(dst: u8, src: u8, sh: u32, mask: u32) -> MicroOp {
    if sh == 0 {
        MicroOp::Alu { op: AluOp::And, dst, a: Src::Slot(src), b: Src::Imm(mask) }
    } else if mask == u32::MAX << sh {
        MicroOp::ShiftLeft { dst, src, amount: sh as u8 }
    } else if mask == u32::MAX >> (32 - sh) {
        MicroOp::ShiftRight { dst, src, amount: (32 - sh) as u8 }
    } else {
        MicroOp::Rotate { dst, src, sh: sh as u8, mask }
    }
}

impl Emitter {
    fn drain_moves(&mut self) {
        for op in self.moves.drain(..) {
            self.ops.push(match op {
                CacheOp::Fill { slot, gpr } => MicroOp::Fill { slot, gpr },
                CacheOp::Spill { slot, gpr } => MicroOp::Spill { slot, gpr },
            });
        }
    }

    fn read(&mut self, gpr: u8, pinned: &[u8]) -> u8 {
        let slot = self.cache.read(gpr, pinned, &mut self.moves);
        self.drain_moves();
        slot
    }

    fn write(&mut self, gpr: u8, pinned: &[u8]) -> u8 {
        let slot = self.cache.write(gpr, pinned, &mut self.moves);
        self.drain_moves();
        slot
    }

    fn source(&mut self, operand: Operand, pinned: &[u8]) -> Src {
        match operand {
            Operand::Reg(gpr) => Src::Slot(self.read(gpr, pinned)),
            Operand::Imm(value) => Src::Imm(value),
        }
    }

    fn address(&mut self, addr: Address, pinned: &[u8]) -> Ea {
        match addr {
            Address::Const(ea) => Ea::Const(ea),
            Address::Offset { base, offset } => Ea::Offset { base: self.read(base, pinned), offset },
            Address::Indexed { base, index } => {
                let base = self.read(base, pinned);
                let mut pinned = pinned.to_vec();
                pinned.push(base);
                Ea::Indexed { base, index: self.read(index, &pinned) }
            }
        }
    }

    fn flush(&mut self) {
        self.cache.flush(&mut self.moves);
        self.drain_moves();
    }

    fn flush_set(&mut self) -> u16 {
        let set = self.cache.dirty().into_boxed_slice();
        if let Some(index) = self.flush_sets.iter().position(|existing| *existing == set) {
            return index as u16;
        }
        self.flush_sets.push(set);
        (self.flush_sets.len() - 1) as u16
    }

    fn site(&mut self, pc: u32, flush: u16) -> u16 {
        self.sites.push(AccessSite { pc, flush, patched: AtomicBool::new(false) });
        (self.sites.len() - 1) as u16
    }

    fn record(&mut self, record: bool, dst: u8) {
        if record {
            self.ops.push(MicroOp::RecordCr0 { src: dst });
        }
    }

    fn emit(&mut self, inst: u16, pc: u32, op: IrOp, last: bool) {
        match op {
            IrOp::Nop => {}
            IrOp::Move { rd, src } => {
                let src = self.source(src, &[]);
                let dst = self.write(rd, &pins(&[src]));
                self.ops.push(MicroOp::Set { dst, src });
            }
            IrOp::Alu { op, rd, a, b, record } => {
                let a = self.source(a, &[]);
                let b = self.source(b, &pins(&[a]));
                let dst = self.write(rd, &pins(&[a, b]));
                self.ops.push(MicroOp::Alu { op, dst, a, b });
                self.record(record, dst);
            }
            IrOp::Unary { op, rd, src, record } => {
                let src = self.read(src, &[]);
                let dst = self.write(rd, &[src]);
                self.ops.push(MicroOp::Unary { op, dst, src });
                self.record(record, dst);
            }
            IrOp::Rotate { rd, rs, sh, mask, insert, record } => {
                let src = self.read(rs, &[]);
                let dst = if insert {
                    let old = self.read(rd, &[src]);
                    self.write(rd, &[src, old])
                } else {
                    self.write(rd, &[src])
                };
                self.ops.push(if insert {
                    MicroOp::Insert { dst, src, sh: sh as u8, mask }
                } else {
                    rotate_op(dst, src, sh, mask)
                });
                self.record(record, dst);
            }
            IrOp::Compare { crf, a, b, signed } => {
                let a = self.read(a, &[]);
                let b = self.source(b, &[a]);
                self.ops.push(MicroOp::Compare { crf, a, b, signed });
            }
            IrOp::Load { rd, width, extend, addr, update } => {
                let ea = self.address(addr, &[]);
                let mut pinned = ea.slots();
                let flush = self.flush_set();
                let dst = self.write(rd, &pinned);
                pinned.push(dst);
                let update = update.map(|ra| self.write(ra, &pinned));
                let site = self.site(pc, flush);
                self.ops.push(MicroOp::Load { inst, site, width, extend, dst, ea, update });
            }
            IrOp::Store { rs, width, reverse, addr, update } => {
                let src = self.source(rs, &[]);
                let ea = self.address(addr, &pins(&[src]));
                let mut pinned = ea.slots();
                pinned.extend(src.slot());
                let flush = self.flush_set();
                let update = update.map(|ra| self.write(ra, &pinned));
                let site = self.site(pc, flush);
                self.ops.push(MicroOp::Store { inst, site, width, reverse, src, ea, update });
                let after = self.flush_set();
                self.ops.push(MicroOp::ExitIfCodeWritten { inst, flush: after });
            }
            IrOp::Interpret => {
                self.flush();
                self.ops.push(MicroOp::Interpret { inst });
                self.cache.invalidate();
                if last {
                    self.ops.push(MicroOp::ExitDynamic { inst });
                    self.ended = true;
                }
            }
            IrOp::Branch { target, link } => {
                self.flush();
                self.ops.push(MicroOp::Branch { inst, target, link });
                self.ended = true;
            }
            IrOp::BranchCond { bo, bi, target, link } => {
                self.flush();
                self.ops.push(MicroOp::BranchCond { inst, bo, bi, target, link });
                self.ended = true;
            }
        }
    }
}

/// Compile an analyzed block from its (optimized) IR
pub fn compile(block: &AnalyzedBlock, ir: &[IrOp]) -> ThreadedBlock {
    let mut emitter = Emitter::default();
    let count = block.insts.len();
    for (index, (guest, op)) in block.insts.iter().zip(ir).enumerate() {
        emitter.emit(index as u16, guest.pc, *op, index + 1 == count);
        if emitter.ended {
            break;
        }
    }
    if !emitter.ended && count > 0 {
        emitter.flush();
        emitter.ops.push(MicroOp::Exit { inst: (count - 1) as u16 });
    }
    ThreadedBlock {
        ops: emitter.ops.into_boxed_slice(),
        sites: emitter.sites.into_boxed_slice(),
        flush_sets: emitter.flush_sets.into_boxed_slice(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::cache::BlockKey;
    use crate::ir::lower;
    use crate::optimizer::optimize;
    use gk_ppc::asm;

    fn create_test_env(program: &[u32]) -> (MachineState, GuestMemory, AnalyzedBlock) {
        let mut mem = GuestMemory::new(0x10000).unwrap();
        mem.write_physical(0x1000, &asm::assemble(program)).unwrap();
        // The block covers exactly the program
        let block = analyze(BlockKey::new(0x1000, 0), &mut mem, program.len(), &[]).unwrap();
        let mut state = MachineState::new();
        state.pc = 0x1000;
        (state, mem, block)
    }

    fn build(block: &AnalyzedBlock, optimized: bool) -> ThreadedBlock {
        let mut ir: Vec<IrOp> = block.insts.iter().map(lower).collect();
        if optimized {
            optimize(&mut ir);
        }
        compile(block, &ir)
    }

    fn run(block: &AnalyzedBlock, code: &ThreadedBlock, state: &mut MachineState, mem: &mut GuestMemory) -> BlockExit {
        let traps = TrapTable::with_capacity(64);
        code.register_sites(&traps);
        let words: Vec<u32> = block.insts.iter().map(|i| i.word).collect();
        code.execute(block.start(), &words, &block.cycle_prefix(), state, mem, &traps)
    }

    #[test]
    fn test_constants_fold_to_sets() {
        let (_, _, block) = create_test_env(&[asm::li(3, 5), asm::addi(4, 3, 1), asm::blr()]);
        let code = build(&block, true);
        assert!(code.ops().contains(&MicroOp::Set { dst: 0, src: Src::Imm(5) }));
        assert!(code.ops().iter().any(|op| matches!(op, MicroOp::Set { src: Src::Imm(6), .. })));
        assert!(!code.ops().iter().any(|op| matches!(op, MicroOp::Alu { .. })));
    }

    #[test]
    fn test_straight_line_block() {
        let (mut state, mut mem, block) = create_test_env(&[
            asm::li(3, 10),
            asm::addi(4, 3, -3),
            asm::slwi(5, 4, 2),
            asm::cmpwi(0, 5, 28),
            asm::nop(),
        ]);
        let code = build(&block, false);
        let exit = run(&block, &code, &mut state, &mut mem);
        assert_eq!(exit.next_pc, 0x1014);
        assert_eq!(exit.instructions, 5);
        assert_eq!(state.gpr[3..6], [10, 7, 28]);
        assert_eq!(state.cr_field(0), CR_EQ);
        assert_eq!(state.cycles, 5);
    }

    #[test]
    fn test_fault_writes_back_and_charges_cycles() {
        let (mut state, mut mem, block) = create_test_env(&[
            asm::li(3, 1),
            asm::lis(4, 0x0100),
            asm::lwz(5, 0, 4),
            asm::li(6, 1),
        ]);
        state.gpr[5] = 0xAAAA;
        // Data translation on with no BAT or page table entry for the target
        state.msr = gk_ppc::Msr::DR.bits();
        let code = build(&block, true);
        let exit = run(&block, &code, &mut state, &mut mem);
        assert!(exit.exception_check);
        assert_eq!(exit.instructions, 3);
        assert_eq!(state.pc, 0x1008);
        assert_eq!(state.gpr[3], 1);
        assert_eq!(state.gpr[4], 0x0100_0000);
        assert_eq!(state.gpr[5], 0xAAAA);
        assert_eq!(state.gpr[6], 0);
        assert_eq!(state.cycles, 3);
        assert!(state.exceptions.contains(gk_ppc::ExceptionFlags::DSI));
        assert_eq!(code.patched_sites(), 1);
    }

    #[test]
    fn test_store_to_code_exits_early() {
        let (mut state, mut mem, block) = create_test_env(&[
            asm::li(3, 0x1008),
            asm::stw(0, 0, 3),
            asm::li(4, 1),
            asm::nop(),
        ]);
        mem.mark_code(0x1000, 16);
        let code = build(&block, true);
        let exit = run(&block, &code, &mut state, &mut mem);
        assert!(!exit.exception_check);
        assert_eq!(exit.next_pc, 0x1008);
        assert_eq!(exit.instructions, 2);
        assert_eq!(state.gpr[3], 0x1008);
        assert_eq!(state.gpr[4], 0);
        assert!(mem.code_written());
    }
}
