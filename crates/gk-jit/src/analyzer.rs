//! Block discovery
//!
//! Walks guest code from a start address until something that has to end a
//! block: a branch, an instruction with global side effects, a breakpoint,
//! an unfetchable word or the instruction limit.

use gk_memory::GuestMemory;
use gk_ppc::decoder::{decode, Instruction, Op, OpFlags};
use gk_ppc::state::spr;

use crate::cache::BlockKey;

/// The first instruction of a block could not be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileFault {
    /// Effective address of the failed fetch
    pub address: u32,
}

/// One fetched and decoded guest instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestInst {
    pub pc: u32,
    pub word: u32,
    pub op: Op,
    /// RAM offset the word was fetched from
    pub ram_offset: u32,
}

impl GuestInst {
    #[inline]
    pub fn inst(&self) -> Instruction {
        Instruction(self.word)
    }

    /// Static target of `b`/`bc`
    pub fn branch_target(&self) -> Option<u32> {
        let inst = self.inst();
        let offset = match self.op {
            Op::B => inst.li() as u32,
            Op::Bc => inst.bd() as u32,
            _ => return None,
        };
        Some(if inst.aa() { offset } else { self.pc.wrapping_add(offset) })
    }
}

/// Result of [`analyze`]; never empty
#[derive(Debug, Clone)]
pub struct AnalyzedBlock {
    pub key: BlockKey,
    pub insts: Vec<GuestInst>,
    /// Static successors: the taken branch target, then the fall-through
    pub exits: [Option<u32>; 2],
    /// A short load/compare/branch loop that cannot make progress on its own
    pub idle_loop: bool,
    /// RAM ranges the block was fetched from, as `(offset, len)`
    pub code_ranges: Vec<(u32, u32)>,
}

impl AnalyzedBlock {
    #[inline]
    pub fn start(&self) -> u32 {
        self.key.pc
    }

    /// RAM offset of the first instruction
    #[inline]
    pub fn physical(&self) -> u32 {
        self.insts.first().map_or(0, |inst| inst.ram_offset)
    }

    /// Address following the last instruction
    #[inline]
    pub fn end(&self) -> u32 {
        self.key.pc.wrapping_add(4 * self.insts.len() as u32)
    }

    /// `prefix[i]` is the cycle cost of the first `i` instructions
    pub fn cycle_prefix(&self) -> Vec<u32> {
        let mut prefix = Vec::with_capacity(self.insts.len() + 1);
        let mut total = 0;
        prefix.push(0);
        for inst in &self.insts {
            total += inst.op.info().cycles;
            prefix.push(total);
        }
        prefix
    }
}

/// Longest loop body considered for idle detection
const IDLE_LOOP_MAX: usize = 8;

/// True when `op` must be the last instruction of a block
pub fn ends_block(op: Op, inst: Instruction) -> bool {
    if op.info().flags.contains(OpFlags::END_BLOCK) {
        return true;
    }
    match op {
        Op::Mtspr => spr::write_has_side_effects(inst.spr()),
        Op::Tlbie => true,
        _ => false,
    }
}

/// Discover the block starting at `key.pc`
///
/// The block stops before any address in `breakpoints` other than its start.
pub fn analyze(
    key: BlockKey,
    mem: &mut GuestMemory,
    max_instructions: usize,
    breakpoints: &[u32],
) -> Result<AnalyzedBlock, CompileFault> {
    let mode = key.instruction_mode();
    let limit = max_instructions.max(1);
    let mut insts: Vec<GuestInst> = Vec::with_capacity(limit.min(64));
    let mut pc = key.pc;

    loop {
        if !insts.is_empty() && breakpoints.contains(&pc) {
            gk_core::jit_trace!("Block 0x{:08x} cut at breakpoint 0x{:08x}", key.pc, pc);
            break;
        }
        let (word, ram_offset) = match mem.fetch_with_physical(pc, mode) {
            Ok(fetched) => fetched,
            // The next block reports the fault when it gets there
            Err(_) if !insts.is_empty() => break,
            Err(_) => return Err(CompileFault { address: pc }),
        };
        let op = decode(word);
        insts.push(GuestInst { pc, word, op, ram_offset });
        if ends_block(op, Instruction(word)) || insts.len() >= limit {
            break;
        }
        pc = pc.wrapping_add(4);
    }

    let (exits, idle_loop) = match insts.last() {
        Some(last) => {
            let next = last.pc.wrapping_add(4);
            let exits = match last.op {
                Op::B => [last.branch_target(), None],
                Op::Bc => [last.branch_target(), Some(next)],
                _ => [None, Some(next)],
            };
            (exits, is_idle_loop(&insts, key.pc))
        }
        None => ([None, None], false),
    };

    let code_ranges = code_ranges(&insts);
    Ok(AnalyzedBlock { key, insts, exits, idle_loop, code_ranges })
}

fn code_ranges(insts: &[GuestInst]) -> Vec<(u32, u32)> {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for inst in insts {
        match ranges.last_mut() {
            Some((offset, len)) if *offset + *len == inst.ram_offset => *len += 4,
            _ => ranges.push((inst.ram_offset, 4)),
        }
    }
    ranges
}

/// GPRs read and written by the operations allowed inside an idle loop
fn loop_registers(inst: &GuestInst) -> Option<(u32, u32)> {
    let i = inst.inst();
    let bit = |r: usize| 1u32 << r;
    let ra_or_zero = |r: usize| if r == 0 { 0 } else { bit(r) };
    let regs = match inst.op {
        Op::Lwz | Op::Lhz | Op::Lha | Op::Lbz => (ra_or_zero(i.ra()), bit(i.rd())),
        Op::Lwzx | Op::Lhzx | Op::Lhax | Op::Lbzx => (ra_or_zero(i.ra()) | bit(i.rb()), bit(i.rd())),
        Op::Cmpi | Op::Cmpli => (bit(i.ra()), 0),
        Op::Cmp | Op::Cmpl => (bit(i.ra()) | bit(i.rb()), 0),
        Op::AndiRc | Op::AndisRc | Op::Ori | Op::Rlwinm | Op::Extsb | Op::Extsh => {
            (bit(i.rd()), bit(i.ra()))
        }
        _ => return None,
    };
    Some(regs)
}

/// Busy-wait loops: loads, compares and pure register math feeding a
/// conditional branch back to the start, where every register the loop
/// writes is written before it is read
fn is_idle_loop(insts: &[GuestInst], start: u32) -> bool {
    let Some((last, body)) = insts.split_last() else {
        return false;
    };
    if body.is_empty() || insts.len() > IDLE_LOOP_MAX || last.op != Op::Bc {
        return false;
    }
    let branch = last.inst();
    if branch.lk() || branch.bo() & 0x04 == 0 || last.branch_target() != Some(start) {
        return false;
    }
    if !body.iter().any(|inst| inst.op.info().flags.contains(OpFlags::LOAD)) {
        return false;
    }

    let mut written = 0u32;
    let mut read_first = 0u32;
    for inst in body {
        let Some((reads, writes)) = loop_registers(inst) else {
            return false;
        };
        read_first |= reads & !written;
        written |= writes;
    }
    read_first & written == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_ppc::asm;

    fn create_test_env(program: &[u32]) -> GuestMemory {
        let mut mem = GuestMemory::new(0x10000).unwrap();
        mem.write_physical(0x1000, &asm::assemble(program)).unwrap();
        mem
    }

    fn key(pc: u32) -> BlockKey {
        BlockKey::new(pc, 0)
    }

    #[test]
    fn test_block_ends_at_branch() {
        let mut mem = create_test_env(&[asm::li(3, 1), asm::addi(3, 3, 2), asm::b(-8), asm::nop()]);
        let block = analyze(key(0x1000), &mut mem, 64, &[]).unwrap();
        assert_eq!(block.insts.len(), 3);
        assert_eq!(block.exits, [Some(0x1000), None]);
        assert_eq!(block.end(), 0x100C);
        assert_eq!(block.code_ranges, vec![(0x1000, 12)]);
    }

    #[test]
    fn test_conditional_branch_has_two_exits() {
        let mut mem = create_test_env(&[asm::cmpwi(0, 3, 0), asm::beq(0x40)]);
        let block = analyze(key(0x1000), &mut mem, 64, &[]).unwrap();
        assert_eq!(block.exits, [Some(0x1044), Some(0x1008)]);
    }

    #[test]
    fn test_instruction_limit() {
        let mut mem = create_test_env(&[asm::nop(); 16]);
        let block = analyze(key(0x1000), &mut mem, 5, &[]).unwrap();
        assert_eq!(block.insts.len(), 5);
        assert_eq!(block.exits, [None, Some(0x1014)]);
    }

    #[test]
    fn test_breakpoint_cuts_block() {
        let mut mem = create_test_env(&[asm::nop(); 16]);
        let block = analyze(key(0x1000), &mut mem, 64, &[0x1008]).unwrap();
        assert_eq!(block.insts.len(), 2);

        // A breakpoint on the start address does not produce an empty block
        let block = analyze(key(0x1008), &mut mem, 4, &[0x1008]).unwrap();
        assert_eq!(block.insts.len(), 4);
    }

    #[test]
    fn test_fetch_fault_on_first_instruction() {
        let mut mem = create_test_env(&[]);
        let fault = analyze(key(0x0C00_0000), &mut mem, 64, &[]).unwrap_err();
        assert_eq!(fault.address, 0x0C00_0000);
    }

    #[test]
    fn test_block_ends_at_illegal_word() {
        let mut mem = create_test_env(&[asm::li(3, 1), asm::addi(3, 3, 2)]);
        let block = analyze(key(0x1000), &mut mem, 64, &[]).unwrap();
        assert_eq!(block.insts.len(), 3);
        assert_eq!(block.insts[2].op, Op::Illegal);
    }

    #[test]
    fn test_side_effect_mtspr_ends_block() {
        let mut mem = create_test_env(&[asm::mtspr(528, 3), asm::nop(), asm::nop()]);
        let block = analyze(key(0x1000), &mut mem, 64, &[]).unwrap();
        assert_eq!(block.insts.len(), 1);
    }

    #[test]
    fn test_cycle_prefix() {
        let mut mem = create_test_env(&[asm::mullw(3, 4, 5), asm::nop(), asm::blr()]);
        let block = analyze(key(0x1000), &mut mem, 64, &[]).unwrap();
        assert_eq!(block.cycle_prefix(), vec![0, 5, 6, 7]);
    }

    #[test]
    fn test_idle_loop_detection() {
        let mut mem = create_test_env(&[asm::lwz(3, 0, 4), asm::cmpwi(0, 3, 0), asm::beq(-8)]);
        let block = analyze(key(0x1000), &mut mem, 64, &[]).unwrap();
        assert!(block.idle_loop);
    }

    #[test]
    fn test_counting_loop_is_not_idle() {
        // r5 is read before it is written: the loop makes progress
        let mut mem = create_test_env(&[
            asm::lwz(3, 0, 4),
            asm::ori(5, 5, 1),
            asm::cmpwi(0, 3, 0),
            asm::beq(-12),
        ]);
        let block = analyze(key(0x1000), &mut mem, 64, &[]).unwrap();
        assert!(!block.idle_loop);

        let mut mem = create_test_env(&[asm::stw(3, 0, 4), asm::lwz(3, 0, 4), asm::bne(-8)]);
        let block = analyze(key(0x1000), &mut mem, 64, &[]).unwrap();
        assert!(!block.idle_loop);
    }
}
