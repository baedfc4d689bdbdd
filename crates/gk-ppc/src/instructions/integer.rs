//! Integer arithmetic, logical, rotate, compare and trap instructions

use gk_memory::GuestMemory;

use super::{program_cause, ra_or_zero, ExecResult, Trap};
use crate::decoder::{Instruction, Op};
use crate::state::{MachineState, CR_EQ, CR_GT, CR_LT, CR_SO};

/// Mask for rotate instructions (bits `mb..=me`, wrapping)
#[inline]
pub fn rotate_mask(mb: u32, me: u32) -> u32 {
    let begin = u32::MAX >> mb;
    let end = 0x7FFF_FFFF >> me;
    let mask = begin ^ end;
    if me < mb {
        !mask
    } else {
        mask
    }
}

/// `a + b + carry_in` with the carry out of bit 0
#[inline]
pub fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool) {
    let sum = a as u64 + b as u64 + carry_in as u64;
    (sum as u32, sum > u32::MAX as u64)
}

/// Signed overflow of `a + b (+c) = result`
#[inline]
pub fn add_overflows(a: u32, b: u32, result: u32) -> bool {
    ((a ^ result) & (b ^ result)) & 0x8000_0000 != 0
}

/// TO-field trap condition of `tw`/`twi`
#[inline]
pub fn trap_condition(to: u32, a: u32, b: u32) -> bool {
    let (sa, sb) = (a as i32, b as i32);
    (to & 0x10 != 0 && sa < sb)
        || (to & 0x08 != 0 && sa > sb)
        || (to & 0x04 != 0 && a == b)
        || (to & 0x02 != 0 && a < b)
        || (to & 0x01 != 0 && a > b)
}

/// Signed division with the Gekko's results for undefined cases
#[inline]
pub fn divw(a: u32, b: u32) -> (u32, bool) {
    let (sa, sb) = (a as i32, b as i32);
    if sb == 0 || (sa == i32::MIN && sb == -1) {
        (if sa < 0 { u32::MAX } else { 0 }, true)
    } else {
        ((sa / sb) as u32, false)
    }
}

/// Unsigned division; division by zero yields zero
#[inline]
pub fn divwu(a: u32, b: u32) -> (u32, bool) {
    if b == 0 {
        (0, true)
    } else {
        (a / b, false)
    }
}

fn compare_field(state: &MachineState, ordering: std::cmp::Ordering) -> u32 {
    let field = match ordering {
        std::cmp::Ordering::Less => CR_LT,
        std::cmp::Ordering::Greater => CR_GT,
        std::cmp::Ordering::Equal => CR_EQ,
    };
    if state.xer_so() {
        field | CR_SO
    } else {
        field
    }
}

#[inline]
fn record(state: &mut MachineState, inst: Instruction, value: u32) {
    if inst.rc() {
        state.update_cr0(value);
    }
}

/// XO-form add family: `rD = a + b + carry_in`
fn xo_add(
    state: &mut MachineState,
    inst: Instruction,
    a: u32,
    b: u32,
    carry_in: bool,
    writes_carry: bool,
) {
    let (result, carry) = add_with_carry(a, b, carry_in);
    state.gpr[inst.rd()] = result;
    if writes_carry {
        state.set_xer_ca(carry);
    }
    if inst.oe() {
        state.set_xer_ov(add_overflows(a, b, result));
    }
    record(state, inst, result);
}

pub fn execute(op: Op, state: &mut MachineState, _mem: &mut GuestMemory, inst: Instruction) -> ExecResult {
    let rd = inst.rd();
    let ra = inst.ra();
    let a = state.gpr[ra];
    let b = state.gpr[inst.rb()];
    // X-form logical ops read rS from the rD slot
    let s = state.gpr[rd];

    match op {
        Op::Addi => state.gpr[rd] = ra_or_zero(state, inst).wrapping_add(inst.simm() as u32),
        Op::Addis => {
            state.gpr[rd] = ra_or_zero(state, inst).wrapping_add((inst.simm() as u32) << 16)
        }
        Op::Addic | Op::AddicRc => {
            let (result, carry) = add_with_carry(a, inst.simm() as u32, false);
            state.gpr[rd] = result;
            state.set_xer_ca(carry);
            if op == Op::AddicRc {
                state.update_cr0(result);
            }
        }
        Op::Subfic => {
            let (result, carry) = add_with_carry(!a, inst.simm() as u32, true);
            state.gpr[rd] = result;
            state.set_xer_ca(carry);
        }
        Op::Mulli => state.gpr[rd] = (a as i32).wrapping_mul(inst.simm()) as u32,

        Op::Add => xo_add(state, inst, a, b, false, false),
        Op::Addc => xo_add(state, inst, a, b, false, true),
        Op::Adde => {
            let ca = state.xer_ca();
            xo_add(state, inst, a, b, ca, true)
        }
        Op::Addme => {
            let ca = state.xer_ca();
            xo_add(state, inst, a, u32::MAX, ca, true)
        }
        Op::Addze => {
            let ca = state.xer_ca();
            xo_add(state, inst, a, 0, ca, true)
        }
        Op::Subf => xo_add(state, inst, !a, b, true, false),
        Op::Subfc => xo_add(state, inst, !a, b, true, true),
        Op::Subfe => {
            let ca = state.xer_ca();
            xo_add(state, inst, !a, b, ca, true)
        }
        Op::Subfme => {
            let ca = state.xer_ca();
            xo_add(state, inst, !a, u32::MAX, ca, true)
        }
        Op::Subfze => {
            let ca = state.xer_ca();
            xo_add(state, inst, !a, 0, ca, true)
        }
        Op::Neg => xo_add(state, inst, !a, 0, true, false),
        Op::Mullw => {
            let product = (a as i32 as i64) * (b as i32 as i64);
            let result = product as u32;
            state.gpr[rd] = result;
            if inst.oe() {
                state.set_xer_ov(product != result as i32 as i64);
            }
            record(state, inst, result);
        }
        Op::Mulhw => {
            let result = (((a as i32 as i64) * (b as i32 as i64)) >> 32) as u32;
            state.gpr[rd] = result;
            record(state, inst, result);
        }
        Op::Mulhwu => {
            let result = (((a as u64) * (b as u64)) >> 32) as u32;
            state.gpr[rd] = result;
            record(state, inst, result);
        }
        Op::Divw | Op::Divwu => {
            let (result, overflow) = if op == Op::Divw { divw(a, b) } else { divwu(a, b) };
            state.gpr[rd] = result;
            if inst.oe() {
                state.set_xer_ov(overflow);
            }
            record(state, inst, result);
        }

        Op::Cmpi => {
            let field = compare_field(state, (a as i32).cmp(&inst.simm()));
            state.set_cr_field(inst.crfd(), field);
        }
        Op::Cmpli => {
            let field = compare_field(state, a.cmp(&inst.uimm()));
            state.set_cr_field(inst.crfd(), field);
        }
        Op::Cmp => {
            let field = compare_field(state, (a as i32).cmp(&(b as i32)));
            state.set_cr_field(inst.crfd(), field);
        }
        Op::Cmpl => {
            let field = compare_field(state, a.cmp(&b));
            state.set_cr_field(inst.crfd(), field);
        }
        Op::Twi => {
            if trap_condition(inst.bo(), a, inst.simm() as u32) {
                return Err(Trap::Program(program_cause::TRAP));
            }
        }
        Op::Tw => {
            if trap_condition(inst.bo(), a, b) {
                return Err(Trap::Program(program_cause::TRAP));
            }
        }

        Op::Ori => state.gpr[ra] = s | inst.uimm(),
        Op::Oris => state.gpr[ra] = s | (inst.uimm() << 16),
        Op::Xori => state.gpr[ra] = s ^ inst.uimm(),
        Op::Xoris => state.gpr[ra] = s ^ (inst.uimm() << 16),
        Op::AndiRc => {
            let result = s & inst.uimm();
            state.gpr[ra] = result;
            state.update_cr0(result);
        }
        Op::AndisRc => {
            let result = s & (inst.uimm() << 16);
            state.gpr[ra] = result;
            state.update_cr0(result);
        }
        Op::And
        | Op::Andc
        | Op::Or
        | Op::Orc
        | Op::Xor
        | Op::Nand
        | Op::Nor
        | Op::Eqv
        | Op::Extsb
        | Op::Extsh
        | Op::Cntlzw
        | Op::Slw
        | Op::Srw => {
            let result = match op {
                Op::And => s & b,
                Op::Andc => s & !b,
                Op::Or => s | b,
                Op::Orc => s | !b,
                Op::Xor => s ^ b,
                Op::Nand => !(s & b),
                Op::Nor => !(s | b),
                Op::Eqv => !(s ^ b),
                Op::Extsb => s as u8 as i8 as i32 as u32,
                Op::Extsh => s as u16 as i16 as i32 as u32,
                Op::Cntlzw => s.leading_zeros(),
                Op::Slw => {
                    if b & 0x20 != 0 {
                        0
                    } else {
                        s << (b & 0x1F)
                    }
                }
                _ => {
                    if b & 0x20 != 0 {
                        0
                    } else {
                        s >> (b & 0x1F)
                    }
                }
            };
            state.gpr[ra] = result;
            record(state, inst, result);
        }

        Op::Rlwinm => {
            let result = s.rotate_left(inst.sh()) & rotate_mask(inst.mb(), inst.me());
            state.gpr[ra] = result;
            record(state, inst, result);
        }
        Op::Rlwnm => {
            let result = s.rotate_left(b & 0x1F) & rotate_mask(inst.mb(), inst.me());
            state.gpr[ra] = result;
            record(state, inst, result);
        }
        Op::Rlwimi => {
            let mask = rotate_mask(inst.mb(), inst.me());
            let result = (s.rotate_left(inst.sh()) & mask) | (a & !mask);
            state.gpr[ra] = result;
            record(state, inst, result);
        }
        Op::Sraw | Op::Srawi => {
            let amount = if op == Op::Sraw { b & 0x3F } else { inst.sh() };
            let negative = (s as i32) < 0;
            let (result, carry) = if amount & 0x20 != 0 {
                (if negative { u32::MAX } else { 0 }, negative)
            } else {
                let result = ((s as i32) >> amount) as u32;
                let lost = amount != 0 && s & ((1u32 << amount) - 1) != 0;
                (result, negative && lost)
            };
            state.gpr[ra] = result;
            state.set_xer_ca(carry);
            record(state, inst, result);
        }

        _ => return Err(Trap::Program(program_cause::ILLEGAL)),
    }
    Ok(())
}
