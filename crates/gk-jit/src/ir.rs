//! Block IR
//!
//! Every guest instruction lowers to exactly one [`IrOp`], so IR indices are
//! guest instruction indices. Only the integer subset with simple, exactly
//! reproducible semantics gets a native form; the rest becomes
//! [`IrOp::Interpret`] and runs through the interpreter.

use gk_ppc::decoder::Op;
use gk_ppc::instructions::integer::rotate_mask;

use crate::analyzer::GuestInst;

/// Register or constant input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(u8),
    Imm(u32),
}

/// Two-input integer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    /// `a - b`
    Sub,
    Mul,
    And,
    Andc,
    Or,
    Orc,
    Xor,
    Nand,
    Nor,
    Eqv,
    Slw,
    Srw,
}

impl AluOp {
    #[inline]
    pub fn eval(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::And => a & b,
            AluOp::Andc => a & !b,
            AluOp::Or => a | b,
            AluOp::Orc => a | !b,
            AluOp::Xor => a ^ b,
            AluOp::Nand => !(a & b),
            AluOp::Nor => !(a | b),
            AluOp::Eqv => !(a ^ b),
            AluOp::Slw => {
                if b & 0x20 != 0 {
                    0
                } else {
                    a << (b & 0x1F)
                }
            }
            AluOp::Srw => {
                if b & 0x20 != 0 {
                    0
                } else {
                    a >> (b & 0x1F)
                }
            }
        }
    }

    #[inline]
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            AluOp::Add | AluOp::Mul | AluOp::And | AluOp::Or | AluOp::Xor | AluOp::Nand | AluOp::Nor | AluOp::Eqv
        )
    }
}

/// One-input integer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Extsb,
    Extsh,
    Cntlzw,
}

impl UnaryOp {
    #[inline]
    pub fn eval(self, value: u32) -> u32 {
        match self {
            UnaryOp::Neg => value.wrapping_neg(),
            UnaryOp::Extsb => value as u8 as i8 as i32 as u32,
            UnaryOp::Extsh => value as u16 as i16 as i32 as u32,
            UnaryOp::Cntlzw => value.leading_zeros(),
        }
    }
}

/// Access size of an integer load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

/// How a loaded value becomes a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    Zero,
    Sign,
    /// Byte-reversed (`lhbrx`/`lwbrx`)
    Reverse,
}

/// Effective address of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Const(u32),
    Offset { base: u8, offset: u32 },
    Indexed { base: u8, index: u8 },
}

/// Lowered instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrOp {
    /// Removed by the optimizer
    Nop,
    Move { rd: u8, src: Operand },
    Alu { op: AluOp, rd: u8, a: Operand, b: Operand, record: bool },
    Unary { op: UnaryOp, rd: u8, src: u8, record: bool },
    /// `rlwinm`, or `rlwimi` when `insert` is set
    Rotate { rd: u8, rs: u8, sh: u32, mask: u32, insert: bool, record: bool },
    Compare { crf: u8, a: u8, b: Operand, signed: bool },
    Load { rd: u8, width: Width, extend: Extend, addr: Address, update: Option<u8> },
    Store { rs: Operand, width: Width, reverse: bool, addr: Address, update: Option<u8> },
    Branch { target: u32, link: bool },
    BranchCond { bo: u8, bi: u8, target: u32, link: bool },
    /// Run the original instruction through the interpreter
    Interpret,
}

impl IrOp {
    /// Can raise a guest exception
    #[inline]
    pub fn is_fault_point(&self) -> bool {
        matches!(self, IrOp::Load { .. } | IrOp::Store { .. } | IrOp::Interpret)
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        !matches!(self, IrOp::Interpret)
    }
}

fn d_form(ra: u8, offset: u32) -> Address {
    match ra {
        0 => Address::Const(offset),
        base => Address::Offset { base, offset },
    }
}

fn x_form(ra: u8, rb: u8) -> Address {
    match ra {
        0 => Address::Offset { base: rb, offset: 0 },
        base => Address::Indexed { base, index: rb },
    }
}

/// Lower one guest instruction
pub fn lower(guest: &GuestInst) -> IrOp {
    use Op::*;

    let inst = guest.inst();
    let (rd, ra, rb) = (inst.rd() as u8, inst.ra() as u8, inst.rb() as u8);
    let simm = inst.simm() as u32;
    let uimm = inst.uimm();
    let rc = inst.rc();
    let ra_or_zero = if ra == 0 { Operand::Imm(0) } else { Operand::Reg(ra) };
    let alu = |op, rd, a, b, record| IrOp::Alu { op, rd, a, b, record };
    // rS sits in the rD field of logical X-forms, the result goes to rA
    let logical = |op| IrOp::Alu { op, rd: ra, a: Operand::Reg(rd), b: Operand::Reg(rb), record: rc };

    let load = |width, extend, addr| IrOp::Load { rd, width, extend, addr, update: None };
    let load_update = |width, extend, addr| {
        if ra == 0 || ra == rd {
            IrOp::Interpret
        } else {
            IrOp::Load { rd, width, extend, addr, update: Some(ra) }
        }
    };
    let store = |width, reverse, addr| IrOp::Store { rs: Operand::Reg(rd), width, reverse, addr, update: None };
    let store_update = |width, addr| {
        if ra == 0 {
            IrOp::Interpret
        } else {
            IrOp::Store { rs: Operand::Reg(rd), width, reverse: false, addr, update: Some(ra) }
        }
    };
    let du = Address::Offset { base: ra, offset: simm };
    let xu = Address::Indexed { base: ra, index: rb };

    match guest.op {
        Addi => alu(AluOp::Add, rd, ra_or_zero, Operand::Imm(simm), false),
        Addis => alu(AluOp::Add, rd, ra_or_zero, Operand::Imm(simm << 16), false),
        Mulli => alu(AluOp::Mul, rd, Operand::Reg(ra), Operand::Imm(simm), false),
        Add if !inst.oe() => alu(AluOp::Add, rd, Operand::Reg(ra), Operand::Reg(rb), rc),
        Subf if !inst.oe() => alu(AluOp::Sub, rd, Operand::Reg(rb), Operand::Reg(ra), rc),
        Mullw if !inst.oe() => alu(AluOp::Mul, rd, Operand::Reg(ra), Operand::Reg(rb), rc),
        Neg if !inst.oe() => IrOp::Unary { op: UnaryOp::Neg, rd, src: ra, record: rc },

        Ori => alu(AluOp::Or, ra, Operand::Reg(rd), Operand::Imm(uimm), false),
        Oris => alu(AluOp::Or, ra, Operand::Reg(rd), Operand::Imm(uimm << 16), false),
        Xori => alu(AluOp::Xor, ra, Operand::Reg(rd), Operand::Imm(uimm), false),
        Xoris => alu(AluOp::Xor, ra, Operand::Reg(rd), Operand::Imm(uimm << 16), false),
        AndiRc => alu(AluOp::And, ra, Operand::Reg(rd), Operand::Imm(uimm), true),
        AndisRc => alu(AluOp::And, ra, Operand::Reg(rd), Operand::Imm(uimm << 16), true),
        And => logical(AluOp::And),
        Andc => logical(AluOp::Andc),
        Or => logical(AluOp::Or),
        Orc => logical(AluOp::Orc),
        Xor => logical(AluOp::Xor),
        Nand => logical(AluOp::Nand),
        Nor => logical(AluOp::Nor),
        Eqv => logical(AluOp::Eqv),
        Slw => logical(AluOp::Slw),
        Srw => logical(AluOp::Srw),
        Extsb => IrOp::Unary { op: UnaryOp::Extsb, rd: ra, src: rd, record: rc },
        Extsh => IrOp::Unary { op: UnaryOp::Extsh, rd: ra, src: rd, record: rc },
        Cntlzw => IrOp::Unary { op: UnaryOp::Cntlzw, rd: ra, src: rd, record: rc },
        Rlwinm | Rlwimi => IrOp::Rotate {
            rd: ra,
            rs: rd,
            sh: inst.sh(),
            mask: rotate_mask(inst.mb(), inst.me()),
            insert: guest.op == Rlwimi,
            record: rc,
        },

        Cmpi => IrOp::Compare { crf: inst.crfd() as u8, a: ra, b: Operand::Imm(simm), signed: true },
        Cmpli => IrOp::Compare { crf: inst.crfd() as u8, a: ra, b: Operand::Imm(uimm), signed: false },
        Cmp => IrOp::Compare { crf: inst.crfd() as u8, a: ra, b: Operand::Reg(rb), signed: true },
        Cmpl => IrOp::Compare { crf: inst.crfd() as u8, a: ra, b: Operand::Reg(rb), signed: false },

        Lwz => load(Width::Word, Extend::Zero, d_form(ra, simm)),
        Lwzx => load(Width::Word, Extend::Zero, x_form(ra, rb)),
        Lwzu => load_update(Width::Word, Extend::Zero, du),
        Lwzux => load_update(Width::Word, Extend::Zero, xu),
        Lbz => load(Width::Byte, Extend::Zero, d_form(ra, simm)),
        Lbzx => load(Width::Byte, Extend::Zero, x_form(ra, rb)),
        Lbzu => load_update(Width::Byte, Extend::Zero, du),
        Lbzux => load_update(Width::Byte, Extend::Zero, xu),
        Lhz => load(Width::Half, Extend::Zero, d_form(ra, simm)),
        Lhzx => load(Width::Half, Extend::Zero, x_form(ra, rb)),
        Lhzu => load_update(Width::Half, Extend::Zero, du),
        Lhzux => load_update(Width::Half, Extend::Zero, xu),
        Lha => load(Width::Half, Extend::Sign, d_form(ra, simm)),
        Lhax => load(Width::Half, Extend::Sign, x_form(ra, rb)),
        Lhau => load_update(Width::Half, Extend::Sign, du),
        Lhaux => load_update(Width::Half, Extend::Sign, xu),
        Lhbrx => load(Width::Half, Extend::Reverse, x_form(ra, rb)),
        Lwbrx => load(Width::Word, Extend::Reverse, x_form(ra, rb)),

        Stw => store(Width::Word, false, d_form(ra, simm)),
        Stwx => store(Width::Word, false, x_form(ra, rb)),
        Stwu => store_update(Width::Word, du),
        Stwux => store_update(Width::Word, xu),
        Stb => store(Width::Byte, false, d_form(ra, simm)),
        Stbx => store(Width::Byte, false, x_form(ra, rb)),
        Stbu => store_update(Width::Byte, du),
        Stbux => store_update(Width::Byte, xu),
        Sth => store(Width::Half, false, d_form(ra, simm)),
        Sthx => store(Width::Half, false, x_form(ra, rb)),
        Sthu => store_update(Width::Half, du),
        Sthux => store_update(Width::Half, xu),
        Sthbrx => store(Width::Half, true, x_form(ra, rb)),
        Stwbrx => store(Width::Word, true, x_form(ra, rb)),

        B => match guest.branch_target() {
            Some(target) => IrOp::Branch { target, link: inst.lk() },
            None => IrOp::Interpret,
        },
        Bc => match guest.branch_target() {
            Some(target) => IrOp::BranchCond {
                bo: inst.bo() as u8,
                bi: inst.bi() as u8,
                target,
                link: inst.lk(),
            },
            None => IrOp::Interpret,
        },

        _ => IrOp::Interpret,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_ppc::asm;
    use gk_ppc::decode;

    fn lower_word(word: u32) -> IrOp {
        lower(&GuestInst { pc: 0x1000, word, op: decode(word), ram_offset: 0x1000 })
    }

    #[test]
    fn test_lower_li_uses_zero_base() {
        assert_eq!(
            lower_word(asm::li(3, -1)),
            IrOp::Alu { op: AluOp::Add, rd: 3, a: Operand::Imm(0), b: Operand::Imm(u32::MAX), record: false }
        );
    }

    #[test]
    fn test_lower_logical_swaps_fields() {
        assert_eq!(
            lower_word(asm::or(4, 5, 6)),
            IrOp::Alu { op: AluOp::Or, rd: 4, a: Operand::Reg(5), b: Operand::Reg(6), record: false }
        );
    }

    #[test]
    fn test_overflow_forms_are_interpreted() {
        assert_eq!(lower_word(asm::addo(3, 4, 5)), IrOp::Interpret);
        assert_eq!(lower_word(asm::addc(3, 4, 5)), IrOp::Interpret);
    }

    #[test]
    fn test_invalid_update_forms_are_interpreted() {
        assert_eq!(lower_word(asm::lwzu(3, 4, 3)), IrOp::Interpret);
        assert_eq!(lower_word(asm::stwu(3, 4, 0)), IrOp::Interpret);
        assert!(matches!(lower_word(asm::lwzu(3, 4, 1)), IrOp::Load { update: Some(1), .. }));
    }

    #[test]
    fn test_lower_branch_targets() {
        assert_eq!(lower_word(asm::bl(0x20)), IrOp::Branch { target: 0x1020, link: true });
        assert!(matches!(lower_word(asm::bne(-4)), IrOp::BranchCond { target: 0x0FFC, .. }));
        assert_eq!(lower_word(asm::blr()), IrOp::Interpret);
    }

    #[test]
    fn test_shift_semantics() {
        assert_eq!(AluOp::Slw.eval(1, 31), 0x8000_0000);
        assert_eq!(AluOp::Slw.eval(1, 32), 0);
        assert_eq!(AluOp::Srw.eval(0x8000_0000, 0x3F), 0);
        assert_eq!(UnaryOp::Cntlzw.eval(0), 32);
        assert_eq!(UnaryOp::Extsh.eval(0x8000), 0xFFFF_8000);
    }
}
