//! Local block optimizations
//!
//! All passes work on one block and keep the guest-visible state at every
//! fault point identical to unoptimized code.

use crate::ir::{AluOp, Address, IrOp, Operand};

/// What the passes changed, for statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub idioms: u32,
    pub folded: u32,
    pub dead_cr: u32,
}

/// Run every pass over `ir`
pub fn optimize(ir: &mut [IrOp]) -> OptimizeReport {
    let mut report = OptimizeReport { idioms: rewrite_idioms(ir), ..Default::default() };
    report.folded = propagate_constants(ir);
    report.idioms += rewrite_idioms(ir);
    report.dead_cr = eliminate_dead_cr(ir);
    report
}

/// Rewrite `mr`, `nop` and register-clearing forms as moves
pub fn rewrite_idioms(ir: &mut [IrOp]) -> u32 {
    let mut rewritten = 0;
    for op in ir.iter_mut() {
        let replacement = match *op {
            IrOp::Move { rd, src: Operand::Reg(rs) } if rd == rs => Some(IrOp::Nop),
            IrOp::Alu { op: AluOp::Or | AluOp::And, rd, a, b, record: false } if a == b => {
                Some(IrOp::Move { rd, src: a })
            }
            IrOp::Alu { op: AluOp::Xor | AluOp::Sub, rd, a: Operand::Reg(x), b: Operand::Reg(y), record: false }
                if x == y =>
            {
                Some(IrOp::Move { rd, src: Operand::Imm(0) })
            }
            IrOp::Alu {
                op: AluOp::Or | AluOp::Xor | AluOp::Add | AluOp::Sub,
                rd,
                a,
                b: Operand::Imm(0),
                record: false,
            } => Some(match a {
                Operand::Reg(rs) if rs == rd => IrOp::Nop,
                _ => IrOp::Move { rd, src: a },
            }),
            IrOp::Rotate { rd, rs, sh: 0, mask: u32::MAX, insert: false, record: false } => {
                Some(IrOp::Move { rd, src: Operand::Reg(rs) })
            }
            _ => None,
        };
        if let Some(replacement) = replacement {
            if replacement != *op {
                *op = replacement;
                rewritten += 1;
            }
        }
    }
    rewritten
}

fn substitute(operand: Operand, known: &[Option<u32>; 32]) -> Operand {
    match operand {
        Operand::Reg(r) => known[r as usize].map_or(operand, Operand::Imm),
        imm => imm,
    }
}

fn fold_address(addr: Address, known: &[Option<u32>; 32]) -> Address {
    match addr {
        Address::Const(_) => addr,
        Address::Offset { base, offset } => match known[base as usize] {
            Some(value) => Address::Const(value.wrapping_add(offset)),
            None => addr,
        },
        Address::Indexed { base, index } => match (known[base as usize], known[index as usize]) {
            (Some(a), Some(b)) => Address::Const(a.wrapping_add(b)),
            (Some(a), None) => Address::Offset { base: index, offset: a },
            (None, Some(b)) => Address::Offset { base, offset: b },
            (None, None) => addr,
        },
    }
}

/// Forward constant propagation
///
/// Results computed from constants become moves of the constant; register
/// inputs with a known value become immediates and effective addresses
/// built from known registers are precomputed.
pub fn propagate_constants(ir: &mut [IrOp]) -> u32 {
    let mut known: [Option<u32>; 32] = [None; 32];
    let mut folded = 0;

    for op in ir.iter_mut() {
        let before = *op;
        *op = match before {
            IrOp::Nop | IrOp::Branch { .. } | IrOp::BranchCond { .. } => before,
            IrOp::Interpret => {
                known = [None; 32];
                before
            }
            IrOp::Move { rd, src } => {
                let src = substitute(src, &known);
                known[rd as usize] = match src {
                    Operand::Imm(value) => Some(value),
                    Operand::Reg(_) => None,
                };
                IrOp::Move { rd, src }
            }
            IrOp::Alu { op: alu, rd, a, b, record } => {
                let (a, b) = (substitute(a, &known), substitute(b, &known));
                match (a, b) {
                    (Operand::Imm(x), Operand::Imm(y)) => {
                        let value = alu.eval(x, y);
                        known[rd as usize] = Some(value);
                        if record {
                            IrOp::Alu { op: alu, rd, a, b, record }
                        } else {
                            IrOp::Move { rd, src: Operand::Imm(value) }
                        }
                    }
                    _ => {
                        known[rd as usize] = None;
                        IrOp::Alu { op: alu, rd, a, b, record }
                    }
                }
            }
            IrOp::Unary { op: unary, rd, src, record } => match known[src as usize] {
                Some(value) => {
                    let value = unary.eval(value);
                    known[rd as usize] = Some(value);
                    if record {
                        before
                    } else {
                        IrOp::Move { rd, src: Operand::Imm(value) }
                    }
                }
                None => {
                    known[rd as usize] = None;
                    before
                }
            },
            IrOp::Rotate { rd, rs, sh, mask, insert, record } => {
                let value = match (known[rs as usize], known[rd as usize]) {
                    (Some(s), _) if !insert => Some(s.rotate_left(sh) & mask),
                    (Some(s), Some(old)) => Some((s.rotate_left(sh) & mask) | (old & !mask)),
                    _ => None,
                };
                known[rd as usize] = value;
                match value {
                    Some(value) if !record => IrOp::Move { rd, src: Operand::Imm(value) },
                    _ => before,
                }
            }
            IrOp::Compare { crf, a, b, signed } => IrOp::Compare { crf, a, b: substitute(b, &known), signed },
            IrOp::Load { rd, width, extend, addr, update } => {
                let addr = fold_address(addr, &known);
                known[rd as usize] = None;
                if let Some(ra) = update {
                    known[ra as usize] = match addr {
                        Address::Const(ea) => Some(ea),
                        _ => None,
                    };
                }
                IrOp::Load { rd, width, extend, addr, update }
            }
            IrOp::Store { rs, width, reverse, addr, update } => {
                let rs = substitute(rs, &known);
                let addr = fold_address(addr, &known);
                if let Some(ra) = update {
                    known[ra as usize] = match addr {
                        Address::Const(ea) => Some(ea),
                        _ => None,
                    };
                }
                IrOp::Store { rs, width, reverse, addr, update }
            }
        };
        if *op != before {
            folded += 1;
        }
    }
    folded
}

fn record_flag(op: &mut IrOp) -> Option<&mut bool> {
    match op {
        IrOp::Alu { record, .. } | IrOp::Unary { record, .. } | IrOp::Rotate { record, .. } => Some(record),
        _ => None,
    }
}

/// Backward liveness over the eight CR fields
///
/// CR0 writes of record forms and whole compares whose field is overwritten
/// before anything can observe it are dropped. Fault points, branches and
/// interpreted instructions observe the whole CR, as does the block end.
pub fn eliminate_dead_cr(ir: &mut [IrOp]) -> u32 {
    let mut live: u8 = 0xFF;
    let mut removed = 0;

    for op in ir.iter_mut().rev() {
        if op.is_fault_point() || matches!(op, IrOp::Branch { .. } | IrOp::BranchCond { .. }) {
            live = 0xFF;
            continue;
        }
        if let IrOp::Compare { crf, .. } = *op {
            let bit = 0x80u8 >> crf;
            if live & bit == 0 {
                *op = IrOp::Nop;
                removed += 1;
            } else {
                live &= !bit;
            }
            continue;
        }
        if let Some(record) = record_flag(op) {
            if *record {
                if live & 0x80 == 0 {
                    *record = false;
                    removed += 1;
                } else {
                    live &= !0x80;
                }
            }
        }
    }
    removed
}
