//! Paired-single instructions and quantized loads/stores
//!
//! Arithmetic results are rounded to single precision in both slots.
//! Quantized accesses convert between memory formats and the register
//! doubles according to the GQR selected by the instruction.

use gk_memory::{GuestMemory, TranslationMode};

use super::float::{self, convert_to_double, convert_to_single, round_single, Arith};
use super::load_store::{load, store};
use super::{ea_x, ea_xu, program_cause, ra_or_zero, update_cr1, ExecResult, Trap};
use crate::decoder::{Instruction, Op};
use crate::state::{spr, MachineState};

/// Quantization type field of a GQR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizeType {
    Float,
    U8,
    U16,
    S8,
    S16,
}

impl QuantizeType {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            4 => Self::U8,
            5 => Self::U16,
            6 => Self::S8,
            7 => Self::S16,
            // Types 1-3 are reserved and behave as float
            _ => Self::Float,
        }
    }

    /// Bytes per element in memory
    pub fn size(self) -> u32 {
        match self {
            Self::Float => 4,
            Self::U16 | Self::S16 => 2,
            Self::U8 | Self::S8 => 1,
        }
    }
}

/// Decoded GQR halves: `(type, scale)` for loads or stores
#[inline]
pub fn gqr_load_params(gqr: u32) -> (QuantizeType, i32) {
    (QuantizeType::from_bits(gqr >> 16), sign_extend_scale(gqr >> 24))
}

#[inline]
pub fn gqr_store_params(gqr: u32) -> (QuantizeType, i32) {
    (QuantizeType::from_bits(gqr), sign_extend_scale(gqr >> 8))
}

#[inline]
fn sign_extend_scale(raw: u32) -> i32 {
    (((raw & 0x3F) << 26) as i32) >> 26
}

/// Read one element and convert it to a register double
fn dequantize(
    mem: &mut GuestMemory,
    ea: u32,
    kind: QuantizeType,
    scale: i32,
    mode: TranslationMode,
) -> Result<u64, Trap> {
    let factor = 2f64.powi(-scale);
    let value = match kind {
        QuantizeType::Float => return Ok(convert_to_double(load::<u32>(mem, ea, mode)?)),
        QuantizeType::U8 => load::<u8>(mem, ea, mode)? as f64,
        QuantizeType::U16 => load::<u16>(mem, ea, mode)? as f64,
        QuantizeType::S8 => load::<u8>(mem, ea, mode)? as i8 as f64,
        QuantizeType::S16 => load::<u16>(mem, ea, mode)? as i16 as f64,
    };
    Ok((value * factor).to_bits())
}

/// Convert a register double and write it as one element
fn quantize(
    mem: &mut GuestMemory,
    ea: u32,
    bits: u64,
    kind: QuantizeType,
    scale: i32,
    mode: TranslationMode,
) -> ExecResult {
    if kind == QuantizeType::Float {
        store::<u32>(mem, ea, convert_to_single(bits), mode)?;
        return Ok(());
    }
    let scaled = f64::from_bits(bits) * 2f64.powi(scale);
    // `as` saturates and maps NaN to zero
    match kind {
        QuantizeType::U8 => store::<u8>(mem, ea, scaled as u8, mode)?,
        QuantizeType::U16 => store::<u16>(mem, ea, scaled as u16, mode)?,
        QuantizeType::S8 => store::<u8>(mem, ea, scaled as i8 as u8, mode)?,
        QuantizeType::S16 => store::<u16>(mem, ea, scaled as i16 as u16, mode)?,
        QuantizeType::Float => {}
    }
    Ok(())
}

fn quantized_access(
    op: Op,
    state: &mut MachineState,
    mem: &mut GuestMemory,
    inst: Instruction,
) -> ExecResult {
    if state.spr[spr::HID2] & spr::HID2_LSQE == 0 {
        return Err(Trap::Program(program_cause::ILLEGAL));
    }
    let mode = state.data_mode();
    let (ea, w, i, update) = match op {
        Op::PsqL | Op::PsqSt => {
            (ra_or_zero(state, inst).wrapping_add(inst.ps_d() as u32), inst.ps_w(), inst.ps_i(), false)
        }
        Op::PsqLu | Op::PsqStu => {
            (state.gpr[inst.ra()].wrapping_add(inst.ps_d() as u32), inst.ps_w(), inst.ps_i(), true)
        }
        Op::PsqLx | Op::PsqStx => (ea_x(state, inst), inst.ps_wx(), inst.ps_ix(), false),
        _ => (ea_xu(state, inst), inst.ps_wx(), inst.ps_ix(), true),
    };
    let gqr = state.spr[spr::GQR0 + i];
    let rd = inst.rd();

    if matches!(op, Op::PsqL | Op::PsqLu | Op::PsqLx | Op::PsqLux) {
        let (kind, scale) = gqr_load_params(gqr);
        let ps0 = dequantize(mem, ea, kind, scale, mode)?;
        let ps1 = if w {
            1.0f64.to_bits()
        } else {
            dequantize(mem, ea.wrapping_add(kind.size()), kind, scale, mode)?
        };
        state.ps[rd].ps0 = ps0;
        state.ps[rd].ps1 = ps1;
    } else {
        let (kind, scale) = gqr_store_params(gqr);
        let reg = state.ps[rd];
        if w {
            quantize(mem, ea, reg.ps0, kind, scale, mode)?;
        } else {
            // Translate both elements before writing either
            mem.translate(ea, gk_memory::AccessKind::Write, mode)?;
            mem.translate(
                ea.wrapping_add(2 * kind.size() - 1),
                gk_memory::AccessKind::Write,
                mode,
            )?;
            quantize(mem, ea, reg.ps0, kind, scale, mode)?;
            quantize(mem, ea.wrapping_add(kind.size()), reg.ps1, kind, scale, mode)?;
        }
    }

    if update {
        state.gpr[inst.ra()] = ea;
    }
    Ok(())
}

pub fn execute(op: Op, state: &mut MachineState, mem: &mut GuestMemory, inst: Instruction) -> ExecResult {
    match op {
        Op::PsqL
        | Op::PsqLu
        | Op::PsqLx
        | Op::PsqLux
        | Op::PsqSt
        | Op::PsqStu
        | Op::PsqStx
        | Op::PsqStux => return quantized_access(op, state, mem, inst),
        Op::DcbzL => {
            if state.spr[spr::HID2] & spr::HID2_LCE == 0 {
                return Err(Trap::Program(program_cause::ILLEGAL));
            }
            let ea = ea_x(state, inst);
            mem.zero_line(ea, state.data_mode())?;
            return Ok(());
        }
        _ => {}
    }

    let rd = inst.rd();
    let a = state.ps[inst.ra()];
    let b = state.ps[inst.rb()];
    let c = state.ps[inst.rc_reg()];
    let (a0, a1) = (a.ps0_f64(), a.ps1_f64());
    let (b0, b1) = (b.ps0_f64(), b.ps1_f64());
    let (c0, c1) = (c.ps0_f64(), c.ps1_f64());

    let (ps0, ps1) = match op {
        Op::PsAdd => (float::arith(state, Arith::Add, a0, b0), float::arith(state, Arith::Add, a1, b1)),
        Op::PsSub => (float::arith(state, Arith::Sub, a0, b0), float::arith(state, Arith::Sub, a1, b1)),
        Op::PsMul => (float::arith(state, Arith::Mul, a0, c0), float::arith(state, Arith::Mul, a1, c1)),
        Op::PsDiv => (float::arith(state, Arith::Div, a0, b0), float::arith(state, Arith::Div, a1, b1)),
        Op::PsMadd | Op::PsMsub | Op::PsNmadd | Op::PsNmsub => {
            let subtract = matches!(op, Op::PsMsub | Op::PsNmsub);
            let negate = matches!(op, Op::PsNmadd | Op::PsNmsub);
            (
                float::madd(state, a0, c0, b0, subtract, negate),
                float::madd(state, a1, c1, b1, subtract, negate),
            )
        }
        Op::PsSum0 => (float::arith(state, Arith::Add, a0, b1), c1),
        Op::PsSum1 => (c0, float::arith(state, Arith::Add, a0, b1)),
        Op::PsMuls0 => (float::arith(state, Arith::Mul, a0, c0), float::arith(state, Arith::Mul, a1, c0)),
        Op::PsMuls1 => (float::arith(state, Arith::Mul, a0, c1), float::arith(state, Arith::Mul, a1, c1)),
        Op::PsMadds0 => (
            float::madd(state, a0, c0, b0, false, false),
            float::madd(state, a1, c0, b1, false, false),
        ),
        Op::PsMadds1 => (
            float::madd(state, a0, c1, b0, false, false),
            float::madd(state, a1, c1, b1, false, false),
        ),
        Op::PsSel => (
            if !a0.is_nan() && a0 >= 0.0 { c0 } else { b0 },
            if !a1.is_nan() && a1 >= 0.0 { c1 } else { b1 },
        ),
        Op::PsRes => (float::reciprocal(state, b0), float::reciprocal(state, b1)),
        Op::PsRsqrte => (float::reciprocal_sqrt(state, b0), float::reciprocal_sqrt(state, b1)),

        // Bitwise moves: no rounding, no FPRF
        Op::PsMr | Op::PsNeg | Op::PsAbs | Op::PsNabs | Op::PsMerge00 | Op::PsMerge01
        | Op::PsMerge10 | Op::PsMerge11 => {
            let sign = 1u64 << 63;
            let (ps0, ps1) = match op {
                Op::PsMr => (b.ps0, b.ps1),
                Op::PsNeg => (b.ps0 ^ sign, b.ps1 ^ sign),
                Op::PsAbs => (b.ps0 & !sign, b.ps1 & !sign),
                Op::PsNabs => (b.ps0 | sign, b.ps1 | sign),
                Op::PsMerge00 => (a.ps0, b.ps0),
                Op::PsMerge01 => (a.ps0, b.ps1),
                Op::PsMerge10 => (a.ps1, b.ps0),
                _ => (a.ps1, b.ps1),
            };
            state.ps[rd].ps0 = ps0;
            state.ps[rd].ps1 = ps1;
            if inst.rc() {
                update_cr1(state);
            }
            return Ok(());
        }
        Op::PsCmpu0 | Op::PsCmpo0 | Op::PsCmpu1 | Op::PsCmpo1 => {
            let ordered = matches!(op, Op::PsCmpo0 | Op::PsCmpo1);
            let (lhs, rhs) = if matches!(op, Op::PsCmpu0 | Op::PsCmpo0) { (a0, b0) } else { (a1, b1) };
            let cc = float::compare(state, lhs, rhs, ordered);
            state.set_cr_field(inst.crfd(), cc);
            return Ok(());
        }

        _ => return Err(Trap::Program(program_cause::ILLEGAL)),
    };

    let ps0 = round_single(ps0);
    let ps1 = round_single(ps1);
    state.ps[rd].set_ps0_f64(ps0);
    state.ps[rd].set_ps1_f64(ps1);
    float::update_fprf(state, ps0);
    if inst.rc() {
        update_cr1(state);
    }
    Ok(())
}
