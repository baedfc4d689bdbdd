//! Floating point instructions and FPSCR handling
//!
//! Values live in the paired-single registers as IEEE double bit patterns.
//! Single-precision conversions between memory and registers are bit-exact
//! and never go through host float conversion, so signalling NaNs survive
//! loads and stores unchanged.

use gk_memory::GuestMemory;

use super::{program_cause, update_cr1, ExecResult, Trap};
use crate::decoder::{Instruction, Op};
use crate::state::MachineState;

/// FPSCR bits
pub mod fpscr {
    pub const FX: u32 = 1 << 31;
    pub const FEX: u32 = 1 << 30;
    pub const VX: u32 = 1 << 29;
    pub const OX: u32 = 1 << 28;
    pub const UX: u32 = 1 << 27;
    pub const ZX: u32 = 1 << 26;
    pub const XX: u32 = 1 << 25;
    pub const VXSNAN: u32 = 1 << 24;
    pub const VXISI: u32 = 1 << 23;
    pub const VXIDI: u32 = 1 << 22;
    pub const VXZDZ: u32 = 1 << 21;
    pub const VXIMZ: u32 = 1 << 20;
    pub const VXVC: u32 = 1 << 19;
    pub const FR: u32 = 1 << 18;
    pub const FI: u32 = 1 << 17;
    pub const FPRF: u32 = 0x1F << 12;
    pub const FPCC: u32 = 0xF << 12;
    pub const VXSOFT: u32 = 1 << 10;
    pub const VXSQRT: u32 = 1 << 9;
    pub const VXCVI: u32 = 1 << 8;
    pub const RN: u32 = 0b11;

    /// Every invalid-operation cause
    pub const VX_ANY: u32 =
        VXSNAN | VXISI | VXIDI | VXZDZ | VXIMZ | VXVC | VXSOFT | VXSQRT | VXCVI;
    /// Exception bits cleared by `mcrfs`
    pub const MCRFS_CLEARABLE: u32 = 0x9FF8_0700;
}

/// Default quiet NaN produced by invalid operations
pub const DEFAULT_NAN: u64 = 0x7FF8_0000_0000_0000;

const QUIET_BIT: u64 = 1 << 51;

/// FPRF result classes
pub mod fprf {
    pub const QNAN: u32 = 0x11;
    pub const NEG_INF: u32 = 0x09;
    pub const NEG_NORM: u32 = 0x08;
    pub const NEG_DENORM: u32 = 0x18;
    pub const NEG_ZERO: u32 = 0x12;
    pub const POS_ZERO: u32 = 0x02;
    pub const POS_DENORM: u32 = 0x14;
    pub const POS_NORM: u32 = 0x04;
    pub const POS_INF: u32 = 0x05;
}

/// Single-precision bit pattern to double-precision bit pattern
pub fn convert_to_double(value: u32) -> u64 {
    let x = value as u64;
    let exp = (x >> 23) & 0xFF;
    let frac = x & 0x007F_FFFF;

    if exp > 0 && exp < 255 {
        let y = (exp >> 7 == 0) as u64;
        let z = (y << 61) | (y << 60) | (y << 59);
        ((x & 0xC000_0000) << 32) | z | ((x & 0x3FFF_FFFF) << 29)
    } else if exp == 0 && frac != 0 {
        // Denormal: normalize into the wider exponent range
        let mut exp = 1023 - 126u64;
        let mut frac = frac;
        loop {
            frac <<= 1;
            exp -= 1;
            if frac & 0x0080_0000 != 0 {
                break;
            }
        }
        ((x & 0x8000_0000) << 32) | (exp << 52) | ((frac & 0x007F_FFFF) << 29)
    } else {
        // Zero, infinity and NaN
        let y = exp >> 7;
        let z = (y << 61) | (y << 60) | (y << 59);
        ((x & 0xC000_0000) << 32) | z | ((x & 0x3FFF_FFFF) << 29)
    }
}

/// Double-precision bit pattern to single-precision bit pattern (truncating)
pub fn convert_to_single(x: u64) -> u32 {
    let exp = ((x >> 52) & 0x7FF) as u32;
    if exp > 896 || x & !(1u64 << 63) == 0 {
        (((x >> 32) & 0xC000_0000) | ((x >> 29) & 0x3FFF_FFFF)) as u32
    } else if exp >= 874 {
        // Result is a single-precision denormal
        let mut t = (0x8000_0000 | ((x & 0x000F_FFFF_FFFF_FFFF) >> 21)) as u32;
        t >>= 905 - exp;
        t | ((x >> 32) & 0x8000_0000) as u32
    } else {
        (((x >> 32) & 0xC000_0000) | ((x >> 29) & 0x3FFF_FFFF)) as u32
    }
}

#[inline]
pub fn is_snan(value: f64) -> bool {
    value.is_nan() && value.to_bits() & QUIET_BIT == 0
}

#[inline]
fn quiet(value: f64) -> f64 {
    f64::from_bits(value.to_bits() | QUIET_BIT)
}

/// Round a double to single precision
#[inline]
pub fn round_single(value: f64) -> f64 {
    if value.is_nan() {
        // Keep the payload bits the host conversion would drop
        f64::from_bits(value.to_bits() & 0xFFFF_FFFF_E000_0000)
    } else {
        value as f32 as f64
    }
}

/// Raise FPSCR exception bits, setting FX for newly raised ones
pub fn set_exception(state: &mut MachineState, bits: u32) {
    if state.fpscr & bits != bits {
        state.fpscr |= fpscr::FX;
    }
    state.fpscr |= bits;
    update_summary(state);
}

/// Recompute the VX and FEX summary bits
pub fn update_summary(state: &mut MachineState) {
    if state.fpscr & fpscr::VX_ANY != 0 {
        state.fpscr |= fpscr::VX;
    } else {
        state.fpscr &= !fpscr::VX;
    }
    let raised = (state.fpscr >> 25) & 0x1F;
    let enabled = (state.fpscr >> 3) & 0x1F;
    if raised & enabled != 0 {
        state.fpscr |= fpscr::FEX;
    } else {
        state.fpscr &= !fpscr::FEX;
    }
}

/// FPRF class of a result
pub fn classify(value: f64) -> u32 {
    use std::num::FpCategory;
    let negative = value.is_sign_negative();
    match value.classify() {
        FpCategory::Nan => fprf::QNAN,
        FpCategory::Infinite => if negative { fprf::NEG_INF } else { fprf::POS_INF },
        FpCategory::Zero => if negative { fprf::NEG_ZERO } else { fprf::POS_ZERO },
        FpCategory::Subnormal => if negative { fprf::NEG_DENORM } else { fprf::POS_DENORM },
        FpCategory::Normal => if negative { fprf::NEG_NORM } else { fprf::POS_NORM },
    }
}

#[inline]
pub fn update_fprf(state: &mut MachineState, value: f64) {
    state.fpscr = (state.fpscr & !fpscr::FPRF) | (classify(value) << 12);
}

/// First NaN operand, quieted; raises VXSNAN for signalling inputs
pub fn propagate_nan(state: &mut MachineState, operands: &[f64]) -> Option<f64> {
    if operands.iter().any(|&v| is_snan(v)) {
        set_exception(state, fpscr::VXSNAN);
    }
    operands.iter().find(|v| v.is_nan()).map(|&v| quiet(v))
}

/// Arithmetic operation of the FPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

/// `a op b` with PowerPC NaN and invalid-operation rules
pub fn arith(state: &mut MachineState, kind: Arith, a: f64, b: f64) -> f64 {
    if let Some(nan) = propagate_nan(state, &[a, b]) {
        return nan;
    }
    let result = match kind {
        Arith::Add => a + b,
        Arith::Sub => a - b,
        Arith::Mul => a * b,
        Arith::Div => {
            if b == 0.0 && a != 0.0 && !a.is_infinite() {
                set_exception(state, fpscr::ZX);
            }
            a / b
        }
    };
    if result.is_nan() {
        let cause = match kind {
            Arith::Add | Arith::Sub => fpscr::VXISI,
            Arith::Mul => fpscr::VXIMZ,
            Arith::Div if a == 0.0 => fpscr::VXZDZ,
            Arith::Div => fpscr::VXIDI,
        };
        set_exception(state, cause);
        return f64::from_bits(DEFAULT_NAN);
    }
    result
}

/// `a * c + b` (fused), optionally subtracting and/or negating
pub fn madd(state: &mut MachineState, a: f64, c: f64, b: f64, subtract: bool, negate: bool) -> f64 {
    if let Some(nan) = propagate_nan(state, &[a, b, c]) {
        return nan;
    }
    let addend = if subtract { -b } else { b };
    let result = a.mul_add(c, addend);
    if result.is_nan() {
        let product = a * c;
        let cause = if product.is_nan() { fpscr::VXIMZ } else { fpscr::VXISI };
        set_exception(state, cause);
        return f64::from_bits(DEFAULT_NAN);
    }
    if negate {
        -result
    } else {
        result
    }
}

/// Reciprocal estimate
pub fn reciprocal(state: &mut MachineState, b: f64) -> f64 {
    if let Some(nan) = propagate_nan(state, &[b]) {
        return nan;
    }
    if b == 0.0 {
        set_exception(state, fpscr::ZX);
    }
    1.0 / b
}

/// Reciprocal square root estimate
pub fn reciprocal_sqrt(state: &mut MachineState, b: f64) -> f64 {
    if let Some(nan) = propagate_nan(state, &[b]) {
        return nan;
    }
    if b == 0.0 {
        set_exception(state, fpscr::ZX);
        return f64::INFINITY.copysign(b);
    }
    if b < 0.0 {
        set_exception(state, fpscr::VXSQRT);
        return f64::from_bits(DEFAULT_NAN);
    }
    1.0 / b.sqrt()
}

/// Compare and return the FPCC nibble; updates FPSCR exception bits
pub fn compare(state: &mut MachineState, a: f64, b: f64, ordered: bool) -> u32 {
    let cc = if a.is_nan() || b.is_nan() {
        0b0001
    } else if a < b {
        0b1000
    } else if a > b {
        0b0100
    } else {
        0b0010
    };

    if is_snan(a) || is_snan(b) {
        set_exception(state, fpscr::VXSNAN);
        if ordered && state.fpscr & (1 << 7) == 0 {
            set_exception(state, fpscr::VXVC);
        }
    } else if ordered && cc == 0b0001 {
        set_exception(state, fpscr::VXVC);
    }

    state.fpscr = (state.fpscr & !fpscr::FPCC) | (cc << 12);
    cc
}

/// Convert to a 32-bit integer with FPSCR rounding (or truncation)
pub fn to_integer(state: &mut MachineState, b: f64, truncate: bool) -> u32 {
    if b.is_nan() {
        let mut bits = fpscr::VXCVI;
        if is_snan(b) {
            bits |= fpscr::VXSNAN;
        }
        set_exception(state, bits);
        return 0x8000_0000;
    }
    let rounded = if truncate {
        b.trunc()
    } else {
        match state.fpscr & fpscr::RN {
            0 => b.round_ties_even(),
            1 => b.trunc(),
            2 => b.ceil(),
            _ => b.floor(),
        }
    };
    if rounded > i32::MAX as f64 {
        set_exception(state, fpscr::VXCVI);
        0x7FFF_FFFF
    } else if rounded < i32::MIN as f64 {
        set_exception(state, fpscr::VXCVI);
        0x8000_0000
    } else {
        if rounded != b {
            set_exception(state, fpscr::XX);
            state.fpscr |= fpscr::FI;
        } else {
            state.fpscr &= !fpscr::FI;
        }
        rounded as i32 as u32
    }
}

/// Single-precision rounding used by the `*s` forms and `frsp`
fn finish_single(state: &mut MachineState, rd: usize, value: f64) {
    let rounded = round_single(value);
    state.ps[rd].fill(rounded);
    update_fprf(state, rounded);
}

fn finish_double(state: &mut MachineState, rd: usize, value: f64) {
    state.ps[rd].set_ps0_f64(value);
    update_fprf(state, value);
}

pub fn execute(op: Op, state: &mut MachineState, _mem: &mut GuestMemory, inst: Instruction) -> ExecResult {
    let rd = inst.rd();
    let a = state.ps[inst.ra()].ps0_f64();
    let b = state.ps[inst.rb()].ps0_f64();
    let c = state.ps[inst.rc_reg()].ps0_f64();

    match op {
        Op::Fadd | Op::Fsub | Op::Fmul | Op::Fdiv => {
            let kind = match op {
                Op::Fadd => Arith::Add,
                Op::Fsub => Arith::Sub,
                Op::Fmul => Arith::Mul,
                _ => Arith::Div,
            };
            // A-form multiply takes its second operand from frC
            let rhs = if op == Op::Fmul { c } else { b };
            let result = arith(state, kind, a, rhs);
            finish_double(state, rd, result);
        }
        Op::Fadds | Op::Fsubs | Op::Fmuls | Op::Fdivs => {
            let kind = match op {
                Op::Fadds => Arith::Add,
                Op::Fsubs => Arith::Sub,
                Op::Fmuls => Arith::Mul,
                _ => Arith::Div,
            };
            let rhs = if op == Op::Fmuls { c } else { b };
            let result = arith(state, kind, a, rhs);
            finish_single(state, rd, result);
        }
        Op::Fmadd | Op::Fmsub | Op::Fnmadd | Op::Fnmsub => {
            let subtract = matches!(op, Op::Fmsub | Op::Fnmsub);
            let negate = matches!(op, Op::Fnmadd | Op::Fnmsub);
            let result = madd(state, a, c, b, subtract, negate);
            finish_double(state, rd, result);
        }
        Op::Fmadds | Op::Fmsubs | Op::Fnmadds | Op::Fnmsubs => {
            let subtract = matches!(op, Op::Fmsubs | Op::Fnmsubs);
            let negate = matches!(op, Op::Fnmadds | Op::Fnmsubs);
            let result = madd(state, a, c, b, subtract, negate);
            finish_single(state, rd, result);
        }
        Op::Fres => {
            let result = reciprocal(state, b);
            finish_single(state, rd, result);
        }
        Op::Frsqrte => {
            let result = reciprocal_sqrt(state, b);
            finish_double(state, rd, result);
        }
        Op::Frsp => {
            if is_snan(b) {
                set_exception(state, fpscr::VXSNAN);
            }
            let value = if b.is_nan() { quiet(b) } else { b };
            finish_single(state, rd, value);
        }
        Op::Fsel => {
            let result = if !a.is_nan() && a >= 0.0 { c } else { b };
            state.ps[rd].set_ps0_f64(result);
        }
        Op::Fctiw | Op::Fctiwz => {
            let value = to_integer(state, b, op == Op::Fctiwz);
            state.ps[rd].ps0 = 0xFFF8_0000_0000_0000 | value as u64;
        }
        Op::Fmr => state.ps[rd].ps0 = state.ps[inst.rb()].ps0,
        Op::Fneg => state.ps[rd].ps0 = state.ps[inst.rb()].ps0 ^ (1 << 63),
        Op::Fabs => state.ps[rd].ps0 = state.ps[inst.rb()].ps0 & !(1 << 63),
        Op::Fnabs => state.ps[rd].ps0 = state.ps[inst.rb()].ps0 | (1 << 63),
        Op::Fcmpu | Op::Fcmpo => {
            let cc = compare(state, a, b, op == Op::Fcmpo);
            state.set_cr_field(inst.crfd(), cc);
            // Compares have no record form
            return Ok(());
        }
        Op::Mffs => state.ps[rd].ps0 = 0xFFF8_0000_0000_0000 | state.fpscr as u64,
        Op::Mtfsf => {
            let fm = inst.fm();
            let mut mask = 0u32;
            for field in 0..8 {
                if fm & (0x80 >> field) != 0 {
                    mask |= 0xF000_0000 >> (field * 4);
                }
            }
            // FEX and VX are summaries and cannot be written directly
            mask &= !(fpscr::FEX | fpscr::VX);
            let value = state.ps[inst.rb()].ps0 as u32;
            state.fpscr = (state.fpscr & !mask) | (value & mask);
            update_summary(state);
        }
        Op::Mtfsfi => {
            let shift = 28 - inst.crfd() * 4;
            let mask = (0xF << shift) & !(fpscr::FEX | fpscr::VX);
            let imm = (inst.0 >> 12) & 0xF;
            state.fpscr = (state.fpscr & !mask) | ((imm << shift) & mask);
            update_summary(state);
        }
        Op::Mtfsb0 | Op::Mtfsb1 => {
            let bit = 0x8000_0000u32 >> inst.rd();
            if bit & (fpscr::FEX | fpscr::VX) == 0 {
                if op == Op::Mtfsb1 {
                    set_exception(state, bit);
                } else {
                    state.fpscr &= !bit;
                    update_summary(state);
                }
            }
        }
        Op::Mcrfs => {
            let shift = 28 - inst.crfs() * 4;
            let field = (state.fpscr >> shift) & 0xF;
            state.fpscr &= !((0xF << shift) & fpscr::MCRFS_CLEARABLE);
            update_summary(state);
            state.set_cr_field(inst.crfd(), field);
            return Ok(());
        }

        _ => return Err(Trap::Program(program_cause::ILLEGAL)),
    }

    if inst.rc() {
        update_cr1(state);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_to_double_normal_values() {
        assert_eq!(convert_to_double(1.0f32.to_bits()), 1.0f64.to_bits());
        assert_eq!(convert_to_double((-2.5f32).to_bits()), (-2.5f64).to_bits());
        assert_eq!(convert_to_double(0), 0);
        assert_eq!(convert_to_double(0x7F80_0000), f64::INFINITY.to_bits());
    }

    #[test]
    fn test_convert_preserves_snan() {
        let snan = 0x7F80_0001u32;
        let wide = convert_to_double(snan);
        assert!(is_snan(f64::from_bits(wide)));
        assert_eq!(convert_to_single(wide), snan);
    }

    #[test]
    fn test_convert_denormal() {
        let denormal = 0x0000_0001u32;
        let wide = convert_to_double(denormal);
        assert_eq!(f64::from_bits(wide), f32::from_bits(denormal) as f64);
        assert_eq!(convert_to_single(wide), denormal);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(1.0), fprf::POS_NORM);
        assert_eq!(classify(-0.0), fprf::NEG_ZERO);
        assert_eq!(classify(f64::NEG_INFINITY), fprf::NEG_INF);
        assert_eq!(classify(f64::NAN), fprf::QNAN);
    }

    #[test]
    fn test_invalid_subtraction() {
        let mut state = MachineState::new();
        let result = arith(&mut state, Arith::Sub, f64::INFINITY, f64::INFINITY);
        assert_eq!(result.to_bits(), DEFAULT_NAN);
        assert_ne!(state.fpscr & fpscr::VXISI, 0);
        assert_ne!(state.fpscr & fpscr::VX, 0);
        assert_ne!(state.fpscr & fpscr::FX, 0);
    }

    #[test]
    fn test_nan_propagation_order() {
        let mut state = MachineState::new();
        let first = f64::from_bits(0x7FF8_0000_0000_0001);
        let second = f64::from_bits(0x7FF8_0000_0000_0002);
        let result = arith(&mut state, Arith::Add, first, second);
        assert_eq!(result.to_bits(), first.to_bits());
        assert_eq!(state.fpscr & fpscr::VX, 0);
    }

    #[test]
    fn test_to_integer_rounding_modes() {
        let mut state = MachineState::new();
        assert_eq!(to_integer(&mut state, 2.5, false), 2);
        assert_eq!(to_integer(&mut state, -2.5, true), (-2i32) as u32);
        state.fpscr |= 2;
        assert_eq!(to_integer(&mut state, 2.1, false), 3);
        assert_eq!(to_integer(&mut state, 1e20, false), 0x7FFF_FFFF);
        assert_ne!(state.fpscr & fpscr::VXCVI, 0);
    }

    #[test]
    fn test_compare_unordered() {
        let mut state = MachineState::new();
        assert_eq!(compare(&mut state, 1.0, 2.0, false), 0b1000);
        assert_eq!(compare(&mut state, f64::NAN, 2.0, false), 0b0001);
        assert_eq!(state.fpscr & fpscr::VXVC, 0);
        compare(&mut state, f64::NAN, 2.0, true);
        assert_ne!(state.fpscr & fpscr::VXVC, 0);
        assert_eq!(state.fpscr & fpscr::FPCC, 0b0001 << 12);
    }
}
