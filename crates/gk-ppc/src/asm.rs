//! Minimal Gekko assembler
//!
//! Encoders for the instructions used by tests, benchmarks and the demo
//! program. Register operands follow assembler order (`rlwinm rA, rS, ...`,
//! `lwz rD, d(rA)`); branch offsets are byte displacements.

#[inline]
fn d_form(opcd: u32, rd: u32, ra: u32, imm: i32) -> u32 {
    (opcd << 26) | (rd << 21) | (ra << 16) | (imm as u32 & 0xFFFF)
}

#[inline]
fn x_form(rd: u32, ra: u32, rb: u32, xo: u32, rc: bool) -> u32 {
    (31 << 26) | (rd << 21) | (ra << 16) | (rb << 11) | (xo << 1) | rc as u32
}

#[inline]
fn xo_form(rd: u32, ra: u32, rb: u32, oe: bool, xo: u32, rc: bool) -> u32 {
    x_form(rd, ra, rb, xo, rc) | ((oe as u32) << 10)
}

#[inline]
fn a_form(opcd: u32, d: u32, a: u32, b: u32, c: u32, xo: u32) -> u32 {
    (opcd << 26) | (d << 21) | (a << 16) | (b << 11) | (c << 6) | (xo << 1)
}

#[inline]
fn spr_field(n: u32) -> u32 {
    (((n & 0x1F) << 5) | (n >> 5)) << 11
}

pub fn nop() -> u32 {
    ori(0, 0, 0)
}

pub fn addi(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(14, rd, ra, simm as i32)
}

pub fn li(rd: u32, simm: i16) -> u32 {
    addi(rd, 0, simm)
}

pub fn addis(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(15, rd, ra, simm as i32)
}

pub fn lis(rd: u32, simm: i16) -> u32 {
    addis(rd, 0, simm)
}

pub fn addic(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(12, rd, ra, simm as i32)
}

pub fn addic_rc(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(13, rd, ra, simm as i32)
}

pub fn subfic(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(8, rd, ra, simm as i32)
}

pub fn mulli(rd: u32, ra: u32, simm: i16) -> u32 {
    d_form(7, rd, ra, simm as i32)
}

pub fn cmpwi(crf: u32, ra: u32, simm: i16) -> u32 {
    d_form(11, crf << 2, ra, simm as i32)
}

pub fn cmplwi(crf: u32, ra: u32, uimm: u16) -> u32 {
    d_form(10, crf << 2, ra, uimm as i32)
}

pub fn cmpw(crf: u32, ra: u32, rb: u32) -> u32 {
    x_form(crf << 2, ra, rb, 0, false)
}

pub fn cmplw(crf: u32, ra: u32, rb: u32) -> u32 {
    x_form(crf << 2, ra, rb, 32, false)
}

pub fn add(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 266, false)
}

pub fn add_rc(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 266, true)
}

pub fn addo(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, true, 266, false)
}

pub fn addc(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 10, false)
}

pub fn adde(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 138, false)
}

pub fn subf(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 40, false)
}

pub fn subf_rc(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 40, true)
}

pub fn subfc(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 8, false)
}

pub fn subfe(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 136, false)
}

pub fn neg(rd: u32, ra: u32) -> u32 {
    xo_form(rd, ra, 0, false, 104, false)
}

pub fn mullw(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 235, false)
}

pub fn mulhw(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 75, false)
}

pub fn mulhwu(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 11, false)
}

pub fn divw(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 491, false)
}

pub fn divwo(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, true, 491, false)
}

pub fn divwu(rd: u32, ra: u32, rb: u32) -> u32 {
    xo_form(rd, ra, rb, false, 459, false)
}

pub fn and(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 28, false)
}

pub fn andc(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 60, false)
}

pub fn or(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 444, false)
}

pub fn or_rc(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 444, true)
}

pub fn mr(ra: u32, rs: u32) -> u32 {
    or(ra, rs, rs)
}

pub fn xor(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 316, false)
}

pub fn nor(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 124, false)
}

pub fn nand(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 476, false)
}

pub fn eqv(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 284, false)
}

pub fn slw(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 24, false)
}

pub fn srw(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 536, false)
}

pub fn sraw(ra: u32, rs: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 792, false)
}

pub fn srawi(ra: u32, rs: u32, sh: u32) -> u32 {
    x_form(rs, ra, sh, 824, false)
}

pub fn cntlzw(ra: u32, rs: u32) -> u32 {
    x_form(rs, ra, 0, 26, false)
}

pub fn extsb(ra: u32, rs: u32) -> u32 {
    x_form(rs, ra, 0, 954, false)
}

pub fn extsh(ra: u32, rs: u32) -> u32 {
    x_form(rs, ra, 0, 922, false)
}

pub fn ori(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(24, rs, ra, uimm as i32)
}

pub fn oris(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(25, rs, ra, uimm as i32)
}

pub fn xori(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(26, rs, ra, uimm as i32)
}

pub fn andi_rc(ra: u32, rs: u32, uimm: u16) -> u32 {
    d_form(28, rs, ra, uimm as i32)
}

pub fn rlwinm(ra: u32, rs: u32, sh: u32, mb: u32, me: u32) -> u32 {
    (21 << 26) | (rs << 21) | (ra << 16) | (sh << 11) | (mb << 6) | (me << 1)
}

pub fn rlwimi(ra: u32, rs: u32, sh: u32, mb: u32, me: u32) -> u32 {
    (20 << 26) | (rs << 21) | (ra << 16) | (sh << 11) | (mb << 6) | (me << 1)
}

pub fn slwi(ra: u32, rs: u32, n: u32) -> u32 {
    rlwinm(ra, rs, n, 0, 31 - n)
}

pub fn b(offset: i32) -> u32 {
    (18 << 26) | (offset as u32 & 0x03FF_FFFC)
}

pub fn bl(offset: i32) -> u32 {
    b(offset) | 1
}

pub fn ba(target: u32) -> u32 {
    (18 << 26) | (target & 0x03FF_FFFC) | 2
}

pub fn bc(bo: u32, bi: u32, offset: i32) -> u32 {
    (16 << 26) | (bo << 21) | (bi << 16) | (offset as u32 & 0xFFFC)
}

/// Branch if CR0[EQ]
pub fn beq(offset: i32) -> u32 {
    bc(12, 2, offset)
}

/// Branch if !CR0[EQ]
pub fn bne(offset: i32) -> u32 {
    bc(4, 2, offset)
}

/// Branch if CR0[LT]
pub fn blt(offset: i32) -> u32 {
    bc(12, 0, offset)
}

/// Decrement CTR, branch if non-zero
pub fn bdnz(offset: i32) -> u32 {
    bc(16, 0, offset)
}

pub fn bclr(bo: u32, bi: u32, link: bool) -> u32 {
    (19 << 26) | (bo << 21) | (bi << 16) | (16 << 1) | link as u32
}

pub fn blr() -> u32 {
    bclr(20, 0, false)
}

pub fn bctr() -> u32 {
    (19 << 26) | (20 << 21) | (528 << 1)
}

pub fn bctrl() -> u32 {
    bctr() | 1
}

pub fn cror(bt: u32, ba: u32, bb: u32) -> u32 {
    (19 << 26) | (bt << 21) | (ba << 16) | (bb << 11) | (449 << 1)
}

pub fn crxor(bt: u32, ba: u32, bb: u32) -> u32 {
    (19 << 26) | (bt << 21) | (ba << 16) | (bb << 11) | (193 << 1)
}

pub fn mfcr(rd: u32) -> u32 {
    x_form(rd, 0, 0, 19, false)
}

pub fn mtcrf(crm: u32, rs: u32) -> u32 {
    (31 << 26) | (rs << 21) | ((crm & 0xFF) << 12) | (144 << 1)
}

pub fn mfspr(rd: u32, spr: u32) -> u32 {
    (31 << 26) | (rd << 21) | spr_field(spr) | (339 << 1)
}

pub fn mtspr(spr: u32, rs: u32) -> u32 {
    (31 << 26) | (rs << 21) | spr_field(spr) | (467 << 1)
}

pub fn mflr(rd: u32) -> u32 {
    mfspr(rd, 8)
}

pub fn mtlr(rs: u32) -> u32 {
    mtspr(8, rs)
}

pub fn mtctr(rs: u32) -> u32 {
    mtspr(9, rs)
}

pub fn mfctr(rd: u32) -> u32 {
    mfspr(rd, 9)
}

pub fn mftb(rd: u32, upper: bool) -> u32 {
    (31 << 26) | (rd << 21) | spr_field(if upper { 269 } else { 268 }) | (371 << 1)
}

pub fn mfmsr(rd: u32) -> u32 {
    x_form(rd, 0, 0, 83, false)
}

pub fn mtmsr(rs: u32) -> u32 {
    x_form(rs, 0, 0, 146, false)
}

pub fn mtsr(sr: u32, rs: u32) -> u32 {
    x_form(rs, sr & 0xF, 0, 210, false)
}

pub fn rfi() -> u32 {
    (19 << 26) | (50 << 1)
}

pub fn sc() -> u32 {
    (17 << 26) | 2
}

pub fn twi(to: u32, ra: u32, simm: i16) -> u32 {
    d_form(3, to, ra, simm as i32)
}

pub fn tw(to: u32, ra: u32, rb: u32) -> u32 {
    x_form(to, ra, rb, 4, false)
}

/// Unconditional trap
pub fn trap() -> u32 {
    tw(31, 0, 0)
}

pub fn lwz(rd: u32, d: i16, ra: u32) -> u32 {
    d_form(32, rd, ra, d as i32)
}

pub fn lwzu(rd: u32, d: i16, ra: u32) -> u32 {
    d_form(33, rd, ra, d as i32)
}

pub fn lwzx(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(rd, ra, rb, 23, false)
}

pub fn lbz(rd: u32, d: i16, ra: u32) -> u32 {
    d_form(34, rd, ra, d as i32)
}

pub fn lhz(rd: u32, d: i16, ra: u32) -> u32 {
    d_form(40, rd, ra, d as i32)
}

pub fn lha(rd: u32, d: i16, ra: u32) -> u32 {
    d_form(42, rd, ra, d as i32)
}

pub fn stw(rs: u32, d: i16, ra: u32) -> u32 {
    d_form(36, rs, ra, d as i32)
}

pub fn stwu(rs: u32, d: i16, ra: u32) -> u32 {
    d_form(37, rs, ra, d as i32)
}

pub fn stwx(rs: u32, ra: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 151, false)
}

pub fn stb(rs: u32, d: i16, ra: u32) -> u32 {
    d_form(38, rs, ra, d as i32)
}

pub fn sth(rs: u32, d: i16, ra: u32) -> u32 {
    d_form(44, rs, ra, d as i32)
}

pub fn lhbrx(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(rd, ra, rb, 790, false)
}

pub fn stwbrx(rs: u32, ra: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 662, false)
}

pub fn lwarx(rd: u32, ra: u32, rb: u32) -> u32 {
    x_form(rd, ra, rb, 20, false)
}

pub fn stwcx_rc(rs: u32, ra: u32, rb: u32) -> u32 {
    x_form(rs, ra, rb, 150, true)
}

pub fn lmw(rd: u32, d: i16, ra: u32) -> u32 {
    d_form(46, rd, ra, d as i32)
}

pub fn stmw(rs: u32, d: i16, ra: u32) -> u32 {
    d_form(47, rs, ra, d as i32)
}

pub fn lswi(rd: u32, ra: u32, nb: u32) -> u32 {
    x_form(rd, ra, nb, 597, false)
}

pub fn stswi(rs: u32, ra: u32, nb: u32) -> u32 {
    x_form(rs, ra, nb, 725, false)
}

pub fn lfs(frd: u32, d: i16, ra: u32) -> u32 {
    d_form(48, frd, ra, d as i32)
}

pub fn lfd(frd: u32, d: i16, ra: u32) -> u32 {
    d_form(50, frd, ra, d as i32)
}

pub fn stfs(frs: u32, d: i16, ra: u32) -> u32 {
    d_form(52, frs, ra, d as i32)
}

pub fn stfd(frs: u32, d: i16, ra: u32) -> u32 {
    d_form(54, frs, ra, d as i32)
}

pub fn fadd(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(63, frd, fra, frb, 0, 21)
}

pub fn fadds(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(59, frd, fra, frb, 0, 21)
}

pub fn fsub(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(63, frd, fra, frb, 0, 20)
}

pub fn fmul(frd: u32, fra: u32, frc: u32) -> u32 {
    a_form(63, frd, fra, 0, frc, 25)
}

pub fn fmuls(frd: u32, fra: u32, frc: u32) -> u32 {
    a_form(59, frd, fra, 0, frc, 25)
}

pub fn fdiv(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(63, frd, fra, frb, 0, 18)
}

pub fn fmadd(frd: u32, fra: u32, frc: u32, frb: u32) -> u32 {
    a_form(63, frd, fra, frb, frc, 29)
}

pub fn fmadds(frd: u32, fra: u32, frc: u32, frb: u32) -> u32 {
    a_form(59, frd, fra, frb, frc, 29)
}

pub fn fmr(frd: u32, frb: u32) -> u32 {
    a_form(63, frd, 0, frb, 0, 0) | (72 << 1)
}

pub fn fneg(frd: u32, frb: u32) -> u32 {
    a_form(63, frd, 0, frb, 0, 0) | (40 << 1)
}

pub fn frsp(frd: u32, frb: u32) -> u32 {
    a_form(63, frd, 0, frb, 0, 0) | (12 << 1)
}

pub fn fctiwz(frd: u32, frb: u32) -> u32 {
    a_form(63, frd, 0, frb, 0, 0) | (15 << 1)
}

pub fn fcmpu(crf: u32, fra: u32, frb: u32) -> u32 {
    a_form(63, crf << 2, fra, frb, 0, 0)
}

pub fn mffs(frd: u32) -> u32 {
    a_form(63, frd, 0, 0, 0, 0) | (583 << 1)
}

pub fn ps_add(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(4, frd, fra, frb, 0, 21)
}

pub fn ps_mul(frd: u32, fra: u32, frc: u32) -> u32 {
    a_form(4, frd, fra, 0, frc, 25)
}

pub fn ps_madd(frd: u32, fra: u32, frc: u32, frb: u32) -> u32 {
    a_form(4, frd, fra, frb, frc, 29)
}

pub fn ps_sum0(frd: u32, fra: u32, frc: u32, frb: u32) -> u32 {
    a_form(4, frd, fra, frb, frc, 10)
}

pub fn ps_mr(frd: u32, frb: u32) -> u32 {
    a_form(4, frd, 0, frb, 0, 0) | (72 << 1)
}

pub fn ps_merge00(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(4, frd, fra, frb, 0, 0) | (528 << 1)
}

pub fn ps_merge10(frd: u32, fra: u32, frb: u32) -> u32 {
    a_form(4, frd, fra, frb, 0, 0) | (592 << 1)
}

pub fn psq_l(frd: u32, d: i16, ra: u32, w: bool, i: u32) -> u32 {
    (56 << 26) | (frd << 21) | (ra << 16) | ((w as u32) << 15) | ((i & 7) << 12) | (d as u32 & 0xFFF)
}

pub fn psq_st(frs: u32, d: i16, ra: u32, w: bool, i: u32) -> u32 {
    (60 << 26) | (frs << 21) | (ra << 16) | ((w as u32) << 15) | ((i & 7) << 12) | (d as u32 & 0xFFF)
}

pub fn dcbz(ra: u32, rb: u32) -> u32 {
    x_form(0, ra, rb, 1014, false)
}

pub fn icbi(ra: u32, rb: u32) -> u32 {
    x_form(0, ra, rb, 982, false)
}

pub fn sync() -> u32 {
    x_form(0, 0, 0, 598, false)
}

pub fn isync() -> u32 {
    (19 << 26) | (150 << 1)
}

/// Big-endian byte image of a program
pub fn assemble(program: &[u32]) -> Vec<u8> {
    program.iter().flat_map(|word| word.to_be_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode, Instruction, Op};

    #[test]
    fn test_encodings_match_known_words() {
        assert_eq!(li(3, 100), 0x3860_0064);
        assert_eq!(blr(), 0x4E80_0020);
        assert_eq!(mflr(0), 0x7C08_02A6);
        assert_eq!(add(3, 4, 5), 0x7C64_2A14);
        assert_eq!(nop(), 0x6000_0000);
        assert_eq!(sc(), 0x4400_0002);
        assert_eq!(stwu(1, -16, 1), 0x9421_FFF0);
    }

    #[test]
    fn test_encodings_decode_back() {
        assert_eq!(decode(rlwinm(3, 4, 2, 0, 29)), Op::Rlwinm);
        assert_eq!(decode(fmadd(1, 2, 3, 4)), Op::Fmadd);
        assert_eq!(decode(psq_l(1, 8, 3, false, 2)), Op::PsqL);
        assert_eq!(decode(ps_merge10(1, 2, 3)), Op::PsMerge10);
        assert_eq!(decode(bdnz(-8)), Op::Bc);
        assert_eq!(decode(mtspr(912, 3)), Op::Mtspr);
        assert_eq!(Instruction(mtspr(912, 3)).spr(), 912);
        assert_eq!(Instruction(b(-16)).li(), -16);
    }
}
