//! Gekko instruction decoder
//!
//! Decoding goes through static tables built once: the primary opcode selects
//! either an operation directly or one of the extended groups (4, 19, 31, 59,
//! 63), each indexed by its extended opcode field.

use bitflags::bitflags;
use once_cell::sync::Lazy;

/// A raw instruction word with field accessors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Primary opcode (bits 0-5)
    #[inline]
    pub fn opcd(self) -> u32 {
        self.0 >> 26
    }

    /// rD / rS / frD / frS / BO / TO / crbD
    #[inline]
    pub fn rd(self) -> usize {
        ((self.0 >> 21) & 0x1F) as usize
    }

    /// rA / frA / BI / crbA
    #[inline]
    pub fn ra(self) -> usize {
        ((self.0 >> 16) & 0x1F) as usize
    }

    /// rB / frB / crbB
    #[inline]
    pub fn rb(self) -> usize {
        ((self.0 >> 11) & 0x1F) as usize
    }

    /// frC
    #[inline]
    pub fn rc_reg(self) -> usize {
        ((self.0 >> 6) & 0x1F) as usize
    }

    /// Record bit
    #[inline]
    pub fn rc(self) -> bool {
        self.0 & 1 != 0
    }

    /// Overflow-enable bit of XO-form arithmetic
    #[inline]
    pub fn oe(self) -> bool {
        self.0 & 0x400 != 0
    }

    /// Sign-extended 16-bit immediate
    #[inline]
    pub fn simm(self) -> i32 {
        self.0 as u16 as i16 as i32
    }

    /// Zero-extended 16-bit immediate
    #[inline]
    pub fn uimm(self) -> u32 {
        self.0 & 0xFFFF
    }

    /// Shift amount / NB (bits 16-20)
    #[inline]
    pub fn sh(self) -> u32 {
        (self.0 >> 11) & 0x1F
    }

    #[inline]
    pub fn mb(self) -> u32 {
        (self.0 >> 6) & 0x1F
    }

    #[inline]
    pub fn me(self) -> u32 {
        (self.0 >> 1) & 0x1F
    }

    /// Branch options
    #[inline]
    pub fn bo(self) -> u32 {
        (self.0 >> 21) & 0x1F
    }

    /// Branch condition bit
    #[inline]
    pub fn bi(self) -> u32 {
        (self.0 >> 16) & 0x1F
    }

    /// Sign-extended conditional branch displacement
    #[inline]
    pub fn bd(self) -> i32 {
        ((self.0 & 0xFFFC) as u16 as i16) as i32
    }

    /// Sign-extended unconditional branch displacement
    #[inline]
    pub fn li(self) -> i32 {
        (((self.0 & 0x03FF_FFFC) << 6) as i32) >> 6
    }

    /// Absolute address bit
    #[inline]
    pub fn aa(self) -> bool {
        self.0 & 2 != 0
    }

    /// Link bit
    #[inline]
    pub fn lk(self) -> bool {
        self.0 & 1 != 0
    }

    /// Destination CR field
    #[inline]
    pub fn crfd(self) -> usize {
        ((self.0 >> 23) & 7) as usize
    }

    /// Source CR field
    #[inline]
    pub fn crfs(self) -> usize {
        ((self.0 >> 18) & 7) as usize
    }

    /// CR field mask of `mtcrf`
    #[inline]
    pub fn crm(self) -> u32 {
        (self.0 >> 12) & 0xFF
    }

    /// FPSCR field mask of `mtfsf`
    #[inline]
    pub fn fm(self) -> u32 {
        (self.0 >> 17) & 0xFF
    }

    /// SPR number with its two halves swapped back
    #[inline]
    pub fn spr(self) -> usize {
        let raw = (self.0 >> 11) & 0x3FF;
        (((raw & 0x1F) << 5) | (raw >> 5)) as usize
    }

    /// Segment register number
    #[inline]
    pub fn sr(self) -> usize {
        ((self.0 >> 16) & 0xF) as usize
    }

    /// Paired-single quantized immediate offset (12-bit, signed)
    #[inline]
    pub fn ps_d(self) -> i32 {
        ((self.0 << 20) as i32) >> 20
    }

    /// Paired-single W bit (D-form)
    #[inline]
    pub fn ps_w(self) -> bool {
        self.0 & 0x8000 != 0
    }

    /// Paired-single GQR index (D-form)
    #[inline]
    pub fn ps_i(self) -> usize {
        ((self.0 >> 12) & 7) as usize
    }

    /// Paired-single W bit (X-form)
    #[inline]
    pub fn ps_wx(self) -> bool {
        self.0 & 0x400 != 0
    }

    /// Paired-single GQR index (X-form)
    #[inline]
    pub fn ps_ix(self) -> usize {
        ((self.0 >> 7) & 7) as usize
    }
}

bitflags! {
    /// Static properties of an operation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u32 {
        /// May change the instruction flow
        const BRANCH      = 1 << 0;
        /// Always ends a translated block
        const END_BLOCK   = 1 << 1;
        /// Reads memory
        const LOAD        = 1 << 2;
        /// Writes memory
        const STORE       = 1 << 3;
        /// Requires MSR.FP
        const FP          = 1 << 4;
        /// Writes CR0 when the record bit is set
        const RC_CR0      = 1 << 5;
        /// Writes CR1 when the record bit is set
        const RC_CR1      = 1 << 6;
        /// Reads some CR field
        const READS_CR    = 1 << 7;
        /// Writes some CR field unconditionally
        const WRITES_CR   = 1 << 8;
        /// Updates rA with the effective address
        const UPDATE      = 1 << 9;
        /// Supervisor-only
        const PRIVILEGED  = 1 << 10;
        /// Reads or writes XER CA
        const CARRY       = 1 << 11;
    }
}

/// Execution unit an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Integer,
    Branch,
    LoadStore,
    Float,
    Paired,
    System,
}

/// Per-operation metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub unit: Unit,
    pub flags: OpFlags,
    /// Cycles charged for one execution
    pub cycles: u32,
}

macro_rules! ops {
    ($($name:ident => $unit:ident, [$($flag:ident)|*], $cycles:expr;)*) => {
        /// Decoded operation
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Op {
            $($name,)*
        }

        impl Op {
            /// Static metadata
            pub const fn info(self) -> OpInfo {
                match self {
                    $(Op::$name => OpInfo {
                        unit: Unit::$unit,
                        flags: OpFlags::empty()$(.union(OpFlags::$flag))*,
                        cycles: $cycles,
                    },)*
                }
            }
        }
    };
}

ops! {
    Illegal => System, [END_BLOCK], 1;

    // Integer arithmetic
    Addi => Integer, [], 1;
    Addis => Integer, [], 1;
    Addic => Integer, [CARRY], 1;
    AddicRc => Integer, [CARRY | WRITES_CR], 1;
    Subfic => Integer, [CARRY], 1;
    Mulli => Integer, [], 3;
    Add => Integer, [RC_CR0], 1;
    Addc => Integer, [RC_CR0 | CARRY], 1;
    Adde => Integer, [RC_CR0 | CARRY], 1;
    Addme => Integer, [RC_CR0 | CARRY], 1;
    Addze => Integer, [RC_CR0 | CARRY], 1;
    Subf => Integer, [RC_CR0], 1;
    Subfc => Integer, [RC_CR0 | CARRY], 1;
    Subfe => Integer, [RC_CR0 | CARRY], 1;
    Subfme => Integer, [RC_CR0 | CARRY], 1;
    Subfze => Integer, [RC_CR0 | CARRY], 1;
    Neg => Integer, [RC_CR0], 1;
    Mullw => Integer, [RC_CR0], 5;
    Mulhw => Integer, [RC_CR0], 5;
    Mulhwu => Integer, [RC_CR0], 6;
    Divw => Integer, [RC_CR0], 40;
    Divwu => Integer, [RC_CR0], 40;

    // Compare and trap
    Cmpi => Integer, [WRITES_CR], 1;
    Cmpli => Integer, [WRITES_CR], 1;
    Cmp => Integer, [WRITES_CR], 1;
    Cmpl => Integer, [WRITES_CR], 1;
    Twi => Integer, [END_BLOCK], 2;
    Tw => Integer, [END_BLOCK], 2;

    // Logical
    Ori => Integer, [], 1;
    Oris => Integer, [], 1;
    Xori => Integer, [], 1;
    Xoris => Integer, [], 1;
    AndiRc => Integer, [WRITES_CR], 1;
    AndisRc => Integer, [WRITES_CR], 1;
    And => Integer, [RC_CR0], 1;
    Andc => Integer, [RC_CR0], 1;
    Or => Integer, [RC_CR0], 1;
    Orc => Integer, [RC_CR0], 1;
    Xor => Integer, [RC_CR0], 1;
    Nand => Integer, [RC_CR0], 1;
    Nor => Integer, [RC_CR0], 1;
    Eqv => Integer, [RC_CR0], 1;
    Extsb => Integer, [RC_CR0], 1;
    Extsh => Integer, [RC_CR0], 1;
    Cntlzw => Integer, [RC_CR0], 1;

    // Rotate and shift
    Rlwimi => Integer, [RC_CR0], 1;
    Rlwinm => Integer, [RC_CR0], 1;
    Rlwnm => Integer, [RC_CR0], 1;
    Slw => Integer, [RC_CR0], 1;
    Srw => Integer, [RC_CR0], 1;
    Sraw => Integer, [RC_CR0 | CARRY], 1;
    Srawi => Integer, [RC_CR0 | CARRY], 1;

    // Branches
    B => Branch, [BRANCH | END_BLOCK], 1;
    Bc => Branch, [BRANCH | END_BLOCK | READS_CR], 1;
    Bclr => Branch, [BRANCH | END_BLOCK | READS_CR], 1;
    Bcctr => Branch, [BRANCH | END_BLOCK | READS_CR], 1;

    // Condition register
    Mcrf => Branch, [READS_CR | WRITES_CR], 1;
    Crand => Branch, [READS_CR | WRITES_CR], 1;
    Crandc => Branch, [READS_CR | WRITES_CR], 1;
    Creqv => Branch, [READS_CR | WRITES_CR], 1;
    Crnand => Branch, [READS_CR | WRITES_CR], 1;
    Crnor => Branch, [READS_CR | WRITES_CR], 1;
    Cror => Branch, [READS_CR | WRITES_CR], 1;
    Crorc => Branch, [READS_CR | WRITES_CR], 1;
    Crxor => Branch, [READS_CR | WRITES_CR], 1;
    Mcrxr => Branch, [WRITES_CR], 1;
    Mfcr => Branch, [READS_CR], 1;
    Mtcrf => Branch, [WRITES_CR], 1;

    // Integer loads and stores
    Lwz => LoadStore, [LOAD], 1;
    Lwzu => LoadStore, [LOAD | UPDATE], 1;
    Lwzx => LoadStore, [LOAD], 1;
    Lwzux => LoadStore, [LOAD | UPDATE], 1;
    Lbz => LoadStore, [LOAD], 1;
    Lbzu => LoadStore, [LOAD | UPDATE], 1;
    Lbzx => LoadStore, [LOAD], 1;
    Lbzux => LoadStore, [LOAD | UPDATE], 1;
    Lhz => LoadStore, [LOAD], 1;
    Lhzu => LoadStore, [LOAD | UPDATE], 1;
    Lhzx => LoadStore, [LOAD], 1;
    Lhzux => LoadStore, [LOAD | UPDATE], 1;
    Lha => LoadStore, [LOAD], 1;
    Lhau => LoadStore, [LOAD | UPDATE], 1;
    Lhax => LoadStore, [LOAD], 1;
    Lhaux => LoadStore, [LOAD | UPDATE], 1;
    Lhbrx => LoadStore, [LOAD], 1;
    Lwbrx => LoadStore, [LOAD], 1;
    Lwarx => LoadStore, [LOAD], 2;
    Lmw => LoadStore, [LOAD], 11;
    Lswi => LoadStore, [LOAD], 11;
    Lswx => LoadStore, [LOAD], 11;
    Stw => LoadStore, [STORE], 1;
    Stwu => LoadStore, [STORE | UPDATE], 1;
    Stwx => LoadStore, [STORE], 1;
    Stwux => LoadStore, [STORE | UPDATE], 1;
    Stb => LoadStore, [STORE], 1;
    Stbu => LoadStore, [STORE | UPDATE], 1;
    Stbx => LoadStore, [STORE], 1;
    Stbux => LoadStore, [STORE | UPDATE], 1;
    Sth => LoadStore, [STORE], 1;
    Sthu => LoadStore, [STORE | UPDATE], 1;
    Sthx => LoadStore, [STORE], 1;
    Sthux => LoadStore, [STORE | UPDATE], 1;
    Sthbrx => LoadStore, [STORE], 1;
    Stwbrx => LoadStore, [STORE], 1;
    StwcxRc => LoadStore, [STORE | WRITES_CR], 8;
    Stmw => LoadStore, [STORE], 11;
    Stswi => LoadStore, [STORE], 11;
    Stswx => LoadStore, [STORE], 11;

    // Floating point loads and stores
    Lfs => LoadStore, [LOAD | FP], 1;
    Lfsu => LoadStore, [LOAD | FP | UPDATE], 1;
    Lfsx => LoadStore, [LOAD | FP], 1;
    Lfsux => LoadStore, [LOAD | FP | UPDATE], 1;
    Lfd => LoadStore, [LOAD | FP], 1;
    Lfdu => LoadStore, [LOAD | FP | UPDATE], 1;
    Lfdx => LoadStore, [LOAD | FP], 1;
    Lfdux => LoadStore, [LOAD | FP | UPDATE], 1;
    Stfs => LoadStore, [STORE | FP], 1;
    Stfsu => LoadStore, [STORE | FP | UPDATE], 1;
    Stfsx => LoadStore, [STORE | FP], 1;
    Stfsux => LoadStore, [STORE | FP | UPDATE], 1;
    Stfd => LoadStore, [STORE | FP], 1;
    Stfdu => LoadStore, [STORE | FP | UPDATE], 1;
    Stfdx => LoadStore, [STORE | FP], 1;
    Stfdux => LoadStore, [STORE | FP | UPDATE], 1;
    Stfiwx => LoadStore, [STORE | FP], 1;

    // Floating point arithmetic
    Fadd => Float, [FP | RC_CR1], 1;
    Fadds => Float, [FP | RC_CR1], 1;
    Fsub => Float, [FP | RC_CR1], 1;
    Fsubs => Float, [FP | RC_CR1], 1;
    Fmul => Float, [FP | RC_CR1], 2;
    Fmuls => Float, [FP | RC_CR1], 1;
    Fdiv => Float, [FP | RC_CR1], 31;
    Fdivs => Float, [FP | RC_CR1], 17;
    Fmadd => Float, [FP | RC_CR1], 2;
    Fmadds => Float, [FP | RC_CR1], 1;
    Fmsub => Float, [FP | RC_CR1], 2;
    Fmsubs => Float, [FP | RC_CR1], 1;
    Fnmadd => Float, [FP | RC_CR1], 2;
    Fnmadds => Float, [FP | RC_CR1], 1;
    Fnmsub => Float, [FP | RC_CR1], 2;
    Fnmsubs => Float, [FP | RC_CR1], 1;
    Fres => Float, [FP | RC_CR1], 1;
    Frsqrte => Float, [FP | RC_CR1], 1;
    Fsel => Float, [FP | RC_CR1], 1;
    Frsp => Float, [FP | RC_CR1], 1;
    Fctiw => Float, [FP | RC_CR1], 1;
    Fctiwz => Float, [FP | RC_CR1], 1;
    Fmr => Float, [FP | RC_CR1], 1;
    Fneg => Float, [FP | RC_CR1], 1;
    Fabs => Float, [FP | RC_CR1], 1;
    Fnabs => Float, [FP | RC_CR1], 1;
    Fcmpu => Float, [FP | WRITES_CR], 1;
    Fcmpo => Float, [FP | WRITES_CR], 1;
    Mffs => Float, [FP | RC_CR1], 1;
    Mtfsf => Float, [FP | RC_CR1], 1;
    Mtfsfi => Float, [FP | RC_CR1], 1;
    Mtfsb0 => Float, [FP | RC_CR1], 1;
    Mtfsb1 => Float, [FP | RC_CR1], 1;
    Mcrfs => Float, [FP | WRITES_CR], 1;

    // Paired singles
    PsqL => Paired, [LOAD | FP], 3;
    PsqLu => Paired, [LOAD | FP | UPDATE], 3;
    PsqLx => Paired, [LOAD | FP], 3;
    PsqLux => Paired, [LOAD | FP | UPDATE], 3;
    PsqSt => Paired, [STORE | FP], 3;
    PsqStu => Paired, [STORE | FP | UPDATE], 3;
    PsqStx => Paired, [STORE | FP], 3;
    PsqStux => Paired, [STORE | FP | UPDATE], 3;
    PsAdd => Paired, [FP | RC_CR1], 1;
    PsSub => Paired, [FP | RC_CR1], 1;
    PsMul => Paired, [FP | RC_CR1], 1;
    PsDiv => Paired, [FP | RC_CR1], 17;
    PsMadd => Paired, [FP | RC_CR1], 1;
    PsMsub => Paired, [FP | RC_CR1], 1;
    PsNmadd => Paired, [FP | RC_CR1], 1;
    PsNmsub => Paired, [FP | RC_CR1], 1;
    PsSum0 => Paired, [FP | RC_CR1], 1;
    PsSum1 => Paired, [FP | RC_CR1], 1;
    PsMuls0 => Paired, [FP | RC_CR1], 1;
    PsMuls1 => Paired, [FP | RC_CR1], 1;
    PsMadds0 => Paired, [FP | RC_CR1], 1;
    PsMadds1 => Paired, [FP | RC_CR1], 1;
    PsSel => Paired, [FP | RC_CR1], 1;
    PsRes => Paired, [FP | RC_CR1], 1;
    PsRsqrte => Paired, [FP | RC_CR1], 1;
    PsMr => Paired, [FP | RC_CR1], 1;
    PsNeg => Paired, [FP | RC_CR1], 1;
    PsAbs => Paired, [FP | RC_CR1], 1;
    PsNabs => Paired, [FP | RC_CR1], 1;
    PsMerge00 => Paired, [FP | RC_CR1], 1;
    PsMerge01 => Paired, [FP | RC_CR1], 1;
    PsMerge10 => Paired, [FP | RC_CR1], 1;
    PsMerge11 => Paired, [FP | RC_CR1], 1;
    PsCmpu0 => Paired, [FP | WRITES_CR], 1;
    PsCmpo0 => Paired, [FP | WRITES_CR], 1;
    PsCmpu1 => Paired, [FP | WRITES_CR], 1;
    PsCmpo1 => Paired, [FP | WRITES_CR], 1;
    DcbzL => Paired, [STORE], 3;

    // System
    Sc => System, [BRANCH | END_BLOCK], 2;
    Rfi => System, [BRANCH | END_BLOCK | PRIVILEGED], 2;
    Mfmsr => System, [PRIVILEGED], 1;
    Mtmsr => System, [END_BLOCK | PRIVILEGED], 1;
    Mfspr => System, [], 1;
    Mtspr => System, [], 2;
    Mftb => System, [], 1;
    Mfsr => System, [PRIVILEGED], 3;
    Mfsrin => System, [PRIVILEGED], 3;
    Mtsr => System, [END_BLOCK | PRIVILEGED], 2;
    Mtsrin => System, [END_BLOCK | PRIVILEGED], 2;
    Dcbz => System, [STORE], 3;
    Dcbf => System, [], 3;
    Dcbst => System, [], 3;
    Dcbi => System, [PRIVILEGED], 3;
    Dcbt => System, [], 1;
    Dcbtst => System, [], 1;
    Icbi => System, [], 4;
    Sync => System, [], 3;
    Isync => System, [END_BLOCK], 1;
    Eieio => System, [], 1;
    Tlbie => System, [PRIVILEGED], 1;
    Tlbsync => System, [PRIVILEGED], 1;
}

struct DecodeTables {
    primary: [Op; 64],
    group4: [Op; 1024],
    group19: [Op; 1024],
    group31: [Op; 1024],
    group59: [Op; 32],
    group63: [Op; 1024],
}

impl DecodeTables {
    fn build() -> Self {
        use Op::*;

        let mut t = Self {
            primary: [Illegal; 64],
            group4: [Illegal; 1024],
            group19: [Illegal; 1024],
            group31: [Illegal; 1024],
            group59: [Illegal; 32],
            group63: [Illegal; 1024],
        };

        for (opcd, op) in [
            (3, Twi), (7, Mulli), (8, Subfic), (10, Cmpli), (11, Cmpi), (12, Addic),
            (13, AddicRc), (14, Addi), (15, Addis), (16, Bc), (17, Sc), (18, B),
            (20, Rlwimi), (21, Rlwinm), (23, Rlwnm), (24, Ori), (25, Oris), (26, Xori),
            (27, Xoris), (28, AndiRc), (29, AndisRc), (32, Lwz), (33, Lwzu), (34, Lbz),
            (35, Lbzu), (36, Stw), (37, Stwu), (38, Stb), (39, Stbu), (40, Lhz),
            (41, Lhzu), (42, Lha), (43, Lhau), (44, Sth), (45, Sthu), (46, Lmw),
            (47, Stmw), (48, Lfs), (49, Lfsu), (50, Lfd), (51, Lfdu), (52, Stfs),
            (53, Stfsu), (54, Stfd), (55, Stfdu), (56, PsqL), (57, PsqLu), (60, PsqSt),
            (61, PsqStu),
        ] {
            t.primary[opcd] = op;
        }

        // Group 4: 5-bit A-form ops fill every slot sharing their low bits,
        // then the 6-bit quantized indexed forms, then the 10-bit forms
        for (xo, op) in [
            (10, PsSum0), (11, PsSum1), (12, PsMuls0), (13, PsMuls1), (14, PsMadds0),
            (15, PsMadds1), (18, PsDiv), (20, PsSub), (21, PsAdd), (23, PsSel),
            (24, PsRes), (25, PsMul), (26, PsRsqrte), (28, PsMsub), (29, PsMadd),
            (30, PsNmsub), (31, PsNmadd),
        ] {
            for high in 0..32 {
                t.group4[(high << 5) | xo] = op;
            }
        }
        for (xo, op) in [(6, PsqLx), (7, PsqStx), (38, PsqLux), (39, PsqStux)] {
            for high in 0..16 {
                t.group4[(high << 6) | xo] = op;
            }
        }
        for (xo, op) in [
            (0, PsCmpu0), (32, PsCmpo0), (40, PsNeg), (64, PsCmpu1), (72, PsMr),
            (96, PsCmpo1), (136, PsNabs), (264, PsAbs), (528, PsMerge00),
            (560, PsMerge01), (592, PsMerge10), (624, PsMerge11), (1014, DcbzL),
        ] {
            t.group4[xo] = op;
        }

        for (xo, op) in [
            (0, Mcrf), (16, Bclr), (33, Crnor), (50, Rfi), (129, Crandc), (150, Isync),
            (193, Crxor), (225, Crnand), (257, Crand), (289, Creqv), (417, Crorc),
            (449, Cror), (528, Bcctr),
        ] {
            t.group19[xo] = op;
        }

        // XO-form arithmetic appears with and without OE
        for (xo, op) in [
            (266, Add), (10, Addc), (138, Adde), (234, Addme), (202, Addze), (40, Subf),
            (8, Subfc), (136, Subfe), (232, Subfme), (200, Subfze), (104, Neg),
            (235, Mullw), (75, Mulhw), (11, Mulhwu), (491, Divw), (459, Divwu),
        ] {
            t.group31[xo] = op;
            t.group31[xo | 0x200] = op;
        }
        for (xo, op) in [
            (0, Cmp), (32, Cmpl), (4, Tw), (19, Mfcr), (20, Lwarx), (23, Lwzx), (24, Slw),
            (26, Cntlzw), (28, And), (55, Lwzux), (60, Andc), (83, Mfmsr), (86, Dcbf),
            (87, Lbzx), (104, Neg), (119, Lbzux), (124, Nor), (144, Mtcrf), (146, Mtmsr),
            (150, StwcxRc), (151, Stwx), (183, Stwux), (210, Mtsr), (215, Stbx),
            (242, Mtsrin), (246, Dcbtst), (247, Stbux), (278, Dcbt), (279, Lhzx),
            (284, Eqv), (306, Tlbie), (311, Lhzux), (316, Xor), (339, Mfspr), (343, Lhax),
            (371, Mftb), (375, Lhaux), (407, Sthx), (412, Orc), (439, Sthux), (444, Or),
            (467, Mtspr), (470, Dcbi), (476, Nand), (512, Mcrxr), (533, Lswx),
            (534, Lwbrx), (535, Lfsx), (536, Srw), (566, Tlbsync), (567, Lfsux),
            (595, Mfsr), (597, Lswi), (598, Sync), (599, Lfdx), (631, Lfdux),
            (659, Mfsrin), (661, Stswx), (662, Stwbrx), (663, Stfsx), (695, Stfsux),
            (725, Stswi), (727, Stfdx), (759, Stfdux), (790, Lhbrx), (792, Sraw),
            (824, Srawi), (854, Eieio), (918, Sthbrx), (922, Extsh), (954, Extsb),
            (982, Icbi), (983, Stfiwx), (1014, Dcbz), (54, Dcbst),
        ] {
            t.group31[xo] = op;
        }

        for (xo, op) in [
            (18, Fdivs), (20, Fsubs), (21, Fadds), (24, Fres), (25, Fmuls), (28, Fmsubs),
            (29, Fmadds), (30, Fnmsubs), (31, Fnmadds),
        ] {
            t.group59[xo] = op;
        }

        for (xo, op) in [
            (18, Fdiv), (20, Fsub), (21, Fadd), (23, Fsel), (25, Fmul), (26, Frsqrte),
            (28, Fmsub), (29, Fmadd), (30, Fnmsub), (31, Fnmadd),
        ] {
            for high in 0..32 {
                t.group63[(high << 5) | xo] = op;
            }
        }
        for (xo, op) in [
            (0, Fcmpu), (12, Frsp), (14, Fctiw), (15, Fctiwz), (32, Fcmpo), (38, Mtfsb1),
            (40, Fneg), (64, Mcrfs), (70, Mtfsb0), (72, Fmr), (134, Mtfsfi), (136, Fnabs),
            (264, Fabs), (583, Mffs), (711, Mtfsf),
        ] {
            t.group63[xo] = op;
        }

        t
    }
}

static TABLES: Lazy<DecodeTables> = Lazy::new(DecodeTables::build);

/// Decode an instruction word
#[inline]
pub fn decode(inst: u32) -> Op {
    let t = &*TABLES;
    let xo10 = ((inst >> 1) & 0x3FF) as usize;
    match inst >> 26 {
        4 => t.group4[xo10],
        19 => t.group19[xo10],
        31 => t.group31[xo10],
        59 => t.group59[xo10 & 0x1F],
        63 => t.group63[xo10],
        opcd => t.primary[opcd as usize],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_primary() {
        assert_eq!(decode(0x3860_0064), Op::Addi); // addi r3, r0, 100
        assert_eq!(decode(0x4800_0010), Op::B);
        assert_eq!(decode(0x4400_0002), Op::Sc);
        assert_eq!(decode(0x0000_0000), Op::Illegal);
    }

    #[test]
    fn test_decode_extended_groups() {
        assert_eq!(decode(0x7C64_2A14), Op::Add); // add r3, r4, r5
        assert_eq!(decode(0x7C64_2E14), Op::Add); // addo r3, r4, r5
        assert_eq!(decode(0x4E80_0020), Op::Bclr); // blr
        assert_eq!(decode(0x7C08_02A6), Op::Mfspr); // mflr r0
        assert_eq!(decode(0xFC20_1090), Op::Fmr); // fmr f1, f2
        assert_eq!(decode(0xFC22_18FA), Op::Fmadd); // fmadd f1, f2, f3, f3
        assert_eq!(decode(0xEC22_182A), Op::Fadds);
        assert_eq!(decode(0x1022_182A), Op::PsAdd);
        assert_eq!(decode(0x1022_14A0), Op::PsMerge10);
        assert_eq!(decode(0x1022_1420), Op::PsMerge00);
        assert_eq!(decode(0x1022_000C), Op::PsqLx);
    }

    #[test]
    fn test_fields() {
        let inst = Instruction(0x3865_FFCE); // addi r3, r5, -50
        assert_eq!(inst.rd(), 3);
        assert_eq!(inst.ra(), 5);
        assert_eq!(inst.simm(), -50);

        let mflr = Instruction(0x7C08_02A6);
        assert_eq!(mflr.spr(), 8);

        let b_back = Instruction(0x4BFF_FFFC); // b -4
        assert_eq!(b_back.li(), -4);

        let psq = Instruction(0xE061_8FF8); // psq_l f3, -8(r1), 1, 0
        assert_eq!(psq.ps_d(), -8);
        assert!(psq.ps_w());
        assert_eq!(psq.ps_i(), 0);
    }

    #[test]
    fn test_op_metadata() {
        assert!(Op::Bc.info().flags.contains(OpFlags::END_BLOCK));
        assert!(Op::Lfd.info().flags.contains(OpFlags::FP));
        assert_eq!(Op::Divw.info().cycles, 40);
        assert_eq!(Op::PsMerge00.info().unit, Unit::Paired);
    }
}
