//! Gekko disassembler

use std::fmt;

use gk_memory::{GuestMemory, TranslationMode};
use gk_ppc::decoder::{decode, Instruction, Op, OpFlags};
use gk_ppc::state::spr;

/// Disassembled instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    /// Address of the instruction
    pub address: u32,
    /// Raw instruction word
    pub word: u32,
    pub mnemonic: String,
    pub operands: String,
    /// Static target of a relative or absolute branch
    pub branch_target: Option<u32>,
}

impl DisassembledInstruction {
    /// Get the instruction word as a hex string
    pub fn word_hex(&self) -> String {
        format!("{:08X}", self.word)
    }
}

impl fmt::Display for DisassembledInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            f.write_str(&self.mnemonic)
        } else {
            write!(f, "{:8} {}", self.mnemonic, self.operands)
        }
    }
}

const CONDITIONS: [&str; 8] = ["ge", "le", "ne", "ns", "lt", "gt", "eq", "so"];

/// `AndiRc` -> `andi.`, `PsqLu` -> `psq_lu`, `PsMerge00` -> `ps_merge00`
fn base_mnemonic(op: Op) -> String {
    let name = format!("{op:?}");
    let (name, record) = match name.strip_suffix("Rc") {
        Some(stem) => (stem.to_string(), true),
        None => (name, false),
    };
    let mut out = if let Some(rest) = name.strip_prefix("Psq") {
        format!("psq_{}", rest.to_lowercase())
    } else if let Some(rest) = name.strip_prefix("Ps") {
        format!("ps_{}", rest.to_lowercase())
    } else if op == Op::DcbzL {
        "dcbz_l".to_string()
    } else {
        name.to_lowercase()
    };
    if record {
        out.push('.');
    }
    out
}

fn has_overflow_form(op: Op) -> bool {
    matches!(
        op,
        Op::Add
            | Op::Addc
            | Op::Adde
            | Op::Addme
            | Op::Addze
            | Op::Subf
            | Op::Subfc
            | Op::Subfe
            | Op::Subfme
            | Op::Subfze
            | Op::Neg
            | Op::Mullw
            | Op::Divw
            | Op::Divwu
    )
}

fn spr_name(n: usize) -> Option<&'static str> {
    Some(match n {
        spr::XER => "xer",
        spr::LR => "lr",
        spr::CTR => "ctr",
        spr::DEC => "dec",
        spr::SRR0 => "srr0",
        spr::SRR1 => "srr1",
        _ => return None,
    })
}

/// Gekko instruction disassembler
pub struct GekkoDisassembler;

impl GekkoDisassembler {
    /// Disassemble a single instruction at `address`
    pub fn disassemble(address: u32, word: u32) -> DisassembledInstruction {
        let op = decode(word);
        let inst = Instruction(word);
        let (rd, ra, rb) = (inst.rd(), inst.ra(), inst.rb());
        let mut mnemonic = base_mnemonic(op);
        let mut branch_target = None;

        if has_overflow_form(op) && inst.oe() {
            mnemonic.push('o');
        }
        if op.info().flags.intersects(OpFlags::RC_CR0 | OpFlags::RC_CR1) && inst.rc() {
            mnemonic.push('.');
        }

        let operands = match op {
            Op::Illegal => {
                mnemonic = ".long".to_string();
                format!("0x{word:08X}")
            }

            Op::Addi | Op::Addis if ra == 0 => {
                mnemonic = if op == Op::Addi { "li" } else { "lis" }.to_string();
                if op == Op::Addi {
                    format!("r{rd}, {}", inst.simm())
                } else {
                    format!("r{rd}, 0x{:X}", inst.uimm())
                }
            }
            Op::Addi | Op::Addic | Op::AddicRc | Op::Subfic | Op::Mulli => {
                format!("r{rd}, r{ra}, {}", inst.simm())
            }
            Op::Addis => format!("r{rd}, r{ra}, 0x{:X}", inst.uimm()),

            Op::Ori if rd == 0 && ra == 0 && inst.uimm() == 0 => {
                mnemonic = "nop".to_string();
                String::new()
            }
            Op::Ori | Op::Oris | Op::Xori | Op::Xoris | Op::AndiRc | Op::AndisRc => {
                format!("r{ra}, r{rd}, 0x{:X}", inst.uimm())
            }

            Op::Cmpi | Op::Cmpli | Op::Cmp | Op::Cmpl => {
                mnemonic = match op {
                    Op::Cmpi => "cmpwi",
                    Op::Cmpli => "cmplwi",
                    Op::Cmp => "cmpw",
                    _ => "cmplw",
                }
                .to_string();
                let crf = inst.crfd();
                let second = match op {
                    Op::Cmpi => inst.simm().to_string(),
                    Op::Cmpli => format!("0x{:X}", inst.uimm()),
                    _ => format!("r{rb}"),
                };
                if crf == 0 {
                    format!("r{ra}, {second}")
                } else {
                    format!("cr{crf}, r{ra}, {second}")
                }
            }

            Op::Twi => format!("{rd}, r{ra}, {}", inst.simm()),
            Op::Tw if rd == 31 => {
                mnemonic = "trap".to_string();
                String::new()
            }
            Op::Tw => format!("{rd}, r{ra}, r{rb}"),

            Op::Neg | Op::Addme | Op::Addze | Op::Subfme | Op::Subfze => format!("r{rd}, r{ra}"),
            Op::Add
            | Op::Addc
            | Op::Adde
            | Op::Subf
            | Op::Subfc
            | Op::Subfe
            | Op::Mullw
            | Op::Mulhw
            | Op::Mulhwu
            | Op::Divw
            | Op::Divwu => format!("r{rd}, r{ra}, r{rb}"),

            Op::Or if rd == rb => {
                mnemonic = if inst.rc() { "mr." } else { "mr" }.to_string();
                format!("r{ra}, r{rd}")
            }
            Op::And | Op::Andc | Op::Or | Op::Orc | Op::Xor | Op::Nand | Op::Nor | Op::Eqv | Op::Slw | Op::Srw | Op::Sraw => {
                format!("r{ra}, r{rd}, r{rb}")
            }
            Op::Extsb | Op::Extsh | Op::Cntlzw => format!("r{ra}, r{rd}"),
            Op::Srawi => format!("r{ra}, r{rd}, {}", inst.sh()),
            Op::Rlwinm | Op::Rlwimi => {
                format!("r{ra}, r{rd}, {}, {}, {}", inst.sh(), inst.mb(), inst.me())
            }
            Op::Rlwnm => format!("r{ra}, r{rd}, r{rb}, {}, {}", inst.mb(), inst.me()),

            Op::B => {
                let target = if inst.aa() { inst.li() as u32 } else { address.wrapping_add(inst.li() as u32) };
                branch_target = Some(target);
                mnemonic = format!("b{}{}", if inst.lk() { "l" } else { "" }, if inst.aa() { "a" } else { "" });
                format!("->0x{target:08X}")
            }
            Op::Bc => {
                let target = if inst.aa() { inst.bd() as u32 } else { address.wrapping_add(inst.bd() as u32) };
                branch_target = Some(target);
                let (name, prefix) = Self::conditional("", inst);
                mnemonic = name;
                if prefix.is_empty() {
                    format!("->0x{target:08X}")
                } else {
                    format!("{prefix}, ->0x{target:08X}")
                }
            }
            Op::Bclr | Op::Bcctr => {
                let suffix = if op == Op::Bclr { "lr" } else { "ctr" };
                let (name, operands) = Self::conditional(suffix, inst);
                mnemonic = name;
                operands
            }

            Op::Mcrf => format!("cr{}, cr{}", inst.crfd(), inst.crfs()),
            Op::Crand | Op::Crandc | Op::Creqv | Op::Crnand | Op::Crnor | Op::Cror | Op::Crorc | Op::Crxor => {
                format!("{rd}, {ra}, {rb}")
            }
            Op::Mcrxr => format!("cr{}", inst.crfd()),
            Op::Mfcr | Op::Mfmsr => format!("r{rd}"),
            Op::Mtmsr => format!("r{rd}"),
            Op::Mtcrf => format!("0x{:02X}, r{rd}", inst.crm()),

            Op::Lwz | Op::Lwzu | Op::Lbz | Op::Lbzu | Op::Lhz | Op::Lhzu | Op::Lha | Op::Lhau | Op::Lmw
            | Op::Stw | Op::Stwu | Op::Stb | Op::Stbu | Op::Sth | Op::Sthu | Op::Stmw => {
                format!("r{rd}, {}(r{ra})", inst.simm())
            }
            Op::Lfs | Op::Lfsu | Op::Lfd | Op::Lfdu | Op::Stfs | Op::Stfsu | Op::Stfd | Op::Stfdu => {
                format!("f{rd}, {}(r{ra})", inst.simm())
            }
            Op::Lfsx | Op::Lfsux | Op::Lfdx | Op::Lfdux | Op::Stfsx | Op::Stfsux | Op::Stfdx | Op::Stfdux | Op::Stfiwx => {
                format!("f{rd}, r{ra}, r{rb}")
            }
            Op::Lswi | Op::Stswi => format!("r{rd}, r{ra}, {}", if rb == 0 { 32 } else { rb }),
            Op::Lwzx
            | Op::Lwzux
            | Op::Lbzx
            | Op::Lbzux
            | Op::Lhzx
            | Op::Lhzux
            | Op::Lhax
            | Op::Lhaux
            | Op::Lhbrx
            | Op::Lwbrx
            | Op::Lwarx
            | Op::Lswx
            | Op::Stwx
            | Op::Stwux
            | Op::Stbx
            | Op::Stbux
            | Op::Sthx
            | Op::Sthux
            | Op::Sthbrx
            | Op::Stwbrx
            | Op::StwcxRc
            | Op::Stswx => format!("r{rd}, r{ra}, r{rb}"),

            Op::Fadd | Op::Fadds | Op::Fsub | Op::Fsubs | Op::Fdiv | Op::Fdivs
            | Op::PsAdd | Op::PsSub | Op::PsDiv
            | Op::PsMerge00 | Op::PsMerge01 | Op::PsMerge10 | Op::PsMerge11 => format!("f{rd}, f{ra}, f{rb}"),
            Op::Fmul | Op::Fmuls | Op::PsMul | Op::PsMuls0 | Op::PsMuls1 => {
                format!("f{rd}, f{ra}, f{}", inst.rc_reg())
            }
            Op::Fmadd
            | Op::Fmadds
            | Op::Fmsub
            | Op::Fmsubs
            | Op::Fnmadd
            | Op::Fnmadds
            | Op::Fnmsub
            | Op::Fnmsubs
            | Op::Fsel
            | Op::PsMadd
            | Op::PsMsub
            | Op::PsNmadd
            | Op::PsNmsub
            | Op::PsSum0
            | Op::PsSum1
            | Op::PsMadds0
            | Op::PsMadds1
            | Op::PsSel => format!("f{rd}, f{ra}, f{}, f{rb}", inst.rc_reg()),
            Op::Fres
            | Op::Frsqrte
            | Op::Frsp
            | Op::Fctiw
            | Op::Fctiwz
            | Op::Fmr
            | Op::Fneg
            | Op::Fabs
            | Op::Fnabs
            | Op::PsRes
            | Op::PsRsqrte
            | Op::PsMr
            | Op::PsNeg
            | Op::PsAbs
            | Op::PsNabs => format!("f{rd}, f{rb}"),
            Op::Fcmpu | Op::Fcmpo | Op::PsCmpu0 | Op::PsCmpo0 | Op::PsCmpu1 | Op::PsCmpo1 => {
                format!("cr{}, f{ra}, f{rb}", inst.crfd())
            }
            Op::Mffs => format!("f{rd}"),
            Op::Mtfsf => format!("0x{:02X}, f{rb}", inst.fm()),
            Op::Mtfsfi => format!("cr{}, {}", inst.crfd(), (word >> 12) & 0xF),
            Op::Mtfsb0 | Op::Mtfsb1 => format!("{rd}"),
            Op::Mcrfs => format!("cr{}, cr{}", inst.crfd(), inst.crfs()),

            Op::PsqL | Op::PsqLu | Op::PsqSt | Op::PsqStu => format!(
                "f{rd}, {}(r{ra}), {}, qr{}",
                inst.ps_d(),
                inst.ps_w() as u8,
                inst.ps_i()
            ),
            Op::PsqLx | Op::PsqLux | Op::PsqStx | Op::PsqStux => format!(
                "f{rd}, r{ra}, r{rb}, {}, qr{}",
                inst.ps_wx() as u8,
                inst.ps_ix()
            ),

            Op::Mfspr | Op::Mtspr => {
                let n = inst.spr();
                let to = op == Op::Mtspr;
                match spr_name(n) {
                    Some(name) => {
                        mnemonic = format!("{}{}", if to { "mt" } else { "mf" }, name);
                        format!("r{rd}")
                    }
                    None if to => format!("{n}, r{rd}"),
                    None => format!("r{rd}, {n}"),
                }
            }
            Op::Mftb => {
                if inst.spr() == spr::TBU_READ {
                    mnemonic = "mftbu".to_string();
                }
                format!("r{rd}")
            }
            Op::Mfsr => format!("r{rd}, {}", inst.sr()),
            Op::Mtsr => format!("{}, r{rd}", inst.sr()),
            Op::Mfsrin | Op::Mtsrin => format!("r{rd}, r{rb}"),
            Op::Dcbz | Op::Dcbf | Op::Dcbst | Op::Dcbi | Op::Dcbt | Op::Dcbtst | Op::Icbi | Op::DcbzL => {
                format!("r{ra}, r{rb}")
            }
            Op::Tlbie => format!("r{rb}"),
            Op::Sc | Op::Rfi | Op::Sync | Op::Isync | Op::Eieio | Op::Tlbsync => String::new(),
        };

        DisassembledInstruction { address, word, mnemonic, operands, branch_target }
    }

    /// Simplified mnemonic for a conditional branch; `suffix` is `lr`,
    /// `ctr` or empty for `bc`
    fn conditional(suffix: &str, inst: Instruction) -> (String, String) {
        let (bo, bi) = (inst.bo(), inst.bi());
        let link = if inst.lk() { "l" } else { "" };
        let absolute = if suffix.is_empty() && inst.aa() { "a" } else { "" };

        if bo & 0x04 == 0 {
            // CTR decrement
            let zero = if bo & 0x02 != 0 { "z" } else { "nz" };
            let condition = if bo & 0x10 != 0 {
                String::new()
            } else if bo & 0x08 != 0 {
                "t".to_string()
            } else {
                "f".to_string()
            };
            let operands = if bo & 0x10 != 0 { String::new() } else { bi.to_string() };
            return (format!("bd{zero}{condition}{suffix}{link}{absolute}"), operands);
        }
        if bo & 0x10 != 0 {
            return (format!("b{suffix}{link}{absolute}"), String::new());
        }
        let condition = CONDITIONS[(((bo & 8) >> 1) + (bi & 3)) as usize];
        let operands = if bi >= 4 { format!("cr{}", bi >> 2) } else { String::new() };
        (format!("b{condition}{suffix}{link}{absolute}"), operands)
    }

    /// Disassemble `count` instructions starting at `start`
    ///
    /// Unreadable words (untranslated or MMIO) come out as `.long`
    /// placeholders with no word.
    pub fn disassemble_range(
        mem: &mut GuestMemory,
        start: u32,
        count: usize,
        mode: TranslationMode,
    ) -> Vec<DisassembledInstruction> {
        (0..count as u32)
            .map(|i| {
                let address = start.wrapping_add(i * 4);
                match mem.peek::<u32>(address, mode) {
                    Some(word) => Self::disassemble(address, word),
                    None => DisassembledInstruction {
                        address,
                        word: 0,
                        mnemonic: ".long".to_string(),
                        operands: "??".to_string(),
                        branch_target: None,
                    },
                }
            })
            .collect()
    }
}
