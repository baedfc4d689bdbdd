//! Gekko machine state
//!
//! One canonical copy lives on the CPU thread. Engines read and write it
//! directly; the native backend addresses its fields by offset, so the layout
//! is `#[repr(C)]`.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use gk_core::error::StateError;
use gk_core::savestate::{expect_consumed, ReadLeExt, WriteLeExt};
use gk_memory::TranslationMode;

/// CPU cycles per time base / decrementer tick
pub const TIMER_RATIO: u64 = 12;

/// Processor version register value of the Gekko
pub const GEKKO_PVR: u32 = 0x0008_3214;

/// Special purpose register numbers
pub mod spr {
    pub const XER: usize = 1;
    pub const LR: usize = 8;
    pub const CTR: usize = 9;
    pub const DSISR: usize = 18;
    pub const DAR: usize = 19;
    pub const DEC: usize = 22;
    pub const SDR1: usize = 25;
    pub const SRR0: usize = 26;
    pub const SRR1: usize = 27;
    pub const TBL_READ: usize = 268;
    pub const TBU_READ: usize = 269;
    pub const SPRG0: usize = 272;
    pub const SPRG3: usize = 275;
    pub const EAR: usize = 282;
    pub const TBL_WRITE: usize = 284;
    pub const TBU_WRITE: usize = 285;
    pub const PVR: usize = 287;
    pub const IBAT0U: usize = 528;
    pub const DBAT3L: usize = 543;
    pub const GQR0: usize = 912;
    pub const HID2: usize = 920;
    pub const WPAR: usize = 921;
    pub const DMAU: usize = 922;
    pub const DMAL: usize = 923;
    pub const MMCR0: usize = 952;
    pub const PMC1: usize = 953;
    pub const HID0: usize = 1008;
    pub const HID1: usize = 1009;
    pub const IABR: usize = 1010;
    pub const DABR: usize = 1013;
    pub const L2CR: usize = 1017;

    /// HID0 instruction cache flash invalidate
    pub const HID0_ICFI: u32 = 1 << 11;
    /// HID2 paired-single load/store quantization enable
    pub const HID2_LSQE: u32 = 1 << 31;
    /// HID2 write gather pipe enable
    pub const HID2_WPE: u32 = 1 << 30;
    /// HID2 paired-single enable
    pub const HID2_PSE: u32 = 1 << 29;
    /// HID2 locked cache enable
    pub const HID2_LCE: u32 = 1 << 28;

    /// True for BAT registers
    pub fn is_bat(n: usize) -> bool {
        (IBAT0U..=DBAT3L).contains(&n)
    }

    /// True when SPR access requires supervisor mode
    pub fn is_privileged(n: usize) -> bool {
        n & 0x10 != 0
    }

    /// Writes that change translation, timers or cache state
    pub fn write_has_side_effects(n: usize) -> bool {
        is_bat(n)
            || matches!(n, SDR1 | DEC | TBL_WRITE | TBU_WRITE | HID0 | HID2)
            || (GQR0..GQR0 + 8).contains(&n)
    }
}

bitflags! {
    /// Machine state register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Msr: u32 {
        const POW = 1 << 18;
        const ILE = 1 << 16;
        const EE  = 1 << 15;
        const PR  = 1 << 14;
        const FP  = 1 << 13;
        const ME  = 1 << 12;
        const FE0 = 1 << 11;
        const SE  = 1 << 10;
        const BE  = 1 << 9;
        const FE1 = 1 << 8;
        const IP  = 1 << 6;
        const IR  = 1 << 5;
        const DR  = 1 << 4;
        const PM  = 1 << 2;
        const RI  = 1 << 1;
        const LE  = 1 << 0;
    }
}

bitflags! {
    /// Pending exceptions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExceptionFlags: u32 {
        const DECREMENTER   = 1 << 0;
        const SYSCALL       = 1 << 1;
        const EXTERNAL      = 1 << 2;
        const DSI           = 1 << 3;
        const ISI           = 1 << 4;
        const ALIGNMENT     = 1 << 5;
        const FPU_UNAVAILABLE = 1 << 6;
        const PROGRAM       = 1 << 7;
        const PERFORMANCE_MONITOR = 1 << 8;

        /// Raised by the instruction that just executed
        const SYNCHRONOUS = Self::SYSCALL.bits()
            | Self::DSI.bits()
            | Self::ISI.bits()
            | Self::ALIGNMENT.bits()
            | Self::FPU_UNAVAILABLE.bits()
            | Self::PROGRAM.bits();
    }
}

/// XER bits
pub const XER_SO: u32 = 1 << 31;
pub const XER_OV: u32 = 1 << 30;
pub const XER_CA: u32 = 1 << 29;

/// CR field values
pub const CR_LT: u32 = 0b1000;
pub const CR_GT: u32 = 0b0100;
pub const CR_EQ: u32 = 0b0010;
pub const CR_SO: u32 = 0b0001;

/// Paired-single register; `ps0` doubles as the FPR
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PairedSingle {
    /// Bit pattern of the first slot (an IEEE double)
    pub ps0: u64,
    /// Bit pattern of the second slot (an IEEE double)
    pub ps1: u64,
}

impl PairedSingle {
    #[inline]
    pub fn ps0_f64(&self) -> f64 {
        f64::from_bits(self.ps0)
    }

    #[inline]
    pub fn ps1_f64(&self) -> f64 {
        f64::from_bits(self.ps1)
    }

    #[inline]
    pub fn set_ps0_f64(&mut self, value: f64) {
        self.ps0 = value.to_bits();
    }

    #[inline]
    pub fn set_ps1_f64(&mut self, value: f64) {
        self.ps1 = value.to_bits();
    }

    /// Write the same value to both slots
    #[inline]
    pub fn fill(&mut self, value: f64) {
        self.ps0 = value.to_bits();
        self.ps1 = value.to_bits();
    }
}

/// Time base and decrementer bookkeeping, expressed against `cycles`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TimerState {
    pub tb_start_value: u64,
    pub tb_start_cycles: u64,
    pub dec_start_value: u32,
    pub dec_start_cycles: u64,
    /// DEC was written and the decrementer event needs rescheduling
    pub dec_written: bool,
}

/// Complete architectural state of the CPU
#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct MachineState {
    /// General purpose registers
    pub gpr: [u32; 32],
    /// Current instruction address
    pub pc: u32,
    /// Next instruction address
    pub npc: u32,
    /// Condition register
    pub cr: u32,
    /// Fixed-point exception register
    pub xer: u32,
    /// Machine state register
    pub msr: u32,
    /// Floating-point status and control register
    pub fpscr: u32,
    /// Pending exceptions
    pub exceptions: ExceptionFlags,
    /// SRR1 cause bits of a pending program exception
    pub program_reason: u32,
    /// Paired-single / floating point registers
    pub ps: [PairedSingle; 32],
    /// Special purpose registers
    pub spr: [u32; 1024],
    /// Retired CPU cycles
    pub cycles: u64,
    /// Time base and decrementer
    pub timers: TimerState,
}

impl MachineState {
    /// Create the reset state
    pub fn new() -> Self {
        let mut state = Self {
            gpr: [0; 32],
            pc: 0,
            npc: 4,
            cr: 0,
            xer: 0,
            msr: 0,
            fpscr: 0,
            exceptions: ExceptionFlags::empty(),
            program_reason: 0,
            ps: [PairedSingle::default(); 32],
            spr: [0; 1024],
            cycles: 0,
            timers: TimerState::default(),
        };
        state.spr[spr::PVR] = GEKKO_PVR;
        state
    }

    #[inline]
    pub fn gpr(&self, index: usize) -> u32 {
        self.gpr[index]
    }

    #[inline]
    pub fn set_gpr(&mut self, index: usize, value: u32) {
        self.gpr[index] = value;
    }

    #[inline]
    pub fn lr(&self) -> u32 {
        self.spr[spr::LR]
    }

    #[inline]
    pub fn set_lr(&mut self, value: u32) {
        self.spr[spr::LR] = value;
    }

    #[inline]
    pub fn ctr(&self) -> u32 {
        self.spr[spr::CTR]
    }

    #[inline]
    pub fn set_ctr(&mut self, value: u32) {
        self.spr[spr::CTR] = value;
    }

    #[inline]
    pub fn msr(&self) -> Msr {
        Msr::from_bits_retain(self.msr)
    }

    /// Translation mode for data accesses (MSR.DR)
    #[inline]
    pub fn data_mode(&self) -> TranslationMode {
        TranslationMode::from_enabled(self.msr & Msr::DR.bits() != 0)
    }

    /// Translation mode for instruction fetch (MSR.IR)
    #[inline]
    pub fn instruction_mode(&self) -> TranslationMode {
        TranslationMode::from_enabled(self.msr & Msr::IR.bits() != 0)
    }

    #[inline]
    pub fn xer_ca(&self) -> bool {
        self.xer & XER_CA != 0
    }

    #[inline]
    pub fn set_xer_ca(&mut self, carry: bool) {
        if carry {
            self.xer |= XER_CA;
        } else {
            self.xer &= !XER_CA;
        }
    }

    #[inline]
    pub fn xer_so(&self) -> bool {
        self.xer & XER_SO != 0
    }

    /// Set or clear OV; setting OV also sets the sticky SO
    #[inline]
    pub fn set_xer_ov(&mut self, overflow: bool) {
        if overflow {
            self.xer |= XER_OV | XER_SO;
        } else {
            self.xer &= !XER_OV;
        }
    }

    /// Read a 4-bit CR field (field 0 is the most significant)
    #[inline]
    pub fn cr_field(&self, field: usize) -> u32 {
        (self.cr >> (28 - field * 4)) & 0xF
    }

    #[inline]
    pub fn set_cr_field(&mut self, field: usize, value: u32) {
        let shift = 28 - field * 4;
        self.cr = (self.cr & !(0xF << shift)) | ((value & 0xF) << shift);
    }

    /// Read a CR bit (bit 0 is the most significant)
    #[inline]
    pub fn cr_bit(&self, bit: u32) -> bool {
        (self.cr >> (31 - bit)) & 1 != 0
    }

    #[inline]
    pub fn set_cr_bit(&mut self, bit: u32, value: bool) {
        let mask = 1 << (31 - bit);
        if value {
            self.cr |= mask;
        } else {
            self.cr &= !mask;
        }
    }

    /// Set CR0 from a signed comparison of `value` against zero
    #[inline]
    pub fn update_cr0(&mut self, value: u32) {
        let mut field = match (value as i32).cmp(&0) {
            std::cmp::Ordering::Less => CR_LT,
            std::cmp::Ordering::Greater => CR_GT,
            std::cmp::Ordering::Equal => CR_EQ,
        };
        if self.xer_so() {
            field |= CR_SO;
        }
        self.set_cr_field(0, field);
    }

    /// Current time base value
    pub fn timebase(&self) -> u64 {
        let elapsed = self.cycles.saturating_sub(self.timers.tb_start_cycles) / TIMER_RATIO;
        self.timers.tb_start_value.wrapping_add(elapsed)
    }

    /// Write the lower or upper half of the time base
    pub fn write_timebase(&mut self, upper: bool, value: u32) {
        let current = self.timebase();
        let new = if upper {
            (current & 0xFFFF_FFFF) | ((value as u64) << 32)
        } else {
            (current & !0xFFFF_FFFF) | value as u64
        };
        self.timers.tb_start_value = new;
        self.timers.tb_start_cycles = self.cycles;
    }

    /// Current decrementer value
    pub fn decrementer(&self) -> u32 {
        let elapsed = self.cycles.saturating_sub(self.timers.dec_start_cycles) / TIMER_RATIO;
        self.timers.dec_start_value.wrapping_sub(elapsed as u32)
    }

    /// Write DEC; returns true when the write itself raises the
    /// decrementer exception (bit 0 going from clear to set)
    pub fn write_decrementer(&mut self, value: u32) -> bool {
        let old = self.decrementer();
        self.timers.dec_start_value = value;
        self.timers.dec_start_cycles = self.cycles;
        self.timers.dec_written = true;
        old & 0x8000_0000 == 0 && value & 0x8000_0000 != 0
    }

    /// Serialize to a savestate payload
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), StateError> {
        for &reg in &self.gpr {
            out.write_u32_le(reg)?;
        }
        for reg in [
            self.pc,
            self.npc,
            self.cr,
            self.xer,
            self.msr,
            self.fpscr,
            self.exceptions.bits(),
            self.program_reason,
        ] {
            out.write_u32_le(reg)?;
        }
        for &half in bytemuck::cast_slice::<PairedSingle, u64>(&self.ps) {
            out.write_u64_le(half)?;
        }
        for &reg in self.spr.iter() {
            out.write_u32_le(reg)?;
        }
        out.write_u64_le(self.cycles)?;
        out.write_u64_le(self.timers.tb_start_value)?;
        out.write_u64_le(self.timers.tb_start_cycles)?;
        out.write_u32_le(self.timers.dec_start_value)?;
        out.write_u64_le(self.timers.dec_start_cycles)?;
        out.write_bool(self.timers.dec_written)
    }

    /// Parse from a savestate payload
    pub fn decode(mut payload: &[u8]) -> Result<Self, StateError> {
        let mut state = Self::new();
        for reg in state.gpr.iter_mut() {
            *reg = payload.read_u32_le()?;
        }
        state.pc = payload.read_u32_le()?;
        state.npc = payload.read_u32_le()?;
        state.cr = payload.read_u32_le()?;
        state.xer = payload.read_u32_le()?;
        state.msr = payload.read_u32_le()?;
        state.fpscr = payload.read_u32_le()?;
        state.exceptions = ExceptionFlags::from_bits(payload.read_u32_le()?)
            .ok_or_else(|| StateError::Corrupt("unknown exception bits".into()))?;
        state.program_reason = payload.read_u32_le()?;
        for half in bytemuck::cast_slice_mut::<PairedSingle, u64>(&mut state.ps) {
            *half = payload.read_u64_le()?;
        }
        for reg in state.spr.iter_mut() {
            *reg = payload.read_u32_le()?;
        }
        state.cycles = payload.read_u64_le()?;
        state.timers.tb_start_value = payload.read_u64_le()?;
        state.timers.tb_start_cycles = payload.read_u64_le()?;
        state.timers.dec_start_value = payload.read_u32_le()?;
        state.timers.dec_start_cycles = payload.read_u64_le()?;
        state.timers.dec_written = payload.read_bool()?;
        expect_consumed(payload, "CPU")?;
        Ok(state)
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cr_fields_and_bits() {
        let mut state = MachineState::new();
        state.set_cr_field(0, CR_GT);
        state.set_cr_field(7, CR_EQ | CR_SO);
        assert_eq!(state.cr, 0x4000_0003);
        assert!(state.cr_bit(1));
        assert!(state.cr_bit(30));
        state.set_cr_bit(1, false);
        assert_eq!(state.cr_field(0), 0);
    }

    #[test]
    fn test_update_cr0_copies_so() {
        let mut state = MachineState::new();
        state.set_xer_ov(true);
        assert!(state.xer_so());
        state.update_cr0(0xFFFF_FFFF);
        assert_eq!(state.cr_field(0), CR_LT | CR_SO);
        state.set_xer_ov(false);
        assert!(state.xer_so());
    }

    #[test]
    fn test_timebase_and_decrementer() {
        let mut state = MachineState::new();
        state.cycles = 120;
        assert_eq!(state.timebase(), 10);
        state.write_timebase(true, 1);
        assert_eq!(state.timebase(), 0x1_0000_000A);

        assert!(!state.write_decrementer(100));
        state.cycles += 24;
        assert_eq!(state.decrementer(), 98);
        assert!(state.timers.dec_written);
        assert!(state.write_decrementer(0x8000_0000));
    }

    #[test]
    fn test_translation_modes() {
        let mut state = MachineState::new();
        assert_eq!(state.data_mode(), TranslationMode::Real);
        state.msr = (Msr::DR | Msr::FP).bits();
        assert_eq!(state.data_mode(), TranslationMode::Virtual);
        assert_eq!(state.instruction_mode(), TranslationMode::Real);
    }

    #[test]
    fn test_encode_decode() {
        let mut state = MachineState::new();
        state.gpr[3] = 0xDEAD_BEEF;
        state.pc = 0x8000_3100;
        state.ps[1].ps1 = 0x3FF0_0000_0000_0000;
        state.spr[spr::SRR0] = 0x1234;
        state.cycles = 999;
        state.exceptions = ExceptionFlags::DECREMENTER;
        let mut payload = Vec::new();
        state.encode(&mut payload).unwrap();
        assert_eq!(MachineState::decode(&payload).unwrap(), state);
        assert!(MachineState::decode(&payload[..payload.len() - 1]).is_err());
    }
}
