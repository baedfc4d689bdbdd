//! CPU savestates
//!
//! Sections, each at version 1:
//!
//! | Tag    | Contents                                          |
//! |--------|---------------------------------------------------|
//! | `CPU ` | architectural state                               |
//! | `JITV` | keys of valid JIT blocks (empty for interpreter)  |
//! | `TIME` | scheduler tick counter and pending events by name |
//! | `MMU ` | BATs, segment registers, SDR1                     |
//! | `HW  ` | interrupt cause and mask, reservation             |
//! | `RAM ` | raw length, then raw or deflated contents         |
//!
//! Loading decodes every section into staging values first; the live
//! machine is only touched once the whole stream is known to be good.

use gk_core::error::StateError;
use gk_core::savestate::{
    compress, decompress, expect_consumed, ParsedState, ReadLeExt, SectionId, StateWriter, WriteLeExt,
    FLAG_COMPRESSED_RAM,
};
use gk_jit::{BlockKey, Jit};
use gk_memory::{MmuSnapshot, Reservation};
use gk_ppc::MachineState;

use crate::cpu::Cpu;
use crate::engine::ExecutionEngine;

const SECTION_VERSION: u16 = 1;

/// Interrupt lines and reservation
struct HwState {
    cause: u32,
    mask: u32,
    reservation: Option<u32>,
}

impl HwState {
    fn decode(mut payload: &[u8]) -> Result<Self, StateError> {
        let cause = payload.read_u32_le()?;
        let mask = payload.read_u32_le()?;
        let reserved = payload.read_bool()?;
        let line = payload.read_u32_le()?;
        expect_consumed(payload, "HW")?;
        Ok(Self {
            cause,
            mask,
            reservation: reserved.then_some(line),
        })
    }
}

fn decode_ram(payload: &[u8], compressed: bool, ram_size: u32) -> Result<Vec<u8>, StateError> {
    let mut rest = payload;
    let len = rest.read_u32_le()?;
    if len != ram_size {
        return Err(StateError::Corrupt(format!(
            "RAM section holds 0x{len:x} bytes, machine has 0x{ram_size:x}"
        )));
    }
    if compressed {
        decompress(rest, len as usize)
    } else if rest.len() == len as usize {
        Ok(rest.to_vec())
    } else {
        Err(StateError::Truncated("RAM"))
    }
}

impl Cpu {
    /// Serialize the whole CPU side of the machine
    pub fn save_state(&self) -> Result<Vec<u8>, StateError> {
        let machine = &self.machine;
        let flags = if self.compress_savestates { FLAG_COMPRESSED_RAM } else { 0 };
        let mut writer = StateWriter::new(flags);

        writer.section(SectionId::CPU, SECTION_VERSION, |out| machine.state.encode(out))?;
        writer.section(SectionId::JIT, SECTION_VERSION, |out| match self.engine.jit() {
            Some(jit) => jit.encode_validity(out),
            None => out.write_u32_le(0),
        })?;
        writer.section(SectionId::TIMING, SECTION_VERSION, |out| self.timing.save(out))?;
        writer.section(SectionId::MMU, SECTION_VERSION, |out| machine.memory.mmu_snapshot().encode(out))?;
        writer.section(SectionId::HW, SECTION_VERSION, |out| {
            let lines = machine.interrupts();
            let reservation = machine.memory.reservation().line();
            out.write_u32_le(lines.cause())?;
            out.write_u32_le(lines.mask())?;
            out.write_bool(reservation.is_some())?;
            out.write_u32_le(reservation.unwrap_or(0))
        })?;
        writer.section(SectionId::RAM, SECTION_VERSION, |out| {
            let ram = machine.memory.ram();
            out.write_u32_le(ram.len() as u32)?;
            if flags & FLAG_COMPRESSED_RAM != 0 {
                out.write_bytes(&compress(ram)?)
            } else {
                out.write_bytes(ram)
            }
        })?;

        let bytes = writer.finish();
        tracing::info!(
            "Saved state at pc=0x{:08x}, {} bytes",
            machine.state.pc,
            bytes.len()
        );
        Ok(bytes)
    }

    /// Replace the CPU side of the machine with a savestate
    ///
    /// On error nothing has been modified.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let parsed = ParsedState::parse(bytes)?;
        let compressed = parsed.header.flags & FLAG_COMPRESSED_RAM != 0;

        let state = MachineState::decode(parsed.require(SectionId::CPU, "CPU", SECTION_VERSION)?)?;
        let valid_blocks: Vec<BlockKey> =
            Jit::decode_validity(parsed.require(SectionId::JIT, "JITV", SECTION_VERSION)?)?;
        let timing = self
            .timing
            .parse_snapshot(parsed.require(SectionId::TIMING, "TIME", SECTION_VERSION)?)?;
        let mmu = MmuSnapshot::decode(parsed.require(SectionId::MMU, "MMU", SECTION_VERSION)?)?;
        let hw = HwState::decode(parsed.require(SectionId::HW, "HW", SECTION_VERSION)?)?;
        let ram = decode_ram(
            parsed.require(SectionId::RAM, "RAM", SECTION_VERSION)?,
            compressed,
            self.machine.memory.ram_size(),
        )?;
        if timing.ticks() != state.cycles {
            return Err(StateError::Corrupt(format!(
                "scheduler at tick {} but CPU at cycle {}",
                timing.ticks(),
                state.cycles
            )));
        }

        // The length was checked above, so this is the last fallible step
        let machine = &mut self.machine;
        machine
            .memory
            .restore_ram(&ram)
            .map_err(|e| StateError::Corrupt(e.to_string()))?;
        machine.state = state;
        machine.memory.restore_mmu(&mmu);
        let mut reservation = Reservation::new();
        reservation.set_line(hw.reservation);
        machine.memory.set_reservation(reservation);
        let lines = machine.interrupts();
        lines.set_cause(hw.cause);
        lines.set_mask(hw.mask);
        self.timing.restore(timing);

        // The restored code replaces whatever the cache was built from
        machine.memory.take_translation_changed();
        machine.memory.take_invalidations();
        self.engine.clear_cache(&mut machine.memory);
        let rebuilt = match &mut self.engine {
            ExecutionEngine::Jit(jit) => {
                jit.restore_validity(&valid_blocks, &mut machine.memory, self.breakpoints.addresses())
            }
            ExecutionEngine::Interpreter(_) => 0,
        };
        self.reset_parked();

        tracing::info!(
            "Loaded state at pc=0x{:08x}, {} of {} blocks recompiled",
            self.machine.state.pc,
            rebuilt,
            valid_blocks.len()
        );
        Ok(())
    }
}
