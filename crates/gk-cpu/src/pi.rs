//! Processor interface interrupt registers
//!
//! Only the cause and mask registers are modelled. Writing a 1 to a cause
//! bit acknowledges it; the mask register is plain read/write.

use std::sync::Arc;

use gk_core::error::MemoryError;
use gk_core::{InterruptKind, InterruptLines};
use gk_memory::constants::PI_BASE;
use gk_memory::{AccessWidth, GuestMemory};

/// Interrupt cause register (INTSR)
pub const PI_INTSR: u32 = PI_BASE;
/// Interrupt mask register (INTMR)
pub const PI_INTMR: u32 = PI_BASE + 4;
/// Size of the processor interface register block
pub const PI_SIZE: u32 = 0x100;

const INTSR_OFFSET: u32 = 0;
const INTMR_OFFSET: u32 = 4;

/// Bytes of a 32-bit register seen by an access of `width` at `offset`
fn extract(register: u32, offset: u32, width: AccessWidth) -> u64 {
    let bytes = width.bytes().min(4);
    let shift = (4 - bytes - (offset & 3).min(4 - bytes)) * 8;
    let mask = if bytes == 4 { u32::MAX } else { (1u32 << (bytes * 8)) - 1 };
    ((register >> shift) & mask) as u64
}

/// Map the registers onto the memory bus
pub fn register(memory: &mut GuestMemory, lines: Arc<InterruptLines>) -> Result<(), MemoryError> {
    let read_lines = Arc::clone(&lines);
    let write_lines = lines;

    memory.register_mmio(
        "PI",
        PI_BASE,
        PI_SIZE,
        Box::new(move |offset, width| match offset & !3 {
            INTSR_OFFSET => extract(read_lines.cause(), offset, width),
            INTMR_OFFSET => extract(read_lines.mask(), offset, width),
            _ => {
                tracing::warn!("Unhandled PI read at offset 0x{:02x}", offset);
                0
            }
        }),
        Box::new(move |offset, width, value| {
            if width != AccessWidth::Word || offset & 3 != 0 {
                tracing::warn!("Unsupported {:?} PI write at offset 0x{:02x}", width, offset);
                return;
            }
            let value = value as u32;
            match offset {
                INTSR_OFFSET => {
                    gk_core::cpu_debug!("PI acknowledge 0x{:08x}", value);
                    write_lines.clear(InterruptKind::from_bits_retain(value));
                }
                INTMR_OFFSET => {
                    gk_core::cpu_debug!("PI mask 0x{:08x}", value);
                    write_lines.set_mask(value);
                }
                _ => tracing::warn!("Unhandled PI write 0x{:08x} at offset 0x{:02x}", value, offset),
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_memory::TranslationMode;

    fn create_test_env() -> (GuestMemory, Arc<InterruptLines>) {
        let mut memory = GuestMemory::new(0x0180_0000).unwrap();
        let lines = Arc::new(InterruptLines::new());
        register(&mut memory, Arc::clone(&lines)).unwrap();
        (memory, lines)
    }

    #[test]
    fn test_cause_reads_and_acknowledge() {
        let (mut memory, lines) = create_test_env();
        lines.raise(InterruptKind::VI | InterruptKind::SI);

        let cause = memory.read::<u32>(PI_INTSR, TranslationMode::Real).unwrap();
        assert_eq!(cause, (InterruptKind::VI | InterruptKind::SI).bits());

        memory
            .write::<u32>(PI_INTSR, InterruptKind::VI.bits(), TranslationMode::Real)
            .unwrap();
        assert_eq!(lines.cause(), InterruptKind::SI.bits());
    }

    #[test]
    fn test_mask_register() {
        let (mut memory, lines) = create_test_env();
        memory.write::<u32>(PI_INTMR, 0x0000_0100, TranslationMode::Real).unwrap();
        assert_eq!(lines.mask(), 0x100);
        assert_eq!(memory.read::<u32>(PI_INTMR, TranslationMode::Real).unwrap(), 0x100);
        assert_eq!(memory.read::<u16>(PI_INTMR + 2, TranslationMode::Real).unwrap(), 0x100);
        assert_eq!(memory.read::<u8>(PI_INTMR + 2, TranslationMode::Real).unwrap(), 0x01);
    }
}
