//! Guest callstack reconstruction
//!
//! Walks the PowerPC EABI back chain: `r1` points at the caller's saved
//! stack pointer, and each frame keeps the caller's link register at +4.
//! The innermost return address is the live LR, since leaf functions never
//! spill it.

use gk_memory::GuestMemory;
use gk_ppc::MachineState;

/// Frames walked before giving up on a corrupt chain
pub const MAX_CALLSTACK_DEPTH: usize = 64;

/// One return address in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    /// Address of the frame holding the saved LR (0 for the live LR)
    pub frame: u32,
    /// Return address
    pub return_address: u32,
}

fn is_chain_end(addr: u32) -> bool {
    addr == 0 || addr == 0xFFFF_FFFF
}

/// Walk the back chain of `state`, innermost frame first
pub fn walk_callstack(state: &MachineState, mem: &mut GuestMemory) -> Vec<StackFrame> {
    let mode = state.data_mode();
    let mut frames = vec![StackFrame { frame: 0, return_address: state.lr() }];

    let Some(mut frame) = mem.peek::<u32>(state.gpr[1], mode) else {
        return frames;
    };

    while !is_chain_end(frame) && frames.len() < MAX_CALLSTACK_DEPTH {
        let Some(saved_lr) = mem.peek::<u32>(frame.wrapping_add(4), mode) else {
            break;
        };
        if is_chain_end(saved_lr) {
            break;
        }
        frames.push(StackFrame { frame, return_address: saved_lr });

        let Some(next) = mem.peek::<u32>(frame, mode) else {
            break;
        };
        // Stacks grow down; the chain must move toward older frames
        if next <= frame {
            break;
        }
        frame = next;
    }

    if frames.len() == MAX_CALLSTACK_DEPTH {
        tracing::warn!("Callstack walk stopped at depth {}", MAX_CALLSTACK_DEPTH);
    }
    frames
}

/// Render a callstack one frame per line
pub fn format_callstack(frames: &[StackFrame]) -> String {
    frames
        .iter()
        .enumerate()
        .map(|(i, f)| format!("#{i:<2} 0x{:08X} (frame 0x{:08X})", f.return_address, f.frame))
        .collect::<Vec<_>>()
        .join("\n")
}
