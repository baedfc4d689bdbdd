//! Native x86-64 backend
//!
//! Straight-line integer work (moves, ALU, sign extension, rotates without
//! record) is emitted as host code operating directly on the
//! [`MachineState`] register file. Every other instruction becomes a call to
//! [`interpret_one`], which runs it through the interpreter and reports
//! whether the block has to stop.
//!
//! Generated code uses the System V calling convention:
//! `fn(state: *mut MachineState, mem: *mut GuestMemory) -> u32`, returning
//! `(exit flags << 16) | instructions executed`.

use std::mem::offset_of;
use std::ptr::NonNull;

use bitflags::bitflags;
use gk_core::error::JitError;
use gk_memory::GuestMemory;
use gk_ppc::interpreter::execute_word;
use gk_ppc::state::MachineState;

use crate::analyzer::AnalyzedBlock;
use crate::ir::{AluOp, IrOp, Operand, UnaryOp};

bitflags! {
    /// Why a native block stopped early
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExitFlags: u32 {
        const EXCEPTION_CHECK = 1 << 0;
        const CODE_WRITTEN = 1 << 1;
    }
}

type NativeFn = unsafe extern "C" fn(*mut MachineState, *mut GuestMemory) -> u32;

/// Run one instruction through the interpreter on behalf of native code
unsafe extern "C" fn interpret_one(
    state: *mut MachineState,
    mem: *mut GuestMemory,
    word: u32,
    pc: u32,
) -> u32 {
    // SAFETY: native blocks only pass through the pointers `NativeBlock::execute` received
    let (state, mem) = unsafe { (&mut *state, &mut *mem) };
    state.pc = pc;
    let outcome = execute_word(state, mem, word);
    let mut flags = ExitFlags::empty();
    if outcome.exception_check {
        flags |= ExitFlags::EXCEPTION_CHECK;
    }
    if mem.code_written() {
        flags |= ExitFlags::CODE_WRITTEN;
    }
    flags.bits()
}

/// Page-aligned W^X buffer holding finished code
struct ExecutableBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is immutable once finalized and owned by the buffer
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    fn new(code: &[u8]) -> Result<Self, JitError> {
        // SAFETY: sysconf has no preconditions
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
        let len = code.len().max(1).next_multiple_of(page);
        // SAFETY: anonymous private mapping, checked against MAP_FAILED below
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(JitError::ExecutableMemory(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let ptr = NonNull::new(raw as *mut u8)
            .ok_or_else(|| JitError::ExecutableMemory("mmap returned null".to_string()))?;
        let buffer = Self { ptr, len };

        // SAFETY: the mapping is `len >= code.len()` bytes and writable
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), buffer.ptr.as_ptr(), code.len()) };
        // SAFETY: same mapping, switching it from RW to RX
        let rc = unsafe { libc::mprotect(raw, len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(JitError::ExecutableMemory(format!(
                "mprotect(PROT_READ|PROT_EXEC) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(buffer)
    }

    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        // SAFETY: unmapping the region created in `new`
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if rc != 0 {
            tracing::warn!("munmap of JIT buffer failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// A block compiled to host code
pub struct NativeBlock {
    buffer: ExecutableBuffer,
    code_len: usize,
    native_ops: usize,
}

impl NativeBlock {
    /// Host address range of the generated code
    pub fn host_range(&self) -> (usize, usize) {
        let start = self.buffer.as_ptr() as usize;
        (start, start + self.code_len)
    }

    /// Instructions translated to host code rather than interpreter calls
    pub fn native_ops(&self) -> usize {
        self.native_ops
    }

    /// Run the block; returns instructions executed and exit flags
    pub fn execute(&self, state: &mut MachineState, mem: &mut GuestMemory) -> (u32, ExitFlags) {
        // SAFETY: the buffer holds a complete function emitted by `compile`
        // with the `NativeFn` signature
        let entry: NativeFn = unsafe { std::mem::transmute::<*const u8, NativeFn>(self.buffer.as_ptr()) };
        // SAFETY: both pointers come from live exclusive borrows
        let packed = unsafe { entry(state as *mut MachineState, mem as *mut GuestMemory) };
        (packed & 0xFFFF, ExitFlags::from_bits_truncate(packed >> 16))
    }
}

impl std::fmt::Debug for NativeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBlock")
            .field("code_len", &self.code_len)
            .field("native_ops", &self.native_ops)
            .finish()
    }
}

const GPR: usize = offset_of!(MachineState, gpr);
const PC: usize = offset_of!(MachineState, pc);
const NPC: usize = offset_of!(MachineState, npc);
const CYCLES: usize = offset_of!(MachineState, cycles);

#[inline]
fn gpr(reg: u8) -> usize {
    GPR + 4 * reg as usize
}

/// Minimal x86-64 encoder; `rbx` holds the state pointer, `r12` the memory
#[derive(Default)]
struct Assembler {
    code: Vec<u8>,
}

impl Assembler {
    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn imm32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn prologue(&mut self) {
        // push rbx; push r12; push r13 (keeps rsp 16-byte aligned for calls)
        self.emit(&[0x53, 0x41, 0x54, 0x41, 0x55]);
        // mov rbx, rdi; mov r12, rsi
        self.emit(&[0x48, 0x89, 0xFB, 0x49, 0x89, 0xF4]);
    }

    fn epilogue(&mut self) {
        // pop r13; pop r12; pop rbx; ret
        self.emit(&[0x41, 0x5D, 0x41, 0x5C, 0x5B, 0xC3]);
    }

    fn load_eax(&mut self, offset: usize) {
        self.emit(&[0x8B, 0x83]);
        self.imm32(offset as u32);
    }

    fn load_ecx(&mut self, offset: usize) {
        self.emit(&[0x8B, 0x8B]);
        self.imm32(offset as u32);
    }

    fn store_eax(&mut self, offset: usize) {
        self.emit(&[0x89, 0x83]);
        self.imm32(offset as u32);
    }

    fn mov_eax(&mut self, value: u32) {
        self.emit(&[0xB8]);
        self.imm32(value);
    }

    fn mov_ecx(&mut self, value: u32) {
        self.emit(&[0xB9]);
        self.imm32(value);
    }

    fn operand_eax(&mut self, operand: Operand) {
        match operand {
            Operand::Reg(reg) => self.load_eax(gpr(reg)),
            Operand::Imm(value) => self.mov_eax(value),
        }
    }

    fn operand_ecx(&mut self, operand: Operand) {
        match operand {
            Operand::Reg(reg) => self.load_ecx(gpr(reg)),
            Operand::Imm(value) => self.mov_ecx(value),
        }
    }

    /// mov dword [rbx + offset], imm32
    fn store_imm(&mut self, offset: usize, value: u32) {
        self.emit(&[0xC7, 0x83]);
        self.imm32(offset as u32);
        self.imm32(value);
    }

    /// add qword [rbx + cycles], imm32
    fn add_cycles(&mut self, cycles: u32) {
        if cycles == 0 {
            return;
        }
        self.emit(&[0x48, 0x81, 0x83]);
        self.imm32(CYCLES as u32);
        self.imm32(cycles);
    }

    /// eax = eax <op> b
    fn alu(&mut self, op: AluOp, b: Operand) {
        if let Operand::Imm(value) = b {
            let short = match op {
                AluOp::Add => Some(0x05),
                AluOp::And => Some(0x25),
                AluOp::Or => Some(0x0D),
                AluOp::Xor => Some(0x35),
                _ => None,
            };
            if let Some(opcode) = short {
                self.emit(&[opcode]);
                self.imm32(value);
                return;
            }
        }
        self.operand_ecx(b);
        match op {
            AluOp::Add => self.emit(&[0x01, 0xC8]),
            AluOp::Sub => self.emit(&[0x29, 0xC8]),
            AluOp::Mul => self.emit(&[0x0F, 0xAF, 0xC1]),
            AluOp::And => self.emit(&[0x21, 0xC8]),
            AluOp::Andc => self.emit(&[0xF7, 0xD1, 0x21, 0xC8]),
            AluOp::Or => self.emit(&[0x09, 0xC8]),
            AluOp::Orc => self.emit(&[0xF7, 0xD1, 0x09, 0xC8]),
            AluOp::Xor => self.emit(&[0x31, 0xC8]),
            AluOp::Nand => self.emit(&[0x21, 0xC8, 0xF7, 0xD0]),
            AluOp::Nor => self.emit(&[0x09, 0xC8, 0xF7, 0xD0]),
            AluOp::Eqv => self.emit(&[0x31, 0xC8, 0xF7, 0xD0]),
            // Filtered out by `encodable`
            AluOp::Slw | AluOp::Srw => {}
        }
    }

    /// Call `interpret_one(state, mem, word, pc)` and leave with the flags
    /// when it reports anything
    fn interpret(&mut self, word: u32, pc: u32, done: u32) {
        // mov rdi, rbx; mov rsi, r12
        self.emit(&[0x48, 0x89, 0xDF, 0x4C, 0x89, 0xE6]);
        self.emit(&[0xBA]);
        self.imm32(word);
        self.mov_ecx(pc);
        // mov rax, imm64; call rax
        self.emit(&[0x48, 0xB8]);
        self.code.extend_from_slice(&(interpret_one as *const () as usize as u64).to_le_bytes());
        self.emit(&[0xFF, 0xD0]);
        // test eax, eax; jz over
        self.emit(&[0x85, 0xC0, 0x74, 0x00]);
        let patch = self.code.len() - 1;
        // shl eax, 16; or eax, done
        self.emit(&[0xC1, 0xE0, 0x10, 0x0D]);
        self.imm32(done);
        self.epilogue();
        self.code[patch] = (self.code.len() - patch - 1) as u8;
    }
}

/// IR the native backend turns into host code
fn encodable(op: &IrOp) -> bool {
    match *op {
        IrOp::Nop | IrOp::Move { .. } => true,
        IrOp::Alu { op, record, .. } => !record && !matches!(op, AluOp::Slw | AluOp::Srw),
        IrOp::Unary { op, record, .. } => !record && op != UnaryOp::Cntlzw,
        IrOp::Rotate { insert, record, .. } => !insert && !record,
        _ => false,
    }
}

/// Compile an analyzed block from its (optimized) IR
pub fn compile(block: &AnalyzedBlock, ir: &[IrOp]) -> Result<NativeBlock, JitError> {
    let prefix = block.cycle_prefix();
    let mut asm = Assembler::default();
    let mut pending = 0u32;
    let mut native_ops = 0;
    let mut last_native = false;

    asm.prologue();
    for (index, (guest, op)) in block.insts.iter().zip(ir).enumerate() {
        let cost = prefix[index + 1] - prefix[index];
        last_native = encodable(op);
        if !last_native {
            asm.add_cycles(pending);
            pending = 0;
            asm.interpret(guest.word, guest.pc, index as u32 + 1);
            continue;
        }
        native_ops += 1;
        pending += cost;
        match *op {
            IrOp::Move { rd, src } => {
                asm.operand_eax(src);
                asm.store_eax(gpr(rd));
            }
            IrOp::Alu { op, rd, a, b, .. } => {
                asm.operand_eax(a);
                asm.alu(op, b);
                asm.store_eax(gpr(rd));
            }
            IrOp::Unary { op, rd, src, .. } => {
                asm.load_eax(gpr(src));
                match op {
                    UnaryOp::Neg => asm.emit(&[0xF7, 0xD8]),
                    UnaryOp::Extsb => asm.emit(&[0x0F, 0xBE, 0xC0]),
                    UnaryOp::Extsh => asm.emit(&[0x0F, 0xBF, 0xC0]),
                    UnaryOp::Cntlzw => {}
                }
                asm.store_eax(gpr(rd));
            }
            IrOp::Rotate { rd, rs, sh, mask, .. } => {
                asm.load_eax(gpr(rs));
                if sh & 31 != 0 {
                    asm.emit(&[0xC1, 0xC0, (sh & 31) as u8]);
                }
                asm.emit(&[0x25]);
                asm.imm32(mask);
                asm.store_eax(gpr(rd));
            }
            _ => {}
        }
    }
    if last_native {
        let end = block.end();
        asm.store_imm(PC, end);
        asm.store_imm(NPC, end);
    }
    asm.add_cycles(pending);
    asm.mov_eax(block.insts.len() as u32);
    asm.epilogue();

    let code_len = asm.code.len();
    let buffer = ExecutableBuffer::new(&asm.code)?;
    gk_core::jit_trace!(
        "Native block 0x{:08x}: {} bytes, {}/{} native",
        block.start(),
        code_len,
        native_ops,
        block.insts.len()
    );
    Ok(NativeBlock { buffer, code_len, native_ops })
}
