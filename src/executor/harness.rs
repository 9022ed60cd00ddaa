//! The code page image wrapped around a test program.
//!
//! ```text
//! base + 0            epilogue: restore callee-saved registers, ret
//! base + ENTRY_OFFSET prologue: save registers, r14 = sandbox,
//!                     load flags and input registers
//!                     program body
//!                     jmp base
//! ```
//!
//! Faults inside the body are recovered by pointing RIP at `base`, which is
//! why the epilogue leads the page.

use iced_x86::code_asm::*;

use crate::assembler::{emit_program, gpr, BITNESS};
use crate::err::FuzzErr;
use crate::input::Input;
use crate::isa::Reg;
use crate::program::TestProgram;

/// Where the prologue starts, leaves the epilogue its own cache line
pub const ENTRY_OFFSET: u64 = 64;

/// Register block the prologue reads: the six registers then the flags
pub const REG_BLOCK_LEN: usize = Reg::ALL.len() + 1;

/// Signature of the entry point: sandbox base, register block
pub type Entry = extern "C" fn(*mut u8, *const u64);

pub fn register_block(input: &Input) -> [u64; REG_BLOCK_LEN] {
    let mut block = [0u64; REG_BLOCK_LEN];
    block[..Reg::ALL.len()].copy_from_slice(&input.regs);
    block[Reg::ALL.len()] = input.flags;
    block
}

fn epilogue(base: u64) -> Result<Vec<u8>, FuzzErr> {
    let mut a = CodeAssembler::new(BITNESS)?;
    a.pop(r15)?;
    a.pop(r14)?;
    a.pop(r13)?;
    a.pop(r12)?;
    a.pop(rbp)?;
    a.pop(rbx)?;
    a.ret()?;
    Ok(a.assemble(base)?)
}

fn entry(base: u64, program: &TestProgram) -> Result<Vec<u8>, FuzzErr> {
    let mut a = CodeAssembler::new(BITNESS)?;

    // Callee-saved registers, popped in reverse by the epilogue
    a.push(rbx)?;
    a.push(rbp)?;
    a.push(r12)?;
    a.push(r13)?;
    a.push(r14)?;
    a.push(r15)?;

    a.mov(r14, rdi)?;
    a.mov(r15, rsi)?;

    a.push(qword_ptr(r15 + (Reg::ALL.len() * 8) as i32))?;
    a.popfq()?;

    // Arguments are safe in r14/r15, the input registers can go in
    for reg in Reg::ALL {
        a.mov(gpr(reg), qword_ptr(r15 + (reg.index() * 8) as i32))?;
    }

    emit_program(&mut a, program)?;
    a.jmp(base)?;

    Ok(a.assemble(base + ENTRY_OFFSET)?)
}

/// Full code page image for a program that will be installed at `base`
pub fn build(base: u64, program: &TestProgram) -> Result<Vec<u8>, FuzzErr> {
    let mut image = epilogue(base)?;
    if image.len() > ENTRY_OFFSET as usize {
        return Err(FuzzErr::Assembler("Epilogue overflows its slot".to_string()));
    }

    // int3 padding up to the entry point
    image.resize(ENTRY_OFFSET as usize, 0xCC);
    image.extend_from_slice(&entry(base, program)?);

    Ok(image)
}
