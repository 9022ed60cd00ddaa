//! Lowering of test programs onto the `iced-x86` code assembler. Memory
//! operands become `and base, mask` followed by the access through r14, the
//! same sequence the contract model executes

use iced_x86::code_asm::*;

use crate::err::FuzzErr;
use crate::isa::{BinaryOp, Cond, Instruction, LogicalOp, Operand, Reg, UnaryOp};
use crate::program::{SandboxLayout, Terminator, TestProgram};

/// Bitness of everything we emit
pub const BITNESS: u32 = 64;

pub fn gpr(reg: Reg) -> AsmRegister64 {
    match reg {
        Reg::Rax => rax,
        Reg::Rbx => rbx,
        Reg::Rcx => rcx,
        Reg::Rdx => rdx,
        Reg::Rsi => rsi,
        Reg::Rdi => rdi,
    }
}

fn gpr8(reg: Reg) -> AsmRegister8 {
    match reg {
        Reg::Rax => al,
        Reg::Rbx => bl,
        Reg::Rcx => cl,
        Reg::Rdx => dl,
        Reg::Rsi => sil,
        Reg::Rdi => dil,
    }
}

#[inline]
fn sandbox(base: Reg) -> AsmMemoryOperand {
    qword_ptr(r14 + gpr(base))
}

// Expand a condition code into the matching assembler method
macro_rules! by_cond {
    ($cond:expr, $a:expr, [$($variant:ident => $method:ident),* $(,)?], $args:tt) => {
        match $cond {
            $(Cond::$variant => { $a.$method $args ?; })*
        }
    };
}

macro_rules! jcc {
    ($a:expr, $cond:expr, $label:expr) => {
        by_cond!($cond, $a, [
            O => jo, No => jno, B => jb, Ae => jae, E => je, Ne => jne,
            Be => jbe, A => ja, S => js, Ns => jns, P => jp, Np => jnp,
            L => jl, Ge => jge, Le => jle, G => jg,
        ], ($label))
    };
}

macro_rules! cmovcc {
    ($a:expr, $cond:expr, $dst:expr, $src:expr) => {
        by_cond!($cond, $a, [
            O => cmovo, No => cmovno, B => cmovb, Ae => cmovae, E => cmove,
            Ne => cmovne, Be => cmovbe, A => cmova, S => cmovs, Ns => cmovns,
            P => cmovp, Np => cmovnp, L => cmovl, Ge => cmovge, Le => cmovle,
            G => cmovg,
        ], ($dst, $src))
    };
}

macro_rules! setcc {
    ($a:expr, $cond:expr, $dst:expr) => {
        by_cond!($cond, $a, [
            O => seto, No => setno, B => setb, Ae => setae, E => sete,
            Ne => setne, Be => setbe, A => seta, S => sets, Ns => setns,
            P => setp, Np => setnp, L => setl, Ge => setge, Le => setle,
            G => setg,
        ], ($dst))
    };
}

// Two-operand ALU instruction over every legal operand combination
macro_rules! alu {
    ($a:expr, $method:ident, $dst:expr, $src:expr, $mask:expr) => {
        match ($dst, $src) {
            (Operand::Reg(d), Operand::Reg(s)) => {
                $a.$method(gpr(d), gpr(s))?;
            }
            (Operand::Reg(d), Operand::Imm(imm)) => {
                $a.$method(gpr(d), imm)?;
            }
            (Operand::Reg(d), Operand::Mem(base)) => {
                $a.and(gpr(base), $mask)?;
                $a.$method(gpr(d), sandbox(base))?;
            }
            (Operand::Mem(base), Operand::Reg(s)) => {
                $a.and(gpr(base), $mask)?;
                $a.$method(sandbox(base), gpr(s))?;
            }
            (Operand::Mem(base), Operand::Imm(imm)) => {
                $a.and(gpr(base), $mask)?;
                $a.$method(sandbox(base), imm)?;
            }
            (dst, src) => {
                return Err(FuzzErr::Assembler(format!(
                    "Unencodable operands {}, {}",
                    dst, src
                )));
            }
        }
    };
}

// Test only encodes `test r/m64, r64` and `test r/m64, imm32`
fn emit_test(a: &mut CodeAssembler, dst: Operand, src: Operand, mask: i32) -> Result<(), FuzzErr> {
    match (dst, src) {
        (Operand::Reg(d), Operand::Reg(s)) => a.test(gpr(d), gpr(s))?,
        (Operand::Reg(d), Operand::Imm(imm)) => a.test(gpr(d), imm)?,
        (Operand::Mem(base), Operand::Reg(s)) => {
            a.and(gpr(base), mask)?;
            a.test(sandbox(base), gpr(s))?;
        }
        (Operand::Mem(base), Operand::Imm(imm)) => {
            a.and(gpr(base), mask)?;
            a.test(sandbox(base), imm)?;
        }
        (dst, src) => {
            return Err(FuzzErr::Assembler(format!(
                "Unencodable operands test {}, {}",
                dst, src
            )))
        }
    }

    Ok(())
}

/// Emit one cataloged instruction
pub fn emit_instruction(
    a: &mut CodeAssembler,
    instr: &Instruction,
    layout: SandboxLayout,
) -> Result<(), FuzzErr> {
    let mask = layout.mask() as i32;

    match *instr {
        Instruction::Binary { op, dst, src } => match op {
            BinaryOp::Add => alu!(a, add, dst, src, mask),
            BinaryOp::Sub => alu!(a, sub, dst, src, mask),
            BinaryOp::Cmp => alu!(a, cmp, dst, src, mask),
        },
        Instruction::Logical { op, dst, src } => match op {
            LogicalOp::And => alu!(a, and, dst, src, mask),
            LogicalOp::Or => alu!(a, or, dst, src, mask),
            LogicalOp::Xor => alu!(a, xor, dst, src, mask),
            LogicalOp::Test => emit_test(a, dst, src, mask)?,
        },
        Instruction::Unary { op, dst } => match dst {
            Operand::Reg(reg) => match op {
                UnaryOp::Inc => a.inc(gpr(reg))?,
                UnaryOp::Dec => a.dec(gpr(reg))?,
                UnaryOp::Neg => a.neg(gpr(reg))?,
                UnaryOp::Not => a.not(gpr(reg))?,
            },
            Operand::Mem(base) => {
                a.and(gpr(base), mask)?;
                match op {
                    UnaryOp::Inc => a.inc(sandbox(base))?,
                    UnaryOp::Dec => a.dec(sandbox(base))?,
                    UnaryOp::Neg => a.neg(sandbox(base))?,
                    UnaryOp::Not => a.not(sandbox(base))?,
                }
            }
            Operand::Imm(_) => {
                return Err(FuzzErr::Assembler(format!("Unencodable '{}'", instr)));
            }
        },
        Instruction::Mov { dst, src } => match (dst, src) {
            (Operand::Reg(d), Operand::Reg(s)) => a.mov(gpr(d), gpr(s))?,
            (Operand::Reg(d), Operand::Imm(imm)) => a.mov(gpr(d), imm as i64)?,
            (Operand::Reg(d), Operand::Mem(base)) => {
                a.and(gpr(base), mask)?;
                a.mov(gpr(d), sandbox(base))?;
            }
            (Operand::Mem(base), Operand::Reg(s)) => {
                a.and(gpr(base), mask)?;
                a.mov(sandbox(base), gpr(s))?;
            }
            (Operand::Mem(base), Operand::Imm(imm)) => {
                a.and(gpr(base), mask)?;
                a.mov(sandbox(base), imm)?;
            }
            _ => return Err(FuzzErr::Assembler(format!("Unencodable '{}'", instr))),
        },
        Instruction::Cmov { cond, dst, src } => match src {
            Operand::Reg(s) => cmovcc!(a, cond, gpr(dst), gpr(s)),
            Operand::Mem(base) => {
                a.and(gpr(base), mask)?;
                cmovcc!(a, cond, gpr(dst), sandbox(base));
            }
            Operand::Imm(_) => {
                return Err(FuzzErr::Assembler(format!("Unencodable '{}'", instr)));
            }
        },
        Instruction::Setcc { cond, dst } => setcc!(a, cond, gpr8(dst)),
        Instruction::Lfence => a.lfence()?,
    }

    Ok(())
}

/// Emit the whole program body. Control leaves the body by falling off the
/// end, which is where the caller places its epilogue
pub fn emit_program(a: &mut CodeAssembler, program: &TestProgram) -> Result<(), FuzzErr> {
    let targets = program.branch_targets();
    let mut labels: Vec<CodeLabel> = (0..targets.len()).map(|_| a.create_label()).collect();

    for (idx, block) in program.blocks.iter().enumerate() {
        // A label needs an instruction of its own, empty blocks may stack
        if targets[idx] {
            a.set_label(&mut labels[idx])?;
            a.nop()?;
        }

        for instr in &block.instructions {
            emit_instruction(a, instr, program.layout)?;
        }

        if let Terminator::CondJump { cond, target } = block.terminator {
            let label = labels[target];
            jcc!(a, cond, label);
        }
    }

    let exit = program.blocks.len();
    if targets[exit] {
        a.set_label(&mut labels[exit])?;
        a.nop()?;
    }

    Ok(())
}

/// Standalone encoding of a program body, used for reproducibility checks
/// and reports
pub fn encode(program: &TestProgram) -> Result<Vec<u8>, FuzzErr> {
    let mut a = CodeAssembler::new(BITNESS)?;
    emit_program(&mut a, program)?;
    Ok(a.assemble(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::tests::branchy_program;

    #[test]
    fn encodes_branchy_program() {
        let bytes = encode(&branchy_program()).unwrap();
        assert!(!bytes.is_empty());

        // cmp rax, rbx
        assert_eq!(&bytes[..3], &[0x48, 0x39, 0xD8]);
    }

    #[test]
    fn memory_operands_are_masked() {
        let program = TestProgram {
            seed: 0,
            layout: SandboxLayout::default(),
            blocks: vec![crate::program::BasicBlock {
                instructions: vec![Instruction::Mov {
                    dst: Operand::Reg(Reg::Rax),
                    src: Operand::Mem(Reg::Rbx),
                }],
                terminator: Terminator::FallThrough,
            }],
        };
        let bytes = encode(&program).unwrap();

        // and rbx, 0xfc0 (REX.W 81 /4 id)
        assert_eq!(&bytes[..7], &[0x48, 0x81, 0xE3, 0xC0, 0x0F, 0x00, 0x00]);
    }

    fn single(instructions: Vec<Instruction>, terminator: Terminator) -> TestProgram {
        TestProgram {
            seed: 0,
            layout: SandboxLayout::default(),
            blocks: vec![crate::program::BasicBlock {
                instructions,
                terminator,
            }],
        }
    }

    #[test]
    fn every_condition_encodes() {
        // Cond::ALL is in x86 condition code order
        for (cc, cond) in Cond::ALL.into_iter().enumerate() {
            let cc = cc as u8;

            let setcc = encode(&single(
                vec![Instruction::Setcc { cond, dst: Reg::Rax }],
                Terminator::FallThrough,
            ))
            .unwrap();
            assert_eq!(&setcc[..3], &[0x0F, 0x90 + cc, 0xC0], "set{:?}", cond);

            let cmov = encode(&single(
                vec![Instruction::Cmov {
                    cond,
                    dst: Reg::Rax,
                    src: Operand::Reg(Reg::Rbx),
                }],
                Terminator::FallThrough,
            ))
            .unwrap();
            assert_eq!(&cmov[..4], &[0x48, 0x0F, 0x40 + cc, 0xC3], "cmov{:?}", cond);

            let jcc = encode(&single(vec![], Terminator::CondJump { cond, target: 1 })).unwrap();
            let short = jcc[0] == 0x70 + cc;
            let near = jcc[0] == 0x0F && jcc[1] == 0x80 + cc;
            assert!(short || near, "j{:?}: {:02x?}", cond, jcc);
        }
    }
}
