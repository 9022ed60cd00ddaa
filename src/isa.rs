//! The instruction catalog: registers, condition codes, operand shapes and
//! the categories the generator is allowed to draw from. The catalog is a
//! fixed table, bump `CATALOG_VERSION` whenever a variant is added so saved
//! reports can be matched against the catalog that produced them.
//!
//! Every instruction is 64-bit and every memory operand is `[r14 + base]`
//! where `base` is masked into the sandbox right before the access.

use std::fmt;

pub const CATALOG_VERSION: u32 = 1;

/// EFLAGS bits we model
pub const FLAGS_CF: u64 = 1 << 0;
pub const FLAGS_PF: u64 = 1 << 2;
pub const FLAGS_AF: u64 = 1 << 4;
pub const FLAGS_ZF: u64 = 1 << 6;
pub const FLAGS_SF: u64 = 1 << 7;
pub const FLAGS_OF: u64 = 1 << 11;

/// All arithmetic flags
pub const FLAGS_ARITH: u64 = FLAGS_CF | FLAGS_PF | FLAGS_AF | FLAGS_ZF | FLAGS_SF | FLAGS_OF;

/// Reserved bit 1 of EFLAGS always reads as one
pub const FLAGS_RESERVED: u64 = 1 << 1;

/// Keep only the arithmetic flags, the rest of EFLAGS is never under the
/// control of an input
#[inline]
pub fn sanitize_flags(value: u64) -> u64 {
    (value & FLAGS_ARITH) | FLAGS_RESERVED
}

/// General purpose registers visible to generated code. r14 (sandbox base)
/// and r15 (harness scratch) are never handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
}

impl Reg {
    pub const ALL: [Reg; 6] = [Reg::Rax, Reg::Rbx, Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rbx => "rbx",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
        }
    }

    pub fn low_byte_name(self) -> &'static str {
        match self {
            Reg::Rax => "al",
            Reg::Rbx => "bl",
            Reg::Rcx => "cl",
            Reg::Rdx => "dl",
            Reg::Rsi => "sil",
            Reg::Rdi => "dil",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// x86 condition codes, in encoding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    pub const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Ae,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    /// Evaluate the condition against an EFLAGS value
    pub fn holds(self, flags: u64) -> bool {
        let cf = flags & FLAGS_CF != 0;
        let pf = flags & FLAGS_PF != 0;
        let zf = flags & FLAGS_ZF != 0;
        let sf = flags & FLAGS_SF != 0;
        let of = flags & FLAGS_OF != 0;

        match self {
            Cond::O => of,
            Cond::No => !of,
            Cond::B => cf,
            Cond::Ae => !cf,
            Cond::E => zf,
            Cond::Ne => !zf,
            Cond::Be => cf || zf,
            Cond::A => !cf && !zf,
            Cond::S => sf,
            Cond::Ns => !sf,
            Cond::P => pf,
            Cond::Np => !pf,
            Cond::L => sf != of,
            Cond::Ge => sf == of,
            Cond::Le => zf || sf != of,
            Cond::G => !zf && sf == of,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Cmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
    Xor,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Inc,
    Dec,
    Neg,
    Not,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 3] = [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Cmp];

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Cmp => "cmp",
        }
    }

    /// Does the op write its destination or only the flags
    pub fn writes_dst(self) -> bool {
        !matches!(self, BinaryOp::Cmp)
    }
}

impl LogicalOp {
    pub const ALL: [LogicalOp; 4] = [LogicalOp::And, LogicalOp::Or, LogicalOp::Xor, LogicalOp::Test];

    pub fn mnemonic(self) -> &'static str {
        match self {
            LogicalOp::And => "and",
            LogicalOp::Or => "or",
            LogicalOp::Xor => "xor",
            LogicalOp::Test => "test",
        }
    }

    pub fn writes_dst(self) -> bool {
        !matches!(self, LogicalOp::Test)
    }
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 4] = [UnaryOp::Inc, UnaryOp::Dec, UnaryOp::Neg, UnaryOp::Not];

    pub fn mnemonic(self) -> &'static str {
        match self {
            UnaryOp::Inc => "inc",
            UnaryOp::Dec => "dec",
            UnaryOp::Neg => "neg",
            UnaryOp::Not => "not",
        }
    }
}

/// Operand shapes. `Mem(base)` is the sandbox access `[r14 + base]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Imm(i32),
    Mem(Reg),
}

impl Operand {
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{}", reg),
            Operand::Imm(imm) => write!(f, "{:#x}", imm),
            Operand::Mem(base) => write!(f, "qword ptr [r14 + {}]", base),
        }
    }
}

/// Instruction categories of the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    BaseBinary,
    BaseLogical,
    BaseUnary,
    BaseDataXfer,
    BaseCmov,
    BaseSetcc,
    BaseCondBr,
    SpecialFence,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::BaseBinary,
        Category::BaseLogical,
        Category::BaseUnary,
        Category::BaseDataXfer,
        Category::BaseCmov,
        Category::BaseSetcc,
        Category::BaseCondBr,
        Category::SpecialFence,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::BaseBinary => "BASE-BINARY",
            Category::BaseLogical => "BASE-LOGICAL",
            Category::BaseUnary => "BASE-UNARY",
            Category::BaseDataXfer => "BASE-DATAXFER",
            Category::BaseCmov => "BASE-CMOV",
            Category::BaseSetcc => "BASE-SETCC",
            Category::BaseCondBr => "BASE-COND_BR",
            Category::SpecialFence => "SPECIAL-FENCE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Category::ALL
            .iter()
            .copied()
            .find(|cat| cat.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Categories that can carry a memory operand
    pub fn can_access_memory(self) -> bool {
        matches!(
            self,
            Category::BaseBinary
                | Category::BaseLogical
                | Category::BaseUnary
                | Category::BaseDataXfer
                | Category::BaseCmov
        )
    }

    /// Categories that produce straight-line instructions (the branch
    /// category only produces terminators)
    pub fn is_body(self) -> bool {
        !matches!(self, Category::BaseCondBr)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One instruction of a test program. Tagged by category so that generation,
/// modeling and encoding are all a single exhaustive match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    Binary { op: BinaryOp, dst: Operand, src: Operand },
    Logical { op: LogicalOp, dst: Operand, src: Operand },
    Unary { op: UnaryOp, dst: Operand },
    Mov { dst: Operand, src: Operand },
    Cmov { cond: Cond, dst: Reg, src: Operand },
    Setcc { cond: Cond, dst: Reg },
    Lfence,
}

impl Instruction {
    pub fn category(&self) -> Category {
        match self {
            Instruction::Binary { .. } => Category::BaseBinary,
            Instruction::Logical { .. } => Category::BaseLogical,
            Instruction::Unary { .. } => Category::BaseUnary,
            Instruction::Mov { .. } => Category::BaseDataXfer,
            Instruction::Cmov { .. } => Category::BaseCmov,
            Instruction::Setcc { .. } => Category::BaseSetcc,
            Instruction::Lfence => Category::SpecialFence,
        }
    }

    /// Base register of the memory operand, if the instruction has one
    pub fn mem_base(&self) -> Option<Reg> {
        let operands: [Option<Operand>; 2] = match *self {
            Instruction::Binary { dst, src, .. } => [Some(dst), Some(src)],
            Instruction::Logical { dst, src, .. } => [Some(dst), Some(src)],
            Instruction::Unary { dst, .. } => [Some(dst), None],
            Instruction::Mov { dst, src } => [Some(dst), Some(src)],
            Instruction::Cmov { src, .. } => [Some(src), None],
            Instruction::Setcc { .. } | Instruction::Lfence => [None, None],
        };

        operands.into_iter().flatten().find_map(|op| match op {
            Operand::Mem(base) => Some(base),
            _ => None,
        })
    }

    /// Operand shape rules the encoder relies on
    pub fn is_well_formed(&self) -> bool {
        match *self {
            Instruction::Binary { dst, src, .. } => match (dst, src) {
                (Operand::Imm(_), _) => false,
                (Operand::Mem(_), Operand::Mem(_)) => false,
                _ => true,
            },
            Instruction::Logical { op, dst, src } => match (dst, src) {
                (Operand::Imm(_), _) => false,
                (Operand::Mem(_), Operand::Mem(_)) => false,
                // `test` only encodes the memory operand on the left
                (Operand::Reg(_), Operand::Mem(_)) => op != LogicalOp::Test,
                _ => true,
            },
            Instruction::Unary { dst, .. } => !matches!(dst, Operand::Imm(_)),
            Instruction::Mov { dst, src } => match (dst, src) {
                (Operand::Imm(_), _) => false,
                (Operand::Mem(_), Operand::Mem(_)) => false,
                _ => true,
            },
            Instruction::Cmov { src, .. } => !matches!(src, Operand::Imm(_)),
            Instruction::Setcc { .. } | Instruction::Lfence => true,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Binary { op, dst, src } => write!(f, "{} {}, {}", op.mnemonic(), dst, src),
            Instruction::Logical { op, dst, src } => {
                write!(f, "{} {}, {}", op.mnemonic(), dst, src)
            }
            Instruction::Unary { op, dst } => write!(f, "{} {}", op.mnemonic(), dst),
            Instruction::Mov { dst, src } => write!(f, "mov {}, {}", dst, src),
            Instruction::Cmov { cond, dst, src } => {
                write!(f, "cmov{} {}, {}", cond.suffix(), dst, src)
            }
            Instruction::Setcc { cond, dst } => {
                write!(f, "set{} {}", cond.suffix(), dst.low_byte_name())
            }
            Instruction::Lfence => write!(f, "lfence"),
        }
    }
}
