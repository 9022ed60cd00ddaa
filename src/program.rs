//! Test programs: basic blocks of cataloged instructions wired into an
//! acyclic control flow graph, plus the sandbox layout they address

use std::fmt;

use crate::err::FuzzErr;
use crate::isa::{Category, Cond, Instruction};

/// Size of the sandbox region inputs control
pub const MAIN_REGION_SIZE: usize = 0x1000;

/// Size of the page that faults on access when enabled
pub const FAULTY_REGION_SIZE: usize = 0x1000;

pub const CACHE_LINE_SIZE: usize = 64;

/// Number of L1D sets covered by one page
pub const L1D_SETS: usize = 64;

/// How a program's memory accesses are confined to the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SandboxLayout {
    pub faulty_page: bool,
}

impl SandboxLayout {
    pub fn new(faulty_page: bool) -> Self {
        SandboxLayout { faulty_page }
    }

    /// Mask applied to a base register right before it is used as an offset,
    /// cache line aligned and spanning the faulty page only when enabled
    pub fn mask(&self) -> u64 {
        let span = if self.faulty_page {
            MAIN_REGION_SIZE + FAULTY_REGION_SIZE
        } else {
            MAIN_REGION_SIZE
        };

        (span as u64 - 1) & !(CACHE_LINE_SIZE as u64 - 1)
    }

    #[inline]
    pub fn is_faulty(&self, offset: u64) -> bool {
        self.faulty_page && offset as usize >= MAIN_REGION_SIZE
    }
}

/// How a basic block hands over control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminator {
    /// Continue with the next block (or leave the program after the last)
    FallThrough,

    /// Jump to `target` if `cond` holds, otherwise fall through. A target
    /// equal to the block count is the program exit
    CondJump { cond: Cond, target: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

/// An immutable candidate program
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestProgram {
    pub seed: u64,
    pub layout: SandboxLayout,
    pub blocks: Vec<BasicBlock>,
}

/// Flattened view of a program: block structure erased, branch targets
/// resolved to instruction indices. Index `exit` is one past the end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatOp<'a> {
    Instr(&'a Instruction),
    Branch { cond: Cond, target: usize },
}

pub struct FlatProgram<'a> {
    pub ops: Vec<FlatOp<'a>>,
    pub exit: usize,
}

impl TestProgram {
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }

    pub fn mem_access_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| i.mem_base().is_some())
            .count()
    }

    pub fn branch_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b.terminator, Terminator::CondJump { .. }))
            .count()
    }

    /// Check every structural invariant the generator promises: only allowed
    /// categories, well formed operands, forward branches inside the program
    pub fn validate(&self, allowed: &[Category]) -> Result<(), FuzzErr> {
        if self.blocks.is_empty() {
            return Err(FuzzErr::generation("Program has no basic blocks"));
        }

        let exit = self.blocks.len();
        for (idx, block) in self.blocks.iter().enumerate() {
            for instr in &block.instructions {
                if !allowed.contains(&instr.category()) {
                    return Err(FuzzErr::Generation(format!(
                        "Instruction '{}' in .bb{} is outside the allowed categories ({})",
                        instr,
                        idx,
                        instr.category()
                    )));
                }

                if !instr.is_well_formed() {
                    return Err(FuzzErr::Generation(format!(
                        "Malformed operands in '{}' (.bb{})",
                        instr, idx
                    )));
                }
            }

            if let Terminator::CondJump { target, .. } = block.terminator {
                if !allowed.contains(&Category::BaseCondBr) {
                    return Err(FuzzErr::Generation(format!(
                        "Conditional branch in .bb{} but {} is not allowed",
                        idx,
                        Category::BaseCondBr
                    )));
                }

                if target <= idx || target > exit {
                    return Err(FuzzErr::Generation(format!(
                        "Branch target .bb{} of .bb{} is not a forward block",
                        target, idx
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve blocks into a flat op list
    pub fn flatten(&self) -> FlatProgram<'_> {
        // First pass for the start index of each block
        let mut starts = Vec::with_capacity(self.blocks.len() + 1);
        let mut pc = 0;
        for block in &self.blocks {
            starts.push(pc);
            pc += block.instructions.len();
            if matches!(block.terminator, Terminator::CondJump { .. }) {
                pc += 1;
            }
        }
        starts.push(pc);

        let mut ops = Vec::with_capacity(pc);
        for block in &self.blocks {
            ops.extend(block.instructions.iter().map(FlatOp::Instr));
            if let Terminator::CondJump { cond, target } = block.terminator {
                ops.push(FlatOp::Branch {
                    cond,
                    target: starts[target],
                });
            }
        }

        FlatProgram { ops, exit: pc }
    }

    /// Copy of the program with one instruction removed
    pub fn without_instruction(&self, block: usize, idx: usize) -> TestProgram {
        let mut program = self.clone();
        program.blocks[block].instructions.remove(idx);
        program
    }

    /// Copy of the program with a block's conditional branch dropped
    pub fn with_fallthrough(&self, block: usize) -> TestProgram {
        let mut program = self.clone();
        program.blocks[block].terminator = Terminator::FallThrough;
        program
    }

    /// Blocks that are the target of some branch; the exit is included as
    /// index `blocks.len()`
    pub fn branch_targets(&self) -> Vec<bool> {
        let mut targets = vec![false; self.blocks.len() + 1];
        for block in &self.blocks {
            if let Terminator::CondJump { target, .. } = block.terminator {
                targets[target] = true;
            }
        }
        targets
    }
}

impl fmt::Display for TestProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "; seed {:#x}, memory operands masked with {:#x}",
            self.seed,
            self.layout.mask()
        )?;
        for (idx, block) in self.blocks.iter().enumerate() {
            writeln!(f, ".bb{}:", idx)?;
            for instr in &block.instructions {
                writeln!(f, "    {}", instr)?;
            }
            if let Terminator::CondJump { cond, target } = block.terminator {
                if target == self.blocks.len() {
                    writeln!(f, "    j{} .exit", cond.suffix())?;
                } else {
                    writeln!(f, "    j{} .bb{}", cond.suffix(), target)?;
                }
            }
        }
        write!(f, ".exit:")
    }
}
