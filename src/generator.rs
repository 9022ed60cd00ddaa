//! This file contains the random program generator. Every program is a pure
//! function of (seed, parameters) so any violation can be regenerated from the
//! seed printed in its report

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::err::FuzzErr;
use crate::isa::{BinaryOp, Category, Cond, Instruction, LogicalOp, Operand, Reg, UnaryOp};
use crate::program::{BasicBlock, SandboxLayout, Terminator, TestProgram};

/// Percentage of immediates drawn from the small, sandbox sized range
const SMALL_IMM_RATE: u32 = 80;

/// Shape parameters for generated programs
#[derive(Debug, Clone)]
pub struct GeneratorParams {
    pub program_size: usize,
    pub min_bb: usize,
    pub max_bb: usize,
    pub avg_mem_accesses: f64,
    pub categories: Vec<Category>,
    pub layout: SandboxLayout,
}

impl GeneratorParams {
    pub fn from_config(config: &Config) -> Self {
        GeneratorParams {
            program_size: config.program_size,
            min_bb: config.min_bb_per_function,
            max_bb: config.max_bb_per_function,
            avg_mem_accesses: config.avg_mem_accesses,
            categories: config.instruction_categories.clone(),
            layout: SandboxLayout::new(config.enable_faulty_page),
        }
    }
}

pub struct ProgramGenerator {
    params: GeneratorParams,
    body_categories: Vec<Category>,
    branches: bool,
    mem_rate: f64,
}

impl ProgramGenerator {
    pub fn new(params: GeneratorParams) -> Result<Self, FuzzErr> {
        if params.min_bb == 0 || params.min_bb > params.max_bb {
            return Err(FuzzErr::config("Basic block bounds must satisfy 0 < min <= max"));
        }

        let body_categories: Vec<Category> = params
            .categories
            .iter()
            .copied()
            .filter(|cat| cat.is_body())
            .collect();

        if body_categories.is_empty() && params.program_size > 0 {
            return Err(FuzzErr::config(
                "No straight-line instruction category allowed, cannot fill program",
            ));
        }

        // Only some categories can take a memory operand, boost the per
        // instruction rate so the expected access count still hits the target
        let mem_capable = body_categories
            .iter()
            .filter(|cat| cat.can_access_memory())
            .count();
        let mem_rate = if mem_capable == 0 || params.program_size == 0 {
            0.0
        } else {
            let share = mem_capable as f64 / body_categories.len() as f64;
            (params.avg_mem_accesses / params.program_size as f64 / share).clamp(0.0, 1.0)
        };

        let branches = params.categories.contains(&Category::BaseCondBr);

        Ok(ProgramGenerator {
            params,
            body_categories,
            branches,
            mem_rate,
        })
    }

    /// Generate one program from a seed. A program that fails validation is a
    /// generator bug and is reported as a fatal `Generation` error
    pub fn generate(&self, seed: u64) -> Result<TestProgram, FuzzErr> {
        let mut rng = StdRng::seed_from_u64(seed);

        // Pick the shape first
        let num_blocks = rng.random_range(self.params.min_bb..=self.params.max_bb);
        let mut sizes = vec![0usize; num_blocks];
        for _ in 0..self.params.program_size {
            sizes[rng.random_range(0..num_blocks)] += 1;
        }

        let mut blocks = Vec::with_capacity(num_blocks);
        for (idx, size) in sizes.into_iter().enumerate() {
            let instructions = (0..size).map(|_| self.random_instruction(&mut rng)).collect();
            let terminator = self.random_terminator(idx, num_blocks, &mut rng);
            blocks.push(BasicBlock {
                instructions,
                terminator,
            });
        }

        let program = TestProgram {
            seed,
            layout: self.params.layout,
            blocks,
        };
        program.validate(&self.params.categories)?;

        Ok(program)
    }

    // Blocks branch forward past their fall-through successor, which keeps
    // the graph acyclic and every block reachable through fall-through
    fn random_terminator(&self, idx: usize, num_blocks: usize, rng: &mut StdRng) -> Terminator {
        if !self.branches || idx + 2 > num_blocks {
            return Terminator::FallThrough;
        }

        Terminator::CondJump {
            cond: random_cond(rng),
            target: rng.random_range(idx + 2..=num_blocks),
        }
    }

    fn random_instruction(&self, rng: &mut StdRng) -> Instruction {
        let category = self.body_categories[rng.random_range(0..self.body_categories.len())];
        let mem = category.can_access_memory() && rng.random_bool(self.mem_rate);
        generate_instruction(category, mem, rng)
    }
}

fn random_reg(rng: &mut StdRng) -> Reg {
    Reg::ALL[rng.random_range(0..Reg::ALL.len())]
}

fn random_cond(rng: &mut StdRng) -> Cond {
    Cond::ALL[rng.random_range(0..Cond::ALL.len())]
}

fn random_imm(rng: &mut StdRng) -> i32 {
    if rng.random_range(0..100) < SMALL_IMM_RATE {
        rng.random_range(0..0x1000)
    } else {
        rng.random::<i32>()
    }
}

/// Register or immediate source operand
fn reg_or_imm(rng: &mut StdRng) -> Operand {
    if rng.random_bool(0.5) {
        Operand::Reg(random_reg(rng))
    } else {
        Operand::Imm(random_imm(rng))
    }
}

/// Build one instruction of the given category. `mem` asks for a sandbox
/// memory operand on categories that support one
pub fn generate_instruction(category: Category, mem: bool, rng: &mut StdRng) -> Instruction {
    match category {
        Category::BaseBinary => {
            let op = BinaryOp::ALL[rng.random_range(0..BinaryOp::ALL.len())];
            let (dst, src) = two_operands(mem, false, rng);
            Instruction::Binary { op, dst, src }
        }
        Category::BaseLogical => {
            let op = LogicalOp::ALL[rng.random_range(0..LogicalOp::ALL.len())];
            let (dst, src) = two_operands(mem, op == LogicalOp::Test, rng);
            Instruction::Logical { op, dst, src }
        }
        Category::BaseUnary => {
            let op = UnaryOp::ALL[rng.random_range(0..UnaryOp::ALL.len())];
            let dst = if mem {
                Operand::Mem(random_reg(rng))
            } else {
                Operand::Reg(random_reg(rng))
            };
            Instruction::Unary { op, dst }
        }
        Category::BaseDataXfer => {
            let (dst, src) = two_operands(mem, false, rng);
            Instruction::Mov { dst, src }
        }
        Category::BaseCmov => {
            let src = if mem {
                Operand::Mem(random_reg(rng))
            } else {
                Operand::Reg(random_reg(rng))
            };
            Instruction::Cmov {
                cond: random_cond(rng),
                dst: random_reg(rng),
                src,
            }
        }
        Category::BaseSetcc => Instruction::Setcc {
            cond: random_cond(rng),
            dst: random_reg(rng),
        },
        Category::SpecialFence => Instruction::Lfence,
        // Branches are terminators, never part of a block body
        Category::BaseCondBr => unreachable!("conditional branches are terminators"),
    }
}

/// Destination and source for two-operand forms. With `mem`, the memory
/// operand goes either side unless `mem_dst_only`
fn two_operands(mem: bool, mem_dst_only: bool, rng: &mut StdRng) -> (Operand, Operand) {
    if !mem {
        return (Operand::Reg(random_reg(rng)), reg_or_imm(rng));
    }

    let base = random_reg(rng);
    if mem_dst_only || rng.random_bool(0.5) {
        (Operand::Mem(base), reg_or_imm(rng))
    } else {
        (Operand::Reg(random_reg(rng)), Operand::Mem(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::encode;
    use proptest::prelude::*;

    pub fn params() -> GeneratorParams {
        GeneratorParams {
            program_size: 24,
            min_bb: 2,
            max_bb: 5,
            avg_mem_accesses: 8.0,
            categories: Category::ALL.to_vec(),
            layout: SandboxLayout::default(),
        }
    }

    #[test]
    fn same_seed_same_program() {
        let generator = ProgramGenerator::new(params()).unwrap();
        let a = generator.generate(0xDEADBEEF).unwrap();
        let b = generator.generate(0xDEADBEEF).unwrap();
        assert_eq!(a, b);
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());

        let c = generator.generate(0xDEADBEF0).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn shape_follows_parameters() {
        let generator = ProgramGenerator::new(params()).unwrap();
        for seed in 0..50 {
            let program = generator.generate(seed).unwrap();
            assert_eq!(program.instruction_count(), 24);
            assert!((2..=5).contains(&program.blocks.len()));
            assert_eq!(
                program.blocks.last().unwrap().terminator,
                Terminator::FallThrough
            );
        }
    }

    #[test]
    fn memory_density_converges() {
        let generator = ProgramGenerator::new(params()).unwrap();
        let programs = 400;
        let total: usize = (0..programs)
            .map(|seed| generator.generate(seed).unwrap().mem_access_count())
            .sum();
        let mean = total as f64 / programs as f64;
        assert!((6.0..10.0).contains(&mean), "mean accesses {}", mean);
    }

    #[test]
    fn no_branches_without_branch_category() {
        let mut p = params();
        p.categories.retain(|c| *c != Category::BaseCondBr);
        let generator = ProgramGenerator::new(p).unwrap();
        for seed in 0..20 {
            assert_eq!(generator.generate(seed).unwrap().branch_count(), 0);
        }
    }

    #[test]
    fn rejects_unfillable_parameters() {
        let mut p = params();
        p.categories = vec![Category::BaseCondBr];
        assert!(ProgramGenerator::new(p).is_err());

        let mut p = params();
        p.min_bb = 6;
        assert!(ProgramGenerator::new(p).is_err());
    }

    proptest! {
        #[test]
        fn generated_programs_are_sound(
            seed in any::<u64>(),
            mask in 1u8..=u8::MAX,
            faulty in any::<bool>(),
        ) {
            let categories: Vec<Category> = Category::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, c)| *c)
                .collect();
            prop_assume!(categories.iter().any(|c| c.is_body()));

            let p = GeneratorParams {
                categories: categories.clone(),
                layout: SandboxLayout::new(faulty),
                ..params()
            };
            let generator = ProgramGenerator::new(p).unwrap();
            let program = generator.generate(seed).unwrap();

            for block in &program.blocks {
                for instr in &block.instructions {
                    prop_assert!(categories.contains(&instr.category()));
                }
            }

            // Every block falls into the next, so every block is reachable
            let exit = program.blocks.len();
            for (idx, block) in program.blocks.iter().enumerate() {
                if let Terminator::CondJump { target, .. } = block.terminator {
                    prop_assert!(target > idx + 1 && target <= exit);
                }
            }

            prop_assert!(encode(&program).is_ok());
        }
    }
}
