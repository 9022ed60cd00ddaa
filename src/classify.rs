//! Partitioning of one program's inputs by their contract trace. Inputs are
//! only ever compared inside one `EquivalenceClass`

use std::collections::HashMap;

use crate::model::{ModelResult, Observation};

#[derive(Debug, Clone)]
pub struct EquivalenceClass {
    /// Trace every member produced
    pub trace: Vec<Observation>,

    /// Indices into the input list, in input order
    pub members: Vec<usize>,

    /// Some member reached a speculative observation
    pub speculative: bool,
}

impl EquivalenceClass {
    pub fn len(&self) -> usize {
        self.members.len()
    }
}

pub struct Classification {
    pub classes: Vec<EquivalenceClass>,

    /// Inputs whose model run faulted while faults were not expected
    pub invalid: Vec<usize>,
}

/// Bucket the model results of one program's inputs by identical traces,
/// classes are ordered by their first member
pub fn build_classes(results: &[ModelResult], faults_allowed: bool) -> Classification {
    let mut classes: Vec<EquivalenceClass> = Vec::new();
    let mut invalid = Vec::new();
    let mut index: HashMap<&[Observation], usize> = HashMap::new();

    for (idx, result) in results.iter().enumerate() {
        if result.faulted && !faults_allowed {
            invalid.push(idx);
            continue;
        }

        match index.get(result.trace.as_slice()) {
            Some(&class) => {
                classes[class].members.push(idx);
                classes[class].speculative |= result.spec_observations > 0;
            }
            None => {
                index.insert(result.trace.as_slice(), classes.len());
                classes.push(EquivalenceClass {
                    trace: result.trace.clone(),
                    members: vec![idx],
                    speculative: result.spec_observations > 0,
                });
            }
        }
    }

    Classification { classes, invalid }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Input;
    use crate::model::ContractModel;
    use crate::program::TestProgram;
    use crate::generator::{GeneratorParams, ProgramGenerator};
    use crate::input::InputGenerator;
    use crate::isa::{BinaryOp, Category, Cond, Instruction, Operand, Reg, FLAGS_RESERVED};
    use crate::model::{Contract, ExecutionClause, ObservationClause};
    use crate::program::tests::branchy_program;
    use crate::program::{BasicBlock, SandboxLayout, Terminator};
    use proptest::prelude::*;

    fn classify(model: &ContractModel, program: &TestProgram, inputs: &[Input]) -> Classification {
        let results: Vec<ModelResult> = inputs.iter().map(|input| model.run(program, input)).collect();
        build_classes(&results, program.layout.faulty_page)
    }

    fn ct_cond() -> ContractModel {
        ContractModel::new(
            Contract {
                observation: ObservationClause::Ct,
                execution: ExecutionClause::Cond,
            },
            SandboxLayout::default(),
            250,
            1,
        )
    }

    fn inputs_with(regs: &[[u64; 6]]) -> Vec<Input> {
        let gen = InputGenerator::new(4).unwrap();
        regs.iter()
            .enumerate()
            .map(|(i, r)| {
                let mut input = gen.random_input(i as u64);
                input.regs = *r;
                input.flags = FLAGS_RESERVED;
                input
            })
            .collect()
    }

    #[test]
    fn branch_independent_load_shares_class() {
        // cmp rax, rbx; jne .bb1 | .bb1: mov rcx, [rdx]
        let program = TestProgram {
            seed: 0,
            layout: SandboxLayout::default(),
            blocks: vec![
                BasicBlock {
                    instructions: vec![Instruction::Binary {
                        op: BinaryOp::Cmp,
                        dst: Operand::Reg(Reg::Rax),
                        src: Operand::Reg(Reg::Rbx),
                    }],
                    terminator: Terminator::CondJump {
                        cond: Cond::Ne,
                        target: 1,
                    },
                },
                BasicBlock {
                    instructions: vec![Instruction::Mov {
                        dst: Operand::Reg(Reg::Rcx),
                        src: Operand::Mem(Reg::Rdx),
                    }],
                    terminator: Terminator::FallThrough,
                },
            ],
        };

        // Only the branch condition differs
        let inputs = inputs_with(&[[0x40, 0x40, 0, 0x80, 0, 0], [0x40, 0x80, 0, 0x80, 0, 0]]);
        let classification = classify(&ct_cond(), &program, &inputs);
        assert_eq!(classification.classes.len(), 1);
        assert_eq!(classification.classes[0].members, vec![0, 1]);
        assert!(classification.classes[0].speculative);
    }

    #[test]
    fn branch_dependent_load_splits_classes() {
        let inputs = inputs_with(&[[0x40, 0x40, 0, 0x80, 0, 0xC0], [0x40, 0x80, 0, 0x80, 0, 0xC0]]);
        let classification = classify(&ct_cond(), &branchy_program(), &inputs);
        assert_eq!(classification.classes.len(), 2);
        assert_eq!(classification.classes[0].members, vec![0]);
        assert_eq!(classification.classes[1].members, vec![1]);
    }

    #[test]
    fn faulting_inputs_are_invalid_without_faulty_page() {
        let mut result = ct_cond().run(&branchy_program(), &inputs_with(&[[0; 6]])[0]);
        result.faulted = true;
        let classification = build_classes(&[result.clone(), result.clone()], false);
        assert!(classification.classes.is_empty());
        assert_eq!(classification.invalid, vec![0, 1]);

        let classification = build_classes(&[result.clone(), result], true);
        assert_eq!(classification.classes.len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn members_share_traces(seed in any::<u64>(), entropy in 1u32..4) {
            let generator = ProgramGenerator::new(GeneratorParams {
                program_size: 12,
                min_bb: 1,
                max_bb: 3,
                avg_mem_accesses: 4.0,
                categories: Category::ALL.to_vec(),
                layout: SandboxLayout::default(),
            }).unwrap();
            let program = generator.generate(seed).unwrap();
            let inputs = InputGenerator::new(entropy).unwrap().generate(seed, 16);

            let model = ct_cond();
            let classification = classify(&model, &program, &inputs);

            let mut seen = vec![false; inputs.len()];
            for class in &classification.classes {
                for &member in &class.members {
                    prop_assert!(!seen[member]);
                    seen[member] = true;
                    prop_assert_eq!(&model.run(&program, &inputs[member]).trace, &class.trace);
                }
            }
            for idx in classification.invalid {
                seen[idx] = true;
            }
            prop_assert!(seen.into_iter().all(|s| s));
        }
    }
}
