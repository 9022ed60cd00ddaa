//! An executor without hardware. It plays a CPU that speculates the way its
//! own execution clause says, reporting every cache set the model touched.
//! Optional jitter flips one random set on some runs, standing in for
//! measurement noise

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::err::FuzzErr;
use crate::executor::{summarize, Executor, HwTrace, Measurement};
use crate::input::Input;
use crate::model::{Contract, ContractModel, ExecutionClause, ObservationClause};
use crate::program::{SandboxLayout, TestProgram, L1D_SETS};

pub struct SimulatedExecutor {
    model: ContractModel,
    program: Option<TestProgram>,
    jitter: f64,
    rng: StdRng,
    warmups: usize,
    repetitions: usize,
    ambiguity: f64,
}

impl SimulatedExecutor {
    pub fn new(
        execution: ExecutionClause,
        layout: SandboxLayout,
        spec_window: usize,
        jitter: f64,
        seed: u64,
    ) -> Self {
        let contract = Contract {
            observation: ObservationClause::L1d,
            execution,
        };

        SimulatedExecutor {
            model: ContractModel::new(contract, layout, spec_window, 1),
            program: None,
            jitter: jitter.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
            warmups: 0,
            repetitions: 1,
            ambiguity: 0.2,
        }
    }

    /// Repetition settings, same meaning as for the hardware executor
    pub fn with_repetitions(mut self, warmups: usize, repetitions: usize, ambiguity: f64) -> Self {
        self.warmups = warmups;
        self.repetitions = repetitions.max(1);
        self.ambiguity = ambiguity;
        self
    }

    fn run_once(&mut self, program: &TestProgram, input: &Input) -> HwTrace {
        let result = self.model.run(program, input);
        let mut sets = result.touched_sets;

        if self.jitter > 0.0 && self.rng.random_bool(self.jitter) {
            sets ^= 1 << self.rng.random_range(0..L1D_SETS);
        }

        HwTrace {
            sets,
            faulted: result.faulted,
        }
    }
}

impl Executor for SimulatedExecutor {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn load_program(&mut self, program: &TestProgram) -> Result<(), FuzzErr> {
        self.program = Some(program.clone());
        Ok(())
    }

    fn measure(&mut self, input: &Input, _primer: Option<&Input>) -> Result<Measurement, FuzzErr> {
        let program = self
            .program
            .take()
            .ok_or_else(|| FuzzErr::executor("No program loaded"))?;

        for _ in 0..self.warmups {
            self.run_once(&program, input);
        }

        let samples: Vec<HwTrace> = (0..self.repetitions)
            .map(|_| self.run_once(&program, input))
            .collect();
        self.program = Some(program);

        Ok(summarize(&samples, self.ambiguity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputGenerator;
    use crate::program::tests::branchy_program;

    #[test]
    fn reports_speculative_sets() {
        let mut input = InputGenerator::new(4).unwrap().random_input(0);
        input.regs = [0x40, 0x40, 0, 0x80, 0, 0xC0];
        input.flags = 0x2;

        let mut seq = SimulatedExecutor::new(ExecutionClause::Seq, SandboxLayout::default(), 250, 0.0, 0);
        seq.load_program(&branchy_program()).unwrap();
        let Measurement::Trace(trace) = seq.measure(&input, None).unwrap() else {
            panic!("noiseless simulation is always conclusive");
        };
        assert_eq!(trace.sets, 1 << 3);

        // The mispredicted not-taken side loads through rdx
        let mut cond = SimulatedExecutor::new(ExecutionClause::Cond, SandboxLayout::default(), 250, 0.0, 0);
        cond.load_program(&branchy_program()).unwrap();
        let Measurement::Trace(trace) = cond.measure(&input, None).unwrap() else {
            panic!("noiseless simulation is always conclusive");
        };
        assert_eq!(trace.sets, (1 << 2) | (1 << 3));
    }

    #[test]
    fn needs_a_program() {
        let input = InputGenerator::new(4).unwrap().random_input(0);
        let mut sim = SimulatedExecutor::new(ExecutionClause::Seq, SandboxLayout::default(), 250, 0.0, 0);
        assert!(sim.measure(&input, None).is_err());
    }
}
