//! Greedy shrinking of confirmed violations. Every candidate step has to keep
//! both inputs in one contract class and survive the observation filter,
//! otherwise it is thrown away

use crate::err::FuzzErr;
use crate::executor::{Executor, HwTrace, Measurement};
use crate::filter::ObservationFilter;
use crate::input::Input;
use crate::isa::Reg;
use crate::model::ContractModel;
use crate::program::{TestProgram, CACHE_LINE_SIZE, Terminator};

/// Reproducer left after shrinking
#[derive(Debug, Clone)]
pub struct Minimized {
    pub program: TestProgram,
    pub input_a: Input,
    pub input_b: Input,
    pub trace_a: HwTrace,
    pub trace_b: HwTrace,

    /// Candidates that were tried
    pub checks: usize,
}

pub struct Minimizer<'a> {
    model: &'a ContractModel,
    filter: &'a ObservationFilter,
    max_checks: usize,
    priming: bool,
}

impl<'a> Minimizer<'a> {
    pub fn new(
        model: &'a ContractModel,
        filter: &'a ObservationFilter,
        max_checks: usize,
        priming: bool,
    ) -> Self {
        Minimizer {
            model,
            filter,
            max_checks,
            priming,
        }
    }

    /// Does the candidate still show a confirmed violation. Returns the two
    /// traces when it does
    fn check(
        &self,
        executor: &mut dyn Executor,
        program: &TestProgram,
        a: &Input,
        b: &Input,
    ) -> Result<Option<(HwTrace, HwTrace)>, FuzzErr> {
        // Same class or the comparison is meaningless
        let model_a = self.model.run(program, a);
        let model_b = self.model.run(program, b);
        let faults_allowed = program.layout.faulty_page;
        if (!faults_allowed && (model_a.faulted || model_b.faulted)) || model_a.trace != model_b.trace {
            return Ok(None);
        }

        executor.load_program(program)?;
        let primer = self.priming.then_some(a);
        let trace_a = match executor.measure(a, primer)? {
            Measurement::Trace(trace) => trace,
            Measurement::Inconclusive(_) => return Ok(None),
        };
        let trace_b = match executor.measure(b, primer)? {
            Measurement::Trace(trace) => trace,
            Measurement::Inconclusive(_) => return Ok(None),
        };

        if trace_a == trace_b {
            return Ok(None);
        }

        if !self.filter.confirm(executor, a, b, primer, (trace_a, trace_b))? {
            return Ok(None);
        }

        Ok(Some((trace_a, trace_b)))
    }

    /// Shrink a violation. The executor has the original program loaded
    /// again when this returns
    pub fn minimize(
        &self,
        executor: &mut dyn Executor,
        program: &TestProgram,
        a: &Input,
        b: &Input,
        traces: (HwTrace, HwTrace),
    ) -> Result<Minimized, FuzzErr> {
        let mut best = Minimized {
            program: program.clone(),
            input_a: a.clone(),
            input_b: b.clone(),
            trace_a: traces.0,
            trace_b: traces.1,
            checks: 0,
        };

        // Drop instructions, last to first
        for block in (0..best.program.blocks.len()).rev() {
            for idx in (0..best.program.blocks[block].instructions.len()).rev() {
                if best.checks >= self.max_checks {
                    break;
                }

                let candidate = best.program.without_instruction(block, idx);
                self.try_candidate(executor, &mut best, candidate, None)?;
            }
        }

        // Straighten branches
        for block in 0..best.program.blocks.len() {
            if best.checks >= self.max_checks {
                break;
            }
            if best.program.blocks[block].terminator == Terminator::FallThrough {
                continue;
            }

            let candidate = best.program.with_fallthrough(block);
            self.try_candidate(executor, &mut best, candidate, None)?;
        }

        // Make the inputs agree wherever the leak does not need them to differ
        for reg in Reg::ALL {
            if best.checks >= self.max_checks {
                break;
            }
            if best.input_a.reg(reg) == best.input_b.reg(reg) {
                continue;
            }

            let mut candidate = best.input_b.clone();
            candidate.regs[reg.index()] = best.input_a.reg(reg);
            let program = best.program.clone();
            self.try_candidate(executor, &mut best, program, Some(candidate))?;
        }

        let words = CACHE_LINE_SIZE / 8;
        for line in best.input_a.differing_lines(&best.input_b) {
            if best.checks >= self.max_checks {
                break;
            }

            let mut candidate = best.input_b.clone();
            let range = line * words..(line + 1) * words;
            candidate.memory[range.clone()].copy_from_slice(&best.input_a.memory[range]);
            let program = best.program.clone();
            self.try_candidate(executor, &mut best, program, Some(candidate))?;
        }

        executor.load_program(program)?;
        Ok(best)
    }

    fn try_candidate(
        &self,
        executor: &mut dyn Executor,
        best: &mut Minimized,
        program: TestProgram,
        input_b: Option<Input>,
    ) -> Result<(), FuzzErr> {
        best.checks += 1;

        let b = input_b.as_ref().unwrap_or(&best.input_b);
        if let Some((trace_a, trace_b)) = self.check(executor, &program, &best.input_a, b)? {
            if let Some(input_b) = input_b {
                best.input_b = input_b;
            }
            best.program = program;
            best.trace_a = trace_a;
            best.trace_b = trace_b;
        }

        Ok(())
    }
}
