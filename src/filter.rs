//! False positive filters. The speculation filter drops classes before they
//! cost any hardware time, the observation filter re-measures a divergence
//! until it either reproduces every time or is written off as noise

use crate::classify::EquivalenceClass;
use crate::config::Config;
use crate::err::FuzzErr;
use crate::executor::{Executor, HwTrace, Measurement};
use crate::input::Input;

/// Is the class worth measuring
pub fn keep_class(class: &EquivalenceClass, speculation_filter: bool) -> bool {
    // Nothing to compare against
    if class.len() < 2 {
        return false;
    }

    !speculation_filter || class.speculative
}

pub struct ObservationFilter {
    enabled: bool,
    rounds: usize,
}

impl ObservationFilter {
    pub fn new(enabled: bool, repetitions: usize, priming: bool) -> Self {
        // Without priming the predictors start from wherever, ask for more
        let rounds = if priming { repetitions } else { repetitions * 2 };
        ObservationFilter { enabled, rounds }
    }

    pub fn from_config(config: &Config) -> Self {
        ObservationFilter::new(
            config.enable_observation_filter,
            config.observation_filter_repetitions,
            config.enable_priming,
        )
    }

    /// Re-measure a divergence between `a` and `b`. Confirmed only if every
    /// round is conclusive and shows exactly the original two traces
    pub fn confirm(
        &self,
        executor: &mut dyn Executor,
        a: &Input,
        b: &Input,
        primer: Option<&Input>,
        expected: (HwTrace, HwTrace),
    ) -> Result<bool, FuzzErr> {
        if expected.0 == expected.1 {
            return Ok(false);
        }

        if !self.enabled {
            return Ok(true);
        }

        for _ in 0..self.rounds {
            let trace_a = match executor.measure(a, primer)? {
                Measurement::Trace(trace) => trace,
                Measurement::Inconclusive(_) => return Ok(false),
            };
            let trace_b = match executor.measure(b, primer)? {
                Measurement::Trace(trace) => trace,
                Measurement::Inconclusive(_) => return Ok(false),
            };

            if trace_a != expected.0 || trace_b != expected.1 {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::executor::simulated::SimulatedExecutor;
    use crate::input::InputGenerator;
    use crate::isa::Reg;
    use crate::model::{Contract, ContractModel, ExecutionClause, ObservationClause};
    use crate::program::tests::branchy_program;
    use crate::program::SandboxLayout;

    /// Two inputs that take the branch and only differ in rdx, which only the
    /// mispredicted path reads
    pub fn leaking_pair() -> (Input, Input) {
        let mut a = InputGenerator::new(4).unwrap().random_input(11);
        a.regs = [0x40, 0x40, 0, 0x80, 0, 0xC0];
        a.flags = 0x2;
        let mut b = a.clone();
        b.regs[Reg::Rdx.index()] = 0x100;
        (a, b)
    }

    fn class(speculative: bool, members: usize) -> EquivalenceClass {
        EquivalenceClass {
            trace: vec![],
            members: (0..members).collect(),
            speculative,
        }
    }

    fn expect_trace(m: Measurement) -> HwTrace {
        match m {
            Measurement::Trace(trace) => trace,
            Measurement::Inconclusive(reason) => panic!("inconclusive: {}", reason),
        }
    }

    #[test]
    fn speculation_filter() {
        assert!(!keep_class(&class(true, 1), true));
        assert!(!keep_class(&class(false, 4), true));
        assert!(keep_class(&class(false, 4), false));
        assert!(keep_class(&class(true, 2), true));
    }

    #[test]
    fn confirmed_violation_reproduces() {
        let (a, b) = leaking_pair();
        let program = branchy_program();

        // Same class under a sequential contract
        let model = ContractModel::new(
            Contract {
                observation: ObservationClause::Ct,
                execution: ExecutionClause::Seq,
            },
            SandboxLayout::default(),
            250,
            1,
        );
        assert_eq!(model.run(&program, &a).trace, model.run(&program, &b).trace);

        let mut executor =
            SimulatedExecutor::new(ExecutionClause::Cond, SandboxLayout::default(), 250, 0.0, 1);
        executor.load_program(&program).unwrap();
        let ta = expect_trace(executor.measure(&a, Some(&a)).unwrap());
        let tb = expect_trace(executor.measure(&b, Some(&a)).unwrap());
        assert_ne!(ta, tb);

        let filter = ObservationFilter::new(true, 5, true);
        assert!(filter.confirm(&mut executor, &a, &b, Some(&a), (ta, tb)).unwrap());

        // Confirming again gives the same answer
        assert!(filter.confirm(&mut executor, &a, &b, Some(&a), (ta, tb)).unwrap());
    }

    #[test]
    fn jitter_never_survives() {
        let (a, _) = leaking_pair();
        let program = branchy_program();

        // Identical behavior, the only differences come from jitter
        let mut executor =
            SimulatedExecutor::new(ExecutionClause::Seq, SandboxLayout::default(), 250, 0.5, 7);
        executor.load_program(&program).unwrap();
        let filter = ObservationFilter::new(true, 10, false);
        assert_eq!(filter.rounds, 20);

        let mut divergences = 0;
        for _ in 0..200 {
            let ta = expect_trace(executor.measure(&a, None).unwrap());
            let tb = expect_trace(executor.measure(&a, None).unwrap());
            if ta == tb {
                continue;
            }

            divergences += 1;
            assert!(!filter.confirm(&mut executor, &a, &a, None, (ta, tb)).unwrap());
        }
        assert!(divergences > 0);
    }

    #[test]
    fn disabled_filter_takes_first_divergence() {
        let (a, b) = leaking_pair();
        let mut executor =
            SimulatedExecutor::new(ExecutionClause::Seq, SandboxLayout::default(), 250, 0.0, 1);
        executor.load_program(&branchy_program()).unwrap();

        let filter = ObservationFilter::new(false, 5, true);
        let ta = HwTrace { sets: 1, faulted: false };
        let tb = HwTrace { sets: 2, faulted: false };
        assert!(filter.confirm(&mut executor, &a, &b, None, (ta, tb)).unwrap());
        assert!(!filter.confirm(&mut executor, &a, &b, None, (ta, ta)).unwrap());
    }
}
