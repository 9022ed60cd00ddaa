//! This file contains the per worker fuzzing loop. One iteration generates a
//! program, splits its inputs into contract classes, measures every class
//! that might leak and hunts for two members whose hardware traces differ
//!
//! Generate -> Classify -> Filter(speculation) -> Execute -> Compare ->
//! Filter(observation) -> Minimize -> Report

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::classify::build_classes;
use crate::config::Config;
use crate::err::FuzzErr;
use crate::executor::{Executor, HwTrace, Measurement};
use crate::filter::{keep_class, ObservationFilter};
use crate::generator::{GeneratorParams, ProgramGenerator};
use crate::input::{Input, InputGenerator};
use crate::minimize::Minimizer;
use crate::model::{ContractModel, ModelResult};
use crate::program::TestProgram;
use crate::report::Violation;
use crate::stats::{SessionState, Stats};
use crate::{debug, finding};

#[inline]
fn start_timer() -> Instant {
    Instant::now()
}

#[inline]
fn end_timer(time_bank: &mut Duration, start: Instant) {
    let elapsed = start.elapsed();
    *time_bank += elapsed;
}

// Charge the time an operation takes to one of the batch stages
macro_rules! time_func {
    ($fuzzer:expr, $stat_field:ident, $operation:expr) => {{
        let start = start_timer();
        let result = $operation;
        end_timer(&mut $fuzzer.stats.$stat_field, start);
        result
    }};
}

/// What a single program turned up
pub enum FuzzingResult {
    Clean,
    Violation(Box<Violation>),
}

pub struct Fuzzer<'s> {
    pub id: usize,
    config: Config,
    generator: ProgramGenerator,
    input_gen: InputGenerator,
    model: ContractModel,
    executor: Box<dyn Executor>,
    filter: ObservationFilter,
    session: &'s SessionState,
    pub stats: Stats,
    rng: StdRng,
    violations: Vec<Violation>,
}

impl<'s> Fuzzer<'s> {
    pub fn new(
        config: &Config,
        id: usize,
        seed: u64,
        executor: Box<dyn Executor>,
        session: &'s SessionState,
    ) -> Result<Self, FuzzErr> {
        Ok(Fuzzer {
            id,
            config: config.clone(),
            generator: ProgramGenerator::new(GeneratorParams::from_config(config))?,
            input_gen: InputGenerator::new(config.entropy_bits)?
                .with_faulty_page(config.enable_faulty_page),
            model: ContractModel::from_config(config),
            executor,
            filter: ObservationFilter::from_config(config),
            session,
            stats: Stats::new(config, id),
            rng: StdRng::seed_from_u64(seed),
            violations: Vec::new(),
        })
    }

    /// Violations this worker confirmed so far
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    // Base inputs plus their boosted variants, modeled as they are made
    fn generate_inputs(
        &mut self,
        program: &TestProgram,
        seed: u64,
    ) -> Result<(Vec<Input>, Vec<ModelResult>), FuzzErr> {
        let base = time_func!(
            self,
            batch_generate,
            self.input_gen.generate(seed, self.config.num_inputs)
        );

        let per_class = self.config.inputs_per_class;
        let mut inputs = Vec::with_capacity(base.len() * per_class);
        let mut results = Vec::with_capacity(base.len() * per_class);

        for input in base {
            input.validate()?;

            let result = time_func!(self, batch_model, self.model.run(program, &input));
            let variants = time_func!(
                self,
                batch_generate,
                self.input_gen
                    .boost(&input, &result.footprint, per_class.saturating_sub(1))
            );
            inputs.push(input);
            results.push(result);

            for variant in variants {
                let result = time_func!(self, batch_model, self.model.run(program, &variant));
                inputs.push(variant);
                results.push(result);
            }
        }

        Ok((inputs, results))
    }

    // Measure every input of a class, stops at the first inconclusive one
    fn measure_class(
        &mut self,
        inputs: &[Input],
        members: &[usize],
    ) -> Result<Option<Vec<HwTrace>>, FuzzErr> {
        let primer = self.config.enable_priming.then(|| &inputs[members[0]]);

        let mut traces = Vec::with_capacity(members.len());
        for &member in members {
            let measurement = time_func!(
                self,
                batch_executor,
                self.executor.measure(&inputs[member], primer)
            )?;

            match measurement {
                Measurement::Trace(trace) => traces.push(trace),
                Measurement::Inconclusive(reason) => {
                    debug!(
                        "worker {}: input {:#x} inconclusive ({})",
                        self.id, inputs[member].seed, reason
                    );
                    SessionState::add(&self.session.inconclusive, 1);
                    return Ok(None);
                }
            }
        }

        Ok(Some(traces))
    }

    /// Test one freshly generated program
    pub fn fuzz_one(&mut self, iteration: usize) -> Result<FuzzingResult, FuzzErr> {
        let program_seed = self.rng.random::<u64>();
        let input_seed = self.rng.random::<u64>();

        let program = time_func!(self, batch_generate, self.generator.generate(program_seed))?;
        time_func!(self, batch_executor, self.executor.load_program(&program))?;

        let (inputs, results) = self.generate_inputs(&program, input_seed)?;
        self.test_program(iteration, &program, &inputs, &results)
    }

    /// Classify, measure and compare the inputs of a program that is already
    /// loaded into the executor
    fn test_program(
        &mut self,
        iteration: usize,
        program: &TestProgram,
        inputs: &[Input],
        results: &[ModelResult],
    ) -> Result<FuzzingResult, FuzzErr> {
        SessionState::add(&self.session.inputs, inputs.len());

        let classification = build_classes(results, program.layout.faulty_page);
        SessionState::add(&self.session.invalid, classification.invalid.len());

        debug!(
            "worker {}: program {:#x} ({} instructions, {} memory accesses, {} branches) has {} classes over {} inputs",
            self.id,
            program.seed,
            program.instruction_count(),
            program.mem_access_count(),
            program.branch_count(),
            classification.classes.len(),
            inputs.len()
        );

        for class in &classification.classes {
            if class.len() < 2 {
                continue;
            }

            if !keep_class(class, self.config.enable_speculation_filter) {
                SessionState::add(&self.session.spec_filtered, 1);
                continue;
            }

            let Some(traces) = self.measure_class(inputs, &class.members)? else {
                continue;
            };

            // Everyone is compared against the first member
            let Some(diverging) = traces.iter().position(|t| *t != traces[0]) else {
                continue;
            };

            let a = &inputs[class.members[0]];
            let b = &inputs[class.members[diverging]];
            let pair = (traces[0], traces[diverging]);
            let primer = self.config.enable_priming.then_some(a);

            let confirmed = time_func!(
                self,
                batch_filter,
                self.filter.confirm(self.executor.as_mut(), a, b, primer, pair)
            )?;
            if !confirmed {
                debug!(
                    "worker {}: divergence on program {:#x} did not reproduce",
                    self.id, program.seed
                );
                SessionState::add(&self.session.noise, 1);
                continue;
            }

            let minimized = if self.config.enable_minimization {
                let minimizer = Minimizer::new(
                    &self.model,
                    &self.filter,
                    self.config.minimize_max_checks,
                    self.config.enable_priming,
                );
                Some(time_func!(
                    self,
                    batch_minimize,
                    minimizer.minimize(self.executor.as_mut(), program, a, b, pair)
                )?)
            } else {
                None
            };

            return Ok(FuzzingResult::Violation(Box::new(Violation {
                contract: self.model.contract(),
                program: program.clone(),
                input_a: a.clone(),
                input_b: b.clone(),
                trace_a: pair.0,
                trace_b: pair.1,
                model_trace_len: class.trace.len(),
                minimized,
                worker: self.id,
                iteration,
            })));
        }

        Ok(FuzzingResult::Clean)
    }

    fn handle_violation(&mut self, violation: Violation) {
        self.session.record_violation();

        finding!(
            self.id,
            "Contract {} violated by program {:#x}, inputs {:#x} / {:#x}",
            violation.contract,
            violation.program.seed,
            violation.input_a.seed,
            violation.input_b.seed
        );
        finding!(self.id, "  a: {}", violation.trace_a);
        finding!(self.id, "  b: {}", violation.trace_b);

        if let Some(output_dir) = &self.config.output_dir {
            violation.save(output_dir);
        }

        if self.config.stop_on_first_violation {
            self.session.request_stop();
        }

        self.violations.push(violation);
    }

    fn timed_out(&self) -> bool {
        match self.config.timeout {
            Some(secs) => self.session.elapsed() >= Duration::from_secs(secs),
            None => false,
        }
    }

    /// Fuzz until the budget runs out, the timeout passes or someone asks us
    /// to stop. Runs are never cut short, the flags are checked in between
    pub fn fuzz_loop(&mut self) -> Result<(), FuzzErr> {
        self.stats.start_session();

        loop {
            if self.session.stop_requested() || self.timed_out() {
                break;
            }

            let Some(iteration) = self.session.claim_iteration(self.config.num_test_cases) else {
                break;
            };

            // Run the program through
            let fuzzing_result = self.fuzz_one(iteration)?;

            // Act on result
            match fuzzing_result {
                FuzzingResult::Violation(violation) => self.handle_violation(*violation),
                FuzzingResult::Clean => (),
            }

            // Update stats
            self.stats.update();

            // Check stats
            if self.stats.report_ready() {
                self.stats.report(self.session);
            }
        }

        Ok(())
    }
}
