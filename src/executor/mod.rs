//! Execution of test programs on the real CPU, and the `Executor` seam the
//! orchestrator drives. Every measurement is a batch of runs that gets voted
//! down to one trace per set, or declared inconclusive when the runs disagree

pub mod cpu;
pub mod fault;
pub mod harness;
pub mod sandbox;
pub mod sidechannel;
pub mod simulated;

use std::fmt;

use crate::config::{Config, ExecutorMode};
use crate::debug;
use crate::err::FuzzErr;
use crate::input::Input;
use crate::program::{SandboxLayout, TestProgram, L1D_SETS};
use self::cpu::{apply_ssbp_patch, CoreLease};
use self::fault::FaultWindow;
use self::harness::{register_block, Entry, ENTRY_OFFSET};
use self::sandbox::{CodePage, Sandbox};
use self::sidechannel::{CacheGeometry, FlushReload, PrimeProbe, SideChannel};

/// What one run on the hardware showed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HwTrace {
    /// Bit `n` set when L1D set `n` was touched
    pub sets: u64,
    pub faulted: bool,
}

impl fmt::Display for HwTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // One character per set, set 0 first
        for set in 0..L1D_SETS {
            let c = if self.sets & (1 << set) != 0 { '^' } else { '.' };
            write!(f, "{}", c)?;
        }
        if self.faulted {
            write!(f, " (faulted)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Measurement {
    Trace(HwTrace),

    /// The runs disagreed too much to call, with the reason why
    Inconclusive(String),
}

/// Vote a batch of runs down to one trace. A set counts when the majority of
/// runs saw it; a set whose frequency lies strictly inside the band
/// `(ambiguity, 1 - ambiguity)` makes the whole measurement inconclusive
pub fn summarize(samples: &[HwTrace], ambiguity: f64) -> Measurement {
    if samples.is_empty() {
        return Measurement::Inconclusive("no samples".to_string());
    }

    let runs = samples.len() as f64;
    let ambiguous = |freq: f64| freq > ambiguity && freq < 1.0 - ambiguity;

    let mut sets = 0u64;
    for set in 0..L1D_SETS {
        let hits = samples.iter().filter(|s| s.sets & (1 << set) != 0).count();
        let freq = hits as f64 / runs;
        if ambiguous(freq) {
            return Measurement::Inconclusive(format!(
                "set {} seen in {:.0}% of runs",
                set,
                freq * 100.0
            ));
        }
        if freq >= 0.5 {
            sets |= 1 << set;
        }
    }

    let faults = samples.iter().filter(|s| s.faulted).count();
    let freq = faults as f64 / runs;
    if ambiguous(freq) {
        return Measurement::Inconclusive(format!(
            "faulted in {:.0}% of runs",
            freq * 100.0
        ));
    }

    Measurement::Trace(HwTrace {
        sets,
        faulted: freq >= 0.5,
    })
}

pub trait Executor {
    fn name(&self) -> &'static str;

    /// Make `program` the program future measurements run
    fn load_program(&mut self, program: &TestProgram) -> Result<(), FuzzErr>;

    /// Measure one input. With a primer, every measured run is preceded by
    /// a run on the primer input
    fn measure(&mut self, input: &Input, primer: Option<&Input>) -> Result<Measurement, FuzzErr>;
}

/// Executor settings, a slice of the session config
#[derive(Debug, Clone)]
pub struct ExecutorParams {
    pub mode: ExecutorMode,
    pub core: usize,
    pub layout: SandboxLayout,
    pub warmups: usize,
    pub repetitions: usize,
    pub ambiguity: f64,
    pub ssbp_patch: bool,
}

impl ExecutorParams {
    pub fn from_config(config: &Config, core: usize) -> Self {
        ExecutorParams {
            mode: config.executor_mode,
            core,
            layout: SandboxLayout::new(config.enable_faulty_page),
            warmups: config.executor_warmups,
            repetitions: config.executor_repetitions,
            ambiguity: config.executor_ambiguity,
            ssbp_patch: config.x86_executor_enable_ssbp_patch,
        }
    }
}

pub struct HardwareExecutor {
    params: ExecutorParams,
    sandbox: Sandbox,
    code: CodePage,
    channel: Box<dyn SideChannel>,
    entry: Option<Entry>,
}

impl HardwareExecutor {
    pub fn new(params: ExecutorParams) -> Result<Self, FuzzErr> {
        fault::install()?;

        let sandbox = Sandbox::new(params.layout)?;
        let code = CodePage::new()?;

        let channel: Box<dyn SideChannel> = match params.mode {
            ExecutorMode::PrimeProbe => {
                let geometry = CacheGeometry::detect(params.core)?;
                debug!(
                    "Core {} L1D: {} ways x {} sets",
                    params.core, geometry.ways, geometry.sets
                );
                Box::new(PrimeProbe::new(geometry)?)
            }
            ExecutorMode::FlushReload => Box::new(FlushReload::new(sandbox.base())),
            ExecutorMode::Simulated => {
                return Err(FuzzErr::executor(
                    "The simulated mode has no hardware executor",
                ))
            }
        };

        let mut executor = HardwareExecutor {
            params,
            sandbox,
            code,
            channel,
            entry: None,
        };

        // Thresholds are per core, learn them where we will measure
        {
            let _lease = CoreLease::acquire(executor.params.core)?;
            executor.channel.calibrate()?;
        }

        Ok(executor)
    }

    /// Run the loaded code on whatever is in the sandbox, true if it faulted
    fn invoke(&mut self, input: &Input) -> Result<bool, FuzzErr> {
        let entry = self
            .entry
            .ok_or_else(|| FuzzErr::executor("No program loaded"))?;
        let regs = register_block(input);
        let (start, end) = self.code.range();

        let window = FaultWindow::arm(start, end, start);
        entry(self.sandbox.base(), regs.as_ptr());
        Ok(window.faulted())
    }

    /// One measured run: prime, measure
    fn run_once(&mut self, input: &Input, primer: Option<&Input>) -> Result<HwTrace, FuzzErr> {
        if self.params.ssbp_patch {
            apply_ssbp_patch()?;
        }

        if let Some(primer) = primer {
            self.sandbox.load(primer);
            self.invoke(primer)?;
        }

        self.sandbox.load(input);
        self.channel.prepare();
        let faulted = self.invoke(input)?;
        let sets = self.channel.collect();

        Ok(HwTrace { sets, faulted })
    }
}

impl Executor for HardwareExecutor {
    fn name(&self) -> &'static str {
        self.params.mode.name()
    }

    fn load_program(&mut self, program: &TestProgram) -> Result<(), FuzzErr> {
        let image = harness::build(self.code.addr(), program)?;
        self.code.install(&image)?;

        // The code page holds freshly assembled entry code at a fixed offset
        self.entry = Some(unsafe {
            std::mem::transmute::<u64, Entry>(self.code.addr() + ENTRY_OFFSET)
        });

        Ok(())
    }

    fn measure(&mut self, input: &Input, primer: Option<&Input>) -> Result<Measurement, FuzzErr> {
        let _lease = CoreLease::acquire(self.params.core)?;

        for _ in 0..self.params.warmups {
            self.run_once(input, primer)?;
        }

        let mut samples = Vec::with_capacity(self.params.repetitions);
        for _ in 0..self.params.repetitions {
            samples.push(self.run_once(input, primer)?);
        }

        // A fault the layout does not allow says nothing about leakage
        if !self.params.layout.faulty_page && samples.iter().any(|s| s.faulted) {
            return Ok(Measurement::Inconclusive(
                "unexpected fault without the faulty page".to_string(),
            ));
        }

        Ok(summarize(&samples, self.params.ambiguity))
    }
}

/// Build the executor the config asks for
pub fn create(config: &Config, core: usize, seed: u64) -> Result<Box<dyn Executor>, FuzzErr> {
    let params = ExecutorParams::from_config(config, core);
    match params.mode {
        ExecutorMode::Simulated => Ok(Box::new(
            simulated::SimulatedExecutor::new(
                config.sim_execution,
                params.layout,
                config.model_max_spec_window,
                config.sim_jitter,
                seed,
            )
            .with_repetitions(params.warmups, params.repetitions, params.ambiguity),
        )),
        _ => Ok(Box::new(HardwareExecutor::new(params)?)),
    }
}
