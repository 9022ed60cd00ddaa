/// This file contains all of the logic necessary to formulate a coherent
/// Config data structure that every worker gets a copy of. We use the `clap`
/// crate and parse args here, then fold everything into one validated Config
use std::str::FromStr;

use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::err::FuzzErr;
use crate::isa::Category;
use crate::misc::{parse_log_modes, LOG_INFO};
use crate::model::{Contract, ExecutionClause, ObservationClause};

// Seconds between stat reports unless told otherwise
const DEFAULT_STAT_INTERVAL: u64 = 2;

/// How hardware traces are collected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorMode {
    PrimeProbe,
    FlushReload,
    Simulated,
}

impl ExecutorMode {
    pub fn name(self) -> &'static str {
        match self {
            ExecutorMode::PrimeProbe => "P+P",
            ExecutorMode::FlushReload => "F+R",
            ExecutorMode::Simulated => "sim",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            ExecutorMode::PrimeProbe,
            ExecutorMode::FlushReload,
            ExecutorMode::Simulated,
        ]
        .into_iter()
        .find(|mode| mode.name().eq_ignore_ascii_case(name))
    }
}

// Everything that can be configured for a session
#[derive(Debug, Clone)]
pub struct Config {
    pub contract: Contract,
    pub executor_mode: ExecutorMode,
    pub x86_executor_enable_ssbp_patch: bool,
    pub enable_faulty_page: bool,
    pub enable_priming: bool,
    pub enable_speculation_filter: bool,
    pub enable_observation_filter: bool,

    // Program shape
    pub program_size: usize,
    pub min_bb_per_function: usize,
    pub max_bb_per_function: usize,
    pub avg_mem_accesses: f64,
    pub instruction_categories: Vec<Category>,

    // Inputs
    pub entropy_bits: u32,
    pub num_inputs: usize,
    pub inputs_per_class: usize,

    // Session bounds
    pub num_test_cases: usize,
    pub timeout: Option<u64>,
    pub stop_on_first_violation: bool,
    pub seed: Option<u64>,

    // Model
    pub model_max_spec_window: usize,
    pub model_max_nesting: usize,

    // Executor
    pub executor_repetitions: usize,
    pub executor_warmups: usize,
    pub executor_ambiguity: f64,
    pub observation_filter_repetitions: usize,
    pub executor_core: Option<usize>,
    pub workers: usize,
    pub sim_execution: ExecutionClause,
    pub sim_jitter: f64,

    // Minimization
    pub enable_minimization: bool,
    pub minimize_max_checks: usize,

    // Reporting
    pub output_dir: Option<String>,
    pub log_modes: u8,
    pub stat_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            contract: Contract {
                observation: ObservationClause::Ct,
                execution: ExecutionClause::Cond,
            },
            executor_mode: ExecutorMode::PrimeProbe,
            x86_executor_enable_ssbp_patch: false,
            enable_faulty_page: false,
            enable_priming: true,
            enable_speculation_filter: true,
            enable_observation_filter: true,
            program_size: 24,
            min_bb_per_function: 1,
            max_bb_per_function: 3,
            avg_mem_accesses: 8.0,
            instruction_categories: Category::ALL.to_vec(),
            entropy_bits: 3,
            num_inputs: 25,
            inputs_per_class: 2,
            num_test_cases: 1000,
            timeout: None,
            stop_on_first_violation: false,
            seed: None,
            model_max_spec_window: 250,
            model_max_nesting: 1,
            executor_repetitions: 10,
            executor_warmups: 2,
            executor_ambiguity: 0.2,
            observation_filter_repetitions: 5,
            executor_core: None,
            workers: 1,
            sim_execution: ExecutionClause::CondBpas,
            sim_jitter: 0.0,
            enable_minimization: true,
            minimize_max_checks: 200,
            output_dir: None,
            log_modes: LOG_INFO,
            stat_interval: DEFAULT_STAT_INTERVAL,
        }
    }
}

impl Config {
    /// Reject configurations no session could run with
    pub fn validate(&self) -> Result<(), FuzzErr> {
        if self.contract.execution.needs_faulty_page() && !self.enable_faulty_page {
            return Err(FuzzErr::Config(format!(
                "The {} clause needs --faulty-page",
                self.contract.execution.name()
            )));
        }

        if self.program_size == 0 {
            return Err(FuzzErr::config("Program size must be at least 1"));
        }

        if self.min_bb_per_function == 0 || self.min_bb_per_function > self.max_bb_per_function {
            return Err(FuzzErr::Config(format!(
                "Basic block bounds {}..={} are empty",
                self.min_bb_per_function, self.max_bb_per_function
            )));
        }

        if !(0.0..=self.program_size as f64).contains(&self.avg_mem_accesses) {
            return Err(FuzzErr::Config(format!(
                "Average memory accesses {} outside 0..={}",
                self.avg_mem_accesses, self.program_size
            )));
        }

        if !self.instruction_categories.iter().any(|c| c.is_body()) {
            return Err(FuzzErr::config(
                "Instruction categories must include a non-branch category",
            ));
        }

        if self.entropy_bits == 0 || self.entropy_bits > 58 {
            return Err(FuzzErr::Config(format!(
                "Entropy bits {} outside 1..=58",
                self.entropy_bits
            )));
        }

        if self.num_inputs == 0 || self.inputs_per_class == 0 {
            return Err(FuzzErr::config("Need at least one input and one input per class"));
        }

        if self.executor_repetitions == 0 || self.observation_filter_repetitions == 0 {
            return Err(FuzzErr::config("Repetition counts must be at least 1"));
        }

        if !(0.0..0.5).contains(&self.executor_ambiguity) {
            return Err(FuzzErr::Config(format!(
                "Ambiguity band {} outside [0, 0.5)",
                self.executor_ambiguity
            )));
        }

        if !(0.0..=1.0).contains(&self.sim_jitter) {
            return Err(FuzzErr::config("Simulated jitter is a probability"));
        }

        if self.workers == 0 {
            return Err(FuzzErr::config("Need at least one worker"));
        }

        if self.stat_interval == 0 {
            return Err(FuzzErr::config("Stat interval must be at least 1 second"));
        }

        Ok(())
    }
}

fn command() -> Command {
    Command::new("probefuzz")
    .version("0.1.0")
    .about("Contract-based microarchitectural leakage fuzzer for x86-64")
    .arg(Arg::new("contract-observation")
        .long("contract-observation")
        .value_name("CLAUSE")
        .help("Observation clause: l1d, mem, ct, ctr, arch (ct default)"))
    .arg(Arg::new("contract-execution")
        .long("contract-execution")
        .value_name("CLAUSE")
        .help("Execution clause: seq, cond, bpas, cond-bpas, null-injection, delayed-exception-handling (cond default)"))
    .arg(Arg::new("executor")
        .long("executor")
        .value_name("MODE")
        .help("Measurement technique: P+P, F+R or sim (P+P default)"))
    .arg(Arg::new("ssbp-patch")
        .long("ssbp-patch")
        .help("Disable speculative store bypass before every measurement")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("faulty-page")
        .long("faulty-page")
        .help("Make the page after the sandbox fault on access")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("no-priming")
        .long("no-priming")
        .help("Skip the priming run before measurements")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("no-speculation-filter")
        .long("no-speculation-filter")
        .help("Measure classes even if the model saw no speculation")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("no-observation-filter")
        .long("no-observation-filter")
        .help("Accept divergences without re-measuring them")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("program-size")
        .long("program-size")
        .value_name("COUNT")
        .help("Instructions per test program (24 default)"))
    .arg(Arg::new("min-bb")
        .long("min-bb")
        .value_name("COUNT")
        .help("Minimum basic blocks per program (1 default)"))
    .arg(Arg::new("max-bb")
        .long("max-bb")
        .value_name("COUNT")
        .help("Maximum basic blocks per program (3 default)"))
    .arg(Arg::new("avg-mem-accesses")
        .long("avg-mem-accesses")
        .value_name("COUNT")
        .help("Average memory accesses per program (8 default)"))
    .arg(Arg::new("categories")
        .long("categories")
        .value_name("LIST")
        .help("Comma separated instruction categories (all by default)"))
    .arg(Arg::new("entropy-bits")
        .long("entropy-bits")
        .value_name("BITS")
        .help("Random bits per input value (3 default)"))
    .arg(Arg::new("inputs")
        .long("inputs")
        .value_name("COUNT")
        .help("Base inputs per program (25 default)"))
    .arg(Arg::new("inputs-per-class")
        .long("inputs-per-class")
        .value_name("COUNT")
        .help("Inputs derived from each base input (2 default)"))
    .arg(Arg::new("num-test-cases")
        .long("num-test-cases")
        .value_name("COUNT")
        .help("Programs to test before stopping (1000 default)"))
    .arg(Arg::new("timeout")
        .long("timeout")
        .value_name("SECONDS")
        .help("Stop the session after this many seconds"))
    .arg(Arg::new("stop-on-first")
        .long("stop-on-first")
        .help("Stop at the first confirmed violation")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("seed")
        .long("seed")
        .value_name("SEED")
        .help("Session seed, random when not given"))
    .arg(Arg::new("spec-window")
        .long("spec-window")
        .value_name("COUNT")
        .help("Speculation window of the model in instructions (250 default)"))
    .arg(Arg::new("nesting")
        .long("nesting")
        .value_name("DEPTH")
        .help("Maximum nested mispredictions the model explores (1 default)"))
    .arg(Arg::new("repetitions")
        .long("repetitions")
        .value_name("COUNT")
        .help("Recorded runs per measurement (10 default)"))
    .arg(Arg::new("warmups")
        .long("warmups")
        .value_name("COUNT")
        .help("Discarded runs before each measurement (2 default)"))
    .arg(Arg::new("ambiguity")
        .long("ambiguity")
        .value_name("FRACTION")
        .help("Width of the band that makes a set inconclusive (0.2 default)"))
    .arg(Arg::new("filter-repetitions")
        .long("filter-repetitions")
        .value_name("COUNT")
        .help("Re-measurements before a divergence is confirmed (5 default)"))
    .arg(Arg::new("core")
        .long("core")
        .value_name("CORE")
        .help("Core the first worker measures on (first allowed core default)"))
    .arg(Arg::new("workers")
        .long("workers")
        .value_name("COUNT")
        .help("Parallel workers, each on its own core (1 default)"))
    .arg(Arg::new("sim-clause")
        .long("sim-clause")
        .value_name("CLAUSE")
        .help("Execution clause the simulated CPU follows (cond-bpas default)"))
    .arg(Arg::new("sim-jitter")
        .long("sim-jitter")
        .value_name("PROBABILITY")
        .help("Chance per simulated run of one flipped set (0 default)"))
    .arg(Arg::new("no-minimize")
        .long("no-minimize")
        .help("Report violations without minimizing them")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("minimize-checks")
        .long("minimize-checks")
        .value_name("COUNT")
        .help("Candidates the minimizer may try (200 default)"))
    .arg(Arg::new("output-dir")
        .long("output-dir")
        .value_name("OUTPUT_DIR")
        .help("Directory to store violation reports"))
    .arg(Arg::new("log")
        .long("log")
        .value_name("MODES")
        .help("Comma separated log modes: info, stat, debug (info default)"))
    .arg(Arg::new("stat-interval")
        .long("stat-interval")
        .value_name("INTERVAL")
        .help("Number of seconds we wait in between stat reports (2 default)"))
}

// Parse an optional numeric argument
fn parse_opt<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, FuzzErr> {
    match matches.get_one::<String>(name) {
        None => Ok(None),
        Some(str_repr) => {
            let Ok(value) = str_repr.trim().parse::<T>() else {
                return Err(FuzzErr::Config(format!("Invalid --{} value '{}'", name, str_repr)));
            };

            Ok(Some(value))
        }
    }
}

fn parse_or<T: FromStr>(matches: &ArgMatches, name: &str, default: T) -> Result<T, FuzzErr> {
    Ok(parse_opt(matches, name)?.unwrap_or(default))
}

// Seeds can be given in hex, that is how reports print them
fn parse_seed(matches: &ArgMatches) -> Result<Option<u64>, FuzzErr> {
    let Some(str_repr) = matches.get_one::<String>("seed") else {
        return Ok(None);
    };

    let parsed = match str_repr.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => str_repr.parse::<u64>(),
    };
    let Ok(seed) = parsed else {
        return Err(FuzzErr::Config(format!("Invalid --seed value '{}'", str_repr)));
    };

    Ok(Some(seed))
}

fn from_matches(matches: &ArgMatches) -> Result<Config, FuzzErr> {
    let defaults = Config::default();

    // Contract clauses
    let observation = match matches.get_one::<String>("contract-observation") {
        None => defaults.contract.observation,
        Some(name) => ObservationClause::from_name(name)
            .ok_or_else(|| FuzzErr::Config(format!("Unknown observation clause '{}'", name)))?,
    };
    let execution = match matches.get_one::<String>("contract-execution") {
        None => defaults.contract.execution,
        Some(name) => ExecutionClause::from_name(name)
            .ok_or_else(|| FuzzErr::Config(format!("Unknown execution clause '{}'", name)))?,
    };
    let sim_execution = match matches.get_one::<String>("sim-clause") {
        None => defaults.sim_execution,
        Some(name) => ExecutionClause::from_name(name)
            .ok_or_else(|| FuzzErr::Config(format!("Unknown execution clause '{}'", name)))?,
    };

    let executor_mode = match matches.get_one::<String>("executor") {
        None => defaults.executor_mode,
        Some(name) => ExecutorMode::from_name(name)
            .ok_or_else(|| FuzzErr::Config(format!("Unknown executor '{}'", name)))?,
    };

    let instruction_categories = match matches.get_one::<String>("categories") {
        None => defaults.instruction_categories.clone(),
        Some(list) => {
            let mut categories = Vec::new();
            for name in list.split(',').filter(|n| !n.trim().is_empty()) {
                let Some(category) = Category::from_name(name) else {
                    return Err(FuzzErr::Config(format!("Unknown category '{}'", name)));
                };
                if !categories.contains(&category) {
                    categories.push(category);
                }
            }
            categories
        }
    };

    let log_modes = match matches.get_one::<String>("log") {
        None => defaults.log_modes,
        Some(list) => parse_log_modes(list)
            .ok_or_else(|| FuzzErr::Config(format!("Unknown log mode in '{}'", list)))?,
    };

    let config = Config {
        contract: Contract {
            observation,
            execution,
        },
        executor_mode,
        x86_executor_enable_ssbp_patch: matches.get_flag("ssbp-patch"),
        enable_faulty_page: matches.get_flag("faulty-page"),
        enable_priming: !matches.get_flag("no-priming"),
        enable_speculation_filter: !matches.get_flag("no-speculation-filter"),
        enable_observation_filter: !matches.get_flag("no-observation-filter"),
        program_size: parse_or(matches, "program-size", defaults.program_size)?,
        min_bb_per_function: parse_or(matches, "min-bb", defaults.min_bb_per_function)?,
        max_bb_per_function: parse_or(matches, "max-bb", defaults.max_bb_per_function)?,
        avg_mem_accesses: parse_or(matches, "avg-mem-accesses", defaults.avg_mem_accesses)?,
        instruction_categories,
        entropy_bits: parse_or(matches, "entropy-bits", defaults.entropy_bits)?,
        num_inputs: parse_or(matches, "inputs", defaults.num_inputs)?,
        inputs_per_class: parse_or(matches, "inputs-per-class", defaults.inputs_per_class)?,
        num_test_cases: parse_or(matches, "num-test-cases", defaults.num_test_cases)?,
        timeout: parse_opt(matches, "timeout")?,
        stop_on_first_violation: matches.get_flag("stop-on-first"),
        seed: parse_seed(matches)?,
        model_max_spec_window: parse_or(matches, "spec-window", defaults.model_max_spec_window)?,
        model_max_nesting: parse_or(matches, "nesting", defaults.model_max_nesting)?,
        executor_repetitions: parse_or(matches, "repetitions", defaults.executor_repetitions)?,
        executor_warmups: parse_or(matches, "warmups", defaults.executor_warmups)?,
        executor_ambiguity: parse_or(matches, "ambiguity", defaults.executor_ambiguity)?,
        observation_filter_repetitions: parse_or(
            matches,
            "filter-repetitions",
            defaults.observation_filter_repetitions,
        )?,
        executor_core: parse_opt(matches, "core")?,
        workers: parse_or(matches, "workers", defaults.workers)?,
        sim_execution,
        sim_jitter: parse_or(matches, "sim-jitter", defaults.sim_jitter)?,
        enable_minimization: !matches.get_flag("no-minimize"),
        minimize_max_checks: parse_or(matches, "minimize-checks", defaults.minimize_max_checks)?,
        output_dir: matches.get_one::<String>("output-dir").cloned(),
        log_modes,
        stat_interval: parse_or(matches, "stat-interval", defaults.stat_interval)?,
    };

    config.validate()?;
    Ok(config)
}

pub fn parse_args() -> Result<Config, FuzzErr> {
    from_matches(&command().get_matches())
}
