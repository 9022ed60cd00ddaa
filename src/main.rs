/// This file contains the `main` program logic: parse the config, set up the
/// shared session and run one fuzzer per worker thread until the session ends

mod assembler;
mod classify;
mod config;
mod err;
mod executor;
mod filter;
mod fuzzer;
mod generator;
mod input;
mod isa;
mod minimize;
mod misc;
mod model;
mod program;
mod report;
mod stats;

use std::sync::Arc;

use config::parse_args;
use err::FuzzErr;
use executor::cpu::default_core;
use fuzzer::Fuzzer;
use misc::{generate_seed, set_log_modes};
use stats::SessionState;

fn main() {
    // Parse and validate everything up front
    let config = parse_args().unwrap_or_else(|error| {
        fatal!(error);
    });
    set_log_modes(config.log_modes);

    let seed = config.seed.unwrap_or_else(generate_seed);
    prompt!("Session seed: 0x{:X}", seed);
    prompt!("Contract: {}", config.contract);
    prompt!(
        "Executor: {} ({} warmups, {} repetitions)",
        config.executor_mode.name(),
        config.executor_warmups,
        config.executor_repetitions
    );

    let base_core = match config.executor_core {
        Some(core) => core,
        None => default_core().unwrap_or_else(|error| {
            fatal!(error);
        }),
    };
    prompt!("Workers: {} starting at core {}", config.workers, base_core);

    let session = Arc::new(SessionState::new(config.workers));

    // Ctrl-C only raises the flag, workers finish their current program
    {
        let session = Arc::clone(&session);
        ctrlc::set_handler(move || {
            session.request_stop();
        })
        .unwrap_or_else(|error| {
            fatal!(FuzzErr::Config(format!("Unable to install Ctrl-C handler: {}", error)));
        });
    }

    prompt!("Starting fuzzer...");
    let results: Vec<Result<usize, FuzzErr>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..config.workers)
            .map(|id| {
                let config = &config;
                let session = &*session;
                scope.spawn(move || {
                    let run = || -> Result<usize, FuzzErr> {
                        let worker_seed = seed.wrapping_add(id as u64);
                        let executor = executor::create(config, base_core + id, worker_seed)?;
                        prompt!(
                            "Worker {} measuring with {} on core {}",
                            id,
                            executor.name(),
                            base_core + id
                        );
                        let mut fuzzer = Fuzzer::new(config, id, worker_seed, executor, session)?;
                        fuzzer.fuzz_loop()?;
                        Ok(fuzzer.violations().len())
                    };

                    // One worker failing ends the session for everyone
                    let result = run();
                    if result.is_err() {
                        session.request_stop();
                    }
                    result
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(FuzzErr::executor("Worker thread panicked")))
            })
            .collect()
    });

    // Campaign over, report no matter how we got here
    session.print_summary();

    for result in results {
        if let Err(error) = result {
            fatal!(error);
        }
    }

    prompt!("Campaign finished");
}
