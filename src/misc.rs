/// This file contains miscellaneous helper functions, the console logging
/// macros and thin wrappers around the x86 intrinsics the executor needs

use core::arch::x86_64::{_mm_clflush, _mm_lfence, _mm_mfence, _rdtsc};
use std::sync::atomic::{AtomicU8, Ordering};

/// Logging modes, kept as a bitmask so `--log info,debug` is just an OR
pub const LOG_INFO: u8 = 1 << 0;
pub const LOG_STAT: u8 = 1 << 1;
pub const LOG_DEBUG: u8 = 1 << 2;

// Info is on until the config says otherwise
static LOG_MODES: AtomicU8 = AtomicU8::new(LOG_INFO);

pub fn set_log_modes(modes: u8) {
    LOG_MODES.store(modes, Ordering::Relaxed);
}

#[inline]
pub fn log_enabled(mode: u8) -> bool {
    LOG_MODES.load(Ordering::Relaxed) & mode != 0
}

#[macro_export]
macro_rules! prompt {
    () => ({
        if $crate::misc::log_enabled($crate::misc::LOG_INFO) {
            print!("\x1b[1;35m\u{2726}probefuzz\u{2726}\x1b[0m\n");
        }
    });
    ($($arg:tt)*) => ({
        if $crate::misc::log_enabled($crate::misc::LOG_INFO) {
            print!("\x1b[1;35m\u{2726}probefuzz\u{2726}\x1b[0m ");
            println!($($arg)*);
        }
    });
}

#[macro_export]
macro_rules! prompt_warn {
    () => ({
        print!("\x1b[1;33m\u{2726}probefuzz\u{2726}\x1b[0m\n");
    });
    ($($arg:tt)*) => ({
        print!("\x1b[1;33m\u{2726}probefuzz\u{2726}\x1b[0m ");
        println!($($arg)*);
    });
}

// Findings are always printed, tagged with the worker that made them
#[macro_export]
macro_rules! finding {
    ($id:expr, $($arg:tt)*) => ({
        print!("\x1b[1;32m\u{2726}worker-{}\u{2726}\x1b[0m ", $id);
        println!($($arg)*);
    });
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ({
        if $crate::misc::log_enabled($crate::misc::LOG_DEBUG) {
            print!("\x1b[1;34m\u{2726}debug\u{2726}\x1b[0m ");
            println!($($arg)*);
        }
    });
}

#[macro_export]
macro_rules! fatal {
    ($err:expr) => {
        {
            print!("\n\x1b[1;31mfatal:\x1b[0m ");
            $err.display();
            std::process::exit(-1);
        }
    };
}

/// Parse a comma separated list of log modes, e.g. "info,stat"
pub fn parse_log_modes(list: &str) -> Option<u8> {
    let mut modes = 0;
    for mode in list.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        modes |= match mode {
            "info" => LOG_INFO,
            "stat" => LOG_STAT,
            "debug" => LOG_DEBUG,
            _ => return None,
        };
    }

    Some(modes)
}

/// Seed for sessions that were not given one
pub fn generate_seed() -> u64 {
    rdtsc()
}

// Wrappers for these unsafe functions to tuck unsafes away
#[inline(always)]
pub fn rdtsc() -> u64 {
    unsafe { _rdtsc() }
}

#[inline(always)]
pub fn lfence() {
    unsafe { _mm_lfence() }
}

#[inline(always)]
pub fn mfence() {
    unsafe { _mm_mfence() }
}

#[inline(always)]
pub fn clflush(addr: *const u8) {
    unsafe { _mm_clflush(addr) }
}

/// Serialized timestamp read, fenced on both sides so the measured loads
/// cannot drift across it
#[inline(always)]
pub fn fenced_rdtsc() -> u64 {
    mfence();
    lfence();
    let t = rdtsc();
    lfence();
    t
}
