/// This file contains the fault handling for test code. Faults raised while
/// a test program runs are expected (the faulty page, mostly) and must never
/// take the session down, so SIGSEGV/SIGBUS get a handler that checks whether
/// the faulting RIP lies inside the armed code window. If it does, RIP is
/// moved to the harness epilogue and the run is flagged. Any other fault is
/// a real bug: the handler falls back to the default action
use std::cell::Cell;
use std::sync::Once;

use crate::err::FuzzErr;

// Nothing armed
const DISARMED: (u64, u64, u64) = (0, 0, 0);

thread_local! {
    // (start, end, recovery RIP) of the currently running test code
    static WINDOW: Cell<(u64, u64, u64)> = const { Cell::new(DISARMED) };

    // Set by the handler when it redirected a fault
    static FAULTED: Cell<bool> = const { Cell::new(false) };
}

static INSTALL: Once = Once::new();

type FaultHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

extern "C" fn handle_fault(sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let uc = ctx as *mut libc::ucontext_t;

    // Where did we fault?
    let rip = unsafe { (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] } as u64;
    let (start, end, recovery) = WINDOW.with(|w| w.get());

    if (start..end).contains(&rip) {
        // Resume in the epilogue, the stack is as the body left it
        unsafe {
            (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] = recovery as libc::greg_t;
        }
        FAULTED.with(|f| f.set(true));
        return;
    }

    // Not ours, re-executing the instruction crashes with the default action
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

/// Install the handler for the whole process, only the first call does work
pub fn install() -> Result<(), FuzzErr> {
    let mut result = Ok(());

    INSTALL.call_once(|| {
        for sig in [libc::SIGSEGV, libc::SIGBUS] {
            let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
            action.sa_sigaction = handle_fault as FaultHandler as usize;
            action.sa_flags = libc::SA_SIGINFO;

            let ret = unsafe {
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(sig, &action, std::ptr::null_mut())
            };

            if ret != 0 {
                result = Err(FuzzErr::os("Failed to install fault handler"));
                return;
            }
        }
    });

    result
}

/// Armed fault window, disarmed on drop
pub struct FaultWindow {
    _private: (),
}

impl FaultWindow {
    pub fn arm(start: u64, end: u64, recovery: u64) -> Self {
        FAULTED.with(|f| f.set(false));
        WINDOW.with(|w| w.set((start, end, recovery)));
        FaultWindow { _private: () }
    }

    /// Did the test code fault since the window was armed
    pub fn faulted(&self) -> bool {
        FAULTED.with(|f| f.get())
    }
}

impl Drop for FaultWindow {
    fn drop(&mut self) {
        WINDOW.with(|w| w.set(DISARMED));
    }
}
