//! Exclusive per-core execution. A `CoreLease` serializes measurements on one
//! physical core and pins the calling thread there until it is dropped

use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::err::FuzzErr;

// One lock per configured CPU, created on first use
static CORE_LOCKS: OnceLock<Vec<Mutex<()>>> = OnceLock::new();

fn core_locks() -> &'static [Mutex<()>] {
    CORE_LOCKS.get_or_init(|| {
        let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        let cpus = if cpus > 0 { cpus as usize } else { 1 };
        (0..cpus).map(|_| Mutex::new(())).collect()
    })
}

fn current_affinity() -> Result<libc::cpu_set_t, FuzzErr> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set)
    };
    if ret != 0 {
        return Err(FuzzErr::os("Failed to read CPU affinity"));
    }

    Ok(set)
}

fn set_affinity(set: &libc::cpu_set_t) -> Result<(), FuzzErr> {
    let ret = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set) };
    if ret != 0 {
        return Err(FuzzErr::os("Failed to set CPU affinity"));
    }

    Ok(())
}

/// First core the process is allowed to run on
pub fn default_core() -> Result<usize, FuzzErr> {
    let set = current_affinity()?;
    (0..core_locks().len())
        .find(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
        .ok_or_else(|| FuzzErr::executor("Process may not run on any core"))
}

pub struct CoreLease {
    previous: libc::cpu_set_t,
    _guard: MutexGuard<'static, ()>,
}

impl CoreLease {
    /// Lock `core` and pin the calling thread to it, blocks while another
    /// measurement holds the core
    pub fn acquire(core: usize) -> Result<Self, FuzzErr> {
        let lock = core_locks().get(core).ok_or_else(|| {
            FuzzErr::Executor(format!(
                "Core {} does not exist ({} configured)",
                core,
                core_locks().len()
            ))
        })?;

        // A worker that panicked mid-measurement leaves nothing to repair
        let guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = current_affinity()?;
        let mut pinned: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::CPU_ZERO(&mut pinned);
            libc::CPU_SET(core, &mut pinned);
        }
        set_affinity(&pinned)?;

        Ok(CoreLease {
            previous,
            _guard: guard,
        })
    }
}

impl Drop for CoreLease {
    fn drop(&mut self) {
        // Nothing sensible to do if this fails, the thread just stays pinned
        let _ = set_affinity(&self.previous);
    }
}

/// Disable speculative store bypass for this thread
pub fn apply_ssbp_patch() -> Result<(), FuzzErr> {
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_SPECULATION_CTRL,
            libc::PR_SPEC_STORE_BYPASS as libc::c_ulong,
            libc::PR_SPEC_DISABLE as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if ret != 0 {
        return Err(FuzzErr::os("Failed to apply the SSB mitigation"));
    }

    Ok(())
}
