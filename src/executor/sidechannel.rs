//! Cache side channels the hardware executor can measure through. Both report
//! a bitmap of L1D sets, bit `n` meaning the program touched set `n`

use std::path::Path;
use std::ptr::read_volatile;

use crate::err::FuzzErr;
use crate::executor::sandbox::{Region, PAGE_SIZE};
use crate::misc::{clflush, fenced_rdtsc};
use crate::program::{CACHE_LINE_SIZE, L1D_SETS, MAIN_REGION_SIZE};

// Rounds used to learn the probe baseline
const CALIBRATION_ROUNDS: usize = 64;

// Extra cycles over the baseline before a probe counts as a miss
const PROBE_MARGIN: u64 = 30;

// Sanity bound on what sysfs or sysconf may claim
const MAX_WAYS: usize = 32;

pub trait SideChannel {
    /// Learn timing thresholds, run once on the pinned core
    fn calibrate(&mut self) -> Result<(), FuzzErr>;

    /// Put the cache into the known state right before the program runs
    fn prepare(&mut self);

    /// Read back which sets the program touched
    fn collect(&mut self) -> u64;
}

#[inline(always)]
fn touch(ptr: *const u8) {
    unsafe {
        read_volatile(ptr);
    }
}

fn median(samples: &mut [u64]) -> u64 {
    samples.sort_unstable();
    samples[samples.len() / 2]
}

/// Shape of the L1D on the measuring core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    pub ways: usize,
    pub sets: usize,
}

impl CacheGeometry {
    /// L1D of `core`, from sysfs when it is there and sysconf otherwise
    pub fn detect(core: usize) -> Result<Self, FuzzErr> {
        let dir = format!("/sys/devices/system/cpu/cpu{}/cache", core);
        let geometry = match Self::from_sysfs(Path::new(&dir)) {
            Some(geometry) => geometry,
            None => Self::from_sysconf()?,
        };

        geometry.check()
    }

    // Walk `index*` until the level 1 data cache shows up
    fn from_sysfs(dir: &Path) -> Option<Self> {
        fn read(index: &Path, name: &str) -> Option<String> {
            std::fs::read_to_string(index.join(name))
                .ok()
                .map(|value| value.trim().to_string())
        }

        let mut idx = 0;
        loop {
            let index = dir.join(format!("index{}", idx));
            if !index.is_dir() {
                return None;
            }

            if read(&index, "level")? == "1" && read(&index, "type")? == "Data" {
                let ways = read(&index, "ways_of_associativity")?.parse().ok()?;
                let sets = read(&index, "number_of_sets")?.parse().ok()?;
                return Some(CacheGeometry { ways, sets });
            }

            idx += 1;
        }
    }

    fn from_sysconf() -> Result<Self, FuzzErr> {
        let (size, ways, line) = unsafe {
            (
                libc::sysconf(libc::_SC_LEVEL1_DCACHE_SIZE),
                libc::sysconf(libc::_SC_LEVEL1_DCACHE_ASSOC),
                libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE),
            )
        };
        if size <= 0 || ways <= 0 || line <= 0 {
            return Err(FuzzErr::executor("Unable to read the L1D geometry"));
        }

        Ok(CacheGeometry {
            ways: ways as usize,
            sets: size as usize / (ways as usize * line as usize),
        })
    }

    /// The eviction buffer maps line `set` of each page to L1D set `set`,
    /// which only holds for the set count the sandbox was laid out for
    pub fn check(self) -> Result<Self, FuzzErr> {
        if self.sets != L1D_SETS {
            return Err(FuzzErr::Executor(format!(
                "Prime+Probe needs a {}-set L1D, this core has {} sets",
                L1D_SETS, self.sets
            )));
        }
        if self.ways == 0 || self.ways > MAX_WAYS {
            return Err(FuzzErr::Executor(format!(
                "Unsupported L1D associativity: {} ways",
                self.ways
            )));
        }

        Ok(self)
    }
}

/// Prime+Probe over an eviction buffer with one page per way, so line `set`
/// of every page maps to L1D set `set`. One more page past the last way is
/// the victim calibration touches
pub struct PrimeProbe {
    buffer: Region,
    ways: usize,
    thresholds: [u64; L1D_SETS],
}

impl PrimeProbe {
    pub fn new(geometry: CacheGeometry) -> Result<Self, FuzzErr> {
        let geometry = geometry.check()?;
        let buffer = Region::map(
            PAGE_SIZE * (geometry.ways + 1),
            libc::PROT_READ | libc::PROT_WRITE,
        )?;

        // Fault the buffer in so no page walk lands inside a probe
        unsafe {
            std::ptr::write_bytes(buffer.as_mut_ptr(), 0x41, buffer.len());
        }

        Ok(PrimeProbe {
            buffer,
            ways: geometry.ways,
            thresholds: [u64::MAX; L1D_SETS],
        })
    }

    #[inline(always)]
    fn line(&self, way: usize, set: usize) -> *const u8 {
        unsafe { self.buffer.as_mut_ptr().add(way * PAGE_SIZE + set * CACHE_LINE_SIZE) }
    }

    #[inline(always)]
    fn victim(&self, set: usize) -> *const u8 {
        self.line(self.ways, set)
    }

    fn prime(&self) {
        for set in 0..L1D_SETS {
            for way in 0..self.ways {
                touch(self.line(way, set));
            }
        }
    }

    fn probe_set(&self, set: usize) -> u64 {
        let start = fenced_rdtsc();
        for way in 0..self.ways {
            touch(self.line(way, set));
        }
        fenced_rdtsc().saturating_sub(start)
    }
}

impl SideChannel for PrimeProbe {
    fn calibrate(&mut self) -> Result<(), FuzzErr> {
        let mut samples = vec![vec![0u64; CALIBRATION_ROUNDS]; L1D_SETS];
        for round in 0..CALIBRATION_ROUNDS {
            self.prime();
            for (set, timings) in samples.iter_mut().enumerate() {
                timings[round] = self.probe_set(set);
            }
        }

        for (set, timings) in samples.iter_mut().enumerate() {
            self.thresholds[set] = median(timings) + PROBE_MARGIN;
        }

        // One foreign line in a primed set has to read as an eviction
        let mut detected = 0;
        for round in 0..CALIBRATION_ROUNDS {
            let set = round % L1D_SETS;
            self.prime();
            touch(self.victim(set));
            if self.probe_set(set) > self.thresholds[set] {
                detected += 1;
            }
        }
        if detected * 2 <= CALIBRATION_ROUNDS {
            return Err(FuzzErr::Executor(format!(
                "Prime+Probe saw {} of {} known accesses with {} ways",
                detected, CALIBRATION_ROUNDS, self.ways
            )));
        }

        Ok(())
    }

    fn prepare(&mut self) {
        self.prime();
    }

    fn collect(&mut self) -> u64 {
        let mut evicted = 0u64;
        for set in 0..L1D_SETS {
            if self.probe_set(set) > self.thresholds[set] {
                evicted |= 1 << set;
            }
        }
        evicted
    }
}

/// Flush+Reload directly on the sandbox lines
pub struct FlushReload {
    sandbox: *const u8,
    threshold: u64,
}

impl FlushReload {
    /// `sandbox` must point at a mapped main page for as long as this lives
    pub fn new(sandbox: *const u8) -> Self {
        FlushReload {
            sandbox,
            threshold: u64::MAX,
        }
    }

    #[inline(always)]
    fn line(&self, line: usize) -> *const u8 {
        unsafe { self.sandbox.add(line * CACHE_LINE_SIZE) }
    }

    fn reload(&self, line: usize) -> u64 {
        let start = fenced_rdtsc();
        touch(self.line(line));
        fenced_rdtsc().saturating_sub(start)
    }
}

impl SideChannel for FlushReload {
    fn calibrate(&mut self) -> Result<(), FuzzErr> {
        let mut hits = Vec::with_capacity(CALIBRATION_ROUNDS);
        let mut misses = Vec::with_capacity(CALIBRATION_ROUNDS);

        for _ in 0..CALIBRATION_ROUNDS {
            touch(self.line(0));
            hits.push(self.reload(0));

            clflush(self.line(0));
            misses.push(self.reload(0));
        }

        let hit = median(&mut hits);
        let miss = median(&mut misses);
        if miss <= hit {
            return Err(FuzzErr::Executor(format!(
                "Flush+Reload cannot tell hits ({} cycles) from misses ({} cycles)",
                hit, miss
            )));
        }

        self.threshold = hit + (miss - hit) / 2;
        Ok(())
    }

    fn prepare(&mut self) {
        for line in 0..MAIN_REGION_SIZE / CACHE_LINE_SIZE {
            clflush(self.line(line));
        }
    }

    fn collect(&mut self) -> u64 {
        let mut hit = 0u64;
        for line in 0..MAIN_REGION_SIZE / CACHE_LINE_SIZE {
            if self.reload(line) < self.threshold {
                hit |= 1 << (line % L1D_SETS);
            }
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::cpu::{default_core, CoreLease};

    #[test]
    fn median_of_unsorted() {
        assert_eq!(median(&mut [9, 1, 5]), 5);
        assert_eq!(median(&mut [4, 4, 1, 100]), 4);
    }

    fn fake_sysfs(name: &str, indices: &[(&str, &str, &str, &str)]) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("probefuzz-{}-{}", name, std::process::id()));
        for (idx, (level, kind, ways, sets)) in indices.iter().enumerate() {
            let index = dir.join(format!("index{}", idx));
            std::fs::create_dir_all(&index).unwrap();
            std::fs::write(index.join("level"), format!("{}\n", level)).unwrap();
            std::fs::write(index.join("type"), format!("{}\n", kind)).unwrap();
            std::fs::write(index.join("ways_of_associativity"), format!("{}\n", ways)).unwrap();
            std::fs::write(index.join("number_of_sets"), format!("{}\n", sets)).unwrap();
        }
        dir
    }

    #[test]
    fn geometry_comes_from_the_l1_data_cache() {
        // Instruction cache first, as some kernels list it
        let dir = fake_sysfs(
            "l1d",
            &[
                ("1", "Instruction", "8", "64"),
                ("1", "Data", "12", "64"),
                ("2", "Unified", "16", "2048"),
            ],
        );
        let geometry = CacheGeometry::from_sysfs(&dir).unwrap();
        assert_eq!(geometry, CacheGeometry { ways: 12, sets: 64 });
        assert_eq!(geometry.check().unwrap().ways, 12);

        let _ = std::fs::remove_dir_all(&dir);

        let empty = std::env::temp_dir().join("probefuzz-no-such-cache-dir");
        assert!(CacheGeometry::from_sysfs(&empty).is_none());
    }

    #[test]
    fn unsupported_geometries_are_rejected() {
        assert!(CacheGeometry { ways: 12, sets: 128 }.check().is_err());
        assert!(CacheGeometry { ways: 0, sets: 64 }.check().is_err());
        assert!(CacheGeometry { ways: 64, sets: 64 }.check().is_err());
        assert!(PrimeProbe::new(CacheGeometry { ways: 8, sets: 32 }).is_err());
    }

    #[test]
    fn eviction_buffer_covers_every_way() {
        let Ok(pp) = PrimeProbe::new(CacheGeometry { ways: 12, sets: 64 }) else {
            return;
        };
        assert_eq!(pp.buffer.len(), PAGE_SIZE * 13);
        assert_eq!(pp.victim(2) as usize - pp.line(0, 2) as usize, 12 * PAGE_SIZE);
    }

    #[test]
    fn touched_set_is_reported() {
        // Real L1D only, and only where the timer can tell at all
        let Ok(core) = default_core() else {
            return;
        };
        let Ok(_lease) = CoreLease::acquire(core) else {
            return;
        };
        let Ok(geometry) = CacheGeometry::detect(core) else {
            return;
        };
        let Ok(mut pp) = PrimeProbe::new(geometry) else {
            return;
        };
        if pp.calibrate().is_err() {
            return;
        }

        let mut seen = 0;
        for _ in 0..32 {
            pp.prepare();
            touch(pp.victim(2));
            if pp.collect() & (1 << 2) != 0 {
                seen += 1;
            }
        }
        assert!(seen > 16, "set 2 seen in {} of 32 rounds", seen);
    }
}
