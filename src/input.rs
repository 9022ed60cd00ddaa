//! Concrete input states and their generator. An input fixes the six
//! generator visible registers, the arithmetic flags and the main sandbox page.
//! Every randomized value holds at most `entropy_bits` bits of randomness,
//! shifted to cache line granularity

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::err::FuzzErr;
use crate::isa::{sanitize_flags, Reg};
use crate::model::InputFootprint;
use crate::program::{CACHE_LINE_SIZE, MAIN_REGION_SIZE};

/// Number of 64-bit words in the main sandbox page
pub const MEM_WORDS: usize = MAIN_REGION_SIZE / 8;

/// Bits of each value below the randomness, keeps values line aligned
const LINE_SHIFT: u32 = CACHE_LINE_SIZE.trailing_zeros();

// Mixes the variant index into the base seed
const VARIANT_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

// Chance a register points into the faulty page when there is one
const FAULTY_PAGE_RATE: f64 = 0.125;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Input {
    /// Seed this input was drawn from, printed in reports
    pub seed: u64,
    pub regs: [u64; Reg::ALL.len()],
    pub flags: u64,
    pub memory: Vec<u64>,
}

impl Input {
    #[inline]
    pub fn reg(&self, reg: Reg) -> u64 {
        self.regs[reg.index()]
    }

    /// Reject inputs the sandbox cannot hold
    pub fn validate(&self) -> Result<(), FuzzErr> {
        if self.memory.len() != MEM_WORDS {
            return Err(FuzzErr::Generation(format!(
                "Input {:#x} has {} memory words, sandbox holds {}",
                self.seed,
                self.memory.len(),
                MEM_WORDS
            )));
        }

        if sanitize_flags(self.flags) != self.flags {
            return Err(FuzzErr::Generation(format!(
                "Input {:#x} sets non-arithmetic flags {:#x}",
                self.seed, self.flags
            )));
        }

        Ok(())
    }

    /// Indices of cache lines whose content differs between two inputs
    pub fn differing_lines(&self, other: &Input) -> Vec<usize> {
        let words_per_line = CACHE_LINE_SIZE / 8;
        (0..MEM_WORDS / words_per_line)
            .filter(|line| {
                let range = line * words_per_line..(line + 1) * words_per_line;
                self.memory[range.clone()] != other.memory[range]
            })
            .collect()
    }
}

pub struct InputGenerator {
    entropy_bits: u32,
    faulty_page: bool,
}

impl InputGenerator {
    pub fn new(entropy_bits: u32) -> Result<Self, FuzzErr> {
        if entropy_bits == 0 || entropy_bits > 64 - LINE_SHIFT {
            return Err(FuzzErr::Config(format!(
                "Entropy bits must be in 1..={}, got {}",
                64 - LINE_SHIFT,
                entropy_bits
            )));
        }

        Ok(InputGenerator {
            entropy_bits,
            faulty_page: false,
        })
    }

    /// Let register values reach the faulty page. Bit 12 is drawn on its own,
    /// the entropy budget alone never gets that high
    pub fn with_faulty_page(mut self, faulty_page: bool) -> Self {
        self.faulty_page = faulty_page;
        self
    }

    #[inline]
    fn random_value(&self, rng: &mut StdRng) -> u64 {
        rng.random_range(0..1u64 << self.entropy_bits) << LINE_SHIFT
    }

    fn random_reg(&self, rng: &mut StdRng) -> u64 {
        let value = self.random_value(rng);
        if self.faulty_page && rng.random_bool(FAULTY_PAGE_RATE) {
            value | MAIN_REGION_SIZE as u64
        } else {
            value
        }
    }

    fn random_flags(rng: &mut StdRng) -> u64 {
        sanitize_flags(rng.random::<u64>())
    }

    /// One fully random input
    pub fn random_input(&self, seed: u64) -> Input {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut regs = [0u64; Reg::ALL.len()];
        for reg in regs.iter_mut() {
            *reg = self.random_reg(&mut rng);
        }
        let flags = Self::random_flags(&mut rng);
        let memory = (0..MEM_WORDS).map(|_| self.random_value(&mut rng)).collect();

        Input {
            seed,
            regs,
            flags,
            memory,
        }
    }

    /// `count` base inputs, each with its own seed derived from `seed`
    pub fn generate(&self, seed: u64, count: usize) -> Vec<Input> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| self.random_input(rng.random::<u64>()))
            .collect()
    }

    /// Variants of `base` that re-randomize only what the footprint says the
    /// program never reads, so all of them should land in the base's class
    pub fn boost(&self, base: &Input, footprint: &InputFootprint, count: usize) -> Vec<Input> {
        (1..=count as u64)
            .map(|k| {
                let seed = base.seed ^ k.wrapping_mul(VARIANT_MIX);
                let mut rng = StdRng::seed_from_u64(seed);
                let mut variant = base.clone();
                variant.seed = seed;

                for reg in Reg::ALL {
                    if !footprint.reads_reg(reg) {
                        variant.regs[reg.index()] = self.random_reg(&mut rng);
                    }
                }

                if !footprint.flags {
                    variant.flags = Self::random_flags(&mut rng);
                }

                for (idx, word) in variant.memory.iter_mut().enumerate() {
                    if !footprint.reads_word(idx) {
                        *word = self.random_value(&mut rng);
                    }
                }

                variant
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_respect_entropy() {
        let gen = InputGenerator::new(3).unwrap();
        for input in gen.generate(7, 32) {
            input.validate().unwrap();
            for value in input.regs.iter().chain(input.memory.iter()) {
                assert_eq!(value & 0x3F, 0);
                assert!(*value < 8 << 6);
            }
        }
    }

    #[test]
    fn registers_reach_the_faulty_page() {
        let in_faulty_page = |gen: &InputGenerator| {
            gen.generate(11, 200)
                .iter()
                .flat_map(|input| input.regs)
                .filter(|reg| reg & MAIN_REGION_SIZE as u64 != 0)
                .count()
        };

        let gen = InputGenerator::new(3).unwrap();
        assert_eq!(in_faulty_page(&gen), 0);

        // 1200 registers at 1 in 8, far from zero either way
        let gen = InputGenerator::new(3).unwrap().with_faulty_page(true);
        let hits = in_faulty_page(&gen);
        assert!(hits > 50 && hits < 300, "{} registers in the faulty page", hits);

        // Memory keeps its entropy bound
        for input in gen.generate(11, 16) {
            assert!(input.memory.iter().all(|word| *word < 8 << 6));
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let gen = InputGenerator::new(8).unwrap();
        assert_eq!(gen.generate(42, 4), gen.generate(42, 4));
        assert_ne!(gen.generate(42, 4), gen.generate(43, 4));
    }

    #[test]
    fn boosting_keeps_footprint() {
        let gen = InputGenerator::new(16).unwrap();
        let base = gen.random_input(1);

        let mut footprint = InputFootprint::default();
        footprint.mark_reg(Reg::Rax);
        footprint.mark_word(8);
        footprint.flags = true;

        let variants = gen.boost(&base, &footprint, 5);
        assert_eq!(variants.len(), 5);
        for variant in &variants {
            variant.validate().unwrap();
            assert_eq!(variant.reg(Reg::Rax), base.reg(Reg::Rax));
            assert_eq!(variant.memory[8], base.memory[8]);
            assert_eq!(variant.flags, base.flags);
        }

        // Everything else is free to change
        assert!(variants.iter().any(|v| v.reg(Reg::Rbx) != base.reg(Reg::Rbx)));
        assert_eq!(variants, gen.boost(&base, &footprint, 5));
    }

    #[test]
    fn validate_rejects_bad_layout() {
        let gen = InputGenerator::new(4).unwrap();
        let mut input = gen.random_input(3);
        input.memory.pop();
        assert!(input.validate().is_err());

        let mut input = gen.random_input(3);
        input.flags |= 1 << 9;
        assert!(input.validate().is_err());

        assert!(InputGenerator::new(0).is_err());
        assert!(InputGenerator::new(59).is_err());
    }

    #[test]
    fn differing_lines_are_reported() {
        let gen = InputGenerator::new(4).unwrap();
        let a = gen.random_input(5);
        let mut b = a.clone();
        b.memory[17] ^= 0x40;
        assert_eq!(a.differing_lines(&b), vec![2]);
    }
}
