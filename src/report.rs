//! Rendering of confirmed violations, and saving them to the output dir

use std::fmt::Write as _;
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::assembler::encode;
use crate::executor::HwTrace;
use crate::input::Input;
use crate::isa::{Reg, CATALOG_VERSION};
use crate::minimize::Minimized;
use crate::model::Contract;
use crate::program::{TestProgram, CACHE_LINE_SIZE};
use crate::{finding, prompt_warn};

/// A reproducible divergence between two inputs of one class
#[derive(Debug, Clone)]
pub struct Violation {
    pub contract: Contract,
    pub program: TestProgram,
    pub input_a: Input,
    pub input_b: Input,
    pub trace_a: HwTrace,
    pub trace_b: HwTrace,

    /// Length of the contract trace both inputs share
    pub model_trace_len: usize,

    pub minimized: Option<Minimized>,
    pub worker: usize,
    pub iteration: usize,
}

// Fields of `b` that differ from `a`, one per line
fn render_input_diff(out: &mut String, a: &Input, b: &Input) {
    for reg in Reg::ALL {
        if a.reg(reg) != b.reg(reg) {
            let _ = writeln!(
                out,
                "  {:<4} {:#018x} | {:#018x}",
                reg.name(),
                a.reg(reg),
                b.reg(reg)
            );
        }
    }

    if a.flags != b.flags {
        let _ = writeln!(out, "  {:<4} {:#018x} | {:#018x}", "flg", a.flags, b.flags);
    }

    let words = CACHE_LINE_SIZE / 8;
    for line in a.differing_lines(b) {
        for word in line * words..(line + 1) * words {
            if a.memory[word] != b.memory[word] {
                let _ = writeln!(
                    out,
                    "  [{:#05x}] {:#018x} | {:#018x}",
                    word * 8,
                    a.memory[word],
                    b.memory[word]
                );
            }
        }
    }
}

// Body bytes as the harness runs them, enough to replay outside the fuzzer
fn render_encoding(out: &mut String, program: &TestProgram) {
    match encode(program) {
        Ok(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            let _ = writeln!(out, "bytes ({}): {}", bytes.len(), hex);
        }
        Err(e) => {
            let _ = writeln!(out, "bytes: unavailable ({})", e);
        }
    }
}

impl Violation {
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "contract:   {}", self.contract);
        let _ = writeln!(out, "catalog:    v{}", CATALOG_VERSION);
        let _ = writeln!(
            out,
            "found by:   worker {} at program {}",
            self.worker, self.iteration
        );
        let _ = writeln!(out, "program:    {:#x}", self.program.seed);
        let _ = writeln!(
            out,
            "inputs:     {:#x} / {:#x}",
            self.input_a.seed, self.input_b.seed
        );
        let _ = writeln!(out, "model:      {} observations", self.model_trace_len);

        let _ = writeln!(out, "\n{}", self.program);
        render_encoding(&mut out, &self.program);

        let _ = writeln!(out, "\ninput difference (a | b):");
        render_input_diff(&mut out, &self.input_a, &self.input_b);

        let _ = writeln!(out, "\nhardware traces:");
        let _ = writeln!(out, "  a: {}", self.trace_a);
        let _ = writeln!(out, "  b: {}", self.trace_b);

        if let Some(min) = &self.minimized {
            let _ = writeln!(
                out,
                "\nminimized ({} -> {} instructions, {} checks):",
                self.program.instruction_count(),
                min.program.instruction_count(),
                min.checks
            );
            let _ = writeln!(out, "{}", min.program);
            render_encoding(&mut out, &min.program);
            let _ = writeln!(out, "\nminimized input difference (a | b):");
            render_input_diff(&mut out, &min.input_a, &min.input_b);
            let _ = writeln!(out, "\nminimized traces:");
            let _ = writeln!(out, "  a: {}", min.trace_a);
            let _ = writeln!(out, "  b: {}", min.trace_b);
        }

        out
    }

    /// Identity of the finding, the program plus the two inputs
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.program.hash(&mut hasher);
        self.input_a.hash(&mut hasher);
        self.input_b.hash(&mut hasher);
        hasher.finish()
    }

    /// Write the report to `output_dir`, returning the hash it was saved
    /// under. Nothing here is allowed to end the session
    pub fn save(&self, output_dir: &str) -> u64 {
        let hash = self.fingerprint();

        if let Err(e) = std::fs::create_dir_all(output_dir) {
            prompt_warn!("Unable to create output dir '{}': {}", output_dir, e);
            return hash;
        }

        let file_path =
            std::path::Path::new(output_dir).join(format!("violation-{:016X}.txt", hash));
        if file_path.exists() {
            prompt_warn!("Skipping violation save, {:016X} already exists", hash);
            return hash;
        }

        match std::fs::write(&file_path, self.render()) {
            Ok(_) => {
                finding!(self.worker, "Saved violation '{:016X}'", hash);
            }
            Err(e) => {
                prompt_warn!("Unable to save violation '{:016X}': {}", hash, e);
            }
        }

        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::tests::leaking_pair;
    use crate::model::{ExecutionClause, ObservationClause};
    use crate::program::tests::branchy_program;

    fn violation() -> Violation {
        let (a, mut b) = leaking_pair();
        b.memory[9] ^= 0xFF;
        Violation {
            contract: Contract {
                observation: ObservationClause::Ct,
                execution: ExecutionClause::Seq,
            },
            program: branchy_program(),
            input_a: a,
            input_b: b,
            trace_a: HwTrace { sets: 0b1100, faulted: false },
            trace_b: HwTrace { sets: 0b11000, faulted: false },
            model_trace_len: 4,
            minimized: None,
            worker: 0,
            iteration: 7,
        }
    }

    #[test]
    fn render_lists_the_difference() {
        let text = violation().render();
        assert!(text.contains("contract:   ct-seq"));
        assert!(text.contains(".bb1:"));
        assert!(text.contains("rdx"));
        assert!(!text.contains("  rax"));
        assert!(text.contains("[0x048]"));
        assert!(text.contains("..^^"));

        // cmp rax, rbx leads the body
        assert!(text.contains("): 4839d8"));
    }

    #[test]
    fn save_writes_one_file() {
        let dir = std::env::temp_dir().join(format!("probefuzz-report-{}", std::process::id()));
        let dir_str = dir.to_string_lossy().to_string();
        let v = violation();

        let hash = v.save(&dir_str);
        assert_eq!(hash, v.save(&dir_str));

        let path = dir.join(format!("violation-{:016X}.txt", hash));
        let saved = std::fs::read_to_string(&path).unwrap();
        assert_eq!(saved, v.render());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
