//! The contract model. It interprets a test program on an input and records
//! what the contract allows an attacker to observe. Speculative paths are
//! explored with an explicit stack of checkpoints: whenever the execution
//! clause allows a misprediction, the correct continuation is checkpointed and
//! the wrong one is executed until the speculation window runs out, an
//! `lfence` is reached, the path faults, or the program ends. Then the most
//! recent checkpoint is restored.

use std::fmt;

use crate::config::Config;
use crate::input::{Input, MEM_WORDS};
use crate::isa::{
    sanitize_flags, BinaryOp, Instruction, LogicalOp, Operand, Reg, UnaryOp, FLAGS_AF, FLAGS_CF,
    FLAGS_OF, FLAGS_PF, FLAGS_SF, FLAGS_ZF,
};
use crate::program::{FlatOp, SandboxLayout, TestProgram, CACHE_LINE_SIZE, L1D_SETS};

/// What the attacker is allowed to see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationClause {
    /// Cache set of every memory access
    L1d,
    /// Sandbox offset of every memory access
    Mem,
    /// Program counter of every instruction plus every access offset
    Ct,
    /// `Ct` plus the initial register values
    Ctr,
    /// `Ct` plus every loaded value
    Arch,
}

/// Which mispredictions the model explores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionClause {
    Seq,
    Cond,
    Bpas,
    CondBpas,
    NullInjection,
    /// A fault retires late: the instructions after it run speculatively,
    /// except those depending on the faulting one
    DelayedExceptions,
}

impl ObservationClause {
    pub const ALL: [ObservationClause; 5] = [
        ObservationClause::L1d,
        ObservationClause::Mem,
        ObservationClause::Ct,
        ObservationClause::Ctr,
        ObservationClause::Arch,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ObservationClause::L1d => "l1d",
            ObservationClause::Mem => "mem",
            ObservationClause::Ct => "ct",
            ObservationClause::Ctr => "ctr",
            ObservationClause::Arch => "arch",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    fn observes_pc(self) -> bool {
        matches!(
            self,
            ObservationClause::Ct | ObservationClause::Ctr | ObservationClause::Arch
        )
    }
}

impl ExecutionClause {
    pub const ALL: [ExecutionClause; 6] = [
        ExecutionClause::Seq,
        ExecutionClause::Cond,
        ExecutionClause::Bpas,
        ExecutionClause::CondBpas,
        ExecutionClause::NullInjection,
        ExecutionClause::DelayedExceptions,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExecutionClause::Seq => "seq",
            ExecutionClause::Cond => "cond",
            ExecutionClause::Bpas => "bpas",
            ExecutionClause::CondBpas => "cond-bpas",
            ExecutionClause::NullInjection => "null-injection",
            ExecutionClause::DelayedExceptions => "delayed-exception-handling",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    fn mispredicts_branches(self) -> bool {
        matches!(self, ExecutionClause::Cond | ExecutionClause::CondBpas)
    }

    fn bypasses_stores(self) -> bool {
        matches!(self, ExecutionClause::Bpas | ExecutionClause::CondBpas)
    }

    /// Clauses that only speculate on faults
    pub fn needs_faulty_page(self) -> bool {
        matches!(
            self,
            ExecutionClause::NullInjection | ExecutionClause::DelayedExceptions
        )
    }
}

/// Observation and execution clause, fixed for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Contract {
    pub observation: ObservationClause,
    pub execution: ExecutionClause,
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.observation.name(), self.execution.name())
    }
}

/// One observable event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Observation {
    Pc(usize),
    Addr(u64),
    CacheSet(u8),
    Reg(u64),
    Value(u64),
}

/// Input locations read before being written on some path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputFootprint {
    pub regs: u8,
    pub flags: bool,
    pub memory: [u64; MEM_WORDS / 64],
}

impl InputFootprint {
    #[inline]
    pub fn reads_reg(&self, reg: Reg) -> bool {
        self.regs & (1 << reg.index()) != 0
    }

    #[inline]
    pub fn reads_word(&self, word: usize) -> bool {
        self.memory[word / 64] & (1 << (word % 64)) != 0
    }

    pub fn mark_reg(&mut self, reg: Reg) {
        self.regs |= 1 << reg.index();
    }

    pub fn mark_word(&mut self, word: usize) {
        self.memory[word / 64] |= 1 << (word % 64);
    }
}

#[derive(Debug, Clone)]
pub struct ModelResult {
    /// The contract trace, the only thing classes are formed from
    pub trace: Vec<Observation>,

    /// How many trace entries came from speculative paths
    pub spec_observations: usize,

    /// Architectural execution ended in a fault
    pub faulted: bool,

    pub footprint: InputFootprint,

    /// Bitmap of every L1D set accessed on any path, what a simulated
    /// cache would end up holding
    pub touched_sets: u64,
}

#[inline]
pub fn cache_set(offset: u64) -> u8 {
    ((offset / CACHE_LINE_SIZE as u64) % L1D_SETS as u64) as u8
}

/// Architectural state of one path, including the write tracking that
/// decides which reads count towards the input footprint
#[derive(Clone)]
struct State {
    regs: [u64; Reg::ALL.len()],
    flags: u64,
    memory: Vec<u64>,
    written_regs: u8,
    written_flags: bool,
    written_memory: [u64; MEM_WORDS / 64],
}

impl State {
    fn new(input: &Input) -> Self {
        State {
            regs: input.regs,
            flags: sanitize_flags(input.flags),
            memory: input.memory.clone(),
            written_regs: 0,
            written_flags: false,
            written_memory: [0; MEM_WORDS / 64],
        }
    }

    fn read_reg(&self, reg: Reg, footprint: &mut InputFootprint) -> u64 {
        if self.written_regs & (1 << reg.index()) == 0 {
            footprint.mark_reg(reg);
        }
        self.regs[reg.index()]
    }

    fn write_reg(&mut self, reg: Reg, value: u64) {
        self.written_regs |= 1 << reg.index();
        self.regs[reg.index()] = value;
    }

    fn read_flags(&self, footprint: &mut InputFootprint) -> u64 {
        if !self.written_flags {
            footprint.flags = true;
        }
        self.flags
    }

    fn write_flags(&mut self, flags: u64) {
        self.written_flags = true;
        self.flags = sanitize_flags(flags);
    }

    // Offsets outside the main page only come up on injected paths, where
    // loads read zero and stores vanish
    fn load(&self, offset: u64, footprint: &mut InputFootprint) -> u64 {
        let word = offset as usize / 8;
        if word >= MEM_WORDS {
            return 0;
        }

        if self.written_memory[word / 64] & (1 << (word % 64)) == 0 {
            footprint.mark_word(word);
        }
        self.memory[word]
    }

    fn store(&mut self, offset: u64, value: u64) {
        let word = offset as usize / 8;
        if word >= MEM_WORDS {
            return;
        }

        self.written_memory[word / 64] |= 1 << (word % 64);
        self.memory[word] = value;
    }

    /// Save a memory word with its write bit so a bypassed store can be undone
    fn snapshot_word(&self, offset: u64) -> Option<(usize, u64, bool)> {
        let word = offset as usize / 8;
        (word < MEM_WORDS).then(|| {
            let written = self.written_memory[word / 64] & (1 << (word % 64)) != 0;
            (word, self.memory[word], written)
        })
    }

    fn restore_word(&mut self, saved: (usize, u64, bool)) {
        let (word, value, written) = saved;
        self.memory[word] = value;
        if !written {
            self.written_memory[word / 64] &= !(1 << (word % 64));
        }
    }
}

/// Resumable point of execution. The checkpoint stack holds these
#[derive(Clone)]
struct Path {
    state: State,
    pc: usize,
    /// Speculation nesting level, 0 is architectural
    depth: usize,
    /// Instructions left in the speculation window
    window: usize,
    /// Registers and flags waiting on a faulted instruction, see `DEP_FLAGS`
    deps: u8,
}

// Flag computation helpers

#[inline]
fn parity(value: u64) -> bool {
    (value as u8).count_ones() % 2 == 0
}

fn result_flags(res: u64) -> u64 {
    let mut flags = 0;
    if res == 0 {
        flags |= FLAGS_ZF;
    }
    if (res as i64) < 0 {
        flags |= FLAGS_SF;
    }
    if parity(res) {
        flags |= FLAGS_PF;
    }
    flags
}

fn add_flags(a: u64, b: u64, res: u64) -> u64 {
    let mut flags = result_flags(res);
    if res < a {
        flags |= FLAGS_CF;
    }
    if ((a ^ res) & (b ^ res)) >> 63 != 0 {
        flags |= FLAGS_OF;
    }
    if (a ^ b ^ res) & 0x10 != 0 {
        flags |= FLAGS_AF;
    }
    flags
}

fn sub_flags(a: u64, b: u64, res: u64) -> u64 {
    let mut flags = result_flags(res);
    if a < b {
        flags |= FLAGS_CF;
    }
    if ((a ^ b) & (a ^ res)) >> 63 != 0 {
        flags |= FLAGS_OF;
    }
    if (a ^ b ^ res) & 0x10 != 0 {
        flags |= FLAGS_AF;
    }
    flags
}

/// Does the instruction read its memory operand
fn reads_memory(instr: &Instruction) -> bool {
    match *instr {
        Instruction::Binary { dst, src, .. } | Instruction::Logical { dst, src, .. } => {
            dst.is_mem() || src.is_mem()
        }
        Instruction::Unary { dst, .. } => dst.is_mem(),
        Instruction::Mov { src, .. } => src.is_mem(),
        Instruction::Cmov { src, .. } => src.is_mem(),
        Instruction::Setcc { .. } | Instruction::Lfence => false,
    }
}

// Dependency bits: one per register, plus the flags
const DEP_FLAGS: u8 = 1 << Reg::ALL.len();

#[inline]
fn dep_reg(reg: Reg) -> u8 {
    1 << reg.index()
}

// Registers an operand reads, including the base of a memory operand
fn operand_deps(op: Operand) -> u8 {
    match op {
        Operand::Reg(reg) | Operand::Mem(reg) => dep_reg(reg),
        Operand::Imm(_) => 0,
    }
}

// Register written through a register destination
fn dst_deps(op: Operand) -> u8 {
    match op {
        Operand::Reg(reg) => dep_reg(reg),
        _ => 0,
    }
}

/// Registers and flags the instruction reads
fn source_deps(instr: &Instruction) -> u8 {
    match *instr {
        Instruction::Binary { dst, src, .. } | Instruction::Logical { dst, src, .. } => {
            operand_deps(dst) | operand_deps(src)
        }
        Instruction::Unary { op, dst } => match op {
            UnaryOp::Inc | UnaryOp::Dec => operand_deps(dst) | DEP_FLAGS,
            UnaryOp::Neg | UnaryOp::Not => operand_deps(dst),
        },
        Instruction::Mov { dst, src } => {
            let base = if dst.is_mem() { operand_deps(dst) } else { 0 };
            operand_deps(src) | base
        }
        Instruction::Cmov { dst, src, .. } => operand_deps(src) | dep_reg(dst) | DEP_FLAGS,
        Instruction::Setcc { dst, .. } => dep_reg(dst) | DEP_FLAGS,
        Instruction::Lfence => 0,
    }
}

/// Registers and flags the instruction writes
fn result_deps(instr: &Instruction) -> u8 {
    match *instr {
        Instruction::Binary { op, dst, .. } => {
            (if op.writes_dst() { dst_deps(dst) } else { 0 }) | DEP_FLAGS
        }
        Instruction::Logical { op, dst, .. } => {
            (if op.writes_dst() { dst_deps(dst) } else { 0 }) | DEP_FLAGS
        }
        Instruction::Unary { op, dst } => match op {
            UnaryOp::Not => dst_deps(dst),
            _ => dst_deps(dst) | DEP_FLAGS,
        },
        Instruction::Mov { dst, .. } => dst_deps(dst),
        Instruction::Cmov { dst, .. } | Instruction::Setcc { dst, .. } => dep_reg(dst),
        Instruction::Lfence => 0,
    }
}

/// Does the instruction write its memory operand
fn writes_memory(instr: &Instruction) -> bool {
    match *instr {
        Instruction::Binary { op, dst, .. } => op.writes_dst() && dst.is_mem(),
        Instruction::Logical { op, dst, .. } => op.writes_dst() && dst.is_mem(),
        Instruction::Unary { dst, .. } | Instruction::Mov { dst, .. } => dst.is_mem(),
        Instruction::Cmov { .. } | Instruction::Setcc { .. } | Instruction::Lfence => false,
    }
}

/// Collects the trace and the side results of one model run
struct Recorder {
    observation: ObservationClause,
    trace: Vec<Observation>,
    spec_observations: usize,
    footprint: InputFootprint,
    touched_sets: u64,
}

impl Recorder {
    fn observe(&mut self, depth: usize, obs: Observation) {
        if depth > 0 {
            self.spec_observations += 1;
        }
        self.trace.push(obs);
    }

    fn observe_pc(&mut self, depth: usize, pc: usize) {
        if self.observation.observes_pc() {
            self.observe(depth, Observation::Pc(pc));
        }
    }

    fn observe_access(&mut self, depth: usize, offset: u64) {
        self.touched_sets |= 1 << cache_set(offset);
        let obs = match self.observation {
            ObservationClause::L1d => Observation::CacheSet(cache_set(offset)),
            _ => Observation::Addr(offset),
        };
        self.observe(depth, obs);
    }

    fn observe_load(&mut self, depth: usize, value: u64) {
        if self.observation == ObservationClause::Arch {
            self.observe(depth, Observation::Value(value));
        }
    }
}

pub struct ContractModel {
    contract: Contract,
    layout: SandboxLayout,
    max_window: usize,
    max_nesting: usize,
}

impl ContractModel {
    pub fn new(
        contract: Contract,
        layout: SandboxLayout,
        max_window: usize,
        max_nesting: usize,
    ) -> Self {
        ContractModel {
            contract,
            layout,
            max_window,
            max_nesting,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        ContractModel::new(
            config.contract,
            SandboxLayout::new(config.enable_faulty_page),
            config.model_max_spec_window,
            config.model_max_nesting,
        )
    }

    pub fn contract(&self) -> Contract {
        self.contract
    }

    /// Run the program on an input and collect the contract trace
    pub fn run(&self, program: &TestProgram, input: &Input) -> ModelResult {
        let flat = program.flatten();
        let exit = flat.exit;

        let mut rec = Recorder {
            observation: self.contract.observation,
            trace: Vec::new(),
            spec_observations: 0,
            footprint: InputFootprint::default(),
            touched_sets: 0,
        };

        if self.contract.observation == ObservationClause::Ctr {
            for value in input.regs {
                rec.observe(0, Observation::Reg(value));
            }
        }

        let mut faulted = false;
        let mut checkpoints: Vec<Path> = Vec::new();
        let mut cur = Path {
            state: State::new(input),
            pc: 0,
            depth: 0,
            window: 0,
            deps: 0,
        };

        loop {
            // End of program, end of window: architectural execution is done,
            // speculative execution rolls back to the last checkpoint
            let exhausted = cur.depth > 0 && cur.window == 0;
            if cur.pc >= exit || exhausted {
                if cur.depth == 0 {
                    break;
                }
                match checkpoints.pop() {
                    Some(path) => {
                        cur = path;
                        continue;
                    }
                    None => break,
                }
            }

            if cur.depth > 0 {
                cur.window -= 1;
            }

            let pc = cur.pc;
            rec.observe_pc(cur.depth, pc);

            let instr = match flat.ops[pc] {
                FlatOp::Branch { .. } if cur.deps & DEP_FLAGS != 0 => {
                    // Waits on the faulted instruction, never resolves
                    cur.pc = pc + 1;
                    continue;
                }
                FlatOp::Branch { cond, target } => {
                    let taken = cond.holds(cur.state.read_flags(&mut rec.footprint));
                    let (correct, wrong) = if taken { (target, pc + 1) } else { (pc + 1, target) };

                    if self.contract.execution.mispredicts_branches()
                        && cur.depth < self.max_nesting
                    {
                        let mut resume = cur.clone();
                        resume.pc = correct;
                        checkpoints.push(resume);
                        self.enter_speculation(&mut cur);
                        cur.pc = wrong;
                    } else {
                        cur.pc = correct;
                    }
                    continue;
                }
                FlatOp::Instr(instr) => instr,
            };

            if *instr == Instruction::Lfence && cur.depth > 0 {
                cur.window = 0;
                continue;
            }

            // After a delayed fault, whatever consumes its results is held
            // back and passes the wait on to its own results
            if cur.deps != 0 {
                let sources = source_deps(instr);
                let results = result_deps(instr);
                if sources & cur.deps != 0 {
                    cur.deps |= results;
                    cur.pc = pc + 1;
                    continue;
                }
                cur.deps &= !(results & !sources);
            }

            // Address generation masks the base register in place
            let offset = instr.mem_base().map(|base| {
                let masked = cur.state.read_reg(base, &mut rec.footprint) & self.layout.mask();
                cur.state.write_reg(base, masked);
                masked
            });

            if let Some(offset) = offset.filter(|off| self.layout.is_faulty(*off)) {
                rec.observe_access(cur.depth, offset);
                if cur.depth == 0 {
                    faulted = true;
                }

                if self.contract.execution == ExecutionClause::DelayedExceptions
                    && cur.depth < self.max_nesting
                {
                    let mut resume = cur.clone();
                    resume.pc = exit;
                    checkpoints.push(resume);
                    self.enter_speculation(&mut cur);
                    cur.deps |= result_deps(instr);
                    cur.pc = pc + 1;
                    continue;
                }

                let inject = self.contract.execution == ExecutionClause::NullInjection
                    && reads_memory(instr)
                    && cur.depth < self.max_nesting;
                if !inject {
                    // Ends the architectural run, rolls back a speculative one
                    cur.pc = exit;
                    cur.window = 0;
                    continue;
                }

                let mut resume = cur.clone();
                resume.pc = exit;
                checkpoints.push(resume);
                self.enter_speculation(&mut cur);
                self.execute(&mut cur.state, instr, offset, cur.depth, &mut rec);
                cur.pc += 1;
                continue;
            }

            let bypass = self.contract.execution.bypasses_stores()
                && writes_memory(instr)
                && cur.depth < self.max_nesting;

            match offset {
                Some(offset) if bypass => {
                    let saved = cur.state.snapshot_word(offset);
                    self.execute(&mut cur.state, instr, offset, cur.depth, &mut rec);

                    let mut resume = cur.clone();
                    resume.pc = pc + 1;
                    checkpoints.push(resume);

                    // The speculative path continues as if the store never
                    // happened
                    if let Some(saved) = saved {
                        cur.state.restore_word(saved);
                    }
                    self.enter_speculation(&mut cur);
                }
                Some(offset) => self.execute(&mut cur.state, instr, offset, cur.depth, &mut rec),
                None => self.execute(&mut cur.state, instr, 0, cur.depth, &mut rec),
            }
            cur.pc = pc + 1;
        }

        ModelResult {
            trace: rec.trace,
            spec_observations: rec.spec_observations,
            faulted,
            footprint: rec.footprint,
            touched_sets: rec.touched_sets,
        }
    }

    fn enter_speculation(&self, path: &mut Path) {
        if path.depth == 0 {
            path.window = self.max_window;
        }
        path.depth += 1;
    }

    /// Operand read, `offset` is the already masked sandbox offset
    fn read_operand(
        &self,
        state: &State,
        op: Operand,
        offset: u64,
        depth: usize,
        rec: &mut Recorder,
    ) -> u64 {
        match op {
            Operand::Reg(reg) => state.read_reg(reg, &mut rec.footprint),
            Operand::Imm(imm) => imm as i64 as u64,
            Operand::Mem(_) => {
                let value = state.load(offset, &mut rec.footprint);
                rec.observe_load(depth, value);
                value
            }
        }
    }

    fn write_operand(&self, state: &mut State, op: Operand, offset: u64, value: u64) {
        match op {
            Operand::Reg(reg) => state.write_reg(reg, value),
            Operand::Mem(_) => state.store(offset, value),
            Operand::Imm(_) => {}
        }
    }

    /// Semantics of one instruction
    fn execute(
        &self,
        state: &mut State,
        instr: &Instruction,
        offset: u64,
        depth: usize,
        rec: &mut Recorder,
    ) {
        if instr.mem_base().is_some() {
            rec.observe_access(depth, offset);
        }

        match *instr {
            Instruction::Binary { op, dst, src } => {
                let a = self.read_operand(state, dst, offset, depth, rec);
                let b = self.read_operand(state, src, offset, depth, rec);
                let (res, flags) = match op {
                    BinaryOp::Add => {
                        let res = a.wrapping_add(b);
                        (res, add_flags(a, b, res))
                    }
                    BinaryOp::Sub | BinaryOp::Cmp => {
                        let res = a.wrapping_sub(b);
                        (res, sub_flags(a, b, res))
                    }
                };
                if op.writes_dst() {
                    self.write_operand(state, dst, offset, res);
                }
                state.write_flags(flags);
            }
            Instruction::Logical { op, dst, src } => {
                let a = self.read_operand(state, dst, offset, depth, rec);
                let b = self.read_operand(state, src, offset, depth, rec);
                let res = match op {
                    LogicalOp::And | LogicalOp::Test => a & b,
                    LogicalOp::Or => a | b,
                    LogicalOp::Xor => a ^ b,
                };
                if op.writes_dst() {
                    self.write_operand(state, dst, offset, res);
                }
                state.write_flags(result_flags(res));
            }
            Instruction::Unary { op, dst } => {
                let a = self.read_operand(state, dst, offset, depth, rec);
                let (res, flags) = match op {
                    UnaryOp::Inc | UnaryOp::Dec => {
                        // CF survives inc and dec
                        let cf = state.read_flags(&mut rec.footprint) & FLAGS_CF;
                        if op == UnaryOp::Inc {
                            let res = a.wrapping_add(1);
                            (res, Some((add_flags(a, 1, res) & !FLAGS_CF) | cf))
                        } else {
                            let res = a.wrapping_sub(1);
                            (res, Some((sub_flags(a, 1, res) & !FLAGS_CF) | cf))
                        }
                    }
                    UnaryOp::Neg => {
                        let res = a.wrapping_neg();
                        (res, Some(sub_flags(0, a, res)))
                    }
                    UnaryOp::Not => (!a, None),
                };
                self.write_operand(state, dst, offset, res);
                if let Some(flags) = flags {
                    state.write_flags(flags);
                }
            }
            Instruction::Mov { dst, src } => {
                let value = self.read_operand(state, src, offset, depth, rec);
                self.write_operand(state, dst, offset, value);
            }
            Instruction::Cmov { cond, dst, src } => {
                // The source is read whether or not the move happens
                let value = self.read_operand(state, src, offset, depth, rec);
                if cond.holds(state.read_flags(&mut rec.footprint)) {
                    state.write_reg(dst, value);
                } else {
                    // cmov writes its destination either way, zero extension
                    // aside it keeps the old value
                    let old = state.read_reg(dst, &mut rec.footprint);
                    state.write_reg(dst, old);
                }
            }
            Instruction::Setcc { cond, dst } => {
                let bit = cond.holds(state.read_flags(&mut rec.footprint)) as u64;
                let old = state.read_reg(dst, &mut rec.footprint);
                state.write_reg(dst, (old & !0xFF) | bit);
            }
            Instruction::Lfence => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputGenerator;
    use crate::isa::{Cond, FLAGS_RESERVED};
    use crate::program::tests::branchy_program;
    use crate::program::{BasicBlock, Terminator};

    fn model(observation: ObservationClause, execution: ExecutionClause) -> ContractModel {
        ContractModel::new(
            Contract {
                observation,
                execution,
            },
            SandboxLayout::default(),
            250,
            1,
        )
    }

    fn straight(instructions: Vec<Instruction>) -> TestProgram {
        TestProgram {
            seed: 0,
            layout: SandboxLayout::default(),
            blocks: vec![BasicBlock {
                instructions,
                terminator: Terminator::FallThrough,
            }],
        }
    }

    fn input(regs: [u64; 6]) -> Input {
        let mut input = InputGenerator::new(4).unwrap().random_input(0);
        input.regs = regs;
        input.flags = FLAGS_RESERVED;
        input
    }

    #[test]
    fn arithmetic_flags() {
        // 0 - 1 borrows and goes negative
        let flags = sub_flags(0, 1, 0u64.wrapping_sub(1));
        assert!(flags & FLAGS_CF != 0);
        assert!(flags & FLAGS_SF != 0);
        assert!(flags & FLAGS_ZF == 0);

        // i64::MAX + 1 overflows without carry
        let max = i64::MAX as u64;
        let flags = add_flags(max, 1, max.wrapping_add(1));
        assert!(flags & FLAGS_OF != 0);
        assert!(flags & FLAGS_CF == 0);

        assert!(result_flags(0) & FLAGS_ZF != 0);
        assert!(result_flags(0) & FLAGS_PF != 0);
        assert!(result_flags(1) & FLAGS_PF == 0);
    }

    #[test]
    fn sequential_branch_follows_flags() {
        let program = branchy_program();
        let m = model(ObservationClause::Ct, ExecutionClause::Seq);

        // rax == rbx takes the branch and skips the load through rdx
        let taken = m.run(&program, &input([0x40, 0x40, 0, 0x80, 0, 0xC0]));
        assert_eq!(
            taken.trace,
            vec![
                Observation::Pc(0),
                Observation::Pc(1),
                Observation::Pc(3),
                Observation::Addr(0xC0),
            ]
        );
        assert_eq!(taken.spec_observations, 0);

        let not_taken = m.run(&program, &input([0x40, 0x80, 0, 0x80, 0, 0xC0]));
        assert_eq!(not_taken.trace.len(), 6);
        assert!(!not_taken.faulted);
    }

    #[test]
    fn misprediction_adds_speculative_path() {
        let program = branchy_program();
        let m = model(ObservationClause::Ct, ExecutionClause::Cond);
        let result = m.run(&program, &input([0x40, 0x40, 0, 0x80, 0, 0xC0]));

        // The not-taken side runs first speculatively, then the taken side
        assert_eq!(
            result.trace,
            vec![
                Observation::Pc(0),
                Observation::Pc(1),
                Observation::Pc(2),
                Observation::Addr(0x80),
                Observation::Pc(3),
                Observation::Addr(0xC0),
                Observation::Pc(3),
                Observation::Addr(0xC0),
            ]
        );
        assert_eq!(result.spec_observations, 4);

        // rdx is only read on the speculative path and still counts
        assert!(result.footprint.reads_reg(Reg::Rdx));
    }

    #[test]
    fn window_bounds_speculation() {
        let program = branchy_program();
        let m = ContractModel::new(
            Contract {
                observation: ObservationClause::Ct,
                execution: ExecutionClause::Cond,
            },
            SandboxLayout::default(),
            1,
            1,
        );
        let result = m.run(&program, &input([0x40, 0x40, 0, 0x80, 0, 0xC0]));
        assert_eq!(result.spec_observations, 2);
    }

    #[test]
    fn lfence_stops_speculation() {
        let mut program = branchy_program();
        program.blocks[1].instructions.insert(0, Instruction::Lfence);
        let m = model(ObservationClause::Mem, ExecutionClause::Cond);
        let result = m.run(&program, &input([0x40, 0x40, 0, 0x80, 0, 0xC0]));
        assert_eq!(result.trace, vec![Observation::Addr(0xC0)]);
        assert_eq!(result.spec_observations, 0);
    }

    #[test]
    fn store_bypass_exposes_stale_value() {
        // mov [rax], rbx; mov rcx, [rax]; mov rdx, [rcx]
        let program = straight(vec![
            Instruction::Mov {
                dst: Operand::Mem(Reg::Rax),
                src: Operand::Reg(Reg::Rbx),
            },
            Instruction::Mov {
                dst: Operand::Reg(Reg::Rcx),
                src: Operand::Mem(Reg::Rax),
            },
            Instruction::Mov {
                dst: Operand::Reg(Reg::Rdx),
                src: Operand::Mem(Reg::Rcx),
            },
        ]);
        let mut inp = input([0x40, 0x100, 0, 0, 0, 0]);
        inp.memory[0x40 / 8] = 0x200;

        let seq = model(ObservationClause::Mem, ExecutionClause::Seq).run(&program, &inp);
        assert_eq!(
            seq.trace,
            vec![
                Observation::Addr(0x40),
                Observation::Addr(0x40),
                Observation::Addr(0x100),
            ]
        );

        // The bypassing path loads the stale 0x200 and leaks it
        let bpas = model(ObservationClause::Mem, ExecutionClause::Bpas).run(&program, &inp);
        assert!(bpas.trace.contains(&Observation::Addr(0x200)));
        assert!(bpas.spec_observations > 0);
        assert!(bpas.footprint.reads_word(0x40 / 8));
        assert!(!seq.footprint.reads_word(0x40 / 8));
    }

    #[test]
    fn arch_clause_observes_loaded_values() {
        let program = straight(vec![Instruction::Mov {
            dst: Operand::Reg(Reg::Rcx),
            src: Operand::Mem(Reg::Rax),
        }]);
        let mut inp = input([0x80, 0, 0, 0, 0, 0]);
        inp.memory[0x80 / 8] = 0x1234;
        let result = model(ObservationClause::Arch, ExecutionClause::Seq).run(&program, &inp);
        assert_eq!(
            result.trace,
            vec![
                Observation::Pc(0),
                Observation::Addr(0x80),
                Observation::Value(0x1234),
            ]
        );
    }

    #[test]
    fn l1d_and_ctr_clauses() {
        let program = straight(vec![Instruction::Mov {
            dst: Operand::Reg(Reg::Rcx),
            src: Operand::Mem(Reg::Rax),
        }]);
        let inp = input([0x7C0, 1, 2, 3, 4, 5]);

        let l1d = model(ObservationClause::L1d, ExecutionClause::Seq).run(&program, &inp);
        assert_eq!(l1d.trace, vec![Observation::CacheSet(31)]);
        assert_eq!(l1d.touched_sets, 1 << 31);

        let ctr = model(ObservationClause::Ctr, ExecutionClause::Seq).run(&program, &inp);
        assert_eq!(ctr.trace[0], Observation::Reg(0x7C0));
        assert_eq!(ctr.trace.len(), 6 + 2);
    }

    #[test]
    fn overwritten_registers_are_not_footprint() {
        // mov rax, 0x40; mov rbx, [rax]
        let program = straight(vec![
            Instruction::Mov {
                dst: Operand::Reg(Reg::Rax),
                src: Operand::Imm(0x40),
            },
            Instruction::Mov {
                dst: Operand::Reg(Reg::Rbx),
                src: Operand::Mem(Reg::Rax),
            },
        ]);
        let result = model(ObservationClause::Ct, ExecutionClause::Seq)
            .run(&program, &input([0x1000, 0, 0, 0, 0, 0]));
        assert!(!result.footprint.reads_reg(Reg::Rax));
        assert!(!result.footprint.reads_reg(Reg::Rbx));
        assert!(result.footprint.reads_word(8));
        assert!(!result.footprint.flags);
    }

    #[test]
    fn null_injection_on_faulty_page() {
        let layout = SandboxLayout::new(true);
        // mov rbx, [rax]; mov rcx, [rbx]
        let mut program = straight(vec![
            Instruction::Mov {
                dst: Operand::Reg(Reg::Rbx),
                src: Operand::Mem(Reg::Rax),
            },
            Instruction::Mov {
                dst: Operand::Reg(Reg::Rcx),
                src: Operand::Mem(Reg::Rbx),
            },
        ]);
        program.layout = layout;
        let inp = input([0x1040, 0, 0, 0, 0, 0]);

        let contract = |execution| Contract {
            observation: ObservationClause::Mem,
            execution,
        };

        let seq = ContractModel::new(contract(ExecutionClause::Seq), layout, 250, 1);
        let result = seq.run(&program, &inp);
        assert!(result.faulted);
        assert_eq!(result.trace, vec![Observation::Addr(0x1040)]);

        // The faulting load speculatively returns zero and the dependent
        // access goes to offset 0
        let null = ContractModel::new(contract(ExecutionClause::NullInjection), layout, 250, 1);
        let result = null.run(&program, &inp);
        assert!(result.faulted);
        assert_eq!(
            result.trace,
            vec![
                Observation::Addr(0x1040),
                Observation::Addr(0x1040),
                Observation::Addr(0),
            ]
        );
        assert_eq!(result.spec_observations, 2);
    }

    #[test]
    fn delayed_fault_holds_back_dependents() {
        let layout = SandboxLayout::new(true);
        let load = |dst, base| Instruction::Mov {
            dst: Operand::Reg(dst),
            src: Operand::Mem(base),
        };
        let mut program = straight(vec![
            // Faults, rcx now waits on it
            load(Reg::Rcx, Reg::Rax),
            // Independent, runs
            load(Reg::Rdx, Reg::Rbx),
            // Depends on rcx, held back and rsi waits too
            load(Reg::Rsi, Reg::Rcx),
            // rcx gets a fresh value and is free again
            Instruction::Mov {
                dst: Operand::Reg(Reg::Rcx),
                src: Operand::Reg(Reg::Rbx),
            },
            load(Reg::Rdi, Reg::Rcx),
            // Flags come from the held back rsi
            Instruction::Binary {
                op: BinaryOp::Cmp,
                dst: Operand::Reg(Reg::Rsi),
                src: Operand::Imm(0),
            },
            Instruction::Setcc {
                cond: Cond::E,
                dst: Reg::Rdx,
            },
            load(Reg::Rax, Reg::Rdx),
        ]);
        program.layout = layout;
        let inp = input([0x1040, 0x80, 0, 0, 0, 0]);

        let contract = |execution| Contract {
            observation: ObservationClause::Mem,
            execution,
        };

        let seq = ContractModel::new(contract(ExecutionClause::Seq), layout, 250, 1);
        assert_eq!(seq.run(&program, &inp).trace, vec![Observation::Addr(0x1040)]);

        let delayed = ContractModel::new(contract(ExecutionClause::DelayedExceptions), layout, 250, 1);
        let result = delayed.run(&program, &inp);
        assert!(result.faulted);
        assert_eq!(
            result.trace,
            vec![
                Observation::Addr(0x1040),
                Observation::Addr(0x80),
                Observation::Addr(0x80),
            ]
        );
        assert_eq!(result.spec_observations, 2);

        // Without nesting room the fault just ends the run
        let flat = ContractModel::new(contract(ExecutionClause::DelayedExceptions), layout, 250, 0);
        assert_eq!(flat.run(&program, &inp).trace, vec![Observation::Addr(0x1040)]);
    }

    #[test]
    fn fault_clauses_need_the_faulty_page() {
        assert!(ExecutionClause::NullInjection.needs_faulty_page());
        assert!(ExecutionClause::DelayedExceptions.needs_faulty_page());
        assert!(!ExecutionClause::CondBpas.needs_faulty_page());
        assert_eq!(
            ExecutionClause::from_name("delayed-exception-handling"),
            Some(ExecutionClause::DelayedExceptions)
        );
    }

    #[test]
    fn nested_speculation_is_bounded() {
        // Two branches in a row. The first is taken, so its misprediction
        // falls into the second, which only mispredicts again with nesting 2
        let program = TestProgram {
            seed: 0,
            layout: SandboxLayout::default(),
            blocks: vec![
                BasicBlock {
                    instructions: vec![],
                    terminator: Terminator::CondJump {
                        cond: Cond::Ne,
                        target: 2,
                    },
                },
                BasicBlock {
                    instructions: vec![],
                    terminator: Terminator::CondJump {
                        cond: Cond::Ne,
                        target: 3,
                    },
                },
                BasicBlock {
                    instructions: vec![Instruction::Mov {
                        dst: Operand::Reg(Reg::Rcx),
                        src: Operand::Mem(Reg::Rax),
                    }],
                    terminator: Terminator::FallThrough,
                },
            ],
        };
        let inp = input([0x40, 0, 0, 0, 0, 0]);
        let run = |nesting| {
            ContractModel::new(
                Contract {
                    observation: ObservationClause::Ct,
                    execution: ExecutionClause::Cond,
                },
                SandboxLayout::default(),
                250,
                nesting,
            )
            .run(&program, &inp)
        };

        let flat = run(1);
        let nested = run(2);
        assert!(nested.spec_observations > flat.spec_observations);
        assert_eq!(
            flat.trace.len() - flat.spec_observations,
            nested.trace.len() - nested.spec_observations
        );
    }
}
