//! Linear register IR shared by the optimizer, the native backend and the emulator.
//!
//! A program runs against one call context: a byte cursor `pos` into the
//! wire buffer, the value heap, a stack of traversal frames and a bank of
//! virtual registers. Wire integers are big-endian; heap integers are
//! little-endian. The IR's read/write ops perform the swap.

use std::fmt;

use strum::{EnumCount, EnumDiscriminants, EnumIter, IntoStaticStr};

use crate::callhandle::CallId;
use crate::error::ErrorCode;

pub mod builder;

pub use builder::{Builder, Label};

// ─── Registers ──────────────────────────────────────────────────────────────

/// Number of generic virtual registers.
pub const GENERIC_REGS: u8 = 9;
/// Number of pointer virtual registers.
pub const POINTER_REGS: u8 = 10;

/// A virtual register. Generic registers hold integers, pointer registers hold
/// heap offsets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(u8);

impl Reg {
    pub const COUNT: usize = (GENERIC_REGS + POINTER_REGS) as usize;

    pub const R0: Reg = Reg(0);
    pub const R1: Reg = Reg(1);
    pub const R2: Reg = Reg(2);
    pub const R3: Reg = Reg(3);
    pub const R4: Reg = Reg(4);
    pub const R5: Reg = Reg(5);
    pub const R6: Reg = Reg(6);
    pub const R7: Reg = Reg(7);
    pub const R8: Reg = Reg(8);

    pub const P0: Reg = Reg(GENERIC_REGS);
    pub const P1: Reg = Reg(GENERIC_REGS + 1);
    pub const P2: Reg = Reg(GENERIC_REGS + 2);
    pub const P3: Reg = Reg(GENERIC_REGS + 3);
    pub const P4: Reg = Reg(GENERIC_REGS + 4);
    pub const P5: Reg = Reg(GENERIC_REGS + 5);
    pub const P6: Reg = Reg(GENERIC_REGS + 6);
    pub const P7: Reg = Reg(GENERIC_REGS + 7);
    pub const P8: Reg = Reg(GENERIC_REGS + 8);
    pub const P9: Reg = Reg(GENERIC_REGS + 9);

    pub fn generic(n: u8) -> Option<Reg> {
        (n < GENERIC_REGS).then_some(Reg(n))
    }

    pub fn pointer(n: u8) -> Option<Reg> {
        (n < POINTER_REGS).then_some(Reg(GENERIC_REGS + n))
    }

    pub fn is_ptr(self) -> bool {
        self.0 >= GENERIC_REGS
    }

    /// Dense index over all registers, generic first.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(i: usize) -> Option<Reg> {
        (i < Self::COUNT).then_some(Reg(i as u8))
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ptr() {
            write!(f, "p{}", self.0 - GENERIC_REGS)
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

// ─── Operands ───────────────────────────────────────────────────────────────

/// Width of a memory or wire access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W1,
    W2,
    W4,
    W8,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::W1 => 1,
            Width::W2 => 2,
            Width::W4 => 4,
            Width::W8 => 8,
        }
    }

    pub fn from_bytes(n: u32) -> Option<Width> {
        match n {
            1 => Some(Width::W1),
            2 => Some(Width::W2),
            4 => Some(Width::W4),
            8 => Some(Width::W8),
            _ => None,
        }
    }

    /// Mask selecting the low `bytes()` bytes of a word.
    pub fn mask(self) -> u64 {
        match self {
            Width::W8 => u64::MAX,
            w => (1u64 << (w.bytes() * 8)) - 1,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes() * 8)
    }
}

/// Branch condition over 64-bit operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    /// Signed comparisons.
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned comparisons.
    Below,
    AboveEq,
}

impl Cond {
    pub fn eval(self, a: u64, b: u64) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => (a as i64) < (b as i64),
            Cond::Le => (a as i64) <= (b as i64),
            Cond::Gt => (a as i64) > (b as i64),
            Cond::Ge => (a as i64) >= (b as i64),
            Cond::Below => a < b,
            Cond::AboveEq => a >= b,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Le => "le",
            Cond::Gt => "gt",
            Cond::Ge => "ge",
            Cond::Below => "b",
            Cond::AboveEq => "ae",
        }
    }
}

/// Branch target: a label id while building, an instruction index once built.
pub type Target = u32;

/// Which of the three codecs a program implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Job {
    /// Counts encoded bytes in the cursor without writing.
    Measure = 0,
    Encode = 1,
    Decode = 2,
}

impl Job {
    /// Error reported when a buffer check fails.
    pub fn eof_code(self) -> ErrorCode {
        match self {
            Job::Decode => ErrorCode::UnexpectedEof,
            Job::Measure | Job::Encode => ErrorCode::BufferTooSmall,
        }
    }

    pub fn from_raw(raw: u64) -> Option<Job> {
        match raw {
            0 => Some(Job::Measure),
            1 => Some(Job::Encode),
            2 => Some(Job::Decode),
            _ => None,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Job::Measure => "measure",
            Job::Encode => "encode",
            Job::Decode => "decode",
        })
    }
}

// ─── Instructions ───────────────────────────────────────────────────────────

/// Number of 8-byte slots in one traversal frame.
pub const FRAME_SLOTS: u8 = 8;

#[derive(Debug, Clone, PartialEq, EnumDiscriminants)]
#[strum_discriminants(name(Opcode), derive(EnumCount, EnumIter, IntoStaticStr, Hash))]
pub enum Op {
    Nop,

    // ── Cursor ──
    /// Fails with the job's end-of-buffer error unless `n` bytes remain.
    Check { n: u32 },
    CheckReg { src: Reg },
    Advance { n: u32 },
    AdvanceReg { src: Reg },
    /// Big-endian read at the cursor, then advance.
    ReadInt { width: Width, signed: bool, dst: Reg },
    /// Big-endian write at the cursor, then advance.
    WriteImm { width: Width, value: u64 },
    WriteInt { width: Width, src: Reg },
    /// Copies `len` wire bytes into the heap at `dst`, then advances.
    ReadBytes { dst: Reg, len: Reg },
    /// Copies `len` heap bytes at `src` to the wire, then advances.
    WriteBytes { src: Reg, len: Reg },

    // ── Heap ──
    Load { width: Width, signed: bool, dst: Reg, base: Reg, off: u32 },
    Store { width: Width, src: Reg, base: Reg, off: u32 },
    /// Loads a 4-byte heap pointer.
    LoadPtr { dst: Reg, base: Reg, off: u32 },
    /// Stores a 4-byte heap pointer through the write barrier.
    StorePtr { src: Reg, base: Reg, off: u32 },
    Seek { dst: Reg, src: Reg, off: i32 },
    Zero { base: Reg, off: u32, len: u32 },

    // ── Arithmetic ──
    MovImm { dst: Reg, value: u64 },
    Mov { dst: Reg, src: Reg },
    Add { dst: Reg, a: Reg, b: Reg },
    AddImm { dst: Reg, src: Reg, imm: i32 },
    MulImm { dst: Reg, src: Reg, imm: i32 },
    AndImm { dst: Reg, src: Reg, imm: i32 },
    OrImm { dst: Reg, src: Reg, imm: i32 },

    // ── Traversal frames ──
    /// Pushes a frame; fails with `NestingOverflow` past the nesting cap.
    Enter,
    Leave,
    LoadFrame { dst: Reg, slot: u8 },
    StoreFrame { src: Reg, slot: u8 },

    // ── Control flow ──
    Jump { target: Target },
    BranchImm { cond: Cond, a: Reg, imm: i32, target: Target },
    BranchReg { cond: Cond, a: Reg, b: Reg, target: Target },
    /// Jumps to `targets[src]`, or `default` when `src` is out of range.
    Switch { src: Reg, targets: Vec<Target>, default: Target },
    Call { handle: CallId, args: Vec<Reg>, rets: Vec<Reg> },
    Error { code: ErrorCode },
    Halt,
}

impl Op {
    pub fn opcode(&self) -> Opcode {
        Opcode::from(self)
    }

    /// Every branch target this instruction may transfer control to.
    pub fn targets(&self) -> Vec<Target> {
        match self {
            Op::Jump { target } | Op::BranchImm { target, .. } | Op::BranchReg { target, .. } => {
                vec![*target]
            }
            Op::Switch { targets, default, .. } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            _ => Vec::new(),
        }
    }

    pub fn map_targets(&mut self, mut f: impl FnMut(Target) -> Target) {
        match self {
            Op::Jump { target } | Op::BranchImm { target, .. } | Op::BranchReg { target, .. } => {
                *target = f(*target);
            }
            Op::Switch { targets, default, .. } => {
                for t in targets.iter_mut() {
                    *t = f(*t);
                }
                *default = f(*default);
            }
            _ => {}
        }
    }

    /// Ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Jump { .. }
                | Op::BranchImm { .. }
                | Op::BranchReg { .. }
                | Op::Switch { .. }
                | Op::Error { .. }
                | Op::Halt
        )
    }

    /// Control may continue to the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Op::Jump { .. } | Op::Switch { .. } | Op::Error { .. } | Op::Halt
        )
    }

    /// Registers read by this instruction.
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Op::CheckReg { src } | Op::AdvanceReg { src } | Op::WriteInt { src, .. } => vec![*src],
            Op::ReadBytes { dst, len } => vec![*dst, *len],
            Op::WriteBytes { src, len } => vec![*src, *len],
            Op::Load { base, .. } | Op::LoadPtr { base, .. } | Op::Zero { base, .. } => vec![*base],
            Op::Store { src, base, .. } | Op::StorePtr { src, base, .. } => vec![*src, *base],
            Op::Seek { src, .. }
            | Op::Mov { src, .. }
            | Op::AddImm { src, .. }
            | Op::MulImm { src, .. }
            | Op::AndImm { src, .. }
            | Op::OrImm { src, .. }
            | Op::StoreFrame { src, .. } => vec![*src],
            Op::Add { a, b, .. } | Op::BranchReg { a, b, .. } => vec![*a, *b],
            Op::BranchImm { a, .. } => vec![*a],
            Op::Switch { src, .. } => vec![*src],
            Op::Call { args, .. } => args.clone(),
            _ => Vec::new(),
        }
    }

    /// Registers written by this instruction.
    pub fn defs(&self) -> Vec<Reg> {
        match self {
            Op::ReadInt { dst, .. }
            | Op::Load { dst, .. }
            | Op::LoadPtr { dst, .. }
            | Op::Seek { dst, .. }
            | Op::MovImm { dst, .. }
            | Op::Mov { dst, .. }
            | Op::Add { dst, .. }
            | Op::AddImm { dst, .. }
            | Op::MulImm { dst, .. }
            | Op::AndImm { dst, .. }
            | Op::OrImm { dst, .. }
            | Op::LoadFrame { dst, .. } => vec![*dst],
            Op::Call { rets, .. } => rets.clone(),
            _ => Vec::new(),
        }
    }

    /// Wire bytes consumed or produced, when that is a compile-time constant.
    pub fn fixed_cursor_delta(&self) -> Option<u32> {
        match self {
            Op::Advance { n } => Some(*n),
            Op::ReadInt { width, .. } | Op::WriteImm { width, .. } | Op::WriteInt { width, .. } => {
                Some(width.bytes())
            }
            _ => None,
        }
    }
}

impl Opcode {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

// ─── Program ────────────────────────────────────────────────────────────────

/// A built program: labels resolved, no-ops stripped, exactly one `Halt`, last.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub job: Job,
    pub ops: Vec<Op>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Instruction indices that are the target of some branch.
    pub fn branch_targets(&self) -> Vec<bool> {
        let mut is_target = vec![false; self.ops.len()];
        for op in &self.ops {
            for t in op.targets() {
                if let Some(slot) = is_target.get_mut(t as usize) {
                    *slot = true;
                }
            }
        }
        is_target
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}:", self.job, self.name)?;
        for (i, op) in self.ops.iter().enumerate() {
            writeln!(f, "  {i:>3}: {op}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Nop => write!(f, "nop"),
            Op::Check { n } => write!(f, "check {n}"),
            Op::CheckReg { src } => write!(f, "check {src}"),
            Op::Advance { n } => write!(f, "advance {n}"),
            Op::AdvanceReg { src } => write!(f, "advance {src}"),
            Op::ReadInt { width, signed, dst } => {
                let s = if *signed { "s" } else { "u" };
                write!(f, "{dst} = read.{s}{width}")
            }
            Op::WriteImm { width, value } => write!(f, "write.{width} {value:#x}"),
            Op::WriteInt { width, src } => write!(f, "write.{width} {src}"),
            Op::ReadBytes { dst, len } => write!(f, "read_bytes [{dst}], {len}"),
            Op::WriteBytes { src, len } => write!(f, "write_bytes [{src}], {len}"),
            Op::Load { width, signed, dst, base, off } => {
                let s = if *signed { "s" } else { "u" };
                write!(f, "{dst} = load.{s}{width} [{base}+{off}]")
            }
            Op::Store { width, src, base, off } => write!(f, "store.{width} [{base}+{off}], {src}"),
            Op::LoadPtr { dst, base, off } => write!(f, "{dst} = load_ptr [{base}+{off}]"),
            Op::StorePtr { src, base, off } => write!(f, "store_ptr [{base}+{off}], {src}"),
            Op::Seek { dst, src, off } => write!(f, "{dst} = seek {src}, {off}"),
            Op::Zero { base, off, len } => write!(f, "zero [{base}+{off}], {len}"),
            Op::MovImm { dst, value } => write!(f, "{dst} = {value:#x}"),
            Op::Mov { dst, src } => write!(f, "{dst} = {src}"),
            Op::Add { dst, a, b } => write!(f, "{dst} = add {a}, {b}"),
            Op::AddImm { dst, src, imm } => write!(f, "{dst} = add {src}, {imm}"),
            Op::MulImm { dst, src, imm } => write!(f, "{dst} = mul {src}, {imm}"),
            Op::AndImm { dst, src, imm } => write!(f, "{dst} = and {src}, {imm:#x}"),
            Op::OrImm { dst, src, imm } => write!(f, "{dst} = or {src}, {imm:#x}"),
            Op::Enter => write!(f, "enter"),
            Op::Leave => write!(f, "leave"),
            Op::LoadFrame { dst, slot } => write!(f, "{dst} = frame[{slot}]"),
            Op::StoreFrame { src, slot } => write!(f, "frame[{slot}] = {src}"),
            Op::Jump { target } => write!(f, "jmp @{target}"),
            Op::BranchImm { cond, a, imm, target } => {
                write!(f, "b{} {a}, {imm}, @{target}", cond.mnemonic())
            }
            Op::BranchReg { cond, a, b, target } => {
                write!(f, "b{} {a}, {b}, @{target}", cond.mnemonic())
            }
            Op::Switch { src, targets, default } => {
                write!(f, "switch {src} [")?;
                for (i, t) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "@{t}")?;
                }
                write!(f, "] else @{default}")
            }
            Op::Call { handle, args, rets } => {
                for (i, r) in rets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{r}")?;
                }
                if !rets.is_empty() {
                    write!(f, " = ")?;
                }
                write!(f, "call #{}(", handle.0)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Op::Error { code } => write!(f, "error {code:?}"),
            Op::Halt => write!(f, "halt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn register_classes() {
        assert!(!Reg::R8.is_ptr());
        assert!(Reg::P0.is_ptr());
        assert_eq!(Reg::P9.index(), Reg::COUNT - 1);
        assert_eq!(Reg::generic(9), None);
        assert_eq!(Reg::pointer(3), Some(Reg::P3));
        assert_eq!(Reg::P3.to_string(), "p3");
    }

    #[test]
    fn opcode_table_is_dense() {
        for (i, opcode) in Opcode::iter().enumerate() {
            assert_eq!(opcode as usize, i);
        }
        assert_eq!(Opcode::iter().count(), Opcode::COUNT);
        assert_eq!(Op::Halt.opcode().name(), "Halt");
    }

    #[test]
    fn switch_lists_every_arm() {
        let op = Op::Switch {
            src: Reg::R0,
            targets: vec![3, 5],
            default: 9,
        };
        assert_eq!(op.targets(), vec![3, 5, 9]);
        assert!(op.is_terminator());
        assert!(!op.falls_through());
    }

    #[test]
    fn width_masks() {
        assert_eq!(Width::W2.mask(), 0xffff);
        assert_eq!(Width::W8.mask(), u64::MAX);
        assert_eq!(Width::from_bytes(3), None);
    }

    #[test]
    fn cond_signedness() {
        assert!(Cond::Lt.eval(-1i64 as u64, 0));
        assert!(!Cond::Below.eval(-1i64 as u64, 0));
    }
}
