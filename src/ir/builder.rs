//! Program assembly with forward labels.

use crate::callhandle::{CallId, HandleTable};
use crate::error::{CompileError, ErrorCode};

use super::{Cond, FRAME_SLOTS, Job, Op, Program, Reg, Target, Width};

/// A branch destination. May be referenced before it is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Emits instructions into a flat list. Branch operands hold label ids until
/// [`Builder::build`] rewrites them to instruction indices.
pub struct Builder<'h> {
    name: String,
    job: Job,
    ops: Vec<Op>,
    labels: Vec<Option<u32>>,
    handles: &'h HandleTable,
}

impl<'h> Builder<'h> {
    pub fn new(name: impl Into<String>, job: Job, handles: &'h HandleTable) -> Self {
        Builder {
            name: name.into(),
            job,
            ops: Vec::new(),
            labels: Vec::new(),
            handles,
        }
    }

    pub fn job(&self) -> Job {
        self.job
    }

    pub fn handles(&self) -> &'h HandleTable {
        self.handles
    }

    /// Number of instructions emitted so far, no-ops included.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn label(&mut self) -> Label {
        let l = Label(self.labels.len() as u32);
        self.labels.push(None);
        l
    }

    /// Binds `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.ops.len() as u32);
    }

    pub fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    // ── Cursor ──

    pub fn nop(&mut self) {
        self.emit(Op::Nop);
    }

    pub fn check(&mut self, n: u32) {
        if n > 0 {
            self.emit(Op::Check { n });
        }
    }

    pub fn check_reg(&mut self, src: Reg) {
        self.emit(Op::CheckReg { src });
    }

    pub fn advance(&mut self, n: u32) {
        if n > 0 {
            self.emit(Op::Advance { n });
        }
    }

    pub fn advance_reg(&mut self, src: Reg) {
        self.emit(Op::AdvanceReg { src });
    }

    pub fn read_int(&mut self, width: Width, signed: bool, dst: Reg) {
        self.emit(Op::ReadInt { width, signed, dst });
    }

    pub fn write_imm(&mut self, width: Width, value: u64) {
        self.emit(Op::WriteImm {
            width,
            value: value & width.mask(),
        });
    }

    pub fn write_int(&mut self, width: Width, src: Reg) {
        self.emit(Op::WriteInt { width, src });
    }

    pub fn read_bytes(&mut self, dst: Reg, len: Reg) {
        self.emit(Op::ReadBytes { dst, len });
    }

    pub fn write_bytes(&mut self, src: Reg, len: Reg) {
        self.emit(Op::WriteBytes { src, len });
    }

    // ── Heap ──

    pub fn load(&mut self, width: Width, signed: bool, dst: Reg, base: Reg, off: u32) {
        self.emit(Op::Load {
            width,
            signed,
            dst,
            base,
            off,
        });
    }

    pub fn store(&mut self, width: Width, src: Reg, base: Reg, off: u32) {
        self.emit(Op::Store { width, src, base, off });
    }

    pub fn load_ptr(&mut self, dst: Reg, base: Reg, off: u32) {
        self.emit(Op::LoadPtr { dst, base, off });
    }

    pub fn store_ptr(&mut self, src: Reg, base: Reg, off: u32) {
        self.emit(Op::StorePtr { src, base, off });
    }

    pub fn seek(&mut self, dst: Reg, src: Reg, off: i32) {
        self.emit(Op::Seek { dst, src, off });
    }

    pub fn zero(&mut self, base: Reg, off: u32, len: u32) {
        if len > 0 {
            self.emit(Op::Zero { base, off, len });
        }
    }

    // ── Arithmetic ──

    pub fn mov_imm(&mut self, dst: Reg, value: u64) {
        self.emit(Op::MovImm { dst, value });
    }

    pub fn mov(&mut self, dst: Reg, src: Reg) {
        self.emit(Op::Mov { dst, src });
    }

    pub fn add(&mut self, dst: Reg, a: Reg, b: Reg) {
        self.emit(Op::Add { dst, a, b });
    }

    pub fn add_imm(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.emit(Op::AddImm { dst, src, imm });
    }

    pub fn mul_imm(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.emit(Op::MulImm { dst, src, imm });
    }

    pub fn and_imm(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.emit(Op::AndImm { dst, src, imm });
    }

    pub fn or_imm(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.emit(Op::OrImm { dst, src, imm });
    }

    // ── Traversal frames ──

    pub fn enter(&mut self) {
        self.emit(Op::Enter);
    }

    pub fn leave(&mut self) {
        self.emit(Op::Leave);
    }

    pub fn load_frame(&mut self, dst: Reg, slot: u8) {
        self.emit(Op::LoadFrame { dst, slot });
    }

    pub fn store_frame(&mut self, src: Reg, slot: u8) {
        self.emit(Op::StoreFrame { src, slot });
    }

    // ── Control flow ──

    pub fn jump(&mut self, target: Label) {
        self.emit(Op::Jump { target: target.0 });
    }

    pub fn branch_imm(&mut self, cond: Cond, a: Reg, imm: i32, target: Label) {
        self.emit(Op::BranchImm {
            cond,
            a,
            imm,
            target: target.0,
        });
    }

    pub fn branch_reg(&mut self, cond: Cond, a: Reg, b: Reg, target: Label) {
        self.emit(Op::BranchReg {
            cond,
            a,
            b,
            target: target.0,
        });
    }

    pub fn switch(&mut self, src: Reg, targets: &[Label], default: Label) {
        self.emit(Op::Switch {
            src,
            targets: targets.iter().map(|l| l.0).collect(),
            default: default.0,
        });
    }

    pub fn call(&mut self, handle: CallId, args: &[Reg], rets: &[Reg]) {
        self.emit(Op::Call {
            handle,
            args: args.to_vec(),
            rets: rets.to_vec(),
        });
    }

    pub fn error(&mut self, code: ErrorCode) {
        self.emit(Op::Error { code });
    }

    pub fn halt(&mut self) {
        self.emit(Op::Halt);
    }

    // ── Build ──

    /// Resolves labels, strips no-ops and verifies the result.
    ///
    /// Targets that pointed at a stripped no-op are moved to the next real
    /// instruction.
    pub fn build(self) -> Result<Program, CompileError> {
        let Builder {
            name,
            job,
            mut ops,
            labels,
            handles,
        } = self;

        let resolve = |label: Target| -> Result<Target, CompileError> {
            match labels.get(label as usize) {
                Some(Some(index)) => Ok(*index),
                _ => Err(CompileError::UnresolvedLabel(label)),
            }
        };
        for op in ops.iter_mut() {
            let mut failed = None;
            op.map_targets(|label| match resolve(label) {
                Ok(index) => index,
                Err(e) => {
                    failed.get_or_insert(e);
                    label
                }
            });
            if let Some(e) = failed {
                return Err(e);
            }
        }

        let program = compact(Program { name, job, ops })?;
        verify(&program, handles)?;
        Ok(program)
    }
}

/// Removes every `Nop`, redirecting targets to the next surviving instruction.
pub(crate) fn compact(program: Program) -> Result<Program, CompileError> {
    let Program { name, job, ops } = program;
    let n = ops.len();

    // remap[i] = new index of the first non-nop at or after i.
    let mut remap = vec![0u32; n + 1];
    let mut next = ops.iter().filter(|op| !matches!(op, Op::Nop)).count() as u32;
    remap[n] = next;
    for i in (0..n).rev() {
        if !matches!(ops[i], Op::Nop) {
            next -= 1;
        }
        remap[i] = next;
    }

    let kept = remap[n];
    let mut out = Vec::with_capacity(kept as usize);
    for mut op in ops.into_iter().filter(|op| !matches!(op, Op::Nop)) {
        let mut dangling = None;
        op.map_targets(|t| {
            let mapped = remap.get(t as usize).copied().unwrap_or(kept);
            if mapped >= kept {
                dangling = Some(t);
            }
            mapped
        });
        if let Some(t) = dangling {
            return Err(CompileError::Malformed(format!(
                "branch target @{t} falls off the end"
            )));
        }
        out.push(op);
    }

    Ok(Program { name, job, ops: out })
}

/// Structural checks every built program satisfies.
pub(crate) fn verify(program: &Program, handles: &HandleTable) -> Result<(), CompileError> {
    match program.ops.last() {
        Some(Op::Halt) => {}
        _ => return Err(CompileError::MissingHalt),
    }
    let halts = program.ops.iter().filter(|op| matches!(op, Op::Halt)).count();
    if halts != 1 {
        return Err(CompileError::Malformed(format!("{halts} halt instructions")));
    }

    for (i, op) in program.ops.iter().enumerate() {
        let bad = |what: &str| CompileError::Malformed(format!("@{i} `{op}`: {what}"));
        match op {
            Op::Nop => return Err(bad("no-op survived build")),
            Op::Load { base, .. }
            | Op::Store { base, .. }
            | Op::LoadPtr { base, .. }
            | Op::Zero { base, .. }
                if !base.is_ptr() =>
            {
                return Err(bad("base must be a pointer register"));
            }
            Op::StorePtr { src, base, .. } if !src.is_ptr() || !base.is_ptr() => {
                return Err(bad("pointer store needs pointer registers"));
            }
            Op::LoadPtr { dst, .. } | Op::Seek { dst, .. } if !dst.is_ptr() => {
                return Err(bad("destination must be a pointer register"));
            }
            Op::ReadBytes { dst: p, .. } | Op::WriteBytes { src: p, .. } if !p.is_ptr() => {
                return Err(bad("byte copies address the heap through a pointer register"));
            }
            Op::LoadFrame { slot, .. } | Op::StoreFrame { slot, .. } if *slot >= FRAME_SLOTS => {
                return Err(bad("frame slot out of range"));
            }
            Op::Call { handle, args, rets } => {
                handles.resolve(*handle)?.verify(args, rets)?;
            }
            _ => {}
        }
        for t in op.targets() {
            if t as usize >= program.ops.len() {
                return Err(bad("target out of range"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    #[test]
    fn forward_labels_resolve_past_stripped_nops() {
        let handles = runtime::builtin_handles();
        let mut b = Builder::new("t", Job::Decode, &handles);
        let done = b.label();
        b.mov_imm(Reg::R0, 1);
        b.branch_imm(Cond::Eq, Reg::R0, 1, done);
        b.mov_imm(Reg::R0, 2);
        b.bind(done);
        b.nop();
        b.nop();
        b.halt();
        let p = b.build().unwrap();
        assert_eq!(p.ops.len(), 4);
        assert!(matches!(p.ops[1], Op::BranchImm { target: 3, .. }));
        assert!(matches!(p.ops[3], Op::Halt));
    }

    #[test]
    fn undefined_label_fails() {
        let handles = runtime::builtin_handles();
        let mut b = Builder::new("t", Job::Decode, &handles);
        let nowhere = b.label();
        b.jump(nowhere);
        b.halt();
        assert_eq!(b.build(), Err(CompileError::UnresolvedLabel(0)));
    }

    #[test]
    fn missing_or_extra_halt_fails() {
        let handles = runtime::builtin_handles();
        let mut b = Builder::new("t", Job::Encode, &handles);
        b.advance(1);
        assert_eq!(b.build(), Err(CompileError::MissingHalt));

        let mut b = Builder::new("t", Job::Encode, &handles);
        b.halt();
        b.halt();
        assert!(matches!(b.build(), Err(CompileError::Malformed(_))));
    }

    #[test]
    fn call_signatures_are_verified() {
        let handles = runtime::builtin_handles();
        let mut b = Builder::new("t", Job::Decode, &handles);
        b.call(runtime::ALLOC, &[Reg::P0], &[Reg::P1]);
        b.halt();
        assert!(matches!(b.build(), Err(CompileError::SignatureMismatch { .. })));

        let mut b = Builder::new("t", Job::Decode, &handles);
        b.call(CallId(999), &[], &[]);
        b.halt();
        assert_eq!(b.build(), Err(CompileError::UnresolvedCall(999)));
    }

    #[test]
    fn switch_arms_are_all_resolved() {
        let handles = runtime::builtin_handles();
        let mut b = Builder::new("t", Job::Decode, &handles);
        let (a, c, d) = (b.label(), b.label(), b.label());
        b.mov_imm(Reg::R0, 1);
        b.switch(Reg::R0, &[a, c], d);
        b.bind(a);
        b.nop();
        b.bind(c);
        b.bind(d);
        b.halt();
        let p = b.build().unwrap();
        assert_eq!(p.ops[1].targets(), vec![2, 2, 2]);
    }
}
