use dynasmrt::x64::X64Relocation;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, VecAssembler, dynasm};

use crate::barrier::{self, WRITE_BARRIER_SLOT};
use crate::callhandle::{ArgLoc, CallFlags, CallKind, HandleTable};
use crate::error::{CompileError, ErrorCode};
use crate::ir::{Cond, Job, Op, Program, Reg, Width};
use crate::regalloc::{Allocation, Location, PhysReg};
use crate::runtime::{
    self, CTX_BUF, CTX_BUF_LEN, CTX_ERROR_CODE, CTX_ERROR_OFFSET, CTX_HEAP_BASE, CTX_POS, CTX_ROOT,
    CTX_SINK_DATA, CTX_SINK_VTABLE, CTX_STACK, CTX_STACK_LIMIT, FRAME_BYTES,
};

// Register assignments (System V AMD64 ABI):
//   r15 = call context
//   r14 = heap base
//   r13 = wire cursor (`pos`)
//   r12 = wire buffer
//   rbx = current traversal frame
//   rbp, rsi, rdi, r8, r9, r10 = virtual registers (see regalloc)
//
// Scratch: rax, rcx, rdx, r11.

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;

/// System V integer argument registers.
const ARG_REGS: [u8; 6] = [7, 6, 2, 1, 8, 9];

/// Bytes pushed by the prologue: rbx, rbp, r12..r15.
const PUSHED: u32 = 6 * 8;

/// Largest block zeroed inline.
const INLINE_ZERO_MAX: u32 = 64;

/// Stack frame below the pushed registers:
///
/// ```text
/// rsp + 0           outgoing stack arguments
/// rsp + save_base   caller-saved virtual registers across calls
/// rsp + spill_base  spill slots
/// ```
#[derive(Debug, Clone, Copy)]
pub(super) struct Frame {
    save_base: i32,
    spill_base: i32,
    /// Bytes subtracted from rsp after the pushes.
    pub size: u32,
}

impl Frame {
    fn new(out_args: u32, spills: u32) -> Frame {
        let save_base = out_args.next_multiple_of(16);
        let spill_base = save_base + PhysReg::ALL.len() as u32 * 8;
        let content = spill_base + spills * 8;
        // Entry rsp is 8 mod 16; the pushes keep it there.
        let size = content.next_multiple_of(16) + 8;
        debug_assert_eq!((size + PUSHED + 8) % 16, 0);
        Frame {
            save_base: save_base as i32,
            spill_base: spill_base as i32,
            size,
        }
    }

    fn spill(&self, slot: u32) -> i32 {
        self.spill_base + slot as i32 * 8
    }

    fn save(&self, p: PhysReg) -> i32 {
        self.save_base + p.index() as i32 * 8
    }
}

/// Where a virtual register lives while a call is being set up.
#[derive(Clone, Copy)]
enum Home {
    Reg(u8),
    Stack(i32),
}

/// How to materialize one call argument.
#[derive(Clone, Copy)]
enum ArgSrc {
    Ctx,
    SinkData,
    Vreg(Reg),
    /// `vreg + off`
    Plus(Reg, u32),
    /// Absolute address of heap offset `vreg + off`.
    HeapAddr(Reg, u32),
    /// The 4-byte heap pointer stored at `vreg + off`.
    HeapU32(Reg, u32),
    /// Absolute address of the wire cursor.
    Wire,
    Imm(u64),
}

enum Callee {
    Func(usize),
    Method(u32),
}

/// Emission context: the assembler plus per-function bookkeeping.
pub(super) struct EmitCtx<'a> {
    ops: VecAssembler<X64Relocation>,
    alloc: &'a Allocation,
    handles: &'a HandleTable,
    job: Job,
    frame: Frame,
    /// One label per instruction.
    labels: Vec<DynamicLabel>,
    error_exit: DynamicLabel,
    fail_exits: Vec<(ErrorCode, DynamicLabel)>,
}

impl<'a> EmitCtx<'a> {
    pub(super) fn new(program: &Program, alloc: &'a Allocation, handles: &'a HandleTable) -> Result<Self, CompileError> {
        let mut out_args = 0;
        for op in &program.ops {
            if let Op::Call { handle, .. } = op
                && let CallKind::Host { abi, .. } = &handles.resolve(*handle)?.kind
            {
                out_args = out_args.max(abi.stack_bytes);
            }
        }
        let mut ops = VecAssembler::new(0);
        let error_exit = ops.new_dynamic_label();
        let labels = (0..program.len()).map(|_| ops.new_dynamic_label()).collect();
        Ok(EmitCtx {
            ops,
            alloc,
            handles,
            job: program.job,
            frame: Frame::new(out_args, alloc.spill_slots),
            labels,
            error_exit,
            fail_exits: Vec::new(),
        })
    }

    pub(super) fn frame_size(&self) -> u32 {
        self.frame.size
    }

    pub(super) fn finish(self) -> Result<Vec<u8>, CompileError> {
        self.ops.finalize().map_err(|e| CompileError::Emit(e.to_string()))
    }

    // ─── Prologue / epilogue ────────────────────────────────────────────────

    /// `extern "C" fn(ctx: *mut CallContext)`.
    pub(super) fn begin_func(&mut self) {
        let frame = self.frame.size as i32;
        dynasm!(self.ops
            ; .arch x64
            ; push rbx
            ; push rbp
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, frame
            ; mov r15, rdi
            ; mov r12, [r15 + CTX_BUF]
            ; mov r13, [r15 + CTX_POS]
            ; mov r14, [r15 + CTX_HEAP_BASE]
            ; mov rbx, [r15 + CTX_STACK]
            ; xor eax, eax
        );
        let allocated: Vec<_> = self.alloc.iter().collect();
        for (r, _) in &allocated {
            if *r != Reg::P0 {
                self.put(*r, RAX);
            }
        }
        dynasm!(self.ops
            ; .arch x64
            ; mov rax, [r15 + CTX_ROOT]
        );
        self.put(Reg::P0, RAX);
    }

    fn epilogue(&mut self) {
        let frame = self.frame.size as i32;
        let error_exit = self.error_exit;
        dynasm!(self.ops
            ; .arch x64
            ; mov [r15 + CTX_POS], r13
            ; mov [r15 + CTX_STACK], rbx
            ; =>error_exit
            ; add rsp, frame
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbp
            ; pop rbx
            ; ret
        );
    }

    /// Error stubs: record the code and the cursor, then leave.
    pub(super) fn end_func(&mut self) {
        let error_exit = self.error_exit;
        for (code, label) in std::mem::take(&mut self.fail_exits) {
            let code = code as i32;
            dynasm!(self.ops
                ; .arch x64
                ; =>label
                ; mov DWORD [r15 + CTX_ERROR_CODE], code
                ; mov [r15 + CTX_ERROR_OFFSET], r13
                ; jmp =>error_exit
            );
        }
    }

    fn fail(&mut self, code: ErrorCode) -> DynamicLabel {
        if let Some((_, l)) = self.fail_exits.iter().find(|(c, _)| *c == code) {
            return *l;
        }
        let l = self.ops.new_dynamic_label();
        self.fail_exits.push((code, l));
        l
    }

    // ─── Virtual register access ────────────────────────────────────────────

    fn location(&self, r: Reg) -> Result<Location, CompileError> {
        self.alloc
            .location(r)
            .ok_or_else(|| CompileError::Malformed(format!("{r} has no location")))
    }

    /// Hardware register holding `r`, loading a spilled value into `scratch`.
    fn get(&mut self, r: Reg, scratch: u8) -> Result<u8, CompileError> {
        Ok(match self.location(r)? {
            Location::Reg(p) => p.code(),
            Location::Spill(k) => {
                let off = self.frame.spill(k);
                dynasm!(self.ops ; .arch x64 ; mov Rq(scratch), [rsp + off]);
                scratch
            }
        })
    }

    /// Loads `r` into exactly `dst`.
    fn get_into(&mut self, r: Reg, dst: u8) -> Result<(), CompileError> {
        let src = self.get(r, dst)?;
        if src != dst {
            dynasm!(self.ops ; .arch x64 ; mov Rq(dst), Rq(src));
        }
        Ok(())
    }

    /// Stores hardware register `src` into virtual register `r`.
    fn put(&mut self, r: Reg, src: u8) {
        match self.alloc.location(r) {
            Some(Location::Reg(p)) if p.code() != src => {
                dynasm!(self.ops ; .arch x64 ; mov Rq(p.code()), Rq(src));
            }
            Some(Location::Spill(k)) => {
                let off = self.frame.spill(k);
                dynasm!(self.ops ; .arch x64 ; mov [rsp + off], Rq(src));
            }
            _ => {}
        }
    }

    fn home(&self, r: Reg) -> Result<Home, CompileError> {
        Ok(match self.location(r)? {
            Location::Reg(p) if p.is_callee_saved() => Home::Reg(p.code()),
            Location::Reg(p) => Home::Stack(self.frame.save(p)),
            Location::Spill(k) => Home::Stack(self.frame.spill(k)),
        })
    }

    fn load_home(&mut self, dst: u8, r: Reg) -> Result<(), CompileError> {
        match self.home(r)? {
            Home::Reg(src) => {
                if src != dst {
                    dynasm!(self.ops ; .arch x64 ; mov Rq(dst), Rq(src));
                }
            }
            Home::Stack(off) => dynasm!(self.ops ; .arch x64 ; mov Rq(dst), [rsp + off]),
        }
        Ok(())
    }

    fn store_home(&mut self, r: Reg, src: u8) -> Result<(), CompileError> {
        match self.home(r)? {
            Home::Reg(dst) => {
                if src != dst {
                    dynasm!(self.ops ; .arch x64 ; mov Rq(dst), Rq(src));
                }
            }
            Home::Stack(off) => dynasm!(self.ops ; .arch x64 ; mov [rsp + off], Rq(src)),
        }
        Ok(())
    }

    // ─── Calls ──────────────────────────────────────────────────────────────

    fn load_arg(&mut self, dst: u8, src: ArgSrc) -> Result<(), CompileError> {
        match src {
            ArgSrc::Ctx => dynasm!(self.ops ; .arch x64 ; mov Rq(dst), r15),
            ArgSrc::SinkData => dynasm!(self.ops ; .arch x64 ; mov Rq(dst), [r15 + CTX_SINK_DATA]),
            ArgSrc::Vreg(r) => self.load_home(dst, r)?,
            ArgSrc::Plus(r, off) => {
                self.load_home(dst, r)?;
                let off = off as i32;
                if off != 0 {
                    dynasm!(self.ops ; .arch x64 ; add Rq(dst), off);
                }
            }
            ArgSrc::HeapAddr(r, off) => {
                self.load_home(dst, r)?;
                dynasm!(self.ops ; .arch x64 ; lea Rq(dst), [r14 + Rq(dst) + off as i32]);
            }
            ArgSrc::HeapU32(r, off) => {
                self.load_home(dst, r)?;
                dynasm!(self.ops ; .arch x64 ; mov Rd(dst), DWORD [r14 + Rq(dst) + off as i32]);
            }
            ArgSrc::Wire => dynasm!(self.ops ; .arch x64 ; lea Rq(dst), [r12 + r13]),
            ArgSrc::Imm(v) => {
                let v = v as i64;
                dynasm!(self.ops ; .arch x64 ; mov Rq(dst), QWORD v);
            }
        }
        Ok(())
    }

    /// Flush, save, load arguments, call, store results, restore, reload,
    /// check the error slot.
    fn emit_call(
        &mut self,
        callee: Callee,
        locs: &[ArgLoc],
        args: &[ArgSrc],
        rets: &[Reg],
        flags: CallFlags,
    ) -> Result<(), CompileError> {
        dynasm!(self.ops
            ; .arch x64
            ; mov [r15 + CTX_POS], r13
            ; mov [r15 + CTX_STACK], rbx
        );
        let saved = self.alloc.caller_saved();
        for p in &saved {
            let off = self.frame.save(*p);
            dynasm!(self.ops ; .arch x64 ; mov [rsp + off], Rq(p.code()));
        }

        // Stack arguments go through rax, so they come first.
        for (loc, src) in locs.iter().zip(args) {
            if let ArgLoc::Stack(off) = loc {
                self.load_arg(RAX, *src)?;
                let off = *off as i32;
                dynasm!(self.ops ; .arch x64 ; mov [rsp + off], rax);
            }
        }
        for (loc, src) in locs.iter().zip(args) {
            if let ArgLoc::Reg(i) = loc {
                self.load_arg(ARG_REGS[*i as usize], *src)?;
            }
        }

        match callee {
            Callee::Func(f) => {
                let f = f as i64;
                dynasm!(self.ops
                    ; .arch x64
                    ; mov rax, QWORD f
                    ; call rax
                );
            }
            Callee::Method(slot) => {
                let disp = slot as i32 * 8;
                dynasm!(self.ops
                    ; .arch x64
                    ; mov rax, [r15 + CTX_SINK_VTABLE]
                    ; call QWORD [rax + disp]
                );
            }
        }

        for (r, src) in rets.iter().zip([RAX, RDX]) {
            self.store_home(*r, src)?;
        }
        for p in &saved {
            let off = self.frame.save(*p);
            dynasm!(self.ops ; .arch x64 ; mov Rq(p.code()), [rsp + off]);
        }
        dynasm!(self.ops
            ; .arch x64
            ; mov r13, [r15 + CTX_POS]
            ; mov r14, [r15 + CTX_HEAP_BASE]
        );
        if flags.contains(CallFlags::MAY_FAIL) {
            let error_exit = self.error_exit;
            dynasm!(self.ops
                ; .arch x64
                ; cmp DWORD [r15 + CTX_ERROR_CODE], 0
                ; jne =>error_exit
            );
        }
        Ok(())
    }

    fn call_runtime(&mut self, func: usize, args: &[ArgSrc]) -> Result<(), CompileError> {
        let locs: Vec<ArgLoc> = (0..=args.len()).map(|i| ArgLoc::Reg(i as u8)).collect();
        let mut all = vec![ArgSrc::Ctx];
        all.extend_from_slice(args);
        self.emit_call(Callee::Func(func), &locs, &all, &[], CallFlags::empty())
    }

    fn emit_handle_call(&mut self, handle: crate::callhandle::CallId, args: &[Reg], rets: &[Reg]) -> Result<(), CompileError> {
        let handles = self.handles;
        let h = handles.resolve(handle)?;
        h.verify(args, rets)?;
        let flags = h.flags;
        let direct = |first: ArgSrc| {
            let locs: Vec<ArgLoc> = (0..=args.len()).map(|i| ArgLoc::Reg(i as u8)).collect();
            let mut srcs = vec![first];
            srcs.extend(args.iter().map(|r| ArgSrc::Vreg(*r)));
            (locs, srcs)
        };
        let (callee, locs, srcs) = match &h.kind {
            CallKind::Native { func } => {
                let (locs, srcs) = direct(ArgSrc::Ctx);
                (Callee::Func(*func), locs, srcs)
            }
            CallKind::Host { func, abi } => {
                let mut srcs = vec![ArgSrc::Ctx];
                srcs.extend(args.iter().map(|r| ArgSrc::Vreg(*r)));
                (Callee::Func(*func), abi.args.clone(), srcs)
            }
            CallKind::Method { slot } => {
                let (locs, srcs) = direct(ArgSrc::SinkData);
                (Callee::Method(*slot), locs, srcs)
            }
        };
        self.emit_call(callee, &locs, &srcs, rets, flags)
    }

    // ─── Instructions ───────────────────────────────────────────────────────

    fn jcc(&mut self, cond: Cond, label: DynamicLabel) {
        match cond {
            Cond::Eq => dynasm!(self.ops ; .arch x64 ; je =>label),
            Cond::Ne => dynasm!(self.ops ; .arch x64 ; jne =>label),
            Cond::Lt => dynasm!(self.ops ; .arch x64 ; jl =>label),
            Cond::Le => dynasm!(self.ops ; .arch x64 ; jle =>label),
            Cond::Gt => dynasm!(self.ops ; .arch x64 ; jg =>label),
            Cond::Ge => dynasm!(self.ops ; .arch x64 ; jge =>label),
            Cond::Below => dynasm!(self.ops ; .arch x64 ; jb =>label),
            Cond::AboveEq => dynasm!(self.ops ; .arch x64 ; jae =>label),
        }
    }

    fn target(&self, t: u32) -> Result<DynamicLabel, CompileError> {
        self.labels
            .get(t as usize)
            .copied()
            .ok_or_else(|| CompileError::Malformed(format!("target @{t} out of range")))
    }

    pub(super) fn emit_op(&mut self, index: usize, op: &Op) -> Result<(), CompileError> {
        let here = self.labels[index];
        dynasm!(self.ops ; .arch x64 ; =>here);

        match op {
            Op::Nop => {}

            Op::Check { n } => {
                let fail = self.fail(self.job.eof_code());
                let n = *n as i32;
                dynasm!(self.ops
                    ; .arch x64
                    ; lea rcx, [r13 + n]
                    ; cmp rcx, [r15 + CTX_BUF_LEN]
                    ; ja =>fail
                );
            }
            Op::CheckReg { src } => {
                let fail = self.fail(self.job.eof_code());
                let s = self.get(*src, RAX)?;
                dynasm!(self.ops
                    ; .arch x64
                    ; mov rcx, r13
                    ; add rcx, Rq(s)
                    ; jc =>fail
                    ; cmp rcx, [r15 + CTX_BUF_LEN]
                    ; ja =>fail
                );
            }
            Op::Advance { n } => {
                let n = *n as i32;
                dynasm!(self.ops ; .arch x64 ; add r13, n);
            }
            Op::AdvanceReg { src } => {
                let s = self.get(*src, RAX)?;
                dynasm!(self.ops ; .arch x64 ; add r13, Rq(s));
            }

            Op::ReadInt { width, signed, dst } => {
                match (width, signed) {
                    (Width::W1, false) => dynasm!(self.ops ; .arch x64 ; movzx eax, BYTE [r12 + r13]),
                    (Width::W1, true) => dynasm!(self.ops ; .arch x64 ; movsx rax, BYTE [r12 + r13]),
                    (Width::W2, false) => dynasm!(self.ops
                        ; .arch x64
                        ; movzx eax, WORD [r12 + r13]
                        ; rol ax, 8
                        ; movzx eax, ax
                    ),
                    (Width::W2, true) => dynasm!(self.ops
                        ; .arch x64
                        ; movzx eax, WORD [r12 + r13]
                        ; rol ax, 8
                        ; movsx rax, ax
                    ),
                    (Width::W4, false) => dynasm!(self.ops
                        ; .arch x64
                        ; mov eax, DWORD [r12 + r13]
                        ; bswap eax
                    ),
                    (Width::W4, true) => dynasm!(self.ops
                        ; .arch x64
                        ; mov eax, DWORD [r12 + r13]
                        ; bswap eax
                        ; movsxd rax, eax
                    ),
                    (Width::W8, _) => dynasm!(self.ops
                        ; .arch x64
                        ; mov rax, QWORD [r12 + r13]
                        ; bswap rax
                    ),
                }
                let n = width.bytes() as i32;
                dynasm!(self.ops ; .arch x64 ; add r13, n);
                self.put(*dst, RAX);
            }
            Op::WriteImm { width, value } => {
                match width {
                    Width::W1 => {
                        let v = *value as u8 as i8;
                        dynasm!(self.ops ; .arch x64 ; mov BYTE [r12 + r13], v);
                    }
                    Width::W2 => {
                        let v = (*value as u16).swap_bytes() as i16;
                        dynasm!(self.ops ; .arch x64 ; mov WORD [r12 + r13], v);
                    }
                    Width::W4 => {
                        let v = (*value as u32).swap_bytes() as i32;
                        dynasm!(self.ops ; .arch x64 ; mov DWORD [r12 + r13], v);
                    }
                    Width::W8 => {
                        let v = value.swap_bytes() as i64;
                        dynasm!(self.ops
                            ; .arch x64
                            ; mov rax, QWORD v
                            ; mov QWORD [r12 + r13], rax
                        );
                    }
                }
                let n = width.bytes() as i32;
                dynasm!(self.ops ; .arch x64 ; add r13, n);
            }
            Op::WriteInt { width, src } => {
                self.get_into(*src, RAX)?;
                match width {
                    Width::W1 => dynasm!(self.ops ; .arch x64 ; mov BYTE [r12 + r13], al),
                    Width::W2 => dynasm!(self.ops
                        ; .arch x64
                        ; rol ax, 8
                        ; mov WORD [r12 + r13], ax
                    ),
                    Width::W4 => dynasm!(self.ops
                        ; .arch x64
                        ; bswap eax
                        ; mov DWORD [r12 + r13], eax
                    ),
                    Width::W8 => dynasm!(self.ops
                        ; .arch x64
                        ; bswap rax
                        ; mov QWORD [r12 + r13], rax
                    ),
                }
                let n = width.bytes() as i32;
                dynasm!(self.ops ; .arch x64 ; add r13, n);
            }
            Op::ReadBytes { dst, len } => {
                let args = [ArgSrc::HeapAddr(*dst, 0), ArgSrc::Wire, ArgSrc::Vreg(*len)];
                self.call_runtime(runtime::rt_memmove as usize, &args)?;
                let l = self.get(*len, RAX)?;
                dynasm!(self.ops ; .arch x64 ; add r13, Rq(l));
            }
            Op::WriteBytes { src, len } => {
                let args = [ArgSrc::Wire, ArgSrc::HeapAddr(*src, 0), ArgSrc::Vreg(*len)];
                self.call_runtime(runtime::rt_memmove as usize, &args)?;
                let l = self.get(*len, RAX)?;
                dynasm!(self.ops ; .arch x64 ; add r13, Rq(l));
            }

            Op::Load { width, signed, dst, base, off } => {
                let b = self.get(*base, RAX)?;
                let off = *off as i32;
                match (width, signed) {
                    (Width::W1, false) => dynasm!(self.ops ; .arch x64 ; movzx ecx, BYTE [r14 + Rq(b) + off]),
                    (Width::W1, true) => dynasm!(self.ops ; .arch x64 ; movsx rcx, BYTE [r14 + Rq(b) + off]),
                    (Width::W2, false) => dynasm!(self.ops ; .arch x64 ; movzx ecx, WORD [r14 + Rq(b) + off]),
                    (Width::W2, true) => dynasm!(self.ops ; .arch x64 ; movsx rcx, WORD [r14 + Rq(b) + off]),
                    (Width::W4, false) => dynasm!(self.ops ; .arch x64 ; mov ecx, DWORD [r14 + Rq(b) + off]),
                    (Width::W4, true) => dynasm!(self.ops ; .arch x64 ; movsxd rcx, DWORD [r14 + Rq(b) + off]),
                    (Width::W8, _) => dynasm!(self.ops ; .arch x64 ; mov rcx, QWORD [r14 + Rq(b) + off]),
                }
                self.put(*dst, RCX);
            }
            Op::Store { width, src, base, off } => {
                let b = self.get(*base, RAX)?;
                self.get_into(*src, RCX)?;
                let off = *off as i32;
                match width {
                    Width::W1 => dynasm!(self.ops ; .arch x64 ; mov BYTE [r14 + Rq(b) + off], cl),
                    Width::W2 => dynasm!(self.ops ; .arch x64 ; mov WORD [r14 + Rq(b) + off], cx),
                    Width::W4 => dynasm!(self.ops ; .arch x64 ; mov DWORD [r14 + Rq(b) + off], ecx),
                    Width::W8 => dynasm!(self.ops ; .arch x64 ; mov QWORD [r14 + Rq(b) + off], rcx),
                }
            }
            Op::LoadPtr { dst, base, off } => {
                let b = self.get(*base, RAX)?;
                let off = *off as i32;
                dynasm!(self.ops ; .arch x64 ; mov ecx, DWORD [r14 + Rq(b) + off]);
                self.put(*dst, RCX);
            }
            Op::StorePtr { src, base, off } => self.emit_store_ptr(*src, *base, *off)?,
            Op::Seek { dst, src, off } => {
                if dst == src && *off == 0 {
                    return Ok(());
                }
                let s = self.get(*src, RAX)?;
                let off = *off;
                dynasm!(self.ops ; .arch x64 ; lea rax, [Rq(s) + off]);
                self.put(*dst, RAX);
            }
            Op::Zero { base, off, len } => self.emit_zero(*base, *off, *len)?,

            Op::MovImm { dst, value } => {
                let d = match self.location(*dst)? {
                    Location::Reg(p) => p.code(),
                    Location::Spill(_) => RAX,
                };
                match *value {
                    0 => dynasm!(self.ops ; .arch x64 ; xor Rd(d), Rd(d)),
                    v if v <= u32::MAX as u64 => {
                        let v = v as u32 as i32;
                        dynasm!(self.ops ; .arch x64 ; mov Rd(d), v);
                    }
                    v => {
                        let v = v as i64;
                        dynasm!(self.ops ; .arch x64 ; mov Rq(d), QWORD v);
                    }
                }
                self.put(*dst, d);
            }
            Op::Mov { dst, src } => {
                if dst != src {
                    let s = self.get(*src, RAX)?;
                    self.put(*dst, s);
                }
            }
            Op::Add { dst, a, b } => {
                self.get_into(*a, RAX)?;
                let b = self.get(*b, RCX)?;
                dynasm!(self.ops ; .arch x64 ; add rax, Rq(b));
                self.put(*dst, RAX);
            }
            Op::AddImm { dst, src, imm } => {
                if dst == src && *imm == 0 {
                    return Ok(());
                }
                self.get_into(*src, RAX)?;
                let imm = *imm;
                if imm != 0 {
                    dynasm!(self.ops ; .arch x64 ; add rax, imm);
                }
                self.put(*dst, RAX);
            }
            Op::MulImm { dst, src, imm } => {
                self.get_into(*src, RAX)?;
                let imm = *imm;
                dynasm!(self.ops ; .arch x64 ; imul rax, rax, imm);
                self.put(*dst, RAX);
            }
            Op::AndImm { dst, src, imm } => {
                self.get_into(*src, RAX)?;
                let imm = *imm;
                dynasm!(self.ops ; .arch x64 ; and rax, imm);
                self.put(*dst, RAX);
            }
            Op::OrImm { dst, src, imm } => {
                self.get_into(*src, RAX)?;
                let imm = *imm;
                if imm != 0 {
                    dynasm!(self.ops ; .arch x64 ; or rax, imm);
                }
                self.put(*dst, RAX);
            }

            Op::Enter => {
                let fail = self.fail(ErrorCode::NestingOverflow);
                dynasm!(self.ops
                    ; .arch x64
                    ; add rbx, FRAME_BYTES
                    ; cmp rbx, [r15 + CTX_STACK_LIMIT]
                    ; ja =>fail
                );
            }
            Op::Leave => dynasm!(self.ops ; .arch x64 ; sub rbx, FRAME_BYTES),
            Op::LoadFrame { dst, slot } => {
                let disp = *slot as i32 * 8;
                dynasm!(self.ops ; .arch x64 ; mov rax, [rbx + disp]);
                self.put(*dst, RAX);
            }
            Op::StoreFrame { src, slot } => {
                let s = self.get(*src, RAX)?;
                let disp = *slot as i32 * 8;
                dynasm!(self.ops ; .arch x64 ; mov [rbx + disp], Rq(s));
            }

            Op::Jump { target } => {
                let l = self.target(*target)?;
                dynasm!(self.ops ; .arch x64 ; jmp =>l);
            }
            Op::BranchImm { cond, a, imm, target } => {
                let l = self.target(*target)?;
                let a = self.get(*a, RAX)?;
                let imm = *imm;
                dynasm!(self.ops ; .arch x64 ; cmp Rq(a), imm);
                self.jcc(*cond, l);
            }
            Op::BranchReg { cond, a, b, target } => {
                let l = self.target(*target)?;
                let a = self.get(*a, RAX)?;
                let b = self.get(*b, RCX)?;
                dynasm!(self.ops ; .arch x64 ; cmp Rq(a), Rq(b));
                self.jcc(*cond, l);
            }
            Op::Switch { src, targets, default } => self.emit_switch(*src, targets, *default)?,
            Op::Call { handle, args, rets } => self.emit_handle_call(*handle, args, rets)?,
            Op::Error { code } => {
                let l = self.fail(*code);
                dynasm!(self.ops ; .arch x64 ; jmp =>l);
            }
            Op::Halt => self.epilogue(),
        }
        Ok(())
    }

    /// Pointer store, through the sink's barrier while the flag is raised.
    fn emit_store_ptr(&mut self, src: Reg, base: Reg, off: u32) -> Result<(), CompileError> {
        let direct = self.ops.new_dynamic_label();
        let flag = barrier::flag_address() as i64;
        dynasm!(self.ops
            ; .arch x64
            ; mov rax, QWORD flag
            ; cmp BYTE [rax], 0
            ; je =>direct
        );
        let locs: Vec<ArgLoc> = (0..4).map(ArgLoc::Reg).collect();
        let args = [
            ArgSrc::SinkData,
            ArgSrc::Plus(base, off),
            ArgSrc::HeapU32(base, off),
            ArgSrc::Vreg(src),
        ];
        self.emit_call(Callee::Method(WRITE_BARRIER_SLOT), &locs, &args, &[], CallFlags::empty())?;
        dynasm!(self.ops ; .arch x64 ; =>direct);

        let b = self.get(base, RAX)?;
        self.get_into(src, RCX)?;
        let off = off as i32;
        dynasm!(self.ops ; .arch x64 ; mov DWORD [r14 + Rq(b) + off], ecx);
        Ok(())
    }

    fn emit_zero(&mut self, base: Reg, off: u32, len: u32) -> Result<(), CompileError> {
        if len > INLINE_ZERO_MAX {
            let args = [ArgSrc::HeapAddr(base, off), ArgSrc::Imm(len as u64)];
            return self.call_runtime(runtime::rt_memzero as usize, &args);
        }
        let b = self.get(base, RAX)?;
        let off = off as i32;
        dynasm!(self.ops ; .arch x64 ; lea rax, [r14 + Rq(b) + off]);
        let mut at = 0i32;
        let len = len as i32;
        while at < len {
            match len - at {
                8.. => {
                    dynasm!(self.ops ; .arch x64 ; mov QWORD [rax + at], 0);
                    at += 8;
                }
                4..=7 => {
                    dynasm!(self.ops ; .arch x64 ; mov DWORD [rax + at], 0);
                    at += 4;
                }
                2..=3 => {
                    dynasm!(self.ops ; .arch x64 ; mov WORD [rax + at], 0);
                    at += 2;
                }
                _ => {
                    dynasm!(self.ops ; .arch x64 ; mov BYTE [rax + at], 0);
                    at += 1;
                }
            }
        }
        Ok(())
    }

    /// Bounds check, then an indexed jump into a table of 5-byte `jmp rel32`s.
    fn emit_switch(&mut self, src: Reg, targets: &[u32], default: u32) -> Result<(), CompileError> {
        let default = self.target(default)?;
        if targets.is_empty() {
            dynasm!(self.ops ; .arch x64 ; jmp =>default);
            return Ok(());
        }
        let arms = targets
            .iter()
            .map(|t| self.target(*t))
            .collect::<Result<Vec<_>, _>>()?;
        let table = self.ops.new_dynamic_label();
        let n = arms.len() as i32;
        self.get_into(src, RAX)?;
        dynasm!(self.ops
            ; .arch x64
            ; cmp rax, n
            ; jae =>default
            ; lea rcx, [=>table]
            ; lea rax, [rax + rax * 4]
            ; add rax, rcx
            ; jmp rax
            ; =>table
        );
        for arm in arms {
            dynasm!(self.ops ; .arch x64 ; jmp =>arm);
        }
        Ok(())
    }
}
