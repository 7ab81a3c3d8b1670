//! Portable interpreter for IR programs.
//!
//! Runs a program against the same [`CallContext`] native code uses, with
//! identical observable behaviour: same wire bytes, same heap contents, same
//! error code and offset. Calls go through the real `extern "C"` helpers.

use std::sync::LazyLock;

use strum::IntoEnumIterator;

use crate::barrier;
use crate::callhandle::{CallKind, HandleTable, ResultPair};
use crate::error::{CompileError, ErrorCode};
use crate::ir::{FRAME_SLOTS, Op, Opcode, Program, Reg, Target};
use crate::runtime::CallContext;
use crate::value::Heap;

enum Flow {
    Next,
    Jump(Target),
    Stop,
}

type Handler = fn(&mut Machine<'_>, &Op) -> Flow;

static HANDLERS: LazyLock<Vec<Handler>> = LazyLock::new(|| Opcode::iter().map(handler_for).collect());

fn handler_for(opcode: Opcode) -> Handler {
    match opcode {
        Opcode::Nop => |_, _| Flow::Next,
        Opcode::Check | Opcode::CheckReg => op_check,
        Opcode::Advance | Opcode::AdvanceReg => op_advance,
        Opcode::ReadInt => op_read_int,
        Opcode::WriteImm | Opcode::WriteInt => op_write_int,
        Opcode::ReadBytes => op_read_bytes,
        Opcode::WriteBytes => op_write_bytes,
        Opcode::Load => op_load,
        Opcode::Store => op_store,
        Opcode::LoadPtr => op_load_ptr,
        Opcode::StorePtr => op_store_ptr,
        Opcode::Seek => op_seek,
        Opcode::Zero => op_zero,
        Opcode::MovImm
        | Opcode::Mov
        | Opcode::Add
        | Opcode::AddImm
        | Opcode::MulImm
        | Opcode::AndImm
        | Opcode::OrImm => op_arith,
        Opcode::Enter | Opcode::Leave => op_frame,
        Opcode::LoadFrame | Opcode::StoreFrame => op_frame_slot,
        Opcode::Jump | Opcode::BranchImm | Opcode::BranchReg | Opcode::Switch => op_branch,
        Opcode::Call => op_call,
        Opcode::Error => op_error,
        Opcode::Halt => |_, _| Flow::Stop,
    }
}

/// Runs `program` to completion on `ctx`. The outcome is left in the context.
pub fn run(program: &Program, handles: &HandleTable, ctx: &mut CallContext) {
    let root = ctx.root;
    let mut m = Machine {
        ctx,
        handles,
        regs: [0; Reg::COUNT],
        eof: program.job.eof_code(),
    };
    m.set(Reg::P0, root);

    let handlers = &*HANDLERS;
    let mut pc = 0usize;
    loop {
        let Some(op) = program.ops.get(pc) else {
            m.fault(format!("{}: fell off the end at @{pc}", program.name));
            break;
        };
        match handlers[op.opcode() as usize](&mut m, op) {
            Flow::Next => pc += 1,
            Flow::Jump(t) => pc = t as usize,
            Flow::Stop => break,
        }
    }
}

struct Machine<'a> {
    ctx: &'a mut CallContext,
    handles: &'a HandleTable,
    regs: [u64; Reg::COUNT],
    eof: ErrorCode,
}

impl Machine<'_> {
    fn get(&self, r: Reg) -> u64 {
        self.regs[r.index()]
    }

    fn set(&mut self, r: Reg, v: u64) {
        self.regs[r.index()] = v;
    }

    fn fail(&mut self, code: ErrorCode) -> Flow {
        self.ctx.fail(code);
        Flow::Stop
    }

    fn fault(&mut self, msg: String) -> Flow {
        self.ctx.raise_fault(CompileError::Malformed(msg));
        Flow::Stop
    }

    fn mismatch(&mut self, op: &Op) -> Flow {
        self.fault(format!("handler dispatched on `{op}`"))
    }

    fn heap(&mut self) -> &mut Heap {
        // SAFETY: the context's heap outlives the run, and helpers that grow
        // it are never running while this borrow is alive.
        unsafe { &mut *self.ctx.heap }
    }

    /// Heap offset of `base + off`, if `len` bytes there are in bounds.
    fn heap_at(&mut self, base: Reg, off: u32, len: u64) -> Option<u32> {
        let at = self.get(base).checked_add(off as u64)?;
        let end = at.checked_add(len)?;
        (end <= self.heap().len() as u64).then_some(at as u32)
    }

    /// Whether `n` more bytes fit in the wire buffer at the cursor.
    fn fits(&self, n: u64) -> bool {
        self.ctx.pos.checked_add(n).is_some_and(|end| end <= self.ctx.buf_len)
    }

    fn wire_mut(&mut self) -> &mut [u8] {
        if self.ctx.buf.is_null() {
            &mut []
        } else {
            // SAFETY: buf/buf_len describe the caller's buffer for the whole run.
            unsafe { std::slice::from_raw_parts_mut(self.ctx.buf, self.ctx.buf_len as usize) }
        }
    }

    fn frame(&self, slot: u8) -> *mut u64 {
        self.ctx.stack.wrapping_add(slot as usize)
    }
}

// ─── Cursor ─────────────────────────────────────────────────────────────────

fn op_check(m: &mut Machine<'_>, op: &Op) -> Flow {
    let n = match op {
        Op::Check { n } => *n as u64,
        Op::CheckReg { src } => m.get(*src),
        _ => return m.mismatch(op),
    };
    if m.fits(n) { Flow::Next } else { m.fail(m.eof) }
}

fn op_advance(m: &mut Machine<'_>, op: &Op) -> Flow {
    let n = match op {
        Op::Advance { n } => *n as u64,
        Op::AdvanceReg { src } => m.get(*src),
        _ => return m.mismatch(op),
    };
    m.ctx.pos = m.ctx.pos.wrapping_add(n);
    Flow::Next
}

fn op_read_int(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::ReadInt { width, signed, dst } = op else {
        return m.mismatch(op);
    };
    let w = width.bytes() as usize;
    if !m.fits(w as u64) {
        return m.fail(m.eof);
    }
    let pos = m.ctx.pos as usize;
    let bytes = &m.ctx.wire()[pos..pos + w];
    let mut v = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
    if *signed && w < 8 {
        let shift = 64 - 8 * w as u32;
        v = (((v << shift) as i64) >> shift) as u64;
    }
    m.ctx.pos += w as u64;
    m.set(*dst, v);
    Flow::Next
}

fn op_write_int(m: &mut Machine<'_>, op: &Op) -> Flow {
    let (width, value) = match op {
        Op::WriteImm { width, value } => (*width, *value),
        Op::WriteInt { width, src } => (*width, m.get(*src)),
        _ => return m.mismatch(op),
    };
    let w = width.bytes() as usize;
    if !m.fits(w as u64) {
        return m.fail(m.eof);
    }
    let pos = m.ctx.pos as usize;
    m.wire_mut()[pos..pos + w].copy_from_slice(&value.to_be_bytes()[8 - w..]);
    m.ctx.pos += w as u64;
    Flow::Next
}

fn op_read_bytes(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::ReadBytes { dst, len } = op else {
        return m.mismatch(op);
    };
    let len = m.get(*len);
    if !m.fits(len) {
        return m.fail(m.eof);
    }
    let Some(at) = m.heap_at(*dst, 0, len) else {
        return m.fault(format!("read_bytes of {len} past the heap"));
    };
    let pos = m.ctx.pos as usize;
    let len = len as usize;
    // SAFETY: the wire buffer and the heap never overlap.
    let src = unsafe { std::slice::from_raw_parts(m.ctx.buf.add(pos), len) };
    m.heap().bytes_mut(at, len).copy_from_slice(src);
    m.ctx.pos += len as u64;
    Flow::Next
}

fn op_write_bytes(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::WriteBytes { src, len } = op else {
        return m.mismatch(op);
    };
    let len = m.get(*len);
    if !m.fits(len) {
        return m.fail(m.eof);
    }
    let Some(at) = m.heap_at(*src, 0, len) else {
        return m.fault(format!("write_bytes of {len} past the heap"));
    };
    let pos = m.ctx.pos as usize;
    let len = len as usize;
    let data = m.heap().bytes(at, len).to_vec();
    m.wire_mut()[pos..pos + len].copy_from_slice(&data);
    m.ctx.pos += len as u64;
    Flow::Next
}

// ─── Heap ───────────────────────────────────────────────────────────────────

fn op_load(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::Load { width, signed, dst, base, off } = op else {
        return m.mismatch(op);
    };
    let w = width.bytes() as usize;
    let Some(at) = m.heap_at(*base, *off, w as u64) else {
        return m.fault(format!("`{op}` outside the heap"));
    };
    let mut v = m.heap().read(at, w);
    if *signed && w < 8 {
        let shift = 64 - 8 * w as u32;
        v = (((v << shift) as i64) >> shift) as u64;
    }
    m.set(*dst, v);
    Flow::Next
}

fn op_store(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::Store { width, src, base, off } = op else {
        return m.mismatch(op);
    };
    let w = width.bytes() as usize;
    let Some(at) = m.heap_at(*base, *off, w as u64) else {
        return m.fault(format!("`{op}` outside the heap"));
    };
    let v = m.get(*src);
    m.heap().write(at, w, v);
    Flow::Next
}

fn op_load_ptr(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::LoadPtr { dst, base, off } = op else {
        return m.mismatch(op);
    };
    let Some(at) = m.heap_at(*base, *off, 4) else {
        return m.fault(format!("`{op}` outside the heap"));
    };
    let v = m.heap().read_u32(at);
    m.set(*dst, v as u64);
    Flow::Next
}

fn op_store_ptr(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::StorePtr { src, base, off } = op else {
        return m.mismatch(op);
    };
    let Some(at) = m.heap_at(*base, *off, 4) else {
        return m.fault(format!("`{op}` outside the heap"));
    };
    let new = m.get(*src) as u32;
    if barrier::is_active() {
        let old = m.heap().read_u32(at);
        m.ctx.sink.write_barrier(at, old, new);
    }
    m.heap().write_u32(at, new);
    Flow::Next
}

fn op_seek(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::Seek { dst, src, off } = op else {
        return m.mismatch(op);
    };
    let v = m.get(*src).wrapping_add(*off as i64 as u64);
    m.set(*dst, v);
    Flow::Next
}

fn op_zero(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::Zero { base, off, len } = op else {
        return m.mismatch(op);
    };
    let Some(at) = m.heap_at(*base, *off, *len as u64) else {
        return m.fault(format!("`{op}` outside the heap"));
    };
    m.heap().bytes_mut(at, *len as usize).fill(0);
    Flow::Next
}

// ─── Arithmetic ─────────────────────────────────────────────────────────────

fn op_arith(m: &mut Machine<'_>, op: &Op) -> Flow {
    let (dst, v) = match op {
        Op::MovImm { dst, value } => (dst, *value),
        Op::Mov { dst, src } => (dst, m.get(*src)),
        Op::Add { dst, a, b } => (dst, m.get(*a).wrapping_add(m.get(*b))),
        Op::AddImm { dst, src, imm } => (dst, m.get(*src).wrapping_add(*imm as i64 as u64)),
        Op::MulImm { dst, src, imm } => (dst, m.get(*src).wrapping_mul(*imm as i64 as u64)),
        Op::AndImm { dst, src, imm } => (dst, m.get(*src) & *imm as i64 as u64),
        Op::OrImm { dst, src, imm } => (dst, m.get(*src) | *imm as i64 as u64),
        _ => return m.mismatch(op),
    };
    m.set(*dst, v);
    Flow::Next
}

// ─── Traversal frames ───────────────────────────────────────────────────────

fn op_frame(m: &mut Machine<'_>, op: &Op) -> Flow {
    match op {
        Op::Enter => {
            let next = m.ctx.stack.wrapping_add(FRAME_SLOTS as usize);
            m.ctx.stack = next;
            if next > m.ctx.stack_limit {
                return m.fail(ErrorCode::NestingOverflow);
            }
        }
        Op::Leave => m.ctx.stack = m.ctx.stack.wrapping_sub(FRAME_SLOTS as usize),
        _ => return m.mismatch(op),
    }
    Flow::Next
}

fn op_frame_slot(m: &mut Machine<'_>, op: &Op) -> Flow {
    // SAFETY: `Enter` keeps `stack` within the runtime state's frames, and
    // the builder rejects slots past FRAME_SLOTS.
    match op {
        Op::LoadFrame { dst, slot } => {
            let v = unsafe { *m.frame(*slot) };
            m.set(*dst, v);
        }
        Op::StoreFrame { src, slot } => {
            let v = m.get(*src);
            unsafe { *m.frame(*slot) = v };
        }
        _ => return m.mismatch(op),
    }
    Flow::Next
}

// ─── Control flow ───────────────────────────────────────────────────────────

fn op_branch(m: &mut Machine<'_>, op: &Op) -> Flow {
    match op {
        Op::Jump { target } => Flow::Jump(*target),
        Op::BranchImm { cond, a, imm, target } => {
            if cond.eval(m.get(*a), *imm as i64 as u64) {
                Flow::Jump(*target)
            } else {
                Flow::Next
            }
        }
        Op::BranchReg { cond, a, b, target } => {
            if cond.eval(m.get(*a), m.get(*b)) {
                Flow::Jump(*target)
            } else {
                Flow::Next
            }
        }
        Op::Switch { src, targets, default } => {
            let i = m.get(*src);
            let t = usize::try_from(i).ok().and_then(|i| targets.get(i)).unwrap_or(default);
            Flow::Jump(*t)
        }
        _ => m.mismatch(op),
    }
}

fn op_error(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::Error { code } = op else {
        return m.mismatch(op);
    };
    m.fail(*code)
}

fn op_call(m: &mut Machine<'_>, op: &Op) -> Flow {
    let Op::Call { handle, args, rets } = op else {
        return m.mismatch(op);
    };
    let h = match m.handles.resolve(*handle) {
        Ok(h) => h,
        Err(e) => {
            m.ctx.raise_fault(e);
            return Flow::Stop;
        }
    };
    let words: Vec<u64> = args.iter().map(|r| m.get(*r)).collect();
    let ctx = &mut *m.ctx as *mut CallContext as *mut ();

    // SAFETY: handles are registered with the signature of the function they
    // point at, and the call site was verified against it.
    let results = unsafe {
        match &h.kind {
            CallKind::Native { func } => invoke_word(*func, ctx, &words).map(|r| [r, 0]),
            CallKind::Host { func, abi } if abi.results == 2 => {
                invoke_pair(*func, ctx, &words).map(|r| [r.first, r.second])
            }
            CallKind::Host { func, .. } => invoke_word(*func, ctx, &words).map(|r| [r, 0]),
            CallKind::Method { slot } => {
                let sink = m.ctx.sink;
                match sink.method(*slot) {
                    Some(f) => invoke_word(f, sink.data as *mut (), &words).map(|r| [r, 0]),
                    None => None,
                }
            }
        }
    };
    let Some(results) = results else {
        return m.fault(format!("cannot call `{}` with {} arguments", h.name, words.len()));
    };
    for (r, v) in rets.iter().zip(results) {
        m.set(*r, v);
    }
    if m.ctx.failed() { Flow::Stop } else { Flow::Next }
}

macro_rules! invoker {
    ($name:ident -> $ret:ty) => {
        /// Calls an `extern "C"` function taking `first` plus `args` as words.
        ///
        /// # Safety
        /// `func` must be such a function with exactly that many parameters.
        unsafe fn $name(func: usize, first: *mut (), args: &[u64]) -> Option<$ret> {
            use std::mem::transmute;
            type P = *mut ();
            type R = $ret;
            unsafe {
                Some(match *args {
                    [] => transmute::<usize, extern "C" fn(P) -> R>(func)(first),
                    [a] => transmute::<usize, extern "C" fn(P, u64) -> R>(func)(first, a),
                    [a, b] => transmute::<usize, extern "C" fn(P, u64, u64) -> R>(func)(first, a, b),
                    [a, b, c] => {
                        transmute::<usize, extern "C" fn(P, u64, u64, u64) -> R>(func)(first, a, b, c)
                    }
                    [a, b, c, d] => {
                        transmute::<usize, extern "C" fn(P, u64, u64, u64, u64) -> R>(func)(first, a, b, c, d)
                    }
                    [a, b, c, d, e] => transmute::<usize, extern "C" fn(P, u64, u64, u64, u64, u64) -> R>(func)(
                        first, a, b, c, d, e,
                    ),
                    [a, b, c, d, e, f] => transmute::<usize, extern "C" fn(P, u64, u64, u64, u64, u64, u64) -> R>(
                        func,
                    )(first, a, b, c, d, e, f),
                    [a, b, c, d, e, f, g] => transmute::<
                        usize,
                        extern "C" fn(P, u64, u64, u64, u64, u64, u64, u64) -> R,
                    >(func)(first, a, b, c, d, e, f, g),
                    _ => return None,
                })
            }
        }
    };
}

invoker!(invoke_word -> u64);
invoker!(invoke_pair -> ResultPair);
