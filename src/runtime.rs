use std::cell::RefCell;
use std::collections::HashSet;

use crate::barrier::{SinkRef, WRITE_BARRIER_SLOT};
use crate::callhandle::{AbiLayout, ArgKind, CallFlags, CallHandle, CallId, CallKind, HandleTable, Signature};
use crate::error::{CodecError, CompileError, ErrorCode};
use crate::ir::{FRAME_SLOTS, Job};
use crate::session::Session;
use crate::value::{Heap, read_value};
use crate::wire;

// ─── Call context ───────────────────────────────────────────────────────────

/// Error information written by compiled code and runtime helpers.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ErrorSlot {
    /// Non-zero means an error occurred.
    pub code: u32,
    _pad: u32,
    /// Cursor position where the error was detected.
    pub offset: u64,
}

/// The context passed to every compiled program and runtime helper.
/// Layout is `#[repr(C)]` so field offsets are stable and can be used from
/// generated code.
#[repr(C)]
pub struct CallContext {
    /// Wire buffer. Null when measuring.
    pub buf: *mut u8,
    pub buf_len: u64,
    /// Cursor into `buf`. Measure programs use it as the byte counter.
    pub pos: u64,
    /// Cached `heap.as_mut_ptr()`. Refreshed by anything that allocates.
    pub heap_base: *mut u8,
    pub heap: *mut Heap,
    /// Heap offset of the value being encoded or decoded.
    pub root: u64,
    /// Current traversal frame.
    pub stack: *mut u64,
    /// Last usable traversal frame.
    pub stack_limit: *mut u64,
    pub session: *const Session,
    pub sink: SinkRef,
    pub error: ErrorSlot,
    /// Compiler failure raised while a deferred codec was being prepared.
    /// Never touched by generated code.
    pub fault: Option<CompileError>,
}

// Field offset constants for use from generated code.
pub const CTX_BUF: i32 = core::mem::offset_of!(CallContext, buf) as i32;
pub const CTX_BUF_LEN: i32 = core::mem::offset_of!(CallContext, buf_len) as i32;
pub const CTX_POS: i32 = core::mem::offset_of!(CallContext, pos) as i32;
pub const CTX_HEAP_BASE: i32 = core::mem::offset_of!(CallContext, heap_base) as i32;
pub const CTX_ROOT: i32 = core::mem::offset_of!(CallContext, root) as i32;
pub const CTX_STACK: i32 = core::mem::offset_of!(CallContext, stack) as i32;
pub const CTX_STACK_LIMIT: i32 = core::mem::offset_of!(CallContext, stack_limit) as i32;
pub const CTX_SINK_DATA: i32 = core::mem::offset_of!(CallContext, sink.data) as i32;
pub const CTX_SINK_VTABLE: i32 = core::mem::offset_of!(CallContext, sink.vtable) as i32;
pub const CTX_ERROR_CODE: i32 = core::mem::offset_of!(CallContext, error.code) as i32;
pub const CTX_ERROR_OFFSET: i32 = core::mem::offset_of!(CallContext, error.offset) as i32;

/// Bytes one traversal frame occupies on the runtime stack.
pub const FRAME_BYTES: i32 = FRAME_SLOTS as i32 * 8;

impl CallContext {
    /// A context over the wire buffer `buf` (null when measuring) and `heap`,
    /// with the traversal stack borrowed from `state`. Decode never writes `buf`.
    pub fn new(
        session: &Session,
        buf: *mut u8,
        buf_len: usize,
        heap: &mut Heap,
        root: u32,
        state: &mut RuntimeState,
    ) -> CallContext {
        CallContext {
            buf,
            buf_len: if buf.is_null() { 0 } else { buf_len as u64 },
            pos: 0,
            heap_base: heap.as_mut_ptr(),
            heap: heap as *mut Heap,
            root: root as u64,
            stack: state.base(),
            stack_limit: state.limit(),
            session: session as *const Session,
            sink: session.sink(),
            error: ErrorSlot::default(),
            fault: None,
        }
    }

    /// Records `code` at the current cursor unless an error is already set.
    pub fn fail(&mut self, code: ErrorCode) {
        let pos = self.pos;
        self.fail_at(code, pos);
    }

    pub fn fail_at(&mut self, code: ErrorCode, offset: u64) {
        if self.error.code == 0 {
            self.error.code = code as u32;
            self.error.offset = offset;
        }
    }

    pub fn failed(&self) -> bool {
        self.error.code != 0
    }

    /// Records a compiler failure and stops the running program.
    pub fn raise_fault(&mut self, e: CompileError) {
        tracing::error!(error = %e, "deferred compile failed");
        self.fault.get_or_insert(e);
        self.fail(ErrorCode::Internal);
    }

    /// # Safety
    /// `heap` must still point at the heap this context was created over.
    pub unsafe fn heap(&mut self) -> &mut Heap {
        unsafe { &mut *self.heap }
    }

    /// Wire bytes available to the program.
    pub fn wire(&self) -> &[u8] {
        if self.buf.is_null() {
            &[]
        } else {
            // SAFETY: buf/buf_len describe the caller's slice for the whole call.
            unsafe { std::slice::from_raw_parts(self.buf, self.buf_len as usize) }
        }
    }

    /// Traversal frames left before the nesting cap.
    pub fn frames_left(&self) -> usize {
        (self.stack_limit as usize).saturating_sub(self.stack as usize) / FRAME_BYTES as usize
    }

    /// Turns the final state into the caller-visible result.
    pub fn finish(&mut self) -> Result<usize, crate::Error> {
        if let Some(e) = self.fault.take() {
            return Err(e.into());
        }
        match ErrorCode::from_raw(self.error.code) {
            Some(ErrorCode::Ok) => Ok(self.pos as usize),
            Some(code) => Err(CodecError {
                code,
                offset: self.error.offset as usize,
            }
            .into()),
            None => Err(CompileError::Malformed(format!("unknown error code {}", self.error.code)).into()),
        }
    }
}

// ─── Runtime state ──────────────────────────────────────────────────────────

const POOL_LIMIT: usize = 4;

thread_local! {
    static POOL: RefCell<Vec<Box<[u64]>>> = const { RefCell::new(Vec::new()) };
}

/// Traversal frames for one top-level call: frame 0 plus `cap` nested frames.
/// Pooled per thread, never shared between concurrent calls.
pub struct RuntimeState {
    frames: Box<[u64]>,
    cap: usize,
}

impl RuntimeState {
    pub fn acquire(cap: usize) -> RuntimeState {
        let words = (cap + 1) * FRAME_SLOTS as usize;
        let pooled = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            let at = pool.iter().position(|f| f.len() == words)?;
            Some(pool.swap_remove(at))
        });
        let frames = pooled.unwrap_or_else(|| vec![0u64; words].into_boxed_slice());
        RuntimeState { frames, cap }
    }

    pub fn base(&mut self) -> *mut u64 {
        self.frames.as_mut_ptr()
    }

    pub fn limit(&mut self) -> *mut u64 {
        let cap = self.cap * FRAME_SLOTS as usize;
        // SAFETY: frames has (cap + 1) * FRAME_SLOTS words.
        unsafe { self.frames.as_mut_ptr().add(cap) }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        let frames = std::mem::take(&mut self.frames);
        let _ = POOL.try_with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < POOL_LIMIT {
                pool.push(frames);
            }
        });
    }
}

// ─── Runtime helpers ────────────────────────────────────────────────────────
//
// Native and host routines always return a word; callers ignore it when the
// signature declares no result.

/// Allocates `size` zeroed heap bytes, returning their offset.
pub extern "C" fn rt_alloc(ctx: *mut CallContext, size: u64) -> u64 {
    // SAFETY: compiled code passes the context it was entered with.
    let ctx = unsafe { &mut *ctx };
    // SAFETY: the heap outlives the call and nothing else borrows it meanwhile.
    let heap = unsafe { &mut *ctx.heap };
    let Some(off) = usize::try_from(size).ok().and_then(|n| heap.alloc(n)) else {
        ctx.fail(ErrorCode::InvalidLength);
        return 0;
    };
    ctx.heap_base = heap.as_mut_ptr();
    off as u64
}

/// Copies `len` bytes between absolute addresses.
pub extern "C" fn rt_memmove(_ctx: *mut CallContext, dst: u64, src: u64, len: u64) -> u64 {
    // SAFETY: compiled code only passes ranges inside the wire buffer or heap.
    unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len as usize) };
    0
}

/// Zeroes `len` bytes at an absolute address.
pub extern "C" fn rt_memzero(_ctx: *mut CallContext, dst: u64, len: u64) -> u64 {
    // SAFETY: as for `rt_memmove`.
    unsafe { std::ptr::write_bytes(dst as *mut u8, 0, len as usize) };
    0
}

/// Skips one wire value with tag `tag` at the cursor.
pub extern "C" fn rt_skip(ctx: *mut CallContext, tag: u64) -> u64 {
    // SAFETY: see `rt_alloc`.
    let ctx = unsafe { &mut *ctx };
    let depth = ctx.frames_left();
    match wire::skip(ctx.wire(), ctx.pos as usize, tag as u8, depth) {
        Ok(end) => ctx.pos = end as u64,
        Err((code, offset)) => ctx.fail_at(code, offset as u64),
    }
    0
}

/// Runs another type's compiled codec on this context with `base` as its root.
pub extern "C" fn rt_defer(ctx: *mut CallContext, job: u64, type_index: u64, base: u64) -> u64 {
    // SAFETY: see `rt_alloc`.
    let ctx = unsafe { &mut *ctx };
    // SAFETY: the session outlives every call made through it.
    let session = unsafe { &*ctx.session };
    let Some(job) = Job::from_raw(job) else {
        ctx.raise_fault(CompileError::Malformed(format!("deferred call with job {job}")));
        return 0;
    };
    session.run_deferred(ctx, job, type_index as u32, base);
    0
}

/// Fails with `DuplicateSetElement` if two of the `count` elements at `data`
/// are equal. Equality is structural, with doubles compared by bit pattern.
pub extern "C" fn rt_set_check(ctx: *mut CallContext, type_index: u64, data: u64, count: u64) -> u64 {
    // SAFETY: see `rt_alloc`.
    let ctx = unsafe { &mut *ctx };
    let session = unsafe { &*ctx.session };
    let Some(elem) = session.type_at(type_index as u32) else {
        ctx.raise_fault(CompileError::Malformed(format!("unknown set element type #{type_index}")));
        return 0;
    };
    let heap = unsafe { &*ctx.heap };
    let mut seen = HashSet::with_capacity(count as usize);
    for i in 0..count as u32 {
        let value = match read_value(heap, data as u32 + i * elem.size, &elem) {
            Ok(v) => v,
            Err(e) => {
                ctx.raise_fault(CompileError::Malformed(e.to_string()));
                return 0;
            }
        };
        if !seen.insert(value) {
            ctx.fail(ErrorCode::DuplicateSetElement);
            return 0;
        }
    }
    0
}

// ─── Built-in handles ───────────────────────────────────────────────────────

pub const ALLOC: CallId = CallId(0);
pub const MEMMOVE: CallId = CallId(1);
pub const MEMZERO: CallId = CallId(2);
pub const SKIP: CallId = CallId(3);
pub const DEFER: CallId = CallId(4);
pub const SET_CHECK: CallId = CallId(5);
pub const BARRIER: CallId = CallId(6);

fn native(name: &'static str, func: usize, sig: Signature, flags: CallFlags) -> CallHandle {
    CallHandle {
        name,
        kind: CallKind::Native { func },
        sig,
        flags,
    }
}

fn host(name: &'static str, func: usize, sig: Signature, flags: CallFlags) -> CallHandle {
    let abi = AbiLayout::compute(&sig);
    CallHandle {
        name,
        kind: CallKind::Host { func, abi },
        sig,
        flags,
    }
}

/// A handle table holding the runtime helpers at their well-known ids.
pub fn builtin_handles() -> HandleTable {
    use ArgKind::{Int, Ptr};

    let table = HandleTable::new();
    let fail_move = CallFlags::MAY_FAIL | CallFlags::MOVES_CURSOR;
    let builtins = [
        (
            ALLOC,
            native("rt_alloc", rt_alloc as usize, Signature::new(&[Int], &[Ptr]), CallFlags::MAY_FAIL),
        ),
        (
            MEMMOVE,
            native("rt_memmove", rt_memmove as usize, Signature::new(&[Int, Int, Int], &[]), CallFlags::empty()),
        ),
        (
            MEMZERO,
            native("rt_memzero", rt_memzero as usize, Signature::new(&[Int, Int], &[]), CallFlags::empty()),
        ),
        (SKIP, host("rt_skip", rt_skip as usize, Signature::new(&[Int], &[]), fail_move)),
        (
            DEFER,
            host("rt_defer", rt_defer as usize, Signature::new(&[Int, Int, Ptr], &[]), fail_move),
        ),
        (
            SET_CHECK,
            host(
                "rt_set_check",
                rt_set_check as usize,
                Signature::new(&[Int, Ptr, Int], &[]),
                CallFlags::MAY_FAIL,
            ),
        ),
        (
            BARRIER,
            CallHandle {
                name: "write_barrier",
                kind: CallKind::Method { slot: WRITE_BARRIER_SLOT },
                sig: Signature::new(&[Int, Ptr, Ptr], &[]),
                flags: CallFlags::empty(),
            },
        ),
    ];
    for (id, handle) in builtins {
        let got = table.register(handle);
        debug_assert_eq!(got, id);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_layout_is_stable() {
        assert_eq!(CTX_BUF, 0);
        assert_eq!(CTX_BUF_LEN, 8);
        assert_eq!(CTX_POS, 16);
        assert_eq!(CTX_ERROR_OFFSET, CTX_ERROR_CODE + 8);
    }

    #[test]
    fn builtins_land_on_their_ids() {
        let table = builtin_handles();
        assert_eq!(table.lookup("rt_alloc"), Some(ALLOC));
        assert_eq!(table.lookup("rt_defer"), Some(DEFER));
        assert_eq!(table.lookup("write_barrier"), Some(BARRIER));
        assert!(matches!(table.get(SKIP).unwrap().kind, CallKind::Host { .. }));
    }

    #[test]
    fn runtime_state_is_pooled() {
        let ptr = {
            let mut s = RuntimeState::acquire(3);
            let limit = s.limit() as usize - s.base() as usize;
            assert_eq!(limit, 3 * FRAME_BYTES as usize);
            s.base() as usize
        };
        let mut again = RuntimeState::acquire(3);
        assert_eq!(again.base() as usize, ptr);
    }
}
