//! Pointer-store sink: the hook a garbage-collected host uses to observe
//! pointer stores into value memory.
//!
//! Compiled code tests [`BARRIER_ACTIVE`] before every pointer store. When the
//! flag is clear the store is direct; when set, the sink's `write_barrier`
//! method runs first, called through a `#[repr(C)]` method table so native
//! code can dispatch to it without knowing the sink's type.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Process-wide barrier flag, read by compiled code as a byte.
pub static BARRIER_ACTIVE: AtomicBool = AtomicBool::new(false);

pub fn set_active(active: bool) {
    BARRIER_ACTIVE.store(active, Ordering::SeqCst);
    tracing::debug!(active, "write barrier toggled");
}

pub fn is_active() -> bool {
    BARRIER_ACTIVE.load(Ordering::Relaxed)
}

/// Address of the flag byte, for embedding into generated code.
pub fn flag_address() -> usize {
    BARRIER_ACTIVE.as_ptr() as usize
}

pub trait PointerStoreSink: Send + Sync + 'static {
    /// Called before `new` overwrites `old` at heap offset `slot`.
    fn write_barrier(&self, slot: u32, old: u32, new: u32);
}

/// Sink for hosts without a collector.
#[derive(Debug, Default)]
pub struct DirectStore;

impl PointerStoreSink for DirectStore {
    fn write_barrier(&self, _slot: u32, _old: u32, _new: u32) {}
}

/// Sink that remembers every barrier invocation.
#[derive(Debug, Default)]
pub struct RecordingBarrier {
    calls: Mutex<Vec<(u32, u32, u32)>>,
}

impl RecordingBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(slot, old, new)` for every invocation so far.
    pub fn calls(&self) -> Vec<(u32, u32, u32)> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl PointerStoreSink for RecordingBarrier {
    fn write_barrier(&self, slot: u32, old: u32, new: u32) {
        self.calls.lock().push((slot, old, new));
    }
}

impl<S: PointerStoreSink> PointerStoreSink for std::sync::Arc<S> {
    fn write_barrier(&self, slot: u32, old: u32, new: u32) {
        (**self).write_barrier(slot, old, new)
    }
}

// ─── Method table ───────────────────────────────────────────────────────────

/// Method table of a sink. Every entry takes the receiver data pointer first.
#[repr(C)]
pub struct SinkVTable {
    pub write_barrier: extern "C" fn(data: *const (), slot: u64, old: u64, new: u64) -> u64,
}

/// Slot index of `write_barrier` in [`SinkVTable`].
pub const WRITE_BARRIER_SLOT: u32 = 0;

/// Receiver data plus method table, as stored in the call context.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SinkRef {
    pub data: *const (),
    pub vtable: *const SinkVTable,
}

// SAFETY: a SinkRef only ever points at a `PointerStoreSink`, which is Send + Sync,
// and at a 'static method table.
unsafe impl Send for SinkRef {}
unsafe impl Sync for SinkRef {}

extern "C" fn write_barrier_thunk<S: PointerStoreSink>(data: *const (), slot: u64, old: u64, new: u64) -> u64 {
    // SAFETY: `data` was produced from a `&S` by `SinkRef::new`.
    let sink = unsafe { &*(data as *const S) };
    sink.write_barrier(slot as u32, old as u32, new as u32);
    0
}

trait HasVTable {
    const VTABLE: SinkVTable;
}

impl<S: PointerStoreSink> HasVTable for S {
    const VTABLE: SinkVTable = SinkVTable {
        write_barrier: write_barrier_thunk::<S>,
    };
}

impl SinkRef {
    /// Builds a reference to `sink`. The caller keeps `sink` alive for as long
    /// as the reference is used.
    pub fn new<S: PointerStoreSink>(sink: &S) -> SinkRef {
        SinkRef {
            data: sink as *const S as *const (),
            vtable: &<S as HasVTable>::VTABLE,
        }
    }

    /// Function pointer stored at method `slot`.
    pub fn method(&self, slot: u32) -> Option<usize> {
        // SAFETY: vtable points at a 'static SinkVTable.
        let vtable = unsafe { &*self.vtable };
        match slot {
            WRITE_BARRIER_SLOT => Some(vtable.write_barrier as usize),
            _ => None,
        }
    }

    /// Runs the barrier for a store of `new` over `old` at `slot`.
    pub fn write_barrier(&self, slot: u32, old: u32, new: u32) {
        // SAFETY: see `method`.
        let vtable = unsafe { &*self.vtable };
        (vtable.write_barrier)(self.data, slot as u64, old as u64, new as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vtable_dispatches_to_sink() {
        let sink = RecordingBarrier::new();
        let r = SinkRef::new(&sink);
        r.write_barrier(16, 0, 40);
        let f = r.method(WRITE_BARRIER_SLOT).unwrap();
        let f: extern "C" fn(*const (), u64, u64, u64) -> u64 = unsafe { std::mem::transmute(f) };
        f(r.data, 24, 40, 48);
        assert_eq!(sink.calls(), vec![(16, 0, 40), (24, 40, 48)]);
        assert!(r.method(1).is_none());
    }
}
