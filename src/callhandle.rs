//! Descriptors for routines compiled code can call.
//!
//! Three kinds exist:
//! - **native**: `extern "C" fn(ctx, a0..a3) -> u64`, arguments in fixed registers;
//! - **host**: `extern "C" fn(ctx, ...)` with an argument layout computed from
//!   the declared signature (register arguments first, then stack slots) and up
//!   to two results;
//! - **method**: a slot in the pointer-store sink's method table, receiver
//!   taken from the call context.
//!
//! A handle is verified against its declared signature once, when a program
//! that calls it is built.

use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::CompileError;
use crate::ir::Reg;

pub const MAX_NATIVE_ARGS: usize = 4;
/// Host functions take the context plus up to this many arguments.
pub const MAX_HOST_ARGS: usize = 7;
pub const MAX_HOST_RESULTS: usize = 2;
pub const MAX_METHOD_ARGS: usize = 5;

/// Integer argument registers in System V order.
pub const ARG_REGS: usize = 6;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub u32);

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The shape of one argument or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Ptr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<ArgKind>,
    pub results: Vec<ArgKind>,
}

impl Signature {
    pub fn new(params: &[ArgKind], results: &[ArgKind]) -> Self {
        Signature {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u8 {
        /// The callee may write the error slot.
        const MAY_FAIL = 1;
        /// The callee may move the wire cursor.
        const MOVES_CURSOR = 1 << 1;
    }
}

/// Where one host-call argument lives at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLoc {
    /// Index into the integer argument registers (`rdi, rsi, rdx, rcx, r8, r9`).
    Reg(u8),
    /// Byte offset from the stack pointer at the call instruction.
    Stack(u32),
}

/// Argument layout of a host call. Index 0 is the implicit context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiLayout {
    pub args: Vec<ArgLoc>,
    /// Bytes of outgoing stack arguments.
    pub stack_bytes: u32,
    pub results: usize,
}

impl AbiLayout {
    pub fn compute(sig: &Signature) -> AbiLayout {
        let mut args = Vec::with_capacity(sig.params.len() + 1);
        let mut stack = 0u32;
        for i in 0..=sig.params.len() {
            if i < ARG_REGS {
                args.push(ArgLoc::Reg(i as u8));
            } else {
                args.push(ArgLoc::Stack(stack));
                stack += 8;
            }
        }
        AbiLayout {
            args,
            stack_bytes: stack,
            results: sig.results.len(),
        }
    }
}

/// Return type of host functions declaring two results, returned in `rax:rdx`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultPair {
    pub first: u64,
    pub second: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    Native { func: usize },
    Host { func: usize, abi: AbiLayout },
    Method { slot: u32 },
}

#[derive(Debug, Clone)]
pub struct CallHandle {
    pub name: &'static str,
    pub kind: CallKind,
    pub sig: Signature,
    pub flags: CallFlags,
}

impl CallHandle {
    pub fn native(name: &'static str, func: usize, sig: Signature, flags: CallFlags) -> Result<Self, CompileError> {
        if sig.params.len() > MAX_NATIVE_ARGS || sig.results.len() > 1 {
            return Err(mismatch(name, "native calls take at most 4 arguments and return at most 1 value"));
        }
        Ok(CallHandle {
            name,
            kind: CallKind::Native { func },
            sig,
            flags,
        })
    }

    pub fn host(name: &'static str, func: usize, sig: Signature, flags: CallFlags) -> Result<Self, CompileError> {
        if sig.params.len() > MAX_HOST_ARGS || sig.results.len() > MAX_HOST_RESULTS {
            return Err(mismatch(name, "host call signature exceeds the supported arity"));
        }
        let abi = AbiLayout::compute(&sig);
        Ok(CallHandle {
            name,
            kind: CallKind::Host { func, abi },
            sig,
            flags,
        })
    }

    pub fn method(name: &'static str, slot: u32, sig: Signature, flags: CallFlags) -> Result<Self, CompileError> {
        if sig.params.len() > MAX_METHOD_ARGS || sig.results.len() > 1 {
            return Err(mismatch(name, "method calls take at most 5 arguments and return at most 1 value"));
        }
        Ok(CallHandle {
            name,
            kind: CallKind::Method { slot },
            sig,
            flags,
        })
    }

    /// Checks a call site against the declared arity and pointer shape.
    pub fn verify(&self, args: &[Reg], rets: &[Reg]) -> Result<(), CompileError> {
        if args.len() != self.sig.params.len() {
            return Err(mismatch(
                self.name,
                format!("expected {} arguments, got {}", self.sig.params.len(), args.len()),
            ));
        }
        if rets.len() != self.sig.results.len() {
            return Err(mismatch(
                self.name,
                format!("expected {} results, got {}", self.sig.results.len(), rets.len()),
            ));
        }
        let shapes = self.sig.params.iter().zip(args).chain(self.sig.results.iter().zip(rets));
        for (i, (kind, reg)) in shapes.enumerate() {
            if (*kind == ArgKind::Ptr) != reg.is_ptr() {
                return Err(mismatch(
                    self.name,
                    format!("operand {i} is {reg}, declared {kind:?}"),
                ));
            }
        }
        for (i, r) in rets.iter().enumerate() {
            if rets[..i].contains(r) {
                return Err(mismatch(self.name, format!("result register {r} repeated")));
            }
        }
        Ok(())
    }
}

fn mismatch(name: &'static str, reason: impl Into<String>) -> CompileError {
    CompileError::SignatureMismatch {
        name,
        reason: reason.into(),
    }
}

// ─── Handle table ───────────────────────────────────────────────────────────

/// Append-only table of call handles. Reads are lock-free; registration is
/// serialized so names stay unique.
pub struct HandleTable {
    handles: boxcar::Vec<CallHandle>,
    by_name: Mutex<HashMap<&'static str, CallId>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            handles: boxcar::Vec::new(),
            by_name: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a handle, or returns the existing id of a handle with the same name.
    pub fn register(&self, handle: CallHandle) -> CallId {
        let mut by_name = self.by_name.lock();
        if let Some(id) = by_name.get(handle.name) {
            return *id;
        }
        let name = handle.name;
        let id = CallId(self.handles.push(handle) as u32);
        by_name.insert(name, id);
        tracing::debug!(name, id = id.0, "registered call handle");
        id
    }

    pub fn get(&self, id: CallId) -> Option<&CallHandle> {
        self.handles.get(id.0 as usize)
    }

    /// Resolves a handle or fails with the fatal `UnresolvedCall`.
    pub fn resolve(&self, id: CallId) -> Result<&CallHandle, CompileError> {
        self.get(id).ok_or(CompileError::UnresolvedCall(id.0))
    }

    pub fn lookup(&self, name: &str) -> Option<CallId> {
        self.by_name.lock().get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.handles.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy() {}

    #[test]
    fn host_layout_spills_past_six_registers() {
        let sig = Signature::new(&[ArgKind::Int; 7], &[ArgKind::Int, ArgKind::Int]);
        let abi = AbiLayout::compute(&sig);
        assert_eq!(abi.args.len(), 8);
        assert_eq!(abi.args[0], ArgLoc::Reg(0));
        assert_eq!(abi.args[5], ArgLoc::Reg(5));
        assert_eq!(abi.args[6], ArgLoc::Stack(0));
        assert_eq!(abi.args[7], ArgLoc::Stack(8));
        assert_eq!(abi.stack_bytes, 16);
    }

    #[test]
    fn arity_limits_are_enforced() {
        let too_many = Signature::new(&[ArgKind::Int; 5], &[]);
        assert!(CallHandle::native("n", dummy as usize, too_many, CallFlags::empty()).is_err());
        let three = Signature::new(&[], &[ArgKind::Int; 3]);
        assert!(CallHandle::host("h", dummy as usize, three, CallFlags::empty()).is_err());
    }

    #[test]
    fn verify_checks_pointer_shape() {
        let h = CallHandle::native(
            "alloc",
            dummy as usize,
            Signature::new(&[ArgKind::Int], &[ArgKind::Ptr]),
            CallFlags::MAY_FAIL,
        )
        .unwrap();
        assert!(h.verify(&[Reg::R0], &[Reg::P1]).is_ok());
        assert!(matches!(
            h.verify(&[Reg::P0], &[Reg::P1]),
            Err(CompileError::SignatureMismatch { .. })
        ));
        assert!(matches!(
            h.verify(&[Reg::R0], &[]),
            Err(CompileError::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn table_dedups_by_name() {
        let table = HandleTable::new();
        let mk = || {
            CallHandle::method("barrier", 0, Signature::new(&[], &[]), CallFlags::empty()).unwrap()
        };
        let a = table.register(mk());
        let b = table.register(mk());
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        assert!(table.resolve(CallId(7)).is_err());
    }
}
