//! Thrift Binary Protocol codecs compiled from type descriptors.
//!
//! A [`TypeDescriptor`] describes a struct and the memory layout of its
//! values in a [`Heap`]. On first use a [`Session`] lowers the descriptor
//! into three IR programs (measure, encode, decode), optimizes them, and
//! either emits x86-64 machine code for them or runs them in the bytecode
//! emulator. Compiled codecs are cached per descriptor for the life of the
//! session.
//!
//! The free functions below use [`Session::global`], configured from
//! `THRIFTJIT_*` environment variables.

pub mod barrier;
pub mod cache;
pub mod callhandle;
pub mod cfg;
pub mod codegen;
pub mod config;
pub mod emulator;
pub mod error;
pub mod frontend;
pub mod ir;
pub mod loader;
pub mod optimizer;
pub mod regalloc;
pub mod runtime;
pub mod schema;
pub mod session;
pub mod value;
pub mod wire;

use std::sync::Arc;

pub use barrier::{DirectStore, PointerStoreSink, RecordingBarrier};
pub use config::{Backend, Options};
pub use error::{CodecError, CompileError, Error, ErrorCode};
pub use schema::{DefaultValue, Field, Kind, Requiredness, TypeDescriptor, TypeRef};
pub use session::{Decoded, Session};
pub use value::{Heap, StructValue, Value};

/// Bytes [`encode`] would write for the struct at `root`.
pub fn encoded_size(ty: &Arc<TypeDescriptor>, heap: &mut Heap, root: u32) -> Result<usize, Error> {
    Session::global().encoded_size(ty, heap, root)
}

/// Encodes the struct at `root` into `out`, returning the bytes written.
pub fn encode(ty: &Arc<TypeDescriptor>, heap: &mut Heap, root: u32, out: &mut [u8]) -> Result<usize, Error> {
    Session::global().encode(ty, heap, root, out)
}

/// Decodes `input` into the struct at `root`, returning the bytes consumed.
pub fn decode(ty: &Arc<TypeDescriptor>, input: &[u8], heap: &mut Heap, root: u32) -> Result<usize, Error> {
    Session::global().decode(ty, input, heap, root)
}

/// Compiles `ty` and the structs reachable from it ahead of first use.
pub fn pretouch(ty: &Arc<TypeDescriptor>) -> Result<(), CompileError> {
    Session::global().pretouch(ty)
}
