//! The session: options, call handles, the program cache and the public
//! codec entry points.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::barrier::{DirectStore, PointerStoreSink, SinkRef};
use crate::cache::{CacheStats, CodecSet, CompiledProgram, ProgramCache};
use crate::callhandle::HandleTable;
use crate::codegen;
use crate::config::{Backend, Options};
use crate::error::{CodecError, CompileError, Error, ErrorCode};
use crate::frontend;
use crate::ir::Job;
use crate::loader;
use crate::optimizer;
use crate::regalloc::Limits;
use crate::runtime::{self, CallContext, RuntimeState};
use crate::schema::{Kind, TypeDescriptor};
use crate::value::Heap;

static GLOBAL: LazyLock<Session> = LazyLock::new(|| Session::new(Options::from_env()));

/// Result of decoding into a freshly allocated root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Heap offset of the decoded struct.
    pub root: u32,
    /// Wire bytes consumed.
    pub consumed: usize,
}

pub struct Session {
    options: Options,
    handles: HandleTable,
    cache: ProgramCache,
    /// Descriptors referenced from compiled code by index.
    types: boxcar::Vec<Arc<TypeDescriptor>>,
    type_ids: Mutex<HashMap<usize, u32>>,
    _sink: Box<dyn PointerStoreSink>,
    sink_ref: SinkRef,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("options", &self.options)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(options: Options) -> Session {
        Self::with_sink(options, DirectStore)
    }

    /// A session whose pointer stores go through `sink` while barriers are active.
    pub fn with_sink<S: PointerStoreSink>(options: Options, sink: S) -> Session {
        let sink = Box::new(sink);
        let sink_ref = SinkRef::new(&*sink);
        Session {
            options,
            handles: runtime::builtin_handles(),
            cache: ProgramCache::new(),
            types: boxcar::Vec::new(),
            type_ids: Mutex::new(HashMap::new()),
            _sink: sink,
            sink_ref,
        }
    }

    /// A session that lives for the rest of the process.
    pub fn leak(options: Options) -> &'static Session {
        Box::leak(Box::new(Session::new(options)))
    }

    /// The process-wide session, configured from the environment.
    pub fn global() -> &'static Session {
        &GLOBAL
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn sink(&self) -> SinkRef {
        self.sink_ref
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ─── Type table ─────────────────────────────────────────────────────────

    /// Index of `ty` in the session type table, adding it on first use.
    pub fn intern_type(&self, ty: &Arc<TypeDescriptor>) -> u32 {
        let mut ids = self.type_ids.lock();
        *ids.entry(TypeDescriptor::identity(ty))
            .or_insert_with(|| self.types.push(ty.clone()) as u32)
    }

    pub fn type_at(&self, index: u32) -> Option<Arc<TypeDescriptor>> {
        self.types.get(index as usize).cloned()
    }

    // ─── Compilation ────────────────────────────────────────────────────────

    /// The codecs for `ty`, compiling them on first use.
    pub fn lookup(&self, ty: &Arc<TypeDescriptor>) -> Result<Arc<CodecSet>, CompileError> {
        let root = TypeDescriptor::struct_type(ty)?;
        self.cache.get_or_compile(&root, || self.compile_set(&root))
    }

    /// Like [`Session::lookup`], but a compiler defect panics.
    pub fn codecs(&self, ty: &Arc<TypeDescriptor>) -> Result<Arc<CodecSet>, Error> {
        self.lookup(ty).map_err(|e| surface(e.into()))
    }

    fn compile_set(&self, ty: &Arc<TypeDescriptor>) -> Result<CodecSet, CompileError> {
        let _span = tracing::info_span!("compile", ty = %ty.name).entered();
        let backend = self.options.backend.effective();
        let build = |job| -> Result<CompiledProgram, CompileError> {
            let program = optimizer::optimize(frontend::compile(self, ty, job)?)?;
            match backend {
                Backend::Native => {
                    let native = codegen::generate(program.clone(), &self.handles, Limits::default())?;
                    let function = loader::load(&native, self.options.perf_map)?;
                    Ok(CompiledProgram::native(program, function))
                }
                Backend::Interpreter => Ok(CompiledProgram::emulated(program)),
            }
        };
        let set = CodecSet {
            ty: ty.clone(),
            measure: build(Job::Measure)?,
            encode: build(Job::Encode)?,
            decode: build(Job::Decode)?,
        };
        tracing::info!(?backend, "compiled codecs");
        Ok(set)
    }

    /// Compiles the codecs of `ty` and of every struct reachable from it,
    /// up to the configured pretouch depth.
    pub fn pretouch(&self, ty: &Arc<TypeDescriptor>) -> Result<(), CompileError> {
        let mut seen = HashSet::new();
        self.pretouch_walk(ty, 0, &mut seen)
    }

    fn pretouch_walk(
        &self,
        ty: &Arc<TypeDescriptor>,
        depth: usize,
        seen: &mut HashSet<usize>,
    ) -> Result<(), CompileError> {
        if depth > self.options.max_pretouch_depth {
            return Ok(());
        }
        match ty.kind {
            Kind::Struct => {
                if !seen.insert(TypeDescriptor::identity(ty)) {
                    return Ok(());
                }
                self.lookup(ty)?;
                for field in &ty.fields {
                    self.pretouch_walk(&field.ty, depth + 1, seen)?;
                }
            }
            Kind::Pointer => self.pretouch_walk(&ty.pointee()?, depth, seen)?,
            Kind::List | Kind::Set => self.pretouch_walk(ty.elem()?, depth + 1, seen)?,
            Kind::Map => {
                self.pretouch_walk(ty.map_key()?, depth + 1, seen)?;
                self.pretouch_walk(ty.elem()?, depth + 1, seen)?;
            }
            _ => {}
        }
        Ok(())
    }

    // ─── Execution ──────────────────────────────────────────────────────────

    /// Runs the `job` codec of type `index` on `ctx` with `base` as its root.
    /// Called from compiled code, so failures are recorded, never raised.
    pub(crate) fn run_deferred(&self, ctx: &mut CallContext, job: Job, index: u32, base: u64) {
        let Some(ty) = self.type_at(index) else {
            ctx.raise_fault(CompileError::Malformed(format!("unknown type #{index}")));
            return;
        };
        let set = match self.lookup(&ty) {
            Ok(set) => set,
            Err(e) => {
                ctx.raise_fault(e);
                return;
            }
        };
        let saved = std::mem::replace(&mut ctx.root, base);
        set.program(job).run(self, ctx);
        ctx.root = saved;
    }

    fn execute(
        &self,
        program: &CompiledProgram,
        buf: *mut u8,
        buf_len: usize,
        heap: &mut Heap,
        root: u32,
    ) -> Result<usize, Error> {
        let mut state = RuntimeState::acquire(self.options.max_nesting_depth);
        let mut ctx = CallContext::new(self, buf, buf_len, heap, root, &mut state);
        program.run(self, &mut ctx);
        ctx.finish().map_err(surface)
    }

    /// Bytes `encode` would write for the struct at `root`.
    pub fn encoded_size(&self, ty: &Arc<TypeDescriptor>, heap: &mut Heap, root: u32) -> Result<usize, Error> {
        let set = self.codecs(ty)?;
        self.execute(&set.measure, std::ptr::null_mut(), 0, heap, root)
    }

    /// Encodes the struct at `root` into `out`, returning the bytes written.
    pub fn encode(&self, ty: &Arc<TypeDescriptor>, heap: &mut Heap, root: u32, out: &mut [u8]) -> Result<usize, Error> {
        let set = self.codecs(ty)?;
        self.execute(&set.encode, out.as_mut_ptr(), out.len(), heap, root)
    }

    pub fn encode_to_vec(&self, ty: &Arc<TypeDescriptor>, heap: &mut Heap, root: u32) -> Result<Vec<u8>, Error> {
        let size = self.encoded_size(ty, heap, root)?;
        let mut out = vec![0u8; size];
        let written = self.encode(ty, heap, root, &mut out)?;
        out.truncate(written);
        Ok(out)
    }

    /// Decodes `input` into the struct at `root`, returning the bytes consumed.
    /// Trailing input is left alone.
    pub fn decode(&self, ty: &Arc<TypeDescriptor>, input: &[u8], heap: &mut Heap, root: u32) -> Result<usize, Error> {
        let set = self.codecs(ty)?;
        // Decode programs never store through the wire pointer.
        self.execute(&set.decode, input.as_ptr() as *mut u8, input.len(), heap, root)
    }

    /// Allocates a root for `ty` and decodes `input` into it.
    pub fn decode_new(&self, ty: &Arc<TypeDescriptor>, input: &[u8], heap: &mut Heap) -> Result<Decoded, Error> {
        let set = self.codecs(ty)?;
        let root = alloc_root(heap, set.ty.size as usize)?;
        let consumed = self.execute(&set.decode, input.as_ptr() as *mut u8, input.len(), heap, root)?;
        Ok(Decoded { root, consumed })
    }
}

/// A zeroed root of `size` bytes. Running out of heap is reported the way
/// decode-time allocations report it.
fn alloc_root(heap: &mut Heap, size: usize) -> Result<u32, CodecError> {
    heap.alloc(size).ok_or(CodecError {
        code: ErrorCode::InvalidLength,
        offset: 0,
    })
}

/// Compiler defects are bugs, not input errors.
fn surface(e: Error) -> Error {
    if let Error::Compile(c) = &e
        && c.is_fatal()
    {
        panic!("thriftjit internal compiler error: {c}");
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{StructValue, Value, alloc_value, read_value};

    fn point() -> Arc<TypeDescriptor> {
        TypeDescriptor::structure("Point")
            .required(1, "x", TypeDescriptor::i32())
            .required(2, "y", TypeDescriptor::i32())
            .build()
            .unwrap()
    }

    fn sessions() -> [Session; 2] {
        [
            Session::new(Options::default()),
            Session::new(Options::default().backend(Backend::Interpreter)),
        ]
    }

    #[test]
    fn round_trip_through_both_backends() {
        let ty = point();
        let value = Value::Struct(StructValue::new(vec![Some(Value::I32(3)), Some(Value::I32(-4))]));
        for s in sessions() {
            let mut heap = Heap::new();
            let root = alloc_value(&mut heap, &ty, &value).unwrap();
            let bytes = s.encode_to_vec(&ty, &mut heap, root).unwrap();
            assert_eq!(bytes.len(), s.encoded_size(&ty, &mut heap, root).unwrap());

            let mut out = Heap::new();
            let d = s.decode_new(&ty, &bytes, &mut out).unwrap();
            assert_eq!(d.consumed, bytes.len());
            assert_eq!(read_value(&out, d.root, &ty).unwrap(), value);
        }
    }

    #[test]
    fn second_lookup_hits() {
        let s = Session::new(Options::default().backend(Backend::Interpreter));
        let ty = point();
        s.lookup(&ty).unwrap();
        s.lookup(&ty).unwrap();
        let stats = s.cache_stats();
        assert_eq!(stats.compiles, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn short_output_buffer_fails() {
        let ty = point();
        for s in sessions() {
            let mut heap = Heap::new();
            let root = heap.alloc(ty.size as usize).unwrap();
            let mut out = [0u8; 4];
            let err = s.encode(&ty, &mut heap, root, &mut out).unwrap_err();
            assert_eq!(err.code(), Some(ErrorCode::BufferTooSmall));
        }
    }

    #[test]
    fn non_struct_roots_are_unsupported() {
        let s = Session::new(Options::default());
        let err = s.lookup(&TypeDescriptor::i64()).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn pretouch_compiles_reachable_structs() {
        let inner = point();
        let outer = TypeDescriptor::structure("Outer")
            .field(1, "points", TypeDescriptor::list(inner.clone()))
            .field(2, "origin", inner)
            .build()
            .unwrap();
        let s = Session::new(Options::default().backend(Backend::Interpreter));
        s.pretouch(&outer).unwrap();
        assert_eq!(s.cache_stats().compiles, 2);
    }

    #[test]
    fn interned_types_keep_their_index() {
        let s = Session::new(Options::default());
        let a = point();
        let b = point();
        let ia = s.intern_type(&a);
        assert_eq!(s.intern_type(&a), ia);
        assert_ne!(s.intern_type(&b), ia);
        assert!(Arc::ptr_eq(&s.type_at(ia).unwrap(), &a));
    }

    #[test]
    fn exhausted_heap_is_a_codec_error() {
        let mut heap = Heap::new();
        let err = alloc_root(&mut heap, usize::MAX).unwrap_err();
        assert_eq!(Error::from(err).code(), Some(ErrorCode::InvalidLength));
        assert_eq!(alloc_root(&mut heap, 16), Ok(8));
    }

    fn too_wide() -> Arc<TypeDescriptor> {
        (0..301)
            .fold(TypeDescriptor::structure("Wide"), |b, id| {
                b.field(id, format!("f{id}"), TypeDescriptor::bool())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn failed_compiles_never_shadow_later_types() {
        for s in sessions() {
            let wide = too_wide();
            let key = TypeDescriptor::identity(&wide);
            let err = s.lookup(&wide).unwrap_err();
            assert!(matches!(err, CompileError::Unsupported(_)), "{err}");
            drop(wide);

            for _ in 0..64 {
                let ty = point();
                assert_ne!(TypeDescriptor::identity(&ty), key);
                s.lookup(&ty).unwrap();
            }
            assert_eq!(s.cache_stats().compiles, 65);
        }
    }
}
