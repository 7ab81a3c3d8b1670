//! Compiled codecs keyed by descriptor identity.
//!
//! Lookups are lock-free. Each key owns a `OnceLock`, so any number of
//! threads missing on the same descriptor at once compile it exactly once;
//! the others block on that key only. Results, failures included, are
//! published for the life of the session, and each entry holds its
//! descriptor so the address it is keyed by is never handed to another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_skiplist::SkipMap;

use crate::emulator;
use crate::error::CompileError;
use crate::ir::{Job, Program};
use crate::loader::{FuncInfo, LoadedFunction};
use crate::runtime::CallContext;
use crate::schema::TypeDescriptor;
use crate::session::Session;

/// How a compiled program is executed.
#[derive(Debug)]
enum Exec {
    Native(LoadedFunction),
    Emulated,
}

/// One optimized program plus its executable form.
#[derive(Debug)]
pub struct CompiledProgram {
    program: Program,
    exec: Exec,
}

impl CompiledProgram {
    pub fn native(program: Program, function: LoadedFunction) -> Self {
        CompiledProgram {
            program,
            exec: Exec::Native(function),
        }
    }

    pub fn emulated(program: Program) -> Self {
        CompiledProgram {
            program,
            exec: Exec::Emulated,
        }
    }

    /// The optimized IR this program was built from.
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn is_native(&self) -> bool {
        matches!(self.exec, Exec::Native(_))
    }

    /// Loader metadata: entry, size, frame size and pointer maps.
    pub fn func_info(&self) -> Option<&'static FuncInfo> {
        match &self.exec {
            Exec::Native(f) => Some(f.info()),
            Exec::Emulated => None,
        }
    }

    pub fn run(&self, session: &Session, ctx: &mut CallContext) {
        match &self.exec {
            // SAFETY: contexts only come from `CallContext::new`.
            Exec::Native(f) => unsafe { f.call(ctx) },
            Exec::Emulated => emulator::run(&self.program, session.handles(), ctx),
        }
    }
}

/// The three codecs of one struct type.
#[derive(Debug)]
pub struct CodecSet {
    /// Keeps the descriptor, and so its identity, alive.
    pub ty: Arc<TypeDescriptor>,
    pub measure: CompiledProgram,
    pub encode: CompiledProgram,
    pub decode: CompiledProgram,
}

impl CodecSet {
    pub fn program(&self, job: Job) -> &CompiledProgram {
        match job {
            Job::Measure => &self.measure,
            Job::Encode => &self.encode,
            Job::Decode => &self.decode,
        }
    }
}

type Compiled = Result<Arc<CodecSet>, CompileError>;

struct Slot {
    /// Pins the key.
    ty: Arc<TypeDescriptor>,
    result: OnceLock<Compiled>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compiles: u64,
}

#[derive(Default)]
pub struct ProgramCache {
    slots: SkipMap<usize, Arc<Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Published result for the descriptor at `key`, if any.
    pub fn get(&self, key: usize) -> Option<Compiled> {
        self.slots.get(&key)?.value().result.get().cloned()
    }

    /// Returns the codecs for `ty`, running `compile` if nobody has yet.
    pub fn get_or_compile(
        &self,
        ty: &Arc<TypeDescriptor>,
        compile: impl FnOnce() -> Result<CodecSet, CompileError>,
    ) -> Compiled {
        let key = TypeDescriptor::identity(ty);
        if let Some(done) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return done;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let entry = self.slots.get_or_insert_with(key, || {
            Arc::new(Slot {
                ty: ty.clone(),
                result: OnceLock::new(),
            })
        });
        let slot = entry.value().clone();
        debug_assert!(Arc::ptr_eq(&slot.ty, ty));
        slot.result
            .get_or_init(|| {
                self.compiles.fetch_add(1, Ordering::Relaxed);
                compile().map(Arc::new)
            })
            .clone()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Reg, Width};
    use crate::runtime;
    use std::sync::Barrier;

    fn named(name: &str) -> Arc<TypeDescriptor> {
        TypeDescriptor::structure(name).build().unwrap()
    }

    fn dummy_set() -> CodecSet {
        let handles = runtime::builtin_handles();
        let program = |job| {
            let mut b = Builder::new("t", job, &handles);
            b.load(Width::W1, false, Reg::R0, Reg::P0, 0);
            b.halt();
            CompiledProgram::emulated(b.build().unwrap())
        };
        CodecSet {
            ty: named("T"),
            measure: program(Job::Measure),
            encode: program(Job::Encode),
            decode: program(Job::Decode),
        }
    }

    #[test]
    fn concurrent_misses_compile_once() {
        let cache = ProgramCache::new();
        let ty = named("T");
        let gate = Barrier::new(8);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    gate.wait();
                    cache.get_or_compile(&ty, || Ok(dummy_set())).unwrap();
                });
            }
        });
        let stats = cache.stats();
        assert_eq!(stats.compiles, 1);
        assert_eq!(stats.hits + stats.misses, 8);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failures_are_published_too() {
        let cache = ProgramCache::new();
        let ty = named("T");
        let err = || Err(CompileError::Unsupported("nope".into()));
        assert!(cache.get_or_compile(&ty, err).is_err());
        assert!(cache.get_or_compile(&ty, || Ok(dummy_set())).is_err());
        assert_eq!(cache.stats().compiles, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn failed_entries_keep_their_descriptor() {
        let cache = ProgramCache::new();
        let failing = named("Failing");
        let key = TypeDescriptor::identity(&failing);
        let weak = Arc::downgrade(&failing);
        assert!(cache
            .get_or_compile(&failing, || Err(CompileError::Unsupported("nope".into())))
            .is_err());
        drop(failing);
        assert!(weak.upgrade().is_some());

        // The address stays taken, so fresh descriptors compile afresh.
        let fresh: Vec<_> = (0..64).map(|i| named(&format!("Fresh{i}"))).collect();
        for ty in &fresh {
            assert_ne!(TypeDescriptor::identity(ty), key);
            assert!(cache.get_or_compile(ty, || Ok(dummy_set())).is_ok());
        }
        assert_eq!(cache.stats().compiles, 65);
    }
}
