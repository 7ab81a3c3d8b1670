//! Lowering of type descriptors into IR.
//!
//! One recursive walk serves all three jobs. Register conventions shared by
//! every lowering routine:
//!
//! - `p0` holds the base of the struct being processed (the program root on entry);
//! - `p1`/`r1` are the element cursor and remaining count of a container loop;
//! - `r0`, `r2`..`r6`, `p2`, `p3`, `r3` are scratch.
//!
//! A nested composite (struct, pointer or container) may clobber every
//! register, so parents park their state in a traversal frame and reload it
//! afterwards. Calls preserve every register except their results.

use std::sync::Arc;

use crate::error::{CompileError, ErrorCode};
use crate::ir::{Builder, Job, Label, Program, Reg};
use crate::runtime;
use crate::schema::{Field, Kind, TypeDescriptor};
use crate::session::Session;
use crate::wire;

mod decode;
mod encode;
mod measure;

/// Lowers the codec for `ty` (a struct, or a pointer to one).
pub fn compile(session: &Session, ty: &Arc<TypeDescriptor>, job: Job) -> Result<Program, CompileError> {
    let root = TypeDescriptor::struct_type(ty)?;
    let _span = tracing::debug_span!("lower", %job, ty = %root.name).entered();

    let mut lw = Lowering::new(session, &root, job);
    match job {
        Job::Measure => lw.enc_struct(&root, &measure::Counter)?,
        Job::Encode => lw.enc_struct(&root, &encode::WireWriter)?,
        Job::Decode => lw.dec_struct(&root)?,
    }
    let program = lw.finish()?;
    tracing::debug!(ops = program.len(), "lowered");
    Ok(program)
}

/// Shared error exits, emitted once per program on first use.
#[derive(Default)]
struct ErrorExits {
    invalid_length: Option<Label>,
    invalid_tag: Option<Label>,
    duplicate_field: Option<Label>,
    missing_required: Option<Label>,
}

pub(crate) struct Lowering<'s> {
    pub(crate) b: Builder<'s>,
    session: &'s Session,
    /// Struct nesting depth of the code being emitted.
    depth: usize,
    exits: ErrorExits,
}

impl<'s> Lowering<'s> {
    fn new(session: &'s Session, root: &TypeDescriptor, job: Job) -> Self {
        Lowering {
            b: Builder::new(root.name.clone(), job, session.handles()),
            session,
            depth: 0,
            exits: ErrorExits::default(),
        }
    }

    fn job(&self) -> Job {
        self.b.job()
    }

    fn finish(mut self) -> Result<Program, CompileError> {
        let exit = self.b.label();
        self.b.jump(exit);
        let exits = std::mem::take(&mut self.exits);
        for (label, code) in [
            (exits.invalid_length, ErrorCode::InvalidLength),
            (exits.invalid_tag, ErrorCode::InvalidTag),
            (exits.duplicate_field, ErrorCode::DuplicateField),
            (exits.missing_required, ErrorCode::MissingRequiredField),
        ] {
            if let Some(label) = label {
                self.b.bind(label);
                self.b.error(code);
            }
        }
        self.b.bind(exit);
        self.b.halt();
        self.b.build()
    }

    fn exit(&mut self, code: ErrorCode) -> Label {
        let slot = match code {
            ErrorCode::InvalidLength => &mut self.exits.invalid_length,
            ErrorCode::InvalidTag => &mut self.exits.invalid_tag,
            ErrorCode::DuplicateField => &mut self.exits.duplicate_field,
            _ => &mut self.exits.missing_required,
        };
        if let Some(l) = slot {
            return *l;
        }
        let l = self.b.label();
        *slot = Some(l);
        l
    }

    // ── Recursion guard ──

    /// Whether a nested struct at the current depth must be compiled as a
    /// call into its own codec instead of inline.
    fn must_defer(&self) -> bool {
        let opts = self.session.options();
        self.depth >= opts.max_inline_depth || self.b.len() >= opts.max_inline_size
    }

    /// Runs the codec of `ty` with `base` as its root.
    fn defer(&mut self, ty: &Arc<TypeDescriptor>, base: Reg) {
        let index = self.session.intern_type(ty);
        tracing::trace!(ty = %ty.name, depth = self.depth, "deferring nested struct");
        self.b.mov_imm(Reg::R5, self.job() as u64);
        self.b.mov_imm(Reg::R6, index as u64);
        self.b.call(runtime::DEFER, &[Reg::R5, Reg::R6, base], &[]);
    }

    /// Emits `body` one struct level deeper, or a deferral once the inline
    /// budget is spent. `p0` holds the struct base either way.
    fn nested_struct(
        &mut self,
        ty: &Arc<TypeDescriptor>,
        body: impl FnOnce(&mut Self, &Arc<TypeDescriptor>) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let ty = TypeDescriptor::struct_type(ty)?;
        if self.must_defer() {
            self.defer(&ty, Reg::P0);
            return Ok(());
        }
        self.depth += 1;
        let result = body(self, &ty);
        self.depth -= 1;
        result
    }

    /// Registers `ty` in the session type table for runtime helpers.
    fn type_index(&self, ty: &Arc<TypeDescriptor>) -> u32 {
        self.session.intern_type(ty)
    }
}

/// Element types whose lowering touches only `r0`, `r2`, `p2` and the base
/// register, so container loops over them can keep their state in registers.
fn is_simple(ty: &TypeDescriptor) -> bool {
    ty.kind.is_scalar() || matches!(ty.kind, Kind::String | Kind::Binary)
}

/// Field ids are tracked in frame slots 1.., 31 bits per slot so every mask
/// fits a positive 32-bit immediate.
const SEEN_BITS_PER_SLOT: usize = 31;
const SEEN_SLOTS: usize = crate::ir::FRAME_SLOTS as usize - 1;
pub(crate) const MAX_TRACKED_FIELDS: usize = SEEN_BITS_PER_SLOT * SEEN_SLOTS;

fn seen_bit(index: usize) -> (u8, i32) {
    (
        1 + (index / SEEN_BITS_PER_SLOT) as u8,
        1i32 << (index % SEEN_BITS_PER_SLOT),
    )
}

fn header_tag(field: &Field) -> u8 {
    wire::tag_of(field.ty.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::ir::Op;
    use crate::schema::StructBuilder;

    fn session() -> &'static Session {
        Session::leak(Options::default())
    }

    #[test]
    fn every_job_lowers_to_a_built_program() {
        let ty = TypeDescriptor::structure("S")
            .field(1, "a", TypeDescriptor::i32())
            .field(2, "b", TypeDescriptor::list(TypeDescriptor::string()))
            .build()
            .unwrap();
        for job in [Job::Measure, Job::Encode, Job::Decode] {
            let p = compile(session(), &ty, job).unwrap();
            assert_eq!(p.job, job);
            assert!(matches!(p.ops.last(), Some(Op::Halt)));
        }
    }

    #[test]
    fn recursion_is_bounded_by_inline_depth() {
        let node = StructBuilder::build_recursive("Node", |this, b| {
            b.field(1, "v", TypeDescriptor::i64())
                .field(2, "next", TypeDescriptor::pointer(this))
        })
        .unwrap();
        let s = Session::leak(Options::default().max_inline_depth(2));
        let p = compile(s, &node, Job::Encode).unwrap();
        let defers = p
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Call { handle, .. } if *handle == runtime::DEFER))
            .count();
        assert_eq!(defers, 1);
    }

    #[test]
    fn non_struct_roots_are_rejected() {
        let err = compile(session(), &TypeDescriptor::i32(), Job::Encode).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn seen_bits_stay_positive() {
        assert_eq!(seen_bit(0), (1, 1));
        assert_eq!(seen_bit(30), (1, 1 << 30));
        assert_eq!(seen_bit(31), (2, 1));
    }
}
