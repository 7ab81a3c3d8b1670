//! Measure lowering: the encode walk with every write replaced by a cursor
//! advance, so the final cursor is the encoded size.

use crate::ir::{Reg, Width};

use super::Lowering;
use super::encode::Output;

pub(super) struct Counter;

impl Output for Counter {
    fn reserve(&self, _lw: &mut Lowering<'_>, _n: u32) {}

    fn reserve_reg(&self, _lw: &mut Lowering<'_>, _len: Reg) {}

    fn imm(&self, lw: &mut Lowering<'_>, width: Width, _value: u64) {
        lw.b.advance(width.bytes());
    }

    fn int(&self, lw: &mut Lowering<'_>, width: Width, _src: Reg) {
        lw.b.advance(width.bytes());
    }

    fn bytes(&self, lw: &mut Lowering<'_>, _src: Reg, len: Reg) {
        lw.b.advance_reg(len);
    }

    fn fixed_run(&self, lw: &mut Lowering<'_>, count: Reg, size: u32) -> bool {
        lw.b.mul_imm(Reg::R0, count, size as i32);
        lw.b.advance_reg(Reg::R0);
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Options;
    use crate::frontend::compile;
    use crate::ir::{Job, Op};
    use crate::schema::TypeDescriptor;
    use crate::session::Session;

    #[test]
    fn measure_never_touches_the_wire() {
        let ty = TypeDescriptor::structure("M")
            .field(1, "xs", TypeDescriptor::list(TypeDescriptor::i32()))
            .field(2, "s", TypeDescriptor::string())
            .build()
            .unwrap();
        let p = compile(Session::leak(Options::default()), &ty, Job::Measure).unwrap();
        assert!(!p.ops.iter().any(|op| matches!(
            op,
            Op::Check { .. } | Op::CheckReg { .. } | Op::WriteImm { .. } | Op::WriteInt { .. } | Op::WriteBytes { .. }
        )));
    }

    #[test]
    fn fixed_size_lists_are_measured_without_a_loop() {
        let ty = TypeDescriptor::structure("M")
            .field(1, "xs", TypeDescriptor::list(TypeDescriptor::i64()))
            .build()
            .unwrap();
        let p = compile(Session::leak(Options::default()), &ty, Job::Measure).unwrap();
        assert!(p.ops.iter().any(|op| matches!(op, Op::MulImm { imm: 8, .. })));
        // Only the empty-list guard and the presence guard branch.
        let branches = p.ops.iter().filter(|op| matches!(op, Op::BranchImm { .. })).count();
        assert_eq!(branches, 2);
    }
}
