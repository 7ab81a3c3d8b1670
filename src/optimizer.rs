//! Peephole passes over built programs.
//!
//! Passes rewrite instructions in place, turning the ones they absorb into
//! `Nop`; `compact` then strips them and relocates branch targets. The whole
//! pipeline repeats until nothing changes, so it is a fixed point.

use crate::error::CompileError;
use crate::ir::builder::compact;
use crate::ir::{Op, Program, Width};

/// Upper bound on pipeline rounds; each productive round removes instructions.
const MAX_ROUNDS: usize = 64;

pub fn optimize(program: Program) -> Result<Program, CompileError> {
    let before = program.len();
    let mut program = program;
    for _ in 0..MAX_ROUNDS {
        let mut next = program.clone();
        delete_self_seeks(&mut next);
        merge_seeks(&mut next);
        delete_self_seeks(&mut next);
        merge_checks(&mut next);
        merge_writes(&mut next);
        let next = compact(next)?;
        if next == program {
            break;
        }
        program = next;
    }
    tracing::debug!(name = %program.name, before, after = program.len(), "optimized");
    Ok(program)
}

/// `p = seek p, 0` does nothing.
fn delete_self_seeks(p: &mut Program) {
    for op in p.ops.iter_mut() {
        if let Op::Seek { dst, src, off: 0 } = op
            && dst == src
        {
            *op = Op::Nop;
        }
    }
}

/// `a = seek b, x; a = seek a, y` becomes `a = seek b, x+y`.
fn merge_seeks(p: &mut Program) {
    let targets = p.branch_targets();
    for i in 1..p.ops.len() {
        if targets[i] {
            continue;
        }
        let (Op::Seek { dst: d1, src: s1, off: o1 }, Op::Seek { dst: d2, src: s2, off: o2 }) =
            (&p.ops[i - 1], &p.ops[i])
        else {
            continue;
        };
        if d1 != d2 || s2 != d1 {
            continue;
        }
        let Some(off) = o1.checked_add(*o2) else {
            continue;
        };
        p.ops[i] = Op::Seek {
            dst: *d1,
            src: *s1,
            off,
        };
        p.ops[i - 1] = Op::Nop;
    }
}

/// Instructions a hoisted check may move past without changing behaviour
/// other than where an end-of-buffer error is reported.
fn is_cursor_neutral(op: &Op) -> bool {
    matches!(
        op,
        Op::Nop
            | Op::Load { .. }
            | Op::Store { .. }
            | Op::LoadPtr { .. }
            | Op::StorePtr { .. }
            | Op::Seek { .. }
            | Op::Zero { .. }
            | Op::MovImm { .. }
            | Op::Mov { .. }
            | Op::Add { .. }
            | Op::AddImm { .. }
            | Op::MulImm { .. }
            | Op::AndImm { .. }
            | Op::OrImm { .. }
            | Op::LoadFrame { .. }
            | Op::StoreFrame { .. }
    )
}

/// Folds constant checks in the same straight-line run into the first one.
fn merge_checks(p: &mut Program) {
    let targets = p.branch_targets();
    let len = p.ops.len();
    let mut i = 0;
    while i < len {
        let Op::Check { n } = p.ops[i] else {
            i += 1;
            continue;
        };
        let mut need = n;
        let mut consumed = 0u32;
        let mut j = i + 1;
        while j < len && !targets[j] {
            match &p.ops[j] {
                Op::Check { n: more } => {
                    need = need.max(consumed.saturating_add(*more));
                    p.ops[j] = Op::Nop;
                }
                op if op.fixed_cursor_delta().is_some() => {
                    consumed = consumed.saturating_add(op.fixed_cursor_delta().unwrap_or(0));
                }
                op if is_cursor_neutral(op) => {}
                _ => break,
            }
            j += 1;
        }
        p.ops[i] = Op::Check { n: need };
        i = j;
    }
}

/// Replaces runs of literal writes by the fewest writes covering the same bytes.
fn merge_writes(p: &mut Program) {
    let targets = p.branch_targets();
    let len = p.ops.len();
    let mut i = 0;
    while i < len {
        let mut bytes = Vec::new();
        let mut j = i;
        while j < len && (j == i || !targets[j]) {
            let Op::WriteImm { width, value } = p.ops[j] else {
                break;
            };
            let w = width.bytes() as usize;
            bytes.extend_from_slice(&value.to_be_bytes()[8 - w..]);
            j += 1;
        }
        if j - i < 2 {
            i = j.max(i + 1);
            continue;
        }

        let split = split_writes(&bytes);
        if split.len() < j - i {
            for (k, op) in p.ops[i..j].iter_mut().enumerate() {
                *op = split.get(k).cloned().unwrap_or(Op::Nop);
            }
        }
        i = j;
    }
}

/// Greedy 8/4/2/1-byte split of a big-endian byte run.
fn split_writes(bytes: &[u8]) -> Vec<Op> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let width = [Width::W8, Width::W4, Width::W2, Width::W1]
            .into_iter()
            .find(|w| w.bytes() as usize <= rest.len())
            .unwrap_or(Width::W1);
        let (head, tail) = rest.split_at(width.bytes() as usize);
        let value = head.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        out.push(Op::WriteImm { width, value });
        rest = tail;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Cond, Job, Reg};
    use crate::runtime;

    fn program(f: impl FnOnce(&mut Builder<'_>)) -> Program {
        let handles = runtime::builtin_handles();
        let mut b = Builder::new("t", Job::Encode, &handles);
        f(&mut b);
        b.halt();
        b.build().unwrap()
    }

    #[test]
    fn header_and_value_share_one_check() {
        let p = program(|b| {
            b.check(3);
            b.write_imm(Width::W1, 10);
            b.write_imm(Width::W2, 16);
            b.check(8);
            b.load(Width::W8, false, Reg::R0, Reg::P0, 0);
            b.write_int(Width::W8, Reg::R0);
            b.check(1);
            b.write_imm(Width::W1, 0);
        });
        let p = optimize(p).unwrap();
        insta::assert_snapshot!(p.to_string(), @r"
        encode t:
            0: check 12
            1: write.8 0xa
            2: write.16 0x10
            3: r0 = load.u64 [p0+0]
            4: write.64 r0
            5: write.8 0x0
            6: halt
        ");
    }

    #[test]
    fn literal_runs_collapse_to_wide_writes() {
        let p = program(|b| {
            b.check(4);
            for byte in [1, 2, 3, 4] {
                b.write_imm(Width::W1, byte);
            }
        });
        let p = optimize(p).unwrap();
        assert_eq!(
            p.ops,
            vec![
                Op::Check { n: 4 },
                Op::WriteImm {
                    width: Width::W4,
                    value: 0x0102_0304
                },
                Op::Halt
            ]
        );
    }

    #[test]
    fn seek_chains_fold_and_self_seeks_vanish() {
        let p = program(|b| {
            b.seek(Reg::P1, Reg::P0, 8);
            b.seek(Reg::P1, Reg::P1, -8);
            b.seek(Reg::P2, Reg::P2, 0);
            b.load(Width::W4, false, Reg::R0, Reg::P1, 0);
        });
        let p = optimize(p).unwrap();
        assert_eq!(p.ops.len(), 3);
        assert!(matches!(
            p.ops[0],
            Op::Seek {
                dst: Reg::P1,
                src: Reg::P0,
                off: 0
            }
        ));
    }

    #[test]
    fn checks_do_not_cross_branch_targets() {
        let p = program(|b| {
            let l = b.label();
            b.check(1);
            b.read_int(Width::W1, false, Reg::R0);
            b.branch_imm(Cond::Eq, Reg::R0, 0, l);
            b.check(2);
            b.bind(l);
            b.check(4);
        });
        let p = optimize(p).unwrap();
        let checks = p.ops.iter().filter(|op| matches!(op, Op::Check { .. })).count();
        assert_eq!(checks, 3);
    }

    #[test]
    fn optimize_is_a_fixed_point() {
        let p = program(|b| {
            b.check(1);
            b.write_imm(Width::W1, 12);
            b.check(2);
            b.write_imm(Width::W2, 1);
            b.seek(Reg::P0, Reg::P0, 4);
            b.seek(Reg::P0, Reg::P0, 4);
            b.check(1);
            b.write_imm(Width::W1, 0);
            b.write_imm(Width::W1, 0);
        });
        let once = optimize(p).unwrap();
        let twice = optimize(once.clone()).unwrap();
        assert_eq!(once, twice);
    }
}
