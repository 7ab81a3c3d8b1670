//! Native code generation for x86-64.
//!
//! Programs are lowered one instruction at a time after register allocation.
//! Decode programs first go through control-flow analysis: blocks no path
//! reaches are never emitted, and registers merged at joins are allocated
//! ahead of the rest.

use std::collections::BTreeSet;

use crate::callhandle::HandleTable;
use crate::cfg::{self, Cfg, DominatorTree};
use crate::error::CompileError;
use crate::ir::builder::verify;
use crate::ir::{Job, Program, Reg};
use crate::regalloc::{self, Limits};

mod x64;

/// Position-independent machine code for one program, plus the metadata a
/// host collector needs to find pointers in its frame.
#[derive(Debug, Clone)]
pub struct NativeCode {
    pub name: String,
    pub code: Vec<u8>,
    /// Offset of the entry point in `code`.
    pub entry: usize,
    /// Bytes reserved below the saved registers.
    pub frame_size: u32,
    /// Bit `i` set when argument `i` is a heap pointer (bit 0 is the root).
    pub arg_pointer_map: u64,
    /// Bit `k` set when spill slot `k` holds a heap pointer.
    pub local_pointer_map: u64,
}

/// A program ready for allocation.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub program: Program,
    /// Registers that need a phi at some join block.
    pub joined: Vec<Reg>,
}

/// Runs the analyses native emission relies on.
pub(crate) fn prepare(program: Program, handles: &HandleTable) -> Result<Prepared, CompileError> {
    let (program, joined) = if program.job == Job::Decode {
        let cfg = Cfg::build(&program);
        let doms = DominatorTree::compute(&cfg);
        let joined: BTreeSet<Reg> = cfg::place_phis(&program, &cfg, &doms).into_iter().flatten().collect();
        tracing::trace!(name = %program.name, blocks = cfg.blocks.len(), joined = joined.len(), "analyzed decode program");
        (cfg::prune_unreachable(program, &cfg)?, joined.into_iter().collect())
    } else {
        (program, Vec::new())
    };
    verify(&program, handles)?;
    Ok(Prepared { program, joined })
}

pub fn generate(program: Program, handles: &HandleTable, limits: Limits) -> Result<NativeCode, CompileError> {
    let Prepared { program, joined } = prepare(program, handles)?;
    let alloc = regalloc::allocate_merged(&program, limits, &joined)?;

    let mut ctx = x64::EmitCtx::new(&program, &alloc, handles)?;
    ctx.begin_func();
    for (i, op) in program.ops.iter().enumerate() {
        ctx.emit_op(i, op)?;
    }
    ctx.end_func();
    let frame_size = ctx.frame_size();
    let code = ctx.finish()?;

    tracing::debug!(
        name = %program.name,
        job = %program.job,
        bytes = code.len(),
        frame_size,
        spills = alloc.spill_slots,
        "generated native code"
    );
    Ok(NativeCode {
        name: format!("{} {}", program.job, program.name),
        code,
        entry: 0,
        frame_size,
        arg_pointer_map: 1,
        local_pointer_map: alloc.spill_pointer_map(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::ir::{Builder, Cond, Op, Width};
    use crate::runtime;
    use yaxpeax_arch::{Decoder, LengthedInstruction, U8Reader};
    use yaxpeax_x86::amd64::InstDecoder;

    fn listing(code: &[u8]) -> Vec<String> {
        let decoder = InstDecoder::default();
        let mut reader = U8Reader::new(code);
        let mut offset = 0usize;
        let mut out = Vec::new();
        while offset < code.len() {
            let inst = decoder.decode(&mut reader).expect("generated code decodes");
            offset += inst.len().to_const() as usize;
            out.push(inst.to_string());
        }
        out
    }

    fn build(job: Job, f: impl FnOnce(&mut Builder<'_>)) -> (Program, HandleTable) {
        let handles = runtime::builtin_handles();
        let program = {
            let mut b = Builder::new("t", job, &handles);
            f(&mut b);
            b.halt();
            b.build().unwrap()
        };
        (program, handles)
    }

    #[test]
    fn prologue_saves_fixed_registers_and_aligns_the_stack() {
        let (p, handles) = build(Job::Encode, |b| {
            b.check(1);
            b.write_imm(Width::W1, 0);
        });
        let native = generate(p, &handles, Limits::default()).unwrap();
        let text = listing(&native.code);
        assert_eq!(&text[..6], ["push rbx", "push rbp", "push r12", "push r13", "push r14", "push r15"]);
        assert!(text.iter().any(|l| l == "ret"));
        // Return address plus six pushes plus the frame keep calls 16-byte aligned.
        assert_eq!((native.frame_size + 7 * 8) % 16, 0);
        assert_eq!(native.arg_pointer_map, 1);
    }

    #[test]
    fn switch_lowers_to_a_jump_table() {
        let (p, handles) = build(Job::Decode, |b| {
            let arms: Vec<_> = (0..3).map(|_| b.label()).collect();
            let out = b.label();
            b.check(1);
            b.read_int(Width::W1, false, Reg::R0);
            b.switch(Reg::R0, &arms, out);
            for arm in &arms {
                b.bind(*arm);
                b.jump(out);
            }
            b.bind(out);
        });
        let native = generate(p, &handles, Limits::default()).unwrap();
        let text = listing(&native.code);
        assert!(text.iter().any(|l| l == "jmp rax"), "{text:#?}");
    }

    #[test]
    fn unreachable_decode_blocks_are_dropped() {
        let (p, handles) = build(Job::Decode, |b| {
            let done = b.label();
            b.jump(done);
            b.error(ErrorCode::InvalidTag);
            b.bind(done);
        });
        let p = prepare(p, &handles).unwrap().program;
        assert!(!p.ops.iter().any(|op| matches!(op, Op::Error { .. })));
    }

    #[test]
    fn spilled_pointers_are_reported() {
        let (p, handles) = build(Job::Encode, |b| {
            b.load(Width::W4, false, Reg::R0, Reg::P0, 0);
            b.load_ptr(Reg::P1, Reg::P0, 4);
            b.load_ptr(Reg::P2, Reg::P0, 8);
        });
        let limits = Limits {
            registers: 2,
            spill_slots: 4,
        };
        let native = generate(p, &handles, limits).unwrap();
        assert_eq!(native.local_pointer_map, 0b11);
        assert!(native.frame_size >= 2 * 8);
    }

    #[test]
    fn decode_loop_counters_stay_in_registers() {
        let (p, handles) = build(Job::Decode, |b| {
            let top = b.label();
            b.check(1);
            b.read_int(Width::W1, false, Reg::R2);
            b.mov(Reg::R0, Reg::R2);
            b.mov_imm(Reg::P1, 0);
            b.bind(top);
            b.seek(Reg::P1, Reg::P1, 8);
            b.add_imm(Reg::R0, Reg::R0, -1);
            b.branch_imm(Cond::Ne, Reg::R0, 0, top);
        });
        let limits = Limits {
            registers: 3,
            spill_slots: 4,
        };

        let prepared = prepare(p.clone(), &handles).unwrap();
        assert_eq!(prepared.joined, vec![Reg::R0, Reg::P1]);
        // In plain first-use order the loop cursor would be the one to spill.
        let plain = regalloc::allocate(&prepared.program, limits).unwrap();
        assert_eq!(plain.spill_pointer_map(), 0b1);

        let native = generate(p, &handles, limits).unwrap();
        assert_eq!(native.local_pointer_map, 0);
        assert!(native.frame_size >= 8);
    }
}
