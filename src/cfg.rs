//! Control-flow graph over a built program.
//!
//! Blocks are maximal straight-line runs: a leader is instruction 0, every
//! branch target and every instruction after a terminator. Dominators use the
//! iterative Cooper–Harvey–Kennedy scheme over reverse postorder.

use std::collections::BTreeSet;

use crate::error::CompileError;
use crate::ir::{Op, Program, Reg};

/// Block index inside a [`Cfg`].
pub type BlockId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// First instruction.
    pub start: usize,
    /// One past the last instruction.
    pub end: usize,
    pub succs: Vec<BlockId>,
    pub preds: Vec<BlockId>,
}

impl BasicBlock {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    /// Block of each instruction.
    block_of: Vec<BlockId>,
}

impl Cfg {
    pub fn build(program: &Program) -> Cfg {
        let ops = &program.ops;
        let n = ops.len();

        let mut leader = program.branch_targets();
        if let Some(first) = leader.first_mut() {
            *first = true;
        }
        for (i, op) in ops.iter().enumerate() {
            if op.is_terminator() && i + 1 < n {
                leader[i + 1] = true;
            }
        }

        let mut blocks = Vec::new();
        let mut block_of = vec![0; n];
        for i in 0..n {
            if leader[i] {
                blocks.push(BasicBlock {
                    start: i,
                    end: i,
                    succs: Vec::new(),
                    preds: Vec::new(),
                });
            }
            let b = blocks.len() - 1;
            blocks[b].end = i + 1;
            block_of[i] = b;
        }

        for b in 0..blocks.len() {
            let last = &ops[blocks[b].end - 1];
            let mut succs: Vec<BlockId> = last.targets().into_iter().map(|t| block_of[t as usize]).collect();
            if last.falls_through() && b + 1 < blocks.len() {
                succs.push(b + 1);
            }
            let mut seen = BTreeSet::new();
            succs.retain(|s| seen.insert(*s));
            for &s in &succs {
                blocks[s].preds.push(b);
            }
            blocks[b].succs = succs;
        }

        Cfg { blocks, block_of }
    }

    pub fn block_of(&self, instr: usize) -> BlockId {
        self.block_of[instr]
    }

    /// Blocks reachable from the entry, in reverse postorder.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        if self.blocks.is_empty() {
            return Vec::new();
        }
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::with_capacity(self.blocks.len());
        // (block, next successor index)
        let mut stack = vec![(0, 0)];
        visited[0] = true;
        while let Some((b, i)) = stack.pop() {
            if let Some(&s) = self.blocks[b].succs.get(i) {
                stack.push((b, i + 1));
                if !visited[s] {
                    visited[s] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(b);
            }
        }
        post.reverse();
        post
    }

    pub fn reachable(&self) -> Vec<bool> {
        let mut r = vec![false; self.blocks.len()];
        for b in self.reverse_postorder() {
            r[b] = true;
        }
        r
    }
}

// ─── Dominators ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// `idom[b]`; the entry maps to itself, unreachable blocks to `None`.
    idom: Vec<Option<BlockId>>,
}

impl DominatorTree {
    pub fn compute(cfg: &Cfg) -> DominatorTree {
        let n = cfg.blocks.len();
        let mut idom = vec![None; n];
        let rpo = cfg.reverse_postorder();
        let Some(&entry) = rpo.first() else {
            return DominatorTree { idom };
        };
        let mut order = vec![usize::MAX; n];
        for (i, &b) in rpo.iter().enumerate() {
            order[b] = i;
        }

        let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| {
            while a != b {
                while order[a] > order[b] {
                    a = idom[a].unwrap_or(entry);
                }
                while order[b] > order[a] {
                    b = idom[b].unwrap_or(entry);
                }
            }
            a
        };

        idom[entry] = Some(entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new = None;
                for &p in &cfg.blocks[b].preds {
                    if idom[p].is_none() {
                        continue;
                    }
                    new = Some(match new {
                        None => p,
                        Some(cur) => intersect(&idom, p, cur),
                    });
                }
                if new.is_some() && idom[b] != new {
                    idom[b] = new;
                    changed = true;
                }
            }
        }
        DominatorTree { idom }
    }

    /// `None` for the entry and for unreachable blocks.
    pub fn immediate_dominator(&self, b: BlockId) -> Option<BlockId> {
        match self.idom.get(b).copied().flatten() {
            Some(d) if d != b => Some(d),
            _ => None,
        }
    }

    /// Whether every path from the entry to `b` passes through `a`. A block
    /// dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if self.idom.get(b).copied().flatten().is_none() {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.immediate_dominator(cur) {
                Some(d) => cur = d,
                None => return false,
            }
        }
    }

    /// Dominance frontier of every block.
    pub fn frontiers(&self, cfg: &Cfg) -> Vec<BTreeSet<BlockId>> {
        let mut df = vec![BTreeSet::new(); cfg.blocks.len()];
        for (b, block) in cfg.blocks.iter().enumerate() {
            let Some(idom) = self.idom[b] else { continue };
            let preds: Vec<_> = block.preds.iter().filter(|p| self.idom[**p].is_some()).collect();
            if preds.len() < 2 {
                continue;
            }
            for &p in preds {
                let mut runner = p;
                while runner != idom {
                    df[runner].insert(b);
                    match self.immediate_dominator(runner) {
                        Some(d) => runner = d,
                        None => break,
                    }
                }
            }
        }
        df
    }
}

// ─── SSA join points ────────────────────────────────────────────────────────

/// Registers needing a phi at the head of each block (minimal SSA: iterated
/// dominance frontier of each register's definition sites).
pub fn place_phis(program: &Program, cfg: &Cfg, doms: &DominatorTree) -> Vec<Vec<Reg>> {
    let df = doms.frontiers(cfg);
    let reachable = cfg.reachable();
    let mut phis: Vec<BTreeSet<Reg>> = vec![BTreeSet::new(); cfg.blocks.len()];

    for r in (0..Reg::COUNT).filter_map(Reg::from_index) {
        let mut work: Vec<BlockId> = cfg
            .blocks
            .iter()
            .enumerate()
            .filter(|(b, block)| {
                reachable[*b] && program.ops[block.start..block.end].iter().any(|op| op.defs().contains(&r))
            })
            .map(|(b, _)| b)
            .collect();
        let mut queued: BTreeSet<BlockId> = work.iter().copied().collect();
        while let Some(b) = work.pop() {
            for &f in &df[b] {
                if phis[f].insert(r) && queued.insert(f) {
                    work.push(f);
                }
            }
        }
    }
    phis.into_iter().map(|s| s.into_iter().collect()).collect()
}

/// Drops blocks unreachable from the entry. The block holding the final
/// `Halt` is always kept.
pub fn prune_unreachable(program: Program, cfg: &Cfg) -> Result<Program, CompileError> {
    let mut keep = cfg.reachable();
    if let Some(last) = keep.last_mut() {
        *last = true;
    }
    if keep.iter().all(|k| *k) {
        return Ok(program);
    }

    let Program { name, job, ops } = program;
    let mut remap = vec![u32::MAX; ops.len()];
    let mut next = 0u32;
    for (i, slot) in remap.iter_mut().enumerate() {
        if keep[cfg.block_of(i)] {
            *slot = next;
            next += 1;
        }
    }

    let mut out: Vec<Op> = Vec::with_capacity(next as usize);
    for (i, mut op) in ops.into_iter().enumerate() {
        if !keep[cfg.block_of(i)] {
            continue;
        }
        let mut dangling = false;
        op.map_targets(|t| {
            let m = remap[t as usize];
            dangling |= m == u32::MAX;
            m
        });
        if dangling {
            return Err(CompileError::Malformed(format!("@{i} targets a pruned block")));
        }
        out.push(op);
    }
    tracing::trace!(removed = remap.iter().filter(|m| **m == u32::MAX).count(), "pruned unreachable code");
    Ok(Program { name, job, ops: out })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Cond, Job, Width};
    use crate::runtime;

    fn program(f: impl FnOnce(&mut Builder<'_>)) -> Program {
        let handles = runtime::builtin_handles();
        let mut b = Builder::new("t", Job::Decode, &handles);
        f(&mut b);
        b.halt();
        b.build().unwrap()
    }

    /// 0: r0 = read; beq r0 -> else
    /// 1: r1 = 1; jmp join
    /// 2: else: r1 = 2
    /// 3: join: halt
    fn diamond() -> Program {
        program(|b| {
            let (els, join) = (b.label(), b.label());
            b.read_int(Width::W1, false, Reg::R0);
            b.branch_imm(Cond::Eq, Reg::R0, 0, els);
            b.mov_imm(Reg::R1, 1);
            b.jump(join);
            b.bind(els);
            b.mov_imm(Reg::R1, 2);
            b.bind(join);
        })
    }

    #[test]
    fn diamond_blocks_and_edges() {
        let p = diamond();
        let cfg = Cfg::build(&p);
        assert_eq!(cfg.blocks.len(), 4);
        assert_eq!(cfg.blocks[0].succs, vec![2, 1]);
        assert_eq!(cfg.blocks[3].preds, vec![1, 2]);
        assert!(cfg.blocks[0].preds.is_empty());
    }

    #[test]
    fn diamond_dominators_and_phis() {
        let p = diamond();
        let cfg = Cfg::build(&p);
        let doms = DominatorTree::compute(&cfg);
        assert_eq!(doms.immediate_dominator(0), None);
        assert_eq!(doms.immediate_dominator(3), Some(0));
        assert!(doms.dominates(0, 2));
        assert!(!doms.dominates(1, 3));

        let df = doms.frontiers(&cfg);
        assert_eq!(df[1].iter().copied().collect::<Vec<_>>(), vec![3]);
        assert!(df[0].is_empty());

        let phis = place_phis(&p, &cfg, &doms);
        assert_eq!(phis[3], vec![Reg::R1]);
    }

    #[test]
    fn switch_arms_are_all_successors() {
        let p = program(|b| {
            let (a, c, d) = (b.label(), b.label(), b.label());
            b.switch(Reg::R0, &[a, c], d);
            b.bind(a);
            b.mov_imm(Reg::R1, 1);
            b.bind(c);
            b.mov_imm(Reg::R1, 2);
            b.bind(d);
        });
        let cfg = Cfg::build(&p);
        assert_eq!(cfg.blocks[0].succs, vec![1, 2, 3]);
    }

    #[test]
    fn loops_put_phis_on_the_header() {
        let p = program(|b| {
            let top = b.label();
            b.mov_imm(Reg::R1, 4);
            b.bind(top);
            b.add_imm(Reg::R1, Reg::R1, -1);
            b.branch_imm(Cond::Ne, Reg::R1, 0, top);
        });
        let cfg = Cfg::build(&p);
        let doms = DominatorTree::compute(&cfg);
        let phis = place_phis(&p, &cfg, &doms);
        assert_eq!(phis[cfg.block_of(1)], vec![Reg::R1]);
    }

    #[test]
    fn unreachable_blocks_are_pruned() {
        let p = program(|b| {
            let done = b.label();
            b.jump(done);
            b.mov_imm(Reg::R0, 7);
            b.bind(done);
        });
        let cfg = Cfg::build(&p);
        assert_eq!(cfg.reachable(), vec![true, false, true]);
        let pruned = prune_unreachable(p, &cfg).unwrap();
        assert_eq!(pruned.ops, vec![Op::Jump { target: 1 }, Op::Halt]);
    }
}
