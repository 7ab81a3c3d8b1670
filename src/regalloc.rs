//! Single-pass register allocation.
//!
//! Virtual registers get a location on first use, in program order, and keep
//! it for the whole function. Physical registers are handed out in priority
//! order (callee-saved first), then spill slots. Running out of both is the
//! fatal `ProgramTooComplex`.
//!
//! Registers that need a phi at some join (loop counters, cursors carried
//! around a back edge) are placed before everything else, so they are the
//! last to land in a spill slot.

use std::fmt;

use crate::error::CompileError;
use crate::ir::{Program, Reg};

/// Physical registers available to virtual registers. Every other general
/// purpose register has a fixed role in generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysReg {
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
}

impl PhysReg {
    /// Allocation priority order.
    pub const ALL: [PhysReg; 6] = [
        PhysReg::Rbp,
        PhysReg::Rsi,
        PhysReg::Rdi,
        PhysReg::R8,
        PhysReg::R9,
        PhysReg::R10,
    ];

    /// Hardware register number.
    pub fn code(self) -> u8 {
        match self {
            PhysReg::Rbp => 5,
            PhysReg::Rsi => 6,
            PhysReg::Rdi => 7,
            PhysReg::R8 => 8,
            PhysReg::R9 => 9,
            PhysReg::R10 => 10,
        }
    }

    /// Preserved across calls by the System V ABI.
    pub fn is_callee_saved(self) -> bool {
        self == PhysReg::Rbp
    }

    /// Position in [`PhysReg::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PhysReg::Rbp => "rbp",
            PhysReg::Rsi => "rsi",
            PhysReg::Rdi => "rdi",
            PhysReg::R8 => "r8",
            PhysReg::R9 => "r9",
            PhysReg::R10 => "r10",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Reg(PhysReg),
    /// Index of an 8-byte spill slot.
    Spill(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// How many of [`PhysReg::ALL`] may be used.
    pub registers: usize,
    pub spill_slots: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            registers: PhysReg::ALL.len(),
            spill_slots: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    locs: [Option<Location>; Reg::COUNT],
    pub spill_slots: u32,
}

impl Allocation {
    pub fn location(&self, r: Reg) -> Option<Location> {
        self.locs[r.index()]
    }

    /// Every allocated virtual register with its location.
    pub fn iter(&self) -> impl Iterator<Item = (Reg, Location)> + '_ {
        self.locs
            .iter()
            .enumerate()
            .filter_map(|(i, l)| Some((Reg::from_index(i)?, (*l)?)))
    }

    /// Physical registers in use that a call clobbers.
    pub fn caller_saved(&self) -> Vec<PhysReg> {
        let mut out: Vec<PhysReg> = self
            .iter()
            .filter_map(|(_, l)| match l {
                Location::Reg(p) if !p.is_callee_saved() => Some(p),
                _ => None,
            })
            .collect();
        out.sort_by_key(|p| p.index());
        out
    }

    /// Bit `k` set when spill slot `k` holds a pointer register.
    pub fn spill_pointer_map(&self) -> u64 {
        self.iter()
            .filter(|(r, _)| r.is_ptr())
            .filter_map(|(_, l)| match l {
                Location::Spill(k) if k < 64 => Some(1u64 << k),
                _ => None,
            })
            .fold(0, |acc, bit| acc | bit)
    }
}

pub fn allocate(program: &Program, limits: Limits) -> Result<Allocation, CompileError> {
    allocate_merged(program, limits, &[])
}

/// Allocation with `joined`, the registers that need a phi at some join,
/// placed before the rest.
pub fn allocate_merged(program: &Program, limits: Limits, joined: &[Reg]) -> Result<Allocation, CompileError> {
    let mut merged = [false; Reg::COUNT];
    for r in joined {
        merged[r.index()] = true;
    }

    let mut alloc = Allocation {
        locs: [None; Reg::COUNT],
        spill_slots: 0,
    };
    let mut next_reg = 0usize;
    let registers = limits.registers.min(PhysReg::ALL.len());

    let mut assign = |r: Reg, alloc: &mut Allocation| -> Result<(), CompileError> {
        if alloc.locs[r.index()].is_some() {
            return Ok(());
        }
        let loc = if next_reg < registers {
            next_reg += 1;
            Location::Reg(PhysReg::ALL[next_reg - 1])
        } else if alloc.spill_slots < limits.spill_slots {
            alloc.spill_slots += 1;
            Location::Spill(alloc.spill_slots - 1)
        } else {
            return Err(CompileError::ProgramTooComplex(format!(
                "{}: no location left for {r}",
                program.name
            )));
        };
        alloc.locs[r.index()] = Some(loc);
        Ok(())
    };

    // The root pointer is live on entry.
    assign(Reg::P0, &mut alloc)?;
    for first in [true, false] {
        for op in &program.ops {
            for r in op.uses().into_iter().chain(op.defs()) {
                if !first || merged[r.index()] {
                    assign(r, &mut alloc)?;
                }
            }
        }
    }

    tracing::trace!(
        name = %program.name,
        registers = next_reg,
        merged = merged.iter().filter(|m| **m).count(),
        spills = alloc.spill_slots,
        "allocated registers"
    );
    Ok(alloc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Cond, Job, Width};
    use crate::runtime;

    fn touching(regs: &[Reg]) -> Program {
        let handles = runtime::builtin_handles();
        let mut b = Builder::new("t", Job::Decode, &handles);
        for r in regs {
            if r.is_ptr() {
                b.load_ptr(*r, Reg::P0, 0);
            } else {
                b.read_int(Width::W1, false, *r);
            }
        }
        b.halt();
        b.build().unwrap()
    }

    #[test]
    fn first_use_order_prefers_callee_saved() {
        let p = touching(&[Reg::R3, Reg::P2]);
        let a = allocate(&p, Limits::default()).unwrap();
        assert_eq!(a.location(Reg::P0), Some(Location::Reg(PhysReg::Rbp)));
        assert_eq!(a.location(Reg::R3), Some(Location::Reg(PhysReg::Rsi)));
        assert_eq!(a.location(Reg::P2), Some(Location::Reg(PhysReg::Rdi)));
        assert_eq!(a.location(Reg::R0), None);
        assert_eq!(a.caller_saved(), vec![PhysReg::Rsi, PhysReg::Rdi]);
    }

    #[test]
    fn overflow_spills_then_fails() {
        let regs = [Reg::R0, Reg::R1, Reg::R2, Reg::P1, Reg::P2];
        let p = touching(&regs);
        let a = allocate(
            &p,
            Limits {
                registers: 2,
                spill_slots: 8,
            },
        )
        .unwrap();
        assert_eq!(a.spill_slots, 4);
        assert_eq!(a.location(Reg::P2), Some(Location::Spill(3)));
        assert_eq!(a.spill_pointer_map(), 0b1100);

        let err = allocate(
            &p,
            Limits {
                registers: 2,
                spill_slots: 3,
            },
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::ProgramTooComplex(_)));
    }

    #[test]
    fn loop_carried_registers_are_placed_first() {
        let handles = runtime::builtin_handles();
        let mut b = Builder::new("t", Job::Decode, &handles);
        let top = b.label();
        b.read_int(Width::W1, false, Reg::R0);
        b.mov_imm(Reg::R1, 4);
        b.bind(top);
        b.add_imm(Reg::R1, Reg::R1, -1);
        b.branch_imm(Cond::Ne, Reg::R1, 0, top);
        b.halt();
        let p = b.build().unwrap();
        let limits = Limits {
            registers: 2,
            spill_slots: 4,
        };

        let plain = allocate(&p, limits).unwrap();
        assert_eq!(plain.location(Reg::R0), Some(Location::Reg(PhysReg::Rsi)));
        assert_eq!(plain.location(Reg::R1), Some(Location::Spill(0)));

        let merged = allocate_merged(&p, limits, &[Reg::R1]).unwrap();
        assert_eq!(merged.location(Reg::R1), Some(Location::Reg(PhysReg::Rsi)));
        assert_eq!(merged.location(Reg::R0), Some(Location::Spill(0)));
    }
}
