//! Test harness for the register allocator.
//!
//! Parses procedure text, runs the full allocation pipeline, and returns
//! the annotated procedure together with the block-boundary maps so tests
//! can assert on the outcome without repeating the plumbing.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use lsra::{Arm32Target, LinearScan, RegMask, TargetAbi, X64Target};
use lsra_ir::{NodeKind, PhysReg, Procedure};

/// Everything a test usually wants to look at after allocation.
pub struct AllocationOutcome {
    pub proc: Procedure,
    /// Expected register of each tracked var at entry to each block.
    pub in_maps: Vec<Vec<Option<PhysReg>>>,
    /// Register of each tracked var at exit from each block.
    pub out_maps: Vec<Vec<Option<PhysReg>>>,
}

/// Parse, allocate, and resolve on the given target.
pub fn run_on(text: &str, target: &dyn TargetAbi) -> AllocationOutcome {
    run_with(text, target, None)
}

/// Same, with the candidate masks narrowed to `limit` (stress hook).
pub fn run_limited(text: &str, target: &dyn TargetAbi, limit: RegMask) -> AllocationOutcome {
    run_with(text, target, Some(limit))
}

fn run_with(text: &str, target: &dyn TargetAbi, limit: Option<RegMask>) -> AllocationOutcome {
    let mut proc = lsra_ir::parse_proc(text).expect("fixture must parse");
    let (in_maps, out_maps);
    {
        let mut lsra = LinearScan::new(&mut proc, target);
        if let Some(limit) = limit {
            lsra.set_stress_limit_mask(limit);
        }
        lsra.do_linear_scan();
        lsra.verify_final_allocation();
        let blocks = lsra.block_map_count();
        in_maps = (0..blocks)
            .map(|b| lsra.in_var_to_reg_map(lsra_ir::BlockId(b as u32)).to_vec())
            .collect();
        out_maps = (0..blocks)
            .map(|b| lsra.out_var_to_reg_map(lsra_ir::BlockId(b as u32)).to_vec())
            .collect();
    }
    AllocationOutcome {
        proc,
        in_maps,
        out_maps,
    }
}

/// Run on the x64 target.
pub fn run_x64(text: &str) -> AllocationOutcome {
    run_on(text, &X64Target)
}

/// Run on the 32-bit ARM target.
pub fn run_arm32(text: &str) -> AllocationOutcome {
    run_on(text, &Arm32Target)
}

impl AllocationOutcome {
    /// Count nodes matching a predicate across the whole procedure.
    pub fn count_nodes(&self, pred: impl Fn(&NodeKind) -> bool) -> usize {
        self.proc
            .blocks()
            .flat_map(|b| b.nodes.iter())
            .filter(|&&n| pred(&self.proc.node(n).kind))
            .count()
    }

    pub fn copies(&self) -> usize {
        self.count_nodes(|k| matches!(k, NodeKind::Copy { .. }))
    }

    pub fn reloads(&self) -> usize {
        self.count_nodes(|k| matches!(k, NodeKind::Reload { .. }))
    }

    pub fn swaps(&self) -> usize {
        self.count_nodes(|k| matches!(k, NodeKind::Swap { .. }))
    }

    /// The tracked index of a named local.
    pub fn var_index(&self, name: &str) -> usize {
        let lcl = self.proc.find_local(name).expect("local exists");
        self.proc.lcl(lcl).var_index as usize
    }
}
