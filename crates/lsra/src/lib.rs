//! Linear scan register allocation.
//!
//! The allocator consumes a lowered procedure whose nodes carry register
//! *requirements* and decides register *assignments*: it gives every value a
//! physical register or a stack home at every point it is live, and inserts
//! the copy/reload/swap/spill nodes needed to reconcile locations across
//! control-flow edges.
//!
//! The passes run in a fixed order:
//! 1. Block sequencing ([`blockorder`])
//! 2. Candidate identification ([`candidates`])
//! 3. Interval and RefPosition construction ([`build`])
//! 4. The allocation sweep ([`allocate`], driven by [`select`])
//! 5. Writeback and edge resolution ([`resolve`], [`moves`])

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod allocate;
mod blockorder;
mod build;
mod candidates;
mod interval;
mod location;
mod moves;
mod refpos;
mod regs;
mod resolve;
mod select;
mod target;
mod verify;

pub use blockorder::BlockAllocInfo;
pub use interval::{ConstVal, Interval, IntervalFlags, IntervalId, IntervalKind};
pub use location::Location;
pub use refpos::{RefFlags, RefPosId, RefPosition, RefType, Referent};
pub use regs::{constrain, RegMask, RegRecord, RegType};
pub use select::{Heuristic, SelectionResult};
pub use target::{Arm32Target, TargetAbi, X64Target};

use alloc::{vec, vec::Vec};

use lsra_ir::{BlockId, LclId, PhysReg, Procedure, ValueType, VarSet};

/// Where the allocator is in its lifecycle. Each phase runs exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    New,
    Allocated,
    Resolved,
}

/// The linear scan register allocator for one procedure.
pub struct LinearScan<'a> {
    pub(crate) proc: &'a mut Procedure,
    pub(crate) target: &'a dyn TargetAbi,

    pub(crate) intervals: Vec<Interval>,
    pub(crate) ref_positions: Vec<RefPosition>,
    pub(crate) regs: Vec<RegRecord>,

    pub(crate) preds: Vec<Vec<BlockId>>,
    pub(crate) block_seq: Vec<BlockId>,
    pub(crate) block_info: Vec<BlockAllocInfo>,

    /// Interval of each register-candidate local, by `LclId`.
    pub(crate) local_intervals: Vec<Option<IntervalId>>,
    /// Tracked-variable indices that are register candidates.
    pub(crate) candidate_vars: VarSet,

    /// Register each live-in var is expected in at block entry (None = stack).
    pub(crate) in_maps: Vec<Vec<Option<PhysReg>>>,
    /// Register each live-out var occupies at block exit (None = stack).
    pub(crate) out_maps: Vec<Vec<Option<PhysReg>>>,

    /// High-water mark of concurrently spilled tree temps, per class.
    pub(crate) max_spill_temps: [u32; 2],

    /// Optional stress narrowing applied to every candidate mask query.
    pub(crate) stress_limit_mask: Option<RegMask>,

    phase: Phase,
}

impl<'a> LinearScan<'a> {
    pub fn new(proc: &'a mut Procedure, target: &'a dyn TargetAbi) -> Self {
        let reg_count = target.reg_count();
        let mut regs = Vec::with_capacity(reg_count);
        for i in 0..reg_count {
            let reg = PhysReg(i as u8);
            regs.push(RegRecord::new(reg, target.reg_class_of(reg)));
        }
        let local_count = proc.local_count();
        let block_count = proc.block_count();
        Self {
            proc,
            target,
            intervals: Vec::new(),
            ref_positions: Vec::new(),
            regs,
            preds: Vec::new(),
            block_seq: Vec::new(),
            block_info: vec![BlockAllocInfo::new(); block_count],
            local_intervals: vec![None; local_count],
            candidate_vars: VarSet::new(0),
            in_maps: Vec::new(),
            out_maps: Vec::new(),
            max_spill_temps: [0, 0],
            stress_limit_mask: None,
            phase: Phase::New,
        }
    }

    /// Restrict every candidate mask to `mask` (stress testing hook). Masks
    /// that would become empty are left unrestricted.
    pub fn set_stress_limit_mask(&mut self, mask: RegMask) {
        self.stress_limit_mask = Some(mask);
    }

    /// Run the allocator. May be called exactly once.
    pub fn do_linear_scan(&mut self) {
        assert!(
            self.phase == Phase::New,
            "linear scan already run on this allocator"
        );
        log::debug!("linear scan: {}", self.proc.name);

        self.build_block_sequence();
        self.identify_candidates();
        self.build_ref_positions();
        self.allocate_registers();
        self.phase = Phase::Allocated;
        self.resolve_registers();
        self.phase = Phase::Resolved;

        if cfg!(debug_assertions) {
            self.verify_final_allocation();
        }
    }

    // ---- queries used by code generation ----

    /// Number of blocks with boundary maps (grows with edge splits).
    pub fn block_map_count(&self) -> usize {
        self.in_maps.len()
    }

    /// The register each live-in var occupies at entry to `block`.
    pub fn in_var_to_reg_map(&self, block: BlockId) -> &[Option<PhysReg>] {
        &self.in_maps[block.index()]
    }

    /// The register each live-out var occupies at exit from `block`.
    pub fn out_var_to_reg_map(&self, block: BlockId) -> &[Option<PhysReg>] {
        &self.out_maps[block.index()]
    }

    /// Update live locals' `reg_num` to match `block`'s entry map.
    pub fn record_var_locations_at_start_of_bb(&mut self, block: BlockId) {
        assert!(self.phase == Phase::Resolved);
        let live_in = self.proc.block(block).live_in.clone();
        for (lcl_id, interval_id) in self.local_interval_pairs() {
            let var_index = match self.intervals[interval_id.index()].var_index() {
                Some(v) => v,
                None => continue,
            };
            if !live_in.contains(var_index) {
                continue;
            }
            let reg = self.in_maps[block.index()][var_index as usize];
            self.proc.lcl_mut(lcl_id).reg_num = reg;
        }
    }

    // ---- shared internals ----

    pub(crate) fn local_interval_pairs(&self) -> Vec<(LclId, IntervalId)> {
        self.local_intervals
            .iter()
            .enumerate()
            .filter_map(|(i, ivl)| ivl.map(|id| (LclId(i as u32), id)))
            .collect()
    }

    pub(crate) fn interval(&self, id: IntervalId) -> &Interval {
        &self.intervals[id.index()]
    }

    pub(crate) fn interval_mut(&mut self, id: IntervalId) -> &mut Interval {
        &mut self.intervals[id.index()]
    }

    pub(crate) fn refpos(&self, id: RefPosId) -> &RefPosition {
        &self.ref_positions[id.index()]
    }

    pub(crate) fn refpos_mut(&mut self, id: RefPosId) -> &mut RefPosition {
        &mut self.ref_positions[id.index()]
    }

    pub(crate) fn reg_record(&self, reg: PhysReg) -> &RegRecord {
        &self.regs[reg.index()]
    }

    pub(crate) fn reg_record_mut(&mut self, reg: PhysReg) -> &mut RegRecord {
        &mut self.regs[reg.index()]
    }

    /// The value type of an interval, for GC-ness queries.
    pub(crate) fn interval_value_type(&self, id: IntervalId) -> ValueType {
        self.intervals[id.index()].ty
    }

    /// Candidate mask for an interval, with the stress hook applied.
    pub(crate) fn candidate_mask(&self, reg_type: RegType) -> RegMask {
        let all = self.target.all_regs(reg_type);
        match self.stress_limit_mask {
            Some(limit) => constrain(all, limit, 1),
            None => all,
        }
    }

    /// Spill weight of a RefPosition.
    ///
    /// Candidate locals weigh their weighted ref count (halved for
    /// write-thru defs, decremented by a block unit once spilled); tree
    /// temps weigh four block units; anything else one block unit.
    pub(crate) fn get_weight(&self, rp: RefPosId) -> f64 {
        let rp = self.refpos(rp);
        let block_weight = self.proc.block(rp.block).weight;
        match rp.interval() {
            Some(id) => {
                let ivl = self.interval(id);
                match ivl.local() {
                    Some(lcl) => {
                        let mut weight = self.proc.lcl(lcl).ref_cnt_wtd;
                        if ivl.is_write_thru() && rp.ref_type.is_def() {
                            // Write-thru vars spill at def only.
                            weight *= 0.5;
                        } else if ivl.is_spilled() {
                            weight = (weight - 1.0).max(0.0);
                        }
                        weight
                    }
                    None => 4.0 * block_weight,
                }
            }
            None => block_weight,
        }
    }

    /// Location of the next fixed reference (or kill) of `reg`.
    pub(crate) fn next_fixed_ref_location(&self, reg: PhysReg) -> Location {
        self.reg_record(reg).next_fixed_loc
    }

    /// Location of an interval's next RefPosition strictly after `rp`.
    pub(crate) fn next_ref_location_after(&self, rp: RefPosId) -> Location {
        match self.refpos(rp).next {
            Some(next) => self.refpos(next).location,
            None => Location::MAX,
        }
    }
}
