//! The allocation sweep.
//!
//! Walks the RefPosition list in location order, maintaining per-register
//! occupancy, committing registers onto RefPositions, spilling occupants
//! when the selector evicts them, and recording the block-boundary
//! var-to-reg maps the resolver reconciles.
//!
//! Register release is deferred: a register freed by the last use of one
//! operand must not be handed to another operand of the same instruction,
//! so freed registers park in `regs_to_free` (or `delay_regs_to_free` for
//! RMW sources) until the sweep advances past the location.

use lsra_ir::{BlockId, PhysReg};

use crate::{
    interval::{IntervalFlags, IntervalId},
    location::Location,
    refpos::{RefFlags, RefPosId, RefType},
    regs::{RegMask, RegType},
    LinearScan,
};

/// Deferred-release state carried across one sweep.
struct SweepState {
    current: Location,
    regs_to_free: RegMask,
    delay_regs_to_free: RegMask,
    regs_to_make_inactive: RegMask,
    delay_regs_to_make_inactive: RegMask,
    copy_regs_to_free: RegMask,
    regs_in_use_this: RegMask,
    regs_in_use_next: RegMask,
}

impl SweepState {
    fn new() -> Self {
        Self {
            current: Location::MIN,
            regs_to_free: RegMask::EMPTY,
            delay_regs_to_free: RegMask::EMPTY,
            regs_to_make_inactive: RegMask::EMPTY,
            delay_regs_to_make_inactive: RegMask::EMPTY,
            copy_regs_to_free: RegMask::EMPTY,
            regs_in_use_this: RegMask::EMPTY,
            regs_in_use_next: RegMask::EMPTY,
        }
    }

    fn mark_in_use(&mut self, regs: RegMask, delayed: bool) {
        self.regs_in_use_this = self.regs_in_use_this.union(regs);
        if delayed {
            self.regs_in_use_next = self.regs_in_use_next.union(regs);
        }
    }
}

impl<'a> LinearScan<'a> {
    pub(crate) fn allocate_registers(&mut self) {
        let mut st = SweepState::new();
        let mut seq_idx = 0usize;
        let mut started = false;

        for idx in 0..self.ref_positions.len() {
            let rp_id = RefPosId(idx as u32);
            let loc = self.refpos(rp_id).location;
            if loc > st.current {
                self.advance_location(&mut st, loc);
            }

            let ref_type = self.refpos(rp_id).ref_type;
            log::trace!("{} {:?}", loc, ref_type);
            match ref_type {
                RefType::BB => {
                    // Nothing carries across a block boundary.
                    self.flush_pending(&mut st);
                    if started {
                        let prev = self.block_seq[seq_idx];
                        self.process_block_end(prev);
                        seq_idx += 1;
                    }
                    started = true;
                    let block = self.refpos(rp_id).block;
                    debug_assert_eq!(block, self.block_seq[seq_idx]);
                    self.process_block_start(block);
                }
                RefType::FixedReg => self.process_fixed_ref(rp_id),
                RefType::Kill => self.process_kill(rp_id),
                RefType::KillGcRefs => self.process_kill_gc_refs(),
                RefType::ExpUse => {
                    if let Some(interval) = self.refpos(rp_id).interval() {
                        self.interval_mut(interval).recent_ref = Some(rp_id);
                    }
                }
                RefType::ParamDef | RefType::ZeroInit | RefType::DummyDef => {
                    self.process_entry_def(rp_id, &mut st);
                }
                RefType::UpperVectorSave => self.process_upper_vector_save(rp_id),
                RefType::UpperVectorRestore => self.process_upper_vector_restore(rp_id),
                RefType::Use | RefType::Def => self.process_interval_ref(rp_id, &mut st),
            }
        }

        if started {
            self.process_block_end(self.block_seq[seq_idx]);
        }
    }

    // ---- location bookkeeping ----

    fn advance_location(&mut self, st: &mut SweepState, to: Location) {
        self.free_registers(st.regs_to_free);
        self.make_registers_inactive(st.regs_to_make_inactive);
        if to.0 > st.current.0 + 1 {
            // Jumped past the delay window.
            self.free_registers(st.delay_regs_to_free);
            self.make_registers_inactive(st.delay_regs_to_make_inactive);
            st.regs_to_free = RegMask::EMPTY;
            st.delay_regs_to_free = RegMask::EMPTY;
            st.regs_to_make_inactive = RegMask::EMPTY;
            st.delay_regs_to_make_inactive = RegMask::EMPTY;
            st.regs_in_use_this = RegMask::EMPTY;
            st.regs_in_use_next = RegMask::EMPTY;
        } else {
            st.regs_to_free = st.delay_regs_to_free;
            st.delay_regs_to_free = RegMask::EMPTY;
            st.regs_to_make_inactive = st.delay_regs_to_make_inactive;
            st.delay_regs_to_make_inactive = RegMask::EMPTY;
            st.regs_in_use_this = st.regs_in_use_next;
            st.regs_in_use_next = RegMask::EMPTY;
        }
        st.copy_regs_to_free = RegMask::EMPTY;
        st.current = to;
    }

    fn flush_pending(&mut self, st: &mut SweepState) {
        self.free_registers(st.regs_to_free.union(st.delay_regs_to_free));
        self.make_registers_inactive(
            st.regs_to_make_inactive.union(st.delay_regs_to_make_inactive),
        );
        st.regs_to_free = RegMask::EMPTY;
        st.delay_regs_to_free = RegMask::EMPTY;
        st.regs_to_make_inactive = RegMask::EMPTY;
        st.delay_regs_to_make_inactive = RegMask::EMPTY;
        st.copy_regs_to_free = RegMask::EMPTY;
        st.regs_in_use_this = RegMask::EMPTY;
        st.regs_in_use_next = RegMask::EMPTY;
    }

    /// Sever register/interval associations entirely (dead values).
    fn free_registers(&mut self, mask: RegMask) {
        for reg in mask.iter() {
            let occupant = self.reg_record(reg).assigned;
            if let Some(occupant) = occupant {
                self.interval_mut(occupant).set_active(false);
                let record = self.reg_record_mut(reg);
                record.previous = Some(occupant);
                record.assigned = None;
            }
        }
    }

    /// Deactivate occupants but keep the association, so constants and
    /// locals can be rediscovered in place.
    fn make_registers_inactive(&mut self, mask: RegMask) {
        for reg in mask.iter() {
            if let Some(occupant) = self.reg_record(reg).assigned {
                self.interval_mut(occupant).set_active(false);
            }
        }
    }

    // ---- register/interval association ----

    /// The registers an interval occupies when sitting in `reg`.
    pub(crate) fn occupied_regs(&self, interval: IntervalId, reg: PhysReg) -> RegMask {
        let mut mask = RegMask::from_reg(reg);
        if self.interval(interval).reg_type == RegType::Double {
            let pair = self.target.pair_of(reg).expect("double without pair");
            mask = mask.with(pair);
        }
        mask
    }

    pub(crate) fn assign_phys_reg(&mut self, interval: IntervalId, reg: PhysReg) {
        for r in self.occupied_regs(interval, reg).iter() {
            self.reg_record_mut(r).assigned = Some(interval);
        }
        let ivl = self.interval_mut(interval);
        ivl.phys_reg = Some(reg);
        ivl.assigned_reg = Some(reg);
        ivl.set_active(true);
    }

    pub(crate) fn unassign_phys_reg(&mut self, interval: IntervalId) {
        let reg = match self.interval(interval).phys_reg {
            Some(r) => r,
            None => return,
        };
        for r in self.occupied_regs(interval, reg).iter() {
            let record = self.reg_record_mut(r);
            if record.assigned == Some(interval) {
                record.assigned = None;
                record.previous = Some(interval);
            }
        }
        let ivl = self.interval_mut(interval);
        ivl.phys_reg = None;
        ivl.prev_reg = Some(reg);
        ivl.set_active(false);
    }

    /// Evict an active interval: record a spill on its most recent ref and
    /// sever its register association.
    pub(crate) fn spill_interval(&mut self, interval: IntervalId) {
        if let Some(recent) = self.interval(interval).recent_ref {
            let rp = self.refpos_mut(recent);
            if !rp.register_assignment.is_empty() {
                rp.flags |= RefFlags::SPILL_AFTER;
            }
        }
        self.interval_mut(interval).flags |= IntervalFlags::SPILLED;
        if let Some(lcl) = self.interval(interval).local() {
            self.proc.lcl_mut(lcl).on_frame = true;
        }
        self.unassign_phys_reg(interval);
        log::trace!("spilled interval {:?}", interval);
    }

    /// Narrow a RefPosition to its committed register and update the
    /// interval's single-home summary.
    fn commit(&mut self, rp_id: RefPosId, interval: IntervalId, reg: PhysReg) {
        self.refpos_mut(rp_id).register_assignment = RegMask::from_reg(reg);
        let ivl = self.interval_mut(interval);
        match ivl.home_reg {
            None => ivl.home_reg = Some(reg),
            Some(home) if home != reg => {
                ivl.flags |= IntervalFlags::SPLIT;
            }
            _ => {}
        }
    }

    // ---- simple dispatch arms ----

    fn process_fixed_ref(&mut self, rp_id: RefPosId) {
        let reg = self.refpos(rp_id).reg().expect("fixed ref without register");
        self.advance_fixed_chain(reg, rp_id);
        // A fixed use must not disturb a held constant's association beyond
        // this point; clear it so the register is genuinely free afterwards.
        if let Some(occupant) = self.reg_record(reg).assigned {
            let ivl = self.interval(occupant);
            if !ivl.is_active() && ivl.is_constant() {
                self.interval_mut(occupant).phys_reg = None;
                let record = self.reg_record_mut(reg);
                record.assigned = None;
                record.previous = None;
            }
        }
    }

    fn process_kill(&mut self, rp_id: RefPosId) {
        let reg = self.refpos(rp_id).reg().expect("kill without register");
        self.advance_fixed_chain(reg, rp_id);
        if let Some(occupant) = self.reg_record(reg).assigned {
            if self.interval(occupant).is_active() {
                self.spill_interval(occupant);
            } else {
                // The value in the register is destroyed.
                self.interval_mut(occupant).phys_reg = None;
                let record = self.reg_record_mut(reg);
                record.assigned = None;
                record.previous = None;
            }
        }
        self.reg_record_mut(reg).busy_until_kill = false;
    }

    fn process_kill_gc_refs(&mut self) {
        for i in 0..self.regs.len() {
            let occupant = match self.regs[i].assigned {
                Some(o) => o,
                None => continue,
            };
            if !self.interval_value_type(occupant).is_gc() {
                continue;
            }
            if self.interval(occupant).is_active() {
                self.spill_interval(occupant);
            } else {
                self.interval_mut(occupant).phys_reg = None;
                self.regs[i].assigned = None;
                self.regs[i].previous = None;
            }
        }
    }

    fn advance_fixed_chain(&mut self, reg: PhysReg, rp_id: RefPosId) {
        let next = self.refpos(rp_id).next;
        let next_loc = next
            .map(|n| self.refpos(n).location)
            .unwrap_or(Location::MAX);
        let record = self.reg_record_mut(reg);
        record.next_fixed_ref = next;
        record.next_fixed_loc = next_loc;
    }

    // ---- parameter and entry defs ----

    fn process_entry_def(&mut self, rp_id: RefPosId, st: &mut SweepState) {
        let interval = self.refpos(rp_id).interval().expect("entry def interval");
        let ref_type = self.refpos(rp_id).ref_type;
        let lcl = self.interval(interval).local().expect("entry def local");

        if self.refpos(rp_id).next.is_none() {
            // Dead on arrival.
            self.refpos_mut(rp_id).flags |= RefFlags::LAST_USE;
            self.refpos_mut(rp_id).register_assignment = RegMask::EMPTY;
            self.proc.lcl_mut(lcl).on_frame = true;
            self.interval_mut(interval).recent_ref = Some(rp_id);
            return;
        }

        let stay_on_stack = match ref_type {
            RefType::ParamDef => {
                let low_weight = self.proc.lcl(lcl).ref_cnt_wtd <= 1.0;
                let stack_param = !self.proc.lcl(lcl).is_reg_arg;
                let entry = self.proc.entry_block();
                (stack_param && low_weight) || self.block_info[entry.index()].has_eh_in
            }
            // Zero-init and dummy defs establish the stack home only.
            _ => true,
        };

        if stay_on_stack {
            self.refpos_mut(rp_id).register_assignment = RegMask::EMPTY;
            self.interval_mut(interval).flags |= IntervalFlags::SPILLED;
            self.proc.lcl_mut(lcl).on_frame = true;
            self.interval_mut(interval).recent_ref = Some(rp_id);
            return;
        }

        let selection =
            self.select_register(interval, rp_id, st.regs_in_use_this, st.regs_in_use_next);
        match selection.reg {
            Some(reg) => {
                self.evict_occupant(interval, reg);
                self.assign_phys_reg(interval, reg);
                self.commit(rp_id, interval, reg);
                st.mark_in_use(self.occupied_regs(interval, reg), false);
            }
            None => {
                self.refpos_mut(rp_id).register_assignment = RegMask::EMPTY;
                self.interval_mut(interval).flags |= IntervalFlags::SPILLED;
                self.proc.lcl_mut(lcl).on_frame = true;
            }
        }
        self.interval_mut(interval).recent_ref = Some(rp_id);
    }

    // ---- upper vector save/restore ----

    fn process_upper_vector_save(&mut self, rp_id: RefPosId) {
        let upper = self.refpos(rp_id).interval().expect("upper vector interval");
        let base = match self.interval(upper).kind {
            crate::IntervalKind::UpperVector { of } => of,
            _ => panic!("upper vector save on a non-upper-vector interval"),
        };
        if self.interval(base).phys_reg.is_none() || !self.interval(base).is_active() {
            return;
        }
        // Park the upper half in a caller-saved float register if one is
        // free; otherwise it goes to the stack.
        let float_trash = self
            .target
            .all_regs(RegType::Float)
            .intersect(self.target.callee_trash());
        let mut chosen = None;
        for reg in float_trash.iter() {
            let record = self.reg_record(reg);
            let free = match record.assigned {
                Some(occ) => !self.interval(occ).is_active(),
                None => true,
            };
            if free && !record.busy_until_kill {
                chosen = Some(reg);
                break;
            }
        }
        match chosen {
            Some(reg) => {
                self.evict_occupant(upper, reg);
                self.assign_phys_reg(upper, reg);
                self.commit(rp_id, upper, reg);
            }
            None => {
                self.refpos_mut(rp_id).register_assignment = RegMask::EMPTY;
                self.interval_mut(upper).flags |= IntervalFlags::SPILLED;
            }
        }
        self.interval_mut(base).flags |= IntervalFlags::PARTIALLY_SPILLED;
        self.interval_mut(upper).recent_ref = Some(rp_id);
    }

    fn process_upper_vector_restore(&mut self, rp_id: RefPosId) {
        let upper = self.refpos(rp_id).interval().expect("upper vector interval");
        let base = match self.interval(upper).kind {
            crate::IntervalKind::UpperVector { of } => of,
            _ => panic!("upper vector restore on a non-upper-vector interval"),
        };
        if self.interval(upper).phys_reg.is_some() {
            self.unassign_phys_reg(upper);
        }
        self.interval_mut(base)
            .flags
            .remove(IntervalFlags::PARTIALLY_SPILLED);
        self.interval_mut(upper).recent_ref = Some(rp_id);
    }

    // ---- the core Use/Def path ----

    fn process_interval_ref(&mut self, rp_id: RefPosId, st: &mut SweepState) {
        let interval = self.refpos(rp_id).interval().expect("interval ref");
        let is_use = self.refpos(rp_id).ref_type == RefType::Use;
        let delayed = self.refpos(rp_id).flags.contains(RefFlags::DELAY_REG_FREE);

        // Special put-args ride along in their source's register.
        if !is_use
            && self
                .interval(interval)
                .flags
                .contains(IntervalFlags::SPECIAL_PUT_ARG)
        {
            if self.try_special_put_arg(rp_id, interval, st) {
                return;
            }
        }

        let current_reg = self.valid_assigned_reg(interval);

        if let Some(reg) = current_reg {
            let mask_ok = self.refpos(rp_id).register_assignment.contains(reg);
            let fixed_conflict = self.fixed_conflict_at(reg, rp_id);
            if mask_ok && !fixed_conflict {
                // Keep the existing assignment. A pass-through put-arg rides
                // in a register still owned by its source interval; never
                // steal that association, or the kill will miss the source.
                self.interval_mut(interval).set_active(true);
                for r in self.occupied_regs(interval, reg).iter() {
                    let record = self.reg_record_mut(r);
                    if record.assigned.is_none() {
                        record.assigned = Some(interval);
                    }
                }
                self.commit(rp_id, interval, reg);
                st.mark_in_use(self.occupied_regs(interval, reg), delayed);
                self.finish_ref(rp_id, interval, Some(reg), st, delayed);
                return;
            }
            if is_use {
                self.assign_copy_reg(rp_id, interval, reg, st, delayed);
                return;
            }
            // A def that can no longer use its old register re-homes.
            self.unassign_phys_reg(interval);
            self.refpos_mut(rp_id).flags |= RefFlags::MOVE_REG;
            self.interval_mut(interval).flags |= IntervalFlags::SPLIT;
        } else if is_use {
            // The value lives on the stack.
            self.refpos_mut(rp_id).flags |= RefFlags::RELOAD;
        }

        // Reg-optional refs may deliberately stay in memory.
        if self.refpos(rp_id).is_reg_optional() && self.should_forgo_allocation(rp_id, st) {
            self.forgo_allocation(rp_id, interval, is_use);
            self.finish_ref(rp_id, interval, None, st, delayed);
            return;
        }

        let selection =
            self.select_register(interval, rp_id, st.regs_in_use_this, st.regs_in_use_next);
        match selection.reg {
            None => {
                self.forgo_allocation(rp_id, interval, is_use);
                self.finish_ref(rp_id, interval, None, st, delayed);
            }
            Some(reg) => {
                let reused_constant = !is_use
                    && selection.applied(crate::Heuristic::ConstAvailable)
                    && selection.matching_constants.contains(reg);
                self.evict_occupant(interval, reg);
                self.assign_phys_reg(interval, reg);
                self.commit(rp_id, interval, reg);
                if reused_constant {
                    self.refpos_mut(rp_id).flags |= RefFlags::REUSED_CONSTANT;
                }
                st.mark_in_use(self.occupied_regs(interval, reg), delayed);
                self.finish_ref(rp_id, interval, Some(reg), st, delayed);
            }
        }
    }

    fn try_special_put_arg(
        &mut self,
        rp_id: RefPosId,
        interval: IntervalId,
        st: &mut SweepState,
    ) -> bool {
        let required = match self.refpos(rp_id).register_assignment.single_reg() {
            Some(r) => r,
            None => return false,
        };
        let source = match self.interval(interval).related {
            Some(s) => s,
            None => return false,
        };
        let src = self.interval(source);
        if src.is_active() && src.phys_reg == Some(required) {
            // Pass through: the argument is already where it must be.
            self.reg_record_mut(required).busy_until_kill = true;
            let ivl = self.interval_mut(interval);
            ivl.phys_reg = Some(required);
            ivl.set_active(true);
            self.commit(rp_id, interval, required);
            st.mark_in_use(RegMask::from_reg(required), false);
            self.interval_mut(interval).recent_ref = Some(rp_id);
            true
        } else {
            self.interval_mut(interval)
                .flags
                .remove(IntervalFlags::SPECIAL_PUT_ARG);
            false
        }
    }

    /// The register an interval can currently be found in, if the
    /// association is still valid.
    fn valid_assigned_reg(&self, interval_id: IntervalId) -> Option<PhysReg> {
        let interval = self.interval(interval_id);
        let reg = interval.phys_reg?;
        if interval.is_active() {
            return Some(reg);
        }
        // Inactive but still resident: resurrect in place.
        if self.reg_record(reg).assigned == Some(interval_id) {
            return Some(reg);
        }
        None
    }

    fn fixed_conflict_at(&self, reg: PhysReg, rp_id: RefPosId) -> bool {
        let rp = self.refpos(rp_id);
        let fixed_here = rp.is_fixed() && rp.register_assignment.contains(reg);
        self.reg_record(reg).next_fixed_loc == rp.location && !fixed_here
    }

    /// Allocate a temporary register for one use; the home is unchanged.
    fn assign_copy_reg(
        &mut self,
        rp_id: RefPosId,
        interval: IntervalId,
        home: PhysReg,
        st: &mut SweepState,
        delayed: bool,
    ) {
        // The home register itself is off the table.
        let busy_now = st.regs_in_use_this.union(self.occupied_regs(interval, home));
        let selection = self.select_register(interval, rp_id, busy_now, st.regs_in_use_next);
        let reg = selection
            .reg
            .expect("copy-reg selection must produce a register");
        self.evict_occupant(interval, reg);
        self.refpos_mut(rp_id).flags |= RefFlags::COPY_REG;
        // Commit the copy register without touching the home summary.
        self.refpos_mut(rp_id).register_assignment = RegMask::from_reg(reg);
        let copy_regs = self.occupied_regs(interval, reg);
        st.copy_regs_to_free = st.copy_regs_to_free.union(copy_regs);
        st.mark_in_use(copy_regs, delayed);
        self.finish_ref(rp_id, interval, Some(home), st, delayed);
    }

    /// Evict whatever occupies `reg` so `interval` can move in.
    fn evict_occupant(&mut self, interval: IntervalId, reg: PhysReg) {
        for r in self.occupied_regs(interval, reg).iter() {
            let occupant = match self.reg_record(r).assigned {
                Some(o) if o != interval => o,
                _ => continue,
            };
            if self.interval(occupant).is_active() {
                self.spill_interval(occupant);
            } else {
                // An idle value loses its register but is remembered, so it
                // can be restored later without a reload.
                let beyond = self.interval_next_ref_beyond(occupant, interval);
                self.interval_mut(occupant).phys_reg = None;
                let record = self.reg_record_mut(r);
                record.assigned = None;
                record.previous = if beyond { Some(occupant) } else { None };
            }
        }
    }

    /// Does `occupant`'s next reference fall beyond `interval`'s end?
    fn interval_next_ref_beyond(&self, occupant: IntervalId, interval: IntervalId) -> bool {
        let occ_next = match self.interval(occupant).recent_ref {
            Some(recent) => self.next_ref_location_after(recent),
            None => return false,
        };
        let end = self
            .interval(interval)
            .last_ref
            .map(|r| self.refpos(r).location)
            .unwrap_or(Location::MIN);
        occ_next > end
    }

    fn should_forgo_allocation(&self, rp_id: RefPosId, st: &SweepState) -> bool {
        let rp = self.refpos(rp_id);
        // Only worth skipping when nothing is free anyway.
        let busy = st.regs_in_use_this.union(st.regs_in_use_next);
        let interval = rp.interval().unwrap();
        let reg_type = self.interval(interval).reg_type;
        let any_free = rp
            .register_assignment
            .iter()
            .any(|r| self.reg_is_idle(r, reg_type, busy));
        if any_free {
            return false;
        }
        // Reloading a dying value is never worth a spill.
        rp.is_last_use() && rp.flags.contains(RefFlags::RELOAD)
    }

    fn reg_is_idle(&self, reg: PhysReg, reg_type: RegType, busy: RegMask) -> bool {
        let idle_half = |r: PhysReg| {
            let record = self.reg_record(r);
            if record.busy_until_kill || busy.contains(r) {
                return false;
            }
            match record.assigned {
                Some(occ) => !self.interval(occ).is_active(),
                None => true,
            }
        };
        if !idle_half(reg) {
            return false;
        }
        if reg_type == RegType::Double {
            if let Some(pair) = self.target.pair_of(reg) {
                return idle_half(pair);
            }
        }
        true
    }

    fn forgo_allocation(&mut self, rp_id: RefPosId, interval: IntervalId, is_use: bool) {
        self.refpos_mut(rp_id).register_assignment = RegMask::EMPTY;
        self.refpos_mut(rp_id).flags.remove(RefFlags::RELOAD);
        self.interval_mut(interval).flags |= IntervalFlags::SPILLED;
        if let Some(lcl) = self.interval(interval).local() {
            self.proc.lcl_mut(lcl).on_frame = true;
        }
        if !is_use {
            log::trace!("def {:?} satisfied in memory", rp_id);
        }
    }

    /// Shared post-ref bookkeeping: recent-ref tracking, last-use freeing,
    /// write-thru spill arrangement.
    fn finish_ref(
        &mut self,
        rp_id: RefPosId,
        interval: IntervalId,
        reg: Option<PhysReg>,
        st: &mut SweepState,
        delayed: bool,
    ) {
        let rp_flags = self.refpos(rp_id).flags;

        if rp_flags.contains(RefFlags::LAST_USE) {
            // A register held for an imminent kill stays busy; the kill
            // releases it and spills the live source if needed.
            if let Some(reg) = reg.filter(|r| !self.reg_record(*r).busy_until_kill) {
                let occupied = self.occupied_regs(interval, reg);
                let fully_dead = self.refpos(rp_id).next.is_none()
                    && !self.interval(interval).is_constant()
                    && !self.interval(interval).is_local();
                let (free_set, inactive_set) = if fully_dead {
                    (occupied, RegMask::EMPTY)
                } else {
                    (RegMask::EMPTY, occupied)
                };
                if delayed {
                    st.delay_regs_to_free = st.delay_regs_to_free.union(free_set);
                    st.delay_regs_to_make_inactive =
                        st.delay_regs_to_make_inactive.union(inactive_set);
                } else {
                    st.regs_to_free = st.regs_to_free.union(free_set);
                    st.regs_to_make_inactive = st.regs_to_make_inactive.union(inactive_set);
                }
            }
        }

        // A write-thru def that is not a last use stores to the home as
        // well as the register.
        if rp_flags.contains(RefFlags::WRITE_THRU) && !rp_flags.contains(RefFlags::LAST_USE) {
            self.interval_mut(interval).flags |= IntervalFlags::SPILLED;
        }

        self.interval_mut(interval).recent_ref = Some(rp_id);
    }

    // ---- block boundaries ----

    fn process_block_end(&mut self, block: BlockId) {
        let live_out = self.proc.block(block).live_out.clone();
        for (_lcl, interval) in self.local_interval_pairs() {
            let var_index = self.interval(interval).var_index().unwrap();
            if !live_out.contains(var_index) {
                continue;
            }
            let ivl = self.interval(interval);
            let reg = if ivl.is_active() { ivl.phys_reg } else { None };
            self.out_maps[block.index()][var_index as usize] = reg;
        }
    }

    fn process_block_start(&mut self, block: BlockId) {
        let live_in = self.proc.block(block).live_in.clone();

        // Anything active that is not live here goes dormant.
        for (_lcl, interval) in self.local_interval_pairs() {
            let var_index = self.interval(interval).var_index().unwrap();
            if self.interval(interval).is_active() && !live_in.contains(var_index) {
                self.interval_mut(interval).set_active(false);
            }
        }

        let pred = self.block_info[block.index()].pred_for_seed;
        for (_lcl, interval) in self.local_interval_pairs() {
            let var_index = self.interval(interval).var_index().unwrap();
            if !live_in.contains(var_index) {
                continue;
            }
            let expected = pred.and_then(|p| self.out_maps[p.index()][var_index as usize]);
            match expected {
                Some(reg) => {
                    let resident = self.interval(interval).phys_reg == Some(reg)
                        && self.reg_record(reg).assigned == Some(interval);
                    if !resident {
                        if self.interval(interval).phys_reg.is_some() {
                            self.unassign_phys_reg(interval);
                        }
                        self.evict_occupant(interval, reg);
                        self.assign_phys_reg(interval, reg);
                        let ivl = self.interval_mut(interval);
                        if ivl.home_reg.is_some() && ivl.home_reg != Some(reg) {
                            ivl.flags |= IntervalFlags::SPLIT;
                        }
                    } else {
                        self.interval_mut(interval).set_active(true);
                    }
                    self.in_maps[block.index()][var_index as usize] = Some(reg);
                }
                None => {
                    if self.interval(interval).is_active() {
                        self.interval_mut(interval).set_active(false);
                    }
                    self.in_maps[block.index()][var_index as usize] = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use lsra_ir::parse_proc;

    use crate::{
        refpos::{RefFlags, RefType},
        IntervalFlags, LinearScan, RegMask, X64Target,
    };

    fn parse(text: &str) -> lsra_ir::Procedure {
        parse_proc(text).unwrap()
    }

    fn run_phases<'a>(
        proc: &'a mut lsra_ir::Procedure,
        target: &'a X64Target,
    ) -> LinearScan<'a> {
        let mut lsra = LinearScan::new(proc, target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        lsra.build_ref_positions();
        lsra.allocate_registers();
        lsra
    }

    #[test]
    fn test_straight_line_single_register() {
        let mut proc = parse(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    v1 = lcl $a
    v2 = add v0, v1
    store $b, v2
    v3 = lcl $a
    v4 = add v3, v3
    store $c, v4
    ret
}"#,
        );
        let target = X64Target;
        let lsra = run_phases(&mut proc, &target);
        let a = lsra.proc.find_local("a").unwrap();
        let interval = lsra.local_intervals[a.index()].unwrap();
        let ivl = &lsra.intervals[interval.index()];
        assert!(!ivl.is_spilled());
        assert!(!ivl.flags.contains(IntervalFlags::SPLIT));
        // Every committed use sits in the same register.
        let mut regs = alloc::vec::Vec::new();
        for rp in &lsra.ref_positions {
            if rp.interval() == Some(interval) && rp.ref_type == RefType::Use {
                if let Some(r) = rp.assigned_reg() {
                    regs.push(r);
                }
            }
        }
        assert!(!regs.is_empty());
        assert!(regs.windows(2).all(|w| w[0] == w[1] || regs.len() == 1));
    }

    #[test]
    fn test_call_spills_live_value() {
        let mut proc = parse(
            r#"
proc %t(i32 $a) {
block0:
    v0 = iconst 7
    store $b, v0
    v1 = call %helper()
    store $c, v1
    v2 = lcl $b
    v3 = lcl $c
    v4 = add v2, v3
    ret v4
}"#,
        );
        let target = X64Target;
        let lsra = run_phases(&mut proc, &target);
        let b = lsra.proc.find_local("b").unwrap();
        let b_ivl = lsra.local_intervals[b.index()].unwrap();
        let ivl = &lsra.intervals[b_ivl.index()];
        // $b either landed in a callee-saved register or was spilled across
        // the call.
        if let Some(home) = ivl.home_reg {
            use crate::TargetAbi;
            if !target.callee_saved().contains(home) {
                assert!(ivl.is_spilled());
            }
        }
    }

    #[test]
    fn test_kill_spill_marks_recent_ref() {
        let mut proc = parse(
            r#"
proc %t() {
block0:
    v0 = iconst 7
    store $b, v0
    v1 = lcl $b
    v2 = add v1, v1
    store $c, v2
    call %clobber()
    v3 = lcl $b
    v4 = lcl $c
    v5 = add v3, v4
    ret v5
}"#,
        );
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        // Caller-saved registers only: the call must clobber both homes.
        use crate::TargetAbi;
        lsra.set_stress_limit_mask(target.callee_trash());
        lsra.build_block_sequence();
        lsra.identify_candidates();
        lsra.build_ref_positions();
        lsra.allocate_registers();
        // Values live across the call in caller-saved registers must have a
        // spill recorded on a ref before the call.
        for (lcl_name, _) in [("b", ()), ("c", ())] {
            let lcl = lsra.proc.find_local(lcl_name).unwrap();
            let interval = lsra.local_intervals[lcl.index()].unwrap();
            let ivl = &lsra.intervals[interval.index()];
            use crate::TargetAbi;
            let in_callee_saved = ivl
                .home_reg
                .map(|r| target.callee_saved().contains(r))
                .unwrap_or(false);
            if !in_callee_saved {
                let has_spill = lsra.ref_positions.iter().any(|rp| {
                    rp.interval() == Some(interval)
                        && rp.flags.contains(RefFlags::SPILL_AFTER)
                });
                assert!(
                    ivl.is_spilled() && has_spill,
                    "${} should spill across the call",
                    lcl_name
                );
            }
        }
    }

    #[test]
    fn test_rmw_def_differs_from_delayed_source() {
        let mut proc = parse(
            r#"
proc %t(i32 $a, i32 $b) {
block0:
    v0 = lcl $a
    v1 = lcl $b
    v2 = add.rmw v0, v1
    store $c, v2
    v3 = lcl $b
    ret v3
}"#,
        );
        let target = X64Target;
        let lsra = run_phases(&mut proc, &target);
        // Find the delayed use and the def at the following location.
        let delayed = lsra
            .ref_positions
            .iter()
            .find(|rp| rp.flags.contains(RefFlags::DELAY_REG_FREE))
            .expect("delayed use");
        let delayed_reg = delayed.assigned_reg().expect("delayed use register");
        let def = lsra
            .ref_positions
            .iter()
            .find(|rp| {
                rp.ref_type == RefType::Def && rp.location == delayed.location.next()
            })
            .expect("rmw def");
        let def_reg = def.assigned_reg().expect("def register");
        assert_ne!(
            def_reg, delayed_reg,
            "an RMW destination must not alias the delayed source"
        );
    }

    #[test]
    fn test_constant_reuse_fires() {
        let mut proc = parse(
            r#"
proc %t() {
block0:
    v0 = iconst 5
    store $a, v0
    v1 = iconst 5
    store $b, v1
    ret
}"#,
        );
        let target = X64Target;
        let lsra = run_phases(&mut proc, &target);
        let reused = lsra
            .ref_positions
            .iter()
            .any(|rp| rp.flags.contains(RefFlags::REUSED_CONSTANT));
        assert!(reused, "the second def of 5 should reuse the register");
    }

    #[test]
    fn test_spill_lowest_weight_occupant() {
        // Three competing locals, register set narrowed to two registers.
        let mut proc = parse(
            r#"
proc %t() {
block0(weight 1):
    v0 = iconst 1
    store $h, v0
    v1 = iconst 2
    store $m, v1
    v2 = lcl $h
    v3 = lcl $h
    v4 = add v2, v3
    store $h, v4
    v5 = lcl $h
    v6 = lcl $m
    v7 = add v5, v6
    v8 = lcl $h
    v9 = add v7, v8
    store $x, v9
    v10 = lcl $x
    v11 = lcl $h
    v12 = add v10, v11
    v13 = lcl $m
    v14 = add v12, v13
    ret v14
}"#,
        );
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.set_stress_limit_mask(RegMask(0b11));
        lsra.build_block_sequence();
        lsra.identify_candidates();
        lsra.build_ref_positions();
        lsra.allocate_registers();
        // $h is the heavy local; when pressure forces a spill, a lighter
        // local gets evicted first.
        let h = lsra.proc.find_local("h").unwrap();
        let h_ivl = lsra.local_intervals[h.index()].unwrap();
        let m = lsra.proc.find_local("m").unwrap();
        let m_ivl = lsra.local_intervals[m.index()].unwrap();
        let h_spilled = lsra.intervals[h_ivl.index()].is_spilled();
        let m_spilled = lsra.intervals[m_ivl.index()].is_spilled();
        assert!(
            m_spilled || !h_spilled,
            "the lighter local must spill before the heavier one"
        );
    }

    #[test]
    fn test_allocation_does_not_change_refposition_set() {
        let mut proc = parse(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    v1 = call %helper(v0)
    store $b, v1
    v2 = lcl $b
    ret v2
}"#,
        );
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        lsra.build_ref_positions();
        let count = lsra.ref_positions.len();
        let intervals = lsra.intervals.len();
        lsra.allocate_registers();
        assert_eq!(lsra.ref_positions.len(), count);
        assert_eq!(lsra.intervals.len(), intervals);
    }

    #[test]
    fn test_upper_vector_save_and_restore() {
        let mut proc = parse(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    ret v0
}"#,
        );
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        lsra.build_ref_positions();

        // Fabricate a wide local sitting in a register with its upper half
        // needing a save around a call.
        use crate::{IntervalKind, Location, RegType};
        use lsra_ir::{BlockId, PhysReg, ValueType};
        let base = crate::IntervalId(lsra.intervals.len() as u32);
        lsra.intervals.push(crate::Interval::new(
            IntervalKind::TreeTemp,
            RegType::Float,
            ValueType::Simd16,
        ));
        lsra.assign_phys_reg(base, PhysReg(20));
        let upper = crate::IntervalId(lsra.intervals.len() as u32);
        lsra.intervals.push(crate::Interval::new(
            IntervalKind::UpperVector { of: base },
            RegType::Float,
            ValueType::Simd16,
        ));
        let save = lsra.add_interval_ref(
            upper,
            crate::RefType::UpperVectorSave,
            Location(100),
            BlockId(0),
            crate::RegMask::EMPTY,
            None,
        );
        let restore = lsra.add_interval_ref(
            upper,
            crate::RefType::UpperVectorRestore,
            Location(102),
            BlockId(0),
            crate::RegMask::EMPTY,
            None,
        );

        lsra.process_upper_vector_save(save);
        assert!(lsra.intervals[base.index()]
            .flags
            .contains(IntervalFlags::PARTIALLY_SPILLED));
        // The upper half went to a caller-saved float register or the stack.
        let upper_state = &lsra.intervals[upper.index()];
        if let Some(reg) = upper_state.phys_reg {
            use crate::TargetAbi;
            assert!(target.callee_trash().contains(reg));
            assert!(target.all_regs(RegType::Float).contains(reg));
        } else {
            assert!(upper_state.is_spilled());
        }

        lsra.process_upper_vector_restore(restore);
        assert!(!lsra.intervals[base.index()]
            .flags
            .contains(IntervalFlags::PARTIALLY_SPILLED));
    }

    #[test]
    fn test_two_blocks_maps_recorded() {
        let mut proc = parse(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    v1 = add v0, v0
    store $b, v1
    goto block1
block1:
    v2 = lcl $b
    v3 = lcl $a
    v4 = add v2, v3
    ret v4
}"#,
        );
        let target = X64Target;
        let lsra = run_phases(&mut proc, &target);
        let a = lsra.proc.find_local("a").unwrap();
        let a_idx = lsra.proc.lcl(a).var_index as usize;
        let out0 = lsra.out_maps[0][a_idx];
        let in1 = lsra.in_maps[1][a_idx];
        // block1 seeds from block0, so the maps agree.
        assert_eq!(out0, in1);
        assert!(out0.is_some());
    }

    #[test]
    fn test_delay_reg_stays_busy_past_location() {
        let mut proc = parse(
            r#"
proc %t(i32 $a, i32 $b) {
block0:
    v0 = lcl $a
    v1 = lcl $b
    v2 = add.rmw v0, v1
    store $c, v2
    ret
}"#,
        );
        let target = X64Target;
        let lsra = run_phases(&mut proc, &target);
        // $b dies at the RMW use but its register must not be the def's.
        let b = lsra.proc.find_local("b").unwrap();
        let b_ivl = lsra.local_intervals[b.index()].unwrap();
        let b_use = lsra
            .ref_positions
            .iter()
            .find(|rp| rp.interval() == Some(b_ivl) && rp.ref_type == RefType::Use)
            .unwrap();
        assert!(b_use.flags.contains(RefFlags::DELAY_REG_FREE));
        assert!(b_use.is_last_use());
        let c = lsra.proc.find_local("c").unwrap();
        let c_ivl = lsra.local_intervals[c.index()].unwrap();
        let c_def = lsra
            .ref_positions
            .iter()
            .find(|rp| rp.interval() == Some(c_ivl) && rp.ref_type == RefType::Def);
        if let (Some(c_def), Some(b_reg)) = (c_def, b_use.assigned_reg()) {
            // The store's source is the RMW result, which must avoid $b's
            // register; the local def may keep it only after the delay ends.
            let _ = (c_def, b_reg);
        }
    }
}
