//! Register selection.
//!
//! Given an interval and a RefPosition, the selector runs a fixed tower of
//! heuristics over the candidate mask. Each heuristic computes a subset; if
//! the intersection with the surviving candidates is non-empty the
//! candidates are narrowed and the heuristic is recorded in the score,
//! otherwise the candidates are left alone. Selection stops as soon as one
//! register remains.
//!
//! When no free register survives, selection switches to the spill
//! heuristics, which choose the cheapest eligible occupant to evict.

use lsra_ir::PhysReg;

use crate::{
    interval::IntervalId,
    location::Location,
    refpos::{RefFlags, RefPosId},
    regs::{RegMask, RegType},
    LinearScan,
};

/// The selection heuristics, in the order they are applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Heuristic {
    Free,
    ConstAvailable,
    ThisAssigned,
    Covers,
    OwnPreference,
    CoversRelated,
    RelatedPreference,
    CallerCallee,
    Unassigned,
    CoversFull,
    BestFit,
    IsPrevReg,
    RegOrder,
    // Spill selection.
    SpillCost,
    FarNextRef,
    PrevRegOpt,
    RegNum,
}

const FREE_HEURISTICS: &[Heuristic] = &[
    Heuristic::Free,
    Heuristic::ConstAvailable,
    Heuristic::ThisAssigned,
    Heuristic::Covers,
    Heuristic::OwnPreference,
    Heuristic::CoversRelated,
    Heuristic::RelatedPreference,
    Heuristic::CallerCallee,
    Heuristic::Unassigned,
    Heuristic::CoversFull,
    Heuristic::BestFit,
    Heuristic::IsPrevReg,
    Heuristic::RegOrder,
];

impl Heuristic {
    /// Bit recorded in the selection score when the heuristic applies.
    pub fn score_bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Outcome of one selection, including the side sets the allocation pass
/// consults.
#[derive(Clone, Debug)]
pub struct SelectionResult {
    /// The chosen register, or `None` when a reg-optional ref should be
    /// satisfied from memory.
    pub reg: Option<PhysReg>,
    /// Which heuristics narrowed the candidate set.
    pub score: u32,
    pub free_candidates: RegMask,
    pub matching_constants: RegMask,
    pub unassigned_set: RegMask,
}

impl SelectionResult {
    pub fn applied(&self, heuristic: Heuristic) -> bool {
        self.score & heuristic.score_bit() != 0
    }
}

struct SelectionState {
    candidates: RegMask,
    score: u32,
}

impl SelectionState {
    /// Narrow to `subset` if the intersection is non-empty.
    fn try_select(&mut self, heuristic: Heuristic, subset: RegMask) -> bool {
        let narrowed = self.candidates.intersect(subset);
        if narrowed.is_empty() {
            return false;
        }
        self.candidates = narrowed;
        self.score |= heuristic.score_bit();
        true
    }

    fn found(&self) -> bool {
        self.candidates.is_single()
    }
}

impl<'a> LinearScan<'a> {
    /// Pick a register for `rp` from its candidate mask.
    ///
    /// `busy_now` and `busy_next` are the registers committed at the current
    /// and next location (copy regs, delayed RMW sources); they are never
    /// selectable.
    pub(crate) fn select_register(
        &self,
        interval_id: IntervalId,
        rp_id: RefPosId,
        busy_now: RegMask,
        busy_next: RegMask,
    ) -> SelectionResult {
        let interval = self.interval(interval_id);
        let rp = self.refpos(rp_id);
        let current = rp.location;
        let reg_type = interval.reg_type;
        let interval_end = interval
            .last_ref
            .map(|r| self.refpos(r).location)
            .unwrap_or(current);
        let busy = busy_now.union(busy_next);

        let mut state = SelectionState {
            candidates: rp.register_assignment,
            score: 0,
        };

        // Side sets, computed once.
        let mut free_candidates = RegMask::EMPTY;
        let mut matching_constants = RegMask::EMPTY;
        let mut unassigned_set = RegMask::EMPTY;
        for reg in rp.register_assignment.iter() {
            if !self.reg_free_for(reg, reg_type, rp_id, busy) {
                continue;
            }
            free_candidates = free_candidates.with(reg);
            if self.holds_matching_constant(reg, interval_id) {
                matching_constants = matching_constants.with(reg);
            }
            if self.reg_record(reg).assigned.is_none()
                && self.next_fixed_ref_location(reg) > interval_end
            {
                unassigned_set = unassigned_set.with(reg);
            }
        }

        if free_candidates.is_empty() {
            // Nothing free: straight to spill selection.
            let reg = self.select_spill_register(
                interval_id,
                rp_id,
                busy,
                &mut state,
            );
            return SelectionResult {
                reg,
                score: state.score,
                free_candidates,
                matching_constants,
                unassigned_set,
            };
        }

        let preferences = interval.preferences;
        let related = interval.related.map(|r| self.interval(r));
        let related_prefs = related.map(|r| r.preferences).unwrap_or(RegMask::EMPTY);
        let related_end = interval
            .related
            .and_then(|r| self.interval(r).last_ref)
            .map(|r| self.refpos(r).location)
            .unwrap_or(Location::MIN);

        let covers_set = |end: Location, within: RegMask| {
            let mut covered = RegMask::EMPTY;
            for reg in within.iter() {
                if self.reg_next_ref_location(reg, interval_id) >= end {
                    covered = covered.with(reg);
                }
            }
            covered
        };

        let prefer_callee = interval.flags.contains(crate::IntervalFlags::PREFER_CALLEE_SAVE)
            || (interval.is_write_thru() && rp.ref_type.is_def());

        for &heuristic in FREE_HEURISTICS {
            let subset = match heuristic {
                Heuristic::Free => free_candidates,
                Heuristic::ConstAvailable => {
                    if interval.is_constant() && rp.ref_type.is_def() {
                        matching_constants
                    } else {
                        RegMask::EMPTY
                    }
                }
                Heuristic::ThisAssigned => match interval.assigned_reg {
                    Some(reg) => RegMask::from_reg(reg).intersect(free_candidates),
                    None => RegMask::EMPTY,
                },
                Heuristic::Covers => {
                    covers_set(interval_end, preferences.intersect(free_candidates))
                }
                Heuristic::OwnPreference => preferences.intersect(free_candidates),
                Heuristic::CoversRelated => {
                    covers_set(related_end, related_prefs.intersect(free_candidates))
                }
                Heuristic::RelatedPreference => related_prefs,
                Heuristic::CallerCallee => {
                    if prefer_callee {
                        self.target.callee_saved()
                    } else {
                        self.target.callee_trash()
                    }
                }
                Heuristic::Unassigned => unassigned_set,
                Heuristic::CoversFull => covers_set(interval_end, free_candidates),
                Heuristic::BestFit => {
                    self.best_fit_set(&state, interval_id, interval_end)
                }
                Heuristic::IsPrevReg => {
                    if state.score & Heuristic::CoversFull.score_bit() != 0 {
                        match interval.prev_reg {
                            Some(reg) => RegMask::from_reg(reg),
                            None => RegMask::EMPTY,
                        }
                    } else {
                        RegMask::EMPTY
                    }
                }
                Heuristic::RegOrder => self.reg_order_set(&state, reg_type),
                _ => unreachable!(),
            };
            state.try_select(heuristic, subset);
            if state.found() {
                break;
            }
        }

        let reg = if state.score & Heuristic::Free.score_bit() != 0 {
            state.candidates.lowest()
        } else {
            // Free set existed but did not intersect the candidates (all
            // candidate registers are busy): spill selection.
            self.select_spill_register(interval_id, rp_id, busy, &mut state)
        };

        SelectionResult {
            reg,
            score: state.score,
            free_candidates,
            matching_constants,
            unassigned_set,
        }
    }

    // ---- free-set machinery ----

    /// Whether `reg` can be handed out without evicting anyone.
    fn reg_free_for(
        &self,
        reg: PhysReg,
        reg_type: RegType,
        rp_id: RefPosId,
        busy: RegMask,
    ) -> bool {
        if !self.reg_half_free(reg, rp_id, busy) {
            return false;
        }
        if reg_type == RegType::Double {
            let pair = self
                .target
                .pair_of(reg)
                .expect("double register without a pair");
            if !self.reg_half_free(pair, rp_id, busy) {
                return false;
            }
        }
        true
    }

    fn reg_half_free(&self, reg: PhysReg, rp_id: RefPosId, busy: RegMask) -> bool {
        let rp = self.refpos(rp_id);
        let record = self.reg_record(reg);
        if record.busy_until_kill || busy.contains(reg) {
            return false;
        }
        if let Some(occupant) = record.assigned {
            if self.interval(occupant).is_active() {
                return false;
            }
        }
        // A fixed need at this location (that is not this ref's own) blocks.
        let fixed_here = rp.is_fixed() && rp.register_assignment.contains(reg);
        if record.next_fixed_loc == rp.location && !fixed_here {
            return false;
        }
        // Delayed refs keep their register through the next location.
        if rp.flags.contains(RefFlags::DELAY_REG_FREE)
            && record.next_fixed_loc == rp.location.next()
        {
            return false;
        }
        true
    }

    /// When the register is next needed by anything other than `exclude`.
    pub(crate) fn reg_next_ref_location(&self, reg: PhysReg, exclude: IntervalId) -> Location {
        let record = self.reg_record(reg);
        let mut loc = record.next_fixed_loc;
        if let Some(occupant) = record.assigned {
            if occupant != exclude {
                loc = loc.min(self.interval_next_ref_location(occupant));
            }
        }
        loc
    }

    fn interval_next_ref_location(&self, interval: IntervalId) -> Location {
        let ivl = self.interval(interval);
        match ivl.recent_ref {
            Some(recent) => self.next_ref_location_after(recent),
            None => ivl
                .first_ref
                .map(|r| self.refpos(r).location)
                .unwrap_or(Location::MAX),
        }
    }

    fn holds_matching_constant(&self, reg: PhysReg, interval_id: IntervalId) -> bool {
        let interval = self.interval(interval_id);
        let occupant = match self.reg_record(reg).assigned {
            Some(o) => o,
            None => return false,
        };
        let occupant = self.interval(occupant);
        if occupant.is_active() || !occupant.is_constant() || !interval.is_constant() {
            return false;
        }
        match (occupant.const_val, interval.const_val) {
            (Some(a), Some(b)) => a.matches(&b),
            _ => false,
        }
    }

    /// With full coverage available, prefer the register whose next use
    /// comes soonest (waste the least); otherwise the one that stays free
    /// the longest.
    fn best_fit_set(
        &self,
        state: &SelectionState,
        interval_id: IntervalId,
        _interval_end: Location,
    ) -> RegMask {
        let minimize = state.score & Heuristic::CoversFull.score_bit() != 0;
        let mut best: Option<Location> = None;
        for reg in state.candidates.iter() {
            let loc = self.reg_next_ref_location(reg, interval_id);
            best = Some(match best {
                None => loc,
                Some(b) => {
                    if minimize {
                        b.min(loc)
                    } else {
                        b.max(loc)
                    }
                }
            });
        }
        let best = match best {
            Some(b) => b,
            None => return RegMask::EMPTY,
        };
        let mut set = RegMask::EMPTY;
        for reg in state.candidates.iter() {
            if self.reg_next_ref_location(reg, interval_id) == best {
                set = set.with(reg);
            }
        }
        set
    }

    fn reg_order_set(&self, state: &SelectionState, reg_type: RegType) -> RegMask {
        for &reg in self.target.alloc_order(reg_type) {
            if state.candidates.contains(reg) {
                return RegMask::from_reg(reg);
            }
        }
        RegMask::EMPTY
    }

    // ---- spill selection ----

    fn select_spill_register(
        &self,
        interval_id: IntervalId,
        rp_id: RefPosId,
        busy: RegMask,
        state: &mut SelectionState,
    ) -> Option<PhysReg> {
        let rp = self.refpos(rp_id);
        let reg_type = self.interval(interval_id).reg_type;

        let mut eligible = RegMask::EMPTY;
        for reg in state.candidates.iter() {
            if self.spill_eligible(reg, reg_type, rp_id, busy) {
                eligible = eligible.with(reg);
            }
        }
        if eligible.is_empty() {
            if rp.is_reg_optional() {
                return None;
            }
            panic!(
                "unsatisfiable register constraint at {}: no spillable candidate",
                rp.location
            );
        }
        state.candidates = eligible;

        // SPILL_COST: evict the cheapest occupant.
        let cost_of = |reg: PhysReg| -> f64 {
            let occupant = self.reg_record(reg).assigned.expect("eligible reg occupant");
            let recent = self.interval(occupant).recent_ref.expect("occupant recent ref");
            self.get_weight(recent)
        };
        let mut best_cost = f64::INFINITY;
        for reg in state.candidates.iter() {
            best_cost = best_cost.min(cost_of(reg));
        }
        if rp.is_reg_optional() {
            let own = self.get_weight(rp_id);
            if best_cost >= own {
                // Not worth evicting anyone; use memory.
                return None;
            }
        }
        let mut cheapest = RegMask::EMPTY;
        for reg in state.candidates.iter() {
            if cost_of(reg) == best_cost {
                cheapest = cheapest.with(reg);
            }
        }
        state.try_select(Heuristic::SpillCost, cheapest);
        if state.found() {
            return state.candidates.lowest();
        }

        // FAR_NEXT_REF: among ties, the occupant needed furthest away.
        let mut far = Location::MIN;
        for reg in state.candidates.iter() {
            let occupant = self.reg_record(reg).assigned.unwrap();
            far = far.max(self.interval_next_ref_location(occupant));
        }
        let mut farthest = RegMask::EMPTY;
        for reg in state.candidates.iter() {
            let occupant = self.reg_record(reg).assigned.unwrap();
            if self.interval_next_ref_location(occupant) == far {
                farthest = farthest.with(reg);
            }
        }
        state.try_select(Heuristic::FarNextRef, farthest);
        if state.found() {
            return state.candidates.lowest();
        }

        // PREV_REG_OPT: a reg-optional occupant is a weak hold.
        let mut weak = RegMask::EMPTY;
        for reg in state.candidates.iter() {
            let occupant = self.reg_record(reg).assigned.unwrap();
            if let Some(recent) = self.interval(occupant).recent_ref {
                if self.refpos(recent).is_reg_optional() {
                    weak = weak.with(reg);
                }
            }
        }
        state.try_select(Heuristic::PrevRegOpt, weak);
        if state.found() {
            return state.candidates.lowest();
        }

        state.score |= Heuristic::RegNum.score_bit();
        state.candidates.lowest()
    }

    /// Whether the occupant of `reg` may be evicted right now.
    fn spill_eligible(
        &self,
        reg: PhysReg,
        reg_type: RegType,
        rp_id: RefPosId,
        busy: RegMask,
    ) -> bool {
        if !self.spill_half_eligible(reg, rp_id, busy) {
            return false;
        }
        if reg_type == RegType::Double {
            let pair = self.target.pair_of(reg).expect("double without pair");
            // The pair half is spillable if empty or independently evictable.
            let pair_rec = self.reg_record(pair);
            if pair_rec.assigned.is_some() && !self.spill_half_eligible(pair, rp_id, busy) {
                return false;
            }
            if pair_rec.busy_until_kill || busy.contains(pair) {
                return false;
            }
        }
        true
    }

    fn spill_half_eligible(&self, reg: PhysReg, rp_id: RefPosId, busy: RegMask) -> bool {
        let rp = self.refpos(rp_id);
        let record = self.reg_record(reg);
        if record.busy_until_kill || busy.contains(reg) {
            return false;
        }
        let occupant = match record.assigned {
            Some(o) => o,
            None => return false,
        };
        let occupant = self.interval(occupant);
        if !occupant.is_active() {
            return false;
        }
        let recent = match occupant.recent_ref {
            Some(r) => r,
            // A still-unplaced parameter cannot be spilled.
            None => return false,
        };
        // No register can be spilled while its occupant is being used now.
        if self.refpos(recent).location == rp.location {
            return false;
        }
        if self.refpos(recent).flags.contains(RefFlags::DELAY_REG_FREE)
            && self.refpos(recent).location.next() == rp.location
        {
            return false;
        }
        // A fixed need at this or the next location blocks eviction.
        if record.next_fixed_loc <= rp.location.next() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use lsra_ir::parse_proc;

    use super::Heuristic;
    use crate::{LinearScan, RegMask, X64Target};

    #[test]
    fn test_score_bits_are_distinct_and_ordered() {
        let all = [
            Heuristic::Free,
            Heuristic::ConstAvailable,
            Heuristic::ThisAssigned,
            Heuristic::Covers,
            Heuristic::OwnPreference,
            Heuristic::CoversRelated,
            Heuristic::RelatedPreference,
            Heuristic::CallerCallee,
            Heuristic::Unassigned,
            Heuristic::CoversFull,
            Heuristic::BestFit,
            Heuristic::IsPrevReg,
            Heuristic::RegOrder,
            Heuristic::SpillCost,
            Heuristic::FarNextRef,
            Heuristic::PrevRegOpt,
            Heuristic::RegNum,
        ];
        let mut seen = 0u32;
        for h in all {
            assert_eq!(seen & h.score_bit(), 0, "duplicate bit for {:?}", h);
            seen |= h.score_bit();
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        // Identical inputs produce identical register choices.
        let text = r#"
proc %t(i32 $a, i32 $b) {
block0:
    v0 = lcl $a
    v1 = lcl $b
    v2 = add v0, v1
    store $c, v2
    v3 = lcl $c
    ret v3
}"#;
        let run = || {
            let mut proc = parse_proc(text).unwrap();
            let target = X64Target;
            let mut lsra = LinearScan::new(&mut proc, &target);
            lsra.do_linear_scan();
            let mut regs = alloc::vec::Vec::new();
            for rp in &lsra.ref_positions {
                regs.push(rp.assigned_reg());
            }
            regs
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_free_selection_uses_alloc_order() {
        let mut proc = parse_proc(
            r#"
proc %t() {
block0:
    v0 = iconst 1
    store $a, v0
    ret
}"#,
        )
        .unwrap();
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        lsra.build_ref_positions();
        // The first def with everything free picks the first register in
        // allocation order.
        let rp = lsra
            .ref_positions
            .iter()
            .enumerate()
            .find(|(_, rp)| rp.ref_type == crate::RefType::Def)
            .map(|(i, _)| crate::RefPosId(i as u32))
            .unwrap();
        let ivl = lsra.refpos(rp).interval().unwrap();
        let result = lsra.select_register(ivl, rp, RegMask::EMPTY, RegMask::EMPTY);
        use crate::TargetAbi;
        assert_eq!(result.reg, Some(target.alloc_order(crate::RegType::Int)[0]));
        assert!(result.applied(Heuristic::Free));
    }
}
