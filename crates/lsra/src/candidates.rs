//! Register-candidate identification.
//!
//! Decides which locals may live in registers at all, creates their
//! intervals, and classifies floating-point candidates for callee-save
//! preferencing.

use alloc::{vec, vec::Vec};

use lsra_ir::{compute_liveness, LclId, ValueType, VarSet};

use crate::{
    interval::{Interval, IntervalFlags, IntervalId, IntervalKind},
    LinearScan,
};

// Weighted ref-count thresholds for FP callee-save preferencing.
const FP_CALLEE_SAVE_STRONG: f64 = 8.0;
const FP_CALLEE_SAVE_WEAK: f64 = 4.0;
const FP_CALLEE_SAVE_VAR_LIMIT: usize = 6;

impl<'a> LinearScan<'a> {
    /// Classify every local as register candidate or stack-only and create
    /// candidate intervals.
    pub(crate) fn identify_candidates(&mut self) {
        self.proc.compute_ref_counts();
        self.proc.assign_var_indices();
        compute_liveness(self.proc);

        self.candidate_vars = VarSet::new(self.proc.tracked_count);
        self.local_intervals = vec![None; self.proc.local_count()];
        self.in_maps = vec![
            vec![None; self.proc.tracked_count as usize];
            self.proc.block_count()
        ];
        self.out_maps = self.in_maps.clone();

        // At minimum optimization with EH, nothing is worth enregistering.
        if self.proc.min_opts && self.proc.has_eh {
            for bi in 0..self.proc.local_count() {
                let id = LclId(bi as u32);
                if !self.reject_candidate(id) {
                    self.proc.lcl_mut(id).do_not_enregister = true;
                }
            }
        }

        let has_loops = self.has_loops();
        let mut fp_candidates: Vec<IntervalId> = Vec::new();

        for li in 0..self.proc.local_count() {
            let id = LclId(li as u32);
            if self.reject_candidate(id) || self.proc.lcl(id).do_not_enregister {
                self.proc.lcl_mut(id).on_frame = true;
                continue;
            }
            let lcl = self.proc.lcl(id);
            let ty = lcl.ty;
            let var_index = lcl.var_index;
            let reg_type = self.target.reg_type_for(ty);

            let mut ivl = Interval::new(
                IntervalKind::LocalVar {
                    lcl: id,
                    var_index,
                },
                reg_type,
                ty,
            );
            if self.proc.lcl(id).promoted_field_of.is_some() {
                ivl.flags |= IntervalFlags::STRUCT_FIELD;
            }
            // EH-live vars keep a valid stack home at all times.
            if self.proc.lcl(id).live_in_out_of_handler {
                ivl.flags |= IntervalFlags::WRITE_THRU | IntervalFlags::SPILLED;
                self.proc.lcl_mut(id).on_frame = true;
            }
            let interval_id = IntervalId(self.intervals.len() as u32);
            self.intervals.push(ivl);
            self.local_intervals[id.index()] = Some(interval_id);
            self.candidate_vars.insert(var_index);

            if ty.reg_class() == lsra_ir::RegClass::Float {
                fp_candidates.push(interval_id);
            }
        }

        self.demote_partial_promotions();
        self.classify_fp_callee_save(&fp_candidates, has_loops);
    }

    /// A local that can never live in a register.
    fn reject_candidate(&self, id: LclId) -> bool {
        let lcl = self.proc.lcl(id);
        if !lcl.tracked || lcl.ref_cnt == 0 {
            return true;
        }
        if lcl.addr_exposed || lcl.pinned || lcl.do_not_enregister {
            return true;
        }
        if lcl.ty == ValueType::Long && !self.target.supports_long_regs() {
            return true;
        }
        false
    }

    /// Promoted struct fields enregister all-or-nothing: if any field of a
    /// struct was rejected, demote its siblings too.
    fn demote_partial_promotions(&mut self) {
        let mut demoted_parents: Vec<LclId> = Vec::new();
        for (id, lcl) in self.proc.locals() {
            if let Some(parent) = lcl.promoted_field_of {
                if self.local_intervals[id.index()].is_none()
                    && !demoted_parents.contains(&parent)
                {
                    demoted_parents.push(parent);
                }
            }
        }
        if demoted_parents.is_empty() {
            return;
        }
        for li in 0..self.proc.local_count() {
            let id = LclId(li as u32);
            let parent = match self.proc.lcl(id).promoted_field_of {
                Some(p) => p,
                None => continue,
            };
            if !demoted_parents.contains(&parent) {
                continue;
            }
            if let Some(ivl) = self.local_intervals[id.index()].take() {
                let var_index = self.intervals[ivl.index()].var_index().unwrap();
                self.candidate_vars.remove(var_index);
                self.proc.lcl_mut(id).do_not_enregister = true;
                self.proc.lcl_mut(id).on_frame = true;
            }
        }
    }

    /// Mark heavy FP candidates as preferring callee-saved registers; with
    /// loops and enough FP pressure, the weak ones as well.
    fn classify_fp_callee_save(&mut self, fp_candidates: &[IntervalId], has_loops: bool) {
        let promote_weak =
            has_loops && fp_candidates.len() > FP_CALLEE_SAVE_VAR_LIMIT;
        for &id in fp_candidates {
            let lcl = match self.intervals[id.index()].local() {
                Some(l) => l,
                None => continue,
            };
            let weight = self.proc.lcl(lcl).ref_cnt_wtd;
            let strong = weight >= FP_CALLEE_SAVE_STRONG;
            let weak = weight >= FP_CALLEE_SAVE_WEAK;
            if strong || (weak && promote_weak) {
                self.intervals[id.index()].flags |= IntervalFlags::PREFER_CALLEE_SAVE;
            }
        }
    }

    fn has_loops(&self) -> bool {
        // A back edge in layout order is a loop for our purposes.
        self.proc
            .blocks()
            .any(|b| b.successors().iter().any(|s| s.0 <= b.id.0))
    }
}

#[cfg(test)]
mod tests {
    use lsra_ir::parse_proc;

    use crate::{IntervalFlags, LinearScan, X64Target};

    fn parse(text: &str) -> lsra_ir::Procedure {
        parse_proc(text).unwrap()
    }

    #[test]
    fn test_simple_local_is_candidate() {
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
        let a = lsra.proc.find_local("a").unwrap();
        assert!(lsra.local_intervals[a.index()].is_some());
        assert_eq!(lsra.candidate_vars.len(), 1);
    }

    #[test]
    fn test_unreferenced_local_not_candidate() {
        let mut proc = parse(
            r#"
proc %t(i32 $a, i32 $b) {
block0:
    v0 = lcl $a
    ret v0
}"#,
        );
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        let b = lsra.proc.find_local("b").unwrap();
        // Parameters get an implicit entry def, so $b has one ref; it still
        // becomes a candidate. A genuinely unreferenced non-param does not.
        assert!(lsra.local_intervals[b.index()].is_some());
    }

    #[test]
    fn test_addr_exposed_rejected() {
        let mut proc = parse(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    ret v0
}"#,
        );
        let a = proc.find_local("a").unwrap();
        proc.lcl_mut(a).addr_exposed = true;
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        let a = lsra.proc.find_local("a").unwrap();
        assert!(lsra.local_intervals[a.index()].is_none());
        assert!(lsra.proc.lcl(a).on_frame);
    }

    #[test]
    fn test_long_rejected_on_arm32() {
        let mut proc = parse(
            r#"
proc %t(i64 $a) {
block0:
    v0 = lcl $a
    ret v0
}"#,
        );
        let target = crate::Arm32Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        let a = lsra.proc.find_local("a").unwrap();
        assert!(lsra.local_intervals[a.index()].is_none());
    }

    #[test]
    fn test_eh_live_var_is_write_thru() {
        let mut proc = parse(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    ret v0
}"#,
        );
        let a = proc.find_local("a").unwrap();
        proc.lcl_mut(a).live_in_out_of_handler = true;
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        let a = lsra.proc.find_local("a").unwrap();
        let ivl = lsra.local_intervals[a.index()].unwrap();
        assert!(lsra.intervals[ivl.index()]
            .flags
            .contains(IntervalFlags::WRITE_THRU));
        assert!(lsra.intervals[ivl.index()].is_spilled());
    }

    #[test]
    fn test_min_opts_with_eh_demotes_all() {
        let mut proc = parse(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    ret v0
}"#,
        );
        proc.min_opts = true;
        proc.has_eh = true;
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        let a = lsra.proc.find_local("a").unwrap();
        assert!(lsra.local_intervals[a.index()].is_none());
        assert!(lsra.proc.lcl(a).do_not_enregister);
    }

    #[test]
    fn test_promoted_fields_demote_together() {
        let mut proc = parse(
            r#"
proc %t() {
block0:
    local i32 $s
    local i32 $f0
    local i32 $f1
    v0 = iconst 1
    store $f0, v0
    v1 = iconst 2
    store $f1, v1
    v2 = lcl $f0
    v3 = lcl $f1
    v4 = add v2, v3
    ret v4
}"#,
        );
        let s = proc.find_local("s").unwrap();
        let f0 = proc.find_local("f0").unwrap();
        let f1 = proc.find_local("f1").unwrap();
        proc.lcl_mut(f0).promoted_field_of = Some(s);
        proc.lcl_mut(f1).promoted_field_of = Some(s);
        // f1 is pinned, so it cannot be a candidate; f0 must demote with it.
        proc.lcl_mut(f1).pinned = true;
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        let f0 = lsra.proc.find_local("f0").unwrap();
        assert!(lsra.local_intervals[f0.index()].is_none());
        assert!(lsra.proc.lcl(f0).do_not_enregister);
    }

    #[test]
    fn test_fp_callee_save_classification() {
        let mut proc = parse(
            r#"
proc %t(f64 $x, f64 $y) {
block0(weight 4):
    v0 = lcl $x
    v1 = lcl $x
    v2 = fadd v0, v1
    store $x, v2
    v3 = lcl $y
    ret v3
}"#,
        );
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.build_block_sequence();
        lsra.identify_candidates();
        let x = lsra.proc.find_local("x").unwrap();
        let y = lsra.proc.find_local("y").unwrap();
        let xi = lsra.local_intervals[x.index()].unwrap();
        let yi = lsra.local_intervals[y.index()].unwrap();
        // $x is referenced heavily in a weight-10 block; $y is not.
        assert!(lsra.intervals[xi.index()]
            .flags
            .contains(IntervalFlags::PREFER_CALLEE_SAVE));
        assert!(!lsra.intervals[yi.index()]
            .flags
            .contains(IntervalFlags::PREFER_CALLEE_SAVE));
    }
}
