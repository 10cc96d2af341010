//! Final-allocation verification.
//!
//! Re-simulates the RefPosition walk against the committed assignments and
//! checks that every live interval is where its RefPositions claim it is,
//! that no two live values share a register, and that kills and fixed
//! references were honored. Any mismatch is a bug in the allocator and
//! aborts the compile.

use alloc::{vec, vec::Vec};

use lsra_ir::PhysReg;

use crate::{
    interval::IntervalId,
    refpos::{RefFlags, RefPosId, RefType},
    regs::RegType,
    LinearScan,
};

#[derive(Clone, Copy, PartialEq)]
struct SimEntry {
    interval: IntervalId,
    /// The holder was released (spilled, last-used, or deactivated).
    released: bool,
}

impl<'a> LinearScan<'a> {
    /// Re-simulate the sweep and assert the committed allocation is
    /// self-consistent.
    pub fn verify_final_allocation(&self) {
        let mut sim: Vec<Option<SimEntry>> = vec![None; self.regs.len()];

        for idx in 0..self.ref_positions.len() {
            let rp_id = RefPosId(idx as u32);
            let rp = self.refpos(rp_id);
            match rp.ref_type {
                RefType::BB => {
                    // Block boundaries release everything; the maps carry
                    // locations across, and resolution reconciles them.
                    for entry in sim.iter_mut().flatten() {
                        entry.released = true;
                    }
                }
                RefType::Kill => {
                    let reg = rp.reg().unwrap();
                    if let Some(entry) = sim[reg.index()] {
                        assert!(
                            entry.released,
                            "interval {:?} still live in killed register {} at {}",
                            entry.interval, reg, rp.location
                        );
                        sim[reg.index()] = None;
                    }
                }
                RefType::KillGcRefs => {
                    for slot in sim.iter_mut() {
                        if let Some(entry) = *slot {
                            if self.interval_value_type(entry.interval).is_gc() {
                                assert!(
                                    entry.released,
                                    "GC interval {:?} live across a GC kill",
                                    entry.interval
                                );
                                *slot = None;
                            }
                        }
                    }
                }
                RefType::Use
                | RefType::Def
                | RefType::ParamDef
                | RefType::ZeroInit
                | RefType::DummyDef => {
                    self.verify_interval_ref(rp_id, &mut sim);
                }
                RefType::FixedReg
                | RefType::ExpUse
                | RefType::UpperVectorSave
                | RefType::UpperVectorRestore => {}
            }
        }
    }

    fn verify_interval_ref(&self, rp_id: RefPosId, sim: &mut [Option<SimEntry>]) {
        let rp = self.refpos(rp_id);
        let interval = rp.interval().expect("interval ref");
        let reg = match rp.assigned_reg() {
            Some(r) => r,
            // Satisfied from memory; nothing to check.
            None => return,
        };

        // The committed register must be of the interval's class.
        assert!(
            self.target
                .all_regs(self.interval(interval).reg_type)
                .contains(reg),
            "interval {:?} committed to {} outside its register class",
            interval,
            reg
        );

        let regs = self.verify_occupied(interval, reg);
        for r in regs {
            let slot = &mut sim[r.index()];
            match *slot {
                Some(entry) if entry.interval == interval => {}
                Some(entry) => {
                    // Two values may not share a register unless the old one
                    // was released, this ref is a transient copy, or it is a
                    // put-arg riding in its own source's register.
                    let rides_source =
                        self.interval(interval).related == Some(entry.interval);
                    assert!(
                        entry.released
                            || rp.flags.contains(RefFlags::COPY_REG)
                            || rides_source,
                        "intervals {:?} and {:?} overlap in {} at {}",
                        entry.interval,
                        interval,
                        r,
                        rp.location
                    );
                }
                None => {}
            }
            if !rp.flags.contains(RefFlags::COPY_REG) {
                *slot = Some(SimEntry {
                    interval,
                    released: false,
                });
            }
        }

        // Copy regs leave the home untouched; everything else tracks
        // release at last use or spill.
        if !rp.flags.contains(RefFlags::COPY_REG) {
            let released = rp.is_last_use() || rp.spill_after();
            if released {
                for r in self.verify_occupied(interval, reg) {
                    if let Some(entry) = &mut sim[r.index()] {
                        if entry.interval == interval {
                            entry.released = true;
                        }
                    }
                }
            }
        }
    }

    fn verify_occupied(&self, interval: IntervalId, reg: PhysReg) -> Vec<PhysReg> {
        let mut regs = vec![reg];
        if self.interval(interval).reg_type == RegType::Double {
            if let Some(pair) = self.target.pair_of(reg) {
                regs.push(pair);
            }
        }
        regs
    }
}

#[cfg(test)]
mod tests {
    use lsra_ir::parse_proc;

    use crate::{LinearScan, X64Target};

    #[test]
    fn test_verify_accepts_straight_line() {
        let mut proc = parse_proc(
            r#"
proc %t(i32 $a, i32 $b) {
block0:
    v0 = lcl $a
    v1 = lcl $b
    v2 = add v0, v1
    store $c, v2
    v3 = lcl $c
    ret v3
}"#,
        )
        .unwrap();
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.do_linear_scan();
        lsra.verify_final_allocation();
    }

    #[test]
    fn test_verify_accepts_calls_and_branches() {
        let mut proc = parse_proc(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    jmptrue v0, block1, block2
block1:
    v1 = call %helper()
    store $b, v1
    goto block3
block2:
    v2 = iconst 4
    store $b, v2
    goto block3
block3:
    v3 = lcl $b
    v4 = lcl $a
    v5 = add v3, v4
    ret v5
}"#,
        )
        .unwrap();
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.do_linear_scan();
        lsra.verify_final_allocation();
    }

    #[test]
    fn test_verify_detects_fabricated_overlap() {
        let mut proc = parse_proc(
            r#"
proc %t(i32 $a, i32 $b) {
block0:
    v0 = lcl $a
    v1 = lcl $b
    v2 = add v0, v1
    ret v2
}"#,
        )
        .unwrap();
        let target = X64Target;
        let mut lsra = LinearScan::new(&mut proc, &target);
        lsra.do_linear_scan();
        // Corrupt the allocation: force both locals' uses into one register.
        let mut seen = None;
        for rp in lsra.ref_positions.iter_mut() {
            if rp.ref_type == crate::RefType::Use {
                match seen {
                    None => seen = rp.assigned_reg(),
                    Some(reg) => {
                        rp.register_assignment = crate::RegMask::from_reg(reg);
                        rp.flags.remove(crate::RefFlags::LAST_USE);
                    }
                }
            }
        }
        // Also clear the first use's release so the overlap is observable.
        for rp in lsra.ref_positions.iter_mut() {
            if rp.ref_type == crate::RefType::Use {
                rp.flags.remove(crate::RefFlags::LAST_USE);
            }
        }
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lsra.verify_final_allocation();
        }))
        .is_err();
        assert!(panicked, "verification must reject overlapping intervals");
    }
}
