//! Writeback: turning committed RefPositions into IR annotations.
//!
//! A second ordered walk over the RefPositions copies each committed
//! register onto its tree node, sets the spill/reload flags code generation
//! consumes, inserts `Copy`/`Reload` wrappers where a value must change
//! register mid-flight, then summarizes per-local results and hands off to
//! edge resolution.

use alloc::{vec, vec::Vec};

use lsra_ir::{NodeFlags, NodeKind, PhysReg, RegClass};

use crate::{
    interval::{IntervalFlags, IntervalId},
    refpos::{RefFlags, RefPosId, RefType},
    LinearScan,
};

impl<'a> LinearScan<'a> {
    pub(crate) fn resolve_registers(&mut self) {
        // Where each interval's value currently sits, tracked along the
        // same order the allocator swept. Stale bindings are cleared at
        // every block boundary ref.
        let mut current_reg: Vec<Option<PhysReg>> = vec![None; self.intervals.len()];
        let mut live_spill_temps = [0i32; 2];

        for idx in 0..self.ref_positions.len() {
            let rp_id = RefPosId(idx as u32);
            let ref_type = self.refpos(rp_id).ref_type;
            match ref_type {
                RefType::BB => {
                    // Stale bindings from the previous block are replaced by
                    // the entry map of the new one.
                    for slot in current_reg.iter_mut() {
                        *slot = None;
                    }
                    let block = self.refpos(rp_id).block;
                    for (_lcl, interval) in self.local_interval_pairs() {
                        if let Some(var_index) = self.interval(interval).var_index() {
                            current_reg[interval.index()] =
                                self.in_maps[block.index()][var_index as usize];
                        }
                    }
                }
                RefType::ParamDef => {
                    let interval = self.refpos(rp_id).interval().unwrap();
                    let committed = self.refpos(rp_id).assigned_reg();
                    if let Some(lcl) = self.interval(interval).local() {
                        self.proc.lcl_mut(lcl).arg_init_reg = committed;
                    }
                    current_reg[interval.index()] = committed;
                }
                RefType::ZeroInit | RefType::DummyDef => {
                    let interval = self.refpos(rp_id).interval().unwrap();
                    current_reg[interval.index()] = self.refpos(rp_id).assigned_reg();
                }
                RefType::Use | RefType::Def => {
                    self.write_back_ref(rp_id, &mut current_reg, &mut live_spill_temps);
                }
                _ => {}
            }
        }

        self.summarize_locals();
        self.resolve_edges();
    }

    fn write_back_ref(
        &mut self,
        rp_id: RefPosId,
        current_reg: &mut [Option<PhysReg>],
        live_spill_temps: &mut [i32; 2],
    ) {
        let interval = self.refpos(rp_id).interval().expect("interval ref");
        let is_use = self.refpos(rp_id).ref_type == RefType::Use;
        let committed = self.refpos(rp_id).assigned_reg();
        let flags = self.refpos(rp_id).flags;
        let node = self.refpos(rp_id).node;
        let block = self.refpos(rp_id).block;
        let reg_idx = self.refpos(rp_id).multi_reg_idx as usize;
        let is_local = self.interval(interval).is_local();
        let class_idx = match self.interval(interval).reg_type.class() {
            RegClass::Int => 0,
            RegClass::Float => 1,
        };

        // Register continuity tracking. A change of register without a
        // reload means the RefPositions disagree in order; a copy-reg on
        // such a use is not a mismatch.
        let prev = current_reg[interval.index()];
        if let (Some(prev), Some(now)) = (prev, committed) {
            if prev != now
                && !flags.contains(RefFlags::RELOAD)
                && !flags.contains(RefFlags::MOVE_REG)
            {
                self.refpos_mut(rp_id).flags |= RefFlags::OUT_OF_ORDER;
            }
        }
        let out_of_order = self.refpos(rp_id).flags.contains(RefFlags::OUT_OF_ORDER);
        let mismatch = out_of_order && !flags.contains(RefFlags::COPY_REG);

        let node = match node {
            Some(n) => n,
            None => {
                current_reg[interval.index()] = committed;
                return;
            }
        };

        if flags.contains(RefFlags::COPY_REG) {
            // Temporary register for one use; the home stays put.
            let copy_reg = committed.expect("copy reg committed");
            let home = prev;
            if let Some(home) = home {
                self.proc.node_mut(node).set_reg(reg_idx, home);
            }
            if flags.contains(RefFlags::SPILL_AFTER) {
                // The home register was clobbered right after this use;
                // store it out before that happens.
                self.proc.node_mut(node).set_spill(reg_idx);
            }
            let wrapper = self.proc.wrap_node(block, node, |src| NodeKind::Copy { src });
            self.proc.node_mut(wrapper).set_reg(reg_idx, copy_reg);
            // The interval still lives in its home register afterwards.
            return;
        }

        match committed {
            Some(reg) => {
                if flags.contains(RefFlags::RELOAD) || (mismatch && is_use) {
                    if is_local {
                        self.proc.node_mut(node).set_spilled(reg_idx);
                        self.proc.node_mut(node).set_reg(reg_idx, reg);
                    } else {
                        // A spilled temp reloading into a different register
                        // needs an explicit reload node at the use point.
                        let def_reg = self.proc.node(node).reg(reg_idx);
                        self.proc.node_mut(node).set_spilled(reg_idx);
                        if def_reg.is_some() && def_reg != Some(reg) {
                            let consumer = self.proc.find_consumer(block, node);
                            let wrapper = match consumer {
                                Some(consumer) => {
                                    let ty = self.proc.node(node).ty;
                                    let w = self.proc.insert_before(
                                        block,
                                        consumer,
                                        NodeKind::Reload { src: node },
                                        ty,
                                    );
                                    self.proc.node_mut(consumer).replace_operand(node, w);
                                    w
                                }
                                None => self
                                    .proc
                                    .wrap_node(block, node, |src| NodeKind::Reload { src }),
                            };
                            self.proc.node_mut(wrapper).set_reg(reg_idx, reg);
                        }
                        if is_use {
                            live_spill_temps[class_idx] -= 1;
                        }
                    }
                } else {
                    self.proc.node_mut(node).set_reg(reg_idx, reg);
                    if flags.contains(RefFlags::MOVE_REG) {
                        // The def establishes the new home directly.
                        self.interval_mut(interval).flags |= IntervalFlags::SPLIT;
                    }
                }
                if flags.contains(RefFlags::SPILL_AFTER)
                    || (flags.contains(RefFlags::WRITE_THRU) && !is_use)
                {
                    self.proc.node_mut(node).set_spill(reg_idx);
                    if !is_local && !is_use {
                        live_spill_temps[class_idx] += 1;
                        self.max_spill_temps[class_idx] = self.max_spill_temps[class_idx]
                            .max(live_spill_temps[class_idx] as u32);
                    }
                }
                if flags.contains(RefFlags::REUSED_CONSTANT) {
                    self.proc.node_mut(node).flags |= NodeFlags::REUSE_REG_VAL;
                }
                current_reg[interval.index()] = Some(reg);
            }
            None => {
                // Satisfied from memory.
                if is_use {
                    if flags.contains(RefFlags::REG_OPTIONAL) {
                        self.proc.node_mut(node).flags |= NodeFlags::NOREG_AT_USE;
                    } else {
                        self.proc.node_mut(node).set_spilled(reg_idx);
                    }
                } else {
                    self.proc.node_mut(node).set_spill(reg_idx);
                }
                current_reg[interval.index()] = None;
            }
        }
    }

    /// A local that kept one register for its whole lifetime and never
    /// spilled is simply "registered"; everything else consults the
    /// per-node annotations and block maps.
    fn summarize_locals(&mut self) {
        for (lcl_id, interval) in self.local_interval_pairs() {
            let (spilled, split, home) = {
                let ivl = self.interval(interval);
                (
                    ivl.is_spilled(),
                    ivl.flags.contains(IntervalFlags::SPLIT),
                    ivl.home_reg,
                )
            };
            let lcl = self.proc.lcl_mut(lcl_id);
            if !spilled && !split && home.is_some() {
                lcl.lv_register = true;
                lcl.reg_num = home;
            } else {
                lcl.lv_register = false;
                lcl.reg_num = None;
                lcl.on_frame = true;
            }
        }
    }

    /// Spill-temp requirements the frame allocator must reserve, per class.
    pub fn max_spill_temp_count(&self, class: RegClass) -> u32 {
        match class {
            RegClass::Int => self.max_spill_temps[0],
            RegClass::Float => self.max_spill_temps[1],
        }
    }

    /// The interval of a tracked variable index, if it is a candidate.
    pub(crate) fn interval_for_var(&self, var_index: u32) -> Option<IntervalId> {
        self.local_intervals
            .iter()
            .flatten()
            .copied()
            .find(|&id| self.interval(id).var_index() == Some(var_index))
    }
}
