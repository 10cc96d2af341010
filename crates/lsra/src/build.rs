//! Interval and RefPosition construction.
//!
//! Walks the block sequence in order, assigns two locations to every node
//! (operand uses at the even location, the def right after), and creates the
//! RefPositions the allocation sweep consumes. Tree temps get one interval
//! per value-producing node; candidate locals share their one interval
//! across all their appearances.

use alloc::{collections::BTreeMap, vec, vec::Vec};

use lsra_ir::{BlockId, NodeFlags, NodeId, NodeKind, PhysReg, RegClass, ValueType};

use crate::{
    interval::{ConstVal, Interval, IntervalFlags, IntervalId, IntervalKind},
    location::Location,
    refpos::{RefFlags, RefPosId, RefPosition, RefType, Referent},
    regs::RegMask,
    LinearScan,
};

impl<'a> LinearScan<'a> {
    /// Build every interval and RefPosition for the procedure.
    pub(crate) fn build_ref_positions(&mut self) {
        let mut builder = BuildState {
            current: Location(0),
            temp_intervals: BTreeMap::new(),
            first_fixed: vec![None; self.regs.len()],
            last_fixed: vec![None; self.regs.len()],
        };

        for seq_idx in 0..self.block_seq.len() {
            let block_id = self.block_seq[seq_idx];
            self.add_bb_ref(&mut builder, block_id);
            if seq_idx == 0 {
                self.build_entry_defs(&mut builder, block_id);
            }

            let block_ref_start = self.ref_positions.len();
            let nodes = self.proc.block(block_id).nodes.clone();
            for node_id in nodes {
                builder.current = builder.current.plus(2);
                self.build_node(&mut builder, block_id, node_id);
            }

            if self.block_info[block_id.index()].has_eh_out {
                self.build_exposed_uses(&mut builder, block_id);
            }

            self.mark_last_uses(block_id, block_ref_start);
            self.set_callee_save_preferences(block_id, block_ref_start);
            builder.current = builder.current.plus(2);
        }

        // Install the fixed-reference chains on the register records.
        for i in 0..self.regs.len() {
            self.regs[i].next_fixed_ref = builder.first_fixed[i];
            self.regs[i].next_fixed_loc = builder.first_fixed[i]
                .map(|rp| self.refpos(rp).location)
                .unwrap_or(Location::MAX);
        }
    }

    // ---- RefPosition creation helpers ----

    fn new_ref(
        &mut self,
        ref_type: RefType,
        location: Location,
        block: BlockId,
    ) -> RefPosId {
        let id = RefPosId(self.ref_positions.len() as u32);
        self.ref_positions
            .push(RefPosition::new(ref_type, location, block));
        id
    }

    /// Append a RefPosition to an interval's chain.
    pub(crate) fn add_interval_ref(
        &mut self,
        interval: IntervalId,
        ref_type: RefType,
        location: Location,
        block: BlockId,
        mask: RegMask,
        node: Option<NodeId>,
    ) -> RefPosId {
        let id = self.new_ref(ref_type, location, block);
        {
            let rp = self.refpos_mut(id);
            rp.referent = Some(Referent::Interval(interval));
            rp.register_assignment = mask;
            rp.node = node;
            if mask.is_single() {
                rp.flags |= RefFlags::FIXED_REG_REF;
            }
        }
        let ivl = self.interval_mut(interval);
        if ivl.first_ref.is_none() {
            ivl.first_ref = Some(id);
        }
        let prev_last = ivl.last_ref;
        ivl.last_ref = Some(id);
        if let Some(prev) = prev_last {
            self.refpos_mut(prev).next = Some(id);
        }
        // An empty starting mask is only legal when the ref can live in
        // memory; anything else is a malformed build.
        let rp = self.refpos(id);
        if rp.register_assignment.is_empty() && !rp.is_reg_optional() {
            assert!(
                !matches!(ref_type, RefType::Use | RefType::Def),
                "malformed build: empty register set on a non-reg-optional {:?}",
                ref_type
            );
        }
        id
    }

    /// Create a FixedReg or Kill position on a physical register and link it
    /// into the register's fixed chain.
    fn add_reg_ref(
        &mut self,
        state: &mut BuildState,
        ref_type: RefType,
        reg: PhysReg,
        location: Location,
        block: BlockId,
    ) -> RefPosId {
        let id = self.new_ref(ref_type, location, block);
        {
            let rp = self.refpos_mut(id);
            rp.referent = Some(Referent::Reg(reg));
            rp.register_assignment = RegMask::from_reg(reg);
        }
        match state.last_fixed[reg.index()] {
            Some(prev) => self.refpos_mut(prev).next = Some(id),
            None => state.first_fixed[reg.index()] = Some(id),
        }
        state.last_fixed[reg.index()] = Some(id);
        id
    }

    fn add_bb_ref(&mut self, state: &mut BuildState, block: BlockId) {
        let _ = self.new_ref(RefType::BB, state.current, block);
    }

    // ---- entry ----

    /// ParamDefs for candidate parameters, ZeroInit/DummyDef for candidate
    /// locals that are live into the entry block without a def.
    fn build_entry_defs(&mut self, state: &mut BuildState, entry: BlockId) {
        let params = self.proc.params.clone();
        let mut int_args = 0usize;
        let mut float_args = 0usize;
        for lcl_id in params {
            let class = self.proc.lcl(lcl_id).ty.reg_class();
            let arg_index = match class {
                RegClass::Int => {
                    int_args += 1;
                    int_args - 1
                }
                RegClass::Float => {
                    float_args += 1;
                    float_args - 1
                }
            };
            let reg_type = self.target.reg_type_for(self.proc.lcl(lcl_id).ty);
            let arg_reg = if reg_type == crate::regs::RegType::Double {
                self.target.double_arg_reg(arg_index)
            } else {
                self.target.arg_reg(arg_index, class)
            };
            {
                let lcl = self.proc.lcl_mut(lcl_id);
                lcl.is_reg_arg = arg_reg.is_some();
                lcl.arg_reg = arg_reg;
            }
            let interval = match self.local_intervals[lcl_id.index()] {
                Some(i) => i,
                None => continue,
            };
            let mask = self.candidate_mask(self.interval(interval).reg_type);
            self.add_interval_ref(interval, RefType::ParamDef, state.current, entry, mask, None);
            if let Some(reg) = arg_reg {
                let ivl = self.interval_mut(interval);
                ivl.preferences = ivl.preferences.union(RegMask::from_reg(reg));
            }
        }

        // Live-in candidates without an entry def.
        let live_in = self.proc.block(entry).live_in.clone();
        let init_mem = self.proc.init_mem;
        for (lcl_id, interval) in self.local_interval_pairs() {
            if self.proc.lcl(lcl_id).is_param {
                continue;
            }
            let var_index = self.interval(interval).var_index().unwrap();
            if !live_in.contains(var_index) {
                continue;
            }
            let ref_type = if init_mem {
                RefType::ZeroInit
            } else {
                RefType::DummyDef
            };
            let mask = self.candidate_mask(self.interval(interval).reg_type);
            self.add_interval_ref(interval, ref_type, state.current, entry, mask, None);
        }
    }

    // ---- per-node construction ----

    fn build_node(&mut self, state: &mut BuildState, block: BlockId, node_id: NodeId) {
        let loc = state.current;
        let kind = self.proc.node(node_id).kind.clone();
        match kind {
            NodeKind::LclLoad { lcl } => {
                if let Some(interval) = self.local_intervals[lcl.index()] {
                    // Candidate loads have no position of their own; the
                    // consumer reads the local's interval directly. A load
                    // nobody consumes is still a use of the local here.
                    if self.proc.find_consumer(block, node_id).is_none() {
                        let mask = self.candidate_mask(self.interval(interval).reg_type);
                        self.add_interval_ref(
                            interval,
                            RefType::Use,
                            loc,
                            block,
                            mask,
                            Some(node_id),
                        );
                    }
                    return;
                }
                // Memory load producing a register value.
                self.define_temp(state, block, node_id, loc);
            }
            NodeKind::LclStore { lcl, src } => {
                let src_ivl = self.build_operand_use(state, block, src, loc, RegMask::EMPTY);
                if let Some(interval) = self.local_intervals[lcl.index()] {
                    let mask = self.candidate_mask(self.interval(interval).reg_type);
                    let rp = self.add_interval_ref(
                        interval,
                        RefType::Def,
                        loc.next(),
                        block,
                        mask,
                        Some(node_id),
                    );
                    if self.interval(interval).is_write_thru() {
                        self.refpos_mut(rp).flags |= RefFlags::WRITE_THRU;
                    }
                    // Preference the local toward wherever its source wants
                    // to be, and link the temps for the selector.
                    if let Some(src_ivl) = src_ivl {
                        if src_ivl != interval {
                            let src_prefs = self.interval(src_ivl).preferences;
                            let ivl = self.interval_mut(interval);
                            ivl.preferences = ivl.preferences.union(src_prefs);
                            self.interval_mut(src_ivl).related = Some(interval);
                        }
                    }
                }
            }
            NodeKind::IntConst { bits } => {
                let consumed = self.define_temp(state, block, node_id, loc);
                let ty = self.proc.node(node_id).ty;
                let ivl = self.interval_mut(consumed);
                ivl.flags |= IntervalFlags::CONSTANT;
                ivl.const_val = Some(ConstVal {
                    bits: bits as u64,
                    ty,
                });
            }
            NodeKind::DblConst { bits } => {
                let consumed = self.define_temp(state, block, node_id, loc);
                let ty = self.proc.node(node_id).ty;
                let ivl = self.interval_mut(consumed);
                ivl.flags |= IntervalFlags::CONSTANT;
                ivl.const_val = Some(ConstVal { bits, ty });
            }
            NodeKind::BinOp { lhs, rhs, rmw, .. } => {
                self.build_operand_use(state, block, lhs, loc, RegMask::EMPTY);
                let rhs_use = self.build_use_ref(state, block, rhs, loc, RegMask::EMPTY);
                if rmw {
                    if let Some(rhs_use) = rhs_use {
                        self.refpos_mut(rhs_use).flags |= RefFlags::DELAY_REG_FREE;
                    }
                }
                self.define_temp(state, block, node_id, loc);
            }
            NodeKind::PutArgReg { src, reg } => {
                self.add_reg_ref(state, RefType::FixedReg, reg, loc, block);
                let src_ivl = self.build_operand_use(
                    state,
                    block,
                    src,
                    loc,
                    RegMask::from_reg(reg),
                );
                let temp = self.define_temp_fixed(state, block, node_id, loc, reg);
                self.add_reg_ref(state, RefType::FixedReg, reg, loc.next(), block);
                if let Some(src_ivl) = src_ivl {
                    self.interval_mut(temp).related = Some(src_ivl);
                    if self.interval(src_ivl).is_local() {
                        self.interval_mut(temp).flags |= IntervalFlags::SPECIAL_PUT_ARG;
                    }
                }
            }
            NodeKind::PutArgStk { src } => {
                self.build_operand_use(state, block, src, loc, RegMask::EMPTY);
            }
            NodeKind::Call { ref name, ref args } => {
                self.build_call(state, block, node_id, name, args, loc);
            }
            NodeKind::Return { src } => {
                if let Some(src) = src {
                    let class = self.proc.node(src).ty.reg_class();
                    let ret = self.target.ret_reg(class);
                    self.add_reg_ref(state, RefType::FixedReg, ret, loc, block);
                    self.build_operand_use(state, block, src, loc, RegMask::from_reg(ret));
                }
            }
            NodeKind::JmpTrue { cond } => {
                self.build_operand_use(state, block, cond, loc, RegMask::EMPTY);
            }
            NodeKind::Nop => {}
            NodeKind::Copy { .. } | NodeKind::Reload { .. } | NodeKind::Swap { .. } => {
                unreachable!("resolution nodes cannot appear before allocation")
            }
        }
    }

    fn build_call(
        &mut self,
        state: &mut BuildState,
        block: BlockId,
        node_id: NodeId,
        name: &str,
        args: &[NodeId],
        loc: Location,
    ) {
        let mut int_args = 0usize;
        let mut float_args = 0usize;
        for &arg in args {
            match self.proc.node(arg).kind {
                NodeKind::PutArgStk { .. } => continue,
                NodeKind::PutArgReg { reg, .. } => {
                    // The argument was placed earlier; the call pins it.
                    self.add_reg_ref(state, RefType::FixedReg, reg, loc, block);
                    self.build_operand_use(state, block, arg, loc, RegMask::from_reg(reg));
                }
                _ => {
                    let ty = self.proc.node(arg).ty;
                    let class = ty.reg_class();
                    let index = match class {
                        RegClass::Int => {
                            int_args += 1;
                            int_args - 1
                        }
                        RegClass::Float => {
                            float_args += 1;
                            float_args - 1
                        }
                    };
                    let arg_reg = if self.target.reg_type_for(ty) == crate::regs::RegType::Double
                    {
                        self.target.double_arg_reg(index)
                    } else {
                        self.target.arg_reg(index, class)
                    };
                    match arg_reg {
                        Some(reg) => {
                            self.add_reg_ref(state, RefType::FixedReg, reg, loc, block);
                            self.build_operand_use(
                                state,
                                block,
                                arg,
                                loc,
                                RegMask::from_reg(reg),
                            );
                        }
                        None => {
                            self.build_operand_use(state, block, arg, loc, RegMask::EMPTY);
                        }
                    }
                }
            }
        }

        // GC-suspension helpers additionally clobber every register holding
        // a GC reference, callee-saved or not.
        if name.starts_with("gc") {
            self.new_ref(RefType::KillGcRefs, loc.next(), block);
        }

        for reg in self.target.kill_set_for_call().iter() {
            self.add_reg_ref(state, RefType::Kill, reg, loc.next(), block);
        }

        let ty = self.proc.node(node_id).ty;
        if ty.is_value() {
            let ret = self.target.ret_reg(ty.reg_class());
            self.define_temp_fixed(state, block, node_id, loc, ret);
        }
    }

    /// Use of the value produced by `src`, optionally constrained to a fixed
    /// register (`EMPTY` = any register of the class). Returns the interval.
    fn build_operand_use(
        &mut self,
        state: &mut BuildState,
        block: BlockId,
        src: NodeId,
        loc: Location,
        fixed: RegMask,
    ) -> Option<IntervalId> {
        self.build_use_ref(state, block, src, loc, fixed)
            .and_then(|rp| self.refpos(rp).interval())
    }

    fn build_use_ref(
        &mut self,
        state: &mut BuildState,
        block: BlockId,
        src: NodeId,
        loc: Location,
        fixed: RegMask,
    ) -> Option<RefPosId> {
        let interval = self.value_interval(state, src)?;
        let mask = if fixed.is_empty() {
            self.candidate_mask(self.interval(interval).reg_type)
        } else {
            fixed
        };
        let rp = self.add_interval_ref(interval, RefType::Use, loc, block, mask, Some(src));
        if self
            .proc
            .node(src)
            .flags
            .contains(NodeFlags::REG_OPTIONAL)
        {
            self.refpos_mut(rp).flags |= RefFlags::REG_OPTIONAL;
        }
        if !fixed.is_empty() {
            let ivl = self.interval_mut(interval);
            ivl.preferences = ivl.preferences.union(fixed);
        }
        // Tree temps die at their single use.
        if !self.interval(interval).is_local() {
            self.refpos_mut(rp).flags |= RefFlags::LAST_USE;
        }
        Some(rp)
    }

    /// The interval carrying the value produced by `node`: the local's
    /// interval for candidate loads, the node's tree temp otherwise.
    fn value_interval(&mut self, state: &mut BuildState, node: NodeId) -> Option<IntervalId> {
        if let NodeKind::LclLoad { lcl } = self.proc.node(node).kind {
            if let Some(interval) = self.local_intervals[lcl.index()] {
                return Some(interval);
            }
        }
        state.temp_intervals.get(&node).copied()
    }

    /// Def of a fresh tree temp for `node` at `loc + 1`.
    fn define_temp(
        &mut self,
        state: &mut BuildState,
        block: BlockId,
        node: NodeId,
        loc: Location,
    ) -> IntervalId {
        let ty = self.proc.node(node).ty;
        let reg_type = self.target.reg_type_for(ty);
        let interval = self.new_temp_interval(reg_type, ty);
        state.temp_intervals.insert(node, interval);
        let mask = self.candidate_mask(reg_type);
        let rp =
            self.add_interval_ref(interval, RefType::Def, loc.next(), block, mask, Some(node));
        if self.proc.find_consumer(block, node).is_none() {
            // Unused value: dies at its own def.
            self.refpos_mut(rp).flags |= RefFlags::LOCAL_DEF_USE | RefFlags::LAST_USE;
        }
        interval
    }

    fn define_temp_fixed(
        &mut self,
        state: &mut BuildState,
        block: BlockId,
        node: NodeId,
        loc: Location,
        reg: PhysReg,
    ) -> IntervalId {
        let ty = self.proc.node(node).ty;
        let reg_type = self.target.reg_type_for(ty);
        let interval = self.new_temp_interval(reg_type, ty);
        state.temp_intervals.insert(node, interval);
        let rp = self.add_interval_ref(
            interval,
            RefType::Def,
            loc.next(),
            block,
            RegMask::from_reg(reg),
            Some(node),
        );
        self.interval_mut(interval).preferences = RegMask::from_reg(reg);
        if self.proc.find_consumer(block, node).is_none() {
            self.refpos_mut(rp).flags |= RefFlags::LOCAL_DEF_USE | RefFlags::LAST_USE;
        }
        interval
    }

    fn new_temp_interval(&mut self, reg_type: crate::regs::RegType, ty: ValueType) -> IntervalId {
        let id = IntervalId(self.intervals.len() as u32);
        self.intervals
            .push(Interval::new(IntervalKind::TreeTemp, reg_type, ty));
        id
    }

    // ---- block postprocessing ----

    /// Exposed uses for vars flowing into an exception handler.
    fn build_exposed_uses(&mut self, state: &mut BuildState, block: BlockId) {
        let live_out = self.proc.block(block).live_out.clone();
        let loc = state.current.next();
        for (_lcl, interval) in self.local_interval_pairs() {
            let var_index = self.interval(interval).var_index().unwrap();
            if !live_out.contains(var_index) {
                continue;
            }
            let mask = self.candidate_mask(self.interval(interval).reg_type);
            self.add_interval_ref(interval, RefType::ExpUse, loc, block, mask, None);
        }
    }

    /// Backward walk marking the final use of each lifetime segment.
    fn mark_last_uses(&mut self, block: BlockId, ref_start: usize) {
        let live_out = self.proc.block(block).live_out.clone();
        let mut needed: BTreeMap<u32, bool> = BTreeMap::new();
        for idx in (ref_start..self.ref_positions.len()).rev() {
            let rp_id = RefPosId(idx as u32);
            let interval = match self.refpos(rp_id).interval() {
                Some(i) => i,
                None => continue,
            };
            let var_index = match self.interval(interval).var_index() {
                Some(v) => v,
                None => continue,
            };
            let ref_type = self.refpos(rp_id).ref_type;
            let entry = needed
                .entry(var_index)
                .or_insert_with(|| live_out.contains(var_index));
            if ref_type.is_def() {
                // The value before this def is no longer needed.
                *entry = false;
            } else if ref_type == RefType::Use {
                if !*entry {
                    self.refpos_mut(rp_id).flags |= RefFlags::LAST_USE;
                }
                *entry = true;
            }
        }
    }

    /// Locals live across a call in this block prefer callee-saved homes.
    fn set_callee_save_preferences(&mut self, block: BlockId, ref_start: usize) {
        let kill_locs: Vec<Location> = (ref_start..self.ref_positions.len())
            .filter_map(|idx| {
                let rp = &self.ref_positions[idx];
                if rp.ref_type == RefType::Kill {
                    Some(rp.location)
                } else {
                    None
                }
            })
            .collect();
        if kill_locs.is_empty() {
            return;
        }
        let live_in = self.proc.block(block).live_in.clone();
        let live_out = self.proc.block(block).live_out.clone();

        for (_lcl, interval) in self.local_interval_pairs() {
            let var_index = self.interval(interval).var_index().unwrap();
            let refs: Vec<(Location, bool)> = (ref_start..self.ref_positions.len())
                .filter_map(|idx| {
                    let rp = &self.ref_positions[idx];
                    match rp.referent {
                        Some(Referent::Interval(i)) if i == interval => {
                            Some((rp.location, rp.ref_type.is_def()))
                        }
                        _ => None,
                    }
                })
                .collect();
            for &kill_loc in &kill_locs {
                let live_before = live_in.contains(var_index)
                    || refs.iter().any(|&(l, _)| l < kill_loc);
                let live_after = live_out.contains(var_index)
                    || refs.iter().any(|&(l, is_def)| l > kill_loc && !is_def);
                if live_before && live_after {
                    self.interval_mut(interval).flags |= IntervalFlags::PREFER_CALLEE_SAVE;
                    break;
                }
            }
        }
    }
}

struct BuildState {
    current: Location,
    temp_intervals: BTreeMap<NodeId, IntervalId>,
    first_fixed: Vec<Option<RefPosId>>,
    last_fixed: Vec<Option<RefPosId>>,
}
