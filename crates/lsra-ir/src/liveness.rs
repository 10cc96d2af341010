//! Liveness analysis over tracked locals.
//!
//! Fills each block's `var_use`/`var_def` gen/kill sets and iterates the
//! backward dataflow until `live_in`/`live_out` stabilize. The allocator
//! consumes the sets to seed block-boundary register maps and to compute
//! last uses.

use alloc::vec::Vec;

use crate::{
    node::NodeKind,
    proc::Procedure,
    varset::VarSet,
};

/// Compute `var_use`, `var_def`, `live_in`, and `live_out` for every block.
///
/// Requires `assign_var_indices` to have run; all sets are sized to the
/// procedure's tracked count.
pub fn compute_liveness(proc: &mut Procedure) {
    let capacity = proc.tracked_count;
    let block_count = proc.block_count();

    // Gen/kill per block: var_use is upward-exposed uses, var_def is defs.
    for bi in 0..block_count {
        let mut var_use = VarSet::new(capacity);
        let mut var_def = VarSet::new(capacity);
        let block = proc.block(crate::BlockId(bi as u32));
        let nodes: Vec<_> = block.nodes.clone();
        for node_id in nodes {
            match proc.node(node_id).kind {
                NodeKind::LclLoad { lcl } => {
                    let l = proc.lcl(lcl);
                    if l.tracked && !var_def.contains(l.var_index) {
                        var_use.insert(l.var_index);
                    }
                }
                NodeKind::LclStore { lcl, .. } => {
                    let l = proc.lcl(lcl);
                    if l.tracked {
                        var_def.insert(l.var_index);
                    }
                }
                _ => {}
            }
        }
        let block = proc.block_mut(crate::BlockId(bi as u32));
        block.var_use = var_use;
        block.var_def = var_def;
        block.live_in = VarSet::new(capacity);
        block.live_out = VarSet::new(capacity);
    }

    // Backward iteration to a fixed point.
    let mut changed = true;
    while changed {
        changed = false;
        for bi in (0..block_count).rev() {
            let id = crate::BlockId(bi as u32);
            let mut live_out = VarSet::new(capacity);
            for succ in proc.block(id).successors() {
                live_out.union_with(&proc.block(succ).live_in);
            }
            // live_in = var_use | (live_out - var_def)
            let mut live_in = live_out.clone();
            live_in.subtract(&proc.block(id).var_def);
            live_in.union_with(&proc.block(id).var_use);

            let block = proc.block_mut(id);
            if live_out != block.live_out || live_in != block.live_in {
                block.live_out = live_out;
                block.live_in = live_in;
                changed = true;
            }
        }
    }

    // Parameters are defined on entry; anything live-in to the entry block
    // that is not a parameter will need a zero-init or dummy def.
}
