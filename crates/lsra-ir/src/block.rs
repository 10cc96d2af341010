//! Basic blocks.

use alloc::{vec, vec::Vec};

use crate::{node::NodeId, varset::VarSet};

/// Index of a basic block in a procedure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a block ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// Fall out of the procedure.
    Return,
    /// Unconditional jump.
    Goto(BlockId),
    /// Two-way branch; the condition is the trailing `JmpTrue` node.
    Cond { then_blk: BlockId, else_blk: BlockId },
    /// No successors (throw, unreachable).
    Throw,
}

/// A basic block: an ordered list of nodes plus edge structure, execution
/// weight, and the liveness sets the allocator consumes.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    pub kind: BlockKind,
    /// Execution-frequency weight.
    pub weight: f64,
    /// Known to execute rarely; the block sequencer deprioritizes it.
    pub rarely_run: bool,
    /// This block is the entry of an exception handler.
    pub eh_entry: bool,
    pub nodes: Vec<NodeId>,

    // Filled by `compute_liveness`.
    pub live_in: VarSet,
    pub live_out: VarSet,
    pub var_use: VarSet,
    pub var_def: VarSet,
}

impl BasicBlock {
    pub fn new(id: BlockId, kind: BlockKind) -> Self {
        Self {
            id,
            kind,
            weight: 1.0,
            rarely_run: false,
            eh_entry: false,
            nodes: Vec::new(),
            live_in: VarSet::new(0),
            live_out: VarSet::new(0),
            var_use: VarSet::new(0),
            var_def: VarSet::new(0),
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self.kind {
            BlockKind::Return | BlockKind::Throw => vec![],
            BlockKind::Goto(t) => vec![t],
            BlockKind::Cond { then_blk, else_blk } => {
                if then_blk == else_blk {
                    vec![then_blk]
                } else {
                    vec![then_blk, else_blk]
                }
            }
        }
    }

    /// Redirect every edge to `old` so it points at `new`.
    pub fn retarget_successor(&mut self, old: BlockId, new: BlockId) {
        match &mut self.kind {
            BlockKind::Goto(t) => {
                if *t == old {
                    *t = new;
                }
            }
            BlockKind::Cond { then_blk, else_blk } => {
                if *then_blk == old {
                    *then_blk = new;
                }
                if *else_blk == old {
                    *else_blk = new;
                }
            }
            BlockKind::Return | BlockKind::Throw => {}
        }
    }
}
