//! Procedures: the unit the allocator operates on.

use alloc::{string::String, vec, vec::Vec};

use crate::{
    block::{BasicBlock, BlockId, BlockKind},
    locals::{LclId, LclVar},
    node::{Node, NodeId, NodeKind},
    types::ValueType,
};

/// A lowered procedure: a node arena, basic blocks referencing nodes by id,
/// and the local-variable table.
#[derive(Clone, Debug)]
pub struct Procedure {
    pub name: String,
    nodes: Vec<Node>,
    blocks: Vec<BasicBlock>,
    locals: Vec<LclVar>,
    pub params: Vec<LclId>,
    /// Number of tracked locals; the width of every liveness set.
    pub tracked_count: u32,
    /// Untracked memory is zero-initialized on entry (selects `ZeroInit`
    /// positions over `DummyDef`s for live-in locals without a def).
    pub init_mem: bool,
    /// Procedure contains exception-handling flow.
    pub has_eh: bool,
    /// Compiled at minimum optimization.
    pub min_opts: bool,
}

impl Procedure {
    pub fn new(name: String) -> Self {
        Self {
            name,
            nodes: Vec::new(),
            blocks: Vec::new(),
            locals: Vec::new(),
            params: Vec::new(),
            tracked_count: 0,
            init_mem: true,
            has_eh: false,
            min_opts: false,
        }
    }

    // ---- locals ----

    pub fn add_local(&mut self, lcl: LclVar) -> LclId {
        let id = LclId(self.locals.len() as u32);
        self.locals.push(lcl);
        id
    }

    pub fn lcl(&self, id: LclId) -> &LclVar {
        &self.locals[id.index()]
    }

    pub fn lcl_mut(&mut self, id: LclId) -> &mut LclVar {
        &mut self.locals[id.index()]
    }

    pub fn locals(&self) -> impl Iterator<Item = (LclId, &LclVar)> {
        self.locals
            .iter()
            .enumerate()
            .map(|(i, l)| (LclId(i as u32), l))
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn find_local(&self, name: &str) -> Option<LclId> {
        self.locals
            .iter()
            .position(|l| l.name == name)
            .map(|i| LclId(i as u32))
    }

    // ---- blocks ----

    pub fn add_block(&mut self, kind: BlockKind) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, kind));
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn entry_block(&self) -> BlockId {
        BlockId(0)
    }

    /// Predecessor lists, indexed by block.
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for block in &self.blocks {
            for succ in block.successors() {
                preds[succ.index()].push(block.id);
            }
        }
        preds
    }

    // ---- nodes ----

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Append a node to a block.
    pub fn push_node(&mut self, block: BlockId, kind: NodeKind, ty: ValueType) -> NodeId {
        let id = self.alloc_node(Node::new(kind, ty));
        self.blocks[block.index()].nodes.push(id);
        id
    }

    /// Insert a node immediately before `anchor` in `block`.
    pub fn insert_before(
        &mut self,
        block: BlockId,
        anchor: NodeId,
        kind: NodeKind,
        ty: ValueType,
    ) -> NodeId {
        let id = self.alloc_node(Node::new(kind, ty));
        let nodes = &mut self.blocks[block.index()].nodes;
        let pos = nodes
            .iter()
            .position(|n| *n == anchor)
            .expect("anchor node not in block");
        nodes.insert(pos, id);
        id
    }

    /// Insert a node immediately after `anchor` in `block`.
    pub fn insert_after(
        &mut self,
        block: BlockId,
        anchor: NodeId,
        kind: NodeKind,
        ty: ValueType,
    ) -> NodeId {
        let id = self.alloc_node(Node::new(kind, ty));
        let nodes = &mut self.blocks[block.index()].nodes;
        let pos = nodes
            .iter()
            .position(|n| *n == anchor)
            .expect("anchor node not in block");
        nodes.insert(pos + 1, id);
        id
    }

    /// Insert a node at the top of a block.
    pub fn insert_at_start(&mut self, block: BlockId, kind: NodeKind, ty: ValueType) -> NodeId {
        let id = self.alloc_node(Node::new(kind, ty));
        self.blocks[block.index()].nodes.insert(0, id);
        id
    }

    /// Insert a node at a specific index in a block's node list.
    pub fn insert_at(
        &mut self,
        block: BlockId,
        index: usize,
        kind: NodeKind,
        ty: ValueType,
    ) -> NodeId {
        let id = self.alloc_node(Node::new(kind, ty));
        self.blocks[block.index()].nodes.insert(index, id);
        id
    }

    /// The index where end-of-block insertions go: before a trailing branch
    /// or return, after everything else.
    pub fn end_insertion_point(&self, block: BlockId) -> usize {
        let nodes = &self.blocks[block.index()].nodes;
        match nodes.last() {
            Some(last)
                if matches!(
                    self.nodes[last.index()].kind,
                    NodeKind::JmpTrue { .. } | NodeKind::Return { .. }
                ) =>
            {
                nodes.len() - 1
            }
            _ => nodes.len(),
        }
    }

    /// Insert a node at the bottom of a block, before a trailing branch.
    pub fn insert_at_end(&mut self, block: BlockId, kind: NodeKind, ty: ValueType) -> NodeId {
        let pos = self.end_insertion_point(block);
        self.insert_at(block, pos, kind, ty)
    }

    /// The unique consumer of a value-producing node within its block.
    pub fn find_consumer(&self, block: BlockId, node: NodeId) -> Option<NodeId> {
        self.blocks[block.index()]
            .nodes
            .iter()
            .find(|n| self.nodes[n.index()].operands().contains(&node))
            .copied()
    }

    /// Wrap `wrapped` in a new node (e.g. `Copy`/`Reload`) inserted right
    /// after it, rewiring the unique consumer to the wrapper.
    pub fn wrap_node(
        &mut self,
        block: BlockId,
        wrapped: NodeId,
        make: impl FnOnce(NodeId) -> NodeKind,
    ) -> NodeId {
        let ty = self.nodes[wrapped.index()].ty;
        let consumer = self.find_consumer(block, wrapped);
        let wrapper = self.insert_after(block, wrapped, make(wrapped), ty);
        if let Some(consumer) = consumer {
            self.nodes[consumer.index()].replace_operand(wrapped, wrapper);
        }
        wrapper
    }

    /// Split the edge `from -> to` with a fresh block that jumps to `to`.
    pub fn split_edge(&mut self, from: BlockId, to: BlockId) -> BlockId {
        let weight = self.blocks[from.index()]
            .weight
            .min(self.blocks[to.index()].weight);
        let new = self.add_block(BlockKind::Goto(to));
        self.blocks[new.index()].weight = weight;
        self.blocks[new.index()].live_in = self.blocks[to.index()].live_in.clone();
        self.blocks[new.index()].live_out = self.blocks[to.index()].live_in.clone();
        self.blocks[from.index()].retarget_successor(to, new);
        new
    }

    /// Count appearances of each local, weighted by block frequency.
    pub fn compute_ref_counts(&mut self) {
        for lcl in &mut self.locals {
            lcl.ref_cnt = 0;
            lcl.ref_cnt_wtd = 0.0;
        }
        // Parameters get an implicit entry def.
        for &p in &self.params {
            self.locals[p.index()].ref_cnt += 1;
            self.locals[p.index()].ref_cnt_wtd += 1.0;
        }
        for bi in 0..self.blocks.len() {
            let weight = self.blocks[bi].weight;
            for ni in 0..self.blocks[bi].nodes.len() {
                let node = self.blocks[bi].nodes[ni];
                match self.nodes[node.index()].kind {
                    NodeKind::LclLoad { lcl } | NodeKind::LclStore { lcl, .. } => {
                        self.locals[lcl.index()].ref_cnt += 1;
                        self.locals[lcl.index()].ref_cnt_wtd += weight;
                    }
                    _ => {}
                }
            }
        }
    }

    /// Assign dense tracked indices to every trackable local.
    ///
    /// A local is trackable when it is referenced, not address-exposed, and
    /// not pinned. Returns the tracked count.
    pub fn assign_var_indices(&mut self) -> u32 {
        let mut next = 0u32;
        for lcl in &mut self.locals {
            if lcl.ref_cnt > 0 && !lcl.addr_exposed && !lcl.pinned {
                lcl.tracked = true;
                lcl.var_index = next;
                next += 1;
            } else {
                lcl.tracked = false;
            }
        }
        self.tracked_count = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::node::Oper;

    fn two_block_proc() -> Procedure {
        let mut proc = Procedure::new("t".to_string());
        let b0 = proc.add_block(BlockKind::Goto(BlockId(1)));
        let b1 = proc.add_block(BlockKind::Return);
        let a = proc.add_local(LclVar::new("a".to_string(), ValueType::Int));
        let c0 = proc.push_node(b0, NodeKind::IntConst { bits: 1 }, ValueType::Int);
        proc.push_node(b0, NodeKind::LclStore { lcl: a, src: c0 }, ValueType::Void);
        let u = proc.push_node(b1, NodeKind::LclLoad { lcl: a }, ValueType::Int);
        proc.push_node(b1, NodeKind::Return { src: Some(u) }, ValueType::Void);
        proc
    }

    #[test]
    fn test_predecessors() {
        let proc = two_block_proc();
        let preds = proc.predecessors();
        assert!(preds[0].is_empty());
        assert_eq!(preds[1], vec![BlockId(0)]);
    }

    #[test]
    fn test_ref_counts() {
        let mut proc = two_block_proc();
        proc.compute_ref_counts();
        let a = proc.find_local("a").unwrap();
        assert_eq!(proc.lcl(a).ref_cnt, 2);
        assert!((proc.lcl(a).ref_cnt_wtd - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_assign_var_indices_skips_exposed() {
        let mut proc = two_block_proc();
        let b = proc.add_local(LclVar::new("b".to_string(), ValueType::Int));
        proc.lcl_mut(b).addr_exposed = true;
        proc.lcl_mut(b).ref_cnt = 3;
        proc.compute_ref_counts();
        proc.lcl_mut(b).ref_cnt = 3;
        let count = proc.assign_var_indices();
        assert_eq!(count, 1);
        assert!(!proc.lcl(b).tracked);
    }

    #[test]
    fn test_wrap_node_rewires_consumer() {
        let mut proc = Procedure::new("t".to_string());
        let b0 = proc.add_block(BlockKind::Return);
        let c0 = proc.push_node(b0, NodeKind::IntConst { bits: 1 }, ValueType::Int);
        let c1 = proc.push_node(b0, NodeKind::IntConst { bits: 2 }, ValueType::Int);
        let add = proc.push_node(
            b0,
            NodeKind::BinOp {
                op: Oper::Add,
                lhs: c0,
                rhs: c1,
                rmw: false,
            },
            ValueType::Int,
        );
        let wrapper = proc.wrap_node(b0, c1, |src| NodeKind::Copy { src });
        assert_eq!(proc.node(add).operands(), vec![c0, wrapper]);
        // Wrapper sits between c1 and add.
        let order = &proc.block(b0).nodes;
        assert_eq!(order.as_slice(), &[c0, c1, wrapper, add]);
    }

    #[test]
    fn test_split_edge() {
        let mut proc = two_block_proc();
        let new = proc.split_edge(BlockId(0), BlockId(1));
        assert_eq!(proc.block(BlockId(0)).successors(), vec![new]);
        assert_eq!(proc.block(new).successors(), vec![BlockId(1)]);
    }

    #[test]
    fn test_insert_at_end_respects_branch() {
        let mut proc = Procedure::new("t".to_string());
        let b0 = proc.add_block(BlockKind::Cond {
            then_blk: BlockId(0),
            else_blk: BlockId(0),
        });
        let c = proc.push_node(b0, NodeKind::IntConst { bits: 0 }, ValueType::Int);
        let j = proc.push_node(b0, NodeKind::JmpTrue { cond: c }, ValueType::Void);
        let inserted = proc.insert_at_end(b0, NodeKind::Nop, ValueType::Void);
        assert_eq!(proc.block(b0).nodes.as_slice(), &[c, inserted, j]);
    }
}
