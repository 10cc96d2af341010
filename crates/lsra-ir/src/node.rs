//! IR nodes.
//!
//! The IR is linear: every value-producing node is a "tree temp" consumed by
//! exactly one later node in the same block. Operands are node ids pointing
//! at earlier nodes.

use alloc::{string::String, vec, vec::Vec};

use bitflags::bitflags;

use crate::{
    locals::LclId,
    types::{PhysReg, ValueType},
};

/// Index of a node in a procedure's node arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Oper {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    FAdd,
    FSub,
    FMul,
}

/// The operation a node performs.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    /// Read a local variable.
    LclLoad { lcl: LclId },
    /// Write a local variable from a tree temp.
    LclStore { lcl: LclId, src: NodeId },
    /// Integer constant (also used for Ref null with a GC type).
    IntConst { bits: i64 },
    /// Floating-point constant, stored as raw bits so nodes stay `Eq`-friendly.
    DblConst { bits: u64 },
    /// Binary operation. `rmw` marks read-modify-write instructions whose
    /// destination register must differ from the second source.
    BinOp {
        op: Oper,
        lhs: NodeId,
        rhs: NodeId,
        rmw: bool,
    },
    /// Call. Arguments are earlier nodes (plain temps or `PutArgReg`s).
    Call { name: String, args: Vec<NodeId> },
    /// Place an argument value in a specific register for a call.
    PutArgReg { src: NodeId, reg: PhysReg },
    /// Place an argument value on the outgoing argument stack area.
    PutArgStk { src: NodeId },
    /// Return, optionally with a value.
    Return { src: Option<NodeId> },
    /// Conditional branch on a tree temp; targets live on the block.
    JmpTrue { cond: NodeId },
    /// Register-to-register copy inserted by resolution.
    Copy { src: NodeId },
    /// Reload of a spilled value inserted by resolution.
    Reload { src: NodeId },
    /// Atomic exchange of two locals' registers, inserted by resolution.
    Swap { a: NodeId, b: NodeId },
    /// No operation.
    Nop,
}

bitflags! {
    /// Per-node flags written by the allocator and consumed by code generation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct NodeFlags: u16 {
        /// Store this node's result to its stack home after the def.
        const SPILL = 1 << 0;
        /// This use reads a value that was spilled; reload before use.
        const SPILLED = 1 << 1;
        /// Reg-optional use that ended up being satisfied from memory.
        const NOREG_AT_USE = 1 << 2;
        /// Constant def that reuses a register already holding the value.
        const REUSE_REG_VAL = 1 << 3;
        /// This use may be satisfied from memory if no register is worth it.
        const REG_OPTIONAL = 1 << 4;
        /// Spill flag for the second register of a multi-reg node.
        const SPILL_HI = 1 << 5;
        /// Spilled flag for the second register of a multi-reg node.
        const SPILLED_HI = 1 << 6;
    }
}

/// Maximum registers a single node may define.
pub const MAX_MULTIREG: usize = 2;

/// One IR node.
#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub ty: ValueType,
    pub flags: NodeFlags,
    regs: [Option<PhysReg>; MAX_MULTIREG],
}

impl Node {
    pub fn new(kind: NodeKind, ty: ValueType) -> Self {
        Self {
            kind,
            ty,
            flags: NodeFlags::empty(),
            regs: [None; MAX_MULTIREG],
        }
    }

    /// The register assigned to result `idx`, if any.
    pub fn reg(&self, idx: usize) -> Option<PhysReg> {
        self.regs[idx]
    }

    /// Assign a register to result `idx`.
    pub fn set_reg(&mut self, idx: usize, reg: PhysReg) {
        self.regs[idx] = Some(reg);
    }

    /// Clear the register of result `idx`.
    pub fn clear_reg(&mut self, idx: usize) {
        self.regs[idx] = None;
    }

    /// Set the spill-after flag for result `idx`.
    pub fn set_spill(&mut self, idx: usize) {
        self.flags |= if idx == 0 {
            NodeFlags::SPILL
        } else {
            NodeFlags::SPILL_HI
        };
    }

    /// Set the spilled (reload-before-use) flag for result `idx`.
    pub fn set_spilled(&mut self, idx: usize) {
        self.flags |= if idx == 0 {
            NodeFlags::SPILLED
        } else {
            NodeFlags::SPILLED_HI
        };
    }

    /// The operand nodes this node consumes, in evaluation order.
    pub fn operands(&self) -> Vec<NodeId> {
        match &self.kind {
            NodeKind::LclLoad { .. }
            | NodeKind::IntConst { .. }
            | NodeKind::DblConst { .. }
            | NodeKind::Nop => Vec::new(),
            NodeKind::LclStore { src, .. }
            | NodeKind::PutArgReg { src, .. }
            | NodeKind::PutArgStk { src }
            | NodeKind::Copy { src }
            | NodeKind::Reload { src }
            | NodeKind::JmpTrue { cond: src } => vec![*src],
            NodeKind::BinOp { lhs, rhs, .. } => vec![*lhs, *rhs],
            NodeKind::Call { args, .. } => args.clone(),
            NodeKind::Return { src } => src.iter().copied().collect(),
            NodeKind::Swap { a, b } => vec![*a, *b],
        }
    }

    /// Rewrite the operand `old` to `new`. Panics if `old` is not an operand.
    pub fn replace_operand(&mut self, old: NodeId, new: NodeId) {
        let replaced = match &mut self.kind {
            NodeKind::LclStore { src, .. }
            | NodeKind::PutArgReg { src, .. }
            | NodeKind::PutArgStk { src }
            | NodeKind::Copy { src }
            | NodeKind::Reload { src }
            | NodeKind::JmpTrue { cond: src } => {
                if *src == old {
                    *src = new;
                    true
                } else {
                    false
                }
            }
            NodeKind::BinOp { lhs, rhs, .. } => {
                if *lhs == old {
                    *lhs = new;
                    true
                } else if *rhs == old {
                    *rhs = new;
                    true
                } else {
                    false
                }
            }
            NodeKind::Call { args, .. } => {
                let mut hit = false;
                for a in args.iter_mut() {
                    if *a == old {
                        *a = new;
                        hit = true;
                    }
                }
                hit
            }
            NodeKind::Return { src } => {
                if *src == Some(old) {
                    *src = Some(new);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        assert!(replaced, "operand {:?} not found on node", old);
    }

    /// Whether this node produces a value consumed by a later node.
    pub fn produces_value(&self) -> bool {
        self.ty.is_value()
            && !matches!(
                self.kind,
                NodeKind::LclStore { .. }
                    | NodeKind::Return { .. }
                    | NodeKind::JmpTrue { .. }
                    | NodeKind::Swap { .. }
                    | NodeKind::Nop
            )
    }
}
