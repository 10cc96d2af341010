//! Lowered intermediate representation (IR) for the register allocator.
//!
//! This crate defines the IR the allocator consumes and annotates:
//! - Types (value types and register classes)
//! - Nodes (linear, single-consumer tree temps)
//! - Blocks (basic blocks with liveness sets and edge structure)
//! - Procedures (blocks, node arena, local-variable table)
//! - Locals (the per-variable table the allocator reads and writes)
//! - Liveness (tracked-variable bitsets and the dataflow that fills them)

#![no_std]

extern crate alloc;

mod block;
mod fmt;
mod liveness;
mod locals;
mod node;
mod parser;
mod proc;
mod types;
mod varset;

pub use block::{BasicBlock, BlockId, BlockKind};
pub use liveness::compute_liveness;
pub use locals::{LclId, LclVar};
pub use node::{Node, NodeFlags, NodeId, NodeKind, Oper};
pub use parser::{parse_proc, ParseError};
pub use proc::Procedure;
pub use types::{PhysReg, RegClass, ValueType};
pub use varset::VarSet;
