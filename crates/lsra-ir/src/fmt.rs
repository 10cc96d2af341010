//! Human-readable formatting for procedures.
//!
//! Used by trace logging and test failure output; register annotations and
//! spill flags appear inline so an allocated procedure reads like a listing.

use core::fmt;

use crate::{
    block::BlockKind,
    node::{Node, NodeFlags, NodeId, NodeKind, Oper},
    proc::Procedure,
};

impl fmt::Display for Oper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Oper::Add => "add",
            Oper::Sub => "sub",
            Oper::Mul => "mul",
            Oper::And => "and",
            Oper::Or => "or",
            Oper::Xor => "xor",
            Oper::FAdd => "fadd",
            Oper::FSub => "fsub",
            Oper::FMul => "fmul",
        };
        f.write_str(s)
    }
}

struct NodeDisplay<'a> {
    proc: &'a Procedure,
    id: NodeId,
}

impl fmt::Display for NodeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.proc.node(self.id);
        if node.produces_value() {
            write!(f, "v{} = ", self.id.0)?;
        }
        match &node.kind {
            NodeKind::LclLoad { lcl } => write!(f, "lcl ${}", self.proc.lcl(*lcl).name)?,
            NodeKind::LclStore { lcl, src } => {
                write!(f, "store ${}, v{}", self.proc.lcl(*lcl).name, src.0)?
            }
            NodeKind::IntConst { bits } => write!(f, "iconst {}", bits)?,
            NodeKind::DblConst { bits } => write!(f, "dconst {}", f64::from_bits(*bits))?,
            NodeKind::BinOp { op, lhs, rhs, rmw } => {
                write!(
                    f,
                    "{}{} v{}, v{}",
                    op,
                    if *rmw { ".rmw" } else { "" },
                    lhs.0,
                    rhs.0
                )?;
            }
            NodeKind::Call { name, args } => {
                write!(f, "call %{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "v{}", a.0)?;
                }
                write!(f, ")")?;
            }
            NodeKind::PutArgReg { src, reg } => write!(f, "putarg v{}, {}", src.0, reg)?,
            NodeKind::PutArgStk { src } => write!(f, "putargstk v{}", src.0)?,
            NodeKind::Return { src } => match src {
                Some(s) => write!(f, "ret v{}", s.0)?,
                None => write!(f, "ret")?,
            },
            NodeKind::JmpTrue { cond } => write!(f, "jmptrue v{}", cond.0)?,
            NodeKind::Copy { src } => write!(f, "copy v{}", src.0)?,
            NodeKind::Reload { src } => write!(f, "reload v{}", src.0)?,
            NodeKind::Swap { a, b } => write!(f, "swap v{}, v{}", a.0, b.0)?,
            NodeKind::Nop => write!(f, "nop")?,
        }
        write_annotations(f, node)
    }
}

fn write_annotations(f: &mut fmt::Formatter<'_>, node: &Node) -> fmt::Result {
    if let Some(reg) = node.reg(0) {
        write!(f, " [{}", reg)?;
        if let Some(hi) = node.reg(1) {
            write!(f, ":{}", hi)?;
        }
        write!(f, "]")?;
    }
    if node.flags.contains(NodeFlags::SPILL) {
        write!(f, " {{spill}}")?;
    }
    if node.flags.contains(NodeFlags::SPILLED) {
        write!(f, " {{reload}}")?;
    }
    if node.flags.contains(NodeFlags::NOREG_AT_USE) {
        write!(f, " {{mem}}")?;
    }
    if node.flags.contains(NodeFlags::REUSE_REG_VAL) {
        write!(f, " {{reuse}}")?;
    }
    Ok(())
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "proc %{} {{", self.name)?;
        for block in self.blocks() {
            write!(f, "block{}", block.id.0)?;
            if block.weight != 1.0 {
                write!(f, " (weight {})", block.weight)?;
            }
            if block.eh_entry {
                write!(f, " (eh)")?;
            }
            writeln!(f, ":")?;
            for &node in &block.nodes {
                writeln!(f, "    {}", NodeDisplay { proc: self, id: node })?;
            }
            match block.kind {
                BlockKind::Goto(t) => writeln!(f, "    goto block{}", t.0)?,
                BlockKind::Cond { then_blk, else_blk } => {
                    writeln!(f, "    -> block{}, block{}", then_blk.0, else_blk.0)?
                }
                BlockKind::Return | BlockKind::Throw => {}
            }
        }
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use alloc::format;

    use crate::parse_proc;

    #[test]
    fn test_display_round_trips_shapes() {
        let proc = parse_proc(
            r#"
proc %t(i32 $a) {
block0:
    v0 = lcl $a
    v1 = iconst 5
    v2 = add.rmw v0, v1
    store $b, v2
    jmptrue v2, block1, block1
block1:
    ret
}"#,
        )
        .unwrap();
        let text = format!("{}", proc);
        assert!(text.contains("proc %t"));
        assert!(text.contains("lcl $a"));
        assert!(text.contains("add.rmw"));
        assert!(text.contains("store $b"));
        assert!(text.contains("-> block1, block1"));
    }

    #[test]
    fn test_display_shows_annotations() {
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
        let block = crate::BlockId(0);
        let node = proc.block(block).nodes[0];
        proc.node_mut(node).set_reg(0, crate::PhysReg(3));
        proc.node_mut(node).set_spill(0);
        let text = format!("{}", proc);
        assert!(text.contains("[r3]"));
        assert!(text.contains("{spill}"));
    }
}
