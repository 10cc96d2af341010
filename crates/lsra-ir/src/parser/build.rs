//! Resolution of the parsed AST into a `Procedure`.

use alloc::{collections::BTreeMap, format, string::String, vec::Vec};

use crate::{
    block::{BlockId, BlockKind},
    locals::LclVar,
    node::{NodeId, NodeKind},
    proc::Procedure,
    types::{PhysReg, ValueType},
};

use super::{
    error::{resolve_error, ParseError},
    stmt::{BlockAst, Expr, ProcAst, Stmt},
};

pub(crate) fn build_proc(ast: ProcAst) -> Result<Procedure, ParseError> {
    let mut proc = Procedure::new(ast.name.clone());

    for (ty, name) in &ast.params {
        let mut lcl = LclVar::new(name.clone(), *ty);
        lcl.is_param = true;
        let id = proc.add_local(lcl);
        proc.params.push(id);
    }

    // Blocks are numbered by order of appearance; create them up front so
    // forward branches resolve.
    let mut labels: BTreeMap<String, BlockId> = BTreeMap::new();
    for block_ast in &ast.blocks {
        let kind = block_kind(block_ast)?;
        let id = proc.add_block(kind);
        if labels.insert(block_ast.label.clone(), id).is_some() {
            return Err(resolve_error(format!(
                "duplicate block label {}",
                block_ast.label
            )));
        }
    }
    // Rewrite label-ordinal targets into actual ids.
    for (i, block_ast) in ast.blocks.iter().enumerate() {
        let id = BlockId(i as u32);
        let kind = resolve_kind(block_ast, &labels)?;
        proc.block_mut(id).kind = kind;
        if let Some(w) = block_ast.weight {
            proc.block_mut(id).weight = w;
        }
        if block_ast.cold {
            proc.block_mut(id).rarely_run = true;
            proc.block_mut(id).weight = 0.0;
        }
        if block_ast.eh {
            proc.block_mut(id).eh_entry = true;
            proc.has_eh = true;
        }
    }

    for (i, block_ast) in ast.blocks.iter().enumerate() {
        build_block(&mut proc, BlockId(i as u32), block_ast, &labels)?;
    }

    Ok(proc)
}

fn block_kind(block: &BlockAst) -> Result<BlockKind, ParseError> {
    // Placeholder targets; resolved after all blocks exist.
    match terminator(block)? {
        Stmt::Goto { .. } | Stmt::JmpTrue { .. } => Ok(BlockKind::Goto(BlockId(0))),
        Stmt::Throw => Ok(BlockKind::Throw),
        _ => Ok(BlockKind::Return),
    }
}

fn terminator(block: &BlockAst) -> Result<&Stmt, ParseError> {
    let last = block.stmts.iter().rev().find(|s| {
        !matches!(s, Stmt::LocalDecl { .. })
    });
    match last {
        Some(s @ (Stmt::Goto { .. } | Stmt::JmpTrue { .. } | Stmt::Ret { .. } | Stmt::Throw)) => {
            Ok(s)
        }
        _ => Err(resolve_error(format!(
            "block {} does not end in a terminator",
            block.label
        ))),
    }
}

fn resolve_kind(
    block: &BlockAst,
    labels: &BTreeMap<String, BlockId>,
) -> Result<BlockKind, ParseError> {
    let lookup = |label: &String| {
        labels
            .get(label)
            .copied()
            .ok_or_else(|| resolve_error(format!("unknown block {}", label)))
    };
    match terminator(block)? {
        Stmt::Goto { target } => Ok(BlockKind::Goto(lookup(target)?)),
        Stmt::JmpTrue {
            then_blk, else_blk, ..
        } => Ok(BlockKind::Cond {
            then_blk: lookup(then_blk)?,
            else_blk: lookup(else_blk)?,
        }),
        Stmt::Throw => Ok(BlockKind::Throw),
        _ => Ok(BlockKind::Return),
    }
}

fn build_block(
    proc: &mut Procedure,
    id: BlockId,
    block: &BlockAst,
    _labels: &BTreeMap<String, BlockId>,
) -> Result<(), ParseError> {
    let mut temps: BTreeMap<String, NodeId> = BTreeMap::new();

    let lookup_temp = |temps: &BTreeMap<String, NodeId>, name: &String| {
        temps
            .get(name)
            .copied()
            .ok_or_else(|| resolve_error(format!("unknown temp {}", name)))
    };

    for stmt in &block.stmts {
        match stmt {
            Stmt::LocalDecl { ty, name } => {
                if proc.find_local(name).is_some() {
                    return Err(resolve_error(format!("duplicate local {}", name)));
                }
                proc.add_local(LclVar::new(name.clone(), *ty));
            }
            Stmt::Assign { dst, expr } => {
                let node = build_expr(proc, id, expr, &temps)?;
                temps.insert(dst.clone(), node);
            }
            Stmt::Store { lcl, src } => {
                let src = lookup_temp(&temps, src)?;
                let lcl_id = match proc.find_local(lcl) {
                    Some(l) => l,
                    None => {
                        // Implicit declaration, typed from the stored value.
                        let ty = proc.node(src).ty;
                        proc.add_local(LclVar::new(lcl.clone(), ty))
                    }
                };
                proc.push_node(id, NodeKind::LclStore { lcl: lcl_id, src }, ValueType::Void);
            }
            Stmt::VoidCall { name, args } => {
                let args = args
                    .iter()
                    .map(|a| lookup_temp(&temps, a))
                    .collect::<Result<Vec<_>, _>>()?;
                proc.push_node(
                    id,
                    NodeKind::Call {
                        name: name.clone(),
                        args,
                    },
                    ValueType::Void,
                );
            }
            Stmt::JmpTrue { cond, .. } => {
                let cond = lookup_temp(&temps, cond)?;
                proc.push_node(id, NodeKind::JmpTrue { cond }, ValueType::Void);
            }
            Stmt::Goto { .. } | Stmt::Throw => {}
            Stmt::Ret { src } => {
                let src = match src {
                    Some(s) => Some(lookup_temp(&temps, s)?),
                    None => None,
                };
                proc.push_node(id, NodeKind::Return { src }, ValueType::Void);
            }
        }
    }
    Ok(())
}

fn build_expr(
    proc: &mut Procedure,
    id: BlockId,
    expr: &Expr,
    temps: &BTreeMap<String, NodeId>,
) -> Result<NodeId, ParseError> {
    let lookup_temp = |name: &String| {
        temps
            .get(name)
            .copied()
            .ok_or_else(|| resolve_error(format!("unknown temp {}", name)))
    };
    Ok(match expr {
        Expr::Lcl(name) => {
            let lcl = proc
                .find_local(name)
                .ok_or_else(|| resolve_error(format!("use of undeclared local {}", name)))?;
            let ty = proc.lcl(lcl).ty;
            proc.push_node(id, NodeKind::LclLoad { lcl }, ty)
        }
        Expr::IConst { bits, ty } => proc.push_node(id, NodeKind::IntConst { bits: *bits }, *ty),
        Expr::DConst { bits } => {
            proc.push_node(id, NodeKind::DblConst { bits: *bits }, ValueType::Double)
        }
        Expr::BinOp { op, rmw, lhs, rhs } => {
            let lhs = lookup_temp(lhs)?;
            let rhs = lookup_temp(rhs)?;
            let ty = proc.node(lhs).ty;
            proc.push_node(
                id,
                NodeKind::BinOp {
                    op: *op,
                    lhs,
                    rhs,
                    rmw: *rmw,
                },
                ty,
            )
        }
        Expr::Call { name, ty, args } => {
            let args = args
                .iter()
                .map(lookup_temp)
                .collect::<Result<Vec<_>, _>>()?;
            proc.push_node(
                id,
                NodeKind::Call {
                    name: name.clone(),
                    args,
                },
                *ty,
            )
        }
        Expr::PutArg { src, reg } => {
            let src = lookup_temp(src)?;
            let ty = proc.node(src).ty;
            proc.push_node(
                id,
                NodeKind::PutArgReg {
                    src,
                    reg: PhysReg(*reg),
                },
                ty,
            )
        }
        Expr::PutArgStk { src } => {
            let src = lookup_temp(src)?;
            let ty = proc.node(src).ty;
            proc.push_node(id, NodeKind::PutArgStk { src }, ty)
        }
    })
}
