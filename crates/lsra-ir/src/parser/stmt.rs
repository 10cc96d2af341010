//! Statement-level grammar: blocks, statements, expressions.

use alloc::{string::String, vec::Vec};

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::char,
    combinator::{map, opt},
    multi::{many0, separated_list0},
    sequence::{delimited, preceded, separated_pair, tuple},
    IResult,
};

use crate::{node::Oper, types::ValueType};

use super::primitives::{
    block_name, float, integer, lcl_name, node_name, phys_reg, proc_name, value_type, ws,
};

/// Right-hand side of a `vN = ...` assignment.
#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Lcl(String),
    IConst { bits: i64, ty: ValueType },
    DConst { bits: u64 },
    BinOp {
        op: Oper,
        rmw: bool,
        lhs: String,
        rhs: String,
    },
    Call {
        name: String,
        ty: ValueType,
        args: Vec<String>,
    },
    PutArg { src: String, reg: u8 },
    PutArgStk { src: String },
}

#[derive(Debug, Clone)]
pub(crate) enum Stmt {
    LocalDecl { ty: ValueType, name: String },
    Assign { dst: String, expr: Expr },
    Store { lcl: String, src: String },
    VoidCall { name: String, args: Vec<String> },
    JmpTrue {
        cond: String,
        then_blk: String,
        else_blk: String,
    },
    Goto { target: String },
    Ret { src: Option<String> },
    Throw,
}

#[derive(Debug, Clone)]
pub(crate) struct BlockAst {
    pub label: String,
    pub weight: Option<f64>,
    pub cold: bool,
    pub eh: bool,
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub(crate) struct ProcAst {
    pub name: String,
    pub params: Vec<(ValueType, String)>,
    pub blocks: Vec<BlockAst>,
}

fn binop_name(input: &str) -> IResult<&str, Oper> {
    alt((
        map(tag("add"), |_| Oper::Add),
        map(tag("sub"), |_| Oper::Sub),
        map(tag("mul"), |_| Oper::Mul),
        map(tag("and"), |_| Oper::And),
        map(tag("or"), |_| Oper::Or),
        map(tag("xor"), |_| Oper::Xor),
        map(tag("fadd"), |_| Oper::FAdd),
        map(tag("fsub"), |_| Oper::FSub),
        map(tag("fmul"), |_| Oper::FMul),
    ))(input)
}

fn expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(tag("lcl")), ws(lcl_name)), Expr::Lcl),
        map(
            preceded(ws(tag("iconst.ref")), ws(integer)),
            |bits| Expr::IConst {
                bits,
                ty: ValueType::Ref,
            },
        ),
        map(preceded(ws(tag("iconst")), ws(integer)), |bits| {
            Expr::IConst {
                bits,
                ty: ValueType::Int,
            }
        }),
        map(preceded(ws(tag("dconst")), ws(float)), |v| Expr::DConst {
            bits: v.to_bits(),
        }),
        map(
            tuple((
                ws(tag("putargstk")),
                ws(node_name),
            )),
            |(_, src)| Expr::PutArgStk { src },
        ),
        map(
            tuple((
                ws(tag("putarg")),
                ws(node_name),
                ws(char(',')),
                ws(phys_reg),
            )),
            |(_, src, _, reg)| Expr::PutArg { src, reg },
        ),
        map(
            tuple((
                ws(tag("call")),
                opt(preceded(char('.'), value_type)),
                ws(proc_name),
                delimited(
                    ws(char('(')),
                    separated_list0(ws(char(',')), ws(node_name)),
                    ws(char(')')),
                ),
            )),
            |(_, ty, name, args)| Expr::Call {
                name,
                ty: ty.unwrap_or(ValueType::Int),
                args,
            },
        ),
        map(
            tuple((
                ws(binop_name),
                opt(tag(".rmw")),
                ws(node_name),
                ws(char(',')),
                ws(node_name),
            )),
            |(op, rmw, lhs, _, rhs)| Expr::BinOp {
                op,
                rmw: rmw.is_some(),
                lhs,
                rhs,
            },
        ),
    ))(input)
}

fn stmt(input: &str) -> IResult<&str, Stmt> {
    alt((
        map(
            tuple((ws(tag("local")), ws(value_type), ws(lcl_name))),
            |(_, ty, name)| Stmt::LocalDecl { ty, name },
        ),
        map(
            tuple((
                ws(tag("store")),
                ws(lcl_name),
                ws(char(',')),
                ws(node_name),
            )),
            |(_, lcl, _, src)| Stmt::Store { lcl, src },
        ),
        map(
            tuple((
                ws(tag("jmptrue")),
                ws(node_name),
                ws(char(',')),
                ws(block_name),
                ws(char(',')),
                ws(block_name),
            )),
            |(_, cond, _, then_blk, _, else_blk)| Stmt::JmpTrue {
                cond,
                then_blk,
                else_blk,
            },
        ),
        map(preceded(ws(tag("goto")), ws(block_name)), |target| {
            Stmt::Goto { target }
        }),
        map(
            preceded(ws(tag("ret")), opt(ws(node_name))),
            |src| Stmt::Ret { src },
        ),
        map(ws(tag("throw")), |_| Stmt::Throw),
        map(
            tuple((
                ws(tag("call")),
                ws(proc_name),
                delimited(
                    ws(char('(')),
                    separated_list0(ws(char(',')), ws(node_name)),
                    ws(char(')')),
                ),
            )),
            |(_, name, args)| Stmt::VoidCall { name, args },
        ),
        map(
            separated_pair(ws(node_name), ws(char('=')), ws(expr)),
            |(dst, expr)| Stmt::Assign { dst, expr },
        ),
    ))(input)
}

fn block_annotations(input: &str) -> IResult<&str, (Option<f64>, bool, bool)> {
    #[derive(Clone, Copy)]
    enum Ann {
        Weight(f64),
        Cold,
        Eh,
    }
    let ann = alt((
        map(preceded(ws(tag("weight")), ws(float)), Ann::Weight),
        map(ws(tag("cold")), |_| Ann::Cold),
        map(ws(tag("eh")), |_| Ann::Eh),
    ));
    let (input, anns) = opt(delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), ann),
        ws(char(')')),
    ))(input)?;
    let mut weight = None;
    let mut cold = false;
    let mut eh = false;
    for a in anns.unwrap_or_default() {
        match a {
            Ann::Weight(w) => weight = Some(w),
            Ann::Cold => cold = true,
            Ann::Eh => eh = true,
        }
    }
    Ok((input, (weight, cold, eh)))
}

fn block(input: &str) -> IResult<&str, BlockAst> {
    let (input, label) = ws(block_name)(input)?;
    let (input, (weight, cold, eh)) = block_annotations(input)?;
    let (input, _) = ws(char(':'))(input)?;
    let (input, stmts) = many0(stmt)(input)?;
    Ok((
        input,
        BlockAst {
            label,
            weight,
            cold,
            eh,
            stmts,
        },
    ))
}

fn param(input: &str) -> IResult<&str, (ValueType, String)> {
    tuple((ws(value_type), ws(lcl_name)))(input)
}

pub(crate) fn parse_proc_ast(input: &str) -> IResult<&str, ProcAst> {
    let (input, _) = ws(tag("proc"))(input)?;
    let (input, name) = ws(proc_name)(input)?;
    let (input, params) = delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), param),
        ws(char(')')),
    )(input)?;
    let (input, _) = ws(char('{'))(input)?;
    let (input, blocks) = many0(block)(input)?;
    let (input, _) = ws(char('}'))(input)?;
    Ok((
        input,
        ProcAst {
            name,
            params,
            blocks,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_binop_rmw() {
        let (_, e) = expr(" add.rmw v0, v1").unwrap();
        assert!(matches!(e, Expr::BinOp { rmw: true, .. }));
        let (_, e) = expr(" fadd v2, v3").unwrap();
        assert!(matches!(
            e,
            Expr::BinOp {
                op: Oper::FAdd,
                rmw: false,
                ..
            }
        ));
    }

    #[test]
    fn test_stmt_store() {
        let (_, s) = stmt("\n    store $x, v3").unwrap();
        assert!(matches!(s, Stmt::Store { .. }));
    }

    #[test]
    fn test_block_annotations() {
        let (_, b) = block("block0(weight 4, eh):\n    ret").unwrap();
        assert_eq!(b.weight, Some(4.0));
        assert!(b.eh);
        assert!(!b.cold);
        assert_eq!(b.stmts.len(), 1);
    }

    #[test]
    fn test_proc_header() {
        let (_, ast) = parse_proc_ast("proc %f(i32 $a, f64 $b) {\nblock0:\n ret\n}").unwrap();
        assert_eq!(ast.name, "f");
        assert_eq!(ast.params.len(), 2);
        assert_eq!(ast.blocks.len(), 1);
    }
}
