//! Primitive parsers for names, types, and literals.

use alloc::string::{String, ToString};

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::char,
    combinator::{map, map_res, opt, recognize},
    number::complete::double,
    sequence::{pair, preceded},
    IResult,
};

use crate::types::ValueType;

/// Skip spaces, tabs, newlines, and `//` comments.
pub(crate) fn skip_ws(input: &str) -> IResult<&str, ()> {
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start();
        if let Some(after) = trimmed.strip_prefix("//") {
            rest = match after.find('\n') {
                Some(pos) => &after[pos + 1..],
                None => "",
            };
        } else if trimmed.len() != rest.len() {
            rest = trimmed;
        } else {
            return Ok((rest, ()));
        }
    }
}

/// Run `inner` after skipping leading whitespace.
pub(crate) fn ws<'a, O>(
    mut inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    move |input| {
        let (input, ()) = skip_ws(input)?;
        inner(input)
    }
}

/// Parse a signed integer literal.
pub(crate) fn integer(input: &str) -> IResult<&str, i64> {
    map_res(
        recognize(pair(
            opt(char('-')),
            take_while1(|c: char| c.is_ascii_digit()),
        )),
        |s: &str| s.parse::<i64>(),
    )(input)
}

/// Parse a float literal.
pub(crate) fn float(input: &str) -> IResult<&str, f64> {
    double(input)
}

/// Parse a value type.
pub(crate) fn value_type(input: &str) -> IResult<&str, ValueType> {
    alt((
        map(tag("i32"), |_| ValueType::Int),
        map(tag("i64"), |_| ValueType::Long),
        map(tag("byref"), |_| ValueType::Byref),
        map(tag("ref"), |_| ValueType::Ref),
        map(tag("f32"), |_| ValueType::Float),
        map(tag("f64"), |_| ValueType::Double),
        map(tag("v128"), |_| ValueType::Simd16),
    ))(input)
}

fn ident_chars(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

/// Parse a procedure or callee name (`%name`).
pub(crate) fn proc_name(input: &str) -> IResult<&str, String> {
    map(preceded(char('%'), ident_chars), |s: &str| s.to_string())(input)
}

/// Parse a local name (`$name`).
pub(crate) fn lcl_name(input: &str) -> IResult<&str, String> {
    map(preceded(char('$'), ident_chars), |s: &str| s.to_string())(input)
}

/// Parse a node name (`v0`, `v1`, ...).
pub(crate) fn node_name(input: &str) -> IResult<&str, String> {
    map(
        recognize(preceded(
            char('v'),
            take_while1(|c: char| c.is_ascii_digit()),
        )),
        |s: &str| s.to_string(),
    )(input)
}

/// Parse a block label (`block0`, `block1`, ...).
pub(crate) fn block_name(input: &str) -> IResult<&str, String> {
    map(
        recognize(preceded(
            tag("block"),
            take_while1(|c: char| c.is_ascii_digit()),
        )),
        |s: &str| s.to_string(),
    )(input)
}

/// Parse a physical register (`r0` .. `r255`).
pub(crate) fn phys_reg(input: &str) -> IResult<&str, u8> {
    map_res(
        preceded(char('r'), take_while1(|c: char| c.is_ascii_digit())),
        |s: &str| s.parse::<u8>(),
    )(input)
}
