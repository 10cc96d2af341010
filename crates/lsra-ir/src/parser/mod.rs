//! Parser for the procedure text format used throughout the tests.
//!
//! ```text
//! proc %name(i32 $a, f64 $b) {
//! block0(weight 4):
//!     v0 = lcl $a
//!     v1 = iconst 5
//!     v2 = add.rmw v0, v1
//!     store $c, v2
//!     jmptrue v2, block1, block2
//! ...
//! }
//! ```

mod build;
mod error;
mod primitives;
mod stmt;

pub use error::ParseError;

use crate::proc::Procedure;
use build::build_proc;
use stmt::parse_proc_ast;

/// Parse a procedure from IR text.
pub fn parse_proc(input: &str) -> Result<Procedure, ParseError> {
    let trimmed = input.trim();
    match parse_proc_ast(trimmed) {
        Ok((remaining, ast)) => {
            if remaining.trim().is_empty() {
                build_proc(ast)
            } else {
                Err(error::parse_error(
                    trimmed,
                    remaining,
                    &alloc::format!("unexpected input remaining: {}", remaining),
                ))
            }
        }
        Err(e) => Err(error::parse_error(
            trimmed,
            trimmed,
            &alloc::format!("parse error: {:?}", e),
        )),
    }
}
