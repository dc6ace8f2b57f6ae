//! Line-oriented allocation traces.
//!
//! Each non-blank line is one request:
//!
//! ```text
//! a <id> <size>
//! f <id>
//! ```
//!
//! Fields are separated by whitespace.
//!
//! ```
//! use coalescing_arena::{trace, Allocator, Op};
//!
//! let text = "a 1 4096\na 2 100\nf 1\n";
//! let ops = trace::parse_trace(text).collect::<Result<Vec<_>, _>>()?;
//! assert_eq!(ops[2], Op::Free { id: 1 });
//!
//! let mut allocator = Allocator::new();
//! allocator.replay(ops);
//! assert_eq!(allocator.used_memory(), 100);
//!
//! // Or parse and replay in one step.
//! let mut allocator = Allocator::new();
//! allocator.replay_trace(text)?;
//! assert_eq!(allocator.used_memory(), 100);
//! # Ok::<(), coalescing_arena::Error>(())
//! ```

use core::fmt;

use crate::Op;

/// Why a trace line was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceErrorKind {
    /// The first field is neither `a` nor `f`.
    UnknownOperation,
    /// The line ends before all of the operation's fields.
    MissingField,
    /// A field is not an unsigned integer.
    InvalidNumber,
    /// The line has more fields than its operation takes.
    TrailingField,
}

impl fmt::Display for TraceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraceErrorKind::UnknownOperation => "unknown operation",
            TraceErrorKind::MissingField => "missing field",
            TraceErrorKind::InvalidNumber => "invalid number",
            TraceErrorKind::TrailingField => "unexpected trailing field",
        })
    }
}

/// A trace line that could not be parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceError {
    /// The 1-based line number.
    pub line: usize,
    /// What was wrong with it.
    pub kind: TraceErrorKind,
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.kind)
    }
}

impl core::error::Error for TraceError {}

/// Parse a single trace line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Op>, TraceErrorKind> {
    let mut fields = line.split_whitespace();
    let Some(op) = fields.next() else {
        return Ok(None);
    };

    let mut number = || -> Result<u64, TraceErrorKind> {
        fields
            .next()
            .ok_or(TraceErrorKind::MissingField)?
            .parse()
            .map_err(|_| TraceErrorKind::InvalidNumber)
    };

    let op = match op {
        "a" => {
            let id = number()?;
            let size = number()?;
            Op::Allocate { id, size }
        }
        "f" => Op::Free { id: number()? },
        _ => return Err(TraceErrorKind::UnknownOperation),
    };

    if fields.next().is_some() {
        return Err(TraceErrorKind::TrailingField);
    }
    Ok(Some(op))
}

/// Parse every line of `text`, skipping blank lines.
pub fn parse_trace(text: &str) -> impl Iterator<Item = Result<Op, TraceError>> + '_ {
    text.lines().enumerate().filter_map(|(i, line)| {
        parse_line(line)
            .map_err(|kind| TraceError { line: i + 1, kind })
            .transpose()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn parses_both_operations() {
        assert_eq!(
            parse_line("a 12 4096"),
            Ok(Some(Op::Allocate { id: 12, size: 4096 }))
        );
        assert_eq!(parse_line("f 12"), Ok(Some(Op::Free { id: 12 })));
        assert_eq!(parse_line("  a\t1   0 "), Ok(Some(Op::Allocate { id: 1, size: 0 })));
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_line(""), Ok(None));
        assert_eq!(parse_line("   \t"), Ok(None));

        let ops: Vec<_> = parse_trace("\na 1 8\n\nf 1\n").collect();
        assert_eq!(
            ops,
            [
                Ok(Op::Allocate { id: 1, size: 8 }),
                Ok(Op::Free { id: 1 })
            ]
        );
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(parse_line("x 1"), Err(TraceErrorKind::UnknownOperation));
        assert_eq!(parse_line("a 1"), Err(TraceErrorKind::MissingField));
        assert_eq!(parse_line("f"), Err(TraceErrorKind::MissingField));
        assert_eq!(parse_line("a one 2"), Err(TraceErrorKind::InvalidNumber));
        assert_eq!(parse_line("f -3"), Err(TraceErrorKind::InvalidNumber));
        assert_eq!(parse_line("f 1 2"), Err(TraceErrorKind::TrailingField));
    }

    #[test]
    fn errors_carry_line_numbers() {
        let results: Vec<_> = parse_trace("a 1 8\n\nf\n").collect();
        assert_eq!(
            results[1],
            Err(TraceError {
                line: 3,
                kind: TraceErrorKind::MissingField
            })
        );
    }
}
