//! Unified-diff parsing and generation (spec §4.1, §4.2).
//!
//! [`parser`] turns a byte stream into a [`parser::ParsedDiff`]; [`writer`]
//! goes the other way, turning two byte sequences into unified-diff bytes.
//! The two are designed to round-trip: `parse(write(a, b))` reapplied to
//! `a` yields `b` (spec §8 property 4).

mod parser;
mod writer;

pub use parser::{parse, FileSection, Hunk, HunkLine, ParseError, ParsedDiff};
pub use writer::{write_unified_diff, DiffSide};
