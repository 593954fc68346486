#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Errors raised while turning filter text into an AST.
///
/// Every variant carries the byte offset where the parser gave up so callers
/// can point at the offending token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Input ended while an operand or operator was still expected.
    #[error("unexpected end of input at byte {offset}, expected {expected}")]
    UnexpectedEnd { offset: usize, expected: &'static str },
    /// A token appeared where the grammar does not allow it.
    #[error("unexpected '{found}' at byte {offset}, expected {expected}")]
    UnexpectedToken {
        offset: usize,
        found: String,
        expected: &'static str,
    },
    /// A character that starts no token.
    #[error("unexpected character '{ch}' at byte {offset}")]
    UnexpectedChar { offset: usize, ch: char },
    /// A quoted string was never closed.
    #[error("unterminated string starting at byte {offset}")]
    UnterminatedString { offset: usize },
    /// A backslash escape other than `\'`, `\"` or `\\`.
    #[error("invalid escape '\\{ch}' at byte {offset}")]
    InvalidEscape { offset: usize, ch: char },
    /// Numeric literal failed to parse or overflowed.
    #[error("invalid number '{text}' at byte {offset}")]
    InvalidNumber { offset: usize, text: String },
    /// Input was empty or only whitespace.
    #[error("empty query")]
    Empty,
}

impl ParseError {
    /// Byte offset of the failure, if any.
    pub fn offset(&self) -> Option<usize> {
        match self {
            ParseError::UnexpectedEnd { offset, .. }
            | ParseError::UnexpectedToken { offset, .. }
            | ParseError::UnexpectedChar { offset, .. }
            | ParseError::UnterminatedString { offset }
            | ParseError::InvalidEscape { offset, .. }
            | ParseError::InvalidNumber { offset, .. } => Some(*offset),
            ParseError::Empty => None,
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::UnexpectedEnd { .. } => "UnexpectedEnd",
            ParseError::UnexpectedToken { .. } => "UnexpectedToken",
            ParseError::UnexpectedChar { .. } => "UnexpectedChar",
            ParseError::UnterminatedString { .. } => "UnterminatedString",
            ParseError::InvalidEscape { .. } => "InvalidEscape",
            ParseError::InvalidNumber { .. } => "InvalidNumber",
            ParseError::Empty => "Empty",
        }
    }
}

/// Errors raised while lowering an AST into the IR.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    /// Comparison on a property without a range index.
    #[error("property '{property}' is not indexed")]
    NoIndex { property: String },
    /// `contains` on a property without a full-text index.
    #[error("property '{property}' is not full-text indexed")]
    NoFullTextIndex { property: String },
    /// Geo parameters outside their valid domain.
    #[error("invalid geo predicate on '{property}': {reason}")]
    InvalidGeo {
        property: String,
        reason: &'static str,
    },
    /// A distance query cannot enumerate its complement.
    #[error("'within' on '{property}' cannot be negated")]
    NegatedWithin { property: String },
}

impl CompileError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::NoIndex { .. } => "NoIndex",
            CompileError::NoFullTextIndex { .. } => "NoFullTextIndex",
            CompileError::InvalidGeo { .. } => "InvalidGeo",
            CompileError::NegatedWithin { .. } => "NegatedWithin",
        }
    }
}

/// Formats a parse or compile error prefixed with its code.
pub struct ErrorWithCode<'a> {
    code: &'static str,
    message: &'a dyn fmt::Display,
}

impl<'a> ErrorWithCode<'a> {
    /// Wraps a parse error.
    pub fn parse(err: &'a ParseError) -> Self {
        Self {
            code: err.code(),
            message: err,
        }
    }

    /// Wraps a compile error.
    pub fn compile(err: &'a CompileError) -> Self {
        Self {
            code: err.code(),
            message: err,
        }
    }
}

impl fmt::Display for ErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
