#![forbid(unsafe_code)]

//! Query language, planning and execution.
//!
//! Text is tokenized and parsed into an [`ast::QueryAst`], lowered by the
//! [`compiler`] into an [`ir::IrNode`] tree, and executed by the
//! [`executor`] as a tree of merging id streams.

/// Abstract syntax tree produced by the parser.
pub mod ast;

/// Lowers the AST into the range-scan IR.
///
/// Compatible range predicates under `and` collapse into a single slice node.
pub mod compiler;

/// Scan order and resumable page cursors.
pub mod cursor;

/// Parse and compile errors.
pub mod errors;

/// Set-algebra id streams and the paging executor.
pub mod executor;

/// Intermediate representation plus explain output and plan hashing.
pub mod ir;

/// Tokenizer.
pub mod lexer;

/// Recursive-descent parser.
pub mod parser;

/// Property ranges and slice groups.
pub mod slice;

/// `order by` terms and sorted row positions.
pub mod sort;

pub use compiler::{Compiler, IndexMetadata, QueryPlan};
pub use cursor::{Cursor, ScanOrder};
pub use errors::{CompileError, ErrorWithCode, ParseError};
pub use executor::{Executor, Page, PageRequest};
pub use ir::{ExplainNode, IrNode};
pub use parser::{parse, parse_filter};
pub use slice::{QuerySlice, RangeBound, RangeValue, SliceNode};
pub use sort::{RowPosition, SortKey, SortPredicate};
