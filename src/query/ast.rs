//! Abstract syntax tree produced by the filter parser.
//!
//! The tree mirrors the input nesting exactly; no narrowing or merging
//! happens here. [`crate::query::compiler`] lowers it into the IR.

use std::fmt;

use serde::Serialize;

use crate::query::slice::RangeValue;
use crate::query::sort::SortPredicate;

/// Parsed query: an optional selection, an optional filter and an optional
/// ordering.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryAst {
    /// Fields to project from accepted records.
    pub select: Selection,
    /// Filter expression; `None` selects every entity.
    pub filter: Option<Operand>,
    /// `order by` terms in declaration order; empty orders by id.
    pub order_by: Vec<SortPredicate>,
}

/// Projection requested by a `select` prefix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Selection {
    /// `select *` or no select prefix at all.
    All,
    /// Explicit field list, possibly with dotted paths.
    Fields(Vec<String>),
}

impl Default for Selection {
    fn default() -> Self {
        Selection::All
    }
}

/// Comparison operator of a range predicate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CompareOp {
    /// `=` or `eq`.
    Eq,
    /// `<` or `lt`.
    Lt,
    /// `<=` or `lte`.
    Lte,
    /// `>` or `gt`.
    Gt,
    /// `>=` or `gte`.
    Gte,
}

impl CompareOp {
    /// Symbolic spelling used when printing.
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
        }
    }
}

/// Leaf predicate.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// `prop OP value`.
    Compare {
        /// Property name.
        property: String,
        /// Operator.
        op: CompareOp,
        /// Literal operand.
        value: RangeValue,
    },
    /// `prop contains 'text'`.
    Contains {
        /// Property name before keyword rewriting.
        property: String,
        /// Text as written, case preserved.
        text: String,
    },
    /// `prop within d of lat, lon`.
    Within {
        /// Geo-indexed property.
        property: String,
        /// Radius in metres.
        distance: f64,
        /// Latitude of the centre.
        lat: f64,
        /// Longitude of the centre.
        lon: f64,
    },
}

/// Boolean expression over predicates.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// Both sides hold.
    And(Box<Operand>, Box<Operand>),
    /// Either side holds.
    Or(Box<Operand>, Box<Operand>),
    /// Negation.
    Not(Box<Operand>),
    /// Leaf predicate.
    Predicate(Predicate),
}

impl Operand {
    /// Conjunction of two operands.
    pub fn and(left: Operand, right: Operand) -> Self {
        Operand::And(Box::new(left), Box::new(right))
    }

    /// Disjunction of two operands.
    pub fn or(left: Operand, right: Operand) -> Self {
        Operand::Or(Box::new(left), Box::new(right))
    }

    /// Negation of `child`.
    pub fn not(child: Operand) -> Self {
        Operand::Not(Box::new(child))
    }

    /// Whether this operand is a range predicate (comparison or contains).
    pub fn is_range_leaf(&self) -> bool {
        matches!(
            self,
            Operand::Predicate(Predicate::Compare { .. } | Predicate::Contains { .. })
        )
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare {
                property,
                op,
                value,
            } => write!(f, "{property} {} {value}", op.symbol()),
            Predicate::Contains { property, text } => write!(f, "{property} contains {text:?}"),
            Predicate::Within {
                property,
                distance,
                lat,
                lon,
            } => write!(f, "{property} within {distance} of {lat}, {lon}"),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::And(l, r) => write!(f, "(and {l} {r})"),
            Operand::Or(l, r) => write!(f, "(or {l} {r})"),
            Operand::Not(c) => write!(f, "(not {c})"),
            Operand::Predicate(p) => write!(f, "({p})"),
        }
    }
}

impl fmt::Display for QueryAst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.select {
            Selection::All => f.write_str("select *")?,
            Selection::Fields(fields) => write!(f, "select {}", fields.join(", "))?,
        }
        if let Some(filter) = &self.filter {
            write!(f, " where {filter}")?;
        }
        for (idx, term) in self.order_by.iter().enumerate() {
            f.write_str(if idx == 0 { " order by " } else { ", " })?;
            write!(f, "{term}")?;
        }
        Ok(())
    }
}
