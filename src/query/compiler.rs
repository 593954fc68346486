//! Lowers the filter AST into the IR.
//!
//! Direct AND-siblings that produce range slices fold into one
//! [`SliceNode`]. A leaf conjunct joins the slice node of its left sibling;
//! when the right operand is itself a folded group, that group goes first
//! and the left sibling's slices are folded in after it, so
//! `a = 1 and b = 2 and c = 3` iterates `b, c, a`.

use std::collections::HashSet;

use tracing::trace;

use crate::query::ast::{CompareOp, Operand, Predicate, QueryAst, Selection};
use crate::query::errors::CompileError;
use crate::query::ir::{plan_hash, ExplainNode, IrNode};
use crate::query::slice::{
    QuerySlice, RangeBound, RangeValue, SliceNode, KEYWORDS_SUFFIX, MAX_SENTINEL,
};
use crate::query::sort::SortPredicate;

/// Wildcard marker at the end of a string literal.
const WILDCARD: char = '*';

/// Index catalog consulted while compiling.
pub trait IndexMetadata {
    /// Whether `property` has a range index.
    fn is_indexed(&self, property: &str) -> bool;
    /// Whether `property` has a full-text keyword index.
    fn is_full_text(&self, property: &str) -> bool;
}

/// Catalog that reports every property as indexed.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllIndexed;

impl IndexMetadata for AllIndexed {
    fn is_indexed(&self, _property: &str) -> bool {
        true
    }

    fn is_full_text(&self, _property: &str) -> bool {
        true
    }
}

/// Explicit catalog for tests and embedded use.
#[derive(Clone, Debug, Default)]
pub struct InMemoryIndexMetadata {
    indexed: HashSet<String>,
    full_text: HashSet<String>,
}

impl InMemoryIndexMetadata {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a range-indexed property.
    pub fn with_indexed(mut self, property: impl Into<String>) -> Self {
        self.indexed.insert(property.into());
        self
    }

    /// Adds a full-text indexed property.
    pub fn with_full_text(mut self, property: impl Into<String>) -> Self {
        self.full_text.insert(property.into());
        self
    }
}

impl IndexMetadata for InMemoryIndexMetadata {
    fn is_indexed(&self, property: &str) -> bool {
        self.indexed.contains(property)
    }

    fn is_full_text(&self, property: &str) -> bool {
        self.full_text.contains(property)
    }
}

/// Compiled query ready for execution.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    /// Root of the IR; the full id scan when the query has no filter.
    pub root: IrNode,
    /// Fields to project from accepted records.
    pub projection: Selection,
    /// `order by` terms; empty when results follow id order.
    pub sort: Vec<SortPredicate>,
    /// Explain tree for `root`, under a `Sort` node when `sort` is set.
    pub explain: ExplainNode,
    /// Deterministic hash binding cursors to this plan.
    pub plan_hash: u64,
}

/// AST to IR compiler.
pub struct Compiler<'m> {
    metadata: &'m dyn IndexMetadata,
}

impl Default for Compiler<'static> {
    fn default() -> Self {
        Self {
            metadata: &AllIndexed,
        }
    }
}

/// Compiles a filter expression against a catalog that indexes everything.
pub fn compile(operand: &Operand) -> Result<IrNode, CompileError> {
    Compiler::default().compile(operand)
}

impl<'m> Compiler<'m> {
    /// Creates a compiler consulting `metadata`.
    pub fn new(metadata: &'m dyn IndexMetadata) -> Self {
        Self { metadata }
    }

    /// Compiles a parsed query into a plan.
    pub fn plan(&self, ast: &QueryAst) -> Result<QueryPlan, CompileError> {
        let root = match &ast.filter {
            Some(filter) => self.compile(filter)?,
            None => IrNode::Slice(SliceNode::full_scan()),
        };
        for term in &ast.order_by {
            if !self.metadata.is_indexed(&term.property) {
                return Err(CompileError::NoIndex {
                    property: term.property.clone(),
                });
            }
        }
        let explain = if ast.order_by.is_empty() {
            root.explain()
        } else {
            ExplainNode::sorted(&ast.order_by, root.explain())
        };
        let plan_hash = plan_hash(&root, &ast.order_by, &ast.select);
        trace!(plan_hash, sort_terms = ast.order_by.len(), "compiled query plan");
        Ok(QueryPlan {
            root,
            projection: ast.select.clone(),
            sort: ast.order_by.clone(),
            explain,
            plan_hash,
        })
    }

    /// Compiles a filter expression.
    pub fn compile(&self, operand: &Operand) -> Result<IrNode, CompileError> {
        self.lower(operand, false)
    }

    fn lower(&self, operand: &Operand, negated: bool) -> Result<IrNode, CompileError> {
        match operand {
            Operand::Predicate(predicate) => self.lower_predicate(predicate, negated),
            Operand::Not(child) => Ok(IrNode::not(self.lower(child, true)?)),
            Operand::Or(l, r) => Ok(IrNode::or(self.lower(l, negated)?, self.lower(r, negated)?)),
            Operand::And(l, r) => {
                let left = self.lower(l, negated)?;
                let right = self.lower(r, negated)?;
                Ok(merge_and(left, right, r.is_range_leaf()))
            }
        }
    }

    fn lower_predicate(
        &self,
        predicate: &Predicate,
        negated: bool,
    ) -> Result<IrNode, CompileError> {
        let slice = match predicate {
            Predicate::Compare {
                property,
                op,
                value,
            } => {
                if !self.metadata.is_indexed(property) {
                    return Err(CompileError::NoIndex {
                        property: property.clone(),
                    });
                }
                compare_slice(property, *op, value)
            }
            Predicate::Contains { property, text } => {
                if !self.metadata.is_full_text(property) {
                    return Err(CompileError::NoFullTextIndex {
                        property: property.clone(),
                    });
                }
                let keywords = format!("{property}{KEYWORDS_SUFFIX}");
                match prefix_range(&keywords, &text.to_lowercase()) {
                    Some(slice) => slice,
                    None => QuerySlice::exact(keywords, RangeValue::Str(text.to_lowercase())),
                }
            }
            Predicate::Within {
                property,
                distance,
                lat,
                lon,
            } => {
                if negated {
                    return Err(CompileError::NegatedWithin {
                        property: property.clone(),
                    });
                }
                if !self.metadata.is_indexed(property) {
                    return Err(CompileError::NoIndex {
                        property: property.clone(),
                    });
                }
                validate_geo(property, *distance, *lat, *lon)?;
                return Ok(IrNode::Within {
                    property: property.clone(),
                    distance: *distance,
                    lat: *lat,
                    lon: *lon,
                });
            }
        };
        Ok(IrNode::Slice(SliceNode::single(slice)))
    }
}

fn merge_and(left: IrNode, right: IrNode, right_is_leaf: bool) -> IrNode {
    match (left, right) {
        (IrNode::Slice(mut group), IrNode::Slice(leaf)) if right_is_leaf => {
            if !group.can_absorb(&leaf) {
                return IrNode::and(IrNode::Slice(group), IrNode::Slice(leaf));
            }
            for slice in leaf.slices().iter().cloned() {
                group.push(slice);
            }
            IrNode::Slice(group)
        }
        (IrNode::Slice(earlier), IrNode::Slice(mut group)) => {
            if !group.can_absorb(&earlier) {
                return IrNode::and(IrNode::Slice(earlier), IrNode::Slice(group));
            }
            group.absorb_earlier(earlier);
            IrNode::Slice(group)
        }
        (left, right) => IrNode::and(left, right),
    }
}

fn compare_slice(property: &str, op: CompareOp, value: &RangeValue) -> QuerySlice {
    let slice = QuerySlice::new(property);
    match op {
        CompareOp::Eq => {
            if let RangeValue::Str(text) = value {
                if let Some(prefix) = prefix_range(property, text) {
                    return prefix;
                }
            }
            QuerySlice::exact(property, value.clone())
        }
        CompareOp::Lt => slice.with_finish(RangeBound::exclusive(value.clone())),
        CompareOp::Lte => slice.with_finish(RangeBound::inclusive(value.clone())),
        CompareOp::Gt => slice.with_start(RangeBound::exclusive(value.clone())),
        CompareOp::Gte => slice.with_start(RangeBound::inclusive(value.clone())),
    }
}

/// `[text, text + MAX_SENTINEL]` for a literal ending in the wildcard.
fn prefix_range(property: &str, text: &str) -> Option<QuerySlice> {
    let prefix = text.strip_suffix(WILDCARD)?;
    let mut upper = prefix.to_owned();
    upper.push(MAX_SENTINEL);
    Some(
        QuerySlice::new(property)
            .with_start(RangeBound::inclusive(RangeValue::Str(prefix.to_owned())))
            .with_finish(RangeBound::inclusive(RangeValue::Str(upper))),
    )
}

fn validate_geo(property: &str, distance: f64, lat: f64, lon: f64) -> Result<(), CompileError> {
    let reason = if !distance.is_finite() || distance < 0.0 {
        "distance must be finite and non-negative"
    } else if !(-90.0..=90.0).contains(&lat) {
        "latitude must be within [-90, 90]"
    } else if !(-180.0..=180.0).contains(&lon) {
        "longitude must be within [-180, 180]"
    } else {
        return Ok(());
    };
    Err(CompileError::InvalidGeo {
        property: property.to_owned(),
        reason,
    })
}
