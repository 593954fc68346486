#![forbid(unsafe_code)]

//! Range model shared by the compiler, the executor and the stores.
//!
//! A [`QuerySlice`] is one contiguous range scan over one indexed property; a
//! [`SliceNode`] is the conjunction of sibling slices, at most one per
//! property (keyword slices excepted, see [`SliceNode::can_absorb`]).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Largest code point; appended to a prefix to cover every key starting with it.
pub const MAX_SENTINEL: char = char::MAX;

/// Property under which the entity id itself is range-indexed.
pub const ID_PROPERTY: &str = "uuid";

/// Suffix of the multi-valued property holding lower-cased tokens.
pub const KEYWORDS_SUFFIX: &str = ".keywords";

/// Literal value a bound is compared against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeValue {
    /// `true` or `false`.
    Bool(bool),
    /// Signed integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// String literal, ordered by code point.
    Str(String),
}

impl RangeValue {
    /// Orders two values. Numbers compare numerically across int/float;
    /// booleans and strings only compare with their own kind.
    pub fn compare(&self, other: &RangeValue) -> Option<Ordering> {
        match (self, other) {
            (RangeValue::Bool(a), RangeValue::Bool(b)) => Some(a.cmp(b)),
            (RangeValue::Int(a), RangeValue::Int(b)) => Some(a.cmp(b)),
            (RangeValue::Int(a), RangeValue::Float(b)) => (*a as f64).partial_cmp(b),
            (RangeValue::Float(a), RangeValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (RangeValue::Float(a), RangeValue::Float(b)) => a.partial_cmp(b),
            (RangeValue::Str(a), RangeValue::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Maps a JSON scalar onto a range value; objects, arrays and nulls are
    /// not range-indexed.
    pub fn from_json(value: &serde_json::Value) -> Option<RangeValue> {
        match value {
            serde_json::Value::Bool(b) => Some(RangeValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(RangeValue::Int(i)),
                None => n.as_f64().map(RangeValue::Float),
            },
            serde_json::Value::String(s) => Some(RangeValue::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RangeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeValue::Bool(v) => write!(f, "{v}"),
            RangeValue::Int(v) => write!(f, "{v}"),
            RangeValue::Float(v) => write!(f, "{v:?}"),
            RangeValue::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// One side of a range. `None` in a slice means unbounded.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeBound {
    /// Value at the edge of the range.
    pub value: RangeValue,
    /// Whether `value` itself is in range.
    pub inclusive: bool,
}

impl RangeBound {
    /// Inclusive bound at `value`.
    pub fn inclusive(value: RangeValue) -> Self {
        Self {
            value,
            inclusive: true,
        }
    }

    /// Exclusive bound at `value`.
    pub fn exclusive(value: RangeValue) -> Self {
        Self {
            value,
            inclusive: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Start,
    Finish,
}

/// Keeps the tighter of two bounds on the same side. Equal values prefer
/// the exclusive bound; incomparable values keep `later`.
fn tighter(
    earlier: Option<RangeBound>,
    later: Option<RangeBound>,
    side: Side,
) -> Option<RangeBound> {
    match (earlier, later) {
        (None, b) | (b, None) => b,
        (Some(e), Some(l)) => match e.value.compare(&l.value) {
            Some(Ordering::Equal) => Some(RangeBound {
                value: l.value,
                inclusive: e.inclusive && l.inclusive,
            }),
            Some(Ordering::Greater) if side == Side::Start => Some(e),
            Some(Ordering::Less) if side == Side::Finish => Some(e),
            Some(_) | None => Some(l),
        },
    }
}

/// One contiguous range scan over one indexed property.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySlice {
    /// Indexed property the range applies to.
    pub property: String,
    /// Lower bound, `None` for unbounded.
    pub start: Option<RangeBound>,
    /// Upper bound, `None` for unbounded.
    pub finish: Option<RangeBound>,
    /// Scan in descending id order.
    pub reversed: bool,
}

impl QuerySlice {
    /// Unbounded slice over `property`.
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            start: None,
            finish: None,
            reversed: false,
        }
    }

    /// Sets the lower bound.
    pub fn with_start(mut self, bound: RangeBound) -> Self {
        self.start = Some(bound);
        self
    }

    /// Sets the upper bound.
    pub fn with_finish(mut self, bound: RangeBound) -> Self {
        self.finish = Some(bound);
        self
    }

    /// Both bounds inclusive at `value`.
    pub fn exact(property: impl Into<String>, value: RangeValue) -> Self {
        Self::new(property)
            .with_start(RangeBound::inclusive(value.clone()))
            .with_finish(RangeBound::inclusive(value))
    }

    /// Whether this slice scans the multi-valued keywords property.
    pub fn is_keywords(&self) -> bool {
        self.property.ends_with(KEYWORDS_SUFFIX)
    }

    /// Whether neither side is bounded.
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.finish.is_none()
    }

    /// Whether `value` falls inside the range. Values that do not compare
    /// with a bound are outside it.
    pub fn matches(&self, value: &RangeValue) -> bool {
        if let Some(start) = &self.start {
            match value.compare(&start.value) {
                Some(Ordering::Greater) => {}
                Some(Ordering::Equal) if start.inclusive => {}
                _ => return false,
            }
        }
        if let Some(finish) = &self.finish {
            match value.compare(&finish.value) {
                Some(Ordering::Less) => {}
                Some(Ordering::Equal) if finish.inclusive => {}
                _ => return false,
            }
        }
        true
    }

    /// Whether no value can satisfy both bounds.
    pub fn is_empty_range(&self) -> bool {
        match (&self.start, &self.finish) {
            (Some(s), Some(f)) => match s.value.compare(&f.value) {
                Some(Ordering::Greater) | None => true,
                Some(Ordering::Equal) => !(s.inclusive && f.inclusive),
                Some(Ordering::Less) => false,
            },
            _ => false,
        }
    }

    /// Narrows `self` (the earlier declaration) by `later` on the same property.
    pub fn narrow(&mut self, later: QuerySlice) {
        self.start = tighter(self.start.take(), later.start, Side::Start);
        self.finish = tighter(self.finish.take(), later.finish, Side::Finish);
        self.reversed |= later.reversed;
    }
}

impl fmt::Display for QuerySlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.property)?;
        match &self.start {
            Some(b) if b.inclusive => write!(f, "[{}", b.value)?,
            Some(b) => write!(f, "({}", b.value)?,
            None => write!(f, "(-inf")?,
        }
        f.write_str(", ")?;
        match &self.finish {
            Some(b) if b.inclusive => write!(f, "{}]", b.value)?,
            Some(b) => write!(f, "{})", b.value)?,
            None => write!(f, "+inf)")?,
        }
        if self.reversed {
            f.write_str(" desc")?;
        }
        Ok(())
    }
}

/// Sibling slices that must all hold, at most one per property.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SliceNode {
    slices: SmallVec<[QuerySlice; 4]>,
}

impl SliceNode {
    /// Node holding a single slice.
    pub fn single(slice: QuerySlice) -> Self {
        let mut slices = SmallVec::new();
        slices.push(slice);
        Self { slices }
    }

    /// One unbounded slice over the entity id.
    pub fn full_scan() -> Self {
        Self::single(QuerySlice::new(ID_PROPERTY))
    }

    /// Slices in iteration order.
    pub fn slices(&self) -> &[QuerySlice] {
        &self.slices
    }

    /// Number of slices.
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Whether the node holds no slices.
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Slice for `property`, if any.
    pub fn get(&self, property: &str) -> Option<&QuerySlice> {
        self.slices.iter().find(|s| s.property == property)
    }

    /// Whether `other` can be folded into this node. Keyword slices are
    /// multi-valued, so two of them on one property are separate scans.
    pub fn can_absorb(&self, other: &SliceNode) -> bool {
        other.slices.iter().all(|incoming| {
            !incoming.is_keywords() || self.get(&incoming.property).is_none()
        })
    }

    /// Adds a later declaration: narrows the slice on the same property or
    /// appends a new one.
    pub fn push(&mut self, slice: QuerySlice) {
        match self.slices.iter_mut().find(|s| s.property == slice.property) {
            Some(existing) => existing.narrow(slice),
            None => self.slices.push(slice),
        }
    }

    /// Folds in slices declared before this node's own; existing slices
    /// keep their position and win incomparable ties.
    pub fn absorb_earlier(&mut self, earlier: SliceNode) {
        for slice in earlier.slices {
            match self.slices.iter().position(|s| s.property == slice.property) {
                Some(idx) => {
                    let later = std::mem::replace(&mut self.slices[idx], slice);
                    self.slices[idx].narrow(later);
                }
                None => self.slices.push(slice),
            }
        }
    }

    /// Whether this node is the unbounded id scan.
    pub fn is_full_scan(&self) -> bool {
        self.slices.len() == 1
            && self.slices[0].property == ID_PROPERTY
            && self.slices[0].is_unbounded()
    }

    /// Marks every slice for descending scans.
    pub fn set_reversed(&mut self, reversed: bool) {
        for slice in self.slices.iter_mut() {
            slice.reversed = reversed;
        }
    }
}

impl fmt::Display for SliceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, slice) in self.slices.iter().enumerate() {
            if idx > 0 {
                f.write_str(" & ")?;
            }
            write!(f, "{slice}")?;
        }
        Ok(())
    }
}
