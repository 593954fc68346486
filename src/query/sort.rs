//! `order by` support: sort predicates, a total order over sort keys and the
//! row positions that resume a sorted scan.
//!
//! Rows order by their sort key, then id, then indexed version. Missing
//! values sort after present ones in either direction. A descending page
//! request reverses the whole row order.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::cursor::ScanOrder;
use crate::query::slice::RangeValue;
use crate::types::{EntityId, Version};

/// One `prop [asc|desc]` term of an `order by` clause.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SortPredicate {
    /// Property sorted on; dotted paths reach nested fields.
    pub property: String,
    /// Direction of this term.
    pub order: ScanOrder,
}

impl SortPredicate {
    /// Ascending term on `property`.
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            order: ScanOrder::Ascending,
        }
    }

    /// Descending term on `property`.
    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            order: ScanOrder::Descending,
        }
    }
}

impl fmt::Display for SortPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.order.is_descending() { "desc" } else { "asc" };
        write!(f, "{} {dir}", self.property)
    }
}

/// Values of a row's sort properties, one slot per predicate.
pub type SortKey = Vec<Option<RangeValue>>;

fn kind_rank(value: &RangeValue) -> u8 {
    match value {
        RangeValue::Bool(_) => 0,
        RangeValue::Int(_) | RangeValue::Float(_) => 1,
        RangeValue::Str(_) => 2,
    }
}

/// Total order over present values: booleans, then numbers, then strings.
fn compare_present(a: &RangeValue, b: &RangeValue) -> Ordering {
    kind_rank(a)
        .cmp(&kind_rank(b))
        .then_with(|| a.compare(b).unwrap_or(Ordering::Equal))
}

/// Compares two sort keys term by term under `sort`.
pub fn compare_keys(
    sort: &[SortPredicate],
    a: &[Option<RangeValue>],
    b: &[Option<RangeValue>],
) -> Ordering {
    for (idx, predicate) in sort.iter().enumerate() {
        let left = a.get(idx).and_then(Option::as_ref);
        let right = b.get(idx).and_then(Option::as_ref);
        let ord = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(l), Some(r)) => {
                let ord = compare_present(l, r);
                if predicate.order.is_descending() {
                    ord.reverse()
                } else {
                    ord
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Position of one index row in a sorted scan. Cursors issued by a search
/// carry the position of the last row they consumed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowPosition {
    /// Sort key of the row; empty when the query has no `order by`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: SortKey,
    /// Entity the row belongs to.
    pub id: EntityId,
    /// Version the row was indexed at.
    pub version: Version,
}

impl RowPosition {
    /// Position just past every row of `id` when rows are ordered by id.
    pub fn past_id(id: EntityId, order: ScanOrder) -> Self {
        let version = if order.is_descending() {
            Version(0)
        } else {
            Version(u64::MAX)
        };
        Self {
            key: Vec::new(),
            id,
            version,
        }
    }

    /// Orders two rows so that `Less` means `self` is produced first.
    pub fn compare(
        &self,
        other: &RowPosition,
        sort: &[SortPredicate],
        order: ScanOrder,
    ) -> Ordering {
        let ord = compare_keys(sort, &self.key, &other.key)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.version.cmp(&other.version));
        if order.is_descending() {
            ord.reverse()
        } else {
            ord
        }
    }

    /// Whether `self` comes strictly after `after`.
    pub fn is_after(
        &self,
        after: Option<&RowPosition>,
        sort: &[SortPredicate],
        order: ScanOrder,
    ) -> bool {
        after.map_or(true, |after| self.compare(after, sort, order) == Ordering::Greater)
    }
}
