//! Opaque pagination tokens.
//!
//! A cursor is URL-safe base64 over a small JSON body naming the plan it was
//! issued for, the scan order and the last id handed out. Cursors issued by a
//! reconciled search also carry the sorted row position they stopped at.

use std::cmp::Ordering;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as CURSOR_ENGINE;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::query::sort::RowPosition;
use crate::types::{EntityId, QuarryError, Result};

/// Direction ids are produced in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOrder {
    /// Smallest id first.
    #[default]
    Ascending,
    /// Largest id first.
    Descending,
}

impl ScanOrder {
    /// Orders two ids so that `Less` means `a` is produced before `b`.
    pub fn cmp(self, a: EntityId, b: EntityId) -> Ordering {
        match self {
            ScanOrder::Ascending => a.cmp(&b),
            ScanOrder::Descending => b.cmp(&a),
        }
    }

    /// Whether `id` comes strictly after `after` in this order.
    pub fn is_after(self, id: EntityId, after: Option<EntityId>) -> bool {
        after.map_or(true, |after| self.cmp(id, after) == Ordering::Greater)
    }

    /// Whether this is [`ScanOrder::Descending`].
    pub fn is_descending(self) -> bool {
        self == ScanOrder::Descending
    }
}

/// Decoded resume position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Hash of the plan that issued the cursor.
    pub plan_hash: u64,
    /// Order the ids were produced in.
    pub order: ScanOrder,
    /// Last id returned to the caller.
    pub after: EntityId,
    /// Last index row consumed, for searches over the secondary index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<RowPosition>,
}

impl Cursor {
    /// Encodes the cursor as an opaque token.
    pub fn encode(&self) -> Result<String> {
        let body = serde_json::to_vec(self)
            .map_err(|err| QuarryError::InvalidCursor(format!("encode: {err}")))?;
        Ok(CURSOR_ENGINE.encode(body))
    }

    /// Decodes a token without checking which plan issued it.
    pub fn decode(token: &str) -> Result<Self> {
        let body = CURSOR_ENGINE
            .decode(token.trim())
            .map_err(|err| QuarryError::InvalidCursor(format!("not base64: {err}")))?;
        serde_json::from_slice(&body)
            .map_err(|err| QuarryError::InvalidCursor(format!("malformed body: {err}")))
    }

    /// Decodes a token and checks it belongs to `plan_hash`.
    pub fn decode_for(token: &str, plan_hash: u64) -> Result<Self> {
        let cursor = Self::decode(token)?;
        if cursor.plan_hash != plan_hash {
            return Err(QuarryError::InvalidCursor(format!(
                "issued for plan {:016x}, not {:016x}",
                cursor.plan_hash, plan_hash
            )));
        }
        Ok(cursor)
    }
}
