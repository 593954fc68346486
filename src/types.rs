#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Identifier newtypes and the crate-wide error type.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::errors::{CompileError, ParseError};

/// Identifier of an entity within a collection.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Time-ordered version token assigned on every write.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Version(pub u64);

/// Physical partition of a property's range index.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ShardId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        EntityId(value)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Version(value)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum QuarryError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("storage unavailable: {0}")]
    Storage(String),
    #[error("storage timed out: {0}")]
    Timeout(String),
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("stage '{stage}' expected a {expected} payload, found {found}")]
    Pipeline {
        stage: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl QuarryError {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(self, QuarryError::Storage(_) | QuarryError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, QuarryError>;
