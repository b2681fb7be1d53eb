//! Persistent records of the versioned index, encoded with MessagePack.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Hash;

/// Position index treated as "still current".
pub const UNBOUNDED: u64 = u64::MAX;

/// One committed state root: which strand it lives on and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRecord {
    pub strand: Hash,
    pub parent_root: Hash,
    /// Ordinal of this root within its strand (1-based).
    pub index: u64,
}

/// One strand of the root tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrandRecord {
    /// Monotonic counter of positions used so far.
    pub head: u64,
    pub parent_strand: Option<Hash>,
    /// Ordinal of the fork-base root within the parent strand. Lookups that
    /// fall through to the parent use this as their containment target, so a
    /// child strand never observes parent writes made after the fork point.
    pub base_index: u64,
}

/// Validity window of one value of one key within a strand: current for
/// positions in `[lo, hi)`, with `hi == UNBOUNDED` until superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    pub lo: u64,
    pub hi: u64,
    /// Content address of the value blob.
    pub value: Hash,
}

impl KeyVersion {
    pub fn contains(&self, position: u64) -> bool {
        self.lo <= position && position < self.hi
    }
}

pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(record)?)
}

pub fn decode<'a, T: Deserialize<'a>>(raw: &'a [u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(raw)?)
}
