//! Composite record versions: `"<n>-<tag>"` with `INF` as the maximal number.
//!
//! The numeric part orders versions; the tag is an opaque lexicographic
//! tie-break so two writers bumping to the same number still converge on a
//! single winner everywhere.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest numeric part accepted on the wire (2^53 - 1, so peers that store
/// versions as IEEE doubles round-trip them exactly).
pub const MAX_VERSION_NUM: u64 = 9_007_199_254_740_991;

/// Tag assumed when a version carries none. Zero-padded to the fixed tag
/// width so it sorts below every generated tag.
pub const DEFAULT_TAG: &str = "00000000000000";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("version `{raw}` is empty")]
    Empty { raw: String },
    #[error("version `{raw}` has a malformed numeric part")]
    BadNumber { raw: String },
    #[error("version `{raw}` exceeds the maximum numeric part")]
    TooLarge { raw: String },
}

/// Numeric part of a version. `Inf` dominates every finite value and ties
/// with itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionNum {
    Finite(u64),
    Inf,
}

impl PartialOrd for VersionNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionNum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (VersionNum::Inf, VersionNum::Inf) => Ordering::Equal,
            (VersionNum::Inf, VersionNum::Finite(_)) => Ordering::Greater,
            (VersionNum::Finite(_), VersionNum::Inf) => Ordering::Less,
            (VersionNum::Finite(a), VersionNum::Finite(b)) => a.cmp(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub num: VersionNum,
    pub tag: String,
}

impl RecordVersion {
    pub fn new(num: VersionNum, tag: impl Into<String>) -> Self {
        Self {
            num,
            tag: tag.into(),
        }
    }

    pub fn finite(n: u64, tag: impl Into<String>) -> Self {
        Self::new(VersionNum::Finite(n), tag)
    }

    /// Parse `"<n>-<tag>"`. The tag may itself contain `-`; only the first
    /// separator splits. A missing tag falls back to [`DEFAULT_TAG`].
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        if raw.is_empty() {
            return Err(VersionError::Empty {
                raw: raw.to_string(),
            });
        }
        let (num_part, tag) = match raw.split_once('-') {
            Some((n, t)) if !t.is_empty() => (n, t.to_string()),
            Some((n, _)) => (n, DEFAULT_TAG.to_string()),
            None => (raw, DEFAULT_TAG.to_string()),
        };
        let num = if num_part == "INF" {
            VersionNum::Inf
        } else {
            let n: u64 = num_part.parse().map_err(|_| VersionError::BadNumber {
                raw: raw.to_string(),
            })?;
            if n > MAX_VERSION_NUM {
                return Err(VersionError::TooLarge {
                    raw: raw.to_string(),
                });
            }
            VersionNum::Finite(n)
        };
        Ok(Self { num, tag })
    }

    /// True when a stored `self` beats an `incoming` candidate: stored wins
    /// on a strictly greater number, or on an equal number with a tag that
    /// is not strictly smaller. `Inf` is immutable-maximal.
    pub fn dominates(&self, incoming: &RecordVersion) -> bool {
        match self.num.cmp(&incoming.num) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.num == VersionNum::Inf || self.tag >= incoming.tag,
        }
    }

    /// Whether an UPDATE at this version goes through to storage. Zero and
    /// the sentinel maximum stay in memory only.
    pub fn storable(&self) -> bool {
        match self.num {
            VersionNum::Finite(n) => n > 0 && n < MAX_VERSION_NUM,
            VersionNum::Inf => false,
        }
    }
}

impl Default for RecordVersion {
    fn default() -> Self {
        Self::finite(0, DEFAULT_TAG)
    }
}

impl fmt::Display for RecordVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.num {
            VersionNum::Finite(n) => write!(f, "{}-{}", n, self.tag),
            VersionNum::Inf => write!(f, "INF-{}", self.tag),
        }
    }
}
