//! Offset handles into the persistent region

use serde::{Deserialize, Serialize};
use std::fmt;

/// Location of a block inside the persistent region
///
/// Stored as a byte offset from the region base, never as a process
/// address, so a region remapped at a different base after a restart
/// needs no pointer fix-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PmOffset(u64);

impl PmOffset {
    /// The "absent" sentinel. Offset 0 holds the superblock, so no node lives there.
    pub const NULL: PmOffset = PmOffset(0);

    /// Create a handle from a raw offset
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Raw byte offset from the region base
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the absent sentinel
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Handle of a field `delta` bytes into this block
    pub const fn add(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }

    /// `None` for the sentinel, `Some(self)` otherwise
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u64> for PmOffset {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PmOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "pm:null")
        } else {
            write!(f, "pm:{:#x}", self.0)
        }
    }
}
