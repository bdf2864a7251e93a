//! Self-describing block tags
//!
//! Every block handed out by the allocator starts with a one-byte tag, so a
//! checker can classify any block without external metadata.

use super::handle::PmOffset;
use super::pmem::PmemRegion;
use crate::error::{Error, Result};
use std::fmt;

/// Kind of a persistent block, stored in byte 0 of the block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    /// Overflow-chain node
    Link = 1,
    /// Escape-hatch tree interior node
    BptreeIndex = 2,
    /// Escape-hatch tree leaf node
    BptreeLeaf = 3,
    /// Hash table header (first or second level)
    Table = 4,
    /// Bucket array of one generation
    BucketArray = 5,
    /// Region superblock
    Superblock = 0x53,
}

impl BlockKind {
    /// Tag byte as stored
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Read and decode the tag of the block at `off`
    pub fn read(region: &PmemRegion, off: PmOffset) -> Result<Self> {
        region.check_range(off, 1)?;
        let tag = region.read_u8(off);
        Self::try_from(tag).map_err(|_| {
            Error::Corruption(format!("unknown block tag {:#04x} at {}", tag, off))
        })
    }
}

impl TryFrom<u8> for BlockKind {
    type Error = u8;

    fn try_from(tag: u8) -> std::result::Result<Self, u8> {
        match tag {
            1 => Ok(Self::Link),
            2 => Ok(Self::BptreeIndex),
            3 => Ok(Self::BptreeLeaf),
            4 => Ok(Self::Table),
            5 => Ok(Self::BucketArray),
            0x53 => Ok(Self::Superblock),
            other => Err(other),
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Link => "link",
            Self::BptreeIndex => "bptree-index",
            Self::BptreeLeaf => "bptree-leaf",
            Self::Table => "table",
            Self::BucketArray => "bucket-array",
            Self::Superblock => "superblock",
        };
        f.write_str(name)
    }
}
