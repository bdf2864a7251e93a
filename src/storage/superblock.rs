//! Region superblock (slab 0)
//!
//! ```text
//! 0   tag          u8   0x53
//! 8   magic        u64  "PHDIRIX1"
//! 16  version      u32
//! 20  slab size    u32
//! 24  region size  u64
//! 32  root table   u64  handle of the first-level table header
//! ```
//!
//! The root table handle is written last with an ordered write. A region whose
//! root is NULL was never fully formatted and is formatted again on open.

use super::allocator::SLAB_SIZE;
use super::block::BlockKind;
use super::handle::PmOffset;
use super::pmem::PmemRegion;
use crate::error::{Error, Result};
use tracing::info;

/// "PHDIRIX1" as a little-endian word
pub const MAGIC: u64 = u64::from_le_bytes(*b"PHDIRIX1");

/// On-media format version
pub const FORMAT_VERSION: u32 = 1;

const OFF_MAGIC: u64 = 8;
const OFF_VERSION: u64 = 16;
const OFF_SLAB_SIZE: u64 = 20;
const OFF_REGION_SIZE: u64 = 24;
const OFF_ROOT: u64 = 32;
const SUPERBLOCK_LEN: usize = 40;

/// Decoded superblock contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub slab_size: u32,
    pub region_size: u64,
    pub root_table: PmOffset,
}

impl Superblock {
    /// Write a fresh superblock with a NULL root
    pub fn format(region: &PmemRegion) -> Result<Self> {
        let base = PmOffset::NULL;
        let mut bytes = [0u8; SUPERBLOCK_LEN];
        bytes[0] = BlockKind::Superblock.tag();
        bytes[8..16].copy_from_slice(&MAGIC.to_le_bytes());
        bytes[16..20].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes[20..24].copy_from_slice(&(SLAB_SIZE as u32).to_le_bytes());
        bytes[24..32].copy_from_slice(&region.len().to_le_bytes());

        region.fill_unordered(base, SLAB_SIZE, 0);
        region.write_unordered(base, &bytes);
        region.flush(base, SLAB_SIZE)?;

        info!(region_size = region.len(), "Formatted region superblock");
        Ok(Self {
            version: FORMAT_VERSION,
            slab_size: SLAB_SIZE as u32,
            region_size: region.len(),
            root_table: PmOffset::NULL,
        })
    }

    /// Read and validate the superblock of an existing region
    pub fn load(region: &PmemRegion) -> Result<Self> {
        let base = PmOffset::NULL;
        region.check_range(base, SUPERBLOCK_LEN)?;

        let tag = region.read_u8(base);
        if tag != BlockKind::Superblock.tag() {
            return Err(Error::Corruption(format!(
                "superblock tag is {:#04x}, expected {:#04x}",
                tag,
                BlockKind::Superblock.tag()
            )));
        }
        let magic = region.read_u64(base.add(OFF_MAGIC));
        if magic != MAGIC {
            return Err(Error::Corruption(format!("bad superblock magic {:#018x}", magic)));
        }

        let sb = Self {
            version: region.read_u32(base.add(OFF_VERSION)),
            slab_size: region.read_u32(base.add(OFF_SLAB_SIZE)),
            region_size: region.read_u64(base.add(OFF_REGION_SIZE)),
            root_table: PmOffset::new(region.read_u64(base.add(OFF_ROOT))),
        };

        if sb.version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported format version {}",
                sb.version
            )));
        }
        if sb.slab_size as usize != SLAB_SIZE {
            return Err(Error::Corruption(format!(
                "region uses {}-byte slabs, this build uses {}",
                sb.slab_size, SLAB_SIZE
            )));
        }
        if sb.region_size != region.len() {
            return Err(Error::Corruption(format!(
                "superblock records {} bytes but the mapping has {}",
                sb.region_size,
                region.len()
            )));
        }
        Ok(sb)
    }

    /// Durably point the superblock at the root table
    pub fn set_root(&mut self, region: &PmemRegion, root: PmOffset) -> Result<()> {
        region.write_ordered_u64(PmOffset::NULL.add(OFF_ROOT), root.get())?;
        self.root_table = root;
        Ok(())
    }

    /// Whether a superblock tag and magic are present at all
    pub fn is_formatted(region: &PmemRegion) -> bool {
        region.check_range(PmOffset::NULL, SUPERBLOCK_LEN).is_ok()
            && region.read_u8(PmOffset::NULL) == BlockKind::Superblock.tag()
            && region.read_u64(PmOffset::NULL.add(OFF_MAGIC)) == MAGIC
    }

    /// Whether the whole superblock span is zero, i.e. the region was never formatted
    pub fn is_blank(region: &PmemRegion) -> bool {
        if region.check_range(PmOffset::NULL, SUPERBLOCK_LEN).is_err() {
            return false;
        }
        let mut bytes = [0u8; SUPERBLOCK_LEN];
        region.read_into(PmOffset::NULL, &mut bytes);
        bytes.iter().all(|&b| b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pmem::FlushMode;

    #[test]
    fn test_format_and_load() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let region = PmemRegion::create(dir.path().join("sb.pm"), 8192, FlushMode::Fence)?;
        assert!(!Superblock::is_formatted(&region));
        assert!(Superblock::is_blank(&region));

        let mut sb = Superblock::format(&region)?;
        assert!(Superblock::is_formatted(&region));
        sb.set_root(&region, PmOffset::new(512))?;

        let loaded = Superblock::load(&region)?;
        assert_eq!(loaded, sb);
        assert_eq!(loaded.root_table, PmOffset::new(512));
        Ok(())
    }

    #[test]
    fn test_load_rejects_garbage() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let region = PmemRegion::create(dir.path().join("sb.pm"), 8192, FlushMode::Fence)?;
        assert!(matches!(Superblock::load(&region), Err(Error::Corruption(_))));

        Superblock::format(&region)?;
        region.write_ordered_u32(PmOffset::new(OFF_VERSION), 99)?;
        assert!(matches!(Superblock::load(&region), Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn test_zeroed_tag_is_not_blank() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let region = PmemRegion::create(dir.path().join("sb.pm"), 8192, FlushMode::Fence)?;
        Superblock::format(&region)?;
        region.write_ordered(PmOffset::NULL, &[0])?;

        assert!(!Superblock::is_formatted(&region));
        assert!(!Superblock::is_blank(&region));
        Ok(())
    }
}
