//! Slab bitmap allocator for the persistent region
//!
//! The region is carved into fixed 256-byte slabs. One bit per slab records
//! whether it is in use. The bitmap itself lives in process memory only: after
//! a restart it is rebuilt by marking every block reachable from the root table
//! (see `dir::recovery`), which also reclaims blocks orphaned by a crash.
//!
//! Allocation is next-fit: a rolling cursor remembers where the last
//! allocation ended and the scan wraps around once. Freed slabs are never
//! coalesced or zeroed.

use super::handle::PmOffset;
use super::pmem::PmemRegion;
use crate::error::{Error, Result};
use crate::metrics::ALLOCATED_SLABS;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Allocation granularity in bytes
pub const SLAB_SIZE: usize = 256;

/// Allocator usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub slab_size: usize,
    pub total_slabs: usize,
    pub used_slabs: usize,
    pub free_slabs: usize,
}

struct Bitmap {
    words: Vec<u64>,
    total: usize,
    used: usize,
    cursor: usize,
}

impl Bitmap {
    fn new(total: usize) -> Self {
        Self {
            words: vec![0; total.div_ceil(64)],
            total,
            used: 0,
            cursor: 1,
        }
    }

    fn is_set(&self, slab: usize) -> bool {
        self.words[slab / 64] & (1 << (slab % 64)) != 0
    }

    fn set(&mut self, slab: usize) {
        self.words[slab / 64] |= 1 << (slab % 64);
    }

    fn clear(&mut self, slab: usize) {
        self.words[slab / 64] &= !(1 << (slab % 64));
    }

    /// First run of `n` free slabs lying entirely inside `[from, to)`
    fn scan(&self, from: usize, to: usize, n: usize) -> Option<usize> {
        let mut run_start = from;
        let mut run_len = 0;
        let mut slab = from;
        while slab < to {
            if self.is_set(slab) {
                run_len = 0;
                run_start = slab + 1;
            } else {
                run_len += 1;
                if run_len == n {
                    return Some(run_start);
                }
            }
            slab += 1;
        }
        None
    }

    fn find_run(&self, n: usize) -> Option<usize> {
        if n == 0 || n >= self.total {
            return None;
        }
        self.scan(self.cursor, self.total, n).or_else(|| {
            let wrap_end = (self.cursor + n - 1).min(self.total);
            self.scan(1, wrap_end, n)
        })
    }
}

/// Persistent node allocator
///
/// One allocator-wide mutex serializes all bitmap updates.
pub struct NodeAllocator {
    region: Arc<PmemRegion>,
    bitmap: Mutex<Bitmap>,
}

impl NodeAllocator {
    /// Create an allocator over `region` with every slab free except slab 0
    /// (the superblock)
    pub fn new(region: Arc<PmemRegion>) -> Result<Self> {
        let total = (region.len() / SLAB_SIZE as u64) as usize;
        if total < 2 {
            return Err(Error::InvalidArgument(format!(
                "region of {} bytes holds no allocatable slab",
                region.len()
            )));
        }

        let mut bitmap = Bitmap::new(total);
        bitmap.set(0);
        bitmap.used = 1;
        ALLOCATED_SLABS.add(1);

        debug!(total_slabs = total, "Initialized node allocator");
        Ok(Self {
            region,
            bitmap: Mutex::new(bitmap),
        })
    }

    /// The region this allocator carves up
    pub fn region(&self) -> &Arc<PmemRegion> {
        &self.region
    }

    /// Number of slabs needed for `size` bytes
    pub fn slabs_for(size: usize) -> usize {
        size.div_ceil(SLAB_SIZE)
    }

    /// Reserve `size` bytes (rounded up to whole slabs)
    pub fn allocate(&self, size: usize) -> Result<PmOffset> {
        let n = Self::slabs_for(size);
        if n == 0 {
            return Err(Error::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }

        let mut bitmap = self.bitmap.lock();
        let start = bitmap.find_run(n).ok_or_else(|| {
            Error::OutOfSpace(format!(
                "no run of {} free slabs ({} of {} used)",
                n, bitmap.used, bitmap.total
            ))
        })?;

        for slab in start..start + n {
            bitmap.set(slab);
        }
        bitmap.used += n;
        bitmap.cursor = if start + n >= bitmap.total { 1 } else { start + n };
        ALLOCATED_SLABS.add(n as i64);

        let off = PmOffset::new((start * SLAB_SIZE) as u64);
        debug!(%off, size, slabs = n, "Allocated block");
        Ok(off)
    }

    /// Reserve `size` bytes and durably fill them with `fill`
    pub fn allocate_and_init(&self, size: usize, fill: u8) -> Result<PmOffset> {
        let off = self.allocate(size)?;
        self.region.fill_unordered(off, size, fill);
        if let Err(e) = self.region.flush(off, size) {
            self.free(off, size)?;
            return Err(e);
        }
        Ok(off)
    }

    /// Return a block to the free pool. Contents are left as they are.
    pub fn free(&self, off: PmOffset, size: usize) -> Result<()> {
        let (start, n) = self.slab_range(off, size)?;

        let mut bitmap = self.bitmap.lock();
        let mut released = 0;
        for slab in start..start + n {
            if bitmap.is_set(slab) {
                bitmap.clear(slab);
                released += 1;
            } else {
                warn!(%off, slab, "Freeing a slab that is not in use");
            }
        }
        bitmap.used -= released;
        ALLOCATED_SLABS.sub(released as i64);

        debug!(%off, size, slabs = n, "Freed block");
        Ok(())
    }

    /// Mark a block found reachable during recovery as used
    ///
    /// Fails with `Corruption` when any slab of the block is already marked,
    /// which means two live structures claim the same memory.
    pub fn mark_used(&self, off: PmOffset, size: usize) -> Result<()> {
        let (start, n) = self.slab_range(off, size)?;

        let mut bitmap = self.bitmap.lock();
        if let Some(slab) = (start..start + n).find(|&s| bitmap.is_set(s)) {
            return Err(Error::Corruption(format!(
                "block {} overlaps slab {} which is already in use",
                off, slab
            )));
        }
        for slab in start..start + n {
            bitmap.set(slab);
        }
        bitmap.used += n;
        ALLOCATED_SLABS.add(n as i64);
        Ok(())
    }

    /// Whether every slab of the block is currently marked used
    pub fn is_used(&self, off: PmOffset, size: usize) -> bool {
        match self.slab_range(off, size) {
            Ok((start, n)) => {
                let bitmap = self.bitmap.lock();
                (start..start + n).all(|s| bitmap.is_set(s))
            }
            Err(_) => false,
        }
    }

    /// Usage snapshot
    pub fn stats(&self) -> AllocatorStats {
        let bitmap = self.bitmap.lock();
        AllocatorStats {
            slab_size: SLAB_SIZE,
            total_slabs: bitmap.total,
            used_slabs: bitmap.used,
            free_slabs: bitmap.total - bitmap.used,
        }
    }

    fn slab_range(&self, off: PmOffset, size: usize) -> Result<(usize, usize)> {
        let raw = off.get() as usize;
        if off.is_null() || raw % SLAB_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} is not a block handle",
                off
            )));
        }
        let start = raw / SLAB_SIZE;
        let n = Self::slabs_for(size).max(1);
        let total = self.bitmap.lock().total;
        if start + n > total {
            return Err(Error::Corruption(format!(
                "block {}+{} lies past the last slab",
                off, size
            )));
        }
        Ok((start, n))
    }
}

impl Drop for NodeAllocator {
    fn drop(&mut self) {
        ALLOCATED_SLABS.sub(self.bitmap.get_mut().used as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pmem::FlushMode;
    use tempfile::TempDir;

    fn allocator(slabs: usize) -> (TempDir, NodeAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let region = PmemRegion::create(
            dir.path().join("alloc.pm"),
            (slabs * SLAB_SIZE) as u64,
            FlushMode::Fence,
        )
        .unwrap();
        let alloc = NodeAllocator::new(Arc::new(region)).unwrap();
        (dir, alloc)
    }

    #[test]
    fn test_allocate_rounds_to_slabs() -> Result<()> {
        let (_dir, alloc) = allocator(64);

        let a = alloc.allocate(1024)?;
        let b = alloc.allocate(10)?;
        assert_eq!(a.get(), SLAB_SIZE as u64);
        assert_eq!(b.get(), 5 * SLAB_SIZE as u64);

        let stats = alloc.stats();
        assert_eq!(stats.used_slabs, 1 + 4 + 1);
        assert_eq!(stats.free_slabs, 64 - 6);
        Ok(())
    }

    #[test]
    fn test_next_fit_wraps_around() -> Result<()> {
        let (_dir, alloc) = allocator(9);

        let first = alloc.allocate(1024)?;
        let second = alloc.allocate(1024)?;
        assert_eq!(second.get(), 5 * SLAB_SIZE as u64);

        // The second block ends at the last slab, so the cursor wraps to slab 1.
        alloc.free(first, 1024)?;
        let third = alloc.allocate(1024)?;
        assert_eq!(third, first);
        Ok(())
    }

    #[test]
    fn test_out_of_space() -> Result<()> {
        let (_dir, alloc) = allocator(6);

        alloc.allocate(1024)?;
        let err = alloc.allocate(512).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace(_)));

        alloc.allocate(256)?;
        assert!(alloc.allocate(256).is_err());
        Ok(())
    }

    #[test]
    fn test_free_does_not_coalesce_but_reuses() -> Result<()> {
        let (_dir, alloc) = allocator(16);

        let blocks: Vec<_> = (0..15).map(|_| alloc.allocate(256)).collect::<Result<_>>()?;
        alloc.free(blocks[3], 256)?;
        alloc.free(blocks[4], 256)?;

        // Two adjacent free slabs satisfy a two-slab request.
        let joined = alloc.allocate(512)?;
        assert_eq!(joined, blocks[3]);
        Ok(())
    }

    #[test]
    fn test_allocate_and_init_fills() -> Result<()> {
        let (_dir, alloc) = allocator(8);

        let off = alloc.allocate_and_init(300, 0x5a)?;
        assert_eq!(alloc.region().read_u8(off), 0x5a);
        assert_eq!(alloc.region().read_u8(off.add(299)), 0x5a);
        Ok(())
    }

    #[test]
    fn test_mark_used_detects_overlap() -> Result<()> {
        let (_dir, alloc) = allocator(16);

        let off = PmOffset::new(4 * SLAB_SIZE as u64);
        alloc.mark_used(off, 1024)?;
        assert!(alloc.is_used(off, 1024));

        let overlapping = PmOffset::new(6 * SLAB_SIZE as u64);
        assert!(matches!(
            alloc.mark_used(overlapping, 256),
            Err(Error::Corruption(_))
        ));

        // Marked blocks are skipped by allocation.
        let next = alloc.allocate(1024)?;
        assert_eq!(next.get(), 8 * SLAB_SIZE as u64);
        Ok(())
    }

    #[test]
    fn test_invalid_handles_rejected() {
        let (_dir, alloc) = allocator(8);
        assert!(alloc.free(PmOffset::NULL, 256).is_err());
        assert!(alloc.free(PmOffset::new(100), 256).is_err());
        assert!(alloc.mark_used(PmOffset::new(7 * SLAB_SIZE as u64), 512).is_err());
    }
}
