//! Versioned bucket arrays
//!
//! A [`Generation`] is one bucket array of a table: the persistent block, one
//! lock per bucket and a live-node counter. During a resize a table has two
//! generations; readers and writers clone the `Arc` under the table lock and
//! then work without it, so the strong count is the generation's reference
//! count. The persistent block is released when the last reference drops
//! after the generation was retired.
//!
//! Bucket array block:
//!
//! ```text
//! 0    tag       u8   BlockKind::BucketArray
//! 8    capacity  u64
//! 16   buckets   capacity × { root u64 | node_count u32 | reserved u32 }
//! ```

use crate::error::{Error, Result};
use crate::storage::{BlockKind, NodeAllocator, PmOffset};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const ARRAY_HEADER_SIZE: usize = 16;
const BUCKET_SIZE: usize = 16;
const OFF_CAPACITY: u64 = 8;

/// Persistent size of a bucket array of `capacity` buckets, `None` on overflow
pub fn array_size(capacity: u64) -> Option<usize> {
    usize::try_from(capacity)
        .ok()?
        .checked_mul(BUCKET_SIZE)?
        .checked_add(ARRAY_HEADER_SIZE)
}

/// What a bucket root designates, decoded from the target block's tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketRoot {
    Empty,
    Chain(PmOffset),
    SubTable(PmOffset),
}

/// In-memory state guarded by a bucket lock
#[derive(Debug, Default)]
pub struct BucketState {
    /// Every record was moved to the next generation; this bucket is dead
    pub drained: bool,
}

/// One bucket array with its locks
pub struct Generation {
    alloc: Arc<NodeAllocator>,
    block: PmOffset,
    capacity: u64,
    locks: Vec<RwLock<BucketState>>,
    node_count: AtomicU64,
    retired: AtomicBool,
}

impl Generation {
    /// Allocate and durably zero a bucket array
    pub fn create(alloc: Arc<NodeAllocator>, capacity: u64) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "bucket array capacity must be non-zero".to_string(),
            ));
        }
        let size = array_size(capacity).ok_or_else(|| {
            Error::InvalidArgument(format!("bucket array capacity {} is too large", capacity))
        })?;
        let block = alloc.allocate(size)?;
        let region = alloc.region();
        region.fill_unordered(block, size, 0);
        region.write_unordered(block, &[BlockKind::BucketArray.tag()]);
        region.write_unordered(block.add(OFF_CAPACITY), &capacity.to_le_bytes());
        if let Err(e) = region.flush(block, size) {
            alloc.free(block, size)?;
            return Err(e);
        }

        debug!(%block, capacity, "Created bucket array");
        Ok(Arc::new(Self::with_state(alloc, block, capacity, 0)))
    }

    /// Wrap an existing bucket array found in the region
    pub fn attach(alloc: Arc<NodeAllocator>, block: PmOffset) -> Result<Arc<Self>> {
        let region = alloc.region();
        let kind = BlockKind::read(region, block)?;
        if kind != BlockKind::BucketArray {
            return Err(Error::Corruption(format!(
                "expected bucket array at {}, found {}",
                block, kind
            )));
        }
        region.check_range(block, ARRAY_HEADER_SIZE)?;
        let capacity = region.read_u64(block.add(OFF_CAPACITY));
        if capacity == 0 {
            return Err(Error::Corruption(format!("bucket array {} has no buckets", block)));
        }
        let size = array_size(capacity).ok_or_else(|| {
            Error::Corruption(format!("bucket array {} has capacity {}", block, capacity))
        })?;
        region.check_range(block, size)?;

        let gen = Self::with_state(alloc, block, capacity, 0);
        let total: u64 = (0..capacity as usize).map(|i| gen.node_count(i) as u64).sum();
        gen.node_count.store(total, Ordering::Relaxed);
        Ok(Arc::new(gen))
    }

    fn with_state(alloc: Arc<NodeAllocator>, block: PmOffset, capacity: u64, nodes: u64) -> Self {
        Self {
            alloc,
            block,
            capacity,
            locks: (0..capacity).map(|_| RwLock::new(BucketState::default())).collect(),
            node_count: AtomicU64::new(nodes),
            retired: AtomicBool::new(false),
        }
    }

    pub fn block(&self) -> PmOffset {
        self.block
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Size of the persistent block
    pub fn block_size(&self) -> usize {
        // Capacity was checked against the region when the generation was built.
        ARRAY_HEADER_SIZE + self.capacity as usize * BUCKET_SIZE
    }

    fn bucket(&self, idx: usize) -> PmOffset {
        debug_assert!((idx as u64) < self.capacity);
        self.block.add((ARRAY_HEADER_SIZE + idx * BUCKET_SIZE) as u64)
    }

    pub fn read_bucket(&self, idx: usize) -> RwLockReadGuard<'_, BucketState> {
        self.locks[idx].read()
    }

    pub fn write_bucket(&self, idx: usize) -> RwLockWriteGuard<'_, BucketState> {
        self.locks[idx].write()
    }

    /// Raw root handle of a bucket
    pub fn root(&self, idx: usize) -> PmOffset {
        PmOffset::new(self.alloc.region().read_u64(self.bucket(idx)))
    }

    /// Decode what the root designates
    pub fn bucket_root(&self, idx: usize) -> Result<BucketRoot> {
        let root = self.root(idx);
        if root.is_null() {
            return Ok(BucketRoot::Empty);
        }
        match BlockKind::read(self.alloc.region(), root)? {
            BlockKind::Link => Ok(BucketRoot::Chain(root)),
            BlockKind::Table => Ok(BucketRoot::SubTable(root)),
            other => Err(Error::Corruption(format!(
                "bucket {} of {} points at a {} block",
                idx, self.block, other
            ))),
        }
    }

    /// Ordered publish of a new root
    pub fn set_root(&self, idx: usize, root: PmOffset) -> Result<()> {
        self.alloc
            .region()
            .write_ordered_u64(self.bucket(idx), root.get())
    }

    /// Nodes in the bucket's chain
    pub fn node_count(&self, idx: usize) -> u32 {
        self.alloc.region().read_u32(self.bucket(idx).add(8))
    }

    /// Ordered write of a bucket's node count, keeping the total in step
    pub fn set_node_count(&self, idx: usize, count: u32) -> Result<()> {
        let old = self.node_count(idx);
        self.alloc
            .region()
            .write_ordered_u32(self.bucket(idx).add(8), count)?;
        if count >= old {
            self.node_count.fetch_add((count - old) as u64, Ordering::Relaxed);
        } else {
            self.node_count.fetch_sub((old - count) as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Apply a chain's node delta to the bucket count
    pub fn adjust_node_count(&self, idx: usize, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let count = (self.node_count(idx) as i64 + delta).max(0) as u32;
        self.set_node_count(idx, count)
    }

    /// Live nodes across all buckets
    pub fn total_nodes(&self) -> u64 {
        self.node_count.load(Ordering::Relaxed)
    }

    /// Mark the generation superseded; its block is freed on last drop
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        if !self.is_retired() {
            return;
        }
        if let Err(e) = self.alloc.free(self.block, self.block_size()) {
            warn!(block = %self.block, error = %e, "Failed to free retired bucket array");
        } else {
            debug!(block = %self.block, capacity = self.capacity, "Freed retired bucket array");
        }
    }
}
