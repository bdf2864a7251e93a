//! Directory index facade
//!
//! # Overview
//!
//! [`DirIndex`] owns one persistent region and everything built on it:
//!
//! ```text
//! DirIndex
//!   ├─→ PmemRegion      (mapped file)
//!   ├─→ Superblock      (slab 0, points at the root table)
//!   ├─→ NodeAllocator   (slab bitmap, rebuilt on open)
//!   ├─→ BackgroundPool  (promotion / resize)
//!   └─→ DirHashTable    (first level)
//! ```
//!
//! Opening a fresh or zeroed file formats it. Opening a formatted region runs
//! recovery, which rebuilds the allocator from what is reachable and finishes
//! any resize a crash interrupted.

use crate::config::IndexConfig;
use crate::dir::iter::DirIterator;
use crate::dir::node::check_name;
use crate::dir::recovery::{recover, RecoveryReport};
use crate::dir::verify::{verify_table, VerifyReport};
use crate::dir::worker::BackgroundPool;
use crate::dir::{DeleteOutcome, DirHashTable, HashLevel, PutOutcome, TableContext};
use crate::error::Result;
use crate::metrics::{init_metrics, record_operation};
use crate::storage::{AllocatorStats, NodeAllocator, PmemRegion, Superblock};
use crate::InodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Point-in-time usage of an index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub region_size: u64,
    pub first_level_capacity: u64,
    /// Promoted first-level buckets
    pub subtables: usize,
    /// Second-level tables with a resize in progress
    pub resizing: usize,
    /// Live link nodes across all tables
    pub nodes: u64,
    pub pending_tasks: usize,
    pub allocator: AllocatorStats,
}

/// Persistent directory-entry index over one mapped region
pub struct DirIndex {
    region: Arc<PmemRegion>,
    ctx: Arc<TableContext>,
    table: Arc<DirHashTable>,
    superblock: Superblock,
    recovery: Option<RecoveryReport>,
}

impl DirIndex {
    /// Open the region at `path`, creating and formatting it if needed
    pub fn open<P: AsRef<Path>>(path: P, config: IndexConfig) -> Result<Self> {
        let path = path.as_ref();
        config.validate()?;
        init_metrics();

        let region = if PmemRegion::exists(path) {
            PmemRegion::open(path, config.flush_mode)?
        } else {
            PmemRegion::create(path, config.region_size, config.flush_mode)?
        };
        let region = Arc::new(region);

        // Only an all-zero superblock span is formatted; anything else must
        // carry a valid superblock.
        let mut superblock = if Superblock::is_blank(&region) {
            Superblock::format(&region)?
        } else {
            Superblock::load(&region)?
        };

        let ctx = Arc::new(TableContext {
            alloc: Arc::new(NodeAllocator::new(Arc::clone(&region))?),
            pool: Arc::new(BackgroundPool::new(config.background_threads)?),
            config,
        });

        let (table, recovery) = if superblock.root_table.is_null() {
            let table = DirHashTable::create(
                Arc::clone(&ctx),
                HashLevel::First,
                ctx.config.first_level_capacity,
            )?;
            superblock.set_root(&region, table.header())?;
            info!(
                path = %path.display(),
                capacity = ctx.config.first_level_capacity,
                "Created directory index"
            );
            (table, None)
        } else {
            let (table, report) = recover(Arc::clone(&ctx), superblock.root_table)?;
            if table.capacity() != ctx.config.first_level_capacity {
                warn!(
                    configured = ctx.config.first_level_capacity,
                    actual = table.capacity(),
                    "First-level capacity is fixed when a region is formatted; keeping the region's"
                );
            }
            info!(path = %path.display(), tables = report.tables, "Opened directory index");
            (table, Some(report))
        };

        Ok(Self {
            region,
            ctx,
            table,
            superblock,
            recovery,
        })
    }

    /// Insert `name` into `dir`, or point an existing entry at `child`
    pub fn put(&self, dir: InodeId, name: impl AsRef<[u8]>, child: InodeId) -> Result<PutOutcome> {
        let name = name.as_ref();
        let start = Instant::now();
        let result = check_name(name).and_then(|_| self.table.put(dir, name, child));
        observe("put", start, &result, |outcome| match outcome {
            PutOutcome::Inserted => "inserted",
            PutOutcome::Updated => "updated",
        });
        result
    }

    /// Child of `name` in `dir`
    pub fn get(&self, dir: InodeId, name: impl AsRef<[u8]>) -> Result<Option<InodeId>> {
        let name = name.as_ref();
        let start = Instant::now();
        let result = check_name(name).and_then(|_| self.table.get(dir, name));
        observe("get", start, &result, |found| if found.is_some() { "hit" } else { "miss" });
        result
    }

    /// Remove `name` from `dir`
    pub fn delete(&self, dir: InodeId, name: impl AsRef<[u8]>) -> Result<DeleteOutcome> {
        let name = name.as_ref();
        let start = Instant::now();
        let result = check_name(name).and_then(|_| self.table.delete(dir, name));
        observe("delete", start, &result, |outcome| match outcome {
            DeleteOutcome::Deleted => "deleted",
            DeleteOutcome::NotFound => "not_found",
        });
        result
    }

    /// Snapshot of the entries of `dir`, in name-hash order
    pub fn iter(&self, dir: InodeId) -> Result<DirIterator> {
        let start = Instant::now();
        let result = self.table.scan(dir).map(|entries| DirIterator::new(dir, entries));
        observe("iter", start, &result, |_| "ok");
        result
    }

    /// Block until queued promotions and resizes are done
    pub fn wait_for_background(&self) {
        self.ctx.pool.wait_idle();
    }

    /// Drain background work and make the whole region durable
    pub fn sync(&self) -> Result<()> {
        self.wait_for_background();
        self.region.sync_all()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            region_size: self.region.len(),
            first_level_capacity: self.table.capacity(),
            subtables: self.table.subtables().count(),
            resizing: self.table.subtables().filter(|t| t.is_resizing()).count(),
            nodes: self.table.total_nodes(),
            pending_tasks: self.ctx.pool.pending(),
            allocator: self.ctx.alloc.stats(),
        }
    }

    /// Walk every reachable structure and report what is inconsistent
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        verify_table(&self.table, &mut report)?;
        if self.superblock.root_table != self.table.header() {
            report.problems.push(format!(
                "superblock root {} does not match table {}",
                self.superblock.root_table,
                self.table.header()
            ));
        }
        info!(
            tables = report.tables,
            nodes = report.nodes,
            entries = report.entries,
            problems = report.problems.len(),
            "Checked directory index"
        );
        Ok(report)
    }

    /// What recovery repaired when this region was opened, if it existed
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn config(&self) -> &IndexConfig {
        &self.ctx.config
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Sync and unmap
    pub fn close(self) -> Result<()> {
        self.sync()?;
        info!(path = %self.region.path().display(), "Closed directory index");
        Ok(())
    }
}

impl Drop for DirIndex {
    fn drop(&mut self) {
        // Background tasks hold the tables; let them finish before unmapping.
        self.ctx.pool.wait_idle();
        debug!(path = %self.region.path().display(), "Dropped directory index");
    }
}

fn observe<T>(op: &str, start: Instant, result: &Result<T>, outcome: impl Fn(&T) -> &'static str) {
    let label = match result {
        Ok(value) => outcome(value),
        Err(_) => "error",
    };
    record_operation(op, label, start.elapsed().as_secs_f64());
}
