//! Reopening a region
//!
//! The allocator bitmap is not persistent. Recovery walks everything
//! reachable from the root table and marks it used in a fresh allocator, so
//! blocks orphaned by a crash (unpublished nodes, retired nodes whose free
//! was lost, half-built sub-tables) simply stay free.
//!
//! On the way it repairs the state a crash can leave behind:
//!
//! - `prev` links: forward links are authoritative, back links are rewritten
//! - bucket node counts: recounted from the chains
//! - a table whose `next` equals `current` (crash while finishing a resize)
//! - interrupted resizes, resumed once every reachable block is marked

use super::node::{header, LinkNode, NODE_SIZE};
use super::table::{DirHashTable, HashLevel, TableContext, TABLE_HEADER_SIZE};
use super::version::BucketRoot;
use crate::error::{Error, Result};
use crate::storage::{NodeAllocator, PmOffset};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// What recovery found and fixed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub tables: usize,
    pub generations: usize,
    pub nodes: usize,
    pub repaired_links: usize,
    pub repaired_counts: usize,
    pub resumed_resizes: usize,
}

/// Rebuild the in-memory index over the table at `root`
///
/// `ctx.alloc` must be a fresh allocator with only the superblock marked.
pub fn recover(
    ctx: Arc<TableContext>,
    root: PmOffset,
) -> Result<(Arc<DirHashTable>, RecoveryReport)> {
    let mut report = RecoveryReport::default();
    let table = recover_table(&ctx, root, None, &mut report)?;

    // Resizes allocate, so they only run once every reachable block is marked.
    let pending: Vec<Arc<DirHashTable>> = std::iter::once(&table)
        .chain(table.subtables())
        .filter(|t| t.is_resizing())
        .cloned()
        .collect();
    for t in pending {
        t.resume_resize()?;
        report.resumed_resizes += 1;
    }

    let stats = ctx.alloc.stats();
    info!(
        tables = report.tables,
        nodes = report.nodes,
        repaired_links = report.repaired_links,
        repaired_counts = report.repaired_counts,
        resumed_resizes = report.resumed_resizes,
        used_slabs = stats.used_slabs,
        "Recovered directory index"
    );
    Ok((table, report))
}

fn recover_table(
    ctx: &Arc<TableContext>,
    header: PmOffset,
    parent_capacity: Option<u64>,
    report: &mut RecoveryReport,
) -> Result<Arc<DirHashTable>> {
    let alloc = &ctx.alloc;
    alloc.mark_used(header, TABLE_HEADER_SIZE)?;
    let table = DirHashTable::attach(Arc::clone(ctx), header)?;

    match (table.level(), parent_capacity) {
        (HashLevel::First, None) => {}
        (HashLevel::Second { parent_capacity: found }, Some(expected)) if found == expected => {}
        (level, expected) => {
            return Err(Error::Corruption(format!(
                "table {} has level {:?} where a parent capacity of {:?} was expected",
                header, level, expected
            )));
        }
    }
    report.tables += 1;

    let (current, next) = table.generations();
    for gen in std::iter::once(current).chain(next) {
        alloc.mark_used(gen.block(), gen.block_size())?;
        report.generations += 1;

        for idx in 0..gen.capacity() as usize {
            let actual = match gen.bucket_root(idx)? {
                BucketRoot::Empty => 0,
                BucketRoot::Chain(root) => recover_chain(alloc, root, report)?,
                BucketRoot::SubTable(sub_header) => {
                    if parent_capacity.is_some() {
                        return Err(Error::Corruption(format!(
                            "second-level table {} bucket {} points at table {}",
                            header, idx, sub_header
                        )));
                    }
                    let sub = recover_table(ctx, sub_header, Some(gen.capacity()), report)?;
                    table.install_subtable(idx, sub)?;
                    0
                }
            };
            let recorded = gen.node_count(idx);
            if recorded != actual {
                warn!(
                    table = %header,
                    bucket = idx,
                    recorded,
                    actual,
                    "Repairing bucket node count"
                );
                gen.set_node_count(idx, actual)?;
                report.repaired_counts += 1;
            }
        }
    }
    Ok(table)
}

/// Mark a chain's nodes, fix back links, return its length
fn recover_chain(
    alloc: &NodeAllocator,
    root: PmOffset,
    report: &mut RecoveryReport,
) -> Result<u32> {
    let region = alloc.region();
    let mut prev = PmOffset::NULL;
    let mut cur = root;
    let mut count = 0;

    while !cur.is_null() {
        // A node reached twice fails here, which also catches link cycles.
        alloc.mark_used(cur, NODE_SIZE)?;
        let node = LinkNode::load(region, cur)?;
        if node.prev() != prev {
            warn!(node = %cur, found = %node.prev(), expected = %prev, "Repairing back link");
            header::set_prev(region, cur, prev)?;
            report.repaired_links += 1;
        }
        count += 1;
        prev = cur;
        cur = node.next();
    }
    report.nodes += count as usize;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::dir::worker::BackgroundPool;
    use crate::storage::{FlushMode, PmemRegion};

    fn config() -> IndexConfig {
        IndexConfig {
            region_size: 4 * 1024 * 1024,
            first_level_capacity: 8,
            promotion_threshold: 3,
            second_level_initial_capacity: 2,
            resize_load_factor: 1.0,
            background_threads: 1,
            flush_mode: FlushMode::Fence,
        }
    }

    fn context(region: Arc<PmemRegion>) -> Arc<TableContext> {
        Arc::new(TableContext {
            alloc: Arc::new(NodeAllocator::new(region).unwrap()),
            pool: Arc::new(BackgroundPool::new(1).unwrap()),
            config: config(),
        })
    }

    #[test]
    fn test_recover_rebuilds_allocator_and_subtables() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let region = Arc::new(PmemRegion::create(
            dir.path().join("rec.pm"),
            config().region_size,
            FlushMode::Fence,
        )?);

        let ctx = context(Arc::clone(&region));
        let table = DirHashTable::create(Arc::clone(&ctx), HashLevel::First, 8)?;
        for i in 0..600u64 {
            table.put(i % 5, format!("file-{:05}", i).as_bytes(), i)?;
        }
        ctx.pool.wait_idle();
        let used = ctx.alloc.stats().used_slabs;
        let promoted = table.subtables().count();
        assert!(promoted > 0);
        let root = table.header();
        drop(table);

        // Orphan: allocated but never published
        ctx.alloc.allocate_and_init(NODE_SIZE, 0)?;

        let fresh = context(Arc::clone(&region));
        let (table, report) = recover(Arc::clone(&fresh), root)?;
        assert_eq!(report.repaired_links, 0);
        assert_eq!(report.repaired_counts, 0);
        assert_eq!(table.subtables().count(), promoted);
        assert_eq!(fresh.alloc.stats().used_slabs, used);

        for i in 0..600u64 {
            assert_eq!(table.get(i % 5, format!("file-{:05}", i).as_bytes())?, Some(i));
        }
        Ok(())
    }

    #[test]
    fn test_recover_repairs_links_and_counts() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let region = Arc::new(PmemRegion::create(
            dir.path().join("rec.pm"),
            config().region_size,
            FlushMode::Fence,
        )?);

        let mut cfg = config();
        cfg.promotion_threshold = 1000;
        let ctx = Arc::new(TableContext {
            alloc: Arc::new(NodeAllocator::new(Arc::clone(&region))?),
            pool: Arc::new(BackgroundPool::new(1)?),
            config: cfg,
        });
        let table = DirHashTable::create(Arc::clone(&ctx), HashLevel::First, 8)?;
        for i in 0..200u64 {
            table.put(8, format!("entry-{:05}", i).as_bytes(), i)?;
        }
        let (gen, _) = table.generations();
        let BucketRoot::Chain(head) = gen.bucket_root(0)? else {
            panic!("bucket 0 should hold a chain");
        };
        let second = header::next(&region, head)?;
        assert!(!second.is_null());

        // Simulate a crash between publishing a successor and its count.
        header::set_prev(&region, second, PmOffset::new(4096))?;
        let nodes = gen.node_count(0);
        gen.set_node_count(0, nodes + 3)?;
        let root = table.header();
        drop(gen);
        drop(table);

        let (table, report) = recover(context(Arc::clone(&region)), root)?;
        assert_eq!(report.repaired_links, 1);
        assert_eq!(report.repaired_counts, 1);
        assert_eq!(header::prev(&region, second)?, head);
        assert_eq!(table.generations().0.node_count(0), nodes);
        Ok(())
    }
}
