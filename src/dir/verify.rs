//! Structural checker
//!
//! Walks every table, generation and chain reachable from a table and
//! collects every violation it finds instead of stopping at the first one.
//! Each bucket is checked under its read lock, so a check can run next to
//! foreground writers.

use super::node::{cmp_key, Entry, LinkNode, NODE_SIZE};
use super::table::{DirHashTable, HashLevel};
use super::version::{BucketRoot, Generation};
use crate::error::Result;
use crate::storage::{BlockKind, PmOffset};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Findings of a structural check
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub tables: usize,
    pub generations: usize,
    pub buckets: usize,
    pub nodes: usize,
    pub entries: usize,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    fn problem(&mut self, msg: String) {
        warn!(problem = %msg, "Index check failed");
        self.problems.push(msg);
    }
}

/// Check `table` and everything below it
pub fn verify_table(table: &DirHashTable, report: &mut VerifyReport) -> Result<()> {
    verify_level(table, None, report)
}

/// `owner` is the first-level bucket a second-level table was promoted from
fn verify_level(
    table: &DirHashTable,
    owner: Option<usize>,
    report: &mut VerifyReport,
) -> Result<()> {
    report.tables += 1;
    let (current, next) = table.generations();
    for gen in std::iter::once(&current).chain(next.as_ref()) {
        report.generations += 1;
        let alloc = &table.context().alloc;
        if !alloc.is_used(gen.block(), gen.block_size()) {
            report.problem(format!("bucket array {} is not marked allocated", gen.block()));
        }
        for idx in 0..gen.capacity() as usize {
            verify_bucket(table, gen, idx, owner, report)?;
        }
    }
    debug!(table = %table.header(), problems = report.problems.len(), "Checked table");
    Ok(())
}

fn verify_bucket(
    table: &DirHashTable,
    gen: &Generation,
    idx: usize,
    owner: Option<usize>,
    report: &mut VerifyReport,
) -> Result<()> {
    let state = gen.read_bucket(idx);
    if state.drained {
        if !gen.root(idx).is_null() {
            report.problem(format!("drained bucket {} of {} still has a root", idx, gen.block()));
        }
        return Ok(());
    }
    report.buckets += 1;

    let root = match gen.bucket_root(idx) {
        Ok(root) => root,
        Err(e) => {
            let raw = gen.root(idx);
            match BlockKind::read(table.context().alloc.region(), raw) {
                Ok(BlockKind::BptreeIndex) | Ok(BlockKind::BptreeLeaf) => report.problem(format!(
                    "bucket {} of {} holds a tree at {}, which this index does not read",
                    idx,
                    gen.block(),
                    raw
                )),
                _ => report.problem(e.to_string()),
            }
            return Ok(());
        }
    };

    let nodes = match root {
        BucketRoot::Empty => 0,
        BucketRoot::Chain(head) => verify_chain(table, gen, idx, owner, head, report),
        BucketRoot::SubTable(header) => {
            match (table.level(), table.subtable(idx)) {
                (HashLevel::First, Some(sub)) if sub.header() == header => {
                    drop(state);
                    verify_level(sub, Some(idx), report)?;
                    if gen.node_count(idx) != 0 {
                        report.problem(format!(
                            "promoted bucket {} of {} counts {} nodes",
                            idx,
                            gen.block(),
                            gen.node_count(idx)
                        ));
                    }
                    return Ok(());
                }
                (HashLevel::First, _) => report.problem(format!(
                    "bucket {} of {} points at table {} that is not routed",
                    idx,
                    gen.block(),
                    header
                )),
                (HashLevel::Second { .. }, _) => report.problem(format!(
                    "second-level bucket {} of {} points at table {}",
                    idx,
                    gen.block(),
                    header
                )),
            }
            return Ok(());
        }
    };

    let recorded = gen.node_count(idx);
    if recorded != nodes {
        report.problem(format!(
            "bucket {} of {} counts {} nodes, chain has {}",
            idx,
            gen.block(),
            recorded,
            nodes
        ));
    }
    Ok(())
}

/// Check one chain and return how many nodes it has
fn verify_chain(
    table: &DirHashTable,
    gen: &Generation,
    idx: usize,
    owner: Option<usize>,
    head: PmOffset,
    report: &mut VerifyReport,
) -> u32 {
    let alloc = &table.context().alloc;
    let region = alloc.region();
    let limit = region.len() as usize / NODE_SIZE + 1;
    let level = table.level();

    let mut prev = PmOffset::NULL;
    let mut cur = head;
    let mut last: Option<Entry> = None;
    let mut count = 0u32;

    while !cur.is_null() {
        if count as usize >= limit {
            report.problem(format!("chain at {} does not terminate", head));
            break;
        }
        let node = match LinkNode::load(region, cur) {
            Ok(node) => node,
            Err(e) => {
                report.problem(e.to_string());
                break;
            }
        };
        count += 1;
        report.nodes += 1;

        if !alloc.is_used(cur, NODE_SIZE) {
            report.problem(format!("link node {} is not marked allocated", cur));
        }
        if node.prev() != prev {
            report.problem(format!(
                "link node {} has prev {}, expected {}",
                cur,
                node.prev(),
                prev
            ));
        }
        if node.is_empty() {
            report.problem(format!("link node {} is empty", cur));
        }

        let mut first_dir = None;
        let mut last_dir = None;
        for r in node.records() {
            report.entries += 1;
            first_dir.get_or_insert(r.dir);
            last_dir = Some(r.dir);

            if let Some(prev_entry) = &last {
                if cmp_key(prev_entry.key(), r.key()) != Ordering::Less {
                    report.problem(format!(
                        "link node {}: record for dir {} is out of order",
                        cur, r.dir
                    ));
                }
            }
            let expected = level.bucket(r.dir, gen.capacity());
            if expected != idx {
                report.problem(format!(
                    "dir {} found in bucket {} of {}, hashes to {}",
                    r.dir,
                    idx,
                    gen.block(),
                    expected
                ));
            }
            if let (Some(owner), HashLevel::Second { parent_capacity }) = (owner, level) {
                if (r.dir % parent_capacity) as usize != owner {
                    report.problem(format!(
                        "dir {} found under promoted bucket {}",
                        r.dir, owner
                    ));
                }
            }
            last = Some(r.to_entry());
        }

        if let (Some(first), Some(last_dir)) = (first_dir, last_dir) {
            if node.min_dir() != first || node.max_dir() != last_dir {
                report.problem(format!(
                    "link node {} records dirs {}..={} but holds {}..={}",
                    cur,
                    node.min_dir(),
                    node.max_dir(),
                    first,
                    last_dir
                ));
            }
        }

        prev = cur;
        cur = node.next();
    }
    count
}
