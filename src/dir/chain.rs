//! Overflow-chain engine
//!
//! A bucket's entries live in a doubly linked chain of link nodes, ordered by
//! `(dir, hash, name)` across the whole chain. Every structural change is
//! copy-on-write:
//!
//! 1. allocate all replacement nodes (nothing is published if this fails)
//! 2. build each image in memory and seal it (write + flush)
//! 3. publish: the successor's `prev` first, then the predecessor's `next`,
//!    or hand the new head back to the caller for the bucket root
//! 4. after the caller has published the root, free the retired nodes
//!
//! Forward links are authoritative. A crash between the steps leaves the old
//! nodes reachable; recovery repairs `prev` links and reclaims unreachable
//! nodes.
//!
//! The only in-place change is overwriting the child of an existing record,
//! a single ordered 8-byte write.
//!
//! Callers hold the bucket's write lock for mutations and at least its read
//! lock for lookups.

use super::node::{
    check_name, cmp_key, encoded_len, header, name_hash, Entry, LinkNode, NodeBuilder,
    GROUP_HEADER_SIZE, MERGE_THRESHOLD, NODE_CAPACITY, NODE_SIZE,
};
use crate::error::{Error, Result};
use crate::metrics::{NODE_MERGES, NODE_SPLITS};
use crate::storage::{NodeAllocator, PmOffset, PmemRegion};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// What insert does when the key is already present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Replace the child (foreground puts)
    Overwrite,
    /// Leave the existing record alone (migration replay)
    KeepExisting,
}

/// Result of a chain insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    Updated,
    Kept,
}

/// Where a key is, or where it would go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// Node holding (or due to hold) the key; NULL for an empty chain
    pub node: PmOffset,
    /// Some record of the directory was seen on the way
    pub dir_found: bool,
    pub found: bool,
    /// Record position inside `node` (insertion point when not found)
    pub index: usize,
    /// Offset of the child field from the node start, when found
    pub child_pos: usize,
    pub child: u64,
}

impl SearchResult {
    fn empty() -> Self {
        Self {
            node: PmOffset::NULL,
            dir_found: false,
            found: false,
            index: 0,
            child_pos: 0,
            child: 0,
        }
    }
}

/// Mutation descriptor returned by [`Chain::insert`] and [`Chain::delete`]
///
/// Sibling links are already published when the caller receives it. The
/// caller publishes `new_root` into the bucket when it changed, then calls
/// [`ChainOp::finish`] to release the retired nodes.
#[must_use]
#[derive(Debug)]
pub struct ChainOp<T> {
    pub root: PmOffset,
    pub new_root: PmOffset,
    pub allocated: Vec<PmOffset>,
    pub retired: Vec<PmOffset>,
    pub outcome: T,
}

impl<T> ChainOp<T> {
    fn unchanged(root: PmOffset, outcome: T) -> Self {
        Self {
            root,
            new_root: root,
            allocated: Vec::new(),
            retired: Vec::new(),
            outcome,
        }
    }

    pub fn root_changed(&self) -> bool {
        self.root != self.new_root
    }

    /// Change in the chain's node count
    pub fn node_delta(&self) -> i64 {
        self.allocated.len() as i64 - self.retired.len() as i64
    }

    /// Free the retired nodes. Only call once the new structure is published.
    pub fn finish(self, alloc: &NodeAllocator) -> Result<T> {
        for off in &self.retired {
            alloc.free(*off, NODE_SIZE)?;
        }
        Ok(self.outcome)
    }

    /// Free the nodes this operation allocated. Only valid for a detached
    /// chain from [`Chain::build`] whose root was never published.
    pub fn abandon(self, alloc: &NodeAllocator) {
        for off in &self.allocated {
            if let Err(e) = alloc.free(*off, NODE_SIZE) {
                warn!(%off, error = %e, "Failed to release unpublished node");
            }
        }
    }
}

/// One overflow chain, identified by its head node
pub struct Chain<'a> {
    alloc: &'a NodeAllocator,
    root: PmOffset,
}

impl<'a> Chain<'a> {
    pub fn new(alloc: &'a NodeAllocator, root: PmOffset) -> Self {
        Self { alloc, root }
    }

    pub fn root(&self) -> PmOffset {
        self.root
    }

    fn region(&self) -> &'a PmemRegion {
        self.alloc.region()
    }

    /// Upper bound on chain length; exceeding it means a link cycle
    fn step_limit(&self) -> usize {
        self.region().len() as usize / NODE_SIZE + 1
    }

    /// Locate `(dir, hash, name)`, skipping nodes by their header alone when
    /// their max identifier is below `dir`
    pub fn search(&self, dir: u64, hash: u64, name: &[u8]) -> Result<SearchResult> {
        let region = self.region();
        let limit = self.step_limit();
        let mut dir_found = false;
        let mut cur = self.root;
        let mut steps = 0;

        while !cur.is_null() {
            steps += 1;
            if steps > limit {
                return Err(Error::Corruption(format!(
                    "chain at {} does not terminate",
                    self.root
                )));
            }

            let next = header::next(region, cur)?;
            if header::max(region, cur)? < dir && !next.is_null() {
                cur = next;
                continue;
            }

            let node = LinkNode::load(region, cur)?;
            let mut index = 0;
            for rec in node.records() {
                if rec.dir == dir {
                    dir_found = true;
                }
                match cmp_key(rec.key(), (dir, hash, name)) {
                    Ordering::Less => index += 1,
                    Ordering::Equal => {
                        return Ok(SearchResult {
                            node: cur,
                            dir_found,
                            found: true,
                            index,
                            child_pos: rec.child_pos,
                            child: rec.child,
                        });
                    }
                    Ordering::Greater => {
                        return Ok(SearchResult {
                            node: cur,
                            dir_found,
                            index,
                            ..SearchResult::empty()
                        });
                    }
                }
            }

            // Everything here sorts before the key; the directory's group may
            // continue in the next node.
            if !next.is_null() && header::min(region, next)? <= dir {
                cur = next;
                continue;
            }
            return Ok(SearchResult {
                node: cur,
                dir_found,
                index,
                ..SearchResult::empty()
            });
        }

        Ok(SearchResult::empty())
    }

    /// Child stored under `(dir, name)`
    pub fn get(&self, dir: u64, name: &[u8]) -> Result<Option<u64>> {
        let found = self.search(dir, name_hash(name), name)?;
        Ok(found.found.then_some(found.child))
    }

    /// Insert or update `(dir, name) → child`
    pub fn insert(
        &self,
        dir: u64,
        name: &[u8],
        child: u64,
        mode: InsertMode,
    ) -> Result<ChainOp<InsertResult>> {
        check_name(name)?;
        let hash = name_hash(name);
        let found = self.search(dir, hash, name)?;

        if found.found {
            return match mode {
                InsertMode::KeepExisting => Ok(ChainOp::unchanged(self.root, InsertResult::Kept)),
                InsertMode::Overwrite => {
                    if found.child != child {
                        self.region()
                            .write_ordered_u64(found.node.add(found.child_pos as u64), child)?;
                    }
                    Ok(ChainOp::unchanged(self.root, InsertResult::Updated))
                }
            };
        }

        let entry = Entry {
            dir,
            hash,
            name: name.to_vec(),
            child,
        };
        if found.node.is_null() {
            return self.replace_run(
                &[],
                PmOffset::NULL,
                PmOffset::NULL,
                vec![vec![entry]],
                InsertResult::Inserted,
            );
        }

        let node = LinkNode::load(self.region(), found.node)?;
        let mut entries = node.entries();
        entries.insert(found.index, entry);

        let parts = if encoded_len(&entries) <= NODE_CAPACITY {
            vec![entries]
        } else {
            let parts = split(entries);
            NODE_SPLITS.inc();
            debug!(node = %node.off(), parts = parts.len(), "Splitting link node");
            parts
        };
        self.replace_run(
            &[node.off()],
            node.prev(),
            node.next(),
            parts,
            InsertResult::Inserted,
        )
    }

    /// Remove `(dir, name)`; the outcome says whether it was present
    pub fn delete(&self, dir: u64, name: &[u8]) -> Result<ChainOp<bool>> {
        let hash = name_hash(name);
        let found = self.search(dir, hash, name)?;
        if !found.found {
            return Ok(ChainOp::unchanged(self.root, false));
        }

        let region = self.region();
        let node = LinkNode::load(region, found.node)?;
        let mut entries = node.entries();
        entries.remove(found.index);

        if entries.is_empty() {
            debug!(node = %node.off(), "Unlinking emptied link node");
            return self.replace_run(&[node.off()], node.prev(), node.next(), vec![], true);
        }

        if encoded_len(&entries) < MERGE_THRESHOLD {
            if !node.next().is_null() {
                let sibling = LinkNode::load(region, node.next())?;
                let mut merged = entries.clone();
                merged.extend(sibling.entries());
                if encoded_len(&merged) <= NODE_CAPACITY {
                    NODE_MERGES.inc();
                    debug!(node = %node.off(), with = %sibling.off(), "Merging with next sibling");
                    return self.replace_run(
                        &[node.off(), sibling.off()],
                        node.prev(),
                        sibling.next(),
                        vec![merged],
                        true,
                    );
                }
            }
            if !node.prev().is_null() {
                let sibling = LinkNode::load(region, node.prev())?;
                let mut merged = sibling.entries();
                merged.extend(entries.iter().cloned());
                if encoded_len(&merged) <= NODE_CAPACITY {
                    NODE_MERGES.inc();
                    debug!(node = %node.off(), with = %sibling.off(), "Merging with previous sibling");
                    return self.replace_run(
                        &[sibling.off(), node.off()],
                        sibling.prev(),
                        node.next(),
                        vec![merged],
                        true,
                    );
                }
            }
        }

        self.replace_run(&[node.off()], node.prev(), node.next(), vec![entries], true)
    }

    /// Replace the consecutive nodes `old` (between `pred` and `succ`) with
    /// fresh nodes holding `parts`
    fn replace_run<T>(
        &self,
        old: &[PmOffset],
        pred: PmOffset,
        succ: PmOffset,
        parts: Vec<Vec<Entry>>,
        outcome: T,
    ) -> Result<ChainOp<T>> {
        let region = self.region();

        let mut allocated = Vec::with_capacity(parts.len());
        for _ in &parts {
            match self.alloc.allocate(NODE_SIZE) {
                Ok(off) => allocated.push(off),
                Err(e) => {
                    self.release(&allocated);
                    return Err(e);
                }
            }
        }

        for (i, part) in parts.iter().enumerate() {
            let prev = if i == 0 { pred } else { allocated[i - 1] };
            let next = allocated.get(i + 1).copied().unwrap_or(succ);
            let sealed = NodeBuilder::from_entries(part)
                .and_then(|builder| builder.seal(region, allocated[i], prev, next));
            if let Err(e) = sealed {
                self.release(&allocated);
                return Err(e);
            }
        }

        let first = allocated.first().copied().unwrap_or(succ);
        let last = allocated.last().copied().unwrap_or(pred);
        if !succ.is_null() {
            header::set_prev(region, succ, last)?;
        }
        let new_root = if pred.is_null() {
            first
        } else {
            header::set_next(region, pred, first)?;
            self.root
        };

        Ok(ChainOp {
            root: self.root,
            new_root,
            allocated,
            retired: old.to_vec(),
            outcome,
        })
    }

    /// Build a detached chain holding `entries`, which must be in key order
    ///
    /// Nothing points at the new nodes until the caller publishes `new_root`.
    /// On failure every node allocated so far is released.
    pub fn build(alloc: &'a NodeAllocator, entries: Vec<Entry>) -> Result<ChainOp<()>> {
        let parts = if entries.is_empty() {
            Vec::new()
        } else if encoded_len(&entries) <= NODE_CAPACITY {
            vec![entries]
        } else {
            split(entries)
        };
        Chain::new(alloc, PmOffset::NULL).replace_run(&[], PmOffset::NULL, PmOffset::NULL, parts, ())
    }

    fn release(&self, nodes: &[PmOffset]) {
        for off in nodes {
            if let Err(e) = self.alloc.free(*off, NODE_SIZE) {
                warn!(%off, error = %e, "Failed to release unpublished node");
            }
        }
    }

    /// Every record of the chain in key order
    pub fn collect_all(&self) -> Result<Vec<Entry>> {
        self.cursor().collect()
    }

    /// Records of one directory, in `(hash, name)` order
    pub fn collect_dir(&self, dir: u64) -> Result<Vec<Entry>> {
        let region = self.region();
        let limit = self.step_limit();
        let mut out = Vec::new();
        let mut cur = self.root;
        let mut steps = 0;

        while !cur.is_null() {
            steps += 1;
            if steps > limit {
                return Err(Error::Corruption(format!(
                    "chain at {} does not terminate",
                    self.root
                )));
            }
            if header::min(region, cur)? > dir {
                break;
            }
            let next = header::next(region, cur)?;
            if header::max(region, cur)? >= dir {
                let node = LinkNode::load(region, cur)?;
                out.extend(node.records().filter(|r| r.dir == dir).map(|r| r.to_entry()));
            }
            cur = next;
        }
        Ok(out)
    }

    /// Handles of every node, head first
    pub fn node_offsets(&self) -> Result<Vec<PmOffset>> {
        let region = self.region();
        let limit = self.step_limit();
        let mut out = Vec::new();
        let mut cur = self.root;
        while !cur.is_null() {
            if out.len() >= limit {
                return Err(Error::Corruption(format!(
                    "chain at {} does not terminate",
                    self.root
                )));
            }
            out.push(cur);
            cur = header::next(region, cur)?;
        }
        Ok(out)
    }

    pub fn cursor(&self) -> ChainCursor<'a> {
        ChainCursor::new(self.region(), self.root)
    }
}

/// Split an overfull run into two or more parts of roughly equal encoded
/// size, each fitting a node
fn split(entries: Vec<Entry>) -> Vec<Vec<Entry>> {
    let total = encoded_len(&entries);
    let wanted = total.div_ceil(NODE_CAPACITY).max(2);
    let target = total / wanted;

    let mut parts = Vec::with_capacity(wanted);
    let mut cur: Vec<Entry> = Vec::new();
    let mut cur_len = 0;
    for e in entries {
        let same_group = cur.last().is_some_and(|last| last.dir == e.dir);
        let cost = e.record_len() + if same_group { 0 } else { GROUP_HEADER_SIZE };
        let full = cur_len + cost > NODE_CAPACITY;
        let balanced = cur_len >= target && parts.len() + 1 < wanted;
        if !cur.is_empty() && (full || balanced) {
            parts.push(std::mem::take(&mut cur));
            cur_len = e.record_len() + GROUP_HEADER_SIZE;
        } else {
            cur_len += cost;
        }
        cur.push(e);
    }
    parts.push(cur);
    parts
}

/// Record-by-record walk over a chain, following `next` links
pub struct ChainCursor<'a> {
    region: &'a PmemRegion,
    next: PmOffset,
    buffered: std::vec::IntoIter<Entry>,
    steps: usize,
    limit: usize,
    failed: bool,
}

impl<'a> ChainCursor<'a> {
    pub fn new(region: &'a PmemRegion, root: PmOffset) -> Self {
        Self {
            region,
            next: root,
            buffered: Vec::new().into_iter(),
            steps: 0,
            limit: region.len() as usize / NODE_SIZE + 1,
            failed: false,
        }
    }
}

impl Iterator for ChainCursor<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        loop {
            if let Some(e) = self.buffered.next() {
                return Some(Ok(e));
            }
            if self.failed || self.next.is_null() {
                return None;
            }
            self.steps += 1;
            if self.steps > self.limit {
                self.failed = true;
                return Some(Err(Error::Corruption("chain does not terminate".to_string())));
            }
            match LinkNode::load(self.region, self.next) {
                Ok(node) => {
                    self.next = node.next();
                    self.buffered = node.entries().into_iter();
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FlushMode;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn allocator(size: u64) -> (tempfile::TempDir, NodeAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let region =
            PmemRegion::create(dir.path().join("chain.pm"), size, FlushMode::Fence).unwrap();
        let alloc = NodeAllocator::new(Arc::new(region)).unwrap();
        (dir, alloc)
    }

    fn put(
        alloc: &NodeAllocator,
        root: &mut PmOffset,
        dir: u64,
        name: &[u8],
        child: u64,
    ) -> Result<InsertResult> {
        let op = Chain::new(alloc, *root).insert(dir, name, child, InsertMode::Overwrite)?;
        *root = op.new_root;
        op.finish(alloc)
    }

    fn del(alloc: &NodeAllocator, root: &mut PmOffset, dir: u64, name: &[u8]) -> Result<bool> {
        let op = Chain::new(alloc, *root).delete(dir, name)?;
        *root = op.new_root;
        op.finish(alloc)
    }

    /// Check ordering, sibling links and min/max across the whole chain
    fn check_chain(alloc: &NodeAllocator, root: PmOffset) -> Result<usize> {
        let region = alloc.region();
        let mut prev = PmOffset::NULL;
        let mut last: Option<Entry> = None;
        let mut cur = root;
        let mut nodes = 0;
        while !cur.is_null() {
            let node = LinkNode::load(region, cur)?;
            assert_eq!(node.prev(), prev, "back link of {}", cur);
            assert!(!node.is_empty(), "empty node {} left in chain", cur);
            let entries = node.entries();
            assert_eq!(node.min_dir(), entries[0].dir);
            assert_eq!(node.max_dir(), entries[entries.len() - 1].dir);
            for e in entries {
                if let Some(l) = &last {
                    assert_eq!(cmp_key(l.key(), e.key()), Ordering::Less);
                }
                last = Some(e);
            }
            prev = cur;
            cur = node.next();
            nodes += 1;
        }
        Ok(nodes)
    }

    #[test]
    fn test_insert_get_update() -> Result<()> {
        let (_dir, alloc) = allocator(256 * 1024);
        let mut root = PmOffset::NULL;

        assert_eq!(put(&alloc, &mut root, 5, b"a", 100)?, InsertResult::Inserted);
        assert!(!root.is_null());
        assert_eq!(put(&alloc, &mut root, 5, b"a", 200)?, InsertResult::Updated);
        assert_eq!(Chain::new(&alloc, root).get(5, b"a")?, Some(200));
        assert_eq!(Chain::new(&alloc, root).get(5, b"b")?, None);
        assert_eq!(Chain::new(&alloc, root).get(6, b"a")?, None);
        Ok(())
    }

    #[test]
    fn test_update_is_in_place() -> Result<()> {
        let (_dir, alloc) = allocator(256 * 1024);
        let mut root = PmOffset::NULL;
        put(&alloc, &mut root, 1, b"x", 1)?;
        let used = alloc.stats().used_slabs;

        let op = Chain::new(&alloc, root).insert(1, b"x", 2, InsertMode::Overwrite)?;
        assert!(!op.root_changed());
        assert!(op.allocated.is_empty());
        op.finish(&alloc)?;
        assert_eq!(alloc.stats().used_slabs, used);
        assert_eq!(Chain::new(&alloc, root).get(1, b"x")?, Some(2));
        Ok(())
    }

    #[test]
    fn test_keep_existing() -> Result<()> {
        let (_dir, alloc) = allocator(256 * 1024);
        let mut root = PmOffset::NULL;
        put(&alloc, &mut root, 1, b"x", 1)?;

        let op = Chain::new(&alloc, root).insert(1, b"x", 9, InsertMode::KeepExisting)?;
        assert_eq!(op.finish(&alloc)?, InsertResult::Kept);
        assert_eq!(Chain::new(&alloc, root).get(1, b"x")?, Some(1));
        Ok(())
    }

    #[test]
    fn test_split_keeps_order() -> Result<()> {
        let (_dir, alloc) = allocator(1024 * 1024);
        let mut root = PmOffset::NULL;

        for i in 0..200u64 {
            let name = format!("{:08x}", i);
            put(&alloc, &mut root, i % 7, name.as_bytes(), i)?;
        }
        let nodes = check_chain(&alloc, root)?;
        assert!(nodes >= 2);
        assert_eq!(Chain::new(&alloc, root).node_offsets()?.len(), nodes);

        for i in 0..200u64 {
            let name = format!("{:08x}", i);
            assert_eq!(Chain::new(&alloc, root).get(i % 7, name.as_bytes())?, Some(i));
        }
        assert_eq!(Chain::new(&alloc, root).collect_all()?.len(), 200);
        assert_eq!(Chain::new(&alloc, root).collect_dir(3)?.len(), 29);
        Ok(())
    }

    #[test]
    fn test_split_parts_fit() {
        let entries: Vec<Entry> = (0..10u64)
            .map(|i| Entry::new(1, &[b'a' + i as u8; 200], i))
            .collect();
        let mut entries = entries;
        entries.sort_by(|a, b| cmp_key(a.key(), b.key()));

        let parts = split(entries);
        assert!(parts.len() >= 3);
        for part in &parts {
            assert!(!part.is_empty());
            assert!(encoded_len(part) <= NODE_CAPACITY);
        }
    }

    #[test]
    fn test_delete_unlinks_and_merges() -> Result<()> {
        let (_dir, alloc) = allocator(1024 * 1024);
        let mut root = PmOffset::NULL;
        let baseline = alloc.stats().used_slabs;

        for i in 0..120u64 {
            put(&alloc, &mut root, 1, format!("entry-{:04}", i).as_bytes(), i)?;
        }
        let before = check_chain(&alloc, root)?;
        assert!(before >= 3);

        for i in 0..110u64 {
            assert!(del(&alloc, &mut root, 1, format!("entry-{:04}", i).as_bytes())?);
            check_chain(&alloc, root)?;
        }
        assert!(check_chain(&alloc, root)? < before);

        for i in 110..120u64 {
            assert!(del(&alloc, &mut root, 1, format!("entry-{:04}", i).as_bytes())?);
        }
        assert!(root.is_null());
        assert_eq!(alloc.stats().used_slabs, baseline);
        Ok(())
    }

    #[test]
    fn test_delete_missing() -> Result<()> {
        let (_dir, alloc) = allocator(256 * 1024);
        let mut root = PmOffset::NULL;
        assert!(!del(&alloc, &mut root, 7, b"x")?);
        put(&alloc, &mut root, 7, b"x", 1)?;
        assert!(!del(&alloc, &mut root, 7, b"y")?);
        assert!(del(&alloc, &mut root, 7, b"x")?);
        assert!(!del(&alloc, &mut root, 7, b"x")?);
        assert!(root.is_null());
        Ok(())
    }

    #[test]
    fn test_oversized_name_rejected() -> Result<()> {
        let (_dir, alloc) = allocator(256 * 1024);
        let mut root = PmOffset::NULL;
        put(&alloc, &mut root, 1, b"keep", 1)?;
        let used = alloc.stats().used_slabs;

        let long = vec![b'n'; 300];
        assert!(matches!(
            put(&alloc, &mut root, 1, &long, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(alloc.stats().used_slabs, used);
        assert_eq!(Chain::new(&alloc, root).get(1, b"keep")?, Some(1));
        Ok(())
    }

    #[test]
    fn test_out_of_space_leaves_chain_intact() -> Result<()> {
        let (_dir, alloc) = allocator(8 * 1024);
        let mut root = PmOffset::NULL;

        let mut inserted = Vec::new();
        let mut i = 0u64;
        loop {
            let name = format!("{:0>40}", i);
            match put(&alloc, &mut root, 1, name.as_bytes(), i) {
                Ok(_) => inserted.push((name, i)),
                Err(Error::OutOfSpace(_)) => break,
                Err(e) => return Err(e),
            }
            i += 1;
        }
        assert!(!inserted.is_empty());
        check_chain(&alloc, root)?;
        for (name, child) in inserted {
            assert_eq!(Chain::new(&alloc, root).get(1, name.as_bytes())?, Some(child));
        }
        Ok(())
    }

    #[test]
    fn test_build_detached_chain() -> Result<()> {
        let (_dir, alloc) = allocator(1024 * 1024);
        let baseline = alloc.stats().used_slabs;
        let mut entries: Vec<Entry> = (0..150u64)
            .map(|i| Entry::new(i % 5, format!("built-{:04}", i).as_bytes(), i))
            .collect();
        entries.sort_by(|a, b| cmp_key(a.key(), b.key()));

        let op = Chain::build(&alloc, entries.clone())?;
        assert!(op.allocated.len() >= 2);
        let root = op.new_root;
        assert_eq!(check_chain(&alloc, root)?, op.allocated.len());
        assert_eq!(Chain::new(&alloc, root).collect_all()?, entries);

        op.abandon(&alloc);
        assert_eq!(alloc.stats().used_slabs, baseline);

        let empty = Chain::build(&alloc, Vec::new())?;
        assert!(empty.new_root.is_null());
        assert!(empty.allocated.is_empty());
        Ok(())
    }

    #[test]
    fn test_build_out_of_space_releases_nodes() -> Result<()> {
        let (_dir, alloc) = allocator(4 * 1024);
        let baseline = alloc.stats().used_slabs;
        let mut entries: Vec<Entry> = (0..200u64)
            .map(|i| Entry::new(1, format!("{:0>40}", i).as_bytes(), i))
            .collect();
        entries.sort_by(|a, b| cmp_key(a.key(), b.key()));

        assert!(matches!(Chain::build(&alloc, entries), Err(Error::OutOfSpace(_))));
        assert_eq!(alloc.stats().used_slabs, baseline);
        Ok(())
    }

    #[derive(Debug, Clone)]
    enum ModelOp {
        Put(u64, u8, u64),
        Delete(u64, u8),
    }

    fn model_op() -> impl Strategy<Value = ModelOp> {
        prop_oneof![
            (0u64..4, any::<u8>(), any::<u64>()).prop_map(|(d, n, c)| ModelOp::Put(d, n, c)),
            (0u64..4, any::<u8>()).prop_map(|(d, n)| ModelOp::Delete(d, n)),
        ]
    }

    fn model_name(n: u8) -> Vec<u8> {
        // Mix of short and long names so nodes split and merge
        let len = 1 + (n as usize * 7) % 120;
        let mut name = format!("{:03}-", n).into_bytes();
        name.resize(len.max(name.len()), b'z');
        name
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_chain_matches_model(ops in prop::collection::vec(model_op(), 1..300)) {
            let (_dir, alloc) = allocator(4 * 1024 * 1024);
            let mut root = PmOffset::NULL;
            let mut model: BTreeMap<(u64, Vec<u8>), u64> = BTreeMap::new();

            for op in ops {
                match op {
                    ModelOp::Put(d, n, c) => {
                        let name = model_name(n);
                        let result = put(&alloc, &mut root, d, &name, c).unwrap();
                        let expected = if model.insert((d, name), c).is_some() {
                            InsertResult::Updated
                        } else {
                            InsertResult::Inserted
                        };
                        prop_assert_eq!(result, expected);
                    }
                    ModelOp::Delete(d, n) => {
                        let name = model_name(n);
                        let removed = del(&alloc, &mut root, d, &name).unwrap();
                        prop_assert_eq!(removed, model.remove(&(d, name)).is_some());
                    }
                }
            }

            check_chain(&alloc, root).unwrap();
            let chain = Chain::new(&alloc, root);
            let stored = chain.collect_all().unwrap();
            prop_assert_eq!(stored.len(), model.len());
            for ((d, name), c) in &model {
                prop_assert_eq!(chain.get(*d, name).unwrap(), Some(*c));
            }
        }
    }
}
