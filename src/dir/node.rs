//! Link node format
//!
//! A link node is one 1 KiB block of an overflow chain:
//!
//! ```text
//! 0   tag          u8    BlockKind::Link
//! 1   padding      u8
//! 2   groups       u16   identifier groups in the buffer
//! 4   used         u32   bytes of the buffer in use
//! 8   min          u64   first directory id present
//! 16  max          u64   last directory id present
//! 24  prev         u64   previous sibling (NULL at the head)
//! 32  next         u64   next sibling (NULL at the tail)
//! 40  buffer       984 bytes
//! ```
//!
//! The buffer is a sequence of identifier groups. Each group is a 16-byte
//! header `dir | count | names_len` followed by `count` records
//! `hash(8) | value_len(4) | name | child(8)` with `value_len = name_len + 8`.
//!
//! Records are strictly ordered by `(dir, hash, name)` inside a node and
//! across the siblings of a chain, so one directory's group may continue in
//! the next node.

use crate::error::{Error, Result};
use crate::storage::{BlockKind, NodeAllocator, PmOffset, PmemRegion};
use std::cmp::Ordering;
use tracing::debug;

/// Size of a link node
pub const NODE_SIZE: usize = 1024;

/// Size of the link node header
pub const NODE_HEADER_SIZE: usize = 40;

/// Bytes available for records in one node
pub const NODE_CAPACITY: usize = NODE_SIZE - NODE_HEADER_SIZE;

/// `dir | count | names_len`
pub const GROUP_HEADER_SIZE: usize = 16;

/// `hash | value_len | child` around the name bytes
pub const RECORD_OVERHEAD: usize = 20;

/// Longest accepted entry name
pub const MAX_NAME_LEN: usize = 255;

/// A node shrunk below this many used bytes is merged into a sibling
pub const MERGE_THRESHOLD: usize = NODE_CAPACITY / 4;

const OFF_GROUPS: usize = 2;
const OFF_USED: usize = 4;
const OFF_MIN: u64 = 8;
const OFF_MAX: u64 = 16;
const OFF_PREV: u64 = 24;
const OFF_NEXT: u64 = 32;

/// Hash of an entry name. Persisted, so it must stay stable across builds.
pub fn name_hash(name: &[u8]) -> u64 {
    twox_hash::xxh3::hash64(name)
}

/// Reject names that cannot be stored
pub fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("entry name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "entry name of {} bytes exceeds {} bytes",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Compare a record key against `(dir, hash, name)`
pub fn cmp_key(a: (u64, u64, &[u8]), b: (u64, u64, &[u8])) -> Ordering {
    a.0.cmp(&b.0)
        .then(a.1.cmp(&b.1))
        .then_with(|| a.2.cmp(b.2))
}

/// One directory entry in process memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dir: u64,
    pub hash: u64,
    pub name: Vec<u8>,
    pub child: u64,
}

impl Entry {
    pub fn new(dir: u64, name: &[u8], child: u64) -> Self {
        Self {
            dir,
            hash: name_hash(name),
            name: name.to_vec(),
            child,
        }
    }

    pub fn key(&self) -> (u64, u64, &[u8]) {
        (self.dir, self.hash, &self.name)
    }

    /// Encoded size of the record, excluding any group header
    pub fn record_len(&self) -> usize {
        RECORD_OVERHEAD + self.name.len()
    }
}

/// Encoded buffer size of an ordered run of entries
pub fn encoded_len(entries: &[Entry]) -> usize {
    let mut len = 0;
    let mut last_dir = None;
    for e in entries {
        if last_dir != Some(e.dir) {
            len += GROUP_HEADER_SIZE;
            last_dir = Some(e.dir);
        }
        len += e.record_len();
    }
    len
}

/// A record borrowed from a loaded node
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub dir: u64,
    pub hash: u64,
    pub name: &'a [u8],
    pub child: u64,
    /// Byte offset of the child field from the node start
    pub child_pos: usize,
}

impl Record<'_> {
    pub fn key(&self) -> (u64, u64, &[u8]) {
        (self.dir, self.hash, self.name)
    }

    pub fn to_entry(&self) -> Entry {
        Entry {
            dir: self.dir,
            hash: self.hash,
            name: self.name.to_vec(),
            child: self.child,
        }
    }
}

fn get_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

fn get_u32(buf: &[u8], pos: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], pos: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(b)
}

fn put_u32(buf: &mut [u8], pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], pos: usize, v: u64) {
    buf[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
}

/// Header field access without loading the whole node
pub mod header {
    use super::*;

    fn field(region: &PmemRegion, node: PmOffset, at: u64) -> Result<PmOffset> {
        region.check_range(node, NODE_SIZE)?;
        Ok(node.add(at))
    }

    pub fn min(region: &PmemRegion, node: PmOffset) -> Result<u64> {
        Ok(region.read_u64(field(region, node, OFF_MIN)?))
    }

    pub fn max(region: &PmemRegion, node: PmOffset) -> Result<u64> {
        Ok(region.read_u64(field(region, node, OFF_MAX)?))
    }

    pub fn prev(region: &PmemRegion, node: PmOffset) -> Result<PmOffset> {
        Ok(PmOffset::new(region.read_u64(field(region, node, OFF_PREV)?)))
    }

    pub fn next(region: &PmemRegion, node: PmOffset) -> Result<PmOffset> {
        Ok(PmOffset::new(region.read_u64(field(region, node, OFF_NEXT)?)))
    }

    /// Ordered publish of a back link
    pub fn set_prev(region: &PmemRegion, node: PmOffset, prev: PmOffset) -> Result<()> {
        region.write_ordered_u64(field(region, node, OFF_PREV)?, prev.get())
    }

    /// Ordered publish of a forward link
    pub fn set_next(region: &PmemRegion, node: PmOffset, next: PmOffset) -> Result<()> {
        region.write_ordered_u64(field(region, node, OFF_NEXT)?, next.get())
    }
}

/// A link node copied out of the region and structurally validated
pub struct LinkNode {
    off: PmOffset,
    buf: [u8; NODE_SIZE],
}

impl LinkNode {
    /// Copy the node at `off` and check that its buffer parses
    pub fn load(region: &PmemRegion, off: PmOffset) -> Result<Self> {
        region.check_range(off, NODE_SIZE)?;
        let mut buf = [0u8; NODE_SIZE];
        region.read_into(off, &mut buf);

        let node = Self { off, buf };
        node.validate()?;
        Ok(node)
    }

    fn corrupt(&self, what: impl std::fmt::Display) -> Error {
        Error::Corruption(format!("link node {}: {}", self.off, what))
    }

    fn validate(&self) -> Result<()> {
        if self.buf[0] != BlockKind::Link.tag() {
            return Err(self.corrupt(format_args!("tag {:#04x}", self.buf[0])));
        }
        let used = self.used();
        if used > NODE_CAPACITY {
            return Err(self.corrupt(format_args!("used {} exceeds capacity", used)));
        }

        let end = NODE_HEADER_SIZE + used;
        let mut pos = NODE_HEADER_SIZE;
        for _ in 0..self.groups() {
            if pos + GROUP_HEADER_SIZE > end {
                return Err(self.corrupt("group header past used length"));
            }
            let count = get_u32(&self.buf, pos + 8) as usize;
            let names_len = get_u32(&self.buf, pos + 12) as usize;
            let group_end = pos + GROUP_HEADER_SIZE + names_len;
            if group_end > end {
                return Err(self.corrupt("group past used length"));
            }
            pos += GROUP_HEADER_SIZE;
            for _ in 0..count {
                if pos + 12 > group_end {
                    return Err(self.corrupt("record header past group"));
                }
                let value_len = get_u32(&self.buf, pos + 8) as usize;
                if value_len <= 8 || value_len - 8 > MAX_NAME_LEN {
                    return Err(self.corrupt(format_args!("value length {}", value_len)));
                }
                pos += 12 + value_len;
                if pos > group_end {
                    return Err(self.corrupt("record past group"));
                }
            }
            if pos != group_end {
                return Err(self.corrupt("group length mismatch"));
            }
        }
        if pos != end {
            return Err(self.corrupt(format_args!("{} trailing bytes", end - pos)));
        }
        Ok(())
    }

    pub fn off(&self) -> PmOffset {
        self.off
    }

    pub fn groups(&self) -> u16 {
        get_u16(&self.buf, OFF_GROUPS)
    }

    pub fn used(&self) -> usize {
        get_u32(&self.buf, OFF_USED) as usize
    }

    pub fn min_dir(&self) -> u64 {
        get_u64(&self.buf, OFF_MIN as usize)
    }

    pub fn max_dir(&self) -> u64 {
        get_u64(&self.buf, OFF_MAX as usize)
    }

    pub fn prev(&self) -> PmOffset {
        PmOffset::new(get_u64(&self.buf, OFF_PREV as usize))
    }

    pub fn next(&self) -> PmOffset {
        PmOffset::new(get_u64(&self.buf, OFF_NEXT as usize))
    }

    pub fn records(&self) -> RecordIter<'_> {
        RecordIter {
            buf: &self.buf,
            pos: NODE_HEADER_SIZE,
            groups_left: self.groups(),
            group_left: 0,
            dir: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.groups() == 0
    }

    /// Decode every record into owned entries
    pub fn entries(&self) -> Vec<Entry> {
        self.records().map(|r| r.to_entry()).collect()
    }
}

/// Iterator over the records of a validated node
pub struct RecordIter<'a> {
    buf: &'a [u8],
    pos: usize,
    groups_left: u16,
    group_left: u32,
    dir: u64,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        while self.group_left == 0 {
            if self.groups_left == 0 {
                return None;
            }
            self.dir = get_u64(self.buf, self.pos);
            self.group_left = get_u32(self.buf, self.pos + 8);
            self.groups_left -= 1;
            self.pos += GROUP_HEADER_SIZE;
        }

        let hash = get_u64(self.buf, self.pos);
        let value_len = get_u32(self.buf, self.pos + 8) as usize;
        let name_start = self.pos + 12;
        let child_pos = name_start + value_len - 8;
        let record = Record {
            dir: self.dir,
            hash,
            name: &self.buf[name_start..child_pos],
            child: get_u64(self.buf, child_pos),
            child_pos,
        };
        self.pos = child_pos + 8;
        self.group_left -= 1;
        Some(record)
    }
}

/// Assembles a new node image in process memory
///
/// Records must be pushed in key order. The image reaches the region only in
/// [`NodeBuilder::seal`], which writes and flushes it as a whole before any
/// sibling or bucket is pointed at it.
pub struct NodeBuilder {
    buf: [u8; NODE_SIZE],
    pos: usize,
    groups: u16,
    group_start: usize,
    last_dir: Option<u64>,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBuilder {
    pub fn new() -> Self {
        let mut buf = [0u8; NODE_SIZE];
        buf[0] = BlockKind::Link.tag();
        Self {
            buf,
            pos: NODE_HEADER_SIZE,
            groups: 0,
            group_start: NODE_HEADER_SIZE,
            last_dir: None,
        }
    }

    /// Build an image holding all of `entries`
    pub fn from_entries(entries: &[Entry]) -> Result<Self> {
        let mut builder = Self::new();
        for e in entries {
            builder.push(e)?;
        }
        Ok(builder)
    }

    /// Bytes of buffer in use so far
    pub fn used(&self) -> usize {
        self.pos - NODE_HEADER_SIZE
    }

    fn cost(&self, e: &Entry) -> usize {
        let group = if self.last_dir == Some(e.dir) { 0 } else { GROUP_HEADER_SIZE };
        group + e.record_len()
    }

    pub fn fits(&self, e: &Entry) -> bool {
        self.used() + self.cost(e) <= NODE_CAPACITY
    }

    pub fn push(&mut self, e: &Entry) -> Result<()> {
        if !self.fits(e) {
            return Err(Error::Internal(format!(
                "record of {} bytes does not fit node with {} bytes used",
                e.record_len(),
                self.used()
            )));
        }

        if self.last_dir != Some(e.dir) {
            if self.last_dir.is_none() {
                put_u64(&mut self.buf, OFF_MIN as usize, e.dir);
            }
            self.group_start = self.pos;
            put_u64(&mut self.buf, self.pos, e.dir);
            put_u32(&mut self.buf, self.pos + 8, 0);
            put_u32(&mut self.buf, self.pos + 12, 0);
            self.pos += GROUP_HEADER_SIZE;
            self.groups += 1;
            self.last_dir = Some(e.dir);
            put_u64(&mut self.buf, OFF_MAX as usize, e.dir);
        }

        let value_len = (e.name.len() + 8) as u32;
        put_u64(&mut self.buf, self.pos, e.hash);
        put_u32(&mut self.buf, self.pos + 8, value_len);
        let name_start = self.pos + 12;
        self.buf[name_start..name_start + e.name.len()].copy_from_slice(&e.name);
        put_u64(&mut self.buf, name_start + e.name.len(), e.child);
        self.pos = name_start + e.name.len() + 8;

        let gs = self.group_start;
        let count = get_u32(&self.buf, gs + 8) + 1;
        let names_len = get_u32(&self.buf, gs + 12) + e.record_len() as u32;
        put_u32(&mut self.buf, gs + 8, count);
        put_u32(&mut self.buf, gs + 12, names_len);
        Ok(())
    }

    /// Write the image to `off` with its sibling links and flush it
    pub fn seal(
        mut self,
        region: &PmemRegion,
        off: PmOffset,
        prev: PmOffset,
        next: PmOffset,
    ) -> Result<()> {
        self.buf[OFF_GROUPS..OFF_GROUPS + 2].copy_from_slice(&self.groups.to_le_bytes());
        let used = self.used() as u32;
        put_u32(&mut self.buf, OFF_USED, used);
        put_u64(&mut self.buf, OFF_PREV as usize, prev.get());
        put_u64(&mut self.buf, OFF_NEXT as usize, next.get());

        region.check_range(off, NODE_SIZE)?;
        region.write_unordered(off, &self.buf);
        region.flush(off, NODE_SIZE)?;
        debug!(%off, groups = self.groups, used, "Sealed link node");
        Ok(())
    }
}

/// Escape-hatch tree node formats
///
/// A directory whose entries outgrow what a chain handles well could be moved
/// into a small tree of these nodes. Chains already let one directory's group
/// span several siblings, so the index never builds such a tree; the formats
/// are kept so a region containing them is recognised by the checker.
pub mod bptree {
    use super::*;

    /// Interior node: `tag | level(1) | count(2) | pad(4) | min(8) | max(8) | reserved(8)`
    pub const INDEX_HEADER_SIZE: usize = 32;
    /// Interior entries are `key(8) | child(8)`
    pub const INDEX_CAPACITY: usize = (NODE_SIZE - INDEX_HEADER_SIZE) / 16;

    /// Leaf: `tag | pad(1) | count(2) | used(4) | prev(8) | next(8)`
    pub const LEAF_HEADER_SIZE: usize = 24;
    pub const LEAF_CAPACITY: usize = NODE_SIZE - LEAF_HEADER_SIZE;

    fn allocate(alloc: &NodeAllocator, kind: BlockKind, level: u8) -> Result<PmOffset> {
        let off = alloc.allocate_and_init(NODE_SIZE, 0)?;
        let region = alloc.region();
        region.write_unordered(off, &[kind.tag(), level]);
        region.flush(off, 2)?;
        Ok(off)
    }

    /// Allocate an empty interior node at `level` (leaves are level 0)
    pub fn allocate_index(alloc: &NodeAllocator, level: u8) -> Result<PmOffset> {
        allocate(alloc, BlockKind::BptreeIndex, level)
    }

    /// Allocate an empty leaf node
    pub fn allocate_leaf(alloc: &NodeAllocator) -> Result<PmOffset> {
        allocate(alloc, BlockKind::BptreeLeaf, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FlushMode;
    use std::sync::Arc;

    fn alloc() -> (tempfile::TempDir, NodeAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let region =
            PmemRegion::create(dir.path().join("node.pm"), 64 * 1024, FlushMode::Fence).unwrap();
        let alloc = NodeAllocator::new(Arc::new(region)).unwrap();
        (dir, alloc)
    }

    fn sorted(mut entries: Vec<Entry>) -> Vec<Entry> {
        entries.sort_by(|a, b| cmp_key(a.key(), b.key()));
        entries
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(NODE_CAPACITY, 984);
        assert_eq!(MERGE_THRESHOLD, 246);
        assert_eq!(bptree::INDEX_CAPACITY, 62);
        assert_eq!(bptree::LEAF_CAPACITY, 1000);
    }

    #[test]
    fn test_encoded_len_groups() {
        let entries = sorted(vec![
            Entry::new(1, b"a", 10),
            Entry::new(1, b"bb", 11),
            Entry::new(2, b"c", 12),
        ]);
        // Two groups, three records
        assert_eq!(encoded_len(&entries), 2 * 16 + (21 + 22 + 21));
    }

    #[test]
    fn test_seal_and_load() -> Result<()> {
        let (_dir, alloc) = alloc();
        let entries = sorted(vec![
            Entry::new(7, b"passwd", 100),
            Entry::new(7, b"hosts", 101),
            Entry::new(9, b"bin", 200),
        ]);

        let builder = NodeBuilder::from_entries(&entries)?;
        let used = builder.used();
        let off = alloc.allocate(NODE_SIZE)?;
        builder.seal(alloc.region(), off, PmOffset::NULL, PmOffset::new(4096))?;

        let node = LinkNode::load(alloc.region(), off)?;
        assert_eq!(node.groups(), 2);
        assert_eq!(node.used(), used);
        assert_eq!(node.min_dir(), 7);
        assert_eq!(node.max_dir(), 9);
        assert_eq!(node.next(), PmOffset::new(4096));
        assert_eq!(node.entries(), entries);

        assert_eq!(header::max(alloc.region(), off)?, 9);
        header::set_prev(alloc.region(), off, PmOffset::new(2048))?;
        assert_eq!(LinkNode::load(alloc.region(), off)?.prev(), PmOffset::new(2048));
        Ok(())
    }

    #[test]
    fn test_child_position() -> Result<()> {
        let (_dir, alloc) = alloc();
        let entry = Entry::new(3, b"lib", 42);
        let off = alloc.allocate(NODE_SIZE)?;
        NodeBuilder::from_entries(std::slice::from_ref(&entry))?.seal(
            alloc.region(),
            off,
            PmOffset::NULL,
            PmOffset::NULL,
        )?;

        let node = LinkNode::load(alloc.region(), off)?;
        let rec = node.records().next().unwrap();
        assert_eq!(rec.child_pos, NODE_HEADER_SIZE + GROUP_HEADER_SIZE + 12 + 3);
        alloc
            .region()
            .write_ordered_u64(off.add(rec.child_pos as u64), 43)?;
        assert_eq!(LinkNode::load(alloc.region(), off)?.entries()[0].child, 43);
        Ok(())
    }

    #[test]
    fn test_builder_capacity() {
        let mut builder = NodeBuilder::new();
        let name = vec![b'x'; MAX_NAME_LEN];
        let mut pushed = 0;
        loop {
            let e = Entry::new(1, &name, pushed);
            if !builder.fits(&e) {
                assert!(builder.push(&e).is_err());
                break;
            }
            builder.push(&e).unwrap();
            pushed += 1;
        }
        // 16 + 3 * 275 = 841; a fourth record needs 275 more
        assert_eq!(pushed, 3);
        assert!(builder.used() <= NODE_CAPACITY);
    }

    #[test]
    fn test_load_rejects_bad_nodes() -> Result<()> {
        let (_dir, alloc) = alloc();
        let off = alloc.allocate_and_init(NODE_SIZE, 0)?;
        assert!(matches!(
            LinkNode::load(alloc.region(), off),
            Err(Error::Corruption(_))
        ));

        NodeBuilder::from_entries(&[Entry::new(1, b"a", 1)])?.seal(
            alloc.region(),
            off,
            PmOffset::NULL,
            PmOffset::NULL,
        )?;
        alloc.region().write_ordered_u32(off.add(OFF_USED as u64), 2000)?;
        assert!(LinkNode::load(alloc.region(), off).is_err());
        Ok(())
    }

    #[test]
    fn test_name_hash_is_stable() {
        // Stored records carry this hash, so it must not change between builds.
        assert_eq!(name_hash(b""), 0x2D06_8005_38D3_94C2);
        assert_eq!(name_hash(b"etc"), twox_hash::xxh3::hash64(b"etc"));
        assert_ne!(name_hash(b"etc"), name_hash(b"usr"));
        assert_eq!(Entry::new(1, b"etc", 2).hash, name_hash(b"etc"));
    }

    #[test]
    fn test_check_name() {
        assert!(check_name(b"").is_err());
        assert!(check_name(&[b'a'; MAX_NAME_LEN]).is_ok());
        assert!(check_name(&[b'a'; MAX_NAME_LEN + 1]).is_err());
    }

    #[test]
    fn test_bptree_allocation() -> Result<()> {
        let (_dir, alloc) = alloc();
        let index = bptree::allocate_index(&alloc, 1)?;
        let leaf = bptree::allocate_leaf(&alloc)?;
        assert_eq!(BlockKind::read(alloc.region(), index)?, BlockKind::BptreeIndex);
        assert_eq!(BlockKind::read(alloc.region(), leaf)?, BlockKind::BptreeLeaf);
        assert_eq!(alloc.region().read_u8(index.add(1)), 1);
        Ok(())
    }
}
