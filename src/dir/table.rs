//! Two-level hash table orchestration
//!
//! The first level hashes a directory id with `id % capacity` into a fixed
//! number of buckets. A bucket whose chain grows past the promotion threshold
//! is promoted in the background: its records move into a second-level table
//! hashed with `(id / parent_capacity) % capacity`, and the bucket root is
//! switched to that table with one ordered write. Second-level tables double
//! their bucket array in the background once the live node count reaches
//! `capacity × resize_load_factor`.
//!
//! # Ownership during a resize
//!
//! A record lives in exactly one generation. A bucket of the current
//! generation owns its records until migration drains it; after that the
//! matching buckets of the next generation own them. Writers lock the owning
//! bucket; an operation that reaches a drained bucket with no next generation
//! in hand retries with fresh references.
//!
//! Lock order: table version lock (only to clone generations), then an old
//! generation bucket, then a new generation bucket.
//!
//! Table header block (one slab):
//!
//! ```text
//! 0    tag              u8   BlockKind::Table
//! 1    level            u8   1 or 2
//! 8    parent capacity  u64  first-level capacity (second level only)
//! 16   current          u64  bucket array
//! 24   next             u64  bucket array being filled by a resize, or NULL
//! ```

use super::chain::{Chain, ChainOp, InsertMode, InsertResult};
use super::iter::MergeIter;
use super::node::{check_name, Entry, NODE_SIZE};
use super::version::{BucketRoot, Generation};
use super::worker::BackgroundPool;
use super::{DeleteOutcome, PutOutcome};
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::metrics::{BACKGROUND_FAILURES, PROMOTIONS, RESIZES};
use crate::storage::{BlockKind, NodeAllocator, PmOffset, SLAB_SIZE};
use crate::InodeId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, info, warn};

const OFF_LEVEL: u64 = 1;
const OFF_PARENT_CAPACITY: u64 = 8;
const OFF_CURRENT: u64 = 16;
const OFF_NEXT: u64 = 24;

/// Size of a table header block
pub const TABLE_HEADER_SIZE: usize = SLAB_SIZE;

/// Shared services of every table in one index
pub struct TableContext {
    pub alloc: Arc<NodeAllocator>,
    pub pool: Arc<BackgroundPool>,
    pub config: IndexConfig,
}

/// Hash mode of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashLevel {
    /// `id % capacity`
    First,
    /// `(id / parent_capacity) % capacity`
    Second { parent_capacity: u64 },
}

impl HashLevel {
    pub fn bucket(self, dir: u64, capacity: u64) -> usize {
        match self {
            Self::First => (dir % capacity) as usize,
            Self::Second { parent_capacity } => ((dir / parent_capacity) % capacity) as usize,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second { .. } => 2,
        }
    }

    fn parent_capacity(self) -> u64 {
        match self {
            Self::First => 0,
            Self::Second { parent_capacity } => parent_capacity,
        }
    }
}

struct VersionSet {
    current: Arc<Generation>,
    next: Option<Arc<Generation>>,
}

/// Lookup result in one generation
enum Probe {
    Hit(InodeId),
    Miss,
    /// The bucket no longer owns its records (drained or promoted)
    Moved,
}

/// Next-generation bucket rebuilt during migration, not yet committed
struct RebuiltBucket {
    idx: usize,
    old_root: PmOffset,
    old_nodes: Vec<PmOffset>,
    op: ChainOp<()>,
}

fn abandon_targets(alloc: &NodeAllocator, targets: Vec<RebuiltBucket>) {
    for target in targets {
        target.op.abandon(alloc);
    }
}

/// A first- or second-level directory hash table
pub struct DirHashTable {
    ctx: Arc<TableContext>,
    header: PmOffset,
    level: HashLevel,
    versions: Mutex<VersionSet>,
    resize_scheduled: AtomicBool,
    /// Promoted buckets (first level only). Set once, after the bucket root
    /// was switched, while the bucket lock is held.
    subtables: Vec<OnceLock<Arc<DirHashTable>>>,
    promoting: Vec<AtomicBool>,
    this: Weak<DirHashTable>,
}

impl DirHashTable {
    /// Allocate a table header and an empty bucket array
    ///
    /// The table is not reachable until the caller publishes its header.
    pub fn create(ctx: Arc<TableContext>, level: HashLevel, capacity: u64) -> Result<Arc<Self>> {
        let alloc = Arc::clone(&ctx.alloc);
        let header = alloc.allocate_and_init(TABLE_HEADER_SIZE, 0)?;
        let current = match Generation::create(Arc::clone(&alloc), capacity) {
            Ok(gen) => gen,
            Err(e) => {
                alloc.free(header, TABLE_HEADER_SIZE)?;
                return Err(e);
            }
        };

        let region = alloc.region();
        region.write_unordered(header, &[BlockKind::Table.tag(), level.code()]);
        region.write_unordered(
            header.add(OFF_PARENT_CAPACITY),
            &level.parent_capacity().to_le_bytes(),
        );
        region.write_unordered(header.add(OFF_CURRENT), &current.block().get().to_le_bytes());
        if let Err(e) = region.flush(header, TABLE_HEADER_SIZE) {
            current.retire();
            alloc.free(header, TABLE_HEADER_SIZE)?;
            return Err(e);
        }

        debug!(%header, ?level, capacity, "Created directory hash table");
        Ok(Self::assemble(ctx, header, level, current, None))
    }

    /// Wrap a table found in the region. Sub-tables are installed separately.
    pub fn attach(ctx: Arc<TableContext>, header: PmOffset) -> Result<Arc<Self>> {
        let alloc = Arc::clone(&ctx.alloc);
        let region = alloc.region();
        let kind = BlockKind::read(region, header)?;
        if kind != BlockKind::Table {
            return Err(Error::Corruption(format!(
                "expected table header at {}, found {}",
                header, kind
            )));
        }
        region.check_range(header, TABLE_HEADER_SIZE)?;

        let level = match region.read_u8(header.add(OFF_LEVEL)) {
            1 => HashLevel::First,
            2 => {
                let parent_capacity = region.read_u64(header.add(OFF_PARENT_CAPACITY));
                if parent_capacity == 0 {
                    return Err(Error::Corruption(format!(
                        "second-level table {} has no parent capacity",
                        header
                    )));
                }
                HashLevel::Second { parent_capacity }
            }
            other => {
                return Err(Error::Corruption(format!(
                    "table {} has level {}",
                    header, other
                )))
            }
        };

        let current_block = PmOffset::new(region.read_u64(header.add(OFF_CURRENT)));
        let mut next_block = PmOffset::new(region.read_u64(header.add(OFF_NEXT)));
        if next_block == current_block && !next_block.is_null() {
            // Crash between switching current and clearing next
            warn!(%header, "Clearing stale next generation");
            region.write_ordered_u64(header.add(OFF_NEXT), 0)?;
            next_block = PmOffset::NULL;
        }

        let current = Generation::attach(Arc::clone(&alloc), current_block)?;
        let next = match next_block.non_null() {
            Some(block) => Some(Generation::attach(Arc::clone(&alloc), block)?),
            None => None,
        };
        Ok(Self::assemble(ctx, header, level, current, next))
    }

    fn assemble(
        ctx: Arc<TableContext>,
        header: PmOffset,
        level: HashLevel,
        current: Arc<Generation>,
        next: Option<Arc<Generation>>,
    ) -> Arc<Self> {
        let slots = match level {
            HashLevel::First => current.capacity() as usize,
            HashLevel::Second { .. } => 0,
        };
        Arc::new_cyclic(|this| Self {
            ctx,
            header,
            level,
            versions: Mutex::new(VersionSet { current, next }),
            resize_scheduled: AtomicBool::new(false),
            subtables: (0..slots).map(|_| OnceLock::new()).collect(),
            promoting: (0..slots).map(|_| AtomicBool::new(false)).collect(),
            this: this.clone(),
        })
    }

    pub fn header(&self) -> PmOffset {
        self.header
    }

    pub fn level(&self) -> HashLevel {
        self.level
    }

    pub fn context(&self) -> &Arc<TableContext> {
        &self.ctx
    }

    /// Current and (while resizing) next generation
    pub fn generations(&self) -> (Arc<Generation>, Option<Arc<Generation>>) {
        let versions = self.versions.lock();
        (Arc::clone(&versions.current), versions.next.clone())
    }

    pub fn capacity(&self) -> u64 {
        self.versions.lock().current.capacity()
    }

    pub fn is_resizing(&self) -> bool {
        self.versions.lock().next.is_some()
    }

    fn bucket_index(&self, gen: &Generation, dir: u64) -> usize {
        self.level.bucket(dir, gen.capacity())
    }

    /// Second-level table serving `dir`, if its first-level bucket was promoted
    fn route(&self, dir: u64) -> Option<&Arc<DirHashTable>> {
        if self.subtables.is_empty() {
            return None;
        }
        let idx = (dir % self.subtables.len() as u64) as usize;
        self.subtables[idx].get()
    }

    /// Sub-table installed at first-level bucket `idx`
    pub fn subtable(&self, idx: usize) -> Option<&Arc<DirHashTable>> {
        self.subtables.get(idx).and_then(|slot| slot.get())
    }

    /// All installed sub-tables
    pub fn subtables(&self) -> impl Iterator<Item = &Arc<DirHashTable>> {
        self.subtables.iter().filter_map(|slot| slot.get())
    }

    /// Register a sub-table found during recovery
    pub fn install_subtable(&self, idx: usize, sub: Arc<DirHashTable>) -> Result<()> {
        let slot = self.subtables.get(idx).ok_or_else(|| {
            Error::Corruption(format!(
                "table {} has no bucket {} to hold a sub-table",
                self.header, idx
            ))
        })?;
        slot.set(sub).map_err(|_| {
            Error::Internal(format!("bucket {} of {} already has a sub-table", idx, self.header))
        })?;
        self.promoting[idx].store(true, Ordering::Release);
        Ok(())
    }

    fn chain_root(&self, gen: &Generation, idx: usize) -> Result<PmOffset> {
        match gen.bucket_root(idx)? {
            BucketRoot::Empty => Ok(PmOffset::NULL),
            BucketRoot::Chain(root) => Ok(root),
            BucketRoot::SubTable(sub) => Err(Error::Internal(format!(
                "bucket {} of {} was promoted to {} but is not routed",
                idx,
                gen.block(),
                sub
            ))),
        }
    }

    /// Publish a chain mutation into bucket `idx` and release retired nodes
    fn publish<T>(&self, gen: &Generation, idx: usize, op: ChainOp<T>) -> Result<T> {
        if op.root_changed() {
            gen.set_root(idx, op.new_root)?;
        }
        gen.adjust_node_count(idx, op.node_delta())?;
        op.finish(&self.ctx.alloc)
    }

    fn insert_locked(
        &self,
        gen: &Generation,
        idx: usize,
        dir: u64,
        name: &[u8],
        child: InodeId,
        mode: InsertMode,
    ) -> Result<InsertResult> {
        let root = self.chain_root(gen, idx)?;
        let op = Chain::new(&self.ctx.alloc, root).insert(dir, name, child, mode)?;
        self.publish(gen, idx, op)
    }

    /// Run `f` under the write lock of the bucket that owns `dir`
    fn with_owner_bucket<T>(
        &self,
        dir: u64,
        f: &mut dyn FnMut(&DirHashTable, &Generation, usize) -> Result<T>,
    ) -> Result<T> {
        loop {
            if let Some(sub) = self.route(dir) {
                return sub.with_owner_bucket(dir, f);
            }

            let (current, next) = self.generations();
            for gen in std::iter::once(&current).chain(next.as_ref()) {
                let idx = self.bucket_index(gen, dir);
                let state = gen.write_bucket(idx);
                if state.drained || self.route(dir).is_some() {
                    continue;
                }
                let result = f(self, gen.as_ref(), idx);
                drop(state);
                if result.is_ok() {
                    self.schedule_maintenance(gen, idx);
                }
                return result;
            }
        }
    }

    /// Insert or overwrite `(dir, name) → child`
    pub fn put(&self, dir: u64, name: &[u8], child: InodeId) -> Result<PutOutcome> {
        check_name(name)?;
        let result = self.with_owner_bucket(dir, &mut |table, gen, idx| {
            table.insert_locked(gen, idx, dir, name, child, InsertMode::Overwrite)
        })?;
        Ok(match result {
            InsertResult::Updated => PutOutcome::Updated,
            InsertResult::Inserted | InsertResult::Kept => PutOutcome::Inserted,
        })
    }

    /// Remove `(dir, name)`
    pub fn delete(&self, dir: u64, name: &[u8]) -> Result<DeleteOutcome> {
        let removed = self.with_owner_bucket(dir, &mut |table, gen, idx| {
            let root = table.chain_root(gen, idx)?;
            let op = Chain::new(&table.ctx.alloc, root).delete(dir, name)?;
            table.publish(gen, idx, op)
        })?;
        Ok(if removed {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    fn probe(&self, gen: &Generation, dir: u64, name: &[u8]) -> Result<Probe> {
        let idx = self.bucket_index(gen, dir);
        let state = gen.read_bucket(idx);
        if state.drained || self.route(dir).is_some() {
            return Ok(Probe::Moved);
        }
        let root = self.chain_root(gen, idx)?;
        Ok(match Chain::new(&self.ctx.alloc, root).get(dir, name)? {
            Some(child) => Probe::Hit(child),
            None => Probe::Miss,
        })
    }

    /// Child of `(dir, name)`
    pub fn get(&self, dir: u64, name: &[u8]) -> Result<Option<InodeId>> {
        loop {
            if let Some(sub) = self.route(dir) {
                return sub.get(dir, name);
            }

            let (current, next) = self.generations();
            if let Some(next) = &next {
                if let Probe::Hit(child) = self.probe(next, dir, name)? {
                    return Ok(Some(child));
                }
            }
            match self.probe(&current, dir, name)? {
                Probe::Hit(child) => return Ok(Some(child)),
                Probe::Miss => return Ok(None),
                Probe::Moved => {}
            }
            // Drained since next was checked; next is authoritative now.
            if let Some(next) = &next {
                match self.probe(next, dir, name)? {
                    Probe::Hit(child) => return Ok(Some(child)),
                    Probe::Miss => return Ok(None),
                    Probe::Moved => {}
                }
            }
        }
    }

    /// Snapshot of every record of `dir`, in `(hash, name)` order
    pub fn scan(&self, dir: u64) -> Result<Vec<Entry>> {
        loop {
            if let Some(sub) = self.route(dir) {
                return sub.scan(dir);
            }

            let (current, next) = self.generations();
            let idx = self.bucket_index(&current, dir);
            let state = current.read_bucket(idx);
            if self.route(dir).is_some() {
                continue;
            }
            let older = if state.drained {
                Vec::new()
            } else {
                Chain::new(&self.ctx.alloc, self.chain_root(&current, idx)?).collect_dir(dir)?
            };

            let newer = match &next {
                Some(next) => {
                    let nidx = self.bucket_index(next, dir);
                    let next_state = next.read_bucket(nidx);
                    if next_state.drained {
                        continue;
                    }
                    Chain::new(&self.ctx.alloc, self.chain_root(next, nidx)?).collect_dir(dir)?
                }
                None if state.drained => continue,
                None => Vec::new(),
            };
            drop(state);

            return Ok(MergeIter::new(older.into_iter(), newer.into_iter()).collect());
        }
    }

    fn needs_resize(&self, gen: &Generation) -> bool {
        let threshold = gen.capacity() as f64 * self.ctx.config.resize_load_factor;
        gen.total_nodes() as f64 >= threshold
    }

    /// Queue a promotion or resize if the write just made one due
    fn schedule_maintenance(&self, gen: &Generation, idx: usize) {
        match self.level {
            HashLevel::First => {
                let threshold = self.ctx.config.promotion_threshold;
                if gen.node_count(idx) >= threshold
                    && !self.promoting[idx].swap(true, Ordering::AcqRel)
                {
                    self.spawn("promote", move |table| table.promote_bucket(idx));
                }
            }
            HashLevel::Second { .. } => self.schedule_resize(),
        }
    }

    /// Queue a resize when one is due or a previous one stopped short
    fn schedule_resize(&self) {
        let (current, next) = self.generations();
        if next.is_none() && !self.needs_resize(&current) {
            return;
        }
        if !self.resize_scheduled.swap(true, Ordering::AcqRel) {
            self.spawn("resize", |table| table.resize());
        }
    }

    fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: FnOnce(&DirHashTable) -> Result<()> + Send + 'static,
    {
        let Some(table) = self.this.upgrade() else {
            return;
        };
        self.ctx.pool.spawn(name, move || {
            if let Err(e) = task(&*table) {
                BACKGROUND_FAILURES.inc();
                error!(task = name, table = %table.header, error = %e, "Background task abandoned");
            }
        });
    }

    /// Move first-level bucket `idx` into a new second-level table
    fn promote_bucket(&self, idx: usize) -> Result<()> {
        let (current, _) = self.generations();
        let state = current.write_bucket(idx);
        if self.subtables[idx].get().is_some() {
            return Ok(());
        }
        let count = current.node_count(idx);
        if count < self.ctx.config.promotion_threshold {
            self.promoting[idx].store(false, Ordering::Release);
            return Ok(());
        }

        let root = self.chain_root(&current, idx)?;
        let chain = Chain::new(&self.ctx.alloc, root);
        let entries = chain.collect_all()?;
        let nodes = chain.node_offsets()?;

        let sub = DirHashTable::create(
            Arc::clone(&self.ctx),
            HashLevel::Second {
                parent_capacity: current.capacity(),
            },
            self.ctx.config.second_level_initial_capacity,
        )?;
        if let Err(e) = sub.replay(&entries) {
            sub.discard();
            return Err(e);
        }

        current.set_root(idx, sub.header())?;
        current.set_node_count(idx, 0)?;
        self.subtables[idx].set(Arc::clone(&sub)).map_err(|_| {
            Error::Internal(format!("bucket {} of {} was promoted twice", idx, self.header))
        })?;
        drop(state);

        for node in nodes {
            self.ctx.alloc.free(node, NODE_SIZE)?;
        }
        PROMOTIONS.inc();
        info!(
            table = %self.header,
            bucket = idx,
            nodes = count,
            entries = entries.len(),
            subtable = %sub.header(),
            "Promoted bucket to second-level table"
        );
        sub.schedule_resize();
        Ok(())
    }

    /// Insert records into a table nobody else can see yet
    fn replay(&self, entries: &[Entry]) -> Result<()> {
        let (current, _) = self.generations();
        for e in entries {
            let idx = self.bucket_index(&current, e.dir);
            let _state = current.write_bucket(idx);
            self.insert_locked(
                &current,
                idx,
                e.dir,
                &e.name,
                e.child,
                InsertMode::KeepExisting,
            )?;
        }
        Ok(())
    }

    /// Release every block of an unpublished table
    fn discard(&self) {
        let (current, next) = self.generations();
        for gen in std::iter::once(current).chain(next) {
            for idx in 0..gen.capacity() as usize {
                if let Ok(BucketRoot::Chain(root)) = gen.bucket_root(idx) {
                    for node in Chain::new(&self.ctx.alloc, root).node_offsets().unwrap_or_default() {
                        let _ = self.ctx.alloc.free(node, NODE_SIZE);
                    }
                }
            }
            gen.retire();
        }
        if let Err(e) = self.ctx.alloc.free(self.header, TABLE_HEADER_SIZE) {
            warn!(header = %self.header, error = %e, "Failed to free discarded table");
        }
    }

    /// Double the bucket array and migrate every bucket into it
    ///
    /// A failed resize leaves the next generation in place; the next write
    /// to the table schedules it again and migration picks up where it
    /// stopped.
    fn resize(&self) -> Result<()> {
        let result = self.run_resize();
        self.resize_scheduled.store(false, Ordering::Release);
        if result.is_ok() {
            self.schedule_resize();
        }
        result
    }

    fn run_resize(&self) -> Result<()> {
        let (current, next) = self.generations();
        let next = match next {
            Some(next) => {
                info!(table = %self.header, to = next.capacity(), "Continuing resize");
                next
            }
            None if !self.needs_resize(&current) => return Ok(()),
            None => self.start_resize(&current)?,
        };

        self.migrate(&current, &next)?;
        self.finish_resize(&current, &next)?;
        RESIZES.inc();
        Ok(())
    }

    /// Allocate the doubled bucket array and publish it as the next generation
    fn start_resize(&self, current: &Generation) -> Result<Arc<Generation>> {
        let capacity = current.capacity() * 2;
        let next = Generation::create(Arc::clone(&self.ctx.alloc), capacity)?;
        let region = self.ctx.alloc.region();
        if let Err(e) = region.write_ordered_u64(self.header.add(OFF_NEXT), next.block().get()) {
            next.retire();
            return Err(e);
        }
        self.versions.lock().next = Some(Arc::clone(&next));
        info!(
            table = %self.header,
            from = current.capacity(),
            to = capacity,
            nodes = current.total_nodes(),
            "Resizing second-level table"
        );
        Ok(next)
    }

    /// Finish a resize interrupted by a crash (recovery only)
    pub fn resume_resize(&self) -> Result<()> {
        let (current, next) = self.generations();
        let Some(next) = next else {
            return Ok(());
        };
        info!(table = %self.header, to = next.capacity(), "Resuming interrupted resize");
        self.migrate(&current, &next)?;
        self.finish_resize(&current, &next)?;
        RESIZES.inc();
        Ok(())
    }

    fn migrate(&self, current: &Generation, next: &Generation) -> Result<()> {
        for idx in 0..current.capacity() as usize {
            self.migrate_bucket(current, next, idx)?;
        }
        Ok(())
    }

    /// Replay one old bucket into the next generation and drain it
    ///
    /// Each target chain is rebuilt off to the side and published only once
    /// every target is built, so a failure leaves both generations as they
    /// were and the old bucket keeps ownership of its records.
    fn migrate_bucket(&self, current: &Generation, next: &Generation, idx: usize) -> Result<()> {
        let mut state = current.write_bucket(idx);
        if state.drained {
            return Ok(());
        }

        let root = self.chain_root(current, idx)?;
        if root.is_null() {
            state.drained = true;
            return Ok(());
        }

        let alloc = &self.ctx.alloc;
        let chain = Chain::new(alloc, root);
        let entries = chain.collect_all()?;
        let nodes = chain.node_offsets()?;
        let migrated = entries.len();

        let mut targets: BTreeMap<usize, Vec<Entry>> = BTreeMap::new();
        for e in entries {
            targets.entry(self.bucket_index(next, e.dir)).or_default().push(e);
        }
        let _next_states: Vec<_> = targets.keys().map(|&nidx| next.write_bucket(nidx)).collect();

        let mut rebuilt = Vec::with_capacity(targets.len());
        for (nidx, batch) in targets {
            match self.rebuild_target(next, nidx, batch) {
                Ok(target) => rebuilt.push(target),
                Err(e) => {
                    abandon_targets(alloc, rebuilt);
                    return Err(e);
                }
            }
        }

        for i in 0..rebuilt.len() {
            if let Err(e) = next.set_root(rebuilt[i].idx, rebuilt[i].op.new_root) {
                self.restore_targets(next, &rebuilt[..=i]);
                abandon_targets(alloc, rebuilt);
                return Err(e);
            }
        }
        if let Err(e) = current.set_root(idx, PmOffset::NULL) {
            self.restore_targets(next, &rebuilt);
            abandon_targets(alloc, rebuilt);
            return Err(e);
        }
        state.drained = true;

        current.set_node_count(idx, 0)?;
        for target in rebuilt {
            next.set_node_count(target.idx, target.op.allocated.len() as u32)?;
            for node in target.old_nodes {
                alloc.free(node, NODE_SIZE)?;
            }
        }
        for node in nodes {
            alloc.free(node, NODE_SIZE)?;
        }
        debug!(table = %self.header, bucket = idx, entries = migrated, "Migrated bucket");
        Ok(())
    }

    /// Build the chain next bucket `nidx` will hold once `batch` is added
    fn rebuild_target(
        &self,
        next: &Generation,
        nidx: usize,
        batch: Vec<Entry>,
    ) -> Result<RebuiltBucket> {
        let old_root = self.chain_root(next, nidx)?;
        let existing = Chain::new(&self.ctx.alloc, old_root);
        let old_nodes = existing.node_offsets()?;
        // Records already in the next bucket were written after the old
        // bucket last changed, or are identical copies from an earlier pass.
        let merged: Vec<Entry> =
            MergeIter::new(batch.into_iter(), existing.collect_all()?.into_iter()).collect();
        let op = Chain::build(&self.ctx.alloc, merged)?;
        Ok(RebuiltBucket {
            idx: nidx,
            old_root,
            old_nodes,
            op,
        })
    }

    fn restore_targets(&self, next: &Generation, published: &[RebuiltBucket]) {
        for target in published {
            if let Err(e) = next.set_root(target.idx, target.old_root) {
                warn!(
                    table = %self.header,
                    bucket = target.idx,
                    error = %e,
                    "Failed to restore next bucket root"
                );
            }
        }
    }

    fn finish_resize(&self, current: &Arc<Generation>, next: &Arc<Generation>) -> Result<()> {
        let region = self.ctx.alloc.region();
        region.write_ordered_u64(self.header.add(OFF_CURRENT), next.block().get())?;
        region.write_ordered_u64(self.header.add(OFF_NEXT), 0)?;
        {
            let mut versions = self.versions.lock();
            versions.current = Arc::clone(next);
            versions.next = None;
        }
        current.retire();
        info!(table = %self.header, capacity = next.capacity(), "Resize complete");
        Ok(())
    }

    /// Live link nodes in this table and its sub-tables
    pub fn total_nodes(&self) -> u64 {
        let (current, next) = self.generations();
        let own = current.total_nodes() + next.map_or(0, |n| n.total_nodes());
        own + self.subtables().map(|sub| sub.total_nodes()).sum::<u64>()
    }
}
