//! Persistent storage layer
//!
//! # Architecture
//!
//! ```text
//! PmemRegion (one mapped file)
//!   ├─→ slab 0: Superblock (magic, format, root table handle)
//!   └─→ slabs 1..: blocks handed out by NodeAllocator
//!        (link nodes, table headers, bucket arrays)
//! ```
//!
//! Blocks refer to each other by [`PmOffset`], never by address. Every block
//! begins with a [`BlockKind`] tag byte.

pub mod allocator;
pub mod block;
pub mod handle;
pub mod pmem;
pub mod superblock;

pub use allocator::{AllocatorStats, NodeAllocator, SLAB_SIZE};
pub use block::BlockKind;
pub use handle::PmOffset;
pub use pmem::{FlushMode, PmemRegion};
pub use superblock::Superblock;
