//! Directory-entry hash index
//!
//! # Architecture
//!
//! ```text
//! DirHashTable (first level, fixed capacity)
//!   └─→ Generation (bucket array + per-bucket locks)
//!        └─→ bucket root
//!             ├─→ Chain of LinkNodes
//!             └─→ DirHashTable (second level, promoted bucket)
//!                  └─→ current Generation ─┐ during a resize both
//!                      next Generation ────┘ are live
//! ```
//!
//! - `node`: link node format and builder
//! - `chain`: search/insert/delete over one overflow chain
//! - `version`: bucket arrays and their locks
//! - `table`: routing, promotion and resize
//! - `worker`: background pool running promotion and resize
//! - `iter`: merged per-directory scans
//! - `recovery`: reopening a region after a restart or crash
//! - `verify`: structural checker

pub mod chain;
pub mod iter;
pub mod node;
pub mod recovery;
pub mod table;
pub mod verify;
pub mod version;
pub mod worker;

pub use table::{DirHashTable, HashLevel, TableContext};

use serde::{Deserialize, Serialize};

/// Result of a put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutOutcome {
    /// The name was new in the directory
    Inserted,
    /// The name existed; its child was replaced
    Updated,
}

/// Result of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}
