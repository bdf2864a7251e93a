// PhotonDB directory-entry index
// Persistent-memory metadata engine for a file system namespace

//! Maps `(parent directory id, entry name)` to a child inode id inside a
//! memory-mapped persistent region, without a write-ahead log.
//!
//! # Layout
//!
//! ```text
//! DirIndex
//!   └─→ DirHashTable (first level, id % capacity)
//!        └─→ bucket ─→ overflow chain of 1 KiB link nodes
//!                   └─→ DirHashTable (second level, promoted hot bucket,
//!                        resizable, (id / parent_capacity) % capacity)
//! ```
//!
//! Every structural change builds new nodes off to the side, flushes them and
//! publishes them with a single ordered 8-byte write, so a crash leaves either
//! the old or the new structure reachable.
//!
//! ```no_run
//! use dirindex::{DirIndex, IndexConfig};
//!
//! # fn main() -> dirindex::error::Result<()> {
//! let index = DirIndex::open("/mnt/pmem/dirindex.pm", IndexConfig::default())?;
//! index.put(1, "etc", 2)?;
//! assert_eq!(index.get(1, "etc")?, Some(2));
//! for entry in index.iter(1)? {
//!     println!("{} -> {}", String::from_utf8_lossy(&entry.name), entry.child);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]

pub mod config;
pub mod db;
pub mod dir;
pub mod metrics;
pub mod storage;

// Re-exports for convenience
pub use config::IndexConfig;
pub use db::{DirIndex, IndexStats};
pub use dir::iter::{DirEntry, DirIterator};
pub use dir::node::MAX_NAME_LEN;
pub use dir::verify::VerifyReport;
pub use dir::{DeleteOutcome, PutOutcome};
pub use storage::{FlushMode, PmOffset};

/// Inode identifier of a directory or of a directory entry's target
pub type InodeId = u64;

/// Directory index error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Out of space: {0}")]
        OutOfSpace(String),

        #[error("Corruption: {0}")]
        Corruption(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = error::Error::OutOfSpace("no run of 4 free slabs".to_string());
        assert_eq!(err.to_string(), "Out of space: no run of 4 free slabs");
    }
}
