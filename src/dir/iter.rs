//! Directory iteration
//!
//! A directory scan snapshots the directory's records under the bucket
//! lock(s) and hands back an owned iterator, so callers never hold index locks
//! while they consume entries. While a resize is running the two generations
//! are merged with [`MergeIter`]; on an equal key the next generation wins.

use super::node::{cmp_key, Entry};
use crate::InodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::iter::Peekable;

pub use super::chain::ChainCursor;

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub name_hash: u64,
    pub child: InodeId,
}

impl From<Entry> for DirEntry {
    fn from(e: Entry) -> Self {
        Self {
            name: e.name,
            name_hash: e.hash,
            child: e.child,
        }
    }
}

/// Ordered merge of two key-ordered entry streams
pub struct MergeIter<A: Iterator<Item = Entry>, B: Iterator<Item = Entry>> {
    older: Peekable<A>,
    newer: Peekable<B>,
}

impl<A, B> MergeIter<A, B>
where
    A: Iterator<Item = Entry>,
    B: Iterator<Item = Entry>,
{
    pub fn new(older: A, newer: B) -> Self {
        Self {
            older: older.peekable(),
            newer: newer.peekable(),
        }
    }
}

impl<A, B> Iterator for MergeIter<A, B>
where
    A: Iterator<Item = Entry>,
    B: Iterator<Item = Entry>,
{
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let order = match (self.older.peek(), self.newer.peek()) {
            (Some(o), Some(n)) => cmp_key(o.key(), n.key()),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => return None,
        };
        match order {
            Ordering::Less => self.older.next(),
            Ordering::Greater => self.newer.next(),
            Ordering::Equal => {
                self.older.next();
                self.newer.next()
            }
        }
    }
}

/// Entries of one directory, in name-hash order
pub struct DirIterator {
    dir: InodeId,
    entries: std::vec::IntoIter<DirEntry>,
}

impl DirIterator {
    pub(crate) fn new(dir: InodeId, entries: Vec<Entry>) -> Self {
        Self {
            dir,
            entries: entries
                .into_iter()
                .map(DirEntry::from)
                .collect::<Vec<_>>()
                .into_iter(),
        }
    }

    /// Directory being listed
    pub fn dir(&self) -> InodeId {
        self.dir
    }
}

impl Iterator for DirIterator {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for DirIterator {}
