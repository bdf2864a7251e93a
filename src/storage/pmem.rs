//! Memory-mapped persistent region
//!
//! The whole index lives inside one file mapped with `MAP_SHARED`. Every
//! structure refers to every other structure by [`PmOffset`], so the file can
//! be mapped at any base address.
//!
//! # Durability primitives
//!
//! ```text
//! write_unordered  → bytes land in the mapping, no ordering or durability
//! flush            → everything written to a range becomes durable
//! write_ordered    → one small field written and made durable before return
//! ```
//!
//! Structural changes build new blocks with unordered writes, flush each block
//! once, then publish with ordered writes of single 8-byte words. A crash at any
//! point leaves either the old or the new structure reachable, never a mix.
//!
//! # Flush modes
//!
//! - [`FlushMode::Msync`] issues `msync` for the touched range (regular files,
//!   page cache backed).
//! - [`FlushMode::Fence`] only orders stores with a fence. Suitable for DAX
//!   mappings where stores reach the persistence domain directly, and for tests.

use super::handle::PmOffset;
use crate::error::{Error, Result};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// How a flush makes prior writes durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// `msync` the flushed range
    #[default]
    Msync,
    /// Store fence only
    Fence,
}

/// A file mapped into the address space, shared by all index threads
pub struct PmemRegion {
    path: PathBuf,
    /// Kept open for the lifetime of the mapping
    _file: File,
    map: MmapMut,
    base: *mut u8,
    len: usize,
    mode: FlushMode,
}

// SAFETY: the raw base pointer targets the mapping owned by `map`, which lives
// exactly as long as the region. Concurrent writers never touch the same bytes:
// node and bucket contents are serialized by bucket locks, allocator metadata
// lives in process memory behind its own mutex, and publishing words are
// written with atomic stores.
unsafe impl Send for PmemRegion {}
unsafe impl Sync for PmemRegion {}

impl PmemRegion {
    /// Create (or truncate) the backing file with `size` bytes and map it
    pub fn create<P: AsRef<Path>>(path: P, size: u64, mode: FlushMode) -> Result<Self> {
        let path = path.as_ref();
        if size == 0 {
            return Err(Error::InvalidArgument(
                "region size must be non-zero".to_string(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                Error::Storage(format!("Failed to create region {}: {}", path.display(), e))
            })?;
        file.set_len(size)
            .map_err(|e| Error::Storage(format!("Failed to size region to {}: {}", size, e)))?;

        info!(path = %path.display(), size, ?mode, "Created persistent region");
        Self::map(path, file, mode)
    }

    /// Map an existing backing file
    pub fn open<P: AsRef<Path>>(path: P, mode: FlushMode) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                Error::Storage(format!("Failed to open region {}: {}", path.display(), e))
            })?;

        info!(path = %path.display(), ?mode, "Opening persistent region");
        Self::map(path, file, mode)
    }

    /// Whether `path` holds a region that can be opened (exists and is non-empty)
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    fn map(path: &Path, file: File, mode: FlushMode) -> Result<Self> {
        // SAFETY: map_mut is unsafe because another process could modify the
        // file under us. The region file is owned by this index for as long as
        // it is mapped, and every access below is bounds-checked against `len`.
        let mut map = unsafe {
            MmapMut::map_mut(&file).map_err(|e| {
                Error::Storage(format!("Failed to map region {}: {}", path.display(), e))
            })?
        };
        let len = map.len();
        if len == 0 {
            return Err(Error::Corruption(format!(
                "region {} is empty",
                path.display()
            )));
        }
        let base = map.as_mut_ptr();

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
            map,
            base,
            len,
            mode,
        })
    }

    /// Mapped length in bytes
    pub fn len(&self) -> u64 {
        self.len as u64
    }

    /// Whether the mapping is empty (never true for an open region)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured flush behaviour
    pub fn flush_mode(&self) -> FlushMode {
        self.mode
    }

    /// Fail with `Corruption` unless `[off, off + len)` lies inside the region.
    ///
    /// Used when following handles read back from the region.
    pub fn check_range(&self, off: PmOffset, len: usize) -> Result<()> {
        let end = off.get().checked_add(len as u64);
        match end {
            Some(end) if end <= self.len as u64 => Ok(()),
            _ => Err(Error::Corruption(format!(
                "range {}+{} outside region of {} bytes",
                off, len, self.len
            ))),
        }
    }

    fn ptr(&self, off: PmOffset, len: usize) -> *mut u8 {
        let start = off.get() as usize;
        assert!(
            start.checked_add(len).is_some_and(|end| end <= self.len),
            "persistent access {}+{} outside region of {} bytes",
            off,
            len,
            self.len
        );
        // SAFETY: bounds checked above, base points to a live mapping of `len` bytes.
        unsafe { self.base.add(start) }
    }

    /// Copy bytes into the region with no ordering or durability guarantee
    pub fn write_unordered(&self, off: PmOffset, bytes: &[u8]) {
        let dst = self.ptr(off, bytes.len());
        // SAFETY: dst is valid for bytes.len() bytes and cannot overlap a
        // process-memory slice.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    }

    /// Fill a range with one byte value, unordered
    pub fn fill_unordered(&self, off: PmOffset, len: usize, byte: u8) {
        let dst = self.ptr(off, len);
        // SAFETY: dst is valid for len bytes.
        unsafe { ptr::write_bytes(dst, byte, len) };
    }

    /// Make all prior writes to `[off, off + len)` durable
    pub fn flush(&self, off: PmOffset, len: usize) -> Result<()> {
        let _ = self.ptr(off, len);
        fence(Ordering::SeqCst);
        match self.mode {
            FlushMode::Fence => Ok(()),
            FlushMode::Msync => self
                .map
                .flush_range(off.get() as usize, len)
                .map_err(|e| Error::Storage(format!("Flush of {}+{} failed: {}", off, len, e))),
        }
    }

    /// Write a small field and make it durable before returning
    pub fn write_ordered(&self, off: PmOffset, bytes: &[u8]) -> Result<()> {
        self.write_unordered(off, bytes);
        self.flush(off, bytes.len())
    }

    /// Publish one 8-byte word. Aligned words are stored atomically.
    pub fn write_ordered_u64(&self, off: PmOffset, value: u64) -> Result<()> {
        let dst = self.ptr(off, 8);
        if (dst as usize) % 8 == 0 {
            // SAFETY: dst is aligned and valid for 8 bytes; AtomicU64 has the
            // same layout as u64.
            unsafe { (*(dst as *const AtomicU64)).store(value.to_le(), Ordering::Release) };
        } else {
            // SAFETY: dst is valid for 8 bytes.
            unsafe { ptr::write_unaligned(dst as *mut u64, value.to_le()) };
        }
        self.flush(off, 8)
    }

    /// Publish one 4-byte word
    pub fn write_ordered_u32(&self, off: PmOffset, value: u32) -> Result<()> {
        let dst = self.ptr(off, 4);
        if (dst as usize) % 4 == 0 {
            // SAFETY: dst is aligned and valid for 4 bytes.
            unsafe { (*(dst as *const AtomicU32)).store(value.to_le(), Ordering::Release) };
        } else {
            // SAFETY: dst is valid for 4 bytes.
            unsafe { ptr::write_unaligned(dst as *mut u32, value.to_le()) };
        }
        self.flush(off, 4)
    }

    /// Read one 8-byte word
    pub fn read_u64(&self, off: PmOffset) -> u64 {
        let src = self.ptr(off, 8);
        if (src as usize) % 8 == 0 {
            // SAFETY: src is aligned and valid for 8 bytes.
            u64::from_le(unsafe { (*(src as *const AtomicU64)).load(Ordering::Acquire) })
        } else {
            // SAFETY: src is valid for 8 bytes.
            u64::from_le(unsafe { ptr::read_unaligned(src as *const u64) })
        }
    }

    /// Read one 4-byte word
    pub fn read_u32(&self, off: PmOffset) -> u32 {
        let src = self.ptr(off, 4);
        if (src as usize) % 4 == 0 {
            // SAFETY: src is aligned and valid for 4 bytes.
            u32::from_le(unsafe { (*(src as *const AtomicU32)).load(Ordering::Acquire) })
        } else {
            // SAFETY: src is valid for 4 bytes.
            u32::from_le(unsafe { ptr::read_unaligned(src as *const u32) })
        }
    }

    /// Read one byte (node tags)
    pub fn read_u8(&self, off: PmOffset) -> u8 {
        let src = self.ptr(off, 1);
        // SAFETY: src is valid for 1 byte.
        unsafe { ptr::read_volatile(src) }
    }

    /// Copy `buf.len()` bytes out of the region
    pub fn read_into(&self, off: PmOffset, buf: &mut [u8]) {
        let src = self.ptr(off, buf.len());
        // SAFETY: src is valid for buf.len() bytes and cannot overlap buf.
        unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    /// Flush the whole mapping
    pub fn sync_all(&self) -> Result<()> {
        fence(Ordering::SeqCst);
        self.map
            .flush()
            .map_err(|e| Error::Storage(format!("Region sync failed: {}", e)))
    }
}

impl Drop for PmemRegion {
    fn drop(&mut self) {
        if let Err(e) = self.sync_all() {
            warn!(path = %self.path.display(), error = %e, "Final region sync failed");
        }
        debug!(path = %self.path.display(), "Unmapped persistent region");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_region_create_and_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region.pm");

        {
            let region = PmemRegion::create(&path, 64 * 1024, FlushMode::Msync)?;
            assert_eq!(region.len(), 64 * 1024);
            region.write_unordered(PmOffset::new(512), b"directory");
            region.flush(PmOffset::new(512), 9)?;
            region.write_ordered_u64(PmOffset::new(1024), 0xdead_beef)?;
        }

        assert!(PmemRegion::exists(&path));
        let region = PmemRegion::open(&path, FlushMode::Msync)?;
        let mut buf = [0u8; 9];
        region.read_into(PmOffset::new(512), &mut buf);
        assert_eq!(&buf, b"directory");
        assert_eq!(region.read_u64(PmOffset::new(1024)), 0xdead_beef);
        Ok(())
    }

    #[test]
    fn test_unaligned_words() -> Result<()> {
        let dir = tempdir().unwrap();
        let region = PmemRegion::create(dir.path().join("r.pm"), 4096, FlushMode::Fence)?;

        region.write_ordered_u64(PmOffset::new(13), u64::MAX - 7)?;
        region.write_ordered_u32(PmOffset::new(31), 77)?;
        assert_eq!(region.read_u64(PmOffset::new(13)), u64::MAX - 7);
        assert_eq!(region.read_u32(PmOffset::new(31)), 77);
        Ok(())
    }

    #[test]
    fn test_fill_and_range_check() -> Result<()> {
        let dir = tempdir().unwrap();
        let region = PmemRegion::create(dir.path().join("r.pm"), 4096, FlushMode::Fence)?;

        region.fill_unordered(PmOffset::new(100), 16, 0xab);
        assert_eq!(region.read_u8(PmOffset::new(115)), 0xab);
        assert_eq!(region.read_u8(PmOffset::new(116)), 0);

        assert!(region.check_range(PmOffset::new(4000), 96).is_ok());
        assert!(region.check_range(PmOffset::new(4000), 97).is_err());
        assert!(region.check_range(PmOffset::new(u64::MAX), 2).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_size_rejected() {
        let dir = tempdir().unwrap();
        assert!(PmemRegion::create(dir.path().join("r.pm"), 0, FlushMode::Fence).is_err());
    }
}
