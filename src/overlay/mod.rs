//! Durable per-inode storage and the InodeNumber allocator.
//!
//! The on-disk layout is fixed: a lock file, an `info`
//! file with a magic and format version, 256 two-hex-digit shard
//! directories, a `tmp` directory for atomic rename-in-place writes, and a
//! `next-inode-number` file consumed on clean-shutdown startup.

mod fs_overlay;

pub use fs_overlay::FsOverlay;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::inode::{DirEntry, InodeNumber};

/// `1` is reserved for the root; overlay-allocated inos must exceed it.
pub const ROOT_NODE_ID: u64 = 1;

/// A directory listing as persisted in the overlay: name -> entry.
pub type DirListing = BTreeMap<String, DirEntry>;

/// Durable per-inode storage and the ino allocator.
///
/// Implementations own a lock file preventing more than one daemon from
/// using the same overlay directory concurrently.
pub trait Overlay: Send + Sync {
    /// Reads the directory listing for `ino`. `NotFound` if the inode has
    /// no persisted overlay data.
    fn load_dir(&self, ino: InodeNumber) -> Result<DirListing>;

    /// Persists a directory listing for `ino`, atomically.
    fn save_dir(&self, ino: InodeNumber, listing: &DirListing) -> Result<()>;

    /// Reads and removes a directory's persisted listing in one step (used
    /// when dematerializing a directory back to a bare object-id).
    fn load_and_remove_dir(&self, ino: InodeNumber) -> Result<DirListing>;

    /// Reads a materialized file's content.
    fn load_file(&self, ino: InodeNumber) -> Result<Vec<u8>>;

    /// Persists a materialized file's content, atomically.
    fn save_file(&self, ino: InodeNumber, content: &[u8]) -> Result<()>;

    /// Removes any persisted blob for `ino`. A no-op if none exists.
    fn remove(&self, ino: InodeNumber) -> Result<()>;

    /// Whether `ino` has persisted overlay data (directory or file).
    fn has_data(&self, ino: InodeNumber) -> bool;

    /// Allocates and returns the next unused [`InodeNumber`]. Every
    /// returned value exceeds [`ROOT_NODE_ID`] and is never returned again
    /// for the lifetime of this overlay.
    fn allocate_next_ino(&self) -> InodeNumber;

    /// Writes the clean-shutdown `next-inode-number` file. Skipping this
    /// call (e.g. on an unclean shutdown) forces the next open to fall back
    /// to a full shard scan.
    fn close(&self) -> Result<()>;
}

/// Shared ino-allocation bookkeeping used by every [`Overlay`]
/// implementation: a simple atomic counter seeded either from the
/// clean-shutdown file or from a full scan.
pub(crate) struct InoAllocator {
    next: AtomicU64,
}

impl InoAllocator {
    pub(crate) fn starting_at(next: u64) -> Self {
        Self {
            next: AtomicU64::new(next.max(ROOT_NODE_ID + 1)),
        }
    }

    pub(crate) fn allocate(&self) -> InodeNumber {
        let raw = self.next.fetch_add(1, Ordering::SeqCst);
        InodeNumber::new(raw).expect("allocator never returns 0")
    }

    pub(crate) fn peek_next(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
