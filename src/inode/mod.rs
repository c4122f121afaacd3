//! Inode identity and in-memory representation.
//!
//! An [`InodeNumber`] is the stable handle a kernel channel uses to refer to
//! a file or directory. The data behind it is either a [`TreeData`]
//! (directory) or a [`FileData`] (regular file), tagged rather than
//! inherited from a common base, per the "virtual dispatch on Tree vs File"
//! design note: callers match on [`InodeKind`] instead of calling virtual
//! methods.

pub mod map;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::object_id::ObjectId;

/// `0` is invalid, `1` is the root. Ordered only by equality;
/// `Ord`/`Hash` are derived purely so this type can key a `BTreeMap`/
/// `HashMap` — no code may depend on the relative order of two distinct
/// `InodeNumber`s meaning anything.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeNumber(u64);

impl InodeNumber {
    pub const ROOT: InodeNumber = InodeNumber(1);

    /// Returns `None` for the reserved-invalid value `0`.
    pub fn new(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(InodeNumber(raw))
        }
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for InodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ino({})", self.0)
    }
}

impl std::fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a materialized directory listing.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub mode: u32,
    /// `None` means there is no known object-store backing (the entry was
    /// created locally and has never been part of a committed tree). The
    /// legacy on-disk encoding used an empty string for this; this crate
    /// always prefers `None` and never emits the sentinel itself, only
    /// accepts it on takeover decode for backward compatibility.
    pub object_id: Option<ObjectId>,
}

/// Either variant of an in-memory, loaded inode.
pub enum InodeKind {
    Tree(TreeData),
    File(FileData),
}

/// A directory's in-memory state.
pub struct TreeData {
    /// `Some` iff the directory listing is materialized (stored in the
    /// Overlay); the keys are name components.
    pub entries: Option<BTreeMap<String, DirEntry>>,
    /// Non-null iff the tree is not materialized (Invariant I2).
    pub object_id: Option<ObjectId>,
}

impl TreeData {
    pub fn is_materialized(&self) -> bool {
        self.entries.is_some()
    }
}

/// A file's in-memory state.
pub struct FileData {
    pub mode: u32,
    pub executable: bool,
    pub content: FileContent,
}

/// Whether a file's bytes come from the object store or the Overlay.
pub enum FileContent {
    /// Clean: addressable by object-id, no local copy.
    Clean(ObjectId),
    /// Materialized: the byte stream lives in the Overlay, keyed by ino.
    Materialized,
}

/// A fully loaded, memory-resident inode.
///
/// Two independent counters live here:
/// - `fs_ref_count`: outstanding kernel-side references (lookup - forget).
///   Carried over from / to [`map::UnloadedInodeRecord`] across load/unload.
/// - the number of outstanding [`map::InodeRef`] guards, tracked internally
///   by the owning [`map::InodeMap`] rather than on this struct, since
///   releasing the last one requires taking the map's lock to decide
///   whether to unload.
pub struct LoadedInode {
    pub ino: InodeNumber,
    pub(crate) fs_ref_count: AtomicU64,
    pub(crate) unlinked: AtomicBool,
    pub(crate) atime: Mutex<SystemTime>,
    pub data: Mutex<InodeKind>,
    /// `(parent ino, name)` this inode was last reached by, or `None` for
    /// the root. Needed to rebuild an [`map::UnloadedInodeRecord`] if this
    /// inode is unloaded without ever having had one (e.g. right after a
    /// takeover-import load); updated on rename.
    pub(crate) location: Mutex<Option<(InodeNumber, String)>>,
    /// Mode bits, tracked here (not just in a parent's `DirEntry`) because a
    /// materialized `TreeData` carries no mode of its own.
    pub(crate) mode: Mutex<u32>,
}

impl LoadedInode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ino: InodeNumber,
        data: InodeKind,
        fs_ref_count: u64,
        unlinked: bool,
        now: SystemTime,
        mode: u32,
        location: Option<(InodeNumber, String)>,
    ) -> Self {
        Self {
            ino,
            fs_ref_count: AtomicU64::new(fs_ref_count),
            unlinked: AtomicBool::new(unlinked),
            atime: Mutex::new(now),
            data: Mutex::new(data),
            location: Mutex::new(location),
            mode: Mutex::new(mode),
        }
    }

    pub fn fs_ref_count(&self) -> u64 {
        self.fs_ref_count.load(Ordering::SeqCst)
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::SeqCst)
    }

    pub fn is_tree(&self) -> bool {
        matches!(*self.data.lock(), InodeKind::Tree(_))
    }

    pub fn touch(&self, now: SystemTime) {
        *self.atime.lock() = now;
    }

    pub fn atime(&self) -> SystemTime {
        *self.atime.lock()
    }

    pub fn mode(&self) -> u32 {
        *self.mode.lock()
    }

    pub fn location(&self) -> Option<(InodeNumber, String)> {
        self.location.lock().clone()
    }

    /// Called on rename: updates the `(parent, name)` this inode is last
    /// known to be reachable by.
    pub fn set_location(&self, parent: InodeNumber, name: String) {
        *self.location.lock() = Some((parent, name));
    }

    pub fn mark_unlinked(&self) {
        self.unlinked.store(true, Ordering::SeqCst);
    }
}

/// A record for an inode the map knows about but does not hold in memory.
///
/// Corresponds to the on-disk `UnloadedInode` record.
#[derive(Clone, Debug)]
pub struct UnloadedInodeRecord {
    pub parent: InodeNumber,
    pub name: String,
    pub is_unlinked: bool,
    pub mode: u32,
    pub object_id: Option<ObjectId>,
    pub fs_ref_count: u64,
}
