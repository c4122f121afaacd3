//! Journal delta types: the two variants of change a checkout can observe.

use std::time::SystemTime;

use crate::relpath::RelativePath;

pub type SequenceNumber = u64;

/// The kind of filesystem entry a [`FileChangeDelta`] is about. Kept
/// deliberately small — this crate does not own the kernel-channel layer
/// that would otherwise hand us a richer dtype enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Whether a path existed before and after a change. Two of these describe
/// a rename or replace (one slot per path).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeInfo {
    pub existed_before: bool,
    pub existed_after: bool,
}

impl ChangeInfo {
    pub fn created() -> Self {
        Self {
            existed_before: false,
            existed_after: true,
        }
    }

    pub fn removed() -> Self {
        Self {
            existed_before: true,
            existed_after: false,
        }
    }

    pub fn changed() -> Self {
        Self {
            existed_before: true,
            existed_after: true,
        }
    }
}

/// A single observed change to one or two paths.
#[derive(Clone, Debug)]
pub struct FileChangeDelta {
    pub path1: RelativePath,
    pub path2: Option<RelativePath>,
    pub info1: ChangeInfo,
    pub info2: Option<ChangeInfo>,
    pub dtype: DType,
    pub sequence: SequenceNumber,
    pub time: SystemTime,
}

impl FileChangeDelta {
    /// Whether this delta and `other` describe the same path(s) with the
    /// same change shape, and so are eligible for coalescing.
    pub(super) fn same_shape(&self, other: &FileChangeDelta) -> bool {
        self.path1 == other.path1
            && self.path2 == other.path2
            && self.info1 == other.info1
            && self.info2 == other.info2
    }

    fn rough_memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.path1.as_str().len()
            + self.path2.as_ref().map(|p| p.as_str().len()).unwrap_or(0)
    }
}

/// A checkout root transition, optionally carrying the set of paths left in
/// an unclean state by the transition.
#[derive(Clone, Debug)]
pub struct RootUpdateDelta {
    pub from_root: String,
    pub to_root: String,
    pub unclean_paths: Option<Vec<RelativePath>>,
    pub sequence: SequenceNumber,
    pub time: SystemTime,
}

impl RootUpdateDelta {
    fn rough_memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.from_root.len()
            + self.to_root.len()
            + self
                .unclean_paths
                .as_ref()
                .map(|paths| paths.iter().map(|p| p.as_str().len()).sum())
                .unwrap_or(0)
    }
}

/// Either delta variant, as returned by [`crate::journal::Journal::for_each_delta`]-style
/// iteration and used internally to compare sequence numbers across deques.
#[derive(Clone, Debug)]
pub enum JournalDelta {
    FileChange(FileChangeDelta),
    RootUpdate(RootUpdateDelta),
}

impl JournalDelta {
    pub fn sequence(&self) -> SequenceNumber {
        match self {
            JournalDelta::FileChange(d) => d.sequence,
            JournalDelta::RootUpdate(d) => d.sequence,
        }
    }

    pub fn time(&self) -> SystemTime {
        match self {
            JournalDelta::FileChange(d) => d.time,
            JournalDelta::RootUpdate(d) => d.time,
        }
    }

    pub(super) fn rough_memory_usage(&self) -> usize {
        match self {
            JournalDelta::FileChange(d) => d.rough_memory_usage(),
            JournalDelta::RootUpdate(d) => d.rough_memory_usage(),
        }
    }
}
