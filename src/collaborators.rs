//! Trait-shaped contracts for the out-of-scope collaborators named in
//! the persisted checkout configuration.
//!
//! None of these are implemented by this crate — the object store, the
//! kernel channel, the fault injector and the outward control-socket service
//! surface are each owned by a different component of the daemon. Defining
//! the trait once here, the way a single trait can be implemented by
//! multiple backends elsewhere in a larger workspace, lets the inode
//! engine be compiled and tested in isolation.

use async_trait::async_trait;

use crate::checkout_config::parent_commit::RootId;
use crate::error::Result;
use crate::journal::{JournalDeltaRange, SequenceNumber};
use crate::object_id::ObjectId;

/// A single child entry as listed by the (out-of-scope) object store.
#[derive(Clone, Debug)]
pub struct TreeEntry {
    pub name: String,
    pub mode: u32,
    pub id: ObjectId,
}

/// A tree as returned by the object store: an ordered list of children.
#[derive(Clone, Debug, Default)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

/// Metadata about a blob without fetching its content.
#[derive(Clone, Copy, Debug)]
pub struct BlobMetadata {
    pub size: u64,
    pub sha1: [u8; 20],
}

/// The content-addressed backing store. Consumed by the inode engine to
/// resolve non-materialized Trees and Files; never implemented by this
/// crate, which by design does not define the object store format.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_tree(&self, id: &ObjectId) -> Result<Tree>;
    async fn get_blob(&self, id: &ObjectId) -> Result<Vec<u8>>;
    async fn get_blob_size(&self, id: &ObjectId) -> Result<u64>;
    async fn get_blob_metadata(&self, id: &ObjectId) -> Result<BlobMetadata>;
}

/// A single observed kernel-level mutation, already shaped for the Journal
/// but not yet recorded. The kernel channel (FUSE/NFS/ProjFS) produces these;
/// the inode engine consumes them to feed [`crate::journal::Journal`].
#[derive(Clone, Debug)]
pub enum KernelMutationEvent {
    Created { path: crate::relpath::RelativePath },
    Removed { path: crate::relpath::RelativePath },
    Changed { path: crate::relpath::RelativePath },
    Renamed {
        from: crate::relpath::RelativePath,
        to: crate::relpath::RelativePath,
    },
}

/// The kernel channel boundary: produces mutation events mapped onto the
/// Journal, and consumes directory/attribute replies resolved through the
/// InodeMap. No wire codec (FUSE/NFS/ProjFS) is implemented here.
#[async_trait]
pub trait KernelChannel: Send + Sync {
    async fn next_mutation(&self) -> Option<KernelMutationEvent>;
}

/// Per-call test checkpoint keyed by a site name and a path, used only by
/// tests to inject latency or failures at specific points in the load/unload
/// paths. Production code must be able to run with no fault injector
/// configured at all, so every call site treats `None` as "never fails".
#[async_trait]
pub trait FaultInjector: Send + Sync {
    async fn check(&self, site_name: &str, path: &str) -> Result<()>;
}

/// The outward control-socket surface, an RPC service exposed by the daemon
/// on top of this crate's components. Defined here as the trait boundary
/// only; no transport is implemented.
#[async_trait]
pub trait CoreService: Send + Sync {
    async fn lookup_inode(&self, ino: crate::inode::InodeNumber) -> Result<()>;
    async fn get_journal_range(&self, from: SequenceNumber) -> Result<Option<JournalDeltaRange>>;
    async fn get_parent_commit(&self) -> Result<crate::checkout_config::parent_commit::ParentCommit>;
    async fn set_checked_out_commit(&self, root: RootId) -> Result<()>;
    async fn set_checkout_in_progress(&self, from: RootId, to: RootId) -> Result<()>;
}
