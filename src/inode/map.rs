//! The InodeMap: single source of truth for the set of live inodes in a
//! mount, serializing every identity transition (load, unload, unlink,
//! takeover) behind one lock.
//!
//! The inode graph is represented as an arena keyed by [`InodeNumber`]
//! rather than a tree of owning pointers with parent back-references, per
//! the "reference-counted inodes with cyclic parent/child pointers" design
//! note: parent links are plain `InodeNumber`s resolved back through this
//! map, and the kernel-visible reference count is tracked separately from
//! Rust ownership.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::bug;
use crate::error::{CoreError, Result};
use crate::object_id::ObjectId;
use crate::overlay::Overlay;
use crate::time_util::Clock;

use super::{FileContent, FileData, InodeKind, InodeNumber, LoadedInode, TreeData, UnloadedInodeRecord};

/// A takeover-serializable unloaded inode, as exchanged with a successor
/// daemon at shutdown/startup.
#[derive(Clone, Debug)]
pub struct TakeoverUnloadedInode {
    pub ino: InodeNumber,
    pub parent: InodeNumber,
    pub name: String,
    pub is_unlinked: bool,
    pub mode: u32,
    /// Legacy encoding: `None` or `Some("")` both decode to "no object id".
    /// This crate never emits `Some("")` itself.
    pub object_id_hex: Option<String>,
    pub fs_ref_count: u64,
}

impl TakeoverUnloadedInode {
    fn decode_object_id(&self) -> Option<ObjectId> {
        match &self.object_id_hex {
            None => None,
            Some(s) if s.is_empty() => None,
            Some(s) => data_encoding::HEXLOWER
                .decode(s.as_bytes())
                .ok()
                .map(ObjectId::from),
        }
    }

    fn encode_object_id(id: &Option<ObjectId>) -> Option<String> {
        id.as_ref()
            .map(|id| data_encoding::HEXLOWER.encode(id.as_bytes()))
    }
}

/// Aggregate counts used to check the invariant `|loaded| = tree-count +
/// file-count`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InodeMapStats {
    pub loaded_tree_count: usize,
    pub loaded_file_count: usize,
    pub unloaded_count: usize,
}

type LoadOutcome = std::result::Result<Arc<LoadedInode>, Arc<CoreError>>;

struct LoadingState {
    record: UnloadedInodeRecord,
    waiters: Vec<oneshot::Sender<LoadOutcome>>,
}

struct State {
    initialized: bool,
    loaded: HashMap<InodeNumber, Arc<LoadedInode>>,
    tree_count: usize,
    file_count: usize,
    unloaded: HashMap<InodeNumber, UnloadedInodeRecord>,
    /// ino currently being loaded, with its waiter queue (FIFO).
    loading: HashMap<InodeNumber, LoadingState>,
    /// external (non-InodeMap-owned) strong references per loaded ino.
    external_refs: HashMap<InodeNumber, u64>,
    shutting_down: bool,
    unmounted: bool,
}

impl State {
    fn stats(&self) -> InodeMapStats {
        InodeMapStats {
            loaded_tree_count: self.tree_count,
            loaded_file_count: self.file_count,
            unloaded_count: self.unloaded.len(),
        }
    }
}

/// The InodeMap. Cheap to clone (an `Arc` handle around the shared state).
#[derive(Clone)]
pub struct InodeMap {
    inner: Arc<Inner>,
}

struct Inner {
    state: parking_lot::Mutex<State>,
    /// When true, unknown inos fail with `Stale` (NFS loopback semantics);
    /// otherwise they fail with `Bug`.
    nfs_mode: bool,
    clock: Arc<dyn Clock>,
}

/// An RAII strong reference to a loaded inode, analogous to a kernel-side
/// handle that keeps an inode's in-memory state alive. Dropping the last
/// outstanding `InodeRef` for an ino invokes the map's unload decision.
pub struct InodeRef {
    ino: InodeNumber,
    inode: Arc<LoadedInode>,
    map: InodeMap,
}

impl InodeRef {
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }
}

impl std::ops::Deref for InodeRef {
    type Target = LoadedInode;
    fn deref(&self) -> &LoadedInode {
        &self.inode
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        self.map.inc_external_ref(self.ino);
        InodeRef {
            ino: self.ino,
            inode: self.inode.clone(),
            map: self.map.clone(),
        }
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        self.map.on_inode_ref_dropped(self.ino);
    }
}

impl InodeMap {
    pub fn new(nfs_mode: bool, clock: Arc<dyn Clock>) -> Self {
        InodeMap {
            inner: Arc::new(Inner {
                state: parking_lot::Mutex::new(State {
                    initialized: false,
                    loaded: HashMap::new(),
                    tree_count: 0,
                    file_count: 0,
                    unloaded: HashMap::new(),
                    loading: HashMap::new(),
                    external_refs: HashMap::new(),
                    shutting_down: false,
                    unmounted: false,
                }),
                nfs_mode,
                clock,
            }),
        }
    }

    fn unknown_ino_error(&self, ino: InodeNumber) -> CoreError {
        if self.inner.nfs_mode {
            CoreError::stale(format!("unknown inode {ino}"))
        } else {
            bug!("lookup of unknown inode {}", ino)
        }
    }

    /// Installs the root into `loaded`. Fails if already initialized.
    pub fn initialize(&self, root_data: InodeKind, root_mode: u32) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.initialized {
            return Err(CoreError::generic("InodeMap already initialized"));
        }
        let is_tree = matches!(root_data, InodeKind::Tree(_));
        let root = Arc::new(LoadedInode::new(
            InodeNumber::ROOT,
            root_data,
            0,
            false,
            self.inner.clock.now(),
            root_mode,
            None,
        ));
        st.loaded.insert(InodeNumber::ROOT, root);
        if is_tree {
            st.tree_count += 1;
        } else {
            st.file_count += 1;
        }
        st.initialized = true;
        Ok(())
    }

    /// Installs the root, then inserts each serialized `UnloadedInode`,
    /// asserting `fs_ref_count >= 0` (trivially true for `u64`, but a
    /// duplicate ino is still rejected) and decoding the optional
    /// object-id (empty string decodes to "no id").
    pub fn initialize_from_takeover(
        &self,
        root_data: InodeKind,
        root_mode: u32,
        serialized: Vec<TakeoverUnloadedInode>,
    ) -> Result<()> {
        self.initialize(root_data, root_mode)?;
        let mut st = self.inner.state.lock();
        for entry in serialized {
            if st.unloaded.contains_key(&entry.ino) || st.loaded.contains_key(&entry.ino) {
                return Err(bug!("duplicate ino {} in takeover payload", entry.ino));
            }
            let object_id = entry.decode_object_id();
            st.unloaded.insert(
                entry.ino,
                UnloadedInodeRecord {
                    parent: entry.parent,
                    name: entry.name,
                    is_unlinked: entry.is_unlinked,
                    mode: entry.mode,
                    object_id,
                    fs_ref_count: entry.fs_ref_count,
                },
            );
        }
        Ok(())
    }

    /// Rebuilds `unloaded` by traversing persisted directory listings from
    /// the root down. Recurses into a child only if that child itself has
    /// persisted overlay data; every reconstructed entry gets
    /// `fs_ref_count == 1`.
    pub fn initialize_from_overlay(&self, root_data: InodeKind, root_mode: u32, overlay: &dyn Overlay) -> Result<()> {
        self.initialize(root_data, root_mode)?;

        fn walk(
            overlay: &dyn Overlay,
            parent: InodeNumber,
            unloaded: &mut HashMap<InodeNumber, UnloadedInodeRecord>,
        ) -> Result<()> {
            let listing = match overlay.load_dir(parent) {
                Ok(listing) => listing,
                Err(CoreError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            for (name, entry) in listing.iter() {
                unloaded.insert(
                    entry.ino,
                    UnloadedInodeRecord {
                        parent,
                        name: name.clone(),
                        is_unlinked: false,
                        mode: entry.mode,
                        object_id: entry.object_id.clone(),
                        fs_ref_count: 1,
                    },
                );
                if overlay.has_data(entry.ino) {
                    walk(overlay, entry.ino, unloaded)?;
                }
            }
            Ok(())
        }

        let mut st = self.inner.state.lock();
        walk(overlay, InodeNumber::ROOT, &mut st.unloaded)?;
        Ok(())
    }

    pub fn stats(&self) -> InodeMapStats {
        self.inner.state.lock().stats()
    }

    /// Looks up `ino`, loading it (and any unloaded ancestors) if necessary.
    #[instrument(skip(self))]
    pub async fn lookup(&self, ino: InodeNumber) -> Result<InodeRef> {
        loop {
            enum Step {
                Loaded(Arc<LoadedInode>),
                Wait(oneshot::Receiver<LoadOutcome>),
                StartLoad(UnloadedInodeRecord),
            }

            let step = {
                let mut st = self.inner.state.lock();
                if let Some(inode) = st.loaded.get(&ino) {
                    Step::Loaded(inode.clone())
                } else if let Some(loading) = st.loading.get_mut(&ino) {
                    let (tx, rx) = oneshot::channel();
                    loading.waiters.push(tx);
                    Step::Wait(rx)
                } else if let Some(record) = st.unloaded.get(&ino).cloned() {
                    st.loading.insert(
                        ino,
                        LoadingState {
                            record: record.clone(),
                            waiters: Vec::new(),
                        },
                    );
                    Step::StartLoad(record)
                } else {
                    return Err(self.unknown_ino_error(ino));
                }
            };

            match step {
                Step::Loaded(inode) => {
                    self.inc_external_ref(ino);
                    return Ok(InodeRef {
                        ino,
                        inode,
                        map: self.clone(),
                    });
                }
                Step::Wait(rx) => {
                    let outcome = rx
                        .await
                        .map_err(|_| bug!("load waiter dropped without a result for {}", ino))?;
                    match outcome {
                        Ok(inode) => {
                            self.inc_external_ref(ino);
                            return Ok(InodeRef {
                                ino,
                                inode,
                                map: self.clone(),
                            });
                        }
                        Err(e) => return Err((*e).clone()),
                    }
                }
                Step::StartLoad(record) => {
                    let result = self.do_load(ino, &record).await;
                    self.finish_load(ino, result.clone());
                    match result {
                        Ok(inode) => {
                            self.inc_external_ref(ino);
                            return Ok(InodeRef {
                                ino,
                                inode,
                                map: self.clone(),
                            });
                        }
                        Err(e) => return Err((*e).clone()),
                    }
                }
            }
        }
    }

    /// The actual load procedure: walk upward until a loaded parent is
    /// found (recursing through `lookup` itself, so concurrent loads of
    /// shared ancestors are deduplicated), then construct this ino's inode
    /// either from the parent's materialized directory entry (preferred,
    /// keeps invariant I2) or — if the parent is unlinked or not
    /// materialized — directly from the recorded `UnloadedInodeRecord`
    /// (the "unlinked-child load path").
    fn do_load<'a>(
        &'a self,
        ino: InodeNumber,
        record: &'a UnloadedInodeRecord,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = LoadOutcome> + Send + 'a>> {
        Box::pin(async move {
            let parent = self.lookup(record.parent).await.map_err(Arc::new)?;

            let (mode, object_id) = {
                let data = parent.data.lock();
                match &*data {
                    InodeKind::Tree(tree) if !parent.is_unlinked() => {
                        match tree.entries.as_ref().and_then(|e| e.get(&record.name)) {
                            Some(entry) => (entry.mode, entry.object_id.clone()),
                            None => (record.mode, record.object_id.clone()),
                        }
                    }
                    _ => (record.mode, record.object_id.clone()),
                }
            };

            let data = if mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
                InodeKind::Tree(TreeData {
                    entries: None,
                    object_id,
                })
            } else {
                InodeKind::File(FileData {
                    mode,
                    executable: mode & 0o111 != 0,
                    content: match object_id {
                        Some(id) => FileContent::Clean(id),
                        None => FileContent::Materialized,
                    },
                })
            };

            Ok(Arc::new(LoadedInode::new(
                ino,
                data,
                record.fs_ref_count,
                record.is_unlinked,
                self.inner.clock.now(),
                mode,
                Some((record.parent, record.name.clone())),
            )))
        })
    }

    fn finish_load(&self, ino: InodeNumber, result: LoadOutcome) {
        let mut st = self.inner.state.lock();
        let loading = st.loading.remove(&ino);
        match &result {
            Ok(inode) => {
                st.unloaded.remove(&ino);
                match &*inode.data.lock() {
                    InodeKind::Tree(_) => st.tree_count += 1,
                    InodeKind::File(_) => st.file_count += 1,
                }
                st.loaded.insert(ino, inode.clone());
            }
            Err(_) => {
                // leave the unloaded entry intact so future lookups may retry
            }
        }
        drop(st);
        if let Some(loading) = loading {
            for tx in loading.waiters {
                let _ = tx.send(result.clone());
            }
        }
    }

    fn inc_external_ref(&self, ino: InodeNumber) {
        let mut st = self.inner.state.lock();
        *st.external_refs.entry(ino).or_insert(0) += 1;
    }

    fn on_inode_ref_dropped(&self, ino: InodeNumber) {
        let should_notify = {
            let mut st = self.inner.state.lock();
            match st.external_refs.get_mut(&ino) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        st.external_refs.remove(&ino);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if should_notify {
            self.on_inode_unreferenced(ino);
        }
    }

    /// Called when the last strong (non-InodeMap-owned) reference to a
    /// loaded inode is dropped. Under the map lock: if shutting down or the
    /// inode is unlinked with `fs_ref_count == 0`, unload synchronously.
    /// Unlinked inodes with outstanding `fs_ref_count` are kept as
    /// `UnloadedInode`; materialized directories are kept if any descendant
    /// is kept (approximated here by never evicting a materialized tree
    /// directory purely due to zero external refs unless it is unlinked).
    fn on_inode_unreferenced(&self, ino: InodeNumber) {
        let mut st = self.inner.state.lock();
        let Some(inode) = st.loaded.get(&ino).cloned() else {
            return;
        };
        let should_unload = st.shutting_down || (inode.is_unlinked() && inode.fs_ref_count() == 0);
        if !should_unload {
            return;
        }
        st.loaded.remove(&ino);
        match &*inode.data.lock() {
            InodeKind::Tree(_) => st.tree_count -= 1,
            InodeKind::File(_) => st.file_count -= 1,
        }
        if inode.fs_ref_count() > 0 {
            // Preserve as an UnloadedInode: still reachable by ino via open
            // FS handles even though unlinked.
            if let Some(record) = self.record_for(&inode, &st) {
                st.unloaded.insert(ino, record);
            }
        }
        debug!(ino = ino.get(), "unloaded inode");
    }

    fn record_for(&self, inode: &LoadedInode, st: &State) -> Option<UnloadedInodeRecord> {
        // A prior `unloaded` entry (e.g. this ino was loaded, then unloaded
        // before) takes precedence, since its `object_id` reflects whatever
        // was last persisted. Otherwise fall back to the inode's own
        // `location`, populated at load time and updated on rename — this
        // is what makes a just-loaded inode's UnloadedInodeRecord
        // reconstructible even though it was never previously unloaded.
        if let Some(existing) = st.unloaded.get(&inode.ino) {
            return Some(existing.clone());
        }
        let (parent, name) = inode.location()?;
        let object_id = match &*inode.data.lock() {
            InodeKind::Tree(tree) => tree.object_id.clone(),
            InodeKind::File(file) => match &file.content {
                FileContent::Clean(id) => Some(id.clone()),
                FileContent::Materialized => None,
            },
        };
        Some(UnloadedInodeRecord {
            parent,
            name,
            is_unlinked: inode.is_unlinked(),
            mode: inode.mode(),
            object_id,
            fs_ref_count: inode.fs_ref_count(),
        })
    }

    /// Decrements the kernel-side reference counter for `ino` by `n`.
    pub fn dec_fs_refcount(&self, ino: InodeNumber, n: u64) -> Result<()> {
        enum Target {
            Loaded(Arc<LoadedInode>),
            UnloadedZero,
            UnloadedNonZero,
        }

        let target = {
            let mut st = self.inner.state.lock();
            if let Some(inode) = st.loaded.get(&ino) {
                Target::Loaded(inode.clone())
            } else if let Some(record) = st.unloaded.get_mut(&ino) {
                record.fs_ref_count = record
                    .fs_ref_count
                    .checked_sub(n)
                    .ok_or_else(|| bug!("fs_ref_count underflow for {}", ino))?;
                if record.fs_ref_count == 0 {
                    Target::UnloadedZero
                } else {
                    Target::UnloadedNonZero
                }
            } else {
                return Err(self.unknown_ino_error(ino));
            }
        };

        match target {
            Target::Loaded(inode) => {
                let prev = inode.fs_ref_count.fetch_sub(n, Ordering::SeqCst);
                if prev < n {
                    return Err(bug!("fs_ref_count underflow for {}", ino));
                }
                if prev - n == 0 && inode.is_unlinked() {
                    self.on_inode_unreferenced(ino);
                }
                Ok(())
            }
            Target::UnloadedZero => {
                self.inner.state.lock().unloaded.remove(&ino);
                Ok(())
            }
            Target::UnloadedNonZero => Ok(()),
        }
    }

    /// Sweeps unloaded unlinked inodes and loaded unlinked inodes whose
    /// atime is older than `threshold`, clearing their fs refcount so they
    /// can be destroyed through the normal unload path. Returns the number
    /// of inodes released.
    pub fn forget_stale_inodes(&self, threshold: Duration) -> usize {
        let now = self.inner.clock.now();
        let mut released = 0;

        let stale_loaded: Vec<InodeNumber> = {
            let st = self.inner.state.lock();
            st.loaded
                .iter()
                .filter(|(_, inode)| {
                    inode.is_unlinked()
                        && now
                            .duration_since(inode.atime())
                            .map(|age| age >= threshold)
                            .unwrap_or(false)
                })
                .map(|(ino, _)| *ino)
                .collect()
        };
        for ino in stale_loaded {
            let count = self
                .inner
                .state
                .lock()
                .loaded
                .get(&ino)
                .map(|i| i.fs_ref_count())
                .unwrap_or(0);
            if count > 0 {
                if self.dec_fs_refcount(ino, count).is_ok() {
                    released += 1;
                }
            }
        }

        let stale_unloaded: Vec<InodeNumber> = {
            let st = self.inner.state.lock();
            st.unloaded
                .iter()
                .filter(|(_, r)| r.is_unlinked && r.fs_ref_count > 0)
                .map(|(ino, _)| *ino)
                .collect()
        };
        for ino in stale_unloaded {
            let count = self
                .inner
                .state
                .lock()
                .unloaded
                .get(&ino)
                .map(|r| r.fs_ref_count)
                .unwrap_or(0);
            if count > 0 && self.dec_fs_refcount(ino, count).is_ok() {
                released += 1;
            }
        }
        released
    }

    /// Marks shutdown in progress, drops the strong reference to the root,
    /// walks and destroys every unreferenced inode, then serializes every
    /// remaining `unloaded` entry into a takeover blob (empty if
    /// `allow_takeover` is false).
    #[instrument(skip(self))]
    pub async fn shutdown(&self, allow_takeover: bool) -> Result<Vec<TakeoverUnloadedInode>> {
        {
            let mut st = self.inner.state.lock();
            if st.shutting_down {
                return Err(CoreError::generic("shutdown already in progress"));
            }
            st.shutting_down = true;
        }

        self.on_inode_unreferenced(InodeNumber::ROOT);

        // Destroy every loaded inode with no outstanding external refs and
        // fs_ref_count == 0 (unlinked) or shutting_down (always true now).
        loop {
            let candidates: Vec<InodeNumber> = {
                let st = self.inner.state.lock();
                st.loaded.keys().copied().collect()
            };
            if candidates.is_empty() {
                break;
            }
            let mut made_progress = false;
            for ino in candidates {
                let still_loaded = self.inner.state.lock().loaded.contains_key(&ino);
                if still_loaded {
                    self.on_inode_unreferenced(ino);
                    made_progress = true;
                }
            }
            if !made_progress {
                break;
            }
            if self.inner.state.lock().loaded.is_empty() {
                break;
            }
        }

        if !allow_takeover {
            return Ok(Vec::new());
        }

        let st = self.inner.state.lock();
        let mut out = Vec::with_capacity(st.unloaded.len());
        for (ino, record) in st.unloaded.iter() {
            out.push(TakeoverUnloadedInode {
                ino: *ino,
                parent: record.parent,
                name: record.name.clone(),
                is_unlinked: record.is_unlinked,
                mode: record.mode,
                object_id_hex: TakeoverUnloadedInode::encode_object_id(&record.object_id),
                fs_ref_count: record.fs_ref_count,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{DirListing, Overlay};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use std::time::UNIX_EPOCH;

    use crate::time_util::FakeClock;

    const ROOT_MODE: u32 = 0o040755;

    fn root_tree() -> InodeKind {
        InodeKind::Tree(TreeData {
            entries: Some(BTreeMap::new()),
            object_id: None,
        })
    }

    fn map() -> (InodeMap, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(UNIX_EPOCH));
        let map = InodeMap::new(false, clock.clone());
        map.initialize(root_tree(), ROOT_MODE).unwrap();
        (map, clock)
    }

    /// A minimal in-memory [`Overlay`] for exercising
    /// `initialize_from_overlay` without touching disk.
    #[derive(Default)]
    struct FakeOverlay {
        dirs: StdMutex<HashMap<InodeNumber, DirListing>>,
    }

    impl FakeOverlay {
        fn set_dir(&self, ino: InodeNumber, listing: DirListing) {
            self.dirs.lock().unwrap().insert(ino, listing);
        }
    }

    impl Overlay for FakeOverlay {
        fn load_dir(&self, ino: InodeNumber) -> Result<DirListing> {
            self.dirs
                .lock()
                .unwrap()
                .get(&ino)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("no dir for {ino}")))
        }
        fn save_dir(&self, ino: InodeNumber, listing: &DirListing) -> Result<()> {
            self.dirs.lock().unwrap().insert(ino, listing.clone());
            Ok(())
        }
        fn load_and_remove_dir(&self, ino: InodeNumber) -> Result<DirListing> {
            self.dirs
                .lock()
                .unwrap()
                .remove(&ino)
                .ok_or_else(|| CoreError::not_found(format!("no dir for {ino}")))
        }
        fn load_file(&self, _ino: InodeNumber) -> Result<Vec<u8>> {
            unimplemented!("not needed for these tests")
        }
        fn save_file(&self, _ino: InodeNumber, _content: &[u8]) -> Result<()> {
            unimplemented!("not needed for these tests")
        }
        fn remove(&self, ino: InodeNumber) -> Result<()> {
            self.dirs.lock().unwrap().remove(&ino);
            Ok(())
        }
        fn has_data(&self, ino: InodeNumber) -> bool {
            self.dirs.lock().unwrap().contains_key(&ino)
        }
        fn allocate_next_ino(&self) -> InodeNumber {
            unimplemented!("not needed for these tests")
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn initialize_installs_root_and_counts() {
        let (map, _clock) = map();
        let stats = map.stats();
        assert_eq!(stats.loaded_tree_count, 1);
        assert_eq!(stats.loaded_file_count, 0);
        assert_eq!(stats.unloaded_count, 0);
        assert!(map.initialize(root_tree(), ROOT_MODE).is_err());
    }

    #[test]
    fn stats_satisfy_loaded_equals_tree_plus_file() {
        let (map, _clock) = map();
        let stats = map.stats();
        assert_eq!(
            stats.loaded_tree_count + stats.loaded_file_count,
            1,
            "|loaded| must equal tree-count + file-count"
        );
    }

    /// initialize with root ino 1; takeover payload
    /// lists a single unloaded child. `lookup` loads it, removes it from
    /// `unloaded`, and `shutdown(true)` re-emits the same takeover record.
    #[tokio::test]
    async fn takeover_round_trips_through_lookup_and_shutdown() {
        let clock = Arc::new(FakeClock::new(UNIX_EPOCH));
        let map = InodeMap::new(false, clock);
        let child_ino = InodeNumber::new(5).unwrap();
        map.initialize_from_takeover(
            root_tree(),
            ROOT_MODE,
            vec![TakeoverUnloadedInode {
                ino: child_ino,
                parent: InodeNumber::ROOT,
                name: "a".to_string(),
                is_unlinked: false,
                mode: 0o100644,
                object_id_hex: Some("aa".to_string()),
                fs_ref_count: 2,
            }],
        )
        .unwrap();

        let loaded = map.lookup(child_ino).await.unwrap();
        assert_eq!(loaded.ino(), child_ino);
        assert_eq!(map.stats().unloaded_count, 0);
        drop(loaded);

        let takeover = map.shutdown(true).await.unwrap();
        assert_eq!(takeover.len(), 1);
        assert_eq!(takeover[0].ino, child_ino);
        assert_eq!(takeover[0].name, "a");
        assert_eq!(takeover[0].fs_ref_count, 2);
    }

    #[test]
    fn takeover_rejects_duplicate_ino() {
        let clock = Arc::new(FakeClock::new(UNIX_EPOCH));
        let map = InodeMap::new(false, clock);
        let dup = InodeNumber::new(5).unwrap();
        let entry = TakeoverUnloadedInode {
            ino: dup,
            parent: InodeNumber::ROOT,
            name: "a".to_string(),
            is_unlinked: false,
            mode: 0o100644,
            object_id_hex: None,
            fs_ref_count: 0,
        };
        let err = map
            .initialize_from_takeover(root_tree(), ROOT_MODE, vec![entry.clone(), entry])
            .unwrap_err();
        assert!(matches!(err, CoreError::Bug(_)));
    }

    /// An overlay populated with directory listings rehydrates `unloaded`
    /// only for children that themselves have persisted overlay data, each
    /// with `fs_ref_count == 1`.
    #[test]
    fn overlay_rehydration_only_recurses_into_materialized_children() {
        let overlay = FakeOverlay::default();
        let child = InodeNumber::new(2).unwrap();
        let grandchild = InodeNumber::new(3).unwrap();
        let leaf_without_data = InodeNumber::new(4).unwrap();

        let mut root_listing = DirListing::new();
        root_listing.insert(
            "dir".to_string(),
            crate::inode::DirEntry {
                ino: child,
                mode: 0o040755,
                object_id: None,
            },
        );
        root_listing.insert(
            "file".to_string(),
            crate::inode::DirEntry {
                ino: leaf_without_data,
                mode: 0o100644,
                object_id: Some(ObjectId::from(vec![1, 2, 3])),
            },
        );
        overlay.set_dir(InodeNumber::ROOT, root_listing);

        let mut child_listing = DirListing::new();
        child_listing.insert(
            "inner".to_string(),
            crate::inode::DirEntry {
                ino: grandchild,
                mode: 0o100644,
                object_id: None,
            },
        );
        overlay.set_dir(child, child_listing);
        // grandchild has no persisted dir entry of its own (it's a file).

        let clock = Arc::new(FakeClock::new(UNIX_EPOCH));
        let map = InodeMap::new(false, clock);
        map.initialize_from_overlay(root_tree(), ROOT_MODE, &overlay).unwrap();

        let stats = map.stats();
        assert_eq!(stats.unloaded_count, 3);
    }

    /// Unloaded unlinked records with an outstanding fs-refcount are swept
    /// unconditionally (they carry no individual atime), matching the
    /// "unloaded unlinked inodes" half of `forget_stale_inodes`'s contract.
    #[test]
    fn forget_stale_inodes_sweeps_unloaded_unlinked_records() {
        let (map, _clock) = map();
        let unloaded_unlinked = InodeNumber::new(10).unwrap();
        {
            let mut st = map.inner.state.lock();
            st.unloaded.insert(
                unloaded_unlinked,
                UnloadedInodeRecord {
                    parent: InodeNumber::ROOT,
                    name: "gone".into(),
                    is_unlinked: true,
                    mode: 0o100644,
                    object_id: None,
                    fs_ref_count: 1,
                },
            );
        }
        let released = map.forget_stale_inodes(Duration::from_secs(60));
        assert_eq!(released, 1);
        assert_eq!(map.stats().unloaded_count, 0);
    }

    /// With an atime threshold, aging one of two unlinked loaded inodes past
    /// the threshold and sweeping releases only that one.
    #[test]
    fn forget_stale_inodes_releases_only_aged_entries() {
        let (map, clock) = map();

        let young = InodeNumber::new(20).unwrap();
        let old = InodeNumber::new(21).unwrap();
        let t0 = clock.now();
        {
            let mut st = map.inner.state.lock();
            let young_inode = Arc::new(LoadedInode::new(
                young,
                InodeKind::File(FileData {
                    mode: 0o100644,
                    executable: false,
                    content: FileContent::Materialized,
                }),
                1,
                true,
                t0,
                0o100644,
                Some((InodeNumber::ROOT, "young".to_string())),
            ));
            let old_inode = Arc::new(LoadedInode::new(
                old,
                InodeKind::File(FileData {
                    mode: 0o100644,
                    executable: false,
                    content: FileContent::Materialized,
                }),
                1,
                true,
                t0,
                0o100644,
                Some((InodeNumber::ROOT, "old".to_string())),
            ));
            st.loaded.insert(young, young_inode);
            st.loaded.insert(old, old_inode);
            st.file_count += 2;
        }

        clock.advance(Duration::from_secs(30));
        // touch `young` so its atime stays recent relative to the threshold
        {
            let st = map.inner.state.lock();
            st.loaded.get(&young).unwrap().touch(clock.now());
        }
        clock.advance(Duration::from_secs(90));

        let released = map.forget_stale_inodes(Duration::from_secs(60));
        assert_eq!(released, 1, "only the aged inode should be released");
        assert!(
            !map.inner.state.lock().loaded.contains_key(&old),
            "the aged, unlinked inode should have been unloaded"
        );
        assert_eq!(map.inner.state.lock().loaded.get(&young).unwrap().fs_ref_count(), 1);
    }

    #[tokio::test]
    async fn dec_fs_refcount_underflow_is_a_bug() {
        let (map, _clock) = map();
        let ino = InodeNumber::new(42).unwrap();
        {
            let mut st = map.inner.state.lock();
            st.unloaded.insert(
                ino,
                UnloadedInodeRecord {
                    parent: InodeNumber::ROOT,
                    name: "x".into(),
                    is_unlinked: false,
                    mode: 0o100644,
                    object_id: None,
                    fs_ref_count: 1,
                },
            );
        }
        let err = map.dec_fs_refcount(ino, 5).unwrap_err();
        assert!(matches!(err, CoreError::Bug(_)));
    }

    #[tokio::test]
    async fn shutdown_twice_fails() {
        let (map, _clock) = map();
        map.shutdown(false).await.unwrap();
        let err = map.shutdown(false).await.unwrap_err();
        assert!(matches!(err, CoreError::Generic(_)));
    }

    #[tokio::test]
    async fn lookup_of_unknown_ino_is_bug_without_nfs_mode() {
        let (map, _clock) = map();
        let err = map.lookup(InodeNumber::new(999).unwrap()).await.unwrap_err();
        assert!(matches!(err, CoreError::Bug(_)));
    }

    #[tokio::test]
    async fn lookup_of_unknown_ino_is_stale_in_nfs_mode() {
        let clock = Arc::new(FakeClock::new(UNIX_EPOCH));
        let map = InodeMap::new(true, clock);
        map.initialize(root_tree(), ROOT_MODE).unwrap();
        let err = map.lookup(InodeNumber::new(999).unwrap()).await.unwrap_err();
        assert!(matches!(err, CoreError::Stale(_)));
    }
}

