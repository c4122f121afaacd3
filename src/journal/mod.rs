//! The change stream: an ordered, bounded, coalescing log of observable
//! mount mutations.
//!
//! Two deques (one per delta variant) rather than one mixed deque: this
//! lets FileChange coalescing compare only against the FileChange tail
//! without skipping over interleaved RootUpdate entries.

mod delta;

pub use delta::{ChangeInfo, DType, FileChangeDelta, JournalDelta, RootUpdateDelta, SequenceNumber};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::instrument;

use crate::relpath::{RelativePath, RESERVED_METADATA_COMPONENT};
use crate::time_util::Clock;

const DEFAULT_MEMORY_LIMIT: usize = 1_000_000_000;

/// A point-in-time summary of the tip of the journal.
#[derive(Clone, Debug)]
pub struct JournalLatest {
    pub sequence: SequenceNumber,
    pub time: SystemTime,
    pub from_root: String,
    pub to_root: String,
}

/// One root transition as preserved by [`Journal::accumulate_range`].
#[derive(Clone, Debug)]
pub struct RootTransition {
    pub from_root: String,
    pub to_root: String,
    pub unclean_paths: Option<Vec<RelativePath>>,
}

/// The merged result of `accumulate_range`.
#[derive(Clone, Debug)]
pub struct JournalDeltaRange {
    pub from_sequence: SequenceNumber,
    pub to_sequence: SequenceNumber,
    pub from_time: SystemTime,
    pub to_time: SystemTime,
    pub changed_files: HashMap<RelativePath, ChangeInfo>,
    pub root_transitions: Vec<RootTransition>,
    pub truncated: bool,
}

impl JournalDeltaRange {
    /// True iff every changed path lives under the reserved metadata
    /// component (e.g. `.hg/...`).
    pub fn contains_only_reserved_metadata_changes(&self) -> bool {
        !self.changed_files.is_empty()
            && self
                .changed_files
                .keys()
                .all(|p| p.is_under_reserved_metadata())
    }
}

/// Snapshot of journal size/age, mirroring `InternalJournalStats`.
#[derive(Clone, Debug)]
pub struct InternalJournalStats {
    pub entry_count: usize,
    pub earliest_time: SystemTime,
    pub latest_time: SystemTime,
    pub max_files_accumulated: usize,
}

pub type SubscriberId = u64;

struct DeltaState {
    next_sequence: SequenceNumber,
    file_change_deltas: VecDeque<FileChangeDelta>,
    root_update_deltas: VecDeque<RootUpdateDelta>,
    current_root: String,
    max_files_accumulated: usize,
    memory_limit: usize,
    delta_memory_usage: usize,
    last_modification_has_been_observed: bool,
}

impl DeltaState {
    fn is_empty(&self) -> bool {
        self.file_change_deltas.is_empty() && self.root_update_deltas.is_empty()
    }

    fn front_sequence(&self) -> Option<SequenceNumber> {
        match (self.file_change_deltas.front(), self.root_update_deltas.front()) {
            (Some(f), Some(r)) => Some(f.sequence.min(r.sequence)),
            (Some(f), None) => Some(f.sequence),
            (None, Some(r)) => Some(r.sequence),
            (None, None) => None,
        }
    }

    fn back_sequence(&self) -> Option<SequenceNumber> {
        match (self.file_change_deltas.back(), self.root_update_deltas.back()) {
            (Some(f), Some(r)) => Some(f.sequence.max(r.sequence)),
            (Some(f), None) => Some(f.sequence),
            (None, Some(r)) => Some(r.sequence),
            (None, None) => None,
        }
    }

    /// All retained deltas, newest first.
    fn iter_newest_first(&self) -> impl Iterator<Item = JournalDelta> + '_ {
        let files = self.file_change_deltas.iter().rev().cloned().map(JournalDelta::FileChange);
        let roots = self.root_update_deltas.iter().rev().cloned().map(JournalDelta::RootUpdate);
        MergeNewestFirst {
            left: files.peekable(),
            right: roots.peekable(),
        }
    }

    fn truncate_if_necessary(&mut self) {
        while self.delta_memory_usage > self.memory_limit && self.total_len() > 1 {
            let pop_front_file = match (self.file_change_deltas.front(), self.root_update_deltas.front()) {
                (Some(f), Some(r)) => f.sequence < r.sequence,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if pop_front_file {
                if let Some(d) = self.file_change_deltas.pop_front() {
                    self.delta_memory_usage = self.delta_memory_usage.saturating_sub(JournalDelta::FileChange(d).rough_memory_usage());
                }
            } else if let Some(d) = self.root_update_deltas.pop_front() {
                self.delta_memory_usage = self.delta_memory_usage.saturating_sub(JournalDelta::RootUpdate(d).rough_memory_usage());
            }
        }
    }

    fn total_len(&self) -> usize {
        self.file_change_deltas.len() + self.root_update_deltas.len()
    }
}

/// Iterator adapter yielding two already-descending streams in merged
/// descending order by sequence number.
struct MergeNewestFirst<L: Iterator<Item = JournalDelta>, R: Iterator<Item = JournalDelta>> {
    left: std::iter::Peekable<L>,
    right: std::iter::Peekable<R>,
}

impl<L: Iterator<Item = JournalDelta>, R: Iterator<Item = JournalDelta>> Iterator for MergeNewestFirst<L, R> {
    type Item = JournalDelta;

    fn next(&mut self) -> Option<JournalDelta> {
        match (self.left.peek(), self.right.peek()) {
            (Some(l), Some(r)) => {
                if l.sequence() >= r.sequence() {
                    self.left.next()
                } else {
                    self.right.next()
                }
            }
            (Some(_), None) => self.left.next(),
            (None, Some(_)) => self.right.next(),
            (None, None) => None,
        }
    }
}

struct SubscriberState {
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, Box<dyn Fn() + Send + Sync>>,
}

/// The change stream for one mount. Thread-safe; subscribers run inline on
/// whatever thread called the recording method — callbacks must do minimal
/// work.
pub struct Journal {
    state: Mutex<DeltaState>,
    subscribers: Mutex<SubscriberState>,
    clock: Arc<dyn Clock>,
}

impl Journal {
    pub fn new(clock: Arc<dyn Clock>, initial_root: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(DeltaState {
                next_sequence: 1,
                file_change_deltas: VecDeque::new(),
                root_update_deltas: VecDeque::new(),
                current_root: initial_root.into(),
                max_files_accumulated: 0,
                memory_limit: DEFAULT_MEMORY_LIMIT,
                delta_memory_usage: 0,
                last_modification_has_been_observed: true,
            }),
            subscribers: Mutex::new(SubscriberState {
                next_id: 1,
                subscribers: HashMap::new(),
            }),
            clock,
        }
    }

    fn append_file_change(&self, mut delta: FileChangeDelta) {
        let notify = {
            let mut state = self.state.lock();
            delta.sequence = state.next_sequence;
            state.next_sequence += 1;
            delta.time = self.clock.now();

            let compacted = match state.file_change_deltas.back_mut() {
                Some(last) if last.same_shape(&delta) => {
                    last.sequence = delta.sequence;
                    last.time = delta.time;
                    true
                }
                _ => false,
            };
            if !compacted {
                state.delta_memory_usage += JournalDelta::FileChange(delta.clone()).rough_memory_usage();
                state.file_change_deltas.push_back(delta);
                state.max_files_accumulated = state.max_files_accumulated.max(state.file_change_deltas.len());
                state.truncate_if_necessary();
            }
            let notify = state.last_modification_has_been_observed;
            state.last_modification_has_been_observed = false;
            notify
        };
        if notify {
            self.notify_subscribers();
        }
    }

    fn append_root_update(&self, mut delta: RootUpdateDelta) {
        let notify = {
            let mut state = self.state.lock();
            delta.sequence = state.next_sequence;
            state.next_sequence += 1;
            delta.time = self.clock.now();
            state.current_root = delta.to_root.clone();

            // Only a no-op transition (from == to, e.g. a redundant checkout
            // back to the root already checked out) folds into the previous
            // entry. Two distinct chained transitions (r0->r1, r1->r2) are
            // both retained so the accumulated transition list still shows
            // every intermediate root.
            let compacted = match state.root_update_deltas.back_mut() {
                Some(last)
                    if delta.unclean_paths.is_none()
                        && delta.from_root == delta.to_root
                        && last.to_root == delta.from_root =>
                {
                    last.sequence = delta.sequence;
                    last.time = delta.time;
                    true
                }
                _ => false,
            };
            if !compacted {
                state.delta_memory_usage += JournalDelta::RootUpdate(delta.clone()).rough_memory_usage();
                state.root_update_deltas.push_back(delta);
                state.truncate_if_necessary();
            }
            let notify = state.last_modification_has_been_observed;
            state.last_modification_has_been_observed = false;
            notify
        };
        if notify {
            self.notify_subscribers();
        }
    }

    pub fn record_created(&self, path: RelativePath, dtype: DType) {
        self.append_file_change(FileChangeDelta {
            path1: path,
            path2: None,
            info1: ChangeInfo::created(),
            info2: None,
            dtype,
            sequence: 0,
            time: SystemTime::UNIX_EPOCH,
        });
    }

    pub fn record_removed(&self, path: RelativePath, dtype: DType) {
        self.append_file_change(FileChangeDelta {
            path1: path,
            path2: None,
            info1: ChangeInfo::removed(),
            info2: None,
            dtype,
            sequence: 0,
            time: SystemTime::UNIX_EPOCH,
        });
    }

    pub fn record_changed(&self, path: RelativePath, dtype: DType) {
        self.append_file_change(FileChangeDelta {
            path1: path,
            path2: None,
            info1: ChangeInfo::changed(),
            info2: None,
            dtype,
            sequence: 0,
            time: SystemTime::UNIX_EPOCH,
        });
    }

    pub fn record_renamed(&self, old_name: RelativePath, new_name: RelativePath, dtype: DType) {
        self.append_file_change(FileChangeDelta {
            path1: old_name,
            path2: Some(new_name),
            info1: ChangeInfo::removed(),
            info2: Some(ChangeInfo::created()),
            dtype,
            sequence: 0,
            time: SystemTime::UNIX_EPOCH,
        });
    }

    pub fn record_replaced(&self, old_name: RelativePath, new_name: RelativePath, dtype: DType) {
        self.append_file_change(FileChangeDelta {
            path1: old_name,
            path2: Some(new_name),
            info1: ChangeInfo::removed(),
            info2: Some(ChangeInfo::changed()),
            dtype,
            sequence: 0,
            time: SystemTime::UNIX_EPOCH,
        });
    }

    pub fn record_root_update(&self, to_root: impl Into<String>) {
        let from_root = self.state.lock().current_root.clone();
        self.append_root_update(RootUpdateDelta {
            from_root,
            to_root: to_root.into(),
            unclean_paths: None,
            sequence: 0,
            time: SystemTime::UNIX_EPOCH,
        });
    }

    pub fn record_root_update_between(&self, from_root: impl Into<String>, to_root: impl Into<String>) {
        self.append_root_update(RootUpdateDelta {
            from_root: from_root.into(),
            to_root: to_root.into(),
            unclean_paths: None,
            sequence: 0,
            time: SystemTime::UNIX_EPOCH,
        });
    }

    pub fn record_unclean_paths(
        &self,
        from_root: impl Into<String>,
        to_root: impl Into<String>,
        unclean_paths: Vec<RelativePath>,
    ) {
        self.append_root_update(RootUpdateDelta {
            from_root: from_root.into(),
            to_root: to_root.into(),
            unclean_paths: Some(unclean_paths),
            sequence: 0,
            time: SystemTime::UNIX_EPOCH,
        });
    }

    pub fn get_latest(&self) -> Option<JournalLatest> {
        let mut state = self.state.lock();
        state.last_modification_has_been_observed = true;
        match state.iter_newest_first().next()? {
            JournalDelta::FileChange(d) => Some(JournalLatest {
                sequence: d.sequence,
                time: d.time,
                from_root: state.current_root.clone(),
                to_root: state.current_root.clone(),
            }),
            JournalDelta::RootUpdate(d) => Some(JournalLatest {
                sequence: d.sequence,
                time: d.time,
                from_root: d.from_root,
                to_root: d.to_root,
            }),
        }
    }

    /// Merges every retained delta with `sequence >= from_sequence` into a
    /// single summary.
    #[instrument(skip(self))]
    pub fn accumulate_range(&self, from_sequence: SequenceNumber) -> Option<JournalDeltaRange> {
        let mut state = self.state.lock();
        state.last_modification_has_been_observed = true;

        let latest_seq = state.back_sequence()?;
        if from_sequence > latest_seq {
            return None;
        }
        let oldest_retained = state.front_sequence().unwrap_or(latest_seq);
        let truncated = from_sequence < oldest_retained;

        let mut changed_files: HashMap<RelativePath, ChangeInfo> = HashMap::new();
        let mut root_transitions_rev: Vec<RootTransition> = Vec::new();
        let mut earliest_time = state.clock_fallback();
        let mut latest_time = earliest_time;
        let mut first = true;

        for delta in state.iter_newest_first() {
            if delta.sequence() < from_sequence {
                break;
            }
            if first {
                latest_time = delta.time();
                first = false;
            }
            earliest_time = delta.time();
            match delta {
                JournalDelta::FileChange(d) => {
                    merge_path(&mut changed_files, &d.path1, &d.info1);
                    if let (Some(path2), Some(info2)) = (&d.path2, &d.info2) {
                        merge_path(&mut changed_files, path2, info2);
                    }
                }
                JournalDelta::RootUpdate(d) => {
                    root_transitions_rev.push(RootTransition {
                        from_root: d.from_root,
                        to_root: d.to_root,
                        unclean_paths: d.unclean_paths,
                    });
                }
            }
        }
        root_transitions_rev.reverse();

        Some(JournalDeltaRange {
            from_sequence,
            to_sequence: latest_seq,
            from_time: earliest_time,
            to_time: latest_time,
            changed_files,
            root_transitions: root_transitions_rev,
            truncated,
        })
    }

    /// Iterates newest-to-oldest, invoking the matching callback for each
    /// delta until one returns `false` or `limit` entries have been visited.
    /// Returns whether the walk was truncated before reaching `from`.
    pub fn for_each_delta(
        &self,
        from_sequence: SequenceNumber,
        limit: Option<usize>,
        mut file_cb: impl FnMut(&FileChangeDelta) -> bool,
        mut root_cb: impl FnMut(&RootUpdateDelta) -> bool,
    ) -> bool {
        let state = self.state.lock();
        let oldest_retained = state.front_sequence().unwrap_or(0);
        let mut visited = 0usize;
        for delta in state.iter_newest_first() {
            if delta.sequence() < from_sequence {
                break;
            }
            if let Some(limit) = limit {
                if visited >= limit {
                    break;
                }
            }
            visited += 1;
            let keep_going = match &delta {
                JournalDelta::FileChange(d) => file_cb(d),
                JournalDelta::RootUpdate(d) => root_cb(d),
            };
            if !keep_going {
                break;
            }
        }
        from_sequence < oldest_retained
    }

    pub fn register_subscriber(&self, callback: Box<dyn Fn() + Send + Sync>) -> SubscriberId {
        let mut subs = self.subscribers.lock();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.subscribers.insert(id, callback);
        id
    }

    pub fn cancel_subscriber(&self, id: SubscriberId) {
        self.subscribers.lock().subscribers.remove(&id);
    }

    pub fn cancel_all_subscribers(&self) {
        self.subscribers.lock().subscribers.clear();
    }

    pub fn is_subscriber_valid(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().subscribers.contains_key(&id)
    }

    fn notify_subscribers(&self) {
        let subs = self.subscribers.lock();
        for callback in subs.subscribers.values() {
            callback();
        }
    }

    pub fn stats(&self) -> Option<InternalJournalStats> {
        let state = self.state.lock();
        if state.is_empty() {
            return None;
        }
        let mut iter = state.iter_newest_first();
        let latest = iter.next()?;
        let earliest = std::iter::once(latest.clone()).chain(iter).last().unwrap_or(latest.clone());
        Some(InternalJournalStats {
            entry_count: state.total_len(),
            earliest_time: earliest.time(),
            latest_time: latest.time(),
            max_files_accumulated: state.max_files_accumulated,
        })
    }

    /// Drops every retained delta so that a subsequent `accumulate_range`
    /// from any previously valid sequence number reports `truncated`.
    pub fn flush(&self) {
        {
            let mut state = self.state.lock();
            state.file_change_deltas.clear();
            state.root_update_deltas.clear();
            state.delta_memory_usage = 0;
            state.max_files_accumulated = 0;
            state.last_modification_has_been_observed = false;
        }
        self.notify_subscribers();
    }

    pub fn set_memory_limit(&self, limit: usize) {
        let mut state = self.state.lock();
        state.memory_limit = limit;
        state.truncate_if_necessary();
    }

    pub fn get_memory_limit(&self) -> usize {
        self.state.lock().memory_limit
    }

    pub fn estimate_memory_usage(&self) -> usize {
        self.state.lock().delta_memory_usage
    }
}

impl DeltaState {
    /// Fallback timestamp used only when a range turns out to contain no
    /// deltas at all; never observable by callers since `accumulate_range`
    /// returns `None` in that case.
    fn clock_fallback(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH
    }
}

fn merge_path(changed_files: &mut HashMap<RelativePath, ChangeInfo>, path: &RelativePath, info: &ChangeInfo) {
    match changed_files.get_mut(path) {
        Some(existing) => existing.existed_before = info.existed_before,
        None => {
            changed_files.insert(path.clone(), *info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::time_util::FakeClock;

    fn journal() -> Journal {
        Journal::new(Arc::new(FakeClock::new(SystemTime::UNIX_EPOCH)), "root0")
    }

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let j = journal();
        j.record_created(path("a"), DType::Regular);
        j.record_created(path("b"), DType::Regular);
        let latest = j.get_latest().unwrap();
        assert_eq!(latest.sequence, 2);
    }

    #[test]
    fn identical_consecutive_file_changes_coalesce() {
        let j = journal();
        j.record_changed(path("a"), DType::Regular);
        j.record_changed(path("a"), DType::Regular);
        let stats = j.stats().unwrap();
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn chained_root_updates_are_all_recorded() {
        let j = journal();
        j.record_root_update_between("r0", "r1");
        j.record_root_update_between("r1", "r2");
        let stats = j.stats().unwrap();
        assert_eq!(stats.entry_count, 2);
        let range = j.accumulate_range(1).unwrap();
        assert_eq!(range.root_transitions.len(), 2);
        assert_eq!(range.root_transitions[0].from_root, "r0");
        assert_eq!(range.root_transitions[0].to_root, "r1");
        assert_eq!(range.root_transitions[1].from_root, "r1");
        assert_eq!(range.root_transitions[1].to_root, "r2");
    }

    #[test]
    fn noop_root_update_coalesces_into_previous() {
        let j = journal();
        j.record_root_update_between("r0", "r1");
        j.record_root_update_between("r1", "r1");
        j.record_root_update_between("r1", "r2");
        let stats = j.stats().unwrap();
        assert_eq!(stats.entry_count, 2);
        let range = j.accumulate_range(1).unwrap();
        assert_eq!(range.root_transitions.len(), 2);
        assert_eq!(range.root_transitions[0].from_root, "r0");
        assert_eq!(range.root_transitions[0].to_root, "r1");
        assert_eq!(range.root_transitions[1].from_root, "r1");
        assert_eq!(range.root_transitions[1].to_root, "r2");
    }

    #[test]
    fn unclean_paths_prevent_root_update_coalescing() {
        let j = journal();
        j.record_unclean_paths("r0", "r1", vec![path("a")]);
        j.record_root_update_between("r1", "r2");
        let stats = j.stats().unwrap();
        assert_eq!(stats.entry_count, 2);
        let range = j.accumulate_range(1).unwrap();
        assert_eq!(range.root_transitions.len(), 2);
    }

    #[test]
    fn at_least_one_entry_retained_under_zero_budget() {
        let j = journal();
        j.set_memory_limit(0);
        j.record_created(path("a"), DType::Regular);
        j.record_created(path("b"), DType::Regular);
        let stats = j.stats().unwrap();
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn accumulate_range_reports_truncated_past_oldest() {
        let j = journal();
        j.set_memory_limit(1);
        j.record_created(path("a"), DType::Regular);
        j.record_created(path("b"), DType::Regular);
        let range = j.accumulate_range(1).unwrap();
        assert!(range.truncated);
    }

    #[test]
    fn flush_clears_and_future_accumulate_is_truncated() {
        let j = journal();
        j.record_created(path("a"), DType::Regular);
        let before = j.accumulate_range(1).unwrap();
        assert!(!before.truncated);
        j.flush();
        assert!(j.stats().is_none());
        j.record_created(path("b"), DType::Regular);
        let after = j.accumulate_range(1).unwrap();
        assert!(after.truncated);
    }

    #[test]
    fn reserved_metadata_only_range_is_detected() {
        let j = journal();
        j.record_changed(path(".hg/dirstate"), DType::Regular);
        let range = j.accumulate_range(1).unwrap();
        assert!(range.contains_only_reserved_metadata_changes());
    }

    #[test]
    fn subscriber_notified_on_mutation() {
        let j = journal();
        let count = Arc::new(AtomicU64::new(0));
        let count_clone = count.clone();
        let id = j.register_subscriber(Box::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        j.record_created(path("a"), DType::Regular);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        j.cancel_subscriber(id);
        j.record_created(path("b"), DType::Regular);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn for_each_delta_stops_at_limit() {
        let j = journal();
        j.record_created(path("a"), DType::Regular);
        j.record_created(path("b"), DType::Regular);
        j.record_created(path("c"), DType::Regular);
        let mut seen = Vec::new();
        j.for_each_delta(
            1,
            Some(2),
            |d| {
                seen.push(d.path1.as_str().to_string());
                true
            },
            |_| true,
        );
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], "c");
    }
}
