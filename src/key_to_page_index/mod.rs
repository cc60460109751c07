// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The primary-key access path: a concurrent map from key bytes to [`PageId`],
//! supporting a linearizable-per-key compare-and-set `put`.

use crate::{page_store::PageId, SeqNo, Slice};
use crossbeam_skiplist::SkipMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

/// A page made obsolete since the last checkpoint, returned to the caller for
/// reclamation once durability is confirmed.
///
/// If the checkpoint that produced it pinned its actions, the caller must not
/// reclaim it until a matching [`KeyToPageIndex::unpin_checkpoint`] call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PostCheckpointAction {
    /// The page that is now safe to reclaim (once any pin is released).
    pub superseded_page: PageId,
}

/// Concurrent map from primary-key bytes to the page holding that key's row.
///
/// `0` (i.e. [`PageId::UNALLOCATED`]) is never a value a caller observes through
/// [`Self::get`]: an absent key and a key mapped to the unallocated page are both
/// reported as `None`/`false`.
pub struct KeyToPageIndex {
    map: SkipMap<Slice, Arc<AtomicU64>>,
    started: Mutex<Option<(SeqNo, bool)>>,
    pending_reclaims: Mutex<Vec<PageId>>,
    pinned_checkpoints: Mutex<crate::HashMap<SeqNo, Vec<PostCheckpointAction>>>,
    closed: AtomicBool,
}

impl Default for KeyToPageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyToPageIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            started: Mutex::new(None),
            pending_reclaims: Mutex::new(Vec::new()),
            pinned_checkpoints: Mutex::new(crate::HashMap::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of keys currently mapped to an allocated page.
    #[must_use]
    pub fn size(&self) -> usize {
        self.map
            .iter()
            .filter(|entry| entry.value().load(Ordering::Acquire) != 0)
            .count()
    }

    /// Approximate heap memory retained by the index's keys, in bytes.
    ///
    /// Used for admission-control decisions elsewhere in HerdDB; a rough sum of key
    /// lengths plus a fixed per-entry overhead is good enough for that purpose.
    #[must_use]
    pub fn get_used_memory(&self) -> usize {
        self.map
            .iter()
            .map(|entry| entry.key().len() + std::mem::size_of::<AtomicU64>())
            .sum()
    }

    /// Returns the page holding `key`, if any.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<PageId> {
        let entry = self.map.get(key)?;
        let raw = entry.value().load(Ordering::Acquire);
        PageId::new(raw).is_allocated().then(|| PageId::new(raw))
    }

    /// Whether `key` currently maps to an allocated page.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    fn record_superseded(&self, page: PageId) {
        if page.is_allocated() {
            self.pending_reclaims
                .lock()
                .expect("lock is poisoned")
                .push(page);
        }
    }

    /// Unconditionally sets `key`'s page, overwriting any previous mapping.
    pub fn put(&self, key: impl Into<Slice>, page_id: PageId) {
        let key = key.into();
        let cell = self
            .map
            .get_or_insert_with(key, || Arc::new(AtomicU64::new(0)))
            .value()
            .clone();
        let old = PageId::new(cell.swap(page_id.as_u64(), Ordering::AcqRel));
        if old.is_allocated() && old != page_id {
            self.record_superseded(old);
        }
    }

    /// Compare-and-set: stores `new` for `key` only if the current value is
    /// `expected`, returning whether the swap happened.
    ///
    /// This is linearizable per-key: concurrent callers racing on the same key will
    /// see exactly one of them succeed, but a failed swap is not an error — it just
    /// means another writer won the race.
    #[must_use]
    pub fn put_if(&self, key: impl Into<Slice>, new: PageId, expected: PageId) -> bool {
        let key = key.into();
        let cell = self
            .map
            .get_or_insert_with(key, || Arc::new(AtomicU64::new(PageId::UNALLOCATED.as_u64())))
            .value()
            .clone();

        let swapped = cell
            .compare_exchange(
                expected.as_u64(),
                new.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if swapped && expected.is_allocated() && expected != new {
            self.record_superseded(expected);
        }

        swapped
    }

    /// Removes `key`, returning whether it was present and allocated.
    pub fn remove(&self, key: &[u8]) -> bool {
        let Some(entry) = self.map.get(key) else {
            return false;
        };

        let old = PageId::new(entry.value().swap(PageId::UNALLOCATED.as_u64(), Ordering::AcqRel));
        entry.remove();

        if old.is_allocated() {
            self.record_superseded(old);
            true
        } else {
            false
        }
    }

    /// Iterates entries in ascending key order.
    pub fn scanner(&self) -> impl DoubleEndedIterator<Item = (Slice, PageId)> + '_ {
        self.map.iter().filter_map(|entry| {
            let raw = entry.value().load(Ordering::Acquire);
            PageId::new(raw)
                .is_allocated()
                .then(|| (entry.key().clone(), PageId::new(raw)))
        })
    }

    /// Drops every mapping, as if the index had just been created.
    pub fn truncate(&self) {
        self.map.clear();
    }

    /// Records the sequence number this index is starting from and whether its
    /// backing pages were freshly created (`created = true`) or recovered from an
    /// existing checkpoint (`created = false`).
    pub fn start(&self, sequence_number: SeqNo, created: bool) {
        *self.started.lock().expect("lock is poisoned") = Some((sequence_number, created));
        log::debug!(
            "key-to-page index starting at seqno {sequence_number}, created={created}"
        );
    }

    /// The `(sequence_number, created)` pair passed to the most recent [`Self::start`]
    /// call, if any.
    #[must_use]
    pub fn started_at(&self) -> Option<(SeqNo, bool)> {
        *self.started.lock().expect("lock is poisoned")
    }

    /// Drains the pages made obsolete (by `put`/`put_if` overwrites and `remove`)
    /// since the last checkpoint into a list of [`PostCheckpointAction`]s.
    ///
    /// If `pin` is true, the actions are also retained in this index until a matching
    /// [`Self::unpin_checkpoint`] call; the caller must not reclaim them before then.
    pub fn checkpoint(&self, sequence_number: SeqNo, pin: bool) -> Vec<PostCheckpointAction> {
        let pages: Vec<PageId> =
            std::mem::take(&mut *self.pending_reclaims.lock().expect("lock is poisoned"));

        let actions: Vec<PostCheckpointAction> = pages
            .into_iter()
            .map(|superseded_page| PostCheckpointAction { superseded_page })
            .collect();

        if pin {
            self.pinned_checkpoints
                .lock()
                .expect("lock is poisoned")
                .insert(sequence_number, actions.clone());
        }

        log::debug!(
            "key-to-page index checkpoint {sequence_number}: {} superseded pages, pinned={pin}",
            actions.len()
        );

        actions
    }

    /// Releases the reclamation hold taken by a `checkpoint(_, pin = true)` call.
    ///
    /// A no-op if `sequence_number` was never pinned or was already unpinned.
    pub fn unpin_checkpoint(&self, sequence_number: SeqNo) {
        self.pinned_checkpoints
            .lock()
            .expect("lock is poisoned")
            .remove(&sequence_number);
    }

    /// Discards every mapping and any pending reclamation bookkeeping without
    /// persisting anything, as if the index's backing data never existed.
    pub fn drop_data(&self) {
        self.map.clear();
        self.pending_reclaims.lock().expect("lock is poisoned").clear();
        self.pinned_checkpoints.lock().expect("lock is poisoned").clear();
    }

    /// Releases this index's in-memory state. Using a closed index afterwards is a
    /// caller bug.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.map.clear();
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn put_then_get() {
        let index = KeyToPageIndex::new();
        index.put(b"a".as_slice(), PageId::new(7));
        assert_eq!(Some(PageId::new(7)), index.get(b"a"));
        assert_eq!(None, index.get(b"b"));
    }

    #[test]
    fn cas_succeeds_when_expected_matches() {
        let index = KeyToPageIndex::new();
        index.put(b"a".as_slice(), PageId::new(1));

        let swapped = index.put_if(b"a".as_slice(), PageId::new(2), PageId::new(1));
        assert!(swapped);
        assert_eq!(Some(PageId::new(2)), index.get(b"a"));
    }

    #[test]
    fn cas_fails_when_expected_does_not_match() {
        let index = KeyToPageIndex::new();
        index.put(b"a".as_slice(), PageId::new(1));

        let swapped = index.put_if(b"a".as_slice(), PageId::new(3), PageId::new(2));
        assert!(!swapped);
        assert_eq!(Some(PageId::new(1)), index.get(b"a"));
    }

    #[test]
    fn cas_on_absent_key_uses_unallocated_as_expected() {
        let index = KeyToPageIndex::new();

        let swapped = index.put_if(b"a".as_slice(), PageId::new(1), PageId::UNALLOCATED);
        assert!(swapped);
        assert_eq!(Some(PageId::new(1)), index.get(b"a"));
    }

    #[test]
    fn remove_and_scanner_are_ordered() {
        let index = KeyToPageIndex::new();
        index.put(b"c".as_slice(), PageId::new(3));
        index.put(b"a".as_slice(), PageId::new(1));
        index.put(b"b".as_slice(), PageId::new(2));

        assert!(index.remove(b"b"));
        assert!(!index.remove(b"b"));

        let scanned: Vec<_> = index.scanner().map(|(k, p)| (k.to_vec(), p)).collect();
        assert_eq!(
            vec![(b"a".to_vec(), PageId::new(1)), (b"c".to_vec(), PageId::new(3))],
            scanned
        );
    }

    #[test]
    fn concurrent_cas_has_exactly_one_winner() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let index = StdArc::new(KeyToPageIndex::new());
        let winners: StdArc<std::sync::atomic::AtomicUsize> =
            StdArc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let index = index.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if index.put_if(
                        b"contested".as_slice(),
                        PageId::new(i + 1),
                        PageId::UNALLOCATED,
                    ) {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert_eq!(1, winners.load(Ordering::Relaxed));
    }

    #[test]
    fn start_records_sequence_number_and_created_flag() {
        let index = KeyToPageIndex::new();
        assert_eq!(None, index.started_at());

        index.start(42, true);
        assert_eq!(Some((42, true)), index.started_at());
    }

    #[test]
    fn checkpoint_drains_superseded_pages_from_overwrites_and_removals() {
        let index = KeyToPageIndex::new();

        index.put(b"a".as_slice(), PageId::new(1));
        index.put(b"a".as_slice(), PageId::new(2));
        index.put(b"b".as_slice(), PageId::new(3));
        assert!(index.remove(b"b"));

        let actions = index.checkpoint(1, false);
        let superseded: Vec<PageId> = actions.iter().map(|a| a.superseded_page).collect();
        assert_eq!(vec![PageId::new(1), PageId::new(3)], superseded);

        // A second checkpoint with nothing new superseded finds nothing to drain.
        assert!(index.checkpoint(2, false).is_empty());
    }

    #[test]
    fn pinned_checkpoint_actions_are_released_by_unpin() {
        let index = KeyToPageIndex::new();
        index.put(b"a".as_slice(), PageId::new(1));
        index.put(b"a".as_slice(), PageId::new(2));

        let actions = index.checkpoint(1, true);
        assert!(!actions.is_empty());
        assert!(index.pinned_checkpoints.lock().expect("lock is poisoned").contains_key(&1));

        index.unpin_checkpoint(1);
        assert!(!index.pinned_checkpoints.lock().expect("lock is poisoned").contains_key(&1));
    }

    #[test]
    fn drop_data_clears_everything() {
        let index = KeyToPageIndex::new();
        index.put(b"a".as_slice(), PageId::new(1));
        index.put(b"a".as_slice(), PageId::new(2));

        index.drop_data();

        assert_eq!(None, index.get(b"a"));
        assert!(index.checkpoint(1, false).is_empty());
    }

    #[test]
    fn close_marks_closed_and_clears_the_map() {
        let index = KeyToPageIndex::new();
        index.put(b"a".as_slice(), PageId::new(1));

        assert!(!index.is_closed());
        index.close();

        assert!(index.is_closed());
        assert_eq!(None, index.get(b"a"));
    }
}
