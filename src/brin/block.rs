// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{binary_search, page_store::Entry, page_store::PageId, Slice};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    RwLock,
};

/// Identity of a block, stable across splits and checkpoints.
///
/// Distinct from a block's `minKey`, which can change (a block's minKey never
/// changes once assigned, but a block's *position* relative to its neighbours does,
/// as `next` pointers are relinked around it).
pub type BlockId = u64;

/// Key type for the ordered block map: `None` sorts before every `Some`, so the head
/// block (which owns the open-ended range below the first split point) is always the
/// first entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockKey(pub Option<Slice>);

impl Ord for BlockKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (&self.0, &other.0) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => a.as_ref().cmp(b.as_ref()),
        }
    }
}

impl PartialOrd for BlockKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Lazy-load state of a block's entry list.
///
/// `Unloaded` after `boot()` recovery or `unloadAllBlocks()`; a reader transitions it
/// to `Loading` (holding the write lock) while it calls into the page store, then to
/// `Loaded` with the result. Concurrent readers block on the same `RwLock` rather than
/// issuing redundant loads.
#[derive(Debug, Default)]
pub enum BlockState {
    #[default]
    Unloaded,
    Loaded(Vec<Entry>),
}

/// A single BRIN block: a contiguous, sorted run of keys backed by one data page.
pub struct Block {
    pub id: BlockId,
    pub min_key: Option<Slice>,
    page_id: AtomicU64,
    next: RwLock<Option<BlockId>>,
    size: AtomicU32,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    state: RwLock<BlockState>,
}

impl Block {
    pub fn new_empty(id: BlockId, min_key: Option<Slice>) -> Self {
        Self {
            id,
            min_key,
            page_id: AtomicU64::new(PageId::UNALLOCATED.as_u64()),
            next: RwLock::new(None),
            size: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            state: RwLock::new(BlockState::Loaded(Vec::new())),
        }
    }

    pub fn recovered(id: BlockId, min_key: Option<Slice>, page_id: PageId, size: u32) -> Self {
        Self {
            id,
            min_key,
            page_id: AtomicU64::new(page_id.as_u64()),
            next: RwLock::new(None),
            size: AtomicU32::new(size),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            state: RwLock::new(BlockState::Unloaded),
        }
    }

    pub fn page_id(&self) -> PageId {
        PageId::new(self.page_id.load(Ordering::Acquire))
    }

    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.as_u64(), Ordering::Release);
    }

    pub fn next(&self) -> Option<BlockId> {
        *self.next.read().expect("lock is poisoned")
    }

    pub fn set_next(&self, next: Option<BlockId>) {
        *self.next.write().expect("lock is poisoned") = next;
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        self.pin_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(
            *self.state.read().expect("lock is poisoned"),
            BlockState::Loaded(_)
        )
    }

    /// Ensures the block's entries are in memory, loading them from `storage` if
    /// necessary. Holds the block's state lock for the duration of the load, so
    /// concurrent callers for the same block coalesce onto one page read.
    pub fn ensure_loaded<S: crate::page_store::IndexDataStorage>(
        &self,
        storage: &S,
    ) -> crate::Result<()> {
        {
            let state = self.state.read().expect("lock is poisoned");
            if matches!(*state, BlockState::Loaded(_)) {
                return Ok(());
            }
        }

        let mut state = self.state.write().expect("lock is poisoned");
        if matches!(*state, BlockState::Loaded(_)) {
            return Ok(());
        }

        let page_id = self.page_id();
        let entries = if page_id.is_allocated() {
            storage.load_data_page(page_id)?
        } else {
            Vec::new()
        };

        *state = BlockState::Loaded(entries);
        Ok(())
    }

    /// Evicts the block's in-memory entries, provided nothing is pinning it and it has
    /// no unflushed changes.
    pub fn unload(&self) -> bool {
        if self.pin_count() > 0 || self.is_dirty() {
            return false;
        }
        *self.state.write().expect("lock is poisoned") = BlockState::Unloaded;
        true
    }

    pub fn with_entries<R>(&self, f: impl FnOnce(&[Entry]) -> R) -> R {
        let state = self.state.read().expect("lock is poisoned");
        match &*state {
            BlockState::Loaded(entries) => f(entries),
            BlockState::Unloaded => f(&[]),
        }
    }

    /// Returns every value stored under `key` in this block, in insertion order.
    ///
    /// A key may own more than one entry (this is a multiset index, not a unique-key
    /// map); callers that need values straddling a split boundary must also consult
    /// `next`.
    pub fn search(&self, key: &[u8]) -> Vec<Slice> {
        self.with_entries(|entries| {
            let start = binary_search::partition_point(entries, |e| e.key.as_ref() < key);
            entries
                .iter()
                .skip(start)
                .take_while(|e| e.key.as_ref() == key)
                .map(|e| e.value.clone())
                .collect()
        })
    }

    /// Inserts `key` -> `value`, appending after any existing entries for `key` so
    /// duplicates are preserved in insertion order. Returns the new entry count.
    pub fn put(&self, key: Slice, value: Slice) -> u32 {
        let mut state = self.state.write().expect("lock is poisoned");
        let BlockState::Loaded(entries) = &mut *state else {
            unreachable!("caller must ensure_loaded before put")
        };

        let idx = binary_search::partition_point(entries, |e| e.key.as_ref() <= key.as_ref());
        entries.insert(idx, Entry { key, value });

        self.mark_dirty();
        let size = entries.len() as u32;
        self.size.store(size, Ordering::Release);
        size
    }

    /// Removes the one entry matching both `key` and `value`, if present.
    pub fn remove(&self, key: &[u8], value: &[u8]) -> bool {
        let mut state = self.state.write().expect("lock is poisoned");
        let BlockState::Loaded(entries) = &mut *state else {
            unreachable!("caller must ensure_loaded before remove")
        };

        let start = binary_search::partition_point(entries, |e| e.key.as_ref() < key);
        let Some(offset) = entries
            .iter()
            .skip(start)
            .take_while(|e| e.key.as_ref() == key)
            .position(|e| e.value.as_ref() == value)
        else {
            return false;
        };

        entries.remove(start + offset);
        self.mark_dirty();
        self.size.store(entries.len() as u32, Ordering::Release);
        true
    }

    /// Splits off the upper half of this block's entries into a new block, returning
    /// the new block's minimum key and its entries. The caller is responsible for
    /// linking the new block into the block map and the `next` chain.
    pub fn split_off_upper_half(&self) -> (Slice, Vec<Entry>) {
        let mut state = self.state.write().expect("lock is poisoned");
        let BlockState::Loaded(entries) = &mut *state else {
            unreachable!("caller must ensure_loaded before split")
        };

        // Odd entry counts give the extra entry to the lower half.
        let mid = (entries.len() + 1) / 2;
        let upper = entries.split_off(mid);
        self.mark_dirty();
        self.size.store(entries.len() as u32, Ordering::Release);

        #[expect(clippy::expect_used, reason = "caller only splits overflowing blocks")]
        let new_min = upper.first().expect("split produces a non-empty upper half").key.clone();

        (new_min, upper)
    }
}
