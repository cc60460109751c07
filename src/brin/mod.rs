// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block Range Index: an in-memory sorted map of block-head keys to lazily loaded,
//! page-store-backed [`block::Block`]s, supporting concurrent split and checkpoint.

pub mod block;
pub mod manifest;

use crate::{
    config::Config,
    page_store::{Entry, IndexDataStorage, PageId},
    SequenceNumberCounter, Slice,
};
use block::{Block, BlockId, BlockKey};
use crossbeam_skiplist::SkipMap;
use manifest::BlockRangeIndexMetadata;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// A page superseded by a checkpoint.
///
/// Returned to the caller so it can schedule the old page for reclamation once the
/// checkpoint is known durable. If the checkpoint that produced it was pinned, the
/// caller must not reclaim it until a matching [`BlockRangeIndex::unpin_checkpoint`]
/// call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PostCheckpointAction {
    /// Block whose page was superseded.
    pub block_id: BlockId,
    /// The page that is now safe to reclaim (once any pin is released).
    pub superseded_page: PageId,
}

/// Outcome of a [`BlockRangeIndex::checkpoint`] call.
#[derive(Debug)]
pub struct CheckpointReport {
    /// Sequence number of this checkpoint. Pass to [`BlockRangeIndex::unpin_checkpoint`]
    /// to release a pin taken with `pin = true`.
    pub seqno: u64,
    /// Pages superseded by this checkpoint.
    pub actions: Vec<PostCheckpointAction>,
}

/// A block range index mapping keys to pages, backed by an [`IndexDataStorage`].
pub struct BlockRangeIndex<S: IndexDataStorage> {
    blocks: SkipMap<BlockKey, Arc<Block>>,
    blocks_by_id: SkipMap<BlockId, Arc<Block>>,
    next_block_id: AtomicU64,
    storage: Arc<S>,
    max_block_size: usize,
    manifest_path: PathBuf,
    /// Bumped on every [`Self::checkpoint`]; recorded in the manifest header so a
    /// reader can tell how many checkpoints an index has been through.
    checkpoint_seqno: SequenceNumberCounter,
    /// Reclamation actions from checkpoints taken with `pin = true`, held back from
    /// the caller's normal flow until [`Self::unpin_checkpoint`] releases them.
    pinned_checkpoints: Mutex<crate::HashMap<u64, Vec<PostCheckpointAction>>>,
}

impl<S: IndexDataStorage> BlockRangeIndex<S> {
    /// Creates a brand new, empty block range index with a single head block.
    pub fn new(config: &Config, storage: Arc<S>) -> Self {
        let head = Arc::new(Block::new_empty(0, None));

        let blocks = SkipMap::new();
        blocks.insert(BlockKey(None), head.clone());

        let blocks_by_id = SkipMap::new();
        blocks_by_id.insert(0, head);

        Self {
            blocks,
            blocks_by_id,
            next_block_id: AtomicU64::new(1),
            storage,
            max_block_size: config.max_block_size,
            manifest_path: config.path.join(crate::file::MANIFEST_FILE),
            checkpoint_seqno: SequenceNumberCounter::default(),
            pinned_checkpoints: Mutex::new(crate::HashMap::default()),
        }
    }

    /// Recovers a block range index from a previously checkpointed manifest, leaving
    /// every block unloaded until first access.
    pub fn boot(config: &Config, storage: Arc<S>) -> crate::Result<Self> {
        let recovered = manifest::read_manifest(&config.path.join(crate::file::MANIFEST_FILE))?;

        if recovered.is_empty() {
            return Ok(Self::new(config, storage));
        }

        let blocks = SkipMap::new();
        let blocks_by_id = SkipMap::new();
        let mut max_id = 0;

        for meta in &recovered {
            let block = Arc::new(Block::recovered(
                meta.block_id,
                meta.min_key.clone(),
                meta.page_id,
                meta.size,
            ));
            block.set_next(meta.next);

            blocks.insert(BlockKey(meta.min_key.clone()), block.clone());
            blocks_by_id.insert(meta.block_id, block);
            max_id = max_id.max(meta.block_id);
        }

        Ok(Self {
            blocks,
            blocks_by_id,
            next_block_id: AtomicU64::new(max_id + 1),
            storage,
            max_block_size: config.max_block_size,
            manifest_path: config.path.join(crate::file::MANIFEST_FILE),
            checkpoint_seqno: SequenceNumberCounter::default(),
            pinned_checkpoints: Mutex::new(crate::HashMap::default()),
        })
    }

    /// Number of blocks currently known to the index (loaded or not).
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn owning_block(&self, key: &[u8]) -> Arc<Block> {
        #[expect(clippy::expect_used, reason = "the head block always exists")]
        self.blocks
            .range(..=BlockKey(Some(Slice::from(key))))
            .next_back()
            .map(|entry| entry.value().clone())
            .expect("the head block (minKey = None) always matches")
    }

    fn block_by_id(&self, id: BlockId) -> Option<Arc<Block>> {
        self.blocks_by_id.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns every value stored under `key`, in ascending-block order.
    ///
    /// This is a multiset lookup: `key` may own more than one entry, and duplicates
    /// that straddle a split boundary (the key reappears as the `minKey` of the
    /// successor block) are collected by following `next`.
    pub fn search(&self, key: &[u8]) -> crate::Result<Vec<Slice>> {
        let mut out = Vec::new();
        let mut current = Some(self.owning_block(key));

        while let Some(block) = current {
            block.pin();
            let load_result = block.ensure_loaded(self.storage.as_ref());
            if let Err(e) = load_result {
                block.unpin();
                return Err(e);
            }

            out.extend(block.search(key));

            let next_id = block.next();
            block.unpin();

            current = next_id.and_then(|id| self.block_by_id(id));

            let continues = current
                .as_ref()
                .and_then(|next_block| next_block.min_key.as_ref())
                .is_some_and(|min| min.as_ref() == key);

            if !continues {
                break;
            }
        }

        Ok(out)
    }

    /// Inserts `key` -> `value`, splitting the owning block if it grows past
    /// `max_block_size`. `key` may already own other entries: this never overwrites,
    /// it always adds a new entry (see [`block::Block::put`]).
    pub fn put(&self, key: impl Into<Slice>, value: impl Into<Slice>) -> crate::Result<()> {
        let key = key.into();
        let value = value.into();

        let block = self.owning_block(&key);
        block.pin();
        let split_needed = (|| -> crate::Result<bool> {
            block.ensure_loaded(self.storage.as_ref())?;
            let size = block.put(key.clone(), value);
            Ok(size as usize > self.max_block_size)
        })();
        block.unpin();

        if split_needed? {
            self.split(&block)?;
        }

        Ok(())
    }

    /// Removes the one entry matching both `key` and `value`, returning whether it was
    /// present.
    pub fn delete(&self, key: &[u8], value: &[u8]) -> crate::Result<bool> {
        let block = self.owning_block(key);
        block.pin();
        let result = (|| -> crate::Result<bool> {
            block.ensure_loaded(self.storage.as_ref())?;
            Ok(block.remove(key, value))
        })();
        block.unpin();
        result
    }

    /// Collects every entry whose key falls within `[lo, hi]`, both bounds inclusive.
    ///
    /// Walks the `next` chain starting from the block owning `lo`, loading blocks
    /// lazily, and stops once a block's `minKey` lands strictly past `hi`.
    pub fn range_search(&self, lo: &[u8], hi: &[u8]) -> crate::Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut current = Some(self.owning_block(lo));

        while let Some(block) = current {
            block.pin();
            let load_result = block.ensure_loaded(self.storage.as_ref());
            if let Err(e) = load_result {
                block.unpin();
                return Err(e);
            }

            block.with_entries(|entries| {
                for entry in entries {
                    if entry.key.as_ref() >= lo && entry.key.as_ref() <= hi {
                        out.push(entry.clone());
                    }
                }
            });

            let next_id = block.next();
            block.unpin();

            current = next_id.and_then(|id| self.block_by_id(id));

            if let Some(next_block) = &current {
                if let Some(min) = &next_block.min_key {
                    if min.as_ref() > hi {
                        break;
                    }
                }
            }
        }

        Ok(out)
    }

    /// Splits an overflowing block into two, moving the upper half of its entries into
    /// a newly allocated block and linking it into the `next` chain.
    fn split(&self, block: &Arc<Block>) -> crate::Result<()> {
        block.pin();
        let (new_min, upper_entries) = block.split_off_upper_half();
        let old_next = block.next();
        block.unpin();

        let new_id = self.next_block_id.fetch_add(1, Ordering::AcqRel);
        let new_block = Arc::new(Block::new_empty(new_id, Some(new_min.clone())));
        for entry in upper_entries {
            new_block.put(entry.key, entry.value);
        }
        new_block.set_next(old_next);

        self.blocks_by_id.insert(new_id, new_block.clone());
        self.blocks.insert(BlockKey(Some(new_min)), new_block);

        block.set_next(Some(new_id));

        log::debug!("split block {} -> new block {new_id}", block.id);

        Ok(())
    }

    /// Persists every dirty block to a fresh page, prunes empty non-head blocks that
    /// are not mid-split, and atomically rewrites the manifest.
    ///
    /// If `pin` is true, the pages superseded by this checkpoint are held back from
    /// reclamation until a matching [`Self::unpin_checkpoint`] call; the caller may
    /// still inspect [`CheckpointReport::actions`] but must not reclaim the listed
    /// pages until then.
    pub fn checkpoint(&self, pin: bool) -> crate::Result<CheckpointReport> {
        let mut to_prune = Vec::new();
        let mut actions = Vec::new();

        for entry in &self.blocks {
            let block = entry.value();

            if block.is_dirty() {
                let old_page = block.page_id();
                let page_id =
                    block.with_entries(|entries| self.storage.create_data_page(entries))?;
                block.set_page_id(page_id);
                block.clear_dirty();

                if old_page.is_allocated() {
                    actions.push(PostCheckpointAction {
                        block_id: block.id,
                        superseded_page: old_page,
                    });
                }
            }

            let is_head = block.min_key.is_none();
            if !is_head && block.size() == 0 && !block.is_dirty() && block.pin_count() == 0 {
                to_prune.push((entry.key().clone(), block.id));
            }
        }

        for (key, id) in to_prune {
            self.prune_empty_block(&key, id);
        }

        let manifest: Vec<BlockRangeIndexMetadata> = self
            .blocks
            .iter()
            .map(|entry| {
                let block = entry.value();
                BlockRangeIndexMetadata {
                    block_id: block.id,
                    min_key: block.min_key.clone(),
                    page_id: block.page_id(),
                    size: block.size(),
                    next: block.next(),
                }
            })
            .collect();

        manifest::write_manifest(&self.manifest_path, &manifest)?;

        let seqno = self.checkpoint_seqno.next();

        if pin {
            self.pinned_checkpoints
                .lock()
                .expect("lock is poisoned")
                .insert(seqno, actions.clone());
        }

        log::debug!(
            "checkpoint {seqno} complete: {} blocks, {} superseded pages, pinned={pin}",
            manifest.len(),
            actions.len()
        );

        Ok(CheckpointReport { seqno, actions })
    }

    /// Releases the reclamation hold taken by a `checkpoint(pin = true)` call.
    ///
    /// A no-op if `seqno` was never pinned or was already unpinned.
    pub fn unpin_checkpoint(&self, seqno: u64) {
        self.pinned_checkpoints
            .lock()
            .expect("lock is poisoned")
            .remove(&seqno);
    }

    /// Removes an empty, clean, unpinned, non-head block and relinks its predecessor's
    /// `next` pointer around it.
    fn prune_empty_block(&self, key: &BlockKey, id: BlockId) {
        let next = self
            .blocks_by_id
            .get(&id)
            .and_then(|entry| entry.value().next());

        if let Some(pred) = self.blocks.range(..key.clone()).next_back() {
            if pred.value().next() == Some(id) {
                pred.value().set_next(next);
            }
        }

        self.blocks.remove(key);
        self.blocks_by_id.remove(&id);
    }

    /// Unloads every block's in-memory entries that is unpinned and has no pending
    /// changes. Dirty blocks are left untouched; call [`Self::checkpoint`] first if
    /// those should be flushed too.
    pub fn unload_all_blocks(&self) {
        for entry in &self.blocks {
            entry.value().unload();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_store::FilePageStore;
    use test_log::test;

    fn index(dir: &std::path::Path, max_block_size: usize) -> BlockRangeIndex<FilePageStore> {
        let config = Config::new(dir).max_block_size(max_block_size);
        let storage = Arc::new(FilePageStore::open(&config).expect("open store"));
        BlockRangeIndex::new(&config, storage)
    }

    #[test]
    fn put_and_search() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let brin = index(dir.path(), 1000);

        brin.put(b"a".as_slice(), b"1".as_slice())?;
        brin.put(b"b".as_slice(), b"2".as_slice())?;

        assert_eq!(vec![Slice::from(b"1".as_slice())], brin.search(b"a")?);
        assert_eq!(vec![Slice::from(b"2".as_slice())], brin.search(b"b")?);
        assert!(brin.search(b"c")?.is_empty());

        Ok(())
    }

    #[test]
    fn duplicate_keys_are_preserved_in_insertion_order() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let brin = index(dir.path(), 1000);

        brin.put(b"5".as_slice(), b"a".as_slice())?;
        brin.put(b"5".as_slice(), b"b".as_slice())?;
        brin.put(b"5".as_slice(), b"c".as_slice())?;

        assert_eq!(
            vec![
                Slice::from(b"a".as_slice()),
                Slice::from(b"b".as_slice()),
                Slice::from(b"c".as_slice()),
            ],
            brin.search(b"5")?
        );

        assert!(brin.delete(b"5", b"b")?);
        assert_eq!(
            vec![Slice::from(b"a".as_slice()), Slice::from(b"c".as_slice())],
            brin.search(b"5")?
        );

        Ok(())
    }

    #[test]
    fn duplicate_keys_straddling_a_split_are_all_found() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let brin = index(dir.path(), 2);

        brin.put(b"5".as_slice(), b"a".as_slice())?;
        brin.put(b"5".as_slice(), b"b".as_slice())?;
        brin.put(b"5".as_slice(), b"c".as_slice())?;
        brin.put(b"6".as_slice(), b"z".as_slice())?;

        assert!(brin.block_count() > 1);
        assert_eq!(
            vec![
                Slice::from(b"a".as_slice()),
                Slice::from(b"b".as_slice()),
                Slice::from(b"c".as_slice()),
            ],
            brin.search(b"5")?
        );

        Ok(())
    }

    #[test]
    fn overflowing_block_splits() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let brin = index(dir.path(), 4);

        for i in 0..20u32 {
            let key = format!("k{i:04}");
            brin.put(key.as_bytes(), b"v".as_slice())?;
        }

        assert!(brin.block_count() > 1);

        for i in 0..20u32 {
            let key = format!("k{i:04}");
            assert!(!brin.search(key.as_bytes())?.is_empty());
        }

        Ok(())
    }

    #[test]
    fn range_search_is_inclusive_on_both_ends() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let brin = index(dir.path(), 3);

        for i in 0..10u32 {
            let key = format!("k{i:04}");
            brin.put(key.as_bytes(), i.to_le_bytes().as_slice())?;
        }

        let results = brin.range_search(b"k0002", b"k0006")?;
        let keys: Vec<String> = results
            .iter()
            .map(|e| String::from_utf8(e.key.to_vec()).unwrap())
            .collect();

        assert_eq!(
            vec!["k0002", "k0003", "k0004", "k0005", "k0006"],
            keys
        );

        Ok(())
    }

    #[test]
    fn checkpoint_then_unload_then_reload_preserves_data() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path()).max_block_size(1000);

        {
            let storage = Arc::new(FilePageStore::open(&config)?);
            let brin = BlockRangeIndex::new(&config, storage);

            for i in 0..5u32 {
                let key = format!("k{i:04}");
                brin.put(key.as_bytes(), i.to_le_bytes().as_slice())?;
            }

            brin.checkpoint(false)?;
            brin.unload_all_blocks();

            for i in 0..5u32 {
                let key = format!("k{i:04}");
                assert!(!brin.search(key.as_bytes())?.is_empty());
            }
        }

        // Re-open from the manifest in a fresh process-like instance.
        let storage = Arc::new(FilePageStore::open(&config)?);
        let brin = BlockRangeIndex::boot(&config, storage)?;

        for i in 0..5u32 {
            let key = format!("k{i:04}");
            let values = brin.search(key.as_bytes())?;
            let value = values.first().expect("value recovered");
            assert_eq!(i.to_le_bytes().as_slice(), value.as_ref());
        }

        Ok(())
    }

    #[test]
    fn delete_then_checkpoint_prunes_empty_non_head_block() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let brin = index(dir.path(), 3);

        for i in 0..10u32 {
            let key = format!("k{i:04}");
            brin.put(key.as_bytes(), b"v".as_slice())?;
        }

        let before = brin.block_count();
        assert!(before > 1);

        for i in 5..10u32 {
            let key = format!("k{i:04}");
            brin.delete(key.as_bytes(), b"v")?;
        }

        brin.checkpoint(false)?;
        assert!(brin.block_count() < before);

        Ok(())
    }

    #[test]
    fn pinned_checkpoint_holds_back_reclamation_until_unpinned() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let brin = index(dir.path(), 1000);

        brin.put(b"a".as_slice(), b"1".as_slice())?;
        brin.checkpoint(false)?;

        brin.put(b"a".as_slice(), b"2".as_slice())?;
        let report = brin.checkpoint(true)?;
        assert!(!report.actions.is_empty());

        assert!(brin
            .pinned_checkpoints
            .lock()
            .expect("lock is poisoned")
            .contains_key(&report.seqno));

        brin.unpin_checkpoint(report.seqno);
        assert!(!brin
            .pinned_checkpoints
            .lock()
            .expect("lock is poisoned")
            .contains_key(&report.seqno));

        Ok(())
    }
}
