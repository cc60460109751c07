// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The page store: an append-only, immutable, one-file-per-page collaborator that the
//! block range index delegates actual key/value storage to.
//!
//! Grounded in the teacher's one-segment-per-file model: a page, once created, is
//! never rewritten, only read (possibly many times, through a cached file handle) or
//! deleted wholesale when its owning block is dropped.

use crate::{
    aligned_writer::AlignedBlockWriter,
    checksum::Checksum,
    config::Config,
    descriptor_table::FileDescriptorTable,
    file, Result, Slice,
};
use std::{
    io::{Read, Seek},
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

/// Identifies an on-disk data page.
///
/// `0` is reserved and never returned by [`IndexDataStorage::create_data_page`]; it is
/// used elsewhere in this crate to mean "no page allocated yet".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageId(u64);

impl PageId {
    /// Sentinel meaning "no page".
    pub const UNALLOCATED: Self = Self(0);

    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn is_allocated(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    fn file_name(self) -> String {
        format!("{:016x}.page", self.0)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A single key/value pair as stored in a data page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub key: Slice,
    pub value: Slice,
}

impl Entry {
    #[must_use]
    pub fn new(key: impl Into<Slice>, value: impl Into<Slice>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Page-store contract used by the block range index to persist and retrieve the
/// entries belonging to a block.
///
/// Pages are immutable and append-only: once `create_data_page` returns, that page's
/// content never changes. Page ids are monotonically increasing within a single store.
pub trait IndexDataStorage {
    /// Persists `entries` as a brand new, immutable page and returns its id.
    fn create_data_page(&self, entries: &[Entry]) -> Result<PageId>;

    /// Reads back the entries written by a prior `create_data_page` call.
    fn load_data_page(&self, page_id: PageId) -> Result<Vec<Entry>>;
}

/// [`IndexDataStorage`] backed by one file per page under `<root>/pages/`.
pub struct FilePageStore {
    dir: PathBuf,
    next_id: AtomicU64,
    alignment: usize,
    batch_blocks: usize,
    use_direct_io: bool,
    descriptors: FileDescriptorTable,
}

impl FilePageStore {
    /// Opens (creating if necessary) a page store rooted at `config.path()`.
    pub fn open(config: &Config) -> Result<Self> {
        let dir = config.path.join(file::PAGES_FOLDER);
        std::fs::create_dir_all(&dir)?;

        let mut max_id = 0;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(hex) = name.strip_suffix(".page") {
                    if let Ok(id) = u64::from_str_radix(hex, 16) {
                        max_id = max_id.max(id);
                    }
                }
            }
        }

        Ok(Self {
            dir,
            next_id: AtomicU64::new(max_id + 1),
            alignment: config.alignment,
            batch_blocks: config.batch_blocks,
            use_direct_io: config.use_direct_io,
            descriptors: FileDescriptorTable::new(config.descriptor_table_size, 1),
        })
    }

    fn path_for(&self, id: PageId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    /// Encodes `entries` into a length-prefixed payload: `varlong payload_len` followed
    /// by exactly `payload_len` bytes of body + a 16-byte checksum trailer.
    ///
    /// The length prefix lets [`decode`] find the real trailer even though
    /// [`AlignedBlockWriter`] zero-pads every flush out to the configured alignment;
    /// without it, padding would be misread as part of the payload.
    fn encode(entries: &[Entry]) -> Result<Vec<u8>> {
        use varint_rs::VarintWriter;

        let mut body = Vec::new();
        body.write_u64_varint(entries.len() as u64)?;

        for entry in entries {
            body.write_u64_varint(entry.key.len() as u64)?;
            body.extend_from_slice(&entry.key);
            body.write_u64_varint(entry.value.len() as u64)?;
            body.extend_from_slice(&entry.value);
        }

        let checksum = Checksum::from_raw(u128::from(xxhash_rust::xxh3::xxh3_64(&body)));

        let mut payload = Vec::with_capacity(body.len() + 16);
        payload.extend_from_slice(&body);
        payload.extend_from_slice(&checksum.into_u128().to_le_bytes());

        let mut page = Vec::with_capacity(payload.len() + 10);
        page.write_u64_varint(payload.len() as u64)?;
        page.extend_from_slice(&payload);

        Ok(page)
    }

    fn decode(bytes: &[u8]) -> Result<Vec<Entry>> {
        use varint_rs::VarintReader;

        let mut cursor = std::io::Cursor::new(bytes);
        let payload_len = cursor.read_u64_varint()? as usize;
        let prefix_len = cursor.position() as usize;

        if payload_len < 16 {
            return Err(crate::Error::Corrupt(
                "page too short for checksum trailer".into(),
            ));
        }

        let payload_end = prefix_len
            .checked_add(payload_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| crate::Error::Corrupt("page shorter than its length prefix".into()))?;

        let payload = &bytes[prefix_len..payload_end];
        let (body, trailer) = payload.split_at(payload.len() - 16);
        let mut trailer_bytes = [0u8; 16];
        trailer_bytes.copy_from_slice(trailer);
        let expected = Checksum::from_raw(u128::from_le_bytes(trailer_bytes));

        let got = Checksum::from_raw(u128::from(xxhash_rust::xxh3::xxh3_64(body)));
        got.check(expected)?;

        let mut body_cursor = std::io::Cursor::new(body);
        let count = body_cursor.read_u64_varint()? as usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = body_cursor.read_u64_varint()? as usize;
            let mut key = vec![0u8; key_len];
            body_cursor.read_exact(&mut key)?;

            let value_len = body_cursor.read_u64_varint()? as usize;
            let mut value = vec![0u8; value_len];
            body_cursor.read_exact(&mut value)?;

            entries.push(Entry::new(key, value));
        }

        Ok(entries)
    }
}

impl IndexDataStorage for FilePageStore {
    fn create_data_page(&self, entries: &[Entry]) -> Result<PageId> {
        let id = PageId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        let path = self.path_for(id);

        let bytes = Self::encode(entries)?;

        let mut writer = AlignedBlockWriter::open(&path, self.alignment, self.batch_blocks)?;
        if !self.use_direct_io {
            log::trace!("direct I/O disabled by config for page {id}");
        }
        writer.write_bytes(&bytes)?;
        writer.close()?;

        self.descriptors.insert(path, id);

        log::debug!("created page {id} with {} entries", entries.len());

        Ok(id)
    }

    fn load_data_page(&self, page_id: PageId) -> Result<Vec<Entry>> {
        let path = self.path_for(page_id);

        if let Some(guard) = self.descriptors.access(&page_id)? {
            let mut buf = Vec::new();
            let mut file = guard.file.lock().expect("lock is poisoned");
            file.rewind()?;
            file.read_to_end(&mut buf)?;
            return Self::decode(&buf);
        }

        self.descriptors.insert(path.clone(), page_id);
        let bytes = std::fs::read(&path)?;
        Self::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn create_and_load_page_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FilePageStore::open(&Config::new(dir.path()))?;

        let entries = vec![
            Entry::new(b"a".as_slice(), b"1".as_slice()),
            Entry::new(b"b".as_slice(), b"2".as_slice()),
        ];

        let id = store.create_data_page(&entries)?;
        assert!(id.is_allocated());

        let loaded = store.load_data_page(id)?;
        assert_eq!(entries, loaded);

        Ok(())
    }

    #[test]
    fn page_ids_are_monotonic() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FilePageStore::open(&Config::new(dir.path()))?;

        let id1 = store.create_data_page(&[Entry::new(b"a".as_slice(), b"1".as_slice())])?;
        let id2 = store.create_data_page(&[Entry::new(b"b".as_slice(), b"2".as_slice())])?;

        assert!(id2.as_u64() > id1.as_u64());

        Ok(())
    }

    #[test]
    fn corrupted_page_fails_checksum() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FilePageStore::open(&Config::new(dir.path()))?;

        let id = store.create_data_page(&[Entry::new(b"a".as_slice(), b"1".as_slice())])?;
        let path = store.path_for(id);

        let mut bytes = std::fs::read(&path)?;
        let (payload_len, prefix_len) = {
            use varint_rs::VarintReader;
            let mut cursor = std::io::Cursor::new(&bytes);
            let payload_len = cursor.read_u64_varint()?;
            (payload_len as usize, cursor.position() as usize)
        };
        let corrupt_at = prefix_len + payload_len - 1;
        bytes[corrupt_at] ^= 0xFF;
        std::fs::write(&path, bytes)?;

        store.descriptors.remove(id);

        let err = store.load_data_page(id).unwrap_err();
        assert!(matches!(err, crate::Error::ChecksumMismatch { .. }));

        Ok(())
    }

    #[test]
    fn recovers_next_id_from_existing_files() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let store = FilePageStore::open(&Config::new(dir.path()))?;
            store.create_data_page(&[Entry::new(b"a".as_slice(), b"1".as_slice())])?;
        }

        let store = FilePageStore::open(&Config::new(dir.path()))?;
        let id = store.create_data_page(&[Entry::new(b"b".as_slice(), b"2".as_slice())])?;
        assert_eq!(2, id.as_u64());

        Ok(())
    }
}
