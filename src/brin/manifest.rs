// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk manifest for a block range index: the list of blocks needed to recover
//! without re-scanning every page, per the external BRIN manifest format.

use crate::{
    brin::block::BlockId,
    file,
    fs::{FileSystem, StdFileSystem},
    page_store::PageId,
    serde::{Deserializable, DeserializeError, Serializable, SerializeError},
    Slice,
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::{
    io::{Read, Write},
    path::Path,
};
use varint_rs::{VarintReader, VarintWriter};

/// One block's worth of recovery metadata, as persisted in the manifest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRangeIndexMetadata {
    pub block_id: BlockId,
    pub min_key: Option<Slice>,
    pub page_id: PageId,
    pub size: u32,
    pub next: Option<BlockId>,
}

impl Serializable for BlockRangeIndexMetadata {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        writer.write_u64_varint(self.block_id)?;

        match &self.min_key {
            None => writer.write_u8(0)?,
            Some(key) => {
                writer.write_u8(1)?;
                writer.write_u64_varint(key.len() as u64)?;
                writer.write_all(key)?;
            }
        }

        writer.write_u64_varint(self.page_id.as_u64())?;
        writer.write_u64_varint(u64::from(self.size))?;

        match self.next {
            None => writer.write_u8(0)?,
            Some(next) => {
                writer.write_u8(1)?;
                writer.write_u64_varint(next)?;
            }
        }

        Ok(())
    }
}

impl Deserializable for BlockRangeIndexMetadata {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        let block_id = reader.read_u64_varint()?;

        let has_min_key = reader.read_u8()?;
        let min_key = match has_min_key {
            0 => None,
            1 => {
                let len = reader.read_u64_varint()? as usize;
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf)?;
                Some(Slice::from(buf))
            }
            tag => return Err(DeserializeError::InvalidTag(("BlockRangeIndexMetadata.min_key", tag))),
        };

        let page_id = PageId::new(reader.read_u64_varint()?);
        let size = reader.read_u64_varint()? as u32;

        let has_next = reader.read_u8()?;
        let next = match has_next {
            0 => None,
            1 => Some(reader.read_u64_varint()?),
            tag => return Err(DeserializeError::InvalidTag(("BlockRangeIndexMetadata.next", tag))),
        };

        Ok(Self {
            block_id,
            min_key,
            page_id,
            size,
            next,
        })
    }
}

const MANIFEST_MAGIC: [u8; 4] = file::MAGIC_BYTES;

/// Serializes the full block list and atomically replaces the manifest file.
pub fn write_manifest(path: &Path, blocks: &[BlockRangeIndexMetadata]) -> crate::Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MANIFEST_MAGIC);
    buf.write_u64_varint(blocks.len() as u64)
        .map_err(SerializeError::from)?;

    for block in blocks {
        block.serialize(&mut buf)?;
    }

    file::rewrite_atomic::<StdFileSystem>(path, &buf)?;
    Ok(())
}

/// Reads back a manifest written by [`write_manifest`].
///
/// Returns an empty list if no manifest exists yet (a brand new index).
pub fn read_manifest(path: &Path) -> crate::Result<Vec<BlockRangeIndexMetadata>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let bytes = std::fs::read(path)?;
    if bytes.len() < 4 || bytes[..4] != MANIFEST_MAGIC[..] {
        return Err(crate::Error::Corrupt("corrupted BRIN manifest: bad magic".into()));
    }

    let mut cursor = std::io::Cursor::new(&bytes[4..]);
    let count = cursor.read_u64_varint().map_err(DeserializeError::from)? as usize;

    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(BlockRangeIndexMetadata::deserialize(&mut cursor)?);
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn manifest_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(file::MANIFEST_FILE);

        let blocks = vec![
            BlockRangeIndexMetadata {
                block_id: 0,
                min_key: None,
                page_id: PageId::new(1),
                size: 3,
                next: Some(1),
            },
            BlockRangeIndexMetadata {
                block_id: 1,
                min_key: Some(Slice::from(b"m".as_slice())),
                page_id: PageId::new(2),
                size: 2,
                next: None,
            },
        ];

        write_manifest(&path, &blocks)?;
        let read_back = read_manifest(&path)?;

        assert_eq!(blocks, read_back);

        Ok(())
    }

    #[test]
    fn missing_manifest_is_empty() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(file::MANIFEST_FILE);

        assert!(read_manifest(&path)?.is_empty());

        Ok(())
    }

    #[test]
    fn corrupted_manifest_is_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(file::MANIFEST_FILE);

        std::fs::write(&path, b"not a manifest")?;

        let err = read_manifest(&path).unwrap_err();
        assert!(matches!(err, crate::Error::Corrupt(_)));

        Ok(())
    }
}
