// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Configuration for the page store and block range index.

use std::path::{Path, PathBuf};

/// Default filesystem block size assumed when the caller does not override it.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Default number of `alignment`-sized blocks buffered by an
/// [`crate::AlignedBlockWriter`] before being flushed.
pub const DEFAULT_BATCH_BLOCKS: usize = 16;

/// Default maximum number of entries held by a single BRIN block before it splits.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 10_000;

/// Builder-style configuration shared by the page store and the block range index.
///
/// # Examples
///
/// ```
/// # use herddb_index_core::Config;
/// # let dir = tempfile::tempdir()?;
/// let config = Config::new(dir.path())
///     .max_block_size(1_000)
///     .batch_blocks(8);
/// # Ok::<(), herddb_index_core::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) path: PathBuf,
    pub(crate) alignment: usize,
    pub(crate) batch_blocks: usize,
    pub(crate) max_block_size: usize,
    pub(crate) use_direct_io: bool,
    pub(crate) descriptor_table_size: usize,
}

impl Config {
    /// Creates a config rooted at `path`, using defaults for everything else.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            alignment: DEFAULT_ALIGNMENT,
            batch_blocks: DEFAULT_BATCH_BLOCKS,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            use_direct_io: true,
            descriptor_table_size: 128,
        }
    }

    /// Sets the required write alignment (the filesystem block size).
    #[must_use]
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets how many alignment-sized blocks are buffered before a flush.
    #[must_use]
    pub fn batch_blocks(mut self, batch_blocks: usize) -> Self {
        self.batch_blocks = batch_blocks;
        self
    }

    /// Sets the maximum number of entries a BRIN block may hold before splitting.
    #[must_use]
    pub fn max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    /// Controls whether page writes are attempted with `O_DIRECT` (default: `true`).
    ///
    /// When `false`, the portable buffered path is used unconditionally.
    #[must_use]
    pub fn use_direct_io(mut self, use_direct_io: bool) -> Self {
        self.use_direct_io = use_direct_io;
        self
    }

    /// Sets how many open file descriptors the page store's descriptor table may
    /// cache at once.
    #[must_use]
    pub fn descriptor_table_size(mut self, size: usize) -> Self {
        self.descriptor_table_size = size;
        self
    }

    /// The root directory this configuration points at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn config_defaults() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path());
        assert_eq!(DEFAULT_ALIGNMENT, config.alignment);
        assert_eq!(DEFAULT_BATCH_BLOCKS, config.batch_blocks);
        assert_eq!(DEFAULT_MAX_BLOCK_SIZE, config.max_block_size);
        assert!(config.use_direct_io);
        Ok(())
    }

    #[test]
    fn config_builder_overrides() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path())
            .alignment(512)
            .batch_blocks(4)
            .max_block_size(10)
            .use_direct_io(false);

        assert_eq!(512, config.alignment);
        assert_eq!(4, config.batch_blocks);
        assert_eq!(10, config.max_block_size);
        assert!(!config.use_direct_io);
        Ok(())
    }
}
