// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Append-only, sector-aligned writer used to persist pages with `O_DIRECT` where
//! available.
//!
//! Grounded in the teacher's segment writer (buffer, spill, finish) fused with the
//! `O_DIRECT` opening idiom used for page storage in comparable engines: buffers are
//! zero-padded up to `alignment` before being handed to the OS, and the file is opened
//! with `O_DIRECT` when the underlying filesystem supports it, falling back to a
//! regular buffered file (still alignment-padded, still `fsync`'d) otherwise.

use crate::Result;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Writes bytes to a file in fixed-size, sector-aligned batches.
///
/// Once any I/O error occurs the writer is poisoned: every subsequent call returns
/// [`crate::Error::Io`] immediately without touching the file again, mirroring how a
/// block is marked inconsistent after a failed flush.
pub struct AlignedBlockWriter {
    file: File,
    /// Required alignment of each write and of the buffer itself (the filesystem
    /// block size, typically 4096).
    alignment: usize,
    /// `alignment * batch_blocks`: the unit the buffer is flushed in.
    batch_size: usize,
    buffer: Vec<u8>,
    written_blocks: u64,
    poisoned: bool,
    direct_io: bool,
}

impl AlignedBlockWriter {
    /// Opens `path` for append-only writing, requesting `O_DIRECT` on unix platforms.
    ///
    /// `alignment` must be a power of two (normally the filesystem block size).
    /// `batch_blocks` controls how many `alignment`-sized blocks are buffered before
    /// being flushed to disk as one write.
    pub fn open(path: &Path, alignment: usize, batch_blocks: usize) -> Result<Self> {
        assert!(alignment > 0 && alignment.is_power_of_two());
        assert!(batch_blocks > 0);

        let batch_size = alignment * batch_blocks;

        let (file, direct_io) = Self::open_file(path, true)?;

        Ok(Self {
            file,
            alignment,
            batch_size,
            buffer: Vec::with_capacity(2 * batch_size),
            written_blocks: 0,
            poisoned: false,
            direct_io,
        })
    }

    fn open_file(path: &Path, try_direct: bool) -> Result<(File, bool)> {
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);

        #[cfg(unix)]
        if try_direct {
            let mut direct_options = options.clone();
            direct_options.custom_flags(libc::O_DIRECT);

            match direct_options.open(path) {
                Ok(file) => return Ok((file, true)),
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    log::debug!("O_DIRECT rejected by filesystem, falling back: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let file = options.open(path)?;
        Ok((file, false))
    }

    /// Whether this writer is actually using `O_DIRECT` (as opposed to the portable
    /// fallback path).
    #[must_use]
    pub fn is_direct_io(&self) -> bool {
        self.direct_io
    }

    /// Number of full `alignment`-sized blocks written to disk so far.
    #[must_use]
    pub fn written_blocks(&self) -> u64 {
        self.written_blocks
    }

    fn ensure_not_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(io::Error::new(io::ErrorKind::Other, "writer is poisoned").into());
        }
        Ok(())
    }

    /// Appends a single byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write_bytes(&[byte])
    }

    /// Appends `bytes`, flushing full batches to disk as the buffer fills up.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_not_poisoned()?;

        self.buffer.extend_from_slice(bytes);

        while self.buffer.len() >= self.batch_size {
            if let Err(e) = self.spill_batch() {
                self.poisoned = true;
                return Err(e);
            }
        }

        Ok(())
    }

    fn spill_batch(&mut self) -> Result<()> {
        use io::Write;

        let batch: Vec<u8> = self.buffer.drain(..self.batch_size).collect();
        debug_assert_eq!(batch.len() % self.alignment, 0);

        self.file.write_all(&batch)?;
        self.written_blocks += (batch.len() / self.alignment) as u64;

        Ok(())
    }

    /// Pads the remaining buffer up to `alignment` with zero bytes and writes it out,
    /// then `fsync`s the file. Does not consume the writer: more bytes may follow.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_not_poisoned()?;

        if let Err(e) = self.flush_inner() {
            self.poisoned = true;
            return Err(e);
        }

        Ok(())
    }

    fn flush_inner(&mut self) -> Result<()> {
        use io::Write;

        while self.buffer.len() >= self.batch_size {
            self.spill_batch()?;
        }

        if !self.buffer.is_empty() {
            let pad = (self.alignment - (self.buffer.len() % self.alignment)) % self.alignment;
            self.buffer.resize(self.buffer.len() + pad, 0);

            let batch: Vec<u8> = self.buffer.drain(..).collect();
            self.file.write_all(&batch)?;
            self.written_blocks += (batch.len() / self.alignment) as u64;
        }

        self.file.flush()?;
        self.file.sync_all()?;

        Ok(())
    }

    /// Flushes any remaining bytes and closes the writer.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn writes_are_padded_to_alignment() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("page.bin");

        let mut writer = AlignedBlockWriter::open(&path, 512, 1)?;
        writer.write_bytes(b"hello")?;
        writer.close()?;

        let len = std::fs::metadata(&path)?.len();
        assert_eq!(0, len % 512);
        assert!(len >= 512);

        let content = std::fs::read(&path)?;
        assert_eq!(&content[..5], b"hello");
        assert!(content[5..].iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn multiple_batches_flush_incrementally() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("page.bin");

        let mut writer = AlignedBlockWriter::open(&path, 16, 1)?;
        for _ in 0..40 {
            writer.write_byte(b'x')?;
        }
        assert!(writer.written_blocks() >= 2);
        writer.close()?;

        let content = std::fs::read(&path)?;
        assert_eq!(0, content.len() % 16);
        assert!(content.len() >= 40);

        Ok(())
    }

    #[test]
    fn poisoned_after_close_rejects_further_writes() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("page.bin");

        let mut writer = AlignedBlockWriter::open(&path, 512, 1)?;
        writer.write_bytes(b"abc")?;
        writer.flush()?;

        // Simulate the file being poisoned by a failed I/O by poisoning directly.
        writer.poisoned = true;
        assert!(writer.write_byte(b'z').is_err());
        assert!(writer.flush().is_err());

        Ok(())
    }
}
