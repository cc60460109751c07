// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{fs::FileSystem, Slice};
use std::{fs::File, io::Write, os::unix::fs::FileExt, path::Path};

pub const MAGIC_BYTES: [u8; 4] = [b'H', b'R', b'D', 1];

pub const PAGES_FOLDER: &str = "pages";
pub const MANIFEST_FILE: &str = "brin.manifest";

/// Reads `size` bytes at `offset` from `file` using `pread`.
pub fn read_exact(file: &File, offset: u64, size: usize) -> std::io::Result<Slice> {
    let mut buf = vec![0u8; size];
    file.read_exact_at(&mut buf, offset)?;
    Ok(Slice::from(buf.as_slice()))
}

/// Atomically rewrites a file: write to a temp file in the same directory, fsync it,
/// rename it into place, then fsync the file and its parent directory.
pub fn rewrite_atomic<F: FileSystem>(path: &Path, content: &[u8]) -> std::io::Result<()> {
    #[expect(
        clippy::expect_used,
        reason = "every file should have a parent directory"
    )]
    let folder = path.parent().expect("should have a parent");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = F::open(path)?;
        file.sync_all()?;

        #[expect(
            clippy::expect_used,
            reason = "files should always have a parent directory"
        )]
        let folder = path.parent().expect("should have parent folder");
        fsync_directory::<F>(folder)?;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory<F: FileSystem>(path: &Path) -> std::io::Result<()> {
    let file = F::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory<F: FileSystem>(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync a directory handle on Windows.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn atomic_rewrite() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let path = dir.path().join("test.txt");
        {
            let mut file = <crate::fs::StdFileSystem as FileSystem>::create(&path)?;
            write!(file, "asdasdasdasdasd")?;
        }

        rewrite_atomic::<crate::fs::StdFileSystem>(&path, b"newcontent")?;

        let content = crate::fs::StdFileSystem::read_to_string(&path)?;
        assert_eq!("newcontent", content);

        Ok(())
    }

    #[test]
    fn read_exact_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");

        std::fs::write(&path, b"hello world")?;
        let file = std::fs::File::open(&path)?;

        let slice = read_exact(&file, 6, 5)?;
        assert_eq!(&*slice, b"world");

        Ok(())
    }
}
