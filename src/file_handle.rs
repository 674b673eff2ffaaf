//! An owned operating-system file descriptor wrapper.
//!
//! Single-owner move semantics; closing is idempotent and happens on drop.
//! All operations block; there is no asynchrony anywhere in this crate.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use fs4::fs_std::FileExt as _;
use memmap2::{MmapMut, MmapOptions};

use crate::config::AccessHint;
use crate::error::{StorageError, StorageResult};

/// Borrowed or owned view over a page-sized region.
///
/// `mmap` always establishes a *private* (copy-on-write) mapping. Nothing in
/// this crate ever writes through a mapped buffer; writes always go through
/// `pwrite`. This split is what makes file growth safe: the mapping never
/// needs to track the file's current size.
pub struct MappedRegion {
    mmap: MmapMut,
}

impl MappedRegion {
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }
}

/// An owned OS file descriptor, wrapped for positional I/O, mmap, and
/// advisory locking.
pub struct FileHandle {
    file: Option<File>,
    posix_advice: AccessHint,
}

impl FileHandle {
    /// Opens `path` with create/truncate/read-write, applies `mode`, and
    /// takes a non-blocking exclusive advisory lock.
    pub fn create(path: impl AsRef<Path>, mode: u32) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        lock_exclusive(&file)?;
        Ok(Self {
            file: Some(file),
            posix_advice: AccessHint::Normal,
        })
    }

    /// Opens an existing path, read-only or read-write, and applies the same
    /// advisory lock.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> StorageResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::FileNotFound(path.display().to_string())
                } else {
                    StorageError::Io(e)
                }
            })?;
        lock_exclusive(&file)?;
        Ok(Self {
            file: Some(file),
            posix_advice: AccessHint::Normal,
        })
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Idempotent. Releases the advisory lock before closing the descriptor.
    /// Never touches descriptors 0 or 1 (those are never produced by
    /// `create`/`open`, but the invariant is stated for clarity).
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
            drop(file);
        }
    }

    fn file(&self) -> StorageResult<&File> {
        self.file.as_ref().ok_or(StorageError::NotImplemented)
    }

    /// Reads the full requested length or fails; a short read (other than a
    /// clean end-of-file read of fewer bytes than requested) is an error,
    /// never a silently truncated result.
    pub fn pread(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let file = self.file()?;
        let mut buf = vec![0u8; len];
        let mut total = 0usize;
        while total < len {
            let n = file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read: fewer bytes available than requested",
                )));
            }
            total += n;
        }
        Ok(buf)
    }

    pub fn pwrite(&self, offset: u64, buf: &[u8]) -> StorageResult<()> {
        let file = self.file()?;
        let mut total = 0usize;
        while total < buf.len() {
            let n = file.write_at(&buf[total..], offset + total as u64)?;
            if n == 0 {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write: zero bytes written",
                )));
            }
            total += n;
        }
        Ok(())
    }

    pub fn seek(&mut self, offset: u64) -> StorageResult<()> {
        self.file
            .as_mut()
            .ok_or(StorageError::NotImplemented)?
            .seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn tell(&mut self) -> StorageResult<u64> {
        Ok(self
            .file
            .as_mut()
            .ok_or(StorageError::NotImplemented)?
            .stream_position()?)
    }

    /// Preferably stat-based, not seek-to-end: the two historically diverged
    /// in the original implementation this crate descends from, and this
    /// crate takes the stat-based variant as definitive (see DESIGN.md).
    pub fn file_size(&self) -> StorageResult<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    pub fn truncate(&self, new_size: u64) -> StorageResult<()> {
        self.file()?.set_len(new_size)?;
        Ok(())
    }

    /// Prefers `fdatasync` (metadata-free) where the OS distinguishes it,
    /// falling back to a full sync otherwise. Never silently drops an error.
    pub fn flush(&self) -> StorageResult<()> {
        self.file()?.sync_data()?;
        Ok(())
    }

    pub fn set_posix_advice(&mut self, advice: AccessHint) {
        self.posix_advice = advice;
        if let Some(file) = &self.file {
            apply_fadvise(file, advice);
        }
    }

    /// Always establishes a PRIVATE (copy-on-write) mapping.
    pub fn mmap(&self, offset: u64, len: usize) -> StorageResult<MappedRegion> {
        let file = self.file()?;
        // SAFETY: the mapped file is not concurrently truncated below the
        // mapped length while the mapping is alive; growth always happens
        // past `mapped_size`, which the device layer enforces.
        let mmap = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len)
                .map_copy(file)?
        };
        if self.posix_advice == AccessHint::Random {
            let _ = mmap.advise(memmap2::Advice::Random);
        }
        Ok(MappedRegion { mmap })
    }

    /// OS page granularity, used to decide mmap feasibility.
    pub fn granularity() -> usize {
        page_size::get()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_exclusive(file: &File) -> StorageResult<()> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(StorageError::WouldBlock),
        Err(e) => Err(StorageError::Io(e)),
    }
}

#[cfg(unix)]
fn apply_fadvise(file: &File, advice: AccessHint) {
    let fd = file.as_raw_fd();
    let posix_advice = match advice {
        AccessHint::Normal => libc::POSIX_FADV_NORMAL,
        AccessHint::Random => libc::POSIX_FADV_RANDOM,
    };
    // Best-effort: fadvise is a hint, a failure here is not actionable.
    unsafe {
        libc::posix_fadvise(fd, 0, 0, posix_advice);
    }
}

#[cfg(not(unix))]
fn apply_fadvise(_file: &File, _advice: AccessHint) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_pwrite_pread_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");

        let handle = FileHandle::create(&path, 0o644).unwrap();
        handle.pwrite(0, b"hello world").unwrap();
        let data = handle.pread(0, 11).unwrap();
        assert_eq!(&data, b"hello world");
        drop(handle);

        let reopened = FileHandle::open(&path, true).unwrap();
        let data = reopened.pread(0, 11).unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn open_missing_file_is_file_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let err = FileHandle::open(&path, true).unwrap_err();
        assert!(matches!(err, StorageError::FileNotFound(_)));
    }

    #[test]
    fn double_close_is_a_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let mut handle = FileHandle::create(&path, 0o644).unwrap();
        handle.close();
        handle.close();
        assert!(!handle.is_open());
    }

    #[test]
    fn exclusive_lock_contends_across_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let _first = FileHandle::create(&path, 0o644).unwrap();
        let second = FileHandle::open(&path, false);
        assert!(matches!(second, Err(StorageError::WouldBlock)));
    }

    #[test]
    fn truncate_and_file_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let handle = FileHandle::create(&path, 0o644).unwrap();
        handle.truncate(8192).unwrap();
        assert_eq!(handle.file_size().unwrap(), 8192);
    }
}
