//! File-backed device: pages come from a memory-mapped private view when
//! possible, otherwise from explicit `pread`/`pwrite`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EnvConfig;
use crate::crypto::apply_keystream;
use crate::error::{StorageError, StorageResult};
use crate::file_handle::{FileHandle, MappedRegion};
use crate::page::Page;

use super::Device;

struct DiskState {
    file: Option<FileHandle>,
    mapping: Option<Arc<MappedRegion>>,
    mapped_size: u64,
    file_size: u64,
    excess_at_end: u64,
}

impl Default for DiskState {
    fn default() -> Self {
        Self {
            file: None,
            mapping: None,
            mapped_size: 0,
            file_size: 0,
            excess_at_end: 0,
        }
    }
}

/// A file-based device, optionally backed by a private mmap for reads.
///
/// All state mutation happens under `state`, a single internal lock that
/// serialises every operation — short, I/O-bound critical sections are
/// exactly what this lock is for; a device is safe to share across threads
/// as `Arc<DiskDevice>` and behaves as if each call were atomic.
pub struct DiskDevice {
    config: EnvConfig,
    state: Mutex<DiskState>,
}

impl DiskDevice {
    pub fn new(config: EnvConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DiskState::default()),
        }
    }

    fn maybe_decrypt(&self, address: u64, buf: &mut [u8]) {
        if self.config.encryption_enabled() {
            apply_keystream(&self.config.encryption_key, address, buf);
        }
    }

    fn maybe_encrypt(&self, address: u64, buf: &[u8]) -> Vec<u8> {
        if self.config.encryption_enabled() {
            let mut out = buf.to_vec();
            apply_keystream(&self.config.encryption_key, address, &mut out);
            out
        } else {
            buf.to_vec()
        }
    }

    fn truncate_nolock(&self, state: &mut DiskState, new_size: u64) -> StorageResult<()> {
        if new_size > self.config.file_size_limit_bytes {
            return Err(StorageError::LimitsReached {
                requested: new_size,
                limit: self.config.file_size_limit_bytes,
            });
        }
        state
            .file
            .as_ref()
            .ok_or(StorageError::NotImplemented)?
            .truncate(new_size)?;
        state.file_size = new_size;
        Ok(())
    }
}

impl Device for DiskDevice {
    fn create(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        let mut file = FileHandle::create(&self.config.filename, self.config.file_mode)?;
        file.set_posix_advice(self.config.posix_advice);
        state.file = Some(file);
        state.file_size = 0;
        state.excess_at_end = 0;
        Ok(())
    }

    fn open(&self) -> StorageResult<()> {
        let read_only = self.config.is_read_only();
        let mut state = self.state.lock();

        let mut file = FileHandle::open(&self.config.filename, read_only)?;
        file.set_posix_advice(self.config.posix_advice);
        let file_size = file.file_size()?;
        state.file_size = file_size;
        state.file = Some(file);

        if self.config.mmap_disabled() {
            return Ok(());
        }

        let granularity = FileHandle::granularity() as u64;
        if file_size == 0 || file_size % granularity != 0 {
            log::debug!(
                "skipping mmap: file size {file_size} is not a multiple of granularity {granularity}"
            );
            return Ok(());
        }

        match state.file.as_ref().unwrap().mmap(0, file_size as usize) {
            Ok(region) => {
                state.mapping = Some(Arc::new(region));
                state.mapped_size = file_size;
            }
            Err(e) => {
                log::warn!("mmap failed, falling back to read/write: {e}");
            }
        }
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.mapping = None;
        state.mapped_size = 0;
        if let Some(mut file) = state.file.take() {
            file.close();
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        let state = self.state.lock();
        state.file.as_ref().ok_or(StorageError::NotImplemented)?.flush()
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let mut state = self.state.lock();
        self.truncate_nolock(&mut state, new_size)
    }

    fn file_size(&self) -> StorageResult<u64> {
        Ok(self.state.lock().file_size)
    }

    fn alloc(&self, requested_length: u64) -> StorageResult<u64> {
        let mut state = self.state.lock();

        if state.excess_at_end >= requested_length {
            let address = state.file_size - state.excess_at_end;
            state.excess_at_end -= requested_length;
            return Ok(address);
        }

        let excess = if state.file_size < requested_length * 100 {
            0
        } else if state.file_size < requested_length * 250 {
            requested_length * 100
        } else if state.file_size < requested_length * 1000 {
            requested_length * 250
        } else {
            requested_length * 1000
        };

        let address = state.file_size;
        self.truncate_nolock(&mut state, address + requested_length + excess)?;
        state.excess_at_end = excess;
        Ok(address)
    }

    fn read_page(&self, page: &Page, address: u64) -> StorageResult<()> {
        let state = self.state.lock();
        let page_size = self.config.page_size_bytes as u64;

        // A mapped view hands back raw on-disk bytes with no chance to run
        // them through `maybe_decrypt`; encrypted environments always read
        // through `pread` instead, even when a mapping is active.
        if let Some(mapping) = &state.mapping {
            if !self.config.encryption_enabled() && address + page_size <= state.mapped_size {
                page.assign_mapped_buffer(
                    mapping.clone(),
                    address as usize,
                    page_size as usize,
                    address,
                );
                return Ok(());
            }
        }

        let file = state.file.as_ref().ok_or(StorageError::NotImplemented)?;
        let mut buf = file.pread(address, page_size as usize)?;
        self.maybe_decrypt(address, &mut buf);
        page.assign_allocated_buffer(buf, address);
        Ok(())
    }

    fn alloc_page(&self, page: &Page) -> StorageResult<()> {
        let page_size = self.config.page_size_bytes as u64;
        let address = self.alloc(page_size)?;
        let mut buf = Vec::with_capacity(page_size as usize);
        // SAFETY: `u8` has no invalid bit pattern, so leaving the tail
        // uninitialized is sound; the device never zeroes (see spec) and
        // callers that need zeroed content go through `Page::alloc` with
        // `AllocFlags::INITIALIZE_WITH_ZEROES`.
        unsafe { buf.set_len(page_size as usize) };
        page.assign_allocated_buffer(buf, address);
        Ok(())
    }

    fn free_page(&self, page: &Page) -> StorageResult<()> {
        page.free_buffer();
        Ok(())
    }

    fn read(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let state = self.state.lock();
        let file = state.file.as_ref().ok_or(StorageError::NotImplemented)?;
        let mut buf = file.pread(offset, len)?;
        drop(state);
        self.maybe_decrypt(offset, &mut buf);
        Ok(buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> StorageResult<()> {
        if self.config.encryption_enabled() {
            // Encryption disables direct I/O: only whole-page writes,
            // starting on a page boundary, are allowed. Violating this is a
            // programming error in the caller, not a recoverable condition.
            let page_size = self.config.page_size_bytes as u64;
            if offset % page_size != 0 || buf.len() as u64 != page_size {
                return Err(StorageError::InvalidArgument(format!(
                    "encrypted write must cover exactly one page-aligned page: offset={offset}, len={}",
                    buf.len()
                )));
            }
        }
        let encrypted = self.maybe_encrypt(offset, buf);
        let state = self.state.lock();
        let file = state.file.as_ref().ok_or(StorageError::NotImplemented)?;
        file.pwrite(offset, &encrypted)
    }

    fn is_mapped(&self, offset: u64, len: usize) -> bool {
        let state = self.state.lock();
        offset + len as u64 <= state.mapped_size
    }

    fn reclaim_space(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.excess_at_end > 0 {
            let new_size = state.file_size - state.excess_at_end;
            self.truncate_nolock(&mut state, new_size)?;
            state.excess_at_end = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvFlags;
    use tempfile::tempdir;

    fn cfg(path: &std::path::Path, page_size: u32) -> EnvConfig {
        EnvConfig::new(path.to_str().unwrap().to_string()).with_page_size(page_size)
    }

    #[test]
    fn growth_schedule_matches_spec_scenario_1() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let device = DiskDevice::new(cfg(&path, 4096));
        device.create().unwrap();

        let addr1 = device.alloc(4096).unwrap();
        assert_eq!(addr1, 0);
        assert_eq!(device.file_size().unwrap(), 4096);
        assert_eq!(device.state.lock().excess_at_end, 0);

        let addr2 = device.alloc(4096).unwrap();
        assert_eq!(addr2, 4096);
        assert_eq!(device.file_size().unwrap(), 4096 * 102);
        assert_eq!(device.state.lock().excess_at_end, 100 * 4096);
    }

    #[test]
    fn excess_consumption_scenario_2() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let device = DiskDevice::new(cfg(&path, 4096));
        device.create().unwrap();
        device.alloc(4096).unwrap();
        device.alloc(4096).unwrap();

        let file_size_before = device.file_size().unwrap();
        let mut addrs = Vec::new();
        for _ in 0..100 {
            addrs.push(device.alloc(4096).unwrap());
        }
        assert_eq!(device.file_size().unwrap(), file_size_before);
        assert_eq!(device.state.lock().excess_at_end, 0);

        let unique: std::collections::HashSet<_> = addrs.iter().collect();
        assert_eq!(unique.len(), addrs.len());
        for a in &addrs {
            assert!(*a >= 2 * 4096 && *a < 102 * 4096);
        }
    }

    #[test]
    fn reclaim_scenario_3() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let device = DiskDevice::new(cfg(&path, 4096));
        device.create().unwrap();
        device.alloc(4096).unwrap();
        device.alloc(4096).unwrap();

        device.reclaim_space().unwrap();
        assert_eq!(device.file_size().unwrap(), 2 * 4096);
        assert_eq!(device.state.lock().excess_at_end, 0);
    }

    #[test]
    fn mmap_fallback_scenario_4() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        {
            let device = DiskDevice::new(cfg(&path, 4096));
            device.create().unwrap();
            device.truncate(4097).unwrap();
        }

        let device = DiskDevice::new(cfg(&path, 4096));
        device.open().unwrap();
        assert!(!device.is_mapped(0, 4096));

        let page = Page::new(4096);
        device.read_page(&page, 0).unwrap();
        assert_eq!(page.snapshot().len(), 4096);
    }

    #[test]
    fn alloc_at_exact_excess_avoids_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let device = DiskDevice::new(cfg(&path, 4096));
        device.create().unwrap();
        device.alloc(4096).unwrap();
        device.alloc(4096).unwrap();
        {
            let mut state = device.state.lock();
            state.excess_at_end = 4096;
        }
        let size_before = device.file_size().unwrap();
        let addr = device.alloc(4096).unwrap();
        assert_eq!(device.file_size().unwrap(), size_before);
        assert_eq!(device.state.lock().excess_at_end, 0);
        assert_eq!(addr, size_before - 4096);
    }

    #[test]
    fn truncate_past_limit_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let device = DiskDevice::new(cfg(&path, 4096).with_file_size_limit(8192));
        device.create().unwrap();
        assert!(device.truncate(8193).is_err());
        device.truncate(8192).unwrap();
    }

    #[test]
    fn page_round_trip_with_and_without_encryption() {
        for encrypt in [false, true] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("f.db");
            let mut c = cfg(&path, 4096);
            if encrypt {
                c = c.with_flags(EnvFlags::ENABLE_ENCRYPTION).with_encryption_key([7u8; 16]);
            }
            let device = DiskDevice::new(c);
            device.create().unwrap();

            let page = Page::new(4096);
            device.alloc_page(&page).unwrap();
            page.with_data_mut(|d| {
                d.fill(0x5A);
                Some(())
            });
            page.set_dirty(true);
            crate::writeback::write_back(&page, &device, false).unwrap();

            let fetched = Page::new(4096);
            device.read_page(&fetched, page.address()).unwrap();
            assert_eq!(fetched.snapshot(), vec![0x5A; 4096]);
        }
    }
}
