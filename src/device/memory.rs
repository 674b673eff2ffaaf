//! Heap-backed device for environments opened with `IN_MEMORY`.
//!
//! Every file-oriented operation fails with `NotImplemented`; callers that
//! need in-memory mode are expected not to call them. The "address" of a
//! page is a synthetic, monotonically increasing identifier that stands in
//! for the original implementation's raw heap pointer value — using a real
//! pointer as an address would require leaking allocations to keep them
//! alive past the borrow checker's view of ownership, for no behavioural
//! benefit over a monotonic counter (see DESIGN.md).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::EnvConfig;
use crate::error::{StorageError, StorageResult};
use crate::page::Page;

use super::Device;

struct MemoryState {
    is_open: bool,
    allocated_size_total: u64,
    next_address: u64,
    blocks: HashMap<u64, Vec<u8>>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            is_open: false,
            // Address 0 is reserved for the environment header page (same
            // convention as the disk device), so synthetic addresses start
            // past it.
            allocated_size_total: 0,
            next_address: 1,
            blocks: HashMap::new(),
        }
    }
}

pub struct InMemoryDevice {
    config: EnvConfig,
    state: Mutex<MemoryState>,
}

impl InMemoryDevice {
    pub fn new(config: EnvConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn reserve(&self, state: &mut MemoryState, len: u64) -> StorageResult<u64> {
        let new_total = state.allocated_size_total + len;
        if new_total > self.config.file_size_limit_bytes {
            return Err(StorageError::LimitsReached {
                requested: new_total,
                limit: self.config.file_size_limit_bytes,
            });
        }
        let address = state.next_address;
        state.next_address += len.max(1);
        state.allocated_size_total = new_total;
        let mut buf = Vec::with_capacity(len as usize);
        // SAFETY: `u8` has no invalid bit pattern; the device never zeroes
        // (see spec) — callers that need zeroed content go through
        // `Page::alloc` with `AllocFlags::INITIALIZE_WITH_ZEROES`.
        unsafe { buf.set_len(len as usize) };
        state.blocks.insert(address, buf);
        Ok(address)
    }
}

impl Device for InMemoryDevice {
    fn create(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        *state = MemoryState::default();
        state.is_open = true;
        Ok(())
    }

    fn open(&self) -> StorageResult<()> {
        // There is no backing store to attach to, matching the spec's
        // listing of `open` among the file-oriented operations this
        // variant rejects rather than emulates.
        Err(StorageError::NotImplemented)
    }

    fn close(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.is_open = false;
        state.blocks.clear();
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&self, _new_size: u64) -> StorageResult<()> {
        Err(StorageError::NotImplemented)
    }

    fn file_size(&self) -> StorageResult<u64> {
        Err(StorageError::NotImplemented)
    }

    fn alloc(&self, len: u64) -> StorageResult<u64> {
        let mut state = self.state.lock();
        self.reserve(&mut state, len)
    }

    fn read_page(&self, _page: &Page, _address: u64) -> StorageResult<()> {
        Err(StorageError::NotImplemented)
    }

    fn alloc_page(&self, page: &Page) -> StorageResult<()> {
        let page_size = self.config.page_size_bytes as u64;
        let mut state = self.state.lock();
        let address = self.reserve(&mut state, page_size)?;
        let data = state.blocks.get(&address).unwrap().clone();
        page.assign_allocated_buffer(data, address);
        Ok(())
    }

    fn free_page(&self, page: &Page) -> StorageResult<()> {
        let mut state = self.state.lock();
        let address = page.address();
        if let Some(block) = state.blocks.remove(&address) {
            state.allocated_size_total = state.allocated_size_total.saturating_sub(block.len() as u64);
        }
        page.free_buffer();
        Ok(())
    }

    fn read(&self, _offset: u64, _len: usize) -> StorageResult<Vec<u8>> {
        Err(StorageError::NotImplemented)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> StorageResult<()> {
        let mut state = self.state.lock();
        match state.blocks.get_mut(&offset) {
            Some(block) => {
                if block.len() != buf.len() {
                    *block = buf.to_vec();
                } else {
                    block.copy_from_slice(buf);
                }
                Ok(())
            }
            None => Err(StorageError::InvalidArgument(format!(
                "no in-memory block at address {offset}"
            ))),
        }
    }

    fn is_mapped(&self, _offset: u64, _len: usize) -> bool {
        false
    }

    fn reclaim_space(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Releases a block previously returned by `alloc`, mirroring the original
/// `InMemoryDevice::release`. `free_page`/`free_buffer` cover the page path;
/// this is for raw `alloc`-ed ranges that never became a `Page`.
impl InMemoryDevice {
    pub fn release(&self, address: u64) -> StorageResult<()> {
        let mut state = self.state.lock();
        if let Some(block) = state.blocks.remove(&address) {
            state.allocated_size_total = state.allocated_size_total.saturating_sub(block.len() as u64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;

    #[test]
    fn file_oriented_operations_fail() {
        let device = InMemoryDevice::new(EnvConfig::default());
        device.create().unwrap();
        assert!(matches!(device.open(), Err(StorageError::NotImplemented)));
        assert!(matches!(device.file_size(), Err(StorageError::NotImplemented)));
        assert!(matches!(device.truncate(10), Err(StorageError::NotImplemented)));
        assert!(matches!(device.read(0, 10), Err(StorageError::NotImplemented)));
        let page = Page::new(4096);
        assert!(matches!(
            device.read_page(&page, 0),
            Err(StorageError::NotImplemented)
        ));
    }

    #[test]
    fn alloc_page_and_write_round_trip() {
        let device = InMemoryDevice::new(EnvConfig::default().with_page_size(4096));
        device.create().unwrap();

        let page = Page::new(4096);
        device.alloc_page(&page).unwrap();
        assert!(page.address() > 0);

        page.with_data_mut(|d| {
            d.fill(0x11);
            Some(())
        });
        let snapshot = page.snapshot();
        device.write(page.address(), &snapshot).unwrap();

        device.free_page(&page).unwrap();
        assert!(!page.is_allocated());
    }

    #[test]
    fn enforces_size_limit() {
        let device = InMemoryDevice::new(
            EnvConfig::default()
                .with_page_size(4096)
                .with_file_size_limit(4096),
        );
        device.create().unwrap();
        device.alloc(4096).unwrap();
        assert!(matches!(
            device.alloc(4096),
            Err(StorageError::LimitsReached { .. })
        ));
    }
}
