//! The polymorphic storage target consumed by higher layers.
//!
//! A `Device` serves pages; it is either backed by a file (optionally with
//! an active memory mapping) or by heap memory. Callers above the device
//! are unaware of which one they're talking to, and unaware of whether a
//! fetched page points into a mapping or a freshly read heap buffer.

pub mod disk;
pub mod memory;

pub use disk::DiskDevice;
pub use memory::InMemoryDevice;

use crate::error::StorageResult;
use crate::page::Page;

/// Shared contract implemented by `DiskDevice` and `InMemoryDevice`.
///
/// Every method is safe to call concurrently: implementations serialise
/// their own state behind a single internal lock, so the device behaves as
/// if each call were atomic. There are no cancellation tokens or timeouts;
/// an operation in flight runs to completion or returns an error.
pub trait Device: Send + Sync {
    /// Initialises a fresh backing store.
    fn create(&self) -> StorageResult<()>;

    /// Attaches to an existing backing store.
    fn open(&self) -> StorageResult<()>;

    /// Releases any mapping, then closes the backing store. Idempotent.
    fn close(&self) -> StorageResult<()>;

    /// Durably flushes the backing store.
    fn flush(&self) -> StorageResult<()>;

    /// Sets the absolute size of the backing store.
    fn truncate(&self, new_size: u64) -> StorageResult<()>;

    /// The cached size of the backing store; always equal to its actual
    /// on-disk size by invariant.
    fn file_size(&self) -> StorageResult<u64>;

    /// Reserves `len` bytes and returns the address of the reservation. The
    /// caller owns that address exclusively until it calls `free_page` (for
    /// page-granular reservations) — there is no free-list at this layer.
    fn alloc(&self, len: u64) -> StorageResult<u64>;

    /// Fetches the page at `address` into `page`, installing either a
    /// borrowed view into an active mapping or a freshly read heap buffer.
    fn read_page(&self, page: &Page, address: u64) -> StorageResult<()>;

    /// Reserves one page-size region and installs a heap buffer on `page`.
    /// The buffer is *not* zeroed; callers that need zeroed content go
    /// through `Page::alloc` with `AllocFlags::INITIALIZE_WITH_ZEROES`,
    /// which memsets the payload explicitly after this call returns.
    fn alloc_page(&self, page: &Page) -> StorageResult<()>;

    /// Releases `page`'s buffer. Does not return the address to any
    /// free-list; higher layers track that.
    fn free_page(&self, page: &Page) -> StorageResult<()>;

    /// Raw positional read, with encryption transparently applied when
    /// enabled.
    fn read(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Raw positional write, with encryption transparently applied when
    /// enabled.
    fn write(&self, offset: u64, buf: &[u8]) -> StorageResult<()>;

    /// True when `[offset, offset + len)` lies entirely within the active
    /// mapping.
    fn is_mapped(&self, offset: u64, len: usize) -> bool;

    /// Drops any reserved-but-unallocated tail space.
    fn reclaim_space(&self) -> StorageResult<()>;
}
