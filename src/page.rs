//! The fixed-size, versioned unit of on-disk state.

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::config::DEFAULT_PAGE_SIZE;
use crate::device::Device;
use crate::error::StorageResult;

bitflags! {
    /// Options for the page-level `Page::alloc` entry point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Reset the page's buffer to all zeroes after reservation. The
        /// device layer itself never zeroes (see `Device::alloc_page`); this
        /// is the opt-in path callers take when they need it.
        const INITIALIZE_WITH_ZEROES = 1 << 0;
    }
}

/// Size, in bytes, of the persistent page header (flags + crc32 + lsn).
/// The payload begins immediately after.
pub const HEADER_SIZE: usize = 4 + 4 + 8;

/// Page type tag, stored in the persistent header's `flags` field.
///
/// When a large blob spans multiple pages, only the first page carries a
/// meaningful type; continuation pages are marked `is_without_header` and
/// their bytes are entirely blob payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageType {
    Unknown = 0x0000_0000,
    Header = 0x1000_0000,
    BtreeRoot = 0x2000_0000,
    BtreeIndex = 0x3000_0000,
    PageManager = 0x4000_0000,
    Blob = 0x5000_0000,
}

impl PageType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x1000_0000 => PageType::Header,
            0x2000_0000 => PageType::BtreeRoot,
            0x3000_0000 => PageType::BtreeIndex,
            0x4000_0000 => PageType::PageManager,
            0x5000_0000 => PageType::Blob,
            _ => PageType::Unknown,
        }
    }
}

/// Which of the three intrusive lists a slot belongs to. The page owns the
/// storage for these links; a cache (out of scope for this crate) owns the
/// discipline of walking and re-linking them. This lets an evictor unlink a
/// page from all three lists in O(1) without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Cache = 0,
    Changeset = 1,
    Bucket = 2,
}

const LIST_COUNT: usize = 3;

/// One slot of an intrusive doubly-linked list: the addresses of the
/// previous/next page in that list, if any. Addresses (not pointers) are
/// used so the links stay valid across the page being evicted and refetched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntrusiveLinks {
    prev: [Option<u64>; LIST_COUNT],
    next: [Option<u64>; LIST_COUNT],
}

impl IntrusiveLinks {
    pub fn prev(&self, list: ListKind) -> Option<u64> {
        self.prev[list as usize]
    }

    pub fn next(&self, list: ListKind) -> Option<u64> {
        self.next[list as usize]
    }

    pub fn set_prev(&mut self, list: ListKind, addr: Option<u64>) {
        self.prev[list as usize] = addr;
    }

    pub fn set_next(&mut self, list: ListKind, addr: Option<u64>) {
        self.next[list as usize] = addr;
    }

    /// Detaches this slot from the given list, returning the (prev, next)
    /// pair so the caller can re-splice its neighbours.
    pub fn unlink(&mut self, list: ListKind) -> (Option<u64>, Option<u64>) {
        let p = self.prev[list as usize].take();
        let n = self.next[list as usize].take();
        (p, n)
    }
}

/// Ownership of a page's backing buffer.
///
/// Replaces the historical "allocated bool + raw pointer" pairing with a sum
/// type: `Owned` buffers must be freed, `Borrowed` buffers must not be (the
/// mapping that backs them outlives the borrow), and `Empty` carries
/// nothing. A single release path (`free_buffer`) handles both non-empty
/// cases, removing an entire class of double-free/use-after-munmap bugs.
pub enum Buffer {
    Empty,
    Owned(Vec<u8>),
    Borrowed {
        ptr: *const u8,
        len: usize,
        // Keeps the backing mapping alive for as long as any page borrows
        // from it.
        _mapping: std::sync::Arc<crate::file_handle::MappedRegion>,
    },
}

impl Buffer {
    pub fn is_empty(&self) -> bool {
        matches!(self, Buffer::Empty)
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Buffer::Owned(_))
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, Buffer::Borrowed { .. })
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Empty => &[],
            Buffer::Owned(v) => v,
            // SAFETY: `_mapping` is kept alive alongside `ptr`/`len`, which
            // were derived from it and never outlive it.
            Buffer::Borrowed { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts(*ptr, *len)
            },
        }
    }

    /// Mutable access. Only ever valid for `Owned` buffers: a `Borrowed`
    /// buffer is backed by a private mmap which this crate never writes
    /// through (see `FileHandle::mmap`); a dirty page is always `Owned`.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Buffer::Owned(v) => Some(v),
            _ => None,
        }
    }
}

pub struct PageInner {
    address: u64,
    page_size: u32,
    buffer: Buffer,
    is_dirty: bool,
    is_without_header: bool,
    type_tag: PageType,
    crc32: u32,
    lsn: u64,
    links: IntrusiveLinks,
}

/// A fixed-size block of on-disk state, identified by its absolute byte
/// offset in the file (or, for in-memory devices, the numeric value of its
/// heap pointer).
///
/// The contents are behind a lock so the cache/writeback layer can serialise
/// readers against a page being written back or mutated by the B+tree.
/// `parking_lot::Mutex` spins briefly before parking a thread, which is the
/// "spin then park" behaviour appropriate for the short, I/O-bound critical
/// sections a page lock guards.
pub struct Page {
    inner: Mutex<PageInner>,
}

// `Buffer::Borrowed` carries a raw pointer into a `MappedRegion`, which is
// itself only reachable through the `Arc` the same variant holds onto. The
// pointer is never written through and never outlives the mapping, so
// sharing a `Page` across threads is sound even though the auto traits can't
// see it.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    pub fn new(page_size: u32) -> Self {
        Self {
            inner: Mutex::new(PageInner {
                address: 0,
                page_size,
                buffer: Buffer::Empty,
                is_dirty: false,
                is_without_header: false,
                type_tag: PageType::Unknown,
                crc32: 0,
                lsn: 0,
                links: IntrusiveLinks::default(),
            }),
        }
    }

    pub fn address(&self) -> u64 {
        self.inner.lock().address
    }

    pub fn set_address(&self, address: u64) {
        self.inner.lock().address = address;
    }

    pub fn page_size(&self) -> u32 {
        self.inner.lock().page_size
    }

    pub fn page_type(&self) -> PageType {
        self.inner.lock().type_tag
    }

    pub fn set_page_type(&self, t: PageType) {
        self.inner.lock().type_tag = t;
    }

    pub fn crc32(&self) -> u32 {
        self.inner.lock().crc32
    }

    pub fn set_crc32(&self, crc: u32) {
        self.inner.lock().crc32 = crc;
    }

    pub fn lsn(&self) -> u64 {
        self.inner.lock().lsn
    }

    pub fn set_lsn(&self, lsn: u64) {
        self.inner.lock().lsn = lsn;
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().is_dirty
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.inner.lock().is_dirty = dirty;
    }

    pub fn is_without_header(&self) -> bool {
        self.inner.lock().is_without_header
    }

    pub fn set_without_header(&self, v: bool) {
        self.inner.lock().is_without_header = v;
    }

    pub fn is_header(&self) -> bool {
        self.address() == 0
    }

    pub fn is_allocated(&self) -> bool {
        !self.inner.lock().buffer.is_empty()
    }

    /// Installs a heap-allocated buffer as this page's contents. The
    /// previous buffer (if any) is released first.
    pub fn assign_allocated_buffer(&self, data: Vec<u8>, address: u64) {
        let mut inner = self.inner.lock();
        inner.buffer = Buffer::Owned(data);
        inner.address = address;
    }

    /// Installs a view into an active mapping as this page's contents.
    /// Never freed by `free_buffer`; the mapping's own lifetime governs it.
    pub fn assign_mapped_buffer(
        &self,
        mapping: std::sync::Arc<crate::file_handle::MappedRegion>,
        offset_in_mapping: usize,
        len: usize,
        address: u64,
    ) {
        let ptr = unsafe { mapping.as_ptr().add(offset_in_mapping) };
        let mut inner = self.inner.lock();
        inner.buffer = Buffer::Borrowed {
            ptr,
            len,
            _mapping: mapping,
        };
        inner.address = address;
    }

    /// Releases the buffer: drops an `Owned` heap allocation, or simply
    /// forgets a `Borrowed` view without touching the mapping it came from.
    pub fn free_buffer(&self) {
        self.inner.lock().buffer = Buffer::Empty;
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock();
        f(inner.buffer.as_slice())
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> Option<R>) -> Option<R> {
        let mut inner = self.inner.lock();
        match inner.buffer.as_mut_slice() {
            Some(slice) => f(slice),
            None => None,
        }
    }

    /// Copies out the entire buffer. Used by write-back, which needs an
    /// owned copy it can pass to the device without holding the page lock
    /// across I/O.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().buffer.as_slice().to_vec()
    }

    /// Pointer past the header: the caller-defined page body.
    pub fn payload_range(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        if inner.is_without_header {
            (0, inner.page_size as usize)
        } else {
            (HEADER_SIZE, inner.page_size as usize)
        }
    }

    /// Reserves this page's buffer through `device` and optionally stamps a
    /// type, mirroring the historical `Page::alloc(type, flags)` entry
    /// point. `Device::alloc_page` never zeroes; passing
    /// `AllocFlags::INITIALIZE_WITH_ZEROES` here memsets the payload
    /// explicitly after the reservation completes.
    pub fn alloc(
        &self,
        device: &dyn Device,
        page_type: PageType,
        flags: AllocFlags,
    ) -> StorageResult<()> {
        device.alloc_page(self)?;
        if flags.contains(AllocFlags::INITIALIZE_WITH_ZEROES) {
            self.with_data_mut(|d| {
                d.fill(0);
                Some(())
            });
        }
        if page_type != PageType::Unknown {
            self.set_page_type(page_type);
        }
        Ok(())
    }

    pub fn links(&self) -> IntrusiveLinks {
        self.inner.lock().links
    }

    pub fn set_links(&self, links: IntrusiveLinks) {
        self.inner.lock().links = links;
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Page")
            .field("address", &inner.address)
            .field("type", &inner.type_tag)
            .field("is_dirty", &inner.is_dirty)
            .field("lsn", &inner.lsn)
            .field("crc32", &inner.crc32)
            .finish()
    }
}

/// Process-wide counter of pages flushed, exposed as an observability hook.
/// A relaxed atomic: readers may observe any monotonically increasing value.
pub static FLUSHED_PAGE_COUNT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_is_empty_and_clean() {
        let page = Page::new(4096);
        assert!(!page.is_allocated());
        assert!(!page.is_dirty());
        assert_eq!(page.crc32(), 0);
        assert_eq!(page.lsn(), 0);
    }

    #[test]
    fn assign_and_free_owned_buffer() {
        let page = Page::new(4096);
        page.assign_allocated_buffer(vec![0u8; 4096], 8192);
        assert!(page.is_allocated());
        assert_eq!(page.address(), 8192);
        page.set_dirty(true);
        assert!(page.with_data_mut(|d| {
            d[0] = 0xAB;
            Some(())
        }).is_some());
        assert_eq!(page.snapshot()[0], 0xAB);
        page.free_buffer();
        assert!(!page.is_allocated());
    }

    #[test]
    fn payload_range_excludes_header_unless_without_header() {
        let page = Page::new(4096);
        assert_eq!(page.payload_range(), (HEADER_SIZE, 4096));
        page.set_without_header(true);
        assert_eq!(page.payload_range(), (0, 4096));
    }

    #[test]
    fn intrusive_links_round_trip() {
        let page = Page::new(4096);
        let mut links = page.links();
        links.set_next(ListKind::Cache, Some(100));
        links.set_prev(ListKind::Cache, Some(50));
        page.set_links(links);

        let read_back = page.links();
        assert_eq!(read_back.next(ListKind::Cache), Some(100));
        assert_eq!(read_back.prev(ListKind::Cache), Some(50));
        assert_eq!(read_back.next(ListKind::Changeset), None);
    }

    #[test]
    fn alloc_with_initialize_with_zeroes_memsets_the_payload() {
        use crate::config::EnvConfig;
        use crate::device::DiskDevice;
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let device = DiskDevice::new(EnvConfig::new(path.to_str().unwrap().to_string()).with_page_size(4096));
        device.create().unwrap();

        let page = Page::new(4096);
        page.alloc(&device, PageType::BtreeIndex, AllocFlags::INITIALIZE_WITH_ZEROES)
            .unwrap();
        assert_eq!(page.page_type(), PageType::BtreeIndex);
        assert!(page.snapshot().iter().all(|&b| b == 0));
    }

    #[test]
    fn alloc_without_the_flag_does_not_promise_zeroes() {
        use crate::config::EnvConfig;
        use crate::device::DiskDevice;
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let path = dir.path().join("f.db");
        let device = DiskDevice::new(EnvConfig::new(path.to_str().unwrap().to_string()).with_page_size(4096));
        device.create().unwrap();

        let page = Page::new(4096);
        page.alloc(&device, PageType::Unknown, AllocFlags::empty()).unwrap();
        assert!(page.is_allocated());
        assert_eq!(page.page_type(), PageType::Unknown);
    }
}
