//! Page write-back: invoked by the (out-of-scope) cache/writeback layer
//! through the page, never by calling the device directly.

use crate::device::Device;
use crate::error::StorageResult;
use crate::header;
use crate::page::{Page, HEADER_SIZE, FLUSHED_PAGE_COUNT};
use std::sync::atomic::Ordering;

/// Flushes `page` to `device` if dirty. No-op otherwise.
///
/// When `crc_enabled` and the page carries a header, recomputes the CRC32
/// over the payload and writes it into both the in-memory buffer and the
/// bytes sent to the device, so a reader that never closes the device still
/// sees a consistent header.
pub fn write_back(page: &Page, device: &dyn Device, crc_enabled: bool) -> StorageResult<()> {
    if !page.is_dirty() {
        return Ok(());
    }

    let address = page.address();
    let mut buf = page.snapshot();

    if crc_enabled && !page.is_without_header() && buf.len() >= HEADER_SIZE {
        let page_type = page.page_type();
        let lsn = page.lsn();
        let crc = header::compute_crc32(address, &buf[HEADER_SIZE..]);
        header::write_header(&mut buf, page_type, crc, lsn);
        page.set_crc32(crc);
        page.with_data_mut(|d| {
            if d.len() >= HEADER_SIZE {
                header::write_header(d, page_type, crc, lsn);
            }
            Some(())
        });
    }

    device.write(address, &buf)?;
    page.set_dirty(false);
    FLUSHED_PAGE_COUNT.fetch_add(1, Ordering::Relaxed);
    log::trace!("flushed page at address {address} (lsn {})", page.lsn());
    Ok(())
}
