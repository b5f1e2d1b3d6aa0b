//! Compressed-page codec.
//!
//! The first 4 KiB of every Z-zone block holds a compressed page:
//!
//! ```text
//! | va: u64 | zsize: u16 | zdata[zsize] | zero padding |
//! 0         8            10             10 + zsize     4096
//! ```
//!
//! Only the first 4 KiB of a block is ever compressed; the trailing bytes of
//! a larger block are stored verbatim after the head page. The head names
//! the virtual address it belongs to, which is what makes Z allocations
//! recoverable by scanning without any index write.
//!
//! `zsize == 0` means "no valid compressed data" — it is how a scan detects
//! the high watermark of a zone whose data region was zero-initialized.

use crate::error::{Result, ZbdError};
use crate::layout::PAGE_SIZE;

/// Serialized size of the page head.
pub const HEAD_SIZE: usize = 10;

/// Maximum compressed payload: whatever fits in the head page.
pub const ZDATA_MAX: usize = PAGE_SIZE as usize - HEAD_SIZE;

/// Parsed page head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageHead {
    pub va: u64,
    pub zsize: u16,
}

impl PageHead {
    /// Reads a head from the first [`HEAD_SIZE`] bytes of a page.
    pub fn parse(page: &[u8]) -> PageHead {
        PageHead {
            va: u64::from_le_bytes(page[0..8].try_into().unwrap()),
            zsize: u16::from_le_bytes(page[8..10].try_into().unwrap()),
        }
    }

    fn store(&self, page: &mut [u8]) {
        page[0..8].copy_from_slice(&self.va.to_le_bytes());
        page[8..10].copy_from_slice(&self.zsize.to_le_bytes());
    }
}

/// A successfully decoded page: the virtual address from the head and the
/// 4 KiB of raw data.
pub struct Decoded {
    pub va: u64,
    pub data: Vec<u8>,
}

/// Compresses the first 4 KiB of `raw` into a head page at `zpage[..4096]`.
///
/// Returns `false` when the compressed payload would not fit in
/// [`ZDATA_MAX`] bytes; `zpage` is untouched in that case and the caller
/// falls back to raw storage. On success the entire head page is written,
/// zero padding included, so an in-place overwrite can never leave stale
/// bytes from a previously larger payload.
pub fn encode(raw: &[u8], va: u64, zpage: &mut [u8]) -> bool {
    let zdata = lz4_flex::block::compress(&raw[..PAGE_SIZE as usize]);
    if zdata.len() > ZDATA_MAX {
        return false;
    }
    let head = PageHead {
        va,
        zsize: zdata.len() as u16,
    };
    head.store(zpage);
    zpage[HEAD_SIZE..HEAD_SIZE + zdata.len()].copy_from_slice(&zdata);
    zpage[HEAD_SIZE + zdata.len()..PAGE_SIZE as usize].fill(0);
    true
}

/// Decodes a head page.
///
/// Returns `Ok(None)` iff `zsize == 0` (no valid data — for a scan, the
/// high watermark; for a read, a hole that reads as zeros). Any other
/// failure to produce exactly 4 KiB is corruption.
pub fn decode(zpage: &[u8]) -> Result<Option<Decoded>> {
    let head = PageHead::parse(zpage);
    if head.zsize == 0 {
        return Ok(None);
    }
    let zsize = head.zsize as usize;
    if zsize > ZDATA_MAX {
        return Err(ZbdError::Corrupt(format!(
            "compressed page head claims {} bytes (max {})",
            zsize, ZDATA_MAX
        )));
    }
    let data = lz4_flex::block::decompress(&zpage[HEAD_SIZE..HEAD_SIZE + zsize], PAGE_SIZE as usize)
        .map_err(|e| ZbdError::Corrupt(format!("compressed page does not decode: {}", e)))?;
    if data.len() != PAGE_SIZE as usize {
        return Err(ZbdError::Corrupt(format!(
            "compressed page decodes to {} bytes",
            data.len()
        )));
    }
    Ok(Some(Decoded { va: head.va, data }))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
