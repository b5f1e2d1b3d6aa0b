//! Driver adapter: the sector-granular surface a block-driver host talks to.
//!
//! The engine works in whole blocks; hosts dispatch vectored I/O in 512-byte
//! sectors. [`Device`] bridges the two: reads fetch each enclosing block
//! once and slice sectors out of it, writes decompose the request into
//! head/tail partial writes and aligned whole-block writes.
//!
//! Requests are validated up front: a vector whose entries are not
//! sector-sized multiples, or whose total disagrees with the sector count,
//! is rejected, as is any request extending beyond the virtual capacity.
//! Writes to a read-only image fail without touching anything. Hosts
//! wanting numeric codes use [`ZbdError::errno`].

use crate::blob::Blob;
use crate::error::{Result, ZbdError};
use crate::image::Image;
use crate::layout::Init;
use crate::opts::OpenOpts;

pub use crate::layout::probe;

/// Logical sector size of the virtual device.
pub const SECTOR_SIZE: u64 = 512;

/// Device characteristics reported to the host.
#[derive(Clone, Copy, Debug)]
pub struct DeviceInfo {
    /// The engine's block size; hosts should align requests to it.
    pub cluster_size: u64,
    /// Whether never-written blocks are guaranteed to read as zeros. Holds
    /// unless the image was created with `init=none`, where a zone may be
    /// claimed over undefined prior contents.
    pub unallocated_blocks_are_zero: bool,
    /// The engine compresses internally; the host must not.
    pub needs_compressed_writes: bool,
}

/// A virtual block device over an open image.
pub struct Device<B: Blob> {
    image: Image<B>,
}

impl<B: Blob> Device<B> {
    pub fn new(image: Image<B>) -> Device<B> {
        Device { image }
    }

    /// Opens an image over `blob` and wraps it as a device.
    pub fn open(blob: B, opts: &OpenOpts) -> Result<Device<B>> {
        Ok(Device::new(Image::open(blob, opts)?))
    }

    pub fn image(&self) -> &Image<B> {
        &self.image
    }

    /// Total sectors of the virtual device.
    pub fn nb_sectors(&self) -> u64 {
        self.image.capacity() / SECTOR_SIZE
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            cluster_size: self.image.block_size(),
            unallocated_blocks_are_zero: self.image.geometry().init != Init::None,
            needs_compressed_writes: false,
        }
    }

    /// Bytes of real storage consumed by the backing file.
    pub fn allocated_size(&self) -> Result<u64> {
        self.image.allocated_size()
    }

    /// Checks a vectored request: every entry sector-aligned in length, the
    /// total matching `nb_sectors`, and the range inside the device.
    fn check_request(&self, sector: u64, nb_sectors: u64, lens: &[usize]) -> Result<()> {
        let mut total = 0u64;
        for &len in lens {
            if len as u64 % SECTOR_SIZE != 0 {
                return Err(ZbdError::Unaligned);
            }
            total += len as u64;
        }
        if total != nb_sectors * SECTOR_SIZE {
            return Err(ZbdError::Unaligned);
        }
        let end = sector
            .checked_add(nb_sectors)
            .and_then(|s| s.checked_mul(SECTOR_SIZE))
            .ok_or(ZbdError::OutOfRange)?;
        if end > self.image.capacity() {
            return Err(ZbdError::OutOfRange);
        }
        Ok(())
    }

    /// Reads `nb_sectors` sectors starting at `sector` into the vector.
    pub fn read(&self, sector: u64, nb_sectors: u64, iov: &mut [&mut [u8]]) -> Result<()> {
        let lens: Vec<usize> = iov.iter().map(|b| b.len()).collect();
        self.check_request(sector, nb_sectors, &lens)?;
        let mut sec = sector;
        for buf in iov.iter_mut() {
            self.read_sectors(sec, buf)?;
            sec += buf.len() as u64 / SECTOR_SIZE;
        }
        Ok(())
    }

    /// Writes `nb_sectors` sectors starting at `sector` from the vector.
    pub fn write(&self, sector: u64, nb_sectors: u64, iov: &[&[u8]]) -> Result<()> {
        if self.image.is_read_only() {
            return Err(ZbdError::ReadOnly);
        }
        let lens: Vec<usize> = iov.iter().map(|b| b.len()).collect();
        self.check_request(sector, nb_sectors, &lens)?;
        let mut sec = sector;
        for buf in iov.iter() {
            self.write_sectors(sec, buf)?;
            sec += buf.len() as u64 / SECTOR_SIZE;
        }
        Ok(())
    }

    /// Copies sectors out of their enclosing blocks, fetching each block
    /// once across consecutive sectors.
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let bs = self.image.block_size();
        let nb = buf.len() as u64 / SECTOR_SIZE;
        let mut block = vec![0u8; bs as usize];
        let mut cached_va = u64::MAX;
        for i in 0..nb {
            let off = (sector + i) * SECTOR_SIZE;
            let va = self.image.geometry().block_align_down(off);
            if va != cached_va {
                self.image.read_block(va, &mut block)?;
                cached_va = va;
            }
            let poff = (off - va) as usize;
            let boff = (i * SECTOR_SIZE) as usize;
            buf[boff..boff + SECTOR_SIZE as usize]
                .copy_from_slice(&block[poff..poff + SECTOR_SIZE as usize]);
        }
        Ok(())
    }

    /// Splits a sector run into head/tail partial writes and aligned
    /// whole-block writes.
    fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()> {
        let bs = self.image.block_size();
        let off_start = sector * SECTOR_SIZE;
        let off_end = off_start + buf.len() as u64;
        let mut va_page = self.image.geometry().block_align_down(off_start);
        while va_page < off_end {
            let va0 = va_page.max(off_start);
            let va1 = (va_page + bs).min(off_end);
            let slice = &buf[(va0 - off_start) as usize..(va1 - off_start) as usize];
            if (va1 - va0) < bs {
                self.image.write_partial(va0, slice)?;
            } else {
                self.image.write_block(va0, slice)?;
            }
            va_page += bs;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
