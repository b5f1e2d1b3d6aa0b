//! The storage engine: one open image.
//!
//! [`Image`] owns the backing blob, the zone table, and the index, and
//! implements the block-granular data path plus open-time recovery.
//!
//! # Persistence regimes
//!
//! Three rules keep the metadata recoverable without a journal:
//!
//! - **N allocations** advance the zone counter durably and install their
//!   index entry durably before the write is acknowledged. A crashed N
//!   write leaves either no entry (reads as zero) or an entry beyond the
//!   persisted counter, which open-time repair drops.
//! - **Z allocations** persist nothing per write. The compressed head of
//!   every Z block names its VA, and units are written sequentially, so the
//!   open-time scan of the current Z-zone rebuilds the mappings.
//! - **L allocations** persist the zone counter, which is exactly what lets
//!   the opener distinguish published L2 pages from in-flight ones.
//!
//! Data always reaches its freshly allocated PA before the index points at
//! it, so a reader can never be directed at unwritten bytes.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::blob::{Blob, FileBlob};
use crate::error::{Result, ZbdError};
use crate::index::Index;
use crate::layout::{Geometry, ImageHeader, HEADER_SIZE, PAGE_SIZE};
use crate::opts::OpenOpts;
use crate::zone::{ZoneClass, ZoneTable};
use crate::zpage;

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Lifetime write counters of an open image.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteStats {
    /// Compressed data-block writes.
    pub data_z: u64,
    /// Raw data-block writes.
    pub data_n: u64,
    /// Zone-info entry writes.
    pub zone: u64,
    /// L1 page writes.
    pub l1: u64,
    /// L2 page writes.
    pub l2: u64,
}

/// Mapped-block counts by zone class.
#[derive(Clone, Copy, Debug, Default)]
pub struct MappingCensus {
    pub z: u64,
    pub n: u64,
    pub other: u64,
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

pub struct Image<B: Blob> {
    header: ImageHeader,
    geo: Geometry,
    blob: B,
    zones: ZoneTable,
    index: Index,
    read_only: bool,
    nr_write_data_z: AtomicU64,
    nr_write_data_n: AtomicU64,
}

impl Image<FileBlob> {
    /// Opens the image file at `path`.
    pub fn open_file<P: AsRef<Path>>(path: P, opts: &OpenOpts) -> Result<Image<FileBlob>> {
        let blob = FileBlob::open(path, opts.read_only)?;
        Image::open(blob, opts)
    }
}

impl<B: Blob> Image<B> {
    /// Opens an image over `blob`, loading all metadata and rebuilding the
    /// volatile state: zone table, current zones, index, and the scan of
    /// the current Z-zone.
    pub fn open(blob: B, opts: &OpenOpts) -> Result<Image<B>> {
        let mut hbuf = [0u8; HEADER_SIZE];
        blob.pread(0, &mut hbuf)?;
        let header = ImageHeader::decode(&hbuf)?;
        let geo = Geometry::new(&header);
        debug!(
            "open: capacity={} block_size={} nr_l1={} zone_size={} nr_zones={} \
             pa_zi={:#x} pa_l1={:#x} pa_zones={:#x} init={:?}",
            geo.capacity,
            geo.block_size,
            geo.nr_l1,
            geo.zone_size,
            geo.nr_zones,
            geo.pa_zi,
            geo.pa_l1,
            geo.pa_zones,
            geo.init
        );

        let zones = ZoneTable::load(&blob, geo, opts.read_only, opts.write_cache)?;
        zones.pick(&blob, ZoneClass::L)?;
        zones.pick(&blob, ZoneClass::N)?;
        let index = Index::load(&blob, &zones, geo)?;

        let image = Image {
            header,
            geo,
            blob,
            zones,
            index,
            read_only: opts.read_only,
            nr_write_data_z: AtomicU64::new(0),
            nr_write_data_n: AtomicU64::new(0),
        };
        image.pick_and_scan_zzone()?;

        let census = image.mapping_census();
        debug!(
            "open: {} Z mappings, {} N mappings, {} other",
            census.z, census.n, census.other
        );
        Ok(image)
    }

    // -- accessors -----------------------------------------------------------

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn capacity(&self) -> u64 {
        self.geo.capacity
    }

    pub fn block_size(&self) -> u64 {
        self.geo.block_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// VA→PA lookup; 0 means unmapped.
    pub fn translate(&self, va: u64) -> u64 {
        self.index.translate(va)
    }

    /// Class of the zone containing `pa`.
    pub fn zone_class_of(&self, pa: u64) -> Result<ZoneClass> {
        self.zones.class_of_pa(pa)
    }

    /// Bytes of real storage consumed by the backing blob.
    pub fn allocated_size(&self) -> Result<u64> {
        Ok(self.blob.allocated_size()?)
    }

    pub fn write_stats(&self) -> WriteStats {
        let (l1, l2) = self.index.nr_writes();
        WriteStats {
            data_z: self.nr_write_data_z.load(Ordering::Relaxed),
            data_n: self.nr_write_data_n.load(Ordering::Relaxed),
            zone: self.zones.nr_writes(),
            l1,
            l2,
        }
    }

    /// Walks every block of the device and counts mappings by zone class.
    pub fn mapping_census(&self) -> MappingCensus {
        let mut census = MappingCensus::default();
        let mut va = 0;
        while va < self.geo.capacity {
            let pa = self.index.translate(va);
            if pa != 0 {
                match self.zones.class_of_pa(pa) {
                    Ok(ZoneClass::Z) => census.z += 1,
                    Ok(ZoneClass::N) => census.n += 1,
                    _ => census.other += 1,
                }
            }
            va += self.geo.block_size;
        }
        census
    }

    // -- open-time recovery --------------------------------------------------

    /// Selects the current Z-zone: claims the first unused slot, unless a
    /// Z-zone with an unsynced (zero) counter is found first, in which case
    /// its live contents are rediscovered by scanning. Z-zones with a
    /// non-zero counter must be sealed (full).
    fn pick_and_scan_zzone(&self) -> Result<()> {
        let mut found = false;
        for id in 0..self.geo.nr_zones {
            match self.zones.entry(id).class() {
                ZoneClass::Unused => {
                    self.zones.claim(&self.blob, ZoneClass::Z)?;
                    found = true;
                    break;
                }
                ZoneClass::Z => {
                    let next = self.zones.entry(id).next() as u64;
                    if next == 0 {
                        self.zones.adopt(ZoneClass::Z, id);
                        self.scan_zzone(id)?;
                        found = true;
                        if (self.zones.entry(id).next() as u64) != self.geo.nr_zone_unit {
                            break;
                        }
                        // Scanned full; keep looking for a growable zone.
                    } else if next != self.geo.nr_zone_unit {
                        return Err(ZbdError::Corrupt(format!(
                            "z-zone {} counter {} is neither 0 nor full",
                            id, next
                        )));
                    }
                }
                _ => {}
            }
        }
        if !found {
            return Err(ZbdError::NoFreeZone);
        }
        Ok(())
    }

    /// Rebuilds the in-memory allocation counter and the soft mappings of
    /// one Z-zone by decoding unit heads until the first hole.
    fn scan_zzone(&self, id: u64) -> Result<()> {
        debug_assert_eq!(self.zones.entry(id).next(), 0);
        let mut head = vec![0u8; PAGE_SIZE as usize];
        let mut installed = 0u64;
        for unit in 0..self.geo.nr_zone_unit {
            let pa = self.zones.zone_base(id) + unit * self.geo.block_size;
            self.blob.pread(pa, &mut head)?;
            let dec = match zpage::decode(&head)? {
                Some(d) => d,
                // Units are written sequentially; the first undecodable
                // head is the high watermark.
                None => break,
            };
            self.zones.entry(id).set_next(unit as u32 + 1);

            let va = dec.va;
            if va >= self.geo.capacity || va % self.geo.block_size != 0 {
                return Err(ZbdError::Corrupt(format!(
                    "z-zone {} unit {} names invalid va {:#x}",
                    id, unit, va
                )));
            }
            let current = self.index.translate(va);
            if current == 0 {
                let _guard = self.index.shard(va).lock().unwrap();
                self.index.map(&self.blob, &self.zones, va, pa, false)?;
                installed += 1;
            } else if current != pa {
                // The block was later rewritten raw; the durable index wins
                // and this slot is dead until a compactor exists.
                if self.zones.class_of_pa(current)? != ZoneClass::N {
                    return Err(ZbdError::Corrupt(format!(
                        "z-zone {} unit {} shadows va {:#x} mapped to {:#x}",
                        id, unit, va, current
                    )));
                }
            }
        }
        debug!(
            "scanned z-zone {}: {} of {} units populated, {} mappings installed",
            id,
            self.zones.entry(id).next(),
            self.geo.nr_zone_unit,
            installed
        );
        Ok(())
    }

    // -- data path -----------------------------------------------------------

    /// Reads one whole block at `va` into `buf`, decompressing the head
    /// page of Z-stored blocks transparently. Unmapped blocks read as
    /// zeros; a Z head with no valid data zeroes the whole block.
    pub fn read_block(&self, va: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, self.geo.block_size);
        debug_assert_eq!(va % self.geo.block_size, 0);
        debug_assert!(va < self.geo.capacity);

        let pa = self.index.translate(va);
        if pa == 0 {
            buf.fill(0);
            return Ok(());
        }
        self.blob.pread(pa, buf)?;
        if self.zones.class_of_pa(pa)? == ZoneClass::Z {
            let mut head_page = [0u8; PAGE_SIZE as usize];
            head_page.copy_from_slice(&buf[..PAGE_SIZE as usize]);
            match zpage::decode(&head_page)? {
                Some(dec) => buf[..PAGE_SIZE as usize].copy_from_slice(&dec.data),
                None => buf.fill(0),
            }
        }
        Ok(())
    }

    /// Writes one whole block at `va`.
    ///
    /// Unmapped blocks are allocated: compressible ones into the Z-zone
    /// with a soft mapping (the scan recovers it), incompressible ones into
    /// the N-zone with a durable mapping. Z-mapped blocks are overwritten
    /// in place while they stay compressible and fall back to a fresh N
    /// allocation when they stop; N-mapped blocks are overwritten in place.
    pub fn write_block(&self, va: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, self.geo.block_size);
        debug_assert_eq!(va % self.geo.block_size, 0);
        debug_assert!(va < self.geo.capacity);
        let bs = self.geo.block_size as usize;
        let page = PAGE_SIZE as usize;

        let shard = self.index.shard(va).lock().unwrap();
        let pa = self.index.translate(va);

        if pa == 0 {
            let mut zbuf = vec![0u8; bs];
            if zpage::encode(buf, va, &mut zbuf[..page]) {
                zbuf[page..].copy_from_slice(&buf[page..]);
                let new_pa = self.zones.alloc_data(&self.blob, ZoneClass::Z)?;
                self.blob.pwrite(new_pa, &zbuf)?;
                self.nr_write_data_z.fetch_add(1, Ordering::Relaxed);
                self.index.map(&self.blob, &self.zones, va, new_pa, false)?;
            } else {
                self.write_alloc_n(va, buf)?;
            }
            drop(shard);
            return Ok(());
        }

        match self.zones.class_of_pa(pa)? {
            ZoneClass::Z => {
                let mut zbuf = vec![0u8; page];
                if zpage::encode(buf, va, &mut zbuf) {
                    // In place: the PA keeps naming the same VA and the head
                    // carries it, so no metadata changes.
                    drop(shard);
                    self.blob.pwrite(pa, &zbuf)?;
                    if bs > page {
                        self.blob.pwrite(pa + PAGE_SIZE, &buf[page..])?;
                    }
                    self.nr_write_data_z.fetch_add(1, Ordering::Relaxed);
                } else {
                    // No longer compressible; the old Z slot leaks until a
                    // compactor exists.
                    self.write_alloc_n(va, buf)?;
                    drop(shard);
                }
            }
            ZoneClass::N => {
                drop(shard);
                self.blob.pwrite(pa, buf)?;
                self.nr_write_data_n.fetch_add(1, Ordering::Relaxed);
            }
            class @ (ZoneClass::Unused | ZoneClass::L) => {
                return Err(ZbdError::Corrupt(format!(
                    "va {:#x} maps into a {:?} zone at {:#x}",
                    va, class, pa
                )));
            }
        }
        Ok(())
    }

    /// Allocates an N slot for `va`, writes the raw block, and installs the
    /// mapping durably. Caller holds `va`'s shard lock.
    fn write_alloc_n(&self, va: u64, buf: &[u8]) -> Result<()> {
        let new_pa = self.zones.alloc_data(&self.blob, ZoneClass::N)?;
        self.blob.pwrite(new_pa, buf)?;
        self.nr_write_data_n.fetch_add(1, Ordering::Relaxed);
        self.index.map(&self.blob, &self.zones, va, new_pa, true)
    }

    /// Writes `buf` at byte offset `va`, which may start mid-block but must
    /// stay within a single block.
    ///
    /// Unmapped blocks take the zero-fill fast path; writes touching the
    /// head page go through read-modify-write; writes strictly past the
    /// head page land raw in place, which is sound because bytes past the
    /// first 4 KiB are stored raw in every zone class.
    pub fn write_partial(&self, va: u64, buf: &[u8]) -> Result<()> {
        let va_block = self.geo.block_align_down(va);
        let off = (va - va_block) as usize;
        debug_assert!((off + buf.len()) as u64 <= self.geo.block_size);

        let pa = self.index.translate(va_block);
        if pa == 0 {
            let mut page = vec![0u8; self.geo.block_size as usize];
            page[off..off + buf.len()].copy_from_slice(buf);
            return self.write_block(va_block, &page);
        }
        if off < PAGE_SIZE as usize {
            let mut page = vec![0u8; self.geo.block_size as usize];
            self.read_block(va_block, &mut page)?;
            page[off..off + buf.len()].copy_from_slice(buf);
            return self.write_block(va_block, &page);
        }
        self.blob.pwrite(pa + off as u64, buf)?;
        Ok(())
    }
}

impl<B: Blob> Drop for Image<B> {
    fn drop(&mut self) {
        let s = self.write_stats();
        debug!(
            "close: W_Z {} W_N {} W_ZONE {} W_L1 {} W_L2 {}",
            s.data_z, s.data_n, s.zone, s.l1, s.l2
        );
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
