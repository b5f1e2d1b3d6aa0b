//! Zone table and allocator.
//!
//! The data region of an image is an array of fixed-size zones. Each zone
//! is dedicated to one class for its whole life:
//!
//! - **Z** — compressed blocks. The allocation counter is *not* persisted;
//!   a Z-zone's on-disk counter is either 0 (rediscovered by scanning at
//!   open) or full (sealed).
//! - **N** — raw blocks. The counter is persisted on every allocation, so
//!   an index entry can never reference an N slot the counter does not
//!   cover.
//! - **L** — L2 index pages. The counter is persisted on every allocation.
//!
//! One mutex serializes all allocator state changes (current-zone cursors
//! and counters). Zone classes are read lock-free on the data path: an
//! entry is a single atomic word and a class transitions away from
//! `Unused` exactly once.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::blob::Blob;
use crate::error::{Result, ZbdError};
use crate::layout::{Geometry, Init, PAGE_SIZE, ZONE_INFO_SIZE};

// ---------------------------------------------------------------------------
// Zone class and packed entry
// ---------------------------------------------------------------------------

/// The three zone classes, plus the unclaimed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneClass {
    Unused = 0,
    /// Compressed data blocks.
    Z = 1,
    /// Raw data blocks.
    N = 2,
    /// L2 index pages.
    L = 3,
}

impl ZoneClass {
    fn from_bits(bits: u32) -> ZoneClass {
        match bits & 0b11 {
            0 => ZoneClass::Unused,
            1 => ZoneClass::Z,
            2 => ZoneClass::N,
            _ => ZoneClass::L,
        }
    }
}

/// One packed zone-info entry: `next` in the low 30 bits, the class in the
/// top 2. Stored on disk as a little-endian u32 at `pa_zi + 4 * id`.
pub struct ZoneInfo(AtomicU32);

const NEXT_MASK: u32 = (1 << 30) - 1;

impl ZoneInfo {
    fn from_raw(raw: u32) -> ZoneInfo {
        ZoneInfo(AtomicU32::new(raw))
    }

    fn raw(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Class of the zone. Lock-free; safe because the class changes at most
    /// once (claim) and PAs are only handed out after the claim is stored.
    pub fn class(&self) -> ZoneClass {
        ZoneClass::from_bits(self.raw() >> 30)
    }

    /// Next unallocated unit within the zone.
    pub fn next(&self) -> u32 {
        self.raw() & NEXT_MASK
    }

    fn set(&self, class: ZoneClass, next: u32) {
        debug_assert_eq!(next & !NEXT_MASK, 0);
        self.0
            .store(((class as u32) << 30) | (next & NEXT_MASK), Ordering::Release);
    }

    /// Advances the counter, preserving the class. Callers hold the
    /// allocator mutex (or are the single-threaded open scan).
    pub(crate) fn set_next(&self, next: u32) {
        self.set(self.class(), next);
    }
}

// ---------------------------------------------------------------------------
// Zone table
// ---------------------------------------------------------------------------

/// The allocator's per-class current-zone ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cursors {
    pub z: u64,
    pub n: u64,
    pub l: u64,
}

impl Cursors {
    fn of(&mut self, class: ZoneClass) -> &mut u64 {
        match class {
            ZoneClass::Z => &mut self.z,
            ZoneClass::N => &mut self.n,
            ZoneClass::L => &mut self.l,
            ZoneClass::Unused => unreachable!("unused zones have no cursor"),
        }
    }
}

/// In-memory zone table plus allocator state.
pub struct ZoneTable {
    geo: Geometry,
    entries: Box<[ZoneInfo]>,
    cursors: Mutex<Cursors>,
    read_only: bool,
    write_cache: bool,
    nr_sync: AtomicU64,
}

impl ZoneTable {
    /// Loads the zone-info array from the image.
    pub fn load<B: Blob>(
        blob: &B,
        geo: Geometry,
        read_only: bool,
        write_cache: bool,
    ) -> Result<ZoneTable> {
        let mut raw = vec![0u8; (geo.nr_zones * ZONE_INFO_SIZE) as usize];
        blob.pread(geo.pa_zi, &mut raw)?;
        let entries: Box<[ZoneInfo]> = raw
            .chunks_exact(ZONE_INFO_SIZE as usize)
            .map(|c| ZoneInfo::from_raw(u32::from_le_bytes(c.try_into().unwrap())))
            .collect();
        Ok(ZoneTable {
            geo,
            entries,
            cursors: Mutex::new(Cursors::default()),
            read_only,
            write_cache,
            nr_sync: AtomicU64::new(0),
        })
    }

    pub fn entry(&self, id: u64) -> &ZoneInfo {
        &self.entries[id as usize]
    }

    /// Byte offset of the start of zone `id`.
    pub fn zone_base(&self, id: u64) -> u64 {
        self.geo.pa_zones + id * self.geo.zone_size
    }

    /// Zone id containing `pa`, which must lie in the data region.
    pub fn zone_of_pa(&self, pa: u64) -> Result<u64> {
        if pa < self.geo.pa_zones {
            return Err(ZbdError::Corrupt(format!(
                "pa {:#x} below the zone region",
                pa
            )));
        }
        let id = (pa - self.geo.pa_zones) / self.geo.zone_size;
        if id >= self.geo.nr_zones {
            return Err(ZbdError::Corrupt(format!(
                "pa {:#x} beyond the zone region",
                pa
            )));
        }
        Ok(id)
    }

    /// Class of the zone containing `pa`.
    pub fn class_of_pa(&self, pa: u64) -> Result<ZoneClass> {
        Ok(self.entry(self.zone_of_pa(pa)?).class())
    }

    /// Lifetime count of zone-info writes.
    pub fn nr_writes(&self) -> u64 {
        self.nr_sync.load(Ordering::Relaxed)
    }

    /// Snapshot of the current-zone cursors.
    pub fn cursors(&self) -> Cursors {
        *self.cursors.lock().unwrap()
    }

    // -- persistence ---------------------------------------------------------

    /// Writes the entry for zone `id` back to the image; flushes when asked
    /// and the write cache is enabled. A no-op on read-only images.
    fn sync_zone<B: Blob>(&self, blob: &B, id: u64, flush: bool) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let pa = self.geo.pa_zi + ZONE_INFO_SIZE * id;
        blob.pwrite(pa, &self.entry(id).raw().to_le_bytes())?;
        self.nr_sync.fetch_add(1, Ordering::Relaxed);
        if flush && self.write_cache {
            blob.flush()?;
        }
        Ok(())
    }

    /// Claims zone `id` for `class` and persists the entry.
    fn mark_zone<B: Blob>(&self, blob: &B, id: u64, class: ZoneClass) -> Result<()> {
        self.entry(id).set(class, 0);
        self.sync_zone(blob, id, false)
    }

    /// Initializes the data region of a freshly claimed zone according to
    /// the image's init policy.
    fn init_zone<B: Blob>(&self, blob: &B, id: u64) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let pa = self.zone_base(id);
        match self.geo.init {
            Init::None => {}
            Init::Zero => {
                blob.write_zeroes(pa, self.geo.zone_size)?;
                blob.flush()?;
            }
            Init::Trim => blob.discard(pa, self.geo.zone_size)?,
        }
        Ok(())
    }

    // -- allocation ----------------------------------------------------------

    fn unit_limit(&self, class: ZoneClass) -> u64 {
        match class {
            ZoneClass::L => self.geo.nr_zone_page,
            _ => self.geo.nr_zone_unit,
        }
    }

    /// Claims the first unused zone at or after the class's cursor.
    /// Caller holds the cursor mutex.
    fn claim_locked<B: Blob>(
        &self,
        blob: &B,
        class: ZoneClass,
        cur: &mut Cursors,
    ) -> Result<u64> {
        let start = *cur.of(class);
        for id in start..self.geo.nr_zones {
            if self.entry(id).class() == ZoneClass::Unused {
                self.mark_zone(blob, id, class)?;
                *cur.of(class) = id;
                self.init_zone(blob, id)?;
                debug!("claimed zone {} as {:?}", id, class);
                return Ok(id);
            }
        }
        Err(ZbdError::NoFreeZone)
    }

    /// Claims a fresh zone for `class`, scanning from the class cursor.
    pub fn claim<B: Blob>(&self, blob: &B, class: ZoneClass) -> Result<u64> {
        let mut cur = self.cursors.lock().unwrap();
        self.claim_locked(blob, class, &mut cur)
    }

    /// Points the class cursor at `id` without claiming.
    pub fn adopt(&self, class: ZoneClass, id: u64) {
        *self.cursors.lock().unwrap().of(class) = id;
    }

    /// Allocates one data block in the current zone of `class` (Z or N),
    /// claiming a new zone when the current one is full. Returns the PA of
    /// the block.
    ///
    /// N allocations persist the advanced counter before returning; Z
    /// allocations leave the on-disk counter at 0 for the open-time scan.
    pub fn alloc_data<B: Blob>(&self, blob: &B, class: ZoneClass) -> Result<u64> {
        debug_assert!(matches!(class, ZoneClass::Z | ZoneClass::N));
        let mut cur = self.cursors.lock().unwrap();
        let mut id = *cur.of(class);
        if self.entry(id).next() as u64 == self.geo.nr_zone_unit {
            id = self.claim_locked(blob, class, &mut cur)?;
        }
        let unit = self.entry(id).next();
        self.entry(id).set_next(unit + 1);
        if class == ZoneClass::N {
            self.sync_zone(blob, id, false)?;
        }
        drop(cur);
        Ok(self.zone_base(id) + unit as u64 * self.geo.block_size)
    }

    /// Allocates one 4 KiB L2 page slot in the current L-zone, persisting
    /// the counter.
    pub fn alloc_l2<B: Blob>(&self, blob: &B) -> Result<u64> {
        let mut cur = self.cursors.lock().unwrap();
        let mut id = cur.l;
        if self.entry(id).next() as u64 == self.geo.nr_zone_page {
            id = self.claim_locked(blob, ZoneClass::L, &mut cur)?;
        }
        let unit = self.entry(id).next();
        self.entry(id).set_next(unit + 1);
        self.sync_zone(blob, id, false)?;
        drop(cur);
        Ok(self.zone_base(id) + unit as u64 * PAGE_SIZE)
    }

    // -- open-time selection -------------------------------------------------

    /// Selects the current zone for N or L at open: the first unused slot
    /// is claimed, unless a partially filled zone of the class is found
    /// first, which is adopted as-is.
    pub fn pick<B: Blob>(&self, blob: &B, class: ZoneClass) -> Result<()> {
        debug_assert!(matches!(class, ZoneClass::N | ZoneClass::L));
        let limit = self.unit_limit(class);
        let mut cur = self.cursors.lock().unwrap();
        for id in 0..self.geo.nr_zones {
            let c = self.entry(id).class();
            if c == ZoneClass::Unused {
                self.mark_zone(blob, id, class)?;
                *cur.of(class) = id;
                self.init_zone(blob, id)?;
                debug!("claimed zone {} as current {:?}", id, class);
                return Ok(());
            }
            if c == class && (self.entry(id).next() as u64) < limit {
                *cur.of(class) = id;
                debug!("adopted zone {} as current {:?}", id, class);
                return Ok(());
            }
        }
        Err(ZbdError::NoFreeZone)
    }

    /// PA of the next L2 allocation in the current L-zone. Any stored L2
    /// pointer at or beyond this address is from an unfinished session.
    pub fn next_pa_l(&self) -> u64 {
        let cur = self.cursors.lock().unwrap();
        self.zone_base(cur.l) + self.entry(cur.l).next() as u64 * PAGE_SIZE
    }

    /// PA of the next data allocation in the current N-zone. Any stored
    /// data pointer at or beyond this address is from an unfinished session.
    pub fn next_pa_n(&self) -> u64 {
        let cur = self.cursors.lock().unwrap();
        self.zone_base(cur.n) + self.entry(cur.n).next() as u64 * self.geo.block_size
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemBlob;
    use crate::layout::{Geometry, ImageHeader};
    use crate::opts::CreateOpts;

    // 4 MiB device, 4 KiB blocks, 1 MiB zones: 9 zone slots, 256 units each.
    fn geometry() -> Geometry {
        let mut o = CreateOpts::new(4 << 20);
        o.zone_size = 1 << 20;
        Geometry::new(&ImageHeader::compute(&o).unwrap())
    }

    fn table(blob: &MemBlob) -> ZoneTable {
        ZoneTable::load(blob, geometry(), false, true).unwrap()
    }

    fn entry_on_disk(blob: &MemBlob, geo: &Geometry, id: u64) -> (ZoneClass, u32) {
        let mut raw = [0u8; 4];
        blob.pread(geo.pa_zi + 4 * id, &mut raw).unwrap();
        let v = u32::from_le_bytes(raw);
        (ZoneClass::from_bits(v >> 30), v & NEXT_MASK)
    }

    #[test]
    fn zone_info_packing() {
        let e = ZoneInfo::from_raw(0);
        assert_eq!(e.class(), ZoneClass::Unused);
        assert_eq!(e.next(), 0);

        e.set(ZoneClass::N, 7);
        assert_eq!(e.class(), ZoneClass::N);
        assert_eq!(e.next(), 7);
        assert_eq!(e.raw(), (2 << 30) | 7);

        e.set_next(8);
        assert_eq!(e.class(), ZoneClass::N);
        assert_eq!(e.next(), 8);
    }

    #[test]
    fn pick_claims_first_unused_and_persists() {
        let blob = MemBlob::new();
        let zt = table(&blob);
        zt.pick(&blob, ZoneClass::L).unwrap();
        assert_eq!(zt.cursors().l, 0);
        assert_eq!(zt.entry(0).class(), ZoneClass::L);
        assert_eq!(entry_on_disk(&blob, &geometry(), 0), (ZoneClass::L, 0));

        zt.pick(&blob, ZoneClass::N).unwrap();
        assert_eq!(zt.cursors().n, 1);
        assert_eq!(entry_on_disk(&blob, &geometry(), 1), (ZoneClass::N, 0));
    }

    #[test]
    fn pick_adopts_partial_zone() {
        let blob = MemBlob::new();
        let zt = table(&blob);
        // Fabricate a half-used N zone at slot 0.
        zt.entry(0).set(ZoneClass::N, 3);
        zt.pick(&blob, ZoneClass::N).unwrap();
        assert_eq!(zt.cursors().n, 0);
        // Adopted, not re-claimed: counter untouched.
        assert_eq!(zt.entry(0).next(), 3);
    }

    #[test]
    fn pick_skips_full_zone_of_class() {
        let blob = MemBlob::new();
        let zt = table(&blob);
        let geo = geometry();
        zt.entry(0).set(ZoneClass::N, geo.nr_zone_unit as u32);
        zt.pick(&blob, ZoneClass::N).unwrap();
        assert_eq!(zt.cursors().n, 1);
        assert_eq!(zt.entry(1).class(), ZoneClass::N);
    }

    #[test]
    fn alloc_n_persists_counter() {
        let blob = MemBlob::new();
        let zt = table(&blob);
        let geo = geometry();
        zt.pick(&blob, ZoneClass::N).unwrap();

        let pa0 = zt.alloc_data(&blob, ZoneClass::N).unwrap();
        let pa1 = zt.alloc_data(&blob, ZoneClass::N).unwrap();
        assert_eq!(pa0, geo.pa_zones);
        assert_eq!(pa1, geo.pa_zones + geo.block_size);
        assert_eq!(entry_on_disk(&blob, &geo, 0), (ZoneClass::N, 2));
        assert_eq!(zt.next_pa_n(), geo.pa_zones + 2 * geo.block_size);
    }

    #[test]
    fn alloc_z_keeps_on_disk_counter_at_zero() {
        let blob = MemBlob::new();
        let zt = table(&blob);
        let geo = geometry();
        zt.adopt(ZoneClass::Z, 0);
        zt.claim(&blob, ZoneClass::Z).unwrap();

        let pa0 = zt.alloc_data(&blob, ZoneClass::Z).unwrap();
        let pa1 = zt.alloc_data(&blob, ZoneClass::Z).unwrap();
        assert_eq!(pa0, geo.pa_zones);
        assert_eq!(pa1, geo.pa_zones + geo.block_size);
        // In memory the counter advanced, on disk it stayed 0.
        assert_eq!(zt.entry(0).next(), 2);
        assert_eq!(entry_on_disk(&blob, &geo, 0), (ZoneClass::Z, 0));
    }

    #[test]
    fn alloc_rolls_over_to_new_zone_when_full() {
        let blob = MemBlob::new();
        let zt = table(&blob);
        let geo = geometry();
        zt.pick(&blob, ZoneClass::N).unwrap();
        zt.entry(0).set(ZoneClass::N, geo.nr_zone_unit as u32);

        let pa = zt.alloc_data(&blob, ZoneClass::N).unwrap();
        assert_eq!(zt.cursors().n, 1);
        assert_eq!(pa, zt.zone_base(1));
    }

    #[test]
    fn alloc_l2_uses_page_units() {
        let blob = MemBlob::new();
        let zt = table(&blob);
        let geo = geometry();
        zt.pick(&blob, ZoneClass::L).unwrap();

        let pa0 = zt.alloc_l2(&blob).unwrap();
        let pa1 = zt.alloc_l2(&blob).unwrap();
        assert_eq!(pa0, geo.pa_zones);
        assert_eq!(pa1, geo.pa_zones + PAGE_SIZE);
        assert_eq!(entry_on_disk(&blob, &geo, 0), (ZoneClass::L, 2));
        assert_eq!(zt.next_pa_l(), geo.pa_zones + 2 * PAGE_SIZE);
    }

    #[test]
    fn exhaustion_is_fatal() {
        let blob = MemBlob::new();
        let zt = table(&blob);
        let geo = geometry();
        for id in 0..geo.nr_zones {
            zt.entry(id).set(ZoneClass::Z, geo.nr_zone_unit as u32);
        }
        assert!(matches!(
            zt.claim(&blob, ZoneClass::N),
            Err(ZbdError::NoFreeZone)
        ));
        assert!(matches!(
            zt.pick(&blob, ZoneClass::N),
            Err(ZbdError::NoFreeZone)
        ));
    }

    #[test]
    fn class_of_pa_bounds() {
        let blob = MemBlob::new();
        let zt = table(&blob);
        let geo = geometry();
        zt.entry(2).set(ZoneClass::Z, 0);
        assert_eq!(
            zt.class_of_pa(zt.zone_base(2) + geo.block_size).unwrap(),
            ZoneClass::Z
        );
        assert!(zt.class_of_pa(0).is_err());
        assert!(zt
            .class_of_pa(geo.pa_zones + geo.nr_zones * geo.zone_size)
            .is_err());
    }

    #[test]
    fn read_only_skips_persistence() {
        let blob = MemBlob::new();
        let zt = ZoneTable::load(&blob, geometry(), true, true).unwrap();
        zt.pick(&blob, ZoneClass::N).unwrap();
        // The in-memory claim happened, but nothing hit the blob.
        assert_eq!(zt.entry(0).class(), ZoneClass::N);
        assert_eq!(blob.len(), 0);
        assert_eq!(zt.nr_writes(), 0);
    }
}
