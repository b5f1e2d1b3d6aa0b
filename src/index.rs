//! Two-level VA→PA index.
//!
//! A virtual address decomposes into an L1 page index, a slot within that
//! L1 page, and a slot within the referenced L2 page (512 entries each):
//!
//! ```text
//! id_l1 = va >> (shift + 18)
//! id_l2 = (va >> (shift + 9)) & 0x1ff
//! id_pg = (va >> shift) & 0x1ff
//! ```
//!
//! All L1 pages live at a fixed location written at create time; L2 pages
//! are allocated on demand from L-zones. The whole index is held in memory
//! while the image is open. `translate` is lock-free: entries are atomic
//! words that only ever transition 0 → PA or PA → same PA, and an L2 page
//! is published through a `OnceLock` so a racing reader sees either nothing
//! (reads as unmapped) or a fully initialized page.
//!
//! Writers serialize per VA through 64 shard mutexes; L1/L2 persistence for
//! one node serializes through the node's write mutex. L2 pages are written
//! back before the L1 page that references them, so a crash either sees the
//! old L1 (old L2 referenced) or the new L1 (new L2 already on disk).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::blob::Blob;
use crate::error::{Result, ZbdError};
use crate::layout::{Geometry, FANOUT, PAGE_SIZE};
use crate::zone::{ZoneClass, ZoneTable};

/// Writer-exclusion shards; VAs hash by block number modulo this.
pub const SHARDS: usize = 64;

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

/// One in-memory L2 page: 512 atomic PA entries.
struct L2Page {
    entries: [AtomicU64; FANOUT],
}

impl L2Page {
    fn zeroed() -> Box<L2Page> {
        Box::new(L2Page {
            entries: std::array::from_fn(|_| AtomicU64::new(0)),
        })
    }

    fn from_bytes(buf: &[u8]) -> Box<L2Page> {
        Box::new(L2Page {
            entries: std::array::from_fn(|k| {
                AtomicU64::new(u64::from_le_bytes(
                    buf[k * 8..k * 8 + 8].try_into().unwrap(),
                ))
            }),
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE as usize];
        for (k, e) in self.entries.iter().enumerate() {
            buf[k * 8..k * 8 + 8].copy_from_slice(&e.load(Ordering::Acquire).to_le_bytes());
        }
        buf
    }
}

/// L1 page contents plus its dirty bit, guarded by the node write mutex.
struct L1State {
    entries: Box<[u64; FANOUT]>,
    dirty: bool,
}

fn l1_to_bytes(entries: &[u64; FANOUT]) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    for (j, e) in entries.iter().enumerate() {
        buf[j * 8..j * 8 + 8].copy_from_slice(&e.to_le_bytes());
    }
    buf
}

/// Per-L1 index node.
struct IndexNode {
    l1: Mutex<L1State>,
    l2_dirty: [AtomicBool; FANOUT],
    l2: [OnceLock<Box<L2Page>>; FANOUT],
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

pub struct Index {
    geo: Geometry,
    nodes: Box<[IndexNode]>,
    shards: Box<[Mutex<()>]>,
    nr_write_l1: AtomicU64,
    nr_write_l2: AtomicU64,
}

impl Index {
    /// Loads the full index, repairing entries left behind by an
    /// unfinished session:
    ///
    /// - an L1 entry at or beyond the current L-zone's next allocation was
    ///   never published (its parent L1 write never happened) and is
    ///   dropped;
    /// - a data entry pointing into the N region at or beyond the current
    ///   N-zone's next allocation references a slot whose counter was never
    ///   persisted and is dropped.
    pub fn load<B: Blob>(blob: &B, zones: &ZoneTable, geo: Geometry) -> Result<Index> {
        let next_pa_l = zones.next_pa_l();
        let next_pa_n = zones.next_pa_n();
        let mut nodes = Vec::with_capacity(geo.nr_l1 as usize);
        let mut buf = vec![0u8; PAGE_SIZE as usize];

        for i in 0..geo.nr_l1 {
            blob.pread(geo.pa_l1 + i * PAGE_SIZE, &mut buf)?;
            let mut entries: Box<[u64; FANOUT]> = Box::new(std::array::from_fn(|j| {
                u64::from_le_bytes(buf[j * 8..j * 8 + 8].try_into().unwrap())
            }));
            let l2: [OnceLock<Box<L2Page>>; FANOUT] = std::array::from_fn(|_| OnceLock::new());

            for j in 0..FANOUT {
                let pa_l2 = entries[j];
                if pa_l2 == 0 {
                    continue;
                }
                if pa_l2 >= next_pa_l {
                    // Allocated by a crashed session but never referenced by
                    // a persisted L1 write; the slot will be reallocated.
                    entries[j] = 0;
                    continue;
                }
                if zones.class_of_pa(pa_l2)? != ZoneClass::L {
                    return Err(ZbdError::Corrupt(format!(
                        "l1[{}][{}] points at {:#x}, not an L zone",
                        i, j, pa_l2
                    )));
                }
                let mut pbuf = vec![0u8; PAGE_SIZE as usize];
                blob.pread(pa_l2, &mut pbuf)?;
                let page = L2Page::from_bytes(&pbuf);
                for k in 0..FANOUT {
                    let pa = page.entries[k].load(Ordering::Relaxed);
                    if pa != 0
                        && zones.class_of_pa(pa)? == ZoneClass::N
                        && pa >= next_pa_n
                    {
                        // Stale write from before the crash; reads as zero.
                        page.entries[k].store(0, Ordering::Relaxed);
                    }
                }
                let _ = l2[j].set(page);
            }

            nodes.push(IndexNode {
                l1: Mutex::new(L1State {
                    entries,
                    dirty: false,
                }),
                l2_dirty: std::array::from_fn(|_| AtomicBool::new(false)),
                l2,
            });
        }

        Ok(Index {
            geo,
            nodes: nodes.into_boxed_slice(),
            shards: (0..SHARDS).map(|_| Mutex::new(())).collect(),
            nr_write_l1: AtomicU64::new(0),
            nr_write_l2: AtomicU64::new(0),
        })
    }

    #[inline]
    fn slot(&self, va: u64) -> (usize, usize, usize) {
        let s = self.geo.block_shift;
        (
            (va >> (s + 18)) as usize,
            ((va >> (s + 9)) & 0x1ff) as usize,
            ((va >> s) & 0x1ff) as usize,
        )
    }

    /// The writer-exclusion mutex for `va`'s shard.
    pub fn shard(&self, va: u64) -> &Mutex<()> {
        &self.shards[((va >> self.geo.block_shift) as usize) % SHARDS]
    }

    /// VA→PA lookup; 0 means unmapped. Lock-free.
    pub fn translate(&self, va: u64) -> u64 {
        debug_assert_eq!(va % self.geo.block_size, 0);
        let (id_l1, id_l2, id_pg) = self.slot(va);
        if id_l1 >= self.nodes.len() {
            return 0;
        }
        match self.nodes[id_l1].l2[id_l2].get() {
            Some(page) => {
                let pa = page.entries[id_pg].load(Ordering::Acquire);
                debug_assert_eq!(pa % PAGE_SIZE, 0);
                pa
            }
            None => 0,
        }
    }

    /// Installs `va → pa`, allocating the in-memory L2 page on first use.
    /// With `durable`, the dirty pages are written back before returning.
    ///
    /// The caller must hold `va`'s shard lock.
    pub fn map<B: Blob>(
        &self,
        blob: &B,
        zones: &ZoneTable,
        va: u64,
        pa: u64,
        durable: bool,
    ) -> Result<()> {
        debug_assert_eq!(va % self.geo.block_size, 0);
        debug_assert_eq!(pa % PAGE_SIZE, 0);
        let (id_l1, id_l2, id_pg) = self.slot(va);
        if id_l1 >= self.nodes.len() {
            return Err(ZbdError::Corrupt(format!(
                "va {:#x} beyond the indexed range",
                va
            )));
        }
        let node = &self.nodes[id_l1];
        let page = node.l2[id_l2].get_or_init(L2Page::zeroed);
        if page.entries[id_pg].load(Ordering::Acquire) != pa {
            page.entries[id_pg].store(pa, Ordering::Release);
            node.l2_dirty[id_l2].store(true, Ordering::Release);
        }
        if durable {
            self.write_id(blob, zones, id_l1, id_l2)?;
        }
        Ok(())
    }

    /// Writes back the dirty L2 page of `(id_l1, id_l2)` and then the L1
    /// page if it changed, allocating an L2 slot on first persistence.
    pub fn write_id<B: Blob>(
        &self,
        blob: &B,
        zones: &ZoneTable,
        id_l1: usize,
        id_l2: usize,
    ) -> Result<()> {
        let node = &self.nodes[id_l1];
        let mut l1 = node.l1.lock().unwrap();

        if node.l2_dirty[id_l2].load(Ordering::Acquire) {
            if l1.entries[id_l2] == 0 {
                l1.entries[id_l2] = zones.alloc_l2(blob)?;
                l1.dirty = true;
            }
            let pa_l2 = l1.entries[id_l2];
            if zones.class_of_pa(pa_l2)? != ZoneClass::L {
                return Err(ZbdError::Corrupt(format!(
                    "l2 slot {:#x} not in an L zone",
                    pa_l2
                )));
            }
            let page = node.l2[id_l2].get().ok_or_else(|| {
                ZbdError::Corrupt("dirty l2 slot with no in-memory page".into())
            })?;
            blob.pwrite(pa_l2, &page.to_bytes())?;
            self.nr_write_l2.fetch_add(1, Ordering::Relaxed);
            node.l2_dirty[id_l2].store(false, Ordering::Release);
        }

        if l1.dirty {
            let pa_l1 = self.geo.pa_l1 + id_l1 as u64 * PAGE_SIZE;
            blob.pwrite(pa_l1, &l1_to_bytes(&l1.entries))?;
            self.nr_write_l1.fetch_add(1, Ordering::Relaxed);
            l1.dirty = false;
        }
        Ok(())
    }

    /// Lifetime counts of (L1, L2) page writes.
    pub fn nr_writes(&self) -> (u64, u64) {
        (
            self.nr_write_l1.load(Ordering::Relaxed),
            self.nr_write_l2.load(Ordering::Relaxed),
        )
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
    use crate::zone::{ZoneClass, ZoneTable};

    fn geometry() -> Geometry {
        let mut o = CreateOpts::new(4 << 20);
        o.zone_size = 1 << 20;
        Geometry::new(&ImageHeader::compute(&o).unwrap())
    }

    /// Fresh blob + zone table with current L and N zones selected, the way
    /// open does it.
    fn setup() -> (MemBlob, ZoneTable, Geometry) {
        let blob = MemBlob::new();
        let geo = geometry();
        let zones = ZoneTable::load(&blob, geo, false, true).unwrap();
        zones.pick(&blob, ZoneClass::L).unwrap();
        zones.pick(&blob, ZoneClass::N).unwrap();
        (blob, zones, geo)
    }

    #[test]
    fn translate_unmapped_is_zero() {
        let (blob, zones, geo) = setup();
        let index = Index::load(&blob, &zones, geo).unwrap();
        assert_eq!(index.translate(0), 0);
        assert_eq!(index.translate(geo.capacity - geo.block_size), 0);
    }

    #[test]
    fn map_then_translate() {
        let (blob, zones, geo) = setup();
        let index = Index::load(&blob, &zones, geo).unwrap();
        let pa = geo.pa_zones + 3 * geo.block_size;
        index.map(&blob, &zones, geo.block_size, pa, false).unwrap();
        assert_eq!(index.translate(geo.block_size), pa);
        // Neighbours unaffected.
        assert_eq!(index.translate(0), 0);
        assert_eq!(index.translate(2 * geo.block_size), 0);
    }

    #[test]
    fn soft_map_touches_nothing_on_disk() {
        let (blob, zones, geo) = setup();
        let index = Index::load(&blob, &zones, geo).unwrap();
        let before = blob.len();
        index
            .map(&blob, &zones, 0, geo.pa_zones + geo.block_size, false)
            .unwrap();
        assert_eq!(blob.len(), before);
        assert_eq!(index.nr_writes(), (0, 0));
    }

    #[test]
    fn durable_map_allocates_l2_and_writes_both_levels() {
        let (blob, zones, geo) = setup();
        let index = Index::load(&blob, &zones, geo).unwrap();
        let pa = geo.pa_zones + geo.zone_size; // somewhere in zone 1 (N)
        index.map(&blob, &zones, 0, pa, true).unwrap();
        assert_eq!(index.nr_writes(), (1, 1));

        // L1 page on disk references an L2 page inside the L zone (zone 0).
        let mut l1 = vec![0u8; PAGE_SIZE as usize];
        blob.pread(geo.pa_l1, &mut l1).unwrap();
        let pa_l2 = u64::from_le_bytes(l1[0..8].try_into().unwrap());
        assert_eq!(zones.class_of_pa(pa_l2).unwrap(), ZoneClass::L);

        // The L2 page on disk carries the mapping.
        let mut l2 = vec![0u8; PAGE_SIZE as usize];
        blob.pread(pa_l2, &mut l2).unwrap();
        assert_eq!(u64::from_le_bytes(l2[0..8].try_into().unwrap()), pa);
    }

    #[test]
    fn second_durable_map_reuses_l2_slot() {
        let (blob, zones, geo) = setup();
        let index = Index::load(&blob, &zones, geo).unwrap();
        let pa_a = geo.pa_zones + geo.zone_size;
        let pa_b = pa_a + geo.block_size;
        index.map(&blob, &zones, 0, pa_a, true).unwrap();
        index.map(&blob, &zones, geo.block_size, pa_b, true).unwrap();
        // One L2 slot serves both VAs; the L1 write happened once.
        assert_eq!(index.nr_writes(), (1, 2));
        assert_eq!(zones.next_pa_l(), zones.zone_base(0) + PAGE_SIZE);
    }

    #[test]
    fn remap_same_pa_does_not_redirty() {
        let (blob, zones, geo) = setup();
        let index = Index::load(&blob, &zones, geo).unwrap();
        let pa = geo.pa_zones + geo.zone_size;
        index.map(&blob, &zones, 0, pa, true).unwrap();
        let writes = index.nr_writes();
        // Same mapping again, durable: nothing is dirty, nothing is written.
        index.map(&blob, &zones, 0, pa, true).unwrap();
        assert_eq!(index.nr_writes(), writes);
    }

    #[test]
    fn reload_preserves_durable_mappings() {
        let (blob, zones, geo) = setup();
        let pa = zones.alloc_data(&blob, ZoneClass::N).unwrap();
        {
            let index = Index::load(&blob, &zones, geo).unwrap();
            index.map(&blob, &zones, 7 * geo.block_size, pa, true).unwrap();
        }
        // New session: zone table and index reloaded from the blob.
        let zones2 = ZoneTable::load(&blob, geo, false, true).unwrap();
        zones2.pick(&blob, ZoneClass::L).unwrap();
        zones2.pick(&blob, ZoneClass::N).unwrap();
        let index2 = Index::load(&blob, &zones2, geo).unwrap();
        assert_eq!(index2.translate(7 * geo.block_size), pa);
    }

    #[test]
    fn load_drops_unpublished_l2_pointer() {
        let (blob, zones, geo) = setup();
        // Fabricate an L1 entry pointing at the *next* L allocation — the
        // signature of a crash between alloc_l2 and the L1 write landing.
        let stale = zones.next_pa_l();
        let mut l1 = vec![0u8; PAGE_SIZE as usize];
        l1[0..8].copy_from_slice(&stale.to_le_bytes());
        blob.pwrite(geo.pa_l1, &l1).unwrap();

        let index = Index::load(&blob, &zones, geo).unwrap();
        assert_eq!(index.translate(0), 0);
    }

    #[test]
    fn load_drops_stale_n_entries_and_keeps_covered_ones() {
        let (blob, zones, geo) = setup();
        let index = Index::load(&blob, &zones, geo).unwrap();

        // A durable mapping to the first N slot, properly allocated.
        let pa_good = zones.alloc_data(&blob, ZoneClass::N).unwrap();
        index.map(&blob, &zones, 0, pa_good, true).unwrap();

        // Hand-edit the on-disk L2 page: point a second VA at the N slot
        // the counter does not cover yet.
        let pa_stale = zones.next_pa_n();
        let mut l1 = vec![0u8; PAGE_SIZE as usize];
        blob.pread(geo.pa_l1, &mut l1).unwrap();
        let pa_l2 = u64::from_le_bytes(l1[0..8].try_into().unwrap());
        let mut l2 = vec![0u8; PAGE_SIZE as usize];
        blob.pread(pa_l2, &mut l2).unwrap();
        l2[8..16].copy_from_slice(&pa_stale.to_le_bytes());
        blob.pwrite(pa_l2, &l2).unwrap();

        // Reopen: the covered entry survives, the stale one reads as zero.
        let zones2 = ZoneTable::load(&blob, geo, false, true).unwrap();
        zones2.pick(&blob, ZoneClass::L).unwrap();
        zones2.pick(&blob, ZoneClass::N).unwrap();
        let index2 = Index::load(&blob, &zones2, geo).unwrap();
        assert_eq!(index2.translate(0), pa_good);
        assert_eq!(index2.translate(geo.block_size), 0);
    }

    #[test]
    fn shard_distribution() {
        let (blob, zones, geo) = setup();
        let index = Index::load(&blob, &zones, geo).unwrap();
        // Consecutive blocks land on consecutive shards and wrap at 64.
        let a = index.shard(0) as *const _;
        let b = index.shard(geo.block_size) as *const _;
        let wrap = index.shard(64 * geo.block_size) as *const _;
        assert_ne!(a, b);
        assert_eq!(a, wrap);
    }
}
