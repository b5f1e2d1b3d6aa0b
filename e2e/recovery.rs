//! E2E suite: open-time recovery.
//!
//! Simulates crashes by dropping the engine (losing all volatile state —
//! the in-memory index, zone cursors, and the unsynced Z-zone counter)
//! while keeping the backing file, then re-opens and checks that the
//! Z-zone scan and the durable-index rules reconstruct exactly the
//! mappings the persistence protocol promises.

use tempfile::TempDir;

use zbd::opts::{CreateOpts, OpenOpts};
use zbd::{create_file, Device, FileBlob, Image, ZoneClass};

fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn create_disk(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("disk.zbd");
    create_file(&path, &CreateOpts::new(64 << 20)).unwrap();
    path
}

fn open_rw(path: &std::path::Path) -> Device<FileBlob> {
    let blob = FileBlob::open(path, false).unwrap();
    Device::open(blob, &OpenOpts::default()).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Crash recovery of soft-mapped compressed blocks
// ─────────────────────────────────────────────────────────────────────────────

/// Three compressible blocks whose mappings were never persisted must be
/// rediscovered by the Z-zone scan, at their original physical addresses.
#[test]
fn z_mappings_survive_crash_via_scan() {
    let dir = TempDir::new().unwrap();
    let path = create_disk(&dir);

    let b = 4096u64; // block_size
    let fills = [0x41u8, 0x42, 0x43];
    let mut pas = Vec::new();
    {
        let dev = open_rw(&path);
        for (i, fill) in fills.iter().enumerate() {
            dev.write(i as u64 * 8, 8, &[&vec![*fill; 4096][..]]).unwrap();
        }
        for i in 0..3u64 {
            let pa = dev.image().translate(i * b);
            assert_eq!(dev.image().zone_class_of(pa).unwrap(), ZoneClass::Z);
            pas.push(pa);
        }
        // Drop without any orderly shutdown: the crash.
    }

    let dev = open_rw(&path);
    for (i, fill) in fills.iter().enumerate() {
        let mut back = vec![0u8; 4096];
        dev.read(i as u64 * 8, 8, &mut [&mut back[..]]).unwrap();
        assert_eq!(back, vec![*fill; 4096], "block {} lost after crash", i);
    }
    for i in 0..3u64 {
        assert_eq!(
            dev.image().translate(i * b),
            pas[i as usize],
            "block {} moved after crash",
            i
        );
    }
}

/// Raw blocks are durably indexed before being acknowledged, so they too
/// survive a crash — through the index, not the scan.
#[test]
fn n_mappings_survive_crash_via_durable_index() {
    let dir = TempDir::new().unwrap();
    let path = create_disk(&dir);

    let random = noise(4096, 0xfeed);
    let pa;
    {
        let dev = open_rw(&path);
        dev.write(0, 8, &[&random[..]]).unwrap();
        pa = dev.image().translate(0);
        assert_eq!(dev.image().zone_class_of(pa).unwrap(), ZoneClass::N);
    }

    let dev = open_rw(&path);
    assert_eq!(dev.image().translate(0), pa);
    let mut back = vec![0u8; 4096];
    dev.read(0, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, random);
}

/// A mixed workload: compressed and raw blocks interleaved, a compressed
/// block superseded by a raw rewrite, holes in between. Everything the
/// protocol promises must come back.
#[test]
fn mixed_workload_recovers() {
    let dir = TempDir::new().unwrap();
    let path = create_disk(&dir);

    let raw_a = noise(4096, 0xa);
    let raw_b = noise(4096, 0xb);
    {
        let dev = open_rw(&path);
        dev.write(0, 8, &[&vec![0x11u8; 4096][..]]).unwrap(); // Z
        dev.write(8, 8, &[&raw_a[..]]).unwrap(); // N
        dev.write(24, 8, &[&vec![0x22u8; 4096][..]]).unwrap(); // Z (sector 16 left as a hole)
        // Supersede the first compressed block with incompressible data:
        // its Z slot goes stale, the durable N mapping wins.
        dev.write(0, 8, &[&raw_b[..]]).unwrap();
    }

    let dev = open_rw(&path);
    let mut back = vec![0u8; 4096];

    dev.read(0, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, raw_b, "superseding raw rewrite must win over the stale Z slot");
    assert_eq!(
        dev.image().zone_class_of(dev.image().translate(0)).unwrap(),
        ZoneClass::N
    );

    dev.read(8, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, raw_a);

    dev.read(16, 8, &mut [&mut back[..]]).unwrap();
    assert!(back.iter().all(|&b| b == 0), "hole must stay a hole");

    dev.read(24, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, vec![0x22u8; 4096]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Idempotent re-open
// ─────────────────────────────────────────────────────────────────────────────

/// Open → close → open → close must converge: the second and third sessions
/// see identical translations for every written block.
#[test]
fn reopen_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = create_disk(&dir);

    let sectors: &[u64] = &[0, 8, 16, 800, 1600];
    {
        let dev = open_rw(&path);
        for (i, &s) in sectors.iter().enumerate() {
            dev.write(s, 8, &[&vec![i as u8 + 1; 4096][..]]).unwrap();
        }
    }

    let collect = |dev: &Device<FileBlob>| -> Vec<u64> {
        sectors.iter().map(|&s| dev.image().translate(s * 512)).collect()
    };

    let first = {
        let dev = open_rw(&path);
        collect(&dev)
    };
    let second = {
        let dev = open_rw(&path);
        collect(&dev)
    };
    assert_eq!(first, second);
    assert!(first.iter().all(|&pa| pa != 0));
}

/// Writing after a crash-recovery open continues allocating where the scan
/// left off instead of clobbering recovered blocks.
#[test]
fn post_recovery_writes_do_not_clobber() {
    let dir = TempDir::new().unwrap();
    let path = create_disk(&dir);

    {
        let dev = open_rw(&path);
        dev.write(0, 8, &[&vec![0x77u8; 4096][..]]).unwrap();
        dev.write(8, 8, &[&vec![0x78u8; 4096][..]]).unwrap();
    }

    {
        let dev = open_rw(&path);
        // New compressible allocation after recovery.
        dev.write(16, 8, &[&vec![0x79u8; 4096][..]]).unwrap();
        let pa0 = dev.image().translate(0);
        let pa1 = dev.image().translate(4096);
        let pa2 = dev.image().translate(8192);
        assert_ne!(pa2, 0);
        assert!(pa2 != pa0 && pa2 != pa1, "new allocation reused a live slot");
    }

    let dev = open_rw(&path);
    for (i, fill) in [0x77u8, 0x78, 0x79].iter().enumerate() {
        let mut back = vec![0u8; 4096];
        dev.read(i as u64 * 8, 8, &mut [&mut back[..]]).unwrap();
        assert_eq!(back, vec![*fill; 4096]);
    }
}

/// A read-only open of a recovered image sees the data but persists
/// nothing, and a later writable open still works.
#[test]
fn read_only_open_after_crash() {
    let dir = TempDir::new().unwrap();
    let path = create_disk(&dir);

    {
        let dev = open_rw(&path);
        dev.write(0, 8, &[&vec![0x55u8; 4096][..]]).unwrap();
    }
    let file_len_before = std::fs::metadata(&path).unwrap().len();

    {
        let image = Image::open_file(&path, &OpenOpts::read_only()).unwrap();
        let mut back = vec![0u8; 4096];
        image.read_block(0, &mut back).unwrap();
        assert_eq!(back, vec![0x55u8; 4096]);
        assert!(image.is_read_only());
    }
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        file_len_before,
        "read-only open must not grow the image"
    );

    let dev = open_rw(&path);
    let mut back = vec![0u8; 4096];
    dev.read(0, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, vec![0x55u8; 4096]);
}
