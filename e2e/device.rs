//! E2E suite: the sector-granular device surface over a real image file.
//!
//! Walks the canonical scenario chain — create, read unallocated space,
//! compressible and incompressible writes, in-place compressed overwrite,
//! and the raw-tail partial write on a larger cluster size — verifying both
//! the data contents and the zone class each block lands in.

use tempfile::TempDir;

use zbd::opts::{CreateOpts, OpenOpts};
use zbd::{create_file, Device, FileBlob, ZoneClass};

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

/// 64 MiB image with the default 4 KiB clusters and 4 MiB zones.
fn make_device(dir: &TempDir) -> Device<FileBlob> {
    let path = dir.path().join("disk.zbd");
    create_file(&path, &CreateOpts::new(64 << 20)).unwrap();
    let blob = FileBlob::open(&path, false).unwrap();
    Device::open(blob, &OpenOpts::default()).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario chain: fresh image → compressible → incompressible → overwrite
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn scenario_chain_on_fresh_image() {
    let dir = TempDir::new().unwrap();
    let dev = make_device(&dir);

    // 1. A fresh image reads as zeros: sector 0, count 128 (64 KiB).
    let mut buf = vec![0xffu8; 65536];
    dev.read(0, 128, &mut [&mut buf[..]]).unwrap();
    assert!(buf.iter().all(|&b| b == 0), "unallocated space must read zero");

    // 2. A compressible block round-trips and lands in a Z-zone.
    let fill_a = vec![0x41u8; 4096];
    dev.write(0, 8, &[&fill_a[..]]).unwrap();
    let mut back = vec![0u8; 4096];
    dev.read(0, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, fill_a);
    let pa = dev.image().translate(0);
    assert_ne!(pa, 0);
    assert_eq!(dev.image().zone_class_of(pa).unwrap(), ZoneClass::Z);

    // 3. An incompressible block falls back to raw storage in an N-zone.
    let random = noise(4096, 0x243f_6a88_85a3_08d3);
    dev.write(8, 8, &[&random[..]]).unwrap();
    let mut back = vec![0u8; 4096];
    dev.read(8, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, random);
    let pa_n = dev.image().translate(4096);
    assert_eq!(dev.image().zone_class_of(pa_n).unwrap(), ZoneClass::N);

    // 4. Overwriting the compressed block in place keeps its PA.
    let fill_b = vec![0x42u8; 4096];
    dev.write(0, 8, &[&fill_b[..]]).unwrap();
    assert_eq!(dev.image().translate(0), pa, "in-place Z overwrite must not move");
    let mut back = vec![0u8; 4096];
    dev.read(0, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, fill_b);
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw tail of a larger cluster
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn partial_tail_write_on_8k_clusters() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk8k.zbd");
    let mut opts = CreateOpts::new(64 << 20);
    opts.cluster_size = 8192;
    create_file(&path, &opts).unwrap();
    let blob = FileBlob::open(&path, false).unwrap();
    let dev = Device::open(blob, &OpenOpts::default()).unwrap();

    // Write 4 KiB of 0x55 at byte offset 4096 of block 0 (sectors 8..16).
    let tail = vec![0x55u8; 4096];
    dev.write(8, 8, &[&tail[..]]).unwrap();

    let mut block = vec![0xffu8; 8192];
    dev.read(0, 16, &mut [&mut block[..]]).unwrap();
    assert!(block[..4096].iter().all(|&b| b == 0), "head page must stay zero");
    assert!(block[4096..].iter().all(|&b| b == 0x55));

    // The all-zero head page compresses trivially, so the block is Z-stored.
    let pa = dev.image().translate(0);
    assert_eq!(dev.image().zone_class_of(pa).unwrap(), ZoneClass::Z);
}

// ─────────────────────────────────────────────────────────────────────────────
// Laws
// ─────────────────────────────────────────────────────────────────────────────

/// Read-after-write for a spread of aligned blocks, compressible and not.
#[test]
fn read_after_write_roundtrip() {
    let dir = TempDir::new().unwrap();
    let dev = make_device(&dir);

    let cases: Vec<(u64, Vec<u8>)> = vec![
        (0, vec![0u8; 4096]),
        (8, vec![0xa5u8; 4096]),
        (16, noise(4096, 1)),
        (24, (0u8..=255).cycle().take(4096).collect()),
        (4096, noise(4096, 2)), // sector 4096 = VA 2 MiB
        (131064, vec![0x31u8; 4096]), // last block of the device
    ];
    for (sector, data) in &cases {
        dev.write(*sector, 8, &[&data[..]]).unwrap();
    }
    for (sector, data) in &cases {
        let mut back = vec![0u8; 4096];
        dev.read(*sector, 8, &mut [&mut back[..]]).unwrap();
        assert_eq!(&back, data, "mismatch at sector {}", sector);
    }
}

/// Sub-block writes replace exactly their byte range.
#[test]
fn partial_write_composition() {
    let dir = TempDir::new().unwrap();
    let dev = make_device(&dir);

    let base = noise(4096, 99);
    dev.write(0, 8, &[&base[..]]).unwrap();

    // Overwrite sectors 2..4 (bytes 1024..2048) of the block.
    let patch = vec![0xc3u8; 1024];
    dev.write(2, 2, &[&patch[..]]).unwrap();

    let mut expect = base;
    expect[1024..2048].fill(0xc3);
    let mut back = vec![0u8; 4096];
    dev.read(0, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, expect);
}

/// A write spanning several blocks with unaligned head and tail.
#[test]
fn straddling_write() {
    let dir = TempDir::new().unwrap();
    let dev = make_device(&dir);

    // Sectors 5..27: head partial (5..8), two whole blocks, tail partial.
    let data = noise(22 * 512, 0x5eed);
    dev.write(5, 22, &[&data[..]]).unwrap();

    let mut back = vec![0u8; 22 * 512];
    dev.read(5, 22, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, data);

    // Neighbouring sectors are untouched.
    let mut edge = vec![0xffu8; 512];
    dev.read(4, 1, &mut [&mut edge[..]]).unwrap();
    assert!(edge.iter().all(|&b| b == 0));
    dev.read(27, 1, &mut [&mut edge[..]]).unwrap();
    assert!(edge.iter().all(|&b| b == 0));
}

/// Never-written blocks read as zeros even after neighbours are written.
#[test]
fn zero_on_unmapped() {
    let dir = TempDir::new().unwrap();
    let dev = make_device(&dir);
    dev.write(0, 8, &[&vec![0x11u8; 4096][..]]).unwrap();
    dev.write(16, 8, &[&vec![0x22u8; 4096][..]]).unwrap();

    let mut hole = vec![0xffu8; 4096];
    dev.read(8, 8, &mut [&mut hole[..]]).unwrap();
    assert!(hole.iter().all(|&b| b == 0));
}

/// Storage is claimed zone by zone: a lightly used 64 MiB device must not
/// consume anywhere near 64 MiB of backing storage.
#[test]
fn backing_file_grows_by_zones() {
    let dir = TempDir::new().unwrap();
    let dev = make_device(&dir);

    for i in 0..64u64 {
        dev.write(i * 8, 8, &[&vec![0x61u8; 4096][..]]).unwrap();
    }
    let mut back = vec![0u8; 4096];
    dev.read(32 * 8, 8, &mut [&mut back[..]]).unwrap();
    assert_eq!(back, vec![0x61u8; 4096]);

    let allocated = dev.allocated_size().unwrap();
    assert!(allocated > 0);
    // Three claimed zones (L, N, Z) plus metadata: far below capacity.
    assert!(
        allocated < 32 << 20,
        "lightly used image should stay well under capacity, got {}",
        allocated
    );
}
