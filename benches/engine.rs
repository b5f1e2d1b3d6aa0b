//! Criterion benchmarks for the block read/write path.
//!
//! Run with:
//!   cargo bench --bench engine
//!
//! Uses an in-memory backing blob so the numbers reflect the engine
//! (codec, allocator, index) rather than the disk.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use zbd::opts::{CreateOpts, OpenOpts};
use zbd::{create, Image, MemBlob};

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

fn make_image() -> Image<MemBlob> {
    let blob = MemBlob::new();
    create(&blob, &CreateOpts::new(256 << 20)).unwrap();
    Image::open(blob, &OpenOpts::default()).unwrap()
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_write");
    group.throughput(Throughput::Bytes(4096));

    // Steady-state in-place overwrite of a compressed block.
    {
        let image = make_image();
        let text: Vec<u8> = b"some moderately compressible text payload "
            .iter()
            .cycle()
            .take(4096)
            .cloned()
            .collect();
        image.write_block(0, &text).unwrap();
        group.bench_function("compressible_overwrite", |b| {
            b.iter(|| image.write_block(0, black_box(&text)).unwrap())
        });
    }

    // Steady-state in-place overwrite of a raw block.
    {
        let image = make_image();
        let random = noise(4096, 0x1234_5678_9abc_def0);
        image.write_block(0, &random).unwrap();
        group.bench_function("incompressible_overwrite", |b| {
            b.iter(|| image.write_block(0, black_box(&random)).unwrap())
        });
    }

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_read");
    group.throughput(Throughput::Bytes(4096));

    let image = make_image();
    let text: Vec<u8> = b"some moderately compressible text payload "
        .iter()
        .cycle()
        .take(4096)
        .cloned()
        .collect();
    let random = noise(4096, 0xfedc_ba98_7654_3210);
    image.write_block(0, &text).unwrap();
    image.write_block(4096, &random).unwrap();

    let mut buf = vec![0u8; 4096];
    group.bench_function("compressed", |b| {
        b.iter(|| image.read_block(0, black_box(&mut buf)).unwrap())
    });
    group.bench_function("raw", |b| {
        b.iter(|| image.read_block(4096, black_box(&mut buf)).unwrap())
    });
    group.bench_function("unmapped", |b| {
        b.iter(|| image.read_block(8192, black_box(&mut buf)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
