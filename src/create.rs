//! Image creation.
//!
//! Creation writes the header at offset 0 and zero-fills the zone-info and
//! L1 regions. No data zones are materialized; the file grows as zones are
//! claimed. Creation does not flush — durability of a freshly created image
//! is the caller's responsibility, like any other file it just wrote.

use std::path::Path;

use log::debug;

use crate::blob::{Blob, FileBlob};
use crate::error::Result;
use crate::layout::ImageHeader;
use crate::opts::CreateOpts;

/// Creates an image on `blob`, returning the computed header.
pub fn create<B: Blob>(blob: &B, opts: &CreateOpts) -> Result<ImageHeader> {
    let header = ImageHeader::compute(opts)?;
    blob.pwrite(0, &header.encode())?;
    // Zone-info pages and L1 pages sit back to back; both start all-zero
    // (every zone unused, every L1 entry unallocated).
    blob.write_zeroes(header.pa_zi, header.pa_zones - header.pa_zi)?;
    debug!(
        "created image: capacity={} block_shift={} nr_l1={} zone_size={} nr_zones={} init={:?}",
        header.capacity, header.block_shift, header.nr_l1, header.zone_size, header.nr_zones,
        header.init
    );
    Ok(header)
}

/// Creates (or truncates) an image file at `path`.
pub fn create_file<P: AsRef<Path>>(path: P, opts: &CreateOpts) -> Result<ImageHeader> {
    let blob = FileBlob::create(path)?;
    create(&blob, opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemBlob;
    use crate::layout::{probe, ImageHeader, HEADER_SIZE};

    #[test]
    fn create_writes_header_and_zeroed_metadata() {
        let blob = MemBlob::new();
        let header = create(&blob, &CreateOpts::new(64 << 20)).unwrap();

        let mut hbuf = [0u8; HEADER_SIZE];
        blob.pread(0, &mut hbuf).unwrap();
        assert_eq!(probe(&hbuf), 100);
        assert_eq!(ImageHeader::decode(&hbuf).unwrap(), header);

        // The metadata region exists and is zero.
        assert_eq!(blob.len(), header.pa_zones);
        let mut meta = vec![0xffu8; (header.pa_zones - header.pa_zi) as usize];
        blob.pread(header.pa_zi, &mut meta).unwrap();
        assert!(meta.iter().all(|&b| b == 0));
    }

    #[test]
    fn create_rejects_invalid_opts() {
        let blob = MemBlob::new();
        let mut opts = CreateOpts::new(64 << 20);
        opts.cluster_size = 1000;
        assert!(create(&blob, &opts).is_err());
        // Nothing was written.
        assert_eq!(blob.len(), 0);
    }

    #[test]
    fn create_file_then_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.zbd");
        create_file(&path, &CreateOpts::new(16 << 20)).unwrap();
        let head = std::fs::read(&path).unwrap();
        assert_eq!(probe(&head), 100);
    }
}
