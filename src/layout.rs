//! On-disk layout: header, constants, and geometry.
//!
//! An image file is laid out as
//!
//! ```text
//! | header (1 page) | zone-info pages | L1 pages (nr_l1) | zones ... |
//! 0                 pa_zi             pa_l1              pa_zones
//! ```
//!
//! The header is written once at create time and never rewritten. All
//! multi-byte integers on disk are little-endian, encoded field by field;
//! the format is byte-order portable.

use crate::error::{Result, ZbdError};
use crate::opts::CreateOpts;

/// Magic bytes identifying an image file.
pub const MAGIC: [u8; 8] = *b"ZBDMAGIC";

/// Unit of all metadata I/O: L1/L2 pages, zone-info pages, compressed heads.
pub const PAGE_SIZE: u64 = 4096;

/// Serialized header size: 8 magic bytes + 9 u64 fields.
pub const HEADER_SIZE: usize = 80;

/// Entries per L1 or L2 page (4096 / 8).
pub const FANOUT: usize = 512;

/// Size of one serialized zone-info entry.
pub const ZONE_INFO_SIZE: u64 = 4;

// ---------------------------------------------------------------------------
// Init mode
// ---------------------------------------------------------------------------

/// How the data region of a freshly claimed zone is initialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Init {
    /// Leave prior contents in place. Cheapest, but unallocated blocks are
    /// then not guaranteed to read as zero.
    None = 0,
    /// Discard the zone region (punch a hole); no flush.
    Trim = 1,
    /// Write zeros across the zone and flush.
    #[default]
    Zero = 2,
}

impl Init {
    pub fn from_raw(v: u64) -> Result<Init> {
        match v {
            0 => Ok(Init::None),
            1 => Ok(Init::Trim),
            2 => Ok(Init::Zero),
            _ => Err(ZbdError::Corrupt(format!("unknown init type {}", v))),
        }
    }
}

impl std::str::FromStr for Init {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Init, String> {
        match s {
            "none" => Ok(Init::None),
            "trim" => Ok(Init::Trim),
            "zero" => Ok(Init::Zero),
            _ => Err(format!("unknown init mode '{}' (expected trim, zero or none)", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Image header, stored at offset 0. Immutable after creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    /// Virtual device size in bytes.
    pub capacity: u64,
    /// `block_size == 1 << block_shift`, `block_shift >= 12`.
    pub block_shift: u64,
    /// Number of L1 pages; one L1 page maps `block_size * 512 * 512` bytes.
    pub nr_l1: u64,
    /// Size of each zone in bytes.
    pub zone_size: u64,
    /// Total zone slots in the data region.
    pub nr_zones: u64,
    /// Offset of the zone-info array.
    pub pa_zi: u64,
    /// Offset of the L1 page array.
    pub pa_l1: u64,
    /// Offset of the first zone.
    pub pa_zones: u64,
    /// Zone initialization policy.
    pub init: Init,
}

impl ImageHeader {
    /// Computes the full layout from creation parameters.
    ///
    /// Validation mirrors the create-time rules: the cluster size must be a
    /// power of two of at least one page, the zone size a power of two of
    /// at least one cluster, and the capacity a non-zero multiple of the
    /// cluster size.
    pub fn compute(opts: &CreateOpts) -> Result<ImageHeader> {
        let cluster = opts.cluster_size;
        let zone = opts.zone_size;
        if cluster < PAGE_SIZE {
            return Err(ZbdError::InvalidParameter("cluster_size below 4096"));
        }
        if !cluster.is_power_of_two() {
            return Err(ZbdError::InvalidParameter("cluster_size not a power of two"));
        }
        if zone < cluster {
            return Err(ZbdError::InvalidParameter("zone_size below cluster_size"));
        }
        if !zone.is_power_of_two() {
            return Err(ZbdError::InvalidParameter("zone_size not a power of two"));
        }
        if opts.size == 0 {
            return Err(ZbdError::InvalidParameter("size is zero"));
        }
        if opts.size % cluster != 0 {
            return Err(ZbdError::InvalidParameter("size not a multiple of cluster_size"));
        }

        let block_shift = cluster.trailing_zeros() as u64;
        // Each L1 page maps cluster * 512 * 512 bytes of virtual space.
        let l1_span = cluster * (FANOUT as u64) * (FANOUT as u64);
        let nr_l1 = opts.size.div_ceil(l1_span);
        // Twice the minimum zone count leaves headroom for leaked Z slots.
        let nr_zones = (opts.size / zone) * 2 + 1;
        let zone_pages = (nr_zones * ZONE_INFO_SIZE) / PAGE_SIZE + 1;

        Ok(ImageHeader {
            capacity: opts.size,
            block_shift,
            nr_l1,
            zone_size: zone,
            nr_zones,
            pa_zi: PAGE_SIZE,
            pa_l1: PAGE_SIZE * (zone_pages + 1),
            pa_zones: PAGE_SIZE * (zone_pages + nr_l1 + 1),
            init: opts.init,
        })
    }

    /// Serializes the header into its 80-byte on-disk form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        let fields = [
            self.capacity,
            self.block_shift,
            self.nr_l1,
            self.zone_size,
            self.nr_zones,
            self.pa_zi,
            self.pa_l1,
            self.pa_zones,
            self.init as u64,
        ];
        for (i, v) in fields.iter().enumerate() {
            let off = 8 + i * 8;
            buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    /// Parses and validates an on-disk header.
    pub fn decode(buf: &[u8]) -> Result<ImageHeader> {
        if buf.len() < HEADER_SIZE {
            return Err(ZbdError::Corrupt("truncated header".into()));
        }
        if buf[0..8] != MAGIC {
            return Err(ZbdError::Corrupt("bad magic".into()));
        }
        let field = |i: usize| {
            let off = 8 + i * 8;
            u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
        };
        let header = ImageHeader {
            capacity: field(0),
            block_shift: field(1),
            nr_l1: field(2),
            zone_size: field(3),
            nr_zones: field(4),
            pa_zi: field(5),
            pa_l1: field(6),
            pa_zones: field(7),
            init: Init::from_raw(field(8))?,
        };
        header.validate()?;
        Ok(header)
    }

    /// Checks the layout invariants an opener relies on.
    fn validate(&self) -> Result<()> {
        let corrupt = |detail: &str| Err(ZbdError::Corrupt(detail.into()));
        if !(12..=40).contains(&self.block_shift) {
            return corrupt("block_shift out of range");
        }
        let block_size = 1u64 << self.block_shift;
        if self.capacity == 0 || self.capacity % block_size != 0 {
            return corrupt("capacity not a multiple of block_size");
        }
        if !self.zone_size.is_power_of_two() || self.zone_size < block_size {
            return corrupt("zone_size invalid");
        }
        if self.nr_zones == 0 {
            return corrupt("nr_zones is zero");
        }
        let l1_span = block_size * (FANOUT as u64) * (FANOUT as u64);
        if self.nr_l1 * l1_span < self.capacity {
            return corrupt("nr_l1 does not cover capacity");
        }
        if self.pa_zi != PAGE_SIZE
            || self.pa_l1 <= self.pa_zi
            || self.pa_zones <= self.pa_l1
            || self.pa_l1 % PAGE_SIZE != 0
            || self.pa_zones % PAGE_SIZE != 0
        {
            return corrupt("metadata offsets inconsistent");
        }
        Ok(())
    }
}

/// Format probe: returns 100 when `buf` starts with the image magic,
/// 0 otherwise.
pub fn probe(buf: &[u8]) -> i32 {
    if buf.len() >= 8 && buf[0..8] == MAGIC {
        100
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Header fields plus the constants derived from them, copied into every
/// component that needs address arithmetic.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub capacity: u64,
    pub block_shift: u64,
    pub block_size: u64,
    pub nr_l1: u64,
    pub zone_size: u64,
    pub nr_zones: u64,
    pub pa_zi: u64,
    pub pa_l1: u64,
    pub pa_zones: u64,
    pub init: Init,
    /// Data units (blocks) per zone.
    pub nr_zone_unit: u64,
    /// L2 pages per zone.
    pub nr_zone_page: u64,
}

impl Geometry {
    pub fn new(h: &ImageHeader) -> Geometry {
        let block_size = 1u64 << h.block_shift;
        Geometry {
            capacity: h.capacity,
            block_shift: h.block_shift,
            block_size,
            nr_l1: h.nr_l1,
            zone_size: h.zone_size,
            nr_zones: h.nr_zones,
            pa_zi: h.pa_zi,
            pa_l1: h.pa_l1,
            pa_zones: h.pa_zones,
            init: h.init,
            nr_zone_unit: h.zone_size / block_size,
            nr_zone_page: h.zone_size / PAGE_SIZE,
        }
    }

    /// Rounds a byte offset down to its enclosing block.
    #[inline]
    pub fn block_align_down(&self, off: u64) -> u64 {
        off & !(self.block_size - 1)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opts::CreateOpts;

    fn opts(size: u64) -> CreateOpts {
        CreateOpts::new(size)
    }

    #[test]
    fn compute_default_layout_64m() {
        let h = ImageHeader::compute(&opts(64 << 20)).unwrap();
        assert_eq!(h.capacity, 64 << 20);
        assert_eq!(h.block_shift, 12);
        // 4096 * 512 * 512 = 1 GiB per L1 page; 64 MiB needs one.
        assert_eq!(h.nr_l1, 1);
        assert_eq!(h.zone_size, 4 << 20);
        assert_eq!(h.nr_zones, 16 * 2 + 1);
        // 33 entries * 4 B fit one page; zone_pages = 1.
        assert_eq!(h.pa_zi, 4096);
        assert_eq!(h.pa_l1, 4096 * 2);
        assert_eq!(h.pa_zones, 4096 * 3);
    }

    #[test]
    fn compute_nr_l1_rounds_up() {
        let mut o = opts(3 << 30); // 3 GiB over 1 GiB L1 span
        o.cluster_size = 4096;
        let h = ImageHeader::compute(&o).unwrap();
        assert_eq!(h.nr_l1, 3);

        let o = opts((1 << 30) + 4096);
        let h = ImageHeader::compute(&o).unwrap();
        assert_eq!(h.nr_l1, 2);
    }

    #[test]
    fn compute_rejects_bad_parameters() {
        let mut o = opts(1 << 20);
        o.cluster_size = 2048;
        assert!(matches!(
            ImageHeader::compute(&o),
            Err(ZbdError::InvalidParameter(_))
        ));

        let mut o = opts(1 << 20);
        o.cluster_size = 12288; // not a power of two
        assert!(ImageHeader::compute(&o).is_err());

        let mut o = opts(1 << 20);
        o.zone_size = 4096;
        o.cluster_size = 8192; // zone below cluster
        assert!(ImageHeader::compute(&o).is_err());

        assert!(ImageHeader::compute(&opts(0)).is_err());

        let o = opts((1 << 20) + 512); // not cluster-aligned
        assert!(ImageHeader::compute(&o).is_err());
    }

    #[test]
    fn header_encode_decode_roundtrip() {
        let h = ImageHeader::compute(&opts(64 << 20)).unwrap();
        let buf = h.encode();
        assert_eq!(&buf[0..8], b"ZBDMAGIC");
        let back = ImageHeader::decode(&buf).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn decode_rejects_bad_magic_and_garbage() {
        let h = ImageHeader::compute(&opts(64 << 20)).unwrap();
        let mut buf = h.encode();
        buf[0] = b'X';
        assert!(matches!(
            ImageHeader::decode(&buf),
            Err(ZbdError::Corrupt(_))
        ));
        assert!(ImageHeader::decode(&[0u8; HEADER_SIZE]).is_err());
        assert!(ImageHeader::decode(&[0u8; 8]).is_err());
    }

    #[test]
    fn decode_rejects_tampered_fields() {
        let h = ImageHeader::compute(&opts(64 << 20)).unwrap();

        let mut bad = h;
        bad.block_shift = 9;
        assert!(ImageHeader::decode(&bad.encode()).is_err());

        let mut bad = h;
        bad.zone_size = 3 << 20; // not a power of two
        assert!(ImageHeader::decode(&bad.encode()).is_err());

        let mut bad = h;
        bad.nr_l1 = 0;
        assert!(ImageHeader::decode(&bad.encode()).is_err());

        let mut bad = h;
        bad.pa_zones = bad.pa_l1;
        assert!(ImageHeader::decode(&bad.encode()).is_err());
    }

    #[test]
    fn probe_scores() {
        assert_eq!(probe(b"ZBDMAGIC rest of header"), 100);
        assert_eq!(probe(b"ZBDMAGI"), 0);
        assert_eq!(probe(b"QFI\xfb...."), 0);
        assert_eq!(probe(&[]), 0);
    }

    #[test]
    fn geometry_derived_constants() {
        let mut o = opts(64 << 20);
        o.cluster_size = 8192;
        let h = ImageHeader::compute(&o).unwrap();
        let g = Geometry::new(&h);
        assert_eq!(g.block_size, 8192);
        assert_eq!(g.nr_zone_unit, (4 << 20) / 8192);
        assert_eq!(g.nr_zone_page, (4 << 20) / 4096);
        assert_eq!(g.block_align_down(8191), 0);
        assert_eq!(g.block_align_down(8192), 8192);
    }

    #[test]
    fn init_parse() {
        assert_eq!("zero".parse::<Init>().unwrap(), Init::Zero);
        assert_eq!("trim".parse::<Init>().unwrap(), Init::Trim);
        assert_eq!("none".parse::<Init>().unwrap(), Init::None);
        assert!("quick".parse::<Init>().is_err());
        assert!(Init::from_raw(3).is_err());
    }
}
