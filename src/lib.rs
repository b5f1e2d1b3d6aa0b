//! zbd — a zoned, compressed block-device image format.
//!
//! An image file presents a fixed-capacity virtual block device. Logical
//! 512-byte sectors are stored as fixed-size blocks, each either
//! LZ4-compressed in a **Z**-zone or raw in an **N**-zone, with a two-level
//! page-table index (L1 pages at a fixed location, L2 pages in **L**-zones)
//! mapping virtual block addresses to file offsets.
//!
//! The interesting property is the per-class persistence discipline: raw
//! allocations are made durable before they are acknowledged, compressed
//! allocations are deliberately not — each compressed block names its own
//! virtual address, so an open-time scan of the one growing Z-zone rebuilds
//! their mappings for free. See the module docs of [`zone`], [`index`] and
//! [`image`] for the full protocol.

pub mod blob;
pub mod create;
pub mod device;
pub mod error;
pub mod image;
pub mod index;
pub mod layout;
pub mod opts;
pub mod zone;
pub mod zpage;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level re-exports for the common entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// Backing-store abstraction and its file / in-memory implementations.
pub use blob::{Blob, FileBlob, MemBlob};

/// Create an image on an arbitrary blob / at a file path.
pub use create::{create, create_file};

/// The sector-granular driver surface.
pub use device::{probe, Device, DeviceInfo, SECTOR_SIZE};

/// Engine errors and the crate-wide result alias.
pub use error::{Result, ZbdError};

/// One open image: the block-granular engine.
pub use image::{Image, MappingCensus, WriteStats};

/// On-disk header and geometry.
pub use layout::{Geometry, ImageHeader, Init, PAGE_SIZE};

/// Creation and open parameters.
pub use opts::{parse_size, CreateOpts, OpenOpts};

/// Zone classes, visible through [`Image::zone_class_of`].
pub use zone::ZoneClass;
