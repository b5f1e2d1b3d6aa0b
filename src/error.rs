//! Error taxonomy for the zbd engine.
//!
//! Three families of failures cross the public surface:
//!
//! - invalid caller requests (out-of-range I/O, unaligned vectors, writes to
//!   a read-only image, bad creation parameters) — rejected with no state
//!   change;
//! - fatal conditions (corrupt on-disk metadata, zone exhaustion) — the image
//!   must be considered unusable;
//! - backing-file I/O errors, wrapped verbatim.
//!
//! The driver surface speaks negative errno values; [`ZbdError::errno`]
//! performs that mapping so callers embedding the engine behind a
//! block-driver interface never need to inspect variants themselves.

use core::fmt;
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ZbdError>;

/// All errors produced by the zbd engine and driver surface.
#[derive(Debug)]
pub enum ZbdError {
    /// Backing-blob I/O failure.
    Io(io::Error),
    /// Request extends beyond the virtual capacity.
    OutOfRange,
    /// I/O vector entry whose byte length is not sector-aligned, or a
    /// request whose total length disagrees with its sector count.
    Unaligned,
    /// Write issued against an image opened read-only.
    ReadOnly,
    /// Invalid creation parameter.
    InvalidParameter(&'static str),
    /// No unused zone left to claim. The image is over-committed and no
    /// further allocating writes can proceed.
    NoFreeZone,
    /// On-disk metadata violates a format invariant. The image is corrupt
    /// (or was produced by a buggy writer) and must not be written further.
    Corrupt(String),
}

impl fmt::Display for ZbdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZbdError::Io(e) => write!(f, "backing I/O error: {}", e),
            ZbdError::OutOfRange => write!(f, "request beyond virtual capacity"),
            ZbdError::Unaligned => write!(f, "request length not sector-aligned"),
            ZbdError::ReadOnly => write!(f, "image is read-only"),
            ZbdError::InvalidParameter(what) => write!(f, "invalid parameter: {}", what),
            ZbdError::NoFreeZone => write!(f, "no unused zone available"),
            ZbdError::Corrupt(detail) => write!(f, "corrupt image: {}", detail),
        }
    }
}

impl std::error::Error for ZbdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ZbdError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ZbdError {
    fn from(e: io::Error) -> Self {
        ZbdError::Io(e)
    }
}

impl ZbdError {
    /// Maps the error to the negative errno expected by block-driver hosts.
    ///
    /// Invalid requests map to `-EINVAL`, read-only violations to `-EACCES`,
    /// zone exhaustion to `-ENOSPC`, corruption to `-EIO`, and I/O errors to
    /// their OS error code when one is available.
    pub fn errno(&self) -> i32 {
        match self {
            ZbdError::Io(e) => e.raw_os_error().map(|v| -v).unwrap_or(-libc::EIO),
            ZbdError::OutOfRange
            | ZbdError::Unaligned
            | ZbdError::InvalidParameter(_) => -libc::EINVAL,
            ZbdError::ReadOnly => -libc::EACCES,
            ZbdError::NoFreeZone => -libc::ENOSPC,
            ZbdError::Corrupt(_) => -libc::EIO,
        }
    }
}
