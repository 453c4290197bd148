//! Error types for the shared-memory transport.

use thiserror::Error;

/// Errors raised while writing a record into the ring.
///
/// These never propagate beyond the store layer: every variant has a matching
/// drop counter in the region header that is bumped before the error is
/// returned, so callers are free to ignore the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The active half could not fit the reservation.
    #[error("ring buffer full (requested {requested} bytes)")]
    BufferFull {
        /// Total bytes requested, including framing.
        requested: u32,
    },

    /// The payload exceeds the configured maximum or is malformed.
    #[error("invalid payload size {size}")]
    InvalidSize {
        /// The rejected payload size.
        size: usize,
    },
}

/// Errors raised while creating or opening a shared-memory region.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Filesystem or mmap syscall failure.
    #[error("shared memory I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The mapping address does not satisfy the region header alignment.
    #[error("shared memory mapping is misaligned")]
    Misaligned,

    /// The region header does not carry the expected magic.
    #[error("bad region magic {found:#x}")]
    BadMagic {
        /// The value found at the magic offset.
        found: u32,
    },

    /// The region was created by an incompatible layout version.
    #[error("unsupported region layout version {found}")]
    VersionMismatch {
        /// The version recorded in the header.
        found: u32,
    },

    /// The region belongs to a different producer process.
    #[error("region producer pid {found} does not match expected {expected}")]
    PidMismatch {
        /// Pid recorded in the region header.
        found: u32,
        /// Pid the session claims.
        expected: u32,
    },

    /// The file is too small for the layout recorded in its header.
    #[error("region file truncated ({file_len} bytes, need {required})")]
    FileTooSmall {
        /// Actual file length.
        file_len: u64,
        /// Length required by the header.
        required: u64,
    },

    /// The requested ring size cannot hold a maximum-sized record per half.
    #[error("ring size {ring_len} rejected: each half must hold at least {min_half} bytes")]
    InvalidRingSize {
        /// Requested total ring length.
        ring_len: u32,
        /// Minimum half length.
        min_half: u32,
    },
}
