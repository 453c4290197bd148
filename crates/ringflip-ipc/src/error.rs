//! Error types for the control channel.

use thiserror::Error;

/// Errors on the short-message channel.
#[derive(Debug, Error)]
pub enum WireError {
    /// Socket-level failure.
    #[error("control channel I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The peer endpoint is gone; the session is closed by peer.
    #[error("peer endpoint closed")]
    PeerClosed,

    /// A datagram carried an unknown tag byte.
    #[error("unknown message tag {tag}")]
    BadTag {
        /// The offending tag.
        tag: u8,
    },

    /// A datagram was shorter than its tag requires.
    #[error("truncated message ({len} bytes)")]
    Truncated {
        /// Received datagram length.
        len: usize,
    },

    /// The kernel did not attach sender credentials.
    #[error("datagram without sender credentials")]
    MissingCredentials,
}

impl WireError {
    /// True when the error means the remote side is gone for good.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}
