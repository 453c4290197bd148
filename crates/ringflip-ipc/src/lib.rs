//! Out-of-band session control channel for `ringflip` regions.
//!
//! Producers and the daemon exchange three tiny datagrams over per-endpoint
//! unix sockets: `Connect` advertises a producer's region, `AcquireRequest`
//! asks the producer to switch its ring, `AcquireResponse` names the retired
//! half. Losses are tolerated: the daemon treats the request purely as a
//! hint and has its own detach and timeout safety; a failed send means the
//! peer is gone.

pub mod channel;
pub mod client;
pub mod error;
pub mod message;

// Re-export main types
pub use channel::{Receiver, Sender};
pub use client::{MessageClient, DAEMON_RECEIVER_NAME};
pub use error::WireError;
pub use message::{app_id_bytes, ConnectMessage, ControlMessage, MAX_MESSAGE_BYTES};
