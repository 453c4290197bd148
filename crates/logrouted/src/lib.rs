//! Logging daemon core.
//!
//! Producers write framed records into `ringflip` shared-memory regions and
//! announce themselves over the `ringflip-ipc` control channel. This crate
//! is the daemon side: a single-worker session scheduler drains each
//! producer's ring on its tick, a per-source parser resolves registered
//! types and dispatches records, and the routing layer fans them out to
//! batched DLT/UDP channels with per-source quotas and per-message
//! filtering.

pub mod channel;
pub mod config;
pub mod dlt;
pub mod parser;
pub mod router;
pub mod server;
pub mod session;
pub mod stats;
pub mod udp;

// Re-export main types
pub use channel::{LogChannel, STAGING_BUFFERS, UDP_MAX_PAYLOAD};
pub use config::{ConfigError, LogLevel, NvConfig, NvMsgDescriptor, StaticConfig};
pub use dlt::DltId;
pub use parser::{GlobalHandler, LogParser, TypeHandler, TypeInfo};
pub use router::{
    AssignmentAction, ChannelMask, LogEntry, Router, FILE_TRANSFER_TYPE_NAME, LOG_ENTRY_TYPE_NAME,
};
pub use server::{SessionFactory, SessionServer};
pub use session::{SessionHandle, SourceSession, IDLE_TICKS_BEFORE_KEEPALIVE};

use ringflip::ReaderFactory;
use std::path::Path;
use std::sync::Arc;
use tracing::error;

/// The standard session factory: opens the region a `Connect` advertised,
/// builds a parser with the routing handlers attached, and applies the
/// source's quota.
pub fn session_factory(
    router: Arc<Router>,
    nv_config: Arc<NvConfig>,
    channel_dir: &Path,
) -> SessionFactory {
    let channel_dir = channel_dir.to_path_buf();
    Box::new(move |pid, connect, handle| {
        let identifier = connect.identifier();
        let region_path = channel_dir.join(format!("{identifier}.shmem"));

        let reader = match ReaderFactory::open(&region_path, pid) {
            Ok(reader) => reader,
            Err(err) => {
                error!(pid, %identifier, error = %err, "cannot open advertised region");
                return None;
            }
        };

        let mut parser = LogParser::new(Arc::clone(&nv_config));
        router.attach_handlers(&mut parser);

        let name = connect
            .app_id
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| char::from(b))
            .collect::<String>();

        Some(Arc::new(SourceSession::new(
            name.clone(),
            reader,
            parser,
            handle,
            router.quota_for(&name),
            router.quota_enforcement_enabled(),
            router.output_enabled(),
        )))
    })
}
