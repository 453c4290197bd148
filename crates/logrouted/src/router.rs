//! Routing core: filtering, channel assignment, record handlers.

use crate::channel::LogChannel;
use crate::config::{ConfigError, LogLevel, StaticConfig};
use crate::dlt::DltId;
use crate::parser::{GlobalHandler, LogParser, TypeHandler, TypeInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Type name verbose log entries are registered under.
pub const LOG_ENTRY_TYPE_NAME: &str = "log.entry.v1";

/// Type name file-transfer chunks are registered under.
pub const FILE_TRANSFER_TYPE_NAME: &str = "log.file_transfer.v1";

/// Bitset of channel indices a record fans out to.
pub type ChannelMask = u32;

/// Most channels a configuration may declare (mask width).
pub const MAX_CHANNELS: usize = ChannelMask::BITS as usize;

/// Add or remove one channel from an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentAction {
    Add,
    Remove,
}

/// A decoded verbose log entry (also the file-transfer chunk layout):
///
/// ```text
/// app_id: [u8;4] ‖ ctx_id: [u8;4] ‖ level: u8 ‖ noar: u8 ‖ argument bytes
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    pub app_id: DltId,
    pub ctx_id: DltId,
    pub level: LogLevel,
    pub noar: u8,
    pub payload: &'a [u8],
}

impl<'a> LogEntry<'a> {
    pub const HEADER_BYTES: usize = 10;

    pub fn decode(data: &'a [u8]) -> Option<Self> {
        if data.len() < Self::HEADER_BYTES {
            return None;
        }
        let mut app = [0u8; 4];
        app.copy_from_slice(&data[0..4]);
        let mut ctx = [0u8; 4];
        ctx.copy_from_slice(&data[4..8]);
        Some(Self {
            app_id: DltId(app),
            ctx_id: DltId(ctx),
            level: LogLevel::from_u8(data[8]),
            noar: data[9],
            payload: &data[Self::HEADER_BYTES..],
        })
    }

    /// Producer-side serialization (also used heavily by tests).
    pub fn encode(
        app_id: DltId,
        ctx_id: DltId,
        level: LogLevel,
        noar: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_BYTES + payload.len());
        out.extend_from_slice(&app_id.0);
        out.extend_from_slice(&ctx_id.0);
        out.push(level.as_u8());
        out.push(noar);
        out.extend_from_slice(payload);
        out
    }
}

struct RoutingTables {
    filtering_enabled: bool,
    default_threshold: LogLevel,
    message_thresholds: HashMap<(DltId, DltId), LogLevel>,
    channel_assignments: HashMap<(DltId, DltId), ChannelMask>,
}

/// Converts records into channel fan-out, honouring per-key thresholds and
/// assignments.
///
/// The routing tables live behind one config mutex (reconfiguration comes
/// from an administrative thread); per-channel thresholds are atomics so the
/// send path reads them without the mutex.
pub struct Router {
    tables: Mutex<RoutingTables>,
    channels: Vec<LogChannel>,
    default_channel: usize,
    channel_index: HashMap<DltId, usize>,
    quotas_kbps: HashMap<String, f64>,
    quota_enforcement_enabled: bool,
    output_enabled: AtomicBool,
}

impl Router {
    /// Opens every configured channel (binding its socket) and builds the
    /// routing tables.
    pub fn from_config(config: &StaticConfig) -> Result<Arc<Self>, ConfigError> {
        if config.channels.len() > MAX_CHANNELS {
            return Err(ConfigError::TooManyChannels {
                count: config.channels.len(),
                max: MAX_CHANNELS,
            });
        }

        let mut channels = Vec::with_capacity(config.channels.len());
        let mut channel_index = HashMap::new();
        for (i, channel_config) in config.channels.iter().enumerate() {
            channels.push(LogChannel::open(channel_config, config.ecu_id)?);
            channel_index.insert(channel_config.name, i);
        }

        Ok(Arc::new(Self {
            tables: Mutex::new(RoutingTables {
                filtering_enabled: false,
                default_threshold: config.default_threshold,
                message_thresholds: HashMap::new(),
                channel_assignments: HashMap::new(),
            }),
            channels,
            default_channel: config.default_channel_index(),
            channel_index,
            quotas_kbps: config.quotas_kbps.clone(),
            quota_enforcement_enabled: config.quota_enforcement_enabled,
            output_enabled: AtomicBool::new(config.output_enabled),
        }))
    }

    pub fn channels(&self) -> &[LogChannel] {
        &self.channels
    }

    /// Quota for a source; unknown sources get the conservative 1 KB/s.
    pub fn quota_for(&self, name: &str) -> f64 {
        self.quotas_kbps.get(name).copied().unwrap_or(1.0)
    }

    pub fn quota_enforcement_enabled(&self) -> bool {
        self.quota_enforcement_enabled
    }

    pub fn output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::Relaxed)
    }

    pub fn set_output_enabled(&self, enabled: bool) {
        self.output_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Wires the routing handlers into a fresh source parser.
    pub fn attach_handlers(self: &Arc<Self>, parser: &mut LogParser) {
        if !self.output_enabled() {
            return;
        }
        parser.add_global_handler(Arc::new(NonVerboseHandler {
            router: Arc::clone(self),
        }));
        parser.add_type_handler(
            LOG_ENTRY_TYPE_NAME,
            Arc::new(VerboseHandler {
                router: Arc::clone(self),
            }),
        );
        parser.add_type_handler(
            FILE_TRANSFER_TYPE_NAME,
            Arc::new(FileTransferHandler {
                router: Arc::clone(self),
            }),
        );
    }

    /// Flushes the staging buffers of every channel.
    pub fn flush_all(&self) {
        for channel in &self.channels {
            channel.flush();
        }
    }

    /// One statistics series over all channels.
    pub fn show_channel_statistics(&self, series: u16, period_secs: u64) {
        info!(series, "log stat for the channels");
        for channel in &self.channels {
            channel.show_stats(period_secs);
        }
    }

    // ------------------------------------------------------------------
    // Reconfiguration (administrative thread)
    // ------------------------------------------------------------------

    /// Sets a channel's threshold; false when the channel name is unknown.
    pub fn set_channel_threshold(&self, channel: DltId, level: LogLevel) -> bool {
        match self.channel_index.get(&channel) {
            Some(&i) => {
                self.channels[i].set_threshold(level);
                true
            }
            None => false,
        }
    }

    /// Per-key message threshold; wildcard ids widen the key.
    pub fn set_log_level(&self, app_id: DltId, ctx_id: DltId, level: LogLevel) {
        let mut tables = self.tables.lock().unwrap();
        tables.message_thresholds.insert((app_id, ctx_id), level);
    }

    pub fn set_default_threshold(&self, level: LogLevel) {
        self.tables.lock().unwrap().default_threshold = level;
    }

    pub fn set_filtering(&self, enabled: bool) {
        self.tables.lock().unwrap().filtering_enabled = enabled;
    }

    /// Adds or removes a channel from a key's assignment mask; false when
    /// the channel name is unknown.
    pub fn set_channel_assignment(
        &self,
        app_id: DltId,
        ctx_id: DltId,
        channel: DltId,
        action: AssignmentAction,
    ) -> bool {
        let Some(&index) = self.channel_index.get(&channel) else {
            return false;
        };
        let bit = 1u32 << index;

        let mut tables = self.tables.lock().unwrap();
        let key = (app_id, ctx_id);
        match action {
            AssignmentAction::Add => {
                *tables.channel_assignments.entry(key).or_default() |= bit;
            }
            AssignmentAction::Remove => {
                if let Some(mask) = tables.channel_assignments.get_mut(&key) {
                    *mask &= !bit;
                    if *mask == 0 {
                        tables.channel_assignments.remove(&key);
                    }
                }
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Runs `f` on every channel the record routes to, or not at all when
    /// filtering rejects it. An empty assignment goes to the default
    /// channel.
    fn filter_and_call<F: FnMut(&LogChannel)>(
        &self,
        app_id: DltId,
        ctx_id: DltId,
        level: LogLevel,
        mut f: F,
    ) {
        let assigned = {
            let tables = self.tables.lock().unwrap();
            if !Self::accepted_by_filtering(&tables, app_id, ctx_id, level) {
                return;
            }
            Self::assigned_channels(&tables, app_id, ctx_id)
        };

        if assigned == 0 {
            f(&self.channels[self.default_channel]);
        } else {
            for (i, channel) in self.channels.iter().enumerate() {
                if assigned & (1 << i) != 0 {
                    f(channel);
                }
            }
        }
    }

    fn accepted_by_filtering(
        tables: &RoutingTables,
        app_id: DltId,
        ctx_id: DltId,
        level: LogLevel,
    ) -> bool {
        if !tables.filtering_enabled {
            return true;
        }
        let threshold = Self::find_in_key_map(&tables.message_thresholds, app_id, ctx_id)
            .unwrap_or(tables.default_threshold);
        level <= threshold
    }

    fn assigned_channels(tables: &RoutingTables, app_id: DltId, ctx_id: DltId) -> ChannelMask {
        Self::find_in_key_map(&tables.channel_assignments, app_id, ctx_id).unwrap_or(0)
    }

    /// Lookup with the fallback chain `(app, ctx)` → `(*, ctx)` →
    /// `(app, *)`.
    fn find_in_key_map<V: Copy>(
        map: &HashMap<(DltId, DltId), V>,
        app_id: DltId,
        ctx_id: DltId,
    ) -> Option<V> {
        map.get(&(app_id, ctx_id))
            .or_else(|| map.get(&(DltId::wildcard(), ctx_id)))
            .or_else(|| map.get(&(app_id, DltId::wildcard())))
            .copied()
    }
}

struct VerboseHandler {
    router: Arc<Router>,
}

impl TypeHandler for VerboseHandler {
    fn handle(&self, timestamp_ns: u64, payload: &[u8]) {
        let Some(entry) = LogEntry::decode(payload) else {
            warn!("undecodable verbose entry dropped");
            return;
        };
        self.router
            .filter_and_call(entry.app_id, entry.ctx_id, entry.level, |channel| {
                channel.send_verbose(
                    timestamp_ns,
                    entry.app_id,
                    entry.ctx_id,
                    entry.level,
                    entry.noar,
                    entry.payload,
                );
            });
    }
}

struct NonVerboseHandler {
    router: Arc<Router>,
}

impl GlobalHandler for NonVerboseHandler {
    fn handle(&self, info: &TypeInfo, timestamp_ns: u64, payload: &[u8]) {
        let Some(desc) = &info.nv_desc else {
            return;
        };
        self.router
            .filter_and_call(desc.app_id, desc.ctx_id, desc.log_level, |channel| {
                channel.send_nonverbose(desc, timestamp_ns, payload);
            });
    }
}

struct FileTransferHandler {
    router: Arc<Router>,
}

impl TypeHandler for FileTransferHandler {
    fn handle(&self, timestamp_ns: u64, payload: &[u8]) {
        let Some(entry) = LogEntry::decode(payload) else {
            warn!("undecodable file-transfer entry dropped");
            return;
        };
        self.router
            .filter_and_call(entry.app_id, entry.ctx_id, entry.level, |channel| {
                channel.send_file_transfer(
                    timestamp_ns,
                    entry.app_id,
                    entry.ctx_id,
                    entry.level,
                    entry.noar,
                    entry.payload,
                );
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn listener() -> (UdpSocket, u16) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        let port = sock.local_addr().unwrap().port();
        (sock, port)
    }

    fn channel_config(name: &str, port: u16, default: bool) -> ChannelConfig {
        ChannelConfig {
            name: DltId::new(name),
            src_addr: "127.0.0.1".into(),
            src_port: 0,
            dst_addr: "127.0.0.1".into(),
            dst_port: port,
            multicast_interface: None,
            threshold: LogLevel::Verbose,
            default,
        }
    }

    fn test_router(ports: &[(u16, bool)]) -> Arc<Router> {
        let config = StaticConfig {
            ecu_id: DltId::new("ECU1"),
            statistics_period_secs: 10,
            output_enabled: true,
            quota_enforcement_enabled: false,
            quotas_kbps: HashMap::new(),
            channels: ports
                .iter()
                .enumerate()
                .map(|(i, &(port, default))| channel_config(&format!("CH{i:02}"), port, default))
                .collect(),
            nonverbose_messages: Vec::new(),
            default_threshold: LogLevel::Verbose,
        };
        Router::from_config(&config).unwrap()
    }

    fn count_datagrams(sock: &UdpSocket) -> usize {
        let mut buf = [0u8; 2048];
        let mut count = 0;
        while sock.recv(&mut buf).is_ok() {
            count += 1;
        }
        count
    }

    const APP: DltId = DltId(*b"APP1");
    const CTX: DltId = DltId(*b"CTX1");

    #[test]
    fn unassigned_records_hit_default_channel() {
        let (default_sock, default_port) = listener();
        let (other_sock, other_port) = listener();
        let router = test_router(&[(other_port, false), (default_port, true)]);

        router.filter_and_call(APP, CTX, LogLevel::Info, |channel| {
            channel.send_verbose(0, APP, CTX, LogLevel::Info, 0, b"x");
        });
        router.flush_all();

        assert_eq!(count_datagrams(&default_sock), 1);
        assert_eq!(count_datagrams(&other_sock), 0);
    }

    #[test]
    fn assignment_mask_selects_channels() {
        let (sock_a, port_a) = listener();
        let (sock_b, port_b) = listener();
        let router = test_router(&[(port_a, true), (port_b, false)]);

        router.set_channel_assignment(APP, CTX, DltId::new("CH01"), AssignmentAction::Add);
        router.filter_and_call(APP, CTX, LogLevel::Info, |channel| {
            channel.send_verbose(0, APP, CTX, LogLevel::Info, 0, b"x");
        });
        router.flush_all();

        assert_eq!(count_datagrams(&sock_a), 0);
        assert_eq!(count_datagrams(&sock_b), 1);

        // Removing the only assignment falls back to the default channel.
        router.set_channel_assignment(APP, CTX, DltId::new("CH01"), AssignmentAction::Remove);
        router.filter_and_call(APP, CTX, LogLevel::Info, |channel| {
            channel.send_verbose(0, APP, CTX, LogLevel::Info, 0, b"y");
        });
        router.flush_all();
        assert_eq!(count_datagrams(&sock_a), 1);
    }

    #[test]
    fn filtering_falls_back_through_wildcards() {
        let (sock, port) = listener();
        let router = test_router(&[(port, true)]);
        router.set_filtering(true);
        router.set_default_threshold(LogLevel::Off);
        router.set_log_level(DltId::wildcard(), CTX, LogLevel::Info);

        // (app, ctx) missing, (*, ctx) says Info: Debug rejected, Info passes.
        let mut calls = 0;
        router.filter_and_call(APP, CTX, LogLevel::Debug, |_| calls += 1);
        assert_eq!(calls, 0);
        router.filter_and_call(APP, CTX, LogLevel::Info, |_| calls += 1);
        assert_eq!(calls, 1);

        // Exact key beats the wildcard.
        router.set_log_level(APP, CTX, LogLevel::Fatal);
        router.filter_and_call(APP, CTX, LogLevel::Info, |_| calls += 1);
        assert_eq!(calls, 1);
        drop(sock);
    }

    #[test]
    fn quota_lookup_defaults_conservatively() {
        let (_sock, port) = listener();
        let mut quotas = HashMap::new();
        quotas.insert("KNOWN".to_string(), 500.0);
        let config = StaticConfig {
            ecu_id: DltId::new("ECU1"),
            statistics_period_secs: 10,
            output_enabled: true,
            quota_enforcement_enabled: true,
            quotas_kbps: quotas,
            channels: vec![channel_config("CH00", port, true)],
            nonverbose_messages: Vec::new(),
            default_threshold: LogLevel::Verbose,
        };
        let router = Router::from_config(&config).unwrap();
        assert_eq!(router.quota_for("KNOWN"), 500.0);
        assert_eq!(router.quota_for("UNKNOWN"), 1.0);
    }

    #[test]
    fn log_entry_roundtrip() {
        let encoded = LogEntry::encode(APP, CTX, LogLevel::Warn, 3, b"args");
        let entry = LogEntry::decode(&encoded).unwrap();
        assert_eq!(entry.app_id, APP);
        assert_eq!(entry.ctx_id, CTX);
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.noar, 3);
        assert_eq!(entry.payload, b"args");
        assert!(LogEntry::decode(b"short").is_none());
    }
}
