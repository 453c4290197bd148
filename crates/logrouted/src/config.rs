//! Static daemon configuration.
//!
//! The file is the only startup-fatal input: the daemon refuses to run
//! without a parseable channel list. Everything else (thresholds,
//! assignments, quotas) can be reconfigured at runtime through the router.

use crate::dlt::DltId;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// DLT log levels; smaller is more severe. A message passes a threshold
/// when `level <= threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off = 0,
    Fatal = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Debug = 5,
    Verbose = 6,
}

impl LogLevel {
    /// Raw wire value (also the atomic threshold representation).
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a wire value, saturating unknown values to `Verbose`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Off,
            1 => Self::Fatal,
            2 => Self::Error,
            3 => Self::Warn,
            4 => Self::Info,
            5 => Self::Debug,
            _ => Self::Verbose,
        }
    }
}

/// Descriptor for one non-verbose message id.
#[derive(Debug, Clone, Deserialize)]
pub struct NvMsgDescriptor {
    /// Type name producers register under.
    pub type_name: String,
    /// DLT message id emitted on the wire.
    pub message_id: u32,
    /// Application id the message is attributed to.
    pub app_id: DltId,
    /// Context id the message is attributed to.
    pub ctx_id: DltId,
    /// Severity used for filtering.
    pub log_level: LogLevel,
}

/// Lookup table from registered type names to non-verbose descriptors.
#[derive(Debug, Default)]
pub struct NvConfig {
    descriptors: HashMap<String, NvMsgDescriptor>,
}

impl NvConfig {
    pub fn new(descriptors: impl IntoIterator<Item = NvMsgDescriptor>) -> Self {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.type_name.clone(), d))
                .collect(),
        }
    }

    pub fn get(&self, type_name: &str) -> Option<&NvMsgDescriptor> {
        self.descriptors.get(type_name)
    }
}

/// One UDP fan-out channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Channel name (DLT id, at most four characters).
    pub name: DltId,
    /// Local address to bind.
    pub src_addr: String,
    /// Local port to bind (0 picks an ephemeral port).
    #[serde(default)]
    pub src_port: u16,
    /// Destination address.
    pub dst_addr: String,
    /// Destination port.
    pub dst_port: u16,
    /// Optional local interface address for multicast destinations.
    #[serde(default)]
    pub multicast_interface: Option<String>,
    /// Initial channel threshold.
    #[serde(default = "default_threshold")]
    pub threshold: LogLevel,
    /// Marks the channel that takes unassigned traffic.
    #[serde(default)]
    pub default: bool,
}

fn default_threshold() -> LogLevel {
    LogLevel::Verbose
}

fn default_stats_period_secs() -> u64 {
    10
}

/// Top-level static configuration.
#[derive(Debug, Deserialize)]
pub struct StaticConfig {
    /// ECU id stamped into every DLT header.
    pub ecu_id: DltId,
    /// Statistics series period in seconds.
    #[serde(default = "default_stats_period_secs")]
    pub statistics_period_secs: u64,
    /// Whether routing output starts enabled.
    #[serde(default = "default_true")]
    pub output_enabled: bool,
    /// Whether quota over-limit latches suppress forwarding.
    #[serde(default)]
    pub quota_enforcement_enabled: bool,
    /// Per-application quotas in KB/s; unlisted applications get the
    /// conservative 1 KB/s fallback.
    #[serde(default)]
    pub quotas_kbps: HashMap<String, f64>,
    /// The UDP channels; at least one required.
    pub channels: Vec<ChannelConfig>,
    /// Non-verbose message descriptors.
    #[serde(default)]
    pub nonverbose_messages: Vec<NvMsgDescriptor>,
    /// Default message threshold when filtering finds no per-key entry.
    #[serde(default = "default_threshold")]
    pub default_threshold: LogLevel,
}

fn default_true() -> bool {
    true
}

/// Startup-only configuration failures; the daemon refuses to run on any of
/// these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config declares no channels")]
    NoChannels,

    #[error("config declares {count} channels, at most {max} supported")]
    TooManyChannels { count: usize, max: usize },

    #[error("channel {name} failed to bind: {source}")]
    ChannelBind {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl StaticConfig {
    /// Loads and validates the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        if config.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        Ok(config)
    }

    /// Index of the default channel (the flagged one, else the first).
    pub fn default_channel_index(&self) -> usize {
        self.channels
            .iter()
            .position(|c| c.default)
            .unwrap_or(0)
    }
}
