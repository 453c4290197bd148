//! UDP channel sink with DLT batching.
//!
//! Records are appended tight into four MTU-sized staging buffers; a buffer
//! closes when the next record would overflow [`UDP_MAX_PAYLOAD`], and a
//! batched multi-datagram send goes out once all four are used (or on
//! flush). Verbose and non-verbose records never share a datagram. Records
//! larger than one staging buffer bypass batching entirely and leave as a
//! single two-vector send.

use crate::config::{ChannelConfig, ConfigError, LogLevel, NvMsgDescriptor};
use crate::dlt::{
    dlt_timestamp, write_nonverbose_header, write_verbose_header, DltId, NONVERBOSE_HEADER_BYTES,
    VERBOSE_HEADER_BYTES,
};
use crate::udp::UdpOutput;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

const IPV4_HEADER_BYTES: usize = 20;
const UDP_HEADER_BYTES: usize = 8;
const MTU: usize = 1500;

/// Largest datagram payload that fits an untagged Ethernet frame.
pub const UDP_MAX_PAYLOAD: usize = MTU - IPV4_HEADER_BYTES - UDP_HEADER_BYTES;

/// Staging buffers batched into one `sendmmsg`.
pub const STAGING_BUFFERS: usize = 4;

/// File-transfer records sleep once every this many sends.
const FILE_TRANSFER_BURST: u64 = 5;
const FILE_TRANSFER_PACE: Duration = Duration::from_millis(5);

/// Per-kind send statistics, snapshot-and-cleared by the statistics tick.
#[derive(Debug, Default, Clone)]
pub struct ChannelStats {
    pub msg_count: u64,
    pub total_size: u64,
    pub send_failures: u64,
    pub send_errno_count: HashMap<String, u64>,
}

impl ChannelStats {
    fn record_failure(&mut self, err: &std::io::Error) {
        self.send_failures += 1;
        *self.send_errno_count.entry(err.to_string()).or_default() += 1;
    }

    fn clear(&mut self) {
        self.msg_count = 0;
        self.total_size = 0;
        self.send_failures = 0;
        self.send_errno_count.clear();
    }
}

struct Staging {
    mcnt: u8,
    buffers: Box<[[u8; UDP_MAX_PAYLOAD]; STAGING_BUFFERS]>,
    closed_lens: [usize; STAGING_BUFFERS],
    vector_index: usize,
    staged_len: usize,
    staging_verbose: bool,
    verbose_in_flight: u32,
    nonverbose_in_flight: u32,
    verbose: ChannelStats,
    nonverbose: ChannelStats,
    nv_message_id_bytes: HashMap<u32, u64>,
}

struct FtPacing {
    counter: u64,
    last: Instant,
}

/// One UDP fan-out destination with its own threshold and batching buffers.
///
/// The threshold may be mutated concurrently with send paths; everything
/// else is guarded by the staging mutex (sends run on the scheduler worker,
/// statistics on the statistics thread).
pub struct LogChannel {
    name: DltId,
    ecu: DltId,
    threshold: AtomicU8,
    out: UdpOutput,
    inner: Mutex<Staging>,
    ft_pacing: Mutex<FtPacing>,
}

impl LogChannel {
    /// Binds the channel's socket once and readies the staging buffers.
    pub fn open(config: &ChannelConfig, ecu: DltId) -> Result<Self, ConfigError> {
        fn bind_err<T>(
            name: DltId,
            result: Result<T, std::io::Error>,
        ) -> Result<T, ConfigError> {
            result.map_err(|source| ConfigError::ChannelBind {
                name: name.to_string(),
                source,
            })
        }

        let parse_addr = |addr: &str, port: u16| {
            format!("{addr}:{port}")
                .parse::<SocketAddr>()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        };

        let src = bind_err(config.name, parse_addr(&config.src_addr, config.src_port))?;
        let dst = bind_err(config.name, parse_addr(&config.dst_addr, config.dst_port))?;
        let multicast = match &config.multicast_interface {
            Some(raw) => Some(bind_err(
                config.name,
                raw.parse()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e)),
            )?),
            None => None,
        };

        let out = bind_err(config.name, UdpOutput::open(src, dst, multicast))?;

        Ok(Self {
            name: config.name,
            ecu,
            threshold: AtomicU8::new(config.threshold.as_u8()),
            out,
            inner: Mutex::new(Staging {
                mcnt: 0,
                buffers: Box::new([[0; UDP_MAX_PAYLOAD]; STAGING_BUFFERS]),
                closed_lens: [0; STAGING_BUFFERS],
                vector_index: 0,
                staged_len: 0,
                staging_verbose: false,
                verbose_in_flight: 0,
                nonverbose_in_flight: 0,
                verbose: ChannelStats::default(),
                nonverbose: ChannelStats::default(),
                nv_message_id_bytes: HashMap::new(),
            }),
            ft_pacing: Mutex::new(FtPacing {
                counter: 0,
                last: Instant::now(),
            }),
        })
    }

    pub fn name(&self) -> DltId {
        self.name
    }

    /// The locally bound source address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.out.local_addr()
    }

    pub fn threshold(&self) -> LogLevel {
        LogLevel::from_u8(self.threshold.load(Ordering::Relaxed))
    }

    pub fn set_threshold(&self, level: LogLevel) {
        self.threshold.store(level.as_u8(), Ordering::Relaxed);
    }

    /// Stages one verbose record.
    pub fn send_verbose(
        &self,
        timestamp_ns: u64,
        app_id: DltId,
        ctx_id: DltId,
        level: LogLevel,
        noar: u8,
        payload: &[u8],
    ) {
        if level.as_u8() > self.threshold.load(Ordering::Relaxed) {
            return;
        }
        let tmsp = dlt_timestamp(timestamp_ns);
        let full = VERBOSE_HEADER_BYTES + payload.len();

        let mut inner = self.inner.lock().unwrap();
        inner.verbose.msg_count += 1;
        inner.verbose.total_size += payload.len() as u64;
        inner.verbose_in_flight += 1;

        // Kinds must not share a datagram.
        if !inner.staging_verbose {
            self.send_udp(&mut inner, false);
            inner.staging_verbose = true;
        }

        if inner.staged_len + full > UDP_MAX_PAYLOAD {
            self.send_udp(&mut inner, false);
        }

        if full <= UDP_MAX_PAYLOAD {
            let mcnt = inner.mcnt;
            inner.mcnt = mcnt.wrapping_add(1);
            let idx = inner.vector_index;
            let off = inner.staged_len;
            let dest = &mut inner.buffers[idx][off..off + full];
            write_verbose_header(
                dest,
                payload.len(),
                mcnt,
                self.ecu,
                app_id,
                ctx_id,
                level,
                noar,
                tmsp,
            );
            dest[VERBOSE_HEADER_BYTES..].copy_from_slice(payload);
            inner.staged_len = off + full;
        } else {
            // Single record bigger than the staging buffer: flush what is
            // staged, then one two-vector send.
            self.send_udp(&mut inner, true);
            let mcnt = inner.mcnt;
            inner.mcnt = mcnt.wrapping_add(1);
            let mut header = [0u8; VERBOSE_HEADER_BYTES];
            write_verbose_header(
                &mut header,
                payload.len(),
                mcnt,
                self.ecu,
                app_id,
                ctx_id,
                level,
                noar,
                tmsp,
            );
            if let Err(err) = self.out.send_vectored(&[&header, payload]) {
                inner.verbose.record_failure(&err);
            }
            inner.verbose_in_flight = inner.verbose_in_flight.saturating_sub(1);
        }
    }

    /// Stages one non-verbose record.
    pub fn send_nonverbose(&self, desc: &NvMsgDescriptor, timestamp_ns: u64, payload: &[u8]) {
        if desc.log_level.as_u8() > self.threshold.load(Ordering::Relaxed) {
            return;
        }
        let tmsp = dlt_timestamp(timestamp_ns);
        let full = NONVERBOSE_HEADER_BYTES + payload.len();

        let mut inner = self.inner.lock().unwrap();
        inner.nonverbose.msg_count += 1;
        inner.nonverbose.total_size += payload.len() as u64;
        inner.nonverbose_in_flight += 1;
        *inner
            .nv_message_id_bytes
            .entry(desc.message_id)
            .or_default() += payload.len() as u64;

        if inner.staging_verbose {
            self.send_udp(&mut inner, false);
            inner.staging_verbose = false;
        }

        if inner.staged_len + full > UDP_MAX_PAYLOAD {
            self.send_udp(&mut inner, false);
        }

        if full <= UDP_MAX_PAYLOAD {
            let mcnt = inner.mcnt;
            inner.mcnt = mcnt.wrapping_add(1);
            let idx = inner.vector_index;
            let off = inner.staged_len;
            let dest = &mut inner.buffers[idx][off..off + full];
            write_nonverbose_header(dest, payload.len(), mcnt, self.ecu, desc.message_id, tmsp);
            dest[NONVERBOSE_HEADER_BYTES..].copy_from_slice(payload);
            inner.staged_len = off + full;
        } else {
            self.send_udp(&mut inner, true);
            let mcnt = inner.mcnt;
            inner.mcnt = mcnt.wrapping_add(1);
            let mut header = [0u8; NONVERBOSE_HEADER_BYTES];
            write_nonverbose_header(
                &mut header,
                payload.len(),
                mcnt,
                self.ecu,
                desc.message_id,
                tmsp,
            );
            if let Err(err) = self.out.send_vectored(&[&header, payload]) {
                inner.nonverbose.record_failure(&err);
            }
            inner.nonverbose_in_flight = inner.nonverbose_in_flight.saturating_sub(1);
        }
    }

    /// Sends one file-transfer record, paced so bulk transfers leave the
    /// other traffic breathing room. Always flushes and bypasses batching.
    #[allow(clippy::too_many_arguments)]
    pub fn send_file_transfer(
        &self,
        timestamp_ns: u64,
        app_id: DltId,
        ctx_id: DltId,
        level: LogLevel,
        noar: u8,
        payload: &[u8],
    ) {
        let sleep_for = {
            let mut pacing = self.ft_pacing.lock().unwrap();
            pacing.counter += 1;
            if pacing.counter % FILE_TRANSFER_BURST == 0 {
                let elapsed = pacing.last.elapsed();
                (elapsed < FILE_TRANSFER_PACE).then(|| FILE_TRANSFER_PACE - elapsed)
            } else {
                None
            }
        };
        if let Some(wait) = sleep_for {
            std::thread::sleep(wait);
        }

        let tmsp = dlt_timestamp(timestamp_ns);
        {
            let mut inner = self.inner.lock().unwrap();
            self.send_udp(&mut inner, true);

            let mcnt = inner.mcnt;
            inner.mcnt = mcnt.wrapping_add(1);
            let mut header = [0u8; VERBOSE_HEADER_BYTES];
            write_verbose_header(
                &mut header,
                payload.len(),
                mcnt,
                self.ecu,
                app_id,
                ctx_id,
                level,
                noar,
                tmsp,
            );
            if let Err(err) = self.out.send_vectored(&[&header, payload]) {
                inner.verbose.record_failure(&err);
            }
            inner.verbose.msg_count += 1;
            inner.verbose.total_size += (payload.len() + VERBOSE_HEADER_BYTES) as u64;
        }
        self.ft_pacing.lock().unwrap().last = Instant::now();
    }

    /// Flushes everything staged.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.send_udp(&mut inner, true);
    }

    /// Closes the current staging buffer and, when flushing or all buffers
    /// are used, emits the batch as one multi-datagram send.
    fn send_udp(&self, inner: &mut Staging, flush: bool) {
        if inner.staged_len > 0 {
            inner.closed_lens[inner.vector_index] = inner.staged_len;
            inner.vector_index += 1;
            inner.staged_len = 0;
        }

        if (flush && inner.vector_index > 0) || inner.vector_index >= STAGING_BUFFERS {
            let count = inner.vector_index;
            let result = {
                let mut datagrams: [&[u8]; STAGING_BUFFERS] = [&[]; STAGING_BUFFERS];
                for i in 0..count {
                    datagrams[i] = &inner.buffers[i][..inner.closed_lens[i]];
                }
                self.out.send_batch(&datagrams[..count])
            };
            if let Err(err) = result {
                if inner.verbose_in_flight > 0 {
                    inner.verbose.record_failure(&err);
                }
                if inner.nonverbose_in_flight > 0 {
                    inner.nonverbose.record_failure(&err);
                }
            }
            inner.vector_index = 0;
            inner.verbose_in_flight = 0;
            inner.nonverbose_in_flight = 0;
        }
    }

    /// Logs one statistics series for the channel and clears the period
    /// accumulators.
    pub fn show_stats(&self, period_secs: u64) {
        let mut inner = self.inner.lock().unwrap();
        let denominator = (period_secs.max(1)) * 1024;

        for (kind, stats) in [
            ("verbose", &inner.verbose),
            ("non-verbose", &inner.nonverbose),
        ] {
            let mut failures = String::new();
            for (errno, count) in &stats.send_errno_count {
                failures.push_str(&format!(" {count} times due to \"{errno}\";"));
            }
            info!(
                channel = %self.name,
                kind,
                count = stats.msg_count,
                size = stats.total_size,
                kib_per_s = stats.total_size / denominator,
                send_failures = stats.send_failures,
                errors = %failures,
                "channel statistics"
            );
        }

        let mut by_id: Vec<(u32, u64)> = inner
            .nv_message_id_bytes
            .iter()
            .map(|(&id, &bytes)| (id, bytes))
            .collect();
        by_id.sort_by(|a, b| b.1.cmp(&a.1));
        if !by_id.is_empty() {
            let mut line = String::new();
            for (id, bytes) in by_id {
                line.push_str(&format!(
                    "msgid:{id} bytes:{bytes} ({}kiB/s) | ",
                    bytes / denominator
                ));
            }
            info!(channel = %self.name, %line, "non-verbose bytes by message id");
        }

        inner.verbose.clear();
        inner.nonverbose.clear();
        inner.nv_message_id_bytes.clear();
    }

    /// Current per-kind statistics snapshot (tests and diagnostics).
    pub fn stats_snapshot(&self) -> (ChannelStats, ChannelStats) {
        let inner = self.inner.lock().unwrap();
        (inner.verbose.clone(), inner.nonverbose.clone())
    }
}
