//! Per-source session: tick state machine, quota, statistics.

use crate::parser::LogParser;
use ringflip::{AcquireGrant, ShmReader};
use ringflip_ipc::{ControlMessage, Sender};
use std::cell::RefCell;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Regulates the minimal polling frequency towards an idle client. Even
/// with an empty buffer an acquire request goes out at least once per this
/// many ticks, keeping the keepalive channel alive so a dead client's
/// shared memory cannot leak.
pub const IDLE_TICKS_BEFORE_KEEPALIVE: u32 = 10;

/// How the daemon reaches a client: the datagram control channel, or a
/// legacy unix-stream connection that signals an acquire with a single
/// byte. Dispatch is by match, not by virtual call.
pub enum SessionHandle {
    Ipc(Sender),
    Stream(UnixStream),
}

impl SessionHandle {
    fn request_acquire(&self) -> bool {
        match self {
            Self::Ipc(sender) => sender.send(&ControlMessage::AcquireRequest).is_ok(),
            Self::Stream(stream) => (&*stream).write_all(b"<").is_ok(),
        }
    }
}

struct LocalData {
    enabled_logging: bool,
    detach_on_closed_processed: bool,
    last_call: Instant,
    time_between_calls: Duration,
    time_to_process: Duration,
}

struct CommandData {
    acquire_requested: bool,
    ticks_without_write: u32,
    expected_next_block: Option<u32>,
    pending_grant: Option<AcquireGrant>,
    command_detach_on_closed: bool,
}

struct StatsData {
    quota_kbps: f64,
    quota_enforcement_enabled: bool,
    quota_overlimit_detected: bool,
    message_count: u64,
    total_size: u64,
    time_spent_reading: Duration,
    transport_delay: Duration,
    message_count_dropped: u64,
    size_dropped: u64,
    message_count_dropped_invalid_size: u64,
    corrupt_entries: u64,
    count_acquire_requests: u64,
    max_bytes_in_buffer: u64,
    start: Instant,
}

/// Daemon-side state for one connected producer.
///
/// All ticks run on the single scheduler worker; the mutexes only cover the
/// short cross-thread touch points (acquire responses from the receiver
/// thread, statistics from the statistics thread).
pub struct SourceSession {
    name: String,
    reader: Mutex<ShmReader>,
    parser: Mutex<LogParser>,
    handle: SessionHandle,
    local: Mutex<LocalData>,
    command: Mutex<CommandData>,
    stats: Mutex<StatsData>,
    send_failed: AtomicBool,
    fast_reschedule: AtomicBool,
}

impl SourceSession {
    pub fn new(
        name: String,
        reader: ShmReader,
        parser: LogParser,
        handle: SessionHandle,
        quota_kbps: f64,
        quota_enforcement_enabled: bool,
        enabled_logging: bool,
    ) -> Self {
        let mut quota_kbps = quota_kbps;
        if name == "DR" {
            // The router's own log source must never throttle itself.
            info!(
                old_quota = quota_kbps,
                "overriding quota for the router source to unlimited"
            );
            quota_kbps = f64::MAX;
        }

        Self {
            name,
            reader: Mutex::new(reader),
            parser: Mutex::new(parser),
            handle,
            local: Mutex::new(LocalData {
                enabled_logging,
                detach_on_closed_processed: false,
                last_call: Instant::now(),
                time_between_calls: Duration::ZERO,
                time_to_process: Duration::ZERO,
            }),
            command: Mutex::new(CommandData {
                acquire_requested: false,
                ticks_without_write: 0,
                expected_next_block: None,
                pending_grant: None,
                command_detach_on_closed: false,
            }),
            stats: Mutex::new(StatsData {
                quota_kbps,
                quota_enforcement_enabled,
                quota_overlimit_detected: false,
                message_count: 0,
                total_size: 0,
                time_spent_reading: Duration::ZERO,
                transport_delay: Duration::ZERO,
                message_count_dropped: 0,
                size_dropped: 0,
                message_count_dropped_invalid_size: 0,
                corrupt_entries: 0,
                count_acquire_requests: 0,
                max_bytes_in_buffer: 0,
                start: Instant::now(),
            }),
            send_failed: AtomicBool::new(false),
            fast_reschedule: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One scheduler visit.
    ///
    /// Always returns `false`: the session never demands an immediate
    /// re-run. The internal fast-reschedule hint (a pending grant the
    /// writers have not released yet, or a fresh acquire in flight) is
    /// surfaced separately through [`take_fast_reschedule`](Self::take_fast_reschedule).
    pub fn tick(&self) -> bool {
        if self.local.lock().unwrap().detach_on_closed_processed {
            return false;
        }

        let mut needs_fast = false;
        let acquire_finalized = self.try_finalize_acquisition(&mut needs_fast);

        let start = Instant::now();
        let mut message_count = 0u64;
        let mut bytes_in_buffer = 0u64;
        let mut transport_delay = Duration::ZERO;

        self.process_and_route(
            &mut message_count,
            &mut transport_delay,
            &mut bytes_in_buffer,
            acquire_finalized,
            &mut needs_fast,
        );

        self.update_stats(message_count, bytes_in_buffer, transport_delay, start);
        self.check_quota();

        self.fast_reschedule.store(needs_fast, Ordering::Relaxed);
        false
    }

    /// Stores the granted half; the next tick finalizes it once the
    /// writers released. Called from the receiver thread.
    pub fn on_acquire_response(&self, grant: AcquireGrant) {
        let mut command = self.command.lock().unwrap();
        command.pending_grant = Some(grant);
        command.expected_next_block = Some(grant.switch_count.wrapping_add(1));
    }

    /// Latches the detach command; the next tick drains post-mortem data
    /// and retires the session.
    pub fn on_closed_by_peer(&self) {
        self.command.lock().unwrap().command_detach_on_closed = true;
    }

    /// True once the post-mortem drain ran; the session wants no further
    /// scheduling.
    pub fn detach_processed(&self) -> bool {
        self.local.lock().unwrap().detach_on_closed_processed
    }

    /// True when the producer signalled it will write no more.
    pub fn is_source_closed(&self) -> bool {
        if self.local.lock().unwrap().detach_on_closed_processed {
            return false;
        }
        self.reader.lock().unwrap().is_writer_detached()
    }

    /// Takes the failed-send latch (the peer is gone).
    pub fn take_send_failure(&self) -> bool {
        self.send_failed.swap(false, Ordering::Relaxed)
    }

    /// Takes the internal wake hint left by the last tick.
    pub fn take_fast_reschedule(&self) -> bool {
        self.fast_reschedule.swap(false, Ordering::Relaxed)
    }

    fn try_finalize_acquisition(&self, needs_fast: &mut bool) -> bool {
        let pending = self.command.lock().unwrap().pending_grant;
        let Some(grant) = pending else {
            return false;
        };

        let mut reader = self.reader.lock().unwrap();
        if reader.is_half_released(grant.switch_count) {
            if reader.arm(grant).is_none() {
                warn!(name = %self.name, "granted half not released; client channel may be blocked");
            }
            drop(reader);
            self.command.lock().unwrap().pending_grant = None;
            true
        } else {
            *needs_fast = true;
            false
        }
    }

    fn process_and_route(
        &self,
        message_count: &mut u64,
        transport_delay: &mut Duration,
        bytes_in_buffer: &mut u64,
        acquire_finalized: bool,
        needs_fast: &mut bool,
    ) {
        let now = Instant::now();
        {
            let mut local = self.local.lock().unwrap();
            local.time_between_calls = now - local.last_call;
            local.last_call = now;
        }

        let quota_exceeded = self.stats.lock().unwrap().quota_overlimit_detected;

        {
            let mut reader = self.reader.lock().unwrap();
            let mut parser_guard = self.parser.lock().unwrap();
            let parser = RefCell::new(&mut *parser_guard);
            let consumed = reader.drain(
                |registration| parser.borrow_mut().add_incoming_type(&registration),
                |record| {
                    // Over quota: keep consuming so the ring never stalls,
                    // but stop dispatching.
                    if quota_exceeded {
                        return;
                    }
                    let received_ns = now_ns();
                    parser.borrow_mut().parse_record(&record);
                    *message_count += 1;
                    let delay = Duration::from_nanos(
                        received_ns.saturating_sub(record.header.timestamp_ns),
                    );
                    if delay > *transport_delay {
                        *transport_delay = delay;
                    }
                },
            );
            if let Some(bytes) = consumed {
                *bytes_in_buffer = u64::from(bytes);
            }
        }

        let detach_needed = self.command.lock().unwrap().command_detach_on_closed;
        if detach_needed {
            self.local.lock().unwrap().detach_on_closed_processed = true;
            self.process_detached(bytes_in_buffer);
        }

        let enabled_logging = self.local.lock().unwrap().enabled_logging;
        {
            let mut command = self.command.lock().unwrap();
            if acquire_finalized {
                command.acquire_requested = false;
                command.ticks_without_write = 0;
            } else if !command.acquire_requested && enabled_logging && !detach_needed {
                let send_now = match command.expected_next_block {
                    Some(block) => {
                        // Best-effort peek on a half producers may still be
                        // writing.
                        let pending = self.reader.lock().unwrap().peek_pending_bytes(block);
                        pending > 0 || command.ticks_without_write > IDLE_TICKS_BEFORE_KEEPALIVE
                    }
                    None => true,
                };
                if send_now {
                    command.acquire_requested = self.request_acquire();
                    *needs_fast = command.acquire_requested;
                } else {
                    command.ticks_without_write += 1;
                }
            }
        }

        self.local.lock().unwrap().time_to_process = now.elapsed();
    }

    fn process_detached(&self, bytes_in_buffer: &mut u64) {
        let mut reader = self.reader.lock().unwrap();
        let mut parser_guard = self.parser.lock().unwrap();
        let parser = RefCell::new(&mut *parser_guard);
        let consumed = reader.drain_detached(
            |registration| parser.borrow_mut().add_incoming_type(&registration),
            |record| parser.borrow_mut().parse_record(&record),
        );
        if let Some(bytes) = consumed {
            *bytes_in_buffer = u64::from(bytes);
        }
        error!(name = %self.name, bytes = ?consumed, "detached logs processed");
    }

    fn request_acquire(&self) -> bool {
        let ok = self.handle.request_acquire();
        if ok {
            self.stats.lock().unwrap().count_acquire_requests += 1;
        } else {
            self.send_failed.store(true, Ordering::Relaxed);
        }
        ok
    }

    fn update_stats(
        &self,
        message_count: u64,
        bytes_in_buffer: u64,
        transport_delay: Duration,
        start: Instant,
    ) {
        let reader = self.reader.lock().unwrap();
        let dropped = reader.drops_buffer_full();
        let size_dropped = reader.size_drops_buffer_full();
        let dropped_invalid = reader.drops_invalid_size();
        let corrupt = reader.corrupt_entries();
        drop(reader);

        let mut stats = self.stats.lock().unwrap();
        if dropped != stats.message_count_dropped {
            error!(
                name = %self.name,
                messages = dropped - stats.message_count_dropped,
                bytes = size_dropped - stats.size_dropped,
                "message drop detected: buffer full"
            );
            stats.message_count_dropped = dropped;
            stats.size_dropped = size_dropped;
        }
        if dropped_invalid != stats.message_count_dropped_invalid_size {
            error!(
                name = %self.name,
                messages = dropped_invalid - stats.message_count_dropped_invalid_size,
                "message drop detected: invalid size"
            );
            stats.message_count_dropped_invalid_size = dropped_invalid;
        }
        if corrupt != stats.corrupt_entries {
            error!(
                name = %self.name,
                entries = corrupt - stats.corrupt_entries,
                "corrupt ring entries skipped"
            );
            stats.corrupt_entries = corrupt;
        }

        stats.message_count += message_count;
        stats.total_size += bytes_in_buffer;
        stats.max_bytes_in_buffer = stats.max_bytes_in_buffer.max(bytes_in_buffer);
        stats.transport_delay = stats.transport_delay.max(transport_delay);
        stats.time_spent_reading += start.elapsed();
    }

    fn check_quota(&self) {
        let mut stats = self.stats.lock().unwrap();
        if stats.quota_overlimit_detected || !stats.quota_enforcement_enabled {
            return;
        }

        let elapsed_ms = stats.start.elapsed().as_millis() as u64;
        if elapsed_ms == 0 {
            error!(
                name = %self.name,
                "zero statistics window; data rate unknown, quota enforcement not applied"
            );
            return;
        }

        let rate_kbps = stats.total_size as f64 * 1000.0 / 1024.0 / elapsed_ms as f64;
        if rate_kbps > stats.quota_kbps {
            error!(
                name = %self.name,
                rate_kbps,
                quota_kbps = stats.quota_kbps,
                "exceeded the quota; enforcement set"
            );
            stats.quota_overlimit_detected = true;
        }
    }

    /// Logs one statistics series line and clears the period accumulators,
    /// including the quota over-limit latch.
    pub fn show_stats(&self) {
        let ring_size_bytes = self.reader.lock().unwrap().ring_size_bytes();
        let (time_between_calls, time_to_process) = {
            let local = self.local.lock().unwrap();
            (local.time_between_calls, local.time_to_process)
        };

        let mut stats = self.stats.lock().unwrap();
        let now = Instant::now();
        let elapsed_ms = (now - stats.start).as_millis().max(1) as u64;
        let rate_kbps = stats.total_size as f64 * 1000.0 / 1024.0 / elapsed_ms as f64;

        let buffer_size_kb = ring_size_bytes / 1024 / 2;
        let mut watermark_kb = stats.max_bytes_in_buffer / 1024;
        if stats.message_count_dropped > 0 {
            watermark_kb = buffer_size_kb;
        }

        info!(
            name = %self.name,
            count = stats.message_count,
            size = stats.total_size,
            rate_kbps,
            quota_kbps = stats.quota_kbps,
            quota_enforced = stats.quota_overlimit_detected,
            read_time_us = stats.time_spent_reading.as_micros() as u64,
            transport_delay_us = stats.transport_delay.as_micros() as u64,
            time_between_ticks_us = time_between_calls.as_micros() as u64,
            time_to_process_us = time_to_process.as_micros() as u64,
            watermark_kb,
            buffer_size_kb,
            dropped_accumulated = stats.message_count_dropped,
            acquire_requests = stats.count_acquire_requests,
            "source statistics"
        );

        if stats.quota_enforcement_enabled && rate_kbps > stats.quota_kbps {
            error!(
                name = %self.name,
                rate_kbps,
                quota_kbps = stats.quota_kbps,
                "exceeded the quota"
            );
        }

        stats.start = now;
        stats.message_count = 0;
        stats.total_size = 0;
        stats.time_spent_reading = Duration::ZERO;
        stats.transport_delay = Duration::ZERO;
        if stats.quota_overlimit_detected {
            stats.quota_overlimit_detected = false;
            info!(name = %self.name, "clear quota enforcement");
        }
    }
}

impl Drop for SourceSession {
    fn drop(&mut self) {
        let processed = self
            .local
            .get_mut()
            .map(|local| local.detach_on_closed_processed)
            .unwrap_or(true);
        if !processed {
            if let (Ok(reader), Ok(parser_ref)) = (self.reader.get_mut(), self.parser.get_mut()) {
                let parser = RefCell::new(parser_ref);
                let _ = reader.drain_detached(
                    |registration| parser.borrow_mut().add_incoming_type(&registration),
                    |record| parser.borrow_mut().parse_record(&record),
                );
            }
        }
        info!(name = %self.name, "cleaning up source session");
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}
