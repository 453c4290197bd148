//! Daemon-side record store.

use crate::layout::RegionHeader;
use crate::mapping::Mapping;
use crate::record::{RecordHeader, SharedRecord, TypeRegistration, RECORD_HEADER_BYTES, REGISTRATION_TYPE_ID};
use crate::ring::{AcquireGrant, AlternatingReader, RawRing};
use std::sync::atomic::Ordering;

/// Drains framed records out of a producer's shared region.
///
/// Owned and driven exclusively by the session that represents the producer;
/// none of the methods are thread-safe.
#[derive(Debug)]
pub struct ShmReader {
    ring: AlternatingReader,
    /// Grant armed by the last acquire response, drained on the next call.
    armed: Option<u32>,
    /// Half the next acquire response is expected to name.
    expected_next: u32,
    local_detached: bool,
    finished_after_detach: bool,
    corrupt_entries: u64,
    // Keeps the read-only mapping alive; unmapped on drop.
    _mapping: Mapping,
}

impl ShmReader {
    pub(crate) fn new(ring: RawRing, mapping: Mapping) -> Self {
        let ring = AlternatingReader::new(ring);
        let expected_next = ring.switch_count();
        Self {
            ring,
            armed: None,
            expected_next,
            local_detached: false,
            finished_after_detach: false,
            corrupt_entries: 0,
            _mapping: mapping,
        }
    }

    /// The shared region header (counters, detach flag).
    pub fn region(&self) -> &RegionHeader {
        self.ring.header()
    }

    /// True once every writer that acquired on the granted half released it.
    pub fn is_half_released(&self, switch_count: u32) -> bool {
        self.ring.is_half_released(switch_count)
    }

    /// Best-effort bytes reserved in a half that producers may still be
    /// writing. A hint only.
    pub fn peek_pending_bytes(&self, switch_count: u32) -> u32 {
        self.ring.peek_pending_bytes(switch_count)
    }

    /// The half the next acquire response should name.
    pub fn expected_next(&self) -> u32 {
        self.expected_next
    }

    /// Arms the reader with a granted half.
    ///
    /// Returns the bytes waiting in the half, or `None` when the writers
    /// have not released it; that should not happen in steady state and the
    /// session surfaces it to diagnostics. The armed half is consumed by the
    /// next [`drain`](Self::drain).
    pub fn arm(&mut self, grant: AcquireGrant) -> Option<u32> {
        if !self.ring.is_half_released(grant.switch_count) {
            return None;
        }
        let bytes = self.ring.peek_pending_bytes(grant.switch_count);
        self.armed = Some(grant.switch_count);
        self.expected_next = grant.switch_count.wrapping_add(1);
        Some(bytes)
    }

    /// Drains the armed half, decoding each entry.
    ///
    /// Registration entries go to `on_type`, data entries to `on_record`.
    /// Returns the bytes consumed, or `None` when there was nothing armed
    /// and no detach pass to run. Once the writer is detached a final pass
    /// also covers the last-active half; after that every call returns
    /// `None`.
    pub fn drain<T, R>(&mut self, mut on_type: T, mut on_record: R) -> Option<u32>
    where
        T: FnMut(TypeRegistration<'_>),
        R: FnMut(SharedRecord<'_>),
    {
        if self.finished_after_detach {
            return None;
        }

        let mut consumed = None;

        if let Some(switch_count) = self.armed.take() {
            let bytes = self.drain_half(switch_count, &mut on_type, &mut on_record);
            consumed = Some(bytes);
        }

        if self.is_writer_detached() {
            let bytes = self.drain_half(self.expected_next, &mut on_type, &mut on_record);
            consumed = Some(consumed.unwrap_or(0) + bytes);
            self.finished_after_detach = true;
        }

        consumed
    }

    /// Marks the writer as gone locally and drains whatever remains,
    /// including the currently active half.
    pub fn drain_detached<T, R>(&mut self, on_type: T, on_record: R) -> Option<u32>
    where
        T: FnMut(TypeRegistration<'_>),
        R: FnMut(SharedRecord<'_>),
    {
        self.detach_local();
        self.drain(on_type, on_record)
    }

    /// Local mirror of the producer's detach flag.
    pub fn detach_local(&mut self) {
        self.local_detached = true;
    }

    /// True if the producer signalled detach or the daemon mirrored it.
    pub fn is_writer_detached(&self) -> bool {
        self.local_detached
            || self.ring.header().writer_detached.load(Ordering::Acquire) != 0
    }

    /// Entries skipped because their framing was rejected.
    pub fn corrupt_entries(&self) -> u64 {
        self.corrupt_entries
    }

    /// Records dropped producer-side because the ring was full.
    pub fn drops_buffer_full(&self) -> u64 {
        self.ring.header().drops_buffer_full.load(Ordering::Relaxed)
    }

    /// Bytes lost producer-side to buffer-full drops.
    pub fn size_drops_buffer_full(&self) -> u64 {
        self.ring
            .header()
            .size_drops_buffer_full
            .load(Ordering::Relaxed)
    }

    /// Records dropped producer-side for invalid sizes.
    pub fn drops_invalid_size(&self) -> u64 {
        self.ring.header().drops_invalid_size.load(Ordering::Relaxed)
    }

    /// Registrations the producer gave up on.
    pub fn drops_type_registration_failed(&self) -> u64 {
        self.ring
            .header()
            .drops_type_registration_failed
            .load(Ordering::Relaxed)
    }

    /// Total payload capacity of the ring (both halves).
    pub fn ring_size_bytes(&self) -> u64 {
        2 * u64::from(self.ring.header().half_len)
    }

    fn drain_half<T, R>(&mut self, switch_count: u32, on_type: &mut T, on_record: &mut R) -> u32
    where
        T: FnMut(TypeRegistration<'_>),
        R: FnMut(SharedRecord<'_>),
    {
        let mut linear = self.ring.linear_reader(switch_count);
        let written = linear.written_len();

        while let Some(entry) = linear.next_entry() {
            if entry.len() < RECORD_HEADER_BYTES {
                linear.note_corrupt();
                continue;
            }

            let header = RecordHeader::decode(entry);
            let payload = &entry[RECORD_HEADER_BYTES..];

            if header.type_id == REGISTRATION_TYPE_ID {
                if payload.len() < 2 {
                    linear.note_corrupt();
                    continue;
                }
                let type_id = u16::from_le_bytes([payload[0], payload[1]]);
                on_type(TypeRegistration {
                    type_id,
                    data: &payload[2..],
                });
            } else {
                on_record(SharedRecord { header, payload });
            }
        }

        self.corrupt_entries += linear.corrupt_entries();
        written
    }
}
