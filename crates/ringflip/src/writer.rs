//! Producer-side record store.

use crate::error::WriteError;
use crate::layout::RegionHeader;
use crate::mapping::Mapping;
use crate::record::{
    RecordHeader, TypeId, MAX_PAYLOAD_BYTES, RECORD_HEADER_BYTES, REGISTRATION_TYPE_ID,
};
use crate::ring::{AcquireGrant, AlternatingWriter, RawRing};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Writes framed records into the shared region.
///
/// All write methods are thread-safe, lock-free and wait-free; many producer
/// threads may call them in parallel. [`switch_for_read`](Self::switch_for_read)
/// is the one exception: it must stay on a single thread (the control-channel
/// thread answering acquire requests).
#[derive(Debug)]
pub struct ShmWriter {
    ring: AlternatingWriter,
    next_type_id: AtomicU16,
    // Keeps the read-write mapping alive; unmapped on drop.
    _mapping: Mapping,
}

impl ShmWriter {
    pub(crate) fn new(ring: RawRing, mapping: Mapping) -> Self {
        Self {
            ring: AlternatingWriter::new(ring),
            next_type_id: AtomicU16::new(0),
            _mapping: mapping,
        }
    }

    /// The shared region header (counters, detach flag).
    pub fn region(&self) -> &RegionHeader {
        self.ring.header()
    }

    /// Reserves space for one record, writes the header, runs `fill` on the
    /// payload span and releases.
    ///
    /// Payloads above [`MAX_PAYLOAD_BYTES`] are rejected with
    /// [`WriteError::InvalidSize`]. A full half yields
    /// [`WriteError::BufferFull`]. Both outcomes bump their region counter
    /// before returning, so ignoring the result loses no accounting.
    pub fn write_record<F>(
        &self,
        timestamp_ns: u64,
        type_id: TypeId,
        payload_len: usize,
        fill: F,
    ) -> Result<(), WriteError>
    where
        F: FnOnce(&mut [u8]),
    {
        let header = self.ring.header();
        if payload_len > MAX_PAYLOAD_BYTES {
            header.drops_invalid_size.fetch_add(1, Ordering::Relaxed);
            return Err(WriteError::InvalidSize { size: payload_len });
        }

        let total = (payload_len + RECORD_HEADER_BYTES) as u32;
        let Some(mut reservation) = self.ring.acquire(total) else {
            header.drops_buffer_full.fetch_add(1, Ordering::Relaxed);
            header
                .size_drops_buffer_full
                .fetch_add(u64::from(total), Ordering::Relaxed);
            return Err(WriteError::BufferFull { requested: total });
        };

        let entry = reservation.payload();
        RecordHeader {
            timestamp_ns,
            type_id,
        }
        .encode(entry);
        fill(&mut entry[RECORD_HEADER_BYTES..]);
        Ok(())
    }

    /// [`write_record`](Self::write_record) stamped with the current time.
    pub fn write_record_now<F>(
        &self,
        type_id: TypeId,
        payload_len: usize,
        fill: F,
    ) -> Result<(), WriteError>
    where
        F: FnOnce(&mut [u8]),
    {
        self.write_record(now_ns(), type_id, payload_len, fill)
    }

    /// Registers a record type and returns its freshly allocated id.
    ///
    /// The registration entry carries the id followed by `registration`
    /// verbatim. Returns `None` when the ring is full; the caller may retry
    /// later. Ids are allocated per process and never deduplicated by name:
    /// registering the same name twice yields two valid ids and the daemon
    /// accepts records under either.
    pub fn try_register_type(&self, registration: &[u8]) -> Option<TypeId> {
        let header = self.ring.header();
        if registration.is_empty() {
            header.drops_invalid_size.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut allocated = None;
        let payload_len = std::mem::size_of::<TypeId>() + registration.len();
        self.write_record(now_ns(), REGISTRATION_TYPE_ID, payload_len, |payload| {
            // Allocate only once the reservation succeeded, so failed
            // registrations do not burn ids.
            let id = self.allocate_type_id();
            payload[0..2].copy_from_slice(&id.to_le_bytes());
            payload[2..].copy_from_slice(registration);
            allocated = Some(id);
        })
        .ok()?;
        allocated
    }

    /// Bumps the counter for a registration the producer gave up on.
    pub fn note_registration_failure(&self) {
        self.ring
            .header()
            .drops_type_registration_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Flips the buffer active for writing; the grant names the half the
    /// daemon must drain once writers release it.
    ///
    /// Single caller only (the control-channel thread).
    pub fn switch_for_read(&self) -> AcquireGrant {
        self.ring.switch_for_read()
    }

    /// Marks the writer as detached (set-once), enabling the daemon's
    /// post-mortem drain of the active half.
    pub fn detach(&self) {
        self.ring
            .header()
            .writer_detached
            .store(1, Ordering::Release);
    }

    fn allocate_type_id(&self) -> TypeId {
        let id = self.next_type_id.fetch_add(1, Ordering::Relaxed);
        if id == REGISTRATION_TYPE_ID {
            // The sentinel is not a valid record type; wrap past it.
            self.next_type_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}
