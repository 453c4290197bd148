//! Record framing on top of the alternating ring.
//!
//! Each buffer entry is packed tight:
//!
//! ```text
//! len: u32 LE (total bytes including this field)
//! ‖ timestamp_ns: u64 LE ‖ type_id: u16 LE          <- RecordHeader
//! ‖ payload bytes
//! ```
//!
//! There is no per-entry alignment beyond the natural packing of the length
//! prefix, so the header is encoded field by field rather than cast.

/// Bytes of the `u32` length prefix.
pub const LEN_PREFIX_BYTES: usize = 4;

/// Encoded size of [`RecordHeader`].
pub const RECORD_HEADER_BYTES: usize = 10;

/// Largest accepted record payload (max DLT v1 message body).
pub const MAX_PAYLOAD_BYTES: usize = 65_500;

/// Sentinel type id marking a type-registration entry.
pub const REGISTRATION_TYPE_ID: u16 = u16::MAX;

/// Numeric key identifying a registered record schema within one region.
pub type TypeId = u16;

/// Fixed per-entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Producer-side capture timestamp, nanoseconds since the UNIX epoch.
    pub timestamp_ns: u64,
    /// Registered type of the payload, or [`REGISTRATION_TYPE_ID`].
    pub type_id: TypeId,
}

impl RecordHeader {
    /// Encodes into the first [`RECORD_HEADER_BYTES`] of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf[8..10].copy_from_slice(&self.type_id.to_le_bytes());
    }

    /// Decodes from the first [`RECORD_HEADER_BYTES`] of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`RECORD_HEADER_BYTES`]; callers check
    /// the entry length first.
    pub fn decode(buf: &[u8]) -> Self {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[0..8]);
        let mut id = [0u8; 2];
        id.copy_from_slice(&buf[8..10]);
        Self {
            timestamp_ns: u64::from_le_bytes(ts),
            type_id: u16::from_le_bytes(id),
        }
    }
}

/// A decoded record, borrowing its payload from the mapped half.
#[derive(Debug, Clone, Copy)]
pub struct SharedRecord<'a> {
    /// The fixed entry header.
    pub header: RecordHeader,
    /// Payload bytes as written by the producer.
    pub payload: &'a [u8],
}

/// A decoded type-registration entry.
///
/// The registration bytes are opaque to the store; the routing layer uses
/// them to associate the id with a type name and metadata. Registration is
/// not idempotent by name: the same name may map to several ids and the
/// daemon accepts all of them.
#[derive(Debug, Clone, Copy)]
pub struct TypeRegistration<'a> {
    /// Freshly allocated id the producer will tag records with.
    pub type_id: TypeId,
    /// Opaque registration bytes (name and metadata).
    pub data: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = RecordHeader {
            timestamp_ns: 0x0102_0304_0506_0708,
            type_id: 0xBEEF,
        };
        let mut buf = [0u8; RECORD_HEADER_BYTES];
        header.encode(&mut buf);
        assert_eq!(RecordHeader::decode(&buf), header);
    }

    #[test]
    fn header_is_little_endian_and_packed() {
        let header = RecordHeader {
            timestamp_ns: 1,
            type_id: 2,
        };
        let mut buf = [0xFFu8; RECORD_HEADER_BYTES];
        header.encode(&mut buf);
        assert_eq!(buf, [1, 0, 0, 0, 0, 0, 0, 0, 2, 0]);
    }
}
