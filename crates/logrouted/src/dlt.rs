//! DLT v1 header construction.
//!
//! This is the wire-format collaborator the channel sinks delegate to. Only
//! the header layout lives here; argument serialization inside verbose
//! payloads is the producers' business and passes through opaque.

use crate::config::LogLevel;
use serde::Deserialize;
use std::fmt;

/// Four-character DLT identifier (ECU, application, context, channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DltId(pub [u8; 4]);

impl DltId {
    /// Builds an id from a string, truncating or zero-padding to four bytes.
    pub fn new(id: &str) -> Self {
        let mut bytes = [0u8; 4];
        for (slot, byte) in bytes.iter_mut().zip(id.bytes()) {
            *slot = byte;
        }
        Self(bytes)
    }

    /// The all-zero wildcard id.
    pub fn wildcard() -> Self {
        Self([0; 4])
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == [0; 4]
    }
}

impl fmt::Display for DltId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.iter().take_while(|&&b| b != 0) {
            write!(f, "{}", char::from(b))?;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for DltId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(&raw))
    }
}

// Standard header type flags (version 1).
const HTYP_UEH: u8 = 0x01;
const HTYP_WEID: u8 = 0x04;
const HTYP_WTMS: u8 = 0x10;
const HTYP_VERS1: u8 = 0x20;

// MSIN: verbose bit plus log level in the MTIN nibble (MSTP = log).
const MSIN_VERB: u8 = 0x01;

/// Standard header + ECU/timestamp extra.
const BASE_HEADER_BYTES: usize = 4 + 4 + 4;

/// Extended header (MSIN, NOAR, APID, CTID).
const EXTENDED_HEADER_BYTES: usize = 10;

/// Full verbose header length.
pub const VERBOSE_HEADER_BYTES: usize = BASE_HEADER_BYTES + EXTENDED_HEADER_BYTES;

/// Full non-verbose header length, message id included.
pub const NONVERBOSE_HEADER_BYTES: usize = BASE_HEADER_BYTES + 4;

/// Converts a nanosecond UNIX timestamp to DLT 0.1 ms units.
pub fn dlt_timestamp(timestamp_ns: u64) -> u32 {
    (timestamp_ns / 100_000) as u32
}

fn write_base_header(
    buf: &mut [u8],
    htyp: u8,
    total_len: usize,
    msg_counter: u8,
    ecu: DltId,
    tmsp: u32,
) {
    buf[0] = htyp;
    buf[1] = msg_counter;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[4..8].copy_from_slice(&ecu.0);
    buf[8..12].copy_from_slice(&tmsp.to_be_bytes());
}

/// Writes a verbose-message header; returns [`VERBOSE_HEADER_BYTES`].
///
/// `payload_len` is the argument bytes following the header; the standard
/// header's length field covers header plus payload.
#[allow(clippy::too_many_arguments)]
pub fn write_verbose_header(
    buf: &mut [u8],
    payload_len: usize,
    msg_counter: u8,
    ecu: DltId,
    app_id: DltId,
    ctx_id: DltId,
    level: LogLevel,
    noar: u8,
    tmsp: u32,
) -> usize {
    let total = VERBOSE_HEADER_BYTES + payload_len;
    write_base_header(
        buf,
        HTYP_UEH | HTYP_WEID | HTYP_WTMS | HTYP_VERS1,
        total,
        msg_counter,
        ecu,
        tmsp,
    );
    buf[12] = MSIN_VERB | (level.as_u8() << 4);
    buf[13] = noar;
    buf[14..18].copy_from_slice(&app_id.0);
    buf[18..22].copy_from_slice(&ctx_id.0);
    VERBOSE_HEADER_BYTES
}

/// Writes a non-verbose header (message id included); returns
/// [`NONVERBOSE_HEADER_BYTES`].
pub fn write_nonverbose_header(
    buf: &mut [u8],
    payload_len: usize,
    msg_counter: u8,
    ecu: DltId,
    message_id: u32,
    tmsp: u32,
) -> usize {
    let total = NONVERBOSE_HEADER_BYTES + payload_len;
    write_base_header(buf, HTYP_WEID | HTYP_WTMS | HTYP_VERS1, total, msg_counter, ecu, tmsp);
    buf[12..16].copy_from_slice(&message_id.to_le_bytes());
    NONVERBOSE_HEADER_BYTES
}
