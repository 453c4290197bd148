//! Control-channel wire messages.
//!
//! Every message is one tag byte followed by a fixed-size payload, at most
//! [`MAX_MESSAGE_BYTES`] on the wire. Multi-byte fields are little-endian.
//! The sender's pid is not part of the payload; the transport delivers it as
//! socket credentials.

use crate::error::WireError;
use ringflip::AcquireGrant;

/// Upper bound for any encoded control message.
pub const MAX_MESSAGE_BYTES: usize = 17;

const TAG_CONNECT: u8 = 1;
const TAG_ACQUIRE_REQUEST: u8 = 2;
const TAG_ACQUIRE_RESPONSE: u8 = 3;

const CONNECT_LEN: usize = 16;
const ACQUIRE_REQUEST_LEN: usize = 1;
const ACQUIRE_RESPONSE_LEN: usize = 5;

/// Identity advertised by a producer when it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectMessage {
    /// Four-character application id (padded with zeroes).
    pub app_id: [u8; 4],
    /// Uid the producer runs under; part of the static identifier.
    pub uid: u32,
    /// True when the producer uses a random dynamic identifier.
    pub use_dynamic_id: bool,
    /// The random identifier suffix (valid when `use_dynamic_id`).
    pub random_suffix: [u8; 6],
}

impl ConnectMessage {
    /// The receiver-name stem this identity binds to, also the region file
    /// name stem (`<stem>.shmem`).
    pub fn identifier(&self) -> String {
        if self.use_dynamic_id {
            let suffix: String = self
                .random_suffix
                .iter()
                .map(|&b| char::from(b))
                .collect();
            format!("logging-{suffix}")
        } else {
            let app: String = self
                .app_id
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| char::from(b))
                .collect();
            format!("logging.{app}.{}", self.uid)
        }
    }
}

/// The three control-channel messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client → daemon: advertise identity, ask for a session.
    Connect(ConnectMessage),
    /// Daemon → client: please switch your ring so I can drain it.
    AcquireRequest,
    /// Client → daemon: the retired half the daemon must read.
    AcquireResponse(AcquireGrant),
}

impl ControlMessage {
    /// Encodes into `buf`, returning the wire length.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`MAX_MESSAGE_BYTES`].
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        match self {
            Self::Connect(connect) => {
                buf[0] = TAG_CONNECT;
                buf[1..5].copy_from_slice(&connect.app_id);
                buf[5..9].copy_from_slice(&connect.uid.to_le_bytes());
                buf[9] = u8::from(connect.use_dynamic_id);
                buf[10..16].copy_from_slice(&connect.random_suffix);
                CONNECT_LEN
            }
            Self::AcquireRequest => {
                buf[0] = TAG_ACQUIRE_REQUEST;
                ACQUIRE_REQUEST_LEN
            }
            Self::AcquireResponse(grant) => {
                buf[0] = TAG_ACQUIRE_RESPONSE;
                buf[1..5].copy_from_slice(&grant.switch_count.to_le_bytes());
                ACQUIRE_RESPONSE_LEN
            }
        }
    }

    /// Decodes one datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (&tag, rest) = buf.split_first().ok_or(WireError::Truncated { len: 0 })?;
        match tag {
            TAG_CONNECT => {
                if buf.len() < CONNECT_LEN {
                    return Err(WireError::Truncated { len: buf.len() });
                }
                let mut app_id = [0u8; 4];
                app_id.copy_from_slice(&rest[0..4]);
                let uid = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
                let use_dynamic_id = rest[8] != 0;
                let mut random_suffix = [0u8; 6];
                random_suffix.copy_from_slice(&rest[9..15]);
                Ok(Self::Connect(ConnectMessage {
                    app_id,
                    uid,
                    use_dynamic_id,
                    random_suffix,
                }))
            }
            TAG_ACQUIRE_REQUEST => Ok(Self::AcquireRequest),
            TAG_ACQUIRE_RESPONSE => {
                if buf.len() < ACQUIRE_RESPONSE_LEN {
                    return Err(WireError::Truncated { len: buf.len() });
                }
                let switch_count = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
                Ok(Self::AcquireResponse(AcquireGrant { switch_count }))
            }
            tag => Err(WireError::BadTag { tag }),
        }
    }
}

/// Pads or truncates an application name to its wire form.
pub fn app_id_bytes(app_id: &str) -> [u8; 4] {
    let mut bytes = [0u8; 4];
    for (slot, byte) in bytes.iter_mut().zip(app_id.bytes()) {
        *slot = byte;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_roundtrip() {
        let msg = ControlMessage::Connect(ConnectMessage {
            app_id: *b"MYAP",
            uid: 1000,
            use_dynamic_id: false,
            random_suffix: [0; 6],
        });
        let mut buf = [0u8; MAX_MESSAGE_BYTES];
        let len = msg.encode(&mut buf);
        assert_eq!(len, CONNECT_LEN);
        assert_eq!(ControlMessage::decode(&buf[..len]).unwrap(), msg);
    }

    #[test]
    fn acquire_pair_roundtrip() {
        let mut buf = [0u8; MAX_MESSAGE_BYTES];

        let len = ControlMessage::AcquireRequest.encode(&mut buf);
        assert_eq!(len, 1);
        assert_eq!(
            ControlMessage::decode(&buf[..len]).unwrap(),
            ControlMessage::AcquireRequest
        );

        let response = ControlMessage::AcquireResponse(AcquireGrant { switch_count: 41 });
        let len = response.encode(&mut buf);
        assert_eq!(len, 5);
        assert_eq!(ControlMessage::decode(&buf[..len]).unwrap(), response);
    }

    #[test]
    fn every_message_fits_the_wire_bound() {
        let mut buf = [0u8; MAX_MESSAGE_BYTES];
        let messages = [
            ControlMessage::Connect(ConnectMessage {
                app_id: *b"ABCD",
                uid: u32::MAX,
                use_dynamic_id: true,
                random_suffix: *b"a1b2c3",
            }),
            ControlMessage::AcquireRequest,
            ControlMessage::AcquireResponse(AcquireGrant {
                switch_count: u32::MAX,
            }),
        ];
        for msg in messages {
            assert!(msg.encode(&mut buf) <= MAX_MESSAGE_BYTES);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            ControlMessage::decode(&[]),
            Err(WireError::Truncated { .. })
        ));
        assert!(matches!(
            ControlMessage::decode(&[9, 0, 0]),
            Err(WireError::BadTag { tag: 9 })
        ));
        assert!(matches!(
            ControlMessage::decode(&[TAG_CONNECT, 1, 2]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn identifier_forms() {
        let static_id = ConnectMessage {
            app_id: *b"AP\0\0",
            uid: 1000,
            use_dynamic_id: false,
            random_suffix: [0; 6],
        };
        assert_eq!(static_id.identifier(), "logging.AP.1000");

        let dynamic_id = ConnectMessage {
            app_id: [0; 4],
            uid: 0,
            use_dynamic_id: true,
            random_suffix: *b"x9y8z7",
        };
        assert_eq!(dynamic_id.identifier(), "logging-x9y8z7");
    }
}
