//! Fixed-size message header.
//!
//! Every message starts with exactly 24 bytes, all fields big-endian:
//! protocol major (u32), protocol minor (u32), type (u32), id (u64),
//! payload length (u32). The payload follows immediately; there is no other
//! framing.

use bytes::{Buf, BufMut};

use crate::errors::{ProtocolError, Result};

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Protocol major version
    pub major: u32,
    /// Protocol minor version
    pub minor: u32,
    /// Message type (see [`crate::types`])
    pub msg_type: u32,
    /// Message id, mirrored verbatim in the result
    pub id: u64,
    /// Payload length in bytes
    pub payload_len: u32,
}

impl MessageHeader {
    /// Size of the encoded header (24 bytes).
    pub const SIZE: usize = 24;

    /// Maximum payload length (102 MiB).
    pub const MAX_PAYLOAD_SIZE: u32 = 102 * 1024 * 1024;

    /// Parse a header from exactly [`Self::SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::ShortBuffer`] if fewer than 24 bytes are available
    /// - [`ProtocolError::OversizeMessage`] if the declared payload exceeds
    ///   [`Self::MAX_PAYLOAD_SIZE`] — refused before any allocation
    ///
    /// The type field is not interpreted here; whether it belongs to the
    /// protocol family is the dispatcher's concern.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::ShortBuffer {
                needed: Self::SIZE,
                available: bytes.len(),
            });
        }

        let header = Self {
            major: bytes.get_u32(),
            minor: bytes.get_u32(),
            msg_type: bytes.get_u32(),
            id: bytes.get_u64(),
            payload_len: bytes.get_u32(),
        };

        if header.payload_len > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizeMessage {
                size: header.payload_len,
                max: Self::MAX_PAYLOAD_SIZE,
            });
        }

        Ok(header)
    }

    /// Append the 24 encoded header bytes to `out`.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u32(self.major);
        out.put_u32(self.minor);
        out.put_u32(self.msg_type);
        out.put_u64(self.id);
        out.put_u32(self.payload_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;

    fn sample() -> MessageHeader {
        MessageHeader {
            major: 0,
            minor: 6,
            msg_type: types::CMD_MGT_SELECT_ROLE,
            id: 666,
            payload_len: 9,
        }
    }

    #[test]
    fn header_is_24_bytes() {
        let mut buf = Vec::new();
        sample().encode(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SIZE);
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        sample().encode(&mut buf);
        assert_eq!(MessageHeader::decode(&buf).unwrap(), sample());
    }

    #[test]
    fn reject_short_buffer() {
        let buf = [0u8; 10];
        assert_eq!(
            MessageHeader::decode(&buf),
            Err(ProtocolError::ShortBuffer { needed: 24, available: 10 })
        );
    }

    #[test]
    fn reject_oversize_payload() {
        let mut buf = Vec::new();
        let mut hdr = sample();
        hdr.payload_len = MessageHeader::MAX_PAYLOAD_SIZE + 1;
        hdr.encode(&mut buf);
        assert!(matches!(
            MessageHeader::decode(&buf),
            Err(ProtocolError::OversizeMessage { .. })
        ));
    }
}
