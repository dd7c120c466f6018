//! Framed protocol message.
//!
//! A message is a 24-byte header followed by a payload of atoms. The
//! `Message` type keeps both the encoded payload bytes and the decoded atom
//! list so the server can route on the header, read arguments sequentially
//! or positionally, and re-emit the exact bytes without re-encoding.

use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    Atom, MessageHeader,
    errors::{ProtocolError, Result},
    types,
};

/// A decoded or under-construction protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Protocol major version
    pub major: u32,
    /// Protocol minor version
    pub minor: u32,
    /// Message type (see [`crate::types`])
    pub msg_type: u32,
    /// Message id; results mirror the command's id, transient events use 0
    pub id: u64,
    /// Encoded payload bytes
    payload: BytesMut,
    /// Decoded payload atoms
    atoms: Vec<Atom>,
    /// Sequential read cursor over `atoms`
    pos: usize,
}

impl Message {
    /// Create an empty message of the given type at the daemon's version.
    #[must_use]
    pub fn new(msg_type: u32) -> Self {
        Self {
            major: types::MAJOR_VERSION,
            minor: types::MINOR_VERSION,
            msg_type,
            id: 0,
            payload: BytesMut::new(),
            atoms: Vec::new(),
            pos: 0,
        }
    }

    /// Parse a message from a decoded header and its payload bytes.
    ///
    /// Every atom is decoded eagerly; trailing or truncated bytes fail the
    /// whole message.
    pub fn parse(header: MessageHeader, payload: &[u8]) -> Result<Self> {
        let mut atoms = Vec::new();
        let mut cursor = payload;
        while !cursor.is_empty() {
            atoms.push(Atom::decode(&mut cursor)?);
        }

        Ok(Self {
            major: header.major,
            minor: header.minor,
            msg_type: header.msg_type,
            id: header.id,
            payload: BytesMut::from(payload),
            atoms,
            pos: 0,
        })
    }

    /// Header describing this message.
    #[must_use]
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            major: self.major,
            minor: self.minor,
            msg_type: self.msg_type,
            id: self.id,
            payload_len: self.payload.len() as u32,
        }
    }

    /// Append the encoded header and payload to `out`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::OversizeMessage`] if the payload outgrew the
    /// message ceiling.
    pub fn encode(&self, out: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > MessageHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::OversizeMessage {
                size: self.payload.len() as u32,
                max: MessageHeader::MAX_PAYLOAD_SIZE,
            });
        }
        self.header().encode(out);
        out.put_slice(&self.payload);
        Ok(())
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Total encoded size, header included.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        MessageHeader::SIZE + self.payload.len()
    }

    /// Number of atoms in the payload.
    #[must_use]
    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }

    /// Drop the payload and reset the read cursor.
    pub fn clear_payload(&mut self) {
        self.payload.clear();
        self.atoms.clear();
        self.pos = 0;
    }

    /// Replace the payload with already-encoded atom bytes.
    pub fn set_payload(&mut self, bytes: &[u8]) -> Result<()> {
        let mut atoms = Vec::new();
        let mut cursor = bytes;
        while !cursor.is_empty() {
            atoms.push(Atom::decode(&mut cursor)?);
        }
        self.payload.clear();
        self.payload.extend_from_slice(bytes);
        self.atoms = atoms;
        self.pos = 0;
        Ok(())
    }

    /// Append a U32 atom.
    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        crate::atom::write_u32(&mut self.payload, v);
        self.atoms.push(Atom::U32(v));
        self
    }

    /// Append a U64 atom.
    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        crate::atom::write_u64(&mut self.payload, v);
        self.atoms.push(Atom::U64(v));
        self
    }

    /// Append a STR atom.
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        crate::atom::write_str(&mut self.payload, s);
        self.atoms.push(Atom::Str(s.to_owned()));
        self
    }

    /// Append a BIN atom.
    pub fn put_bin(&mut self, b: &[u8]) -> &mut Self {
        crate::atom::write_bin(&mut self.payload, b);
        self.atoms.push(Atom::Bin(Bytes::copy_from_slice(b)));
        self
    }

    fn atom_at(&self, pos: usize, expected: &'static str) -> Result<&Atom> {
        self.atoms.get(pos).ok_or(ProtocolError::UnexpectedTag { expected, actual: 0 })
    }

    /// U32 atom at `pos`.
    pub fn get_u32(&self, pos: usize) -> Result<u32> {
        match self.atom_at(pos, "UINT32")? {
            Atom::U32(v) => Ok(*v),
            other => Err(mismatch("UINT32", other)),
        }
    }

    /// U64 atom at `pos`.
    pub fn get_u64(&self, pos: usize) -> Result<u64> {
        match self.atom_at(pos, "UINT64")? {
            Atom::U64(v) => Ok(*v),
            other => Err(mismatch("UINT64", other)),
        }
    }

    /// STR atom at `pos`.
    pub fn get_str(&self, pos: usize) -> Result<&str> {
        match self.atom_at(pos, "STR")? {
            Atom::Str(s) => Ok(s),
            other => Err(mismatch("STR", other)),
        }
    }

    /// BIN atom at `pos`.
    pub fn get_bin(&self, pos: usize) -> Result<&Bytes> {
        match self.atom_at(pos, "BIN")? {
            Atom::Bin(b) => Ok(b),
            other => Err(mismatch("BIN", other)),
        }
    }

    /// Read the next atom as U32 and advance the cursor.
    pub fn read_u32(&mut self) -> Result<u32> {
        let v = self.get_u32(self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    /// Read the next atom as U64 and advance the cursor.
    pub fn read_u64(&mut self) -> Result<u64> {
        let v = self.get_u64(self.pos)?;
        self.pos += 1;
        Ok(v)
    }

    /// Read the next atom as STR and advance the cursor.
    pub fn read_str(&mut self) -> Result<String> {
        let v = self.get_str(self.pos)?.to_owned();
        self.pos += 1;
        Ok(v)
    }

    /// Read the next atom as BIN and advance the cursor.
    pub fn read_bin(&mut self) -> Result<Bytes> {
        let v = self.get_bin(self.pos)?.clone();
        self.pos += 1;
        Ok(v)
    }

    /// Reset the sequential read cursor.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Raw encoded payload bytes.
    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Render the header and payload as human-readable text.
    ///
    /// Integers are rendered losslessly; BIN values render their length
    /// only. Diagnostics only, never parsed back.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "major> {}", self.major);
        let _ = writeln!(out, "minor> {}", self.minor);
        let _ = writeln!(out, "type> {}", self.msg_type);
        let _ = writeln!(out, "id> {}", self.id);
        for atom in &self.atoms {
            match atom {
                Atom::U32(v) => {
                    let _ = writeln!(out, "uint32> {v}");
                },
                Atom::U64(v) => {
                    let _ = writeln!(out, "uint64> {v}");
                },
                Atom::Str(s) => {
                    let _ = writeln!(out, "string {}> {s}", s.len());
                },
                Atom::Bin(b) => {
                    let _ = writeln!(out, "binary {}>", b.len());
                },
            }
        }
        out
    }
}

fn mismatch(expected: &'static str, found: &Atom) -> ProtocolError {
    let actual = match found {
        Atom::U32(_) => crate::atom::TAG_U32,
        Atom::U64(_) => crate::atom::TAG_U64,
        Atom::Str(_) => crate::atom::TAG_STR,
        Atom::Bin(_) => crate::atom::TAG_BIN,
    };
    ProtocolError::UnexpectedTag { expected, actual }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_and_positional_reads_agree() {
        let mut msg = Message::new(types::RES_OK);
        msg.put_u32(1).put_u64(2).put_str("three").put_bin(b"four");

        assert_eq!(msg.read_u32().unwrap(), 1);
        assert_eq!(msg.read_u64().unwrap(), 2);
        assert_eq!(msg.read_str().unwrap(), "three");
        assert_eq!(msg.read_bin().unwrap().as_ref(), b"four");

        assert_eq!(msg.get_u32(0).unwrap(), 1);
        assert_eq!(msg.get_bin(3).unwrap().as_ref(), b"four");
    }

    #[test]
    fn read_past_end_fails() {
        let mut msg = Message::new(types::RES_OK);
        msg.put_u32(1);
        msg.read_u32().unwrap();
        assert!(msg.read_u32().is_err());
    }

    #[test]
    fn parse_rejects_truncated_payload() {
        let mut msg = Message::new(types::RES_OK);
        msg.put_str("hello");
        let mut wire = Vec::new();
        msg.encode(&mut wire).unwrap();

        let header = MessageHeader::decode(&wire).unwrap();
        let payload = &wire[MessageHeader::SIZE..wire.len() - 1];
        assert!(Message::parse(header, payload).is_err());
    }

    #[test]
    fn dump_prints_each_header_field_once() {
        let mut msg = Message::new(types::RES_OK);
        msg.minor = 3;
        msg.id = 99;
        msg.put_u32(42).put_bin(b"abc");
        let text = msg.dump();

        assert_eq!(text.matches("major>").count(), 1);
        assert_eq!(text.matches("minor>").count(), 1);
        assert_eq!(text.matches("type>").count(), 1);
        assert_eq!(text.matches("id>").count(), 1);
        assert!(text.contains("minor> 3"));
        assert!(text.contains("id> 99"));
        assert!(text.contains("uint32> 42"));
        assert!(text.contains("binary 3>"));
        // The binary content itself is never echoed.
        assert!(!text.contains("abc"));
    }
}
