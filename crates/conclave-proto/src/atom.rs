//! Self-describing wire atoms.
//!
//! Every value on the wire is an atom: a one-byte tag followed by the value.
//! Integers are big-endian; STR and BIN carry a 32-bit big-endian byte length
//! followed by the raw bytes (no terminator). Atoms are order-preserving
//! within a message payload.

use bytes::{Buf, BufMut, Bytes};

use crate::errors::{ProtocolError, Result};

/// Atom tag for a 32-bit unsigned integer.
pub const TAG_U32: u8 = 1;
/// Atom tag for a 64-bit unsigned integer.
pub const TAG_U64: u8 = 2;
/// Atom tag for a length-prefixed UTF-8 string.
pub const TAG_STR: u8 = 3;
/// Atom tag for a length-prefixed binary blob.
pub const TAG_BIN: u8 = 4;

/// Maximum declared length of a single STR or BIN atom (100 MiB).
///
/// Decoding refuses anything above this before allocating.
pub const MAX_ATOM_SIZE: u32 = 100 * 1024 * 1024;

/// A decoded wire value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Atom {
    /// 32-bit unsigned integer
    U32(u32),
    /// 64-bit unsigned integer
    U64(u64),
    /// UTF-8 text
    Str(String),
    /// Opaque bytes
    Bin(Bytes),
}

impl Atom {
    /// Human-readable name of this atom's kind.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::U32(_) => "UINT32",
            Self::U64(_) => "UINT64",
            Self::Str(_) => "STR",
            Self::Bin(_) => "BIN",
        }
    }

    /// Encoded size on the wire, tag included.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        match self {
            Self::U32(_) => 1 + 4,
            Self::U64(_) => 1 + 8,
            Self::Str(s) => 1 + 4 + s.len(),
            Self::Bin(b) => 1 + 4 + b.len(),
        }
    }

    /// Append this atom to `out`.
    pub fn encode(&self, out: &mut impl BufMut) {
        match self {
            Self::U32(v) => write_u32(out, *v),
            Self::U64(v) => write_u64(out, *v),
            Self::Str(s) => write_str(out, s),
            Self::Bin(b) => write_bin(out, b),
        }
    }

    /// Decode the next atom from `buf`, whatever its kind.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let tag = read_tag(buf)?;
        match tag {
            TAG_U32 => Ok(Self::U32(read_be_u32(buf)?)),
            TAG_U64 => Ok(Self::U64(read_be_u64(buf)?)),
            TAG_STR => {
                let len = read_len(buf, true)?;
                let raw = read_raw(buf, len)?;
                // The wire predates strict UTF-8 peers; tolerate bad bytes
                // rather than failing the whole message.
                Ok(Self::Str(String::from_utf8_lossy(&raw).into_owned()))
            },
            TAG_BIN => {
                let len = read_len(buf, false)?;
                Ok(Self::Bin(read_raw(buf, len)?))
            },
            other => Err(ProtocolError::BadTag(other)),
        }
    }
}

/// Append a U32 atom.
pub fn write_u32(out: &mut impl BufMut, v: u32) {
    out.put_u8(TAG_U32);
    out.put_u32(v);
}

/// Append a U64 atom.
pub fn write_u64(out: &mut impl BufMut, v: u64) {
    out.put_u8(TAG_U64);
    out.put_u64(v);
}

/// Append a STR atom. The length is the byte length of the UTF-8 text.
pub fn write_str(out: &mut impl BufMut, s: &str) {
    out.put_u8(TAG_STR);
    out.put_u32(s.len() as u32);
    out.put_slice(s.as_bytes());
}

/// Append a BIN atom.
pub fn write_bin(out: &mut impl BufMut, b: &[u8]) {
    out.put_u8(TAG_BIN);
    out.put_u32(b.len() as u32);
    out.put_slice(b);
}

/// Read a U32 atom, failing if the next atom is of another kind.
pub fn read_u32(buf: &mut impl Buf) -> Result<u32> {
    expect_tag(buf, TAG_U32, "UINT32")?;
    read_be_u32(buf)
}

/// Read a U64 atom, failing if the next atom is of another kind.
pub fn read_u64(buf: &mut impl Buf) -> Result<u64> {
    expect_tag(buf, TAG_U64, "UINT64")?;
    read_be_u64(buf)
}

/// Read a STR atom, failing if the next atom is of another kind.
pub fn read_str(buf: &mut impl Buf) -> Result<String> {
    expect_tag(buf, TAG_STR, "STR")?;
    let len = read_len(buf, true)?;
    let raw = read_raw(buf, len)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Read a BIN atom, failing if the next atom is of another kind.
pub fn read_bin(buf: &mut impl Buf) -> Result<Bytes> {
    expect_tag(buf, TAG_BIN, "BIN")?;
    let len = read_len(buf, false)?;
    read_raw(buf, len)
}

fn read_tag(buf: &mut impl Buf) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::ShortBuffer { needed: 1, available: 0 });
    }
    Ok(buf.get_u8())
}

fn expect_tag(buf: &mut impl Buf, tag: u8, name: &'static str) -> Result<()> {
    let actual = read_tag(buf)?;
    if actual != tag {
        return Err(ProtocolError::UnexpectedTag { expected: name, actual });
    }
    Ok(())
}

fn read_be_u32(buf: &mut impl Buf) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::ShortBuffer { needed: 4, available: buf.remaining() });
    }
    Ok(buf.get_u32())
}

fn read_be_u64(buf: &mut impl Buf) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::ShortBuffer { needed: 8, available: buf.remaining() });
    }
    Ok(buf.get_u64())
}

/// Read a length prefix, refusing oversize declarations before any
/// allocation happens.
fn read_len(buf: &mut impl Buf, is_str: bool) -> Result<u32> {
    let len = read_be_u32(buf)?;
    if len > MAX_ATOM_SIZE {
        return Err(if is_str {
            ProtocolError::OversizeStr { size: len, max: MAX_ATOM_SIZE }
        } else {
            ProtocolError::OversizeBin { size: len, max: MAX_ATOM_SIZE }
        });
    }
    Ok(len)
}

fn read_raw(buf: &mut impl Buf, len: u32) -> Result<Bytes> {
    let len = len as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::ShortBuffer { needed: len, available: buf.remaining() });
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trip() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 42);
        assert_eq!(buf, [1, 0, 0, 0, 42]);
        assert_eq!(read_u32(&mut &buf[..]).unwrap(), 42);
    }

    #[test]
    fn tag_mismatch_reports_both_sides() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 7);
        let err = read_u32(&mut &buf[..]).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedTag { expected: "UINT32", actual: TAG_U64 });
    }

    #[test]
    fn oversize_str_refused_without_allocating() {
        let mut buf = Vec::new();
        buf.push(TAG_STR);
        buf.extend_from_slice(&(MAX_ATOM_SIZE + 1).to_be_bytes());
        let err = read_str(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, ProtocolError::OversizeStr { .. }));
    }

    #[test]
    fn oversize_bin_refused_without_allocating() {
        let mut buf = Vec::new();
        buf.push(TAG_BIN);
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = read_bin(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, ProtocolError::OversizeBin { .. }));
    }

    #[test]
    fn empty_bin_is_legal() {
        let mut buf = Vec::new();
        write_bin(&mut buf, b"");
        assert_eq!(read_bin(&mut &buf[..]).unwrap().len(), 0);
    }

    #[test]
    fn unknown_tag_rejected() {
        let buf = [9u8, 0, 0, 0, 0];
        assert_eq!(Atom::decode(&mut &buf[..]).unwrap_err(), ProtocolError::BadTag(9));
    }
}
