//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced by the framing codec.
///
/// These are local to the codec and never retried: a framing error is fatal
/// for the message being decoded, session-fatal for the broker and
/// protocol-fatal in ticket mode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ended before the value was complete.
    #[error("short buffer: needed {needed} bytes, {available} available")]
    ShortBuffer {
        /// Bytes required to finish decoding the current value
        needed: usize,
        /// Bytes actually remaining
        available: usize,
    },

    /// An atom of one kind was requested but another was found.
    #[error("expected {expected} atom, got tag {actual}")]
    UnexpectedTag {
        /// The kind the caller asked for
        expected: &'static str,
        /// The tag byte found on the wire
        actual: u8,
    },

    /// A STR atom declared a length above the atom ceiling.
    #[error("string of {size} bytes exceeds the {max} byte limit")]
    OversizeStr {
        /// Declared length
        size: u32,
        /// Permitted maximum
        max: u32,
    },

    /// A BIN atom declared a length above the atom ceiling.
    #[error("binary of {size} bytes exceeds the {max} byte limit")]
    OversizeBin {
        /// Declared length
        size: u32,
        /// Permitted maximum
        max: u32,
    },

    /// A message header declared a payload above the message ceiling.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    OversizeMessage {
        /// Declared payload length
        size: u32,
        /// Permitted maximum
        max: u32,
    },

    /// An atom tag byte is not one of the four known kinds.
    #[error("invalid atom tag ({0})")]
    BadTag(u8),

    /// The message type field does not carry the protocol family bits.
    #[error("invalid message type field ({0:#010x})")]
    BadTypeField(u32),
}
