//! Wire protocol for the Conclave collaboration daemon.
//!
//! The protocol exchanges framed messages over TLS: a fixed 24-byte
//! big-endian header followed by a payload of self-describing atoms
//! (U32/U64/STR/BIN). This crate is pure data handling — no I/O — so both
//! the server and test harnesses share one codec:
//!
//! - [`atom`]: atom tags, encoders and decoders with size ceilings
//! - [`MessageHeader`]: the fixed header
//! - [`Message`]: payload construction, sequential/positional reads, dump
//! - [`types`]: the type-field encoding and full message vocabulary
//! - [`Ticket`]: the single-use ticket codec

pub mod atom;
pub mod errors;
mod header;
mod message;
mod ticket;
pub mod types;

pub use atom::{Atom, MAX_ATOM_SIZE};
pub use errors::{ProtocolError, Result};
pub use header::MessageHeader;
pub use message::Message;
pub use ticket::{TICKET_NONCE_LEN, Ticket, TicketKind};
