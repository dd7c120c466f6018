//! Single-use session ticket codec.
//!
//! A ticket is an opaque BIN minted by the principal subprotocol and
//! redeemed exactly once by a ticket-mode session. Its cleartext is a plain
//! atom sequence: kind U32, workspace id U64, login type U32, user id U32,
//! extension BIN, nonce BIN. The extension carries the role-specific
//! payload — a share id for file tickets, a session id for guest
//! screen-share tickets, nothing for host tickets.

use bytes::{Bytes, BytesMut};

use crate::{
    atom,
    errors::Result,
    types::LoginType,
};

/// Length of the random nonce appended to every ticket.
pub const TICKET_NONCE_LEN: usize = 16;

/// What a ticket authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    /// Download files from a share.
    Download,
    /// Upload files to a share.
    Upload,
    /// Host a screen-sharing session.
    ScreenHost,
    /// Join a screen-sharing session.
    ScreenGuest,
}

impl TicketKind {
    /// Wire value of this ticket kind.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Download => 1,
            Self::Upload => 2,
            Self::ScreenHost => 3,
            Self::ScreenGuest => 4,
        }
    }

    /// Parse a wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Download),
            2 => Some(Self::Upload),
            3 => Some(Self::ScreenHost),
            4 => Some(Self::ScreenGuest),
            _ => None,
        }
    }
}

/// Decoded ticket cleartext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Ticket kind (raw; may be unrecognized on a hostile ticket)
    pub kind: u32,
    /// Workspace the ticket is bound to
    pub kws_id: u64,
    /// Login type of the minting session (raw wire value)
    pub login_type: u32,
    /// User the ticket is bound to
    pub user_id: u32,
    /// Role-specific extension atoms
    pub extension: Bytes,
    /// Random nonce making every ticket unique
    pub nonce: Bytes,
}

impl Ticket {
    /// Encode the ticket to its opaque BIN form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        atom::write_u32(&mut out, self.kind);
        atom::write_u64(&mut out, self.kws_id);
        atom::write_u32(&mut out, self.login_type);
        atom::write_u32(&mut out, self.user_id);
        atom::write_bin(&mut out, &self.extension);
        atom::write_bin(&mut out, &self.nonce);
        out.freeze()
    }

    /// Decode a ticket from its opaque BIN form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        Ok(Self {
            kind: atom::read_u32(&mut buf)?,
            kws_id: atom::read_u64(&mut buf)?,
            login_type: atom::read_u32(&mut buf)?,
            user_id: atom::read_u32(&mut buf)?,
            extension: atom::read_bin(&mut buf)?,
            nonce: atom::read_bin(&mut buf)?,
        })
    }

    /// Ticket kind, if recognized.
    #[must_use]
    pub fn kind(&self) -> Option<TicketKind> {
        TicketKind::from_u32(self.kind)
    }

    /// Login type, if recognized.
    #[must_use]
    pub fn login_type(&self) -> Option<LoginType> {
        LoginType::from_u32(self.login_type)
    }

    /// Share id from the extension of a file-transfer ticket.
    pub fn share_id(&self) -> Result<u32> {
        let mut ext = &self.extension[..];
        atom::read_u32(&mut ext)
    }

    /// Session id from the extension of a guest screen-share ticket.
    pub fn session_id(&self) -> Result<u64> {
        let mut ext = &self.extension[..];
        atom::read_u64(&mut ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_round_trip() {
        let mut ext = BytesMut::new();
        atom::write_u32(&mut ext, 3);

        let ticket = Ticket {
            kind: TicketKind::Upload.to_u32(),
            kws_id: 42,
            login_type: LoginType::Normal.to_u32(),
            user_id: 7,
            extension: ext.freeze(),
            nonce: Bytes::from_static(&[0xaa; TICKET_NONCE_LEN]),
        };

        let wire = ticket.encode();
        let parsed = Ticket::decode(&wire).unwrap();
        assert_eq!(parsed, ticket);
        assert_eq!(parsed.kind(), Some(TicketKind::Upload));
        assert_eq!(parsed.share_id().unwrap(), 3);
        assert_eq!(parsed.nonce.len(), TICKET_NONCE_LEN);
    }

    #[test]
    fn truncated_ticket_rejected() {
        let ticket = Ticket {
            kind: 1,
            kws_id: 1,
            login_type: 1,
            user_id: 1,
            extension: Bytes::new(),
            nonce: Bytes::from_static(&[0; TICKET_NONCE_LEN]),
        };
        let wire = ticket.encode();
        assert!(Ticket::decode(&wire[..wire.len() - 4]).is_err());
    }
}
