//! Ticket minting against the ledger.
//!
//! A ticket binds (workspace, user, role kind, random nonce) and lives in
//! the ledger table from mint to first consume, or until the backend TTL
//! expires it. Consumption is a single atomic read-and-delete; a second
//! attempt finds nothing.

use bytes::Bytes;
use conclave_proto::{TICKET_NONCE_LEN, Ticket, TicketKind, types};
use rand::RngCore;

use crate::backend::{BackendConn, BackendError, now_secs};

/// One ticket role: the grant command that mints it, the result carrying
/// it, and the first ticket-mode message that redeems it.
#[derive(Debug, Clone, Copy)]
pub struct TicketSpec {
    /// Grant command handled by the commander
    pub cmd_type: u32,
    /// Result type carrying the minted ticket
    pub res_type: u32,
    /// First message type of the redeeming ticket-mode session
    pub first_msg_type: u32,
    /// Ticket kind bound into the ticket
    pub kind: TicketKind,
}

/// Dispatch table of the ticket roles.
pub static TICKET_DISPATCH: &[TicketSpec] = &[
    TicketSpec {
        cmd_type: types::CMD_FILES_DOWNLOAD_REQ,
        res_type: types::RES_FILES_DOWNLOAD_REQ,
        first_msg_type: types::CMD_FILES_DOWNLOAD_DATA,
        kind: TicketKind::Download,
    },
    TicketSpec {
        cmd_type: types::CMD_FILES_UPLOAD_REQ,
        res_type: types::RES_FILES_UPLOAD_REQ,
        first_msg_type: types::CMD_FILES_PHASE_1,
        kind: TicketKind::Upload,
    },
    TicketSpec {
        cmd_type: types::CMD_SCREEN_CONNECT_TICKET,
        res_type: types::RES_SCREEN_CONNECT_TICKET,
        first_msg_type: types::CMD_SCREEN_CONNECT_SESSION,
        kind: TicketKind::ScreenGuest,
    },
    TicketSpec {
        cmd_type: types::CMD_SCREEN_START_TICKET,
        res_type: types::RES_SCREEN_START_TICKET,
        first_msg_type: types::CMD_SCREEN_START_SESSION,
        kind: TicketKind::ScreenHost,
    },
];

/// Entry for a grant command.
#[must_use]
pub fn spec_for_cmd(msg_type: u32) -> Option<&'static TicketSpec> {
    TICKET_DISPATCH.iter().find(|spec| spec.cmd_type == msg_type)
}

/// Entry for the first message of a ticket-mode session.
#[must_use]
pub fn spec_for_first_msg(msg_type: u32) -> Option<&'static TicketSpec> {
    TICKET_DISPATCH
        .iter()
        .find(|spec| spec.first_msg_type == msg_type || spec.cmd_type == msg_type)
}

/// Mint a ticket: random nonce, encode, insert into the ledger.
pub async fn mint<C: BackendConn + ?Sized>(
    conn: &mut C,
    kind: u32,
    kws_id: u64,
    login_type: u32,
    user_id: u32,
    extension: Bytes,
) -> Result<Bytes, BackendError> {
    let mut nonce = [0u8; TICKET_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ticket = Ticket {
        kind,
        kws_id,
        login_type,
        user_id,
        extension,
        nonce: Bytes::copy_from_slice(&nonce),
    };

    let encoded = ticket.encode();
    conn.insert_ticket(now_secs(), &encoded).await?;
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use conclave_proto::{TicketKind, types::LoginType};

    use super::*;
    use crate::backend::{Backend, MemoryBackend};

    #[tokio::test]
    async fn minted_ticket_is_consumable_once() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();

        let bytes = mint(
            &mut conn,
            TicketKind::Upload.to_u32(),
            42,
            LoginType::Normal.to_u32(),
            7,
            Bytes::new(),
        )
        .await
        .unwrap();

        let parsed = Ticket::decode(&bytes).unwrap();
        assert_eq!(parsed.kind(), Some(TicketKind::Upload));
        assert_eq!(parsed.kws_id, 42);
        assert_eq!(parsed.user_id, 7);
        assert_eq!(parsed.nonce.len(), TICKET_NONCE_LEN);

        assert!(conn.consume_ticket(&bytes, 300).await.unwrap());
        assert!(!conn.consume_ticket(&bytes, 300).await.unwrap());
    }

    #[tokio::test]
    async fn two_mints_differ_by_nonce() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();

        let a = mint(&mut conn, 1, 1, 1, 1, Bytes::new()).await.unwrap();
        let b = mint(&mut conn, 1, 1, 1, 1, Bytes::new()).await.unwrap();
        assert_ne!(a, b);
    }
}
