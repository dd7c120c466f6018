//! Ticket grant commands.
//!
//! Download, upload and screen-share tickets are all minted the same way:
//! read the role-specific argument, encode it as the ticket extension,
//! mint against the ledger, and return the opaque ticket BIN.

use bytes::BytesMut;
use conclave_proto::{atom, types};

use super::{CommandCtx, HandlerFail, HandlerResult};
use crate::{backend::BackendConn, ticket};

/// Handle a ticket grant command.
pub async fn grant_ticket<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    let spec = ticket::spec_for_cmd(ctx.cmd.msg_type).ok_or_else(|| {
        HandlerFail::Generic(format!("no ticket role for command {}", ctx.cmd.msg_type))
    })?;

    // Role-specific extension: share id for file transfers, session id
    // for screen-share guests, nothing for hosts.
    let mut extension = BytesMut::new();
    match ctx.cmd.msg_type {
        types::CMD_FILES_DOWNLOAD_REQ | types::CMD_FILES_UPLOAD_REQ => {
            let share_id = ctx.cmd.read_u32()?;
            atom::write_u32(&mut extension, share_id);
        },
        types::CMD_SCREEN_CONNECT_TICKET => {
            let session_id = ctx.cmd.read_u64()?;
            atom::write_u64(&mut extension, session_id);
        },
        _ => {},
    }

    let kws = ctx.kws()?;
    let encoded = ticket::mint(
        ctx.conn,
        spec.kind.to_u32(),
        kws.kws_id,
        kws.login_type.to_u32(),
        kws.user_id,
        extension.freeze(),
    )
    .await?;

    ctx.res.msg_type = spec.res_type;
    ctx.res.clear_payload();
    ctx.res.put_bin(&encoded);
    Ok(())
}
