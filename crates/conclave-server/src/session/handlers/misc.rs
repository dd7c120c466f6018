//! Management, chat, unique-URL and public-board commands.

use conclave_proto::atom;

use super::{CommandCtx, HandlerFail, HandlerResult, connect};
use crate::{
    backend::{BackendConn, ProcReply, anp_query},
    process,
};

/// Handle the CREATE-KWS command: validate the creator's signing ticket,
/// then let the procedure create the workspace and its first event.
pub async fn create_kws<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    let raw_ticket = ctx.cmd.get_bin(1)?.clone();

    let ticket = connect::parse_signing_ticket(&raw_ticket)
        .map_err(|e| HandlerFail::Generic(format!("malformed ticket: {e}")))?;

    // Workspace creation requires a daemon-trusted signing key.
    if !ctx.shared.config.trusted_key_ids.contains(&ticket.key_id) {
        return Err(HandlerFail::Generic(format!(
            "not authorized to create a workspace (ticket has key id {})",
            ticket.key_id
        )));
    }

    if !connect::validate_signing_ticket(&ctx.shared.config, &raw_ticket, ticket.key_id).await? {
        return Err(HandlerFail::Generic("invalid ticket".to_owned()));
    }

    let minor = ctx.minor;
    let quota = ctx.shared.config.default_file_quota;
    let web_host = ctx.shared.config.web_host.clone();
    let payload = bytes::Bytes::copy_from_slice(ctx.cmd.payload_bytes());

    let reply = anp_query(ctx.conn, "cmd_mgt_create_kws", |buf| {
        atom::write_bin(buf, &payload);
        atom::write_u32(buf, minor);
        atom::write_str(buf, ""); // organization name, unused here
        atom::write_u64(buf, quota);
        atom::write_str(buf, &web_host);
    })
    .await?;

    let rest = match reply {
        ProcReply::Ok(rest) => rest,
        ProcReply::UserError(text) => return Err(HandlerFail::Generic(text)),
    };

    let mut buf = &rest[..];
    let res_type = atom::read_u32(&mut buf)?;
    let res_payload = atom::read_bin(&mut buf)?;
    ctx.res.msg_type = res_type;
    ctx.res
        .set_payload(&res_payload)
        .map_err(|e| HandlerFail::Backend(crate::backend::BackendError::Reply(e)))?;
    Ok(())
}

/// Handle the FREEMIUM-CONFIRM command: check the administrator secret
/// and hand the confirmation email to the mailer.
pub async fn freemium_confirm<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    let pwd = ctx.cmd.read_str()?;
    let email = ctx.cmd.read_str()?;
    let confirm_link = ctx.cmd.read_str()?;

    let secret = ctx.shared.config.admin_secret().await;
    if secret.is_empty() || pwd != secret {
        return Err(HandlerFail::Generic("invalid root password".to_owned()));
    }

    let body = format!(
        "To: {email}\n\
         Subject: Account Confirmation\n\n\
         Follow this link to confirm your account:\n{confirm_link}\n",
    );

    let outcome = process::run_helper(
        &ctx.shared.config.mailer_path,
        &["-t"],
        Some(body.as_bytes()),
        std::time::Duration::from_secs(60),
    )
    .await
    .map_err(|e| HandlerFail::Generic(format!("cannot run mailer: {e}")))?;

    if !outcome.success() {
        process::log_output("mailer", &outcome);
        return Err(HandlerFail::Generic(
            "failed to send the confirmation email".to_owned(),
        ));
    }
    Ok(())
}

/// Handle the CHAT-MSG command.
pub async fn chat_msg<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    ctx.bound_query("cmd_chat_msg", &[]).await?;
    Ok(())
}

/// Handle the GET-UURL command.
pub async fn get_uurl<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    let mut extra = bytes::BytesMut::new();
    atom::write_str(&mut extra, &ctx.shared.config.web_host);
    ctx.bound_query("cmd_kws_get_uurl", &extra).await?;
    Ok(())
}

/// Handle the PB-ACCEPT-CHAT command.
pub async fn pb_accept_chat<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    ctx.bound_query("cmd_pb_accept_chat", &[]).await?;
    Ok(())
}
