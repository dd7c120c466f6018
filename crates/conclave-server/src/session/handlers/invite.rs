//! Workspace invitations.
//!
//! The invitation procedure records the invitees and returns the rows
//! needed to send the invitation emails. The reply shape differs by
//! minor: one web link for v2 clients, per-invitee rows (email id, URL,
//! mail error) for v3 and later.

use conclave_proto::{atom, types};

use super::{CommandCtx, HandlerResult};
use crate::{backend::BackendConn, process};

struct Invitee {
    send_mail: bool,
    name: String,
    email: String,
    email_id: String,
    url: String,
    mail_error: String,
}

/// Handle the INVITE command.
pub async fn invite_kws<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    let kws = ctx.kws()?;
    let web_host = ctx.shared.config.web_host.clone();

    let mut extra = bytes::BytesMut::new();
    atom::write_str(&mut extra, &ctx.shared.config.mail_sender);
    let rest = ctx.bound_query("cmd_mgt_invite_kws", &extra).await?;

    let mut buf = &rest[..];
    let kws_name = atom::read_str(&mut buf)?;
    let from_name = atom::read_str(&mut buf)?;
    let from_email = atom::read_str(&mut buf)?;
    let user_msg = atom::read_str(&mut buf)?;
    let nb_user = atom::read_u32(&mut buf)?;

    let mut invitees = Vec::with_capacity(nb_user as usize);
    for _ in 0..nb_user {
        let send_mail = atom::read_u32(&mut buf)? != 0;
        let name = atom::read_str(&mut buf)?;
        let email = atom::read_str(&mut buf)?;
        let email_id = atom::read_str(&mut buf)?;
        invitees.push(Invitee {
            send_mail,
            name,
            email,
            email_id,
            url: String::new(),
            mail_error: String::new(),
        });
    }

    for invitee in &mut invitees {
        if ctx.minor >= 3 {
            invitee.url = format!(
                "https://{web_host}/i/{}/{}",
                kws.kws_id, invitee.email_id
            );
        }

        if invitee.send_mail {
            send_invitation_mail(ctx, &kws_name, &from_name, &from_email, &user_msg, invitee)
                .await;
        }
    }

    // Compose the reply.
    let res = &mut *ctx.res;
    res.msg_type = types::RES_KWS_INVITE;
    res.clear_payload();

    if ctx.minor <= 2 {
        res.put_bin(b"");
        res.put_str(&format!("https://{web_host}/?kws_id={}", kws.kws_id));
    } else {
        res.put_str(&format!("https://{web_host}/s/{}", kws.kws_id));
        res.put_u32(invitees.len() as u32);
        for invitee in &invitees {
            res.put_str(&invitee.email_id);
            res.put_str(&invitee.url);
            res.put_str(&invitee.mail_error);
        }
    }

    Ok(())
}

/// Send one invitation email through the external mailer. A mail failure
/// is recorded per invitee, never fatal to the command.
async fn send_invitation_mail<C: BackendConn>(
    ctx: &CommandCtx<'_, C>,
    kws_name: &str,
    from_name: &str,
    from_email: &str,
    user_msg: &str,
    invitee: &mut Invitee,
) {
    let body = format!(
        "From: {from_name} <{from_email}>\n\
         To: {} <{}>\n\
         Subject: Invitation to {kws_name}\n\n\
         {user_msg}\n\n{}\n",
        invitee.name, invitee.email, invitee.url,
    );

    let outcome = process::run_helper(
        &ctx.shared.config.mailer_path,
        &["-t"],
        Some(body.as_bytes()),
        std::time::Duration::from_secs(60),
    )
    .await;

    match outcome {
        Ok(outcome) if outcome.success() => {},
        Ok(outcome) => {
            process::log_output("mailer", &outcome);
            invitee.mail_error = "failed to send the invitation email".to_owned();
            tracing::warn!(email = %invitee.email, "invitation mail failed");
        },
        Err(e) => {
            invitee.mail_error = "failed to run the mailer".to_owned();
            tracing::warn!(email = %invitee.email, error = %e, "cannot run mailer");
        },
    }
}
