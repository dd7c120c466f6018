//! Workspace login and logout.
//!
//! The CONNECT command authenticates the session into a workspace:
//! classify the login type from the email id, verify privileged
//! credentials against the administrator secret, run the login procedure,
//! enforce secure-workspace credentials (password or signing ticket),
//! then reply in the shape the effective minor expects.

use bytes::Bytes;
use conclave_proto::{
    atom,
    types::{self, LoginCode, LoginType},
};

use super::{CommandCtx, HandlerFail, HandlerResult, WorkspaceHandle, set_failure};
use crate::{
    backend::{BackendConn, BackendError, ProcReply, anp_query},
    config::ServerConfig,
    process,
};

/// Attempts made against the external ticket validator.
const VALIDATOR_ATTEMPTS: u32 = 3;

/// Pause between validator attempts.
const VALIDATOR_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// A signing ticket minted by the account service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningTicket {
    /// User real name
    pub name: String,
    /// User email address
    pub email: String,
    /// Issuing service host
    pub host: String,
    /// Issuing service port
    pub port: u32,
    /// Id of the signing key
    pub key_id: u64,
}

/// Parse a signing ticket blob.
pub fn parse_signing_ticket(bytes: &[u8]) -> Result<SigningTicket, conclave_proto::ProtocolError> {
    let mut buf = bytes;
    Ok(SigningTicket {
        name: atom::read_str(&mut buf)?,
        email: atom::read_str(&mut buf)?,
        host: atom::read_str(&mut buf)?,
        port: atom::read_u32(&mut buf)?,
        key_id: atom::read_u64(&mut buf)?,
    })
}

/// Ask the external validator about a signing ticket, retrying a few
/// times. True once the validator accepts.
pub async fn validate_signing_ticket(
    config: &ServerConfig,
    ticket: &[u8],
    key_id: u64,
) -> Result<bool, HandlerFail> {
    let key_arg = key_id.to_string();
    for attempt in 0..VALIDATOR_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(VALIDATOR_RETRY_DELAY).await;
        }
        let outcome = process::run_helper(
            &config.validator_path,
            &["--key-id", &key_arg],
            Some(ticket),
            std::time::Duration::from_secs(30),
        )
        .await
        .map_err(|e| {
            HandlerFail::Backend(BackendError::Db(format!("cannot run ticket validator: {e}")))
        })?;

        if outcome.success() {
            return Ok(true);
        }
        process::log_output("ticket-validator", &outcome);
    }
    Ok(false)
}

/// Parsed CONNECT command.
#[derive(Debug, Default)]
struct ConnectArgs {
    kws_id: u64,
    delete_on_login: bool,
    last_event_id: u64,
    last_event_date: u64,
    user_id: u32,
    user_name: String,
    user_email: String,
    email_id: String,
    ticket: Bytes,
    pwd: String,
}

fn parse_cmd(ctx: &mut CommandCtx<'_, impl BackendConn>) -> Result<ConnectArgs, HandlerFail> {
    let minor = ctx.minor;
    let cmd = &mut *ctx.cmd;
    let mut args = ConnectArgs {
        kws_id: cmd.read_u64()?,
        ..ConnectArgs::default()
    };

    if minor >= 4 {
        args.delete_on_login = cmd.read_u32()? != 0;
    }
    args.last_event_id = cmd.read_u64()?;
    args.last_event_date = cmd.read_u64()?;
    args.user_id = cmd.read_u32()?;
    args.user_name = cmd.read_str()?;
    args.user_email = cmd.read_str()?;

    if minor <= 2 {
        let _nonce = cmd.read_bin()?;
        let is_member = cmd.read_u32()? != 0;
        if is_member {
            args.ticket = cmd.read_bin()?;
        } else {
            args.pwd = cmd.read_str()?;
        }
    } else {
        args.email_id = cmd.read_str()?;
        args.ticket = cmd.read_bin()?;
        args.pwd = cmd.read_str()?;
    }

    Ok(args)
}

/// Reply tuple of the login procedure.
#[derive(Debug, Default)]
struct LoginReply {
    daemon_last_event_id: u64,
    login_code: u32,
    choose_user_id: bool,
    perm_denied: bool,
    ticket_cached: bool,
    secure: bool,
    #[allow(dead_code)]
    compat_v2: bool,
    registered: bool,
    user_id: u32,
    email_id: String,
    actual_pwd: String,
    error_text: String,
}

/// Handle the CONNECT command.
pub async fn connect_kws<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    let args = parse_cmd(ctx)?;

    // A second login to the same workspace is refused unless this is a
    // delete request.
    if !args.delete_on_login && ctx.workspaces.contains_key(&args.kws_id) {
        return Err(HandlerFail::Generic(format!(
            "already logged in to workspace {}",
            args.kws_id
        )));
    }

    let mut login_type = classify_login_type(&args.email_id);

    // Privileged logins authenticate against the administrator secret.
    if matches!(login_type, LoginType::Root | LoginType::Portal) {
        let secret = ctx.shared.config.admin_secret().await;
        if secret.is_empty() {
            return Err(HandlerFail::Generic(
                "the administration secret is not set".to_owned(),
            ));
        }
        if args.pwd != secret {
            return Err(HandlerFail::Generic("invalid administration secret".to_owned()));
        }
    }

    let mut reply = run_login_proc(ctx, &args, login_type).await?;
    let mut ticket_validated = false;

    if reply.login_code == 0 && !reply.choose_user_id && !reply.perm_denied {
        // Secure workspaces require real credentials from normal users.
        if reply.secure && login_type == LoginType::Normal {
            login_type = LoginType::Secure;
            ticket_validated =
                check_security(ctx, &args, &mut reply).await?;
        }

        if reply.login_code == 0 {
            if args.delete_on_login {
                reply.login_code = LoginCode::DeletedWorkspace.to_u32();
                reply.error_text = "workspace deleted".to_owned();
                run_delete_helper(&ctx.shared.config, args.kws_id).await?;
            } else {
                let handle = WorkspaceHandle {
                    kws_id: args.kws_id,
                    login_type,
                    user_id: reply.user_id,
                };
                ctx.kws = Some(handle);

                // Persist a freshly validated ticket for regular users.
                if ticket_validated && reply.user_id != 0 {
                    let mut extra = bytes::BytesMut::new();
                    atom::write_bin(&mut extra, &args.ticket);
                    ctx.bound_query("store_kws_user_ticket", &extra).await?;
                }

                // First login records the user-supplied name.
                if !reply.registered && reply.user_id != 0 {
                    let mut extra = bytes::BytesMut::new();
                    atom::write_str(&mut extra, &args.user_name);
                    ctx.bound_query("register_kws_user", &extra).await?;
                }

                reply.login_code = LoginCode::Ok.to_u32();
                reply.error_text = "login successful".to_owned();
            }
        }
    }

    // Compose the reply.
    if reply.choose_user_id {
        choose_user_id_reply(ctx, args.kws_id).await?;
    } else if reply.perm_denied {
        set_failure(
            ctx.res,
            types::FAIL_PERM_DENIED,
            "administrator privilege required",
        );
    } else if ctx.minor <= 2 {
        compat_reply(ctx, &reply);
    } else {
        full_reply(ctx, &reply);
    }

    // Accept the login.
    if reply.login_code == LoginCode::Ok.to_u32() && !args.delete_on_login {
        let handle = WorkspaceHandle {
            kws_id: args.kws_id,
            login_type,
            user_id: reply.user_id,
        };
        ctx.add_workspace(handle, args.last_event_id);
    }

    Ok(())
}

fn classify_login_type(email_id: &str) -> LoginType {
    match email_id {
        "admin" => LoginType::Root,
        "kwmo" => LoginType::Portal,
        _ => LoginType::Normal,
    }
}

async fn run_login_proc<C: BackendConn>(
    ctx: &mut CommandCtx<'_, C>,
    args: &ConnectArgs,
    login_type: LoginType,
) -> Result<LoginReply, HandlerFail> {
    let proc_reply = anp_query(ctx.conn, "connect_kws", |buf| {
        atom::write_u64(buf, args.kws_id);
        atom::write_u32(buf, u32::from(args.delete_on_login));
        atom::write_u32(buf, login_type.to_u32());
        atom::write_u32(buf, args.user_id);
        atom::write_str(buf, &args.user_email);
        atom::write_str(buf, &args.email_id);
        atom::write_bin(buf, &args.ticket);
        atom::write_u64(buf, args.last_event_id);
        atom::write_u64(buf, args.last_event_date);
    })
    .await?;

    let rest = match proc_reply {
        ProcReply::Ok(rest) => rest,
        ProcReply::UserError(text) => return Err(HandlerFail::Generic(text)),
    };

    let mut buf = &rest[..];
    Ok(LoginReply {
        daemon_last_event_id: atom::read_u64(&mut buf)?,
        login_code: atom::read_u32(&mut buf)?,
        choose_user_id: atom::read_u32(&mut buf)? != 0,
        perm_denied: atom::read_u32(&mut buf)? != 0,
        ticket_cached: atom::read_u32(&mut buf)? != 0,
        secure: atom::read_u32(&mut buf)? != 0,
        compat_v2: atom::read_u32(&mut buf)? != 0,
        registered: atom::read_u32(&mut buf)? != 0,
        user_id: atom::read_u32(&mut buf)?,
        email_id: atom::read_str(&mut buf)?,
        actual_pwd: atom::read_str(&mut buf)?,
        error_text: atom::read_str(&mut buf)?,
    })
}

/// Check the secure-login credentials: the assigned password first, then
/// the signing ticket. Returns whether the ticket was freshly validated;
/// on refusal the login code is set to bad-password-or-ticket.
async fn check_security<C: BackendConn>(
    ctx: &mut CommandCtx<'_, C>,
    args: &ConnectArgs,
    reply: &mut LoginReply,
) -> Result<bool, HandlerFail> {
    let mut valid = false;
    let mut ticket_validated = false;

    if !args.pwd.is_empty() && !reply.actual_pwd.is_empty() && args.pwd == reply.actual_pwd {
        tracing::debug!("secure login: password accepted");
        valid = true;
    }

    if !valid && !args.ticket.is_empty() {
        if reply.ticket_cached {
            tracing::debug!("secure login: ticket already verified");
            valid = true;
        } else {
            ticket_validated = check_signing_ticket(ctx, args).await?;
            valid = ticket_validated;
        }
    }

    if !valid {
        reply.login_code = LoginCode::BadPwdOrTicket.to_u32();
        let nb_options = usize::from(!args.pwd.is_empty()) + usize::from(!args.ticket.is_empty());
        reply.error_text = match nb_options {
            0 => "security credentials required".to_owned(),
            2 => "security credentials refused".to_owned(),
            _ => "bad password or ticket".to_owned(),
        };
        tracing::info!(kws_id = args.kws_id, "secure login refused: {}", reply.error_text);
    }

    Ok(ticket_validated)
}

async fn check_signing_ticket<C: BackendConn>(
    ctx: &mut CommandCtx<'_, C>,
    args: &ConnectArgs,
) -> Result<bool, HandlerFail> {
    let ticket = match parse_signing_ticket(&args.ticket) {
        Ok(ticket) => ticket,
        Err(e) => {
            tracing::info!("invalid signing ticket format: {e}");
            return Ok(false);
        },
    };

    if !ticket.email.eq_ignore_ascii_case(&args.user_email) {
        tracing::info!(
            "signing ticket email is {}, expected {}",
            ticket.email,
            args.user_email
        );
        return Ok(false);
    }

    // The key must be trusted daemon-wide or by the workspace.
    let daemon_trusted = ctx.shared.config.trusted_key_ids.contains(&ticket.key_id);
    if !daemon_trusted {
        let kws_trusted = ctx
            .conn
            .workspace_trusts_key(args.kws_id, ticket.key_id)
            .await?;
        if !kws_trusted {
            tracing::info!(key_id = ticket.key_id, "untrusted signing key id");
            return Ok(false);
        }
    }

    validate_signing_ticket(&ctx.shared.config, &args.ticket, ticket.key_id).await
}

async fn run_delete_helper(config: &ServerConfig, kws_id: u64) -> Result<(), HandlerFail> {
    let outcome = process::run_helper(
        &config.helper_path,
        &["--delete-kws", &kws_id.to_string()],
        None,
        std::time::Duration::from_secs(60),
    )
    .await
    .map_err(|e| {
        HandlerFail::Backend(BackendError::Db(format!("cannot run delete helper: {e}")))
    })?;

    process::log_output("delete-helper", &outcome);
    if !outcome.success() {
        return Err(HandlerFail::Backend(BackendError::Db(
            "workspace delete helper failed".to_owned(),
        )));
    }
    Ok(())
}

/// v2 compatibility: the user could not be uniquely identified; reply
/// with the candidate rows.
async fn choose_user_id_reply<C: BackendConn>(
    ctx: &mut CommandCtx<'_, C>,
    kws_id: u64,
) -> Result<(), HandlerFail> {
    set_failure(ctx.res, types::FAIL_CHOOSE_USER_ID, "cannot identify user");
    let users = ctx.conn.workspace_users(kws_id).await?;
    ctx.res.put_u32(users.len() as u32);
    for user in users {
        ctx.res.put_u32(user.user_id);
        ctx.res.put_str(&user.name);
        ctx.res.put_str(&user.email);
    }
    Ok(())
}

fn compat_reply<C: BackendConn>(ctx: &mut CommandCtx<'_, C>, reply: &LoginReply) {
    match LoginCode::from_u32(reply.login_code) {
        Some(LoginCode::Ok) => {
            ctx.res.msg_type = types::RES_KWS_CONNECT;
            ctx.res.clear_payload();
            ctx.res.put_u32(reply.user_id);
            ctx.res.put_u64(reply.daemon_last_event_id);
        },
        Some(LoginCode::OutOfSync) => {
            set_failure(ctx.res, types::FAIL_EVT_OUT_OF_SYNC, &reply.error_text);
        },
        _ => set_failure(ctx.res, types::FAIL_GENERIC, &reply.error_text),
    }
}

fn full_reply<C: BackendConn>(ctx: &mut CommandCtx<'_, C>, reply: &LoginReply) {
    let res = &mut *ctx.res;
    res.msg_type = types::RES_KWS_CONNECT;
    res.clear_payload();
    res.put_u32(reply.login_code);
    res.put_str(&reply.error_text);

    let meaningful = matches!(
        LoginCode::from_u32(reply.login_code),
        Some(LoginCode::Ok | LoginCode::OutOfSync | LoginCode::BadPwdOrTicket)
    );

    if meaningful {
        res.put_u32(reply.user_id);
        if reply.login_code == LoginCode::Ok.to_u32() {
            res.put_str(&reply.email_id);
        } else {
            res.put_str("");
        }
        res.put_u64(reply.daemon_last_event_id);
        res.put_u32(u32::from(reply.secure));
        res.put_u32(u32::from(!reply.actual_pwd.is_empty()));
        res.put_str(&ctx.shared.config.web_host);
    } else {
        res.put_u32(0);
        res.put_str("");
        res.put_u64(0);
        res.put_u32(0);
        res.put_u32(0);
        res.put_str("");
    }
}

/// Handle the DISCONNECT command: drop the workspace if joined.
pub fn disconnect_kws<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    let kws_id = ctx.cmd.read_u64()?;
    if ctx.workspaces.contains_key(&kws_id) {
        ctx.remove_workspace(kws_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_type_classification() {
        assert_eq!(classify_login_type("admin"), LoginType::Root);
        assert_eq!(classify_login_type("kwmo"), LoginType::Portal);
        assert_eq!(classify_login_type("em42_7"), LoginType::Normal);
        assert_eq!(classify_login_type(""), LoginType::Normal);
    }

    #[test]
    fn signing_ticket_round_trip() {
        let mut buf = bytes::BytesMut::new();
        atom::write_str(&mut buf, "Jo");
        atom::write_str(&mut buf, "jo@example.com");
        atom::write_str(&mut buf, "kas.example.com");
        atom::write_u32(&mut buf, 443);
        atom::write_u64(&mut buf, 99);

        let ticket = parse_signing_ticket(&buf).unwrap();
        assert_eq!(ticket.email, "jo@example.com");
        assert_eq!(ticket.key_id, 99);

        assert!(parse_signing_ticket(&buf[..4]).is_err());
    }
}
