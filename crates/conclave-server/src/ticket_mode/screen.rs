//! Screen-sharing relay.
//!
//! The host path spawns the external reflector on an ephemeral local
//! port, records the session through the backend (which emits the start
//! event), then relays bytes between the client and the reflector. The
//! guest path resolves a recorded session to its port and relays. Both
//! enforce the licensed per-session time budget; the session-end
//! procedure receives the end code and message. Region coalescing is
//! deliberately disabled: the relay moves bytes opaquely.

use std::time::Duration;

use bytes::BytesMut;
use conclave_proto::{atom, types};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use super::{TicketFail, TicketResult, TicketSession};
use crate::backend::{
    BackendConn, BackendError, ChannelKind, anp_query_strict, parse_channel,
};

/// Relay buffer size per direction.
const RELAY_BUF_SIZE: usize = 256 * 1024;

/// Hard ceiling on the session budget; select-style waits dislike huge
/// durations.
const MAX_BUDGET: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// How the relay ended, reported to the end procedure.
struct SessionEnd {
    code: u32,
    message: String,
}

/// Guest side: join a recorded session.
pub async fn connect_session<R, W, C>(session: &mut TicketSession<R, W, C>) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    check_license(session)?;

    let session_id = session.ticket.session_id()?;

    let port = session
        .conn
        .screen_session_port(session.kws_id, session_id)
        .await
        .map_err(TicketFail::from)?
        .ok_or_else(|| TicketFail::Generic("the sharing session has been closed".to_owned()))?;

    let service = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|_| TicketFail::Generic("the sharing session has been closed".to_owned()))?;

    let ok = session.new_out(types::RES_OK);
    session.send(&ok).await?;

    let _end = relay(session, service).await?;
    Err(TicketFail::Connection("sharing session ended".to_owned()))
}

/// Host side: start the reflector, record the session, relay.
pub async fn start_session<R, W, C>(session: &mut TicketSession<R, W, C>) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    check_license(session)?;

    let subject = match session.in_msg.as_mut() {
        Some(msg) => msg.read_str()?,
        None => String::new(),
    };

    let (mut reflector, port, service) = spawn_reflector(session).await?;

    let outcome = host_loop(session, &subject, port, service).await;

    if let Err(e) = reflector.kill().await {
        tracing::debug!("reflector kill failed: {e}");
    }

    outcome
}

async fn host_loop<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    subject: &str,
    port: u16,
    service: TcpStream,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    // Record the session after the reflector is up so it cannot be
    // collected early. The procedure emits the start event.
    let mut extra = BytesMut::new();
    atom::write_str(&mut extra, subject);
    atom::write_u32(&mut extra, u32::from(port));
    let (_res, rest) = session.bound_query("start_vnc", None, &extra).await?;

    let mut buf = &rest[..];
    let session_id = atom::read_u64(&mut buf).map_err(BackendError::Reply)?;

    let mut ok = session.new_out(types::RES_OK);
    if session.minor >= 3 {
        ok.msg_type = types::RES_SCREEN_START_SESSION;
        ok.put_u64(session_id);
    }
    session.send(&ok).await?;

    let end = relay(session, service).await?;

    // Report the end of the session.
    let kws_id = session.kws_id;
    let user_id = session.user_id;
    let evt_minor = if session.minor >= 5 { 5 } else { 2 };
    anp_query_strict(&mut session.conn, "end_vnc", |buf| {
        atom::write_u64(buf, kws_id);
        atom::write_u32(buf, user_id);
        atom::write_u64(buf, session_id);
        atom::write_u32(buf, evt_minor);
        atom::write_u32(buf, end.code);
        atom::write_str(buf, &end.message);
    })
    .await
    .map_err(TicketFail::from)?;

    Err(TicketFail::Connection("sharing session ended".to_owned()))
}

/// Refuse screen sharing when the license grants no session time.
fn check_license<R, W, C>(session: &TicketSession<R, W, C>) -> TicketResult<()>
where
    C: BackendConn,
{
    if session.license.screen_share_secs == 0 {
        let mut msg = session.fail_kind(
            types::FAIL_RESOURCE_QUOTA,
            "not authorized to start a screen sharing session",
        );
        msg.put_u32(types::RESOURCE_QUOTA_GENERAL);
        return Err(TicketFail::Specific(msg));
    }
    Ok(())
}

/// Start the reflector on an ephemeral local port and connect to it.
async fn spawn_reflector<R, W, C>(
    session: &TicketSession<R, W, C>,
) -> TicketResult<(tokio::process::Child, u16, TcpStream)>
where
    C: BackendConn,
{
    // Reserve an ephemeral port for the reflector to bind.
    let probe = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| TicketFail::Internal(crate::error::ServerError::Io(e)))?;
    let port = probe
        .local_addr()
        .map_err(|e| TicketFail::Internal(crate::error::ServerError::Io(e)))?
        .port();
    drop(probe);

    let child = tokio::process::Command::new(&session.config.reflector_path)
        .arg("--port")
        .arg(port.to_string())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            TicketFail::Internal(crate::error::ServerError::Transport(format!(
                "cannot start reflector: {e}"
            )))
        })?;

    // The reflector needs a moment to bind.
    let mut service = None;
    for _ in 0..50 {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => {
                service = Some(stream);
                break;
            },
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    let service = service.ok_or_else(|| {
        TicketFail::Generic("the reflector did not come up".to_owned())
    })?;

    Ok((child, port, service))
}

/// Relay bytes between the client and the reflector until either side
/// closes, the time budget runs out, or the workspace permission check
/// denies. Returns how the session ended.
async fn relay<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    mut service: TcpStream,
) -> TicketResult<SessionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    tracing::info!(kws_id = session.kws_id, "screen relay starting (region joining disabled)");

    // Wait for the client's synchronization byte.
    let mut sync = [0u8; 1];
    loop {
        let n = session
            .reader
            .read_raw(&mut sync)
            .await
            .map_err(|e| TicketFail::Connection(e.to_string()))?;
        if n == 0 {
            return Err(TicketFail::Connection("client closed before sync".to_owned()));
        }
        if n == 1 {
            break;
        }
    }

    let budget = Duration::from_secs(session.license.screen_share_secs).min(MAX_BUDGET);
    let deadline = tokio::time::Instant::now() + budget;

    let mut client_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut service_buf = vec![0u8; RELAY_BUF_SIZE];

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                return Ok(SessionEnd {
                    code: types::FAIL_RESOURCE_QUOTA,
                    message: "maximum screen sharing session time reached".to_owned(),
                });
            },

            notification = session.conn.notified() => {
                let notification = notification.map_err(TicketFail::from)?;
                if matches!(
                    parse_channel(&notification.channel),
                    Some((_, ChannelKind::PermCheck))
                ) {
                    match session.perm_check().await {
                        Ok(()) => {},
                        Err(TicketFail::Specific(_)) => {
                            return Ok(SessionEnd {
                                code: types::FAIL_PERM_DENIED,
                                message: "permission to the workspace was revoked".to_owned(),
                            });
                        },
                        Err(e) => return Err(e),
                    }
                }
            },

            read = session.reader.read_raw(&mut client_buf) => {
                let n = read.map_err(|e| TicketFail::Connection(e.to_string()))?;
                if n == 0 {
                    return Ok(end_generic("client closed the session"));
                }
                if let Err(e) = service.write_all(&client_buf[..n]).await {
                    tracing::debug!("reflector write failed: {e}");
                    return Ok(end_generic("the sharing session has been closed"));
                }
            },

            read = service.read(&mut service_buf) => {
                match read {
                    Ok(0) => return Ok(end_generic("the sharing session has been closed")),
                    Ok(n) => {
                        session
                            .writer
                            .send_raw(&service_buf[..n])
                            .await
                            .map_err(|e| TicketFail::Connection(e.to_string()))?;
                    },
                    Err(e) => {
                        tracing::debug!("reflector read failed: {e}");
                        return Ok(end_generic("the sharing session has been closed"));
                    },
                }
            },
        }
    }
}

fn end_generic(message: &str) -> SessionEnd {
    SessionEnd { code: types::FAIL_GENERIC, message: message.to_owned() }
}
