//! Ticket-mode session handler.
//!
//! After role negotiation, a file-transfer or screen-share session sends
//! one paired command carrying the ticket minted by a principal session.
//! The handler validates and consumes the ticket (once, ever), LISTENs on
//! the workspace's permission-check channel, loads the license and usage
//! information, and dispatches on the ticket kind. A single task
//! suffices: notifications are drained between transport cycles.

mod download;
mod screen;
mod upload;

use bytes::Bytes;
use conclave_proto::{Message, Ticket, TicketKind, types};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};

use crate::{
    backend::{
        Backend, BackendConn, BackendError, ChannelKind, anp_query_strict, kws_bound_query,
        now_secs, parse_channel, perm_check_channel,
    },
    config::ServerConfig,
    error::ServerError,
    transport::{MessageReader, MessageWriter},
};

/// How a ticket-mode operation failed.
#[derive(Debug)]
pub enum TicketFail {
    /// Internal failure; the session closes without a reply.
    Internal(ServerError),
    /// User-level failure reported as the generic FAIL result.
    Generic(String),
    /// A specific failure result, already composed.
    Specific(Message),
    /// The connection with the client is gone.
    Connection(String),
}

impl From<BackendError> for TicketFail {
    fn from(e: BackendError) -> Self {
        Self::Internal(ServerError::Backend(e))
    }
}

impl From<conclave_proto::ProtocolError> for TicketFail {
    fn from(e: conclave_proto::ProtocolError) -> Self {
        // Malformed client data is the client's fault.
        Self::Generic(e.to_string())
    }
}

/// Result type of ticket-mode operations.
pub type TicketResult<T> = Result<T, TicketFail>;

/// Resource usage of the license holder.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageInfo {
    /// Regular workspaces in use
    pub nb_kws: u32,
    /// Public workspaces in use
    pub nb_public_kws: u32,
    /// File bytes in use
    pub file_bytes: u64,
}

/// License limits of the license holder.
#[derive(Debug, Clone)]
pub struct LicenseInfo {
    /// License holder name
    pub name: String,
    /// Licensed regular workspaces
    pub nb_kws: u32,
    /// Licensed public workspaces
    pub nb_public_kws: u32,
    /// Licensed file bytes
    pub file_bytes: u64,
    /// Whether secure workspaces are licensed
    pub secure: bool,
    /// Licensed screen-share seconds per session
    pub screen_share_secs: u64,
}

impl Default for LicenseInfo {
    fn default() -> Self {
        // Without a license holder there is nothing to meter against;
        // file transfers stay open, screen sharing stays closed.
        Self {
            name: String::new(),
            nb_kws: 0,
            nb_public_kws: 0,
            file_bytes: u64::MAX,
            secure: false,
            screen_share_secs: 0,
        }
    }
}

/// State of one ticket-mode session.
pub struct TicketSession<R, W, C> {
    /// Wire receive side
    pub reader: MessageReader<R>,
    /// Wire send side
    pub writer: MessageWriter<W>,
    /// The session's backend connection
    pub conn: C,
    /// Server configuration
    pub config: ServerConfig,
    /// Effective minor of the session
    pub minor: u32,
    /// The consumed ticket
    pub ticket: Ticket,
    /// Workspace the ticket is bound to
    pub kws_id: u64,
    /// Login type bound into the ticket
    pub login_type: u32,
    /// User the ticket is bound to
    pub user_id: u32,
    /// Current message being processed
    pub in_msg: Option<Message>,
    /// License holder usage
    pub usage: UsageInfo,
    /// License limits
    pub license: LicenseInfo,
    /// Daemon shutdown signal
    pub quit: watch::Receiver<bool>,
}

impl<R, W, C> TicketSession<R, W, C> {
    /// Create an output message of the given type at the session minor.
    pub fn new_out(&self, msg_type: u32) -> Message {
        let mut msg = Message::new(msg_type);
        msg.minor = self.minor;
        msg
    }

    /// Compose the generic failure result.
    pub fn fail_generic(&self, text: &str) -> Message {
        let mut msg = self.new_out(types::RES_FAIL);
        msg.put_u32(types::FAIL_GENERIC).put_str(text);
        msg
    }

    /// Compose a failure result of the given kind.
    pub fn fail_kind(&self, kind: u32, text: &str) -> Message {
        let mut msg = self.new_out(types::RES_FAIL);
        msg.put_u32(kind).put_str(text);
        msg
    }

    /// Storage directory of the session's workspace.
    pub fn store_dir(&self) -> std::path::PathBuf {
        self.config.store_root.join(self.kws_id.to_string())
    }
}

impl<R, W, C> TicketSession<R, W, C>
where
    C: BackendConn,
{
    /// Run the permission procedure; a denial ends the session with a
    /// permission-denied failure.
    pub async fn perm_check(&mut self) -> TicketResult<()> {
        let kws_id = self.kws_id;
        let login_type = self.login_type;
        let user_id = self.user_id;
        let rest = anp_query_strict(&mut self.conn, "check_kws_login", |buf| {
            conclave_proto::atom::write_u64(buf, kws_id);
            conclave_proto::atom::write_u32(buf, login_type);
            conclave_proto::atom::write_u32(buf, user_id);
        })
        .await?;

        let mut buf = &rest[..];
        let denied = conclave_proto::atom::read_u32(&mut buf).map_err(BackendError::Reply)?;
        let _login_code = conclave_proto::atom::read_u32(&mut buf).map_err(BackendError::Reply)?;
        let text = conclave_proto::atom::read_str(&mut buf).map_err(BackendError::Reply)?;

        if denied != 0 {
            tracing::info!(kws_id = self.kws_id, "permission check failed: {text}");
            return Err(TicketFail::Specific(
                self.fail_kind(types::FAIL_PERM_DENIED, &text),
            ));
        }
        Ok(())
    }

    /// Drain pending notifications; a permission-check notification
    /// triggers the permission procedure.
    pub async fn process_notifications(&mut self) -> TicketResult<()> {
        let mut recheck = false;
        while let Some(notification) = self.conn.try_notification() {
            if matches!(
                parse_channel(&notification.channel),
                Some((_, ChannelKind::PermCheck))
            ) {
                recheck = true;
            }
        }
        if recheck {
            self.perm_check().await?;
        }
        Ok(())
    }

    /// Invoke a workspace-bound procedure. Returns the result message
    /// (type and payload applied from the procedure) and the remaining
    /// output parameters. A user-error reply surfaces as a specific
    /// failure.
    pub async fn bound_query(
        &mut self,
        proc: &str,
        cmd_payload: Option<&[u8]>,
        extra: &[u8],
    ) -> TicketResult<(Message, Bytes)> {
        let reply = kws_bound_query(
            &mut self.conn,
            proc,
            self.kws_id,
            now_secs(),
            self.login_type,
            self.user_id,
            self.minor,
            cmd_payload,
            extra,
        )
        .await?;

        let reply = match reply {
            Ok(reply) => reply,
            Err(text) => return Err(TicketFail::Generic(text)),
        };

        let mut res = self.new_out(reply.res_type);
        res.set_payload(&reply.res_payload).map_err(BackendError::Reply)?;

        if reply.user_error {
            return Err(TicketFail::Specific(res));
        }
        Ok((res, reply.rest))
    }

    /// Refresh the license holder's usage and license information.
    pub async fn refresh_usage_and_license(&mut self) -> Result<(), BackendError> {
        let email = self.conn.license_email(self.kws_id).await?;
        let Some(email) = email else {
            self.usage = UsageInfo::default();
            self.license = LicenseInfo::default();
            return Ok(());
        };

        let rest = anp_query_strict(&mut self.conn, "get_usage_and_license_info", |buf| {
            conclave_proto::atom::write_str(buf, &email);
        })
        .await?;

        use conclave_proto::atom::{read_str, read_u32, read_u64};
        let mut buf = &rest[..];
        self.usage = UsageInfo {
            nb_kws: read_u32(&mut buf).map_err(BackendError::Reply)?,
            nb_public_kws: read_u32(&mut buf).map_err(BackendError::Reply)?,
            file_bytes: read_u64(&mut buf).map_err(BackendError::Reply)?,
        };
        self.license = LicenseInfo {
            name: read_str(&mut buf).map_err(BackendError::Reply)?,
            nb_kws: read_u32(&mut buf).map_err(BackendError::Reply)?,
            nb_public_kws: read_u32(&mut buf).map_err(BackendError::Reply)?,
            file_bytes: read_u64(&mut buf).map_err(BackendError::Reply)?,
            secure: read_u32(&mut buf).map_err(BackendError::Reply)? != 0,
            screen_share_secs: read_u64(&mut buf).map_err(BackendError::Reply)?,
        };
        Ok(())
    }
}

impl<R, W, C> TicketSession<R, W, C>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    /// Send one message, draining notifications around the write.
    pub async fn send(&mut self, msg: &Message) -> TicketResult<()> {
        self.process_notifications().await?;
        self.writer
            .send(msg)
            .await
            .map_err(|e| TicketFail::Connection(e.to_string()))?;
        self.process_notifications().await
    }

    /// Receive the next message, processing notifications while waiting.
    pub async fn recv(&mut self) -> TicketResult<Message> {
        match self.timed_recv(None).await? {
            Some(msg) => Ok(msg),
            // Unreachable without a deadline; treat as closed.
            None => Err(TicketFail::Connection("no message received".to_owned())),
        }
    }

    /// Receive the next message with an optional deadline. `None` on
    /// timeout.
    pub async fn timed_recv(
        &mut self,
        timeout: Option<std::time::Duration>,
    ) -> TicketResult<Option<Message>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = self.reader.recv() => {
                    return msg
                        .map(Some)
                        .map_err(|e| TicketFail::Connection(e.to_string()));
                },
                notification = self.conn.notified() => {
                    let notification = notification.map_err(TicketFail::from)?;
                    if matches!(
                        parse_channel(&notification.channel),
                        Some((_, ChannelKind::PermCheck))
                    ) {
                        self.perm_check().await?;
                    }
                },
                () = sleep => return Ok(None),
                _ = self.quit.changed() => {
                    return Err(TicketFail::Connection("daemon shutting down".to_owned()));
                },
            }
        }
    }
}

/// Handle one ticket-mode connection after role negotiation.
pub async fn run<R, W, B>(
    reader: MessageReader<R>,
    writer: MessageWriter<W>,
    backend: &B,
    config: ServerConfig,
    minor: u32,
    peer: &str,
    quit: watch::Receiver<bool>,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    B: Backend,
{
    let conn = backend.connect().await?;

    let outcome = serve(reader, writer, conn, config, minor, quit).await;

    match outcome {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::info!(peer, "ticket-mode session ended: {e}");
            Err(e)
        },
    }
}

async fn serve<R, W, C>(
    reader: MessageReader<R>,
    writer: MessageWriter<W>,
    conn: C,
    config: ServerConfig,
    minor: u32,
    quit: watch::Receiver<bool>,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let mut session = TicketSession {
        reader,
        writer,
        conn,
        config,
        minor,
        ticket: Ticket {
            kind: 0,
            kws_id: 0,
            login_type: 0,
            user_id: 0,
            extension: Bytes::new(),
            nonce: Bytes::new(),
        },
        kws_id: 0,
        login_type: 0,
        user_id: 0,
        in_msg: None,
        usage: UsageInfo::default(),
        license: LicenseInfo::default(),
        quit,
    };

    match dispatch(&mut session).await {
        Ok(()) => Ok(()),
        Err(TicketFail::Internal(e)) => Err(e),
        Err(TicketFail::Connection(text)) => {
            tracing::debug!("ticket-mode connection lost: {text}");
            Ok(())
        },
        Err(TicketFail::Generic(text)) => {
            let msg = session.fail_generic(&text);
            report_failure(&mut session, msg).await
        },
        Err(TicketFail::Specific(msg)) => report_failure(&mut session, msg).await,
    }
}

/// Send a failure result and close.
async fn report_failure<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    msg: Message,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    tracing::info!("closing ticket-mode session after failure: {}", msg.dump());
    if let Err(e) = session.writer.send(&msg).await {
        tracing::debug!("could not deliver failure result: {e}");
    }
    Ok(())
}

async fn dispatch<R, W, C>(session: &mut TicketSession<R, W, C>) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    // The paired command carrying the ticket.
    let mut first = session.recv().await?;

    let Some(spec) = crate::ticket::spec_for_first_msg(first.msg_type) else {
        return Err(TicketFail::Generic(format!(
            "invalid request type ({})",
            first.msg_type
        )));
    };

    // Validate and consume the ticket.
    let raw = first.read_bin()?;
    let ticket = Ticket::decode(&raw)?;
    if ticket.kind() != Some(spec.kind) {
        return Err(TicketFail::Generic("invalid ticket type".to_owned()));
    }

    let ttl = session.config.ticket_ttl_secs;
    if !session.conn.consume_ticket(&raw, ttl).await? {
        return Err(TicketFail::Generic("expired ticket".to_owned()));
    }

    session.kws_id = ticket.kws_id;
    session.login_type = ticket.login_type;
    session.user_id = ticket.user_id;
    session.ticket = ticket;
    session.in_msg = Some(first);

    // Watch for permission changes, then check once before serving.
    let channel = perm_check_channel(session.kws_id);
    session.conn.listen(&channel).await.map_err(TicketFail::from)?;
    session.perm_check().await?;

    session.refresh_usage_and_license().await?;

    match spec.kind {
        TicketKind::Upload => upload::handle(session).await,
        TicketKind::Download => download::handle(session).await,
        TicketKind::ScreenHost => screen::start_session(session).await,
        TicketKind::ScreenGuest => screen::connect_session(session).await,
    }
}
