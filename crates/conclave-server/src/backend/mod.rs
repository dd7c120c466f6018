//! Database backend abstraction.
//!
//! The daemon never speaks SQL for its domain logic: it invokes named
//! server-side procedures whose single argument and reply are opaque
//! ANP-encoded blobs, plus a handful of fixed row queries (ticket ledger,
//! event log pages, quota rows). This trait pair is the seam: the
//! production implementation is Postgres via sqlx, tests run against the
//! in-memory implementation.
//!
//! Every actor owns its connection exclusively: the commander and eventer
//! of a session hold one each, a ticket-mode session holds one.

mod memory;
mod postgres;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use conclave_proto::atom;
pub use memory::{
    MemFile, MemLicense, MemShare, MemUser, MemWorkspace, MemoryBackend, MemoryState,
};
pub use postgres::PgBackend;
use thiserror::Error;

/// Backend failure. Session-fatal wherever it surfaces.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Database-level failure.
    #[error("database error: {0}")]
    Db(String),

    /// A procedure reply blob did not decode as expected.
    #[error("malformed procedure reply: {0}")]
    Reply(#[from] conclave_proto::ProtocolError),

    /// The backend connection is gone.
    #[error("backend connection closed")]
    Closed,
}

impl From<sqlx::Error> for BackendError {
    fn from(e: sqlx::Error) -> Self {
        Self::Db(e.to_string())
    }
}

/// One row of a workspace's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    /// Monotone event id assigned by the backend
    pub id: u64,
    /// Minimum minor version required to describe the event
    pub minor: u32,
    /// Message type of the event
    pub msg_type: u32,
    /// ANP-encoded event payload
    pub payload: Bytes,
}

/// A workspace member row, used by the v2 choose-user-id reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    /// User id within the workspace
    pub user_id: u32,
    /// Administrator-assigned name
    pub name: String,
    /// Email address
    pub email: String,
}

/// File usage and quota of a workspace, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRow {
    /// Bytes currently stored
    pub file_size: u64,
    /// Bytes permitted
    pub file_quota: u64,
}

/// A notification received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel name, e.g. `kws_42_event_log`
    pub channel: String,
}

/// Connection factory. Cloned freely; each actor connects on its own.
#[async_trait]
pub trait Backend: Clone + Send + Sync + 'static {
    /// The connection type handed to actors.
    type Conn: BackendConn;

    /// Open a dedicated connection.
    async fn connect(&self) -> Result<Self::Conn, BackendError>;
}

/// One exclusively-owned backend connection.
#[async_trait]
pub trait BackendConn: Send + Sync {
    /// Invoke a named procedure with an ANP-encoded argument blob and
    /// return its raw reply blob.
    async fn call(&mut self, proc: &str, args: Bytes) -> Result<Bytes, BackendError>;

    /// Start listening on a notification channel.
    async fn listen(&mut self, channel: &str) -> Result<(), BackendError>;

    /// Stop listening on a notification channel.
    async fn unlisten(&mut self, channel: &str) -> Result<(), BackendError>;

    /// Next pending notification without waiting, if any.
    fn try_notification(&mut self) -> Option<Notification>;

    /// Wait for the next notification.
    async fn notified(&mut self) -> Result<Notification, BackendError>;

    /// Page of the event log: events with `id > after_id`, ordered by id,
    /// at most `limit` rows.
    async fn poll_events(
        &mut self,
        kws_id: u64,
        after_id: u64,
        limit: u32,
    ) -> Result<Vec<EventRow>, BackendError>;

    /// Insert a minted ticket into the ledger.
    async fn insert_ticket(&mut self, creation_date: u64, ticket: &[u8])
    -> Result<(), BackendError>;

    /// Atomically delete a ticket if present and younger than `ttl_secs`.
    /// True if the ticket was consumed.
    async fn consume_ticket(&mut self, ticket: &[u8], ttl_secs: u64)
    -> Result<bool, BackendError>;

    /// File usage and quota of a workspace. `None` if no such workspace.
    async fn workspace_quota(&mut self, kws_id: u64) -> Result<Option<QuotaRow>, BackendError>;

    /// Email address the workspace is licensed to, if any.
    async fn license_email(&mut self, kws_id: u64) -> Result<Option<String>, BackendError>;

    /// Local port of a recorded screen-share session, if it still exists.
    async fn screen_session_port(
        &mut self,
        kws_id: u64,
        session_id: u64,
    ) -> Result<Option<u16>, BackendError>;

    /// All member rows of a workspace.
    async fn workspace_users(&mut self, kws_id: u64) -> Result<Vec<UserRow>, BackendError>;

    /// True if the workspace administrators trust the given signing key id.
    async fn workspace_trusts_key(
        &mut self,
        kws_id: u64,
        key_id: u64,
    ) -> Result<bool, BackendError>;
}

/// A procedure reply after the leading status atom.
///
/// Every procedure reply blob starts with a status U32: zero means success
/// and the output parameters follow; non-zero means a user-level error and
/// an explanation STR follows.
#[derive(Debug)]
pub enum ProcReply {
    /// Output parameters, positioned after the status atom.
    Ok(Bytes),
    /// User-level refusal with its explanation.
    UserError(String),
}

/// Invoke a procedure whose arguments are written by `args`.
pub async fn anp_query<C: BackendConn + ?Sized>(
    conn: &mut C,
    proc: &str,
    args: impl FnOnce(&mut BytesMut),
) -> Result<ProcReply, BackendError> {
    let mut input = BytesMut::new();
    args(&mut input);
    let reply = conn.call(proc, input.freeze()).await?;

    let mut buf = &reply[..];
    let status = atom::read_u32(&mut buf)?;
    if status != 0 {
        let text = atom::read_str(&mut buf)?;
        return Ok(ProcReply::UserError(text));
    }
    Ok(ProcReply::Ok(reply.slice(reply.len() - buf.len()..)))
}

/// Like [`anp_query`] but a user-level error is escalated to a backend
/// error. For procedures that have no legitimate refusal path.
pub async fn anp_query_strict<C: BackendConn + ?Sized>(
    conn: &mut C,
    proc: &str,
    args: impl FnOnce(&mut BytesMut),
) -> Result<Bytes, BackendError> {
    match anp_query(conn, proc, args).await? {
        ProcReply::Ok(rest) => Ok(rest),
        ProcReply::UserError(text) => Err(BackendError::Db(text)),
    }
}

/// Reply of a workspace-bound procedure.
#[derive(Debug)]
pub struct BoundReply {
    /// Type of the result message to return to the client
    pub res_type: u32,
    /// Payload of the result message
    pub res_payload: Bytes,
    /// True if the result is a failure the handler already composed
    pub user_error: bool,
    /// Remaining output parameters after the result triple
    pub rest: Bytes,
}

/// Invoke a workspace-bound procedure.
///
/// The argument blob carries the uniform prefix (workspace id, date, login
/// type, user id, effective minor, command payload BIN) followed by
/// `extra` arguments. The reply carries (result type U32, result payload
/// BIN, user-error code U32) followed by procedure-specific outputs.
#[allow(clippy::too_many_arguments)]
pub async fn kws_bound_query<C: BackendConn + ?Sized>(
    conn: &mut C,
    proc: &str,
    kws_id: u64,
    date: u64,
    login_type: u32,
    user_id: u32,
    minor: u32,
    cmd_payload: Option<&[u8]>,
    extra: &[u8],
) -> Result<Result<BoundReply, String>, BackendError> {
    let reply = anp_query(conn, proc, |buf| {
        atom::write_u64(buf, kws_id);
        atom::write_u64(buf, date);
        atom::write_u32(buf, login_type);
        atom::write_u32(buf, user_id);
        atom::write_u32(buf, minor);
        atom::write_bin(buf, cmd_payload.unwrap_or(b""));
        buf.extend_from_slice(extra);
    })
    .await?;

    let rest = match reply {
        ProcReply::Ok(rest) => rest,
        ProcReply::UserError(text) => return Ok(Err(text)),
    };

    let mut buf = &rest[..];
    let res_type = atom::read_u32(&mut buf)?;
    let res_payload = atom::read_bin(&mut buf)?;
    let code = atom::read_u32(&mut buf)?;

    Ok(Ok(BoundReply {
        res_type,
        res_payload,
        user_error: code != 0,
        rest: rest.slice(rest.len() - buf.len()..),
    }))
}

/// Channel name carrying event-log notifications for a workspace.
#[must_use]
pub fn event_log_channel(kws_id: u64) -> String {
    format!("kws_{kws_id}_event_log")
}

/// Channel name carrying permission-check notifications for a workspace.
#[must_use]
pub fn perm_check_channel(kws_id: u64) -> String {
    format!("kws_{kws_id}_perm_check")
}

/// Parse a notification channel name back into its workspace id and kind.
#[must_use]
pub fn parse_channel(channel: &str) -> Option<(u64, ChannelKind)> {
    let rest = channel.strip_prefix("kws_")?;
    if let Some(id) = rest.strip_suffix("_event_log") {
        return Some((id.parse().ok()?, ChannelKind::EventLog));
    }
    if let Some(id) = rest.strip_suffix("_perm_check") {
        return Some((id.parse().ok()?, ChannelKind::PermCheck));
    }
    None
}

/// What a workspace notification channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// New rows in the workspace event log.
    EventLog,
    /// The workspace's permissions must be rechecked.
    PermCheck,
}

/// Seconds since the UNIX epoch.
#[must_use]
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_round_trip() {
        assert_eq!(parse_channel(&event_log_channel(42)), Some((42, ChannelKind::EventLog)));
        assert_eq!(parse_channel(&perm_check_channel(7)), Some((7, ChannelKind::PermCheck)));
        assert_eq!(parse_channel("kws_x_event_log"), None);
        assert_eq!(parse_channel("other"), None);
    }
}
