//! Postgres backend via sqlx.
//!
//! Named procedures are server-side functions taking one `bytea` argument
//! (the ANP-encoded blob) and returning one `bytea` reply. Notifications
//! ride LISTEN/NOTIFY through a dedicated `PgListener`; row queries go
//! through the shared pool. One `PgConn` per actor.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{
    Row,
    postgres::{PgListener, PgPool, PgPoolOptions},
};

use super::{
    Backend, BackendConn, BackendError, EventRow, Notification, QuotaRow, UserRow,
};

/// Procedure names accepted over the wire. The set is closed so a
/// procedure name can be spliced into SQL (identifiers cannot be bound).
const KNOWN_PROCS: &[&str] = &[
    "connect_kws",
    "check_kws_login",
    "get_usage_and_license_info",
    "handle_kws_prop_change",
    "cmd_chat_msg",
    "cmd_kws_get_uurl",
    "cmd_pb_accept_chat",
    "cmd_mgt_invite_kws",
    "cmd_mgt_create_kws",
    "store_kws_user_ticket",
    "register_kws_user",
    "upload_phase_one",
    "refresh_upload",
    "upload_phase_two",
    "download_file",
    "start_vnc",
    "end_vnc",
];

/// Postgres-backed connection factory.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    url: String,
}

impl PgBackend {
    /// Connect the shared pool.
    pub async fn connect(database_url: &str) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(32)
            .connect(database_url)
            .await?;
        Ok(Self { pool, url: database_url.to_owned() })
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Conn = PgConn;

    async fn connect(&self) -> Result<PgConn, BackendError> {
        Ok(PgConn { pool: self.pool.clone(), url: self.url.clone(), listener: None })
    }
}

/// One Postgres-backed actor connection.
pub struct PgConn {
    pool: PgPool,
    url: String,
    /// Created lazily on the first LISTEN; carries all notifications.
    listener: Option<PgListener>,
}

impl PgConn {
    async fn listener(&mut self) -> Result<&mut PgListener, BackendError> {
        if self.listener.is_none() {
            self.listener = Some(PgListener::connect(&self.url).await?);
        }
        // Freshly set above when it was absent.
        self.listener.as_mut().ok_or(BackendError::Closed)
    }
}

#[async_trait]
impl BackendConn for PgConn {
    async fn call(&mut self, proc: &str, args: Bytes) -> Result<Bytes, BackendError> {
        if !KNOWN_PROCS.contains(&proc) {
            return Err(BackendError::Db(format!("unknown procedure: {proc}")));
        }
        let row = sqlx::query(&format!("SELECT {proc}($1) AS reply"))
            .bind(args.as_ref())
            .fetch_one(&self.pool)
            .await?;
        let reply: Vec<u8> = row.try_get("reply")?;
        Ok(Bytes::from(reply))
    }

    async fn listen(&mut self, channel: &str) -> Result<(), BackendError> {
        self.listener().await?.listen(channel).await?;
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> Result<(), BackendError> {
        self.listener().await?.unlisten(channel).await?;
        Ok(())
    }

    fn try_notification(&mut self) -> Option<Notification> {
        // Pending notifications are surfaced by `notified`; the poll-based
        // drain is only meaningful for in-process backends.
        None
    }

    async fn notified(&mut self) -> Result<Notification, BackendError> {
        let notification = self.listener().await?.recv().await?;
        Ok(Notification { channel: notification.channel().to_owned() })
    }

    async fn poll_events(
        &mut self,
        kws_id: u64,
        after_id: u64,
        limit: u32,
    ) -> Result<Vec<EventRow>, BackendError> {
        let rows = sqlx::query(
            "SELECT evt_id, minor, type, event FROM kws_event_log \
             WHERE kws_id = $1 AND evt_id > $2 ORDER BY evt_id LIMIT $3",
        )
        .bind(kws_id as i64)
        .bind(after_id as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(EventRow {
                    id: row.try_get::<i64, _>("evt_id")? as u64,
                    minor: row.try_get::<i32, _>("minor")? as u32,
                    msg_type: row.try_get::<i64, _>("type")? as u32,
                    payload: Bytes::from(row.try_get::<Vec<u8>, _>("event")?),
                })
            })
            .collect()
    }

    async fn insert_ticket(
        &mut self,
        creation_date: u64,
        ticket: &[u8],
    ) -> Result<(), BackendError> {
        sqlx::query("INSERT INTO conclave_ticket (creation_date, ticket) VALUES ($1, $2)")
            .bind(creation_date as i64)
            .bind(ticket)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn consume_ticket(
        &mut self,
        ticket: &[u8],
        ttl_secs: u64,
    ) -> Result<bool, BackendError> {
        let row = sqlx::query("SELECT consume_conclave_ticket($1, $2) AS consumed")
            .bind(ticket)
            .bind(ttl_secs as i64)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i32, _>("consumed")? != 0)
    }

    async fn workspace_quota(&mut self, kws_id: u64) -> Result<Option<QuotaRow>, BackendError> {
        let row = sqlx::query(
            "SELECT file_size, file_quota FROM kws_store_limit WHERE kws_id = $1",
        )
        .bind(kws_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(QuotaRow {
                file_size: row.try_get::<i64, _>("file_size")? as u64,
                file_quota: row.try_get::<i64, _>("file_quota")? as u64,
            })
        })
        .transpose()
    }

    async fn license_email(&mut self, kws_id: u64) -> Result<Option<String>, BackendError> {
        let row = sqlx::query("SELECT email FROM kws_users WHERE kws_id = $1 AND user_id = 1")
            .bind(kws_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Ok(row.try_get("email")?)).transpose()
    }

    async fn screen_session_port(
        &mut self,
        kws_id: u64,
        session_id: u64,
    ) -> Result<Option<u16>, BackendError> {
        let row = sqlx::query(
            "SELECT port FROM kws_screen_session WHERE kws_id = $1 AND session_id = $2",
        )
        .bind(kws_id as i64)
        .bind(session_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| Ok(row.try_get::<i32, _>("port")? as u16)).transpose()
    }

    async fn workspace_users(&mut self, kws_id: u64) -> Result<Vec<UserRow>, BackendError> {
        let rows =
            sqlx::query("SELECT user_id, name_admin, email FROM kws_users WHERE kws_id = $1")
                .bind(kws_id as i64)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|row| {
                Ok(UserRow {
                    user_id: row.try_get::<i32, _>("user_id")? as u32,
                    name: row.try_get("name_admin")?,
                    email: row.try_get("email")?,
                })
            })
            .collect()
    }

    async fn workspace_trusts_key(
        &mut self,
        kws_id: u64,
        key_id: u64,
    ) -> Result<bool, BackendError> {
        let row = sqlx::query(
            "SELECT count(*) AS n FROM kws_trusted_key WHERE kws_id = $1 AND key_id = $2",
        )
        .bind(kws_id as i64)
        .bind(key_id as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")? > 0)
    }
}
