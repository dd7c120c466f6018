//! In-memory backend for tests and simulation.
//!
//! Implements the same named procedures and row queries as the Postgres
//! backend against plain maps, including event-log notifications. All
//! state sits behind one mutex; clones share it, so a test can seed
//! workspaces through one handle while the engine under test talks through
//! another.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use conclave_proto::{atom, types};
use tokio::sync::mpsc;

use super::{
    Backend, BackendConn, BackendError, EventRow, Notification, QuotaRow, UserRow,
    event_log_channel, now_secs, perm_check_channel,
};

/// A workspace member.
#[derive(Debug, Clone, Default)]
pub struct MemUser {
    /// User id within the workspace
    pub user_id: u32,
    /// Display name
    pub name: String,
    /// Email address
    pub email: String,
    /// Email id credential
    pub email_id: String,
    /// Assigned password, empty if none
    pub pwd: String,
    /// User flag bits
    pub flags: u32,
}

/// One file of a share.
#[derive(Debug, Clone)]
pub struct MemFile {
    /// Storage path relative to the workspace storage directory
    pub path: String,
    /// Commit that produced the file
    pub commit_id: u64,
}

/// A share holding files.
#[derive(Debug, Clone, Default)]
pub struct MemShare {
    /// Inode allocator
    pub next_inode: u64,
    /// Files by inode
    pub files: BTreeMap<u64, MemFile>,
}

/// A workspace.
#[derive(Debug, Clone)]
pub struct MemWorkspace {
    /// Workspace name
    pub name: String,
    /// Workspace flag bits
    pub flags: u32,
    /// Members
    pub users: Vec<MemUser>,
    /// Event log
    pub events: Vec<EventRow>,
    /// Next event id to assign (event ids start at 1)
    pub next_event_id: u64,
    /// Bytes currently stored
    pub file_size: u64,
    /// Byte quota
    pub file_quota: u64,
    /// Shares by id
    pub shares: BTreeMap<u32, MemShare>,
    /// Screen-share sessions by id, valued by local port
    pub screen_sessions: BTreeMap<u64, u16>,
    /// Commit id allocator
    pub next_commit_id: u64,
    /// Signing key ids trusted by the workspace administrators
    pub trusted_keys: HashSet<u64>,
    /// Forced permission denial: (login code, message)
    pub denied: Option<(u32, String)>,
    /// Tickets persisted by `store_kws_user_ticket`
    pub stored_tickets: Vec<Bytes>,
}

impl Default for MemWorkspace {
    fn default() -> Self {
        Self {
            name: String::new(),
            flags: 0,
            users: Vec::new(),
            events: Vec::new(),
            next_event_id: 1,
            file_size: 0,
            file_quota: u64::MAX,
            shares: BTreeMap::new(),
            screen_sessions: BTreeMap::new(),
            next_commit_id: 1,
            trusted_keys: HashSet::new(),
            denied: None,
            stored_tickets: Vec::new(),
        }
    }
}

/// License information returned by `get_usage_and_license_info`.
#[derive(Debug, Clone)]
pub struct MemLicense {
    /// License holder name
    pub name: String,
    /// Licensed regular workspace count
    pub nb_kws: u32,
    /// Licensed public workspace count
    pub nb_public_kws: u32,
    /// Licensed file storage, in bytes
    pub file_bytes: u64,
    /// Whether secure workspaces are licensed
    pub secure: bool,
    /// Licensed screen-share session seconds
    pub screen_share_secs: u64,
}

impl Default for MemLicense {
    fn default() -> Self {
        Self {
            name: "test".to_owned(),
            nb_kws: 100,
            nb_public_kws: 100,
            file_bytes: u64::MAX,
            secure: true,
            screen_share_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Default)]
struct LedgerRow {
    creation_date: u64,
    ticket: Bytes,
}

/// Shared state of the in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryState {
    /// Workspaces by id
    pub workspaces: BTreeMap<u64, MemWorkspace>,
    /// License granted to every workspace
    pub license: MemLicense,
    /// Aggregate file usage reported for the license holder
    pub license_file_usage: u64,
    tickets: Vec<LedgerRow>,
    next_kws_id: u64,
    next_session_id: u64,
    next_conn_id: u64,
    listeners: HashMap<u64, Listener>,
}

#[derive(Debug)]
struct Listener {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<Notification>,
}

impl MemoryState {
    fn notify(&mut self, channel: &str) {
        for listener in self.listeners.values() {
            if listener.channels.contains(channel) {
                let _ = listener.tx.send(Notification { channel: channel.to_owned() });
            }
        }
    }

    /// Append an event to a workspace's log and fire its notification.
    /// Returns the assigned event id.
    pub fn post_event(&mut self, kws_id: u64, minor: u32, msg_type: u32, payload: Bytes) -> u64 {
        let Some(ws) = self.workspaces.get_mut(&kws_id) else { return 0 };
        let id = ws.next_event_id;
        ws.next_event_id += 1;
        ws.events.push(EventRow { id, minor, msg_type, payload });
        self.notify(&event_log_channel(kws_id));
        id
    }

    /// Force subsequent permission checks on a workspace to deny with the
    /// given login code, and fire the permission-check notification.
    pub fn deny_workspace(&mut self, kws_id: u64, login_code: u32, message: &str) {
        if let Some(ws) = self.workspaces.get_mut(&kws_id) {
            ws.denied = Some((login_code, message.to_owned()));
        }
        self.notify(&perm_check_channel(kws_id));
    }
}

/// In-memory backend handle.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the shared state for seeding or inspection.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned. Acceptable for test code.
    #[allow(clippy::expect_used)]
    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory backend mutex poisoned")
    }

    /// Seed a workspace and return its id.
    pub fn add_workspace(&self, kws_id: u64, ws: MemWorkspace) {
        let mut state = self.state();
        state.next_kws_id = state.next_kws_id.max(kws_id + 1);
        state.workspaces.insert(kws_id, ws);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Conn = MemoryConn;

    async fn connect(&self) -> Result<MemoryConn, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = {
            let mut state = self.state();
            let id = state.next_conn_id;
            state.next_conn_id += 1;
            state.listeners.insert(id, Listener { channels: HashSet::new(), tx });
            id
        };
        Ok(MemoryConn { state: Arc::clone(&self.state), conn_id, rx })
    }
}

/// One in-memory backend connection.
pub struct MemoryConn {
    state: Arc<Mutex<MemoryState>>,
    conn_id: u64,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl MemoryConn {
    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory backend mutex poisoned")
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        self.lock().listeners.remove(&self.conn_id);
    }
}

#[async_trait]
impl BackendConn for MemoryConn {
    async fn call(&mut self, proc: &str, args: Bytes) -> Result<Bytes, BackendError> {
        let mut state = self.lock();
        dispatch_proc(&mut state, proc, &args)
    }

    async fn listen(&mut self, channel: &str) -> Result<(), BackendError> {
        let conn_id = self.conn_id;
        let mut state = self.lock();
        if let Some(listener) = state.listeners.get_mut(&conn_id) {
            listener.channels.insert(channel.to_owned());
        }
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> Result<(), BackendError> {
        let conn_id = self.conn_id;
        let mut state = self.lock();
        if let Some(listener) = state.listeners.get_mut(&conn_id) {
            listener.channels.remove(channel);
        }
        Ok(())
    }

    fn try_notification(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    async fn notified(&mut self) -> Result<Notification, BackendError> {
        self.rx.recv().await.ok_or(BackendError::Closed)
    }

    async fn poll_events(
        &mut self,
        kws_id: u64,
        after_id: u64,
        limit: u32,
    ) -> Result<Vec<EventRow>, BackendError> {
        let state = self.lock();
        let Some(ws) = state.workspaces.get(&kws_id) else { return Ok(Vec::new()) };
        Ok(ws
            .events
            .iter()
            .filter(|e| e.id > after_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn insert_ticket(
        &mut self,
        creation_date: u64,
        ticket: &[u8],
    ) -> Result<(), BackendError> {
        self.lock()
            .tickets
            .push(LedgerRow { creation_date, ticket: Bytes::copy_from_slice(ticket) });
        Ok(())
    }

    async fn consume_ticket(
        &mut self,
        ticket: &[u8],
        ttl_secs: u64,
    ) -> Result<bool, BackendError> {
        let now = now_secs();
        let mut state = self.lock();
        let pos = state
            .tickets
            .iter()
            .position(|row| row.ticket == ticket && now.saturating_sub(row.creation_date) <= ttl_secs);
        match pos {
            Some(i) => {
                state.tickets.remove(i);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn workspace_quota(&mut self, kws_id: u64) -> Result<Option<QuotaRow>, BackendError> {
        Ok(self
            .lock()
            .workspaces
            .get(&kws_id)
            .map(|ws| QuotaRow { file_size: ws.file_size, file_quota: ws.file_quota }))
    }

    async fn license_email(&mut self, kws_id: u64) -> Result<Option<String>, BackendError> {
        Ok(self.lock().workspaces.get(&kws_id).and_then(|ws| {
            ws.users.iter().find(|u| u.user_id == 1).map(|u| u.email.clone())
        }))
    }

    async fn screen_session_port(
        &mut self,
        kws_id: u64,
        session_id: u64,
    ) -> Result<Option<u16>, BackendError> {
        Ok(self
            .lock()
            .workspaces
            .get(&kws_id)
            .and_then(|ws| ws.screen_sessions.get(&session_id).copied()))
    }

    async fn workspace_users(&mut self, kws_id: u64) -> Result<Vec<UserRow>, BackendError> {
        Ok(self
            .lock()
            .workspaces
            .get(&kws_id)
            .map(|ws| {
                ws.users
                    .iter()
                    .map(|u| UserRow {
                        user_id: u.user_id,
                        name: u.name.clone(),
                        email: u.email.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn workspace_trusts_key(
        &mut self,
        kws_id: u64,
        key_id: u64,
    ) -> Result<bool, BackendError> {
        Ok(self
            .lock()
            .workspaces
            .get(&kws_id)
            .is_some_and(|ws| ws.trusted_keys.contains(&key_id)))
    }
}

fn ok_reply(build: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::new();
    atom::write_u32(&mut buf, 0);
    build(&mut buf);
    buf.freeze()
}

fn user_error_reply(text: &str) -> Bytes {
    let mut buf = BytesMut::new();
    atom::write_u32(&mut buf, 1);
    atom::write_str(&mut buf, text);
    buf.freeze()
}

/// Uniform prefix of a workspace-bound procedure call.
struct BoundArgs {
    kws_id: u64,
    date: u64,
    #[allow(dead_code)]
    login_type: u32,
    user_id: u32,
    minor: u32,
    cmd_payload: Bytes,
}

fn read_bound_args(buf: &mut &[u8]) -> Result<BoundArgs, BackendError> {
    Ok(BoundArgs {
        kws_id: atom::read_u64(buf)?,
        date: atom::read_u64(buf)?,
        login_type: atom::read_u32(buf)?,
        user_id: atom::read_u32(buf)?,
        minor: atom::read_u32(buf)?,
        cmd_payload: atom::read_bin(buf)?,
    })
}

/// Build the bound-reply triple (result type, result payload, code 0)
/// followed by extra outputs.
fn bound_ok(
    res_type: u32,
    payload: &[u8],
    rest: impl FnOnce(&mut BytesMut),
) -> Bytes {
    ok_reply(|buf| {
        atom::write_u32(buf, res_type);
        atom::write_bin(buf, payload);
        atom::write_u32(buf, 0);
        rest(buf);
    })
}

fn dispatch_proc(
    state: &mut MemoryState,
    proc: &str,
    args: &[u8],
) -> Result<Bytes, BackendError> {
    let mut buf = args;
    match proc {
        "connect_kws" => proc_connect_kws(state, &mut buf),
        "check_kws_login" => proc_check_kws_login(state, &mut buf),
        "get_usage_and_license_info" => proc_usage_and_license(state, &mut buf),
        "handle_kws_prop_change" => proc_prop_change(state, &mut buf),
        "cmd_chat_msg" => proc_chat_msg(state, &mut buf),
        "cmd_kws_get_uurl" => proc_get_uurl(state, &mut buf),
        "cmd_pb_accept_chat" => proc_pb_accept_chat(state, &mut buf),
        "cmd_mgt_invite_kws" => proc_invite_kws(state, &mut buf),
        "cmd_mgt_create_kws" => proc_create_kws(state, &mut buf),
        "store_kws_user_ticket" => proc_store_user_ticket(state, &mut buf),
        "register_kws_user" => proc_register_user(state, &mut buf),
        "upload_phase_one" => proc_upload_phase_one(state, &mut buf),
        "refresh_upload" => proc_refresh_upload(state, &mut buf),
        "upload_phase_two" => proc_upload_phase_two(state, &mut buf),
        "download_file" => proc_download_file(state, &mut buf),
        "start_vnc" => proc_start_screen(state, &mut buf),
        "end_vnc" => proc_end_screen(state, &mut buf),
        other => Err(BackendError::Db(format!("no such procedure: {other}"))),
    }
}

fn proc_connect_kws(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let kws_id = atom::read_u64(buf)?;
    let _delete_flag = atom::read_u32(buf)?;
    let _login_type = atom::read_u32(buf)?;
    let claimed_user_id = atom::read_u32(buf)?;
    let user_email = atom::read_str(buf)?;
    let email_id = atom::read_str(buf)?;
    let _ticket = atom::read_bin(buf)?;
    let _last_event_id = atom::read_u64(buf)?;
    let _last_event_date = atom::read_u64(buf)?;

    let reply = |code: u32,
                 last_evt: u64,
                 user_id: u32,
                 out_email_id: &str,
                 pwd: &str,
                 secure: u32,
                 registered: u32,
                 error: &str| {
        ok_reply(|b| {
            atom::write_u64(b, last_evt);
            atom::write_u32(b, code);
            atom::write_u32(b, 0); // choose-user-id flag
            atom::write_u32(b, 0); // perm-denied flag
            atom::write_u32(b, 0); // ticket-cached flag
            atom::write_u32(b, secure);
            atom::write_u32(b, 0); // v2-compat flag
            atom::write_u32(b, registered);
            atom::write_u32(b, user_id);
            atom::write_str(b, out_email_id);
            atom::write_str(b, pwd);
            atom::write_str(b, error);
        })
    };

    let Some(ws) = state.workspaces.get(&kws_id) else {
        return Ok(reply(
            types::LoginCode::BadWorkspaceId.to_u32(),
            0,
            0,
            "",
            "",
            0,
            0,
            "no such workspace",
        ));
    };

    if ws.flags & types::KWS_FLAG_DELETE != 0 {
        return Ok(reply(
            types::LoginCode::DeletedWorkspace.to_u32(),
            0,
            0,
            "",
            "",
            0,
            0,
            "workspace deleted",
        ));
    }

    let last_evt = ws.next_event_id - 1;
    let secure = u32::from(ws.flags & types::KWS_FLAG_SECURE != 0);

    // Privileged logins bypass the member table.
    if email_id == "admin" || email_id == "kwmo" {
        return Ok(reply(0, last_evt, claimed_user_id, &email_id, "", secure, 1, ""));
    }

    let user = ws.users.iter().find(|u| {
        (!email_id.is_empty() && u.email_id == email_id)
            || (claimed_user_id != 0 && u.user_id == claimed_user_id)
            || (!user_email.is_empty() && u.email == user_email)
    });

    let Some(user) = user else {
        return Ok(reply(
            types::LoginCode::BadEmailId.to_u32(),
            last_evt,
            0,
            "",
            "",
            secure,
            0,
            "unknown email id",
        ));
    };

    if user.flags & types::USER_FLAG_BAN != 0 {
        return Ok(reply(
            types::LoginCode::Banned.to_u32(),
            last_evt,
            user.user_id,
            &user.email_id,
            "",
            secure,
            1,
            "user banned",
        ));
    }
    if user.flags & types::USER_FLAG_LOCK != 0 {
        return Ok(reply(
            types::LoginCode::AccountLocked.to_u32(),
            last_evt,
            user.user_id,
            &user.email_id,
            "",
            secure,
            1,
            "account locked",
        ));
    }

    let registered = u32::from(user.flags & types::USER_FLAG_REGISTER != 0);
    Ok(reply(0, last_evt, user.user_id, &user.email_id, &user.pwd, secure, registered, ""))
}

fn proc_check_kws_login(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let kws_id = atom::read_u64(buf)?;
    let _login_type = atom::read_u32(buf)?;
    let user_id = atom::read_u32(buf)?;

    let denial = match state.workspaces.get(&kws_id) {
        None => Some((types::LoginCode::BadWorkspaceId.to_u32(), "no such workspace".to_owned())),
        Some(ws) => ws.denied.clone().or_else(|| {
            let user = ws.users.iter().find(|u| u.user_id == user_id);
            user.and_then(|u| {
                if u.flags & types::USER_FLAG_BAN != 0 {
                    Some((types::LoginCode::Banned.to_u32(), "user banned".to_owned()))
                } else if u.flags & types::USER_FLAG_LOCK != 0 {
                    Some((types::LoginCode::AccountLocked.to_u32(), "account locked".to_owned()))
                } else {
                    None
                }
            })
        }),
    };

    Ok(ok_reply(|b| match &denial {
        Some((code, msg)) => {
            atom::write_u32(b, 1);
            atom::write_u32(b, *code);
            atom::write_str(b, msg);
        },
        None => {
            atom::write_u32(b, 0);
            atom::write_u32(b, 0);
            atom::write_str(b, "");
        },
    }))
}

fn proc_usage_and_license(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let _email = atom::read_str(buf)?;
    let lic = state.license.clone();
    let usage = state.license_file_usage;
    let nb_kws = state.workspaces.len() as u32;
    Ok(ok_reply(|b| {
        atom::write_u32(b, nb_kws);
        atom::write_u32(b, 0);
        atom::write_u64(b, usage);
        atom::write_str(b, &lic.name);
        atom::write_u32(b, lic.nb_kws);
        atom::write_u32(b, lic.nb_public_kws);
        atom::write_u64(b, lic.file_bytes);
        atom::write_u32(b, u32::from(lic.secure));
        atom::write_u64(b, lic.screen_share_secs);
    }))
}

fn proc_prop_change(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let cmd_type = atom::read_u32(buf)?;

    let Some(ws) = state.workspaces.get_mut(&bound.kws_id) else {
        return Ok(user_error_reply("no such workspace"));
    };

    // Apply the property to the workspace and build the matching
    // property-change event payload.
    let mut cmd = &bound.cmd_payload[..];
    let _kws_id = atom::read_u64(&mut cmd)?;
    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, bound.kws_id);
    atom::write_u64(&mut evt, bound.date);
    atom::write_u32(&mut evt, bound.user_id);
    atom::write_u32(&mut evt, 1);

    let set_ws_flag = |ws: &mut MemWorkspace, flag: u32, value: u32| {
        if value != 0 {
            ws.flags |= flag;
        } else {
            ws.flags &= !flag;
        }
    };
    let set_user_flag = |ws: &mut MemWorkspace, user_id: u32, flag: u32, value: u32| {
        if let Some(u) = ws.users.iter_mut().find(|u| u.user_id == user_id) {
            if value != 0 {
                u.flags |= flag;
            } else {
                u.flags &= !flag;
            }
        }
    };

    match cmd_type {
        types::CMD_KWS_SET_NAME => {
            let name = atom::read_str(&mut cmd)?;
            ws.name = name.clone();
            atom::write_u32(&mut evt, types::PROP_KWS_NAME);
            atom::write_str(&mut evt, &name);
        },
        types::CMD_KWS_SET_SECURE
        | types::CMD_KWS_SET_FREEZE
        | types::CMD_KWS_SET_DEEP_FREEZE
        | types::CMD_KWS_SET_THIN_STORE => {
            let value = atom::read_u32(&mut cmd)?;
            let flag = match cmd_type {
                types::CMD_KWS_SET_SECURE => types::KWS_FLAG_SECURE,
                types::CMD_KWS_SET_FREEZE => types::KWS_FLAG_FREEZE,
                types::CMD_KWS_SET_DEEP_FREEZE => types::KWS_FLAG_DEEP_FREEZE,
                _ => types::KWS_FLAG_THIN_STORE,
            };
            set_ws_flag(ws, flag, value);
            atom::write_u32(&mut evt, types::PROP_KWS_FLAGS);
            atom::write_u32(&mut evt, ws.flags);
        },
        types::CMD_KWS_SET_USER_NAME => {
            let user_id = atom::read_u32(&mut cmd)?;
            let name = atom::read_str(&mut cmd)?;
            if let Some(u) = ws.users.iter_mut().find(|u| u.user_id == user_id) {
                u.name = name.clone();
            }
            atom::write_u32(&mut evt, types::PROP_USER_NAME_ADMIN);
            atom::write_u32(&mut evt, user_id);
            atom::write_str(&mut evt, &name);
        },
        types::CMD_KWS_SET_USER_PWD => {
            let user_id = atom::read_u32(&mut cmd)?;
            let pwd = atom::read_str(&mut cmd)?;
            if let Some(u) = ws.users.iter_mut().find(|u| u.user_id == user_id) {
                u.pwd = pwd;
            }
            atom::write_u32(&mut evt, types::PROP_USER_FLAGS);
            atom::write_u32(&mut evt, user_id);
            let flags =
                ws.users.iter().find(|u| u.user_id == user_id).map_or(0, |u| u.flags);
            atom::write_u32(&mut evt, flags);
        },
        types::CMD_KWS_SET_USER_ADMIN
        | types::CMD_KWS_SET_USER_MANAGER
        | types::CMD_KWS_SET_USER_LOCK
        | types::CMD_KWS_SET_USER_BAN => {
            let user_id = atom::read_u32(&mut cmd)?;
            let value = atom::read_u32(&mut cmd)?;
            let flag = match cmd_type {
                types::CMD_KWS_SET_USER_ADMIN => types::USER_FLAG_ADMIN,
                types::CMD_KWS_SET_USER_MANAGER => types::USER_FLAG_MANAGER,
                types::CMD_KWS_SET_USER_LOCK => types::USER_FLAG_LOCK,
                _ => types::USER_FLAG_BAN,
            };
            set_user_flag(ws, user_id, flag, value);
            atom::write_u32(&mut evt, types::PROP_USER_FLAGS);
            atom::write_u32(&mut evt, user_id);
            let flags =
                ws.users.iter().find(|u| u.user_id == user_id).map_or(0, |u| u.flags);
            atom::write_u32(&mut evt, flags);
        },
        _ => return Ok(user_error_reply("unknown property command")),
    }

    let evt_id =
        state.post_event(bound.kws_id, bound.minor.min(4), types::EVT_KWS_PROP_CHANGE, evt.freeze());

    let mut res_payload = BytesMut::new();
    atom::write_u64(&mut res_payload, evt_id);

    Ok(bound_ok(types::RES_KWS_PROP_CHANGE, &res_payload, |b| {
        atom::write_u32(b, 0); // sync-store flag
        atom::write_u32(b, atom_login_type(state, bound.kws_id));
    }))
}

// The property-change procedure reports the possibly-updated login type.
// The memory backend never changes it; report normal.
fn atom_login_type(_state: &MemoryState, _kws_id: u64) -> u32 {
    types::LoginType::Normal.to_u32()
}

fn proc_chat_msg(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;

    let mut cmd = &bound.cmd_payload[..];
    let _kws_id = atom::read_u64(&mut cmd)?;
    let chat_id = atom::read_u32(&mut cmd)?;
    let text = atom::read_str(&mut cmd)?;

    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, bound.kws_id);
    atom::write_u64(&mut evt, bound.date);
    atom::write_u32(&mut evt, chat_id);
    atom::write_u32(&mut evt, bound.user_id);
    atom::write_str(&mut evt, &text);
    state.post_event(bound.kws_id, 1, types::EVT_CHAT_MSG, evt.freeze());

    Ok(bound_ok(types::RES_OK, b"", |_| {}))
}

fn proc_get_uurl(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let web_host = atom::read_str(buf)?;

    let email_id = {
        let Some(ws) = state.workspaces.get_mut(&bound.kws_id) else {
            return Ok(user_error_reply("no such workspace"));
        };
        let id = ws.next_commit_id;
        ws.next_commit_id += 1;
        id
    };

    let mut res_payload = BytesMut::new();
    atom::write_str(
        &mut res_payload,
        &format!("https://{web_host}/m/{}/{}", bound.kws_id, email_id),
    );
    atom::write_u64(&mut res_payload, bound.date);
    if bound.minor >= 6 {
        atom::write_u64(&mut res_payload, email_id);
    }

    Ok(bound_ok(types::RES_KWS_UURL, &res_payload, |_| {}))
}

fn proc_pb_accept_chat(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;

    let mut cmd = &bound.cmd_payload[..];
    let _kws_id = atom::read_u64(&mut cmd)?;
    let request_id = atom::read_u64(&mut cmd)?;
    let user_id = atom::read_u32(&mut cmd)?;
    let channel_id = atom::read_u32(&mut cmd)?;

    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, bound.kws_id);
    atom::write_u64(&mut evt, bound.date);
    atom::write_u64(&mut evt, request_id);
    atom::write_u32(&mut evt, user_id);
    atom::write_u32(&mut evt, channel_id);
    state.post_event(bound.kws_id, 3, types::EVT_PB_CHAT_ACCEPTED, evt.freeze());

    Ok(bound_ok(types::RES_OK, b"", |_| {}))
}

fn proc_invite_kws(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let _mail_sender = atom::read_str(buf)?;

    let mut cmd = &bound.cmd_payload[..];
    let _kws_id = atom::read_u64(&mut cmd)?;
    let _msg = atom::read_str(&mut cmd)?;
    let nb_user = atom::read_u32(&mut cmd)?;

    struct Invitee {
        name: String,
        email: String,
        email_id: String,
        send_mail: u32,
    }
    let mut invitees = Vec::new();

    let (kws_name, from) = {
        let Some(ws) = state.workspaces.get_mut(&bound.kws_id) else {
            return Ok(user_error_reply("no such workspace"));
        };
        for _ in 0..nb_user {
            let name = atom::read_str(&mut cmd)?;
            let email = atom::read_str(&mut cmd)?;
            let _key_id = atom::read_u64(&mut cmd)?;
            let _org = atom::read_str(&mut cmd)?;
            let pwd = atom::read_str(&mut cmd)?;
            let send_mail = atom::read_u32(&mut cmd)?;

            let user_id = ws.users.iter().map(|u| u.user_id).max().unwrap_or(0) + 1;
            let email_id = format!("em{}_{user_id}", bound.kws_id);
            ws.users.push(MemUser {
                user_id,
                name: name.clone(),
                email: email.clone(),
                email_id: email_id.clone(),
                pwd,
                flags: 0,
            });
            invitees.push(Invitee { name, email, email_id, send_mail });
        }
        let from = ws.users.iter().find(|u| u.user_id == bound.user_id).cloned();
        (ws.name.clone(), from)
    };

    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, bound.kws_id);
    atom::write_u64(&mut evt, bound.date);
    atom::write_u32(&mut evt, bound.user_id);
    atom::write_u32(&mut evt, invitees.len() as u32);
    for (i, inv) in invitees.iter().enumerate() {
        atom::write_u32(&mut evt, i as u32 + 2);
        atom::write_str(&mut evt, &inv.name);
        atom::write_str(&mut evt, &inv.email);
        atom::write_str(&mut evt, "");
    }
    state.post_event(bound.kws_id, 3, types::EVT_KWS_INVITED, evt.freeze());

    Ok(bound_ok(types::RES_OK, b"", |b| {
        atom::write_str(b, &kws_name);
        atom::write_str(b, from.as_ref().map_or("", |u| u.name.as_str()));
        atom::write_str(b, from.as_ref().map_or("", |u| u.email.as_str()));
        atom::write_str(b, "");
        atom::write_u32(b, invitees.len() as u32);
        for inv in &invitees {
            atom::write_u32(b, inv.send_mail);
            atom::write_str(b, &inv.name);
            atom::write_str(b, &inv.email);
            atom::write_str(b, &inv.email_id);
        }
    }))
}

fn proc_create_kws(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let cmd_payload = atom::read_bin(buf)?;
    let minor = atom::read_u32(buf)?;
    let _org_name = atom::read_str(buf)?;
    let quota = atom::read_u64(buf)?;
    let web_host = atom::read_str(buf)?;

    let mut cmd = &cmd_payload[..];
    let name = atom::read_str(&mut cmd)?;
    let _ticket = atom::read_bin(&mut cmd)?;
    let public = atom::read_u32(&mut cmd)?;
    let secure = if minor >= 3 { atom::read_u32(&mut cmd)? } else { 0 };
    let thin = if minor >= 4 { atom::read_u32(&mut cmd)? } else { 0 };

    let kws_id = state.next_kws_id.max(1);
    state.next_kws_id = kws_id + 1;

    let mut flags = 0;
    if public != 0 {
        flags |= types::KWS_FLAG_PUBLIC;
    }
    if secure != 0 {
        flags |= types::KWS_FLAG_SECURE;
    }
    if thin != 0 {
        flags |= types::KWS_FLAG_THIN_STORE;
    }

    let creator = MemUser {
        user_id: 1,
        name: "creator".to_owned(),
        email: "creator@example.com".to_owned(),
        email_id: format!("em{kws_id}_1"),
        pwd: String::new(),
        flags: types::USER_FLAG_ADMIN | types::USER_FLAG_REGISTER,
    };

    state.workspaces.insert(
        kws_id,
        MemWorkspace {
            name: name.clone(),
            flags,
            users: vec![creator],
            file_quota: quota,
            ..MemWorkspace::default()
        },
    );

    let date = now_secs();
    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, kws_id);
    atom::write_u64(&mut evt, date);
    atom::write_u32(&mut evt, 1);
    atom::write_str(&mut evt, "creator");
    atom::write_str(&mut evt, "creator@example.com");
    atom::write_str(&mut evt, "");
    atom::write_str(&mut evt, &name);
    atom::write_u32(&mut evt, flags);
    atom::write_str(&mut evt, &web_host);
    state.post_event(kws_id, 3, types::EVT_KWS_CREATED, evt.freeze());

    let mut res_payload = BytesMut::new();
    atom::write_u64(&mut res_payload, kws_id);
    atom::write_str(&mut res_payload, &format!("em{kws_id}_1"));

    Ok(ok_reply(|b| {
        atom::write_u32(b, types::RES_MGT_KWS_CREATED);
        atom::write_bin(b, &res_payload);
    }))
}

fn proc_store_user_ticket(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let ticket = atom::read_bin(buf)?;
    if let Some(ws) = state.workspaces.get_mut(&bound.kws_id) {
        ws.stored_tickets.push(ticket);
    }
    Ok(bound_ok(types::RES_OK, b"", |_| {}))
}

fn proc_register_user(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let name = atom::read_str(buf)?;

    if let Some(ws) = state.workspaces.get_mut(&bound.kws_id) {
        if let Some(u) = ws.users.iter_mut().find(|u| u.user_id == bound.user_id) {
            u.flags |= types::USER_FLAG_REGISTER;
            if !name.is_empty() {
                u.name = name.clone();
            }
        }
    }

    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, bound.kws_id);
    atom::write_u64(&mut evt, bound.date);
    atom::write_u32(&mut evt, bound.user_id);
    atom::write_str(&mut evt, &name);
    state.post_event(bound.kws_id, 1, types::EVT_KWS_USER_REGISTERED, evt.freeze());

    Ok(bound_ok(types::RES_OK, b"", |_| {}))
}

fn proc_upload_phase_one(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let share_id = atom::read_u32(buf)?;

    let mut cmd = &bound.cmd_payload[..];
    let _ticket = atom::read_bin(&mut cmd)?;
    let public_email_id = atom::read_u64(&mut cmd)?;
    let nb_changes = atom::read_u32(&mut cmd)?;

    struct UploadRec {
        create: u32,
        inode: u64,
        share_path: String,
        perm_path: String,
    }

    let (commit_id, uploads) = {
        let Some(ws) = state.workspaces.get_mut(&bound.kws_id) else {
            return Ok(user_error_reply("no such workspace"));
        };
        let commit_id = ws.next_commit_id;
        ws.next_commit_id += 1;
        let share = ws.shares.entry(share_id).or_default();

        let mut uploads = Vec::new();
        for _ in 0..nb_changes {
            let _nb_el = atom::read_u32(&mut cmd)?;
            let op = atom::read_u32(&mut cmd)?;
            match op {
                types::FILES_OP_CREATE_FILE => {
                    let _parent = atom::read_u64(&mut cmd)?;
                    let _parent_commit = atom::read_u64(&mut cmd)?;
                    let name = atom::read_str(&mut cmd)?;
                    share.next_inode += 1;
                    let inode = share.next_inode;
                    let perm_path = format!("{share_id}/{inode}_{commit_id}");
                    share.files.insert(inode, MemFile { path: perm_path.clone(), commit_id });
                    uploads.push(UploadRec { create: 1, inode, share_path: name, perm_path });
                },
                types::FILES_OP_UPDATE_FILE => {
                    let inode = atom::read_u64(&mut cmd)?;
                    let _commit = atom::read_u64(&mut cmd)?;
                    let perm_path = format!("{share_id}/{inode}_{commit_id}");
                    if let Some(f) = share.files.get_mut(&inode) {
                        f.path = perm_path.clone();
                        f.commit_id = commit_id;
                    }
                    uploads.push(UploadRec {
                        create: 0,
                        inode,
                        share_path: format!("inode-{inode}"),
                        perm_path,
                    });
                },
                types::FILES_OP_CREATE_DIR => {
                    let _parent = atom::read_u64(&mut cmd)?;
                    let _parent_commit = atom::read_u64(&mut cmd)?;
                    let _name = atom::read_str(&mut cmd)?;
                },
                types::FILES_OP_DELETE_FILE | types::FILES_OP_DELETE_DIR => {
                    let inode = atom::read_u64(&mut cmd)?;
                    let _commit = atom::read_u64(&mut cmd)?;
                    share.files.remove(&inode);
                },
                types::FILES_OP_MOVE_FILE | types::FILES_OP_MOVE_DIR => {
                    let _inode = atom::read_u64(&mut cmd)?;
                    let _commit = atom::read_u64(&mut cmd)?;
                    let _parent = atom::read_u64(&mut cmd)?;
                    let _parent_commit = atom::read_u64(&mut cmd)?;
                    let _name = atom::read_str(&mut cmd)?;
                },
                _ => return Ok(user_error_reply("unknown change operation")),
            }
        }
        (commit_id, uploads)
    };

    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, bound.kws_id);
    atom::write_u64(&mut evt, bound.date);
    atom::write_u32(&mut evt, bound.user_id);
    atom::write_u32(&mut evt, share_id);
    atom::write_u64(&mut evt, commit_id);
    atom::write_u32(&mut evt, nb_changes);
    state.post_event(bound.kws_id, 1, types::EVT_FILES_PHASE_1, evt.freeze());

    let mut res_payload = BytesMut::new();
    atom::write_u64(&mut res_payload, commit_id);
    atom::write_u32(&mut res_payload, nb_changes);
    for _ in 0..nb_changes {
        atom::write_u32(&mut res_payload, 1);
        atom::write_str(&mut res_payload, "");
    }

    Ok(bound_ok(types::RES_FILES_PHASE_1, &res_payload, |b| {
        atom::write_u64(b, commit_id);
        atom::write_u64(b, public_email_id);
        atom::write_u32(b, uploads.len() as u32);
        for rec in &uploads {
            atom::write_u32(b, rec.create);
            atom::write_u64(b, rec.inode);
            atom::write_str(b, &rec.share_path);
            atom::write_str(b, &rec.perm_path);
        }
        atom::write_u32(b, 0); // nothing to delete permanently
    }))
}

fn proc_refresh_upload(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let _share_id = atom::read_u32(buf)?;
    let _commit_id = atom::read_u64(buf)?;
    if !state.workspaces.contains_key(&bound.kws_id) {
        return Ok(user_error_reply("no such workspace"));
    }
    Ok(bound_ok(types::RES_OK, b"", |_| {}))
}

fn proc_upload_phase_two(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let _share_id = atom::read_u32(buf)?;
    let _commit_id = atom::read_u64(buf)?;
    let _public_email_id = atom::read_u64(buf)?;
    let evt = atom::read_bin(buf)?;
    let _notif = atom::read_bin(buf)?;
    let nb_commit = atom::read_u32(buf)?;

    let mut total = 0u64;
    for _ in 0..nb_commit {
        let _inode = atom::read_u64(buf)?;
        total += atom::read_u64(buf)?;
    }

    if let Some(ws) = state.workspaces.get_mut(&bound.kws_id) {
        ws.file_size += total;
    }
    state.license_file_usage += total;
    state.post_event(bound.kws_id, 1, types::EVT_FILES_PHASE_2, evt);

    Ok(bound_ok(types::RES_OK, b"", |_| {}))
}

fn proc_download_file(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let share_id = atom::read_u32(buf)?;
    let nb = atom::read_u32(buf)?;

    let Some(ws) = state.workspaces.get(&bound.kws_id) else {
        return Ok(user_error_reply("no such workspace"));
    };
    let Some(share) = ws.shares.get(&share_id) else {
        return Ok(user_error_reply("no such share"));
    };

    let mut paths = Vec::new();
    for _ in 0..nb {
        let inode = atom::read_u64(buf)?;
        let _commit_id = atom::read_u64(buf)?;
        match share.files.get(&inode) {
            Some(f) => paths.push(f.path.clone()),
            None => return Ok(user_error_reply("no such file")),
        }
    }

    Ok(bound_ok(types::RES_OK, b"", |b| {
        for path in &paths {
            atom::write_str(b, path);
        }
    }))
}

fn proc_start_screen(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let bound = read_bound_args(buf)?;
    let subject = atom::read_str(buf)?;
    let port = atom::read_u32(buf)?;

    let session_id = {
        let Some(ws) = state.workspaces.get_mut(&bound.kws_id) else {
            return Ok(user_error_reply("no such workspace"));
        };
        state.next_session_id += 1;
        let id = state.next_session_id;
        ws.screen_sessions.insert(id, port as u16);
        id
    };

    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, bound.kws_id);
    atom::write_u64(&mut evt, bound.date);
    atom::write_u32(&mut evt, bound.user_id);
    atom::write_u64(&mut evt, session_id);
    atom::write_str(&mut evt, &subject);
    state.post_event(bound.kws_id, 1, types::EVT_SCREEN_START, evt.freeze());

    Ok(bound_ok(types::RES_OK, b"", |b| {
        atom::write_u64(b, session_id);
    }))
}

fn proc_end_screen(state: &mut MemoryState, buf: &mut &[u8]) -> Result<Bytes, BackendError> {
    let kws_id = atom::read_u64(buf)?;
    let user_id = atom::read_u32(buf)?;
    let session_id = atom::read_u64(buf)?;
    let evt_minor = atom::read_u32(buf)?;
    let code = atom::read_u32(buf)?;
    let msg = atom::read_str(buf)?;

    if let Some(ws) = state.workspaces.get_mut(&kws_id) {
        ws.screen_sessions.remove(&session_id);
    }

    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, kws_id);
    atom::write_u64(&mut evt, now_secs());
    atom::write_u32(&mut evt, user_id);
    atom::write_u64(&mut evt, session_id);
    if evt_minor >= 5 {
        atom::write_u32(&mut evt, code);
        atom::write_str(&mut evt, &msg);
    }
    state.post_event(kws_id, evt_minor, types::EVT_SCREEN_END, evt.freeze());

    Ok(ok_reply(|_| {}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_workspace(
            42,
            MemWorkspace {
                name: "test".to_owned(),
                users: vec![MemUser {
                    user_id: 7,
                    name: "u".to_owned(),
                    email: "u@example.com".to_owned(),
                    email_id: "em42_7".to_owned(),
                    pwd: "pw".to_owned(),
                    flags: types::USER_FLAG_REGISTER,
                }],
                ..MemWorkspace::default()
            },
        );
        backend
    }

    #[tokio::test]
    async fn ticket_ledger_is_single_use() {
        let backend = seeded();
        let mut conn = backend.connect().await.unwrap();
        conn.insert_ticket(now_secs(), b"abc").await.unwrap();
        assert!(conn.consume_ticket(b"abc", 300).await.unwrap());
        assert!(!conn.consume_ticket(b"abc", 300).await.unwrap());
    }

    #[tokio::test]
    async fn expired_ticket_is_not_consumed() {
        let backend = seeded();
        let mut conn = backend.connect().await.unwrap();
        conn.insert_ticket(now_secs() - 1000, b"old").await.unwrap();
        assert!(!conn.consume_ticket(b"old", 300).await.unwrap());
    }

    #[tokio::test]
    async fn event_notification_reaches_listeners() {
        let backend = seeded();
        let mut conn = backend.connect().await.unwrap();
        conn.listen(&event_log_channel(42)).await.unwrap();

        backend.state().post_event(42, 1, types::EVT_CHAT_MSG, Bytes::new());

        let notif = conn.notified().await.unwrap();
        assert_eq!(notif.channel, event_log_channel(42));

        let events = conn.poll_events(42, 0, 100).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 1);
    }

    #[tokio::test]
    async fn unlistened_channel_is_silent() {
        let backend = seeded();
        let mut conn = backend.connect().await.unwrap();
        conn.listen(&event_log_channel(42)).await.unwrap();
        conn.unlisten(&event_log_channel(42)).await.unwrap();
        backend.state().post_event(42, 1, types::EVT_CHAT_MSG, Bytes::new());
        assert!(conn.try_notification().is_none());
    }
}
