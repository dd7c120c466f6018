//! Command dispatch table and handler plumbing.
//!
//! Every command the commander recognizes has one entry: its type, a
//! human name for logging, whether it is workspace-bound (first payload
//! atom resolves a joined workspace), and the handler variant. Handlers
//! share one signature over [`CommandCtx`] and end in one of four ways:
//! success (the result message is ready), generic failure, specific
//! failure (the handler composed the failure result itself), or an
//! internal error that unwinds the session.

mod connect;
mod invite;
mod misc;
mod props;
mod tickets;

use std::collections::BTreeMap;

use conclave_proto::{Message, ProtocolError, types, types::LoginType};
use thiserror::Error;

use crate::{
    backend::{BackendConn, BackendError, kws_bound_query},
    session::SessionShared,
};

/// A workspace the session is logged into, as seen by the commander.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceHandle {
    /// Workspace id
    pub kws_id: u64,
    /// How the user is logged in
    pub login_type: LoginType,
    /// User id within the workspace
    pub user_id: u32,
}

/// How a handler failed.
#[derive(Error, Debug)]
pub enum HandlerFail {
    /// User-level failure; the commander composes the standard FAIL.
    #[error("{0}")]
    Generic(String),

    /// The handler already composed the failure result.
    #[error("specific failure result composed")]
    Specific,

    /// Internal failure; the session unwinds.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<ProtocolError> for HandlerFail {
    fn from(e: ProtocolError) -> Self {
        // A command that does not parse is the client's fault.
        Self::Generic(e.to_string())
    }
}

/// Handler outcome: success or one of the failure modes.
pub type HandlerResult = Result<(), HandlerFail>;

/// Handler variants of the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Create a workspace.
    CreateKws,
    /// Send the freemium confirmation email.
    FreemiumConfirm,
    /// Authenticate into a workspace.
    Connect,
    /// Leave a workspace.
    Disconnect,
    /// Invite users.
    Invite,
    /// Any workspace/user property change.
    PropChange,
    /// Unique email URL.
    GetUurl,
    /// Grant a ticket (download, upload, screen-share host/guest).
    GrantTicket,
    /// Post a chat message.
    ChatMsg,
    /// Accept a public-board chat request.
    PbAcceptChat,
}

/// One dispatch entry.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Command type this entry serves
    pub msg_type: u32,
    /// Human name, for logging
    pub name: &'static str,
    /// True if the first payload atom must resolve a joined workspace
    pub kws_bound: bool,
    /// Handler variant
    pub kind: CommandKind,
}

/// The command dispatch table.
pub static DISPATCH: &[CommandSpec] = &[
    CommandSpec {
        msg_type: types::CMD_MGT_CREATE_KWS,
        name: "create workspace",
        kws_bound: false,
        kind: CommandKind::CreateKws,
    },
    CommandSpec {
        msg_type: types::CMD_MGT_FREEMIUM_CONFIRM,
        name: "send freemium confirmation email",
        kws_bound: false,
        kind: CommandKind::FreemiumConfirm,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_CONNECT,
        name: "connect to workspace",
        kws_bound: false,
        kind: CommandKind::Connect,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_DISCONNECT,
        name: "disconnect from workspace",
        kws_bound: false,
        kind: CommandKind::Disconnect,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_INVITE,
        name: "invite to workspace",
        kws_bound: true,
        kind: CommandKind::Invite,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_USER_PWD,
        name: "set user password",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_USER_NAME,
        name: "set user name",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_USER_ADMIN,
        name: "set user admin",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_USER_MANAGER,
        name: "set user manager",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_USER_LOCK,
        name: "set user lock",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_USER_BAN,
        name: "set user ban",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_NAME,
        name: "set workspace name",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_FREEZE,
        name: "set workspace freeze",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_DEEP_FREEZE,
        name: "set workspace deep freeze",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_SECURE,
        name: "set workspace secure",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_SET_THIN_STORE,
        name: "set workspace thin store",
        kws_bound: true,
        kind: CommandKind::PropChange,
    },
    CommandSpec {
        msg_type: types::CMD_FILES_DOWNLOAD_REQ,
        name: "grant download ticket",
        kws_bound: true,
        kind: CommandKind::GrantTicket,
    },
    CommandSpec {
        msg_type: types::CMD_FILES_UPLOAD_REQ,
        name: "grant upload ticket",
        kws_bound: true,
        kind: CommandKind::GrantTicket,
    },
    CommandSpec {
        msg_type: types::CMD_SCREEN_CONNECT_TICKET,
        name: "grant screen-share guest ticket",
        kws_bound: true,
        kind: CommandKind::GrantTicket,
    },
    CommandSpec {
        msg_type: types::CMD_SCREEN_START_TICKET,
        name: "grant screen-share host ticket",
        kws_bound: true,
        kind: CommandKind::GrantTicket,
    },
    CommandSpec {
        msg_type: types::CMD_CHAT_MSG,
        name: "post chat message",
        kws_bound: true,
        kind: CommandKind::ChatMsg,
    },
    CommandSpec {
        msg_type: types::CMD_KWS_GET_UURL,
        name: "get unique email url",
        kws_bound: true,
        kind: CommandKind::GetUurl,
    },
    CommandSpec {
        msg_type: types::CMD_PB_ACCEPT_CHAT,
        name: "accept public chat",
        kws_bound: true,
        kind: CommandKind::PbAcceptChat,
    },
];

/// Find the entry for a command type.
#[must_use]
pub fn lookup(msg_type: u32) -> Option<&'static CommandSpec> {
    DISPATCH.iter().find(|spec| spec.msg_type == msg_type)
}

/// Execution context of one command.
pub struct CommandCtx<'a, C: BackendConn> {
    /// The command being executed; its read cursor sits past the
    /// workspace id for workspace-bound commands
    pub cmd: &'a mut Message,
    /// The result under construction; preset to OK with the command's id
    pub res: &'a mut Message,
    /// Resolved workspace of a workspace-bound command
    pub kws: Option<WorkspaceHandle>,
    /// All workspaces the session is logged into
    pub workspaces: &'a mut BTreeMap<u64, WorkspaceHandle>,
    /// The commander's backend connection
    pub conn: &'a mut C,
    /// Effective minor of the session
    pub minor: u32,
    /// Command date, seconds since the epoch
    pub date: u64,
    /// Shared session state, for eventer notes
    pub shared: &'a SessionShared,
}

impl<C: BackendConn> CommandCtx<'_, C> {
    /// The resolved workspace of a bound command.
    pub fn kws(&self) -> Result<WorkspaceHandle, HandlerFail> {
        self.kws.ok_or_else(|| HandlerFail::Generic("not logged in to the workspace".to_owned()))
    }

    /// Add a workspace to the session and subscribe its events.
    ///
    /// Portal logins receive no workspace events.
    pub fn add_workspace(&mut self, handle: WorkspaceHandle, last_event_id: u64) {
        self.workspaces.insert(handle.kws_id, handle);
        if handle.login_type != LoginType::Portal {
            let _ = self.shared.to_eventer.send(super::EventerNote::Listen {
                kws_id: handle.kws_id,
                user_id: handle.user_id,
                last_event_id,
            });
        }
    }

    /// Remove a workspace from the session and unsubscribe its events.
    pub fn remove_workspace(&mut self, kws_id: u64) {
        self.workspaces.remove(&kws_id);
        let _ = self.shared.to_eventer.send(super::EventerNote::Unlisten { kws_id });
    }

    /// Invoke a workspace-bound procedure for the resolved workspace.
    ///
    /// On success the procedure's result type and payload are applied to
    /// `res` and the remaining output parameters are returned. A
    /// user-error reply from the procedure surfaces as
    /// [`HandlerFail::Specific`] with the failure already in `res`.
    pub async fn bound_query(
        &mut self,
        proc: &str,
        extra: &[u8],
    ) -> Result<bytes::Bytes, HandlerFail> {
        let kws = self.kws()?;
        let payload = bytes::Bytes::copy_from_slice(self.cmd.payload_bytes());
        let reply = kws_bound_query(
            self.conn,
            proc,
            kws.kws_id,
            self.date,
            kws.login_type.to_u32(),
            kws.user_id,
            self.minor,
            Some(&payload),
            extra,
        )
        .await?;

        let reply = match reply {
            Ok(reply) => reply,
            Err(text) => return Err(HandlerFail::Generic(text)),
        };

        self.res.msg_type = reply.res_type;
        self.res.set_payload(&reply.res_payload).map_err(BackendError::Reply)?;

        if reply.user_error {
            return Err(HandlerFail::Specific);
        }
        Ok(reply.rest)
    }
}

/// Compose a failure result in place.
pub fn set_failure(res: &mut Message, kind: u32, text: &str) {
    res.msg_type = types::RES_FAIL;
    res.clear_payload();
    res.put_u32(kind).put_str(text);
}

/// Compose the generic failure result in place.
pub fn set_gen_failure(res: &mut Message, text: &str) {
    set_failure(res, types::FAIL_GENERIC, text);
}

/// Compose a resource-quota failure with its subkind.
pub fn set_resource_quota_failure(res: &mut Message, text: &str, subkind: u32) {
    set_failure(res, types::FAIL_RESOURCE_QUOTA, text);
    res.put_u32(subkind);
}

/// Execute a command through its dispatch entry.
pub async fn execute<C: BackendConn>(
    spec: &CommandSpec,
    ctx: &mut CommandCtx<'_, C>,
) -> HandlerResult {
    match spec.kind {
        CommandKind::CreateKws => misc::create_kws(ctx).await,
        CommandKind::FreemiumConfirm => misc::freemium_confirm(ctx).await,
        CommandKind::Connect => connect::connect_kws(ctx).await,
        CommandKind::Disconnect => connect::disconnect_kws(ctx),
        CommandKind::Invite => invite::invite_kws(ctx).await,
        CommandKind::PropChange => props::prop_change(ctx).await,
        CommandKind::GetUurl => misc::get_uurl(ctx).await,
        CommandKind::GrantTicket => tickets::grant_ticket(ctx).await,
        CommandKind::ChatMsg => misc::chat_msg(ctx).await,
        CommandKind::PbAcceptChat => misc::pb_accept_chat(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_type_resolves_once() {
        for spec in DISPATCH {
            let found = lookup(spec.msg_type).map(|s| s.name);
            assert_eq!(found, Some(spec.name));
        }
        assert!(lookup(types::RES_OK).is_none());
    }

    #[test]
    fn failure_composition() {
        let mut res = Message::new(types::RES_OK);
        set_resource_quota_failure(&mut res, "quota", types::RESOURCE_QUOTA_NO_SECURE);
        assert_eq!(res.msg_type, types::RES_FAIL);
        assert_eq!(res.get_u32(0).unwrap(), types::FAIL_RESOURCE_QUOTA);
        assert_eq!(res.get_str(1).unwrap(), "quota");
        assert_eq!(res.get_u32(2).unwrap(), types::RESOURCE_QUOTA_NO_SECURE);
    }
}
