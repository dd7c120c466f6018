//! Message type encoding and protocol vocabulary.
//!
//! The 32-bit type field breaks down as:
//!
//! - bits 28–31: protocol family, always 1
//! - bits 26–27: role — 0 command, 1 result, 2 event
//! - bits 16–25: namespace
//! - bits 8–15: subtype
//! - bits 0–7: reserved
//!
//! The constants below are the full command/result/event vocabulary the
//! daemon recognizes, plus the failure kinds, login codes and flag bits
//! carried inside payloads.

/// Protocol major version.
pub const MAJOR_VERSION: u32 = 0;

/// Protocol minor version supported by this daemon.
pub const MINOR_VERSION: u32 = 6;

/// Oldest client minor version still accepted. Anything below is refused
/// with a must-upgrade failure during role negotiation.
pub const LAST_COMPAT_MINOR: u32 = 1;

/// Protocol family bits (bits 28–31 = 1).
pub const PROTO_FAMILY: u32 = 1 << 28;

/// Role bits: command.
pub const ROLE_CMD: u32 = 0 << 26;
/// Role bits: result.
pub const ROLE_RES: u32 = 1 << 26;
/// Role bits: event.
pub const ROLE_EVT: u32 = 2 << 26;

/// Generic namespace.
pub const NS_GEN: u32 = 0 << 16;
/// Management namespace.
pub const NS_MGT: u32 = 1 << 16;
/// Workspace namespace.
pub const NS_KWS: u32 = 2 << 16;
/// Chat namespace.
pub const NS_CHAT: u32 = 4 << 16;
/// File transfer namespace.
pub const NS_FILES: u32 = 5 << 16;
/// Screen sharing namespace.
pub const NS_SCREEN: u32 = 6 << 16;
/// Whiteboard namespace.
pub const NS_WB: u32 = 7 << 16;
/// Public board namespace.
pub const NS_PB: u32 = 8 << 16;

const fn cmd(ns: u32, subtype: u32) -> u32 {
    PROTO_FAMILY | ROLE_CMD | ns | (subtype << 8)
}

const fn res(ns: u32, subtype: u32) -> u32 {
    PROTO_FAMILY | ROLE_RES | ns | (subtype << 8)
}

const fn evt(ns: u32, subtype: u32) -> u32 {
    PROTO_FAMILY | ROLE_EVT | ns | (subtype << 8)
}

/// True if the type field carries the protocol family bits.
#[must_use]
pub const fn is_protocol_type(msg_type: u32) -> bool {
    msg_type >> 28 == 1
}

/// Role bits of a type field.
#[must_use]
pub const fn role_of(msg_type: u32) -> u32 {
    msg_type & (3 << 26)
}

/// Namespace bits of a type field.
#[must_use]
pub const fn namespace_of(msg_type: u32) -> u32 {
    msg_type & (0x3ff << 16)
}

// Generic results.

/// Command succeeded.
pub const RES_OK: u32 = res(NS_GEN, 0);
/// Command failed. Payload: failure kind U32, explanation STR, then
/// kind-specific extras.
pub const RES_FAIL: u32 = res(NS_GEN, 1);

// Failure kinds carried in the first atom of a RES_FAIL payload.

/// Generic failure; only the text says what went wrong.
pub const FAIL_GENERIC: u32 = 0;
/// The daemon hit an internal error and exits once this is flushed. Id 0.
pub const FAIL_BACKEND: u32 = 1;
/// v2 compatibility: the user was not uniquely identified; candidate user
/// rows follow.
pub const FAIL_CHOOSE_USER_ID: u32 = 2;
/// v2 compatibility: the client's event view is inconsistent and must be
/// refetched.
pub const FAIL_EVT_OUT_OF_SYNC: u32 = 3;
/// Role negotiation refused: the client is too old.
pub const FAIL_MUST_UPGRADE: u32 = 4;
/// The user lacks the required permission.
pub const FAIL_PERM_DENIED: u32 = 5;
/// Per-workspace file quota exceeded.
pub const FAIL_FILE_QUOTA: u32 = 6;
/// Licensed resource quota exceeded; a subkind U32 follows.
pub const FAIL_RESOURCE_QUOTA: u32 = 7;

/// Resource-quota subkind: miscellaneous.
pub const RESOURCE_QUOTA_GENERAL: u32 = 0;
/// Resource-quota subkind: secure operation denied.
pub const RESOURCE_QUOTA_NO_SECURE: u32 = 1;

// Management namespace.

/// Select the daemon role. Payload: role U32.
pub const CMD_MGT_SELECT_ROLE: u32 = cmd(NS_MGT, 0);
/// Create a workspace.
pub const CMD_MGT_CREATE_KWS: u32 = cmd(NS_MGT, 1);
/// Workspace created. Payload: workspace id U64, email id STR (minor ≥ 3).
pub const RES_MGT_KWS_CREATED: u32 = res(NS_MGT, 1);
/// Send the freemium confirmation email.
pub const CMD_MGT_FREEMIUM_CONFIRM: u32 = cmd(NS_MGT, 2);

// Workspace namespace.

/// Invite people into a workspace.
pub const CMD_KWS_INVITE: u32 = cmd(NS_KWS, 2);
/// Invitation accepted; per-invitee rows for minor ≥ 3.
pub const RES_KWS_INVITE: u32 = res(NS_KWS, 2);
/// Authenticate into a workspace.
pub const CMD_KWS_CONNECT: u32 = cmd(NS_KWS, 3);
/// Login reply; shape depends on the effective minor.
pub const RES_KWS_CONNECT: u32 = res(NS_KWS, 3);
/// Leave a workspace.
pub const CMD_KWS_DISCONNECT: u32 = cmd(NS_KWS, 4);
/// Obtain a unique URL representing an email.
pub const CMD_KWS_GET_UURL: u32 = cmd(NS_KWS, 5);
/// Unique URL reply.
pub const RES_KWS_UURL: u32 = res(NS_KWS, 5);
/// Set a user's password.
pub const CMD_KWS_SET_USER_PWD: u32 = cmd(NS_KWS, 6);
/// Reply to every property-change command. Payload: generated event id U64,
/// 0 if none.
pub const RES_KWS_PROP_CHANGE: u32 = res(NS_KWS, 6);
/// Set a user's name.
pub const CMD_KWS_SET_USER_NAME: u32 = cmd(NS_KWS, 7);
/// Set a user's administrator flag.
pub const CMD_KWS_SET_USER_ADMIN: u32 = cmd(NS_KWS, 8);
/// Set a user's manager flag.
pub const CMD_KWS_SET_USER_MANAGER: u32 = cmd(NS_KWS, 9);
/// Lock or unlock a user account.
pub const CMD_KWS_SET_USER_LOCK: u32 = cmd(NS_KWS, 10);
/// Ban or unban a user.
pub const CMD_KWS_SET_USER_BAN: u32 = cmd(NS_KWS, 11);
/// Rename the workspace.
pub const CMD_KWS_SET_NAME: u32 = cmd(NS_KWS, 12);
/// Set the workspace secure flag.
pub const CMD_KWS_SET_SECURE: u32 = cmd(NS_KWS, 13);
/// Freeze the workspace.
pub const CMD_KWS_SET_FREEZE: u32 = cmd(NS_KWS, 14);
/// Deep-freeze the workspace.
pub const CMD_KWS_SET_DEEP_FREEZE: u32 = cmd(NS_KWS, 15);
/// Set the thin-store flag.
pub const CMD_KWS_SET_THIN_STORE: u32 = cmd(NS_KWS, 16);

/// A workspace was created.
pub const EVT_KWS_CREATED: u32 = evt(NS_KWS, 1);
/// Users were invited.
pub const EVT_KWS_INVITED: u32 = evt(NS_KWS, 2);
/// A user joined for the first time.
pub const EVT_KWS_USER_REGISTERED: u32 = evt(NS_KWS, 3);
/// Transient: the server logged the user out of a workspace. Payload:
/// workspace id U64, date U64, login code U32, error STR.
pub const EVT_KWS_LOG_OUT: u32 = evt(NS_KWS, 5);
/// Workspace or user properties changed.
pub const EVT_KWS_PROP_CHANGE: u32 = evt(NS_KWS, 6);

// Chat namespace.

/// Post a chat message. Payload: workspace id U64, chat id U32, text STR.
pub const CMD_CHAT_MSG: u32 = cmd(NS_CHAT, 1);
/// A chat message was posted.
pub const EVT_CHAT_MSG: u32 = evt(NS_CHAT, 1);

// File transfer namespace.

/// Request a download ticket. Payload: workspace id U64, share id U32.
pub const CMD_FILES_DOWNLOAD_REQ: u32 = cmd(NS_FILES, 1);
/// Download ticket granted. Payload: ticket BIN.
pub const RES_FILES_DOWNLOAD_REQ: u32 = res(NS_FILES, 1);
/// Request an upload ticket. Payload: workspace id U64, share id U32.
pub const CMD_FILES_UPLOAD_REQ: u32 = cmd(NS_FILES, 2);
/// Upload ticket granted. Payload: ticket BIN.
pub const RES_FILES_UPLOAD_REQ: u32 = res(NS_FILES, 2);
/// Download file data (ticket mode).
pub const CMD_FILES_DOWNLOAD_DATA: u32 = cmd(NS_FILES, 3);
/// Download data stream; carries FILE and CHUNK submessages.
pub const RES_FILES_DOWNLOAD_DATA: u32 = res(NS_FILES, 3);
/// Upload phase 1: describe the changes to apply to the share.
pub const CMD_FILES_PHASE_1: u32 = cmd(NS_FILES, 4);
/// Phase 1 accepted; per-change rows follow.
pub const RES_FILES_PHASE_1: u32 = res(NS_FILES, 4);
/// Upload phase 2: stream file content submessages.
pub const CMD_FILES_PHASE_2: u32 = cmd(NS_FILES, 5);

/// Share structure changed (phase 1 applied).
pub const EVT_FILES_PHASE_1: u32 = evt(NS_FILES, 1);
/// File content uploaded (phase 2 committed).
pub const EVT_FILES_PHASE_2: u32 = evt(NS_FILES, 2);
/// A file was downloaded.
pub const EVT_FILES_DOWNLOAD: u32 = evt(NS_FILES, 3);

// Screen sharing namespace.

/// Request a host ticket. Payload: workspace id U64.
pub const CMD_SCREEN_START_TICKET: u32 = cmd(NS_SCREEN, 1);
/// Host ticket granted. Payload: ticket BIN.
pub const RES_SCREEN_START_TICKET: u32 = res(NS_SCREEN, 1);
/// Start a sharing session (ticket mode). Payload: ticket BIN, subject STR.
pub const CMD_SCREEN_START_SESSION: u32 = cmd(NS_SCREEN, 2);
/// Session started. Payload: session id U64 (minor ≥ 3).
pub const RES_SCREEN_START_SESSION: u32 = res(NS_SCREEN, 2);
/// Request a guest ticket. Payload: workspace id U64, session id U64.
pub const CMD_SCREEN_CONNECT_TICKET: u32 = cmd(NS_SCREEN, 3);
/// Guest ticket granted. Payload: ticket BIN.
pub const RES_SCREEN_CONNECT_TICKET: u32 = res(NS_SCREEN, 3);
/// Join a sharing session (ticket mode). Payload: ticket BIN.
pub const CMD_SCREEN_CONNECT_SESSION: u32 = cmd(NS_SCREEN, 4);

/// A sharing session started.
pub const EVT_SCREEN_START: u32 = evt(NS_SCREEN, 1);
/// A sharing session ended. Minor ≥ 5 adds an error code and message.
pub const EVT_SCREEN_END: u32 = evt(NS_SCREEN, 2);

// Public board namespace.

/// Accept a requested chat in a public workspace.
pub const CMD_PB_ACCEPT_CHAT: u32 = cmd(NS_PB, 1);
/// A public-board chat request was accepted.
pub const EVT_PB_CHAT_ACCEPTED: u32 = evt(NS_PB, 2);

/// Client role negotiated by the first command of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Principal subprotocol: commands, results and events.
    Workspace,
    /// Bulk file transfer under a ticket.
    FileTransfer,
    /// Screen-sharing proxying under a ticket.
    ScreenShare,
}

impl Role {
    /// Wire value of this role.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Workspace => 1,
            Self::FileTransfer => 2,
            Self::ScreenShare => 3,
        }
    }

    /// Parse a wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Workspace),
            2 => Some(Self::FileTransfer),
            3 => Some(Self::ScreenShare),
            _ => None,
        }
    }
}

/// How a user is logged into a workspace.
///
/// Root and portal logins are privileged; a portal login receives no
/// workspace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginType {
    /// Regular credentials.
    Normal,
    /// Regular credentials upgraded on a secure workspace.
    Secure,
    /// System administrator.
    Root,
    /// Web front-end service login.
    Portal,
}

impl LoginType {
    /// Wire value of this login type.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Normal => 1,
            Self::Secure => 2,
            Self::Root => 3,
            Self::Portal => 4,
        }
    }

    /// Parse a wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Normal),
            2 => Some(Self::Secure),
            3 => Some(Self::Root),
            4 => Some(Self::Portal),
            _ => None,
        }
    }
}

/// Workspace login result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginCode {
    /// Credentials accepted.
    Ok,
    /// Credentials accepted but the client's event view is out of sync.
    OutOfSync,
    /// Password and/or ticket refused.
    BadPwdOrTicket,
    /// No such workspace.
    BadWorkspaceId,
    /// The email id is invalid or purged.
    BadEmailId,
    /// The workspace was deleted.
    DeletedWorkspace,
    /// The user account is locked.
    AccountLocked,
    /// The user is banned.
    Banned,
}

impl LoginCode {
    /// Wire value of this login code.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Ok => 1,
            Self::OutOfSync => 2,
            Self::BadPwdOrTicket => 3,
            Self::BadWorkspaceId => 4,
            Self::BadEmailId => 5,
            Self::DeletedWorkspace => 6,
            Self::AccountLocked => 7,
            Self::Banned => 8,
        }
    }

    /// Parse a wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Ok),
            2 => Some(Self::OutOfSync),
            3 => Some(Self::BadPwdOrTicket),
            4 => Some(Self::BadWorkspaceId),
            5 => Some(Self::BadEmailId),
            6 => Some(Self::DeletedWorkspace),
            7 => Some(Self::AccountLocked),
            8 => Some(Self::Banned),
            _ => None,
        }
    }
}

// Workspace flags.

/// The workspace is public.
pub const KWS_FLAG_PUBLIC: u32 = 1 << 0;
/// Frozen by the workspace administrator.
pub const KWS_FLAG_FREEZE: u32 = 1 << 1;
/// Frozen by the system administrator.
pub const KWS_FLAG_DEEP_FREEZE: u32 = 1 << 2;
/// File content is deleted when the user deletes the file.
pub const KWS_FLAG_THIN_STORE: u32 = 1 << 3;
/// The workspace is marked secure.
pub const KWS_FLAG_SECURE: u32 = 1 << 4;
/// The workspace is in v2 compatibility mode. Unpublished.
pub const KWS_FLAG_COMPAT_V2: u32 = 1 << 29;
/// The workspace was deleted. Unpublished.
pub const KWS_FLAG_DELETE: u32 = 1 << 30;

// User flags.

/// Workspace administrator.
pub const USER_FLAG_ADMIN: u32 = 1 << 0;
/// Workspace manager.
pub const USER_FLAG_MANAGER: u32 = 1 << 1;
/// The user has registered to the workspace.
pub const USER_FLAG_REGISTER: u32 = 1 << 2;
/// The account is locked.
pub const USER_FLAG_LOCK: u32 = 1 << 3;
/// The user is banned.
pub const USER_FLAG_BAN: u32 = 1 << 4;
/// The user has root permission. Unpublished.
pub const USER_FLAG_ROOT: u32 = 1 << 30;

// Workspace and user property ids (property-change events).

/// Workspace name.
pub const PROP_KWS_NAME: u32 = 1;
/// Workspace flags.
pub const PROP_KWS_FLAGS: u32 = 2;
/// User name given by an administrator.
pub const PROP_USER_NAME_ADMIN: u32 = 101;
/// User name chosen by the user.
pub const PROP_USER_NAME_USER: u32 = 102;
/// User flags.
pub const PROP_USER_FLAGS: u32 = 103;

// File store vocabulary.

/// Entry kind: regular file.
pub const FILES_ENTRY_FILE: u32 = 1;
/// Entry kind: directory.
pub const FILES_ENTRY_DIR: u32 = 2;

/// Change operation: create a file.
pub const FILES_OP_CREATE_FILE: u32 = 1;
/// Change operation: create a directory.
pub const FILES_OP_CREATE_DIR: u32 = 2;
/// Change operation: update a file.
pub const FILES_OP_UPDATE_FILE: u32 = 3;
/// Change operation: delete a file.
pub const FILES_OP_DELETE_FILE: u32 = 4;
/// Change operation: delete a directory.
pub const FILES_OP_DELETE_DIR: u32 = 5;
/// Change operation: move a file.
pub const FILES_OP_MOVE_FILE: u32 = 6;
/// Change operation: move a directory.
pub const FILES_OP_MOVE_DIR: u32 = 7;

/// Submessage announcing the next file of a download.
pub const FILES_SUB_FILE: u32 = 1;
/// Submessage carrying a chunk of file content.
pub const FILES_SUB_CHUNK: u32 = 2;
/// Submessage committing the current upload file with its digest.
pub const FILES_SUB_COMMIT: u32 = 3;
/// Submessage aborting the current upload file.
pub const FILES_SUB_ABORT: u32 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_field_layout() {
        // Known bit patterns from the wire definition.
        assert_eq!(RES_OK, 0x1400_0000);
        assert_eq!(RES_FAIL, 0x1400_0100);
        assert_eq!(CMD_MGT_SELECT_ROLE, 0x1001_0000);
        assert_eq!(CMD_KWS_CONNECT, 0x1002_0300);
        assert_eq!(EVT_KWS_LOG_OUT, 0x1802_0500);
        assert_eq!(CMD_FILES_PHASE_2, 0x1005_0500);
    }

    #[test]
    fn role_and_namespace_helpers() {
        assert_eq!(role_of(RES_FAIL), ROLE_RES);
        assert_eq!(role_of(EVT_CHAT_MSG), ROLE_EVT);
        assert_eq!(namespace_of(CMD_FILES_PHASE_1), NS_FILES);
        assert!(is_protocol_type(CMD_KWS_CONNECT));
        assert!(!is_protocol_type(0));
    }

    #[test]
    fn enums_round_trip() {
        for v in 1..=3 {
            assert_eq!(Role::from_u32(v).map(Role::to_u32), Some(v));
        }
        for v in 1..=4 {
            assert_eq!(LoginType::from_u32(v).map(LoginType::to_u32), Some(v));
        }
        for v in 1..=8 {
            assert_eq!(LoginCode::from_u32(v).map(LoginCode::to_u32), Some(v));
        }
        assert_eq!(Role::from_u32(0), None);
        assert_eq!(LoginType::from_u32(9), None);
    }
}
