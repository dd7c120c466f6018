//! Commander actor: executes commands against the backend.
//!
//! Pops commands from the incoming queue (deferring while the outgoing
//! queue is quenched), dispatches each through the command table, and
//! enqueues exactly one result per command with the command's id.
//! Check-workspace notes from the eventer re-run the permission
//! procedure; a denial logs the client out of that workspace.

use std::{collections::BTreeMap, sync::Arc};

use conclave_proto::{Message, atom, types};
use tokio::sync::mpsc;

use super::{
    CommanderNote, SessionShared,
    handlers::{self, CommandCtx, HandlerFail, WorkspaceHandle},
};
use crate::backend::{Backend, BackendConn, BackendError, anp_query_strict, now_secs};

/// Run the commander until the session shuts down.
pub async fn run<B: Backend>(
    backend: B,
    shared: Arc<SessionShared>,
    mut notes: mpsc::UnboundedReceiver<CommanderNote>,
) {
    let mut conn = match backend.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            shared.set_no_backend(e.to_string());
            return;
        },
    };

    let mut workspaces: BTreeMap<u64, WorkspaceHandle> = BTreeMap::new();

    if let Err(e) = main_loop(&mut conn, &shared, &mut notes, &mut workspaces).await {
        shared.set_no_backend(e.to_string());
    }
}

async fn main_loop<C: BackendConn>(
    conn: &mut C,
    shared: &Arc<SessionShared>,
    notes: &mut mpsc::UnboundedReceiver<CommanderNote>,
    workspaces: &mut BTreeMap<u64, WorkspaceHandle>,
) -> Result<(), BackendError> {
    let mut shutdown = shared.shutdown_watch();

    loop {
        if shared.is_down() {
            return Ok(());
        }

        // Process pending notes before touching the command queue.
        while let Ok(note) = notes.try_recv() {
            handle_note(conn, shared, workspaces, note).await?;
        }

        // Defer new commands while the outgoing queue is backed up; the
        // broker drains it independently.
        let out_quenched = shared.outgoing.is_quenched();

        let cmd = tokio::select! {
            _ = shutdown.changed() => continue,
            note = notes.recv() => {
                match note {
                    Some(note) => {
                        handle_note(conn, shared, workspaces, note).await?;
                        continue;
                    },
                    None => return Ok(()),
                }
            },
            msg = shared.incoming.pop(), if !out_quenched => match msg {
                Some(msg) => msg,
                None => return Ok(()),
            },
            () = shared.outgoing.unquenched(), if out_quenched => continue,
        };

        exec_cmd(conn, shared, workspaces, cmd).await?;
    }
}

async fn handle_note<C: BackendConn>(
    conn: &mut C,
    shared: &Arc<SessionShared>,
    workspaces: &mut BTreeMap<u64, WorkspaceHandle>,
    note: CommanderNote,
) -> Result<(), BackendError> {
    match note {
        CommanderNote::CheckWorkspace { kws_id } => {
            if let Some(handle) = workspaces.get(&kws_id).copied() {
                check_workspace(conn, shared, workspaces, handle).await?;
            }
            Ok(())
        },
    }
}

/// Re-run the login permission procedure for one workspace. On denial,
/// notify the client (effective minor ≥ 4) and drop the workspace.
async fn check_workspace<C: BackendConn>(
    conn: &mut C,
    shared: &Arc<SessionShared>,
    workspaces: &mut BTreeMap<u64, WorkspaceHandle>,
    handle: WorkspaceHandle,
) -> Result<(), BackendError> {
    let rest = anp_query_strict(conn, "check_kws_login", |buf| {
        atom::write_u64(buf, handle.kws_id);
        atom::write_u32(buf, handle.login_type.to_u32());
        atom::write_u32(buf, handle.user_id);
    })
    .await?;

    let mut buf = &rest[..];
    let denied = atom::read_u32(&mut buf)?;
    let login_code = atom::read_u32(&mut buf)?;
    let error_text = atom::read_str(&mut buf)?;

    if denied == 0 {
        return Ok(());
    }

    tracing::info!(
        kws_id = handle.kws_id,
        login_code,
        "permission recheck denied: {error_text}"
    );

    if shared.minor >= 4 {
        let mut evt = Message::new(types::EVT_KWS_LOG_OUT);
        evt.minor = 4;
        evt.id = 0;
        evt.put_u64(handle.kws_id)
            .put_u64(now_secs())
            .put_u32(login_code)
            .put_str(&error_text);
        shared.outgoing.push(evt);
    }

    workspaces.remove(&handle.kws_id);
    let _ = shared.to_eventer.send(super::EventerNote::Unlisten { kws_id: handle.kws_id });

    Ok(())
}

async fn exec_cmd<C: BackendConn>(
    conn: &mut C,
    shared: &Arc<SessionShared>,
    workspaces: &mut BTreeMap<u64, WorkspaceHandle>,
    mut cmd: Message,
) -> Result<(), BackendError> {
    let mut res = Message::new(types::RES_OK);
    res.minor = shared.minor;
    res.id = cmd.id;

    let outcome = dispatch(conn, shared, workspaces, &mut cmd, &mut res).await;

    match outcome {
        Ok(()) => {},
        Err(HandlerFail::Generic(text)) => {
            tracing::debug!(msg_type = cmd.msg_type, "command failed: {text}");
            handlers::set_gen_failure(&mut res, &text);
        },
        Err(HandlerFail::Specific) => {},
        Err(HandlerFail::Backend(e)) => return Err(e),
    }

    shared.outgoing.push(res);
    Ok(())
}

async fn dispatch<C: BackendConn>(
    conn: &mut C,
    shared: &Arc<SessionShared>,
    workspaces: &mut BTreeMap<u64, WorkspaceHandle>,
    cmd: &mut Message,
    res: &mut Message,
) -> Result<(), HandlerFail> {
    let Some(spec) = handlers::lookup(cmd.msg_type) else {
        return Err(HandlerFail::Generic(format!(
            "command {} is not supported",
            cmd.msg_type
        )));
    };

    tracing::debug!(id = cmd.id, "executing \"{}\" command", spec.name);

    let mut ctx = CommandCtx {
        cmd,
        res,
        kws: None,
        workspaces,
        conn,
        minor: shared.minor,
        date: now_secs(),
        shared: shared.as_ref(),
    };

    // Workspace-bound commands name their workspace in the first payload
    // atom; the session must already be logged into it.
    if spec.kws_bound {
        let kws_id = ctx.cmd.read_u64()?;
        match ctx.workspaces.get(&kws_id).copied() {
            Some(handle) => ctx.kws = Some(handle),
            None => {
                handlers::set_failure(
                    ctx.res,
                    types::FAIL_PERM_DENIED,
                    &format!("not logged in to workspace {kws_id}"),
                );
                return Err(HandlerFail::Specific);
            },
        }
    }

    handlers::execute(spec, &mut ctx).await
}
