//! Two-phase file upload.
//!
//! Phase 1 submits the change description to the backend, which answers
//! with the commit id, the files whose content must be streamed, and the
//! storage paths to delete permanently. Phase 2 streams that content as
//! chunk/commit/abort submessages: chunks feed a running MD5 and the
//! on-disk file under per-workspace and license byte ceilings; commit
//! finalizes the digest against the client's and records the file; abort
//! discards it. Every received phase-2 message is acknowledged and
//! refreshes the upload entry; when all files are resolved, one backend
//! call atomically records the commit group and emits the event.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use conclave_proto::{atom, types};
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{TicketFail, TicketResult, TicketSession};
use crate::backend::{BackendConn, BackendError, now_secs};

/// Receive budget per phase-2 message; on expiry the upload entry is
/// refreshed and the wait restarts.
const RECV_BUDGET: Duration = Duration::from_secs(60);

/// One file announced by phase 1 for content streaming.
#[derive(Debug, Clone)]
struct UploadFile {
    create: bool,
    inode: u64,
    share_path: String,
    storage_path: String,
}

/// A file whose content was committed.
#[derive(Debug, Clone)]
struct CommittedFile {
    create: bool,
    inode: u64,
    share_path: String,
    size: u64,
    digest: [u8; 16],
}

/// The file currently receiving chunks.
struct CurrentFile {
    file: tokio::fs::File,
    path: std::path::PathBuf,
    hasher: Md5,
    size: u64,
}

#[derive(Default)]
struct UploadState {
    share_id: u32,
    commit_id: u64,
    public_email_id: u64,
    files: Vec<UploadFile>,
    index: usize,
    committed: Vec<CommittedFile>,
    committed_total: u64,
    current: Option<CurrentFile>,
    kws_file_size: u64,
    kws_quota: u64,
}

/// Handle an upload session.
pub async fn handle<R, W, C>(session: &mut TicketSession<R, W, C>) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let mut st = UploadState {
        share_id: session.ticket.share_id()?,
        ..UploadState::default()
    };

    // Run the phases; a user-level failure is reported but the commit
    // group of already-committed files is still recorded.
    let mut pending_failure = false;
    let mut connection_lost = false;

    match run_phases(session, &mut st).await {
        Ok(()) => {},
        Err(TicketFail::Internal(e)) => return Err(TicketFail::Internal(e)),
        Err(TicketFail::Connection(text)) => {
            tracing::debug!("upload connection lost: {text}");
            pending_failure = true;
            connection_lost = true;
        },
        Err(fail) => {
            report(session, fail).await?;
            pending_failure = true;
        },
    }

    // The file being uploaded never survives an early end.
    discard_current(&mut st).await;

    // Record the commit group for whatever was committed.
    if st.phase_2_started() {
        match post_phase_2_event(session, &st).await {
            Ok(()) => {},
            Err(TicketFail::Internal(e)) => return Err(TicketFail::Internal(e)),
            Err(TicketFail::Connection(text)) => {
                pending_failure = true;
                connection_lost = true;
                tracing::debug!("upload connection lost: {text}");
            },
            Err(fail) => {
                if !pending_failure {
                    report(session, fail).await?;
                    pending_failure = true;
                }
            },
        }
    }

    if pending_failure {
        let text = if connection_lost {
            "connection lost during upload"
        } else {
            "closed client connection after handling upload error"
        };
        return Err(TicketFail::Connection(text.to_owned()));
    }

    // Final acknowledgement of phase 2.
    if st.phase_2_started() {
        let ok = session.new_out(types::RES_OK);
        session.send(&ok).await?;
    }

    Ok(())
}

impl UploadState {
    fn phase_2_started(&self) -> bool {
        !self.files.is_empty()
    }
}

/// Send a user-level failure without ending the function.
async fn report<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    fail: TicketFail,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let msg = match fail {
        TicketFail::Generic(text) => session.fail_generic(&text),
        TicketFail::Specific(msg) => msg,
        other => return Err(other),
    };
    tracing::info!("upload failure: {}", msg.dump());
    match session.send(&msg).await {
        Ok(()) | Err(TicketFail::Connection(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn run_phases<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    st: &mut UploadState,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    phase_1(session, st).await?;
    if st.phase_2_started() {
        phase_2(session, st).await?;
    }
    Ok(())
}

/// Phase 1: submit the change description, unlink the permanently
/// deleted paths, reply with the per-change results.
async fn phase_1<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    st: &mut UploadState,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let cmd_payload = session
        .in_msg
        .as_ref()
        .map(|m| Bytes::copy_from_slice(m.payload_bytes()))
        .unwrap_or_default();

    let mut extra = BytesMut::new();
    atom::write_u32(&mut extra, st.share_id);

    let (res, rest) = session
        .bound_query("upload_phase_one", Some(&cmd_payload), &extra)
        .await?;

    let mut buf = &rest[..];
    st.commit_id = atom::read_u64(&mut buf).map_err(BackendError::Reply)?;
    st.public_email_id = atom::read_u64(&mut buf).map_err(BackendError::Reply)?;

    let nb_upload = atom::read_u32(&mut buf).map_err(BackendError::Reply)?;
    for _ in 0..nb_upload {
        st.files.push(UploadFile {
            create: atom::read_u32(&mut buf).map_err(BackendError::Reply)? != 0,
            inode: atom::read_u64(&mut buf).map_err(BackendError::Reply)?,
            share_path: atom::read_str(&mut buf).map_err(BackendError::Reply)?,
            storage_path: atom::read_str(&mut buf).map_err(BackendError::Reply)?,
        });
    }

    let nb_delete = atom::read_u32(&mut buf).map_err(BackendError::Reply)?;
    let mut delete_paths = Vec::with_capacity(nb_delete as usize);
    for _ in 0..nb_delete {
        delete_paths.push(atom::read_str(&mut buf).map_err(BackendError::Reply)?);
    }

    // Concurrent mutations are allowed; per-file failures are ignored.
    for path in delete_paths {
        let full = session.store_dir().join(&path);
        if let Err(e) = tokio::fs::remove_file(&full).await {
            tracing::debug!(path = %full.display(), "permanent delete skipped: {e}");
        }
    }

    session.send(&res).await
}

/// Phase 2: stream the announced files.
async fn phase_2<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    st: &mut UploadState,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    while st.index < st.files.len() {
        refresh_quota(session, st).await?;
        session
            .refresh_usage_and_license()
            .await
            .map_err(TicketFail::from)?;

        let Some(mut msg) = session.timed_recv(Some(RECV_BUDGET)).await? else {
            // Receive budget expired: heartbeat and wait again.
            refresh_upload_entry(session, st).await?;
            continue;
        };

        handle_phase_2_msg(session, st, &mut msg).await?;

        let ok = session.new_out(types::RES_OK);
        session.send(&ok).await?;

        refresh_upload_entry(session, st).await?;
    }
    Ok(())
}

async fn refresh_quota<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    st: &mut UploadState,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let quota = session
        .conn
        .workspace_quota(session.kws_id)
        .await
        .map_err(TicketFail::from)?
        .ok_or_else(|| TicketFail::Generic("cannot obtain quota: no such workspace".to_owned()))?;
    st.kws_file_size = quota.file_size;
    st.kws_quota = quota.file_quota;
    Ok(())
}

async fn refresh_upload_entry<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    st: &UploadState,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let mut extra = BytesMut::new();
    atom::write_u32(&mut extra, st.share_id);
    atom::write_u64(&mut extra, st.commit_id);
    session.bound_query("refresh_upload", None, &extra).await?;
    Ok(())
}

async fn handle_phase_2_msg<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    st: &mut UploadState,
    msg: &mut conclave_proto::Message,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    if msg.msg_type != types::CMD_FILES_PHASE_2 {
        return Err(TicketFail::Generic(format!(
            "unexpected message type {} in upload phase 2",
            msg.msg_type
        )));
    }

    let nb_sub = msg.read_u32()?;
    for _ in 0..nb_sub {
        if st.index == st.files.len() {
            return Err(TicketFail::Generic("too many submessages".to_owned()));
        }

        let _nb_elements = msg.read_u32()?;
        let sub_type = msg.read_u32()?;
        match sub_type {
            types::FILES_SUB_CHUNK => handle_chunk(session, st, msg).await?,
            types::FILES_SUB_COMMIT => handle_commit(session, st, msg).await?,
            types::FILES_SUB_ABORT => handle_abort(st).await?,
            other => {
                return Err(TicketFail::Generic(format!(
                    "unexpected submessage type {other}"
                )));
            },
        }
    }
    Ok(())
}

/// Open the current file if needed: create the missing directories under
/// the workspace storage area (ignoring failures, concurrent operations
/// may race) and initialize the digest.
async fn open_current<R, W, C>(
    session: &TicketSession<R, W, C>,
    st: &mut UploadState,
) -> TicketResult<()>
where
    C: BackendConn,
{
    if st.current.is_some() {
        return Ok(());
    }

    let storage_path = &st.files[st.index].storage_path;
    let full = session.store_dir().join(storage_path);

    if let Some(parent) = full.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::debug!(dir = %parent.display(), "mkdir skipped: {e}");
        }
    }

    let file = tokio::fs::File::create(&full)
        .await
        .map_err(|e| TicketFail::Internal(crate::error::ServerError::Io(e)))?;

    st.current = Some(CurrentFile {
        file,
        path: full,
        hasher: Md5::new(),
        size: 0,
    });
    Ok(())
}

/// Close and delete the current file, if any.
async fn discard_current(st: &mut UploadState) {
    if let Some(current) = st.current.take() {
        drop(current.file);
        if let Err(e) = tokio::fs::remove_file(&current.path).await {
            tracing::debug!(path = %current.path.display(), "discard skipped: {e}");
        }
    }
}

async fn handle_chunk<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    st: &mut UploadState,
    msg: &mut conclave_proto::Message,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let chunk = msg.read_bin()?;

    open_current(session, st).await?;
    let Some(current) = st.current.as_mut() else {
        return Err(TicketFail::Generic("no file open".to_owned()));
    };

    current.hasher.update(&chunk);
    current.size += chunk.len() as u64;

    let upload_total = st.committed_total + current.size;

    // Per-workspace ceiling first, then the licensed global ceiling.
    if upload_total.saturating_add(st.kws_file_size) > st.kws_quota {
        discard_current(st).await;
        return Err(TicketFail::Specific(session.fail_kind(
            types::FAIL_FILE_QUOTA,
            "workspace file quota exceeded",
        )));
    }
    if upload_total.saturating_add(session.usage.file_bytes) > session.license.file_bytes {
        discard_current(st).await;
        let mut msg = session.fail_kind(types::FAIL_RESOURCE_QUOTA, "license file quota exceeded");
        msg.put_u32(types::RESOURCE_QUOTA_GENERAL);
        return Err(TicketFail::Specific(msg));
    }

    let Some(current) = st.current.as_mut() else {
        return Err(TicketFail::Generic("no file open".to_owned()));
    };
    current
        .file
        .write_all(&chunk)
        .await
        .map_err(|e| TicketFail::Internal(crate::error::ServerError::Io(e)))?;

    Ok(())
}

async fn handle_commit<R, W, C>(
    session: &TicketSession<R, W, C>,
    st: &mut UploadState,
    msg: &mut conclave_proto::Message,
) -> TicketResult<()>
where
    C: BackendConn,
{
    let client_digest = msg.read_bin()?;

    // An empty file commits without any chunk; open it now.
    open_current(session, st).await?;
    let Some(mut current) = st.current.take() else {
        return Err(TicketFail::Generic("no file open".to_owned()));
    };

    current
        .file
        .flush()
        .await
        .map_err(|e| TicketFail::Internal(crate::error::ServerError::Io(e)))?;
    drop(current.file);

    let digest: [u8; 16] = current.hasher.finalize().into();

    if client_digest.len() != 16 || client_digest[..] != digest {
        if let Err(e) = tokio::fs::remove_file(&current.path).await {
            tracing::debug!(path = %current.path.display(), "discard skipped: {e}");
        }
        return Err(TicketFail::Generic(
            "the computed file hash does not match".to_owned(),
        ));
    }

    let announced = &st.files[st.index];
    st.committed.push(CommittedFile {
        create: announced.create,
        inode: announced.inode,
        share_path: announced.share_path.clone(),
        size: current.size,
        digest,
    });
    st.committed_total += current.size;
    st.index += 1;

    Ok(())
}

async fn handle_abort(st: &mut UploadState) -> TicketResult<()> {
    discard_current(st).await;
    st.index += 1;
    Ok(())
}

/// Record the commit group and emit the phase-2 event in one atomic
/// backend call.
async fn post_phase_2_event<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    st: &UploadState,
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let date = now_secs();

    let mut evt = BytesMut::new();
    atom::write_u64(&mut evt, session.kws_id);
    atom::write_u64(&mut evt, date);
    atom::write_u32(&mut evt, session.user_id);
    atom::write_u32(&mut evt, st.share_id);
    atom::write_u64(&mut evt, st.commit_id);
    atom::write_u32(&mut evt, st.committed.len() as u32);

    let mut notif = BytesMut::new();
    atom::write_u64(&mut notif, st.public_email_id);
    atom::write_u32(&mut notif, st.committed.len() as u32);

    for file in &st.committed {
        atom::write_u64(&mut evt, file.inode);
        atom::write_u64(&mut evt, file.size);
        atom::write_bin(&mut evt, &file.digest);

        atom::write_u32(&mut notif, u32::from(file.create));
        atom::write_str(&mut notif, &file.share_path);
    }

    let mut extra = BytesMut::new();
    atom::write_u32(&mut extra, st.share_id);
    atom::write_u64(&mut extra, st.commit_id);
    atom::write_u64(&mut extra, st.public_email_id);
    atom::write_bin(&mut extra, &evt);
    atom::write_bin(&mut extra, &notif);
    atom::write_u32(&mut extra, st.committed.len() as u32);
    for file in &st.committed {
        atom::write_u64(&mut extra, file.inode);
        atom::write_u64(&mut extra, file.size);
    }

    session.bound_query("upload_phase_two", None, &extra).await?;
    Ok(())
}
