//! Resumable chunked file download.
//!
//! The command names the files as (inode, offset, commit-id) triples; the
//! backend resolves their storage paths. Files stream in order as
//! DOWNLOAD-DATA messages of at most ~256 KiB payload, each a run of
//! submessages: FILE announces the next file's total and remaining size,
//! CHUNK carries content. Several files may share one message when the
//! cap allows.

use std::io::SeekFrom;

use bytes::BytesMut;
use conclave_proto::{atom, types};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};

use super::{TicketFail, TicketResult, TicketSession};
use crate::backend::{BackendConn, BackendError};

/// Preferred maximum payload of one outbound message.
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Preferred minimum chunk size.
const MIN_CHUNK_SIZE: usize = 64 * 1024;

struct DownloadItem {
    inode: u64,
    offset: u64,
    #[allow(dead_code)]
    commit_id: u64,
    storage_path: String,
}

struct OpenFile {
    file: tokio::fs::File,
    remaining: u64,
}

/// Handle a download session.
pub async fn handle<R, W, C>(session: &mut TicketSession<R, W, C>) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let share_id = session.ticket.share_id()?;
    let mut items = parse_request(session)?;

    if items.is_empty() {
        return Err(TicketFail::Generic(
            "the number of files to download is 0".to_owned(),
        ));
    }

    resolve_paths(session, share_id, &mut items).await?;

    let mut index = 0;
    let mut open: Option<OpenFile> = None;

    while index < items.len() {
        let msg = build_message(session, &items, &mut index, &mut open).await?;
        session.send(&msg).await?;
    }

    Ok(())
}

/// Parse (inode, offset, commit-id) triples from the command.
fn parse_request<R, W, C>(
    session: &mut TicketSession<R, W, C>,
) -> TicketResult<Vec<DownloadItem>>
where
    C: BackendConn,
{
    let Some(msg) = session.in_msg.as_mut() else {
        return Err(TicketFail::Generic("missing download command".to_owned()));
    };

    let nb = msg.read_u32()?;
    let mut items = Vec::with_capacity(nb as usize);
    for _ in 0..nb {
        items.push(DownloadItem {
            inode: msg.read_u64()?,
            offset: msg.read_u64()?,
            commit_id: msg.read_u64()?,
            storage_path: String::new(),
        });
    }
    Ok(items)
}

/// Ask the backend for the storage path of every requested file.
async fn resolve_paths<R, W, C>(
    session: &mut TicketSession<R, W, C>,
    share_id: u32,
    items: &mut [DownloadItem],
) -> TicketResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: BackendConn,
{
    let mut extra = BytesMut::new();
    atom::write_u32(&mut extra, share_id);
    atom::write_u32(&mut extra, items.len() as u32);
    for item in items.iter() {
        atom::write_u64(&mut extra, item.inode);
        atom::write_u64(&mut extra, item.commit_id);
    }

    let (_res, rest) = session.bound_query("download_file", None, &extra).await?;

    let mut buf = &rest[..];
    for item in items.iter_mut() {
        item.storage_path = atom::read_str(&mut buf).map_err(BackendError::Reply)?;
    }
    Ok(())
}

/// Build one outbound DOWNLOAD-DATA message, advancing through the files
/// until the payload cap is reached or everything has been sent.
async fn build_message<R, W, C>(
    session: &TicketSession<R, W, C>,
    items: &[DownloadItem],
    index: &mut usize,
    open: &mut Option<OpenFile>,
) -> TicketResult<conclave_proto::Message>
where
    C: BackendConn,
{
    let mut payload = BytesMut::new();
    let mut nb_sub: u32 = 0;

    while payload.len() < MAX_MESSAGE_SIZE && *index < items.len() {
        match open.as_mut() {
            None => {
                let item = &items[*index];
                let full = session.store_dir().join(&item.storage_path);

                let mut file = tokio::fs::File::open(&full).await.map_err(|e| {
                    TicketFail::Generic(format!("cannot open inode {}: {e}", item.inode))
                })?;

                let total = file
                    .metadata()
                    .await
                    .map_err(|e| TicketFail::Internal(crate::error::ServerError::Io(e)))?
                    .len();

                if item.offset > total {
                    return Err(TicketFail::Generic(format!(
                        "offset {} is bigger than file size {total} for inode {}",
                        item.offset, item.inode
                    )));
                }
                let remaining = total - item.offset;

                nb_sub += 1;
                atom::write_u32(&mut payload, 4);
                atom::write_u32(&mut payload, types::FILES_SUB_FILE);
                atom::write_u64(&mut payload, total);
                atom::write_u64(&mut payload, remaining);

                if remaining == 0 {
                    *index += 1;
                } else {
                    file.seek(SeekFrom::Start(item.offset))
                        .await
                        .map_err(|e| TicketFail::Internal(crate::error::ServerError::Io(e)))?;
                    *open = Some(OpenFile { file, remaining });
                }
            },

            Some(current) => {
                let headroom = MAX_MESSAGE_SIZE.saturating_sub(payload.len());
                let chunk_size = MIN_CHUNK_SIZE
                    .max(headroom)
                    .min(current.remaining as usize);

                let mut chunk = vec![0u8; chunk_size];
                current
                    .file
                    .read_exact(&mut chunk)
                    .await
                    .map_err(|e| TicketFail::Internal(crate::error::ServerError::Io(e)))?;
                current.remaining -= chunk_size as u64;

                nb_sub += 1;
                atom::write_u32(&mut payload, 3);
                atom::write_u32(&mut payload, types::FILES_SUB_CHUNK);
                atom::write_bin(&mut payload, &chunk);

                if current.remaining == 0 {
                    *open = None;
                    *index += 1;
                }
            },
        }
    }

    let mut msg = session.new_out(types::RES_FILES_DOWNLOAD_DATA);
    let mut full_payload = BytesMut::new();
    atom::write_u32(&mut full_payload, nb_sub);
    full_payload.extend_from_slice(&payload);
    msg.set_payload(&full_payload).map_err(BackendError::Reply)?;

    Ok(msg)
}
