//! Integration tests for the ticket-mode handler: upload, download and
//! ticket consumption, over a duplex pipe against the in-memory backend.

mod common;

use common::{recv_msg, seeded_backend, start_ticket_engine, test_config};
use conclave_proto::{Message, TicketKind, types, types::LoginType};
use conclave_server::backend::{Backend, MemFile, MemShare};
use md5::{Digest, Md5};
use tempfile::TempDir;

/// Mint a ticket for workspace 42, user 7 through the ledger.
async fn mint_ticket(
    backend: &conclave_server::backend::MemoryBackend,
    kind: TicketKind,
    extension: bytes::Bytes,
) -> bytes::Bytes {
    let mut conn = backend.connect().await.unwrap();
    conclave_server::ticket::mint(
        &mut conn,
        kind.to_u32(),
        42,
        LoginType::Normal.to_u32(),
        7,
        extension,
    )
    .await
    .unwrap()
}

fn share_ext(share_id: u32) -> bytes::Bytes {
    let mut ext = bytes::BytesMut::new();
    conclave_proto::atom::write_u32(&mut ext, share_id);
    ext.freeze()
}

/// Phase-1 command announcing one created file.
fn phase_1_cmd(ticket: &[u8], name: &str) -> Message {
    let mut cmd = Message::new(types::CMD_FILES_PHASE_1);
    cmd.minor = 6;
    cmd.id = 1;
    cmd.put_bin(ticket);
    cmd.put_u64(0); // public email id
    cmd.put_u32(1); // one change
    cmd.put_u32(5); // elements in the change
    cmd.put_u32(types::FILES_OP_CREATE_FILE);
    cmd.put_u64(0); // parent inode
    cmd.put_u64(0); // parent commit
    cmd.put_str(name);
    cmd
}

/// Phase-2 message with the given submessages already encoded.
fn phase_2_msg(id: u64, subs: &[Sub<'_>]) -> Message {
    let mut cmd = Message::new(types::CMD_FILES_PHASE_2);
    cmd.minor = 6;
    cmd.id = id;
    cmd.put_u32(subs.len() as u32);
    for sub in subs {
        match sub {
            Sub::Chunk(data) => {
                cmd.put_u32(3);
                cmd.put_u32(types::FILES_SUB_CHUNK);
                cmd.put_bin(data);
            },
            Sub::Commit(digest) => {
                cmd.put_u32(3);
                cmd.put_u32(types::FILES_SUB_COMMIT);
                cmd.put_bin(digest);
            },
            Sub::Abort => {
                cmd.put_u32(2);
                cmd.put_u32(types::FILES_SUB_ABORT);
            },
        }
    }
    cmd
}

enum Sub<'a> {
    Chunk(&'a [u8]),
    Commit(&'a [u8]),
    Abort,
}

#[tokio::test]
async fn ticket_is_consumed_exactly_once() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let ticket = mint_ticket(&backend, TicketKind::Upload, share_ext(3)).await;

    // First redemption succeeds (an empty change list ends the session
    // after phase 1).
    {
        let mut client =
            start_ticket_engine(backend.clone(), test_config(dir.path()), 6);
        let mut cmd = Message::new(types::CMD_FILES_PHASE_1);
        cmd.minor = 6;
        cmd.id = 1;
        cmd.put_bin(&ticket);
        cmd.put_u64(0);
        cmd.put_u32(0); // no changes
        client.writer.send(&cmd).await.unwrap();

        let res = recv_msg(&mut client).await;
        assert_eq!(res.msg_type, types::RES_FILES_PHASE_1);
    }

    // Replaying the exact same bytes fails with the expiry text.
    {
        let mut client = start_ticket_engine(backend, test_config(dir.path()), 6);
        let mut cmd = Message::new(types::CMD_FILES_PHASE_1);
        cmd.minor = 6;
        cmd.id = 1;
        cmd.put_bin(&ticket);
        cmd.put_u64(0);
        cmd.put_u32(0);
        client.writer.send(&cmd).await.unwrap();

        let res = recv_msg(&mut client).await;
        assert_eq!(res.msg_type, types::RES_FAIL);
        assert_eq!(res.get_u32(0).unwrap(), types::FAIL_GENERIC);
        assert_eq!(res.get_str(1).unwrap(), "expired ticket");
    }
}

#[tokio::test]
async fn wrong_ticket_kind_is_refused() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let ticket = mint_ticket(&backend, TicketKind::Download, share_ext(3)).await;

    let mut client = start_ticket_engine(backend, test_config(dir.path()), 6);
    client.writer.send(&phase_1_cmd(&ticket, "a.txt")).await.unwrap();

    let res = recv_msg(&mut client).await;
    assert_eq!(res.msg_type, types::RES_FAIL);
    assert_eq!(res.get_str(1).unwrap(), "invalid ticket type");
}

#[tokio::test]
async fn upload_commits_content_and_posts_the_event() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let ticket = mint_ticket(&backend, TicketKind::Upload, share_ext(3)).await;

    let mut client = start_ticket_engine(backend.clone(), test_config(dir.path()), 6);
    client.writer.send(&phase_1_cmd(&ticket, "hello.txt")).await.unwrap();

    let res = recv_msg(&mut client).await;
    assert_eq!(res.msg_type, types::RES_FILES_PHASE_1);
    let commit_id = res.get_u64(0).unwrap();

    let digest: [u8; 16] = Md5::digest(b"hello world").into();
    let msg = phase_2_msg(2, &[Sub::Chunk(b"hello "), Sub::Chunk(b"world"), Sub::Commit(&digest)]);
    client.writer.send(&msg).await.unwrap();

    // One acknowledgement per phase-2 message, then the final one.
    let res = recv_msg(&mut client).await;
    assert_eq!(res.msg_type, types::RES_OK);
    let res = recv_msg(&mut client).await;
    assert_eq!(res.msg_type, types::RES_OK);

    // Content on disk under <root>/<workspace>/<storage path>.
    let stored = dir.path().join("42").join("3").join(format!("1_{commit_id}"));
    let content = tokio::fs::read(&stored).await.unwrap();
    assert_eq!(content, b"hello world");

    // The commit group was recorded and the event emitted.
    let state = backend.state();
    let ws = state.workspaces.get(&42).unwrap();
    assert_eq!(ws.file_size, 11);
    let evt = ws.events.iter().find(|e| e.msg_type == types::EVT_FILES_PHASE_2).unwrap();
    let mut buf = &evt.payload[..];
    assert_eq!(conclave_proto::atom::read_u64(&mut buf).unwrap(), 42);
}

#[tokio::test]
async fn upload_digest_mismatch_discards_the_file() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let ticket = mint_ticket(&backend, TicketKind::Upload, share_ext(3)).await;

    let mut client = start_ticket_engine(backend.clone(), test_config(dir.path()), 6);
    client.writer.send(&phase_1_cmd(&ticket, "bad.txt")).await.unwrap();

    let res = recv_msg(&mut client).await;
    let commit_id = res.get_u64(0).unwrap();

    let zeros = [0u8; 16];
    let msg = phase_2_msg(2, &[Sub::Chunk(b"hello"), Sub::Commit(&zeros)]);
    client.writer.send(&msg).await.unwrap();

    let res = recv_msg(&mut client).await;
    assert_eq!(res.msg_type, types::RES_FAIL);
    assert_eq!(res.get_u32(0).unwrap(), types::FAIL_GENERIC);
    assert_eq!(res.get_str(1).unwrap(), "the computed file hash does not match");

    // The session closes and the storage path is gone.
    client.engine.await.unwrap().unwrap();
    let stored = dir.path().join("42").join("3").join(format!("1_{commit_id}"));
    assert!(!stored.exists(), "mismatched file must not survive");

    // Nothing was committed.
    let state = backend.state();
    let evt = state
        .workspaces
        .get(&42)
        .unwrap()
        .events
        .iter()
        .find(|e| e.msg_type == types::EVT_FILES_PHASE_2)
        .unwrap();
    let mut buf = &evt.payload[..];
    for _ in 0..4 {
        let _ = conclave_proto::Atom::decode(&mut buf).unwrap();
    }
    let _commit = conclave_proto::atom::read_u64(&mut buf).unwrap();
    let nb_commit = conclave_proto::atom::read_u32(&mut buf).unwrap();
    assert_eq!(nb_commit, 0);
}

#[tokio::test]
async fn upload_chunk_over_workspace_quota_is_rejected() {
    let backend = seeded_backend();
    backend.state().workspaces.get_mut(&42).unwrap().file_quota = 8;

    let dir = TempDir::new().unwrap();
    let ticket = mint_ticket(&backend, TicketKind::Upload, share_ext(3)).await;

    let mut client = start_ticket_engine(backend, test_config(dir.path()), 6);
    client.writer.send(&phase_1_cmd(&ticket, "big.bin")).await.unwrap();
    let res = recv_msg(&mut client).await;
    let commit_id = res.get_u64(0).unwrap();

    let msg = phase_2_msg(2, &[Sub::Chunk(&[0u8; 64])]);
    client.writer.send(&msg).await.unwrap();

    let res = recv_msg(&mut client).await;
    assert_eq!(res.msg_type, types::RES_FAIL);
    assert_eq!(res.get_u32(0).unwrap(), types::FAIL_FILE_QUOTA);

    client.engine.await.unwrap().unwrap();
    let stored = dir.path().join("42").join("3").join(format!("1_{commit_id}"));
    assert!(!stored.exists(), "over-quota file must not survive");
}

#[tokio::test]
async fn abort_skips_the_file_without_committing() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let ticket = mint_ticket(&backend, TicketKind::Upload, share_ext(3)).await;

    let mut client = start_ticket_engine(backend.clone(), test_config(dir.path()), 6);
    client.writer.send(&phase_1_cmd(&ticket, "gone.txt")).await.unwrap();
    let _res = recv_msg(&mut client).await;

    let msg = phase_2_msg(2, &[Sub::Chunk(b"partial"), Sub::Abort]);
    client.writer.send(&msg).await.unwrap();

    let res = recv_msg(&mut client).await;
    assert_eq!(res.msg_type, types::RES_OK);
    let res = recv_msg(&mut client).await;
    assert_eq!(res.msg_type, types::RES_OK, "final acknowledgement");

    assert_eq!(backend.state().workspaces.get(&42).unwrap().file_size, 0);
}

#[tokio::test]
async fn download_streams_from_offset() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();

    // Seed a stored file: 200 KiB of patterned bytes at inode 9.
    let content: Vec<u8> = (0..200 * 1024u32).map(|i| (i % 251) as u8).collect();
    {
        let mut state = backend.state();
        let ws = state.workspaces.get_mut(&42).unwrap();
        let mut share = MemShare { next_inode: 9, ..MemShare::default() };
        share
            .files
            .insert(9, MemFile { path: "3/9_1".to_owned(), commit_id: 1 });
        ws.shares.insert(3, share);
    }
    tokio::fs::create_dir_all(dir.path().join("42").join("3")).await.unwrap();
    tokio::fs::write(dir.path().join("42").join("3").join("9_1"), &content).await.unwrap();

    let ticket = mint_ticket(&backend, TicketKind::Download, share_ext(3)).await;
    let mut client = start_ticket_engine(backend, test_config(dir.path()), 6);

    let offset = 1000u64;
    let mut cmd = Message::new(types::CMD_FILES_DOWNLOAD_DATA);
    cmd.minor = 6;
    cmd.id = 1;
    cmd.put_bin(&ticket);
    cmd.put_u32(1); // one file
    cmd.put_u64(9); // inode
    cmd.put_u64(offset);
    cmd.put_u64(1); // commit id
    client.writer.send(&cmd).await.unwrap();

    // Collect the stream until the connection closes.
    let mut total_size = None;
    let mut remaining_size = None;
    let mut received = Vec::new();

    loop {
        let msg = match tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.reader.recv(),
        )
        .await
        {
            Ok(Ok(msg)) => msg,
            Ok(Err(_)) => break,
            Err(_) => panic!("download stalled"),
        };

        assert_eq!(msg.msg_type, types::RES_FILES_DOWNLOAD_DATA);
        let mut msg = msg;
        let nb_sub = msg.read_u32().unwrap();
        for _ in 0..nb_sub {
            let _nb_elements = msg.read_u32().unwrap();
            match msg.read_u32().unwrap() {
                types::FILES_SUB_FILE => {
                    total_size = Some(msg.read_u64().unwrap());
                    remaining_size = Some(msg.read_u64().unwrap());
                },
                types::FILES_SUB_CHUNK => {
                    received.extend_from_slice(&msg.read_bin().unwrap());
                },
                other => panic!("unexpected submessage {other}"),
            }
        }
    }

    assert_eq!(total_size, Some(content.len() as u64));
    assert_eq!(remaining_size, Some(content.len() as u64 - offset));
    assert_eq!(received.len(), content.len() - offset as usize);
    assert_eq!(received, content[offset as usize..]);
}

#[tokio::test]
async fn closed_screen_session_is_reported() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();

    // Screen sharing is metered against the license holder (user 1).
    backend
        .state()
        .workspaces
        .get_mut(&42)
        .unwrap()
        .users
        .push(conclave_server::backend::MemUser {
            user_id: 1,
            name: "Holder".to_owned(),
            email: "holder@example.com".to_owned(),
            email_id: "em42_1".to_owned(),
            pwd: String::new(),
            flags: 0,
        });

    let mut ext = bytes::BytesMut::new();
    conclave_proto::atom::write_u64(&mut ext, 1234); // unknown session id
    let ticket = mint_ticket(&backend, TicketKind::ScreenGuest, ext.freeze()).await;

    let mut client = start_ticket_engine(backend, test_config(dir.path()), 6);
    let mut cmd = Message::new(types::CMD_SCREEN_CONNECT_SESSION);
    cmd.minor = 6;
    cmd.id = 1;
    cmd.put_bin(&ticket);
    client.writer.send(&cmd).await.unwrap();

    let res = recv_msg(&mut client).await;
    assert_eq!(res.msg_type, types::RES_FAIL);
    assert_eq!(res.get_str(1).unwrap(), "the sharing session has been closed");
}
