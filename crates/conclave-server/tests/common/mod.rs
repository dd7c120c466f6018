//! Shared test harness: engines over in-process duplex pipes against the
//! in-memory backend.

// Each integration test binary uses its own subset of this module.
#![allow(dead_code)]

use conclave_proto::{Message, types};
use conclave_server::{
    ServerConfig,
    backend::{MemUser, MemWorkspace, MemoryBackend},
    session,
    transport::{MessageReader, MessageWriter},
};
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf, split},
    sync::watch,
    task::JoinHandle,
};

/// Client side of an engine under test.
pub struct Client {
    pub reader: MessageReader<ReadHalf<DuplexStream>>,
    pub writer: MessageWriter<WriteHalf<DuplexStream>>,
    pub quit: watch::Sender<bool>,
    pub engine: JoinHandle<Result<(), conclave_server::ServerError>>,
}

/// Test configuration rooted in a temp directory.
pub fn test_config(store_root: &std::path::Path) -> ServerConfig {
    ServerConfig {
        store_root: store_root.to_path_buf(),
        web_host: "web.test".to_owned(),
        ticket_ttl_secs: 300,
        ..ServerConfig::default()
    }
}

/// Spawn a principal-session engine over a duplex pipe.
pub fn start_session_engine(backend: MemoryBackend, config: ServerConfig, minor: u32) -> Client {
    let (client, server) = tokio::io::duplex(4 * 1024 * 1024);
    let (client_r, client_w) = split(client);
    let (server_r, server_w) = split(server);
    let (quit_tx, quit_rx) = watch::channel(false);

    let engine = tokio::spawn(session::run(
        MessageReader::new(server_r),
        MessageWriter::new(server_w),
        backend,
        config,
        minor,
        "test-peer".to_owned(),
        quit_rx,
    ));

    Client {
        reader: MessageReader::new(client_r),
        writer: MessageWriter::new(client_w),
        quit: quit_tx,
        engine,
    }
}

/// Spawn a ticket-mode engine over a duplex pipe.
pub fn start_ticket_engine(backend: MemoryBackend, config: ServerConfig, minor: u32) -> Client {
    let (client, server) = tokio::io::duplex(4 * 1024 * 1024);
    let (client_r, client_w) = split(client);
    let (server_r, server_w) = split(server);
    let (quit_tx, quit_rx) = watch::channel(false);

    let engine = tokio::spawn(async move {
        conclave_server::ticket_mode::run(
            MessageReader::new(server_r),
            MessageWriter::new(server_w),
            &backend,
            config,
            minor,
            "test-peer",
            quit_rx,
        )
        .await
    });

    Client {
        reader: MessageReader::new(client_r),
        writer: MessageWriter::new(client_w),
        quit: quit_tx,
        engine,
    }
}

/// A backend seeded with one workspace (id 42) and one member (user 7,
/// email id `em42_7`, password `pw`).
pub fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.add_workspace(
        42,
        MemWorkspace {
            name: "test workspace".to_owned(),
            users: vec![MemUser {
                user_id: 7,
                name: "User Seven".to_owned(),
                email: "u7@example.com".to_owned(),
                email_id: "em42_7".to_owned(),
                pwd: "pw".to_owned(),
                flags: conclave_proto::types::USER_FLAG_REGISTER,
            }],
            ..MemWorkspace::default()
        },
    );
    backend
}

/// Build a v3+ CONNECT command for workspace 42, user 7.
pub fn connect_cmd(id: u64, last_event_id: u64) -> Message {
    let mut cmd = Message::new(types::CMD_KWS_CONNECT);
    cmd.minor = 6;
    cmd.id = id;
    cmd.put_u64(42); // workspace id
    cmd.put_u32(0); // delete-on-login
    cmd.put_u64(last_event_id);
    cmd.put_u64(0); // last event date
    cmd.put_u32(0); // claimed user id
    cmd.put_str("User Seven");
    cmd.put_str("u7@example.com");
    cmd.put_str("em42_7");
    cmd.put_bin(b""); // ticket
    cmd.put_str("pw");
    cmd
}

/// Receive with a deadline so a broken engine fails the test instead of
/// hanging it.
pub async fn recv_msg(client: &mut Client) -> Message {
    tokio::time::timeout(std::time::Duration::from_secs(5), client.reader.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("engine closed the connection")
}
