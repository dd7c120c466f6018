//! Connection dispatch.
//!
//! A fresh TLS session identifies its subprotocol with its first four
//! bytes: `VNC!` enters the screen-share relay, `00 00 00 04` proxies to
//! the local peer service, `00 00 00 00` is the principal subprotocol
//! (the bytes are handed back to the transport as the start of the first
//! header), anything else proxies to the local web front-end.
//!
//! The principal subprotocol then negotiates a role: the first message
//! must be SELECT-ROLE carrying the client's version; clients below the
//! compatibility floor are refused with a must-upgrade failure.

use conclave_proto::{Message, types, types::Role};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    backend::Backend,
    config::ServerConfig,
    error::ServerError,
    proxy, session, ticket_mode,
    transport::{MessageReader, MessageWriter, tls_acceptor},
};

/// Identifier of the screen-share relay entry.
const ID_SCREEN_RELAY: [u8; 4] = *b"VNC!";
/// Identifier of the peer-service proxy.
const ID_PEER_PROXY: [u8; 4] = [0, 0, 0, 4];
/// Identifier of the principal subprotocol.
const ID_PRINCIPAL: [u8; 4] = [0, 0, 0, 0];

/// Length of the relay identifier read after `VNC!`.
const RELAY_ID_LEN: usize = 32;
/// Offset of the port digits inside a relay credential name.
const RELAY_PORT_OFFSET: usize = 27;
/// Relay probe identifier.
const RELAY_PROBE: &[u8; RELAY_ID_LEN] = b"VNC__META__PROXY__LOCAL__TESTING";
/// Reply to the relay probe.
const RELAY_PROBE_REPLY: &[u8] = b"VNC__META__PROXY__LOCAL__TESTING__OK\n";

/// The accepting daemon.
pub struct Server<B: Backend> {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    backend: B,
    config: ServerConfig,
}

impl<B: Backend> Server<B> {
    /// Bind the listener and build the TLS acceptor.
    pub async fn bind(config: ServerConfig, backend: B) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
            ServerError::Config(format!("cannot bind '{}': {e}", config.bind_address))
        })?;
        let acceptor = tls_acceptor(&config)?;
        Ok(Self { listener, acceptor, backend, config })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and dispatch connections until SIGTERM.
    pub async fn run(self) -> Result<(), ServerError> {
        let (quit_tx, quit_rx) = watch::channel(false);

        tokio::spawn(async move {
            if wait_for_terminate().await {
                tracing::info!("shutdown signal received");
                let _ = quit_tx.send(true);
            }
        });

        tracing::info!("listening on {}", self.listener.local_addr()?);

        let mut quit = quit_rx.clone();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                            continue;
                        },
                    };

                    let acceptor = self.acceptor.clone();
                    let backend = self.backend.clone();
                    let config = self.config.clone();
                    let quit = quit_rx.clone();

                    tokio::spawn(async move {
                        let peer = peer.to_string();
                        if let Err(e) =
                            handle_connection(stream, acceptor, backend, config, &peer, quit).await
                        {
                            tracing::info!(peer, "connection ended: {e}");
                        }
                    });
                },
                _ = quit.changed() => {
                    if *quit.borrow() {
                        tracing::info!("stopping accept loop");
                        return Ok(());
                    }
                },
            }
        }
    }
}

async fn wait_for_terminate() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            return false;
        };
        tokio::select! {
            _ = term.recv() => true,
            r = tokio::signal::ctrl_c() => r.is_ok(),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.is_ok()
    }
}

/// Serve one accepted connection: TLS handshake, identification bytes,
/// subprotocol dispatch.
async fn handle_connection<B: Backend>(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    backend: B,
    config: ServerConfig,
    peer: &str,
    quit: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    proxy::configure_accepted(&stream)?;

    let mut tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| ServerError::Transport(format!("TLS handshake failed: {e}")))?;

    let mut id_buf = [0u8; 4];
    tls.read_exact(&mut id_buf).await?;

    match id_buf {
        ID_SCREEN_RELAY => {
            tracing::debug!(peer, "dispatch: screen relay");
            screen_relay_entry(tls, &config).await
        },
        ID_PEER_PROXY => {
            tracing::debug!(peer, "dispatch: peer proxy");
            let mut service = proxy::connect_local(config.peer_port).await?;
            tokio::io::AsyncWriteExt::write_all(&mut service, &id_buf).await?;
            proxy::relay(tls, service, "peer service").await
        },
        ID_PRINCIPAL => {
            tracing::debug!(peer, "dispatch: principal subprotocol");
            principal_entry(tls, id_buf, backend, config, peer, quit).await
        },
        _ => {
            tracing::debug!(peer, "dispatch: web proxy");
            let mut service = proxy::connect_local(config.web_port).await?;
            tokio::io::AsyncWriteExt::write_all(&mut service, &id_buf).await?;
            proxy::relay(tls, service, "web server").await
        },
    }
}

/// Screen-share relay entry: a 32-byte identifier is either the probe or
/// a relay credential whose trailing digits name a local port.
async fn screen_relay_entry<S>(mut stream: S, config: &ServerConfig) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut id = [0u8; RELAY_ID_LEN];
    stream.read_exact(&mut id).await?;

    if &id == RELAY_PROBE {
        tokio::io::AsyncWriteExt::write_all(&mut stream, RELAY_PROBE_REPLY).await?;
        return Ok(());
    }

    let name = std::str::from_utf8(&id)
        .map_err(|_| ServerError::Transport("invalid relay identifier".to_owned()))?;

    // The identifier names a credential file; refuse path tricks.
    if name.contains('/') || name.contains("..") {
        return Err(ServerError::Transport("invalid relay identifier".to_owned()));
    }

    let cred_path = config.relay_cred_dir.join(name);
    if !tokio::fs::try_exists(&cred_path).await.unwrap_or(false) {
        return Err(ServerError::Transport(format!(
            "relay credential {name} does not exist"
        )));
    }

    let port: u16 = name[RELAY_PORT_OFFSET..]
        .trim_end()
        .parse()
        .map_err(|_| ServerError::Transport("invalid relay port".to_owned()))?;

    let service = proxy::connect_local(port).await?;
    proxy::relay(stream, service, "screen relay").await
}

/// Principal subprotocol entry: hand the identification bytes back to
/// the transport, negotiate the role, and run the matching engine.
async fn principal_entry<S, B>(
    stream: S,
    id_buf: [u8; 4],
    backend: B,
    config: ServerConfig,
    peer: &str,
    quit: watch::Receiver<bool>,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Backend,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = MessageReader::new(read_half);
    let mut writer = MessageWriter::new(write_half);
    reader.inject_preread(id_buf);

    let Some((role, minor)) = negotiate_role(&mut reader, &mut writer).await? else {
        return Ok(());
    };

    tracing::info!(peer, ?role, minor, "role negotiated");

    match role {
        Role::Workspace => {
            session::run(reader, writer, backend, config, minor, peer.to_owned(), quit).await
        },
        Role::FileTransfer | Role::ScreenShare => {
            ticket_mode::run(reader, writer, &backend, config, minor, peer, quit).await
        },
    }
}

/// Negotiate the session role. `None` when the client was refused (the
/// failure reply has been flushed).
async fn negotiate_role<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
) -> Result<Option<(Role, u32)>, ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut cmd = reader.recv().await?;

    let mut res = Message::new(types::RES_OK);
    res.id = cmd.id;

    let mut outcome = None;

    if cmd.msg_type != types::CMD_MGT_SELECT_ROLE {
        tracing::info!("expected select-role message, got type {}", cmd.msg_type);
        res.msg_type = types::RES_FAIL;
        res.put_u32(types::FAIL_GENERIC).put_str("expected role selection");
    } else {
        let effective_minor = cmd.minor.min(types::MINOR_VERSION);
        if effective_minor < types::LAST_COMPAT_MINOR {
            tracing::info!(
                announced = cmd.minor,
                "refusing access to obsolete client"
            );
            res.msg_type = types::RES_FAIL;
            res.put_u32(types::FAIL_MUST_UPGRADE)
                .put_str("sorry, your client is too old and must be upgraded");
        } else {
            match cmd.read_u32().ok().and_then(Role::from_u32) {
                Some(role) => outcome = Some((role, effective_minor)),
                None => {
                    tracing::info!("invalid role selector");
                    res.msg_type = types::RES_FAIL;
                    res.put_u32(types::FAIL_GENERIC).put_str("invalid role");
                },
            }
        }
    }

    // The reply always carries the daemon's own version numbers.
    writer.send(&res).await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    #[tokio::test]
    async fn relay_probe_gets_the_literal_reply() {
        let (mut client, server) = tokio::io::duplex(4096);
        let config = ServerConfig::default();

        let task = tokio::spawn(async move { screen_relay_entry(server, &config).await });

        client.write_all(RELAY_PROBE).await.unwrap();

        let mut reply = vec![0u8; RELAY_PROBE_REPLY.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, RELAY_PROBE_REPLY);

        task.await.unwrap().unwrap();
        // The daemon closed its side after the reply.
        assert_eq!(client.read(&mut [0u8; 1]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn relay_identifier_with_path_tricks_is_refused() {
        let (mut client, server) = tokio::io::duplex(4096);
        let config = ServerConfig::default();

        let task = tokio::spawn(async move { screen_relay_entry(server, &config).await });

        client.write_all(b"../../../../etc/shadow____12345_").await.unwrap();
        assert!(task.await.unwrap().is_err());
    }

    fn select_role(minor: u32, role: u32) -> Message {
        let mut cmd = Message::new(types::CMD_MGT_SELECT_ROLE);
        cmd.minor = minor;
        cmd.id = 1;
        cmd.put_u32(role);
        cmd
    }

    async fn run_negotiation(cmd: Message) -> (Option<(Role, u32)>, Message) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let mut client_reader = MessageReader::new(client_r);
        let mut client_writer = MessageWriter::new(client_w);
        let mut server_reader = MessageReader::new(server_r);
        let mut server_writer = MessageWriter::new(server_w);

        client_writer.send(&cmd).await.unwrap();
        let outcome = negotiate_role(&mut server_reader, &mut server_writer)
            .await
            .unwrap();
        let reply = client_reader.recv().await.unwrap();
        (outcome, reply)
    }

    #[tokio::test]
    async fn workspace_role_accepted() {
        let (outcome, reply) = run_negotiation(select_role(6, 1)).await;
        assert_eq!(outcome, Some((Role::Workspace, 6)));
        assert_eq!(reply.msg_type, types::RES_OK);
        assert_eq!(reply.id, 1);
        assert_eq!(reply.minor, types::MINOR_VERSION);
    }

    #[tokio::test]
    async fn newer_client_capped_to_daemon_minor() {
        let (outcome, _) = run_negotiation(select_role(9, 2)).await;
        assert_eq!(outcome, Some((Role::FileTransfer, types::MINOR_VERSION)));
    }

    #[tokio::test]
    async fn obsolete_client_must_upgrade() {
        let (outcome, reply) = run_negotiation(select_role(0, 1)).await;
        assert_eq!(outcome, None);
        assert_eq!(reply.msg_type, types::RES_FAIL);
        assert_eq!(reply.get_u32(0).unwrap(), types::FAIL_MUST_UPGRADE);
    }

    #[tokio::test]
    async fn invalid_role_refused() {
        let (outcome, reply) = run_negotiation(select_role(6, 9)).await;
        assert_eq!(outcome, None);
        assert_eq!(reply.msg_type, types::RES_FAIL);
        assert_eq!(reply.get_u32(0).unwrap(), types::FAIL_GENERIC);
    }

    #[tokio::test]
    async fn non_role_first_message_refused() {
        let mut cmd = Message::new(types::CMD_KWS_CONNECT);
        cmd.minor = 6;
        let (outcome, reply) = run_negotiation(cmd).await;
        assert_eq!(outcome, None);
        assert_eq!(reply.get_u32(0).unwrap(), types::FAIL_GENERIC);
    }
}
