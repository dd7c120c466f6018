//! Raw TCP proxying for the non-principal dispatch paths.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::error::ServerError;

/// Keepalive parameters for accepted sockets. The idle time must stay
/// under five minutes: some middleboxes silently reset flows idle longer
/// than that.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(4 * 60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_PROBES: u32 = 9;

/// Configure TCP keepalive and nodelay on an accepted socket.
pub fn configure_accepted(stream: &TcpStream) -> Result<(), ServerError> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_PROBES);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Connect to a local service port.
pub async fn connect_local(port: u16) -> Result<TcpStream, ServerError> {
    Ok(TcpStream::connect(("127.0.0.1", port)).await?)
}

/// Shuttle bytes between a client stream and a proxied service until
/// either side closes.
pub async fn relay<S>(client: S, service: TcpStream, label: &str) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = client;
    let mut service = service;
    match tokio::io::copy_bidirectional(&mut client, &mut service).await {
        Ok((up, down)) => {
            tracing::debug!(proxy = label, up, down, "proxy loop finished");
            Ok(())
        },
        Err(e) => {
            tracing::debug!(proxy = label, error = %e, "proxy loop ended with error");
            Err(ServerError::Io(e))
        },
    }
}
