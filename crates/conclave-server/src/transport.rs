//! Message transport over a TLS byte stream.
//!
//! Frames whole messages in and out of any async byte stream: read a
//! 24-byte header, validate it, read exactly the declared payload, decode
//! the atoms. The writer can coalesce several ready messages into a single
//! outbound packet. The reader accepts four pre-read bytes so the dispatch
//! mux can peek the subprotocol identifier and hand the bytes back.
//!
//! TLS setup follows the certificate-or-self-signed pattern: PEM files when
//! configured, an rcgen certificate for development otherwise.

use std::sync::Arc;

use bytes::BytesMut;
use conclave_proto::{Message, MessageHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use crate::{config::ServerConfig, error::ServerError};

/// Outbound buffer capacity kept after a large send, bounding peak memory.
const SEND_BUF_BASELINE: usize = 64 * 1024;

/// Receive progress, kept across calls so a cancelled `recv` resumes
/// where it stopped.
#[derive(Debug, Clone, Copy)]
enum RecvState {
    /// No message in flight.
    Idle,
    /// Reading the 24-byte header.
    Header {
        /// Header bytes received so far
        filled: usize,
    },
    /// Reading the payload.
    Payload {
        /// The decoded header
        header: MessageHeader,
        /// Payload bytes received so far
        filled: usize,
    },
}

/// Reads whole messages from a byte stream.
///
/// `recv` is cancellation-safe: every await point is a single `read`, and
/// partial progress stays in the reader, so dropping a `recv` future (in
/// a `select!`) never loses or tears a message.
pub struct MessageReader<R> {
    inner: R,
    preread: Vec<u8>,
    state: RecvState,
    header_buf: [u8; MessageHeader::SIZE],
    payload_buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            preread: Vec::new(),
            state: RecvState::Idle,
            header_buf: [0u8; MessageHeader::SIZE],
            payload_buf: Vec::new(),
        }
    }

    /// Install four already-consumed bytes as the start of the next header.
    pub fn inject_preread(&mut self, bytes: [u8; 4]) {
        self.preread = bytes.to_vec();
    }

    /// Unwrap the underlying stream. Meaningful only between messages.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read raw bytes, bypassing message framing. Used by the relay
    /// paths once a session stops speaking messages. Hands back any
    /// pre-read bytes first.
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.preread.is_empty() {
            let n = self.preread.len().min(buf.len());
            buf[..n].copy_from_slice(&self.preread[..n]);
            self.preread.drain(..n);
            return Ok(n);
        }
        self.inner.read(buf).await
    }

    /// Receive the next message.
    ///
    /// # Errors
    ///
    /// - [`ServerError::PeerClosed`] on EOF at a message boundary
    /// - [`ServerError::Io`] on mid-message EOF or socket errors
    /// - [`ServerError::Protocol`] on framing violations
    pub async fn recv(&mut self) -> Result<Message, ServerError> {
        loop {
            match self.state {
                RecvState::Idle => {
                    self.header_buf = [0u8; MessageHeader::SIZE];
                    let filled = self.preread.len().min(MessageHeader::SIZE);
                    self.header_buf[..filled].copy_from_slice(&self.preread[..filled]);
                    self.preread.drain(..filled);
                    self.state = RecvState::Header { filled };
                },

                RecvState::Header { filled } if filled == MessageHeader::SIZE => {
                    let header = MessageHeader::decode(&self.header_buf)?;
                    if header.payload_len == 0 {
                        self.state = RecvState::Idle;
                        return Ok(Message::parse(header, &[])?);
                    }
                    self.payload_buf = vec![0u8; header.payload_len as usize];
                    self.state = RecvState::Payload { header, filled: 0 };
                },

                RecvState::Header { filled } => {
                    let n = self.inner.read(&mut self.header_buf[filled..]).await?;
                    if n == 0 {
                        // EOF at a message boundary is a clean close.
                        return Err(if filled == 0 {
                            ServerError::PeerClosed
                        } else {
                            ServerError::Io(std::io::ErrorKind::UnexpectedEof.into())
                        });
                    }
                    self.state = RecvState::Header { filled: filled + n };
                },

                RecvState::Payload { header, filled } if filled == self.payload_buf.len() => {
                    let msg = Message::parse(header, &self.payload_buf)?;
                    self.payload_buf = Vec::new();
                    self.state = RecvState::Idle;
                    return Ok(msg);
                },

                RecvState::Payload { header, filled } => {
                    let n = self.inner.read(&mut self.payload_buf[filled..]).await?;
                    if n == 0 {
                        return Err(ServerError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                    }
                    self.state = RecvState::Payload { header, filled: filled + n };
                },
            }
        }
    }
}

/// Writes whole messages to a byte stream, coalescing when asked.
pub struct MessageWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wrap a stream.
    pub fn new(inner: W) -> Self {
        Self { inner, buf: BytesMut::with_capacity(SEND_BUF_BASELINE) }
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ServerError> {
        self.send_many(std::slice::from_ref(msg)).await
    }

    /// Serialize several messages into one outbound packet and send it.
    pub async fn send_many(&mut self, msgs: &[Message]) -> Result<(), ServerError> {
        self.buf.clear();
        for msg in msgs {
            msg.encode(&mut self.buf)?;
        }
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;

        if self.buf.capacity() > SEND_BUF_BASELINE {
            self.buf = BytesMut::with_capacity(SEND_BUF_BASELINE);
        }
        Ok(())
    }

    /// Write raw bytes (screen-relay probe reply, proxied id bytes).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Build a TLS acceptor from the configured certificate, or generate a
/// self-signed one for development.
pub fn tls_acceptor(config: &ServerConfig) -> Result<TlsAcceptor, ServerError> {
    let tls_config = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => load_tls_config(cert, key)?,
        _ => self_signed_config()?,
    };
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_tls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<rustls::ServerConfig, ServerError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ServerError::Config(format!("failed to read cert '{}': {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| {
        ServerError::Config(format!("failed to read key '{}': {e}", key_path.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_owned()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))
}

fn self_signed_config() -> Result<rustls::ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let cert_der = cert.cert.der().clone();
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key.into())
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tracing::warn!("using a self-signed certificate - not for production use");

    Ok(tls_config)
}

/// Encode a batch the way `send_many` does, for size accounting in tests.
#[must_use]
pub fn encoded_batch_len(msgs: &[Message]) -> usize {
    msgs.iter().map(Message::wire_len).sum()
}

#[cfg(test)]
mod tests {
    use conclave_proto::types;

    use super::*;

    #[tokio::test]
    async fn round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let mut writer = MessageWriter::new(client);
        let mut reader = MessageReader::new(server);

        let mut msg = Message::new(types::RES_OK);
        msg.id = 7;
        msg.put_u32(1).put_str("hi");

        writer.send(&msg).await.unwrap();
        let got = reader.recv().await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn preread_injection_restores_first_header() {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let mut writer = MessageWriter::new(client);
        let mut reader = MessageReader::new(server);

        let mut msg = Message::new(types::CMD_MGT_SELECT_ROLE);
        msg.put_u32(1);
        writer.send(&msg).await.unwrap();

        // The dispatcher peeks the first four bytes, then hands them back.
        let mut id_buf = [0u8; 4];
        reader.inner.read_exact(&mut id_buf).await.unwrap();
        assert_eq!(id_buf, [0, 0, 0, 0]);

        reader.inject_preread(id_buf);
        let got = reader.recv().await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn send_many_coalesces_in_order() {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let mut writer = MessageWriter::new(client);
        let mut reader = MessageReader::new(server);

        let msgs: Vec<Message> = (0..5u64)
            .map(|i| {
                let mut m = Message::new(types::RES_OK);
                m.id = i;
                m
            })
            .collect();

        writer.send_many(&msgs).await.unwrap();
        for i in 0..5u64 {
            assert_eq!(reader.recv().await.unwrap().id, i);
        }
    }

    #[tokio::test]
    async fn clean_close_reports_peer_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = MessageReader::new(server);
        assert!(matches!(reader.recv().await, Err(ServerError::PeerClosed)));
    }
}
