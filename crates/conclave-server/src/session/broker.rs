//! Broker actor: sole owner of the wire.
//!
//! The receive side feeds the transport into the incoming queue,
//! suspending while that queue is quenched. The send side drains the
//! outgoing queue in FIFO order, coalescing ready messages into packets
//! of at most the configured size. On a fatal wire error the broker
//! records the client loss; on backend shutdown it flushes what is
//! already queued (including the terminal failure event) and closes.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use super::SessionShared;
use crate::transport::{MessageReader, MessageWriter};

/// Run both halves of the broker until the session ends.
pub async fn run<R, W>(
    reader: MessageReader<R>,
    writer: MessageWriter<W>,
    shared: Arc<SessionShared>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let recv = tokio::spawn(recv_loop(reader, Arc::clone(&shared)));
    let send = tokio::spawn(send_loop(writer, shared));
    let _ = tokio::join!(recv, send);
}

async fn recv_loop<R>(mut reader: MessageReader<R>, shared: Arc<SessionShared>)
where
    R: AsyncRead + Unpin,
{
    let mut shutdown = shared.shutdown_watch();

    loop {
        if shared.is_down() {
            return;
        }

        // Suspend receive while the incoming queue is quenched.
        tokio::select! {
            () = shared.incoming.unquenched() => {},
            _ = shutdown.changed() => continue,
        }

        let received = tokio::select! {
            msg = reader.recv() => msg,
            _ = shutdown.changed() => continue,
        };

        match received {
            Ok(msg) => {
                tracing::trace!(msg_type = msg.msg_type, id = msg.id, "received command");
                shared.incoming.push(msg);
            },
            Err(e) => {
                shared.set_no_client(e.to_string());
                return;
            },
        }
    }
}

async fn send_loop<W>(mut writer: MessageWriter<W>, shared: Arc<SessionShared>)
where
    W: AsyncWrite + Unpin,
{
    let max_packet = shared.config.max_packet_bytes;

    // pop_batch returns None only once the queue is closed and drained,
    // which is exactly the flush-then-close behavior wanted on shutdown.
    while let Some(batch) = shared.outgoing.pop_batch(max_packet).await {
        if let Err(e) = writer.send_many(&batch).await {
            shared.set_no_client(e.to_string());
            return;
        }
    }
}
