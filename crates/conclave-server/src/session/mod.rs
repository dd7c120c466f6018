//! Per-connection session engine for the principal subprotocol.
//!
//! Three cooperating actors service one authenticated connection:
//!
//! - the **broker** owns the wire and pipelines messages between the
//!   transport and the in-memory queues;
//! - the **commander** owns a backend connection and executes commands
//!   from the incoming queue through the dispatch table;
//! - the **eventer** owns a second backend connection in
//!   notification-subscriber mode and feeds workspace events into the
//!   outgoing queue.
//!
//! They communicate through byte-accounted queues, unbounded note
//! channels, and one shutdown channel carrying the first fatal cause.

mod broker;
mod commander;
mod eventer;
pub mod handlers;
mod queues;

use std::sync::Arc;

use conclave_proto::{Message, types};
pub use queues::MessageQueue;
use tokio::sync::{mpsc, watch};

use crate::{backend::Backend, config::ServerConfig, error::ServerError};

/// Why a session is shutting down. The first cause wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The daemon is exiting (SIGTERM).
    Quit,
    /// The wire connection was lost.
    NoClient(String),
    /// The backend failed; the terminal failure event is already queued.
    NoBackend(String),
}

/// Note posted to the commander.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommanderNote {
    /// Re-run the permission procedure for a workspace.
    CheckWorkspace {
        /// Workspace to recheck
        kws_id: u64,
    },
}

/// Note posted to the eventer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventerNote {
    /// Start listening on a newly joined workspace.
    Listen {
        /// Workspace to subscribe
        kws_id: u64,
        /// User id within the workspace
        user_id: u32,
        /// Last event id the client already holds
        last_event_id: u64,
    },
    /// Stop listening on a departed workspace.
    Unlisten {
        /// Workspace to unsubscribe
        kws_id: u64,
    },
}

/// State shared by the three actors of one session.
pub struct SessionShared {
    /// Commands received from the client, pending execution
    pub incoming: MessageQueue,
    /// Messages pending transmission to the client
    pub outgoing: MessageQueue,
    /// Shutdown cause, set once
    shutdown: watch::Sender<Option<ShutdownCause>>,
    /// Note channel to the commander
    pub to_commander: mpsc::UnboundedSender<CommanderNote>,
    /// Note channel to the eventer
    pub to_eventer: mpsc::UnboundedSender<EventerNote>,
    /// Effective minor version of the session
    pub minor: u32,
    /// Peer address, for logging
    pub peer: String,
    /// Server configuration
    pub config: ServerConfig,
}

impl SessionShared {
    /// Subscribe to the shutdown channel.
    pub fn shutdown_watch(&self) -> watch::Receiver<Option<ShutdownCause>> {
        self.shutdown.subscribe()
    }

    /// Current shutdown cause, if any.
    pub fn shutdown_cause(&self) -> Option<ShutdownCause> {
        self.shutdown.borrow().clone()
    }

    /// True once any shutdown cause is set.
    pub fn is_down(&self) -> bool {
        self.shutdown.borrow().is_some()
    }

    fn set_cause(&self, cause: ShutdownCause) {
        self.shutdown.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        });
        // Queue waiters must re-check the shutdown state.
        self.incoming.close();
        self.outgoing.close();
    }

    /// Record the loss of the client connection.
    pub fn set_no_client(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(peer = %self.peer, "lost client connection: {text}");
        self.set_cause(ShutdownCause::NoClient(text));
    }

    /// Record a backend failure. Queues the terminal failure event so the
    /// broker can flush it to the client before closing.
    pub fn set_no_backend(&self, text: impl Into<String>) {
        let text = text.into();
        if self.is_down() {
            return;
        }
        tracing::warn!(peer = %self.peer, "backend error: {text}");

        let mut evt = Message::new(types::RES_FAIL);
        evt.minor = self.minor;
        evt.id = 0;
        evt.put_u32(types::FAIL_BACKEND).put_str(&text);
        self.outgoing.push(evt);

        self.set_cause(ShutdownCause::NoBackend(text));
    }

    /// Record daemon shutdown.
    pub fn set_quit(&self) {
        self.set_cause(ShutdownCause::Quit);
    }
}

/// Run the session engine over an established, role-negotiated stream.
///
/// Returns when all three actors have stopped. The stream halves are
/// dropped on return, closing the connection.
pub async fn run<R, W, B>(
    reader: crate::transport::MessageReader<R>,
    writer: crate::transport::MessageWriter<W>,
    backend: B,
    config: ServerConfig,
    minor: u32,
    peer: String,
    mut quit: watch::Receiver<bool>,
) -> Result<(), ServerError>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    B: Backend,
{
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = watch::channel(None);

    let shared = Arc::new(SessionShared {
        incoming: MessageQueue::new(config.quench_bytes),
        outgoing: MessageQueue::new(config.quench_bytes),
        shutdown: shutdown_tx,
        to_commander: cmd_tx,
        to_eventer: evt_tx,
        minor,
        peer,
        config,
    });

    let broker = tokio::spawn(broker::run(reader, writer, Arc::clone(&shared)));
    let commander = tokio::spawn(commander::run(backend.clone(), Arc::clone(&shared), cmd_rx));
    let eventer = tokio::spawn(eventer::run(backend, Arc::clone(&shared), evt_rx));

    // Propagate daemon shutdown into the session.
    let quit_shared = Arc::clone(&shared);
    let quit_task = tokio::spawn(async move {
        while quit.changed().await.is_ok() {
            if *quit.borrow() {
                quit_shared.set_quit();
                break;
            }
        }
    });

    let (b, c, e) = tokio::join!(broker, commander, eventer);
    quit_task.abort();

    for joined in [b, c, e] {
        if let Err(e) = joined {
            tracing::error!(error = %e, "session actor panicked");
        }
    }

    tracing::info!(cause = ?shared.shutdown_cause(), "session ended");
    Ok(())
}
