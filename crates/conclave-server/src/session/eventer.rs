//! Eventer actor: subscribes to workspace event channels.
//!
//! Maintains one handle per subscribed workspace with the listen/poll
//! flags, and an active set of workspaces needing work. Work is: start
//! listening (LISTEN on the event-log and permission-check channels),
//! stop listening, or poll the event log for rows past the last
//! delivered id. Polling pages at 100 events; a full page keeps the
//! workspace active. Event ids within one workspace reach the outgoing
//! queue strictly increasing.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use conclave_proto::{Message, MessageHeader};
use tokio::sync::mpsc;

use super::{EventerNote, SessionShared};
use crate::backend::{
    Backend, BackendConn, BackendError, ChannelKind, event_log_channel, parse_channel,
    perm_check_channel,
};

/// Events fetched per poll cycle.
const POLL_LIMIT: u32 = 100;

/// A subscribed workspace as the eventer sees it.
#[derive(Debug, Clone, Copy)]
struct EvtWorkspace {
    /// Last event id delivered to the outgoing queue
    last_event_id: u64,
    /// The session wants this subscription
    wanted: bool,
    /// LISTEN is active on the workspace channels
    listening: bool,
    /// The event log should be polled as soon as possible
    poll_events: bool,
}

/// Run the eventer until the session shuts down.
pub async fn run<B: Backend>(
    backend: B,
    shared: Arc<SessionShared>,
    mut notes: mpsc::UnboundedReceiver<EventerNote>,
) {
    let mut conn = match backend.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            shared.set_no_backend(e.to_string());
            return;
        },
    };

    if let Err(e) = main_loop(&mut conn, &shared, &mut notes).await {
        shared.set_no_backend(e.to_string());
    }
}

struct EventerState {
    workspaces: BTreeMap<u64, EvtWorkspace>,
    active: BTreeSet<u64>,
}

impl EventerState {
    fn handle_note(&mut self, note: EventerNote) {
        match note {
            EventerNote::Listen { kws_id, user_id: _, last_event_id } => {
                let ws = self.workspaces.entry(kws_id).or_insert(EvtWorkspace {
                    last_event_id,
                    wanted: false,
                    listening: false,
                    poll_events: true,
                });
                ws.wanted = true;
                self.active.insert(kws_id);
            },
            EventerNote::Unlisten { kws_id } => {
                if let Some(ws) = self.workspaces.get_mut(&kws_id) {
                    ws.wanted = false;
                    if ws.listening {
                        self.active.insert(kws_id);
                    } else {
                        self.workspaces.remove(&kws_id);
                        self.active.remove(&kws_id);
                    }
                }
            },
        }
    }
}

async fn main_loop<C: BackendConn>(
    conn: &mut C,
    shared: &Arc<SessionShared>,
    notes: &mut mpsc::UnboundedReceiver<EventerNote>,
) -> Result<(), BackendError> {
    let mut shutdown = shared.shutdown_watch();
    let mut state = EventerState { workspaces: BTreeMap::new(), active: BTreeSet::new() };

    loop {
        while let Ok(note) = notes.try_recv() {
            state.handle_note(note);
        }

        if shared.is_down() {
            return Ok(());
        }

        // Execute one unit of work, if any workspace is active.
        if let Some(&kws_id) = state.active.iter().next() {
            state.active.remove(&kws_id);
            find_work(conn, shared, &mut state, kws_id).await?;
        }

        // Drain pending notifications.
        while let Some(notification) = conn.try_notification() {
            handle_notification(shared, &mut state, &notification.channel);
        }

        // Sleep only when nothing is active.
        if state.active.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => {},
                note = notes.recv() => match note {
                    Some(note) => state.handle_note(note),
                    None => return Ok(()),
                },
                notification = conn.notified() => {
                    let notification = notification?;
                    handle_notification(shared, &mut state, &notification.channel);
                },
            }
        }
    }
}

fn handle_notification(shared: &Arc<SessionShared>, state: &mut EventerState, channel: &str) {
    let Some((kws_id, kind)) = parse_channel(channel) else {
        return;
    };
    if !state.workspaces.contains_key(&kws_id) {
        return;
    }

    match kind {
        ChannelKind::EventLog => {
            tracing::trace!(kws_id, "event-log notification");
            if let Some(ws) = state.workspaces.get_mut(&kws_id) {
                ws.poll_events = true;
            }
            state.active.insert(kws_id);
        },
        ChannelKind::PermCheck => {
            tracing::trace!(kws_id, "permission-check notification");
            let _ = shared
                .to_commander
                .send(super::CommanderNote::CheckWorkspace { kws_id });
        },
    }
}

async fn find_work<C: BackendConn>(
    conn: &mut C,
    shared: &Arc<SessionShared>,
    state: &mut EventerState,
    kws_id: u64,
) -> Result<(), BackendError> {
    let Some(ws) = state.workspaces.get(&kws_id).copied() else {
        return Ok(());
    };

    if !ws.listening && ws.wanted {
        listen_workspace(conn, shared, state, kws_id).await
    } else if ws.listening && !ws.wanted {
        unlisten_workspace(conn, state, kws_id).await
    } else if ws.poll_events {
        poll_workspace(conn, shared, state, kws_id).await
    } else {
        Ok(())
    }
}

async fn listen_workspace<C: BackendConn>(
    conn: &mut C,
    shared: &Arc<SessionShared>,
    state: &mut EventerState,
    kws_id: u64,
) -> Result<(), BackendError> {
    tracing::debug!(kws_id, "starting to listen to workspace");

    conn.listen(&event_log_channel(kws_id)).await?;
    conn.listen(&perm_check_channel(kws_id)).await?;

    if let Some(ws) = state.workspaces.get_mut(&kws_id) {
        ws.listening = true;
    }
    state.active.insert(kws_id);

    // Permission changes between login and LISTEN would be missed;
    // have the commander recheck now.
    let _ = shared.to_commander.send(super::CommanderNote::CheckWorkspace { kws_id });

    Ok(())
}

async fn unlisten_workspace<C: BackendConn>(
    conn: &mut C,
    state: &mut EventerState,
    kws_id: u64,
) -> Result<(), BackendError> {
    tracing::debug!(kws_id, "stopping to listen to workspace");

    conn.unlisten(&event_log_channel(kws_id)).await?;
    conn.unlisten(&perm_check_channel(kws_id)).await?;

    state.workspaces.remove(&kws_id);
    state.active.remove(&kws_id);

    Ok(())
}

async fn poll_workspace<C: BackendConn>(
    conn: &mut C,
    shared: &Arc<SessionShared>,
    state: &mut EventerState,
    kws_id: u64,
) -> Result<(), BackendError> {
    let Some(ws) = state.workspaces.get(&kws_id).copied() else {
        return Ok(());
    };

    let events = conn.poll_events(kws_id, ws.last_event_id, POLL_LIMIT).await?;
    let fetched = events.len();
    tracing::debug!(kws_id, fetched, "fetched events");

    let mut last = ws.last_event_id;
    for event in events {
        debug_assert!(event.id > last, "event log must be monotone");
        last = last.max(event.id);

        let header = MessageHeader {
            major: 0,
            minor: event.minor,
            msg_type: event.msg_type,
            id: event.id,
            payload_len: event.payload.len() as u32,
        };
        match Message::parse(header, &event.payload) {
            Ok(msg) => shared.outgoing.push(msg),
            Err(e) => {
                return Err(BackendError::Db(format!(
                    "undecodable event {} in workspace {kws_id}: {e}",
                    event.id
                )));
            },
        }
    }

    if let Some(ws) = state.workspaces.get_mut(&kws_id) {
        ws.last_event_id = last;
        ws.poll_events = fetched == POLL_LIMIT as usize;
        if ws.poll_events {
            state.active.insert(kws_id);
        }
    }

    Ok(())
}
