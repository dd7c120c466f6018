//! Integration tests for the three-actor session engine, driven over a
//! duplex pipe against the in-memory backend.

mod common;

use common::{connect_cmd, recv_msg, seeded_backend, start_session_engine, test_config};
use conclave_proto::{Message, Ticket, TicketKind, types};
use tempfile::TempDir;

#[tokio::test]
async fn login_then_events_arrive_in_order() {
    let backend = seeded_backend();

    // The backend already holds events 101 and 102; the client last saw
    // event 100.
    {
        let mut state = backend.state();
        let ws = state.workspaces.get_mut(&42).unwrap();
        ws.next_event_id = 101;
        state.post_event(42, 1, types::EVT_CHAT_MSG, chat_event_payload("one"));
        state.post_event(42, 1, types::EVT_CHAT_MSG, chat_event_payload("two"));
    }

    let dir = TempDir::new().unwrap();
    let mut client = start_session_engine(backend.clone(), test_config(dir.path()), 6);

    client.writer.send(&connect_cmd(5, 100)).await.unwrap();

    let res = recv_msg(&mut client).await;
    assert_eq!(res.id, 5);
    assert_eq!(res.msg_type, types::RES_KWS_CONNECT);
    assert_eq!(res.get_u32(0).unwrap(), types::LoginCode::Ok.to_u32());
    assert_eq!(res.get_u32(2).unwrap(), 7, "resolved user id");
    assert_eq!(res.get_u64(4).unwrap(), 102, "last event id on the daemon");
    assert_eq!(res.get_str(7).unwrap(), "web.test");

    // The subscription delivers the two stored events in order.
    let evt = recv_msg(&mut client).await;
    assert_eq!(evt.id, 101);
    let evt = recv_msg(&mut client).await;
    assert_eq!(evt.id, 102);

    // A new event arrives through the notification path.
    backend.state().post_event(42, 1, types::EVT_CHAT_MSG, chat_event_payload("three"));
    let evt = recv_msg(&mut client).await;
    assert_eq!(evt.id, 103);
    assert_eq!(evt.msg_type, types::EVT_CHAT_MSG);

    client.quit.send(true).unwrap();
    client.engine.await.unwrap().unwrap();
}

#[tokio::test]
async fn every_command_gets_exactly_one_result_with_its_id() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let mut client = start_session_engine(backend, test_config(dir.path()), 6);

    client.writer.send(&connect_cmd(1, 0)).await.unwrap();
    let res = recv_msg(&mut client).await;
    assert_eq!(res.id, 1);

    // A supported command.
    let mut chat = Message::new(types::CMD_CHAT_MSG);
    chat.minor = 6;
    chat.id = 2;
    chat.put_u64(42).put_u32(0).put_str("hello");
    client.writer.send(&chat).await.unwrap();

    // An unsupported command type still gets its one result.
    let mut bogus = Message::new(types::CMD_MGT_SELECT_ROLE);
    bogus.minor = 6;
    bogus.id = 3;
    client.writer.send(&bogus).await.unwrap();

    let mut seen = std::collections::BTreeMap::new();
    while seen.len() < 2 {
        let msg = recv_msg(&mut client).await;
        if types::role_of(msg.msg_type) == types::ROLE_RES {
            assert!(seen.insert(msg.id, msg.msg_type).is_none(), "duplicate result id");
        }
    }

    assert_eq!(seen.get(&2), Some(&types::RES_OK));
    assert_eq!(seen.get(&3), Some(&types::RES_FAIL));
}

#[tokio::test]
async fn unknown_workspace_is_permission_denied() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let mut client = start_session_engine(backend, test_config(dir.path()), 6);

    // Workspace-bound command without a login.
    let mut chat = Message::new(types::CMD_CHAT_MSG);
    chat.minor = 6;
    chat.id = 9;
    chat.put_u64(42).put_u32(0).put_str("hello");
    client.writer.send(&chat).await.unwrap();

    let res = recv_msg(&mut client).await;
    assert_eq!(res.id, 9);
    assert_eq!(res.msg_type, types::RES_FAIL);
    assert_eq!(res.get_u32(0).unwrap(), types::FAIL_PERM_DENIED);
}

#[tokio::test]
async fn upload_ticket_grant_mints_a_bound_ticket() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let mut client = start_session_engine(backend.clone(), test_config(dir.path()), 6);

    client.writer.send(&connect_cmd(1, 0)).await.unwrap();
    let _login = recv_msg(&mut client).await;

    let mut req = Message::new(types::CMD_FILES_UPLOAD_REQ);
    req.minor = 6;
    req.id = 2;
    req.put_u64(42).put_u32(3);
    client.writer.send(&req).await.unwrap();

    let res = loop {
        let msg = recv_msg(&mut client).await;
        if msg.id == 2 {
            break msg;
        }
    };
    assert_eq!(res.msg_type, types::RES_FILES_UPLOAD_REQ);

    let ticket = Ticket::decode(res.get_bin(0).unwrap()).unwrap();
    assert_eq!(ticket.kind(), Some(TicketKind::Upload));
    assert_eq!(ticket.kws_id, 42);
    assert_eq!(ticket.login_type(), Some(types::LoginType::Normal));
    assert_eq!(ticket.user_id, 7);
    assert_eq!(ticket.share_id().unwrap(), 3);
    assert_eq!(ticket.nonce.len(), conclave_proto::TICKET_NONCE_LEN);
}

#[tokio::test]
async fn permission_revocation_logs_the_client_out() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let mut client = start_session_engine(backend.clone(), test_config(dir.path()), 6);

    client.writer.send(&connect_cmd(1, 0)).await.unwrap();
    let res = recv_msg(&mut client).await;
    assert_eq!(res.get_u32(0).unwrap(), types::LoginCode::Ok.to_u32());

    backend.state().deny_workspace(42, types::LoginCode::Banned.to_u32(), "user banned");

    let evt = loop {
        let msg = recv_msg(&mut client).await;
        if msg.msg_type == types::EVT_KWS_LOG_OUT {
            break msg;
        }
    };
    assert_eq!(evt.id, 0, "transient event");
    assert_eq!(evt.get_u64(0).unwrap(), 42);
    assert_eq!(evt.get_u32(2).unwrap(), types::LoginCode::Banned.to_u32());
}

#[tokio::test]
async fn property_change_returns_event_id_and_emits_event() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let mut client = start_session_engine(backend.clone(), test_config(dir.path()), 6);

    client.writer.send(&connect_cmd(1, 0)).await.unwrap();
    let _login = recv_msg(&mut client).await;

    let mut cmd = Message::new(types::CMD_KWS_SET_NAME);
    cmd.minor = 6;
    cmd.id = 4;
    cmd.put_u64(42).put_str("renamed");
    client.writer.send(&cmd).await.unwrap();

    let mut saw_result = false;
    let mut saw_event = false;
    while !(saw_result && saw_event) {
        let msg = recv_msg(&mut client).await;
        if msg.id == 4 {
            assert_eq!(msg.msg_type, types::RES_KWS_PROP_CHANGE);
            assert!(msg.get_u64(0).unwrap() > 0, "generated event id");
            saw_result = true;
        } else if msg.msg_type == types::EVT_KWS_PROP_CHANGE {
            assert_eq!(msg.get_u64(0).unwrap(), 42);
            saw_event = true;
        }
    }

    assert_eq!(backend.state().workspaces.get(&42).unwrap().name, "renamed");
}

#[tokio::test]
async fn disconnect_stops_event_delivery() {
    let backend = seeded_backend();
    let dir = TempDir::new().unwrap();
    let mut client = start_session_engine(backend.clone(), test_config(dir.path()), 6);

    client.writer.send(&connect_cmd(1, 0)).await.unwrap();
    let _login = recv_msg(&mut client).await;

    let mut cmd = Message::new(types::CMD_KWS_DISCONNECT);
    cmd.minor = 6;
    cmd.id = 2;
    cmd.put_u64(42);
    client.writer.send(&cmd).await.unwrap();

    let res = recv_msg(&mut client).await;
    assert_eq!(res.id, 2);
    assert_eq!(res.msg_type, types::RES_OK);

    // Give the eventer time to unlisten, then post an event: nothing
    // should reach the client.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    backend.state().post_event(42, 1, types::EVT_CHAT_MSG, chat_event_payload("late"));

    let quiet =
        tokio::time::timeout(std::time::Duration::from_millis(300), client.reader.recv()).await;
    assert!(quiet.is_err(), "no event expected after disconnect");
}

fn chat_event_payload(text: &str) -> bytes::Bytes {
    let mut payload = bytes::BytesMut::new();
    conclave_proto::atom::write_u64(&mut payload, 42);
    conclave_proto::atom::write_u64(&mut payload, 0);
    conclave_proto::atom::write_u32(&mut payload, 0);
    conclave_proto::atom::write_u32(&mut payload, 7);
    conclave_proto::atom::write_str(&mut payload, text);
    payload.freeze()
}
