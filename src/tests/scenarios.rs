//! End-to-end conference flows over real websockets.

use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::bus::{EventBus, LocalBus};
use crate::protocol::{
    AdminAction, AdminOp, ChatRequest, ConferenceMessage, ErrorCode, Payload, Role,
};
use crate::testutil::{TestServer, WsClient};

fn join_response(p: &Payload) -> Option<crate::protocol::JoinResponse> {
    match p {
        Payload::JoinResponse(j) => Some(j.clone()),
        _ => None,
    }
}

fn room_state(p: &Payload) -> Option<crate::protocol::RoomState> {
    match p {
        Payload::RoomState(s) => Some(s.clone()),
        _ => None,
    }
}

fn chat_event(p: &Payload) -> Option<crate::protocol::ChatEvent> {
    match p {
        Payload::ChatEvent(c) => Some(c.clone()),
        _ => None,
    }
}

fn approve(target: &str) -> ConferenceMessage {
    ConferenceMessage::new(AdminAction {
        action: AdminOp::Approve as i32,
        target_id: target.to_owned(),
    })
}

fn chat(text: &str) -> ConferenceMessage {
    ConferenceMessage::new(ChatRequest {
        content: text.to_owned(),
        is_private: false,
        target_id: String::new(),
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn owner_hosts_guest_waits_owner_admits() {
    let server = TestServer::start(|_| {}).await;

    let mut u1 = server.connect("standup", "u1").await;
    let join = u1.recv_until(join_response).await;
    assert_eq!(join.role, Role::Host as i32);
    assert_eq!(join.client_id, "u1");
    let state = u1.recv_until(room_state).await;
    assert_eq!(state.owner_id, "u1");
    assert_eq!(state.draw_order, vec!["u1"]);

    let mut u2 = server.connect("standup", "u2").await;
    let join = u2.recv_until(join_response).await;
    assert_eq!(join.role, Role::Waiting as i32);

    // The host hears about the waiting guest.
    let notification = u1
        .recv_until(|p| match p {
            Payload::WaitingRoomNotification(n) => Some(n.clone()),
            _ => None,
        })
        .await;
    assert_eq!(notification.client_id, "u2");
    let state = u2.recv_until(room_state).await;
    assert_eq!(state.waiting.len(), 1);

    u1.send(&approve("u2")).await.unwrap();

    let state = u1
        .recv_until(|p| room_state(p).filter(|s| s.participants.len() == 2))
        .await;
    assert_eq!(state.draw_order, vec!["u1", "u2"]);
    let state = u2
        .recv_until(|p| room_state(p).filter(|s| s.participants.len() == 2))
        .await;
    assert!(state.waiting.is_empty());

    // The admitted guest can chat now.
    u2.send(&chat("made it")).await.unwrap();
    let event = u1.recv_until(chat_event).await;
    assert_eq!(event.sender_id, "u2");
    assert_eq!(event.content, "made it");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_connection_displaces_the_first() {
    let server = TestServer::start(|_| {}).await;

    let mut first = server.connect("R", "u1").await;
    first.recv_until(join_response).await;

    let mut second = server.connect("R", "u1").await;
    let join = second.recv_until(join_response).await;
    assert_eq!(join.role, Role::Host as i32);

    let err = first
        .recv_until(|p| match p {
            Payload::Error(e) => Some(e.clone()),
            _ => None,
        })
        .await;
    assert_eq!(err.code, ErrorCode::Displaced as i32);
    first.expect_close().await;

    // No duplicate membership in the surviving view.
    let room = server.hub.room("R").expect("room exists");
    let snapshot = room.snapshot();
    assert_eq!(snapshot.participants.len(), 1);
    assert_eq!(room.member_count(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn owner_reconnect_within_grace_keeps_chat_history() {
    let server = TestServer::start(|c| c.cleanup_grace = Duration::from_millis(500)).await;

    let mut u1 = server.connect("R", "u1").await;
    u1.recv_until(join_response).await;
    u1.send(&chat("still here?")).await.unwrap();
    u1.recv_until(chat_event).await;
    drop(u1); // abrupt socket loss

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.hub.room_count(), 1, "grace period holds the room");

    let mut back = server.connect("R", "u1").await;
    let join = back.recv_until(join_response).await;
    assert_eq!(join.role, Role::Host as i32, "owner role restored");
    let replay = back
        .recv_until(|p| match p {
            Payload::RecentChats(r) => Some(r.clone()),
            _ => None,
        })
        .await;
    assert_eq!(replay.chats.len(), 1);
    assert_eq!(replay.chats[0].content, "still here?");
    assert_eq!(server.hub.room_count(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hostless_room_closes_for_remaining_participants() {
    let server = TestServer::start(|c| c.cleanup_grace = Duration::from_millis(300)).await;

    let mut u1 = server.connect("R", "u1").await;
    u1.recv_until(join_response).await;
    let mut u2 = server.connect("R", "u2").await;
    u2.recv_until(join_response).await;
    u1.send(&approve("u2")).await.unwrap();
    u2.recv_until(|p| room_state(p).filter(|s| s.participants.len() == 2))
        .await;

    drop(u1); // the only host vanishes

    let state = u2.recv_until(|p| room_state(p).filter(|s| s.closed)).await;
    assert_eq!(state.close_reason, "host did not return");
    u2.expect_close().await;

    // The registry no longer knows the room.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.hub.room_count(), 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subprotocol_token_is_echoed_in_the_handshake() {
    let server = TestServer::start(|_| {}).await;

    let mut client = WsClient::connect(server.addr, "/ws/R", Some("huddle.v1, u7"))
        .await
        .unwrap();
    assert_eq!(client.accepted_subprotocol.as_deref(), Some("u7"));
    let join = client.recv_until(join_response).await;
    assert_eq!(join.client_id, "u7");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn upgrade_refusals_carry_http_statuses() {
    let server = TestServer::start(|c| c.rate_limit_ws_ip = 1).await;

    let status = |err: tungstenite::Error| match err {
        tungstenite::Error::Http(resp) => resp.status().as_u16(),
        other => panic!("expected http refusal, got {other}"),
    };

    // No token at all.
    let err = WsClient::connect(server.addr, "/ws/R", None)
        .await
        .err()
        .expect("refused");
    assert_eq!(status(err), 401);

    // That attempt consumed the only permit in the per-IP bucket.
    let err = WsClient::connect(server.addr, "/ws/R?token=u1", None)
        .await
        .err()
        .expect("refused");
    assert_eq!(status(err), 429);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_crosses_instances_exactly_once() {
    let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());
    let instance_a = TestServer::start_with(|_| {}, Some(bus.clone()), None).await;
    let instance_b = TestServer::start_with(|_| {}, Some(bus.clone()), None).await;

    let mut u1 = instance_a.connect("R", "u1").await;
    u1.recv_until(join_response).await;
    let mut u2 = instance_b.connect("R", "u2").await;
    u2.recv_until(join_response).await;

    u1.send(&chat("hello, other instance")).await.unwrap();

    // The sender sees the event once through local fan-out...
    let event = u1.recv_until(chat_event).await;
    assert_eq!(event.content, "hello, other instance");
    // ...the remote member once through the bus...
    let event = u2.recv_until(chat_event).await;
    assert_eq!(event.sender_id, "u1");
    // ...and neither sees a loopback duplicate.
    u1.expect_silence(Duration::from_millis(300)).await;
    u2.expect_silence(Duration::from_millis(300)).await;

    instance_a.stop().await;
    instance_b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_propagates_to_a_waiting_member_on_another_instance() {
    let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());
    let instance_a = TestServer::start_with(|_| {}, Some(bus.clone()), None).await;
    let instance_b = TestServer::start_with(|_| {}, Some(bus.clone()), None).await;

    // u1 owns the room on instance A; u3 owns the replica on B, so u2
    // lands in B's waiting room.
    let mut u1 = instance_a.connect("R", "u1").await;
    u1.recv_until(join_response).await;
    let mut u3 = instance_b.connect("R", "u3").await;
    u3.recv_until(join_response).await;
    let mut u2 = instance_b.connect("R", "u2").await;
    let join = u2.recv_until(join_response).await;
    assert_eq!(join.role, Role::Waiting as i32);

    // Give the membership-set writes (spawned on join) a beat to land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The host on A approves u2, who is not a local member there: the
    // action travels via the membership set and the direct topic.
    u1.send(&approve("u2")).await.unwrap();

    let state = u2
        .recv_until(|p| room_state(p).filter(|s| s.waiting.is_empty()))
        .await;
    assert!(state.draw_order.contains(&"u2".to_owned()));

    instance_a.stop().await;
    instance_b.stop().await;
}
