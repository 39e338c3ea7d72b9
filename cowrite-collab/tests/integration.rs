//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full edit pipeline.

use std::sync::Arc;

use cowrite_collab::client::{ClientSnapshot, SyncClient, SyncEvent};
use cowrite_collab::protocol::{Envelope, Message, PeerInfo};
use cowrite_collab::server::{ServerConfig, SyncServer};
use cowrite_collab::session::{SessionConfig, SessionEvent, SessionPhase, SyncFault};
use cowrite_core::{Operation, TextBuffer};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Start a server on a free port, return it with its URL.
async fn start_test_server(config: ServerConfig) -> (Arc<SyncServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(config));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn connect(url: &str, script: Uuid, name: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    SyncClient::connect(
        url,
        script,
        PeerInfo::new(name),
        TextBuffer::default(),
        SessionConfig::default(),
    )
    .await
    .unwrap()
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(SyncEvent::Session(event)) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn joined(events: &mut mpsc::Receiver<SyncEvent>) -> SessionEvent {
    wait_for(events, |e| matches!(e, SessionEvent::Joined { .. })).await
}

/// Poll until every client is synchronized at `state`.
async fn settled(clients: &[&SyncClient], state: u64) -> Vec<ClientSnapshot> {
    timeout(Duration::from_secs(5), async {
        loop {
            let mut snapshots = Vec::new();
            for client in clients {
                snapshots.push(client.snapshot().await.unwrap());
            }
            if snapshots.iter().all(|s| s.synchronized && s.state == state) {
                return snapshots;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("clients did not settle")
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_seeded_script() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let script = Uuid::new_v4();
    server.seed_script(script, "(print \"hi\")").await;

    let (alice, mut events) = connect(&url, script, "Alice").await;
    match events.recv().await {
        Some(SyncEvent::Connected) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    match joined(&mut events).await {
        SessionEvent::Joined { state, members } => {
            assert_eq!(state, 0);
            assert!(members.is_empty());
        }
        _ => unreachable!(),
    }

    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.text, "(print \"hi\")");
    assert_eq!(snapshot.phase, SessionPhase::Active);
    assert_eq!(server.member_count(script).await, 1);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let script = Uuid::new_v4();
    server.seed_script(script, "0123456789").await;

    let (alice, mut events_a) = connect(&url, script, "Alice").await;
    joined(&mut events_a).await;
    let (bob, mut events_b) = connect(&url, script, "Bob").await;
    match joined(&mut events_b).await {
        SessionEvent::Joined { members, .. } => {
            assert_eq!(members.len(), 1);
            assert_eq!(members[0].name, "Alice");
        }
        _ => unreachable!(),
    }

    // Issued without waiting on each other.
    let (a, b) = tokio::join!(
        alice.edit(Operation::insert(5, "abc")),
        bob.edit(Operation::remove(2, 6)),
    );
    a.unwrap();
    b.unwrap();
    alice.edit(Operation::insert(0, ">")).await.unwrap();

    let snapshots = settled(&[&alice, &bob], 3).await;
    assert_eq!(snapshots[0].text, snapshots[1].text);
    assert_eq!(server.script_text(script).await, Some(snapshots[0].text.clone()));
    assert_eq!(server.script_state(script).await, Some(3));
    assert_eq!(server.stats().await.edits_applied, 3);
}

#[tokio::test]
async fn test_late_joiner_receives_current_text() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let script = Uuid::new_v4();

    let (alice, mut events_a) = connect(&url, script, "Alice").await;
    joined(&mut events_a).await;
    for word in ["let ", "x ", "= 1"] {
        let len = alice.text().await.unwrap().chars().count();
        alice.edit(Operation::insert(len, word)).await.unwrap();
    }
    settled(&[&alice], 3).await;

    let (carol, mut events_c) = connect(&url, script, "Carol").await;
    match joined(&mut events_c).await {
        SessionEvent::Joined { state, .. } => assert_eq!(state, 3),
        _ => unreachable!(),
    }
    assert_eq!(carol.text().await.unwrap(), "let x = 1");

    // Alice hears about Carol.
    wait_for(&mut events_a, |e| matches!(e, SessionEvent::MemberJoined(p) if p.name == "Carol")).await;
}

#[tokio::test]
async fn test_presence_is_relayed() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let script = Uuid::new_v4();

    let (alice, mut events_a) = connect(&url, script, "Alice").await;
    joined(&mut events_a).await;
    let (bob, mut events_b) = connect(&url, script, "Bob").await;
    joined(&mut events_b).await;

    alice.move_cursor(0).await.unwrap();
    let alice_id = alice.peer_info().peer_id;
    let event = wait_for(&mut events_b, |e| matches!(e, SessionEvent::CursorMoved { .. })).await;
    assert_eq!(
        event,
        SessionEvent::CursorMoved {
            member: alice_id,
            position: 0
        }
    );

    bob.select(0, 0).await.unwrap();
    wait_for(&mut events_a, |e| matches!(e, SessionEvent::SelectionChanged { .. })).await;
}

#[tokio::test]
async fn test_sessions_full() {
    let config = ServerConfig {
        max_members_per_session: 1,
        ..ServerConfig::default()
    };
    let (_server, url) = start_test_server(config).await;
    let script = Uuid::new_v4();

    let (_alice, mut events_a) = connect(&url, script, "Alice").await;
    joined(&mut events_a).await;

    let (bob, mut events_b) = connect(&url, script, "Bob").await;
    wait_for(&mut events_b, |e| matches!(e, SessionEvent::SessionsFull)).await;
    assert_eq!(bob.snapshot().await.unwrap().phase, SessionPhase::Closed);
}

#[tokio::test]
async fn test_leave_persists_text_and_notifies() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let script = Uuid::new_v4();

    let (alice, mut events_a) = connect(&url, script, "Alice").await;
    joined(&mut events_a).await;
    let (bob, mut events_b) = connect(&url, script, "Bob").await;
    joined(&mut events_b).await;
    let bob_id = bob.peer_info().peer_id;

    bob.edit(Operation::insert(0, "draft")).await.unwrap();
    settled(&[&alice, &bob], 1).await;

    bob.leave().await.unwrap();
    assert_eq!(
        wait_for(&mut events_a, |e| matches!(e, SessionEvent::MemberLeft(_))).await,
        SessionEvent::MemberLeft(bob_id)
    );

    alice.leave().await.unwrap();
    timeout(Duration::from_secs(5), async {
        while server.session_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session was not removed");
    assert_eq!(server.script_text(script).await.as_deref(), Some("draft"));
}

#[tokio::test]
async fn test_closed_session_rejoins_on_next_edit() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let script = Uuid::new_v4();
    server.seed_script(script, "abc").await;

    let (alice, mut events) = connect(&url, script, "Alice").await;
    joined(&mut events).await;

    assert!(server.close_session(script).await);
    wait_for(&mut events, |e| matches!(e, SessionEvent::SessionClosed)).await;

    alice.edit(Operation::insert(3, "d")).await.unwrap();
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, SessionEvent::Synchronizing { .. })).await,
        SessionEvent::Synchronizing {
            fault: SyncFault::SessionInactive,
            discarded: 0
        }
    );
    joined(&mut events).await;

    // The edit made while closed is replaced by the server baseline.
    let snapshot = alice.snapshot().await.unwrap();
    assert_eq!(snapshot.text, "abc");
    assert_eq!(snapshot.phase, SessionPhase::Active);
    assert_eq!(server.member_count(script).await, 1);
}

#[tokio::test]
async fn test_raw_edit_from_future_state_gets_sync_error() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let script = Uuid::new_v4();
    let member = PeerInfo::new("Raw");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let send = |message: Message| {
        Envelope::new(script, member.peer_id, message).encode().unwrap()
    };
    ws.send(send(Message::JoinSession { member: member.clone(), state: 0 }).into())
        .await
        .unwrap();
    ws.send(
        send(Message::Edit {
            id: Uuid::new_v4(),
            state: 9,
            edit: Operation::insert(0, "x"),
        })
        .into(),
    )
    .await
    .unwrap();

    let mut replies = Vec::new();
    while replies.len() < 2 {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        replies.push(Envelope::decode(&frame.into_data()).unwrap().message);
    }
    assert!(matches!(replies[0], Message::JoinedSession { state: 0, .. }));
    assert_eq!(
        replies[1],
        Message::SyncError {
            state: 0,
            script_text: String::new()
        }
    );
}

#[tokio::test]
async fn test_raw_edit_with_overflowing_offset_gets_sync_error() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let script = Uuid::new_v4();
    server.seed_script(script, "abc").await;
    let member = PeerInfo::new("Raw");

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let send = |message: Message| {
        Envelope::new(script, member.peer_id, message).encode().unwrap()
    };
    ws.send(send(Message::JoinSession { member: member.clone(), state: 0 }).into())
        .await
        .unwrap();
    ws.send(
        send(Message::Edit {
            id: Uuid::new_v4(),
            state: 0,
            edit: Operation::remove(usize::MAX, 2),
        })
        .into(),
    )
    .await
    .unwrap();
    // The connection is still served after the rejection.
    ws.send(send(Message::RequestSync).into()).await.unwrap();

    let mut replies = Vec::new();
    while replies.len() < 3 {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        replies.push(Envelope::decode(&frame.into_data()).unwrap().message);
    }
    assert!(matches!(replies[0], Message::JoinedSession { state: 0, .. }));
    assert_eq!(
        replies[1],
        Message::SyncError {
            state: 0,
            script_text: "abc".to_string()
        }
    );
    assert_eq!(
        replies[2],
        Message::SyncToSession {
            state: 0,
            script_text: "abc".to_string()
        }
    );
    assert_eq!(server.script_text(script).await.as_deref(), Some("abc"));
    assert_eq!(server.stats().await.edits_rejected, 1);
}
