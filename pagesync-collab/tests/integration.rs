//! End-to-end tests: a real relay on a free port with real clients and
//! sessions connected to it.

use pagesync_collab::client::{ConnectionState, SyncClient, SyncEvent};
use pagesync_collab::presence::User;
use pagesync_collab::server::{ServerConfig, SyncServer};
use pagesync_collab::session::{CollaborationSession, SessionConfig};
use pagesync_core::{ComponentNode, PageDocument, PartialPageDocument, RootNode};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Starts a relay on an ephemeral port and returns its URL.
async fn start_test_server(max_peers_per_room: usize) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
    });
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

/// Polls `check` for up to two seconds.
async fn eventually(check: impl FnMut() -> bool) -> bool {
    eventually_within(Duration::from_secs(2), check).await
}

async fn eventually_within(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn open(doc: &str, url: &str, name: &str) -> CollaborationSession {
    let config = SessionConfig::new(doc, url, User::new(Uuid::new_v4(), name));
    CollaborationSession::open(config, |_| {}).unwrap()
}

async fn open_connected(doc: &str, url: &str, name: &str) -> CollaborationSession {
    let session = open(doc, url, name);
    assert!(
        eventually(|| session.connection_status() == ConnectionState::Connected).await,
        "{name} never connected"
    );
    session
}

fn page(ids: &[&str]) -> PageDocument {
    PageDocument::with_content(
        ids.iter()
            .map(|id| ComponentNode::from_value("Text", json!({"id": id, "text": id})))
            .collect(),
    )
}

async fn next_matching(
    events: &mut mpsc::Receiver<SyncEvent>,
    mut want: impl FnMut(&SyncEvent) -> bool,
) -> Option<SyncEvent> {
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if want(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

// ─── Sync client against the relay ───────────────────────────────

#[tokio::test]
async fn test_client_connects_and_is_asked_for_its_state() {
    let url = start_test_server(10).await;
    let mut client = SyncClient::new(Uuid::new_v4(), User::new(Uuid::new_v4(), "Alice"), "doc", &url);
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    assert!(matches!(
        next_matching(&mut events, |_| true).await,
        Some(SyncEvent::Connected)
    ));
    assert!(matches!(
        next_matching(&mut events, |e| matches!(e, SyncEvent::SyncRequested(_))).await,
        Some(SyncEvent::SyncRequested(_))
    ));
}

#[tokio::test]
async fn test_newcomer_learns_existing_peers() {
    let url = start_test_server(10).await;
    let alice_id = Uuid::new_v4();
    let mut alice = SyncClient::new(alice_id, User::new(Uuid::new_v4(), "Alice"), "doc", &url);
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    assert!(next_matching(&mut alice_events, |e| matches!(e, SyncEvent::SyncRequested(_)))
        .await
        .is_some());

    let bob_id = Uuid::new_v4();
    let mut bob = SyncClient::new(bob_id, User::new(Uuid::new_v4(), "Bob"), "doc", &url);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();

    match next_matching(&mut bob_events, |e| matches!(e, SyncEvent::PeerJoined { .. })).await {
        Some(SyncEvent::PeerJoined { client_id, user }) => {
            assert_eq!(client_id, alice_id);
            assert_eq!(user.name, "Alice");
        }
        other => panic!("expected Alice's join, got {other:?}"),
    }
    match next_matching(&mut alice_events, |e| matches!(e, SyncEvent::PeerJoined { .. })).await {
        Some(SyncEvent::PeerJoined { client_id, .. }) => assert_eq!(client_id, bob_id),
        other => panic!("expected Bob's join, got {other:?}"),
    }

    bob.disconnect().await;
    match next_matching(&mut alice_events, |e| matches!(e, SyncEvent::PeerLeft(_))).await {
        Some(SyncEvent::PeerLeft(client_id)) => assert_eq!(client_id, bob_id),
        other => panic!("expected Bob to leave, got {other:?}"),
    }
}

#[tokio::test]
async fn test_full_room_rejects_join() {
    let url = start_test_server(1).await;

    let mut first = SyncClient::new(Uuid::new_v4(), User::new(Uuid::new_v4(), "First"), "doc", &url);
    let mut first_events = first.take_event_rx().unwrap();
    first.connect().await.unwrap();
    // The relay asks for state only after admitting the client.
    assert!(next_matching(&mut first_events, |e| matches!(e, SyncEvent::SyncRequested(_)))
        .await
        .is_some());

    let mut second = SyncClient::new(Uuid::new_v4(), User::new(Uuid::new_v4(), "Second"), "doc", &url);
    let mut events = second.take_event_rx().unwrap();
    second.connect().await.unwrap();

    assert!(matches!(
        next_matching(&mut events, |e| matches!(e, SyncEvent::Disconnected)).await,
        Some(SyncEvent::Disconnected)
    ));
    assert_eq!(second.connection_state().await, ConnectionState::Disconnected);
}

// ─── Sessions ────────────────────────────────────────────────────

#[tokio::test]
async fn test_sessions_converge_through_relay() {
    let url = start_test_server(10).await;

    let alice = open_connected("pages/home", &url, "Alice").await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let bob_config = SessionConfig::new("pages/home", url.as_str(), User::new(Uuid::new_v4(), "Bob"));
    let bob = CollaborationSession::open(bob_config, move |doc| {
        sink.lock().unwrap().push(doc.clone());
    })
    .unwrap();
    assert!(eventually(|| bob.connection_status() == ConnectionState::Connected).await);
    assert!(bob.get_data().is_none(), "no data yet is distinct from an empty page");

    alice.set_data(&page(&["a", "b"]));
    assert!(eventually(|| received.lock().unwrap().last() == Some(&page(&["a", "b"]))).await);
    assert_eq!(bob.get_data(), Some(page(&["a", "b"])));

    alice.destroy().await;
    bob.destroy().await;
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let url = start_test_server(10).await;
    let alice = open_connected("doc", &url, "Alice").await;
    alice.set_data(&page(&["seed"]));

    // Once another peer has the seed, the relay has applied it.
    let probe = open_connected("doc", &url, "Probe").await;
    assert!(eventually(|| probe.get_data().is_some()).await);

    let bob = open("doc", &url, "Bob");
    assert!(eventually(|| bob.get_data() == Some(page(&["seed"]))).await);

    for session in [alice, probe, bob] {
        session.destroy().await;
    }
}

#[tokio::test]
async fn test_concurrent_edits_to_different_keys_both_survive() {
    let url = start_test_server(10).await;
    let alice = open_connected("doc", &url, "Alice").await;
    let bob = open_connected("doc", &url, "Bob").await;

    let mut root = RootNode::default();
    root.props.title = Some("Landing".into());
    alice.update_data(&PartialPageDocument::root(root.clone()));
    bob.update_data(&PartialPageDocument::content(page(&["x"]).content));

    let converged = eventually(|| {
        let (a, b) = (alice.get_data(), bob.get_data());
        a.is_some() && a == b
    })
    .await;
    assert!(converged);

    let merged = alice.get_data().unwrap();
    assert_eq!(merged.root, root);
    assert_eq!(merged.content, page(&["x"]).content);

    alice.destroy().await;
    bob.destroy().await;
}

#[tokio::test]
async fn test_undo_propagates_and_remote_edits_are_not_undoable() {
    let url = start_test_server(10).await;
    let alice = open_connected("doc", &url, "Alice").await;
    let bob = open_connected("doc", &url, "Bob").await;

    alice.set_data(&PageDocument::new());
    alice.update_data(&PartialPageDocument::content(page(&["mine"]).content));
    assert!(eventually(|| bob.get_data() == Some(page(&["mine"]))).await);
    assert!(!bob.can_undo());

    assert!(alice.undo());
    assert!(eventually(|| bob.get_data() == Some(PageDocument::new())).await);

    alice.destroy().await;
    bob.destroy().await;
}

#[tokio::test]
async fn test_connection_listener_sees_transitions() {
    let url = start_test_server(10).await;
    let session = open("doc", &url, "Alice");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = session.on_connection_change(move |state| sink.lock().unwrap().push(*state));

    assert!(eventually(|| seen.lock().unwrap().contains(&ConnectionState::Connected)).await);
    let first = seen.lock().unwrap()[0];
    assert!(matches!(first, ConnectionState::Connecting | ConnectionState::Connected));

    session.destroy().await;
}

#[tokio::test]
async fn test_session_reconnects_when_relay_appears() {
    // Reserve a port, release it, start the session, then start the relay.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = format!("ws://{addr}");

    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    let session = open("doc", &url, "Alice");
    let _sub = session.on_connection_change(move |state| {
        if *state == ConnectionState::Connected {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    session.set_data(&page(&["offline"]));

    assert!(eventually(|| session.connection_status() == ConnectionState::Disconnected).await);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let server = SyncServer::new(ServerConfig::default());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    assert!(eventually(|| connects.load(Ordering::SeqCst) >= 1).await);

    let peer = open("doc", &url, "Bob");
    assert!(eventually(|| peer.get_data() == Some(page(&["offline"]))).await);

    session.destroy().await;
    peer.destroy().await;
}

#[tokio::test]
async fn test_session_survives_relay_restart() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}");
    let relay = Arc::new(SyncServer::new(ServerConfig::default()));
    let serving = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.serve(listener).await })
    };

    let alice = open_connected("doc", &url, "Alice").await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = alice.on_connection_change(move |state| sink.lock().unwrap().push(*state));
    alice.set_data(&page(&["before"]));

    relay.shutdown();
    serving.await.unwrap().unwrap();
    assert!(eventually(|| alice.connection_status() == ConnectionState::Disconnected).await);

    // Edited while the relay is down.
    alice.update_data(&PartialPageDocument::content(page(&["after"]).content));

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let server = SyncServer::new(ServerConfig::default());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    assert!(eventually_within(Duration::from_secs(5), || alice.connection_status() == ConnectionState::Connected).await);

    let transitions = seen.lock().unwrap().clone();
    assert_eq!(transitions.first(), Some(&ConnectionState::Connected));
    let dropped = transitions.iter().position(|s| *s == ConnectionState::Disconnected);
    assert!(dropped.is_some(), "saw {transitions:?}");
    assert!(transitions[dropped.unwrap()..].contains(&ConnectionState::Connected));

    let bob = open("doc", &url, "Bob");
    assert!(eventually(|| bob.get_data() == Some(page(&["after"]))).await);

    alice.destroy().await;
    bob.destroy().await;
}
