use std::sync::{Arc, OnceLock};
use std::time::Duration;

use p2p_secure_chat::crypto::CryptoManager;
use p2p_secure_chat::network::framing::write_sealed;
use p2p_secure_chat::network::{ConnectionId, RotationNotice, SendOutcome};
use p2p_secure_chat::session::{Clock, ManualClock};
use p2p_secure_chat::{
    ConnectionManager, NetworkEvent, NodeConfig, P2PError, SessionConfig, SessionManager,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn crypto() -> Arc<CryptoManager> {
    static MANAGER: OnceLock<Arc<CryptoManager>> = OnceLock::new();
    MANAGER
        .get_or_init(|| Arc::new(CryptoManager::new().unwrap()))
        .clone()
}

struct Node {
    manager: ConnectionManager,
    events: UnboundedReceiver<NetworkEvent>,
    clock: ManualClock,
}

fn node(name: &str) -> Node {
    let clock = ManualClock::new();
    let sessions = Arc::new(SessionManager::with_clock(
        SessionConfig::default(),
        Arc::new(clock.clone()) as Arc<dyn Clock>,
    ));
    let (tx, events) = tokio::sync::mpsc::unbounded_channel();
    let config = NodeConfig::new(Some(name.to_string()), None, 0);
    let manager = ConnectionManager::with_crypto(config, sessions, crypto(), tx).unwrap();
    Node {
        manager,
        events,
        clock,
    }
}

async fn wait_for<F>(events: &mut UnboundedReceiver<NetworkEvent>, mut pred: F) -> NetworkEvent
where
    F: FnMut(&NetworkEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn message_from(events: &mut UnboundedReceiver<NetworkEvent>) -> (String, String) {
    match wait_for(events, |e| matches!(e, NetworkEvent::MessageReceived { .. })).await {
        NetworkEvent::MessageReceived {
            peer_id, content, ..
        } => (peer_id, content),
        other => panic!("unexpected event {:?}", other),
    }
}

/// Alice dials Bob. Returns Alice's connection id for Bob.
async fn connect(alice: &mut Node, bob: &mut Node) -> ConnectionId {
    bob.manager.listen().await.unwrap();
    let target = bob.manager.connection_string().unwrap();
    let conn = alice.manager.connect(&target).await.unwrap();
    wait_for(&mut bob.events, |e| {
        matches!(e, NetworkEvent::PeerConnected { peer_id, .. } if peer_id == "alice")
    })
    .await;
    conn
}

async fn bob_session(bob: &Node) -> String {
    bob.manager.sessions_overview().await.remove(0).session_id
}

#[tokio::test]
async fn test_hello_arrives_exactly() {
    let mut alice = node("alice");
    let mut bob = node("bob");
    connect(&mut alice, &mut bob).await;

    let report = alice.manager.broadcast(b"hello", None).await;
    assert_eq!(report.delivered, 1);

    assert_eq!(
        message_from(&mut bob.events).await,
        ("alice".to_string(), "hello".to_string())
    );

    // and back the other way
    bob.manager.broadcast(b"hi alice", None).await;
    assert_eq!(
        message_from(&mut alice.events).await,
        ("bob".to_string(), "hi alice".to_string())
    );

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test]
async fn test_rotation_is_transparent() {
    let mut alice = node("alice");
    let mut bob = node("bob");
    let conn = connect(&mut alice, &mut bob).await;
    let bob_before = bob_session(&bob).await;

    alice.clock.advance(chrono::Duration::seconds(1801));
    let outcome = alice
        .manager
        .transport()
        .send_encrypted(conn, b"sent across rotation")
        .await
        .unwrap();
    let new_session = match outcome {
        SendOutcome::Rotated { new_session, .. } => new_session,
        other => panic!("expected rotation, got {:?}", other),
    };

    // the notice itself never shows up as a message
    wait_for(&mut bob.events, |e| matches!(e, NetworkEvent::SessionRotated { .. })).await;
    assert_eq!(
        message_from(&mut bob.events).await,
        ("alice".to_string(), "sent across rotation".to_string())
    );

    assert_eq!(bob_session(&bob).await, new_session);
    assert!(!bob.manager.sessions().is_valid(&bob_before));
    assert!(bob.manager.sessions().is_valid(&new_session));

    // traffic keeps flowing on the new session in both directions
    alice.manager.broadcast(b"still here", None).await;
    assert_eq!(message_from(&mut bob.events).await.1, "still here");
    bob.manager.broadcast(b"me too", None).await;
    assert_eq!(message_from(&mut alice.events).await.1, "me too");

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test]
async fn test_replayed_rotation_notice_tears_connection_down() {
    let mut alice = node("alice");
    let mut bob = node("bob");
    let conn = connect(&mut alice, &mut bob).await;

    alice.clock.advance(chrono::Duration::seconds(1800));
    alice
        .manager
        .transport()
        .send_encrypted(conn, b"first")
        .await
        .unwrap();
    assert_eq!(message_from(&mut bob.events).await.1, "first");
    let current = bob_session(&bob).await;

    // inject a notice on alice's channel, then replay it verbatim
    let peer = alice.manager.registry().get(conn).await.unwrap();
    let replay = RotationNotice::new(
        p2p_secure_chat::session::generate_token(),
        p2p_secure_chat::session::generate_token(),
    );
    {
        // a token bob has never seen is accepted once
        let mut writer = peer.writer.lock().await;
        write_sealed(&mut **writer, &peer.aead, &replay.to_bytes().unwrap())
            .await
            .unwrap();
    }
    wait_for(&mut bob.events, |e| matches!(e, NetworkEvent::SessionRotated { .. })).await;
    assert_ne!(bob_session(&bob).await, current);
    {
        // but never twice
        let mut writer = peer.writer.lock().await;
        write_sealed(&mut **writer, &peer.aead, &replay.to_bytes().unwrap())
            .await
            .unwrap();
    }

    // alice keeps talking; bob's session is now dead so the link drops
    let _ = alice.manager.transport().send_encrypted(conn, b"hello").await;
    let event = wait_for(&mut bob.events, |e| {
        matches!(e, NetworkEvent::PeerDisconnected { .. } | NetworkEvent::MessageReceived { .. })
    })
    .await;
    match event {
        NetworkEvent::PeerDisconnected { peer_id, reason, .. } => {
            assert_eq!(peer_id, "alice");
            assert!(reason.starts_with("session out of sync"), "reason: {}", reason);
        }
        other => panic!("message delivered on a rejected session: {:?}", other),
    }
    assert_eq!(bob.manager.peer_count().await, 0);

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test]
async fn test_wrong_secret_is_refused() {
    let mut alice = node("alice");
    let bob = node("bob");
    bob.manager.listen().await.unwrap();

    let mut target = bob.manager.connection_string().unwrap();
    target.secret.push('x');

    let err = alice.manager.connect(&target).await.unwrap_err();
    assert!(matches!(err, P2PError::Handshake(_)));
    assert!(matches!(
        wait_for(&mut alice.events, |_| true).await,
        NetworkEvent::ConnectionFailed { .. }
    ));
    assert_eq!(bob.manager.peer_count().await, 0);

    bob.manager.shutdown().await;
}

#[tokio::test]
async fn test_exit_disconnects_everyone() {
    let mut alice = node("alice");
    let mut bob = node("bob");
    connect(&mut alice, &mut bob).await;

    bob.manager.shutdown().await;
    let event = wait_for(&mut alice.events, |e| {
        matches!(e, NetworkEvent::PeerDisconnected { .. })
    })
    .await;
    assert!(matches!(event, NetworkEvent::PeerDisconnected { ref peer_id, .. } if peer_id == "bob"));
    assert_eq!(alice.manager.peer_count().await, 0);

    alice.manager.shutdown().await;
}
