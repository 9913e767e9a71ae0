//! Presence across real connections: cursors, board scoping, leave and eviction.

mod support;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use support::{fast_config, wait_for, AuthMode, Relay};
use tessera_collab::{
    AwarenessMessage, BoardFrame, CursorColor, PresenceRecord, PresenceUpdate, SyncClient,
    SyncConfig, Vec2,
};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

async fn join(relay: &Relay, config: SyncConfig, name: &str, board: &str) -> SyncClient {
    let client = SyncClient::with_name(config, name);
    client.switch_to_board(board).unwrap();
    client.connect(None);
    wait_for("handshake", || client.is_healthy()).await;
    client
}

#[tokio::test]
async fn test_cursor_reaches_peer() {
    let relay = Relay::start(AuthMode::Accept).await;
    let alice = join(&relay, fast_config(&relay.url), "alice", "board").await;
    let bob = join(&relay, fast_config(&relay.url), "bob", "board").await;
    let alice_id = alice.local_presence().id;

    alice.update_user_presence(PresenceUpdate {
        selection: Some(vec!["shape-1".into(), "shape-2".into()]),
        tool: Some("select".into()),
        ..PresenceUpdate::cursor(150.0, 250.0)
    });

    wait_for("bob sees alice's cursor", || {
        bob.peers()
            .get(&alice_id)
            .is_some_and(|p| p.cursor == Some(Vec2::new(150.0, 250.0)))
    })
    .await;

    let record = bob.peers()[&alice_id].clone();
    assert_eq!(record.name, "alice");
    assert_eq!(record.selection, vec!["shape-1".to_string(), "shape-2".to_string()]);
    assert_eq!(record.tool.as_deref(), Some("select"));
    assert_eq!(record.color, CursorColor::from_uuid(alice_id));

    // Alice learned about bob from his handshake announcement; never about herself.
    let bob_id = bob.local_presence().id;
    wait_for("alice sees bob", || alice.peers().contains_key(&bob_id)).await;
    assert!(!alice.peers().contains_key(&alice_id));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_sends_leave() {
    let relay = Relay::start(AuthMode::Accept).await;
    let alice = join(&relay, fast_config(&relay.url), "alice", "board").await;
    let bob = join(&relay, fast_config(&relay.url), "bob", "board").await;
    let alice_id = alice.local_presence().id;

    alice.update_user_presence(PresenceUpdate::cursor(1.0, 1.0));
    wait_for("bob sees alice", || bob.peers().contains_key(&alice_id)).await;

    alice.disconnect();
    wait_for("alice left", || !bob.peers().contains_key(&alice_id)).await;
    wait_for("alice forgot peers", || alice.peers().is_empty()).await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_presence_is_scoped_to_board() {
    let relay = Relay::start(AuthMode::Accept).await;
    let alice = join(&relay, fast_config(&relay.url), "alice", "board-a").await;
    let bob = join(&relay, fast_config(&relay.url), "bob", "board-a").await;
    let carol = join(&relay, fast_config(&relay.url), "carol", "board-b").await;
    let alice_id = alice.local_presence().id;

    alice.update_user_presence(PresenceUpdate::cursor(5.0, 5.0));
    wait_for("bob sees alice", || bob.peers().contains_key(&alice_id)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!carol.peers().contains_key(&alice_id));

    // Switching away sends a Leave for the old board.
    alice.switch_to_board("board-b").unwrap();
    wait_for("alice left board-a", || !bob.peers().contains_key(&alice_id)).await;
    alice.update_user_presence(PresenceUpdate::cursor(6.0, 6.0));
    wait_for("carol sees alice", || carol.peers().contains_key(&alice_id)).await;

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_is_evicted() {
    let relay = Relay::start(AuthMode::Accept).await;
    let config = fast_config(&relay.url)
        .with_presence_timing(Duration::from_millis(20), Duration::from_millis(100));
    let bob = join(&relay, config, "bob", "board").await;

    // A bare socket announces itself once and then goes quiet.
    let (mut ghost, _) = tokio_tungstenite::connect_async(relay.url.clone()).await.unwrap();
    let _auth = ghost.next().await;
    let ghost_id = Uuid::new_v4();
    let announcement = AwarenessMessage::Update(PresenceRecord::new(ghost_id, "ghost"))
        .encode()
        .unwrap();
    let frame = BoardFrame::awareness("board", announcement).encode().unwrap();
    ghost.send(Message::Binary(frame.into())).await.unwrap();

    wait_for("bob sees ghost", || bob.peers().contains_key(&ghost_id)).await;
    wait_for("ghost evicted", || !bob.peers().contains_key(&ghost_id)).await;
    assert_eq!(bob.connection_metrics().peers, 0);

    drop(ghost);
    bob.shutdown().await;
}

#[tokio::test]
async fn test_active_peer_survives_sweeps() {
    let relay = Relay::start(AuthMode::Accept).await;
    let timing = |url: &str| {
        fast_config(url).with_presence_timing(Duration::from_millis(20), Duration::from_millis(100))
    };
    let alice = join(&relay, timing(&relay.url), "alice", "board").await;
    let bob = join(&relay, timing(&relay.url), "bob", "board").await;
    let alice_id = alice.local_presence().id;

    wait_for("bob sees alice", || bob.peers().contains_key(&alice_id)).await;
    // Several timeouts pass; alice's periodic re-broadcast keeps her present.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(bob.peers().contains_key(&alice_id));

    alice.shutdown().await;
    bob.shutdown().await;
}
