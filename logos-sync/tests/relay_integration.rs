//! Two coordinators talking through a real relay over WebSockets.

use std::sync::Arc;
use std::time::Duration;

use logos_sync::client::{RemoteStore, WsConnector};
use logos_sync::collab::{Collab, CollabSignal, JoinTarget};
use logos_sync::config::SyncConfig;
use logos_sync::element::{Element, Scene};
use logos_sync::portal::PortalState;
use logos_sync::protocol::UserToFollow;
use logos_sync::room::RoomLinkData;
use logos_sync::server::{ServerConfig, SyncServer};
use logos_sync::storage::SceneStore;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

type Peer = Collab<RemoteStore, WsConnector>;

/// Find a free port by binding to :0
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return it with its URL.
async fn start_test_server(storage: Option<&tempfile::TempDir>) -> (Arc<SyncServer>, String) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        storage_path: storage.map(|dir| dir.path().to_path_buf()),
        ..ServerConfig::for_testing()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

fn peer(url: &str, username: &str) -> (Peer, mpsc::UnboundedReceiver<CollabSignal>) {
    let (mut collab, signals) = Collab::new(
        SyncConfig::for_testing(),
        WsConnector::new(url),
        Arc::new(RemoteStore::new(url)),
    );
    collab.set_username(username);
    (collab, signals)
}

/// Drive the event loop until `done` holds. Only the wait for the next
/// event is cut short, never its handling.
async fn pump_until(collab: &mut Peer, done: impl Fn(&Peer) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(collab) {
        let event = timeout_at(deadline, collab.next_event())
            .await
            .expect("condition not reached in time");
        collab.handle_event(event).await;
    }
}

async fn pump_for(collab: &mut Peer, duration: Duration) {
    let deadline = Instant::now() + duration;
    while let Ok(event) = timeout_at(deadline, collab.next_event()).await {
        collab.handle_event(event).await;
    }
}

#[tokio::test]
async fn test_two_peers_sync_through_relay() {
    let dir = tempfile::tempdir().unwrap();
    let (server, url) = start_test_server(Some(&dir)).await;

    let (mut alice, _alice_signals) = peer(&url, "Alice");
    alice
        .start_collaboration(JoinTarget::NewRoom)
        .await
        .unwrap()
        .unwrap();
    pump_until(&mut alice, |p| p.portal_state() == PortalState::Initialized).await;
    alice.sync_elements(Scene::from_ordered(vec![Element::new("a")]).unwrap());
    let room = RoomLinkData::parse_link(alice.active_room_link().unwrap()).unwrap();

    // Bob joins; Alice answers with the full scene
    let (mut bob, _bob_signals) = peer(&url, "Bob");
    bob.start_collaboration(JoinTarget::Existing(room.clone()))
        .await
        .unwrap()
        .unwrap();
    tokio::join!(
        pump_for(&mut alice, Duration::from_millis(1_500)),
        pump_until(&mut bob, |p| p.scene().contains("a")),
    );
    assert_eq!(bob.portal_state(), PortalState::Initialized);
    assert_eq!(bob.collaborators().len(), 2);

    // Bob's edit reaches Alice
    let mut edited = bob.scene().clone();
    edited.push(Element::new("b")).unwrap();
    bob.sync_elements(edited);
    tokio::join!(
        pump_until(&mut alice, |p| p.scene().contains("b")),
        pump_for(&mut bob, Duration::from_millis(200)),
    );

    let rooms = alice.get_available_rooms().await.unwrap();
    let summary = rooms.iter().find(|r| r.room_id == room.room_id).unwrap();
    assert_eq!(summary.active_collaborators, 2);

    // Bob follows Alice
    let alice_id = alice.socket_id().unwrap().to_string();
    let bob_id = bob.socket_id().unwrap().to_string();
    bob.follow_user(Some(UserToFollow {
        socket_id: alice_id,
        username: "Alice".into(),
    }));
    tokio::join!(
        pump_until(&mut alice, |p| !p.followed_by().is_empty()),
        pump_for(&mut bob, Duration::from_millis(200)),
    );
    assert_eq!(alice.followed_by(), [bob_id]);

    bob.stop_collaboration(false).await;
    alice.stop_collaboration(false).await;

    let mut reader = SceneStore::new(Arc::new(RemoteStore::new(url.as_str())), 1 << 20);
    let stored = reader.load(&room).await.unwrap().unwrap();
    assert!(stored.contains("a"));
    assert!(stored.contains("b"));

    let stats = server.stats().await;
    assert!(stats.total_connections >= 2);
    assert!(stats.relayed_broadcasts > 0);
    assert!(stats.storage_requests > 0);
}

#[tokio::test]
async fn test_relay_without_storage_still_syncs() {
    let (_server, url) = start_test_server(None).await;

    let (mut alice, _alice_signals) = peer(&url, "Alice");
    alice
        .start_collaboration(JoinTarget::NewRoom)
        .await
        .unwrap();
    // The initial save of a new room has nowhere to go
    assert!(alice.error_indicator().is_some());
    pump_until(&mut alice, |p| p.portal_state() == PortalState::Initialized).await;
    alice.sync_elements(Scene::from_ordered(vec![Element::new("a")]).unwrap());
    let room = RoomLinkData::parse_link(alice.active_room_link().unwrap()).unwrap();

    let (mut bob, _bob_signals) = peer(&url, "Bob");
    bob.start_collaboration(JoinTarget::Existing(room))
        .await
        .unwrap();
    tokio::join!(
        pump_for(&mut alice, Duration::from_millis(1_000)),
        pump_until(&mut bob, |p| p.scene().contains("a")),
    );
    assert_eq!(bob.scene().len(), 1);
}

#[tokio::test]
async fn test_unreachable_relay_falls_back_to_local() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut alice, _signals) = peer(&url, "Alice");

    alice
        .start_collaboration(JoinTarget::NewRoom)
        .await
        .unwrap();
    pump_until(&mut alice, |p| p.portal_state() == PortalState::Initialized).await;
    assert!(alice.is_collaborating());
}
