//! Integration tests for reconnection and watermark-driven resync.
//!
//! These tests exercise the catch-up path: delta resync for short
//! absences, forced reset once server history has been pruned past a
//! session's watermark, and the empty-project reset after the server
//! dropped state nobody was holding.

use arxis_collab::config::SyncConfig;
use arxis_collab::protocol::{CollectionId, EntityId, OpKind, ProjectId, UserInfo};
use arxis_collab::server::{ServerConfig, SyncServer};
use arxis_collab::session::{CollabSession, SessionEvent};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server(config: ServerConfig) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..config
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn test_sync_config(port: u16) -> SyncConfig {
    SyncConfig {
        server_url: format!("ws://127.0.0.1:{port}"),
        sync_rate_hz: 200,
        heartbeat_interval: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(5),
        resync_timeout: Duration::from_secs(5),
        ..SyncConfig::default()
    }
}

fn chat() -> CollectionId {
    CollectionId::new("chat")
}

/// Connect and return the resync summary observed on the way in.
async fn connect_and_resync(
    session: &CollabSession,
    events: &mut broadcast::Receiver<SessionEvent>,
) -> (usize, usize) {
    session.connect().await.unwrap();
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Resynced {
                    collections,
                    reset_collections,
                }) => break (collections, reset_collections),
                Ok(_) => continue,
                Err(e) => panic!("event stream ended before resync: {e}"),
            }
        }
    })
    .await
    .expect("resync should complete after connect")
}

async fn wait_for_ack(session: &CollabSession, at_least: u64) {
    timeout(Duration::from_secs(3), async {
        loop {
            let stats = session.stats().await.unwrap();
            if stats.last_ack_seq >= at_least && stats.pending_mutations == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server should acknowledge mutations");
}

async fn send_chat(session: &CollabSession, entity: &str, text: &str) {
    session
        .mutate_local(
            chat(),
            OpKind::Insert,
            EntityId::new(entity),
            text.as_bytes().to_vec(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_short_absence_resumes_with_delta() {
    let port = start_test_server(ServerConfig::default()).await;
    let project = ProjectId::generate();

    let alice =
        CollabSession::spawn(test_sync_config(port), project, UserInfo::new("Alice")).unwrap();
    let mut alice_events = alice.events();
    connect_and_resync(&alice, &mut alice_events).await;

    let bob = CollabSession::spawn(test_sync_config(port), project, UserInfo::new("Bob")).unwrap();
    let mut bob_events = bob.events();
    connect_and_resync(&bob, &mut bob_events).await;

    send_chat(&alice, "m1", "before the drop").await;
    wait_for_ack(&alice, 1).await;

    // Alice steps away; Bob keeps talking.
    alice.disconnect().await.unwrap();
    send_chat(&bob, "m2", "while you were gone").await;
    send_chat(&bob, "m3", "still here").await;
    wait_for_ack(&bob, 2).await;

    // Her watermark is 1, the server is at 3: a plain delta, no reset.
    let (_, resets) = connect_and_resync(&alice, &mut alice_events).await;
    assert_eq!(resets, 0, "short absence must not force a reset");

    let view = alice.snapshot(chat()).await.unwrap();
    assert_eq!(view.len(), 3);
    let seqs: Vec<u64> = view.iter().filter_map(|(_, r)| r.server_seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_pruned_history_forces_reset_snapshot() {
    // Keep only the last two stamped mutations per collection.
    let config = ServerConfig {
        history_limit: Some(2),
        ..ServerConfig::default()
    };
    let port = start_test_server(config).await;
    let project = ProjectId::generate();

    let alice =
        CollabSession::spawn(test_sync_config(port), project, UserInfo::new("Alice")).unwrap();
    let mut alice_events = alice.events();
    connect_and_resync(&alice, &mut alice_events).await;

    let bob = CollabSession::spawn(test_sync_config(port), project, UserInfo::new("Bob")).unwrap();
    let mut bob_events = bob.events();
    connect_and_resync(&bob, &mut bob_events).await;

    send_chat(&alice, "m1", "first").await;
    wait_for_ack(&alice, 1).await;
    alice.disconnect().await.unwrap();

    // Four more stamps while Alice is away; the retained window slides
    // past her watermark of 1.
    for i in 2..=5 {
        send_chat(&bob, &format!("m{i}"), "keeps moving").await;
    }
    wait_for_ack(&bob, 4).await;

    let (_, resets) = connect_and_resync(&alice, &mut alice_events).await;
    assert!(resets >= 1, "pruned history must force a reset");

    // The reset snapshot still carries the full live state.
    let alice_view = alice.snapshot(chat()).await.unwrap();
    let bob_view = bob.snapshot(chat()).await.unwrap();
    assert_eq!(alice_view.len(), 5);
    assert_eq!(alice_view, bob_view);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_empty_project_reconnect_resets_to_server_truth() {
    let port = start_test_server(ServerConfig::default()).await;
    let project = ProjectId::generate();

    let alice =
        CollabSession::spawn(test_sync_config(port), project, UserInfo::new("Alice")).unwrap();
    let mut events = alice.events();
    connect_and_resync(&alice, &mut events).await;

    send_chat(&alice, "m1", "anyone here?").await;
    wait_for_ack(&alice, 1).await;

    // Last member out: the server drops the project space entirely.
    alice.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Her watermark now exceeds everything the fresh project knows, so
    // the resync comes back as a reset to the (empty) server truth.
    let (_, resets) = connect_and_resync(&alice, &mut events).await;
    assert!(resets >= 1);
    assert!(
        alice.snapshot(chat()).await.unwrap().is_empty(),
        "local state must mirror the authority after reset"
    );

    alice.close().await;
}

#[tokio::test]
async fn test_reconnect_from_terminal_renumbers_pending() {
    let port = start_test_server(ServerConfig::default()).await;
    let project = ProjectId::generate();

    let alice =
        CollabSession::spawn(test_sync_config(port), project, UserInfo::new("Alice")).unwrap();
    let mut events = alice.events();
    connect_and_resync(&alice, &mut events).await;

    // Bob holds the project open across Alice's absence.
    let bob = CollabSession::spawn(test_sync_config(port), project, UserInfo::new("Bob")).unwrap();
    let mut bob_events = bob.events();
    connect_and_resync(&bob, &mut bob_events).await;

    send_chat(&alice, "m1", "first life").await;
    wait_for_ack(&alice, 1).await;
    let first_session = alice.stats().await.unwrap().session;

    alice.disconnect().await.unwrap();

    // Edits made in terminal disconnect queue up against the next life.
    send_chat(&alice, "m2", "written offline").await;
    assert_eq!(alice.stats().await.unwrap().pending_mutations, 1);

    connect_and_resync(&alice, &mut events).await;
    let stats = alice.stats().await.unwrap();
    assert_ne!(stats.session, first_session, "terminal reconnect rotates the session id");

    wait_for_ack(&alice, 1).await;
    let view = alice.snapshot(chat()).await.unwrap();
    assert_eq!(view.len(), 2);
    assert!(view.iter().all(|(_, r)| r.server_seq.is_some()));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_explicit_refresh_rebuilds_from_server_truth() {
    let port = start_test_server(ServerConfig::default()).await;
    let project = ProjectId::generate();

    let alice =
        CollabSession::spawn(test_sync_config(port), project, UserInfo::new("Alice")).unwrap();
    let mut alice_events = alice.events();
    connect_and_resync(&alice, &mut alice_events).await;

    let bob = CollabSession::spawn(test_sync_config(port), project, UserInfo::new("Bob")).unwrap();
    let mut bob_events = bob.events();
    connect_and_resync(&bob, &mut bob_events).await;

    send_chat(&alice, "m1", "first").await;
    send_chat(&alice, "m2", "second").await;
    wait_for_ack(&alice, 2).await;

    // Bob asks for the chat log whole; his watermark is current, so only
    // the explicit request can force the reset.
    bob.refresh(vec![chat()]).await.unwrap();
    let resets = timeout(Duration::from_secs(3), async {
        loop {
            match bob_events.recv().await {
                Ok(SessionEvent::Resynced { reset_collections, .. }) => break reset_collections,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended before the refresh completed: {e}"),
            }
        }
    })
    .await
    .expect("refresh should complete");
    assert_eq!(resets, 1, "an explicit refresh is served as a reset snapshot");

    let view = bob.snapshot(chat()).await.unwrap();
    let seqs: Vec<u64> = view.iter().filter_map(|(_, r)| r.server_seq).collect();
    assert_eq!(seqs, vec![1, 2]);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_user_connect_during_backoff_retries_immediately() {
    let project = ProjectId::generate();

    // Long retry delay so the test controls the timing.
    let mut config = test_sync_config(1);
    config.reconnect.base_delay_ms = 30_000;
    config.reconnect.max_delay_ms = 60_000;
    config.connect_timeout = Duration::from_millis(400);
    let alice = CollabSession::spawn(config, project, UserInfo::new("Alice")).unwrap();

    // Nothing listens on port 1; the first dial fails into backoff.
    assert!(alice.connect().await.is_err());
    assert_eq!(
        alice.connection_state().await.unwrap(),
        arxis_collab::transport::ConnectionState::Reconnecting
    );

    // A user-triggered connect pre-empts the pending timer and fails
    // fast again instead of waiting out the 30 s delay.
    let started = std::time::Instant::now();
    assert!(alice.connect().await.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));

    alice.close().await;
}
