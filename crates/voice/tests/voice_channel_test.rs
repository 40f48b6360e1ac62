//! Voice channel end-to-end tests
//!
//! Several engines share one in-memory signaling store and negotiate
//! through it with scripted transports.
//!
//! ## Scenarios
//!
//! 1. Joining an empty channel creates no sessions
//! 2. Joining next to existing members offers to each of them
//! 3. An inbound offer is answered on the same record
//! 4. Departures remove exactly the departed peer's session
//! 5. Leaving mid-negotiation cleans up every record

mod harness;

use async_trait::async_trait;
use harness::{Mesh, CHANNEL, SERVER};
use meshcall_voice::signaling::record_id;
use meshcall_voice::testing::MockConnector;
use meshcall_voice::transport::SessionDescription;
use meshcall_voice::{
    ConnectionPhase, Error, MediaDevices, MediaStream, SessionRole, VoiceClient, VoiceMeshConfig,
    VoiceUser,
};
use signaling_store::StoreOperation;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

/// Microphone whose permission prompt is never answered
struct UnansweredPrompt;

#[async_trait]
impl MediaDevices for UnansweredPrompt {
    async fn acquire_audio_stream(&self) -> meshcall_voice::Result<MediaStream> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_join_empty_channel() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");

    alice.join().await.unwrap();

    let view = alice.view();
    assert_eq!(view.phase, ConnectionPhase::Connected);
    assert_eq!(view.channel.as_ref().map(|c| c.channel_id()), Some(CHANNEL));
    assert!(view.sessions.is_empty());
    assert!(view.members.is_empty());
    assert!(alice.connector.opened().is_empty());
    assert_eq!(mesh.roster().await, vec!["alice"]);
}

#[tokio::test]
async fn test_join_offers_to_existing_members() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");
    let carol = mesh.member("carol");

    alice.join().await.unwrap();
    bob.join().await.unwrap();
    carol.join().await.unwrap();

    let view = carol.view();
    assert_eq!(view.sessions.len(), 2);
    assert!(view.sessions.iter().all(|s| s.role == SessionRole::Offerer));
    assert_eq!(view.peers(), vec!["alice", "bob"]);

    for peer in ["alice", "bob"] {
        let record = mesh
            .records()
            .record_for("carol", peer)
            .read()
            .await
            .unwrap()
            .expect("record exists");
        assert_eq!(record.id(), record_id("carol", peer));
        assert_eq!(record.offer_user, "carol");
        assert_eq!(record.answer_user, peer);
        assert!(record.offer.is_some());
    }

    carol.wait_connected_to(&["alice", "bob"]).await;
    alice.wait_connected_to(&["bob", "carol"]).await;
    bob.wait_connected_to(&["alice", "carol"]).await;

    let alice_view = alice.view();
    assert_eq!(alice_view.session_for("carol").unwrap().role, SessionRole::Answerer);
    assert_eq!(alice_view.members.len(), 2);
}

#[tokio::test]
async fn test_inbound_offer_is_answered() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    alice.join().await.unwrap();

    // A foreign client offers to alice directly through the store
    let record = mesh.records().record_for("zed", "alice");
    assert!(record.claim("zed", "alice").await.unwrap());
    record
        .write_offer(&SessionDescription::offer("v=0 zed"))
        .await
        .unwrap();

    let view = alice
        .wait_for("answerer session for zed", |view| view.session_for("zed").is_some())
        .await;
    assert_eq!(view.session_for("zed").unwrap().role, SessionRole::Answerer);
    assert_eq!(view.session_for("zed").unwrap().record_id, record.id());

    let snapshot = record.read().await.unwrap().unwrap();
    assert!(snapshot.answered_for("zed").is_some());

    let transport = &alice.connector.opened()[0];
    assert_eq!(
        transport.remote_description(),
        Some(SessionDescription::offer("v=0 zed"))
    );
}

#[tokio::test]
async fn test_departure_removes_only_that_peer() {
    let mesh = Mesh::new();
    let me = mesh.member("me");
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");

    me.join().await.unwrap();
    alice.join().await.unwrap();
    bob.join().await.unwrap();
    let before = me.wait_connected_to(&["alice", "bob"]).await;
    let bob_record = before.session_for("bob").unwrap().record_id.clone();

    alice.leave().await.unwrap();

    let view = me.wait_for("alice gone", |view| view.session_for("alice").is_none()).await;
    assert_eq!(view.peers(), vec!["bob"]);
    assert_eq!(view.session_for("bob").unwrap().record_id, bob_record);
    assert_eq!(me.connector.live().len(), 1);
    assert!(view.members.iter().all(|m| m.uid != "alice"));
    assert!(alice.all_capture_stopped());
}

#[tokio::test]
async fn test_one_of_three_peers_departs() {
    let mesh = Mesh::new();
    let me = mesh.member("me");
    let peers: Vec<_> = ["p1", "p2", "p3"].iter().map(|uid| mesh.member(uid)).collect();

    me.join().await.unwrap();
    for peer in &peers {
        peer.join().await.unwrap();
    }
    me.wait_connected_to(&["p1", "p2", "p3"]).await;

    peers[1].leave().await.unwrap();

    let view = me.wait_for("two sessions", |view| view.sessions.len() == 2).await;
    assert_eq!(view.peers(), vec!["p1", "p3"]);

    let closed: Vec<_> = me
        .connector
        .opened()
        .into_iter()
        .filter(|t| t.close_calls() > 0)
        .collect();
    assert_eq!(closed.len(), 1);
}

#[tokio::test]
async fn test_leave_while_connecting() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let me = mesh.member("me");

    alice.join().await.unwrap();
    // Alice can never answer, so the session stays mid-negotiation
    alice.devices.deny_next(1);

    me.join().await.unwrap();
    let view = me.view();
    assert_eq!(view.sessions.len(), 1);
    assert_ne!(
        view.sessions[0].lifecycle,
        meshcall_voice::SessionLifecycle::Connected
    );

    assert_ok!(me.leave().await);

    assert!(mesh.records_involving("me").await.is_empty());
    assert!(me.view().sessions.is_empty());
    assert_eq!(me.view().phase, ConnectionPhase::Idle);
    assert!(me.all_capture_stopped());
    assert!(me.connector.live().is_empty());
    assert_eq!(mesh.roster().await, vec!["alice"]);
}

#[tokio::test]
async fn test_leave_is_idempotent() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");
    alice.join().await.unwrap();
    bob.join().await.unwrap();
    bob.wait_connected_to(&["alice"]).await;

    assert_ok!(bob.leave().await);
    assert_ok!(bob.leave().await);

    assert!(bob.all_capture_stopped());
    assert!(bob.connector.opened().iter().all(|t| t.close_calls() == 1));
    assert!(mesh.records_involving("bob").await.is_empty());
}

#[tokio::test]
async fn test_leave_reports_cleanup_failures() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");
    alice.join().await.unwrap();
    bob.join().await.unwrap();
    bob.wait_connected_to(&["alice"]).await;

    mesh.store
        .fail_matching(StoreOperation::Delete, "/connections/", 1);
    let err = assert_err!(bob.leave().await);
    assert!(matches!(err, Error::Disconnect(_)));
    assert!(err.to_string().starts_with("failed to disconnect from voice channel"));

    // Local state is cleared regardless
    let view = bob.view();
    assert_eq!(view.phase, ConnectionPhase::Idle);
    assert!(view.sessions.is_empty());
    assert!(bob.all_capture_stopped());
    assert_eq!(mesh.roster().await, vec!["alice"]);
}

#[tokio::test]
async fn test_media_denied_aborts_join() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");
    alice.join().await.unwrap();

    bob.devices.deny_next(1);
    let err = assert_err!(bob.join().await);
    assert!(matches!(err, Error::MediaAcquisition(_)));

    assert_eq!(bob.view().phase, ConnectionPhase::Idle);
    assert!(bob.view().sessions.is_empty());
    assert!(mesh.records_involving("bob").await.is_empty());
    assert_eq!(mesh.roster().await, vec!["alice"]);

    // A later attempt succeeds
    bob.join().await.unwrap();
    bob.wait_connected_to(&["alice"]).await;
}

#[tokio::test]
async fn test_roster_write_is_retried_once() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");

    mesh.store.fail_next(StoreOperation::Set, 1);
    alice.join().await.unwrap();
    assert_eq!(mesh.roster().await, vec!["alice"]);

    let bob = mesh.member("bob");
    mesh.store.fail_next(StoreOperation::ArrayUnion, 2);
    let err = assert_err!(bob.join().await);
    assert!(matches!(err, Error::SignalingWrite { .. }));
    assert_eq!(bob.view().phase, ConnectionPhase::Idle);
    assert_eq!(mesh.roster().await, vec!["alice"]);
}

#[tokio::test]
async fn test_full_channel_is_refused() {
    let mesh = Mesh::new();
    let config = VoiceMeshConfig {
        channel_capacity: 2,
        ..Default::default()
    };
    let alice = mesh.member_with("alice", config.clone());
    let bob = mesh.member_with("bob", config.clone());
    let carol = mesh.member_with("carol", config);

    alice.join().await.unwrap();
    bob.join().await.unwrap();

    let err = assert_err!(carol.join().await);
    assert!(matches!(err, Error::ChannelFull { capacity: 2, .. }));
    assert_eq!(carol.view().phase, ConnectionPhase::Idle);
    assert_eq!(mesh.roster().await, vec!["alice", "bob"]);
    assert!(carol.connector.opened().is_empty());
}

#[tokio::test]
async fn test_mute_applies_to_every_local_track() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");
    alice.join().await.unwrap();
    bob.join().await.unwrap();
    bob.wait_connected_to(&["alice"]).await;

    bob.client.set_muted(true).await.unwrap();
    assert!(bob.view().muted);

    // Sessions created after muting start muted
    let carol = mesh.member("carol");
    carol.join().await.unwrap();
    bob.wait_connected_to(&["alice", "carol"]).await;

    let streams = bob.devices.acquired_streams();
    assert_eq!(streams.len(), 2);
    for stream in &streams {
        assert!(stream.tracks().iter().all(|t| !t.is_enabled()));
    }

    bob.client.set_muted(false).await.unwrap();
    for stream in &streams {
        assert!(stream.tracks().iter().all(|t| t.is_enabled()));
    }
}

#[tokio::test]
async fn test_simultaneous_join_settles_on_one_record() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");

    let (a, b) = tokio::join!(alice.join(), bob.join());
    a.unwrap();
    b.unwrap();

    let alice_view = alice.wait_connected_to(&["bob"]).await;
    let bob_view = bob.wait_connected_to(&["alice"]).await;

    let alice_role = alice_view.session_for("bob").unwrap().role;
    let bob_role = bob_view.session_for("alice").unwrap().role;
    assert_ne!(alice_role, bob_role);
    assert_eq!(mesh.records_involving("alice").await, vec![record_id("alice", "bob")]);
}

#[tokio::test]
async fn test_incoming_level_marks_peer_speaking() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");
    alice.join().await.unwrap();
    bob.join().await.unwrap();
    bob.wait_connected_to(&["alice"]).await;

    bob.connector.opened()[0].set_inbound_level(Some(0.05));
    bob.wait_for("alice speaking", |view| view.is_speaking("alice")).await;

    bob.connector.opened()[0].set_inbound_level(Some(0.0));
    bob.wait_for("alice quiet", |view| !view.is_speaking("alice")).await;
}

#[tokio::test]
async fn test_switching_channels_leaves_the_first() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");
    alice.join().await.unwrap();
    bob.join().await.unwrap();
    bob.wait_connected_to(&["alice"]).await;

    bob.client.join_voice_channel(SERVER, "other").await.unwrap();

    let view = bob.view();
    assert_eq!(view.channel.as_ref().map(|c| c.channel_id()), Some("other"));
    assert!(view.sessions.is_empty());
    assert_eq!(mesh.roster().await, vec!["alice"]);
    alice.wait_for("bob gone", |view| view.sessions.is_empty()).await;
}

#[tokio::test]
async fn test_shutdown_leaves_channel() {
    let mesh = Mesh::new();
    let alice = mesh.member("alice");
    let bob = mesh.member("bob");
    alice.join().await.unwrap();
    bob.join().await.unwrap();
    bob.wait_connected_to(&["alice"]).await;

    bob.client.shutdown().await.unwrap();

    assert!(!bob.client.is_running());
    assert!(bob.all_capture_stopped());
    assert!(matches!(bob.leave().await, Err(Error::EngineStopped)));
    assert_eq!(mesh.roster().await, vec!["alice"]);
}

#[tokio::test]
async fn test_leave_does_not_wait_for_capture() {
    let mesh = Mesh::new();
    let connector = Arc::new(MockConnector::new());
    let client = VoiceClient::spawn(
        VoiceMeshConfig::default(),
        VoiceUser::new("alice", "Alice").unwrap(),
        Arc::new(mesh.store.clone()),
        connector.clone(),
        Arc::new(UnansweredPrompt),
    )
    .unwrap();
    client.join_voice_channel(SERVER, CHANNEL).await.unwrap();

    // Alice starts answering and blocks on the microphone
    let record = mesh.records().record_for("zed", "alice");
    assert!(record.claim("zed", "alice").await.unwrap());
    record
        .write_offer(&SessionDescription::offer("v=0 zed"))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let left = timeout(Duration::from_secs(3), client.leave_voice_channel())
        .await
        .expect("leave finishes while capture is pending");
    assert_ok!(left);

    assert_eq!(client.view().phase, ConnectionPhase::Idle);
    assert!(client.view().sessions.is_empty());
    assert!(connector.opened().is_empty());
    assert!(mesh.records_involving("alice").await.is_empty());
    assert!(mesh.roster().await.is_empty());

    timeout(Duration::from_secs(3), client.shutdown())
        .await
        .expect("shutdown finishes")
        .unwrap();
}
