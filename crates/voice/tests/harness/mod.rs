//! Shared setup for voice engine integration tests
//!
//! Every member runs a real engine against one shared in-memory store,
//! with scripted transports and silent synthetic microphones.

#![allow(dead_code)]

use meshcall_voice::testing::MockConnector;
use meshcall_voice::{
    ChannelRef, ConnectionsView, SyntheticMediaDevices, VoiceClient, VoiceMeshConfig, VoiceUser,
};
use meshcall_voice::signaling::RecordCollection;
use signaling_store::InMemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const SERVER: &str = "s1";
pub const CHANNEL: &str = "general";

/// How long to wait for the mesh to converge
pub const SETTLE: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,meshcall_voice=debug")
        .with_test_writer()
        .try_init();
}

/// One simulated user
pub struct Member {
    pub uid: String,
    pub client: VoiceClient,
    pub connector: Arc<MockConnector>,
    pub devices: Arc<SyntheticMediaDevices>,
}

impl Member {
    pub async fn join(&self) -> meshcall_voice::Result<()> {
        self.client.join_voice_channel(SERVER, CHANNEL).await
    }

    pub async fn leave(&self) -> meshcall_voice::Result<()> {
        self.client.leave_voice_channel().await
    }

    pub fn view(&self) -> ConnectionsView {
        self.client.view()
    }

    /// Wait until the published view satisfies `predicate`
    pub async fn wait_for<F>(&self, what: &str, predicate: F) -> ConnectionsView
    where
        F: Fn(&ConnectionsView) -> bool,
    {
        let mut views = self.client.subscribe();
        let waited = timeout(SETTLE, async {
            loop {
                {
                    let view = views.borrow_and_update();
                    if predicate(&view) {
                        return view.clone();
                    }
                }
                if views.changed().await.is_err() {
                    panic!("{}: engine stopped while waiting for {}", self.uid, what);
                }
            }
        })
        .await;

        match waited {
            Ok(view) => view,
            Err(_) => panic!(
                "{}: timed out waiting for {}; last view {:?}",
                self.uid,
                what,
                self.client.view()
            ),
        }
    }

    /// Wait until every peer in `peers` has a connected session
    pub async fn wait_connected_to(&self, peers: &[&str]) -> ConnectionsView {
        let mut expected: Vec<&str> = peers.to_vec();
        expected.sort_unstable();
        self.wait_for(&format!("connected to {:?}", expected), |view| {
            view.peers() == expected
                && view
                    .sessions
                    .iter()
                    .all(|s| s.lifecycle == meshcall_voice::SessionLifecycle::Connected)
        })
        .await
    }

    /// Every stream this member's microphone handed out
    pub fn all_capture_stopped(&self) -> bool {
        self.devices
            .acquired_streams()
            .iter()
            .all(|stream| stream.all_stopped())
    }
}

/// A shared store plus helpers to inspect it
pub struct Mesh {
    pub store: InMemoryStore,
    pub channel: ChannelRef,
}

impl Mesh {
    pub fn new() -> Self {
        init_logging();
        Self {
            store: InMemoryStore::new(),
            channel: ChannelRef::new(SERVER, CHANNEL).expect("valid channel"),
        }
    }

    pub fn member(&self, uid: &str) -> Member {
        self.member_with(uid, VoiceMeshConfig::default())
    }

    pub fn member_with(&self, uid: &str, config: VoiceMeshConfig) -> Member {
        let connector = Arc::new(MockConnector::new());
        let devices = Arc::new(SyntheticMediaDevices::silent());
        let client = VoiceClient::spawn(
            config,
            VoiceUser::new(uid, &uid.to_uppercase()).expect("valid uid"),
            Arc::new(self.store.clone()),
            connector.clone(),
            devices.clone(),
        )
        .expect("engine starts");

        Member {
            uid: uid.to_string(),
            client,
            connector,
            devices,
        }
    }

    pub fn records(&self) -> RecordCollection {
        RecordCollection::new(Arc::new(self.store.clone()), &self.channel)
    }

    /// Ids of records naming `uid` as offerer or answerer
    pub async fn records_involving(&self, uid: &str) -> Vec<String> {
        self.records()
            .involving(uid)
            .await
            .expect("list records")
            .iter()
            .map(|r| r.id().to_string())
            .collect()
    }

    /// Uids with a presence record
    pub async fn roster(&self) -> Vec<String> {
        self.store
            .paths_under(&self.channel.roster_path())
            .iter()
            .map(|p| p.id().to_string())
            .collect()
    }
}
