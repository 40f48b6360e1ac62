//! Full-mesh voice channels over WebRTC
//!
//! Every member of a voice channel holds one peer connection to every other
//! member. Connections are negotiated through a shared signaling store:
//! the newcomer offers to everyone already present, existing members
//! answer, and both sides trade ICE candidates through sub-collections of
//! the pair's negotiation record.
//!
//! # Architecture
//!
//! ```text
//! VoiceClient ──commands──▶ engine task ──▶ ConnectionsState (reducer)
//!                              ▲   │
//!          SignalEvent ────────┘   └──▶ TransportSession ──▶ PeerTransport
//!   (offer/answer/candidate/roster watchers)                   (webrtc)
//! ```
//!
//! - [`transport`]: one [`TransportSession`] per peer, wrapping a
//!   [`PeerTransport`](transport::PeerTransport)
//! - [`signaling`]: negotiation records and store watchers
//! - [`state`]: the connection-state reducer and its read-only view
//! - [`membership`]: channel roster reads and writes
//! - [`speaking`]: best-effort speaking detection for highlighting
//! - [`engine`]: the actor that wires them together
//!
//! # Example
//!
//! ```no_run
//! use meshcall_voice::{
//!     SyntheticMediaDevices, VoiceClient, VoiceMeshConfig, VoiceUser, WebRtcConnector,
//! };
//! use signaling_store::InMemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> meshcall_voice::Result<()> {
//! let client = VoiceClient::spawn(
//!     VoiceMeshConfig::default(),
//!     VoiceUser::new("alice", "Alice")?,
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(WebRtcConnector::new()),
//!     Arc::new(SyntheticMediaDevices::silent()),
//! )?;
//!
//! client.join_voice_channel("server-1", "lounge").await?;
//! println!("{:?}", client.view().sessions);
//! client.leave_voice_channel().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod membership;
pub mod signaling;
pub mod speaking;
pub mod state;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use channel::ChannelRef;
pub use config::{IceConfig, SpeakingConfig, TurnServerConfig, VoiceMeshConfig};
pub use engine::VoiceClient;
pub use error::{Error, Result};
pub use media::{DeviceMode, MediaDevices, MediaStream, MediaTrack, SyntheticMediaDevices};
pub use membership::{MembershipTracker, VoiceUser};
pub use signaling::{record_id, NegotiationRecord, SignalEvent};
pub use speaking::SpeakingMonitor;
pub use state::{ConnectionPhase, ConnectionsView};
pub use transport::{
    PeerConnector, PeerTransport, SessionInfo, SessionLifecycle, SessionRole, TransportSession,
    WebRtcConnector,
};
