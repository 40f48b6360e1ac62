//! Peer-to-peer transport abstraction
//!
//! [`PeerTransport`] is the seam between negotiation logic and the media
//! stack. The production implementation wraps a `webrtc` peer connection;
//! tests use a scripted one.

pub mod session;
pub mod rtc;

use crate::config::IceConfig;
use crate::media::{MediaStream, MediaTrack};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use rtc::{WebRtcConnector, WebRtcTransport};
pub use session::{OfferOutcome, SessionInfo, SessionLifecycle, SessionRole, TransportSession};

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as stored in a negotiation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate descriptor as stored in a candidate sub-collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Invoked once per remote track
pub type RemoteTrackHandler = Box<dyn Fn(MediaTrack) + Send + Sync>;

/// Invoked for every locally gathered ICE candidate
pub type LocalCandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;

/// One peer connection carrying a bidirectional audio stream
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Attach every track of a local stream for sending
    async fn add_local_stream(&self, stream: &MediaStream) -> Result<()>;

    fn on_remote_track(&self, handler: RemoteTrackHandler);

    fn on_local_candidate(&self, handler: LocalCandidateHandler);

    /// Create an offer and commit it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer and commit it locally
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Latest inbound audio level (linear, 0.0-1.0) from the remote source
    async fn inbound_audio_level(&self) -> Option<f64>;

    fn state(&self) -> TransportState;

    /// Close the connection; closing twice is not an error
    async fn close(&self) -> Result<()>;
}

/// Factory for peer transports
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(&self, ice: &IceConfig) -> Result<Arc<dyn PeerTransport>>;
}
