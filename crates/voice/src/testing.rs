//! Scripted transport for tests
//!
//! [`MockConnector`] hands out [`MockTransport`]s that complete every
//! negotiation step instantly, emit two host candidates per local
//! description and report `Connected` once both descriptions are applied.
//! Tests can inject open failures and inbound audio levels.

use crate::config::IceConfig;
use crate::media::{MediaStream, MediaTrack};
use crate::transport::{
    IceCandidate, LocalCandidateHandler, PeerConnector, PeerTransport, RemoteTrackHandler,
    SdpType, SessionDescription, TransportState,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Candidates emitted per local description
const CANDIDATES_PER_DESCRIPTION: u16 = 2;

/// Connector producing [`MockTransport`]s
#[derive(Default)]
pub struct MockConnector {
    opened: Mutex<Vec<Arc<MockTransport>>>,
    fail_next_open: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls to `open`
    pub fn fail_next_open(&self, times: usize) {
        self.fail_next_open.store(times, Ordering::SeqCst);
    }

    /// Every transport opened so far, in order
    pub fn opened(&self) -> Vec<Arc<MockTransport>> {
        self.opened.lock().clone()
    }

    /// Transports not yet closed
    pub fn live(&self) -> Vec<Arc<MockTransport>> {
        self.opened
            .lock()
            .iter()
            .filter(|t| t.close_calls() == 0)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn open(&self, ice: &IceConfig) -> Result<Arc<dyn PeerTransport>> {
        let fail = self
            .fail_next_open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::PeerConnection("injected open failure".to_string()));
        }
        ice.validate()?;

        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let transport = Arc::new(MockTransport::new(id));
        self.opened.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Instant, in-process peer transport
pub struct MockTransport {
    id: String,
    state: RwLock<TransportState>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    local_tracks: Mutex<Vec<MediaTrack>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    remote_track_fired: AtomicBool,
    on_remote_track: Mutex<Option<Arc<dyn Fn(MediaTrack) + Send + Sync>>>,
    on_local_candidate: Mutex<Option<Arc<dyn Fn(IceCandidate) + Send + Sync>>>,
    inbound_level: Mutex<Option<f64>>,
    close_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(TransportState::New),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            local_tracks: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            remote_track_fired: AtomicBool::new(false),
            on_remote_track: Mutex::new(None),
            on_local_candidate: Mutex::new(None),
            inbound_level: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Level reported by `inbound_audio_level`
    pub fn set_inbound_level(&self, level: Option<f64>) {
        *self.inbound_level.lock() = level;
    }

    pub fn set_state(&self, state: TransportState) {
        *self.state.write() = state;
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.local_tracks.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        *self.state.read() == TransportState::Closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerConnection(format!("{} is closed", self.id)));
        }
        Ok(())
    }

    fn commit_local(&self, description: SessionDescription) {
        *self.local_description.lock() = Some(description);
        self.emit_candidates();
        self.refresh_state();
    }

    fn emit_candidates(&self) {
        let Some(handler) = self.on_local_candidate.lock().clone() else {
            return;
        };
        for n in 1..=CANDIDATES_PER_DESCRIPTION {
            handler(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host",
                    n, n, n
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            });
        }
    }

    fn refresh_state(&self) {
        let both = self.local_description.lock().is_some() && self.remote_description.lock().is_some();
        let mut state = self.state.write();
        if *state == TransportState::Closed {
            return;
        }
        *state = if both {
            TransportState::Connected
        } else {
            TransportState::Connecting
        };
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_local_stream(&self, stream: &MediaStream) -> Result<()> {
        self.ensure_open()?;
        self.local_tracks.lock().extend(stream.tracks());
        Ok(())
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        *self.on_remote_track.lock() = Some(Arc::from(handler));
    }

    fn on_local_candidate(&self, handler: LocalCandidateHandler) {
        *self.on_local_candidate.lock() = Some(Arc::from(handler));
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let offer = SessionDescription::offer(format!("mock-offer-{}", self.id));
        self.commit_local(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let has_offer = self
            .remote_description
            .lock()
            .as_ref()
            .is_some_and(|d| d.sdp_type == SdpType::Offer);
        if !has_offer {
            return Err(Error::Sdp(format!("{} has no remote offer", self.id)));
        }
        let answer = SessionDescription::answer(format!("mock-answer-{}", self.id));
        self.commit_local(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        *self.remote_description.lock() = Some(description);

        if !self.remote_track_fired.swap(true, Ordering::SeqCst) {
            let handler = self.on_remote_track.lock().clone();
            if let Some(handler) = handler {
                handler(MediaTrack::new(
                    format!("{}-remote", self.id),
                    "remote audio",
                ));
            }
        }

        self.refresh_state();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if self.remote_description.lock().is_none() {
            return Err(Error::IceCandidate(format!(
                "{} received a candidate before its remote description",
                self.id
            )));
        }
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn inbound_audio_level(&self) -> Option<f64> {
        *self.inbound_level.lock()
    }

    fn state(&self) -> TransportState {
        *self.state.read()
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.write() = TransportState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_negotiation() {
        let connector = MockConnector::new();
        let offerer = connector.open(&IceConfig::default()).await.unwrap();
        let answerer = connector.open(&IceConfig::default()).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        assert_eq!(offerer.state(), TransportState::Connecting);
        assert!(answerer.create_answer().await.is_err());

        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answerer.state(), TransportState::Connected);

        offerer.set_remote_description(answer).await.unwrap();
        assert_eq!(offerer.state(), TransportState::Connected);
    }

    #[tokio::test]
    async fn test_mock_open_failure() {
        let connector = MockConnector::new();
        connector.fail_next_open(1);
        assert!(connector.open(&IceConfig::default()).await.is_err());
        assert!(connector.open(&IceConfig::default()).await.is_ok());
        assert_eq!(connector.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_candidates_require_remote_description() {
        let transport = MockTransport::new("t");
        let candidate = IceCandidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(transport.add_ice_candidate(candidate.clone()).await.is_err());

        transport
            .set_remote_description(SessionDescription::offer("o"))
            .await
            .unwrap();
        transport.add_ice_candidate(candidate).await.unwrap();
        assert_eq!(transport.remote_candidates().len(), 1);

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.close_calls(), 2);
        assert_eq!(transport.state(), TransportState::Closed);
    }
}
