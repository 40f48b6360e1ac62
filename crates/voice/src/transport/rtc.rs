//! `webrtc` crate backed peer transport
//!
//! Each transport owns one `RTCPeerConnection` with Opus audio and the
//! RFC 6464 client-to-mixer audio level header extension negotiated, so the
//! receiving side can read per-packet levels without decoding audio.

use super::{
    IceCandidate, LocalCandidateHandler, PeerConnector, PeerTransport, RemoteTrackHandler, SdpType,
    SessionDescription, TransportState,
};
use crate::config::IceConfig;
use crate::media::level::{dbov_to_linear, SILENCE_DBOV};
use crate::media::{MediaSample, MediaStream, MediaTrack};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::extension::audio_level_extension::AudioLevelExtension;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// RFC 6464 header extension URI
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

/// Inbound levels older than this are treated as silence
const LEVEL_STALE_AFTER: Duration = Duration::from_millis(1000);

type SharedRemoteTrackHandler = Arc<Mutex<Option<Arc<dyn Fn(MediaTrack) + Send + Sync>>>>;
type SharedCandidateHandler = Arc<Mutex<Option<Arc<dyn Fn(IceCandidate) + Send + Sync>>>>;

/// Opens [`WebRtcTransport`]s
#[derive(Debug, Clone, Default)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(&self, ice: &IceConfig) -> Result<Arc<dyn PeerTransport>> {
        Ok(Arc::new(WebRtcTransport::new(ice).await?))
    }
}

/// WebRTC peer connection carrying one bidirectional audio stream
pub struct WebRtcTransport {
    id: String,
    peer_connection: Arc<RTCPeerConnection>,
    state: Arc<RwLock<TransportState>>,
    /// Latest linear level read from the inbound audio-level extension
    inbound_level: Arc<Mutex<Option<(f64, Instant)>>>,
    remote_track_handler: SharedRemoteTrackHandler,
    candidate_handler: SharedCandidateHandler,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    closed: AtomicBool,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

impl WebRtcTransport {
    /// Create a new peer connection
    ///
    /// # Arguments
    ///
    /// * `ice` - STUN/TURN servers and candidate pool size
    #[instrument(skip(ice))]
    pub async fn new(ice: &IceConfig) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();

        // Opus plus the audio level extension; video is never negotiated
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;
        media_engine
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: AUDIO_LEVEL_URI.to_string(),
                },
                RTPCodecType::Audio,
                None,
            )
            .map_err(|e| {
                Error::WebRtc(format!("Failed to register audio level extension: {}", e))
            })?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtc(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(ice.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: ice.ice_candidate_pool_size,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(
            |e| Error::PeerConnection(format!("Failed to create peer connection: {}", e)),
        )?);

        let transport = Self {
            id,
            peer_connection,
            state: Arc::new(RwLock::new(TransportState::New)),
            inbound_level: Arc::new(Mutex::new(None)),
            remote_track_handler: Arc::new(Mutex::new(None)),
            candidate_handler: Arc::new(Mutex::new(None)),
            tasks: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        };
        transport.install_callbacks();

        info!("Created peer connection {}", transport.id);
        Ok(transport)
    }

    fn install_callbacks(&self) {
        let state = Arc::clone(&self.state);
        let id = self.id.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                if let Some(new_state) = map_state(s) {
                    let mut guard = state.write();
                    if *guard != new_state {
                        debug!("Peer {} state transition: {:?} -> {:?}", id, *guard, new_state);
                        *guard = new_state;
                    }
                }
                Box::pin(async {})
            }));

        let candidate_handler = Arc::clone(&self.candidate_handler);
        let id = self.id.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` marks the end of gathering
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let handler = candidate_handler.lock().clone();
                            if let Some(handler) = handler {
                                handler(IceCandidate::from(init));
                            }
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate for {}: {}", id, e),
                    }
                }
                Box::pin(async {})
            }));

        let remote_track_handler = Arc::clone(&self.remote_track_handler);
        let inbound_level = Arc::clone(&self.inbound_level);
        let tasks = Arc::clone(&self.tasks);
        let id = self.id.clone();
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let remote_track_handler = Arc::clone(&remote_track_handler);
                let inbound_level = Arc::clone(&inbound_level);
                let tasks = Arc::clone(&tasks);
                let id = id.clone();

                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        debug!("Ignoring non-audio track on {}", id);
                        return;
                    }

                    let remote = MediaTrack::new(track.id(), format!("remote audio {}", id));
                    let handler = remote_track_handler.lock().clone();
                    if let Some(handler) = handler {
                        handler(remote.clone());
                    }

                    let extension_id = receiver
                        .get_parameters()
                        .await
                        .header_extensions
                        .iter()
                        .find(|ext| ext.uri == AUDIO_LEVEL_URI)
                        .and_then(|ext| u8::try_from(ext.id).ok());

                    info!("Remote audio track on {} (audio level ext: {:?})", id, extension_id);
                    let reader = tokio::spawn(read_remote_audio(
                        id,
                        track,
                        remote,
                        extension_id,
                        inbound_level,
                    ));
                    tasks.lock().push(reader);
                })
            },
        ));
    }
}

/// Pump RTP from a remote track into its media handle and level slot
async fn read_remote_audio(
    id: String,
    track: Arc<TrackRemote>,
    remote: MediaTrack,
    extension_id: Option<u8>,
    inbound_level: Arc<Mutex<Option<(f64, Instant)>>>,
) {
    loop {
        let (packet, _) = match track.read_rtp().await {
            Ok(packet) => packet,
            Err(e) => {
                debug!("RTP read ended for {}: {}", id, e);
                break;
            }
        };
        if remote.is_stopped() {
            break;
        }

        let level = extension_id
            .and_then(|ext| packet.header.get_extension(ext))
            .and_then(|payload| payload.first().copied());
        if let Some(level) = level {
            *inbound_level.lock() = Some((dbov_to_linear(level), Instant::now()));
        }

        remote.push_sample(MediaSample {
            data: packet.payload.clone(),
            duration: Duration::from_millis(20),
            audio_level: level.map_or(127, |l| l & 0x7F),
        });
    }
}

/// Forward captured samples of one local track to its RTP sender
async fn pump_local_audio(id: String, track: MediaTrack, local: Arc<TrackLocalStaticSample>) {
    let mut samples = track.subscribe_samples();
    loop {
        let sample = match samples.recv().await {
            Ok(sample) => sample,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Local audio pump on {} skipped {} samples", id, skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if track.is_stopped() {
            break;
        }

        // Muted tracks send silence
        let (data, level) = if track.is_enabled() {
            (sample.data, sample.audio_level)
        } else {
            (bytes::Bytes::from_static(&[0xF8, 0xFF, 0xFE]), SILENCE_DBOV)
        };

        let result = local
            .sample_writer()
            .with_audio_level(AudioLevelExtension {
                level,
                voice: level < SILENCE_DBOV,
            })
            .write_sample(&Sample {
                data,
                duration: sample.duration,
                ..Default::default()
            })
            .await;
        if let Err(e) = result {
            debug!("Failed to write audio sample on {}: {}", id, e);
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_local_stream(&self, stream: &MediaStream) -> Result<()> {
        for track in stream.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                track.id().to_string(),
                stream.id().to_string(),
            ));

            let sender = self
                .peer_connection
                .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to add audio track: {}", e)))?;

            // Drain RTCP so interceptors keep running
            let rtcp = tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
            let pump = tokio::spawn(pump_local_audio(self.id.clone(), track, local));
            self.tasks.lock().extend([rtcp, pump]);
        }

        debug!("Local stream {} attached to {}", stream.id(), self.id);
        Ok(())
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        *self.remote_track_handler.lock() = Some(Arc::from(handler));
    }

    fn on_local_candidate(&self, handler: LocalCandidateHandler) {
        *self.candidate_handler.lock() = Some(Arc::from(handler));
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {}", e)))?;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("No local description after setting offer".to_string()))?;

        debug!("Created SDP offer on {}", self.id);
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {}", e)))?;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("No local description after setting answer".to_string()))?;

        debug!("Created SDP answer on {}", self.id);
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| Error::Sdp(format!("Failed to parse remote description: {}", e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set remote description: {}", e)))?;

        debug!("Remote {:?} applied on {}", description.sdp_type, self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        debug!("Adding ICE candidate on {}: {}", self.id, candidate.candidate);
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::IceCandidate(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn inbound_audio_level(&self) -> Option<f64> {
        let (level, at) = (*self.inbound_level.lock())?;
        if at.elapsed() > LEVEL_STALE_AFTER {
            return Some(0.0);
        }
        Some(level)
    }

    fn state(&self) -> TransportState {
        *self.state.read()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing peer connection {}", self.id);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.state.write() = TransportState::Closed;

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to close connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_conversion() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let candidate = IceCandidate::from(init.clone());
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));

        let back: RTCIceCandidateInit = candidate.into();
        assert_eq!(back.candidate, init.candidate);
        assert_eq!(back.sdp_mline_index, Some(0));
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(TransportState::Connected)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Unspecified),
            None
        );
    }

    #[tokio::test]
    async fn test_transport_creation() {
        let transport = WebRtcTransport::new(&IceConfig::default()).await.unwrap();
        assert_eq!(transport.state(), TransportState::New);
        assert_eq!(transport.inbound_audio_level().await, None);
    }

    #[tokio::test]
    async fn test_local_offer_answer_exchange() {
        let ice = IceConfig::default();
        let offerer = WebRtcTransport::new(&ice).await.unwrap();
        let answerer = WebRtcTransport::new(&ice).await.unwrap();

        let stream = MediaStream::new();
        stream.add_track(MediaTrack::new("mic", "test microphone"));
        offerer.add_local_stream(&stream).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("opus"));

        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        offerer.set_remote_description(answer).await.unwrap();

        offerer.close().await.unwrap();
        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
        assert_eq!(offerer.state(), TransportState::Closed);
    }
}
