//! Transport sessions
//!
//! A [`TransportSession`] binds one peer transport to one negotiation
//! record. It owns exactly one local capture stream and one remote stream,
//! publishes its own ICE candidates to the record, and buffers remote
//! candidates until the remote description is applied.
//!
//! Teardown is split in two: [`TransportSession::release`] synchronously
//! stops both streams and silences the candidate pump, and
//! [`TransportSession::close`] additionally closes the transport. Both are
//! idempotent, and dropping a session releases it.

use super::{IceCandidate, PeerConnector, PeerTransport, SessionDescription, TransportState};
use crate::config::IceConfig;
use crate::media::{MediaDevices, MediaStream};
use crate::signaling::{NegotiationRecord, NegotiationRecordRef, RecordCollection};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use signaling_store::SignalingStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Which side of the offer/answer exchange this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Offerer,
    Answerer,
}

/// Coarse session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionLifecycle {
    /// Transport created, no description exchanged yet
    Open,
    /// At least one description applied, transport not yet connected
    Negotiating,
    Connected,
    Closed,
}

/// Read-only session summary for rendering
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub record_id: String,
    pub peer_uid: String,
    pub role: SessionRole,
    pub lifecycle: SessionLifecycle,
}

/// Collaborators every session needs
pub struct SessionContext {
    pub store: Arc<dyn SignalingStore>,
    pub connector: Arc<dyn PeerConnector>,
    pub devices: Arc<dyn MediaDevices>,
    pub ice: IceConfig,
    pub self_uid: String,
}

/// Result of offering to a peer
pub enum OfferOutcome {
    Created(TransportSession),
    /// The peer already claimed the pair's record and is offering to us
    PeerIsOffering,
}

#[derive(Default)]
struct Negotiation {
    local_description: bool,
    remote_description: Option<SessionDescription>,
    /// Remote candidates received before the remote description
    pending: Vec<IceCandidate>,
}

/// One peer connection bound to one negotiation record
pub struct TransportSession {
    record: NegotiationRecordRef,
    offer_user: String,
    answer_user: String,
    role: SessionRole,
    transport: Arc<dyn PeerTransport>,
    local_stream: MediaStream,
    remote_stream: MediaStream,
    negotiation: Mutex<Negotiation>,
    released: Arc<AtomicBool>,
    transport_closed: AtomicBool,
    candidate_pump: Mutex<Option<JoinHandle<()>>>,
}

impl TransportSession {
    /// Offer a connection to `peer_uid`
    ///
    /// Acquires a capture stream, claims the pair's negotiation record,
    /// creates and commits an offer and writes it to the record. Locally
    /// gathered candidates are published to the offer candidate set. If
    /// the peer holds the record as offerer, nothing is created and the
    /// caller should wait for that offer instead.
    #[instrument(skip(ctx, records), fields(self_uid = %ctx.self_uid))]
    pub async fn offer(
        ctx: &SessionContext,
        records: &RecordCollection,
        peer_uid: &str,
    ) -> Result<OfferOutcome> {
        let pending = Unclaimed::new(ctx.devices.acquire_audio_stream().await?);
        let record = records.record_for(&ctx.self_uid, peer_uid);

        if !claim_record(&ctx.self_uid, &record, peer_uid).await? {
            info!("Peer {} is already offering on {}", peer_uid, record.id());
            return Ok(OfferOutcome::PeerIsOffering);
        }

        let session = match Self::start(
            ctx,
            record.clone(),
            SessionRole::Offerer,
            &ctx.self_uid,
            peer_uid,
            pending,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                discard_record(&record).await;
                return Err(e);
            }
        };

        let negotiated = async {
            let offer = session.transport.create_offer().await?;
            session.negotiation.lock().local_description = true;
            record.write_offer(&offer).await
        }
        .await;

        if let Err(e) = negotiated {
            session.close().await;
            discard_record(&record).await;
            return Err(e);
        }

        info!("Offered to {} on {}", peer_uid, record.id());
        Ok(OfferOutcome::Created(session))
    }

    /// Answer an inbound offer
    ///
    /// Returns `Ok(None)` when the record is not awaiting an answer from us.
    #[instrument(skip(ctx, records, record), fields(self_uid = %ctx.self_uid, record = %record.id()))]
    pub async fn answer(
        ctx: &SessionContext,
        records: &RecordCollection,
        record: NegotiationRecord,
    ) -> Result<Option<Self>> {
        if !record.awaiting_answer_from(&ctx.self_uid) {
            return Ok(None);
        }
        let Some(offer) = record.offer.clone() else {
            return Ok(None);
        };

        let pending = Unclaimed::new(ctx.devices.acquire_audio_stream().await?);
        let reference = records.reference(record.path.clone());

        let session = Self::start(
            ctx,
            reference.clone(),
            SessionRole::Answerer,
            &record.offer_user,
            &ctx.self_uid,
            pending,
        )
        .await?;

        let negotiated = async {
            session.apply_remote_description(offer).await?;
            let answer = session.transport.create_answer().await?;
            session.negotiation.lock().local_description = true;
            reference.write_answer(&answer).await
        }
        .await;

        if let Err(e) = negotiated {
            session.close().await;
            return Err(e);
        }

        info!("Answered {} on {}", record.offer_user, reference.id());
        Ok(Some(session))
    }

    /// Open a transport and wire its media and candidate callbacks
    ///
    /// Until the session exists, `pending` owns the capture stream and the
    /// transport, so cancelling this future releases both.
    async fn start(
        ctx: &SessionContext,
        record: NegotiationRecordRef,
        role: SessionRole,
        offer_user: &str,
        answer_user: &str,
        mut pending: Unclaimed,
    ) -> Result<Self> {
        let transport = ctx.connector.open(&ctx.ice).await?;
        pending.transport = Some(Arc::clone(&transport));
        let released = Arc::new(AtomicBool::new(false));
        let remote_stream = MediaStream::new();

        let remote = remote_stream.clone();
        let remote_released = Arc::clone(&released);
        transport.on_remote_track(Box::new(move |track| {
            if remote_released.load(Ordering::Acquire) {
                track.stop();
            } else {
                remote.add_track(track);
            }
        }));

        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel::<IceCandidate>();
        transport.on_local_candidate(Box::new(move |candidate| {
            // Receiver is gone once the session is released
            let _ = candidate_tx.send(candidate);
        }));

        let pump_record = record.clone();
        let pump_released = Arc::clone(&released);
        let candidate_pump = tokio::spawn(async move {
            while let Some(candidate) = candidate_rx.recv().await {
                if pump_released.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = pump_record.publish_candidate(role, &candidate).await {
                    warn!("Failed to publish ICE candidate on {}: {}", pump_record.id(), e);
                }
            }
        });

        let local_stream = pending.hand_over();
        let session = Self {
            record,
            offer_user: offer_user.to_string(),
            answer_user: answer_user.to_string(),
            role,
            transport,
            local_stream,
            remote_stream,
            negotiation: Mutex::new(Negotiation::default()),
            released,
            transport_closed: AtomicBool::new(false),
            candidate_pump: Mutex::new(Some(candidate_pump)),
        };

        if let Err(e) = session.transport.add_local_stream(&session.local_stream).await {
            session.close().await;
            return Err(e);
        }

        debug!(
            "Session {} started as {:?} on transport {}",
            session.record.id(),
            role,
            session.transport.id()
        );
        Ok(session)
    }

    /// Apply the remote description, then flush buffered candidates
    pub async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.is_released() {
            debug!("Ignoring remote description for released session {}", self.record.id());
            return Ok(());
        }

        self.transport
            .set_remote_description(description.clone())
            .await?;

        let pending = {
            let mut negotiation = self.negotiation.lock();
            negotiation.remote_description = Some(description);
            std::mem::take(&mut negotiation.pending)
        };

        if !pending.is_empty() {
            debug!(
                "Flushing {} buffered candidates on {}",
                pending.len(),
                self.record.id()
            );
        }
        for candidate in pending {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Failed to apply buffered candidate on {}: {}", self.record.id(), e);
            }
        }

        Ok(())
    }

    /// Add a remote ICE candidate, buffering it until the remote description is set
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.is_released() || candidate.candidate.is_empty() {
            return Ok(());
        }

        {
            let mut negotiation = self.negotiation.lock();
            if negotiation.remote_description.is_none() {
                debug!("Buffering early candidate on {}", self.record.id());
                negotiation.pending.push(candidate);
                return Ok(());
            }
        }

        self.transport.add_ice_candidate(candidate).await
    }

    /// Stop both streams and silence the candidate pump
    ///
    /// Returns `true` only for the call that performed the release.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        let stopped = self.local_stream.stop_all() + self.remote_stream.stop_all();
        if let Some(pump) = self.candidate_pump.lock().take() {
            pump.abort();
        }
        self.negotiation.lock().pending.clear();

        debug!(
            "Released session {} ({} tracks stopped)",
            self.record.id(),
            stopped
        );
        true
    }

    /// Release and close the transport; safe on partially negotiated sessions
    pub async fn close(&self) {
        self.release();
        if self.transport_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close transport for {}: {}", self.record.id(), e);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        if self.is_released() {
            return SessionLifecycle::Closed;
        }
        match self.transport.state() {
            TransportState::Connected => SessionLifecycle::Connected,
            TransportState::Failed | TransportState::Closed => SessionLifecycle::Closed,
            _ => {
                let negotiation = self.negotiation.lock();
                if negotiation.local_description || negotiation.remote_description.is_some() {
                    SessionLifecycle::Negotiating
                } else {
                    SessionLifecycle::Open
                }
            }
        }
    }

    pub fn record(&self) -> &NegotiationRecordRef {
        &self.record
    }

    pub fn record_id(&self) -> &str {
        self.record.id()
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn offer_user(&self) -> &str {
        &self.offer_user
    }

    pub fn answer_user(&self) -> &str {
        &self.answer_user
    }

    /// The other party of this session
    pub fn peer_uid(&self) -> &str {
        match self.role {
            SessionRole::Offerer => &self.answer_user,
            SessionRole::Answerer => &self.offer_user,
        }
    }

    /// The party opposite `self_uid`: the offerer when `self_uid` answered, and vice versa
    pub fn remote_party(&self, self_uid: &str) -> &str {
        if self.answer_user == self_uid {
            &self.offer_user
        } else {
            &self.answer_user
        }
    }

    pub fn has_remote_description(&self) -> bool {
        self.negotiation.lock().remote_description.is_some()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.negotiation.lock().remote_description.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.negotiation.lock().pending.len()
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.local_stream
    }

    pub fn remote_stream(&self) -> &MediaStream {
        &self.remote_stream
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// RMS of the latest local capture frame
    pub fn local_audio_level(&self) -> Option<f64> {
        self.local_stream.first_track()?.analysis_rms()
    }

    pub async fn inbound_audio_level(&self) -> Option<f64> {
        if self.is_released() {
            return None;
        }
        self.transport.inbound_audio_level().await
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            record_id: self.record.id().to_string(),
            peer_uid: self.peer_uid().to_string(),
            role: self.role,
            lifecycle: self.lifecycle(),
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.release();
        if self.transport_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = transport.close().await;
            });
        }
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("record", &self.record.id())
            .field("role", &self.role)
            .field("peer", &self.peer_uid())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Capture stream and transport acquired for a session that does not
/// exist yet; dropped unclaimed, the stream is stopped and the transport
/// closed
struct Unclaimed {
    local_stream: Option<MediaStream>,
    transport: Option<Arc<dyn PeerTransport>>,
}

impl Unclaimed {
    fn new(local_stream: MediaStream) -> Self {
        Self {
            local_stream: Some(local_stream),
            transport: None,
        }
    }

    /// Give the stream to a session; the transport moves with it
    fn hand_over(&mut self) -> MediaStream {
        self.transport = None;
        self.local_stream.take().unwrap_or_default()
    }
}

impl Drop for Unclaimed {
    fn drop(&mut self) {
        if let Some(stream) = self.local_stream.take() {
            let stopped = stream.stop_all();
            debug!("Stopped {} tracks of an unclaimed capture stream", stopped);
        }
        if let Some(transport) = self.transport.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = transport.close().await;
                });
            }
        }
    }
}

/// Claim the pair's record, replacing one left behind by an earlier session
async fn claim_record(self_uid: &str, record: &NegotiationRecordRef, peer_uid: &str) -> Result<bool> {
    if record.claim(self_uid, peer_uid).await? {
        return Ok(true);
    }

    match record.read().await {
        Ok(Some(existing)) if existing.offer_user == peer_uid && existing.answer.is_none() => {
            return Ok(false);
        }
        Ok(_) | Err(Error::InvalidRecord(_)) => {
            warn!("Replacing stale negotiation record {}", record.id());
        }
        Err(e) => return Err(e),
    }

    record.purge().await?;
    record.claim(self_uid, peer_uid).await
}

/// Best-effort removal of a record this side created
async fn discard_record(record: &NegotiationRecordRef) {
    if let Err(e) = record.purge().await {
        warn!("Failed to discard negotiation record {}: {}", record.id(), e);
    }
}
