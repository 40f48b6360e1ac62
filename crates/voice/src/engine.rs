//! Voice engine
//!
//! One actor task owns the [`ConnectionsState`] and processes, strictly in
//! sequence, commands from [`VoiceClient`], signaling events from the store
//! watchers, completed answer negotiations and the speaking-monitor tick.
//! The read-only [`ConnectionsView`] is published on a `watch` channel.
//!
//! Answering runs in spawned tasks so a slow capture device never blocks
//! the loop; their results come back through a per-channel queue and are
//! discarded once that channel is left.

use crate::channel::{validate_identifier, ChannelRef};
use crate::config::VoiceMeshConfig;
use crate::media::MediaDevices;
use crate::membership::{MembershipTracker, VoiceUser};
use crate::signaling::{CandidateWatch, ChannelWatchers, NegotiationRecord, RecordCollection, SignalEvent};
use crate::speaking::SpeakingMonitor;
use crate::state::{reduce, ConnectionAction, ConnectionPhase, ConnectionsState, ConnectionsView};
use crate::transport::session::SessionContext;
use crate::transport::{OfferOutcome, PeerConnector, SessionRole, TransportSession};
use crate::{Error, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use signaling_store::SignalingStore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

enum Command {
    Join {
        server_id: String,
        channel_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<Result<()>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a running voice engine
///
/// Must be created inside a tokio runtime. Dropping the handle stops the
/// engine after a best-effort leave.
pub struct VoiceClient {
    user: VoiceUser,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ConnectionsView>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceClient {
    pub fn spawn(
        config: VoiceMeshConfig,
        user: VoiceUser,
        store: Arc<dyn SignalingStore>,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self> {
        config.validate()?;
        validate_identifier("uid", &user.uid)?;

        let (commands, command_rx) = mpsc::channel(config.command_buffer);
        let (view_tx, view) = watch::channel(ConnectionsView::default());

        let ctx = Arc::new(SessionContext {
            store,
            connector,
            devices,
            ice: config.ice.clone(),
            self_uid: user.uid.clone(),
        });
        let engine = Engine {
            speaking: SpeakingMonitor::new(config.speaking.clone()),
            config,
            user: user.clone(),
            ctx,
            state: ConnectionsState::new(),
            active: None,
            joining: None,
            phase: ConnectionPhase::Idle,
            muted: false,
            view: view_tx,
        };

        let task = tokio::spawn(engine.run(command_rx));
        info!("Voice engine started for {}", user.uid);

        Ok(Self {
            user,
            commands,
            view,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn user(&self) -> &VoiceUser {
        &self.user
    }

    /// Join a voice channel, leaving the current one first
    pub async fn join_voice_channel(&self, server_id: &str, channel_id: &str) -> Result<()> {
        self.request(|reply| Command::Join {
            server_id: server_id.to_string(),
            channel_id: channel_id.to_string(),
            reply,
        })
        .await
    }

    /// Leave the current voice channel; a no-op when not joined
    pub async fn leave_voice_channel(&self) -> Result<()> {
        self.request(|reply| Command::Leave { reply }).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.request(|reply| Command::SetMuted { muted, reply }).await
    }

    /// Current snapshot
    pub fn view(&self) -> ConnectionsView {
        self.view.borrow().clone()
    }

    /// Change feed of snapshots
    pub fn subscribe(&self) -> watch::Receiver<ConnectionsView> {
        self.view.clone()
    }

    /// Leave if joined and stop the engine task
    pub async fn shutdown(&self) -> Result<()> {
        let result = match self.request(|reply| Command::Shutdown { reply }).await {
            Err(Error::EngineStopped) => Ok(()),
            other => other,
        };

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Voice engine task ended abnormally: {}", e);
            }
        }
        result
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::EngineStopped)?;
        response.await.map_err(|_| Error::EngineStopped)?
    }
}

/// Result of a spawned answer negotiation
struct AnswerOutcome {
    record_id: String,
    peer_uid: String,
    result: Result<Option<TransportSession>>,
}

/// Everything scoped to the joined channel
struct ActiveChannel {
    channel: ChannelRef,
    records: RecordCollection,
    membership: MembershipTracker,
    members: BTreeMap<String, VoiceUser>,
    watchers: ChannelWatchers,
    candidate_watches: HashMap<String, CandidateWatch>,
    event_tx: mpsc::UnboundedSender<SignalEvent>,
    events: mpsc::UnboundedReceiver<SignalEvent>,
    answer_tx: mpsc::UnboundedSender<AnswerOutcome>,
    answers: mpsc::UnboundedReceiver<AnswerOutcome>,
    pending_answers: HashMap<String, JoinHandle<()>>,
    /// Peers that left while an answer to them was in flight
    departed: HashSet<String>,
    ticker: Interval,
}

enum Activity {
    Signal(SignalEvent),
    Answered(AnswerOutcome),
    Tick,
}

enum Flow {
    Continue,
    Stop,
}

async fn next_activity(active: &mut Option<ActiveChannel>) -> Activity {
    let Some(active) = active.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        Some(event) = active.events.recv() => Activity::Signal(event),
        Some(outcome) = active.answers.recv() => Activity::Answered(outcome),
        _ = active.ticker.tick() => Activity::Tick,
    }
}

struct Engine {
    config: VoiceMeshConfig,
    user: VoiceUser,
    ctx: Arc<SessionContext>,
    state: ConnectionsState,
    active: Option<ActiveChannel>,
    joining: Option<ChannelRef>,
    phase: ConnectionPhase,
    speaking: SpeakingMonitor,
    muted: bool,
    view: watch::Sender<ConnectionsView>,
}

impl Engine {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Voice client handle dropped");
                        if let Err(e) = self.leave().await {
                            warn!("Leave on shutdown incomplete: {}", e);
                        }
                        Flow::Stop
                    }
                },
                activity = next_activity(&mut self.active) => self.handle_activity(activity).await,
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        self.publish_view();
        info!("Voice engine for {} stopped", self.user.uid);
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Join {
                server_id,
                channel_id,
                reply,
            } => {
                let result = self.join(&server_id, &channel_id).await;
                let flow = self.check_fatal(&result).await;
                let _ = reply.send(result);
                flow
            }
            Command::Leave { reply } => {
                let _ = reply.send(self.leave().await);
                Flow::Continue
            }
            Command::SetMuted { muted, reply } => {
                self.set_muted(muted);
                let _ = reply.send(Ok(()));
                Flow::Continue
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.leave().await);
                Flow::Stop
            }
        }
    }

    async fn handle_activity(&mut self, activity: Activity) -> Flow {
        let result = match activity {
            Activity::Signal(event) => self.handle_signal(event).await,
            Activity::Answered(outcome) => self.handle_answered(outcome).await,
            Activity::Tick => {
                self.speaking.sample(&self.user.uid, self.state.sessions()).await;
                self.publish_view();
                Ok(())
            }
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(e) if e.is_fatal() => self.check_fatal(&Err(e)).await,
            Err(e) => {
                warn!("Signal handling failed: {}", e);
                Flow::Continue
            }
        }
    }

    /// Tear everything down after a reducer defect
    async fn check_fatal(&mut self, result: &Result<()>) -> Flow {
        match result {
            Err(e) if e.is_fatal() => {
                error!("Stopping voice engine: {}", e);
                if let Err(e) = self.leave().await {
                    warn!("Teardown after fatal error incomplete: {}", e);
                }
                Flow::Stop
            }
            _ => Flow::Continue,
        }
    }

    fn dispatch(&mut self, action: ConnectionAction) -> Result<Vec<TransportSession>> {
        let kind = action.kind();
        let transition = reduce(&mut self.state, action)?;
        debug!(
            "{} applied, {} sessions, {} released",
            kind,
            self.state.sessions().len(),
            transition.released.len()
        );
        Ok(transition.released)
    }

    #[instrument(skip(self), fields(uid = %self.user.uid))]
    async fn join(&mut self, server_id: &str, channel_id: &str) -> Result<()> {
        let channel = ChannelRef::new(server_id, channel_id)?;

        if let Some(active) = &self.active {
            if active.channel == channel {
                debug!("Already in {}", channel);
                return Ok(());
            }
            if let Err(e) = self.leave().await {
                warn!("Leaving previous channel incomplete: {}", e);
            }
        }

        self.phase = ConnectionPhase::Connecting;
        self.joining = Some(channel.clone());
        self.publish_view();

        let result = self.connect(channel.clone()).await;
        self.joining = None;
        match &result {
            Ok(()) => {
                self.phase = ConnectionPhase::Connected;
                info!("Joined voice channel {}", channel);
            }
            Err(e) => {
                if self.active.is_none() {
                    self.phase = ConnectionPhase::Idle;
                }
                warn!("Failed to join voice channel {}: {}", channel, e);
            }
        }
        self.publish_view();
        result
    }

    async fn connect(&mut self, channel: ChannelRef) -> Result<()> {
        let store = Arc::clone(&self.ctx.store);
        let records = RecordCollection::new(Arc::clone(&store), &channel);
        let membership =
            MembershipTracker::new(store, channel.clone(), self.config.roster_write_retries);

        let (event_tx, events) = mpsc::unbounded_channel();
        let watchers =
            ChannelWatchers::start(&records, &membership, &self.user.uid, event_tx.clone()).await?;

        let peers = membership.join(&self.user).await?;
        if peers.len() >= self.config.channel_capacity {
            drop(watchers);
            if let Err(e) = membership.leave(&self.user).await {
                warn!("Failed to withdraw from full channel {}: {}", channel, e);
            }
            return Err(Error::ChannelFull {
                channel: channel.to_string(),
                capacity: self.config.channel_capacity,
            });
        }

        let ctx = Arc::clone(&self.ctx);
        let outcomes = join_all(
            peers
                .iter()
                .map(|peer| TransportSession::offer(&ctx, &records, &peer.uid)),
        )
        .await;

        let mut sessions = Vec::new();
        let mut failure = None;
        for (peer, outcome) in peers.iter().zip(outcomes) {
            match outcome {
                Ok(OfferOutcome::Created(session)) => sessions.push(session),
                Ok(OfferOutcome::PeerIsOffering) => {
                    debug!("Waiting for offer from {}", peer.uid);
                }
                Err(e) => {
                    warn!("Offer to {} failed: {}", peer.uid, e);
                    failure.get_or_insert(e);
                }
            }
        }

        let mut candidate_watches = HashMap::new();
        if failure.is_none() {
            for session in &sessions {
                match CandidateWatch::start(session.record(), SessionRole::Offerer, event_tx.clone())
                    .await
                {
                    Ok(watch) => {
                        candidate_watches.insert(session.record_id().to_string(), watch);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(e) = failure {
            drop(watchers);
            drop(candidate_watches);
            for session in &sessions {
                session.close().await;
                if let Err(e) = session.record().purge().await {
                    warn!("Failed to remove record {}: {}", session.record_id(), e);
                }
            }
            if let Err(e) = membership.leave(&self.user).await {
                warn!("Failed to leave roster of {}: {}", channel, e);
            }
            return Err(e);
        }

        for session in &sessions {
            session.local_stream().set_enabled(!self.muted);
        }

        let action = if sessions.is_empty() {
            ConnectionAction::ConnectInitial {
                channel: channel.clone(),
                records: records.clone(),
            }
        } else {
            ConnectionAction::ConnectSelf {
                channel: channel.clone(),
                records: records.clone(),
                sessions,
            }
        };

        let mut ticker = interval(Duration::from_millis(self.config.speaking.sample_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (answer_tx, answers) = mpsc::unbounded_channel();
        self.active = Some(ActiveChannel {
            channel,
            records,
            membership,
            members: peers.into_iter().map(|p| (p.uid.clone(), p)).collect(),
            watchers,
            candidate_watches,
            event_tx,
            events,
            answer_tx,
            answers,
            pending_answers: HashMap::new(),
            departed: HashSet::new(),
            ticker,
        });

        // A defect here is fatal; the caller tears the channel down
        self.dispatch(action)?;
        Ok(())
    }

    async fn handle_signal(&mut self, event: SignalEvent) -> Result<()> {
        match event {
            SignalEvent::OfferReceived(record) => self.handle_offer(record).await,
            SignalEvent::AnswerReceived { record_id, answer } => {
                let Some(session) = self.state.session_for_record(&record_id) else {
                    debug!("Answer for unknown record {}", record_id);
                    return Ok(());
                };
                if session.role() != SessionRole::Offerer || session.has_remote_description() {
                    return Ok(());
                }
                if let Err(e) = session.apply_remote_description(answer).await {
                    warn!("Failed to apply answer on {}: {}", record_id, e);
                }
                self.publish_view();
                Ok(())
            }
            SignalEvent::CandidateReceived {
                record_id,
                candidate,
            } => {
                if let Some(session) = self.state.session_for_record(&record_id) {
                    if let Err(e) = session.add_remote_candidate(candidate).await {
                        debug!("Dropped candidate on {}: {}", record_id, e);
                    }
                }
                Ok(())
            }
            SignalEvent::MemberJoined(user) => {
                if let Some(active) = self.active.as_mut() {
                    active.departed.remove(&user.uid);
                    active.members.insert(user.uid.clone(), user);
                }
                self.publish_view();
                Ok(())
            }
            SignalEvent::MemberLeft(uid) => {
                if let Some(active) = self.active.as_mut() {
                    active.members.remove(&uid);
                    active.departed.insert(uid.clone());
                }
                self.disconnect_peers(vec![uid]).await?;
                self.publish_view();
                Ok(())
            }
        }
    }

    async fn handle_offer(&mut self, record: NegotiationRecord) -> Result<()> {
        let record_id = record.id().to_string();
        let peer_uid = record.offer_user.clone();

        {
            let Some(active) = self.active.as_mut() else {
                return Ok(());
            };
            if active.pending_answers.contains_key(&record_id) {
                debug!("Already answering {}", record_id);
                return Ok(());
            }
            active.departed.remove(&peer_uid);
        }

        if let Some(existing) = self.state.session_for_peer(&peer_uid) {
            if existing.record_id() == record_id
                && existing.remote_description().as_ref() == record.offer.as_ref()
            {
                return Ok(());
            }
            info!("{} sent a new offer, replacing its session", peer_uid);
            self.disconnect_peers(vec![peer_uid.clone()]).await?;
        }

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let ctx = Arc::clone(&self.ctx);
        let records = active.records.clone();
        let answers = active.answer_tx.clone();
        let task_record = record_id.clone();
        let handle = tokio::spawn(async move {
            let result = TransportSession::answer(&ctx, &records, record).await;
            // Receiver is gone once the channel was left; the session drops and releases
            let _ = answers.send(AnswerOutcome {
                record_id: task_record,
                peer_uid,
                result,
            });
        });
        active.pending_answers.insert(record_id, handle);
        Ok(())
    }

    async fn handle_answered(&mut self, outcome: AnswerOutcome) -> Result<()> {
        let AnswerOutcome {
            record_id,
            peer_uid,
            result,
        } = outcome;

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        active.pending_answers.remove(&record_id);

        let session = match result {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Failed to answer {} on {}: {}", peer_uid, record_id, e);
                return Ok(());
            }
        };

        if active.departed.contains(&peer_uid) {
            info!("{} left before the answer completed", peer_uid);
            session.close().await;
            return Ok(());
        }

        let watch =
            match CandidateWatch::start(session.record(), SessionRole::Answerer, active.event_tx.clone())
                .await
            {
                Ok(watch) => watch,
                Err(e) => {
                    warn!("Failed to watch candidates on {}: {}", record_id, e);
                    session.close().await;
                    return Ok(());
                }
            };

        if self.state.session_for_peer(&peer_uid).is_some()
            || self.state.session_for_record(&record_id).is_some()
        {
            self.disconnect_peers(vec![peer_uid.clone()]).await?;
        }

        session.local_stream().set_enabled(!self.muted);
        self.dispatch(ConnectionAction::ConnectOther { session })?;
        if let Some(active) = self.active.as_mut() {
            active.candidate_watches.insert(record_id, watch);
        }
        self.publish_view();
        Ok(())
    }

    async fn disconnect_peers(&mut self, users: Vec<String>) -> Result<()> {
        let released = self.dispatch(ConnectionAction::DisconnectOther { users })?;
        for session in released {
            if let Some(active) = self.active.as_mut() {
                active.candidate_watches.remove(session.record_id());
            }
            session.close().await;
        }
        Ok(())
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        for session in self.state.sessions() {
            session.local_stream().set_enabled(!muted);
        }
        info!("{} {}", self.user.uid, if muted { "muted" } else { "unmuted" });
        self.publish_view();
    }

    /// Leave the current channel
    ///
    /// Local state is always cleared. Remote cleanup is best-effort: every
    /// step runs, and any failure is reported at the end.
    #[instrument(skip(self), fields(uid = %self.user.uid))]
    async fn leave(&mut self) -> Result<()> {
        let Some(mut active) = self.active.take() else {
            // Nothing joined; still make sure no session survives
            for session in self.dispatch(ConnectionAction::DisconnectSelf)? {
                session.close().await;
            }
            return Ok(());
        };

        let mut failures = Vec::new();
        active.watchers.stop();
        active.candidate_watches.clear();

        // Capture may never resolve; cancelled answers release what they hold
        for (record_id, handle) in active.pending_answers.drain() {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!("Cancelled answer on {}", record_id),
                Err(e) => warn!("Answer task for {} ended abnormally: {}", record_id, e),
            }
        }
        active.answers.close();
        while let Ok(outcome) = active.answers.try_recv() {
            if let Ok(Some(session)) = outcome.result {
                session.close().await;
            }
        }

        for session in self.dispatch(ConnectionAction::DisconnectSelf)? {
            session.close().await;
        }

        match active.records.involving(&self.user.uid).await {
            Ok(records) => {
                for record in records {
                    if let Err(e) = record.purge().await {
                        failures.push(e.to_string());
                    }
                }
            }
            Err(e) => failures.push(e.to_string()),
        }

        if let Err(e) = active.membership.leave(&self.user).await {
            failures.push(e.to_string());
        }

        self.speaking.reset();
        self.phase = ConnectionPhase::Idle;
        self.publish_view();

        if failures.is_empty() {
            info!("Left voice channel {}", active.channel);
            Ok(())
        } else {
            warn!(
                "Left voice channel {} with {} cleanup failures",
                active.channel,
                failures.len()
            );
            Err(Error::Disconnect(failures.join("; ")))
        }
    }

    fn publish_view(&self) {
        let channel = self
            .active
            .as_ref()
            .map(|a| a.channel.clone())
            .or_else(|| self.joining.clone());
        let members: Vec<VoiceUser> = self
            .active
            .as_ref()
            .map(|a| a.members.values().cloned().collect())
            .unwrap_or_default();

        let view = ConnectionsView {
            phase: self.phase,
            channel,
            members,
            sessions: self.state.session_infos(),
            speaking: self.speaking.speaking(&self.user.uid),
            muted: self.muted,
        };

        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
