//! Connection-state reducer
//!
//! [`ConnectionsState`] is the single source of truth for which sessions
//! exist. It changes only through [`reduce`], which applies one
//! [`ConnectionAction`] and hands back every session it removed. Removed
//! sessions are already released (streams stopped); closing their
//! transports is left to the caller because it suspends.

pub mod view;

use crate::channel::ChannelRef;
use crate::signaling::RecordCollection;
use crate::transport::{SessionInfo, SessionRole, TransportSession};
use crate::{Error, Result};
use std::collections::HashSet;
use tracing::{debug, info};

pub use view::{ConnectionPhase, ConnectionsView};

/// Channel the state is bound to while joined
pub struct ChannelBinding {
    pub channel: ChannelRef,
    pub records: RecordCollection,
}

/// Sessions of the current voice channel
#[derive(Default)]
pub struct ConnectionsState {
    binding: Option<ChannelBinding>,
    sessions: Vec<TransportSession>,
}

/// The five ways the state may change
pub enum ConnectionAction {
    /// Joined a channel with nobody else present
    ConnectInitial {
        channel: ChannelRef,
        records: RecordCollection,
    },
    /// Joined a channel and offered to everyone already present
    ConnectSelf {
        channel: ChannelRef,
        records: RecordCollection,
        sessions: Vec<TransportSession>,
    },
    /// Answered an inbound offer
    ConnectOther { session: TransportSession },
    /// Peers left the channel
    DisconnectOther { users: Vec<String> },
    /// Local leave
    DisconnectSelf,
}

impl ConnectionAction {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionAction::ConnectInitial { .. } => "CONNECT_INITIAL",
            ConnectionAction::ConnectSelf { .. } => "CONNECT_SELF",
            ConnectionAction::ConnectOther { .. } => "CONNECT_OTHER",
            ConnectionAction::DisconnectOther { .. } => "DISCONNECT_OTHER",
            ConnectionAction::DisconnectSelf => "DISCONNECT_SELF",
        }
    }
}

/// Sessions removed by one reduction
#[derive(Debug, Default)]
pub struct Transition {
    pub released: Vec<TransportSession>,
}

impl ConnectionsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.binding.is_none()
    }

    pub fn channel(&self) -> Option<&ChannelRef> {
        self.binding.as_ref().map(|b| &b.channel)
    }

    pub fn records(&self) -> Option<&RecordCollection> {
        self.binding.as_ref().map(|b| &b.records)
    }

    pub fn sessions(&self) -> &[TransportSession] {
        &self.sessions
    }

    pub fn session_for_record(&self, record_id: &str) -> Option<&TransportSession> {
        self.sessions.iter().find(|s| s.record_id() == record_id)
    }

    pub fn session_for_peer(&self, uid: &str) -> Option<&TransportSession> {
        self.sessions.iter().find(|s| s.peer_uid() == uid)
    }

    pub fn session_infos(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(TransportSession::info).collect()
    }

    fn check_unique(&self, session: &TransportSession) -> Result<()> {
        if self.session_for_record(session.record_id()).is_some() {
            return Err(Error::StateConsistency(format!(
                "second session for negotiation record {}",
                session.record_id()
            )));
        }
        if self.session_for_peer(session.peer_uid()).is_some() {
            return Err(Error::StateConsistency(format!(
                "second session for peer {}",
                session.peer_uid()
            )));
        }
        Ok(())
    }
}

fn require_idle(state: &ConnectionsState, kind: &str) -> Result<()> {
    match state.channel() {
        None => Ok(()),
        Some(channel) => Err(Error::StateConsistency(format!(
            "{} while already in {}",
            kind, channel
        ))),
    }
}

/// Apply one action
///
/// Actions that are invalid for the current state are defects and fail
/// with [`Error::StateConsistency`]; the state is left unchanged.
pub fn reduce(state: &mut ConnectionsState, action: ConnectionAction) -> Result<Transition> {
    let kind = action.kind();
    debug!("Reducing {}", kind);

    match action {
        ConnectionAction::ConnectInitial { channel, records } => {
            require_idle(state, kind)?;
            info!("Connected to {} with no peers", channel);
            state.binding = Some(ChannelBinding { channel, records });
            Ok(Transition::default())
        }

        ConnectionAction::ConnectSelf {
            channel,
            records,
            sessions,
        } => {
            require_idle(state, kind)?;
            if sessions.is_empty() {
                return Err(Error::StateConsistency(format!(
                    "{} without sessions",
                    kind
                )));
            }

            let mut records_seen = HashSet::new();
            let mut peers_seen = HashSet::new();
            for session in &sessions {
                if session.role() != SessionRole::Offerer {
                    return Err(Error::StateConsistency(format!(
                        "{} with answerer session {}",
                        kind,
                        session.record_id()
                    )));
                }
                if !records_seen.insert(session.record_id())
                    || !peers_seen.insert(session.peer_uid())
                {
                    return Err(Error::StateConsistency(format!(
                        "{} with duplicate session {}",
                        kind,
                        session.record_id()
                    )));
                }
            }

            info!("Connected to {} with {} peers", channel, sessions.len());
            state.binding = Some(ChannelBinding { channel, records });
            state.sessions = sessions;
            Ok(Transition::default())
        }

        ConnectionAction::ConnectOther { session } => {
            if state.is_idle() {
                return Err(Error::StateConsistency(format!(
                    "{} while not in a channel",
                    kind
                )));
            }
            state.check_unique(&session)?;
            info!("Peer {} connected on {}", session.peer_uid(), session.record_id());
            state.sessions.push(session);
            Ok(Transition::default())
        }

        ConnectionAction::DisconnectOther { users } => {
            let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sessions)
                .into_iter()
                .partition(|s| users.iter().any(|uid| uid == s.peer_uid()));
            state.sessions = kept;

            for session in &released {
                session.release();
                info!("Peer {} disconnected from {}", session.peer_uid(), session.record_id());
            }
            Ok(Transition { released })
        }

        ConnectionAction::DisconnectSelf => {
            let released = std::mem::take(&mut state.sessions);
            for session in &released {
                session.release();
            }
            if let Some(binding) = state.binding.take() {
                info!(
                    "Disconnected from {} ({} sessions released)",
                    binding.channel,
                    released.len()
                );
            }
            Ok(Transition { released })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceConfig;
    use crate::media::SyntheticMediaDevices;
    use crate::testing::MockConnector;
    use crate::transport::session::{OfferOutcome, SessionContext};
    use signaling_store::InMemoryStore;
    use std::sync::Arc;

    struct Fixture {
        ctx: SessionContext,
        channel: ChannelRef,
        records: RecordCollection,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let channel = ChannelRef::new("s1", "general").unwrap();
        Fixture {
            records: RecordCollection::new(store.clone(), &channel),
            ctx: SessionContext {
                store,
                connector: Arc::new(MockConnector::new()),
                devices: Arc::new(SyntheticMediaDevices::silent()),
                ice: IceConfig::default(),
                self_uid: "self".to_string(),
            },
            channel,
        }
    }

    async fn offer(fx: &Fixture, peer: &str) -> TransportSession {
        match TransportSession::offer(&fx.ctx, &fx.records, peer).await.unwrap() {
            OfferOutcome::Created(session) => session,
            OfferOutcome::PeerIsOffering => panic!("unexpected tie-break"),
        }
    }

    async fn connected(fx: &Fixture, peers: &[&str]) -> ConnectionsState {
        let mut sessions = Vec::new();
        for peer in peers {
            sessions.push(offer(fx, peer).await);
        }
        let mut state = ConnectionsState::new();
        reduce(
            &mut state,
            ConnectionAction::ConnectSelf {
                channel: fx.channel.clone(),
                records: fx.records.clone(),
                sessions,
            },
        )
        .unwrap();
        state
    }

    #[tokio::test]
    async fn test_connect_initial() {
        let fx = fixture();
        let mut state = ConnectionsState::new();
        assert!(state.is_idle());

        reduce(
            &mut state,
            ConnectionAction::ConnectInitial {
                channel: fx.channel.clone(),
                records: fx.records.clone(),
            },
        )
        .unwrap();
        assert_eq!(state.channel(), Some(&fx.channel));
        assert!(state.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_connect_self_requires_idle() {
        let fx = fixture();
        let mut state = connected(&fx, &["alice"]).await;

        let err = reduce(
            &mut state,
            ConnectionAction::ConnectInitial {
                channel: fx.channel.clone(),
                records: fx.records.clone(),
            },
        )
        .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(state.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_self_rejects_empty() {
        let fx = fixture();
        let mut state = ConnectionsState::new();
        assert!(reduce(
            &mut state,
            ConnectionAction::ConnectSelf {
                channel: fx.channel.clone(),
                records: fx.records.clone(),
                sessions: Vec::new(),
            },
        )
        .is_err());
        assert!(state.is_idle());
    }

    #[tokio::test]
    async fn test_connect_other_rejects_duplicate_peer() {
        let fx = fixture();
        let mut state = connected(&fx, &["alice"]).await;

        let other = RecordCollection::new(fx.ctx.store.clone(), &ChannelRef::new("s1", "other").unwrap());
        let duplicate = match TransportSession::offer(&fx.ctx, &other, "alice").await.unwrap() {
            OfferOutcome::Created(session) => session,
            OfferOutcome::PeerIsOffering => panic!("unexpected tie-break"),
        };
        let stream = duplicate.local_stream().clone();

        let err = reduce(&mut state, ConnectionAction::ConnectOther { session: duplicate }).unwrap_err();
        assert!(matches!(err, Error::StateConsistency(_)));
        assert_eq!(state.sessions().len(), 1);
        // Rejected session was dropped and released
        assert!(stream.all_stopped());
    }

    #[tokio::test]
    async fn test_connect_other_requires_channel() {
        let fx = fixture();
        let session = offer(&fx, "alice").await;
        let mut state = ConnectionsState::new();
        assert!(reduce(&mut state, ConnectionAction::ConnectOther { session }).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_other_keeps_remaining_sessions() {
        let fx = fixture();
        let mut state = connected(&fx, &["alice", "bob", "carol"]).await;
        let alice_stream = state.session_for_peer("alice").unwrap().local_stream().clone();

        let transition = reduce(
            &mut state,
            ConnectionAction::DisconnectOther {
                users: vec!["alice".to_string()],
            },
        )
        .unwrap();

        assert_eq!(transition.released.len(), 1);
        assert_eq!(state.sessions().len(), 2);
        assert!(state.session_for_peer("alice").is_none());
        assert!(alice_stream.all_stopped());
        assert!(!state.session_for_peer("bob").unwrap().is_released());
    }

    #[tokio::test]
    async fn test_disconnect_self_clears_everything() {
        let fx = fixture();
        let mut state = connected(&fx, &["alice", "bob"]).await;
        let streams: Vec<_> = state
            .sessions()
            .iter()
            .flat_map(|s| [s.local_stream().clone(), s.remote_stream().clone()])
            .collect();

        let transition = reduce(&mut state, ConnectionAction::DisconnectSelf).unwrap();
        assert_eq!(transition.released.len(), 2);
        assert!(state.is_idle());
        assert!(state.sessions().is_empty());
        assert!(streams.iter().all(|s| s.all_stopped()));

        // Leaving again is a no-op
        let transition = reduce(&mut state, ConnectionAction::DisconnectSelf).unwrap();
        assert!(transition.released.is_empty());
    }

    #[test]
    fn test_action_kinds() {
        assert_eq!(ConnectionAction::DisconnectSelf.kind(), "DISCONNECT_SELF");
        assert_eq!(
            ConnectionAction::DisconnectOther { users: Vec::new() }.kind(),
            "DISCONNECT_OTHER"
        );
    }
}
