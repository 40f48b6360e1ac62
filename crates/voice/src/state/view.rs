//! Read-only snapshot for rendering

use crate::channel::ChannelRef;
use crate::membership::VoiceUser;
use crate::transport::SessionInfo;
use serde::Serialize;
use std::collections::BTreeSet;

/// Coarse engine phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
}

/// What the UI renders: channel, members, sessions and who is speaking
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsView {
    pub phase: ConnectionPhase,
    pub channel: Option<ChannelRef>,
    /// Other members present in the channel
    pub members: Vec<VoiceUser>,
    pub sessions: Vec<SessionInfo>,
    pub speaking: BTreeSet<String>,
    pub muted: bool,
}

impl ConnectionsView {
    pub fn is_joined(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    pub fn is_speaking(&self, uid: &str) -> bool {
        self.speaking.contains(uid)
    }

    pub fn session_for(&self, peer_uid: &str) -> Option<&SessionInfo> {
        self.sessions.iter().find(|s| s.peer_uid == peer_uid)
    }

    /// Peer uids with a session, sorted
    pub fn peers(&self) -> Vec<&str> {
        let mut peers: Vec<&str> = self.sessions.iter().map(|s| s.peer_uid.as_str()).collect();
        peers.sort_unstable();
        peers
    }
}
