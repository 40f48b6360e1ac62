//! Speaking-activity monitor
//!
//! Best-effort highlighting only. Self is speaking when the RMS of the
//! latest local capture frame crosses the outgoing threshold; a peer is
//! speaking when the inbound level on its session crosses the incoming
//! threshold. Missing levels skip that session for the tick.

use crate::config::SpeakingConfig;
use crate::transport::TransportSession;
use std::collections::BTreeSet;
use tracing::trace;

pub struct SpeakingMonitor {
    config: SpeakingConfig,
    self_speaking: bool,
    peers: BTreeSet<String>,
}

impl SpeakingMonitor {
    pub fn new(config: SpeakingConfig) -> Self {
        Self {
            config,
            self_speaking: false,
            peers: BTreeSet::new(),
        }
    }

    /// Take one sample; returns `true` when the speaking set changed
    pub async fn sample(&mut self, self_uid: &str, sessions: &[TransportSession]) -> bool {
        let before = self.speaking(self_uid);

        // Fewer sessions than speakers means someone left; start over
        if sessions.len() < self.peers.len() {
            self.peers.clear();
        }

        self.self_speaking = sessions
            .first()
            .and_then(TransportSession::local_audio_level)
            .is_some_and(|rms| rms > self.config.outgoing_rms_threshold);

        for session in sessions {
            let uid = session.remote_party(self_uid);
            match session.inbound_audio_level().await {
                Some(level) if level > self.config.incoming_level_threshold => {
                    self.peers.insert(uid.to_string());
                }
                level => {
                    if self.peers.remove(uid) {
                        trace!("{} stopped speaking (level {:?})", uid, level);
                    }
                }
            }
        }

        self.speaking(self_uid) != before
    }

    /// Everyone currently speaking, self included
    pub fn speaking(&self, self_uid: &str) -> BTreeSet<String> {
        let mut speaking = self.peers.clone();
        if self.self_speaking {
            speaking.insert(self_uid.to_string());
        }
        speaking
    }

    pub fn reset(&mut self) {
        self.self_speaking = false;
        self.peers.clear();
    }
}
